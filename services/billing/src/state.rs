//! Application state shared across request handlers.

use std::sync::Arc;

use pulse_events::EventManager;

/// Shared application state, handed to handlers through Axum's state
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    events: Arc<EventManager>,
    providers: Vec<&'static str>,
    notifiers: Vec<&'static str>,
}

impl AppState {
    pub fn new(
        events: Arc<EventManager>,
        providers: Vec<&'static str>,
        notifiers: Vec<&'static str>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                events,
                providers,
                notifiers,
            }),
        }
    }

    pub fn events(&self) -> &EventManager {
        &self.inner.events
    }

    /// Names of the enabled billing providers.
    pub fn providers(&self) -> &[&'static str] {
        &self.inner.providers
    }

    /// Names of the configured notice channels.
    pub fn notifiers(&self) -> &[&'static str] {
        &self.inner.notifiers
    }
}
