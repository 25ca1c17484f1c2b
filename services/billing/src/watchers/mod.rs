//! Event watchers.
//!
//! A [`Watcher`] owns one subscription on the event manager and feeds every
//! event it receives to its [`EventHandler`]. Handler errors are logged and
//! the loop keeps going; only shutdown ends it.

mod addon;
mod bill;
mod lifecycle;
mod user;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{Event, EventAction, EventError, EventManager, Request, Subscription};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub use addon::AddonHandler;
pub use bill::BillHandler;
pub use lifecycle::LifecycleHandler;
pub use user::UserHandler;

/// Whether a handler acted on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Ignored,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// The subscription this handler needs.
    fn request(&self) -> Request;

    async fn handle(&self, event: &Event) -> Result<Dispatch>;
}

/// Callback run after a handler handled an event.
pub type Hook = Arc<dyn Fn(&Event) + Send + Sync>;

/// After-action callbacks by action.
#[derive(Clone, Default)]
pub struct HookTable {
    hooks: HashMap<EventAction, Vec<Hook>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback for `action`.
    pub fn on(&mut self, action: EventAction, hook: Hook) -> &mut Self {
        self.hooks.entry(action).or_default().push(hook);
        self
    }

    pub fn run(&self, event: &Event) -> usize {
        let hooks = self.hooks.get(&event.action).map(Vec::as_slice).unwrap_or(&[]);
        for hook in hooks {
            hook(event);
        }
        hooks.len()
    }
}

pub struct Watcher<H> {
    handler: H,
    hooks: HookTable,
}

impl<H: EventHandler> Watcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            hooks: HookTable::new(),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: HookTable) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// Registers this watcher's subscription.
    pub async fn subscribe(&self, manager: &EventManager) -> Result<Subscription, EventError> {
        manager.watch_events(self.handler.request()).await
    }

    /// Handles one event: the handler first, then the hooks if it was
    /// handled.
    pub async fn dispatch(&self, event: &Event) -> Dispatch {
        match self.handler.handle(event).await {
            Ok(Dispatch::Handled) => {
                let ran = self.hooks.run(event);
                debug!(watcher = self.name(), action = %event.action, hooks = ran, "Event handled");
                Dispatch::Handled
            }
            Ok(Dispatch::Ignored) => {
                debug!(watcher = self.name(), action = %event.action, "Event ignored");
                Dispatch::Ignored
            }
            Err(e) => {
                error!(
                    watcher = self.name(),
                    action = %event.action,
                    account_id = %event.account_id,
                    error = %e,
                    "Event handler failed"
                );
                Dispatch::Ignored
            }
        }
    }

    /// Runs until shutdown or until the subscription closes, then cancels
    /// the subscription. Events still queued at shutdown are dropped.
    pub async fn run(
        self,
        manager: Arc<EventManager>,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let id = subscription.id();
        info!(watcher = self.name(), watch_id = %id, "Starting watcher");

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    match event {
                        Some(event) => {
                            self.dispatch(&event).await;
                        }
                        None => {
                            info!(watcher = self.name(), "Subscription closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(watcher = self.name(), "Watcher shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = manager.stop_watch(id).await {
            debug!(watcher = self.name(), error = %e, "Subscription already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pulse_events::{EventData, EventPayload, EventType};
    use pulse_id::AccountId;

    use super::*;

    struct OnlyOnboard;

    #[async_trait]
    impl EventHandler for OnlyOnboard {
        fn name(&self) -> &'static str {
            "only-onboard"
        }

        fn request(&self) -> Request {
            Request::live([EventType::User])
        }

        async fn handle(&self, event: &Event) -> Result<Dispatch> {
            match event.action {
                EventAction::Onboard => Ok(Dispatch::Handled),
                EventAction::Reset => anyhow::bail!("reset is broken"),
                _ => Ok(Dispatch::Ignored),
            }
        }
    }

    fn event(action: EventAction) -> Event {
        Event::new(
            AccountId::parse("info@example.com").unwrap(),
            EventType::User,
            action,
            EventPayload::Generic(EventData::new()),
        )
    }

    fn counting_hooks(action: EventAction) -> (HookTable, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookTable::new();
        let c = Arc::clone(&count);
        hooks.on(
            action,
            Arc::new(move |_: &Event| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (hooks, count)
    }

    #[tokio::test]
    async fn test_hooks_run_only_after_handled() {
        let (hooks, count) = counting_hooks(EventAction::Onboard);
        let watcher = Watcher::new(OnlyOnboard).with_hooks(hooks);

        assert_eq!(watcher.dispatch(&event(EventAction::Invite)).await, Dispatch::Ignored);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(watcher.dispatch(&event(EventAction::Onboard)).await, Dispatch::Handled);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let manager = Arc::new(EventManager::default());
        let (hooks, count) = counting_hooks(EventAction::Onboard);
        let watcher = Watcher::new(OnlyOnboard).with_hooks(hooks);
        let sub = watcher.subscribe(&manager).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher.run(Arc::clone(&manager), sub, shutdown_rx));

        manager.add_event(event(EventAction::Reset)).await.unwrap();
        manager.add_event(event(EventAction::Onboard)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.subscription_count().await, 0);
    }
}
