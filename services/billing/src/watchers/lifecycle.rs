//! Machine and container lifecycle notifications.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{Event, EventAction, EventType, Request};
use tracing::debug;

use super::{Dispatch, EventHandler};
use crate::notifier::{Notice, NotifierSet};

/// Notifies the owner about resource state changes.
pub struct LifecycleHandler {
    event_type: EventType,
    notifiers: NotifierSet,
}

impl LifecycleHandler {
    /// Machine events, plus the node `status` feed.
    pub fn machine(notifiers: NotifierSet) -> Self {
        Self {
            event_type: EventType::Machine,
            notifiers,
        }
    }

    pub fn container(notifiers: NotifierSet) -> Self {
        Self {
            event_type: EventType::Container,
            notifiers,
        }
    }
}

#[async_trait]
impl EventHandler for LifecycleHandler {
    fn name(&self) -> &'static str {
        self.event_type.as_str()
    }

    fn request(&self) -> Request {
        match self.event_type {
            EventType::Machine => Request::live([EventType::Machine, EventType::Status]),
            other => Request::live([other]),
        }
    }

    async fn handle(&self, event: &Event) -> Result<Dispatch> {
        match event.action {
            EventAction::Launched
            | EventAction::Running
            | EventAction::Started
            | EventAction::Stopped
            | EventAction::Destroyed
            | EventAction::Failure => {
                self.notifiers.notify(&Notice::from_event(event)).await?;
                Ok(Dispatch::Handled)
            }
            EventAction::Launching | EventAction::Status => {
                debug!(
                    event_type = %event.event_type,
                    action = %event.action,
                    account_id = %event.account_id,
                    "Lifecycle progress"
                );
                Ok(Dispatch::Handled)
            }
            _ => Ok(Dispatch::Ignored),
        }
    }
}
