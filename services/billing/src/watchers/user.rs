//! Account notifications.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{Event, EventAction, EventType, Request};

use super::{Dispatch, EventHandler};
use crate::notifier::{Notice, NotifierSet};

pub struct UserHandler {
    notifiers: NotifierSet,
}

impl UserHandler {
    pub fn new(notifiers: NotifierSet) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl EventHandler for UserHandler {
    fn name(&self) -> &'static str {
        "user"
    }

    fn request(&self) -> Request {
        Request::live([EventType::User])
    }

    async fn handle(&self, event: &Event) -> Result<Dispatch> {
        match event.action {
            EventAction::Onboard
            | EventAction::Reset
            | EventAction::Invite
            | EventAction::Balance => {
                self.notifiers.notify(&Notice::from_event(event)).await?;
                Ok(Dispatch::Handled)
            }
            _ => Ok(Dispatch::Ignored),
        }
    }
}
