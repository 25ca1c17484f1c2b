//! Provisions and removes accounts on the billing providers.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{Event, EventAction, EventType, Request};
use tracing::info;

use super::{Dispatch, EventHandler};
use crate::providers::Providers;

pub struct AddonHandler {
    providers: Providers,
}

impl AddonHandler {
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl EventHandler for AddonHandler {
    fn name(&self) -> &'static str {
        "addon"
    }

    fn request(&self) -> Request {
        Request::live([EventType::User])
    }

    async fn handle(&self, event: &Event) -> Result<Dispatch> {
        if !matches!(event.action, EventAction::Onboard | EventAction::Nuke) {
            return Ok(Dispatch::Ignored);
        }

        let account = event.payload.as_account().ok_or_else(|| {
            anyhow::anyhow!(
                "{} event for {} has no account data",
                event.action,
                event.account_id
            )
        })?;

        if event.action == EventAction::Onboard {
            self.providers
                .for_each("onboard", |p| async move { p.onboard(account).await })
                .await?;
            info!(account_id = %event.account_id, "Account onboarded on billing providers");
        } else {
            self.providers
                .for_each("nuke", |p| async move { p.nuke(account).await })
                .await?;
            info!(account_id = %event.account_id, "Account removed from billing providers");
        }
        Ok(Dispatch::Handled)
    }
}
