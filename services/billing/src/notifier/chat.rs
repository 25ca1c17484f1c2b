//! Operator chat channel via an incoming webhook.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::EventAction;
use serde_json::json;

use super::{Notice, Notifier};
use crate::client::{build_http_client, ensure_success};

pub struct ChatNotifier {
    client: reqwest::Client,
    webhook: String,
}

impl ChatNotifier {
    pub fn new(webhook: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            webhook: webhook.into(),
        })
    }

    fn render(notice: &Notice) -> String {
        format!(
            "[{}] {}: {}",
            notice.action,
            notice.account_id,
            notice.subject()
        )
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn accepts(&self, action: EventAction) -> bool {
        matches!(
            action,
            EventAction::Onboard
                | EventAction::Launched
                | EventAction::Destroyed
                | EventAction::Failure
                | EventAction::SkewsActions
        )
    }

    async fn notify(&self, notice: &Notice) -> Result<()> {
        let body = json!({ "text": Self::render(notice) });
        let response = self.client.post(&self.webhook).json(&body).send().await?;
        ensure_success(response, "post chat message").await?;
        Ok(())
    }
}
