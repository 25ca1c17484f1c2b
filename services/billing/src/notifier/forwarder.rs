//! Forwards notices as JSON to a downstream API.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::EventAction;

use super::{Notice, Notifier};
use crate::client::{build_http_client, ensure_success};

pub struct ApiForwarder {
    client: reqwest::Client,
    url: String,
}

impl ApiForwarder {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for ApiForwarder {
    fn name(&self) -> &'static str {
        "api-forwarder"
    }

    fn accepts(&self, _action: EventAction) -> bool {
        true
    }

    async fn notify(&self, notice: &Notice) -> Result<()> {
        let response = self.client.post(&self.url).json(notice).send().await?;
        ensure_success(response, "forward notice").await?;
        Ok(())
    }
}
