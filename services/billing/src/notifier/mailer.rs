//! Transactional mail over an HTTP mail API.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::EventAction;
use serde::Serialize;
use tracing::debug;

use super::{Notice, Notifier};
use crate::client::{build_http_client, ensure_success};

/// Sends notices to the account owner. Account ids are the owner's email.
pub struct MailNotifier {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct MailMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
}

impl MailNotifier {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            url: url.into(),
            api_key,
            from: from.into(),
        })
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    fn name(&self) -> &'static str {
        "mailer"
    }

    fn accepts(&self, action: EventAction) -> bool {
        matches!(
            action,
            EventAction::Onboard
                | EventAction::Reset
                | EventAction::Invite
                | EventAction::Balance
                | EventAction::InsufficientFund
                | EventAction::SkewsWarning
                | EventAction::SkewsActions
                | EventAction::Launched
                | EventAction::Destroyed
                | EventAction::Failure
        )
    }

    async fn notify(&self, notice: &Notice) -> Result<()> {
        let message = MailMessage {
            from: &self.from,
            to: notice.account_id.as_str(),
            subject: notice.subject(),
            text: notice.body(),
        };
        debug!(to = message.to, subject = %message.subject, "Sending mail");

        let mut request = self.client.post(&self.url).json(&message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        ensure_success(request.send().await?, "send mail").await?;
        Ok(())
    }
}
