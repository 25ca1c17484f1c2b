//! Human-facing notices and the channels that deliver them.
//!
//! A [`Notice`] is rendered once and handed to every [`Notifier`] in a
//! [`NotifierSet`] that accepts its action. Channels:
//!
//! - [`MailNotifier`]: transactional mail over an HTTP mail API
//! - [`ChatNotifier`]: incoming-webhook chat message for operators
//! - [`ApiForwarder`]: the notice as JSON, POSTed to a downstream endpoint
//!
//! Delivery is best effort; nothing is retried.

mod chat;
mod forwarder;
mod mailer;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_events::{Event, EventAction};
use pulse_id::AccountId;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub use chat::ChatNotifier;
pub use forwarder::ApiForwarder;
pub use mailer::MailNotifier;

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub action: EventAction,
    pub account_id: AccountId,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
}

impl Notice {
    pub fn new(action: EventAction, account_id: AccountId) -> Self {
        Self {
            action,
            account_id,
            timestamp: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    /// Builds a notice from an event's flattened payload.
    pub fn from_event(event: &Event) -> Self {
        Self {
            action: event.action,
            account_id: event.account_id.clone(),
            timestamp: event.timestamp,
            fields: event.payload.to_data().fields,
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn subject(&self) -> String {
        match self.action {
            EventAction::Onboard => "Welcome aboard".to_string(),
            EventAction::Reset => "Password reset requested".to_string(),
            EventAction::Invite => "You have been invited to a team".to_string(),
            EventAction::Balance => "Your balance was updated".to_string(),
            EventAction::InsufficientFund => "Insufficient funds".to_string(),
            EventAction::SkewsWarning => "Payment overdue".to_string(),
            EventAction::SkewsActions => "Payment overdue: action taken on your resource".to_string(),
            action => {
                let name = self
                    .field("resource_name")
                    .filter(|n| !n.is_empty())
                    .or_else(|| self.field("resource_id"))
                    .unwrap_or("resource");
                format!("{name}: {}", action.as_str().to_lowercase())
            }
        }
    }

    /// Plain-text body: one `key: value` line per field.
    pub fn body(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this channel wants notices for `action`.
    fn accepts(&self, action: EventAction) -> bool;

    async fn notify(&self, notice: &Notice) -> Result<()>;
}

/// Every configured channel.
#[derive(Clone, Default)]
pub struct NotifierSet {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Sends `notice` on every accepting channel.
    ///
    /// All channels are tried even when one fails; the first failure is
    /// returned. On success, returns the number of channels used.
    pub async fn notify(&self, notice: &Notice) -> Result<usize> {
        let mut sent = 0;
        let mut first_err = None;

        for channel in self.channels.iter().filter(|c| c.accepts(notice.action)) {
            match channel.notify(notice).await {
                Ok(()) => {
                    sent += 1;
                    debug!(channel = channel.name(), action = %notice.action, "Notice sent");
                }
                Err(e) => {
                    error!(
                        channel = channel.name(),
                        action = %notice.action,
                        account_id = %notice.account_id,
                        error = %e,
                        "Notice delivery failed"
                    );
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::RecordingNotifier;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn accepts(&self, _action: EventAction) -> bool {
            true
        }

        async fn notify(&self, _notice: &Notice) -> Result<()> {
            anyhow::bail!("channel down")
        }
    }

    fn notice(action: EventAction) -> Notice {
        Notice::new(action, AccountId::parse("info@example.com").unwrap())
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_channels() {
        let recorder = Arc::new(RecordingNotifier::new("recorder"));
        let set = NotifierSet::new()
            .with(Arc::new(Failing))
            .with(recorder.clone());

        let err = set.notify(&notice(EventAction::Onboard)).await.unwrap_err();
        assert!(err.to_string().contains("channel down"));
        assert_eq!(recorder.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_only_accepting_channels_are_used() {
        let billing = Arc::new(
            RecordingNotifier::new("billing").only(&[EventAction::SkewsWarning]),
        );
        let set = NotifierSet::new().with(billing.clone());

        assert_eq!(set.notify(&notice(EventAction::Invite)).await.unwrap(), 0);
        assert_eq!(set.notify(&notice(EventAction::SkewsWarning)).await.unwrap(), 1);
        assert_eq!(billing.notices().len(), 1);
    }

    #[test]
    fn test_lifecycle_subject_uses_resource_name() {
        let n = notice(EventAction::Destroyed).with("resource_name", "db.example.com");
        assert_eq!(n.subject(), "db.example.com: destroyed");
        assert_eq!(notice(EventAction::Failure).subject(), "resource: failure");
    }
}
