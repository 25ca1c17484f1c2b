//! Event type definitions.
//!
//! An [`Event`] is a timestamped, account-scoped record tagged with an
//! [`EventType`] (which store it lives in) and an [`EventAction`] (which
//! watcher branch handles it). Payloads are a tagged union so that handlers
//! do not re-parse string maps; [`EventPayload::Generic`] keeps anything that
//! does not fit a typed variant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pulse_id::{AccountId, ResourceId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bill::BillOpts;
use crate::error::EventError;

// =============================================================================
// Event Type
// =============================================================================

/// Partition key for the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Machine,
    Container,
    Bill,
    User,
    Status,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Machine,
        EventType::Container,
        EventType::Bill,
        EventType::User,
        EventType::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Machine => "machine",
            EventType::Container => "container",
            EventType::Bill => "bill",
            EventType::User => "user",
            EventType::Status => "status",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Event Action
// =============================================================================

/// What happened. Selects the dispatch branch in a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    // Resource lifecycle
    Launching,
    Launched,
    Running,
    Started,
    Stopped,
    Destroyed,
    Status,
    Failure,

    // Billing
    Deduct,
    Transaction,
    Invoice,
    Balance,
    InsufficientFund,
    QuotaUnpaid,
    SkewsActions,
    SkewsWarning,

    // Accounts
    Onboard,
    Reset,
    Invite,
    Nuke,
}

impl EventAction {
    pub const ALL: [EventAction; 20] = [
        EventAction::Launching,
        EventAction::Launched,
        EventAction::Running,
        EventAction::Started,
        EventAction::Stopped,
        EventAction::Destroyed,
        EventAction::Status,
        EventAction::Failure,
        EventAction::Deduct,
        EventAction::Transaction,
        EventAction::Invoice,
        EventAction::Balance,
        EventAction::InsufficientFund,
        EventAction::QuotaUnpaid,
        EventAction::SkewsActions,
        EventAction::SkewsWarning,
        EventAction::Onboard,
        EventAction::Reset,
        EventAction::Invite,
        EventAction::Nuke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Launching => "LAUNCHING",
            EventAction::Launched => "LAUNCHED",
            EventAction::Running => "RUNNING",
            EventAction::Started => "STARTED",
            EventAction::Stopped => "STOPPED",
            EventAction::Destroyed => "DESTROYED",
            EventAction::Status => "STATUS",
            EventAction::Failure => "FAILURE",
            EventAction::Deduct => "DEDUCT",
            EventAction::Transaction => "TRANSACTION",
            EventAction::Invoice => "INVOICE",
            EventAction::Balance => "BALANCE",
            EventAction::InsufficientFund => "INSUFFICIENT_FUND",
            EventAction::QuotaUnpaid => "QUOTA_UNPAID",
            EventAction::SkewsActions => "SKEWS_ACTIONS",
            EventAction::SkewsWarning => "SKEWS_WARNING",
            EventAction::Onboard => "ONBOARD",
            EventAction::Reset => "RESET",
            EventAction::Invite => "INVITE",
            EventAction::Nuke => "NUKE",
        }
    }

    /// Actions whose payload is a [`BillOpts`].
    pub fn is_billing(&self) -> bool {
        matches!(
            self,
            EventAction::Deduct
                | EventAction::Transaction
                | EventAction::Invoice
                | EventAction::Balance
                | EventAction::InsufficientFund
                | EventAction::QuotaUnpaid
                | EventAction::SkewsActions
                | EventAction::SkewsWarning
        )
    }

    /// Actions describing a machine or container state change.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventAction::Launching
                | EventAction::Launched
                | EventAction::Running
                | EventAction::Started
                | EventAction::Stopped
                | EventAction::Destroyed
                | EventAction::Status
                | EventAction::Failure
        )
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventAction {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| EventError::UnknownAction(s.to_string()))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Raw signal data: string fields plus ordered auxiliary strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub extras: Vec<String>,
}

impl EventData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Machine or container state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleData {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub resource_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Account-level user action (onboarding, password reset, invitations, removal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

/// Typed event payload.
///
/// Typed variants keep the signal they were mapped from in `raw`, so fields
/// the mapping does not know about still reach notices and forwarders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Billing { opts: BillOpts, raw: EventData },
    Lifecycle { lifecycle: LifecycleData, raw: EventData },
    Account { account: AccountData, raw: EventData },
    Generic(EventData),
}

impl EventPayload {
    /// Maps raw signal data onto the typed variant implied by `action`.
    ///
    /// Billing fields that are present but malformed are an error. Lifecycle
    /// and account data missing their required key fall back to
    /// [`EventPayload::Generic`].
    pub fn from_data(action: EventAction, data: EventData) -> Result<Self, EventError> {
        if action.is_billing() {
            let mapped = BillOpts::from_fields(&data.fields)?;
            if !mapped.ignored.is_empty() {
                debug!(action = %action, ignored = ?mapped.ignored, "Ignored billing fields");
            }
            return Ok(EventPayload::Billing {
                opts: mapped.value,
                raw: data,
            });
        }

        if action.is_lifecycle() {
            if let Some(resource_id) = data.get("resource_id") {
                let resource_id = ResourceId::parse(resource_id)
                    .map_err(|e| EventError::InvalidPayload(format!("resource_id: {e}")))?;
                let lifecycle = LifecycleData {
                    resource_id,
                    resource_name: data.get("resource_name").unwrap_or_default().to_string(),
                    status: data.get("status").map(str::to_string),
                    message: data.get("message").map(str::to_string),
                };
                return Ok(EventPayload::Lifecycle {
                    lifecycle,
                    raw: data,
                });
            }
            return Ok(EventPayload::Generic(data));
        }

        match data.get("email") {
            Some(email) if !email.is_empty() => {
                let account = AccountData {
                    email: email.to_string(),
                    first_name: data.get("first_name").unwrap_or_default().to_string(),
                    last_name: data.get("last_name").unwrap_or_default().to_string(),
                    phone: data.get("phone").map(str::to_string),
                    company: data.get("company").map(str::to_string),
                };
                Ok(EventPayload::Account { account, raw: data })
            }
            _ => Ok(EventPayload::Generic(data)),
        }
    }

    pub fn as_billing(&self) -> Option<&BillOpts> {
        match self {
            EventPayload::Billing { opts, .. } => Some(opts),
            _ => None,
        }
    }

    pub fn as_lifecycle(&self) -> Option<&LifecycleData> {
        match self {
            EventPayload::Lifecycle { lifecycle, .. } => Some(lifecycle),
            _ => None,
        }
    }

    pub fn as_account(&self) -> Option<&AccountData> {
        match self {
            EventPayload::Account { account, .. } => Some(account),
            _ => None,
        }
    }

    /// The signal data the payload was built from.
    pub fn raw(&self) -> &EventData {
        match self {
            EventPayload::Billing { raw, .. }
            | EventPayload::Lifecycle { raw, .. }
            | EventPayload::Account { raw, .. }
            | EventPayload::Generic(raw) => raw,
        }
    }

    /// Recovers the signal data, unchanged, e.g. for notices.
    pub fn to_data(&self) -> EventData {
        self.raw().clone()
    }
}

// =============================================================================
// Event
// =============================================================================

/// A single immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub account_id: AccountId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub action: EventAction,
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(
        account_id: AccountId,
        event_type: EventType,
        action: EventAction,
        payload: EventPayload,
    ) -> Self {
        Self {
            account_id,
            timestamp: Utc::now(),
            event_type,
            action,
            payload,
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::parse("info@example.com").unwrap()
    }

    #[test]
    fn test_event_type_parse_and_display() {
        for t in EventType::ALL {
            assert_eq!(t.to_string().parse::<EventType>().unwrap(), t);
        }
        assert!(matches!(
            "volume".parse::<EventType>(),
            Err(EventError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_event_action_serialization() {
        assert_eq!(
            serde_json::to_string(&EventAction::InsufficientFund).unwrap(),
            "\"INSUFFICIENT_FUND\""
        );
        assert_eq!(
            "SKEWS_ACTIONS".parse::<EventAction>().unwrap(),
            EventAction::SkewsActions
        );
        assert!(matches!(
            "skews_actions".parse::<EventAction>(),
            Err(EventError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_action_families_are_disjoint() {
        for action in EventAction::ALL {
            assert!(!(action.is_billing() && action.is_lifecycle()), "{action}");
        }
    }

    #[test]
    fn test_lifecycle_payload_from_data() {
        let data = EventData::new()
            .with("resource_id", "ASM001")
            .with("resource_name", "tolerant.megambox.com")
            .with("status", "running");
        let payload = EventPayload::from_data(EventAction::Running, data).unwrap();
        let lifecycle = payload.as_lifecycle().unwrap();
        assert_eq!(lifecycle.resource_id.as_str(), "ASM001");
        assert_eq!(lifecycle.status.as_deref(), Some("running"));
        assert!(lifecycle.message.is_none());
    }

    #[test]
    fn test_lifecycle_without_resource_falls_back_to_generic() {
        let data = EventData::new().with("host", "node-7");
        let payload = EventPayload::from_data(EventAction::Status, data.clone()).unwrap();
        assert_eq!(payload, EventPayload::Generic(data));
    }

    #[test]
    fn test_account_payload_from_data() {
        let data = EventData::new()
            .with("email", "info@example.com")
            .with("first_name", "Ada");
        let payload = EventPayload::from_data(EventAction::Onboard, data).unwrap();
        let account = payload.as_account().unwrap();
        assert_eq!(account.first_name, "Ada");
        assert_eq!(account.last_name, "");
    }

    #[test]
    fn test_billing_payload_rejects_bad_number() {
        let data = EventData::new().with("consumed", "ten");
        let err = EventPayload::from_data(EventAction::Deduct, data).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_payload_json_is_tagged() {
        let event = Event::new(
            account(),
            EventType::User,
            EventAction::Invite,
            EventPayload::Generic(EventData::new().with("team", "ops")),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["kind"], "generic");
        assert_eq!(json["action"], "INVITE");
        assert_eq!(json["event_type"], "user");
    }

    #[test]
    fn test_to_data_returns_the_signal_unchanged() {
        let mut data = EventData::new()
            .with("account_id", "info@example.com")
            .with("assembly_id", "ASM001")
            .with("invoice_ref", "INV-77");
        data.extras.push("aux-1".to_string());

        let payload = EventPayload::from_data(EventAction::Deduct, data.clone()).unwrap();
        let opts = payload.as_billing().unwrap();
        assert_eq!(opts.consumed, 0.0);
        assert_eq!(payload.to_data(), data);
        assert_eq!(payload.to_data().get("consumed"), None);
    }

    #[test]
    fn test_typed_payloads_keep_unknown_keys() {
        let mut lifecycle = EventData::new()
            .with("resource_id", "ASM9")
            .with("message", "boot timeout")
            .with("node", "node-7");
        lifecycle.extras.push("trace-1".to_string());
        let payload = EventPayload::from_data(EventAction::Failure, lifecycle.clone()).unwrap();
        assert_eq!(payload.as_lifecycle().unwrap().resource_id.as_str(), "ASM9");
        assert_eq!(payload.to_data(), lifecycle);

        let account = EventData::new()
            .with("email", "info@example.com")
            .with("referrer", "partner-3");
        let payload = EventPayload::from_data(EventAction::Invite, account.clone()).unwrap();
        assert!(payload.as_account().is_some());
        assert_eq!(payload.to_data().get("referrer"), Some("partner-3"));
        assert_eq!(payload.to_data(), account);
    }

    #[test]
    fn test_typed_payload_survives_json() {
        let data = EventData::new()
            .with("assembly_id", "ASM001")
            .with("invoice_ref", "INV-77");
        let payload = EventPayload::from_data(EventAction::Invoice, data).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "billing");
        assert_eq!(json["data"]["raw"]["fields"]["invoice_ref"], "INV-77");

        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
