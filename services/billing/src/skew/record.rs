//! Persisted skew records and the escalation ladder.

use chrono::{DateTime, Duration, Utc};
use pulse_events::{EventAction, SkewKind};
use pulse_id::{AccountId, ResourceId, SkewId};
use serde::{Deserialize, Serialize};

use super::SkewError;
use crate::backend::ControlAction;

/// Keys used in [`SkewRecord::inputs`].
pub mod keys {
    pub const ACTION: &str = "action";
    pub const ACTION_TRIGGERED_AT: &str = "action_triggered_at";
    pub const NEXT_ACTION_DUE_AT: &str = "next_action_due_at";
    pub const NEXT_ACTION: &str = "next_action";
    pub const RESOURCE_ID: &str = "resource_id";
    pub const SOFT_LIMIT: &str = "soft_limit";
    pub const HARD_LIMIT: &str = "hard_limit";
    pub const SOFT_GRACE_PERIOD: &str = "soft_grace_period";
    pub const HARD_GRACE_PERIOD: &str = "hard_grace_period";
    pub const CONTROL: &str = "control";
}

/// Label recorded as the next action of a [`SkewAction::HardAction`].
pub const UNRECOVERABLE: &str = "unrecoverable";

/// A record counts as expired this many seconds before its due time.
pub const EXPIRY_LEEWAY_SECS: i64 = 60;

// =============================================================================
// Ladder
// =============================================================================

/// One rung of the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkewAction {
    Warning,
    SoftAction,
    HardAction,
}

impl SkewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkewAction::Warning => "WARNING",
            SkewAction::SoftAction => "SOFT_ACTION",
            SkewAction::HardAction => "HARD_ACTION",
        }
    }

    /// The rung after this one. `HardAction` is terminal.
    pub fn next(&self) -> Option<SkewAction> {
        match self {
            SkewAction::Warning => Some(SkewAction::SoftAction),
            SkewAction::SoftAction => Some(SkewAction::HardAction),
            SkewAction::HardAction => None,
        }
    }

    pub fn next_label(&self) -> &'static str {
        self.next().map(|n| n.as_str()).unwrap_or(UNRECOVERABLE)
    }

    /// Control request issued when a record enters this rung.
    pub fn control(&self) -> Option<ControlAction> {
        match self {
            SkewAction::Warning => None,
            SkewAction::SoftAction => Some(ControlAction::Suspend),
            SkewAction::HardAction => Some(ControlAction::Destroy),
        }
    }

    /// Notice action sent when a record enters this rung.
    pub fn notice(&self) -> EventAction {
        match self {
            SkewAction::Warning => EventAction::SkewsWarning,
            SkewAction::SoftAction | SkewAction::HardAction => EventAction::SkewsActions,
        }
    }
}

impl std::fmt::Display for SkewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SkewAction {
    type Err = SkewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WARNING" => Ok(SkewAction::Warning),
            "SOFT_ACTION" => Ok(SkewAction::SoftAction),
            "HARD_ACTION" => Ok(SkewAction::HardAction),
            other => Err(SkewError::Corrupt(format!("unknown skew action '{other}'"))),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkewStatus {
    Active,
    Deactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Escalation state of one billed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkewRecord {
    pub id: SkewId,
    pub account_id: AccountId,
    /// The billed resource.
    pub cat_id: ResourceId,
    /// Resource category.
    pub cat_type: String,
    pub inputs: Vec<KeyValue>,
    #[serde(default)]
    pub outputs: Vec<KeyValue>,
    #[serde(default)]
    pub actions: Vec<KeyValue>,
    pub status: SkewStatus,
    pub event_type: SkewKind,
    pub created_at: DateTime<Utc>,
}

impl SkewRecord {
    pub fn input(&self, key: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.status == SkewStatus::Active
    }

    pub fn action(&self) -> Result<SkewAction, SkewError> {
        self.required(keys::ACTION)?.parse()
    }

    pub fn triggered_at(&self) -> Result<DateTime<Utc>, SkewError> {
        self.time(keys::ACTION_TRIGGERED_AT)
    }

    pub fn due_at(&self) -> Result<DateTime<Utc>, SkewError> {
        self.time(keys::NEXT_ACTION_DUE_AT)
    }

    /// True once `now` is within [`EXPIRY_LEEWAY_SECS`] of the due time, or past it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, SkewError> {
        let triggered = self.triggered_at()?;
        let duration = self.due_at()? - triggered;
        Ok(triggered + duration - now < Duration::seconds(EXPIRY_LEEWAY_SECS))
    }

    fn required(&self, key: &'static str) -> Result<&str, SkewError> {
        self.input(key)
            .ok_or_else(|| SkewError::Corrupt(format!("skew {} has no '{key}' input", self.id)))
    }

    fn time(&self, key: &'static str) -> Result<DateTime<Utc>, SkewError> {
        let raw = self.required(key)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SkewError::Corrupt(format!("skew {} has bad '{key}': {e}", self.id)))
    }
}
