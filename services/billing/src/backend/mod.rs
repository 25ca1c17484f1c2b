//! Collaborator interfaces.
//!
//! The engine talks to four external systems: the balance ledger, the skew
//! record store, the resource control plane and (optionally) an invoicing
//! backend. Each is a trait so the HTTP clients in [`crate::client`] and the
//! in-memory versions in [`memory`] are interchangeable.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_events::AccountData;
use pulse_id::{AccountId, RequestId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::skew::SkewRecord;

// =============================================================================
// Ledger
// =============================================================================

/// Current credit of an account.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub credit: f64,
}

/// One billed usage period, recorded on `TRANSACTION`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BilledHistory {
    pub account_id: AccountId,
    pub assembly_id: ResourceId,
    pub assembly_name: String,
    pub assemblies_id: String,
    pub bill_type: String,
    pub billing_amount: f64,
    pub currency_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BalanceApi: Send + Sync {
    async fn get_balance(&self, account: &AccountId) -> Result<Balance>;

    /// Replaces the account's credit with `new_credit`.
    async fn post_deduction(&self, account: &AccountId, new_credit: f64) -> Result<()>;

    async fn post_billed_history(&self, record: &BilledHistory) -> Result<()>;
}

// =============================================================================
// Skew records
// =============================================================================

#[async_trait]
pub trait SkewStore: Send + Sync {
    /// Active records for one (account, resource), newest first.
    async fn list_active(&self, account: &AccountId, resource: &ResourceId)
        -> Result<Vec<SkewRecord>>;

    async fn create(&self, record: &SkewRecord) -> Result<()>;

    async fn update(&self, record: &SkewRecord) -> Result<()>;
}

// =============================================================================
// Control plane
// =============================================================================

/// What the control plane should do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Suspend,
    Destroy,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Suspend => "suspend",
            ControlAction::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle request pushed to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: RequestId,
    pub account_id: AccountId,
    pub resource_id: ResourceId,
    pub action: ControlAction,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

impl ControlRequest {
    pub fn new(
        account_id: AccountId,
        resource_id: ResourceId,
        action: ControlAction,
        category: impl Into<String>,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            account_id,
            resource_id,
            action,
            category: category.into(),
            created_at: Utc::now(),
        }
    }
}

/// Fire-and-forget: success means the request was accepted, not executed.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn push_request(&self, request: &ControlRequest) -> Result<()>;
}

// =============================================================================
// Invoicing
// =============================================================================

/// An invoice as reported by the invoicing backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub amount: f64,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub status: String,
}

/// A line item added to the client's next invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableItem {
    pub account_id: AccountId,
    pub resource_id: ResourceId,
    pub description: String,
    pub amount: f64,
    pub currency_type: String,
}

#[async_trait]
pub trait InvoiceApi: Send + Sync {
    async fn create_client(&self, account: &AccountData) -> Result<()>;

    async fn close_client(&self, email: &str) -> Result<()>;

    async fn suspend_service(&self, account: &AccountId, resource: &ResourceId) -> Result<()>;

    async fn add_billable_item(&self, item: &BillableItem) -> Result<()>;

    async fn create_invoice(&self, account: &AccountId) -> Result<Invoice>;

    async fn overdue_invoices(&self, account: &AccountId) -> Result<Vec<Invoice>>;
}
