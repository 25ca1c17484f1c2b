//! In-memory collaborators for dev mode and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::EventAction;
use pulse_id::{AccountId, ResourceId};
use tracing::{debug, info};

use super::{Balance, BalanceApi, BilledHistory, ControlPlane, ControlRequest, SkewStore};
use crate::notifier::{Notice, Notifier};
use crate::skew::SkewRecord;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Ledger
// =============================================================================

/// Balances and billed history held in memory. Unknown accounts have zero
/// credit.
#[derive(Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<AccountId, f64>>,
    history: Mutex<Vec<BilledHistory>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, account: &AccountId, credit: f64) {
        lock(&self.balances).insert(account.clone(), credit);
    }

    pub fn balance(&self, account: &AccountId) -> f64 {
        lock(&self.balances).get(account).copied().unwrap_or(0.0)
    }

    pub fn history(&self) -> Vec<BilledHistory> {
        lock(&self.history).clone()
    }
}

#[async_trait]
impl BalanceApi for MemoryLedger {
    async fn get_balance(&self, account: &AccountId) -> Result<Balance> {
        Ok(Balance {
            credit: self.balance(account),
        })
    }

    async fn post_deduction(&self, account: &AccountId, new_credit: f64) -> Result<()> {
        debug!(account_id = %account, new_credit, "[MEMORY] Balance updated");
        self.set_balance(account, new_credit);
        Ok(())
    }

    async fn post_billed_history(&self, record: &BilledHistory) -> Result<()> {
        lock(&self.history).push(record.clone());
        Ok(())
    }
}

// =============================================================================
// Skew store
// =============================================================================

#[derive(Default)]
pub struct MemorySkewStore {
    records: Mutex<Vec<SkewRecord>>,
}

impl MemorySkewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record ever stored, active or not, in creation order.
    pub fn records(&self) -> Vec<SkewRecord> {
        lock(&self.records).clone()
    }

    /// Stores a record as-is, e.g. one back-dated by a test.
    pub fn insert(&self, record: SkewRecord) {
        lock(&self.records).push(record);
    }
}

#[async_trait]
impl SkewStore for MemorySkewStore {
    async fn list_active(
        &self,
        account: &AccountId,
        resource: &ResourceId,
    ) -> Result<Vec<SkewRecord>> {
        let mut active: Vec<SkewRecord> = lock(&self.records)
            .iter()
            .filter(|r| r.is_active() && &r.account_id == account && &r.cat_id == resource)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn create(&self, record: &SkewRecord) -> Result<()> {
        let mut records = lock(&self.records);
        if records.iter().any(|r| r.id == record.id) {
            anyhow::bail!("skew {} already exists", record.id);
        }
        records.push(record.clone());
        Ok(())
    }

    async fn update(&self, record: &SkewRecord) -> Result<()> {
        let mut records = lock(&self.records);
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => anyhow::bail!("skew {} not found", record.id),
        }
    }
}

// =============================================================================
// Control plane
// =============================================================================

/// Records control requests instead of sending them.
#[derive(Default)]
pub struct RecordingControlPlane {
    requests: Mutex<Vec<ControlRequest>>,
}

impl RecordingControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ControlRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn push_request(&self, request: &ControlRequest) -> Result<()> {
        info!(
            request_id = %request.request_id,
            resource_id = %request.resource_id,
            action = %request.action,
            "[MEMORY] Control request"
        );
        lock(&self.requests).push(request.clone());
        Ok(())
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Keeps every notice it is given.
pub struct RecordingNotifier {
    name: &'static str,
    only: Option<Vec<EventAction>>,
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            only: None,
            notices: Mutex::new(Vec::new()),
        }
    }

    /// Restricts the channel to `actions`.
    #[must_use]
    pub fn only(mut self, actions: &[EventAction]) -> Self {
        self.only = Some(actions.to_vec());
        self
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        self.name
    }

    fn accepts(&self, action: EventAction) -> bool {
        self.only
            .as_ref()
            .map_or(true, |actions| actions.contains(&action))
    }

    async fn notify(&self, notice: &Notice) -> Result<()> {
        info!(
            channel = self.name,
            action = %notice.action,
            account_id = %notice.account_id,
            subject = %notice.subject(),
            "[MEMORY] Notice"
        );
        lock(&self.notices).push(notice.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use pulse_events::SkewKind;
    use pulse_id::SkewId;

    use super::*;
    use crate::skew::{SkewRecord, SkewStatus};

    fn record(resource: &str, age_secs: i64) -> SkewRecord {
        SkewRecord {
            id: SkewId::new(),
            account_id: AccountId::parse("info@example.com").unwrap(),
            cat_id: ResourceId::parse(resource).unwrap(),
            cat_type: "machine".to_string(),
            inputs: vec![],
            outputs: vec![],
            actions: vec![],
            status: SkewStatus::Active,
            event_type: SkewKind::Ondemand,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_list_active_is_newest_first_and_scoped() {
        let store = MemorySkewStore::new();
        let older = record("ASM1", 60);
        let newer = record("ASM1", 1);
        let mut inactive = record("ASM1", 0);
        inactive.status = SkewStatus::Deactive;
        for r in [older.clone(), newer.clone(), inactive, record("ASM2", 0)] {
            store.create(&r).await.unwrap();
        }

        let active = store
            .list_active(&older.account_id, &older.cat_id)
            .await
            .unwrap();
        let ids: Vec<_> = active.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let store = MemorySkewStore::new();
        assert!(store.update(&record("ASM1", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_ledger_deduction_replaces_credit() {
        let ledger = MemoryLedger::new();
        let account = AccountId::parse("info@example.com").unwrap();
        assert_eq!(ledger.get_balance(&account).await.unwrap().credit, 0.0);

        ledger.post_deduction(&account, 42.0).await.unwrap();
        assert_eq!(ledger.get_balance(&account).await.unwrap().credit, 42.0);
    }
}
