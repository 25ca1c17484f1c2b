//! Billing-skew escalation.
//!
//! When an account stops paying for a resource, the engine walks a fixed
//! ladder: `WARNING`, then `SOFT_ACTION` (resource suspended), then
//! `HARD_ACTION` (resource destroyed). Each rung is a [`SkewRecord`] with a
//! due time; the next audit after that due time moves the resource one rung
//! up. Recovery (positive balance, no overdue invoices) deactivates the
//! records and restarts a suspended resource.
//!
//! Every operation on one (account, resource) pair runs under that pair's
//! lock, so re-delivered or concurrent audits cannot both escalate.

mod locks;
mod record;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulse_events::{format_duration, BillOpts, BillOptsError, SkewKind};
use pulse_id::{AccountId, ResourceId, SkewId};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use locks::KeyedLocks;
pub use record::{keys, KeyValue, SkewAction, SkewRecord, SkewStatus, EXPIRY_LEEWAY_SECS, UNRECOVERABLE};

use crate::backend::{BalanceApi, ControlAction, ControlPlane, ControlRequest, SkewStore};
use crate::notifier::{Notice, NotifierSet};

// =============================================================================
// Errors and outcomes
// =============================================================================

#[derive(Debug, Error)]
pub enum SkewError {
    /// The billing context is missing or has malformed fields.
    #[error("invalid billing options: {0}")]
    InvalidOpts(#[from] BillOptsError),

    /// A stored record cannot be interpreted.
    #[error("corrupt skew record: {0}")]
    Corrupt(String),

    #[error("balance lookup failed: {0:#}")]
    Balance(anyhow::Error),

    #[error("skew store failed: {0:#}")]
    Store(anyhow::Error),

    #[error("control request failed: {0:#}")]
    Control(anyhow::Error),

    #[error("notification failed: {0:#}")]
    Notify(anyhow::Error),
}

/// What an engine call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewOutcome {
    /// First breach: a record was created at this rung.
    Created(SkewAction),
    /// An expired record was superseded by the next rung.
    Escalated { from: SkewAction, to: SkewAction },
    /// An active record exists and is not yet due, or there was nothing to
    /// deactivate.
    Unchanged,
    /// Active records were deactivated; `resumed` if a start was requested.
    Deactivated { count: usize, resumed: bool },
    /// The active record is already `HARD_ACTION`.
    Terminal,
}

impl SkewOutcome {
    /// The call moved the resource onto `SOFT_ACTION`.
    pub fn suspended(&self) -> bool {
        matches!(
            self,
            SkewOutcome::Created(SkewAction::SoftAction)
                | SkewOutcome::Escalated {
                    to: SkewAction::SoftAction,
                    ..
                }
        )
    }
}

// =============================================================================
// Defaults
// =============================================================================

/// Limits and grace periods used when a billing event does not carry them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewDefaults {
    pub soft_limit: f64,
    pub hard_limit: f64,
    pub soft_grace: Duration,
    pub hard_grace: Duration,
}

impl SkewDefaults {
    /// Fills whichever limits and grace periods `opts` leaves unset.
    pub fn apply(&self, opts: &mut BillOpts) {
        opts.soft_limit.get_or_insert(self.soft_limit);
        opts.hard_limit.get_or_insert(self.hard_limit);
        opts.soft_grace_period.get_or_insert(self.soft_grace);
        opts.hard_grace_period.get_or_insert(self.hard_grace);
    }
}

impl Default for SkewDefaults {
    fn default() -> Self {
        Self {
            soft_limit: 0.0,
            hard_limit: -10.0,
            soft_grace: Duration::from_secs(72 * 60 * 60),
            hard_grace: Duration::from_secs(168 * 60 * 60),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

type SkewKey = (AccountId, ResourceId);

fn key_of(opts: &BillOpts) -> Result<SkewKey, SkewError> {
    Ok((opts.account()?.clone(), opts.resource()?.clone()))
}

fn grace(opts: &BillOpts, action: SkewAction) -> Result<chrono::Duration, SkewError> {
    let (field, period) = match action {
        SkewAction::Warning => ("soft_grace_period", opts.soft_grace()?),
        SkewAction::SoftAction | SkewAction::HardAction => {
            ("hard_grace_period", opts.hard_grace()?)
        }
    };
    chrono::Duration::from_std(period).map_err(|_| {
        SkewError::InvalidOpts(BillOptsError::InvalidField {
            field,
            value: format_duration(period),
            reason: "grace period out of range".to_string(),
        })
    })
}

/// The escalation state machine.
pub struct SkewEngine {
    balances: Arc<dyn BalanceApi>,
    store: Arc<dyn SkewStore>,
    control: Arc<dyn ControlPlane>,
    notifiers: NotifierSet,
    locks: KeyedLocks<SkewKey>,
}

impl SkewEngine {
    pub fn new(
        balances: Arc<dyn BalanceApi>,
        store: Arc<dyn SkewStore>,
        control: Arc<dyn ControlPlane>,
        notifiers: NotifierSet,
    ) -> Self {
        Self {
            balances,
            store,
            control,
            notifiers,
            locks: KeyedLocks::new(),
        }
    }

    /// Checks whether the resource is paid for and escalates or recovers.
    ///
    /// Quota skews go to [`SkewEngine::skews_quota_unpaid`]. On-demand skews
    /// look at the account's credit: zero or below escalates, anything above
    /// deactivates.
    #[instrument(skip(self, opts), fields(account_id = ?opts.account_id, resource_id = ?opts.assembly_id))]
    pub async fn audit_unpaid(&self, opts: &BillOpts) -> Result<SkewOutcome, SkewError> {
        let key = key_of(opts)?;
        let _guard = self.locks.lock(&key).await;

        if opts.skew_kind == SkewKind::Quota {
            return self.quota_locked(opts, &key).await;
        }

        let balance = self
            .balances
            .get_balance(&key.0)
            .await
            .map_err(SkewError::Balance)?;
        debug!(credit = balance.credit, "Audited balance");

        if balance.credit <= 0.0 {
            self.action_locked(opts, &key, balance.credit).await
        } else {
            self.deactive_locked(opts, &key).await
        }
    }

    /// Escalates an on-demand resource whose balance is `balance`.
    #[instrument(skip(self, opts), fields(account_id = ?opts.account_id, resource_id = ?opts.assembly_id))]
    pub async fn action_events(
        &self,
        opts: &BillOpts,
        balance: f64,
    ) -> Result<SkewOutcome, SkewError> {
        let key = key_of(opts)?;
        let _guard = self.locks.lock(&key).await;
        self.action_locked(opts, &key, balance).await
    }

    /// Escalates a resource whose quota invoice is overdue.
    #[instrument(skip(self, opts), fields(account_id = ?opts.account_id, resource_id = ?opts.assembly_id))]
    pub async fn skews_quota_unpaid(&self, opts: &BillOpts) -> Result<SkewOutcome, SkewError> {
        let key = key_of(opts)?;
        let _guard = self.locks.lock(&key).await;
        self.quota_locked(opts, &key).await
    }

    /// Deactivates every active record for the resource.
    #[instrument(skip(self, opts), fields(account_id = ?opts.account_id, resource_id = ?opts.assembly_id))]
    pub async fn deactive_events(&self, opts: &BillOpts) -> Result<SkewOutcome, SkewError> {
        let key = key_of(opts)?;
        let _guard = self.locks.lock(&key).await;
        self.deactive_locked(opts, &key).await
    }

    /// Creates a record at `action`, superseding `prior` if given.
    #[instrument(skip(self, opts, prior), fields(account_id = ?opts.account_id, resource_id = ?opts.assembly_id, action = %action))]
    pub async fn create_event(
        &self,
        opts: &BillOpts,
        action: SkewAction,
        prior: Option<&SkewRecord>,
    ) -> Result<SkewRecord, SkewError> {
        let key = key_of(opts)?;
        let _guard = self.locks.lock(&key).await;
        self.create_locked(opts, &key, action, prior).await
    }

    async fn action_locked(
        &self,
        opts: &BillOpts,
        key: &SkewKey,
        balance: f64,
    ) -> Result<SkewOutcome, SkewError> {
        let soft_limit = opts.soft_limit()?;
        let hard_limit = opts.hard_limit()?;

        if let Some(current) = self.latest_active(key).await? {
            return self.advance(opts, key, &current).await;
        }

        let action = if balance <= hard_limit {
            SkewAction::HardAction
        } else if balance <= soft_limit {
            SkewAction::SoftAction
        } else {
            SkewAction::Warning
        };
        info!(balance, soft_limit, hard_limit, action = %action, "Balance skew detected");

        self.create_locked(opts, key, action, None).await?;
        Ok(SkewOutcome::Created(action))
    }

    async fn quota_locked(&self, opts: &BillOpts, key: &SkewKey) -> Result<SkewOutcome, SkewError> {
        if let Some(current) = self.latest_active(key).await? {
            return self.advance(opts, key, &current).await;
        }

        info!(quota_id = %opts.quota_id, "Unpaid quota detected");
        self.create_locked(opts, key, SkewAction::Warning, None)
            .await?;
        Ok(SkewOutcome::Created(SkewAction::Warning))
    }

    async fn deactive_locked(&self, opts: &BillOpts, key: &SkewKey) -> Result<SkewOutcome, SkewError> {
        let active = self
            .store
            .list_active(&key.0, &key.1)
            .await
            .map_err(SkewError::Store)?;
        if active.is_empty() {
            debug!("No active skews to deactivate");
            return Ok(SkewOutcome::Unchanged);
        }

        let mut was_suspended = false;
        for record in &active {
            if matches!(record.action(), Ok(SkewAction::SoftAction)) {
                was_suspended = true;
            }
            let mut record = record.clone();
            record.status = SkewStatus::Deactive;
            self.store
                .update(&record)
                .await
                .map_err(SkewError::Store)?;
        }

        if was_suspended {
            let request = ControlRequest::new(
                key.0.clone(),
                key.1.clone(),
                ControlAction::Start,
                opts.category.clone(),
            );
            self.control
                .push_request(&request)
                .await
                .map_err(SkewError::Control)?;
        }

        info!(count = active.len(), resumed = was_suspended, "Skews deactivated");
        Ok(SkewOutcome::Deactivated {
            count: active.len(),
            resumed: was_suspended,
        })
    }

    async fn latest_active(&self, key: &SkewKey) -> Result<Option<SkewRecord>, SkewError> {
        let mut active = self
            .store
            .list_active(&key.0, &key.1)
            .await
            .map_err(SkewError::Store)?;
        if active.len() > 1 {
            warn!(count = active.len(), "Multiple active skews, using the newest");
        }
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active.into_iter().next())
    }

    /// Moves an existing record one rung up if it has expired.
    async fn advance(
        &self,
        opts: &BillOpts,
        key: &SkewKey,
        current: &SkewRecord,
    ) -> Result<SkewOutcome, SkewError> {
        let from = current.action()?;
        if !current.is_expired(Utc::now())? {
            debug!(skew_id = %current.id, action = %from, "Skew not yet due");
            return Ok(SkewOutcome::Unchanged);
        }

        let Some(to) = from.next() else {
            debug!(skew_id = %current.id, "Skew already at hard action");
            return Ok(SkewOutcome::Terminal);
        };

        info!(skew_id = %current.id, from = %from, to = %to, "Escalating skew");
        self.create_locked(opts, key, to, Some(current)).await?;
        Ok(SkewOutcome::Escalated { from, to })
    }

    async fn create_locked(
        &self,
        opts: &BillOpts,
        key: &SkewKey,
        action: SkewAction,
        prior: Option<&SkewRecord>,
    ) -> Result<SkewRecord, SkewError> {
        let now = Utc::now();
        let triggered_at: DateTime<Utc> = match prior {
            Some(prior) => prior.triggered_at()?,
            None => now,
        };
        let due_at = triggered_at + grace(opts, action)?;
        let control = action.control();

        let mut inputs = vec![
            KeyValue::new(keys::ACTION, action.as_str()),
            KeyValue::new(keys::ACTION_TRIGGERED_AT, triggered_at.to_rfc3339()),
            KeyValue::new(keys::NEXT_ACTION_DUE_AT, due_at.to_rfc3339()),
            KeyValue::new(keys::NEXT_ACTION, action.next_label()),
            KeyValue::new(keys::RESOURCE_ID, key.1.as_str()),
        ];
        if let Some(limit) = opts.soft_limit {
            inputs.push(KeyValue::new(keys::SOFT_LIMIT, limit.to_string()));
        }
        if let Some(limit) = opts.hard_limit {
            inputs.push(KeyValue::new(keys::HARD_LIMIT, limit.to_string()));
        }
        inputs.push(KeyValue::new(
            keys::SOFT_GRACE_PERIOD,
            format_duration(opts.soft_grace()?),
        ));
        inputs.push(KeyValue::new(
            keys::HARD_GRACE_PERIOD,
            format_duration(opts.hard_grace()?),
        ));

        let record = SkewRecord {
            id: SkewId::new(),
            account_id: key.0.clone(),
            cat_id: key.1.clone(),
            cat_type: opts.category.clone(),
            inputs,
            outputs: Vec::new(),
            actions: control
                .map(|c| vec![KeyValue::new(keys::CONTROL, c.as_str())])
                .unwrap_or_default(),
            status: SkewStatus::Active,
            event_type: opts.skew_kind,
            created_at: now,
        };

        self.store
            .create(&record)
            .await
            .map_err(SkewError::Store)?;

        if let Some(prior) = prior {
            let mut superseded = prior.clone();
            superseded.status = SkewStatus::Deactive;
            self.store
                .update(&superseded)
                .await
                .map_err(SkewError::Store)?;
        }

        if let Some(control) = control {
            let request =
                ControlRequest::new(key.0.clone(), key.1.clone(), control, opts.category.clone());
            self.control
                .push_request(&request)
                .await
                .map_err(SkewError::Control)?;
        }

        let notice = self.notice(opts, &record, action, due_at)?;
        self.notifiers
            .notify(&notice)
            .await
            .map_err(SkewError::Notify)?;

        info!(
            skew_id = %record.id,
            action = %action,
            due_at = %due_at,
            control = ?control,
            "Skew recorded"
        );
        Ok(record)
    }

    fn notice(
        &self,
        opts: &BillOpts,
        record: &SkewRecord,
        action: SkewAction,
        due_at: DateTime<Utc>,
    ) -> Result<Notice, SkewError> {
        let mut notice = Notice::new(action.notice(), record.account_id.clone())
            .with("assembly_id", record.cat_id.as_str())
            .with("assembly_name", opts.assembly_name.clone())
            .with("action", action.as_str())
            .with("next_action", action.next_label())
            .with("next_action_due_at", due_at.to_rfc3339())
            .with("soft_grace_period", format_duration(opts.soft_grace()?))
            .with("hard_grace_period", format_duration(opts.hard_grace()?));
        if let Some(limit) = opts.soft_limit {
            notice = notice.with("soft_limit", limit.to_string());
        }
        if let Some(limit) = opts.hard_limit {
            notice = notice.with("hard_limit", limit.to_string());
        }
        Ok(notice)
    }
}
