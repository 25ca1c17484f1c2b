//! Provider backed by the platform's own credit ledger.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{BillOpts, EventAction};
use tracing::info;

use super::BillingProvider;
use crate::backend::{BalanceApi, BilledHistory};
use crate::notifier::{Notice, NotifierSet};
use crate::skew::{SkewEngine, SkewOutcome};

pub struct LedgerProvider {
    balances: Arc<dyn BalanceApi>,
    engine: Arc<SkewEngine>,
    notifiers: NotifierSet,
}

impl LedgerProvider {
    pub const NAME: &'static str = "ledger";

    pub fn new(
        balances: Arc<dyn BalanceApi>,
        engine: Arc<SkewEngine>,
        notifiers: NotifierSet,
    ) -> Self {
        Self {
            balances,
            engine,
            notifiers,
        }
    }
}

#[async_trait]
impl BillingProvider for LedgerProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn deduct(&self, opts: &BillOpts) -> Result<()> {
        let account = opts.account()?;
        let balance = self.balances.get_balance(account).await?;
        let new_credit = balance.credit - opts.consumed;
        self.balances.post_deduction(account, new_credit).await?;

        info!(
            account_id = %account,
            consumed = opts.consumed,
            credit = new_credit,
            "Deducted usage from balance"
        );
        Ok(())
    }

    async fn transaction(&self, opts: &BillOpts) -> Result<()> {
        let record = BilledHistory {
            account_id: opts.account()?.clone(),
            assembly_id: opts.resource()?.clone(),
            assembly_name: opts.assembly_name.clone(),
            assemblies_id: opts.assemblies_id.clone(),
            bill_type: opts.category.clone(),
            billing_amount: opts.consumed,
            currency_type: opts.currency_type.clone(),
            start_date: opts.start_time,
            end_date: opts.end_time,
        };
        self.balances.post_billed_history(&record).await
    }

    async fn notify(&self, action: EventAction, opts: &BillOpts) -> Result<()> {
        let notice = opts
            .to_fields()
            .into_iter()
            .fold(Notice::new(action, opts.account()?.clone()), |n, (k, v)| {
                n.with(k, v)
            });
        self.notifiers.notify(&notice).await?;
        Ok(())
    }

    async fn audit_unpaid(&self, opts: &BillOpts) -> Result<Option<SkewOutcome>> {
        let outcome = self.engine.audit_unpaid(opts).await?;
        info!(
            account_id = ?opts.account_id,
            resource_id = ?opts.assembly_id,
            outcome = ?outcome,
            "Unpaid audit finished"
        );
        Ok(Some(outcome))
    }
}
