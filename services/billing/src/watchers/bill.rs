//! Billing events: deductions, transactions, invoices and skew audits.

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{Event, EventAction, EventType, Request, SkewKind};
use tracing::info;

use super::{Dispatch, EventHandler};
use crate::providers::Providers;
use crate::skew::{SkewDefaults, SkewOutcome};

pub struct BillHandler {
    providers: Providers,
    defaults: SkewDefaults,
}

impl BillHandler {
    pub fn new(providers: Providers, defaults: SkewDefaults) -> Self {
        Self {
            providers,
            defaults,
        }
    }
}

#[async_trait]
impl EventHandler for BillHandler {
    fn name(&self) -> &'static str {
        "bill"
    }

    fn request(&self) -> Request {
        Request::live([EventType::Bill])
    }

    async fn handle(&self, event: &Event) -> Result<Dispatch> {
        if !event.action.is_billing() {
            return Ok(Dispatch::Ignored);
        }
        let mut opts = event
            .payload
            .as_billing()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} event has no billing payload", event.action))?;

        if opts.account_id.is_none() {
            opts.account_id = Some(event.account_id.clone());
        }
        if event.action == EventAction::QuotaUnpaid {
            opts.skew_kind = SkewKind::Quota;
        }
        self.defaults.apply(&mut opts);
        let opts = &opts;

        match event.action {
            EventAction::Deduct => {
                self.providers
                    .for_each("deduct", |p| async move { p.deduct(opts).await })
                    .await?
            }
            EventAction::Transaction => {
                self.providers
                    .for_each("transaction", |p| async move { p.transaction(opts).await })
                    .await?
            }
            EventAction::Invoice => {
                self.providers
                    .for_each("invoice", |p| async move { p.invoice(opts).await })
                    .await?
            }
            EventAction::SkewsActions | EventAction::QuotaUnpaid => {
                let outcomes = self
                    .providers
                    .collect("audit_unpaid", |p| async move { p.audit_unpaid(opts).await })
                    .await?;
                if outcomes.iter().flatten().any(SkewOutcome::suspended) {
                    info!(
                        account_id = %event.account_id,
                        resource_id = ?opts.assembly_id,
                        "Resource suspended, notifying providers"
                    );
                    self.providers
                        .for_each("suspend", |p| async move { p.suspend(opts).await })
                        .await?
                }
            }
            EventAction::InsufficientFund | EventAction::SkewsWarning => {
                let action = event.action;
                self.providers
                    .for_each("notify", |p| async move { p.notify(action, opts).await })
                    .await?
            }
            _ => return Ok(Dispatch::Ignored),
        }

        Ok(Dispatch::Handled)
    }
}
