//! Provider backed by an external invoicing system.
//!
//! Usage is pushed as billable items and invoiced by the backend. Quota
//! skews are driven by whether the client has overdue invoices.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{AccountData, BillOpts, SkewKind};
use tracing::{debug, info};

use super::BillingProvider;
use crate::backend::{BillableItem, InvoiceApi};
use crate::skew::{SkewEngine, SkewOutcome};

pub struct InvoicerProvider {
    api: Option<Arc<dyn InvoiceApi>>,
    engine: Arc<SkewEngine>,
}

impl InvoicerProvider {
    pub const NAME: &'static str = "invoicer";

    /// `api` is `None` when no invoicing backend is configured; the provider
    /// then reports itself disabled.
    pub fn new(api: Option<Arc<dyn InvoiceApi>>, engine: Arc<SkewEngine>) -> Self {
        Self { api, engine }
    }

    fn api(&self) -> Result<&Arc<dyn InvoiceApi>> {
        self.api
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("invoicing backend is not configured"))
    }
}

#[async_trait]
impl BillingProvider for InvoicerProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self) -> bool {
        self.api.is_some()
    }

    async fn onboard(&self, account: &AccountData) -> Result<()> {
        self.api()?.create_client(account).await?;
        info!(email = %account.email, "Invoicing client created");
        Ok(())
    }

    async fn nuke(&self, account: &AccountData) -> Result<()> {
        self.api()?.close_client(&account.email).await?;
        info!(email = %account.email, "Invoicing client closed");
        Ok(())
    }

    async fn suspend(&self, opts: &BillOpts) -> Result<()> {
        let resource = opts.resource()?;
        self.api()?
            .suspend_service(opts.account()?, resource)
            .await?;
        info!(resource_id = %resource, "Invoicing service suspended");
        Ok(())
    }

    async fn deduct(&self, opts: &BillOpts) -> Result<()> {
        let resource = opts.resource()?;
        let description = if opts.assembly_name.is_empty() {
            format!("{} usage", resource)
        } else {
            format!("{} usage", opts.assembly_name)
        };
        let item = BillableItem {
            account_id: opts.account()?.clone(),
            resource_id: resource.clone(),
            description,
            amount: opts.consumed,
            currency_type: opts.currency_type.clone(),
        };
        self.api()?.add_billable_item(&item).await
    }

    async fn invoice(&self, opts: &BillOpts) -> Result<()> {
        let invoice = self.api()?.create_invoice(opts.account()?).await?;
        info!(
            account_id = ?opts.account_id,
            invoice_id = %invoice.id,
            amount = invoice.amount,
            "Invoice created"
        );
        Ok(())
    }

    async fn audit_unpaid(&self, opts: &BillOpts) -> Result<Option<SkewOutcome>> {
        if opts.skew_kind != SkewKind::Quota {
            debug!("On-demand skew, left to the ledger");
            return Ok(None);
        }

        let overdue = self.api()?.overdue_invoices(opts.account()?).await?;
        let outcome = if overdue.is_empty() {
            self.engine.deactive_events(opts).await?
        } else {
            info!(
                account_id = ?opts.account_id,
                overdue = overdue.len(),
                "Overdue invoices found"
            );
            self.engine.skews_quota_unpaid(opts).await?
        };
        debug!(outcome = ?outcome, "Quota audit finished");
        Ok(Some(outcome))
    }
}
