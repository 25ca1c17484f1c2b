//! Billing providers ("piggybanks").
//!
//! A provider executes billing operations against one backend. Providers
//! are registered by name in a [`ProviderRegistry`] at startup; the
//! configured allow-list picks which of them actually run.

mod invoicer;
mod ledger;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pulse_events::{AccountData, BillOpts, EventAction};
use tracing::{debug, error, warn};

pub use invoicer::InvoicerProvider;
pub use ledger::LedgerProvider;

use crate::skew::SkewOutcome;

/// One billing backend. Every operation defaults to a no-op.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// A new account signed up.
    async fn onboard(&self, _account: &AccountData) -> Result<()> {
        Ok(())
    }

    /// An account is being removed.
    async fn nuke(&self, _account: &AccountData) -> Result<()> {
        Ok(())
    }

    /// The resource was suspended for non-payment.
    async fn suspend(&self, _opts: &BillOpts) -> Result<()> {
        Ok(())
    }

    async fn deduct(&self, _opts: &BillOpts) -> Result<()> {
        Ok(())
    }

    async fn transaction(&self, _opts: &BillOpts) -> Result<()> {
        Ok(())
    }

    async fn invoice(&self, _opts: &BillOpts) -> Result<()> {
        Ok(())
    }

    async fn notify(&self, _action: EventAction, _opts: &BillOpts) -> Result<()> {
        Ok(())
    }

    /// Runs the skew audit this provider is responsible for, if any.
    async fn audit_unpaid(&self, _opts: &BillOpts) -> Result<Option<SkewOutcome>> {
        Ok(None)
    }
}

/// Stands in for names that are not registered.
pub struct NoopProvider;

#[async_trait]
impl BillingProvider for NoopProvider {
    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Providers by name.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<&'static str, Arc<dyn BillingProvider>>,
    noop: Arc<dyn BillingProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
            noop: Arc::new(NoopProvider),
        }
    }

    /// Registers under `provider.name()`, replacing any previous entry.
    pub fn register(&mut self, provider: Arc<dyn BillingProvider>) {
        let name = provider.name();
        if self.providers.insert(name, provider).is_some() {
            warn!(provider = name, "Provider registered twice, keeping the last");
        }
    }

    /// The named provider, or a no-op one if the name is unknown.
    pub fn get(&self, name: &str) -> Arc<dyn BillingProvider> {
        match self.providers.get(name) {
            Some(provider) => Arc::clone(provider),
            None => {
                warn!(provider = name, "Unknown billing provider");
                Arc::clone(&self.noop)
            }
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }

    /// Registered, allow-listed and self-reportedly enabled providers.
    pub fn enabled(&self, allow: &[String]) -> Vec<Arc<dyn BillingProvider>> {
        allow
            .iter()
            .map(|name| self.get(name))
            .filter(|p| p.name() != NoopProvider.name() && p.is_enabled())
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry plus the allow-list, as used by the watchers.
#[derive(Clone)]
pub struct Providers {
    registry: ProviderRegistry,
    allow: Vec<String>,
}

impl Providers {
    pub fn new(registry: ProviderRegistry, allow: Vec<String>) -> Self {
        Self { registry, allow }
    }

    pub fn enabled(&self) -> Vec<Arc<dyn BillingProvider>> {
        self.registry.enabled(&self.allow)
    }

    /// Runs `op` on every enabled provider. All of them run even if one
    /// fails; the first failure is returned.
    pub async fn for_each<F, Fut>(&self, operation: &'static str, op: F) -> Result<()>
    where
        F: Fn(Arc<dyn BillingProvider>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.collect(operation, op).await.map(|_| ())
    }

    /// [`Providers::for_each`], keeping what each provider returned.
    pub async fn collect<F, Fut, T>(&self, operation: &'static str, op: F) -> Result<Vec<T>>
    where
        F: Fn(Arc<dyn BillingProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut first_err = None;
        let mut results = Vec::new();
        for provider in self.enabled() {
            let name = provider.name();
            match op(provider).await {
                Ok(value) => {
                    debug!(provider = name, operation, "Provider operation done");
                    results.push(value);
                }
                Err(e) => {
                    error!(provider = name, operation, error = %e, "Provider operation failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}
