//! Service assembly: collaborators, providers and the watcher tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use pulse_events::{Event, EventAction, EventManager, EventType};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::memory::{MemoryLedger, MemorySkewStore, RecordingControlPlane, RecordingNotifier};
use crate::backend::{BalanceApi, ControlPlane, InvoiceApi, SkewStore};
use crate::client::{ApiClient, InvoiceClient};
use crate::config::Config;
use crate::notifier::{ApiForwarder, ChatNotifier, MailNotifier, NotifierSet};
use crate::providers::{InvoicerProvider, LedgerProvider, ProviderRegistry, Providers};
use crate::skew::{SkewDefaults, SkewEngine};
use crate::watchers::{
    AddonHandler, BillHandler, EventHandler, HookTable, LifecycleHandler, UserHandler, Watcher,
};

/// External systems the service talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub balances: Arc<dyn BalanceApi>,
    pub store: Arc<dyn SkewStore>,
    pub control: Arc<dyn ControlPlane>,
    pub invoices: Option<Arc<dyn InvoiceApi>>,
    pub notifiers: NotifierSet,
}

impl Collaborators {
    /// In-memory backends. Notices are only logged.
    pub fn in_memory() -> Self {
        Self {
            balances: Arc::new(MemoryLedger::new()),
            store: Arc::new(MemorySkewStore::new()),
            control: Arc::new(RecordingControlPlane::new()),
            invoices: None,
            notifiers: NotifierSet::new().with(Arc::new(RecordingNotifier::new("log"))),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let notifiers = notifiers_from_config(config)?;

        if config.dev_mode {
            info!("Using in-memory backends (dev mode)");
            let mut collaborators = Self::in_memory();
            if !notifiers.is_empty() {
                collaborators.notifiers = notifiers;
            }
            return Ok(collaborators);
        }

        let api = Arc::new(
            ApiClient::new(&config.api_url, config.api_key.clone())
                .context("failed to build billing API client")?,
        );
        let control = Arc::new(
            ApiClient::new(&config.control_url, config.api_key.clone())
                .context("failed to build control plane client")?,
        );
        let invoices = match &config.invoicer {
            Some(invoicer) => Some(Arc::new(
                InvoiceClient::new(&invoicer.url, invoicer.api_key.clone())
                    .context("failed to build invoicer client")?,
            ) as Arc<dyn InvoiceApi>),
            None => None,
        };
        if notifiers.is_empty() {
            warn!("No notice channels configured; notices will be dropped");
        }

        Ok(Self {
            balances: api.clone(),
            store: api,
            control,
            invoices,
            notifiers,
        })
    }
}

fn notifiers_from_config(config: &Config) -> Result<NotifierSet> {
    let mut set = NotifierSet::new();
    if let Some(mail) = &config.mail {
        set = set.with(Arc::new(
            MailNotifier::new(&mail.url, mail.api_key.clone(), &mail.from)
                .context("failed to build mail notifier")?,
        ));
    }
    if let Some(webhook) = &config.chat_webhook {
        set = set.with(Arc::new(
            ChatNotifier::new(webhook).context("failed to build chat notifier")?,
        ));
    }
    if let Some(url) = &config.forward_url {
        set = set.with(Arc::new(
            ApiForwarder::new(url).context("failed to build api forwarder")?,
        ));
    }
    Ok(set)
}

/// Everything the watchers need, built once at startup.
pub struct BillingService {
    providers: Providers,
    notifiers: NotifierSet,
    defaults: SkewDefaults,
}

impl BillingService {
    pub fn new(collaborators: Collaborators, piggybanks: Vec<String>, defaults: SkewDefaults) -> Self {
        let engine = Arc::new(SkewEngine::new(
            collaborators.balances.clone(),
            collaborators.store.clone(),
            collaborators.control.clone(),
            collaborators.notifiers.clone(),
        ));

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(LedgerProvider::new(
            collaborators.balances,
            engine.clone(),
            collaborators.notifiers.clone(),
        )));
        registry.register(Arc::new(InvoicerProvider::new(collaborators.invoices, engine)));

        Self {
            providers: Providers::new(registry, piggybanks),
            notifiers: collaborators.notifiers,
            defaults,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(config)?;
        Ok(Self::new(
            collaborators,
            config.piggybanks.clone(),
            config.skew_defaults,
        ))
    }

    /// Names of the providers that will actually run.
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.enabled().iter().map(|p| p.name()).collect()
    }

    pub fn notifier_names(&self) -> Vec<&'static str> {
        self.notifiers.names()
    }

    /// Subscribes every watcher, then spawns one task per watcher.
    ///
    /// All subscriptions exist by the time this returns, so events added
    /// afterwards reach every watcher.
    pub async fn start(
        &self,
        manager: Arc<EventManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        handles.push(
            spawn_watcher(
                Watcher::new(LifecycleHandler::machine(self.notifiers.clone())),
                &manager,
                &shutdown,
            )
            .await?,
        );
        handles.push(
            spawn_watcher(
                Watcher::new(LifecycleHandler::container(self.notifiers.clone())),
                &manager,
                &shutdown,
            )
            .await?,
        );
        handles.push(
            spawn_watcher(
                Watcher::new(BillHandler::new(self.providers.clone(), self.defaults))
                    .with_hooks(bill_hooks(&manager)),
                &manager,
                &shutdown,
            )
            .await?,
        );
        handles.push(
            spawn_watcher(
                Watcher::new(UserHandler::new(self.notifiers.clone())),
                &manager,
                &shutdown,
            )
            .await?,
        );
        handles.push(
            spawn_watcher(
                Watcher::new(AddonHandler::new(self.providers.clone())),
                &manager,
                &shutdown,
            )
            .await?,
        );

        info!(
            watchers = handles.len(),
            providers = ?self.provider_names(),
            notifiers = ?self.notifier_names(),
            "Watchers started"
        );
        Ok(handles)
    }
}

async fn spawn_watcher<H>(
    watcher: Watcher<H>,
    manager: &Arc<EventManager>,
    shutdown: &watch::Receiver<bool>,
) -> Result<JoinHandle<()>>
where
    H: EventHandler + 'static,
{
    let subscription = watcher
        .subscribe(manager)
        .await
        .with_context(|| format!("failed to subscribe {} watcher", watcher.name()))?;
    Ok(tokio::spawn(watcher.run(
        Arc::clone(manager),
        subscription,
        shutdown.clone(),
    )))
}

/// A deduction is followed by an audit of the same resource.
fn bill_hooks(manager: &Arc<EventManager>) -> HookTable {
    let mut hooks = HookTable::new();
    let manager = Arc::clone(manager);
    hooks.on(
        EventAction::Deduct,
        Arc::new(move |event: &Event| {
            let audit = Event::new(
                event.account_id.clone(),
                EventType::Bill,
                EventAction::SkewsActions,
                event.payload.clone(),
            );
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                if let Err(e) = manager.add_event(audit).await {
                    warn!(error = %e, "Failed to queue audit after deduction");
                }
            });
        }),
    );
    hooks
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_events::{EventData, EventPayload};
    use pulse_id::AccountId;

    use super::*;

    fn account() -> AccountId {
        AccountId::parse("info@example.com").unwrap()
    }

    #[tokio::test]
    async fn test_start_subscribes_every_watcher() {
        let manager = Arc::new(EventManager::default());
        let service = BillingService::new(
            Collaborators::in_memory(),
            vec!["ledger".to_string()],
            SkewDefaults::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = service.start(Arc::clone(&manager), shutdown_rx).await.unwrap();
        assert_eq!(handles.len(), 5);
        assert_eq!(manager.subscription_count().await, 5);
        assert_eq!(service.provider_names(), vec!["ledger"]);
        assert_eq!(service.notifier_names(), vec!["log"]);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(manager.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_invoicer_without_url_is_not_enabled() {
        let service = BillingService::new(
            Collaborators::in_memory(),
            vec!["ledger".to_string(), "invoicer".to_string()],
            SkewDefaults::default(),
        );
        assert_eq!(service.provider_names(), vec!["ledger"]);
    }

    #[tokio::test]
    async fn test_deduct_queues_an_audit() {
        let manager = Arc::new(EventManager::default());
        let hooks = bill_hooks(&manager);
        let payload = EventPayload::from_data(
            EventAction::Deduct,
            EventData::new().with("assembly_id", "ASM001").with("consumed", "1"),
        )
        .unwrap();
        let deduct = Event::new(account(), EventType::Bill, EventAction::Deduct, payload);

        assert_eq!(hooks.run(&deduct), 1);

        let request = pulse_events::Request::live([EventType::Bill]);
        let found = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let events = manager.get_events(&request).await.unwrap();
                if !events.is_empty() {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(found[0].action, EventAction::SkewsActions);
        assert_eq!(found[0].payload, deduct.payload);
    }
}
