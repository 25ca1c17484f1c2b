//! The in-process event bus.
//!
//! [`EventManager`] persists every event into the store for its type and
//! pushes a copy to each live subscription whose filter matches.
//!
//! Lock layout: the store table and the subscription table each sit behind
//! their own `RwLock`, and every event type gets its own `Mutex`-guarded
//! store. `add_event` releases the store lock before it touches the
//! subscription table; no path holds two of these locks at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use pulse_id::{WatchId, WatchIdAllocator};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::EventError;
use crate::retention::RetentionConfig;
use crate::store::BoundedTimeStore;
use crate::types::{Event, EventType};
use crate::watch::{Request, Subscription};

/// Event manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retention: RetentionConfig,
    /// Capacity of each subscription's delivery queue.
    pub queue_capacity: usize,
}

impl ManagerConfig {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retention: RetentionConfig::default(),
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct WatchStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct WatchEntry {
    request: Request,
    tx: mpsc::Sender<Event>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl WatchEntry {
    fn stats(&self) -> WatchStats {
        WatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Typed event store plus publish/subscribe fan-out.
pub struct EventManager {
    config: ManagerConfig,
    stores: RwLock<HashMap<EventType, Arc<Mutex<BoundedTimeStore>>>>,
    watchers: RwLock<HashMap<WatchId, WatchEntry>>,
    ids: WatchIdAllocator,
}

impl EventManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            stores: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            ids: WatchIdAllocator::new(),
        }
    }

    /// Stores an event and delivers it to every matching subscription.
    ///
    /// Returns how many subscriptions received it. Delivery never waits: a
    /// subscription whose queue is full misses the event and its `dropped`
    /// counter goes up. A subscription whose receiver is gone is removed.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, action = %event.action))]
    pub async fn add_event(&self, event: Event) -> Result<usize, EventError> {
        if let Some(opts) = event.payload.as_billing() {
            if let Some(account) = &opts.account_id {
                if account != &event.account_id {
                    return Err(EventError::InvalidPayload(format!(
                        "billing account {account} does not match event account {}",
                        event.account_id
                    )));
                }
            }
        }

        let store = self.store_for(event.event_type).await;
        store.lock().await.insert(event.clone(), Utc::now());

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let watchers = self.watchers.read().await;
            for (id, entry) in watchers.iter() {
                if !entry.request.accepts(&event) {
                    continue;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {
                        entry.delivered.fetch_add(1, Ordering::Relaxed);
                        delivered += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        let dropped = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(watch_id = %id, dropped, "Subscription queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut watchers = self.watchers.write().await;
            for id in closed {
                if watchers.remove(&id).is_some() {
                    debug!(watch_id = %id, "Removed subscription with closed receiver");
                }
            }
        }

        Ok(delivered)
    }

    /// Registers a live subscription. Time bounds are not allowed.
    pub async fn watch_events(&self, request: Request) -> Result<Subscription, EventError> {
        if !request.is_live() {
            return Err(EventError::InvalidRequest(
                "live subscriptions cannot have a time window".to_string(),
            ));
        }
        if request.types.is_empty() {
            return Err(EventError::InvalidRequest(
                "subscription must name at least one event type".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = self.ids.allocate();
        self.watchers.write().await.insert(
            id,
            WatchEntry {
                request: request.clone(),
                tx,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
        );

        info!(watch_id = %id, types = ?request.types, "Subscription registered");
        Ok(Subscription::new(id, request, rx))
    }

    /// Historical query across the requested types, ascending by timestamp.
    ///
    /// With `max_results > 0` only the most recent `max_results` events are
    /// returned.
    pub async fn get_events(&self, request: &Request) -> Result<Vec<Event>, EventError> {
        if request.types.is_empty() {
            return Err(EventError::InvalidRequest(
                "query must name at least one event type".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (request.start, request.end) {
            if start > end {
                return Err(EventError::InvalidRequest(format!(
                    "start {start} is after end {end}"
                )));
            }
        }

        let now = Utc::now();
        // The per-store cap is only safe when the store range is already the
        // full predicate.
        let store_limit = if request.account_id.is_some() {
            0
        } else {
            request.max_results
        };

        let mut events = Vec::new();
        for event_type in &request.types {
            let store = {
                let stores = self.stores.read().await;
                stores.get(event_type).cloned()
            };
            let Some(store) = store else {
                continue;
            };
            let found = store
                .lock()
                .await
                .range(request.start, request.end, store_limit, now);
            events.extend(found.into_iter().filter(|e| request.accepts(e)));
        }

        events.sort_by_key(|e| e.timestamp);
        if request.max_results > 0 && events.len() > request.max_results {
            let excess = events.len() - request.max_results;
            events.drain(..excess);
        }
        Ok(events)
    }

    /// Cancels a subscription and closes its queue.
    pub async fn stop_watch(&self, id: WatchId) -> Result<(), EventError> {
        match self.watchers.write().await.remove(&id) {
            Some(entry) => {
                let stats = entry.stats();
                info!(
                    watch_id = %id,
                    delivered = stats.delivered,
                    dropped = stats.dropped,
                    "Subscription stopped"
                );
                Ok(())
            }
            None => {
                warn!(watch_id = %id, "Stop requested for unknown subscription");
                Err(EventError::WatchNotFound(id))
            }
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.watchers.read().await.len()
    }

    pub async fn stats(&self, id: WatchId) -> Option<WatchStats> {
        self.watchers.read().await.get(&id).map(WatchEntry::stats)
    }

    /// Number of stored events per type, after lazy eviction.
    pub async fn store_sizes(&self) -> HashMap<EventType, usize> {
        let stores: Vec<_> = {
            let stores = self.stores.read().await;
            stores.iter().map(|(t, s)| (*t, s.clone())).collect()
        };
        let now = Utc::now();
        let mut sizes = HashMap::new();
        for (event_type, store) in stores {
            let mut store = store.lock().await;
            store.range(None, None, 0, now);
            sizes.insert(event_type, store.len());
        }
        sizes
    }

    async fn store_for(&self, event_type: EventType) -> Arc<Mutex<BoundedTimeStore>> {
        if let Some(store) = self.stores.read().await.get(&event_type) {
            return store.clone();
        }

        let mut stores = self.stores.write().await;
        stores
            .entry(event_type)
            .or_insert_with(|| {
                let policy = self.config.retention.policy_for(event_type);
                debug!(event_type = %event_type, ?policy, "Creating event store");
                Arc::new(Mutex::new(BoundedTimeStore::new(policy)))
            })
            .clone()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_id::AccountId;

    use super::*;
    use crate::types::{EventAction, EventData, EventPayload};

    fn event(event_type: EventType) -> Event {
        Event::new(
            AccountId::parse("info@example.com").unwrap(),
            event_type,
            EventAction::Status,
            EventPayload::Generic(EventData::new()),
        )
    }

    #[tokio::test]
    async fn test_distinct_types_do_not_share_a_store_lock() {
        let manager = EventManager::default();
        manager.add_event(event(EventType::Machine)).await.unwrap();

        let machine = manager.store_for(EventType::Machine).await;
        let _held = machine.lock().await;

        let res = tokio::time::timeout(
            Duration::from_secs(1),
            manager.add_event(event(EventType::Bill)),
        )
        .await;
        assert!(res.is_ok(), "bill insert blocked on the machine store lock");

        let bill = manager.store_for(EventType::Bill).await;
        assert!(!Arc::ptr_eq(&machine, &bill));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let manager = EventManager::new(ManagerConfig {
            queue_capacity: 1,
            ..Default::default()
        });
        let sub = manager
            .watch_events(Request::live([EventType::Machine]))
            .await
            .unwrap();

        assert_eq!(manager.add_event(event(EventType::Machine)).await.unwrap(), 1);
        assert_eq!(manager.add_event(event(EventType::Machine)).await.unwrap(), 0);

        let stats = manager.stats(sub.id()).await.unwrap();
        assert_eq!(stats, WatchStats { delivered: 1, dropped: 1 });
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_unregistered() {
        let manager = EventManager::default();
        let sub = manager
            .watch_events(Request::live([EventType::User]))
            .await
            .unwrap();
        assert_eq!(manager.subscription_count().await, 1);

        drop(sub);
        manager.add_event(event(EventType::User)).await.unwrap();
        assert_eq!(manager.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_mismatched_billing_account_is_rejected() {
        let manager = EventManager::default();
        let data = EventData::new().with("account_id", "other@example.com");
        let payload = EventPayload::from_data(EventAction::Deduct, data).unwrap();
        let e = Event::new(
            AccountId::parse("info@example.com").unwrap(),
            EventType::Bill,
            EventAction::Deduct,
            payload,
        );

        let err = manager.add_event(e).await.unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
        assert!(manager.store_sizes().await.is_empty());
    }
}
