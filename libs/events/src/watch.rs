//! Subscription filters and live delivery queues.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use pulse_id::{AccountId, WatchId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::types::{Event, EventType};

/// Which events a subscription or query wants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    /// Inclusive lower bound; `None` is unbounded.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound; `None` is unbounded.
    pub end: Option<DateTime<Utc>>,
    pub types: BTreeSet<EventType>,
    /// Result cap for historical queries; 0 means no cap.
    pub max_results: usize,
    /// Restrict to one account.
    pub account_id: Option<AccountId>,
}

impl Request {
    /// An unbounded request for the given types.
    pub fn live(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    #[must_use]
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    #[must_use]
    pub fn between(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.since(start).until(end)
    }

    #[must_use]
    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    #[must_use]
    pub fn for_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// True when neither time bound is set.
    pub fn is_live(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Full filter: type, account and time window.
    pub fn accepts(&self, event: &Event) -> bool {
        if !self.types.contains(&event.event_type) {
            return false;
        }
        if let Some(account) = &self.account_id {
            if account != &event.account_id {
                return false;
            }
        }
        if self.start.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        true
    }
}

/// A live subscription returned by
/// [`EventManager::watch_events`](crate::EventManager::watch_events).
///
/// The queue closes after [`EventManager::stop_watch`](crate::EventManager::stop_watch);
/// `recv` then drains what is buffered and returns `None`.
#[derive(Debug)]
pub struct Subscription {
    id: WatchId,
    request: Request,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(id: WatchId, request: Request, rx: mpsc::Receiver<Event>) -> Self {
        Self { id, request, rx }
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::{EventAction, EventData, EventPayload};

    fn event(account: &str, event_type: EventType, secs: i64) -> Event {
        Event::new(
            AccountId::parse(account).unwrap(),
            event_type,
            EventAction::Deduct,
            EventPayload::Generic(EventData::new()),
        )
        .at(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn test_accepts_filters_type_and_account() {
        let req = Request::live([EventType::Bill])
            .for_account(AccountId::parse("a@example.com").unwrap());

        assert!(req.accepts(&event("a@example.com", EventType::Bill, 1)));
        assert!(!req.accepts(&event("b@example.com", EventType::Bill, 1)));
        assert!(!req.accepts(&event("a@example.com", EventType::User, 1)));
    }

    #[test]
    fn test_accepts_window_is_inclusive() {
        let req = Request::live([EventType::Bill]).between(
            Utc.timestamp_opt(10, 0).unwrap(),
            Utc.timestamp_opt(20, 0).unwrap(),
        );
        assert!(!req.is_live());
        assert!(req.accepts(&event("a@example.com", EventType::Bill, 10)));
        assert!(req.accepts(&event("a@example.com", EventType::Bill, 20)));
        assert!(!req.accepts(&event("a@example.com", EventType::Bill, 21)));
        assert!(!req.accepts(&event("a@example.com", EventType::Bill, 9)));
    }
}
