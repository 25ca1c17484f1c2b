//! Bounded, timestamp-ordered event storage.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::retention::RetentionPolicy;
use crate::types::Event;

/// Events of a single type, oldest first.
///
/// Bounded by [`RetentionPolicy`]: anything older than `max_age` relative to
/// the caller's `now`, or beyond `max_count`, is evicted. Eviction runs on
/// every insert and every read; there is no background sweep.
#[derive(Debug)]
pub struct BoundedTimeStore {
    policy: RetentionPolicy,
    events: VecDeque<Event>,
}

impl BoundedTimeStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            events: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Inserts an event keeping timestamp order. Events with equal
    /// timestamps stay in insertion order.
    pub fn insert(&mut self, event: Event, now: DateTime<Utc>) {
        let pos = self
            .events
            .partition_point(|e| e.timestamp <= event.timestamp);
        self.events.insert(pos, event);
        self.evict(now);
    }

    /// Events with `start <= timestamp <= end`, ascending. `None` bounds are
    /// open. A non-zero `limit` keeps only the most recent `limit` matches.
    pub fn range(
        &mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<Event> {
        self.evict(now);

        let lo = match start {
            Some(start) => self.events.partition_point(|e| e.timestamp < start),
            None => 0,
        };
        let hi = match end {
            Some(end) => self.events.partition_point(|e| e.timestamp <= end),
            None => self.events.len(),
        };
        if lo >= hi {
            return Vec::new();
        }

        let lo = if limit > 0 { lo.max(hi - limit.min(hi)) } else { lo };
        self.events.range(lo..hi).cloned().collect()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = chrono::Duration::from_std(self.policy.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            while self
                .events
                .front()
                .is_some_and(|oldest| oldest.timestamp < cutoff)
            {
                self.events.pop_front();
            }
        }

        while self.events.len() > self.policy.max_count {
            self.events.pop_front();
        }
    }
}
