//! Retention limits for the per-type event stores.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::EventError;
use crate::types::EventType;

/// How long, and how many, events of one type are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

impl RetentionPolicy {
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT_MAX_COUNT: usize = 100_000;

    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self { max_age, max_count }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_AGE, Self::DEFAULT_MAX_COUNT)
    }
}

/// Default policy plus per-type overrides.
#[derive(Debug, Clone, Default)]
pub struct RetentionConfig {
    pub default: RetentionPolicy,
    pub overrides: HashMap<EventType, RetentionPolicy>,
}

impl RetentionConfig {
    pub fn new(default: RetentionPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, event_type: EventType, policy: RetentionPolicy) -> Self {
        self.overrides.insert(event_type, policy);
        self
    }

    pub fn policy_for(&self, event_type: EventType) -> RetentionPolicy {
        self.overrides
            .get(&event_type)
            .copied()
            .unwrap_or(self.default)
    }

    /// Parses overrides of the form `bill=3600:500,machine=600:50`
    /// (`type=max_age_secs:max_count`). Blank input yields no overrides.
    pub fn parse_overrides(raw: &str) -> Result<HashMap<EventType, RetentionPolicy>, EventError> {
        let mut out = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = |reason: &str| EventError::InvalidRetention(format!("{entry}: {reason}"));

            let (name, limits) = entry
                .split_once('=')
                .ok_or_else(|| invalid("expected type=age:count"))?;
            let event_type: EventType = name
                .trim()
                .parse()
                .map_err(|_| invalid("unknown event type"))?;
            let (age, count) = limits
                .split_once(':')
                .ok_or_else(|| invalid("expected age:count"))?;
            let age: u64 = age
                .trim()
                .parse()
                .map_err(|_| invalid("max age is not a number of seconds"))?;
            let count: usize = count
                .trim()
                .parse()
                .map_err(|_| invalid("max count is not a number"))?;
            if count == 0 {
                return Err(invalid("max count must be positive"));
            }

            out.insert(
                event_type,
                RetentionPolicy::new(Duration::from_secs(age), count),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_for_falls_back_to_default() {
        let config = RetentionConfig::default().with_override(
            EventType::Bill,
            RetentionPolicy::new(Duration::from_secs(60), 10),
        );

        assert_eq!(config.policy_for(EventType::Bill).max_count, 10);
        assert_eq!(
            config.policy_for(EventType::Machine),
            RetentionPolicy::default()
        );
    }

    #[test]
    fn test_parse_overrides() {
        let parsed = RetentionConfig::parse_overrides("bill=3600:500, machine = 600:50").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[&EventType::Bill],
            RetentionPolicy::new(Duration::from_secs(3600), 500)
        );
        assert_eq!(parsed[&EventType::Machine].max_count, 50);
        assert!(RetentionConfig::parse_overrides("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_overrides_rejects_garbage() {
        for bad in ["bill", "bill=3600", "invoice=1:1", "bill=x:1", "bill=1:0"] {
            let err = RetentionConfig::parse_overrides(bad).unwrap_err();
            assert!(matches!(err, EventError::InvalidRetention(_)), "{bad}");
        }
    }
}
