//! Billing context carried by `bill` events.
//!
//! [`BillOpts`] is built from the raw string fields of a signal with an
//! explicit key table ([`BillOpts::KEYS`]). Keys are matched
//! case-sensitively; anything not in the table is reported back in
//! [`Mapped::ignored`] rather than rejected.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulse_id::{AccountId, ResourceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors produced while mapping or validating billing fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillOptsError {
    /// A field required for the current operation is absent.
    #[error("missing billing field: {0}")]
    MissingField(&'static str),

    /// A recognised field carries a value that does not parse.
    #[error("invalid billing field {field}={value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// A mapped value plus the input keys that were not recognised.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapped<T> {
    pub value: T,
    pub ignored: Vec<String>,
}

/// How a skew was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkewKind {
    /// Pay-as-you-go: driven by the account's credit balance.
    #[default]
    Ondemand,
    /// Prepaid quota: driven by overdue quota invoices.
    Quota,
}

impl SkewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkewKind::Ondemand => "ondemand",
            SkewKind::Quota => "quota",
        }
    }
}

/// Billing context for one deduction or audit cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillOpts {
    pub account_id: Option<AccountId>,
    pub assembly_id: Option<ResourceId>,
    #[serde(default)]
    pub assembly_name: String,
    #[serde(default)]
    pub assemblies_id: String,
    /// Resource category, e.g. `machine` or `container`.
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub consumed: f64,
    #[serde(default)]
    pub currency_type: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub soft_limit: Option<f64>,
    pub hard_limit: Option<f64>,
    pub soft_grace_period: Option<Duration>,
    pub hard_grace_period: Option<Duration>,
    #[serde(default)]
    pub skew_kind: SkewKind,
    #[serde(default)]
    pub quota_id: String,
}

impl BillOpts {
    /// Recognised field names, in mapping order.
    pub const KEYS: [&'static str; 15] = [
        "account_id",
        "assembly_id",
        "assembly_name",
        "assemblies_id",
        "category",
        "consumed",
        "currency_type",
        "start_time",
        "end_time",
        "soft_limit",
        "hard_limit",
        "soft_grace_period",
        "hard_grace_period",
        "skews_type",
        "quota_id",
    ];

    /// Builds billing options from raw signal fields.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Mapped<Self>, BillOptsError> {
        let mut opts = BillOpts::default();
        let mut ignored = Vec::new();

        for (key, value) in fields {
            if !Self::KEYS.contains(&key.as_str()) {
                ignored.push(key.clone());
                continue;
            }
            match key.as_str() {
                "account_id" => {
                    opts.account_id = Some(parse_with("account_id", value, AccountId::parse)?)
                }
                "assembly_id" => {
                    opts.assembly_id = Some(parse_with("assembly_id", value, ResourceId::parse)?)
                }
                "assembly_name" => opts.assembly_name = value.clone(),
                "assemblies_id" => opts.assemblies_id = value.clone(),
                "category" => opts.category = value.clone(),
                "consumed" => opts.consumed = parse_number("consumed", value)?,
                "currency_type" => opts.currency_type = value.clone(),
                "start_time" => opts.start_time = Some(parse_time("start_time", value)?),
                "end_time" => opts.end_time = Some(parse_time("end_time", value)?),
                "soft_limit" => opts.soft_limit = Some(parse_number("soft_limit", value)?),
                "hard_limit" => opts.hard_limit = Some(parse_number("hard_limit", value)?),
                "soft_grace_period" => {
                    opts.soft_grace_period = Some(parse_grace("soft_grace_period", value)?)
                }
                "hard_grace_period" => {
                    opts.hard_grace_period = Some(parse_grace("hard_grace_period", value)?)
                }
                "skews_type" => {
                    opts.skew_kind = match value.as_str() {
                        "ondemand" => SkewKind::Ondemand,
                        "quota" => SkewKind::Quota,
                        other => {
                            return Err(BillOptsError::InvalidField {
                                field: "skews_type",
                                value: other.to_string(),
                                reason: "expected 'ondemand' or 'quota'".to_string(),
                            })
                        }
                    }
                }
                "quota_id" => opts.quota_id = value.clone(),
                other => warn!(key = other, "Billing key has no mapping"),
            }
        }

        Ok(Mapped {
            value: opts,
            ignored,
        })
    }

    /// Inverse of [`BillOpts::from_fields`] for the fields that are set.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            if !v.is_empty() {
                out.insert(k.to_string(), v);
            }
        };
        put(
            "account_id",
            self.account_id.as_ref().map(|a| a.to_string()).unwrap_or_default(),
        );
        put(
            "assembly_id",
            self.assembly_id.as_ref().map(|a| a.to_string()).unwrap_or_default(),
        );
        put("assembly_name", self.assembly_name.clone());
        put("assemblies_id", self.assemblies_id.clone());
        put("category", self.category.clone());
        put("consumed", self.consumed.to_string());
        put("currency_type", self.currency_type.clone());
        put(
            "start_time",
            self.start_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        put(
            "end_time",
            self.end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        put(
            "soft_limit",
            self.soft_limit.map(|v| v.to_string()).unwrap_or_default(),
        );
        put(
            "hard_limit",
            self.hard_limit.map(|v| v.to_string()).unwrap_or_default(),
        );
        put(
            "soft_grace_period",
            self.soft_grace_period
                .map(format_duration)
                .unwrap_or_default(),
        );
        put(
            "hard_grace_period",
            self.hard_grace_period
                .map(format_duration)
                .unwrap_or_default(),
        );
        put("skews_type", self.skew_kind.as_str().to_string());
        put("quota_id", self.quota_id.clone());
        out
    }

    /// The account this cycle bills. Required by every billing operation.
    pub fn account(&self) -> Result<&AccountId, BillOptsError> {
        self.account_id
            .as_ref()
            .ok_or(BillOptsError::MissingField("account_id"))
    }

    /// The billed resource. Required by every skew operation.
    pub fn resource(&self) -> Result<&ResourceId, BillOptsError> {
        self.assembly_id
            .as_ref()
            .ok_or(BillOptsError::MissingField("assembly_id"))
    }

    /// Checks the identity fields every billing operation needs.
    pub fn validate(&self) -> Result<(), BillOptsError> {
        self.account()?;
        self.resource()?;
        Ok(())
    }

    pub fn soft_limit(&self) -> Result<f64, BillOptsError> {
        self.soft_limit
            .ok_or(BillOptsError::MissingField("soft_limit"))
    }

    pub fn hard_limit(&self) -> Result<f64, BillOptsError> {
        self.hard_limit
            .ok_or(BillOptsError::MissingField("hard_limit"))
    }

    pub fn soft_grace(&self) -> Result<Duration, BillOptsError> {
        self.soft_grace_period
            .ok_or(BillOptsError::MissingField("soft_grace_period"))
    }

    pub fn hard_grace(&self) -> Result<Duration, BillOptsError> {
        self.hard_grace_period
            .ok_or(BillOptsError::MissingField("hard_grace_period"))
    }
}

fn parse_with<T, E: std::fmt::Display>(
    field: &'static str,
    value: &str,
    parse: impl FnOnce(String) -> Result<T, E>,
) -> Result<T, BillOptsError> {
    parse(value.to_string()).map_err(|e| BillOptsError::InvalidField {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, BillOptsError> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseFloatError| BillOptsError::InvalidField {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    if !parsed.is_finite() {
        return Err(BillOptsError::InvalidField {
            field,
            value: value.to_string(),
            reason: "not a finite number".to_string(),
        });
    }
    Ok(parsed)
}

fn parse_time(field: &'static str, value: &str) -> Result<DateTime<Utc>, BillOptsError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BillOptsError::InvalidField {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_grace(field: &'static str, value: &str) -> Result<Duration, BillOptsError> {
    parse_duration(value).map_err(|reason| BillOptsError::InvalidField {
        field,
        value: value.to_string(),
        reason,
    })
}

/// Parses `90`, `90s`, `30m`, `48h`, `7d` or concatenations like `1h30m`.
///
/// A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            other => return Err(format!("unknown duration unit '{other}'")),
        };
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("missing amount before '{ch}'"))?;
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| "duration overflows".to_string())?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("trailing number '{digits}' has no unit"));
    }
    Ok(Duration::from_secs(total))
}

/// Renders a duration in the largest whole units, e.g. `3d`, `90m`, `45s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_fields_maps_known_keys() {
        let mapped = BillOpts::from_fields(&fields(&[
            ("account_id", "info@example.com"),
            ("assembly_id", "ASM001"),
            ("consumed", "12.5"),
            ("soft_limit", "50"),
            ("hard_limit", "0"),
            ("soft_grace_period", "72h"),
            ("hard_grace_period", "7d"),
            ("skews_type", "quota"),
            ("start_time", "2024-01-01T00:00:00Z"),
        ]))
        .unwrap();

        let opts = mapped.value;
        assert!(mapped.ignored.is_empty());
        assert_eq!(opts.account().unwrap().as_str(), "info@example.com");
        assert_eq!(opts.consumed, 12.5);
        assert_eq!(opts.soft_limit, Some(50.0));
        assert_eq!(opts.hard_limit, Some(0.0));
        assert_eq!(opts.soft_grace_period, Some(Duration::from_secs(72 * 3600)));
        assert_eq!(opts.hard_grace_period, Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(opts.skew_kind, SkewKind::Quota);
        assert!(opts.start_time.is_some());
    }

    #[test]
    fn test_from_fields_reports_ignored_keys() {
        let mapped = BillOpts::from_fields(&fields(&[
            ("AccountId", "wrong-case"),
            ("account_id", "info@example.com"),
            ("colour", "blue"),
        ]))
        .unwrap();

        assert_eq!(mapped.ignored, vec!["AccountId".to_string(), "colour".to_string()]);
        assert_eq!(
            mapped.value.account_id.unwrap().as_str(),
            "info@example.com"
        );
    }

    #[test]
    fn test_every_listed_key_is_mapped() {
        let sample = |key: &str| match key {
            "account_id" => "info@example.com",
            "assembly_id" => "ASM001",
            "consumed" | "soft_limit" | "hard_limit" => "4",
            "start_time" | "end_time" => "2024-01-01T00:00:00Z",
            "soft_grace_period" | "hard_grace_period" => "1h",
            "skews_type" => "quota",
            _ => "value",
        };
        let all: BTreeMap<String, String> = BillOpts::KEYS
            .iter()
            .map(|&k| (k.to_string(), sample(k).to_string()))
            .collect();

        let mapped = BillOpts::from_fields(&all).unwrap();
        assert!(mapped.ignored.is_empty());
        let back = mapped.value.to_fields();
        for key in BillOpts::KEYS {
            assert!(back.contains_key(key), "{key} was dropped");
        }
    }

    #[test]
    fn test_validate_requires_identity() {
        let opts = BillOpts::default();
        assert_eq!(
            opts.validate(),
            Err(BillOptsError::MissingField("account_id"))
        );

        let opts = BillOpts {
            account_id: Some(AccountId::parse("a@b.c").unwrap()),
            ..Default::default()
        };
        assert_eq!(
            opts.validate(),
            Err(BillOptsError::MissingField("assembly_id"))
        );
    }

    #[test]
    fn test_invalid_skew_type_is_rejected() {
        let err = BillOpts::from_fields(&fields(&[("skews_type", "weekly")])).unwrap_err();
        assert!(matches!(
            err,
            BillOptsError::InvalidField {
                field: "skews_type",
                ..
            }
        ));
    }

    #[test]
    fn test_to_fields_feeds_back_into_from_fields() {
        let original = BillOpts::from_fields(&fields(&[
            ("account_id", "info@example.com"),
            ("assembly_id", "ASM001"),
            ("consumed", "3"),
            ("hard_grace_period", "36h"),
        ]))
        .unwrap()
        .value;

        let again = BillOpts::from_fields(&original.to_fields()).unwrap();
        assert!(again.ignored.is_empty());
        assert_eq!(again.value, original);
    }

    #[rstest]
    #[case("90", 90)]
    #[case("90s", 90)]
    #[case("30m", 1_800)]
    #[case("48h", 172_800)]
    #[case("7d", 604_800)]
    #[case("1h30m", 5_400)]
    fn test_parse_duration(#[case] input: &str, #[case] secs: u64) {
        assert_eq!(parse_duration(input).unwrap(), Duration::from_secs(secs));
    }

    #[rstest]
    #[case("")]
    #[case("h")]
    #[case("10w")]
    #[case("1h30")]
    fn test_parse_duration_rejects(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn test_format_duration_picks_largest_unit() {
        assert_eq!(format_duration(Duration::from_secs(3 * 86_400)), "3d");
        assert_eq!(format_duration(Duration::from_secs(5_400)), "90m");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
    }
}
