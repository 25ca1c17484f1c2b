//! Configuration for the billing service.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use pulse_events::{parse_duration, ManagerConfig, RetentionConfig, RetentionPolicy};

use crate::skew::SkewDefaults;

/// Mail channel settings. Present only when `PULSE_MAIL_URL` is set.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub from: String,
}

/// Invoicing backend settings. Present only when `PULSE_INVOICER_URL` is set.
#[derive(Debug, Clone)]
pub struct InvoicerConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Use in-memory collaborators instead of the HTTP APIs.
    pub dev_mode: bool,

    pub api_url: String,
    pub api_key: Option<String>,
    pub control_url: String,

    /// Enabled billing providers, by name.
    pub piggybanks: Vec<String>,
    pub invoicer: Option<InvoicerConfig>,

    pub mail: Option<MailConfig>,
    pub chat_webhook: Option<String>,
    pub forward_url: Option<String>,

    pub events: ManagerConfig,
    pub skew_defaults: SkewDefaults,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

fn duration(name: &str, default: Duration) -> Result<Duration> {
    match var(name) {
        Some(raw) => parse_duration(&raw)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("{name} has an invalid duration: {raw:?}")),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = parsed("PULSE_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 7777)))?;

        let log_level = var("PULSE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = var("PULSE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let api_url = var("PULSE_API_URL").unwrap_or_else(|| "http://127.0.0.1:9000".to_string());
        let api_key = var("PULSE_API_KEY");
        let control_url = var("PULSE_CONTROL_URL").unwrap_or_else(|| api_url.clone());

        let piggybanks = var("PULSE_PIGGYBANKS")
            .unwrap_or_else(|| "ledger".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let invoicer = var("PULSE_INVOICER_URL").map(|url| InvoicerConfig {
            url,
            api_key: var("PULSE_INVOICER_KEY"),
        });

        let mail = var("PULSE_MAIL_URL").map(|url| MailConfig {
            url,
            api_key: var("PULSE_MAIL_KEY"),
            from: var("PULSE_MAIL_FROM").unwrap_or_else(|| "billing@localhost".to_string()),
        });

        let default_policy = RetentionPolicy::new(
            Duration::from_secs(parsed(
                "PULSE_EVENT_MAX_AGE_SECS",
                RetentionPolicy::DEFAULT_MAX_AGE.as_secs(),
            )?),
            parsed("PULSE_EVENT_MAX_COUNT", RetentionPolicy::DEFAULT_MAX_COUNT)?,
        );
        let mut retention = RetentionConfig::new(default_policy);
        if let Some(raw) = var("PULSE_EVENT_RETENTION") {
            retention.overrides = RetentionConfig::parse_overrides(&raw)
                .context("PULSE_EVENT_RETENTION is invalid")?;
        }
        let events = ManagerConfig {
            retention,
            queue_capacity: parsed("PULSE_QUEUE_CAPACITY", ManagerConfig::DEFAULT_QUEUE_CAPACITY)?,
        };

        let fallback = SkewDefaults::default();
        let skew_defaults = SkewDefaults {
            soft_limit: parsed("PULSE_SKEW_SOFT_LIMIT", fallback.soft_limit)?,
            hard_limit: parsed("PULSE_SKEW_HARD_LIMIT", fallback.hard_limit)?,
            soft_grace: duration("PULSE_SKEW_SOFT_GRACE", fallback.soft_grace)?,
            hard_grace: duration("PULSE_SKEW_HARD_GRACE", fallback.hard_grace)?,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            api_url,
            api_key,
            control_url,
            piggybanks,
            invoicer,
            mail,
            chat_webhook: var("PULSE_CHAT_WEBHOOK"),
            forward_url: var("PULSE_FORWARD_URL"),
            events,
            skew_defaults,
        })
    }
}
