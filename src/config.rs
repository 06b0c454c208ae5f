//! Process configuration: a TOML file with environment overrides for
//! secrets, loaded once at startup, validated, and threaded through
//! constructors. Nothing here mutates at runtime.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::delivery::QueueConfig;
use crate::store::models::Thresholds;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Postgres connection string; `DATABASE_URL` overrides.
    pub database_url: String,
    /// Bot token for the notification transport; `TELEGRAM_TOKEN` overrides.
    pub telegram_token: String,
    /// Recipients of system-level alerts (benchmark breaches).
    pub admin_chat_ids: Vec<i64>,
    pub monitor: MonitorConfig,
    pub delivery: DeliveryConfig,
    pub benchmark: BenchmarkConfig,
    pub customer_defaults: CustomerDefaults,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_seconds: u64,
    pub max_concurrent_probes: usize,
    pub probe_timeout_seconds: u64,
    /// Lower bound applied to every customer's check interval.
    pub min_interval_seconds: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            max_concurrent_probes: 50,
            probe_timeout_seconds: 10,
            min_interval_seconds: 20,
        }
    }
}

impl MonitorConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DeliveryConfig {
    pub workers: usize,
    pub capacity: usize,
    pub per_recipient_spacing_ms: u64,
    pub global_rate_per_sec: f64,
    pub global_burst: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_seconds: u64,
    pub send_timeout_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            capacity: 1000,
            per_recipient_spacing_ms: 1000,
            global_rate_per_sec: 30.0,
            global_burst: 30,
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_seconds: 60,
            send_timeout_seconds: 10,
        }
    }
}

impl DeliveryConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            workers: self.workers,
            capacity: self.capacity,
            per_recipient_spacing: Duration::from_millis(self.per_recipient_spacing_ms),
            global_rate_per_sec: self.global_rate_per_sec,
            global_burst: self.global_burst,
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_seconds),
            send_timeout: Duration::from_secs(self.send_timeout_seconds),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub enabled: bool,
    /// Latency-series endpoint; empty disables the benchmark monitor.
    pub url: String,
    pub target_name: String,
    pub threshold_seconds: f64,
    pub poll_interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            target_name: "turtlebp".to_string(),
            threshold_seconds: 0.35,
            poll_interval_seconds: 300,
            timeout_seconds: 10,
        }
    }
}

/// Settings applied when a customer record is first created.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CustomerDefaults {
    pub interval_seconds: u32,
    pub failure_threshold: u32,
    pub escalation_threshold: u32,
}

impl Default for CustomerDefaults {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            failure_threshold: 3,
            escalation_threshold: 5,
        }
    }
}

impl CustomerDefaults {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            failure: self.failure_threshold,
            escalation: self.escalation_threshold,
        }
    }
}

impl AppConfig {
    /// Loads from a TOML file (missing file means all defaults), applies
    /// environment overrides for secrets, and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: AppConfig = if path.exists() {
            toml::from_str(&std::fs::read_to_string(path)?)?
        } else {
            AppConfig::default()
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(token) = std::env::var("TELEGRAM_TOKEN") {
            config.telegram_token = token;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.customer_defaults
            .thresholds()
            .validate()
            .map_err(ConfigError::Invalid)?;
        if self.monitor.tick_seconds == 0 {
            return Err(ConfigError::Invalid("monitor.tick_seconds must be positive".into()));
        }
        if self.monitor.max_concurrent_probes == 0 {
            return Err(ConfigError::Invalid(
                "monitor.max_concurrent_probes must be positive".into(),
            ));
        }
        if self.monitor.probe_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "monitor.probe_timeout_seconds must be positive".into(),
            ));
        }
        if self.delivery.workers == 0 || self.delivery.capacity == 0 {
            return Err(ConfigError::Invalid(
                "delivery.workers and delivery.capacity must be positive".into(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Invalid("delivery.max_attempts must be positive".into()));
        }
        if self.delivery.global_rate_per_sec <= 0.0 {
            return Err(ConfigError::Invalid(
                "delivery.global_rate_per_sec must be positive".into(),
            ));
        }
        Ok(())
    }
}
