use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alerting thresholds owned by a customer, measured in consecutive
/// failed probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub failure: u32,
    pub escalation: u32,
}

impl Thresholds {
    /// A valid configuration satisfies `escalation > failure > 0`.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure == 0 {
            return Err("failure threshold must be greater than zero".to_string());
        }
        if self.escalation <= self.failure {
            return Err(format!(
                "escalation threshold ({}) must be greater than failure threshold ({})",
                self.escalation, self.failure
            ));
        }
        Ok(())
    }
}

/// Per-target health derived from the consecutive-failure counter.
/// The counter is the source of truth; this enum is a pure function of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Alerting,
    Escalated,
}

impl HealthState {
    pub fn from_failures(failures: u32, thresholds: &Thresholds) -> Self {
        if failures == 0 {
            HealthState::Healthy
        } else if failures < thresholds.failure {
            HealthState::Degraded
        } else if failures < thresholds.escalation {
            HealthState::Alerting
        } else {
            HealthState::Escalated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Alerting => "alerting",
            HealthState::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(HealthState::Healthy),
            "degraded" => Some(HealthState::Degraded),
            "alerting" => Some(HealthState::Alerting),
            "escalated" => Some(HealthState::Escalated),
            _ => None,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Customer configuration scope. One customer owns zero or more targets and
/// carries the thresholds and check interval applied to all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: i64,
    /// Recipient identity for alerts (Telegram chat id).
    pub chat_id: i64,
    pub alerts_enabled: bool,
    pub interval_seconds: u32,
    pub thresholds: Thresholds,
    pub created_at: DateTime<Utc>,
}

/// A single `ip:port` endpoint under TCP monitoring, unique per
/// (customer, name).
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: i64,
    pub customer_id: i64,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub health: HealthState,
}

/// A target due for probing, joined with the owning customer's
/// alerting configuration.
#[derive(Debug, Clone)]
pub struct DueTarget {
    pub target: Target,
    pub chat_id: i64,
    pub thresholds: Thresholds,
}

/// Immutable record of one probe. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub target_id: i64,
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Immutable record of an administrative or alert-worthy action.
/// `actor_chat_id` of zero marks system actions.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub actor_chat_id: i64,
    pub action: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn system(action: &str, details: impl Into<String>) -> Self {
        Self {
            actor_chat_id: 0,
            action: action.to_string(),
            details: details.into(),
            created_at: Utc::now(),
        }
    }
}
