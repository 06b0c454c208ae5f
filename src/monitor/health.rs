//! Per-target health state machine.
//!
//! A pure function of the previous consecutive-failure count, the latest
//! probe outcome and the owning customer's thresholds. Alerts are emitted
//! only when the counter first crosses a threshold boundary, never on
//! steady-state repetition.

use crate::store::models::{HealthState, Thresholds};

/// The kind of human-facing notification a transition produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Counter first reached the failure threshold.
    Alert,
    /// Counter first reached the escalation threshold.
    Escalation,
    /// Success after the counter had reached the failure threshold.
    Recovery,
}

/// Result of applying one probe outcome to a target's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub failures: u32,
    pub state: HealthState,
    pub alert: Option<AlertKind>,
}

/// Applies one probe outcome to the previous consecutive-failure count.
///
/// Success resets the counter; a recovery alert fires only if the target
/// had been alerting (counter at or past the failure threshold). Failure
/// advances the counter; an alert fires exactly once when the counter
/// reaches the failure threshold and once more when it reaches the
/// escalation threshold.
pub fn apply_outcome(
    previous_failures: u32,
    success: bool,
    thresholds: &Thresholds,
) -> HealthTransition {
    if success {
        let alert = if previous_failures >= thresholds.failure {
            Some(AlertKind::Recovery)
        } else {
            None
        };
        return HealthTransition {
            failures: 0,
            state: HealthState::Healthy,
            alert,
        };
    }

    let failures = previous_failures.saturating_add(1);
    let alert = if failures == thresholds.failure {
        Some(AlertKind::Alert)
    } else if failures == thresholds.escalation {
        Some(AlertKind::Escalation)
    } else {
        None
    };
    HealthTransition {
        failures,
        state: HealthState::from_failures(failures, thresholds),
        alert,
    }
}
