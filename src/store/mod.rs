//! Target Store: customer configuration, target definitions and probe
//! history. The scheduler consumes it through the [`TargetStore`] trait;
//! concrete backends are [`postgres::PgStore`] and [`memory::MemoryStore`].

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use models::{Customer, DueTarget, HealthState, ProbeOutcome, Target, Thresholds};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("customer not found: {0}")]
    CustomerNotFound(i64),
    #[error("target '{1}' not found for customer {0}")]
    TargetNotFound(i64, String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Row-granular access to customers, targets and probe history.
///
/// Configuration invariants (threshold ordering, minimum interval) are
/// rejected here with [`StoreError::InvalidConfig`] and never reach the
/// scheduler.
#[async_trait]
pub trait TargetStore: Send + Sync {
    // --- read path (scheduler) ---

    /// Enabled targets of alert-enabled customers whose check interval has
    /// elapsed at `now`. Intervals are clamped below by the store's
    /// configured minimum.
    async fn list_due_targets(&self, now: DateTime<Utc>) -> Result<Vec<DueTarget>, StoreError>;

    async fn get_target(&self, target_id: i64) -> Result<Option<Target>, StoreError>;

    // --- write path (scheduler is the sole mutator) ---

    /// Appends one probe outcome to history.
    async fn record_outcome(&self, outcome: &ProbeOutcome) -> Result<(), StoreError>;

    /// Stores the post-transition failure counter and derived state, and
    /// advances `last_checked_at`.
    async fn update_health(
        &self,
        target_id: i64,
        failures: u32,
        state: HealthState,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- administrative surface (consumed by external callers) ---

    async fn list_enabled_customers(&self) -> Result<Vec<Customer>, StoreError>;

    async fn count_enabled_targets(&self) -> Result<u64, StoreError>;

    async fn get_customer_by_chat(&self, chat_id: i64) -> Result<Option<Customer>, StoreError>;

    /// Creates a customer with the given settings; idempotent per chat id.
    async fn create_customer(
        &self,
        chat_id: i64,
        interval_seconds: u32,
        thresholds: Thresholds,
    ) -> Result<Customer, StoreError>;

    async fn update_thresholds(
        &self,
        chat_id: i64,
        thresholds: Thresholds,
    ) -> Result<(), StoreError>;

    async fn set_interval(&self, chat_id: i64, interval_seconds: u32) -> Result<(), StoreError>;

    async fn set_alerts_enabled(&self, chat_id: i64, enabled: bool) -> Result<(), StoreError>;

    /// Creates or updates a target keyed by (customer, name); updating
    /// re-enables it.
    async fn upsert_target(
        &self,
        customer_id: i64,
        name: &str,
        ip: &str,
        port: u16,
    ) -> Result<Target, StoreError>;

    async fn set_target_enabled(
        &self,
        customer_id: i64,
        name: &str,
        enabled: bool,
    ) -> Result<(), StoreError>;

    async fn remove_target(&self, customer_id: i64, name: &str) -> Result<bool, StoreError>;

    /// Removes a customer and, by cascade, all their targets.
    async fn remove_customer(&self, chat_id: i64) -> Result<bool, StoreError>;

    /// Most recent probe outcomes for a customer's targets, newest first.
    async fn history(&self, customer_id: i64, limit: u32) -> Result<Vec<ProbeOutcome>, StoreError>;
}
