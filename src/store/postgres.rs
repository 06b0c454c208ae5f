//! Postgres-backed Target Store. All statements are row-granular; the
//! scheduler never needs cross-row transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use super::models::{Customer, DueTarget, HealthState, ProbeOutcome, Target, Thresholds};
use super::{StoreError, TargetStore};

pub struct PgStore {
    pool: PgPool,
    min_interval_seconds: u32,
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: i64,
    chat_id: i64,
    alerts_enabled: bool,
    interval_seconds: i32,
    failure_threshold: i32,
    escalation_threshold: i32,
    created_at: DateTime<Utc>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            chat_id: row.chat_id,
            alerts_enabled: row.alerts_enabled,
            interval_seconds: row.interval_seconds.max(0) as u32,
            thresholds: Thresholds {
                failure: row.failure_threshold.max(0) as u32,
                escalation: row.escalation_threshold.max(0) as u32,
            },
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: i64,
    customer_id: i64,
    name: String,
    ip: String,
    port: i32,
    enabled: bool,
    last_checked_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    health: String,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            id: row.id,
            customer_id: row.customer_id,
            name: row.name,
            ip: row.ip,
            port: row.port.max(0) as u16,
            enabled: row.enabled,
            last_checked_at: row.last_checked_at,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            health: HealthState::parse(&row.health).unwrap_or(HealthState::Healthy),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DueRow {
    id: i64,
    customer_id: i64,
    name: String,
    ip: String,
    port: i32,
    enabled: bool,
    last_checked_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    health: String,
    chat_id: i64,
    failure_threshold: i32,
    escalation_threshold: i32,
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    target_id: i64,
    checked_at: DateTime<Utc>,
    success: bool,
    latency_ms: Option<i64>,
    error: Option<String>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id BIGSERIAL PRIMARY KEY,
    chat_id BIGINT NOT NULL UNIQUE,
    alerts_enabled BOOLEAN NOT NULL DEFAULT TRUE,
    interval_seconds INT NOT NULL,
    failure_threshold INT NOT NULL,
    escalation_threshold INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE TABLE IF NOT EXISTS targets (
    id BIGSERIAL PRIMARY KEY,
    customer_id BIGINT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    ip TEXT NOT NULL,
    port INT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    last_checked_at TIMESTAMPTZ,
    consecutive_failures INT NOT NULL DEFAULT 0,
    health TEXT NOT NULL DEFAULT 'healthy',
    UNIQUE (customer_id, name)
);
CREATE INDEX IF NOT EXISTS idx_targets_enabled ON targets (enabled);
CREATE TABLE IF NOT EXISTS probe_history (
    id BIGSERIAL PRIMARY KEY,
    target_id BIGINT NOT NULL,
    checked_at TIMESTAMPTZ NOT NULL,
    success BOOLEAN NOT NULL,
    latency_ms BIGINT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_probe_history_target
    ON probe_history (target_id, checked_at DESC);
CREATE TABLE IF NOT EXISTS audit_logs (
    id BIGSERIAL PRIMARY KEY,
    actor_chat_id BIGINT NOT NULL,
    action TEXT NOT NULL,
    details TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
"#;

impl PgStore {
    pub fn new(pool: PgPool, min_interval_seconds: u32) -> Self {
        Self { pool, min_interval_seconds }
    }

    /// Creates the tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("database schema initialized");
        Ok(())
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn list_due_targets(&self, now: DateTime<Utc>) -> Result<Vec<DueTarget>, StoreError> {
        let rows = sqlx::query_as::<_, DueRow>(
            r#"
            SELECT t.id, t.customer_id, t.name, t.ip, t.port, t.enabled,
                   t.last_checked_at, t.consecutive_failures, t.health,
                   c.chat_id, c.failure_threshold, c.escalation_threshold
            FROM targets t
            JOIN customers c ON c.id = t.customer_id
            WHERE t.enabled
              AND c.alerts_enabled
              AND (t.last_checked_at IS NULL
                   OR t.last_checked_at
                      <= $1 - make_interval(secs => GREATEST(c.interval_seconds, $2)::double precision))
            "#,
        )
        .bind(now)
        .bind(self.min_interval_seconds as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DueTarget {
                chat_id: row.chat_id,
                thresholds: Thresholds {
                    failure: row.failure_threshold.max(0) as u32,
                    escalation: row.escalation_threshold.max(0) as u32,
                },
                target: Target::from(TargetRow {
                    id: row.id,
                    customer_id: row.customer_id,
                    name: row.name,
                    ip: row.ip,
                    port: row.port,
                    enabled: row.enabled,
                    last_checked_at: row.last_checked_at,
                    consecutive_failures: row.consecutive_failures,
                    health: row.health,
                }),
            })
            .collect())
    }

    async fn get_target(&self, target_id: i64) -> Result<Option<Target>, StoreError> {
        let row = sqlx::query_as::<_, TargetRow>("SELECT * FROM targets WHERE id = $1")
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Target::from))
    }

    async fn record_outcome(&self, outcome: &ProbeOutcome) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO probe_history (target_id, checked_at, success, latency_ms, error)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(outcome.target_id)
        .bind(outcome.checked_at)
        .bind(outcome.success)
        .bind(outcome.latency_ms.map(|l| l as i64))
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_health(
        &self,
        target_id: i64,
        failures: u32,
        state: HealthState,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE targets
             SET consecutive_failures = $2, health = $3, last_checked_at = $4
             WHERE id = $1",
        )
        .bind(target_id)
        .bind(failures as i32)
        .bind(state.as_str())
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TargetNotFound(target_id, String::new()));
        }
        Ok(())
    }

    async fn list_enabled_customers(&self) -> Result<Vec<Customer>, StoreError> {
        let rows = sqlx::query_as::<_, CustomerRow>(
            "SELECT * FROM customers WHERE alerts_enabled ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Customer::from).collect())
    }

    async fn count_enabled_targets(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM targets WHERE enabled")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_customer_by_chat(&self, chat_id: i64) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query_as::<_, CustomerRow>("SELECT * FROM customers WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Customer::from))
    }

    async fn create_customer(
        &self,
        chat_id: i64,
        interval_seconds: u32,
        thresholds: Thresholds,
    ) -> Result<Customer, StoreError> {
        thresholds.validate().map_err(StoreError::InvalidConfig)?;
        if interval_seconds < self.min_interval_seconds {
            return Err(StoreError::InvalidConfig(format!(
                "interval {interval_seconds}s below minimum {}s",
                self.min_interval_seconds
            )));
        }
        let row = sqlx::query_as::<_, CustomerRow>(
            "INSERT INTO customers (chat_id, interval_seconds, failure_threshold, escalation_threshold)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chat_id) DO UPDATE SET chat_id = EXCLUDED.chat_id
             RETURNING *",
        )
        .bind(chat_id)
        .bind(interval_seconds as i32)
        .bind(thresholds.failure as i32)
        .bind(thresholds.escalation as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(Customer::from(row))
    }

    async fn update_thresholds(
        &self,
        chat_id: i64,
        thresholds: Thresholds,
    ) -> Result<(), StoreError> {
        thresholds.validate().map_err(StoreError::InvalidConfig)?;
        let result = sqlx::query(
            "UPDATE customers SET failure_threshold = $2, escalation_threshold = $3
             WHERE chat_id = $1",
        )
        .bind(chat_id)
        .bind(thresholds.failure as i32)
        .bind(thresholds.escalation as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CustomerNotFound(chat_id));
        }
        Ok(())
    }

    async fn set_interval(&self, chat_id: i64, interval_seconds: u32) -> Result<(), StoreError> {
        if interval_seconds < self.min_interval_seconds {
            return Err(StoreError::InvalidConfig(format!(
                "interval {interval_seconds}s below minimum {}s",
                self.min_interval_seconds
            )));
        }
        let result = sqlx::query("UPDATE customers SET interval_seconds = $2 WHERE chat_id = $1")
            .bind(chat_id)
            .bind(interval_seconds as i32)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CustomerNotFound(chat_id));
        }
        Ok(())
    }

    async fn set_alerts_enabled(&self, chat_id: i64, enabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE customers SET alerts_enabled = $2 WHERE chat_id = $1")
            .bind(chat_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CustomerNotFound(chat_id));
        }
        Ok(())
    }

    async fn upsert_target(
        &self,
        customer_id: i64,
        name: &str,
        ip: &str,
        port: u16,
    ) -> Result<Target, StoreError> {
        let row = sqlx::query_as::<_, TargetRow>(
            "INSERT INTO targets (customer_id, name, ip, port)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (customer_id, name)
             DO UPDATE SET ip = EXCLUDED.ip, port = EXCLUDED.port, enabled = TRUE
             RETURNING *",
        )
        .bind(customer_id)
        .bind(name)
        .bind(ip)
        .bind(port as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(Target::from(row))
    }

    async fn set_target_enabled(
        &self,
        customer_id: i64,
        name: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE targets SET enabled = $3 WHERE customer_id = $1 AND name = $2")
                .bind(customer_id)
                .bind(name)
                .bind(enabled)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TargetNotFound(customer_id, name.to_string()));
        }
        Ok(())
    }

    async fn remove_target(&self, customer_id: i64, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM targets WHERE customer_id = $1 AND name = $2")
            .bind(customer_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_customer(&self, chat_id: i64) -> Result<bool, StoreError> {
        // Targets go with the customer via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM customers WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn history(&self, customer_id: i64, limit: u32) -> Result<Vec<ProbeOutcome>, StoreError> {
        let rows = sqlx::query_as::<_, OutcomeRow>(
            "SELECT h.target_id, h.checked_at, h.success, h.latency_ms, h.error
             FROM probe_history h
             JOIN targets t ON t.id = h.target_id
             WHERE t.customer_id = $1
             ORDER BY h.checked_at DESC
             LIMIT $2",
        )
        .bind(customer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ProbeOutcome {
                target_id: row.target_id,
                checked_at: row.checked_at,
                success: row.success,
                latency_ms: row.latency_ms.map(|l| l.max(0) as u64),
                error: row.error,
            })
            .collect())
    }
}
