//! Audit/history sink: fire-and-forget recording of alert-worthy and
//! administrative actions. Sink failures are logged, never propagated.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Mutex;
use tracing::{error, info};

use crate::store::models::AuditEvent;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Emits audit events as structured log lines only.
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            actor = event.actor_chat_id,
            action = %event.action,
            details = %event.details,
            "audit"
        );
    }
}

/// Persists audit events to the `audit_logs` table.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: AuditEvent) {
        let result = sqlx::query(
            "INSERT INTO audit_logs (actor_chat_id, action, details, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.actor_chat_id)
        .bind(&event.action)
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            error!(error = %e, action = %event.action, "failed to persist audit event");
        }
    }
}

/// Collects events in memory; used by tests to assert what was recorded.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
