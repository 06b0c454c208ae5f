//! Monitoring scheduler: decides which targets are due each tick, runs
//! their probes under a global concurrency bound, applies the health state
//! machine and hands alerts to the delivery queue.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::delivery::{DeliveryQueue, Enqueue};
use crate::monitor::health::{apply_outcome, AlertKind};
use crate::monitor::probe::{ProbeReport, Prober};
use crate::store::models::{AuditEvent, DueTarget, ProbeOutcome, Target};
use crate::store::TargetStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll period of the due-set loop.
    pub tick: Duration,
    pub probe_timeout: Duration,
    /// Cap on simultaneously in-flight probes across all targets.
    pub max_concurrent_probes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(10),
            max_concurrent_probes: 50,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn TargetStore>,
    prober: Arc<dyn Prober>,
    queue: DeliveryQueue,
    audit: Arc<dyn AuditSink>,
    permits: Arc<Semaphore>,
    /// Target ids with a probe in flight. A due target already present here
    /// is skipped, never probed twice concurrently.
    in_flight: Arc<DashMap<i64, ()>>,
    cfg: SchedulerConfig,
    /// Wall-clock anchor paired with a monotonic instant, so scheduling
    /// decisions follow the runtime clock rather than raw system time.
    wall_base: DateTime<Utc>,
    instant_base: Instant,
}

/// Removes the target id from the in-flight set on every exit path.
struct InFlightGuard {
    map: Arc<DashMap<i64, ()>>,
    target_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.target_id);
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TargetStore>,
        prober: Arc<dyn Prober>,
        queue: DeliveryQueue,
        audit: Arc<dyn AuditSink>,
        cfg: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            prober,
            queue,
            audit,
            permits: Arc::new(Semaphore::new(cfg.max_concurrent_probes)),
            in_flight: Arc::new(DashMap::new()),
            cfg,
            wall_base: Utc::now(),
            instant_base: Instant::now(),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall_base
            + chrono::Duration::from_std(self.instant_base.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// The main loop. Runs until the shutdown signal flips to `true`; a
    /// failed cycle is logged and retried next tick, never fatal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.cfg.tick.as_millis() as u64,
            max_concurrent = self.cfg.max_concurrent_probes,
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.cfg.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.tick().await;
        }
        info!("scheduler stopped");
    }

    async fn tick(self: &Arc<Self>) {
        let due = match self.store.list_due_targets(self.now()).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to compute due set, retrying next tick");
                return;
            }
        };
        for item in due {
            let target_id = item.target.id;
            if self.in_flight.contains_key(&target_id) {
                debug!(
                    target_id,
                    target_name = %item.target.name,
                    "probe still in flight, skipping tick"
                );
                continue;
            }
            self.in_flight.insert(target_id, ());
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = InFlightGuard {
                    map: Arc::clone(&scheduler.in_flight),
                    target_id,
                };
                scheduler.check_target(item).await;
            });
        }
    }

    async fn check_target(&self, due: DueTarget) {
        let target_id = due.target.id;
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let report = self
            .prober
            .probe(&due.target.ip, due.target.port, self.cfg.probe_timeout)
            .await;
        drop(permit);

        let checked_at = self.now();
        let outcome = ProbeOutcome {
            target_id,
            checked_at,
            success: report.success,
            latency_ms: report.latency_ms(),
            error: report.error_detail(),
        };
        if let Err(e) = self.store.record_outcome(&outcome).await {
            warn!(target_id, error = %e, "failed to record probe outcome");
        }

        // Re-read the target before applying the transition: a disable or
        // removal that landed while the probe was in flight must win, and
        // the failure counter must be the freshest persisted value.
        let fresh = match self.store.get_target(target_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!(target_id, "target removed mid-flight, discarding outcome");
                return;
            }
            Err(e) => {
                // Bookkeeping failed, not the endpoint: leave the counter
                // and last-checked untouched so the target is due again.
                warn!(target_id, error = %e, "probe bookkeeping failed, retrying next tick");
                return;
            }
        };
        if !fresh.enabled {
            debug!(target_id, "target disabled mid-flight, discarding outcome");
            return;
        }

        let transition = apply_outcome(fresh.consecutive_failures, report.success, &due.thresholds);
        if let Err(e) = self
            .store
            .update_health(target_id, transition.failures, transition.state, checked_at)
            .await
        {
            warn!(target_id, error = %e, "failed to persist health transition");
            return;
        }

        if let Some(kind) = transition.alert {
            self.dispatch_alert(kind, &due, &fresh, &report, transition.failures)
                .await;
        }
    }

    async fn dispatch_alert(
        &self,
        kind: AlertKind,
        due: &DueTarget,
        target: &Target,
        report: &ProbeReport,
        failures: u32,
    ) {
        let text = alert_text(kind, target, report, failures);
        match self.queue.enqueue(due.chat_id, text) {
            Enqueue::Accepted => {
                info!(
                    chat_id = due.chat_id,
                    target_name = %target.name,
                    kind = ?kind,
                    failures,
                    "alert enqueued"
                );
            }
            Enqueue::Dropped(reason) => {
                warn!(
                    chat_id = due.chat_id,
                    target_name = %target.name,
                    kind = ?kind,
                    reason = ?reason,
                    "alert dropped by delivery queue"
                );
            }
        }
        self.audit
            .record(AuditEvent::system(
                alert_action(kind),
                format!(
                    "{} {}:{} failures={}",
                    target.name, target.ip, target.port, failures
                ),
            ))
            .await;
    }
}

fn alert_action(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::Alert => "target_alert",
        AlertKind::Escalation => "target_escalation",
        AlertKind::Recovery => "target_recovery",
    }
}

fn alert_text(kind: AlertKind, target: &Target, report: &ProbeReport, failures: u32) -> String {
    match kind {
        AlertKind::Alert => format!(
            "🔴 ALERT: {} is DOWN\nTarget: {}:{}\nConsecutive failures: {}\nError: {}",
            target.name,
            target.ip,
            target.port,
            failures,
            report.error_detail().unwrap_or_else(|| "unknown".to_string()),
        ),
        AlertKind::Escalation => format!(
            "🚨 ESCALATED: {} is still DOWN\nTarget: {}:{}\nConsecutive failures: {}\nError: {}",
            target.name,
            target.ip,
            target.port,
            failures,
            report.error_detail().unwrap_or_else(|| "unknown".to_string()),
        ),
        AlertKind::Recovery => format!(
            "✅ RECOVERED: {} is UP\nTarget: {}:{}\nResponse time: {}ms",
            target.name,
            target.ip,
            target.port,
            report.latency_ms().unwrap_or(0),
        ),
    }
}
