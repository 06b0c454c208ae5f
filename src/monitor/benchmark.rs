//! CPU benchmark watcher: polls a latency-series endpoint, extracts the
//! newest sample for a named series and alerts the admin chats when it
//! crosses the configured threshold.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::config::BenchmarkConfig;
use crate::delivery::{DeliveryQueue, Enqueue};
use crate::store::models::AuditEvent;

pub struct BenchmarkMonitor {
    cfg: BenchmarkConfig,
    client: reqwest::Client,
    queue: DeliveryQueue,
    audit: Arc<dyn AuditSink>,
    admin_chat_ids: Vec<i64>,
}

impl BenchmarkMonitor {
    pub fn new(
        cfg: BenchmarkConfig,
        queue: DeliveryQueue,
        audit: Arc<dyn AuditSink>,
        admin_chat_ids: Vec<i64>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { cfg, client, queue, audit, admin_chat_ids }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.enabled || self.cfg.url.is_empty() {
            info!("benchmark monitor disabled");
            return;
        }
        if self.admin_chat_ids.is_empty() {
            warn!("benchmark monitor enabled but no admin chats configured");
        }
        info!(
            url = %self.cfg.url,
            series = %self.cfg.target_name,
            threshold = self.cfg.threshold_seconds,
            "benchmark monitor started"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.poll_interval_seconds));
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
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "benchmark poll failed");
            }
        }
        info!("benchmark monitor stopped");
    }

    async fn poll_once(&self) -> Result<(), reqwest::Error> {
        let response = self.client.get(&self.cfg.url).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "benchmark endpoint returned non-success");
            return Ok(());
        }
        let body: Value = response.json().await?;
        let Some(value) = latest_sample(&body, &self.cfg.target_name) else {
            warn!(series = %self.cfg.target_name, "series not found in benchmark payload");
            return Ok(());
        };
        debug!(series = %self.cfg.target_name, value, "benchmark sample");
        if value > self.cfg.threshold_seconds {
            self.alert(value).await;
        }
        Ok(())
    }

    async fn alert(&self, value: f64) {
        let text = format!(
            "⚠️ CPU benchmark alert: {} = {:.3}s (threshold: {}s)",
            self.cfg.target_name, value, self.cfg.threshold_seconds
        );
        for &chat_id in &self.admin_chat_ids {
            if let Enqueue::Dropped(reason) = self.queue.enqueue(chat_id, text.clone()) {
                warn!(chat_id, reason = ?reason, "benchmark alert dropped by delivery queue");
            }
        }
        self.audit
            .record(AuditEvent::system(
                "cpu_benchmark_alert",
                format!("{}={:.3}s", self.cfg.target_name, value),
            ))
            .await;
    }
}

/// Extracts the newest sample for `series` from one of the payload shapes
/// benchmark trackers commonly serve:
///
/// 1. a list of objects with `name` and `data: [[ts, value], ...]`,
/// 2. a map from series name to `[[ts, value], ...]`,
/// 3. a list of `"name,ts,value"` strings, last matching line wins.
pub fn latest_sample(body: &Value, series: &str) -> Option<f64> {
    match body {
        Value::Array(entries) => match entries.first()? {
            Value::Object(_) => entries.iter().find_map(|entry| {
                if entry.get("name")?.as_str()? != series {
                    return None;
                }
                point_value(entry.get("data")?.as_array()?.last()?)
            }),
            Value::String(_) => entries
                .iter()
                .filter_map(|line| {
                    let line = line.as_str()?;
                    let mut parts = line.splitn(3, ',');
                    let name = parts.next()?;
                    let _ts = parts.next()?;
                    let value = parts.next()?.trim().parse::<f64>().ok()?;
                    (name == series).then_some(value)
                })
                .last(),
            _ => None,
        },
        Value::Object(map) => point_value(map.get(series)?.as_array()?.last()?),
        _ => None,
    }
}

fn point_value(point: &Value) -> Option<f64> {
    match point {
        // [ts, value] pair
        Value::Array(pair) => pair.get(1)?.as_f64(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
