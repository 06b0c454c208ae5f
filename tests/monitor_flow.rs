//! End-to-end monitoring flow: scheduler over an in-memory store, a
//! scripted prober, and a capturing transport behind the real delivery
//! queue. Verifies that an outage produces exactly one alert and one
//! escalation, and that recovery produces exactly one notification.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use portwatch::audit::MemoryAuditSink;
use portwatch::delivery::transport::{NotificationTransport, SendError};
use portwatch::delivery::{DeliveryQueue, QueueConfig};
use portwatch::monitor::gather_stats;
use portwatch::monitor::probe::{ProbeFailure, ProbeReport, Prober};
use portwatch::monitor::scheduler::{Scheduler, SchedulerConfig};
use portwatch::store::memory::MemoryStore;
use portwatch::store::models::{HealthState, Thresholds};
use portwatch::store::TargetStore;

const THRESHOLDS: Thresholds = Thresholds { failure: 3, escalation: 5 };

/// Replays a scripted sequence of probe outcomes, then succeeds forever.
struct ScriptedProber {
    script: Mutex<VecDeque<bool>>,
}

impl ScriptedProber {
    fn new(script: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
        })
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _ip: &str, _port: u16, _timeout: Duration) -> ProbeReport {
        let success = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if success {
            ProbeReport {
                success: true,
                latency: Some(Duration::from_millis(12)),
                failure: None,
            }
        } else {
            ProbeReport {
                success: false,
                latency: None,
                failure: Some(ProbeFailure::Refused),
            }
        }
    }
}

struct CaptureTransport {
    sent: Mutex<Vec<(i64, String)>>,
}

impl CaptureTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()) })
    }

    fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for CaptureTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<CaptureTransport>,
    queue: DeliveryQueue,
    audit: Arc<MemoryAuditSink>,
    shutdown_tx: watch::Sender<bool>,
    scheduler_handle: tokio::task::JoinHandle<()>,
    target_id: i64,
}

async fn start(script: Vec<bool>) -> Harness {
    let store = Arc::new(MemoryStore::new(1));
    let customer = store.create_customer(100, 1, THRESHOLDS).await.unwrap();
    let target = store
        .upsert_target(customer.id, "web", "10.0.0.1", 443)
        .await
        .unwrap();

    let transport = CaptureTransport::new();
    let queue = DeliveryQueue::new(
        QueueConfig {
            per_recipient_spacing: Duration::from_millis(50),
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn NotificationTransport>,
    );
    queue.start();
    let audit = Arc::new(MemoryAuditSink::new());

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn TargetStore>,
        ScriptedProber::new(script),
        queue.clone(),
        Arc::clone(&audit) as Arc<dyn portwatch::audit::AuditSink>,
        SchedulerConfig {
            tick: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            max_concurrent_probes: 50,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    Harness {
        store,
        transport,
        queue,
        audit,
        shutdown_tx,
        scheduler_handle,
        target_id: target.id,
    }
}

impl Harness {
    async fn stop(self) -> (Vec<(i64, String)>, Vec<String>) {
        self.shutdown_tx.send(true).unwrap();
        self.scheduler_handle.await.unwrap();
        self.queue.shutdown(Duration::from_secs(5)).await;
        let actions = self
            .audit
            .events()
            .into_iter()
            .map(|e| e.action)
            .collect();
        (self.transport.messages(), actions)
    }
}

#[tokio::test(start_paused = true)]
async fn outage_and_recovery_notify_exactly_once_per_crossing() {
    // Six failures cross both thresholds, then the endpoint comes back.
    let harness = start(vec![false; 6]).await;
    tokio::time::sleep(Duration::from_secs(12)).await;

    let stats = gather_stats(harness.store.as_ref(), &harness.queue)
        .await
        .unwrap();
    let target = harness
        .store
        .get_target(harness.target_id)
        .await
        .unwrap()
        .unwrap();
    let (messages, actions) = harness.stop().await;

    assert_eq!(messages.len(), 3, "got: {messages:?}");
    assert!(messages.iter().all(|(chat, _)| *chat == 100));
    assert!(messages[0].1.contains("ALERT"));
    assert!(messages[0].1.contains("Consecutive failures: 3"));
    assert!(messages[1].1.contains("ESCALATED"));
    assert!(messages[1].1.contains("Consecutive failures: 5"));
    assert!(messages[2].1.contains("RECOVERED"));

    assert_eq!(
        actions,
        vec!["target_alert", "target_escalation", "target_recovery"]
    );

    assert_eq!(target.consecutive_failures, 0);
    assert_eq!(target.health, HealthState::Healthy);

    assert_eq!(stats.targets_monitored, 1);
    assert_eq!(stats.queue_sent, 3);
    assert_eq!(stats.queue_failed, 0);
    assert_eq!(stats.queue_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn short_blip_below_threshold_stays_silent() {
    // Two failures never reach the alert threshold.
    let harness = start(vec![false, false]).await;
    tokio::time::sleep(Duration::from_secs(8)).await;

    let target = harness
        .store
        .get_target(harness.target_id)
        .await
        .unwrap()
        .unwrap();
    let (messages, actions) = harness.stop().await;

    assert!(messages.is_empty(), "got: {messages:?}");
    assert!(actions.is_empty());
    assert_eq!(target.consecutive_failures, 0);
    assert_eq!(target.health, HealthState::Healthy);
}

#[tokio::test(start_paused = true)]
async fn repeated_outage_alerts_again_after_recovery() {
    // Down, up, down again: each crossing of the alert threshold fires.
    let mut script = vec![false, false, false];
    script.push(true);
    script.extend([false, false, false]);
    let harness = start(script).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let (messages, actions) = harness.stop().await;

    assert_eq!(messages.len(), 3, "got: {messages:?}");
    assert!(messages[0].1.contains("ALERT"));
    assert!(messages[1].1.contains("RECOVERED"));
    assert!(messages[2].1.contains("ALERT"));
    assert_eq!(
        actions,
        vec!["target_alert", "target_recovery", "target_alert"]
    );
}
