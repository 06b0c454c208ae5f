//! Rate-limited outbound delivery queue.
//!
//! Buffers notification requests, honors a per-recipient minimum spacing
//! and a global token-bucket budget, retries transient transport failures
//! with exponential backoff, and surfaces sent/failed/dropped counters.
//! Enqueue never blocks the scheduler: a full buffer rejects the new item.

pub mod rate;
pub mod telegram;
pub mod transport;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use rate::RateBudget;
use transport::{NotificationTransport, SendError};

/// Fallback poll period when no wake-up hint is available.
const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    /// Buffer capacity across all recipients; enqueue beyond it drops the
    /// new item.
    pub capacity: usize,
    pub per_recipient_spacing: Duration,
    pub global_rate_per_sec: f64,
    pub global_burst: u32,
    /// Total send attempts per item before it terminates exhausted.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub send_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            capacity: 1000,
            per_recipient_spacing: Duration::from_secs(1),
            global_rate_per_sec: 30.0,
            global_burst: 30,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    ShuttingDown,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    Dropped(DropReason),
}

/// Snapshot of the queue's terminal-outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct DeliveryItem {
    recipient: i64,
    text: String,
    attempts: u32,
    next_attempt_at: Instant,
}

struct Inner {
    /// Per-recipient FIFO sub-queues; only the front of each is ever
    /// eligible, which preserves enqueue order per recipient.
    queues: HashMap<i64, VecDeque<DeliveryItem>>,
    /// Recipients with a send currently in flight. Blocks a second worker
    /// from taking the next item and reordering past a pending one.
    sending: HashSet<i64>,
    len: usize,
    rate: RateBudget,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    counters: Counters,
    cfg: QueueConfig,
    transport: Arc<dyn NotificationTransport>,
    shutting_down: AtomicBool,
}

/// Cloneable handle to the delivery queue. Workers run as background tasks
/// after [`DeliveryQueue::start`].
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DeliveryQueue {
    pub fn new(cfg: QueueConfig, transport: Arc<dyn NotificationTransport>) -> Self {
        let rate = RateBudget::new(
            cfg.per_recipient_spacing,
            cfg.global_rate_per_sec,
            cfg.global_burst,
        );
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queues: HashMap::new(),
                    sending: HashSet::new(),
                    len: 0,
                    rate,
                }),
                notify: Notify::new(),
                counters: Counters::default(),
                cfg,
                transport,
                shutting_down: AtomicBool::new(false),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns the dispatch workers.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            warn!("delivery queue already started");
            return;
        }
        for worker_id in 0..self.shared.cfg.workers {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
        info!(workers = self.shared.cfg.workers, "delivery queue started");
    }

    /// Accepts a notification request. Never blocks: a full buffer or a
    /// queue past shutdown rejects the item and bumps the drop counter.
    pub fn enqueue(&self, recipient: i64, text: String) -> Enqueue {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Enqueue::Dropped(DropReason::ShuttingDown);
        }
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.len >= self.shared.cfg.capacity {
                drop(inner);
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(recipient, "delivery buffer full, dropping message");
                return Enqueue::Dropped(DropReason::QueueFull);
            }
            inner.queues.entry(recipient).or_default().push_back(DeliveryItem {
                recipient,
                text,
                attempts: 0,
                next_attempt_at: Instant::now(),
            });
            inner.len += 1;
        }
        self.shared.notify.notify_one();
        Enqueue::Accepted
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            sent: self.shared.counters.sent.load(Ordering::Relaxed),
            failed: self.shared.counters.failed.load(Ordering::Relaxed),
            dropped: self.shared.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Buffered items not yet in a terminal state.
    pub fn pending(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner.len + inner.sending.len()
    }

    /// Stops intake, lets workers drain for at most `grace`, then aborts
    /// whatever remains.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(remaining = self.pending(), "delivery drain grace expired, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        } else {
            info!("delivery queue drained");
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "delivery worker started");
    loop {
        let now = Instant::now();
        let (item, wait_hint) = {
            let mut inner = shared.inner.lock().unwrap();
            take_next(&mut inner, now)
        };

        if let Some(item) = item {
            deliver(&shared, item, worker_id).await;
            continue;
        }

        if shared.shutting_down.load(Ordering::SeqCst) {
            let inner = shared.inner.lock().unwrap();
            if inner.len == 0 && inner.sending.is_empty() {
                break;
            }
        }

        let wait = wait_hint.unwrap_or(IDLE_POLL).max(Duration::from_millis(1));
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(worker_id, "delivery worker stopped");
}

/// Picks the next eligible item: the head of some recipient queue whose
/// backoff delay has elapsed, whose recipient has no send in flight, and
/// for which both rate budgets have room. On a miss, returns a hint for
/// how long until something could become eligible.
fn take_next(inner: &mut Inner, now: Instant) -> (Option<DeliveryItem>, Option<Duration>) {
    let mut min_wait: Option<Duration> = None;
    let mut track = |wait: Duration| {
        min_wait = Some(min_wait.map_or(wait, |w| w.min(wait)));
    };

    let recipients: Vec<i64> = inner.queues.keys().copied().collect();
    for recipient in recipients {
        if inner.sending.contains(&recipient) {
            continue;
        }
        let head_ready_at = match inner.queues.get(&recipient).and_then(|q| q.front()) {
            Some(item) => item.next_attempt_at,
            None => {
                inner.queues.remove(&recipient);
                continue;
            }
        };
        if head_ready_at > now {
            track(head_ready_at - now);
            continue;
        }
        match inner.rate.check(recipient, now) {
            Ok(()) => {
                let queue = inner.queues.get_mut(&recipient).unwrap();
                let item = queue.pop_front().unwrap();
                if queue.is_empty() {
                    inner.queues.remove(&recipient);
                }
                inner.len -= 1;
                inner.sending.insert(recipient);
                inner.rate.commit(recipient, now);
                return (Some(item), None);
            }
            Err(wait) => track(wait),
        }
    }
    (None, min_wait)
}

async fn deliver(shared: &Shared, mut item: DeliveryItem, worker_id: usize) {
    let recipient = item.recipient;
    let attempt = item.attempts + 1;
    let result = match tokio::time::timeout(
        shared.cfg.send_timeout,
        shared.transport.send(recipient, &item.text),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(SendError::transient("send attempt timed out")),
    };

    match result {
        Ok(()) => {
            shared.counters.sent.fetch_add(1, Ordering::Relaxed);
            debug!(worker_id, recipient, attempt, "message sent");
            release(shared, recipient);
        }
        Err(SendError::Permanent(reason)) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, recipient, %reason, "permanent send failure, not retrying");
            release(shared, recipient);
        }
        Err(err @ SendError::Transient { .. }) => {
            item.attempts += 1;
            if item.attempts >= shared.cfg.max_attempts {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id,
                    recipient,
                    attempts = item.attempts,
                    "retries exhausted, dropping message"
                );
                release(shared, recipient);
                return;
            }

            let delay = retry_delay(&shared.cfg, item.attempts, err.retry_after());
            warn!(
                worker_id,
                recipient,
                attempt = item.attempts,
                max_attempts = shared.cfg.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient send failure, scheduling retry"
            );
            item.next_attempt_at = Instant::now() + delay;
            {
                let mut inner = shared.inner.lock().unwrap();
                // Front of the recipient queue: a retried item must not be
                // overtaken by later messages for the same recipient.
                inner.queues.entry(recipient).or_default().push_front(item);
                inner.len += 1;
                inner.sending.remove(&recipient);
            }
            shared.notify.notify_one();
        }
    }
}

fn release(shared: &Shared, recipient: i64) {
    let mut inner = shared.inner.lock().unwrap();
    inner.sending.remove(&recipient);
    drop(inner);
    shared.notify.notify_one();
}

/// `base * 2^(attempts-1)` with jitter, capped, and never below a
/// transport-suggested retry delay.
fn retry_delay(cfg: &QueueConfig, attempts: u32, retry_after: Option<Duration>) -> Duration {
    let exponential = cfg
        .base_delay
        .as_secs_f64()
        * 2f64.powi(attempts.saturating_sub(1).min(16) as i32);
    let jitter = rand::random::<f64>() * 0.5;
    let mut delay = Duration::from_secs_f64(exponential + jitter).min(cfg.max_delay);
    if let Some(suggested) = retry_after {
        delay = delay.max(suggested);
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Scripted transport: pops the next planned response per call,
    /// defaulting to success, and records every attempt with its timing.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), SendError>>>,
        calls: Mutex<Vec<(i64, String, Instant)>>,
    }

    impl ScriptedTransport {
        fn ok() -> Arc<Self> {
            Self::with_script(Vec::new())
        }

        fn with_script(script: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(i64, String, Instant)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(r, t, at)| (*r, t.clone(), *at))
                .collect()
        }
    }

    #[async_trait]
    impl NotificationTransport for ScriptedTransport {
        async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
            self.calls
                .lock()
                .unwrap()
                .push((chat_id, text.to_string(), Instant::now()));
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            workers: 3,
            capacity: 100,
            per_recipient_spacing: Duration::from_secs(1),
            global_rate_per_sec: 100.0,
            global_burst: 100,
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_for(queue: &DeliveryQueue, f: impl Fn(QueueStats) -> bool) {
        for _ in 0..10_000 {
            if f(queue.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached, stats: {:?}", queue.stats());
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_rejects_enqueue_without_blocking() {
        let transport = ScriptedTransport::ok();
        let mut cfg = test_config();
        cfg.capacity = 2;
        // No workers started: the buffer stays full.
        let queue = DeliveryQueue::new(cfg, transport);

        assert_eq!(queue.enqueue(1, "a".into()), Enqueue::Accepted);
        assert_eq!(queue.enqueue(1, "b".into()), Enqueue::Accepted);
        assert_eq!(
            queue.enqueue(1, "c".into()),
            Enqueue::Dropped(DropReason::QueueFull)
        );
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_attempt_exactly_max_times() {
        let always_transient: Vec<Result<(), SendError>> =
            (0..10).map(|_| Err(SendError::transient("boom"))).collect();
        let transport = ScriptedTransport::with_script(always_transient);
        let mut cfg = test_config();
        cfg.max_attempts = 3;
        let queue = DeliveryQueue::new(cfg, Arc::clone(&transport) as Arc<dyn NotificationTransport>);
        queue.start();

        queue.enqueue(42, "flaky".into());
        wait_for(&queue, |s| s.failed == 1).await;

        assert_eq!(transport.calls().len(), 3);
        let stats = queue.stats();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.failed, 1);
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let transport = ScriptedTransport::with_script(vec![Err(SendError::Permanent(
            "chat not found".into(),
        ))]);
        let queue = DeliveryQueue::new(
            test_config(),
            Arc::clone(&transport) as Arc<dyn NotificationTransport>,
        );
        queue.start();

        queue.enqueue(42, "nope".into());
        wait_for(&queue, |s| s.failed == 1).await;
        assert_eq!(transport.calls().len(), 1);
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn per_recipient_spacing_holds_under_saturation() {
        let transport = ScriptedTransport::ok();
        let queue = DeliveryQueue::new(
            test_config(),
            Arc::clone(&transport) as Arc<dyn NotificationTransport>,
        );
        queue.start();

        let started = Instant::now();
        for i in 0..5 {
            assert_eq!(queue.enqueue(7, format!("m{i}")), Enqueue::Accepted);
        }
        wait_for(&queue, |s| s.sent == 5).await;

        // Five sends with 1s spacing need at least 4s of wall clock.
        assert!(started.elapsed() >= Duration::from_secs(4));

        let calls = transport.calls();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            let gap = pair[1].2 - pair[0].2;
            assert!(gap >= Duration::from_millis(999), "gap {gap:?} too small");
        }
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn same_recipient_order_survives_workers_and_retries() {
        // First attempt for the first message fails once, forcing a retry;
        // later messages must still arrive after it.
        let transport = ScriptedTransport::with_script(vec![Err(SendError::transient("blip"))]);
        let mut cfg = test_config();
        cfg.per_recipient_spacing = Duration::from_millis(10);
        let queue = DeliveryQueue::new(cfg, Arc::clone(&transport) as Arc<dyn NotificationTransport>);
        queue.start();

        for text in ["first", "second", "third"] {
            queue.enqueue(9, text.to_string());
        }
        wait_for(&queue, |s| s.sent == 3).await;

        let texts: Vec<String> = transport.calls().into_iter().map(|(_, t, _)| t).collect();
        // Four attempts total: the failed first try, then in-order sends.
        assert_eq!(texts, vec!["first", "first", "second", "third"]);
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn different_recipients_are_independent() {
        let transport = ScriptedTransport::ok();
        let mut cfg = test_config();
        cfg.per_recipient_spacing = Duration::from_secs(60);
        let queue = DeliveryQueue::new(cfg, Arc::clone(&transport) as Arc<dyn NotificationTransport>);
        queue.start();

        let started = Instant::now();
        for recipient in 1..=5 {
            queue.enqueue(recipient, "hi".into());
        }
        wait_for(&queue, |s| s.sent == 5).await;
        // Spacing is per recipient: five distinct recipients drain without
        // waiting out the 60s window.
        assert!(started.elapsed() < Duration::from_secs(30));
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_items_and_drains() {
        let transport = ScriptedTransport::ok();
        let mut cfg = test_config();
        cfg.per_recipient_spacing = Duration::from_millis(10);
        let queue = DeliveryQueue::new(cfg, Arc::clone(&transport) as Arc<dyn NotificationTransport>);
        queue.start();

        queue.enqueue(1, "before".into());
        queue.shutdown(Duration::from_secs(10)).await;
        assert_eq!(
            queue.enqueue(1, "after".into()),
            Enqueue::Dropped(DropReason::ShuttingDown)
        );
        assert_eq!(queue.stats().sent, 1);
        assert_eq!(queue.pending(), 0);
    }
}
