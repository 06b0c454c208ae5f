//! Probe executor: a single bounded-time TCP connect-and-measure operation.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Why a probe failed. Every network condition maps to one of these; the
/// executor never returns an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("connection timeout after {0}s")]
    Timeout(u64),
    #[error("connection refused")]
    Refused,
    #[error("name resolution failed: {0}")]
    Resolution(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Outcome of one probe execution, before persistence. Latency is the
/// wall-clock delta from dial start to connect success, absent on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub success: bool,
    pub latency: Option<Duration>,
    pub failure: Option<ProbeFailure>,
}

impl ProbeReport {
    fn up(latency: Duration) -> Self {
        Self { success: true, latency: Some(latency), failure: None }
    }

    fn down(failure: ProbeFailure) -> Self {
        Self { success: false, latency: None, failure: Some(failure) }
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency.map(|l| l.as_millis() as u64)
    }

    pub fn error_detail(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.to_string())
    }
}

/// The seam between the scheduler and the network. Production uses
/// [`TcpProber`]; tests substitute instrumented implementations.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: &str, port: u16, timeout: Duration) -> ProbeReport;
}

/// Probes by opening a TCP connection to `ip:port`. Success is a connection
/// established within the timeout; the stream is dropped immediately after.
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, ip: &str, port: u16, timeout: Duration) -> ProbeReport {
        let addr = format!("{ip}:{port}");
        let start = Instant::now();
        let report = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => ProbeReport::up(start.elapsed()),
            Ok(Err(e)) => ProbeReport::down(classify(&e)),
            Err(_) => ProbeReport::down(ProbeFailure::Timeout(timeout.as_secs())),
        };
        debug!(
            target_addr = %addr,
            success = report.success,
            latency_ms = ?report.latency_ms(),
            error = ?report.failure,
            "tcp probe finished"
        );
        report
    }
}

fn classify(e: &io::Error) -> ProbeFailure {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
        io::ErrorKind::TimedOut => ProbeFailure::Timeout(0),
        _ => {
            let msg = e.to_string();
            // Resolver failures surface as generic I/O errors from the
            // in-connect lookup; tag them by message.
            if msg.contains("lookup") || msg.contains("resolve") {
                ProbeFailure::Resolution(msg)
            } else {
                ProbeFailure::Network(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_succeeds_against_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let report = TcpProber
            .probe("127.0.0.1", port, Duration::from_secs(5))
            .await;
        assert!(report.success);
        assert!(report.latency.is_some());
        assert!(report.failure.is_none());
        assert!(report.error_detail().is_none());
    }

    #[tokio::test]
    async fn probe_reports_refused_on_closed_port() {
        // Bind then drop to get a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let report = TcpProber
            .probe("127.0.0.1", port, Duration::from_secs(5))
            .await;
        assert!(!report.success);
        assert!(report.latency.is_none());
        assert_eq!(report.failure, Some(ProbeFailure::Refused));
    }

    #[tokio::test]
    async fn probe_tags_resolution_failures() {
        let report = TcpProber
            .probe("host.invalid", 80, Duration::from_secs(5))
            .await;
        assert!(!report.success);
        // Classification depends on the resolver's error text; either way
        // the probe must resolve to a tagged failure, not a panic or Err.
        assert!(report.failure.is_some());
    }

    #[test]
    fn failure_detail_is_human_readable() {
        assert_eq!(
            ProbeFailure::Timeout(5).to_string(),
            "connection timeout after 5s"
        );
        assert_eq!(ProbeFailure::Refused.to_string(), "connection refused");
    }
}
