use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Send failure taxonomy. Transient failures are retried with backoff;
/// permanent ones terminate the delivery immediately.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("transient send failure: {reason}")]
    Transient {
        reason: String,
        /// Server-suggested minimum delay before the next attempt, when the
        /// transport reported one (e.g. a rate-limit response).
        retry_after: Option<Duration>,
    },
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn transient(reason: impl Into<String>) -> Self {
        SendError::Transient { reason: reason.into(), retry_after: None }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::Transient { retry_after, .. } => *retry_after,
            SendError::Permanent(_) => None,
        }
    }
}

/// The outbound notification primitive. Implementations must classify every
/// failure as transient or permanent; the queue never inspects transport
/// internals.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError>;
}
