//! Telegram Bot API transport.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::transport::{NotificationTransport, SendError};

/// Sends messages through the Telegram `sendMessage` endpoint. Rate-limit
/// responses (429) carry a `retry_after` the queue must honor.
pub struct TelegramTransport {
    client: Client,
    bot_token: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiError {
    description: Option<String>,
    parameters: Option<ApiErrorParameters>,
}

#[derive(Deserialize)]
struct ApiErrorParameters {
    retry_after: Option<u64>,
}

impl TelegramTransport {
    pub fn new(bot_token: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
        }
    }
}

#[async_trait]
impl NotificationTransport for TelegramTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        let api_url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = SendMessage { chat_id, text };

        let response = self
            .client
            .post(&api_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::transient(format!("network error: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body: Option<ApiError> = response.json().await.ok();
        let description = body
            .as_ref()
            .and_then(|b| b.description.clone())
            .unwrap_or_else(|| format!("HTTP {status}"));

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = body
                    .and_then(|b| b.parameters)
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs);
                Err(SendError::Transient {
                    reason: format!("rate limited: {description}"),
                    retry_after,
                })
            }
            // Invalid recipient, revoked token, blocked bot: retrying is
            // pointless.
            s if s.is_client_error() => Err(SendError::Permanent(description)),
            _ => Err(SendError::transient(description)),
        }
    }
}
