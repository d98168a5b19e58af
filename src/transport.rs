//! Push transport boundary — the external message relay.
//!
//! Delivery is best effort and may silently fail; the only signal the
//! engine trusts is an explicit confirming status field in the response
//! body. A thrown transport error, a non-confirming status, and a
//! malformed body are all treated identically upstream: delivery did
//! not confirm, escalate to the fallback store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One composed alert message bound for a single destination address.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub priority: String,
    /// Opaque dose-identity metadata carried alongside the alert.
    pub data: Value,
}

/// Outcome of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The relay's response carried a confirming status.
    Confirmed,
    /// Anything else: error status, missing status, malformed body.
    NotConfirmed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Push relay request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Push relay returned HTTP {0}")]
    Status(u16),
}

/// External push relay: one send-one-message call. Callers must treat
/// `Err` and `Ok(NotConfirmed)` the same way.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<Delivery, TransportError>;
}

// ═══════════════════════════════════════════════════════════
// Address classification
// ═══════════════════════════════════════════════════════════

/// Whether an address is a development placeholder. Placeholder
/// addresses count as delivered without contacting any relay.
pub fn is_placeholder_address(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower.contains("mock") || lower.contains("placeholder") || lower.contains("simulator")
}

// ═══════════════════════════════════════════════════════════
// Expo-style relay client
// ═══════════════════════════════════════════════════════════

const DEFAULT_RELAY_URL: &str = "https://exp.host/--/api/v2";
const SEND_TIMEOUT_SECS: u64 = 10;

/// HTTP client for an Expo-style push relay.
pub struct ExpoPushClient {
    base_url: String,
    client: reqwest::Client,
}

impl ExpoPushClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Client against the public Expo relay.
    pub fn default_relay() -> Self {
        Self::new(DEFAULT_RELAY_URL)
    }
}

/// Request body for the relay's /push/send.
#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    priority: &'a str,
    sound: &'a str,
    data: &'a Value,
}

/// Relay response; only the nested status field matters.
#[derive(Deserialize)]
struct SendResponse {
    data: Option<SendTicket>,
}

#[derive(Deserialize)]
struct SendTicket {
    status: Option<String>,
}

/// Interpret a raw response body. Only an explicit `data.status == "ok"`
/// confirms; every other shape is non-confirmation.
pub(crate) fn confirmation_from_body(body: &str) -> Delivery {
    match serde_json::from_str::<SendResponse>(body) {
        Ok(SendResponse { data: Some(ticket) }) if ticket.status.as_deref() == Some("ok") => {
            Delivery::Confirmed
        }
        _ => Delivery::NotConfirmed,
    }
}

#[async_trait]
impl PushTransport for ExpoPushClient {
    async fn send(&self, message: &PushMessage) -> Result<Delivery, TransportError> {
        let url = format!("{}/push/send", self.base_url);
        let request = SendRequest {
            to: &message.to,
            title: &message.title,
            body: &message.body,
            priority: &message.priority,
            sound: "default",
            data: &message.data,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(confirmation_from_body(&body))
    }
}
