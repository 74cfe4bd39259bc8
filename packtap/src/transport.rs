//! Telemetry transport to the collector
//!
//! Batches are normalized per request id:
//!
//! ```text
//! { "<requestId>": [ {"seq": 1, "dim": "status", "num": "200"},
//!                    {"seq": 2, "dim": "url",    "str": "https://..."} ] }
//! ```
//!
//! `num` is used when the value is all ASCII digits; the value itself stays
//! a string either way.

use crate::error::TransportError;
use crate::pipeline::CaptureEvent;
use async_trait::async_trait;
use indexmap::IndexMap;
use packtap_api::{BYPASS_HEADER, BYPASS_VALUE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One normalized capture entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkEntry {
    Num { seq: u64, dim: String, num: String },
    Str { seq: u64, dim: String, str: String },
}

impl NetworkEntry {
    pub fn seq(&self) -> u64 {
        match self {
            NetworkEntry::Num { seq, .. } | NetworkEntry::Str { seq, .. } => *seq,
        }
    }

    pub fn dim(&self) -> &str {
        match self {
            NetworkEntry::Num { dim, .. } | NetworkEntry::Str { dim, .. } => dim,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            NetworkEntry::Num { num, .. } => num,
            NetworkEntry::Str { str, .. } => str,
        }
    }
}

/// Batch body keyed by request id, in first-seen order
pub type NetworkPayload = IndexMap<String, Vec<NetworkEntry>>;

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Group events by request id
pub fn normalize(events: &[CaptureEvent]) -> NetworkPayload {
    let mut payload = NetworkPayload::new();
    for event in events {
        let entry = if is_numeric(&event.value) {
            NetworkEntry::Num {
                seq: event.sequence_id,
                dim: event.dimension.clone(),
                num: event.value.clone(),
            }
        } else {
            NetworkEntry::Str {
                seq: event.sequence_id,
                dim: event.dimension.clone(),
                str: event.value.clone(),
            }
        };
        payload
            .entry(event.request_id.clone())
            .or_default()
            .push(entry);
    }
    payload
}

/// Delivers telemetry batches
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Send one batch; delivery is best-effort
    async fn send(&self, payload: &NetworkPayload) -> Result<(), TransportError>;
}

/// Upper bound on one batch POST
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts batches to `{endpoint}/v1/events`
pub struct HttpEventTransport {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl HttpEventTransport {
    /// Create a transport for a collector endpoint
    pub fn new(endpoint: &str, secret: impl Into<String>) -> Result<Self, TransportError> {
        // No idle pooling: the exit flush sends from its own runtime
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, endpoint, secret))
    }

    /// Create with an existing client
    pub fn with_client(client: reqwest::Client, endpoint: &str, secret: impl Into<String>) -> Self {
        Self {
            client,
            url: format!("{}/v1/events", endpoint.trim_end_matches('/')),
            secret: secret.into(),
        }
    }

    /// Full events URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for HttpEventTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEventTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn send(&self, payload: &NetworkPayload) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.secret)
            .header(BYPASS_HEADER, BYPASS_VALUE)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}
