//! Long-poll client for the cross-chain attestation provider.
//!
//! The provider exposes two generations of the same lookup: v2 is keyed by
//! `(sourceDomain, transactionHash)`, v1 by the burn message hash. Both
//! resolve to the same `(message, attestation)` pair the MessageTransmitter
//! consumes on the destination chain. The query variant selects the backend;
//! callers only ever see [`AttestationClient::wait`].
//!
//! Polling contract: a fixed interval per backend, a bounded total budget,
//! HTTP 404 treated as *pending, keep polling*, and any other provider error
//! terminating the wait. Polling honors a cancellation signal and exits
//! cleanly; the in-flight payment record stays pending for reconciliation.

use alloy_primitives::{B256, Bytes};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

/// v1 lookups (by message hash) poll faster; the endpoint is cheap.
const V1_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// v2 lookups (by source transaction) poll at a coarser interval.
const V2_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Per-request HTTP timeout, well under any poll budget.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("attestation polling exhausted its {0:?} budget")]
    Timeout(Duration),
    #[error("attestation polling cancelled")]
    Cancelled,
    #[error("attestation provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("malformed attestation payload: {0}")]
    Decode(String),
}

/// How to look the burn up with the provider.
#[derive(Debug, Clone, Copy)]
pub enum AttestationQuery {
    /// Legacy v1 surface: `GET /attestations/{messageHash}`.
    MessageHash(B256),
    /// Preferred v2 surface:
    /// `GET /v2/messages/{sourceDomain}?transactionHash={hash}`.
    SourceTx {
        source_domain: u32,
        transaction_hash: B256,
    },
}

impl AttestationQuery {
    fn poll_interval(&self) -> Duration {
        match self {
            AttestationQuery::MessageHash(_) => V1_POLL_INTERVAL,
            AttestationQuery::SourceTx { .. } => V2_POLL_INTERVAL,
        }
    }
}

/// A completed attestation: the burn message and the authority's signature
/// over it, both raw bytes ready for `receiveMessage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub message: Bytes,
    pub attestation: Bytes,
}

#[derive(Debug, Deserialize)]
struct V2MessagesBody {
    messages: Vec<V2Message>,
}

#[derive(Debug, Deserialize)]
struct V2Message {
    status: String,
    message: Option<String>,
    attestation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V1AttestationBody {
    status: String,
    message: Option<String>,
    attestation: Option<String>,
}

fn decode_hex_blob(field: &str, value: Option<String>) -> Result<Bytes, AttestationError> {
    let value = value
        .ok_or_else(|| AttestationError::Decode(format!("missing `{field}` in complete attestation")))?;
    let raw = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| AttestationError::Decode(format!("invalid hex in `{field}`: {e}")))?;
    Ok(Bytes::from(raw))
}

/// `None` means the attestation is still pending.
fn decode_v2_body(body: &str) -> Result<Option<Attestation>, AttestationError> {
    let parsed: V2MessagesBody =
        serde_json::from_str(body).map_err(|e| AttestationError::Decode(e.to_string()))?;
    let Some(first) = parsed.messages.into_iter().next() else {
        return Ok(None);
    };
    if first.status != "complete" {
        return Ok(None);
    }
    Ok(Some(Attestation {
        message: decode_hex_blob("message", first.message)?,
        attestation: decode_hex_blob("attestation", first.attestation)?,
    }))
}

fn decode_v1_body(body: &str) -> Result<Option<Attestation>, AttestationError> {
    let parsed: V1AttestationBody =
        serde_json::from_str(body).map_err(|e| AttestationError::Decode(e.to_string()))?;
    if parsed.status != "complete" {
        return Ok(None);
    }
    Ok(Some(Attestation {
        message: decode_hex_blob("message", parsed.message)?,
        attestation: decode_hex_blob("attestation", parsed.attestation)?,
    }))
}

/// Client bound to one attestation provider base URL.
#[derive(Debug, Clone)]
pub struct AttestationClient {
    http: reqwest::Client,
    base_url: Url,
    max_wait: Duration,
}

impl AttestationClient {
    pub fn new(base_url: Url, max_wait: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            max_wait,
        })
    }

    fn query_url(&self, query: &AttestationQuery) -> Result<Url, AttestationError> {
        match query {
            AttestationQuery::MessageHash(hash) => self
                .base_url
                .join(&format!("attestations/{hash}"))
                .map_err(|e| AttestationError::Decode(e.to_string())),
            AttestationQuery::SourceTx {
                source_domain,
                transaction_hash,
            } => {
                let mut url = self
                    .base_url
                    .join(&format!("v2/messages/{source_domain}"))
                    .map_err(|e| AttestationError::Decode(e.to_string()))?;
                url.set_query(Some(&format!("transactionHash={transaction_hash}")));
                Ok(url)
            }
        }
    }

    /// One provider round trip. `Ok(None)` means keep polling.
    async fn poll_once(
        &self,
        query: &AttestationQuery,
    ) -> Result<Option<Attestation>, AttestationError> {
        let url = self.query_url(query)?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // The provider has not seen the burn yet.
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AttestationError::Provider(format!("HTTP {status}")));
        }
        let body = response.text().await?;
        match query {
            AttestationQuery::MessageHash(_) => decode_v1_body(&body),
            AttestationQuery::SourceTx { .. } => decode_v2_body(&body),
        }
    }

    /// Poll until the attestation completes, the budget is exhausted, or the
    /// caller cancels.
    #[instrument(skip_all, err, fields(query = ?query))]
    pub async fn wait(
        &self,
        query: AttestationQuery,
        cancel: &CancellationToken,
    ) -> Result<Attestation, AttestationError> {
        let interval = query.poll_interval();
        let deadline = tokio::time::Instant::now() + self.max_wait;
        loop {
            if let Some(attestation) = self.poll_once(&query).await? {
                return Ok(attestation);
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(AttestationError::Timeout(self.max_wait));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AttestationError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
