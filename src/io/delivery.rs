//! Delivery client for the ingestion sink
//!
//! One record per request. Transient failures (no response, or 5xx) are
//! retried with exponential backoff: the retry with index `n` (from 0) waits
//! `base_delay * 2^n`. Everything else fails immediately. Callers always get
//! a [`DeliveryResult`]; nothing here returns an error.

use crate::domain::types::{DeliveryResult, SinkStatus, TransformedRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a single attempt failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// No response received (connect error, timeout, reset)
    #[error("network error: {0}")]
    Network(String),
    #[error("sink responded with status {0}")]
    Status(u16),
}

impl DeliveryFailure {
    /// Network failures and 5xx responses are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryFailure::Network(_) => true,
            DeliveryFailure::Status(status) => (500..600).contains(status),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryFailure::Network(_) => None,
            DeliveryFailure::Status(status) => Some(*status),
        }
    }
}

/// Request/response call to the sink.
///
/// Returns the HTTP status whenever a response arrived, and an error message
/// only when no response was received.
#[async_trait]
pub trait IngestTransport: Send + Sync {
    async fn post(&self, record: &TransformedRecord) -> Result<u16, String>;
}

#[async_trait]
impl<T: IngestTransport + ?Sized> IngestTransport for Arc<T> {
    async fn post(&self, record: &TransformedRecord) -> Result<u16, String> {
        (**self).post(record).await
    }
}

/// reqwest-backed transport: JSON body, `X-API-Key` header, fixed timeout
pub struct HttpIngestTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpIngestTransport {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Client is built once and reused for connection pooling
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.to_string(), api_key: api_key.to_string() })
    }
}

#[async_trait]
impl IngestTransport for HttpIngestTransport {
    async fn post(&self, record: &TransformedRecord) -> Result<u16, String> {
        let request_id = Uuid::now_v7().to_string();
        debug!(
            url = %self.url,
            request_id = %request_id,
            device_id = %record.identifier,
            "sink_request"
        );

        match self
            .client
            .post(&self.url)
            .header("X-API-Key", &self.api_key)
            .header("X-Request-Id", &request_id)
            .json(record)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                debug!(request_id = %request_id, status = %status.as_u16(), "sink_response");
                Ok(status.as_u16())
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "sink_request_error");
                Err(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_secs(1) }
    }
}

/// Wait before the retry with index `attempt_index` (0-based)
pub fn retry_delay(base_delay: Duration, attempt_index: u32) -> Duration {
    base_delay.saturating_mul(2u32.saturating_pow(attempt_index))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDelivery {
    pub results: Vec<DeliveryResult>,
    pub success_count: usize,
    pub failure_count: usize,
}

pub struct DeliveryClient<T = HttpIngestTransport> {
    transport: T,
    base_url: String,
    has_api_key: bool,
    policy: RetryPolicy,
    batch_pause: Duration,
}

impl<T: IngestTransport> DeliveryClient<T> {
    pub fn new(transport: T, base_url: &str, has_api_key: bool, policy: RetryPolicy) -> Self {
        Self {
            transport,
            base_url: base_url.to_string(),
            has_api_key,
            policy,
            batch_pause: Duration::from_millis(100),
        }
    }

    pub fn with_batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Deliver one record, retrying transient failures
    pub async fn send(&self, record: &TransformedRecord) -> DeliveryResult {
        let mut retry_count = 0u32;

        loop {
            let attempt = retry_count + 1;
            let failure = match self.transport.post(record).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(
                        device_id = %record.identifier,
                        timestamp = record.timestamp,
                        status = status,
                        attempt = attempt,
                        "delivery_succeeded"
                    );
                    return DeliveryResult {
                        success: true,
                        status: Some(status),
                        error: None,
                        retry_count,
                    };
                }
                Ok(status) => DeliveryFailure::Status(status),
                Err(message) => DeliveryFailure::Network(message),
            };

            warn!(
                device_id = %record.identifier,
                error = %failure,
                attempt = attempt,
                retry_count = retry_count,
                "delivery_attempt_failed"
            );

            if retry_count < self.policy.max_retries && failure.is_transient() {
                let delay = retry_delay(self.policy.base_delay, retry_count);
                info!(
                    device_id = %record.identifier,
                    delay_ms = delay.as_millis() as u64,
                    retry = retry_count + 1,
                    max_retries = self.policy.max_retries,
                    "delivery_retry_scheduled"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            return DeliveryResult {
                success: false,
                status: failure.status(),
                error: Some(failure.to_string()),
                retry_count,
            };
        }
    }

    /// Deliver records one at a time with a fixed pause after each request
    pub async fn send_batch(&self, records: &[TransformedRecord]) -> BatchDelivery {
        let mut results = Vec::with_capacity(records.len());

        for record in records {
            results.push(self.send(record).await);
            tokio::time::sleep(self.batch_pause).await;
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;

        info!(
            total = results.len(),
            success = success_count,
            failures = failure_count,
            "delivery_batch_complete"
        );

        BatchDelivery { results, success_count, failure_count }
    }

    pub fn status(&self) -> SinkStatus {
        SinkStatus {
            base_url: self.base_url.clone(),
            has_api_key: self.has_api_key,
            max_retries: self.policy.max_retries,
            retry_delay_ms: self.policy.base_delay.as_millis() as u64,
        }
    }
}
