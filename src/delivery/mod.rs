//! Delivery to the log-ingestion sink
//!
//! Two endpoints are supported:
//! - [`hec`] - the HTTP event collector, one POST per batch of envelopes
//! - [`collection`] - the key-value collection REST API used by snapshot sources
//!
//! Both go through a shared [`DeliveryClient`], which owns the pooled HTTP
//! client and the retry policy. A response is successful only with status 200;
//! statuses in the configured transient set are retried with backoff, every
//! other status fails the batch immediately.

use std::future::Future;

use crate::config::{DeliveryConfig, RetryConfig};
use crate::error::{DeliveryError, Error, Result};
use crate::retry::with_retry;
use crate::types::Event;

pub mod collection;
pub mod envelope;
pub mod hec;

pub use collection::{CollectionClient, CollectionSink, replace_collection};
pub use envelope::EnvelopeOptions;
pub use hec::{EventSink, HecSink};

/// Response bodies are cut to this many characters in error messages
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Pooled HTTP client plus retry policy
#[derive(Clone, Debug)]
pub struct DeliveryClient {
    http: reqwest::Client,
    retry: RetryConfig,
    retry_statuses: Vec<u16>,
}

impl DeliveryClient {
    /// Build the client once; connections are reused across batches
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(concat!("audit-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            retry: config.retry.clone(),
            retry_statuses: config.retry_statuses.clone(),
        })
    }

    /// The underlying HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Whether `status` is retried
    pub fn is_transient(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Send a request, retrying transient failures
    ///
    /// `build` is called once per attempt. Returns the 200 response, or the
    /// last error once the retry budget is spent.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        with_retry(&self.retry, || self.attempt(build(&self.http))).await
    }

    fn attempt(
        &self,
        request: reqwest::RequestBuilder,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        async move {
            let response = request.send().await?;
            let status = response.status();
            if status == reqwest::StatusCode::OK {
                return Ok(response);
            }

            let url = response.url().to_string();
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();

            Err(DeliveryError::Status {
                status: status.as_u16(),
                url,
                body,
                transient: self.is_transient(status.as_u16()),
            }
            .into())
        }
    }
}

/// Publish `chunks` in order, stopping at the first failure
///
/// `on_batch(i, n)` is called before batch `i` (1-based) of `n` is sent.
/// Returns the number of events delivered.
pub async fn deliver<F>(
    sink: &dyn EventSink,
    chunks: &[&[Event]],
    token: &str,
    options: &EnvelopeOptions,
    mut on_batch: F,
) -> Result<usize>
where
    F: FnMut(usize, usize),
{
    let total = chunks.len();
    let mut delivered = 0;

    for (i, chunk) in chunks.iter().enumerate() {
        on_batch(i + 1, total);
        if let Err(e) = sink.publish(chunk, token, options).await {
            tracing::error!(
                batch = i + 1,
                batches = total,
                delivered,
                error = %e,
                "Delivery failed, aborting remaining batches"
            );
            return Err(e);
        }
        delivered += chunk.len();
    }

    Ok(delivered)
}
