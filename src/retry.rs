//! Bounded retries for sink requests
//!
//! [`with_retry`] wraps one request in the delivery policy from
//! [`RetryConfig`]: a first attempt, then up to `max_attempts` further attempts
//! while the failure is transient. The pause between attempts follows
//! [`Backoff`].
//!
//! # Example
//!
//! ```no_run
//! use audit_sync::config::RetryConfig;
//! use audit_sync::retry::with_retry;
//!
//! # async fn example(client: reqwest::Client) -> audit_sync::Result<()> {
//! let policy = RetryConfig::default();
//! let status = with_retry(&policy, || async {
//!     let response = client.get("https://vendor.example.com/health").send().await?;
//!     Ok::<_, audit_sync::Error>(response.status())
//! })
//! .await?;
//! println!("vendor answered {status}");
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DeliveryError, Error};
use rand::Rng;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

/// Classifies a failure as transient (worth another attempt) or final
pub trait IsRetryable {
    /// `true` when repeating the request could succeed
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::Interrupted
            ),
            // Decided against the configured retry statuses when the response arrived
            Error::Delivery(DeliveryError::Status { transient, .. }) => *transient,
            Error::Config { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Fetch(_)
            | Error::FutureWindow { .. }
            | Error::RunInProgress(_)
            | Error::UnknownSource(_)
            | Error::InvalidStoreKey(_)
            | Error::Serialization(_)
            | Error::Other(_) => false,
        }
    }
}

/// Pause schedule between attempts
///
/// Starts at `initial_delay`, multiplies by `backoff_multiplier` after every
/// pause and never exceeds `max_delay`. With `jitter` each pause is stretched
/// by a random factor in `[1, 2]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    factor: f64,
    ceiling: Duration,
    jitter: bool,
}

impl Backoff {
    /// Schedule for `policy`
    pub fn new(policy: &RetryConfig) -> Self {
        Self {
            next: policy.initial_delay.min(policy.max_delay),
            factor: policy.backoff_multiplier,
            ceiling: policy.max_delay,
            jitter: policy.jitter,
        }
    }

    /// The pause to take now; advances the schedule
    pub fn pause(&mut self) -> Duration {
        let base = self.next;
        self.next = Duration::try_from_secs_f64(base.as_secs_f64() * self.factor.max(1.0))
            .map_or(self.ceiling, |grown| grown.min(self.ceiling));
        if self.jitter { stretch(base) } else { base }
    }
}

/// Run `request` under `policy`
///
/// Returns the first success, the first failure that is not transient, or the
/// last transient failure once `max_attempts` retries have been spent.
/// Attempts never overlap.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryConfig, mut request: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(policy);
    let mut retries = 0u32;

    loop {
        let failure = match request().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(retries, "Request went through after retrying");
                }
                return Ok(value);
            }
            Err(failure) => failure,
        };

        if !failure.is_retryable() {
            tracing::error!(error = %failure, "Request rejected, not retrying");
            return Err(failure);
        }
        if retries >= policy.max_attempts {
            tracing::error!(error = %failure, retries, "Request still failing, giving up");
            return Err(failure);
        }

        retries += 1;
        let pause = backoff.pause();
        tracing::warn!(
            error = %failure,
            retry = retries,
            of = policy.max_attempts,
            pause_ms = pause.as_millis() as u64,
            "Transient request failure"
        );
        tokio::time::sleep(pause).await;
    }
}

/// `delay` scaled by a uniform factor in `[1, 2]`
fn stretch(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}
