//! Resilient publishing with failure classification and jittered backoff.
//!
//! Wraps a shared [`EventPublisher`] so callers (the outbox dispatcher)
//! only ever observe "succeeded" or a final, classified error: permanent
//! failures surface immediately, transient ones are retried with
//! full-jitter exponential backoff before the last broker error is handed
//! back.

use crate::{classify, BusError, EventPublisher, FailureClass, MessageHeaders};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// In-process publish attempts per message before giving up
pub const MAX_PUBLISH_ATTEMPTS: u32 = 5;

/// First backoff bound; doubles per attempt
pub const BASE_DELAY: Duration = Duration::from_millis(200);

/// Ceiling for the backoff bound
pub const MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Final outcome of a resilient publish.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Retrying cannot help; surfaced on the first occurrence.
    #[error("permanent publish failure: {0}")]
    Permanent(#[source] BusError),

    /// All retry attempts failed; carries the last broker error.
    #[error("publish retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: BusError,
    },

    /// Failure the classifier does not recognize; not retried.
    #[error("unclassified publish failure: {0}")]
    Unclassified(#[source] BusError),
}

/// Full-jitter backoff delay for the given attempt (1-based).
///
/// Sampled uniformly from `0..=min(BASE · 2^(attempt-1), MAX)`, so
/// concurrent dispatchers retrying the same window spread out instead of
/// stampeding the broker.
pub fn full_jitter_delay(attempt: u32) -> Duration {
    let bound = backoff_bound(attempt);
    let millis = rand::thread_rng().gen_range(0..=bound.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Upper bound of the jitter window for the given attempt (1-based).
pub fn backoff_bound(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let millis = (BASE_DELAY.as_millis() as u64)
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
    Duration::from_millis(millis.min(MAX_DELAY.as_millis() as u64))
}

/// Decorator adding classified retry behavior to a shared publisher.
///
/// Safe to reuse across concurrent callers: each publish runs its own
/// retry loop against the shared inner publisher.
#[derive(Clone)]
pub struct ResilientPublisher {
    inner: Arc<dyn EventPublisher>,
    max_attempts: u32,
}

impl ResilientPublisher {
    pub fn new(inner: Arc<dyn EventPublisher>) -> Self {
        Self {
            inner,
            max_attempts: MAX_PUBLISH_ATTEMPTS,
        }
    }

    /// Override the attempt ceiling (tests)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Publish with classified retries.
    ///
    /// Permanent and unclassified failures return after the first attempt;
    /// transient failures retry up to the attempt ceiling with full-jitter
    /// delays in between, then hand back the last broker error.
    pub async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.inner.publish(subject, headers, payload.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(subject = %subject, attempt, "publish succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            match classify(&err) {
                FailureClass::Permanent => {
                    warn!(subject = %subject, error = %err, "permanent publish failure, not retrying");
                    return Err(PublishError::Permanent(err));
                }
                FailureClass::Unclassified => {
                    warn!(subject = %subject, error = %err, "unclassified publish failure, not retrying");
                    return Err(PublishError::Unclassified(err));
                }
                FailureClass::Transient => {
                    if attempt >= self.max_attempts {
                        warn!(
                            subject = %subject,
                            attempts = attempt,
                            error = %err,
                            "publish retries exhausted"
                        );
                        return Err(PublishError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = full_jitter_delay(attempt);
                    warn!(
                        subject = %subject,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient publish failure, retrying with backoff"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
