//! # Event Bus Transport
//!
//! Broker-facing transport layer for reliable event delivery across modules.
//!
//! ## Why This Lives in Tier 1
//!
//! Publishing and consuming integration events is a **shared runtime
//! capability**: the outbox dispatcher drains through it and every consumer
//! loop reads from it. Placing it in `platform/` keeps feature modules free
//! of broker details and lets dev/test swap the broker for an in-memory
//! double.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream. The
//!   durable stream is the topic exchange; durable consumers are the queue
//!   bindings; publishes resolve only after the broker acknowledges them.
//! - **InMemoryBus**: Test/dev implementation using in-memory channels,
//!   including nack-redelivery so consumer retry paths are exercisable.
//!
//! ## Delivery guarantees
//!
//! Publishing is *confirmed at-least-once*: `publish` returns only once the
//! broker has accepted the message, and consumers may still see duplicates.
//! Deduplication is the consumer side's job (see the inbox in
//! `event-consumer`), not the transport's.

mod envelope;
pub mod headers;
mod inmemory_bus;
mod nats_bus;
pub mod publish_retry;

pub use envelope::{peek_head, subject_for, EnvelopeHead, EventEnvelope, IntegrationEvent};
pub use headers::{MessageHeaders, TraceContext};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use publish_retry::{full_jitter_delay, PublishError, ResilientPublisher};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Errors that can occur when talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("broker i/o failure: {0}")]
    Io(String),

    #[error("broker connection closed: {0}")]
    ConnectionClosed(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("invalid subject: {0}")]
    BadSubject(String),

    #[error("broker did not confirm delivery: {0}")]
    AckFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to subscribe: {0}")]
    SubscribeError(String),

    #[error("internal broker error: {0}")]
    Internal(String),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// How the resilient publisher should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying: the broker may recover (timeout, i/o, reconnect)
    Transient,
    /// Retrying cannot help (auth/ACL, malformed target)
    Permanent,
    /// Not recognized; propagated without retry
    Unclassified,
}

/// Classify a broker failure for retry purposes.
///
/// Classification happens once, at the lowest layer, so callers only ever
/// observe "succeeded" or a final error.
pub fn classify(err: &BusError) -> FailureClass {
    match err {
        BusError::Timeout(_)
        | BusError::Io(_)
        | BusError::ConnectionClosed(_)
        | BusError::AckFailed(_)
        | BusError::Internal(_) => FailureClass::Transient,
        BusError::Unauthorized(_) | BusError::BadSubject(_) => FailureClass::Permanent,
        BusError::Serialization(_) | BusError::SubscribeError(_) => FailureClass::Unclassified,
    }
}

/// Publisher half of the transport.
///
/// `publish` resolves only after broker-level confirmation, so a returned
/// `Ok(())` means the message is durably accepted (at-least-once from here
/// on, not exactly-once).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Vec<u8>,
    ) -> BusResult<()>;
}

/// Subscriber half of the transport.
///
/// `subscribe` declares the durable queue, binds it to each topic, and
/// returns a stream of deliveries. Every delivery must be settled with
/// [`Delivery::ack`] or [`Delivery::nack`]; a nack requeues the message for
/// redelivery.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        queue: &str,
        topics: &[String],
    ) -> BusResult<BoxStream<'static, Delivery>>;
}

/// Settlement handle behind a [`Delivery`].
///
/// Implemented by each transport; consumers never touch this directly.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> BusResult<()>;
    async fn nack(self: Box<Self>) -> BusResult<()>;
}

/// A single message handed to a consumer, with manual settlement.
pub struct Delivery {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Message headers (trace context, correlation, diagnostics)
    pub headers: MessageHeaders,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        subject: String,
        payload: Vec<u8>,
        headers: MessageHeaders,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            subject,
            payload,
            headers,
            acker,
        }
    }

    /// Acknowledge the message; the broker will not redeliver it.
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the message; the broker requeues it.
    pub async fn nack(self) -> BusResult<()> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_classified_for_retry() {
        assert_eq!(
            classify(&BusError::Timeout("publish ack".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&BusError::Io("connection reset".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&BusError::ConnectionClosed("server shutdown".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&BusError::AckFailed("no ack".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&BusError::Internal("forced close".into())),
            FailureClass::Transient
        );
    }

    #[test]
    fn permanent_failures_never_retried() {
        assert_eq!(
            classify(&BusError::Unauthorized("permissions violation".into())),
            FailureClass::Permanent
        );
        assert_eq!(
            classify(&BusError::BadSubject("events..".into())),
            FailureClass::Permanent
        );
    }

    #[test]
    fn everything_else_is_unclassified() {
        assert_eq!(
            classify(&BusError::Serialization("bad json".into())),
            FailureClass::Unclassified
        );
        assert_eq!(
            classify(&BusError::SubscribeError("queue gone".into())),
            FailureClass::Unclassified
        );
    }
}
