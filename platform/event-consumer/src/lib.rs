//! # Integration Event Consumer
//!
//! Consumer-side half of the reliable delivery pipeline: resolves incoming
//! broker messages to typed events, deduplicates them through the inbox,
//! and fans them out to registered handlers.
//!
//! ## Correctness model
//!
//! Transport is at-least-once, so the same `event_id` can arrive any
//! number of times, on any instance. Safety rests on two things:
//!
//! 1. The inbox's composite key `(event_id, handler)` with a
//!    conflict-ignored insert: exactly one consumer wins the first claim,
//!    and a processed row short-circuits every later redelivery.
//! 2. Handler idempotency for the in-flight window, where a crashed
//!    attempt is retried.
//!
//! A handler failure escapes the message callback, the delivery is nacked,
//! and the broker redelivers; the owning queue loop keeps running. Only
//! transport-level faults restart a loop, with doubling backoff.
//!
//! ## Composition
//!
//! The hosting application wires everything at process start: it builds
//! the registries with [`EventRegistryBuilder`], supplies the queue →
//! topic [`SubscriptionMap`], and hands both to
//! [`IntegrationConsumer::spawn`] together with the storage pool, the
//! broker subscriber, and a shutdown signal.

mod consumer;
mod deliveries;
mod handler;
mod inbox;
mod registry;

pub use consumer::{
    ConsumeError, ConsumerConfig, IntegrationConsumer, SubscriptionMap,
};
pub use deliveries::{defer, mark_delivered, record_attempt};
pub use handler::EventHandler;
pub use inbox::{bump_attempts, mark_processed, try_claim, InboxClaim};
pub use registry::{
    DecodedEvent, EventBinding, EventRegistry, EventRegistryBuilder, RegisteredHandler,
    SubscriberRegistry,
};

/// Embedded migrations for the inbox and delivery-accounting tables.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!()
}
