use async_trait::async_trait;
use event_bus::{EventEnvelope, IntegrationEvent};

/// A consumer-side handler for one integration event type.
///
/// Handlers are registered with the
/// [`EventRegistryBuilder`](crate::EventRegistryBuilder) at composition
/// time and invoked by the [`IntegrationConsumer`](crate::IntegrationConsumer)
/// once per delivery, after the inbox claim for `(event_id, name())`.
///
/// Delivery is at-least-once: the inbox short-circuits redeliveries that
/// already processed, but a handler that crashed mid-flight will be invoked
/// again, so side effects must be idempotent.
#[async_trait]
pub trait EventHandler<T: IntegrationEvent>: Send + Sync {
    /// Stable identity for inbox claims and delivery accounting.
    ///
    /// Changing this renames the handler's inbox history, so treat it as
    /// part of the persistence contract.
    fn name(&self) -> &str;

    async fn handle(&self, event: &EventEnvelope<T>) -> anyhow::Result<()>;
}
