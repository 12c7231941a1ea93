//! Static registration tables for event types and their handlers.
//!
//! The composition root registers every event type and handler once at
//! process start; after `build()` both registries are immutable. Dispatch
//! goes through typed closures captured at registration time (decoding
//! produces a type-erased envelope, each handler closure downcasts it back
//! to its concrete type), so no runtime reflection or code generation is
//! involved and resolution is unit-testable in isolation.

use crate::handler::EventHandler;
use event_bus::{EventEnvelope, IntegrationEvent};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type DecodeFn =
    Arc<dyn Fn(&[u8]) -> Result<DecodedEvent, serde_json::Error> + Send + Sync>;
type InvokeFn = Arc<dyn Fn(DecodedEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A fully deserialized envelope with its payload type erased.
///
/// Cheap to clone; every handler of the same delivery shares one decode.
#[derive(Clone)]
pub struct DecodedEvent {
    inner: Arc<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    fn new<T: IntegrationEvent>(envelope: EventEnvelope<T>) -> Self {
        Self {
            inner: Arc::new(envelope),
        }
    }

    fn downcast<T: IntegrationEvent>(&self) -> anyhow::Result<Arc<EventEnvelope<T>>> {
        self.inner
            .clone()
            .downcast::<EventEnvelope<T>>()
            .map_err(|_| anyhow::anyhow!("decoded envelope does not match handler event type"))
    }
}

/// One handler registered for an event type.
pub struct RegisteredHandler {
    name: String,
    invoke_fn: InvokeFn,
}

impl RegisteredHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the handler against a decoded envelope.
    pub fn invoke(&self, event: &DecodedEvent) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.invoke_fn)(event.clone())
    }
}

/// Immutable binding for one `(name, version)` pair: how to decode the
/// typed envelope and which handlers receive it.
pub struct EventBinding {
    name: String,
    version: i16,
    decode_fn: DecodeFn,
    handlers: Vec<RegisteredHandler>,
}

impl EventBinding {
    fn new<T: IntegrationEvent>() -> Self {
        let decode_fn: DecodeFn = Arc::new(|payload| {
            serde_json::from_slice::<EventEnvelope<T>>(payload).map(DecodedEvent::new)
        });
        Self {
            name: T::NAME.to_string(),
            version: T::VERSION,
            decode_fn,
            handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i16 {
        self.version
    }

    /// Deserialize the full typed envelope from wire bytes.
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
        (self.decode_fn)(payload)
    }

    pub fn handlers(&self) -> &[RegisteredHandler] {
        &self.handlers
    }
}

/// Builder used by the composition root to assemble both registries.
///
/// ```rust
/// use event_consumer::{EventHandler, EventRegistryBuilder};
/// use event_bus::{EventEnvelope, IntegrationEvent};
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// use std::sync::Arc;
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct ProjectCompleted { project_id: String }
///
/// impl IntegrationEvent for ProjectCompleted {
///     const NAME: &'static str = "project.completed";
///     const VERSION: i16 = 1;
/// }
///
/// struct NotifyOwner;
///
/// #[async_trait]
/// impl EventHandler<ProjectCompleted> for NotifyOwner {
///     fn name(&self) -> &str { "notify-owner" }
///     async fn handle(&self, _event: &EventEnvelope<ProjectCompleted>) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
///
/// let (registry, subscribers) = EventRegistryBuilder::new()
///     .handler::<ProjectCompleted>(Arc::new(NotifyOwner))
///     .build();
///
/// assert!(registry.resolve("project.completed", 1).is_some());
/// assert_eq!(subscribers.handlers_for("project.completed", 1), ["notify-owner"]);
/// ```
#[derive(Default)]
pub struct EventRegistryBuilder {
    bindings: HashMap<(String, i16), EventBinding>,
}

impl EventRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type with no handlers yet.
    ///
    /// Useful when a queue is bound to a topic whose events are consumed
    /// for accounting only.
    pub fn register<T: IntegrationEvent>(mut self) -> Self {
        self.binding_mut::<T>();
        self
    }

    /// Register a handler, creating the event binding if needed.
    pub fn handler<T: IntegrationEvent>(mut self, handler: Arc<dyn EventHandler<T>>) -> Self {
        let name = handler.name().to_string();
        let invoke_fn: InvokeFn = Arc::new(move |decoded: DecodedEvent| {
            let handler = handler.clone();
            Box::pin(async move {
                let envelope = decoded.downcast::<T>()?;
                handler.handle(&envelope).await
            })
        });

        self.binding_mut::<T>().handlers.push(RegisteredHandler {
            name,
            invoke_fn,
        });
        self
    }

    fn binding_mut<T: IntegrationEvent>(&mut self) -> &mut EventBinding {
        self.bindings
            .entry((T::NAME.to_string(), T::VERSION))
            .or_insert_with(EventBinding::new::<T>)
    }

    /// Freeze both registries.
    pub fn build(self) -> (EventRegistry, SubscriberRegistry) {
        let subscribers = self
            .bindings
            .iter()
            .map(|(key, binding)| {
                let names = binding
                    .handlers
                    .iter()
                    .map(|h| h.name.clone())
                    .collect::<Vec<_>>();
                (key.clone(), names)
            })
            .collect();

        (
            EventRegistry {
                bindings: self.bindings,
            },
            SubscriberRegistry {
                entries: subscribers,
            },
        )
    }
}

/// Immutable map from `(name, version)` to the event's binding.
pub struct EventRegistry {
    bindings: HashMap<(String, i16), EventBinding>,
}

impl EventRegistry {
    /// Resolve an identity pair; `None` means the event type is unknown
    /// and the message should be dropped (and logged), not retried.
    pub fn resolve(&self, name: &str, version: i16) -> Option<&EventBinding> {
        self.bindings.get(&(name.to_string(), version))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Immutable map from `(name, version)` to registered handler identities.
///
/// Used for delivery accounting and diagnostics; dispatch always goes
/// through the closures in [`EventRegistry`].
pub struct SubscriberRegistry {
    entries: HashMap<(String, i16), Vec<String>>,
}

impl SubscriberRegistry {
    pub fn handlers_for(&self, name: &str, version: i16) -> &[String] {
        self.entries
            .get(&(name.to_string(), version))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterate all `(name, version)` pairs with their handler identities.
    pub fn iter(&self) -> impl Iterator<Item = (&(String, i16), &Vec<String>)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ModelPrimed {
        model_id: String,
    }

    impl IntegrationEvent for ModelPrimed {
        const NAME: &'static str = "model.primed";
        const VERSION: i16 = 1;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ModelPainted {
        model_id: String,
    }

    impl IntegrationEvent for ModelPainted {
        const NAME: &'static str = "model.painted";
        const VERSION: i16 = 3;
    }

    struct CountingHandler {
        name: &'static str,
        calls: AtomicU32,
    }

    impl CountingHandler {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler<ModelPrimed> for CountingHandler {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, event: &EventEnvelope<ModelPrimed>) -> anyhow::Result<()> {
            assert_eq!(event.name, "model.primed");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn resolve_finds_exact_identity_only() {
        let (registry, _) = EventRegistryBuilder::new()
            .register::<ModelPrimed>()
            .register::<ModelPainted>()
            .build();

        assert!(registry.resolve("model.primed", 1).is_some());
        assert!(registry.resolve("model.painted", 3).is_some());
        // wrong version or unknown name must not resolve
        assert!(registry.resolve("model.primed", 2).is_none());
        assert!(registry.resolve("model.varnished", 1).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn subscriber_registry_lists_handler_identities() {
        let first = CountingHandler::new("update-gallery");
        let second = CountingHandler::new("notify-owner");

        let (_, subscribers) = EventRegistryBuilder::new()
            .handler::<ModelPrimed>(first)
            .handler::<ModelPrimed>(second)
            .register::<ModelPainted>()
            .build();

        assert_eq!(
            subscribers.handlers_for("model.primed", 1),
            ["update-gallery", "notify-owner"]
        );
        assert!(subscribers.handlers_for("model.painted", 3).is_empty());
        assert!(subscribers.handlers_for("nope", 1).is_empty());
    }

    #[tokio::test]
    async fn decode_and_invoke_reach_the_typed_handler() {
        let handler = CountingHandler::new("update-gallery");
        let (registry, _) = EventRegistryBuilder::new()
            .handler::<ModelPrimed>(handler.clone())
            .build();

        let envelope = EventEnvelope::new(
            "tenant-1",
            ModelPrimed {
                model_id: "mdl-42".to_string(),
            },
        );
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let binding = registry.resolve("model.primed", 1).unwrap();
        let decoded = binding.decode(&bytes).expect("payload should decode");

        for registered in binding.handlers() {
            registered.invoke(&decoded).await.expect("handler should run");
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decode_rejects_payload_that_does_not_match_the_type() {
        let (registry, _) = EventRegistryBuilder::new().register::<ModelPrimed>().build();
        let binding = registry.resolve("model.primed", 1).unwrap();

        // envelope head is fine, payload shape is not
        let wire = serde_json::json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "name": "model.primed",
            "version": 1,
            "tenant_id": "t-1",
            "occurred_at": "2026-01-01T00:00:00Z",
            "payload": {"unexpected": true}
        });

        assert!(binding.decode(wire.to_string().as_bytes()).is_err());
    }

    #[tokio::test]
    async fn mismatched_decoded_event_fails_the_invoke() {
        let handler = CountingHandler::new("update-gallery");
        let (registry, _) = EventRegistryBuilder::new()
            .handler::<ModelPrimed>(handler.clone())
            .register::<ModelPainted>()
            .build();

        let painted = EventEnvelope::new(
            "tenant-1",
            ModelPainted {
                model_id: "mdl-9".to_string(),
            },
        );
        let bytes = serde_json::to_vec(&painted).unwrap();
        let wrong = registry
            .resolve("model.painted", 3)
            .unwrap()
            .decode(&bytes)
            .unwrap();

        let primed_binding = registry.resolve("model.primed", 1).unwrap();
        let err = primed_binding.handlers()[0]
            .invoke(&wrong)
            .await
            .expect_err("downcast must fail");
        assert!(err.to_string().contains("does not match"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
