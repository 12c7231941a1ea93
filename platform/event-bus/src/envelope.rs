//! # Event Envelope
//!
//! Platform-wide event envelope for all inter-module communication.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier; the deduplication key across the whole
//!   pipeline, immutable once created
//! - `name` / `version`: Static identity of the event type, taken from the
//!   payload type's [`IntegrationEvent`] impl
//! - `tenant_id`: Multi-tenant isolation
//! - `occurred_at`: UTC timestamp when the event was generated
//! - `correlation_id`: Links related events in a business transaction
//! - `causation_id`: Links this event to the command/event that caused it
//! - `payload`: Event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static identity marker for integration event payload types.
///
/// Every event that crosses a module boundary declares a stable wire name
/// and a schema version. The registry on the consumer side resolves
/// `(NAME, VERSION)` pairs back to the payload type, so both constants are
/// part of the public contract and must never change for a published
/// version.
///
/// # Examples
///
/// ```rust
/// use event_bus::IntegrationEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct ProjectCompleted {
///     project_id: String,
/// }
///
/// impl IntegrationEvent for ProjectCompleted {
///     const NAME: &'static str = "project.completed";
///     const VERSION: i16 = 1;
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    const VERSION: i16;
}

/// Standard event envelope wrapping every published event.
///
/// Provides metadata for idempotency, tracing, and multi-tenancy. The
/// `event_id` is minted once at creation and never changes; everything
/// downstream (outbox rows, inbox claims, delivery accounting) keys on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Wire name of the event type
    pub name: String,

    /// Schema version of the event type
    pub version: i16,

    /// Tenant identifier for multi-tenant isolation
    pub tenant_id: String,

    /// UTC timestamp when the event was generated
    pub occurred_at: DateTime<Utc>,

    /// Links related events in a business transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Links this event to the command/event that caused it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

impl<T: IntegrationEvent> EventEnvelope<T> {
    /// Create a new envelope with auto-generated `event_id` and
    /// `occurred_at`; name and version come from the payload type.
    pub fn new(tenant_id: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            name: T::NAME.to_string(),
            version: T::VERSION,
            tenant_id: tenant_id.into(),
            occurred_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Create an envelope with an explicit `event_id` (useful for testing)
    pub fn with_event_id(event_id: Uuid, tenant_id: impl Into<String>, payload: T) -> Self {
        Self {
            event_id,
            ..Self::new(tenant_id, payload)
        }
    }
}

impl<T> EventEnvelope<T> {
    /// Set the correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }
}

/// Header-only view of a wire envelope.
///
/// Consumers decode this first so a malformed or unknown message can be
/// dropped before paying for the full typed deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeHead {
    pub event_id: Uuid,
    pub name: String,
    pub version: i16,
}

/// Decode just the envelope header from raw wire bytes.
pub fn peek_head(payload: &[u8]) -> Result<EnvelopeHead, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Routing key for an event identity: `events.{name}.v{version}`.
pub fn subject_for(name: &str, version: i16) -> String {
    format!("events.{name}.v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaintStockDepleted {
        sku: String,
        remaining_ml: i32,
    }

    impl IntegrationEvent for PaintStockDepleted {
        const NAME: &'static str = "paint.stock.depleted";
        const VERSION: i16 = 2;
    }

    #[test]
    fn envelope_takes_identity_from_payload_type() {
        let envelope = EventEnvelope::new(
            "tenant-123",
            PaintStockDepleted {
                sku: "vallejo-70951".to_string(),
                remaining_ml: 0,
            },
        );

        assert_eq!(envelope.name, "paint.stock.depleted");
        assert_eq!(envelope.version, 2);
        assert_eq!(envelope.tenant_id, "tenant-123");
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.causation_id.is_none());
    }

    #[test]
    fn envelope_builder_sets_links() {
        let envelope = EventEnvelope::new(
            "tenant-123",
            PaintStockDepleted {
                sku: "ak-11001".to_string(),
                remaining_ml: 3,
            },
        )
        .with_correlation_id(Some("corr-456".to_string()))
        .with_causation_id(Some("cause-789".to_string()));

        assert_eq!(envelope.correlation_id, Some("corr-456".to_string()));
        assert_eq!(envelope.causation_id, Some("cause-789".to_string()));
    }

    #[test]
    fn peek_head_reads_identity_only() {
        let envelope = EventEnvelope::new(
            "tenant-9",
            PaintStockDepleted {
                sku: "gw-22-11".to_string(),
                remaining_ml: 1,
            },
        );
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let head = peek_head(&bytes).expect("head should decode");
        assert_eq!(head.event_id, envelope.event_id);
        assert_eq!(head.name, "paint.stock.depleted");
        assert_eq!(head.version, 2);
    }

    #[test]
    fn peek_head_tolerates_unknown_fields() {
        let wire = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "name": "model.archived",
            "version": 1,
            "tenant_id": "t-1",
            "occurred_at": "2026-01-01T00:00:00Z",
            "payload": {},
            "some_future_field": true
        });

        let head = peek_head(wire.to_string().as_bytes()).expect("head should decode");
        assert_eq!(head.name, "model.archived");
        assert_eq!(head.version, 1);
    }

    #[test]
    fn peek_head_rejects_malformed_envelopes() {
        assert!(peek_head(b"not json at all").is_err());
        assert!(peek_head(br#"{"name": "x"}"#).is_err());
        assert!(
            peek_head(br#"{"event_id": "not-a-uuid", "name": "x", "version": 1}"#).is_err()
        );
    }

    #[test]
    fn subject_includes_name_and_version() {
        assert_eq!(subject_for("paint.stock.depleted", 2), "events.paint.stock.depleted.v2");
    }

    #[test]
    fn wire_shape_is_stable() {
        let envelope = EventEnvelope::with_event_id(
            Uuid::nil(),
            "tenant-1",
            PaintStockDepleted {
                sku: "p3-93053".to_string(),
                remaining_ml: 17,
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert!(value.get("event_id").is_some());
        assert!(value.get("name").is_some());
        assert!(value.get("version").is_some());
        assert!(value.get("tenant_id").is_some());
        assert!(value.get("occurred_at").is_some());
        assert!(value.get("payload").is_some());
        // absent options are omitted from the wire
        assert!(value.get("correlation_id").is_none());
        assert!(value.get("causation_id").is_none());
    }
}
