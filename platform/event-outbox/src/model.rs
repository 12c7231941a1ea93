use chrono::{DateTime, Utc};
use event_bus::{subject_for, EventEnvelope};
use sqlx::FromRow;
use uuid::Uuid;

/// Which outbox table a row lives in.
///
/// Domain events stay inside the owning service; integration events cross
/// module boundaries. Both share the same shape and dispatch machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxKind {
    Domain,
    Integration,
}

impl OutboxKind {
    pub fn table(&self) -> &'static str {
        match self {
            OutboxKind::Domain => "outbox_domain_events",
            OutboxKind::Integration => "outbox_integration_events",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutboxKind::Domain => "domain",
            OutboxKind::Integration => "integration",
        }
    }
}

/// One persisted outbox row.
///
/// Written by [`enqueue`](crate::enqueue) inside the caller's transaction;
/// mutated only by the dispatcher (attempts, backoff window, processed
/// timestamp). Never deleted by this subsystem.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxMessage {
    pub event_id: Uuid,
    pub name: String,
    pub version: i16,
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub do_not_process_before: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Routing key for this row: `events.{name}.v{version}`.
    pub fn subject(&self) -> String {
        subject_for(&self.name, self.version)
    }

    /// Rebuild the wire envelope from the row's columns.
    pub fn wire_envelope(&self) -> EventEnvelope<serde_json::Value> {
        EventEnvelope {
            event_id: self.event_id,
            name: self.name.clone(),
            version: self.version,
            tenant_id: self.tenant_id.clone(),
            occurred_at: self.occurred_at,
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            payload: self.payload.clone(),
        }
    }
}
