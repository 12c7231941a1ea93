//! # Transactional Outbox
//!
//! Reliable "intent to publish" storage for integration and domain events.
//!
//! A module that mutates business state appends an outbox row **inside its
//! own open transaction** via [`enqueue`]; both commit or both roll back,
//! so there is no dual-write window. A background [`OutboxDispatcher`]
//! polls for unprocessed rows and drains them through a
//! [`ResilientPublisher`](event_bus::ResilientPublisher), marking each row
//! processed only after the broker confirms it.
//!
//! From the caller's perspective a request that wrote an outbox row always
//! succeeds, even if delivery later fails or is delayed: decoupling
//! business-transaction success from transport success is the point of the
//! pattern.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::EventEnvelope;
//! use event_outbox::{enqueue, OutboxKind};
//! # use event_bus::IntegrationEvent;
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Debug, Clone, Serialize, Deserialize)]
//! # struct ProjectCompleted { project_id: String }
//! # impl IntegrationEvent for ProjectCompleted {
//! #     const NAME: &'static str = "project.completed";
//! #     const VERSION: i16 = 1;
//! # }
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), sqlx::Error> {
//! let mut tx = pool.begin().await?;
//!
//! // ... business mutation on the same transaction ...
//!
//! let envelope = EventEnvelope::new(
//!     "tenant-123",
//!     ProjectCompleted { project_id: "proj-7".into() },
//! );
//! enqueue(&mut tx, OutboxKind::Integration, &envelope).await?;
//!
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod model;
mod repo;

pub use dispatcher::{DispatcherConfig, DrainStats, OutboxDispatcher};
pub use model::{OutboxKind, OutboxMessage};
pub use repo::{enqueue, fetch_due, mark_failed, mark_published};

/// Embedded migrations for the outbox tables.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!()
}
