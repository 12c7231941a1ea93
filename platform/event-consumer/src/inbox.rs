//! Inbox operations: the idempotency primitive for at-least-once delivery.
//!
//! Every operation here is a single atomic statement, so concurrent
//! consumer instances coordinate purely through the database: no
//! in-process locks, no single-writer assumption.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Outcome of an inbox claim for `(event_id, handler)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxClaim {
    /// Fresh row inserted; this consumer owns the first attempt.
    Accepted,
    /// Row exists with `processed_at` set; skip as an idempotent no-op.
    AlreadyProcessed,
    /// Row exists but unfinished: an earlier attempt crashed or another
    /// instance is mid-flight. Proceeding is safe because the handler is
    /// required to be idempotent.
    InFlight,
}

/// Atomically claim an event for a handler.
///
/// The conflict-ignored insert is the load-bearing primitive: exactly one
/// consumer wins the insert, every loser observes the existing row.
pub async fn try_claim(
    pool: &PgPool,
    event_id: Uuid,
    handler: &str,
) -> Result<InboxClaim, sqlx::Error> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO inbox_events (event_id, handler, attempts, received_at)
        VALUES ($1, $2, 0, now())
        ON CONFLICT (event_id, handler) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(handler)
    .execute(pool)
    .await?
    .rows_affected();

    if inserted == 1 {
        return Ok(InboxClaim::Accepted);
    }

    let processed_at: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
        r#"
        SELECT processed_at FROM inbox_events
        WHERE event_id = $1 AND handler = $2
        "#,
    )
    .bind(event_id)
    .bind(handler)
    .fetch_optional(pool)
    .await?;

    match processed_at {
        Some((Some(_),)) => Ok(InboxClaim::AlreadyProcessed),
        // Row vanished between statements only if someone deleted it
        // manually; treat like in-flight and proceed.
        _ => Ok(InboxClaim::InFlight),
    }
}

/// Increment the attempt counter before invoking the handler; returns the
/// attempt number now underway.
pub async fn bump_attempts(
    pool: &PgPool,
    event_id: Uuid,
    handler: &str,
) -> Result<i32, sqlx::Error> {
    let row: (i32,) = sqlx::query_as(
        r#"
        UPDATE inbox_events
        SET attempts = attempts + 1
        WHERE event_id = $1 AND handler = $2
        RETURNING attempts
        "#,
    )
    .bind(event_id)
    .bind(handler)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Record successful handler completion.
pub async fn mark_processed(
    pool: &PgPool,
    event_id: Uuid,
    handler: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE inbox_events
        SET processed_at = now()
        WHERE event_id = $1 AND handler = $2
        "#,
    )
    .bind(event_id)
    .bind(handler)
    .execute(pool)
    .await?;

    tracing::debug!(event_id = %event_id, handler = %handler, "inbox row marked processed");

    Ok(())
}
