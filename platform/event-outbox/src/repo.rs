//! Storage operations on the outbox tables.
//!
//! `enqueue` runs on the caller's open transaction; everything else uses
//! single-row conditional updates so multiple dispatcher instances can
//! share the tables without in-process coordination.

use crate::model::{OutboxKind, OutboxMessage};
use chrono::Utc;
use event_bus::EventEnvelope;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// Append an event to the outbox as part of the caller's transaction.
///
/// Never publishes synchronously: the row commits (or rolls back) with the
/// business mutation, and the dispatcher picks it up afterwards.
pub async fn enqueue<T: Serialize>(
    tx: &mut Transaction<'_, Postgres>,
    kind: OutboxKind,
    envelope: &EventEnvelope<T>,
) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_value(&envelope.payload)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let sql = format!(
        r#"
        INSERT INTO {}
            (event_id, name, version, tenant_id, occurred_at,
             correlation_id, causation_id, payload, created_at, attempts)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), 0)
        "#,
        kind.table()
    );

    sqlx::query(&sql)
        .bind(envelope.event_id)
        .bind(&envelope.name)
        .bind(envelope.version)
        .bind(&envelope.tenant_id)
        .bind(envelope.occurred_at)
        .bind(&envelope.correlation_id)
        .bind(&envelope.causation_id)
        .bind(payload)
        .execute(&mut **tx)
        .await?;

    tracing::debug!(
        event_id = %envelope.event_id,
        name = %envelope.name,
        version = envelope.version,
        outbox = kind.label(),
        "event enqueued to outbox"
    );

    Ok(())
}

/// Fetch a bounded batch of rows ready for dispatch.
///
/// A row is due when it is unprocessed and its backoff window (if any) has
/// passed; batches come back oldest-first.
pub async fn fetch_due(
    pool: &PgPool,
    kind: OutboxKind,
    limit: i64,
) -> Result<Vec<OutboxMessage>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT event_id, name, version, tenant_id, occurred_at,
               correlation_id, causation_id, payload, created_at,
               processed_at, attempts, do_not_process_before
        FROM {}
        WHERE processed_at IS NULL
          AND (do_not_process_before IS NULL OR do_not_process_before <= now())
        ORDER BY created_at ASC
        LIMIT $1
        "#,
        kind.table()
    );

    sqlx::query_as::<_, OutboxMessage>(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Mark a row as successfully handed to the broker.
pub async fn mark_published(
    pool: &PgPool,
    kind: OutboxKind,
    event_id: Uuid,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE {}
        SET processed_at = now()
        WHERE event_id = $1
        "#,
        kind.table()
    );

    sqlx::query(&sql).bind(event_id).execute(pool).await?;

    Ok(())
}

/// Record a failed dispatch: bump attempts and push the row's eligibility
/// past the given backoff delay.
pub async fn mark_failed(
    pool: &PgPool,
    kind: OutboxKind,
    event_id: Uuid,
    delay: Duration,
) -> Result<(), sqlx::Error> {
    let eligible_at = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));

    let sql = format!(
        r#"
        UPDATE {}
        SET attempts = attempts + 1,
            do_not_process_before = $2
        WHERE event_id = $1
        "#,
        kind.table()
    );

    sqlx::query(&sql)
        .bind(event_id)
        .bind(eligible_at)
        .execute(pool)
        .await?;

    Ok(())
}
