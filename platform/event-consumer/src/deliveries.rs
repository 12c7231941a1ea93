//! Per-subscriber delivery accounting.
//!
//! One row per `(event_id, subscriber)` with its own attempts counter and
//! backoff window, so a subscriber's repeated failures are visible in
//! isolation from its siblings. Accounting only; the inbox decides
//! whether a handler actually runs.

use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Upsert the delivery row and count an attempt; returns the attempt
/// number now underway.
pub async fn record_attempt(
    pool: &PgPool,
    event_id: Uuid,
    subscriber: &str,
) -> Result<i32, sqlx::Error> {
    let row: (i32,) = sqlx::query_as(
        r#"
        INSERT INTO integration_deliveries (event_id, subscriber, attempts)
        VALUES ($1, $2, 1)
        ON CONFLICT (event_id, subscriber) DO UPDATE
        SET attempts = integration_deliveries.attempts + 1
        RETURNING attempts
        "#,
    )
    .bind(event_id)
    .bind(subscriber)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Record successful delivery to a subscriber.
pub async fn mark_delivered(
    pool: &PgPool,
    event_id: Uuid,
    subscriber: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE integration_deliveries
        SET processed_at = now()
        WHERE event_id = $1 AND subscriber = $2
        "#,
    )
    .bind(event_id)
    .bind(subscriber)
    .execute(pool)
    .await?;

    Ok(())
}

/// Push the subscriber's retry window out after a failed attempt.
pub async fn defer(
    pool: &PgPool,
    event_id: Uuid,
    subscriber: &str,
    delay: Duration,
) -> Result<(), sqlx::Error> {
    let eligible_at = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));

    sqlx::query(
        r#"
        UPDATE integration_deliveries
        SET do_not_process_before = $3
        WHERE event_id = $1 AND subscriber = $2
        "#,
    )
    .bind(event_id)
    .bind(subscriber)
    .bind(eligible_at)
    .execute(pool)
    .await?;

    Ok(())
}
