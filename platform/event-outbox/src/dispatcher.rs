//! Background task that drains outbox rows to the broker.

use crate::model::OutboxKind;
use crate::repo::{fetch_due, mark_failed, mark_published};
use event_bus::headers::{
    CORRELATION_ID_HEADER, EVENT_ID_HEADER, EVENT_NAME_HEADER, EVENT_VERSION_HEADER,
};
use event_bus::{full_jitter_delay, MessageHeaders, ResilientPublisher, TraceContext};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::broadcast;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll for due rows
    pub poll_interval: Duration,
    /// Maximum rows drained per table per tick
    pub batch_size: i64,
    /// Which outbox tables this dispatcher drains
    pub kinds: Vec<OutboxKind>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            kinds: vec![OutboxKind::Domain, OutboxKind::Integration],
        }
    }
}

/// Counts from one drain pass over a single table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub published: usize,
    pub failed: usize,
}

/// Polls the outbox tables and drains due rows through the resilient
/// publisher.
///
/// Multiple instances may run against the same tables: all coordination is
/// done through the rows themselves (conditional updates), never through
/// in-process locks. Rows that fail to publish get a jittered backoff
/// window and stay eligible forever; attempts are counted but not bounded
/// into a parked state.
pub struct OutboxDispatcher {
    db: PgPool,
    publisher: ResilientPublisher,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(db: PgPool, publisher: ResilientPublisher, config: DispatcherConfig) -> Self {
        Self {
            db,
            publisher,
            config,
        }
    }

    /// Run until the shutdown signal fires.
    ///
    /// Storage errors end the tick, not the loop; the next tick retries
    /// from a fresh scan.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "starting outbox dispatcher"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("outbox dispatcher stopping");
                    return;
                }
                _ = interval.tick() => {}
            }
            tick_count += 1;

            for kind in &self.config.kinds {
                let drained = tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("outbox dispatcher stopping mid-drain");
                        return;
                    }
                    result = self.drain(*kind) => result,
                };

                match drained {
                    Ok(stats) if stats.published > 0 || stats.failed > 0 => {
                        tracing::info!(
                            tick = tick_count,
                            outbox = kind.label(),
                            published = stats.published,
                            failed = stats.failed,
                            "drained outbox batch"
                        );
                    }
                    Ok(_) => {
                        if tick_count <= 3 || tick_count % 60 == 0 {
                            tracing::debug!(tick = tick_count, outbox = kind.label(), "no due outbox rows");
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            tick = tick_count,
                            outbox = kind.label(),
                            error = %e,
                            "outbox drain pass failed"
                        );
                    }
                }
            }
        }
    }

    /// Drain one batch of due rows from the given table.
    ///
    /// Publish failures mark the row for later and keep going; only
    /// storage errors abort the pass.
    pub async fn drain(&self, kind: OutboxKind) -> Result<DrainStats, sqlx::Error> {
        let due = fetch_due(&self.db, kind, self.config.batch_size).await?;
        let mut stats = DrainStats::default();

        for row in due {
            let subject = row.subject();

            let payload = match serde_json::to_vec(&row.wire_envelope()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // jsonb columns round-trip, so this indicates a corrupt
                    // row; count a failed attempt and move on.
                    tracing::error!(
                        event_id = %row.event_id,
                        error = %e,
                        "failed to serialize outbox row"
                    );
                    let delay = full_jitter_delay(attempt_number(row.attempts));
                    mark_failed(&self.db, kind, row.event_id, delay).await?;
                    stats.failed += 1;
                    continue;
                }
            };

            let mut headers = MessageHeaders::new();
            TraceContext::generate().inject(&mut headers);
            headers.insert(EVENT_ID_HEADER, row.event_id.to_string());
            headers.insert(EVENT_NAME_HEADER, row.name.clone());
            headers.insert(EVENT_VERSION_HEADER, row.version.to_string());
            if let Some(correlation_id) = &row.correlation_id {
                headers.insert(CORRELATION_ID_HEADER, correlation_id.clone());
            }

            match self.publisher.publish(&subject, &headers, payload).await {
                Ok(()) => {
                    mark_published(&self.db, kind, row.event_id).await?;
                    stats.published += 1;

                    tracing::info!(
                        event_id = %row.event_id,
                        name = %row.name,
                        version = row.version,
                        subject = %subject,
                        "outbox event published"
                    );
                }
                Err(e) => {
                    // Classification already happened below us; whatever
                    // arrives here is final for this pass. Push the row's
                    // eligibility out and leave it for a later scan.
                    let attempt = attempt_number(row.attempts);
                    let delay = full_jitter_delay(attempt);
                    mark_failed(&self.db, kind, row.event_id, delay).await?;
                    stats.failed += 1;

                    tracing::warn!(
                        event_id = %row.event_id,
                        subject = %subject,
                        attempts = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbox publish failed, row deferred"
                    );
                }
            }
        }

        Ok(stats)
    }
}

/// The attempt being recorded now, given the attempts already on the row.
fn attempt_number(prior_attempts: i32) -> u32 {
    (prior_attempts.max(0) as u32).saturating_add(1)
}
