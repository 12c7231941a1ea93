//! Supervised consumption loops: one task per queue, inbox-deduplicated
//! handler fan-out per message.

use crate::deliveries;
use crate::inbox::{self, InboxClaim};
use crate::registry::{DecodedEvent, EventBinding, EventRegistry, SubscriberRegistry};
use event_bus::headers::CORRELATION_ID_HEADER;
use event_bus::{
    full_jitter_delay, peek_head, Delivery, EnvelopeHead, EventSubscriber, TraceContext,
};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Fixed queue → topic bindings, supplied by the hosting application.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a queue to one or more topics. Binding the same queue again
    /// extends its topic list.
    pub fn subscribe(
        mut self,
        queue: impl Into<String>,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.entries
            .entry(queue.into())
            .or_default()
            .extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn into_entries(self) -> BTreeMap<String, Vec<String>> {
        self.entries
    }
}

/// Loop supervision tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// First delay before resubscribing after a transport fault
    pub resubscribe_initial: Duration,
    /// Ceiling for the doubling resubscribe delay
    pub resubscribe_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            resubscribe_initial: Duration::from_secs(1),
            resubscribe_max: Duration::from_secs(30),
        }
    }
}

pub(crate) struct ConsumerCtx {
    pub(crate) db: PgPool,
    pub(crate) subscriber: Arc<dyn EventSubscriber>,
    pub(crate) registry: EventRegistry,
    pub(crate) subscribers: SubscriberRegistry,
}

/// Runs one supervised consumption loop per configured queue.
///
/// Each loop owns its own broker subscription. A single message's failure
/// never terminates a loop: handler errors nack the message and rely on
/// broker redelivery plus the inbox for correctness. Only transport-level
/// faults restart a loop, with doubling backoff between attempts.
pub struct IntegrationConsumer {
    ctx: Arc<ConsumerCtx>,
    subscriptions: SubscriptionMap,
    config: ConsumerConfig,
}

impl IntegrationConsumer {
    pub fn new(
        db: PgPool,
        subscriber: Arc<dyn EventSubscriber>,
        registry: EventRegistry,
        subscribers: SubscriberRegistry,
        subscriptions: SubscriptionMap,
    ) -> Self {
        Self {
            ctx: Arc::new(ConsumerCtx {
                db,
                subscriber,
                registry,
                subscribers,
            }),
            subscriptions,
            config: ConsumerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn one supervised task per queue; tasks stop when the shutdown
    /// signal fires (including mid-backoff).
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            queues = self.subscriptions.len(),
            event_types = self.ctx.registry.len(),
            "starting integration consumer"
        );
        for ((name, version), handlers) in self.ctx.subscribers.iter() {
            tracing::debug!(
                event_name = %name,
                event_version = version,
                subscribers = ?handlers,
                "registered event subscribers"
            );
        }

        self.subscriptions
            .into_entries()
            .into_iter()
            .map(|(queue, topics)| {
                let ctx = self.ctx.clone();
                let config = self.config.clone();
                let receiver = shutdown.subscribe();
                tokio::spawn(run_queue_loop(ctx, queue, topics, config, receiver))
            })
            .collect()
    }
}

async fn run_queue_loop(
    ctx: Arc<ConsumerCtx>,
    queue: String,
    topics: Vec<String>,
    config: ConsumerConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(queue = %queue, topics = ?topics, "starting consumer loop");

    let mut backoff = config.resubscribe_initial;

    'supervise: loop {
        let subscribed = tokio::select! {
            _ = shutdown.recv() => break 'supervise,
            result = ctx.subscriber.subscribe(&queue, &topics) => result,
        };

        let mut stream = match subscribed {
            Ok(stream) => {
                tracing::info!(queue = %queue, "subscribed");
                backoff = config.resubscribe_initial;
                stream
            }
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "subscribe failed, retrying"
                );
                if wait_or_shutdown(backoff, &mut shutdown).await {
                    break 'supervise;
                }
                backoff = (backoff * 2).min(config.resubscribe_max);
                continue 'supervise;
            }
        };

        loop {
            let delivery = tokio::select! {
                _ = shutdown.recv() => break 'supervise,
                delivery = futures::StreamExt::next(&mut stream) => delivery,
            };

            match delivery {
                Some(delivery) => handle_delivery(&ctx, &queue, delivery).await,
                None => {
                    tracing::warn!(
                        queue = %queue,
                        backoff_ms = backoff.as_millis() as u64,
                        "delivery stream ended, resubscribing"
                    );
                    break;
                }
            }
        }

        if wait_or_shutdown(backoff, &mut shutdown).await {
            break 'supervise;
        }
        backoff = (backoff * 2).min(config.resubscribe_max);
    }

    tracing::info!(queue = %queue, "consumer loop stopped");
}

/// Returns true when shutdown fired during the wait.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Errors escaping a message's dispatch; any of these nack the delivery so
/// the broker redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("storage failure during consume: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: anyhow::Error,
    },
}

pub(crate) async fn handle_delivery(ctx: &ConsumerCtx, queue: &str, delivery: Delivery) {
    // Header first: malformed and unknown messages are dropped before the
    // full typed decode. There is no dead-letter route yet, so dropping is
    // deliberate and loud.
    let head = match peek_head(&delivery.payload) {
        Ok(head) => head,
        Err(e) => {
            tracing::warn!(
                queue = %queue,
                subject = %delivery.subject,
                error = %e,
                "malformed envelope, dropping message"
            );
            settle_ack(delivery).await;
            return;
        }
    };

    let binding = match ctx.registry.resolve(&head.name, head.version) {
        Some(binding) => binding,
        None => {
            tracing::warn!(
                queue = %queue,
                event_id = %head.event_id,
                event_name = %head.name,
                event_version = head.version,
                "unknown event type, dropping message"
            );
            settle_ack(delivery).await;
            return;
        }
    };

    let decoded = match binding.decode(&delivery.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(
                queue = %queue,
                event_id = %head.event_id,
                event_name = %head.name,
                error = %e,
                "envelope failed typed decode, dropping message"
            );
            settle_ack(delivery).await;
            return;
        }
    };

    let trace = TraceContext::extract(&delivery.headers).unwrap_or_else(TraceContext::generate);
    let correlation_id = delivery
        .headers
        .get(CORRELATION_ID_HEADER)
        .unwrap_or("none")
        .to_string();

    let span = tracing::info_span!(
        "consume_event",
        event_id = %head.event_id,
        event_name = %head.name,
        event_version = head.version,
        queue = %queue,
        subject = %delivery.subject,
        trace_id = %trace.trace_id,
        parent_span_id = %trace.span_id,
        correlation_id = %correlation_id,
    );

    let outcome = dispatch(ctx, &head, binding, &decoded).instrument(span).await;

    match outcome {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                tracing::error!(event_id = %head.event_id, error = %e, "failed to ack delivery");
            }
        }
        Err(e) => {
            tracing::error!(
                event_id = %head.event_id,
                event_name = %head.name,
                error = %e,
                "message processing failed, requeueing for redelivery"
            );
            if let Err(e) = delivery.nack().await {
                tracing::error!(event_id = %head.event_id, error = %e, "failed to nack delivery");
            }
        }
    }
}

/// Fan out to every registered handler, each gated by its own inbox claim.
async fn dispatch(
    ctx: &ConsumerCtx,
    head: &EnvelopeHead,
    binding: &EventBinding,
    decoded: &DecodedEvent,
) -> Result<(), ConsumeError> {
    for handler in binding.handlers() {
        match inbox::try_claim(&ctx.db, head.event_id, handler.name()).await? {
            InboxClaim::AlreadyProcessed => {
                tracing::debug!(
                    handler = handler.name(),
                    "event already processed by this handler, skipping"
                );
                continue;
            }
            InboxClaim::Accepted | InboxClaim::InFlight => {}
        }

        let attempt = inbox::bump_attempts(&ctx.db, head.event_id, handler.name()).await?;
        deliveries::record_attempt(&ctx.db, head.event_id, handler.name()).await?;

        match handler.invoke(decoded).await {
            Ok(()) => {
                inbox::mark_processed(&ctx.db, head.event_id, handler.name()).await?;
                deliveries::mark_delivered(&ctx.db, head.event_id, handler.name()).await?;
                tracing::info!(handler = handler.name(), attempt, "handler completed");
            }
            Err(source) => {
                let delay = full_jitter_delay(attempt.max(1) as u32);
                deliveries::defer(&ctx.db, head.event_id, handler.name(), delay).await?;
                return Err(ConsumeError::Handler {
                    handler: handler.name().to_string(),
                    source,
                });
            }
        }
    }

    Ok(())
}

async fn settle_ack(delivery: Delivery) {
    let subject = delivery.subject.clone();
    if let Err(e) = delivery.ack().await {
        tracing::error!(subject = %subject, error = %e, "failed to ack dropped message");
    }
}
