//! NATS JetStream implementation of the transport traits.

use crate::headers::MessageHeaders;
use crate::{Acknowledge, BusError, BusResult, Delivery, EventPublisher, EventSubscriber};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::time::timeout;

/// How long to wait for the broker to accept a publish or confirm it
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Production transport backed by NATS JetStream.
///
/// The JetStream stream plays the role of the durable topic exchange: it is
/// declared once at construction with the subject space all events share.
/// Each queue becomes a durable pull consumer bound to its topics via
/// filter subjects, with explicit acks.
///
/// # Example
/// ```rust,no_run
/// use event_bus::NatsBus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::connect(client, "EVENTS", vec!["events.>".to_string()]).await?;
/// # Ok(())
/// # }
/// ```
pub struct NatsBus {
    jetstream: jetstream::Context,
    stream_name: String,
}

impl NatsBus {
    /// Declare the durable stream (the exchange) and return the transport.
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    /// * `stream_name` - Name of the JetStream stream backing all events
    /// * `subjects` - Subject space the stream captures (e.g. `events.>`)
    pub async fn connect(
        client: Client,
        stream_name: &str,
        subjects: Vec<String>,
    ) -> BusResult<Self> {
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(stream::Config {
                name: stream_name.to_string(),
                subjects,
                retention: stream::RetentionPolicy::Limits,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| map_broker_error("declare stream", e))?;

        Ok(Self {
            jetstream,
            stream_name: stream_name.to_string(),
        })
    }
}

#[async_trait]
impl EventPublisher for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let mut nats_headers = HeaderMap::new();
        for (name, value) in headers.iter() {
            nats_headers.insert(name, value);
        }

        // First await: the broker accepts the message. Second await: the
        // broker-level publish confirmation. Only then is the message
        // durably "at least once".
        let ack = timeout(
            PUBLISH_TIMEOUT,
            self.jetstream
                .publish_with_headers(subject.to_string(), nats_headers, payload.into()),
        )
        .await
        .map_err(|_| BusError::Timeout(format!("publish to {subject}")))?
        .map_err(|e| map_broker_error(subject, e))?;

        timeout(PUBLISH_TIMEOUT, ack)
            .await
            .map_err(|_| BusError::Timeout(format!("publish confirmation for {subject}")))?
            .map_err(|e| BusError::AckFailed(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for NatsBus {
    async fn subscribe(
        &self,
        queue: &str,
        topics: &[String],
    ) -> BusResult<BoxStream<'static, Delivery>> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                queue,
                pull::Config {
                    durable_name: Some(queue.to_string()),
                    filter_subjects: topics.to_vec(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let queue = queue.to_string();
        let deliveries = async_stream::stream! {
            while let Some(item) = messages.next().await {
                match item {
                    Ok(msg) => {
                        let subject = msg.subject.to_string();
                        let payload = msg.payload.to_vec();
                        let headers = convert_headers(msg.headers.as_ref());
                        yield Delivery::new(
                            subject,
                            payload,
                            headers,
                            Box::new(JetStreamAcker { message: msg }),
                        );
                    }
                    Err(e) => {
                        // Transport fault: end the stream so the owning
                        // consumer loop resubscribes with backoff.
                        tracing::warn!(queue = %queue, error = %e, "jetstream message stream failed");
                        break;
                    }
                }
            }
        };

        Ok(deliveries.boxed())
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledge for JetStreamAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckFailed(e.to_string()))
    }

    async fn nack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::AckFailed(e.to_string()))
    }
}

fn convert_headers(nats_headers: Option<&HeaderMap>) -> MessageHeaders {
    let mut headers = MessageHeaders::new();
    if let Some(nats_headers) = nats_headers {
        for (key, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }
    headers
}

/// Map a broker error into the taxonomy the retry layer classifies.
///
/// NATS surfaces auth and subject problems as error strings, so this is a
/// best-effort mapping; anything unrecognized lands in `Io` (transient).
fn map_broker_error(context: &str, err: impl std::fmt::Display) -> BusError {
    let text = err.to_string();
    let lowered = text.to_lowercase();

    if lowered.contains("permissions violation") || lowered.contains("authorization") {
        BusError::Unauthorized(format!("{context}: {text}"))
    } else if lowered.contains("invalid subject") || lowered.contains("invalid stream") {
        BusError::BadSubject(format!("{context}: {text}"))
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        BusError::Timeout(format!("{context}: {text}"))
    } else if lowered.contains("connection closed") || lowered.contains("disconnected") {
        BusError::ConnectionClosed(format!("{context}: {text}"))
    } else {
        BusError::Io(format!("{context}: {text}"))
    }
}
