//! In-memory implementation of the transport traits for testing and
//! development.

use crate::headers::MessageHeaders;
use crate::{Acknowledge, BusError, BusResult, Delivery, EventPublisher, EventSubscriber};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Transport backed by in-memory channels.
///
/// Suitable for unit tests, local development without Docker, and
/// integration tests that need a fast, isolated bus. Messages are broadcast
/// to every subscription whose topics match; a nacked delivery is requeued
/// on its own subscription, which is what consumer retry paths need to be
/// exercisable without a broker.
///
/// Not a faithful queue-group: two subscriptions with the same queue name
/// both receive every message.
///
/// # Example
/// ```rust
/// use event_bus::{EventPublisher, EventSubscriber, InMemoryBus, MessageHeaders};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus
///     .subscribe("inventory", &["events.paint.>".to_string()])
///     .await?;
///
/// bus.publish("events.paint.stock.depleted.v1", &MessageHeaders::new(), b"{}".to_vec())
///     .await?;
///
/// let delivery = stream.next().await.unwrap();
/// assert_eq!(delivery.subject, "events.paint.stock.depleted.v1");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    // Single broadcast channel for all messages; subscriptions filter by
    // topic pattern. A large buffer avoids dropping messages in tests.
    sender: Arc<broadcast::Sender<PublishedMessage>>,
}

#[derive(Debug, Clone)]
struct PublishedMessage {
    subject: String,
    payload: Vec<u8>,
    headers: MessageHeaders,
}

impl InMemoryBus {
    /// Create a new in-memory bus with a buffer of 1000 messages.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory bus with a custom buffer size.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Check if a subject matches a subscription pattern.
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        if subject.is_empty() || subject.contains("..") {
            return Err(BusError::BadSubject(subject.to_string()));
        }

        let msg = PublishedMessage {
            subject: subject.to_string(),
            payload,
            headers: headers.clone(),
        };

        // Ignore the error if there are no receivers (that's fine)
        let _ = self.sender.send(msg);

        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for InMemoryBus {
    async fn subscribe(
        &self,
        queue: &str,
        topics: &[String],
    ) -> BusResult<BoxStream<'static, Delivery>> {
        let mut receiver = self.sender.subscribe();
        let (redeliver_tx, mut redeliver_rx) = mpsc::unbounded_channel::<PublishedMessage>();
        let topics = topics.to_vec();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                // Requeued (nacked) messages take priority over new ones.
                let msg = tokio::select! {
                    biased;
                    Some(msg) = redeliver_rx.recv() => msg,
                    result = receiver.recv() => match result {
                        Ok(msg) => {
                            if !topics.iter().any(|t| InMemoryBus::matches_pattern(&msg.subject, t)) {
                                continue;
                            }
                            msg
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(queue = %queue, skipped, "in-memory subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                yield Delivery::new(
                    msg.subject.clone(),
                    msg.payload.clone(),
                    msg.headers.clone(),
                    Box::new(InMemoryAcker {
                        message: msg,
                        redeliver: redeliver_tx.clone(),
                    }),
                );
            }
        };

        Ok(stream.boxed())
    }
}

struct InMemoryAcker {
    message: PublishedMessage,
    redeliver: mpsc::UnboundedSender<PublishedMessage>,
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> BusResult<()> {
        self.redeliver
            .send(self.message)
            .map_err(|_| BusError::AckFailed("subscription dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topics(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    async fn next_delivery(stream: &mut BoxStream<'static, Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
    }

    #[test]
    fn test_pattern_matching() {
        // Exact match
        assert!(InMemoryBus::matches_pattern(
            "events.paint.stock.depleted.v1",
            "events.paint.stock.depleted.v1"
        ));

        // Single wildcard
        assert!(InMemoryBus::matches_pattern("events.model.created.v1", "events.*.created.v1"));
        assert!(!InMemoryBus::matches_pattern("events.model.created.v1", "events.*.v1"));

        // Multi-level wildcard
        assert!(InMemoryBus::matches_pattern("events.model.created.v1", "events.>"));
        assert!(!InMemoryBus::matches_pattern("events.model.created.v1", "commands.>"));

        // Edge cases
        assert!(InMemoryBus::matches_pattern("single", "*"));
        assert!(InMemoryBus::matches_pattern("single", ">"));
        assert!(!InMemoryBus::matches_pattern("one.two", "one"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscription() {
        let bus = InMemoryBus::new();
        let mut stream = bus
            .subscribe("q1", &topics(&["events.>"]))
            .await
            .unwrap();

        let mut headers = MessageHeaders::new();
        headers.insert("event-id", "abc");
        bus.publish("events.model.created.v1", &headers, b"payload".to_vec())
            .await
            .unwrap();

        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.subject, "events.model.created.v1");
        assert_eq!(delivery.payload, b"payload");
        assert_eq!(delivery.headers.get("event-id"), Some("abc"));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn non_matching_topics_are_filtered() {
        let bus = InMemoryBus::new();
        let mut stream = bus
            .subscribe("q1", &topics(&["events.paint.*.v1"]))
            .await
            .unwrap();

        bus.publish("events.model.created.v1", &MessageHeaders::new(), b"no".to_vec())
            .await
            .unwrap();
        bus.publish("events.paint.depleted.v1", &MessageHeaders::new(), b"yes".to_vec())
            .await
            .unwrap();

        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.subject, "events.paint.depleted.v1");
        delivery.ack().await.unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(nothing.is_err(), "should timeout, no more messages");
    }

    #[tokio::test]
    async fn nack_requeues_for_redelivery() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("q1", &topics(&["events.>"])).await.unwrap();

        bus.publish("events.x.v1", &MessageHeaders::new(), b"retry me".to_vec())
            .await
            .unwrap();

        let first = next_delivery(&mut stream).await;
        first.nack().await.unwrap();

        let second = next_delivery(&mut stream).await;
        assert_eq!(second.subject, "events.x.v1");
        assert_eq!(second.payload, b"retry me");
        second.ack().await.unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(nothing.is_err(), "acked message must not reappear");
    }

    #[tokio::test]
    async fn each_subscription_gets_its_own_copy() {
        let bus = InMemoryBus::new();
        let mut stream1 = bus.subscribe("q1", &topics(&["events.>"])).await.unwrap();
        let mut stream2 = bus.subscribe("q2", &topics(&["events.>"])).await.unwrap();

        bus.publish("events.x.v1", &MessageHeaders::new(), b"fan".to_vec())
            .await
            .unwrap();

        let d1 = next_delivery(&mut stream1).await;
        let d2 = next_delivery(&mut stream2).await;
        assert_eq!(d1.payload, b"fan");
        assert_eq!(d2.payload, b"fan");
    }

    #[tokio::test]
    async fn bad_subject_is_rejected() {
        let bus = InMemoryBus::new();
        let err = bus
            .publish("", &MessageHeaders::new(), vec![])
            .await
            .expect_err("empty subject");
        assert!(matches!(err, BusError::BadSubject(_)));

        let err = bus
            .publish("events..x", &MessageHeaders::new(), vec![])
            .await
            .expect_err("double dot");
        assert!(matches!(err, BusError::BadSubject(_)));
    }
}
