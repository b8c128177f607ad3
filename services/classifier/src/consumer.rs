//! Broker-facing consumer for the classifier queues.
//!
//! Messages are pulled one at a time, so at most one is unacknowledged per
//! consumer. A successful handler run acks the delivery; a failed one is
//! negatively acknowledged and requeued, optionally bounded by a
//! [`RetryPolicy`] after which the message goes to a [`DeadLetterSink`].

use crate::config::KafkaConfig;
use crate::kind::ClassifierKind;
use crate::producer::ProducerError;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Header carrying the routing key the message was published with
pub const ROUTING_KEY_HEADER: &str = "routing-key";

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to receive message: {0}")]
    ReceiveError(String),

    #[error("Failed to acknowledge {tag}: {message}")]
    AckError { tag: DeliveryTag, message: String },

    #[error("Failed to reject {tag}: {message}")]
    NackError { tag: DeliveryTag, message: String },

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// Identifies one delivery so it can be acked or rejected.
///
/// A requeued message is redelivered under the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key; the routing key for image messages
    pub key: Option<Vec<u8>>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn delivery_tag(&self) -> DeliveryTag {
        DeliveryTag {
            topic: self.metadata.topic.clone(),
            partition: self.metadata.partition,
            offset: self.metadata.offset,
        }
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Routing key from the header, falling back to the record key
    pub fn routing_key(&self) -> Option<String> {
        self.header(ROUTING_KEY_HEADER)
            .map(str::to_string)
            .or_else(|| self.key_str())
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message processing failed"
        );
    }
}

/// The queue operations the consume loop relies on.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Next delivery for this consumer's queue. `None` means the source is closed.
    async fn recv(&self) -> Option<Result<IncomingMessage, ConsumerError>>;

    /// Acknowledge exactly this delivery
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), ConsumerError>;

    /// Reject this delivery, putting it back on the queue when `requeue` is set
    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), ConsumerError>;
}

/// Destination for messages that exhausted their redeliveries
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(
        &self,
        message: &IncomingMessage,
        reason: &str,
    ) -> Result<(), ProducerError>;
}

/// How many failed deliveries a message gets before it is dead-lettered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Redeliveries allowed after the first failure; `None` requeues forever
    pub max_redeliveries: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_redeliveries: None,
        }
    }

    pub fn bounded(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries: Some(max_redeliveries),
        }
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_redeliveries.is_some_and(|max| failures > max)
    }
}

/// What happened to a delivery after the handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
    Discarded,
}

/// Kafka-backed queue for one classifier kind.
///
/// The `images` topic plays the exchange and the consumer group plays the
/// durable queue. Records whose routing key belongs to another queue are
/// committed past without being handed out. Acks commit the record's offset
/// and requeues seek the partition back to it.
pub struct KafkaBroker {
    consumer: StreamConsumer,
    routing_key: &'static str,
    seek_timeout: Duration,
}

impl KafkaBroker {
    /// Create the consumer and subscribe it to the images topic
    pub fn new(config: &KafkaConfig, kind: ClassifierKind) -> Result<Self, ConsumerError> {
        let group = config.group_for(kind);
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group = %group,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config(kind)
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.topics.images.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(
            topic = %config.topics.images,
            routing_key = kind.routing_key(),
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            routing_key: kind.routing_key(),
            seek_timeout: config.request_timeout(),
        })
    }

    fn commit_past(&self, tag: &DeliveryTag) -> Result<(), String> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&tag.topic, tag.partition, Offset::Offset(tag.offset + 1))
            .map_err(|e| e.to_string())?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| e.to_string())
    }

    /// Convert a borrowed Kafka message to our IncomingMessage type
    fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
        let payload = msg.payload().unwrap_or(&[]).to_vec();
        let key = msg.key().map(|k| k.to_vec());

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.insert(header.key.to_string(), v);
                    }
                }
            }
        }

        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key,
                headers,
            },
        }
    }
}

#[async_trait::async_trait]
impl Broker for KafkaBroker {
    async fn recv(&self) -> Option<Result<IncomingMessage, ConsumerError>> {
        loop {
            let incoming = match self.consumer.recv().await {
                Ok(borrowed) => Self::convert_message(&borrowed),
                Err(e) => return Some(Err(ConsumerError::ReceiveError(e.to_string()))),
            };

            if incoming.routing_key().as_deref() == Some(self.routing_key) {
                return Some(Ok(incoming));
            }

            let tag = incoming.delivery_tag();
            debug!(
                %tag,
                routing_key = ?incoming.routing_key(),
                "Skipping message bound for another queue"
            );
            metrics::counter!("imagebus.messages.skipped").increment(1);
            if let Err(e) = self.commit_past(&tag) {
                warn!(%tag, error = %e, "Failed to commit skipped offset");
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), ConsumerError> {
        self.commit_past(tag).map_err(|message| ConsumerError::AckError {
            tag: tag.clone(),
            message,
        })
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), ConsumerError> {
        let result = if requeue {
            self.consumer
                .seek(
                    &tag.topic,
                    tag.partition,
                    Offset::Offset(tag.offset),
                    self.seek_timeout,
                )
                .map_err(|e| e.to_string())
        } else {
            self.commit_past(tag)
        };

        result.map_err(|message| ConsumerError::NackError {
            tag: tag.clone(),
            message,
        })
    }
}

/// Cloneable trigger that stops a running [`ImageConsumer`]
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.tx.send(());
    }
}

/// Consume loop with manual acknowledgement
pub struct ImageConsumer<B: Broker> {
    broker: B,
    retry: RetryPolicy,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<B: Broker> ImageConsumer<B> {
    pub fn new(broker: B) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            broker,
            retry: RetryPolicy::default(),
            dead_letter: None,
            shutdown_tx,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the dead letter destination used once the retry policy is exhausted
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Consume until shutdown is signaled or the broker closes.
    ///
    /// A message already handed to the handler is always settled before the
    /// loop checks for shutdown again.
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // Failed attempts per delivery; only consulted when retries are bounded
        let mut failures: HashMap<DeliveryTag, u32> = HashMap::new();

        info!(
            max_redeliveries = ?self.retry.max_redeliveries,
            "Starting message consumption loop"
        );

        loop {
            let next = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                next = self.broker.recv() => next,
            };

            match next {
                Some(Ok(message)) => {
                    debug!(
                        topic = %message.metadata.topic,
                        partition = message.metadata.partition,
                        offset = message.metadata.offset,
                        "Received message"
                    );
                    let tag = message.delivery_tag();
                    let outcome = self.dispatch(handler.as_ref(), message, &mut failures).await;
                    debug!(%tag, ?outcome, "Delivery settled");
                }
                Some(Err(e)) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("imagebus.kafka.errors").increment(1);
                }
                None => {
                    debug!("Stream ended");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn dispatch<H: MessageHandler>(
        &self,
        handler: &H,
        message: IncomingMessage,
        failures: &mut HashMap<DeliveryTag, u32>,
    ) -> Outcome {
        let tag = message.delivery_tag();

        let error = match handler.handle(message.clone()).await {
            Ok(()) => {
                failures.remove(&tag);
                if let Err(e) = self.broker.ack(&tag).await {
                    warn!(error = %e, "Failed to commit offset");
                }
                metrics::counter!("imagebus.messages.acked").increment(1);
                return Outcome::Acked;
            }
            Err(e) => e,
        };

        let reason = error.to_string();
        handler.on_error(message.clone(), error).await;

        let attempts = if self.retry.max_redeliveries.is_some() {
            let count = failures.entry(tag.clone()).or_insert(0);
            *count += 1;
            *count
        } else {
            0
        };

        if !self.retry.is_exhausted(attempts) {
            self.reject(&tag, true).await;
            metrics::counter!("imagebus.messages.requeued").increment(1);
            return Outcome::Requeued;
        }

        let Some(ref sink) = self.dead_letter else {
            failures.remove(&tag);
            warn!(%tag, attempts, "Redeliveries exhausted with no dead letter topic, dropping message");
            self.reject(&tag, false).await;
            return Outcome::Discarded;
        };

        match sink.dead_letter(&message, &reason).await {
            Ok(()) => {
                failures.remove(&tag);
                warn!(%tag, attempts, "Redeliveries exhausted, message dead-lettered");
                if let Err(e) = self.broker.ack(&tag).await {
                    warn!(error = %e, "Failed to commit dead-lettered offset");
                }
                metrics::counter!("imagebus.messages.dead_lettered").increment(1);
                Outcome::DeadLettered
            }
            Err(dlq_err) => {
                // Keep the failure count so the next failure retries the DLQ at once
                error!(%tag, error = %dlq_err, "Failed to send to DLQ, requeueing");
                self.reject(&tag, true).await;
                metrics::counter!("imagebus.messages.requeued").increment(1);
                Outcome::Requeued
            }
        }
    }

    async fn reject(&self, tag: &DeliveryTag, requeue: bool) {
        if let Err(e) = self.broker.nack(tag, requeue).await {
            warn!(error = %e, requeue, "Failed to reject message");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MemoryBroker, RecordingSink};
    use super::*;

    /// Fails every payload that starts with `b"bad"`
    struct PrefixHandler;

    #[async_trait::async_trait]
    impl MessageHandler for PrefixHandler {
        async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
            if message.payload.starts_with(b"bad") {
                Err(ConsumerError::ProcessingError("bad payload".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_incoming_message_routing_key() {
        let mut headers = HashMap::new();
        headers.insert(ROUTING_KEY_HEADER.to_string(), "team".to_string());

        let mut message = IncomingMessage {
            payload: vec![1, 2, 3],
            metadata: MessageMetadata {
                topic: "images".to_string(),
                partition: 2,
                offset: 100,
                key: Some(b"face".to_vec()),
                headers,
            },
        };

        assert_eq!(message.routing_key().as_deref(), Some("team"));
        assert_eq!(message.delivery_tag().to_string(), "images/2@100");

        message.metadata.headers.clear();
        assert_eq!(message.routing_key().as_deref(), Some("face"));
    }

    #[test]
    fn test_retry_policy() {
        assert!(!RetryPolicy::unbounded().is_exhausted(u32::MAX));
        let bounded = RetryPolicy::bounded(3);
        assert!(!bounded.is_exhausted(3));
        assert!(bounded.is_exhausted(4));
    }

    #[tokio::test]
    async fn test_successful_messages_are_acked_in_order() {
        let broker = MemoryBroker::new();
        let first = broker.publish("face", b"ok-1".to_vec());
        let second = broker.publish("face", b"ok-2".to_vec());

        let consumer = ImageConsumer::new(broker);
        consumer.run(Arc::new(PrefixHandler)).await.unwrap();

        assert_eq!(consumer.broker().acked(), vec![first, second]);
        assert!(consumer.broker().nacked().is_empty());
        assert_eq!(consumer.broker().pending(), 0);
    }

    #[tokio::test]
    async fn test_failures_requeue_without_ack_when_unbounded() {
        let broker = MemoryBroker::with_delivery_limit(4);
        let tag = broker.publish("face", b"bad".to_vec());

        let consumer = ImageConsumer::new(broker);
        consumer.run(Arc::new(PrefixHandler)).await.unwrap();

        let broker = consumer.broker();
        assert_eq!(broker.deliveries(), 4);
        assert!(broker.acked().is_empty());
        assert_eq!(broker.nacked(), vec![(tag, true); 4]);
        assert_eq!(broker.pending(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_message_goes_to_dead_letter_and_is_acked() {
        let broker = MemoryBroker::new();
        let bad = broker.publish("face", b"bad".to_vec());
        let good = broker.publish("face", b"ok".to_vec());
        let sink = Arc::new(RecordingSink::default());

        let consumer = ImageConsumer::new(broker)
            .with_retry_policy(RetryPolicy::bounded(2))
            .with_dead_letter(sink.clone());
        consumer.run(Arc::new(PrefixHandler)).await.unwrap();

        let broker = consumer.broker();
        assert_eq!(broker.deliveries(), 4);
        assert_eq!(broker.nacked(), vec![(bad.clone(), true); 2]);
        assert_eq!(broker.acked(), vec![bad.clone(), good]);

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, bad);
        assert!(received[0].1.contains("bad payload"));
    }

    #[tokio::test]
    async fn test_exhausted_message_without_sink_is_dropped() {
        let broker = MemoryBroker::new();
        let bad = broker.publish("face", b"bad".to_vec());

        let consumer = ImageConsumer::new(broker).with_retry_policy(RetryPolicy::bounded(1));
        consumer.run(Arc::new(PrefixHandler)).await.unwrap();

        assert_eq!(
            consumer.broker().nacked(),
            vec![(bad.clone(), true), (bad, false)]
        );
        assert_eq!(consumer.broker().pending(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_reports_each_outcome() {
        let broker = MemoryBroker::new();
        broker.publish("face", b"bad".to_vec());
        broker.publish("face", b"ok".to_vec());

        let consumer = ImageConsumer::new(broker)
            .with_retry_policy(RetryPolicy::bounded(1))
            .with_dead_letter(Arc::new(RecordingSink::default()));
        let mut failures = HashMap::new();

        let mut outcomes = Vec::new();
        while let Some(Ok(message)) = consumer.broker().recv().await {
            outcomes.push(consumer.dispatch(&PrefixHandler, message, &mut failures).await);
        }

        assert_eq!(
            outcomes,
            vec![Outcome::Requeued, Outcome::DeadLettered, Outcome::Acked]
        );
        assert!(failures.is_empty());

        let broker = MemoryBroker::new();
        broker.publish("face", b"bad".to_vec());
        let consumer = ImageConsumer::new(broker).with_retry_policy(RetryPolicy::bounded(0));
        let message = consumer.broker().recv().await.unwrap().unwrap();
        assert_eq!(
            consumer.dispatch(&PrefixHandler, message, &mut failures).await,
            Outcome::Discarded
        );
    }

    #[tokio::test]
    async fn test_failed_dead_letter_keeps_failure_count() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// Fails the first publish, accepts the rest
        #[derive(Default)]
        struct FlakySink {
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl DeadLetterSink for FlakySink {
            async fn dead_letter(
                &self,
                _message: &IncomingMessage,
                _reason: &str,
            ) -> Result<(), ProducerError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProducerError::Timeout(Duration::from_millis(1)))
                } else {
                    Ok(())
                }
            }
        }

        let broker = MemoryBroker::new();
        let bad = broker.publish("face", b"bad".to_vec());
        let sink = Arc::new(FlakySink::default());

        let consumer = ImageConsumer::new(broker)
            .with_retry_policy(RetryPolicy::bounded(1))
            .with_dead_letter(sink.clone());
        consumer.run(Arc::new(PrefixHandler)).await.unwrap();

        // Second failure hits the broken DLQ, the third goes straight to it again.
        let broker = consumer.broker();
        assert_eq!(broker.deliveries(), 3);
        assert_eq!(broker.nacked(), vec![(bad.clone(), true); 2]);
        assert_eq!(broker.acked(), vec![bad]);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_consumer() {
        struct IdleBroker;

        #[async_trait::async_trait]
        impl Broker for IdleBroker {
            async fn recv(&self) -> Option<Result<IncomingMessage, ConsumerError>> {
                std::future::pending().await
            }
            async fn ack(&self, _tag: &DeliveryTag) -> Result<(), ConsumerError> {
                Ok(())
            }
            async fn nack(&self, _tag: &DeliveryTag, _requeue: bool) -> Result<(), ConsumerError> {
                Ok(())
            }
        }

        let consumer = Arc::new(ImageConsumer::new(IdleBroker));
        let handle = consumer.shutdown_handle();
        let running = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(Arc::new(PrefixHandler)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("consumer did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
