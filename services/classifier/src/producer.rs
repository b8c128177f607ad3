//! Kafka producer used by the traffic generator and for dead-lettering.

use crate::config::KafkaConfig;
use crate::consumer::{DeadLetterSink, IncomingMessage, ROUTING_KEY_HEADER};
use crate::message::InboundMessage;
use base64::{engine::general_purpose::STANDARD, Engine};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Tag the message with the routing key consumers filter on
    pub fn with_routing_key(self, routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        self.with_key(routing_key.clone())
            .with_header(ROUTING_KEY_HEADER, routing_key)
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            })
    }
}

/// Body written to the dead letter topic
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub original_message_base64: String,
    pub error: String,
    pub timestamp: String,
}

impl DeadLetterRecord {
    pub fn new(message: &IncomingMessage, error: &str) -> Self {
        Self {
            original_topic: message.metadata.topic.clone(),
            original_partition: message.metadata.partition,
            original_offset: message.metadata.offset,
            original_message_base64: STANDARD.encode(&message.payload),
            error: error.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// High-level Kafka producer wrapper
pub struct ImageProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl ImageProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();
        let headers = message.owned_headers();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(size = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Publish an image message to the images topic under `routing_key`
    pub async fn publish_image(
        &self,
        message: &InboundMessage,
        routing_key: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let outgoing = OutgoingMessage::new_json(&self.config.topics.images, message)?
            .with_routing_key(routing_key)
            .with_header("message-id", message.id.as_str());

        self.send(outgoing).await
    }

    /// Send a message to the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original: &IncomingMessage,
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let record = DeadLetterRecord::new(original, error);

        let mut message = OutgoingMessage::new_json(&self.config.topics.dead_letter, &record)?
            .with_key(Uuid::new_v4().to_string())
            .with_header("original-topic", original.metadata.topic.as_str())
            .with_header("error-reason", error);
        if let Some(routing_key) = original.routing_key() {
            message = message.with_header(ROUTING_KEY_HEADER, routing_key);
        }

        self.send(message).await
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for ImageProducer {
    async fn dead_letter(
        &self,
        message: &IncomingMessage,
        reason: &str,
    ) -> Result<(), ProducerError> {
        self.send_to_dlq(message, reason).await.map(|_| ())
    }
}

impl Drop for ImageProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}
