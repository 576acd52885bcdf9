//! Kafka producer wrapper for the outcome channels.
//!
//! Outcome events are published as JSON, keyed by object id so that every
//! outcome for one object lands on the same partition.

use crate::config::KafkaConfig;
use crate::events::OutcomeEvent;
use crate::retry::{TimedOut, Transient};
use async_trait::async_trait;
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

    #[error("Producer flush timed out after {0:?}")]
    FlushTimeout(Duration),

    #[error(transparent)]
    Timeout(#[from] TimedOut),
}

impl Transient for ProducerError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ProducerError::SendError { .. } | ProducerError::FlushTimeout(_) | ProducerError::Timeout(_)
        )
    }
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
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
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

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Destination for terminal outcome events
#[async_trait]
pub trait OutcomePublisher: Send + Sync {
    /// Publish to the channel selected by the event's outcome. Returns once
    /// the channel has acknowledged the write.
    async fn publish(&self, event: &OutcomeEvent) -> Result<(), ProducerError>;
}

/// Kafka producer used for outcome channels and the dead letter queue
pub struct EtlProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl EtlProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

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

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!("Sending message ({} bytes)", message.payload.len());

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

    /// Park an unprocessable message on the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let dlq_message = serde_json::json!({
            "original_topic": original_topic,
            "original_message_base64": STANDARD.encode(original_message),
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let message = OutgoingMessage::new_json(&self.config.topics.dead_letter_queue, &dlq_message)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("original-topic", original_topic);

        self.send(message).await
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::FlushTimeout(timeout))
    }
}

#[async_trait]
impl OutcomePublisher for EtlProducer {
    async fn publish(&self, event: &OutcomeEvent) -> Result<(), ProducerError> {
        let topic = self.config.topics.outcome_topic(event.outcome);
        let message = OutgoingMessage::new_json(topic, event)?
            .with_key(event.object_id.to_string())
            .with_message_type("outcome_event")
            .with_header("outcome", event.outcome.as_str());

        let delivery = self.send(message).await?;

        info!(
            object_id = %event.object_id,
            outcome = %event.outcome,
            topic = %delivery.topic,
            offset = delivery.offset,
            "Outcome published"
        );
        Ok(())
    }
}

impl Drop for EtlProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
