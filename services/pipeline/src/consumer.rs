//! Kafka consumer wrapper for the pipeline stages.
//!
//! Deliveries are handled one at a time per consumer, in offset order, and
//! committed only after the handler finished. A handler failure either parks
//! the message on the dead letter queue (then commits) or leaves it
//! unacknowledged and seeks back so the same delivery is consumed again. A
//! park whose dead letter could not be written falls back to redelivery.

use crate::config::KafkaConfig;
use crate::producer::{EtlProducer, ProducerError};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as KafkaMessage};
use rdkafka::Offset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),

    /// The delivery could not be completed now; it must be consumed again
    #[error("Message processing failed, redelivery required: {0}")]
    Redeliver(String),

    /// The delivery can never succeed; it is parked and acknowledged
    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl ConsumerError {
    /// Whether the message should be parked on the dead letter queue and
    /// acknowledged instead of being redelivered
    pub fn is_parkable(&self) -> bool {
        matches!(
            self,
            ConsumerError::DeserializationError(_) | ConsumerError::Rejected(_)
        )
    }
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            "Message processing failed for topic={}, partition={}, offset={}: {}",
            message.metadata.topic, message.metadata.partition, message.metadata.offset, error
        );
    }
}

/// What the consumer does with a delivery once the handler returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; commit the offset
    Acknowledge,
    /// Unprocessable; park on the dead letter queue and commit
    Park(String),
    /// Leave uncommitted and consume the same delivery again
    Redeliver(String),
}

/// Run `handler` on one delivery and decide what happens to it
pub async fn dispatch<H: MessageHandler + ?Sized>(handler: &H, message: IncomingMessage) -> Disposition {
    match handler.handle(message.clone()).await {
        Ok(()) => Disposition::Acknowledge,
        Err(e) => {
            handler.on_error(&message, &e).await;
            if e.is_parkable() {
                Disposition::Park(e.to_string())
            } else {
                Disposition::Redeliver(e.to_string())
            }
        }
    }
}

/// Settle a parked delivery once its dead letter write finished. A delivery
/// whose dead letter was not recorded is redelivered, never committed.
pub fn settle_park(reason: String, recorded: Result<(), ProducerError>) -> Disposition {
    match recorded {
        Ok(()) => Disposition::Park(reason),
        Err(e) => {
            error!(error = %e, reason = %reason, "Failed to record dead letter, redelivering");
            Disposition::Redeliver(format!("dead letter not recorded: {}", e))
        }
    }
}

/// High-level Kafka consumer wrapper
pub struct EtlConsumer {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    shutdown_tx: broadcast::Sender<()>,
    dlq_producer: Option<Arc<EtlProducer>>,
}

impl EtlConsumer {
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            "Creating Kafka consumer for {} with group {}",
            config.bootstrap_servers, config.consumer.group_id
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            shutdown_tx,
            dlq_producer: None,
        })
    }

    /// Set the dead letter queue producer
    pub fn with_dlq_producer(mut self, producer: Arc<EtlProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!("Subscribing to topics: {:?}", topics);
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to stop consuming. The delivery in progress completes first.
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Start consuming messages and process them with the given handler
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_receiver();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);

                            debug!(
                                "Received message from topic={}, partition={}, offset={}",
                                incoming.metadata.topic,
                                incoming.metadata.partition,
                                incoming.metadata.offset
                            );

                            let disposition = match dispatch(handler.as_ref(), incoming.clone()).await {
                                Disposition::Park(reason) => {
                                    let recorded = self.park(&incoming, &reason).await;
                                    settle_park(reason, recorded)
                                }
                                other => other,
                            };

                            match disposition {
                                Disposition::Acknowledge | Disposition::Park(_) => {
                                    self.commit(&borrowed_message)
                                }
                                Disposition::Redeliver(reason) => {
                                    self.rewind(&incoming, &reason).await?;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {}", e);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!("Failed to commit on shutdown: {}", e);
        }

        Ok(())
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!(error = %e, "Failed to commit offset");
        }
    }

    async fn park(&self, message: &IncomingMessage, reason: &str) -> Result<(), ProducerError> {
        match self.dlq_producer {
            Some(ref dlq) => {
                dlq.send_to_dlq(&message.metadata.topic, &message.payload, reason)
                    .await?;
                Ok(())
            }
            None => {
                error!(
                    topic = %message.metadata.topic,
                    offset = message.metadata.offset,
                    reason,
                    "Dropping unprocessable message, no dead letter queue configured"
                );
                Ok(())
            }
        }
    }

    /// Seek the partition back to the failed delivery so it is consumed again
    async fn rewind(&self, message: &IncomingMessage, reason: &str) -> Result<(), ConsumerError> {
        let delay = self.config.redelivery_delay();
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Delivery not acknowledged, scheduling redelivery"
        );

        tokio::time::sleep(delay).await;

        self.consumer
            .seek(
                &message.metadata.topic,
                message.metadata.partition,
                Offset::Offset(message.metadata.offset),
                Duration::from_secs(10),
            )
            .map_err(|e| ConsumerError::PollError(format!("seek for redelivery failed: {}", e)))
    }
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
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}
