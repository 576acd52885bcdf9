//! Telemetry ETL pipeline - shared plumbing for the loader and router stages
//!
//! This library holds everything both stages agree on:
//!
//! - The events exchanged between stages ([`IngestionEvent`], [`OutcomeEvent`])
//! - Kafka producer/consumer wrappers with manual, at-least-once commits
//! - The [`ObjectStore`] seam and its S3 implementation
//! - Bounded exponential-backoff retry and per-call deadlines
//! - In-memory adapters used by the stages' scenario tests
//!
//! # Example
//!
//! ```rust,no_run
//! use etl_pipeline::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::new("localhost:9092");
//!     let producer = EtlProducer::new(config)?;
//!
//!     let id: ObjectId = "landing/tractors-001.csv".parse()?;
//!     producer.publish(&OutcomeEvent::success(id)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod events;
pub mod memory;
pub mod object_store;
pub mod producer;
pub mod retry;

pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, RetryConfig, SaslConfig,
    SaslMechanism, SecurityProtocol, SslConfig, TimeoutConfig, TopicConfig,
};
pub use consumer::{
    dispatch, ConsumerError, Disposition, EtlConsumer, IncomingMessage, MessageHandler,
    MessageMetadata,
};
pub use events::{IngestionEvent, InvalidObjectId, ObjectId, Outcome, OutcomeEvent};
pub use object_store::{ObjectMeta, ObjectStore, S3Config, S3ObjectStore, StorageError};
pub use producer::{DeliveryResult, EtlProducer, OutcomePublisher, OutgoingMessage, ProducerError};
pub use retry::{retry_transient, with_deadline, TimedOut, Transient};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{KafkaConfig, RetryConfig, TimeoutConfig};
    pub use crate::consumer::{ConsumerError, EtlConsumer, IncomingMessage, MessageHandler};
    pub use crate::events::{IngestionEvent, ObjectId, Outcome, OutcomeEvent};
    pub use crate::object_store::{ObjectStore, StorageError};
    pub use crate::producer::{EtlProducer, OutcomePublisher, ProducerError};
    pub use async_trait::async_trait;
}
