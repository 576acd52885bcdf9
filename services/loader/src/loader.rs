//! The parser/loader stage.
//!
//! For every ingestion event the loader reads the object, skips it if the
//! same content was already loaded, parses and validates every row, writes
//! the rows to the warehouse and publishes exactly one outcome event. The
//! object itself is never moved; that is the routers' job.

use crate::config::CsvFormat;
use crate::parser::{parse_telemetry, ParseError};
use crate::warehouse::{LoadManifest, Warehouse, WarehouseError};
use async_trait::async_trait;
use etl_pipeline::{
    retry_transient, with_deadline, ConsumerError, IncomingMessage, IngestionEvent,
    MessageHandler, ObjectId, ObjectStore, OutcomeEvent, OutcomePublisher, ProducerError,
    RetryConfig, StorageError, TimeoutConfig,
};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Reason attached to the SUCCESS outcome of a skipped redelivery
pub const DUPLICATE_REASON: &str = "duplicate delivery";

/// Category of a failed load, used as the prefix of the outcome reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Read,
    Parse,
    Validation,
    Warehouse,
    NotFound,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Read => "read",
            FailureKind::Parse => "parse",
            FailureKind::Validation => "validation",
            FailureKind::Warehouse => "warehouse",
            FailureKind::NotFound => "not_found",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure that ends in an ERROR outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    fn new(kind: FailureKind, detail: impl ToString) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }

    /// Outcome reason, `"<kind>: <detail>"`
    pub fn reason(&self) -> String {
        format!("{}: {}", self.kind, self.detail)
    }
}

impl From<ParseError> for Failure {
    fn from(err: ParseError) -> Self {
        let kind = if err.is_validation() {
            FailureKind::Validation
        } else {
            FailureKind::Parse
        };
        Failure::new(kind, err)
    }
}

impl From<WarehouseError> for Failure {
    fn from(err: WarehouseError) -> Self {
        Failure::new(FailureKind::Warehouse, err)
    }
}

/// Errors that leave the ingestion delivery unacknowledged
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Outcome for {object_id} could not be published: {source}")]
    Publish {
        object_id: ObjectId,
        #[source]
        source: ProducerError,
    },
}

enum Processed {
    Loaded { rows: u64 },
    Duplicate,
}

/// Parser/loader for tractor telemetry files
pub struct Loader {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    publisher: Arc<dyn OutcomePublisher>,
    format: CsvFormat,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
}

impl Loader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        publisher: Arc<dyn OutcomePublisher>,
    ) -> Self {
        Self {
            store,
            warehouse,
            publisher,
            format: CsvFormat::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_format(mut self, format: CsvFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Process one ingestion event and publish its outcome.
    ///
    /// Returns the published event. An error means no outcome could be
    /// published and the delivery must be redelivered.
    #[instrument(skip(self, event), fields(object_id = %event.object_id))]
    pub async fn handle_event(&self, event: &IngestionEvent) -> Result<OutcomeEvent, LoaderError> {
        let started = Instant::now();
        let id = &event.object_id;

        let outcome = match self.process(id).await {
            Ok(Processed::Loaded { rows }) => {
                info!(rows, "Object loaded into warehouse");
                metrics::counter!("loader.objects.loaded").increment(1);
                metrics::counter!("loader.rows.loaded").increment(rows);
                OutcomeEvent::success(id.clone())
            }
            Ok(Processed::Duplicate) => {
                metrics::counter!("loader.duplicates").increment(1);
                OutcomeEvent::success(id.clone()).with_reason(DUPLICATE_REASON)
            }
            Err(failure) => {
                error!(kind = %failure.kind, detail = %failure.detail, "Object rejected");
                metrics::counter!("loader.objects.failed", "kind" => failure.kind.as_str())
                    .increment(1);
                OutcomeEvent::error(id.clone(), failure.reason())
            }
        };

        self.publish(&outcome).await?;

        metrics::histogram!("loader.duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn process(&self, id: &ObjectId) -> Result<Processed, Failure> {
        let bytes = match self.fetch(id).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                // Already routed on an earlier delivery
                if self.lookup_manifest(id).await?.is_some() {
                    warn!("Object no longer in ingestion location but already loaded");
                    self.note_duplicate(id).await;
                    return Ok(Processed::Duplicate);
                }
                return Err(Failure::new(
                    FailureKind::NotFound,
                    format!("object {} does not exist", id),
                ));
            }
            Err(e) => return Err(Failure::new(FailureKind::Read, e)),
        };

        let digest = hex::encode(Sha256::digest(&bytes));

        if let Some(manifest) = self.lookup_manifest(id).await? {
            if manifest.content_sha256 == digest {
                warn!(
                    loaded_at = %manifest.loaded_at,
                    rows = manifest.row_count,
                    "Content already loaded, skipping duplicate delivery"
                );
                self.note_duplicate(id).await;
                return Ok(Processed::Duplicate);
            }
            info!("Content changed since last load, reloading");
        }

        let records = parse_telemetry(&bytes, &self.format)?;

        let warehouse = &self.warehouse;
        let timeouts = &self.timeouts;
        let records = &records;
        let digest = digest.as_str();
        let receipt = retry_transient(&self.retry, "warehouse load", move || async move {
            with_deadline(
                timeouts.warehouse(),
                "warehouse load",
                warehouse.load(id, digest, records),
            )
            .await
        })
        .await?;

        if receipt.already_loaded {
            warn!("Concurrent delivery loaded the same content first");
            return Ok(Processed::Duplicate);
        }

        Ok(Processed::Loaded {
            rows: receipt.rows_written,
        })
    }

    async fn fetch(&self, id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        let store = &self.store;
        let timeouts = &self.timeouts;
        retry_transient(&self.retry, "fetch object", move || async move {
            with_deadline(timeouts.storage(), "fetch object", store.get(id)).await
        })
        .await
    }

    async fn lookup_manifest(
        &self,
        id: &ObjectId,
    ) -> Result<Option<LoadManifest>, Failure> {
        let warehouse = &self.warehouse;
        let timeouts = &self.timeouts;
        let manifest = retry_transient(&self.retry, "manifest lookup", move || async move {
            with_deadline(timeouts.warehouse(), "manifest lookup", warehouse.manifest(id)).await
        })
        .await?;
        Ok(manifest)
    }

    async fn note_duplicate(&self, id: &ObjectId) {
        let result = with_deadline(
            self.timeouts.warehouse(),
            "record duplicate",
            self.warehouse.note_duplicate(id),
        )
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Failed to count duplicate delivery");
        }
    }

    async fn publish(&self, outcome: &OutcomeEvent) -> Result<(), LoaderError> {
        let publisher = &self.publisher;
        let timeouts = &self.timeouts;
        retry_transient(&self.retry, "publish outcome", move || async move {
            with_deadline(timeouts.publish(), "publish outcome", publisher.publish(outcome)).await
        })
        .await
        .map_err(|source| LoaderError::Publish {
            object_id: outcome.object_id.clone(),
            source,
        })
    }
}

#[async_trait]
impl MessageHandler for Loader {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let event: IngestionEvent = message.decode_json()?;

        self.handle_event(&event)
            .await
            .map(|_| ())
            .map_err(|e| ConsumerError::Redeliver(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{MemoryWarehouse, MockWarehouse};
    use chrono::Utc;
    use etl_pipeline::memory::{MemoryObjectStore, MemoryOutcomeChannels, StoreOp};
    use etl_pipeline::Outcome;

    const HEADER: &str = "Date;Serial;Lon;Lat;Hours;Rpm;Load;Fuel;Gearbox;Radar;Temp;FrontPto;RearPto;Gear;Ambient;Brake;Diff;Awd;Creeper";

    fn row(serial: &str) -> String {
        format!(
            "Jun 12, 2017 10:30:00 AM;{};-93.265;44.9778;1532.5;1800;65;12.4;8.5;8.1;87;540;1000;F4;21.5;OFF;OFF;ON;OFF",
            serial
        )
    }

    fn csv(rows: &[String]) -> Vec<u8> {
        let mut text = HEADER.to_string();
        for r in rows {
            text.push('\n');
            text.push_str(r);
        }
        text.into_bytes()
    }

    fn object() -> ObjectId {
        ObjectId::new("landing", "tractor-7.csv").unwrap()
    }

    fn event() -> IngestionEvent {
        serde_json::from_value(serde_json::json!({
            "object_id": "landing/tractor-7.csv",
            "created_at": Utc::now(),
        }))
        .unwrap()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_interval_ms: 1,
            max_interval_ms: 2,
            multiplier: 2.0,
        }
    }

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        warehouse: Arc<MemoryWarehouse>,
        channels: Arc<MemoryOutcomeChannels>,
        loader: Loader,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let channels = Arc::new(MemoryOutcomeChannels::new());
        let loader = Loader::new(store.clone(), warehouse.clone(), channels.clone())
            .with_retry(fast_retry());
        Fixture {
            store,
            warehouse,
            channels,
            loader,
        }
    }

    #[test]
    fn test_failure_reason_format() {
        let failure = Failure::from(ParseError::EmptyFile);
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.reason(), "validation: file contains no data rows");

        let failure = Failure::from(ParseError::Encoding("bad byte".into()));
        assert_eq!(failure.kind, FailureKind::Parse);
    }

    #[tokio::test]
    async fn test_valid_file_publishes_success() {
        let f = fixture();
        f.store.put(&object(), csv(&[row("SN-1"), row("SN-2")]));

        let outcome = f.loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.outcome, Outcome::Success);
        assert_eq!(outcome.reason, None);
        assert_eq!(f.warehouse.rows(&object()).len(), 2);
        assert_eq!(f.channels.success.len(), 1);
        assert!(f.channels.error.is_empty());
        // The loader never moves the object
        assert!(f.store.contains(&object()));
    }

    #[tokio::test]
    async fn test_invalid_row_publishes_validation_error() {
        let f = fixture();
        let bad = row("SN-2").replace(";OFF;ON;", ";OFF;;");
        f.store.put(&object(), csv(&[row("SN-1"), bad]));

        let outcome = f.loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.outcome, Outcome::Error);
        let reason = outcome.reason.unwrap();
        assert!(reason.starts_with("validation: line 3"), "{}", reason);
        assert_eq!(f.warehouse.total_rows(), 0);
        assert_eq!(f.channels.error.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let f = fixture();

        let outcome = f.loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.outcome, Outcome::Error);
        assert!(outcome.reason.unwrap().starts_with("not_found: "));
    }

    #[tokio::test]
    async fn test_storage_outage_exhausts_retries_as_read_error() {
        let f = fixture();
        f.store.put(&object(), csv(&[row("SN-1")]));
        for _ in 0..3 {
            f.store
                .inject_fault(StoreOp::Get, StorageError::Unavailable("503 slow down".into()));
        }

        let outcome = f.loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.outcome, Outcome::Error);
        assert!(outcome.reason.unwrap().starts_with("read: "));
        assert_eq!(f.store.calls(StoreOp::Get), 3);
    }

    #[tokio::test]
    async fn test_same_content_is_loaded_once() {
        let f = fixture();
        f.store.put(&object(), csv(&[row("SN-1")]));

        f.loader.handle_event(&event()).await.unwrap();
        let second = f.loader.handle_event(&event()).await.unwrap();

        assert_eq!(second.reason.as_deref(), Some(DUPLICATE_REASON));
        assert_eq!(f.warehouse.commits(), 1);
        assert_eq!(f.warehouse.manifest_of(&object()).unwrap().duplicate_attempts, 1);
        assert_eq!(f.channels.success.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_deliveries_load_once() {
        let f = fixture();
        f.store.put(&object(), csv(&[row("SN-1"), row("SN-2")]));
        // Holds the first load open while the second one queues behind it
        f.warehouse.stall_next_load(std::time::Duration::from_millis(50));

        let first = event();
        let second = event();
        let (a, b) = tokio::join!(f.loader.handle_event(&first), f.loader.handle_event(&second));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.outcome, Outcome::Success);
        assert_eq!(b.outcome, Outcome::Success);
        let duplicates = [&a, &b]
            .iter()
            .filter(|o| o.reason.as_deref() == Some(DUPLICATE_REASON))
            .count();
        assert_eq!(duplicates, 1);

        assert_eq!(f.warehouse.commits(), 1);
        assert_eq!(f.warehouse.rows(&object()).len(), 2);
        assert_eq!(f.warehouse.manifest_of(&object()).unwrap().duplicate_attempts, 1);
        assert!(f.channels.error.is_empty());
    }

    #[tokio::test]
    async fn test_changed_content_replaces_rows() {
        let f = fixture();
        f.store.put(&object(), csv(&[row("SN-1"), row("SN-2")]));
        f.loader.handle_event(&event()).await.unwrap();

        f.store.put(&object(), csv(&[row("SN-3")]));
        let outcome = f.loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.reason, None);
        let rows = f.warehouse.rows(&object());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial_number, "SN-3");
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let f = fixture();
        f.store.put(&object(), csv(&[row("SN-1")]));
        f.channels.fail_next_publishes(3);

        let err = tokio_test::assert_err!(f.loader.handle_event(&event()).await);

        assert!(matches!(err, LoaderError::Publish { .. }));
        // The load itself committed
        assert_eq!(f.warehouse.commits(), 1);
        assert_eq!(f.channels.published(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_parkable() {
        let f = fixture();
        let channel = etl_pipeline::memory::MemoryChannel::new("etl.ingestion");
        channel.publish_raw("garbage", b"{not json".to_vec());

        let dispositions = channel.deliver(&f.loader).await;

        assert!(matches!(dispositions[0], etl_pipeline::Disposition::Park(_)));
        assert_eq!(channel.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_outage_is_warehouse_error() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(&object(), csv(&[row("SN-1")]));
        let channels = Arc::new(MemoryOutcomeChannels::new());

        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_manifest()
            .times(3)
            .returning(|_| Err(WarehouseError::Unavailable("connection refused".into())));
        warehouse.expect_load().never();

        let loader = Loader::new(store, Arc::new(warehouse), channels.clone()).with_retry(fast_retry());
        let outcome = loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.outcome, Outcome::Error);
        assert!(outcome.reason.unwrap().starts_with("warehouse: "));
        assert_eq!(channels.error.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_counter_failure_does_not_block_success() {
        let store = Arc::new(MemoryObjectStore::new());
        let bytes = csv(&[row("SN-1")]);
        let digest = hex::encode(Sha256::digest(&bytes));
        store.put(&object(), bytes);
        let channels = Arc::new(MemoryOutcomeChannels::new());

        let mut warehouse = MockWarehouse::new();
        warehouse.expect_manifest().returning(move |id| {
            Ok(Some(LoadManifest {
                object_id: id.clone(),
                content_sha256: digest.clone(),
                row_count: 1,
                loaded_at: Utc::now(),
                duplicate_attempts: 0,
            }))
        });
        warehouse
            .expect_note_duplicate()
            .times(1)
            .returning(|_| Err(WarehouseError::Rejected("permission denied".into())));
        warehouse.expect_load().never();

        let loader = Loader::new(store, Arc::new(warehouse), channels.clone()).with_retry(fast_retry());
        let outcome = loader.handle_event(&event()).await.unwrap();

        assert_eq!(outcome.reason.as_deref(), Some(DUPLICATE_REASON));
        assert_eq!(channels.success.len(), 1);
    }
}
