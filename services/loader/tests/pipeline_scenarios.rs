//! End-to-end runs of loader and routers over the in-memory adapters.

use chrono::Utc;
use etl_loader::{Loader, MemoryWarehouse, DUPLICATE_REASON};
use etl_pipeline::memory::{MemoryChannel, MemoryObjectStore, MemoryOutcomeChannels, StoreOp};
use etl_pipeline::{
    Disposition, IngestionEvent, ObjectId, Outcome, OutcomeEvent, RetryConfig, StorageError,
    TimeoutConfig,
};
use etl_router::{OutcomeRouter, RouteConfig};
use std::sync::Arc;
use std::time::Duration;

const LANDING: &str = "landing";
const PROCESSED: &str = "processed";
const REJECTED: &str = "rejected";

const HEADER: &str = "Date;Serial number;GPS longitude;GPS latitude;Working hours;Engine speed;\
Engine load;Fuel consumption;Speed gearbox;Speed radar;Coolant temperature;Front PTO;Rear PTO;\
Gear shift;Ambient temperature;Parking brake;Differential lock;All-wheel drive;Creeper";

fn row(serial: &str) -> String {
    format!(
        "Jun 12, 2017 10:30:00 AM;{};-93.265;44.9778;1532.5;1800;65;12.4;8.5;8.1;87;540;1000;F4;21.5;OFF;OFF;ON;OFF",
        serial
    )
}

fn telemetry_file(rows: &[String]) -> Vec<u8> {
    let mut text = HEADER.to_string();
    for r in rows {
        text.push('\n');
        text.push_str(r);
    }
    text.push('\n');
    text.into_bytes()
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_interval_ms: 1,
        max_interval_ms: 5,
        multiplier: 2.0,
    }
}

struct Pipeline {
    store: Arc<MemoryObjectStore>,
    warehouse: Arc<MemoryWarehouse>,
    channels: Arc<MemoryOutcomeChannels>,
    ingestion: MemoryChannel,
    loader: Loader,
    success_router: OutcomeRouter,
    error_router: OutcomeRouter,
}

impl Pipeline {
    fn new() -> Self {
        Self::with_timeouts(TimeoutConfig::default())
    }

    fn with_timeouts(timeouts: TimeoutConfig) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let channels = Arc::new(MemoryOutcomeChannels::new());

        let loader = Loader::new(store.clone(), warehouse.clone(), channels.clone())
            .with_retry(fast_retry())
            .with_timeouts(timeouts);

        let router_for = |destination: &str, outcome: Outcome| {
            OutcomeRouter::new(
                store.clone(),
                RouteConfig {
                    source: LANDING.to_string(),
                    destination: destination.to_string(),
                    outcome,
                    topic: None,
                },
            )
            .with_retry(fast_retry())
        };

        Self {
            success_router: router_for(PROCESSED, Outcome::Success),
            error_router: router_for(REJECTED, Outcome::Error),
            store,
            warehouse,
            channels,
            ingestion: MemoryChannel::new("etl.ingestion"),
            loader,
        }
    }

    /// Put a file into the ingestion location and announce it
    fn land(&self, key: &str, bytes: Vec<u8>) -> ObjectId {
        let id = ObjectId::new(LANDING, key).unwrap();
        let event = IngestionEvent {
            object_id: id.clone(),
            size: bytes.len() as u64,
            content_type: "text/csv".to_string(),
            created_at: Utc::now(),
        };
        self.store.put(&id, bytes);
        self.ingestion.publish_json(&id.to_string(), &event).unwrap();
        id
    }

    async fn load(&self) -> Vec<Disposition> {
        self.ingestion.deliver(&self.loader).await
    }

    async fn route(&self) -> (Vec<Disposition>, Vec<Disposition>) {
        let success = self.channels.success.deliver(&self.success_router).await;
        let error = self.channels.error.deliver(&self.error_router).await;
        (success, error)
    }

    async fn run(&self) {
        self.load().await;
        self.route().await;
    }

    /// Buckets currently holding the object's key
    fn locations(&self, id: &ObjectId) -> Vec<&'static str> {
        [LANDING, PROCESSED, REJECTED]
            .into_iter()
            .filter(|bucket| self.store.contains(&id.in_bucket(bucket)))
            .collect()
    }
}

#[tokio::test]
async fn well_formed_file_is_loaded_and_moved_to_success() {
    let pipeline = Pipeline::new();
    let id = pipeline.land("tractor-1.csv", telemetry_file(&[row("SN-1"), row("SN-2"), row("SN-3")]));

    pipeline.run().await;

    assert_eq!(pipeline.warehouse.rows(&id).len(), 3);
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);

    let published: Vec<OutcomeEvent> = pipeline.channels.success.messages();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].object_id, id);
    assert!(pipeline.channels.error.is_empty());
    assert_eq!(pipeline.ingestion.pending(), 0);
}

#[tokio::test]
async fn one_bad_row_sends_whole_file_to_error() {
    let pipeline = Pipeline::new();
    let missing_serial = row("SN-2").replace(";SN-2;", ";;");
    let id = pipeline.land(
        "tractor-2.csv",
        telemetry_file(&[row("SN-1"), missing_serial, row("SN-3")]),
    );

    pipeline.run().await;

    assert_eq!(pipeline.warehouse.total_rows(), 0);
    assert_eq!(pipeline.locations(&id), vec![REJECTED]);

    let published: Vec<OutcomeEvent> = pipeline.channels.error.messages();
    assert_eq!(published.len(), 1);
    let reason = published[0].reason.as_deref().unwrap();
    assert!(reason.starts_with("validation: line 3"), "{}", reason);
    assert!(pipeline.channels.success.is_empty());
}

#[tokio::test]
async fn warehouse_timeouts_are_retried_without_duplicates() {
    let pipeline = Pipeline::with_timeouts(TimeoutConfig {
        warehouse_ms: 50,
        ..TimeoutConfig::default()
    });
    pipeline.warehouse.stall_next_load(Duration::from_millis(500));
    pipeline.warehouse.stall_next_load(Duration::from_millis(500));

    let id = pipeline.land("tractor-3.csv", telemetry_file(&[row("SN-1"), row("SN-2"), row("SN-3")]));
    pipeline.run().await;

    assert_eq!(pipeline.channels.success.len(), 1);
    assert!(pipeline.channels.error.is_empty());
    assert_eq!(pipeline.warehouse.commits(), 1);
    assert_eq!(pipeline.warehouse.rows(&id).len(), 3);
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);
}

#[tokio::test]
async fn redelivered_ingestion_after_success_adds_no_rows() {
    let pipeline = Pipeline::new();
    let id = pipeline.land("tractor-4.csv", telemetry_file(&[row("SN-1"), row("SN-2")]));
    pipeline.run().await;

    pipeline.ingestion.replay_all();
    pipeline.run().await;

    assert_eq!(pipeline.warehouse.commits(), 1);
    assert_eq!(pipeline.warehouse.total_rows(), 2);
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);

    let published: Vec<OutcomeEvent> = pipeline.channels.success.messages();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].reason.as_deref(), Some(DUPLICATE_REASON));
}

#[tokio::test]
async fn duplicate_ingestion_before_routing_loads_once() {
    let pipeline = Pipeline::new();
    let id = pipeline.land("tractor-5.csv", telemetry_file(&[row("SN-1")]));

    pipeline.load().await;
    pipeline.ingestion.replay_all();
    pipeline.load().await;
    pipeline.route().await;

    assert_eq!(pipeline.warehouse.commits(), 1);
    assert_eq!(pipeline.warehouse.manifest_of(&id).unwrap().duplicate_attempts, 1);
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);
}

#[tokio::test]
async fn redelivered_outcome_is_a_noop() {
    let pipeline = Pipeline::new();
    let id = pipeline.land("tractor-6.csv", telemetry_file(&[row("SN-1")]));
    pipeline.run().await;
    let copies = pipeline.store.calls(StoreOp::Copy);
    let deletes = pipeline.store.calls(StoreOp::Delete);

    pipeline.channels.success.replay_all();
    let (dispositions, _) = pipeline.route().await;

    assert_eq!(dispositions, vec![Disposition::Acknowledge]);
    assert_eq!(pipeline.store.calls(StoreOp::Copy), copies);
    assert_eq!(pipeline.store.calls(StoreOp::Delete), deletes);
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);
}

#[tokio::test]
async fn crash_between_copy_and_delete_resumes_on_rerun() {
    let pipeline = Pipeline::new();
    let id = pipeline.land("tractor-7.csv", telemetry_file(&[row("SN-1")]));
    for _ in 0..3 {
        pipeline
            .store
            .inject_fault(StoreOp::Delete, StorageError::Unavailable("connection reset".into()));
    }

    pipeline.load().await;
    let (dispositions, _) = pipeline.route().await;

    assert!(matches!(dispositions[0], Disposition::Park(_)));
    assert_eq!(pipeline.channels.success.dead_letters().len(), 1);
    assert_eq!(pipeline.locations(&id), vec![LANDING, PROCESSED]);

    pipeline.channels.success.replay_all();
    let (dispositions, _) = pipeline.route().await;

    assert_eq!(dispositions, vec![Disposition::Acknowledge]);
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);
    assert_eq!(pipeline.store.calls(StoreOp::Copy), 1);
}

#[tokio::test]
async fn publish_outage_redelivers_and_republishes_success() {
    let pipeline = Pipeline::new();
    let id = pipeline.land("tractor-8.csv", telemetry_file(&[row("SN-1"), row("SN-2")]));
    pipeline.channels.fail_next_publishes(3);

    let first = pipeline.load().await;

    assert!(matches!(first[0], Disposition::Redeliver(_)));
    assert_eq!(pipeline.ingestion.pending(), 1);
    assert_eq!(pipeline.warehouse.commits(), 1);
    assert_eq!(pipeline.channels.published(), 0);
    assert_eq!(pipeline.locations(&id), vec![LANDING]);

    pipeline.run().await;

    assert_eq!(pipeline.warehouse.commits(), 1);
    assert_eq!(pipeline.warehouse.total_rows(), 2);
    let published: Vec<OutcomeEvent> = pipeline.channels.success.messages();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].reason.as_deref(), Some(DUPLICATE_REASON));
    assert_eq!(pipeline.locations(&id), vec![PROCESSED]);
}

#[tokio::test]
async fn undecodable_notification_is_parked() {
    let pipeline = Pipeline::new();
    pipeline
        .ingestion
        .publish_raw("landing/unknown", b"object created".to_vec());

    let dispositions = pipeline.load().await;

    assert!(matches!(dispositions[0], Disposition::Park(_)));
    assert_eq!(pipeline.ingestion.dead_letters().len(), 1);
    assert_eq!(pipeline.channels.published(), 0);
}

#[tokio::test]
async fn files_are_routed_independently() {
    let pipeline = Pipeline::new();
    let good = pipeline.land("good.csv", telemetry_file(&[row("SN-1")]));
    let empty = pipeline.land("empty.csv", telemetry_file(&[]));

    pipeline.run().await;

    assert_eq!(pipeline.locations(&good), vec![PROCESSED]);
    assert_eq!(pipeline.locations(&empty), vec![REJECTED]);
    assert_eq!(pipeline.store.keys_in(LANDING), Vec::<String>::new());
}
