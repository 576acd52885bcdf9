//! Warehouse write interface.
//!
//! A load replaces every row previously stored for the object and upserts its
//! [`LoadManifest`] in the same transaction, so a repeated load of the same
//! object never leaves duplicate rows behind. Loads of one object are
//! serialized and re-check the manifest digest once they hold the lock, so a
//! concurrent duplicate delivery commits nothing.

use crate::record::TelemetryRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_pipeline::{ObjectId, TimedOut, Transient};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex as AsyncMutex;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the warehouse
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WarehouseError {
    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    #[error("Warehouse rejected the write: {0}")]
    Rejected(String),

    #[error(transparent)]
    Timeout(#[from] TimedOut),
}

impl Transient for WarehouseError {
    fn is_transient(&self) -> bool {
        matches!(self, WarehouseError::Unavailable(_) | WarehouseError::Timeout(_))
    }
}

/// Record of the last committed load of one object
#[derive(Debug, Clone, PartialEq)]
pub struct LoadManifest {
    pub object_id: ObjectId,
    /// Hex SHA-256 of the loaded content
    pub content_sha256: String,
    pub row_count: u64,
    pub loaded_at: DateTime<Utc>,
    /// Deliveries skipped because this content was already loaded
    pub duplicate_attempts: u32,
}

/// Result of a committed load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReceipt {
    pub rows_written: u64,
    /// Rows of an earlier load of the same object that were replaced
    pub rows_replaced: u64,
    /// Another load committed the same content first; nothing was written
    /// and the duplicate was counted on the manifest
    pub already_loaded: bool,
}

impl LoadReceipt {
    pub(crate) fn duplicate() -> Self {
        Self {
            rows_written: 0,
            rows_replaced: 0,
            already_loaded: true,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Manifest of the last committed load of `object_id`, if any
    async fn manifest(&self, object_id: &ObjectId) -> Result<Option<LoadManifest>, WarehouseError>;

    /// Atomically replace the rows of `object_id` with `records` and upsert
    /// its manifest. If a committed manifest already carries
    /// `content_sha256`, count a duplicate instead and write nothing.
    async fn load(
        &self,
        object_id: &ObjectId,
        content_sha256: &str,
        records: &[TelemetryRecord],
    ) -> Result<LoadReceipt, WarehouseError>;

    /// Count a delivery that was skipped as a duplicate
    async fn note_duplicate(&self, object_id: &ObjectId) -> Result<(), WarehouseError>;
}

enum LoadFault {
    Fail(WarehouseError),
    Stall(Duration),
}

/// In-memory [`Warehouse`] for tests, with fault injection on `load`
#[derive(Default)]
pub struct MemoryWarehouse {
    rows: Mutex<HashMap<ObjectId, Vec<TelemetryRecord>>>,
    manifests: Mutex<HashMap<ObjectId, LoadManifest>>,
    faults: Mutex<VecDeque<LoadFault>>,
    commits: Mutex<u32>,
    /// Held for the whole of a load, like the per-object transaction lock
    load_lock: AsyncMutex<()>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next load with `error` before anything is written
    pub fn fail_next_load(&self, error: WarehouseError) {
        self.faults.lock().push_back(LoadFault::Fail(error));
    }

    /// Make the next load hang for `duration` before writing. A caller
    /// deadline shorter than that aborts the load with nothing committed.
    pub fn stall_next_load(&self, duration: Duration) {
        self.faults.lock().push_back(LoadFault::Stall(duration));
    }

    pub fn rows(&self, object_id: &ObjectId) -> Vec<TelemetryRecord> {
        self.rows.lock().get(object_id).cloned().unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.rows.lock().values().map(Vec::len).sum()
    }

    /// Number of committed loads
    pub fn commits(&self) -> u32 {
        *self.commits.lock()
    }

    pub fn manifest_of(&self, object_id: &ObjectId) -> Option<LoadManifest> {
        self.manifests.lock().get(object_id).cloned()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn manifest(&self, object_id: &ObjectId) -> Result<Option<LoadManifest>, WarehouseError> {
        Ok(self.manifest_of(object_id))
    }

    async fn load(
        &self,
        object_id: &ObjectId,
        content_sha256: &str,
        records: &[TelemetryRecord],
    ) -> Result<LoadReceipt, WarehouseError> {
        let _guard = self.load_lock.lock().await;

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(LoadFault::Fail(error)) => return Err(error),
            Some(LoadFault::Stall(duration)) => tokio::time::sleep(duration).await,
            None => {}
        }

        if let Some(manifest) = self.manifests.lock().get_mut(object_id) {
            if manifest.content_sha256 == content_sha256 {
                manifest.duplicate_attempts += 1;
                return Ok(LoadReceipt::duplicate());
            }
        }

        let rows_replaced = self
            .rows
            .lock()
            .insert(object_id.clone(), records.to_vec())
            .map(|old| old.len() as u64)
            .unwrap_or(0);

        let duplicate_attempts = self
            .manifests
            .lock()
            .get(object_id)
            .map(|m| m.duplicate_attempts)
            .unwrap_or(0);

        self.manifests.lock().insert(
            object_id.clone(),
            LoadManifest {
                object_id: object_id.clone(),
                content_sha256: content_sha256.to_string(),
                row_count: records.len() as u64,
                loaded_at: Utc::now(),
                duplicate_attempts,
            },
        );
        *self.commits.lock() += 1;

        Ok(LoadReceipt {
            rows_written: records.len() as u64,
            rows_replaced,
            already_loaded: false,
        })
    }

    async fn note_duplicate(&self, object_id: &ObjectId) -> Result<(), WarehouseError> {
        if let Some(manifest) = self.manifests.lock().get_mut(object_id) {
            manifest.duplicate_attempts += 1;
        }
        Ok(())
    }
}
