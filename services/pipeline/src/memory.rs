//! In-memory adapters for the external services.
//!
//! These back the scenario tests of both stages. Each adapter can be told to
//! fail upcoming calls so retry, crash and redelivery paths can be exercised
//! without a broker, an object store or a warehouse.

use crate::consumer::{
    dispatch, settle_park, Disposition, IncomingMessage, MessageHandler, MessageMetadata,
};
use crate::events::{ObjectId, Outcome, OutcomeEvent};
use crate::object_store::{ObjectMeta, ObjectStore, StorageError};
use crate::producer::{OutcomePublisher, ProducerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};

/// Object store operations that can have faults injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Head,
    Copy,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    etag: String,
}

fn etag_for(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

/// [`ObjectStore`] holding objects in a map keyed by bucket and key
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    faults: Mutex<HashMap<StoreOp, VecDeque<StorageError>>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: &ObjectId, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        let etag = etag_for(&bytes);
        self.objects
            .lock()
            .insert((id.bucket().to_string(), id.key().to_string()), StoredObject { bytes, etag });
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects
            .lock()
            .contains_key(&(id.bucket().to_string(), id.key().to_string()))
    }

    /// Keys currently held by `bucket`
    pub fn keys_in(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Overwrite the bytes of an existing object without touching its etag
    pub fn corrupt(&self, id: &ObjectId, bytes: impl Into<Vec<u8>>) {
        if let Some(object) = self
            .objects
            .lock()
            .get_mut(&(id.bucket().to_string(), id.key().to_string()))
        {
            object.bytes = bytes.into();
        }
    }

    /// Fail the next call of `op` with `error`. Faults queue up in order.
    pub fn inject_fault(&self, op: StoreOp, error: StorageError) {
        self.faults.lock().entry(op).or_default().push_back(error);
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: StoreOp) -> Result<(), StorageError> {
        *self.calls.lock().entry(op).or_default() += 1;
        match self.faults.lock().get_mut(&op).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn lookup(&self, id: &ObjectId) -> Option<StoredObject> {
        self.objects
            .lock()
            .get(&(id.bucket().to_string(), id.key().to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        self.enter(StoreOp::Get)?;
        self.lookup(id)
            .map(|object| object.bytes)
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn head(&self, id: &ObjectId) -> Result<Option<ObjectMeta>, StorageError> {
        self.enter(StoreOp::Head)?;
        Ok(self
            .lookup(id)
            .map(|object| ObjectMeta::new(object.bytes.len() as u64, Some(object.etag))))
    }

    async fn copy(&self, source: &ObjectId, destination_bucket: &str) -> Result<(), StorageError> {
        self.enter(StoreOp::Copy)?;
        let object = self
            .lookup(source)
            .ok_or_else(|| StorageError::NotFound(source.clone()))?;
        self.objects.lock().insert(
            (destination_bucket.to_string(), source.key().to_string()),
            StoredObject {
                etag: etag_for(&object.bytes),
                bytes: object.bytes,
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), StorageError> {
        self.enter(StoreOp::Delete)?;
        self.objects
            .lock()
            .remove(&(id.bucket().to_string(), id.key().to_string()));
        Ok(())
    }
}

/// Delivery state of one message on a [`MemoryChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Published,
    Delivered(u32),
    Acknowledged,
}

#[derive(Debug)]
struct Envelope {
    message: IncomingMessage,
    deliveries: u32,
    acknowledged: bool,
}

impl Envelope {
    fn state(&self) -> DeliveryState {
        if self.acknowledged {
            DeliveryState::Acknowledged
        } else if self.deliveries == 0 {
            DeliveryState::Published
        } else {
            DeliveryState::Delivered(self.deliveries)
        }
    }
}

/// An at-least-once topic: messages stay until a handler acknowledges them
pub struct MemoryChannel {
    topic: String,
    log: Mutex<Vec<Envelope>>,
    dead_letters: Mutex<Vec<(IncomingMessage, String)>>,
    dead_letter_faults: Mutex<u32>,
}

impl MemoryChannel {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            log: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            dead_letter_faults: Mutex::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a JSON message; returns its offset
    pub fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<i64, ProducerError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(self.publish_raw(key, payload))
    }

    pub fn publish_raw(&self, key: &str, payload: Vec<u8>) -> i64 {
        let mut log = self.log.lock();
        let offset = log.len() as i64;
        log.push(Envelope {
            message: IncomingMessage {
                payload,
                metadata: MessageMetadata {
                    topic: self.topic.clone(),
                    partition: 0,
                    offset,
                    key: Some(key.as_bytes().to_vec()),
                    timestamp: Some(chrono::Utc::now().timestamp_millis()),
                    headers: HashMap::new(),
                },
            },
            deliveries: 0,
            acknowledged: false,
        });
        offset
    }

    /// Redeliver every acknowledged message as if the consumer lost its
    /// committed offsets
    pub fn replay_all(&self) {
        for envelope in self.log.lock().iter_mut() {
            envelope.acknowledged = false;
        }
    }

    /// Deliver every unacknowledged message once, in offset order, and apply
    /// the handler's disposition. Returns the dispositions in delivery order.
    pub async fn deliver<H: MessageHandler + ?Sized>(&self, handler: &H) -> Vec<Disposition> {
        let pending: Vec<(usize, IncomingMessage)> = {
            let mut log = self.log.lock();
            log.iter_mut()
                .enumerate()
                .filter(|(_, e)| !e.acknowledged)
                .map(|(i, e)| {
                    e.deliveries += 1;
                    (i, e.message.clone())
                })
                .collect()
        };

        let mut dispositions = Vec::with_capacity(pending.len());
        for (index, message) in pending {
            let disposition = match dispatch(handler, message.clone()).await {
                Disposition::Park(reason) => {
                    let recorded = self.record_dead_letter(&message, &reason);
                    settle_park(reason, recorded)
                }
                other => other,
            };
            match &disposition {
                Disposition::Acknowledge | Disposition::Park(_) => {
                    self.log.lock()[index].acknowledged = true
                }
                Disposition::Redeliver(_) => {}
            }
            dispositions.push(disposition);
        }
        dispositions
    }

    /// Fail the next `count` dead letter writes
    pub fn fail_next_dead_letters(&self, count: u32) {
        *self.dead_letter_faults.lock() += count;
    }

    fn record_dead_letter(&self, message: &IncomingMessage, reason: &str) -> Result<(), ProducerError> {
        let mut faults = self.dead_letter_faults.lock();
        if *faults > 0 {
            *faults -= 1;
            return Err(ProducerError::SendError {
                topic: "etl.dlq".to_string(),
                message: "broker unavailable".to_string(),
            });
        }
        self.dead_letters
            .lock()
            .push((message.clone(), reason.to_string()));
        Ok(())
    }

    pub fn state(&self, offset: i64) -> Option<DeliveryState> {
        self.log.lock().get(offset as usize).map(Envelope::state)
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        self.log.lock().iter().filter(|e| !e.acknowledged).count()
    }

    /// Decode every message ever published, in offset order
    pub fn messages<T: serde::de::DeserializeOwned>(&self) -> Vec<T> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| serde_json::from_slice(&e.message.payload).ok())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<(IncomingMessage, String)> {
        self.dead_letters.lock().clone()
    }
}

/// The success and error outcome channels as one [`OutcomePublisher`]
pub struct MemoryOutcomeChannels {
    pub success: MemoryChannel,
    pub error: MemoryChannel,
    publish_faults: Mutex<u32>,
}

impl MemoryOutcomeChannels {
    pub fn new() -> Self {
        Self {
            success: MemoryChannel::new("etl.outcomes.success"),
            error: MemoryChannel::new("etl.outcomes.error"),
            publish_faults: Mutex::new(0),
        }
    }

    pub fn channel(&self, outcome: Outcome) -> &MemoryChannel {
        match outcome {
            Outcome::Success => &self.success,
            Outcome::Error => &self.error,
        }
    }

    /// Fail the next `count` publish attempts with a transient send error
    pub fn fail_next_publishes(&self, count: u32) {
        *self.publish_faults.lock() += count;
    }

    pub fn published(&self) -> usize {
        self.success.len() + self.error.len()
    }
}

impl Default for MemoryOutcomeChannels {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutcomePublisher for MemoryOutcomeChannels {
    async fn publish(&self, event: &OutcomeEvent) -> Result<(), ProducerError> {
        let channel = self.channel(event.outcome);
        {
            let mut faults = self.publish_faults.lock();
            if *faults > 0 {
                *faults -= 1;
                return Err(ProducerError::SendError {
                    topic: channel.topic().to_string(),
                    message: "broker unavailable".to_string(),
                });
            }
        }
        channel.publish_json(&event.object_id.to_string(), event)?;
        Ok(())
    }
}
