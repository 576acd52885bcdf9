//! Outcome routing: moving a processed object out of the ingestion location.
//!
//! A move is copy, verify, delete. Every step is safe to repeat, so a router
//! that crashes anywhere in the sequence finishes the move when the outcome
//! event is delivered again. The source is never deleted unless the
//! destination holds a replica whose size and etag match it.

use crate::config::RouteConfig;
use async_trait::async_trait;
use etl_pipeline::{
    retry_transient, with_deadline, ConsumerError, IncomingMessage, MessageHandler, ObjectId,
    ObjectMeta, ObjectStore, OutcomeEvent, RetryConfig, StorageError, TimeoutConfig, Transient,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Step of a move, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStep {
    Inspect,
    Copy,
    Verify,
    Delete,
}

impl fmt::Display for MoveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            MoveStep::Inspect => "inspect",
            MoveStep::Copy => "copy",
            MoveStep::Verify => "verify",
            MoveStep::Delete => "delete",
        };
        f.write_str(step)
    }
}

/// Errors that abort a move
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Storage failure during {step}: {source}")]
    Storage {
        step: MoveStep,
        #[source]
        source: StorageError,
    },

    #[error("Replica of {object_id} in {bucket} does not match the source")]
    VerificationFailed { object_id: ObjectId, bucket: String },
}

impl RouterError {
    fn storage(step: MoveStep) -> impl Fn(StorageError) -> RouterError {
        move |source| RouterError::Storage { step, source }
    }
}

impl Transient for RouterError {
    fn is_transient(&self) -> bool {
        match self {
            RouterError::Storage { source, .. } => source.is_transient(),
            RouterError::VerificationFailed { .. } => true,
        }
    }
}

/// How a completed move came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Copied, verified and deleted on this delivery
    Moved,
    /// A verified replica already existed; only the delete was needed
    Resumed,
    /// The source no longer held the object
    AlreadyMoved,
}

impl MoveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveOutcome::Moved => "moved",
            MoveOutcome::Resumed => "resumed",
            MoveOutcome::AlreadyMoved => "already_moved",
        }
    }
}

/// Moves objects named by outcome events from the route's source bucket to
/// its destination bucket
pub struct OutcomeRouter {
    store: Arc<dyn ObjectStore>,
    route: RouteConfig,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
}

impl OutcomeRouter {
    pub fn new(store: Arc<dyn ObjectStore>, route: RouteConfig) -> Self {
        Self {
            store,
            route,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn route(&self) -> &RouteConfig {
        &self.route
    }

    /// Move the object named by `event` to the destination bucket
    #[instrument(skip(self, event), fields(object_id = %event.object_id, outcome = %event.outcome))]
    pub async fn route_event(&self, event: &OutcomeEvent) -> Result<MoveOutcome, RouterError> {
        let started = Instant::now();

        if event.object_id.bucket() != self.route.source {
            warn!(
                event_bucket = event.object_id.bucket(),
                source = %self.route.source,
                "Event names a different bucket, using the configured source"
            );
        }

        let source = event.object_id.in_bucket(&self.route.source);
        let result = self.move_object(&source).await;

        match &result {
            Ok(MoveOutcome::AlreadyMoved) => {
                metrics::counter!("router.objects.already_moved").increment(1);
            }
            Ok(outcome) => {
                info!(
                    destination = %self.route.destination,
                    how = outcome.as_str(),
                    "Object moved"
                );
                metrics::counter!("router.objects.moved", "outcome" => event.outcome.as_str())
                    .increment(1);
            }
            Err(_) => {}
        }

        metrics::histogram!("router.duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn move_object(&self, source: &ObjectId) -> Result<MoveOutcome, RouterError> {
        let destination = source.in_bucket(&self.route.destination);

        let source_meta = match self.head(source).await? {
            Some(meta) => meta,
            None => {
                if self.head(&destination).await?.is_none() {
                    warn!(
                        destination = %destination,
                        "Object is in neither the source nor the destination"
                    );
                } else {
                    debug!("Object already in destination");
                }
                return Ok(MoveOutcome::AlreadyMoved);
            }
        };

        let resumed = match self.head(&destination).await? {
            Some(replica) if source_meta.matches(&replica) => {
                info!("Verified replica already present, completing earlier move");
                true
            }
            Some(_) => {
                warn!("Destination holds a different object, overwriting");
                false
            }
            None => false,
        };

        if !resumed {
            self.copy_verified(source, &destination, &source_meta).await?;
        }

        self.delete(source).await?;

        Ok(if resumed {
            MoveOutcome::Resumed
        } else {
            MoveOutcome::Moved
        })
    }

    async fn head(&self, id: &ObjectId) -> Result<Option<ObjectMeta>, RouterError> {
        let store = &self.store;
        let timeouts = &self.timeouts;
        retry_transient(&self.retry, "head object", move || async move {
            with_deadline(timeouts.storage(), "head object", store.head(id)).await
        })
        .await
        .map_err(RouterError::storage(MoveStep::Inspect))
    }

    /// Copy and check the replica; a mismatch is retried like an I/O failure
    async fn copy_verified(
        &self,
        source: &ObjectId,
        destination: &ObjectId,
        expected: &ObjectMeta,
    ) -> Result<(), RouterError> {
        let store = &self.store;
        let timeouts = &self.timeouts;
        let bucket = destination.bucket();

        retry_transient(&self.retry, "copy object", move || async move {
            with_deadline(timeouts.storage(), "copy object", store.copy(source, bucket))
                .await
                .map_err(RouterError::storage(MoveStep::Copy))?;

            let replica = with_deadline(timeouts.storage(), "verify replica", store.head(destination))
                .await
                .map_err(RouterError::storage(MoveStep::Verify))?;

            match replica {
                Some(replica) if expected.matches(&replica) => Ok(()),
                _ => Err(RouterError::VerificationFailed {
                    object_id: source.clone(),
                    bucket: bucket.to_string(),
                }),
            }
        })
        .await
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), RouterError> {
        let store = &self.store;
        let timeouts = &self.timeouts;
        retry_transient(&self.retry, "delete object", move || async move {
            with_deadline(timeouts.storage(), "delete object", store.delete(id)).await
        })
        .await
        .map_err(RouterError::storage(MoveStep::Delete))
    }
}

#[async_trait]
impl MessageHandler for OutcomeRouter {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let event: OutcomeEvent = message.decode_json()?;

        if event.outcome != self.route.outcome {
            warn!(
                object_id = %event.object_id,
                outcome = %event.outcome,
                expected = %self.route.outcome,
                "Ignoring outcome event for another channel"
            );
            return Ok(());
        }

        match self.route_event(&event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    object_id = %event.object_id,
                    error = %e,
                    "Move failed permanently, object left in source"
                );
                metrics::counter!("router.moves.failed").increment(1);
                Err(ConsumerError::Rejected(e.to_string()))
            }
        }
    }
}
