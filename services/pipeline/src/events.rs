//! Event types exchanged between pipeline stages.
//!
//! Both event types travel as JSON. An [`ObjectId`] is serialised as a single
//! `"<bucket>/<key>"` string so that it can double as the message key on the
//! outcome channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when an object identifier string is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid object id '{0}': expected <bucket>/<key>")]
pub struct InvalidObjectId(pub String);

/// Address of a stored object: the bucket that currently owns it plus its key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    bucket: String,
    key: String,
}

impl ObjectId {
    /// Create an object id, rejecting empty components
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self, InvalidObjectId> {
        let bucket = bucket.into();
        let key = key.into();

        if bucket.is_empty() || key.is_empty() || bucket.contains('/') {
            return Err(InvalidObjectId(format!("{}/{}", bucket, key)));
        }

        Ok(Self { bucket, key })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The same key addressed in another bucket
    pub fn in_bucket(&self, bucket: &str) -> ObjectId {
        ObjectId {
            bucket: bucket.to_string(),
            key: self.key.clone(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectId {
    type Err = InvalidObjectId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bucket, key) = s
            .split_once('/')
            .ok_or_else(|| InvalidObjectId(s.to_string()))?;
        ObjectId::new(bucket, key).map_err(|_| InvalidObjectId(s.to_string()))
    }
}

impl TryFrom<String> for ObjectId {
    type Error = InvalidObjectId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_string()
    }
}

/// Emitted by the notification source when an object lands in the ingestion bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionEvent {
    /// Object that was created
    pub object_id: ObjectId,
    /// Object size in bytes
    #[serde(default)]
    pub size: u64,
    /// MIME type reported by the store
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// When the object was created
    pub created_at: DateTime<Utc>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// Terminal result of processing one ingestion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published by the loader to exactly one outcome channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub object_id: ObjectId,
    pub outcome: Outcome,
    /// Classified failure cause, or a note such as a duplicate delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn success(object_id: ObjectId) -> Self {
        Self {
            object_id,
            outcome: Outcome::Success,
            reason: None,
            processed_at: Utc::now(),
        }
    }

    pub fn error(object_id: ObjectId, reason: impl Into<String>) -> Self {
        Self {
            object_id,
            outcome: Outcome::Error,
            reason: Some(reason.into()),
            processed_at: Utc::now(),
        }
    }

    /// Attach a note to the event
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
