//! Object storage access for the pipeline stages.
//!
//! [`ObjectStore`] is the seam both services depend on; [`S3ObjectStore`] is
//! the production implementation against any S3-compatible endpoint.

use crate::events::ObjectId;
use crate::retry::{TimedOut, Transient};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::types::{ChecksumAlgorithm, ChecksumMode};
use aws_sdk_s3::Client as S3Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by object storage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Storage request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Timeout(#[from] TimedOut),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Timeout(_))
    }
}

/// Size, entity tag and checksum of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Only set when the tag is a digest of the content; S3 tags of
    /// KMS-encrypted objects are not
    pub etag: Option<String>,
    /// Base64 SHA-256 checksum, when the store keeps one
    pub checksum_sha256: Option<String>,
}

impl ObjectMeta {
    pub fn new(size: u64, etag: Option<String>) -> Self {
        Self {
            size,
            etag,
            checksum_sha256: None,
        }
    }

    /// Whether `replica` is a faithful copy of `self`.
    ///
    /// Sizes must match. Checksums are compared when both sides carry a
    /// whole-object one, otherwise entity tags when both are whole-object
    /// digests. Multipart (`<digest>-<parts>`) values change on copy and are
    /// never compared.
    pub fn matches(&self, replica: &ObjectMeta) -> bool {
        if self.size != replica.size {
            return false;
        }
        if let Some(same) = compare_digests(&self.checksum_sha256, &replica.checksum_sha256) {
            return same;
        }
        compare_digests(&self.etag, &replica.etag).unwrap_or(true)
    }
}

/// `None` when either side is missing or a multipart composite
fn compare_digests(a: &Option<String>, b: &Option<String>) -> Option<bool> {
    let a = a.as_deref()?.trim_matches('"');
    let b = b.as_deref()?.trim_matches('"');
    if a.contains('-') || b.contains('-') {
        return None;
    }
    Some(a == b)
}

/// Blob store holding the ingestion, success and error locations
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the full content of an object
    async fn get(&self, id: &ObjectId) -> Result<Vec<u8>, StorageError>;

    /// Metadata of an object, or `None` if it does not exist
    async fn head(&self, id: &ObjectId) -> Result<Option<ObjectMeta>, StorageError>;

    /// Server-side copy of `source` to the same key in `destination_bucket`
    async fn copy(&self, source: &ObjectId, destination_bucket: &str) -> Result<(), StorageError>;

    /// Delete an object. Deleting an absent object succeeds.
    async fn delete(&self, id: &ObjectId) -> Result<(), StorageError>;
}

/// S3 connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// [`ObjectStore`] backed by an S3-compatible service
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Self { client }
    }
}

/// Map an SDK failure onto the retry taxonomy: throttling, 5xx and transport
/// problems are transient, everything else is rejected.
fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>, action: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", action, DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Unavailable(message)
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            if status == 429 || status >= 500 {
                StorageError::Unavailable(message)
            } else {
                StorageError::Rejected(message)
            }
        }
        _ => StorageError::Rejected(message),
    }
}

/// `x-amz-copy-source` value: bucket plus URL-encoded key segments
fn copy_source(id: &ObjectId) -> String {
    let key: Vec<String> = id
        .key()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", id.bucket(), key.join("/"))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(object_id = %id))]
    async fn get(&self, id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(id.bucket())
            .key(id.key())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound(id.clone()));
                }
                return Err(classify_sdk_error(e, "get object"));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(format!("read object body: {}", e)))?;
        let bytes = body.into_bytes().to_vec();

        debug!(size_bytes = bytes.len(), "Object downloaded");
        Ok(bytes)
    }

    async fn head(&self, id: &ObjectId) -> Result<Option<ObjectMeta>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(id.bucket())
            .key(id.key())
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
        {
            Ok(output) => {
                let kms_encrypted = output
                    .server_side_encryption()
                    .map(|sse| sse.as_str().starts_with("aws:kms"))
                    .unwrap_or(false);
                Ok(Some(ObjectMeta {
                    size: output.content_length().unwrap_or_default().max(0) as u64,
                    etag: output.e_tag().filter(|_| !kms_encrypted).map(String::from),
                    checksum_sha256: output.checksum_sha256().map(String::from),
                }))
            }
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(classify_sdk_error(e, "head object"))
                }
            }
        }
    }

    #[instrument(skip(self), fields(object_id = %source))]
    async fn copy(&self, source: &ObjectId, destination_bucket: &str) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(destination_bucket)
            .key(source.key())
            .copy_source(copy_source(source))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "copy object"))?;

        debug!(destination_bucket, "Object copied");
        Ok(())
    }

    #[instrument(skip(self), fields(object_id = %id))]
    async fn delete(&self, id: &ObjectId) -> Result<(), StorageError> {
        // S3 reports success for absent keys
        self.client
            .delete_object()
            .bucket(id.bucket())
            .key(id.key())
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "delete object"))?;

        debug!("Object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encodes_key_segments() {
        let id = ObjectId::new("landing", "2024/jan data/tractors#1.csv").unwrap();
        assert_eq!(copy_source(&id), "landing/2024/jan%20data/tractors%231.csv");
    }

    fn meta(size: u64, etag: &str) -> ObjectMeta {
        ObjectMeta::new(size, Some(etag.to_string()))
    }

    #[test]
    fn test_meta_matches_ignores_etag_quotes() {
        assert!(meta(10, "\"abc\"").matches(&meta(10, "abc")));
    }

    #[test]
    fn test_meta_mismatch() {
        let source = meta(10, "abc");
        assert!(!source.matches(&meta(11, "abc")));
        assert!(!source.matches(&meta(10, "def")));
        assert!(source.matches(&ObjectMeta::new(10, None)));
    }

    #[test]
    fn test_multipart_etag_is_not_compared() {
        // A copy of a multipart upload gets a single-part tag
        let source = meta(10, "\"9b2cf535f27731c974343645a3985328-3\"");
        let replica = meta(10, "\"d41d8cd98f00b204e9800998ecf8427e\"");

        assert!(source.matches(&replica));
        assert!(!source.matches(&meta(12, "d41d8cd98f00b204e9800998ecf8427e")));
    }

    #[test]
    fn test_checksums_take_precedence_over_etags() {
        let mut source = meta(10, "abc-2");
        source.checksum_sha256 = Some("n4bQgYhMfWWaL+qgxVrQFaO/TxsrC4Is0V1sFbDwCgg=".to_string());

        let mut replica = meta(10, "def");
        replica.checksum_sha256 = source.checksum_sha256.clone();
        assert!(source.matches(&replica));

        replica.checksum_sha256 = Some("47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=".to_string());
        assert!(!source.matches(&replica));
    }

    #[test]
    fn test_storage_error_classification() {
        let id = ObjectId::new("landing", "a.csv").unwrap();
        assert!(!StorageError::NotFound(id).is_transient());
        assert!(StorageError::Unavailable("503".into()).is_transient());
        assert!(!StorageError::Rejected("403".into()).is_transient());
    }
}
