//! Remote upload gateway trait.
//!
//! Every object-store backend must implement [`UploadGateway`].  The
//! trait is a narrow capability interface over the store's multipart
//! primitives; the gateway never retries and never consults local
//! session state.  Every error it returns is a remote-store error.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::errors::UploadError;

/// Minimum size of every part except the last (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Highest part number the remote store accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Largest single part the remote store accepts (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Bytes of one part, either in memory or staged on disk.
#[derive(Debug, Clone)]
pub enum PartPayload {
    /// Payload held in memory.
    Bytes(Bytes),
    /// Payload staged in a file of known size.  The caller owns the
    /// file and keeps it alive until the gateway call returns.
    File { path: PathBuf, size: u64 },
}

impl PartPayload {
    /// Payload size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            PartPayload::Bytes(b) => b.len() as u64,
            PartPayload::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the whole payload into memory.
    pub async fn read_all(&self) -> anyhow::Result<Bytes> {
        match self {
            PartPayload::Bytes(b) => Ok(b.clone()),
            PartPayload::File { path, .. } => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

impl From<Bytes> for PartPayload {
    fn from(data: Bytes) -> Self {
        PartPayload::Bytes(data)
    }
}

/// One entry of a completion request, serialized the way S3 clients
/// spell it (`PartNumber`, `ETag`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Result of a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    /// Final object ETag, when the store reports one.
    pub etag: Option<String>,
    /// Object location URL, when the store reports one.
    pub location: Option<String>,
}

/// An in-flight upload as listed by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
}

/// An upload the remote store has aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AbortedUpload {
    pub key: String,
    pub upload_id: String,
}

/// Result of a bulk abort.  Failures do not stop the sweep, so
/// `aborted` holds every upload the store did abort.
#[derive(Debug, Default)]
pub struct BulkAbort {
    pub aborted: Vec<AbortedUpload>,
    pub failed: Vec<(UploadSummary, anyhow::Error)>,
}

/// `true` when an optional filter is absent (or blank) or equals `value`.
fn filter_matches(filter: Option<&str>, value: &str) -> bool {
    match filter {
        None => true,
        Some(f) if f.is_empty() => true,
        Some(f) => f == value,
    }
}

/// Async multipart capability contract over an object store.
pub trait UploadGateway: Send + Sync + 'static {
    /// Start a multipart upload, returning the store-assigned upload ID.
    /// Never returns an empty identifier.
    fn initiate(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Transfer one part, returning its integrity tag (ETag).
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        payload: PartPayload,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Ask the store to assemble the object from `parts`, forwarded
    /// verbatim in the order given.
    fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompletedUpload>> + Send + '_>>;

    /// Abort one known upload.
    fn abort_one(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AbortedUpload>> + Send + '_>>;

    /// List every in-flight upload in `bucket`.
    fn list_in_flight(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSummary>>> + Send + '_>>;

    /// Abort every in-flight upload in `bucket` matching both filters.
    /// An absent filter matches everything, so calling this with no
    /// filters aborts every upload in the bucket.  Only a failed listing
    /// is an error; individual abort failures land in
    /// [`BulkAbort::failed`].
    fn abort_matching<'a>(
        &'a self,
        bucket: &'a str,
        key_filter: Option<&'a str>,
        upload_id_filter: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BulkAbort>> + Send + 'a>> {
        Box::pin(async move {
            let uploads = self.list_in_flight(bucket).await?;
            tracing::debug!(bucket, in_flight = uploads.len(), "abort_matching: listed uploads");

            let mut outcome = BulkAbort::default();
            for upload in uploads {
                if !filter_matches(upload_id_filter, &upload.upload_id)
                    || !filter_matches(key_filter, &upload.key)
                {
                    continue;
                }
                match self.abort_one(bucket, &upload.key, &upload.upload_id).await {
                    Ok(aborted) => outcome.aborted.push(aborted),
                    Err(e) => {
                        tracing::warn!(
                            bucket,
                            key = %upload.key,
                            upload_id = %upload.upload_id,
                            error = %format!("{e:#}"),
                            "abort_matching: abort failed"
                        );
                        outcome.failed.push((upload, e));
                    }
                }
            }
            Ok(outcome)
        })
    }
}

/// Reject part numbers that are not positive, and in strict mode those
/// above [`MAX_PART_NUMBER`].
pub fn check_part_number(part_number: u32, strict: bool) -> Result<(), UploadError> {
    if part_number == 0 {
        return Err(UploadError::InvalidArgument {
            message: "Part number must be a positive integer".to_string(),
        });
    }
    if strict && part_number > MAX_PART_NUMBER {
        return Err(UploadError::InvalidArgument {
            message: format!(
                "Part number must be between 1 and {MAX_PART_NUMBER}, got {part_number}"
            ),
        });
    }
    Ok(())
}

/// Strict-mode size check.  Only a part known not to be the last one
/// (`has_later_part`) must meet [`MIN_PART_SIZE`]; the remote store
/// remains the authority at completion time.
pub fn check_part_size(
    part_number: u32,
    size: u64,
    has_later_part: bool,
) -> Result<(), UploadError> {
    if has_later_part && size < MIN_PART_SIZE {
        return Err(UploadError::EntityTooSmall {
            part_number,
            size,
            minimum: MIN_PART_SIZE,
        });
    }
    Ok(())
}
