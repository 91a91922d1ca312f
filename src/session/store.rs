//! Abstract session store trait.
//!
//! The session store is the single source of truth for in-flight
//! multipart uploads: which object key each upload ID was opened for,
//! and which parts (with their integrity tags) have been received.
//! The coordinator never caches these records between calls.
//!
//! Like the other trait seams in this crate, methods are desugared by
//! hand into pinned boxed futures so implementations can be used as
//! `Arc<dyn SessionStore>`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::errors::UploadError;

/// Session record for one in-flight multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Upload identifier issued by the remote store (primary key).
    pub upload_id: String,
    /// Bucket the upload targets.
    pub bucket: String,
    /// Normalized object key; immutable for the life of the session.
    pub object_key: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

/// A part recorded against a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Part number (1-based).
    pub part_number: u32,
    /// Integrity tag (ETag) returned by the remote store, verbatim.
    pub etag: String,
    /// Size of the part payload in bytes.
    pub size: u64,
    /// ISO-8601 timestamp of the most recent upload of this part.
    pub uploaded_at: String,
}

/// Async session store contract.
///
/// Each call is independently atomic; there is no cross-call
/// transaction.  `put_part` is an upsert so that retried part uploads
/// are safe.
pub trait SessionStore: Send + Sync + 'static {
    /// Register a new session.  Fails if `upload_id` is already present.
    fn create_session(
        &self,
        record: SessionRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Look up a session by upload ID.
    fn get_session(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<SessionRecord>>> + Send + '_>>;

    /// Record (insert or replace) a part for a session.
    fn put_part(
        &self,
        upload_id: &str,
        part: PartRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List the parts of a session in ascending part-number order.
    fn list_parts(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PartRecord>>> + Send + '_>>;

    /// Delete a session and all of its parts.  Returns `true` if a
    /// session was removed.
    fn delete_session(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// List every session, ordered by upload ID.
    fn list_sessions(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<SessionRecord>>> + Send + '_>>;
}

/// Open a session and check it was created for `object_key`.
///
/// Distinguishes a missing session ([`UploadError::SessionNotFound`])
/// from one opened for another key ([`UploadError::SessionKeyMismatch`]).
/// Store failures surface as [`UploadError::SessionStore`].
pub async fn open_session(
    store: &dyn SessionStore,
    upload_id: &str,
    object_key: &str,
) -> Result<SessionRecord, UploadError> {
    let record = store
        .get_session(upload_id)
        .await
        .map_err(UploadError::SessionStore)?
        .ok_or_else(|| UploadError::SessionNotFound {
            upload_id: upload_id.to_string(),
        })?;

    if record.object_key != object_key {
        return Err(UploadError::SessionKeyMismatch {
            upload_id: upload_id.to_string(),
            key: object_key.to_string(),
        });
    }

    Ok(record)
}

/// Current time as an ISO-8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}
