//! Multipart upload session coordinator.
//!
//! Drives each upload through initiate, upload part, then complete or
//! abort.  Every call re-reads the session from the [`SessionStore`];
//! nothing is cached between calls, so any number of coordinator
//! instances may share one store.  Byte transfer and lifecycle changes
//! are delegated to the [`UploadGateway`].
//!
//! Errors are classified by the collaborator that produced them: a
//! gateway failure is [`UploadError::RemoteStore`], a store failure
//! before any remote call is [`UploadError::SessionStore`], and a store
//! failure after the remote store already changed state is
//! [`UploadError::LocalBookkeeping`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, info};

use crate::errors::UploadError;
use crate::gateway::backend::{
    check_part_number, check_part_size, AbortedUpload, BulkAbort, CompletedPart,
    CompletedUpload, PartPayload, UploadGateway,
};
use crate::metrics::{record_operation, ORPHANED_UPLOADS_TOTAL, PART_BYTES_RECEIVED_TOTAL};
use crate::session::store::{now_iso8601, open_session, PartRecord, SessionRecord, SessionStore};

/// Default per-call timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// A freshly initiated upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
}

/// A part accepted by the remote store and recorded locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub bucket: String,
    pub upload_id: String,
    pub key: String,
    pub part: CompletedPart,
    pub size: u64,
}

/// Parts recorded so far for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartListing {
    pub bucket: String,
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<PartRecord>,
}

fn status_label<T>(result: &Result<T, UploadError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

/// The upload state machine.  Cheap to share behind an `Arc`.
pub struct UploadCoordinator {
    sessions: Arc<dyn SessionStore>,
    gateway: Arc<dyn UploadGateway>,
    bucket: String,
    strict: bool,
    operation_timeout: Duration,
    compensate_orphans: bool,
}

impl UploadCoordinator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        gateway: Arc<dyn UploadGateway>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            gateway,
            bucket: bucket.into(),
            strict: false,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            compensate_orphans: true,
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_compensate_orphans(mut self, compensate: bool) -> Self {
        self.compensate_orphans = compensate;
        self
    }

    /// Bucket every upload targets.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    // -- Bounded collaborator calls ------------------------------------------

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "{what} timed out after {:?}",
                self.operation_timeout
            )),
        }
    }

    async fn remote<T>(
        &self,
        what: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, UploadError> {
        self.bounded(what, fut).await.map_err(UploadError::RemoteStore)
    }

    async fn open(&self, upload_id: &str, key: &str) -> Result<SessionRecord, UploadError> {
        match tokio::time::timeout(
            self.operation_timeout,
            open_session(self.sessions.as_ref(), upload_id, key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UploadError::SessionStore(anyhow::anyhow!(
                "session lookup timed out after {:?}",
                self.operation_timeout
            ))),
        }
    }

    fn bookkeeping_failed(
        &self,
        upload_id: &str,
        operation: &'static str,
        source: anyhow::Error,
    ) -> UploadError {
        error!(
            target: "partkeeper::orphan",
            orphaned = false,
            upload_id,
            operation,
            error = %format!("{source:#}"),
            "remote store changed state but the session store was not updated"
        );
        UploadError::LocalBookkeeping {
            upload_id: upload_id.to_string(),
            operation,
            source,
        }
    }

    /// Check that `upload_id` has a session opened for `key`, without
    /// touching the remote store.  Lets callers fail fast before
    /// preparing a payload; every operation still validates on its own.
    pub async fn check_session(&self, key: &str, upload_id: &str) -> Result<(), UploadError> {
        self.open(upload_id, key).await.map(|_| ())
    }

    // -- Initiate ------------------------------------------------------------

    /// Start a multipart upload for a normalized `key` and register its
    /// session.
    pub async fn initiate(&self, key: &str) -> Result<InitiatedUpload, UploadError> {
        let result = self.initiate_inner(key).await;
        record_operation("initiate", status_label(&result));
        result
    }

    async fn initiate_inner(&self, key: &str) -> Result<InitiatedUpload, UploadError> {
        let upload_id = self
            .remote("initiate", self.gateway.initiate(&self.bucket, key))
            .await?;
        if upload_id.is_empty() {
            return Err(UploadError::RemoteStore(anyhow::anyhow!(
                "remote store returned an empty upload id"
            )));
        }

        let record = SessionRecord {
            upload_id: upload_id.clone(),
            bucket: self.bucket.clone(),
            object_key: key.to_string(),
            created_at: now_iso8601(),
        };
        if let Err(e) = self
            .bounded("create_session", self.sessions.create_session(record))
            .await
        {
            return Err(self.orphaned(&upload_id, key, e).await);
        }

        info!(upload_id = %upload_id, key, bucket = %self.bucket, "multipart upload initiated");
        Ok(InitiatedUpload {
            upload_id,
            bucket: self.bucket.clone(),
            key: key.to_string(),
        })
    }

    /// The remote upload exists but its session could not be recorded.
    /// Optionally abort it remotely, then report the inconsistency.
    async fn orphaned(&self, upload_id: &str, key: &str, cause: anyhow::Error) -> UploadError {
        let (compensated, source) = if self.compensate_orphans {
            match self
                .bounded(
                    "compensating abort",
                    self.gateway.abort_one(&self.bucket, key, upload_id),
                )
                .await
            {
                Ok(_) => (true, cause.context("remote upload was aborted")),
                Err(abort_err) => (
                    false,
                    cause.context(format!(
                        "compensating abort failed ({abort_err:#}); remote upload is orphaned"
                    )),
                ),
            }
        } else {
            (false, cause.context("remote upload is orphaned"))
        };

        counter!(
            ORPHANED_UPLOADS_TOTAL,
            "compensated" => if compensated { "true" } else { "false" }
        )
        .increment(1);
        error!(
            target: "partkeeper::orphan",
            orphaned = true,
            compensated,
            upload_id,
            key,
            bucket = %self.bucket,
            error = %format!("{source:#}"),
            "multipart upload created remotely but its session could not be recorded"
        );

        UploadError::LocalBookkeeping {
            upload_id: upload_id.to_string(),
            operation: "initiate",
            source,
        }
    }

    // -- Upload part ---------------------------------------------------------

    /// Transfer one part and record its tag.  Retrying the same part
    /// number replaces the previously recorded tag.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        payload: PartPayload,
    ) -> Result<UploadedPart, UploadError> {
        let result = self
            .upload_part_inner(key, upload_id, part_number, payload)
            .await;
        record_operation("upload_part", status_label(&result));
        result
    }

    async fn upload_part_inner(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        payload: PartPayload,
    ) -> Result<UploadedPart, UploadError> {
        check_part_number(part_number, self.strict)?;
        self.open(upload_id, key).await?;

        let size = payload.len();
        if self.strict {
            let recorded = self
                .bounded("list_parts", self.sessions.list_parts(upload_id))
                .await
                .map_err(UploadError::SessionStore)?;
            let has_later_part = recorded.iter().any(|p| p.part_number > part_number);
            check_part_size(part_number, size, has_later_part)?;
        }

        debug!(upload_id, key, part_number, size, "forwarding part");
        let etag = self
            .remote(
                "upload_part",
                self.gateway
                    .upload_part(&self.bucket, key, upload_id, part_number, payload),
            )
            .await?;

        let record = PartRecord {
            part_number,
            etag: etag.clone(),
            size,
            uploaded_at: now_iso8601(),
        };
        if let Err(e) = self
            .bounded("put_part", self.sessions.put_part(upload_id, record))
            .await
        {
            return Err(self.bookkeeping_failed(upload_id, "upload_part", e));
        }

        counter!(PART_BYTES_RECEIVED_TOTAL).increment(size);
        debug!(upload_id, key, part_number, etag = %etag, "part recorded");
        Ok(UploadedPart {
            bucket: self.bucket.clone(),
            upload_id: upload_id.to_string(),
            key: key.to_string(),
            part: CompletedPart { part_number, etag },
            size,
        })
    }

    // -- Complete ------------------------------------------------------------

    /// Forward `parts` verbatim to the remote store and, on success,
    /// delete the session.  The parts are not checked against the
    /// recorded ones; the remote store rejects any mismatch.
    pub async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, UploadError> {
        let result = self.complete_inner(key, upload_id, parts).await;
        record_operation("complete", status_label(&result));
        result
    }

    async fn complete_inner(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, UploadError> {
        self.open(upload_id, key).await?;

        let completed = self
            .remote(
                "complete",
                self.gateway.complete(&self.bucket, key, upload_id, parts),
            )
            .await?;

        if let Err(e) = self
            .bounded("delete_session", self.sessions.delete_session(upload_id))
            .await
        {
            return Err(self.bookkeeping_failed(upload_id, "complete", e));
        }

        info!(upload_id, key, parts = parts.len(), "multipart upload completed");
        Ok(completed)
    }

    // -- Abort ---------------------------------------------------------------

    /// Abort uploads and delete their sessions.
    ///
    /// With both `key` and `upload_id`, aborts that one session after
    /// validating it.  Otherwise every in-flight upload in the bucket
    /// matching the given filters is aborted; with no filters at all,
    /// that is every upload in the bucket.  If the store refuses some of
    /// them, the rest are still aborted and their sessions deleted, and
    /// the result is [`UploadError::PartialAbort`].
    pub async fn abort(
        &self,
        key: Option<&str>,
        upload_id: Option<&str>,
    ) -> Result<Vec<AbortedUpload>, UploadError> {
        let result = match (key, upload_id) {
            (Some(key), Some(upload_id)) => self.abort_one(key, upload_id).await.map(|a| vec![a]),
            _ => self.abort_matching(key, upload_id).await,
        };
        record_operation("abort", status_label(&result));
        result
    }

    async fn abort_one(&self, key: &str, upload_id: &str) -> Result<AbortedUpload, UploadError> {
        self.open(upload_id, key).await?;

        let aborted = self
            .remote(
                "abort",
                self.gateway.abort_one(&self.bucket, key, upload_id),
            )
            .await?;

        if let Err(e) = self
            .bounded("delete_session", self.sessions.delete_session(upload_id))
            .await
        {
            return Err(self.bookkeeping_failed(upload_id, "abort", e));
        }

        info!(upload_id, key, "multipart upload aborted");
        Ok(aborted)
    }

    async fn abort_matching(
        &self,
        key: Option<&str>,
        upload_id: Option<&str>,
    ) -> Result<Vec<AbortedUpload>, UploadError> {
        let BulkAbort { aborted, failed } = self
            .remote(
                "abort_matching",
                self.gateway.abort_matching(&self.bucket, key, upload_id),
            )
            .await?;

        // Sessions unknown locally (created elsewhere, or already gone)
        // are skipped.  Every deletion is attempted before reporting, and
        // only for uploads the store actually aborted.
        let mut first_failure = None;
        for upload in &aborted {
            match self
                .bounded(
                    "delete_session",
                    self.sessions.delete_session(&upload.upload_id),
                )
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    let err = self.bookkeeping_failed(&upload.upload_id, "abort", e);
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        if !failed.is_empty() {
            let detail = failed
                .iter()
                .map(|(upload, e)| format!("{} ({}): {e:#}", upload.key, upload.upload_id))
                .collect::<Vec<_>>()
                .join("; ");
            info!(
                bucket = %self.bucket,
                aborted = aborted.len(),
                failed = failed.len(),
                "bulk abort finished with failures"
            );
            return Err(UploadError::PartialAbort {
                aborted,
                failed: failed.len(),
                source: anyhow::anyhow!(detail),
            });
        }

        info!(
            bucket = %self.bucket,
            key_filter = key.unwrap_or("*"),
            upload_id_filter = upload_id.unwrap_or("*"),
            aborted = aborted.len(),
            "bulk abort finished"
        );
        Ok(aborted)
    }

    // -- List parts ----------------------------------------------------------

    /// Parts recorded for a session, ascending by part number.
    pub async fn list_parts(&self, key: &str, upload_id: &str) -> Result<PartListing, UploadError> {
        let result = self.list_parts_inner(key, upload_id).await;
        record_operation("list_parts", status_label(&result));
        result
    }

    async fn list_parts_inner(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<PartListing, UploadError> {
        self.open(upload_id, key).await?;
        let parts = self
            .bounded("list_parts", self.sessions.list_parts(upload_id))
            .await
            .map_err(UploadError::SessionStore)?;
        Ok(PartListing {
            bucket: self.bucket.clone(),
            upload_id: upload_id.to_string(),
            key: key.to_string(),
            parts,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gateway::backend::{UploadSummary, MIN_PART_SIZE};
    use crate::gateway::memory::MemoryUploadGateway;
    use crate::session::memory::MemorySessionStore;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type BoxFut<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

    /// Gateway wrapper that counts calls and can be told to fail aborts.
    pub(crate) struct CountingGateway {
        pub inner: MemoryUploadGateway,
        pub calls: AtomicUsize,
        pub fail_abort: AtomicBool,
        pub fail_abort_key: std::sync::Mutex<Option<String>>,
    }

    impl CountingGateway {
        pub fn new(inner: MemoryUploadGateway) -> Self {
            Self {
                inner,
                calls: AtomicUsize::new(0),
                fail_abort: AtomicBool::new(false),
                fail_abort_key: std::sync::Mutex::new(None),
            }
        }

        pub fn fail_abort_for(&self, key: &str) {
            *self.fail_abort_key.lock().unwrap() = Some(key.to_string());
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn tick(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl UploadGateway for CountingGateway {
        fn initiate(&self, bucket: &str, key: &str) -> BoxFut<'_, String> {
            self.tick();
            self.inner.initiate(bucket, key)
        }

        fn upload_part(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            part_number: u32,
            payload: PartPayload,
        ) -> BoxFut<'_, String> {
            self.tick();
            self.inner
                .upload_part(bucket, key, upload_id, part_number, payload)
        }

        fn complete(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> BoxFut<'_, CompletedUpload> {
            self.tick();
            self.inner.complete(bucket, key, upload_id, parts)
        }

        fn abort_one(&self, bucket: &str, key: &str, upload_id: &str) -> BoxFut<'_, AbortedUpload> {
            self.tick();
            let refused = self.fail_abort_key.lock().unwrap().as_deref() == Some(key);
            if refused || self.fail_abort.load(Ordering::SeqCst) {
                return Box::pin(async { Err(anyhow::anyhow!("AccessDenied")) });
            }
            self.inner.abort_one(bucket, key, upload_id)
        }

        fn list_in_flight(&self, bucket: &str) -> BoxFut<'_, Vec<UploadSummary>> {
            self.tick();
            self.inner.list_in_flight(bucket)
        }
    }

    /// Session store that can be made to fail selected operations.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub inner: MemorySessionStore,
        pub fail_create: AtomicBool,
        pub fail_get: AtomicBool,
        pub fail_put: AtomicBool,
        pub fail_delete: AtomicBool,
    }

    fn unavailable<'a, T: Send + 'a>() -> BoxFut<'a, T> {
        Box::pin(async { Err(anyhow::anyhow!("connection refused")) })
    }

    impl SessionStore for FlakyStore {
        fn create_session(&self, record: SessionRecord) -> BoxFut<'_, ()> {
            if self.fail_create.load(Ordering::SeqCst) {
                return unavailable();
            }
            self.inner.create_session(record)
        }

        fn get_session(&self, upload_id: &str) -> BoxFut<'_, Option<SessionRecord>> {
            if self.fail_get.load(Ordering::SeqCst) {
                return unavailable();
            }
            self.inner.get_session(upload_id)
        }

        fn put_part(&self, upload_id: &str, part: PartRecord) -> BoxFut<'_, ()> {
            if self.fail_put.load(Ordering::SeqCst) {
                return unavailable();
            }
            self.inner.put_part(upload_id, part)
        }

        fn list_parts(&self, upload_id: &str) -> BoxFut<'_, Vec<PartRecord>> {
            self.inner.list_parts(upload_id)
        }

        fn delete_session(&self, upload_id: &str) -> BoxFut<'_, bool> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return unavailable();
            }
            self.inner.delete_session(upload_id)
        }

        fn list_sessions(&self) -> BoxFut<'_, Vec<SessionRecord>> {
            self.inner.list_sessions()
        }
    }

    fn stall<'a, T: Send + 'a>() -> BoxFut<'a, T> {
        Box::pin(std::future::pending::<anyhow::Result<T>>())
    }

    /// Gateway whose calls never finish.
    struct StalledGateway;

    impl UploadGateway for StalledGateway {
        fn initiate(&self, _: &str, _: &str) -> BoxFut<'_, String> {
            stall()
        }

        fn upload_part(&self, _: &str, _: &str, _: &str, _: u32, _: PartPayload) -> BoxFut<'_, String> {
            stall()
        }

        fn complete(&self, _: &str, _: &str, _: &str, _: &[CompletedPart]) -> BoxFut<'_, CompletedUpload> {
            stall()
        }

        fn abort_one(&self, _: &str, _: &str, _: &str) -> BoxFut<'_, AbortedUpload> {
            stall()
        }

        fn list_in_flight(&self, _: &str) -> BoxFut<'_, Vec<UploadSummary>> {
            stall()
        }
    }

    struct Harness {
        coordinator: UploadCoordinator,
        gateway: Arc<CountingGateway>,
        store: Arc<FlakyStore>,
    }

    fn harness() -> Harness {
        harness_with(MemoryUploadGateway::new(), |c| c)
    }

    fn harness_with(
        gateway: MemoryUploadGateway,
        configure: impl FnOnce(UploadCoordinator) -> UploadCoordinator,
    ) -> Harness {
        let gateway = Arc::new(CountingGateway::new(gateway));
        let store = Arc::new(FlakyStore::default());
        let coordinator = configure(UploadCoordinator::new(
            store.clone(),
            gateway.clone(),
            "uploads",
        ));
        Harness {
            coordinator,
            gateway,
            store,
        }
    }

    fn bytes(len: usize) -> PartPayload {
        PartPayload::Bytes(Bytes::from(vec![b'x'; len]))
    }

    #[tokio::test]
    async fn test_full_upload_scenario() {
        let h = harness();
        let c = &h.coordinator;

        let init = c.initiate("a/b.txt").await.unwrap();
        assert_eq!(init.bucket, "uploads");
        assert_eq!(init.key, "a/b.txt");
        let id = init.upload_id;

        let p1 = c
            .upload_part("a/b.txt", &id, 1, bytes(MIN_PART_SIZE as usize))
            .await
            .unwrap();
        let p2 = c
            .upload_part("a/b.txt", &id, 2, bytes(1024 * 1024))
            .await
            .unwrap();
        assert_eq!(p1.part.part_number, 1);
        assert_eq!(p2.size, 1024 * 1024);

        let listing = c.list_parts("a/b.txt", &id).await.unwrap();
        assert_eq!(listing.parts.len(), 2);

        let done = c
            .complete("a/b.txt", &id, &[p1.part, p2.part])
            .await
            .unwrap();
        assert_eq!(done.key, "a/b.txt");

        // Completion frees the identifier.
        let err = c.list_parts("a/b.txt", &id).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound { .. }));
        assert!(h.store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_upload_fails_before_remote_call() {
        let h = harness();
        let err = h
            .coordinator
            .upload_part("k", "missing", 1, bytes(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "UploadId missing could not be found");
        assert_eq!(h.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_key_mismatch_fails_before_remote_call() {
        let h = harness();
        let c = &h.coordinator;
        let id = c.initiate("right").await.unwrap().upload_id;
        let calls = h.gateway.calls();

        let err = c.upload_part("wrong", &id, 1, bytes(1)).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionKeyMismatch { .. }));
        assert_eq!(err.to_string(), format!("UploadId {id} does not match file wrong"));

        let err = c.complete("wrong", &id, &[]).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionKeyMismatch { .. }));

        let err = c.abort(Some("wrong"), Some(&id)).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionKeyMismatch { .. }));

        assert_eq!(h.gateway.calls(), calls);
    }

    #[tokio::test]
    async fn test_check_session() {
        let h = harness();
        let c = &h.coordinator;
        let id = c.initiate("k").await.unwrap().upload_id;
        let calls = h.gateway.calls();

        c.check_session("k", &id).await.unwrap();
        assert!(matches!(
            c.check_session("other", &id).await.unwrap_err(),
            UploadError::SessionKeyMismatch { .. }
        ));
        assert!(matches!(
            c.check_session("k", "missing").await.unwrap_err(),
            UploadError::SessionNotFound { .. }
        ));
        assert_eq!(h.gateway.calls(), calls);
    }

    #[tokio::test]
    async fn test_retried_part_replaces_tag() {
        let h = harness();
        let c = &h.coordinator;
        let id = c.initiate("k").await.unwrap().upload_id;
        c.upload_part("k", &id, 1, PartPayload::Bytes(Bytes::from_static(b"first")))
            .await
            .unwrap();
        let retry = c
            .upload_part("k", &id, 1, PartPayload::Bytes(Bytes::from_static(b"second")))
            .await
            .unwrap();

        let listing = c.list_parts("k", &id).await.unwrap();
        assert_eq!(listing.parts.len(), 1);
        assert_eq!(listing.parts[0].etag, retry.part.etag);
        assert_eq!(listing.parts[0].size, 6);
    }

    #[tokio::test]
    async fn test_complete_remote_rejection_keeps_session() {
        let h = harness();
        let c = &h.coordinator;
        let id = c.initiate("k").await.unwrap().upload_id;
        c.upload_part("k", &id, 1, bytes(10)).await.unwrap();

        let bogus = CompletedPart {
            part_number: 1,
            etag: "\"00000000000000000000000000000000\"".to_string(),
        };
        let err = c.complete("k", &id, &[bogus]).await.unwrap_err();
        assert!(matches!(err, UploadError::RemoteStore(_)));
        assert!(err.to_string().contains("InvalidPart"));
        // Still open for a corrected completion.
        assert!(c.list_parts("k", &id).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_single_session() {
        let h = harness();
        let c = &h.coordinator;
        let id = c.initiate("k").await.unwrap().upload_id;
        let other = c.initiate("k").await.unwrap().upload_id;

        let aborted = c.abort(Some("k"), Some(&id)).await.unwrap();
        assert_eq!(aborted, vec![AbortedUpload { key: "k".into(), upload_id: id.clone() }]);
        assert!(c.list_parts("k", &id).await.is_err());
        assert!(c.list_parts("k", &other).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_by_upload_id_only_ignores_key() {
        let h = harness();
        let c = &h.coordinator;
        let u1 = c.initiate("first").await.unwrap().upload_id;
        let u2 = c.initiate("second").await.unwrap().upload_id;

        let aborted = c.abort(None, Some(&u1)).await.unwrap();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].upload_id, u1);
        assert_eq!(aborted[0].key, "first");

        assert!(matches!(
            c.list_parts("first", &u1).await.unwrap_err(),
            UploadError::SessionNotFound { .. }
        ));
        assert!(c.list_parts("second", &u2).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_without_filters_aborts_everything() {
        let h = harness();
        let c = &h.coordinator;
        c.initiate("a").await.unwrap();
        c.initiate("b").await.unwrap();
        // Upload unknown to the local store; aborted remotely, skipped locally.
        h.gateway.inner.initiate("uploads", "c").await.unwrap();

        let aborted = c.abort(None, None).await.unwrap();
        assert_eq!(aborted.len(), 3);
        assert_eq!(h.gateway.inner.in_flight_count().await, 0);
        assert!(h.store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_abort_by_key_filter() {
        let h = harness();
        let c = &h.coordinator;
        c.initiate("a").await.unwrap();
        c.initiate("a").await.unwrap();
        let keep = c.initiate("b").await.unwrap().upload_id;

        let aborted = c.abort(Some("a"), None).await.unwrap();
        assert_eq!(aborted.len(), 2);
        assert!(aborted.iter().all(|a| a.key == "a"));
        assert_eq!(h.store.inner.len(), 1);
        assert!(c.list_parts("b", &keep).await.is_ok());
    }

    #[tokio::test]
    async fn test_bulk_abort_keeps_going_past_refused_upload() {
        let h = harness();
        let c = &h.coordinator;
        for key in ["a1", "a2", "a3"] {
            c.initiate(key).await.unwrap();
        }
        let stuck = c.initiate("zzz").await.unwrap().upload_id;
        h.gateway.fail_abort_for("zzz");

        let err = c.abort(None, None).await.unwrap_err();
        match &err {
            UploadError::PartialAbort { aborted, failed, .. } => {
                assert_eq!(*failed, 1);
                let mut keys: Vec<_> = aborted.iter().map(|a| a.key.as_str()).collect();
                keys.sort();
                assert_eq!(keys, ["a1", "a2", "a3"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("zzz"));
        assert!(err.to_string().contains("AccessDenied"));

        // Only the refused upload is still tracked, locally and remotely.
        assert_eq!(h.gateway.inner.in_flight_count().await, 1);
        assert_eq!(h.store.inner.len(), 1);
        assert!(c.list_parts("zzz", &stuck).await.is_ok());
    }

    #[tokio::test]
    async fn test_initiate_store_failure_is_compensated() {
        let h = harness();
        h.store.fail_create.store(true, Ordering::SeqCst);

        let err = h.coordinator.initiate("k").await.unwrap_err();
        match &err {
            UploadError::LocalBookkeeping { operation, .. } => assert_eq!(*operation, "initiate"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("remote upload was aborted"));
        assert_eq!(h.gateway.inner.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_initiate_store_failure_without_compensation() {
        let h = harness_with(MemoryUploadGateway::new(), |c| c.with_compensate_orphans(false));
        h.store.fail_create.store(true, Ordering::SeqCst);

        let err = h.coordinator.initiate("k").await.unwrap_err();
        assert!(matches!(err, UploadError::LocalBookkeeping { .. }));
        assert!(err.to_string().contains("orphaned"));
        assert_eq!(h.gateway.inner.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn test_initiate_failed_compensation_is_reported() {
        let h = harness();
        h.store.fail_create.store(true, Ordering::SeqCst);
        h.gateway.fail_abort.store(true, Ordering::SeqCst);

        let err = h.coordinator.initiate("k").await.unwrap_err();
        assert!(matches!(err, UploadError::LocalBookkeeping { .. }));
        assert!(err.to_string().contains("compensating abort failed"));
        assert_eq!(h.gateway.inner.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_unavailable_before_remote_call() {
        let h = harness();
        let id = h.coordinator.initiate("k").await.unwrap().upload_id;
        h.store.fail_get.store(true, Ordering::SeqCst);
        let calls = h.gateway.calls();

        let err = h
            .coordinator
            .upload_part("k", &id, 1, bytes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionStore(_)));
        assert_eq!(h.gateway.calls(), calls);
    }

    #[tokio::test]
    async fn test_part_recorded_remotely_but_not_locally() {
        let h = harness();
        let id = h.coordinator.initiate("k").await.unwrap().upload_id;
        h.store.fail_put.store(true, Ordering::SeqCst);

        let err = h
            .coordinator
            .upload_part("k", &id, 1, bytes(1))
            .await
            .unwrap_err();
        match err {
            UploadError::LocalBookkeeping { operation, upload_id, .. } => {
                assert_eq!(operation, "upload_part");
                assert_eq!(upload_id, id);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_delete_failure_is_bookkeeping_error() {
        let h = harness_with(MemoryUploadGateway::new().with_min_part_size(0), |c| c);
        let id = h.coordinator.initiate("k").await.unwrap().upload_id;
        let part = h.coordinator.upload_part("k", &id, 1, bytes(3)).await.unwrap();
        h.store.fail_delete.store(true, Ordering::SeqCst);

        let err = h
            .coordinator
            .complete("k", &id, &[part.part])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::LocalBookkeeping { operation: "complete", .. }));
        assert!(h.gateway.inner.object("uploads", "k").await.is_some());
    }

    #[tokio::test]
    async fn test_strict_mode_limits() {
        let h = harness_with(MemoryUploadGateway::new(), |c| c.with_strict(true));
        let c = &h.coordinator;
        let id = c.initiate("k").await.unwrap().upload_id;
        let calls = h.gateway.calls();

        let err = c.upload_part("k", &id, 10_001, bytes(1)).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument { .. }));
        assert_eq!(h.gateway.calls(), calls);

        // Part 2 first: it might be the last part, so a small body is fine.
        c.upload_part("k", &id, 2, bytes(10)).await.unwrap();
        // Part 1 now precedes a recorded part and must meet the minimum.
        let err = c.upload_part("k", &id, 1, bytes(10)).await.unwrap_err();
        assert!(matches!(err, UploadError::EntityTooSmall { part_number: 1, .. }));
    }

    #[tokio::test]
    async fn test_lenient_mode_defers_to_remote() {
        let h = harness();
        let c = &h.coordinator;
        let id = c.initiate("k").await.unwrap().upload_id;
        c.upload_part("k", &id, 10_001, bytes(1)).await.unwrap();
        assert!(matches!(
            c.upload_part("k", &id, 0, bytes(1)).await.unwrap_err(),
            UploadError::InvalidArgument { .. }
        ));
    }

    #[tokio::test]
    async fn test_remote_timeout_is_remote_error() {
        let store = Arc::new(MemorySessionStore::new());
        let coordinator = UploadCoordinator::new(store.clone(), Arc::new(StalledGateway), "b")
            .with_operation_timeout(Duration::from_millis(50));

        let err = coordinator.initiate("k").await.unwrap_err();
        assert!(matches!(err, UploadError::RemoteStore(_)));
        assert!(err.to_string().contains("timed out"));
        assert!(store.is_empty());
    }
}
