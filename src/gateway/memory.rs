//! In-memory gateway backend.
//!
//! Emulates an S3-compatible store's multipart behaviour entirely in
//! memory: upload IDs, part ETags, completion validation and abort.
//! Used for local development (`s3.backend: memory`) and by the
//! coordinator and router tests.

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;

use super::backend::{
    AbortedUpload, CompletedPart, CompletedUpload, PartPayload, UploadGateway, UploadSummary,
    MIN_PART_SIZE,
};

#[derive(Debug)]
struct InFlight {
    bucket: String,
    key: String,
    /// part_number -> (data, quoted etag)
    parts: BTreeMap<u32, (Bytes, String)>,
}

/// A completed object held by the fake store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
}

/// Gateway backend that keeps uploads and assembled objects in memory.
pub struct MemoryUploadGateway {
    uploads: tokio::sync::RwLock<HashMap<String, InFlight>>,
    /// (bucket, key) -> object
    objects: tokio::sync::RwLock<HashMap<(String, String), StoredObject>>,
    min_part_size: u64,
}

impl Default for MemoryUploadGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUploadGateway {
    pub fn new() -> Self {
        Self {
            uploads: tokio::sync::RwLock::new(HashMap::new()),
            objects: tokio::sync::RwLock::new(HashMap::new()),
            min_part_size: MIN_PART_SIZE,
        }
    }

    /// Override the minimum size enforced on non-final parts at
    /// completion.
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    /// Fetch an assembled object.
    pub async fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of uploads still in flight across all buckets.
    pub async fn in_flight_count(&self) -> usize {
        self.uploads.read().await.len()
    }
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

/// Composite ETag of a multipart object: MD5 of the concatenated binary
/// part digests, suffixed with the part count.
fn composite_etag(part_etags: &[&str]) -> anyhow::Result<String> {
    let mut combined = Vec::with_capacity(part_etags.len() * 16);
    for etag in part_etags {
        combined.extend_from_slice(&hex::decode(etag.trim_matches('"'))?);
    }
    Ok(format!(
        "\"{}-{}\"",
        hex::encode(Md5::digest(&combined)),
        part_etags.len()
    ))
}

impl UploadGateway for MemoryUploadGateway {
    fn initiate(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let upload_id = uuid::Uuid::new_v4().simple().to_string();
            self.uploads.write().await.insert(
                upload_id.clone(),
                InFlight {
                    bucket,
                    key,
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        payload: PartPayload,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let data = payload.read_all().await?;
            let etag = quoted_md5(&data);

            let mut uploads = self.uploads.write().await;
            let upload = uploads
                .get_mut(&upload_id)
                .filter(|u| u.bucket == bucket && u.key == key)
                .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {upload_id}"))?;
            upload.parts.insert(part_number, (data, etag.clone()));
            Ok(etag)
        })
    }

    fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompletedUpload>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let mut uploads = self.uploads.write().await;
            let upload = uploads
                .get(&upload_id)
                .filter(|u| u.bucket == bucket && u.key == key)
                .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {upload_id}"))?;

            if parts.is_empty() {
                anyhow::bail!("MalformedXML: at least one part must be specified");
            }

            let mut assembled = BytesMut::new();
            let mut etags = Vec::with_capacity(parts.len());
            let mut previous = 0u32;
            for (i, requested) in parts.iter().enumerate() {
                if requested.part_number <= previous {
                    anyhow::bail!("InvalidPartOrder: part numbers must be strictly ascending");
                }
                previous = requested.part_number;

                let (data, etag) = upload.parts.get(&requested.part_number).ok_or_else(|| {
                    anyhow::anyhow!("InvalidPart: part {} was not uploaded", requested.part_number)
                })?;
                if etag.trim_matches('"') != requested.etag.trim_matches('"') {
                    anyhow::bail!(
                        "InvalidPart: ETag mismatch for part {}",
                        requested.part_number
                    );
                }
                let is_last = i + 1 == parts.len();
                if !is_last && (data.len() as u64) < self.min_part_size {
                    anyhow::bail!(
                        "EntityTooSmall: part {} is {} bytes, minimum is {}",
                        requested.part_number,
                        data.len(),
                        self.min_part_size
                    );
                }
                assembled.extend_from_slice(data);
                etags.push(etag.as_str());
            }

            let etag = composite_etag(&etags)?;
            let data = assembled.freeze();
            uploads.remove(&upload_id);
            drop(uploads);

            self.objects.write().await.insert(
                (bucket.clone(), key.clone()),
                StoredObject {
                    data,
                    etag: etag.clone(),
                },
            );

            Ok(CompletedUpload {
                location: Some(format!("/{bucket}/{key}")),
                bucket,
                key,
                etag: Some(etag),
            })
        })
    }

    fn abort_one(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AbortedUpload>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut uploads = self.uploads.write().await;
            let matches = uploads
                .get(&upload_id)
                .is_some_and(|u| u.bucket == bucket && u.key == key);
            if !matches {
                anyhow::bail!("NoSuchUpload: {upload_id}");
            }
            uploads.remove(&upload_id);
            Ok(AbortedUpload { key, upload_id })
        })
    }

    fn list_in_flight(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSummary>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let uploads = self.uploads.read().await;
            let mut listed: Vec<UploadSummary> = uploads
                .iter()
                .filter(|(_, u)| u.bucket == bucket)
                .map(|(id, u)| UploadSummary {
                    key: u.key.clone(),
                    upload_id: id.clone(),
                })
                .collect();
            listed.sort_by(|a, b| a.key.cmp(&b.key).then(a.upload_id.cmp(&b.upload_id)));
            Ok(listed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32, etag: &str) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag: etag.to_string(),
        }
    }

    #[tokio::test]
    async fn test_initiate_returns_unique_ids() {
        let gw = MemoryUploadGateway::new();
        let a = gw.initiate("b", "k").await.unwrap();
        let b = gw.initiate("b", "k").await.unwrap();
        assert!(!a.is_empty());
        assert_ne!(a, b);
        assert_eq!(gw.in_flight_count().await, 2);
    }

    #[tokio::test]
    async fn test_upload_part_etag_is_quoted_md5() {
        let gw = MemoryUploadGateway::new();
        let id = gw.initiate("b", "k").await.unwrap();
        let etag = gw
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"hello").into())
            .await
            .unwrap();
        assert_eq!(etag, "\"5d41402abc4b2a76b9719d911017c592\"");
    }

    #[tokio::test]
    async fn test_upload_part_unknown_upload() {
        let gw = MemoryUploadGateway::new();
        let err = gw
            .upload_part("b", "k", "nope", 1, Bytes::from_static(b"x").into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NoSuchUpload"));
    }

    #[tokio::test]
    async fn test_complete_assembles_object() {
        let gw = MemoryUploadGateway::new();
        let id = gw.initiate("b", "k").await.unwrap();
        let big = Bytes::from(vec![b'a'; MIN_PART_SIZE as usize]);
        let e1 = gw.upload_part("b", "k", &id, 1, big.clone().into()).await.unwrap();
        let e2 = gw
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"tail").into())
            .await
            .unwrap();

        let done = gw
            .complete("b", "k", &id, &[part(1, &e1), part(2, &e2)])
            .await
            .unwrap();
        assert!(done.etag.unwrap().ends_with("-2\""));

        let obj = gw.object("b", "k").await.unwrap();
        assert_eq!(obj.data.len(), MIN_PART_SIZE as usize + 4);
        assert_eq!(gw.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_small_non_final_part() {
        let gw = MemoryUploadGateway::new();
        let id = gw.initiate("b", "k").await.unwrap();
        let e1 = gw
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"small").into())
            .await
            .unwrap();
        let e2 = gw
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"tail").into())
            .await
            .unwrap();
        let err = gw
            .complete("b", "k", &id, &[part(1, &e1), part(2, &e2)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("EntityTooSmall"));
        // The upload survives a rejected completion.
        assert_eq!(gw.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn test_complete_rejects_bad_order_and_tags() {
        let gw = MemoryUploadGateway::new().with_min_part_size(0);
        let id = gw.initiate("b", "k").await.unwrap();
        let e1 = gw
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"one").into())
            .await
            .unwrap();
        let e2 = gw
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"two").into())
            .await
            .unwrap();

        let err = gw
            .complete("b", "k", &id, &[part(2, &e2), part(1, &e1)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPartOrder"));

        let err = gw
            .complete("b", "k", &id, &[part(1, "\"deadbeef\"")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPart"));

        let err = gw.complete("b", "k", &id, &[]).await.unwrap_err();
        assert!(err.to_string().contains("MalformedXML"));

        // Unquoted tags are accepted.
        gw.complete("b", "k", &id, &[part(1, e1.trim_matches('"')), part(2, &e2)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_abort_one_and_list() {
        let gw = MemoryUploadGateway::new();
        let a = gw.initiate("b", "x").await.unwrap();
        let _b = gw.initiate("b", "y").await.unwrap();
        let _other = gw.initiate("other", "x").await.unwrap();

        let listed = gw.list_in_flight("b").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "x");

        let aborted = gw.abort_one("b", "x", &a).await.unwrap();
        assert_eq!(aborted.upload_id, a);
        assert!(gw.abort_one("b", "x", &a).await.is_err());
        assert_eq!(gw.list_in_flight("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_matching_filters() {
        let gw = MemoryUploadGateway::new();
        let a = gw.initiate("b", "x").await.unwrap();
        let _b = gw.initiate("b", "y").await.unwrap();
        let _c = gw.initiate("b", "x").await.unwrap();

        let outcome = gw.abort_matching("b", None, Some(&a)).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert_eq!(outcome.aborted[0].upload_id, a);
        assert!(outcome.failed.is_empty());

        let outcome = gw.abort_matching("b", Some("x"), None).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);

        let outcome = gw.abort_matching("b", None, None).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert_eq!(gw.in_flight_count().await, 0);
    }
}
