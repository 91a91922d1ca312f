//! S3 gateway backend.
//!
//! Forwards multipart primitives to any S3-compatible endpoint (AWS,
//! MinIO, LocalStack, ...) through the AWS SDK.  The client is built
//! once at startup and shared by every request.

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use aws_sdk_s3::Client;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::backend::{
    AbortedUpload, CompletedPart, CompletedUpload, PartPayload, UploadGateway, UploadSummary,
};

/// Connection settings for [`AwsUploadGateway`].
#[derive(Debug, Clone, Default)]
pub struct AwsGatewaySettings {
    /// Custom S3-compatible endpoint; `None` uses the AWS default.
    pub endpoint_url: Option<String>,
    /// Region to sign requests for.
    pub region: String,
    /// Static access key; falls back to the default credential chain
    /// when either key is absent.
    pub access_key: Option<String>,
    /// Static secret key.
    pub secret_key: Option<String>,
    /// Force path-style URL addressing (needed by most self-hosted stores).
    pub use_path_style: bool,
}

/// Gateway backend that forwards multipart operations to S3.
pub struct AwsUploadGateway {
    client: Client,
}

impl AwsUploadGateway {
    /// Build the S3 client from `settings`.
    pub async fn new(settings: AwsGatewaySettings) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let Some(ref endpoint) = settings.endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ak), Some(sk)) = (&settings.access_key, &settings.secret_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "partkeeper-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.use_path_style)
            .build();

        info!(
            endpoint = settings.endpoint_url.as_deref().unwrap_or("aws-default"),
            region = %settings.region,
            path_style = settings.use_path_style,
            "S3 gateway initialized"
        );

        Ok(Self::from_client(Client::from_conf(s3_config)))
    }

    /// Wrap an already-configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Map an SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("S3 {context}: {err}")
    }
}

/// Ensure an ETag is wrapped in double quotes, the form S3 expects back
/// at completion.
fn quote_etag(etag: &str) -> String {
    if etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}

/// The SDK models part numbers as `i32`; refuse anything that would wrap.
fn sdk_part_number(part_number: u32) -> anyhow::Result<i32> {
    i32::try_from(part_number)
        .map_err(|_| anyhow::anyhow!("part number {part_number} is out of range for S3"))
}

fn to_sdk_parts(parts: &[CompletedPart]) -> anyhow::Result<Vec<SdkCompletedPart>> {
    parts
        .iter()
        .map(|p| {
            Ok(SdkCompletedPart::builder()
                .part_number(sdk_part_number(p.part_number)?)
                .e_tag(&p.etag)
                .build())
        })
        .collect()
}

impl UploadGateway for AwsUploadGateway {
    fn initiate(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 create_multipart_upload: bucket={} key={}", bucket, key);

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("create_multipart_upload", DisplayErrorContext(e))
                })?;

            match resp.upload_id() {
                Some(id) if !id.is_empty() => Ok(id.to_string()),
                _ => Err(anyhow::anyhow!(
                    "S3 create_multipart_upload: no upload ID returned for {bucket}/{key}"
                )),
            }
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
            let size = payload.len();
            let sdk_part = sdk_part_number(part_number)?;
            debug!(
                "S3 upload_part: bucket={} key={} upload={} part={} size={}",
                bucket, key, upload_id, part_number, size
            );

            let body = match payload {
                PartPayload::Bytes(data) => ByteStream::from(data),
                PartPayload::File { path, .. } => ByteStream::from_path(&path)
                    .await
                    .map_err(|e| Self::map_sdk_error("upload_part body", e))?,
            };

            let resp = self
                .client
                .upload_part()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(sdk_part)
                .content_length(size as i64)
                .body(body)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", DisplayErrorContext(e)))?;

            let etag = resp
                .e_tag()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| anyhow::anyhow!("S3 upload_part: no ETag returned"))?;
            Ok(quote_etag(etag))
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
        let sdk_parts = to_sdk_parts(parts);
        Box::pin(async move {
            let sdk_parts = sdk_parts?;
            debug!(
                "S3 complete_multipart_upload: bucket={} key={} upload={} parts={}",
                bucket,
                key,
                upload_id,
                sdk_parts.len()
            );

            let upload = CompletedMultipartUpload::builder()
                .set_parts(Some(sdk_parts))
                .build();

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(upload)
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("complete_multipart_upload", DisplayErrorContext(e))
                })?;

            Ok(CompletedUpload {
                bucket,
                key,
                etag: resp.e_tag().map(quote_etag),
                location: resp.location().map(str::to_string),
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
            debug!(
                "S3 abort_multipart_upload: bucket={} key={} upload={}",
                bucket, key, upload_id
            );

            self.client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("abort_multipart_upload", DisplayErrorContext(e))
                })?;

            Ok(AbortedUpload { key, upload_id })
        })
    }

    fn list_in_flight(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<UploadSummary>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let mut uploads = Vec::new();
            let mut key_marker: Option<String> = None;
            let mut upload_id_marker: Option<String> = None;

            loop {
                let mut req = self.client.list_multipart_uploads().bucket(&bucket);
                if let Some(ref marker) = key_marker {
                    req = req.key_marker(marker);
                }
                if let Some(ref marker) = upload_id_marker {
                    req = req.upload_id_marker(marker);
                }

                let resp = req.send().await.map_err(|e| {
                    Self::map_sdk_error("list_multipart_uploads", DisplayErrorContext(e))
                })?;

                for upload in resp.uploads() {
                    if let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) {
                        uploads.push(UploadSummary {
                            key: key.to_string(),
                            upload_id: upload_id.to_string(),
                        });
                    }
                }

                if resp.is_truncated() == Some(true) {
                    key_marker = resp.next_key_marker().map(str::to_string);
                    upload_id_marker = resp.next_upload_id_marker().map(str::to_string);
                    if key_marker.is_none() && upload_id_marker.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }

            debug!("S3 list_multipart_uploads: bucket={} found={}", bucket, uploads.len());
            Ok(uploads)
        })
    }
}
