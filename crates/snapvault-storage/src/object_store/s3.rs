//! AWS S3 implementation of ObjectStore
//!
//! Supports standard AWS S3 and S3-compatible endpoints (MinIO, Wasabi, etc.).
//! Sinks stream through a multipart upload; objects smaller than one part
//! are sent with a single `PutObject` on close.

use super::{ObjectSink, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{config::Credentials, primitives::ByteStream, Client, Config};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use snapvault_core::config::DEFAULT_PART_SIZE_BYTES;
use snapvault_core::{CoreError, CoreResult};

/// S3 rejects part numbers above this.
const MAX_PARTS: usize = 10_000;

/// Largest part S3 accepts.
const MAX_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Parts uploaded at one size before the size doubles.
const PARTS_PER_SIZE_STEP: usize = 1_000;

/// Size of the part at zero-based `index` for a sink configured with
/// `base` bytes per part.
///
/// The size doubles every [`PARTS_PER_SIZE_STEP`] parts, capped at
/// [`MAX_PART_SIZE_BYTES`]. With the 8 MiB default, [`MAX_PARTS`] parts hold
/// close to 8 TiB.
fn part_size_for(base: usize, index: usize) -> usize {
    let doublings = u32::try_from(index / PARTS_PER_SIZE_STEP).unwrap_or(u32::MAX);
    let factor = 1u64.checked_shl(doublings).unwrap_or(u64::MAX);
    let size = (base.max(1) as u64)
        .saturating_mul(factor)
        .min(MAX_PART_SIZE_BYTES);
    usize::try_from(size).unwrap_or(usize::MAX)
}

/// S3 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region (e.g., "us-west-2")
    pub region: String,
    /// Optional custom endpoint URL (for MinIO compatibility)
    pub endpoint: Option<String>,
    /// Optional access key (for custom S3 endpoints)
    pub access_key: Option<String>,
    /// Optional secret key (for custom S3 endpoints)
    pub secret_key: Option<String>,
    /// Optional key prefix (all keys will be prefixed with this)
    pub prefix: Option<String>,
    /// Multipart upload part size in bytes
    pub part_size_bytes: usize,
}

impl S3Config {
    /// Create config for standard AWS S3 (uses ambient credentials)
    pub fn aws(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: None,
            part_size_bytes: DEFAULT_PART_SIZE_BYTES,
        }
    }

    /// Create config for MinIO or custom S3-compatible endpoint
    pub fn custom(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            access_key: Some(access_key.into()),
            secret_key: Some(secret_key.into()),
            ..Self::aws(bucket, region)
        }
    }

    /// Set optional key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set multipart part size
    pub fn with_part_size(mut self, part_size_bytes: usize) -> Self {
        self.part_size_bytes = part_size_bytes;
        self
    }
}

/// AWS S3 object store
///
/// # Examples
///
/// ```rust,no_run
/// use snapvault_storage::object_store::{S3Config, S3ObjectStore, ObjectStore};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> snapvault_core::CoreResult<()> {
///     let config = S3Config::custom(
///         "backups",
///         "us-east-1",
///         "http://localhost:9000",
///         "minioadmin",
///         "minioadmin",
///     );
///     let store = S3ObjectStore::new(config).await?;
///
///     let mut sink = store.open_sink("web/backup-20240102-030405-42").await?;
///     sink.write(Bytes::from("stream")).await?;
///     sink.close().await?;
///     Ok(())
/// }
/// ```
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the bucket name is empty
    pub async fn new(config: S3Config) -> CoreResult<Self> {
        if config.bucket.is_empty() {
            return Err(CoreError::ValidationError(
                "Bucket cannot be empty".to_string(),
            ));
        }

        let client = if let (Some(endpoint), Some(access), Some(secret)) =
            (&config.endpoint, &config.access_key, &config.secret_key)
        {
            let creds = Credentials::new(access, secret, None, None, "snapvault-static");

            let s3_config = Config::builder()
                .endpoint_url(endpoint)
                .credentials_provider(creds)
                .region(aws_sdk_s3::config::Region::new(config.region.clone()))
                .force_path_style(true) // Required for MinIO
                .behavior_version(BehaviorVersion::latest())
                .build();

            Client::from_conf(s3_config)
        } else {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(config.region.clone()));
            if let Some(endpoint) = &config.endpoint {
                loader = loader.endpoint_url(endpoint);
            }

            Client::new(&loader.load().await)
        };

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
            part_size_bytes: config.part_size_bytes,
        })
    }

    /// Apply prefix to key if configured
    fn full_key(&self, key: &str) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}/{}", prefix.trim_end_matches('/'), key)
        } else {
            key.to_string()
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn open_sink(&self, key: &str) -> CoreResult<Box<dyn ObjectSink>> {
        if key.is_empty() {
            return Err(CoreError::ValidationError(
                "Key cannot be empty".to_string(),
            ));
        }

        Ok(Box::new(S3ObjectSink {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.full_key(key),
            part_size_bytes: self.part_size_bytes.max(1),
            buffer: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
            bytes_written: 0,
        }))
    }
}

/// Streaming sink backed by an S3 multipart upload.
///
/// The multipart upload is created lazily when the first full part is
/// buffered. Part sizes grow with the part count, see [`part_size_for`]. Dropping the sink without closing it leaves any started upload
/// incomplete; nothing becomes visible under the key.
struct S3ObjectSink {
    client: Client,
    bucket: String,
    key: String,
    part_size_bytes: usize,
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    bytes_written: u64,
}

impl S3ObjectSink {
    async fn upload_id(&mut self) -> CoreResult<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }

        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| {
                CoreError::StorageError(format!("S3 create multipart upload failed: {}", e))
            })?;

        let id = resp
            .upload_id()
            .ok_or_else(|| CoreError::StorageError("S3 returned no upload id".to_string()))?
            .to_string();
        self.upload_id = Some(id.clone());

        Ok(id)
    }

    /// Size the next uploaded part must reach.
    fn next_part_size(&self) -> usize {
        part_size_for(self.part_size_bytes, self.parts.len())
    }

    async fn upload_part(&mut self, data: Bytes) -> CoreResult<()> {
        if self.parts.len() >= MAX_PARTS {
            return Err(CoreError::StorageError(format!(
                "S3 object {} exceeds the {} part limit after {} bytes",
                self.key, MAX_PARTS, self.bytes_written
            )));
        }
        let upload_id = self.upload_id().await?;
        let part_number = i32::try_from(self.parts.len() + 1)
            .map_err(|_| CoreError::internal("part number out of range"))?;

        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                CoreError::StorageError(format!("S3 upload part {} failed: {}", part_number, e))
            })?;

        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(resp.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );

        Ok(())
    }

    /// Best-effort cleanup of a started multipart upload.
    async fn abort(&self) {
        if let Some(upload_id) = &self.upload_id {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(upload_id)
                .send()
                .await
            {
                tracing::warn!(key = %self.key, error = %e, "Failed to abort multipart upload");
            }
        }
    }

    async fn finish(&mut self) -> CoreResult<()> {
        if self.upload_id.is_none() {
            let body = std::mem::take(&mut self.buffer).freeze();
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| CoreError::StorageError(format!("S3 put failed: {}", e)))?;
            return Ok(());
        }

        if !self.buffer.is_empty() {
            let last = std::mem::take(&mut self.buffer).freeze();
            self.upload_part(last).await?;
        }

        let upload_id = self.upload_id().await?;
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(std::mem::take(&mut self.parts)))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                CoreError::StorageError(format!("S3 complete multipart upload failed: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait]
impl ObjectSink for S3ObjectSink {
    async fn write(&mut self, chunk: Bytes) -> CoreResult<()> {
        self.bytes_written += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);

        loop {
            let part_size = self.next_part_size();
            if self.buffer.len() < part_size {
                break;
            }
            let part = self.buffer.split_to(part_size).freeze();
            if let Err(e) = self.upload_part(part).await {
                self.abort().await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn close(mut self: Box<Self>) -> CoreResult<()> {
        if let Err(e) = self.finish().await {
            self.abort().await;
            return Err(e);
        }

        tracing::debug!(
            key = %self.key,
            bytes = self.bytes_written,
            parts = self.parts.len(),
            "Committed S3 object"
        );
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
