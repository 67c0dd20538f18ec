//! Object Store abstraction for snapshot uploads
//!
//! Provides a streaming, write-once interface with multiple backends:
//! - AWS S3 (production)
//! - MinIO (S3-compatible)
//! - Local filesystem (air-gapped hosts, testing)
//! - In-memory mock with failure injection (testing)

mod local;
mod mock;
mod s3;

pub use local::LocalObjectStore;
pub use mock::{CallHistoryEntry, MockFailure, MockOperation, MockS3ObjectStore};
pub use s3::{S3Config, S3ObjectStore};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapvault_core::CoreResult;

/// Object metadata returned by list operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification timestamp
    pub last_modified: DateTime<Utc>,
    /// ETag (S3 entity tag, None for local storage)
    pub etag: Option<String>,
}

/// A write stream addressed by one object key.
///
/// Bytes written are buffered or streamed according to the backend. Nothing
/// is visible under the key until [`ObjectSink::close`] returns `Ok`;
/// dropping a sink without closing it abandons the upload.
#[async_trait]
pub trait ObjectSink: Send {
    /// Append a chunk to the object.
    ///
    /// # Errors
    ///
    /// - `CoreError::StorageError` if the backend rejects the data
    /// - `CoreError::IoError` on local I/O failure
    async fn write(&mut self, chunk: Bytes) -> CoreResult<()>;

    /// Durably commit the object.
    ///
    /// # Errors
    ///
    /// - `CoreError::StorageError` if the commit fails; the object must then
    ///   be treated as absent
    async fn close(self: Box<Self>) -> CoreResult<()>;

    /// Bytes accepted by [`ObjectSink::write`] so far.
    fn bytes_written(&self) -> u64;
}

/// Object Store trait - S3-like interface for cloud/local storage
///
/// All implementations must be thread-safe (Send + Sync) and support
/// concurrent operations. Keys are UTF-8 strings treated as opaque identifiers.
///
/// # Examples
///
/// ```rust,no_run
/// use snapvault_storage::object_store::{LocalObjectStore, ObjectReader, ObjectStore};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> snapvault_core::CoreResult<()> {
///     let store = LocalObjectStore::new("./backups").await?;
///
///     let mut sink = store.open_sink("web/backup-20240102-030405-42").await?;
///     sink.write(Bytes::from("stream")).await?;
///     sink.close().await?;
///
///     let objects = store.list("web/").await?;
///     assert_eq!(objects.len(), 1);
///
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a write sink for `key`.
    ///
    /// # Errors
    ///
    /// - `CoreError::ValidationError` if key is empty
    /// - `CoreError::StorageError` if the backend cannot start an upload
    async fn open_sink(&self, key: &str) -> CoreResult<Box<dyn ObjectSink>>;
}

/// Read access to committed objects. Implemented by the local and mock
/// backends.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Get object
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if object does not exist
    /// - `CoreError::StorageError` if the operation fails
    async fn get(&self, key: &str) -> CoreResult<Bytes>;

    /// Check if a committed object exists
    ///
    /// # Errors
    ///
    /// - `CoreError::StorageError` if the operation fails
    async fn exists(&self, key: &str) -> CoreResult<bool>;

    /// List committed objects with prefix
    ///
    /// Use an empty string to list all objects.
    ///
    /// # Errors
    ///
    /// - `CoreError::StorageError` if the operation fails
    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>>;
}
