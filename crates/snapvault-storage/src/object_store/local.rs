//! Local filesystem implementation of ObjectStore
//!
//! Objects are stored as files with the key as the relative path. A sink
//! writes to a hidden `.partial` sibling and renames it into place on close,
//! so readers never observe a half-written object.

use super::{ObjectMetadata, ObjectReader, ObjectSink, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use snapvault_core::{CoreError, CoreResult};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncWriteExt, BufWriter};

const PARTIAL_SUFFIX: &str = ".partial";

/// Local filesystem object store
///
/// # Example
///
/// ```rust,no_run
/// use snapvault_storage::object_store::{LocalObjectStore, ObjectStore};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> snapvault_core::CoreResult<()> {
///     let store = LocalObjectStore::new("/var/backups/nightly").await?;
///
///     let mut sink = store.open_sink("web/backup-20240102-030405-42").await?;
///     sink.write(Bytes::from("stream")).await?;
///     sink.close().await?;
///     Ok(())
/// }
/// ```
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

impl LocalObjectStore {
    /// Create a new local object store
    ///
    /// Creates the base directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IoError` if directory creation fails
    pub async fn new(base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    /// Convert key to full filesystem path, refusing keys that escape the
    /// base directory.
    fn full_path(&self, key: &str) -> CoreResult<PathBuf> {
        if key.is_empty() {
            return Err(CoreError::ValidationError(
                "Key cannot be empty".to_string(),
            ));
        }

        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CoreError::ValidationError(format!(
                "Key must be a relative path without `..`: {key}"
            )));
        }

        Ok(self.base_dir.join(relative))
    }

    /// Strip base directory from path to get key
    fn path_to_key(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.base_dir)
            .ok()
            .and_then(|p| p.to_str())
            .map(|s| s.to_string())
    }

    /// Recursively list all committed files under a directory
    fn list_recursive<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<Vec<PathBuf>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut results = Vec::new();

            let mut read_dir = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;

                if metadata.is_file() {
                    if !is_partial(&path) {
                        results.push(path);
                    }
                } else if metadata.is_dir() {
                    let mut sub_results = self.list_recursive(&path).await?;
                    results.append(&mut sub_results);
                }
            }

            Ok(results)
        })
    }
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn open_sink(&self, key: &str) -> CoreResult<Box<dyn ObjectSink>> {
        let final_path = self.full_path(key)?;

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::ValidationError(format!("Invalid key: {key}")))?;
        let partial_path = final_path.with_file_name(format!(
            ".{}.{}{}",
            file_name,
            uuid::Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));

        let file = tokio::fs::File::create(&partial_path).await?;

        Ok(Box::new(LocalObjectSink {
            writer: BufWriter::new(file),
            partial_path,
            final_path,
            bytes_written: 0,
        }))
    }
}

#[async_trait]
impl ObjectReader for LocalObjectStore {
    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        let path = self.full_path(key)?;

        let data = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found("object", key)
            } else {
                CoreError::from(e)
            }
        })?;

        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let path = self.full_path(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        let prefix_path = if prefix.is_empty() {
            self.base_dir.clone()
        } else {
            self.full_path(prefix.trim_end_matches('/'))?
        };

        if !tokio::fs::try_exists(&prefix_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let metadata_check = tokio::fs::metadata(&prefix_path).await?;

        let files = if metadata_check.is_file() {
            vec![prefix_path]
        } else if metadata_check.is_dir() {
            self.list_recursive(&prefix_path).await?
        } else {
            vec![]
        };

        let mut results = Vec::new();
        for path in files {
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                if let Some(key) = self.path_to_key(&path) {
                    results.push(ObjectMetadata {
                        key,
                        size_bytes: metadata.len(),
                        last_modified: metadata
                            .modified()
                            .ok()
                            .and_then(|t| {
                                t.duration_since(UNIX_EPOCH)
                                    .ok()
                                    .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
                            })
                            .unwrap_or_else(Utc::now),
                        etag: None,
                    });
                }
            }
        }

        Ok(results)
    }
}

/// Sink writing to a `.partial` file that is renamed into place on close.
struct LocalObjectSink {
    writer: BufWriter<tokio::fs::File>,
    partial_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl ObjectSink for LocalObjectSink {
    async fn write(&mut self, chunk: Bytes) -> CoreResult<()> {
        self.writer.write_all(&chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn close(self: Box<Self>) -> CoreResult<()> {
        let LocalObjectSink {
            mut writer,
            partial_path,
            final_path,
            ..
        } = *self;

        let committed = async {
            writer.flush().await?;
            let file = writer.into_inner();
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial_path, &final_path).await
        }
        .await;

        if let Err(e) = committed {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(CoreError::StorageError(format!(
                "failed to commit {}: {}",
                final_path.display(),
                e
            )));
        }

        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
