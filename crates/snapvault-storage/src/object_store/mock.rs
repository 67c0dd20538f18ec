//! Mock S3 ObjectStore for testing
//!
//! In-memory S3 simulation with configurable failure patterns, used to test
//! partial-failure isolation in the backup pipeline without real AWS/MinIO.
//!
//! # Features
//!
//! - **Deterministic Failures**: Pre-defined failure sequence applied to commits
//! - **Targeted Failures**: Fail one operation for keys under a prefix
//! - **Call History**: Track all operations for assertions
//! - **Latency Simulation**: Optional network delay per operation
//!
//! # Examples
//!
//! ```rust
//! use snapvault_storage::object_store::{MockFailure, MockOperation, MockS3ObjectStore, ObjectStore};
//! use bytes::Bytes;
//!
//! # async fn example() -> snapvault_core::CoreResult<()> {
//! let mock = MockS3ObjectStore::new();
//! mock.fail_on(MockOperation::Close, "db/", MockFailure::Permanent("403 Forbidden"));
//!
//! let mut sink = mock.open_sink("db/backup-1").await?;
//! sink.write(Bytes::from("data")).await?;
//! assert!(sink.close().await.is_err());
//! assert!(!mock.contains_key("db/backup-1"));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{ObjectMetadata, ObjectReader, ObjectSink, ObjectStore};
use snapvault_core::{CoreError, CoreResult};

/// Mock S3 failure pattern.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Transient error. Examples: 500, 503, 504, timeout.
    Transient(&'static str),

    /// Permanent error. Examples: 403, 404, 400.
    Permanent(&'static str),

    /// Success (no error).
    Ok,
}

impl MockFailure {
    /// Convert failure to CoreError.
    fn to_error(&self) -> Option<CoreError> {
        match self {
            MockFailure::Transient(msg) => {
                Some(CoreError::StorageError(format!("Transient: {}", msg)))
            }
            MockFailure::Permanent(msg) => {
                Some(CoreError::StorageError(format!("Permanent: {}", msg)))
            }
            MockFailure::Ok => None,
        }
    }
}

/// Operation a targeted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    OpenSink,
    Write,
    Close,
}

impl MockOperation {
    fn as_str(self) -> &'static str {
        match self {
            MockOperation::OpenSink => "open_sink",
            MockOperation::Write => "write",
            MockOperation::Close => "close",
        }
    }
}

/// Mock S3 call history entry.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    /// Operation type: "open_sink", "write", "close", "get", "list".
    pub operation: String,

    /// Object key.
    pub key: String,

    /// Whether operation succeeded.
    pub success: bool,

    /// Timestamp of operation.
    pub timestamp: Instant,
}

#[derive(Default)]
struct MockState {
    /// In-memory storage (simulates S3 bucket).
    storage: RwLock<HashMap<String, Bytes>>,

    /// Failure pattern queue consumed by commits.
    failure_queue: RwLock<VecDeque<MockFailure>>,

    /// Failures keyed by operation and key prefix.
    targeted: RwLock<Vec<(MockOperation, String, MockFailure)>>,

    /// Call history (for assertions).
    call_history: RwLock<Vec<CallHistoryEntry>>,
}

/// Mock S3 ObjectStore implementation for testing.
///
/// Cloning shares the underlying bucket, so a test can keep a handle for
/// assertions while the pipeline owns another.
#[derive(Clone, Default)]
pub struct MockS3ObjectStore {
    state: Arc<MockState>,
    latency: Duration,
}

impl MockS3ObjectStore {
    /// Create new mock S3 (no failures, no latency).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add simulated network latency to every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Create mock S3 with deterministic failure pattern for commits.
    ///
    /// Failures are consumed in order by `close`. Once the queue is empty,
    /// all commits succeed.
    pub fn new_with_failures(pattern: Vec<MockFailure>) -> Self {
        let mock = Self::new();
        *mock.state.failure_queue.write() = pattern.into();
        mock
    }

    /// Fail `operation` for every key starting with `key_prefix`.
    pub fn fail_on(&self, operation: MockOperation, key_prefix: impl Into<String>, failure: MockFailure) {
        self.state
            .targeted
            .write()
            .push((operation, key_prefix.into(), failure));
    }

    /// Get call history for assertions.
    pub fn get_call_history(&self) -> Vec<CallHistoryEntry> {
        self.state.call_history.read().clone()
    }

    /// Get number of successful commits.
    pub fn successful_commits(&self) -> usize {
        self.count_calls("close", true)
    }

    /// Get number of failed commits.
    pub fn failed_commits(&self) -> usize {
        self.count_calls("close", false)
    }

    /// Get current storage size (number of committed objects).
    pub fn storage_size(&self) -> usize {
        self.state.storage.read().len()
    }

    /// Check if a committed key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.storage.read().contains_key(key)
    }

    /// Committed object keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state.storage.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn count_calls(&self, operation: &str, success: bool) -> usize {
        self.state
            .call_history
            .read()
            .iter()
            .filter(|entry| entry.operation == operation && entry.success == success)
            .count()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Targeted failures take precedence over the commit queue.
    fn check_failure(&self, operation: MockOperation, key: &str) -> Option<CoreError> {
        let targeted = self
            .state
            .targeted
            .read()
            .iter()
            .find(|(op, prefix, _)| *op == operation && key.starts_with(prefix.as_str()))
            .and_then(|(_, _, failure)| failure.to_error());
        if targeted.is_some() {
            return targeted;
        }

        if operation == MockOperation::Close {
            let mut queue = self.state.failure_queue.write();
            if let Some(failure) = queue.pop_front() {
                return failure.to_error();
            }
        }

        None
    }

    /// Record call in history.
    fn record_call(&self, operation: &str, key: &str, success: bool) {
        self.state.call_history.write().push(CallHistoryEntry {
            operation: operation.to_string(),
            key: key.to_string(),
            success,
            timestamp: Instant::now(),
        });
    }

    /// Shared checks for the sink operations.
    fn gate(&self, operation: MockOperation, key: &str) -> CoreResult<()> {
        match self.check_failure(operation, key) {
            Some(error) => {
                self.record_call(operation.as_str(), key, false);
                Err(error)
            }
            None => {
                self.record_call(operation.as_str(), key, true);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MockS3ObjectStore {
    async fn open_sink(&self, key: &str) -> CoreResult<Box<dyn ObjectSink>> {
        self.simulate_latency().await;

        if key.is_empty() {
            return Err(CoreError::ValidationError(
                "Key cannot be empty".to_string(),
            ));
        }

        self.gate(MockOperation::OpenSink, key)?;

        Ok(Box::new(MockObjectSink {
            store: self.clone(),
            key: key.to_string(),
            buffer: BytesMut::new(),
        }))
    }
}

#[async_trait]
impl ObjectReader for MockS3ObjectStore {
    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        self.simulate_latency().await;

        match self.state.storage.read().get(key).cloned() {
            Some(data) => {
                self.record_call("get", key, true);
                Ok(data)
            }
            None => {
                self.record_call("get", key, false);
                Err(CoreError::not_found("object", key))
            }
        }
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        self.simulate_latency().await;
        Ok(self.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        self.simulate_latency().await;

        let storage = self.state.storage.read();
        let mut results: Vec<ObjectMetadata> = storage
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectMetadata {
                key: key.clone(),
                size_bytes: data.len() as u64,
                last_modified: Utc::now(),
                etag: Some(format!("mock-{}", data.len())),
            })
            .collect();
        results.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(results)
    }
}

/// Buffers writes in memory; close publishes them to the shared bucket.
struct MockObjectSink {
    store: MockS3ObjectStore,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl ObjectSink for MockObjectSink {
    async fn write(&mut self, chunk: Bytes) -> CoreResult<()> {
        self.store.gate(MockOperation::Write, &self.key)?;
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> CoreResult<()> {
        self.store.simulate_latency().await;
        self.store.gate(MockOperation::Close, &self.key)?;

        self.store
            .state
            .storage
            .write()
            .insert(self.key.clone(), self.buffer.freeze());
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }
}
