//! In-memory snapshot provider for testing.
//!
//! Tracks which snapshots exist, lets tests inject a failure at any step of
//! any container's create/delete lifecycle, and records every call.
//!
//! # Examples
//!
//! ```rust
//! use snapvault_provider::{MockSnapshotProvider, ProviderStep, SnapshotProvider};
//!
//! # async fn example() -> snapvault_core::CoreResult<()> {
//! let provider = MockSnapshotProvider::with_containers(["web", "db"]);
//! provider.fail_on(ProviderStep::CreateSubmit, "db", "pool is full");
//!
//! let op = provider.create_snapshot("web", "backup-1").await?;
//! provider.wait_for_completion(&op).await?;
//! assert!(provider.snapshot_exists("web/backup-1"));
//!
//! assert!(provider.create_snapshot("db", "backup-1").await.is_err());
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use snapvault_core::{ContainerDescriptor, CoreError, CoreResult};

use crate::provider::{Operation, OperationKind, SnapshotProvider};

/// Step of the provider lifecycle a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderStep {
    List,
    CreateSubmit,
    CreateWait,
    DeleteSubmit,
    DeleteWait,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub step: ProviderStep,
    /// Snapshot key, or empty for `List`.
    pub target: String,
    pub success: bool,
}

#[derive(Default)]
struct MockProviderState {
    containers: RwLock<Vec<ContainerDescriptor>>,
    snapshots: RwLock<HashSet<String>>,
    pending: RwLock<HashMap<String, Operation>>,
    failures: RwLock<HashMap<(ProviderStep, String), String>>,
    calls: RwLock<Vec<ProviderCall>>,
    next_id: AtomicU64,
    in_flight_creates: AtomicUsize,
    peak_in_flight_creates: AtomicUsize,
}

/// In-memory [`SnapshotProvider`].
///
/// Cloning shares state, so tests keep a handle for assertions.
#[derive(Clone, Default)]
pub struct MockSnapshotProvider {
    state: Arc<MockProviderState>,
    latency: Duration,
}

impl MockSnapshotProvider {
    /// Provider with no containers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with the given container names.
    pub fn with_containers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        *provider.state.containers.write() = names
            .into_iter()
            .map(|n| ContainerDescriptor {
                name: n.into(),
                status: "Running".to_string(),
            })
            .collect();
        provider
    }

    /// Delay every wait by `latency`, so operations overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail `step` for `container` with `message`. `List` ignores the
    /// container name.
    pub fn fail_on(&self, step: ProviderStep, container: impl Into<String>, message: impl Into<String>) {
        let container = if step == ProviderStep::List {
            String::new()
        } else {
            container.into()
        };
        self.state
            .failures
            .write()
            .insert((step, container), message.into());
    }

    /// Whether a snapshot with `key` (`container/snapshot`) currently exists.
    pub fn snapshot_exists(&self, key: &str) -> bool {
        self.state.snapshots.read().contains(key)
    }

    /// All existing snapshot keys, sorted.
    pub fn snapshots(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state.snapshots.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.calls.read().clone()
    }

    /// Calls for one step, successful or not.
    pub fn calls_for(&self, step: ProviderStep) -> Vec<ProviderCall> {
        self.state
            .calls
            .read()
            .iter()
            .filter(|c| c.step == step)
            .cloned()
            .collect()
    }

    /// Highest number of snapshot creations observed in flight at once.
    pub fn peak_concurrent_creates(&self) -> usize {
        self.state.peak_in_flight_creates.load(Ordering::SeqCst)
    }

    fn record(&self, step: ProviderStep, target: &str, success: bool) {
        self.state.calls.write().push(ProviderCall {
            step,
            target: target.to_string(),
            success,
        });
    }

    fn check(&self, step: ProviderStep, container: &str, target: &str) -> CoreResult<()> {
        let failure = self
            .state
            .failures
            .read()
            .get(&(step, container.to_string()))
            .cloned();

        match failure {
            Some(message) => {
                self.record(step, target, false);
                Err(CoreError::ProviderError(message))
            }
            None => Ok(()),
        }
    }

    fn register(&self, kind: OperationKind, target: String) -> Operation {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let operation = Operation {
            id: format!("mock-op-{id}"),
            kind,
            target,
        };
        self.state
            .pending
            .write()
            .insert(operation.id.clone(), operation.clone());
        operation
    }

    fn begin_create(&self) {
        let now = self.state.in_flight_creates.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .peak_in_flight_creates
            .fetch_max(now, Ordering::SeqCst);
    }

    fn end_create(&self) {
        self.state.in_flight_creates.fetch_sub(1, Ordering::SeqCst);
    }
}

fn container_of(key: &str) -> &str {
    key.split_once('/').map_or(key, |(container, _)| container)
}

#[async_trait]
impl SnapshotProvider for MockSnapshotProvider {
    async fn list_containers(&self) -> CoreResult<Vec<ContainerDescriptor>> {
        self.check(ProviderStep::List, "", "")?;
        self.record(ProviderStep::List, "", true);
        Ok(self.state.containers.read().clone())
    }

    async fn create_snapshot(&self, container: &str, snapshot: &str) -> CoreResult<Operation> {
        let target = format!("{container}/{snapshot}");
        self.check(ProviderStep::CreateSubmit, container, &target)?;

        if !self.state.containers.read().iter().any(|c| c.name == container) {
            self.record(ProviderStep::CreateSubmit, &target, false);
            return Err(CoreError::not_found("container", container));
        }
        if self.snapshot_exists(&target) {
            self.record(ProviderStep::CreateSubmit, &target, false);
            return Err(CoreError::already_exists("snapshot", target));
        }

        self.record(ProviderStep::CreateSubmit, &target, true);
        self.begin_create();
        Ok(self.register(OperationKind::CreateSnapshot, target))
    }

    async fn delete_snapshot(&self, key: &str) -> CoreResult<Operation> {
        self.check(ProviderStep::DeleteSubmit, container_of(key), key)?;

        if !self.snapshot_exists(key) {
            self.record(ProviderStep::DeleteSubmit, key, false);
            return Err(CoreError::not_found("snapshot", key));
        }

        self.record(ProviderStep::DeleteSubmit, key, true);
        Ok(self.register(OperationKind::DeleteSnapshot, key.to_string()))
    }

    async fn wait_for_completion(&self, operation: &Operation) -> CoreResult<()> {
        let pending = self.state.pending.write().remove(&operation.id);
        let Some(operation) = pending else {
            return Err(CoreError::invalid_state(format!(
                "unknown or already awaited operation {operation}"
            )));
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let container = container_of(&operation.target);
        match operation.kind {
            OperationKind::CreateSnapshot => {
                let result = self.check(ProviderStep::CreateWait, container, &operation.target);
                if result.is_ok() {
                    self.state.snapshots.write().insert(operation.target.clone());
                    self.record(ProviderStep::CreateWait, &operation.target, true);
                }
                self.end_create();
                result
            }
            OperationKind::DeleteSnapshot => {
                self.check(ProviderStep::DeleteWait, container, &operation.target)?;
                self.state.snapshots.write().remove(&operation.target);
                self.record(ProviderStep::DeleteWait, &operation.target, true);
                Ok(())
            }
        }
    }
}
