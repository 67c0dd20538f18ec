use std::fmt;

use async_trait::async_trait;
use snapvault_core::{ContainerDescriptor, CoreResult};

/// What an asynchronous provider operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateSnapshot,
    DeleteSnapshot,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::CreateSnapshot => f.write_str("create-snapshot"),
            OperationKind::DeleteSnapshot => f.write_str("delete-snapshot"),
        }
    }
}

/// Handle to a submitted provider operation.
///
/// Returned by the submit calls; resolved with
/// [`SnapshotProvider::wait_for_completion`]. Each handle is meant to be
/// awaited once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation {
    /// Provider-assigned identifier.
    pub id: String,
    /// Kind of work submitted.
    pub kind: OperationKind,
    /// Snapshot key (`container/snapshot`) the operation targets.
    pub target: String,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.target, self.id)
    }
}

/// Creates and deletes point-in-time snapshots of container storage.
///
/// Submit calls return as soon as the provider has accepted the request;
/// callers suspend on [`SnapshotProvider::wait_for_completion`] until the
/// operation resolves.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Enumerate every backup target.
    ///
    /// # Errors
    ///
    /// - `CoreError::ProviderError` if the provider cannot be queried
    async fn list_containers(&self) -> CoreResult<Vec<ContainerDescriptor>>;

    /// Submit a snapshot of `container` named `snapshot`.
    ///
    /// # Errors
    ///
    /// - `CoreError::ProviderError` if the request is rejected
    async fn create_snapshot(&self, container: &str, snapshot: &str) -> CoreResult<Operation>;

    /// Submit deletion of the snapshot addressed by `key`
    /// (`container/snapshot`).
    ///
    /// # Errors
    ///
    /// - `CoreError::ProviderError` if the request is rejected
    async fn delete_snapshot(&self, key: &str) -> CoreResult<Operation>;

    /// Suspend until `operation` resolves.
    ///
    /// # Errors
    ///
    /// - `CoreError::ProviderError` if the operation failed
    /// - `CoreError::InvalidState` if the handle is unknown or already awaited
    async fn wait_for_completion(&self, operation: &Operation) -> CoreResult<()>;
}
