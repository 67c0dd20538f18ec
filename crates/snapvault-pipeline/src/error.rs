use std::fmt;

use snapvault_core::CoreError;
use thiserror::Error;

/// Part of an item's lifecycle a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Creating the local snapshot.
    Snapshot,
    /// Export, compression and upload.
    Transfer,
    /// Deleting the local snapshot after upload.
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Snapshot => f.write_str("snapshot"),
            Phase::Transfer => f.write_str("transfer"),
            Phase::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// Failure of one container's item. Never aborts other items.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("snapshot request for container {container} failed: {source}")]
    SnapshotCreate {
        container: String,
        #[source]
        source: CoreError,
    },

    #[error("snapshot of container {container} did not complete: {source}")]
    SnapshotWait {
        container: String,
        #[source]
        source: CoreError,
    },

    #[error("opening remote object {key} failed: {source}")]
    SinkOpen {
        key: String,
        #[source]
        source: CoreError,
    },

    #[error("export of {snapshot} failed: {source}")]
    Export {
        snapshot: String,
        #[source]
        source: CoreError,
    },

    #[error("finalizing compressed stream for {snapshot} failed: {source}")]
    CompressFinalize {
        snapshot: String,
        #[source]
        source: CoreError,
    },

    #[error("committing remote object {key} failed: {source}")]
    SinkClose {
        key: String,
        #[source]
        source: CoreError,
    },

    #[error("delete request for snapshot {snapshot} failed: {source}")]
    DeleteSubmit {
        snapshot: String,
        #[source]
        source: CoreError,
    },

    #[error("deleting snapshot {snapshot} did not complete: {source}")]
    DeleteWait {
        snapshot: String,
        #[source]
        source: CoreError,
    },

    #[error("{phase} of {target} cancelled")]
    Cancelled { phase: Phase, target: String },

    #[error("{phase} task for {target} panicked: {message}")]
    TaskPanicked {
        phase: Phase,
        target: String,
        message: String,
    },
}

impl PipelineError {
    /// Phase of the item lifecycle that failed.
    pub fn phase(&self) -> Phase {
        match self {
            PipelineError::SnapshotCreate { .. } | PipelineError::SnapshotWait { .. } => {
                Phase::Snapshot
            }
            PipelineError::SinkOpen { .. }
            | PipelineError::Export { .. }
            | PipelineError::CompressFinalize { .. }
            | PipelineError::SinkClose { .. } => Phase::Transfer,
            PipelineError::DeleteSubmit { .. } | PipelineError::DeleteWait { .. } => Phase::Cleanup,
            PipelineError::Cancelled { phase, .. } | PipelineError::TaskPanicked { phase, .. } => {
                *phase
            }
        }
    }

    /// Whether the remote object was committed before this failure.
    pub fn upload_committed(&self) -> bool {
        matches!(
            self,
            PipelineError::DeleteSubmit { .. } | PipelineError::DeleteWait { .. }
        ) || matches!(
            self,
            PipelineError::Cancelled {
                phase: Phase::Cleanup,
                ..
            }
        )
    }
}
