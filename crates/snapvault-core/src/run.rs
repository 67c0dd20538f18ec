//! Run identity and the descriptors that flow through the backup pipeline.
//!
//! Every snapshot taken during one invocation shares a single name derived
//! from the [`RunIdentity`], so all artifacts of a run can be found by name
//! alone: `backup-<timestamp>-<seed>`.

use std::fmt;

use chrono::{DateTime, Local};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Format used for the sortable start timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Prefix of every snapshot name created by a run.
pub const SNAPSHOT_PREFIX: &str = "backup";

/// Identity of one pipeline invocation.
///
/// Computed once at startup and shared read-only by every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    timestamp: String,
    seed: i64,
}

impl RunIdentity {
    /// Creates an identity from explicit parts.
    #[must_use]
    pub fn new(timestamp: impl Into<String>, seed: i64) -> Self {
        Self {
            timestamp: timestamp.into(),
            seed,
        }
    }

    /// Captures the current local time and draws a seed from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Internal` when the OS random source is unavailable.
    pub fn generate() -> CoreResult<Self> {
        Self::generate_at(Local::now())
    }

    /// Same as [`RunIdentity::generate`] with a caller-supplied start time.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Internal` when the OS random source is unavailable.
    pub fn generate_at(started_at: DateTime<Local>) -> CoreResult<Self> {
        let mut bytes = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CoreError::internal(format!("failed to read random seed: {e}")))?;

        Ok(Self {
            timestamp: started_at.format(TIMESTAMP_FORMAT).to_string(),
            seed: i64::from_le_bytes(bytes),
        })
    }

    /// Sortable start timestamp.
    #[must_use]
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Random seed disambiguating concurrent runs.
    #[must_use]
    pub const fn seed(&self) -> i64 {
        self.seed
    }

    /// Snapshot name used for every container in this run.
    #[must_use]
    pub fn snapshot_name(&self) -> String {
        format!("{SNAPSHOT_PREFIX}-{}-{}", self.timestamp, self.seed)
    }

    /// Builds the descriptor for a container whose snapshot has completed.
    #[must_use]
    pub fn descriptor_for(&self, container_name: impl Into<String>) -> SnapshotDescriptor {
        SnapshotDescriptor {
            container_name: container_name.into(),
            snapshot_name: self.snapshot_name(),
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.snapshot_name())
    }
}

/// A backup target as reported by the snapshot provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    /// Container name, unique within the provider.
    pub name: String,
    /// Provider-reported status (e.g. `"Running"`).
    #[serde(default)]
    pub status: String,
}

impl ContainerDescriptor {
    /// Creates a descriptor with an unknown status.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: String::new(),
        }
    }
}

/// A snapshot that has been confirmed complete and awaits transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    /// Container the snapshot belongs to.
    pub container_name: String,
    /// Run-scoped snapshot name.
    pub snapshot_name: String,
}

impl SnapshotDescriptor {
    /// Key of the remote object holding this snapshot's stream.
    #[must_use]
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.container_name, self.snapshot_name)
    }

    /// Key the snapshot provider uses to address this snapshot.
    #[must_use]
    pub fn snapshot_key(&self) -> String {
        format!("{}/{}", self.container_name, self.snapshot_name)
    }

    /// Fully-qualified dataset path handed to the export command.
    #[must_use]
    pub fn export_path(&self, pool: &str) -> String {
        format!(
            "{}/containers/{}@snapshot-{}",
            pool, self.container_name, self.snapshot_name
        )
    }
}

impl fmt::Display for SnapshotDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_name, self.snapshot_name)
    }
}
