//! Snapshot provider driving the `lxc` command-line client.
//!
//! Each submitted operation is a spawned `lxc` child process; waiting on the
//! operation joins that process and turns a non-zero exit into an error
//! carrying the client's stderr. A child whose handle is dropped, by a
//! cancelled wait or by dropping the provider, is killed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use snapvault_core::{ContainerDescriptor, CoreError, CoreResult};
use tokio::process::{Child, Command};
use tracing::debug;
use uuid::Uuid;

use crate::provider::{Operation, OperationKind, SnapshotProvider};

/// Subset of `lxc list --format json` we rely on.
#[derive(Debug, Deserialize)]
struct LxcInstance {
    name: String,
    #[serde(default)]
    status: String,
}

/// `lxc`-backed [`SnapshotProvider`].
pub struct LxcSnapshotProvider {
    lxc_path: PathBuf,
    pending: Mutex<HashMap<String, Child>>,
}

impl LxcSnapshotProvider {
    /// Create a provider using the given `lxc` binary.
    pub fn new(lxc_path: impl Into<PathBuf>) -> Self {
        Self {
            lxc_path: lxc_path.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.lxc_path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn submit(
        &self,
        mut command: Command,
        kind: OperationKind,
        target: String,
    ) -> CoreResult<Operation> {
        let child = command.spawn().map_err(|e| {
            CoreError::ProviderError(format!(
                "failed to start `{}` for {} {}: {}",
                self.lxc_path.display(),
                kind,
                target,
                e
            ))
        })?;

        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            kind,
            target,
        };
        debug!(operation = %operation, "Submitted lxc operation");
        self.pending.lock().insert(operation.id.clone(), child);

        Ok(operation)
    }
}

/// Parse the JSON emitted by `lxc list --format json`.
fn parse_instances(raw: &[u8]) -> CoreResult<Vec<ContainerDescriptor>> {
    let instances: Vec<LxcInstance> = serde_json::from_slice(raw)?;
    Ok(instances
        .into_iter()
        .map(|i| ContainerDescriptor {
            name: i.name,
            status: i.status,
        })
        .collect())
}

#[async_trait]
impl SnapshotProvider for LxcSnapshotProvider {
    async fn list_containers(&self) -> CoreResult<Vec<ContainerDescriptor>> {
        let output = Command::new(&self.lxc_path)
            .args(["list", "--format", "json"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CoreError::ProviderError(format!(
                    "failed to run `{} list`: {}",
                    self.lxc_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(CoreError::ProviderError(format!(
                "`{} list` failed ({}): {}",
                self.lxc_path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_instances(&output.stdout)
    }

    async fn create_snapshot(&self, container: &str, snapshot: &str) -> CoreResult<Operation> {
        let mut command = self.command();
        command.args(["snapshot", container, snapshot]);
        self.submit(
            command,
            OperationKind::CreateSnapshot,
            format!("{container}/{snapshot}"),
        )
    }

    async fn delete_snapshot(&self, key: &str) -> CoreResult<Operation> {
        let mut command = self.command();
        command.args(["delete", key]);
        self.submit(command, OperationKind::DeleteSnapshot, key.to_string())
    }

    async fn wait_for_completion(&self, operation: &Operation) -> CoreResult<()> {
        let child = self.pending.lock().remove(&operation.id).ok_or_else(|| {
            CoreError::invalid_state(format!("unknown or already awaited operation {operation}"))
        })?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CoreError::ProviderError(format!(
                "{} failed ({}): {}",
                operation,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}
