//! Snapshot export runner.
//!
//! Spawns the storage system's send facility for one snapshot. Standard
//! output is handed to the caller as the raw snapshot stream; standard error
//! is captured into memory in the background so a chatty process never
//! blocks on a full pipe.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use snapvault_core::{CoreError, CoreResult, SnapshotDescriptor};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Starts the export process for a snapshot.
pub trait SnapshotExporter: Send + Sync {
    /// Spawn the export of `snapshot`.
    ///
    /// # Errors
    ///
    /// - `CoreError::ExportFailed` if the process cannot be started
    fn spawn(&self, snapshot: &SnapshotDescriptor) -> CoreResult<ExportProcess>;
}

/// Runs `<program> send <pool>/containers/<container>@snapshot-<name>`.
#[derive(Debug, Clone)]
pub struct ZfsExporter {
    program: PathBuf,
    pool: String,
}

impl ZfsExporter {
    pub fn new(program: impl Into<PathBuf>, pool: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            pool: pool.into(),
        }
    }

    /// Arguments passed after the program name.
    pub fn args(&self, snapshot: &SnapshotDescriptor) -> [String; 2] {
        ["send".to_string(), snapshot.export_path(&self.pool)]
    }
}

impl SnapshotExporter for ZfsExporter {
    fn spawn(&self, snapshot: &SnapshotDescriptor) -> CoreResult<ExportProcess> {
        let args = self.args(snapshot);
        let mut command = Command::new(&self.program);
        command.args(&args);

        let command_line = format!("{} {}", self.program.display(), args.join(" "));
        ExportProcess::spawn(command, command_line)
    }
}

/// A running export process.
///
/// The child is killed if this value is dropped before [`ExportProcess::wait`]
/// completes.
pub struct ExportProcess {
    command_line: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: JoinHandle<std::io::Result<Vec<u8>>>,
}

impl ExportProcess {
    /// Spawn `command` with stdout piped for streaming and stderr captured.
    ///
    /// The environment is inherited unmodified.
    ///
    /// # Errors
    ///
    /// - `CoreError::ExportFailed` if the process cannot be started
    pub fn spawn(mut command: Command, command_line: String) -> CoreResult<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(CoreError::ExportFailed {
                    command: command_line,
                    status: format!("failed to start: {e}"),
                    stderr: String::new(),
                })
            }
        };

        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                stderr.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        });

        Ok(Self {
            command_line,
            child,
            stdout,
            stderr,
        })
    }

    /// Full command line, for diagnostics.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Take the snapshot byte stream. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the process to exit and check its status.
    ///
    /// # Errors
    ///
    /// - `CoreError::ExportFailed` with the captured stderr on non-zero exit
    /// - `CoreError::IoError` if waiting fails
    pub async fn wait(mut self) -> CoreResult<()> {
        self.stdout.take();
        let status = self.child.wait().await?;
        let stderr = collect_stderr(self.stderr).await;
        check_status(self.command_line, status, stderr)
    }

    /// Kill the process after a downstream failure and return what it wrote
    /// to stderr.
    pub async fn abort(mut self) -> String {
        self.stdout.take();
        if let Err(e) = self.child.kill().await {
            tracing::warn!(command = %self.command_line, error = %e, "Failed to kill export process");
        }
        collect_stderr(self.stderr).await
    }
}

async fn collect_stderr(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> String {
    match handle.await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).trim().to_string(),
        Ok(Err(e)) => format!("<stderr unreadable: {e}>"),
        Err(e) => format!("<stderr reader failed: {e}>"),
    }
}

fn check_status(command: String, status: ExitStatus, stderr: String) -> CoreResult<()> {
    if status.success() {
        Ok(())
    } else {
        Err(CoreError::ExportFailed {
            command,
            status: status.to_string(),
            stderr,
        })
    }
}
