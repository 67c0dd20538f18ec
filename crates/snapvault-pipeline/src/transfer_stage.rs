//! Transfer stage: export, compress, upload, then delete the local snapshot.
//!
//! Items are processed concurrently as descriptors arrive on the handoff
//! channel. Within one item the steps are strictly sequential, and the
//! local snapshot is only deleted after the remote object has been
//! committed.

use std::collections::HashSet;
use std::sync::Arc;

use snapvault_core::{CoreError, SnapshotDescriptor};
use snapvault_provider::{ExportProcess, SnapshotExporter, SnapshotProvider};
use snapvault_storage::{LzwCompressor, ObjectStore};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cancel::{cancellable, guarded};
use crate::error::{Phase, PipelineError};
use crate::limiter::ConcurrencyLimiter;
use crate::report::ReportSink;
use crate::HandoffReceiver;

/// Size of each read from the export process.
const READ_CHUNK_BYTES: usize = 64 * 1024;

pub struct TransferStage {
    provider: Arc<dyn SnapshotProvider>,
    store: Arc<dyn ObjectStore>,
    exporter: Arc<dyn SnapshotExporter>,
    limiter: ConcurrencyLimiter,
    reports: ReportSink,
    cancel: CancellationToken,
}

enum PumpError {
    Cancelled,
    Failed(CoreError),
}

impl TransferStage {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        store: Arc<dyn ObjectStore>,
        exporter: Arc<dyn SnapshotExporter>,
        limiter: ConcurrencyLimiter,
        reports: ReportSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            store,
            exporter,
            limiter,
            reports,
            cancel,
        }
    }

    /// Spawn one transfer per descriptor as it arrives, until the handoff
    /// channel closes, then join them all.
    ///
    /// Returns the number of items processed.
    pub async fn run(self, mut handoff: HandoffReceiver) -> usize {
        let stage = Arc::new(self);
        let mut outstanding: HashSet<SnapshotDescriptor> = HashSet::new();
        let mut tasks = JoinSet::new();

        while let Some(snapshot) = handoff.recv().await {
            debug!(snapshot = %snapshot, "Received snapshot for transfer");
            outstanding.insert(snapshot.clone());
            let stage = Arc::clone(&stage);
            tasks.spawn(async move {
                stage.transfer(&snapshot).await;
                snapshot
            });
        }

        let mut processed = 0;
        let mut panics = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(snapshot) => {
                    outstanding.remove(&snapshot);
                    processed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Transfer task failed to complete");
                    panics.push(e.to_string());
                }
            }
        }

        for snapshot in outstanding {
            let message = panics
                .pop()
                .unwrap_or_else(|| "task ended without reporting".to_string());
            stage.reports.failed(
                &snapshot.container_name,
                PipelineError::TaskPanicked {
                    phase: Phase::Transfer,
                    target: snapshot.to_string(),
                    message,
                },
            );
        }

        info!(processed, "Transfer stage complete");
        processed
    }

    /// Process one item end to end and report its outcome.
    #[tracing::instrument(
        skip(self, snapshot),
        fields(container = %snapshot.container_name, snapshot = %snapshot.snapshot_name)
    )]
    pub async fn transfer(&self, snapshot: &SnapshotDescriptor) {
        let container = snapshot.container_name.as_str();
        let target = snapshot.to_string();

        let _permit =
            match guarded(&self.cancel, Phase::Transfer, &target, self.limiter.acquire()).await {
                Ok(permit) => permit,
                Err(error) => {
                    self.reports.failed(container, error);
                    return;
                }
            };

        match self.upload(snapshot).await {
            Ok((bytes_in, bytes_out)) => self.reports.uploaded(snapshot, bytes_in, bytes_out),
            Err(error) => {
                // The snapshot stays in place so the export can be retried.
                self.reports.failed(container, error);
                return;
            }
        }

        match self.cleanup(snapshot).await {
            Ok(()) => self.reports.cleaned(snapshot),
            Err(error) => self.reports.failed(container, error),
        }
    }

    /// Stream the snapshot into a committed remote object.
    ///
    /// Returns `(bytes_in, bytes_out)`.
    async fn upload(&self, snapshot: &SnapshotDescriptor) -> Result<(u64, u64), PipelineError> {
        let key = snapshot.object_key();
        let target = snapshot.to_string();
        let export_error = |source| PipelineError::Export {
            snapshot: target.clone(),
            source,
        };

        let sink = guarded(&self.cancel, Phase::Transfer, &target, self.store.open_sink(&key))
            .await?
            .map_err(|source| PipelineError::SinkOpen {
                key: key.clone(),
                source,
            })?;
        let mut compressor = LzwCompressor::new(sink);

        let mut process = self.exporter.spawn(snapshot).map_err(export_error)?;
        debug!(command = process.command_line(), "Export started");

        if let Err(e) = self.pump(&mut process, &mut compressor).await {
            let command = process.command_line().to_string();
            let stderr = process.abort().await;
            return Err(match e {
                PumpError::Cancelled => PipelineError::Cancelled {
                    phase: Phase::Transfer,
                    target: target.clone(),
                },
                PumpError::Failed(cause) => export_error(CoreError::ExportFailed {
                    command,
                    status: format!("stream interrupted: {cause}"),
                    stderr,
                }),
            });
        }

        guarded(&self.cancel, Phase::Transfer, &target, process.wait())
            .await?
            .map_err(export_error)?;
        info!(bytes_in = compressor.bytes_in(), "Export successful");

        let bytes_in = compressor.bytes_in();
        let sink = guarded(&self.cancel, Phase::Transfer, &target, compressor.finish())
            .await?
            .map_err(|source| PipelineError::CompressFinalize {
                snapshot: target.clone(),
                source,
            })?;

        let bytes_out = sink.bytes_written();
        guarded(&self.cancel, Phase::Transfer, &target, sink.close())
            .await?
            .map_err(|source| PipelineError::SinkClose { key, source })?;

        Ok((bytes_in, bytes_out))
    }

    /// Copy the export's stdout into the compressor until EOF.
    async fn pump(
        &self,
        process: &mut ExportProcess,
        compressor: &mut LzwCompressor,
    ) -> Result<(), PumpError> {
        let mut stdout = process.take_stdout().ok_or_else(|| {
            PumpError::Failed(CoreError::internal("export stdout was not captured"))
        })?;
        let mut buf = vec![0u8; READ_CHUNK_BYTES];

        loop {
            let n = cancellable(&self.cancel, stdout.read(&mut buf))
                .await
                .ok_or(PumpError::Cancelled)?
                .map_err(|e| PumpError::Failed(e.into()))?;
            if n == 0 {
                return Ok(());
            }

            cancellable(&self.cancel, compressor.write(&buf[..n]))
                .await
                .ok_or(PumpError::Cancelled)?
                .map_err(PumpError::Failed)?;
        }
    }

    /// Delete the local snapshot. Only called after a committed upload.
    async fn cleanup(&self, snapshot: &SnapshotDescriptor) -> Result<(), PipelineError> {
        let key = snapshot.snapshot_key();

        let operation = guarded(
            &self.cancel,
            Phase::Cleanup,
            &key,
            self.provider.delete_snapshot(&key),
        )
        .await?
        .map_err(|source| PipelineError::DeleteSubmit {
            snapshot: key.clone(),
            source,
        })?;

        guarded(
            &self.cancel,
            Phase::Cleanup,
            &key,
            self.provider.wait_for_completion(&operation),
        )
        .await?
        .map_err(|source| PipelineError::DeleteWait {
            snapshot: key.clone(),
            source,
        })
    }
}
