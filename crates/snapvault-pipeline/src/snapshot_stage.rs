//! Snapshot stage: one concurrent task per container.
//!
//! Each task submits a snapshot request, waits for it to resolve, and
//! publishes the resulting descriptor on the handoff channel. A container
//! whose snapshot fails is reported and never reaches the transfer stage.
//! The channel closes once every task has been joined.

use std::collections::HashSet;
use std::sync::Arc;

use snapvault_core::{ContainerDescriptor, RunIdentity, SnapshotDescriptor};
use snapvault_provider::SnapshotProvider;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::guarded;
use crate::error::{Phase, PipelineError};
use crate::limiter::ConcurrencyLimiter;
use crate::report::ReportSink;
use crate::HandoffSender;

pub struct SnapshotStage {
    provider: Arc<dyn SnapshotProvider>,
    run: Arc<RunIdentity>,
    limiter: ConcurrencyLimiter,
    reports: ReportSink,
    cancel: CancellationToken,
}

impl SnapshotStage {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        run: Arc<RunIdentity>,
        limiter: ConcurrencyLimiter,
        reports: ReportSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            run,
            limiter,
            reports,
            cancel,
        }
    }

    /// Run the stage on the runtime. See [`SnapshotStage::run`].
    pub fn spawn(
        self,
        containers: Vec<ContainerDescriptor>,
        handoff: HandoffSender,
    ) -> JoinHandle<usize> {
        tokio::spawn(self.run(containers, handoff))
    }

    /// Snapshot every container concurrently and publish each completed
    /// snapshot on `handoff`.
    ///
    /// Returns the number of descriptors published. `handoff` is dropped
    /// only after every task has been joined, which closes the channel once
    /// the per-task clones are gone too.
    pub async fn run(self, containers: Vec<ContainerDescriptor>, handoff: HandoffSender) -> usize {
        let stage = Arc::new(self);
        let mut outstanding: HashSet<String> = HashSet::new();
        let mut tasks = JoinSet::new();

        info!(
            containers = containers.len(),
            snapshot = %stage.run.snapshot_name(),
            max_concurrency = ?stage.limiter.limit(),
            "Starting snapshot stage"
        );

        for container in containers {
            outstanding.insert(container.name.clone());
            let stage = Arc::clone(&stage);
            let handoff = handoff.clone();

            tasks.spawn(async move {
                let published = match stage.snapshot_container(&container.name).await {
                    Ok(snapshot) => stage.publish(snapshot, &handoff),
                    Err(error) => {
                        stage.reports.failed(&container.name, error);
                        false
                    }
                };
                (container.name, published)
            });
        }

        let mut published = 0;
        let mut panics = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((container, was_published)) => {
                    outstanding.remove(&container);
                    if was_published {
                        published += 1;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Snapshot task failed to complete");
                    panics.push(e.to_string());
                }
            }
        }

        // A panicked task never returns its container name, so whatever is
        // still outstanding is what panicked.
        for container in outstanding {
            let message = panics
                .pop()
                .unwrap_or_else(|| "task ended without reporting".to_string());
            stage.reports.failed(
                &container,
                PipelineError::TaskPanicked {
                    phase: Phase::Snapshot,
                    target: container.clone(),
                    message,
                },
            );
        }

        drop(handoff);
        info!(published, "Snapshot stage complete");
        published
    }

    async fn snapshot_container(&self, container: &str) -> Result<SnapshotDescriptor, PipelineError> {
        let _permit = guarded(&self.cancel, Phase::Snapshot, container, self.limiter.acquire()).await?;

        let snapshot_name = self.run.snapshot_name();
        let operation = guarded(
            &self.cancel,
            Phase::Snapshot,
            container,
            self.provider.create_snapshot(container, &snapshot_name),
        )
        .await?
        .map_err(|source| PipelineError::SnapshotCreate {
            container: container.to_string(),
            source,
        })?;
        debug!(container, operation = %operation, "Snapshot requested");

        guarded(
            &self.cancel,
            Phase::Snapshot,
            container,
            self.provider.wait_for_completion(&operation),
        )
        .await?
        .map_err(|source| PipelineError::SnapshotWait {
            container: container.to_string(),
            source,
        })?;

        Ok(self.run.descriptor_for(container))
    }

    fn publish(&self, snapshot: SnapshotDescriptor, handoff: &HandoffSender) -> bool {
        self.reports.snapshot_created(&snapshot);
        match handoff.send(snapshot) {
            Ok(()) => true,
            Err(rejected) => {
                warn!(
                    snapshot = %rejected.0,
                    "Transfer stage is gone; snapshot left in place"
                );
                false
            }
        }
    }
}
