//! Pipeline coordinator.
//!
//! Wires the snapshot stage to the transfer stage through the handoff
//! channel, waits for both to finish, and turns the collected report events
//! into a [`RunReport`].

use std::sync::Arc;

use snapvault_core::{ContainerDescriptor, CoreError, CoreResult, PipelineConfig, RunIdentity};
use snapvault_provider::{SnapshotExporter, SnapshotProvider};
use snapvault_storage::ObjectStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::limiter::ConcurrencyLimiter;
use crate::report::{ReportSink, RunReport};
use crate::snapshot_stage::SnapshotStage;
use crate::transfer_stage::TransferStage;

/// One backup run over a set of containers.
pub struct Pipeline {
    provider: Arc<dyn SnapshotProvider>,
    store: Arc<dyn ObjectStore>,
    exporter: Arc<dyn SnapshotExporter>,
    run: Arc<RunIdentity>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    provider: Option<Arc<dyn SnapshotProvider>>,
    store: Option<Arc<dyn ObjectStore>>,
    exporter: Option<Arc<dyn SnapshotExporter>>,
    run: Option<RunIdentity>,
    config: PipelineConfig,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn SnapshotExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Identity shared by every snapshot of the run.
    pub fn run_identity(mut self, run: RunIdentity) -> Self {
        self.run = Some(run);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that aborts the run when cancelled. A fresh token is used if
    /// none is given.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// # Errors
    ///
    /// - `CoreError::ValidationError` if an adapter or the run identity is
    ///   missing
    pub fn build(self) -> CoreResult<Pipeline> {
        let missing = |what: &str| CoreError::ValidationError(format!("pipeline {what} not set"));

        Ok(Pipeline {
            provider: self.provider.ok_or_else(|| missing("snapshot provider"))?,
            store: self.store.ok_or_else(|| missing("object store"))?,
            exporter: self.exporter.ok_or_else(|| missing("exporter"))?,
            run: Arc::new(self.run.ok_or_else(|| missing("run identity"))?),
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn run_identity(&self) -> &RunIdentity {
        &self.run
    }

    /// Token that aborts this run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enumerate containers and back up all of them.
    ///
    /// # Errors
    ///
    /// Returns the provider error if containers cannot be enumerated; no
    /// stage is started in that case. Per-container failures are reported
    /// in the returned [`RunReport`], never as `Err`.
    pub async fn execute(&self) -> CoreResult<RunReport> {
        let containers = self.provider.list_containers().await?;
        info!(count = containers.len(), "Enumerated containers");
        Ok(self.run(containers).await)
    }

    /// Back up `containers`.
    ///
    /// Transfers start as soon as each snapshot completes, while other
    /// snapshots may still be in progress. Returns once every item has
    /// reached a final state.
    pub async fn run(&self, containers: Vec<ContainerDescriptor>) -> RunReport {
        let container_count = containers.len();
        let (reports, collector) = ReportSink::channel();
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();

        info!(
            run = %self.run,
            containers = container_count,
            max_concurrency = self.config.max_concurrency,
            "Starting backup run"
        );

        let snapshots = SnapshotStage::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.run),
            ConcurrencyLimiter::new(self.config.max_concurrency),
            reports.clone(),
            self.cancel.clone(),
        )
        .spawn(containers, handoff_tx);

        let transfers = TransferStage::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            Arc::clone(&self.exporter),
            ConcurrencyLimiter::new(self.config.max_concurrency),
            reports,
            self.cancel.clone(),
        );
        let processed = transfers.run(handoff_rx).await;

        match snapshots.await {
            Ok(published) => info!(published, processed, "Both stages finished"),
            Err(e) => error!(error = %e, "Snapshot stage did not finish cleanly"),
        }

        let report = collector.drain(self.run.snapshot_name(), container_count);
        info!(
            uploaded = report.uploaded.len(),
            cleaned = report.cleaned.len(),
            failed = report.failures.len(),
            "Backup run complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_provider::{MockSnapshotProvider, ProviderStep, ZfsExporter};
    use snapvault_storage::MockS3ObjectStore;

    fn builder(provider: MockSnapshotProvider) -> PipelineBuilder {
        Pipeline::builder()
            .provider(Arc::new(provider))
            .store(Arc::new(MockS3ObjectStore::new()))
            .exporter(Arc::new(ZfsExporter::new("true", "tank")))
    }

    #[test]
    fn test_build_requires_run_identity() {
        let result = builder(MockSnapshotProvider::new()).build();
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn test_build_with_defaults() {
        let pipeline = builder(MockSnapshotProvider::new())
            .run_identity(RunIdentity::new("20240102-030405", 3))
            .build()
            .unwrap();
        assert_eq!(pipeline.run_identity().snapshot_name(), "backup-20240102-030405-3");
        assert!(!pipeline.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_enumeration_failure_starts_nothing() {
        let provider = MockSnapshotProvider::with_containers(["web"]);
        provider.fail_on(ProviderStep::List, "", "connection refused");

        let pipeline = builder(provider.clone())
            .run_identity(RunIdentity::new("20240102-030405", 3))
            .build()
            .unwrap();

        assert!(pipeline.execute().await.is_err());
        assert!(provider.calls_for(ProviderStep::CreateSubmit).is_empty());
    }

    #[tokio::test]
    async fn test_empty_run() {
        let pipeline = builder(MockSnapshotProvider::new())
            .run_identity(RunIdentity::new("20240102-030405", 3))
            .build()
            .unwrap();

        let report = pipeline.execute().await.unwrap();
        assert_eq!(report.containers, 0);
        assert!(report.is_clean());
    }
}
