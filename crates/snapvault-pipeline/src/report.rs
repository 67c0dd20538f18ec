//! Per-item outcome reporting.
//!
//! Tasks log each outcome as it happens and push a [`ReportEvent`] onto a
//! shared channel. The coordinator drains the channel after every task has
//! been joined, so the final [`RunReport`] is assembled in one place.

use snapvault_core::SnapshotDescriptor;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{Phase, PipelineError};

/// Outcome of one step of one item.
#[derive(Debug)]
pub enum ReportEvent {
    /// The snapshot completed and was handed to the transfer stage.
    SnapshotCreated(SnapshotDescriptor),
    /// The remote object was committed.
    Uploaded(UploadSummary),
    /// The local snapshot was deleted after upload.
    Cleaned(SnapshotDescriptor),
    /// An item failed.
    Failed(FailureRecord),
}

/// A committed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub snapshot: SnapshotDescriptor,
    /// Bytes read from the export stream.
    pub bytes_in: u64,
    /// Compressed bytes written to the remote object.
    pub bytes_out: u64,
}

/// A failed item.
#[derive(Debug)]
pub struct FailureRecord {
    pub container: String,
    pub error: PipelineError,
}

/// Sending side of the report channel. Cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct ReportSink {
    tx: mpsc::UnboundedSender<ReportEvent>,
}

/// Receiving side of the report channel, held by the coordinator.
#[derive(Debug)]
pub struct ReportCollector {
    rx: mpsc::UnboundedReceiver<ReportEvent>,
}

impl ReportSink {
    /// Create a connected sink and collector.
    pub fn channel() -> (ReportSink, ReportCollector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReportSink { tx }, ReportCollector { rx })
    }

    pub fn snapshot_created(&self, snapshot: &SnapshotDescriptor) {
        info!(
            container = %snapshot.container_name,
            snapshot = %snapshot.snapshot_name,
            "Snapshot created"
        );
        self.send(ReportEvent::SnapshotCreated(snapshot.clone()));
    }

    pub fn uploaded(&self, snapshot: &SnapshotDescriptor, bytes_in: u64, bytes_out: u64) {
        info!(
            container = %snapshot.container_name,
            snapshot = %snapshot.snapshot_name,
            bytes_in,
            bytes_out,
            "Upload committed"
        );
        self.send(ReportEvent::Uploaded(UploadSummary {
            snapshot: snapshot.clone(),
            bytes_in,
            bytes_out,
        }));
    }

    pub fn cleaned(&self, snapshot: &SnapshotDescriptor) {
        info!(
            container = %snapshot.container_name,
            snapshot = %snapshot.snapshot_name,
            "Local snapshot deleted"
        );
        self.send(ReportEvent::Cleaned(snapshot.clone()));
    }

    /// Record a failed item. Cleanup failures are logged as warnings since
    /// the remote copy already exists.
    pub fn failed(&self, container: &str, error: PipelineError) {
        match error.phase() {
            Phase::Cleanup => warn!(container, phase = %error.phase(), error = %error, "Item failed"),
            _ => error!(container, phase = %error.phase(), error = %error, "Item failed"),
        }
        self.send(ReportEvent::Failed(FailureRecord {
            container: container.to_string(),
            error,
        }));
    }

    fn send(&self, event: ReportEvent) {
        // The collector outlives every task; a closed channel only happens
        // during shutdown, where dropping the event is fine.
        let _ = self.tx.send(event);
    }
}

impl ReportCollector {
    /// Drain every event sent so far into a report.
    ///
    /// Call after all tasks holding a [`ReportSink`] have been joined.
    pub fn drain(mut self, snapshot_name: impl Into<String>, containers: usize) -> RunReport {
        let mut report = RunReport {
            snapshot_name: snapshot_name.into(),
            containers,
            ..RunReport::default()
        };

        while let Ok(event) = self.rx.try_recv() {
            match event {
                ReportEvent::SnapshotCreated(snapshot) => report.snapshots_created.push(snapshot),
                ReportEvent::Uploaded(upload) => report.uploaded.push(upload),
                ReportEvent::Cleaned(snapshot) => report.cleaned.push(snapshot),
                ReportEvent::Failed(failure) => report.failures.push(failure),
            }
        }

        report
    }
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Snapshot name shared by every container in the run.
    pub snapshot_name: String,
    /// Number of containers the run was started with.
    pub containers: usize,
    pub snapshots_created: Vec<SnapshotDescriptor>,
    pub uploaded: Vec<UploadSummary>,
    pub cleaned: Vec<SnapshotDescriptor>,
    pub failures: Vec<FailureRecord>,
}

impl RunReport {
    /// True when every container was snapshotted, uploaded and cleaned.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.cleaned.len() == self.containers
    }

    /// Failures that happened in `phase`.
    pub fn failures_in(&self, phase: Phase) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(move |f| f.error.phase() == phase)
    }

    /// Failure recorded for `container`, if any.
    pub fn failure_for(&self, container: &str) -> Option<&FailureRecord> {
        self.failures.iter().find(|f| f.container == container)
    }

    /// Whether the upload for `container` committed.
    pub fn was_uploaded(&self, container: &str) -> bool {
        self.uploaded
            .iter()
            .any(|u| u.snapshot.container_name == container)
    }

    /// Snapshots created by this run that are still present locally.
    pub fn retained_snapshots(&self) -> Vec<&SnapshotDescriptor> {
        self.snapshots_created
            .iter()
            .filter(|s| !self.cleaned.contains(s))
            .collect()
    }

    /// Total compressed bytes uploaded.
    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded.iter().map(|u| u.bytes_out).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_core::{CoreError, RunIdentity};

    #[test]
    fn test_drain_collects_all_events() {
        let run = RunIdentity::new("20240102-030405", 1);
        let (sink, collector) = ReportSink::channel();

        let web = run.descriptor_for("web");
        let db = run.descriptor_for("db");
        sink.snapshot_created(&web);
        sink.snapshot_created(&db);
        sink.uploaded(&web, 100, 40);
        sink.cleaned(&web);
        sink.failed(
            "db",
            PipelineError::SinkClose {
                key: db.object_key(),
                source: CoreError::StorageError("rejected".to_string()),
            },
        );

        let report = collector.drain(run.snapshot_name(), 2);
        assert_eq!(report.snapshot_name, "backup-20240102-030405-1");
        assert_eq!(report.snapshots_created.len(), 2);
        assert!(report.was_uploaded("web"));
        assert!(!report.was_uploaded("db"));
        assert_eq!(report.retained_snapshots(), vec![&db]);
        assert_eq!(report.failures_in(Phase::Transfer).count(), 1);
        assert_eq!(report.bytes_uploaded(), 40);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_clean_run() {
        let run = RunIdentity::new("20240102-030405", 1);
        let (sink, collector) = ReportSink::channel();
        let web = run.descriptor_for("web");
        sink.snapshot_created(&web);
        sink.uploaded(&web, 10, 8);
        sink.cleaned(&web);

        let report = collector.drain(run.snapshot_name(), 1);
        assert!(report.is_clean());
        assert!(report.retained_snapshots().is_empty());
        assert!(report.failure_for("web").is_none());
    }

    #[test]
    fn test_sink_survives_dropped_collector() {
        let (sink, collector) = ReportSink::channel();
        drop(collector);
        sink.cleaned(&RunIdentity::new("t", 1).descriptor_for("web"));
    }
}
