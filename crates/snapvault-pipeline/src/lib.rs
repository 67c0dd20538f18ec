//! Two-stage snapshot-and-ship backup pipeline.
//!
//! The [`SnapshotStage`] snapshots every container concurrently and
//! publishes each completed snapshot on a handoff channel. The
//! [`TransferStage`] consumes descriptors as they arrive, streams each
//! snapshot through the exporter and compressor into object storage, and
//! deletes the local snapshot only once the upload has committed.
//! [`Pipeline`] wires the two together and collects a [`RunReport`].

mod cancel;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod report;
pub mod snapshot_stage;
pub mod transfer_stage;

pub use coordinator::{Pipeline, PipelineBuilder};
pub use error::{Phase, PipelineError};
pub use limiter::ConcurrencyLimiter;
pub use report::{FailureRecord, ReportCollector, ReportEvent, ReportSink, RunReport, UploadSummary};
pub use snapshot_stage::SnapshotStage;
pub use transfer_stage::TransferStage;

/// Sending half of the channel carrying completed snapshots to the
/// transfer stage.
pub type HandoffSender = tokio::sync::mpsc::UnboundedSender<snapvault_core::SnapshotDescriptor>;

/// Receiving half of the handoff channel.
pub type HandoffReceiver = tokio::sync::mpsc::UnboundedReceiver<snapvault_core::SnapshotDescriptor>;
