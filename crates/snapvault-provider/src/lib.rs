//! Snapshot provider adapters and the snapshot export runner.

pub mod export;
pub mod lxc;
pub mod mock;
pub mod provider;

pub use export::{ExportProcess, SnapshotExporter, ZfsExporter};
pub use lxc::LxcSnapshotProvider;
pub use mock::{MockSnapshotProvider, ProviderCall, ProviderStep};
pub use provider::{Operation, OperationKind, SnapshotProvider};
