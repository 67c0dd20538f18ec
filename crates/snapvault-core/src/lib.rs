//! Core domain types shared by the snapvault crates.

pub mod config;
pub mod error;
pub mod run;

pub use config::{
    BackupConfig, ExportConfig, PipelineConfig, ProviderConfig, StorageBackendKind, StorageConfig,
};
pub use error::{CoreError, CoreResult};
pub use run::{ContainerDescriptor, RunIdentity, SnapshotDescriptor};
