//! Configuration management for snapvault
//!
//! Values are layered, lowest priority first:
//! - Hardcoded defaults
//! - /etc/snapvault/snapvault.{yaml,toml,json}
//! - ./config/snapvault.{yaml,toml,json}
//! - File named by the SNAPVAULT_CONFIG env var
//! - SNAPVAULT__* environment variables
//!
//! The binary applies command-line overrides on top and then calls
//! [`BackupConfig::validate`].

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for one backup pass.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BackupConfig {
    /// Storage pool holding the container datasets (e.g. `tank/lxd`).
    #[serde(default)]
    pub pool: String,

    /// Destination bucket for the compressed snapshot streams.
    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl BackupConfig {
    /// Load configuration from defaults, files and environment.
    ///
    /// Does not validate: required fields may still be supplied on the
    /// command line.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = Self::set_defaults(builder)?;

        builder = builder
            .add_source(File::with_name("/etc/snapvault/snapvault").required(false))
            .add_source(File::with_name("./config/snapvault").required(false));

        if let Ok(config_path) = std::env::var("SNAPVAULT_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        // Example: SNAPVAULT__PIPELINE__MAX_CONCURRENCY=4
        builder = builder.add_source(
            Environment::with_prefix("SNAPVAULT")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from a specific file path on top of the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("export.program", ExportConfig::default().program_str())?
            .set_default("provider.lxc_path", "lxc")?
            .set_default("storage.backend", "s3")?
            .set_default("storage.region", "us-east-1")?
            .set_default("storage.part_size_bytes", DEFAULT_PART_SIZE_BYTES as u64)?
            .set_default("pipeline.max_concurrency", DEFAULT_MAX_CONCURRENCY as u64)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.trim().is_empty() {
            return Err(ConfigError::Message("pool must be specified".to_string()));
        }

        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Message("bucket must be specified".to_string()));
        }

        if self.export.program.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "export.program cannot be empty".to_string(),
            ));
        }

        if self.storage.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigError::Message(format!(
                "storage.part_size_bytes must be >= {MIN_PART_SIZE_BYTES}"
            )));
        }

        if self.storage.backend == StorageBackendKind::Local && self.storage.local_dir.is_none() {
            return Err(ConfigError::Message(
                "storage.local_dir is required for the local backend".to_string(),
            ));
        }

        Ok(())
    }
}

/// Default upper bound on concurrently working tasks per stage. `0` means
/// one task per item with no limit.
pub const DEFAULT_MAX_CONCURRENCY: usize = 0;

/// Default multipart upload part size (8 MiB).
pub const DEFAULT_PART_SIZE_BYTES: usize = 8 * 1024 * 1024;

/// S3 rejects non-final multipart parts smaller than 5 MiB.
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Snapshot export command configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    /// Path of the `zfs` binary used for `zfs send`.
    pub program: PathBuf,
}

impl ExportConfig {
    fn program_str(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/sbin/zfs"),
        }
    }
}

/// Snapshot provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Path or name of the `lxc` client binary.
    pub lxc_path: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            lxc_path: PathBuf::from("lxc"),
        }
    }
}

/// Which object store receives the snapshot streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// AWS S3 or an S3-compatible endpoint.
    #[default]
    S3,
    /// Local directory, one file per object.
    Local,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,

    /// AWS region (e.g., "us-west-2")
    pub region: String,

    /// Optional custom endpoint URL (MinIO, Wasabi, ...)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Optional static access key (custom endpoints only)
    #[serde(default)]
    pub access_key: Option<String>,

    /// Optional static secret key (custom endpoints only)
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Optional prefix prepended to every object key
    #[serde(default)]
    pub prefix: Option<String>,

    /// Base directory for the local backend. The bucket becomes a
    /// subdirectory.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,

    /// Multipart upload part size in bytes
    pub part_size_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::S3,
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: None,
            local_dir: None,
            part_size_bytes: DEFAULT_PART_SIZE_BYTES,
        }
    }
}

/// Pipeline scheduling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Maximum tasks doing work at once in each stage. `0` disables the
    /// limit.
    pub max_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}
