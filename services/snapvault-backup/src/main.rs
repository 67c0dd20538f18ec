use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};
use snapvault_core::{BackupConfig, RunIdentity, StorageBackendKind};
use snapvault_pipeline::{Pipeline, RunReport};
use snapvault_provider::{LxcSnapshotProvider, ZfsExporter};
use snapvault_storage::{LocalObjectStore, ObjectStore, S3Config, S3ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "snapvault-backup")]
#[command(about = "Snapshot every container and ship the streams to object storage", long_about = None)]
#[command(version)]
struct Cli {
    /// Storage pool holding the container datasets (e.g. tank/lxd)
    #[arg(long)]
    pool: Option<String>,

    /// Destination bucket
    #[arg(long)]
    bucket: Option<String>,

    /// Configuration file (overrides the default search paths)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path of the zfs binary
    #[arg(long)]
    zfs_path: Option<PathBuf>,

    /// Path of the lxc client
    #[arg(long)]
    lxc_path: Option<PathBuf>,

    /// Maximum concurrent tasks per stage (0 = unlimited)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Object storage backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Base directory for the local backend
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// S3 region
    #[arg(long, env = "SNAPVAULT_S3_REGION")]
    region: Option<String>,

    /// S3-compatible endpoint (MinIO, Wasabi, ...)
    #[arg(long, env = "SNAPVAULT_S3_ENDPOINT")]
    endpoint: Option<String>,

    /// Prefix prepended to every object key
    #[arg(long)]
    prefix: Option<String>,

    /// S3 access key
    #[arg(long, env = "SNAPVAULT_S3_ACCESS_KEY", hide_env_values = true)]
    s3_access_key: Option<String>,

    /// S3 secret key
    #[arg(long, env = "SNAPVAULT_S3_SECRET_KEY", hide_env_values = true)]
    s3_secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    S3,
    Local,
}

impl From<Backend> for StorageBackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::S3 => StorageBackendKind::S3,
            Backend::Local => StorageBackendKind::Local,
        }
    }
}

impl Cli {
    /// Command-line values win over file and environment configuration.
    fn apply_to(self, config: &mut BackupConfig) {
        if let Some(pool) = self.pool {
            config.pool = pool;
        }
        if let Some(bucket) = self.bucket {
            config.bucket = bucket;
        }
        if let Some(program) = self.zfs_path {
            config.export.program = program;
        }
        if let Some(lxc_path) = self.lxc_path {
            config.provider.lxc_path = lxc_path;
        }
        if let Some(max) = self.max_concurrency {
            config.pipeline.max_concurrency = max;
        }
        if let Some(backend) = self.backend {
            config.storage.backend = backend.into();
        }
        if self.local_dir.is_some() {
            config.storage.local_dir = self.local_dir;
        }
        if let Some(region) = self.region {
            config.storage.region = region;
        }
        if self.endpoint.is_some() {
            config.storage.endpoint = self.endpoint;
        }
        if self.prefix.is_some() {
            config.storage.prefix = self.prefix;
        }
        if self.s3_access_key.is_some() {
            config.storage.access_key = self.s3_access_key;
        }
        if self.s3_secret_key.is_some() {
            config.storage.secret_key = self.s3_secret_key;
        }
    }
}

/// Result of merging loaded configuration with the command line.
#[derive(Debug)]
enum Startup {
    Ready(BackupConfig),
    /// Pool or bucket is still missing; exit with the usage message.
    Usage,
}

/// Apply `args` on top of `loaded`.
///
/// When either required flag is absent, a configuration load error yields
/// [`Startup::Usage`] instead of the error.
fn resolve_config<E: std::fmt::Display>(
    args: Cli,
    loaded: Result<BackupConfig, E>,
) -> Result<Startup, E> {
    let flags_missing = args.pool.is_none() || args.bucket.is_none();
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) if flags_missing => {
            warn!(error = %e, "Configuration could not be loaded");
            return Ok(Startup::Usage);
        }
        Err(e) => return Err(e),
    };
    args.apply_to(&mut config);

    if config.pool.trim().is_empty() || config.bucket.trim().is_empty() {
        return Ok(Startup::Usage);
    }
    Ok(Startup::Ready(config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Cli::parse();
    let loaded = match &args.config {
        Some(path) => BackupConfig::from_file(path),
        None => BackupConfig::load(),
    };

    let config = match resolve_config(args, loaded)? {
        Startup::Ready(config) => config,
        Startup::Usage => Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "both --pool <POOL> and --bucket <BUCKET> are required",
            )
            .exit(),
    };
    config.validate()?;

    let run = RunIdentity::generate()?;
    info!(
        run = %run,
        pool = %config.pool,
        bucket = %config.bucket,
        backend = ?config.storage.backend,
        "Starting snapvault backup"
    );

    let store = build_store(&config).await?;
    let provider = Arc::new(LxcSnapshotProvider::new(&config.provider.lxc_path));
    let exporter = Arc::new(ZfsExporter::new(&config.export.program, &config.pool));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling backup run");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::builder()
        .provider(provider)
        .store(store)
        .exporter(exporter)
        .run_identity(run)
        .config(config.pipeline.clone())
        .cancellation(cancel)
        .build()?;

    let report = pipeline.execute().await?;
    print_summary(&config, &report);

    Ok(())
}

/// Build the object store selected by the configuration.
async fn build_store(
    config: &BackupConfig,
) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error>> {
    let storage = &config.storage;

    match storage.backend {
        StorageBackendKind::S3 => {
            let mut s3 = S3Config::aws(&config.bucket, &storage.region)
                .with_part_size(storage.part_size_bytes);
            s3.endpoint = storage.endpoint.clone();
            s3.access_key = storage.access_key.clone();
            s3.secret_key = storage.secret_key.clone();
            if let Some(prefix) = &storage.prefix {
                s3 = s3.with_prefix(prefix);
            }
            Ok(Arc::new(S3ObjectStore::new(s3).await?))
        }
        StorageBackendKind::Local => {
            let base = storage
                .local_dir
                .as_ref()
                .ok_or("storage.local_dir is required for the local backend")?;
            let mut dir = base.join(&config.bucket);
            if let Some(prefix) = &storage.prefix {
                dir = dir.join(prefix);
            }
            Ok(Arc::new(LocalObjectStore::new(dir).await?))
        }
    }
}

fn print_summary(config: &BackupConfig, report: &RunReport) {
    for upload in &report.uploaded {
        println!(
            "uploaded {} to {}/{} ({} bytes compressed from {})",
            upload.snapshot.container_name,
            config.bucket,
            upload.snapshot.object_key(),
            upload.bytes_out,
            upload.bytes_in
        );
    }
    for failure in &report.failures {
        eprintln!("{} failed: {}", failure.container, failure.error);
    }

    println!("\nBackup run {} complete", report.snapshot_name);
    println!("  Containers:        {}", report.containers);
    println!("  Snapshots created: {}", report.snapshots_created.len());
    println!("  Uploaded:          {}", report.uploaded.len());
    println!("  Cleaned up:        {}", report.cleaned.len());
    println!("  Failed:            {}", report.failures.len());

    let retained = report.retained_snapshots();
    if !retained.is_empty() {
        println!("  Snapshots kept locally:");
        for snapshot in retained {
            println!("    {}", snapshot.snapshot_key());
        }
    }
}

/// Initialize logging
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_configuration() {
        let cli = Cli::try_parse_from([
            "snapvault-backup",
            "--pool",
            "tank/lxd",
            "--bucket",
            "nightly",
            "--max-concurrency",
            "0",
            "--backend",
            "local",
            "--local-dir",
            "/var/backups",
            "--zfs-path",
            "/usr/sbin/zfs",
        ])
        .unwrap();

        let mut config = BackupConfig::default();
        cli.apply_to(&mut config);

        assert_eq!(config.pool, "tank/lxd");
        assert_eq!(config.bucket, "nightly");
        assert_eq!(config.pipeline.max_concurrency, 0);
        assert_eq!(config.storage.backend, StorageBackendKind::Local);
        assert_eq!(config.storage.local_dir, Some(PathBuf::from("/var/backups")));
        assert_eq!(config.export.program, PathBuf::from("/usr/sbin/zfs"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unset_flags_keep_configuration() {
        let cli = Cli::try_parse_from(["snapvault-backup"]).unwrap();
        let mut config = BackupConfig {
            pool: "tank".to_string(),
            bucket: "from-file".to_string(),
            ..BackupConfig::default()
        };
        cli.apply_to(&mut config);

        assert_eq!(config.bucket, "from-file");
        assert_eq!(config.pipeline.max_concurrency, 0);
    }

    fn malformed() -> Result<BackupConfig, String> {
        Err("invalid type: sequence, expected a string for key `pool`".to_string())
    }

    #[test]
    fn test_missing_flags_take_precedence_over_config_error() {
        let cli = Cli::try_parse_from(["snapvault-backup"]).unwrap();
        assert!(matches!(resolve_config(cli, malformed()), Ok(Startup::Usage)));

        let cli = Cli::try_parse_from(["snapvault-backup", "--pool", "tank/lxd"]).unwrap();
        assert!(matches!(resolve_config(cli, malformed()), Ok(Startup::Usage)));
    }

    #[test]
    fn test_config_error_reported_when_flags_given() {
        let cli =
            Cli::try_parse_from(["snapvault-backup", "--pool", "tank/lxd", "--bucket", "nightly"])
                .unwrap();
        let err = resolve_config(cli, malformed()).unwrap_err();
        assert!(err.contains("pool"));
    }

    #[test]
    fn test_resolve_config_applies_flags() {
        let cli = Cli::try_parse_from(["snapvault-backup", "--bucket", "nightly"]).unwrap();
        let loaded = Ok::<_, String>(BackupConfig {
            pool: "tank".to_string(),
            ..BackupConfig::default()
        });

        match resolve_config(cli, loaded).unwrap() {
            Startup::Ready(config) => {
                assert_eq!(config.pool, "tank");
                assert_eq!(config.bucket, "nightly");
            }
            Startup::Usage => panic!("pool and bucket were both supplied"),
        }

        let cli = Cli::try_parse_from(["snapvault-backup", "--pool", "tank"]).unwrap();
        let loaded = Ok::<_, String>(BackupConfig::default());
        assert!(matches!(resolve_config(cli, loaded), Ok(Startup::Usage)));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result = Cli::try_parse_from(["snapvault-backup", "--backend", "ftp"]);
        assert!(result.is_err());
    }
}
