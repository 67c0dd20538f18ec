//! End-to-end pipeline scenarios against the in-memory provider and store.
//!
//! The exporter runs a small `sh` script per container, so the export path
//! goes through a real child process and pipe.

#![cfg(unix)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use snapvault_core::{
    ContainerDescriptor, CoreResult, PipelineConfig, RunIdentity, SnapshotDescriptor,
};
use snapvault_pipeline::{Phase, Pipeline, PipelineError, RunReport};
use snapvault_provider::{ExportProcess, MockSnapshotProvider, ProviderStep, SnapshotExporter};
use snapvault_storage::compression::decompress;
use snapvault_storage::object_store::{MockFailure, MockOperation};
use snapvault_storage::{LocalObjectStore, MockS3ObjectStore, ObjectReader, ObjectStore};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const POOL: &str = "tank/lxd";

/// Exporter that prints a deterministic payload, or fails for chosen
/// containers the way `zfs send` does for a missing dataset. Containers in
/// `silent` export successfully with no output.
#[derive(Default)]
struct ScriptedExporter {
    failing: HashSet<String>,
    silent: HashSet<String>,
}

impl ScriptedExporter {
    fn failing(containers: &[&str]) -> Self {
        Self {
            failing: containers.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    fn silent(containers: &[&str]) -> Self {
        Self {
            silent: containers.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }
}

fn payload(snapshot: &SnapshotDescriptor) -> String {
    format!("stream:{}\n", snapshot.export_path(POOL)).repeat(64)
}

impl SnapshotExporter for ScriptedExporter {
    fn spawn(&self, snapshot: &SnapshotDescriptor) -> CoreResult<ExportProcess> {
        let script = if self.failing.contains(&snapshot.container_name) {
            "echo 'cannot open dataset: dataset does not exist' >&2; exit 1"
        } else if self.silent.contains(&snapshot.container_name) {
            "true"
        } else {
            "printf '%s' \"$1\""
        };

        let mut command = Command::new("sh");
        command.args(["-c", script, "export", &payload(snapshot)]);
        ExportProcess::spawn(command, format!("sh -c <export {}>", snapshot))
    }
}

fn run_identity() -> RunIdentity {
    RunIdentity::new("20240102-030405", 8675309)
}

fn containers(names: &[&str]) -> Vec<ContainerDescriptor> {
    names.iter().map(|n| ContainerDescriptor::new(*n)).collect()
}

fn pipeline(
    provider: &MockSnapshotProvider,
    store: Arc<dyn ObjectStore>,
    exporter: ScriptedExporter,
    max_concurrency: usize,
) -> Pipeline {
    Pipeline::builder()
        .provider(Arc::new(provider.clone()))
        .store(store)
        .exporter(Arc::new(exporter))
        .run_identity(run_identity())
        .config(PipelineConfig { max_concurrency })
        .build()
        .unwrap()
}

async fn assert_object_matches(store: &dyn ObjectReader, container: &str) {
    let snapshot = run_identity().descriptor_for(container);
    let stored = store.get(&snapshot.object_key()).await.unwrap();
    let decoded = decompress(&stored).unwrap();
    assert_eq!(decoded.as_ref(), payload(&snapshot).as_bytes());
}

fn key(container: &str) -> String {
    run_identity().descriptor_for(container).object_key()
}

fn failure<'a>(report: &'a RunReport, container: &str) -> &'a PipelineError {
    &report
        .failure_for(container)
        .unwrap_or_else(|| panic!("expected a failure for {container}"))
        .error
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_steps_succeed() {
    let provider = MockSnapshotProvider::with_containers(["c1", "c2", "c3"]);
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(&provider, Arc::new(store.clone()), ScriptedExporter::default(), 8);

    let report = pipeline.execute().await.unwrap();

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert_eq!(
        store.keys(),
        vec![
            "c1/backup-20240102-030405-8675309".to_string(),
            "c2/backup-20240102-030405-8675309".to_string(),
            "c3/backup-20240102-030405-8675309".to_string(),
        ]
    );
    for container in ["c1", "c2", "c3"] {
        assert_object_matches(&store, container).await;
    }
    assert!(provider.snapshots().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_export_keeps_local_snapshot() {
    let provider = MockSnapshotProvider::with_containers(["c1", "c2", "c3"]);
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(
        &provider,
        Arc::new(store.clone()),
        ScriptedExporter::failing(&["c2"]),
        8,
    );

    let report = pipeline.execute().await.unwrap();

    assert!(!store.contains_key(&key("c2")));
    assert!(provider.snapshot_exists(&key("c2")));
    match failure(&report, "c2") {
        PipelineError::Export { source, .. } => {
            let message = source.to_string();
            assert!(message.contains("cannot open dataset"), "{message}");
        }
        other => panic!("expected export failure, got {other:?}"),
    }

    for container in ["c1", "c3"] {
        assert_object_matches(&store, container).await;
        assert!(!provider.snapshot_exists(&key(container)));
    }
    assert_eq!(report.cleaned.len(), 2);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_failure_never_reaches_transfer() {
    let provider = MockSnapshotProvider::with_containers(["c1", "c2", "c3"]);
    provider.fail_on(ProviderStep::CreateSubmit, "c1", "storage pool is full");
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(&provider, Arc::new(store.clone()), ScriptedExporter::default(), 8);

    let report = pipeline.execute().await.unwrap();

    assert!(matches!(
        failure(&report, "c1"),
        PipelineError::SnapshotCreate { .. }
    ));
    assert!(report
        .snapshots_created
        .iter()
        .all(|s| s.container_name != "c1"));
    assert!(store
        .get_call_history()
        .iter()
        .all(|call| !call.key.starts_with("c1/")));
    assert!(provider
        .calls_for(ProviderStep::CreateWait)
        .iter()
        .all(|call| !call.target.starts_with("c1/")));

    assert_eq!(report.cleaned.len(), 2);
    for container in ["c2", "c3"] {
        assert_object_matches(&store, container).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_delete_keeps_upload() {
    let provider = MockSnapshotProvider::with_containers(["c1", "c2", "c3"]);
    provider.fail_on(ProviderStep::DeleteWait, "c3", "device or resource busy");
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(&provider, Arc::new(store.clone()), ScriptedExporter::default(), 8);

    let report = pipeline.execute().await.unwrap();

    assert_object_matches(&store, "c3").await;
    assert!(provider.snapshot_exists(&key("c3")));
    assert!(report.was_uploaded("c3"));

    let error = failure(&report, "c3");
    assert!(matches!(error, PipelineError::DeleteWait { .. }));
    assert_eq!(error.phase(), Phase::Cleanup);
    assert!(error.upload_committed());

    assert_eq!(report.uploaded.len(), 3);
    assert_eq!(report.retained_snapshots().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_completed_snapshots_are_published() {
    let names = ["a", "b", "c", "d", "e"];
    let provider = MockSnapshotProvider::with_containers(names);
    provider.fail_on(ProviderStep::CreateSubmit, "b", "rejected");
    provider.fail_on(ProviderStep::CreateWait, "d", "timed out");
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(&provider, Arc::new(store.clone()), ScriptedExporter::default(), 2);

    let report = pipeline.run(containers(&names)).await;

    let mut created: Vec<_> = report
        .snapshots_created
        .iter()
        .map(|s| s.container_name.as_str())
        .collect();
    created.sort();
    assert_eq!(created, vec!["a", "c", "e"]);
    assert_eq!(store.storage_size(), 3);
    assert_eq!(report.failures_in(Phase::Snapshot).count(), 2);
}

#[tokio::test]
async fn test_run_shares_one_snapshot_name() {
    let provider = MockSnapshotProvider::with_containers(["web", "db"]);
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(&provider, Arc::new(store.clone()), ScriptedExporter::default(), 8);

    let report = pipeline.execute().await.unwrap();

    let names: HashSet<_> = report
        .snapshots_created
        .iter()
        .map(|s| s.snapshot_name.clone())
        .collect();
    assert_eq!(names.len(), 1);
    assert_eq!(report.snapshot_name, "backup-20240102-030405-8675309");
    assert!(names.contains(&report.snapshot_name));
}

#[test]
fn test_separate_runs_get_distinct_names() {
    let first = RunIdentity::generate().unwrap();
    let second = RunIdentity::generate().unwrap();
    assert_ne!(first.snapshot_name(), second.snapshot_name());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_happens_only_after_commit() {
    let names = ["c1", "c2", "c3", "c4"];
    let provider = MockSnapshotProvider::with_containers(names);
    let store = MockS3ObjectStore::new();
    store.fail_on(MockOperation::Close, "c2/", MockFailure::Permanent("403 Forbidden"));
    store.fail_on(MockOperation::OpenSink, "c4/", MockFailure::Transient("503 Slow Down"));
    let pipeline = pipeline(
        &provider,
        Arc::new(store.clone()),
        ScriptedExporter::failing(&["c3"]),
        8,
    );

    let report = pipeline.execute().await.unwrap();

    let deleted: HashSet<String> = provider
        .calls_for(ProviderStep::DeleteSubmit)
        .into_iter()
        .map(|call| call.target)
        .collect();
    let committed: HashSet<String> = store.keys().into_iter().collect();
    assert_eq!(deleted, committed);
    assert_eq!(committed, HashSet::from([key("c1")]));

    assert!(matches!(failure(&report, "c2"), PipelineError::SinkClose { .. }));
    assert!(matches!(failure(&report, "c3"), PipelineError::Export { .. }));
    assert!(matches!(failure(&report, "c4"), PipelineError::SinkOpen { .. }));
    for container in ["c2", "c3", "c4"] {
        assert!(provider.snapshot_exists(&key(container)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_are_isolated_per_item() {
    let names = ["ok1", "snap", "export", "upload", "cleanup", "ok2"];
    let provider = MockSnapshotProvider::with_containers(names);
    provider.fail_on(ProviderStep::CreateWait, "snap", "snapshot failed");
    provider.fail_on(ProviderStep::DeleteSubmit, "cleanup", "permission denied");
    let store = MockS3ObjectStore::new();
    store.fail_on(MockOperation::Write, "upload/", MockFailure::Transient("connection reset"));
    let pipeline = pipeline(
        &provider,
        Arc::new(store.clone()),
        ScriptedExporter::failing(&["export"]),
        3,
    );

    let report = pipeline.execute().await.unwrap();

    assert_eq!(report.failures.len(), 4);
    assert!(matches!(failure(&report, "snap"), PipelineError::SnapshotWait { .. }));
    assert!(matches!(failure(&report, "export"), PipelineError::Export { .. }));
    assert!(matches!(failure(&report, "upload"), PipelineError::Export { .. }));
    assert!(matches!(failure(&report, "cleanup"), PipelineError::DeleteSubmit { .. }));

    for container in ["ok1", "ok2"] {
        assert_object_matches(&store, container).await;
        assert!(!provider.snapshot_exists(&key(container)));
    }
    assert_object_matches(&store, "cleanup").await;
    assert!(!store.contains_key(&key("upload")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_respected() {
    let names: Vec<String> = (0..12).map(|i| format!("ct{i:02}")).collect();
    let provider = MockSnapshotProvider::with_containers(names.clone())
        .with_latency(Duration::from_millis(20));
    let store = MockS3ObjectStore::new();
    let pipeline = pipeline(&provider, Arc::new(store.clone()), ScriptedExporter::default(), 3);

    let report = pipeline.execute().await.unwrap();

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert!(
        provider.peak_concurrent_creates() <= 3,
        "peak {} exceeded limit",
        provider.peak_concurrent_creates()
    );
    assert_eq!(store.storage_size(), names.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_default_configuration_is_unbounded() {
    let names: Vec<String> = (0..16).map(|i| format!("ct{i:02}")).collect();
    let provider = MockSnapshotProvider::with_containers(names.clone())
        .with_latency(Duration::from_millis(50));
    let store = MockS3ObjectStore::new();
    let pipeline = Pipeline::builder()
        .provider(Arc::new(provider.clone()))
        .store(Arc::new(store.clone()))
        .exporter(Arc::new(ScriptedExporter::default()))
        .run_identity(run_identity())
        .build()
        .unwrap();

    let report = pipeline.execute().await.unwrap();

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert_eq!(provider.peak_concurrent_creates(), names.len());
    assert_eq!(store.storage_size(), names.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_compression_flush_keeps_local_snapshot() {
    let provider = MockSnapshotProvider::with_containers(["c1", "c2", "c3"]);
    let store = MockS3ObjectStore::new();
    // c2 exports nothing, so its only sink writes come from the final flush.
    store.fail_on(MockOperation::Write, "c2/", MockFailure::Permanent("400 Bad Request"));
    let pipeline = pipeline(
        &provider,
        Arc::new(store.clone()),
        ScriptedExporter::silent(&["c2"]),
        8,
    );

    let report = pipeline.execute().await.unwrap();

    let error = failure(&report, "c2");
    assert!(
        matches!(error, PipelineError::CompressFinalize { .. }),
        "expected compression flush failure, got {error:?}"
    );
    assert_eq!(error.phase(), Phase::Transfer);
    assert!(!error.upload_committed());
    assert!(!report.was_uploaded("c2"));

    assert!(!store.contains_key(&key("c2")));
    assert!(store
        .get_call_history()
        .iter()
        .all(|call| !(call.key == key("c2") && call.operation == "close")));
    assert!(provider.snapshot_exists(&key("c2")));
    assert!(provider
        .calls_for(ProviderStep::DeleteSubmit)
        .iter()
        .all(|call| call.target != key("c2")));

    for container in ["c1", "c3"] {
        assert_object_matches(&store, container).await;
        assert!(!provider.snapshot_exists(&key(container)));
    }
    assert_eq!(report.cleaned.len(), 2);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_deletes_nothing() {
    let provider = MockSnapshotProvider::with_containers(["c1", "c2", "c3"]);
    let store = MockS3ObjectStore::new();
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::builder()
        .provider(Arc::new(provider.clone()))
        .store(Arc::new(store.clone()))
        .exporter(Arc::new(ScriptedExporter::default()))
        .run_identity(run_identity())
        .cancellation(cancel.clone())
        .build()
        .unwrap();

    cancel.cancel();
    let report = pipeline.execute().await.unwrap();

    assert_eq!(report.failures.len(), 3);
    assert!(report
        .failures
        .iter()
        .all(|f| matches!(f.error, PipelineError::Cancelled { phase: Phase::Snapshot, .. })));
    assert!(provider.calls_for(ProviderStep::CreateSubmit).is_empty());
    assert!(provider.calls_for(ProviderStep::DeleteSubmit).is_empty());
    assert_eq!(store.storage_size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalObjectStore::new(dir.path()).await.unwrap());
    let provider = MockSnapshotProvider::with_containers(["web", "db"]);
    let pipeline = pipeline(&provider, store.clone(), ScriptedExporter::default(), 0);

    let report = pipeline.execute().await.unwrap();

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    for container in ["web", "db"] {
        assert_object_matches(store.as_ref(), container).await;
    }
    assert_eq!(store.list("").await.unwrap().len(), 2);
}
