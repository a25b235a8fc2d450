//! End-to-end runs of the orchestrator against persistent feedback stores.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use taskmesh::config::PipelineConfig;
use taskmesh::feedback::{
    create_feedback_store, FeedbackQuery, FeedbackStore, FeedbackStoreKind, FileFeedbackStore,
    SqliteFeedbackStore,
};
use taskmesh::orchestrator::{Orchestrator, OrchestratorContext, RequestPhase};
use taskmesh::synthesis::RequestOutcome;
use taskmesh::task::{Capability, CapabilitySet, TaskStatus};
use taskmesh::validation::{Verdict, WorkspaceFs};
use taskmesh::workers::{
    FnExecutor, TaskInput, WorkerContext, WorkerExecutor, WorkerOutput, WorkerRegistry,
};

fn caps(list: &[Capability]) -> CapabilitySet {
    list.iter().copied().collect()
}

/// Worker whose output points at `claim` in the workspace.
fn claiming(claim: &'static str) -> Arc<dyn WorkerExecutor> {
    Arc::new(FnExecutor::new(move |input: TaskInput, _: WorkerContext| async move {
        Ok(WorkerOutput::new(format!("{}: edited {}", input.description, claim))
            .with_learning(format!("touch {} first", claim)))
    }))
}

fn orchestrator(
    registry: WorkerRegistry,
    store: Arc<dyn FeedbackStore>,
    workspace: &Path,
) -> Orchestrator {
    Orchestrator::new(OrchestratorContext::new(
        Arc::new(registry),
        store,
        Arc::new(WorkspaceFs::new(workspace.to_path_buf())),
        workspace.to_path_buf(),
        &PipelineConfig {
            task_timeout: Duration::from_secs(5),
            ..PipelineConfig::default()
        },
    ))
}

fn claim_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry
        .register(
            "coder",
            caps(&[Capability::Implement]),
            1,
            claiming("src/lib.rs:12"),
        )
        .unwrap();
    registry
        .register(
            "tester",
            caps(&[Capability::Test]),
            1,
            claiming("tests/ghost.rs"),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_file_claims_are_checked_and_persisted_in_sqlite() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace.path().join("src")).unwrap();
    std::fs::write(workspace.path().join("src/lib.rs"), "pub fn x() {}\n").unwrap();
    let store_dir = workspace.path().join(".taskmesh");

    let store: Arc<dyn FeedbackStore> =
        Arc::new(SqliteFeedbackStore::open(store_dir.clone()).await.unwrap());
    let orch = orchestrator(claim_registry(), store, workspace.path());

    let id = orch.submit("implement X and test X").await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), orch.wait(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.phase, RequestPhase::Completed);
    assert_eq!(status.outcome, Some(RequestOutcome::PartialFailure));
    assert!(!status.degraded);

    let implement = &status.tasks[0];
    assert_eq!(implement.worker_id.as_deref(), Some("coder"));
    assert_eq!(implement.verdict, Some(Verdict::Accepted));
    assert_eq!(implement.status, TaskStatus::Completed);

    let test = &status.tasks[1];
    assert_eq!(test.verdict, Some(Verdict::Rejected));
    assert!(test
        .detected_violations
        .contains("missing file: tests/ghost.rs"));
    orch.shutdown().await;
    drop(orch);

    // Records survive a restart.
    let reopened = SqliteFeedbackStore::open(store_dir).await.unwrap();
    let coder = reopened.by_worker("coder").await.unwrap();
    assert_eq!(coder.len(), 1);
    assert_eq!(coder[0].request_id, id);
    assert_eq!(coder[0].learning.as_deref(), Some("touch src/lib.rs:12 first"));

    let stats = reopened.worker_stats("tester").await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.top_violations[0].0, "missing file: tests/ghost.rs");
}

#[tokio::test]
async fn test_command_workers_from_yaml_with_file_store() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(
        workspace.path().join("workers.yaml"),
        r#"workers:
  - id: shell-tester
    capabilities: [test]
    command: |
      echo "Ran 3 tests, 3 passed"
      echo "LEARNING: run the suite twice"
  - id: shell-writer
    capabilities: [document]
    command: "true"
"#,
    )
    .unwrap();
    let registry =
        WorkerRegistry::load_file(&workspace.path().join("workers.yaml"), workspace.path())
            .await
            .unwrap();
    assert_eq!(registry.len(), 2);

    let store_dir = workspace.path().join("feedback");
    let store = create_feedback_store(FeedbackStoreKind::File, store_dir.clone(), true)
        .await
        .unwrap();
    assert!(store.is_persistent());
    let orch = orchestrator(registry, Arc::clone(&store), workspace.path());

    let id = orch.submit("test the parser. document the parser").await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), orch.wait(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.tasks.len(), 2);
    assert_eq!(status.tasks[0].verdict, Some(Verdict::Accepted));
    assert_eq!(
        status.tasks[0].learning.as_deref(),
        Some("run the suite twice")
    );
    // `true` prints nothing.
    assert_eq!(status.tasks[1].verdict, Some(Verdict::Rejected));
    assert!(status.tasks[1].detected_violations.contains("empty output"));
    assert_eq!(status.outcome, Some(RequestOutcome::PartialFailure));

    let reopened = FileFeedbackStore::open(store_dir, false).await.unwrap();
    let records = reopened
        .query(&FeedbackQuery {
            request_id: Some(id),
            ..FeedbackQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_cancel_stops_shell_worker_and_skips_feedback() {
    let workspace = tempfile::tempdir().unwrap();
    let registry = WorkerRegistry::from_yaml(
        "workers:\n  - id: sleeper\n    capabilities: [research]\n    command: \"sleep 30\"\n",
        workspace.path(),
    )
    .unwrap();
    let store = create_feedback_store(FeedbackStoreKind::Memory, workspace.path().into(), false)
        .await
        .unwrap();
    let orch = orchestrator(registry, Arc::clone(&store), workspace.path());

    let id = orch.submit("research the topic").await.unwrap();
    for _ in 0..200 {
        let running = orch
            .status(id)
            .map(|s| s.tasks.iter().any(|t| t.status == TaskStatus::Running))
            .unwrap_or(false);
        if running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(orch.cancel(id));
    let status = tokio::time::timeout(Duration::from_secs(5), orch.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.phase, RequestPhase::Cancelled);
    assert!(matches!(status.tasks[0].status, TaskStatus::Failed { .. }));
    assert_eq!(status.tasks[0].status.to_string(), "Failed:Cancelled");
    assert!(store.by_request(id).await.unwrap().is_empty());
}
