//! End-to-end pipeline tests.
//!
//! Construct, verify and repair against a temporary directory.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarm::config::Config;
use swarm::core::{Artifact, PlanDocument, TaskError, TaskGraph, TaskNode};
use swarm::orchestration::{
    DirWorkspace, Pipeline, RepairOrchestrator, SchedulerEvent, TaskExecutor,
};

use crate::fixtures::{
    diamond, task, Behavior, ScriptedBackend, ScriptedExecutor, ScriptedGate, StaticMonitor,
};

/// Executor whose artifacts point outside any workspace.
struct Escaping;

#[async_trait]
impl TaskExecutor for Escaping {
    async fn execute(
        &self,
        node: &TaskNode,
        _context: &[String],
    ) -> std::result::Result<Vec<Artifact>, TaskError> {
        Ok(vec![
            Artifact::new(format!("{}.txt", node.id), "fine"),
            Artifact::new(format!("../{}-outside.txt", node.id), "stray"),
        ])
    }
}

struct Setup {
    dir: tempfile::TempDir,
    gate: Arc<ScriptedGate>,
    backend: Arc<ScriptedBackend>,
    pipeline: Pipeline,
}

fn setup(executor: impl TaskExecutor + 'static, gate: ScriptedGate) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(gate);
    let backend = Arc::new(ScriptedBackend::default());
    let config = Config::default();
    let repair = RepairOrchestrator::new(backend.clone(), gate.clone(), config.repair.clone());
    let pipeline = Pipeline::new(
        config,
        Arc::new(StaticMonitor::calm()),
        Arc::new(executor),
        Arc::new(DirWorkspace::new(dir.path())),
        repair,
    );
    Setup {
        dir,
        gate,
        backend,
        pipeline,
    }
}

/// Test: Clean construction
/// Given the diamond graph and a gate that passes at once
/// When the pipeline executes
/// Then every artifact is on disk and no repair session starts
#[tokio::test]
async fn test_pipeline_passes_without_repair() {
    let nodes = diamond();
    let s = setup(ScriptedExecutor::new(&nodes), ScriptedGate::passing_on(1));

    let report = s
        .pipeline
        .execute(TaskGraph::new(nodes).unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(report.repair.is_none());
    assert_eq!(report.verdict.as_ref().map(|v| v.passed), Some(true));
    for id in ["a", "b", "c", "d"] {
        let content = std::fs::read_to_string(s.dir.path().join(format!("{}.txt", id))).unwrap();
        assert_eq!(content, format!("output of {}", id));
    }
    assert_eq!(s.backend.invocations(), 0);
}

/// Test: Verification failure repaired
/// Given a gate that fails the first check and passes the next
/// When the pipeline executes
/// Then one repair attempt resolves the session
#[tokio::test]
async fn test_pipeline_repairs_failed_verification() {
    let nodes = diamond();
    let s = setup(ScriptedExecutor::new(&nodes), ScriptedGate::passing_on(2));

    let report = s
        .pipeline
        .execute(TaskGraph::new(nodes).unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.verdict.as_ref().map(|v| v.passed), Some(false));
    let repair = report.repair.as_ref().unwrap();
    assert!(repair.is_resolved());
    assert_eq!(repair.attempts().len(), 1);
    assert!(s.dir.path().join("app.py").exists());
    assert_eq!(s.gate.calls(), 2);
}

/// Test: Construction failure
/// Given a task that fails
/// When the pipeline executes
/// Then verification and repair are skipped and the report is unsuccessful
#[tokio::test]
async fn test_pipeline_skips_verification_on_partial_failure() {
    let nodes = diamond();
    let s = setup(
        ScriptedExecutor::new(&nodes).with("b", Behavior::Fail),
        ScriptedGate::passing_on(1),
    );

    let report = s
        .pipeline
        .execute(TaskGraph::new(nodes).unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.is_success());
    assert!(report.verdict.is_none());
    assert!(report.repair.is_none());
    assert_eq!(s.gate.calls(), 0);
}

/// Test: Plan document through the pipeline with events
/// Given a JSON plan and an event channel
/// When the pipeline executes
/// Then the run finishes and RunFinished is the last event
#[tokio::test]
async fn test_pipeline_from_plan_document() {
    let plan = PlanDocument::from_json(
        r#"{"tasks": [
            {"id": "schema", "description": "write schema"},
            {"id": "api", "description": "write api", "depends_on": ["schema"]}
        ]}"#,
    )
    .unwrap();
    let graph = TaskGraph::from_plan(plan).unwrap();
    let nodes: Vec<_> = graph.tasks().cloned().collect();
    let s = setup(ScriptedExecutor::new(&nodes), ScriptedGate::passing_on(1));
    let (tx, mut rx) = mpsc::channel(64);
    let pipeline = s.pipeline.with_events(tx);

    let report = pipeline.execute(graph, CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert!(matches!(last, Some(SchedulerEvent::RunFinished { .. })));
}

/// Test: Artifact that cannot be written
/// Given a task producing a path outside the workspace
/// When the pipeline executes
/// Then the run report is kept, the verdict fails naming the path and
/// neither the gate nor the repair ladder is invoked
#[tokio::test]
async fn test_pipeline_reports_unwritable_artifacts() {
    let s = setup(Escaping, ScriptedGate::passing_on(1));

    let report = s
        .pipeline
        .execute(TaskGraph::new(vec![task("a")]).unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.run.is_success());
    assert!(!report.is_success());
    let verdict = report.verdict.as_ref().unwrap();
    assert!(!verdict.passed);
    assert!(verdict.diagnostics.contains("../a-outside.txt"));
    assert!(report.repair.is_none());
    assert_eq!(s.gate.calls(), 0);
    assert_eq!(s.backend.invocations(), 0);
    assert!(!s.dir.path().parent().unwrap().join("a-outside.txt").exists());
}
