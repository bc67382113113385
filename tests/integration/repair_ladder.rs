//! Repair ladder tests.
//!
//! These tests run repair sessions against a temporary directory with a
//! scripted gate and backend, checking escalation order, termination and
//! what reaches the strategy.

use std::sync::Arc;

use swarm::config::RepairConfig;
use swarm::core::Artifact;
use swarm::orchestration::{
    AttemptVerdict, DirWorkspace, RepairOrchestrator, RepairState, RepairStrategy, Rewrite,
    Verdict,
};

use crate::fixtures::{ScriptedBackend, ScriptedGate};

fn orchestrator(
    backend: Arc<ScriptedBackend>,
    gate: Arc<ScriptedGate>,
    max_attempts: usize,
) -> RepairOrchestrator {
    RepairOrchestrator::new(
        backend,
        gate,
        RepairConfig {
            max_attempts,
            ..Default::default()
        },
    )
}

fn initial_failure() -> Verdict {
    Verdict::fail("Traceback (most recent call last):\n  File \"/w/app.py\", line 3\nNameError")
}

fn artifacts() -> Vec<Artifact> {
    vec![
        Artifact::new("app.py", "print(undefined)"),
        Artifact::new("README.md", "docs"),
    ]
}

/// Test: Permanently failing gate
/// Given a gate that never passes and max attempts = 3
/// When a repair session runs
/// Then exactly 3 attempts are recorded and the session is Exhausted
#[tokio::test]
async fn test_exhausts_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::always_failing());

    let result = orchestrator(backend.clone(), gate.clone(), 3)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    assert!(!result.is_resolved());
    assert_eq!(result.attempts().len(), 3);
    assert_eq!(result.session().state, RepairState::Exhausted);
    assert!(result.session().finished_at.is_some());
    assert_eq!(backend.invocations(), 3);
    assert_eq!(gate.calls(), 3);
}

/// Test: Success on the third attempt
/// Given a gate that fails twice then passes
/// When a repair session runs with the default ladder
/// Then the session resolves after attempt 3 and attempt 4 never happens
#[tokio::test]
async fn test_resolves_on_third_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::passing_on(3));

    let result = orchestrator(backend.clone(), gate, 7)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    assert!(result.is_resolved());
    assert_eq!(result.session().state, RepairState::Resolved);
    let attempts = result.attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].verdict, AttemptVerdict::Passed);
    assert_eq!(attempts[2].strategy, RepairStrategy::TestHarnessFix);
    assert_eq!(backend.invocations(), 3, "no strategy after the passing one");
}

/// Test: Escalation order
/// Given a gate that never passes and the full ladder
/// When a repair session runs
/// Then strategies are tried in ladder order, once each
#[tokio::test]
async fn test_strategies_escalate_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::always_failing());

    let result = orchestrator(backend.clone(), gate, 7)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    let tried: Vec<RepairStrategy> = result.attempts().iter().map(|a| a.strategy).collect();
    assert_eq!(tried, RepairStrategy::LADDER.to_vec());
    let ordinals: Vec<usize> = result.attempts().iter().map(|a| a.attempt).collect();
    assert_eq!(ordinals, vec![1, 2, 3, 4, 5, 6, 7]);
}

/// Test: Configured attempts above the ladder length
/// Given max attempts = 20
/// When the gate never passes
/// Then the session stops after the 7 ladder strategies
#[tokio::test]
async fn test_attempts_capped_by_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::always_failing());

    let result = orchestrator(backend, gate, 20)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    assert_eq!(result.attempts().len(), RepairStrategy::LADDER.len());
}

/// Test: Rewrites land in the workspace
/// Given a backend that rewrites app.py
/// When the session resolves on the first attempt
/// Then the file on disk and the session artifacts hold the new content
#[tokio::test]
async fn test_rewrites_are_applied_to_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::passing_on(1));

    let result = orchestrator(backend, gate, 7)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    let on_disk = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
    assert_eq!(on_disk, "# attempt 1 (quick_fix)");
    let app = result
        .session()
        .artifacts
        .iter()
        .find(|a| a.path == "app.py")
        .unwrap();
    assert_eq!(app.content, on_disk);
    assert_eq!(result.attempts()[0].rewritten, vec!["app.py".to_string()]);
}

/// Test: A batch with one bad path is not applied at all
/// Given a strategy proposing app.py, good.py and ../escape.py and max attempts = 2
/// When a repair session runs
/// Then nothing is written, no attempt lists rewritten paths and the
/// session artifacts are the originals
#[tokio::test]
async fn test_rejected_batch_leaves_workspace_and_session_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    std::fs::write(dir.path().join("app.py"), "print(undefined)").unwrap();
    let backend = Arc::new(ScriptedBackend::with_extra(vec![
        Rewrite::new("good.py", "print(1)"),
        Rewrite::new("../escape.py", "print(2)"),
    ]));
    let gate = Arc::new(ScriptedGate::passing_on(1));

    let result = orchestrator(backend.clone(), gate.clone(), 2)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    assert_eq!(result.session().state, RepairState::Exhausted);
    assert_eq!(backend.invocations(), 2);
    assert_eq!(gate.calls(), 0);
    for attempt in result.attempts() {
        assert!(matches!(attempt.verdict, AttemptVerdict::NoChanges { .. }));
        assert!(attempt.rewritten.is_empty());
    }
    assert!(!dir.path().join("good.py").exists());
    assert!(!dir.path().parent().unwrap().join("escape.py").exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
        "print(undefined)"
    );
    assert_eq!(result.session().artifacts, artifacts());
}

/// Test: Strategy sees only failing files and recent history
/// Given diagnostics naming app.py and a gate that never passes
/// When the third attempt is requested
/// Then it targets app.py only and carries the two earlier attempts
#[tokio::test]
async fn test_request_targets_failing_files() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::always_failing());

    orchestrator(backend.clone(), gate, 3)
        .repair(initial_failure(), artifacts(), &workspace)
        .await
        .unwrap();

    let requests = backend.requests.lock().unwrap();
    let third = &requests[2];
    assert_eq!(third.failing_files, vec!["/w/app.py".to_string()]);
    assert_eq!(third.artifacts.len(), 1);
    assert_eq!(third.artifacts[0].path, "app.py");
    assert_eq!(third.history.len(), 2);
    assert_eq!(third.strategy, RepairStrategy::TestHarnessFix);
}

/// Test: Passing verdict short-circuits
/// Given a verdict that already passed
/// When a repair session starts
/// Then it resolves with no attempts and the backend is never called
#[tokio::test]
async fn test_passing_verdict_needs_no_repair() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = DirWorkspace::new(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let gate = Arc::new(ScriptedGate::always_failing());

    let result = orchestrator(backend.clone(), gate.clone(), 7)
        .repair(Verdict::pass(), artifacts(), &workspace)
        .await
        .unwrap();

    assert!(result.is_resolved());
    assert!(result.attempts().is_empty());
    assert_eq!(backend.invocations(), 0);
    assert_eq!(gate.calls(), 0);
}
