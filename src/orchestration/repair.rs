//! Repair orchestration: the escalation ladder.
//!
//! When produced artifacts fail verification, the [`RepairOrchestrator`]
//! walks an ordered list of strategies, each more invasive than the one
//! before. Every attempt hands a strategy the (truncated) diagnostics, a
//! bounded window of earlier attempts, and the artifacts it may touch,
//! applies whatever it proposes, and re-runs the verification gate. The
//! session stops at the first pass or when the attempt budget runs out.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RepairConfig;
use crate::core::task::Artifact;
use crate::orchestration::rewrite::{Rewrite, RewritePlan, Workspace};
use crate::util::truncate_chars;
use crate::Result;

/// Python traceback frames.
static PY_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+\.py)""#).unwrap());

/// `Error in foo.py` / `Failed: foo.py` markers from test runners.
static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Error in|Failed:)\s+([^\s:]+\.\w+)").unwrap());

/// rustc style `--> src/lib.rs:10:5`.
static ARROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-->\s+([^\s:]+):\d+").unwrap());

/// Generic `path/to/file.ext:line`.
static PATH_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_./-]+\.[A-Za-z]{1,6}):\d+").unwrap());

/// Strategies in order of increasing invasiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Syntax or import level correction.
    QuickFix,
    /// Type, null and edge-case correction.
    LogicFix,
    /// Fixtures and configuration only; production code untouched.
    TestHarnessFix,
    /// Regenerate the failing artifacts from scratch.
    Regenerate,
    /// Drop non-essential functionality.
    Simplify,
    /// Different architecture, library or pattern.
    AlternativeApproach,
    /// Smallest change that passes, flagged as incomplete.
    MinimalStub,
}

impl RepairStrategy {
    pub const LADDER: [RepairStrategy; 7] = [
        RepairStrategy::QuickFix,
        RepairStrategy::LogicFix,
        RepairStrategy::TestHarnessFix,
        RepairStrategy::Regenerate,
        RepairStrategy::Simplify,
        RepairStrategy::AlternativeApproach,
        RepairStrategy::MinimalStub,
    ];

    /// 1-based position on the ladder.
    pub fn ordinal(self) -> usize {
        self as usize + 1
    }

    pub fn from_ordinal(ordinal: usize) -> Option<Self> {
        ordinal
            .checked_sub(1)
            .and_then(|i| Self::LADDER.get(i).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            RepairStrategy::QuickFix => "quick_fix",
            RepairStrategy::LogicFix => "logic_fix",
            RepairStrategy::TestHarnessFix => "test_harness_fix",
            RepairStrategy::Regenerate => "regenerate",
            RepairStrategy::Simplify => "simplify",
            RepairStrategy::AlternativeApproach => "alternative_approach",
            RepairStrategy::MinimalStub => "minimal_stub",
        }
    }

    /// Guidance handed to the backend along with the request.
    pub fn instructions(self) -> &'static str {
        match self {
            RepairStrategy::QuickFix => {
                "Fix syntax errors, missing imports and typos. Change as little as possible."
            }
            RepairStrategy::LogicFix => {
                "Fix logic errors: wrong types, missing null checks, unhandled edge cases."
            }
            RepairStrategy::TestHarnessFix => {
                "Fix test fixtures, test configuration and mocks only. \
                 Do not modify production code."
            }
            RepairStrategy::Regenerate => {
                "Rewrite the failing files completely. \
                 Avoid the mistakes shown in the previous attempts."
            }
            RepairStrategy::Simplify => {
                "Remove non-essential functionality until the code builds and the tests pass."
            }
            RepairStrategy::AlternativeApproach => {
                "Solve the same problem with a different design, library or pattern."
            }
            RepairStrategy::MinimalStub => {
                "Produce the smallest implementation that passes verification \
                 and mark it as incomplete."
            }
        }
    }
}

impl std::fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Answer of a verification gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(default)]
    pub diagnostics: String,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: String::new(),
        }
    }

    pub fn fail(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// The sole success oracle for repairs.
#[async_trait]
pub trait VerificationGate: Send + Sync {
    async fn verify(&self, workdir: &Path) -> Result<Verdict>;
}

/// Everything a strategy is given for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRequest {
    pub session_id: Uuid,
    pub attempt: usize,
    pub strategy: RepairStrategy,
    pub instructions: String,
    pub diagnostics: String,
    pub failing_files: Vec<String>,
    /// The most recent earlier attempts, oldest first.
    pub history: Vec<RepairAttempt>,
    pub artifacts: Vec<Artifact>,
}

/// Produces rewrites for a repair request.
#[async_trait]
pub trait StrategyBackend: Send + Sync {
    async fn propose(&self, request: &RepairRequest) -> Result<RewritePlan>;
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum AttemptVerdict {
    Passed,
    Failed { diagnostics: String },
    /// Nothing was applied, so verification was not re-run.
    NoChanges { reason: String },
}

/// One step up the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub attempt: usize,
    pub strategy: RepairStrategy,
    /// Diagnostics as handed to the strategy.
    pub diagnostics: String,
    /// Paths the strategy rewrote.
    pub rewritten: Vec<String>,
    pub verdict: AttemptVerdict,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl RepairAttempt {
    pub fn passed(&self) -> bool {
        self.verdict == AttemptVerdict::Passed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RepairState {
    AwaitingVerification,
    Escalating { attempt: usize },
    Resolved,
    Exhausted,
}

/// Full record of one repair effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairSession {
    pub id: Uuid,
    pub state: RepairState,
    pub initial_diagnostics: String,
    pub attempts: Vec<RepairAttempt>,
    /// Artifacts after the last applied rewrite.
    pub artifacts: Vec<Artifact>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RepairSession {
    fn new(initial_diagnostics: String, artifacts: Vec<Artifact>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RepairState::AwaitingVerification,
            initial_diagnostics,
            attempts: Vec::new(),
            artifacts,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// The last `window` attempts, oldest first.
    pub fn recent(&self, window: usize) -> Vec<RepairAttempt> {
        let skip = self.attempts.len().saturating_sub(window);
        self.attempts[skip..].to_vec()
    }

    fn finish(&mut self, state: RepairState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    fn merge(&mut self, rewrites: &[Rewrite]) {
        for rewrite in rewrites {
            match self.artifacts.iter_mut().find(|a| a.path == rewrite.path) {
                Some(existing) => existing.content = rewrite.content.clone(),
                None => self.artifacts.push(rewrite.clone().into()),
            }
        }
    }
}

/// Outcome of a repair session.
#[derive(Debug, Clone)]
pub enum RepairResult {
    Resolved(RepairSession),
    /// The ladder ran out; the session carries the full attempt history.
    Exhausted(RepairSession),
}

impl RepairResult {
    pub fn is_resolved(&self) -> bool {
        matches!(self, RepairResult::Resolved(_))
    }

    pub fn session(&self) -> &RepairSession {
        match self {
            RepairResult::Resolved(s) | RepairResult::Exhausted(s) => s,
        }
    }

    pub fn attempts(&self) -> &[RepairAttempt] {
        &self.session().attempts
    }
}

/// Drives a repair session over a workspace.
pub struct RepairOrchestrator {
    backend: Arc<dyn StrategyBackend>,
    gate: Arc<dyn VerificationGate>,
    config: RepairConfig,
}

impl RepairOrchestrator {
    pub fn new(
        backend: Arc<dyn StrategyBackend>,
        gate: Arc<dyn VerificationGate>,
        config: RepairConfig,
    ) -> Self {
        Self {
            backend,
            gate,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<dyn VerificationGate> {
        &self.gate
    }

    /// Number of attempts a session will make at most.
    pub fn max_attempts(&self) -> usize {
        self.config.max_attempts.min(RepairStrategy::LADDER.len())
    }

    /// Run a session starting from `verdict`. A passing verdict resolves
    /// immediately without invoking any strategy.
    pub async fn repair(
        &self,
        verdict: Verdict,
        artifacts: Vec<Artifact>,
        workspace: &dyn Workspace,
    ) -> Result<RepairResult> {
        let mut session = RepairSession::new(verdict.diagnostics.clone(), artifacts);
        if verdict.passed {
            session.finish(RepairState::Resolved);
            return Ok(RepairResult::Resolved(session));
        }

        info!(
            session = %session.id,
            max_attempts = self.max_attempts(),
            "starting repair session"
        );
        let mut diagnostics = verdict.diagnostics;

        for (i, strategy) in RepairStrategy::LADDER
            .into_iter()
            .take(self.max_attempts())
            .enumerate()
        {
            let attempt = i + 1;
            session.state = RepairState::Escalating { attempt };
            let (record, applied) = self
                .attempt(&session, attempt, strategy, &diagnostics, workspace)
                .await;
            session.merge(&applied);

            match record.verdict.clone() {
                AttemptVerdict::Passed => {
                    info!(session = %session.id, attempt, %strategy, "repair resolved");
                    session.attempts.push(record);
                    session.finish(RepairState::Resolved);
                    return Ok(RepairResult::Resolved(session));
                }
                AttemptVerdict::Failed { diagnostics: next } => {
                    info!(session = %session.id, attempt, %strategy, "verification still failing");
                    diagnostics = next;
                }
                AttemptVerdict::NoChanges { reason } => {
                    info!(
                        session = %session.id,
                        attempt,
                        %strategy,
                        %reason,
                        "strategy made no changes"
                    );
                }
            }
            session.attempts.push(record);
        }

        warn!(
            session = %session.id,
            attempts = session.attempts.len(),
            "repair ladder exhausted"
        );
        session.finish(RepairState::Exhausted);
        Ok(RepairResult::Exhausted(session))
    }

    /// One ladder step. Returns the record and the rewrites it applied.
    async fn attempt(
        &self,
        session: &RepairSession,
        attempt: usize,
        strategy: RepairStrategy,
        diagnostics: &str,
        workspace: &dyn Workspace,
    ) -> (RepairAttempt, Vec<Rewrite>) {
        let started_at = Utc::now();
        let clock = Instant::now();

        let failing_files = extract_failing_files(diagnostics);
        let request = RepairRequest {
            session_id: session.id,
            attempt,
            strategy,
            instructions: strategy.instructions().to_string(),
            diagnostics: truncate_chars(diagnostics, self.config.diagnostic_limit).to_string(),
            artifacts: select_targets(&session.artifacts, &failing_files),
            failing_files,
            history: session.recent(self.config.history_window),
        };
        debug!(
            attempt,
            %strategy,
            targets = request.artifacts.len(),
            history = request.history.len(),
            "invoking repair strategy"
        );

        let record = |verdict: AttemptVerdict, rewritten: Vec<String>| RepairAttempt {
            attempt,
            strategy,
            diagnostics: request.diagnostics.clone(),
            rewritten,
            verdict,
            started_at,
            duration: clock.elapsed(),
        };

        let rewrites = match self.backend.propose(&request).await {
            Ok(plan) => plan.normalize(),
            Err(e) => {
                warn!(attempt, %strategy, error = %e, "repair strategy failed");
                let reason = format!("strategy error: {}", e);
                return (record(AttemptVerdict::NoChanges { reason }, Vec::new()), Vec::new());
            }
        };
        if rewrites.is_empty() {
            let reason = "no rewrites proposed".to_string();
            return (record(AttemptVerdict::NoChanges { reason }, Vec::new()), Vec::new());
        }

        if let Err(e) = workspace.apply(&rewrites).await {
            warn!(attempt, %strategy, error = %e, "could not apply rewrites");
            let reason = format!("apply failed: {}", e);
            return (record(AttemptVerdict::NoChanges { reason }, Vec::new()), Vec::new());
        }
        let paths: Vec<String> = rewrites.iter().map(|r| r.path.clone()).collect();

        let verdict = match self.gate.verify(workspace.root()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(attempt, error = %e, "verification gate errored, counting as failure");
                Verdict::fail(format!("verification gate error: {}", e))
            }
        };
        let outcome = if verdict.passed {
            AttemptVerdict::Passed
        } else {
            AttemptVerdict::Failed {
                diagnostics: verdict.diagnostics,
            }
        };
        (record(outcome, paths), rewrites)
    }
}

/// Candidate failing paths mentioned in diagnostics, in first-seen order.
pub fn extract_failing_files(diagnostics: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for re in [&*PY_FRAME_RE, &*MARKER_RE, &*ARROW_RE, &*PATH_LINE_RE] {
        for cap in re.captures_iter(diagnostics) {
            let path = cap[1].trim_start_matches("./").to_string();
            if seen.insert(path.clone()) {
                files.push(path);
            }
        }
    }
    files
}

/// Artifacts referenced by `failing`, or all of them when none match.
fn select_targets(artifacts: &[Artifact], failing: &[String]) -> Vec<Artifact> {
    let matched: Vec<Artifact> = artifacts
        .iter()
        .filter(|a| failing.iter().any(|f| paths_match(&a.path, f)))
        .cloned()
        .collect();
    if matched.is_empty() {
        artifacts.to_vec()
    } else {
        matched
    }
}

fn paths_match(artifact: &str, mentioned: &str) -> bool {
    let artifact = artifact.trim_start_matches("./");
    artifact == mentioned
        || mentioned.ends_with(&format!("/{}", artifact))
        || artifact.ends_with(&format!("/{}", mentioned))
}
