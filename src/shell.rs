//! Process-backed collaborators used by the `swarm` binary.
//!
//! - [`ShellExecutor`] runs a task payload's `command` with `sh -c`.
//! - [`CommandGate`] runs verification commands in order and stops at the
//!   first failure.
//! - [`CommandStrategy`] pipes a JSON [`RepairRequest`] to a repair command
//!   and reads rewrites from its stdout.
//!
//! Children are spawned with `kill_on_drop`, so a task that times out in the
//! execution wrapper takes its process down with it.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::task::{Artifact, TaskError, TaskNode};
use crate::orchestration::repair::{RepairRequest, StrategyBackend, Verdict, VerificationGate};
use crate::orchestration::rewrite::RewritePlan;
use crate::orchestration::wrapper::TaskExecutor;
use crate::{Error, Result};

/// Default timeout for verification and repair commands (10 minutes).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

const OOM_MARKERS: &[&str] = &[
    "cannot allocate memory",
    "out of memory",
    "memoryerror",
    "std::bad_alloc",
    "memory allocation of",
];

fn shell(command: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
        (false, true) => stdout.trim_end().to_string(),
        (true, false) => stderr.trim_end().to_string(),
        (true, true) => String::new(),
    }
}

#[cfg(unix)]
fn killed_by_sigkill(output: &Output) -> bool {
    use std::os::unix::process::ExitStatusExt;
    output.status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_output: &Output) -> bool {
    false
}

/// Fields the shell executor reads from a task payload.
#[derive(Debug, Default, Deserialize)]
struct ShellPayload {
    command: Option<String>,
    /// Store stdout as an artifact at this path instead of parsing it.
    output: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactOutput {
    One(Artifact),
    Many(Vec<Artifact>),
}

/// Runs `payload.command` for each task inside a working directory.
///
/// The task id, description and retrieved context are exported as
/// `SWARM_TASK_ID`, `SWARM_TASK_DESCRIPTION` and `SWARM_CONTEXT`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    workdir: PathBuf,
}

impl ShellExecutor {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn artifacts_from(payload: &ShellPayload, stdout: &str) -> Vec<Artifact> {
        if let Some(path) = &payload.output {
            return vec![Artifact::new(path.clone(), stdout)];
        }
        match serde_json::from_str::<ArtifactOutput>(stdout.trim()) {
            Ok(ArtifactOutput::One(artifact)) => vec![artifact],
            Ok(ArtifactOutput::Many(artifacts)) => artifacts,
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(
        &self,
        node: &TaskNode,
        context: &[String],
    ) -> std::result::Result<Vec<Artifact>, TaskError> {
        let payload: ShellPayload = serde_json::from_value(node.payload.clone())
            .map_err(|e| TaskError::execution(format!("invalid payload: {}", e)))?;
        let Some(command) = payload.command.as_deref() else {
            return Err(TaskError::execution("payload has no command"));
        };

        debug!(task = %node.id, %command, "running task command");
        let output = shell(command, &self.workdir)
            .env("SWARM_TASK_ID", node.id.as_str())
            .env("SWARM_TASK_DESCRIPTION", &node.description)
            .env("SWARM_CONTEXT", context.join("\n---\n"))
            .output()
            .await
            .map_err(|e| TaskError::execution(format!("failed to spawn: {}", e)))?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(Self::artifacts_from(&payload, &stdout));
        }

        let detail = combined_output(&output);
        let lowered = detail.to_lowercase();
        if killed_by_sigkill(&output) || OOM_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Err(TaskError::resource_exhausted(if detail.is_empty() {
                "killed".to_string()
            } else {
                detail
            }));
        }
        Err(TaskError::execution(if detail.is_empty() {
            format!(
                "command exited with code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            detail
        }))
    }
}

/// Verification gate that runs build and test commands.
#[derive(Debug, Clone)]
pub struct CommandGate {
    commands: Vec<String>,
    timeout: Duration,
}

impl CommandGate {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            commands,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

#[async_trait]
impl VerificationGate for CommandGate {
    async fn verify(&self, workdir: &Path) -> Result<Verdict> {
        for command in &self.commands {
            debug!(%command, workdir = %workdir.display(), "verification command");
            let output = tokio::time::timeout(self.timeout, shell(command, workdir).output())
                .await
                .map_err(|_| Error::Timeout(self.timeout))?
                .map_err(|e| Error::Verification(format!("could not run '{}': {}", command, e)))?;
            if !output.status.success() {
                return Ok(Verdict::fail(format!(
                    "$ {}\n{}",
                    command,
                    combined_output(&output)
                )));
            }
        }
        Ok(Verdict::pass())
    }
}

/// Repair backend that delegates to an external command.
///
/// The command receives the request as JSON on stdin and answers on stdout
/// with a rewrite, a list of rewrites, or `{"rewrites": [...]}`. Empty
/// output means no proposal.
#[derive(Debug, Clone)]
pub struct CommandStrategy {
    command: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandStrategy {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, input: Vec<u8>) -> Result<Output> {
        let mut child = shell(&self.command, &self.workdir)
            .stdin(Stdio::piped())
            .env("SWARM_REPAIR", "1")
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "repair command closed stdin");
            }
        }
        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl StrategyBackend for CommandStrategy {
    async fn propose(&self, request: &RepairRequest) -> Result<RewritePlan> {
        let input = serde_json::to_vec(request)?;
        let output = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(Error::Strategy(format!(
                "`{}` failed for {}: {}",
                self.command,
                request.strategy,
                combined_output(&output)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(RewritePlan::none());
        }
        RewritePlan::from_json(stdout.trim())
    }
}
