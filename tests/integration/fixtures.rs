//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Predefined task graphs (diamond, chain, independent)
//! - A scripted executor that records dispatch order and concurrency
//! - Fixed and failing resource monitors
//! - Scripted verification gates and repair backends

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use swarm::config::{GovernorConfig, WrapperConfig};
use swarm::core::{Artifact, TaskError, TaskGraph, TaskId, TaskNode};
use swarm::orchestration::{
    ExecutionWrapper, RepairRequest, Rewrite, RewritePlan, Scheduler, SchedulerEvent,
    StrategyBackend, TaskExecutor, Verdict, VerificationGate,
};
use swarm::resource::{BudgetOverride, ConcurrencyGovernor, ResourceMonitor, ResourceSample};
use swarm::{Error, Result};

pub const GB: u64 = 1024 * 1024 * 1024;

/// Create a task with a description derived from its id.
pub fn task(id: &str) -> TaskNode {
    TaskNode::new(id, &format!("{} description", id))
}

/// A -> B, A -> C, B -> D, C -> D.
pub fn diamond() -> Vec<TaskNode> {
    vec![
        task("a"),
        task("b").depends_on("a"),
        task("c").depends_on("a"),
        task("d").depends_on("b").depends_on("c"),
    ]
}

/// t0 -> t1 -> ... -> t(n-1).
pub fn chain(n: usize) -> Vec<TaskNode> {
    (0..n)
        .map(|i| {
            let node = task(&format!("t{}", i));
            if i == 0 {
                node
            } else {
                node.depends_on(format!("t{}", i - 1))
            }
        })
        .collect()
}

pub fn independent(n: usize) -> Vec<TaskNode> {
    (0..n).map(|i| task(&format!("t{}", i))).collect()
}

/// How the scripted executor treats one task.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Report resource exhaustion on the first attempt only.
    ExhaustOnce,
    /// Report resource exhaustion on every attempt.
    ExhaustAlways,
    Hang,
}

/// Executor driven by a per-task script.
///
/// Each attempt sleeps for `work` (virtual time in paused tests), checks
/// that every dependency already completed, and tracks peak concurrency.
pub struct ScriptedExecutor {
    script: HashMap<String, Behavior>,
    work: Duration,
    deps: HashMap<String, Vec<String>>,
    completed: Mutex<HashSet<String>>,
    pub started: Mutex<Vec<String>>,
    pub violations: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(nodes: &[TaskNode]) -> Self {
        Self {
            script: HashMap::new(),
            work: Duration::from_millis(10),
            deps: nodes
                .iter()
                .map(|n| {
                    (
                        n.id.to_string(),
                        n.depends_on.iter().map(|d| d.to_string()).collect(),
                    )
                })
                .collect(),
            completed: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.script.insert(id.to_string(), behavior);
        self
    }

    pub fn with_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn was_started(&self, id: &str) -> bool {
        self.started.lock().unwrap().iter().any(|s| s == id)
    }

    pub fn attempts_of(&self, id: &str) -> usize {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        node: &TaskNode,
        _context: &[String],
    ) -> std::result::Result<Vec<Artifact>, TaskError> {
        let id = node.id.to_string();
        {
            let completed = self.completed.lock().unwrap();
            for dep in self.deps.get(&id).into_iter().flatten() {
                if !completed.contains(dep) {
                    self.violations
                        .lock()
                        .unwrap()
                        .push(format!("{} started before {}", id, dep));
                }
            }
        }
        self.started.lock().unwrap().push(id.clone());
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let behavior = self.script.get(&id).cloned().unwrap_or(Behavior::Succeed);
        if behavior == Behavior::Hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        } else {
            tokio::time::sleep(self.work).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        match behavior {
            Behavior::Succeed | Behavior::Hang => {}
            Behavior::Fail => return Err(TaskError::execution(format!("{} failed", id))),
            Behavior::Panic => panic!("{} panicked", id),
            Behavior::ExhaustOnce if attempt == 1 => {
                return Err(TaskError::resource_exhausted("cannot allocate memory"))
            }
            Behavior::ExhaustOnce => {}
            Behavior::ExhaustAlways => {
                return Err(TaskError::resource_exhausted("cannot allocate memory"))
            }
        }
        self.completed.lock().unwrap().insert(id.clone());
        Ok(vec![Artifact::new(format!("{}.txt", id), format!("output of {}", id))])
    }
}

/// Monitor that always returns the same reading.
pub struct StaticMonitor {
    pub memory_fraction: f64,
    pub available_gb: f64,
}

impl StaticMonitor {
    pub fn new(memory_fraction: f64, available_gb: f64) -> Self {
        Self {
            memory_fraction,
            available_gb,
        }
    }

    /// Plenty of memory and no pressure.
    pub fn calm() -> Self {
        Self::new(0.2, 64.0)
    }
}

impl ResourceMonitor for StaticMonitor {
    fn sample(&self) -> Result<ResourceSample> {
        Ok(ResourceSample::new(
            self.memory_fraction,
            0.1,
            (self.available_gb * GB as f64) as u64,
            128 * GB,
        ))
    }
}

/// Monitor that fails on every call.
pub struct FailingMonitor;

impl ResourceMonitor for FailingMonitor {
    fn sample(&self) -> Result<ResourceSample> {
        Err(Error::Monitor("sampler unavailable".into()))
    }
}

/// Scheduler wired to a scripted executor with an event channel.
pub struct SchedulerHarness {
    pub scheduler: Scheduler,
    pub executor: Arc<ScriptedExecutor>,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
}

impl SchedulerHarness {
    pub fn new(
        nodes: Vec<TaskNode>,
        executor: ScriptedExecutor,
        monitor: Arc<dyn ResourceMonitor>,
        concurrency: BudgetOverride,
    ) -> Self {
        Self::with_wrapper_config(nodes, executor, monitor, concurrency, WrapperConfig::default())
    }

    pub fn with_wrapper_config(
        nodes: Vec<TaskNode>,
        executor: ScriptedExecutor,
        monitor: Arc<dyn ResourceMonitor>,
        concurrency: BudgetOverride,
        wrapper_config: WrapperConfig,
    ) -> Self {
        let executor = Arc::new(executor);
        let governor = ConcurrencyGovernor::new(
            GovernorConfig {
                concurrency,
                ..Default::default()
            },
            monitor.clone(),
        );
        let wrapper = ExecutionWrapper::new(executor.clone(), monitor, wrapper_config);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let graph = TaskGraph::new(nodes).expect("valid test graph");
        let scheduler = Scheduler::new(graph, governor, wrapper).with_events(event_tx);
        Self {
            scheduler,
            executor,
            event_rx,
        }
    }

    /// Drain every event emitted so far.
    pub fn events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::from(*n)).collect()
}

/// Gate that fails until its `pass_on`-th call (1-based).
pub struct ScriptedGate {
    pass_on: Option<usize>,
    pub calls: AtomicUsize,
}

impl ScriptedGate {
    pub fn always_failing() -> Self {
        Self {
            pass_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn passing_on(call: usize) -> Self {
        Self {
            pass_on: Some(call),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerificationGate for ScriptedGate {
    async fn verify(&self, _workdir: &Path) -> Result<Verdict> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.pass_on == Some(n) {
            Ok(Verdict::pass())
        } else {
            Ok(Verdict::fail(format!(
                "Traceback (most recent call last):\n  File \"/w/app.py\", line {}\nAssertionError",
                n
            )))
        }
    }
}

/// Backend that proposes one rewrite of `app.py` per request, alternating
/// between the single-object and list shapes. Any `extra` rewrites are
/// proposed alongside it as a list.
#[derive(Default)]
pub struct ScriptedBackend {
    pub requests: Mutex<Vec<RepairRequest>>,
    extra: Vec<Rewrite>,
}

impl ScriptedBackend {
    pub fn with_extra(extra: Vec<Rewrite>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            extra,
        }
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl StrategyBackend for ScriptedBackend {
    async fn propose(&self, request: &RepairRequest) -> Result<RewritePlan> {
        self.requests.lock().unwrap().push(request.clone());
        let content = format!("# attempt {} ({})", request.attempt, request.strategy);
        let rewrite = Rewrite::new("app.py", content);
        Ok(if !self.extra.is_empty() {
            RewritePlan::Many(std::iter::once(rewrite).chain(self.extra.clone()).collect())
        } else if request.attempt % 2 == 1 {
            RewritePlan::Single(rewrite)
        } else {
            RewritePlan::Many(vec![rewrite])
        })
    }
}
