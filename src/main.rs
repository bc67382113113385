use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use swarm::config::Config;
use swarm::core::{PlanDocument, TaskGraph};
use swarm::orchestration::{
    CommandGate, CommandStrategy, DirWorkspace, Pipeline, PipelineReport, RepairOrchestrator,
    RepairRequest, RewritePlan, RunResult, ShellExecutor, StrategyBackend,
};
use swarm::resource::{
    compute_budget, BudgetOverride, PressureLevel, ResourceMonitor, SamplingMonitor,
};
use swarm::{Error, Result};

/// Swarm - adaptive task scheduler with a self-healing repair ladder
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:
    SWARM_DEBUG=1                 Enable debug logging (alternative to --debug)
    SWARM_LOG=<filter>            Full tracing filter, e.g. swarm=trace
    SWARM_MAX_CONCURRENT_TASKS    auto or a positive integer")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.swarm/swarm.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a plan file and print its execution order
    Plan {
        /// Plan JSON file
        file: PathBuf,
    },

    /// Execute a plan, verify the result and repair it if needed
    Run {
        /// Plan JSON file
        file: PathBuf,

        /// Directory tasks run in and artifacts are written to
        #[arg(long, short = 'w', default_value = ".")]
        workdir: PathBuf,

        /// Verification command; repeat to run several in order
        #[arg(long = "verify")]
        verify: Vec<String>,

        /// Repair command: reads a JSON request on stdin, prints rewrites
        #[arg(long)]
        repair: Option<String>,

        /// Concurrency override: "auto" or a positive integer
        #[arg(long)]
        concurrency: Option<String>,
    },

    /// Show current host pressure and the budget it implies
    Resources,

    /// Write a config file with every setting at its default
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Backend used when no repair command is configured.
struct NoRepair;

#[async_trait]
impl StrategyBackend for NoRepair {
    async fn propose(&self, _request: &RepairRequest) -> Result<RewritePlan> {
        Err(Error::Strategy("no repair command configured".into()))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    swarm::log::init_with_debug(cli.debug);

    match dispatch(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("swarm: {}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::Structural(_) | Error::Validation(_) | Error::TomlParse(_) | Error::Json(_) => 2,
        _ => 1,
    }
}

/// Returns whether the command fully succeeded.
fn dispatch(cli: Cli) -> Result<bool> {
    let explicit = cli.config.as_deref();
    match cli.command {
        Command::Plan { file } => {
            load_config(explicit)?;
            run_plan(&file)
        }
        Command::Run {
            file,
            workdir,
            verify,
            repair,
            concurrency,
        } => {
            let mut config = load_config(explicit)?;
            if let Some(value) = concurrency {
                config.governor.concurrency = BudgetOverride::parse(&value);
            }
            config.validate()?;
            run_pipeline(config, &file, workdir, verify, repair)
        }
        Command::Resources => run_resources(load_config(explicit)?),
        Command::Init { force } => run_init(explicit, force),
    }
}

fn run_init(explicit: Option<&Path>, force: bool) -> Result<bool> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    if path.exists() && !force {
        return Err(Error::Validation(format!(
            "{} already exists, pass --force to overwrite",
            path.display()
        )));
    }
    let config = Config::default();
    match explicit {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    println!("wrote {}", path.display());
    Ok(true)
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = match explicit {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn load_graph(file: &Path) -> Result<TaskGraph> {
    TaskGraph::from_plan(PlanDocument::load(file)?)
}

fn run_plan(file: &Path) -> Result<bool> {
    let graph = load_graph(file)?;
    let order: Vec<&str> = graph
        .topological_order()?
        .into_iter()
        .map(|node| node.id.as_str())
        .collect();
    let output = serde_json::json!({
        "tasks": graph.len(),
        "dependencies": graph.dependency_count(),
        "order": order,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(true)
}

fn run_pipeline(
    config: Config,
    file: &Path,
    workdir: PathBuf,
    verify: Vec<String>,
    repair: Option<String>,
) -> Result<bool> {
    let graph = load_graph(file)?;
    std::fs::create_dir_all(&workdir)?;
    info!(tasks = graph.len(), workdir = %workdir.display(), "run command");

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let monitor: Arc<dyn ResourceMonitor> =
            Arc::new(SamplingMonitor::system(&config.monitor).await);
        let backend: Arc<dyn StrategyBackend> = match repair {
            Some(command) => Arc::new(CommandStrategy::new(command, workdir.clone())),
            None => Arc::new(NoRepair),
        };
        let orchestrator = RepairOrchestrator::new(
            backend,
            Arc::new(CommandGate::new(verify)),
            config.repair.clone(),
        );
        let pipeline = Pipeline::new(
            config,
            monitor,
            Arc::new(ShellExecutor::new(workdir.clone())),
            Arc::new(DirWorkspace::new(workdir.clone())),
            orchestrator,
        );

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                on_signal.cancel();
            }
        });

        pipeline.execute(graph, cancel).await
    })?;

    println!("{}", serde_json::to_string_pretty(&summarize(&report))?);
    Ok(report.is_success())
}

fn summarize(report: &PipelineReport) -> serde_json::Value {
    let failed = match &report.run.result {
        RunResult::AllTasksSucceeded => Vec::new(),
        RunResult::PartialFailure { failed } => failed.iter().map(|id| id.to_string()).collect(),
    };
    let repair = report.repair.as_ref().map(|r| {
        serde_json::json!({
            "resolved": r.is_resolved(),
            "session": r.session().id.to_string(),
            "attempts": r.attempts(),
        })
    });
    serde_json::json!({
        "success": report.is_success(),
        "run": {
            "result": report.run.result,
            "failed": failed,
            "peak_running": report.run.peak_running,
            "sequential": report.run.sequential,
            "cancelled": report.run.cancelled,
            "elapsed_ms": report.run.elapsed.as_millis() as u64,
        },
        "verdict": report.verdict,
        "repair": repair,
    })
}

fn run_resources(config: Config) -> Result<bool> {
    let rt = tokio::runtime::Runtime::new()?;
    let sample = rt.block_on(async {
        let monitor = SamplingMonitor::system(&config.monitor).await;
        monitor.sample()
    });

    let budget = compute_budget(sample.as_ref(), config.governor.concurrency, &config.governor);
    let output = match &sample {
        Ok(s) => serde_json::json!({
            "memory_percent": s.memory_percent(),
            "cpu_percent": s.cpu_percent(),
            "available_memory_gb": s.available_memory_gb(),
            "pressure": PressureLevel::classify(s),
            "budget": budget,
        }),
        Err(e) => serde_json::json!({
            "error": e.to_string(),
            "budget": budget,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(sample.is_ok())
}
