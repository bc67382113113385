//! Logging setup for swarm.
//!
//! Log levels:
//! - ERROR: failures that end a run or a repair session
//! - WARN: recoverable conditions (monitor failure, sequential fallback, pressure pause)
//! - INFO: run lifecycle, budget changes, repair verdicts
//! - DEBUG: per-task dispatch and completion
//! - TRACE: raw resource samples
//!
//! Debug mode can be enabled with `--debug` or `SWARM_DEBUG=1`. `SWARM_LOG`
//! takes a full `EnvFilter` directive and wins over both.

use tracing_subscriber::EnvFilter;

pub const ENV_DEBUG: &str = "SWARM_DEBUG";
pub const ENV_FILTER: &str = "SWARM_LOG";

/// Initialize logging with explicit debug mode setting. Safe to call twice.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_env(ENV_FILTER)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(ENV_DEBUG)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "swarm=debug,info"
    } else {
        "info"
    }
}
