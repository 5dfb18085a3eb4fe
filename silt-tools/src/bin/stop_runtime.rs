//! Silt runtime shutdown utility.
//!
//! Attaches to the running runtime as a client and submits the admin stop
//! task, fire-and-forget: the admin lane drains up to the task, then the
//! orchestrator's stop flag is set and workers wind down within the grace
//! period.

use std::process::ExitCode;

use clap::Parser;

use silt_runtime::{Runtime, RuntimeConfig};
use silt_shm::log;

/// Stop the Silt runtime.
#[derive(Parser)]
#[command(name = "silt_stop_runtime")]
#[command(version)]
#[command(about = "Gracefully stop a running Silt runtime", long_about = None)]
struct Cli {
    /// Grace period in milliseconds granted to in-flight tasks
    #[arg(value_name = "GRACE_MS", default_value_t = 5000)]
    grace_ms: u64,

    /// Shared-memory URL (default: /silt_main_shm or SILT_SHM_URL)
    #[arg(long)]
    shm_url: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    log::init_from_env();

    let mut config = RuntimeConfig::from_env();
    if let Some(url) = cli.shm_url {
        config.memory.shm_url = url;
    }
    config.shutdown.grace_period_ms = cli.grace_ms;

    let runtime = match Runtime::attach(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error(&format!(
                "failed to attach (is the runtime running?): {}",
                e
            ));
            return ExitCode::FAILURE;
        }
    };

    match runtime.submit_stop() {
        Ok(_fut) => {
            // Fire-and-forget: the runtime tears itself down; waiting here
            // would race its exit.
            log::info(&format!(
                "stop task submitted (grace period {} ms)",
                cli.grace_ms
            ));
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error(&format!("failed to submit stop task: {}", e));
            ExitCode::FAILURE
        }
    }
}
