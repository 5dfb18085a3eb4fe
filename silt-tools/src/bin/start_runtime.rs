//! Silt runtime launcher.
//!
//! Builds the shared-memory region, starts the workers, and runs until a
//! shutdown signal (SIGTERM/SIGINT) or an admin stop task arrives. Startup
//! is idempotent: a second launcher against the same URL fails cleanly
//! because the backend already exists.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use silt_runtime::{signal, Runtime, RuntimeConfig};
use silt_shm::log;

/// Start the Silt runtime.
#[derive(Parser)]
#[command(name = "silt_start_runtime")]
#[command(version)]
#[command(about = "Start the Silt shared-memory task runtime", long_about = None)]
struct Cli {
    /// Number of worker threads (default: CPU count or SILT_NUM_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Shared-memory URL (default: /silt_main_shm or SILT_SHM_URL)
    #[arg(long)]
    shm_url: Option<String>,

    /// Shared-memory data size in bytes (default: 256 MiB or SILT_SHM_SIZE)
    #[arg(long)]
    shm_size: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    log::init_from_env();

    let mut config = RuntimeConfig::from_env();
    if let Some(workers) = cli.workers {
        config.scheduler.num_workers = workers.max(1);
        config.scheduler.num_lanes = config.scheduler.num_workers * 2;
    }
    if let Some(url) = cli.shm_url {
        config.memory.shm_url = url;
    }
    if let Some(size) = cli.shm_size {
        config.memory.shm_size = size;
    }

    let runtime = match Runtime::create(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error(&format!("failed to create runtime: {}", e));
            return ExitCode::FAILURE;
        }
    };

    signal::install_handlers();
    if !runtime.start() {
        log::error("runtime failed to start (already started?)");
        return ExitCode::FAILURE;
    }
    log::info(&format!(
        "runtime started at {} with {} workers",
        runtime.config().memory.shm_url,
        runtime.config().scheduler.num_workers
    ));

    // Run until a signal or an admin stop task flips the runtime off.
    while runtime.is_running() && !signal::shutdown_requested() {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info("shutting down");
    runtime.stop();
    ExitCode::SUCCESS
}
