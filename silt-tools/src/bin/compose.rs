//! Silt pool provisioning utility.
//!
//! Reads a compose file describing pools and registers them in a running
//! runtime's pool directory. Registration is idempotent: re-running a
//! compose file against the same runtime is a no-op for existing pools.
//!
//! # Compose file format
//!
//! ```yaml
//! pools:
//!   - name: ingest
//!     id: 100
//!     kind: 2
//!   - name: publish
//!     id: 101
//!     kind: 3
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde::Deserialize;

use silt_runtime::{PoolId, PoolKind, Runtime, RuntimeConfig};
use silt_shm::log;

/// Provision pools from a compose file.
#[derive(Parser)]
#[command(name = "silt_compose")]
#[command(version)]
#[command(about = "Register pools in a running Silt runtime", long_about = None)]
struct Cli {
    /// Compose file (YAML)
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Shared-memory URL (default: /silt_main_shm or SILT_SHM_URL)
    #[arg(long)]
    shm_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    pools: Vec<PoolSpec>,
}

#[derive(Debug, Deserialize)]
struct PoolSpec {
    name: String,
    id: u64,
    kind: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    log::init_from_env();

    let text = match std::fs::read_to_string(&cli.file) {
        Ok(text) => text,
        Err(e) => {
            log::error(&format!("failed to read {}: {}", cli.file.display(), e));
            return ExitCode::FAILURE;
        }
    };
    let compose: ComposeFile = match serde_yaml::from_str(&text) {
        Ok(compose) => compose,
        Err(e) => {
            log::error(&format!("invalid compose file: {}", e));
            return ExitCode::FAILURE;
        }
    };

    let mut config = RuntimeConfig::from_env();
    if let Some(url) = cli.shm_url {
        config.memory.shm_url = url;
    }
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

    let mut failures = 0usize;
    for pool in &compose.pools {
        match runtime
            .pools()
            .register_pool(PoolId(pool.id), PoolKind(pool.kind), &pool.name)
        {
            Ok(()) => log::info(&format!(
                "registered pool '{}' (id {}, kind {})",
                pool.name, pool.id, pool.kind
            )),
            Err(e) => {
                log::error(&format!("failed to register pool '{}': {}", pool.name, e));
                failures += 1;
            }
        }
    }

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
