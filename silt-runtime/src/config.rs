//! Runtime Configuration
//!
//! Configuration for the runtime kernel, settable programmatically or from
//! environment variables.
//!
//! # Environment Variables
//!
//! All variables use the `SILT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SILT_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `SILT_NUM_LANES` | Total queue lanes | 2 × workers |
//! | `SILT_NUM_PRIOS` | Priority levels per lane | 2 |
//! | `SILT_QUEUE_DEPTH` | Entries per (lane, priority) ring | 1024 |
//! | `SILT_STACKS_PER_WORKER` | Fiber carriers per worker | 32 |
//! | `SILT_SHM_SIZE` | Backend data size in bytes | 268435456 (256 MiB) |
//! | `SILT_SHM_URL` | Backend URL | `/silt_main_shm` |
//! | `SILT_GRACE_PERIOD_MS` | Stop grace period in milliseconds | 5000 |
//!
//! The logging subsystem reads `SILT_LOG_LEVEL` and `SILT_LOG_FILE`
//! separately; see the substrate crate.

use std::env;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Total number of queue lanes, assigned round-robin to workers.
    /// Default: 2 × num_workers.
    pub num_lanes: usize,

    /// Priority levels per lane.
    /// Default: 2.
    pub num_prios: usize,

    /// Ring depth per (lane, priority).
    /// Default: 1024.
    pub queue_depth: usize,

    /// Fiber carriers (stacks) per worker; bounds the number of in-flight
    /// task invocations per worker.
    /// Default: 32.
    pub stacks_per_worker: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = num_cpus();
        Self {
            num_workers: workers,
            num_lanes: workers * 2,
            num_prios: 2,
            queue_depth: 1024,
            stacks_per_worker: 32,
        }
    }
}

/// Shared-memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Backend data-region size in bytes.
    /// Default: 256 MiB.
    pub shm_size: usize,

    /// Backend URL.
    /// Default: `/silt_main_shm`.
    pub shm_url: String,

    /// Backend identity.
    pub backend_id: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            shm_size: 256 * 1024 * 1024,
            shm_url: "/silt_main_shm".into(),
            backend_id: 0,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Grace period granted to in-flight tasks on stop, in milliseconds.
    /// Default: 5000.
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// Shared-memory configuration.
    pub memory: MemoryConfig,
    /// Shutdown configuration.
    pub shutdown: ShutdownConfig,
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `SILT_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("SILT_NUM_WORKERS") {
            config.scheduler.num_workers = v.max(1);
            config.scheduler.num_lanes = config.scheduler.num_workers * 2;
        }
        if let Some(v) = env_usize("SILT_NUM_LANES") {
            config.scheduler.num_lanes = v.max(1);
        }
        if let Some(v) = env_usize("SILT_NUM_PRIOS") {
            config.scheduler.num_prios = v.max(1);
        }
        if let Some(v) = env_usize("SILT_QUEUE_DEPTH") {
            config.scheduler.queue_depth = v.max(2);
        }
        if let Some(v) = env_usize("SILT_STACKS_PER_WORKER") {
            config.scheduler.stacks_per_worker = v.max(1);
        }
        if let Some(v) = env_usize("SILT_SHM_SIZE") {
            config.memory.shm_size = v;
        }
        if let Ok(url) = env::var("SILT_SHM_URL") {
            if !url.is_empty() {
                config.memory.shm_url = url;
            }
        }
        if let Some(v) = env_usize("SILT_GRACE_PERIOD_MS") {
            config.shutdown.grace_period_ms = v as u64;
        }
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the worker count (lanes follow at 2 × workers unless set).
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n.max(1);
        self.config.scheduler.num_lanes = n.max(1) * 2;
        self
    }

    /// Set the lane count.
    pub fn num_lanes(mut self, n: usize) -> Self {
        self.config.scheduler.num_lanes = n.max(1);
        self
    }

    /// Set the priority level count.
    pub fn num_prios(mut self, n: usize) -> Self {
        self.config.scheduler.num_prios = n.max(1);
        self
    }

    /// Set the per-ring depth.
    pub fn queue_depth(mut self, n: usize) -> Self {
        self.config.scheduler.queue_depth = n.max(2);
        self
    }

    /// Set the carriers-per-worker bound.
    pub fn stacks_per_worker(mut self, n: usize) -> Self {
        self.config.scheduler.stacks_per_worker = n.max(1);
        self
    }

    /// Set the backend data size.
    pub fn shm_size(mut self, bytes: usize) -> Self {
        self.config.memory.shm_size = bytes;
        self
    }

    /// Set the backend URL.
    pub fn shm_url(mut self, url: impl Into<String>) -> Self {
        self.config.memory.shm_url = url.into();
        self
    }

    /// Set the stop grace period.
    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.config.shutdown.grace_period_ms = ms;
        self
    }

    /// Finish building.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.num_lanes, config.scheduler.num_workers * 2);
        assert_eq!(config.scheduler.num_prios, 2);
        assert_eq!(config.scheduler.queue_depth, 1024);
        assert_eq!(config.memory.shm_url, "/silt_main_shm");
        assert_eq!(config.shutdown.grace_period_ms, 5000);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(3)
            .num_prios(4)
            .queue_depth(64)
            .stacks_per_worker(8)
            .shm_size(32 << 20)
            .shm_url("/silt_test")
            .grace_period_ms(100)
            .build();
        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.scheduler.num_lanes, 6);
        assert_eq!(config.scheduler.num_prios, 4);
        assert_eq!(config.scheduler.queue_depth, 64);
        assert_eq!(config.scheduler.stacks_per_worker, 8);
        assert_eq!(config.memory.shm_size, 32 << 20);
        assert_eq!(config.memory.shm_url, "/silt_test");
        assert_eq!(config.shutdown.grace_period_ms, 100);
    }

    #[test]
    fn test_builder_clamps_minimums() {
        let config = RuntimeConfig::builder()
            .num_workers(0)
            .queue_depth(0)
            .build();
        assert_eq!(config.scheduler.num_workers, 1);
        assert_eq!(config.scheduler.queue_depth, 2);
    }
}
