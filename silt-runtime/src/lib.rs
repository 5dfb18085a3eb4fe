//! # Silt Runtime
//!
//! A cooperative task runtime over shared memory:
//!
//! - **Tasks and futures** ([`task`], [`future`]): shared-memory task
//!   records with a release/acquire completion protocol and explicit
//!   reaping.
//! - **Task queue** ([`task_queue`]): a multi-lane MPSC ring matrix with
//!   per-lane headers and eventfd wake-up.
//! - **Workers** ([`orchestrator`]): one OS thread per worker,
//!   each owning a disjoint lane set, a run-queue ordered by estimated CPU
//!   time, a blocked set, and a pool of fiber carriers. No work stealing.
//! - **Run contexts and fibers** ([`run_context`]): stackful yield/resume
//!   between a worker and its carriers, with a waiting-for set for nested
//!   waits and cooperative cancellation at suspension points.
//! - **Pools and methods** ([`pool`], [`registry`]): a shared pool
//!   directory and a typed method registry keyed by `(pool kind, method)`.
//! - **The runtime handle** ([`runtime`]): the explicit context value that
//!   wires the pieces together, in both server and client modes.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod future;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod run_context;
pub mod runtime;
pub mod signal;
pub mod sync;
pub mod task;
pub mod task_queue;
pub mod timer;
pub mod types;
pub(crate) mod worker;

// Re-exports
pub use config::{RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use future::Future;
pub use orchestrator::Orchestrator;
pub use pool::PoolManager;
pub use registry::{MethodFn, MethodRegistry};
pub use run_context::{current_run_context, RunContext};
pub use runtime::Runtime;
pub use sync::{CoMutex, CoRwLock};
pub use task::{
    Task, TaskState, RC_CANCELLED, RC_OK, RC_TASK_PANIC, RC_UNKNOWN_METHOD, RC_UNKNOWN_POOL,
};
pub use task_queue::{LaneHeader, QueueEntry, TaskQueue};
pub use types::{
    LaneId, MethodId, PoolId, PoolKind, TaskId, WorkerId, ADMIN_POOL_ID, ADMIN_POOL_KIND,
    METHOD_FLUSH, METHOD_STOP_RUNTIME, METHOD_WATCHDOG,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
