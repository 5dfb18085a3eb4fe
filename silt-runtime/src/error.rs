//! Error types for the runtime kernel.

use std::fmt;

use silt_shm::ShmError;

use crate::types::{MethodId, PoolId};

/// Errors surfaced at the runtime boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// No pool registered under this id.
    UnknownPool(PoolId),
    /// No method registered under this (kind, method) pair.
    UnknownMethod(MethodId),
    /// The destination lane's ring is full.
    QueueFull,
    /// The runtime is not running (not started, or already stopped).
    NotRunning,
    /// An underlying shared-memory operation failed.
    Shm(ShmError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::UnknownPool(id) => write!(f, "unknown pool {}", id),
            RuntimeError::UnknownMethod(id) => write!(f, "unknown method {}", id.0),
            RuntimeError::QueueFull => write!(f, "task queue lane is full"),
            RuntimeError::NotRunning => write!(f, "runtime is not running"),
            RuntimeError::Shm(e) => write!(f, "shared memory error: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Shm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for RuntimeError {
    fn from(e: ShmError) -> Self {
        RuntimeError::Shm(e)
    }
}

/// Convenience result alias.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            RuntimeError::UnknownPool(PoolId(9)).to_string(),
            "unknown pool pool:9"
        );
        assert_eq!(RuntimeError::QueueFull.to_string(), "task queue lane is full");
        assert_eq!(
            RuntimeError::Shm(ShmError::OutOfMemory).to_string(),
            "shared memory error: out of memory"
        );
    }

    #[test]
    fn test_from_shm_error() {
        let e: RuntimeError = ShmError::NoSpace.into();
        assert_eq!(e, RuntimeError::Shm(ShmError::NoSpace));
    }
}
