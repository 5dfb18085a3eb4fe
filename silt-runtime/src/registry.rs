//! # Method Registry
//!
//! A typed registry keyed by `(pool kind, method id)`. Task methods are
//! plain closures over the run context and the task record; there is no
//! dynamic loading, and unknown lookups surface as enumerated errors rather
//! than failures inside the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RuntimeError, RuntimeResult};
use crate::run_context::RunContext;
use crate::task::Task;
use crate::types::{MethodId, PoolKind};

/// A registered task method.
///
/// Within the method the task may suspend through the run context (or the
/// task-level `yield_with`/`wait` wrappers), submit further tasks, and wait
/// on their futures.
pub type MethodFn = Arc<dyn Fn(&RunContext, &mut Task) + Send + Sync>;

/// Registry of task methods per pool kind.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<(PoolKind, MethodId), MethodFn>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Register a method for `(kind, method)`.
    ///
    /// Idempotent: re-registering an existing pair keeps the first
    /// registration and returns `false`.
    pub fn register_method<F>(&self, kind: PoolKind, method: MethodId, f: F) -> bool
    where
        F: Fn(&RunContext, &mut Task) + Send + Sync + 'static,
    {
        let mut methods = self.methods.write();
        if methods.contains_key(&(kind, method)) {
            return false;
        }
        methods.insert((kind, method), Arc::new(f));
        true
    }

    /// Look up the method for `(kind, method)`.
    pub fn resolve(&self, kind: PoolKind, method: MethodId) -> RuntimeResult<MethodFn> {
        self.methods
            .read()
            .get(&(kind, method))
            .cloned()
            .ok_or(RuntimeError::UnknownMethod(method))
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let registry = MethodRegistry::new();
        assert!(registry.register_method(PoolKind(1), MethodId(10), |_ctx, task| {
            task.set_result(7);
        }));
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(PoolKind(1), MethodId(10)).is_ok());
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = MethodRegistry::new();
        assert!(registry.register_method(PoolKind(1), MethodId(10), |_ctx, task| {
            task.set_result(1);
        }));
        // Second registration of the same pair is a no-op.
        assert!(!registry.register_method(PoolKind(1), MethodId(10), |_ctx, task| {
            task.set_result(2);
        }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let err = registry.resolve(PoolKind(1), MethodId(99)).err();
        assert_eq!(err, Some(RuntimeError::UnknownMethod(MethodId(99))));
    }

    #[test]
    fn test_kinds_are_separate() {
        let registry = MethodRegistry::new();
        registry.register_method(PoolKind(1), MethodId(5), |_ctx, _task| {});
        assert!(registry.resolve(PoolKind(2), MethodId(5)).is_err());
    }
}
