//! Name-keyed operation table the framework dispatcher calls into.
//!
//! Kernels take positional [`Value`]s, decode them, run the typed operation on a [`Bridge`]
//! and return positional results. Operations that are not registered report
//! [`BridgeError::NotRegistered`] so the framework can fall back to its default path.

mod kernels;
mod value;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

pub use kernels::register_bridge_ops;
pub use value::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::ops::Bridge;
use crate::profiling;

/// Dispatch key a kernel is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DispatchKey {
    /// Plain accelerator kernels.
    Accelerator,
    /// Kernels that sit in front of the autograd engine for accelerator tensors.
    AutogradAccelerator,
}

/// Type-erased bridged operation.
pub type Kernel = Arc<dyn Fn(&Bridge, Vec<Value>) -> BridgeResult<Vec<Value>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct DispatchTable {
    kernels: HashMap<DispatchKey, HashMap<&'static str, Kernel>>,
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.kernels.keys().copied().collect();
        keys.sort();
        let mut table = f.debug_struct("DispatchTable");
        for key in keys {
            table.field(&format!("{key:?}"), &self.ops(key));
        }
        table.finish()
    }
}

/// Accepts both `aten::relu_` and `relu_`.
fn strip_namespace(name: &str) -> &str {
    name.strip_prefix("aten::").unwrap_or(name)
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding every bridged operation.
    pub fn with_bridge_ops() -> Self {
        let mut table = Self::new();
        register_bridge_ops(&mut table);
        table
    }

    /// Registers `kernel`, replacing any previous kernel for the same key and name.
    pub fn register<F>(&mut self, key: DispatchKey, name: &'static str, kernel: F)
    where
        F: Fn(&Bridge, Vec<Value>) -> BridgeResult<Vec<Value>> + Send + Sync + 'static,
    {
        self.kernels
            .entry(key)
            .or_default()
            .insert(strip_namespace(name), Arc::new(kernel));
    }

    pub fn contains(&self, key: DispatchKey, name: &str) -> bool {
        self.kernels
            .get(&key)
            .map_or(false, |ops| ops.contains_key(strip_namespace(name)))
    }

    pub fn lookup(&self, key: DispatchKey, name: &str) -> Option<Kernel> {
        self.kernels
            .get(&key)?
            .get(strip_namespace(name))
            .map(Arc::clone)
    }

    /// Names registered under `key`, sorted.
    pub fn ops(&self, key: DispatchKey) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .kernels
            .get(&key)
            .map(|ops| ops.keys().copied().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Total number of registered kernels across keys.
    pub fn len(&self) -> usize {
        self.kernels.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the kernel registered for `(key, name)`.
    pub fn call(
        &self,
        bridge: &Bridge,
        key: DispatchKey,
        name: &str,
        args: Vec<Value>,
    ) -> BridgeResult<Vec<Value>> {
        let name = strip_namespace(name);
        let Some((op, kernel)) = self
            .kernels
            .get(&key)
            .and_then(|ops| ops.get_key_value(name))
        else {
            return Err(BridgeError::NotRegistered {
                op: name.to_string(),
            });
        };
        let op: &'static str = *op;
        debug!(?key, op, args = args.len(), "dispatch");
        let mut scope = profiling::op_scope(op);
        let result = kernel(bridge, args);
        if result.is_err() {
            scope.fail();
        }
        result
    }
}
