//! Process-wide registry of named bridge constructors.
//!
//! Runtime crates register a constructor under a name (the simulated runtime registers
//! `"sim"`); callers build bridges by name without depending on the concrete runtime type.
//! Bridges themselves stay explicitly constructed objects: the registry only stores factories.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::ops::Bridge;

/// Factory building a fresh bridge (with its own device registry) from a configuration.
pub type BridgeConstructor = Box<dyn Fn(BridgeConfig) -> BridgeResult<Bridge> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<String, BridgeConstructor>>,
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(|| BackendRegistry {
        backends: RwLock::new(HashMap::new()),
    })
}

/// Registers `constructor` under `name`, replacing an earlier registration.
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn(BridgeConfig) -> BridgeResult<Bridge> + Send + Sync + 'static,
{
    if let Ok(mut backends) = global_registry().backends.write() {
        backends.insert(name.into(), Box::new(constructor));
    }
}

/// Builds a bridge with the backend registered as `name`; `None` when nothing is registered.
pub fn create_bridge(name: &str, config: BridgeConfig) -> Option<BridgeResult<Bridge>> {
    let backends = global_registry().backends.read().ok()?;
    let constructor = backends.get(name)?;
    Some(constructor(config))
}

/// Registered backend names, sorted.
pub fn list_backends() -> Vec<String> {
    let mut names: Vec<String> = global_registry()
        .backends
        .read()
        .map(|backends| backends.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

pub fn has_backend(name: &str) -> bool {
    global_registry()
        .backends
        .read()
        .map_or(false, |backends| backends.contains_key(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn constructors_are_looked_up_by_name() {
        register_backend("unavailable", |_| {
            Err(BridgeError::execution("driver not installed"))
        });
        assert!(has_backend("unavailable"));
        assert!(list_backends().contains(&"unavailable".to_string()));
        assert!(matches!(
            create_bridge("unavailable", BridgeConfig::default()),
            Some(Err(BridgeError::Execution { .. }))
        ));
        assert!(create_bridge("never-registered", BridgeConfig::default()).is_none());
    }
}
