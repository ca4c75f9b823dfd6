//! Bridge configuration.

use serde::{Deserialize, Serialize};

use crate::device::DeviceIndex;
use crate::env;

/// Whether bridged operations wait for the device before returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every operation blocks until its queue drains.
    Synchronous,
    /// Operations only enqueue; completion is observed at the next host read.
    #[default]
    Asynchronous,
}

impl ExecutionMode {
    pub fn is_synchronous(self) -> bool {
        self == ExecutionMode::Synchronous
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub execution_mode: ExecutionMode,
    /// Accelerator index used when an allocation does not name a device.
    pub default_device: DeviceIndex,
}

impl BridgeConfig {
    /// Defaults overridden by `DLBRIDGE_SYNC` and `DLBRIDGE_DEVICE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(sync) = env::sync_override() {
            config.execution_mode = if sync {
                ExecutionMode::Synchronous
            } else {
                ExecutionMode::Asynchronous
            };
        }
        if let Some(index) = env::device_override() {
            config.default_device = index;
        }
        config
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_default_device(mut self, index: DeviceIndex) -> Self {
        self.default_device = index;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_asynchronous_on_device_zero() {
        let config = BridgeConfig::default();
        assert_eq!(config.execution_mode, ExecutionMode::Asynchronous);
        assert_eq!(config.default_device, 0);
    }

    #[test]
    fn builder_overrides() {
        let config = BridgeConfig::default()
            .with_execution_mode(ExecutionMode::Synchronous)
            .with_default_device(2);
        assert!(config.execution_mode.is_synchronous());
        assert_eq!(config.default_device, 2);
    }
}
