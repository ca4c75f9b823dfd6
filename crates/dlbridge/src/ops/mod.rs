//! Bridged operations.
//!
//! Every operation follows the same pipeline: decode framework tensors into views, build the
//! primitive configuration, allocate outputs and workspaces, enqueue exactly one primitive call,
//! wrap the result and synchronize when the execution mode asks for it.

mod nn;
mod tensor;

use std::sync::Arc;

use crate::allocator::{Allocator, AllocatorStats};
use crate::config::BridgeConfig;
use crate::context::ContextResolver;
use crate::device::{Device, DeviceRegistry, DeviceRuntime};
use crate::dtype::DType;
use crate::error::{BridgeError, BridgeResult};
use crate::framework::{element_count, Tensor};
use crate::primitives::PrimitiveLibrary;

/// The bridge: registry, allocator, context resolver and primitives library behind the
/// dispatch table.
pub struct Bridge {
    registry: Arc<DeviceRegistry>,
    allocator: Allocator,
    resolver: ContextResolver,
    primitives: Arc<dyn PrimitiveLibrary>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        primitives: Arc<dyn PrimitiveLibrary>,
        config: BridgeConfig,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::with_default_index(
            runtime,
            config.default_device,
        ));
        Self::with_registry(registry, primitives, config)
    }

    /// Builds a bridge on an existing registry; several bridges may share one.
    pub fn with_registry(
        registry: Arc<DeviceRegistry>,
        primitives: Arc<dyn PrimitiveLibrary>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            allocator: Allocator::new(Arc::clone(&registry)),
            resolver: ContextResolver::new(Arc::clone(&registry), config.execution_mode),
            registry,
            primitives,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn resolver(&self) -> &ContextResolver {
        &self.resolver
    }

    pub fn primitives(&self) -> &Arc<dyn PrimitiveLibrary> {
        &self.primitives
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    pub fn default_device(&self) -> Device {
        Device::accelerator(self.config.default_device)
    }

    /// Blocks until all work enqueued on `device` completes.
    pub fn synchronize(&self, device: Device) -> BridgeResult<()> {
        self.registry.synchronize(device)
    }

    /// Drains every queue of the underlying registry.
    pub fn shutdown(&self) -> BridgeResult<()> {
        self.registry.shutdown()
    }

    /// Allocates a packed, uninitialized device tensor.
    pub(crate) fn new_tensor(
        &self,
        sizes: &[i64],
        device: Device,
        dtype: DType,
    ) -> BridgeResult<Tensor> {
        let numel = element_count(sizes).ok_or_else(|| {
            BridgeError::invalid_shape("allocate", format!("invalid sizes {sizes:?}"))
        })?;
        let bytes = numel.checked_mul(dtype.size_in_bytes()).ok_or_else(|| {
            BridgeError::invalid_shape("allocate", format!("{sizes:?} {dtype:?} overflows"))
        })?;
        let buffer = self.allocator.allocate(device, bytes)?;
        crate::bridge::to_framework(buffer, sizes, dtype)
    }
}

/// Converts a two-element framework int list into unsigned per-axis values.
pub(crate) fn pair(op: &'static str, name: &str, values: &[i64]) -> BridgeResult<[usize; 2]> {
    match values {
        [a, b] if *a >= 0 && *b >= 0 => Ok([*a as usize, *b as usize]),
        [_, _] => Err(BridgeError::invalid_argument(
            op,
            format!("{name} must be non-negative, got {values:?}"),
        )),
        _ => Err(BridgeError::invalid_shape(
            op,
            format!("{name} must have 2 entries, got {}", values.len()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_checks_length_and_sign() {
        assert_eq!(pair("op", "stride", &[1, 2]).unwrap(), [1, 2]);
        assert!(matches!(
            pair("op", "stride", &[1]),
            Err(BridgeError::InvalidShape { .. })
        ));
        assert!(matches!(
            pair("op", "stride", &[1, -1]),
            Err(BridgeError::InvalidArgument { .. })
        ));
    }
}
