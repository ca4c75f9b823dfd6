//! Device identity, command-queue binding and the driver contract.
//!
//! [`Device`] is the handle the framework attaches to every tensor. The
//! [`DeviceRegistry`](registry::DeviceRegistry) turns accelerator handles into command queues
//! obtained from a [`DeviceRuntime`](runtime::DeviceRuntime).

pub mod registry;
pub mod runtime;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use registry::DeviceRegistry;
pub use runtime::{CommandQueue, DeviceRuntime, Event, RawBuffer};

/// Zero-based ordinal of an accelerator visible to the runtime.
pub type DeviceIndex = usize;

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Host memory owned by the framework.
    Cpu,
    /// Memory reachable only through a command queue.
    Accelerator,
}

/// Device handle carried by framework tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: DeviceIndex,
}

impl Device {
    pub const CPU: Device = Device {
        kind: DeviceKind::Cpu,
        index: 0,
    };

    pub fn accelerator(index: DeviceIndex) -> Self {
        Self {
            kind: DeviceKind::Accelerator,
            index,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }

    pub fn is_accelerator(&self) -> bool {
        self.kind == DeviceKind::Accelerator
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Accelerator => write!(f, "accel:{}", self.index),
        }
    }
}

/// Stream handle exposed to the framework's device guard.
///
/// Every device has exactly one queue, so the stream id is always zero; the type exists so the
/// framework can round-trip the handles it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub device: Device,
    pub id: u64,
}

impl Stream {
    pub fn default_for(device: Device) -> Self {
        Self { device, id: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_compact() {
        assert_eq!(Device::accelerator(3).to_string(), "accel:3");
        assert_eq!(Device::CPU.to_string(), "cpu");
    }

    #[test]
    fn default_stream_is_zero() {
        let stream = Stream::default_for(Device::accelerator(1));
        assert_eq!(stream.id, 0);
        assert_eq!(stream.device.index, 1);
    }
}
