//! Device-backend bridge between a tensor framework and command-queue accelerators.
//!
//! The crate translates framework tensor descriptors into packed buffer views, ties device
//! buffer lifetime to shared ownership handles, decides when to wait for the device and exposes
//! every bridged operation through a name-keyed [`dispatch::DispatchTable`]. Math is delegated
//! to a [`primitives::PrimitiveLibrary`]; memory and queues come from a
//! [`device::DeviceRuntime`].

pub mod allocator;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod dtype;
mod env;
pub mod error;
pub mod framework;
pub mod ops;
pub mod primitives;
pub mod profiling;

pub use allocator::{Allocator, AllocatorStats, DeviceBuffer};
pub use bridge::TensorView;
pub use config::{BridgeConfig, ExecutionMode};
pub use context::{ContextResolver, ExecutionContext};
pub use device::{Device, DeviceKind, DeviceRegistry};
pub use dispatch::{DispatchKey, DispatchTable, Value};
pub use dtype::DType;
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use framework::{Scalar, Tensor};
pub use ops::Bridge;
