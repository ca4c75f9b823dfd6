//! Contract the bridge expects from the accelerator driver.
//!
//! Implementations own the actual device memory and queues. The bridge only ever talks to
//! buffers through [`RawBuffer`] handles plus byte offsets, the same way driver APIs hand out
//! `cl_mem` objects or device pointers.

use std::any::Any;
use std::sync::Arc;

use super::{Device, DeviceIndex};
use crate::error::BridgeResult;

/// Opaque handle to a buffer allocated by a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBuffer(pub u64);

/// Completion token for work enqueued on a [`CommandQueue`].
///
/// Tokens issued by one queue are monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Event(pub u64);

/// Device enumeration, queue creation and buffer lifetime.
pub trait DeviceRuntime: Send + Sync {
    /// Returns a human-readable runtime identifier (e.g. `"sim"`, `"opencl"`).
    fn name(&self) -> &str;

    /// Number of visible accelerators. Enumeration may fail; the registry treats failure as
    /// "no accelerator".
    fn device_count(&self) -> BridgeResult<usize>;

    /// Creates the command queue for `index`. Called at most once per index by the registry.
    fn create_queue(&self, index: DeviceIndex) -> BridgeResult<Arc<dyn CommandQueue>>;

    /// Allocates `bytes` of device memory. Out-of-memory must be reported as
    /// [`BridgeError::ResourceExhausted`](crate::error::BridgeError::ResourceExhausted).
    fn allocate(&self, index: DeviceIndex, bytes: usize) -> BridgeResult<RawBuffer>;

    /// Releases a buffer obtained from [`DeviceRuntime::allocate`]. Work already enqueued
    /// against the buffer must still complete.
    fn release(&self, index: DeviceIndex, buffer: RawBuffer);

    fn as_any(&self) -> &dyn Any;
}

/// Ordered submission channel to one device.
///
/// Work enqueued on one queue executes in enqueue order. Implementations must serialize
/// concurrent submissions themselves.
pub trait CommandQueue: Send + Sync {
    fn device(&self) -> Device;

    /// Enqueues a host-to-device copy of `data` into `dst` at `offset`. The host bytes are
    /// captured before the call returns.
    fn enqueue_write(
        &self,
        dst: RawBuffer,
        offset: usize,
        data: &[u8],
        wait: &[Event],
    ) -> BridgeResult<Event>;

    /// Reads `out.len()` bytes from `src` at `offset`, blocking until the read and all work
    /// enqueued before it complete.
    fn read(&self, src: RawBuffer, offset: usize, out: &mut [u8], wait: &[Event])
        -> BridgeResult<()>;

    /// Enqueues a device-to-device copy.
    #[allow(clippy::too_many_arguments)]
    fn enqueue_copy(
        &self,
        src: RawBuffer,
        src_offset: usize,
        dst: RawBuffer,
        dst_offset: usize,
        bytes: usize,
        wait: &[Event],
    ) -> BridgeResult<Event>;

    /// Blocks until every previously enqueued command has completed.
    fn finish(&self) -> BridgeResult<()>;

    /// Returns `true` when no enqueued work is outstanding.
    fn is_idle(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}
