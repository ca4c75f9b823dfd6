//! Memory allocator adapter.
//!
//! Device buffers are handed out as `Arc<DeviceBuffer>`: the framework's storage and the
//! per-operation workspaces hold clones of the same reference-counted handle, and the raw
//! runtime buffer is released exactly once when the last clone goes away.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::device::{Device, DeviceRegistry, DeviceRuntime, RawBuffer};
use crate::error::BridgeResult;
use crate::profiling;

/// Point-in-time allocation counters for one allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub releases: u64,
    pub live_buffers: u64,
    pub live_bytes: u64,
    pub peak_bytes: u64,
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    releases: AtomicU64,
    live_bytes: AtomicU64,
    peak_bytes: AtomicU64,
}

impl Counters {
    fn record_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    fn record_release(&self, bytes: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AllocatorStats {
        let allocations = self.allocations.load(Ordering::Relaxed);
        let releases = self.releases.load(Ordering::Relaxed);
        AllocatorStats {
            allocations,
            releases,
            live_buffers: allocations.saturating_sub(releases),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Owning handle to an accelerator allocation.
pub struct DeviceBuffer {
    runtime: Arc<dyn DeviceRuntime>,
    counters: Arc<Counters>,
    raw: RawBuffer,
    bytes: usize,
    device: Device,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("raw", &self.raw)
            .field("bytes", &self.bytes)
            .field("device", &self.device)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn raw(&self) -> RawBuffer {
        self.raw
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.runtime.release(self.device.index, self.raw);
        self.counters.record_release(self.bytes);
        trace!(
            device = %self.device,
            raw = self.raw.0,
            bytes = self.bytes,
            "released device buffer"
        );
    }
}

/// Allocates device buffers on behalf of the bridge.
#[derive(Clone)]
pub struct Allocator {
    registry: Arc<DeviceRegistry>,
    counters: Arc<Counters>,
}

impl Allocator {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Allocates `bytes` on `device`. Out-of-memory is returned to the caller untouched; the
    /// adapter never retries.
    pub fn allocate(&self, device: Device, bytes: usize) -> BridgeResult<Arc<DeviceBuffer>> {
        self.registry.validate(device)?;
        let runtime = Arc::clone(self.registry.runtime());
        let raw = runtime.allocate(device.index, bytes)?;
        self.counters.record_alloc(bytes);
        profiling::record_allocation(bytes);
        trace!(%device, raw = raw.0, bytes, "allocated device buffer");
        Ok(Arc::new(DeviceBuffer {
            runtime,
            counters: Arc::clone(&self.counters),
            raw,
            bytes,
            device,
        }))
    }

    pub fn stats(&self) -> AllocatorStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_live_and_peak_bytes() {
        let counters = Counters::default();
        counters.record_alloc(64);
        counters.record_alloc(32);
        counters.record_release(64);
        let stats = counters.snapshot();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.live_buffers, 1);
        assert_eq!(stats.live_bytes, 32);
        assert_eq!(stats.peak_bytes, 96);
    }
}
