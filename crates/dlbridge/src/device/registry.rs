//! Device identity and command-queue registry.
//!
//! A registry is an explicitly constructed object: it owns one lazily created queue per device
//! index and the per-thread "current device" state. Several registries may coexist in one
//! process, which keeps tests isolated from each other.
//!
//! Only threads whose current device differs from the default hold an entry, and
//! [`DeviceRegistry::shutdown`] forgets them all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use super::runtime::{CommandQueue, DeviceRuntime};
use super::{Device, DeviceIndex, Stream};
use crate::error::{poisoned, BridgeError, BridgeResult};

pub struct DeviceRegistry {
    runtime: Arc<dyn DeviceRuntime>,
    default_index: DeviceIndex,
    queues: Mutex<HashMap<DeviceIndex, Arc<dyn CommandQueue>>>,
    current: Mutex<HashMap<ThreadId, Device>>,
}

impl DeviceRegistry {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self::with_default_index(runtime, 0)
    }

    /// Creates a registry whose threads start on accelerator `default_index`.
    pub fn with_default_index(
        runtime: Arc<dyn DeviceRuntime>,
        default_index: DeviceIndex,
    ) -> Self {
        Self {
            runtime,
            default_index,
            queues: Mutex::new(HashMap::new()),
            current: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Number of visible accelerators; enumeration failures count as zero.
    pub fn device_count(&self) -> usize {
        match self.runtime.device_count() {
            Ok(count) => count,
            Err(err) => {
                warn!(runtime = self.runtime.name(), error = %err, "device enumeration failed");
                0
            }
        }
    }

    /// The device new threads start on.
    pub fn default_device(&self) -> Device {
        Device::accelerator(self.default_index)
    }

    /// Fails unless `device` names a visible accelerator.
    pub fn validate(&self, device: Device) -> BridgeResult<()> {
        let count = self.device_count();
        if !device.is_accelerator() || device.index >= count {
            return Err(BridgeError::InvalidDevice { device, count });
        }
        Ok(())
    }

    /// Returns the calling thread's current device.
    pub fn current_device(&self) -> BridgeResult<Device> {
        let current = self.current.lock().map_err(|_| poisoned("current device"))?;
        Ok(current
            .get(&thread::current().id())
            .copied()
            .unwrap_or_else(|| self.default_device()))
    }

    pub fn set_device(&self, device: Device) -> BridgeResult<()> {
        self.validate(device)?;
        self.unchecked_set_device(device)
    }

    /// Sets the current device and returns the previous one.
    pub fn exchange_device(&self, device: Device) -> BridgeResult<Device> {
        self.validate(device)?;
        self.store_current(device)
    }

    /// Sets the current device without validating it. Only for callers that already proved the
    /// handle is valid.
    pub fn unchecked_set_device(&self, device: Device) -> BridgeResult<()> {
        self.store_current(device).map(drop)
    }

    fn store_current(&self, device: Device) -> BridgeResult<Device> {
        let mut current = self.current.lock().map_err(|_| poisoned("current device"))?;
        let id = thread::current().id();
        let previous = if device == self.default_device() {
            current.remove(&id)
        } else {
            current.insert(id, device)
        };
        Ok(previous.unwrap_or_else(|| self.default_device()))
    }

    /// Returns the queue bound to `device`, creating it on first use.
    pub fn queue(&self, device: Device) -> BridgeResult<Arc<dyn CommandQueue>> {
        self.validate(device)?;
        let mut queues = self.queues.lock().map_err(|_| poisoned("queue registry"))?;
        if let Some(queue) = queues.get(&device.index) {
            return Ok(Arc::clone(queue));
        }
        let queue = self.runtime.create_queue(device.index)?;
        debug!(runtime = self.runtime.name(), %device, "created command queue");
        queues.insert(device.index, Arc::clone(&queue));
        Ok(queue)
    }

    /// Blocks until all work enqueued on `device` has completed.
    pub fn synchronize(&self, device: Device) -> BridgeResult<()> {
        self.queue(device)?.finish()
    }

    pub fn stream(&self, device: Device) -> Stream {
        Stream::default_for(device)
    }

    pub fn default_stream(&self, device: Device) -> Stream {
        self.stream(device)
    }

    /// Streams cannot be swapped: one queue per device. Returns the current device's stream.
    pub fn exchange_stream(&self, _stream: Stream) -> BridgeResult<Stream> {
        Ok(self.stream(self.current_device()?))
    }

    /// Returns `true` when the stream has no outstanding work.
    pub fn query_stream(&self, stream: &Stream) -> BridgeResult<bool> {
        let queues = self.queues.lock().map_err(|_| poisoned("queue registry"))?;
        Ok(queues
            .get(&stream.device.index)
            .map_or(true, |queue| queue.is_idle()))
    }

    pub fn synchronize_stream(&self, stream: &Stream) -> BridgeResult<()> {
        self.synchronize(stream.device)
    }

    /// Drains and drops every queue and resets every thread to the default device. Later calls
    /// recreate queues lazily.
    pub fn shutdown(&self) -> BridgeResult<()> {
        self.current
            .lock()
            .map_err(|_| poisoned("current device"))?
            .clear();
        let drained: Vec<_> = {
            let mut queues = self.queues.lock().map_err(|_| poisoned("queue registry"))?;
            queues.drain().collect()
        };
        let mut first_err = None;
        for (index, queue) in drained {
            if let Err(err) = queue.finish() {
                warn!(index, error = %err, "queue failed to drain during shutdown");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of queues created so far.
    pub fn live_queues(&self) -> usize {
        self.queues.lock().map(|queues| queues.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_threads(&self) -> usize {
        self.current.lock().map(|current| current.len()).unwrap_or(0)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::runtime::{Event, RawBuffer};

    struct CountingQueue {
        device: Device,
        finishes: AtomicUsize,
    }

    impl CommandQueue for CountingQueue {
        fn device(&self) -> Device {
            self.device
        }

        fn enqueue_write(
            &self,
            _dst: RawBuffer,
            _offset: usize,
            _data: &[u8],
            _wait: &[Event],
        ) -> BridgeResult<Event> {
            Ok(Event(0))
        }

        fn read(
            &self,
            _src: RawBuffer,
            _offset: usize,
            _out: &mut [u8],
            _wait: &[Event],
        ) -> BridgeResult<()> {
            Ok(())
        }

        fn enqueue_copy(
            &self,
            _src: RawBuffer,
            _src_offset: usize,
            _dst: RawBuffer,
            _dst_offset: usize,
            _bytes: usize,
            _wait: &[Event],
        ) -> BridgeResult<Event> {
            Ok(Event(0))
        }

        fn finish(&self) -> BridgeResult<()> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_idle(&self) -> bool {
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct FakeRuntime {
        count: Option<usize>,
        created: AtomicUsize,
    }

    impl FakeRuntime {
        fn with_devices(count: usize) -> Arc<Self> {
            Arc::new(Self {
                count: Some(count),
                created: AtomicUsize::new(0),
            })
        }
    }

    impl DeviceRuntime for FakeRuntime {
        fn name(&self) -> &str {
            "fake"
        }

        fn device_count(&self) -> BridgeResult<usize> {
            self.count
                .ok_or_else(|| BridgeError::execution("enumeration failed"))
        }

        fn create_queue(&self, index: DeviceIndex) -> BridgeResult<Arc<dyn CommandQueue>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingQueue {
                device: Device::accelerator(index),
                finishes: AtomicUsize::new(0),
            }))
        }

        fn allocate(&self, _index: DeviceIndex, _bytes: usize) -> BridgeResult<RawBuffer> {
            Ok(RawBuffer(1))
        }

        fn release(&self, _index: DeviceIndex, _buffer: RawBuffer) {}

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn enumeration_failure_reports_zero_devices() {
        let runtime = Arc::new(FakeRuntime {
            count: None,
            created: AtomicUsize::new(0),
        });
        let registry = DeviceRegistry::new(runtime);
        assert_eq!(registry.device_count(), 0);
        assert!(matches!(
            registry.queue(Device::accelerator(0)),
            Err(BridgeError::InvalidDevice { count: 0, .. })
        ));
    }

    #[test]
    fn queues_are_created_once_per_index() {
        let runtime = FakeRuntime::with_devices(2);
        let registry = DeviceRegistry::new(runtime.clone());
        let a = registry.queue(Device::accelerator(1)).unwrap();
        let b = registry.queue(Device::accelerator(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(runtime.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_queues(), 1);
    }

    #[test]
    fn exchange_returns_previous_device() {
        let registry = DeviceRegistry::new(FakeRuntime::with_devices(2));
        assert_eq!(registry.current_device().unwrap(), Device::accelerator(0));
        let previous = registry.exchange_device(Device::accelerator(1)).unwrap();
        assert_eq!(previous, Device::accelerator(0));
        assert_eq!(registry.current_device().unwrap(), Device::accelerator(1));
    }

    #[test]
    fn set_device_rejects_out_of_range_and_cpu() {
        let registry = DeviceRegistry::new(FakeRuntime::with_devices(1));
        assert!(registry.set_device(Device::accelerator(1)).is_err());
        assert!(registry.set_device(Device::CPU).is_err());
        registry.unchecked_set_device(Device::accelerator(7)).unwrap();
        assert_eq!(registry.current_device().unwrap(), Device::accelerator(7));
    }

    #[test]
    fn current_device_is_per_thread() {
        let registry = Arc::new(DeviceRegistry::new(FakeRuntime::with_devices(2)));
        registry.set_device(Device::accelerator(1)).unwrap();
        let other = Arc::clone(&registry);
        let seen = thread::spawn(move || other.current_device().unwrap())
            .join()
            .unwrap();
        assert_eq!(seen, Device::accelerator(0));
        assert_eq!(registry.current_device().unwrap(), Device::accelerator(1));
    }

    #[test]
    fn only_non_default_threads_are_tracked() {
        let registry = Arc::new(DeviceRegistry::new(FakeRuntime::with_devices(2)));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry.set_device(Device::accelerator(1)).unwrap();
                    registry.set_device(Device::accelerator(0)).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.tracked_threads(), 0);

        registry.set_device(Device::accelerator(1)).unwrap();
        assert_eq!(registry.tracked_threads(), 1);
        let previous = registry.exchange_device(Device::accelerator(0)).unwrap();
        assert_eq!(previous, Device::accelerator(1));
        assert_eq!(registry.tracked_threads(), 0);
    }

    #[test]
    fn shutdown_forgets_current_devices() {
        let registry = DeviceRegistry::new(FakeRuntime::with_devices(2));
        registry.set_device(Device::accelerator(1)).unwrap();
        registry.shutdown().unwrap();
        assert_eq!(registry.tracked_threads(), 0);
        assert_eq!(registry.current_device().unwrap(), Device::accelerator(0));
    }

    #[test]
    fn shutdown_drains_queues() {
        let registry = DeviceRegistry::new(FakeRuntime::with_devices(1));
        let queue = registry.queue(Device::accelerator(0)).unwrap();
        registry.shutdown().unwrap();
        assert_eq!(registry.live_queues(), 0);
        let counting = queue.as_any().downcast_ref::<CountingQueue>().unwrap();
        assert_eq!(counting.finishes.load(Ordering::SeqCst), 1);
        assert!(registry
            .query_stream(&registry.stream(Device::accelerator(0)))
            .unwrap());
    }
}
