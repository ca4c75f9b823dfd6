//! In-process accelerator: host-resident "device" memory and command queues that execute on a
//! dedicated worker thread in enqueue order.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, LockResult, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use dlbridge::device::{CommandQueue, DeviceIndex, DeviceRuntime, Event, RawBuffer};
use dlbridge::{BridgeError, BridgeResult, Device};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Simulated device memory backing one [`RawBuffer`].
///
/// The bytes count against the device capacity until the last handle drops, including handles
/// captured by commands still waiting on a queue.
pub struct SimAllocation {
    bytes: RwLock<Vec<u8>>,
    used: Arc<AtomicUsize>,
}

impl SimAllocation {
    pub fn read(&self) -> LockResult<RwLockReadGuard<'_, Vec<u8>>> {
        self.bytes.read()
    }

    pub fn write(&self) -> LockResult<RwLockWriteGuard<'_, Vec<u8>>> {
        self.bytes.write()
    }
}

impl Drop for SimAllocation {
    fn drop(&mut self) {
        let len = match self.bytes.get_mut() {
            Ok(bytes) => bytes.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        self.used.fetch_sub(len, Ordering::AcqRel);
    }
}

pub type SimBuffer = Arc<SimAllocation>;

/// Deferred work executed by a queue's worker thread.
pub type Command = Box<dyn FnOnce() -> BridgeResult<()> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of accelerators reported by enumeration.
    pub devices: usize,
    /// Per-device memory capacity in bytes.
    pub capacity_bytes: usize,
    /// Makes device enumeration fail, as a broken driver installation would.
    pub fail_enumeration: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            capacity_bytes: 256 << 20,
            fail_enumeration: false,
        }
    }
}

impl SimConfig {
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_capacity(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_failing_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }
}

fn poisoned(what: &str) -> BridgeError {
    BridgeError::execution(format!("{what} lock poisoned"))
}

/// Memory of one simulated device.
pub(crate) struct SimMemory {
    device: Device,
    capacity: usize,
    next_id: AtomicU64,
    buffers: Mutex<HashMap<u64, SimBuffer>>,
    used: Arc<AtomicUsize>,
}

impl SimMemory {
    fn new(index: DeviceIndex, capacity: usize) -> Self {
        Self {
            device: Device::accelerator(index),
            capacity,
            next_id: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn allocate(&self, bytes: usize) -> BridgeResult<RawBuffer> {
        // Allocations serialize on the map lock; drops only ever lower `used`.
        let mut buffers = self.buffers.lock().map_err(|_| poisoned("device arena"))?;
        let available = self
            .capacity
            .saturating_sub(self.used.load(Ordering::Acquire));
        if bytes > available {
            return Err(BridgeError::ResourceExhausted {
                device: self.device,
                requested: bytes,
                available,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.used.fetch_add(bytes, Ordering::AcqRel);
        let allocation = SimAllocation {
            bytes: RwLock::new(vec![0u8; bytes]),
            used: Arc::clone(&self.used),
        };
        buffers.insert(id, Arc::new(allocation));
        Ok(RawBuffer(id))
    }

    /// Forgets the handle. The bytes stay in use until pending commands drop their clones.
    fn release(&self, raw: RawBuffer) {
        let Ok(mut buffers) = self.buffers.lock() else {
            return;
        };
        if buffers.remove(&raw.0).is_none() {
            warn!(device = %self.device, raw = raw.0, "release of unknown buffer");
        }
    }

    fn resolve(&self, raw: RawBuffer) -> BridgeResult<SimBuffer> {
        let buffers = self.buffers.lock().map_err(|_| poisoned("device arena"))?;
        buffers.get(&raw.0).cloned().ok_or_else(|| {
            BridgeError::execution(format!("unknown buffer {} on {}", raw.0, self.device))
        })
    }

    fn usage(&self) -> (usize, usize) {
        let live = self.buffers.lock().map(|buffers| buffers.len()).unwrap_or(0);
        (live, self.used.load(Ordering::Acquire))
    }
}

/// Simulated driver: device enumeration, buffer lifetime and queue creation.
pub struct SimRuntime {
    config: SimConfig,
    memories: Vec<Arc<SimMemory>>,
}

impl SimRuntime {
    pub fn new(config: SimConfig) -> Self {
        let memories = (0..config.devices)
            .map(|index| Arc::new(SimMemory::new(index, config.capacity_bytes)))
            .collect();
        Self { config, memories }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn memory(&self, index: DeviceIndex) -> BridgeResult<&Arc<SimMemory>> {
        self.memories.get(index).ok_or(BridgeError::InvalidDevice {
            device: Device::accelerator(index),
            count: self.memories.len(),
        })
    }

    /// Live buffers on `index`.
    pub fn live_buffers(&self, index: DeviceIndex) -> usize {
        self.memories.get(index).map_or(0, |memory| memory.usage().0)
    }

    /// Bytes allocated on `index`, including released buffers that queued commands still hold.
    pub fn bytes_in_use(&self, index: DeviceIndex) -> usize {
        self.memories.get(index).map_or(0, |memory| memory.usage().1)
    }
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl DeviceRuntime for SimRuntime {
    fn name(&self) -> &str {
        "sim"
    }

    fn device_count(&self) -> BridgeResult<usize> {
        if self.config.fail_enumeration {
            return Err(BridgeError::execution("simulated enumeration failure"));
        }
        Ok(self.memories.len())
    }

    fn create_queue(&self, index: DeviceIndex) -> BridgeResult<Arc<dyn CommandQueue>> {
        let memory = Arc::clone(self.memory(index)?);
        Ok(Arc::new(SimQueue::spawn(memory)?))
    }

    fn allocate(&self, index: DeviceIndex, bytes: usize) -> BridgeResult<RawBuffer> {
        self.memory(index)?.allocate(bytes)
    }

    fn release(&self, index: DeviceIndex, buffer: RawBuffer) {
        if let Ok(memory) = self.memory(index) {
            memory.release(buffer);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Job {
    id: u64,
    label: &'static str,
    command: Command,
}

#[derive(Default)]
struct Progress {
    completed: u64,
    error: Option<BridgeError>,
}

/// State shared between a queue handle and its worker thread.
#[derive(Default)]
struct Shared {
    progress: Mutex<Progress>,
    done: Condvar,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl Shared {
    fn wait_while_paused(&self) {
        let Ok(mut paused) = self.paused.lock() else {
            return;
        };
        while *paused {
            paused = match self.resumed.wait(paused) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    fn complete(&self, id: u64, result: BridgeResult<()>) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.completed = id;
            if let Err(err) = result {
                progress.error.get_or_insert(err);
            }
        }
        self.done.notify_all();
    }

    fn wait_for(&self, id: u64) -> BridgeResult<()> {
        let mut progress = self.progress.lock().map_err(|_| poisoned("queue progress"))?;
        while progress.completed < id {
            progress = self
                .done
                .wait(progress)
                .map_err(|_| poisoned("queue progress"))?;
        }
        match progress.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Submitter {
    sender: Option<Sender<Job>>,
    submitted: u64,
}

/// In-order command queue backed by one worker thread.
///
/// Commands run strictly in submission order. Failures are recorded and reported by the next
/// blocking call (`finish` or `read`) on the queue.
pub struct SimQueue {
    memory: Arc<SimMemory>,
    shared: Arc<Shared>,
    submitter: Mutex<Submitter>,
    worker: Option<JoinHandle<()>>,
}

impl SimQueue {
    fn spawn(memory: Arc<SimMemory>) -> BridgeResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let device = memory.device;
        let worker = thread::Builder::new()
            .name(format!("sim-queue-{}", device.index))
            .spawn(move || {
                for job in receiver {
                    worker_shared.wait_while_paused();
                    trace!(%device, id = job.id, label = job.label, "executing command");
                    let result = (job.command)();
                    if let Err(err) = &result {
                        warn!(
                            %device,
                            id = job.id,
                            label = job.label,
                            error = %err,
                            "command failed"
                        );
                    }
                    worker_shared.complete(job.id, result);
                }
            })
            .map_err(|err| BridgeError::execution(format!("failed to spawn queue worker: {err}")))?;
        debug!(%device, "spawned simulated queue");
        Ok(Self {
            memory,
            shared,
            submitter: Mutex::new(Submitter {
                sender: Some(sender),
                submitted: 0,
            }),
            worker: Some(worker),
        })
    }

    /// Looks up the memory behind `raw`. Commands capture the returned handle, so a buffer
    /// released after submission stays alive until the command has run.
    pub fn buffer(&self, raw: RawBuffer) -> BridgeResult<SimBuffer> {
        self.memory.resolve(raw)
    }

    /// Enqueues `command` behind everything submitted so far.
    pub fn submit<F>(&self, label: &'static str, command: F) -> BridgeResult<Event>
    where
        F: FnOnce() -> BridgeResult<()> + Send + 'static,
    {
        let mut submitter = self.submitter.lock().map_err(|_| poisoned("queue submitter"))?;
        let id = submitter.submitted + 1;
        let sender = submitter
            .sender
            .as_ref()
            .ok_or_else(|| BridgeError::execution("queue is shut down"))?;
        sender
            .send(Job {
                id,
                label,
                command: Box::new(command),
            })
            .map_err(|_| BridgeError::execution("queue worker exited"))?;
        submitter.submitted = id;
        Ok(Event(id))
    }

    fn submitted(&self) -> BridgeResult<u64> {
        Ok(self
            .submitter
            .lock()
            .map_err(|_| poisoned("queue submitter"))?
            .submitted)
    }

    /// Number of commands that have finished executing.
    pub fn completed(&self) -> u64 {
        self.shared
            .progress
            .lock()
            .map(|progress| progress.completed)
            .unwrap_or(0)
    }

    /// Holds the worker before its next command until [`SimQueue::resume`].
    pub fn pause(&self) {
        if let Ok(mut paused) = self.shared.paused.lock() {
            *paused = true;
        }
    }

    pub fn resume(&self) {
        if let Ok(mut paused) = self.shared.paused.lock() {
            *paused = false;
        }
        self.shared.resumed.notify_all();
    }
}

impl CommandQueue for SimQueue {
    fn device(&self) -> Device {
        self.memory.device
    }

    fn enqueue_write(
        &self,
        dst: RawBuffer,
        offset: usize,
        data: &[u8],
        _wait: &[Event],
    ) -> BridgeResult<Event> {
        let buffer = self.buffer(dst)?;
        let data = data.to_vec();
        self.submit("write", move || {
            let mut bytes = buffer.write().map_err(|_| poisoned("device buffer"))?;
            let end = offset.saturating_add(data.len());
            let len = bytes.len();
            bytes
                .get_mut(offset..end)
                .ok_or_else(|| {
                    BridgeError::execution(format!(
                        "write [{offset}, {end}) past buffer of {len} bytes"
                    ))
                })?
                .copy_from_slice(&data);
            Ok(())
        })
    }

    fn read(
        &self,
        src: RawBuffer,
        offset: usize,
        out: &mut [u8],
        _wait: &[Event],
    ) -> BridgeResult<()> {
        let buffer = self.buffer(src)?;
        self.finish()?;
        let bytes = buffer.read().map_err(|_| poisoned("device buffer"))?;
        let end = offset.saturating_add(out.len());
        let region = bytes.get(offset..end).ok_or_else(|| {
            BridgeError::execution(format!(
                "read [{offset}, {end}) past buffer of {} bytes",
                bytes.len()
            ))
        })?;
        out.copy_from_slice(region);
        Ok(())
    }

    fn enqueue_copy(
        &self,
        src: RawBuffer,
        src_offset: usize,
        dst: RawBuffer,
        dst_offset: usize,
        bytes: usize,
        _wait: &[Event],
    ) -> BridgeResult<Event> {
        let source = self.buffer(src)?;
        let target = self.buffer(dst)?;
        self.submit("copy", move || {
            let staged = {
                let data = source.read().map_err(|_| poisoned("device buffer"))?;
                data.get(src_offset..src_offset.saturating_add(bytes))
                    .ok_or_else(|| BridgeError::execution("copy source out of range"))?
                    .to_vec()
            };
            let mut data = target.write().map_err(|_| poisoned("device buffer"))?;
            data.get_mut(dst_offset..dst_offset.saturating_add(bytes))
                .ok_or_else(|| BridgeError::execution("copy target out of range"))?
                .copy_from_slice(&staged);
            Ok(())
        })
    }

    fn finish(&self) -> BridgeResult<()> {
        let target = self.submitted()?;
        self.shared.wait_for(target)
    }

    fn is_idle(&self) -> bool {
        match self.submitted() {
            Ok(submitted) => self.completed() >= submitted,
            Err(_) => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for SimQueue {
    fn drop(&mut self) {
        self.resume();
        if let Ok(mut submitter) = self.submitter.lock() {
            submitter.sender.take();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_capacity() {
        let runtime = SimRuntime::new(SimConfig::default().with_capacity(64));
        let a = runtime.allocate(0, 48).unwrap();
        let err = runtime.allocate(0, 32).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ResourceExhausted {
                requested: 32,
                available: 16,
                ..
            }
        ));
        runtime.release(0, a);
        assert_eq!(runtime.bytes_in_use(0), 0);
        runtime.allocate(0, 64).unwrap();
    }

    #[test]
    fn enumeration_failure_is_an_error() {
        let runtime = SimRuntime::new(SimConfig::default().with_failing_enumeration());
        assert!(runtime.device_count().is_err());
    }

    #[test]
    fn commands_run_in_submission_order() {
        let runtime = SimRuntime::default();
        let queue = runtime.create_queue(0).unwrap();
        let raw = runtime.allocate(0, 4).unwrap();
        queue.enqueue_write(raw, 0, &[1, 2, 3, 4], &[]).unwrap();
        queue.enqueue_write(raw, 2, &[9, 9], &[]).unwrap();
        let mut out = [0u8; 4];
        queue.read(raw, 0, &mut out, &[]).unwrap();
        assert_eq!(out, [1, 2, 9, 9]);
    }

    #[test]
    fn paused_queue_is_not_idle_until_resumed() {
        let runtime = SimRuntime::default();
        let queue = runtime.create_queue(0).unwrap();
        let sim = queue.as_any().downcast_ref::<SimQueue>().unwrap();
        sim.pause();
        sim.submit("noop", || Ok(())).unwrap();
        assert!(!queue.is_idle());
        sim.resume();
        queue.finish().unwrap();
        assert!(queue.is_idle());
        assert_eq!(sim.completed(), 1);
    }

    #[test]
    fn failures_surface_on_finish_once() {
        let runtime = SimRuntime::default();
        let queue = runtime.create_queue(0).unwrap();
        let sim = queue.as_any().downcast_ref::<SimQueue>().unwrap();
        sim.submit("boom", || Err(BridgeError::execution("boom")))
            .unwrap();
        assert!(queue.finish().is_err());
        queue.finish().unwrap();
    }

    #[test]
    fn released_buffers_outlive_pending_commands() {
        let runtime = SimRuntime::new(SimConfig::default().with_capacity(8));
        let queue = runtime.create_queue(0).unwrap();
        let sim = queue.as_any().downcast_ref::<SimQueue>().unwrap();
        let raw = runtime.allocate(0, 8).unwrap();
        sim.pause();
        queue.enqueue_write(raw, 0, &[7; 8], &[]).unwrap();
        runtime.release(0, raw);
        assert_eq!(runtime.live_buffers(0), 0);
        assert_eq!(runtime.bytes_in_use(0), 8);
        assert!(matches!(
            runtime.allocate(0, 8),
            Err(BridgeError::ResourceExhausted { available: 0, .. })
        ));

        sim.resume();
        queue.finish().unwrap();
        assert_eq!(runtime.bytes_in_use(0), 0);
        runtime.allocate(0, 8).unwrap();
    }
}
