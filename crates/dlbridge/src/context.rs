//! Execution-context resolution and the synchronization policy.

use std::sync::Arc;

use tracing::trace;

use crate::config::ExecutionMode;
use crate::device::{CommandQueue, Device, DeviceRegistry, Event};
use crate::error::BridgeResult;
use crate::framework::Tensor;
use crate::profiling;

/// A command queue plus the events of work enqueued through it during one bridged call.
///
/// Contexts are created per dispatch and never outlive it.
pub struct ExecutionContext {
    queue: Arc<dyn CommandQueue>,
    events: Vec<Event>,
}

impl ExecutionContext {
    pub fn new(queue: Arc<dyn CommandQueue>) -> Self {
        Self {
            queue,
            events: Vec::new(),
        }
    }

    pub fn queue(&self) -> &dyn CommandQueue {
        self.queue.as_ref()
    }

    pub fn device(&self) -> Device {
        self.queue.device()
    }

    /// Events that later commands in this context should wait on.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn record(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn last_event(&self) -> Option<Event> {
        self.events.last().copied()
    }
}

/// Maps tensors to the queue that services them and applies the configured execution mode.
pub struct ContextResolver {
    registry: Arc<DeviceRegistry>,
    mode: ExecutionMode,
}

impl ContextResolver {
    pub fn new(registry: Arc<DeviceRegistry>, mode: ExecutionMode) -> Self {
        Self { registry, mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Context bound to the queue of `tensor`'s device, with an empty event list.
    pub fn context_for(&self, tensor: &Tensor) -> BridgeResult<ExecutionContext> {
        self.context_for_device(tensor.device())
    }

    pub fn context_for_device(&self, device: Device) -> BridgeResult<ExecutionContext> {
        Ok(ExecutionContext::new(self.registry.queue(device)?))
    }

    /// Blocks on `device`'s queue when running synchronously; otherwise returns at once.
    pub fn sync_if_configured(&self, device: Device) -> BridgeResult<()> {
        if !self.mode.is_synchronous() {
            return Ok(());
        }
        trace!(%device, "synchronizing after bridged op");
        profiling::record_sync();
        self.registry.synchronize(device)
    }
}
