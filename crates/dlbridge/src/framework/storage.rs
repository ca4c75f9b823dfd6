//! Type-erased storage references held by framework tensors.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::allocator::DeviceBuffer;
use crate::error::{poisoned, BridgeResult};

/// Host memory owned by the framework.
#[derive(Debug, Default)]
pub struct HostStorage {
    bytes: RwLock<Vec<u8>>,
}

impl HostStorage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    pub fn read(&self) -> BridgeResult<RwLockReadGuard<'_, Vec<u8>>> {
        self.bytes.read().map_err(|_| poisoned("host storage"))
    }

    pub fn write(&self) -> BridgeResult<RwLockWriteGuard<'_, Vec<u8>>> {
        self.bytes.write().map_err(|_| poisoned("host storage"))
    }

    pub fn len(&self) -> usize {
        self.bytes.read().map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, reference-counted storage handle.
///
/// The framework does not know what backs a storage; the bridge recovers the concrete type by
/// downcasting and rejects storages it did not allocate.
#[derive(Clone)]
pub struct Storage {
    data: Arc<dyn Any + Send + Sync>,
    nbytes: usize,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = if self.device_buffer().is_some() {
            "device"
        } else if self.host().is_some() {
            "host"
        } else {
            "foreign"
        };
        f.debug_struct("Storage")
            .field("origin", &origin)
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

impl Storage {
    /// Wraps an arbitrary storage object.
    pub fn new<T: Any + Send + Sync>(data: Arc<T>, nbytes: usize) -> Self {
        Self { data, nbytes }
    }

    pub fn from_host(bytes: Vec<u8>) -> Self {
        let nbytes = bytes.len();
        Self::new(Arc::new(HostStorage::new(bytes)), nbytes)
    }

    pub fn from_device(buffer: Arc<DeviceBuffer>) -> Self {
        let nbytes = buffer.bytes();
        Self::new(buffer, nbytes)
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn device_buffer(&self) -> Option<&DeviceBuffer> {
        self.downcast_ref::<DeviceBuffer>()
    }

    /// Returns a new owning reference to the device buffer behind this storage.
    pub fn device_buffer_arc(&self) -> Option<Arc<DeviceBuffer>> {
        Arc::clone(&self.data).downcast::<DeviceBuffer>().ok()
    }

    pub fn host(&self) -> Option<&HostStorage> {
        self.downcast_ref::<HostStorage>()
    }

    /// Returns `true` when both handles refer to the same storage object.
    pub fn is_same(&self, other: &Storage) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.data) as *const (),
            Arc::as_ptr(&other.data) as *const (),
        )
    }

    /// Number of handles sharing this storage.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}
