//! Framework-side tensor descriptors: sizes, strides, offset and element type over a shared
//! [`Storage`].

use smallvec::SmallVec;

use super::storage::Storage;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{BridgeError, BridgeResult};

/// Inline storage for sizes and strides; most tensors have rank four or less.
pub type Dims = SmallVec<[i64; 4]>;

/// Framework-side tensor descriptor.
///
/// Cloning a tensor clones the descriptor and shares the storage, so two descriptors may view
/// the same buffer with different shapes.
#[derive(Debug, Clone)]
pub struct Tensor {
    sizes: Dims,
    strides: Dims,
    storage_offset: i64,
    dtype: DType,
    device: Device,
    storage: Storage,
}

/// Row-major strides for `sizes`.
pub fn packed_strides(sizes: &[i64]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(1, sizes.len());
    let mut acc = 1i64;
    for (stride, &size) in strides.iter_mut().zip(sizes).rev() {
        *stride = acc;
        acc = acc.saturating_mul(size.max(1));
    }
    strides
}

/// Product of `sizes`; `None` when a size is negative or the product overflows.
pub fn element_count(sizes: &[i64]) -> Option<usize> {
    let mut count = 1usize;
    for &size in sizes {
        let size = usize::try_from(size).ok()?;
        count = count.checked_mul(size)?;
    }
    Some(count)
}

fn packed_bytes(sizes: &[i64], dtype: DType) -> BridgeResult<usize> {
    element_count(sizes)
        .and_then(|numel| numel.checked_mul(dtype.size_in_bytes()))
        .ok_or_else(|| BridgeError::invalid_shape("host tensor", format!("{sizes:?}")))
}

impl Tensor {
    pub fn from_storage(
        storage: Storage,
        sizes: &[i64],
        strides: &[i64],
        storage_offset: i64,
        dtype: DType,
        device: Device,
    ) -> Self {
        Self {
            sizes: Dims::from_slice(sizes),
            strides: Dims::from_slice(strides),
            storage_offset,
            dtype,
            device,
            storage,
        }
    }

    /// Creates a packed host tensor from raw native-endian bytes.
    pub fn from_host_bytes(bytes: Vec<u8>, sizes: &[i64], dtype: DType) -> BridgeResult<Self> {
        let expected = packed_bytes(sizes, dtype)?;
        if bytes.len() != expected {
            return Err(BridgeError::invalid_shape(
                "host tensor",
                format!(
                    "{} bytes supplied, {expected} required for {sizes:?} {dtype:?}",
                    bytes.len()
                ),
            ));
        }
        Ok(Self::from_storage(
            Storage::from_host(bytes),
            sizes,
            &packed_strides(sizes),
            0,
            dtype,
            Device::CPU,
        ))
    }

    pub fn from_f32(values: &[f32], sizes: &[i64]) -> BridgeResult<Self> {
        let bytes = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_host_bytes(bytes, sizes, DType::F32)
    }

    /// Packed host tensor of the given shape filled with zero bytes.
    pub fn zeros_host(sizes: &[i64], dtype: DType) -> BridgeResult<Self> {
        let bytes = packed_bytes(sizes, dtype)?;
        Self::from_host_bytes(vec![0u8; bytes], sizes, dtype)
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn dim(&self) -> usize {
        self.sizes.len()
    }

    pub fn storage_offset(&self) -> i64 {
        self.storage_offset
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn numel(&self) -> usize {
        element_count(&self.sizes).unwrap_or(0)
    }

    /// Bytes covered by the logical elements (not the whole storage).
    pub fn nbytes(&self) -> usize {
        self.numel().saturating_mul(self.dtype.size_in_bytes())
    }

    /// Returns `true` when strides match the packed row-major layout. Size-one dimensions may
    /// carry any stride, and empty tensors are always contiguous.
    pub fn is_contiguous(&self) -> bool {
        if self.sizes.contains(&0) {
            return true;
        }
        let mut expected = 1i64;
        for (&size, &stride) in self.sizes.iter().zip(&self.strides).rev() {
            if size == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected = expected.saturating_mul(size);
        }
        true
    }

    /// Raw descriptor mutation used by view operations. Performs no validation.
    pub fn set_sizes_and_strides(&mut self, sizes: &[i64], strides: &[i64]) {
        self.sizes = Dims::from_slice(sizes);
        self.strides = Dims::from_slice(strides);
    }

    pub fn set_storage_offset(&mut self, storage_offset: i64) {
        self.storage_offset = storage_offset;
    }

    /// Copies the logical bytes of a contiguous host tensor.
    pub fn host_bytes(&self) -> BridgeResult<Vec<u8>> {
        let host = self.storage.host().ok_or_else(|| {
            BridgeError::storage_origin("host_bytes", "tensor is not backed by host memory")
        })?;
        if !self.is_contiguous() {
            return Err(BridgeError::NonContiguous { op: "host_bytes" });
        }
        let start = usize::try_from(self.storage_offset)
            .ok()
            .and_then(|offset| offset.checked_mul(self.dtype.size_in_bytes()))
            .ok_or_else(|| {
                BridgeError::invalid_shape(
                    "host_bytes",
                    format!("storage offset {} out of range", self.storage_offset),
                )
            })?;
        let end = start.checked_add(self.nbytes()).unwrap_or(usize::MAX);
        let bytes = host.read()?;
        bytes.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            BridgeError::invalid_shape(
                "host_bytes",
                format!("view [{start}, {end}) exceeds storage of {} bytes", bytes.len()),
            )
        })
    }

    /// Reads a contiguous host `F32` tensor.
    pub fn to_f32_vec(&self) -> BridgeResult<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(BridgeError::invalid_argument(
                "to_f32_vec",
                format!("expected F32, found {:?}", self.dtype),
            ));
        }
        Ok(self
            .host_bytes()?
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_strides_are_row_major() {
        assert_eq!(packed_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
        assert_eq!(packed_strides(&[5]).as_slice(), &[1]);
        assert!(packed_strides(&[]).is_empty());
        assert_eq!(packed_strides(&[2, 0, 3]).as_slice(), &[3, 3, 1]);
    }

    #[test]
    fn element_count_rejects_negative_sizes() {
        assert_eq!(element_count(&[2, 3]), Some(6));
        assert_eq!(element_count(&[]), Some(1));
        assert_eq!(element_count(&[2, -1]), None);
    }

    #[test]
    fn contiguity_ignores_unit_dims() {
        let mut t = Tensor::from_f32(&[0.0; 6], &[2, 3]).unwrap();
        assert!(t.is_contiguous());
        t.set_sizes_and_strides(&[3, 2], &[1, 3]);
        assert!(!t.is_contiguous());
        t.set_sizes_and_strides(&[1, 6], &[99, 1]);
        assert!(t.is_contiguous());
    }

    #[test]
    fn host_round_trip_respects_offset() {
        let mut t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]).unwrap();
        t.set_sizes_and_strides(&[2], &[1]);
        t.set_storage_offset(2);
        assert_eq!(t.to_f32_vec().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn from_host_bytes_checks_length() {
        assert!(Tensor::from_host_bytes(vec![0; 3], &[1], DType::F32).is_err());
    }

    #[test]
    fn oversized_shapes_and_offsets_are_invalid() {
        let err = Tensor::zeros_host(&[i64::MAX, 4], DType::F32).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");

        let mut t = Tensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        t.set_storage_offset(i64::MAX);
        let err = t.host_bytes().unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
        t.set_storage_offset(-1);
        assert!(t.host_bytes().is_err());
    }
}
