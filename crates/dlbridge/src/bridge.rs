//! Zero-copy translation between framework tensors and primitive-side views.
//!
//! A [`TensorView`] borrows the [`DeviceBuffer`] owned by a framework tensor's storage, so the
//! borrow checker keeps views from outliving the storage they describe. Views are always packed:
//! strided layouts are rejected instead of silently materialized.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::allocator::DeviceBuffer;
use crate::device::{Device, RawBuffer};
use crate::dtype::DType;
use crate::error::{BridgeError, BridgeResult};
use crate::framework::{element_count, packed_strides, Dims, Storage, Tensor};

/// Primitive-side tensor descriptor: buffer, byte offset, packed shape and element type.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    buffer: &'a DeviceBuffer,
    offset: usize,
    shape: SmallVec<[usize; 4]>,
    dtype: DType,
}

impl<'a> TensorView<'a> {
    /// Builds a view over `buffer`. Fails when the described range does not fit.
    pub fn new(
        buffer: &'a DeviceBuffer,
        offset: usize,
        shape: &[usize],
        dtype: DType,
    ) -> BridgeResult<Self> {
        let view = Self {
            buffer,
            offset,
            shape: SmallVec::from_slice(shape),
            dtype,
        };
        let end = checked_nbytes(shape, dtype).and_then(|bytes| offset.checked_add(bytes));
        if end.map_or(true, |end| end > buffer.bytes()) {
            return Err(BridgeError::invalid_shape(
                "tensor view",
                format!(
                    "{shape:?} {dtype:?} at byte {offset} exceeds buffer of {} bytes",
                    buffer.bytes()
                ),
            ));
        }
        Ok(view)
    }

    /// One-dimensional byte view covering the whole buffer, as used for workspaces.
    pub fn bytes_of(buffer: &'a DeviceBuffer) -> Self {
        Self {
            buffer,
            offset: 0,
            shape: SmallVec::from_slice(&[buffer.bytes()]),
            dtype: DType::U8,
        }
    }

    pub fn buffer(&self) -> &'a DeviceBuffer {
        self.buffer
    }

    pub fn raw(&self) -> RawBuffer {
        self.buffer.raw()
    }

    pub fn device(&self) -> Device {
        self.buffer.device()
    }

    /// Byte offset of the first element inside the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().copied().fold(1, usize::saturating_mul)
    }

    pub fn nbytes(&self) -> usize {
        self.numel().saturating_mul(self.dtype.size_in_bytes())
    }
}

/// Bytes spanned by a packed `shape`, or `None` on overflow.
fn checked_nbytes(shape: &[usize], dtype: DType) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape
        .iter()
        .try_fold(dtype.size_in_bytes(), |acc, &extent| acc.checked_mul(extent))
}

/// Row-major strides for `sizes`.
pub fn contiguous_strides(sizes: &[i64]) -> Dims {
    packed_strides(sizes)
}

pub fn is_contiguous(tensor: &Tensor) -> bool {
    tensor.is_contiguous()
}

fn shape_to_usize(op: &'static str, sizes: &[i64]) -> BridgeResult<SmallVec<[usize; 4]>> {
    sizes
        .iter()
        .map(|&size| {
            usize::try_from(size)
                .map_err(|_| BridgeError::invalid_shape(op, format!("negative size in {sizes:?}")))
        })
        .collect()
}

/// Decodes a framework tensor into a primitive-side view without copying.
///
/// The storage must come from the bridge's allocator and the layout must be packed.
pub fn to_primitive(tensor: &Tensor) -> BridgeResult<TensorView<'_>> {
    let buffer = tensor.storage().device_buffer().ok_or_else(|| {
        BridgeError::storage_origin(
            "to_primitive",
            format!("tensor on {} is not backed by a device buffer", tensor.device()),
        )
    })?;
    if !tensor.is_contiguous() {
        return Err(BridgeError::NonContiguous { op: "to_primitive" });
    }
    let byte_offset = usize::try_from(tensor.storage_offset())
        .ok()
        .and_then(|offset| offset.checked_mul(tensor.dtype().size_in_bytes()))
        .ok_or_else(|| {
            BridgeError::invalid_shape(
                "to_primitive",
                format!("storage offset {} out of range", tensor.storage_offset()),
            )
        })?;
    let shape = shape_to_usize("to_primitive", tensor.sizes())?;
    TensorView::new(buffer, byte_offset, &shape, tensor.dtype())
}

/// Wraps an allocator buffer into a new framework tensor with packed strides, taking shared
/// ownership of the buffer.
pub fn to_framework(
    buffer: Arc<DeviceBuffer>,
    sizes: &[i64],
    dtype: DType,
) -> BridgeResult<Tensor> {
    let required = element_count(sizes)
        .and_then(|numel| numel.checked_mul(dtype.size_in_bytes()))
        .ok_or_else(|| BridgeError::invalid_shape("to_framework", format!("{sizes:?}")))?;
    if required > buffer.bytes() {
        return Err(BridgeError::invalid_shape(
            "to_framework",
            format!(
                "{sizes:?} {dtype:?} needs {required} bytes, buffer holds {}",
                buffer.bytes()
            ),
        ));
    }
    let device = buffer.device();
    Ok(Tensor::from_storage(
        Storage::from_device(buffer),
        sizes,
        &packed_strides(sizes),
        0,
        dtype,
        device,
    ))
}

/// One past the furthest element (in elements) addressed by a strided view, or `None` when the
/// view is empty.
pub fn view_extent(sizes: &[i64], strides: &[i64], storage_offset: i64) -> Option<i64> {
    if sizes.iter().any(|&size| size == 0) {
        return None;
    }
    let furthest: i64 = sizes
        .iter()
        .zip(strides)
        .map(|(&size, &stride)| (size - 1).saturating_mul(stride))
        .fold(storage_offset, i64::saturating_add);
    Some(furthest.saturating_add(1))
}

/// Rewrites sizes and strides in place, keeping the storage.
///
/// No allocation and no copy. Rejects rank mismatches, negative entries, a changed element
/// count and views that would address memory past the end of the storage.
pub fn reinterpret_shape(tensor: &mut Tensor, sizes: &[i64], strides: &[i64]) -> BridgeResult<()> {
    const OP: &str = "reinterpret_shape";
    if sizes.len() != strides.len() {
        return Err(BridgeError::invalid_shape(
            OP,
            format!("{} sizes but {} strides", sizes.len(), strides.len()),
        ));
    }
    if sizes.iter().chain(strides).any(|&value| value < 0) {
        return Err(BridgeError::invalid_shape(
            OP,
            format!("negative entry in sizes {sizes:?} / strides {strides:?}"),
        ));
    }
    let numel = element_count(sizes)
        .ok_or_else(|| BridgeError::invalid_shape(OP, format!("{sizes:?} overflows")))?;
    if numel != tensor.numel() {
        return Err(BridgeError::invalid_shape(
            OP,
            format!(
                "element count changes from {} to {numel} ({:?} -> {sizes:?})",
                tensor.numel(),
                tensor.sizes()
            ),
        ));
    }
    if let Some(extent) = view_extent(sizes, strides, tensor.storage_offset()) {
        let needed = extent.saturating_mul(tensor.dtype().size_in_bytes() as i64);
        if needed > tensor.storage().nbytes() as i64 {
            return Err(BridgeError::invalid_shape(
                OP,
                format!(
                    "view needs {needed} bytes, storage holds {}",
                    tensor.storage().nbytes()
                ),
            ));
        }
    }
    tensor.set_sizes_and_strides(sizes, strides);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_storage_is_rejected() {
        let tensor = Tensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        let err = to_primitive(&tensor).unwrap_err();
        assert!(matches!(err, BridgeError::StorageOrigin { .. }));
    }

    #[test]
    fn reinterpret_checks_element_count_and_bounds() {
        let mut tensor = Tensor::from_f32(&[0.0; 6], &[2, 3]).unwrap();
        reinterpret_shape(&mut tensor, &[3, 2], &[2, 1]).unwrap();
        assert_eq!(tensor.sizes(), &[3, 2]);

        let err = reinterpret_shape(&mut tensor, &[4, 2], &[2, 1]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { .. }));
        let err = reinterpret_shape(&mut tensor, &[3, 2], &[4, 1]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { .. }));
        let err = reinterpret_shape(&mut tensor, &[6], &[1, 1]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { .. }));
        assert_eq!(tensor.sizes(), &[3, 2]);
    }

    #[test]
    fn reinterpret_allows_broadcast_strides() {
        let mut tensor = Tensor::from_f32(&[0.0; 4], &[4]).unwrap();
        reinterpret_shape(&mut tensor, &[2, 2], &[0, 1]).unwrap();
        assert!(!tensor.is_contiguous());
        reinterpret_shape(&mut tensor, &[4, 1], &[1, 0]).unwrap();
        assert!(tensor.is_contiguous());
    }

    #[test]
    fn packed_byte_count_detects_overflow() {
        assert_eq!(checked_nbytes(&[2, 3], DType::F32), Some(24));
        assert_eq!(checked_nbytes(&[], DType::F64), Some(8));
        assert_eq!(checked_nbytes(&[usize::MAX / 2, 3], DType::F32), None);
        assert_eq!(checked_nbytes(&[usize::MAX, 0], DType::F32), Some(0));
    }

    #[test]
    fn extent_of_empty_view_is_none() {
        assert_eq!(view_extent(&[2, 0], &[1, 1], 0), None);
        assert_eq!(view_extent(&[2, 3], &[3, 1], 1), Some(7));
        assert_eq!(contiguous_strides(&[2, 3]).as_slice(), &[3, 1]);
    }
}
