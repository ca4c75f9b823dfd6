//! Allocation, view, fill and copy operations.

use tracing::debug;

use super::Bridge;
use crate::bridge::{reinterpret_shape, to_primitive};
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{BridgeError, BridgeResult};
use crate::framework::{element_count, Scalar, Tensor};

fn check_same_layout(op: &'static str, src: &Tensor, dst: &Tensor) -> BridgeResult<()> {
    if src.dtype() != dst.dtype() {
        return Err(BridgeError::invalid_argument(
            op,
            format!("dtype mismatch: {:?} -> {:?}", src.dtype(), dst.dtype()),
        ));
    }
    if src.nbytes() != dst.nbytes() {
        return Err(BridgeError::invalid_shape(
            op,
            format!("size mismatch: {:?} -> {:?}", src.sizes(), dst.sizes()),
        ));
    }
    Ok(())
}

impl Bridge {
    /// `empty.memory_format`: new uninitialized storage. Defaults to `F32` on the configured
    /// default accelerator.
    pub fn allocate_empty(
        &self,
        sizes: &[i64],
        dtype: Option<DType>,
        device: Option<Device>,
    ) -> BridgeResult<Tensor> {
        let dtype = dtype.unwrap_or_default();
        let device = device.unwrap_or_else(|| self.default_device());
        debug!(op = "empty", %device, ?sizes, ?dtype, "bridged op");
        self.new_tensor(sizes, device, dtype)
    }

    /// `empty_strided`: allocates like [`Bridge::allocate_empty`]. The result is always packed;
    /// the requested strides are not honoured.
    pub fn empty_strided(
        &self,
        sizes: &[i64],
        _strides: &[i64],
        dtype: Option<DType>,
        device: Option<Device>,
    ) -> BridgeResult<Tensor> {
        self.allocate_empty(sizes, dtype, device)
    }

    /// `_reshape_alias`: a new descriptor over the same storage. Never allocates.
    pub fn reshape_alias(
        &self,
        tensor: &Tensor,
        sizes: &[i64],
        strides: &[i64],
    ) -> BridgeResult<Tensor> {
        let mut alias = tensor.clone();
        reinterpret_shape(&mut alias, sizes, strides)?;
        Ok(alias)
    }

    /// `fill_.Scalar`: writes `value` into every element on the device.
    pub fn fill_(&self, tensor: &Tensor, value: Scalar) -> BridgeResult<Tensor> {
        debug!(op = "fill_", device = %tensor.device(), value = value.to_f64(), "bridged op");
        let view = to_primitive(tensor)?;
        let mut ctx = self.resolver.context_for(tensor)?;
        self.primitives.fill(&view, value.to_f64(), &mut ctx)?;
        self.resolver.sync_if_configured(tensor.device())?;
        Ok(tensor.clone())
    }

    /// `zero_`: same as filling with `0.0`, including the synchronization policy.
    pub fn zero_(&self, tensor: &Tensor) -> BridgeResult<Tensor> {
        self.fill_(tensor, Scalar::Float(0.0))
    }

    /// `_copy_from`: moves bytes from `src` into `dst` and returns `dst`.
    ///
    /// Supported directions are host to accelerator, accelerator to host and accelerator to
    /// accelerator on the same device. Reads back to the host always block.
    pub fn copy_from(
        &self,
        src: &Tensor,
        dst: &Tensor,
        _non_blocking: bool,
    ) -> BridgeResult<Tensor> {
        const OP: &str = "_copy_from";
        debug!(
            op = OP,
            src = %src.device(),
            dst = %dst.device(),
            bytes = src.nbytes(),
            "bridged op"
        );
        check_same_layout(OP, src, dst)?;
        match (src.device(), dst.device()) {
            (from, to) if from.is_accelerator() && to.is_cpu() => self.device_to_host(src, dst)?,
            (from, to) if from.is_cpu() && to.is_accelerator() => self.host_to_device(src, dst)?,
            (from, to) if from.is_accelerator() && from == to => self.device_to_device(src, dst)?,
            (from, to) => {
                return Err(BridgeError::unsupported(
                    OP,
                    format!("copy from {from} to {to}"),
                ))
            }
        }
        Ok(dst.clone())
    }

    fn device_to_host(&self, src: &Tensor, dst: &Tensor) -> BridgeResult<()> {
        const OP: &str = "_copy_from";
        let view = to_primitive(src)?;
        let host = dst
            .storage()
            .host()
            .ok_or_else(|| BridgeError::storage_origin(OP, "destination is not host memory"))?;
        if !dst.is_contiguous() {
            return Err(BridgeError::NonContiguous { op: OP });
        }
        let start = usize::try_from(dst.storage_offset())
            .ok()
            .and_then(|offset| offset.checked_mul(dst.dtype().size_in_bytes()))
            .ok_or_else(|| BridgeError::invalid_shape(OP, "destination offset out of range"))?;
        let end = start.checked_add(view.nbytes()).unwrap_or(usize::MAX);
        let ctx = self.resolver.context_for(src)?;
        let mut bytes = host.write()?;
        let capacity = bytes.len();
        let out = bytes.get_mut(start..end).ok_or_else(|| {
            BridgeError::invalid_shape(
                OP,
                format!("destination storage of {capacity} bytes is too small"),
            )
        })?;
        ctx.queue().read(view.raw(), view.offset(), out, ctx.events())
    }

    fn host_to_device(&self, src: &Tensor, dst: &Tensor) -> BridgeResult<()> {
        let bytes = src.host_bytes()?;
        let view = to_primitive(dst)?;
        let mut ctx = self.resolver.context_for(dst)?;
        let event = ctx
            .queue()
            .enqueue_write(view.raw(), view.offset(), &bytes, ctx.events())?;
        ctx.record(event);
        self.resolver.sync_if_configured(dst.device())
    }

    fn device_to_device(&self, src: &Tensor, dst: &Tensor) -> BridgeResult<()> {
        let from = to_primitive(src)?;
        let to = to_primitive(dst)?;
        let mut ctx = self.resolver.context_for(dst)?;
        let event = ctx.queue().enqueue_copy(
            from.raw(),
            from.offset(),
            to.raw(),
            to.offset(),
            from.nbytes(),
            ctx.events(),
        )?;
        ctx.record(event);
        self.resolver.sync_if_configured(dst.device())
    }

    /// `as_strided`: packed copy of `numel(sizes)` elements of `tensor`'s storage starting at
    /// `storage_offset` (the source's own offset when `None`) into a new tensor.
    ///
    /// The requested strides are not honoured; the result is always packed.
    pub fn as_strided(
        &self,
        tensor: &Tensor,
        sizes: &[i64],
        _strides: &[i64],
        storage_offset: Option<i64>,
    ) -> BridgeResult<Tensor> {
        const OP: &str = "as_strided";
        debug!(op = OP, device = %tensor.device(), ?sizes, ?storage_offset, "bridged op");
        let source = tensor.storage().device_buffer().ok_or_else(|| {
            BridgeError::storage_origin(OP, "source is not backed by a device buffer")
        })?;
        let element = tensor.dtype().size_in_bytes();
        let offset = storage_offset.unwrap_or_else(|| tensor.storage_offset());
        let start = usize::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_mul(element))
            .ok_or_else(|| {
                BridgeError::invalid_shape(OP, format!("offset {offset} out of range"))
            })?;
        let bytes = element_count(sizes)
            .and_then(|numel| numel.checked_mul(element))
            .ok_or_else(|| BridgeError::invalid_shape(OP, format!("invalid sizes {sizes:?}")))?;
        if start.checked_add(bytes).map_or(true, |end| end > source.bytes()) {
            return Err(BridgeError::invalid_shape(
                OP,
                format!(
                    "{bytes} bytes at byte {start} exceed source storage of {} bytes",
                    source.bytes()
                ),
            ));
        }
        let result = self.new_tensor(sizes, tensor.device(), tensor.dtype())?;
        if bytes > 0 {
            let target = to_primitive(&result)?;
            let mut ctx = self.resolver.context_for(tensor)?;
            let event = ctx.queue().enqueue_copy(
                source.raw(),
                start,
                target.raw(),
                target.offset(),
                bytes,
                ctx.events(),
            )?;
            ctx.record(event);
            self.resolver.sync_if_configured(tensor.device())?;
        }
        Ok(result)
    }
}
