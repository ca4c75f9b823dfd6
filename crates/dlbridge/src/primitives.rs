//! Contract of the compute-primitives library the bridge delegates math to.
//!
//! The bridge only builds configurations and views; numerical correctness of every kernel
//! behind these traits belongs to the implementation.

use crate::bridge::TensorView;
use crate::context::ExecutionContext;
use crate::dtype::DType;
use crate::error::{BridgeError, BridgeResult};

/// Elementwise activations understood by [`PrimitiveLibrary::activation_forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
}

/// 2-D convolution settings derived from decoded tensor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub channels_in: usize,
    pub channels_out: usize,
    pub kernel: [usize; 2],
    pub pad: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

/// Spatial output extent of a convolution or pooling window along one axis.
///
/// `None` when the window does not fit or the padded extent overflows `usize`.
pub fn window_output_extent(
    input: usize,
    kernel: usize,
    pad: usize,
    stride: usize,
    dilation: usize,
) -> Option<usize> {
    if stride == 0 || kernel == 0 || dilation == 0 {
        return None;
    }
    let span = dilation.checked_mul(kernel - 1)?.checked_add(1)?;
    let padded = pad.checked_mul(2)?.checked_add(input)?;
    let room = padded.checked_sub(span)?;
    Some(room / stride + 1)
}

impl Conv2dConfig {
    /// `[N, Cout, Ho, Wo]` for an `[N, Cin, H, W]` input.
    pub fn output_shape(&self, input: &[usize]) -> BridgeResult<[usize; 4]> {
        let [n, _, h, w] = <[usize; 4]>::try_from(input).map_err(|_| {
            BridgeError::invalid_shape("conv2d", format!("expected rank-4 input, got {input:?}"))
        })?;
        let mut spatial = [0usize; 2];
        for (axis, extent) in [h, w].into_iter().enumerate() {
            spatial[axis] = window_output_extent(
                extent,
                self.kernel[axis],
                self.pad[axis],
                self.stride[axis],
                self.dilation[axis],
            )
            .filter(|&out| out > 0)
            .ok_or_else(|| {
                BridgeError::invalid_shape(
                    "conv2d",
                    format!("input {input:?} too small for configuration {self:?}"),
                )
            })?;
        }
        Ok([n, self.channels_out, spatial[0], spatial[1]])
    }
}

/// Max-pooling window settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingConfig {
    pub kernel: [usize; 2],
    pub pad: [usize; 2],
    pub stride: [usize; 2],
}

impl PoolingConfig {
    /// `[N, C, Ho, Wo]` for an `[N, C, H, W]` input (floor mode).
    pub fn output_shape(&self, input: &[usize]) -> BridgeResult<[usize; 4]> {
        let [n, c, h, w] = <[usize; 4]>::try_from(input).map_err(|_| {
            BridgeError::invalid_shape("pool2d", format!("expected rank-4 input, got {input:?}"))
        })?;
        let extent = |axis: usize, input_extent: usize| {
            window_output_extent(
                input_extent,
                self.kernel[axis],
                self.pad[axis],
                self.stride[axis],
                1,
            )
            .ok_or_else(|| {
                BridgeError::invalid_shape(
                    "pool2d",
                    format!("input {input:?} too small for configuration {self:?}"),
                )
            })
        };
        Ok([n, c, extent(0, h)?, extent(1, w)?])
    }
}

/// Fully connected layer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerProductConfig {
    pub inputs: usize,
    pub outputs: usize,
    pub optimal_batch_size: usize,
    pub dtype: DType,
}

/// A prepared forward convolution.
pub trait Conv2dForward: Send {
    /// Scratch bytes [`Conv2dForward::enqueue`] needs; zero when none.
    fn workspace(&self) -> usize;

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        input: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: Option<&TensorView<'_>>,
        output: &TensorView<'_>,
        workspace: Option<&TensorView<'_>>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()>;
}

/// A prepared 2-D pooling operation.
pub trait Pooling2dForward: Send {
    fn enqueue(
        &self,
        input: &TensorView<'_>,
        output: &TensorView<'_>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()>;
}

/// A prepared inner product (`y = x W^T + b`).
pub trait InnerProductForward: Send {
    fn enqueue(
        &self,
        input: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: Option<&TensorView<'_>>,
        output: &TensorView<'_>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()>;
}

/// Entry points of a compute-primitives library.
///
/// Every method enqueues work on the context's queue and returns without waiting for it.
pub trait PrimitiveLibrary: Send + Sync {
    fn name(&self) -> &str;

    fn fill(&self, tensor: &TensorView<'_>, value: f64, ctx: &mut ExecutionContext)
        -> BridgeResult<()>;

    /// `output` may alias `input` for in-place activations.
    fn activation_forward(
        &self,
        input: &TensorView<'_>,
        output: &TensorView<'_>,
        activation: Activation,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()>;

    fn create_conv2d(
        &self,
        config: &Conv2dConfig,
        input_shape: &[usize],
        dtype: DType,
        with_bias: bool,
    ) -> BridgeResult<Box<dyn Conv2dForward>>;

    fn create_max_pooling(
        &self,
        config: &PoolingConfig,
        dtype: DType,
    ) -> BridgeResult<Box<dyn Pooling2dForward>>;

    fn create_global_avg_pooling(
        &self,
        input_shape: &[usize],
        dtype: DType,
    ) -> BridgeResult<Box<dyn Pooling2dForward>>;

    fn create_inner_product(
        &self,
        config: &InnerProductConfig,
        with_bias: bool,
    ) -> BridgeResult<Box<dyn InnerProductForward>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(kernel: usize, pad: usize, stride: usize, dilation: usize) -> Conv2dConfig {
        Conv2dConfig {
            channels_in: 3,
            channels_out: 8,
            kernel: [kernel; 2],
            pad: [pad; 2],
            stride: [stride; 2],
            dilation: [dilation; 2],
            groups: 1,
        }
    }

    #[test]
    fn conv_output_follows_standard_formula() {
        assert_eq!(conv(3, 0, 1, 1).output_shape(&[2, 3, 8, 8]).unwrap(), [2, 8, 6, 6]);
        assert_eq!(conv(3, 1, 1, 1).output_shape(&[2, 3, 8, 8]).unwrap(), [2, 8, 8, 8]);
        assert_eq!(conv(3, 1, 2, 1).output_shape(&[1, 3, 7, 7]).unwrap(), [1, 8, 4, 4]);
        assert_eq!(conv(3, 0, 1, 2).output_shape(&[1, 3, 9, 9]).unwrap(), [1, 8, 5, 5]);
        assert!(conv(5, 0, 1, 1).output_shape(&[1, 3, 4, 4]).is_err());
        assert!(conv(3, 0, 0, 1).output_shape(&[1, 3, 4, 4]).is_err());
    }

    #[test]
    fn pooling_output_uses_floor_mode() {
        let cfg = PoolingConfig {
            kernel: [2, 2],
            pad: [0, 0],
            stride: [2, 2],
        };
        assert_eq!(cfg.output_shape(&[1, 1, 5, 4]).unwrap(), [1, 1, 2, 2]);
        assert!(cfg.output_shape(&[1, 1, 4]).is_err());
    }

    #[test]
    fn oversized_windows_are_invalid_not_overflowing() {
        assert_eq!(window_output_extent(8, 3, usize::MAX, 1, 1), None);
        assert_eq!(window_output_extent(8, 3, 0, 1, usize::MAX), None);
        assert_eq!(window_output_extent(8, 2, 0, usize::MAX, 1), Some(1));

        let err = conv(3, usize::MAX / 2, 1, 1)
            .output_shape(&[1, 3, 8, 8])
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { op: "conv2d", .. }), "{err}");
        let pool = PoolingConfig {
            kernel: [2, 2],
            pad: [usize::MAX, 0],
            stride: [1, 1],
        };
        assert!(matches!(
            pool.output_shape(&[1, 1, 4, 4]),
            Err(BridgeError::InvalidShape { .. })
        ));
    }
}
