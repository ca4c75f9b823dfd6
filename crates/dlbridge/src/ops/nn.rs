//! Convolution, activation, pooling and inner-product operations.

use tracing::debug;

use super::{pair, Bridge};
use crate::bridge::{to_primitive, TensorView};
use crate::error::{BridgeError, BridgeResult};
use crate::framework::Tensor;
use crate::primitives::{Activation, Conv2dConfig, InnerProductConfig, PoolingConfig};

fn expect_rank(
    op: &'static str,
    name: &str,
    view: &TensorView<'_>,
    rank: usize,
) -> BridgeResult<()> {
    if view.shape().len() != rank {
        return Err(BridgeError::invalid_shape(
            op,
            format!("{name} must be rank {rank}, got {:?}", view.shape()),
        ));
    }
    Ok(())
}

fn expect_dtype(
    op: &'static str,
    name: &str,
    view: &TensorView<'_>,
    input: &TensorView<'_>,
) -> BridgeResult<()> {
    if view.dtype() != input.dtype() {
        return Err(BridgeError::invalid_argument(
            op,
            format!("{name} dtype {:?} differs from input {:?}", view.dtype(), input.dtype()),
        ));
    }
    Ok(())
}

fn to_i64(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&extent| extent as i64).collect()
}

/// Bias is only used when present and non-empty.
fn non_empty(bias: Option<&Tensor>) -> Option<&Tensor> {
    bias.filter(|tensor| tensor.numel() > 0)
}

impl Bridge {
    /// `convolution_overrideable`: forward 2-D convolution into a newly allocated output.
    #[allow(clippy::too_many_arguments)]
    pub fn convolution_overrideable(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: &[i64],
        padding: &[i64],
        dilation: &[i64],
        transposed: bool,
        _output_padding: &[i64],
        groups: i64,
    ) -> BridgeResult<Tensor> {
        const OP: &str = "convolution_overrideable";
        debug!(
            op = OP,
            device = %input.device(),
            input = ?input.sizes(),
            weight = ?weight.sizes(),
            "bridged op"
        );
        let stride = pair(OP, "stride", stride)?;
        let pad = pair(OP, "padding", padding)?;
        let dilation = pair(OP, "dilation", dilation)?;
        if transposed {
            return Err(BridgeError::unsupported(OP, "transposed convolution"));
        }

        let x = to_primitive(input)?;
        let w = to_primitive(weight)?;
        expect_rank(OP, "input", &x, 4)?;
        expect_rank(OP, "weight", &w, 4)?;
        let bias = non_empty(bias).map(to_primitive).transpose()?;

        let groups = usize::try_from(groups)
            .ok()
            .filter(|&groups| groups >= 1)
            .ok_or_else(|| BridgeError::invalid_argument(OP, format!("groups = {groups}")))?;
        let channels_in = x.shape()[1];
        let channels_out = w.shape()[0];
        if channels_in % groups != 0 || channels_out % groups != 0 {
            return Err(BridgeError::invalid_shape(
                OP,
                format!(
                    "channels {channels_in} -> {channels_out} not divisible by {groups} groups"
                ),
            ));
        }
        if w.shape()[1] != channels_in / groups {
            return Err(BridgeError::invalid_shape(
                OP,
                format!(
                    "weight {:?} expects {} input channels per group, input has {channels_in}",
                    w.shape(),
                    w.shape()[1]
                ),
            ));
        }
        if let Some(bias) = &bias {
            if bias.shape() != [channels_out] {
                return Err(BridgeError::invalid_shape(
                    OP,
                    format!("bias must be [{channels_out}], got {:?}", bias.shape()),
                ));
            }
            expect_dtype(OP, "bias", bias, &x)?;
        }
        expect_dtype(OP, "weight", &w, &x)?;

        let config = Conv2dConfig {
            channels_in,
            channels_out,
            kernel: [w.shape()[2], w.shape()[3]],
            pad,
            stride,
            dilation,
            groups,
        };
        let output_shape = config.output_shape(x.shape())?;
        let conv = self
            .primitives
            .create_conv2d(&config, x.shape(), x.dtype(), bias.is_some())?;
        let mut ctx = self.resolver.context_for(input)?;

        let result = self.new_tensor(&to_i64(&output_shape), input.device(), input.dtype())?;
        let workspace = match conv.workspace() {
            0 => None,
            bytes => Some(self.allocator.allocate(input.device(), bytes)?),
        };
        let y = to_primitive(&result)?;
        let ws = workspace.as_deref().map(TensorView::bytes_of);
        conv.enqueue(&x, &w, bias.as_ref(), &y, ws.as_ref(), &mut ctx)?;
        self.resolver.sync_if_configured(input.device())?;
        Ok(result)
    }

    /// `relu_`: in-place rectified linear activation.
    pub fn relu_(&self, tensor: &Tensor) -> BridgeResult<Tensor> {
        debug!(op = "relu_", device = %tensor.device(), "bridged op");
        let x = to_primitive(tensor)?;
        let mut ctx = self.resolver.context_for(tensor)?;
        self.primitives
            .activation_forward(&x, &x, Activation::Relu, &mut ctx)?;
        self.resolver.sync_if_configured(tensor.device())?;
        Ok(tensor.clone())
    }

    /// `max_pool2d_with_indices.out`: max pooling into the caller-provided `out`.
    ///
    /// Index tracking is not implemented: passing an index tensor is rejected up front.
    #[allow(clippy::too_many_arguments)]
    pub fn max_pool2d_with_indices_out(
        &self,
        input: &Tensor,
        kernel_size: &[i64],
        stride: &[i64],
        padding: &[i64],
        dilation: &[i64],
        ceil_mode: bool,
        out: &Tensor,
        indices: Option<&Tensor>,
    ) -> BridgeResult<Tensor> {
        const OP: &str = "max_pool2d_with_indices.out";
        debug!(op = OP, device = %input.device(), input = ?input.sizes(), "bridged op");
        let kernel = pair(OP, "kernel_size", kernel_size)?;
        let stride = pair(OP, "stride", stride)?;
        let pad = pair(OP, "padding", padding)?;
        let dilation = pair(OP, "dilation", dilation)?;
        if dilation != [1, 1] {
            return Err(BridgeError::unsupported(OP, format!("dilation {dilation:?}")));
        }
        if ceil_mode {
            return Err(BridgeError::unsupported(OP, "ceil_mode = true"));
        }
        if indices.is_some() {
            return Err(BridgeError::unsupported(OP, "index output"));
        }

        let x = to_primitive(input)?;
        let y = to_primitive(out)?;
        expect_rank(OP, "input", &x, 4)?;
        let config = PoolingConfig { kernel, pad, stride };
        let expected = config.output_shape(x.shape())?;
        if y.shape() != expected {
            return Err(BridgeError::invalid_shape(
                OP,
                format!("output must be {expected:?}, got {:?}", y.shape()),
            ));
        }
        expect_dtype(OP, "output", &y, &x)?;
        let pool = self.primitives.create_max_pooling(&config, x.dtype())?;
        let mut ctx = self.resolver.context_for(input)?;
        pool.enqueue(&x, &y, &mut ctx)?;
        self.resolver.sync_if_configured(input.device())?;
        Ok(out.clone())
    }

    /// `_adaptive_avg_pool2d`: global average for `(1, 1)`, identity when the output size
    /// equals the input's spatial size. Any other size is rejected.
    pub fn adaptive_avg_pool2d(
        &self,
        input: &Tensor,
        output_size: &[i64],
    ) -> BridgeResult<Tensor> {
        const OP: &str = "_adaptive_avg_pool2d";
        debug!(op = OP, device = %input.device(), ?output_size, "bridged op");
        let [oh, ow] = pair(OP, "output_size", output_size)?;
        let x = to_primitive(input)?;
        expect_rank(OP, "input", &x, 4)?;
        let (h, w) = (x.shape()[2], x.shape()[3]);
        if [oh, ow] == [1, 1] {
            let pool = self.primitives.create_global_avg_pooling(x.shape(), x.dtype())?;
            let mut ctx = self.resolver.context_for(input)?;
            let sizes = [x.shape()[0] as i64, x.shape()[1] as i64, 1, 1];
            let result = self.new_tensor(&sizes, input.device(), input.dtype())?;
            let y = to_primitive(&result)?;
            pool.enqueue(&x, &y, &mut ctx)?;
            self.resolver.sync_if_configured(input.device())?;
            return Ok(result);
        }
        if [oh, ow] == [h, w] {
            return Ok(input.clone());
        }
        Err(BridgeError::unsupported(
            OP,
            format!("output size [{oh}, {ow}] for input extent [{h}, {w}]"),
        ))
    }

    /// `linear`: `[batch, out_features]` inner product with optional bias. Trailing input
    /// dimensions are flattened into the feature axis.
    pub fn linear(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> BridgeResult<Tensor> {
        const OP: &str = "linear";
        debug!(
            op = OP,
            device = %input.device(),
            input = ?input.sizes(),
            weight = ?weight.sizes(),
            "bridged op"
        );
        let x = to_primitive(input)?;
        let w = to_primitive(weight)?;
        if x.shape().len() < 2 {
            return Err(BridgeError::invalid_shape(
                OP,
                format!("input must have a batch axis, got {:?}", x.shape()),
            ));
        }
        expect_rank(OP, "weight", &w, 2)?;
        expect_dtype(OP, "weight", &w, &x)?;
        let batch = x.shape()[0];
        let inputs: usize = x.shape()[1..].iter().product();
        let outputs = w.shape()[0];
        if w.shape()[1] != inputs {
            return Err(BridgeError::invalid_shape(
                OP,
                format!("weight {:?} does not match {inputs} input features", w.shape()),
            ));
        }
        let bias = non_empty(bias).map(to_primitive).transpose()?;
        if let Some(bias) = &bias {
            if bias.shape() != [outputs] {
                return Err(BridgeError::invalid_shape(
                    OP,
                    format!("bias must be [{outputs}], got {:?}", bias.shape()),
                ));
            }
            expect_dtype(OP, "bias", bias, &x)?;
        }

        let config = InnerProductConfig {
            inputs,
            outputs,
            optimal_batch_size: batch,
            dtype: x.dtype(),
        };
        let ip = self.primitives.create_inner_product(&config, bias.is_some())?;
        let mut ctx = self.resolver.context_for(input)?;
        let sizes = [batch as i64, outputs as i64];
        let result = self.new_tensor(&sizes, input.device(), input.dtype())?;
        let y = to_primitive(&result)?;
        ip.enqueue(&x, &w, bias.as_ref(), &y, &mut ctx)?;
        self.resolver.sync_if_configured(input.device())?;
        Ok(result)
    }
}
