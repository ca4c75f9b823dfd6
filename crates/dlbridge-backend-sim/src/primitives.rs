//! Reference primitives library for the simulated queue.
//!
//! Each entry point captures the buffers it touches and enqueues a single command; nothing runs
//! on the caller's thread.

use dlbridge::context::ExecutionContext;
use dlbridge::primitives::{
    Activation, Conv2dConfig, Conv2dForward, InnerProductConfig, InnerProductForward,
    Pooling2dForward, PoolingConfig, PrimitiveLibrary,
};
use dlbridge::{BridgeError, BridgeResult, DType, TensorView};

use crate::kernels::{self, Region};
use crate::runtime::SimQueue;

fn sim_queue(ctx: &ExecutionContext) -> BridgeResult<&SimQueue> {
    ctx.queue()
        .as_any()
        .downcast_ref::<SimQueue>()
        .ok_or_else(|| BridgeError::execution("sim primitives need a simulated command queue"))
}

fn submit<F>(ctx: &mut ExecutionContext, label: &'static str, command: F) -> BridgeResult<()>
where
    F: FnOnce() -> BridgeResult<()> + Send + 'static,
{
    let event = sim_queue(ctx)?.submit(label, command)?;
    ctx.record(event);
    Ok(())
}

fn shape4(op: &'static str, shape: &[usize]) -> BridgeResult<[usize; 4]> {
    <[usize; 4]>::try_from(shape)
        .map_err(|_| BridgeError::invalid_shape(op, format!("expected rank 4, got {shape:?}")))
}

/// Primitives implemented by host loops on the simulated queue's worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimPrimitives;

impl SimPrimitives {
    pub fn new() -> Self {
        Self
    }
}

struct SimConv2d {
    config: Conv2dConfig,
    input: [usize; 4],
    workspace: usize,
}

impl Conv2dForward for SimConv2d {
    fn workspace(&self) -> usize {
        self.workspace
    }

    fn enqueue(
        &self,
        input: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: Option<&TensorView<'_>>,
        output: &TensorView<'_>,
        workspace: Option<&TensorView<'_>>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        let queue = sim_queue(ctx)?;
        let workspace = workspace.ok_or_else(|| {
            BridgeError::execution(format!("conv2d needs {} workspace bytes", self.workspace))
        })?;
        let x = Region::of(queue, input)?;
        let w = Region::of(queue, weight)?;
        let b = bias.map(|bias| Region::of(queue, bias)).transpose()?;
        let y = Region::of(queue, output)?;
        let scratch = Region::of(queue, workspace)?.reinterpret(DType::F32);
        let config = self.config;
        let shape = self.input;
        submit(ctx, "conv2d", move || {
            let bias = b.as_ref().map(Region::load).transpose()?;
            let out = kernels::conv2d(
                &config,
                shape,
                &x.load()?,
                &w.load()?,
                bias.as_deref(),
                &scratch,
            )?;
            y.store(&out)
        })
    }
}

struct SimMaxPool {
    config: PoolingConfig,
}

impl Pooling2dForward for SimMaxPool {
    fn enqueue(
        &self,
        input: &TensorView<'_>,
        output: &TensorView<'_>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        let queue = sim_queue(ctx)?;
        let shape = shape4("max_pool2d", input.shape())?;
        let x = Region::of(queue, input)?;
        let y = Region::of(queue, output)?;
        let config = self.config;
        submit(ctx, "max_pool2d", move || {
            y.store(&kernels::max_pool2d(&config, shape, &x.load()?)?)
        })
    }
}

struct SimGlobalAvgPool {
    input: [usize; 4],
}

impl Pooling2dForward for SimGlobalAvgPool {
    fn enqueue(
        &self,
        input: &TensorView<'_>,
        output: &TensorView<'_>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        let queue = sim_queue(ctx)?;
        let x = Region::of(queue, input)?;
        let y = Region::of(queue, output)?;
        let shape = self.input;
        submit(ctx, "global_avg_pool2d", move || {
            y.store(&kernels::global_avg_pool2d(shape, &x.load()?))
        })
    }
}

struct SimInnerProduct {
    config: InnerProductConfig,
}

impl InnerProductForward for SimInnerProduct {
    fn enqueue(
        &self,
        input: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: Option<&TensorView<'_>>,
        output: &TensorView<'_>,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        let queue = sim_queue(ctx)?;
        let batch = input.shape().first().copied().unwrap_or(0);
        let x = Region::of(queue, input)?;
        let w = Region::of(queue, weight)?;
        let b = bias.map(|bias| Region::of(queue, bias)).transpose()?;
        let y = Region::of(queue, output)?;
        let InnerProductConfig {
            inputs, outputs, ..
        } = self.config;
        submit(ctx, "inner_product", move || {
            let bias = b.as_ref().map(Region::load).transpose()?;
            let out = kernels::inner_product(
                batch,
                inputs,
                outputs,
                &x.load()?,
                &w.load()?,
                bias.as_deref(),
            );
            y.store(&out)
        })
    }
}

impl PrimitiveLibrary for SimPrimitives {
    fn name(&self) -> &str {
        "sim"
    }

    fn fill(
        &self,
        tensor: &TensorView<'_>,
        value: f64,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        let region = Region::of(sim_queue(ctx)?, tensor)?;
        let element = tensor.dtype().encode_scalar(value);
        submit(ctx, "fill", move || region.splat(&element))
    }

    fn activation_forward(
        &self,
        input: &TensorView<'_>,
        output: &TensorView<'_>,
        activation: Activation,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        if input.numel() != output.numel() {
            return Err(BridgeError::invalid_shape(
                "activation",
                format!("{:?} -> {:?}", input.shape(), output.shape()),
            ));
        }
        let queue = sim_queue(ctx)?;
        let x = Region::of(queue, input)?;
        let y = Region::of(queue, output)?;
        submit(ctx, "activation", move || {
            let mut values = x.load()?;
            kernels::activate(&mut values, activation);
            y.store(&values)
        })
    }

    fn create_conv2d(
        &self,
        config: &Conv2dConfig,
        input_shape: &[usize],
        _dtype: DType,
        _with_bias: bool,
    ) -> BridgeResult<Box<dyn Conv2dForward>> {
        let input = shape4("conv2d", input_shape)?;
        let [_, _, ho, wo] = config.output_shape(&input)?;
        Ok(Box::new(SimConv2d {
            config: *config,
            input,
            workspace: kernels::im2col_bytes(config, [ho, wo]),
        }))
    }

    fn create_max_pooling(
        &self,
        config: &PoolingConfig,
        _dtype: DType,
    ) -> BridgeResult<Box<dyn Pooling2dForward>> {
        Ok(Box::new(SimMaxPool { config: *config }))
    }

    fn create_global_avg_pooling(
        &self,
        input_shape: &[usize],
        _dtype: DType,
    ) -> BridgeResult<Box<dyn Pooling2dForward>> {
        Ok(Box::new(SimGlobalAvgPool {
            input: shape4("global_avg_pool2d", input_shape)?,
        }))
    }

    fn create_inner_product(
        &self,
        config: &InnerProductConfig,
        _with_bias: bool,
    ) -> BridgeResult<Box<dyn InnerProductForward>> {
        Ok(Box::new(SimInnerProduct { config: *config }))
    }
}
