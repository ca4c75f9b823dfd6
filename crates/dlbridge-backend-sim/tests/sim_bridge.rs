use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use dlbridge::backend::{create_bridge, has_backend, list_backends};
use dlbridge::context::ExecutionContext;
use dlbridge::primitives::{
    Activation, Conv2dConfig, Conv2dForward, InnerProductConfig, InnerProductForward,
    Pooling2dForward, PoolingConfig, PrimitiveLibrary,
};
use dlbridge::{
    Bridge, BridgeConfig, BridgeError, BridgeResult, DType, Device, ExecutionMode, Scalar,
    Tensor, TensorView,
};
use dlbridge_backend_sim::{
    register_sim_backend, sim_bridge, SimConfig, SimPrimitives, SimQueue, SimRuntime,
};
use dlbridge_backend_tests::smoke::{download_f32, upload_f32};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn bridge(mode: ExecutionMode) -> Bridge {
    init_tracing();
    sim_bridge(
        SimConfig::default(),
        BridgeConfig::default().with_execution_mode(mode),
    )
}

fn with_queue<T>(bridge: &Bridge, f: impl FnOnce(&SimQueue) -> T) -> Result<T> {
    let queue = bridge.registry().queue(bridge.default_device())?;
    let sim = queue
        .as_any()
        .downcast_ref::<SimQueue>()
        .context("bridge is not running on a simulated queue")?;
    Ok(f(sim))
}

fn sim_runtime(bridge: &Bridge) -> Result<&SimRuntime> {
    bridge
        .registry()
        .runtime()
        .as_any()
        .downcast_ref::<SimRuntime>()
        .context("bridge is not running on the simulated runtime")
}

fn stream_idle(bridge: &Bridge) -> Result<bool> {
    let stream = bridge.registry().stream(bridge.default_device());
    Ok(bridge.registry().query_stream(&stream)?)
}

#[test]
fn asynchronous_fill_returns_before_the_device_runs() -> Result<()> {
    let bridge = bridge(ExecutionMode::Asynchronous);
    let tensor = bridge.allocate_empty(&[64], None, None)?;
    bridge.synchronize(tensor.device())?;

    with_queue(&bridge, SimQueue::pause)?;
    bridge.fill_(&tensor, Scalar::Float(4.0))?;
    assert!(!stream_idle(&bridge)?, "fill should still be pending");
    with_queue(&bridge, SimQueue::resume)?;

    assert_eq!(download_f32(&bridge, &tensor)?, vec![4.0; 64]);
    assert!(stream_idle(&bridge)?);
    Ok(())
}

#[test]
fn synchronous_mode_leaves_the_queue_idle() -> Result<()> {
    let bridge = bridge(ExecutionMode::Synchronous);
    let tensor = upload_f32(&bridge, &[-2.0, 3.0], &[2])?;
    assert!(stream_idle(&bridge)?);
    bridge.relu_(&tensor)?;
    assert!(stream_idle(&bridge)?);
    bridge.zero_(&tensor)?;
    assert!(stream_idle(&bridge)?);
    assert_eq!(download_f32(&bridge, &tensor)?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn out_of_memory_is_reported_without_retry() -> Result<()> {
    init_tracing();
    let bridge = sim_bridge(SimConfig::default().with_capacity(1024), BridgeConfig::default());
    let kept = bridge.allocate_empty(&[128], None, None)?;
    let before = bridge.stats();
    let runtime = sim_runtime(&bridge)?;
    assert_eq!(runtime.bytes_in_use(0), 512);

    let err = bridge.allocate_empty(&[256], None, None).unwrap_err();
    match err {
        BridgeError::ResourceExhausted {
            requested,
            available,
            ..
        } => {
            assert_eq!(requested, 1024);
            assert_eq!(available, 512);
        }
        other => panic!("expected ResourceExhausted, got {other}"),
    }
    assert_eq!(bridge.stats(), before);
    assert_eq!(runtime.live_buffers(0), 1);

    drop(kept);
    assert_eq!(runtime.bytes_in_use(0), 0);
    assert_eq!(bridge.stats().live_buffers, 0);
    Ok(())
}

#[test]
fn enumeration_failure_reports_zero_devices() {
    init_tracing();
    let bridge = sim_bridge(
        SimConfig::default().with_failing_enumeration(),
        BridgeConfig::default(),
    );
    assert_eq!(bridge.registry().device_count(), 0);
    let err = bridge.allocate_empty(&[4], None, None).unwrap_err();
    assert!(
        matches!(err, BridgeError::InvalidDevice { count: 0, .. }),
        "{err}"
    );
}

#[test]
fn second_device_is_independent() -> Result<()> {
    init_tracing();
    let bridge = sim_bridge(SimConfig::default().with_devices(2), BridgeConfig::default());
    let second = Device::accelerator(1);
    let a = bridge.allocate_empty(&[3], None, Some(second))?;
    bridge.fill_(&a, Scalar::Int(2))?;
    assert_eq!(a.device(), second);
    assert_eq!(download_f32(&bridge, &a)?, vec![2.0; 3]);

    let b = bridge.allocate_empty(&[3], None, None)?;
    bridge.zero_(&b)?;
    let err = bridge.copy_from(&a, &b, false).unwrap_err();
    assert!(err.is_unsupported(), "{err}");
    assert_eq!(bridge.registry().live_queues(), 2);
    Ok(())
}

#[test]
fn released_tensor_survives_pending_work() -> Result<()> {
    let bridge = bridge(ExecutionMode::Asynchronous);
    let mut rng = StdRng::seed_from_u64(7);
    let values: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let source = upload_f32(&bridge, &values, &[32])?;

    with_queue(&bridge, SimQueue::pause)?;
    let copy = bridge.as_strided(&source, &[32], &[1], None)?;
    drop(source);
    let runtime = sim_runtime(&bridge)?;
    assert_eq!(runtime.live_buffers(0), 1);
    // The pending copy still holds the source's memory.
    assert_eq!(runtime.bytes_in_use(0), 2 * 32 * 4);
    with_queue(&bridge, SimQueue::resume)?;

    assert_eq!(download_f32(&bridge, &copy)?, values);
    assert_eq!(runtime.live_buffers(0), 1);
    assert_eq!(runtime.bytes_in_use(0), 32 * 4);
    Ok(())
}

struct BrokenConv;

impl Conv2dForward for BrokenConv {
    fn workspace(&self) -> usize {
        64
    }

    fn enqueue(
        &self,
        _input: &TensorView<'_>,
        _weight: &TensorView<'_>,
        _bias: Option<&TensorView<'_>>,
        _output: &TensorView<'_>,
        _workspace: Option<&TensorView<'_>>,
        _ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        Err(BridgeError::execution("conv2d rejected by driver"))
    }
}

/// Reference primitives whose convolution always fails after its buffers are allocated.
struct BrokenConvLibrary(SimPrimitives);

impl PrimitiveLibrary for BrokenConvLibrary {
    fn name(&self) -> &str {
        "broken-conv"
    }

    fn fill(
        &self,
        tensor: &TensorView<'_>,
        value: f64,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        self.0.fill(tensor, value, ctx)
    }

    fn activation_forward(
        &self,
        input: &TensorView<'_>,
        output: &TensorView<'_>,
        activation: Activation,
        ctx: &mut ExecutionContext,
    ) -> BridgeResult<()> {
        self.0.activation_forward(input, output, activation, ctx)
    }

    fn create_conv2d(
        &self,
        _config: &Conv2dConfig,
        _input_shape: &[usize],
        _dtype: DType,
        _with_bias: bool,
    ) -> BridgeResult<Box<dyn Conv2dForward>> {
        Ok(Box::new(BrokenConv))
    }

    fn create_max_pooling(
        &self,
        config: &PoolingConfig,
        dtype: DType,
    ) -> BridgeResult<Box<dyn Pooling2dForward>> {
        self.0.create_max_pooling(config, dtype)
    }

    fn create_global_avg_pooling(
        &self,
        input_shape: &[usize],
        dtype: DType,
    ) -> BridgeResult<Box<dyn Pooling2dForward>> {
        self.0.create_global_avg_pooling(input_shape, dtype)
    }

    fn create_inner_product(
        &self,
        config: &InnerProductConfig,
        with_bias: bool,
    ) -> BridgeResult<Box<dyn InnerProductForward>> {
        self.0.create_inner_product(config, with_bias)
    }
}

#[test]
fn failed_convolution_releases_output_and_workspace() -> Result<()> {
    init_tracing();
    let bridge = Bridge::new(
        Arc::new(SimRuntime::default()),
        Arc::new(BrokenConvLibrary(SimPrimitives::new())),
        BridgeConfig::default(),
    );
    let input = upload_f32(&bridge, &[1.0; 16], &[1, 1, 4, 4])?;
    let weight = upload_f32(&bridge, &[1.0; 4], &[1, 1, 2, 2])?;
    bridge.synchronize(input.device())?;
    let runtime = sim_runtime(&bridge)?;
    let live = runtime.live_buffers(0);
    let before = bridge.stats();

    let err = bridge
        .convolution_overrideable(
            &input,
            &weight,
            None,
            &[1, 1],
            &[0, 0],
            &[1, 1],
            false,
            &[0, 0],
            1,
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::Execution { .. }), "{err}");

    let after = bridge.stats();
    assert_eq!(runtime.live_buffers(0), live);
    assert_eq!(after.live_buffers, before.live_buffers);
    assert_eq!(after.live_bytes, before.live_bytes);
    // Output and workspace were allocated, then released.
    assert_eq!(after.allocations, before.allocations + 2);
    Ok(())
}

#[test]
fn host_storage_is_rejected_by_device_ops() {
    let bridge = bridge(ExecutionMode::Asynchronous);
    let host = Tensor::from_f32(&[1.0, -1.0], &[2]).unwrap();
    let err = bridge.relu_(&host).unwrap_err();
    assert!(matches!(err, BridgeError::StorageOrigin { .. }), "{err}");
    let err = bridge.fill_(&host, Scalar::Float(0.0)).unwrap_err();
    assert!(matches!(err, BridgeError::StorageOrigin { .. }), "{err}");
}

#[test]
fn non_contiguous_views_are_rejected() -> Result<()> {
    let bridge = bridge(ExecutionMode::Asynchronous);
    let tensor = upload_f32(&bridge, &[1.0, 2.0, 3.0, 4.0], &[2, 2])?;
    let transposed = bridge.reshape_alias(&tensor, &[2, 2], &[1, 2])?;
    let err = bridge.relu_(&transposed).unwrap_err();
    assert!(matches!(err, BridgeError::NonContiguous { .. }), "{err}");
    Ok(())
}

#[test]
fn registered_backend_builds_bridges_by_name() -> Result<()> {
    init_tracing();
    register_sim_backend();
    assert!(has_backend("sim"));
    assert!(list_backends().iter().any(|name| name == "sim"));
    assert!(create_bridge("missing", BridgeConfig::default()).is_none());

    let bridge = create_bridge(
        "sim",
        BridgeConfig::default().with_execution_mode(ExecutionMode::Synchronous),
    )
    .context("sim backend not registered")??;
    assert_eq!(bridge.registry().runtime().name(), "sim");
    assert_eq!(bridge.primitives().name(), "sim");
    let tensor = bridge.allocate_empty(&[2], None, None)?;
    bridge.fill_(&tensor, Scalar::Bool(true))?;
    assert_eq!(download_f32(&bridge, &tensor)?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn shutdown_drains_queues() -> Result<()> {
    let bridge = bridge(ExecutionMode::Asynchronous);
    let tensor = bridge.allocate_empty(&[16], None, None)?;
    bridge.fill_(&tensor, Scalar::Float(1.0))?;
    bridge.shutdown()?;
    assert_eq!(bridge.registry().live_queues(), 0);
    assert_eq!(download_f32(&bridge, &tensor)?, vec![1.0; 16]);
    Ok(())
}
