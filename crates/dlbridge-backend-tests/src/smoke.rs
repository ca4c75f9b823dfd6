//! Conformance checks every runtime and primitives pairing must pass.
//!
//! Each check takes a ready bridge whose default device is accelerator 0 and returns an error
//! (or panics on a failed assertion) when the contract is violated.

use anyhow::{Context, Result};
use dlbridge::dispatch::{DispatchKey, DispatchTable, Value};
use dlbridge::framework::Tensor;
use dlbridge::{Bridge, BridgeError, DType, Device, ExecutionMode, Scalar};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALL_DTYPES: [DType; 8] = [
    DType::F32,
    DType::F16,
    DType::BF16,
    DType::F64,
    DType::I32,
    DType::I64,
    DType::U8,
    DType::Bool,
];

/// Runs `check` against a bridge built for each execution mode.
pub fn run_in_both_modes<C, F>(ctor: C, check: F) -> Result<()>
where
    C: Fn(ExecutionMode) -> Bridge,
    F: Fn(&Bridge) -> Result<()>,
{
    for mode in [ExecutionMode::Synchronous, ExecutionMode::Asynchronous] {
        let bridge = ctor(mode);
        check(&bridge).with_context(|| format!("execution mode {mode:?}"))?;
    }
    Ok(())
}

/// Copies a host tensor onto the bridge's default accelerator.
pub fn upload(bridge: &Bridge, host: &Tensor) -> Result<Tensor> {
    let device = bridge.allocate_empty(host.sizes(), Some(host.dtype()), None)?;
    bridge.copy_from(host, &device, false)?;
    Ok(device)
}

/// Copies an accelerator tensor into a fresh host tensor.
pub fn download(bridge: &Bridge, device: &Tensor) -> Result<Tensor> {
    let host = Tensor::zeros_host(device.sizes(), device.dtype())?;
    bridge.copy_from(device, &host, false)?;
    Ok(host)
}

pub fn download_f32(bridge: &Bridge, device: &Tensor) -> Result<Vec<f32>> {
    Ok(download(bridge, device)?.to_f32_vec()?)
}

pub fn upload_f32(bridge: &Bridge, values: &[f32], sizes: &[i64]) -> Result<Tensor> {
    upload(bridge, &Tensor::from_f32(values, sizes)?)
}

fn shapes() -> Vec<Vec<i64>> {
    vec![
        vec![0],
        vec![7],
        vec![2, 3],
        vec![1, 3, 5],
        vec![2, 1, 3, 4],
    ]
}

pub fn allocate_then_read_has_requested_size(bridge: &Bridge) -> Result<()> {
    for dtype in ALL_DTYPES {
        for sizes in shapes() {
            let tensor = bridge.allocate_empty(&sizes, Some(dtype), None)?;
            assert_eq!(tensor.device(), Device::accelerator(0));
            assert_eq!(tensor.sizes(), sizes.as_slice());
            let host = download(bridge, &tensor)?;
            let expected = sizes.iter().product::<i64>() as usize * dtype.size_in_bytes();
            assert_eq!(host.host_bytes()?.len(), expected, "{dtype:?} {sizes:?}");
        }
    }
    Ok(())
}

pub fn fill_reaches_every_element(bridge: &Bridge) -> Result<()> {
    for value in [0.0f32, 1.0, -3.5, 1.0e30] {
        let tensor = bridge.allocate_empty(&[3, 5], None, None)?;
        bridge.fill_(&tensor, Scalar::from(value))?;
        let host = download_f32(bridge, &tensor)?;
        assert!(host.iter().all(|&x| x == value), "fill {value}: {host:?}");
    }
    let half = bridge.allocate_empty(&[4], Some(DType::F16), None)?;
    bridge.fill_(&half, Scalar::Float(-3.5))?;
    let expected = DType::F16.encode_scalar(-3.5).repeat(4);
    assert_eq!(download(bridge, &half)?.host_bytes()?, expected);
    Ok(())
}

pub fn zero_matches_fill_zero(bridge: &Bridge) -> Result<()> {
    for dtype in ALL_DTYPES {
        for sizes in shapes() {
            let zeroed = bridge.allocate_empty(&sizes, Some(dtype), None)?;
            bridge.fill_(&zeroed, Scalar::Int(5))?;
            bridge.zero_(&zeroed)?;
            let filled = bridge.allocate_empty(&sizes, Some(dtype), None)?;
            bridge.fill_(&filled, Scalar::Float(0.0))?;
            let zeroed = download(bridge, &zeroed)?.host_bytes()?;
            let filled = download(bridge, &filled)?.host_bytes()?;
            assert_eq!(zeroed, filled, "{dtype:?} {sizes:?}");
            assert!(zeroed.iter().all(|&b| b == 0));
        }
    }
    Ok(())
}

pub fn host_round_trip_preserves_bytes(bridge: &Bridge) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    for sizes in [vec![5i64], vec![3, 4], vec![2, 3, 4], vec![2, 2, 3, 5]] {
        for dtype in [DType::F32, DType::F16, DType::I64, DType::U8] {
            let numel = sizes.iter().product::<i64>() as usize;
            let bytes: Vec<u8> = (0..numel * dtype.size_in_bytes()).map(|_| rng.gen()).collect();
            let host = Tensor::from_host_bytes(bytes.clone(), &sizes, dtype)?;
            let device = upload(bridge, &host)?;
            assert_eq!(download(bridge, &device)?.host_bytes()?, bytes, "{dtype:?} {sizes:?}");
        }
    }
    Ok(())
}

pub fn reshape_alias_shares_storage(bridge: &Bridge) -> Result<()> {
    let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
    let tensor = upload_f32(bridge, &values, &[2, 3])?;
    let before = bridge.stats();
    let alias = bridge.reshape_alias(&tensor, &[3, 2], &[2, 1])?;
    assert_eq!(bridge.stats(), before, "reshape must not allocate");
    assert!(alias.storage().is_same(tensor.storage()));
    assert_eq!(alias.sizes(), &[3, 2]);

    bridge.fill_(&alias, Scalar::Float(7.0))?;
    assert_eq!(download_f32(bridge, &tensor)?, vec![7.0; 6]);

    let err = bridge.reshape_alias(&tensor, &[4, 2], &[2, 1]).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    Ok(())
}

pub fn convolution_output_shape_and_values(bridge: &Bridge) -> Result<()> {
    let input = upload_f32(bridge, &[1.0; 2 * 3 * 8 * 8], &[2, 3, 8, 8])?;
    let weight = upload_f32(bridge, &[1.0; 4 * 3 * 3 * 3], &[4, 3, 3, 3])?;
    let bias = upload_f32(bridge, &[0.5; 4], &[4])?;
    let output = bridge.convolution_overrideable(
        &input,
        &weight,
        Some(&bias),
        &[1, 1],
        &[0, 0],
        &[1, 1],
        false,
        &[0, 0],
        1,
    )?;
    assert_eq!(output.sizes(), &[2, 4, 6, 6]);
    assert_eq!(output.dtype(), DType::F32);
    let values = download_f32(bridge, &output)?;
    assert!(values.iter().all(|&v| v == 27.5), "{values:?}");

    let padded = bridge.convolution_overrideable(
        &input,
        &weight,
        None,
        &[2, 2],
        &[1, 1],
        &[1, 1],
        false,
        &[0, 0],
        1,
    )?;
    assert_eq!(padded.sizes(), &[2, 4, 4, 4]);
    let values = download_f32(bridge, &padded)?;
    // Top-left window covers a 2x2 patch of ones per channel.
    assert_eq!(values[0], 12.0);
    Ok(())
}

pub fn transposed_convolution_is_rejected_before_device_work(bridge: &Bridge) -> Result<()> {
    let input = upload_f32(bridge, &[1.0; 16], &[1, 1, 4, 4])?;
    let weight = upload_f32(bridge, &[1.0; 4], &[1, 1, 2, 2])?;
    bridge.synchronize(input.device())?;
    let before = bridge.stats();
    let err = bridge
        .convolution_overrideable(
            &input,
            &weight,
            None,
            &[1, 1],
            &[0, 0],
            &[1, 1],
            true,
            &[0, 0],
            1,
        )
        .unwrap_err();
    assert!(err.is_unsupported(), "{err}");
    assert_eq!(bridge.stats(), before);
    let stream = bridge.registry().stream(input.device());
    assert!(bridge.registry().query_stream(&stream)?);

    let err = bridge
        .convolution_overrideable(&input, &weight, None, &[1], &[0, 0], &[1, 1], false, &[0, 0], 1)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    Ok(())
}

pub fn max_pool_windows_and_rejections(bridge: &Bridge) -> Result<()> {
    let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let input = upload_f32(bridge, &values, &[1, 1, 4, 4])?;
    let out = bridge.allocate_empty(&[1, 1, 2, 2], None, None)?;
    let pool = |dilation: &[i64], ceil_mode: bool, indices: Option<&Tensor>| {
        bridge.max_pool2d_with_indices_out(
            &input,
            &[2, 2],
            &[2, 2],
            &[0, 0],
            dilation,
            ceil_mode,
            &out,
            indices,
        )
    };

    let err = pool(&[2, 1], false, None).unwrap_err();
    assert!(err.is_unsupported(), "{err}");
    let err = pool(&[1, 1], true, None).unwrap_err();
    assert!(err.is_unsupported(), "{err}");
    let indices = bridge.allocate_empty(&[1, 1, 2, 2], Some(DType::I64), None)?;
    let err = pool(&[1, 1], false, Some(&indices)).unwrap_err();
    assert!(err.is_unsupported(), "{err}");

    let result = pool(&[1, 1], false, None)?;
    assert!(result.storage().is_same(out.storage()));
    assert_eq!(download_f32(bridge, &out)?, vec![5.0, 7.0, 13.0, 15.0]);

    let wrong = bridge.allocate_empty(&[1, 1, 3, 3], None, None)?;
    let err = bridge
        .max_pool2d_with_indices_out(
            &input,
            &[2, 2],
            &[2, 2],
            &[0, 0],
            &[1, 1],
            false,
            &wrong,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    Ok(())
}

pub fn adaptive_avg_pool_global_and_identity(bridge: &Bridge) -> Result<()> {
    let input = upload_f32(bridge, &[2.5; 16], &[1, 1, 4, 4])?;
    let pooled = bridge.adaptive_avg_pool2d(&input, &[1, 1])?;
    assert_eq!(pooled.sizes(), &[1, 1, 1, 1]);
    assert_eq!(download_f32(bridge, &pooled)?, vec![2.5]);

    let before = bridge.stats();
    let same = bridge.adaptive_avg_pool2d(&input, &[4, 4])?;
    assert!(same.storage().is_same(input.storage()));
    assert_eq!(same.sizes(), input.sizes());
    assert_eq!(bridge.stats(), before);

    let err = bridge.adaptive_avg_pool2d(&input, &[2, 2]).unwrap_err();
    assert!(err.is_unsupported(), "{err}");

    let mixed: Vec<f32> = (0..8).map(|v| v as f32).collect();
    let input = upload_f32(bridge, &mixed, &[1, 2, 2, 2])?;
    let pooled = bridge.adaptive_avg_pool2d(&input, &[1, 1])?;
    assert_eq!(download_f32(bridge, &pooled)?, vec![1.5, 5.5]);
    Ok(())
}

pub fn relu_in_place(bridge: &Bridge) -> Result<()> {
    let tensor = upload_f32(bridge, &[-1.0, 2.0, -3.0, 4.0], &[2, 2])?;
    let result = bridge.relu_(&tensor)?;
    assert!(result.storage().is_same(tensor.storage()));
    assert_eq!(download_f32(bridge, &tensor)?, vec![0.0, 2.0, 0.0, 4.0]);
    Ok(())
}

pub fn linear_matches_reference(bridge: &Bridge) -> Result<()> {
    let input = upload_f32(bridge, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    let weight = upload_f32(bridge, &[1.0, 0.0, -1.0, 2.0, 1.0, 0.0], &[2, 3])?;
    let bias = upload_f32(bridge, &[10.0, -10.0], &[2])?;
    let output = bridge.linear(&input, &weight, Some(&bias))?;
    assert_eq!(output.sizes(), &[2, 2]);
    assert_eq!(download_f32(bridge, &output)?, vec![8.0, -6.0, 8.0, 3.0]);

    let without_bias = bridge.linear(&input, &weight, None)?;
    assert_eq!(download_f32(bridge, &without_bias)?, vec![-2.0, 4.0, -2.0, 13.0]);

    let bad = upload_f32(bridge, &[1.0; 4], &[2, 2])?;
    let err = bridge.linear(&input, &bad, None).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    Ok(())
}

pub fn as_strided_copies_from_offset(bridge: &Bridge) -> Result<()> {
    let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
    let source = upload_f32(bridge, &values, &[8])?;
    let copy = bridge.as_strided(&source, &[2, 2], &[2, 1], Some(3))?;
    assert!(!copy.storage().is_same(source.storage()));
    assert_eq!(copy.sizes(), &[2, 2]);
    assert_eq!(download_f32(bridge, &copy)?, vec![3.0, 4.0, 5.0, 6.0]);

    let whole = bridge.as_strided(&source, &[8], &[1], None)?;
    assert_eq!(download_f32(bridge, &whole)?, values);

    let err = bridge.as_strided(&source, &[4], &[1], Some(6)).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    Ok(())
}

pub fn copy_directions(bridge: &Bridge) -> Result<()> {
    let a = Tensor::from_f32(&[1.0, 2.0], &[2])?;
    let b = Tensor::from_f32(&[0.0, 0.0], &[2])?;
    let err = bridge.copy_from(&a, &b, false).unwrap_err();
    assert!(err.is_unsupported(), "{err}");

    let device = upload(bridge, &a)?;
    let other = bridge.allocate_empty(&[2], None, None)?;
    bridge.copy_from(&device, &other, false)?;
    assert_eq!(download_f32(bridge, &other)?, vec![1.0, 2.0]);

    let mismatched = Tensor::from_f32(&[0.0; 3], &[3])?;
    assert!(bridge.copy_from(&device, &mismatched, false).is_err());
    Ok(())
}

/// Work enqueued on one queue observes earlier writes without explicit synchronization.
pub fn write_then_read_in_enqueue_order(bridge: &Bridge) -> Result<()> {
    let tensor = upload_f32(bridge, &[-1.0, 2.0, -3.0, 4.0], &[4])?;
    bridge.relu_(&tensor)?;
    let copy = bridge.as_strided(&tensor, &[4], &[1], None)?;
    bridge.fill_(&tensor, Scalar::Float(9.0))?;
    let scaled = upload_f32(bridge, &[1.0, 1.0, 1.0, 1.0], &[1, 4])?;
    let sum = bridge.linear(&scaled, &bridge.reshape_alias(&copy, &[1, 4], &[4, 1])?, None)?;
    assert_eq!(download_f32(bridge, &copy)?, vec![0.0, 2.0, 0.0, 4.0]);
    assert_eq!(download_f32(bridge, &tensor)?, vec![9.0; 4]);
    assert_eq!(download_f32(bridge, &sum)?, vec![6.0]);
    Ok(())
}

pub fn dispatch_table_routes_by_name(bridge: &Bridge) -> Result<()> {
    let table = DispatchTable::with_bridge_ops();
    let out = table.call(
        bridge,
        DispatchKey::Accelerator,
        "aten::empty.memory_format",
        vec![Value::IntList(vec![2, 2]), Value::None, Value::None, Value::None],
    )?;
    let tensor = out
        .into_iter()
        .next()
        .and_then(Value::into_tensor)
        .context("empty returned no tensor")?;
    table.call(
        bridge,
        DispatchKey::Accelerator,
        "fill_.Scalar",
        vec![tensor.clone().into(), Value::Double(1.5)],
    )?;
    assert_eq!(download_f32(bridge, &tensor)?, vec![1.5; 4]);

    let weight = upload_f32(bridge, &[1.0, 1.0, 1.0, 1.0], &[2, 2])?;
    let linear = table.call(
        bridge,
        DispatchKey::AutogradAccelerator,
        "linear",
        vec![tensor.into(), weight.into(), Value::OptionalTensor(None)],
    )?;
    let linear = linear[0].as_tensor().context("linear returned no tensor")?;
    assert_eq!(download_f32(bridge, linear)?, vec![3.0; 4]);

    let err = table
        .call(bridge, DispatchKey::Accelerator, "aten::add.Tensor", Vec::new())
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotRegistered { .. }), "{err}");
    let err = table
        .call(bridge, DispatchKey::Accelerator, "relu_", vec![Value::Int(1)])
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }), "{err}");
    Ok(())
}

/// Window and offset parameters far outside any real tensor are rejected through the dispatch
/// path without allocating.
pub fn oversized_parameters_are_rejected(bridge: &Bridge) -> Result<()> {
    use DispatchKey::Accelerator;

    let table = DispatchTable::with_bridge_ops();
    let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let input = upload_f32(bridge, &values, &[1, 1, 4, 4])?;
    let weight = upload_f32(bridge, &[1.0; 4], &[1, 1, 2, 2])?;
    let pooled = bridge.allocate_empty(&[1, 1, 1, 1], None, None)?;
    bridge.synchronize(input.device())?;
    let before = bridge.stats();

    let conv = |stride: [i64; 2], padding: [i64; 2], dilation: [i64; 2]| {
        let args = vec![
            input.clone().into(),
            weight.clone().into(),
            Value::OptionalTensor(None),
            Value::IntList(stride.to_vec()),
            Value::IntList(padding.to_vec()),
            Value::IntList(dilation.to_vec()),
            Value::Bool(false),
            Value::IntList(vec![0, 0]),
            Value::Int(1),
        ];
        table.call(bridge, Accelerator, "convolution_overrideable", args)
    };
    let pool = |stride: [i64; 2], padding: [i64; 2]| {
        let args = vec![
            input.clone().into(),
            Value::IntList(vec![2, 2]),
            Value::IntList(stride.to_vec()),
            Value::IntList(padding.to_vec()),
            Value::IntList(vec![1, 1]),
            Value::Bool(false),
            pooled.clone().into(),
            Value::OptionalTensor(None),
        ];
        table.call(bridge, Accelerator, "max_pool2d_with_indices.out", args)
    };
    let as_strided = |sizes: Vec<i64>, offset: i64| {
        let args = vec![
            input.clone().into(),
            Value::IntList(sizes),
            Value::IntList(vec![1]),
            Value::OptionalInt(Some(offset)),
        ];
        table.call(bridge, Accelerator, "as_strided", args)
    };

    let huge = i64::MAX;
    for (padding, dilation) in [
        ([huge, 0], [1, 1]),
        ([0, huge], [1, 1]),
        ([0, 0], [huge, 1]),
        ([huge, huge], [huge, huge]),
    ] {
        let err = conv([1, 1], padding, dilation).unwrap_err();
        assert!(
            matches!(err, BridgeError::InvalidShape { .. }),
            "padding {padding:?} dilation {dilation:?}: {err}"
        );
    }
    for padding in [[huge, 0], [0, huge]] {
        let err = pool([2, 2], padding).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape { .. }), "{padding:?}: {err}");
    }
    for (sizes, offset) in [(vec![4], huge), (vec![4], huge / 4), (vec![huge, 4], 0)] {
        let err = as_strided(sizes.clone(), offset).unwrap_err();
        assert!(
            matches!(err, BridgeError::InvalidShape { .. }),
            "{sizes:?} at {offset}: {err}"
        );
    }
    let err = table
        .call(
            bridge,
            Accelerator,
            "_reshape_alias",
            vec![
                input.clone().into(),
                Value::IntList(vec![2, 8]),
                Value::IntList(vec![huge, 1]),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    let err = table
        .call(
            bridge,
            Accelerator,
            "empty.memory_format",
            vec![Value::IntList(vec![huge, huge]), Value::None, Value::None, Value::None],
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidShape { .. }), "{err}");
    assert_eq!(bridge.stats(), before);

    // A stride past the input still yields the first window.
    let out = conv([huge, huge], [0, 0], [1, 1])?;
    let out = out[0].as_tensor().context("convolution returned no tensor")?;
    assert_eq!(out.sizes(), &[1, 1, 1, 1]);
    assert_eq!(download_f32(bridge, out)?, vec![10.0]);
    pool([huge, huge], [0, 0])?;
    assert_eq!(download_f32(bridge, &pooled)?, vec![5.0]);
    Ok(())
}

/// Weights and biases must share the input's element type.
pub fn mismatched_parameter_dtypes_are_rejected(bridge: &Bridge) -> Result<()> {
    let features = upload_f32(bridge, &[1.0; 6], &[2, 3])?;
    let weight = upload_f32(bridge, &[1.0; 6], &[2, 3])?;
    let image = upload_f32(bridge, &[1.0; 16], &[1, 1, 4, 4])?;
    let kernel = upload_f32(bridge, &[1.0; 8], &[2, 1, 2, 2])?;
    let half_weight = bridge.allocate_empty(&[2, 3], Some(DType::F16), None)?;
    let half_kernel = bridge.allocate_empty(&[2, 1, 2, 2], Some(DType::F16), None)?;
    let half_bias = bridge.allocate_empty(&[2], Some(DType::F16), None)?;
    bridge.synchronize(image.device())?;
    let before = bridge.stats();

    let err = bridge.linear(&features, &half_weight, None).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }), "{err}");
    let err = bridge
        .linear(&features, &weight, Some(&half_bias))
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }), "{err}");

    let conv = |weight: &Tensor, bias: Option<&Tensor>| {
        bridge.convolution_overrideable(
            &image,
            weight,
            bias,
            &[1, 1],
            &[0, 0],
            &[1, 1],
            false,
            &[0, 0],
            1,
        )
    };
    let err = conv(&half_kernel, None).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }), "{err}");
    let err = conv(&kernel, Some(&half_bias)).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }), "{err}");
    assert_eq!(bridge.stats(), before);

    let full_bias = upload_f32(bridge, &[0.5, -0.5], &[2])?;
    let out = conv(&kernel, Some(&full_bias))?;
    assert_eq!(out.sizes(), &[1, 2, 3, 3]);
    assert_eq!(download_f32(bridge, &out)?[..2], [4.5, 4.5]);
    Ok(())
}

pub fn failed_allocation_leaves_no_trace(bridge: &Bridge) -> Result<()> {
    let before = bridge.stats();
    let err = bridge
        .allocate_empty(&[1 << 40], Some(DType::F64), None)
        .unwrap_err();
    assert!(
        matches!(err, BridgeError::ResourceExhausted { .. }),
        "{err}"
    );
    assert_eq!(bridge.stats(), before);

    let err = bridge
        .allocate_empty(&[4], None, Some(Device::accelerator(99)))
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidDevice { .. }), "{err}");
    Ok(())
}
