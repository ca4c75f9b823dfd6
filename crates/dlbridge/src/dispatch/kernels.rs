//! Positional kernels wrapping the typed bridge operations.

use super::value::{Args, Value};
use super::{DispatchKey, DispatchTable};
use crate::error::BridgeResult;
use crate::ops::Bridge;

fn empty(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("empty.memory_format", args);
    let size = args.int_list()?;
    let dtype = args.optional_dtype()?;
    args.ignored(); // layout
    let device = args.optional_device()?;
    Ok(vec![bridge.allocate_empty(&size, dtype, device)?.into()])
}

fn empty_strided(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("empty_strided", args);
    let size = args.int_list()?;
    let stride = args.int_list()?;
    let dtype = args.optional_dtype()?;
    args.ignored(); // layout
    let device = args.optional_device()?;
    Ok(vec![bridge.empty_strided(&size, &stride, dtype, device)?.into()])
}

fn reshape_alias(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("_reshape_alias", args);
    let tensor = args.tensor()?;
    let size = args.int_list()?;
    let stride = args.int_list()?;
    Ok(vec![bridge.reshape_alias(&tensor, &size, &stride)?.into()])
}

fn fill(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("fill_.Scalar", args);
    let tensor = args.tensor()?;
    let value = args.scalar()?;
    Ok(vec![bridge.fill_(&tensor, value)?.into()])
}

fn zero(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("zero_", args);
    let tensor = args.tensor()?;
    Ok(vec![bridge.zero_(&tensor)?.into()])
}

fn copy_from(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("_copy_from", args);
    let src = args.tensor()?;
    let dst = args.tensor()?;
    let non_blocking = args.bool()?;
    Ok(vec![bridge.copy_from(&src, &dst, non_blocking)?.into()])
}

fn convolution(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("convolution_overrideable", args);
    let input = args.tensor()?;
    let weight = args.tensor()?;
    let bias = args.optional_tensor()?;
    let stride = args.int_list()?;
    let padding = args.int_list()?;
    let dilation = args.int_list()?;
    let transposed = args.bool()?;
    let output_padding = args.int_list()?;
    let groups = args.int()?;
    let output = bridge.convolution_overrideable(
        &input,
        &weight,
        bias.as_ref(),
        &stride,
        &padding,
        &dilation,
        transposed,
        &output_padding,
        groups,
    )?;
    Ok(vec![output.into()])
}

fn relu(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("relu_", args);
    let tensor = args.tensor()?;
    Ok(vec![bridge.relu_(&tensor)?.into()])
}

fn max_pool2d_out(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("max_pool2d_with_indices.out", args);
    let input = args.tensor()?;
    let kernel_size = args.int_list()?;
    let stride = args.int_list()?;
    let padding = args.int_list()?;
    let dilation = args.int_list()?;
    let ceil_mode = args.bool()?;
    let out = args.tensor()?;
    let indices = args.optional_tensor()?;
    let out = bridge.max_pool2d_with_indices_out(
        &input,
        &kernel_size,
        &stride,
        &padding,
        &dilation,
        ceil_mode,
        &out,
        indices.as_ref(),
    )?;
    Ok(vec![out.into(), Value::OptionalTensor(indices)])
}

fn adaptive_avg_pool2d(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("_adaptive_avg_pool2d", args);
    let input = args.tensor()?;
    let output_size = args.int_list()?;
    Ok(vec![bridge.adaptive_avg_pool2d(&input, &output_size)?.into()])
}

fn linear(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("linear", args);
    let input = args.tensor()?;
    let weight = args.tensor()?;
    let bias = args.optional_tensor()?;
    Ok(vec![bridge.linear(&input, &weight, bias.as_ref())?.into()])
}

fn as_strided(bridge: &Bridge, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
    let mut args = Args::new("as_strided", args);
    let tensor = args.tensor()?;
    let size = args.int_list()?;
    let stride = args.int_list()?;
    let storage_offset = args.optional_int()?;
    Ok(vec![bridge
        .as_strided(&tensor, &size, &stride, storage_offset)?
        .into()])
}

/// Registers every bridged operation. `linear` sits under the autograd key so the framework
/// does not decompose it before it reaches the bridge.
pub fn register_bridge_ops(table: &mut DispatchTable) {
    use DispatchKey::{Accelerator, AutogradAccelerator};

    table.register(Accelerator, "empty.memory_format", empty);
    table.register(Accelerator, "empty_strided", empty_strided);
    table.register(Accelerator, "_reshape_alias", reshape_alias);
    table.register(Accelerator, "fill_.Scalar", fill);
    table.register(Accelerator, "zero_", zero);
    table.register(Accelerator, "_copy_from", copy_from);
    table.register(Accelerator, "convolution_overrideable", convolution);
    table.register(Accelerator, "relu_", relu);
    table.register(Accelerator, "max_pool2d_with_indices.out", max_pool2d_out);
    table.register(Accelerator, "_adaptive_avg_pool2d", adaptive_avg_pool2d);
    table.register(Accelerator, "as_strided", as_strided);
    table.register(AutogradAccelerator, "linear", linear);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_bridged_op() {
        let table = DispatchTable::with_bridge_ops();
        assert_eq!(
            table.ops(DispatchKey::Accelerator),
            vec![
                "_adaptive_avg_pool2d",
                "_copy_from",
                "_reshape_alias",
                "as_strided",
                "convolution_overrideable",
                "empty.memory_format",
                "empty_strided",
                "fill_.Scalar",
                "max_pool2d_with_indices.out",
                "relu_",
                "zero_",
            ]
        );
        assert_eq!(table.ops(DispatchKey::AutogradAccelerator), vec!["linear"]);
        assert!(table.contains(DispatchKey::Accelerator, "aten::relu_"));
        assert!(!table.contains(DispatchKey::Accelerator, "linear"));
        assert_eq!(table.len(), 12);
    }
}
