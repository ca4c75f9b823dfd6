//! Host-side reference kernels executed by the simulated queue.
//!
//! Every kernel computes in `f32`; narrower and wider element types are converted on load and
//! store.

use dlbridge::primitives::{Activation, Conv2dConfig, PoolingConfig};
use dlbridge::{BridgeError, BridgeResult, DType, TensorView};
use half::{bf16, f16};

use crate::runtime::{SimBuffer, SimQueue};

fn poisoned() -> BridgeError {
    BridgeError::execution("device buffer lock poisoned")
}

/// A typed range of simulated device memory captured by a command.
#[derive(Clone)]
pub(crate) struct Region {
    buffer: SimBuffer,
    offset: usize,
    numel: usize,
    dtype: DType,
}

impl Region {
    pub(crate) fn of(queue: &SimQueue, view: &TensorView<'_>) -> BridgeResult<Self> {
        Ok(Self {
            buffer: queue.buffer(view.raw())?,
            offset: view.offset(),
            numel: view.numel(),
            dtype: view.dtype(),
        })
    }

    /// Same bytes viewed as elements of `dtype`.
    pub(crate) fn reinterpret(mut self, dtype: DType) -> Self {
        self.numel = self.numel * self.dtype.size_in_bytes() / dtype.size_in_bytes();
        self.dtype = dtype;
        self
    }

    fn byte_range(&self, len: usize) -> BridgeResult<std::ops::Range<usize>> {
        let bytes = self.numel.saturating_mul(self.dtype.size_in_bytes());
        let end = self.offset.saturating_add(bytes);
        if end > len {
            return Err(BridgeError::execution(format!(
                "region [{}, {end}) past buffer of {len} bytes",
                self.offset
            )));
        }
        Ok(self.offset..end)
    }

    pub(crate) fn load(&self) -> BridgeResult<Vec<f32>> {
        let data = self.buffer.read().map_err(|_| poisoned())?;
        let range = self.byte_range(data.len())?;
        Ok(decode(&data[range], self.dtype))
    }

    pub(crate) fn store(&self, values: &[f32]) -> BridgeResult<()> {
        if values.len() != self.numel {
            return Err(BridgeError::execution(format!(
                "storing {} values into a region of {}",
                values.len(),
                self.numel
            )));
        }
        let mut data = self.buffer.write().map_err(|_| poisoned())?;
        let range = self.byte_range(data.len())?;
        data[range].copy_from_slice(&encode(values, self.dtype));
        Ok(())
    }

    /// Writes one encoded element repeatedly, bypassing the `f32` conversion.
    pub(crate) fn splat(&self, element: &[u8]) -> BridgeResult<()> {
        let mut data = self.buffer.write().map_err(|_| poisoned())?;
        let range = self.byte_range(data.len())?;
        for chunk in data[range].chunks_exact_mut(element.len()) {
            chunk.copy_from_slice(element);
        }
        Ok(())
    }
}

pub(crate) fn decode(bytes: &[u8], dtype: DType) -> Vec<f32> {
    match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_ne_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_ne_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        DType::I32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        DType::I64 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        DType::U8 | DType::Bool => bytes.iter().map(|&b| f32::from(b)).collect(),
    }
}

pub(crate) fn encode(values: &[f32], dtype: DType) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * dtype.size_in_bytes());
    for &value in values {
        match dtype {
            DType::F32 => out.extend_from_slice(&value.to_ne_bytes()),
            DType::F16 => out.extend_from_slice(&f16::from_f32(value).to_ne_bytes()),
            DType::BF16 => out.extend_from_slice(&bf16::from_f32(value).to_ne_bytes()),
            DType::F64 => out.extend_from_slice(&f64::from(value).to_ne_bytes()),
            DType::I32 => out.extend_from_slice(&(value as i32).to_ne_bytes()),
            DType::I64 => out.extend_from_slice(&(value as i64).to_ne_bytes()),
            DType::U8 => out.push(value as u8),
            DType::Bool => out.push(u8::from(value != 0.0)),
        }
    }
    out
}

pub(crate) fn activate(values: &mut [f32], activation: Activation) {
    let f: fn(f32) -> f32 = match activation {
        Activation::Identity => return,
        Activation::Relu => |x| x.max(0.0),
        Activation::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
        Activation::Tanh => f32::tanh,
    };
    for value in values {
        *value = f(*value);
    }
}

/// Bytes of the im2col scratch matrix for one batch item and group.
pub(crate) fn im2col_bytes(config: &Conv2dConfig, output_hw: [usize; 2]) -> usize {
    let rows = config.channels_in / config.groups * config.kernel[0] * config.kernel[1];
    [output_hw[0], output_hw[1], std::mem::size_of::<f32>()]
        .into_iter()
        .fold(rows, usize::saturating_mul)
}

/// Input coordinate read by output position `out` at kernel tap `tap`, or `None` in padding.
fn source_index(
    out: usize,
    tap: usize,
    stride: usize,
    dilation: usize,
    pad: usize,
    extent: usize,
) -> Option<usize> {
    (out * stride + tap * dilation)
        .checked_sub(pad)
        .filter(|&index| index < extent)
}

/// Unrolls input windows of group `group` of batch item `n` into `col` (`rows x Ho*Wo`).
fn im2col(
    config: &Conv2dConfig,
    x: &[f32],
    input: [usize; 4],
    output_hw: [usize; 2],
    n: usize,
    group: usize,
    col: &mut [f32],
) {
    let [_, cin, h, w] = input;
    let [ho, wo] = output_hw;
    let cin_g = config.channels_in / config.groups;
    let [kh, kw] = config.kernel;
    let [sy, sx] = config.stride;
    let [dy, dx] = config.dilation;
    let [py, px] = config.pad;
    let plane = ho * wo;
    for c in 0..cin_g {
        let channel = group * cin_g + c;
        let base = (n * cin + channel) * h * w;
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (c * kh + ki) * kw + kj;
                for oy in 0..ho {
                    let iy = source_index(oy, ki, sy, dy, py, h);
                    for ox in 0..wo {
                        let ix = source_index(ox, kj, sx, dx, px, w);
                        col[row * plane + oy * wo + ox] = match (iy, ix) {
                            (Some(iy), Some(ix)) => x[base + iy * w + ix],
                            _ => 0.0,
                        };
                    }
                }
            }
        }
    }
}

/// Forward convolution: im2col into `workspace`, then a GEMM against the weights.
pub(crate) fn conv2d(
    config: &Conv2dConfig,
    input: [usize; 4],
    x: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    workspace: &Region,
) -> BridgeResult<Vec<f32>> {
    let [batch, _, _, _] = input;
    let output = config.output_shape(&input)?;
    let [_, cout, ho, wo] = output;
    let plane = ho * wo;
    let cin_g = config.channels_in / config.groups;
    let cout_g = cout / config.groups;
    let rows = cin_g * config.kernel[0] * config.kernel[1];
    let mut y = vec![0f32; batch * cout * plane];
    let mut col = vec![0f32; rows * plane];

    for n in 0..batch {
        for group in 0..config.groups {
            im2col(config, x, input, [ho, wo], n, group, &mut col);
            workspace.store(&col)?;
            let unrolled = workspace.load()?;
            for oc in 0..cout_g {
                let out_channel = group * cout_g + oc;
                let w_row = &weight[out_channel * rows..(out_channel + 1) * rows];
                let shift = bias.map_or(0.0, |bias| bias[out_channel]);
                let out = &mut y[(n * cout + out_channel) * plane..][..plane];
                for (p, value) in out.iter_mut().enumerate() {
                    let mut acc = shift;
                    for (r, &wv) in w_row.iter().enumerate() {
                        acc += wv * unrolled[r * plane + p];
                    }
                    *value = acc;
                }
            }
        }
    }
    Ok(y)
}

pub(crate) fn max_pool2d(
    config: &PoolingConfig,
    input: [usize; 4],
    x: &[f32],
) -> BridgeResult<Vec<f32>> {
    let [batch, channels, h, w] = input;
    let [_, _, ho, wo] = config.output_shape(&input)?;
    if h * w == 0 {
        return Ok(vec![f32::NEG_INFINITY; batch * channels * ho * wo]);
    }
    let [sy, sx] = config.stride;
    let [py, px] = config.pad;
    let mut y = Vec::with_capacity(batch * channels * ho * wo);
    for plane in x.chunks_exact(h * w).take(batch * channels) {
        for oy in 0..ho {
            for ox in 0..wo {
                let mut best = f32::NEG_INFINITY;
                for ki in 0..config.kernel[0] {
                    let Some(iy) = source_index(oy, ki, sy, 1, py, h) else {
                        continue;
                    };
                    for kj in 0..config.kernel[1] {
                        if let Some(ix) = source_index(ox, kj, sx, 1, px, w) {
                            best = best.max(plane[iy * w + ix]);
                        }
                    }
                }
                y.push(best);
            }
        }
    }
    Ok(y)
}

pub(crate) fn global_avg_pool2d(input: [usize; 4], x: &[f32]) -> Vec<f32> {
    let [_, _, h, w] = input;
    let area = (h * w).max(1);
    x.chunks_exact(area)
        .map(|plane| plane.iter().sum::<f32>() / area as f32)
        .collect()
}

/// `y[b, o] = sum_i x[b, i] * w[o, i] + bias[o]`.
pub(crate) fn inner_product(
    batch: usize,
    inputs: usize,
    outputs: usize,
    x: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let mut y = Vec::with_capacity(batch * outputs);
    for b in 0..batch {
        let row = &x[b * inputs..(b + 1) * inputs];
        for o in 0..outputs {
            let w_row = &weight[o * inputs..(o + 1) * inputs];
            let dot: f32 = row.iter().zip(w_row).map(|(a, b)| a * b).sum();
            y.push(dot + bias.map_or(0.0, |bias| bias[o]));
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_round_trips_exact_values() {
        let values = [0.5f32, -3.5, 1024.0];
        for dtype in [DType::F16, DType::BF16, DType::F64, DType::F32] {
            assert_eq!(decode(&encode(&values, dtype), dtype), values);
        }
    }

    #[test]
    fn relu_clamps_negatives() {
        let mut values = [-1.0f32, 0.0, 2.5];
        activate(&mut values, Activation::Relu);
        assert_eq!(values, [0.0, 0.0, 2.5]);
    }

    #[test]
    fn max_pool_picks_window_maxima() {
        let config = PoolingConfig {
            kernel: [2, 2],
            pad: [0, 0],
            stride: [2, 2],
        };
        let x: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let y = max_pool2d(&config, [1, 1, 4, 4], &x).unwrap();
        assert_eq!(y, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn padded_taps_outside_the_input_read_nothing() {
        assert_eq!(source_index(0, 0, 1, 1, 1, 4), None);
        assert_eq!(source_index(0, 1, 1, 1, 1, 4), Some(0));
        assert_eq!(source_index(3, 1, 1, 1, 0, 4), None);
        assert_eq!(source_index(1, 0, usize::MAX / 2, 1, usize::MAX / 2, 4), Some(0));
        assert_eq!(im2col_bytes(&conv_config(usize::MAX), [usize::MAX, 2]), usize::MAX);
    }

    fn conv_config(kernel: usize) -> Conv2dConfig {
        Conv2dConfig {
            channels_in: 1,
            channels_out: 1,
            kernel: [kernel, 1],
            pad: [0, 0],
            stride: [1, 1],
            dilation: [1, 1],
            groups: 1,
        }
    }

    #[test]
    fn max_pool_with_huge_stride_reads_the_first_window() {
        let config = PoolingConfig {
            kernel: [2, 2],
            pad: [0, 0],
            stride: [usize::MAX, usize::MAX],
        };
        let x: Vec<f32> = (0..16).map(|v| v as f32).collect();
        assert_eq!(max_pool2d(&config, [1, 1, 4, 4], &x).unwrap(), vec![5.0]);
    }

    #[test]
    fn inner_product_adds_bias() {
        let y = inner_product(1, 2, 2, &[1.0, 2.0], &[1.0, 0.0, 0.0, 1.0], Some(&[0.5, -0.5]));
        assert_eq!(y, vec![1.5, 1.5]);
    }
}
