//! Enumerates the scalar element types the bridge can move between host and device.

use serde::{Deserialize, Serialize};

/// Element type shared by framework descriptors and primitive-side views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    #[default]
    F32,
    /// 16-bit floating point (fp16).
    F16,
    /// 16-bit bfloat16.
    BF16,
    /// 64-bit floating point.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer, the framework's default index type.
    I64,
    /// Unsigned byte; also used for raw workspace views.
    U8,
    /// One byte per element, zero or one.
    Bool,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::U8 | DType::Bool => 1,
        }
    }

    /// Returns `true` for floating-point representations.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16 | DType::F64)
    }

    /// Produces a stable tag used when crossing the dispatcher boundary.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::BF16 => 2,
            DType::F64 => 3,
            DType::I32 => 4,
            DType::I64 => 5,
            DType::U8 => 6,
            DType::Bool => 7,
        }
    }

    /// Reconstructs a `DType` from its tag representation.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::BF16),
            3 => Some(DType::F64),
            4 => Some(DType::I32),
            5 => Some(DType::I64),
            6 => Some(DType::U8),
            7 => Some(DType::Bool),
            _ => None,
        }
    }

    /// Encodes `value` as one element of this dtype in native byte order.
    ///
    /// Integer types truncate toward zero and saturate at their bounds; `Bool` maps any
    /// non-zero value to one.
    pub fn encode_scalar(self, value: f64) -> Vec<u8> {
        match self {
            DType::F32 => (value as f32).to_ne_bytes().to_vec(),
            DType::F16 => half::f16::from_f64(value).to_ne_bytes().to_vec(),
            DType::BF16 => half::bf16::from_f64(value).to_ne_bytes().to_vec(),
            DType::F64 => value.to_ne_bytes().to_vec(),
            DType::I32 => (value as i32).to_ne_bytes().to_vec(),
            DType::I64 => (value as i64).to_ne_bytes().to_vec(),
            DType::U8 => vec![value as u8],
            DType::Bool => vec![u8::from(value != 0.0)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for dtype in [
            DType::F32,
            DType::F16,
            DType::BF16,
            DType::F64,
            DType::I32,
            DType::I64,
            DType::U8,
            DType::Bool,
        ] {
            assert_eq!(DType::from_tag(dtype.tag()), Some(dtype));
            assert_eq!(dtype.encode_scalar(1.0).len(), dtype.size_in_bytes());
        }
        assert_eq!(DType::from_tag(42), None);
    }

    #[test]
    fn encode_scalar_matches_native_layout() {
        assert_eq!(DType::F32.encode_scalar(-3.5), (-3.5f32).to_ne_bytes().to_vec());
        assert_eq!(
            DType::F16.encode_scalar(1.0),
            half::f16::ONE.to_ne_bytes().to_vec()
        );
        assert_eq!(DType::I32.encode_scalar(7.9), 7i32.to_ne_bytes().to_vec());
        assert_eq!(DType::Bool.encode_scalar(-2.0), vec![1]);
    }
}
