use std::vec::IntoIter;

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{BridgeError, BridgeResult};
use crate::framework::{Scalar, Tensor};

/// One positional argument or return value crossing the dispatcher boundary.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    OptionalTensor(Option<Tensor>),
    IntList(Vec<i64>),
    Int(i64),
    OptionalInt(Option<i64>),
    Bool(bool),
    Double(f64),
    Scalar(Scalar),
    DType(DType),
    Device(Device),
    None,
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "Tensor",
            Value::OptionalTensor(_) => "Tensor?",
            Value::IntList(_) => "int[]",
            Value::Int(_) => "int",
            Value::OptionalInt(_) => "int?",
            Value::Bool(_) => "bool",
            Value::Double(_) => "float",
            Value::Scalar(_) => "Scalar",
            Value::DType(_) => "ScalarType",
            Value::Device(_) => "Device",
            Value::None => "None",
        }
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            Value::Tensor(tensor) | Value::OptionalTensor(Some(tensor)) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) | Value::OptionalTensor(Some(tensor)) => Some(tensor),
            _ => None,
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl From<Option<Tensor>> for Value {
    fn from(tensor: Option<Tensor>) -> Self {
        Value::OptionalTensor(tensor)
    }
}

impl From<Vec<i64>> for Value {
    fn from(values: Vec<i64>) -> Self {
        Value::IntList(values)
    }
}

impl From<&[i64]> for Value {
    fn from(values: &[i64]) -> Self {
        Value::IntList(values.to_vec())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<DType> for Value {
    fn from(value: DType) -> Self {
        Value::DType(value)
    }
}

impl From<Device> for Value {
    fn from(value: Device) -> Self {
        Value::Device(value)
    }
}

/// Positional decoder over a kernel's arguments. Missing trailing arguments decode as `None`
/// for optional parameters.
pub(crate) struct Args {
    op: &'static str,
    position: usize,
    values: IntoIter<Value>,
}

impl Args {
    pub(crate) fn new(op: &'static str, values: Vec<Value>) -> Self {
        Self {
            op,
            position: 0,
            values: values.into_iter(),
        }
    }

    fn next(&mut self) -> Option<Value> {
        self.position += 1;
        self.values.next()
    }

    fn mismatch(&self, expected: &str, found: Option<&Value>) -> BridgeError {
        BridgeError::invalid_argument(
            self.op,
            format!(
                "argument {} expects {expected}, found {}",
                self.position,
                found.map_or("nothing", Value::kind)
            ),
        )
    }

    pub(crate) fn tensor(&mut self) -> BridgeResult<Tensor> {
        match self.next() {
            Some(Value::Tensor(tensor)) | Some(Value::OptionalTensor(Some(tensor))) => Ok(tensor),
            other => Err(self.mismatch("Tensor", other.as_ref())),
        }
    }

    pub(crate) fn optional_tensor(&mut self) -> BridgeResult<Option<Tensor>> {
        match self.next() {
            Some(Value::Tensor(tensor)) => Ok(Some(tensor)),
            Some(Value::OptionalTensor(tensor)) => Ok(tensor),
            Some(Value::None) | None => Ok(None),
            other => Err(self.mismatch("Tensor?", other.as_ref())),
        }
    }

    pub(crate) fn int_list(&mut self) -> BridgeResult<Vec<i64>> {
        match self.next() {
            Some(Value::IntList(values)) => Ok(values),
            other => Err(self.mismatch("int[]", other.as_ref())),
        }
    }

    pub(crate) fn int(&mut self) -> BridgeResult<i64> {
        match self.next() {
            Some(Value::Int(value)) | Some(Value::OptionalInt(Some(value))) => Ok(value),
            other => Err(self.mismatch("int", other.as_ref())),
        }
    }

    pub(crate) fn optional_int(&mut self) -> BridgeResult<Option<i64>> {
        match self.next() {
            Some(Value::Int(value)) => Ok(Some(value)),
            Some(Value::OptionalInt(value)) => Ok(value),
            Some(Value::None) | None => Ok(None),
            other => Err(self.mismatch("int?", other.as_ref())),
        }
    }

    pub(crate) fn bool(&mut self) -> BridgeResult<bool> {
        match self.next() {
            Some(Value::Bool(value)) => Ok(value),
            other => Err(self.mismatch("bool", other.as_ref())),
        }
    }

    pub(crate) fn scalar(&mut self) -> BridgeResult<Scalar> {
        match self.next() {
            Some(Value::Scalar(value)) => Ok(value),
            Some(Value::Double(value)) => Ok(Scalar::Float(value)),
            Some(Value::Int(value)) => Ok(Scalar::Int(value)),
            Some(Value::Bool(value)) => Ok(Scalar::Bool(value)),
            other => Err(self.mismatch("Scalar", other.as_ref())),
        }
    }

    pub(crate) fn optional_dtype(&mut self) -> BridgeResult<Option<DType>> {
        match self.next() {
            Some(Value::DType(dtype)) => Ok(Some(dtype)),
            Some(Value::None) | None => Ok(None),
            other => Err(self.mismatch("ScalarType?", other.as_ref())),
        }
    }

    pub(crate) fn optional_device(&mut self) -> BridgeResult<Option<Device>> {
        match self.next() {
            Some(Value::Device(device)) => Ok(Some(device)),
            Some(Value::None) | None => Ok(None),
            other => Err(self.mismatch("Device?", other.as_ref())),
        }
    }

    /// Skips an argument the bridge does not interpret (layout, pin_memory, memory_format).
    pub(crate) fn ignored(&mut self) {
        self.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_arguments_default_when_missing() {
        let mut args = Args::new("empty", vec![Value::IntList(vec![2]), Value::None]);
        assert_eq!(args.int_list().unwrap(), vec![2]);
        assert_eq!(args.optional_dtype().unwrap(), None);
        assert_eq!(args.optional_device().unwrap(), None);
    }

    #[test]
    fn mismatch_names_position_and_kinds() {
        let mut args = Args::new("relu_", vec![Value::Int(3)]);
        let err = args.tensor().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument for relu_: argument 1 expects Tensor, found int"
        );
    }

    #[test]
    fn scalars_accept_plain_numbers() {
        let mut args = Args::new("fill_", vec![Value::Double(2.5), Value::Int(4)]);
        assert_eq!(args.scalar().unwrap(), Scalar::Float(2.5));
        assert_eq!(args.scalar().unwrap(), Scalar::Int(4));
    }
}
