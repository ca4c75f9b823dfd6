//! Minimal rendition of the tensor framework's side of the bridge: tensor descriptors, storage
//! handles and scalar arguments.

pub mod scalar;
pub mod storage;
pub mod tensor;

pub use scalar::Scalar;
pub use storage::{HostStorage, Storage};
pub use tensor::{element_count, packed_strides, Dims, Tensor};
