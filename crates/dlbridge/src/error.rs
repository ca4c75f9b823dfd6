//! Error taxonomy shared by every bridged operation.

use thiserror::Error;

use crate::device::Device;

/// Coarse classification of a [`BridgeError`].
///
/// The framework dispatcher only needs to know which bucket a failure falls in; the variant
/// detail is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A parameter combination has no implementation (transposed convolution, ceil-mode
    /// pooling, unsupported copy directions, ...).
    UnsupportedConfiguration,
    /// Rank or extent mismatches caught before any device work is issued.
    InvalidShape,
    /// The device could not satisfy an allocation.
    ResourceExhaustion,
    /// Bad device handles, storage of the wrong origin, non-contiguous operands, or arguments
    /// that do not decode into the expected positional signature.
    InvalidArgument,
    /// The runtime or primitives library reported a failure while doing the work.
    Execution,
}

/// Error surfaced to the framework dispatcher by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{op} is not implemented: {reason}")]
    Unsupported { op: &'static str, reason: String },
    #[error("invalid shape for {op}: {detail}")]
    InvalidShape { op: &'static str, detail: String },
    #[error("out of device memory on {device}: requested {requested} bytes, {available} available")]
    ResourceExhausted {
        device: Device,
        requested: usize,
        available: usize,
    },
    #[error("{op} expects accelerator storage: {detail}")]
    StorageOrigin { op: &'static str, detail: String },
    #[error("{op} requires a contiguous tensor")]
    NonContiguous { op: &'static str },
    #[error("invalid device {device}: {count} accelerator device(s) visible")]
    InvalidDevice { device: Device, count: usize },
    #[error("invalid argument for {op}: {detail}")]
    InvalidArgument { op: &'static str, detail: String },
    #[error("operation {op} is not registered for this dispatch key")]
    NotRegistered { op: String },
    #[error("device execution failure: {message}")]
    Execution { message: String },
}

impl BridgeError {
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn invalid_shape(op: &'static str, detail: impl Into<String>) -> Self {
        BridgeError::InvalidShape {
            op,
            detail: detail.into(),
        }
    }

    pub fn invalid_argument(op: &'static str, detail: impl Into<String>) -> Self {
        BridgeError::InvalidArgument {
            op,
            detail: detail.into(),
        }
    }

    pub fn storage_origin(op: &'static str, detail: impl Into<String>) -> Self {
        BridgeError::StorageOrigin {
            op,
            detail: detail.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BridgeError::Execution {
            message: message.into(),
        }
    }

    /// Maps the error onto the bridge's failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Unsupported { .. } => ErrorKind::UnsupportedConfiguration,
            BridgeError::InvalidShape { .. } => ErrorKind::InvalidShape,
            BridgeError::ResourceExhausted { .. } => ErrorKind::ResourceExhaustion,
            BridgeError::StorageOrigin { .. }
            | BridgeError::NonContiguous { .. }
            | BridgeError::InvalidDevice { .. }
            | BridgeError::InvalidArgument { .. }
            | BridgeError::NotRegistered { .. } => ErrorKind::InvalidArgument,
            BridgeError::Execution { .. } => ErrorKind::Execution,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind() == ErrorKind::UnsupportedConfiguration
    }
}

/// Convenience alias for results returned by bridge routines.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Maps a poisoned lock into an execution error naming the guarded state.
pub(crate) fn poisoned(what: &str) -> BridgeError {
    BridgeError::execution(format!("{what} mutex poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            BridgeError::unsupported("relu_", "x").kind(),
            ErrorKind::UnsupportedConfiguration
        );
        assert_eq!(
            BridgeError::invalid_shape("linear", "x").kind(),
            ErrorKind::InvalidShape
        );
        let oom = BridgeError::ResourceExhausted {
            device: Device::accelerator(0),
            requested: 64,
            available: 0,
        };
        assert_eq!(oom.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(
            BridgeError::NonContiguous { op: "fill_" }.kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn display_names_the_operation() {
        let err = BridgeError::unsupported("convolution_overrideable", "transposed convolution");
        assert_eq!(
            err.to_string(),
            "convolution_overrideable is not implemented: transposed convolution"
        );
    }
}
