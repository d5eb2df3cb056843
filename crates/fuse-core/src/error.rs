use crate::dtype::DType;

/// Errors raised by the tensor engine and the fused operators built on it.
#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    /// A caller passed inputs an operator cannot accept. `op` is the operator
    /// tag (e.g. `rms_norm`) and is rendered in brackets ahead of the message.
    #[error("[{op}] {msg}")]
    InvalidArgument { op: String, msg: String },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("DType mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("Unsupported dtype {0} for this operation")]
    UnsupportedDType(DType),

    #[error("Cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("Cannot reshape {numel} elements into shape {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("Axis {axis} out of range for tensor with {ndim} dimensions")]
    InvalidAxis { axis: isize, ndim: usize },

    #[error("Matmul dimension mismatch: [{m}x{k1}] @ [{k2}x{n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Autograd error: {0}")]
    Autograd(String),

    #[error("Kernel error: {0}")]
    Kernel(String),
}

impl FuseError {
    /// Build an invalid-argument error for operator `op`.
    pub fn invalid(op: impl Into<String>, msg: impl Into<String>) -> Self {
        FuseError::InvalidArgument {
            op: op.into(),
            msg: msg.into(),
        }
    }

    /// Whether this is an invalid-argument error raised by operator validation.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, FuseError::InvalidArgument { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = FuseError::invalid(
            "rms_norm",
            "weight must have 1 dimension but has 2 dimensions.",
        );
        assert_eq!(
            err.to_string(),
            "[rms_norm] weight must have 1 dimension but has 2 dimensions."
        );
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_engine_errors_are_not_invalid_argument() {
        let err = FuseError::InvalidAxis { axis: 3, ndim: 2 };
        assert!(!err.is_invalid_argument());
        assert!(err.to_string().contains("out of range"));
    }
}
