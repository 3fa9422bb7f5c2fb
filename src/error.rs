//! Error types for the convolution dispatch engine
//!
//! Build-time failures (`PreconditionViolation`, `UnsupportedPrecision`,
//! `KernelConstruction`) make the operator instance unusable and are surfaced
//! to the surrounding runtime as model-load errors. `Execution` failures are
//! fatal to the current inference call only; the operator's kernel handle and
//! packed weight stay valid and a later call may be attempted by the caller.

use thiserror::Error;

use crate::backend::BackendStatus;
use crate::tensor::DType;

/// Error type for all despachar operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DespacharError {
    /// Tensor shape is invalid for the requested operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Why the shape was rejected
        reason: String,
    },

    /// Tensor data does not match the declared shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual number of elements supplied
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Element count implied by the shape
        expected: usize,
    },

    /// Tensor element type differs from what the operation requires
    #[error("Dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch {
        /// Required element type
        expected: DType,
        /// Element type actually present
        actual: DType,
    },

    /// A build-time contract inherited from the partitioning layer was broken
    ///
    /// Only nodes whose weight and quantization parameters are constant
    /// initializers may reach this engine; seeing anything else here is a
    /// caller defect, never retried.
    #[error("Precondition violated for input '{input}': {reason}")]
    PreconditionViolation {
        /// Which node input broke the contract
        input: String,
        /// What the contract required
        reason: String,
    },

    /// Input dtype does not map to any supported numeric path
    #[error("Unsupported precision: no kernel path for input dtype {dtype}")]
    UnsupportedPrecision {
        /// The unclassifiable input dtype
        dtype: DType,
    },

    /// The backend rejected the requested kernel configuration
    #[error("Kernel construction failed: backend returned {status}")]
    KernelConstruction {
        /// Status code reported by the backend
        status: BackendStatus,
    },

    /// Setup or run failed at inference time
    #[error("Execution failed during {stage}: backend returned {status}")]
    Execution {
        /// Which step failed: "setup" (buffer binding) or "run"
        stage: &'static str,
        /// Status code reported by the backend
        status: BackendStatus,
    },

    /// A required buffer could not be allocated
    #[error("Allocation of {bytes} bytes failed")]
    AllocationFailed {
        /// Requested allocation size
        bytes: usize,
    },
}

/// Result type alias for despachar operations
pub type Result<T> = std::result::Result<T, DespacharError>;
