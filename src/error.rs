//! Error type shared by every stage of the projection engine.

use std::fmt;

use thiserror::Error;

/// The three primitive operations a convolution projection issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvOp {
    Forward,
    BackwardData,
    BackwardFilter,
}

impl fmt::Display for ConvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConvOp::Forward => "forward",
            ConvOp::BackwardData => "backward-data",
            ConvOp::BackwardFilter => "backward-filter",
        })
    }
}

/// Failures surfaced by the projection engine.
///
/// None of these are retried internally: without a change of shape or resources the
/// same call would fail again.
#[derive(Debug, Error)]
pub enum ConvError {
    /// Inconsistent or unrepresentable dimensions.
    #[error("shape error: {0}")]
    Shape(String),
    /// The backend has no feasible algorithm for the requested shape.
    #[error("no feasible {op} algorithm for the requested shape")]
    AlgorithmUnavailable { op: ConvOp },
    /// Workspace or descriptor allocation failed.
    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    /// A primitive was handed less scratch memory than its algorithm needs.
    #[error("workspace of {available} bytes is smaller than the {required} bytes required")]
    WorkspaceTooSmall { required: usize, available: usize },
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),
}

impl ConvError {
    pub(crate) fn shape<S: Into<String>>(msg: S) -> Self {
        ConvError::Shape(msg.into())
    }
}

impl From<ndarray::ShapeError> for ConvError {
    fn from(err: ndarray::ShapeError) -> Self {
        ConvError::Shape(err.to_string())
    }
}

pub type Result<T, E = ConvError> = std::result::Result<T, E>;
