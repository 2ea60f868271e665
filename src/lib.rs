//! This package provides grouped convolution and transposed convolution (deconvolution)
//! projections, the building block of convolutional layers.
//! A projection derives its output shapes, keeps backend descriptors in sync with them,
//! selects an algorithm per primitive once per batch size and shares scratch memory
//! through a per-context workspace pool.
//!
//! Activations are passed as [`Argument`]s: one row per sample, each row a flattened
//! NCHW feature map. Weights are ndarrays of shape
//! (filters, channels per group, kernel height, kernel width).
//!
//! The compute primitives sit behind the [`ConvBackend`] trait. [`CpuBackend`] is a
//! reference implementation with a direct and an im2col algorithm.
//!
//! Example:
//! ```
//! use conv_projection::*;
//! use ndarray::Array2;
//!
//! let config = ConvConfig::new(4, 8, (3, 3)).padding(1, 1);
//! let params = ConvParams::from_config(&config)?;
//! let mut projection: ConvProjection<CpuBackend> =
//!     ConvProjection::new("conv1", &config, Weight::for_params(&params, true))?;
//! let mut ctx = ExecutionContext::new(CpuBackend::new());
//!
//! // Two samples of 4 channels, 8x8 pixels each.
//! let input = Argument::new(Array2::ones((2, 4 * 8 * 8))).with_frame(8, 8);
//! let mut output = Argument::new(Array2::zeros((0, 0)));
//! projection.forward(&mut ctx, &input, &mut output)?;
//!
//! assert_eq!(output.value.dim(), (2, 8 * 8 * 8));
//! assert_eq!(output.frame(), Extent::new(8, 8));
//! # Ok::<(), ConvError>(())
//! ```

mod algorithm;
mod argument;
pub mod backend;
mod config;
mod descriptor;
mod error;
mod projection;
mod shape;
mod weight;
mod workspace;

pub use algorithm::{AlgoPerf, AlgorithmCache, WorkspacePolicy};
pub use argument::Argument;
pub use backend::{
    BackendStats, ConvBackend, ConvGeometry, CpuAlgo, CpuBackend, CpuWorkspace, FilterLayout,
    TensorLayout, WorkspaceBuffer,
};
pub use config::{ConvConfig, ConvParams};
pub use descriptor::{DescriptorManager, Descriptors};
pub use error::{ConvError, ConvOp, Result};
pub use projection::ConvProjection;
pub use shape::{image_size, output_size, ConvMode, Extent, GroupOffsets, ShapeState};
pub use weight::{UpdateCallback, Weight};
pub use workspace::{ExecutionContext, WorkspacePool};

/// Element type of activations and weights.
pub type Real = f32;
