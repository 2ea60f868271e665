//! The primitive compute layer a projection runs on.
//!
//! A backend hands out opaque descriptors, searches for algorithms and executes the
//! three convolution primitives. Descriptor destruction is the `Drop` of the
//! associated handle types, so a descriptor can never outlive its owner or be
//! released twice.

use std::fmt::Debug;

use crate::algorithm::AlgoPerf;
use crate::descriptor::Descriptors;
use crate::error::Result;
use crate::Real;

pub mod cpu;

pub use cpu::{BackendStats, CpuAlgo, CpuBackend, CpuWorkspace};

/// NCHW layout of one group of a 4-d tensor.
///
/// `dims` describe the group (`C` is the channel count of one group) while `strides`
/// are those of the full tensor, so stepping to the next sample skips the channels
/// of the other groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    pub dims: [usize; 4],
    pub strides: [usize; 4],
}

impl TensorLayout {
    /// Layout of one of `total_channels / channels` groups of a packed NCHW tensor.
    pub fn grouped(
        batch: usize,
        channels: usize,
        total_channels: usize,
        height: usize,
        width: usize,
    ) -> Self {
        TensorLayout {
            dims: [batch, channels, height, width],
            strides: [total_channels * height * width, height * width, width, 1],
        }
    }

    #[inline]
    pub fn index(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        n * self.strides[0] + c * self.strides[1] + h * self.strides[2] + w * self.strides[3]
    }

    /// Number of elements between the first and one past the last addressed element.
    pub fn span(&self) -> usize {
        if self.dims.iter().any(|&d| d == 0) {
            return 0;
        }
        self.dims
            .iter()
            .zip(self.strides.iter())
            .map(|(d, s)| (d - 1) * s)
            .sum::<usize>()
            + 1
    }

    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// KCRS layout of one group of filters: output maps, input maps, rows, columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterLayout {
    pub dims: [usize; 4],
}

impl FilterLayout {
    pub fn new(filters: usize, channels: usize, height: usize, width: usize) -> Self {
        FilterLayout {
            dims: [filters, channels, height, width],
        }
    }

    #[inline]
    pub fn index(&self, k: usize, c: usize, r: usize, s: usize) -> usize {
        ((k * self.dims[1] + c) * self.dims[2] + r) * self.dims[3] + s
    }

    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Padding and stride of a 2-d cross-correlation, as (height, width) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub padding: (usize, usize),
    pub stride: (usize, usize),
}

/// Scratch memory handed to the primitives.
pub trait WorkspaceBuffer {
    fn len_bytes(&self) -> usize;
}

/// Capability set of a convolution primitive layer.
///
/// All three primitives accumulate into their destination
/// (`dst = result + dst`), so a projection can contribute to a sum of projections.
pub trait ConvBackend: Sized {
    type TensorDescriptor: Debug;
    type FilterDescriptor: Debug;
    type ConvDescriptor: Debug;
    type Algo: Copy + Debug + PartialEq;
    type Workspace: WorkspaceBuffer + Debug;

    fn create_tensor_descriptor(&self, layout: &TensorLayout) -> Result<Self::TensorDescriptor>;

    fn create_filter_descriptor(&self, layout: &FilterLayout) -> Result<Self::FilterDescriptor>;

    fn create_convolution_descriptor(
        &self,
        geometry: &ConvGeometry,
    ) -> Result<Self::ConvDescriptor>;

    /// Fastest feasible forward algorithm and its workspace requirement.
    fn find_forward_algorithm(&self, descriptors: &Descriptors<Self>)
        -> Result<AlgoPerf<Self::Algo>>;

    fn find_backward_data_algorithm(
        &self,
        descriptors: &Descriptors<Self>,
    ) -> Result<AlgoPerf<Self::Algo>>;

    fn find_backward_filter_algorithm(
        &self,
        descriptors: &Descriptors<Self>,
    ) -> Result<AlgoPerf<Self::Algo>>;

    fn alloc_workspace(&self, bytes: usize) -> Result<Self::Workspace>;

    /// `y += conv(x, w)`. `x` is laid out by the image descriptor, `y` by the output
    /// descriptor; both slices start at the group's first element.
    fn convolution_forward(
        &self,
        descriptors: &Descriptors<Self>,
        x: &[Real],
        w: &[Real],
        y: &mut [Real],
        algo: Self::Algo,
        workspace: Option<&mut Self::Workspace>,
    ) -> Result<()>;

    /// `dx += conv_transpose(dy, w)`.
    fn convolution_backward_data(
        &self,
        descriptors: &Descriptors<Self>,
        w: &[Real],
        dy: &[Real],
        dx: &mut [Real],
        algo: Self::Algo,
        workspace: Option<&mut Self::Workspace>,
    ) -> Result<()>;

    /// `dw += correlate(x, dy)`.
    fn convolution_backward_filter(
        &self,
        descriptors: &Descriptors<Self>,
        x: &[Real],
        dy: &[Real],
        dw: &mut [Real],
        algo: Self::Algo,
        workspace: Option<&mut Self::Workspace>,
    ) -> Result<()>;
}
