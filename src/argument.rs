//! Activations exchanged with the layer graph.

use ndarray::Array2;

use crate::shape::Extent;
use crate::Real;

/// One batch of feature maps: a row per sample, each row a flattened CHW map.
///
/// A zero frame side means the producer did not record the spatial shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub value: Array2<Real>,
    pub grad: Option<Array2<Real>>,
    pub frame_height: usize,
    pub frame_width: usize,
}

impl Argument {
    pub fn new(value: Array2<Real>) -> Self {
        Argument {
            value,
            grad: None,
            frame_height: 0,
            frame_width: 0,
        }
    }

    pub fn with_frame(mut self, height: usize, width: usize) -> Self {
        self.frame_height = height;
        self.frame_width = width;
        self
    }

    /// Attaches a zero gradient of the value's shape.
    pub fn with_grad(mut self) -> Self {
        self.grad = Some(Array2::zeros(self.value.raw_dim()));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.value.nrows()
    }

    pub fn frame(&self) -> Extent {
        Extent::new(self.frame_height, self.frame_width)
    }

    pub(crate) fn set_frame(&mut self, frame: Extent) {
        self.frame_height = frame.height;
        self.frame_width = frame.width;
    }

    /// Keeps the value if it already is `rows x cols`, else replaces it by zeros.
    pub(crate) fn resize_or_create(&mut self, rows: usize, cols: usize) {
        if self.value.dim() != (rows, cols) {
            self.value = Array2::zeros((rows, cols));
        }
    }
}
