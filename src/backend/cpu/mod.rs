//! Host-memory reference backend.
//!
//! Offers two algorithms, counts descriptor and algorithm traffic, and can be
//! limited in workspace, allocation size and tensor size so that every failure
//! path of a projection can be driven on a machine without an accelerator.

use std::cell::Cell;
use std::cmp::Ordering;
use std::mem;
use std::rc::Rc;

use crate::algorithm::AlgoPerf;
use crate::backend::{ConvBackend, ConvGeometry, FilterLayout, TensorLayout, WorkspaceBuffer};
use crate::descriptor::Descriptors;
use crate::error::{ConvError, ConvOp, Result};
use crate::Real;

mod kernels;

use kernels::Problem;

/// Cost of one multiply-accumulate inside the matrix product, relative to the
/// direct loops.
const GEMM_MAC_COST: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuAlgo {
    /// Nested loops. Needs no workspace.
    Direct,
    /// Unfold into a column matrix, then a matrix product. Needs one sample's
    /// column matrix as workspace.
    Im2col,
}

#[derive(Debug, Default)]
struct Counters {
    descriptors_created: Cell<usize>,
    live_descriptors: Cell<usize>,
    algorithm_queries: [Cell<usize>; 3],
    workspace_allocations: Cell<usize>,
}

impl Counters {
    fn bump(cell: &Cell<usize>) {
        cell.set(cell.get() + 1);
    }
}

/// Snapshot of the backend counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub descriptors_created: usize,
    pub live_descriptors: usize,
    /// Forward, backward-data and backward-filter queries, in that order.
    pub algorithm_queries: [usize; 3],
    pub workspace_allocations: usize,
}

/// Registration of one live descriptor; released on drop.
#[derive(Debug)]
struct Handle(Rc<Counters>);

impl Handle {
    fn register(counters: &Rc<Counters>) -> Self {
        Counters::bump(&counters.descriptors_created);
        Counters::bump(&counters.live_descriptors);
        Handle(Rc::clone(counters))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let live = &self.0.live_descriptors;
        live.set(live.get() - 1);
    }
}

#[derive(Debug)]
pub struct CpuTensorDescriptor {
    layout: TensorLayout,
    _handle: Handle,
}

#[derive(Debug)]
pub struct CpuFilterDescriptor {
    layout: FilterLayout,
    _handle: Handle,
}

#[derive(Debug)]
pub struct CpuConvDescriptor {
    geometry: ConvGeometry,
    _handle: Handle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuWorkspace {
    data: Vec<Real>,
}

impl WorkspaceBuffer for CpuWorkspace {
    fn len_bytes(&self) -> usize {
        self.data.len() * mem::size_of::<Real>()
    }
}

/// Reference implementation of [`ConvBackend`] on host memory.
///
/// Not `Send`: one backend (and its [`ExecutionContext`](crate::ExecutionContext))
/// belongs to one thread.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    counters: Rc<Counters>,
    algorithms: Vec<CpuAlgo>,
    workspace_limit: usize,
    allocation_limit: usize,
    max_tensor_elements: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        CpuBackend {
            counters: Rc::new(Counters::default()),
            algorithms: vec![CpuAlgo::Direct, CpuAlgo::Im2col],
            workspace_limit: usize::MAX,
            allocation_limit: usize::MAX,
            max_tensor_elements: i32::MAX as usize,
        }
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the candidates of the algorithm search.
    pub fn with_algorithms(mut self, algorithms: &[CpuAlgo]) -> Self {
        self.algorithms = algorithms.to_vec();
        self
    }

    /// Algorithms needing more scratch memory than `bytes` are not considered.
    pub fn with_workspace_limit(mut self, bytes: usize) -> Self {
        self.workspace_limit = bytes;
        self
    }

    /// Workspace allocations above `bytes` fail with [`ConvError::OutOfMemory`].
    pub fn with_allocation_limit(mut self, bytes: usize) -> Self {
        self.allocation_limit = bytes;
        self
    }

    /// Tensor descriptors addressing more elements are rejected as unrepresentable.
    pub fn with_max_tensor_elements(mut self, elements: usize) -> Self {
        self.max_tensor_elements = elements;
        self
    }

    pub fn stats(&self) -> BackendStats {
        let c = &self.counters;
        BackendStats {
            descriptors_created: c.descriptors_created.get(),
            live_descriptors: c.live_descriptors.get(),
            algorithm_queries: [
                c.algorithm_queries[0].get(),
                c.algorithm_queries[1].get(),
                c.algorithm_queries[2].get(),
            ],
            workspace_allocations: c.workspace_allocations.get(),
        }
    }

    fn problem(descriptors: &Descriptors<Self>) -> Problem {
        Problem {
            x: descriptors.image().layout,
            y: descriptors.output().layout,
            w: descriptors.filter().layout,
            geometry: descriptors.convolution().geometry,
        }
    }

    fn find(&self, op: ConvOp, descriptors: &Descriptors<Self>) -> Result<AlgoPerf<CpuAlgo>> {
        let index = match op {
            ConvOp::Forward => 0,
            ConvOp::BackwardData => 1,
            ConvOp::BackwardFilter => 2,
        };
        Counters::bump(&self.counters.algorithm_queries[index]);

        let p = Self::problem(descriptors);
        let (rows, cols) = p.col_shape();
        let macs = p.macs() as f32;
        self.algorithms
            .iter()
            .map(|&algo| match algo {
                CpuAlgo::Direct => AlgoPerf {
                    algo,
                    workspace_bytes: 0,
                    time: macs,
                },
                CpuAlgo::Im2col => AlgoPerf {
                    algo,
                    workspace_bytes: rows * cols * mem::size_of::<Real>(),
                    time: (p.x.dims[0] * rows * cols) as f32 + macs * GEMM_MAC_COST,
                },
            })
            .filter(|perf| perf.workspace_bytes <= self.workspace_limit)
            .min_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(Ordering::Equal))
            .ok_or(ConvError::AlgorithmUnavailable { op })
    }

    /// Checks that the caller's slices cover what the descriptors address and
    /// returns the column scratch for `Im2col`.
    fn prepare<'w>(
        p: &Problem,
        lens: [(&str, usize, usize); 3],
        algo: CpuAlgo,
        workspace: Option<&'w mut CpuWorkspace>,
    ) -> Result<Option<&'w mut [Real]>> {
        if p.x.dims[1] != p.w.dims[1] || p.y.dims[1] != p.w.dims[0] || p.x.dims[0] != p.y.dims[0] {
            return Err(ConvError::shape(format!(
                "descriptors disagree: image {:?}, output {:?}, filter {:?}",
                p.x.dims, p.y.dims, p.w.dims
            )));
        }
        for &(name, len, needed) in lens.iter() {
            if len < needed {
                return Err(ConvError::shape(format!(
                    "{} holds {} elements, descriptor addresses {}",
                    name, len, needed
                )));
            }
        }
        match algo {
            CpuAlgo::Direct => Ok(None),
            CpuAlgo::Im2col => {
                let (rows, cols) = p.col_shape();
                let required = rows * cols * mem::size_of::<Real>();
                match workspace {
                    Some(ws) if ws.len_bytes() >= required => Ok(Some(&mut ws.data[..rows * cols])),
                    other => Err(ConvError::WorkspaceTooSmall {
                        required,
                        available: other.map_or(0, |ws| ws.len_bytes()),
                    }),
                }
            }
        }
    }
}

impl ConvBackend for CpuBackend {
    type TensorDescriptor = CpuTensorDescriptor;
    type FilterDescriptor = CpuFilterDescriptor;
    type ConvDescriptor = CpuConvDescriptor;
    type Algo = CpuAlgo;
    type Workspace = CpuWorkspace;

    fn create_tensor_descriptor(&self, layout: &TensorLayout) -> Result<CpuTensorDescriptor> {
        if layout.dims.iter().any(|&d| d == 0) {
            return Err(ConvError::shape(format!("tensor {:?} has an empty dimension", layout.dims)));
        }
        if layout.strides[3] != 1 || layout.strides[2] != layout.dims[3] {
            return Err(ConvError::shape(format!(
                "tensor rows must be packed, got strides {:?}",
                layout.strides
            )));
        }
        if layout.elements() > self.max_tensor_elements {
            return Err(ConvError::shape(format!(
                "tensor {:?} exceeds {} elements",
                layout.dims, self.max_tensor_elements
            )));
        }
        Ok(CpuTensorDescriptor {
            layout: *layout,
            _handle: Handle::register(&self.counters),
        })
    }

    fn create_filter_descriptor(&self, layout: &FilterLayout) -> Result<CpuFilterDescriptor> {
        if layout.dims.iter().any(|&d| d == 0) {
            return Err(ConvError::shape(format!("filter {:?} has an empty dimension", layout.dims)));
        }
        Ok(CpuFilterDescriptor {
            layout: *layout,
            _handle: Handle::register(&self.counters),
        })
    }

    fn create_convolution_descriptor(&self, geometry: &ConvGeometry) -> Result<CpuConvDescriptor> {
        if geometry.stride.0 == 0 || geometry.stride.1 == 0 {
            return Err(ConvError::shape("convolution stride must be positive"));
        }
        Ok(CpuConvDescriptor {
            geometry: *geometry,
            _handle: Handle::register(&self.counters),
        })
    }

    fn find_forward_algorithm(&self, descriptors: &Descriptors<Self>) -> Result<AlgoPerf<CpuAlgo>> {
        self.find(ConvOp::Forward, descriptors)
    }

    fn find_backward_data_algorithm(
        &self,
        descriptors: &Descriptors<Self>,
    ) -> Result<AlgoPerf<CpuAlgo>> {
        self.find(ConvOp::BackwardData, descriptors)
    }

    fn find_backward_filter_algorithm(
        &self,
        descriptors: &Descriptors<Self>,
    ) -> Result<AlgoPerf<CpuAlgo>> {
        self.find(ConvOp::BackwardFilter, descriptors)
    }

    fn alloc_workspace(&self, bytes: usize) -> Result<CpuWorkspace> {
        if bytes > self.allocation_limit {
            return Err(ConvError::OutOfMemory { requested: bytes });
        }
        Counters::bump(&self.counters.workspace_allocations);
        let elements = (bytes + mem::size_of::<Real>() - 1) / mem::size_of::<Real>();
        Ok(CpuWorkspace {
            data: vec![0.0; elements],
        })
    }

    fn convolution_forward(
        &self,
        descriptors: &Descriptors<Self>,
        x: &[Real],
        w: &[Real],
        y: &mut [Real],
        algo: CpuAlgo,
        workspace: Option<&mut CpuWorkspace>,
    ) -> Result<()> {
        let p = Self::problem(descriptors);
        let lens = [
            ("input", x.len(), p.x.span()),
            ("filter", w.len(), p.w.elements()),
            ("output", y.len(), p.y.span()),
        ];
        match Self::prepare(&p, lens, algo, workspace)? {
            None => {
                kernels::forward_direct(&p, x, w, y);
                Ok(())
            }
            Some(ws) => kernels::forward_im2col(&p, x, w, y, ws),
        }
    }

    fn convolution_backward_data(
        &self,
        descriptors: &Descriptors<Self>,
        w: &[Real],
        dy: &[Real],
        dx: &mut [Real],
        algo: CpuAlgo,
        workspace: Option<&mut CpuWorkspace>,
    ) -> Result<()> {
        let p = Self::problem(descriptors);
        let lens = [
            ("filter", w.len(), p.w.elements()),
            ("output gradient", dy.len(), p.y.span()),
            ("input gradient", dx.len(), p.x.span()),
        ];
        match Self::prepare(&p, lens, algo, workspace)? {
            None => {
                kernels::backward_data_direct(&p, w, dy, dx);
                Ok(())
            }
            Some(ws) => kernels::backward_data_im2col(&p, w, dy, dx, ws),
        }
    }

    fn convolution_backward_filter(
        &self,
        descriptors: &Descriptors<Self>,
        x: &[Real],
        dy: &[Real],
        dw: &mut [Real],
        algo: CpuAlgo,
        workspace: Option<&mut CpuWorkspace>,
    ) -> Result<()> {
        let p = Self::problem(descriptors);
        let lens = [
            ("input", x.len(), p.x.span()),
            ("output gradient", dy.len(), p.y.span()),
            ("filter gradient", dw.len(), p.w.elements()),
        ];
        match Self::prepare(&p, lens, algo, workspace)? {
            None => {
                kernels::backward_filter_direct(&p, x, dy, dw);
                Ok(())
            }
            Some(ws) => kernels::backward_filter_im2col(&p, x, dy, dw, ws),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_released_on_drop() {
        let backend = CpuBackend::new();
        let tensor = backend
            .create_tensor_descriptor(&TensorLayout::grouped(1, 2, 2, 3, 3))
            .unwrap();
        let filter = backend.create_filter_descriptor(&FilterLayout::new(1, 2, 3, 3)).unwrap();
        assert_eq!(backend.stats().live_descriptors, 2);
        drop(tensor);
        drop(filter);
        assert_eq!(backend.stats().live_descriptors, 0);
        assert_eq!(backend.stats().descriptors_created, 2);
    }

    #[test]
    fn rejects_unpacked_rows() {
        let backend = CpuBackend::new();
        let layout = TensorLayout {
            dims: [1, 1, 3, 3],
            strides: [18, 9, 6, 1],
        };
        assert!(matches!(
            backend.create_tensor_descriptor(&layout),
            Err(ConvError::Shape(_))
        ));
        assert_eq!(backend.stats().live_descriptors, 0);
    }

    #[test]
    fn workspace_rounds_up_to_whole_elements() {
        let backend = CpuBackend::new();
        assert_eq!(backend.alloc_workspace(5).unwrap().len_bytes(), 8);
        assert_eq!(backend.stats().workspace_allocations, 1);
    }

    #[test]
    fn allocation_limit_is_out_of_memory() {
        let backend = CpuBackend::new().with_allocation_limit(1024);
        assert!(matches!(
            backend.alloc_workspace(4096),
            Err(ConvError::OutOfMemory { requested: 4096 })
        ));
        assert_eq!(backend.stats().workspace_allocations, 0);
    }
}
