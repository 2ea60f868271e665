//! Per-instance algorithm selection and workspace sizing.

use crate::backend::ConvBackend;
use crate::descriptor::Descriptors;
use crate::error::Result;

/// Best algorithm found for one primitive, with the scratch memory it needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlgoPerf<A> {
    pub algo: A,
    pub workspace_bytes: usize,
    /// Backend estimate or measurement, only used to rank candidates.
    pub time: f32,
}

/// How the three per-primitive workspace sizes are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspacePolicy {
    /// One buffer serves whichever primitive is running.
    Max,
    /// Room for all three at once, for callers that overlap the primitives.
    Sum,
}

impl WorkspacePolicy {
    pub fn combine(self, sizes: [usize; 3]) -> usize {
        match self {
            WorkspacePolicy::Max => sizes.iter().copied().max().unwrap_or(0),
            WorkspacePolicy::Sum => sizes.iter().sum(),
        }
    }
}

/// The algorithms chosen for the batch size the descriptors were last built for.
#[derive(Debug, Clone)]
pub struct AlgorithmCache<A> {
    batch_size: Option<usize>,
    forward: Option<AlgoPerf<A>>,
    backward_data: Option<AlgoPerf<A>>,
    backward_filter: Option<AlgoPerf<A>>,
    workspace_bytes: usize,
    policy: WorkspacePolicy,
}

impl<A: Copy + std::fmt::Debug> AlgorithmCache<A> {
    pub fn new(policy: WorkspacePolicy) -> Self {
        AlgorithmCache {
            batch_size: None,
            forward: None,
            backward_data: None,
            backward_filter: None,
            workspace_bytes: 0,
            policy,
        }
    }

    /// Queries the backend unless a selection for `batch_size` is cached.
    /// Returns whether a query ran.
    ///
    /// On error the cache stays invalid and the next call queries again.
    pub fn select<B>(
        &mut self,
        backend: &B,
        descriptors: &Descriptors<B>,
        batch_size: usize,
    ) -> Result<bool>
    where
        B: ConvBackend<Algo = A>,
    {
        if self.batch_size == Some(batch_size) {
            return Ok(false);
        }
        self.invalidate();

        let forward = backend.find_forward_algorithm(descriptors)?;
        let backward_data = backend.find_backward_data_algorithm(descriptors)?;
        let backward_filter = backend.find_backward_filter_algorithm(descriptors)?;
        let workspace_bytes = self.policy.combine([
            forward.workspace_bytes,
            backward_data.workspace_bytes,
            backward_filter.workspace_bytes,
        ]);

        tracing::debug!(
            batch_size,
            forward = ?forward.algo,
            backward_data = ?backward_data.algo,
            backward_filter = ?backward_filter.algo,
            forward_bytes = forward.workspace_bytes,
            backward_data_bytes = backward_data.workspace_bytes,
            backward_filter_bytes = backward_filter.workspace_bytes,
            workspace_bytes,
            "selected convolution algorithms"
        );

        self.forward = Some(forward);
        self.backward_data = Some(backward_data);
        self.backward_filter = Some(backward_filter);
        self.workspace_bytes = workspace_bytes;
        self.batch_size = Some(batch_size);
        Ok(true)
    }

    pub fn invalidate(&mut self) {
        self.batch_size = None;
        self.forward = None;
        self.backward_data = None;
        self.backward_filter = None;
        self.workspace_bytes = 0;
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn forward(&self) -> Option<&AlgoPerf<A>> {
        self.forward.as_ref()
    }

    pub fn backward_data(&self) -> Option<&AlgoPerf<A>> {
        self.backward_data.as_ref()
    }

    pub fn backward_filter(&self) -> Option<&AlgoPerf<A>> {
        self.backward_filter.as_ref()
    }

    /// Combined workspace requirement of the selected algorithms.
    pub fn workspace_bytes(&self) -> usize {
        self.workspace_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuAlgo, CpuBackend};
    use crate::config::{ConvConfig, ConvParams};
    use crate::descriptor::DescriptorManager;
    use crate::error::{ConvError, ConvOp};
    use crate::shape::Extent;

    fn descriptors(
        backend: &CpuBackend,
        batch: usize,
    ) -> DescriptorManager<CpuBackend> {
        let params = ConvParams::from_config(&ConvConfig::new(4, 8, (3, 3)).padding(1, 1)).unwrap();
        let shape = params.compute_shapes(Extent::new(8, 8), batch).unwrap();
        let mut manager = DescriptorManager::new();
        manager.ensure(backend, &shape, &params).unwrap();
        manager
    }

    #[test]
    fn combine_policies() {
        assert_eq!(WorkspacePolicy::Max.combine([3, 9, 4]), 9);
        assert_eq!(WorkspacePolicy::Sum.combine([3, 9, 4]), 16);
        assert_eq!(WorkspacePolicy::Max.combine([0, 0, 0]), 0);
    }

    #[test]
    fn reselects_only_on_batch_change() {
        let backend = CpuBackend::new();
        let mut cache = AlgorithmCache::new(WorkspacePolicy::Max);

        let two = descriptors(&backend, 2);
        assert!(cache.select(&backend, two.get().unwrap(), 2).unwrap());
        assert!(!cache.select(&backend, two.get().unwrap(), 2).unwrap());
        assert_eq!(backend.stats().algorithm_queries, [1, 1, 1]);

        let three = descriptors(&backend, 3);
        assert!(cache.select(&backend, three.get().unwrap(), 3).unwrap());
        assert_eq!(backend.stats().algorithm_queries, [2, 2, 2]);
        assert_eq!(cache.batch_size(), Some(3));
    }

    #[test]
    fn workspace_is_the_largest_requirement() {
        let backend = CpuBackend::new();
        let manager = descriptors(&backend, 2);
        let mut cache = AlgorithmCache::new(WorkspacePolicy::Max);
        cache.select(&backend, manager.get().unwrap(), 2).unwrap();

        let sizes = [
            cache.forward().unwrap().workspace_bytes,
            cache.backward_data().unwrap().workspace_bytes,
            cache.backward_filter().unwrap().workspace_bytes,
        ];
        assert_eq!(cache.workspace_bytes(), *sizes.iter().max().unwrap());
        assert_eq!(cache.forward().unwrap().algo, CpuAlgo::Im2col);
    }

    #[test]
    fn workspace_limit_forces_direct() {
        let backend = CpuBackend::new().with_workspace_limit(0);
        let manager = descriptors(&backend, 2);
        let mut cache = AlgorithmCache::new(WorkspacePolicy::Max);
        cache.select(&backend, manager.get().unwrap(), 2).unwrap();
        assert_eq!(cache.forward().unwrap().algo, CpuAlgo::Direct);
        assert_eq!(cache.workspace_bytes(), 0);
    }

    #[test]
    fn no_feasible_algorithm() {
        let backend = CpuBackend::new()
            .with_algorithms(&[CpuAlgo::Im2col])
            .with_workspace_limit(16);
        let manager = descriptors(&backend, 2);
        let mut cache = AlgorithmCache::new(WorkspacePolicy::Max);
        let err = cache.select(&backend, manager.get().unwrap(), 2).unwrap_err();
        assert!(matches!(
            err,
            ConvError::AlgorithmUnavailable {
                op: ConvOp::Forward
            }
        ));
        assert_eq!(cache.batch_size(), None);
    }
}
