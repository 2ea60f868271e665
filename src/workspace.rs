//! Scratch memory shared by the projections of one execution context.
//!
//! The pool is owned by an [`ExecutionContext`] rather than being global state;
//! one context per thread gives buffer reuse without any locking.

use crate::backend::{ConvBackend, WorkspaceBuffer};
use crate::error::Result;

/// Buffers ordered by size, ascending. Buffers are never shrunk or released.
#[derive(Debug)]
pub struct WorkspacePool<W> {
    buffers: Vec<W>,
}

impl<W> Default for WorkspacePool<W> {
    fn default() -> Self {
        WorkspacePool {
            buffers: Vec::new(),
        }
    }
}

impl<W: WorkspaceBuffer> WorkspacePool<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest buffer of at least `bytes`, allocating one through `alloc` when
    /// none fits. An allocation failure leaves the pool unchanged.
    pub fn acquire<F>(&mut self, bytes: usize, alloc: F) -> Result<&mut W>
    where
        F: FnOnce(usize) -> Result<W>,
    {
        let index = match self.buffers.iter().position(|b| b.len_bytes() >= bytes) {
            Some(index) => index,
            None => {
                let buffer = alloc(bytes)?;
                tracing::debug!(bytes, pooled = self.buffers.len(), "allocated workspace");
                let index = self
                    .buffers
                    .iter()
                    .position(|b| b.len_bytes() > buffer.len_bytes())
                    .unwrap_or(self.buffers.len());
                self.buffers.insert(index, buffer);
                index
            }
        };
        Ok(&mut self.buffers[index])
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.len_bytes()).sum()
    }
}

/// A backend together with the workspace pool of the thread driving it.
#[derive(Debug)]
pub struct ExecutionContext<B: ConvBackend> {
    pub(crate) backend: B,
    pub(crate) workspace: WorkspacePool<B::Workspace>,
}

impl<B: ConvBackend> ExecutionContext<B> {
    pub fn new(backend: B) -> Self {
        ExecutionContext {
            backend,
            workspace: WorkspacePool::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn workspace(&self) -> &WorkspacePool<B::Workspace> {
        &self.workspace
    }

    /// Workspace of at least `bytes`, or `None` when nothing is needed.
    pub(crate) fn acquire_workspace<'a>(
        backend: &B,
        pool: &'a mut WorkspacePool<B::Workspace>,
        bytes: usize,
    ) -> Result<Option<&'a mut B::Workspace>> {
        if bytes == 0 {
            return Ok(None);
        }
        pool.acquire(bytes, |n| backend.alloc_workspace(n)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvError;

    #[derive(Debug)]
    struct Bytes(usize);

    impl WorkspaceBuffer for Bytes {
        fn len_bytes(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn reuses_an_adequate_buffer() {
        let mut pool = WorkspacePool::new();
        let mut allocations = 0;
        for _ in 0..5 {
            let buffer = pool
                .acquire(100, |n| {
                    allocations += 1;
                    Ok(Bytes(n))
                })
                .unwrap();
            assert_eq!(buffer.len_bytes(), 100);
        }
        assert_eq!(allocations, 1);
        pool.acquire(60, |_| panic!("a 100 byte buffer already fits")).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn picks_the_smallest_fit_and_keeps_order() {
        let mut pool = WorkspacePool::new();
        pool.acquire(300, |n| Ok(Bytes(n))).unwrap();
        pool.acquire(400, |n| Ok(Bytes(n))).unwrap();
        pool.acquire(100, |_| panic!("300 fits")).unwrap();
        assert_eq!(pool.len(), 2);

        let mut pool = WorkspacePool::new();
        pool.acquire(300, |n| Ok(Bytes(n))).unwrap();
        pool.buffers.insert(0, Bytes(50));
        assert_eq!(pool.acquire(200, |_| panic!("300 fits")).unwrap().len_bytes(), 300);
        assert_eq!(pool.acquire(10, |_| panic!("50 fits")).unwrap().len_bytes(), 50);
        assert_eq!(pool.allocated_bytes(), 350);
    }

    #[test]
    fn grows_when_nothing_fits() {
        let mut pool = WorkspacePool::new();
        pool.acquire(64, |n| Ok(Bytes(n))).unwrap();
        assert_eq!(pool.acquire(128, |n| Ok(Bytes(n))).unwrap().len_bytes(), 128);
        assert_eq!(pool.len(), 2);
        let sizes: Vec<_> = pool.buffers.iter().map(|b| b.0).collect();
        assert_eq!(sizes, vec![64, 128]);
    }

    #[test]
    fn allocation_failure_leaves_pool_unchanged() {
        let mut pool = WorkspacePool::new();
        pool.acquire(64, |n| Ok(Bytes(n))).unwrap();
        let err = pool
            .acquire(1 << 20, |n| Err(ConvError::OutOfMemory { requested: n }))
            .unwrap_err();
        assert!(matches!(err, ConvError::OutOfMemory { requested } if requested == 1 << 20));
        assert_eq!(pool.len(), 1);
    }
}
