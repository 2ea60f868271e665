//! Ownership of the four backend descriptors a projection needs.

use crate::backend::{ConvBackend, ConvGeometry, FilterLayout, TensorLayout};
use crate::config::ConvParams;
use crate::error::Result;
use crate::shape::ShapeState;

/// Image, output, filter and convolution descriptors of one shape.
///
/// Dropping the set destroys all four handles.
#[derive(Debug)]
pub struct Descriptors<B: ConvBackend> {
    image: B::TensorDescriptor,
    output: B::TensorDescriptor,
    filter: B::FilterDescriptor,
    conv: B::ConvDescriptor,
}

impl<B: ConvBackend> Descriptors<B> {
    fn create(backend: &B, shape: &ShapeState, params: &ConvParams) -> Result<Self> {
        let groups = params.groups();
        let channels = params.channels();
        let num_filters = params.num_filters();
        let kernel = params.kernel();
        let padding = params.padding();
        let stride = params.stride();

        // Any failure below drops what was already created.
        let image = backend.create_tensor_descriptor(&TensorLayout::grouped(
            shape.batch_size,
            channels / groups,
            channels,
            shape.image.height,
            shape.image.width,
        ))?;
        let output = backend.create_tensor_descriptor(&TensorLayout::grouped(
            shape.batch_size,
            num_filters / groups,
            num_filters,
            shape.output.height,
            shape.output.width,
        ))?;
        let filter = backend.create_filter_descriptor(&FilterLayout::new(
            num_filters / groups,
            channels / groups,
            kernel.height,
            kernel.width,
        ))?;
        let conv = backend.create_convolution_descriptor(&ConvGeometry {
            padding: (padding.height, padding.width),
            stride: (stride.height, stride.width),
        })?;

        Ok(Descriptors {
            image,
            output,
            filter,
            conv,
        })
    }

    pub fn image(&self) -> &B::TensorDescriptor {
        &self.image
    }

    pub fn output(&self) -> &B::TensorDescriptor {
        &self.output
    }

    pub fn filter(&self) -> &B::FilterDescriptor {
        &self.filter
    }

    pub fn convolution(&self) -> &B::ConvDescriptor {
        &self.conv
    }
}

/// Keeps a [`Descriptors`] set in sync with the current [`ShapeState`].
#[derive(Debug)]
pub struct DescriptorManager<B: ConvBackend> {
    current: Option<(ShapeState, Descriptors<B>)>,
}

impl<B: ConvBackend> Default for DescriptorManager<B> {
    fn default() -> Self {
        DescriptorManager { current: None }
    }
}

impl<B: ConvBackend> DescriptorManager<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the descriptors reflect `shape`. Returns whether they were rebuilt.
    ///
    /// The new set is created in full before the old one is released; on error the
    /// previous set and its shape are left untouched.
    pub fn ensure(&mut self, backend: &B, shape: &ShapeState, params: &ConvParams) -> Result<bool> {
        if let Some((built_for, _)) = &self.current {
            if built_for == shape {
                return Ok(false);
            }
        }
        let descriptors = Descriptors::create(backend, shape, params)?;
        tracing::trace!(?shape, "rebuilt convolution descriptors");
        self.current = Some((*shape, descriptors));
        Ok(true)
    }

    pub fn get(&self) -> Option<&Descriptors<B>> {
        self.current.as_ref().map(|(_, d)| d)
    }

    /// Shape the live descriptors were built for.
    pub fn shape(&self) -> Option<&ShapeState> {
        self.current.as_ref().map(|(s, _)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::config::ConvConfig;
    use crate::error::ConvError;
    use crate::shape::Extent;

    fn params() -> ConvParams {
        ConvParams::from_config(&ConvConfig::new(4, 8, (3, 3)).padding(1, 1)).unwrap()
    }

    #[test]
    fn ensure_is_idempotent() {
        let backend = CpuBackend::new();
        let params = params();
        let shape = params.compute_shapes(Extent::new(8, 8), 2).unwrap();
        let mut manager = DescriptorManager::new();

        assert!(manager.ensure(&backend, &shape, &params).unwrap());
        assert!(!manager.ensure(&backend, &shape, &params).unwrap());
        assert_eq!(backend.stats().descriptors_created, 4);
        assert_eq!(backend.stats().live_descriptors, 4);
    }

    #[test]
    fn shape_change_replaces_the_set() {
        let backend = CpuBackend::new();
        let params = params();
        let mut manager = DescriptorManager::new();
        for batch in 1..4 {
            let shape = params.compute_shapes(Extent::new(8, 8), batch).unwrap();
            assert!(manager.ensure(&backend, &shape, &params).unwrap());
            assert_eq!(manager.shape(), Some(&shape));
        }
        assert_eq!(backend.stats().descriptors_created, 12);
        assert_eq!(backend.stats().live_descriptors, 4);

        drop(manager);
        assert_eq!(backend.stats().live_descriptors, 0);
    }

    #[test]
    fn failed_rebuild_keeps_previous_set() {
        let backend = CpuBackend::new().with_max_tensor_elements(4 * 64 * 2);
        let params = params();
        let mut manager = DescriptorManager::new();
        let small = params.compute_shapes(Extent::new(8, 8), 1).unwrap();
        manager.ensure(&backend, &small, &params).unwrap();

        // The output descriptor (8 filters) is the first one over the limit, after
        // the image descriptor was already created.
        let large = params.compute_shapes(Extent::new(8, 8), 2).unwrap();
        let err = manager.ensure(&backend, &large, &params).unwrap_err();
        assert!(matches!(err, ConvError::Shape(_)));
        assert_eq!(manager.shape(), Some(&small));
        assert!(manager.get().is_some());
        assert_eq!(backend.stats().live_descriptors, 4);
    }
}
