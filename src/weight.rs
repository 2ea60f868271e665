//! Learned filter of a projection and its gradient.

use std::path::Path;

use ndarray::Array4;
use ndarray_npy::{read_npy, write_npy};

use crate::config::ConvParams;
use crate::error::{ConvError, Result};
use crate::Real;

/// Deferred-update hook, handed the weight once its gradient is complete.
pub type UpdateCallback<'a> = dyn FnMut(&mut Weight) + 'a;

/// Filter weights in (filters, channels per group, kernel height, kernel width)
/// layout, groups stacked along the first axis.
///
/// The gradient is absent for weights that are not trained.
#[derive(Debug, Clone, PartialEq)]
pub struct Weight {
    pub(crate) value: Array4<Real>,
    pub(crate) grad: Option<Array4<Real>>,
    update_count: usize,
    shared_count: usize,
}

impl Weight {
    pub fn new(value: Array4<Real>, trainable: bool) -> Self {
        let value = if value.is_standard_layout() {
            value
        } else {
            value.as_standard_layout().into_owned()
        };
        let grad = if trainable {
            Some(Array4::zeros(value.raw_dim()))
        } else {
            None
        };
        Weight {
            value,
            grad,
            update_count: 0,
            shared_count: 1,
        }
    }

    /// Zero weights shaped for `params`.
    pub fn for_params(params: &ConvParams, trainable: bool) -> Self {
        Weight::new(Array4::zeros(params.filter_shape()), trainable)
    }

    /// The update hook fires once every `count` calls to [`Weight::inc_update`],
    /// for weights shared between `count` projections.
    pub fn with_shared_count(mut self, count: usize) -> Self {
        self.shared_count = count.max(1);
        self
    }

    pub fn value(&self) -> &Array4<Real> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Array4<Real> {
        &mut self.value
    }

    pub fn grad(&self) -> Option<&Array4<Real>> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Array4<Real>> {
        self.grad.as_mut()
    }

    pub fn is_trainable(&self) -> bool {
        self.grad.is_some()
    }

    pub fn zero_grad(&mut self) {
        if let Some(grad) = &mut self.grad {
            grad.fill(0.0);
        }
    }

    /// Records one gradient contribution. Once all sharers contributed, runs
    /// `callback` and starts counting again.
    pub fn inc_update(&mut self, callback: &mut UpdateCallback<'_>) {
        self.update_count += 1;
        if self.update_count >= self.shared_count {
            self.update_count = 0;
            callback(self);
        }
    }

    pub fn save_npy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_npy(path, &self.value)?;
        Ok(())
    }

    pub fn load_npy<P: AsRef<Path>>(path: P, trainable: bool) -> Result<Self> {
        let value: Array4<Real> = read_npy(path)?;
        Ok(Weight::new(value, trainable))
    }

    /// Value and gradient must both match the filter shape of `params`.
    pub(crate) fn check_shape(&self, params: &ConvParams) -> Result<()> {
        let expected = params.filter_shape();
        if self.value.dim() != expected {
            return Err(ConvError::shape(format!(
                "weight has shape {:?}, projection needs {:?}",
                self.value.dim(),
                expected
            )));
        }
        if let Some(grad) = &self.grad {
            if grad.dim() != expected {
                return Err(ConvError::shape(format!(
                    "weight gradient has shape {:?}, projection needs {:?}",
                    grad.dim(),
                    expected
                )));
            }
        }
        Ok(())
    }
}
