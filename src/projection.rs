//! Grouped convolution and deconvolution projections.
//!
//! A projection derives its shapes, keeps its descriptors and algorithm choice in
//! sync with them, and runs one primitive call per group on disjoint slices of the
//! input, output and weight buffers.

use crate::algorithm::{AlgoPerf, AlgorithmCache};
use crate::argument::Argument;
use crate::backend::ConvBackend;
use crate::config::{ConvConfig, ConvParams};
use crate::descriptor::DescriptorManager;
use crate::error::{ConvError, ConvOp, Result};
use crate::shape::{ConvMode, Extent, GroupOffsets, ShapeState};
use crate::weight::{UpdateCallback, Weight};
use crate::workspace::ExecutionContext;
use crate::Real;

/// A convolution (or transposed convolution) between one input and one output
/// argument of a layer.
#[derive(Debug)]
pub struct ConvProjection<B: ConvBackend> {
    name: String,
    params: ConvParams,
    shape: Option<ShapeState>,
    offsets: GroupOffsets,
    descriptors: DescriptorManager<B>,
    algorithms: AlgorithmCache<B::Algo>,
    weight: Weight,
}

impl<B: ConvBackend> ConvProjection<B> {
    pub fn new<S: Into<String>>(name: S, config: &ConvConfig, weight: Weight) -> Result<Self> {
        let params = ConvParams::from_config(config)?;
        weight.check_shape(&params)?;
        Ok(ConvProjection {
            name: name.into(),
            algorithms: AlgorithmCache::new(params.workspace_policy()),
            params,
            shape: None,
            offsets: GroupOffsets::default(),
            descriptors: DescriptorManager::new(),
            weight,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    pub fn weight(&self) -> &Weight {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Weight {
        &mut self.weight
    }

    /// Shapes of the last successful forward call.
    pub fn shape(&self) -> Option<&ShapeState> {
        self.shape.as_ref()
    }

    pub fn offsets(&self) -> GroupOffsets {
        self.offsets
    }

    pub fn algorithms(&self) -> &AlgorithmCache<B::Algo> {
        &self.algorithms
    }

    /// Brings shapes, descriptors and algorithms up to date for this call.
    fn reshape(&mut self, backend: &B, frame: Extent, batch_size: usize) -> Result<ShapeState> {
        let shape = self.params.compute_shapes(frame, batch_size)?;
        if self.descriptors.ensure(backend, &shape, &self.params)? {
            self.shape = None;
            self.algorithms.invalidate();
        }
        let descriptors = self
            .descriptors
            .get()
            .ok_or_else(|| ConvError::shape("descriptors missing after rebuild"))?;
        self.algorithms.select(backend, descriptors, batch_size)?;
        self.offsets = self.params.group_offsets(&shape);
        self.shape = Some(shape);
        Ok(shape)
    }

    #[tracing::instrument(skip_all, fields(projection = %self.name))]
    pub fn forward(
        &mut self,
        ctx: &mut ExecutionContext<B>,
        input: &Argument,
        output: &mut Argument,
    ) -> Result<()> {
        let ExecutionContext {
            ref backend,
            ref mut workspace,
        } = *ctx;
        self.weight.check_shape(&self.params)?;
        let batch_size = input.batch_size();
        let shape = self.reshape(backend, input.frame(), batch_size)?;
        check_dim("input", &input.value, batch_size, self.params.input_width(&shape))?;

        let mut workspace =
            ExecutionContext::acquire_workspace(backend, workspace, self.algorithms.workspace_bytes())?;
        output.resize_or_create(batch_size, self.params.output_width(&shape));
        output.set_frame(self.params.output_frame(&shape));
        let descriptors = self
            .descriptors
            .get()
            .ok_or_else(|| ConvError::shape("no descriptors for the current shape"))?;
        let x = contiguous(&input.value, "input")?;
        let y = contiguous_mut(&mut output.value, "output")?;
        let w = self
            .weight
            .value
            .as_slice()
            .ok_or_else(|| ConvError::shape("weight is not contiguous"))?;
        let GroupOffsets {
            input: input_offset,
            output: output_offset,
            weight: weight_offset,
        } = self.offsets;

        match self.params.mode() {
            ConvMode::Convolution => {
                let algo = selected(self.algorithms.forward(), ConvOp::Forward)?;
                for g in 0..self.params.groups() {
                    backend.convolution_forward(
                        descriptors,
                        &x[g * input_offset..],
                        &w[g * weight_offset..],
                        &mut y[g * output_offset..],
                        algo,
                        workspace.as_deref_mut(),
                    )?;
                }
            }
            // The argument input is the output side of the implied convolution.
            ConvMode::Transposed => {
                let algo = selected(self.algorithms.backward_data(), ConvOp::BackwardData)?;
                for g in 0..self.params.groups() {
                    backend.convolution_backward_data(
                        descriptors,
                        &w[g * weight_offset..],
                        &x[g * input_offset..],
                        &mut y[g * output_offset..],
                        algo,
                        workspace.as_deref_mut(),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Propagates the output gradient into the weight gradient (if trainable) and
    /// the input gradient (if the input has one), then runs the weight's deferred
    /// update once.
    #[tracing::instrument(skip_all, fields(projection = %self.name))]
    pub fn backward(
        &mut self,
        ctx: &mut ExecutionContext<B>,
        input: &mut Argument,
        output: &Argument,
        callback: &mut UpdateCallback<'_>,
    ) -> Result<()> {
        let shape = self
            .shape
            .ok_or_else(|| ConvError::shape("backward called before a successful forward"))?;
        self.weight.check_shape(&self.params)?;
        let ExecutionContext {
            ref backend,
            ref mut workspace,
        } = *ctx;
        let batch_size = shape.batch_size;
        let input_width = self.params.input_width(&shape);

        let out_grad = output
            .grad
            .as_ref()
            .ok_or_else(|| ConvError::shape("output argument has no gradient"))?;
        check_dim("output gradient", out_grad, batch_size, self.params.output_width(&shape))?;
        check_dim("input", &input.value, batch_size, input_width)?;
        if let Some(grad) = &input.grad {
            check_dim("input gradient", grad, batch_size, input_width)?;
        }

        let mut workspace =
            ExecutionContext::acquire_workspace(backend, workspace, self.algorithms.workspace_bytes())?;
        let descriptors = self
            .descriptors
            .get()
            .ok_or_else(|| ConvError::shape("no descriptors for the current shape"))?;
        let forward_algo = selected(self.algorithms.forward(), ConvOp::Forward)?;
        let data_algo = selected(self.algorithms.backward_data(), ConvOp::BackwardData)?;
        let filter_algo = selected(self.algorithms.backward_filter(), ConvOp::BackwardFilter)?;

        let dy = contiguous(out_grad, "output gradient")?;
        let Argument {
            value: in_value,
            grad: in_grad,
            ..
        } = input;
        let x = contiguous(in_value, "input")?;
        let mut dx = match in_grad {
            Some(grad) => Some(contiguous_mut(grad, "input gradient")?),
            None => None,
        };
        let Weight { value, grad, .. } = &mut self.weight;
        let w = value
            .as_slice()
            .ok_or_else(|| ConvError::shape("weight is not contiguous"))?;
        let mut dw = match grad {
            Some(grad) => Some(
                grad.as_slice_mut()
                    .ok_or_else(|| ConvError::shape("weight gradient is not contiguous"))?,
            ),
            None => None,
        };
        let GroupOffsets {
            input: input_offset,
            output: output_offset,
            weight: weight_offset,
        } = self.offsets;

        for g in 0..self.params.groups() {
            let (i, o, k) = (g * input_offset, g * output_offset, g * weight_offset);
            match self.params.mode() {
                ConvMode::Convolution => {
                    if let Some(dw) = dw.as_deref_mut() {
                        backend.convolution_backward_filter(
                            descriptors,
                            &x[i..],
                            &dy[o..],
                            &mut dw[k..],
                            filter_algo,
                            workspace.as_deref_mut(),
                        )?;
                    }
                    if let Some(dx) = dx.as_deref_mut() {
                        backend.convolution_backward_data(
                            descriptors,
                            &w[k..],
                            &dy[o..],
                            &mut dx[i..],
                            data_algo,
                            workspace.as_deref_mut(),
                        )?;
                    }
                }
                // Image side is the argument output, output side the argument input.
                ConvMode::Transposed => {
                    if let Some(dw) = dw.as_deref_mut() {
                        backend.convolution_backward_filter(
                            descriptors,
                            &dy[o..],
                            &x[i..],
                            &mut dw[k..],
                            filter_algo,
                            workspace.as_deref_mut(),
                        )?;
                    }
                    if let Some(dx) = dx.as_deref_mut() {
                        backend.convolution_forward(
                            descriptors,
                            &dy[o..],
                            &w[k..],
                            &mut dx[i..],
                            forward_algo,
                            workspace.as_deref_mut(),
                        )?;
                    }
                }
            }
        }

        self.weight.inc_update(callback);
        Ok(())
    }
}

fn selected<A: Copy>(perf: Option<&AlgoPerf<A>>, op: ConvOp) -> Result<A> {
    perf.map(|p| p.algo)
        .ok_or(ConvError::AlgorithmUnavailable { op })
}

fn check_dim(name: &str, array: &ndarray::Array2<Real>, rows: usize, cols: usize) -> Result<()> {
    if array.dim() != (rows, cols) {
        return Err(ConvError::shape(format!(
            "{} is {:?}, expected {:?}",
            name,
            array.dim(),
            (rows, cols)
        )));
    }
    Ok(())
}

fn contiguous<'a>(array: &'a ndarray::Array2<Real>, name: &str) -> Result<&'a [Real]> {
    array
        .as_slice()
        .ok_or_else(|| ConvError::shape(format!("{} is not contiguous", name)))
}

fn contiguous_mut<'a>(array: &'a mut ndarray::Array2<Real>, name: &str) -> Result<&'a mut [Real]> {
    array
        .as_slice_mut()
        .ok_or_else(|| ConvError::shape(format!("{} is not contiguous", name)))
}
