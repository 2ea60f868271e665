//! Host implementations of the three convolution primitives.
//!
//! `Direct` walks the seven nested loops. `Im2col` unfolds one sample's receptive
//! fields into a column matrix held in the workspace and hands the rest to a
//! matrix product, following:
//! - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
//!
//! Every kernel accumulates into its destination.

use std::ops::AddAssign;

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};
use num_traits::Float;

use crate::backend::{ConvGeometry, FilterLayout, TensorLayout};
use crate::error::Result;

/// Layouts of one grouped primitive call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Problem {
    pub x: TensorLayout,
    pub y: TensorLayout,
    pub w: FilterLayout,
    pub geometry: ConvGeometry,
}

impl Problem {
    /// Rows and columns of one sample's unfolded image.
    pub fn col_shape(&self) -> (usize, usize) {
        let [_, channels, _, _] = self.w.dims;
        (
            channels * self.w.dims[2] * self.w.dims[3],
            self.y.dims[2] * self.y.dims[3],
        )
    }

    pub fn macs(&self) -> usize {
        let (rows, cols) = self.col_shape();
        self.x.dims[0] * self.w.dims[0] * rows * cols
    }
}

/// Image coordinate under output position `o` and kernel tap `t`, or `None` when
/// it falls into the zero padding.
#[inline]
fn source(o: usize, t: usize, stride: usize, padding: usize, size: usize) -> Option<usize> {
    let i = (o * stride + t) as isize - padding as isize;
    if i < 0 || i >= size as isize {
        None
    } else {
        Some(i as usize)
    }
}

pub(crate) fn forward_direct<F>(p: &Problem, x: &[F], w: &[F], y: &mut [F])
where
    F: Float + AddAssign,
{
    let [batch, channels, height, width] = p.x.dims;
    let [filters, _, kh, kw] = p.w.dims;
    let [_, _, out_h, out_w] = p.y.dims;
    let (ph, pw) = p.geometry.padding;
    let (sh, sw) = p.geometry.stride;

    for n in 0..batch {
        for k in 0..filters {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = F::zero();
                    for c in 0..channels {
                        for r in 0..kh {
                            let iy = match source(oy, r, sh, ph, height) {
                                Some(iy) => iy,
                                None => continue,
                            };
                            for s in 0..kw {
                                if let Some(ix) = source(ox, s, sw, pw, width) {
                                    acc += x[p.x.index(n, c, iy, ix)] * w[p.w.index(k, c, r, s)];
                                }
                            }
                        }
                    }
                    y[p.y.index(n, k, oy, ox)] += acc;
                }
            }
        }
    }
}

pub(crate) fn backward_data_direct<F>(p: &Problem, w: &[F], dy: &[F], dx: &mut [F])
where
    F: Float + AddAssign,
{
    let [batch, channels, height, width] = p.x.dims;
    let [filters, _, kh, kw] = p.w.dims;
    let [_, _, out_h, out_w] = p.y.dims;
    let (ph, pw) = p.geometry.padding;
    let (sh, sw) = p.geometry.stride;

    for n in 0..batch {
        for k in 0..filters {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let grad = dy[p.y.index(n, k, oy, ox)];
                    for c in 0..channels {
                        for r in 0..kh {
                            let iy = match source(oy, r, sh, ph, height) {
                                Some(iy) => iy,
                                None => continue,
                            };
                            for s in 0..kw {
                                if let Some(ix) = source(ox, s, sw, pw, width) {
                                    dx[p.x.index(n, c, iy, ix)] += grad * w[p.w.index(k, c, r, s)];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn backward_filter_direct<F>(p: &Problem, x: &[F], dy: &[F], dw: &mut [F])
where
    F: Float + AddAssign,
{
    let [batch, channels, height, width] = p.x.dims;
    let [filters, _, kh, kw] = p.w.dims;
    let [_, _, out_h, out_w] = p.y.dims;
    let (ph, pw) = p.geometry.padding;
    let (sh, sw) = p.geometry.stride;

    for k in 0..filters {
        for c in 0..channels {
            for r in 0..kh {
                for s in 0..kw {
                    let mut acc = F::zero();
                    for n in 0..batch {
                        for oy in 0..out_h {
                            let iy = match source(oy, r, sh, ph, height) {
                                Some(iy) => iy,
                                None => continue,
                            };
                            for ox in 0..out_w {
                                if let Some(ix) = source(ox, s, sw, pw, width) {
                                    acc += dy[p.y.index(n, k, oy, ox)] * x[p.x.index(n, c, iy, ix)];
                                }
                            }
                        }
                    }
                    dw[p.w.index(k, c, r, s)] += acc;
                }
            }
        }
    }
}

/// Unfolds sample `n` of `x` into `col`, one row per (channel, kernel row, kernel
/// column) and one column per output position.
fn im2col<F: Float>(p: &Problem, x: &[F], n: usize, col: &mut ArrayViewMut2<F>) {
    let [_, channels, height, width] = p.x.dims;
    let [_, _, kh, kw] = p.w.dims;
    let [_, _, out_h, out_w] = p.y.dims;
    let (ph, pw) = p.geometry.padding;
    let (sh, sw) = p.geometry.stride;

    for c in 0..channels {
        for r in 0..kh {
            for s in 0..kw {
                let row = (c * kh + r) * kw + s;
                for oy in 0..out_h {
                    let iy = source(oy, r, sh, ph, height);
                    for ox in 0..out_w {
                        col[[row, oy * out_w + ox]] = match (iy, source(ox, s, sw, pw, width)) {
                            (Some(iy), Some(ix)) => x[p.x.index(n, c, iy, ix)],
                            _ => F::zero(),
                        };
                    }
                }
            }
        }
    }
}

/// Adjoint of [`im2col`]: scatters `col` back onto sample `n` of `dx`.
fn col2im<F>(p: &Problem, col: &ArrayView2<F>, n: usize, dx: &mut [F])
where
    F: Float + AddAssign,
{
    let [_, channels, height, width] = p.x.dims;
    let [_, _, kh, kw] = p.w.dims;
    let [_, _, out_h, out_w] = p.y.dims;
    let (ph, pw) = p.geometry.padding;
    let (sh, sw) = p.geometry.stride;

    for c in 0..channels {
        for r in 0..kh {
            for s in 0..kw {
                let row = (c * kh + r) * kw + s;
                for oy in 0..out_h {
                    let iy = match source(oy, r, sh, ph, height) {
                        Some(iy) => iy,
                        None => continue,
                    };
                    for ox in 0..out_w {
                        if let Some(ix) = source(ox, s, sw, pw, width) {
                            dx[p.x.index(n, c, iy, ix)] += col[[row, oy * out_w + ox]];
                        }
                    }
                }
            }
        }
    }
}

/// View of sample `n` of a grouped output tensor as (filters, positions).
fn sample_view<'a, F>(layout: &TensorLayout, data: &'a [F], n: usize) -> Result<ArrayView2<'a, F>> {
    let shape = (layout.dims[1], layout.dims[2] * layout.dims[3]).strides((layout.strides[1], 1));
    Ok(ArrayView2::from_shape(shape, &data[n * layout.strides[0]..])?)
}

pub(crate) fn forward_im2col<F>(p: &Problem, x: &[F], w: &[F], y: &mut [F], ws: &mut [F]) -> Result<()>
where
    F: 'static + Float + AddAssign,
{
    let (rows, cols) = p.col_shape();
    let filters = p.w.dims[0];
    let weights = ArrayView2::from_shape((filters, rows), &w[..p.w.elements()])?;

    for n in 0..p.x.dims[0] {
        let mut col = ArrayViewMut2::from_shape((rows, cols), &mut ws[..rows * cols])?;
        im2col(p, x, n, &mut col);
        let shape = (filters, cols).strides((p.y.strides[1], 1));
        let mut out = ArrayViewMut2::from_shape(shape, &mut y[n * p.y.strides[0]..])?;
        general_mat_mul(F::one(), &weights, &col, F::one(), &mut out);
    }
    Ok(())
}

pub(crate) fn backward_data_im2col<F>(
    p: &Problem,
    w: &[F],
    dy: &[F],
    dx: &mut [F],
    ws: &mut [F],
) -> Result<()>
where
    F: 'static + Float + AddAssign,
{
    let (rows, cols) = p.col_shape();
    let weights = ArrayView2::from_shape((p.w.dims[0], rows), &w[..p.w.elements()])?;

    for n in 0..p.x.dims[0] {
        let grad = sample_view(&p.y, dy, n)?;
        let mut col = ArrayViewMut2::from_shape((rows, cols), &mut ws[..rows * cols])?;
        general_mat_mul(F::one(), &weights.t(), &grad, F::zero(), &mut col);
        col2im(p, &col.view(), n, dx);
    }
    Ok(())
}

pub(crate) fn backward_filter_im2col<F>(
    p: &Problem,
    x: &[F],
    dy: &[F],
    dw: &mut [F],
    ws: &mut [F],
) -> Result<()>
where
    F: 'static + Float + AddAssign,
{
    let (rows, cols) = p.col_shape();
    let mut grad_w = ArrayViewMut2::from_shape((p.w.dims[0], rows), &mut dw[..p.w.elements()])?;

    for n in 0..p.x.dims[0] {
        let mut col = ArrayViewMut2::from_shape((rows, cols), &mut ws[..rows * cols])?;
        im2col(p, x, n, &mut col);
        let grad = sample_view(&p.y, dy, n)?;
        general_mat_mul(F::one(), &grad, &col.t(), F::one(), &mut grad_w);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(stride: usize, padding: usize) -> Problem {
        let height = 5;
        let out = (height + 2 * padding - 3) / stride + 1;
        Problem {
            x: TensorLayout::grouped(2, 2, 2, height, height),
            y: TensorLayout::grouped(2, 3, 3, out, out),
            w: FilterLayout::new(3, 2, 3, 3),
            geometry: ConvGeometry {
                padding: (padding, padding),
                stride: (stride, stride),
            },
        }
    }

    fn fill(len: usize, seed: f32) -> Vec<f32> {
        (0..len).map(|i| ((i as f32) * 0.37 + seed).sin()).collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < 1e-4, "index {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn single_tap_copies_the_image() {
        let p = Problem {
            x: TensorLayout::grouped(1, 1, 1, 2, 2),
            y: TensorLayout::grouped(1, 1, 1, 2, 2),
            w: FilterLayout::new(1, 1, 1, 1),
            geometry: ConvGeometry {
                padding: (0, 0),
                stride: (1, 1),
            },
        };
        let mut y = vec![1.0f32; 4];
        forward_direct(&p, &[1.0, 2.0, 3.0, 4.0], &[2.0], &mut y);
        assert_eq!(y, vec![3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn im2col_agrees_with_direct() {
        for &(stride, padding) in &[(1, 0), (1, 1), (2, 1), (2, 0)] {
            let p = problem(stride, padding);
            let (rows, cols) = p.col_shape();
            let x = fill(p.x.span(), 0.1);
            let w = fill(p.w.elements(), 0.7);
            let dy = fill(p.y.span(), 1.3);
            let mut ws = vec![0.0f32; rows * cols];

            let mut y_direct = vec![0.0f32; p.y.span()];
            let mut y_gemm = vec![0.0f32; p.y.span()];
            forward_direct(&p, &x, &w, &mut y_direct);
            forward_im2col(&p, &x, &w, &mut y_gemm, &mut ws).unwrap();
            assert_close(&y_direct, &y_gemm);

            let mut dx_direct = vec![0.0f32; p.x.span()];
            let mut dx_gemm = vec![0.0f32; p.x.span()];
            backward_data_direct(&p, &w, &dy, &mut dx_direct);
            backward_data_im2col(&p, &w, &dy, &mut dx_gemm, &mut ws).unwrap();
            assert_close(&dx_direct, &dx_gemm);

            let mut dw_direct = vec![0.0f32; p.w.elements()];
            let mut dw_gemm = vec![0.0f32; p.w.elements()];
            backward_filter_direct(&p, &x, &dy, &mut dw_direct);
            backward_filter_im2col(&p, &x, &dy, &mut dw_gemm, &mut ws).unwrap();
            assert_close(&dw_direct, &dw_gemm);
        }
    }

    #[test]
    fn backward_data_is_the_adjoint_of_forward() {
        let p = problem(2, 1);
        let x = fill(p.x.span(), 0.2);
        let w = fill(p.w.elements(), 0.5);
        let dy = fill(p.y.span(), 0.9);

        let mut y = vec![0.0f32; p.y.span()];
        forward_direct(&p, &x, &w, &mut y);
        let mut dx = vec![0.0f32; p.x.span()];
        backward_data_direct(&p, &w, &dy, &mut dx);

        let lhs: f32 = y.iter().zip(dy.iter()).map(|(a, b)| a * b).sum();
        let rhs: f32 = x.iter().zip(dx.iter()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-3, "{} vs {}", lhs, rhs);
    }
}
