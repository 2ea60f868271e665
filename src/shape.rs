//! Spatial size derivation for convolutions and their transpose.
//!
//! Both modes share one code path. The mode tag only decides which side of the
//! implied forward convolution is known: the image (convolution) or the output
//! (transposed convolution). Everything downstream works on the resulting
//! [`ShapeState`] and does not care which mode produced it.
//!
//! More can be read here:
//! - <https://theano-pymc.readthedocs.io/en/latest/tutorial/conv_arithmetic.html>

use crate::config::ConvParams;
use crate::error::{ConvError, Result};

/// Whether a projection convolves or transposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvMode {
    Convolution,
    /// Also called deconvolution. Upsamples the input.
    Transposed,
}

/// Height and width of a feature map (or a kernel, stride, padding pair).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub height: usize,
    pub width: usize,
}

impl Extent {
    pub fn new(height: usize, width: usize) -> Self {
        Extent { height, width }
    }

    pub fn area(&self) -> usize {
        self.height * self.width
    }
}

/// Shapes of the current call.
///
/// `image` is always the input side of the implied forward convolution and
/// `output` its result, regardless of the mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeState {
    pub batch_size: usize,
    pub image: Extent,
    pub output: Extent,
}

/// Per-group element offsets into the argument input, argument output and weight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupOffsets {
    pub input: usize,
    pub output: usize,
    pub weight: usize,
}

/// Output size of a convolution along one dimension.
///
/// Caffe mode floors: `(image + 2*padding - kernel) / stride + 1`. Otherwise the
/// division rounds up so that the last partial window is kept.
pub fn output_size(
    image: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
    caffe_mode: bool,
) -> Result<usize> {
    let padded = padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(image))
        .ok_or_else(|| overflow("image", image, padding))?;
    if padded < kernel || stride == 0 {
        return Err(ConvError::shape(format!(
            "kernel {} does not fit image {} with padding {}",
            kernel, image, padding
        )));
    }
    let span = padded - kernel;
    let steps = if caffe_mode || span % stride == 0 {
        span / stride
    } else {
        span / stride + 1
    };
    Ok(steps + 1)
}

/// Image size whose convolution has `output` elements along one dimension.
///
/// Inverse of [`output_size`] for the same caffe mode.
pub fn image_size(
    output: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
    caffe_mode: bool,
) -> Result<usize> {
    if output == 0 {
        return Err(ConvError::shape("transposed convolution of an empty frame"));
    }
    let grown = (output - 1)
        .checked_mul(stride)
        .and_then(|g| g.checked_add(kernel))
        .ok_or_else(|| overflow("output", output, padding))?;
    let trim = if caffe_mode { 0 } else { stride.saturating_sub(1) };
    let shrink = padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(trim))
        .ok_or_else(|| overflow("output", output, padding))?;
    if grown <= shrink {
        return Err(ConvError::shape(format!(
            "transposed convolution of {} with kernel {} and padding {} leaves no image",
            output, kernel, padding
        )));
    }
    Ok(grown - shrink)
}

fn overflow(side: &str, size: usize, padding: usize) -> ConvError {
    ConvError::shape(format!(
        "{} size {} with padding {} overflows",
        side, size, padding
    ))
}

impl ConvParams {
    /// Derives the shapes of a call from the frame of the argument input.
    ///
    /// A zero frame side means the upstream layer carries no spatial info; the
    /// configured fallback is substituted for it.
    pub fn compute_shapes(&self, frame: Extent, batch_size: usize) -> Result<ShapeState> {
        let known = Extent::new(
            if frame.height == 0 { self.fallback_frame.height } else { frame.height },
            if frame.width == 0 { self.fallback_frame.width } else { frame.width },
        );
        if known.area() == 0 {
            return Err(ConvError::shape(
                "input frame is unknown and no fallback frame is configured",
            ));
        }

        let (image, output) = match self.mode {
            ConvMode::Convolution => {
                let output = Extent::new(
                    output_size(
                        known.height,
                        self.kernel.height,
                        self.padding.height,
                        self.stride.height,
                        self.caffe_mode,
                    )?,
                    output_size(
                        known.width,
                        self.kernel.width,
                        self.padding.width,
                        self.stride.width,
                        self.caffe_mode,
                    )?,
                );
                (known, output)
            }
            ConvMode::Transposed => {
                let image = Extent::new(
                    image_size(
                        known.height,
                        self.kernel.height,
                        self.padding.height,
                        self.stride.height,
                        self.caffe_mode,
                    )?,
                    image_size(
                        known.width,
                        self.kernel.width,
                        self.padding.width,
                        self.stride.width,
                        self.caffe_mode,
                    )?,
                );
                // Convolving the derived image must give back the known side.
                let reconstructed = Extent::new(
                    output_size(
                        image.height,
                        self.kernel.height,
                        self.padding.height,
                        self.stride.height,
                        self.caffe_mode,
                    )?,
                    output_size(
                        image.width,
                        self.kernel.width,
                        self.padding.width,
                        self.stride.width,
                        self.caffe_mode,
                    )?,
                );
                if reconstructed != known {
                    return Err(ConvError::shape(format!(
                        "transposed frame {:?} reconstructs to {:?}",
                        known, reconstructed
                    )));
                }
                (image, known)
            }
        };

        Ok(ShapeState {
            batch_size,
            image,
            output,
        })
    }

    /// Frame of the argument input.
    pub fn input_frame(&self, shape: &ShapeState) -> Extent {
        match self.mode {
            ConvMode::Convolution => shape.image,
            ConvMode::Transposed => shape.output,
        }
    }

    /// Frame of the argument output.
    pub fn output_frame(&self, shape: &ShapeState) -> Extent {
        match self.mode {
            ConvMode::Convolution => shape.output,
            ConvMode::Transposed => shape.image,
        }
    }

    /// Elements per sample of the argument input.
    pub fn input_width(&self, shape: &ShapeState) -> usize {
        self.config_channels * self.input_frame(shape).area()
    }

    /// Elements per sample of the argument output.
    pub fn output_width(&self, shape: &ShapeState) -> usize {
        self.config_num_filters * self.output_frame(shape).area()
    }

    pub fn group_offsets(&self, shape: &ShapeState) -> GroupOffsets {
        let (num_filters, channels, kh, kw) = self.filter_shape();
        GroupOffsets {
            input: (self.config_channels / self.groups) * self.input_frame(shape).area(),
            output: (self.config_num_filters / self.groups) * self.output_frame(shape).area(),
            weight: num_filters / self.groups * channels * kh * kw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvConfig;

    fn params(config: ConvConfig) -> ConvParams {
        ConvParams::from_config(&config).unwrap()
    }

    #[test]
    fn output_size_floors() {
        assert_eq!(output_size(8, 3, 1, 1, true).unwrap(), 8);
        assert_eq!(output_size(8, 3, 0, 2, true).unwrap(), 3);
        assert_eq!(output_size(7, 2, 0, 2, true).unwrap(), 3);
        assert_eq!(output_size(3, 3, 0, 1, true).unwrap(), 1);
        for image in 3..20 {
            for stride in 1..4 {
                for padding in 0..3 {
                    let expected = (image + 2 * padding - 3) / stride + 1;
                    assert_eq!(output_size(image, 3, padding, stride, true).unwrap(), expected);
                }
            }
        }
    }

    #[test]
    fn output_size_non_caffe_rounds_up() {
        assert_eq!(output_size(7, 2, 0, 2, false).unwrap(), 4);
        assert_eq!(output_size(8, 2, 0, 2, false).unwrap(), 4);
    }

    #[test]
    fn kernel_larger_than_image_is_a_shape_error() {
        assert!(output_size(2, 5, 0, 1, true).is_err());
        assert!(output_size(2, 5, 2, 1, true).is_ok());
    }

    #[test]
    fn oversized_padding_is_a_shape_error() {
        let huge = usize::MAX / 2 + 1;
        assert!(matches!(output_size(8, 3, huge, 1, true), Err(ConvError::Shape(_))));
        assert!(matches!(image_size(8, 3, huge, 1, true), Err(ConvError::Shape(_))));
        assert!(matches!(image_size(usize::MAX, 3, 0, 2, true), Err(ConvError::Shape(_))));
    }

    #[test]
    fn image_size_inverts_output_size() {
        assert_eq!(image_size(8, 3, 1, 1, true).unwrap(), 8);
        assert_eq!(image_size(8, 3, 0, 2, true).unwrap(), 17);
        assert_eq!(image_size(8, 3, 1, 2, true).unwrap(), 15);
        assert_eq!(output_size(15, 3, 1, 2, true).unwrap(), 8);
        assert_eq!(image_size(4, 2, 0, 2, false).unwrap(), 7);
        assert!(image_size(1, 1, 1, 1, true).is_err());
    }

    #[test]
    fn convolution_shapes() {
        let p = params(ConvConfig::new(4, 8, (3, 3)).padding(1, 1));
        let shape = p.compute_shapes(Extent::new(8, 8), 2).unwrap();
        assert_eq!(shape.image, Extent::new(8, 8));
        assert_eq!(shape.output, Extent::new(8, 8));
        assert_eq!(p.input_width(&shape), 4 * 64);
        assert_eq!(p.output_width(&shape), 8 * 64);
    }

    #[test]
    fn transposed_shapes_round_trip() {
        let p = params(ConvConfig::new(8, 4, (3, 3)).padding(1, 1).transposed());
        let shape = p.compute_shapes(Extent::new(8, 8), 2).unwrap();
        assert_eq!(p.input_frame(&shape), Extent::new(8, 8));
        assert_eq!(p.output_frame(&shape), Extent::new(8, 8));

        let p = params(ConvConfig::new(8, 4, (3, 3)).stride(2, 2).transposed());
        let shape = p.compute_shapes(Extent::new(8, 5), 1).unwrap();
        assert_eq!(shape.image, Extent::new(17, 11));
        assert_eq!(shape.output, Extent::new(8, 5));
        assert_eq!(p.output_width(&shape), 4 * 17 * 11);
    }

    #[test]
    fn transposed_frame_too_small_for_padding() {
        let p = params(ConvConfig::new(1, 1, (1, 1)).padding(1, 1).transposed());
        assert!(p.compute_shapes(Extent::new(1, 1), 1).is_err());
        assert!(p.compute_shapes(Extent::new(4, 4), 1).is_ok());
    }

    #[test]
    fn zero_frame_uses_fallback() {
        let p = params(ConvConfig::new(4, 8, (3, 3)).fallback_frame(10, 6));
        let shape = p.compute_shapes(Extent::new(0, 0), 1).unwrap();
        assert_eq!(shape.image, Extent::new(10, 6));
        assert_eq!(shape.output, Extent::new(8, 4));

        let shape = p.compute_shapes(Extent::new(5, 0), 1).unwrap();
        assert_eq!(shape.image, Extent::new(5, 6));

        let p = params(ConvConfig::new(4, 8, (3, 3)));
        assert!(p.compute_shapes(Extent::default(), 1).is_err());
    }

    #[test]
    fn group_slices_tile_the_output() {
        let p = params(ConvConfig::new(6, 9, (3, 3)).groups(3));
        let shape = p.compute_shapes(Extent::new(5, 5), 1).unwrap();
        let offsets = p.group_offsets(&shape);
        assert_eq!(offsets.input * 3, p.input_width(&shape));
        assert_eq!(offsets.output * 3, p.output_width(&shape));
        assert_eq!(offsets.weight * 3, 9 * 2 * 3 * 3);

        let mut covered = vec![0usize; p.output_width(&shape)];
        for g in 0..3 {
            for i in g * offsets.output..(g + 1) * offsets.output {
                covered[i] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn transposed_offsets_swap_sides() {
        let p = params(ConvConfig::new(4, 6, (2, 2)).stride(2, 2).groups(2).transposed());
        let shape = p.compute_shapes(Extent::new(3, 3), 1).unwrap();
        let offsets = p.group_offsets(&shape);
        assert_eq!(offsets.input, 2 * 9);
        assert_eq!(offsets.output, 3 * 36);
        assert_eq!(offsets.weight, 2 * 3 * 4);
    }
}
