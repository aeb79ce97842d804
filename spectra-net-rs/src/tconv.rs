//! One-dimensional transposed convolution with "same" padding.
//!
//! candle only differentiates through the 2-D transposed convolution, so the
//! 1-D op is expressed on a unit-height image: the sequence gets a height
//! axis of 1, the kernel a height of 1, and the result is squeezed back.
//! Padding is applied by cropping the unpadded result, which keeps the height
//! axis untouched.
//!
//! Layout is channels-first throughout: inputs are `[batch, in_channels,
//! length]` and outputs `[batch, out_channels, target_length]`. Kernels are
//! stored as `[width, out_channels, in_channels]`.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::shape::UpsampleStage;

/// Kernel width of every upsampling stage.
pub const TCONV_KERNEL_WIDTH: usize = 3;

/// Leading pad used by a strided "same" convolution that maps `target_length`
/// down to `length`.
fn same_padding_before(length: usize, target_length: usize, width: usize, stride: usize) -> usize {
    let covered = (length - 1) * stride + width;
    covered.saturating_sub(target_length) / 2
}

/// Transpose of a strided 1-D convolution under "same" padding.
///
/// Computes the adjoint of the convolution that would take a
/// `[batch, out_channels, target_length]` signal down to
/// `[batch, in_channels, length]` with the given kernel and stride. In index
/// form, input position `l` through tap `k` lands on output position
/// `l * stride + k - pad_before`.
///
/// # Errors
///
/// Fails if the kernel does not match the input channels, the stride is zero,
/// or `target_length` does not downsample back to the input length under
/// "same" padding (`ceil(target_length / stride) != length`).
pub fn conv1d_transpose(
    input: &Tensor,
    kernel: &Tensor,
    target_length: usize,
    stride: usize,
) -> Result<Tensor> {
    let (_batch, in_channels, length) = input.dims3()?;
    let (width, _out_channels, kernel_in) = kernel.dims3()?;

    if stride == 0 {
        bail!("conv1d_transpose: stride must be positive");
    }
    if kernel_in != in_channels {
        bail!("conv1d_transpose: kernel expects {kernel_in} input channels, got {in_channels}");
    }
    if length == 0 || target_length.div_ceil(stride) != length {
        bail!(
            "conv1d_transpose: target length {target_length} with stride {stride} \
             does not map back to input length {length}"
        );
    }

    // [width, out, in] -> [in, out, 1, width]
    let kernel_2d = kernel.permute((2, 1, 0))?.unsqueeze(2)?.contiguous()?;
    let full = input
        .unsqueeze(2)?
        .conv_transpose2d(&kernel_2d, 0, 0, stride, 1)?
        .squeeze(2)?;

    let full_length = (length - 1) * stride + width;
    let pad_before = same_padding_before(length, target_length, width, stride);
    let needed = pad_before + target_length;
    let full = if full_length < needed {
        // Positions past the last tap receive no contribution.
        full.pad_with_zeros(2, 0, needed - full_length)?
    } else {
        full
    };

    full.narrow(2, pad_before, target_length)?.contiguous()
}

/// Learned transposed convolution stage of the upsampling stack.
#[derive(Debug, Clone)]
pub struct TransposedConv1d {
    kernel: Tensor,
    stride: usize,
    target_length: usize,
}

impl TransposedConv1d {
    /// Create the stage described by `stage`, drawing its kernel from `N(0, 1)`.
    pub fn new(stage: &UpsampleStage, vb: VarBuilder) -> Result<Self> {
        let kernel = vb.get_with_hints(
            (TCONV_KERNEL_WIDTH, stage.out_channels, stage.in_channels),
            "kernel",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self::from_kernel(kernel, stage.stride, stage.out_length))
    }

    /// Wrap an existing `[width, out, in]` kernel.
    pub fn from_kernel(kernel: Tensor, stride: usize, target_length: usize) -> Self {
        Self {
            kernel,
            stride,
            target_length,
        }
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn target_length(&self) -> usize {
        self.target_length
    }
}

impl Module for TransposedConv1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        conv1d_transpose(xs, &self.kernel, self.target_length, self.stride)
    }
}
