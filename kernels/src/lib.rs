//! CPU kernels for `znn-rs`.
//!
//! Every kernel works on flat, row-major slices plus an explicit `[usize; 3]` shape, so the
//! engine can wrap them in whatever volume type it likes. The 3-D kernels here are:
//!
//! - [`cpu_conv_sparse`]: valid, full (transposed) and gradient ("flipped") convolutions with a
//!   sparse (dilation) stride.
//! - [`sparse`]: dilation expand/compress (`explode`/`implode`), flipping, flattening, padding and
//!   cropping.
//! - [`cpu_max_filter`]: sliding-window max filtering and its gradient routing.
//! - [`fft`]: 3-D complex FFT built from `rustfft` line transforms.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_conv_sparse;
pub mod cpu_max_filter;
pub mod fft;
pub mod sparse;

pub use cpu_conv_sparse::{convolve_sparse, convolve_sparse_flipped, convolve_sparse_inverse};
pub use cpu_max_filter::{max_filter_sparse, max_filter_sparse_backward};
pub use fft::{fft_backward, fft_backward_raw, fft_forward, fft_inverse};
pub use sparse::{crop, flatten, flip, pad_zeros, sparse_explode, sparse_implode};

/// A volume shape: `[x, y, z]`, with `z` the fastest-varying axis in memory.
pub type Shape3 = [usize; 3];

#[derive(Error, Debug, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Kernel extent {extent:?} does not fit into volume {volume:?}")]
    ExtentTooLarge { extent: Shape3, volume: Shape3 },
    #[error("Invalid stride {0:?}: every component must be >= 1")]
    InvalidStride(Shape3),
    #[error("Shape {shape:?} is not divisible by {divisor:?}")]
    NotDivisible { shape: Shape3, divisor: Shape3 },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Number of elements of a volume with the given shape.
#[inline]
pub fn volume(shape: Shape3) -> usize {
    shape[0] * shape[1] * shape[2]
}

#[inline]
pub(crate) fn index(shape: Shape3, x: usize, y: usize, z: usize) -> usize {
    (x * shape[1] + y) * shape[2] + z
}

/// Spatial extent of a compact kernel once its taps are spread `stride` apart.
#[inline]
pub fn sparse_extent(kernel: Shape3, stride: Shape3) -> Shape3 {
    [
        (kernel[0] - 1) * stride[0] + 1,
        (kernel[1] - 1) * stride[1] + 1,
        (kernel[2] - 1) * stride[2] + 1,
    ]
}

pub(crate) fn check_len<T>(data: &[T], shape: Shape3) -> Result<()> {
    if data.len() != volume(shape) {
        return Err(KernelError::ShapeMismatch {
            expected: vec![volume(shape)],
            got: vec![data.len()],
        });
    }
    Ok(())
}

/// Kernels and windows need at least one tap.
pub(crate) fn check_kernel(shape: Shape3) -> Result<()> {
    if volume(shape) == 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![1, 1, 1],
            got: shape.to_vec(),
        });
    }
    Ok(())
}

pub(crate) fn check_stride(stride: Shape3) -> Result<()> {
    if stride.iter().any(|&s| s == 0) {
        return Err(KernelError::InvalidStride(stride));
    }
    Ok(())
}

pub(crate) fn check_fits(extent: Shape3, volume: Shape3) -> Result<()> {
    if (0..3).any(|d| extent[d] > volume[d] || extent[d] == 0) {
        return Err(KernelError::ExtentTooLarge { extent, volume });
    }
    Ok(())
}
