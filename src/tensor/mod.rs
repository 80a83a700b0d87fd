//! Dense volumes.
//!
//! A [`Tensor`] is a flat row-major buffer plus a shape; the engine only ever uses rank 3
//! ([`Cube`] for activations and weights, [`CCube`] for their frequency-domain images), but the
//! container itself is rank-generic.
//!
//! ```rust
//! use znn_rs::tensor::{Cube, Tensor};
//!
//! let cube: Cube = Tensor::new(vec![1.0; 8], [2, 2, 2]).unwrap();
//! assert_eq!(cube.shape(), &[2, 2, 2]);
//! assert_eq!(cube.get([1, 1, 1]), 1.0);
//! ```

use num_complex::Complex;
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive, Zero};
use std::fmt::Debug;
use thiserror::Error;
use znn_rs_kernels::KernelError;

pub mod cube;
pub mod ops;

/// Scalar type of every activation, gradient and weight in the engine.
pub type Real = f64;

/// A 3-D extent or index: `[x, y, z]`.
pub type Vec3i = [usize; 3];

/// A spatial-domain volume.
pub type Cube = Tensor<Real, 3>;

/// A frequency-domain volume.
pub type CCube = Tensor<Complex<Real>, 3>;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A numeric kernel rejected its arguments.
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for real elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory (e.g., `Vec<T>`) and
///   fast element access.
/// - `Num + ...`: Provides necessary numeric operations for tensor math.
/// - `Send + Sync`: Required for parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// The core Tensor struct.
///
/// The element type only needs to be `Copy`; arithmetic is available wherever the element supports
/// it, which is what lets real and complex volumes share one container.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize> {
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: Copy,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of
    /// `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn filled(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor, returning its flat buffer.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the element at a multi-dimensional index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn get(&self, index: [usize; RANK]) -> T {
        self.data[self.offset(index)]
    }

    /// Sets the element at a multi-dimensional index.
    pub fn set(&mut self, index: [usize; RANK], value: T) {
        let offset = self.offset(index);
        self.data[offset] = value;
    }

    fn offset(&self, index: [usize; RANK]) -> usize {
        for d in 0..RANK {
            assert!(
                index[d] < self.shape[d],
                "index {:?} out of bounds for shape {:?}",
                index,
                self.shape
            );
        }
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: Copy + Zero,
{
    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::filled(shape, T::zero())
    }
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::filled(shape, T::one())
    }
}

/// Computes the strides for a given shape.
///
/// Strides represent the number of elements to skip in memory to move to the next element
/// along a specific dimension. This implementation assumes a row-major (C-style) memory layout.
const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}
