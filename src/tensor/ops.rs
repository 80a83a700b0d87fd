use super::{Result, Tensor, TensorError};
use rayon::prelude::*;
use std::ops::{Add, AddAssign, Div, Mul, Sub};

// Elementwise binary operators on borrowed tensors. Shapes must match exactly.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: Copy + Send + Sync + $trait<Output = T>,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let data = self
                    .data
                    .par_iter()
                    .zip(rhs.data.par_iter())
                    .map(|(a, b)| a.$method(*b))
                    .collect();

                Ok(Tensor {
                    shape: self.shape,
                    strides: self.strides,
                    data,
                })
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: Copy + Send + Sync,
{
    /// Applies a function element-wise.
    pub fn map<U, F>(&self, f: F) -> Tensor<U, RANK>
    where
        U: Copy + Send,
        F: Fn(T) -> U + Sync + Send,
    {
        Tensor {
            shape: self.shape,
            strides: self.strides,
            data: self.data.par_iter().map(|v| f(*v)).collect(),
        }
    }

    /// Applies a function element-wise, in place.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(T) -> T + Sync + Send,
    {
        self.data.par_iter_mut().for_each(|v| *v = f(*v));
    }

    /// Adds `rhs` into `self`.
    pub fn add_assign(&mut self, rhs: &Self) -> Result<()>
    where
        T: AddAssign,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        self.data
            .par_iter_mut()
            .zip(rhs.data.par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }

    /// Multiplies every element by `factor`, in place.
    pub fn scale<S>(&mut self, factor: S)
    where
        S: Copy + Send + Sync,
        T: Mul<S, Output = T>,
    {
        self.data.par_iter_mut().for_each(|v| *v = *v * factor);
    }
}
