//! Dilation and layout helpers.
//!
//! A *sparse* (dilated) kernel keeps its taps in a compact cube; applying it with stride `s`
//! places tap `k` at offset `k * s`. `sparse_explode` materialises that placement inside a larger
//! zero volume (so it can be transformed to the frequency domain), and `sparse_implode` is its
//! inverse, picking the taps back out.

use crate::{
    check_fits, check_kernel, check_len, check_stride, index, sparse_extent, volume, KernelElem,
    KernelError, Result, Shape3,
};
use rayon::prelude::*;

/// Spreads a compact kernel into a zero volume of shape `target`, tap `k` landing at `k * stride`.
pub fn sparse_explode<T: KernelElem>(
    kernel: &[T],
    kernel_shape: Shape3,
    stride: Shape3,
    target: Shape3,
) -> Result<Vec<T>> {
    check_len(kernel, kernel_shape)?;
    check_kernel(kernel_shape)?;
    check_stride(stride)?;
    check_fits(sparse_extent(kernel_shape, stride), target)?;

    let mut out = vec![T::zero(); volume(target)];
    for x in 0..kernel_shape[0] {
        for y in 0..kernel_shape[1] {
            for z in 0..kernel_shape[2] {
                out[index(target, x * stride[0], y * stride[1], z * stride[2])] =
                    kernel[index(kernel_shape, x, y, z)];
            }
        }
    }
    Ok(out)
}

/// Collects the taps at `k * stride` of `expanded` back into a compact kernel of `compact` shape.
pub fn sparse_implode<T: KernelElem>(
    expanded: &[T],
    expanded_shape: Shape3,
    stride: Shape3,
    compact: Shape3,
) -> Result<Vec<T>> {
    check_len(expanded, expanded_shape)?;
    check_kernel(compact)?;
    check_stride(stride)?;
    check_fits(sparse_extent(compact, stride), expanded_shape)?;

    let mut out = vec![T::zero(); volume(compact)];
    for x in 0..compact[0] {
        for y in 0..compact[1] {
            for z in 0..compact[2] {
                out[index(compact, x, y, z)] =
                    expanded[index(expanded_shape, x * stride[0], y * stride[1], z * stride[2])];
            }
        }
    }
    Ok(out)
}

/// Reverses a volume along all three axes.
///
/// In row-major layout this is exactly a reversal of the flat buffer.
pub fn flip<T>(data: &mut [T]) {
    data.reverse();
}

/// Makes a volume piecewise constant over blocks of `repeat`, each block replaced by its mean.
///
/// With `repeat == [1, 1, 1]` this is the identity.
pub fn flatten<T: KernelElem>(data: &mut [T], shape: Shape3, repeat: Shape3) -> Result<()> {
    check_len(data, shape)?;
    check_stride(repeat)?;
    if (0..3).any(|d| shape[d] % repeat[d] != 0) {
        return Err(KernelError::NotDivisible {
            shape,
            divisor: repeat,
        });
    }
    if repeat == [1, 1, 1] {
        return Ok(());
    }

    let count = T::from_usize(volume(repeat)).ok_or_else(|| KernelError::ShapeMismatch {
        expected: repeat.to_vec(),
        got: shape.to_vec(),
    })?;

    for bx in (0..shape[0]).step_by(repeat[0]) {
        for by in (0..shape[1]).step_by(repeat[1]) {
            for bz in (0..shape[2]).step_by(repeat[2]) {
                let mut sum = T::zero();
                for x in bx..bx + repeat[0] {
                    for y in by..by + repeat[1] {
                        for z in bz..bz + repeat[2] {
                            sum += data[index(shape, x, y, z)];
                        }
                    }
                }
                let mean = sum / count;
                for x in bx..bx + repeat[0] {
                    for y in by..by + repeat[1] {
                        for z in bz..bz + repeat[2] {
                            data[index(shape, x, y, z)] = mean;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Copies `data` into the origin corner of a zero volume of shape `target`.
pub fn pad_zeros<T: Copy + Send + Sync>(
    data: &[T],
    shape: Shape3,
    target: Shape3,
    zero: T,
) -> Result<Vec<T>> {
    check_len(data, shape)?;
    check_fits(shape, target)?;

    let mut out = vec![zero; volume(target)];
    out.par_chunks_mut(target[1] * target[2])
        .take(shape[0])
        .enumerate()
        .for_each(|(x, slab)| {
            for y in 0..shape[1] {
                let src = index(shape, x, y, 0);
                let dst = y * target[2];
                slab[dst..dst + shape[2]].copy_from_slice(&data[src..src + shape[2]]);
            }
        });
    Ok(out)
}

/// Extracts the sub-volume of shape `out_shape` starting at `offset`.
pub fn crop<T: Copy + Send + Sync>(
    data: &[T],
    shape: Shape3,
    offset: Shape3,
    out_shape: Shape3,
) -> Result<Vec<T>> {
    check_len(data, shape)?;
    let reach = [
        offset[0] + out_shape[0],
        offset[1] + out_shape[1],
        offset[2] + out_shape[2],
    ];
    check_fits(reach, shape)?;

    let mut out = Vec::with_capacity(volume(out_shape));
    for x in 0..out_shape[0] {
        for y in 0..out_shape[1] {
            let src = index(shape, x + offset[0], y + offset[1], offset[2]);
            out.extend_from_slice(&data[src..src + out_shape[2]]);
        }
    }
    Ok(out)
}
