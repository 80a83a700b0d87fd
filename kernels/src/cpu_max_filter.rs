use crate::{
    check_fits, check_kernel, check_len, check_stride, index, sparse_extent, volume, KernelElem,
    KernelError, Result, Shape3,
};
use rayon::prelude::*;

/// Sliding-window max filter with a sparse stride.
///
/// Every output voxel `x` is the maximum of `input[x + k * stride]` over the `window` taps `k`.
/// The output shape is `input_shape - (window - 1) * stride`.
///
/// # Returns
///
/// The filtered volume together with, for every output voxel, the flat index into `input` of the
/// element that won. The index map is what [`max_filter_sparse_backward`] uses to route gradients.
pub fn max_filter_sparse<T: KernelElem>(
    input: &[T],
    input_shape: Shape3,
    window: Shape3,
    stride: Shape3,
) -> Result<(Vec<T>, Vec<usize>)> {
    check_len(input, input_shape)?;
    check_stride(stride)?;
    check_kernel(window)?;

    let extent = sparse_extent(window, stride);
    check_fits(extent, input_shape)?;

    let out_shape = [
        input_shape[0] - extent[0] + 1,
        input_shape[1] - extent[1] + 1,
        input_shape[2] - extent[2] + 1,
    ];
    let plane = out_shape[1] * out_shape[2];
    let mut values = vec![T::zero(); volume(out_shape)];
    let mut winners = vec![0usize; volume(out_shape)];

    values
        .par_chunks_mut(plane)
        .zip(winners.par_chunks_mut(plane))
        .enumerate()
        .for_each(|(x, (value_slab, winner_slab))| {
            for y in 0..out_shape[1] {
                for z in 0..out_shape[2] {
                    let mut best = index(input_shape, x, y, z);
                    for kx in 0..window[0] {
                        for ky in 0..window[1] {
                            for kz in 0..window[2] {
                                let i = index(
                                    input_shape,
                                    x + kx * stride[0],
                                    y + ky * stride[1],
                                    z + kz * stride[2],
                                );
                                if input[i] > input[best] {
                                    best = i;
                                }
                            }
                        }
                    }
                    value_slab[y * out_shape[2] + z] = input[best];
                    winner_slab[y * out_shape[2] + z] = best;
                }
            }
        });

    Ok((values, winners))
}

/// Routes `grad` back through a max filter: every gradient element is added to the input position
/// recorded in `winners`. Positions that never won receive zero.
pub fn max_filter_sparse_backward<T: KernelElem>(
    grad: &[T],
    winners: &[usize],
    input_shape: Shape3,
) -> Result<Vec<T>> {
    if grad.len() != winners.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![winners.len()],
            got: vec![grad.len()],
        });
    }
    let len = volume(input_shape);
    let mut out = vec![T::zero(); len];
    for (&g, &w) in grad.iter().zip(winners) {
        if w >= len {
            return Err(KernelError::ShapeMismatch {
                expected: vec![len],
                got: vec![w],
            });
        }
        out[w] += g;
    }
    Ok(out)
}
