use crate::{
    check_fits, check_kernel, check_len, check_stride, index, sparse_extent, volume, KernelElem,
    KernelError, Result, Shape3,
};
use rayon::prelude::*;

/// Valid 3-D convolution of `input` with a sparse `kernel`.
///
/// Tap `k` of the kernel is applied at offset `k * stride`, so the kernel spans
/// `(kernel - 1) * stride + 1` voxels along each axis.
///
/// # Arguments
///
/// * `input` - Input volume (flattened, row-major).
/// * `input_shape` - Shape of the input volume.
/// * `kernel` - Compact kernel taps.
/// * `kernel_shape` - Shape of the compact kernel.
/// * `stride` - Sparse stride between neighbouring taps.
///
/// # Returns
///
/// The output volume, of shape `input_shape - extent + 1`, where
/// `out[x] = sum_k input[x + (K - 1 - k) * stride] * kernel[k]`.
pub fn convolve_sparse<T: KernelElem>(
    input: &[T],
    input_shape: Shape3,
    kernel: &[T],
    kernel_shape: Shape3,
    stride: Shape3,
) -> Result<Vec<T>> {
    check_len(input, input_shape)?;
    check_len(kernel, kernel_shape)?;
    check_kernel(kernel_shape)?;
    check_stride(stride)?;

    let extent = sparse_extent(kernel_shape, stride);
    check_fits(extent, input_shape)?;

    let out_shape = [
        input_shape[0] - extent[0] + 1,
        input_shape[1] - extent[1] + 1,
        input_shape[2] - extent[2] + 1,
    ];
    let [kx_n, ky_n, kz_n] = kernel_shape;
    let mut output = vec![T::zero(); volume(out_shape)];

    // Parallelize over output x-slabs
    output
        .par_chunks_mut(out_shape[1] * out_shape[2])
        .enumerate()
        .for_each(|(x, slab)| {
            for y in 0..out_shape[1] {
                for z in 0..out_shape[2] {
                    let mut sum = T::zero();
                    for kx in 0..kx_n {
                        let ix = x + (kx_n - 1 - kx) * stride[0];
                        for ky in 0..ky_n {
                            let iy = y + (ky_n - 1 - ky) * stride[1];
                            for kz in 0..kz_n {
                                let iz = z + (kz_n - 1 - kz) * stride[2];
                                sum += input[index(input_shape, ix, iy, iz)]
                                    * kernel[index(kernel_shape, kx, ky, kz)];
                            }
                        }
                    }
                    slab[y * out_shape[2] + z] = sum;
                }
            }
        });

    Ok(output)
}

/// Transpose of [`convolve_sparse`] (a "full" convolution).
///
/// Scatters every input voxel through the kernel: `out[x + (K - 1 - k) * stride] += input[x] *
/// kernel[k]`. The output is larger than the input by the kernel extent minus one. Used for
/// gradients of a convolution and as the forward pass of a deconvolution.
pub fn convolve_sparse_inverse<T: KernelElem>(
    input: &[T],
    input_shape: Shape3,
    kernel: &[T],
    kernel_shape: Shape3,
    stride: Shape3,
) -> Result<Vec<T>> {
    check_len(input, input_shape)?;
    check_len(kernel, kernel_shape)?;
    check_kernel(kernel_shape)?;
    check_stride(stride)?;

    let extent = sparse_extent(kernel_shape, stride);
    let out_shape = [
        input_shape[0] + extent[0] - 1,
        input_shape[1] + extent[1] - 1,
        input_shape[2] + extent[2] - 1,
    ];
    let [kx_n, ky_n, kz_n] = kernel_shape;
    let mut output = vec![T::zero(); volume(out_shape)];

    // Gather form: each output voxel collects the inputs that scatter into it.
    output
        .par_chunks_mut(out_shape[1] * out_shape[2])
        .enumerate()
        .for_each(|(ox, slab)| {
            for oy in 0..out_shape[1] {
                for oz in 0..out_shape[2] {
                    let mut sum = T::zero();
                    for kx in 0..kx_n {
                        let dx = (kx_n - 1 - kx) * stride[0];
                        if ox < dx || ox - dx >= input_shape[0] {
                            continue;
                        }
                        for ky in 0..ky_n {
                            let dy = (ky_n - 1 - ky) * stride[1];
                            if oy < dy || oy - dy >= input_shape[1] {
                                continue;
                            }
                            for kz in 0..kz_n {
                                let dz = (kz_n - 1 - kz) * stride[2];
                                if oz < dz || oz - dz >= input_shape[2] {
                                    continue;
                                }
                                sum += input[index(input_shape, ox - dx, oy - dy, oz - dz)]
                                    * kernel[index(kernel_shape, kx, ky, kz)];
                            }
                        }
                    }
                    slab[oy * out_shape[2] + oz] = sum;
                }
            }
        });

    Ok(output)
}

/// Kernel gradient of a sparse convolution.
///
/// Returns the compact kernel `r` of shape `(a - b) / stride + 1` with
/// `r[k] = sum_x a[x + (K - 1 - k) * stride] * b[x]`, i.e. the cross-correlation of `a` and `b`
/// sampled at the sparse stride and flipped into convolution orientation.
pub fn convolve_sparse_flipped<T: KernelElem>(
    a: &[T],
    a_shape: Shape3,
    b: &[T],
    b_shape: Shape3,
    stride: Shape3,
) -> Result<Vec<T>> {
    check_len(a, a_shape)?;
    check_len(b, b_shape)?;
    check_kernel(b_shape)?;
    check_stride(stride)?;
    check_fits(b_shape, a_shape)?;

    let diff = [
        a_shape[0] - b_shape[0],
        a_shape[1] - b_shape[1],
        a_shape[2] - b_shape[2],
    ];
    if (0..3).any(|d| diff[d] % stride[d] != 0) {
        return Err(KernelError::NotDivisible {
            shape: diff,
            divisor: stride,
        });
    }

    let out_shape = [
        diff[0] / stride[0] + 1,
        diff[1] / stride[1] + 1,
        diff[2] / stride[2] + 1,
    ];
    let mut output = vec![T::zero(); volume(out_shape)];

    output
        .par_chunks_mut(out_shape[1] * out_shape[2])
        .enumerate()
        .for_each(|(kx, slab)| {
            let ox = (out_shape[0] - 1 - kx) * stride[0];
            for ky in 0..out_shape[1] {
                let oy = (out_shape[1] - 1 - ky) * stride[1];
                for kz in 0..out_shape[2] {
                    let oz = (out_shape[2] - 1 - kz) * stride[2];
                    let mut sum = T::zero();
                    for x in 0..b_shape[0] {
                        for y in 0..b_shape[1] {
                            for z in 0..b_shape[2] {
                                sum += a[index(a_shape, x + ox, y + oy, z + oz)]
                                    * b[index(b_shape, x, y, z)];
                            }
                        }
                    }
                    slab[ky * out_shape[2] + kz] = sum;
                }
            }
        });

    Ok(output)
}
