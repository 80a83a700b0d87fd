//! 3-D discrete Fourier transforms.
//!
//! The 3-D transform is separable: it is computed as 1-D `rustfft` transforms along `z`
//! (contiguous lines), then `y`, then `x`. Lines are processed in parallel with `rayon`.
//!
//! Conventions follow FFTW: the forward transform is unnormalised and so is
//! [`fft_inverse`] / [`fft_backward_raw`]; [`fft_backward`] divides by the element count so that
//! `fft_backward(fft_forward(x)) == x` up to rounding.

use crate::{check_len, volume, Result, Shape3};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{FftDirection, FftNum, FftPlanner};

fn transform<T: FftNum>(buf: &mut [Complex<T>], shape: Shape3, direction: FftDirection) {
    let [n0, n1, n2] = shape;
    if volume(shape) == 0 {
        return;
    }
    let mut planner = FftPlanner::<T>::new();

    // z: contiguous lines
    if n2 > 1 {
        let fft = planner.plan_fft(n2, direction);
        buf.par_chunks_mut(n2).for_each(|line| fft.process(line));
    }

    // y: strided lines inside each x-slab
    if n1 > 1 {
        let fft = planner.plan_fft(n1, direction);
        buf.par_chunks_mut(n1 * n2).for_each(|slab| {
            let mut line = vec![Complex::new(T::zero(), T::zero()); n1];
            for z in 0..n2 {
                for (y, v) in line.iter_mut().enumerate() {
                    *v = slab[y * n2 + z];
                }
                fft.process(&mut line);
                for (y, v) in line.iter().enumerate() {
                    slab[y * n2 + z] = *v;
                }
            }
        });
    }

    // x: one line per (y, z) position, gathered across slabs
    if n0 > 1 {
        let fft = planner.plan_fft(n0, direction);
        let plane = n1 * n2;
        let lines: Vec<Vec<Complex<T>>> = {
            let src = &*buf;
            (0..plane)
                .into_par_iter()
                .map(|p| {
                    let mut line: Vec<Complex<T>> = (0..n0).map(|x| src[x * plane + p]).collect();
                    fft.process(&mut line);
                    line
                })
                .collect()
        };
        for (p, line) in lines.into_iter().enumerate() {
            for (x, v) in line.into_iter().enumerate() {
                buf[x * plane + p] = v;
            }
        }
    }
}

/// Forward transform of a real volume.
pub fn fft_forward<T: FftNum>(data: &[T], shape: Shape3) -> Result<Vec<Complex<T>>> {
    check_len(data, shape)?;
    let mut buf: Vec<Complex<T>> = data.iter().map(|&v| Complex::new(v, T::zero())).collect();
    transform(&mut buf, shape, FftDirection::Forward);
    Ok(buf)
}

/// Unnormalised inverse transform of a complex volume.
pub fn fft_inverse<T: FftNum>(data: &[Complex<T>], shape: Shape3) -> Result<Vec<Complex<T>>> {
    check_len(data, shape)?;
    let mut buf = data.to_vec();
    transform(&mut buf, shape, FftDirection::Inverse);
    Ok(buf)
}

/// Unnormalised inverse transform, keeping the real part.
///
/// The result is `volume(shape)` times larger than the original signal.
pub fn fft_backward_raw<T: FftNum>(data: &[Complex<T>], shape: Shape3) -> Result<Vec<T>> {
    Ok(fft_inverse(data, shape)?.into_iter().map(|c| c.re).collect())
}

/// Normalised inverse transform, keeping the real part.
pub fn fft_backward<T: FftNum>(data: &[Complex<T>], shape: Shape3) -> Result<Vec<T>> {
    let n = T::from_usize(volume(shape)).unwrap_or_else(T::one);
    let mut out = fft_backward_raw(data, shape)?;
    out.par_iter_mut().for_each(|v| *v = *v / n);
    Ok(out)
}
