//! Volume operations on [`Cube`] and [`CCube`], backed by `znn-rs-kernels`.

use super::{CCube, Cube, Real, Result, Tensor, Vec3i};
use znn_rs_kernels as kernels;

impl Cube {
    /// Valid convolution with a sparse kernel (taps `stride` apart).
    pub fn convolve_sparse(&self, kernel: &Cube, stride: Vec3i) -> Result<Cube> {
        let out = kernels::convolve_sparse(
            self.data(),
            self.shape,
            kernel.data(),
            kernel.shape,
            stride,
        )?;
        let extent = kernels::sparse_extent(kernel.shape, stride);
        Tensor::new(
            out,
            [
                self.shape[0] - extent[0] + 1,
                self.shape[1] - extent[1] + 1,
                self.shape[2] - extent[2] + 1,
            ],
        )
    }

    /// Transpose of [`Cube::convolve_sparse`]; the output grows by the kernel extent minus one.
    pub fn convolve_sparse_inverse(&self, kernel: &Cube, stride: Vec3i) -> Result<Cube> {
        let out = kernels::convolve_sparse_inverse(
            self.data(),
            self.shape,
            kernel.data(),
            kernel.shape,
            stride,
        )?;
        let extent = kernels::sparse_extent(kernel.shape, stride);
        Tensor::new(
            out,
            [
                self.shape[0] + extent[0] - 1,
                self.shape[1] + extent[1] - 1,
                self.shape[2] + extent[2] - 1,
            ],
        )
    }

    /// Kernel gradient of a sparse convolution of `self` producing an output shaped like `other`.
    pub fn convolve_sparse_flipped(&self, other: &Cube, stride: Vec3i) -> Result<Cube> {
        let out = kernels::convolve_sparse_flipped(
            self.data(),
            self.shape,
            other.data(),
            other.shape,
            stride,
        )?;
        Tensor::new(
            out,
            [
                (self.shape[0] - other.shape[0]) / stride[0] + 1,
                (self.shape[1] - other.shape[1]) / stride[1] + 1,
                (self.shape[2] - other.shape[2]) / stride[2] + 1,
            ],
        )
    }

    /// Spreads this compact kernel into a zero volume of shape `target`.
    pub fn sparse_explode(&self, stride: Vec3i, target: Vec3i) -> Result<Cube> {
        let out = kernels::sparse_explode(self.data(), self.shape, stride, target)?;
        Tensor::new(out, target)
    }

    /// Picks the taps at multiples of `stride` back out into a compact kernel.
    pub fn sparse_implode(&self, stride: Vec3i, compact: Vec3i) -> Result<Cube> {
        let out = kernels::sparse_implode(self.data(), self.shape, stride, compact)?;
        Tensor::new(out, compact)
    }

    /// Reverses the volume along all three axes.
    pub fn flip(&mut self) {
        kernels::flip(self.data_mut());
    }

    /// Averages the volume over blocks of `repeat`.
    pub fn flatten(&mut self, repeat: Vec3i) -> Result<()> {
        let shape = self.shape;
        kernels::flatten(self.data_mut(), shape, repeat)?;
        Ok(())
    }

    /// Zero-pads the volume (anchored at the origin) up to `target`.
    pub fn pad(&self, target: Vec3i) -> Result<Cube> {
        let out = kernels::pad_zeros(self.data(), self.shape, target, 0.0)?;
        Tensor::new(out, target)
    }

    /// Extracts the sub-volume of shape `shape` starting at `offset`.
    pub fn crop(&self, offset: Vec3i, shape: Vec3i) -> Result<Cube> {
        let out = kernels::crop(self.data(), self.shape, offset, shape)?;
        Tensor::new(out, shape)
    }

    /// Extracts the trailing sub-volume of shape `shape` (the valid region of a full convolution).
    pub fn crop_trailing(&self, shape: Vec3i) -> Result<Cube> {
        let offset = [
            self.shape[0].saturating_sub(shape[0]),
            self.shape[1].saturating_sub(shape[1]),
            self.shape[2].saturating_sub(shape[2]),
        ];
        self.crop(offset, shape)
    }

    /// Sliding max filter; also returns the winning input index of every output voxel.
    pub fn max_filter(&self, window: Vec3i, stride: Vec3i) -> Result<(Cube, Vec<usize>)> {
        let (out, winners) = kernels::max_filter_sparse(self.data(), self.shape, window, stride)?;
        let extent = kernels::sparse_extent(window, stride);
        let shape = [
            self.shape[0] - extent[0] + 1,
            self.shape[1] - extent[1] + 1,
            self.shape[2] - extent[2] + 1,
        ];
        Ok((Tensor::new(out, shape)?, winners))
    }

    /// Routes this gradient back through a max filter whose input had shape `input_shape`.
    pub fn max_filter_backward(&self, winners: &[usize], input_shape: Vec3i) -> Result<Cube> {
        let out = kernels::max_filter_sparse_backward(self.data(), winners, input_shape)?;
        Tensor::new(out, input_shape)
    }

    /// Forward 3-D Fourier transform.
    pub fn fft(&self) -> Result<CCube> {
        let out = kernels::fft_forward(self.data(), self.shape)?;
        Tensor::new(out, self.shape)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> Real {
        self.data().iter().sum()
    }
}

impl CCube {
    /// Normalised inverse transform: `x.fft()?.ifft()? == x` up to rounding.
    pub fn ifft(&self) -> Result<Cube> {
        let out = kernels::fft_backward(self.data(), self.shape)?;
        Tensor::new(out, self.shape)
    }

    /// Unnormalised inverse transform; the result is scaled by the element count.
    pub fn ifft_raw(&self) -> Result<Cube> {
        let out = kernels::fft_backward_raw(self.data(), self.shape)?;
        Tensor::new(out, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Vec3i) -> Cube {
        let n = shape[0] * shape[1] * shape[2];
        Tensor::new((0..n).map(|i| ((i * 5 % 7) as Real) - 3.0).collect(), shape).unwrap()
    }

    #[test]
    fn test_explode_implode_roundtrip() {
        let w = ramp([3, 2, 2]);
        let stride = [2, 3, 1];
        let exploded = w.sparse_explode(stride, [6, 5, 4]).unwrap();
        let back = exploded.sparse_implode(stride, [3, 2, 2]).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_fft_roundtrip() {
        let x = ramp([5, 4, 3]);
        let back = x.fft().unwrap().ifft().unwrap();
        for (a, b) in x.data().iter().zip(back.data()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_frequency_product_matches_valid_convolution() {
        // ifft(fft(x) * fft(explode(w))) cropped to the trailing region is the valid convolution
        let x = ramp([6, 5, 4]);
        let w = ramp([2, 2, 2]);
        let stride = [2, 1, 2];
        let direct = x.convolve_sparse(&w, stride).unwrap();

        let w_fft = w.sparse_explode(stride, *x.shape()).unwrap().fft().unwrap();
        let product = (&x.fft().unwrap() * &w_fft).unwrap();
        let full = product.ifft().unwrap();
        let valid = full.crop_trailing(*direct.shape()).unwrap();

        for (a, b) in direct.data().iter().zip(valid.data()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_convolve_shapes() {
        let x = Cube::ones([7, 7, 3]);
        let w = Cube::ones([3, 3, 1]);
        let y = x.convolve_sparse(&w, [2, 1, 1]).unwrap();
        assert_eq!(y.shape(), &[3, 5, 3]);
        let back = y.convolve_sparse_inverse(&w, [2, 1, 1]).unwrap();
        assert_eq!(back.shape(), x.shape());
        let grad = x.convolve_sparse_flipped(&y, [2, 1, 1]).unwrap();
        assert_eq!(grad.shape(), w.shape());
    }

    #[test]
    fn test_crop_trailing() {
        let x = ramp([3, 3, 1]);
        let c = x.crop_trailing([2, 2, 1]).unwrap();
        assert_eq!(
            c.data(),
            &[
                x.get([1, 1, 0]),
                x.get([1, 2, 0]),
                x.get([2, 1, 0]),
                x.get([2, 2, 0])
            ]
        );
    }
}
