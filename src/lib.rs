//! # znn-rs
//!
//! `znn-rs` trains and runs volumetric convolutional networks on the CPU. A network is an explicit
//! dataflow graph: node groups hold activations, edges hold the learnable transforms between them,
//! and every edge schedules its work on a shared thread pool so weight updates overlap the next
//! traversal.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: dense 3-D volumes ([`tensor::Cube`], [`tensor::CCube`]) and their operations.
//! - [`network`]: node groups, edges, the task scheduler and the [`network::Network`] driver.
//! - [`optim`]: the learning rule applied to filter weights.
//!
//! The numeric kernels (sparse convolution, 3-D FFT, max filtering) live in the `znn-rs-kernels`
//! crate and are re-exported as [`kernels`].
//!
//! ## Example
//!
//! ```rust
//! use znn_rs::cube;
//!
//! let x = cube!([1.0, 2.0, 3.0, 4.0], [1, 2, 2]);
//! let w = cube!([1.0], [1, 1, 1]);
//! let y = x.convolve_sparse(&w, [1, 1, 1]).unwrap();
//! assert_eq!(y.data(), x.data());
//! ```

/// Builds a [`tensor::Cube`], checking at compile time that the data fills the shape.
///
/// # Examples
///
/// ```rust
/// use znn_rs::cube;
///
/// // Works
/// let c = cube!([1.0, 2.0, 3.0, 4.0], [2, 2, 1]);
///
/// // Fails to compile:
/// // let c = cube!([1.0, 2.0, 3.0], [2, 2, 1]);
/// ```
#[macro_export]
macro_rules! cube {
    ($data:expr, $shape:expr) => {{
        const DATA_LEN: usize = $data.len();
        const SHAPE: [usize; 3] = $shape;
        const _: () = assert!(
            DATA_LEN == SHAPE[0] * SHAPE[1] * SHAPE[2],
            "Shape mismatch: data length does not match shape product"
        );

        // Safe to unwrap because we checked at compile time
        $crate::tensor::Cube::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod error;
pub mod network;
pub mod optim;
pub mod tensor;

pub use error::{Result, ZnnError};
pub use network::{ConvOptions, Network, NetworkBuilder, NetworkConfig};
pub use tensor::{CCube, Cube, Tensor};
pub use znn_rs_kernels as kernels;
