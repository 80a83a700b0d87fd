//! Learning rules applied by [`Filter::update`](crate::network::filter::Filter::update).

pub mod sgd;
pub use sgd::Sgd;

use crate::tensor::{Cube, Real, Result};

/// A rule that turns a weight gradient into a weight change.
pub trait Optimizer: Send {
    /// Applies one step of the rule to `param`, given its gradient.
    ///
    /// `patch_size` normalises the gradient by the number of output voxels that contributed to it;
    /// `0` disables the normalisation.
    ///
    /// # Errors
    ///
    /// Returns an error if `param` and `grad` differ in shape.
    fn update(&mut self, param: &mut Cube, grad: &Cube, patch_size: Real) -> Result<()>;

    fn learning_rate(&self) -> Real;

    fn set_learning_rate(&mut self, learning_rate: Real);

    fn set_momentum(&mut self, momentum: Real);
}
