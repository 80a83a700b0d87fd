use crate::optim::{Optimizer, Sgd};
use crate::tensor::{Cube, Real, Result, Tensor, Vec3i};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A learnable weight volume together with its learning-rule state.
#[derive(Debug)]
pub struct Filter {
    weights: Cube,
    rule: Sgd,
}

/// A filter reachable from one edge, or from several tied edges.
pub type SharedFilter = Arc<Mutex<Filter>>;

impl Filter {
    pub fn new(weights: Cube, eta: Real, momentum: Real, weight_decay: Real) -> Self {
        Self {
            weights,
            rule: Sgd::new(eta)
                .with_momentum(momentum)
                .with_weight_decay(weight_decay),
        }
    }

    pub fn shared(self) -> SharedFilter {
        Arc::new(Mutex::new(self))
    }

    pub fn weights(&self) -> &Cube {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Cube {
        &mut self.weights
    }

    /// Applies one gradient step (with momentum and weight decay) to the weights.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `gradient` is not shaped like the weights.
    pub fn update(&mut self, gradient: &Cube, patch_size: Real) -> Result<()> {
        self.rule.update(&mut self.weights, gradient, patch_size)
    }

    pub fn eta(&self) -> Real {
        self.rule.learning_rate()
    }

    pub fn set_eta(&mut self, eta: Real) {
        self.rule.set_learning_rate(eta);
    }

    pub fn set_momentum(&mut self, momentum: Real) {
        self.rule.set_momentum(momentum);
    }
}

/// How the weights of a new filter are filled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FilterInit {
    Constant(Real),
    /// Independent draws from `[low, high]`. Every filter of a network draws from its own stream,
    /// derived from `seed`, its group and its index in the group.
    Uniform { low: Real, high: Real, seed: u64 },
}

impl Default for FilterInit {
    fn default() -> Self {
        FilterInit::Uniform {
            low: -0.1,
            high: 0.1,
            seed: 0,
        }
    }
}

impl FilterInit {
    /// Fills a cube of `shape`. `stream` picks the random stream of a uniform init.
    pub fn cube(&self, shape: Vec3i, stream: u64) -> Cube {
        match *self {
            FilterInit::Constant(value) => Tensor::filled(shape, value),
            FilterInit::Uniform { low, high, seed } => {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(stream));
                let mut cube = Cube::zeros(shape);
                for w in cube.data_mut() {
                    *w = rng.random_range(low..=high);
                }
                cube
            }
        }
    }
}
