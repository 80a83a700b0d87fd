use super::Optimizer;
use crate::tensor::{Cube, Real, Result, TensorError};
use rayon::prelude::*;

/// Stochastic Gradient Descent with momentum and weight decay.
///
/// Updates parameters using the rule:
/// `v = momentum * v - (learning_rate / patch_size) * grad`
/// `param = (1 - weight_decay * learning_rate) * param + v`
#[derive(Clone, Debug)]
pub struct Sgd {
    pub learning_rate: Real,
    pub momentum: Real,
    pub weight_decay: Real,
    velocity: Option<Cube>,
}

impl Sgd {
    pub fn new(learning_rate: Real) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity: None,
        }
    }

    pub fn with_momentum(mut self, momentum: Real) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: Real) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, param: &mut Cube, grad: &Cube, patch_size: Real) -> Result<()> {
        if param.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: param.shape().to_vec(),
                got: grad.shape().to_vec(),
            });
        }

        let step = if patch_size > 0.0 {
            self.learning_rate / patch_size
        } else {
            self.learning_rate
        };
        let decay = 1.0 - self.weight_decay * self.learning_rate;
        let momentum = self.momentum;

        let velocity = self
            .velocity
            .get_or_insert_with(|| Cube::zeros(*param.shape()));
        if velocity.shape() != param.shape() {
            *velocity = Cube::zeros(*param.shape());
        }

        param
            .data_mut()
            .par_iter_mut()
            .zip(velocity.data_mut().par_iter_mut())
            .zip(grad.data().par_iter())
            .for_each(|((p, v), g)| {
                *v = momentum * *v - step * *g;
                *p = decay * *p + *v;
            });

        Ok(())
    }

    fn learning_rate(&self) -> Real {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: Real) {
        self.learning_rate = learning_rate;
    }

    fn set_momentum(&mut self, momentum: Real) {
        self.momentum = momentum;
    }
}
