use crate::tensor::Real;
use serde::{Deserialize, Serialize};

/// Activation applied by transfer nodes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransferFn {
    /// `a * x + b`
    Linear(Real, Real),
    /// `a * tanh(b * x)`
    Tanh(Real, Real),
    Logistic,
    Relu,
}

impl TransferFn {
    pub fn apply(&self, x: Real) -> Real {
        match *self {
            TransferFn::Linear(a, b) => a * x + b,
            TransferFn::Tanh(a, b) => a * (b * x).tanh(),
            TransferFn::Logistic => 1.0 / (1.0 + (-x).exp()),
            TransferFn::Relu => x.max(0.0),
        }
    }

    /// Derivative at the point that produced output `y`.
    pub fn derivative(&self, y: Real) -> Real {
        match *self {
            TransferFn::Linear(a, _) => a,
            TransferFn::Tanh(a, b) => b / a * (a - y) * (a + y),
            TransferFn::Logistic => y * (1.0 - y),
            TransferFn::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_derivative(f: TransferFn, x: Real) {
        let h = 1e-6;
        let numeric = (f.apply(x + h) - f.apply(x - h)) / (2.0 * h);
        let analytic = f.derivative(f.apply(x));
        assert!(
            (numeric - analytic).abs() < 1e-6,
            "{f:?} at {x}: {numeric} vs {analytic}"
        );
    }

    #[test]
    fn test_derivatives_match_finite_difference() {
        for x in [-1.3, -0.2, 0.4, 2.0] {
            check_derivative(TransferFn::Linear(2.0, 0.5), x);
            check_derivative(TransferFn::Tanh(1.7159, 0.6666), x);
            check_derivative(TransferFn::Logistic, x);
            check_derivative(TransferFn::Relu, x);
        }
    }

    #[test]
    fn test_relu() {
        assert_eq!(TransferFn::Relu.apply(-3.0), 0.0);
        assert_eq!(TransferFn::Relu.apply(3.0), 3.0);
        assert_eq!(TransferFn::Relu.derivative(0.0), 0.0);
    }
}
