//! Optimizers
mod coptimizer;

pub use coptimizer::{AdamConfig, AdamWConfig, OptimizerConfig, RmsPropConfig, SgdConfig};

use std::error::Error;
use tch::{nn::VarStore, TchError, Tensor};
use thiserror::Error;

/// Base optimizer interface
pub trait BaseOptimizer {
    /// Zero out the gradients of all optimized tensors
    fn zero_grad(&mut self) -> Result<(), OptimizerStepError>;
}

/// Optimizer that minimizes a loss tensor using a single gradient evaluation per step.
///
/// The zero-grad, backward and step phases are exposed separately so that callers can run
/// hooks between them.
pub trait OnceOptimizer: BaseOptimizer {
    /// Perform a loss minimization step (parameter update).
    ///
    /// Uses the existing gradients stored with the parameter tensors.
    ///
    /// Error conditions are not guaranteed to be detected.
    /// For example, [`COptimizer`] sets parameters to NaN when the loss is NaN.
    ///
    /// [`COptimizer`]: tch::COptimizer
    fn step_once(&mut self) -> Result<(), OptimizerStepError>;

    /// Zero the gradients, backpropagate `loss` and take an optimization step.
    ///
    /// A NaN loss is rejected before any gradients are computed.
    fn backward_step_once(&mut self, loss: &Tensor) -> Result<(), OptimizerStepError> {
        if loss.double_value(&[]).is_nan() {
            return Err(OptimizerStepError::NaNLoss);
        }
        self.zero_grad()?;
        loss.backward();
        self.step_once()
    }
}

/// Error performing an optimization step.
#[derive(Debug, Error)]
pub enum OptimizerStepError {
    #[error("loss is NaN")]
    NaNLoss,
    #[error(transparent)]
    Torch(#[from] TchError),
}

/// Build an optimizer
pub trait BuildOptimizer {
    type Optimizer;
    type Error: Error;

    /// Build an optimizer for the trainable variables in a variable store.
    fn build_optimizer(&self, vs: &VarStore) -> Result<Self::Optimizer, Self::Error>;
}

#[cfg(test)]
mod testing {
    use super::*;
    use tch::Device;

    pub fn check_optimizes_quadratic<OC>(optimizer_config: &OC, num_steps: u64)
    where
        OC: BuildOptimizer,
        OC::Optimizer: OnceOptimizer,
    {
        // Minimize f(x) = 1/2*x'Mx + b'x
        // with M = [1  -1]  b = [ 2]
        //          [-1  2]      [-3]
        //
        // which is minimized at x = [-1  1]'
        let m = Tensor::of_slice(&[1.0_f32, -1.0, -1.0, 2.0]).reshape(&[2, 2]);
        let b = Tensor::of_slice(&[2.0_f32, -3.0]);

        let vs = VarStore::new(Device::Cpu);
        let x = vs.root().zeros("x", &[2]);
        let mut optimizer = optimizer_config.build_optimizer(&vs).unwrap();

        for _ in 0..num_steps {
            let loss = m.mv(&x).dot(&x) / 2 + b.dot(&x);
            optimizer.backward_step_once(&loss).unwrap();
        }

        let expected = Tensor::of_slice(&[-1.0, 1.0]);
        assert!(
            f64::from((&x - &expected).norm()) < 1e-3,
            "expected: {:?}, actual: {:?}",
            expected,
            x
        );
    }
}
