//! Advantage estimation from rollout returns.
use super::rollout::RolloutSource;
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

/// Added to the standard deviation when normalizing advantages.
pub const ADVANTAGE_EPS: f64 = 1e-5;

/// Computes advantages as returns minus value predictions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvantageEstimator {
    /// Standardize the advantages over all steps and environments jointly.
    pub normalize: bool,
}

impl Default for AdvantageEstimator {
    fn default() -> Self {
        Self { normalize: true }
    }
}

impl AdvantageEstimator {
    pub const fn new(normalize: bool) -> Self {
        Self { normalize }
    }

    /// Advantage of every rollout step; `(num_steps, num_envs, ...)`.
    ///
    /// Normalization uses the population standard deviation plus [`ADVANTAGE_EPS`] so a constant
    /// advantage normalizes to zero.
    pub fn compute<R: RolloutSource + ?Sized>(&self, rollouts: &R) -> Tensor {
        let returns = rollouts.returns();
        let num_steps = returns.size()[0] - 1;
        let advantages =
            returns.narrow(0, 0, num_steps) - rollouts.value_preds().narrow(0, 0, num_steps);
        if !self.normalize {
            return advantages;
        }
        let mean = advantages.mean(Kind::Float);
        let std = advantages.std(false);
        (advantages - mean) / (std + ADVANTAGE_EPS)
    }
}
