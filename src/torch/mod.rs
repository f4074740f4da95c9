//! Torch components
pub mod actor_critic;
pub mod advantages;
pub mod optimizers;
pub mod rollout;
#[cfg(test)]
pub(crate) mod testing;
pub mod updaters;

pub use actor_critic::{ActionBatch, ActorCritic, EntropyTerms, Evaluation, ObservationBatch};
pub use advantages::AdvantageEstimator;
pub use optimizers::{BuildOptimizer, OnceOptimizer, OptimizerConfig};
pub use rollout::{RecurrentMinibatch, RolloutSource, RolloutStorage, RolloutStorageConfig};
pub use updaters::{PpoConfig, UpdateHooks, WaypointPpo};
