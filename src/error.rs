//! Error type
use crate::features::{CollateError, DecodeError, FeatureStoreError, NegativeStreamError};
use crate::logging::LogError;
use crate::torch::optimizers::OptimizerStepError;
use crate::torch::updaters::UpdateError;
use tch::TchError;
use thiserror::Error;

/// Error from the waypoint PPO crate.
///
/// Every module error converts into it with `?`. Returned by
/// [`PpoConfig::build_ppo_with_negatives`](crate::PpoConfig::build_ppo_with_negatives).
#[derive(Error, Debug)]
pub enum WaypointError {
    #[error("feature store error")]
    FeatureStore(#[from] FeatureStoreError),
    #[error("error decoding feature record")]
    Decode(#[from] DecodeError),
    #[error("error collating negative features")]
    Collate(#[from] CollateError),
    #[error("negative feature stream error")]
    NegativeStream(#[from] NegativeStreamError),
    #[error("optimizer step error")]
    OptimizerStep(#[from] OptimizerStepError),
    #[error("policy update error")]
    Update(#[from] UpdateError),
    #[error("logging error")]
    Log(#[from] LogError),
    #[error("torch error")]
    Torch(#[from] TchError),
}
