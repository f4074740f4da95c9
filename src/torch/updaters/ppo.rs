//! Proximal policy optimization for waypoint actor-critics.
use super::super::actor_critic::ActorCritic;
use super::super::advantages::AdvantageEstimator;
use super::super::optimizers::{
    AdamConfig, BuildOptimizer, OnceOptimizer, OptimizerConfig, OptimizerStepError,
};
use super::super::rollout::{RecurrentMinibatch, RolloutSource};
use super::{ClipGradNorm, UpdateHooks, UpdateStats};
use crate::error::WaypointError;
use crate::features::{NegativeLoaderConfig, NegativeSource, NegativeStreamError};
use crate::logging::{LogError, ScopedLogger, StatsLogger};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tch::{nn::VarStore, COptimizer, Kind, Reduction, TchError, Tensor};

/// Configuration for [`WaypointPpo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    /// Likelihood ratio and value clipping distance.
    pub clip_param: f64,
    /// Number of passes over the rollout per update.
    pub ppo_epoch: usize,
    /// Number of minibatches per pass.
    pub num_mini_batch: usize,
    pub value_loss_coef: f64,
    /// Scale of the combined entropy bonus.
    pub entropy_coef: f64,
    pub use_clipped_value_loss: bool,
    pub use_normalized_advantage: bool,
    /// Clip the global gradient norm to this value before each step.
    pub max_grad_norm: Option<f64>,
    /// Scale of the L1 penalty on continuous offsets.
    pub offset_regularize_coef: f64,
    pub pano_entropy_coef: f64,
    pub offset_entropy_coef: f64,
    pub distance_entropy_coef: f64,
    pub optimizer: OptimizerConfig,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            clip_param: 0.2,
            ppo_epoch: 4,
            num_mini_batch: 2,
            value_loss_coef: 0.5,
            entropy_coef: 0.01,
            use_clipped_value_loss: true,
            use_normalized_advantage: true,
            max_grad_norm: Some(0.5),
            offset_regularize_coef: 0.0,
            pano_entropy_coef: 1.0,
            offset_entropy_coef: 1.0,
            distance_entropy_coef: 1.0,
            optimizer: OptimizerConfig::Adam(AdamConfig {
                learning_rate: 2.5e-4,
                ..AdamConfig::default()
            }),
        }
    }
}

impl PpoConfig {
    /// Build an updater for the trainable variables of `vs`.
    ///
    /// Gradient clipping is installed as a hook if `max_grad_norm` is set.
    pub fn build_ppo(
        &self,
        vs: &VarStore,
    ) -> Result<WaypointPpo<COptimizer, Option<ClipGradNorm>>, TchError> {
        let optimizer = self.optimizer.build_optimizer(vs)?;
        let hooks = self
            .max_grad_norm
            .map(|max_norm| ClipGradNorm::new(vs.trainable_variables(), max_norm));
        Ok(WaypointPpo::new(self.clone(), optimizer, hooks))
    }

    /// Build an updater that joins every minibatch with negatives from a new loader.
    pub fn build_ppo_with_negatives(
        &self,
        vs: &VarStore,
        negatives: &NegativeLoaderConfig,
    ) -> Result<WaypointPpo<COptimizer, Option<ClipGradNorm>>, WaypointError> {
        let loader = negatives.build_loader()?;
        Ok(self.build_ppo(vs)?.with_negatives(Box::new(loader)))
    }
}

/// Error performing a policy update.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to obtain negative features")]
    Negatives(#[from] NegativeStreamError),
    #[error("optimizer step failed")]
    Optimizer(#[from] OptimizerStepError),
    #[error("failed to log update statistics")]
    Log(#[from] LogError),
}

/// Loss terms of one minibatch.
#[derive(Debug)]
pub struct MinibatchLosses {
    /// Value loss, scaled by `value_loss_coef`.
    pub value: Tensor,
    /// Clipped surrogate policy loss.
    pub action: Tensor,
    /// Weighted entropy bonus, scaled by `entropy_coef`.
    pub entropy: Tensor,
    /// Offset regularization; only present if the actions have an offset component.
    pub offset: Option<Tensor>,
    pub pano_entropy: f64,
    pub offset_entropy: f64,
    pub distance_entropy: f64,
}

impl MinibatchLosses {
    /// The loss to minimize: value + action (+ offset) - entropy bonus.
    pub fn total(&self) -> Tensor {
        let mut total = &self.value + &self.action;
        if let Some(offset) = &self.offset {
            total = total + offset;
        }
        total - &self.entropy
    }

    pub fn stats(&self) -> UpdateStats {
        UpdateStats {
            value_loss: self.value.double_value(&[]),
            action_loss: self.action.double_value(&[]),
            entropy_loss: self.entropy.double_value(&[]),
            pano_entropy: self.pano_entropy,
            offset_entropy: self.offset_entropy,
            distance_entropy: self.distance_entropy,
        }
    }
}

/// PPO updater with a decomposed entropy bonus and offset regularization.
///
/// Optionally joins every minibatch with a batch of negative visual features drawn from a
/// [`NegativeSource`]; the features are added to the observations as
/// [`NEG_RGB_FEATURES`](crate::features::NEG_RGB_FEATURES) and
/// [`NEG_DEPTH_FEATURES`](crate::features::NEG_DEPTH_FEATURES).
///
/// # Reference
/// [Proximal Policy Optimization Algorithms][ppo] by Schulman et al.
///
/// [ppo]: https://arxiv.org/abs/1707.06347
pub struct WaypointPpo<O, H = ()> {
    config: PpoConfig,
    advantages: AdvantageEstimator,
    optimizer: O,
    hooks: H,
    negatives: Option<Box<dyn NegativeSource>>,
}

impl<O, H: fmt::Debug> fmt::Debug for WaypointPpo<O, H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaypointPpo")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("negatives", &self.negatives.is_some())
            .finish_non_exhaustive()
    }
}

impl<O, H> WaypointPpo<O, H> {
    pub fn new(config: PpoConfig, optimizer: O, hooks: H) -> Self {
        Self {
            advantages: AdvantageEstimator::new(config.use_normalized_advantage),
            config,
            optimizer,
            hooks,
            negatives: None,
        }
    }

    /// Join every minibatch with a batch of negatives from `source`.
    #[must_use]
    pub fn with_negatives(mut self, source: Box<dyn NegativeSource>) -> Self {
        self.negatives = Some(source);
        self
    }

    /// Add hooks to run after the existing ones.
    pub fn with_hooks<H2>(self, hooks: H2) -> WaypointPpo<O, (H, H2)> {
        WaypointPpo {
            config: self.config,
            advantages: self.advantages,
            optimizer: self.optimizer,
            hooks: (self.hooks, hooks),
            negatives: self.negatives,
        }
    }

    pub const fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub const fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Compute the loss terms of one minibatch.
    pub fn minibatch_losses<AC>(
        &self,
        actor_critic: &AC,
        batch: &RecurrentMinibatch,
    ) -> MinibatchLosses
    where
        AC: ActorCritic + ?Sized,
    {
        let config = &self.config;
        let evaluation = actor_critic.evaluate_actions(
            &batch.observations,
            &batch.recurrent_hidden_states,
            &batch.prev_actions,
            &batch.masks,
            &batch.actions,
        );
        let entropy = &evaluation.entropy;

        let entropy_loss = ((&entropy.pano * config.pano_entropy_coef)
            + (&entropy.offset * config.offset_entropy_coef)
            + (&entropy.distance * config.distance_entropy_coef))
            .mean(Kind::Float)
            * config.entropy_coef;

        let ratio = (&evaluation.action_log_probs - &batch.old_action_log_probs).exp();
        let clipped_ratio = ratio.clamp(1.0 - config.clip_param, 1.0 + config.clip_param);
        let action_loss = (&ratio * &batch.advantages)
            .min_other(&(clipped_ratio * &batch.advantages))
            .mean(Kind::Float)
            .neg();

        let values = &evaluation.values;
        let value_loss = if config.use_clipped_value_loss {
            let value_pred_clipped = &batch.value_preds
                + (values - &batch.value_preds).clamp(-config.clip_param, config.clip_param);
            let value_losses = (values - &batch.returns).square();
            let value_losses_clipped = (value_pred_clipped - &batch.returns).square();
            value_losses
                .max_other(&value_losses_clipped)
                .mean(Kind::Float)
                * 0.5
        } else {
            (&batch.returns - values).square().mean(Kind::Float) * 0.5
        };
        let value_loss = value_loss * config.value_loss_coef;

        let offset_loss = batch.actions.offset.as_ref().map(|offset| {
            let continuous = actor_critic.offset_to_continuous(offset);
            continuous.l1_loss(&continuous.zeros_like(), Reduction::Mean)
                * config.offset_regularize_coef
        });

        let mean_value = |t: &Tensor| t.mean(Kind::Float).double_value(&[]);
        MinibatchLosses {
            value: value_loss,
            action: action_loss,
            entropy: entropy_loss,
            offset: offset_loss,
            pano_entropy: mean_value(&entropy.pano),
            offset_entropy: mean_value(&entropy.offset),
            distance_entropy: mean_value(&entropy.distance),
        }
    }
}

impl<O, H> WaypointPpo<O, H>
where
    O: OnceOptimizer,
    H: UpdateHooks,
{
    /// Update the actor-critic from a rollout.
    ///
    /// Runs `ppo_epoch` passes of `num_mini_batch` minibatches, taking one optimizer step per
    /// minibatch. Returns the loss statistics averaged over all minibatches.
    ///
    /// The statistics are also logged under the `ppo` scope, along with the number of optimizer
    /// steps and the time spent waiting for negative features.
    pub fn update<AC, R>(
        &mut self,
        actor_critic: &AC,
        rollouts: &R,
        logger: &mut dyn StatsLogger,
    ) -> Result<UpdateStats, UpdateError>
    where
        AC: ActorCritic + ?Sized,
        R: RolloutSource + ?Sized,
    {
        let advantages = self.advantages.compute(rollouts);
        let device = rollouts.device();
        let mut totals = UpdateStats::default();
        let mut negatives_wait = Duration::ZERO;
        let mut opt_steps = 0;

        for _ in 0..self.config.ppo_epoch {
            for mut batch in rollouts.recurrent_generator(&advantages, self.config.num_mini_batch)
            {
                if let Some(negatives) = &mut self.negatives {
                    let start = Instant::now();
                    let negative_batch = negatives.next_batch()?;
                    negatives_wait += start.elapsed();
                    negative_batch.insert_into(&mut batch.observations, device);
                }

                let losses = self.minibatch_losses(actor_critic, &batch);
                let loss = losses.total();
                if loss.double_value(&[]).is_nan() {
                    return Err(OptimizerStepError::NaNLoss.into());
                }

                self.optimizer.zero_grad()?;
                self.hooks.before_backward(&loss);
                loss.backward();
                self.hooks.after_backward(&loss);

                self.hooks.before_step();
                self.optimizer.step_once()?;
                self.hooks.after_step();

                totals += losses.stats();
                opt_steps += 1;
            }
        }

        let stats = totals.averaged(self.config.ppo_epoch * self.config.num_mini_batch);
        let mut logger = ScopedLogger::new(logger, "ppo");
        stats.log(&mut logger)?;
        if self.negatives.is_some() {
            logger.log_duration("negatives_wait", negatives_wait)?;
        }
        logger.log_counter_increment("opt_steps", opt_steps)?;
        Ok(stats)
    }
}
