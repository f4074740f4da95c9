//! Rollout storage and recurrent minibatch generation.
use super::actor_critic::{ActionBatch, ObservationBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tch::{Device, Kind, Tensor};

/// A minibatch of whole trajectories from a subset of the rollout environments.
///
/// Per-step tensors are flattened to `(num_steps * num_envs_in_batch, ...)`, time-major.
#[derive(Debug)]
pub struct RecurrentMinibatch {
    pub observations: ObservationBatch,
    /// Hidden states at the first step; `(num_layers, num_envs_in_batch, hidden_size)`.
    pub recurrent_hidden_states: Tensor,
    pub actions: ActionBatch,
    pub prev_actions: ActionBatch,
    pub value_preds: Tensor,
    pub returns: Tensor,
    pub masks: Tensor,
    pub old_action_log_probs: Tensor,
    pub advantages: Tensor,
}

/// Rollout data consumed by the policy update.
pub trait RolloutSource {
    /// Returns; `(num_steps + 1, num_envs, 1)`.
    fn returns(&self) -> &Tensor;

    /// Value predictions; `(num_steps + 1, num_envs, 1)`.
    fn value_preds(&self) -> &Tensor;

    /// Device holding the rollout tensors.
    fn device(&self) -> Device {
        self.returns().device()
    }

    /// Generate `num_mini_batch` minibatches covering the rollout in a random order.
    ///
    /// # Args
    /// * `advantages` - Advantage of each step; `(num_steps, num_envs, 1)`.
    /// * `num_mini_batch` - Number of minibatches to generate.
    fn recurrent_generator<'a>(
        &'a self,
        advantages: &'a Tensor,
        num_mini_batch: usize,
    ) -> Box<dyn Iterator<Item = RecurrentMinibatch> + 'a>;
}

/// Configuration for [`RolloutStorage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutStorageConfig {
    /// Number of steps collected from each environment per update.
    pub num_steps: usize,
    /// Number of parallel environments.
    pub num_envs: usize,
    pub num_recurrent_layers: usize,
    pub hidden_size: usize,
    /// Shape of each named observation, excluding batch dimensions.
    pub observation_shapes: BTreeMap<String, Vec<i64>>,
    /// Whether the action space has an offset component.
    pub with_offset: bool,
}

impl Default for RolloutStorageConfig {
    fn default() -> Self {
        Self {
            num_steps: 128,
            num_envs: 4,
            num_recurrent_layers: 1,
            hidden_size: 512,
            observation_shapes: BTreeMap::new(),
            with_offset: true,
        }
    }
}

impl RolloutStorageConfig {
    pub fn build_storage(&self, device: Device) -> RolloutStorage {
        RolloutStorage::new(self, device)
    }
}

/// One step of experience from every environment.
#[derive(Debug)]
pub struct RolloutStep {
    /// Observations following the action; `(num_envs, ...)` per sensor.
    pub observations: ObservationBatch,
    /// Hidden states after the step; `(num_layers, num_envs, hidden_size)`.
    pub recurrent_hidden_states: Tensor,
    /// Actions taken; `(num_envs, 1)` per component.
    pub actions: ActionBatch,
    pub action_log_probs: Tensor,
    pub value_preds: Tensor,
    pub rewards: Tensor,
    /// Zero for environments whose episode ended with this step.
    pub masks: Tensor,
}

/// Fixed-size, time-major rollout buffer.
///
/// Observations, hidden states, previous actions and masks have `num_steps + 1` slots: slot 0
/// holds the state carried over from the previous rollout.
#[derive(Debug)]
pub struct RolloutStorage {
    observations: ObservationBatch,
    recurrent_hidden_states: Tensor,
    rewards: Tensor,
    value_preds: Tensor,
    returns: Tensor,
    action_log_probs: Tensor,
    actions: ActionBatch,
    prev_actions: ActionBatch,
    masks: Tensor,
    num_steps: i64,
    num_envs: i64,
    step: i64,
}

impl RolloutStorage {
    #[allow(clippy::cast_possible_wrap)]
    pub fn new(config: &RolloutStorageConfig, device: Device) -> Self {
        let num_steps = config.num_steps as i64;
        let num_envs = config.num_envs as i64;
        let float = (Kind::Float, device);
        let long = (Kind::Int64, device);

        let observations = config
            .observation_shapes
            .iter()
            .map(|(name, shape)| {
                let mut full_shape = vec![num_steps + 1, num_envs];
                full_shape.extend_from_slice(shape);
                (name.clone(), Tensor::zeros(&full_shape, float))
            })
            .collect();
        let actions_of_len = |len: i64| ActionBatch {
            pano: Tensor::zeros(&[len, num_envs, 1], long),
            distance: Tensor::zeros(&[len, num_envs, 1], long),
            offset: if config.with_offset {
                Some(Tensor::zeros(&[len, num_envs, 1], long))
            } else {
                None
            },
        };

        Self {
            observations,
            recurrent_hidden_states: Tensor::zeros(
                &[
                    num_steps + 1,
                    config.num_recurrent_layers as i64,
                    num_envs,
                    config.hidden_size as i64,
                ],
                float,
            ),
            rewards: Tensor::zeros(&[num_steps, num_envs, 1], float),
            value_preds: Tensor::zeros(&[num_steps + 1, num_envs, 1], float),
            returns: Tensor::zeros(&[num_steps + 1, num_envs, 1], float),
            action_log_probs: Tensor::zeros(&[num_steps, num_envs, 1], float),
            actions: actions_of_len(num_steps),
            prev_actions: actions_of_len(num_steps + 1),
            masks: Tensor::ones(&[num_steps + 1, num_envs, 1], float),
            num_steps,
            num_envs,
            step: 0,
        }
    }

    pub const fn num_steps(&self) -> i64 {
        self.num_steps
    }

    pub const fn num_envs(&self) -> i64 {
        self.num_envs
    }

    /// Index of the next step to be inserted.
    pub const fn step(&self) -> i64 {
        self.step
    }

    pub const fn rewards(&self) -> &Tensor {
        &self.rewards
    }

    pub const fn masks(&self) -> &Tensor {
        &self.masks
    }

    /// Set the observations that the first step of the rollout acts on.
    pub fn set_initial_observations(&mut self, observations: &ObservationBatch) {
        let _no_grad = tch::no_grad_guard();
        for (name, value) in observations {
            if let Some(slot) = self.observations.get(name) {
                slot.get(0).copy_(value);
            }
        }
    }

    /// Record one step of experience.
    ///
    /// The tensors are copied without gradient tracking.
    pub fn insert(&mut self, step: &RolloutStep) {
        let _no_grad = tch::no_grad_guard();
        let t = self.step;
        for (name, value) in &step.observations {
            if let Some(slot) = self.observations.get(name) {
                slot.get(t + 1).copy_(value);
            }
        }
        self.recurrent_hidden_states
            .get(t + 1)
            .copy_(&step.recurrent_hidden_states);
        copy_actions(&self.actions, t, &step.actions);
        copy_actions(&self.prev_actions, t + 1, &step.actions);
        self.action_log_probs.get(t).copy_(&step.action_log_probs);
        self.value_preds.get(t).copy_(&step.value_preds);
        self.rewards.get(t).copy_(&step.rewards);
        self.masks.get(t + 1).copy_(&step.masks);

        self.step = (self.step + 1) % self.num_steps;
    }

    /// Carry the final state over to slot 0 for the next rollout.
    pub fn after_update(&mut self) {
        let _no_grad = tch::no_grad_guard();
        let last = self.num_steps;
        for (_, value) in &self.observations {
            value.get(0).copy_(&value.get(last));
        }
        self.recurrent_hidden_states
            .get(0)
            .copy_(&self.recurrent_hidden_states.get(last));
        self.masks.get(0).copy_(&self.masks.get(last));
        let prev_actions = &self.prev_actions;
        copy_actions(prev_actions, 0, &prev_actions.map(|t| t.get(last)));
    }

    /// Compute the return of every step.
    ///
    /// # Args
    /// * `next_value` - Value estimate of the state following the final step; `(num_envs, 1)`.
    /// * `use_gae` - Use generalized advantage estimation rather than discounted returns.
    /// * `gamma` - Discount factor.
    /// * `tau` - GAE lambda parameter.
    pub fn compute_returns(&mut self, next_value: &Tensor, use_gae: bool, gamma: f64, tau: f64) {
        let _no_grad = tch::no_grad_guard();
        let last = self.num_steps;
        if use_gae {
            self.value_preds.get(last).copy_(next_value);
            let mut gae = Tensor::zeros_like(next_value);
            for t in (0..last).rev() {
                let next_mask = self.masks.get(t + 1);
                let delta = self.rewards.get(t) + self.value_preds.get(t + 1) * gamma * &next_mask
                    - self.value_preds.get(t);
                gae = delta + gae * next_mask * (gamma * tau);
                self.returns.get(t).copy_(&(&gae + self.value_preds.get(t)));
            }
        } else {
            self.returns.get(last).copy_(next_value);
            for t in (0..last).rev() {
                let discounted = self.returns.get(t + 1) * gamma * self.masks.get(t + 1);
                self.returns.get(t).copy_(&(discounted + self.rewards.get(t)));
            }
        }
    }
}

fn copy_actions(dst: &ActionBatch, index: i64, src: &ActionBatch) {
    dst.pano.get(index).copy_(&src.pano);
    dst.distance.get(index).copy_(&src.distance);
    if let (Some(dst_offset), Some(src_offset)) = (&dst.offset, &src.offset) {
        dst_offset.get(index).copy_(src_offset);
    }
}

impl RolloutSource for RolloutStorage {
    fn returns(&self) -> &Tensor {
        &self.returns
    }

    fn value_preds(&self) -> &Tensor {
        &self.value_preds
    }

    /// Environments are randomly permuted and split into `num_mini_batch` groups of
    /// `num_envs / num_mini_batch`. Leftover environments are omitted.
    ///
    /// # Panics
    /// If `num_mini_batch` is zero or greater than the number of environments.
    fn recurrent_generator<'a>(
        &'a self,
        advantages: &'a Tensor,
        num_mini_batch: usize,
    ) -> Box<dyn Iterator<Item = RecurrentMinibatch> + 'a> {
        #[allow(clippy::cast_possible_wrap)]
        let num_mini_batch = num_mini_batch as i64;
        assert!(
            0 < num_mini_batch && num_mini_batch <= self.num_envs,
            "number of minibatches ({}) must be in 1..={} (the number of environments)",
            num_mini_batch,
            self.num_envs
        );
        let envs_per_batch = self.num_envs / num_mini_batch;
        let device = self.returns.device();
        let perm = Tensor::randperm(self.num_envs, (Kind::Int64, device));
        let steps = self.num_steps;

        Box::new((0..num_mini_batch).map(move |batch| {
            let env_indices = perm.narrow(0, batch * envs_per_batch, envs_per_batch);
            // Select environments from the first `steps` slots then flatten time and envs.
            let select = |t: &Tensor| {
                t.narrow(0, 0, steps)
                    .index_select(1, &env_indices)
                    .flatten(0, 1)
            };
            RecurrentMinibatch {
                observations: self.observations.map(select),
                recurrent_hidden_states: self
                    .recurrent_hidden_states
                    .get(0)
                    .index_select(1, &env_indices),
                actions: self.actions.map(select),
                prev_actions: self.prev_actions.map(select),
                value_preds: select(&self.value_preds),
                returns: select(&self.returns),
                masks: select(&self.masks),
                old_action_log_probs: select(&self.action_log_probs),
                advantages: select(advantages),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    const STEPS: usize = 3;
    const ENVS: usize = 4;

    fn config(with_offset: bool) -> RolloutStorageConfig {
        RolloutStorageConfig {
            num_steps: STEPS,
            num_envs: ENVS,
            num_recurrent_layers: 2,
            hidden_size: 5,
            observation_shapes: [("rgb".to_string(), vec![6])].into_iter().collect(),
            with_offset,
        }
    }

    /// A step where every value identifies its step `t` and environment.
    fn step(t: i64) -> RolloutStep {
        let envs = Tensor::arange(ENVS as i64, (Kind::Float, Device::Cpu)).unsqueeze(-1);
        let tagged = &envs + (100 * t) as f64;
        let actions = tagged.to_kind(Kind::Int64);
        let mut observations = ObservationBatch::new();
        observations.insert("rgb", tagged.expand(&[ENVS as i64, 6], false));
        RolloutStep {
            observations,
            recurrent_hidden_states: tagged.reshape(&[1, ENVS as i64, 1]).expand(
                &[2, ENVS as i64, 5],
                false,
            ),
            actions: ActionBatch {
                pano: actions.shallow_clone(),
                distance: actions.shallow_clone(),
                offset: Some(actions),
            },
            action_log_probs: tagged.shallow_clone(),
            value_preds: tagged.shallow_clone(),
            rewards: Tensor::ones(&[ENVS as i64, 1], (Kind::Float, Device::Cpu)),
            masks: Tensor::ones(&[ENVS as i64, 1], (Kind::Float, Device::Cpu)),
        }
    }

    #[fixture]
    fn filled() -> RolloutStorage {
        let mut storage = config(true).build_storage(Device::Cpu);
        for t in 0..STEPS as i64 {
            storage.insert(&step(t));
        }
        storage
    }

    #[rstest]
    fn insert_wraps_step(filled: RolloutStorage) {
        assert_eq!(filled.step(), 0);
        assert_eq!(filled.value_preds.double_value(&[2, 3, 0]), 203.0);
        assert_eq!(filled.observations.get("rgb").unwrap().double_value(&[3, 1, 5]), 201.0);
        assert_eq!(filled.prev_actions.pano.int64_value(&[1, 2, 0]), 2);
        assert_eq!(filled.actions.pano.int64_value(&[1, 2, 0]), 102);
    }

    #[rstest]
    fn after_update_carries_last_slot(mut filled: RolloutStorage) {
        filled.after_update();
        assert_eq!(filled.observations.get("rgb").unwrap().double_value(&[0, 2, 0]), 202.0);
        assert_eq!(filled.recurrent_hidden_states.double_value(&[0, 1, 2, 4]), 202.0);
        assert_eq!(
            filled.prev_actions.offset.as_ref().unwrap().int64_value(&[0, 1, 0]),
            201
        );
    }

    #[rstest]
    fn discounted_returns(mut filled: RolloutStorage) {
        let next_value = Tensor::full(&[ENVS as i64, 1], 10.0, (Kind::Float, Device::Cpu));
        filled.masks.get(2).fill_(0.0);
        filled.compute_returns(&next_value, false, 0.5, 0.95);
        // Episode ends after step 1 so step 1 only sees its own reward
        assert!((filled.returns.double_value(&[2, 0, 0]) - 6.0).abs() < 1e-6);
        assert!((filled.returns.double_value(&[1, 0, 0]) - 1.0).abs() < 1e-6);
        assert!((filled.returns.double_value(&[0, 0, 0]) - 1.5).abs() < 1e-6);
    }

    #[rstest]
    fn gae_with_zero_lambda_is_one_step_td(mut filled: RolloutStorage) {
        let next_value = Tensor::full(&[ENVS as i64, 1], 10.0, (Kind::Float, Device::Cpu));
        filled.compute_returns(&next_value, true, 0.5, 0.0);
        // return = reward + gamma * next value prediction
        assert!((filled.returns.double_value(&[0, 1, 0]) - (1.0 + 0.5 * 101.0)).abs() < 1e-4);
        assert!((filled.returns.double_value(&[2, 1, 0]) - (1.0 + 0.5 * 10.0)).abs() < 1e-4);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(4)]
    fn generator_covers_environments(filled: RolloutStorage, #[case] num_mini_batch: usize) {
        let advantages = filled.value_preds.narrow(0, 0, STEPS as i64) * 2;
        let envs_per_batch = (ENVS / num_mini_batch) as i64;
        let mut seen = Vec::new();
        let mut count = 0;
        for batch in filled.recurrent_generator(&advantages, num_mini_batch) {
            count += 1;
            let rows = STEPS as i64 * envs_per_batch;
            assert_eq!(batch.value_preds.size(), vec![rows, 1]);
            assert_eq!(batch.observations.get("rgb").unwrap().size(), vec![rows, 6]);
            assert_eq!(batch.recurrent_hidden_states.size(), vec![2, envs_per_batch, 5]);
            assert_eq!(batch.actions.offset.as_ref().unwrap().size(), vec![rows, 1]);
            for row in 0..rows {
                let value = batch.value_preds.double_value(&[row, 0]);
                // Rows are time-major: step then environment
                assert_eq!((value / 100.0).floor() as i64, row / envs_per_batch);
                assert_eq!(batch.advantages.double_value(&[row, 0]), 2.0 * value);
                assert_eq!(batch.old_action_log_probs.double_value(&[row, 0]), value);
            }
            for env in 0..envs_per_batch {
                seen.push(batch.value_preds.double_value(&[env, 0]) as i64);
            }
        }
        assert_eq!(count, num_mini_batch);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len() as i64, envs_per_batch * num_mini_batch as i64);
    }

    #[rstest]
    #[should_panic]
    fn generator_rejects_too_many_minibatches(filled: RolloutStorage) {
        let advantages = Tensor::zeros(&[STEPS as i64, ENVS as i64, 1], (Kind::Float, Device::Cpu));
        let _ = filled.recurrent_generator(&advantages, ENVS + 1);
    }

    #[test]
    fn no_offset_storage() {
        let mut storage = config(false).build_storage(Device::Cpu);
        storage.insert(&step(0));
        assert!(storage.actions.offset.is_none());
    }
}
