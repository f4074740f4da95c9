//! Small actor-critic and rollouts for update tests.
use super::actor_critic::{ActionBatch, ActorCritic, EntropyTerms, Evaluation, ObservationBatch};
use super::rollout::{RolloutStep, RolloutStorage, RolloutStorageConfig};
use crate::features::NEG_RGB_FEATURES;
use std::cell::RefCell;
use std::collections::BTreeMap;
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};

/// Observation entry read by [`LinearActorCritic`].
pub const FEATURES: &str = "features";
pub const FEATURE_DIM: i64 = 4;
pub const PANO_BINS: i64 = 6;
pub const DISTANCE_BINS: i64 = 3;
pub const OFFSET_BINS: i64 = 5;

/// Linear value and categorical action heads over the `features` observation.
///
/// Records the shape of every observation entry it is evaluated on.
#[derive(Debug)]
pub struct LinearActorCritic {
    value: nn::Linear,
    pano: nn::Linear,
    distance: nn::Linear,
    offset: nn::Linear,
    pub seen: RefCell<Vec<BTreeMap<String, Vec<i64>>>>,
}

impl LinearActorCritic {
    pub fn new(path: &nn::Path) -> Self {
        let linear = |name: &str, out_dim| {
            nn::linear(path / name, FEATURE_DIM, out_dim, nn::LinearConfig::default())
        };
        Self {
            value: linear("value", 1),
            pano: linear("pano", PANO_BINS),
            distance: linear("distance", DISTANCE_BINS),
            offset: linear("offset", OFFSET_BINS),
            seen: RefCell::new(Vec::new()),
        }
    }
}

/// Log probability of `actions` and entropy under categorical `logits`.
fn categorical(logits: &Tensor, actions: &Tensor) -> (Tensor, Tensor) {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    let entropy = (log_probs.exp() * &log_probs)
        .sum_dim_intlist(&[-1], false, Kind::Float)
        .neg();
    (log_probs.gather(-1, actions, false), entropy)
}

impl ActorCritic for LinearActorCritic {
    fn evaluate_actions(
        &self,
        observations: &ObservationBatch,
        _recurrent_hidden_states: &Tensor,
        _prev_actions: &ActionBatch,
        _masks: &Tensor,
        actions: &ActionBatch,
    ) -> Evaluation {
        self.seen.borrow_mut().push(
            observations
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.size()))
                .collect(),
        );
        let x = observations.get(FEATURES).unwrap();
        let (pano_log_prob, pano_entropy) = categorical(&self.pano.forward(x), &actions.pano);
        let (distance_log_prob, distance_entropy) =
            categorical(&self.distance.forward(x), &actions.distance);
        let offset_logits = self.offset.forward(x);
        let offset_actions = actions
            .offset
            .as_ref()
            .map_or_else(|| actions.pano.zeros_like(), Tensor::shallow_clone);
        let (offset_log_prob, offset_entropy) = categorical(&offset_logits, &offset_actions);

        let mut action_log_probs = pano_log_prob + distance_log_prob;
        if actions.offset.is_some() {
            action_log_probs = action_log_probs + offset_log_prob;
        }
        Evaluation {
            values: self.value.forward(x),
            action_log_probs,
            entropy: EntropyTerms {
                pano: pano_entropy,
                offset: offset_entropy,
                distance: distance_entropy,
            },
            aux: observations
                .get(NEG_RGB_FEATURES)
                .map(|negatives| negatives.mean(Kind::Float)),
        }
    }

    fn offset_to_continuous(&self, offset: &Tensor) -> Tensor {
        offset.to_kind(Kind::Float) * 0.25 - 0.5
    }
}

/// A filled rollout of random features and actions with returns computed by GAE.
pub fn random_rollout(num_steps: usize, num_envs: usize, with_offset: bool) -> RolloutStorage {
    let config = RolloutStorageConfig {
        num_steps,
        num_envs,
        num_recurrent_layers: 1,
        hidden_size: 2,
        observation_shapes: [(FEATURES.to_string(), vec![FEATURE_DIM])]
            .into_iter()
            .collect(),
        with_offset,
    };
    let mut storage = config.build_storage(Device::Cpu);
    let n = num_envs as i64;
    let float = (Kind::Float, Device::Cpu);
    let long = (Kind::Int64, Device::Cpu);
    for _ in 0..num_steps {
        let mut observations = ObservationBatch::new();
        observations.insert(FEATURES, Tensor::randn(&[n, FEATURE_DIM], float));
        storage.insert(&RolloutStep {
            observations,
            recurrent_hidden_states: Tensor::zeros(&[1, n, 2], float),
            actions: ActionBatch {
                pano: Tensor::randint(PANO_BINS, &[n, 1], long),
                distance: Tensor::randint(DISTANCE_BINS, &[n, 1], long),
                offset: with_offset.then(|| Tensor::randint(OFFSET_BINS, &[n, 1], long)),
            },
            action_log_probs: Tensor::randn(&[n, 1], float) * 0.1 - 2.0,
            value_preds: Tensor::randn(&[n, 1], float),
            rewards: Tensor::ones(&[n, 1], float),
            masks: Tensor::ones(&[n, 1], float),
        });
    }
    storage.compute_returns(&Tensor::zeros(&[n, 1], float), true, 0.99, 0.95);
    storage
}
