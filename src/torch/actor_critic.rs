//! Actor-critic network interface.
use std::collections::{btree_map, BTreeMap};
use tch::Tensor;

/// Named observation tensors for a batch of steps.
///
/// Each sensor's tensor has the batch dimensions first.
#[derive(Debug, Default)]
pub struct ObservationBatch(BTreeMap<String, Tensor>);

impl ObservationBatch {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a named entry, returning the tensor it replaces.
    pub fn insert<K: Into<String>>(&mut self, name: K, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries in name order.
    pub fn iter(&self) -> btree_map::Iter<String, Tensor> {
        self.0.iter()
    }

    /// Apply a function to every tensor, keeping the names.
    #[must_use]
    pub fn map<F: FnMut(&Tensor) -> Tensor>(&self, mut f: F) -> Self {
        Self(
            self.0
                .iter()
                .map(|(name, tensor)| (name.clone(), f(tensor)))
                .collect(),
        )
    }
}

impl FromIterator<(String, Tensor)> for ObservationBatch {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ObservationBatch {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Waypoint actions for a batch of steps.
///
/// The offset component only exists for action spaces with a continuous offset.
#[derive(Debug)]
pub struct ActionBatch {
    /// Panoramic heading bin.
    pub pano: Tensor,
    /// Distance bin.
    pub distance: Tensor,
    /// Offset bin, decoded into a continuous offset by [`ActorCritic::offset_to_continuous`].
    pub offset: Option<Tensor>,
}

impl ActionBatch {
    /// Apply a function to every component.
    #[must_use]
    pub fn map<F: FnMut(&Tensor) -> Tensor>(&self, mut f: F) -> Self {
        Self {
            pano: f(&self.pano),
            distance: f(&self.distance),
            offset: self.offset.as_ref().map(f),
        }
    }
}

/// Per-sample entropies of each action component.
#[derive(Debug)]
pub struct EntropyTerms {
    pub pano: Tensor,
    pub offset: Tensor,
    pub distance: Tensor,
}

/// Output of [`ActorCritic::evaluate_actions`].
#[derive(Debug)]
pub struct Evaluation {
    /// State value estimates.
    pub values: Tensor,
    /// Log probability of the evaluated actions.
    pub action_log_probs: Tensor,
    pub entropy: EntropyTerms,
    /// Additional network output; not used by the update.
    pub aux: Option<Tensor>,
}

/// A recurrent actor-critic network over waypoint actions.
pub trait ActorCritic {
    /// Evaluate a batch of actions taken from the given observations.
    ///
    /// # Args
    /// * `observations` - Sensor observations, possibly including extra entries such as
    ///     negative feature samples.
    /// * `recurrent_hidden_states` - Hidden states at the start of each trajectory.
    /// * `prev_actions` - Action taken on the step before each observation.
    /// * `masks` - Zero where a new episode starts.
    /// * `actions` - The actions to evaluate.
    fn evaluate_actions(
        &self,
        observations: &ObservationBatch,
        recurrent_hidden_states: &Tensor,
        prev_actions: &ActionBatch,
        masks: &Tensor,
        actions: &ActionBatch,
    ) -> Evaluation;

    /// Decode a discrete offset action into its continuous value.
    fn offset_to_continuous(&self, offset: &Tensor) -> Tensor;
}

impl<T: ActorCritic + ?Sized> ActorCritic for &'_ T {
    fn evaluate_actions(
        &self,
        observations: &ObservationBatch,
        recurrent_hidden_states: &Tensor,
        prev_actions: &ActionBatch,
        masks: &Tensor,
        actions: &ActionBatch,
    ) -> Evaluation {
        T::evaluate_actions(
            self,
            observations,
            recurrent_hidden_states,
            prev_actions,
            masks,
            actions,
        )
    }

    fn offset_to_continuous(&self, offset: &Tensor) -> Tensor {
        T::offset_to_continuous(self, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn observation_batch_map_keeps_names() {
        let mut observations = ObservationBatch::new();
        observations.insert("rgb", Tensor::ones(&[2, 3], (Kind::Float, Device::Cpu)));
        observations.insert("depth", Tensor::ones(&[2, 1], (Kind::Float, Device::Cpu)));
        let doubled = observations.map(|t| t * 2);
        let names: Vec<_> = doubled.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["depth", "rgb"]);
        assert_eq!(doubled.get("rgb").unwrap().double_value(&[1, 2]), 2.0);
    }

    #[test]
    fn insert_replaces() {
        let mut observations = ObservationBatch::new();
        assert!(observations
            .insert("a", Tensor::of_slice(&[1.0_f32]))
            .is_none());
        assert!(observations
            .insert("a", Tensor::of_slice(&[2.0_f32]))
            .is_some());
        assert_eq!(observations.len(), 1);
        assert!(observations.contains("a"));
    }

    #[test]
    fn action_batch_map_preserves_missing_offset() {
        let actions = ActionBatch {
            pano: Tensor::of_slice(&[1_i64, 2]),
            distance: Tensor::of_slice(&[0_i64, 3]),
            offset: None,
        };
        let mapped = actions.map(|t| t + 1);
        assert!(mapped.offset.is_none());
        assert_eq!(mapped.pano.int64_value(&[1]), 3);
    }
}
