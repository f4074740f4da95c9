//! Batch collation of feature pairs.
use super::record::FeaturePair;
use crate::torch::actor_critic::ObservationBatch;
use tch::{Device, Tensor};
use thiserror::Error;

/// Observation entry receiving the negative visual features.
pub const NEG_RGB_FEATURES: &str = "neg_rgb_features";
/// Observation entry receiving the negative depth features.
pub const NEG_DEPTH_FEATURES: &str = "neg_depth_features";

/// A batch of negative samples stacked along a new leading axis.
#[derive(Debug)]
pub struct NegativeBatch {
    /// Visual features; shape `(batch_size, ...feature_dims)`.
    pub rgb: Tensor,
    /// Depth features; shape `(batch_size, ...feature_dims)`.
    pub depth: Tensor,
}

impl NegativeBatch {
    /// Number of samples in the batch.
    pub fn len(&self) -> i64 {
        self.rgb.size().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the batch to `device` and add it to `observations` as extra named entries.
    pub fn insert_into(self, observations: &mut ObservationBatch, device: Device) {
        observations.insert(NEG_RGB_FEATURES, self.rgb.to_device(device));
        observations.insert(NEG_DEPTH_FEATURES, self.depth.to_device(device));
    }
}

/// Error collating feature pairs into a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollateError {
    #[error("cannot collate an empty batch")]
    Empty,
    #[error("{component} features of item {index} have shape {found:?}; expected {expected:?}")]
    ShapeMismatch {
        component: &'static str,
        index: usize,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
}

/// Stack the rgb and depth components of `pairs` into a [`NegativeBatch`].
///
/// All items must have the same rgb shape and the same depth shape.
pub fn collate(pairs: &[FeaturePair]) -> Result<NegativeBatch, CollateError> {
    let first = pairs.first().ok_or(CollateError::Empty)?;
    let rgb_shape = first.rgb.size();
    let depth_shape = first.depth.size();
    for (index, pair) in pairs.iter().enumerate().skip(1) {
        check_shape("rgb", index, &rgb_shape, &pair.rgb)?;
        check_shape("depth", index, &depth_shape, &pair.depth)?;
    }

    let rgb: Vec<&Tensor> = pairs.iter().map(|pair| &pair.rgb).collect();
    let depth: Vec<&Tensor> = pairs.iter().map(|pair| &pair.depth).collect();
    Ok(NegativeBatch {
        rgb: Tensor::stack(&rgb, 0),
        depth: Tensor::stack(&depth, 0),
    })
}

fn check_shape(
    component: &'static str,
    index: usize,
    expected: &[i64],
    tensor: &Tensor,
) -> Result<(), CollateError> {
    let found = tensor.size();
    if found == expected {
        Ok(())
    } else {
        Err(CollateError::ShapeMismatch {
            component,
            index,
            expected: expected.to_vec(),
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn pair(value: f64, rgb_dim: i64, depth_dim: i64) -> FeaturePair {
        FeaturePair {
            rgb: Tensor::ones(&[rgb_dim], (Kind::Float, Device::Cpu)) * value,
            depth: Tensor::ones(&[depth_dim, 2], (Kind::Float, Device::Cpu)) * value,
        }
    }

    #[test]
    fn stacks_along_new_leading_axis() {
        let pairs: Vec<_> = (0..4).map(|i| pair(f64::from(i), 3, 5)).collect();
        let batch = collate(&pairs).unwrap();
        assert_eq!(batch.rgb.size(), vec![4, 3]);
        assert_eq!(batch.depth.size(), vec![4, 5, 2]);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.rgb.double_value(&[2, 0]), 2.0);
        assert_eq!(batch.depth.double_value(&[3, 4, 1]), 3.0);
    }

    #[test]
    fn empty_is_an_error() {
        assert_eq!(collate(&[]).unwrap_err(), CollateError::Empty);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let pairs = vec![pair(0.0, 3, 5), pair(1.0, 3, 5), pair(2.0, 3, 4)];
        assert_eq!(
            collate(&pairs).unwrap_err(),
            CollateError::ShapeMismatch {
                component: "depth",
                index: 2,
                expected: vec![5, 2],
                found: vec![4, 2],
            }
        );
    }

    #[test]
    fn insert_into_observations() {
        let batch = collate(&[pair(1.0, 3, 5), pair(2.0, 3, 5)]).unwrap();
        let mut observations = ObservationBatch::new();
        batch.insert_into(&mut observations, Device::Cpu);
        assert_eq!(observations.get(NEG_RGB_FEATURES).unwrap().size(), vec![2, 3]);
        assert_eq!(
            observations.get(NEG_DEPTH_FEATURES).unwrap().size(),
            vec![2, 5, 2]
        );
    }
}
