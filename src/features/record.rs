//! Decoding of serialized feature records.
//!
//! Records are msgpack-encoded 3-tuples `(observations, action, extra)` in which numeric arrays
//! use the msgpack-numpy convention: a map with the keys `nd`, `type`, `shape` and `data`.
use rmpv::Value;
use std::fmt;
use tch::{Kind, Tensor};
use thiserror::Error;

/// Observation field holding the visual features of a record.
pub const RGB_FEATURES: &str = "rgb_features";
/// Observation field holding the depth features of a record.
pub const DEPTH_FEATURES: &str = "depth_features";

/// Error decoding a serialized feature record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid msgpack payload")]
    Msgpack(#[from] rmpv::decode::Error),
    #[error("record is not an (observations, action, extra) tuple")]
    NotATuple,
    #[error("observations are not a map")]
    ObservationsNotAMap,
    #[error("observations are missing the {0:?} field")]
    MissingField(&'static str),
    #[error("field {field:?} is not a numeric array: {reason}")]
    InvalidArray {
        field: &'static str,
        reason: &'static str,
    },
    #[error("field {field:?} has unsupported dtype {dtype:?}")]
    UnsupportedDtype { field: &'static str, dtype: String },
    #[error("field {field:?} holds {actual} bytes but shape {shape:?} needs {expected}")]
    DataLength {
        field: &'static str,
        shape: Vec<i64>,
        expected: usize,
        actual: usize,
    },
    #[error("field {field:?} has shape {shape:?}; expected (segments, poses, ...)")]
    MissingPoseAxes { field: &'static str, shape: Vec<i64> },
    #[error("rgb features have {rgb} poses but depth features have {depth}")]
    PoseCountMismatch { rgb: i64, depth: i64 },
}

/// One pair of per-pose visual and depth feature tensors.
#[derive(Debug)]
pub struct FeaturePair {
    pub rgb: Tensor,
    pub depth: Tensor,
}

/// A decoded feature record.
pub struct FeatureRecord {
    /// Visual features with shape `(segments, poses_per_segment, ...feature_dims)`.
    pub rgb_features: Tensor,
    /// Depth features with shape `(segments, poses_per_segment, ...feature_dims)`.
    pub depth_features: Tensor,
    /// Recorded action; not used for negative sampling.
    pub action: Value,
    /// Reward or other metadata stored with the record.
    pub extra: Value,
}

impl fmt::Debug for FeatureRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FeatureRecord")
            .field("rgb_features", &self.rgb_features.size())
            .field("depth_features", &self.depth_features.size())
            .field("action", &self.action)
            .field("extra", &self.extra)
            .finish()
    }
}

impl FeatureRecord {
    /// Decode a record from its serialized bytes.
    ///
    /// Array data is copied into newly allocated tensors so the result does not borrow from
    /// `bytes`.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        let value = rmpv::decode::read_value(&mut bytes)?;
        let mut items = match value {
            Value::Array(items) if items.len() == 3 => items.into_iter(),
            _ => return Err(DecodeError::NotATuple),
        };
        // The length was checked above
        let (observations, action, extra) = match (items.next(), items.next(), items.next()) {
            (Some(o), Some(a), Some(e)) => (o, a, e),
            _ => return Err(DecodeError::NotATuple),
        };
        let observations = observations
            .as_map()
            .ok_or(DecodeError::ObservationsNotAMap)?;

        let rgb_features = decode_array(
            map_get(observations, RGB_FEATURES).ok_or(DecodeError::MissingField(RGB_FEATURES))?,
            RGB_FEATURES,
        )?;
        let depth_features = decode_array(
            map_get(observations, DEPTH_FEATURES)
                .ok_or(DecodeError::MissingField(DEPTH_FEATURES))?,
            DEPTH_FEATURES,
        )?;

        Ok(Self {
            rgb_features,
            depth_features,
            action,
            extra,
        })
    }

    /// Number of poses (`segments * poses_per_segment`) in the record.
    pub fn num_poses(&self) -> Result<i64, DecodeError> {
        let rgb = pose_count(&self.rgb_features, RGB_FEATURES)?;
        let depth = pose_count(&self.depth_features, DEPTH_FEATURES)?;
        if rgb != depth {
            return Err(DecodeError::PoseCountMismatch { rgb, depth });
        }
        Ok(rgb)
    }

    /// Split into one (rgb, depth) pair per pose.
    ///
    /// The leading `(segments, poses_per_segment)` axes are flattened into a single pose axis.
    pub fn into_pairs(self) -> Result<Vec<FeaturePair>, DecodeError> {
        self.num_poses()?;
        let rgb = self.rgb_features.flatten(0, 1).unbind(0);
        let depth = self.depth_features.flatten(0, 1).unbind(0);
        Ok(rgb
            .into_iter()
            .zip(depth)
            .map(|(rgb, depth)| FeaturePair { rgb, depth })
            .collect())
    }
}

fn pose_count(tensor: &Tensor, field: &'static str) -> Result<i64, DecodeError> {
    match tensor.size()[..] {
        [segments, poses, ..] => Ok(segments * poses),
        _ => Err(DecodeError::MissingPoseAxes {
            field,
            shape: tensor.size(),
        }),
    }
}

/// Look up a map entry by key.
///
/// Keys may be encoded as msgpack strings or as raw binary (as written for numpy array headers).
fn map_get<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| match k {
            Value::String(s) => s.as_str() == Some(key),
            Value::Binary(b) => b.as_slice() == key.as_bytes(),
            _ => false,
        })
        .map(|(_, v)| v)
}

/// Decode a msgpack-numpy array into a tensor.
fn decode_array(value: &Value, field: &'static str) -> Result<Tensor, DecodeError> {
    let invalid = |reason| DecodeError::InvalidArray { field, reason };
    let entries = value.as_map().ok_or_else(|| invalid("not a map"))?;

    match map_get(entries, "nd").and_then(Value::as_bool) {
        Some(true) => {}
        Some(false) => return Err(invalid("scalar instead of an array")),
        None => return Err(invalid("missing the nd flag")),
    }

    let dtype = match map_get(entries, "type").ok_or_else(|| invalid("missing the dtype"))? {
        Value::String(s) => s.as_str().ok_or_else(|| invalid("dtype is not utf-8"))?,
        Value::Binary(b) => std::str::from_utf8(b).map_err(|_| invalid("dtype is not utf-8"))?,
        _ => return Err(invalid("dtype is not a string")),
    };
    let (kind, element_size) = parse_dtype(dtype).ok_or_else(|| DecodeError::UnsupportedDtype {
        field,
        dtype: dtype.to_string(),
    })?;

    let shape = map_get(entries, "shape")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing the shape"))?
        .iter()
        .map(|dim| {
            dim.as_u64()
                .and_then(|d| i64::try_from(d).ok())
                .ok_or_else(|| invalid("shape entries must be non-negative integers"))
        })
        .collect::<Result<Vec<i64>, _>>()?;

    let data = match map_get(entries, "data").ok_or_else(|| invalid("missing the data"))? {
        Value::Binary(b) => b.as_slice(),
        Value::String(s) => s.as_bytes(),
        _ => return Err(invalid("data is not binary")),
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let num_elements: usize = shape.iter().map(|&d| d as usize).product();
    let expected = num_elements * element_size;
    if data.len() != expected {
        return Err(DecodeError::DataLength {
            field,
            shape,
            expected,
            actual: data.len(),
        });
    }
    Ok(Tensor::of_data_size(data, &shape, kind))
}

/// Map a numpy dtype string (like `<f4`) to a tensor kind and element size in bytes.
///
/// Only little-endian and byte-order-free types are supported.
fn parse_dtype(dtype: &str) -> Option<(Kind, usize)> {
    let mut chars = dtype.chars();
    let byte_order = chars.next()?;
    if !matches!(byte_order, '<' | '|' | '=') {
        return None;
    }
    let type_code = chars.next()?;
    let size: usize = chars.as_str().parse().ok()?;
    let kind = match (type_code, size) {
        ('f', 2) => Kind::Half,
        ('f', 4) => Kind::Float,
        ('f', 8) => Kind::Double,
        ('u', 1) => Kind::Uint8,
        ('i', 1) => Kind::Int8,
        ('i', 2) => Kind::Int16,
        ('i', 4) => Kind::Int,
        ('i', 8) => Kind::Int64,
        ('b', 1) => Kind::Bool,
        _ => return None,
    };
    Some((kind, size))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{encode_record, ndarray_f32};
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("<f4", Some((Kind::Float, 4)))]
    #[case("<f2", Some((Kind::Half, 2)))]
    #[case("|u1", Some((Kind::Uint8, 1)))]
    #[case("<i8", Some((Kind::Int64, 8)))]
    #[case(">f4", None)]
    #[case("<c8", None)]
    #[case("", None)]
    fn dtypes(#[case] dtype: &str, #[case] expected: Option<(Kind, usize)>) {
        assert_eq!(parse_dtype(dtype), expected);
    }

    #[test]
    fn decode_shapes_and_values() {
        let bytes = encode_record(&[2, 3, 4], &[2, 3, 5], 7.0);
        let record = FeatureRecord::decode(&bytes).unwrap();
        assert_eq!(record.rgb_features.size(), vec![2, 3, 4]);
        assert_eq!(record.depth_features.size(), vec![2, 3, 5]);
        assert_eq!(record.rgb_features.kind(), Kind::Float);
        assert_eq!(record.rgb_features.double_value(&[1, 2, 3]), 7.0);
        assert_eq!(record.num_poses().unwrap(), 6);
    }

    #[test]
    fn into_pairs_flattens_pose_axes() {
        let bytes = encode_record(&[2, 3, 4], &[2, 3, 5], 1.5);
        let pairs = FeatureRecord::decode(&bytes).unwrap().into_pairs().unwrap();
        assert_eq!(pairs.len(), 6);
        for pair in &pairs {
            assert_eq!(pair.rgb.size(), vec![4]);
            assert_eq!(pair.depth.size(), vec![5]);
        }
    }

    #[test]
    fn into_pairs_keeps_pose_order() {
        let data: Vec<f32> = (0..6).map(|x| x as f32).collect();
        let array = ndarray_f32(&[2, 3, 1], &data);
        let observations = Value::Map(vec![
            (Value::from(RGB_FEATURES), array.clone()),
            (Value::from(DEPTH_FEATURES), array),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(
            &mut bytes,
            &Value::Array(vec![observations, Value::from(0), Value::Nil]),
        )
        .unwrap();

        let pairs = FeatureRecord::decode(&bytes).unwrap().into_pairs().unwrap();
        let values: Vec<f64> = pairs.iter().map(|p| p.rgb.double_value(&[0])).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn missing_depth_field() {
        let observations = Value::Map(vec![(
            Value::from(RGB_FEATURES),
            ndarray_f32(&[1, 1, 1], &[0.0]),
        )]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(
            &mut bytes,
            &Value::Array(vec![observations, Value::Nil, Value::Nil]),
        )
        .unwrap();
        assert!(matches!(
            FeatureRecord::decode(&bytes),
            Err(DecodeError::MissingField(DEPTH_FEATURES))
        ));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let observations = Value::Map(vec![
            (Value::from(RGB_FEATURES), ndarray_f32(&[1, 2, 2], &[0.0; 3])),
            (Value::from(DEPTH_FEATURES), ndarray_f32(&[1, 2, 1], &[0.0; 2])),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(
            &mut bytes,
            &Value::Array(vec![observations, Value::Nil, Value::Nil]),
        )
        .unwrap();
        assert!(matches!(
            FeatureRecord::decode(&bytes),
            Err(DecodeError::DataLength {
                field: RGB_FEATURES,
                expected: 16,
                actual: 12,
                ..
            })
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(FeatureRecord::decode(&[0xc1]).is_err());
        assert!(matches!(
            FeatureRecord::decode(&[0x01]),
            Err(DecodeError::NotATuple)
        ));
    }

    #[test]
    fn mismatched_pose_counts() {
        let bytes = encode_record(&[2, 3, 4], &[1, 3, 4], 0.0);
        let record = FeatureRecord::decode(&bytes).unwrap();
        assert!(matches!(
            record.into_pairs(),
            Err(DecodeError::PoseCountMismatch { rgb: 6, depth: 3 })
        ));
    }
}
