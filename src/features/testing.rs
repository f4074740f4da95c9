//! Helpers for building feature stores in tests.
use super::record::{DEPTH_FEATURES, RGB_FEATURES};
use super::store::{FeatureStore, FeatureStoreConfig};
use heed::types::{Bytes, Str};
use heed::{Database, EnvOpenOptions};
use rmpv::Value;
use std::path::Path;
use tempfile::TempDir;

/// Encode an `f32` array in the msgpack-numpy layout.
pub fn ndarray_f32(shape: &[u64], data: &[f32]) -> Value {
    let bytes: Vec<u8> = data.iter().flat_map(|x| x.to_le_bytes()).collect();
    Value::Map(vec![
        (Value::Binary(b"nd".to_vec()), Value::Boolean(true)),
        (Value::Binary(b"type".to_vec()), Value::from("<f4")),
        (Value::Binary(b"kind".to_vec()), Value::Binary(Vec::new())),
        (
            Value::Binary(b"shape".to_vec()),
            Value::Array(shape.iter().map(|&d| Value::from(d)).collect()),
        ),
        (Value::Binary(b"data".to_vec()), Value::Binary(bytes)),
    ])
}

/// Encode a record whose rgb and depth features are filled with `fill`.
pub fn encode_record(rgb_shape: &[u64], depth_shape: &[u64], fill: f32) -> Vec<u8> {
    let filled = |shape: &[u64]| {
        #[allow(clippy::cast_possible_truncation)]
        let n = shape.iter().product::<u64>() as usize;
        ndarray_f32(shape, &vec![fill; n])
    };
    let observations = Value::Map(vec![
        (Value::from(RGB_FEATURES), filled(rgb_shape)),
        (Value::from(DEPTH_FEATURES), filled(depth_shape)),
    ]);
    let record = Value::Array(vec![observations, Value::from(0), Value::from(1.0)]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &record).unwrap();
    bytes
}

/// Write records under keys `"0"`, `"1"`, ... then reopen the directory as a read-only store.
pub fn write_store(dir: &Path, records: &[Vec<u8>]) -> FeatureStore {
    let keyed: Vec<_> = records.iter().cloned().enumerate().collect();
    write_keyed_store(dir, &keyed)
}

/// Write each record under the decimal key of its index then reopen as a read-only store.
pub fn write_keyed_store(dir: &Path, records: &[(usize, Vec<u8>)]) -> FeatureStore {
    {
        let env = unsafe { EnvOpenOptions::new().map_size(1 << 26).open(dir) }.unwrap();
        let mut wtxn = env.write_txn().unwrap();
        let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None).unwrap();
        for (i, record) in records {
            db.put(&mut wtxn, &i.to_string(), record).unwrap();
        }
        wtxn.commit().unwrap();
        env.prepare_for_closing().wait();
    }
    FeatureStore::open(&FeatureStoreConfig {
        path: dir.to_path_buf(),
        map_size: 1 << 26,
    })
    .unwrap()
}

/// A store of `num_records` records with `segments * poses` poses each.
///
/// The features of record `i` are filled with the value `i`.
pub fn numbered_store(num_records: usize, segments: u64, poses: u64) -> (TempDir, FeatureStore) {
    let dir = TempDir::new().unwrap();
    let records: Vec<_> = (0..num_records)
        .map(|i| encode_record(&[segments, poses, 3], &[segments, poses, 2], i as f32))
        .collect();
    let store = write_store(dir.path(), &records);
    (dir, store)
}

/// A store of `len` single-pose numbered records in which the key `missing` is absent.
///
/// Record `len` is written in its place so that the store still counts `len` entries.
pub fn store_missing_key(len: usize, missing: usize) -> (TempDir, FeatureStore) {
    let dir = TempDir::new().unwrap();
    let records: Vec<_> = (0..=len)
        .filter(|&i| i != missing)
        .map(|i| (i, encode_record(&[1, 1, 3], &[1, 1, 2], i as f32)))
        .collect();
    let store = write_keyed_store(dir.path(), &records);
    (dir, store)
}
