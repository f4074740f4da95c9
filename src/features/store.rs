//! Read-only access to the on-disk feature store.
use super::record::{DecodeError, FeatureRecord};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration for opening a [`FeatureStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureStoreConfig {
    /// Directory of the LMDB environment.
    pub path: PathBuf,
    /// Memory map size hint in bytes.
    pub map_size: usize,
}

impl Default for FeatureStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/eccv_train_lmdb"),
            map_size: 1_000_000_000,
        }
    }
}

/// Error reading from the feature store.
#[derive(Debug, Error)]
pub enum FeatureStoreError {
    #[error("failed to open feature store at {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: heed::Error,
    },
    #[error("feature store has no main database")]
    MissingDatabase,
    #[error("feature store read failed")]
    Read(#[from] heed::Error),
    #[error("record {index} is missing from the feature store")]
    MissingRecord { index: usize },
    #[error("failed to decode record {index}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },
}

/// LMDB requires the map size to be a multiple of the OS page size.
///
/// 64 KiB is a multiple of every common page size.
const MAP_SIZE_ALIGNMENT: usize = 64 * 1024;

fn align_map_size(size: usize) -> usize {
    let blocks = (size.max(1) + MAP_SIZE_ALIGNMENT - 1) / MAP_SIZE_ALIGNMENT;
    blocks * MAP_SIZE_ALIGNMENT
}

/// A read-only, non-locking handle to a memory-mapped feature store.
///
/// Records are stored under unpadded decimal keys `"0"`, `"1"`, ... `"{len - 1}"`.
///
/// The handle is cheap to clone and may be shared between threads.
/// LMDB does not allow an environment to be opened twice within one process so loading workers
/// share a handle and each opens its own short-lived read transactions via [`Self::reader`].
#[derive(Clone)]
pub struct FeatureStore {
    env: Env,
    db: Database<Str, Bytes>,
    path: PathBuf,
    len: usize,
}

impl fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FeatureStore")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl FeatureStore {
    /// Open an existing store.
    pub fn open(config: &FeatureStoreConfig) -> Result<Self, FeatureStoreError> {
        let open_error = |source| FeatureStoreError::Open {
            path: config.path.clone(),
            source,
        };

        let mut options = EnvOpenOptions::new();
        options.map_size(align_map_size(config.map_size));
        // Safety: the store is never written while opened for training.
        let env = unsafe {
            options.flags(EnvFlags::READ_ONLY | EnvFlags::NO_LOCK);
            options.open(&config.path)
        }
        .map_err(open_error)?;

        let (db, len) = {
            let rtxn = env.read_txn()?;
            let db: Database<Str, Bytes> = env
                .open_database(&rtxn, None)?
                .ok_or(FeatureStoreError::MissingDatabase)?;
            let len = db.stat(&rtxn)?.entries;
            (db, len)
        };

        Ok(Self {
            env,
            db,
            path: config.path.clone(),
            len,
        })
    }

    /// Number of records in the store, counted when the store was opened.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a read transaction on the current snapshot of the store.
    pub fn reader(&self) -> Result<FeatureReader<'_>, FeatureStoreError> {
        Ok(FeatureReader {
            db: self.db,
            txn: self.env.read_txn()?,
        })
    }
}

/// A read transaction over a [`FeatureStore`].
///
/// Ends when dropped.
pub struct FeatureReader<'a> {
    db: Database<Str, Bytes>,
    txn: RoTxn<'a>,
}

impl fmt::Debug for FeatureReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FeatureReader").finish_non_exhaustive()
    }
}

impl FeatureReader<'_> {
    /// Fetch and decode the record at `index`.
    ///
    /// A missing key is an error: it means the store is incomplete or corrupt.
    pub fn fetch(&self, index: usize) -> Result<FeatureRecord, FeatureStoreError> {
        let key = index.to_string();
        let bytes = self
            .db
            .get(&self.txn, &key)?
            .ok_or(FeatureStoreError::MissingRecord { index })?;
        FeatureRecord::decode(bytes).map_err(|source| FeatureStoreError::Decode { index, source })
    }
}
