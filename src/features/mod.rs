//! Negative feature samples streamed from an on-disk feature store.
//!
//! Records are read from a read-only LMDB store, expanded into per-pose (rgb, depth) pairs,
//! shuffled in two stages, collated into batches and handed to the policy update loop.
mod collate;
mod loader;
mod record;
mod shard;
mod store;
mod stream;
#[cfg(test)]
pub(crate) mod testing;

pub use collate::{collate, CollateError, NegativeBatch, NEG_DEPTH_FEATURES, NEG_RGB_FEATURES};
pub use loader::{BatchStream, NegativeLoaderConfig, NegativeSampleLoader};
pub use record::{DecodeError, FeaturePair, FeatureRecord, DEPTH_FEATURES, RGB_FEATURES};
pub use shard::ShardRange;
pub use store::{FeatureReader, FeatureStore, FeatureStoreConfig, FeatureStoreError};
pub use stream::{FeatureShardStream, LoadOrdering, PRELOAD_BATCHES};

use std::io;
use thiserror::Error;

/// A supplier of collated negative feature batches.
pub trait NegativeSource: Send {
    /// The next batch of negatives.
    ///
    /// Blocks until a batch is available.
    fn next_batch(&mut self) -> Result<NegativeBatch, NegativeStreamError>;
}

impl<T: NegativeSource + ?Sized> NegativeSource for Box<T> {
    fn next_batch(&mut self) -> Result<NegativeBatch, NegativeStreamError> {
        T::next_batch(self)
    }
}

/// Error producing a batch of negative features.
#[derive(Debug, Error)]
pub enum NegativeStreamError {
    #[error(transparent)]
    Store(#[from] FeatureStoreError),
    #[error(transparent)]
    Collate(#[from] CollateError),
    #[error("failed to spawn loading worker {worker}")]
    Spawn {
        worker: usize,
        #[source]
        source: io::Error,
    },
    #[error("loading worker {worker} panicked")]
    WorkerPanicked { worker: usize },
    #[error("every negative feature stream has ended")]
    Exhausted,
}
