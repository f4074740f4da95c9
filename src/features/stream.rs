//! Streaming negative samples out of a feature store shard.
use super::record::FeaturePair;
use super::shard::ShardRange;
use super::store::{FeatureStore, FeatureStoreError};
use crate::utils::shuffle::block_shuffle;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::fmt;

/// Number of batches worth of pairs loaded by each refill of the preload buffer.
pub const PRELOAD_BATCHES: usize = 10;

/// Order in which the records of a shard are loaded.
///
/// Each pass over the shard visits the record indices in a block-shuffled order: the index range
/// is split into contiguous blocks, the blocks are visited in random order and the indices within
/// each block in ascending order. This keeps reads within a block local on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOrdering {
    shard: ShardRange,
    block_size: usize,
    /// Remaining indices of the current pass, in reverse visiting order.
    remaining: Vec<usize>,
}

impl LoadOrdering {
    /// Create an ordering and start its first pass.
    pub fn new<R: Rng + ?Sized>(shard: ShardRange, block_size: usize, rng: &mut R) -> Self {
        let mut ordering = Self {
            shard,
            block_size,
            remaining: Vec::new(),
        };
        ordering.restart(rng);
        ordering
    }

    /// Start a new pass over the whole shard, discarding any remaining indices.
    pub fn restart<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order = block_shuffle(self.shard.indices().collect(), self.block_size, rng);
        order.reverse();
        self.remaining = order;
    }

    /// Take the next index of the current pass.
    pub fn pop(&mut self) -> Option<usize> {
        self.remaining.pop()
    }

    /// Take the next index, starting a new pass if the current one is finished.
    ///
    /// Only `None` if the shard is empty.
    pub fn next_index<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        if self.remaining.is_empty() {
            self.restart(rng);
        }
        self.pop()
    }

    /// Number of indices remaining in the current pass.
    pub fn len(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// An endless stream of (rgb, depth) feature pairs from one shard of a feature store.
///
/// Pairs are staged in a preload buffer that is refilled in bursts of
/// `PRELOAD_BATCHES * batch_size` pairs whenever it holds fewer than `batch_size`.
/// Each burst reads whole records in [`LoadOrdering`] order using a fresh read transaction,
/// shuffles the resulting pairs and then block-shuffles them with `batch_size` blocks.
///
/// When a pass over the shard ends the next refill starts a new pass in a new random order, so
/// the stream only ends if the shard holds no pairs at all.
pub struct FeatureShardStream<R = ChaCha8Rng> {
    store: FeatureStore,
    ordering: LoadOrdering,
    batch_size: usize,
    preload_size: usize,
    /// Staged pairs, consumed from the back.
    preload: Vec<FeaturePair>,
    rng: R,
    records_loaded: u64,
}

impl<R> fmt::Debug for FeatureShardStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FeatureShardStream")
            .field("store", &self.store)
            .field("shard", &self.ordering.shard)
            .field("batch_size", &self.batch_size)
            .field("preloaded", &self.preload.len())
            .field("remaining_in_pass", &self.ordering.len())
            .finish()
    }
}

impl<R: Rng> FeatureShardStream<R> {
    /// # Panics
    /// If `batch_size` is zero.
    pub fn new(store: FeatureStore, shard: ShardRange, batch_size: usize, mut rng: R) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        let preload_size = batch_size * PRELOAD_BATCHES;
        let ordering = LoadOrdering::new(shard, preload_size, &mut rng);
        Self {
            store,
            ordering,
            batch_size,
            preload_size,
            preload: Vec::with_capacity(preload_size + batch_size),
            rng,
            records_loaded: 0,
        }
    }

    pub fn shard(&self) -> ShardRange {
        self.ordering.shard
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of pairs currently staged in the preload buffer.
    pub fn preloaded(&self) -> usize {
        self.preload.len()
    }

    /// Total number of records read from the store.
    pub fn records_loaded(&self) -> u64 {
        self.records_loaded
    }

    /// The next feature pair.
    ///
    /// Returns `None` only if the shard contains no pairs.
    pub fn next_pair(&mut self) -> Result<Option<FeaturePair>, FeatureStoreError> {
        if self.preload.len() < self.batch_size {
            self.refill()?;
        }
        Ok(self.preload.pop())
    }

    /// Load up to `preload_size` pairs (rounded up to whole records) into the preload buffer.
    ///
    /// If the current pass runs out before any pair is loaded a new pass is started.
    /// Loads nothing only if a whole fresh pass yields no pairs.
    fn refill(&mut self) -> Result<(), FeatureStoreError> {
        let mut restarted = false;
        if self.ordering.is_empty() {
            self.ordering.restart(&mut self.rng);
            restarted = true;
        }

        let mut loaded = Vec::with_capacity(self.preload_size);
        {
            let reader = self.store.reader()?;
            while loaded.len() < self.preload_size {
                let index = match self.ordering.pop() {
                    Some(index) => index,
                    None if loaded.is_empty() && !restarted => {
                        self.ordering.restart(&mut self.rng);
                        restarted = true;
                        continue;
                    }
                    None => break,
                };
                let pairs = reader
                    .fetch(index)?
                    .into_pairs()
                    .map_err(|source| FeatureStoreError::Decode { index, source })?;
                loaded.extend(pairs);
                self.records_loaded += 1;
            }
        }

        loaded.shuffle(&mut self.rng);
        let loaded = block_shuffle(loaded, self.batch_size, &mut self.rng);
        self.preload.extend(loaded);
        Ok(())
    }
}

impl<R: Rng> Iterator for FeatureShardStream<R> {
    type Item = Result<FeaturePair, FeatureStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_pair().transpose()
    }
}
