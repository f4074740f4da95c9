//! Parallel loading of negative feature batches.
use super::collate::{collate, NegativeBatch};
use super::shard::ShardRange;
use super::store::{FeatureStore, FeatureStoreConfig};
use super::stream::FeatureShardStream;
use super::{NegativeSource, NegativeStreamError};
use crossbeam::channel::{self, Receiver, Sender};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};

/// Configuration for [`NegativeSampleLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegativeLoaderConfig {
    pub store: FeatureStoreConfig,
    /// Number of negative pairs per batch.
    pub batch_size: usize,
    /// Number of loading threads.
    ///
    /// With zero workers the whole store is streamed on the calling thread.
    pub num_workers: usize,
    /// Maximum number of finished batches each worker keeps ready.
    pub prefetch_batches: usize,
    pub seed: u64,
}

impl Default for NegativeLoaderConfig {
    fn default() -> Self {
        Self {
            store: FeatureStoreConfig::default(),
            batch_size: 200,
            num_workers: 3,
            prefetch_batches: 2,
            seed: 0,
        }
    }
}

impl NegativeLoaderConfig {
    /// Open the feature store and start loading.
    pub fn build_loader(&self) -> Result<NegativeSampleLoader, NegativeStreamError> {
        let store = FeatureStore::open(&self.store)?;
        NegativeSampleLoader::new(store, self)
    }
}

/// Groups the pairs of a shard stream into collated batches.
///
/// A final partial batch is dropped when the stream ends.
#[derive(Debug)]
pub struct BatchStream<R = ChaCha8Rng> {
    pairs: FeatureShardStream<R>,
}

impl<R: Rng> BatchStream<R> {
    pub fn new(pairs: FeatureShardStream<R>) -> Self {
        Self { pairs }
    }

    /// The next full batch or `None` if the underlying stream has ended.
    pub fn next_batch(&mut self) -> Result<Option<NegativeBatch>, NegativeStreamError> {
        let batch_size = self.pairs.batch_size();
        let mut items = Vec::with_capacity(batch_size);
        while items.len() < batch_size {
            match self.pairs.next_pair()? {
                Some(pair) => items.push(pair),
                None => return Ok(None),
            }
        }
        Ok(Some(collate(&items)?))
    }
}

impl<R: Rng> Iterator for BatchStream<R> {
    type Item = Result<NegativeBatch, NegativeStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

type BatchResult = Result<NegativeBatch, NegativeStreamError>;

/// Delivers negative batches produced by a pool of loading threads.
///
/// Each worker streams its own [`ShardRange`] of the store and sends finished batches through a
/// bounded channel. Batches are taken from the workers in strict round-robin order, blocking on
/// the worker whose turn it is. A worker stops after its first error, which is delivered in
/// turn; workers whose stream has ended are removed from the rotation.
///
/// Dropping the loader disconnects the channels and joins the worker threads.
#[derive(Debug)]
pub struct NegativeSampleLoader {
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    InProcess(Option<BatchStream>),
    Workers { workers: Vec<Worker>, next: usize },
}

#[derive(Debug)]
struct Worker {
    id: usize,
    receiver: Receiver<BatchResult>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Wait for the thread to exit.
    ///
    /// Returns false if the thread panicked.
    fn join(&mut self) -> bool {
        self.thread.take().map_or(true, |thread| thread.join().is_ok())
    }
}

impl NegativeSampleLoader {
    /// Start loading from an opened store.
    ///
    /// # Panics
    /// If `config.batch_size` is zero.
    pub fn new(
        store: FeatureStore,
        config: &NegativeLoaderConfig,
    ) -> Result<Self, NegativeStreamError> {
        assert!(config.batch_size > 0, "batch size must be positive");
        if config.num_workers == 0 {
            let rng = ChaCha8Rng::seed_from_u64(config.seed);
            let shard = ShardRange::full(store.len());
            let stream = FeatureShardStream::new(store, shard, config.batch_size, rng);
            return Ok(Self {
                backend: Backend::InProcess(Some(BatchStream::new(stream))),
            });
        }

        let mut workers = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let shard = ShardRange::for_worker(store.len(), config.num_workers, id);
            let rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(id as u64));
            let stream = FeatureShardStream::new(store.clone(), shard, config.batch_size, rng);
            let (sender, receiver) = channel::bounded(config.prefetch_batches);
            let thread = thread::Builder::new()
                .name(format!("negatives-{}", id))
                .spawn(move || run_worker(BatchStream::new(stream), &sender))
                .map_err(|source| NegativeStreamError::Spawn { worker: id, source })?;
            workers.push(Worker {
                id,
                receiver,
                thread: Some(thread),
            });
        }
        Ok(Self {
            backend: Backend::Workers { workers, next: 0 },
        })
    }

    /// Number of streams still producing batches.
    pub fn active_streams(&self) -> usize {
        match &self.backend {
            Backend::InProcess(stream) => usize::from(stream.is_some()),
            Backend::Workers { workers, .. } => workers.len(),
        }
    }
}

fn run_worker(mut batches: BatchStream, sender: &Sender<BatchResult>) {
    loop {
        let result = match batches.next_batch() {
            Ok(Some(batch)) => Ok(batch),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        // A disconnected receiver means the loader was dropped
        if sender.send(result).is_err() || failed {
            return;
        }
    }
}

impl NegativeSource for NegativeSampleLoader {
    fn next_batch(&mut self) -> Result<NegativeBatch, NegativeStreamError> {
        match &mut self.backend {
            Backend::InProcess(slot) => {
                let stream = slot.as_mut().ok_or(NegativeStreamError::Exhausted)?;
                match stream.next_batch() {
                    Ok(Some(batch)) => Ok(batch),
                    Ok(None) => {
                        *slot = None;
                        Err(NegativeStreamError::Exhausted)
                    }
                    Err(e) => {
                        *slot = None;
                        Err(e)
                    }
                }
            }
            Backend::Workers { workers, next } => loop {
                if workers.is_empty() {
                    return Err(NegativeStreamError::Exhausted);
                }
                let i = *next % workers.len();
                match workers[i].receiver.recv() {
                    Ok(Ok(batch)) => {
                        *next = i + 1;
                        return Ok(batch);
                    }
                    Ok(Err(e)) => {
                        let mut worker = workers.remove(i);
                        worker.join();
                        *next = i;
                        return Err(e);
                    }
                    Err(_) => {
                        // Stream ended or the thread died
                        let mut worker = workers.remove(i);
                        *next = i;
                        if !worker.join() {
                            return Err(NegativeStreamError::WorkerPanicked { worker: worker.id });
                        }
                    }
                }
            },
        }
    }
}

impl Drop for NegativeSampleLoader {
    fn drop(&mut self) {
        if let Backend::Workers { workers, .. } = &mut self.backend {
            // Disconnecting first unblocks any worker waiting to send
            let threads: Vec<_> = workers
                .drain(..)
                .map(|worker| {
                    drop(worker.receiver);
                    worker.thread
                })
                .collect();
            for thread in threads.into_iter().flatten() {
                let _ = thread.join();
            }
        }
    }
}
