//! Shuffling utilities.
use rand::seq::SliceRandom;
use rand::Rng;

/// Shuffle the order of contiguous blocks of a sequence.
///
/// The sequence is split into consecutive blocks of `block_size` elements (the last block may be
/// shorter) and the blocks are concatenated in a uniformly random order.
/// The order of elements within each block is preserved.
///
/// # Panics
/// If `block_size` is zero.
pub fn block_shuffle<T, R>(items: Vec<T>, block_size: usize, rng: &mut R) -> Vec<T>
where
    R: Rng + ?Sized,
{
    assert!(block_size > 0, "block size must be positive");
    let len = items.len();
    let mut blocks: Vec<Vec<T>> = Vec::with_capacity((len + block_size - 1) / block_size);
    let mut iter = items.into_iter();
    loop {
        let block: Vec<T> = iter.by_ref().take(block_size).collect();
        if block.is_empty() {
            break;
        }
        blocks.push(block);
    }
    blocks.shuffle(rng);

    let mut shuffled = Vec::with_capacity(len);
    for block in blocks {
        shuffled.extend(block);
    }
    shuffled
}
