//! Batch sampling.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use rand::{rngs::OsRng, seq::index, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Samples the rows of each epoch. Run by the guest only, which shares the indices with the host
/// and the arbiter.
pub struct BatchGenerator {
    rows: usize,
    batch_size: usize,
    prng: ChaCha20Rng,
}

impl BatchGenerator {
    /// Creates a generator for `batch_size` out of `rows` rows.
    ///
    /// A `batch_size` of `0` or of at least `rows` selects all the rows. The sampling is
    /// reproducible for a given `seed`.
    pub fn new(rows: usize, batch_size: usize, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| OsRng.next_u64());
        Self {
            rows,
            batch_size,
            prng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    pub fn is_full_batch(&self) -> bool {
        self.batch_size == 0 || self.batch_size >= self.rows
    }

    /// Samples the row indices of the next epoch, without replacement and in ascending order.
    pub fn next_batch(&mut self) -> Vec<u64> {
        if self.is_full_batch() {
            return (0..self.rows as u64).collect();
        }
        let mut indices: Vec<u64> = index::sample(&mut self.prng, self.rows, self.batch_size)
            .into_iter()
            .map(|i| i as u64)
            .collect();
        indices.sort_unstable();
        indices
    }
}
