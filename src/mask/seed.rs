//! Mask seed and mask generation.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::iter;

use num::bigint::BigUint;
use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::crypto::generate_integer;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A seed to generate a mask.
///
/// The seed never leaves the party which masked its contribution, it is all that party needs to
/// remove the mask again.
pub struct MaskSeed([u8; 32]);

impl MaskSeed {
    /// The length of a seed in bytes.
    pub const LENGTH: usize = 32;

    /// Generates a random seed.
    pub fn generate() -> Self {
        let mut seed = [0_u8; Self::LENGTH];
        OsRng.fill_bytes(&mut seed);
        Self(seed)
    }

    /// Creates a seed from raw bytes.
    pub fn from_array(seed: [u8; Self::LENGTH]) -> Self {
        Self(seed)
    }

    /// Gets this seed as an array.
    pub fn as_array(&self) -> [u8; Self::LENGTH] {
        self.0
    }

    /// Derives a mask of given length from this seed.
    ///
    /// The mask elements are uniformly distributed over `[0, order)`.
    pub fn derive_mask(&self, len: usize, order: &BigUint) -> Vec<BigUint> {
        let mut prng = ChaCha20Rng::from_seed(self.as_array());
        iter::repeat_with(|| generate_integer(&mut prng, order))
            .take(len)
            .collect()
    }
}
