//! Masking and unmasking of encrypted contributions.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use num::bigint::BigUint;
use thiserror::Error;

use crate::{
    crypto::{Ciphertext, PaillierError, PublicKey},
    mask::seed::MaskSeed,
};

#[derive(Debug, Error, Eq, PartialEq)]
/// Errors related to encoding, masking and unmasking.
pub enum MaskError {
    #[error("the masking configuration is invalid")]
    InvalidConfig,

    #[error(
        "a modulus of {bits} bits is too small for the masking configuration, at least {required} bits are required"
    )]
    ModulusTooSmall { bits: u64, required: u64 },

    #[error("value {index} is not finite and cannot be encoded")]
    NonFinite { index: usize },

    #[error("value {index} exceeds the bound of the masking configuration")]
    OutOfBounds { index: usize },

    #[error("expected {expected} masked values but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("the masked value is not an element of the plaintext space")]
    OutOfGroup,

    #[error("the value exceeds the encoding range of the plaintext space")]
    OutOfRange,

    #[error("encryption failed: {0}")]
    Encryption(#[from] PaillierError),
}

/// A masker for contributions encrypted under a Paillier public key.
pub struct Masker {
    seed: MaskSeed,
}

impl Default for Masker {
    fn default() -> Self {
        Self::new()
    }
}

impl Masker {
    /// Creates a new masker with a randomly generated seed.
    pub fn new() -> Self {
        Self {
            seed: MaskSeed::generate(),
        }
    }

    /// Creates a new masker with the given `seed`.
    pub fn with_seed(seed: MaskSeed) -> Self {
        Self { seed }
    }

    /// Masks the given `encrypted` values.
    ///
    /// The masking proceeds in the following steps:
    /// - Derive one random element of the plaintext space per value from the seed.
    /// - Encrypt every random element under the `public` key.
    /// - Add the encrypted random elements to the encrypted values.
    ///
    /// The random elements are uniform over the whole plaintext space, hence a decrypted masked
    /// value is uniform as well and reveals nothing about the value. Unmasking as performed in
    /// [`unmask()`] subtracts the same elements again.
    ///
    /// # Errors
    /// Fails if a mask cannot be encrypted.
    pub fn mask(
        self,
        public: &PublicKey,
        encrypted: &[Ciphertext],
    ) -> Result<(MaskSeed, Vec<Ciphertext>), MaskError> {
        let Self { seed } = self;
        let masks = seed.derive_mask(encrypted.len(), public.n());
        let masked = encrypted
            .iter()
            .zip(masks)
            .map(|(encrypted, mask)| {
                let encrypted_mask = public.encrypt(&mask)?;
                Ok(public.add(encrypted, &encrypted_mask))
            })
            .collect::<Result<Vec<_>, MaskError>>()?;
        Ok((seed, masked))
    }
}

/// Removes the masks derived from `seed` from the decrypted `masked` values.
///
/// `modulus` is the modulus of the public key the values were encrypted under. The unmasked
/// values are still encoded, see [`MaskConfig::decode()`].
///
/// # Errors
/// Fails if the number of values doesn't match or if a value is not an element of the plaintext
/// space.
///
/// [`MaskConfig::decode()`]: crate::mask::MaskConfig::decode
pub fn unmask(
    seed: &MaskSeed,
    modulus: &BigUint,
    masked: &[BigUint],
    expected_len: usize,
) -> Result<Vec<BigUint>, MaskError> {
    if masked.len() != expected_len {
        return Err(MaskError::LengthMismatch {
            expected: expected_len,
            actual: masked.len(),
        });
    }
    let masks = seed.derive_mask(masked.len(), modulus);
    masked
        .iter()
        .zip(masks)
        .map(|(masked, mask)| {
            if masked >= modulus {
                return Err(MaskError::OutOfGroup);
            }
            // no underflow: masked < modulus and mask < modulus
            Ok((masked + modulus - mask) % modulus)
        })
        .collect()
}
