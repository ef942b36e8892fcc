//! Masking of encrypted contributions.
//!
//! A data party never sends a plain encryption of its gradient to the arbiter, which holds the
//! private key. Instead, it adds a random element of the plaintext space to the encrypted gradient
//! (homomorphically) before submitting it. The arbiter decrypts the masked value and returns it to
//! its originator, who is the only one able to remove the mask again.
//!
//! # Masking range
//! Values are encoded as signed fixed-point integers modulo the modulus `n` of the public key
//! according to the [`MaskConfig`]. Inputs outside of the configured bound are rejected, never
//! clamped, and the configuration requires `n` to fit every aggregate of a batch in `(-n/2, n/2)`.
//! The masks are drawn uniformly from the whole plaintext space `[0, n)`, so a decrypted masked
//! value `(x + r) mod n` is uniformly distributed and independent of `x`.
//!
//! # Seeds
//! Masks are derived from a [`MaskSeed`] with the `ChaCha20` PRNG, so a party only needs to keep
//! the seed of the current round to unmask its decrypted contribution.

pub(crate) mod config;
pub(crate) mod masking;
pub(crate) mod seed;

pub use self::{
    config::{BoundType, MaskConfig, MAX_PRECISION},
    masking::{unmask, MaskError, Masker},
    seed::MaskSeed,
};
