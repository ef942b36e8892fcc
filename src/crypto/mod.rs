//! Wrappers around the cryptographic primitives of the aggregation protocol.
//!
//! # Homomorphic encryption
//! Contributions are encrypted with the [Paillier] cryptosystem, as implemented by the `paillier`
//! crate. It is additively homomorphic: ciphertexts can be added to each other and multiplied by
//! plaintext scalars, which yields encryptions of the sums and products of their plaintexts
//! modulo `n`. The arbiter generates the [`KeyPair`] once per run and only ever shares the
//! [`PublicKey`].
//!
//! # Randomness
//! Masks are drawn from the `ChaCha20` stream cipher, either seeded from the operating system or
//! from an explicit seed.
//!
//! [Paillier]: https://en.wikipedia.org/wiki/Paillier_cryptosystem

pub(crate) mod encrypt;
pub(crate) mod prng;

pub use self::{
    encrypt::{Ciphertext, KeyPair, PaillierError, PublicKey, SecretKey, MIN_KEY_LENGTH},
    prng::generate_integer,
};
