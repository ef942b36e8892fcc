//! Wrappers around the Paillier cryptosystem of the `paillier` crate.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use std::convert::TryFrom;

use curv::arithmetic::{BigInt, Converter};
use derive_more::{From, Into};
use num::{
    bigint::BigUint,
    integer::Integer,
    traits::identities::{One, Zero},
};
use paillier::{
    Add,
    Decrypt,
    DecryptionKey,
    Encrypt,
    EncryptionKey,
    KeyGeneration,
    Mul,
    Paillier,
    RawCiphertext,
    RawPlaintext,
};
use thiserror::Error;

/// The smallest supported modulus length in bits.
pub const MIN_KEY_LENGTH: usize = 128;

#[derive(Debug, Error, Eq, PartialEq)]
/// Errors related to the Paillier cryptosystem.
pub enum PaillierError {
    #[error("invalid key length {0}: must be even and at least {}", MIN_KEY_LENGTH)]
    InvalidKeyLength(usize),

    #[error("invalid public key modulus")]
    InvalidModulus,

    #[error("plaintext is out of the range of the public key")]
    PlaintextOutOfRange,

    #[error("ciphertext is not valid under the given key")]
    InvalidCiphertext,
}

fn to_curv(int: &BigUint) -> BigInt {
    BigInt::from_bytes(&int.to_bytes_be())
}

fn from_curv(int: &BigInt) -> BigUint {
    BigUint::from_bytes_be(&int.to_bytes())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, From, Into)]
/// A Paillier ciphertext.
///
/// Ciphertexts under the same public key can be combined with [`PublicKey::add()`], such that the
/// result decrypts to the sum of the plaintexts.
pub struct Ciphertext(BigUint);

impl Ciphertext {
    /// Gets the ciphertext as an integer modulo `n^2`.
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    fn raw(&self) -> RawCiphertext<'static> {
        RawCiphertext::from(to_curv(&self.0))
    }

    fn from_raw(raw: RawCiphertext) -> Self {
        Self(from_curv(&BigInt::from(raw)))
    }
}

#[derive(Clone, Debug)]
/// A Paillier public key.
pub struct PublicKey {
    n: BigUint,
    n_squared: BigUint,
    key: EncryptionKey,
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.n == other.n
    }
}

impl Eq for PublicKey {}

impl TryFrom<BigUint> for PublicKey {
    type Error = PaillierError;

    /// Creates a public key from its modulus. Fails if the modulus is obviously invalid.
    fn try_from(n: BigUint) -> Result<Self, Self::Error> {
        // the product of two primes of `MIN_KEY_LENGTH / 2` bits may lack the top bit
        if (n.bits() as usize) + 1 < MIN_KEY_LENGTH || n.is_even() {
            return Err(PaillierError::InvalidModulus);
        }
        let n_squared = &n * &n;
        let key = EncryptionKey {
            n: to_curv(&n),
            nn: to_curv(&n_squared),
        };
        Ok(Self { n, n_squared, key })
    }
}

impl PublicKey {
    /// Gets the modulus `n`, which bounds the plaintext space.
    pub fn n(&self) -> &BigUint {
        &self.n
    }

    /// Encrypts `plaintext` with fresh randomness.
    ///
    /// # Errors
    /// Fails if `plaintext >= n`.
    pub fn encrypt(&self, plaintext: &BigUint) -> Result<Ciphertext, PaillierError> {
        if plaintext >= &self.n {
            return Err(PaillierError::PlaintextOutOfRange);
        }
        let ciphertext: RawCiphertext =
            Paillier::encrypt(&self.key, RawPlaintext::from(to_curv(plaintext)));
        Ok(Ciphertext::from_raw(ciphertext))
    }

    /// Adds two ciphertexts. The result decrypts to the sum of the plaintexts modulo `n`.
    pub fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Ciphertext {
        let sum: RawCiphertext = Paillier::add(&self.key, lhs.raw(), rhs.raw());
        Ciphertext::from_raw(sum)
    }

    /// Adds up a sequence of ciphertexts. Returns `None` for an empty sequence.
    pub fn sum<'c>(
        &self,
        ciphertexts: impl IntoIterator<Item = &'c Ciphertext>,
    ) -> Option<Ciphertext> {
        let mut ciphertexts = ciphertexts.into_iter();
        let first = ciphertexts.next()?.clone();
        Some(ciphertexts.fold(first, |sum, ciphertext| self.add(&sum, ciphertext)))
    }

    /// Multiplies a ciphertext by a plaintext scalar. The result decrypts to the product modulo
    /// `n`.
    pub fn mul_plain(&self, ciphertext: &Ciphertext, scalar: &BigUint) -> Ciphertext {
        let product: RawCiphertext = Paillier::mul(
            &self.key,
            ciphertext.raw(),
            RawPlaintext::from(to_curv(scalar)),
        );
        Ciphertext::from_raw(product)
    }
}

#[derive(Clone, Debug)]
/// A Paillier secret key.
pub struct SecretKey {
    key: DecryptionKey,
    public: PublicKey,
}

impl SecretKey {
    /// Decrypts a ciphertext.
    ///
    /// # Errors
    /// Fails if the ciphertext is not an element of the ciphertext group of this key.
    pub fn decrypt(&self, ciphertext: &Ciphertext) -> Result<BigUint, PaillierError> {
        let PublicKey { n, n_squared, .. } = &self.public;
        let c = ciphertext.as_biguint();
        if c.is_zero() || c >= n_squared || !c.gcd(n).is_one() {
            return Err(PaillierError::InvalidCiphertext);
        }
        let plaintext: RawPlaintext = Paillier::decrypt(&self.key, ciphertext.raw());
        Ok(from_curv(&BigInt::from(plaintext)))
    }
}

#[derive(Clone, Debug)]
/// A Paillier key pair.
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a key pair whose modulus has `key_length` bits, give or take the top bit.
    ///
    /// # Errors
    /// Fails if `key_length` is odd or smaller than [`MIN_KEY_LENGTH`].
    pub fn generate(key_length: usize) -> Result<Self, PaillierError> {
        if key_length < MIN_KEY_LENGTH || key_length % 2 != 0 {
            return Err(PaillierError::InvalidKeyLength(key_length));
        }
        let (encryption_key, decryption_key) =
            Paillier::keypair_with_modulus_size(key_length).keys();
        let public = PublicKey::try_from(from_curv(&encryption_key.n))?;
        let secret = SecretKey {
            key: decryption_key,
            public: public.clone(),
        };
        Ok(Self { public, secret })
    }
}
