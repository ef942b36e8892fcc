//! Payload values.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use std::{
    collections::BTreeMap,
    convert::{TryFrom, TryInto},
};

use anyhow::{anyhow, Context};
use num::bigint::BigUint;

use crate::{
    crypto::{Ciphertext, PublicKey},
    message::{
        traits::{decode_sequence, encode_sequence},
        DecodeError,
        FromBytes,
        LengthValueBuffer,
        ToBytes,
    },
};

/// The version of the value encoding produced by this crate.
pub const VALUE_VERSION: u8 = 1;

pub(crate) mod ranges {
    use std::ops::Range;

    use crate::message::range;

    /// Byte range corresponding to the version in a value header
    pub const VERSION: usize = 0;
    /// Byte range corresponding to the kind in a value header
    pub const KIND: usize = VERSION + 1;
    /// Byte range reserved for future use
    pub const RESERVED: Range<usize> = range(KIND + 1, 2);
    /// Byte range corresponding to the length field in a value header
    pub const LENGTH: Range<usize> = range(RESERVED.end, 4);
}

/// Length in bytes of a value header
pub const HEADER_LENGTH: usize = ranges::LENGTH.end;

/// A wrapper around a buffer that contains an encoded [`Value`].
///
/// ```no_rust
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    version    |     kind      |           reserved            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             length                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                     body (variable length)                    +
/// |                                                               |
/// ```
///
/// - `version` is the encoding version, currently [`VALUE_VERSION`]
/// - `kind` is the discriminant selecting the body decoder, see [`ValueKind`]
/// - `length` is the length in bytes of the _full_ value, header included
pub struct ValueBuffer<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> ValueBuffer<T> {
    /// Performs bound checks on `bytes` and returns a new [`ValueBuffer`].
    ///
    /// # Errors
    /// Fails if the `bytes` are smaller than the header or than the length field claims.
    pub fn new(bytes: T) -> Result<Self, DecodeError> {
        let buffer = Self { inner: bytes };
        buffer
            .check_buffer_length()
            .context("not a valid ValueBuffer")?;
        Ok(buffer)
    }

    /// Returns a [`ValueBuffer`] without performing any bound checks.
    pub fn new_unchecked(bytes: T) -> Self {
        Self { inner: bytes }
    }

    /// Performs bound checks to ensure the fields can be accessed without panicking.
    pub fn check_buffer_length(&self) -> Result<(), DecodeError> {
        let len = self.inner.as_ref().len();
        if len < HEADER_LENGTH {
            return Err(anyhow!(
                "invalid buffer length: {} < {}",
                len,
                HEADER_LENGTH
            ));
        }
        let expected_len = self.length() as usize;
        if expected_len < HEADER_LENGTH || len < expected_len {
            return Err(anyhow!(
                "invalid value length: length field says {}, but buffer is {} bytes long",
                expected_len,
                len
            ));
        }
        Ok(())
    }

    /// Gets the version field.
    pub fn version(&self) -> u8 {
        self.inner.as_ref()[ranges::VERSION]
    }

    /// Gets the kind field.
    pub fn kind(&self) -> u8 {
        self.inner.as_ref()[ranges::KIND]
    }

    /// Gets the length field.
    pub fn length(&self) -> u32 {
        // safe unwrap: the slice is exactly 4 bytes long
        u32::from_be_bytes(self.inner.as_ref()[ranges::LENGTH].try_into().unwrap())
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> ValueBuffer<&'a T> {
    /// Gets the body of the value.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn body(&self) -> &'a [u8] {
        &self.inner.as_ref()[HEADER_LENGTH..self.length() as usize]
    }
}

impl<T: AsMut<[u8]> + AsRef<[u8]>> ValueBuffer<T> {
    /// Sets the version field.
    pub fn set_version(&mut self, value: u8) {
        self.inner.as_mut()[ranges::VERSION] = value;
    }

    /// Sets the kind field.
    pub fn set_kind(&mut self, value: u8) {
        self.inner.as_mut()[ranges::KIND] = value;
    }

    /// Sets the length field.
    pub fn set_length(&mut self, value: u32) {
        self.inner.as_mut()[ranges::LENGTH].copy_from_slice(&value.to_be_bytes());
    }

    /// Gets a mutable reference to the body.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.inner.as_mut()[HEADER_LENGTH..]
    }
}

bitflags::bitflags! {
    /// The outcome of a convergence check, as broadcast by the arbiter.
    pub struct ConvergenceFlags: u8 {
        /// The loss of the round improved on the best loss so far.
        const BEST_ITER_CHANGED = 1 << 0;
        /// The training run stops after this round.
        const CONVERGED = 1 << 1;
    }
}

#[derive(Copy, Debug, Clone, Eq, PartialEq)]
/// The discriminant of a [`Value`], carried in the value header.
pub enum ValueKind {
    Scalar,
    Vector,
    Params,
    Ciphertexts,
    Plaintexts,
    PublicKey,
    Indices,
    Status,
    Abort,
}

impl TryFrom<u8> for ValueKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ValueKind::Scalar,
            2 => ValueKind::Vector,
            3 => ValueKind::Params,
            4 => ValueKind::Ciphertexts,
            5 => ValueKind::Plaintexts,
            6 => ValueKind::PublicKey,
            7 => ValueKind::Indices,
            8 => ValueKind::Status,
            9 => ValueKind::Abort,
            _ => return Err(anyhow!("invalid value kind {}", value)),
        })
    }
}

impl From<ValueKind> for u8 {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Scalar => 1,
            ValueKind::Vector => 2,
            ValueKind::Params => 3,
            ValueKind::Ciphertexts => 4,
            ValueKind::Plaintexts => 5,
            ValueKind::PublicKey => 6,
            ValueKind::Indices => 7,
            ValueKind::Status => 8,
            ValueKind::Abort => 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A typed payload exchanged between two parties under a tag.
pub enum Value {
    /// A single float, e.g. a batch loss.
    Scalar(f64),
    /// A dense float vector.
    Vector(Vec<f64>),
    /// Named parameter vectors.
    Params(BTreeMap<String, Vec<f64>>),
    /// Paillier ciphertexts.
    Ciphertexts(Vec<Ciphertext>),
    /// Decrypted, still masked, plaintexts.
    Plaintexts(Vec<BigUint>),
    /// A Paillier public key.
    PublicKey(PublicKey),
    /// Row indices of a batch.
    Indices(Vec<u64>),
    /// A convergence check outcome.
    Status(ConvergenceFlags),
    /// The reason why the sender gave up on the run.
    Abort(String),
}

impl Value {
    /// Gets the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Vector(_) => ValueKind::Vector,
            Value::Params(_) => ValueKind::Params,
            Value::Ciphertexts(_) => ValueKind::Ciphertexts,
            Value::Plaintexts(_) => ValueKind::Plaintexts,
            Value::PublicKey(_) => ValueKind::PublicKey,
            Value::Indices(_) => ValueKind::Indices,
            Value::Status(_) => ValueKind::Status,
            Value::Abort(_) => ValueKind::Abort,
        }
    }

    fn body_length(&self) -> usize {
        match self {
            Value::Scalar(_) => 8,
            Value::Vector(vector) => vector.buffer_length(),
            Value::Params(params) => params
                .iter()
                .map(|(name, vector)| name.buffer_length() + vector.buffer_length())
                .sum(),
            Value::Ciphertexts(ciphertexts) => ciphertexts
                .iter()
                .map(|c| c.as_biguint().buffer_length())
                .sum(),
            Value::Plaintexts(plaintexts) => plaintexts.iter().map(ToBytes::buffer_length).sum(),
            Value::PublicKey(pk) => pk.n().buffer_length(),
            Value::Indices(indices) => indices.buffer_length(),
            Value::Status(_) => 1,
            Value::Abort(reason) => reason.buffer_length(),
        }
    }
}

impl ToBytes for Value {
    fn buffer_length(&self) -> usize {
        HEADER_LENGTH + self.body_length()
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let mut writer = ValueBuffer::new_unchecked(buffer.as_mut());
        writer.set_version(VALUE_VERSION);
        writer.set_kind(self.kind().into());
        writer.set_length(self.buffer_length() as u32);
        let body = writer.body_mut();
        match self {
            Value::Scalar(scalar) => body[..8].copy_from_slice(&scalar.to_be_bytes()),
            Value::Vector(vector) => vector.to_bytes(&mut &mut body[..]),
            Value::Params(params) => {
                let mut offset = 0;
                for (name, vector) in params {
                    offset += encode_sequence(Some(name), &mut body[offset..]);
                    offset += encode_sequence(Some(vector), &mut body[offset..]);
                }
            }
            Value::Ciphertexts(ciphertexts) => {
                let _ = encode_sequence(ciphertexts.iter().map(Ciphertext::as_biguint), body);
            }
            Value::Plaintexts(plaintexts) => {
                let _ = encode_sequence(plaintexts, body);
            }
            Value::PublicKey(pk) => pk.n().to_bytes(&mut &mut body[..]),
            Value::Indices(indices) => indices.to_bytes(&mut &mut body[..]),
            Value::Status(flags) => body[0] = flags.bits(),
            Value::Abort(reason) => reason.to_bytes(&mut &mut body[..]),
        }
    }
}

impl FromBytes for Value {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let reader = ValueBuffer::new(buffer.as_ref())?;
        if reader.version() != VALUE_VERSION {
            return Err(anyhow!("unsupported value version {}", reader.version()));
        }
        let kind = ValueKind::try_from(reader.kind())?;
        let body = reader.body();
        let value = match kind {
            ValueKind::Scalar => {
                if body.len() != 8 {
                    return Err(anyhow!("invalid scalar length {}", body.len()));
                }
                // safe unwrap: the slice is exactly 8 bytes long
                Value::Scalar(f64::from_be_bytes(body.try_into().unwrap()))
            }
            ValueKind::Vector => Value::Vector(single(body).context("invalid vector")?),
            ValueKind::Params => Value::Params(decode_params(body)?),
            ValueKind::Ciphertexts => Value::Ciphertexts(
                decode_sequence::<BigUint>(body)
                    .context("invalid ciphertexts")?
                    .into_iter()
                    .map(Ciphertext::from)
                    .collect(),
            ),
            ValueKind::Plaintexts => {
                Value::Plaintexts(decode_sequence(body).context("invalid plaintexts")?)
            }
            ValueKind::PublicKey => {
                let n: BigUint = single(body).context("invalid public key")?;
                Value::PublicKey(PublicKey::try_from(n).context("invalid public key")?)
            }
            ValueKind::Indices => Value::Indices(single(body).context("invalid indices")?),
            ValueKind::Status => match body {
                [bits] => Value::Status(ConvergenceFlags::from_bits_truncate(*bits)),
                _ => return Err(anyhow!("invalid status length {}", body.len())),
            },
            ValueKind::Abort => Value::Abort(single(body).context("invalid abort reason")?),
        };
        Ok(value)
    }
}

/// Decodes a body made of exactly one Length-Value item.
fn single<T: FromBytes>(body: &[u8]) -> Result<T, DecodeError> {
    let item = LengthValueBuffer::new(body)?;
    if item.length() as usize != body.len() {
        return Err(anyhow!("trailing bytes"));
    }
    T::from_bytes(&body)
}

fn decode_params(body: &[u8]) -> Result<BTreeMap<String, Vec<f64>>, DecodeError> {
    let mut params = BTreeMap::new();
    let mut offset = 0;
    while offset < body.len() {
        let name_field = LengthValueBuffer::new(&body[offset..]).context("invalid param name")?;
        let name = String::from_bytes(&name_field.bytes())?;
        offset += name.buffer_length();

        let vector_field =
            LengthValueBuffer::new(&body[offset..]).context("invalid param vector")?;
        let vector = <Vec<f64>>::from_bytes(&vector_field.bytes())?;
        offset += vector.buffer_length();

        if params.insert(name, vector).is_some() {
            return Err(anyhow!("invalid params: duplicated name"));
        }
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_scalar() {
        let bytes = Value::Scalar(1.5).to_vec();
        let mut expected = vec![
            0x01, // version
            0x01, // kind: scalar
            0x00, 0x00, // reserved
            0x00, 0x00, 0x00, 0x10, // length = 16
        ];
        expected.extend(&1.5_f64.to_be_bytes());
        assert_eq!(bytes, expected);
        assert_eq!(Value::from_bytes(&bytes).unwrap(), Value::Scalar(1.5));
    }

    #[test]
    fn decode_params() {
        let mut params = BTreeMap::new();
        params.insert("bias".to_string(), vec![0.5]);
        params.insert("weights".to_string(), vec![-1.0, 2.0, 0.25]);
        let value = Value::Params(params);
        assert_eq!(Value::from_bytes(&value.to_vec()).unwrap(), value);
    }

    #[test]
    fn decode_empty_vector() {
        let value = Value::Vector(Vec::new());
        let bytes = value.to_vec();
        assert_eq!(bytes.len(), HEADER_LENGTH + 4);
        assert_eq!(Value::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn decode_status() {
        let flags = ConvergenceFlags::BEST_ITER_CHANGED | ConvergenceFlags::CONVERGED;
        let bytes = Value::Status(flags).to_vec();
        assert_eq!(bytes[HEADER_LENGTH], 0b11);
        assert_eq!(Value::from_bytes(&bytes).unwrap(), Value::Status(flags));
    }

    #[test]
    fn decode_ignores_trailing_bytes_after_length() {
        let mut bytes = Value::Indices(vec![3, 1, 4]).to_vec();
        bytes.extend(&[0xff, 0xff]);
        assert_eq!(
            Value::from_bytes(&bytes).unwrap(),
            Value::Indices(vec![3, 1, 4])
        );
    }

    #[test]
    fn decode_invalid_header() {
        let mut bytes = Value::Scalar(1.0).to_vec();
        bytes[ranges::VERSION] = 2;
        assert!(Value::from_bytes(&bytes).is_err());

        let mut bytes = Value::Scalar(1.0).to_vec();
        bytes[ranges::KIND] = 42;
        assert!(Value::from_bytes(&bytes).is_err());

        let bytes = Value::Scalar(1.0).to_vec();
        assert!(Value::from_bytes(&&bytes[..HEADER_LENGTH + 4]).is_err());
    }

    #[test]
    fn decode_kind_mismatch() {
        // a vector body under a scalar header
        let mut bytes = Value::Vector(vec![1.0]).to_vec();
        bytes[ranges::KIND] = ValueKind::Scalar.into();
        assert!(Value::from_bytes(&bytes).is_err());
    }
}
