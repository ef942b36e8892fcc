//! Message traits.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use std::{convert::TryInto, ops::Range};

use anyhow::{anyhow, Context};
use num::bigint::BigUint;

use crate::message::DecodeError;

/// An interface for serializable message types.
///
/// See also [`FromBytes`] for deserialization.
pub trait ToBytes {
    /// The length of the buffer for encoding the type.
    fn buffer_length(&self) -> usize;

    /// Serialize the type in the given buffer.
    ///
    /// # Panics
    /// This method may panic if the given buffer is too small. Thus, [`buffer_length()`] must be
    /// called prior to calling this, and a large enough buffer must be provided.
    ///
    /// [`buffer_length()`]: ToBytes::buffer_length
    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T);

    /// Serialize the type into a newly allocated buffer of the exact size.
    fn to_vec(&self) -> Vec<u8> {
        let mut buffer = vec![0; self.buffer_length()];
        self.to_bytes(&mut buffer);
        buffer
    }
}

/// An interface for deserializable message types.
///
/// See also [`ToBytes`] for serialization.
pub trait FromBytes: Sized {
    /// Deserialize the type from the given buffer.
    ///
    /// # Errors
    /// May fail if certain parts of the deserialized buffer don't pass message validity checks.
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError>;
}

/// A helper for encoding and decoding Length-Value (LV) fields.
///
/// Note that the 4 bytes [`length()`] field gives the length of the *total* Length-Value field,
/// _i.e._ the length of the value, plus the 4 extra bytes of the length field itself.
///
/// # Examples
/// ## Decoding a LV field
///
/// ```rust
/// # use xaynet_secagg::message::LengthValueBuffer;
/// let bytes = vec![
///     0x00, 0x00, 0x00, 0x05, // Length = 5
///     0xff, // Value = 0xff
///     0x11, 0x22, // Extra bytes
/// ];
/// let buffer = LengthValueBuffer::new(&bytes).unwrap();
/// assert_eq!(buffer.length(), 5);
/// assert_eq!(buffer.value_length(), 1);
/// assert_eq!(buffer.value(), &[0xff][..]);
/// ```
///
/// ## Encoding a LV field
///
/// ```rust
/// # use xaynet_secagg::message::LengthValueBuffer;
/// let mut bytes = vec![0xff; 9];
/// let mut buffer = LengthValueBuffer::new_unchecked(&mut bytes);
/// // The length field must be set before the value, otherwise `value_mut()` panics.
/// buffer.set_length(8);
/// buffer.value_mut().copy_from_slice(&[0, 1, 2, 3][..]);
/// let expected = vec![
///     0x00, 0x00, 0x00, 0x08, // Length = 8
///     0x00, 0x01, 0x02, 0x03, // Value
///     0xff, // unchanged
/// ];
///
/// assert_eq!(bytes, expected);
/// ```
///
/// [`length()`]: LengthValueBuffer::length
pub struct LengthValueBuffer<T> {
    inner: T,
}

/// The size of the length field for encoding a Length-Value item.
pub(crate) const LENGTH_FIELD: Range<usize> = 0..4;

impl<T: AsRef<[u8]>> LengthValueBuffer<T> {
    /// Returns a new [`LengthValueBuffer`].
    ///
    /// # Errors
    /// This method performs bound checks and returns an error if the given buffer is not a valid
    /// Length-Value item.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use xaynet_secagg::message::LengthValueBuffer;
    /// // truncated length:
    /// assert!(LengthValueBuffer::new(&vec![0x00, 0x00, 0x00]).is_err());
    ///
    /// // truncated value:
    /// let bytes = vec![
    ///     0x00, 0x00, 0x00, 0x08, // length: 8
    ///     0x11, 0x22, 0x33, // value
    /// ];
    /// assert!(LengthValueBuffer::new(&bytes).is_err());
    ///
    /// // valid Length-Value item
    /// let bytes = vec![
    ///     0x00, 0x00, 0x00, 0x08, // length: 8
    ///     0x11, 0x22, 0x33, 0x44, // value
    ///     0xaa, 0xbb, // extra bytes are ignored
    /// ];
    /// let buf = LengthValueBuffer::new(&bytes).unwrap();
    /// assert_eq!(buf.length(), 8);
    /// assert_eq!(buf.value(), &[0x11, 0x22, 0x33, 0x44][..]);
    /// ```
    pub fn new(bytes: T) -> Result<Self, DecodeError> {
        let buffer = Self { inner: bytes };
        buffer
            .check_buffer_length()
            .context("not a valid LengthValueBuffer")?;
        Ok(buffer)
    }

    /// Create a new [`LengthValueBuffer`] without any bound checks.
    pub fn new_unchecked(bytes: T) -> Self {
        Self { inner: bytes }
    }

    /// Check that the buffer is a valid Length-Value item.
    pub fn check_buffer_length(&self) -> Result<(), DecodeError> {
        let len = self.inner.as_ref().len();
        if len < LENGTH_FIELD.end {
            return Err(anyhow!(
                "invalid buffer length: {} < {}",
                len,
                LENGTH_FIELD.end
            ));
        }

        if (self.length() as usize) < LENGTH_FIELD.end {
            return Err(anyhow!(
                "invalid length value: {} (should be >= {})",
                self.length(),
                LENGTH_FIELD.end
            ));
        }

        if len < self.length() as usize {
            return Err(anyhow!(
                "invalid buffer length: {} < {}",
                len,
                self.length(),
            ));
        }
        Ok(())
    }

    /// Returns the length field. Note that the value of the length
    /// field includes the length of the field itself (4 bytes).
    ///
    /// # Panics
    /// This method may panic if buffer is not a valid Length-Value item.
    pub fn length(&self) -> u32 {
        // unwrap safe: the slice is exactly 4 bytes long
        u32::from_be_bytes(self.inner.as_ref()[LENGTH_FIELD].try_into().unwrap())
    }

    /// Returns the length of the value.
    pub fn value_length(&self) -> usize {
        self.length() as usize - LENGTH_FIELD.end
    }

    /// Returns the range corresponding to the value.
    fn value_range(&self) -> Range<usize> {
        let offset = LENGTH_FIELD.end;
        let value_length = self.value_length();
        offset..offset + value_length
    }
}

impl<T: AsMut<[u8]>> LengthValueBuffer<T> {
    /// Sets the length field to the given value.
    ///
    /// # Panics
    /// This method may panic if buffer is not a valid Length-Value item.
    pub fn set_length(&mut self, value: u32) {
        self.inner.as_mut()[LENGTH_FIELD].copy_from_slice(&value.to_be_bytes());
    }
}

impl<'a, T: AsRef<[u8]> + AsMut<[u8]> + ?Sized> LengthValueBuffer<&'a mut T> {
    /// Gets a mutable reference to the value field.
    ///
    /// # Panics
    /// This method may panic if buffer is not a valid Length-Value item.
    pub fn value_mut(&mut self) -> &mut [u8] {
        let range = self.value_range();
        &mut self.inner.as_mut()[range]
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> LengthValueBuffer<&'a T> {
    /// Gets a reference to the value field.
    ///
    /// # Panics
    /// This method may panic if buffer is not a valid Length-Value item.
    pub fn value(&self) -> &'a [u8] {
        &self.inner.as_ref()[self.value_range()]
    }

    /// Gets a reference to the underlying Length-Value item, without trailing bytes.
    ///
    /// # Panics
    /// This method may panic if buffer is not a valid Length-Value item.
    pub fn bytes(self) -> &'a [u8] {
        let range = self.value_range();
        &self.inner.as_ref()[..range.end]
    }
}

/// Writes a Length-Value item holding `value` at the start of `buffer`.
fn put_length_value(value: &[u8], buffer: &mut [u8]) {
    let mut writer = LengthValueBuffer::new_unchecked(buffer);
    writer.set_length((LENGTH_FIELD.end + value.len()) as u32);
    writer.value_mut().copy_from_slice(value);
}

/// Reads a sequence of items which were written back to back, until `buffer` is exhausted.
pub(crate) fn decode_sequence<T: FromBytes>(buffer: &[u8]) -> Result<Vec<T>, DecodeError> {
    let mut items = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let item = LengthValueBuffer::new(&buffer[offset..])
            .with_context(|| format!("invalid item {} of sequence", items.len()))?;
        offset += item.length() as usize;
        items.push(T::from_bytes(&item.bytes())?);
    }
    Ok(items)
}

/// Writes `items` back to back into `buffer`, returning the number of written bytes.
pub(crate) fn encode_sequence<'a, T, I>(items: I, buffer: &mut [u8]) -> usize
where
    T: ToBytes + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut offset = 0;
    for item in items {
        let length = item.buffer_length();
        item.to_bytes(&mut &mut buffer[offset..offset + length]);
        offset += length;
    }
    offset
}

impl ToBytes for BigUint {
    fn buffer_length(&self) -> usize {
        LENGTH_FIELD.end + self.to_bytes_be().len()
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        put_length_value(&self.to_bytes_be(), buffer.as_mut());
    }
}

impl FromBytes for BigUint {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let reader = LengthValueBuffer::new(buffer.as_ref())?;
        Ok(BigUint::from_bytes_be(reader.value()))
    }
}

impl ToBytes for String {
    fn buffer_length(&self) -> usize {
        LENGTH_FIELD.end + self.len()
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        put_length_value(self.as_bytes(), buffer.as_mut());
    }
}

impl FromBytes for String {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let reader = LengthValueBuffer::new(buffer.as_ref())?;
        String::from_utf8(reader.value().to_vec()).context("invalid utf-8 string")
    }
}

impl ToBytes for Vec<f64> {
    fn buffer_length(&self) -> usize {
        LENGTH_FIELD.end + self.len() * 8
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let bytes: Vec<u8> = self.iter().flat_map(|x| x.to_be_bytes()).collect();
        put_length_value(&bytes, buffer.as_mut());
    }
}

impl FromBytes for Vec<f64> {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let reader = LengthValueBuffer::new(buffer.as_ref())?;
        let mut chunks = reader.value().chunks_exact(8);
        let floats = (&mut chunks)
            // safe unwrap: chunks are exactly 8 bytes long
            .map(|chunk| f64::from_be_bytes(chunk.try_into().unwrap()))
            .collect();
        if !chunks.remainder().is_empty() {
            return Err(anyhow!("invalid float vector: trailing bytes"));
        }
        Ok(floats)
    }
}

impl ToBytes for Vec<u64> {
    fn buffer_length(&self) -> usize {
        LENGTH_FIELD.end + self.len() * 8
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let bytes: Vec<u8> = self.iter().flat_map(|x| x.to_be_bytes()).collect();
        put_length_value(&bytes, buffer.as_mut());
    }
}

impl FromBytes for Vec<u64> {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let reader = LengthValueBuffer::new(buffer.as_ref())?;
        let mut chunks = reader.value().chunks_exact(8);
        let ints = (&mut chunks)
            // safe unwrap: chunks are exactly 8 bytes long
            .map(|chunk| u64::from_be_bytes(chunk.try_into().unwrap()))
            .collect();
        if !chunks.remainder().is_empty() {
            return Err(anyhow!("invalid index vector: trailing bytes"));
        }
        Ok(ints)
    }
}
