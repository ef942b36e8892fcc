//! Masking configuration parameters.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::convert::TryFrom;

use num::{
    bigint::{BigInt, BigUint, Sign, ToBigInt},
    rational::Ratio,
    traits::{pow::Pow, ToPrimitive},
};
use serde::{Deserialize, Serialize};

use crate::mask::MaskError;

/// The largest supported number of decimal digits kept by the fixed-point encoding.
pub const MAX_PRECISION: u8 = 16;

/// Headroom factor between the squared bound and the largest per-row aggregate, which is the
/// Taylor loss `8 ln 2 + 4 |u| + u^2` for a joint predictor `|u| <= 2 * bound`.
pub const AGGREGATE_FACTOR: u32 = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
/// The bounds of the numbers to be masked.
pub enum BoundType {
    /// Numbers absolutely bounded by 1.
    B0 = 0,
    /// Numbers absolutely bounded by 100.
    B2 = 2,
    /// Numbers absolutely bounded by 10_000.
    B4 = 4,
    /// Numbers absolutely bounded by 1_000_000.
    B6 = 6,
}

impl TryFrom<u8> for BoundType {
    type Error = MaskError;

    /// Get the bound type. Fails if the encoding is unknown.
    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Self::B0),
            2 => Ok(Self::B2),
            4 => Ok(Self::B4),
            6 => Ok(Self::B6),
            _ => Err(MaskError::InvalidConfig),
        }
    }
}

impl BoundType {
    /// Gets the absolute bound of the numbers.
    pub fn bound(&self) -> BigInt {
        BigInt::from(10).pow(*self as u8)
    }

    /// Gets the absolute bound of the numbers as a float.
    pub fn bound_f64(&self) -> f64 {
        10_f64.powi(*self as i32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A masking configuration.
///
/// Values are encoded as signed fixed-point integers modulo the public key modulus `n`: a value
/// `x` of degree `d` is scaled by `10^(d * precision)` and rounded, negative results are
/// represented by `n - |x|`. The degree counts how many encoded factors a value is the product
/// of, such that the product of two encodings of degree 1 decodes correctly at degree 2.
///
/// Inputs must be absolutely bounded by the bound type, see [`check_bounds()`], and the modulus
/// must leave room for every aggregate of a batch, see [`check_modulus()`].
///
/// # Examples
///
/// **TOML**
/// ```text
/// [mask]
/// bound_type = "B2"
/// precision = 8
/// ```
///
/// [`check_bounds()`]: MaskConfig::check_bounds
/// [`check_modulus()`]: MaskConfig::check_modulus
pub struct MaskConfig {
    pub bound_type: BoundType,
    pub precision: u8,
}

impl MaskConfig {
    /// Gets the scaling factor of the fixed-point encoding at the given `degree`.
    pub fn exp_shift(&self, degree: u8) -> BigInt {
        BigInt::from(10).pow(u32::from(self.precision) * u32::from(degree))
    }

    /// Gets the smallest modulus which fits every aggregate over `rows` rows.
    pub fn min_modulus(&self, rows: usize) -> BigUint {
        let bound = self.bound_type.bound();
        let max_aggregate = BigInt::from(AGGREGATE_FACTOR)
            * BigInt::from(rows.max(1))
            * &bound
            * &bound
            * self.exp_shift(2);
        // safe unwrap: the product of positive numbers is positive
        (BigInt::from(2) * max_aggregate + 1_u32)
            .to_biguint()
            .unwrap()
    }

    /// Checks that every aggregate over `rows` rows is an element of the signed plaintext space
    /// modulo `modulus`.
    ///
    /// # Errors
    /// Fails if the precision is unsupported or if the modulus is smaller than
    /// [`min_modulus()`].
    ///
    /// [`min_modulus()`]: MaskConfig::min_modulus
    pub fn check_modulus(&self, modulus: &BigUint, rows: usize) -> Result<(), MaskError> {
        if self.precision > MAX_PRECISION {
            return Err(MaskError::InvalidConfig);
        }
        let required = self.min_modulus(rows);
        if modulus < &required {
            return Err(MaskError::ModulusTooSmall {
                bits: modulus.bits(),
                required: required.bits(),
            });
        }
        Ok(())
    }

    /// Checks that all `values` are finite and absolutely bounded by the bound type.
    ///
    /// # Errors
    /// Fails at the first value which is out of bounds.
    pub fn check_bounds(&self, values: &[f64]) -> Result<(), MaskError> {
        let bound = self.bound_type.bound_f64();
        for (index, value) in values.iter().enumerate() {
            if !value.is_finite() {
                return Err(MaskError::NonFinite { index });
            }
            if value.abs() > bound {
                warn!("value {} at index {} exceeds the bound {}", value, index, bound);
                return Err(MaskError::OutOfBounds { index });
            }
        }
        Ok(())
    }

    /// Encodes a value of the given `degree` as an element of the plaintext space modulo
    /// `modulus`.
    ///
    /// # Errors
    /// Fails if the value is not finite or if its encoding doesn't fit into `(-modulus / 2,
    /// modulus / 2)`.
    pub fn encode(&self, value: f64, degree: u8, modulus: &BigUint) -> Result<BigUint, MaskError> {
        let ratio =
            Ratio::<BigInt>::from_float(value).ok_or(MaskError::NonFinite { index: 0 })?;
        let scaled = (ratio * Ratio::from_integer(self.exp_shift(degree)))
            .round()
            .to_integer();
        let magnitude = scaled.magnitude();
        if magnitude * 2_u32 >= *modulus {
            return Err(MaskError::OutOfRange);
        }
        Ok(match scaled.sign() {
            Sign::Minus => modulus - magnitude,
            _ => magnitude.clone(),
        })
    }

    /// Decodes an element of the plaintext space modulo `modulus` as a value of the given
    /// `degree`. Elements above `modulus / 2` decode to negative values.
    ///
    /// # Errors
    /// Fails if `encoded` is not an element of the plaintext space.
    pub fn decode(
        &self,
        encoded: &BigUint,
        degree: u8,
        modulus: &BigUint,
    ) -> Result<f64, MaskError> {
        if encoded >= modulus {
            return Err(MaskError::OutOfGroup);
        }
        // safe unwrap: to_bigint never fails for BigUint
        let mut signed = encoded.to_bigint().unwrap();
        if encoded * 2_u32 > *modulus {
            // safe unwrap: to_bigint never fails for BigUint
            signed -= modulus.to_bigint().unwrap();
        }
        let numer = signed.to_f64().ok_or(MaskError::OutOfRange)?;
        let denom = self.exp_shift(degree).to_f64().ok_or(MaskError::OutOfRange)?;
        Ok(numer / denom)
    }
}
