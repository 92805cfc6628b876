//! Fixed-scale decimal arithmetic for prices and quantities.
//!
//! Every price and quantity in the pipeline is carried as a 128-bit signed
//! mantissa with a fixed scale of 10^-18 (the value range of
//! decimal128(38,18)). Arithmetic is checked: running over the representable
//! range is an error, never a silent truncation.
//!
//! A per-symbol "pips" representation (scaled signed 64-bit) is available for
//! compact internal arithmetic via [`PipsCodec`]; conversion in either
//! direction must be exact or it fails.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional decimal digits carried by [`Decimal`].
pub const SCALE: u32 = 18;

/// 10^18, the raw units per whole unit.
pub const ONE_RAW: i128 = 1_000_000_000_000_000_000;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecimalError {
    /// Arithmetic left the decimal128(38,18) range.
    #[error("decimal overflow in {op}")]
    Overflow { op: &'static str },

    /// A string could not be parsed as a fixed-scale decimal.
    #[error("invalid decimal literal {literal:?}")]
    Parse { literal: String },

    /// A value is not exactly representable in the requested pips scale.
    #[error("value {value} not representable at pips scale 1e-{scale}")]
    PipsRange { value: String, scale: u32 },
}

/// Fixed-scale signed decimal: `raw * 10^-18`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(i128);

impl Decimal {
    pub const ZERO: Decimal = Decimal(0);

    /// Build from raw 10^-18 units.
    pub const fn from_raw(raw: i128) -> Self {
        Decimal(raw)
    }

    /// Build from a whole number of units.
    pub fn from_int(v: i64) -> Self {
        Decimal(v as i128 * ONE_RAW)
    }

    pub const fn raw(self) -> i128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Decimal(self.0.abs())
    }

    pub fn checked_add(self, rhs: Decimal) -> Result<Decimal, DecimalError> {
        self.0
            .checked_add(rhs.0)
            .map(Decimal)
            .ok_or(DecimalError::Overflow { op: "add" })
    }

    pub fn checked_sub(self, rhs: Decimal) -> Result<Decimal, DecimalError> {
        self.0
            .checked_sub(rhs.0)
            .map(Decimal)
            .ok_or(DecimalError::Overflow { op: "sub" })
    }

    /// `self * rhs` at the shared 10^-18 scale. Intermediate product is
    /// computed at 10^-36 and rescaled, so the usable operand magnitude is
    /// smaller than for add/sub; overflow is an error.
    pub fn checked_mul(self, rhs: Decimal) -> Result<Decimal, DecimalError> {
        let prod = self
            .0
            .checked_mul(rhs.0)
            .ok_or(DecimalError::Overflow { op: "mul" })?;
        Ok(Decimal(prod / ONE_RAW))
    }

    /// Saturating-precision float view, for metrics only. Output columns
    /// never pass through this.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / ONE_RAW as f64
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let mag = self.0.unsigned_abs();
        let whole = mag / ONE_RAW as u128;
        let frac = mag % ONE_RAW as u128;
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let mut frac_str = format!("{frac:018}");
        while frac_str.ends_with('0') {
            frac_str.pop();
        }
        write!(f, "{sign}{whole}.{frac_str}")
    }
}

impl FromStr for Decimal {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DecimalError::Parse {
            literal: s.to_string(),
        };
        let (neg, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        if body.is_empty() {
            return Err(err());
        }
        let (whole, frac) = match body.split_once('.') {
            Some((w, fr)) => (w, fr),
            None => (body, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > SCALE as usize {
            // More fractional digits than the scale carries: refuse rather
            // than round.
            return Err(err());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let whole_part: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let mut frac_part: i128 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| err())?
        };
        for _ in frac.len()..SCALE as usize {
            frac_part = frac_part.checked_mul(10).ok_or_else(err)?;
        }
        let raw = whole_part
            .checked_mul(ONE_RAW)
            .and_then(|w| w.checked_add(frac_part))
            .ok_or_else(err)?;
        Ok(Decimal(if neg { -raw } else { raw }))
    }
}

/// Exact conversion between [`Decimal`] and a per-symbol scaled i64
/// representation ("pips").
///
/// `scale` is the number of decimal digits the pips carry: a codec with
/// `scale = 8` stores `123.45` as `12_345_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipsCodec {
    scale: u32,
}

impl PipsCodec {
    pub fn new(scale: u32) -> Option<Self> {
        (scale <= SCALE).then_some(PipsCodec { scale })
    }

    pub fn scale(self) -> u32 {
        self.scale
    }

    /// Decimal -> pips. Fails when the value has more precision than the
    /// pips scale or does not fit in i64.
    pub fn to_pips(self, value: Decimal) -> Result<i64, DecimalError> {
        let shift = 10i128.pow(SCALE - self.scale);
        let raw = value.raw();
        if raw % shift != 0 {
            return Err(DecimalError::PipsRange {
                value: value.to_string(),
                scale: self.scale,
            });
        }
        i64::try_from(raw / shift).map_err(|_| DecimalError::PipsRange {
            value: value.to_string(),
            scale: self.scale,
        })
    }

    /// Pips -> decimal. Always exact.
    pub fn from_pips(self, pips: i64) -> Decimal {
        let shift = 10i128.pow(SCALE - self.scale);
        Decimal::from_raw(pips as i128 * shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_roundtrip() {
        for s in ["0", "1", "100.01", "0.000000000000000001", "-42.5", "99.99"] {
            let d: Decimal = s.parse().unwrap();
            let back: Decimal = d.to_string().parse().unwrap();
            assert_eq!(d, back, "{s}");
        }
        assert_eq!("100.00".parse::<Decimal>().unwrap(), Decimal::from_int(100));
    }

    #[test]
    fn parse_rejects_excess_precision_and_junk() {
        assert!("1.0000000000000000001".parse::<Decimal>().is_err()); // 19 frac digits
        assert!("".parse::<Decimal>().is_err());
        assert!("-".parse::<Decimal>().is_err());
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!("abc".parse::<Decimal>().is_err());
    }

    #[test]
    fn checked_ops_overflow() {
        let max = Decimal::from_raw(i128::MAX);
        assert!(max.checked_add(Decimal::from_int(1)).is_err());
        let big = Decimal::from_raw(i128::MAX / 2);
        assert!(big.checked_mul(big).is_err());
        assert_eq!(
            Decimal::from_int(3)
                .checked_mul(Decimal::from_int(4))
                .unwrap(),
            Decimal::from_int(12)
        );
    }

    #[test]
    fn pips_roundtrip_exact_or_error() {
        let codec = PipsCodec::new(8).unwrap();
        let d: Decimal = "12345.6789".parse().unwrap();
        let pips = codec.to_pips(d).unwrap();
        assert_eq!(pips, 1_234_567_890_000);
        assert_eq!(codec.from_pips(pips), d);

        // Finer than 1e-8 is not representable.
        let fine: Decimal = "0.000000001".parse().unwrap();
        assert!(codec.to_pips(fine).is_err());
    }

    #[test]
    fn ordering_follows_value() {
        let a: Decimal = "99.99".parse().unwrap();
        let b: Decimal = "100".parse().unwrap();
        assert!(a < b);
        assert!(Decimal::from_int(-1) < Decimal::ZERO);
    }
}
