//! Packed decimal values.
//!
//! A decimal is a scaled 128-bit integer bounded by a declared
//! `(precision, scale)` pair. The on-disk form is a one-word byte-length
//! header followed by the canonical dump: one meta word and four
//! magnitude words.

use std::cmp::Ordering;

use crate::error::{Error, ErrorCode, Result};
use crate::types::CompareOp;

/// Maximum representable precision in decimal digits.
pub const MAX_PRECISION: u8 = 36;

/// Canonical dump length in bytes: meta word + 128-bit magnitude.
pub const DUMP_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    /// Scaled integer value, sign included: the represented number is
    /// `mantissa / 10^scale`.
    mantissa: i128,
    precision: u8,
    scale: u8,
}

fn pow10(n: u8) -> i128 {
    10i128.pow(n as u32)
}

impl Decimal {
    pub fn new(mantissa: i128, precision: u8, scale: u8) -> Result<Self> {
        if precision == 0 || precision > MAX_PRECISION || scale > precision {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        if mantissa.abs() >= pow10(precision) {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        Ok(Decimal {
            mantissa,
            precision,
            scale,
        })
    }

    /// Largest value representable under `(precision, scale)`.
    pub fn max(precision: u8, scale: u8) -> Self {
        Decimal {
            mantissa: pow10(precision) - 1,
            precision,
            scale,
        }
    }

    /// Smallest value representable under `(precision, scale)`.
    pub fn min(precision: u8, scale: u8) -> Self {
        Decimal {
            mantissa: -(pow10(precision) - 1),
            precision,
            scale,
        }
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Parse a SQL numeric literal. Returns the exactly-scaled mantissa
    /// and the count of significant fraction digits beyond `scale` that
    /// were cut off (zero when the literal fits the scale exactly).
    fn parse_parts(text: &str, scale: u8) -> Result<(i128, bool)> {
        let t = text.trim();
        if t.is_empty() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let (neg, digits) = match t.as_bytes()[0] {
            b'-' => (true, &t[1..]),
            b'+' => (false, &t[1..]),
            _ => (false, t),
        };
        let mut int_part: i128 = 0;
        let mut frac: i128 = 0;
        let mut frac_seen: u8 = 0;
        let mut cut_nonzero = false;
        let mut in_frac = false;
        let mut any = false;
        for b in digits.bytes() {
            match b {
                b'0'..=b'9' => {
                    any = true;
                    let d = (b - b'0') as i128;
                    if in_frac {
                        if frac_seen < scale {
                            frac = frac * 10 + d;
                            frac_seen += 1;
                        } else if d != 0 {
                            cut_nonzero = true;
                        }
                    } else {
                        int_part = int_part
                            .checked_mul(10)
                            .and_then(|v| v.checked_add(d))
                            .ok_or(Error::new(ErrorCode::BadArgument))?;
                    }
                }
                b'.' if !in_frac => in_frac = true,
                _ => return Err(Error::new(ErrorCode::BadArgument)),
            }
        }
        if !any {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        while frac_seen < scale {
            frac *= 10;
            frac_seen += 1;
        }
        let mut mantissa = int_part
            .checked_mul(pow10(scale))
            .and_then(|v| v.checked_add(frac))
            .ok_or(Error::new(ErrorCode::BadArgument))?;
        if neg {
            mantissa = -mantissa;
        }
        Ok((mantissa, cut_nonzero))
    }

    /// Parse a literal that is known to fit `(precision, scale)`.
    pub fn parse(text: &str, precision: u8, scale: u8) -> Result<Self> {
        let (mantissa, cut) = Self::parse_parts(text, scale)?;
        if cut {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        Decimal::new(mantissa, precision, scale)
    }

    /// Coerce a comparison operand onto the column's `(precision, scale)`
    /// grid, adjusting the operator so that the integer-grid comparison
    /// preserves the original real-number semantics. Returns `None` when
    /// the condition can never hit.
    ///
    /// `NotEquals` deliberately widens to `>= min(p, s)`; the caller
    /// keeps the original `!=` as a post-filter.
    pub fn round(
        text: &str,
        op: CompareOp,
        precision: u8,
        scale: u8,
    ) -> Result<Option<(Decimal, CompareOp)>> {
        if op == CompareOp::NotEquals {
            return Ok(Some((Decimal::min(precision, scale), CompareOp::GreaterThanEquals)));
        }
        let (mut mantissa, cut) = Self::parse_parts(text, scale)?;
        if cut {
            // The operand has more fraction digits than the column.
            match op {
                CompareOp::Equals => return Ok(None),
                CompareOp::GreaterThanEquals => {
                    // x >= v.ddd  ==  x >= trunc(v) + 1ulp for positive cut;
                    // truncation moved a negative operand toward zero.
                    if mantissa >= 0 {
                        mantissa += 1;
                    }
                }
                CompareOp::GreaterThan => {
                    if mantissa < 0 {
                        mantissa -= 1;
                    }
                }
                CompareOp::LessThan => {
                    if mantissa >= 0 {
                        mantissa += 1;
                    }
                }
                CompareOp::LessThanEquals => {
                    if mantissa < 0 {
                        mantissa -= 1;
                    }
                }
                _ => return Err(Error::new(ErrorCode::BadArgument)),
            }
        }
        let limit = pow10(precision);
        if mantissa >= limit {
            // Above every representable value.
            return Ok(match op {
                CompareOp::Equals | CompareOp::GreaterThan | CompareOp::GreaterThanEquals => None,
                _ => Some((Decimal::max(precision, scale), CompareOp::LessThanEquals)),
            });
        }
        if mantissa <= -limit {
            return Ok(match op {
                CompareOp::Equals | CompareOp::LessThan | CompareOp::LessThanEquals => None,
                _ => Some((Decimal::min(precision, scale), CompareOp::GreaterThanEquals)),
            });
        }
        Ok(Some((
            Decimal {
                mantissa,
                precision,
                scale,
            },
            op,
        )))
    }

    /// Value comparison across possibly different scales.
    pub fn compare(&self, other: &Decimal) -> Ordering {
        if self.scale == other.scale {
            return self.mantissa.cmp(&other.mantissa);
        }
        let (a, b) = if self.scale < other.scale {
            (
                self.mantissa.checked_mul(pow10(other.scale - self.scale)),
                Some(other.mantissa),
            )
        } else {
            (
                Some(self.mantissa),
                other.mantissa.checked_mul(pow10(self.scale - other.scale)),
            )
        };
        match (a, b) {
            (Some(a), Some(b)) => a.cmp(&b),
            // Widening overflowed: that side's magnitude dominates.
            (None, _) => {
                if self.mantissa < 0 {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (_, None) => {
                if other.mantissa < 0 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
        }
    }

    /// Canonical dump: meta word (precision, scale, sign) then the
    /// 128-bit magnitude, little-endian words.
    pub fn dump_canonical(&self, out: &mut Vec<u8>) {
        out.push(self.precision);
        out.push(self.scale);
        out.push(u8::from(self.mantissa < 0));
        out.push(0);
        out.extend_from_slice(&self.mantissa.unsigned_abs().to_le_bytes());
    }

    pub fn load_canonical(buf: &[u8]) -> Result<Self> {
        if buf.len() < DUMP_BYTES {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let precision = buf[0];
        let scale = buf[1];
        let negative = buf[2] != 0;
        let mut mag = [0u8; 16];
        mag.copy_from_slice(&buf[4..20]);
        let magnitude = u128::from_le_bytes(mag);
        if precision == 0 || precision > MAX_PRECISION || scale > precision {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let mantissa = magnitude as i128;
        Ok(Decimal {
            mantissa: if negative { -mantissa } else { mantissa },
            precision,
            scale,
        })
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mag = self.mantissa.unsigned_abs();
        let scale = pow10(self.scale) as u128;
        let sign = if self.mantissa < 0 { "-" } else { "" };
        if self.scale == 0 {
            write!(f, "{}{}", sign, mag)
        } else {
            write!(
                f,
                "{}{}.{:0width$}",
                sign,
                mag / scale,
                mag % scale,
                width = self.scale as usize
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let d = Decimal::parse("123.45", 5, 2).unwrap();
        assert_eq!(d.mantissa(), 12345);
        assert_eq!(d.to_string(), "123.45");
        let d = Decimal::parse("-0.07", 5, 2).unwrap();
        assert_eq!(d.mantissa(), -7);
        assert_eq!(d.to_string(), "-0.07");
    }

    #[test]
    fn test_parse_rejects_overflow() {
        assert!(Decimal::parse("1000", 3, 0).is_err());
        assert!(Decimal::parse("1.234", 5, 2).is_err());
    }

    #[test]
    fn test_compare_across_scales() {
        let a = Decimal::parse("1.5", 5, 1).unwrap();
        let b = Decimal::parse("1.50", 6, 2).unwrap();
        let c = Decimal::parse("1.51", 6, 2).unwrap();
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert_eq!(a.compare(&c), Ordering::Less);
        assert_eq!(c.compare(&a), Ordering::Greater);
    }

    #[test]
    fn test_round_exact() {
        let (d, op) = Decimal::round("2.50", CompareOp::Equals, 5, 2)
            .unwrap()
            .unwrap();
        assert_eq!(d.mantissa(), 250);
        assert_eq!(op, CompareOp::Equals);
    }

    #[test]
    fn test_round_fractional_equals_misses() {
        assert!(Decimal::round("2.505", CompareOp::Equals, 5, 2)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_round_fractional_bounds() {
        // x > 2.505 over scale 2 admits 2.51 and above.
        let (d, op) = Decimal::round("2.505", CompareOp::GreaterThan, 5, 2)
            .unwrap()
            .unwrap();
        assert_eq!((d.mantissa(), op), (250, CompareOp::GreaterThan));
        // x < 2.505 admits 2.50 and below.
        let (d, op) = Decimal::round("2.505", CompareOp::LessThan, 5, 2)
            .unwrap()
            .unwrap();
        assert_eq!((d.mantissa(), op), (251, CompareOp::LessThan));
    }

    #[test]
    fn test_round_out_of_range_clamps() {
        // Precision 3, scale 0: representable range is -999..=999.
        let (d, op) = Decimal::round("5000", CompareOp::LessThan, 3, 0)
            .unwrap()
            .unwrap();
        assert_eq!((d.mantissa(), op), (999, CompareOp::LessThanEquals));
        assert!(Decimal::round("5000", CompareOp::GreaterThan, 3, 0)
            .unwrap()
            .is_none());
        let (d, op) = Decimal::round("-5000", CompareOp::GreaterThanEquals, 3, 0)
            .unwrap()
            .unwrap();
        assert_eq!((d.mantissa(), op), (-999, CompareOp::GreaterThanEquals));
    }

    #[test]
    fn test_round_not_equals_widens() {
        let (d, op) = Decimal::round("1.00", CompareOp::NotEquals, 5, 2)
            .unwrap()
            .unwrap();
        assert_eq!(d, Decimal::min(5, 2));
        assert_eq!(op, CompareOp::GreaterThanEquals);
    }

    #[test]
    fn test_canonical_round_trip() {
        let d = Decimal::parse("-987.654", 9, 3).unwrap();
        let mut buf = Vec::new();
        d.dump_canonical(&mut buf);
        assert_eq!(buf.len(), DUMP_BYTES);
        let back = Decimal::load_canonical(&buf).unwrap();
        assert_eq!(back, d);
    }
}
