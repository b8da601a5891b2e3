//! Typed-field codec.
//!
//! Every field type knows its dumped size in 32-bit words, how to dump a
//! logical [`Value`] into a byte buffer, how to load it back, and how to
//! compare two dumped fields without materializing them. Variable-width
//! types carry a length prefix; every dump is padded to a word boundary.
//! Buffers are little-endian.

pub mod decimal;
pub mod like;

use std::cmp::Ordering;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Collation, CompareOp, Value, WORD_BYTES};

use decimal::Decimal;

/// Field types storable in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int32,
    UInt32,
    F64,
    Decimal,
    /// Narrow string, PAD SPACE order. One byte per character; non-ASCII
    /// code points dump as the marker byte 0x80.
    CharString,
    /// UCS-2 string, PAD SPACE order.
    UnicodeString,
    NoPadCharString,
    NoPadUnicodeString,
    DateTime,
    ObjectId,
    LanguageSet,
    Int64,
}

impl FieldType {
    pub fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::CharString
                | FieldType::UnicodeString
                | FieldType::NoPadCharString
                | FieldType::NoPadUnicodeString
        )
    }

    pub fn is_fixed_size(self) -> bool {
        !matches!(
            self,
            FieldType::CharString
                | FieldType::UnicodeString
                | FieldType::NoPadCharString
                | FieldType::NoPadUnicodeString
                | FieldType::LanguageSet
                | FieldType::Decimal
        )
    }

    /// NO PAD twin of a PAD SPACE string type; identity otherwise.
    pub fn as_no_pad(self) -> FieldType {
        match self {
            FieldType::CharString => FieldType::NoPadCharString,
            FieldType::UnicodeString => FieldType::NoPadUnicodeString,
            other => other,
        }
    }
}

// ============================================================================
// Little-endian buffer primitives
// ============================================================================

pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    Ok(u64::from_le_bytes(b))
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    if offset + 4 > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Pad `out` with zero bytes up to the next word boundary.
fn pad_to_word(out: &mut Vec<u8>) {
    while out.len() % WORD_BYTES != 0 {
        out.push(0);
    }
}

fn words_for_narrow(char_count: usize) -> usize {
    char_count / WORD_BYTES + 1 + usize::from(char_count % WORD_BYTES > 2)
}

fn words_for_ucs2(unit_count: usize) -> usize {
    unit_count / 2 + 1
}

// ============================================================================
// Size probes
// ============================================================================

/// Dumped size in words, probed from a buffer without materializing.
pub fn size_from_buffer(buf: &[u8], ty: FieldType) -> Result<usize> {
    let words = match ty {
        FieldType::Int32 | FieldType::UInt32 => 1,
        FieldType::F64 | FieldType::Int64 | FieldType::ObjectId | FieldType::DateTime => 2,
        FieldType::CharString | FieldType::NoPadCharString => {
            words_for_narrow(read_u16(buf, 0)? as usize)
        }
        FieldType::UnicodeString | FieldType::NoPadUnicodeString => {
            words_for_ucs2(read_u16(buf, 0)? as usize)
        }
        FieldType::LanguageSet => read_u32(buf, 0)? as usize + 1,
        FieldType::Decimal => read_u32(buf, 0)? as usize / WORD_BYTES + 1,
    };
    if words * WORD_BYTES > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(words)
}

/// Dumped size in words for a logical value.
pub fn size_from_value(value: &Value, ty: FieldType) -> Result<usize> {
    match (value, ty) {
        (Value::Int32(_), FieldType::Int32) | (Value::UInt32(_), FieldType::UInt32) => Ok(1),
        (Value::Int64(_), FieldType::Int64)
        | (Value::F64(_), FieldType::F64)
        | (Value::ObjectId(_), FieldType::ObjectId)
        | (Value::DateTime(_), FieldType::DateTime) => Ok(2),
        (Value::String { text, .. }, FieldType::CharString | FieldType::NoPadCharString) => {
            Ok(words_for_narrow(text.chars().count()))
        }
        (Value::String { text, .. }, FieldType::UnicodeString | FieldType::NoPadUnicodeString) => {
            Ok(words_for_ucs2(text.encode_utf16().count()))
        }
        (Value::LanguageSet(codes), FieldType::LanguageSet) => Ok(codes.len() + 1),
        (Value::Decimal(_), FieldType::Decimal) => Ok(decimal::DUMP_BYTES / WORD_BYTES + 1),
        _ => Err(Error::new(ErrorCode::BadArgument)),
    }
}

/// Advance `p` past one dumped field.
pub fn skip(p: &mut &[u8], ty: FieldType) -> Result<()> {
    let words = size_from_buffer(p, ty)?;
    *p = &p[words * WORD_BYTES..];
    Ok(())
}

// ============================================================================
// Dump / load
// ============================================================================

/// Append the word-aligned dump of `value` to `out`.
pub fn dump(out: &mut Vec<u8>, value: &Value, ty: FieldType) -> Result<()> {
    match (value, ty) {
        (Value::Int32(v), FieldType::Int32) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::UInt32(v), FieldType::UInt32) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::Int64(v), FieldType::Int64) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::F64(v), FieldType::F64) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::ObjectId(v), FieldType::ObjectId) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::DateTime(v), FieldType::DateTime) => {
            out.extend_from_slice(&v.date().num_days_from_ce().to_le_bytes());
            let ms = v.time().num_seconds_from_midnight() * 1000
                + v.time().nanosecond() / 1_000_000;
            out.extend_from_slice(&ms.to_le_bytes());
        }
        (Value::String { text, .. }, FieldType::CharString | FieldType::NoPadCharString) => {
            let count = text.chars().count();
            if count > u16::MAX as usize {
                return Err(Error::new(ErrorCode::BadArgument));
            }
            out.extend_from_slice(&(count as u16).to_le_bytes());
            for c in text.chars() {
                // Non-ASCII collapses to a marker so per-character width
                // stays one byte and ASCII prefixes keep their order.
                out.push(if (c as u32) < 0x80 { c as u8 } else { 0x80 });
            }
            pad_to_word(out);
        }
        (Value::String { text, .. }, FieldType::UnicodeString | FieldType::NoPadUnicodeString) => {
            let units: Vec<u16> = text.encode_utf16().collect();
            if units.len() > u16::MAX as usize {
                return Err(Error::new(ErrorCode::BadArgument));
            }
            out.extend_from_slice(&(units.len() as u16).to_le_bytes());
            for u in &units {
                out.extend_from_slice(&u.to_le_bytes());
            }
            pad_to_word(out);
        }
        (Value::LanguageSet(codes), FieldType::LanguageSet) => {
            out.extend_from_slice(&(codes.len() as u32).to_le_bytes());
            for c in codes {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        (Value::Decimal(d), FieldType::Decimal) => {
            out.extend_from_slice(&(decimal::DUMP_BYTES as u32).to_le_bytes());
            d.dump_canonical(out);
        }
        _ => return Err(Error::new(ErrorCode::BadArgument)),
    }
    Ok(())
}

/// Load one field and advance `p` past it.
pub fn load(p: &mut &[u8], ty: FieldType) -> Result<Value> {
    let words = size_from_buffer(p, ty)?;
    let buf = &p[..words * WORD_BYTES];
    let value = match ty {
        FieldType::Int32 => Value::Int32(read_u32(buf, 0)? as i32),
        FieldType::UInt32 => Value::UInt32(read_u32(buf, 0)?),
        FieldType::Int64 => Value::Int64(read_u64(buf, 0)? as i64),
        FieldType::F64 => Value::F64(f64::from_le_bytes(buf[..8].try_into().unwrap())),
        FieldType::ObjectId => Value::ObjectId(read_u64(buf, 0)?),
        FieldType::DateTime => {
            let days = read_u32(buf, 0)? as i32;
            let ms = read_u32(buf, 4)?;
            let date = NaiveDate::from_num_days_from_ce_opt(days)
                .ok_or(Error::new(ErrorCode::Corrupt))?;
            let time =
                NaiveTime::from_num_seconds_from_midnight_opt(ms / 1000, (ms % 1000) * 1_000_000)
                    .ok_or(Error::new(ErrorCode::Corrupt))?;
            Value::DateTime(NaiveDateTime::new(date, time))
        }
        FieldType::CharString | FieldType::NoPadCharString => {
            let len = read_u16(buf, 0)? as usize;
            let text = buf[2..2 + len].iter().map(|&b| char::from(b)).collect::<String>();
            Value::String {
                text,
                collation: Collation::Implicit,
            }
        }
        FieldType::UnicodeString | FieldType::NoPadUnicodeString => {
            let len = read_u16(buf, 0)? as usize;
            let mut units = Vec::with_capacity(len);
            for i in 0..len {
                units.push(read_u16(buf, 2 + i * 2)?);
            }
            Value::String {
                text: String::from_utf16_lossy(&units),
                collation: Collation::Implicit,
            }
        }
        FieldType::LanguageSet => {
            let count = read_u32(buf, 0)? as usize;
            let mut codes = Vec::with_capacity(count);
            for i in 0..count {
                codes.push(read_u32(buf, 4 + i * 4)?);
            }
            Value::LanguageSet(codes)
        }
        FieldType::Decimal => Value::Decimal(Decimal::load_canonical(&buf[4..])?),
    };
    *p = &p[words * WORD_BYTES..];
    Ok(value)
}

// ============================================================================
// Comparison
// ============================================================================

fn narrow_chars(buf: &[u8]) -> Result<&[u8]> {
    let len = read_u16(buf, 0)? as usize;
    if 2 + len > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(&buf[2..2 + len])
}

fn ucs2_units(buf: &[u8]) -> Result<Vec<u16>> {
    let len = read_u16(buf, 0)? as usize;
    let mut units = Vec::with_capacity(len);
    for i in 0..len {
        units.push(read_u16(buf, 2 + i * 2)?);
    }
    Ok(units)
}

fn compare_lexicographic<T: Ord + Copy>(a: &[T], b: &[T]) -> Ordering {
    let n = a.len().min(b.len());
    for i in 0..n {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// PAD SPACE order: the shorter side is virtually extended with spaces.
fn compare_pad_space<T: Ord + Copy + From<u8>>(a: &[T], b: &[T]) -> Ordering {
    let space = T::from(0x20u8);
    let n = a.len().min(b.len());
    for i in 0..n {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    if a.len() > b.len() {
        for &c in &a[n..] {
            match c.cmp(&space) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    } else if b.len() > a.len() {
        for &c in &b[n..] {
            match c.cmp(&space) {
                Ordering::Equal => {}
                other => return other.reverse(),
            }
        }
        Ordering::Equal
    } else {
        Ordering::Equal
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    if a < b {
        Ordering::Less
    } else if a == b {
        Ordering::Equal
    } else {
        Ordering::Greater
    }
}

/// Compare one field of each buffer, advancing both past the field.
pub fn compare_one(p1: &mut &[u8], p2: &mut &[u8], ty: FieldType) -> Result<Ordering> {
    let w1 = size_from_buffer(p1, ty)?;
    let w2 = size_from_buffer(p2, ty)?;
    let a = &p1[..w1 * WORD_BYTES];
    let b = &p2[..w2 * WORD_BYTES];
    let ordering = match ty {
        FieldType::Int32 => (read_u32(a, 0)? as i32).cmp(&(read_u32(b, 0)? as i32)),
        FieldType::UInt32 => read_u32(a, 0)?.cmp(&read_u32(b, 0)?),
        FieldType::Int64 => (read_u64(a, 0)? as i64).cmp(&(read_u64(b, 0)? as i64)),
        FieldType::ObjectId => read_u64(a, 0)?.cmp(&read_u64(b, 0)?),
        FieldType::F64 => cmp_f64(
            f64::from_le_bytes(a[..8].try_into().unwrap()),
            f64::from_le_bytes(b[..8].try_into().unwrap()),
        ),
        FieldType::DateTime => (read_u32(a, 0)? as i32, read_u32(a, 4)?)
            .cmp(&(read_u32(b, 0)? as i32, read_u32(b, 4)?)),
        FieldType::CharString => compare_pad_space(narrow_chars(a)?, narrow_chars(b)?),
        FieldType::NoPadCharString => compare_lexicographic(narrow_chars(a)?, narrow_chars(b)?),
        FieldType::UnicodeString => compare_pad_space(&ucs2_units(a)?, &ucs2_units(b)?),
        FieldType::NoPadUnicodeString => {
            compare_lexicographic(&ucs2_units(a)?, &ucs2_units(b)?)
        }
        FieldType::LanguageSet => {
            let ca = read_u32(a, 0)? as usize;
            let cb = read_u32(b, 0)? as usize;
            let mut ordering = Ordering::Equal;
            for i in 0..ca.min(cb) {
                ordering = read_u32(a, 4 + i * 4)?.cmp(&read_u32(b, 4 + i * 4)?);
                if ordering != Ordering::Equal {
                    break;
                }
            }
            if ordering == Ordering::Equal {
                ordering = ca.cmp(&cb);
            }
            ordering
        }
        FieldType::Decimal => {
            Decimal::load_canonical(&a[4..])?.compare(&Decimal::load_canonical(&b[4..])?)
        }
    };
    *p1 = &p1[w1 * WORD_BYTES..];
    *p2 = &p2[w2 * WORD_BYTES..];
    Ok(ordering)
}

/// LIKE one field: `p1` is the candidate, `p2` the pattern. Non-string
/// types degrade to an equality test. Both slices advance.
pub fn like_one(
    p1: &mut &[u8],
    p2: &mut &[u8],
    ty: FieldType,
    escape: Option<char>,
) -> Result<bool> {
    match ty {
        FieldType::CharString | FieldType::NoPadCharString => {
            let w1 = size_from_buffer(p1, ty)?;
            let w2 = size_from_buffer(p2, ty)?;
            let result = like::like(
                narrow_chars(&p1[..w1 * WORD_BYTES])?,
                narrow_chars(&p2[..w2 * WORD_BYTES])?,
                escape.map(|c| c as u8),
            )?;
            *p1 = &p1[w1 * WORD_BYTES..];
            *p2 = &p2[w2 * WORD_BYTES..];
            Ok(result)
        }
        FieldType::UnicodeString | FieldType::NoPadUnicodeString => {
            let w1 = size_from_buffer(p1, ty)?;
            let w2 = size_from_buffer(p2, ty)?;
            let result = like::like(
                &ucs2_units(&p1[..w1 * WORD_BYTES])?,
                &ucs2_units(&p2[..w2 * WORD_BYTES])?,
                escape.map(|c| c as u16),
            )?;
            *p1 = &p1[w1 * WORD_BYTES..];
            *p2 = &p2[w2 * WORD_BYTES..];
            Ok(result)
        }
        _ => Ok(compare_one(p1, p2, ty)? == Ordering::Equal),
    }
}

// ============================================================================
// Numeric rounding
// ============================================================================

/// Round an `f64` comparison operand onto the `i32` grid. `None` means
/// the condition can never hit. The operator is adjusted so the integer
/// comparison keeps the real-number semantics (`x > 3.5` ⇔ `x > 3` on
/// integers; out-of-range bounds clamp to the nearest representable
/// value with `>` relaxed to `>=`, `<` to `<=`).
pub fn round_f64_to_i32(d: f64, op: CompareOp) -> Option<(i32, CompareOp)> {
    if d == (d as i32) as f64 && d >= i32::MIN as f64 && d <= i32::MAX as f64 {
        return Some((d as i32, op));
    }
    let max = i32::MAX as f64;
    let min = i32::MIN as f64;
    let fl = d.floor();
    match op {
        CompareOp::Equals => None,
        CompareOp::GreaterThan => {
            if d > max {
                None
            } else if d < min {
                Some((i32::MIN, CompareOp::GreaterThanEquals))
            } else {
                Some((fl as i32, CompareOp::GreaterThan))
            }
        }
        CompareOp::GreaterThanEquals => {
            if d > max {
                None
            } else if d < min {
                Some((i32::MIN, CompareOp::GreaterThanEquals))
            } else {
                Some((fl as i32 + 1, CompareOp::GreaterThanEquals))
            }
        }
        CompareOp::LessThan => {
            if d < min {
                None
            } else if d > max {
                Some((i32::MAX, CompareOp::LessThanEquals))
            } else {
                Some((fl as i32 + 1, CompareOp::LessThan))
            }
        }
        CompareOp::LessThanEquals => {
            if d < min {
                None
            } else if d > max {
                Some((i32::MAX, CompareOp::LessThanEquals))
            } else {
                Some((fl as i32, CompareOp::LessThanEquals))
            }
        }
        _ => None,
    }
}

/// Round an `i64` comparison operand onto the `i32` grid.
pub fn round_i64_to_i32(v: i64, op: CompareOp) -> Option<(i32, CompareOp)> {
    if let Ok(v) = i32::try_from(v) {
        return Some((v, op));
    }
    match op {
        CompareOp::Equals => None,
        CompareOp::GreaterThan => {
            if v > i32::MAX as i64 {
                None
            } else {
                Some((i32::MIN, CompareOp::GreaterThanEquals))
            }
        }
        CompareOp::GreaterThanEquals => {
            if v > i32::MAX as i64 {
                None
            } else {
                Some((i32::MIN, CompareOp::GreaterThanEquals))
            }
        }
        CompareOp::LessThan => {
            if v < i32::MIN as i64 {
                None
            } else {
                Some((i32::MAX, CompareOp::LessThanEquals))
            }
        }
        CompareOp::LessThanEquals => {
            if v < i32::MIN as i64 {
                None
            } else {
                Some((i32::MAX, CompareOp::LessThanEquals))
            }
        }
        _ => None,
    }
}

/// Round an `f64` comparison operand onto the `i64` grid.
pub fn round_f64_to_i64(d: f64, op: CompareOp) -> Option<(i64, CompareOp)> {
    // 2^63: the first f64 above i64::MAX.
    let above = 9_223_372_036_854_775_808.0f64;
    let min = i64::MIN as f64;
    if d >= min && d < above && d == d.trunc() {
        return Some((d as i64, op));
    }
    let fl = d.floor();
    match op {
        CompareOp::Equals => None,
        CompareOp::GreaterThan => {
            if d >= above {
                None
            } else if d < min {
                Some((i64::MIN, CompareOp::GreaterThanEquals))
            } else {
                Some((fl as i64, CompareOp::GreaterThan))
            }
        }
        CompareOp::GreaterThanEquals => {
            if d >= above {
                None
            } else if d < min {
                Some((i64::MIN, CompareOp::GreaterThanEquals))
            } else {
                Some((fl as i64 + 1, CompareOp::GreaterThanEquals))
            }
        }
        CompareOp::LessThan => {
            if d < min {
                None
            } else if d >= above {
                Some((i64::MAX, CompareOp::LessThanEquals))
            } else {
                Some((fl as i64 + 1, CompareOp::LessThan))
            }
        }
        CompareOp::LessThanEquals => {
            if d < min {
                None
            } else if d >= above {
                Some((i64::MAX, CompareOp::LessThanEquals))
            } else {
                Some((fl as i64, CompareOp::LessThanEquals))
            }
        }
        _ => None,
    }
}

/// Parse a SQL datetime literal: `YYYY-MM-DD[ hh:mm:ss[.fff]]`.
pub fn parse_datetime_literal(text: &str) -> Result<NaiveDateTime> {
    let t = text.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if fmt == "%Y-%m-%d" {
            if let Ok(d) = NaiveDate::parse_from_str(t, fmt) {
                return Ok(NaiveDateTime::new(d, NaiveTime::MIN));
            }
        } else if let Ok(dt) = NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(dt);
        }
    }
    Err(Error::new(ErrorCode::BadArgument))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_one(v: &Value, ty: FieldType) -> Vec<u8> {
        let mut out = Vec::new();
        dump(&mut out, v, ty).unwrap();
        out
    }

    #[test]
    fn test_fixed_round_trip() {
        for (v, ty) in [
            (Value::Int32(-5), FieldType::Int32),
            (Value::UInt32(7), FieldType::UInt32),
            (Value::Int64(-1 << 40), FieldType::Int64),
            (Value::F64(2.5), FieldType::F64),
            (Value::ObjectId(0xdead_beef_cafe), FieldType::ObjectId),
        ] {
            let buf = dump_one(&v, ty);
            assert_eq!(buf.len() % WORD_BYTES, 0);
            assert_eq!(buf.len() / WORD_BYTES, size_from_value(&v, ty).unwrap());
            let mut p = &buf[..];
            assert_eq!(load(&mut p, ty).unwrap(), v);
            assert!(p.is_empty());
        }
    }

    #[test]
    fn test_narrow_string_layout() {
        // Two header bytes share the first word with the payload.
        let buf = dump_one(&Value::string("ab"), FieldType::CharString);
        assert_eq!(buf.len(), 4);
        let buf = dump_one(&Value::string("abc"), FieldType::CharString);
        assert_eq!(buf.len(), 8);
        let buf = dump_one(&Value::string(""), FieldType::CharString);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_narrow_non_ascii_marker() {
        let buf = dump_one(&Value::string("aé"), FieldType::CharString);
        assert_eq!(buf[2], b'a');
        assert_eq!(buf[3], 0x80);
    }

    #[test]
    fn test_string_round_trip() {
        let v = Value::string("hello");
        let buf = dump_one(&v, FieldType::UnicodeString);
        let mut p = &buf[..];
        match load(&mut p, FieldType::UnicodeString).unwrap() {
            Value::String { text, .. } => assert_eq!(text, "hello"),
            _ => panic!("not a string"),
        }
    }

    #[test]
    fn test_pad_space_compare() {
        let a = dump_one(&Value::string("abc"), FieldType::CharString);
        let b = dump_one(&Value::string("abc   "), FieldType::CharString);
        let c = dump_one(&Value::string("abd"), FieldType::CharString);
        let d = dump_one(&Value::string("abc\n"), FieldType::CharString);
        let cmp = |x: &[u8], y: &[u8]| {
            compare_one(&mut &x[..], &mut &y[..], FieldType::CharString).unwrap()
        };
        assert_eq!(cmp(&a, &b), Ordering::Equal);
        assert_eq!(cmp(&a, &c), Ordering::Less);
        // A char below space in the tail sorts before the bare string.
        assert_eq!(cmp(&d, &a), Ordering::Less);
    }

    #[test]
    fn test_no_pad_compare() {
        let a = dump_one(&Value::string("abc"), FieldType::NoPadCharString);
        let b = dump_one(&Value::string("abc "), FieldType::NoPadCharString);
        let cmp = |x: &[u8], y: &[u8]| {
            compare_one(&mut &x[..], &mut &y[..], FieldType::NoPadCharString).unwrap()
        };
        assert_eq!(cmp(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_compare_advances_both() {
        let a = dump_one(&Value::string("xy"), FieldType::CharString);
        let b = dump_one(&Value::string("xylophone"), FieldType::CharString);
        let mut p1 = &a[..];
        let mut p2 = &b[..];
        let _ = compare_one(&mut p1, &mut p2, FieldType::CharString).unwrap();
        assert!(p1.is_empty());
        assert!(p2.is_empty());
    }

    #[test]
    fn test_datetime_round_trip_and_order() {
        let early = parse_datetime_literal("2001-02-03 04:05:06").unwrap();
        let late = parse_datetime_literal("2001-02-03 04:05:06.500").unwrap();
        let a = dump_one(&Value::DateTime(early), FieldType::DateTime);
        let b = dump_one(&Value::DateTime(late), FieldType::DateTime);
        let mut p = &a[..];
        assert_eq!(load(&mut p, FieldType::DateTime).unwrap(), Value::DateTime(early));
        assert_eq!(
            compare_one(&mut &a[..], &mut &b[..], FieldType::DateTime).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_language_set_round_trip() {
        let v = Value::LanguageSet(vec![3, 9, 14]);
        let buf = dump_one(&v, FieldType::LanguageSet);
        assert_eq!(buf.len() / WORD_BYTES, 4);
        let mut p = &buf[..];
        assert_eq!(load(&mut p, FieldType::LanguageSet).unwrap(), v);
    }

    #[test]
    fn test_decimal_field_round_trip() {
        let d = Decimal::parse("12.34", 6, 2).unwrap();
        let v = Value::Decimal(d);
        let buf = dump_one(&v, FieldType::Decimal);
        assert_eq!(
            buf.len() / WORD_BYTES,
            size_from_value(&v, FieldType::Decimal).unwrap()
        );
        let mut p = &buf[..];
        assert_eq!(load(&mut p, FieldType::Decimal).unwrap(), v);
    }

    #[test]
    fn test_like_one_degrades_to_equality() {
        let a = dump_one(&Value::Int32(5), FieldType::Int32);
        let b = dump_one(&Value::Int32(5), FieldType::Int32);
        assert!(like_one(&mut &a[..], &mut &b[..], FieldType::Int32, None).unwrap());
    }

    #[test]
    fn test_round_f64_to_i32() {
        assert_eq!(
            round_f64_to_i32(3.0, CompareOp::Equals),
            Some((3, CompareOp::Equals))
        );
        assert_eq!(round_f64_to_i32(3.5, CompareOp::Equals), None);
        assert_eq!(
            round_f64_to_i32(3.5, CompareOp::GreaterThan),
            Some((3, CompareOp::GreaterThan))
        );
        assert_eq!(
            round_f64_to_i32(3.5, CompareOp::GreaterThanEquals),
            Some((4, CompareOp::GreaterThanEquals))
        );
        assert_eq!(
            round_f64_to_i32(3.5, CompareOp::LessThan),
            Some((4, CompareOp::LessThan))
        );
        assert_eq!(
            round_f64_to_i32(3.5, CompareOp::LessThanEquals),
            Some((3, CompareOp::LessThanEquals))
        );
        // Beyond range.
        assert_eq!(round_f64_to_i32(3e10, CompareOp::GreaterThan), None);
        assert_eq!(
            round_f64_to_i32(3e10, CompareOp::LessThan),
            Some((i32::MAX, CompareOp::LessThanEquals))
        );
        assert_eq!(
            round_f64_to_i32(-3e10, CompareOp::GreaterThan),
            Some((i32::MIN, CompareOp::GreaterThanEquals))
        );
        // Negative fractional keeps real-number semantics.
        assert_eq!(
            round_f64_to_i32(-3.5, CompareOp::GreaterThanEquals),
            Some((-3, CompareOp::GreaterThanEquals))
        );
    }

    #[test]
    fn test_round_i64_to_i32() {
        assert_eq!(
            round_i64_to_i32(42, CompareOp::LessThan),
            Some((42, CompareOp::LessThan))
        );
        assert_eq!(round_i64_to_i32(1 << 40, CompareOp::Equals), None);
        assert_eq!(
            round_i64_to_i32(1 << 40, CompareOp::LessThan),
            Some((i32::MAX, CompareOp::LessThanEquals))
        );
        assert_eq!(
            round_i64_to_i32(-(1 << 40), CompareOp::GreaterThanEquals),
            Some((i32::MIN, CompareOp::GreaterThanEquals))
        );
    }
}
