//! Core type aliases and value model shared by every module.

use chrono::NaiveDateTime;

use crate::codec::decimal::Decimal;

/// Physical page number (0-indexed; the header page is page 0).
pub type PageId = u32;

/// Sentinel for "no page": endpoints of the leaf chain, empty trees.
pub const NO_PAGE: PageId = u32::MAX;

/// Row identifier assigned by the upper module.
pub type RowId = u32;

/// All on-page data is addressed in 32-bit words.
pub type Word = u32;

/// Bytes per word.
pub const WORD_BYTES: usize = 4;

/// Fix mode requested when attaching a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    ReadOnly,
    Write,
    Allocate,
    /// Resolve to the file's current open mode.
    Unknown,
}

/// String sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collation {
    /// Column default: PAD SPACE for fixed-width, NO PAD for variable.
    Implicit,
    PadSpace,
    NoPad,
}

/// Character encoding of a string field on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingForm {
    Utf8,
    Ucs2,
}

/// Comparison operators recognized by the condition compiler and the
/// executable plan. `Unknown` denotes a condition that can never hit;
/// `Undefined` denotes an absent bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEquals,
    LessThan,
    LessThanEquals,
    Like,
    EqualsToNull,
    Unknown,
    Undefined,
}

impl CompareOp {
    /// True when an entry comparing as `ordering` against the operand
    /// satisfies this operator (three-way result from the comparator).
    pub fn admits(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Equals => ordering == Equal,
            CompareOp::NotEquals => ordering != Equal,
            CompareOp::GreaterThan => ordering == Greater,
            CompareOp::GreaterThanEquals => ordering != Less,
            CompareOp::LessThan => ordering == Less,
            CompareOp::LessThanEquals => ordering != Greater,
            _ => false,
        }
    }
}

/// A logical value crossing the module boundary. The codec dumps these
/// into word buffers and loads them back.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    F64(f64),
    String {
        text: String,
        collation: Collation,
    },
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    LanguageSet(Vec<u32>),
    ObjectId(u64),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Value::String {
            text: text.into(),
            collation: Collation::Implicit,
        }
    }

    pub fn string_no_pad(text: impl Into<String>) -> Self {
        Value::String {
            text: text.into(),
            collation: Collation::NoPad,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_compare_op_admits() {
        assert!(CompareOp::Equals.admits(Ordering::Equal));
        assert!(!CompareOp::Equals.admits(Ordering::Less));
        assert!(CompareOp::NotEquals.admits(Ordering::Greater));
        assert!(CompareOp::GreaterThan.admits(Ordering::Greater));
        assert!(!CompareOp::GreaterThan.admits(Ordering::Equal));
        assert!(CompareOp::GreaterThanEquals.admits(Ordering::Equal));
        assert!(CompareOp::LessThan.admits(Ordering::Less));
        assert!(CompareOp::LessThanEquals.admits(Ordering::Equal));
        assert!(!CompareOp::Undefined.admits(Ordering::Equal));
    }

    #[test]
    fn test_value_constructors() {
        assert!(Value::Null.is_null());
        let v = Value::string_no_pad("abc");
        match v {
            Value::String { collation, .. } => assert_eq!(collation, Collation::NoPad),
            _ => panic!("not a string"),
        }
    }
}
