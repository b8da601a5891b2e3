//! Multi-field entry comparison.
//!
//! A comparator is configured with the field-type sequence of the
//! entries it will see; the raw buffers carry no structure of their own.
//! The node page-id suffix is never part of a comparator: node routing
//! compares only the leading key prefix. Entries of header-carrying
//! trees start with the one-word header; null fields are ordered by the
//! null bitmap rather than a payload dump.

use std::cmp::Ordering;

use crate::codec::{self, FieldType};
use crate::entry::EntryHeader;
use crate::error::Result;
use crate::types::WORD_BYTES;

#[derive(Debug, Clone)]
pub struct EntryComparator {
    field_types: Vec<FieldType>,
    /// Entries are globally unique under this comparator. Unique search
    /// routes through the supremum rule in node pages.
    unique: bool,
    /// Entries begin with a one-word header (expunge flag + null bitmap).
    has_header: bool,
    /// Null fields sort before non-null ones.
    top_null: bool,
}

impl EntryComparator {
    pub fn new(field_types: Vec<FieldType>, unique: bool) -> Self {
        EntryComparator {
            field_types,
            unique,
            has_header: false,
            top_null: true,
        }
    }

    pub fn with_header(field_types: Vec<FieldType>, unique: bool, top_null: bool) -> Self {
        EntryComparator {
            field_types,
            unique,
            has_header: true,
            top_null,
        }
    }

    pub fn field_count(&self) -> usize {
        self.field_types.len()
    }

    pub fn field_types(&self) -> &[FieldType] {
        &self.field_types
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    fn null_rank(&self) -> Ordering {
        if self.top_null {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Field-by-field comparison; the first inequality wins.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        if !self.has_header {
            let mut p1 = a;
            let mut p2 = b;
            for &ty in &self.field_types {
                let ordering = codec::compare_one(&mut p1, &mut p2, ty)?;
                if ordering != Ordering::Equal {
                    return Ok(ordering);
                }
            }
            return Ok(Ordering::Equal);
        }

        let h1 = EntryHeader::read(a)?;
        let h2 = EntryHeader::read(b)?;
        let mut p1 = &a[EntryHeader::SIZE_WORDS * WORD_BYTES..];
        let mut p2 = &b[EntryHeader::SIZE_WORDS * WORD_BYTES..];
        for (n, &ty) in self.field_types.iter().enumerate() {
            let n1 = h1.is_null(n);
            let n2 = h2.is_null(n);
            let ordering = match (n1, n2) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    codec::skip(&mut p2, ty)?;
                    self.null_rank()
                }
                (false, true) => {
                    codec::skip(&mut p1, ty)?;
                    self.null_rank().reverse()
                }
                (false, false) => codec::compare_one(&mut p1, &mut p2, ty)?,
            };
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Ok(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn entry(fields: &[(&Value, FieldType)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (v, ty) in fields {
            codec::dump(&mut out, v, *ty).unwrap();
        }
        out
    }

    fn header_entry(fields: &[(Option<&Value>, FieldType)]) -> Vec<u8> {
        let mut h = EntryHeader::new();
        for (n, (v, _)) in fields.iter().enumerate() {
            if v.is_none() {
                h.set_null(n, true);
            }
        }
        let mut out = Vec::new();
        h.write(&mut out);
        for (v, ty) in fields {
            if let Some(v) = v {
                codec::dump(&mut out, v, *ty).unwrap();
            }
        }
        out
    }

    #[test]
    fn test_multi_field_order() {
        let cmp = EntryComparator::new(
            vec![FieldType::CharString, FieldType::UInt32, FieldType::UInt32],
            true,
        );
        let a = entry(&[
            (&Value::string("abc"), FieldType::CharString),
            (&Value::UInt32(1), FieldType::UInt32),
            (&Value::UInt32(0), FieldType::UInt32),
        ]);
        let b = entry(&[
            (&Value::string("abc"), FieldType::CharString),
            (&Value::UInt32(1), FieldType::UInt32),
            (&Value::UInt32(2), FieldType::UInt32),
        ]);
        let c = entry(&[
            (&Value::string("abd"), FieldType::CharString),
            (&Value::UInt32(0), FieldType::UInt32),
            (&Value::UInt32(0), FieldType::UInt32),
        ]);
        assert_eq!(cmp.compare(&a, &a).unwrap(), Ordering::Equal);
        assert_eq!(cmp.compare(&a, &b).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&b, &c).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&c, &a).unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_key_prefix_comparator() {
        // A key-only comparator sees equal entries where the full one
        // still distinguishes the trailing tie-breakers.
        let full = EntryComparator::new(vec![FieldType::Int32, FieldType::UInt32], true);
        let key = EntryComparator::new(vec![FieldType::Int32], false);
        let a = entry(&[
            (&Value::Int32(10), FieldType::Int32),
            (&Value::UInt32(1), FieldType::UInt32),
        ]);
        let b = entry(&[
            (&Value::Int32(10), FieldType::Int32),
            (&Value::UInt32(2), FieldType::UInt32),
        ]);
        assert_eq!(key.compare(&a, &b).unwrap(), Ordering::Equal);
        assert_eq!(full.compare(&a, &b).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_variable_then_fixed_walk() {
        // Differently-sized leading strings must still align the
        // trailing fixed field correctly.
        let cmp = EntryComparator::new(vec![FieldType::CharString, FieldType::UInt32], true);
        let a = entry(&[
            (&Value::string("ab"), FieldType::CharString),
            (&Value::UInt32(5), FieldType::UInt32),
        ]);
        let b = entry(&[
            (&Value::string("ab    "), FieldType::CharString),
            (&Value::UInt32(9), FieldType::UInt32),
        ]);
        // PAD SPACE makes the strings equal; the rowid decides.
        assert_eq!(cmp.compare(&a, &b).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_null_bitmap_ordering() {
        let types = vec![FieldType::CharString, FieldType::Int32, FieldType::UInt32];
        let cmp = EntryComparator::with_header(types.clone(), true, true);
        let with_null = header_entry(&[
            (Some(&Value::string("abc")), FieldType::CharString),
            (None, FieldType::Int32),
            (Some(&Value::UInt32(1)), FieldType::UInt32),
        ]);
        let without = header_entry(&[
            (Some(&Value::string("abc")), FieldType::CharString),
            (Some(&Value::Int32(5)), FieldType::Int32),
            (Some(&Value::UInt32(2)), FieldType::UInt32),
        ]);
        // Null sorts first under top-null.
        assert_eq!(cmp.compare(&with_null, &without).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&without, &with_null).unwrap(), Ordering::Greater);
        assert_eq!(cmp.compare(&with_null, &with_null).unwrap(), Ordering::Equal);

        let bottom = EntryComparator::with_header(types, true, false);
        assert_eq!(
            bottom.compare(&with_null, &without).unwrap(),
            Ordering::Greater
        );
    }
}
