//! Entry headers and header-aware entry readers.
//!
//! An entry is a packed, word-aligned sequence of field dumps. Trees
//! configured with `UseHeader` prefix each leaf entry with one word:
//! byte 0 carries the expunge flag, byte 1 a null bitmap over the first
//! eight fields. Null fields are absent from the payload; readers skip
//! them by consulting the bitmap. Sizes are never stored — they are
//! recomputed by summing field sizes in type order.

use crate::codec::{self, FieldType};
use crate::error::{Error, ErrorCode, Result};
use crate::types::WORD_BYTES;

/// Most fields a null bitmap can cover.
pub const MAX_NULLABLE_FIELDS: usize = 8;

/// One-word leaf entry header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryHeader {
    expunged: bool,
    null_bitmap: u8,
}

impl EntryHeader {
    pub const SIZE_WORDS: usize = 1;

    pub fn new() -> Self {
        EntryHeader::default()
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < WORD_BYTES {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        Ok(EntryHeader {
            expunged: buf[0] & 1 != 0,
            null_bitmap: buf[1],
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.expunged));
        out.push(self.null_bitmap);
        out.push(0);
        out.push(0);
    }

    pub fn is_expunged(&self) -> bool {
        self.expunged
    }

    pub fn set_expunged(&mut self, flag: bool) {
        self.expunged = flag;
    }

    pub fn is_null(&self, field: usize) -> bool {
        field < MAX_NULLABLE_FIELDS && self.null_bitmap & (1 << field) != 0
    }

    pub fn set_null(&mut self, field: usize, flag: bool) {
        if field < MAX_NULLABLE_FIELDS {
            if flag {
                self.null_bitmap |= 1 << field;
            } else {
                self.null_bitmap &= !(1 << field);
            }
        }
    }

    pub fn null_bitmap(&self) -> u8 {
        self.null_bitmap
    }
}

/// Toggle the expunge flag of a header-carrying entry in place.
pub fn set_expunge_flag(entry: &mut [u8], flag: bool) -> Result<()> {
    if entry.len() < WORD_BYTES {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    if flag {
        entry[0] |= 1;
    } else {
        entry[0] &= !1;
    }
    Ok(())
}

/// Total entry size in words, header included when `has_header`.
pub fn entry_size(buf: &[u8], types: &[FieldType], has_header: bool) -> Result<usize> {
    let mut words = 0;
    let header = if has_header {
        words += EntryHeader::SIZE_WORDS;
        Some(EntryHeader::read(buf)?)
    } else {
        None
    };
    let mut p = &buf[words * WORD_BYTES..];
    for (n, &ty) in types.iter().enumerate() {
        if header.map_or(false, |h| h.is_null(n)) {
            continue;
        }
        let w = codec::size_from_buffer(p, ty)?;
        p = &p[w * WORD_BYTES..];
        words += w;
    }
    Ok(words)
}

/// Byte offset of each field's dump within the entry; `None` for a
/// field the null bitmap marks absent.
pub fn field_offsets(
    buf: &[u8],
    types: &[FieldType],
    has_header: bool,
) -> Result<Vec<Option<usize>>> {
    let mut offsets = Vec::with_capacity(types.len());
    let header = if has_header {
        Some(EntryHeader::read(buf)?)
    } else {
        None
    };
    let mut at = if has_header {
        EntryHeader::SIZE_WORDS * WORD_BYTES
    } else {
        0
    };
    for (n, &ty) in types.iter().enumerate() {
        if header.map_or(false, |h| h.is_null(n)) {
            offsets.push(None);
            continue;
        }
        offsets.push(Some(at));
        let w = codec::size_from_buffer(&buf[at..], ty)?;
        at += w * WORD_BYTES;
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_header_bits() {
        let mut h = EntryHeader::new();
        assert!(!h.is_expunged());
        h.set_expunged(true);
        h.set_null(0, true);
        h.set_null(3, true);
        let mut buf = Vec::new();
        h.write(&mut buf);
        let back = EntryHeader::read(&buf).unwrap();
        assert!(back.is_expunged());
        assert!(back.is_null(0));
        assert!(!back.is_null(1));
        assert!(back.is_null(3));
        assert_eq!(back.null_bitmap(), 0b1001);
    }

    #[test]
    fn test_entry_size_skips_null_fields() {
        let types = [FieldType::CharString, FieldType::Int32, FieldType::UInt32];
        // Field 1 is null: header word + string + trailing rowid only.
        let mut h = EntryHeader::new();
        h.set_null(1, true);
        let mut buf = Vec::new();
        h.write(&mut buf);
        codec::dump(&mut buf, &Value::string("abc"), FieldType::CharString).unwrap();
        codec::dump(&mut buf, &Value::UInt32(9), FieldType::UInt32).unwrap();

        assert_eq!(entry_size(&buf, &types, true).unwrap(), 1 + 2 + 1);
        let offsets = field_offsets(&buf, &types, true).unwrap();
        assert_eq!(offsets[0], Some(4));
        assert_eq!(offsets[1], None);
        assert_eq!(offsets[2], Some(12));
    }

    #[test]
    fn test_expunge_flag_in_place() {
        let mut buf = Vec::new();
        EntryHeader::new().write(&mut buf);
        codec::dump(&mut buf, &Value::Int32(1), FieldType::Int32).unwrap();
        set_expunge_flag(&mut buf, true).unwrap();
        assert!(EntryHeader::read(&buf).unwrap().is_expunged());
        set_expunge_flag(&mut buf, false).unwrap();
        assert!(!EntryHeader::read(&buf).unwrap().is_expunged());
    }
}
