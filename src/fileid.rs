//! Persisted file-id: the key-value parameter map stored by the
//! physical-file collaborator, plus the schema probe that resolves field
//! positions into codec types.

use std::collections::BTreeMap;

use crate::codec::FieldType;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{Collation, EncodingForm};

/// Current on-disk schema version.
pub const CURRENT_VERSION: i64 = 4;

/// Files below this version keep the legacy NO-PAD trailing-space
/// behavior in the condition compiler.
pub const VERSION_STRICT_NO_PAD: i64 = 4;

/// Hard ceiling on one entry's size, in words.
pub const MAX_ENTRY_WORDS: usize = 1250;

/// Logical SQL column types as persisted in `FieldType[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Int = 1,
    UInt = 2,
    BigInt = 3,
    Double = 4,
    Decimal = 5,
    Char = 6,
    NChar = 7,
    DateTime = 8,
    Language = 9,
    ObjectId = 10,
}

impl LogicalType {
    fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            1 => LogicalType::Int,
            2 => LogicalType::UInt,
            3 => LogicalType::BigInt,
            4 => LogicalType::Double,
            5 => LogicalType::Decimal,
            6 => LogicalType::Char,
            7 => LogicalType::NChar,
            8 => LogicalType::DateTime,
            9 => LogicalType::Language,
            10 => LogicalType::ObjectId,
            _ => return Err(Error::new(ErrorCode::NotSupported)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// Resolved description of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub field_type: FieldType,
    /// Byte length, or maximum byte length for variable fields.
    pub length: usize,
    pub fixed: bool,
    pub collation: Collation,
    /// Decimal scale.
    pub fraction: u8,
}

/// The persisted parameter map.
#[derive(Debug, Clone, Default)]
pub struct FileParams {
    map: BTreeMap<String, ParamValue>,
}

fn indexed(key: &str, i: usize) -> String {
    format!("{key}[{i}]")
}

impl FileParams {
    pub fn new() -> Self {
        let mut p = FileParams {
            map: BTreeMap::new(),
        };
        p.set_int("Version", CURRENT_VERSION);
        p
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.map.insert(key.to_string(), ParamValue::Int(value));
    }

    pub fn set_indexed_int(&mut self, key: &str, i: usize, value: i64) {
        self.map.insert(indexed(key, i), ParamValue::Int(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.map.insert(key.to_string(), ParamValue::Bool(value));
    }

    pub fn set_indexed_bool(&mut self, key: &str, i: usize, value: bool) {
        self.map.insert(indexed(key, i), ParamValue::Bool(value));
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.map
            .insert(key.to_string(), ParamValue::Str(value.to_string()));
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.map.get(key) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_indexed_int(&self, key: &str, i: usize) -> Option<i64> {
        self.get_int(&indexed(key, i))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.map.get(key) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_indexed_bool(&self, key: &str, i: usize) -> Option<bool> {
        self.get_bool(&indexed(key, i))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key) {
            Some(ParamValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Typed accessors for the well-known keys
    // ------------------------------------------------------------------

    pub fn version(&self) -> i64 {
        self.get_int("Version").unwrap_or(CURRENT_VERSION)
    }

    /// Legacy files compare NO-PAD keys against PAD-SPACE variable
    /// fields with trailing spaces stripped.
    pub fn keeps_legacy_no_pad(&self) -> bool {
        self.version() < VERSION_STRICT_NO_PAD
    }

    pub fn page_size(&self) -> usize {
        self.get_int("PageSize").unwrap_or(4096) as usize
    }

    pub fn key_field_count(&self) -> usize {
        self.get_int("KeyFieldNumber").unwrap_or(1) as usize
    }

    pub fn is_unique(&self) -> bool {
        self.get_bool("Unique").unwrap_or(false)
    }

    pub fn use_header(&self) -> bool {
        self.get_bool("UseHeader").unwrap_or(false)
    }

    pub fn is_normalized(&self) -> bool {
        self.get_bool("Normalized").unwrap_or(false)
    }

    /// Normalization recipe tag; only meaningful with `Normalized`.
    pub fn normalizing_method(&self) -> Option<&str> {
        self.get_str("NormalizingMethod")
    }

    /// Column-assembly hint written by the schema layer.
    pub fn hint_array(&self) -> Option<&str> {
        self.get_str("HintArray")
    }

    /// Highest rowid handed out so far, when the creator tracks it.
    pub fn last_rowid(&self) -> Option<i64> {
        self.get_int("LastRowID")
    }

    pub fn set_last_rowid(&mut self, rowid: i64) {
        self.set_int("LastRowID", rowid);
    }

    pub fn top_null(&self) -> bool {
        self.get_bool("TopNull").unwrap_or(false)
    }

    fn collation_at(&self, key: &str, i: usize) -> Collation {
        match self.get_indexed_int(key, i) {
            Some(1) => Collation::PadSpace,
            Some(2) => Collation::NoPad,
            _ => Collation::Implicit,
        }
    }

    fn encoding_at(&self, i: usize) -> EncodingForm {
        match self.get_indexed_int("FieldEncodingForm", i) {
            Some(1) => EncodingForm::Ucs2,
            _ => EncodingForm::Utf8,
        }
    }

    fn resolve(
        &self,
        logical: LogicalType,
        encoding: EncodingForm,
        collation: Collation,
        fixed: bool,
    ) -> Result<FieldType> {
        Ok(match logical {
            LogicalType::Int => FieldType::Int32,
            LogicalType::UInt => FieldType::UInt32,
            LogicalType::BigInt => FieldType::Int64,
            LogicalType::Double => FieldType::F64,
            LogicalType::Decimal => FieldType::Decimal,
            LogicalType::DateTime => FieldType::DateTime,
            LogicalType::Language => FieldType::LanguageSet,
            LogicalType::ObjectId => FieldType::ObjectId,
            LogicalType::Char | LogicalType::NChar => {
                let no_pad = match collation {
                    Collation::NoPad => true,
                    Collation::PadSpace => false,
                    // Untagged legacy columns sort the way they were
                    // built: fixed ones pad, variable ones do not.
                    Collation::Implicit => !fixed && self.keeps_legacy_no_pad(),
                };
                match (encoding, no_pad) {
                    (EncodingForm::Utf8, false) => FieldType::CharString,
                    (EncodingForm::Utf8, true) => FieldType::NoPadCharString,
                    (EncodingForm::Ucs2, false) => FieldType::UnicodeString,
                    (EncodingForm::Ucs2, true) => FieldType::NoPadUnicodeString,
                }
            }
        })
    }

    /// Resolve the schema of field `i` from `FieldType[i]` and friends.
    pub fn field_schema(&self, i: usize) -> Result<FieldSchema> {
        let code = self
            .get_indexed_int("FieldType", i)
            .ok_or(Error::new(ErrorCode::BadArgument))?;
        let logical = LogicalType::from_code(code)?;
        let fixed = self.get_indexed_bool("FieldFixed", i).unwrap_or(true);
        let collation = self.collation_at("FieldCollation", i);
        let field_type = self.resolve(logical, self.encoding_at(i), collation, fixed)?;
        Ok(FieldSchema {
            field_type,
            length: self.get_indexed_int("FieldLength", i).unwrap_or(0) as usize,
            fixed,
            collation,
            fraction: self.get_indexed_int("FieldFraction", i).unwrap_or(0) as u8,
        })
    }

    /// Resolve the element schema of an array-typed field `i` from
    /// `ElementType[i]` and friends.
    pub fn element_schema(&self, i: usize) -> Result<FieldSchema> {
        let code = self
            .get_indexed_int("ElementType", i)
            .ok_or(Error::new(ErrorCode::BadArgument))?;
        let logical = LogicalType::from_code(code)?;
        let fixed = self.get_indexed_bool("ElementFixed", i).unwrap_or(true);
        let collation = self.collation_at("FieldCollation", i);
        let field_type = self.resolve(logical, self.encoding_at(i), collation, fixed)?;
        Ok(FieldSchema {
            field_type,
            length: self.get_indexed_int("ElementLength", i).unwrap_or(0) as usize,
            fixed,
            collation,
            fraction: self.get_indexed_int("FieldFraction", i).unwrap_or(0) as u8,
        })
    }

    /// Decimal `(precision, scale)` of field `i`: precision rides in
    /// `FieldLength[i]`, scale in `FieldFraction[i]`.
    pub fn decimal_parameter(&self, i: usize) -> (u8, u8) {
        let precision = self.get_indexed_int("FieldLength", i).unwrap_or(15) as u8;
        let scale = self.get_indexed_int("FieldFraction", i).unwrap_or(0) as u8;
        (precision, scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_resolution() {
        let mut p = FileParams::new();
        p.set_indexed_int("FieldType", 0, LogicalType::Char as i64);
        p.set_indexed_int("FieldLength", 0, 5);
        p.set_indexed_bool("FieldFixed", 0, true);
        p.set_indexed_int("FieldCollation", 0, 1);
        p.set_indexed_int("FieldType", 1, LogicalType::UInt as i64);

        let f0 = p.field_schema(0).unwrap();
        assert_eq!(f0.field_type, FieldType::CharString);
        assert_eq!(f0.length, 5);
        assert!(f0.fixed);
        let f1 = p.field_schema(1).unwrap();
        assert_eq!(f1.field_type, FieldType::UInt32);
    }

    #[test]
    fn test_no_pad_collation() {
        let mut p = FileParams::new();
        p.set_indexed_int("FieldType", 0, LogicalType::NChar as i64);
        p.set_indexed_int("FieldEncodingForm", 0, 1);
        p.set_indexed_int("FieldCollation", 0, 2);
        assert_eq!(
            p.field_schema(0).unwrap().field_type,
            FieldType::NoPadUnicodeString
        );
    }

    #[test]
    fn test_legacy_version_implicit_varchar() {
        let mut p = FileParams::new();
        p.set_int("Version", 3);
        p.set_indexed_int("FieldType", 0, LogicalType::Char as i64);
        p.set_indexed_bool("FieldFixed", 0, false);
        assert!(p.keeps_legacy_no_pad());
        assert_eq!(
            p.field_schema(0).unwrap().field_type,
            FieldType::NoPadCharString
        );
    }

    #[test]
    fn test_element_schema() {
        let mut p = FileParams::new();
        p.set_indexed_int("ElementType", 0, LogicalType::NChar as i64);
        p.set_indexed_bool("ElementFixed", 0, false);
        p.set_indexed_int("ElementLength", 0, 100);
        let e = p.element_schema(0).unwrap();
        assert_eq!(e.field_type, FieldType::UnicodeString);
        assert!(!e.fixed);
        assert_eq!(e.length, 100);
    }

    #[test]
    fn test_defaults() {
        let p = FileParams::new();
        assert_eq!(p.version(), CURRENT_VERSION);
        assert!(!p.keeps_legacy_no_pad());
        assert_eq!(p.page_size(), 4096);
        assert!(!p.is_unique());
        assert!(!p.use_header());
    }
}
