//! Executable search plans.
//!
//! A compiled plan travels as a packed string (the open-option wire
//! form, written by [`builder`]). This module parses it back into
//! `Cond` structs — one lower bound, one upper bound, and any number of
//! other-conditions — and evaluates them against raw leaf entries.
//!
//! Wire grammar:
//!
//! ```text
//! plan   := '%' tree-kind '(' cond cond cond* ')'
//! cond   := '#' op '(' value (',' escape_or_pad)? ')'
//!         | '#uk'            ; unknown: empty result
//!         | '#ud'            ; undefined: no bound on this side
//! op     := eq | gt | ge | lt | le | lk | uk | ud
//! ```
//!
//! Values escape `)` `,` `\` with `\`. A bound's value packs one
//! segment per key field, separated by US (0x1f); an other-condition's
//! value is the target field index, US, then the segment. A segment of
//! one NUL byte denotes a null field.

pub mod builder;

use std::cmp::Ordering;

use crate::codec::{self, decimal::Decimal, FieldType};
use crate::compare::EntryComparator;
use crate::entry::{self, EntryHeader};
use crate::error::{Error, ErrorCode, Result};
use crate::fileid::FileParams;
use crate::tree::TreeKind;
use crate::types::{Collation, CompareOp, Value};

/// Field separator inside a packed value.
pub const FIELD_SEP: char = '\u{1f}';
/// A segment holding exactly this character denotes a null field.
pub const NULL_MARK: char = '\u{0}';
/// The padding character written as a cond option when the comparison
/// collation is PAD SPACE.
pub const PADDING_CHAR: char = ' ';

/// Open options are a key-value map like the persisted file-id.
pub type OpenOption = FileParams;

/// Well-known open-option keys.
pub mod keys {
    pub const OPEN_MODE: &str = "OpenMode";
    pub const CONDITION_COUNT: &str = "ConditionCount";
    pub const CONDITION: &str = "Condition";
    pub const VERIFY: &str = "Verify";
    pub const ROW_ID: &str = "RowID";
    pub const FETCH_FIELD_NUMBER: &str = "FetchFieldNumber";
    pub const EQUAL_FIELD_NUMBER: &str = "EqualFieldNumber";
    pub const GET_BY_BITSET: &str = "GetByBitSet";

    pub const MODE_READ: i64 = 0;
    pub const MODE_SEARCH: i64 = 1;
}

/// Schema slice the plan needs to dump and compare key fields.
#[derive(Debug, Clone)]
pub struct ConditionSchema {
    /// Stored types of the key fields, leaf order.
    pub key_types: Vec<FieldType>,
    /// Per-field fixed-width flag.
    pub fixed: Vec<bool>,
    /// Declared character length per field; 0 when variable or
    /// unbounded. Fixed string operands are padded to this length.
    pub lengths: Vec<usize>,
    /// Decimal `(precision, scale)` per field.
    pub decimal: Vec<(u8, u8)>,
    /// Leaf entries carry the one-word header.
    pub use_header: bool,
    /// Null fields sort first.
    pub top_null: bool,
    /// Pre-v4 file: NO-PAD fields truncate PAD-SPACE keys' trailing
    /// spaces at compile time.
    pub legacy_no_pad: bool,
}

impl ConditionSchema {
    pub fn single(key: FieldType) -> ConditionSchema {
        ConditionSchema {
            key_types: vec![key],
            fixed: vec![key.is_fixed_size()],
            lengths: vec![0],
            decimal: vec![(15, 0)],
            use_header: false,
            top_null: true,
            legacy_no_pad: false,
        }
    }
}

/// One compiled comparison.
#[derive(Debug, Clone)]
pub struct Cond {
    pub op: CompareOp,
    /// Comparison types, collation-adjusted by the optional char.
    pub types: Vec<FieldType>,
    /// Null flags, one per packed field.
    pub nulls: Vec<bool>,
    /// Dumped probe: header word (header trees) then non-null fields.
    pub buffer: Vec<u8>,
    /// Padding char for ordered comparison, or the LIKE escape.
    pub optional_char: Option<char>,
    /// Target key field of an other-condition.
    pub field: usize,
}

impl Cond {
    fn undefined() -> Cond {
        Cond {
            op: CompareOp::Undefined,
            types: Vec::new(),
            nulls: Vec::new(),
            buffer: Vec::new(),
            optional_char: None,
            field: 0,
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.op == CompareOp::Undefined
    }

    /// Comparator routing a descent with this cond's probe buffer.
    pub fn comparator(&self, schema: &ConditionSchema) -> EntryComparator {
        if schema.use_header {
            EntryComparator::with_header(self.types.clone(), false, schema.top_null)
        } else {
            EntryComparator::new(self.types.clone(), false)
        }
    }
}

/// A parsed, executable plan.
#[derive(Debug, Clone)]
pub struct Condition {
    schema: ConditionSchema,
    tree_kind: TreeKind,
    valid: bool,
    fetch: bool,
    first_fetch: bool,
    fetch_no_pad_key: bool,
    fetch_no_pad_field: bool,
    /// Tombstones stay visible to constraint-lock scans.
    pub constraint_lock: bool,
    lower: Cond,
    upper: Cond,
    others: Vec<Cond>,
}

// ----------------------------------------------------------------------
// Wire parsing
// ----------------------------------------------------------------------

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(s: &'a str) -> Self {
        Scanner {
            chars: s.chars().peekable(),
        }
    }

    fn next(&mut self) -> Result<char> {
        self.chars.next().ok_or(Error::with_message(
            ErrorCode::BadArgument,
            "truncated condition string",
        ))
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        let got = self.next()?;
        if got != c {
            return Err(Error::with_message(
                ErrorCode::BadArgument,
                format!("expected '{c}' in condition string"),
            ));
        }
        Ok(())
    }
}

/// One decoded value segment. A segment of exactly one unescaped NUL
/// marks a null field; an escaped NUL stays literal text.
#[derive(Default)]
struct WireSegment {
    text: String,
    escaped: bool,
}

impl WireSegment {
    fn is_null_mark(&self) -> bool {
        !self.escaped && self.text.len() == 1 && self.text.starts_with(NULL_MARK)
    }
}

/// One `#op(value,opt)` read off the wire.
struct WireCond {
    op: CompareOp,
    segments: Vec<WireSegment>,
    optional_char: Option<char>,
}

fn read_wire_cond(s: &mut Scanner<'_>) -> Result<WireCond> {
    s.expect('#')?;
    let a = s.next()?;
    let b = s.next()?;
    let op = match (a, b) {
        ('e', 'q') => CompareOp::Equals,
        ('g', 't') => CompareOp::GreaterThan,
        ('g', 'e') => CompareOp::GreaterThanEquals,
        ('l', 't') => CompareOp::LessThan,
        ('l', 'e') => CompareOp::LessThanEquals,
        ('l', 'k') => CompareOp::Like,
        ('n', 'e') => CompareOp::NotEquals,
        ('u', 'k') => CompareOp::Unknown,
        ('u', 'd') => CompareOp::Undefined,
        _ => {
            return Err(Error::with_message(
                ErrorCode::BadArgument,
                format!("unknown condition operator '{a}{b}'"),
            ))
        }
    };
    if op == CompareOp::Unknown || op == CompareOp::Undefined {
        return Ok(WireCond {
            op,
            segments: Vec::new(),
            optional_char: None,
        });
    }
    s.expect('(')?;
    let mut segments = vec![WireSegment::default()];
    let mut optional_char = None;
    loop {
        let c = s.next()?;
        match c {
            '\\' => {
                let seg = segments.last_mut().unwrap();
                seg.text.push(s.next()?);
                seg.escaped = true;
            }
            ',' => {
                optional_char = Some(s.next()?);
                s.expect(')')?;
                break;
            }
            ')' => break,
            FIELD_SEP => segments.push(WireSegment::default()),
            other => segments.last_mut().unwrap().text.push(other),
        }
    }
    Ok(WireCond {
        op,
        segments,
        optional_char,
    })
}

/// Interpret one segment as a value of `ty`.
fn value_from_text(text: &str, ty: FieldType, decimal: (u8, u8)) -> Result<Value> {
    Ok(match ty {
        FieldType::Int32 => Value::Int32(
            text.trim()
                .parse()
                .map_err(|_| Error::new(ErrorCode::BadArgument))?,
        ),
        FieldType::UInt32 => Value::UInt32(
            text.trim()
                .parse()
                .map_err(|_| Error::new(ErrorCode::BadArgument))?,
        ),
        FieldType::Int64 => Value::Int64(
            text.trim()
                .parse()
                .map_err(|_| Error::new(ErrorCode::BadArgument))?,
        ),
        FieldType::F64 => Value::F64(
            text.trim()
                .parse()
                .map_err(|_| Error::new(ErrorCode::BadArgument))?,
        ),
        FieldType::ObjectId => Value::ObjectId(
            text.trim()
                .parse()
                .map_err(|_| Error::new(ErrorCode::BadArgument))?,
        ),
        FieldType::Decimal => Value::Decimal(Decimal::parse(text, decimal.0, decimal.1)?),
        FieldType::DateTime => Value::DateTime(codec::parse_datetime_literal(text)?),
        FieldType::LanguageSet => {
            let mut codes = Vec::new();
            for part in text.split_whitespace() {
                codes.push(part.parse().map_err(|_| Error::new(ErrorCode::BadArgument))?);
            }
            Value::LanguageSet(codes)
        }
        FieldType::CharString
        | FieldType::UnicodeString
        | FieldType::NoPadCharString
        | FieldType::NoPadUnicodeString => Value::String {
            text: text.to_string(),
            collation: Collation::Implicit,
        },
    })
}

/// Collation adjustment: anything but the padding space compares NO PAD.
fn adjusted_type(ty: FieldType, optional_char: Option<char>) -> FieldType {
    if optional_char == Some(PADDING_CHAR) {
        ty
    } else {
        ty.as_no_pad()
    }
}

impl Condition {
    /// Parse plan `index` out of an open option.
    pub fn parse(
        option: &OpenOption,
        index: usize,
        schema: ConditionSchema,
    ) -> Result<Condition> {
        let text = option
            .get_str(&format!("{}[{}]", keys::CONDITION, index))
            .unwrap_or("");
        let search_mode =
            option.get_int(keys::OPEN_MODE) == Some(keys::MODE_SEARCH);
        Condition::parse_plan(text, schema, search_mode)
    }

    pub fn parse_plan(
        text: &str,
        schema: ConditionSchema,
        fetch_mode: bool,
    ) -> Result<Condition> {
        let mut cond = Condition {
            schema,
            tree_kind: TreeKind::ArrayData,
            valid: true,
            fetch: fetch_mode,
            first_fetch: true,
            fetch_no_pad_key: false,
            fetch_no_pad_field: false,
            constraint_lock: false,
            lower: Cond::undefined(),
            upper: Cond::undefined(),
            others: Vec::new(),
        };
        if text.is_empty() {
            cond.valid = false;
            return Ok(cond);
        }

        let mut s = Scanner::new(text);
        s.expect('%')?;
        let mut code = 0u32;
        loop {
            let c = s.next()?;
            if c == '(' {
                break;
            }
            code = code * 10
                + c.to_digit(10).ok_or(Error::with_message(
                    ErrorCode::BadArgument,
                    "malformed tree-kind prefix",
                ))?;
        }
        match TreeKind::from_code(code) {
            Some(kind) => cond.tree_kind = kind,
            None => {
                cond.valid = false;
                return Ok(cond);
            }
        }

        if !fetch_mode {
            // A fetch plan leaves lower/upper to setFetchKey.
            let lower = read_wire_cond(&mut s)?;
            let upper = read_wire_cond(&mut s)?;
            cond.lower = cond.bound_cond(lower)?;
            cond.upper = cond.bound_cond(upper)?;
            if cond.lower.op == CompareOp::Unknown || cond.upper.op == CompareOp::Unknown {
                cond.valid = false;
            }
        }
        while s.peek() != Some(')') {
            let wire = read_wire_cond(&mut s)?;
            match wire.op {
                CompareOp::Unknown => cond.valid = false,
                CompareOp::Undefined => {}
                _ => {
                    let other = cond.other_cond(wire)?;
                    cond.others.push(other);
                }
            }
        }
        Ok(cond)
    }

    /// Build a multi-field bound cond from the wire form.
    fn bound_cond(&self, wire: WireCond) -> Result<Cond> {
        if wire.op == CompareOp::Unknown || wire.op == CompareOp::Undefined {
            return Ok(Cond {
                op: wire.op,
                ..Cond::undefined()
            });
        }
        if wire.segments.len() > self.schema.key_types.len() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let mut types = Vec::with_capacity(wire.segments.len());
        let mut nulls = Vec::with_capacity(wire.segments.len());
        let mut fields = Vec::with_capacity(wire.segments.len());
        for (n, seg) in wire.segments.iter().enumerate() {
            let stored = self.schema.key_types[n];
            let ty = adjusted_type(stored, wire.optional_char);
            types.push(ty);
            if seg.is_null_mark() {
                nulls.push(true);
                fields.push(None);
            } else {
                nulls.push(false);
                fields.push(Some(value_from_text(
                    &seg.text,
                    ty,
                    self.schema.decimal[n],
                )?));
            }
        }
        let buffer = self.pack_probe(&types, &nulls, &fields)?;
        Ok(Cond {
            op: wire.op,
            types,
            nulls,
            buffer,
            optional_char: wire.optional_char,
            field: 0,
        })
    }

    /// Build a single-field other-condition from the wire form. The
    /// first segment carries the target field index.
    fn other_cond(&self, wire: WireCond) -> Result<Cond> {
        let (field, seg) = match wire.segments.len() {
            1 => (0, &wire.segments[0]),
            2 => (
                wire.segments[0]
                    .text
                    .parse::<usize>()
                    .map_err(|_| Error::new(ErrorCode::BadArgument))?,
                &wire.segments[1],
            ),
            _ => return Err(Error::new(ErrorCode::BadArgument)),
        };
        if field >= self.schema.key_types.len() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let stored = self.schema.key_types[field];
        let ty = adjusted_type(stored, wire.optional_char);
        let mut buffer = Vec::new();
        let mut null = false;
        if seg.is_null_mark() {
            null = true;
        } else {
            let value = value_from_text(&seg.text, ty, self.schema.decimal[field])?;
            codec::dump(&mut buffer, &value, ty)?;
        }
        Ok(Cond {
            op: if null && wire.op == CompareOp::Equals {
                CompareOp::EqualsToNull
            } else {
                wire.op
            },
            types: vec![ty],
            nulls: vec![null],
            buffer,
            optional_char: wire.optional_char,
            field,
        })
    }

    /// Dump a probe entry: header word (header trees) then fields.
    fn pack_probe(
        &self,
        types: &[FieldType],
        nulls: &[bool],
        fields: &[Option<Value>],
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if self.schema.use_header {
            let mut h = EntryHeader::new();
            for (n, &null) in nulls.iter().enumerate() {
                if null {
                    h.set_null(n, true);
                }
            }
            h.write(&mut out);
        }
        for (n, field) in fields.iter().enumerate() {
            if let Some(v) = field {
                codec::dump(&mut out, v, types[n])?;
            } else if !self.schema.use_header {
                return Err(Error::new(ErrorCode::BadArgument));
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_fetch(&self) -> bool {
        self.fetch
    }

    pub fn tree_kind(&self) -> TreeKind {
        self.tree_kind
    }

    pub fn schema(&self) -> &ConditionSchema {
        &self.schema
    }

    pub fn lower(&self) -> &Cond {
        &self.lower
    }

    pub fn upper(&self) -> &Cond {
        &self.upper
    }

    pub fn others(&self) -> &[Cond] {
        &self.others
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    fn entry_field_offsets(&self, entry: &[u8]) -> Result<Vec<Option<usize>>> {
        entry::field_offsets(entry, &self.schema.key_types, self.schema.use_header)
    }

    fn probe_field_offsets(&self, cond: &Cond) -> Result<Vec<Option<usize>>> {
        entry::field_offsets(&cond.buffer, &cond.types, self.schema.use_header)
    }

    fn null_rank(&self) -> Ordering {
        if self.schema.top_null {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Compare the entry's leading key fields against a bound probe.
    fn compare_bound(&self, entry: &[u8], cond: &Cond) -> Result<Ordering> {
        let entry_offsets = self.entry_field_offsets(entry)?;
        let probe_offsets = self.probe_field_offsets(cond)?;
        for n in 0..cond.types.len() {
            let ty = cond.types[n];
            let ordering = match (entry_offsets[n], probe_offsets[n]) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => self.null_rank(),
                (Some(_), None) => self.null_rank().reverse(),
                (Some(ea), Some(pa)) => {
                    let mut p1 = &entry[ea..];
                    let mut p2 = &cond.buffer[pa..];
                    codec::compare_one(&mut p1, &mut p2, ty)?
                }
            };
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Does `entry` still fall under the upper bound?
    pub fn upper_satisfied(&self, entry: &[u8]) -> Result<bool> {
        match self.upper.op {
            CompareOp::Undefined => Ok(true),
            CompareOp::LessThan => Ok(self.compare_bound(entry, &self.upper)? == Ordering::Less),
            CompareOp::LessThanEquals => {
                Ok(self.compare_bound(entry, &self.upper)? != Ordering::Greater)
            }
            _ => Err(Error::new(ErrorCode::Unexpected)),
        }
    }

    /// Does `entry` pass every other-condition? Tombstones fail unless
    /// the scan runs in constraint-lock mode.
    pub fn others_match(&self, entry: &[u8]) -> Result<bool> {
        if self.schema.use_header {
            let h = EntryHeader::read(entry)?;
            if h.is_expunged() && !self.constraint_lock {
                return Ok(false);
            }
        }
        if self.others.is_empty() {
            return Ok(true);
        }
        let offsets = self.entry_field_offsets(entry)?;
        for cond in &self.others {
            let field_at = offsets[cond.field];
            let ok = match cond.op {
                CompareOp::EqualsToNull => field_at.is_none(),
                CompareOp::Like => match field_at {
                    None => false,
                    Some(at) => {
                        let mut p1 = &entry[at..];
                        let mut p2 = &cond.buffer[..];
                        codec::like_one(&mut p1, &mut p2, cond.types[0], cond.optional_char)?
                    }
                },
                op if cond.types.len() > 1 => {
                    // A rebound fetch filter covers the whole key prefix.
                    op.admits(self.compare_bound(entry, cond)?)
                }
                op => match field_at {
                    None => false,
                    Some(at) => {
                        let mut p1 = &entry[at..];
                        let mut p2 = &cond.buffer[..];
                        let r = codec::compare_one(&mut p1, &mut p2, cond.types[0])?;
                        op.admits(r)
                    }
                },
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Fetch keys
    // ------------------------------------------------------------------

    /// Bind the runtime key of a fetch. The first call decides the
    /// collation treatment; later calls rewrite the payload in place.
    pub fn set_fetch_key(&mut self, key: &[Value]) -> Result<()> {
        if key.len() > self.schema.key_types.len() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        if self.first_fetch {
            self.first_fetch = false;
            for v in key {
                if let Value::String { collation, .. } = v {
                    if *collation == Collation::NoPad {
                        self.fetch_no_pad_key = true;
                    }
                }
            }
            self.fetch_no_pad_field = self
                .schema
                .key_types
                .iter()
                .zip(&self.schema.fixed)
                .all(|(ty, fixed)| match ty {
                    FieldType::NoPadCharString | FieldType::NoPadUnicodeString => true,
                    FieldType::CharString | FieldType::UnicodeString => {
                        *fixed && self.fetch_no_pad_key
                    }
                    _ => true,
                });
        } else if !self.fetch_no_pad_field && self.fetch_no_pad_key && self.valid {
            // The previous fetch added a NO-PAD re-filter; drop it.
            self.others.pop();
        }

        if key.iter().any(|v| v.is_null()) && !self.schema.use_header {
            // Equality with null can never hit a tree without nulls.
            self.valid = false;
            return Ok(());
        }

        self.tree_kind = match self.tree_kind {
            TreeKind::ArrayData | TreeKind::ArrayNullData | TreeKind::ArrayNullArray => {
                TreeKind::ArrayData
            }
            other => other,
        };

        let padding = if self.fetch_no_pad_field || self.fetch_no_pad_key {
            None
        } else {
            Some(PADDING_CHAR)
        };
        let upper = self.fetch_bound(key, CompareOp::LessThanEquals, padding)?;
        if !self.fetch_no_pad_field && self.fetch_no_pad_key {
            // PAD-SPACE-sorted field searched with a NO-PAD key: widen
            // the range to PAD SPACE and re-filter NO-PAD equality.
            self.lower =
                self.fetch_bound(key, CompareOp::GreaterThanEquals, Some(PADDING_CHAR))?;
            let mut other = upper.clone();
            other.op = CompareOp::Equals;
            self.upper = upper;
            self.others.push(other);
        } else {
            self.lower = Cond {
                op: CompareOp::GreaterThanEquals,
                ..upper.clone()
            };
            self.upper = upper;
        }
        self.valid = true;
        Ok(())
    }

    fn fetch_bound(
        &self,
        key: &[Value],
        op: CompareOp,
        padding: Option<char>,
    ) -> Result<Cond> {
        let mut types = Vec::with_capacity(key.len());
        let mut nulls = Vec::with_capacity(key.len());
        let mut fields = Vec::with_capacity(key.len());
        for (n, v) in key.iter().enumerate() {
            let ty = adjusted_type(self.schema.key_types[n], padding);
            types.push(ty);
            if v.is_null() {
                nulls.push(true);
                fields.push(None);
            } else {
                nulls.push(false);
                fields.push(Some(v.clone()));
            }
        }
        let buffer = self.pack_probe(&types, &nulls, &fields)?;
        Ok(Cond {
            op,
            types,
            nulls,
            buffer,
            optional_char: padding,
            field: 0,
        })
    }
}
