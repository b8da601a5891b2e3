//! Predicate compilation: from the caller's predicate tree to the
//! packed plan strings of the open option.
//!
//! Every comparison against a PAD-SPACE-sorted string field made with a
//! NO-PAD key is rewritten into a widened main range plus exact
//! other-conditions, so the B-tree descent (which follows the stored
//! sort order) can never miss a row the NO-PAD comparison would accept.
//! Numeric operands are rounded onto the column's grid, decimals are
//! clamped to the declared precision, and LIKE patterns expand into a
//! prefix range when they can.

use crate::codec::{self, decimal::Decimal, FieldType};
use crate::condition::{keys, ConditionSchema, OpenOption, FIELD_SEP, NULL_MARK, PADDING_CHAR};
use crate::error::{Error, ErrorCode, Result};
use crate::tree::TreeKind;
use crate::types::{Collation, CompareOp, RowId, Value};

/// Predicate tree handed down by the upper module.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        op: CompareOp,
        field: usize,
        value: Value,
    },
    Between {
        field: usize,
        lower: Value,
        upper: Value,
    },
    Like {
        field: usize,
        pattern: String,
        escape: Option<String>,
    },
    IsNull {
        field: usize,
        /// `f[] IS NULL` (any element) rather than `f IS NULL`.
        per_element: bool,
    },
    NotNull {
        field: usize,
        per_element: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Key bound at run time instead of compile time.
    Fetch { fields: Vec<usize> },
}

/// Which index flavor is compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFlavor {
    Array,
    Btree,
    Bitmap,
}

// ----------------------------------------------------------------------
// Plan parts
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BoundOut {
    op: CompareOp,
    /// `None` encodes the null mark.
    text: Option<String>,
    optional_char: Option<char>,
}

#[derive(Debug, Clone)]
struct OtherOut {
    op: CompareOp,
    /// `None` encodes the null mark.
    text: Option<String>,
    optional_char: Option<char>,
}

#[derive(Debug, Clone, Default)]
struct PlanParts {
    lower: Option<BoundOut>,
    upper: Option<BoundOut>,
    others: Vec<OtherOut>,
    /// Both bounds came from one equality, so the field can extend a
    /// composite bound prefix.
    is_equality: bool,
    /// The condition can never hit.
    unknown: bool,
}

impl PlanParts {
    fn unknown() -> PlanParts {
        PlanParts {
            unknown: true,
            ..PlanParts::default()
        }
    }
}

// ----------------------------------------------------------------------
// Wire writers
// ----------------------------------------------------------------------

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == ')' || c == ',' || c == '\\' || c == FIELD_SEP || c == NULL_MARK {
            out.push('\\');
        }
        out.push(c);
    }
}

fn op_tag(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Equals => "#eq",
        CompareOp::NotEquals => "#ne",
        CompareOp::GreaterThan => "#gt",
        CompareOp::GreaterThanEquals => "#ge",
        CompareOp::LessThan => "#lt",
        CompareOp::LessThanEquals => "#le",
        CompareOp::Like => "#lk",
        CompareOp::Unknown => "#uk",
        _ => "#ud",
    }
}

/// Write one cond whose value is a run of segments. `None` segments
/// carry the null mark.
fn put_cond(out: &mut String, op: CompareOp, segments: &[Option<&str>], oc: Option<char>) {
    out.push_str(op_tag(op));
    if op == CompareOp::Unknown || op == CompareOp::Undefined {
        return;
    }
    out.push('(');
    for (n, seg) in segments.iter().enumerate() {
        if n > 0 {
            out.push(FIELD_SEP);
        }
        match seg {
            Some(text) => push_escaped(out, text),
            None => out.push(NULL_MARK),
        }
    }
    if let Some(c) = oc {
        out.push(',');
        out.push(c);
    }
    out.push(')');
}

/// Write one other-condition targeting `field`.
fn put_other(out: &mut String, field: usize, other: &OtherOut) {
    out.push_str(op_tag(other.op));
    out.push('(');
    push_escaped(out, &field.to_string());
    out.push(FIELD_SEP);
    match &other.text {
        Some(text) => push_escaped(out, text),
        None => out.push(NULL_MARK),
    }
    if let Some(c) = other.optional_char {
        out.push(',');
        out.push(c);
    }
    out.push(')');
}

fn scan_plan(kind: TreeKind) -> String {
    format!("%{}(#ud#ud)", kind.code())
}

fn unknown_plan(kind: TreeKind) -> String {
    format!("%{}(#uk#uk)", kind.code())
}

// ----------------------------------------------------------------------
// Text helpers
// ----------------------------------------------------------------------

/// Count of characters before the trailing run of SOH (U+0001).
fn trailing_soh_position(s: &str) -> usize {
    let chars: Vec<char> = s.chars().collect();
    let mut p = chars.len();
    while p > 0 && chars[p - 1] == '\u{1}' {
        p -= 1;
    }
    p
}

/// Index of the first character smaller than the padding space, or the
/// string length when none exists.
fn first_small_char_position(s: &str) -> usize {
    for (n, c) in s.chars().enumerate() {
        if c < PADDING_CHAR {
            return n;
        }
    }
    s.chars().count()
}

fn decrement_last_char_at(s: &str, position: usize) -> String {
    let mut chars: Vec<char> = s.chars().collect();
    let c = chars[position - 1];
    let mut code = c as u32;
    loop {
        code = code.saturating_sub(1);
        if let Some(dec) = char::from_u32(code) {
            chars[position - 1] = dec;
            break;
        }
        if code == 0 {
            chars[position - 1] = '\u{0}';
            break;
        }
    }
    chars.into_iter().collect()
}

fn increment_last_char(s: &str) -> String {
    let mut chars: Vec<char> = s.chars().collect();
    if let Some(last) = chars.last_mut() {
        let mut code = *last as u32;
        loop {
            code += 1;
            if let Some(inc) = char::from_u32(code) {
                *last = inc;
                break;
            }
        }
    }
    chars.into_iter().collect()
}

// ----------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------

enum Got {
    Hit { text: String, no_pad_key: bool, op: CompareOp },
    Miss,
}

pub struct ConditionBuilder<'a> {
    schema: &'a ConditionSchema,
    flavor: IndexFlavor,
}

impl<'a> ConditionBuilder<'a> {
    pub fn new(schema: &'a ConditionSchema, flavor: IndexFlavor) -> Self {
        ConditionBuilder { schema, flavor }
    }

    fn data_kind(&self) -> TreeKind {
        match self.flavor {
            IndexFlavor::Array => TreeKind::ArrayData,
            IndexFlavor::Btree => TreeKind::Btree,
            IndexFlavor::Bitmap => TreeKind::Bitmap,
        }
    }

    /// Compile `predicate` into the open option. Returns false when the
    /// predicate cannot run on this index.
    pub fn get_search_parameter(
        &self,
        predicate: Option<&Predicate>,
        option: &mut OpenOption,
    ) -> Result<bool> {
        let predicate = match predicate {
            Some(p) => p,
            // A bare scan: supported by the scalar flavors only.
            None => {
                if self.flavor == IndexFlavor::Array {
                    return Ok(false);
                }
                option.set_str(
                    &format!("{}[0]", keys::CONDITION),
                    &scan_plan(self.data_kind()),
                );
                option.set_int(keys::CONDITION_COUNT, 1);
                option.set_int(keys::OPEN_MODE, keys::MODE_READ);
                return Ok(true);
            }
        };

        if let Predicate::Fetch { fields } = predicate {
            if !self.check_fetch_fields(fields) {
                return Ok(false);
            }
            option.set_int(keys::FETCH_FIELD_NUMBER, fields.len() as i64);
            option.set_str(
                &format!("{}[0]", keys::CONDITION),
                &scan_plan(self.data_kind()),
            );
            option.set_int(keys::CONDITION_COUNT, 1);
            option.set_int(keys::OPEN_MODE, keys::MODE_SEARCH);
            return Ok(true);
        }

        let branches: Vec<&Predicate> = match predicate {
            Predicate::Or(list) => list.iter().collect(),
            other => vec![other],
        };

        let mut plans = Vec::new();
        for branch in &branches {
            if !self.compile_branch(branch, &mut plans, option)? {
                return Ok(false);
            }
        }
        if plans.is_empty() {
            plans.push(unknown_plan(self.data_kind()));
        }
        for (n, plan) in plans.iter().enumerate() {
            option.set_str(&format!("{}[{}]", keys::CONDITION, n), plan);
        }
        option.set_int(keys::CONDITION_COUNT, plans.len() as i64);
        option.set_int(keys::OPEN_MODE, keys::MODE_READ);
        Ok(true)
    }

    /// Verify support: one plan per array element plus the target rowid.
    pub fn get_verify_parameter(
        &self,
        elements: &[Value],
        rowid: RowId,
        option: &mut OpenOption,
    ) -> Result<bool> {
        if self.flavor != IndexFlavor::Array {
            return Ok(false);
        }
        let mut plans = Vec::new();
        for v in elements {
            if v.is_null() {
                plans.push(scan_plan(TreeKind::ArrayNullData));
            } else {
                match self.compile_compare(0, CompareOp::Equals, v)? {
                    Some(parts) => plans.push(self.write_plan(TreeKind::ArrayData, &parts, 0)),
                    None => return Ok(false),
                }
            }
        }
        for (n, plan) in plans.iter().enumerate() {
            option.set_str(&format!("{}[{}]", keys::CONDITION, n), plan);
        }
        option.set_int(keys::CONDITION_COUNT, plans.len() as i64);
        option.set_bool(keys::VERIFY, true);
        option.set_str(keys::ROW_ID, &rowid.to_string());
        option.set_int(keys::OPEN_MODE, keys::MODE_READ);
        Ok(true)
    }

    fn check_fetch_fields(&self, fields: &[usize]) -> bool {
        if fields.is_empty() || fields.len() > self.schema.key_types.len() {
            return false;
        }
        fields.iter().enumerate().all(|(n, f)| *f == n)
    }

    /// Compile one OR branch into zero or more plan strings.
    fn compile_branch(
        &self,
        branch: &Predicate,
        plans: &mut Vec<String>,
        option: &mut OpenOption,
    ) -> Result<bool> {
        match branch {
            Predicate::And(list) => {
                if self.flavor != IndexFlavor::Btree {
                    return Ok(false);
                }
                self.compile_btree_conjunction(list, plans, option)
            }
            Predicate::IsNull { field, per_element } => match self.flavor {
                IndexFlavor::Array => {
                    if *field != 0 {
                        return Ok(false);
                    }
                    plans.push(scan_plan(if *per_element {
                        TreeKind::ArrayNullData
                    } else {
                        TreeKind::ArrayNullArray
                    }));
                    Ok(true)
                }
                IndexFlavor::Btree => self.compile_btree_conjunction(
                    std::slice::from_ref(branch),
                    plans,
                    option,
                ),
                IndexFlavor::Bitmap => Ok(false),
            },
            Predicate::NotNull { field, per_element } => match self.flavor {
                IndexFlavor::Array => {
                    if *field != 0 {
                        return Ok(false);
                    }
                    if !*per_element {
                        plans.push(scan_plan(TreeKind::ArrayNullData));
                    }
                    plans.push(scan_plan(TreeKind::ArrayData));
                    Ok(true)
                }
                _ => Ok(false),
            },
            Predicate::Or(_) | Predicate::Fetch { .. } => Ok(false),
            single => {
                if self.flavor == IndexFlavor::Btree {
                    return self.compile_btree_conjunction(
                        std::slice::from_ref(single),
                        plans,
                        option,
                    );
                }
                let parts = match self.compile_single(single)? {
                    Some(parts) => parts,
                    None => return Ok(false),
                };
                if parts.unknown {
                    plans.push(unknown_plan(self.data_kind()));
                } else {
                    plans.push(self.write_plan(self.data_kind(), &parts, 0));
                }
                Ok(true)
            }
        }
    }

    /// One non-And, non-null predicate on the single key field.
    fn compile_single(&self, p: &Predicate) -> Result<Option<PlanParts>> {
        match p {
            Predicate::Compare { op, field, value } => {
                if *field != 0 {
                    return Ok(None);
                }
                self.compile_compare(0, *op, value)
            }
            Predicate::Between {
                field,
                lower,
                upper,
            } => {
                if *field != 0 {
                    return Ok(None);
                }
                self.compile_between(0, lower, upper)
            }
            Predicate::Like {
                field,
                pattern,
                escape,
            } => {
                if *field != 0 {
                    return Ok(None);
                }
                self.compile_like(0, pattern, escape.as_deref())
            }
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // B-tree conjunction composition
    // ------------------------------------------------------------------

    fn compile_btree_conjunction(
        &self,
        list: &[Predicate],
        plans: &mut Vec<String>,
        option: &mut OpenOption,
    ) -> Result<bool> {
        let nfields = self.schema.key_types.len();
        let mut per_field: Vec<Option<PlanParts>> = vec![None; nfields];
        for p in list {
            let (field, parts) = match p {
                Predicate::Compare { op, field, value } => {
                    (*field, self.compile_compare(*field, *op, value)?)
                }
                Predicate::Between {
                    field,
                    lower,
                    upper,
                } => (*field, self.compile_between(*field, lower, upper)?),
                Predicate::Like {
                    field,
                    pattern,
                    escape,
                } => (*field, self.compile_like(*field, pattern, escape.as_deref())?),
                Predicate::IsNull { field, per_element } => {
                    if *per_element {
                        return Ok(false);
                    }
                    if !self.schema.use_header {
                        // Keys cannot be null: empty result.
                        (*field, Some(PlanParts::unknown()))
                    } else {
                        (
                            *field,
                            Some(PlanParts {
                                lower: Some(BoundOut {
                                    op: CompareOp::GreaterThanEquals,
                                    text: None,
                                    optional_char: None,
                                }),
                                upper: Some(BoundOut {
                                    op: CompareOp::LessThanEquals,
                                    text: None,
                                    optional_char: None,
                                }),
                                others: Vec::new(),
                                is_equality: true,
                                unknown: false,
                            }),
                        )
                    }
                }
                _ => return Ok(false),
            };
            let parts = match parts {
                Some(parts) => parts,
                None => return Ok(false),
            };
            if field >= nfields {
                return Ok(false);
            }
            match &mut per_field[field] {
                slot @ None => *slot = Some(parts),
                Some(existing) => {
                    // A second condition on the same field keeps the
                    // first as the main range and filters exactly.
                    existing.unknown |= parts.unknown;
                    if parts.is_equality {
                        if let Some(b) = parts.lower {
                            existing.others.push(OtherOut {
                                op: CompareOp::Equals,
                                text: b.text,
                                optional_char: b.optional_char,
                            });
                        }
                    } else {
                        for b in [parts.lower, parts.upper].into_iter().flatten() {
                            if b.text.is_some() {
                                existing.others.push(OtherOut {
                                    op: b.op,
                                    text: b.text,
                                    optional_char: b.optional_char,
                                });
                            }
                        }
                    }
                    existing.others.extend(parts.others);
                    existing.is_equality = false;
                }
            }
        }

        if per_field.iter().flatten().any(|p| p.unknown) {
            plans.push(unknown_plan(TreeKind::Btree));
            return Ok(true);
        }

        let (plan, equal_fields) = self.write_btree_plan(&per_field);
        option.set_int(keys::EQUAL_FIELD_NUMBER, equal_fields as i64);
        plans.push(plan);
        Ok(true)
    }

    /// Compose per-field parts into one multi-segment plan. The bound
    /// prefix extends while leading fields are equalities; the first
    /// range field closes it, and everything beyond filters as
    /// other-conditions.
    fn write_btree_plan(&self, per_field: &[Option<PlanParts>]) -> (String, usize) {
        let mut lower_segments: Vec<(Option<String>, Option<char>, CompareOp)> = Vec::new();
        let mut upper_segments: Vec<(Option<String>, Option<char>, CompareOp)> = Vec::new();
        let mut others: Vec<(usize, OtherOut)> = Vec::new();
        let mut equal_fields = 0usize;
        let mut prefix_open = true;

        for (field, slot) in per_field.iter().enumerate() {
            let parts = match slot {
                Some(parts) => parts,
                None => {
                    prefix_open = false;
                    continue;
                }
            };
            for o in &parts.others {
                others.push((field, o.clone()));
            }
            if !prefix_open {
                // Out of the composite range: demote the bounds to
                // exact filters (a null equality becomes an is-null
                // test).
                if parts.is_equality {
                    if let Some(b) = &parts.lower {
                        others.push((
                            field,
                            OtherOut {
                                op: CompareOp::Equals,
                                text: b.text.clone(),
                                optional_char: b.optional_char,
                            },
                        ));
                    }
                } else {
                    for b in [&parts.lower, &parts.upper].into_iter().flatten() {
                        if b.text.is_some() {
                            others.push((
                                field,
                                OtherOut {
                                    op: b.op,
                                    text: b.text.clone(),
                                    optional_char: b.optional_char,
                                },
                            ));
                        }
                    }
                }
                continue;
            }
            if parts.is_equality {
                let lb = parts.lower.as_ref().expect("equality has both bounds");
                let ub = parts.upper.as_ref().expect("equality has both bounds");
                lower_segments.push((lb.text.clone(), lb.optional_char, lb.op));
                upper_segments.push((ub.text.clone(), ub.optional_char, ub.op));
                equal_fields += 1;
            } else {
                if let Some(b) = &parts.lower {
                    lower_segments.push((b.text.clone(), b.optional_char, b.op));
                }
                if let Some(b) = &parts.upper {
                    upper_segments.push((b.text.clone(), b.optional_char, b.op));
                }
                prefix_open = false;
            }
        }

        let mut out = format!("%{}(", TreeKind::Btree.code());
        write_bound_segments(&mut out, &lower_segments, CompareOp::GreaterThanEquals);
        write_bound_segments(&mut out, &upper_segments, CompareOp::LessThanEquals);
        for (field, other) in &others {
            put_other(&mut out, *field, other);
        }
        out.push(')');
        (out, equal_fields)
    }

    // ------------------------------------------------------------------
    // Elemental compilers
    // ------------------------------------------------------------------

    fn field_type(&self, field: usize) -> FieldType {
        self.schema.key_types[field]
    }

    fn no_pad_sort_order(&self, field: usize, no_pad_key: bool) -> bool {
        match self.field_type(field) {
            FieldType::NoPadCharString | FieldType::NoPadUnicodeString => true,
            FieldType::CharString | FieldType::UnicodeString => {
                self.schema.fixed[field] && no_pad_key
            }
            _ => false,
        }
    }

    /// Coerce one operand. Mirrors the numeric rounding and decimal
    /// clamping rules, detects NO-PAD keys, and applies the pre-v4
    /// trailing-space compatibility.
    fn get_value(&self, field: usize, op: CompareOp, value: &Value) -> Result<Option<Got>> {
        if value.is_null() {
            return Ok(None);
        }
        let ty = self.field_type(field);
        let got = match (ty, value) {
            (FieldType::Int32, Value::F64(d)) => match codec::round_f64_to_i32(*d, op) {
                Some((v, op)) => Got::Hit {
                    text: v.to_string(),
                    no_pad_key: false,
                    op,
                },
                None => Got::Miss,
            },
            (FieldType::Int32, Value::Int64(v)) => match codec::round_i64_to_i32(*v, op) {
                Some((v, op)) => Got::Hit {
                    text: v.to_string(),
                    no_pad_key: false,
                    op,
                },
                None => Got::Miss,
            },
            (FieldType::Int64, Value::F64(d)) => match codec::round_f64_to_i64(*d, op) {
                Some((v, op)) => Got::Hit {
                    text: v.to_string(),
                    no_pad_key: false,
                    op,
                },
                None => Got::Miss,
            },
            (FieldType::Decimal, v) => {
                let (precision, scale) = self.schema.decimal[field];
                let text = value_text(v)?;
                match Decimal::round(&text, op, precision, scale)? {
                    Some((d, op)) => Got::Hit {
                        text: d.to_string(),
                        no_pad_key: false,
                        op,
                    },
                    None => Got::Miss,
                }
            }
            (
                FieldType::CharString
                | FieldType::UnicodeString
                | FieldType::NoPadCharString
                | FieldType::NoPadUnicodeString,
                Value::String { text, collation },
            ) => {
                let mut no_pad_key = *collation == Collation::NoPad;
                let mut text = text.clone();
                if matches!(
                    ty,
                    FieldType::NoPadCharString | FieldType::NoPadUnicodeString
                ) {
                    if *collation != Collation::NoPad {
                        if self.schema.legacy_no_pad
                            && !self.schema.fixed[field]
                            && op != CompareOp::Like
                        {
                            // Pre-v4 varchar sorted NO PAD: simulate the
                            // old behavior by ignoring trailing spaces.
                            while text.ends_with(' ') {
                                text.pop();
                            }
                        }
                    }
                    no_pad_key = true;
                }
                if self.schema.fixed[field] && op != CompareOp::Like {
                    // A fixed-width field stores its value padded; the
                    // operand joins it on the same footing.
                    let declared = self.schema.lengths[field];
                    let mut chars = text.chars().count();
                    while chars < declared {
                        text.push(' ');
                        chars += 1;
                    }
                }
                Got::Hit {
                    text,
                    no_pad_key,
                    op,
                }
            }
            _ => Got::Hit {
                text: value_text(value)?,
                no_pad_key: false,
                op,
            },
        };
        Ok(Some(got))
    }

    fn compile_compare(
        &self,
        field: usize,
        op: CompareOp,
        value: &Value,
    ) -> Result<Option<PlanParts>> {
        match op {
            CompareOp::Equals => {}
            CompareOp::NotEquals => return self.compile_not_equals(field, value),
            CompareOp::GreaterThan
            | CompareOp::GreaterThanEquals
            | CompareOp::LessThan
            | CompareOp::LessThanEquals => return self.compile_inequality(field, op, value),
            _ => return Ok(None),
        }
        let got = match self.get_value(field, op, value)? {
            Some(got) => got,
            None => return Ok(Some(PlanParts::unknown())),
        };
        let (text, no_pad_key, _op) = match got {
            Got::Hit {
                text, no_pad_key, op,
            } => (text, no_pad_key, op),
            Got::Miss => return Ok(Some(PlanParts::unknown())),
        };
        let no_pad_field = self.no_pad_sort_order(field, no_pad_key);
        Ok(Some(self.equals_parts(&text, no_pad_field, no_pad_key)))
    }

    /// `=` expands to a closed range; a NO-PAD key over a PAD-SPACE
    /// field widens the lower bound and re-filters exactly.
    fn equals_parts(&self, text: &str, no_pad_field: bool, no_pad_key: bool) -> PlanParts {
        let padding = padding_char(no_pad_field || no_pad_key);
        if !no_pad_field && no_pad_key {
            PlanParts {
                lower: Some(BoundOut {
                    op: CompareOp::GreaterThanEquals,
                    text: Some(text.to_string()),
                    optional_char: Some(PADDING_CHAR),
                }),
                upper: Some(BoundOut {
                    op: CompareOp::LessThanEquals,
                    text: Some(text.to_string()),
                    optional_char: padding,
                }),
                others: vec![OtherOut {
                    op: CompareOp::Equals,
                    text: Some(text.to_string()),
                    optional_char: padding,
                }],
                is_equality: true,
                unknown: false,
            }
        } else {
            PlanParts {
                lower: Some(BoundOut {
                    op: CompareOp::GreaterThanEquals,
                    text: Some(text.to_string()),
                    optional_char: padding,
                }),
                upper: Some(BoundOut {
                    op: CompareOp::LessThanEquals,
                    text: Some(text.to_string()),
                    optional_char: padding,
                }),
                others: Vec::new(),
                is_equality: true,
                unknown: false,
            }
        }
    }

    fn compile_not_equals(&self, field: usize, value: &Value) -> Result<Option<PlanParts>> {
        if self.flavor != IndexFlavor::Btree {
            return Ok(None);
        }
        let got = match self.get_value(field, CompareOp::NotEquals, value)? {
            Some(got) => got,
            None => return Ok(Some(PlanParts::unknown())),
        };
        let (text, no_pad_key, op) = match got {
            Got::Hit {
                text, no_pad_key, op,
            } => (text, no_pad_key, op),
            Got::Miss => return Ok(Some(PlanParts::unknown())),
        };
        let no_pad_field = self.no_pad_sort_order(field, no_pad_key);
        let padding = padding_char(no_pad_field || no_pad_key);
        // The decimal path rounds `!=` into `>= min(p, s)`: over-broad
        // as a range, corrected by the retained `!=` filter.
        let lower = if self.field_type(field) == FieldType::Decimal {
            Some(BoundOut {
                op,
                text: Some(text.clone()),
                optional_char: padding,
            })
        } else {
            None
        };
        Ok(Some(PlanParts {
            lower,
            upper: None,
            others: vec![OtherOut {
                op: CompareOp::NotEquals,
                text: Some(text),
                optional_char: padding,
            }],
            is_equality: false,
            unknown: false,
        }))
    }

    fn compile_inequality(
        &self,
        field: usize,
        op: CompareOp,
        value: &Value,
    ) -> Result<Option<PlanParts>> {
        let got = match self.get_value(field, op, value)? {
            Some(got) => got,
            None => return Ok(Some(PlanParts::unknown())),
        };
        let (text, no_pad_key, op) = match got {
            Got::Hit {
                text, no_pad_key, op,
            } => (text, no_pad_key, op),
            Got::Miss => return Ok(Some(PlanParts::unknown())),
        };
        let no_pad_field = self.no_pad_sort_order(field, no_pad_key);
        let mut parts = PlanParts::default();
        match op {
            CompareOp::GreaterThan | CompareOp::GreaterThanEquals => {
                self.lower_bound_parts(&mut parts, op, &text, no_pad_field, no_pad_key);
            }
            CompareOp::LessThan | CompareOp::LessThanEquals => {
                self.upper_bound_parts(&mut parts, op, &text, no_pad_field, no_pad_key);
            }
            _ => return Ok(None),
        }
        Ok(Some(parts))
    }

    fn compile_between(
        &self,
        field: usize,
        lower: &Value,
        upper: &Value,
    ) -> Result<Option<PlanParts>> {
        let lo = match self.compile_inequality(field, CompareOp::GreaterThanEquals, lower)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let hi = match self.compile_inequality(field, CompareOp::LessThanEquals, upper)? {
            Some(p) => p,
            None => return Ok(None),
        };
        if lo.unknown || hi.unknown {
            return Ok(Some(PlanParts::unknown()));
        }
        let mut others = lo.others;
        others.extend(hi.others);
        Ok(Some(PlanParts {
            lower: lo.lower,
            upper: hi.upper,
            others,
            is_equality: false,
            unknown: false,
        }))
    }

    /// PAD-SPACE lower-bound expansion: strip the trailing SOH run and
    /// decrement the preceding character, keeping the original as an
    /// exact filter. An all-SOH (or empty) key leaves the lower side
    /// open.
    fn lower_bound_parts(
        &self,
        parts: &mut PlanParts,
        op: CompareOp,
        text: &str,
        no_pad_field: bool,
        no_pad_key: bool,
    ) {
        let oc = padding_char(no_pad_field || no_pad_key);
        if !no_pad_field && no_pad_key {
            let position = trailing_soh_position(text);
            let mut keep_other = false;
            if position != 0 {
                let expanded = decrement_last_char_at(text, position);
                parts.lower = Some(BoundOut {
                    op: CompareOp::GreaterThan,
                    text: Some(expanded),
                    optional_char: Some(PADDING_CHAR),
                });
                keep_other = true;
            } else {
                parts.lower = None;
                if op == CompareOp::GreaterThan || !text.is_empty() {
                    keep_other = true;
                }
            }
            if keep_other {
                parts.others.push(OtherOut {
                    op,
                    text: Some(text.to_string()),
                    optional_char: oc,
                });
            }
        } else {
            parts.lower = Some(BoundOut {
                op,
                text: Some(text.to_string()),
                optional_char: oc,
            });
        }
    }

    /// PAD-SPACE upper-bound expansion: truncate at the first character
    /// below the space, or widen `<=` past a space-free tail.
    fn upper_bound_parts(
        &self,
        parts: &mut PlanParts,
        op: CompareOp,
        text: &str,
        no_pad_field: bool,
        no_pad_key: bool,
    ) {
        let oc = padding_char(no_pad_field || no_pad_key);
        if !no_pad_field && no_pad_key {
            let position = first_small_char_position(text);
            let length = text.chars().count();
            if position != length {
                let truncated: String = text.chars().take(position).collect();
                parts.upper = Some(BoundOut {
                    op: CompareOp::LessThanEquals,
                    text: Some(truncated),
                    optional_char: Some(PADDING_CHAR),
                });
                parts.others.push(OtherOut {
                    op,
                    text: Some(text.to_string()),
                    optional_char: oc,
                });
            } else if op == CompareOp::LessThanEquals
                && (length == 0 || !text.ends_with(PADDING_CHAR))
            {
                parts.upper = Some(BoundOut {
                    op: CompareOp::LessThanEquals,
                    text: Some(text.to_string()),
                    optional_char: Some(PADDING_CHAR),
                });
                parts.others.push(OtherOut {
                    op,
                    text: Some(text.to_string()),
                    optional_char: oc,
                });
            } else {
                parts.upper = Some(BoundOut {
                    op,
                    text: Some(text.to_string()),
                    optional_char: oc,
                });
            }
        } else {
            parts.upper = Some(BoundOut {
                op,
                text: Some(text.to_string()),
                optional_char: oc,
            });
        }
    }

    fn compile_like(
        &self,
        field: usize,
        pattern: &str,
        escape: Option<&str>,
    ) -> Result<Option<PlanParts>> {
        if !self.field_type(field).is_string() {
            return Ok(None);
        }
        let escape = match escape {
            None => None,
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => return Err(Error::new(ErrorCode::InvalidEscape)),
                }
            }
        };
        let got = self.get_value(
            field,
            CompareOp::Like,
            &Value::String {
                text: pattern.to_string(),
                collation: Collation::Implicit,
            },
        )?;
        let pattern = match got {
            Some(Got::Hit { text, .. }) => text,
            _ => return Ok(Some(PlanParts::unknown())),
        };
        // LIKE always compares NO PAD.
        let no_pad_key = true;
        let no_pad_field = self.no_pad_sort_order(field, no_pad_key);

        let (lower, upper, is_prefix) = match expand_pattern(&pattern, escape) {
            Some(expansion) => expansion,
            None => return Ok(None),
        };

        if lower == upper {
            // No wildcard at all: plain equality on the literal text.
            return Ok(Some(self.equals_parts(&lower, no_pad_field, no_pad_key)));
        }

        let mut parts = PlanParts::default();
        if !no_pad_field {
            let position = trailing_soh_position(&lower);
            if position != 0 {
                let expanded = decrement_last_char_at(&lower, position);
                parts.lower = Some(BoundOut {
                    op: CompareOp::GreaterThan,
                    text: Some(expanded),
                    optional_char: Some(PADDING_CHAR),
                });
            }
        } else {
            parts.lower = Some(BoundOut {
                op: CompareOp::GreaterThanEquals,
                text: Some(lower.clone()),
                optional_char: None,
            });
        }

        if is_prefix {
            parts.upper = Some(BoundOut {
                op: CompareOp::LessThan,
                text: Some(upper),
                optional_char: None,
            });
            if !no_pad_field {
                // The original prefix filters the widened range.
                parts.others.push(OtherOut {
                    op: CompareOp::GreaterThanEquals,
                    text: Some(lower),
                    optional_char: None,
                });
            }
        } else {
            parts.upper = Some(BoundOut {
                op: CompareOp::LessThanEquals,
                text: Some(upper),
                optional_char: None,
            });
            parts.others.push(OtherOut {
                op: CompareOp::Like,
                text: Some(remap_escape(&pattern, escape)),
                optional_char: escape.map(|_| '*'),
            });
        }
        Ok(Some(parts))
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    fn write_plan(&self, kind: TreeKind, parts: &PlanParts, field: usize) -> String {
        let mut out = format!("%{}(", kind.code());
        match &parts.lower {
            Some(b) => put_cond(&mut out, b.op, &[b.text.as_deref()], b.optional_char),
            None => out.push_str("#ud"),
        }
        match &parts.upper {
            Some(b) => put_cond(&mut out, b.op, &[b.text.as_deref()], b.optional_char),
            None => out.push_str("#ud"),
        }
        for other in &parts.others {
            put_other(&mut out, field, other);
        }
        out.push(')');
        out
    }
}

fn write_bound_segments(
    out: &mut String,
    segments: &[(Option<String>, Option<char>, CompareOp)],
    default_op: CompareOp,
) {
    if segments.is_empty() {
        out.push_str("#ud");
        return;
    }
    // The last segment's operator and collation drive the whole bound.
    let (_, last_oc, last_op) = &segments[segments.len() - 1];
    let op = if segments.len() == 1 {
        *last_op
    } else if matches!(last_op, CompareOp::Undefined) {
        default_op
    } else {
        *last_op
    };
    let views: Vec<Option<&str>> = segments.iter().map(|(t, _, _)| t.as_deref()).collect();
    put_cond(out, op, &views, *last_oc);
}

fn padding_char(no_pad: bool) -> Option<char> {
    if no_pad {
        None
    } else {
        Some(PADDING_CHAR)
    }
}

fn value_text(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Int32(v) => v.to_string(),
        Value::UInt32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::ObjectId(v) => v.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        Value::LanguageSet(codes) => codes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        Value::String { text, .. } => text.clone(),
        Value::Null => return Err(Error::new(ErrorCode::BadArgument)),
    })
}

/// Expand a LIKE pattern into its sort-order envelope. Returns the
/// lower text, the upper text (last character incremented), and whether
/// the pattern is a pure prefix match. `None` when the pattern starts
/// with a wildcard and cannot bound a range.
fn expand_pattern(pattern: &str, escape: Option<char>) -> Option<(String, String, bool)> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut lower = String::new();
    let mut upper = String::new();
    let mut is_prefix = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if Some(c) == escape {
            i += 1;
            if i == chars.len() {
                break;
            }
            lower.push(chars[i]);
            upper.push(chars[i]);
            i += 1;
            continue;
        }
        if c == '%' || c == '_' {
            if lower.is_empty() {
                // A leading wildcard cannot seed the range.
                return None;
            }
            upper = increment_last_char(&upper);
            if c == '%' && i + 1 == chars.len() {
                is_prefix = true;
            }
            break;
        }
        lower.push(c);
        upper.push(c);
        i += 1;
    }
    Some((lower, upper, is_prefix))
}

/// Rewrite a LIKE payload so `*` is the wire escape character: the
/// user's escape becomes `*`, a literal `*` escapes itself.
fn remap_escape(pattern: &str, escape: Option<char>) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            out.push('*');
            match chars.next() {
                Some(escaped) => {
                    if escaped == '*' {
                        // An escaped literal `*` stays escaped.
                        out.push('*');
                    }
                    out.push(escaped);
                }
                None => break,
            }
        } else if c == '*' && escape.is_some() {
            out.push('*');
            out.push('*');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;

    fn char_schema() -> ConditionSchema {
        let mut s = ConditionSchema::single(FieldType::CharString);
        s.fixed = vec![false];
        s
    }

    fn int_schema() -> ConditionSchema {
        ConditionSchema::single(FieldType::Int32)
    }

    fn compile(schema: &ConditionSchema, flavor: IndexFlavor, p: &Predicate) -> OpenOption {
        let builder = ConditionBuilder::new(schema, flavor);
        let mut option = OpenOption::default();
        assert!(builder.get_search_parameter(Some(p), &mut option).unwrap());
        option
    }

    fn plan(option: &OpenOption, n: usize) -> &str {
        option.get_str(&format!("Condition[{n}]")).unwrap()
    }

    #[test]
    fn test_int_equals() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::Int32(42),
            },
        );
        assert_eq!(plan(&option, 0), "%0(#ge(42, )#le(42, ))");
        let c = Condition::parse(&option, 0, schema).unwrap();
        assert!(c.is_valid());
    }

    #[test]
    fn test_fractional_equals_is_unknown() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::F64(3.5),
            },
        );
        assert_eq!(plan(&option, 0), "%0(#uk#uk)");
        let c = Condition::parse(&option, 0, schema).unwrap();
        assert!(!c.is_valid());
    }

    #[test]
    fn test_fractional_greater_rounds() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::GreaterThan,
                field: 0,
                value: Value::F64(3.5),
            },
        );
        assert_eq!(plan(&option, 0), "%0(#gt(3, )#ud)");
    }

    #[test]
    fn test_pad_space_equals_with_no_pad_key() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::string_no_pad("abc"),
            },
        );
        // Lower PAD SPACE, upper NO PAD, exact NO-PAD equality filter.
        assert_eq!(plan(&option, 0), "%0(#ge(abc, )#le(abc)#eq(0\u{1f}abc))");
    }

    #[test]
    fn test_greater_than_soh_expansion() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::GreaterThan,
                field: 0,
                value: Value::string_no_pad("abc"),
            },
        );
        // Lower widens to 'abb' PAD SPACE; the original filters.
        assert_eq!(plan(&option, 0), "%0(#gt(abb, )#ud#gt(0\u{1f}abc))");
    }

    #[test]
    fn test_greater_than_all_soh_goes_open() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::GreaterThanEquals,
                field: 0,
                value: Value::string_no_pad("\u{1}"),
            },
        );
        assert_eq!(plan(&option, 0), "%0(#ud#ud#ge(0\u{1f}\u{1}))");
    }

    #[test]
    fn test_less_than_small_char_truncation() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::LessThan,
                field: 0,
                value: Value::string_no_pad("abc\ndef"),
            },
        );
        // Upper truncates at the newline; the original filters.
        assert_eq!(plan(&option, 0), "%0(#ud#le(abc, )#lt(0\u{1f}abc\ndef))");
    }

    #[test]
    fn test_less_than_equals_expands() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::LessThanEquals,
                field: 0,
                value: Value::string_no_pad("abc"),
            },
        );
        assert_eq!(plan(&option, 0), "%0(#ud#le(abc, )#le(0\u{1f}abc))");
    }

    #[test]
    fn test_like_prefix() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Like {
                field: 0,
                pattern: "abc%".to_string(),
                escape: None,
            },
        );
        assert_eq!(plan(&option, 0), "%0(#gt(abb, )#lt(abd)#ge(0\u{1f}abc))");
    }

    #[test]
    fn test_like_infix_keeps_filter() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Like {
                field: 0,
                pattern: "abc%xyz".to_string(),
                escape: None,
            },
        );
        assert_eq!(
            plan(&option, 0),
            "%0(#gt(abb, )#le(abd)#lk(0\u{1f}abc%xyz))"
        );
    }

    #[test]
    fn test_like_escape_remap() {
        let schema = char_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Like {
                field: 0,
                pattern: "a!%b%".to_string(),
                escape: Some("!".to_string()),
            },
        );
        // "a!%b%": literal percent then prefix wildcard; the wire escape
        // becomes '*'.
        assert_eq!(plan(&option, 0), "%0(#gt(a%a, )#lt(a%c)#ge(0\u{1f}a%b))");
        let c = Condition::parse(&option, 0, char_schema()).unwrap();
        assert!(c.is_valid());
    }

    #[test]
    fn test_like_leading_wildcard_rejected() {
        let schema = char_schema();
        let builder = ConditionBuilder::new(&schema, IndexFlavor::Array);
        let mut option = OpenOption::default();
        let ok = builder
            .get_search_parameter(
                Some(&Predicate::Like {
                    field: 0,
                    pattern: "%abc".to_string(),
                    escape: None,
                }),
                &mut option,
            )
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_bad_escape_rejected() {
        let schema = char_schema();
        let builder = ConditionBuilder::new(&schema, IndexFlavor::Array);
        let mut option = OpenOption::default();
        let err = builder
            .get_search_parameter(
                Some(&Predicate::Like {
                    field: 0,
                    pattern: "abc%".to_string(),
                    escape: Some("!!".to_string()),
                }),
                &mut option,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEscape);
    }

    #[test]
    fn test_is_null_scans() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::IsNull {
                field: 0,
                per_element: false,
            },
        );
        assert_eq!(plan(&option, 0), "%2(#ud#ud)");
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::IsNull {
                field: 0,
                per_element: true,
            },
        );
        assert_eq!(plan(&option, 0), "%1(#ud#ud)");
    }

    #[test]
    fn test_not_null_scans_both_trees() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::NotNull {
                field: 0,
                per_element: false,
            },
        );
        assert_eq!(option.get_int("ConditionCount"), Some(2));
        assert_eq!(plan(&option, 0), "%1(#ud#ud)");
        assert_eq!(plan(&option, 1), "%0(#ud#ud)");
    }

    #[test]
    fn test_bitmap_rejects_not_null() {
        let schema = int_schema();
        let builder = ConditionBuilder::new(&schema, IndexFlavor::Bitmap);
        let mut option = OpenOption::default();
        let ok = builder
            .get_search_parameter(
                Some(&Predicate::NotNull {
                    field: 0,
                    per_element: false,
                }),
                &mut option,
            )
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_or_branches() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Or(vec![
                Predicate::Compare {
                    op: CompareOp::Equals,
                    field: 0,
                    value: Value::Int32(1),
                },
                Predicate::Compare {
                    op: CompareOp::Equals,
                    field: 0,
                    value: Value::Int32(9),
                },
            ]),
        );
        assert_eq!(option.get_int("ConditionCount"), Some(2));
        assert_eq!(plan(&option, 0), "%0(#ge(1, )#le(1, ))");
        assert_eq!(plan(&option, 1), "%0(#ge(9, )#le(9, ))");
    }

    #[test]
    fn test_null_operand_collapses_to_unknown() {
        let schema = int_schema();
        let option = compile(
            &schema,
            IndexFlavor::Array,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::Null,
            },
        );
        assert_eq!(plan(&option, 0), "%0(#uk#uk)");
    }

    #[test]
    fn test_btree_conjunction_composition() {
        let schema = ConditionSchema {
            key_types: vec![FieldType::Int32, FieldType::Int32],
            fixed: vec![true, true],
            lengths: vec![0, 0],
            decimal: vec![(15, 0), (15, 0)],
            use_header: false,
            top_null: true,
            legacy_no_pad: false,
        };
        let option = compile(
            &schema,
            IndexFlavor::Btree,
            &Predicate::And(vec![
                Predicate::Compare {
                    op: CompareOp::Equals,
                    field: 0,
                    value: Value::Int32(7),
                },
                Predicate::Compare {
                    op: CompareOp::GreaterThan,
                    field: 1,
                    value: Value::Int32(100),
                },
            ]),
        );
        assert_eq!(plan(&option, 0), "%3(#gt(7\u{1f}100, )#le(7, ))");
        let c = Condition::parse(&option, 0, schema).unwrap();
        assert!(c.is_valid());
        assert_eq!(c.lower().types.len(), 2);
        assert_eq!(c.upper().types.len(), 1);
    }

    #[test]
    fn test_btree_fetch_parameter() {
        let schema = int_schema();
        let builder = ConditionBuilder::new(&schema, IndexFlavor::Btree);
        let mut option = OpenOption::default();
        assert!(builder
            .get_search_parameter(Some(&Predicate::Fetch { fields: vec![0] }), &mut option)
            .unwrap());
        assert_eq!(option.get_int("FetchFieldNumber"), Some(1));
        assert_eq!(option.get_int("OpenMode"), Some(keys::MODE_SEARCH));
    }

    #[test]
    fn test_verify_parameter() {
        let schema = int_schema();
        let builder = ConditionBuilder::new(&schema, IndexFlavor::Array);
        let mut option = OpenOption::default();
        assert!(builder
            .get_verify_parameter(&[Value::Int32(3), Value::Null], 12, &mut option)
            .unwrap());
        assert_eq!(option.get_int("ConditionCount"), Some(2));
        assert_eq!(plan(&option, 0), "%0(#ge(3, )#le(3, ))");
        assert_eq!(plan(&option, 1), "%1(#ud#ud)");
        assert_eq!(option.get_str("RowID"), Some("12"));
        assert_eq!(option.get_bool("Verify"), Some(true));
    }

    #[test]
    fn test_expand_pattern() {
        assert_eq!(
            expand_pattern("abc%", None),
            Some(("abc".into(), "abd".into(), true))
        );
        assert_eq!(
            expand_pattern("abc%x", None),
            Some(("abc".into(), "abd".into(), false))
        );
        assert_eq!(
            expand_pattern("ab_", None),
            Some(("ab".into(), "ac".into(), false))
        );
        assert_eq!(expand_pattern("%abc", None), None);
        assert_eq!(
            expand_pattern("abc", None),
            Some(("abc".into(), "abc".into(), false))
        );
        // Escaped wildcard is literal.
        assert_eq!(
            expand_pattern("a!%%", Some('!')),
            Some(("a%".into(), "a&".into(), true))
        );
    }

    #[test]
    fn test_remap_escape() {
        assert_eq!(remap_escape("a!%b", Some('!')), "a*%b");
        assert_eq!(remap_escape("a*b", Some('!')), "a**b");
        assert_eq!(remap_escape("a%b", None), "a%b");
        assert_eq!(remap_escape("a!!b", Some('!')), "a*!b");
    }
}
