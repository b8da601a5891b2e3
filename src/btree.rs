//! Scalar/multi-column B-tree index flavor.
//!
//! One tree over `(k1..kn, rowid)`. With `UseHeader` set, leaf and node
//! entries carry the one-word header: keys become individually nullable
//! through the bitmap, and logical deletion flips the expunge bit so a
//! constraint-lock scan can still observe the tombstone.

use std::collections::BTreeSet;

use crate::condition::{Condition, ConditionSchema};
use crate::entry;
use crate::error::{Error, ErrorCode, Result};
use crate::file::TreeFile;
use crate::fileid::FileParams;
use crate::physical::PagedFile;
use crate::tree::Tree;
use crate::types::{FixMode, RowId, Value, NO_PAGE};

const SLOT: usize = 0;

pub struct BtreeFile<F: PagedFile> {
    driver: TreeFile<F>,
    tree: Tree,
    schema: ConditionSchema,
    key_count: usize,
    /// Key values (rowid excluded) must be unique across rows.
    unique: bool,
}

impl<F: PagedFile> BtreeFile<F> {
    pub fn new(file: F, params: &FileParams) -> Result<Self> {
        let key_count = params.key_field_count();
        if key_count == 0 {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let mut key_types = Vec::with_capacity(key_count);
        let mut fixed = Vec::with_capacity(key_count);
        let mut lengths = Vec::with_capacity(key_count);
        let mut decimal = Vec::with_capacity(key_count);
        for i in 0..key_count {
            let field = params.field_schema(i)?;
            let chars = match field.field_type {
                crate::codec::FieldType::UnicodeString
                | crate::codec::FieldType::NoPadUnicodeString => field.length / 2,
                _ => field.length,
            };
            key_types.push(field.field_type);
            fixed.push(field.fixed);
            lengths.push(if field.field_type.is_string() { chars } else { 0 });
            decimal.push(params.decimal_parameter(i));
        }
        let use_header = params.use_header();
        let top_null = params.top_null();
        let schema = ConditionSchema {
            key_types: key_types.clone(),
            fixed,
            lengths,
            decimal,
            use_header,
            top_null,
            legacy_no_pad: params.keeps_legacy_no_pad(),
        };
        Ok(BtreeFile {
            driver: TreeFile::new(file, 1),
            tree: Tree::btree(key_types, use_header, top_null),
            schema,
            key_count,
            unique: params.is_unique(),
        })
    }

    pub fn condition_schema(&self) -> &ConditionSchema {
        &self.schema
    }

    pub fn key_count(&self) -> usize {
        self.key_count
    }

    pub fn create(&mut self) -> Result<()> {
        self.driver.create()
    }

    pub fn open(&mut self, writable: bool) -> Result<()> {
        self.driver.set_fix_mode(if writable {
            FixMode::Write
        } else {
            FixMode::ReadOnly
        });
        self.driver.load_tree_header(SLOT, &mut self.tree)
    }

    pub fn close(&mut self) -> Result<()> {
        self.driver.flush_all()
    }

    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.driver.set_fix_mode(FixMode::Write);
        match f(self) {
            Ok(result) => {
                self.driver.save_tree_header(SLOT, &self.tree)?;
                self.driver.flush_all()?;
                Ok(result)
            }
            Err(e) => {
                let _ = self.driver.recover_all();
                Err(e)
            }
        }
    }

    fn leaf_entry(&self, keys: &[Value], rowid: RowId) -> Result<Vec<u8>> {
        if keys.len() != self.key_count {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let mut values = keys.to_vec();
        values.push(Value::UInt32(rowid));
        self.tree.make_leaf_entry(&values)
    }

    /// Insert one `(keys, rowid)` row. A unique index refuses a key
    /// prefix another row already carries.
    pub fn insert(&mut self, keys: &[Value], rowid: RowId) -> Result<()> {
        let entry = self.leaf_entry(keys, rowid)?;
        self.mutate(|file| {
            if file.unique && file.key_in_use(&entry)? {
                return Err(Error::new(ErrorCode::UniquenessViolation));
            }
            file.driver.insert_entry(&mut file.tree, &entry)?;
            file.tree.header.count += 1;
            file.driver.header_page()?.increment_tuple_count()
        })
    }

    /// Does any row already carry this entry's key prefix?
    fn key_in_use(&mut self, entry: &[u8]) -> Result<bool> {
        let cmp = self.tree.key_comparator().clone();
        let leaf = match self.driver.leaf_for(
            &self.tree,
            entry,
            &cmp,
            crate::types::CompareOp::Undefined,
        )? {
            None => return Ok(false),
            Some(pid) => pid,
        };
        let (next, hit) = {
            let page = self.driver.page(leaf)?;
            let idx = page.lower_bound(entry, &cmp)?;
            if idx < page.count() {
                (
                    NO_PAGE,
                    cmp.compare(page.entry(idx), entry)? == std::cmp::Ordering::Equal,
                )
            } else {
                (page.next_id(), false)
            }
        };
        if hit {
            return Ok(true);
        }
        // The probe may sit at a page boundary: the first equal entry
        // would then open the next leaf.
        if next != NO_PAGE {
            self.driver.attach(&self.tree, next, None, FixMode::Unknown)?;
            let page = self.driver.page(next)?;
            if page.count() != 0
                && cmp.compare(page.entry(0), entry)? == std::cmp::Ordering::Equal
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove one row.
    pub fn expunge(&mut self, keys: &[Value], rowid: RowId) -> Result<()> {
        let entry = self.leaf_entry(keys, rowid)?;
        self.mutate(|file| {
            file.driver.expunge_entry(&mut file.tree, &entry)?;
            file.tree.header.count -= 1;
            file.driver.header_page()?.decrement_tuple_count()
        })
    }

    /// Re-key one row in place.
    pub fn update(&mut self, old_keys: &[Value], new_keys: &[Value], rowid: RowId) -> Result<()> {
        let old = self.leaf_entry(old_keys, rowid)?;
        let new = self.leaf_entry(new_keys, rowid)?;
        self.mutate(|file| {
            file.driver.expunge_entry(&mut file.tree, &old)?;
            file.driver.insert_entry(&mut file.tree, &new)
        })
    }

    /// Logical deletion: flip the expunge bit without restructuring.
    /// Requires the header layout.
    pub fn mark_expunged(&mut self, keys: &[Value], rowid: RowId, flag: bool) -> Result<()> {
        if !self.tree.uses_header() {
            return Err(Error::new(ErrorCode::NotSupported));
        }
        let probe = self.leaf_entry(keys, rowid)?;
        self.mutate(|file| {
            let cmp = file.tree.comparator().clone();
            let leaf = file
                .driver
                .leaf_for(&file.tree, &probe, &cmp, crate::types::CompareOp::Undefined)?
                .ok_or(Error::new(ErrorCode::BadArgument))?;
            let mut entry = {
                let page = file.driver.page(leaf)?;
                let idx = page
                    .find(&probe, &cmp)?
                    .ok_or(Error::new(ErrorCode::BadArgument))?;
                page.entry(idx).to_vec()
            };
            entry::set_expunge_flag(&mut entry, flag)?;
            // Same size, same position: rewrite through expunge+insert
            // of the packed bytes.
            file.driver.expunge_entry(&mut file.tree, &probe)?;
            file.driver.insert_entry(&mut file.tree, &entry)
        })
    }

    pub fn search(&mut self, cond: &Condition) -> Result<()> {
        self.driver.search(&self.tree, cond)
    }

    /// Next matching rowid.
    pub fn get(&mut self, cond: &Condition) -> Result<Option<RowId>> {
        match self.driver.get(&self.tree, cond)? {
            None => Ok(None),
            Some(bytes) => self.rowid_of(&bytes).map(Some),
        }
    }

    /// Next matching row projected as `(keys, rowid)`.
    pub fn get_projected(&mut self, cond: &Condition) -> Result<Option<(Vec<Value>, RowId)>> {
        let bytes = match self.driver.get(&self.tree, cond)? {
            None => return Ok(None),
            Some(bytes) => bytes,
        };
        let types = self.tree.leaf_layout().types();
        let offsets = entry::field_offsets(&bytes, types, self.tree.uses_header())?;
        let mut keys = Vec::with_capacity(self.key_count);
        for (n, at) in offsets.iter().take(self.key_count).enumerate() {
            match at {
                None => keys.push(Value::Null),
                Some(at) => {
                    let mut p = &bytes[*at..];
                    keys.push(crate::codec::load(&mut p, types[n])?);
                }
            }
        }
        let rowid = self.rowid_of(&bytes)?;
        Ok(Some((keys, rowid)))
    }

    pub fn get_by_bit_set(&mut self, cond: &Condition, bits: &mut BTreeSet<RowId>) -> Result<()> {
        while let Some(rowid) = self.get(cond)? {
            bits.insert(rowid);
        }
        Ok(())
    }

    fn rowid_of(&self, bytes: &[u8]) -> Result<RowId> {
        let types = self.tree.leaf_layout().types();
        let offsets = entry::field_offsets(bytes, types, self.tree.uses_header())?;
        let at = offsets[self.key_count].ok_or(Error::new(ErrorCode::Corrupt))?;
        crate::codec::read_u32(bytes, at)
    }

    pub fn mark(&mut self) -> bool {
        self.driver.mark()
    }

    pub fn rewind(&mut self) -> bool {
        self.driver.rewind()
    }

    pub fn estimate_count(&mut self, cond: &Condition) -> Result<u32> {
        if !cond.is_valid() {
            return Ok(1);
        }
        let estimate = if cond.is_fetch() {
            self.driver.estimate_fetch(&self.tree)?
        } else {
            self.driver.estimate_search(&self.tree, cond)?
        };
        Ok(estimate.max(1))
    }

    pub fn verify(&mut self) -> Result<()> {
        self.driver.verify_tree(&self.tree)
    }

    pub fn set_cancel_check(&mut self, check: Box<dyn Fn() -> bool>) {
        self.driver.set_cancel_check(check);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldType;
    use crate::condition::builder::{ConditionBuilder, IndexFlavor, Predicate};
    use crate::condition::OpenOption;
    use crate::fileid::LogicalType;
    use crate::physical::MemoryPagedFile;
    use crate::types::CompareOp;

    fn params(nullable: bool) -> FileParams {
        let mut p = FileParams::new();
        p.set_int("KeyFieldNumber", 2);
        p.set_indexed_int("FieldType", 0, LogicalType::Char as i64);
        p.set_indexed_bool("FieldFixed", 0, false);
        p.set_indexed_int("FieldCollation", 0, 2);
        p.set_indexed_int("FieldType", 1, LogicalType::Int as i64);
        if nullable {
            p.set_bool("UseHeader", true);
        }
        p
    }

    fn open_file(nullable: bool) -> BtreeFile<MemoryPagedFile> {
        let p = params(nullable);
        let mut f = BtreeFile::new(MemoryPagedFile::new(1024), &p).unwrap();
        f.create().unwrap();
        f.open(true).unwrap();
        f
    }

    fn compile(f: &BtreeFile<MemoryPagedFile>, p: &Predicate) -> Condition {
        let builder = ConditionBuilder::new(f.condition_schema(), IndexFlavor::Btree);
        let mut option = OpenOption::default();
        assert!(builder.get_search_parameter(Some(p), &mut option).unwrap());
        Condition::parse(&option, 0, f.condition_schema().clone()).unwrap()
    }

    fn rows(f: &mut BtreeFile<MemoryPagedFile>, cond: &Condition) -> Vec<RowId> {
        f.search(cond).unwrap();
        let mut out = Vec::new();
        while let Some(r) = f.get(cond).unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_multi_key_roundtrip() {
        let mut f = open_file(false);
        f.insert(&[Value::string_no_pad("a"), Value::Int32(1)], 10)
            .unwrap();
        f.insert(&[Value::string_no_pad("a"), Value::Int32(2)], 11)
            .unwrap();
        f.insert(&[Value::string_no_pad("b"), Value::Int32(1)], 12)
            .unwrap();
        let cond = compile(
            &f,
            &Predicate::And(vec![
                Predicate::Compare {
                    op: CompareOp::Equals,
                    field: 0,
                    value: Value::string_no_pad("a"),
                },
            ]),
        );
        assert_eq!(rows(&mut f, &cond), vec![10, 11]);
    }

    #[test]
    fn test_nullable_key_with_bitmap() {
        let mut f = open_file(true);
        f.insert(&[Value::string_no_pad("abc"), Value::Null], 1)
            .unwrap();
        f.insert(&[Value::string_no_pad("abc"), Value::Int32(5)], 2)
            .unwrap();
        f.insert(&[Value::string_no_pad("abd"), Value::Null], 3)
            .unwrap();
        // field2 IS NULL becomes a null-bitmap filter.
        let cond = compile(
            &f,
            &Predicate::And(vec![Predicate::IsNull {
                field: 1,
                per_element: false,
            }]),
        );
        assert_eq!(rows(&mut f, &cond), vec![1, 3]);
    }

    #[test]
    fn test_update_rekeys() {
        let mut f = open_file(false);
        f.insert(&[Value::string_no_pad("x"), Value::Int32(1)], 5)
            .unwrap();
        f.update(
            &[Value::string_no_pad("x"), Value::Int32(1)],
            &[Value::string_no_pad("y"), Value::Int32(1)],
            5,
        )
        .unwrap();
        let cond = compile(
            &f,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::string_no_pad("y"),
            },
        );
        assert_eq!(rows(&mut f, &cond), vec![5]);
    }

    #[test]
    fn test_tombstone_visibility() {
        let mut f = open_file(true);
        f.insert(&[Value::string_no_pad("k"), Value::Int32(1)], 7)
            .unwrap();
        f.mark_expunged(&[Value::string_no_pad("k"), Value::Int32(1)], 7, true)
            .unwrap();
        let mut cond = compile(
            &f,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::string_no_pad("k"),
            },
        );
        // A normal scan skips the tombstone.
        assert!(rows(&mut f, &cond).is_empty());
        // A constraint-lock scan observes it.
        cond.constraint_lock = true;
        assert_eq!(rows(&mut f, &cond), vec![7]);
    }

    #[test]
    fn test_unique_toggle_rejects_duplicate_keys() {
        let mut p = params(false);
        p.set_bool("Unique", true);
        let mut f = BtreeFile::new(MemoryPagedFile::new(1024), &p).unwrap();
        f.create().unwrap();
        f.open(true).unwrap();
        f.insert(&[Value::string_no_pad("a"), Value::Int32(1)], 1)
            .unwrap();
        // Same keys under another rowid now violate uniqueness.
        let err = f
            .insert(&[Value::string_no_pad("a"), Value::Int32(1)], 2)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UniquenessViolation);
        f.insert(&[Value::string_no_pad("a"), Value::Int32(2)], 2)
            .unwrap();
    }

    #[test]
    fn test_unique_violation_on_same_rowid() {
        let mut f = open_file(false);
        f.insert(&[Value::string_no_pad("a"), Value::Int32(1)], 1)
            .unwrap();
        let err = f
            .insert(&[Value::string_no_pad("a"), Value::Int32(1)], 1)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UniquenessViolation);
        // The same keys under another rowid are fine.
        f.insert(&[Value::string_no_pad("a"), Value::Int32(1)], 2)
            .unwrap();
    }

    #[test]
    fn test_projection() {
        let mut f = open_file(false);
        f.insert(&[Value::string_no_pad("p"), Value::Int32(3)], 4)
            .unwrap();
        let cond = compile(
            &f,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::string_no_pad("p"),
            },
        );
        f.search(&cond).unwrap();
        let (keys, rowid) = f.get_projected(&cond).unwrap().unwrap();
        assert_eq!(rowid, 4);
        assert_eq!(keys[1], Value::Int32(3));
    }

    #[test]
    fn test_many_rows_with_verify() {
        let mut f = open_file(false);
        for r in 0..300u32 {
            f.insert(
                &[Value::string_no_pad(format!("k{:03}", r % 50)), Value::Int32(r as i32)],
                r,
            )
            .unwrap();
        }
        f.open(true).unwrap();
        f.verify().unwrap();
        let cond = compile(
            &f,
            &Predicate::Compare {
                op: CompareOp::Equals,
                field: 0,
                value: Value::string_no_pad("k007"),
            },
        );
        assert_eq!(rows(&mut f, &cond).len(), 6);
    }
}
