//! Array index flavor.
//!
//! An array-typed column inverts into three sub-trees sharing one file:
//! `Data` keyed by `(element, rowid, array_index)` for non-null
//! elements, `NullData` keyed by `(rowid, array_index)` for null
//! elements, and `NullArray` keyed by `(rowid)` for wholly null arrays.
//! A logical tuple fans out across them; update diffs the old and new
//! arrays element-wise and only re-keys changed indices.

use std::collections::BTreeSet;

use crate::codec::FieldType;
use crate::condition::{Condition, ConditionSchema};
use crate::error::{Error, ErrorCode, Result};
use crate::file::TreeFile;
use crate::fileid::FileParams;
use crate::physical::PagedFile;
use crate::tree::{Tree, TreeKind};
use crate::types::{FixMode, RowId, Value};

const SLOT_DATA: usize = 0;
const SLOT_NULL_DATA: usize = 1;
const SLOT_NULL_ARRAY: usize = 2;

pub struct ArrayFile<F: PagedFile> {
    driver: TreeFile<F>,
    data: Tree,
    null_data: Tree,
    null_array: Tree,
    schema: ConditionSchema,
}

impl<F: PagedFile> ArrayFile<F> {
    pub fn new(file: F, params: &FileParams) -> Result<Self> {
        let element = params.element_schema(0)?;
        let chars = match element.field_type {
            FieldType::UnicodeString | FieldType::NoPadUnicodeString => element.length / 2,
            _ => element.length,
        };
        let schema = ConditionSchema {
            key_types: vec![element.field_type],
            fixed: vec![element.fixed],
            lengths: vec![if element.field_type.is_string() { chars } else { 0 }],
            decimal: vec![params.decimal_parameter(0)],
            use_header: false,
            top_null: true,
            legacy_no_pad: params.keeps_legacy_no_pad(),
        };
        Ok(ArrayFile {
            driver: TreeFile::new(file, 3),
            data: Tree::array_data(element.field_type),
            null_data: Tree::array_null_data(),
            null_array: Tree::array_null_array(),
            schema,
        })
    }

    pub fn condition_schema(&self) -> &ConditionSchema {
        &self.schema
    }

    pub fn create(&mut self) -> Result<()> {
        self.driver.create()
    }

    /// Load the three tree headers off the header page.
    pub fn open(&mut self, writable: bool) -> Result<()> {
        self.driver.set_fix_mode(if writable {
            FixMode::Write
        } else {
            FixMode::ReadOnly
        });
        self.driver.load_tree_header(SLOT_DATA, &mut self.data)?;
        self.driver
            .load_tree_header(SLOT_NULL_DATA, &mut self.null_data)?;
        self.driver
            .load_tree_header(SLOT_NULL_ARRAY, &mut self.null_array)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.driver.flush_all()
    }

    fn save_headers(&mut self) -> Result<()> {
        self.driver.save_tree_header(SLOT_DATA, &self.data)?;
        self.driver
            .save_tree_header(SLOT_NULL_DATA, &self.null_data)?;
        self.driver
            .save_tree_header(SLOT_NULL_ARRAY, &self.null_array)
    }

    /// Run a mutation under the recovery guard: flush on success,
    /// recover every attached page on error.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.driver.set_fix_mode(FixMode::Write);
        match f(self) {
            Ok(result) => {
                self.save_headers()?;
                self.driver.flush_all()?;
                Ok(result)
            }
            Err(e) => {
                let _ = self.driver.recover_all();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Tuple mutation
    // ------------------------------------------------------------------

    fn data_entry(&self, value: &Value, rowid: RowId, index: u32) -> Result<Vec<u8>> {
        self.data
            .make_leaf_entry(&[value.clone(), Value::UInt32(rowid), Value::UInt32(index)])
    }

    fn null_data_entry(&self, rowid: RowId, index: u32) -> Result<Vec<u8>> {
        self.null_data
            .make_leaf_entry(&[Value::UInt32(rowid), Value::UInt32(index)])
    }

    fn null_array_entry(&self, rowid: RowId) -> Result<Vec<u8>> {
        self.null_array.make_leaf_entry(&[Value::UInt32(rowid)])
    }

    fn insert_one(&mut self, kind: TreeKind, entry: &[u8]) -> Result<()> {
        match kind {
            TreeKind::ArrayData => {
                self.driver.insert_entry(&mut self.data, entry)?;
                self.data.header.count += 1;
            }
            TreeKind::ArrayNullData => {
                self.driver.insert_entry(&mut self.null_data, entry)?;
                self.null_data.header.count += 1;
            }
            TreeKind::ArrayNullArray => {
                self.driver.insert_entry(&mut self.null_array, entry)?;
                self.null_array.header.count += 1;
            }
            _ => return Err(Error::new(ErrorCode::BadArgument)),
        }
        Ok(())
    }

    fn expunge_one(&mut self, kind: TreeKind, entry: &[u8]) -> Result<()> {
        match kind {
            TreeKind::ArrayData => {
                self.driver.expunge_entry(&mut self.data, entry)?;
                self.data.header.count -= 1;
            }
            TreeKind::ArrayNullData => {
                self.driver.expunge_entry(&mut self.null_data, entry)?;
                self.null_data.header.count -= 1;
            }
            TreeKind::ArrayNullArray => {
                self.driver.expunge_entry(&mut self.null_array, entry)?;
                self.null_array.header.count -= 1;
            }
            _ => return Err(Error::new(ErrorCode::BadArgument)),
        }
        Ok(())
    }

    fn data_entry_count(array: Option<&[Value]>) -> usize {
        array.map_or(0, |a| a.iter().filter(|v| !v.is_null()).count())
    }

    /// Insert one tuple. `None` stands for a null array.
    pub fn insert(&mut self, rowid: RowId, array: Option<&[Value]>) -> Result<()> {
        self.mutate(|file| {
            file.insert_tuple_entries(rowid, array)?;
            let header = file.driver.header_page()?;
            header.increment_tuple_count()?;
            if Self::data_entry_count(array) == 1 {
                header.add_one_entry_tuple(1)?;
            }
            Ok(())
        })
    }

    fn insert_tuple_entries(&mut self, rowid: RowId, array: Option<&[Value]>) -> Result<()> {
        match array {
            None => {
                let entry = self.null_array_entry(rowid)?;
                self.insert_one(TreeKind::ArrayNullArray, &entry)
            }
            Some(values) => {
                for (index, value) in values.iter().enumerate() {
                    if value.is_null() {
                        let entry = self.null_data_entry(rowid, index as u32)?;
                        self.insert_one(TreeKind::ArrayNullData, &entry)?;
                    } else {
                        let entry = self.data_entry(value, rowid, index as u32)?;
                        self.insert_one(TreeKind::ArrayData, &entry)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Remove one tuple.
    pub fn expunge(&mut self, rowid: RowId, array: Option<&[Value]>) -> Result<()> {
        self.mutate(|file| {
            file.expunge_tuple_entries(rowid, array)?;
            let header = file.driver.header_page()?;
            header.decrement_tuple_count()?;
            if Self::data_entry_count(array) == 1 {
                header.add_one_entry_tuple(-1)?;
            }
            Ok(())
        })
    }

    fn expunge_tuple_entries(&mut self, rowid: RowId, array: Option<&[Value]>) -> Result<()> {
        match array {
            None => {
                let entry = self.null_array_entry(rowid)?;
                self.expunge_one(TreeKind::ArrayNullArray, &entry)
            }
            Some(values) => {
                for (index, value) in values.iter().enumerate() {
                    if value.is_null() {
                        let entry = self.null_data_entry(rowid, index as u32)?;
                        self.expunge_one(TreeKind::ArrayNullData, &entry)?;
                    } else {
                        let entry = self.data_entry(value, rowid, index as u32)?;
                        self.expunge_one(TreeKind::ArrayData, &entry)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Update one tuple, touching only the element positions that
    /// changed. A flip to or from the null array rewrites everything.
    pub fn update(
        &mut self,
        rowid: RowId,
        old: Option<&[Value]>,
        new: Option<&[Value]>,
    ) -> Result<()> {
        match (old, new) {
            (None, None) => Ok(()),
            (None, Some(_)) | (Some(_), None) => {
                self.expunge(rowid, old)?;
                self.insert(rowid, new)
            }
            (Some(old), Some(new)) => self.mutate(|file| {
                file.update_elements(rowid, old, new)?;
                let before = Self::data_entry_count(Some(old));
                let after = Self::data_entry_count(Some(new));
                if before != after {
                    let header = file.driver.header_page()?;
                    if before == 1 {
                        header.add_one_entry_tuple(-1)?;
                    }
                    if after == 1 {
                        header.add_one_entry_tuple(1)?;
                    }
                }
                Ok(())
            }),
        }
    }

    fn update_elements(&mut self, rowid: RowId, old: &[Value], new: &[Value]) -> Result<()> {
        for index in 0..old.len() {
            let i = index as u32;
            if index >= new.len() {
                // The new array is shorter: drop the tail entry.
                if old[index].is_null() {
                    let entry = self.null_data_entry(rowid, i)?;
                    self.expunge_one(TreeKind::ArrayNullData, &entry)?;
                } else {
                    let entry = self.data_entry(&old[index], rowid, i)?;
                    self.expunge_one(TreeKind::ArrayData, &entry)?;
                }
                continue;
            }
            match (old[index].is_null(), new[index].is_null()) {
                (true, true) => {}
                (true, false) => {
                    let entry = self.null_data_entry(rowid, i)?;
                    self.expunge_one(TreeKind::ArrayNullData, &entry)?;
                    let entry = self.data_entry(&new[index], rowid, i)?;
                    self.insert_one(TreeKind::ArrayData, &entry)?;
                }
                (false, true) => {
                    let entry = self.data_entry(&old[index], rowid, i)?;
                    self.expunge_one(TreeKind::ArrayData, &entry)?;
                    let entry = self.null_data_entry(rowid, i)?;
                    self.insert_one(TreeKind::ArrayNullData, &entry)?;
                }
                (false, false) => {
                    if old[index] == new[index] {
                        continue;
                    }
                    let entry = self.data_entry(&old[index], rowid, i)?;
                    self.expunge_one(TreeKind::ArrayData, &entry)?;
                    let entry = self.data_entry(&new[index], rowid, i)?;
                    self.insert_one(TreeKind::ArrayData, &entry)?;
                }
            }
        }
        for index in old.len()..new.len() {
            let i = index as u32;
            if new[index].is_null() {
                let entry = self.null_data_entry(rowid, i)?;
                self.insert_one(TreeKind::ArrayNullData, &entry)?;
            } else {
                let entry = self.data_entry(&new[index], rowid, i)?;
                self.insert_one(TreeKind::ArrayData, &entry)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub fn search(&mut self, cond: &Condition) -> Result<()> {
        match cond.tree_kind() {
            TreeKind::ArrayData => self.driver.search(&self.data, cond),
            TreeKind::ArrayNullData => self.driver.search(&self.null_data, cond),
            TreeKind::ArrayNullArray => self.driver.search(&self.null_array, cond),
            _ => Err(Error::new(ErrorCode::BadArgument)),
        }
    }

    /// Next matching rowid under `cond`.
    pub fn get(&mut self, cond: &Condition) -> Result<Option<RowId>> {
        let kind = cond.tree_kind();
        let entry = {
            let tree = match kind {
                TreeKind::ArrayData => &self.data,
                TreeKind::ArrayNullData => &self.null_data,
                TreeKind::ArrayNullArray => &self.null_array,
                _ => return Err(Error::new(ErrorCode::BadArgument)),
            };
            self.driver.get(tree, cond)?
        };
        match entry {
            None => Ok(None),
            Some(bytes) => self.rowid_of(kind, &bytes).map(Some),
        }
    }

    /// Drain the cursor into a rowid set.
    pub fn get_by_bit_set(&mut self, cond: &Condition, bits: &mut BTreeSet<RowId>) -> Result<()> {
        while let Some(rowid) = self.get(cond)? {
            bits.insert(rowid);
        }
        Ok(())
    }

    /// Extract the rowid from a raw leaf entry of `kind`.
    fn rowid_of(&self, kind: TreeKind, entry: &[u8]) -> Result<RowId> {
        let (tree, position) = match kind {
            TreeKind::ArrayData => (&self.data, 1),
            TreeKind::ArrayNullData => (&self.null_data, 0),
            TreeKind::ArrayNullArray => (&self.null_array, 0),
            _ => return Err(Error::new(ErrorCode::BadArgument)),
        };
        let offsets =
            crate::entry::field_offsets(entry, tree.leaf_layout().types(), false)?;
        let at = offsets[position].ok_or(Error::new(ErrorCode::Corrupt))?;
        crate::codec::read_u32(entry, at)
    }

    pub fn mark(&mut self) -> bool {
        self.driver.mark()
    }

    pub fn rewind(&mut self) -> bool {
        self.driver.rewind()
    }

    // ------------------------------------------------------------------
    // Estimation and verification
    // ------------------------------------------------------------------

    /// Estimated tuple hits for `cond`, corrected by the average entry
    /// fan-out per tuple.
    pub fn estimate_count(&mut self, cond: &Condition) -> Result<u32> {
        if !cond.is_valid() {
            return Ok(1);
        }
        let kind = cond.tree_kind();
        let (tuple_count, one_entry) = {
            let header = self.driver.header_page()?;
            (header.tuple_count(), header.one_entry_tuple_count())
        };
        let (entry_count, average) = {
            let tree = match kind {
                TreeKind::ArrayData => &self.data,
                TreeKind::ArrayNullData => &self.null_data,
                TreeKind::ArrayNullArray => &self.null_array,
                _ => return Err(Error::new(ErrorCode::BadArgument)),
            };
            let entries = if cond.is_fetch() {
                self.driver.estimate_fetch(tree)?
            } else {
                self.driver.estimate_search(tree, cond)?
            };
            (entries, tree.average_entry_count(tuple_count, one_entry))
        };
        // Entries with equal values cluster, so halve the average
        // before dividing it out.
        let average = (average / 2.0) as u32;
        let tuples = if average > 1 {
            entry_count / average
        } else {
            entry_count
        };
        Ok(tuples.max(1))
    }

    /// Verify support: does the `(key, rowid, index)` entry exist?
    pub fn check_entry(&mut self, cond: &Condition, rowid: RowId, index: u32) -> Result<bool> {
        match cond.tree_kind() {
            TreeKind::ArrayData => {
                if !cond.is_valid() {
                    return Ok(false);
                }
                let mut entry = cond.lower().buffer.clone();
                let mut tail = Vec::new();
                crate::codec::dump(&mut tail, &Value::UInt32(rowid), FieldType::UInt32)?;
                crate::codec::dump(&mut tail, &Value::UInt32(index), FieldType::UInt32)?;
                entry.extend_from_slice(&tail);
                self.driver.check_entry(&self.data, &entry)
            }
            TreeKind::ArrayNullData => {
                let entry = self.null_data_entry(rowid, index)?;
                self.driver.check_entry(&self.null_data, &entry)
            }
            TreeKind::ArrayNullArray => {
                let entry = self.null_array_entry(rowid)?;
                self.driver.check_entry(&self.null_array, &entry)
            }
            // An empty array leaves nothing to probe.
            _ => Ok(true),
        }
    }

    pub fn verify(&mut self) -> Result<()> {
        self.driver.verify_tree(&self.data)?;
        self.driver.verify_tree(&self.null_data)?;
        self.driver.verify_tree(&self.null_array)
    }

    pub fn tuple_count(&mut self) -> Result<u32> {
        Ok(self.driver.header_page()?.tuple_count())
    }

    pub fn set_cancel_check(&mut self, check: Box<dyn Fn() -> bool>) {
        self.driver.set_cancel_check(check);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::builder::{ConditionBuilder, IndexFlavor, Predicate};
    use crate::condition::OpenOption;
    use crate::fileid::LogicalType;
    use crate::physical::MemoryPagedFile;
    use crate::types::CompareOp;

    fn int_params() -> FileParams {
        let mut p = FileParams::new();
        p.set_indexed_int("ElementType", 0, LogicalType::Int as i64);
        p.set_indexed_bool("ElementFixed", 0, true);
        p
    }

    fn open_file() -> ArrayFile<MemoryPagedFile> {
        let params = int_params();
        let mut f = ArrayFile::new(MemoryPagedFile::new(1024), &params).unwrap();
        f.create().unwrap();
        f.open(true).unwrap();
        f
    }

    fn equals_cond(f: &ArrayFile<MemoryPagedFile>, v: i32) -> Condition {
        let builder = ConditionBuilder::new(f.condition_schema(), IndexFlavor::Array);
        let mut option = OpenOption::default();
        builder
            .get_search_parameter(
                Some(&Predicate::Compare {
                    op: CompareOp::Equals,
                    field: 0,
                    value: Value::Int32(v),
                }),
                &mut option,
            )
            .unwrap();
        Condition::parse(&option, 0, f.condition_schema().clone()).unwrap()
    }

    fn kind_cond(f: &ArrayFile<MemoryPagedFile>, kind: TreeKind) -> Condition {
        Condition::parse_plan(
            &format!("%{}(#ud#ud)", kind.code()),
            f.condition_schema().clone(),
            false,
        )
        .unwrap()
    }

    fn rows(f: &mut ArrayFile<MemoryPagedFile>, cond: &Condition) -> Vec<RowId> {
        f.search(cond).unwrap();
        let mut out = Vec::new();
        while let Some(r) = f.get(cond).unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_insert_fans_out_across_trees() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Int32(5), Value::Null, Value::Int32(7)]))
            .unwrap();
        f.insert(2, None).unwrap();
        f.open(true).unwrap();
        assert_eq!(f.data.header.count, 2);
        assert_eq!(f.null_data.header.count, 1);
        assert_eq!(f.null_array.header.count, 1);
        assert_eq!(f.tuple_count().unwrap(), 2);
    }

    #[test]
    fn test_element_search() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Int32(5), Value::Int32(9)])).unwrap();
        f.insert(2, Some(&[Value::Int32(9)])).unwrap();
        f.insert(3, Some(&[Value::Int32(4)])).unwrap();
        let cond = equals_cond(&f, 9);
        assert_eq!(rows(&mut f, &cond), vec![1, 2]);
    }

    #[test]
    fn test_null_scans() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Null, Value::Int32(2)])).unwrap();
        f.insert(2, None).unwrap();
        f.insert(3, Some(&[Value::Int32(1)])).unwrap();
        let null_data = kind_cond(&f, TreeKind::ArrayNullData);
        assert_eq!(rows(&mut f, &null_data), vec![1]);
        let null_array = kind_cond(&f, TreeKind::ArrayNullArray);
        assert_eq!(rows(&mut f, &null_array), vec![2]);
    }

    #[test]
    fn test_update_diffs_elements() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Null, Value::Int32(10), Value::Int32(20)]))
            .unwrap();
        // Change only the last element.
        f.update(
            1,
            Some(&[Value::Null, Value::Int32(10), Value::Int32(20)]),
            Some(&[Value::Null, Value::Int32(10), Value::Int32(30)]),
        )
        .unwrap();
        f.open(true).unwrap();
        assert_eq!(f.data.header.count, 2);
        assert_eq!(f.null_data.header.count, 1);
        assert_eq!(f.tuple_count().unwrap(), 1);

        let gone = equals_cond(&f, 20);
        assert!(rows(&mut f, &gone).is_empty());
        let found = equals_cond(&f, 30);
        assert_eq!(rows(&mut f, &found), vec![1]);
    }

    #[test]
    fn test_update_grows_and_shrinks() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Int32(1)])).unwrap();
        f.update(
            1,
            Some(&[Value::Int32(1)]),
            Some(&[Value::Int32(1), Value::Int32(2)]),
        )
        .unwrap();
        f.open(true).unwrap();
        assert_eq!(f.data.header.count, 2);
        f.update(
            1,
            Some(&[Value::Int32(1), Value::Int32(2)]),
            Some(&[Value::Int32(1)]),
        )
        .unwrap();
        f.open(true).unwrap();
        assert_eq!(f.data.header.count, 1);
    }

    #[test]
    fn test_update_to_null_array() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Int32(4)])).unwrap();
        f.update(1, Some(&[Value::Int32(4)]), None).unwrap();
        f.open(true).unwrap();
        assert_eq!(f.data.header.count, 0);
        assert_eq!(f.null_array.header.count, 1);
        assert_eq!(f.tuple_count().unwrap(), 1);
    }

    #[test]
    fn test_expunge_tuple() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Int32(5), Value::Null])).unwrap();
        f.expunge(1, Some(&[Value::Int32(5), Value::Null])).unwrap();
        f.open(true).unwrap();
        assert_eq!(f.data.header.count, 0);
        assert_eq!(f.null_data.header.count, 0);
        assert_eq!(f.tuple_count().unwrap(), 0);
    }

    #[test]
    fn test_check_entry() {
        let mut f = open_file();
        f.insert(7, Some(&[Value::Int32(5), Value::Int32(6)])).unwrap();
        let cond = equals_cond(&f, 6);
        assert!(f.check_entry(&cond, 7, 1).unwrap());
        assert!(!f.check_entry(&cond, 7, 0).unwrap());
    }

    #[test]
    fn test_verify_all_trees() {
        let mut f = open_file();
        for r in 0..50 {
            f.insert(r, Some(&[Value::Int32(r as i32 % 7), Value::Null]))
                .unwrap();
        }
        f.open(true).unwrap();
        f.verify().unwrap();
    }

    #[test]
    fn test_get_by_bit_set() {
        let mut f = open_file();
        f.insert(3, Some(&[Value::Int32(1), Value::Int32(1)])).unwrap();
        f.insert(9, Some(&[Value::Int32(1)])).unwrap();
        let cond = equals_cond(&f, 1);
        f.search(&cond).unwrap();
        let mut bits = BTreeSet::new();
        f.get_by_bit_set(&cond, &mut bits).unwrap();
        assert_eq!(bits.into_iter().collect::<Vec<_>>(), vec![3, 9]);
    }

    #[test]
    fn test_one_entry_tuple_counter() {
        let mut f = open_file();
        f.insert(1, Some(&[Value::Int32(5)])).unwrap();
        f.insert(2, Some(&[Value::Int32(5), Value::Int32(6)])).unwrap();
        assert_eq!(f.driver.header_page().unwrap().one_entry_tuple_count(), 1);
        f.expunge(1, Some(&[Value::Int32(5)])).unwrap();
        assert_eq!(f.driver.header_page().unwrap().one_entry_tuple_count(), 0);
    }
}
