//! Logical-file façade.
//!
//! The thin layer the upper module talks to: it negotiates the search,
//! projection, update and sort parameters, opens a cursor over the
//! compiled condition list (one plan per OR branch), and forwards the
//! cursor and mutation calls to the flavor driver underneath.

use std::collections::BTreeSet;

use crate::array::ArrayFile;
use crate::bitmap::BitmapFile;
use crate::btree::BtreeFile;
use crate::condition::builder::{ConditionBuilder, IndexFlavor, Predicate};
use crate::condition::{keys, Condition, OpenOption};
use crate::error::{Error, ErrorCode, Result};
use crate::fileid::FileParams;
use crate::physical::PagedFile;
use crate::types::{PageId, RowId, Value};

enum AnyFile<F: PagedFile> {
    Array(ArrayFile<F>),
    Btree(BtreeFile<F>),
    Bitmap(BitmapFile<F>),
}

pub struct LogicalFile<F: PagedFile> {
    file: AnyFile<F>,
    conditions: Vec<Condition>,
    current: usize,
    fetch_fields: usize,
    by_bitset: bool,
    /// Optional rowid filter the caller narrowed the scan with.
    search_filter: Option<BTreeSet<RowId>>,
    verify_rowid: Option<RowId>,
}

impl<F: PagedFile> LogicalFile<F> {
    pub fn array(file: F, params: &FileParams) -> Result<Self> {
        Ok(LogicalFile {
            file: AnyFile::Array(ArrayFile::new(file, params)?),
            conditions: Vec::new(),
            current: 0,
            fetch_fields: 0,
            by_bitset: false,
            search_filter: None,
            verify_rowid: None,
        })
    }

    pub fn btree(file: F, params: &FileParams) -> Result<Self> {
        Ok(LogicalFile {
            file: AnyFile::Btree(BtreeFile::new(file, params)?),
            conditions: Vec::new(),
            current: 0,
            fetch_fields: 0,
            by_bitset: false,
            search_filter: None,
            verify_rowid: None,
        })
    }

    pub fn bitmap(file: F, params: &FileParams) -> Result<Self> {
        Ok(LogicalFile {
            file: AnyFile::Bitmap(BitmapFile::new(file, params)?),
            conditions: Vec::new(),
            current: 0,
            fetch_fields: 0,
            by_bitset: false,
            search_filter: None,
            verify_rowid: None,
        })
    }

    fn flavor(&self) -> IndexFlavor {
        match &self.file {
            AnyFile::Array(_) => IndexFlavor::Array,
            AnyFile::Btree(_) => IndexFlavor::Btree,
            AnyFile::Bitmap(_) => IndexFlavor::Bitmap,
        }
    }

    fn schema(&self) -> &crate::condition::ConditionSchema {
        match &self.file {
            AnyFile::Array(f) => f.condition_schema(),
            AnyFile::Btree(f) => f.condition_schema(),
            AnyFile::Bitmap(f) => f.condition_schema(),
        }
    }

    /// Key columns this flavor exposes; the rowid slot sits after them.
    fn key_count(&self) -> usize {
        match &self.file {
            AnyFile::Array(_) | AnyFile::Bitmap(_) => 1,
            AnyFile::Btree(f) => f.key_count(),
        }
    }

    pub fn create(&mut self) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.create(),
            AnyFile::Btree(f) => f.create(),
            AnyFile::Bitmap(f) => f.create(),
        }
    }

    // ------------------------------------------------------------------
    // Parameter negotiation
    // ------------------------------------------------------------------

    /// Compile the predicate into the open option; false when this
    /// index cannot run it.
    pub fn get_search_parameter(
        &self,
        predicate: Option<&Predicate>,
        option: &mut OpenOption,
    ) -> Result<bool> {
        ConditionBuilder::new(self.schema(), self.flavor())
            .get_search_parameter(predicate, option)
    }

    /// Only the rowid (plus, for the scalar flavor, key columns) can be
    /// projected: the core returns rowids in index order.
    pub fn get_projection_parameter(
        &self,
        fields: &[usize],
        option: &mut OpenOption,
    ) -> Result<bool> {
        if fields.is_empty() {
            return Ok(false);
        }
        let rowid_position = self.key_count();
        let ok = match self.flavor() {
            IndexFlavor::Array | IndexFlavor::Bitmap => {
                fields == [rowid_position]
            }
            IndexFlavor::Btree => fields
                .iter()
                .all(|f| *f <= rowid_position),
        };
        if ok {
            for (n, f) in fields.iter().enumerate() {
                option.set_indexed_int("ProjectionField", n, *f as i64);
            }
        }
        Ok(ok)
    }

    /// Only the indexed column(s) can be re-keyed in place.
    pub fn get_update_parameter(
        &self,
        fields: &[usize],
        option: &mut OpenOption,
    ) -> Result<bool> {
        let ok = !fields.is_empty()
            && fields.iter().all(|f| *f < self.key_count());
        if ok {
            for (n, f) in fields.iter().enumerate() {
                option.set_indexed_int("UpdateField", n, *f as i64);
            }
        }
        Ok(ok)
    }

    /// The core cannot return tuple order; sorting is always refused.
    pub fn get_sort_parameter(&self, _option: &mut OpenOption) -> Result<bool> {
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Open the cursor: parse every compiled plan out of the option.
    pub fn open(&mut self, option: &OpenOption, writable: bool) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.open(writable)?,
            AnyFile::Btree(f) => f.open(writable)?,
            AnyFile::Bitmap(f) => f.open(writable)?,
        }
        let count = option.get_int(keys::CONDITION_COUNT).unwrap_or(0) as usize;
        self.conditions.clear();
        for i in 0..count {
            self.conditions
                .push(Condition::parse(option, i, self.schema().clone())?);
        }
        self.fetch_fields = option.get_int(keys::FETCH_FIELD_NUMBER).unwrap_or(0) as usize;
        self.by_bitset = option.get_bool(keys::GET_BY_BITSET).unwrap_or(false);
        self.search_filter = None;
        self.verify_rowid = option
            .get_str(keys::ROW_ID)
            .and_then(|s| s.parse().ok())
            .filter(|_| option.get_bool(keys::VERIFY).unwrap_or(false));
        self.current = 0;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.close(),
            AnyFile::Btree(f) => f.close(),
            AnyFile::Bitmap(f) => f.close(),
        }
    }

    pub fn is_fetch(&self) -> bool {
        self.fetch_fields > 0
    }

    fn search_current(&mut self) -> Result<()> {
        let cond = &self.conditions[self.current];
        match &mut self.file {
            AnyFile::Array(f) => f.search(cond),
            AnyFile::Btree(f) => f.search(cond),
            AnyFile::Bitmap(f) => f.search(cond),
        }
    }

    pub fn search(&mut self) -> Result<()> {
        if self.conditions.is_empty() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        self.current = 0;
        self.search_current()
    }

    /// Bind a runtime fetch key and restart the scan.
    pub fn fetch(&mut self, key: &[Value]) -> Result<()> {
        if self.fetch_fields == 0 || self.conditions.is_empty() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        if key.len() != self.fetch_fields {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        self.conditions[0].set_fetch_key(key)?;
        self.current = 0;
        self.search_current()
    }

    /// Restrict the scan to rowids in `bits`; `None` lifts the filter.
    pub fn set_search_bit_set(&mut self, bits: Option<BTreeSet<RowId>>) {
        self.search_filter = bits;
    }

    /// Next rowid in index order, walking the OR branches in turn.
    pub fn get(&mut self) -> Result<Option<RowId>> {
        loop {
            let cond = &self.conditions[self.current];
            let hit = match &mut self.file {
                AnyFile::Array(f) => f.get(cond)?,
                AnyFile::Btree(f) => f.get(cond)?,
                AnyFile::Bitmap(f) => f.get(cond)?.map(|pid: PageId| pid as RowId),
            };
            match hit {
                Some(rowid) => {
                    if self
                        .search_filter
                        .as_ref()
                        .map_or(true, |bits| bits.contains(&rowid))
                    {
                        return Ok(Some(rowid));
                    }
                    // Filtered out: keep scanning this branch.
                }
                None => {
                    if self.current + 1 >= self.conditions.len() {
                        return Ok(None);
                    }
                    self.current += 1;
                    self.search_current()?;
                }
            }
        }
    }

    /// Drain every branch into a rowid set.
    pub fn get_by_bit_set(&mut self) -> Result<BTreeSet<RowId>> {
        let mut bits = BTreeSet::new();
        self.search()?;
        while let Some(rowid) = self.get()? {
            bits.insert(rowid);
        }
        Ok(bits)
    }

    pub fn mark(&mut self) -> bool {
        match &mut self.file {
            AnyFile::Array(f) => f.mark(),
            AnyFile::Btree(f) => f.mark(),
            AnyFile::Bitmap(f) => f.mark(),
        }
    }

    pub fn rewind(&mut self) -> bool {
        match &mut self.file {
            AnyFile::Array(f) => f.rewind(),
            AnyFile::Btree(f) => f.rewind(),
            AnyFile::Bitmap(f) => f.rewind(),
        }
    }

    /// Estimated hits across all branches.
    pub fn estimate_count(&mut self) -> Result<u32> {
        let mut total = 0u32;
        for i in 0..self.conditions.len() {
            let cond = self.conditions[i].clone();
            let n = match &mut self.file {
                AnyFile::Array(f) => f.estimate_count(&cond)?,
                AnyFile::Btree(f) => f.estimate_count(&cond)?,
                AnyFile::Bitmap(f) => f.estimate_count(&cond)?,
            };
            total = total.saturating_add(n);
        }
        Ok(total.max(1))
    }

    /// Verify mode: probe every per-element condition for the rowid the
    /// open option named.
    pub fn check(&mut self) -> Result<bool> {
        let rowid = self
            .verify_rowid
            .ok_or(Error::new(ErrorCode::BadArgument))?;
        let file = match &mut self.file {
            AnyFile::Array(f) => f,
            _ => return Err(Error::new(ErrorCode::NotSupported)),
        };
        for (index, cond) in self.conditions.iter().enumerate() {
            if !file.check_entry(cond, rowid, index as u32)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn verify(&mut self) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.verify(),
            AnyFile::Btree(f) => f.verify(),
            AnyFile::Bitmap(f) => f.verify(),
        }
    }

    // ------------------------------------------------------------------
    // Mutation passthrough
    // ------------------------------------------------------------------

    pub fn insert_array(&mut self, rowid: RowId, array: Option<&[Value]>) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.insert(rowid, array),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }

    pub fn update_array(
        &mut self,
        rowid: RowId,
        old: Option<&[Value]>,
        new: Option<&[Value]>,
    ) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.update(rowid, old, new),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }

    pub fn expunge_array(&mut self, rowid: RowId, array: Option<&[Value]>) -> Result<()> {
        match &mut self.file {
            AnyFile::Array(f) => f.expunge(rowid, array),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }

    pub fn insert_row(&mut self, keys: &[Value], rowid: RowId) -> Result<()> {
        match &mut self.file {
            AnyFile::Btree(f) => f.insert(keys, rowid),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }

    pub fn update_row(
        &mut self,
        old_keys: &[Value],
        new_keys: &[Value],
        rowid: RowId,
    ) -> Result<()> {
        match &mut self.file {
            AnyFile::Btree(f) => f.update(old_keys, new_keys, rowid),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }

    pub fn expunge_row(&mut self, keys: &[Value], rowid: RowId) -> Result<()> {
        match &mut self.file {
            AnyFile::Btree(f) => f.expunge(keys, rowid),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }

    pub fn insert_key(&mut self, key: &Value, chain: PageId) -> Result<()> {
        match &mut self.file {
            AnyFile::Bitmap(f) => f.insert(key, chain),
            _ => Err(Error::new(ErrorCode::NotSupported)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileid::LogicalType;
    use crate::physical::MemoryPagedFile;
    use crate::types::CompareOp;

    fn array_file() -> LogicalFile<MemoryPagedFile> {
        let mut p = FileParams::new();
        p.set_indexed_int("ElementType", 0, LogicalType::Int as i64);
        let mut f = LogicalFile::array(MemoryPagedFile::new(1024), &p).unwrap();
        f.create().unwrap();
        f
    }

    fn eq_predicate(v: i32) -> Predicate {
        Predicate::Compare {
            op: CompareOp::Equals,
            field: 0,
            value: Value::Int32(v),
        }
    }

    #[test]
    fn test_search_negotiation_and_scan() {
        let mut f = array_file();
        let mut option = OpenOption::default();
        assert!(f
            .get_search_parameter(Some(&eq_predicate(5)), &mut option)
            .unwrap());
        f.open(&option, true).unwrap();
        f.insert_array(1, Some(&[Value::Int32(5)])).unwrap();
        f.insert_array(2, Some(&[Value::Int32(6)])).unwrap();
        f.search().unwrap();
        assert_eq!(f.get().unwrap(), Some(1));
        assert_eq!(f.get().unwrap(), None);
    }

    #[test]
    fn test_or_branches_iterate() {
        let mut f = array_file();
        let mut option = OpenOption::default();
        let pred = Predicate::Or(vec![eq_predicate(5), eq_predicate(7)]);
        assert!(f.get_search_parameter(Some(&pred), &mut option).unwrap());
        f.open(&option, true).unwrap();
        for (rowid, v) in [(1, 5), (2, 6), (3, 7)] {
            f.insert_array(rowid, Some(&[Value::Int32(v)])).unwrap();
        }
        let rows = f.get_by_bit_set().unwrap();
        assert_eq!(rows.into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_fetch_binding() {
        let mut f = array_file();
        let mut option = OpenOption::default();
        assert!(f
            .get_search_parameter(Some(&Predicate::Fetch { fields: vec![0] }), &mut option)
            .unwrap());
        f.open(&option, true).unwrap();
        for (rowid, v) in [(1, 5), (2, 6), (3, 5)] {
            f.insert_array(rowid, Some(&[Value::Int32(v)])).unwrap();
        }
        assert!(f.is_fetch());
        f.fetch(&[Value::Int32(5)]).unwrap();
        assert_eq!(f.get().unwrap(), Some(1));
        assert_eq!(f.get().unwrap(), Some(3));
        assert_eq!(f.get().unwrap(), None);
        // Rebind.
        f.fetch(&[Value::Int32(6)]).unwrap();
        assert_eq!(f.get().unwrap(), Some(2));
        assert_eq!(f.get().unwrap(), None);
    }

    #[test]
    fn test_projection_negotiation() {
        let f = array_file();
        let mut option = OpenOption::default();
        // Only the rowid column projects.
        assert!(f.get_projection_parameter(&[1], &mut option).unwrap());
        assert!(!f.get_projection_parameter(&[0], &mut option).unwrap());
        assert!(!f.get_projection_parameter(&[0, 1], &mut option).unwrap());
    }

    #[test]
    fn test_sort_parameter_refused() {
        let f = array_file();
        let mut option = OpenOption::default();
        assert!(!f.get_sort_parameter(&mut option).unwrap());
    }

    #[test]
    fn test_update_parameter() {
        let f = array_file();
        let mut option = OpenOption::default();
        assert!(f.get_update_parameter(&[0], &mut option).unwrap());
        assert!(!f.get_update_parameter(&[1], &mut option).unwrap());
    }

    #[test]
    fn test_search_bit_set_filter() {
        let mut f = array_file();
        let mut option = OpenOption::default();
        assert!(f
            .get_search_parameter(Some(&eq_predicate(5)), &mut option)
            .unwrap());
        f.open(&option, true).unwrap();
        for rowid in [1, 2, 3] {
            f.insert_array(rowid, Some(&[Value::Int32(5)])).unwrap();
        }
        f.set_search_bit_set(Some([2, 3].into_iter().collect()));
        f.search().unwrap();
        assert_eq!(f.get().unwrap(), Some(2));
        assert_eq!(f.get().unwrap(), Some(3));
        assert_eq!(f.get().unwrap(), None);
        f.set_search_bit_set(None);
        f.search().unwrap();
        assert_eq!(f.get().unwrap(), Some(1));
    }

    #[test]
    fn test_verify_check() {
        let mut f = array_file();
        f.insert_array(12, Some(&[Value::Int32(3), Value::Null]))
            .unwrap();
        let schema = f.schema().clone();
        let builder = ConditionBuilder::new(&schema, IndexFlavor::Array);
        let mut option = OpenOption::default();
        assert!(builder
            .get_verify_parameter(&[Value::Int32(3), Value::Null], 12, &mut option)
            .unwrap());
        f.open(&option, false).unwrap();
        assert!(f.check().unwrap());

        let mut option = OpenOption::default();
        assert!(builder
            .get_verify_parameter(&[Value::Int32(4), Value::Null], 12, &mut option)
            .unwrap());
        f.open(&option, false).unwrap();
        assert!(!f.check().unwrap());
    }
}
