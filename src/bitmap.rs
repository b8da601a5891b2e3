//! Bitmap index flavor.
//!
//! The tree orders distinct key values; each leaf entry pairs a key
//! with the head page id of that key's compressed bitmap chain. The
//! chain pages and their codec belong to the bitmap collaborator — this
//! side only maintains the ordered directory, so node entries repeat
//! the key alone.

use crate::condition::{Condition, ConditionSchema};
use crate::entry;
use crate::error::{Error, ErrorCode, Result};
use crate::file::TreeFile;
use crate::fileid::FileParams;
use crate::physical::PagedFile;
use crate::tree::Tree;
use crate::types::{CompareOp, FixMode, PageId, Value};

const SLOT: usize = 0;

pub struct BitmapFile<F: PagedFile> {
    driver: TreeFile<F>,
    tree: Tree,
    schema: ConditionSchema,
}

impl<F: PagedFile> BitmapFile<F> {
    pub fn new(file: F, params: &FileParams) -> Result<Self> {
        let field = params.field_schema(0)?;
        let chars = match field.field_type {
            crate::codec::FieldType::UnicodeString
            | crate::codec::FieldType::NoPadUnicodeString => field.length / 2,
            _ => field.length,
        };
        let schema = ConditionSchema {
            key_types: vec![field.field_type],
            fixed: vec![field.fixed],
            lengths: vec![if field.field_type.is_string() { chars } else { 0 }],
            decimal: vec![params.decimal_parameter(0)],
            use_header: false,
            top_null: true,
            legacy_no_pad: params.keeps_legacy_no_pad(),
        };
        Ok(BitmapFile {
            driver: TreeFile::new(file, 1),
            tree: Tree::bitmap(field.field_type),
            schema,
        })
    }

    pub fn condition_schema(&self) -> &ConditionSchema {
        &self.schema
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

    fn leaf_entry(&self, key: &Value, chain: PageId) -> Result<Vec<u8>> {
        self.tree
            .make_leaf_entry(&[key.clone(), Value::UInt32(chain)])
    }

    /// Register a new key with the head of its bitmap chain.
    pub fn insert(&mut self, key: &Value, chain: PageId) -> Result<()> {
        let entry = self.leaf_entry(key, chain)?;
        self.mutate(|file| {
            file.driver.insert_entry(&mut file.tree, &entry)?;
            file.tree.header.count += 1;
            Ok(())
        })
    }

    /// Drop a key and forget its chain.
    pub fn expunge(&mut self, key: &Value, chain: PageId) -> Result<()> {
        let entry = self.leaf_entry(key, chain)?;
        self.mutate(|file| {
            file.driver.expunge_entry(&mut file.tree, &entry)?;
            file.tree.header.count -= 1;
            Ok(())
        })
    }

    /// Point a key at a new chain head, keeping its tree position.
    pub fn set_chain(&mut self, key: &Value, old_chain: PageId, chain: PageId) -> Result<()> {
        let old = self.leaf_entry(key, old_chain)?;
        let new = self.leaf_entry(key, chain)?;
        self.mutate(|file| {
            file.driver.expunge_entry(&mut file.tree, &old)?;
            file.driver.insert_entry(&mut file.tree, &new)
        })
    }

    /// Chain head for an exact key, if the key is present.
    pub fn chain_of(&mut self, key: &Value) -> Result<Option<PageId>> {
        let probe = {
            let mut out = Vec::new();
            crate::codec::dump(&mut out, key, self.schema.key_types[0])?;
            out
        };
        let cmp = self.tree.comparator().clone();
        let leaf = match self
            .driver
            .leaf_for(&self.tree, &probe, &cmp, CompareOp::Undefined)?
        {
            None => return Ok(None),
            Some(pid) => pid,
        };
        let page = self.driver.page(leaf)?;
        match page.find(&probe, &cmp)? {
            None => Ok(None),
            Some(idx) => {
                let bytes = page.entry(idx);
                entry_chain(bytes, &self.tree).map(Some)
            }
        }
    }

    pub fn search(&mut self, cond: &Condition) -> Result<()> {
        self.driver.search(&self.tree, cond)
    }

    /// Next matching `(chain head)` under `cond`.
    pub fn get(&mut self, cond: &Condition) -> Result<Option<PageId>> {
        match self.driver.get(&self.tree, cond)? {
            None => Ok(None),
            Some(bytes) => entry_chain(&bytes, &self.tree).map(Some),
        }
    }

    pub fn mark(&mut self) -> bool {
        self.driver.mark()
    }

    pub fn rewind(&mut self) -> bool {
        self.driver.rewind()
    }

    /// Estimated tuple hits: matching keys scaled by the average rows
    /// behind each bitmap chain.
    pub fn estimate_count(&mut self, cond: &Condition) -> Result<u32> {
        if !cond.is_valid() {
            return Ok(1);
        }
        let keys = if cond.is_fetch() {
            self.driver.estimate_fetch(&self.tree)?
        } else {
            self.driver.estimate_search(&self.tree, cond)?
        };
        let distinct = self.tree.header.count.max(1) as u64;
        let tuples = self.driver.header_page()?.tuple_count() as u64;
        let per_key = (tuples / distinct).max(1);
        let estimate = (keys as u64).saturating_mul(per_key);
        Ok(estimate.min(u32::MAX as u64).max(1) as u32)
    }

    /// The upper layer owns row counting: one call per indexed row.
    pub fn increment_tuple_count(&mut self) -> Result<()> {
        self.driver.header_page()?.increment_tuple_count()
    }

    pub fn decrement_tuple_count(&mut self) -> Result<()> {
        self.driver.header_page()?.decrement_tuple_count()
    }

    pub fn verify(&mut self) -> Result<()> {
        self.driver.verify_tree(&self.tree)
    }

    pub fn set_cancel_check(&mut self, check: Box<dyn Fn() -> bool>) {
        self.driver.set_cancel_check(check);
    }
}

/// Chain page id: the field after the key in a bitmap leaf entry.
fn entry_chain(bytes: &[u8], tree: &Tree) -> Result<PageId> {
    let offsets = entry::field_offsets(bytes, tree.leaf_layout().types(), false)?;
    let at = offsets[1].ok_or(Error::new(ErrorCode::Corrupt))?;
    crate::codec::read_u32(bytes, at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileid::LogicalType;
    use crate::physical::MemoryPagedFile;

    fn open_file() -> BitmapFile<MemoryPagedFile> {
        let mut p = FileParams::new();
        p.set_indexed_int("FieldType", 0, LogicalType::Int as i64);
        let mut f = BitmapFile::new(MemoryPagedFile::new(512), &p).unwrap();
        f.create().unwrap();
        f.open(true).unwrap();
        f
    }

    #[test]
    fn test_chain_registration() {
        let mut f = open_file();
        f.insert(&Value::Int32(42), 700).unwrap();
        f.insert(&Value::Int32(7), 701).unwrap();
        assert_eq!(f.chain_of(&Value::Int32(42)).unwrap(), Some(700));
        assert_eq!(f.chain_of(&Value::Int32(7)).unwrap(), Some(701));
        assert_eq!(f.chain_of(&Value::Int32(9)).unwrap(), None);
    }

    #[test]
    fn test_set_chain_rewrites_pointer() {
        let mut f = open_file();
        f.insert(&Value::Int32(1), 10).unwrap();
        f.set_chain(&Value::Int32(1), 10, 99).unwrap();
        assert_eq!(f.chain_of(&Value::Int32(1)).unwrap(), Some(99));
    }

    #[test]
    fn test_range_scan_yields_chains_in_key_order() {
        let mut f = open_file();
        for k in 0..50 {
            f.insert(&Value::Int32(k), 1000 + k as PageId).unwrap();
        }
        f.open(true).unwrap();
        let cond = Condition::parse_plan(
            "%4(#ge(10, )#le(12, ))",
            f.condition_schema().clone(),
            false,
        )
        .unwrap();
        f.search(&cond).unwrap();
        let mut chains = Vec::new();
        while let Some(c) = f.get(&cond).unwrap() {
            chains.push(c);
        }
        assert_eq!(chains, vec![1010, 1011, 1012]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut f = open_file();
        f.insert(&Value::Int32(5), 1).unwrap();
        let err = f.insert(&Value::Int32(5), 2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UniquenessViolation);
    }

    #[test]
    fn test_verify_after_growth() {
        let mut f = open_file();
        for k in 0..200 {
            f.insert(&Value::Int32(k), k as PageId + 10_000).unwrap();
        }
        f.open(true).unwrap();
        f.verify().unwrap();
    }
}
