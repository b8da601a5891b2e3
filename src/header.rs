//! The header page.
//!
//! Page 0 of every index file holds the per-flavor tree headers followed
//! by two tuple counters: the number of logical tuples in the file and
//! the number of tuples that contributed exactly one entry to the first
//! flavor tree (the estimator's correction term). It is cached apart
//! from the data-page pool and written back under the dirty-flag
//! discipline.

use crate::codec::{read_u32, write_u32};
use crate::error::{Error, ErrorCode, Result};
use crate::tree::TreeHeader;
use crate::types::WORD_BYTES;

pub struct HeaderPage {
    buf: Vec<u8>,
    slots: usize,
    dirty: bool,
}

impl HeaderPage {
    fn counters_at(slots: usize) -> usize {
        slots * TreeHeader::SIZE_WORDS * WORD_BYTES
    }

    pub fn attach(buf: Vec<u8>, slots: usize) -> Result<HeaderPage> {
        if buf.len() < Self::counters_at(slots) + 2 * WORD_BYTES {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        Ok(HeaderPage {
            buf,
            slots,
            dirty: false,
        })
    }

    /// Reset every tree header and both counters.
    pub fn initialize(&mut self) -> Result<()> {
        for slot in 0..self.slots {
            self.set_tree_header(slot, &TreeHeader::empty())?;
        }
        self.set_tuple_count(0)?;
        self.set_one_entry_tuple_count(0)?;
        Ok(())
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn tree_header(&self, slot: usize) -> Result<TreeHeader> {
        if slot >= self.slots {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        TreeHeader::load(&self.buf[slot * TreeHeader::SIZE_WORDS * WORD_BYTES..])
    }

    pub fn set_tree_header(&mut self, slot: usize, header: &TreeHeader) -> Result<()> {
        if slot >= self.slots {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        header.store(&mut self.buf[slot * TreeHeader::SIZE_WORDS * WORD_BYTES..])?;
        self.dirty = true;
        Ok(())
    }

    pub fn tuple_count(&self) -> u32 {
        read_u32(&self.buf, Self::counters_at(self.slots)).unwrap_or(0)
    }

    fn set_tuple_count(&mut self, count: u32) -> Result<()> {
        write_u32(&mut self.buf, Self::counters_at(self.slots), count)?;
        self.dirty = true;
        Ok(())
    }

    pub fn one_entry_tuple_count(&self) -> u32 {
        read_u32(&self.buf, Self::counters_at(self.slots) + WORD_BYTES).unwrap_or(0)
    }

    fn set_one_entry_tuple_count(&mut self, count: u32) -> Result<()> {
        write_u32(
            &mut self.buf,
            Self::counters_at(self.slots) + WORD_BYTES,
            count,
        )?;
        self.dirty = true;
        Ok(())
    }

    pub fn increment_tuple_count(&mut self) -> Result<()> {
        let c = self.tuple_count();
        self.set_tuple_count(c + 1)
    }

    pub fn decrement_tuple_count(&mut self) -> Result<()> {
        let c = self.tuple_count();
        self.set_tuple_count(c.saturating_sub(1))
    }

    pub fn add_one_entry_tuple(&mut self, delta: i32) -> Result<()> {
        let c = self.one_entry_tuple_count() as i64 + delta as i64;
        self.set_one_entry_tuple_count(c.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NO_PAGE;

    #[test]
    fn test_initialize_and_counters() {
        let mut h = HeaderPage::attach(vec![0u8; 256], 3).unwrap();
        h.initialize().unwrap();
        for slot in 0..3 {
            let t = h.tree_header(slot).unwrap();
            assert_eq!(t.root, NO_PAGE);
            assert_eq!(t.count, 0);
        }
        h.increment_tuple_count().unwrap();
        h.increment_tuple_count().unwrap();
        h.decrement_tuple_count().unwrap();
        assert_eq!(h.tuple_count(), 1);
        h.add_one_entry_tuple(1).unwrap();
        assert_eq!(h.one_entry_tuple_count(), 1);
        h.add_one_entry_tuple(-1).unwrap();
        assert_eq!(h.one_entry_tuple_count(), 0);
        assert!(h.is_dirty());
    }

    #[test]
    fn test_tree_header_slots_are_disjoint() {
        let mut h = HeaderPage::attach(vec![0u8; 256], 2).unwrap();
        h.initialize().unwrap();
        let a = TreeHeader {
            count: 5,
            step: 1,
            root: 10,
            left_leaf: 10,
            right_leaf: 10,
        };
        h.set_tree_header(0, &a).unwrap();
        assert_eq!(h.tree_header(0).unwrap(), a);
        assert_eq!(h.tree_header(1).unwrap(), TreeHeader::empty());
    }

    #[test]
    fn test_too_small_buffer_rejected() {
        assert!(HeaderPage::attach(vec![0u8; 16], 3).is_err());
    }
}
