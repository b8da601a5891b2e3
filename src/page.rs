//! In-memory view over one tree page.
//!
//! Layout: a three-word header — entry count with the leaf flag in the
//! high bit, previous page id, next page id — followed by the packed
//! entry area. An offset vector tracks the start of every entry plus one
//! past-the-end sentinel, so the difference between first and last gives
//! the used size. Pages only edit themselves; structural changes that
//! involve neighbours or parents are driven from the file layer.

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::codec::{read_u32, write_u32};
use crate::compare::EntryComparator;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{FixMode, PageId, WORD_BYTES};

/// Byte size of the page header.
pub const PAGE_HEADER_BYTES: usize = 12;

const LEAF_BIT: u32 = 0x8000_0000;

bitflags! {
    /// In-memory page state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Buffer differs from the stored page.
        const DIRTY = 0x01;
        /// Freshly allocated this mutation; nothing to recover to.
        const ALLOCATED = 0x02;
    }
}

/// Computes an entry's size, in words, from its leading bytes. Supplied
/// by the tree flavor that owns the page.
pub trait EntrySizer {
    fn entry_words(&self, buf: &[u8]) -> Result<usize>;
}

pub struct Page {
    pid: PageId,
    buf: Vec<u8>,
    /// Byte offsets of each entry start, plus the past-the-end sentinel.
    offsets: Vec<usize>,
    flags: PageFlags,
    fix_mode: FixMode,
    /// Parent hint maintained during descent; stale after structural
    /// changes elsewhere, in which case the driver re-descends.
    parent: Option<PageId>,
}

impl Page {
    /// Wrap a freshly attached buffer and build the offset vector.
    pub fn attach(pid: PageId, buf: Vec<u8>, sizer: &dyn EntrySizer, mode: FixMode) -> Result<Page> {
        let mut page = Page {
            pid,
            buf,
            offsets: Vec::new(),
            flags: PageFlags::empty(),
            fix_mode: mode,
            parent: None,
        };
        page.reload(sizer)?;
        Ok(page)
    }

    /// Initialize a newly allocated page.
    pub fn format(pid: PageId, mut buf: Vec<u8>, prev: PageId, next: PageId) -> Result<Page> {
        if buf.len() < PAGE_HEADER_BYTES {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        buf.fill(0);
        write_u32(&mut buf, 4, prev)?;
        write_u32(&mut buf, 8, next)?;
        Ok(Page {
            pid,
            buf,
            offsets: vec![PAGE_HEADER_BYTES],
            flags: PageFlags::DIRTY | PageFlags::ALLOCATED,
            fix_mode: FixMode::Allocate,
            parent: None,
        })
    }

    /// Rebuild the offset vector from the stored count.
    pub fn reload(&mut self, sizer: &dyn EntrySizer) -> Result<()> {
        let count = self.count();
        self.offsets.clear();
        self.offsets.reserve(count + 2);
        let mut at = PAGE_HEADER_BYTES;
        for _ in 0..count {
            self.offsets.push(at);
            let words = sizer.entry_words(&self.buf[at..])?;
            at += words * WORD_BYTES;
            if at > self.buf.len() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("page {} entry area overflows", self.pid),
                ));
            }
        }
        self.offsets.push(at);
        Ok(())
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Tear the page down, recycling its buffer.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    pub fn count(&self) -> usize {
        (read_u32(&self.buf, 0).unwrap_or(0) & !LEAF_BIT) as usize
    }

    fn set_count(&mut self, count: usize) {
        let word = count as u32 | if self.is_leaf() { LEAF_BIT } else { 0 };
        let _ = write_u32(&mut self.buf, 0, word);
        self.flags.insert(PageFlags::DIRTY);
    }

    pub fn is_leaf(&self) -> bool {
        read_u32(&self.buf, 0).map_or(false, |w| w & LEAF_BIT != 0)
    }

    pub fn set_leaf(&mut self) {
        let word = read_u32(&self.buf, 0).unwrap_or(0) | LEAF_BIT;
        let _ = write_u32(&mut self.buf, 0, word);
        self.flags.insert(PageFlags::DIRTY);
    }

    pub fn prev_id(&self) -> PageId {
        read_u32(&self.buf, 4).unwrap_or(crate::types::NO_PAGE)
    }

    pub fn set_prev_id(&mut self, pid: PageId) {
        let _ = write_u32(&mut self.buf, 4, pid);
        self.flags.insert(PageFlags::DIRTY);
    }

    pub fn next_id(&self) -> PageId {
        read_u32(&self.buf, 8).unwrap_or(crate::types::NO_PAGE)
    }

    pub fn set_next_id(&mut self, pid: PageId) {
        let _ = write_u32(&mut self.buf, 8, pid);
        self.flags.insert(PageFlags::DIRTY);
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    pub fn mark_clean(&mut self) {
        self.flags.remove(PageFlags::DIRTY);
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn fix_mode(&self) -> FixMode {
        self.fix_mode
    }

    pub fn set_fix_mode(&mut self, mode: FixMode) {
        self.fix_mode = mode;
    }

    pub fn parent(&self) -> Option<PageId> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<PageId>) {
        self.parent = parent;
    }

    // ------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------

    /// Entry-area capacity in words.
    pub fn capacity_words(&self) -> usize {
        (self.buf.len() - PAGE_HEADER_BYTES) / WORD_BYTES
    }

    pub fn used_words(&self) -> usize {
        (self.offsets[self.offsets.len() - 1] - PAGE_HEADER_BYTES) / WORD_BYTES
    }

    pub fn free_words(&self) -> usize {
        self.capacity_words() - self.used_words()
    }

    pub fn entry(&self, index: usize) -> &[u8] {
        &self.buf[self.offsets[index]..self.offsets[index + 1]]
    }

    /// Size of entry `index` in words.
    pub fn entry_words_at(&self, index: usize) -> usize {
        (self.offsets[index + 1] - self.offsets[index]) / WORD_BYTES
    }

    /// Words occupied by entries `[0, index)`.
    pub fn words_before(&self, index: usize) -> usize {
        (self.offsets[index] - PAGE_HEADER_BYTES) / WORD_BYTES
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Least index whose entry is `>= key`.
    pub fn lower_bound(&self, key: &[u8], cmp: &EntryComparator) -> Result<usize> {
        let mut lo = 0;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.entry(mid), key)? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Least index whose entry is `> key`.
    pub fn upper_bound(&self, key: &[u8], cmp: &EntryComparator) -> Result<usize> {
        let mut lo = 0;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.entry(mid), key)? != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Routing position toward the leaf holding `key`, infimum form.
    /// A node entry stores the lower key covering its child, so a
    /// non-first hit steps back one.
    pub fn locate_lower(&self, key: &[u8], cmp: &EntryComparator) -> Result<usize> {
        let mut i = self.lower_bound(key, cmp)?;
        if i != 0 && !self.is_leaf() {
            i -= 1;
        }
        Ok(i)
    }

    /// Routing position, supremum form. Unique search routes through
    /// here: an exact match always lives in the previous child.
    pub fn locate_upper(&self, key: &[u8], cmp: &EntryComparator) -> Result<usize> {
        let mut i = self.upper_bound(key, cmp)?;
        if i != 0 && !self.is_leaf() {
            i -= 1;
        }
        Ok(i)
    }

    /// Exact-match position under a unique comparator; `None` on miss.
    pub fn find(&self, key: &[u8], cmp: &EntryComparator) -> Result<Option<usize>> {
        let i = self.lower_bound(key, cmp)?;
        if i == self.count() || cmp.compare(self.entry(i), key)? != Ordering::Equal {
            return Ok(None);
        }
        Ok(Some(i))
    }

    // ------------------------------------------------------------------
    // Local mutation
    // ------------------------------------------------------------------

    /// Insert `bytes` as the entry at `index`, shifting the tail.
    pub fn insert_at(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let size = bytes.len();
        if size % WORD_BYTES != 0 || size / WORD_BYTES > self.free_words() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let at = self.offsets[index];
        let end = self.offsets[self.offsets.len() - 1];
        self.buf.copy_within(at..end, at + size);
        self.buf[at..at + size].copy_from_slice(bytes);
        for off in &mut self.offsets[index..] {
            *off += size;
        }
        self.offsets.insert(index, at);
        let count = self.count() + 1;
        self.set_count(count);
        Ok(())
    }

    /// Remove the entry at `index`, shifting the tail back.
    pub fn remove_at(&mut self, index: usize) {
        let at = self.offsets[index];
        let next = self.offsets[index + 1];
        let end = self.offsets[self.offsets.len() - 1];
        let size = next - at;
        self.buf.copy_within(next..end, at);
        self.offsets.remove(index);
        for off in &mut self.offsets[index..] {
            *off -= size;
        }
        let count = self.count() - 1;
        self.set_count(count);
    }

    /// Copy entries `[from, to)` out of the page.
    pub fn copy_range(&self, from: usize, to: usize) -> Vec<u8> {
        self.buf[self.offsets[from]..self.offsets[to]].to_vec()
    }

    /// Insert a run of pre-packed entries at `index`. `count` is the
    /// number of entries in `bytes`.
    pub fn insert_range(
        &mut self,
        index: usize,
        bytes: &[u8],
        count: usize,
        sizer: &dyn EntrySizer,
    ) -> Result<()> {
        if bytes.len() % WORD_BYTES != 0 || bytes.len() / WORD_BYTES > self.free_words() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let at = self.offsets[index];
        let end = self.offsets[self.offsets.len() - 1];
        self.buf.copy_within(at..end, at + bytes.len());
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        let new_count = self.count() + count;
        self.set_count(new_count);
        self.reload(sizer)
    }

    /// Remove entries `[from, to)`.
    pub fn remove_range(&mut self, from: usize, to: usize, sizer: &dyn EntrySizer) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let at = self.offsets[from];
        let next = self.offsets[to];
        let end = self.offsets[self.offsets.len() - 1];
        self.buf.copy_within(next..end, at);
        let new_count = self.count() - (to - from);
        self.set_count(new_count);
        self.reload(sizer)
    }

    /// Index at which the page's used size first reaches `words`,
    /// scanning entries front to back. Used to pick split and
    /// redistribution boundaries.
    pub fn index_at_words(&self, words: usize) -> usize {
        for i in 0..self.count() {
            if self.words_before(i) >= words {
                return i;
            }
        }
        self.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, FieldType};
    use crate::types::{Value, NO_PAGE};

    struct FixedSizer(usize);

    impl EntrySizer for FixedSizer {
        fn entry_words(&self, _buf: &[u8]) -> Result<usize> {
            Ok(self.0)
        }
    }

    fn int_entry(v: i32) -> Vec<u8> {
        let mut out = Vec::new();
        codec::dump(&mut out, &Value::Int32(v), FieldType::Int32).unwrap();
        out
    }

    fn int_cmp() -> EntryComparator {
        EntryComparator::new(vec![FieldType::Int32], true)
    }

    fn empty_leaf(size: usize) -> Page {
        let mut p = Page::format(1, vec![0u8; size], NO_PAGE, NO_PAGE).unwrap();
        p.set_leaf();
        p
    }

    #[test]
    fn test_format_and_header() {
        let p = empty_leaf(64);
        assert_eq!(p.count(), 0);
        assert!(p.is_leaf());
        assert_eq!(p.prev_id(), NO_PAGE);
        assert_eq!(p.next_id(), NO_PAGE);
        assert_eq!(p.capacity_words(), 13);
        assert_eq!(p.used_words(), 0);
    }

    #[test]
    fn test_insert_keeps_order_and_offsets() {
        let mut p = empty_leaf(128);
        let cmp = int_cmp();
        for v in [30, 10, 20, 40] {
            let e = int_entry(v);
            let i = p.lower_bound(&e, &cmp).unwrap();
            p.insert_at(i, &e).unwrap();
        }
        assert_eq!(p.count(), 4);
        let values: Vec<i32> = (0..4)
            .map(|i| i32::from_le_bytes(p.entry(i).try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![10, 20, 30, 40]);
        assert_eq!(p.used_words(), 4);
    }

    #[test]
    fn test_remove_shifts_tail() {
        let mut p = empty_leaf(128);
        let cmp = int_cmp();
        for v in [1, 2, 3] {
            let e = int_entry(v);
            let i = p.lower_bound(&e, &cmp).unwrap();
            p.insert_at(i, &e).unwrap();
        }
        p.remove_at(1);
        assert_eq!(p.count(), 2);
        let values: Vec<i32> = (0..2)
            .map(|i| i32::from_le_bytes(p.entry(i).try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn test_bounds() {
        let mut p = empty_leaf(128);
        let cmp = int_cmp();
        for v in [10, 20, 20, 30] {
            // Duplicate 20 inserted at lower_bound for the test's sake.
            let e = int_entry(v);
            let i = p.lower_bound(&e, &cmp).unwrap();
            p.insert_at(i, &e).unwrap();
        }
        let key = int_entry(20);
        assert_eq!(p.lower_bound(&key, &cmp).unwrap(), 1);
        assert_eq!(p.upper_bound(&key, &cmp).unwrap(), 3);
        let missing = int_entry(25);
        assert_eq!(p.lower_bound(&missing, &cmp).unwrap(), 3);
        assert_eq!(p.find(&missing, &cmp).unwrap(), None);
        assert_eq!(p.find(&key, &cmp).unwrap(), Some(1));
    }

    #[test]
    fn test_insert_overflow_rejected() {
        let mut p = empty_leaf(PAGE_HEADER_BYTES + 8);
        p.insert_at(0, &int_entry(1)).unwrap();
        p.insert_at(1, &int_entry(2)).unwrap();
        assert!(p.insert_at(2, &int_entry(3)).is_err());
    }

    #[test]
    fn test_range_moves() {
        let sizer = FixedSizer(1);
        let mut a = empty_leaf(128);
        let mut b = empty_leaf(128);
        for v in 0..6 {
            a.insert_at(v as usize, &int_entry(v)).unwrap();
        }
        // Move the last third of `a` into `b`.
        let from = a.index_at_words(4);
        assert_eq!(from, 4);
        let run = a.copy_range(from, 6);
        b.insert_range(0, &run, 6 - from, &sizer).unwrap();
        a.remove_range(from, 6, &sizer).unwrap();
        assert_eq!(a.count(), 4);
        assert_eq!(b.count(), 2);
        assert_eq!(i32::from_le_bytes(b.entry(0).try_into().unwrap()), 4);
    }

    #[test]
    fn test_attach_reload_round_trip() {
        let mut p = empty_leaf(128);
        for v in 0..5 {
            p.insert_at(v as usize, &int_entry(v)).unwrap();
        }
        let buf = p.buffer().to_vec();
        let again = Page::attach(1, buf, &FixedSizer(1), FixMode::ReadOnly).unwrap();
        assert_eq!(again.count(), 5);
        assert!(again.is_leaf());
        assert_eq!(i32::from_le_bytes(again.entry(4).try_into().unwrap()), 4);
    }
}
