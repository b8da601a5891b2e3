//! The file driver.
//!
//! Owns every attached page, the spare-page pool, the header page and
//! the per-page lock tokens; drives structural mutation (insert and
//! expunge with parent-entry propagation, split, concatenation,
//! redistribution), the cursor state machine (search / get / mark /
//! rewind), estimation and verification for one tree at a time. The
//! flavor drivers layer tuple semantics on top.

use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::codec::read_u32;
use crate::compare::EntryComparator;
use crate::condition::Condition;
use crate::error::{Error, ErrorCode, Result};
use crate::header::HeaderPage;
use crate::page::Page;
use crate::physical::PagedFile;
use crate::tree::{Tree, TreeHeader, TreeKind};
use crate::types::{CompareOp, FixMode, PageId, NO_PAGE, WORD_BYTES};

/// The header page is always physical page 0.
pub const HEADER_PAGE_ID: PageId = 0;

/// Spare page objects kept per open file.
pub const SPARE_PAGE_LIMIT: usize = 5;

/// Per-page tokens installed under snapshot reads. A token that
/// disappears tells the cursor its page may have been restructured.
pub trait LockManager {
    fn insert(&mut self, pid: PageId);
    fn erase(&mut self, pid: PageId);
    fn contains(&self, pid: PageId) -> bool;
    fn clear(&mut self);
}

#[derive(Default)]
pub struct PageLockSet {
    set: HashSet<PageId>,
}

impl LockManager for PageLockSet {
    fn insert(&mut self, pid: PageId) {
        self.set.insert(pid);
    }

    fn erase(&mut self, pid: PageId) {
        self.set.remove(&pid);
    }

    fn contains(&self, pid: PageId) -> bool {
        self.set.contains(&pid)
    }

    fn clear(&mut self) {
        self.set.clear();
    }
}

fn leaf_bit_of(buf: &[u8]) -> bool {
    read_u32(buf, 0).map_or(false, |w| w & 0x8000_0000 != 0)
}

pub struct TreeFile<F: PagedFile> {
    file: F,
    pages: HashMap<PageId, RefCell<Page>>,
    spare: Vec<Vec<u8>>,
    header: Option<HeaderPage>,
    header_slots: usize,
    locks: Box<dyn LockManager>,
    fix_mode: FixMode,
    cancel: Option<Box<dyn Fn() -> bool>>,
    verify_count: u64,

    // Cursor state.
    search_pid: PageId,
    search_pos: i32,
    search_buf: Vec<u8>,
    mark_pid: PageId,
    mark_pos: i32,
    mark_buf: Vec<u8>,
}

impl<F: PagedFile> TreeFile<F> {
    pub fn new(file: F, header_slots: usize) -> Self {
        TreeFile::with_locks(file, header_slots, Box::new(PageLockSet::default()))
    }

    pub fn with_locks(file: F, header_slots: usize, locks: Box<dyn LockManager>) -> Self {
        TreeFile {
            file,
            pages: HashMap::new(),
            spare: Vec::new(),
            header: None,
            header_slots,
            locks,
            fix_mode: FixMode::ReadOnly,
            cancel: None,
            verify_count: 0,
            search_pid: NO_PAGE,
            search_pos: -1,
            search_buf: Vec::new(),
            mark_pid: NO_PAGE,
            mark_pos: -1,
            mark_buf: Vec::new(),
        }
    }

    pub fn set_fix_mode(&mut self, mode: FixMode) {
        self.fix_mode = mode;
    }

    pub fn set_cancel_check(&mut self, check: Box<dyn Fn() -> bool>) {
        self.cancel = Some(check);
    }

    fn is_cancel(&self) -> bool {
        self.cancel.as_ref().map_or(false, |c| c())
    }

    pub fn physical(&mut self) -> &mut F {
        &mut self.file
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create the file and its header page.
    pub fn create(&mut self) -> Result<()> {
        self.file.create()?;
        let pid = self.file.allocate_page()?;
        if pid != HEADER_PAGE_ID {
            return Err(Error::new(ErrorCode::Unexpected));
        }
        let buf = vec![0u8; self.file.page_size()];
        let mut header = HeaderPage::attach(buf, self.header_slots)?;
        header.initialize()?;
        self.header = Some(header);
        self.flush_all()
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.pages.clear();
        self.header = None;
        self.file.destroy()
    }

    /// The header page, attached on demand and cached outside the pool.
    pub fn header_page(&mut self) -> Result<&mut HeaderPage> {
        if self.header.is_none() {
            let mut buf = self.take_buf();
            self.file
                .attach_page(HEADER_PAGE_ID, self.fix_mode, &mut buf)?;
            self.header = Some(HeaderPage::attach(buf, self.header_slots)?);
        }
        Ok(self.header.as_mut().unwrap())
    }

    pub fn load_tree_header(&mut self, slot: usize, tree: &mut Tree) -> Result<()> {
        tree.header = self.header_page()?.tree_header(slot)?;
        Ok(())
    }

    pub fn save_tree_header(&mut self, slot: usize, tree: &Tree) -> Result<()> {
        let header = tree.header;
        self.header_page()?.set_tree_header(slot, &header)
    }

    /// Write every dirty page back and drop the cache.
    pub fn flush_all(&mut self) -> Result<()> {
        let pids: Vec<PageId> = self.pages.keys().copied().collect();
        for pid in pids {
            let cell = self.pages.remove(&pid).unwrap();
            let page = cell.into_inner();
            let dirty = page.is_dirty();
            let buf = page.into_buffer();
            self.file
                .detach_page(pid, if dirty { Some(&buf) } else { None })?;
            self.give_buf(buf);
        }
        if let Some(header) = self.header.take() {
            if header.is_dirty() {
                self.file
                    .detach_page(HEADER_PAGE_ID, Some(header.buffer()))?;
            } else {
                self.file.detach_page(HEADER_PAGE_ID, None)?;
            }
        }
        Ok(())
    }

    /// Drop every page without writing: the error path of a mutation.
    pub fn recover_all(&mut self) -> Result<()> {
        let pids: Vec<PageId> = self.pages.keys().copied().collect();
        for pid in pids {
            let cell = self.pages.remove(&pid).unwrap();
            let page = cell.into_inner();
            self.file.detach_page(pid, None)?;
            self.give_buf(page.into_buffer());
        }
        self.header = None;
        Ok(())
    }

    fn take_buf(&mut self) -> Vec<u8> {
        self.spare
            .pop()
            .unwrap_or_else(|| vec![0u8; self.file.page_size()])
    }

    fn give_buf(&mut self, buf: Vec<u8>) {
        if self.spare.len() < SPARE_PAGE_LIMIT {
            self.spare.push(buf);
        }
    }

    // ------------------------------------------------------------------
    // Page access
    // ------------------------------------------------------------------

    pub fn page(&self, pid: PageId) -> Result<Ref<'_, Page>> {
        self.pages
            .get(&pid)
            .map(|cell| cell.borrow())
            .ok_or(Error::with_message(
                ErrorCode::Unexpected,
                format!("page {pid} not attached"),
            ))
    }

    fn page_mut(&self, pid: PageId) -> Result<RefMut<'_, Page>> {
        self.pages
            .get(&pid)
            .map(|cell| cell.borrow_mut())
            .ok_or(Error::with_message(
                ErrorCode::Unexpected,
                format!("page {pid} not attached"),
            ))
    }

    /// Attach `pid` (cache hit or physical read) and stamp the parent
    /// hint the caller derived from its descent.
    pub fn attach(
        &mut self,
        tree: &Tree,
        pid: PageId,
        parent: Option<PageId>,
        mode: FixMode,
    ) -> Result<()> {
        if pid == NO_PAGE {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        if !self.pages.contains_key(&pid) {
            let mode = if mode == FixMode::Unknown {
                self.fix_mode
            } else {
                mode
            };
            let mut buf = self.take_buf();
            self.file.attach_page(pid, mode, &mut buf)?;
            let leaf = leaf_bit_of(&buf);
            let page = Page::attach(pid, buf, tree.layout_for(leaf), mode)?;
            self.pages.insert(pid, RefCell::new(page));
        }
        self.page_mut(pid)?.set_parent(parent);
        Ok(())
    }

    /// Allocate a page for `tree`, preferring the file's free list.
    fn allocate(
        &mut self,
        _tree: &Tree,
        prev: PageId,
        next: PageId,
        parent: Option<PageId>,
        leaf: bool,
    ) -> Result<PageId> {
        let pid = match self.file.get_free_page()? {
            Some(pid) => pid,
            None => self.file.allocate_page()?,
        };
        let mut buf = self.take_buf();
        buf.resize(self.file.page_size(), 0);
        let mut page = Page::format(pid, buf, prev, next)?;
        if leaf {
            page.set_leaf();
        }
        page.set_parent(parent);
        self.pages.insert(pid, RefCell::new(page));
        Ok(pid)
    }

    /// Return a page to the free list for later reuse.
    fn free_tree_page(&mut self, pid: PageId) -> Result<()> {
        if let Some(cell) = self.pages.remove(&pid) {
            self.give_buf(cell.into_inner().into_buffer());
        }
        self.file.detach_page(pid, None)?;
        self.file.free_page(pid)
    }

    /// Upgrade a read-fixed page before mutating it. Any cursor token
    /// on the page is invalidated: the cursor re-descends next time.
    fn make_writable(&mut self, pid: PageId) -> Result<()> {
        let mode = self.page(pid)?.fix_mode();
        if mode == FixMode::ReadOnly {
            self.file.change_fix_mode(pid, FixMode::Write)?;
            self.page_mut(pid)?.set_fix_mode(FixMode::Write);
        }
        self.locks.erase(pid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// Walk from the root to the leaf that may hold `key`. Unique
    /// searches and `>` bounds route through the supremum rule.
    pub fn leaf_for(
        &mut self,
        tree: &Tree,
        key: &[u8],
        cmp: &EntryComparator,
        op: CompareOp,
    ) -> Result<Option<PageId>> {
        let root = tree.header.root;
        if root == NO_PAGE {
            return Ok(None);
        }
        let step = tree.header.step;
        let mode = if step != 1 {
            FixMode::ReadOnly
        } else {
            FixMode::Unknown
        };
        self.attach(tree, root, None, mode)?;
        let mut pid = root;
        let mut depth = 1;
        while !self.page(pid)?.is_leaf() {
            let i = {
                let page = self.page(pid)?;
                if page.count() == 0 {
                    return Err(Error::new(ErrorCode::Corrupt));
                }
                if cmp.is_unique() || op == CompareOp::GreaterThan {
                    page.locate_upper(key, cmp)?
                } else {
                    page.locate_lower(key, cmp)?
                }
            };
            let child = {
                let page = self.page(pid)?;
                tree.page_id_of(page.entry(i))?
            };
            let parent = if self.fix_mode == FixMode::ReadOnly {
                // Read descent never rewrites parents.
                None
            } else {
                Some(pid)
            };
            depth += 1;
            let mode = if depth != step {
                FixMode::ReadOnly
            } else {
                FixMode::Unknown
            };
            self.attach(tree, child, parent, mode)?;
            pid = child;
        }
        Ok(Some(pid))
    }

    /// Locate the parent of `child` by re-descending with the child's
    /// first entry as the probe.
    pub fn find_parent(
        &mut self,
        tree: &Tree,
        child_begin: &[u8],
        child: PageId,
    ) -> Result<PageId> {
        if tree.header.root == child || child == NO_PAGE {
            return Err(Error::new(ErrorCode::Unexpected));
        }
        let cmp = tree.comparator().clone();
        let mut pid = tree.header.root;
        let mut above: Option<PageId> = None;
        loop {
            if pid == NO_PAGE {
                return Err(Error::new(ErrorCode::Unexpected));
            }
            self.attach(tree, pid, above, FixMode::Unknown)?;
            let next = {
                let page = self.page(pid)?;
                if page.is_leaf() || page.count() == 0 {
                    return Err(Error::with_message(
                        ErrorCode::Unexpected,
                        format!("parent of page {child} not found"),
                    ));
                }
                let i = page.locate_upper(child_begin, &cmp)?;
                tree.page_id_of(page.entry(i))?
            };
            if next == child {
                return Ok(pid);
            }
            above = Some(pid);
            pid = next;
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert a packed leaf entry, growing the tree as needed. The tree
    /// header's entry count is the caller's to maintain.
    pub fn insert_entry(&mut self, tree: &mut Tree, entry: &[u8]) -> Result<()> {
        let cmp = tree.comparator().clone();
        let leaf = self.leaf_for(tree, entry, &cmp, CompareOp::Undefined)?;
        let leaf = match leaf {
            Some(pid) => pid,
            None => self.create_root(tree)?,
        };
        self.insert_into(tree, leaf, entry)
    }

    /// Expunge the leaf entry equal to `entry` under the unique
    /// comparator.
    pub fn expunge_entry(&mut self, tree: &mut Tree, entry: &[u8]) -> Result<()> {
        let cmp = tree.comparator().clone();
        let leaf = self
            .leaf_for(tree, entry, &cmp, CompareOp::Undefined)?
            .ok_or(Error::new(ErrorCode::BadArgument))?;
        self.expunge_from(tree, leaf, entry, true)
    }

    fn create_root(&mut self, tree: &mut Tree) -> Result<PageId> {
        let pid = self.allocate(tree, NO_PAGE, NO_PAGE, None, true)?;
        tree.header.root = pid;
        tree.header.left_leaf = pid;
        tree.header.right_leaf = pid;
        tree.header.step += 1;
        Ok(pid)
    }

    /// Insert into `pid`, splitting or redistributing first when full.
    fn insert_into(&mut self, tree: &mut Tree, pid: PageId, entry: &[u8]) -> Result<()> {
        let words = entry.len() / WORD_BYTES;
        let target = if self.page(pid)?.free_words() < words {
            self.expand(tree, pid, entry)?
        } else {
            pid
        };
        let cmp = tree.comparator().clone();
        let idx = {
            let page = self.page(target)?;
            let idx = page.lower_bound(entry, &cmp)?;
            if idx < page.count() && cmp.compare(page.entry(idx), entry)? == Ordering::Equal {
                return Err(Error::new(ErrorCode::UniquenessViolation));
            }
            idx
        };
        self.insert_at(tree, target, idx, entry)
    }

    /// Positioned insert with parent-entry propagation: a change of the
    /// first entry rewrites the delegate key in the parent.
    fn insert_at(&mut self, tree: &mut Tree, pid: PageId, idx: usize, entry: &[u8]) -> Result<()> {
        self.make_writable(pid)?;
        let (parent, count) = {
            let page = self.page(pid)?;
            (page.parent(), page.count())
        };
        let node_update = idx == 0 && parent.is_some();
        if node_update && count != 0 {
            let old = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&old, pid)?;
            self.expunge_from(tree, parent.unwrap(), &node_entry, false)?;
        }
        self.page_mut(pid)?.insert_at(idx, entry)?;
        if node_update {
            let first = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&first, pid)?;
            self.insert_into(tree, parent.unwrap(), &node_entry)?;
        }
        Ok(())
    }

    /// Positioned remove with parent-entry propagation.
    fn remove_at(&mut self, tree: &mut Tree, pid: PageId, idx: usize) -> Result<()> {
        self.make_writable(pid)?;
        let (parent, count) = {
            let page = self.page(pid)?;
            (page.parent(), page.count())
        };
        let node_update = idx == 0 && parent.is_some();
        if node_update {
            let old = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&old, pid)?;
            self.expunge_from(tree, parent.unwrap(), &node_entry, count == 1)?;
        }
        self.page_mut(pid)?.remove_at(idx);
        if node_update && self.page(pid)?.count() != 0 {
            let first = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&first, pid)?;
            self.insert_into(tree, parent.unwrap(), &node_entry)?;
        }
        Ok(())
    }

    /// Insert a packed run of `count` entries at `index`.
    fn insert_range_at(
        &mut self,
        tree: &mut Tree,
        pid: PageId,
        index: usize,
        bytes: &[u8],
        count: usize,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.make_writable(pid)?;
        let (parent, old_count, leaf) = {
            let page = self.page(pid)?;
            (page.parent(), page.count(), page.is_leaf())
        };
        let node_update = index == 0 && parent.is_some();
        if node_update && old_count != 0 {
            let old = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&old, pid)?;
            self.expunge_from(tree, parent.unwrap(), &node_entry, false)?;
        }
        {
            let layout = tree.layout_for(leaf);
            let mut page = self.page_mut(pid)?;
            page.insert_range(index, bytes, count, layout)?;
        }
        if node_update {
            let first = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&first, pid)?;
            self.insert_into(tree, parent.unwrap(), &node_entry)?;
        }
        Ok(())
    }

    /// Remove entries `[from, to)`.
    fn remove_range_at(
        &mut self,
        tree: &mut Tree,
        pid: PageId,
        from: usize,
        to: usize,
    ) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        self.make_writable(pid)?;
        let (parent, count, leaf) = {
            let page = self.page(pid)?;
            (page.parent(), page.count(), page.is_leaf())
        };
        let node_update = from == 0 && parent.is_some();
        if node_update {
            let old = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&old, pid)?;
            self.expunge_from(tree, parent.unwrap(), &node_entry, to == count)?;
        }
        {
            let layout = tree.layout_for(leaf);
            let mut page = self.page_mut(pid)?;
            page.remove_range(from, to, layout)?;
        }
        if node_update && self.page(pid)?.count() != 0 {
            let first = self.page(pid)?.entry(0).to_vec();
            let node_entry = tree.make_node_entry(&first, pid)?;
            self.insert_into(tree, parent.unwrap(), &node_entry)?;
        }
        Ok(())
    }

    /// Find and remove `key` from `pid`, then rebalance: an emptied
    /// root resets the tree, a single-child root collapses one step,
    /// and a page under half-full merges or redistributes.
    fn expunge_from(
        &mut self,
        tree: &mut Tree,
        pid: PageId,
        key: &[u8],
        reduce: bool,
    ) -> Result<()> {
        let cmp = tree.comparator().clone();
        let idx = self
            .page(pid)?
            .find(key, &cmp)?
            .ok_or(Error::new(ErrorCode::BadArgument))?;
        self.remove_at(tree, pid, idx)?;

        if tree.header.root == pid {
            let (count, leaf) = {
                let page = self.page(pid)?;
                (page.count(), page.is_leaf())
            };
            if count == 0 {
                // The caller decrements the entry count it owns.
                tree.header = TreeHeader::empty();
                tree.header.count = 1;
                self.free_tree_page(pid)?;
            } else if count == 1 && !leaf && reduce {
                let child = tree.page_id_of(self.page(pid)?.entry(0))?;
                tree.header.root = child;
                tree.header.step -= 1;
                if let Some(cell) = self.pages.get(&child) {
                    cell.borrow_mut().set_parent(None);
                }
                self.free_tree_page(pid)?;
            }
        } else if reduce {
            let sparse = {
                let page = self.page(pid)?;
                page.free_words() > page.capacity_words() / 2
            };
            if sparse {
                self.reduce(tree, pid)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expand / reduce
    // ------------------------------------------------------------------

    /// Make room around a full page. Prefers borrowing from a
    /// neighbour; a root with no neighbours grows a new root first.
    /// Returns the page that should take the new entry.
    fn expand(&mut self, tree: &mut Tree, pid: PageId, entry: &[u8]) -> Result<PageId> {
        let (prev_id, next_id, parent) = {
            let page = self.page(pid)?;
            (page.prev_id(), page.next_id(), page.parent())
        };
        let (prev, this, neighbour_free) = if prev_id != NO_PAGE {
            self.attach(tree, prev_id, None, FixMode::Unknown)?;
            let free = self.page(prev_id)?.free_words();
            (prev_id, pid, free)
        } else if next_id != NO_PAGE {
            // No left sibling, so the right one shares this parent.
            self.attach(tree, next_id, parent, FixMode::Unknown)?;
            let free = self.page(next_id)?.free_words();
            (pid, next_id, free)
        } else {
            self.grow_new_root(tree, pid)?;
            let fresh = self.new_rightmost(tree, pid)?;
            let free = self.page(fresh)?.free_words();
            (pid, fresh, free)
        };
        let capacity = self.page(this)?.capacity_words();
        if neighbour_free < capacity / 10 {
            self.split(tree, prev, this, entry)
        } else {
            self.redistribute(tree, prev, this, Some(entry))?
                .ok_or(Error::new(ErrorCode::Unexpected))
        }
    }

    fn grow_new_root(&mut self, tree: &mut Tree, old_root: PageId) -> Result<()> {
        let new_root = self.allocate(tree, NO_PAGE, NO_PAGE, None, false)?;
        tree.header.root = new_root;
        tree.header.step += 1;
        self.page_mut(old_root)?.set_parent(Some(new_root));
        let first = self.page(old_root)?.entry(0).to_vec();
        let node_entry = tree.make_node_entry(&first, old_root)?;
        self.insert_into(tree, new_root, &node_entry)
    }

    fn new_rightmost(&mut self, tree: &mut Tree, pid: PageId) -> Result<PageId> {
        let (parent, leaf) = {
            let page = self.page(pid)?;
            (page.parent(), page.is_leaf())
        };
        let fresh = self.allocate(tree, pid, NO_PAGE, parent, leaf)?;
        self.make_writable(pid)?;
        self.page_mut(pid)?.set_next_id(fresh);
        if leaf {
            tree.header.right_leaf = fresh;
        }
        Ok(fresh)
    }

    /// Allocate a middle page and move the tail third of `prev` plus
    /// the head third of `this` into it.
    fn split(
        &mut self,
        tree: &mut Tree,
        prev: PageId,
        this: PageId,
        entry: &[u8],
    ) -> Result<PageId> {
        let (parent, leaf) = {
            let page = self.page(this)?;
            (page.parent(), page.is_leaf())
        };
        let fresh = self.allocate(tree, prev, this, parent, leaf)?;
        self.make_writable(prev)?;
        self.make_writable(this)?;
        self.page_mut(prev)?.set_next_id(fresh);
        self.page_mut(this)?.set_prev_id(fresh);

        let capacity = self.page(this)?.capacity_words();

        // Tail of the previous page, past the two-thirds mark.
        let (from, prev_count, run) = {
            let page = self.page(prev)?;
            let from = page.index_at_words(capacity * 2 / 3);
            (from, page.count(), page.copy_range(from, page.count()))
        };
        self.insert_range_at(tree, fresh, 0, &run, prev_count - from)?;
        self.remove_range_at(tree, prev, from, prev_count)?;

        // Head of this page, up to the one-third mark.
        let (to, run) = {
            let page = self.page(this)?;
            let to = page.index_at_words(capacity / 3);
            (to, page.copy_range(0, to))
        };
        let fresh_count = self.page(fresh)?.count();
        self.insert_range_at(tree, fresh, fresh_count, &run, to)?;
        // The ancestors may have split while the new page registered;
        // recover the real parent before touching the first entry.
        let begin = self.page(this)?.entry(0).to_vec();
        let parent = self.find_parent(tree, &begin, this)?;
        self.page_mut(this)?.set_parent(Some(parent));
        self.remove_range_at(tree, this, 0, to)?;

        let cmp = tree.comparator().clone();
        let fresh_first = self.page(fresh)?.entry(0).to_vec();
        if cmp.compare(entry, &fresh_first)? == Ordering::Less {
            return Ok(prev);
        }
        let this_first = self.page(this)?.entry(0).to_vec();
        if cmp.compare(entry, &this_first)? == Ordering::Less {
            Ok(fresh)
        } else {
            Ok(this)
        }
    }

    /// Move everything in `this` into `prev` and free `this`.
    fn concatenate(&mut self, tree: &mut Tree, prev: PageId, this: PageId) -> Result<()> {
        let (next, leaf) = {
            let page = self.page(this)?;
            (page.next_id(), page.is_leaf())
        };
        if next != NO_PAGE {
            self.attach(tree, next, None, FixMode::Unknown)?;
            self.make_writable(next)?;
            self.page_mut(next)?.set_prev_id(prev);
        } else if leaf {
            tree.header.right_leaf = prev;
        }
        self.make_writable(prev)?;
        self.page_mut(prev)?.set_next_id(next);

        let (count, run) = {
            let page = self.page(this)?;
            (page.count(), page.copy_range(0, page.count()))
        };
        let prev_count = self.page(prev)?.count();
        self.insert_range_at(tree, prev, prev_count, &run, count)?;
        self.remove_range_at(tree, this, 0, count)?;
        self.free_tree_page(this)
    }

    /// Balance used words between two neighbours. With `entry` set,
    /// returns the page whose range now covers it.
    fn redistribute(
        &mut self,
        tree: &mut Tree,
        prev: PageId,
        this: PageId,
        entry: Option<&[u8]>,
    ) -> Result<Option<PageId>> {
        self.make_writable(prev)?;
        self.make_writable(this)?;
        let prev_used = self.page(prev)?.used_words();
        let this_used = self.page(this)?.used_words();
        let half = (prev_used + this_used) / 2;

        if prev_used < this_used {
            let surplus = this_used - half;
            let (to, run) = {
                let page = self.page(this)?;
                let to = page.index_at_words(surplus);
                (to, page.copy_range(0, to))
            };
            let prev_count = self.page(prev)?.count();
            self.insert_range_at(tree, prev, prev_count, &run, to)?;
            self.remove_range_at(tree, this, 0, to)?;
        } else {
            let (from, count, run) = {
                let page = self.page(prev)?;
                let from = page.index_at_words(half);
                (from, page.count(), page.copy_range(from, page.count()))
            };
            self.insert_range_at(tree, this, 0, &run, count - from)?;
            self.remove_range_at(tree, prev, from, count)?;
        }

        match entry {
            None => Ok(None),
            Some(e) => {
                let cmp = tree.comparator().clone();
                let this_first = self.page(this)?.entry(0).to_vec();
                Ok(Some(if cmp.compare(e, &this_first)? == Ordering::Less {
                    prev
                } else {
                    this
                }))
            }
        }
    }

    /// Shrink around an under-half-full page: concatenate into a roomy
    /// neighbour, or rebalance with a tight one.
    fn reduce(&mut self, tree: &mut Tree, pid: PageId) -> Result<()> {
        let (prev_id, next_id, parent) = {
            let page = self.page(pid)?;
            (page.prev_id(), page.next_id(), page.parent())
        };
        let (prev, this, neighbour_free) = if prev_id != NO_PAGE {
            self.attach(tree, prev_id, None, FixMode::Unknown)?;
            let free = self.page(prev_id)?.free_words();
            (prev_id, pid, free)
        } else if next_id != NO_PAGE {
            self.attach(tree, next_id, parent, FixMode::Unknown)?;
            let free = self.page(next_id)?.free_words();
            (pid, next_id, free)
        } else {
            return Ok(());
        };
        let capacity = self.page(this)?.capacity_words();
        if neighbour_free > capacity / 2 {
            self.concatenate(tree, prev, this)
        } else {
            self.redistribute(tree, prev, this, None).map(|_| ())
        }
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Pin the candidate page for `cond` and reset the cursor.
    pub fn search(&mut self, tree: &Tree, cond: &Condition) -> Result<()> {
        let mut found = None;
        if cond.is_valid() && tree.header.count > 0 {
            let lower = cond.lower();
            if lower.op == CompareOp::Undefined {
                self.attach(tree, tree.header.left_leaf, None, FixMode::Unknown)?;
                found = Some(tree.header.left_leaf);
            } else {
                let cmp = lower.comparator(cond.schema());
                found = self.leaf_for(tree, &lower.buffer, &cmp, lower.op)?;
            }
        }
        if self.search_pid != NO_PAGE {
            self.locks.erase(self.search_pid);
        }
        self.search_pid = found.unwrap_or(NO_PAGE);
        if let Some(pid) = found {
            self.locks.insert(pid);
        }
        self.search_pos = -1;
        self.search_buf.clear();
        self.mark_pid = NO_PAGE;
        self.mark_pos = -1;
        Ok(())
    }

    /// Advance to the next matching entry; `None` when the scan is
    /// done. The returned bytes are the caller's copy of the entry.
    pub fn get(&mut self, tree: &Tree, cond: &Condition) -> Result<Option<Vec<u8>>> {
        if !cond.is_valid() || tree.header.count == 0 {
            return Ok(None);
        }
        self.advance(tree, cond)?;
        if self.search_pid == NO_PAGE {
            return Ok(None);
        }
        Ok(Some(self.search_buf.clone()))
    }

    fn advance(&mut self, tree: &Tree, cond: &Condition) -> Result<()> {
        if self.search_pid == NO_PAGE {
            return Ok(());
        }
        let pinned = self.pages.contains_key(&self.search_pid)
            && self.locks.contains(self.search_pid);
        if !pinned {
            if self.search_pos == -1 {
                // Nothing returned yet: repeat the candidate search.
                self.search(tree, cond)?;
                if self.search_pid == NO_PAGE {
                    return Ok(());
                }
            } else if !self.reattach_search_page(tree)? {
                return Ok(());
            }
        }

        let mut pos = self.search_pos;
        loop {
            let idx = match self.next_candidate(tree, cond, &mut pos)? {
                Some(idx) => idx,
                None => break,
            };
            let entry = self.page(self.search_pid)?.entry(idx).to_vec();
            if !cond.upper_satisfied(&entry)? {
                // Everything from here on sorts above the bound.
                self.locks.erase(self.search_pid);
                self.search_pid = NO_PAGE;
                break;
            }
            if cond.others_match(&entry)? {
                self.search_buf = entry;
                self.search_pos = idx as i32;
                break;
            }
        }
        Ok(())
    }

    /// Re-pin the page a previous `get` stopped on. A missing lock
    /// token means the tree was restructured meanwhile: re-descend with
    /// the saved entry and re-find the position.
    fn reattach_search_page(&mut self, tree: &Tree) -> Result<bool> {
        if self.locks.contains(self.search_pid) {
            self.attach(tree, self.search_pid, None, FixMode::Unknown)?;
            return Ok(true);
        }
        let cmp = tree.comparator().clone();
        let saved = self.search_buf.clone();
        match self.leaf_for(tree, &saved, &cmp, CompareOp::Undefined)? {
            None => {
                self.search_pid = NO_PAGE;
                Ok(false)
            }
            Some(pid) => {
                self.search_pid = pid;
                self.locks.insert(pid);
                let idx = self
                    .page(pid)?
                    .find(&saved, &cmp)?
                    .ok_or(Error::new(ErrorCode::Unexpected))?;
                self.search_pos = idx as i32;
                Ok(true)
            }
        }
    }

    /// Step the cursor one entry forward, hopping to the next leaf when
    /// the page runs out.
    fn next_candidate(
        &mut self,
        tree: &Tree,
        cond: &Condition,
        pos: &mut i32,
    ) -> Result<Option<usize>> {
        let pid = self.search_pid;
        let idx = if *pos == -1 {
            let lower = cond.lower();
            if lower.op == CompareOp::Undefined {
                0
            } else {
                let cmp = lower.comparator(cond.schema());
                let page = self.page(pid)?;
                if lower.op == CompareOp::GreaterThanEquals {
                    page.lower_bound(&lower.buffer, &cmp)?
                } else {
                    page.upper_bound(&lower.buffer, &cmp)?
                }
            }
        } else {
            *pos as usize + 1
        };
        if idx < self.page(pid)?.count() {
            *pos = idx as i32;
            return Ok(Some(idx));
        }
        // Page exhausted: move the lock token to the next leaf.
        self.locks.erase(pid);
        let next = self.page(pid)?.next_id();
        self.search_pid = next;
        if next == NO_PAGE {
            *pos = -1;
            return Ok(None);
        }
        self.attach(tree, next, None, FixMode::Unknown)?;
        self.locks.insert(next);
        *pos = 0;
        Ok(Some(0))
    }

    /// Snapshot the cursor. Fails before the first hit.
    pub fn mark(&mut self) -> bool {
        if self.search_pos == -1 {
            return false;
        }
        self.mark_pid = self.search_pid;
        self.mark_pos = self.search_pos;
        self.mark_buf = self.search_buf.clone();
        true
    }

    /// Restore the marked position. The lock token is dropped so the
    /// next `get` re-descends if the page moved under the cursor.
    pub fn rewind(&mut self) -> bool {
        if self.mark_pos == -1 {
            return false;
        }
        if self.search_pid != NO_PAGE {
            self.locks.erase(self.search_pid);
        }
        self.search_pid = self.mark_pid;
        self.search_pos = self.mark_pos;
        self.search_buf = self.mark_buf.clone();
        true
    }

    /// Unique-entry probe used by verification.
    pub fn check_entry(&mut self, tree: &Tree, entry: &[u8]) -> Result<bool> {
        let cmp = tree.comparator().clone();
        match self.leaf_for(tree, entry, &cmp, CompareOp::Undefined)? {
            None => Ok(false),
            Some(pid) => Ok(self.page(pid)?.find(entry, &cmp)?.is_some()),
        }
    }

    // ------------------------------------------------------------------
    // Estimation
    // ------------------------------------------------------------------

    /// Estimate how many entries satisfy a compiled range condition.
    pub fn estimate_search(&mut self, tree: &Tree, cond: &Condition) -> Result<u32> {
        match tree.kind() {
            TreeKind::ArrayNullData | TreeKind::ArrayNullArray => {
                return Ok(tree.header.count);
            }
            _ => {}
        }
        if !cond.is_valid() {
            return Ok(0);
        }
        let lower = cond.lower();
        let upper = cond.upper();
        if lower.op == CompareOp::Undefined && upper.op == CompareOp::Undefined {
            return Ok(tree.header.count);
        }
        let mut count = tree.header.count as u64;
        if count == 0 {
            return Ok(0);
        }
        let cmp = if lower.is_undefined() {
            upper.comparator(cond.schema())
        } else {
            lower.comparator(cond.schema())
        };

        let mut pid = tree.header.root;
        self.attach(tree, pid, None, FixMode::ReadOnly)?;
        let (mut n, mut l, mut u) = self.hit_count(pid, cond, &cmp, false)?;
        loop {
            let (leaf, page_count) = {
                let page = self.page(pid)?;
                (page.is_leaf(), page.count() as u64)
            };
            if leaf {
                count = n as u64;
                break;
            } else if l == u {
                // No spread at this level: divide by the fan-out and
                // descend the single covering child.
                count /= page_count.max(1);
                pid = {
                    let page = self.page(pid)?;
                    tree.page_id_of(page.entry(u))?
                };
                self.attach(tree, pid, None, FixMode::ReadOnly)?;
                let r = self.hit_count(pid, cond, &cmp, false)?;
                n = r.0;
                l = r.1;
                u = r.2;
            } else if u - l == 1 {
                // The range straddles two adjacent children: recurse
                // into both and sum.
                count /= page_count.max(1);
                let (p0, p1) = {
                    let page = self.page(pid)?;
                    (
                        tree.page_id_of(page.entry(l))?,
                        tree.page_id_of(page.entry(u))?,
                    )
                };
                self.attach(tree, p0, None, FixMode::ReadOnly)?;
                self.attach(tree, p1, None, FixMode::ReadOnly)?;
                let (n0, l0, u0) = self.hit_count(p0, cond, &cmp, true)?;
                let (n1, l1, u1) = self.hit_count(p1, cond, &cmp, false)?;
                n = n0 + n1;
                if n0 != 0 && n1 == 0 {
                    pid = p0;
                    l = l0;
                    u = u0;
                } else if n0 == 0 {
                    pid = p1;
                    l = l1;
                    u = u1;
                } else {
                    let (leaf0, count0) = {
                        let page = self.page(p0)?;
                        (page.is_leaf(), page.count() as u64)
                    };
                    if leaf0 {
                        count = n as u64;
                    } else {
                        count /= count0.max(1);
                        count = if n == 1 {
                            count / 2
                        } else {
                            count.max(1) * (n as u64 - 1)
                        };
                    }
                    break;
                }
            } else {
                count /= page_count.max(1);
                count = if n == 1 {
                    count / 2
                } else {
                    count.max(1) * (n as u64 - 1)
                };
                break;
            }
        }
        Ok(count.min(u32::MAX as u64) as u32)
    }

    /// Bounded hits inside one page, with the other-condition
    /// correction that compensates PAD-SPACE widening.
    fn hit_count(
        &self,
        pid: PageId,
        cond: &Condition,
        cmp: &EntryComparator,
        is_lower: bool,
    ) -> Result<(usize, usize, usize)> {
        let page = self.page(pid)?;
        let lower = cond.lower();
        let upper = cond.upper();

        let mut l = if lower.op == CompareOp::Undefined {
            0
        } else {
            let mut l = if lower.op == CompareOp::GreaterThan {
                page.upper_bound(&lower.buffer, cmp)?
            } else {
                page.lower_bound(&lower.buffer, cmp)?
            };
            if is_lower && l == page.count() {
                return Ok((0, 0, 0));
            }
            if l != 0 && !page.is_leaf() {
                l -= 1;
            }
            l
        };

        let mut u = if upper.op == CompareOp::Undefined {
            page.count()
        } else if upper.op != CompareOp::LessThan {
            page.upper_bound(&upper.buffer, cmp)?
        } else {
            page.lower_bound(&upper.buffer, cmp)?
        };
        if u != 0 {
            u -= 1;
        }

        if l > u {
            return Ok((0, l, u));
        }
        let mut n = u - l + 1;

        if page.is_leaf() {
            // Exact: evaluate the filters on every candidate.
            n = 0;
            for i in l..=u {
                if cond.others_match(page.entry(i))? {
                    n += 1;
                }
            }
        } else if is_lower {
            while l <= u {
                if cond.others_match(page.entry(l))? {
                    break;
                }
                l += 1;
                n -= 1;
            }
        } else {
            while n > 2 {
                if cond.others_match(page.entry(l))? {
                    break;
                }
                l += 1;
                n -= 1;
            }
        }
        Ok((n, l, u))
    }

    /// Estimate distinct-key fetch cardinality: divide the entry count
    /// by the distinct-prefix count of the first level that shows
    /// duplicates.
    pub fn estimate_fetch(&mut self, tree: &Tree) -> Result<u32> {
        let mut count = tree.header.count as u64;
        if count == 0 {
            return Ok(0);
        }
        let cmp = tree.key_comparator().clone();
        let mut pid = tree.header.root;
        while pid != NO_PAGE {
            self.attach(tree, pid, None, FixMode::ReadOnly)?;
            let (same, distinct, leaf, next) = {
                let page = self.page(pid)?;
                let mut same = false;
                let mut distinct: u64 = 1;
                for i in 1..page.count() {
                    if cmp.compare(page.entry(i - 1), page.entry(i))? == Ordering::Equal {
                        same = true;
                    } else {
                        distinct += 1;
                    }
                }
                let mid = page.count() / 2;
                let next = if page.is_leaf() {
                    NO_PAGE
                } else {
                    tree.page_id_of(page.entry(mid))?
                };
                (same, distinct, page.is_leaf(), next)
            };
            if same || leaf {
                count /= distinct;
                break;
            }
            count /= self.page(pid)?.count().max(1) as u64;
            pid = next;
        }
        Ok(count.max(1).min(u32::MAX as u64) as u32)
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Structural check of one tree: endpoint bookkeeping, in-page
    /// ordering, delegate keys, leaf-chain symmetry and the entry
    /// count.
    pub fn verify_tree(&mut self, tree: &Tree) -> Result<()> {
        self.verify_count = 0;
        if tree.header.root != NO_PAGE {
            self.attach(tree, tree.header.root, None, FixMode::ReadOnly)?;
            {
                let page = self.page(tree.header.root)?;
                if page.prev_id() != NO_PAGE || page.next_id() != NO_PAGE {
                    return Err(Error::with_message(
                        ErrorCode::VerifyAborted,
                        "root page has neighbours",
                    ));
                }
            }
            self.verify_page(tree, tree.header.root)?;
        }

        for (pid, leftmost) in [
            (tree.header.left_leaf, true),
            (tree.header.right_leaf, false),
        ] {
            if pid == NO_PAGE {
                continue;
            }
            self.attach(tree, pid, None, FixMode::ReadOnly)?;
            let page = self.page(pid)?;
            let endpoint = if leftmost {
                page.prev_id()
            } else {
                page.next_id()
            };
            if !page.is_leaf() || endpoint != NO_PAGE {
                return Err(Error::with_message(
                    ErrorCode::VerifyAborted,
                    if leftmost {
                        "leftmost leaf bookkeeping is wrong"
                    } else {
                        "rightmost leaf bookkeeping is wrong"
                    },
                ));
            }
        }

        self.verify_leaf_chain(tree)?;

        if self.verify_count != tree.header.count as u64 {
            return Err(Error::with_message(
                ErrorCode::VerifyAborted,
                format!(
                    "leaf entries {} disagree with header count {}",
                    self.verify_count, tree.header.count
                ),
            ));
        }
        Ok(())
    }

    fn verify_page(&mut self, tree: &Tree, pid: PageId) -> Result<()> {
        let cmp = tree.comparator().clone();
        let (count, leaf) = {
            let page = self.page(pid)?;
            (page.count(), page.is_leaf())
        };
        if leaf {
            self.verify_count += count as u64;
        }
        for i in 0..count {
            if i > 0 {
                let page = self.page(pid)?;
                if cmp.compare(page.entry(i - 1), page.entry(i))? != Ordering::Less {
                    let prefix = hex::encode(&page.entry(i)[..page.entry(i).len().min(16)]);
                    return Err(Error::with_message(
                        ErrorCode::VerifyAborted,
                        format!("page {pid} entry {i} out of order ({prefix})"),
                    ));
                }
            }
            if !leaf {
                let child = {
                    let page = self.page(pid)?;
                    tree.page_id_of(page.entry(i))?
                };
                self.attach(tree, child, Some(pid), FixMode::ReadOnly)?;
                {
                    let page = self.page(pid)?;
                    let child_page = self.page(child)?;
                    if child_page.count() == 0
                        || cmp.compare(page.entry(i), child_page.entry(0))? != Ordering::Equal
                    {
                        let prefix =
                            hex::encode(&page.entry(i)[..page.entry(i).len().min(16)]);
                        return Err(Error::with_message(
                            ErrorCode::VerifyAborted,
                            format!("page {pid} delegate key for child {child} disagrees ({prefix})"),
                        ));
                    }
                }
                self.verify_page(tree, child)?;
                if self.is_cancel() {
                    return Err(Error::new(ErrorCode::Cancel));
                }
            }
        }
        Ok(())
    }

    /// Follow the leaf chain left to right and back, checking symmetry.
    fn verify_leaf_chain(&mut self, tree: &Tree) -> Result<()> {
        let mut pid = tree.header.left_leaf;
        let mut previous = NO_PAGE;
        while pid != NO_PAGE {
            self.attach(tree, pid, None, FixMode::ReadOnly)?;
            let (prev, next) = {
                let page = self.page(pid)?;
                (page.prev_id(), page.next_id())
            };
            if prev != previous {
                return Err(Error::with_message(
                    ErrorCode::VerifyAborted,
                    format!("leaf {pid} back-pointer disagrees with the chain"),
                ));
            }
            if next == NO_PAGE && tree.header.right_leaf != pid {
                return Err(Error::with_message(
                    ErrorCode::VerifyAborted,
                    "leaf chain does not end at the rightmost leaf",
                ));
            }
            previous = pid;
            pid = next;
            if self.is_cancel() {
                return Err(Error::new(ErrorCode::Cancel));
            }
        }
        Ok(())
    }
}
