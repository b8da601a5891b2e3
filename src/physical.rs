//! Physical-file collaborator contract.
//!
//! The engine never touches storage directly: it attaches pages through
//! this trait, mutates its own in-memory copies, and hands dirty buffers
//! back on detach. Durability, latching and media recovery live behind
//! the trait. [`MemoryPagedFile`] is the word-addressed in-memory
//! implementation the tests run against.

use crate::error::{Error, ErrorCode, Result};
use crate::types::{FixMode, PageId};

pub trait PagedFile {
    fn page_size(&self) -> usize;

    fn create(&mut self) -> Result<()>;
    fn destroy(&mut self) -> Result<()>;
    fn mount(&mut self) -> Result<()>;
    fn unmount(&mut self) -> Result<()>;

    fn backup_start(&mut self) -> Result<()>;
    fn backup_end(&mut self) -> Result<()>;
    fn recover(&mut self, to_timestamp: i64) -> Result<()>;
    fn restore(&mut self, to_timestamp: i64) -> Result<()>;

    /// Allocate a brand-new physical page.
    fn allocate_page(&mut self) -> Result<PageId>;
    /// Return a page to the file's free list.
    fn free_page(&mut self, pid: PageId) -> Result<()>;
    /// Pop a previously freed page for reuse, if any.
    fn get_free_page(&mut self) -> Result<Option<PageId>>;

    /// Read page `pid` into `buf` (resized to the page size). The fix
    /// mode is the latch intent; an implementation may block here.
    fn attach_page(&mut self, pid: PageId, mode: FixMode, buf: &mut Vec<u8>) -> Result<()>;
    /// Release a page. `dirty` carries the buffer to write back, or
    /// `None` when the page is clean or being discarded.
    fn detach_page(&mut self, pid: PageId, dirty: Option<&[u8]>) -> Result<()>;
    /// Upgrade or downgrade the latch on an attached page.
    fn change_fix_mode(&mut self, pid: PageId, mode: FixMode) -> Result<()>;

    fn sync(&mut self) -> Result<()>;
}

/// In-memory paged file with a free list.
pub struct MemoryPagedFile {
    page_size: usize,
    pages: Vec<Option<Vec<u8>>>,
    free_list: Vec<PageId>,
    mounted: bool,
}

impl MemoryPagedFile {
    pub fn new(page_size: usize) -> Self {
        MemoryPagedFile {
            page_size,
            pages: Vec::new(),
            free_list: Vec::new(),
            mounted: true,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    fn slot(&mut self, pid: PageId) -> Result<&mut Vec<u8>> {
        self.pages
            .get_mut(pid as usize)
            .and_then(|p| p.as_mut())
            .ok_or(Error::with_message(
                ErrorCode::Unexpected,
                format!("page {pid} not allocated"),
            ))
    }
}

impl PagedFile for MemoryPagedFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn create(&mut self) -> Result<()> {
        self.pages.clear();
        self.free_list.clear();
        self.mounted = true;
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.pages.clear();
        self.free_list.clear();
        self.mounted = false;
        Ok(())
    }

    fn mount(&mut self) -> Result<()> {
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        self.mounted = false;
        Ok(())
    }

    fn backup_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn backup_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn recover(&mut self, _to_timestamp: i64) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self, _to_timestamp: i64) -> Result<()> {
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        let pid = self.pages.len() as PageId;
        self.pages.push(Some(vec![0u8; self.page_size]));
        Ok(pid)
    }

    fn free_page(&mut self, pid: PageId) -> Result<()> {
        self.slot(pid)?;
        self.free_list.push(pid);
        Ok(())
    }

    fn get_free_page(&mut self) -> Result<Option<PageId>> {
        Ok(self.free_list.pop())
    }

    fn attach_page(&mut self, pid: PageId, _mode: FixMode, buf: &mut Vec<u8>) -> Result<()> {
        if !self.mounted {
            return Err(Error::new(ErrorCode::Unexpected));
        }
        let page = self.slot(pid)?;
        buf.clear();
        buf.extend_from_slice(page);
        Ok(())
    }

    fn detach_page(&mut self, pid: PageId, dirty: Option<&[u8]>) -> Result<()> {
        if let Some(data) = dirty {
            let size = self.page_size;
            let page = self.slot(pid)?;
            if data.len() != size {
                return Err(Error::new(ErrorCode::BadArgument));
            }
            page.copy_from_slice(data);
        }
        Ok(())
    }

    fn change_fix_mode(&mut self, _pid: PageId, _mode: FixMode) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
