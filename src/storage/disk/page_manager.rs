use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// File-backed page store.
///
/// Pages are fixed-size blocks addressed by `PageId`. Page 0 is reserved at
/// creation time and never handed out, so that `PageId(0)` can serve as the
/// nil value in page links. Freed pages go on a free list and are reused by
/// `allocate_page` before the file is extended. The free list itself is kept
/// in memory only; making the allocator crash-safe is a concern of the
/// logging layer above, not of this store.
pub struct PageManager {
    file: File,
    free_list: Vec<PageId>,
}

impl PageManager {
    /// Create a new page file, truncating any existing one. The file starts
    /// with the single reserved page.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(PAGE_SIZE as u64)?;

        Ok(Self {
            file,
            free_list: Vec::new(),
        })
    }

    /// Open an existing page file. Previously freed pages are not recovered;
    /// the caller re-derives or accepts the leak.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            free_list: Vec::new(),
        })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let offset = Self::page_offset(page_id);
        if offset >= self.file.metadata()?.len() {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;

        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Hand out a page id, preferring the free list over growing the file.
    /// The page contents are unspecified; callers initialize it themselves.
    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        if let Some(page_id) = self.free_list.pop() {
            return Ok(page_id);
        }

        let page_id = PageId(self.num_pages()?);
        self.file
            .set_len((page_id.0 as u64 + 1) * PAGE_SIZE as u64)?;

        Ok(page_id)
    }

    /// Return a page to the free list for reuse. The caller guarantees no
    /// live reference to the page remains.
    pub fn free_page(&mut self, page_id: PageId) -> StorageResult<()> {
        if page_id.is_nil() || Self::page_offset(page_id) >= self.file.metadata()?.len() {
            return Err(StorageError::PageNotFound(page_id));
        }
        debug_assert!(!self.free_list.contains(&page_id));
        self.free_list.push(page_id);

        Ok(())
    }

    /// Total number of pages in the file, including the reserved page.
    pub fn num_pages(&self) -> StorageResult<u32> {
        Ok((self.file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }

    pub fn num_free_pages(&self) -> usize {
        self.free_list.len()
    }

    /// Pages currently in use, excluding the reserved page and the free list.
    pub fn num_live_pages(&self) -> StorageResult<u32> {
        Ok(self.num_pages()? - self.free_list.len() as u32 - 1)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}
