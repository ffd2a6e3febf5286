pub mod lru;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::storage::{PageManager, PAGE_SIZE};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    page_id: Option<PageId>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            page_id: None,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.fill(0);
    }
}

/// Frame cache over the disk page manager.
///
/// Pages are handed out as pin-counted guards; dropping a guard unpins the
/// frame. A page cannot be evicted or freed while any guard on it is live.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<HashMap<FrameId, Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Mutex<PageManager>,
    next_frame_id: AtomicU32,
    max_frames: usize,
}

impl BufferPoolManager {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                page_manager: Mutex::new(page_manager),
                next_frame_id: AtomicU32::new(0),
                max_frames,
            }),
        }
    }

    /// Pin the page for reading.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let frame_id = self.pin_frame(page_id, false)?;
        let frames = self.inner.frames.read();
        let frame = frames
            .get(&frame_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];

        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Pin the page for writing. The frame is marked dirty up front.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let frame_id = self.pin_frame(page_id, true)?;
        let mut frames = self.inner.frames.write();
        let frame = frames
            .get_mut(&frame_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];

        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Allocate a fresh page and pin it for writing. The frame starts zeroed
    /// but the on-disk contents are unspecified until first flush; callers
    /// initialize the page through the returned guard.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let frame_id = self.take_frame()?;
        let page_id = self.inner.page_manager.lock().allocate_page()?;

        let mut frames = self.inner.frames.write();
        let frame = frames
            .get_mut(&frame_id)
            .ok_or(StorageError::PageNotFound(page_id))?;
        frame.reset();
        frame.page_id = Some(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(true, Ordering::SeqCst);
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        drop(frames);

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                data,
            },
        ))
    }

    /// Free a page. Fails with `PagePinned` if any guard on it is live; the
    /// caller must drop its handles first.
    pub fn free_page(&self, page_id: PageId) -> StorageResult<()> {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let mut frames = self.inner.frames.write();
            if let Some(frame) = frames.get_mut(&frame_id) {
                if frame.pin_count.load(Ordering::SeqCst) > 0 {
                    return Err(StorageError::PagePinned(page_id));
                }
                frame.reset();
            }
            drop(frames);
            self.inner.page_table.remove(&page_id);
            // The cleared frame is immediately reusable.
            self.inner.replacer.lock().unpin(frame_id);
        }

        self.inner.page_manager.lock().free_page(page_id)
    }

    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&frame_id) {
                if frame.is_dirty.load(Ordering::SeqCst) {
                    let mut page_manager = self.inner.page_manager.lock();
                    page_manager.write_page(page_id, frame.data.as_ref())?;
                    frame.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    /// Write back every dirty frame and sync the file once.
    pub fn flush_all(&self) -> StorageResult<()> {
        let frames = self.inner.frames.read();
        let mut page_manager = self.inner.page_manager.lock();

        for frame in frames.values() {
            if let Some(page_id) = frame.page_id {
                if frame.is_dirty.load(Ordering::SeqCst) {
                    page_manager.write_page(page_id, frame.data.as_ref())?;
                    frame.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        page_manager.sync()?;

        Ok(())
    }

    /// Pages currently allocated in the underlying store.
    pub fn num_live_pages(&self) -> StorageResult<u32> {
        self.inner.page_manager.lock().num_live_pages()
    }

    /// Pin the frame holding `page_id`, loading it from disk on a miss.
    fn pin_frame(&self, page_id: PageId, mark_dirty: bool) -> StorageResult<FrameId> {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&frame_id) {
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                if mark_dirty {
                    frame.is_dirty.store(true, Ordering::SeqCst);
                }
                drop(frames);
                self.inner.replacer.lock().pin(frame_id);
                return Ok(frame_id);
            }
        }

        // Miss: claim a frame and load the page from disk.
        let frame_id = self.take_frame()?;
        {
            let mut page_manager = self.inner.page_manager.lock();
            let mut frames = self.inner.frames.write();
            let frame = frames
                .get_mut(&frame_id)
                .ok_or(StorageError::PageNotFound(page_id))?;
            page_manager.read_page(page_id, frame.data.as_mut())?;
            frame.page_id = Some(page_id);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(mark_dirty, Ordering::SeqCst);
        }

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        Ok(frame_id)
    }

    /// Produce an unused frame: grow the pool while under the limit,
    /// otherwise evict an unpinned frame (writing it back if dirty).
    fn take_frame(&self) -> StorageResult<FrameId> {
        {
            let mut frames = self.inner.frames.write();
            if frames.len() < self.inner.max_frames {
                let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                frames.insert(frame_id, Frame::new());
                return Ok(frame_id);
            }
        }

        let victim = self
            .inner
            .replacer
            .lock()
            .evict()
            .ok_or(StorageError::BufferPoolFull)?;

        let (old_page_id, is_dirty) = {
            let frames = self.inner.frames.read();
            match frames.get(&victim) {
                Some(frame) => (frame.page_id, frame.is_dirty.load(Ordering::SeqCst)),
                None => return Ok(victim),
            }
        };

        if let Some(page_id) = old_page_id {
            if is_dirty {
                let frames = self.inner.frames.read();
                if let Some(frame) = frames.get(&victim) {
                    let mut page_manager = self.inner.page_manager.lock();
                    page_manager.write_page(page_id, frame.data.as_ref())?;
                }
            }
            self.inner.page_table.remove(&page_id);
        }

        let mut frames = self.inner.frames.write();
        if let Some(frame) = frames.get_mut(&victim) {
            frame.reset();
        }

        Ok(victim)
    }
}

/// Shared pin on a page. Derefs to the page bytes; dropping it unpins.
pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *const [u8; PAGE_SIZE],
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        unpin_frame(&self.inner, self.frame_id);
    }
}

/// Exclusive pin on a page. The tree takes at most one mutating handle per
/// page at a time.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *mut [u8; PAGE_SIZE],
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        unpin_frame(&self.inner, self.frame_id);
    }
}

fn unpin_frame(inner: &Arc<BufferPoolInner>, frame_id: FrameId) {
    let last_pin = {
        let frames = inner.frames.read();
        match frames.get(&frame_id) {
            Some(frame) => frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1,
            None => false,
        }
    };
    if last_pin {
        inner.replacer.lock().unpin(frame_id);
    }
}

unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}
