//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("corrupt slot: {reason}")]
    CorruptSlot { reason: String },

    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    #[error("slot of {size} bytes exceeds page capacity ({capacity} bytes)")]
    SlotTooLarge { size: usize, capacity: usize },

    #[error("page {0} is still pinned")]
    PagePinned(PageId),

    #[error("page {0} does not exist")]
    PageNotFound(PageId),

    #[error("buffer pool is full: no frame available for eviction")]
    BufferPoolFull,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
