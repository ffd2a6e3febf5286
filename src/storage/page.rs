pub mod meta_page;
pub mod sorted_page;

use serde::{Deserialize, Serialize};

/// Identifier of an on-disk page.
///
/// `PageId(0)` is reserved as the nil value for page links (end of the leaf
/// sibling chain); the disk manager never hands it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// The reserved nil page id.
pub const NIL_PAGE_ID: PageId = PageId(0);

impl PageId {
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

/// In-page slot index.
pub type SlotId = u16;

/// Byte offset within a page. Every in-page length field is stored at this
/// width.
pub type PageOffset = u16;

pub use meta_page::MetaPage;
pub use sorted_page::{SlotOrdering, SortedPage};
