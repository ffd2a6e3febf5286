use super::key::{KeyComparator, LeafSlotOrdering};
use super::leaf_next;
use super::slot::LeafSlot;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard};
use crate::storage::page::sorted_page::SortedPage;
use crate::storage::page::SlotId;
use crate::storage::StorageError;
use anyhow::Result;

type LeafPage<C> = SortedPage<PageReadGuard, LeafSlotOrdering<C>>;

/// Forward iterator over the leaf sibling chain.
///
/// The iterator keeps its current leaf pinned, so `cur` can hand out key and
/// value views borrowed straight from the page. Any structural mutation of
/// the tree invalidates the iterator; guarding against that is the caller's
/// responsibility.
pub struct TreeIterator<C: KeyComparator> {
    buffer_pool: BufferPoolManager,
    comparator: C,
    state: IterState<C>,
}

enum IterState<C: KeyComparator> {
    AtLeaf { page: LeafPage<C>, slot_id: SlotId },
    End,
}

impl<C: KeyComparator> TreeIterator<C> {
    /// Build an iterator at `(page, slot_id)`, normalizing positions past
    /// the end of a leaf onto the next one.
    pub(crate) fn positioned(
        buffer_pool: BufferPoolManager,
        comparator: C,
        page: LeafPage<C>,
        slot_id: SlotId,
    ) -> Result<Self> {
        let mut iter = Self {
            buffer_pool,
            comparator,
            state: IterState::AtLeaf { page, slot_id },
        };
        iter.skip_exhausted()?;
        Ok(iter)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.state, IterState::End)
    }

    /// The key-value pair at the current position, borrowed from the pinned
    /// leaf page. None at the end.
    pub fn cur(&self) -> Result<Option<(&[u8], &[u8])>> {
        match &self.state {
            IterState::AtLeaf { page, slot_id } => {
                let raw = page.slot(*slot_id).ok_or_else(|| {
                    anyhow::Error::from(StorageError::CorruptPage {
                        page_id: page.page_id(),
                        reason: "iterator slot out of range".to_string(),
                    })
                })?;
                let parsed = LeafSlot::parse(raw)?;
                Ok(Some((parsed.key, parsed.value)))
            }
            IterState::End => Ok(None),
        }
    }

    /// Advance one slot, following the sibling link past the end of each
    /// leaf. Advancing an iterator at the end is a no-op.
    pub fn next(&mut self) -> Result<()> {
        if let IterState::AtLeaf { slot_id, .. } = &mut self.state {
            *slot_id += 1;
        }
        self.skip_exhausted()
    }

    fn skip_exhausted(&mut self) -> Result<()> {
        loop {
            let next = match &self.state {
                IterState::End => return Ok(()),
                IterState::AtLeaf { page, slot_id } => {
                    if *slot_id < page.slot_count() {
                        return Ok(());
                    }
                    leaf_next(page)
                }
            };

            // Unpin the exhausted leaf before following the link.
            self.state = IterState::End;
            if next.is_nil() {
                return Ok(());
            }
            let guard = self.buffer_pool.fetch_page(next)?;
            let ord = LeafSlotOrdering::new(self.comparator.clone());
            self.state = IterState::AtLeaf {
                page: SortedPage::new(next, guard, ord),
                slot_id: 0,
            };
        }
    }
}
