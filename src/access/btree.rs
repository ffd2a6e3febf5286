//! On-disk B+tree index.
//!
//! Level 1 is the leaf level; a freshly created tree is a single empty leaf.
//! Inner pages hold `(child, strict_upper_bound)` slots plus a special
//! trailer with the rightmost child; leaves hold key-value slots plus a
//! special trailer with the sibling links. The meta page carries the root
//! page id, the level count and the tuple count, and is the only state the
//! tree handle relies on between operations.

pub mod iterator;
pub mod key;
pub mod slot;

use self::key::{InnerSlotOrdering, LeafSlotOrdering};
use self::slot::{InnerSlot, LeafSlot, INNER_SLOT_CHILD_SIZE};
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use crate::storage::page::sorted_page::{SortedPage, SLOT_ENTRY_SIZE, SORTED_PAGE_HEADER_SIZE};
use crate::storage::page::{MetaPage, PageId, SlotId};
use crate::storage::{StorageError, PAGE_SIZE};
use anyhow::{bail, Result};
use std::ops::{Deref, DerefMut};
use tracing::debug;

pub use iterator::TreeIterator;
pub use key::{BytewiseComparator, KeyComparator};

// Special trailer layouts.
const INNER_SPECIAL_LEN: usize = 4;
const INNER_RIGHTMOST_OFFSET: usize = 0;
const LEAF_SPECIAL_LEN: usize = 8;
const LEAF_PREV_OFFSET: usize = 0;
const LEAF_NEXT_OFFSET: usize = 4;

/// Largest encoded leaf slot a single page can hold. Oversized slots are
/// rejected up front; a split cannot help them.
const MAX_LEAF_SLOT_SIZE: usize =
    PAGE_SIZE - SORTED_PAGE_HEADER_SIZE - LEAF_SPECIAL_LEN - SLOT_ENTRY_SIZE;

type InnerPage<B, C> = SortedPage<B, InnerSlotOrdering<C>>;
type LeafPage<B, C> = SortedPage<B, LeafSlotOrdering<C>>;

/// An ancestor recorded while descending from the root.
struct PathEntry {
    page_id: PageId,
    level: u8,
}

/// B+tree handle: a buffer pool reference, the meta page id and the injected
/// key comparator. Root id and level are always read from the meta page.
pub struct BPlusTree<C: KeyComparator = BytewiseComparator> {
    buffer_pool: BufferPoolManager,
    meta_page_id: PageId,
    comparator: C,
}

impl BPlusTree<BytewiseComparator> {
    /// Allocate a meta page and initialize an empty tree ordered bytewise.
    pub fn create(buffer_pool: BufferPoolManager) -> Result<Self> {
        Self::create_with_comparator(buffer_pool, BytewiseComparator)
    }

    /// Open an existing tree by its meta page id.
    pub fn open(buffer_pool: BufferPoolManager, meta_page_id: PageId) -> Self {
        Self::open_with_comparator(buffer_pool, meta_page_id, BytewiseComparator)
    }
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Allocate a meta page and initialize an empty tree: a single empty
    /// leaf as the root, level 1, zero tuples.
    pub fn create_with_comparator(buffer_pool: BufferPoolManager, comparator: C) -> Result<Self> {
        let (meta_page_id, meta_guard) = buffer_pool.new_page()?;
        let mut meta = MetaPage::new(meta_guard);
        meta.init();
        drop(meta);

        let tree = Self {
            buffer_pool,
            meta_page_id,
            comparator,
        };
        let root = tree.alloc_leaf_page()?;
        let root_id = root.page_id();
        drop(root);

        let mut meta = tree.meta_mut()?;
        meta.set_level_num(1);
        meta.set_root_page_id(root_id);
        meta.set_tuple_num(0);
        drop(meta);

        debug!(meta = meta_page_id.0, root = root_id.0, "btree.create");
        Ok(tree)
    }

    pub fn open_with_comparator(
        buffer_pool: BufferPoolManager,
        meta_page_id: PageId,
        comparator: C,
    ) -> Self {
        Self {
            buffer_pool,
            meta_page_id,
            comparator,
        }
    }

    /// The meta page id; save it to reopen the tree later.
    pub fn meta_page_id(&self) -> PageId {
        self.meta_page_id
    }

    pub fn tuple_num(&self) -> Result<u64> {
        Ok(self.meta()?.tuple_num())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tuple_num()? == 0)
    }

    /// Number of levels; 1 when the root is a leaf.
    pub fn level_num(&self) -> Result<u8> {
        Ok(self.meta()?.level_num())
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (leaf_id, _) = self.descend(key)?;
        let leaf = self.leaf_page(leaf_id)?;
        match leaf.find_slot(key) {
            Some(raw) => Ok(Some(LeafSlot::parse(raw)?.value.to_vec())),
            None => Ok(None),
        }
    }

    /// Insert `(key, value)` if `key` is absent. Returns whether anything
    /// was inserted.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let slot_bytes = LeafSlot { key, value }.encode();
        check_leaf_slot_size(&slot_bytes)?;

        let (leaf_id, mut path) = self.descend(key)?;
        let leaf = self.leaf_page_mut(leaf_id)?;
        if leaf.find(key).is_some() {
            return Ok(false);
        }
        let pos = leaf.lower_bound(key);
        self.insert_into_leaf(leaf, pos, &slot_bytes, key, &mut path)?;
        self.add_tuple_num(1)?;
        Ok(true)
    }

    /// Replace the value under an existing `key`. Returns false without any
    /// mutation when the key is absent. The tuple count is unchanged.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let slot_bytes = LeafSlot { key, value }.encode();
        check_leaf_slot_size(&slot_bytes)?;

        let (leaf_id, mut path) = self.descend(key)?;
        let mut leaf = self.leaf_page_mut(leaf_id)?;
        let Some(pos) = leaf.find(key) else {
            return Ok(false);
        };
        leaf.delete_slot(pos);
        self.insert_into_leaf(leaf, pos, &slot_bytes, key, &mut path)?;
        Ok(true)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let (leaf_id, mut path) = self.descend(key)?;
        let mut leaf = self.leaf_page_mut(leaf_id)?;
        let Some(pos) = leaf.find(key) else {
            return Ok(false);
        };
        leaf.delete_slot(pos);

        if leaf.is_empty() && !path.is_empty() {
            // Splice the empty leaf out of the sibling chain and free it,
            // then remove its route from the ancestors.
            let prev = leaf_prev(&leaf);
            let next = leaf_next(&leaf);
            drop(leaf);
            if !prev.is_nil() {
                let mut prev_leaf = self.leaf_page_mut(prev)?;
                set_special_page_id(&mut prev_leaf, LEAF_NEXT_OFFSET, next);
            }
            if !next.is_nil() {
                let mut next_leaf = self.leaf_page_mut(next)?;
                set_special_page_id(&mut next_leaf, LEAF_PREV_OFFSET, prev);
            }
            self.buffer_pool.free_page(leaf_id)?;
            debug!(page = leaf_id.0, "btree.leaf_collapse");
            self.collapse_route(key, &mut path)?;
        } else {
            drop(leaf);
        }

        self.add_tuple_num(-1)?;
        self.shrink_root()?;
        Ok(true)
    }

    /// Remove `key` and return the value it held.
    pub fn take(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.get(key)?;
        if value.is_some() {
            self.delete(key)?;
        }
        Ok(value)
    }

    /// The largest key in the tree.
    pub fn max_key(&self) -> Result<Option<Vec<u8>>> {
        if self.is_empty()? {
            return Ok(None);
        }

        let meta = self.meta()?;
        let mut level = meta.level_num();
        let mut cur = meta.root_page_id();
        drop(meta);
        while level > 1 {
            let inner = self.inner_page(cur)?;
            cur = special_page_id(&inner, INNER_RIGHTMOST_OFFSET);
            level -= 1;
        }

        let leaf = self.leaf_page(cur)?;
        let count = leaf.slot_count();
        if count == 0 {
            return Err(corrupt(cur, "rightmost leaf of a non-empty tree is empty"));
        }
        let raw = leaf
            .slot(count - 1)
            .ok_or_else(|| corrupt(cur, "slot directory out of range"))?;
        Ok(Some(LeafSlot::parse(raw)?.key.to_vec()))
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<TreeIterator<C>> {
        let meta = self.meta()?;
        let mut level = meta.level_num();
        let mut cur = meta.root_page_id();
        drop(meta);
        while level > 1 {
            let inner = self.inner_page(cur)?;
            cur = if inner.is_empty() {
                special_page_id(&inner, INNER_RIGHTMOST_OFFSET)
            } else {
                inner_child(&inner, 0)?
            };
            level -= 1;
        }
        let leaf = self.leaf_page(cur)?;
        TreeIterator::positioned(self.buffer_pool.clone(), self.comparator.clone(), leaf, 0)
    }

    /// Iterator positioned at the smallest key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<TreeIterator<C>> {
        let (leaf_id, _) = self.descend(key)?;
        let leaf = self.leaf_page(leaf_id)?;
        let pos = leaf.lower_bound(key);
        TreeIterator::positioned(self.buffer_pool.clone(), self.comparator.clone(), leaf, pos)
    }

    /// Iterator positioned at the smallest key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<TreeIterator<C>> {
        let (leaf_id, _) = self.descend(key)?;
        let leaf = self.leaf_page(leaf_id)?;
        let pos = leaf.upper_bound(key);
        TreeIterator::positioned(self.buffer_pool.clone(), self.comparator.clone(), leaf, pos)
    }

    /// Free every page of the tree, the meta page included.
    pub fn destroy(self) -> Result<()> {
        let meta = self.meta()?;
        let level = meta.level_num();
        let root = meta.root_page_id();
        drop(meta);

        self.free_subtree(root, level)?;
        self.buffer_pool.free_page(self.meta_page_id)?;
        debug!(meta = self.meta_page_id.0, "btree.destroy");
        Ok(())
    }

    /// Render the tree structure for debugging.
    pub fn dump(&self) -> Result<String> {
        use std::fmt::Write as _;

        let meta = self.meta()?;
        let level = meta.level_num();
        let root = meta.root_page_id();
        let tuple_num = meta.tuple_num();
        drop(meta);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "meta {}: level_num={} root={} tuple_num={}",
            self.meta_page_id.0, level, root.0, tuple_num
        );
        self.dump_subtree(&mut out, root, level, 1)?;
        Ok(out)
    }

    // Descent.

    /// Walk from the root to the leaf responsible for `key`, recording the
    /// visited inner pages. The stack depth is bounded by the level count.
    fn descend(&self, key: &[u8]) -> Result<(PageId, Vec<PathEntry>)> {
        let meta = self.meta()?;
        let mut level = meta.level_num();
        let mut cur = meta.root_page_id();
        drop(meta);

        let mut path = Vec::with_capacity(level as usize);
        while level > 1 {
            let inner = self.inner_page(cur)?;
            let child = self.route_child(&inner, key)?;
            path.push(PathEntry {
                page_id: cur,
                level,
            });
            cur = child;
            level -= 1;
        }
        Ok((cur, path))
    }

    /// The child an inner page routes `key` to: the slot found by
    /// `upper_bound`, or the rightmost child past the last slot.
    fn route_child<B>(&self, inner: &InnerPage<B, C>, key: &[u8]) -> Result<PageId>
    where
        B: Deref<Target = [u8; PAGE_SIZE]>,
    {
        let i = inner.upper_bound(key);
        if i == inner.slot_count() {
            Ok(special_page_id(inner, INNER_RIGHTMOST_OFFSET))
        } else {
            inner_child(inner, i)
        }
    }

    // Insertion.

    /// Place an encoded slot at `pos` of the leaf, splitting and propagating
    /// when it does not fit.
    fn insert_into_leaf(
        &self,
        mut leaf: LeafPage<PageWriteGuard, C>,
        pos: SlotId,
        slot_bytes: &[u8],
        key: &[u8],
        path: &mut Vec<PathEntry>,
    ) -> Result<()> {
        if leaf.insert_before_slot(pos, slot_bytes) {
            return Ok(());
        }

        // The leaf is full: keep the lower half here, hand the upper half to
        // a new right sibling and link it into the chain.
        let mut right = self.alloc_leaf_page()?;
        leaf.split_insert(&mut right, slot_bytes, pos)?;

        let old_next = leaf_next(&leaf);
        set_special_page_id(&mut right, LEAF_PREV_OFFSET, leaf.page_id());
        set_special_page_id(&mut right, LEAF_NEXT_OFFSET, old_next);
        set_special_page_id(&mut leaf, LEAF_NEXT_OFFSET, right.page_id());

        let first = right
            .slot(0)
            .ok_or_else(|| corrupt(right.page_id(), "right half of a split is empty"))?;
        let sep_key = LeafSlot::parse(first)?.key.to_vec();

        let left_id = leaf.page_id();
        let right_id = right.page_id();
        drop(leaf);
        drop(right);
        debug!(left = left_id.0, right = right_id.0, "btree.leaf_split");

        if !old_next.is_nil() {
            let mut next_leaf = self.leaf_page_mut(old_next)?;
            set_special_page_id(&mut next_leaf, LEAF_PREV_OFFSET, right_id);
        }

        self.propagate_split(left_id, right_id, sep_key, key, path)
    }

    /// Install the separator of a freshly split sibling pair into the
    /// parent, splitting ancestors as needed. The route that led to the
    /// left page is repointed to the right one, and a new `(left, sep)`
    /// slot takes over the keys below the separator.
    fn propagate_split(
        &self,
        mut left_id: PageId,
        mut right_id: PageId,
        mut sep_key: Vec<u8>,
        key: &[u8],
        path: &mut Vec<PathEntry>,
    ) -> Result<()> {
        loop {
            let Some(ancestor) = path.pop() else {
                return self.grow_root(left_id, right_id, &sep_key);
            };

            let mut parent = self.inner_page_mut(ancestor.page_id)?;
            let pos = parent.upper_bound(key);
            repoint_route(&mut parent, pos, right_id)?;
            let sep_slot = InnerSlot {
                child: left_id,
                upper_bound: &sep_key,
            }
            .encode();
            if parent.insert_before_slot(pos, &sep_slot) {
                return Ok(());
            }

            // The parent is full as well: split it and keep going up. The
            // old rightmost child stays with the upper half; the lower half
            // promotes its last slot's child into its own rightmost pointer
            // and that slot's bound becomes the next separator.
            let mut new_right = self.alloc_inner_page()?;
            parent.split_insert(&mut new_right, &sep_slot, pos)?;

            let rightmost = special_page_id(&parent, INNER_RIGHTMOST_OFFSET);
            set_special_page_id(&mut new_right, INNER_RIGHTMOST_OFFSET, rightmost);

            let last = parent.slot_count() - 1;
            let (promoted_child, promoted_key) = {
                let raw = parent
                    .slot(last)
                    .ok_or_else(|| corrupt(parent.page_id(), "slot directory out of range"))?;
                let parsed = InnerSlot::parse(raw)?;
                (parsed.child, parsed.upper_bound.to_vec())
            };
            set_special_page_id(&mut parent, INNER_RIGHTMOST_OFFSET, promoted_child);
            parent.delete_slot(last);

            debug!(
                level = ancestor.level,
                left = parent.page_id().0,
                right = new_right.page_id().0,
                "btree.inner_split"
            );
            left_id = parent.page_id();
            right_id = new_right.page_id();
            sep_key = promoted_key;
        }
    }

    /// A split reached the root: raise a new root with one slot for the low
    /// half and the high half as the rightmost child.
    fn grow_root(&self, left_id: PageId, right_id: PageId, sep_key: &[u8]) -> Result<()> {
        let mut new_root = self.alloc_inner_page()?;
        let sep_slot = InnerSlot {
            child: left_id,
            upper_bound: sep_key,
        }
        .encode();
        if !new_root.insert_before_slot(0, &sep_slot) {
            bail!("separator does not fit into an empty root page");
        }
        set_special_page_id(&mut new_root, INNER_RIGHTMOST_OFFSET, right_id);
        let root_id = new_root.page_id();
        drop(new_root);

        let mut meta = self.meta_mut()?;
        let level_num = meta.level_num() + 1;
        meta.set_root_page_id(root_id);
        meta.set_level_num(level_num);
        drop(meta);

        debug!(root = root_id.0, level_num, "btree.root_grow");
        Ok(())
    }

    // Deletion.

    /// Remove the route to a just-freed child from its parent, collapsing
    /// ancestors that lost their last child. If the whole path collapses,
    /// a fresh empty leaf becomes the root.
    fn collapse_route(&self, key: &[u8], path: &mut Vec<PathEntry>) -> Result<()> {
        while let Some(ancestor) = path.pop() {
            let mut inner = self.inner_page_mut(ancestor.page_id)?;
            let pos = inner.upper_bound(key);
            if pos < inner.slot_count() {
                inner.delete_slot(pos);
                return Ok(());
            }

            // The freed child was the rightmost pointer: promote the last
            // slot's child into it, keeping the pointer populated.
            let count = inner.slot_count();
            if count > 0 {
                let promoted = {
                    let raw = inner
                        .slot(count - 1)
                        .ok_or_else(|| corrupt(ancestor.page_id, "slot directory out of range"))?;
                    InnerSlot::parse(raw)?.child
                };
                set_special_page_id(&mut inner, INNER_RIGHTMOST_OFFSET, promoted);
                inner.delete_slot(count - 1);
                return Ok(());
            }

            // No slots and no children left: this page collapses too.
            drop(inner);
            self.buffer_pool.free_page(ancestor.page_id)?;
            debug!(
                page = ancestor.page_id.0,
                level = ancestor.level,
                "btree.inner_collapse"
            );
        }

        // Every ancestor collapsed: the tree is empty again.
        let root = self.alloc_leaf_page()?;
        let root_id = root.page_id();
        drop(root);
        let mut meta = self.meta_mut()?;
        meta.set_root_page_id(root_id);
        meta.set_level_num(1);
        Ok(())
    }

    /// While the root is an inner page without normal slots, promote its
    /// rightmost child to root.
    fn shrink_root(&self) -> Result<()> {
        loop {
            let meta = self.meta()?;
            let level = meta.level_num();
            let root_id = meta.root_page_id();
            drop(meta);
            if level <= 1 {
                return Ok(());
            }

            let root = self.inner_page(root_id)?;
            if !root.is_empty() {
                return Ok(());
            }
            let child = special_page_id(&root, INNER_RIGHTMOST_OFFSET);
            drop(root);

            self.buffer_pool.free_page(root_id)?;
            let mut meta = self.meta_mut()?;
            meta.set_root_page_id(child);
            meta.set_level_num(level - 1);
            drop(meta);
            debug!(root = child.0, level_num = level - 1, "btree.root_shrink");
        }
    }

    // Page plumbing.

    fn meta(&self) -> Result<MetaPage<PageReadGuard>> {
        Ok(MetaPage::new(self.buffer_pool.fetch_page(self.meta_page_id)?))
    }

    fn meta_mut(&self) -> Result<MetaPage<PageWriteGuard>> {
        Ok(MetaPage::new(
            self.buffer_pool.fetch_page_write(self.meta_page_id)?,
        ))
    }

    fn inner_page(&self, page_id: PageId) -> Result<InnerPage<PageReadGuard, C>> {
        let guard = self.buffer_pool.fetch_page(page_id)?;
        Ok(SortedPage::new(
            page_id,
            guard,
            InnerSlotOrdering::new(self.comparator.clone()),
        ))
    }

    fn inner_page_mut(&self, page_id: PageId) -> Result<InnerPage<PageWriteGuard, C>> {
        let guard = self.buffer_pool.fetch_page_write(page_id)?;
        Ok(SortedPage::new(
            page_id,
            guard,
            InnerSlotOrdering::new(self.comparator.clone()),
        ))
    }

    fn leaf_page(&self, page_id: PageId) -> Result<LeafPage<PageReadGuard, C>> {
        let guard = self.buffer_pool.fetch_page(page_id)?;
        Ok(SortedPage::new(
            page_id,
            guard,
            LeafSlotOrdering::new(self.comparator.clone()),
        ))
    }

    fn leaf_page_mut(&self, page_id: PageId) -> Result<LeafPage<PageWriteGuard, C>> {
        let guard = self.buffer_pool.fetch_page_write(page_id)?;
        Ok(SortedPage::new(
            page_id,
            guard,
            LeafSlotOrdering::new(self.comparator.clone()),
        ))
    }

    fn alloc_inner_page(&self) -> Result<InnerPage<PageWriteGuard, C>> {
        let (page_id, guard) = self.buffer_pool.new_page()?;
        let mut page = SortedPage::new(
            page_id,
            guard,
            InnerSlotOrdering::new(self.comparator.clone()),
        );
        page.init(INNER_SPECIAL_LEN);
        Ok(page)
    }

    fn alloc_leaf_page(&self) -> Result<LeafPage<PageWriteGuard, C>> {
        let (page_id, guard) = self.buffer_pool.new_page()?;
        let mut page = SortedPage::new(page_id, guard, LeafSlotOrdering::new(self.comparator.clone()));
        page.init(LEAF_SPECIAL_LEN);
        Ok(page)
    }

    fn add_tuple_num(&self, delta: i64) -> Result<()> {
        let mut meta = self.meta_mut()?;
        let updated = if delta >= 0 {
            meta.tuple_num().checked_add(delta as u64)
        } else {
            meta.tuple_num().checked_sub(delta.unsigned_abs())
        };
        let Some(updated) = updated else {
            bail!("tuple counter out of range on meta page {}", self.meta_page_id);
        };
        meta.set_tuple_num(updated);
        Ok(())
    }

    fn free_subtree(&self, page_id: PageId, level: u8) -> Result<()> {
        if level > 1 {
            let inner = self.inner_page(page_id)?;
            let mut children = Vec::with_capacity(inner.slot_count() as usize + 1);
            for i in 0..inner.slot_count() {
                children.push(inner_child(&inner, i)?);
            }
            children.push(special_page_id(&inner, INNER_RIGHTMOST_OFFSET));
            drop(inner);
            for child in children {
                self.free_subtree(child, level - 1)?;
            }
        }
        self.buffer_pool.free_page(page_id)?;
        Ok(())
    }

    fn dump_subtree(&self, out: &mut String, page_id: PageId, level: u8, depth: usize) -> Result<()> {
        use std::fmt::Write as _;

        let pad = "  ".repeat(depth);
        if level <= 1 {
            let leaf = self.leaf_page(page_id)?;
            let mut line = String::new();
            for i in 0..leaf.slot_count() {
                let raw = leaf
                    .slot(i)
                    .ok_or_else(|| corrupt(page_id, "slot directory out of range"))?;
                let parsed = LeafSlot::parse(raw)?;
                let _ = write!(
                    line,
                    " ({},{})",
                    parsed.key.escape_ascii(),
                    parsed.value.escape_ascii()
                );
            }
            let _ = writeln!(
                out,
                "{pad}leaf {} prev={} next={}:{line}",
                page_id.0,
                leaf_prev(&leaf).0,
                leaf_next(&leaf).0
            );
            return Ok(());
        }

        let inner = self.inner_page(page_id)?;
        let mut children = Vec::with_capacity(inner.slot_count() as usize + 1);
        let mut seps = String::new();
        for i in 0..inner.slot_count() {
            let raw = inner
                .slot(i)
                .ok_or_else(|| corrupt(page_id, "slot directory out of range"))?;
            let parsed = InnerSlot::parse(raw)?;
            let _ = write!(seps, " {}", parsed.upper_bound.escape_ascii());
            children.push(parsed.child);
        }
        children.push(special_page_id(&inner, INNER_RIGHTMOST_OFFSET));
        drop(inner);

        let _ = writeln!(out, "{pad}inner {}: seps{seps}", page_id.0);
        for child in children {
            self.dump_subtree(out, child, level - 1, depth + 1)?;
        }
        Ok(())
    }
}

// Free helpers shared with the iterator module.

pub(crate) fn special_page_id<B, O>(page: &SortedPage<B, O>, offset: usize) -> PageId
where
    B: Deref<Target = [u8; PAGE_SIZE]>,
{
    let b = page.read_special(offset, 4);
    PageId(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn set_special_page_id<B, O>(page: &mut SortedPage<B, O>, offset: usize, page_id: PageId)
where
    B: DerefMut<Target = [u8; PAGE_SIZE]>,
{
    page.write_special(offset, &page_id.0.to_le_bytes());
}

pub(crate) fn leaf_next<B, O>(leaf: &SortedPage<B, O>) -> PageId
where
    B: Deref<Target = [u8; PAGE_SIZE]>,
{
    special_page_id(leaf, LEAF_NEXT_OFFSET)
}

pub(crate) fn leaf_prev<B, O>(leaf: &SortedPage<B, O>) -> PageId
where
    B: Deref<Target = [u8; PAGE_SIZE]>,
{
    special_page_id(leaf, LEAF_PREV_OFFSET)
}

fn inner_child<B, O>(inner: &SortedPage<B, O>, i: SlotId) -> Result<PageId>
where
    B: Deref<Target = [u8; PAGE_SIZE]>,
{
    let raw = inner
        .slot(i)
        .ok_or_else(|| corrupt(inner.page_id(), "slot directory out of range"))?;
    Ok(InnerSlot::parse(raw)?.child)
}

/// Redirect the route at `pos` (a normal slot, or the rightmost pointer when
/// `pos` equals the slot count) to a different child.
fn repoint_route<B, O>(parent: &mut SortedPage<B, O>, pos: SlotId, child: PageId) -> Result<()>
where
    B: DerefMut<Target = [u8; PAGE_SIZE]>,
{
    if pos == parent.slot_count() {
        set_special_page_id(parent, INNER_RIGHTMOST_OFFSET, child);
        return Ok(());
    }
    let page_id = parent.page_id();
    let raw = parent
        .slot_mut(pos)
        .ok_or_else(|| corrupt(page_id, "route slot out of range"))?;
    let Some(child_bytes) = raw.get_mut(..INNER_SLOT_CHILD_SIZE) else {
        return Err(corrupt(page_id, "inner slot has no child id"));
    };
    child_bytes.copy_from_slice(&child.0.to_le_bytes());
    Ok(())
}

fn check_leaf_slot_size(slot: &[u8]) -> Result<()> {
    if slot.len() > MAX_LEAF_SLOT_SIZE {
        return Err(StorageError::SlotTooLarge {
            size: slot.len(),
            capacity: MAX_LEAF_SLOT_SIZE,
        }
        .into());
    }
    Ok(())
}

fn corrupt(page_id: PageId, reason: &str) -> anyhow::Error {
    StorageError::CorruptPage {
        page_id,
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::PageManager;
    use tempfile::tempdir;

    fn test_pool(max_frames: usize) -> Result<BufferPoolManager> {
        let dir = tempdir()?;
        let page_manager = PageManager::create(&dir.path().join("test.db"))?;
        let replacer = Box::new(LruReplacer::new(max_frames));
        Ok(BufferPoolManager::new(page_manager, replacer, max_frames))
    }

    fn test_tree() -> Result<BPlusTree> {
        BPlusTree::create(test_pool(64)?)
    }

    /// Collect every pair via the iterator.
    fn collect(tree: &BPlusTree) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut iter = tree.begin()?;
        while let Some((key, value)) = iter.cur()? {
            out.push((key.to_vec(), value.to_vec()));
            iter.next()?;
        }
        Ok(out)
    }

    #[test]
    fn test_empty_tree() -> Result<()> {
        let tree = test_tree()?;
        assert!(tree.is_empty()?);
        assert_eq!(tree.tuple_num()?, 0);
        assert_eq!(tree.level_num()?, 1);
        assert_eq!(tree.max_key()?, None);
        assert_eq!(tree.get(b"x")?, None);
        assert!(tree.begin()?.is_end());
        Ok(())
    }

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let mut tree = test_tree()?;
        assert!(tree.insert(b"a", b"1")?);
        assert!(tree.insert(b"c", b"3")?);
        assert!(tree.insert(b"b", b"2")?);

        assert_eq!(tree.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b")?, Some(b"2".to_vec()));
        assert_eq!(tree.get(b"c")?, Some(b"3".to_vec()));
        assert_eq!(tree.get(b"d")?, None);
        assert_eq!(tree.tuple_num()?, 3);
        assert_eq!(tree.max_key()?, Some(b"c".to_vec()));
        Ok(())
    }

    #[test]
    fn test_insert_existing_key_is_noop() -> Result<()> {
        let mut tree = test_tree()?;
        assert!(tree.insert(b"k", b"v1")?);
        assert!(!tree.insert(b"k", b"v2")?);
        assert_eq!(tree.get(b"k")?, Some(b"v1".to_vec()));
        assert_eq!(tree.tuple_num()?, 1);
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let mut tree = test_tree()?;
        tree.insert(b"a", b"1")?;
        tree.insert(b"b", b"2")?;

        assert!(tree.delete(b"a")?);
        assert_eq!(tree.get(b"a")?, None);
        assert_eq!(tree.tuple_num()?, 1);

        // Deleting again reports absence.
        assert!(!tree.delete(b"a")?);
        assert_eq!(tree.tuple_num()?, 1);

        assert!(tree.delete(b"b")?);
        assert!(tree.is_empty()?);
        assert_eq!(tree.level_num()?, 1);
        Ok(())
    }

    #[test]
    fn test_update() -> Result<()> {
        let mut tree = test_tree()?;
        assert!(!tree.update(b"missing", b"v")?);
        assert!(tree.is_empty()?);

        tree.insert(b"k", b"v1")?;
        assert!(tree.update(b"k", b"v2")?);
        assert_eq!(tree.get(b"k")?, Some(b"v2".to_vec()));
        assert_eq!(tree.tuple_num()?, 1);

        // Growing the value works too.
        assert!(tree.update(b"k", &vec![7u8; 512])?);
        assert_eq!(tree.get(b"k")?, Some(vec![7u8; 512]));
        assert_eq!(tree.tuple_num()?, 1);
        Ok(())
    }

    #[test]
    fn test_take() -> Result<()> {
        let mut tree = test_tree()?;
        tree.insert(b"k", b"v")?;

        assert_eq!(tree.take(b"k")?, Some(b"v".to_vec()));
        assert_eq!(tree.take(b"k")?, None);
        assert!(tree.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_iteration_order() -> Result<()> {
        let mut tree = test_tree()?;
        tree.insert(b"b", b"2")?;
        tree.insert(b"a", b"1")?;
        tree.insert(b"c", b"3")?;

        let pairs = collect(&tree)?;
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_slot_too_large() -> Result<()> {
        let mut tree = test_tree()?;
        let huge = vec![0u8; PAGE_SIZE];
        assert!(tree.insert(b"k", &huge).is_err());
        assert!(tree.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_leaf_splits() -> Result<()> {
        let mut tree = test_tree()?;
        // ~410 bytes per slot forces splits well before 100 keys.
        for i in 0..100u32 {
            let key = format!("key{:04}", i);
            let value = vec![i as u8; 400];
            assert!(tree.insert(key.as_bytes(), &value)?);
        }

        assert_eq!(tree.tuple_num()?, 100);
        assert!(tree.level_num()? >= 2);
        for i in 0..100u32 {
            let key = format!("key{:04}", i);
            assert_eq!(tree.get(key.as_bytes())?, Some(vec![i as u8; 400]));
        }

        let pairs = collect(&tree)?;
        assert_eq!(pairs.len(), 100);
        for (i, (key, _)) in pairs.iter().enumerate() {
            assert_eq!(key, format!("key{:04}", i).as_bytes());
        }
        assert_eq!(tree.max_key()?, Some(b"key0099".to_vec()));
        Ok(())
    }

    #[test]
    fn test_deep_tree_inserts_and_drain() -> Result<()> {
        let mut tree = test_tree()?;
        // Large keys keep inner fanout small, forcing inner splits and a
        // tree of at least three levels.
        let key_of = |i: u32| {
            let mut key = format!("{:06}", i).into_bytes();
            key.resize(500, b'.');
            key
        };
        let n = 1200u32;
        for i in 0..n {
            assert!(tree.insert(&key_of(i), b"v")?);
        }
        assert_eq!(tree.tuple_num()?, n as u64);
        assert!(tree.level_num()? >= 3);

        for i in (0..n).step_by(7) {
            assert_eq!(tree.get(&key_of(i))?, Some(b"v".to_vec()));
        }

        // Drain in ascending order; the tree must collapse back to a single
        // empty leaf.
        for i in 0..n {
            assert!(tree.delete(&key_of(i))?);
        }
        assert!(tree.is_empty()?);
        assert_eq!(tree.level_num()?, 1);
        Ok(())
    }

    #[test]
    fn test_drain_descending() -> Result<()> {
        let mut tree = test_tree()?;
        let key_of = |i: u32| {
            let mut key = format!("{:06}", i).into_bytes();
            key.resize(400, b'-');
            key
        };
        for i in 0..600u32 {
            tree.insert(&key_of(i), b"v")?;
        }
        assert!(tree.level_num()? >= 2);

        for i in (0..600u32).rev() {
            assert!(tree.delete(&key_of(i))?);
        }
        assert!(tree.is_empty()?);
        assert_eq!(tree.level_num()?, 1);
        assert!(tree.begin()?.is_end());
        Ok(())
    }

    #[test]
    fn test_destroy_frees_every_page() -> Result<()> {
        let pool = test_pool(64)?;
        let mut tree = BPlusTree::create(pool.clone())?;
        for i in 0..200u32 {
            tree.insert(format!("{:04}", i).as_bytes(), &vec![1u8; 300])?;
        }
        assert!(pool.num_live_pages()? > 2);

        tree.destroy()?;
        assert_eq!(pool.num_live_pages()?, 0);
        Ok(())
    }

    #[test]
    fn test_drain_returns_to_created_footprint() -> Result<()> {
        let pool = test_pool(64)?;
        let mut tree = BPlusTree::create(pool.clone())?;
        assert_eq!(pool.num_live_pages()?, 2); // meta + root leaf

        for i in 0..400u32 {
            tree.insert(format!("{:04}", i).as_bytes(), &vec![9u8; 350])?;
        }
        for i in 0..400u32 {
            tree.delete(format!("{:04}", i).as_bytes())?;
        }

        assert!(tree.is_empty()?);
        assert_eq!(tree.level_num()?, 1);
        assert_eq!(pool.num_live_pages()?, 2);
        Ok(())
    }

    #[test]
    fn test_reopen_by_meta_page_id() -> Result<()> {
        let pool = test_pool(64)?;
        let meta_page_id = {
            let mut tree = BPlusTree::create(pool.clone())?;
            tree.insert(b"k", b"v")?;
            tree.meta_page_id()
        };

        let tree = BPlusTree::open(pool, meta_page_id);
        assert_eq!(tree.get(b"k")?, Some(b"v".to_vec()));
        assert_eq!(tree.tuple_num()?, 1);
        Ok(())
    }

    #[test]
    fn test_dump_renders_tree() -> Result<()> {
        let mut tree = test_tree()?;
        tree.insert(b"a", b"1")?;
        tree.insert(b"b", b"2")?;

        let dump = tree.dump()?;
        assert!(dump.contains("level_num=1"));
        assert!(dump.contains("(a,1)"));
        assert!(dump.contains("(b,2)"));
        Ok(())
    }
}
