//! Access layer: ordered key-value structures built on the storage layer.

pub mod btree;

pub use btree::{BPlusTree, BytewiseComparator, KeyComparator, TreeIterator};
