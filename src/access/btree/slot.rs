//! On-disk slot formats of the two B+tree page shapes.
//!
//! Inner slot: `child (u32 LE) ‖ upper_bound_key`. The key length is implied
//! by the slot length.
//!
//! Leaf slot: `key_len (u16 LE) ‖ key ‖ value`. The value length is implied:
//! `slot_len - 2 - key_len`.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageOffset};

/// Size of the child page id prefix of an inner slot.
pub const INNER_SLOT_CHILD_SIZE: usize = std::mem::size_of::<u32>();
/// Size of the key length prefix of a leaf slot.
pub const LEAF_SLOT_KEY_LEN_SIZE: usize = std::mem::size_of::<PageOffset>();

/// Parsed inner slot: a child pointer and the strict upper bound of every
/// key in that child's subtree.
#[derive(Debug, PartialEq, Eq)]
pub struct InnerSlot<'a> {
    pub child: PageId,
    pub upper_bound: &'a [u8],
}

impl<'a> InnerSlot<'a> {
    pub fn parse(data: &'a [u8]) -> StorageResult<Self> {
        if data.len() < INNER_SLOT_CHILD_SIZE {
            return Err(StorageError::CorruptSlot {
                reason: format!("inner slot of {} bytes has no child id", data.len()),
            });
        }
        let child = PageId(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
        Ok(Self {
            child,
            upper_bound: &data[INNER_SLOT_CHILD_SIZE..],
        })
    }

    pub fn encoded_size(&self) -> usize {
        INNER_SLOT_CHILD_SIZE + self.upper_bound.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        out.extend_from_slice(&self.child.0.to_le_bytes());
        out.extend_from_slice(self.upper_bound);
        out
    }
}

/// Parsed leaf slot: one key-value pair.
#[derive(Debug, PartialEq, Eq)]
pub struct LeafSlot<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> LeafSlot<'a> {
    pub fn parse(data: &'a [u8]) -> StorageResult<Self> {
        if data.len() < LEAF_SLOT_KEY_LEN_SIZE {
            return Err(StorageError::CorruptSlot {
                reason: format!("leaf slot of {} bytes has no key length", data.len()),
            });
        }
        let key_len = u16::from_le_bytes([data[0], data[1]]) as usize;
        let key_end = LEAF_SLOT_KEY_LEN_SIZE + key_len;
        if key_end > data.len() {
            return Err(StorageError::CorruptSlot {
                reason: format!(
                    "leaf slot key length {} exceeds slot length {}",
                    key_len,
                    data.len()
                ),
            });
        }
        Ok(Self {
            key: &data[LEAF_SLOT_KEY_LEN_SIZE..key_end],
            value: &data[key_end..],
        })
    }

    pub fn encoded_size(&self) -> usize {
        LEAF_SLOT_KEY_LEN_SIZE + self.key.len() + self.value.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        out.extend_from_slice(&(self.key.len() as PageOffset).to_le_bytes());
        out.extend_from_slice(self.key);
        out.extend_from_slice(self.value);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_slot_roundtrip() {
        let slot = InnerSlot {
            child: PageId(0x0a0b0c0d),
            upper_bound: b"separator",
        };
        let encoded = slot.encode();
        assert_eq!(encoded.len(), slot.encoded_size());
        assert_eq!(&encoded[..4], &[0x0d, 0x0c, 0x0b, 0x0a]);

        let parsed = InnerSlot::parse(&encoded).unwrap();
        assert_eq!(parsed, slot);
    }

    #[test]
    fn test_inner_slot_empty_key() {
        let encoded = InnerSlot {
            child: PageId(7),
            upper_bound: b"",
        }
        .encode();
        let parsed = InnerSlot::parse(&encoded).unwrap();
        assert_eq!(parsed.child, PageId(7));
        assert!(parsed.upper_bound.is_empty());
    }

    #[test]
    fn test_inner_slot_too_short() {
        assert!(InnerSlot::parse(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_leaf_slot_roundtrip() {
        let slot = LeafSlot {
            key: b"key",
            value: b"value bytes",
        };
        let encoded = slot.encode();
        assert_eq!(encoded.len(), slot.encoded_size());
        assert_eq!(&encoded[..2], &[3, 0]);

        let parsed = LeafSlot::parse(&encoded).unwrap();
        assert_eq!(parsed, slot);
    }

    #[test]
    fn test_leaf_slot_empty_value() {
        let encoded = LeafSlot {
            key: b"k",
            value: b"",
        }
        .encode();
        let parsed = LeafSlot::parse(&encoded).unwrap();
        assert_eq!(parsed.key, b"k");
        assert!(parsed.value.is_empty());
    }

    #[test]
    fn test_leaf_slot_corrupt_key_len() {
        // Claims a 200-byte key inside a 5-byte slot.
        let data = [200u8, 0, b'a', b'b', b'c'];
        assert!(LeafSlot::parse(&data).is_err());
        assert!(LeafSlot::parse(&[5]).is_err());
    }
}
