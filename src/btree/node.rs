use std::cmp::Ordering;
use std::fmt;

use super::key::{ImageKey, KEY_SIZE};
use crate::error::{Error, Result};

// Constants for B-tree configuration
pub const ORDER: usize = 3;
pub const MAX_KEYS: usize = ORDER - 1;
pub const MIN_KEYS: usize = ORDER / 2;

// is_leaf(4) + num_keys(4) + children(8 * ORDER) + keys(KEY_SIZE * MAX_KEYS) + self_offset(8)
pub const PAGE_SIZE: usize = 4 + 4 + 8 * ORDER + KEY_SIZE * MAX_KEYS + 8;

const CHILDREN_START: usize = 8;
const KEYS_START: usize = CHILDREN_START + 8 * ORDER;
const SELF_OFFSET_START: usize = KEYS_START + KEY_SIZE * MAX_KEYS;
const NULL_CHILD: i64 = -1;

/// Byte offset of a page inside the page file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageOffset(pub u64);

impl PageOffset {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory copy of one page.
///
/// `children` only holds live child offsets: empty for a leaf and
/// `keys.len() + 1` entries for an internal node. A node may briefly hold
/// `MAX_KEYS + 1` keys while an insert is being split, but it is never
/// written in that state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub is_leaf: bool,
    pub keys: Vec<ImageKey>,
    pub children: Vec<PageOffset>,
    pub offset: PageOffset,
}

impl Node {
    pub fn new(offset: PageOffset, is_leaf: bool) -> Self {
        Node {
            is_leaf,
            keys: Vec::with_capacity(MAX_KEYS + 1),
            children: Vec::with_capacity(if is_leaf { 0 } else { ORDER + 1 }),
            offset,
        }
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    /// Whether one more key would force a split.
    pub fn is_full(&self) -> bool {
        self.keys.len() >= MAX_KEYS
    }

    pub fn is_overfull(&self) -> bool {
        self.keys.len() > MAX_KEYS
    }

    pub fn is_underfull(&self) -> bool {
        self.keys.len() < MIN_KEYS
    }

    /// Whether one key can be taken away without dropping below `MIN_KEYS`.
    pub fn has_spare_key(&self) -> bool {
        self.keys.len() > MIN_KEYS
    }

    /// Index of the first key that is `>=` the target.
    pub fn lower_bound(&self, name: &str, threshold: i32) -> usize {
        self.keys
            .iter()
            .position(|k| k.cmp_target(name, threshold) != Ordering::Less)
            .unwrap_or(self.keys.len())
    }

    /// Index of the first key that is `>` the given key. Equal keys stay
    /// to the left so a duplicate lands after the existing entries.
    pub fn upper_bound(&self, key: &ImageKey) -> usize {
        self.keys
            .iter()
            .position(|k| k.cmp_order(key) == Ordering::Greater)
            .unwrap_or(self.keys.len())
    }

    pub fn serialize(&self) -> Result<[u8; PAGE_SIZE]> {
        if self.keys.len() > MAX_KEYS {
            return Err(Error::Serialization(format!(
                "Node at {} holds {} keys (max {MAX_KEYS})",
                self.offset,
                self.keys.len()
            )));
        }
        let expected_children = if self.is_leaf { 0 } else { self.keys.len() + 1 };
        if self.children.len() != expected_children {
            return Err(Error::Serialization(format!(
                "Node at {} has {} children, expected {expected_children}",
                self.offset,
                self.children.len()
            )));
        }

        let mut buffer = [0u8; PAGE_SIZE];
        buffer[0..4].copy_from_slice(&(self.is_leaf as i32).to_le_bytes());
        buffer[4..8].copy_from_slice(&(self.keys.len() as i32).to_le_bytes());

        for slot in 0..ORDER {
            let child = self
                .children
                .get(slot)
                .map_or(NULL_CHILD, |c| c.0 as i64);
            let start = CHILDREN_START + slot * 8;
            buffer[start..start + 8].copy_from_slice(&child.to_le_bytes());
        }

        for (i, key) in self.keys.iter().enumerate() {
            let start = KEYS_START + i * KEY_SIZE;
            key.encode_into(&mut buffer[start..start + KEY_SIZE])?;
        }

        buffer[SELF_OFFSET_START..].copy_from_slice(&(self.offset.0 as i64).to_le_bytes());
        Ok(buffer)
    }

    /// Bytes of a freshly allocated page: no keys and every child slot null.
    /// Such a page is readable back even when flagged internal.
    pub fn blank_page(offset: PageOffset, is_leaf: bool) -> [u8; PAGE_SIZE] {
        let mut buffer = [0u8; PAGE_SIZE];
        buffer[0..4].copy_from_slice(&(is_leaf as i32).to_le_bytes());
        for slot in 0..ORDER {
            let start = CHILDREN_START + slot * 8;
            buffer[start..start + 8].copy_from_slice(&NULL_CHILD.to_le_bytes());
        }
        buffer[SELF_OFFSET_START..].copy_from_slice(&(offset.0 as i64).to_le_bytes());
        buffer
    }

    /// Decode a page read at `offset`. The stored self offset is ignored.
    pub fn deserialize(buffer: &[u8], offset: PageOffset) -> Result<Self> {
        if buffer.len() != PAGE_SIZE {
            return Err(Error::Deserialization(format!(
                "Invalid node size {} (expected {PAGE_SIZE})",
                buffer.len()
            )));
        }

        let is_leaf = match i32::from_le_bytes(word(buffer, 0)) {
            0 => false,
            1 => true,
            other => {
                return Err(Error::Deserialization(format!(
                    "Invalid leaf flag {other} at offset {offset}"
                )))
            }
        };

        let num_keys = i32::from_le_bytes(word(buffer, 4));
        if num_keys < 0 || num_keys as usize > MAX_KEYS {
            return Err(Error::Deserialization(format!(
                "Invalid key count {num_keys} at offset {offset}"
            )));
        }
        let num_keys = num_keys as usize;

        let mut keys = Vec::with_capacity(MAX_KEYS + 1);
        for i in 0..num_keys {
            let start = KEYS_START + i * KEY_SIZE;
            keys.push(ImageKey::decode(&buffer[start..start + KEY_SIZE])?);
        }

        let mut children = Vec::with_capacity(ORDER + 1);
        let blank = num_keys == 0 && i64::from_le_bytes(dword(buffer, CHILDREN_START)) == NULL_CHILD;
        if !is_leaf && !blank {
            for slot in 0..=num_keys {
                let start = CHILDREN_START + slot * 8;
                let child = i64::from_le_bytes(dword(buffer, start));
                if child < 0 {
                    return Err(Error::Deserialization(format!(
                        "Internal node at {offset} is missing child {slot}"
                    )));
                }
                children.push(PageOffset(child as u64));
            }
        }

        Ok(Node {
            is_leaf,
            keys,
            children,
            offset,
        })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_leaf { "LEAF" } else { "INTERNAL" };
        write!(f, "[{kind}] keys: {} | ", self.keys.len())?;
        if self.keys.is_empty() {
            write!(f, "EMPTY")?;
        } else {
            for (i, key) in self.keys.iter().enumerate() {
                if i > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{key}")?;
            }
        }
        if !self.is_leaf && !self.keys.is_empty() {
            write!(f, " | children: ")?;
            for (i, child) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{child}")?;
            }
        }
        Ok(())
    }
}

fn word(buf: &[u8], start: usize) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[start..start + 4]);
    bytes
}

fn dword(buf: &[u8], start: usize) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[start..start + 8]);
    bytes
}
