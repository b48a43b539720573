#![forbid(unsafe_code)]
//! In-memory tree nodes and their fixed-block codec.
//!
//! A node covers the open key range `(first, last)` and owns `degree - 1`
//! sorted key slots plus `degree` child ids. Empty slots carry the zero key;
//! slots whose value offset is the synthetic sentinel are stride anchors,
//! not real inserted keys.

use crate::key::{self, Key, KEY_BYTES};
use crate::types::{EstriaError, NodeId, Result, EMPTY_CHILD, SYNTHETIC_VALUE};

/// Bytes per slot on disk: key, value offset, value length.
const SLOT_LEN: usize = KEY_BYTES + 8 + 4;
/// Bytes per child pointer on disk.
const CHILD_LEN: usize = 8;
/// Bytes for the `first`/`last` range header.
const RANGE_LEN: usize = 2 * KEY_BYTES;

/// One key slot: the key plus the offset and total length of its record in
/// the value file.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct KeyValue {
    pub key: Key,
    pub offset: u64,
    pub length: u32,
}

impl KeyValue {
    pub const EMPTY: KeyValue = KeyValue {
        key: Key::ZERO,
        offset: 0,
        length: 0,
    };

    pub fn synthetic(key: Key) -> KeyValue {
        KeyValue {
            key,
            offset: SYNTHETIC_VALUE,
            length: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.key.is_zero()
    }

    pub fn is_synthetic(&self) -> bool {
        self.offset == SYNTHETIC_VALUE
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    level: u32,
    degree: u32,
    first: Key,
    last: Key,
    slots: Vec<KeyValue>,
    children: Vec<NodeId>,
}

/// Returns the largest degree whose serialized node fits in `block_size`.
/// A node stores `degree - 1` slots but `degree` children, so the budget
/// gets one slot's worth of credit back.
pub fn calculate_degree(block_size: u32) -> Result<u32> {
    let budget = (block_size as usize + SLOT_LEN).saturating_sub(RANGE_LEN);
    let degree = budget / (SLOT_LEN + CHILD_LEN);
    if degree < 2 {
        return Err(EstriaError::Invalid("block size too small for a node"));
    }
    Ok(degree as u32)
}

/// Serialized length of a node with the given degree, excluding padding.
pub fn encoded_len(degree: u32) -> usize {
    RANGE_LEN + (degree as usize - 1) * SLOT_LEN + degree as usize * CHILD_LEN
}

impl Node {
    pub fn new(id: NodeId, level: u32, degree: u32, first: Key, last: Key) -> Result<Node> {
        if first >= last {
            return Err(EstriaError::Invalid("node first must be below last"));
        }
        if degree < 2 {
            return Err(EstriaError::Invalid("node degree must be at least 2"));
        }
        Ok(Node {
            id,
            level,
            degree,
            first,
            last,
            slots: vec![KeyValue::EMPTY; degree as usize - 1],
            children: vec![EMPTY_CHILD; degree as usize],
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub(crate) fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    pub fn first(&self) -> &Key {
        &self.first
    }

    pub fn last(&self) -> &Key {
        &self.last
    }

    /// Maximum number of keys this node can hold.
    pub fn max_keys(&self) -> usize {
        self.degree as usize - 1
    }

    pub fn stride(&self) -> Result<Key> {
        key::stride(&self.first, &self.last, self.degree)
    }

    pub fn slot(&self, i: usize) -> &KeyValue {
        &self.slots[i]
    }

    pub fn set_slot(&mut self, i: usize, kv: KeyValue) {
        self.slots[i] = kv;
    }

    pub fn child(&self, i: usize) -> NodeId {
        self.children[i]
    }

    pub fn set_child(&mut self, i: usize, id: NodeId) {
        self.children[i] = id;
    }

    pub fn empty_key_count(&self) -> usize {
        self.slots.iter().filter(|kv| kv.is_zero()).count()
    }

    pub fn is_full(&self) -> bool {
        self.empty_key_count() == 0
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(|&c| c != EMPTY_CHILD)
    }

    pub fn non_synthetic_key_count(&self) -> usize {
        self.real_keys().count()
    }

    /// The node's real key slots: populated and not synthetic anchors.
    pub fn real_keys(&self) -> impl Iterator<Item = &KeyValue> {
        self.slots
            .iter()
            .filter(|kv| !kv.is_zero() && !kv.is_synthetic())
    }

    /// Fills every empty slot with its evenly spaced stride anchor. Returns
    /// the number of anchors added.
    pub fn add_synthetics(&mut self) -> Result<usize> {
        let stride = self.stride()?;
        let mut added = 0;
        for i in 0..self.slots.len() {
            if !self.slots[i].is_zero() {
                continue;
            }
            let anchor = self
                .first
                .checked_add(&stride.checked_mul_u64(i as u64 + 1)?)?;
            self.slots[i] = KeyValue::synthetic(anchor);
            added += 1;
        }
        Ok(added)
    }

    /// Empties every slot. Children are left alone; callers reassign them as
    /// part of a full rebalance.
    pub fn clear(&mut self) {
        self.slots.fill(KeyValue::EMPTY);
    }

    /// Exact-match lookup over real keys. Synthetic anchors are invisible.
    pub fn find(&self, key: &Key) -> Option<(u64, u32)> {
        self.real_keys()
            .find(|kv| kv.key == *key)
            .map(|kv| (kv.offset, kv.length))
    }

    /// Walks the child positions in slot order, yielding each child's index,
    /// covering subrange and id. The subrange for position `i` runs from slot
    /// `i - 1`'s key (or `first`) to slot `i`'s key (or `last`). Positions
    /// adjacent to an empty slot are suppressed.
    pub fn each_child<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Key, &Key, NodeId) -> Result<()>,
    {
        let slots = self.slots.len();
        for i in 0..self.children.len() {
            if i > 0 && self.slots[i - 1].is_zero() {
                continue;
            }
            if i < slots && self.slots[i].is_zero() {
                continue;
            }
            let lo = if i == 0 { &self.first } else { &self.slots[i - 1].key };
            let hi = if i == slots { &self.last } else { &self.slots[i].key };
            f(i, lo, hi, self.children[i])?;
        }
        Ok(())
    }

    /// Verifies the node invariants, naming the first violation.
    pub fn check_sane(&self) -> Result<()> {
        if self.first >= self.last {
            return Err(EstriaError::Corruption("node range is inverted"));
        }
        let mut previous: Option<&Key> = None;
        for kv in &self.slots {
            if kv.is_zero() {
                continue;
            }
            if kv.key <= self.first || kv.key >= self.last {
                return Err(EstriaError::Corruption("node key outside its range"));
            }
            if let Some(prev) = previous {
                if kv.key <= *prev {
                    return Err(EstriaError::Corruption("node keys out of order"));
                }
            }
            previous = Some(&kv.key);
        }
        if self.empty_key_count() > 0 && self.has_children() {
            return Err(EstriaError::Corruption("node has children but empty slots"));
        }
        Ok(())
    }

    pub fn is_sane(&self) -> bool {
        self.check_sane().is_ok()
    }

    /// Serializes into one block. Integer fields are little-endian, keys are
    /// big-endian; the block tail is zero padding.
    pub fn serialize(&self, block: &mut [u8]) -> Result<()> {
        if block.len() < encoded_len(self.degree) {
            return Err(EstriaError::Invalid("block too small for node"));
        }
        block.fill(0);
        let mut pos = 0;
        block[pos..pos + KEY_BYTES].copy_from_slice(&self.first.to_bytes());
        pos += KEY_BYTES;
        block[pos..pos + KEY_BYTES].copy_from_slice(&self.last.to_bytes());
        pos += KEY_BYTES;
        for kv in &self.slots {
            block[pos..pos + KEY_BYTES].copy_from_slice(&kv.key.to_bytes());
            pos += KEY_BYTES;
            block[pos..pos + 8].copy_from_slice(&kv.offset.to_le_bytes());
            pos += 8;
            block[pos..pos + 4].copy_from_slice(&kv.length.to_le_bytes());
            pos += 4;
        }
        for child in &self.children {
            block[pos..pos + 8].copy_from_slice(&child.0.to_le_bytes());
            pos += 8;
        }
        Ok(())
    }

    /// Parses a node from one block. The level is not stored on disk; the
    /// tree stamps it from the descent depth.
    pub fn deserialize(id: NodeId, degree: u32, block: &[u8]) -> Result<Node> {
        if degree < 2 {
            return Err(EstriaError::Invalid("node degree must be at least 2"));
        }
        if block.len() < encoded_len(degree) {
            return Err(EstriaError::Corruption("node block truncated"));
        }
        let mut pos = 0;
        let first = Key::from_bytes(&block[pos..pos + KEY_BYTES])?;
        pos += KEY_BYTES;
        let last = Key::from_bytes(&block[pos..pos + KEY_BYTES])?;
        pos += KEY_BYTES;
        if first >= last {
            return Err(EstriaError::Corruption("node range is inverted"));
        }
        let mut slots = Vec::with_capacity(degree as usize - 1);
        for _ in 0..degree - 1 {
            let key = Key::from_bytes(&block[pos..pos + KEY_BYTES])?;
            pos += KEY_BYTES;
            let offset = u64::from_le_bytes(block[pos..pos + 8].try_into().expect("8 bytes"));
            pos += 8;
            let length = u32::from_le_bytes(block[pos..pos + 4].try_into().expect("4 bytes"));
            pos += 4;
            slots.push(KeyValue {
                key,
                offset,
                length,
            });
        }
        let mut children = Vec::with_capacity(degree as usize);
        for _ in 0..degree {
            let child = u64::from_le_bytes(block[pos..pos + 8].try_into().expect("8 bytes"));
            pos += 8;
            children.push(NodeId(child));
        }
        Ok(Node {
            id,
            level: 0,
            degree,
            first,
            last,
            slots,
            children,
        })
    }
}
