// src/indirect_node.rs
//! Indirection tables and the block chains built from them.
//!
//! A node is one block of little-endian `u64` slots. Slot value 0 means
//! unused; used slots are packed from index 0 and never repeat. A stream of
//! `depth` levels is addressed by a root node whose slots point at data
//! blocks (`depth == 1`) or at nodes one level down.

use crate::block_manipulator::BlockManipulator;
use crate::error::{Result, VfsError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const SLOT_SIZE: usize = 8;
pub const MAX_DEPTH: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectNode {
    block_number: u64,
    slots: Vec<u64>,
}

impl IndirectNode {
    pub fn new(block_number: u64, capacity: usize) -> Self {
        IndirectNode { block_number, slots: vec![0; capacity] }
    }

    pub fn capacity_for(block_size: usize) -> usize {
        block_size / SLOT_SIZE
    }

    /// Decodes a node, rejecting gaps and duplicate entries.
    pub fn from_bytes(block_number: u64, bytes: &[u8]) -> Result<Self> {
        let slots: Vec<u64> = bytes
        .chunks_exact(SLOT_SIZE)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();

        let used = slots.iter().take_while(|&&s| s != 0).count();
        if slots[used..].iter().any(|&s| s != 0) {
            return Err(VfsError::block(format!("indirect node {} has a gap before slot {}", block_number, used)));
        }
        let mut seen = HashSet::with_capacity(used);
        if !slots[..used].iter().all(|s| seen.insert(*s)) {
            return Err(VfsError::block(format!("indirect node {} repeats an entry", block_number)));
        }
        Ok(IndirectNode { block_number, slots })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.slots.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn load(bm: &mut BlockManipulator, block_number: u64) -> Result<Self> {
        let bytes = bm.read_block(block_number)?;
        Self::from_bytes(block_number, &bytes)
    }

    pub fn store(&self, bm: &mut BlockManipulator) -> Result<()> {
        bm.write_block(self.block_number, &self.to_bytes())
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used_count(&self) -> usize {
        self.slots.iter().filter(|&&s| s != 0).count()
    }

    pub fn has_free_node(&self) -> bool {
        self.slots.iter().any(|&s| s == 0)
    }

    /// Entry at the index equal to the number of used slots.
    ///
    /// With dense packing this is the first free slot, so the result is
    /// `Some(0)` while space remains and `None` once the node is full.
    pub fn last_used_node_number(&self) -> Option<u64> {
        self.slots.get(self.used_count()).copied()
    }

    /// The entries actually in use, in slot order.
    pub fn used(&self) -> &[u64] {
        &self.slots[..self.used_count()]
    }

    pub fn push(&mut self, block: u64) -> Result<()> {
        if block == 0 {
            return Err(VfsError::block("block 0 cannot be referenced"));
        }
        let used = self.used_count();
        if used == self.slots.len() {
            return Err(VfsError::block(format!("indirect node {} is full", self.block_number)));
        }
        if self.slots[..used].contains(&block) {
            return Err(VfsError::block(format!("block {} already referenced by node {}", block, self.block_number)));
        }
        self.slots[used] = block;
        Ok(())
    }
}

/// Location of a stored byte stream.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    pub root: u64,
    pub depth: u8,
    /// Stored (encoded) length in bytes.
    pub len: u64,
}

impl Extent {
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

/// Largest stream a chain of [`MAX_DEPTH`] levels can address.
pub fn max_payload(block_size: usize) -> u64 {
    let capacity = IndirectNode::capacity_for(block_size) as u64;
    capacity.saturating_pow(MAX_DEPTH as u32).saturating_mul(block_size as u64)
}

/// Writes `data` to freshly allocated blocks and returns its extent.
pub fn write_extent(bm: &mut BlockManipulator, data: &[u8]) -> Result<Extent> {
    if data.is_empty() {
        return Ok(Extent::default());
    }
    let block_size = bm.block_size();
    let limit = max_payload(block_size);
    if data.len() as u64 > limit {
        return Err(VfsError::argument(format!(
            "payload of {} bytes exceeds the {} bytes a file can address",
            data.len(),
            limit
        )));
    }

    let mut allocated = Vec::new();
    match build_chain(bm, data, &mut allocated) {
        Ok(extent) => {
            debug!("Wrote {} bytes as depth {} chain rooted at {}", data.len(), extent.depth, extent.root);
            Ok(extent)
        }
        Err(e) => {
            for block in allocated.into_iter().rev() {
                let _ = bm.free_block(block);
            }
            Err(e)
        }
    }
}

fn build_chain(bm: &mut BlockManipulator, data: &[u8], allocated: &mut Vec<u64>) -> Result<Extent> {
    let block_size = bm.block_size();
    let capacity = IndirectNode::capacity_for(block_size);

    let mut level = Vec::with_capacity(data.len().div_ceil(block_size));
    for chunk in data.chunks(block_size) {
        let block = bm.allocate_block()?;
        allocated.push(block);
        let mut buf = vec![0u8; block_size];
        buf[..chunk.len()].copy_from_slice(chunk);
        bm.write_block(block, &buf)?;
        level.push(block);
    }

    let mut depth = 0u8;
    loop {
        depth += 1;
        let mut parents = Vec::with_capacity(level.len().div_ceil(capacity));
        for group in level.chunks(capacity) {
            let block = bm.allocate_block()?;
            allocated.push(block);
            let mut node = IndirectNode::new(block, capacity);
            for &child in group {
                node.push(child)?;
            }
            node.store(bm)?;
            parents.push(block);
        }
        level = parents;
        if level.len() == 1 {
            break;
        }
    }

    Ok(Extent { root: level[0], depth, len: data.len() as u64 })
}

fn collect(bm: &mut BlockManipulator, node: u64, depth: u8, data: &mut Vec<u64>, nodes: &mut Vec<u64>) -> Result<()> {
    let node = IndirectNode::load(bm, node)?;
    nodes.push(node.block_number());
    if depth == 1 {
        data.extend_from_slice(node.used());
        return Ok(());
    }
    for &child in node.used() {
        collect(bm, child, depth - 1, data, nodes)?;
    }
    Ok(())
}

/// Data blocks and node blocks of an extent, in that order.
pub fn extent_blocks(bm: &mut BlockManipulator, extent: &Extent) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut data = Vec::new();
    let mut nodes = Vec::new();
    if extent.is_empty() {
        return Ok((data, nodes));
    }
    if extent.depth > MAX_DEPTH || extent.root == 0 {
        return Err(VfsError::block(format!("malformed extent {:?}", extent)));
    }
    collect(bm, extent.root, extent.depth, &mut data, &mut nodes)?;

    let expected = (extent.len as usize).div_ceil(bm.block_size());
    if data.len() != expected {
        return Err(VfsError::block(format!(
            "extent rooted at {} lists {} data blocks, expected {}",
            extent.root,
            data.len(),
            expected
        )));
    }
    Ok((data, nodes))
}

pub fn read_extent(bm: &mut BlockManipulator, extent: &Extent) -> Result<Vec<u8>> {
    let (data_blocks, _) = extent_blocks(bm, extent)?;
    let mut out = Vec::with_capacity(data_blocks.len() * bm.block_size());
    for block in data_blocks {
        out.extend_from_slice(&bm.read_block(block)?);
    }
    out.truncate(extent.len as usize);
    Ok(out)
}

pub fn free_extent(bm: &mut BlockManipulator, extent: &Extent) -> Result<()> {
    let (data_blocks, node_blocks) = extent_blocks(bm, extent)?;
    for block in data_blocks.into_iter().chain(node_blocks) {
        bm.free_block(block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CompressionKind, EncryptionKind};
    use crate::options::{FileSystemOptions, KdfParams};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use tempfile::TempDir;

    fn manipulator(dir: &TempDir) -> BlockManipulator {
        let opts = FileSystemOptions::builder(dir.path().join("chain.vdisk"))
        .block_size(512)
        .master_block_size(1024)
        .encryption(EncryptionKind::None)
        .compression(CompressionKind::None)
        .kdf(KdfParams::light())
        .build("pw")
        .unwrap();
        BlockManipulator::create(&opts, 512).unwrap()
    }

    fn node_with(k: usize, capacity: usize) -> IndirectNode {
        let mut node = IndirectNode::new(99, capacity);
        for i in 0..k {
            node.push(100 + i as u64).unwrap();
        }
        node
    }

    #[test]
    fn free_slot_reporting_follows_used_count() {
        let capacity = 8;
        for k in 0..=capacity {
            let node = node_with(k, capacity);
            assert_eq!(node.has_free_node(), k < capacity);
            assert_eq!(node.last_used_node_number(), node.slots.get(k).copied());
            if k < capacity {
                assert_eq!(node.last_used_node_number(), Some(0));
            } else {
                assert_eq!(node.last_used_node_number(), None);
            }
            assert_eq!(node.used().len(), k);
        }
    }

    #[test]
    fn push_rejects_zero_duplicates_and_overflow() {
        let mut node = node_with(3, 4);
        assert!(matches!(node.push(0), Err(VfsError::Block(_))));
        assert!(matches!(node.push(101), Err(VfsError::Block(_))));
        node.push(7).unwrap();
        assert!(matches!(node.push(8), Err(VfsError::Block(_))));
    }

    #[test]
    fn decoding_rejects_gaps_and_duplicates() {
        let good = node_with(3, 64).to_bytes();
        assert_eq!(IndirectNode::from_bytes(99, &good).unwrap().used(), &[100, 101, 102]);

        let mut gap = good.clone();
        gap[8..16].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(IndirectNode::from_bytes(99, &gap), Err(VfsError::Block(_))));

        let mut dup = good;
        dup[16..24].copy_from_slice(&100u64.to_le_bytes());
        assert!(matches!(IndirectNode::from_bytes(99, &dup), Err(VfsError::Block(_))));
    }

    #[test]
    fn chains_grow_in_depth_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut bm = manipulator(&dir);
        let mut rng = ChaCha20Rng::seed_from_u64(1);

        // 512-byte blocks hold 64 slots: one node covers 32 KiB.
        for (len, depth) in [(1usize, 1u8), (512, 1), (64 * 512, 1), (64 * 512 + 1, 2), (65 * 64 * 512, 3)] {
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            let extent = write_extent(&mut bm, &data).unwrap();
            assert_eq!(extent.depth, depth, "len {}", len);
            assert_eq!(read_extent(&mut bm, &extent).unwrap(), data);
            free_extent(&mut bm, &extent).unwrap();
        }
    }

    #[test]
    fn freed_chain_blocks_are_reused() {
        let dir = TempDir::new().unwrap();
        let mut bm = manipulator(&dir);
        let extent = write_extent(&mut bm, &vec![7u8; 3 * 512]).unwrap();
        let high_water = bm.allocation().next_block;
        free_extent(&mut bm, &extent).unwrap();
        assert_eq!(bm.free_list_len().unwrap(), 4);

        let again = write_extent(&mut bm, &vec![9u8; 3 * 512]).unwrap();
        assert_eq!(bm.allocation().next_block, high_water);
        assert_eq!(read_extent(&mut bm, &again).unwrap(), vec![9u8; 3 * 512]);
    }

    #[test]
    fn empty_payload_uses_no_blocks() {
        let dir = TempDir::new().unwrap();
        let mut bm = manipulator(&dir);
        let extent = write_extent(&mut bm, &[]).unwrap();
        assert!(extent.is_empty());
        assert!(read_extent(&mut bm, &extent).unwrap().is_empty());
        assert_eq!(bm.allocation().next_block, 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(max_payload(512), 64 * 64 * 64 * 512);
        let dir = TempDir::new().unwrap();
        let mut bm = manipulator(&dir);
        let too_big = vec![0u8; max_payload(512) as usize + 1];
        assert!(matches!(write_extent(&mut bm, &too_big), Err(VfsError::Argument(_))));
    }
}
