// src/block_manipulator.rs
use crate::error::{Result, VfsError};
use crate::options::{AllocationState, FileSystemOptions, VolumeState};
use crate::position::PositionCalculator;
use log::{debug, info};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const LINK_SIZE: usize = 8;

/// Fixed-size block I/O over a single container file.
///
/// Owns the OS handle for the lifetime of an open file system. Block locks
/// are advisory, non-reentrant and fail fast.
#[derive(Debug)]
pub struct BlockManipulator {
    file: File,
    calc: PositionCalculator,
    locks: HashSet<u64>,
    allocation: AllocationState,
    // Members of the free list, mirrored from the on-disk links.
    free: HashSet<u64>,
    // Blocks written since the last `take_written`.
    written: BTreeSet<u64>,
    // Pending remote blocks, visible to reads but not yet on disk.
    overlay: HashMap<u64, Vec<u8>>,
}

impl BlockManipulator {
    /// Creates a new container sized for `capacity` bytes of blocks.
    pub fn create(options: &FileSystemOptions, capacity: u64) -> Result<Self> {
        if options.is_unset() {
            return Err(VfsError::argument("file system options are not set"));
        }
        let location = options.location();
        if location.exists() {
            return Err(VfsError::argument(format!("{} already exists", location.display())));
        }

        let calc = PositionCalculator::new(options.block_size(), options.master_block_size());
        let blocks = capacity.div_ceil(calc.block_size());
        if blocks == 0 {
            return Err(VfsError::argument("capacity must hold at least one block"));
        }

        let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(location)?;
        file.set_len(calc.offset(blocks))?;
        info!("Created container {:?} with {} blocks of {} bytes", location, blocks, calc.block_size());

        let mut manipulator = BlockManipulator {
            file,
            calc,
            locks: HashSet::new(),
            allocation: AllocationState::default(),
            free: HashSet::new(),
            written: BTreeSet::new(),
            overlay: HashMap::new(),
        };
        manipulator.save_config(options, &VolumeState::default())?;
        Ok(manipulator)
    }

    /// Opens an existing container, validating `password` against its header.
    pub fn open(location: &Path, password: &str) -> Result<(Self, FileSystemOptions, VolumeState)> {
        if !location.exists() {
            return Err(VfsError::not_found(format!("{}", location.display())));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(location)?;
        file.seek(SeekFrom::Start(0))?;
        let (options, state) = FileSystemOptions::deserialize(&mut file, password, location)?;
        info!("Opened container {:?}", location);

        let mut manipulator = BlockManipulator {
            file,
            calc: PositionCalculator::new(options.block_size(), options.master_block_size()),
            locks: HashSet::new(),
            allocation: state.allocation,
            free: HashSet::new(),
            written: BTreeSet::new(),
            overlay: HashMap::new(),
        };
        manipulator.free = manipulator.walk_free_list(state.allocation)?;
        Ok((manipulator, options, state))
    }

    pub fn position(&self) -> &PositionCalculator {
        &self.calc
    }

    pub fn block_size(&self) -> usize {
        self.calc.block_size() as usize
    }

    /// Writes the header into `[0, master_block_size)`.
    ///
    /// The allocation fields of `state` are replaced by this manipulator's own.
    pub fn save_config(&mut self, options: &FileSystemOptions, state: &VolumeState) -> Result<()> {
        if options.is_unset() {
            return Err(VfsError::argument("file system options are not set"));
        }
        let mut state = state.clone();
        state.allocation = self.allocation;
        let bytes = options.encode_header(&state)?;
        self.write_master_block(&bytes)
    }

    pub fn read_master_block(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.calc.master_block_size() as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_master_block(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != self.calc.master_block_size() {
            return Err(VfsError::argument(format!(
                "master block must be {} bytes, got {}",
                self.calc.master_block_size(),
                bytes.len()
            )));
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn lock_block(&mut self, block: u64) -> Result<()> {
        if !self.locks.insert(block) {
            return Err(VfsError::block(format!("block {} is already locked", block)));
        }
        Ok(())
    }

    pub fn unlock_block(&mut self, block: u64) -> Result<()> {
        if !self.locks.remove(&block) {
            return Err(VfsError::block(format!("block {} is not locked", block)));
        }
        Ok(())
    }

    pub fn is_locked(&self, block: u64) -> bool {
        self.locks.contains(&block)
    }

    /// Reads exactly one block. Blocks past EOF read as zeros.
    pub fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        if let Some(data) = self.overlay.get(&block) {
            return Ok(data.clone());
        }
        let mut buf = vec![0u8; self.block_size()];
        let offset = self.calc.offset(block);
        let len = self.file.metadata()?.len();
        if offset + buf.len() as u64 > len {
            return Ok(buf);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes exactly one block, holding its lock for the duration.
    pub fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        self.lock_block(block)?;
        let result = self.write_raw(block, data);
        self.unlock_block(block)?;
        result?;
        self.written.insert(block);
        Ok(())
    }

    /// Read-modify-write of one block under its lock.
    pub fn modify_block<F>(&mut self, block: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        self.lock_block(block)?;
        let result = self.read_block(block).and_then(|mut buf| {
            f(&mut buf);
            self.write_raw(block, &buf)
        });
        self.unlock_block(block)?;
        result?;
        self.written.insert(block);
        Ok(())
    }

    /// Writes a block received from a remote copy without marking it pending.
    pub fn restore_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        self.lock_block(block)?;
        let result = self.write_raw(block, data);
        self.unlock_block(block)?;
        result
    }

    /// Makes `blocks` visible to reads without writing them.
    pub fn set_overlay(&mut self, blocks: HashMap<u64, Vec<u8>>) -> Result<()> {
        for (block, data) in &blocks {
            if *block == 0 || data.len() != self.block_size() {
                return Err(VfsError::argument(format!("overlay block {} is malformed", block)));
            }
        }
        self.overlay = blocks;
        Ok(())
    }

    pub fn take_overlay(&mut self) -> HashMap<u64, Vec<u8>> {
        std::mem::take(&mut self.overlay)
    }

    fn write_raw(&mut self, block: u64, data: &[u8]) -> Result<()> {
        if block == 0 {
            return Err(VfsError::argument("block 0 is reserved"));
        }
        if data.len() != self.block_size() {
            return Err(VfsError::argument(format!(
                "block payload must be {} bytes, got {}",
                self.block_size(),
                data.len()
            )));
        }
        self.file.seek(SeekFrom::Start(self.calc.offset(block)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Hands out an unused block: free-list head first, else a fresh one.
    pub fn allocate_block(&mut self) -> Result<u64> {
        let head = self.allocation.free_list_head;
        if head != 0 {
            let buf = self.read_block(head)?;
            let mut link = [0u8; LINK_SIZE];
            link.copy_from_slice(&buf[..LINK_SIZE]);
            let next = u64::from_le_bytes(link);
            if next >= self.allocation.next_block || next == head {
                return Err(VfsError::block(format!("free list corrupt at block {}", head)));
            }
            self.allocation.free_list_head = next;
            self.free.remove(&head);
            debug!("Reusing free block {}", head);
            return Ok(head);
        }

        let block = self.allocation.next_block;
        self.allocation.next_block += 1;

        let end = self.calc.offset(block + 1);
        if self.file.metadata()?.len() < end {
            debug!("Extending container to {} bytes", end);
            self.file.set_len(end)?;
        }
        debug!("Allocated block {}", block);
        Ok(block)
    }

    /// Returns `block` to the free list.
    pub fn free_block(&mut self, block: u64) -> Result<()> {
        if block == 0 || block >= self.allocation.next_block {
            return Err(VfsError::argument(format!("block {} was never allocated", block)));
        }
        if self.free.contains(&block) {
            return Err(VfsError::block(format!("block {} is already free", block)));
        }
        let mut buf = vec![0u8; self.block_size()];
        buf[..LINK_SIZE].copy_from_slice(&self.allocation.free_list_head.to_le_bytes());
        self.write_block(block, &buf)?;
        self.allocation.free_list_head = block;
        self.free.insert(block);
        debug!("Freed block {}", block);
        Ok(())
    }

    /// Follows the free list of `allocation`, rejecting cycles and out-of-range links.
    pub fn walk_free_list(&mut self, allocation: AllocationState) -> Result<HashSet<u64>> {
        let mut members = HashSet::new();
        let mut cursor = allocation.free_list_head;
        while cursor != 0 {
            if cursor >= allocation.next_block || !members.insert(cursor) {
                return Err(VfsError::block(format!("free list corrupt at block {}", cursor)));
            }
            let buf = self.read_block(cursor)?;
            let mut link = [0u8; LINK_SIZE];
            link.copy_from_slice(&buf[..LINK_SIZE]);
            cursor = u64::from_le_bytes(link);
        }
        Ok(members)
    }

    pub fn free_list_len(&mut self) -> Result<u64> {
        Ok(self.walk_free_list(self.allocation)?.len() as u64)
    }

    pub fn allocation(&self) -> AllocationState {
        self.allocation
    }

    /// Replaces the allocation state; `free` must be its walked free list.
    pub fn adopt_allocation(&mut self, allocation: AllocationState, free: HashSet<u64>) {
        self.allocation = allocation;
        self.free = free;
    }

    pub fn take_written(&mut self) -> BTreeSet<u64> {
        std::mem::take(&mut self.written)
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
