// src/filesystem.rs
use crate::block_manipulator::BlockManipulator;
use crate::codec::{CompressionKind, EncryptionKind, Pipeline};
use crate::error::{Result, VfsError, WRONG_PASSWORD};
use crate::folder::{split_path, validate_name, DirEntry, FileEntry, FolderId, FolderTree};
use crate::indirect_node::{self, Extent};
use crate::options::{FileSystemOptions, PendingBlocks, SyncCounters, VolumeState};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Summary of an open container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub block_size: u64,
    pub master_block_size: u64,
    pub encryption: EncryptionKind,
    pub compression: CompressionKind,
    pub container_bytes: u64,
    pub allocated_blocks: u64,
    pub free_blocks: u64,
    pub disk_id: Option<u64>,
    pub local_version: u64,
    pub last_server_version: u64,
    /// `None` when every block is pending.
    pub pending_blocks: Option<usize>,
}

/// An open container: block engine, codec pipeline and namespace.
pub struct FileSystem {
    bm: BlockManipulator,
    options: FileSystemOptions,
    pipeline: Pipeline,
    state: VolumeState,
    tree: FolderTree,
    dirty: bool,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
        .field("location", &self.options.location())
        .field("state", &self.state)
        .finish()
    }
}

impl FileSystem {
    /// Creates a container at `options.location()` sized for `capacity` bytes.
    pub fn create(options: FileSystemOptions, capacity: u64) -> Result<Self> {
        let pipeline = options.pipeline()?;
        let bm = BlockManipulator::create(&options, capacity)?;
        let mut fs = FileSystem {
            bm,
            options,
            pipeline,
            state: VolumeState::default(),
            tree: FolderTree::new(),
            dirty: true,
        };
        fs.flush()?;
        Ok(fs)
    }

    /// Opens a container. Any header, key or namespace mismatch aborts the open.
    pub fn open(location: impl AsRef<Path>, password: &str) -> Result<Self> {
        let (mut bm, options, state) = BlockManipulator::open(location.as_ref(), password)?;
        let pipeline = options.pipeline()?;
        let tree = Self::load_tree(&mut bm, &pipeline, &state.root)?;
        debug!("Namespace loaded from extent {:?}", state.root);
        Ok(FileSystem { bm, options, pipeline, state, tree, dirty: false })
    }

    fn load_tree(bm: &mut BlockManipulator, pipeline: &Pipeline, root: &Extent) -> Result<FolderTree> {
        if root.is_empty() {
            return Ok(FolderTree::new());
        }
        let stored = indirect_node::read_extent(bm, root).map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        let bytes = pipeline.decorate_to_host(stored).map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        bincode::deserialize(&bytes).map_err(|_| VfsError::format(WRONG_PASSWORD))
    }

    pub fn options(&self) -> &FileSystemOptions {
        &self.options
    }

    /// Persists the namespace (if changed) and the header.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            let bytes = bincode::serialize(&self.tree)
            .map_err(|e| VfsError::block(format!("cannot encode namespace: {}", e)))?;
            let stored = self.pipeline.decorate_to_vfs(bytes)?;
            let extent = indirect_node::write_extent(&mut self.bm, &stored)?;
            let old = std::mem::replace(&mut self.state.root, extent);
            indirect_node::free_extent(&mut self.bm, &old)?;
            self.dirty = false;
        }

        let written = self.bm.take_written();
        if written.is_empty() {
            return Ok(());
        }
        self.state.sync.local_version += 1;
        self.state.sync.pending.extend(written);
        debug!("Flushed, local version now {}", self.state.sync.local_version);
        self.bm.save_config(&self.options, &self.state)
    }

    fn resolve_parent<'a>(&self, path: &'a str) -> Result<(FolderId, &'a str)> {
        let segments = split_path(path);
        let (name, parents) = segments
        .split_last()
        .ok_or_else(|| VfsError::argument(format!("{:?} does not name an entry", path)))?;
        let parent = self.tree.resolve(self.tree.root(), parents)?;
        Ok((parent, *name))
    }

    pub fn create_folder(&mut self, path: &str) -> Result<()> {
        let root = self.tree.root();
        self.tree.create_folder(root, &split_path(path))?;
        self.dirty = true;
        self.flush()
    }

    pub fn folder_exists(&self, path: &str) -> bool {
        self.tree.does_folder_exist(self.tree.root(), &split_path(path))
    }

    pub fn file_exists(&self, path: &str) -> bool {
        match self.resolve_parent(path) {
            Ok((parent, name)) => matches!(self.tree.file(parent, name), Ok(Some(_))),
            Err(_) => false,
        }
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let folder = self.tree.resolve(self.tree.root(), &split_path(path))?;
        self.tree.list(folder)
    }

    /// Every folder path below `path`, depth first, with its listing.
    pub fn walk(&self, path: &str) -> Result<Vec<(String, Vec<DirEntry>)>> {
        let start = self.tree.resolve(self.tree.root(), &split_path(path))?;
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(folder) = stack.pop() {
            out.push((self.tree.path(folder)?, self.tree.list(folder)?));
            let mut children = self.tree.children(folder)?;
            children.reverse();
            stack.extend(children.into_iter().map(|(_, id)| id));
        }
        Ok(out)
    }

    /// Stores `data` at `path`, replacing an existing file.
    pub fn import(&mut self, data: &[u8], path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        validate_name(name)?;
        if self.tree.does_folder_exist(parent, &[name]) {
            return Err(VfsError::argument(format!("{} is a folder", path)));
        }

        let stored = self.pipeline.decorate_to_vfs(data.to_vec())?;
        let extent = indirect_node::write_extent(&mut self.bm, &stored)?;
        let entry = FileEntry { extent, size: data.len() as u64 };
        let replaced = match self.tree.insert_file(parent, name, entry) {
            Ok(replaced) => replaced,
            Err(e) => {
                indirect_node::free_extent(&mut self.bm, &extent)?;
                self.flush()?;
                return Err(e);
            }
        };
        if let Some(old) = replaced {
            indirect_node::free_extent(&mut self.bm, &old.extent)?;
        }
        info!("Imported {} bytes to {} ({} stored)", data.len(), path, extent.len);
        self.dirty = true;
        self.flush()
    }

    pub fn import_host_file(&mut self, host_path: &Path, path: &str) -> Result<()> {
        let data = std::fs::read(host_path)?;
        self.import(&data, path)
    }

    pub fn export(&mut self, path: &str) -> Result<Vec<u8>> {
        let (parent, name) = self.resolve_parent(path)?;
        let entry = self
        .tree
        .file(parent, name)?
        .ok_or_else(|| VfsError::not_found(format!("file {}", path)))?;
        let stored = indirect_node::read_extent(&mut self.bm, &entry.extent)?;
        let data = self.pipeline.decorate_to_host(stored)?;
        if data.len() as u64 != entry.size {
            return Err(VfsError::block(format!("{} decoded to {} bytes, expected {}", path, data.len(), entry.size)));
        }
        Ok(data)
    }

    pub fn export_to_host(&mut self, path: &str, host_path: &Path) -> Result<()> {
        let data = self.export(path)?;
        std::fs::write(host_path, data)?;
        Ok(())
    }

    /// Deletes a file, or a folder with everything below it.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let freed = if let Ok(folder) = self.tree.resolve(parent, &[name]) {
            self.tree.remove_folder(folder)?
        } else {
            vec![self.tree.remove_file(parent, name)?]
        };
        for entry in &freed {
            indirect_node::free_extent(&mut self.bm, &entry.extent)?;
        }
        info!("Deleted {} ({} files)", path, freed.len());
        self.dirty = true;
        self.flush()
    }

    /// Moves or renames a file or folder. The target's parent must exist.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (src_parent, src_name) = self.resolve_parent(from)?;
        let (dst_parent, dst_name) = self.resolve_parent(to)?;
        match self.tree.resolve(src_parent, &[src_name]) {
            Ok(folder) => self.tree.move_folder(folder, dst_parent, dst_name)?,
            Err(_) => self.tree.move_file(src_parent, src_name, dst_parent, dst_name)?,
        }
        self.dirty = true;
        self.flush()
    }

    pub fn info(&mut self) -> Result<VolumeInfo> {
        let allocation = self.bm.allocation();
        Ok(VolumeInfo {
            block_size: self.options.block_size(),
            master_block_size: self.options.master_block_size(),
            encryption: self.options.encryption(),
            compression: self.options.compression(),
            container_bytes: self.bm.len_bytes()?,
            allocated_blocks: allocation.next_block - 1,
            free_blocks: self.bm.free_list_len()?,
            disk_id: self.state.sync.disk_id,
            local_version: self.state.sync.local_version,
            last_server_version: self.state.sync.last_server_version,
            pending_blocks: match &self.state.sync.pending {
                PendingBlocks::List(set) => Some(set.len()),
                PendingBlocks::All => None,
            },
        })
    }

    // --- Sync support ---

    pub(crate) fn sync_counters(&self) -> &SyncCounters {
        &self.state.sync
    }

    pub(crate) fn pending_blocks(&self) -> BTreeSet<u64> {
        self.state.sync.pending.resolve(self.bm.allocation().next_block)
    }

    pub(crate) fn newest_block(&self) -> u64 {
        self.bm.allocation().next_block.saturating_sub(1)
    }

    pub(crate) fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        self.bm.read_block(block)
    }

    /// Header as the server should store it once `version` is committed.
    pub(crate) fn master_block_at(&self, disk_id: u64, version: u64) -> Result<Vec<u8>> {
        let mut state = self.state.clone();
        state.allocation = self.bm.allocation();
        state.sync = SyncCounters {
            disk_id: Some(disk_id),
            local_version: version,
            last_server_version: version,
            pending: PendingBlocks::default(),
        };
        self.options.encode_header(&state)
    }

    /// Writes pulled blocks and adopts the pulled header's volume state.
    ///
    /// The header must describe server `version`. The namespace and free list
    /// are decoded from the pulled blocks before any of them reaches the
    /// container, and pulled blocks are not marked pending.
    pub(crate) fn apply_remote(&mut self, master: &[u8], blocks: Vec<(u64, Vec<u8>)>, version: u64) -> Result<()> {
        let (persisted, remote) = FileSystemOptions::decode_header(master)?;
        if !self.options.same_layout(&persisted) {
            return Err(VfsError::format("remote disk does not share this container's layout"));
        }
        if remote.sync.last_server_version != version {
            return Err(VfsError::communication(format!(
                "pulled header describes version {}, expected {}",
                remote.sync.last_server_version, version
            )));
        }

        self.bm.set_overlay(blocks.into_iter().collect())?;
        let checked = self.check_remote(&remote);
        let overlay = self.bm.take_overlay();
        let (tree, free) = checked?;

        for (block, data) in &overlay {
            self.bm.restore_block(*block, data)?;
        }
        self.bm.adopt_allocation(remote.allocation, free);
        self.tree = tree;
        self.state.root = remote.root;
        self.state.allocation = remote.allocation;
        self.dirty = false;
        Ok(())
    }

    fn check_remote(&mut self, remote: &VolumeState) -> Result<(FolderTree, HashSet<u64>)> {
        let tree = Self::load_tree(&mut self.bm, &self.pipeline, &remote.root)?;
        let free = self.bm.walk_free_list(remote.allocation)?;
        Ok((tree, free))
    }

    /// Records a completed cycle at server `version`.
    pub(crate) fn mark_synced(&mut self, disk_id: u64, version: u64) -> Result<()> {
        self.bm.take_written();
        self.state.sync = SyncCounters {
            disk_id: Some(disk_id),
            local_version: version,
            last_server_version: version,
            pending: PendingBlocks::default(),
        };
        self.bm.save_config(&self.options, &self.state)
    }

    /// Links the container to a freshly created remote disk; every block is pending.
    pub(crate) fn mark_published(&mut self, disk_id: u64) -> Result<()> {
        self.state.sync.disk_id = Some(disk_id);
        self.state.sync.last_server_version = 0;
        self.state.sync.local_version = self.state.sync.local_version.max(1);
        self.state.sync.pending = PendingBlocks::All;
        self.bm.save_config(&self.options, &self.state)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if let Err(e) = self.flush().and_then(|_| self.bm.sync()) {
            warn!("Final flush of {:?} failed: {}", self.options.location(), e);
        }
    }
}
