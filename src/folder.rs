// src/folder.rs
//! Namespace tree kept in a flat arena.
//!
//! Folders refer to their parent by id, and to children through a
//! name-ordered index, so there are no ownership cycles.

use crate::error::{Result, VfsError};
use crate::indirect_node::Extent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderId(usize);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub extent: Extent,
    /// Length of the host bytes before encoding.
    pub size: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Folder {
    name: String,
    parent: Option<FolderId>,
    children: BTreeMap<String, FolderId>,
    files: BTreeMap<String, FileEntry>,
}

impl Folder {
    fn new(name: &str, parent: Option<FolderId>) -> Self {
        Folder { name: name.to_string(), parent, children: BTreeMap::new(), files: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    File { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// Splits `a/b//c/` into `["a", "b", "c"]`.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(VfsError::argument(format!("invalid name {:?}", name)));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderTree {
    nodes: Vec<Option<Folder>>,
    vacant: Vec<usize>,
}

impl Default for FolderTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderTree {
    pub fn new() -> Self {
        FolderTree { nodes: vec![Some(Folder::new("", None))], vacant: Vec::new() }
    }

    pub fn root(&self) -> FolderId {
        FolderId(0)
    }

    fn get(&self, id: FolderId) -> Result<&Folder> {
        self.nodes
        .get(id.0)
        .and_then(|n| n.as_ref())
        .ok_or_else(|| VfsError::not_found(format!("folder #{}", id.0)))
    }

    fn get_mut(&mut self, id: FolderId) -> Result<&mut Folder> {
        self.nodes
        .get_mut(id.0)
        .and_then(|n| n.as_mut())
        .ok_or_else(|| VfsError::not_found(format!("folder #{}", id.0)))
    }

    fn insert(&mut self, folder: Folder) -> FolderId {
        match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(folder);
                FolderId(slot)
            }
            None => {
                self.nodes.push(Some(folder));
                FolderId(self.nodes.len() - 1)
            }
        }
    }

    fn child(&self, id: FolderId, name: &str) -> Option<FolderId> {
        self.get(id).ok().and_then(|f| f.children.get(name).copied())
    }

    /// Walks `segments` from `from`, creating missing folders. Idempotent.
    pub fn create_folder(&mut self, from: FolderId, segments: &[&str]) -> Result<FolderId> {
        let mut current = from;
        self.get(current)?;
        for segment in segments {
            validate_name(segment)?;
        }
        for segment in segments {
            if let Some(existing) = self.child(current, segment) {
                current = existing;
                continue;
            }
            if self.get(current)?.files.contains_key(*segment) {
                return Err(VfsError::argument(format!("a file named {:?} already exists", segment)));
            }
            let id = self.insert(Folder::new(segment, Some(current)));
            self.get_mut(current)?.children.insert(segment.to_string(), id);
            current = id;
        }
        Ok(current)
    }

    /// True when every segment exists below `from`. Empty paths denote `from` itself.
    pub fn does_folder_exist(&self, from: FolderId, segments: &[&str]) -> bool {
        self.resolve(from, segments).is_ok()
    }

    pub fn resolve(&self, from: FolderId, segments: &[&str]) -> Result<FolderId> {
        let mut current = from;
        self.get(current)?;
        for segment in segments {
            current = self
            .child(current, segment)
            .ok_or_else(|| VfsError::not_found(format!("folder {:?}", segment)))?;
        }
        Ok(current)
    }

    pub fn name(&self, id: FolderId) -> Result<&str> {
        Ok(&self.get(id)?.name)
    }

    pub fn parent(&self, id: FolderId) -> Result<Option<FolderId>> {
        Ok(self.get(id)?.parent)
    }

    pub fn children(&self, id: FolderId) -> Result<Vec<(String, FolderId)>> {
        Ok(self.get(id)?.children.iter().map(|(n, c)| (n.clone(), *c)).collect())
    }

    pub fn file(&self, id: FolderId, name: &str) -> Result<Option<FileEntry>> {
        Ok(self.get(id)?.files.get(name).copied())
    }

    /// Stores `entry` under `name`, returning the entry it replaced.
    pub fn insert_file(&mut self, id: FolderId, name: &str, entry: FileEntry) -> Result<Option<FileEntry>> {
        validate_name(name)?;
        let folder = self.get_mut(id)?;
        if folder.children.contains_key(name) {
            return Err(VfsError::argument(format!("a folder named {:?} already exists", name)));
        }
        Ok(folder.files.insert(name.to_string(), entry))
    }

    pub fn remove_file(&mut self, id: FolderId, name: &str) -> Result<FileEntry> {
        self.get_mut(id)?
        .files
        .remove(name)
        .ok_or_else(|| VfsError::not_found(format!("file {:?}", name)))
    }

    /// Removes a folder and its subtree, returning every file it held.
    pub fn remove_folder(&mut self, id: FolderId) -> Result<Vec<FileEntry>> {
        let parent = self.get(id)?.parent.ok_or_else(|| VfsError::argument("the root folder cannot be removed"))?;
        let name = self.get(id)?.name.clone();
        self.get_mut(parent)?.children.remove(&name);

        let mut files = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(folder) = self.nodes.get_mut(current.0).and_then(Option::take) {
                files.extend(folder.files.into_values());
                stack.extend(folder.children.into_values());
                self.vacant.push(current.0);
            }
        }
        Ok(files)
    }

    /// True when `ancestor` is `id` or lies on its parent chain.
    pub fn is_within(&self, id: FolderId, ancestor: FolderId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).ok().and_then(|f| f.parent);
        }
        false
    }

    fn name_taken(&self, id: FolderId, name: &str) -> Result<bool> {
        let folder = self.get(id)?;
        Ok(folder.children.contains_key(name) || folder.files.contains_key(name))
    }

    pub fn move_folder(&mut self, id: FolderId, new_parent: FolderId, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let old_parent = self.get(id)?.parent.ok_or_else(|| VfsError::argument("the root folder cannot be moved"))?;
        if self.is_within(new_parent, id) {
            return Err(VfsError::argument("cannot move a folder into its own subtree"));
        }
        if self.name_taken(new_parent, new_name)? {
            return Err(VfsError::argument(format!("{:?} already exists", new_name)));
        }
        let old_name = self.get(id)?.name.clone();
        self.get_mut(old_parent)?.children.remove(&old_name);
        self.get_mut(new_parent)?.children.insert(new_name.to_string(), id);
        let folder = self.get_mut(id)?;
        folder.parent = Some(new_parent);
        folder.name = new_name.to_string();
        Ok(())
    }

    pub fn move_file(&mut self, from: FolderId, name: &str, to: FolderId, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        if self.name_taken(to, new_name)? {
            return Err(VfsError::argument(format!("{:?} already exists", new_name)));
        }
        let entry = self.remove_file(from, name)?;
        self.get_mut(to)?.files.insert(new_name.to_string(), entry);
        Ok(())
    }

    /// Absolute path of a folder, `/` for the root.
    pub fn path(&self, id: FolderId) -> Result<String> {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let folder = self.get(current)?;
            if folder.parent.is_some() {
                names.push(folder.name.clone());
            }
            cursor = folder.parent;
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Folders first, then files, each in ordinal name order.
    pub fn list(&self, id: FolderId) -> Result<Vec<DirEntry>> {
        let folder = self.get(id)?;
        let folders = folder.children.keys().map(|name| DirEntry { name: name.clone(), kind: EntryKind::Folder });
        let files = folder
        .files
        .iter()
        .map(|(name, entry)| DirEntry { name: name.clone(), kind: EntryKind::File { size: entry.size } });
        Ok(folders.chain(files).collect())
    }

    /// Every file extent in the tree.
    pub fn all_files(&self) -> Vec<FileEntry> {
        self.nodes.iter().flatten().flat_map(|f| f.files.values().copied()).collect()
    }
}
