// src/server.rs
//! In-process implementation of the remote collaborator.
//!
//! Keeps accounts, disk records and committed blocks in memory. The whole
//! state can be saved to a file so separate CLI runs share one "server".

use crate::error::{Result, VfsError};
use crate::remote::{AccountService, DiskDto, DiskOptionsDto, RemoteDisk, User};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Serialize, Deserialize, Clone, Debug)]
struct StoredUser {
    id: u64,
    login: String,
    hashed_password: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct StoredBlock {
    version: u64,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Staged {
    session: u64,
    version: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
    master: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct StoredDisk {
    record: DiskDto,
    options: DiskOptionsDto,
    master: Option<Vec<u8>>,
    blocks: BTreeMap<u64, StoredBlock>,
    staged: Option<Staged>,
}

impl StoredDisk {
    fn staged(&mut self, session: u64) -> Result<&mut Staged> {
        let disk_id = self.record.id;
        match self.staged.as_mut() {
            Some(staged) if staged.session == session => Ok(staged),
            _ => Err(VfsError::communication(format!("push session {} is not active on disk {}", session, disk_id))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ServerState {
    next_id: u64,
    users: BTreeMap<String, StoredUser>,
    disks: BTreeMap<u64, StoredDisk>,
}

impl ServerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn disk(&self, disk_id: u64) -> Result<&StoredDisk> {
        self.disks
        .get(&disk_id)
        .ok_or_else(|| VfsError::communication(format!("unknown disk {}", disk_id)))
    }

    fn disk_mut(&mut self, disk_id: u64) -> Result<&mut StoredDisk> {
        self.disks
        .get_mut(&disk_id)
        .ok_or_else(|| VfsError::communication(format!("unknown disk {}", disk_id)))
    }
}

#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a saved server; a missing file yields an empty server.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let state: ServerState = bincode::deserialize(&bytes)
        .map_err(|e| VfsError::format(format!("server state {}: {}", path.display(), e)))?;
        info!("Loaded server state with {} disks", state.disks.len());
        Ok(MemoryServer { state: Mutex::new(state) })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.lock()?;
        let bytes = bincode::serialize(&*state)
        .map_err(|e| VfsError::block(format!("cannot encode server state: {}", e)))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state.lock().map_err(|_| VfsError::communication("server state poisoned"))
    }
}

impl AccountService for MemoryServer {
    fn register(&self, login: &str, hashed_password: &str) -> Result<Option<User>> {
        let mut state = self.lock()?;
        if state.users.contains_key(login) {
            return Ok(None);
        }
        let id = state.allocate_id();
        let user = StoredUser { id, login: login.to_string(), hashed_password: hashed_password.to_string() };
        state.users.insert(login.to_string(), user);
        info!("Registered user {} as #{}", login, id);
        Ok(Some(User { id, login: login.to_string() }))
    }

    fn login(&self, login: &str, hashed_password: &str) -> Result<Option<User>> {
        let state = self.lock()?;
        Ok(state
        .users
        .get(login)
        .filter(|u| u.hashed_password == hashed_password)
        .map(|u| User { id: u.id, login: u.login.clone() }))
    }
}

impl RemoteDisk for MemoryServer {
    fn disks(&self, user_id: u64) -> Result<Vec<DiskDto>> {
        let state = self.lock()?;
        Ok(state.disks.values().filter(|d| d.record.user_id == user_id).map(|d| d.record.clone()).collect())
    }

    fn create_disk(&self, user_id: u64, mut options: DiskOptionsDto) -> Result<DiskDto> {
        let mut state = self.lock()?;
        if !state.users.values().any(|u| u.id == user_id) {
            return Err(VfsError::communication(format!("unknown user {}", user_id)));
        }
        let disk_id = state.allocate_id();
        options.id = state.allocate_id();
        options.disk_id = disk_id;
        let record = DiskDto { id: disk_id, user_id, last_server_version: 0, local_version: 0, newest_block: 0 };
        state.disks.insert(disk_id, StoredDisk {
            record: record.clone(),
            options,
            master: None,
            blocks: BTreeMap::new(),
            staged: None,
        });
        info!("Created disk {} for user {}", disk_id, user_id);
        Ok(record)
    }

    fn disk(&self, disk_id: u64) -> Result<DiskDto> {
        Ok(self.lock()?.disk(disk_id)?.record.clone())
    }

    fn disk_options(&self, disk_id: u64) -> Result<DiskOptionsDto> {
        Ok(self.lock()?.disk(disk_id)?.options.clone())
    }

    fn changed_blocks(&self, disk_id: u64, since: u64) -> Result<Vec<u64>> {
        let state = self.lock()?;
        Ok(state.disk(disk_id)?.blocks.iter().filter(|(_, b)| b.version > since).map(|(n, _)| *n).collect())
    }

    fn read_block(&self, disk_id: u64, block: u64) -> Result<Vec<u8>> {
        let state = self.lock()?;
        let disk = state.disk(disk_id)?;
        Ok(match disk.blocks.get(&block) {
            Some(stored) => stored.data.clone(),
            None => vec![0u8; disk.options.block_size as usize],
        })
    }

    fn read_master_block(&self, disk_id: u64) -> Result<Vec<u8>> {
        let state = self.lock()?;
        state
        .disk(disk_id)?
        .master
        .clone()
        .ok_or_else(|| VfsError::communication(format!("disk {} has no committed header", disk_id)))
    }

    fn begin_push(&self, disk_id: u64, version: u64) -> Result<u64> {
        let mut state = self.lock()?;
        let session = state.allocate_id();
        let disk = state.disk_mut(disk_id)?;
        let expected = disk.record.last_server_version + 1;
        if version != expected {
            return Err(VfsError::communication(format!(
                "disk {} expects version {}, got {}",
                disk_id, expected, version
            )));
        }
        if let Some(abandoned) = disk.staged.take() {
            debug!("Disk {}: discarding {} blocks of abandoned session {}", disk_id, abandoned.blocks.len(), abandoned.session);
        }
        disk.staged = Some(Staged { session, version, blocks: BTreeMap::new(), master: None });
        Ok(session)
    }

    fn write_block(&self, disk_id: u64, session: u64, block: u64, data: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        let disk = state.disk_mut(disk_id)?;
        if data.len() as u64 != disk.options.block_size {
            return Err(VfsError::communication(format!("block {} has {} bytes", block, data.len())));
        }
        disk.staged(session)?.blocks.insert(block, data.to_vec());
        Ok(())
    }

    fn write_master_block(&self, disk_id: u64, session: u64, data: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        let disk = state.disk_mut(disk_id)?;
        if data.len() as u64 != disk.options.master_block_size {
            return Err(VfsError::communication(format!("master block has {} bytes", data.len())));
        }
        disk.staged(session)?.master = Some(data.to_vec());
        Ok(())
    }

    fn commit(&self, session: u64, dto: &DiskDto) -> Result<DiskDto> {
        let mut state = self.lock()?;
        let disk = state.disk_mut(dto.id)?;
        let version = dto.last_server_version;
        let current = disk.record.last_server_version;
        let staged = disk.staged(session)?;
        if staged.version != version || version != current + 1 {
            return Err(VfsError::communication(format!(
                "disk {} is at version {}, cannot commit {}",
                dto.id, current, version
            )));
        }
        if staged.master.is_none() {
            return Err(VfsError::communication(format!("session {} staged no master block", session)));
        }
        let staged = match disk.staged.take() {
            Some(staged) => staged,
            None => return Err(VfsError::communication(format!("session {} vanished", session))),
        };

        let count = staged.blocks.len();
        for (block, data) in staged.blocks {
            disk.blocks.insert(block, StoredBlock { version, data });
        }
        disk.master = staged.master;
        disk.record.last_server_version = version;
        disk.record.local_version = dto.local_version;
        disk.record.newest_block = dto.newest_block;
        debug!("Disk {} committed version {} ({} blocks)", dto.id, version, count);
        Ok(disk.record.clone())
    }

    fn abort(&self, disk_id: u64, session: u64) -> Result<()> {
        let mut state = self.lock()?;
        let disk = state.disk_mut(disk_id)?;
        if disk.staged.as_ref().is_some_and(|s| s.session == session) {
            disk.staged = None;
            debug!("Disk {}: session {} aborted", disk_id, session);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options_dto() -> DiskOptionsDto {
        DiskOptionsDto {
            id: 0,
            disk_id: 0,
            block_size: 512,
            master_block_size: 1024,
            serialized_file_system_options: vec![1, 2, 3],
        }
    }

    fn server_with_disk() -> (MemoryServer, DiskDto) {
        let server = MemoryServer::new();
        let user = server.register("ada", "h").unwrap().unwrap();
        let disk = server.create_disk(user.id, options_dto()).unwrap();
        (server, disk)
    }

    #[test]
    fn accounts_register_once_and_check_hash() {
        let server = MemoryServer::new();
        let user = server.register("ada", "hash-1").unwrap().unwrap();
        assert!(server.register("ada", "other").unwrap().is_none());
        assert_eq!(server.login("ada", "hash-1").unwrap(), Some(user));
        assert!(server.login("ada", "hash-2").unwrap().is_none());
        assert!(server.login("bob", "hash-1").unwrap().is_none());
    }

    #[test]
    fn staged_writes_appear_only_after_commit() {
        let (server, disk) = server_with_disk();
        let session = server.begin_push(disk.id, 1).unwrap();
        server.write_block(disk.id, session, 3, &[7u8; 512]).unwrap();
        server.write_master_block(disk.id, session, &[1u8; 1024]).unwrap();
        assert!(server.changed_blocks(disk.id, 0).unwrap().is_empty());
        assert_eq!(server.read_block(disk.id, 3).unwrap(), vec![0u8; 512]);

        let committed = server
        .commit(session, &DiskDto { last_server_version: 1, local_version: 4, newest_block: 3, ..disk.clone() })
        .unwrap();
        assert_eq!(committed.last_server_version, 1);
        assert_eq!(committed.local_version, 4);
        assert_eq!(server.changed_blocks(disk.id, 0).unwrap(), vec![3]);
        assert!(server.changed_blocks(disk.id, 1).unwrap().is_empty());
        assert_eq!(server.read_block(disk.id, 3).unwrap(), vec![7u8; 512]);
    }

    #[test]
    fn stale_versions_are_refused() {
        let (server, disk) = server_with_disk();
        assert!(matches!(server.begin_push(disk.id, 2), Err(VfsError::Communication(_))));
        let session = server.begin_push(disk.id, 1).unwrap();
        server.write_master_block(disk.id, session, &[0u8; 1024]).unwrap();
        assert!(matches!(
            server.commit(session, &DiskDto { last_server_version: 2, ..disk.clone() }),
            Err(VfsError::Communication(_))
        ));
        assert!(matches!(server.read_master_block(disk.id), Err(VfsError::Communication(_))));
        assert!(matches!(server.disk(999), Err(VfsError::Communication(_))));
    }

    #[test]
    fn new_session_discards_abandoned_blocks() {
        let (server, disk) = server_with_disk();
        let abandoned = server.begin_push(disk.id, 1).unwrap();
        server.write_block(disk.id, abandoned, 5, &[9u8; 512]).unwrap();

        let session = server.begin_push(disk.id, 1).unwrap();
        assert_ne!(session, abandoned);
        assert!(matches!(server.write_block(disk.id, abandoned, 6, &[9u8; 512]), Err(VfsError::Communication(_))));
        server.write_block(disk.id, session, 2, &[4u8; 512]).unwrap();
        server.write_master_block(disk.id, session, &[1u8; 1024]).unwrap();
        assert!(matches!(
            server.commit(abandoned, &DiskDto { last_server_version: 1, ..disk.clone() }),
            Err(VfsError::Communication(_))
        ));
        server.commit(session, &DiskDto { last_server_version: 1, ..disk.clone() }).unwrap();

        assert_eq!(server.changed_blocks(disk.id, 0).unwrap(), vec![2]);
        assert_eq!(server.read_block(disk.id, 5).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn aborted_session_cannot_commit() {
        let (server, disk) = server_with_disk();
        let session = server.begin_push(disk.id, 1).unwrap();
        server.write_block(disk.id, session, 2, &[4u8; 512]).unwrap();
        server.write_master_block(disk.id, session, &[1u8; 1024]).unwrap();
        server.abort(disk.id, session).unwrap();
        server.abort(disk.id, session).unwrap();

        assert!(matches!(
            server.commit(session, &DiskDto { last_server_version: 1, ..disk.clone() }),
            Err(VfsError::Communication(_))
        ));
        assert_eq!(server.disk(disk.id).unwrap().last_server_version, 0);
        assert!(server.changed_blocks(disk.id, 0).unwrap().is_empty());
    }

    #[test]
    fn state_survives_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.bin");
        let (server, disk) = server_with_disk();
        server.save(&path).unwrap();

        let loaded = MemoryServer::load(&path).unwrap();
        assert_eq!(loaded.disk(disk.id).unwrap(), disk);
        assert_eq!(loaded.disk_options(disk.id).unwrap().disk_id, disk.id);
        assert!(loaded.login("ada", "h").unwrap().is_some());
    }
}
