// src/remote.rs
//! Shapes exchanged with the remote collaborator.
//!
//! Transport and hosting are not modelled here; any implementation of
//! [`RemoteDisk`] reports unreachable endpoints and protocol faults as
//! [`VfsError::Communication`](crate::error::VfsError::Communication).

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Server-side record of one disk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DiskDto {
    pub id: u64,
    pub user_id: u64,
    pub last_server_version: u64,
    pub local_version: u64,
    pub newest_block: u64,
}

/// Layout needed to materialize a compatible local container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DiskOptionsDto {
    pub id: u64,
    pub disk_id: u64,
    pub block_size: u64,
    pub master_block_size: u64,
    pub serialized_file_system_options: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub login: String,
}

/// Account store. Passwords arrive already one-way hashed.
pub trait AccountService: Send + Sync {
    fn register(&self, login: &str, hashed_password: &str) -> Result<Option<User>>;
    fn login(&self, login: &str, hashed_password: &str) -> Result<Option<User>>;
}

/// Block-level disk storage on the server.
///
/// A push opens a session for version `last_server_version + 1`. Writes made
/// through that session stay invisible until [`RemoteDisk::commit`] publishes
/// them. Opening a new session discards whatever an earlier, unfinished one
/// had staged, so stray blocks never reach a committed version.
pub trait RemoteDisk: Send + Sync {
    fn disks(&self, user_id: u64) -> Result<Vec<DiskDto>>;
    fn create_disk(&self, user_id: u64, options: DiskOptionsDto) -> Result<DiskDto>;
    fn disk(&self, disk_id: u64) -> Result<DiskDto>;
    fn disk_options(&self, disk_id: u64) -> Result<DiskOptionsDto>;
    /// Blocks whose committed version is greater than `since`.
    fn changed_blocks(&self, disk_id: u64, since: u64) -> Result<Vec<u64>>;
    fn read_block(&self, disk_id: u64, block: u64) -> Result<Vec<u8>>;
    fn read_master_block(&self, disk_id: u64) -> Result<Vec<u8>>;
    /// Starts staging `version` and returns the session that owns it.
    fn begin_push(&self, disk_id: u64, version: u64) -> Result<u64>;
    fn write_block(&self, disk_id: u64, session: u64, block: u64, data: &[u8]) -> Result<()>;
    fn write_master_block(&self, disk_id: u64, session: u64, data: &[u8]) -> Result<()>;
    /// Publishes `disk.last_server_version` along with everything `session` staged.
    fn commit(&self, session: u64, disk: &DiskDto) -> Result<DiskDto>;
    /// Drops what `session` staged. Unknown or finished sessions are ignored.
    fn abort(&self, disk_id: u64, session: u64) -> Result<()>;
}
