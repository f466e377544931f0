// src/lib.rs
//! Encrypted, compressed single-file virtual disks with optional
//! block-level synchronization against a remote server.

pub mod block_manipulator;
pub mod codec;
pub mod error;
pub mod filesystem;
pub mod folder;
pub mod indirect_node;
pub mod options;
pub mod position;
pub mod remote;
pub mod server;
pub mod sync;

pub use codec::{CompressionKind, EncryptionKind};
pub use error::{Result, VfsError};
pub use filesystem::{FileSystem, VolumeInfo};
pub use folder::{DirEntry, EntryKind};
pub use options::{FileSystemOptions, KdfParams};
pub use remote::{AccountService, DiskDto, RemoteDisk, User};
pub use server::MemoryServer;
pub use sync::{CancellationToken, ConflictPolicy, SyncEngine, SyncEvent, SyncHandle, SyncState};
