// src/options.rs
//! Container configuration and the super-block header.
//!
//! The header occupies `[0, master_block_size)` and is a bincode record:
//! magic, format version, the immutable [`PersistedOptions`] and the mutable
//! [`VolumeState`], zero padded to the master block size.

use crate::codec::{CompressionKind, EncryptionKind, KeyMaterial, Pipeline, IV_SIZE, KEY_SIZE};
use crate::error::{Result, VfsError, WRONG_PASSWORD};
use crate::indirect_node::Extent;
use argon2::{Algorithm, Argon2, Params, Version};
use bincode::Options;
use log::{debug, warn};
use rand::{RngCore, thread_rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const HEADER_MAGIC: &[u8; 8] = b"VDISKHDR";
const HEADER_VERSION: u32 = 1;
const SALT_SIZE: usize = 16;
const VERIFIER_SIZE: usize = 32;
const DERIVED_SIZE: usize = KEY_SIZE + IV_SIZE + VERIFIER_SIZE;
const CANARY: &[u8; 16] = b"VAULTDISK-CANARY";

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_MASTER_BLOCK_SIZE: u64 = 8192;
pub const MIN_BLOCK_SIZE: u64 = 512;
pub const MAX_BLOCK_SIZE: u64 = 1024 * 1024;
pub const MIN_MASTER_BLOCK_SIZE: u64 = 512;
pub const MAX_MASTER_BLOCK_SIZE: u64 = 64 * MAX_BLOCK_SIZE;

/// Argon2id cost parameters, stored so that every client derives the same key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    /// Low-cost profile for tests and constrained hosts.
    pub fn light() -> Self {
        KdfParams { m_cost: 64, t_cost: 1, p_cost: 1 }
    }

    fn derive(&self, password: &str, salt: &[u8]) -> Result<[u8; DERIVED_SIZE]> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, None)
        .map_err(|e| VfsError::argument(format!("invalid KDF parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; DERIVED_SIZE];
        argon2.hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| VfsError::argument(format!("key derivation failed: {}", e)))?;
        Ok(out)
    }
}

/// The part of [`FileSystemOptions`] written to disk. Fixed at creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedOptions {
    pub block_size: u64,
    pub master_block_size: u64,
    pub encryption: EncryptionKind,
    pub compression: CompressionKind,
    pub kdf: KdfParams,
    salt: [u8; SALT_SIZE],
    verifier: [u8; VERIFIER_SIZE],
    canary: Vec<u8>,
}

/// Next never-used block number and head of the free-block list (0 = empty).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationState {
    pub next_block: u64,
    pub free_list_head: u64,
}

impl Default for AllocationState {
    fn default() -> Self {
        // Block 0 is the sentinel and is never handed out.
        AllocationState { next_block: 1, free_list_head: 0 }
    }
}

/// Blocks written since the last completed sync cycle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum PendingBlocks {
    List(BTreeSet<u64>),
    /// Too many to track in the header; every allocated block is pending.
    All,
}

impl Default for PendingBlocks {
    fn default() -> Self {
        PendingBlocks::List(BTreeSet::new())
    }
}

impl PendingBlocks {
    pub fn is_empty(&self) -> bool {
        match self {
            PendingBlocks::List(set) => set.is_empty(),
            PendingBlocks::All => false,
        }
    }

    pub fn extend<I: IntoIterator<Item = u64>>(&mut self, blocks: I) {
        if let PendingBlocks::List(set) = self {
            set.extend(blocks);
        }
    }

    /// Concrete block numbers, given the allocation high-water mark.
    pub fn resolve(&self, next_block: u64) -> BTreeSet<u64> {
        match self {
            PendingBlocks::List(set) => set.clone(),
            PendingBlocks::All => (1..next_block).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub disk_id: Option<u64>,
    pub local_version: u64,
    pub last_server_version: u64,
    pub pending: PendingBlocks,
}

/// Mutable super-block fields.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeState {
    pub root: Extent,
    pub allocation: AllocationState,
    pub sync: SyncCounters,
}

#[derive(Serialize)]
struct HeaderRef<'a> {
    magic: [u8; 8],
    version: u32,
    options: &'a PersistedOptions,
    state: &'a VolumeState,
}

#[derive(Deserialize)]
struct Header {
    magic: [u8; 8],
    version: u32,
    options: PersistedOptions,
    state: VolumeState,
}

/// Container configuration. The default value is "unset" and cannot be saved.
#[derive(Clone, Debug, Default)]
pub struct FileSystemOptions {
    location: PathBuf,
    persisted: Option<PersistedOptions>,
    keys: Option<KeyMaterial>,
}

pub struct FileSystemOptionsBuilder {
    location: PathBuf,
    block_size: u64,
    master_block_size: u64,
    encryption: EncryptionKind,
    compression: CompressionKind,
    kdf: KdfParams,
}

impl FileSystemOptionsBuilder {
    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn master_block_size(mut self, master_block_size: u64) -> Self {
        self.master_block_size = master_block_size;
        self
    }

    pub fn encryption(mut self, encryption: EncryptionKind) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    pub fn kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Validates the layout, generates a salt and derives the key material.
    pub fn build(self, password: &str) -> Result<FileSystemOptions> {
        validate_layout(self.block_size, self.master_block_size)?;

        let mut salt = [0u8; SALT_SIZE];
        thread_rng().fill_bytes(&mut salt);
        debug!("Generated salt {}", hex::encode(salt));

        let (keys, verifier) = split_derived(&self.kdf.derive(password, &salt)?);
        let pipeline = Pipeline::new(CompressionKind::None, self.encryption, &keys);
        let canary = pipeline.decorate_to_vfs(canary_plaintext(
            self.block_size,
            self.master_block_size,
            self.encryption,
            self.compression,
            self.kdf,
        )?)?;

        Ok(FileSystemOptions {
            location: self.location,
            persisted: Some(PersistedOptions {
                block_size: self.block_size,
                master_block_size: self.master_block_size,
                encryption: self.encryption,
                compression: self.compression,
                kdf: self.kdf,
                salt,
                verifier,
                canary,
            }),
            keys: Some(keys),
        })
    }
}

/// Checks block sizes before they are used for any arithmetic.
pub fn validate_layout(block_size: u64, master_block_size: u64) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(VfsError::argument(format!(
            "block size {} must be a power of two in [{}, {}]",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    if !(MIN_MASTER_BLOCK_SIZE..=MAX_MASTER_BLOCK_SIZE).contains(&master_block_size) {
        return Err(VfsError::argument(format!(
            "master block size {} must be in [{}, {}]",
            master_block_size, MIN_MASTER_BLOCK_SIZE, MAX_MASTER_BLOCK_SIZE
        )));
    }
    Ok(())
}

// The canary carries the layout, so a tampered header fails the key check.
fn canary_plaintext(
    block_size: u64,
    master_block_size: u64,
    encryption: EncryptionKind,
    compression: CompressionKind,
    kdf: KdfParams,
) -> Result<Vec<u8>> {
    bincode::serialize(&(CANARY, block_size, master_block_size, encryption, compression, kdf))
    .map_err(|e| VfsError::block(format!("cannot encode canary: {}", e)))
}

fn split_derived(derived: &[u8; DERIVED_SIZE]) -> (KeyMaterial, [u8; VERIFIER_SIZE]) {
    let mut keys = KeyMaterial { key: [0u8; KEY_SIZE], iv: [0u8; IV_SIZE] };
    keys.key.copy_from_slice(&derived[0..KEY_SIZE]);
    keys.iv.copy_from_slice(&derived[KEY_SIZE..KEY_SIZE + IV_SIZE]);
    let mut verifier = [0u8; VERIFIER_SIZE];
    verifier.copy_from_slice(&derived[KEY_SIZE + IV_SIZE..]);
    (keys, verifier)
}

fn header_codec(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
    .with_fixint_encoding()
    .allow_trailing_bytes()
    .with_limit(limit)
}

impl FileSystemOptions {
    pub fn builder(location: impl Into<PathBuf>) -> FileSystemOptionsBuilder {
        FileSystemOptionsBuilder {
            location: location.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            master_block_size: DEFAULT_MASTER_BLOCK_SIZE,
            encryption: EncryptionKind::default(),
            compression: CompressionKind::default(),
            kdf: KdfParams::default(),
        }
    }

    /// Rebuilds options from persisted fields, re-deriving the key from `password`.
    pub fn unlock(persisted: PersistedOptions, password: &str, location: impl Into<PathBuf>) -> Result<Self> {
        debug!("Deriving key material...");
        let derived = persisted.kdf.derive(password, &persisted.salt)
        .map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        let (keys, verifier) = split_derived(&derived);

        let options = FileSystemOptions {
            location: location.into(),
            persisted: Some(persisted),
            keys: Some(keys),
        };
        if !options.test_encryption_key(&verifier) {
            return Err(VfsError::format(WRONG_PASSWORD));
        }
        Ok(options)
    }

    /// Checks the derived key against the stored verifier and canary.
    pub fn test_encryption_key(&self, verifier: &[u8; VERIFIER_SIZE]) -> bool {
        let (persisted, keys) = match (&self.persisted, &self.keys) {
            (Some(p), Some(k)) => (p, k),
            _ => return false,
        };
        if &persisted.verifier != verifier {
            return false;
        }
        let expected = match canary_plaintext(
            persisted.block_size,
            persisted.master_block_size,
            persisted.encryption,
            persisted.compression,
            persisted.kdf,
        ) {
            Ok(expected) => expected,
            Err(_) => return false,
        };
        let pipeline = Pipeline::new(CompressionKind::None, persisted.encryption, keys);
        match pipeline.decorate_to_host(persisted.canary.clone()) {
            Ok(plain) => plain == expected,
            Err(_) => false,
        }
    }

    pub fn is_unset(&self) -> bool {
        match &self.persisted {
            Some(p) => p.block_size == 0 || p.master_block_size == 0 || self.keys.is_none(),
            None => true,
        }
    }

    fn persisted(&self) -> Result<&PersistedOptions> {
        self.persisted.as_ref().ok_or_else(|| VfsError::argument("file system options are not set"))
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn block_size(&self) -> u64 {
        self.persisted.as_ref().map_or(0, |p| p.block_size)
    }

    pub fn master_block_size(&self) -> u64 {
        self.persisted.as_ref().map_or(0, |p| p.master_block_size)
    }

    pub fn encryption(&self) -> EncryptionKind {
        self.persisted.as_ref().map_or(EncryptionKind::None, |p| p.encryption)
    }

    pub fn compression(&self) -> CompressionKind {
        self.persisted.as_ref().map_or(CompressionKind::None, |p| p.compression)
    }

    pub fn pipeline(&self) -> Result<Pipeline> {
        let persisted = self.persisted()?;
        let keys = self.keys.as_ref().ok_or_else(|| VfsError::argument("key material missing"))?;
        Ok(Pipeline::new(persisted.compression, persisted.encryption, keys))
    }

    /// Whether both option sets describe the same container layout and key.
    pub fn same_layout(&self, other: &PersistedOptions) -> bool {
        self.persisted.as_ref() == Some(other)
    }

    /// Bytes of the persisted options, as exchanged with a remote server.
    pub fn to_serialized(&self) -> Result<Vec<u8>> {
        bincode::serialize(self.persisted()?)
        .map_err(|e| VfsError::block(format!("cannot encode options: {}", e)))
    }

    pub fn from_serialized(bytes: &[u8], password: &str, location: impl Into<PathBuf>) -> Result<Self> {
        let persisted: PersistedOptions = header_codec(bytes.len() as u64).deserialize(bytes)
        .map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        validate_layout(persisted.block_size, persisted.master_block_size)
        .map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        Self::unlock(persisted, password, location)
    }

    /// Encodes the header into exactly `master_block_size` bytes.
    ///
    /// An oversized pending list collapses to [`PendingBlocks::All`].
    pub fn encode_header(&self, state: &VolumeState) -> Result<Vec<u8>> {
        if self.is_unset() {
            return Err(VfsError::argument("file system options are not set"));
        }
        let persisted = self.persisted()?;
        let limit = persisted.master_block_size;

        let encode = |state: &VolumeState| {
            let header = HeaderRef { magic: *HEADER_MAGIC, version: HEADER_VERSION, options: persisted, state };
            bincode::serialize(&header).map_err(|e| VfsError::block(format!("cannot encode header: {}", e)))
        };

        let mut bytes = encode(state)?;
        if bytes.len() as u64 > limit && state.sync.pending != PendingBlocks::All {
            warn!("Pending block list does not fit in the header, marking every block pending");
            let mut collapsed = state.clone();
            collapsed.sync.pending = PendingBlocks::All;
            bytes = encode(&collapsed)?;
        }
        if bytes.len() as u64 > limit {
            return Err(VfsError::block(format!(
                "header needs {} bytes but the master block holds {}",
                bytes.len(),
                limit
            )));
        }
        bytes.resize(limit as usize, 0);
        Ok(bytes)
    }

    pub fn serialize<W: Write>(&self, state: &VolumeState, writer: &mut W) -> Result<()> {
        let bytes = self.encode_header(state)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Parses a header without checking any password.
    pub fn decode_header(bytes: &[u8]) -> Result<(PersistedOptions, VolumeState)> {
        let header: Header = header_codec(bytes.len() as u64).deserialize(bytes)
        .map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        if &header.magic != HEADER_MAGIC || header.version != HEADER_VERSION {
            return Err(VfsError::format(WRONG_PASSWORD));
        }
        validate_layout(header.options.block_size, header.options.master_block_size)
        .map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        if header.options.master_block_size as usize != bytes.len() {
            return Err(VfsError::format(WRONG_PASSWORD));
        }
        Ok((header.options, header.state))
    }

    /// Reads the header and validates `password` against it.
    pub fn deserialize<R: Read>(reader: &mut R, password: &str, location: impl Into<PathBuf>) -> Result<(Self, VolumeState)> {
        let mut prefix = [0u8; 8 + 4 + 8 + 8];
        reader.read_exact(&mut prefix).map_err(|_| VfsError::format(WRONG_PASSWORD))?;
        // magic(8) + version(4) + block_size(8) precede master_block_size.
        let master = u64::from_le_bytes(prefix[20..28].try_into().map_err(|_| VfsError::format(WRONG_PASSWORD))?);
        if !(MIN_MASTER_BLOCK_SIZE..=MAX_MASTER_BLOCK_SIZE).contains(&master) {
            return Err(VfsError::format(WRONG_PASSWORD));
        }

        let mut bytes = vec![0u8; master as usize];
        bytes[..prefix.len()].copy_from_slice(&prefix);
        reader.read_exact(&mut bytes[prefix.len()..]).map_err(|_| VfsError::format(WRONG_PASSWORD))?;

        let (persisted, state) = Self::decode_header(&bytes)?;
        let options = Self::unlock(persisted, password, location)?;
        Ok((options, state))
    }
}
