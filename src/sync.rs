// src/sync.rs
//! Version-counter reconciliation between a local container and a remote disk.
//!
//! One cycle compares the client's counters with the server's [`DiskDto`],
//! then pushes pending blocks, pulls changed blocks, or reports a conflict.
//! Counters only move once a whole cycle has been committed, so a failed or
//! cancelled cycle can simply be run again.

use crate::error::{Result, VfsError};
use crate::filesystem::FileSystem;
use crate::options::{FileSystemOptions, SyncCounters};
use crate::remote::{DiskDto, DiskOptionsDto, RemoteDisk};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    UpToDate,
    LocalChanges,
    RemoteChanges,
    Conflicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    Progress { done: u64, total: u64 },
    Completed { success: bool },
}

/// What to do when both sides advanced since the last common version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConflictPolicy {
    /// Report the conflict and transfer nothing.
    #[default]
    Surface,
    /// Overwrite the remote copy with the local one.
    PreferLocal,
    /// Discard local changes in favour of the remote copy.
    PreferRemote,
}

/// Cooperative cancellation flag, polled between block transfers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn compute_state(local: &SyncCounters, server: &DiskDto) -> SyncState {
    let local_advanced = local.local_version > local.last_server_version || !local.pending.is_empty();
    let remote_advanced = server.last_server_version > local.last_server_version;
    match (local_advanced, remote_advanced) {
        (false, false) => SyncState::UpToDate,
        (true, false) => SyncState::LocalChanges,
        (false, true) => SyncState::RemoteChanges,
        (true, true) => SyncState::Conflicted,
    }
}

enum Outcome {
    Done,
    Stopped,
}

/// A cycle running on a background thread.
pub struct SyncHandle {
    events: Receiver<SyncEvent>,
    cancel: CancellationToken,
    worker: JoinHandle<FileSystem>,
}

impl SyncHandle {
    pub fn events(&self) -> &Receiver<SyncEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the cycle and hands the file system back.
    pub fn join(self) -> FileSystem {
        match self.worker.join() {
            Ok(fs) => fs,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    remote: Arc<dyn RemoteDisk>,
    policy: ConflictPolicy,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteDisk>, policy: ConflictPolicy) -> Self {
        SyncEngine { remote, policy }
    }

    /// Registers `fs` as a new remote disk owned by `user_id`.
    pub fn publish(&self, fs: &mut FileSystem, user_id: u64) -> Result<DiskDto> {
        if let Some(id) = fs.sync_counters().disk_id {
            return Err(VfsError::argument(format!("container is already linked to disk {}", id)));
        }
        let options = fs.options();
        let dto = DiskOptionsDto {
            id: 0,
            disk_id: 0,
            block_size: options.block_size(),
            master_block_size: options.master_block_size(),
            serialized_file_system_options: options.to_serialized()?,
        };
        let disk = self.remote.create_disk(user_id, dto)?;
        fs.mark_published(disk.id)?;
        info!("Published container as disk {}", disk.id);
        Ok(disk)
    }

    /// Creates an empty container compatible with remote `disk_id`.
    ///
    /// Its first cycle pulls the whole disk.
    pub fn bootstrap(&self, disk_id: u64, location: impl Into<PathBuf>, password: &str) -> Result<FileSystem> {
        let dto = self.remote.disk_options(disk_id)?;
        let server = self.remote.disk(disk_id)?;
        let options = FileSystemOptions::from_serialized(&dto.serialized_file_system_options, password, location)?;
        if options.block_size() != dto.block_size || options.master_block_size() != dto.master_block_size {
            return Err(VfsError::format("disk options disagree with the advertised block sizes"));
        }
        let capacity = server
        .newest_block
        .max(1)
        .checked_mul(dto.block_size)
        .ok_or_else(|| VfsError::argument(format!("disk {} advertises too many blocks", disk_id)))?;
        let mut fs = FileSystem::create(options, capacity)?;
        fs.mark_synced(disk_id, 0)?;
        info!("Bootstrapped local copy of disk {}", disk_id);
        Ok(fs)
    }

    /// Runs one cycle on a background thread.
    pub fn start(&self, fs: FileSystem) -> SyncHandle {
        let (tx, rx) = mpsc::channel();
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let worker = thread::spawn(move || {
            let mut fs = fs;
            engine.run_cycle(&mut fs, &token, &mut |event| {
                let _ = tx.send(event);
            });
            fs
        });
        SyncHandle { events: rx, cancel, worker }
    }

    /// Runs one cycle on the calling thread. Always ends with exactly one
    /// `Completed` event; returns its `success` flag.
    pub fn run_cycle(&self, fs: &mut FileSystem, cancel: &CancellationToken, emit: &mut dyn FnMut(SyncEvent)) -> bool {
        let success = match self.cycle(fs, cancel, emit) {
            Ok(Outcome::Done) => true,
            Ok(Outcome::Stopped) => false,
            Err(e) => {
                warn!("Sync cycle failed: {}", e);
                false
            }
        };
        emit(SyncEvent::Completed { success });
        success
    }

    fn cycle(&self, fs: &mut FileSystem, cancel: &CancellationToken, emit: &mut dyn FnMut(SyncEvent)) -> Result<Outcome> {
        let disk_id = fs
        .sync_counters()
        .disk_id
        .ok_or_else(|| VfsError::argument("container is not linked to a remote disk"))?;
        let server = self.remote.disk(disk_id)?;
        if server.last_server_version < fs.sync_counters().last_server_version {
            return Err(VfsError::communication(format!(
                "server holds version {} but this copy already saw {}",
                server.last_server_version,
                fs.sync_counters().last_server_version
            )));
        }

        let state = compute_state(fs.sync_counters(), &server);
        info!("Disk {}: {:?}", disk_id, state);
        emit(SyncEvent::StateChanged(state));

        match (state, self.policy) {
            (SyncState::UpToDate, _) => {
                emit(SyncEvent::Progress { done: 0, total: 0 });
                Ok(Outcome::Done)
            }
            (SyncState::LocalChanges, _) => self.push(fs, &server, false, cancel, emit),
            (SyncState::RemoteChanges, _) => self.pull(fs, &server, false, cancel, emit),
            (SyncState::Conflicted, ConflictPolicy::PreferLocal) => self.push(fs, &server, true, cancel, emit),
            (SyncState::Conflicted, ConflictPolicy::PreferRemote) => self.pull(fs, &server, true, cancel, emit),
            (SyncState::Conflicted, ConflictPolicy::Surface) => {
                warn!("Disk {} changed on both sides, nothing transferred", disk_id);
                Ok(Outcome::Stopped)
            }
        }
    }

    fn push(
        &self,
        fs: &mut FileSystem,
        server: &DiskDto,
        force: bool,
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(SyncEvent),
    ) -> Result<Outcome> {
        let disk_id = server.id;
        let version = server.last_server_version + 1;
        let mut blocks = fs.pending_blocks();
        if force {
            // Remote-only changes must be overwritten with our copy too.
            blocks.extend(self.remote.changed_blocks(disk_id, fs.sync_counters().last_server_version)?);
        }

        let session = self.remote.begin_push(disk_id, version)?;
        debug!("Push session {} opened for disk {} version {}", session, disk_id, version);
        let result = self.send(fs, server, session, blocks, cancel, emit);
        if !matches!(result, Ok(Outcome::Done)) {
            if let Err(e) = self.remote.abort(disk_id, session) {
                warn!("Could not abort push session {} on disk {}: {}", session, disk_id, e);
            }
        }
        result
    }

    fn send(
        &self,
        fs: &mut FileSystem,
        server: &DiskDto,
        session: u64,
        blocks: BTreeSet<u64>,
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(SyncEvent),
    ) -> Result<Outcome> {
        let disk_id = server.id;
        let version = server.last_server_version + 1;
        let total = blocks.len() as u64 + 1;
        emit(SyncEvent::Progress { done: 0, total });
        for (done, block) in blocks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Push cancelled after {} blocks", done);
                return Ok(Outcome::Stopped);
            }
            let data = fs.read_block(block)?;
            self.remote.write_block(disk_id, session, block, &data)?;
            emit(SyncEvent::Progress { done: done as u64 + 1, total });
        }
        if cancel.is_cancelled() {
            info!("Push cancelled before the master block");
            return Ok(Outcome::Stopped);
        }

        let master = fs.master_block_at(disk_id, version)?;
        self.remote.write_master_block(disk_id, session, &master)?;
        let committed = self.remote.commit(session, &DiskDto {
            id: disk_id,
            user_id: server.user_id,
            last_server_version: version,
            local_version: fs.sync_counters().local_version,
            newest_block: fs.newest_block(),
        })?;
        fs.mark_synced(disk_id, committed.last_server_version)?;
        emit(SyncEvent::Progress { done: total, total });
        info!("Pushed disk {} as version {}", disk_id, version);
        Ok(Outcome::Done)
    }

    fn pull(
        &self,
        fs: &mut FileSystem,
        server: &DiskDto,
        force: bool,
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(SyncEvent),
    ) -> Result<Outcome> {
        let disk_id = server.id;
        let mut wanted: BTreeSet<u64> =
            self.remote.changed_blocks(disk_id, fs.sync_counters().last_server_version)?.into_iter().collect();
        if force {
            // Local-only changes are replaced by the remote contents.
            wanted.extend(fs.pending_blocks());
        }

        let total = wanted.len() as u64 + 1;
        emit(SyncEvent::Progress { done: 0, total });

        // Nothing touches the container until every block has arrived.
        let mut fetched = Vec::with_capacity(wanted.len());
        for (done, block) in wanted.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Pull cancelled after {} blocks", done);
                return Ok(Outcome::Stopped);
            }
            fetched.push((block, self.remote.read_block(disk_id, block)?));
            emit(SyncEvent::Progress { done: done as u64 + 1, total });
        }
        if cancel.is_cancelled() {
            return Ok(Outcome::Stopped);
        }

        let master = self.remote.read_master_block(disk_id)?;
        debug!("Applying {} pulled blocks", fetched.len());
        fs.apply_remote(&master, fetched, server.last_server_version)?;
        fs.mark_synced(disk_id, server.last_server_version)?;
        emit(SyncEvent::Progress { done: total, total });
        info!("Pulled disk {} at version {}", disk_id, server.last_server_version);
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CompressionKind, EncryptionKind};
    use crate::options::{KdfParams, PendingBlocks};
    use crate::remote::AccountService;
    use crate::server::MemoryServer;
    use tempfile::TempDir;

    fn counters(local: u64, last_server: u64, pending: &[u64]) -> SyncCounters {
        let mut c = SyncCounters { disk_id: Some(1), local_version: local, last_server_version: last_server, pending: PendingBlocks::default() };
        c.pending.extend(pending.iter().copied());
        c
    }

    fn server_at(version: u64) -> DiskDto {
        DiskDto { id: 1, user_id: 1, last_server_version: version, local_version: version, newest_block: 0 }
    }

    #[test]
    fn state_table() {
        assert_eq!(compute_state(&counters(3, 3, &[]), &server_at(3)), SyncState::UpToDate);
        assert_eq!(compute_state(&counters(4, 3, &[]), &server_at(3)), SyncState::LocalChanges);
        assert_eq!(compute_state(&counters(3, 3, &[5]), &server_at(3)), SyncState::LocalChanges);
        assert_eq!(compute_state(&counters(3, 3, &[]), &server_at(4)), SyncState::RemoteChanges);
        assert_eq!(compute_state(&counters(4, 3, &[]), &server_at(4)), SyncState::Conflicted);
    }

    fn create(dir: &TempDir, name: &str) -> FileSystem {
        let options = FileSystemOptions::builder(dir.path().join(name))
        .block_size(1024)
        .master_block_size(4096)
        .encryption(EncryptionKind::ChaCha20Poly1305)
        .compression(CompressionKind::Zlib)
        .kdf(KdfParams::light())
        .build("pw")
        .unwrap();
        FileSystem::create(options, 16 * 1024).unwrap()
    }

    struct Setup {
        dir: TempDir,
        server: Arc<MemoryServer>,
        user: u64,
    }

    fn setup() -> Setup {
        let server = Arc::new(MemoryServer::new());
        let user = server.register("ada", "hashed").unwrap().unwrap().id;
        Setup { dir: TempDir::new().unwrap(), server, user }
    }

    fn engine(setup: &Setup, policy: ConflictPolicy) -> SyncEngine {
        SyncEngine::new(setup.server.clone(), policy)
    }

    fn cycle(engine: &SyncEngine, fs: &mut FileSystem) -> (bool, Vec<SyncEvent>) {
        let mut events = Vec::new();
        let ok = engine.run_cycle(fs, &CancellationToken::new(), &mut |e| events.push(e));
        (ok, events)
    }

    /// Two linked copies of one disk, both up to date.
    fn linked_pair(setup: &Setup, policy: ConflictPolicy) -> (SyncEngine, FileSystem, FileSystem) {
        let engine = engine(setup, policy);
        let mut a = create(&setup.dir, "a.vdisk");
        a.create_folder("shared").unwrap();
        a.import(b"first", "shared/note.txt").unwrap();
        let disk = engine.publish(&mut a, setup.user).unwrap();
        assert!(cycle(&engine, &mut a).0);

        let mut b = engine.bootstrap(disk.id, setup.dir.path().join("b.vdisk"), "pw").unwrap();
        assert!(cycle(&engine, &mut b).0);
        (engine, a, b)
    }

    #[test]
    fn push_then_pull_reaches_second_copy() {
        let setup = setup();
        let (engine, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        assert_eq!(b.export("shared/note.txt").unwrap(), b"first");

        a.import(b"second", "shared/other.txt").unwrap();
        let (ok, events) = cycle(&engine, &mut a);
        assert!(ok);
        assert_eq!(events[0], SyncEvent::StateChanged(SyncState::LocalChanges));

        let (ok, events) = cycle(&engine, &mut b);
        assert!(ok);
        assert_eq!(events[0], SyncEvent::StateChanged(SyncState::RemoteChanges));
        assert_eq!(b.export("shared/other.txt").unwrap(), b"second");

        let (ok, events) = cycle(&engine, &mut b);
        assert!(ok);
        assert_eq!(events[0], SyncEvent::StateChanged(SyncState::UpToDate));
        assert_eq!(b.info().unwrap().last_server_version, 2);
    }

    #[test]
    fn events_are_ordered_and_progress_is_monotonic() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        a.import(&vec![5u8; 8000], "big").unwrap();
        engine.publish(&mut a, setup.user).unwrap();

        let (_, events) = cycle(&engine, &mut a);
        assert!(matches!(events.first(), Some(SyncEvent::StateChanged(_))));
        assert_eq!(events.last(), Some(&SyncEvent::Completed { success: true }));
        assert_eq!(events.iter().filter(|e| matches!(e, SyncEvent::Completed { .. })).count(), 1);

        let mut last_done = 0;
        for e in &events {
            if let SyncEvent::Progress { done, total } = *e {
                assert!(done >= last_done);
                assert!(done <= total);
                last_done = done;
            }
        }
    }

    #[test]
    fn conflict_is_surfaced_by_default() {
        let setup = setup();
        let (engine, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        a.import(b"from a", "a.txt").unwrap();
        assert!(cycle(&engine, &mut a).0);
        b.import(b"from b", "b.txt").unwrap();

        let (ok, events) = cycle(&engine, &mut b);
        assert!(!ok);
        assert_eq!(events, vec![
            SyncEvent::StateChanged(SyncState::Conflicted),
            SyncEvent::Completed { success: false },
        ]);
        assert!(b.file_exists("b.txt"));
        assert!(!b.file_exists("a.txt"));
    }

    #[test]
    fn prefer_remote_discards_local_changes() {
        let setup = setup();
        let (_, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        let surface = engine(&setup, ConflictPolicy::Surface);
        a.import(b"from a", "a.txt").unwrap();
        assert!(cycle(&surface, &mut a).0);
        b.import(b"from b", "b.txt").unwrap();

        let remote_wins = engine(&setup, ConflictPolicy::PreferRemote);
        assert!(cycle(&remote_wins, &mut b).0);
        assert!(b.file_exists("a.txt"));
        assert!(!b.file_exists("b.txt"));
        assert_eq!(b.export("shared/note.txt").unwrap(), b"first");
    }

    #[test]
    fn prefer_local_overwrites_remote() {
        let setup = setup();
        let (_, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        let surface = engine(&setup, ConflictPolicy::Surface);
        a.import(b"from a", "a.txt").unwrap();
        assert!(cycle(&surface, &mut a).0);
        b.import(b"from b", "b.txt").unwrap();

        let local_wins = engine(&setup, ConflictPolicy::PreferLocal);
        assert!(cycle(&local_wins, &mut b).0);

        // a now sees b's view of the world.
        assert!(cycle(&surface, &mut a).0);
        assert!(a.file_exists("b.txt"));
        assert!(!a.file_exists("a.txt"));
        assert_eq!(a.export("shared/note.txt").unwrap(), b"first");
    }

    #[test]
    fn cancelled_cycle_leaves_counters_and_can_be_retried() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        a.import(b"payload", "f").unwrap();
        let disk = engine.publish(&mut a, setup.user).unwrap();
        let before = a.info().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut events = Vec::new();
        assert!(!engine.run_cycle(&mut a, &cancel, &mut |e| events.push(e)));
        assert_eq!(events.last(), Some(&SyncEvent::Completed { success: false }));
        assert_eq!(a.info().unwrap(), before);
        assert_eq!(setup.server.disk(disk.id).unwrap().last_server_version, 0);

        assert!(cycle(&engine, &mut a).0);
        assert_eq!(setup.server.disk(disk.id).unwrap().last_server_version, 1);
    }

    #[test]
    fn push_cancelled_before_master_publishes_nothing() {
        let setup = setup();
        let (engine, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        a.delete("shared/note.txt").unwrap();
        let before = a.info().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut sent = 0;
        let ok = engine.run_cycle(&mut a, &cancel, &mut |e| {
            if let SyncEvent::Progress { done, total } = e {
                sent = done;
                if done > 0 && done + 1 == total {
                    trigger.cancel();
                }
            }
        });
        assert!(!ok);
        assert!(sent > 0);
        assert_eq!(a.info().unwrap(), before);
        let disk = a.info().unwrap().disk_id.unwrap();
        assert_eq!(setup.server.disk(disk).unwrap().last_server_version, 1);

        // Another client's push must not carry the abandoned blocks.
        b.create_folder("other").unwrap();
        assert!(cycle(&engine, &mut b).0);
        let mut c = engine.bootstrap(disk, setup.dir.path().join("c.vdisk"), "pw").unwrap();
        assert!(cycle(&engine, &mut c).0);
        assert_eq!(c.export("shared/note.txt").unwrap(), b"first");
        assert!(c.folder_exists("other"));
    }

    #[test]
    fn pull_cancelled_midway_changes_nothing() {
        let setup = setup();
        let (engine, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        a.import(&vec![9u8; 6000], "shared/big.bin").unwrap();
        assert!(cycle(&engine, &mut a).0);
        let before = b.info().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let ok = engine.run_cycle(&mut b, &cancel, &mut |e| {
            if let SyncEvent::Progress { done: 1, .. } = e {
                trigger.cancel();
            }
        });
        assert!(!ok);
        assert_eq!(b.info().unwrap(), before);
        assert!(!b.file_exists("shared/big.bin"));
        assert_eq!(b.export("shared/note.txt").unwrap(), b"first");

        assert!(cycle(&engine, &mut b).0);
        assert_eq!(b.export("shared/big.bin").unwrap(), vec![9u8; 6000]);
    }

    /// Delegates to a [`MemoryServer`], injecting failures on demand.
    struct Faulty {
        inner: Arc<MemoryServer>,
        fail_commit: AtomicBool,
        stale_disk: AtomicBool,
        huge_disk: AtomicBool,
    }

    impl Faulty {
        fn new(inner: Arc<MemoryServer>) -> Self {
            Faulty { inner, fail_commit: AtomicBool::new(false), stale_disk: AtomicBool::new(false), huge_disk: AtomicBool::new(false) }
        }
    }

    impl RemoteDisk for Faulty {
        fn disks(&self, user_id: u64) -> Result<Vec<DiskDto>> {
            self.inner.disks(user_id)
        }

        fn create_disk(&self, user_id: u64, options: DiskOptionsDto) -> Result<DiskDto> {
            self.inner.create_disk(user_id, options)
        }

        fn disk(&self, disk_id: u64) -> Result<DiskDto> {
            let mut dto = self.inner.disk(disk_id)?;
            if self.stale_disk.swap(false, Ordering::SeqCst) {
                dto.last_server_version -= 1;
            }
            if self.huge_disk.load(Ordering::SeqCst) {
                dto.newest_block = u64::MAX;
            }
            Ok(dto)
        }

        fn disk_options(&self, disk_id: u64) -> Result<DiskOptionsDto> {
            self.inner.disk_options(disk_id)
        }

        fn changed_blocks(&self, disk_id: u64, since: u64) -> Result<Vec<u64>> {
            self.inner.changed_blocks(disk_id, since)
        }

        fn read_block(&self, disk_id: u64, block: u64) -> Result<Vec<u8>> {
            self.inner.read_block(disk_id, block)
        }

        fn read_master_block(&self, disk_id: u64) -> Result<Vec<u8>> {
            self.inner.read_master_block(disk_id)
        }

        fn begin_push(&self, disk_id: u64, version: u64) -> Result<u64> {
            self.inner.begin_push(disk_id, version)
        }

        fn write_block(&self, disk_id: u64, session: u64, block: u64, data: &[u8]) -> Result<()> {
            self.inner.write_block(disk_id, session, block, data)
        }

        fn write_master_block(&self, disk_id: u64, session: u64, data: &[u8]) -> Result<()> {
            self.inner.write_master_block(disk_id, session, data)
        }

        fn commit(&self, session: u64, disk: &DiskDto) -> Result<DiskDto> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(VfsError::communication("connection reset"));
            }
            self.inner.commit(session, disk)
        }

        fn abort(&self, disk_id: u64, session: u64) -> Result<()> {
            self.inner.abort(disk_id, session)
        }
    }

    #[test]
    fn failed_commit_leaves_server_and_counters() {
        let setup = setup();
        let (engine, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        let faulty = Arc::new(Faulty::new(setup.server.clone()));
        let flaky = SyncEngine::new(faulty.clone(), ConflictPolicy::PreferLocal);
        let disk = a.info().unwrap().disk_id.unwrap();

        a.delete("shared/note.txt").unwrap();
        let before = a.info().unwrap();
        faulty.fail_commit.store(true, Ordering::SeqCst);
        let (ok, events) = cycle(&flaky, &mut a);
        assert!(!ok);
        assert_eq!(events.last(), Some(&SyncEvent::Completed { success: false }));
        assert_eq!(a.info().unwrap(), before);
        assert_eq!(setup.server.disk(disk).unwrap().last_server_version, 1);

        b.create_folder("other").unwrap();
        assert!(cycle(&engine, &mut b).0);
        let mut c = engine.bootstrap(disk, setup.dir.path().join("c.vdisk"), "pw").unwrap();
        assert!(cycle(&engine, &mut c).0);
        assert_eq!(c.export("shared/note.txt").unwrap(), b"first");
        assert!(c.folder_exists("other"));

        // The retry overwrites b's version with a's view.
        faulty.fail_commit.store(false, Ordering::SeqCst);
        assert!(cycle(&flaky, &mut a).0);
        assert_eq!(setup.server.disk(disk).unwrap().last_server_version, 3);
        assert!(cycle(&engine, &mut c).0);
        assert!(!c.file_exists("shared/note.txt"));
        assert!(!c.folder_exists("other"));
    }

    #[test]
    fn pull_refuses_master_newer_than_advertised() {
        let setup = setup();
        let (engine, mut a, mut b) = linked_pair(&setup, ConflictPolicy::Surface);
        a.import(b"two", "two.txt").unwrap();
        assert!(cycle(&engine, &mut a).0);
        a.import(b"three", "three.txt").unwrap();
        assert!(cycle(&engine, &mut a).0);

        let faulty = Arc::new(Faulty::new(setup.server.clone()));
        let lagging = SyncEngine::new(faulty.clone(), ConflictPolicy::Surface);
        let before = b.info().unwrap();
        faulty.stale_disk.store(true, Ordering::SeqCst);
        assert!(!cycle(&lagging, &mut b).0);
        assert_eq!(b.info().unwrap(), before);
        assert!(!b.file_exists("two.txt"));

        assert!(cycle(&lagging, &mut b).0);
        assert_eq!(b.export("three.txt").unwrap(), b"three");
        assert_eq!(b.info().unwrap().last_server_version, 3);
    }

    #[test]
    fn bootstrap_refuses_overflowing_capacity() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        let disk = engine.publish(&mut a, setup.user).unwrap();

        let faulty = Arc::new(Faulty::new(setup.server.clone()));
        faulty.huge_disk.store(true, Ordering::SeqCst);
        let inflated = SyncEngine::new(faulty, ConflictPolicy::Surface);
        let err = inflated.bootstrap(disk.id, setup.dir.path().join("b.vdisk"), "pw").unwrap_err();
        assert!(matches!(err, VfsError::Argument(_)));
        assert!(!setup.dir.path().join("b.vdisk").exists());
    }

    #[test]
    fn unlinked_container_fails_cycle() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        let (ok, events) = cycle(&engine, &mut a);
        assert!(!ok);
        assert_eq!(events, vec![SyncEvent::Completed { success: false }]);
    }

    #[test]
    fn publishing_twice_is_refused() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        engine.publish(&mut a, setup.user).unwrap();
        assert!(matches!(engine.publish(&mut a, setup.user), Err(VfsError::Argument(_))));
    }

    #[test]
    fn bootstrap_needs_the_disk_password() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        let disk = engine.publish(&mut a, setup.user).unwrap();
        let err = engine.bootstrap(disk.id, setup.dir.path().join("b.vdisk"), "nope").unwrap_err();
        assert!(matches!(err, VfsError::Format(_)));
    }

    #[test]
    fn background_cycle_returns_file_system() {
        let setup = setup();
        let engine = engine(&setup, ConflictPolicy::Surface);
        let mut a = create(&setup.dir, "a.vdisk");
        a.import(b"bg", "bg.txt").unwrap();
        engine.publish(&mut a, setup.user).unwrap();

        let handle = engine.start(a);
        let events: Vec<SyncEvent> = handle.events().iter().collect();
        let mut a = handle.join();
        assert_eq!(events.last(), Some(&SyncEvent::Completed { success: true }));
        assert_eq!(a.info().unwrap().pending_blocks, Some(0));
        assert_eq!(a.export("bg.txt").unwrap(), b"bg");
    }
}
