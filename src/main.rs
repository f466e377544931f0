// src/main.rs
use clap::{ArgAction, Parser, Subcommand};
use env_logger::Builder;
use log::{error, info, LevelFilter};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vaultdisk::options::{DEFAULT_BLOCK_SIZE, DEFAULT_MASTER_BLOCK_SIZE};
use vaultdisk::{
    AccountService, CancellationToken, CompressionKind, ConflictPolicy, EncryptionKind, EntryKind, FileSystem,
    FileSystemOptions, MemoryServer, RemoteDisk, SyncEngine, SyncEvent, User,
};

#[derive(Parser)]
#[command(name = "VaultDisk")]
#[command(version = "1.0.0")]
#[command(about = "Encrypted single-file virtual disks", long_about = "VaultDisk stores a whole folder tree inside one encrypted, compressed container file.\n\nContainers can be published to a server and kept in sync between machines.")]
struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// State file of the local sync server
    #[arg(long, global = true, value_name = "FILE", default_value = "vaultdisk-server.bin")]
    server: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new container
    Create {
        disk: PathBuf,
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        capacity: u64,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,
        #[arg(long, default_value_t = DEFAULT_MASTER_BLOCK_SIZE)]
        master_block_size: u64,
        #[arg(long, value_enum, default_value_t = EncryptionKind::ChaCha20Poly1305)]
        encryption: EncryptionKind,
        #[arg(long, value_enum, default_value_t = CompressionKind::Zlib)]
        compression: CompressionKind,
    },
    /// Show layout and sync counters
    Info { disk: PathBuf },
    Mkdir { disk: PathBuf, path: String },
    Ls {
        disk: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    Tree {
        disk: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Copy a host file into the container
    Import { disk: PathBuf, host_file: PathBuf, path: String },
    /// Copy a file out of the container
    Export { disk: PathBuf, path: String, host_file: PathBuf },
    Rm { disk: PathBuf, path: String },
    Mv { disk: PathBuf, from: String, to: String },
    /// Create a server account
    Register { login: String },
    /// Upload a container as a new server disk
    Publish { disk: PathBuf, login: String },
    /// Create a local copy of a server disk
    Clone { disk_id: u64, disk: PathBuf, login: String },
    /// Run one sync cycle
    Sync {
        disk: PathBuf,
        #[arg(long, value_enum, default_value_t = ConflictPolicy::Surface)]
        policy: ConflictPolicy,
    },
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    Builder::new()
    .format(|buf, record| {
        let style = buf.default_level_style(record.level());
        writeln!(buf, "[{} {}] {}",
                 buf.timestamp_seconds(),
                 style.value(record.level()),
                 record.args()
        )
    })
    .filter(None, level)
    .init();
}

fn prompt_password(label: &str, confirm: bool) -> anyhow::Result<String> {
    print!("[-] {}: ", label);
    io::stdout().flush()?;
    let password = rpassword::read_password()?;

    if confirm {
        print!("[!] Confirm {}: ", label);
        io::stdout().flush()?;
        if rpassword::read_password()? != password {
            anyhow::bail!("[!] Passwords do not match!");
        }
    }
    Ok(password)
}

/// One-way hash sent to the server instead of the account password.
fn hash_account_password(login: &str, password: &str) -> anyhow::Result<String> {
    let salt = format!("vaultdisk-account:{}", login);
    let mut out = [0u8; 32];
    argon2::Argon2::default()
    .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut out)
    .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?;
    Ok(hex::encode(out))
}

fn login(server: &MemoryServer, login: &str) -> anyhow::Result<User> {
    let password = prompt_password("Account Password", false)?;
    let hashed = hash_account_password(login, &password)?;
    match server.login(login, &hashed)? {
        Some(user) => Ok(user),
        None => anyhow::bail!("Unknown login or wrong password for '{}'", login),
    }
}

fn open(disk: &Path) -> anyhow::Result<FileSystem> {
    if !disk.exists() {
        anyhow::bail!("Container '{:?}' not found.", disk);
    }
    let password = prompt_password("Enter Password", false)?;
    info!("Loading container {:?}...", disk);
    Ok(FileSystem::open(disk, &password)?)
}

fn print_tree(fs: &FileSystem, path: &str) -> anyhow::Result<()> {
    for (folder, entries) in fs.walk(path)? {
        let depth = folder.split('/').filter(|s| !s.is_empty()).count();
        let indent = "  ".repeat(depth);
        println!("{}{}", indent, folder);
        for entry in entries {
            if let EntryKind::File { size } = entry.kind {
                println!("{}  {} ({} bytes)", indent, entry.name, size);
            }
        }
    }
    Ok(())
}

fn run_sync(server: Arc<MemoryServer>, disk: &Path, policy: ConflictPolicy) -> anyhow::Result<bool> {
    let fs = open(disk)?;
    let engine = SyncEngine::new(server, policy);
    let handle = engine.start(fs);

    let token: CancellationToken = handle.cancellation_token();
    ctrlc::set_handler(move || {
        info!("\n[!] Received Ctrl+C. Cancelling sync...");
        token.cancel();
    }).ok();

    let mut success = false;
    for event in handle.events().iter() {
        match event {
            SyncEvent::StateChanged(state) => println!("[+] State: {:?}", state),
            SyncEvent::Progress { done, total } => info!("Transferred {}/{}", done, total),
            SyncEvent::Completed { success: ok } => success = ok,
        }
    }
    drop(handle.join());
    Ok(success)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG").is_err() {
        init_logger(cli.verbose);
    } else {
        env_logger::init();
    }

    match cli.command {
        Command::Create { disk, capacity, block_size, master_block_size, encryption, compression } => {
            let password = prompt_password("Enter Password", true)?;
            let options = FileSystemOptions::builder(&disk)
            .block_size(block_size)
            .master_block_size(master_block_size)
            .encryption(encryption)
            .compression(compression)
            .build(&password)?;
            FileSystem::create(options, capacity)?;
            println!("[+] Created {:?}", disk);
        }
        Command::Info { disk } => {
            let mut fs = open(&disk)?;
            let info = fs.info()?;
            println!("Block size:        {}", info.block_size);
            println!("Master block size: {}", info.master_block_size);
            println!("Encryption:        {:?}", info.encryption);
            println!("Compression:       {:?}", info.compression);
            println!("Container bytes:   {}", info.container_bytes);
            println!("Allocated blocks:  {}", info.allocated_blocks);
            println!("Free blocks:       {}", info.free_blocks);
            match info.disk_id {
                Some(id) => println!("Server disk:       {}", id),
                None => println!("Server disk:       (not published)"),
            }
            println!("Local version:     {}", info.local_version);
            println!("Server version:    {}", info.last_server_version);
            match info.pending_blocks {
                Some(n) => println!("Pending blocks:    {}", n),
                None => println!("Pending blocks:    all"),
            }
        }
        Command::Mkdir { disk, path } => {
            open(&disk)?.create_folder(&path)?;
        }
        Command::Ls { disk, path } => {
            let fs = open(&disk)?;
            for entry in fs.list(&path)? {
                match entry.kind {
                    EntryKind::Folder => println!("{}/", entry.name),
                    EntryKind::File { size } => println!("{}\t{}", entry.name, size),
                }
            }
        }
        Command::Tree { disk, path } => {
            let fs = open(&disk)?;
            print_tree(&fs, &path)?;
        }
        Command::Import { disk, host_file, path } => {
            open(&disk)?.import_host_file(&host_file, &path)?;
            println!("[+] Imported {:?} as {}", host_file, path);
        }
        Command::Export { disk, path, host_file } => {
            open(&disk)?.export_to_host(&path, &host_file)?;
            println!("[+] Exported {} to {:?}", path, host_file);
        }
        Command::Rm { disk, path } => {
            open(&disk)?.delete(&path)?;
        }
        Command::Mv { disk, from, to } => {
            open(&disk)?.rename(&from, &to)?;
        }
        Command::Register { login } => {
            let server = MemoryServer::load(&cli.server)?;
            let password = prompt_password("Account Password", true)?;
            let hashed = hash_account_password(&login, &password)?;
            match server.register(&login, &hashed)? {
                Some(user) => println!("[+] Registered '{}' (#{})", user.login, user.id),
                None => anyhow::bail!("Login '{}' is already taken.", login),
            }
            server.save(&cli.server)?;
        }
        Command::Publish { disk, login: name } => {
            let server = Arc::new(MemoryServer::load(&cli.server)?);
            let user = login(&server, &name)?;
            let mut fs = open(&disk)?;
            let engine = SyncEngine::new(server.clone(), ConflictPolicy::Surface);
            let record = engine.publish(&mut fs, user.id)?;
            server.save(&cli.server)?;
            println!("[+] Published as disk {}. Run 'sync' to upload.", record.id);
        }
        Command::Clone { disk_id, disk, login: name } => {
            let server = Arc::new(MemoryServer::load(&cli.server)?);
            let user = login(&server, &name)?;
            if server.disk(disk_id)?.user_id != user.id {
                anyhow::bail!("Disk {} does not belong to '{}'.", disk_id, name);
            }
            let password = prompt_password("Enter Password", false)?;
            let engine = SyncEngine::new(server.clone(), ConflictPolicy::Surface);
            let mut fs = engine.bootstrap(disk_id, &disk, &password)?;
            if !engine.run_cycle(&mut fs, &CancellationToken::new(), &mut |_| {}) {
                error!("Initial download of disk {} failed", disk_id);
                anyhow::bail!("Clone incomplete; run 'sync' on {:?} to retry.", disk);
            }
            println!("[+] Cloned disk {} into {:?}", disk_id, disk);
        }
        Command::Sync { disk, policy } => {
            let server = Arc::new(MemoryServer::load(&cli.server)?);
            let ok = run_sync(server.clone(), &disk, policy)?;
            if !ok {
                anyhow::bail!("Sync did not complete.");
            }
            server.save(&cli.server)?;
            println!("[+] Sync complete.");
        }
    }

    Ok(())
}
