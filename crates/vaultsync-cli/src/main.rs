use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

use storage::LocalStore;
use transport::tcp::{TcpChannel, TcpConnector};
use vaultsync_core::keys::{self, SIGNING_KEY_FILE};
use vaultsync_core::{
    DeviceIdentity, PeerDevice, PeerRegistry, SnapshotStore, SyncConfig, SyncEngine,
    TransportManager, TrustStatus,
};

#[derive(Parser, Debug)]
#[command(name = "vaultsync", version, about = "VaultSync peer-to-peer vault synchronization")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Vault directory to synchronize (defaults to the current directory)
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Directory for keys, peer list and snapshot (defaults to <vault>/.vaultsync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize this device for the vault
    Init {
        /// Device identifier (random if omitted)
        #[arg(long)]
        device_id: Option<String>,

        /// Human readable device name
        #[arg(long)]
        name: Option<String>,
    },

    /// Show device information
    Info,

    /// Manage known devices
    Peer {
        #[command(subcommand)]
        cmd: PeerCommands,
    },

    /// Print the manifest of the local vault
    Manifest {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Accept incoming sync sessions
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Synchronize with a trusted device
    Sync {
        /// Device id of the peer
        peer: String,
    },
}

#[derive(Subcommand, Debug)]
enum PeerCommands {
    /// Add a device we intend to sync with
    Add {
        /// Device id of the peer
        id: String,

        /// Hex public key shown by `vaultsync info` on the peer
        #[arg(long)]
        public_key: String,

        /// Peer address (host:port)
        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        name: Option<String>,

        /// Trust the device right away
        #[arg(long)]
        trust: bool,
    },

    /// Trust a pending device
    Trust { id: String },

    /// Revoke a device
    Revoke { id: String },

    /// List known devices
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let vault = match cli.vault {
        Some(vault) => vault,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| vault.join(vaultsync_core::config::DATA_DIR_NAME));

    match cli.cmd {
        Commands::Init { device_id, name } => {
            let device_id = device_id.unwrap_or_else(keys::new_device_id);
            let mut cfg = SyncConfig::for_vault(vault.clone()).with_device(device_id, name);
            cfg.data_dir = data_dir.clone();
            cfg.save()?;

            let identity = DeviceIdentity::load_or_generate(&data_dir, cfg.device_id.clone())?;

            println!("✓ Device initialized");
            println!("  Device ID: {}", identity.id);
            println!("  Vault: {} ({})", cfg.vault_id, vault.display());
            println!("  Public key: {}", identity.public_key_export());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let (cfg, identity) = open_device(&data_dir)?;
            let peers = PeerRegistry::load(&data_dir)?;

            println!("Device Information:");
            println!("  Device ID: {}", identity.id);
            if let Some(name) = &cfg.device_name {
                println!("  Name: {}", name);
            }
            println!("  Vault: {} ({})", cfg.vault_id, cfg.vault_dir.display());
            println!("  Public key: {}", identity.public_key_export());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
            println!("  Listen port: {}", cfg.listen_port);
            println!("  Known devices: {}", peers.list().count());
        }

        Commands::Peer { cmd } => manage_peers(&data_dir, cmd)?,

        Commands::Manifest { json } => {
            let (cfg, identity) = open_device(&data_dir)?;
            let manager = build_manager(cfg, identity, PeerRegistry::load(&data_dir)?)?;
            let manifest = manager.generate_local_manifest().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("{}", manifest.summary());
                for (path, hash) in &manifest.files {
                    println!("  {}  {}", &hash[..hash.len().min(12)], path);
                }
            }
        }

        Commands::Serve { port } => {
            let (mut cfg, identity) = open_device(&data_dir)?;
            if let Some(port) = port {
                cfg.listen_port = port;
            }
            serve(cfg, identity, PeerRegistry::load(&data_dir)?).await?;
        }

        Commands::Sync { peer } => {
            let (cfg, identity) = open_device(&data_dir)?;
            let manager = build_manager(cfg, identity, PeerRegistry::load(&data_dir)?)?;
            let engine = SyncEngine::new(manager);

            println!("Syncing with {}...", peer);
            match engine.sync(&peer).await {
                Ok(report) => {
                    println!("✓ {}", report.summary());
                    for path in &report.conflict_paths {
                        println!("  conflict: {} (local copy kept as {}.conflict)", path, path);
                    }
                    for path in &report.failed_paths {
                        println!("  failed: {}", path);
                    }
                }
                Err(e) => {
                    println!("✗ {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn open_device(data_dir: &Path) -> Result<(SyncConfig, DeviceIdentity)> {
    if !data_dir.join(SIGNING_KEY_FILE).exists() {
        anyhow::bail!("Device not initialized. Run 'vaultsync init' first.");
    }
    let mut cfg = SyncConfig::load(data_dir)?;
    cfg.data_dir = data_dir.to_path_buf();
    let identity = DeviceIdentity::load(data_dir, cfg.device_id.clone())
        .context("Device not initialized. Run 'vaultsync init' first.")?;
    Ok((cfg, identity))
}

fn build_manager(
    cfg: SyncConfig,
    identity: DeviceIdentity,
    peers: PeerRegistry,
) -> Result<Arc<TransportManager<LocalStore>>> {
    let addresses: HashMap<String, String> = peers
        .list()
        .filter_map(|p| p.address.clone().map(|a| (p.id.clone(), a)))
        .collect();

    let store = Arc::new(LocalStore::new(cfg.vault_dir.clone())?);
    let snapshot = Arc::new(SnapshotStore::new(
        &cfg.data_dir,
        &cfg.device_id,
        cfg.device_name.clone(),
    ));

    Ok(TransportManager::new(
        identity,
        cfg,
        store,
        snapshot,
        Arc::new(Mutex::new(peers)),
        Arc::new(TcpConnector::new(addresses)),
    ))
}

fn manage_peers(data_dir: &Path, cmd: PeerCommands) -> Result<()> {
    let mut peers = PeerRegistry::load(data_dir)?;

    match cmd {
        PeerCommands::Add {
            id,
            public_key,
            address,
            name,
            trust,
        } => {
            keys::import_public_key(&public_key)?;
            let mut peer = PeerDevice::new(id.clone(), public_key, TrustStatus::PendingOutgoing);
            peer.address = address;
            peer.name = name;
            let fingerprint = peer.fingerprint.clone();
            peers.upsert(peer)?;
            if trust {
                peers.trust(&id)?;
            }

            println!("✓ Added {}", id);
            println!("  Fingerprint: {} (compare with the other device)", fingerprint);
        }

        PeerCommands::Trust { id } => {
            peers.trust(&id)?;
            println!("✓ {} is trusted", id);
        }

        PeerCommands::Revoke { id } => {
            peers.revoke(&id)?;
            println!("✓ {} is revoked", id);
        }

        PeerCommands::List { json } => {
            if json {
                let list: Vec<&PeerDevice> = peers.list().collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                println!("Known {} device(s):", peers.list().count());
                for peer in peers.list() {
                    println!(
                        "  {} [{}] fp {}{}",
                        peer.id,
                        peer.trust_status,
                        peer.fingerprint,
                        peer.address
                            .as_deref()
                            .map(|a| format!(" @ {}", a))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

async fn serve(cfg: SyncConfig, identity: DeviceIdentity, peers: PeerRegistry) -> Result<()> {
    use tokio::net::TcpListener;

    let addr = format!("0.0.0.0:{}", cfg.listen_port);
    let vault_dir = cfg.vault_dir.clone();
    let manager = build_manager(cfg, identity, peers)?;
    let listener = TcpListener::bind(&addr).await?;

    println!("✓ Listening on {}", addr);
    println!("  Vault: {}", vault_dir.display());
    println!("  Press Ctrl+C to stop");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                tracing::info!("Incoming connection from {}", peer_addr);
                manager.accept(TcpChannel::spawn(stream));
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                break;
            }
        }
    }

    Ok(())
}
