use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";

/// Name of the per-vault data directory. Excluded from manifests.
pub const DATA_DIR_NAME: &str = ".vaultsync";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the synchronized content tree
    pub vault_dir: PathBuf,

    /// Directory for identity keys, peer list and snapshot
    pub data_dir: PathBuf,

    /// Vault identifier carried in manifests
    pub vault_id: String,

    /// This device's id
    pub device_id: String,

    /// Human readable name of this device
    pub device_name: Option<String>,

    /// Transfer chunk size (64 KiB keeps each message under common channel limits)
    pub chunk_size: usize,

    /// Backups kept per file before older ones are overwritten; 0 disables
    pub max_backups_per_file: usize,

    /// Files hashed concurrently while building a manifest
    pub manifest_workers: usize,

    pub handshake_timeout_secs: u64,
    pub manifest_timeout_secs: u64,
    pub file_timeout_secs: u64,

    /// Port to listen on for incoming connections
    pub listen_port: u16,

    /// Classify baseline paths missing on one side as deletions
    pub detect_deletions: bool,

    /// Extra vault-relative prefixes left out of manifests
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let vault_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::for_vault(vault_dir)
    }
}

impl SyncConfig {
    pub fn for_vault(vault_dir: PathBuf) -> Self {
        let vault_id = vault_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("vault")
            .to_string();

        Self {
            data_dir: vault_dir.join(DATA_DIR_NAME),
            vault_dir,
            vault_id,
            device_id: String::new(),
            device_name: None,
            chunk_size: 64 * 1024, // 64 KiB
            max_backups_per_file: 5,
            manifest_workers: 8,
            handshake_timeout_secs: 10,
            manifest_timeout_secs: 5,
            file_timeout_secs: 10,
            listen_port: 9876,
            detect_deletions: false,
            exclude: Vec::new(),
        }
    }

    pub fn with_device(mut self, device_id: String, device_name: Option<String>) -> Self {
        self.device_id = device_id;
        self.device_name = device_name;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    /// Prefix of the data directory inside the vault, if it lives there.
    pub fn data_dir_prefix(&self) -> Option<String> {
        let rel = self.data_dir.strip_prefix(&self.vault_dir).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(format!("{}/", parts.join("/")))
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Read `config.json` from `data_dir`; missing fields take defaults.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let cfg_path = data_dir.join(CONFIG_FILE);
        if !cfg_path.exists() {
            anyhow::bail!("Vault not initialized. Run 'vaultsync init' first.");
        }

        let cfg_json = std::fs::read_to_string(cfg_path)?;
        let cfg: SyncConfig = serde_json::from_str(&cfg_json)?;
        Ok(cfg)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.ensure_data_dir()?;
        let cfg_json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.data_dir.join(CONFIG_FILE), cfg_json)?;
        Ok(())
    }
}
