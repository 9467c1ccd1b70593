//! Peer devices and their trust lifecycle.

use crate::error::TrustError;
use crate::keys;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const PEERS_FILE: &str = "peers.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustStatus {
    PendingIncoming,
    PendingOutgoing,
    Trusted,
    Revoked,
}

impl TrustStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, TrustStatus::PendingIncoming | TrustStatus::PendingOutgoing)
    }

    /// Validated transition: `pending-* -> trusted`, `pending-* -> revoked`
    /// and `trusted -> revoked`. Everything else is refused.
    pub fn transition(self, to: TrustStatus) -> Result<TrustStatus, (TrustStatus, TrustStatus)> {
        match (self, to) {
            (from, TrustStatus::Trusted) if from.is_pending() => Ok(to),
            (from, TrustStatus::Revoked) if from.is_pending() => Ok(to),
            (TrustStatus::Trusted, TrustStatus::Revoked) => Ok(to),
            _ => Err((self, to)),
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustStatus::PendingIncoming => "pending-incoming",
            TrustStatus::PendingOutgoing => "pending-outgoing",
            TrustStatus::Trusted => "trusted",
            TrustStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDevice {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Pinned Ed25519 key export. Empty when the device contacted us before
    /// any key exchange happened.
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub fingerprint: String,
    pub trust_status: TrustStatus,
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    /// `host:port` for the TCP connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl PeerDevice {
    pub fn new(id: impl Into<String>, public_key: impl Into<String>, status: TrustStatus) -> Self {
        let public_key = public_key.into();
        let fingerprint = if public_key.is_empty() {
            String::new()
        } else {
            keys::fingerprint(&public_key)
        };
        Self {
            id: id.into(),
            name: None,
            public_key,
            fingerprint,
            trust_status: status,
            added_at: crate::now_millis(),
            last_seen: None,
            address: None,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trust_status == TrustStatus::Trusted
    }
}

/// The local trust list, optionally persisted as JSON.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerDevice>,
    path: Option<PathBuf>,
}

impl PeerRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `peers.json` from `data_dir`, starting empty if it is absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(PEERS_FILE);
        let peers = if path.exists() {
            let raw = std::fs::read_to_string(&path).context("reading peer list")?;
            let list: Vec<PeerDevice> = serde_json::from_str(&raw).context("parsing peer list")?;
            list.into_iter().map(|p| (p.id.clone(), p)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            peers,
            path: Some(path),
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<&PeerDevice> = self.peers.values().collect();
        std::fs::write(path, serde_json::to_string_pretty(&list)?).context("writing peer list")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PeerDevice> {
        self.peers.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &PeerDevice> {
        self.peers.values()
    }

    /// Insert or replace a peer entry and persist.
    pub fn upsert(&mut self, peer: PeerDevice) -> Result<()> {
        self.peers.insert(peer.id.clone(), peer);
        self.save()
    }

    /// Record a device that contacted us without being on the list.
    /// Existing entries are left alone.
    pub fn note_incoming(&mut self, id: &str, public_key: &str) -> Result<()> {
        if self.peers.contains_key(id) {
            return Ok(());
        }
        tracing::info!("New device {} is waiting for approval", id);
        self.upsert(PeerDevice::new(id, public_key, TrustStatus::PendingIncoming))
    }

    pub fn set_status(&mut self, id: &str, to: TrustStatus) -> Result<(), TrustError> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| TrustError::UnknownPeer(id.to_string()))?;

        peer.trust_status = peer.trust_status.transition(to).map_err(|(from, to)| {
            TrustError::InvalidTransition {
                peer: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }
        })?;

        if let Err(e) = self.save() {
            tracing::warn!("Failed to persist peer list: {:#}", e);
        }
        Ok(())
    }

    pub fn trust(&mut self, id: &str) -> Result<(), TrustError> {
        self.set_status(id, TrustStatus::Trusted)
    }

    pub fn revoke(&mut self, id: &str) -> Result<(), TrustError> {
        self.set_status(id, TrustStatus::Revoked)
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_seen = Some(crate::now_millis());
            if let Err(e) = self.save() {
                tracing::warn!("Failed to persist peer list: {:#}", e);
            }
        }
    }

    /// Trust gate for a handshake: the device must be trusted, and if a key
    /// is pinned the presented one must match it.
    pub fn check_trusted(&self, id: &str, presented_key: Option<&str>) -> Result<(), TrustError> {
        let peer = self
            .get(id)
            .ok_or_else(|| TrustError::UnknownPeer(id.to_string()))?;
        if !peer.is_trusted() {
            return Err(TrustError::NotTrusted(id.to_string()));
        }
        if let Some(key) = presented_key {
            if !peer.public_key.is_empty() && peer.public_key != key {
                return Err(TrustError::NotTrusted(id.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_valid_transitions() {
        use TrustStatus::*;
        assert_eq!(PendingIncoming.transition(Trusted), Ok(Trusted));
        assert_eq!(PendingOutgoing.transition(Trusted), Ok(Trusted));
        assert_eq!(PendingIncoming.transition(Revoked), Ok(Revoked));
        assert_eq!(PendingOutgoing.transition(Revoked), Ok(Revoked));
        assert_eq!(Trusted.transition(Revoked), Ok(Revoked));
    }

    #[test]
    fn test_invalid_transitions() {
        use TrustStatus::*;
        assert!(Revoked.transition(Trusted).is_err());
        assert!(Trusted.transition(PendingIncoming).is_err());
        assert!(Trusted.transition(Trusted).is_err());
        assert!(PendingIncoming.transition(PendingOutgoing).is_err());
    }

    #[test]
    fn test_registry_status_changes() {
        let mut reg = PeerRegistry::in_memory();
        reg.upsert(PeerDevice::new("b", "", TrustStatus::PendingOutgoing))
            .unwrap();

        assert!(matches!(
            reg.check_trusted("b", None),
            Err(TrustError::NotTrusted(_))
        ));
        reg.trust("b").unwrap();
        assert!(reg.check_trusted("b", None).is_ok());

        reg.revoke("b").unwrap();
        assert!(matches!(
            reg.trust("b"),
            Err(TrustError::InvalidTransition { .. })
        ));
        assert!(matches!(
            reg.trust("nobody"),
            Err(TrustError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_pinned_key_must_match() {
        let key = crate::keys::generate_signing_key_pair();
        let export = crate::keys::export_public_key(&key.verifying_key());

        let mut reg = PeerRegistry::in_memory();
        reg.upsert(PeerDevice::new("b", export.clone(), TrustStatus::Trusted))
            .unwrap();

        assert!(reg.check_trusted("b", Some(&export)).is_ok());
        assert!(reg.check_trusted("b", Some("00ff")).is_err());
    }

    #[test]
    fn test_registry_persists() -> Result<()> {
        let temp = TempDir::new()?;
        let mut reg = PeerRegistry::load(temp.path())?;
        reg.upsert(PeerDevice::new("b", "", TrustStatus::PendingOutgoing))?;
        reg.note_incoming("c", "")?;
        reg.trust("b").unwrap();

        let reloaded = PeerRegistry::load(temp.path())?;
        assert_eq!(reloaded.get("b").unwrap().trust_status, TrustStatus::Trusted);
        assert_eq!(
            reloaded.get("c").unwrap().trust_status,
            TrustStatus::PendingIncoming
        );
        Ok(())
    }
}
