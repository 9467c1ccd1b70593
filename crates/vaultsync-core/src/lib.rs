//! VaultSync Core - peer-to-peer vault synchronization
//!
//! Keeps a content tree in step across devices that talk over direct
//! message channels. Each device remembers what it last agreed on with
//! every peer and reconciles divergence with a three-way comparison
//! against that state.

pub mod config;
pub mod device;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod planner;
pub mod protocol;
pub mod snapshot;
pub mod sync;
pub mod transfer;
pub mod writeback;

// Re-export commonly used types
pub use config::SyncConfig;
pub use device::{PeerDevice, PeerRegistry, TrustStatus};
pub use error::SyncError;
pub use keys::DeviceIdentity;
pub use manifest::{Exclusion, Manifest};
pub use planner::{ActionKind, SyncAction, SyncPlan};
pub use snapshot::SnapshotStore;
pub use sync::{SyncEngine, SyncReport};
pub use transfer::{HandshakeState, TransportManager};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
