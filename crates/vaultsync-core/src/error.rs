//! Error taxonomy for the sync engine.
//!
//! Path-scoped errors (`StorageError`, `TransferError`) are logged and
//! counted by the orchestrator; session-scoped ones surface as `SyncError`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("key file error: {0}")]
    KeyFile(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("device {0} is not known")]
    UnknownPeer(String),
    #[error("device {0} is not trusted")]
    NotTrusted(String),
    #[error("cannot change trust of {peer} from {from} to {to}")]
    InvalidTransition {
        peer: String,
        from: String,
        to: String,
    },
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("signature check failed")]
    InvalidSignature,
    #[error("peer declined the handshake")]
    Rejected,
    #[error("no acknowledgement within {0:?}")]
    Timeout(std::time::Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Trust(#[from] TrustError),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("chunk {index} out of range for {total} chunks of {path}")]
    ChunkOutOfRange {
        path: String,
        index: usize,
        total: usize,
    },
    #[error("chunk count for {path} changed from {expected} to {got}")]
    ChunkCountMismatch {
        path: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{what} timed out after {after:?}")]
    Timeout {
        what: String,
        after: std::time::Duration,
    },
    #[error("{path} arrived with {received} of {expected} chunks")]
    Incomplete {
        path: String,
        received: usize,
        expected: usize,
    },
    #[error("channel to {0} closed")]
    ChannelClosed(String),
    #[error("no open channel to {0}")]
    NoChannel(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
#[error("{path}: {message}")]
pub struct StorageError {
    pub path: String,
    pub message: String,
}

impl StorageError {
    pub fn new(path: &str, err: anyhow::Error) -> Self {
        Self {
            path: path.to_string(),
            message: format!("{:#}", err),
        }
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("this device has no identity yet; run init first")]
    MissingIdentity,
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Session-level failure of one `sync` run. `Display` is the notice shown
/// to the user.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no device selected to sync with")]
    MissingPeer,
    #[error("another sync is already in progress")]
    Busy,
    #[error("device {0} did not accept the handshake; sync aborted")]
    HandshakeRejected(String),
    #[error("could not fetch the remote manifest: {0}")]
    Transfer(#[from] TransferError),
    #[error("could not build the local manifest: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
