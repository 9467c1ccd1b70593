//! Peer connections: handshake, message dispatch and file transfer.
//!
//! One `TransportManager` per device owns the live channel table, the
//! reassembly buffers and the pending-request registry. Every attached
//! channel gets a dispatch task that decodes frames and routes them; the
//! only way a reply reaches a caller is through that single dispatch point.

pub mod pending;
pub mod reassembly;

use crate::config::SyncConfig;
use crate::device::PeerRegistry;
use crate::error::{HandshakeError, ProtocolError, StorageError, TransferError, TrustError};
use crate::keys::{self, DeviceIdentity};
use crate::manifest::{Exclusion, Manifest};
use crate::planner::SyncAction;
use crate::protocol::Message;
use crate::snapshot::SnapshotStore;
use crate::writeback;
use pending::{await_reply, PendingKey, PendingRequests, Reply};
use reassembly::{chunk_messages, Reassembler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use storage::ContentStore;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use transport::{Channel, ChannelEvent, Connector, Frame, Link};

/// Per-peer handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingTrustCheck,
    ChannelOpening,
    AwaitingRemoteAck,
    Trusted,
    Rejected,
    Closed,
}

/// One attached channel. `peer` is known up front for channels we open and
/// bound by a verified `HANDSHAKE` for channels we accept.
struct Connection {
    id: u64,
    channel: Arc<dyn Channel>,
    peer: OnceLock<String>,
    authenticated: AtomicBool,
}

impl Connection {
    fn authenticated_peer(&self) -> Option<&str> {
        if self.authenticated.load(Ordering::SeqCst) {
            self.peer.get().map(String::as_str)
        } else {
            None
        }
    }
}

pub struct TransportManager<S: ContentStore + 'static> {
    identity: DeviceIdentity,
    config: SyncConfig,
    store: Arc<S>,
    snapshot: Arc<SnapshotStore>,
    peers: Arc<Mutex<PeerRegistry>>,
    connector: Arc<dyn Connector>,
    exclusion: Exclusion,
    channels: Mutex<HashMap<String, Arc<Connection>>>,
    reassembly: Mutex<Reassembler>,
    pending: Mutex<PendingRequests>,
    states: Mutex<HashMap<String, HandshakeState>>,
    next_connection: AtomicU64,
}

impl<S: ContentStore + 'static> TransportManager<S> {
    pub fn new(
        identity: DeviceIdentity,
        config: SyncConfig,
        store: Arc<S>,
        snapshot: Arc<SnapshotStore>,
        peers: Arc<Mutex<PeerRegistry>>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let exclusion = Exclusion::from_config(&config);
        Arc::new(Self {
            identity,
            config,
            store,
            snapshot,
            peers,
            connector,
            exclusion,
            channels: Mutex::new(HashMap::new()),
            reassembly: Mutex::new(Reassembler::default()),
            pending: Mutex::new(PendingRequests::default()),
            states: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.identity.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn snapshot(&self) -> &Arc<SnapshotStore> {
        &self.snapshot
    }

    pub fn peers(&self) -> &Arc<Mutex<PeerRegistry>> {
        &self.peers
    }

    pub async fn handshake_state(&self, peer: &str) -> HandshakeState {
        self.states
            .lock()
            .await
            .get(peer)
            .copied()
            .unwrap_or(HandshakeState::Idle)
    }

    /// Peers with an authenticated live channel.
    pub async fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn in_flight_transfers(&self) -> usize {
        self.reassembly.lock().await.in_flight()
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Attach an inbound channel. Nothing but the handshake is processed on
    /// it until the remote device proves who it is.
    pub fn accept(self: &Arc<Self>, link: Link) -> u64 {
        let conn = self.attach(link.channel, None);
        let id = conn.id;
        tracing::debug!("Accepted connection {}", id);
        tokio::spawn(self.clone().run_dispatch(conn, link.events));
        id
    }

    /// Accept every link delivered on `incoming` until the sender goes away.
    pub fn serve(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Link>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                manager.accept(link);
            }
            tracing::debug!("Stopped accepting connections");
        })
    }

    /// Authenticate to `peer` and, on success, keep the channel as that
    /// peer's live channel.
    pub async fn perform_handshake(self: &Arc<Self>, peer: &str) -> bool {
        match self.initiate(peer).await {
            Ok(()) => {
                self.set_state(peer, HandshakeState::Trusted).await;
                self.peers.lock().await.touch(peer);
                tracing::info!("Handshake with {} accepted", peer);
                true
            }
            Err(e) => {
                self.set_state(peer, HandshakeState::Rejected).await;
                tracing::warn!("Handshake with {} failed: {}", peer, e);
                false
            }
        }
    }

    async fn initiate(self: &Arc<Self>, peer: &str) -> Result<(), HandshakeError> {
        self.set_state(peer, HandshakeState::AwaitingTrustCheck).await;
        self.peers.lock().await.check_trusted(peer, None)?;

        self.set_state(peer, HandshakeState::ChannelOpening).await;
        let Link { channel, mut events } = self
            .connector
            .open(peer)
            .await
            .map_err(|e| HandshakeError::Transport(format!("{:#}", e)))?;

        let timeout = self.config.handshake_timeout();
        match tokio::time::timeout(timeout, events.recv()).await {
            Ok(Some(ChannelEvent::Open)) => {}
            Ok(_) => {
                channel.close().await;
                return Err(HandshakeError::Transport("channel closed while opening".into()));
            }
            Err(_) => {
                channel.close().await;
                return Err(HandshakeError::Timeout(timeout));
            }
        }

        let conn = self.attach(channel, Some(peer));
        tokio::spawn(self.clone().run_dispatch(conn.clone(), events));

        let key = PendingKey::HandshakeAck(peer.to_string());
        let rx = self.pending.lock().await.register(key.clone());
        self.set_state(peer, HandshakeState::AwaitingRemoteAck).await;

        let hello = Message::Handshake {
            device_id: self.identity.id.clone(),
            public_key: self.identity.public_key_export(),
            signature: hex::encode(self.identity.sign(self.identity.id.as_bytes())),
        };

        let outcome = match send_message(conn.channel.as_ref(), &hello).await {
            Ok(()) => match await_reply(rx, timeout, &format!("handshake with {}", peer)).await {
                Ok(Reply::HandshakeAck(true)) => Ok(()),
                Ok(_) => Err(HandshakeError::Rejected),
                Err(TransferError::Timeout { after, .. }) => Err(HandshakeError::Timeout(after)),
                Err(e) => Err(HandshakeError::Transport(e.to_string())),
            },
            Err(e) => Err(HandshakeError::Transport(e.to_string())),
        };

        if let Err(e) = outcome {
            self.pending.lock().await.cancel(&key);
            conn.channel.close().await;
            return Err(e);
        }

        conn.authenticated.store(true, Ordering::SeqCst);
        self.bind_live(peer, conn).await;
        Ok(())
    }

    /// Build this device's manifest of the vault.
    pub async fn generate_local_manifest(&self) -> Result<Manifest, StorageError> {
        Manifest::generate(
            &self.config.vault_id,
            &self.identity.id,
            self.store.as_ref(),
            |path| self.exclusion.is_excluded(path),
            self.config.manifest_workers,
        )
        .await
    }

    pub async fn request_remote_manifest(&self, peer: &str) -> Result<Manifest, TransferError> {
        let conn = self.live_connection(peer).await?;
        let key = PendingKey::Manifest(peer.to_string());
        let rx = self.pending.lock().await.register(key.clone());

        let reply = match send_message(conn.channel.as_ref(), &Message::RequestManifest).await {
            Ok(()) => {
                let what = format!("manifest from {}", peer);
                await_reply(rx, self.config.manifest_timeout(), &what).await
            }
            Err(e) => Err(e),
        };

        match reply {
            Ok(Reply::Manifest(manifest)) => {
                tracing::debug!("Received manifest: {}", manifest.summary());
                Ok(manifest)
            }
            Ok(_) => Err(unexpected_reply("manifest")),
            Err(e) => {
                self.pending.lock().await.cancel(&key);
                Err(e)
            }
        }
    }

    /// Push `path` to `peer` as chunks followed by `FILE_COMPLETE`. Returns
    /// the hash of the bytes that were sent.
    pub async fn send_file_in_chunks(&self, peer: &str, path: &str) -> Result<String, TransferError> {
        let conn = self.live_connection(peer).await?;
        let hash = self.stream_file(conn.channel.as_ref(), path).await?;
        tracing::debug!("Sent {} to {}", path, peer);
        Ok(hash)
    }

    /// Pull `path` from `peer`. On timeout the partial buffer and the
    /// pending entry are removed.
    pub async fn request_file(&self, peer: &str, path: &str) -> Result<Vec<u8>, TransferError> {
        let conn = self.live_connection(peer).await?;
        let key = PendingKey::File(peer.to_string(), path.to_string());

        self.reassembly.lock().await.open(peer, path);
        let rx = self.pending.lock().await.register(key.clone());

        let request = Message::FileRequest {
            path: path.to_string(),
        };
        let reply = match send_message(conn.channel.as_ref(), &request).await {
            Ok(()) => await_reply(rx, self.config.file_timeout(), path).await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(Reply::File(bytes)) => Ok(bytes),
            Ok(_) => Err(unexpected_reply("file")),
            Err(e) => {
                self.pending.lock().await.cancel(&key);
                self.reassembly.lock().await.discard(peer, path);
                Err(e)
            }
        }
    }

    pub async fn send_conflict(&self, peer: &str, action: &SyncAction) -> Result<(), TransferError> {
        let conn = self.live_connection(peer).await?;
        let message = Message::Conflict {
            path: action.path.clone(),
            local_hash: action.local_hash.clone().unwrap_or_default(),
            remote_hash: action.remote_hash.clone().unwrap_or_default(),
            base_hash: action.base_hash.clone(),
        };
        send_message(conn.channel.as_ref(), &message).await
    }

    /// Close the live channel to `peer`. Cleanup runs when the close event
    /// reaches the dispatch task.
    pub async fn disconnect(&self, peer: &str) {
        let conn = self.channels.lock().await.get(peer).cloned();
        if let Some(conn) = conn {
            conn.channel.close().await;
        }
    }

    fn attach(&self, channel: Arc<dyn Channel>, peer: Option<&str>) -> Arc<Connection> {
        let bound = OnceLock::new();
        if let Some(peer) = peer {
            let _ = bound.set(peer.to_string());
        }
        Arc::new(Connection {
            id: self.next_connection.fetch_add(1, Ordering::SeqCst),
            channel,
            peer: bound,
            authenticated: AtomicBool::new(false),
        })
    }

    async fn bind_live(&self, peer: &str, conn: Arc<Connection>) {
        let previous = self.channels.lock().await.insert(peer.to_string(), conn.clone());
        if let Some(previous) = previous.filter(|p| p.id != conn.id) {
            tracing::debug!("Replacing connection {} to {}", previous.id, peer);
            previous.channel.close().await;
        }
    }

    async fn live_connection(&self, peer: &str) -> Result<Arc<Connection>, TransferError> {
        self.channels
            .lock()
            .await
            .get(peer)
            .filter(|c| c.channel.is_open())
            .cloned()
            .ok_or_else(|| TransferError::NoChannel(peer.to_string()))
    }

    async fn set_state(&self, peer: &str, state: HandshakeState) {
        tracing::debug!("Handshake state for {}: {:?}", peer, state);
        self.states.lock().await.insert(peer.to_string(), state);
    }

    async fn stream_file(&self, channel: &dyn Channel, path: &str) -> Result<String, TransferError> {
        let bytes = self
            .store
            .read_bytes(path)
            .await
            .map_err(|e| StorageError::new(path, e))?;
        let hash = keys::hash(&bytes);
        for message in chunk_messages(path, &bytes, self.config.chunk_size) {
            send_message(channel, &message).await?;
        }
        Ok(hash)
    }

    async fn run_dispatch(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => tracing::debug!("Connection {} open", conn.id),
                ChannelEvent::Message(frame) => self.handle_frame(&conn, frame).await,
                ChannelEvent::Close => break,
            }
        }
        self.handle_close(&conn).await;
    }

    async fn handle_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping frame on connection {}: {}", conn.id, e);
                return;
            }
        };

        match message {
            Message::Handshake {
                device_id,
                public_key,
                signature,
            } => {
                self.handle_handshake(conn, device_id, public_key, signature)
                    .await
            }
            Message::HandshakeAck { accepted } => {
                let Some(peer) = conn.peer.get() else {
                    tracing::warn!("Unsolicited HANDSHAKE_ACK on connection {}", conn.id);
                    return;
                };
                let key = PendingKey::HandshakeAck(peer.clone());
                if !self
                    .pending
                    .lock()
                    .await
                    .resolve(&key, Ok(Reply::HandshakeAck(accepted)))
                {
                    tracing::debug!("No handshake waiting for {}", peer);
                }
            }
            other => match conn.authenticated_peer() {
                Some(peer) => self.handle_message(conn, peer, other).await,
                None => tracing::warn!(
                    "Dropping {} from unauthenticated connection {}",
                    other.kind(),
                    conn.id
                ),
            },
        }
    }

    /// Responder side. Bad key material counts as a failed check.
    async fn handle_handshake(
        &self,
        conn: &Arc<Connection>,
        device_id: String,
        public_key: String,
        signature: String,
    ) {
        let accepted = match self.admit(conn, &device_id, &public_key, &signature).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Rejected handshake from {}: {}", device_id, e);
                false
            }
        };

        if accepted {
            conn.authenticated.store(true, Ordering::SeqCst);
            self.bind_live(&device_id, conn.clone()).await;
            self.set_state(&device_id, HandshakeState::Trusted).await;
            tracing::info!("Accepted handshake from {}", device_id);
        }

        let ack = Message::HandshakeAck { accepted };
        if let Err(e) = send_message(conn.channel.as_ref(), &ack).await {
            tracing::warn!("Could not acknowledge handshake from {}: {}", device_id, e);
        }
    }

    async fn admit(
        &self,
        conn: &Connection,
        device_id: &str,
        public_key: &str,
        signature: &str,
    ) -> Result<(), HandshakeError> {
        verify_handshake(device_id, public_key, signature)?;

        {
            let mut peers = self.peers.lock().await;
            match peers.check_trusted(device_id, Some(public_key)) {
                Ok(()) => peers.touch(device_id),
                Err(TrustError::UnknownPeer(id)) => {
                    if let Err(e) = peers.note_incoming(&id, public_key) {
                        tracing::warn!("Could not record pending device {}: {:#}", id, e);
                    }
                    return Err(TrustError::UnknownPeer(id).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if conn.peer.set(device_id.to_string()).is_err()
            && conn.peer.get().map(String::as_str) != Some(device_id)
        {
            return Err(HandshakeError::Transport(
                "connection already bound to another device".into(),
            ));
        }

        if let Err(e) = self.snapshot.record_peer_key(device_id, public_key).await {
            tracing::warn!("Could not store key for {}: {}", device_id, e);
        }
        Ok(())
    }

    async fn handle_message(&self, conn: &Arc<Connection>, peer: &str, message: Message) {
        tracing::debug!("{} from {}", message.kind(), peer);
        match message {
            Message::RequestManifest => match self.generate_local_manifest().await {
                Ok(payload) => {
                    let reply = Message::ManifestResponse { payload };
                    if let Err(e) = send_message(conn.channel.as_ref(), &reply).await {
                        tracing::warn!("Could not send manifest to {}: {}", peer, e);
                    }
                }
                Err(e) => tracing::warn!("Could not build manifest for {}: {}", peer, e),
            },
            Message::ManifestResponse { payload } => {
                let key = PendingKey::Manifest(peer.to_string());
                if !self.pending.lock().await.resolve(&key, Ok(Reply::Manifest(payload))) {
                    tracing::debug!("Ignoring unrequested manifest from {}", peer);
                }
            }
            Message::FileRequest { path } => {
                if self.exclusion.is_excluded(&path) {
                    tracing::warn!("Refusing to serve excluded path {} to {}", path, peer);
                    return;
                }
                if let Err(e) = self.stream_file(conn.channel.as_ref(), &path).await {
                    tracing::warn!("Could not serve {} to {}: {}", path, peer, e);
                }
            }
            Message::FileChunk(chunk) => {
                if self.exclusion.is_excluded(&chunk.path) {
                    tracing::warn!("Dropping chunk for excluded path {} from {}", chunk.path, peer);
                    return;
                }
                if let Err(e) = self.reassembly.lock().await.accept(peer, chunk) {
                    tracing::warn!("Dropping chunk from {}: {}", peer, e);
                }
            }
            Message::FileComplete { path } => self.handle_complete(peer, &path).await,
            Message::Conflict {
                path,
                local_hash,
                remote_hash,
                ..
            } => {
                tracing::warn!(
                    "{} reports a conflict on {} (theirs {}, ours {})",
                    peer,
                    path,
                    local_hash,
                    remote_hash
                );
            }
            Message::Handshake { .. } | Message::HandshakeAck { .. } => {}
        }
    }

    async fn handle_complete(&self, peer: &str, path: &str) {
        let Some(result) = self.reassembly.lock().await.complete(peer, path) else {
            tracing::debug!("FILE_COMPLETE for {} without a transfer in progress", path);
            return;
        };

        let key = PendingKey::File(peer.to_string(), path.to_string());
        let mut pending = self.pending.lock().await;
        if pending.is_waiting(&key) {
            pending.resolve(&key, result.map(Reply::File));
            return;
        }
        drop(pending);

        match result {
            Ok(bytes) => self.write_received(peer, path, &bytes).await,
            Err(e) => tracing::warn!("Discarding upload from {}: {}", peer, e),
        }
    }

    /// Store a file the peer pushed to us and record it as agreed.
    async fn write_received(&self, peer: &str, path: &str, bytes: &[u8]) {
        if self.exclusion.is_excluded(path) {
            tracing::warn!("Refusing upload of excluded path {} from {}", path, peer);
            return;
        }

        writeback::backup_file(self.store.as_ref(), path, self.config.max_backups_per_file).await;
        if let Err(e) = writeback::write_content(self.store.as_ref(), path, bytes).await {
            tracing::warn!("Could not write {} from {}: {:#}", path, peer, e);
            return;
        }

        let hash = keys::hash(bytes);
        if let Err(e) = self.snapshot.record_file_synced(peer, path, &hash).await {
            tracing::warn!("Could not record {} as synced: {}", path, e);
        }
        tracing::info!("Received {} ({} bytes) from {}", path, bytes.len(), peer);
    }

    async fn handle_close(&self, conn: &Arc<Connection>) {
        tracing::debug!("Connection {} closed", conn.id);
        let Some(peer) = conn.peer.get() else {
            return;
        };

        let was_live = {
            let mut channels = self.channels.lock().await;
            match channels.get(peer) {
                Some(live) if live.id == conn.id => {
                    channels.remove(peer);
                    true
                }
                _ => false,
            }
        };

        if was_live {
            let dropped = self.reassembly.lock().await.discard_peer(peer);
            let failed = self.pending.lock().await.cancel_peer(peer);
            self.set_state(peer, HandshakeState::Closed).await;
            tracing::info!(
                "Channel to {} closed ({} partial transfers dropped, {} requests failed)",
                peer,
                dropped,
                failed
            );
        } else if !conn.authenticated.load(Ordering::SeqCst) {
            self.pending
                .lock()
                .await
                .cancel(&PendingKey::HandshakeAck(peer.clone()));
        }
    }
}

fn verify_handshake(device_id: &str, public_key: &str, signature: &str) -> Result<(), HandshakeError> {
    let signature = hex::decode(signature).map_err(|_| HandshakeError::InvalidSignature)?;
    match keys::verify(public_key, device_id.as_bytes(), &signature) {
        Ok(true) => Ok(()),
        Ok(false) => Err(HandshakeError::InvalidSignature),
        Err(e) => {
            tracing::debug!("Handshake from {} carried bad key material: {}", device_id, e);
            Err(HandshakeError::InvalidSignature)
        }
    }
}

async fn send_message(channel: &dyn Channel, message: &Message) -> Result<(), TransferError> {
    let frame = message.encode()?;
    channel
        .send(frame)
        .await
        .map_err(|e| TransferError::Send(format!("{:#}", e)))
}

fn unexpected_reply(expected: &str) -> TransferError {
    ProtocolError::Malformed(format!("expected a {} reply", expected)).into()
}
