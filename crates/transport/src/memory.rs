//! In-process channel pair.

use crate::{Channel, ChannelEvent, Connector, Frame, Link};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub struct MemoryChannel {
    to_peer: mpsc::UnboundedSender<ChannelEvent>,
    to_self: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

/// Create two connected ends. Both event streams start with `Open`.
pub fn pair() -> (Link, Link) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let _ = a_tx.send(ChannelEvent::Open);
    let _ = b_tx.send(ChannelEvent::Open);

    let a = MemoryChannel {
        to_peer: b_tx.clone(),
        to_self: a_tx.clone(),
        open: open.clone(),
    };
    let b = MemoryChannel {
        to_peer: a_tx,
        to_self: b_tx,
        open,
    };

    (
        Link { channel: Arc::new(a), events: a_rx },
        Link { channel: Arc::new(b), events: b_rx },
    )
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        if !self.is_open() {
            anyhow::bail!("channel closed");
        }
        self.to_peer
            .send(ChannelEvent::Message(frame))
            .map_err(|_| anyhow::anyhow!("peer end dropped"))
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.to_peer.send(ChannelEvent::Close);
            let _ = self.to_self.send(ChannelEvent::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// In-process switchboard: devices listen under their id and connectors
/// hand the far end of each new pair to the listener.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Link>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incoming links addressed to `peer_id`. Listening again replaces the
    /// previous listener.
    pub async fn listen(&self, peer_id: &str) -> mpsc::UnboundedReceiver<Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.insert(peer_id.to_string(), tx);
        rx
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn open(&self, peer_id: &str) -> anyhow::Result<Link> {
        let listeners = self.listeners.lock().await;
        let listener = listeners
            .get(peer_id)
            .ok_or_else(|| anyhow::anyhow!("{} is not listening", peer_id))?;

        let (ours, theirs) = pair();
        listener
            .send(theirs)
            .map_err(|_| anyhow::anyhow!("{} stopped listening", peer_id))?;
        Ok(ours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_routes_to_listener() -> anyhow::Result<()> {
        let net = MemoryNetwork::new();
        let mut incoming = net.listen("b").await;

        assert!(net.open("nobody").await.is_err());

        let ours = net.open("b").await?;
        let mut theirs = incoming.recv().await.expect("link delivered");
        assert_eq!(theirs.events.recv().await, Some(ChannelEvent::Open));

        ours.channel.send(Frame::Text("ping".into())).await?;
        assert_eq!(
            theirs.events.recv().await,
            Some(ChannelEvent::Message(Frame::Text("ping".into())))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_pair_delivers_and_closes() -> anyhow::Result<()> {
        let (a, mut b) = pair();
        let mut a_events = a.events;

        assert_eq!(b.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Open));

        a.channel.send(Frame::Text("hi".into())).await?;
        a.channel.send(Frame::Binary(vec![1, 2])).await?;
        assert_eq!(
            b.events.recv().await,
            Some(ChannelEvent::Message(Frame::Text("hi".into())))
        );
        assert_eq!(
            b.events.recv().await,
            Some(ChannelEvent::Message(Frame::Binary(vec![1, 2])))
        );

        a.channel.close().await;
        assert!(!b.channel.is_open());
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Close));
        assert!(b.channel.send(Frame::Text("late".into())).await.is_err());
        Ok(())
    }
}
