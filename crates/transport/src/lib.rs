//! Message channel layer.
//!
//! The sync engine only needs a duplex channel per peer that can carry text
//! and binary frames plus open/close notifications. Two implementations are
//! provided: an in-process pair for tests and embedding, and a
//! length-prefixed TCP channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

/// A single message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound notifications for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Frame),
    Close,
}

/// Sending half of a duplex channel.
///
/// No ordering or delivery guarantee is promised to callers beyond what
/// the concrete implementation happens to provide.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, frame: Frame) -> anyhow::Result<()>;
    async fn close(&self);
    fn is_open(&self) -> bool;
}

/// A freshly opened channel together with its inbound event stream.
pub struct Link {
    pub channel: Arc<dyn Channel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens channels to peers by device id.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, peer_id: &str) -> anyhow::Result<Link>;
}
