//! Request/response correlation.
//!
//! Every outbound request that expects an answer parks a `oneshot` sender
//! here; the dispatch task resolves it when the matching reply arrives.

use crate::error::TransferError;
use crate::manifest::Manifest;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKey {
    HandshakeAck(String),
    Manifest(String),
    File(String, String),
}

impl PendingKey {
    pub fn peer(&self) -> &str {
        match self {
            PendingKey::HandshakeAck(peer) | PendingKey::Manifest(peer) | PendingKey::File(peer, _) => peer,
        }
    }
}

#[derive(Debug)]
pub enum Reply {
    HandshakeAck(bool),
    Manifest(Manifest),
    File(Vec<u8>),
}

pub type ReplyResult = Result<Reply, TransferError>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: HashMap<PendingKey, oneshot::Sender<ReplyResult>>,
}

impl PendingRequests {
    /// Park a request. A previous waiter on the same key is dropped, which
    /// fails it as closed.
    pub fn register(&mut self, key: PendingKey) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        if self.waiting.insert(key.clone(), tx).is_some() {
            tracing::debug!("Replaced pending request {:?}", key);
        }
        rx
    }

    /// Hand `reply` to whoever waits on `key`. Returns false if nobody does.
    pub fn resolve(&mut self, key: &PendingKey, reply: ReplyResult) -> bool {
        match self.waiting.remove(key) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&mut self, key: &PendingKey) {
        self.waiting.remove(key);
    }

    /// Fail every request addressed to `peer`.
    pub fn cancel_peer(&mut self, peer: &str) -> usize {
        let keys: Vec<PendingKey> = self
            .waiting
            .keys()
            .filter(|k| k.peer() == peer)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(tx) = self.waiting.remove(key) {
                let _ = tx.send(Err(TransferError::ChannelClosed(peer.to_string())));
            }
        }
        keys.len()
    }

    pub fn is_waiting(&self, key: &PendingKey) -> bool {
        self.waiting.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Wait for a parked reply, giving up after `after`.
pub async fn await_reply(
    rx: oneshot::Receiver<ReplyResult>,
    after: Duration,
    what: &str,
) -> ReplyResult {
    match tokio::time::timeout(after, rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Err(TransferError::ChannelClosed(what.to_string())),
        Err(_) => Err(TransferError::Timeout {
            what: what.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_reaches_waiter() {
        let mut pending = PendingRequests::default();
        let key = PendingKey::File("peer".into(), "a.md".into());
        let rx = pending.register(key.clone());

        assert!(pending.resolve(&key, Ok(Reply::File(b"hi".to_vec()))));
        assert!(pending.is_empty());
        match await_reply(rx, Duration::from_secs(1), "a.md").await {
            Ok(Reply::File(bytes)) => assert_eq!(bytes, b"hi"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let mut pending = PendingRequests::default();
        let _rx = pending.register(PendingKey::Manifest("p1".into()));
        assert!(!pending.resolve(&PendingKey::Manifest("p2".into()), Ok(Reply::HandshakeAck(true))));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_peer_fails_only_that_peer() {
        let mut pending = PendingRequests::default();
        let a = pending.register(PendingKey::Manifest("p1".into()));
        let b = pending.register(PendingKey::File("p1".into(), "x.md".into()));
        let _c = pending.register(PendingKey::Manifest("p2".into()));

        assert_eq!(pending.cancel_peer("p1"), 2);
        assert!(pending.is_waiting(&PendingKey::Manifest("p2".into())));
        for rx in [a, b] {
            assert!(matches!(
                await_reply(rx, Duration::from_secs(1), "x").await,
                Err(TransferError::ChannelClosed(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut pending = PendingRequests::default();
        let rx = pending.register(PendingKey::Manifest("p1".into()));
        let result = await_reply(rx, Duration::from_secs(5), "manifest from p1").await;
        assert!(matches!(result, Err(TransferError::Timeout { .. })));
        // The entry outlives the timeout until the caller cancels it.
        assert!(pending.is_waiting(&PendingKey::Manifest("p1".into())));
    }
}
