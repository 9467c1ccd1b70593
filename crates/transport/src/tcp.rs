//! TCP channel with length-prefixed frames.
//!
//! Frame = u32 BE length | u8 kind | payload, where the length covers the
//! kind byte and payload. Kind 0 is UTF-8 text, kind 1 is raw bytes.

use crate::{Channel, ChannelEvent, Connector, Frame, Link};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Upper bound on a single frame, to keep a bad peer from exhausting memory.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

pub async fn write_frame<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    frame: &Frame,
) -> std::io::Result<()> {
    let (kind, payload) = match frame {
        Frame::Text(s) => (KIND_TEXT, s.as_bytes()),
        Frame::Binary(b) => (KIND_BINARY, b.as_slice()),
    };
    if payload.len() + 1 > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame too large",
        ));
    }

    transport
        .write_all(&((payload.len() + 1) as u32).to_be_bytes())
        .await?;
    transport.write_all(&[kind]).await?;
    transport.write_all(payload).await?;
    transport.flush().await?;
    Ok(())
}

pub async fn read_frame<T: AsyncRead + Unpin + Send>(transport: &mut T) -> std::io::Result<Frame> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len == 0 || len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad frame length",
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    let payload = buf.split_off(1);

    match buf[0] {
        KIND_TEXT => String::from_utf8(payload)
            .map(Frame::Text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        KIND_BINARY => Ok(Frame::Binary(payload)),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown frame kind {}", other),
        )),
    }
}

pub struct TcpChannel {
    writer: Mutex<OwnedWriteHalf>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl TcpChannel {
    /// Wrap a connected stream. A reader task forwards inbound frames as
    /// events until EOF or a framing error, then emits `Close`.
    pub fn spawn(stream: TcpStream) -> Link {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let _ = tx.send(ChannelEvent::Open);

        let reader_tx = tx.clone();
        let reader_open = open.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        if reader_tx.send(ChannelEvent::Message(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            tracing::warn!("Channel to {} failed: {}", peer, e);
                        }
                        break;
                    }
                }
            }
            if reader_open.swap(false, Ordering::SeqCst) {
                let _ = reader_tx.send(ChannelEvent::Close);
            }
        });

        let channel = TcpChannel {
            writer: Mutex::new(writer),
            events: tx,
            open,
        };

        Link {
            channel: Arc::new(channel),
            events: rx,
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        if !self.is_open() {
            anyhow::bail!("channel closed");
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
            let _ = self.events.send(ChannelEvent::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Opens TCP channels using a device id → `host:port` table.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    addresses: HashMap<String, String>,
}

impl TcpConnector {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, peer_id: &str) -> anyhow::Result<Link> {
        let addr = self
            .addresses
            .get(peer_id)
            .ok_or_else(|| anyhow::anyhow!("No address known for peer {}", peer_id))?;

        tracing::debug!("Connecting to {} at {}", peer_id, addr);
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpChannel::spawn(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Frame::Text("{\"type\":\"REQUEST_MANIFEST\"}".into())).await?;
        write_frame(&mut a, &Frame::Binary(vec![0, 255, 7])).await?;
        write_frame(&mut a, &Frame::Binary(Vec::new())).await?;

        assert_eq!(
            read_frame(&mut b).await?,
            Frame::Text("{\"type\":\"REQUEST_MANIFEST\"}".into())
        );
        assert_eq!(read_frame(&mut b).await?, Frame::Binary(vec![0, 255, 7]));
        assert_eq!(read_frame(&mut b).await?, Frame::Binary(Vec::new()));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await?;
        assert!(read_frame(&mut b).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_tcp_channel_exchange() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut link = TcpChannel::spawn(stream);
            assert_eq!(link.events.recv().await, Some(ChannelEvent::Open));
            let got = link.events.recv().await;
            link.channel.send(Frame::Text("pong".into())).await?;
            anyhow::Ok(got)
        });

        let connector = TcpConnector::new(HashMap::from([("peer".to_string(), addr.to_string())]));
        let mut link = connector.open("peer").await?;
        assert_eq!(link.events.recv().await, Some(ChannelEvent::Open));
        link.channel.send(Frame::Binary(vec![9, 9])).await?;

        assert_eq!(
            link.events.recv().await,
            Some(ChannelEvent::Message(Frame::Text("pong".into())))
        );
        assert_eq!(
            server.await??,
            Some(ChannelEvent::Message(Frame::Binary(vec![9, 9])))
        );

        assert!(connector.open("stranger").await.is_err());
        Ok(())
    }
}
