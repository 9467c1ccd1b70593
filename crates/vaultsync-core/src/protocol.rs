//! Wire messages.
//!
//! Every message except `FILE_CHUNK` travels as a JSON text frame tagged by
//! its `type` field. Chunks carry raw bytes, so they travel as a binary
//! frame: `u32 BE header length | JSON header | chunk bytes`.

use crate::error::ProtocolError;
use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};
use transport::Frame;

const CHUNK_TYPE: &str = "FILE_CHUNK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    RequestManifest,
    ManifestResponse {
        payload: Manifest,
    },
    FileRequest {
        path: String,
    },
    #[serde(skip)]
    FileChunk(FileChunk),
    FileComplete {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Conflict {
        path: String,
        local_hash: String,
        remote_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Handshake {
        device_id: String,
        public_key: String,
        /// Hex encoded Ed25519 signature over the device id.
        signature: String,
    },
    HandshakeAck {
        accepted: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub path: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkHeader {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    chunk_index: usize,
    total_chunks: usize,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestManifest => "REQUEST_MANIFEST",
            Message::ManifestResponse { .. } => "MANIFEST_RESPONSE",
            Message::FileRequest { .. } => "FILE_REQUEST",
            Message::FileChunk(_) => CHUNK_TYPE,
            Message::FileComplete { .. } => "FILE_COMPLETE",
            Message::Conflict { .. } => "CONFLICT",
            Message::Handshake { .. } => "HANDSHAKE",
            Message::HandshakeAck { .. } => "HANDSHAKE_ACK",
        }
    }

    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        match self {
            Message::FileChunk(chunk) => {
                let header = ChunkHeader {
                    kind: CHUNK_TYPE.to_string(),
                    path: chunk.path.clone(),
                    chunk_index: chunk.chunk_index,
                    total_chunks: chunk.total_chunks,
                };
                let header = serde_json::to_vec(&header)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

                let mut out = Vec::with_capacity(4 + header.len() + chunk.data.len());
                out.extend_from_slice(&(header.len() as u32).to_be_bytes());
                out.extend_from_slice(&header);
                out.extend_from_slice(&chunk.data);
                Ok(Frame::Binary(out))
            }
            other => serde_json::to_string(other)
                .map(Frame::Text)
                .map_err(|e| ProtocolError::Malformed(e.to_string())),
        }
    }

    /// Validate and decode one inbound frame.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame {
            Frame::Text(text) => {
                serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
            }
            Frame::Binary(bytes) => decode_chunk(bytes).map(Message::FileChunk),
        }
    }
}

fn decode_chunk(bytes: &[u8]) -> Result<FileChunk, ProtocolError> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Malformed("binary frame too short".into()));
    }
    let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let rest = &bytes[4..];
    if header_len > rest.len() {
        return Err(ProtocolError::Malformed(format!(
            "chunk header of {} bytes exceeds frame",
            header_len
        )));
    }

    let header: ChunkHeader = serde_json::from_slice(&rest[..header_len])
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if header.kind != CHUNK_TYPE {
        return Err(ProtocolError::Malformed(format!(
            "unexpected binary message {}",
            header.kind
        )));
    }

    Ok(FileChunk {
        path: header.path,
        chunk_index: header.chunk_index,
        total_chunks: header.total_chunks,
        data: rest[header_len..].to_vec(),
    })
}
