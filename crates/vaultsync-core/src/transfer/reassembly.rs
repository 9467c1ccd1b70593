//! Chunking and index-addressed reassembly.
//!
//! Arrival order is never assumed: each chunk lands at its declared index
//! and the file is only stitched together on `FILE_COMPLETE`.

use crate::error::{ProtocolError, TransferError};
use crate::protocol::{FileChunk, Message};
use std::collections::{BTreeMap, HashMap};

/// Number of chunks on the wire. An empty file still travels as one empty
/// chunk so the receiver opens a buffer for it.
pub fn total_chunks(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1)).max(1)
}

/// The chunk messages for `data` followed by the completion marker.
pub fn chunk_messages(path: &str, data: &[u8], chunk_size: usize) -> Vec<Message> {
    let total = total_chunks(data.len(), chunk_size);
    let chunk = |index: usize, bytes: &[u8]| {
        Message::FileChunk(FileChunk {
            path: path.to_string(),
            chunk_index: index,
            total_chunks: total,
            data: bytes.to_vec(),
        })
    };

    let mut out: Vec<Message> = if data.is_empty() {
        vec![chunk(0, &[])]
    } else {
        data.chunks(chunk_size.max(1))
            .enumerate()
            .map(|(index, bytes)| chunk(index, bytes))
            .collect()
    };
    out.push(Message::FileComplete {
        path: path.to_string(),
    });
    out
}

/// Sparse buffer for one in-flight file.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    total: Option<usize>,
    chunks: BTreeMap<usize, Vec<u8>>,
}

impl ChunkBuffer {
    pub fn insert(&mut self, chunk: FileChunk) -> Result<(), ProtocolError> {
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(ProtocolError::ChunkOutOfRange {
                path: chunk.path,
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }
        match self.total {
            Some(expected) if expected != chunk.total_chunks => {
                return Err(ProtocolError::ChunkCountMismatch {
                    path: chunk.path,
                    expected,
                    got: chunk.total_chunks,
                });
            }
            _ => self.total = Some(chunk.total_chunks),
        }
        self.chunks.insert(chunk.chunk_index, chunk.data);
        Ok(())
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate in index order. A buffer that never saw a chunk is an
    /// empty file.
    pub fn finish(self, path: &str) -> Result<Vec<u8>, TransferError> {
        let expected = self.total.unwrap_or(0);
        if self.chunks.len() != expected {
            return Err(TransferError::Incomplete {
                path: path.to_string(),
                received: self.chunks.len(),
                expected,
            });
        }

        let len = self.chunks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for chunk in self.chunks.into_values() {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// All in-flight buffers, keyed by (peer, path).
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<(String, String), ChunkBuffer>,
}

impl Reassembler {
    /// Start a fresh buffer, dropping anything left from an earlier attempt.
    pub fn open(&mut self, peer: &str, path: &str) {
        self.buffers
            .insert((peer.to_string(), path.to_string()), ChunkBuffer::default());
    }

    pub fn accept(&mut self, peer: &str, chunk: FileChunk) -> Result<(), ProtocolError> {
        self.buffers
            .entry((peer.to_string(), chunk.path.clone()))
            .or_default()
            .insert(chunk)
    }

    /// Finish the buffer for `path`. `None` when no buffer is open, which
    /// covers duplicate or stray completion signals.
    pub fn complete(&mut self, peer: &str, path: &str) -> Option<Result<Vec<u8>, TransferError>> {
        self.buffers
            .remove(&(peer.to_string(), path.to_string()))
            .map(|buffer| buffer.finish(path))
    }

    pub fn discard(&mut self, peer: &str, path: &str) {
        self.buffers.remove(&(peer.to_string(), path.to_string()));
    }

    pub fn discard_peer(&mut self, peer: &str) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|(p, _), _| p != peer);
        before - self.buffers.len()
    }

    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }
}
