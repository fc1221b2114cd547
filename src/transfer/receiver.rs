use crate::common::FileInfo;
use crate::transfer::progress::ProgressTracker;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::time::Instant;

/// Why a chunk was not stored. Always logged and ignored, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkAnomaly {
    #[error("offset {offset} is not a multiple of the chunk size {chunk_size}")]
    Misaligned { offset: u64, chunk_size: usize },

    #[error("offset {offset} is beyond the file size {size}")]
    OutOfRange { offset: u64, size: u64 },

    #[error("chunk at offset {0} already received")]
    Duplicate(u64),

    #[error("chunk at offset {offset} has {got} bytes, expected {expected}")]
    LengthMismatch {
        offset: u64,
        expected: usize,
        got: usize,
    },
}

/// Offset-addressed buffer for one incoming file. Slots exist only for
/// chunks that arrived, so memory follows received bytes, not the declared size.
pub struct Reassembly {
    pub info: FileInfo,
    chunk_size: usize,
    chunks: BTreeMap<u64, Bytes>,
    progress: ProgressTracker,
    pub started_at: Instant,
}

impl Reassembly {
    pub fn new(info: FileInfo, chunk_size: usize) -> Self {
        let progress = ProgressTracker::new(info.size);
        Self {
            info,
            chunk_size,
            chunks: BTreeMap::new(),
            progress,
            started_at: Instant::now(),
        }
    }

    /// Store one chunk. Returns the percentage received so far.
    pub fn insert(&mut self, offset: u64, data: Bytes) -> Result<f64, ChunkAnomaly> {
        if offset % self.chunk_size as u64 != 0 {
            return Err(ChunkAnomaly::Misaligned {
                offset,
                chunk_size: self.chunk_size,
            });
        }

        if offset >= self.info.size {
            return Err(ChunkAnomaly::OutOfRange {
                offset,
                size: self.info.size,
            });
        }
        if self.chunks.contains_key(&offset) {
            return Err(ChunkAnomaly::Duplicate(offset));
        }

        let expected = (self.info.size - offset).min(self.chunk_size as u64) as usize;
        if data.len() != expected {
            return Err(ChunkAnomaly::LengthMismatch {
                offset,
                expected,
                got: data.len(),
            });
        }

        let len = data.len() as u64;
        self.chunks.insert(offset, data);
        let (_, percent) = self.progress.advance(len);
        Ok(percent)
    }

    pub fn received_bytes(&self) -> u64 {
        self.progress.done()
    }

    /// Byte count is the only completion criterion
    pub fn is_complete(&self) -> bool {
        self.received_bytes() == self.info.size
    }

    /// Concatenate chunks in offset order
    pub fn assemble(self) -> Bytes {
        self.progress.complete();
        let mut out = BytesMut::with_capacity(self.received_bytes() as usize);
        for chunk in self.chunks.into_values() {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}
