//! Chunking: split an outbound transfer into bounded byte ranges.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024; // 256 KiB

/// Upper bound so a single chunk always fits in one wire frame.
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Half-open byte range [start, end) within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Clamp a configured chunk size: 0 means default, anything above the frame bound is capped.
pub fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size.min(MAX_CHUNK_SIZE)
    }
}

/// The chunk that starts at `offset`, or None once `offset` reaches `total_len`.
pub fn next_chunk(offset: u64, total_len: u64, chunk_size: u64) -> Option<ChunkRange> {
    if offset >= total_len {
        return None;
    }
    let size = effective_chunk_size(chunk_size);
    Some(ChunkRange {
        start: offset,
        end: offset.saturating_add(size).min(total_len),
    })
}
