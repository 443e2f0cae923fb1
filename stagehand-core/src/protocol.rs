//! Stagehand streaming protocol: message types, error codes and version negotiation.

use serde::{Deserialize, Serialize};

use crate::integrity::ContentHash;
use crate::selection::Selection;

/// Highest protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Oldest protocol version still accepted.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Pick the highest version both sides support, or None.
pub fn negotiate_version(client_min: u16, client_max: u16) -> Option<u16> {
    if client_min > client_max {
        return None;
    }
    let version = client_max.min(PROTOCOL_VERSION);
    if version < client_min.max(MIN_PROTOCOL_VERSION) {
        return None;
    }
    Some(version)
}

/// Error codes carried in `Message::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    UnsupportedProtocol,
    /// Resume requested against a hash the server no longer serves; restart from zero.
    ContentChanged,
    NotFound,
    InternalError,
    MalformedFrame,
    InvalidRange,
    BuildFailed,
    /// Retries exhausted; the transfer is abandoned.
    TransferAborted,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    pub modified: u64,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client → server, first frame on every connection.
    Hello {
        min_version: u16,
        max_version: u16,
        client: String,
    },
    /// Server → client: negotiated version and the revision the session starts pinned to.
    Welcome {
        version: u16,
        session_id: [u8; 16],
        revision: u64,
    },
    /// List items whose path starts with `prefix`.
    List { prefix: String },
    Listing {
        revision: u64,
        entries: Vec<EntryMeta>,
    },
    /// Request one item. `offset > 0` resumes and requires `expected_hash`.
    GetItem {
        path: String,
        offset: u64,
        expected_hash: Option<ContentHash>,
    },
    /// Request an archive covering `selection`. Resume rules as for `GetItem`.
    GetArchive {
        selection: Selection,
        offset: u64,
        expected_hash: Option<ContentHash>,
    },
    /// Server → client: a transfer begins at `offset`.
    TransferStart {
        transfer_id: [u8; 16],
        name: String,
        revision: u64,
        total_len: u64,
        content_hash: ContentHash,
        offset: u64,
        archive_id: Option<[u8; 16]>,
    },
    /// Chunk payload with its SHA-256.
    Chunk {
        transfer_id: [u8; 16],
        offset: u64,
        checksum: [u8; 32],
        payload: Vec<u8>,
    },
    /// Client → server: everything below `next_offset` is received and verified.
    ChunkAck {
        transfer_id: [u8; 16],
        next_offset: u64,
    },
    /// Server → client: all bytes sent. `sent_digest` covers the bytes of this transfer only.
    TransferEnd {
        transfer_id: [u8; 16],
        content_hash: ContentHash,
        bytes_sent: u64,
        sent_digest: [u8; 32],
    },
    /// Client → server: stop the current transfer.
    Cancel { transfer_id: [u8; 16] },
    Ping,
    Pong { revision: u64 },
    Error { code: ErrorCode, message: String },
    /// Graceful close from either side.
    Bye,
}

impl Message {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_highest_common_version() {
        assert_eq!(negotiate_version(1, 1), Some(1));
        assert_eq!(negotiate_version(1, 9), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn rejects_disjoint_ranges() {
        assert_eq!(negotiate_version(PROTOCOL_VERSION + 1, PROTOCOL_VERSION + 3), None);
        assert_eq!(negotiate_version(0, 0), None);
        assert_eq!(negotiate_version(3, 1), None);
    }
}
