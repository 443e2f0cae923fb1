//! Session manager: per-client state, revision pinning, transfers and the resume policy.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::builder::{ArchiveBuilder, BuildError};
use crate::chunk::{self, ChunkRange};
use crate::index::{ContentIndex, ContentItem, Revision};
use crate::integrity::{self, ChecksumAccumulator, ContentHash};
use crate::protocol::{EntryMeta, ErrorCode};
use crate::selection::{Selection, SelectionError};
use crate::store::BlobStore;

/// Default number of automatic resumes per transfer before giving up.
pub const DEFAULT_MAX_RESUME_ATTEMPTS: u32 = 3;

pub type SessionId = [u8; 16];
pub type TransferId = [u8; 16];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chunk_size: u64,
    pub max_resume_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: chunk::DEFAULT_CHUNK_SIZE,
            max_resume_attempts: DEFAULT_MAX_RESUME_ATTEMPTS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no such item: {0}")]
    NotFound(String),
    #[error("content changed since {expected}; restart from offset 0")]
    ContentChanged { expected: ContentHash },
    #[error("offset {offset} is past the end ({total_len} bytes)")]
    InvalidRange { offset: u64, total_len: u64 },
    #[error("resuming at offset {0} requires the last seen content hash")]
    MissingResumeHash(u64),
    #[error("archive build failed: {0}")]
    Build(BuildError),
    #[error("transfer aborted after {attempts} resume attempts")]
    Aborted { attempts: u32 },
    #[error("session closed")]
    SessionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::NotFound(_) => ErrorCode::NotFound,
            TransferError::ContentChanged { .. } => ErrorCode::ContentChanged,
            TransferError::InvalidRange { .. } | TransferError::MissingResumeHash(_) => {
                ErrorCode::InvalidRange
            }
            TransferError::Build(BuildError::Selection(SelectionError::NotFound(_))) => {
                ErrorCode::NotFound
            }
            TransferError::Build(_) => ErrorCode::BuildFailed,
            TransferError::Aborted { .. } | TransferError::SessionClosed => {
                ErrorCode::TransferAborted
            }
            TransferError::Io(_) => ErrorCode::InternalError,
        }
    }
}

impl From<BuildError> for TransferError {
    fn from(e: BuildError) -> Self {
        TransferError::Build(e)
    }
}

/// What a transfer reads from. Both keep their source alive for the transfer's lifetime.
enum Source {
    Item {
        item: ContentItem,
        store: Arc<dyn BlobStore>,
    },
    Archive(Arc<Archive>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Completed,
    Aborted,
}

/// One outbound chunk, ready to frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    pub offset: u64,
    pub checksum: [u8; 32],
    pub payload: Vec<u8>,
}

/// Decision after a transient send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend from this (last acknowledged) offset.
    Resume { offset: u64, attempt: u32 },
    /// Out of attempts; report `TransferAborted`.
    GiveUp { attempts: u32 },
}

/// One item or archive being streamed. Reads from a single revision for its whole life.
pub struct Transfer {
    id: TransferId,
    name: String,
    revision: Arc<Revision>,
    source: Source,
    content_hash: ContentHash,
    total_len: u64,
    start_offset: u64,
    /// Next byte to send.
    offset: u64,
    /// Everything below this has been acknowledged.
    acked: u64,
    chunk_size: u64,
    checksum: ChecksumAccumulator,
    resume_attempts: u32,
    max_resume_attempts: u32,
    state: TransferState,
    cancel: CancellationToken,
}

impl Transfer {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> u64 {
        self.revision.seq()
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn archive_id(&self) -> Option<[u8; 16]> {
        match &self.source {
            Source::Archive(a) => Some(a.id()),
            Source::Item { .. } => None,
        }
    }

    /// Cancelled when the owning session closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bytes sent by this transfer, from `start_offset` up to the current offset.
    pub fn sent_digest(&self) -> [u8; 32] {
        self.checksum.digest()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.checksum.len()
    }

    /// Read the next chunk and advance. None once everything has been sent.
    pub fn next_chunk(&mut self) -> Result<Option<OutboundChunk>, TransferError> {
        if self.state != TransferState::Active {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.state = TransferState::Aborted;
            return Err(TransferError::SessionClosed);
        }
        let Some(range) = chunk::next_chunk(self.offset, self.total_len, self.chunk_size) else {
            return Ok(None);
        };
        let payload = self.read(range)?;
        self.checksum.update(&payload);
        self.offset = range.end;
        Ok(Some(OutboundChunk {
            offset: range.start,
            checksum: integrity::hash_chunk(&payload),
            payload,
        }))
    }

    fn read(&self, range: ChunkRange) -> Result<Vec<u8>, TransferError> {
        match &self.source {
            Source::Item { item, store } => Ok(store.read_range(&item.hash, range.start, range.len())?),
            Source::Archive(a) => Ok(a.bytes()[range.start as usize..range.end as usize].to_vec()),
        }
    }

    /// Record a client acknowledgement. Acks never move backwards or past what was sent.
    pub fn acknowledge(&mut self, next_offset: u64) -> bool {
        if next_offset < self.acked || next_offset > self.offset {
            return false;
        }
        self.acked = next_offset;
        if self.acked == self.total_len {
            self.state = TransferState::Completed;
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Completed
    }

    /// Apply the retry policy after a transient failure: rewind to the last
    /// acknowledged offset, or give up once attempts are exhausted.
    pub fn on_transient_failure(&mut self) -> RetryDecision {
        if self.resume_attempts >= self.max_resume_attempts {
            self.state = TransferState::Aborted;
            return RetryDecision::GiveUp {
                attempts: self.resume_attempts,
            };
        }
        self.resume_attempts += 1;
        // Rebuild the checksum over the acknowledged prefix only.
        let mut checksum = ChecksumAccumulator::new();
        let mut pos = self.start_offset;
        while let Some(range) = chunk::next_chunk(pos, self.acked, self.chunk_size) {
            match self.read(range) {
                Ok(bytes) => checksum.update(&bytes),
                Err(_) => {
                    self.state = TransferState::Aborted;
                    return RetryDecision::GiveUp {
                        attempts: self.resume_attempts,
                    };
                }
            }
            pos = range.end;
        }
        self.checksum = checksum;
        self.offset = self.acked;
        RetryDecision::Resume {
            offset: self.acked,
            attempt: self.resume_attempts,
        }
    }

    pub fn abort(&mut self) {
        if self.state == TransferState::Active {
            self.state = TransferState::Aborted;
        }
    }
}

/// Progress view of a transfer held by its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub id: TransferId,
    pub name: String,
    pub revision: u64,
    pub total_len: u64,
}

/// Server-side state of one connected client.
pub struct Session {
    id: SessionId,
    version: u16,
    peer: Option<SocketAddr>,
    pinned: Mutex<Arc<Revision>>,
    transfers: Mutex<HashMap<TransferId, TransferInfo>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn id_string(&self) -> String {
        uuid::Uuid::from_bytes(self.id).to_string()
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Sequence number of the currently pinned revision.
    pub fn pinned_revision(&self) -> u64 {
        self.pinned.lock().seq()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.transfers.lock().values().cloned().collect()
    }

    /// Advance the pin to `latest` and return it.
    fn pin(&self, latest: Arc<Revision>) -> Arc<Revision> {
        let mut pinned = self.pinned.lock();
        if pinned.seq() != latest.seq() {
            debug!(session = %self.id_string(), from = pinned.seq(), to = latest.seq(), "advancing pin");
            *pinned = latest;
        }
        pinned.clone()
    }
}

pub struct SessionManager {
    index: Arc<ContentIndex>,
    builder: Arc<ArchiveBuilder>,
    store: Arc<dyn BlobStore>,
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// Parent of every session token; cancelled by `close_all`.
    root: CancellationToken,
}

impl SessionManager {
    pub fn new(
        index: Arc<ContentIndex>,
        builder: Arc<ArchiveBuilder>,
        store: Arc<dyn BlobStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            index,
            builder,
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn index(&self) -> &Arc<ContentIndex> {
        &self.index
    }

    pub fn builder(&self) -> &Arc<ArchiveBuilder> {
        &self.builder
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Register a new client, pinned to the current revision.
    pub fn on_connect(&self, version: u16, peer: Option<SocketAddr>) -> Arc<Session> {
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().into_bytes(),
            version,
            peer,
            pinned: Mutex::new(self.index.current()),
            transfers: Mutex::new(HashMap::new()),
            cancel: self.root.child_token(),
        });
        self.sessions.write().insert(session.id, session.clone());
        info!(
            session = %session.id_string(),
            ?peer,
            version,
            revision = session.pinned_revision(),
            "session opened"
        );
        session
    }

    /// Close a session: cancel its transfers and release its pin.
    pub fn on_disconnect(&self, id: &SessionId) {
        let Some(session) = self.sessions.write().remove(id) else {
            return;
        };
        session.cancel.cancel();
        let dropped = {
            let mut transfers = session.transfers.lock();
            let n = transfers.len();
            transfers.clear();
            n
        };
        // The index holds the current revision anyway; older pins become collectable.
        *session.pinned.lock() = self.index.current();
        info!(session = %session.id_string(), aborted_transfers = dropped, "session closed");
    }

    /// Close every session.
    pub fn close_all(&self) {
        self.root.cancel();
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        for id in ids {
            self.on_disconnect(&id);
        }
    }

    /// Listing of the current revision under `prefix`. Advances the pin.
    pub fn list(&self, session: &Session, prefix: &str) -> (u64, Vec<EntryMeta>) {
        let rev = session.pin(self.index.current());
        let entries = rev
            .list(prefix)
            .into_iter()
            .map(|i| EntryMeta {
                path: i.path.clone(),
                hash: i.hash,
                size: i.size,
                modified: i.modified,
            })
            .collect();
        (rev.seq(), entries)
    }

    /// Start streaming one item from the latest revision.
    pub fn request_item(
        &self,
        session: &Session,
        path: &str,
        offset: u64,
        expected_hash: Option<ContentHash>,
    ) -> Result<Transfer, TransferError> {
        if session.is_closed() {
            return Err(TransferError::SessionClosed);
        }
        let rev = session.pin(self.index.current());
        let item = rev
            .get(path)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(path.to_string()))?;
        check_resume(offset, expected_hash, item.hash, item.size)?;
        let source = Source::Item {
            item: item.clone(),
            store: self.store.clone(),
        };
        Ok(self.register(session, item.path, rev, source, item.hash, item.size, offset))
    }

    /// Build (or reuse) the archive for `selection` at the latest revision and start streaming it.
    pub async fn request_archive(
        &self,
        session: &Session,
        selection: &Selection,
        offset: u64,
        expected_hash: Option<ContentHash>,
    ) -> Result<Transfer, TransferError> {
        if session.is_closed() {
            return Err(TransferError::SessionClosed);
        }
        let rev = session.pin(self.index.current());
        if offset > 0 && expected_hash.is_none() {
            return Err(TransferError::MissingResumeHash(offset));
        }
        let archive = self.builder.build(&rev, selection).await?;
        check_resume(offset, expected_hash, archive.content_hash(), archive.len())?;
        let name = format!("{}.pak", archive.id_string());
        let (hash, len) = (archive.content_hash(), archive.len());
        Ok(self.register(session, name, rev, Source::Archive(archive), hash, len, offset))
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        session: &Session,
        name: String,
        revision: Arc<Revision>,
        source: Source,
        content_hash: ContentHash,
        total_len: u64,
        offset: u64,
    ) -> Transfer {
        let id = uuid::Uuid::new_v4().into_bytes();
        session.transfers.lock().insert(
            id,
            TransferInfo {
                id,
                name: name.clone(),
                revision: revision.seq(),
                total_len,
            },
        );
        debug!(
            session = %session.id_string(),
            name = %name,
            revision = revision.seq(),
            offset,
            total_len,
            "transfer started"
        );
        Transfer {
            id,
            name,
            revision,
            source,
            content_hash,
            total_len,
            start_offset: offset,
            offset,
            acked: offset,
            chunk_size: self.config.chunk_size,
            checksum: ChecksumAccumulator::new(),
            resume_attempts: 0,
            max_resume_attempts: self.config.max_resume_attempts,
            state: if offset == total_len {
                TransferState::Completed
            } else {
                TransferState::Active
            },
            cancel: session.cancel.child_token(),
        }
    }

    /// Forget a finished or aborted transfer.
    pub fn finish_transfer(&self, session: &Session, transfer: &Transfer) {
        session.transfers.lock().remove(&transfer.id);
        match transfer.state {
            TransferState::Completed => debug!(
                session = %session.id_string(),
                name = %transfer.name,
                bytes = transfer.bytes_sent(),
                "transfer complete"
            ),
            _ => warn!(
                session = %session.id_string(),
                name = %transfer.name,
                acked = transfer.acked,
                total = transfer.total_len,
                "transfer aborted"
            ),
        }
    }
}

fn check_resume(
    offset: u64,
    expected: Option<ContentHash>,
    actual: ContentHash,
    total_len: u64,
) -> Result<(), TransferError> {
    if offset == 0 {
        return Ok(());
    }
    match expected {
        None => return Err(TransferError::MissingResumeHash(offset)),
        Some(h) if h != actual => return Err(TransferError::ContentChanged { expected: h }),
        Some(_) => {}
    }
    if offset > total_len {
        return Err(TransferError::InvalidRange { offset, total_len });
    }
    Ok(())
}
