//! Stagehand engine: content index, archive builder, wire protocol and sessions.
//! No sockets here; the daemon owns listeners and drives sessions.

pub mod archive;
pub mod builder;
pub mod chunk;
pub mod command;
pub mod index;
pub mod integrity;
pub mod protocol;
pub mod selection;
pub mod session;
pub mod stage;
pub mod store;
pub mod wire;

pub use archive::{Archive, ArchiveReader, ArchiveStatus, BuildKey};
pub use builder::{ArchiveBuilder, BuildError, BuilderConfig};
pub use command::{Command, CommandError, CommandExecutor, CommandResponse, FailureKind};
pub use index::{ContentIndex, ContentItem, Origin, PublishError, PublishSet, Revision, RevisionDiff};
pub use integrity::ContentHash;
pub use protocol::{ErrorCode, Message, PROTOCOL_VERSION};
pub use selection::{Selection, SelectionError};
pub use session::{RetryDecision, Session, SessionConfig, SessionManager, Transfer, TransferError};
pub use stage::{StageError, StageReport, Stager};
pub use store::{BlobStore, DiskBlobStore, MemoryBlobStore};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
