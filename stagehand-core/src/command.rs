//! Control commands issued by the editor's command layer, as JSON.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::ArchiveStatus;
use crate::builder::BuildError;
use crate::protocol::EntryMeta;
use crate::selection::{Selection, SelectionError};
use crate::session::SessionManager;
use crate::stage::{StageError, Stager};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Stage {
        paths: Vec<String>,
    },
    Invalidate {
        paths: Vec<String>,
    },
    /// Import members of a built archive below `mount_point`.
    Mount {
        pak_path: String,
        #[serde(default)]
        mount_point: String,
        #[serde(default = "match_everything")]
        pattern: String,
    },
    ListCurrent {
        #[serde(default)]
        prefix: String,
    },
    /// Explicit `paths` win over `pattern`; neither means every item.
    BuildArchive {
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
    Status,
    Idle,
}

fn match_everything() -> String {
    "*".to_string()
}

impl Command {
    /// Parse a JSON command body.
    pub fn from_json(body: &[u8]) -> Result<Self, CommandError> {
        serde_json::from_slice(body).map_err(|e| CommandError::BadRequest(e.to_string()))
    }
}

/// Parse a path list: a JSON array, `{"paths": [...]}`, or comma separated text.
pub fn parse_path_list(body: &[u8]) -> Result<Vec<String>, CommandError> {
    #[derive(Deserialize)]
    struct Paths {
        paths: Vec<String>,
    }
    let text = std::str::from_utf8(body)
        .map_err(|_| CommandError::BadRequest("body is not UTF-8".into()))?
        .trim();
    if text.starts_with('[') {
        return serde_json::from_str(text).map_err(|e| CommandError::BadRequest(e.to_string()));
    }
    if text.starts_with('{') {
        return serde_json::from_str::<Paths>(text)
            .map(|p| p.paths)
            .map_err(|e| CommandError::BadRequest(e.to_string()));
    }
    let paths: Vec<String> = text
        .split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if paths.is_empty() {
        return Err(CommandError::BadRequest("no paths given".into()));
    }
    Ok(paths)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRow {
    pub archive_id: Option<String>,
    pub revision: u64,
    pub selection: String,
    pub status: ArchiveStatus,
    pub len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub revision: u64,
    pub items: usize,
    pub total_bytes: u64,
    pub live_revisions: Vec<u64>,
    pub sessions: usize,
    pub pending_builds: usize,
    pub running_builds: usize,
    pub archives: Vec<ArchiveRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResponse {
    Staged {
        revision: u64,
        published: bool,
        changed: Vec<String>,
        unchanged: usize,
    },
    Listing {
        revision: u64,
        items: Vec<EntryMeta>,
    },
    Archive {
        archive_id: String,
        revision: u64,
        content_hash: String,
        len: u64,
        encoded: usize,
        reused: usize,
    },
    Status(StatusReport),
    Idle {
        idle: bool,
        pending_builds: usize,
    },
}

/// How a failure should be reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The request itself is wrong: bad JSON, bad path, nothing selected.
    BadEntity,
    /// The request was fine but carrying it out failed.
    BadAction,
    /// Engine-side trouble (I/O, shutdown).
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CommandError::BadRequest(_) => FailureKind::BadEntity,
            CommandError::Stage(StageError::Io(_)) => FailureKind::Internal,
            CommandError::Stage(_) => FailureKind::BadEntity,
            CommandError::Build(BuildError::Selection(_)) => FailureKind::BadEntity,
            CommandError::Build(BuildError::ShutDown) => FailureKind::Internal,
            CommandError::Build(_) => FailureKind::BadAction,
            CommandError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Runs commands against the engine's stager, index and builder.
#[derive(Clone)]
pub struct CommandExecutor {
    stager: Arc<Stager>,
    sessions: Arc<SessionManager>,
}

impl CommandExecutor {
    pub fn new(stager: Arc<Stager>, sessions: Arc<SessionManager>) -> Self {
        Self { stager, sessions }
    }

    pub async fn execute(&self, command: Command) -> Result<CommandResponse, CommandError> {
        debug!(?command, "executing command");
        match command {
            Command::Stage { paths } => self.blocking(move |s| s.stage(&paths)).await,
            Command::Invalidate { paths } => self.blocking(move |s| s.invalidate(&paths)).await,
            Command::Mount {
                pak_path,
                mount_point,
                pattern,
            } => {
                self.blocking(move |s| s.mount(&pak_path, &mount_point, &pattern))
                    .await
            }
            Command::ListCurrent { prefix } => {
                let rev = self.sessions.index().current();
                let items = rev
                    .list(&prefix)
                    .into_iter()
                    .map(|i| EntryMeta {
                        path: i.path.clone(),
                        hash: i.hash,
                        size: i.size,
                        modified: i.modified,
                    })
                    .collect();
                Ok(CommandResponse::Listing {
                    revision: rev.seq(),
                    items,
                })
            }
            Command::BuildArchive { paths, pattern } => {
                let selection = match (paths.is_empty(), pattern) {
                    (false, _) => Selection::paths(paths),
                    (true, Some(p)) => Selection::pattern(p),
                    (true, None) => Selection::all(),
                };
                let rev = self.sessions.index().current();
                if rev.is_empty() {
                    return Err(BuildError::Selection(SelectionError::Empty).into());
                }
                let archive = self.sessions.builder().build(&rev, &selection).await?;
                Ok(CommandResponse::Archive {
                    archive_id: archive.id_string(),
                    revision: archive.revision(),
                    content_hash: archive.content_hash().to_hex(),
                    len: archive.len(),
                    encoded: archive.encoded(),
                    reused: archive.reused(),
                })
            }
            Command::Status => Ok(CommandResponse::Status(self.status())),
            Command::Idle => {
                let pending = self.sessions.builder().pending_builds();
                Ok(CommandResponse::Idle {
                    idle: pending == 0,
                    pending_builds: pending,
                })
            }
        }
    }

    pub fn status(&self) -> StatusReport {
        let index = self.sessions.index();
        let builder = self.sessions.builder();
        let rev = index.current();
        StatusReport {
            revision: rev.seq(),
            items: rev.len(),
            total_bytes: rev.total_bytes(),
            live_revisions: index.live_revisions(),
            sessions: self.sessions.session_count(),
            pending_builds: builder.pending_builds(),
            running_builds: builder.running_builds(),
            archives: builder
                .summaries()
                .into_iter()
                .map(|s| ArchiveRow {
                    archive_id: s.archive_id,
                    revision: s.key.revision,
                    selection: s.key.selection.to_string(),
                    status: s.status,
                    len: s.len,
                    error: s.error,
                })
                .collect(),
        }
    }

    /// Staging touches the filesystem; keep it off the async workers.
    async fn blocking<F>(&self, f: F) -> Result<CommandResponse, CommandError>
    where
        F: FnOnce(&Stager) -> Result<crate::stage::StageReport, StageError> + Send + 'static,
    {
        let stager = self.stager.clone();
        let report = tokio::task::spawn_blocking(move || f(&stager))
            .await
            .map_err(|e| CommandError::Internal(e.to_string()))??;
        Ok(CommandResponse::Staged {
            revision: report.revision,
            published: report.published,
            changed: report.changed,
            unchanged: report.unchanged,
        })
    }
}
