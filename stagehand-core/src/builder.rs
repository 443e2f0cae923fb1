//! Archive builder: single-flight, incrementally reusing archive construction.
//!
//! Builds are keyed by (revision, selection). The first caller for a key starts
//! the build on a background task; later callers for the same key wait on the
//! same result. Entry bytes already present in an earlier archive are copied
//! verbatim by content hash, so only new or changed items are encoded.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{encode_entry, Archive, ArchiveEntry, ArchiveStatus, ArchiveWriter, BuildKey};
use crate::index::{ContentIndex, Revision};
use crate::integrity::ContentHash;
use crate::selection::{Selection, SelectionError};
use crate::store::BlobStore;

/// Default number of archive builds allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_BUILDS: usize = 2;

/// Default zstd level for entry encoding.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub max_concurrent_builds: usize,
    pub compression_level: i32,
    /// Where finished archives are written. Purely a cache; None keeps them in memory only.
    pub cache_dir: Option<PathBuf>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: DEFAULT_MAX_CONCURRENT_BUILDS,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            cache_dir: None,
        }
    }
}

/// Build failure. Cloned out to every caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("selection: {0}")]
    Selection(#[from] SelectionError),
    #[error("content for {path} ({hash}) is missing from the blob store")]
    MissingBlob { path: String, hash: ContentHash },
    #[error("content for {0} does not match its recorded hash")]
    Corrupt(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("build cancelled")]
    Cancelled,
    #[error("builder is shut down")]
    ShutDown,
}

impl From<io::Error> for BuildError {
    fn from(e: io::Error) -> Self {
        BuildError::Io(e.to_string())
    }
}

type BuildResult = Result<Arc<Archive>, BuildError>;

enum SlotState {
    Pending(watch::Receiver<Option<BuildResult>>),
    Ready(Arc<Archive>),
    Failed(BuildError),
    Stale(Arc<Archive>),
}

struct Slot {
    state: SlotState,
    last_requested: Instant,
    cancel: CancellationToken,
}

impl Slot {
    fn status(&self) -> ArchiveStatus {
        match self.state {
            SlotState::Pending(_) => ArchiveStatus::Pending,
            SlotState::Ready(_) => ArchiveStatus::Ready,
            SlotState::Failed(_) => ArchiveStatus::Failed,
            SlotState::Stale(_) => ArchiveStatus::Stale,
        }
    }

    fn archive(&self) -> Option<&Arc<Archive>> {
        match &self.state {
            SlotState::Ready(a) | SlotState::Stale(a) => Some(a),
            _ => None,
        }
    }

    fn error(&self) -> Option<&BuildError> {
        match &self.state {
            SlotState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Builds currently holding a permit, and the most ever seen at once.
#[derive(Default)]
struct Occupancy {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(self: &Arc<Self>) -> OccupancyGuard {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        OccupancyGuard(self.clone())
    }
}

struct OccupancyGuard(Arc<Occupancy>);

impl Drop for OccupancyGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Summary row for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub key: BuildKey,
    pub status: ArchiveStatus,
    pub archive_id: Option<String>,
    pub len: Option<u64>,
    /// Why the last attempt failed, for Failed slots.
    pub error: Option<String>,
}

pub struct ArchiveBuilder {
    store: Arc<dyn BlobStore>,
    config: BuilderConfig,
    permits: Arc<Semaphore>,
    slots: Arc<Mutex<HashMap<BuildKey, Slot>>>,
    executions: Arc<AtomicU64>,
    occupancy: Arc<Occupancy>,
    shutdown: CancellationToken,
}

impl ArchiveBuilder {
    pub fn new(store: Arc<dyn BlobStore>, config: BuilderConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_builds.max(1)));
        Self {
            store,
            config,
            permits,
            slots: Arc::new(Mutex::new(HashMap::new())),
            executions: Arc::new(AtomicU64::new(0)),
            occupancy: Arc::new(Occupancy::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of builds actually executed (not served from a slot).
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Builds past the concurrency gate, encoding right now.
    pub fn running_builds(&self) -> usize {
        self.occupancy.running.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn peak_running_builds(&self) -> usize {
        self.occupancy.peak.load(Ordering::SeqCst)
    }

    pub fn pending_builds(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| matches!(s.state, SlotState::Pending(_)))
            .count()
    }

    pub fn status(&self, key: &BuildKey) -> Option<ArchiveStatus> {
        self.slots.lock().get(key).map(Slot::status)
    }

    /// Status of a built archive by id.
    pub fn status_of(&self, archive_id: &[u8; 16]) -> Option<ArchiveStatus> {
        self.slots
            .lock()
            .values()
            .find(|s| s.archive().map(|a| a.id()) == Some(*archive_id))
            .map(Slot::status)
    }

    pub fn get(&self, archive_id: &[u8; 16]) -> Option<Arc<Archive>> {
        self.slots
            .lock()
            .values()
            .filter_map(Slot::archive)
            .find(|a| a.id() == *archive_id)
            .cloned()
    }

    pub fn summaries(&self) -> Vec<ArchiveSummary> {
        let mut out: Vec<ArchiveSummary> = self
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| ArchiveSummary {
                key: key.clone(),
                status: slot.status(),
                archive_id: slot.archive().map(|a| a.id_string()),
                len: slot.archive().map(|a| a.len()),
                error: slot.error().map(|e| e.to_string()),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Produce (or reuse) the archive for `selection` at `revision`.
    ///
    /// Concurrent calls with the same key share one execution. A build outlives
    /// the caller that started it: dropping this future does not cancel it.
    pub async fn build(&self, revision: &Arc<Revision>, selection: &Selection) -> BuildResult {
        if self.shutdown.is_cancelled() {
            return Err(BuildError::ShutDown);
        }
        let key = BuildKey::new(revision.seq(), selection);
        let mut rx = {
            let mut slots = self.slots.lock();
            mark_superseded(&mut slots, &key);
            let existing = slots.get_mut(&key).and_then(|slot| {
                slot.last_requested = Instant::now();
                match &slot.state {
                    SlotState::Ready(a) | SlotState::Stale(a) => Some(Ok(a.clone())),
                    SlotState::Pending(rx) => Some(Err(rx.clone())),
                    // Failures are not retried on their own; a new call is the caller's retry.
                    SlotState::Failed(_) => None,
                }
            });
            match existing {
                Some(Ok(archive)) => return Ok(archive),
                Some(Err(rx)) => {
                    debug!(revision = key.revision, selection = %key.selection, "joining in-flight build");
                    rx
                }
                None => self.start_locked(&mut slots, key.clone(), revision.clone(), selection.clone()),
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(v) => v.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(BuildError::Cancelled))
    }

    fn start_locked(
        &self,
        slots: &mut HashMap<BuildKey, Slot>,
        key: BuildKey,
        revision: Arc<Revision>,
        selection: Selection,
    ) -> watch::Receiver<Option<BuildResult>> {
        let (tx, rx) = watch::channel(None);
        let cancel = self.shutdown.child_token();
        // Newest first so the most recent bytes for a hash win.
        let mut donors: Vec<Arc<Archive>> = slots.values().filter_map(Slot::archive).cloned().collect();
        donors.sort_by_key(|a| std::cmp::Reverse(a.revision()));
        slots.insert(
            key.clone(),
            Slot {
                state: SlotState::Pending(rx.clone()),
                last_requested: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        self.executions.fetch_add(1, Ordering::Relaxed);
        info!(revision = key.revision, selection = %key.selection, "archive build started");

        let job = BuildJob {
            revision,
            selection,
            donors,
            store: self.store.clone(),
            level: self.config.compression_level,
            cache_dir: self.config.cache_dir.clone(),
            cancel: cancel.clone(),
        };
        let permits = self.permits.clone();
        let occupancy = self.occupancy.clone();
        let slots = self.slots.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = run_job(job, permits, occupancy, cancel).await;
            match &result {
                Ok(a) => info!(
                    revision = key.revision,
                    selection = %key.selection,
                    bytes = a.len(),
                    encoded = a.encoded(),
                    reused = a.reused(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "archive ready"
                ),
                Err(e) => warn!(revision = key.revision, selection = %key.selection, error = %e, "archive build failed"),
            }
            if let Some(slot) = slots.lock().get_mut(&key) {
                slot.state = match &result {
                    Ok(a) => SlotState::Ready(a.clone()),
                    Err(e) => SlotState::Failed(e.clone()),
                };
            }
            let _ = tx.send(Some(result));
        });
        rx
    }

    /// Drop archives (and cancel pending builds) whose revision nobody holds any
    /// more and that have not been requested for `grace`. Returns how many went.
    pub fn evict_unreferenced(&self, index: &ContentIndex, grace: Duration) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, slot| {
            let alive = index.revision(key.revision).is_some();
            if alive || slot.last_requested.elapsed() < grace {
                return true;
            }
            if matches!(slot.state, SlotState::Pending(_)) {
                slot.cancel.cancel();
            }
            debug!(revision = key.revision, selection = %key.selection, "evicting archive");
            false
        });
        before - slots.len()
    }

    /// Cancel every in-flight build and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// A request for `key` means older archives of the same selection are superseded.
fn mark_superseded(slots: &mut HashMap<BuildKey, Slot>, key: &BuildKey) {
    for (k, slot) in slots.iter_mut() {
        if k.selection == key.selection && k.revision < key.revision {
            if let SlotState::Ready(a) = &slot.state {
                debug!(revision = k.revision, selection = %k.selection, "archive is stale");
                slot.state = SlotState::Stale(a.clone());
            }
        }
    }
}

struct BuildJob {
    revision: Arc<Revision>,
    selection: Selection,
    donors: Vec<Arc<Archive>>,
    store: Arc<dyn BlobStore>,
    level: i32,
    cache_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

async fn run_job(
    job: BuildJob,
    permits: Arc<Semaphore>,
    occupancy: Arc<Occupancy>,
    cancel: CancellationToken,
) -> BuildResult {
    let _permit = tokio::select! {
        permit = permits.acquire_owned() => permit.map_err(|_| BuildError::ShutDown)?,
        _ = cancel.cancelled() => return Err(BuildError::Cancelled),
    };
    // Declared after the permit so it is released first.
    let _running = occupancy.enter();
    tokio::task::spawn_blocking(move || assemble(job))
        .await
        .map_err(|e| BuildError::Encode(format!("build task failed: {}", e)))?
}

fn assemble(job: BuildJob) -> BuildResult {
    let items = job.revision.select(&job.selection)?;

    let mut reusable: HashMap<ContentHash, (&Archive, &ArchiveEntry)> = HashMap::new();
    for donor in &job.donors {
        for entry in donor.entries() {
            reusable.entry(entry.hash).or_insert((donor.as_ref(), entry));
        }
    }

    let mut writer = ArchiveWriter::new();
    let mut encoded_paths = Vec::new();
    let mut reused = 0usize;
    for item in items {
        if job.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        if let Some((donor, entry)) = reusable.get(&item.hash) {
            writer.append(&item.path, item.hash, item.size, entry.method, donor.stored_bytes(entry));
            reused += 1;
            continue;
        }
        let data = job.store.read_all(&item.hash).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BuildError::MissingBlob {
                path: item.path.clone(),
                hash: item.hash,
            },
            _ => BuildError::from(e),
        })?;
        if ContentHash::of(&data) != item.hash {
            return Err(BuildError::Corrupt(item.path.clone()));
        }
        let (method, stored) =
            encode_entry(&data, job.level).map_err(|e| BuildError::Encode(e.to_string()))?;
        writer.append(&item.path, item.hash, item.size, method, &stored);
        encoded_paths.push(item.path.clone());
    }

    let (bytes, entries) = writer
        .finish()
        .map_err(|e| BuildError::Encode(e.to_string()))?;
    let archive = Archive::new(
        job.revision.seq(),
        job.selection,
        bytes,
        entries,
        encoded_paths,
        reused,
    );
    if let Some(dir) = &job.cache_dir {
        if let Err(e) = persist(dir, &archive) {
            warn!(dir = %dir.display(), error = %e, "could not cache archive on disk");
        }
    }
    Ok(Arc::new(archive))
}

fn persist(dir: &std::path::Path, archive: &Archive) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.pak", archive.content_hash()));
    if path.exists() {
        return Ok(());
    }
    let tmp = dir.join(format!(".{}.tmp", archive.id_string()));
    std::fs::write(&tmp, archive.bytes())?;
    std::fs::rename(&tmp, &path)
}
