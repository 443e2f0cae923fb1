//! Stager: turns files under the cook root into published revisions.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{ArchiveFormatError, ArchiveReader};
use crate::index::{normalize_path, unix_now, ContentIndex, ContentItem, GcReport, Origin, PublishError, PublishSet};
use crate::selection::{Selection, SelectionError};
use crate::store::BlobStore;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("path {0:?} is outside the cook root")]
    OutsideRoot(String),
    #[error("no such file or directory under the cook root: {0}")]
    NotFound(String),
    #[error("nothing to stage")]
    Empty,
    #[error("archive {path}: {source}")]
    BadArchive {
        path: String,
        #[source]
        source: ArchiveFormatError,
    },
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a stage, mount or invalidate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Current revision after the call.
    pub revision: u64,
    /// False when nothing changed and no revision was published.
    pub published: bool,
    pub changed: Vec<String>,
    pub unchanged: usize,
}

pub struct Stager {
    cook_root: PathBuf,
    store: Arc<dyn BlobStore>,
    index: Arc<ContentIndex>,
    /// Held from the first blob write until publish, and by `sweep`, so a blob
    /// cannot be collected between being stored and being referenced.
    staging: Mutex<()>,
}

impl Stager {
    pub fn new(cook_root: impl Into<PathBuf>, store: Arc<dyn BlobStore>, index: Arc<ContentIndex>) -> Self {
        Self {
            cook_root: cook_root.into(),
            store,
            index,
            staging: Mutex::new(()),
        }
    }

    pub fn cook_root(&self) -> &Path {
        &self.cook_root
    }

    /// Hash the given files (directories recursively) into the blob store and
    /// publish the changed ones as an incremental revision.
    pub fn stage<S: AsRef<str>>(&self, paths: &[S]) -> Result<StageReport, StageError> {
        if paths.is_empty() {
            return Err(StageError::Empty);
        }
        let mut found = BTreeMap::new();
        for raw in paths {
            let logical = self.logical(raw.as_ref())?;
            let full = self.resolve(&logical)?;
            let meta = fs::metadata(&full)?;
            if meta.is_dir() {
                for entry in WalkDir::new(&full).follow_links(false) {
                    let entry = entry.map_err(io::Error::from)?;
                    if entry.path_is_symlink() && entry.depth() > 0 {
                        debug!(path = %entry.path().display(), "skipping symlink");
                        continue;
                    }
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Some(rel) = self.relative(entry.path()) else {
                        continue;
                    };
                    found.insert(rel, entry.into_path());
                }
            } else {
                found.insert(logical, full);
            }
        }

        let _staging = self.staging.lock();
        let current = self.index.current();
        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        let mut unchanged = 0;
        for (logical, full) in found {
            let meta = fs::metadata(&full)?;
            if meta.len() == 0 {
                if current.get(&logical).is_some() {
                    warn!(path = %logical, "file is now empty, removing it");
                    removals.push(logical);
                } else {
                    warn!(path = %logical, "skipping empty file");
                }
                continue;
            }
            let (hash, size) = self.store.put_file(&full)?;
            if current.get(&logical).is_some_and(|i| i.hash == hash) {
                unchanged += 1;
                continue;
            }
            upserts.push(ContentItem {
                path: logical,
                hash,
                size,
                modified: modified_secs(&meta),
                origin: Origin::Loose,
            });
        }
        self.publish(upserts, removals, unchanged)
    }

    /// Remove items (or whole directories of items) from the next revision.
    pub fn invalidate<S: AsRef<str>>(&self, paths: &[S]) -> Result<StageReport, StageError> {
        let _staging = self.staging.lock();
        let current = self.index.current();
        let mut removals = Vec::new();
        for raw in paths {
            let logical = self.logical(raw.as_ref())?;
            let dir = format!("{}/", logical);
            removals.extend(
                current
                    .items()
                    .filter(|i| i.path == logical || i.path.starts_with(&dir))
                    .map(|i| i.path.clone()),
            );
        }
        removals.sort();
        removals.dedup();
        self.publish(Vec::new(), removals, 0)
    }

    /// Import the members of a built archive under `mount_point`, keeping only
    /// those whose member path matches `pattern`.
    pub fn mount(&self, archive_path: &str, mount_point: &str, pattern: &str) -> Result<StageReport, StageError> {
        let logical = self.logical(archive_path)?;
        let bytes = fs::read(self.resolve(&logical)?)?;
        let reader = ArchiveReader::parse(&bytes).map_err(|source| StageError::BadArchive {
            path: logical.clone(),
            source,
        })?;
        let selection = Selection::pattern(pattern);
        let matcher = selection.matcher()?;
        let prefix = match mount_point.trim_matches('/') {
            "" => String::new(),
            m => format!("{}/", m),
        };

        let _staging = self.staging.lock();
        let current = self.index.current();
        let mut upserts = Vec::new();
        let mut unchanged = 0;
        for entry in reader.entries().iter().filter(|e| matcher.matches(&e.path)) {
            let path = normalize_path(&format!("{}{}", prefix, entry.path))
                .ok_or_else(|| StageError::OutsideRoot(entry.path.clone()))?;
            if current.get(&path).is_some_and(|i| i.hash == entry.hash) {
                unchanged += 1;
                continue;
            }
            let data = reader.extract(&entry.path).map_err(|source| StageError::BadArchive {
                path: logical.clone(),
                source,
            })?;
            let hash = self.store.put(&data)?;
            upserts.push(ContentItem {
                path,
                hash,
                size: data.len() as u64,
                modified: unix_now(),
                origin: Origin::ArchiveMember {
                    archive: logical.clone(),
                },
            });
        }
        if upserts.is_empty() && unchanged == 0 {
            return Err(StageError::Selection(SelectionError::Empty));
        }
        self.publish(upserts, Vec::new(), unchanged)
    }

    /// Drop dead revisions and delete blobs nothing live references.
    pub fn sweep(&self) -> GcReport {
        let _staging = self.staging.lock();
        let report = self.index.collect_garbage();
        for hash in &report.orphaned {
            if let Err(e) = self.store.remove(hash) {
                warn!(%hash, error = %e, "failed to remove orphaned blob");
            }
        }
        if !report.orphaned.is_empty() {
            debug!(blobs = report.orphaned.len(), "removed orphaned blobs");
        }
        report
    }

    fn publish(&self, upserts: Vec<ContentItem>, removals: Vec<String>, unchanged: usize) -> Result<StageReport, StageError> {
        if upserts.is_empty() && removals.is_empty() {
            return Ok(StageReport {
                revision: self.index.current().seq(),
                published: false,
                changed: Vec::new(),
                unchanged,
            });
        }
        let mut changed: Vec<String> = upserts.iter().map(|i| i.path.clone()).collect();
        changed.extend(removals.iter().cloned());
        let rev = self.index.publish(PublishSet::Incremental { upserts, removals })?;
        info!(revision = rev.seq(), changed = changed.len(), unchanged, "staged");
        Ok(StageReport {
            revision: rev.seq(),
            published: true,
            changed,
            unchanged,
        })
    }

    fn logical(&self, raw: &str) -> Result<String, StageError> {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            return self
                .relative(candidate)
                .ok_or_else(|| StageError::OutsideRoot(raw.to_string()));
        }
        normalize_path(raw).ok_or_else(|| StageError::OutsideRoot(raw.to_string()))
    }

    /// Join `logical` onto the cook root, refusing anything whose real location
    /// (after following symlinks) is outside it.
    fn resolve(&self, logical: &str) -> Result<PathBuf, StageError> {
        let full = self.cook_root.join(logical);
        let real = fs::canonicalize(&full).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StageError::NotFound(logical.to_string()),
            _ => StageError::Io(e),
        })?;
        if !real.starts_with(fs::canonicalize(&self.cook_root)?) {
            return Err(StageError::OutsideRoot(logical.to_string()));
        }
        Ok(full)
    }

    fn relative(&self, full: &Path) -> Option<String> {
        let rel = full.strip_prefix(&self.cook_root).ok()?;
        normalize_path(&rel.to_string_lossy())
    }
}

fn modified_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or_else(unix_now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{encode_entry, ArchiveWriter};
    use crate::integrity::ContentHash;
    use crate::store::MemoryBlobStore;

    fn setup() -> (tempfile::TempDir, Arc<MemoryBlobStore>, Arc<ContentIndex>, Stager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let index = Arc::new(ContentIndex::new());
        let stager = Stager::new(dir.path(), store.clone(), index.clone());
        (dir, store, index, stager)
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, data).unwrap();
    }

    #[test]
    fn stages_files_and_directories() {
        let (dir, store, index, stager) = setup();
        write(dir.path(), "Maps/Level1.umap", b"level one");
        write(dir.path(), "Maps/Sub/Level2.umap", b"level two");
        write(dir.path(), "Game.ini", b"[game]");

        let report = stager.stage(&["Maps", "Game.ini"]).unwrap();
        assert!(report.published);
        assert_eq!(report.revision, 1);
        assert_eq!(report.changed.len(), 3);

        let rev = index.current();
        let item = rev.get("Maps/Sub/Level2.umap").unwrap();
        assert_eq!(item.hash, ContentHash::of(b"level two"));
        assert_eq!(item.size, 9);
        assert!(store.contains(&item.hash));
    }

    #[test]
    fn restaging_unchanged_files_publishes_nothing() {
        let (dir, _store, index, stager) = setup();
        write(dir.path(), "a.uasset", b"aaa");
        stager.stage(&["a.uasset"]).unwrap();
        let again = stager.stage(&["a.uasset"]).unwrap();
        assert!(!again.published);
        assert_eq!(again.unchanged, 1);
        assert_eq!(index.current().seq(), 1);

        write(dir.path(), "a.uasset", b"bbb");
        let changed = stager.stage(&["a.uasset"]).unwrap();
        assert_eq!(changed.revision, 2);
        assert_eq!(index.current().get("a.uasset").unwrap().hash, ContentHash::of(b"bbb"));
    }

    #[test]
    fn rejects_paths_outside_root() {
        let (_dir, _store, _index, stager) = setup();
        assert!(matches!(stager.stage(&["../etc/passwd"]), Err(StageError::OutsideRoot(_))));
        assert!(matches!(stager.stage(&["/etc/passwd"]), Err(StageError::OutsideRoot(_))));
        assert!(matches!(stager.stage(&["missing.uasset"]), Err(StageError::NotFound(_))));
        assert!(matches!(stager.stage::<&str>(&[]), Err(StageError::Empty)));
    }

    #[test]
    fn absolute_paths_inside_root_are_accepted() {
        let (dir, _store, index, stager) = setup();
        write(dir.path(), "x/y.bin", b"xy");
        let abs = dir.path().join("x/y.bin");
        stager.stage(&[abs.to_string_lossy()]).unwrap();
        assert!(index.current().get("x/y.bin").is_some());
    }

    #[test]
    fn invalidate_removes_items_and_directories() {
        let (dir, _store, index, stager) = setup();
        write(dir.path(), "Maps/a.umap", b"a");
        write(dir.path(), "Maps/b.umap", b"b");
        write(dir.path(), "MapsExtra.umap", b"c");
        stager.stage(&["Maps", "MapsExtra.umap"]).unwrap();

        let report = stager.invalidate(&["Maps"]).unwrap();
        assert_eq!(report.changed, vec!["Maps/a.umap", "Maps/b.umap"]);
        let rev = index.current();
        assert_eq!(rev.len(), 1);
        assert!(rev.get("MapsExtra.umap").is_some());

        let noop = stager.invalidate(&["nothing/here"]).unwrap();
        assert!(!noop.published);
    }

    #[test]
    fn sweep_removes_orphaned_blobs() {
        let (dir, store, _index, stager) = setup();
        write(dir.path(), "a", b"first");
        stager.stage(&["a"]).unwrap();
        write(dir.path(), "a", b"second");
        stager.stage(&["a"]).unwrap();
        let report = stager.sweep();
        assert!(report.orphaned.contains(&ContentHash::of(b"first")));
        assert!(!store.contains(&ContentHash::of(b"first")));
        assert!(store.contains(&ContentHash::of(b"second")));
    }

    #[test]
    fn mount_imports_matching_archive_members() {
        let (dir, store, index, stager) = setup();
        let mut writer = ArchiveWriter::new();
        for (path, data) in [
            ("Maps/a.umap", &b"map a"[..]),
            ("Maps/b.umap", &b"map b"[..]),
            ("Audio/x.wav", &b"wave"[..]),
        ] {
            let (method, stored) = encode_entry(data, 3).unwrap();
            writer.append(path, ContentHash::of(data), data.len() as u64, method, &stored);
        }
        let (bytes, _) = writer.finish().unwrap();
        write(dir.path(), "Paks/dlc.pak", &bytes);

        let report = stager.mount("Paks/dlc.pak", "/DLC/", "Maps/*").unwrap();
        assert_eq!(report.changed, vec!["DLC/Maps/a.umap", "DLC/Maps/b.umap"]);
        let rev = index.current();
        let item = rev.get("DLC/Maps/b.umap").unwrap();
        assert_eq!(item.origin, Origin::ArchiveMember { archive: "Paks/dlc.pak".into() });
        assert_eq!(store.read_all(&item.hash).unwrap(), b"map b");
        assert!(rev.get("DLC/Audio/x.wav").is_none());

        assert!(matches!(
            stager.mount("Paks/dlc.pak", "DLC", "Textures/*"),
            Err(StageError::Selection(SelectionError::Empty))
        ));
    }

    #[test]
    fn emptied_file_is_removed() {
        let (dir, _store, index, stager) = setup();
        write(dir.path(), "Maps/a.umap", b"a");
        write(dir.path(), "Maps/b.umap", b"b");
        stager.stage(&["Maps"]).unwrap();

        write(dir.path(), "Maps/a.umap", b"");
        write(dir.path(), "Maps/new.umap", b"");
        let report = stager.stage(&["Maps"]).unwrap();
        assert_eq!(report.changed, vec!["Maps/a.umap"]);
        assert_eq!(report.unchanged, 1);
        let rev = index.current();
        assert!(rev.get("Maps/a.umap").is_none());
        assert!(rev.get("Maps/new.umap").is_none());
        assert!(rev.get("Maps/b.umap").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_leaving_the_root_are_refused() {
        let (dir, _store, index, stager) = setup();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), b"do not serve").unwrap();
        write(dir.path(), "Maps/real.umap", b"real");
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("Maps/escape")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("Maps/real.umap"), dir.path().join("alias")).unwrap();

        assert!(matches!(stager.stage(&["link"]), Err(StageError::OutsideRoot(_))));
        assert!(matches!(stager.stage(&["Maps/escape"]), Err(StageError::OutsideRoot(_))));
        assert!(matches!(stager.mount("link", "", "*"), Err(StageError::OutsideRoot(_))));

        // Links inside a staged directory are skipped; links within the root resolve.
        stager.stage(&["Maps", "alias"]).unwrap();
        let rev = index.current();
        assert_eq!(rev.len(), 2);
        assert!(rev.get("Maps/real.umap").is_some());
        assert_eq!(rev.get("alias").unwrap().size, 4);
    }

    #[test]
    fn sweep_never_removes_blobs_a_concurrent_stage_is_publishing() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (dir, store, index, stager) = setup();
        let stager = Arc::new(stager);
        let stop = Arc::new(AtomicBool::new(false));
        let sweeper = {
            let stager = stager.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    stager.sweep();
                }
            })
        };
        // Alternating contents revive hashes whose revisions have already died.
        for i in 0..300 {
            let body: &[u8] = if i % 2 == 0 { b"version one" } else { b"version two" };
            write(dir.path(), "a.uasset", body);
            stager.stage(&["a.uasset"]).unwrap();
            let hash = index.current().get("a.uasset").unwrap().hash;
            assert!(store.contains(&hash), "iteration {}: published blob was swept", i);
        }
        stop.store(true, Ordering::SeqCst);
        sweeper.join().unwrap();
    }
}
