//! Content index: immutable, sequence-numbered revisions of the servable item set.
//!
//! Readers load the current revision through an atomic pointer and never block
//! on `publish`. Writers serialize among themselves. Old revisions stay alive for
//! as long as someone holds their `Arc`; the index itself only keeps weak handles.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::integrity::ContentHash;
use crate::selection::{Selection, SelectionError};

/// Where an item's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// A loose cooked file.
    Loose,
    /// A member extracted from a packaged archive.
    ArchiveMember { archive: String },
}

/// One servable item, identified by its logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    /// Unix seconds.
    pub modified: u64,
    pub origin: Origin,
}

impl ContentItem {
    pub fn loose(path: impl Into<String>, hash: ContentHash, size: u64) -> Self {
        Self {
            path: path.into(),
            hash,
            size,
            modified: unix_now(),
            origin: Origin::Loose,
        }
    }

    fn validate(&self) -> Result<(), PublishError> {
        let invalid = |reason: &str| PublishError::InvalidContentItem {
            path: self.path.clone(),
            reason: reason.to_string(),
        };
        if self.hash.is_missing() {
            return Err(invalid("missing content hash"));
        }
        if self.size == 0 {
            return Err(invalid("size must be positive"));
        }
        match normalize_path(&self.path) {
            Some(p) if p == self.path => Ok(()),
            Some(_) => Err(invalid("path is not in normalized form")),
            None => Err(invalid("path must be relative and must not contain '..'")),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Normalize a logical path: forward slashes, no leading `./` or `/` runs, no
/// empty or `.` segments. Returns None for empty paths, absolute paths and `..`.
pub fn normalize_path(path: &str) -> Option<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') || unified.contains(':') {
        return None;
    }
    let mut parts = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Immutable snapshot of the full item set.
#[derive(Debug)]
pub struct Revision {
    seq: u64,
    items: BTreeMap<String, ContentItem>,
}

impl Revision {
    fn empty() -> Self {
        Self {
            seq: 0,
            items: BTreeMap::new(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, path: &str) -> Option<&ContentItem> {
        self.items.get(path)
    }

    pub fn items(&self) -> impl Iterator<Item = &ContentItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.values().map(|i| i.size).sum()
    }

    /// Items under `prefix` (a path prefix, not a pattern). Empty prefix lists everything.
    pub fn list(&self, prefix: &str) -> Vec<&ContentItem> {
        self.items
            .range(prefix.to_string()..)
            .take_while(|(p, _)| p.starts_with(prefix))
            .map(|(_, item)| item)
            .collect()
    }

    /// Items covered by `selection`, in path order.
    pub fn select(&self, selection: &Selection) -> Result<Vec<&ContentItem>, SelectionError> {
        let matcher = selection.matcher()?;
        let out: Vec<&ContentItem> = match selection {
            Selection::Paths(paths) => {
                let mut out = Vec::with_capacity(paths.len());
                for p in paths {
                    match self.items.get(p) {
                        Some(item) => out.push(item),
                        None => return Err(SelectionError::NotFound(p.clone())),
                    }
                }
                out
            }
            Selection::Pattern(_) => self
                .items
                .values()
                .filter(|i| matcher.matches(&i.path))
                .collect(),
        };
        if out.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(out)
    }

    /// Changes needed to go from `self` to `newer`.
    pub fn diff(&self, newer: &Revision) -> RevisionDiff {
        let mut diff = RevisionDiff {
            from: self.seq,
            to: newer.seq,
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
        };
        for (path, item) in &newer.items {
            match self.items.get(path) {
                None => diff.added.push(item.clone()),
                Some(old) if old.hash != item.hash || old.size != item.size => {
                    diff.modified.push((old.clone(), item.clone()))
                }
                Some(_) => {}
            }
        }
        for (path, item) in &self.items {
            if !newer.items.contains_key(path) {
                diff.removed.push(item.clone());
            }
        }
        diff
    }
}

/// Added, modified (old, new) and removed items between two revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionDiff {
    pub from: u64,
    pub to: u64,
    pub added: Vec<ContentItem>,
    pub modified: Vec<(ContentItem, ContentItem)>,
    pub removed: Vec<ContentItem>,
}

impl RevisionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Input to `publish`.
#[derive(Debug, Clone)]
pub enum PublishSet {
    /// Replace the item set entirely.
    Full(Vec<ContentItem>),
    /// Apply upserts and removals on top of the current revision.
    Incremental {
        upserts: Vec<ContentItem>,
        removals: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("invalid content item {path:?}: {reason}")]
    InvalidContentItem { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("revision {0} is no longer retained")]
    RevisionGone(u64),
}

/// What `collect_garbage` released.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub dropped_revisions: Vec<u64>,
    /// Hashes no live revision references any more.
    pub orphaned: Vec<ContentHash>,
}

struct Registry {
    retained: BTreeMap<u64, Weak<Revision>>,
    /// Every hash published since the last collection.
    known_hashes: HashSet<ContentHash>,
}

pub struct ContentIndex {
    current: ArcSwap<Revision>,
    /// Held for the whole of `publish`; single writer.
    writer: Mutex<()>,
    registry: Mutex<Registry>,
}

impl ContentIndex {
    pub fn new() -> Self {
        let genesis = Arc::new(Revision::empty());
        let mut retained = BTreeMap::new();
        retained.insert(0, Arc::downgrade(&genesis));
        Self {
            current: ArcSwap::new(genesis),
            writer: Mutex::new(()),
            registry: Mutex::new(Registry {
                retained,
                known_hashes: HashSet::new(),
            }),
        }
    }

    /// Latest published revision. Never blocks.
    pub fn current(&self) -> Arc<Revision> {
        self.current.load_full()
    }

    /// A revision by sequence number, if anyone still holds it.
    pub fn revision(&self, seq: u64) -> Option<Arc<Revision>> {
        self.registry
            .lock()
            .retained
            .get(&seq)
            .and_then(Weak::upgrade)
    }

    /// Sequence numbers of revisions that are still alive.
    pub fn live_revisions(&self) -> Vec<u64> {
        self.registry
            .lock()
            .retained
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Validate and publish a new revision. On error the current revision is unchanged.
    pub fn publish(&self, set: PublishSet) -> Result<Arc<Revision>, PublishError> {
        let _writer = self.writer.lock();
        let base = self.current();

        let mut items = match &set {
            PublishSet::Full(_) => BTreeMap::new(),
            PublishSet::Incremental { .. } => base.items.clone(),
        };
        match set {
            PublishSet::Full(list) => {
                for item in list {
                    item.validate()?;
                    if items.contains_key(&item.path) {
                        return Err(PublishError::InvalidContentItem {
                            path: item.path,
                            reason: "duplicate path".to_string(),
                        });
                    }
                    items.insert(item.path.clone(), item);
                }
            }
            PublishSet::Incremental { upserts, removals } => {
                for item in &upserts {
                    item.validate()?;
                }
                for path in &removals {
                    items.remove(path);
                }
                for item in upserts {
                    items.insert(item.path.clone(), item);
                }
            }
        }

        let revision = Arc::new(Revision {
            seq: base.seq + 1,
            items,
        });
        {
            let mut reg = self.registry.lock();
            reg.retained.insert(revision.seq, Arc::downgrade(&revision));
            reg.known_hashes.extend(revision.items.values().map(|i| i.hash));
        }
        self.current.store(revision.clone());
        info!(
            seq = revision.seq,
            items = revision.len(),
            bytes = revision.total_bytes(),
            "published revision"
        );
        Ok(revision)
    }

    /// Diff two retained revisions by sequence number.
    pub fn diff(&self, from: u64, to: u64) -> Result<RevisionDiff, IndexError> {
        let a = self.revision(from).ok_or(IndexError::RevisionGone(from))?;
        let b = self.revision(to).ok_or(IndexError::RevisionGone(to))?;
        Ok(a.diff(&b))
    }

    /// Forget revisions nobody references and report blobs that became unreachable.
    pub fn collect_garbage(&self) -> GcReport {
        // Hold the writer so a concurrent publish cannot add hashes mid-scan.
        let _writer = self.writer.lock();
        let mut reg = self.registry.lock();
        let mut report = GcReport::default();
        let mut live = HashSet::new();
        reg.retained.retain(|seq, weak| match weak.upgrade() {
            Some(rev) => {
                live.extend(rev.items.values().map(|i| i.hash));
                true
            }
            None => {
                report.dropped_revisions.push(*seq);
                false
            }
        });
        report.orphaned = reg
            .known_hashes
            .iter()
            .filter(|h| !live.contains(*h))
            .copied()
            .collect();
        reg.known_hashes = live;
        if !report.dropped_revisions.is_empty() {
            debug!(
                dropped = ?report.dropped_revisions,
                orphaned = report.orphaned.len(),
                "collected revisions"
            );
        }
        report
    }
}

impl Default for ContentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, data: &[u8]) -> ContentItem {
        ContentItem::loose(path, ContentHash::of(data), data.len() as u64)
    }

    #[test]
    fn starts_at_empty_revision_zero() {
        let index = ContentIndex::new();
        let rev = index.current();
        assert_eq!(rev.seq(), 0);
        assert!(rev.is_empty());
    }

    #[test]
    fn current_tracks_latest_publish() {
        let index = ContentIndex::new();
        for n in 1..=5u8 {
            let rev = index
                .publish(PublishSet::Full(vec![item("a.pak", &[n; 8])]))
                .unwrap();
            assert_eq!(rev.seq(), n as u64);
            assert_eq!(index.current().seq(), n as u64);
        }
    }

    #[test]
    fn held_revision_survives_later_publishes() {
        let index = ContentIndex::new();
        let r1 = index
            .publish(PublishSet::Full(vec![item("a.pak", b"one")]))
            .unwrap();
        for n in 0..3u8 {
            index
                .publish(PublishSet::Full(vec![item("a.pak", &[n; 4])]))
                .unwrap();
        }
        assert_eq!(r1.get("a.pak").unwrap().hash, ContentHash::of(b"one"));
        assert!(index.revision(1).is_some());
        assert!(index.revision(2).is_none());
        drop(r1);
        assert!(index.revision(1).is_none());
    }

    #[test]
    fn invalid_items_rejected_and_current_kept() {
        let index = ContentIndex::new();
        index
            .publish(PublishSet::Full(vec![item("a.pak", b"a")]))
            .unwrap();

        let mut no_hash = item("b.pak", b"b");
        no_hash.hash = ContentHash::ZERO;
        let mut zero = item("c.pak", b"c");
        zero.size = 0;
        let escape = item("../etc/passwd", b"x");

        for bad in [no_hash, zero, escape] {
            let err = index
                .publish(PublishSet::Incremental {
                    upserts: vec![bad],
                    removals: vec![],
                })
                .unwrap_err();
            assert!(matches!(err, PublishError::InvalidContentItem { .. }));
        }
        assert_eq!(index.current().seq(), 1);
        // Rejected publishes do not burn sequence numbers.
        let next = index
            .publish(PublishSet::Full(vec![item("a.pak", b"a2")]))
            .unwrap();
        assert_eq!(next.seq(), 2);
    }

    #[test]
    fn full_publish_rejects_duplicate_paths() {
        let index = ContentIndex::new();
        let err = index
            .publish(PublishSet::Full(vec![item("a", b"1"), item("a", b"2")]))
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidContentItem { ref reason, .. } if reason == "duplicate path"));
    }

    #[test]
    fn incremental_publish_applies_on_top() {
        let index = ContentIndex::new();
        index
            .publish(PublishSet::Full(vec![item("a", b"1"), item("b", b"2")]))
            .unwrap();
        let rev = index
            .publish(PublishSet::Incremental {
                upserts: vec![item("c", b"3")],
                removals: vec!["a".to_string()],
            })
            .unwrap();
        let paths: Vec<&str> = rev.items().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "c"]);
    }

    #[test]
    fn diff_reports_added_modified_removed() {
        let index = ContentIndex::new();
        let r1 = index
            .publish(PublishSet::Full(vec![item("a", b"1"), item("b", b"2")]))
            .unwrap();
        let r2 = index
            .publish(PublishSet::Full(vec![item("b", b"22"), item("c", b"3")]))
            .unwrap();
        let diff = index.diff(r1.seq(), r2.seq()).unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].path, "c");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].1.path, "b");
        assert_eq!(diff.removed[0].path, "a");
        assert!(r2.diff(&r2).is_empty());
        assert_eq!(index.diff(7, 2), Err(IndexError::RevisionGone(7)));
    }

    #[test]
    fn gc_reports_orphaned_hashes() {
        let index = ContentIndex::new();
        let r1 = index
            .publish(PublishSet::Full(vec![item("a", b"old"), item("b", b"keep")]))
            .unwrap();
        index
            .publish(PublishSet::Full(vec![item("a", b"new"), item("b", b"keep")]))
            .unwrap();

        // r1 is still pinned: only the empty genesis revision goes.
        let report = index.collect_garbage();
        assert_eq!(report.dropped_revisions, vec![0]);
        assert!(report.orphaned.is_empty());

        drop(r1);
        let report = index.collect_garbage();
        assert_eq!(report.dropped_revisions, vec![1]);
        assert_eq!(report.orphaned, vec![ContentHash::of(b"old")]);
        assert_eq!(index.live_revisions(), vec![2]);
    }

    #[test]
    fn list_and_select() {
        let index = ContentIndex::new();
        let rev = index
            .publish(PublishSet::Full(vec![
                item("Content/Maps/L1.umap", b"1"),
                item("Content/Maps/L2.umap", b"2"),
                item("Content/Tex/T.uasset", b"3"),
                item("Config/Game.ini", b"4"),
            ]))
            .unwrap();
        assert_eq!(rev.list("Content/Maps/").len(), 2);
        assert_eq!(rev.list("").len(), 4);

        let sel = Selection::pattern("Content/*");
        assert_eq!(rev.select(&sel).unwrap().len(), 3);
        let sel = Selection::paths(["Config/Game.ini", "missing"]);
        assert_eq!(
            rev.select(&sel).unwrap_err(),
            SelectionError::NotFound("missing".to_string())
        );
        assert_eq!(
            rev.select(&Selection::pattern("*.nope")).unwrap_err(),
            SelectionError::Empty
        );
    }

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize_path("a\\b/./c").as_deref(), Some("a/b/c"));
        assert_eq!(normalize_path("./x//y").as_deref(), Some("x/y"));
        assert_eq!(normalize_path("/abs"), None);
        assert_eq!(normalize_path("C:/abs"), None);
        assert_eq!(normalize_path("a/../b"), None);
        assert_eq!(normalize_path(""), None);
    }

    #[test]
    fn concurrent_readers_see_monotonic_revisions() {
        let index = Arc::new(ContentIndex::new());
        let writer = {
            let index = index.clone();
            std::thread::spawn(move || {
                for n in 0..200u32 {
                    index
                        .publish(PublishSet::Full(vec![item("a", &n.to_le_bytes())]))
                        .unwrap();
                }
            })
        };
        let mut last = 0;
        for _ in 0..1000 {
            let seq = index.current().seq();
            assert!(seq >= last);
            last = seq;
        }
        writer.join().unwrap();
        assert_eq!(index.current().seq(), 200);
    }
}
