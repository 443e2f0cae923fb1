//! Content-addressed blob storage. Served bytes live here, keyed by hash, so the
//! cook directory can be overwritten without touching anything a client is reading.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::integrity::ContentHash;

/// Byte storage keyed by content hash. Blobs are immutable once written.
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its hash. Storing an existing blob is a no-op.
    fn put(&self, data: &[u8]) -> io::Result<ContentHash>;

    fn contains(&self, hash: &ContentHash) -> bool;

    /// Size of the blob in bytes.
    fn blob_len(&self, hash: &ContentHash) -> io::Result<u64>;

    /// Read `len` bytes starting at `offset`. Short reads at the end of the blob are errors.
    fn read_range(&self, hash: &ContentHash, offset: u64, len: u64) -> io::Result<Vec<u8>>;

    /// Drop a blob. Returns whether it existed.
    fn remove(&self, hash: &ContentHash) -> io::Result<bool>;

    fn read_all(&self, hash: &ContentHash) -> io::Result<Vec<u8>> {
        let len = self.blob_len(hash)?;
        self.read_range(hash, 0, len)
    }

    /// Hash and store a file from disk. Returns (hash, size).
    fn put_file(&self, path: &Path) -> io::Result<(ContentHash, u64)> {
        let data = fs::read(path)?;
        let hash = self.put(&data)?;
        Ok((hash, data.len() as u64))
    }
}

fn not_found(hash: &ContentHash) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("blob {} not found", hash))
}

fn check_range(hash: &ContentHash, blob_len: u64, offset: u64, len: u64) -> io::Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= blob_len => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "range {}+{} outside blob {} of {} bytes",
                offset, len, hash, blob_len
            ),
        )),
    }
}

/// In-memory store. Used when no cache directory is configured, and in tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ContentHash, Arc<[u8]>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, data: &[u8]) -> io::Result<ContentHash> {
        let hash = ContentHash::of(data);
        self.blobs
            .write()
            .entry(hash)
            .or_insert_with(|| Arc::from(data));
        Ok(hash)
    }

    fn contains(&self, hash: &ContentHash) -> bool {
        self.blobs.read().contains_key(hash)
    }

    fn blob_len(&self, hash: &ContentHash) -> io::Result<u64> {
        self.blobs
            .read()
            .get(hash)
            .map(|b| b.len() as u64)
            .ok_or_else(|| not_found(hash))
    }

    fn read_range(&self, hash: &ContentHash, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let blob = self
            .blobs
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| not_found(hash))?;
        check_range(hash, blob.len() as u64, offset, len)?;
        let start = offset as usize;
        Ok(blob[start..start + len as usize].to_vec())
    }

    fn remove(&self, hash: &ContentHash) -> io::Result<bool> {
        Ok(self.blobs.write().remove(hash).is_some())
    }
}

/// On-disk store at `<root>/<first byte hex>/<hash hex>`. Writes go through a
/// temp file and a rename so readers never observe a partial blob.
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened blob store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Re-hash a stored blob and compare with its name.
    pub fn verify(&self, hash: &ContentHash) -> io::Result<bool> {
        let data = fs::read(self.path_for(hash))?;
        let ok = ContentHash::of(&data) == *hash;
        if !ok {
            warn!(%hash, "blob failed verification");
        }
        Ok(ok)
    }
}

impl BlobStore for DiskBlobStore {
    fn put(&self, data: &[u8]) -> io::Result<ContentHash> {
        let hash = ContentHash::of(data);
        let path = self.path_for(&hash);
        // A blob left by an earlier run is only trusted once it re-hashes cleanly.
        if path.exists() && self.verify(&hash).unwrap_or(false) {
            return Ok(hash);
        }
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut f = File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(hash)
    }

    fn contains(&self, hash: &ContentHash) -> bool {
        self.path_for(hash).is_file()
    }

    fn blob_len(&self, hash: &ContentHash) -> io::Result<u64> {
        match fs::metadata(self.path_for(hash)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(hash)),
            Err(e) => Err(e),
        }
    }

    fn read_range(&self, hash: &ContentHash, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut f = match File::open(self.path_for(hash)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(hash)),
            Err(e) => return Err(e),
        };
        check_range(hash, f.metadata()?.len(), offset, len)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn remove(&self, hash: &ContentHash) -> io::Result<bool> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
