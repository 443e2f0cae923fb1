//! Pak-style archive format.
//!
//! Layout: 8-byte magic, entry blobs back to back, bincode table of contents,
//! then a 24-byte footer (toc offset, toc length, magic). Entries are stored
//! raw or zstd-compressed, whichever is smaller; their stored bytes depend only
//! on the content, so they can be copied verbatim between archives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::integrity::ContentHash;
use crate::selection::{Selection, SelectionKey};

pub const MAGIC: [u8; 8] = *b"SHPK\0\0\0\x01";
const FOOTER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Stored,
    Zstd,
}

/// Table-of-contents record for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub hash: ContentHash,
    /// Uncompressed size.
    pub size: u64,
    /// Offset of the stored bytes from the start of the archive.
    pub offset: u64,
    pub stored_len: u64,
    pub method: Method,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveFormatError {
    #[error("not an archive (bad magic)")]
    BadMagic,
    #[error("archive truncated")]
    Truncated,
    #[error("table of contents: {0}")]
    Toc(#[from] bincode::Error),
    #[error("entry {0} points outside the archive")]
    EntryOutOfBounds(String),
    #[error("no entry {0}")]
    NoEntry(String),
    #[error("entry {path} failed to decode: {reason}")]
    Decode { path: String, reason: String },
    #[error("entry {0} does not match its hash")]
    HashMismatch(String),
}

/// Compress `data` at `level`; falls back to storing raw when compression does not help.
pub fn encode_entry(data: &[u8], level: i32) -> std::io::Result<(Method, Vec<u8>)> {
    let packed = zstd::bulk::compress(data, level)?;
    if packed.len() < data.len() {
        Ok((Method::Zstd, packed))
    } else {
        Ok((Method::Stored, data.to_vec()))
    }
}

fn decode_entry(entry: &ArchiveEntry, stored: &[u8]) -> Result<Vec<u8>, ArchiveFormatError> {
    let data = match entry.method {
        Method::Stored => stored.to_vec(),
        Method::Zstd => zstd::bulk::decompress(stored, entry.size as usize).map_err(|e| {
            ArchiveFormatError::Decode {
                path: entry.path.clone(),
                reason: e.to_string(),
            }
        })?,
    };
    if data.len() as u64 != entry.size || ContentHash::of(&data) != entry.hash {
        return Err(ArchiveFormatError::HashMismatch(entry.path.clone()));
    }
    Ok(data)
}

/// Appends entries and produces the final archive bytes.
pub struct ArchiveWriter {
    buf: Vec<u8>,
    entries: Vec<ArchiveEntry>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self {
            buf: MAGIC.to_vec(),
            entries: Vec::new(),
        }
    }

    /// Append already-encoded entry bytes.
    pub fn append(
        &mut self,
        path: &str,
        hash: ContentHash,
        size: u64,
        method: Method,
        stored: &[u8],
    ) {
        self.entries.push(ArchiveEntry {
            path: path.to_string(),
            hash,
            size,
            offset: self.buf.len() as u64,
            stored_len: stored.len() as u64,
            method,
        });
        self.buf.extend_from_slice(stored);
    }

    pub fn finish(mut self) -> Result<(Vec<u8>, Vec<ArchiveEntry>), bincode::Error> {
        let toc = bincode::serialize(&self.entries)?;
        let toc_offset = self.buf.len() as u64;
        self.buf.extend_from_slice(&toc);
        self.buf.extend_from_slice(&toc_offset.to_le_bytes());
        self.buf.extend_from_slice(&(toc.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(&MAGIC);
        Ok((self.buf, self.entries))
    }
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view over archive bytes, e.g. on the receiving device.
pub struct ArchiveReader<'a> {
    data: &'a [u8],
    entries: Vec<ArchiveEntry>,
}

impl<'a> ArchiveReader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ArchiveFormatError> {
        if data.len() < MAGIC.len() + FOOTER_LEN {
            return Err(ArchiveFormatError::Truncated);
        }
        if data[..MAGIC.len()] != MAGIC || data[data.len() - MAGIC.len()..] != MAGIC {
            return Err(ArchiveFormatError::BadMagic);
        }
        let footer = &data[data.len() - FOOTER_LEN..];
        let toc_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap_or([0; 8])) as usize;
        let toc_len = u64::from_le_bytes(footer[8..16].try_into().unwrap_or([0; 8])) as usize;
        let toc_end = toc_offset
            .checked_add(toc_len)
            .ok_or(ArchiveFormatError::Truncated)?;
        if toc_offset < MAGIC.len() || toc_end > data.len() - FOOTER_LEN {
            return Err(ArchiveFormatError::Truncated);
        }
        let entries: Vec<ArchiveEntry> = bincode::deserialize(&data[toc_offset..toc_end])?;
        for e in &entries {
            let end = e.offset.checked_add(e.stored_len);
            if e.offset < MAGIC.len() as u64 || end.map_or(true, |end| end > toc_offset as u64) {
                return Err(ArchiveFormatError::EntryOutOfBounds(e.path.clone()));
            }
        }
        Ok(Self { data, entries })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Raw stored bytes of an entry (possibly compressed).
    pub fn stored_bytes(&self, entry: &ArchiveEntry) -> &'a [u8] {
        &self.data[entry.offset as usize..(entry.offset + entry.stored_len) as usize]
    }

    /// Decode an entry and verify it against its hash.
    pub fn extract(&self, path: &str) -> Result<Vec<u8>, ArchiveFormatError> {
        let entry = self
            .entry(path)
            .ok_or_else(|| ArchiveFormatError::NoEntry(path.to_string()))?;
        decode_entry(entry, self.stored_bytes(entry))
    }
}

/// Identifies one build: a revision and a canonical selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildKey {
    pub revision: u64,
    pub selection: SelectionKey,
}

impl BuildKey {
    pub fn new(revision: u64, selection: &Selection) -> Self {
        Self {
            revision,
            selection: selection.key(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveStatus {
    Pending,
    Ready,
    Failed,
    Stale,
}

/// A built archive. Immutable; status lives with the builder.
#[derive(Debug)]
pub struct Archive {
    id: [u8; 16],
    revision: u64,
    selection: Selection,
    entries: Vec<ArchiveEntry>,
    data: Arc<[u8]>,
    hash: ContentHash,
    encoded_paths: Vec<String>,
    reused: usize,
}

impl Archive {
    pub(crate) fn new(
        revision: u64,
        selection: Selection,
        data: Vec<u8>,
        entries: Vec<ArchiveEntry>,
        encoded_paths: Vec<String>,
        reused: usize,
    ) -> Self {
        let hash = ContentHash::of(&data);
        Self {
            id: uuid::Uuid::new_v4().into_bytes(),
            revision,
            selection,
            entries,
            data: Arc::from(data),
            hash,
            encoded_paths,
            reused,
        }
    }

    pub fn id(&self) -> [u8; 16] {
        self.id
    }

    pub fn id_string(&self) -> String {
        uuid::Uuid::from_bytes(self.id).to_string()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn key(&self) -> BuildKey {
        BuildKey::new(self.revision, &self.selection)
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Hash of the complete archive bytes; what clients resume against.
    pub fn content_hash(&self) -> ContentHash {
        self.hash
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn stored_bytes(&self, entry: &ArchiveEntry) -> &[u8] {
        &self.data[entry.offset as usize..(entry.offset + entry.stored_len) as usize]
    }

    /// Paths that were freshly encoded for this archive.
    pub fn encoded_paths(&self) -> &[String] {
        &self.encoded_paths
    }

    pub fn encoded(&self) -> usize {
        self.encoded_paths.len()
    }

    /// Entries copied verbatim from earlier archives.
    pub fn reused(&self) -> usize {
        self.reused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(n: usize) -> Vec<u8> {
        b"cooked-mesh-data;".iter().cycle().take(n).copied().collect()
    }

    fn build(items: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut w = ArchiveWriter::new();
        for (path, data) in items {
            let (method, stored) = encode_entry(data, 3).unwrap();
            w.append(path, ContentHash::of(data), data.len() as u64, method, &stored);
        }
        w.finish().unwrap().0
    }

    #[test]
    fn write_then_extract() {
        let a = compressible(10_000);
        let b: Vec<u8> = (0..64u8).collect();
        let bytes = build(&[("a.uasset", a.clone()), ("b.bin", b.clone())]);
        let reader = ArchiveReader::parse(&bytes).unwrap();
        assert_eq!(reader.entries().len(), 2);
        assert_eq!(reader.entry("a.uasset").unwrap().method, Method::Zstd);
        assert_eq!(reader.extract("a.uasset").unwrap(), a);
        assert_eq!(reader.extract("b.bin").unwrap(), b);
        assert!(matches!(
            reader.extract("c"),
            Err(ArchiveFormatError::NoEntry(_))
        ));
    }

    #[test]
    fn incompressible_entries_are_stored() {
        let noise: Vec<u8> = (0..256u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let (method, stored) = encode_entry(&noise, 3).unwrap();
        if method == Method::Stored {
            assert_eq!(stored, noise);
        } else {
            assert!(stored.len() < noise.len());
        }
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let bytes = build(&[("a", compressible(100))]);
        assert!(matches!(
            ArchiveReader::parse(&bytes[..10]),
            Err(ArchiveFormatError::Truncated)
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(
            ArchiveReader::parse(&bad),
            Err(ArchiveFormatError::BadMagic)
        ));
    }

    #[test]
    fn detects_corrupted_entry() {
        let data = vec![7u8; 32];
        let mut w = ArchiveWriter::new();
        w.append("a", ContentHash::of(&data), 32, Method::Stored, &data);
        let (mut bytes, entries) = w.finish().unwrap();
        bytes[entries[0].offset as usize] ^= 0xff;
        let reader = ArchiveReader::parse(&bytes).unwrap();
        assert!(matches!(
            reader.extract("a"),
            Err(ArchiveFormatError::HashMismatch(_))
        ));
    }

    #[test]
    fn empty_archive_parses() {
        let (bytes, entries) = ArchiveWriter::new().finish().unwrap();
        assert!(entries.is_empty());
        assert!(ArchiveReader::parse(&bytes).unwrap().entries().is_empty());
    }
}
