//! The hash-file table — the indexed view of the cloud root.
//!
//! Two indexes are kept in lockstep: hash → entry and path → hash. The
//! running `used_space` total follows every mutation. Name hashing is
//! injected so a zero-knowledge endpoint fingerprints the obfuscated
//! form of each path while still storing the local one.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nimbus_core::fileid::{FileId, HashFile};
use nimbus_core::hash::hash_file_name;

use crate::entry::{relative_unix_path, FileSystemEntry, CACHE_DIR};

/// Computes the wire fingerprint of a cloud-relative path.
pub type NameHasher = Arc<dyn Fn(&str, bool) -> HashFile + Send + Sync>;

/// Cache file location under the cloud root.
pub fn cache_file_path(root: &Path) -> PathBuf {
    root.join(CACHE_DIR).join("table.bin")
}

const MAGIC: [u8; 4] = *b"NHFT";
const VERSION: u8 = 1;

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Updated,
    /// A different path produced the same hash; the newer mtime won and
    /// the named path was evicted.
    CollisionReplaced { evicted_path: String },
    /// A colliding entry with a newer mtime is already present; the
    /// candidate was discarded.
    CollisionIgnored,
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt table cache: {0}")]
    Corrupt(&'static str),
}

pub struct HashFileTable {
    entries: BTreeMap<HashFile, FileSystemEntry>,
    by_path: HashMap<String, HashFile>,
    used_space: u64,
    hasher: NameHasher,
}

impl HashFileTable {
    pub fn new(hasher: NameHasher) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_path: HashMap::new(),
            used_space: 0,
            hasher,
        }
    }

    /// Table hashing plain (non-obfuscated) names.
    pub fn with_default_hasher() -> Self {
        Self::new(Arc::new(hash_file_name))
    }

    pub fn hash_of(&self, path: &str, is_directory: bool) -> HashFile {
        (self.hasher)(path, is_directory)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_space(&self) -> u64 {
        self.used_space
    }

    pub fn contains(&self, hash: HashFile) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn try_get(&self, hash: HashFile) -> Option<&FileSystemEntry> {
        self.entries.get(&hash)
    }

    /// Look up by path, returning the entry alongside its fingerprint and
    /// wire timestamp.
    pub fn get_by_file_name(&self, path: &str) -> Option<(&FileSystemEntry, HashFile, u32)> {
        let hash = *self.by_path.get(path)?;
        let entry = self.entries.get(&hash)?;
        Some((entry, hash, entry.unix_timestamp()))
    }

    /// `(hash, mtime)` pairs suitable for wire transmission.
    pub fn key_timestamps(&self) -> Vec<(HashFile, u32)> {
        self.entries
            .iter()
            .map(|(hash, entry)| (*hash, entry.unix_timestamp()))
            .collect()
    }

    pub fn elements(&self) -> impl Iterator<Item = (&HashFile, &FileSystemEntry)> {
        self.entries.iter()
    }

    /// Idempotent upsert by path. On a hash collision between two distinct
    /// paths the newer mtime wins.
    pub fn add(&mut self, entry: FileSystemEntry) -> AddOutcome {
        let hash = self.hash_of(entry.path(), entry.is_directory());

        if let Some(existing) = self.entries.get(&hash) {
            if existing.path() == entry.path() {
                self.used_space = self.used_space - existing.size() + entry.size();
                self.entries.insert(hash, entry);
                return AddOutcome::Updated;
            }
            // Two paths, one fingerprint. Keep the newer write.
            if existing.unix_timestamp() > entry.unix_timestamp() {
                return AddOutcome::CollisionIgnored;
            }
            let evicted_path = existing.path().to_owned();
            tracing::warn!(
                hash = hex::encode(hash.to_le_bytes()),
                evicted = %evicted_path,
                kept = %entry.path(),
                "name-hash collision, newer entry wins"
            );
            self.used_space -= existing.size();
            self.by_path.remove(&evicted_path);
            self.used_space += entry.size();
            self.by_path.insert(entry.path().to_owned(), hash);
            self.entries.insert(hash, entry);
            return AddOutcome::CollisionReplaced { evicted_path };
        }

        self.used_space += entry.size();
        self.by_path.insert(entry.path().to_owned(), hash);
        self.entries.insert(hash, entry);
        AddOutcome::Inserted
    }

    pub fn remove(&mut self, hash: HashFile) -> Option<FileSystemEntry> {
        let entry = self.entries.remove(&hash)?;
        self.by_path.remove(entry.path());
        self.used_space -= entry.size();
        Some(entry)
    }

    /// Remove a directory entry and everything beneath it. Returns the
    /// removed `(path, file id)` pairs so the caller can forward them as
    /// remote deletes.
    pub fn remove_directory(&mut self, path: &str) -> Vec<(String, FileId)> {
        let prefix = format!("{path}/");
        let doomed: Vec<HashFile> = self
            .entries
            .iter()
            .filter(|(_, e)| e.path() == path || e.path().starts_with(&prefix))
            .map(|(hash, _)| *hash)
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for hash in doomed {
            if let Some(entry) = self.remove(hash) {
                removed.push((entry.path().to_owned(), entry.file_id(hash)));
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_path.clear();
        self.used_space = 0;
    }

    // ── Scanning ─────────────────────────────────────────────────────────────

    /// Rebuild the table from the cloud root, honoring the visibility
    /// predicate. Invisible directories prune their whole subtree.
    pub fn scan<F>(&mut self, root: &Path, visible: F) -> Result<(), TableError>
    where
        F: Fn(&str) -> bool,
    {
        self.clear();

        let walker = walkdir::WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(&visible)
                    .unwrap_or(false)
            });

        for dirent in walker {
            let dirent = match dirent {
                Ok(d) => d,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry during scan");
                    continue;
                }
            };
            let Some(rel) = relative_unix_path(root, dirent.path()) else {
                continue;
            };
            if dirent.file_type().is_dir() {
                self.add(FileSystemEntry::Directory { path: rel });
            } else if dirent.file_type().is_file() {
                let meta = dirent.metadata().map_err(|e| {
                    TableError::Io(e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                    }))
                })?;
                self.add(FileSystemEntry::File {
                    path: rel,
                    size: meta.len(),
                    mtime: unix_mtime(&meta),
                });
            }
        }
        tracing::debug!(
            entries = self.entries.len(),
            used_space = self.used_space,
            "cloud root scanned"
        );
        Ok(())
    }

    /// Bring a possibly stale table back in line with the disk: entries
    /// whose mtime or size no longer match are rebuilt, vanished entries
    /// are dropped, and new visible entries are picked up.
    pub fn refresh<F>(&mut self, root: &Path, visible: F) -> Result<(), TableError>
    where
        F: Fn(&str) -> bool,
    {
        // A fresh scan rebuilds every out-of-line entry by construction.
        self.scan(root, visible)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Serialize to the cache file. The write is atomic: temp file, then
    /// rename.
    pub fn save(&self, cache_path: &Path) -> Result<(), TableError> {
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = cache_path.with_extension("bin.tmp");
        {
            let mut out = std::fs::File::create(&tmp)?;
            out.write_all(&MAGIC)?;
            out.write_all(&[VERSION])?;
            for (hash, entry) in &self.entries {
                let path_bytes = entry.path().as_bytes();
                out.write_all(&hash.to_le_bytes())?;
                out.write_all(&entry.unix_timestamp().to_le_bytes())?;
                out.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
                out.write_all(path_bytes)?;
                out.write_all(&entry.size().to_le_bytes())?;
                out.write_all(&[u8::from(entry.is_directory())])?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, cache_path)?;
        tracing::debug!(path = %cache_path.display(), entries = self.entries.len(), "table persisted");
        Ok(())
    }

    /// Reload from the cache file. Any structural corruption — bad magic,
    /// bad version, truncated record, stored hash not matching the
    /// recomputed fingerprint — is reported so the caller can fall back to
    /// a full rescan.
    pub fn load(&mut self, cache_path: &Path) -> Result<(), TableError> {
        let mut file = std::fs::File::open(cache_path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.len() < 5 || buf[..4] != MAGIC {
            return Err(TableError::Corrupt("bad magic"));
        }
        if buf[4] != VERSION {
            return Err(TableError::Corrupt("unknown version"));
        }

        self.clear();
        let mut offset = 5;
        while offset < buf.len() {
            if buf.len() - offset < 14 {
                return Err(TableError::Corrupt("truncated record header"));
            }
            let hash = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
            let mtime = u32::from_le_bytes(buf[offset + 8..offset + 12].try_into().unwrap());
            let path_len =
                u16::from_le_bytes(buf[offset + 12..offset + 14].try_into().unwrap()) as usize;
            offset += 14;
            if buf.len() - offset < path_len + 9 {
                return Err(TableError::Corrupt("truncated record body"));
            }
            let path = std::str::from_utf8(&buf[offset..offset + path_len])
                .map_err(|_| TableError::Corrupt("path is not utf-8"))?
                .to_owned();
            offset += path_len;
            let size = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
            let is_dir = buf[offset + 8] != 0;
            offset += 9;

            if self.hash_of(&path, is_dir) != hash {
                return Err(TableError::Corrupt("hash does not match path"));
            }
            let entry = if is_dir {
                FileSystemEntry::Directory { path }
            } else {
                FileSystemEntry::File { path, size, mtime }
            };
            self.add(entry);
        }
        tracing::debug!(path = %cache_path.display(), entries = self.entries.len(), "table loaded");
        Ok(())
    }
}

fn unix_mtime(meta: &std::fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Read the mtime of an on-disk file as wire seconds.
pub fn file_unix_mtime(path: &Path) -> std::io::Result<u32> {
    let meta = std::fs::metadata(path)?;
    Ok(unix_mtime(&meta))
}
