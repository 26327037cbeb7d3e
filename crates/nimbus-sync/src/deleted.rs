//! Deletion memory — what this endpoint has removed, so the reconciler
//! never resurrects a locally deleted file on the next pass.
//!
//! Two lists with different lifetimes:
//!   - the temporary dictionary (hash → path) covers deletions since the
//!     last reconcile and is cleared by it;
//!   - the persistent list survives restarts in
//!     `.cloud_cache/<user_id>.Deleted`, capped at 1000 hashes with the
//!     oldest evicted first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use nimbus_core::fileid::{FileId, HashFile};

/// Upper bound on persisted hashes; the oldest entry is evicted beyond it.
pub const MAX_PERSISTENT: usize = 1000;

pub struct DeletedRegistry {
    temporary: HashMap<HashFile, String>,
    persistent: VecDeque<HashFile>,
    persistent_set: HashSet<HashFile>,
    file_path: PathBuf,
}

impl DeletedRegistry {
    /// Open the registry for `user_id`, loading the persisted list when
    /// present. A corrupt file is discarded and the registry starts empty.
    pub fn open(cache_dir: &Path, user_id: u64) -> Self {
        let file_path = cache_dir.join(format!("{user_id}.Deleted"));
        let mut registry = Self {
            temporary: HashMap::new(),
            persistent: VecDeque::new(),
            persistent_set: HashSet::new(),
            file_path,
        };
        if let Err(err) = registry.load() {
            tracing::warn!(error = %err, "deleted-file list unreadable, starting empty");
            registry.persistent.clear();
            registry.persistent_set.clear();
        }
        registry
    }

    /// Record a local deletion observed since the last reconcile.
    pub fn record_local(&mut self, hash: HashFile, path: String) {
        self.temporary.insert(hash, path);
        self.push_persistent(hash);
    }

    /// Record deletions the remote asked for. Every supplied id is added.
    pub fn add_remote_requested(&mut self, ids: &[FileId]) {
        for id in ids {
            self.push_persistent(id.hash());
        }
    }

    fn push_persistent(&mut self, hash: HashFile) {
        if !self.persistent_set.insert(hash) {
            return;
        }
        self.persistent.push_back(hash);
        while self.persistent.len() > MAX_PERSISTENT {
            if let Some(evicted) = self.persistent.pop_front() {
                self.persistent_set.remove(&evicted);
            }
        }
        if let Err(err) = self.save() {
            tracing::warn!(error = %err, "failed to persist deleted-file list");
        }
    }

    /// Is this hash recorded in either list?
    pub fn contains(&self, hash: HashFile) -> bool {
        self.temporary.contains_key(&hash) || self.persistent_set.contains(&hash)
    }

    /// The path recorded for a temporarily deleted item.
    pub fn temporary_path(&self, hash: HashFile) -> Option<&str> {
        self.temporary.get(&hash).map(String::as_str)
    }

    pub fn temporary_len(&self) -> usize {
        self.temporary.len()
    }

    pub fn persistent_len(&self) -> usize {
        self.persistent.len()
    }

    /// Forget the since-last-reconcile dictionary. Called at the end of
    /// every reconcile pass.
    pub fn clear_temporary(&mut self) {
        self.temporary.clear();
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.file_path.with_extension("Deleted.tmp");
        {
            let mut out = std::fs::File::create(&tmp)?;
            out.write_all(&(self.persistent.len() as u32).to_le_bytes())?;
            for hash in &self.persistent {
                out.write_all(&hash.to_le_bytes())?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.file_path)
    }

    fn load(&mut self) -> std::io::Result<()> {
        let buf = match std::fs::read(&self.file_path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if buf.len() < 4 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "missing length prefix",
            ));
        }
        let count = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + count * 8 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated hash stream",
            ));
        }
        for i in 0..count.min(MAX_PERSISTENT) {
            let offset = 4 + i * 8;
            let hash = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
            if self.persistent_set.insert(hash) {
                self.persistent.push_back(hash);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> DeletedRegistry {
        DeletedRegistry::open(dir, 7)
    }

    #[test]
    fn records_both_lists() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(tmp.path());
        reg.record_local(10, "a/b.txt".into());

        assert!(reg.contains(10));
        assert_eq!(reg.temporary_path(10), Some("a/b.txt"));
        assert!(!reg.contains(11));
    }

    #[test]
    fn clear_temporary_keeps_persistent_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(tmp.path());
        reg.record_local(10, "a".into());
        reg.clear_temporary();

        assert!(reg.temporary_path(10).is_none());
        assert!(reg.contains(10), "persistent list still remembers it");
    }

    #[test]
    fn survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut reg = registry(tmp.path());
            reg.record_local(10, "a".into());
            reg.record_local(20, "b".into());
        }
        let reg = registry(tmp.path());
        assert!(reg.contains(10));
        assert!(reg.contains(20));
        assert_eq!(reg.persistent_len(), 2);
        assert_eq!(reg.temporary_len(), 0);
    }

    #[test]
    fn remote_requested_adds_every_supplied_id() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(tmp.path());
        let ids = [FileId::new(1, 5), FileId::new(2, 6), FileId::new(3, 7)];
        reg.add_remote_requested(&ids);
        for id in &ids {
            assert!(reg.contains(id.hash()));
        }
    }

    #[test]
    fn cap_evicts_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(tmp.path());
        for hash in 0..(MAX_PERSISTENT as u64 + 5) {
            reg.record_local(hash, String::new());
        }
        assert_eq!(reg.persistent_len(), MAX_PERSISTENT);
        assert!(!reg.contains(0), "hash 0 was evicted");
        assert!(reg.contains(MAX_PERSISTENT as u64 + 4));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("7.Deleted"), [1, 2]).unwrap();
        let reg = registry(tmp.path());
        assert_eq!(reg.persistent_len(), 0);
    }

    #[test]
    fn duplicate_hashes_are_stored_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(tmp.path());
        reg.record_local(10, "a".into());
        reg.record_local(10, "a".into());
        assert_eq!(reg.persistent_len(), 1);
    }
}
