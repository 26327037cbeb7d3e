//! Progressive CRC tracking for in-flight transfers.
//!
//! Each concurrent transfer keeps `(last_part, temp_crc)` in a concurrent
//! map keyed `peer_id ^ name_hash`; the client side forces the peer
//! component to 0 so its keys can never collide with server-side ones.
//! The receiver validates the final file without rehashing after every
//! chunk, and a partial file left on disk can be re-adopted after a
//! restart by rehashing it once.

use std::io::Read;
use std::path::Path;

use dashmap::DashMap;

use nimbus_core::fileid::HashFile;
use nimbus_core::hash::{ulong_hash, START_CRC};

#[derive(Debug, Clone, Copy)]
struct PartialCrc {
    last_part: u32,
    temp_crc: u64,
}

/// Outcome of a successful `update`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAdvance {
    /// The part the tracker now stands at. Differs from the requested
    /// part only when a partial file was restored.
    pub part: u32,
    pub crc: u64,
    pub restored: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CrcError {
    #[error("chunk {got} arrived while expecting {expected}")]
    OutOfSequence { expected: u32, got: u32 },

    #[error("no tracker state and no matching partial file for part {part}")]
    MissingState { part: u32 },

    #[error("chunk of {got} bytes exceeds the {limit}-byte chunk size")]
    ChunkTooLarge { limit: usize, got: usize },

    #[error("first chunk on disk does not match the sender's")]
    FirstChunkMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrcError {
    /// Recoverable errors make the receiver ask for a restart from part 1;
    /// the transfer itself survives.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CrcError::Io(_))
    }
}

pub struct CrcTracker {
    entries: DashMap<u64, PartialCrc>,
    chunk_size: usize,
}

impl CrcTracker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            chunk_size,
        }
    }

    fn key(peer_id: u64, name_hash: HashFile) -> u64 {
        peer_id ^ name_hash
    }

    /// Advance the progressive CRC with one chunk.
    ///
    /// With `try_restore` set and `part == 1`, an existing partial file of
    /// whole-chunk length is adopted: live tracker state is reused when it
    /// matches the file, otherwise the file is rehashed from disk (checking
    /// its first chunk against `first_chunk` when provided). A partial file
    /// that fails any check is deleted.
    ///
    /// A repeated update for the already-recorded part is a no-op, so
    /// duplicated chunks cannot corrupt the CRC.
    pub fn update(
        &self,
        peer_id: u64,
        name_hash: HashFile,
        part: u32,
        chunk: &[u8],
        temp_path: &Path,
        try_restore: bool,
        first_chunk: Option<&[u8]>,
    ) -> Result<ChunkAdvance, CrcError> {
        if chunk.len() > self.chunk_size {
            return Err(CrcError::ChunkTooLarge {
                limit: self.chunk_size,
                got: chunk.len(),
            });
        }
        if part == 0 {
            return Err(CrcError::OutOfSequence {
                expected: 1,
                got: 0,
            });
        }
        let key = Self::key(peer_id, name_hash);

        if try_restore && part == 1 {
            if let Some(advance) = self.try_restore(key, temp_path, first_chunk)? {
                return Ok(advance);
            }
        }

        if part == 1 {
            let crc = ulong_hash(START_CRC, chunk);
            self.entries.insert(
                key,
                PartialCrc {
                    last_part: 1,
                    temp_crc: crc,
                },
            );
            return Ok(ChunkAdvance {
                part: 1,
                crc,
                restored: false,
            });
        }

        let state = self.entries.get(&key).map(|e| *e);
        match state {
            Some(state) if state.last_part == part => {
                // Duplicate delivery of the chunk we already mixed in.
                Ok(ChunkAdvance {
                    part,
                    crc: state.temp_crc,
                    restored: false,
                })
            }
            Some(state) if state.last_part + 1 == part => {
                let crc = ulong_hash(state.temp_crc, chunk);
                self.entries.insert(
                    key,
                    PartialCrc {
                        last_part: part,
                        temp_crc: crc,
                    },
                );
                Ok(ChunkAdvance {
                    part,
                    crc,
                    restored: false,
                })
            }
            Some(state) => Err(CrcError::OutOfSequence {
                expected: state.last_part + 1,
                got: part,
            }),
            None => {
                // State lost mid-transfer. The temp file should hold the
                // previous parts; rehash it to recover, checking its first
                // chunk against the caller's copy when one is supplied.
                let expected_len = (part as u64 - 1) * self.chunk_size as u64;
                let on_disk = std::fs::metadata(temp_path).map(|m| m.len()).unwrap_or(0);
                if on_disk != expected_len || expected_len == 0 {
                    return Err(CrcError::MissingState { part });
                }
                let crc = self.rehash_file(temp_path, part - 1, first_chunk)?;
                let crc = ulong_hash(crc, chunk);
                self.entries.insert(
                    key,
                    PartialCrc {
                        last_part: part,
                        temp_crc: crc,
                    },
                );
                Ok(ChunkAdvance {
                    part,
                    crc,
                    restored: false,
                })
            }
        }
    }

    fn try_restore(
        &self,
        key: u64,
        temp_path: &Path,
        first_chunk: Option<&[u8]>,
    ) -> Result<Option<ChunkAdvance>, CrcError> {
        let len = match std::fs::metadata(temp_path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(None),
        };
        if len == 0 || len % self.chunk_size as u64 != 0 {
            // Not a resumable remainder; start over.
            let _ = std::fs::remove_file(temp_path);
            self.entries.remove(&key);
            return Ok(None);
        }
        let parts = (len / self.chunk_size as u64) as u32;

        if let Some(state) = self.entries.get(&key).map(|e| *e) {
            if state.last_part == parts {
                return Ok(Some(ChunkAdvance {
                    part: parts,
                    crc: state.temp_crc,
                    restored: true,
                }));
            }
        }

        match self.rehash_file(temp_path, parts, first_chunk) {
            Ok(crc) => {
                self.entries.insert(
                    key,
                    PartialCrc {
                        last_part: parts,
                        temp_crc: crc,
                    },
                );
                Ok(Some(ChunkAdvance {
                    part: parts,
                    crc,
                    restored: true,
                }))
            }
            Err(err) => {
                tracing::debug!(
                    path = %temp_path.display(),
                    error = %err,
                    "stale partial file rejected"
                );
                let _ = std::fs::remove_file(temp_path);
                self.entries.remove(&key);
                Ok(None)
            }
        }
    }

    fn rehash_file(
        &self,
        path: &Path,
        parts: u32,
        first_chunk: Option<&[u8]>,
    ) -> Result<u64, CrcError> {
        let mut file = std::fs::File::open(path)?;
        let mut crc = START_CRC;
        let mut buf = vec![0u8; self.chunk_size];
        for part in 1..=parts {
            file.read_exact(&mut buf)?;
            if part == 1 {
                if let Some(expected) = first_chunk {
                    if expected != &buf[..expected.len().min(buf.len())] {
                        return Err(CrcError::FirstChunkMismatch);
                    }
                }
            }
            crc = ulong_hash(crc, &buf);
        }
        Ok(crc)
    }

    /// The stored CRC for a transfer, iff the tracker stands exactly at
    /// `part`. 0 otherwise.
    pub fn crc(&self, peer_id: u64, name_hash: HashFile, part: u32) -> u64 {
        self.entries
            .get(&Self::key(peer_id, name_hash))
            .filter(|e| e.last_part == part)
            .map(|e| e.temp_crc)
            .unwrap_or(0)
    }

    /// Drop state for a completed or abandoned transfer.
    pub fn remove(&self, peer_id: u64, name_hash: HashFile) {
        self.entries.remove(&Self::key(peer_id, name_hash));
    }

    /// Drop all state. Used on teardown.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
