//! Zero-knowledge obfuscation — file contents and names leave this host
//! encrypted; the remote side stores and serves them without ever seeing
//! plaintext.
//!
//! Key schedule, from a caller-supplied master key:
//!   filename_key = SHA-256(master)                          (32 B)
//!   master'      = Blake2b-512(master ‖ filename_key)       (64 B)
//!   per-file key = Blake2b-512(path ‖ len(path) LE ‖ mtime LE ‖ master')
//!
//! The per-file key folds in the mtime, so every overwrite yields a fresh
//! keystream — the whole file is re-encrypted on change and a keystream is
//! never reused.
//!
//! The content cipher is a symmetric XOR keystream: encryption and
//! decryption are the same operation.

use blake2::{Blake2b512, Digest};
use zeroize::Zeroizing;

use nimbus_core::hash::hash256;

/// Marks an obfuscated filename component. Outside the glyph alphabet, so
/// in-flight obfuscated names are recognizable without side metadata.
pub const SENTINEL: char = '⁇';

/// First code point of the 256-glyph alphabet. The range is contiguous,
/// so byte ↔ glyph is pure arithmetic.
const ALPHABET_BASE: u32 = 0x2460;

/// Directory names that stay clear; everything beneath one stays clear too.
pub const SPECIAL_DIRECTORIES: &[&str] = &[".cloud_cache", "Shared"];

/// Blocks processed between keystream refreshes.
const BLOCKS_PER_STREAM: u64 = 8;

fn blake2b(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ZeroKnowledgeError {
    #[error("name does not carry the obfuscation sentinel")]
    NotObfuscated,

    #[error("glyph {0:?} is outside the obfuscation alphabet")]
    BadGlyph(char),

    #[error("deobfuscated name is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
}

pub struct ZeroKnowledge {
    filename_key: [u8; 32],
    master_key: Zeroizing<[u8; 64]>,
}

impl ZeroKnowledge {
    pub fn new(master: &[u8]) -> Self {
        let filename_key = hash256(master);
        let master_key = Zeroizing::new(blake2b(&[master, &filename_key]));
        Self {
            filename_key,
            master_key,
        }
    }

    fn per_file_key(&self, path: &str, mtime: u32) -> Zeroizing<[u8; 64]> {
        let path_bytes = path.as_bytes();
        Zeroizing::new(blake2b(&[
            path_bytes,
            &(path_bytes.len() as u64).to_le_bytes(),
            &mtime.to_le_bytes(),
            &*self.master_key,
        ]))
    }

    /// Cipher for one file's content, bound to its plaintext path and
    /// mtime. Encryption and decryption are the same operation.
    pub fn content_cipher(&self, path: &str, mtime: u32) -> ContentCipher {
        ContentCipher::new(&self.per_file_key(path, mtime))
    }

    // ── Filename obfuscation ─────────────────────────────────────────────────

    /// True when a name component carries the sentinel.
    pub fn is_obfuscated(component: &str) -> bool {
        component.ends_with(SENTINEL)
    }

    fn name_keystream(&self, len: usize) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(len));
        let mut state = blake2b(&[&self.filename_key]);
        while out.len() < len {
            let take = (len - out.len()).min(64);
            out.extend_from_slice(&state[..take]);
            state = blake2b(&[&self.filename_key, &state]);
        }
        out
    }

    /// Obfuscate one path component. A leading dot is preserved in clear;
    /// the rest is masked with the keystream, mapped into the glyph
    /// alphabet, and terminated with the sentinel.
    pub fn encrypt_file_name(&self, name: &str) -> String {
        let has_dot = name.starts_with('.');
        let body = if has_dot { &name[1..] } else { name };
        let bytes = body.as_bytes();
        let keystream = self.name_keystream(bytes.len());

        let mut out = String::with_capacity(bytes.len() * 3 + 4);
        if has_dot {
            out.push('.');
        }
        for (byte, key) in bytes.iter().zip(keystream.iter()) {
            out.push(glyph(byte ^ key));
        }
        out.push(SENTINEL);
        out
    }

    /// Reverse of `encrypt_file_name`.
    pub fn decrypt_file_name(&self, name: &str) -> Result<String, ZeroKnowledgeError> {
        let stripped = name
            .strip_suffix(SENTINEL)
            .ok_or(ZeroKnowledgeError::NotObfuscated)?;
        let has_dot = stripped.starts_with('.');
        let body = if has_dot { &stripped[1..] } else { stripped };

        let mut masked = Vec::with_capacity(body.chars().count());
        for ch in body.chars() {
            masked.push(glyph_value(ch)?);
        }
        let keystream = self.name_keystream(masked.len());
        let bytes: Vec<u8> = masked
            .iter()
            .zip(keystream.iter())
            .map(|(byte, key)| byte ^ key)
            .collect();

        let clear = String::from_utf8(bytes)?;
        Ok(if has_dot { format!(".{clear}") } else { clear })
    }

    /// Obfuscate a full cloud-relative path component by component.
    /// Special directory names stay clear, and once a clear name is seen
    /// every deeper component stays clear as well.
    pub fn encrypt_full_file_name(&self, path: &str) -> String {
        let mut clear_from_here = false;
        let parts: Vec<String> = path
            .split('/')
            .map(|component| {
                if clear_from_here {
                    return component.to_owned();
                }
                if SPECIAL_DIRECTORIES.contains(&component) {
                    clear_from_here = true;
                    return component.to_owned();
                }
                self.encrypt_file_name(component)
            })
            .collect();
        parts.join("/")
    }

    /// Reverse of `encrypt_full_file_name`. Components without the
    /// sentinel are passed through unchanged.
    pub fn decrypt_full_file_name(&self, path: &str) -> Result<String, ZeroKnowledgeError> {
        let mut parts = Vec::new();
        for component in path.split('/') {
            if Self::is_obfuscated(component) {
                parts.push(self.decrypt_file_name(component)?);
            } else {
                parts.push(component.to_owned());
            }
        }
        Ok(parts.join("/"))
    }
}

fn glyph(byte: u8) -> char {
    // The whole range ALPHABET_BASE..ALPHABET_BASE+256 is valid scalar
    // values, so this cannot fail.
    char::from_u32(ALPHABET_BASE + u32::from(byte)).unwrap()
}

fn glyph_value(ch: char) -> Result<u8, ZeroKnowledgeError> {
    (ch as u32)
        .checked_sub(ALPHABET_BASE)
        .filter(|v| *v < 256)
        .map(|v| v as u8)
        .ok_or(ZeroKnowledgeError::BadGlyph(ch))
}

// ── Content cipher ────────────────────────────────────────────────────────────

/// Streaming XOR cipher over 8-byte blocks.
///
/// `seal = Blake2b-512(per-file key)`, `stream₀ = Blake2b-512(seal)`.
/// Block `i` is XORed with bytes `[8c, 8c+8)` of the current stream where
/// `c = i mod 8`; after every 8 blocks the stream is refreshed as
/// `Blake2b-512(seal ‖ stream)`. The final short block copies only the
/// real byte count.
///
/// Feed data in multiples of 8 bytes; only the last call may be shorter.
/// Transfer chunks are multiples of 64 bytes, so chunk boundaries always
/// align.
pub struct ContentCipher {
    seal: Zeroizing<[u8; 64]>,
    stream: [u8; 64],
    block: u64,
}

impl ContentCipher {
    fn new(per_file_key: &[u8; 64]) -> Self {
        let seal = Zeroizing::new(blake2b(&[per_file_key]));
        let stream = blake2b(&[&*seal]);
        Self {
            seal,
            stream,
            block: 0,
        }
    }

    /// Transform `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        for block in data.chunks_mut(8) {
            let offset = (self.block % 8) as usize * 8;
            for (byte, key) in block.iter_mut().zip(&self.stream[offset..offset + 8]) {
                *byte ^= key;
            }
            self.block += 1;
            if self.block % BLOCKS_PER_STREAM == 0 {
                self.stream = blake2b(&[&*self.seal, &self.stream]);
            }
        }
    }
}
