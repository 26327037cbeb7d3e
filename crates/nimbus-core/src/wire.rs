//! Nimbus wire format — on-wire types for everything the two endpoints
//! exchange through the host transport.
//!
//! These types ARE the protocol. Every field and every size is part of
//! the wire format; payload layouts are explicit little-endian so the
//! format never depends on the architecture of either endpoint.
//!
//! The chunk header is #[repr(C, packed)] with zerocopy derives for
//! deterministic layout and allocation-free serialization. There is no
//! unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::fileid::{FileId, HashFile};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Application tag carried by every command — the first two bytes of the
/// protocol name as one little-endian u16.
pub const APP_TAG: u16 = u16::from_le_bytes([b's', b'y']);

/// Current chunk format version.
pub const CHUNK_VERSION: u8 = 0x01;

/// Default transfer chunk size in bytes. Per-peer overrides are allowed
/// via the client record.
pub const DEFAULT_CHUNK_SIZE: u32 = 65_536;

/// Chunk flag: the name field carries an obfuscated (zero-knowledge) path.
pub const CHUNK_FLAG_OBFUSCATED: u8 = 0x01;

/// Chunk flag: the transfer is a bare directory — one part, no data.
pub const CHUNK_FLAG_DIRECTORY: u8 = 0x02;

// ── Commands ──────────────────────────────────────────────────────────────────

/// Closed set of command codes carried over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    LoginRequest = 0x01,
    LoginReply = 0x02,
    /// Empty payload = "send me your table"; otherwise the encoded
    /// `(hash, mtime)` pairs of the sender's table.
    HashTable = 0x03,
    RequestFile = 0x04,
    SendFileChunk = 0x05,
    /// Receiver → sender: highest contiguous part already on disk.
    /// 0 means restart from scratch.
    ResendFrom = 0x06,
    DeleteFile = 0x07,
    DeleteDirectory = 0x08,
    StatusNotification = 0x09,
    Notice = 0x0A,
}

impl TryFrom<u16> for Command {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::LoginRequest),
            0x02 => Ok(Command::LoginReply),
            0x03 => Ok(Command::HashTable),
            0x04 => Ok(Command::RequestFile),
            0x05 => Ok(Command::SendFileChunk),
            0x06 => Ok(Command::ResendFrom),
            0x07 => Ok(Command::DeleteFile),
            0x08 => Ok(Command::DeleteDirectory),
            0x09 => Ok(Command::StatusNotification),
            0x0A => Ok(Command::Notice),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl From<Command> for u16 {
    fn from(c: Command) -> u16 {
        c as u16
    }
}

// ── Notices ───────────────────────────────────────────────────────────────────

/// Peer-to-peer status signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NoticeKind {
    Ready = 0x01,
    Busy = 0x02,
    LoggedOut = 0x03,
    AuthenticationRequired = 0x04,
    RemoteDriveOverLimit = 0x05,
    Synchronized = 0x06,
}

impl TryFrom<u8> for NoticeKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NoticeKind::Ready),
            0x02 => Ok(NoticeKind::Busy),
            0x03 => Ok(NoticeKind::LoggedOut),
            0x04 => Ok(NoticeKind::AuthenticationRequired),
            0x05 => Ok(NoticeKind::RemoteDriveOverLimit),
            0x06 => Ok(NoticeKind::Synchronized),
            other => Err(WireError::UnknownNotice(other)),
        }
    }
}

impl From<NoticeKind> for u8 {
    fn from(n: NoticeKind) -> u8 {
        n as u8
    }
}

// ── Chunk Header ──────────────────────────────────────────────────────────────

/// Header preceding every `SendFileChunk` payload.
///
/// The receiver can fully describe and route a chunk before touching the
/// data: which transfer it belongs to, which part of how many, the file's
/// mtime, and — on the final part — the sender's whole-file CRC.
///
/// Part 1 additionally carries the cloud-relative destination path
/// (`name_len` UTF-8 bytes immediately after the header); later parts set
/// `name_len` to 0 and carry only data.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    /// Name hash identifying the transfer.
    pub name_hash: u64,

    /// 1-based part number.
    pub part: u32,

    /// Total number of parts.
    pub total: u32,

    /// Unix mtime of the source file, applied by the receiver on rename.
    pub mtime: u32,

    /// Sender's progressive CRC over the whole file. Meaningful only when
    /// `part == total`; 0 otherwise.
    pub final_crc: u64,

    /// Byte length of the path that follows the header. Non-zero only on
    /// part 1.
    pub name_len: u16,

    /// Bit flags — see `CHUNK_FLAG_OBFUSCATED`. Remaining bits reserved,
    /// must be zero.
    pub flags: u8,

    /// Wire format version. Currently 0x01. A receiver seeing an unknown
    /// version drops the chunk and answers `ResendFrom(0)`.
    pub version: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; 32]);

/// Serialize a chunk: header, optional path, data.
pub fn encode_chunk(header: &ChunkHeader, name: Option<&str>, data: &[u8]) -> Vec<u8> {
    let name_bytes = name.map(str::as_bytes).unwrap_or_default();
    let mut out = Vec::with_capacity(32 + name_bytes.len() + data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(name_bytes);
    out.extend_from_slice(data);
    out
}

/// Parse a chunk payload back into header, path, and data.
pub fn decode_chunk(buf: &[u8]) -> Result<(ChunkHeader, Option<String>, &[u8]), WireError> {
    let header = ChunkHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
        need: 32,
        have: buf.len(),
    })?;
    let version = header.version;
    if version != CHUNK_VERSION {
        return Err(WireError::UnknownVersion(version));
    }
    let name_len = header.name_len as usize;
    let body = &buf[32..];
    if body.len() < name_len {
        return Err(WireError::Truncated {
            need: 32 + name_len,
            have: buf.len(),
        });
    }
    let name = if name_len == 0 {
        None
    } else {
        Some(
            std::str::from_utf8(&body[..name_len])
                .map_err(WireError::BadName)?
                .to_owned(),
        )
    };
    Ok((header, name, &body[name_len..]))
}

// ── Payload codecs ────────────────────────────────────────────────────────────

/// Encode the `(hash, mtime)` pairs of a hash-file table for transmission.
pub fn encode_key_timestamps(pairs: &[(HashFile, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + pairs.len() * 12);
    out.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for &(hash, mtime) in pairs {
        out.extend_from_slice(&hash.to_le_bytes());
        out.extend_from_slice(&mtime.to_le_bytes());
    }
    out
}

/// Decode a transmitted table back into `(hash, mtime)` pairs,
/// preserving wire order.
pub fn decode_key_timestamps(buf: &[u8]) -> Result<Vec<(HashFile, u32)>, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated {
            need: 4,
            have: buf.len(),
        });
    }
    let count = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    let need = 4 + count * 12;
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            have: buf.len(),
        });
    }
    let mut pairs = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        let hash = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        let mtime = u32::from_le_bytes(buf[offset + 8..offset + 12].try_into().unwrap());
        pairs.push((hash, mtime));
        offset += 12;
    }
    Ok(pairs)
}

/// `RequestFile` payload — the wanted file's id (hash + expected mtime).
pub fn encode_file_id(id: FileId) -> [u8; 12] {
    *id.as_bytes()
}

pub fn decode_file_id(buf: &[u8]) -> Result<FileId, WireError> {
    let bytes: [u8; 12] = buf.try_into().map_err(|_| WireError::Truncated {
        need: 12,
        have: buf.len(),
    })?;
    Ok(FileId::from_bytes(bytes))
}

/// `ResendFrom` payload — transfer hash plus the highest contiguous part
/// the receiver holds.
pub fn encode_resume(hash: HashFile, part: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&hash.to_le_bytes());
    out[8..].copy_from_slice(&part.to_le_bytes());
    out
}

pub fn decode_resume(buf: &[u8]) -> Result<(HashFile, u32), WireError> {
    if buf.len() < 12 {
        return Err(WireError::Truncated {
            need: 12,
            have: buf.len(),
        });
    }
    let hash = u64::from_le_bytes(buf[..8].try_into().unwrap());
    let part = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    Ok((hash, part))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown command code: 0x{0:04x}")]
    UnknownCommand(u16),

    #[error("unknown notice code: 0x{0:02x}")]
    UnknownNotice(u8),

    #[error("unknown chunk version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("chunk name is not valid UTF-8: {0}")]
    BadName(std::str::Utf8Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
