//! The transfer driver — chunked send/receive with progressive CRC,
//! staging files, and resume.
//!
//! Send side: read chunk k of N, fold it into the running CRC, emit a
//! `SendFileChunk`. Receive side: validate sequence through the CRC
//! tracker, append to `<destination>.tmp`, and on the final chunk compare
//! the tracked CRC against the sender's before atomically renaming into
//! place. A sequence problem answers `ResendFrom`; a CRC mismatch at the
//! end throws the temp file away and re-requests the whole file.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use filetime::FileTime;

use nimbus_core::fileid::HashFile;
use nimbus_core::hash::{ulong_hash, START_CRC};
use nimbus_core::wire::{
    decode_chunk, encode_chunk, encode_resume, ChunkHeader, Command, CHUNK_FLAG_DIRECTORY,
    CHUNK_FLAG_OBFUSCATED, CHUNK_VERSION,
};

use crate::context::{InboundTransfer, SyncContext, TransferState};
use crate::entry::FileSystemEntry;
use crate::events::{FileError, TransferProgress};
use crate::spooler::{Operation, OperationKind};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no table entry for the requested hash")]
    UnknownEntry,

    #[error("transport refused the chunk")]
    TransportClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an I/O failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoClass {
    /// The platform antivirus blocked the file: skip it, tell the host,
    /// never retry.
    Antivirus,
    /// Locked or not yet closed: park and retry shortly.
    Transient,
    Fatal,
}

/// ERROR_VIRUS_INFECTED surfaces as raw OS error 225 on Windows.
const VIRUS_INFECTED_OS_ERROR: i32 = 225;

pub(crate) fn classify_io_error(err: &std::io::Error) -> IoClass {
    if err.raw_os_error() == Some(VIRUS_INFECTED_OS_ERROR) {
        return IoClass::Antivirus;
    }
    match err.kind() {
        std::io::ErrorKind::WouldBlock
        | std::io::ErrorKind::Interrupted
        | std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::PermissionDenied => IoClass::Transient,
        _ => IoClass::Fatal,
    }
}

// ── Send side ─────────────────────────────────────────────────────────────────

/// Dispatch one upload on its own task. The spooler slot is released when
/// the task finishes, whatever the outcome.
pub(crate) fn spawn_send(
    ctx: Arc<SyncContext>,
    peer: Option<u64>,
    hash: HashFile,
    from_part: u32,
) {
    tokio::spawn(async move {
        let outcome =
            tokio::task::spawn_blocking({
                let ctx = ctx.clone();
                move || send_file(&ctx, peer, hash, from_part)
            })
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                ctx.transfers.insert(hash, TransferState::Failed);
                tracing::warn!(
                    hash = hex::encode(hash.to_le_bytes()),
                    error = %err,
                    "upload failed"
                );
            }
            Err(join_err) => {
                ctx.transfers.insert(hash, TransferState::Failed);
                tracing::error!(error = %join_err, "upload task panicked");
            }
        }
        ctx.operation_finished(peer).await;
    });
}

/// Read, hash, and ship one file chunk by chunk. With `from_part > 0` the
/// first `from_part` chunks are rehashed to seed the CRC but not resent.
fn send_file(
    ctx: &Arc<SyncContext>,
    peer: Option<u64>,
    hash: HashFile,
    from_part: u32,
) -> Result<(), TransferError> {
    let entry = {
        let table = ctx.table.blocking_lock();
        table
            .try_get(hash)
            .cloned()
            .ok_or(TransferError::UnknownEntry)?
    };
    let (rel, size, mtime) = match entry {
        FileSystemEntry::File { path, size, mtime } => (path, size, mtime),
        FileSystemEntry::Directory { path } => return send_directory(ctx, peer, hash, &path),
    };
    let absolute = ctx.cloud_root().join(&rel);
    let chunk_size = ctx.chunk_size_for(peer);
    let total = (size.div_ceil(chunk_size as u64)).max(1) as u32;
    let wire_name = ctx.wire_name(&rel);

    ctx.transfers.insert(hash, TransferState::Sending);

    let mut file = match std::fs::File::open(&absolute) {
        Ok(file) => file,
        Err(err) => {
            match classify_io_error(&err) {
                IoClass::Antivirus => {
                    ctx.events.raise_antivirus(rel.clone());
                }
                IoClass::Transient => {
                    ctx.park_for_retry(Operation::new(OperationKind::SendFile, hash, mtime));
                }
                IoClass::Fatal => {
                    ctx.events.raise_error(FileError {
                        path: Some(rel.clone()),
                        fatal: false,
                        message: format!("cannot open for upload: {err}"),
                    });
                }
            }
            return Err(TransferError::Io(err));
        }
    };

    let mut cipher = ctx.codec.as_ref().map(|zk| zk.content_cipher(&rel, mtime));
    let flags = if cipher.is_some() {
        CHUNK_FLAG_OBFUSCATED
    } else {
        0
    };

    let mut crc = START_CRC;
    let mut remaining = size;
    for part in 1..=total {
        let want = remaining.min(chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)?;
        remaining -= want as u64;

        if let Some(cipher) = cipher.as_mut() {
            cipher.apply(&mut buf);
        }
        let chunk = Bytes::from(buf);
        crc = ulong_hash(crc, &chunk);

        if part <= from_part {
            // Already on the receiver's disk; only the CRC needed it.
            continue;
        }

        let name = (part == 1).then_some(wire_name.as_str());
        let header = ChunkHeader {
            name_hash: hash,
            part,
            total,
            mtime,
            final_crc: if part == total { crc } else { 0 },
            name_len: name.map(|n| n.len() as u16).unwrap_or(0),
            flags,
            version: CHUNK_VERSION,
        };
        let payload = encode_chunk(&header, name, &chunk);
        if !ctx.send_command(peer, Command::SendFileChunk, &payload) {
            return Err(TransferError::TransportClosed);
        }
        ctx.events.raise_progress(TransferProgress {
            upload: true,
            name_hash: hash,
            part,
            total,
            name: Some(rel.clone()),
            length: Some(size),
            completed: part == total,
        });
    }

    ctx.transfers.insert(hash, TransferState::Done);
    tracing::info!(
        file = %rel,
        parts = total,
        bytes = size,
        "upload complete"
    );
    Ok(())
}

/// A directory crosses the wire as a single dataless chunk.
fn send_directory(
    ctx: &Arc<SyncContext>,
    peer: Option<u64>,
    hash: HashFile,
    rel: &str,
) -> Result<(), TransferError> {
    let wire_name = ctx.wire_name(rel);
    let mut flags = CHUNK_FLAG_DIRECTORY;
    if ctx.codec.is_some() {
        flags |= CHUNK_FLAG_OBFUSCATED;
    }
    let header = ChunkHeader {
        name_hash: hash,
        part: 1,
        total: 1,
        mtime: 0,
        final_crc: 0,
        name_len: wire_name.len() as u16,
        flags,
        version: CHUNK_VERSION,
    };
    let payload = encode_chunk(&header, Some(&wire_name), &[]);
    if !ctx.send_command(peer, Command::SendFileChunk, &payload) {
        return Err(TransferError::TransportClosed);
    }
    ctx.transfers.insert(hash, TransferState::Done);
    tracing::debug!(directory = %rel, "directory announced");
    Ok(())
}

// ── Receive side ──────────────────────────────────────────────────────────────

/// Handle one inbound `SendFileChunk` payload.
pub(crate) async fn handle_chunk(ctx: &Arc<SyncContext>, peer: Option<u64>, payload: &[u8]) {
    let (header, wire_name, data) = match decode_chunk(payload) {
        Ok(parts) => parts,
        Err(err) => {
            tracing::warn!(error = %err, "undecodable chunk dropped");
            return;
        }
    };
    let hash = header.name_hash;
    let part = header.part;
    let total = header.total;
    let mtime = header.mtime;
    let final_crc = header.final_crc;
    let data = Bytes::copy_from_slice(data);

    // Resolve the destination. Part 1 names it; later parts rely on the
    // in-flight record.
    let (rel, first_chunk) = if part == 1 {
        let Some(wire_name) = wire_name else {
            tracing::warn!("first chunk without a name, requesting restart");
            ctx.send_command(peer, Command::ResendFrom, &encode_resume(hash, 0));
            return;
        };
        let local = ctx.local_name(&wire_name);
        ctx.inbound.insert(
            hash,
            InboundTransfer {
                path: local.clone(),
                total,
                mtime,
                first_chunk: data.clone(),
            },
        );
        (local, data.clone())
    } else {
        match ctx.inbound.get(&hash) {
            Some(inflight) => (inflight.path.clone(), inflight.first_chunk.clone()),
            None => {
                // State lost across a restart: make the sender start over
                // so part 1 re-carries the name.
                ctx.send_command(peer, Command::ResendFrom, &encode_resume(hash, 0));
                return;
            }
        }
    };

    let destination = ctx.cloud_root().join(&rel);

    if header.flags & CHUNK_FLAG_DIRECTORY != 0 {
        ctx.inbound.remove(&hash);
        if let Err(err) = std::fs::create_dir_all(&destination) {
            ctx.events.raise_error(FileError {
                path: Some(rel.clone()),
                fatal: false,
                message: format!("cannot create directory: {err}"),
            });
            return;
        }
        {
            let mut table = ctx.table.lock().await;
            add_directory_with_ancestors(&mut table, &rel);
        }
        ctx.transfers.insert(hash, TransferState::Done);
        ctx.events.raise_progress(TransferProgress {
            upload: false,
            name_hash: hash,
            part: 1,
            total: 1,
            name: Some(rel.clone()),
            length: Some(0),
            completed: true,
        });
        if ctx.active_requests.remove(&hash).is_some() {
            ctx.operation_finished(peer).await;
        }
        return;
    }

    let temp = SyncContext::temp_path(&destination);
    if let Some(parent) = destination.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            ctx.events.raise_error(FileError {
                path: Some(rel.clone()),
                fatal: false,
                message: format!("cannot create destination directory: {err}"),
            });
            return;
        }
    }
    ctx.transfers.insert(hash, TransferState::Receiving);

    let peer_key = ctx.peer_component(peer);
    let advance = ctx.tracker.update(
        peer_key,
        hash,
        part,
        &data,
        &temp,
        part == 1,
        Some(first_chunk.as_ref()),
    );

    let advance = match advance {
        Ok(advance) => advance,
        Err(err) => {
            tracing::warn!(
                file = %rel,
                part,
                error = %err,
                recoverable = err.is_recoverable(),
                "chunk rejected, requesting restart"
            );
            let _ = std::fs::remove_file(&temp);
            ctx.tracker.remove(peer_key, hash);
            ctx.send_command(peer, Command::ResendFrom, &encode_resume(hash, 0));
            return;
        }
    };

    if advance.restored {
        // Chunks 1..=advance.part are already on disk; tell the sender
        // where to pick up.
        tracing::info!(
            file = %rel,
            resumed_at = advance.part,
            "partial download restored from disk"
        );
        ctx.send_command(
            peer,
            Command::ResendFrom,
            &encode_resume(hash, advance.part),
        );
        return;
    }

    if let Err(err) = append_chunk(&temp, part, &data, ctx.chunk_size_for(peer)) {
        ctx.events.raise_error(FileError {
            path: Some(rel.clone()),
            fatal: false,
            message: format!("cannot stage chunk: {err}"),
        });
        let _ = std::fs::remove_file(&temp);
        ctx.tracker.remove(peer_key, hash);
        ctx.send_command(peer, Command::ResendFrom, &encode_resume(hash, 0));
        return;
    }

    ctx.events.raise_progress(TransferProgress {
        upload: false,
        name_hash: hash,
        part,
        total,
        name: Some(rel.clone()),
        length: None,
        completed: false,
    });

    if part == total {
        finish_receive(ctx, peer, hash, &rel, mtime, final_crc).await;
    }
}

/// Append one chunk at its expected offset. Re-deliveries of a chunk the
/// file already holds are ignored.
fn append_chunk(temp: &Path, part: u32, data: &[u8], chunk_size: usize) -> std::io::Result<()> {
    let expected_offset = (part as u64 - 1) * chunk_size as u64;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(temp)?;
    let len = file.metadata()?.len();
    if len > expected_offset {
        // Duplicate delivery; the bytes are already in place.
        return Ok(());
    }
    file.seek(SeekFrom::Start(expected_offset))?;
    file.write_all(data)?;
    file.sync_all()
}

/// Final-chunk bookkeeping: verify, rename into place, stamp the mtime,
/// and update the table.
async fn finish_receive(
    ctx: &Arc<SyncContext>,
    peer: Option<u64>,
    hash: HashFile,
    rel: &str,
    mtime: u32,
    final_crc: u64,
) {
    let peer_key = ctx.peer_component(peer);
    let destination = ctx.cloud_root().join(rel);
    let temp = SyncContext::temp_path(&destination);
    ctx.transfers.insert(hash, TransferState::Verifying);

    let tracked = {
        let inflight = ctx.inbound.get(&hash);
        let total = inflight.map(|t| t.total).unwrap_or(0);
        ctx.tracker.crc(peer_key, hash, total)
    };

    if tracked != final_crc {
        tracing::warn!(
            file = %rel,
            expected = hex::encode(final_crc.to_le_bytes()),
            got = hex::encode(tracked.to_le_bytes()),
            "final CRC mismatch, re-requesting file"
        );
        let _ = std::fs::remove_file(&temp);
        ctx.tracker.remove(peer_key, hash);
        ctx.inbound.remove(&hash);
        ctx.transfers.insert(hash, TransferState::Failed);
        ctx.events.raise_error(FileError {
            path: Some(rel.to_owned()),
            fatal: false,
            message: "transfer checksum mismatch".into(),
        });
        if ctx.active_requests.remove(&hash).is_some() {
            ctx.operation_finished(peer).await;
        }
        ctx.spool(
            vec![Operation::new(OperationKind::RequestFile, hash, mtime)],
            peer,
        )
        .await;
        return;
    }

    // The staging file holds wire bytes so resume rehashing matches the
    // sender's CRC; under zero-knowledge the plaintext only appears here,
    // at finalization.
    let finalized = (|| -> std::io::Result<u64> {
        if let Some(zk) = &ctx.codec {
            let mut data = std::fs::read(&temp)?;
            zk.content_cipher(rel, mtime).apply(&mut data);
            std::fs::write(&temp, &data)?;
        }
        let size = std::fs::metadata(&temp)?.len();
        std::fs::rename(&temp, &destination)?;
        filetime::set_file_mtime(&destination, FileTime::from_unix_time(i64::from(mtime), 0))?;
        Ok(size)
    })();

    match finalized {
        Ok(size) => {
            {
                let mut table = ctx.table.lock().await;
                add_with_ancestors(&mut table, rel, size, mtime);
            }
            ctx.tracker.remove(peer_key, hash);
            let total = ctx.inbound.remove(&hash).map(|(_, t)| t.total).unwrap_or(0);
            ctx.transfers.insert(hash, TransferState::Done);
            ctx.events.raise_progress(TransferProgress {
                upload: false,
                name_hash: hash,
                part: total,
                total,
                name: Some(rel.to_owned()),
                length: Some(size),
                completed: true,
            });
            tracing::info!(file = %rel, bytes = size, "download complete");
            if ctx.active_requests.remove(&hash).is_some() {
                ctx.operation_finished(peer).await;
            }
        }
        Err(err) => {
            ctx.events.raise_error(FileError {
                path: Some(rel.to_owned()),
                fatal: false,
                message: format!("cannot finalize download: {err}"),
            });
            let _ = std::fs::remove_file(&temp);
            ctx.tracker.remove(peer_key, hash);
            ctx.inbound.remove(&hash);
            ctx.transfers.insert(hash, TransferState::Failed);
            if ctx.active_requests.remove(&hash).is_some() {
                ctx.operation_finished(peer).await;
            }
        }
    }
}

fn add_directory_with_ancestors(table: &mut crate::table::HashFileTable, rel: &str) {
    let mut prefix = String::new();
    for component in rel.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);
        table.add(FileSystemEntry::Directory {
            path: prefix.clone(),
        });
    }
}

/// Register a received file and the directories above it.
fn add_with_ancestors(
    table: &mut crate::table::HashFileTable,
    rel: &str,
    size: u64,
    mtime: u32,
) {
    let components: Vec<&str> = rel.split('/').collect();
    let mut prefix = String::new();
    for component in &components[..components.len() - 1] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);
        table.add(FileSystemEntry::Directory {
            path: prefix.clone(),
        });
    }
    table.add(FileSystemEntry::File {
        path: rel.to_owned(),
        size,
        mtime,
    });
}

/// The receiver told us where to pick a transfer back up.
pub(crate) async fn handle_resend_from(
    ctx: &Arc<SyncContext>,
    peer: Option<u64>,
    hash: HashFile,
    part: u32,
) {
    let timestamp = {
        let table = ctx.table.lock().await;
        match table.try_get(hash) {
            Some(entry) => entry.unix_timestamp(),
            None => {
                tracing::debug!(
                    hash = hex::encode(hash.to_le_bytes()),
                    "resume requested for unknown entry"
                );
                return;
            }
        }
    };
    ctx.resume_hints.insert(hash, part);
    ctx.spool(
        vec![Operation::new(OperationKind::SendFile, hash, timestamp)],
        peer,
    )
    .await;
}
