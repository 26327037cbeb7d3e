//! The shared engine context.
//!
//! One `SyncContext` is owned by the engine instance; every subsystem
//! receives an `Arc` handle and calls back in through a narrow surface
//! (`send_command`, `raise_status`, `spool`, `pump`). No subsystem owns
//! the context and nothing points back out of it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;

use nimbus_core::config::SyncConfig;
use nimbus_core::fileid::{FileId, HashFile};
use nimbus_core::wire::{encode_file_id, Command, NoticeKind};

use crate::client::ClientRegistry;
use crate::crc::CrcTracker;
use crate::deleted::DeletedRegistry;
use crate::events::{EventBus, SyncStatus};
use crate::spooler::{Operation, OperationKind, PushOutcome, Spooler};
use crate::table::{HashFileTable, NameHasher};
use crate::transfer;
use crate::zero_knowledge::ZeroKnowledge;

/// Which end of the pair this instance is. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The opaque delegate shipping tagged byte payloads between the peers.
/// `peer_id` is `None` when the instance talks to its only counterpart
/// (the client side); the server side addresses one of its clients.
pub trait CommandTransport: Send + Sync {
    fn send(&self, peer_id: Option<u64>, command: Command, payload: &[u8]) -> bool;
}

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Sending,
    Receiving,
    Verifying,
    Done,
    Failed,
}

/// Receive-side bookkeeping for an in-flight download.
pub(crate) struct InboundTransfer {
    /// Cloud-relative destination in this endpoint's local form.
    pub path: String,
    pub total: u32,
    pub mtime: u32,
    /// The transfer's first wire chunk, retained so lost tracker state
    /// can be rebuilt from the staging file with proof that the bytes on
    /// disk belong to this transfer.
    pub first_chunk: Bytes,
}

pub struct SyncContext {
    pub config: SyncConfig,
    pub role: Role,
    pub user_id: u64,
    pub(crate) transport: Arc<dyn CommandTransport>,
    pub table: Mutex<HashFileTable>,
    pub tracker: CrcTracker,
    pub spooler: Spooler,
    pub deleted: Mutex<DeletedRegistry>,
    pub events: EventBus,
    pub codec: Option<Arc<ZeroKnowledge>>,
    pub clients: ClientRegistry,
    pub(crate) hasher: NameHasher,
    pub(crate) inbound: DashMap<HashFile, InboundTransfer>,
    pub(crate) transfers: DashMap<HashFile, TransferState>,
    /// Resume positions requested by the receiving side.
    pub(crate) resume_hints: DashMap<HashFile, u32>,
    /// Downloads this endpoint asked for; each occupies a spooler slot
    /// until its final chunk lands.
    pub(crate) active_requests: DashMap<HashFile, ()>,
    /// Operations parked after a transient I/O failure, retried on a
    /// short interval.
    pub(crate) pending_retry: std::sync::Mutex<Vec<Operation>>,
}

impl SyncContext {
    pub fn cloud_root(&self) -> &Path {
        &self.config.storage.cloud_root
    }

    /// The peer component of CRC-tracker keys. The client side pins it to
    /// 0 so its keys can never collide with server-side ones.
    pub(crate) fn peer_component(&self, peer: Option<u64>) -> u64 {
        match self.role {
            Role::Client => 0,
            Role::Server => peer.unwrap_or(0),
        }
    }

    pub fn name_hash_for(&self, path: &str, is_directory: bool) -> HashFile {
        (self.hasher)(path, is_directory)
    }

    /// The form of a path that crosses the wire: obfuscated under
    /// zero-knowledge, verbatim otherwise.
    pub fn wire_name(&self, path: &str) -> String {
        match &self.codec {
            Some(zk) => zk.encrypt_full_file_name(path),
            None => path.to_owned(),
        }
    }

    /// Map an incoming wire path to this endpoint's local form. Without a
    /// key the obfuscated form IS the local form.
    pub fn local_name(&self, wire_name: &str) -> String {
        match &self.codec {
            Some(zk) => zk
                .decrypt_full_file_name(wire_name)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "wire name not deobfuscatable, keeping as-is");
                    wire_name.to_owned()
                }),
            None => wire_name.to_owned(),
        }
    }

    pub(crate) fn chunk_size_for(&self, peer: Option<u64>) -> usize {
        self.clients
            .chunk_size_for(peer, self.config.transfer.chunk_size) as usize
    }

    /// Absolute staging path of a destination.
    pub(crate) fn temp_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_owned();
        name.push(crate::entry::TMP_SUFFIX);
        PathBuf::from(name)
    }

    pub fn send_command(&self, peer: Option<u64>, command: Command, payload: &[u8]) -> bool {
        let delivered = self.transport.send(peer, command, payload);
        if !delivered {
            tracing::debug!(?command, "transport refused command");
        }
        delivered
    }

    pub fn raise_status(&self, status: SyncStatus) {
        self.events.raise_status(status);
    }

    // ── Operation flow ───────────────────────────────────────────────────────

    /// Enqueue operations and pump the dispatch pipeline. Returns how many
    /// were accepted.
    pub async fn spool(self: &Arc<Self>, ops: Vec<Operation>, peer: Option<u64>) -> usize {
        let mut accepted = 0;
        for op in ops {
            match self.spooler.push(op) {
                PushOutcome::Queued | PushOutcome::Replaced => {
                    accepted += 1;
                    self.raise_status(SyncStatus::Pending);
                }
                PushOutcome::DroppedOverLimit => {}
            }
        }
        self.pump(peer).await;
        accepted
    }

    /// Dispatch ready operations up to the concurrency ceiling. Called on
    /// every enqueue and from every completion callback.
    pub async fn pump(self: &Arc<Self>, peer: Option<u64>) {
        while let Some(op) = self.spooler.next_ready() {
            self.dispatch(op, peer).await;
        }
        if self.spooler.pending() == 0 {
            self.raise_status(SyncStatus::Monitoring);
            if peer.is_some() {
                self.send_command(peer, Command::Notice, &[NoticeKind::Ready.into()]);
            }
        }
    }

    /// One dispatched operation finished, successfully or not.
    pub async fn operation_finished(self: &Arc<Self>, peer: Option<u64>) {
        self.spooler.complete_one();
        self.pump(peer).await;
    }

    async fn dispatch(self: &Arc<Self>, op: Operation, peer: Option<u64>) {
        tracing::debug!(
            kind = ?op.kind,
            hash = hex::encode(op.name_hash.to_le_bytes()),
            "dispatching operation"
        );
        match op.kind {
            OperationKind::SendFile => {
                let from_part = self
                    .resume_hints
                    .remove(&op.name_hash)
                    .map(|(_, part)| part)
                    .unwrap_or(0);
                transfer::spawn_send(self.clone(), peer, op.name_hash, from_part);
            }
            OperationKind::RequestFile => {
                let payload = encode_file_id(FileId::new(op.name_hash, op.timestamp));
                self.active_requests.insert(op.name_hash, ());
                self.transfers
                    .insert(op.name_hash, TransferState::Receiving);
                if !self.send_command(peer, Command::RequestFile, &payload) {
                    self.active_requests.remove(&op.name_hash);
                    self.transfers.insert(op.name_hash, TransferState::Failed);
                    self.operation_finished_boxed(peer).await;
                }
                // Otherwise the slot stays occupied until the download
                // completes.
            }
            OperationKind::DeleteFile => {
                let payload = encode_file_id(FileId::new(op.name_hash, op.timestamp));
                self.send_command(peer, Command::DeleteFile, &payload);
                self.operation_finished_boxed(peer).await;
            }
            OperationKind::DeleteDirectory => {
                let payload = encode_file_id(FileId::for_directory(op.name_hash));
                self.send_command(peer, Command::DeleteDirectory, &payload);
                self.operation_finished_boxed(peer).await;
            }
        }
    }

    /// `dispatch` and `operation_finished` are mutually recursive through
    /// `pump`; boxing breaks the infinitely sized future.
    fn operation_finished_boxed<'a>(
        self: &'a Arc<Self>,
        peer: Option<u64>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.operation_finished(peer))
    }

    /// Park an operation for the retry worker after a transient failure.
    pub(crate) fn park_for_retry(&self, op: Operation) {
        self.pending_retry.lock().unwrap().push(op);
    }

    /// Drain and re-spool parked operations.
    pub(crate) async fn retry_parked(self: &Arc<Self>, peer: Option<u64>) {
        let parked: Vec<Operation> = std::mem::take(&mut *self.pending_retry.lock().unwrap());
        if parked.is_empty() {
            return;
        }
        tracing::debug!(count = parked.len(), "retrying parked operations");
        self.spool(parked, peer).await;
    }
}
