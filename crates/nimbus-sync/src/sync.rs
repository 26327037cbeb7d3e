//! The engine instance — one per endpoint, role fixed at construction.
//!
//! The client side runs the periodic synchronization tick: refresh the
//! local table, ask the remote for its table, reconcile, spool. The
//! server side answers table requests and executes what the client
//! decides. Both sides receive chunks, deletes, and notices through
//! `on_command`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use nimbus_core::config::SyncConfig;
use nimbus_core::fileid::FileId;
use nimbus_core::hash::hash_file_name;
use nimbus_core::wire::{
    decode_file_id, decode_key_timestamps, decode_resume, encode_key_timestamps, Command,
    NoticeKind,
};

use crate::client::{derive_user_id, ClientRegistry, ClientStatus, LoginLimiter, Pin, SecureStorage};
use crate::context::{CommandTransport, Role, SyncContext};
use crate::crc::CrcTracker;
use crate::deleted::DeletedRegistry;
use crate::entry::{can_be_seen, can_be_stored, CACHE_DIR};
use crate::events::{EventBus, FileError, SyncStatus};
use crate::reconciler::reconcile;
use crate::spooler::{Operation, OperationKind, Spooler};
use crate::table::{cache_file_path, HashFileTable, NameHasher, TableError};
use crate::transfer;
use crate::zero_knowledge::ZeroKnowledge;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cloud root {0} does not exist")]
    CloudRootMissing(PathBuf),

    #[error("zero-knowledge is enabled but no master key was supplied")]
    MissingMasterKey,

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    pin: Pin,
    limiter: tokio::sync::Mutex<LoginLimiter>,
    shutdown_tx: broadcast::Sender<()>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Construct an endpoint over the given cloud root.
    ///
    /// A missing cloud root is fatal: the instance refuses to operate
    /// rather than sync against a tree that is not there.
    pub fn new(
        config: SyncConfig,
        role: Role,
        transport: Arc<dyn CommandTransport>,
        storage: &dyn SecureStorage,
        master_key: Option<&[u8]>,
    ) -> Result<Arc<Self>, SyncError> {
        let root = config.storage.cloud_root.clone();
        if !root.is_dir() {
            return Err(SyncError::CloudRootMissing(root));
        }
        std::fs::create_dir_all(root.join(CACHE_DIR))?;

        let codec: Option<Arc<ZeroKnowledge>> = if config.privacy.zero_knowledge {
            let key = master_key.ok_or(SyncError::MissingMasterKey)?;
            Some(Arc::new(ZeroKnowledge::new(key)))
        } else {
            None
        };

        // Wire fingerprints are computed over the obfuscated form when a
        // key is present, so both observers of a logical path agree.
        let hasher: NameHasher = match codec.clone() {
            Some(zk) => Arc::new(move |path: &str, is_directory: bool| {
                hash_file_name(&zk.encrypt_full_file_name(path), is_directory)
            }),
            None => Arc::new(hash_file_name),
        };

        let pin = Pin::load_or_generate(storage);
        let user_id = derive_user_id(&pin.proof());

        // The serving side stores obfuscated names as its normal content;
        // the client side treats them as in-flight artifacts.
        let visible = match role {
            Role::Client => can_be_seen,
            Role::Server => can_be_stored,
        };

        let mut table = HashFileTable::new(hasher.clone());
        let cache = cache_file_path(&root);
        match table.load(&cache) {
            Ok(()) => {}
            Err(err) => {
                if cache.exists() {
                    tracing::warn!(error = %err, "table cache unusable, rescanning");
                }
                table.scan(&root, visible)?;
            }
        }

        let deleted = DeletedRegistry::open(&root.join(CACHE_DIR), user_id);

        let ctx = Arc::new(SyncContext {
            role,
            user_id,
            transport,
            table: tokio::sync::Mutex::new(table),
            tracker: CrcTracker::new(config.transfer.chunk_size as usize),
            spooler: Spooler::new(config.transfer.max_concurrent_operations),
            deleted: tokio::sync::Mutex::new(deleted),
            events: EventBus::new(),
            codec,
            clients: ClientRegistry::new(),
            hasher,
            inbound: dashmap::DashMap::new(),
            transfers: dashmap::DashMap::new(),
            resume_hints: dashmap::DashMap::new(),
            active_requests: dashmap::DashMap::new(),
            pending_retry: std::sync::Mutex::new(Vec::new()),
            config,
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        tracing::info!(?role, user_id, root = %ctx.cloud_root().display(), "engine constructed");
        Ok(Arc::new(Self {
            ctx,
            pin,
            limiter: tokio::sync::Mutex::new(LoginLimiter::new()),
            shutdown_tx,
            workers: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn pin(&self) -> &str {
        self.pin.as_str()
    }

    /// Spawn the background workers: the client-side synchronization tick
    /// and the transient-failure retry loop.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();

        if self.ctx.role == Role::Client {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                let period = Duration::from_secs(this.ctx.config.transfer.sync_interval_secs);
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = interval.tick() => {
                            if let Err(err) = this.synchronize().await {
                                tracing::warn!(error = %err, "synchronization tick failed");
                            }
                        }
                    }
                }
            }));
        }

        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        workers.push(tokio::spawn(async move {
            let period = Duration::from_secs(ctx.config.transfer.retry_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => ctx.retry_parked(None).await,
                }
            }
        }));
    }

    /// One client-side synchronization pass: bring the table in line with
    /// the disk, persist it, and ask the remote peer for its table. The
    /// reconcile runs when the reply arrives.
    pub async fn synchronize(&self) -> Result<(), SyncError> {
        if self.ctx.role != Role::Client {
            return Ok(());
        }
        let root = self.ctx.cloud_root().to_path_buf();
        {
            let mut table = self.ctx.table.lock().await;
            table.refresh(&root, can_be_seen)?;
            table.save(&cache_file_path(&root))?;
        }
        self.ctx.send_command(None, Command::HashTable, &[]);
        Ok(())
    }

    /// Rebuild the serving side's table from disk. The client never calls
    /// this; its tick covers it.
    pub async fn rescan(&self) -> Result<(), SyncError> {
        let root = self.ctx.cloud_root().to_path_buf();
        let visible = match self.ctx.role {
            Role::Client => can_be_seen,
            Role::Server => can_be_stored,
        };
        let mut table = self.ctx.table.lock().await;
        table.refresh(&root, visible)?;
        table.save(&cache_file_path(&root))?;
        Ok(())
    }

    // ── Watcher surface ──────────────────────────────────────────────────────

    /// The filesystem watcher saw a create or change. Rebuilds the entry
    /// from the disk.
    pub async fn notify_changed(&self, rel: &str) -> Result<(), SyncError> {
        let absolute = self.ctx.cloud_root().join(rel);
        let meta = std::fs::metadata(&absolute)?;
        let entry = if meta.is_dir() {
            crate::entry::FileSystemEntry::Directory {
                path: rel.to_owned(),
            }
        } else {
            crate::entry::FileSystemEntry::File {
                path: rel.to_owned(),
                size: meta.len(),
                mtime: crate::table::file_unix_mtime(&absolute)?,
            }
        };
        let mut table = self.ctx.table.lock().await;
        table.add(entry);
        Ok(())
    }

    /// The filesystem watcher saw a deletion. Drops the entry (cascading
    /// for directories) and records every removed id so the next
    /// reconcile forwards the deletion instead of resurrecting the data.
    pub async fn notify_deleted(&self, rel: &str) {
        let removed = {
            let mut table = self.ctx.table.lock().await;
            let target = table
                .get_by_file_name(rel)
                .map(|(entry, hash, _)| {
                    (entry.path().to_owned(), entry.file_id(hash), entry.is_directory())
                });
            match target {
                Some((path, _, true)) => table.remove_directory(&path),
                Some((path, id, false)) => {
                    table.remove(id.hash());
                    vec![(path, id)]
                }
                None => Vec::new(),
            }
        };
        if removed.is_empty() {
            return;
        }
        let mut deleted = self.ctx.deleted.lock().await;
        for (path, id) in removed {
            deleted.record_local(id.hash(), path);
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    /// Entry point for every packet the host transport delivers.
    pub async fn on_command(self: &Arc<Self>, peer: Option<u64>, command: u16, payload: &[u8]) {
        let command = match Command::try_from(command) {
            Ok(command) => command,
            Err(err) => {
                tracing::debug!(error = %err, "dropping unknown command");
                return;
            }
        };
        if let Some(peer) = peer {
            self.ctx.clients.touch(peer);
        }

        match command {
            Command::LoginRequest => self.handle_login_request(peer, payload).await,
            Command::LoginReply => {
                let accepted = payload.first().copied().unwrap_or(0) == 1;
                tracing::info!(accepted, "login reply");
                if !accepted {
                    self.ctx.raise_status(SyncStatus::LoggedOut);
                }
            }
            Command::HashTable => {
                if payload.is_empty() {
                    self.send_table(peer).await;
                } else {
                    self.reconcile_against(peer, payload).await;
                }
            }
            Command::RequestFile => {
                let Ok(id) = decode_file_id(payload) else {
                    tracing::debug!("malformed file request dropped");
                    return;
                };
                let timestamp = {
                    let table = self.ctx.table.lock().await;
                    table
                        .try_get(id.hash())
                        .map(|entry| entry.unix_timestamp())
                        .unwrap_or_else(|| id.unix_timestamp())
                };
                self.ctx
                    .spool(
                        vec![Operation::new(OperationKind::SendFile, id.hash(), timestamp)],
                        peer,
                    )
                    .await;
            }
            Command::SendFileChunk => transfer::handle_chunk(&self.ctx, peer, payload).await,
            Command::ResendFrom => {
                let Ok((hash, part)) = decode_resume(payload) else {
                    return;
                };
                transfer::handle_resend_from(&self.ctx, peer, hash, part).await;
            }
            Command::DeleteFile => {
                let Ok(id) = decode_file_id(payload) else {
                    return;
                };
                self.apply_remote_delete(id, false).await;
            }
            Command::DeleteDirectory => {
                let Ok(id) = decode_file_id(payload) else {
                    return;
                };
                self.apply_remote_delete(id, true).await;
            }
            Command::StatusNotification => {
                tracing::debug!(status = ?payload.first(), "peer status notification");
            }
            Command::Notice => self.handle_notice(peer, payload).await,
        }
    }

    async fn handle_login_request(self: &Arc<Self>, peer: Option<u64>, payload: &[u8]) {
        let mut limiter = self.limiter.lock().await;
        let now = Instant::now();
        if !limiter.allow_attempt(now) {
            self.ctx.send_command(
                peer,
                Command::Notice,
                &[NoticeKind::AuthenticationRequired.into()],
            );
            return;
        }
        let proof: Option<[u8; 32]> = payload.try_into().ok();
        let accepted = proof
            .map(|proof| self.pin.verify_proof(&proof))
            .unwrap_or(false);
        if accepted {
            limiter.record_success();
        } else {
            limiter.record_failure(now);
        }
        self.ctx
            .send_command(peer, Command::LoginReply, &[u8::from(accepted)]);
    }

    async fn send_table(&self, peer: Option<u64>) {
        let pairs = {
            let table = self.ctx.table.lock().await;
            table.key_timestamps()
        };
        self.ctx
            .send_command(peer, Command::HashTable, &encode_key_timestamps(&pairs));
    }

    async fn reconcile_against(self: &Arc<Self>, peer: Option<u64>, payload: &[u8]) {
        let remote = match decode_key_timestamps(payload) {
            Ok(pairs) => pairs,
            Err(err) => {
                tracing::warn!(error = %err, "malformed remote table dropped");
                return;
            }
        };
        let ops = {
            let table = self.ctx.table.lock().await;
            let mut deleted = self.ctx.deleted.lock().await;
            reconcile(&remote, &table, &mut deleted)
        };
        if ops.is_empty() {
            self.ctx.raise_status(SyncStatus::Synchronized);
            self.ctx
                .send_command(peer, Command::Notice, &[NoticeKind::Synchronized.into()]);
            return;
        }
        self.ctx.spool(ops, peer).await;
    }

    /// Execute a delete the remote decided on, and remember the id so the
    /// next reconcile does not resurrect the entry.
    async fn apply_remote_delete(&self, id: FileId, directory: bool) {
        let removed = {
            let mut table = self.ctx.table.lock().await;
            let target = table
                .try_get(id.hash())
                .map(|entry| (entry.path().to_owned(), entry.is_directory()));
            match target {
                Some((path, is_dir)) if directory || is_dir => table.remove_directory(&path),
                Some((path, _)) => {
                    table.remove(id.hash());
                    vec![(path, id)]
                }
                None => Vec::new(),
            }
        };
        if removed.is_empty() {
            return;
        }

        let root = self.ctx.cloud_root();
        // The deepest paths go first so files vanish before their parents.
        let mut paths: Vec<&String> = removed.iter().map(|(path, _)| path).collect();
        paths.sort_by_key(|path| std::cmp::Reverse(path.len()));
        for path in paths {
            let absolute = root.join(path);
            let result = if absolute.is_dir() {
                std::fs::remove_dir_all(&absolute)
            } else {
                std::fs::remove_file(&absolute)
            };
            if let Err(err) = result {
                if err.kind() != std::io::ErrorKind::NotFound {
                    self.ctx.events.raise_error(FileError {
                        path: Some(path.clone()),
                        fatal: false,
                        message: format!("cannot apply remote delete: {err}"),
                    });
                }
            }
        }

        let ids: Vec<FileId> = removed.iter().map(|(_, id)| *id).collect();
        let mut deleted = self.ctx.deleted.lock().await;
        deleted.add_remote_requested(&ids);
        tracing::info!(entries = ids.len(), "remote delete applied");
    }

    async fn handle_notice(self: &Arc<Self>, peer: Option<u64>, payload: &[u8]) {
        let Some(&code) = payload.first() else {
            return;
        };
        let notice = match NoticeKind::try_from(code) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::debug!(error = %err, "unknown notice dropped");
                return;
            }
        };
        match notice {
            NoticeKind::RemoteDriveOverLimit => {
                let purged = self.ctx.spooler.set_over_limit(true);
                tracing::warn!(purged, "remote drive over limit");
                self.ctx.raise_status(SyncStatus::RemoteDriveOverLimit);
            }
            NoticeKind::Ready => self.ctx.pump(peer).await,
            NoticeKind::LoggedOut => {
                if let Some(peer) = peer {
                    self.ctx.clients.set_status(peer, ClientStatus::LoggedOut);
                }
            }
            NoticeKind::Synchronized => self.ctx.raise_status(SyncStatus::Synchronized),
            NoticeKind::Busy | NoticeKind::AuthenticationRequired => {
                tracing::debug!(?notice, "peer notice");
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Hard cancel: notify the peer, stop workers, drop in-flight
    /// transfers and their staging files, and persist the table once.
    pub async fn shutdown(&self) {
        self.ctx
            .send_command(None, Command::Notice, &[NoticeKind::LoggedOut.into()]);
        let _ = self.shutdown_tx.send(());
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }

        let root = self.ctx.cloud_root().to_path_buf();
        for inflight in self.ctx.inbound.iter() {
            let destination = root.join(&inflight.value().path);
            let _ = std::fs::remove_file(SyncContext::temp_path(&destination));
        }
        self.ctx.inbound.clear();
        self.ctx.tracker.clear();
        self.ctx.spooler.clear();

        {
            let table = self.ctx.table.lock().await;
            if let Err(err) = table.save(&cache_file_path(&root)) {
                tracing::warn!(error = %err, "failed to persist table on shutdown");
            }
        }
        self.ctx.raise_status(SyncStatus::LoggedOut);
        tracing::info!("engine shut down");
    }
}
