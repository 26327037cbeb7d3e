//! End-to-end tests: two engines wired back to back over an in-memory
//! transport, each with its own cloud root on disk.

mod deletes;
mod files;
mod login;
mod resume;
mod status;
mod zk;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use nimbus_core::config::SyncConfig;
pub use nimbus_core::wire::Command;
pub use nimbus_sync::{CommandTransport, Role, SecureStorage, SyncEngine};

/// Peer id the server uses for its (only) client.
pub const CLIENT_ID: u64 = 1;

// ── Harness ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemStorage(Mutex<HashMap<String, Vec<u8>>>);

impl SecureStorage for MemStorage {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
    fn store(&self, key: &str, value: &[u8]) {
        self.0.lock().unwrap().insert(key.into(), value.to_vec());
    }
}

type Packet = (u16, Vec<u8>);

/// Transport half: ships commands into the counterpart's inbox and keeps
/// a log of everything sent for assertions.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Packet>,
    pub log: Mutex<Vec<Packet>>,
}

impl ChannelTransport {
    fn new(tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            tx,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self, command: Command) -> usize {
        let code = u16::from(command);
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(sent, _)| *sent == code)
            .count()
    }
}

impl CommandTransport for ChannelTransport {
    fn send(&self, _peer_id: Option<u64>, command: Command, payload: &[u8]) -> bool {
        self.log
            .lock()
            .unwrap()
            .push((command.into(), payload.to_vec()));
        self.tx.send((command.into(), payload.to_vec())).is_ok()
    }
}

pub struct Pair {
    pub client: Arc<SyncEngine>,
    pub server: Arc<SyncEngine>,
    pub client_root: tempfile::TempDir,
    pub server_root: tempfile::TempDir,
    pub client_transport: Arc<ChannelTransport>,
    pub server_transport: Arc<ChannelTransport>,
}

fn config_for(root: &Path, chunk_size: u32, zero_knowledge: bool) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.storage.cloud_root = root.to_path_buf();
    config.transfer.chunk_size = chunk_size;
    // Ticks are driven manually in tests.
    config.transfer.sync_interval_secs = 3600;
    config.privacy.zero_knowledge = zero_knowledge;
    config
}

/// Build a wired client/server pair. `master_key` enables zero-knowledge
/// on the client; the server never holds a key.
pub fn pair_with(chunk_size: u32, master_key: Option<&[u8]>) -> anyhow::Result<Pair> {
    let client_root = tempfile::tempdir()?;
    let server_root = tempfile::tempdir()?;

    let (to_server_tx, mut to_server_rx) = mpsc::unbounded_channel();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel();
    let client_transport = Arc::new(ChannelTransport::new(to_server_tx));
    let server_transport = Arc::new(ChannelTransport::new(to_client_tx));

    let client = SyncEngine::new(
        config_for(client_root.path(), chunk_size, master_key.is_some()),
        Role::Client,
        client_transport.clone(),
        &MemStorage::default(),
        master_key,
    )?;
    let server = SyncEngine::new(
        config_for(server_root.path(), chunk_size, false),
        Role::Server,
        server_transport.clone(),
        &MemStorage::default(),
        None,
    )?;

    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some((command, payload)) = to_server_rx.recv().await {
                server.on_command(Some(CLIENT_ID), command, &payload).await;
            }
        });
    }
    {
        let client = client.clone();
        tokio::spawn(async move {
            while let Some((command, payload)) = to_client_rx.recv().await {
                client.on_command(None, command, &payload).await;
            }
        });
    }

    Ok(Pair {
        client,
        server,
        client_root,
        server_root,
        client_transport,
        server_transport,
    })
}

pub fn pair(chunk_size: u32) -> anyhow::Result<Pair> {
    pair_with(chunk_size, None)
}

// ── Waiting helpers ──────────────────────────────────────────────────────────

pub async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Both tables hold the same `(hash, mtime)` set.
pub async fn converged(pair: &Pair) -> bool {
    let client: std::collections::BTreeSet<_> = pair
        .client
        .context()
        .table
        .lock()
        .await
        .key_timestamps()
        .into_iter()
        .collect();
    let server: std::collections::BTreeSet<_> = pair
        .server
        .context()
        .table
        .lock()
        .await
        .key_timestamps()
        .into_iter()
        .collect();
    client == server
}

pub async fn wait_converged(pair: &Pair) {
    for _ in 0..500 {
        if converged(pair).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for table convergence");
}
