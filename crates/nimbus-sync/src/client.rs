//! Peer records, PIN lifecycle, and login rate limiting.
//!
//! Authentication itself belongs to the host; the engine only needs a
//! per-peer identifier, the PIN proof check, and the attempt throttle.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use nimbus_core::hash::hash256;

/// Persistent key-value storage supplied by the host. Values are expected
/// to be protected at rest; the engine never writes secrets anywhere else.
pub trait SecureStorage: Send + Sync {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn store(&self, key: &str, value: &[u8]);
}

const PIN_STORAGE_KEY: &str = "pin";

/// Six-digit decimal PIN proving knowledge to a connecting peer.
#[derive(Clone)]
pub struct Pin(String);

impl Pin {
    /// Load the persisted PIN or mint one on first run. Debug builds use
    /// a fixed value so two locally built endpoints can pair without
    /// ceremony.
    pub fn load_or_generate(storage: &dyn SecureStorage) -> Self {
        if let Some(bytes) = storage.load(PIN_STORAGE_KEY) {
            if let Ok(text) = String::from_utf8(bytes) {
                if text.len() == 6 && text.bytes().all(|b| b.is_ascii_digit()) {
                    return Self(text);
                }
            }
        }
        let pin = if cfg!(debug_assertions) {
            "777777".to_owned()
        } else {
            format!("{:06}", rand::thread_rng().gen_range(0..=999_999u32))
        };
        storage.store(PIN_STORAGE_KEY, pin.as_bytes());
        Self(pin)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The proof a peer presents instead of the PIN itself.
    pub fn proof(&self) -> [u8; 32] {
        hash256(self.0.as_bytes())
    }

    pub fn verify_proof(&self, proof: &[u8; 32]) -> bool {
        &self.proof() == proof
    }
}

/// Derive the stable 64-bit user id from a public identity blob.
pub fn derive_user_id(public_identity: &[u8]) -> u64 {
    let digest = hash256(public_identity);
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

const MAX_QUICK_ATTEMPTS: usize = 3;
const ATTEMPT_WINDOW: Duration = Duration::from_secs(5);
const COOL_DOWN: Duration = Duration::from_secs(600);

/// Login attempt throttle: up to three failures inside the short window,
/// then a ten-minute cool-down.
pub struct LoginLimiter {
    failures: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl LoginLimiter {
    pub fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            cooldown_until: None,
        }
    }

    pub fn allow_attempt(&mut self, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
            self.failures.clear();
        }
        true
    }

    pub fn record_failure(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > ATTEMPT_WINDOW {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        if self.failures.len() >= MAX_QUICK_ATTEMPTS {
            self.cooldown_until = Some(now + COOL_DOWN);
            tracing::warn!("login attempts exhausted, cooling down");
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.cooldown_until = None;
    }
}

impl Default for LoginLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Client registry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Reachable,
    Offline,
    LoggedOut,
}

const ACCESS_LOG_CAP: usize = 100;

/// Everything remembered about one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: u64,
    pub aes_key: Option<Vec<u8>>,
    pub last_interaction: SystemTime,
    pub status: ClientStatus,
    pub access_log: VecDeque<SystemTime>,
    /// Per-peer transfer chunk size, when it differs from the default.
    pub chunk_size: Option<u32>,
}

impl ClientRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            aes_key: None,
            last_interaction: SystemTime::now(),
            status: ClientStatus::Reachable,
            access_log: VecDeque::new(),
            chunk_size: None,
        }
    }
}

pub struct ClientRegistry {
    clients: DashMap<u64, ClientRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Record an interaction, creating the record on first contact.
    pub fn touch(&self, id: u64) {
        let mut record = self
            .clients
            .entry(id)
            .or_insert_with(|| ClientRecord::new(id));
        let now = SystemTime::now();
        record.last_interaction = now;
        record.status = ClientStatus::Reachable;
        record.access_log.push_back(now);
        while record.access_log.len() > ACCESS_LOG_CAP {
            record.access_log.pop_front();
        }
    }

    pub fn set_status(&self, id: u64, status: ClientStatus) {
        if let Some(mut record) = self.clients.get_mut(&id) {
            record.status = status;
        }
    }

    pub fn get(&self, id: u64) -> Option<ClientRecord> {
        self.clients.get(&id).map(|r| r.clone())
    }

    pub fn chunk_size_for(&self, id: Option<u64>, default: u32) -> u32 {
        id.and_then(|id| self.clients.get(&id))
            .and_then(|r| r.chunk_size)
            .unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Persist all records through the host's secure storage.
    pub fn save(&self, storage: &dyn SecureStorage) {
        for entry in self.clients.iter() {
            if let Ok(bytes) = serde_json::to_vec(entry.value()) {
                storage.store(&format!("client.{}", entry.key()), &bytes);
            }
        }
    }

    /// Restore a record persisted by `save`.
    pub fn restore(&self, storage: &dyn SecureStorage, id: u64) {
        if let Some(bytes) = storage.load(&format!("client.{id}")) {
            if let Ok(record) = serde_json::from_slice::<ClientRecord>(&bytes) {
                self.clients.insert(id, record);
            }
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
