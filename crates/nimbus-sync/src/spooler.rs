//! The spooler — a single-peer, FIFO, deduplicated-by-hash queue of
//! pending operations with a bounded dispatch ceiling.
//!
//! The spooler is a pure queue: callers pop ready operations with
//! `next_ready` and dispatch them outside the lock; the transfer
//! completion callback calls back in via `complete_one`, which is what
//! keeps the pipeline flowing. Critical sections are short and never
//! held across I/O.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nimbus_core::fileid::HashFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    SendFile,
    RequestFile,
    DeleteFile,
    DeleteDirectory,
}

/// One pending unit of work. Two operations are duplicates iff their
/// `name_hash` matches; the later arrival replaces the earlier one
/// in place, keeping its queue position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name_hash: HashFile,
    pub timestamp: u32,
}

impl Operation {
    pub fn new(kind: OperationKind, name_hash: HashFile, timestamp: u32) -> Self {
        Self {
            kind,
            name_hash,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Replaced,
    /// The remote drive is over its limit; new sends are silently dropped.
    DroppedOverLimit,
}

struct SpoolState {
    queue: VecDeque<Operation>,
    in_flight: usize,
    executed: u64,
    started_at: Option<Instant>,
    over_limit: bool,
}

pub struct Spooler {
    state: Mutex<SpoolState>,
    max_concurrent: usize,
}

impl Spooler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(SpoolState {
                queue: VecDeque::new(),
                in_flight: 0,
                executed: 0,
                started_at: None,
                over_limit: false,
            }),
            max_concurrent,
        }
    }

    /// Enqueue an operation, replacing any pending one with the same hash.
    pub fn push(&self, op: Operation) -> PushOutcome {
        let mut state = self.state.lock().unwrap();
        if state.over_limit && op.kind == OperationKind::SendFile {
            tracing::debug!(
                hash = hex::encode(op.name_hash.to_le_bytes()),
                "send dropped, remote drive over limit"
            );
            return PushOutcome::DroppedOverLimit;
        }
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }
        if let Some(existing) = state
            .queue
            .iter_mut()
            .find(|pending| pending.name_hash == op.name_hash)
        {
            *existing = op;
            return PushOutcome::Replaced;
        }
        state.queue.push_back(op);
        PushOutcome::Queued
    }

    /// Pop the oldest pending operation if the concurrency ceiling allows
    /// another dispatch. The caller dispatches outside any lock and must
    /// pair every returned operation with a later `complete_one`.
    pub fn next_ready(&self) -> Option<Operation> {
        let mut state = self.state.lock().unwrap();
        if state.in_flight >= self.max_concurrent {
            return None;
        }
        let op = state.queue.pop_front()?;
        state.in_flight += 1;
        Some(op)
    }

    /// Mark one dispatched operation finished (successfully or not).
    pub fn complete_one(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.executed += 1;
    }

    /// Drop all pending operations.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
    }

    /// Set or clear the remote-drive-over-limit flag. Raising it purges
    /// queued sends; returns how many were purged.
    pub fn set_over_limit(&self, flag: bool) -> usize {
        let mut state = self.state.lock().unwrap();
        state.over_limit = flag;
        if !flag {
            return 0;
        }
        let before = state.queue.len();
        state
            .queue
            .retain(|op| op.kind != OperationKind::SendFile);
        before - state.queue.len()
    }

    pub fn over_limit(&self) -> bool {
        self.state.lock().unwrap().over_limit
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Nothing pending and nothing dispatched.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.queue.is_empty() && state.in_flight == 0
    }

    /// Statistical time-to-drain estimate:
    /// `elapsed / executed × pending`. Zero until something has executed.
    pub fn eta(&self) -> Duration {
        let state = self.state.lock().unwrap();
        let (Some(started_at), true) = (state.started_at, state.executed > 0) else {
            return Duration::ZERO;
        };
        if state.queue.is_empty() {
            return Duration::ZERO;
        }
        let per_op = started_at.elapsed() / state.executed as u32;
        per_op * state.queue.len() as u32
    }
}
