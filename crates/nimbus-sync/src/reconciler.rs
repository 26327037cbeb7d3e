//! The reconciler — diff the remote `(hash, mtime)` table against the
//! local one and decide the minimal set of operations that makes the two
//! roots converge.
//!
//! A single deterministic pass: the remote pairs are walked in wire
//! order, then the local table. Both deletion lists are consulted before
//! anything is requested, so a locally deleted file is never resurrected,
//! and files under a deleted directory are covered by the one directory
//! delete instead of per-file commands.

use nimbus_core::fileid::HashFile;

use crate::deleted::DeletedRegistry;
use crate::spooler::{Operation, OperationKind};
use crate::table::HashFileTable;

/// Produce the operations that reconcile `local` with `remote`.
/// Clears the registry's temporary dictionary on the way out.
pub fn reconcile(
    remote: &[(HashFile, u32)],
    local: &HashFileTable,
    deleted: &mut DeletedRegistry,
) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut consumed = vec![false; remote.len()];
    let mut deleted_dir_prefixes: Vec<String> = Vec::new();

    // Remote-only directories deleted here: one directory delete covers
    // the whole subtree.
    for (index, &(hash, mtime)) in remote.iter().enumerate() {
        if mtime != 0 || local.contains(hash) {
            continue;
        }
        if let Some(path) = deleted.temporary_path(hash) {
            deleted_dir_prefixes.push(format!("{path}/"));
            ops.push(Operation::new(OperationKind::DeleteDirectory, hash, 0));
            consumed[index] = true;
        }
    }

    // Common keys: the newer write wins.
    for (index, &(hash, remote_mtime)) in remote.iter().enumerate() {
        if consumed[index] {
            continue;
        }
        let Some(entry) = local.try_get(hash) else {
            continue;
        };
        consumed[index] = true;
        let local_mtime = entry.unix_timestamp();
        if remote_mtime > local_mtime {
            ops.push(Operation::new(
                OperationKind::RequestFile,
                hash,
                remote_mtime,
            ));
        } else if remote_mtime < local_mtime {
            ops.push(Operation::new(OperationKind::SendFile, hash, local_mtime));
        }
        // Equal timestamps mean equal (hash, mtime) pairs: nothing to do.
    }

    // Remote-only entries that this endpoint deleted: covered ones are
    // silently dropped, the rest become file deletes. Everything else is
    // left for the request pass below.
    let mut residual: Vec<(HashFile, u32)> = Vec::new();
    for (index, &(hash, mtime)) in remote.iter().enumerate() {
        if consumed[index] {
            continue;
        }
        if let Some(path) = deleted.temporary_path(hash) {
            if deleted_dir_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
            {
                continue;
            }
        }
        if deleted.contains(hash) {
            ops.push(Operation::new(OperationKind::DeleteFile, hash, mtime));
        } else {
            residual.push((hash, mtime));
        }
    }

    // Local-only entries: ship them.
    for (&hash, entry) in local.elements() {
        if remote.iter().any(|&(remote_hash, _)| remote_hash == hash) {
            continue;
        }
        ops.push(Operation::new(
            OperationKind::SendFile,
            hash,
            entry.unix_timestamp(),
        ));
    }

    // Residual remote-only entries are legitimate new files: fetch them.
    for (hash, mtime) in residual {
        ops.push(Operation::new(OperationKind::RequestFile, hash, mtime));
    }

    deleted.clear_temporary();

    tracing::debug!(
        remote = remote.len(),
        local = local.len(),
        operations = ops.len(),
        "reconcile pass complete"
    );
    ops
}
