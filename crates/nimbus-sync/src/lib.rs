//! nimbus-sync — the reconciliation and transfer engine.
//!
//! One library, both roles: a `SyncEngine` constructed as `Role::Client`
//! drives the periodic synchronization tick; as `Role::Server` it answers
//! table requests and executes the client's decisions. The host supplies
//! the transport, secure storage, and (optionally) a zero-knowledge
//! master key.

pub mod client;
pub mod context;
pub mod crc;
pub mod deleted;
pub mod entry;
pub mod events;
pub mod reconciler;
pub mod share;
pub mod spooler;
pub mod sync;
pub mod table;
pub mod transfer;
pub mod zero_knowledge;

pub use client::{ClientRecord, ClientRegistry, ClientStatus, Pin, SecureStorage};
pub use context::{CommandTransport, Role, SyncContext, TransferState};
pub use entry::FileSystemEntry;
pub use events::{FileError, SyncStatus, TransferProgress};
pub use reconciler::reconcile;
pub use spooler::{Operation, OperationKind, Spooler};
pub use sync::{SyncEngine, SyncError};
pub use table::HashFileTable;
pub use zero_knowledge::ZeroKnowledge;
