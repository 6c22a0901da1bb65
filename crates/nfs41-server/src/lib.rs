//! NFSv4.1 Server State Core
//!
//! This crate implements the stateful heart of an NFSv4.1 server: client
//! records, sessions with exactly-once slot replay, and per-file state for
//! opens, byte-range locks, delegations and pNFS layouts.
//!
//! # Features
//!
//! - EXCHANGE_ID / CREATE_SESSION / SEQUENCE with a reply cache per slot
//! - Share reservations with OPEN_DOWNGRADE history
//! - POSIX byte-range locks with split and merge
//! - Delegations recalled asynchronously over the back channel
//! - Layout bookkeeping for a metadata server
//! - Server instance fencing of clientids and stateids across restarts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ RPC / XDR    │  (caller)
//! └──────┬───────┘
//!        │ CompoundArgs
//! ┌──────▼───────┐
//! │  NfsServer   │
//! │  - Clients   │
//! │  - Sessions  │
//! │  - FileState │
//! └──────┬───────┘
//!        │ FsObject
//! ┌──────▼───────┐
//! │  Filesystem  │
//! └──────────────┘
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fs;
pub mod nfs4;
pub mod pnfs;
pub mod server;
pub mod xdr;

pub use config::{ClientLimits, NfsConfig};
pub use error::{NfsError, NfsResult, NfsStatus};
pub use fs::{Filesystem, FsObject, MemFs};
pub use nfs4::compound::{CallContext, CompoundArgs, CompoundOutcome, OpArgs};
pub use nfs4::delegation::{CallbackTransport, RecallEvent, RecallOutcome};
pub use server::NfsServer;
