//! NFSv4.1 protocol core
//!
//! Wire-level identifiers (stateids, filehandles, owners), share and lock
//! constants, and the state engine that sits behind COMPOUND processing.

pub mod channel;
pub mod client;
pub mod compound;
pub mod delegation;
pub mod find;
pub mod lock;
pub mod ops;
pub mod session;
pub mod slot;
pub mod state;

use bytes::Bytes;

use crate::error::{NfsResult, NfsStatus};
use crate::xdr::{XdrDecoder, XdrEncoder};

/// NFSv4.1 minor version
pub const NFS4_MINOR_VERSION: u32 = 1;

/// Server-assigned client identifier (instance tag in the high 32 bits)
pub type ClientId = u64;

/// Session ID (16 bytes, opaque)
pub type SessionId = [u8; 16];

/// Opaque `other` part of a stateid
pub type StateOther = [u8; 12];

/// NFSv4 file handle (opaque, max 128 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(pub Bytes);

impl FileHandle {
    /// Create a new filehandle from bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_opaque(&self.0);
    }
}

/// NFSv4.1 stateid (identifies state at server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Sequence number
    pub seqid: u32,
    /// Other (12 bytes, opaque)
    pub other: StateOther,
}

impl StateId {
    /// Anonymous stateid (all zeros)
    pub const ANONYMOUS: Self = Self {
        seqid: 0,
        other: [0; 12],
    };

    /// Read bypass stateid (all ones)
    pub const READ_BYPASS: Self = Self {
        seqid: 0xFFFF_FFFF,
        other: [0xFF; 12],
    };

    /// Current stateid (seqid=1, other=0)
    pub const CURRENT: Self = Self {
        seqid: 1,
        other: [0; 12],
    };

    /// Create a new stateid
    pub fn new(seqid: u32, other: StateOther) -> Self {
        Self { seqid, other }
    }

    /// `other` is one of the two reserved values
    pub fn is_special(&self) -> bool {
        self.other == [0; 12] || self.other == [0xFF; 12]
    }

    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u32(self.seqid);
        enc.encode_opaque_fixed(&self.other);
    }

    /// Decode from XDR
    pub fn decode(dec: &mut XdrDecoder) -> NfsResult<Self> {
        let seqid = dec.decode_u32()?;
        let other_vec = dec.decode_opaque_fixed(12)?;
        let mut other = [0u8; 12];
        other.copy_from_slice(&other_vec);
        Ok(Self { seqid, other })
    }
}

/// Change info returned by directory-modifying operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeInfo {
    /// Atomic operation
    pub atomic: bool,
    /// Change value before operation
    pub before: u64,
    /// Change value after operation
    pub after: u64,
}

impl ChangeInfo {
    /// Create new change info
    pub fn new(before: u64, after: u64, atomic: bool) -> Self {
        Self {
            atomic,
            before,
            after,
        }
    }

    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_bool(self.atomic);
        enc.encode_u64(self.before);
        enc.encode_u64(self.after);
    }
}

/// Open owner (client-chosen opaque name within a client)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpenOwner {
    /// Client ID
    pub clientid: ClientId,
    /// Owner identifier (opaque)
    pub owner: Bytes,
}

impl OpenOwner {
    /// Create a new open owner
    pub fn new(clientid: ClientId, owner: impl Into<Bytes>) -> Self {
        Self {
            clientid,
            owner: owner.into(),
        }
    }
}

/// Lock owner (client-chosen opaque name within a client)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    /// Client ID
    pub clientid: ClientId,
    /// Owner identifier (opaque)
    pub owner: Bytes,
}

impl LockOwner {
    /// Create a new lock owner
    pub fn new(clientid: ClientId, owner: impl Into<Bytes>) -> Self {
        Self {
            clientid,
            owner: owner.into(),
        }
    }

    /// Encode as lock_owner4
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u64(self.clientid);
        enc.encode_opaque(&self.owner);
    }
}

/// Share access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShareAccess(u32);

impl ShareAccess {
    /// Read access
    pub const READ: Self = Self(0x0000_0001);
    /// Write access
    pub const WRITE: Self = Self(0x0000_0002);
    /// Both read and write
    pub const BOTH: Self = Self(0x0000_0003);
    /// Mask of the delegation "want" field
    pub const WANT_DELEG_MASK: u32 = 0x0000_FF00;
    /// No delegation preference
    pub const WANT_NO_PREFERENCE: u32 = 0x0000_0000;
    /// Want read delegation
    pub const WANT_READ_DELEG: u32 = 0x0000_0100;
    /// Want write delegation
    pub const WANT_WRITE_DELEG: u32 = 0x0000_0200;
    /// Want any delegation
    pub const WANT_ANY_DELEG: u32 = 0x0000_0300;
    /// Want no delegation
    pub const WANT_NO_DELEG: u32 = 0x0000_0400;
    /// Cancel a pending want
    pub const WANT_CANCEL: u32 = 0x0000_0500;

    /// Check if any of the given mode bits are set
    pub fn contains(&self, other: Self) -> bool {
        self.mode() & other.0 != 0
    }

    /// Get raw value
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The two access bits, without "want" flags
    pub fn mode(&self) -> u32 {
        self.0 & 0x3
    }

    /// The delegation "want" field
    pub fn want(&self) -> u32 {
        self.0 & Self::WANT_DELEG_MASK
    }
}

/// Share deny mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShareDeny(u32);

impl ShareDeny {
    /// No deny
    pub const NONE: Self = Self(0x0000_0000);
    /// Deny read
    pub const READ: Self = Self(0x0000_0001);
    /// Deny write
    pub const WRITE: Self = Self(0x0000_0002);
    /// Deny both
    pub const BOTH: Self = Self(0x0000_0003);

    /// Check if any of the given deny bits are set
    pub fn contains(&self, other: Self) -> bool {
        self.mode() & other.0 != 0
    }

    /// Get raw value
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The two deny bits
    pub fn mode(&self) -> u32 {
        self.0 & 0x3
    }
}

/// Byte-range lock type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LockType {
    /// Read lock (non-blocking)
    ReadLt = 1,
    /// Write lock (non-blocking)
    WriteLt = 2,
    /// Read lock (blocking)
    ReadW = 3,
    /// Write lock (blocking)
    WriteW = 4,
}

impl LockType {
    /// Check if this is a write lock
    pub fn is_write(&self) -> bool {
        matches!(self, LockType::WriteLt | LockType::WriteW)
    }
}

impl TryFrom<u32> for LockType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ReadLt),
            2 => Ok(Self::WriteLt),
            3 => Ok(Self::ReadW),
            4 => Ok(Self::WriteW),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// Delegation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DelegationType {
    /// No delegation
    None = 0,
    /// Read delegation
    Read = 1,
    /// Write delegation
    Write = 2,
}

/// Stability of a WRITE
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum StableHow {
    /// Server may cache
    Unstable = 0,
    /// Data committed, metadata may be cached
    DataSync = 1,
    /// Data and metadata committed
    FileSync = 2,
}

/// OPEN4 result flag: server uses POSIX lock semantics
pub const OPEN4_RESULT_LOCKTYPE_POSIX: u32 = 0x0000_0004;

/// EXCHANGE_ID flags
pub mod exchgid {
    /// Client supports stateid 4.1 semantics for "MOVED" (unused here)
    pub const SUPP_MOVED_REFER: u32 = 0x0000_0001;
    /// Client supports migration
    pub const SUPP_MOVED_MIGR: u32 = 0x0000_0002;
    /// Client wants to bind principal to state
    pub const BIND_PRINC_STATEID: u32 = 0x0000_0100;
    /// Non-pNFS server role
    pub const USE_NON_PNFS: u32 = 0x0001_0000;
    /// pNFS metadata server role
    pub const USE_PNFS_MDS: u32 = 0x0002_0000;
    /// pNFS data server role
    pub const USE_PNFS_DS: u32 = 0x0004_0000;
    /// Role bits
    pub const MASK_PNFS: u32 = 0x0007_0000;
    /// Client is updating a confirmed record
    pub const UPD_CONFIRMED_REC_A: u32 = 0x4000_0000;
    /// Record is confirmed (server only)
    pub const CONFIRMED_R: u32 = 0x8000_0000;
    /// All bits a client may send
    pub const MASK_A: u32 = SUPP_MOVED_REFER
        | SUPP_MOVED_MIGR
        | BIND_PRINC_STATEID
        | MASK_PNFS
        | UPD_CONFIRMED_REC_A
        | CONFIRMED_R;
}

/// CREATE_SESSION flags
pub mod create_session {
    /// Session persists across server restarts
    pub const PERSIST: u32 = 0x0000_0001;
    /// Use this connection for the back channel
    pub const CONN_BACK_CHAN: u32 = 0x0000_0002;
    /// RDMA connection
    pub const CONN_RDMA: u32 = 0x0000_0004;
    /// All valid bits
    pub const MASK: u32 = PERSIST | CONN_BACK_CHAN | CONN_RDMA;
}

/// SEQUENCE status flags
pub mod seq4_status {
    /// No usable back channel
    pub const CB_PATH_DOWN: u32 = 0x0000_0001;
    /// Some state was revoked because of an expired lease
    pub const EXPIRED_ALL_STATE_REVOKED: u32 = 0x0000_0010;
    /// Recallable state was revoked
    pub const RECALLABLE_STATE_REVOKED: u32 = 0x0000_0040;
    /// Lease will expire soon
    pub const LEASE_MOVED: u32 = 0x0000_0080;
    /// Back channel is down for this session
    pub const CB_PATH_DOWN_SESSION: u32 = 0x0000_0200;
}
