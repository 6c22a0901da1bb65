//! NFS error types

use bytes::Bytes;
use thiserror::Error;

use crate::nfs4::lock::LockDenied;

/// NFS error types
#[derive(Debug, Error)]
pub enum NfsError {
    /// NFS protocol error, reported to the client as-is
    #[error("NFS error: {0}")]
    Protocol(NfsStatus),

    /// Byte-range lock conflict (carries the conflicting lock)
    #[error("lock denied by {0}")]
    Denied(LockDenied),

    /// Retransmission of the last request seen on a slot
    #[error("replay of cached reply ({} bytes)", .0.len())]
    Replay(Bytes),

    /// XDR encoding/decoding error
    #[error("XDR error: {0}")]
    Xdr(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Back channel failure
    #[error("callback error: {0}")]
    Callback(String),

    /// Broken server invariant
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NfsError {
    /// Wire status for this error
    pub fn status(&self) -> NfsStatus {
        match self {
            NfsError::Protocol(status) => *status,
            NfsError::Denied(_) => NfsStatus::Denied,
            NfsError::Xdr(_) => NfsStatus::BadXdr,
            NfsError::Io(_) => NfsStatus::Io,
            NfsError::Replay(_)
            | NfsError::Config(_)
            | NfsError::Callback(_)
            | NfsError::Internal(_) => NfsStatus::Serverfault,
        }
    }
}

impl From<NfsStatus> for NfsError {
    fn from(status: NfsStatus) -> Self {
        NfsError::Protocol(status)
    }
}

impl PartialEq<NfsStatus> for NfsError {
    fn eq(&self, other: &NfsStatus) -> bool {
        self.status() == *other
    }
}

/// NFS status codes (RFC 5661)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NfsStatus {
    /// Success
    Ok = 0,
    /// Caller is not privileged
    Perm = 1,
    /// No such file or directory
    Noent = 2,
    /// I/O error
    Io = 5,
    /// No such device or address
    Nxio = 6,
    /// Access denied
    Access = 13,
    /// File exists
    Exist = 17,
    /// Cross-device link
    Xdev = 18,
    /// Not a directory
    Notdir = 20,
    /// Is a directory
    Isdir = 21,
    /// Invalid argument
    Inval = 22,
    /// File too large
    Fbig = 27,
    /// No space left on device
    Nospc = 28,
    /// Read-only file system
    Rofs = 30,
    /// Too many links
    Mlink = 31,
    /// File name too long
    Nametoolong = 63,
    /// Directory not empty
    Notempty = 66,
    /// Disk quota exceeded
    Dquot = 69,
    /// Stale file handle
    Stale = 70,
    /// Bad file handle
    Badhandle = 10001,
    /// Bad cookie
    BadCookie = 10003,
    /// Not supported
    Notsupp = 10004,
    /// Buffer too small
    Toosmall = 10005,
    /// Server fault
    Serverfault = 10006,
    /// Bad object type
    BadType = 10007,
    /// Try again later
    Delay = 10008,
    /// Attributes are the same
    Same = 10009,
    /// Byte-range lock denied
    Denied = 10010,
    /// Lease expired
    Expired = 10011,
    /// I/O blocked by a lock or share reservation
    Locked = 10012,
    /// Grace period in effect
    Grace = 10013,
    /// Share reservation denied
    ShareDenied = 10015,
    /// Client ID in use
    ClidInuse = 10017,
    /// Filesystem moved
    Moved = 10019,
    /// No current filehandle
    NoFileHandle = 10020,
    /// Minor version not supported
    MinorVersMismatch = 10021,
    /// Client ID from a previous server instance
    StaleClientid = 10022,
    /// Stateid from a previous server instance
    StaleStateid = 10023,
    /// Stateid seqid is behind
    OldStateid = 10024,
    /// Unknown or invalid stateid
    BadStateid = 10025,
    /// Bad owner seqid
    BadSeqid = 10026,
    /// Attributes differ
    NotSame = 10027,
    /// Lock range not supported
    LockRange = 10028,
    /// Object is a symlink
    Symlink = 10029,
    /// No saved filehandle
    RestoreFh = 10030,
    /// No grace period in effect
    NoGrace = 10033,
    /// Malformed XDR
    BadXdr = 10036,
    /// Locks still held
    LocksHeld = 10037,
    /// Operation not allowed by the open mode
    Openmode = 10038,
    /// Invalid character in a name
    Badchar = 10040,
    /// Lock type not supported
    LockNotsupp = 10043,
    /// Illegal operation
    OpIllegal = 10044,
    /// Lock would deadlock
    Deadlock = 10045,
    /// File is open
    FileOpen = 10046,
    /// Bad layout iomode
    BadIomode = 10049,
    /// Bad layout
    BadLayout = 10050,
    /// Unknown session
    BadSession = 10052,
    /// Slot out of range
    BadSlot = 10053,
    /// RECLAIM_COMPLETE already done
    CompleteAlready = 10054,
    /// Connection not bound to session
    ConnNotBound = 10055,
    /// Retry LAYOUTGET later
    LayoutTryLater = 10058,
    /// Layout unavailable
    LayoutUnavailable = 10059,
    /// No matching layout
    NoMatchingLayout = 10060,
    /// Recall conflict
    RecallConflict = 10061,
    /// Unknown layout type
    UnknownLayoutType = 10062,
    /// Slot seqid out of order
    SeqMisordered = 10063,
    /// SEQUENCE not first in compound
    SequencePos = 10064,
    /// Request too big for channel
    ReqTooBig = 10065,
    /// Reply too big for channel
    RepTooBig = 10066,
    /// Reply too big to cache
    RepTooBigToCache = 10067,
    /// Retry of an uncached reply
    RetryUncachedRep = 10068,
    /// Too many operations in compound
    TooManyOps = 10070,
    /// Operation requires a session
    OpNotInSession = 10071,
    /// Client still has state or sessions
    ClientidBusy = 10074,
    /// Retry with different arguments
    SeqFalseRetry = 10076,
    /// Highest slot too high
    BadHighSlot = 10077,
    /// Session being destroyed
    DeadSession = 10078,
    /// Operation must be the only one in compound
    NotOnlyOp = 10081,
    /// Wrong object type
    WrongType = 10083,
    /// Delegation was revoked
    DelegRevoked = 10087,
}

impl std::fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NfsStatus::Ok => "NFS4_OK",
            NfsStatus::Perm => "NFS4ERR_PERM",
            NfsStatus::Noent => "NFS4ERR_NOENT",
            NfsStatus::Io => "NFS4ERR_IO",
            NfsStatus::Nxio => "NFS4ERR_NXIO",
            NfsStatus::Access => "NFS4ERR_ACCESS",
            NfsStatus::Exist => "NFS4ERR_EXIST",
            NfsStatus::Xdev => "NFS4ERR_XDEV",
            NfsStatus::Notdir => "NFS4ERR_NOTDIR",
            NfsStatus::Isdir => "NFS4ERR_ISDIR",
            NfsStatus::Inval => "NFS4ERR_INVAL",
            NfsStatus::Fbig => "NFS4ERR_FBIG",
            NfsStatus::Nospc => "NFS4ERR_NOSPC",
            NfsStatus::Rofs => "NFS4ERR_ROFS",
            NfsStatus::Mlink => "NFS4ERR_MLINK",
            NfsStatus::Nametoolong => "NFS4ERR_NAMETOOLONG",
            NfsStatus::Notempty => "NFS4ERR_NOTEMPTY",
            NfsStatus::Dquot => "NFS4ERR_DQUOT",
            NfsStatus::Stale => "NFS4ERR_STALE",
            NfsStatus::Badhandle => "NFS4ERR_BADHANDLE",
            NfsStatus::BadCookie => "NFS4ERR_BAD_COOKIE",
            NfsStatus::Notsupp => "NFS4ERR_NOTSUPP",
            NfsStatus::Toosmall => "NFS4ERR_TOOSMALL",
            NfsStatus::Serverfault => "NFS4ERR_SERVERFAULT",
            NfsStatus::BadType => "NFS4ERR_BADTYPE",
            NfsStatus::Delay => "NFS4ERR_DELAY",
            NfsStatus::Same => "NFS4ERR_SAME",
            NfsStatus::Denied => "NFS4ERR_DENIED",
            NfsStatus::Expired => "NFS4ERR_EXPIRED",
            NfsStatus::Locked => "NFS4ERR_LOCKED",
            NfsStatus::Grace => "NFS4ERR_GRACE",
            NfsStatus::ShareDenied => "NFS4ERR_SHARE_DENIED",
            NfsStatus::ClidInuse => "NFS4ERR_CLID_INUSE",
            NfsStatus::Moved => "NFS4ERR_MOVED",
            NfsStatus::NoFileHandle => "NFS4ERR_NOFILEHANDLE",
            NfsStatus::MinorVersMismatch => "NFS4ERR_MINOR_VERS_MISMATCH",
            NfsStatus::StaleClientid => "NFS4ERR_STALE_CLIENTID",
            NfsStatus::StaleStateid => "NFS4ERR_STALE_STATEID",
            NfsStatus::OldStateid => "NFS4ERR_OLD_STATEID",
            NfsStatus::BadStateid => "NFS4ERR_BAD_STATEID",
            NfsStatus::BadSeqid => "NFS4ERR_BAD_SEQID",
            NfsStatus::NotSame => "NFS4ERR_NOT_SAME",
            NfsStatus::LockRange => "NFS4ERR_LOCK_RANGE",
            NfsStatus::Symlink => "NFS4ERR_SYMLINK",
            NfsStatus::RestoreFh => "NFS4ERR_RESTOREFH",
            NfsStatus::NoGrace => "NFS4ERR_NO_GRACE",
            NfsStatus::BadXdr => "NFS4ERR_BADXDR",
            NfsStatus::LocksHeld => "NFS4ERR_LOCKS_HELD",
            NfsStatus::Openmode => "NFS4ERR_OPENMODE",
            NfsStatus::Badchar => "NFS4ERR_BADCHAR",
            NfsStatus::LockNotsupp => "NFS4ERR_LOCK_NOTSUPP",
            NfsStatus::OpIllegal => "NFS4ERR_OP_ILLEGAL",
            NfsStatus::Deadlock => "NFS4ERR_DEADLOCK",
            NfsStatus::FileOpen => "NFS4ERR_FILE_OPEN",
            NfsStatus::BadIomode => "NFS4ERR_BADIOMODE",
            NfsStatus::BadLayout => "NFS4ERR_BADLAYOUT",
            NfsStatus::BadSession => "NFS4ERR_BADSESSION",
            NfsStatus::BadSlot => "NFS4ERR_BADSLOT",
            NfsStatus::CompleteAlready => "NFS4ERR_COMPLETE_ALREADY",
            NfsStatus::ConnNotBound => "NFS4ERR_CONN_NOT_BOUND_TO_SESSION",
            NfsStatus::LayoutTryLater => "NFS4ERR_LAYOUTTRYLATER",
            NfsStatus::LayoutUnavailable => "NFS4ERR_LAYOUTUNAVAILABLE",
            NfsStatus::NoMatchingLayout => "NFS4ERR_NOMATCHING_LAYOUT",
            NfsStatus::RecallConflict => "NFS4ERR_RECALLCONFLICT",
            NfsStatus::UnknownLayoutType => "NFS4ERR_UNKNOWN_LAYOUTTYPE",
            NfsStatus::SeqMisordered => "NFS4ERR_SEQ_MISORDERED",
            NfsStatus::SequencePos => "NFS4ERR_SEQUENCE_POS",
            NfsStatus::ReqTooBig => "NFS4ERR_REQ_TOO_BIG",
            NfsStatus::RepTooBig => "NFS4ERR_REP_TOO_BIG",
            NfsStatus::RepTooBigToCache => "NFS4ERR_REP_TOO_BIG_TO_CACHE",
            NfsStatus::RetryUncachedRep => "NFS4ERR_RETRY_UNCACHED_REP",
            NfsStatus::TooManyOps => "NFS4ERR_TOO_MANY_OPS",
            NfsStatus::OpNotInSession => "NFS4ERR_OP_NOT_IN_SESSION",
            NfsStatus::ClientidBusy => "NFS4ERR_CLIENTID_BUSY",
            NfsStatus::SeqFalseRetry => "NFS4ERR_SEQ_FALSE_RETRY",
            NfsStatus::BadHighSlot => "NFS4ERR_BAD_HIGH_SLOT",
            NfsStatus::DeadSession => "NFS4ERR_DEADSESSION",
            NfsStatus::NotOnlyOp => "NFS4ERR_NOT_ONLY_OP",
            NfsStatus::WrongType => "NFS4ERR_WRONG_TYPE",
            NfsStatus::DelegRevoked => "NFS4ERR_DELEG_REVOKED",
        };
        write!(f, "{}", name)
    }
}

/// Result type for NFS operations
pub type NfsResult<T> = Result<T, NfsError>;
