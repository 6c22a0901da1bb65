//! NFSv4.1 COMPOUND operation handling
//!
//! COMPOUND is the primary RPC procedure for NFSv4.1, allowing multiple
//! operations to be batched in a single request. Arguments arrive already
//! decoded into [`OpArgs`]; replies are encoded with XDR because the encoded
//! bytes are what a slot's replay cache keeps.

use std::sync::Arc;

use bytes::Bytes;

use super::client::ClientRecord;
use super::delegation::CallbackTransport;
use super::lock::LockDenied;
use super::ops::{
    CreateSessionArgs, CreateSessionRes, ExchangeIdArgs, ExchangeIdRes, LayoutCommitArgs,
    LayoutGetArgs, LayoutGetRes, LayoutReturnArgs, LockArgs, LockTArgs, LockUArgs, OpenArgs,
    OpenDowngradeArgs, OpenRes, ReadArgs, ReadRes, SequenceArgs, SequenceRes, SetAttrArgs,
    WriteArgs, WriteRes,
};
use super::session::SessionRecord;
use super::{ChangeInfo, ClientId, FileHandle, SessionId, StateId};
use crate::error::{NfsResult, NfsStatus};
use crate::fs::FsObject;
use crate::xdr::XdrEncoder;

/// Tag of the reply a slot returns before it has executed anything
pub const DEFAULT_REPLAY_TAG: &str = "auto-created replay response";

/// NFSv4.1 operation codes (RFC 8881)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Nfs4Op {
    Access = 3,
    Close = 4,
    Commit = 5,
    Create = 6,
    DelegPurge = 7,
    DelegReturn = 8,
    GetAttr = 9,
    GetFh = 10,
    Link = 11,
    Lock = 12,
    LockT = 13,
    LockU = 14,
    Lookup = 15,
    LookupP = 16,
    NVerify = 17,
    Open = 18,
    OpenAttr = 19,
    OpenConfirm = 20,
    OpenDowngrade = 21,
    PutFh = 22,
    PutPubFh = 23,
    PutRootFh = 24,
    Read = 25,
    ReadDir = 26,
    ReadLink = 27,
    Remove = 28,
    Rename = 29,
    Renew = 30,
    RestoreFh = 31,
    SaveFh = 32,
    SecInfo = 33,
    SetAttr = 34,
    SetClientId = 35,
    SetClientIdConfirm = 36,
    Verify = 37,
    Write = 38,
    ReleaseLockOwner = 39,
    // NFSv4.1 operations
    BackchannelCtl = 40,
    BindConnToSession = 41,
    ExchangeId = 42,
    CreateSession = 43,
    DestroySession = 44,
    FreeStateId = 45,
    GetDirDelegation = 46,
    GetDeviceInfo = 47,
    GetDeviceList = 48,
    LayoutCommit = 49,
    LayoutGet = 50,
    LayoutReturn = 51,
    SecInfoNoName = 52,
    Sequence = 53,
    SetSsv = 54,
    TestStateId = 55,
    WantDelegation = 56,
    DestroyClientId = 57,
    ReclaimComplete = 58,
    // Illegal operation marker
    Illegal = 10044,
}

impl TryFrom<u32> for Nfs4Op {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Access),
            4 => Ok(Self::Close),
            5 => Ok(Self::Commit),
            6 => Ok(Self::Create),
            7 => Ok(Self::DelegPurge),
            8 => Ok(Self::DelegReturn),
            9 => Ok(Self::GetAttr),
            10 => Ok(Self::GetFh),
            11 => Ok(Self::Link),
            12 => Ok(Self::Lock),
            13 => Ok(Self::LockT),
            14 => Ok(Self::LockU),
            15 => Ok(Self::Lookup),
            16 => Ok(Self::LookupP),
            17 => Ok(Self::NVerify),
            18 => Ok(Self::Open),
            19 => Ok(Self::OpenAttr),
            20 => Ok(Self::OpenConfirm),
            21 => Ok(Self::OpenDowngrade),
            22 => Ok(Self::PutFh),
            23 => Ok(Self::PutPubFh),
            24 => Ok(Self::PutRootFh),
            25 => Ok(Self::Read),
            26 => Ok(Self::ReadDir),
            27 => Ok(Self::ReadLink),
            28 => Ok(Self::Remove),
            29 => Ok(Self::Rename),
            30 => Ok(Self::Renew),
            31 => Ok(Self::RestoreFh),
            32 => Ok(Self::SaveFh),
            33 => Ok(Self::SecInfo),
            34 => Ok(Self::SetAttr),
            35 => Ok(Self::SetClientId),
            36 => Ok(Self::SetClientIdConfirm),
            37 => Ok(Self::Verify),
            38 => Ok(Self::Write),
            39 => Ok(Self::ReleaseLockOwner),
            40 => Ok(Self::BackchannelCtl),
            41 => Ok(Self::BindConnToSession),
            42 => Ok(Self::ExchangeId),
            43 => Ok(Self::CreateSession),
            44 => Ok(Self::DestroySession),
            45 => Ok(Self::FreeStateId),
            46 => Ok(Self::GetDirDelegation),
            47 => Ok(Self::GetDeviceInfo),
            48 => Ok(Self::GetDeviceList),
            49 => Ok(Self::LayoutCommit),
            50 => Ok(Self::LayoutGet),
            51 => Ok(Self::LayoutReturn),
            52 => Ok(Self::SecInfoNoName),
            53 => Ok(Self::Sequence),
            54 => Ok(Self::SetSsv),
            55 => Ok(Self::TestStateId),
            56 => Ok(Self::WantDelegation),
            57 => Ok(Self::DestroyClientId),
            58 => Ok(Self::ReclaimComplete),
            10044 => Ok(Self::Illegal),
            _ => Err(NfsStatus::OpIllegal),
        }
    }
}

/// Decoded arguments of one operation
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum OpArgs {
    Sequence(SequenceArgs),
    ExchangeId(ExchangeIdArgs),
    CreateSession(CreateSessionArgs),
    DestroySession(SessionId),
    DestroyClientId(ClientId),
    ReclaimComplete { one_fs: bool },
    PutFh(FileHandle),
    PutRootFh,
    GetFh,
    SaveFh,
    RestoreFh,
    Lookup(String),
    Open(OpenArgs),
    OpenDowngrade(OpenDowngradeArgs),
    Close(StateId),
    Read(ReadArgs),
    Write(WriteArgs),
    SetAttr(SetAttrArgs),
    Lock(LockArgs),
    LockT(LockTArgs),
    LockU(LockUArgs),
    DelegReturn(StateId),
    LayoutGet(LayoutGetArgs),
    LayoutCommit(LayoutCommitArgs),
    LayoutReturn(LayoutReturnArgs),
    TestStateId(Vec<StateId>),
    FreeStateId(StateId),
    Remove(String),
    Rename { old: String, new: String },
    /// A valid operation this server does not implement
    Unsupported(Nfs4Op),
    /// An operation code outside the protocol
    Illegal,
}

impl OpArgs {
    /// Operation code
    pub fn op(&self) -> Nfs4Op {
        match self {
            OpArgs::Sequence(_) => Nfs4Op::Sequence,
            OpArgs::ExchangeId(_) => Nfs4Op::ExchangeId,
            OpArgs::CreateSession(_) => Nfs4Op::CreateSession,
            OpArgs::DestroySession(_) => Nfs4Op::DestroySession,
            OpArgs::DestroyClientId(_) => Nfs4Op::DestroyClientId,
            OpArgs::ReclaimComplete { .. } => Nfs4Op::ReclaimComplete,
            OpArgs::PutFh(_) => Nfs4Op::PutFh,
            OpArgs::PutRootFh => Nfs4Op::PutRootFh,
            OpArgs::GetFh => Nfs4Op::GetFh,
            OpArgs::SaveFh => Nfs4Op::SaveFh,
            OpArgs::RestoreFh => Nfs4Op::RestoreFh,
            OpArgs::Lookup(_) => Nfs4Op::Lookup,
            OpArgs::Open(_) => Nfs4Op::Open,
            OpArgs::OpenDowngrade(_) => Nfs4Op::OpenDowngrade,
            OpArgs::Close(_) => Nfs4Op::Close,
            OpArgs::Read(_) => Nfs4Op::Read,
            OpArgs::Write(_) => Nfs4Op::Write,
            OpArgs::SetAttr(_) => Nfs4Op::SetAttr,
            OpArgs::Lock(_) => Nfs4Op::Lock,
            OpArgs::LockT(_) => Nfs4Op::LockT,
            OpArgs::LockU(_) => Nfs4Op::LockU,
            OpArgs::DelegReturn(_) => Nfs4Op::DelegReturn,
            OpArgs::LayoutGet(_) => Nfs4Op::LayoutGet,
            OpArgs::LayoutCommit(_) => Nfs4Op::LayoutCommit,
            OpArgs::LayoutReturn(_) => Nfs4Op::LayoutReturn,
            OpArgs::TestStateId(_) => Nfs4Op::TestStateId,
            OpArgs::FreeStateId(_) => Nfs4Op::FreeStateId,
            OpArgs::Remove(_) => Nfs4Op::Remove,
            OpArgs::Rename { .. } => Nfs4Op::Rename,
            OpArgs::Unsupported(op) => *op,
            OpArgs::Illegal => Nfs4Op::Illegal,
        }
    }

    /// May run without a preceding SEQUENCE (as the only op)
    pub fn allowed_without_session(&self) -> bool {
        matches!(
            self,
            OpArgs::ExchangeId(_)
                | OpArgs::CreateSession(_)
                | OpArgs::DestroySession(_)
                | OpArgs::DestroyClientId(_)
        )
    }
}

/// COMPOUND request arguments
#[derive(Debug, Clone)]
pub struct CompoundArgs {
    /// Tag (for debugging)
    pub tag: String,
    /// Minor version
    pub minor_version: u32,
    /// Operations
    pub ops: Vec<OpArgs>,
}

impl CompoundArgs {
    /// Minor version 1 compound
    pub fn new(tag: impl Into<String>, ops: Vec<OpArgs>) -> Self {
        Self {
            tag: tag.into(),
            minor_version: super::NFS4_MINOR_VERSION,
            ops,
        }
    }
}

/// Operation-specific part of a result
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum ResBody {
    Empty,
    Sequence(SequenceRes),
    ExchangeId(ExchangeIdRes),
    CreateSession(CreateSessionRes),
    GetFh(FileHandle),
    Open(OpenRes),
    /// OPEN_DOWNGRADE, CLOSE, LOCK and LOCKU
    StateId(StateId),
    Read(ReadRes),
    Write(WriteRes),
    /// SETATTR: attributes set
    SetAttr(Vec<u32>),
    /// LOCK and LOCKT under NFS4ERR_DENIED
    Denied(LockDenied),
    LayoutGet(LayoutGetRes),
    /// New file size, if it changed
    LayoutCommit(Option<u64>),
    /// Remaining layout stateid, if any layout is still held
    LayoutReturn(Option<StateId>),
    TestStateId(Vec<NfsStatus>),
    Remove(ChangeInfo),
    Rename(ChangeInfo, ChangeInfo),
}

impl ResBody {
    fn encode(&self, enc: &mut XdrEncoder) {
        match self {
            ResBody::Empty => {}
            ResBody::Sequence(res) => res.encode(enc),
            ResBody::ExchangeId(res) => res.encode(enc),
            ResBody::CreateSession(res) => res.encode(enc),
            ResBody::GetFh(fh) => fh.encode(enc),
            ResBody::Open(res) => res.encode(enc),
            ResBody::StateId(stateid) => stateid.encode(enc),
            ResBody::Read(res) => res.encode(enc),
            ResBody::Write(res) => res.encode(enc),
            ResBody::SetAttr(bitmap) => enc.encode_bitmap(bitmap),
            ResBody::Denied(denied) => denied.encode(enc),
            ResBody::LayoutGet(res) => res.encode(enc),
            ResBody::LayoutCommit(size) => {
                enc.encode_bool(size.is_some());
                if let Some(size) = size {
                    enc.encode_u64(*size);
                }
            }
            ResBody::LayoutReturn(stateid) => {
                enc.encode_bool(stateid.is_some());
                if let Some(stateid) = stateid {
                    stateid.encode(enc);
                }
            }
            ResBody::TestStateId(codes) => {
                enc.encode_u32(codes.len() as u32);
                for code in codes {
                    enc.encode_u32(*code as u32);
                }
            }
            ResBody::Remove(cinfo) => cinfo.encode(enc),
            ResBody::Rename(source, target) => {
                source.encode(enc);
                target.encode(enc);
            }
        }
    }
}

/// Individual operation result
#[derive(Debug, Clone)]
pub struct OpReply {
    /// Operation code
    pub op: Nfs4Op,
    /// Status
    pub status: NfsStatus,
    /// Operation-specific result
    pub body: ResBody,
}

impl OpReply {
    /// Create a successful result
    pub fn ok(op: Nfs4Op, body: ResBody) -> Self {
        Self {
            op,
            status: NfsStatus::Ok,
            body,
        }
    }

    /// Create an error result
    pub fn error(op: Nfs4Op, status: NfsStatus) -> Self {
        Self {
            op,
            status,
            body: ResBody::Empty,
        }
    }

    /// Encode to XDR. Failed results carry no body, except DENIED (the
    /// conflicting lock) and SETATTR (the attributes that were set).
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u32(self.op as u32);
        enc.encode_u32(self.status as u32);
        let with_body = self.status == NfsStatus::Ok
            || matches!(self.body, ResBody::Denied(_) | ResBody::SetAttr(_));
        if with_body {
            self.body.encode(enc);
        }
    }
}

/// COMPOUND response
#[derive(Debug, Clone)]
pub struct CompoundReply {
    /// Status of last operation
    pub status: NfsStatus,
    /// Tag (echoed from request)
    pub tag: String,
    /// Operation results
    pub results: Vec<OpReply>,
}

impl CompoundReply {
    /// Create a new response
    pub fn new(tag: String) -> Self {
        Self {
            status: NfsStatus::Ok,
            tag,
            results: Vec::new(),
        }
    }

    /// Add an operation result
    pub fn add_result(&mut self, result: OpReply) {
        self.status = result.status;
        self.results.push(result);
    }

    /// Result of the last operation
    pub fn last(&self) -> Option<&OpReply> {
        self.results.last()
    }

    /// Encode to XDR
    pub fn encode(&self) -> Bytes {
        let mut enc = XdrEncoder::new();
        enc.encode_u32(self.status as u32);
        enc.encode_string(&self.tag);
        enc.encode_u32(self.results.len() as u32);
        for result in &self.results {
            result.encode(&mut enc);
        }
        enc.finish()
    }
}

/// The reply a slot holds before its first request: SEQ_MISORDERED for `op`
pub fn default_replay(op: Nfs4Op) -> Bytes {
    let mut reply = CompoundReply::new(DEFAULT_REPLAY_TAG.to_string());
    reply.add_result(OpReply::error(op, NfsStatus::SeqMisordered));
    reply.encode()
}

/// What `NfsServer::compound` produced
#[derive(Debug, Clone)]
pub enum CompoundOutcome {
    /// The operations ran
    Executed(CompoundReply),
    /// A retransmission answered from a replay cache
    Replayed(Bytes),
}

impl CompoundOutcome {
    /// Bytes to send on the wire
    pub fn to_bytes(&self) -> Bytes {
        match self {
            CompoundOutcome::Executed(reply) => reply.encode(),
            CompoundOutcome::Replayed(bytes) => bytes.clone(),
        }
    }

    /// Executed reply, if this was not a replay
    pub fn reply(&self) -> Option<&CompoundReply> {
        match self {
            CompoundOutcome::Executed(reply) => Some(reply),
            CompoundOutcome::Replayed(_) => None,
        }
    }

    /// Wire value of the compound status
    pub fn status_code(&self) -> u32 {
        match self {
            CompoundOutcome::Executed(reply) => reply.status as u32,
            CompoundOutcome::Replayed(bytes) => bytes
                .get(..4)
                .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
                .unwrap_or(NfsStatus::Serverfault as u32),
        }
    }
}

/// What the transport knows about the call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Authenticated principal
    pub principal: String,
    /// Callback path the connection offers, for CREATE_SESSION
    pub callback: Option<Arc<dyn CallbackTransport>>,
    /// Encoded request size, for REQ_TOO_BIG
    pub request_size: u32,
}

/// Per-compound execution state
#[derive(Debug)]
pub struct CompoundEnv<'a> {
    /// Call information
    pub ctx: &'a CallContext,
    /// Session from SEQUENCE
    pub session: Option<Arc<SessionRecord>>,
    cfh: Option<Arc<dyn FsObject>>,
    sfh: Option<Arc<dyn FsObject>>,
    current_stateid: Option<StateId>,
    saved_stateid: Option<StateId>,
}

impl<'a> CompoundEnv<'a> {
    /// Create a new environment
    pub fn new(ctx: &'a CallContext) -> Self {
        Self {
            ctx,
            session: None,
            cfh: None,
            sfh: None,
            current_stateid: None,
            saved_stateid: None,
        }
    }

    /// Current filehandle object or NOFILEHANDLE
    pub fn cfh(&self) -> NfsResult<&Arc<dyn FsObject>> {
        self.cfh.as_ref().ok_or_else(|| NfsStatus::NoFileHandle.into())
    }

    /// Saved filehandle object or NOFILEHANDLE
    pub fn sfh(&self) -> NfsResult<&Arc<dyn FsObject>> {
        self.sfh.as_ref().ok_or_else(|| NfsStatus::NoFileHandle.into())
    }

    /// Replace the current filehandle; the current stateid goes with it
    pub fn set_cfh(&mut self, object: Arc<dyn FsObject>) {
        self.cfh = Some(object);
        self.current_stateid = None;
    }

    /// SAVEFH
    pub fn save(&mut self) -> NfsResult<()> {
        self.sfh = Some(self.cfh()?.clone());
        self.saved_stateid = self.current_stateid;
        Ok(())
    }

    /// RESTOREFH
    pub fn restore(&mut self) -> NfsResult<()> {
        let saved = self.sfh.clone().ok_or(NfsStatus::RestoreFh)?;
        self.cfh = Some(saved);
        self.current_stateid = self.saved_stateid;
        Ok(())
    }

    /// Stateid the special "current" stateid stands for
    pub fn current_stateid(&self) -> Option<StateId> {
        self.current_stateid
    }

    /// Record the stateid produced by an op
    pub fn set_current_stateid(&mut self, stateid: StateId) {
        self.current_stateid = Some(stateid);
    }

    /// Session of this compound
    pub fn session(&self) -> NfsResult<&Arc<SessionRecord>> {
        self.session
            .as_ref()
            .ok_or_else(|| NfsStatus::OpNotInSession.into())
    }

    /// Client owning the session, refused once its state was revoked
    pub fn client(&self) -> NfsResult<&Arc<ClientRecord>> {
        let client = &self.session()?.client;
        if client.is_revoked() {
            return Err(NfsStatus::Expired.into());
        }
        Ok(client)
    }
}
