//! OPEN, OPEN_DOWNGRADE, CLOSE and the I/O operations that present an
//! open stateid

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::fs::{FileType, FsObject};
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::client::ClientRecord;
use crate::nfs4::state::{FileTables, StateKey};
use crate::nfs4::{
    ChangeInfo, DelegationType, OpenOwner, ShareAccess, ShareDeny, StableHow, StateId,
    OPEN4_RESULT_LOCKTYPE_POSIX,
};
use crate::server::NfsServer;
use crate::xdr::XdrEncoder;

/// FATTR4_SIZE as a bitmap word
const SIZE_ATTR_MASK: u32 = 1 << 4;

/// nfs_space_limit4: limit by file size
const NFS_LIMIT_SIZE: u32 = 1;

/// Stateid CLOSE hands back: seqid all ones, other all zero
pub const CLOSED_STATEID: StateId = StateId {
    seqid: u32::MAX,
    other: [0; 12],
};

// ============================================================================
// OPEN - Open a regular file
// ============================================================================

/// createmode4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Create or use the existing file
    Unchecked,
    /// EXIST if the file is already there
    Guarded,
    /// Idempotent create keyed by a verifier
    Exclusive41([u8; 8]),
}

/// openflag4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenHow {
    /// OPEN4_NOCREATE
    NoCreate,
    /// OPEN4_CREATE
    Create(CreateMode),
}

/// open_claim4
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenClaim {
    /// Name in the current directory
    Null(String),
    /// The current filehandle itself
    Fh,
    /// Reclaim after a server restart; the current filehandle is the file
    Previous(DelegationType),
}

/// OPEN arguments
#[derive(Debug, Clone)]
pub struct OpenArgs {
    /// Sequence ID (ignored in 4.1)
    pub seqid: u32,
    /// Share access, including delegation "want" bits
    pub access: ShareAccess,
    /// Share deny
    pub deny: ShareDeny,
    /// Open owner within the session's client
    pub owner: Bytes,
    /// Create mode
    pub how: OpenHow,
    /// What to open
    pub claim: OpenClaim,
}

/// OPEN result
#[derive(Debug, Clone)]
pub struct OpenRes {
    /// Open stateid
    pub stateid: StateId,
    /// Directory change info
    pub cinfo: ChangeInfo,
    /// Result flags
    pub rflags: u32,
    /// Delegation granted with the open, if any
    pub delegation: Option<(DelegationType, StateId)>,
}

impl OpenRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        self.stateid.encode(enc);
        self.cinfo.encode(enc);
        enc.encode_u32(self.rflags);
        // attrset: nothing set at create
        enc.encode_bitmap(&[]);
        match &self.delegation {
            None => enc.encode_u32(DelegationType::None as u32),
            Some((deleg_type, stateid)) => {
                enc.encode_u32(*deleg_type as u32);
                stateid.encode(enc);
                // recall
                enc.encode_bool(false);
                if *deleg_type == DelegationType::Write {
                    enc.encode_u32(NFS_LIMIT_SIZE);
                    enc.encode_u64(u64::MAX);
                }
                // permissions: empty nfsace4
                enc.encode_u32(0);
                enc.encode_u32(0);
                enc.encode_u32(0);
                enc.encode_string("");
            }
        }
    }
}

/// OPEN_DOWNGRADE arguments
#[derive(Debug, Clone)]
pub struct OpenDowngradeArgs {
    /// Open stateid
    pub stateid: StateId,
    /// Sequence ID (ignored in 4.1)
    pub seqid: u32,
    /// New share access
    pub access: ShareAccess,
    /// New share deny
    pub deny: ShareDeny,
}

// ============================================================================
// READ / WRITE / SETATTR
// ============================================================================

/// READ arguments
#[derive(Debug, Clone)]
pub struct ReadArgs {
    /// Stateid
    pub stateid: StateId,
    /// Offset
    pub offset: u64,
    /// Count
    pub count: u32,
}

/// READ result
#[derive(Debug, Clone)]
pub struct ReadRes {
    /// End of file
    pub eof: bool,
    /// Data
    pub data: Bytes,
}

impl ReadRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_bool(self.eof);
        enc.encode_opaque(&self.data);
    }
}

/// WRITE arguments
#[derive(Debug, Clone)]
pub struct WriteArgs {
    /// Stateid
    pub stateid: StateId,
    /// Offset
    pub offset: u64,
    /// Stability requested
    pub stable: StableHow,
    /// Data
    pub data: Bytes,
}

/// WRITE result
#[derive(Debug, Clone)]
pub struct WriteRes {
    /// Bytes written
    pub count: u32,
    /// Stability achieved
    pub committed: StableHow,
    /// Write verifier
    pub verifier: [u8; 8],
}

impl WriteRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u32(self.count);
        enc.encode_u32(self.committed as u32);
        enc.encode_opaque_fixed(&self.verifier);
    }
}

/// SETATTR arguments. Only the size attribute touches state.
#[derive(Debug, Clone)]
pub struct SetAttrArgs {
    /// Stateid
    pub stateid: StateId,
    /// New size
    pub size: Option<u64>,
}

fn validate_share(access: ShareAccess, deny: ShareDeny) -> NfsResult<()> {
    if access.mode() == 0 || deny.bits() & !0x3 != 0 {
        return Err(NfsStatus::Inval.into());
    }
    Ok(())
}

impl NfsServer {
    pub(crate) fn op_open(&self, env: &mut CompoundEnv<'_>, args: &OpenArgs) -> OpResult {
        let client = env.client()?.clone();
        validate_share(args.access, args.deny)?;
        if !matches!(args.claim, OpenClaim::Null(_)) && args.how != OpenHow::NoCreate {
            return Err(NfsStatus::Inval.into());
        }
        match args.claim {
            OpenClaim::Previous(_) => {
                if !self.in_grace() || client.reclaim_complete() {
                    return Err(NfsStatus::NoGrace.into());
                }
            }
            _ if self.in_grace() => return Err(NfsStatus::Grace.into()),
            _ => {}
        }

        let (object, cinfo) = match &args.claim {
            OpenClaim::Null(name) => self.open_by_name(env.cfh()?, name, args.how)?,
            OpenClaim::Fh | OpenClaim::Previous(_) => {
                let object = env.cfh()?.clone();
                let change = object.change();
                (object, ChangeInfo::new(change, change, true))
            }
        };
        object.verify_file()?;

        let owner = OpenOwner::new(client.clientid, args.owner.clone());
        let (file, mut tables) = self.lock_file_state(&object);
        let granted = self.grant_open(&mut tables, &client, &owner, object.as_ref(), args);
        drop(tables);
        let (stateid, delegation) = match granted {
            Ok(granted) => granted,
            Err(e) => {
                self.release_file(&file);
                return Err(e);
            }
        };
        debug!(clientid = client.clientid, fileid = file.fileid, ?stateid, ?delegation, "opened");

        env.set_cfh(object);
        env.set_current_stateid(stateid);
        let rflags = if self.config().posix_locks {
            OPEN4_RESULT_LOCKTYPE_POSIX
        } else {
            0
        };
        Ok(ResBody::Open(OpenRes {
            stateid,
            cinfo,
            rflags,
            delegation,
        }))
    }

    /// Share, delegation and layout hook of an OPEN, under the file lock
    fn grant_open(
        &self,
        tables: &mut FileTables,
        client: &Arc<ClientRecord>,
        owner: &OpenOwner,
        object: &dyn FsObject,
        args: &OpenArgs,
    ) -> NfsResult<(StateId, Option<(DelegationType, StateId)>)> {
        let access = args.access.mode();
        let deny = args.deny.mode();
        tables.test_share(access, deny, NfsStatus::ShareDenied)?;
        tables.recall_conflicting(client.clientid, access, deny, self.recalls())?;
        let stateid = tables.add_share(client, owner, access, deny)?.get_id();
        let delegation = if self.config().delegations_enabled {
            tables.grant_delegation(client, object, args.access)
        } else {
            None
        };
        if self.config().is_mds {
            object.layout_open_hook();
        }
        Ok((stateid, delegation))
    }

    fn open_by_name(
        &self,
        dir: &Arc<dyn FsObject>,
        name: &str,
        how: OpenHow,
    ) -> NfsResult<(Arc<dyn FsObject>, ChangeInfo)> {
        dir.check_dir()?;
        let before = dir.change();
        let object = match (dir.lookup(name), how) {
            (Ok(_), OpenHow::Create(CreateMode::Guarded)) => {
                return Err(NfsStatus::Exist.into());
            }
            (Ok(existing), OpenHow::Create(CreateMode::Exclusive41(verifier))) => {
                if existing.create_verifier() != Some(verifier) {
                    return Err(NfsStatus::Exist.into());
                }
                existing
            }
            (Ok(existing), _) => existing,
            (Err(e), OpenHow::Create(mode)) if e.status() == NfsStatus::Noent => {
                let created = dir.create(name, FileType::Regular)?;
                if let CreateMode::Exclusive41(verifier) = mode {
                    created.set_create_verifier(verifier);
                }
                created
            }
            (Err(e), _) => return Err(e),
        };
        object.sync()?;
        dir.sync()?;
        Ok((object, ChangeInfo::new(before, dir.change(), true)))
    }

    pub(crate) fn op_open_downgrade(&self, env: &mut CompoundEnv<'_>, args: &OpenDowngradeArgs) -> OpResult {
        validate_share(args.access, args.deny)?;
        let mut guard = self.find_state(env, args.stateid, false, false)?;
        let StateKey::Share(owner) = guard.key().clone() else {
            return Err(NfsStatus::BadStateid.into());
        };
        guard
            .tables()
            .downgrade_share(&owner, args.access.mode(), args.deny.mode())?;
        let stateid = guard.entry_mut()?.get_id();
        drop(guard);
        env.set_current_stateid(stateid);
        Ok(ResBody::StateId(stateid))
    }

    pub(crate) fn op_close(&self, env: &mut CompoundEnv<'_>, stateid: StateId) -> OpResult {
        let guard = self.find_state(env, stateid, false, false)?;
        let StateKey::Share(owner) = guard.key().clone() else {
            return Err(NfsStatus::BadStateid.into());
        };
        let handle = guard.handle.clone();
        let file = guard.file.clone();
        drop(guard);

        handle.wait_until_unused();
        {
            let mut tables = file.lock();
            if handle.is_invalid() {
                return Err(NfsStatus::BadStateid.into());
            }
            tables.close_share(&owner, self.config().limits.allow_close_with_locks)?;
        }
        if self.config().is_mds {
            file.object.layout_close_hook();
        }
        self.release_file(&file);
        debug!(fileid = file.fileid, "closed");
        Ok(ResBody::StateId(CLOSED_STATEID))
    }

    pub(crate) fn op_read(&self, env: &mut CompoundEnv<'_>, args: &ReadArgs) -> OpResult {
        env.cfh()?.verify_file()?;
        let allow_bypass = self.config().limits.allow_stateid1;
        let mut guard = self.find_state(env, args.stateid, true, allow_bypass)?;
        guard.check_permission(ShareAccess::READ.bits())?;
        let file = guard.file.clone();
        let io = guard.handle.start_io(false);
        drop(guard);

        let read = file.object.read(args.offset, args.count);
        drop(io);
        self.release_file(&file);
        let (data, eof) = read?;
        Ok(ResBody::Read(ReadRes { eof, data }))
    }

    pub(crate) fn op_write(&self, env: &mut CompoundEnv<'_>, args: &WriteArgs) -> OpResult {
        env.cfh()?.verify_file()?;
        let clientid = env.client().map(|c| c.clientid).unwrap_or_default();
        let mut guard = self.find_state(env, args.stateid, true, false)?;
        guard.check_permission(ShareAccess::WRITE.bits())?;
        guard
            .tables()
            .recall_conflicting(clientid, ShareAccess::WRITE.bits(), 0, self.recalls())?;
        let file = guard.file.clone();
        let io = guard.handle.start_io(true);
        drop(guard);

        let written = write_through(file.object.as_ref(), args);
        drop(io);
        self.release_file(&file);
        let (count, committed) = written?;
        Ok(ResBody::Write(WriteRes {
            count,
            committed,
            verifier: self.write_verifier(),
        }))
    }

    pub(crate) fn op_setattr(&self, env: &mut CompoundEnv<'_>, args: &SetAttrArgs) -> OpResult {
        let Some(size) = args.size else {
            env.cfh()?;
            return Ok(ResBody::SetAttr(Vec::new()));
        };
        env.cfh()?.verify_file()?;
        let clientid = env.client().map(|c| c.clientid).unwrap_or_default();
        let mut guard = self.find_state(env, args.stateid, true, false)?;
        guard.check_permission(ShareAccess::WRITE.bits())?;
        guard
            .tables()
            .recall_conflicting(clientid, ShareAccess::WRITE.bits(), 0, self.recalls())?;
        let file = guard.file.clone();
        let resized = file.object.set_size(size);
        drop(guard);
        self.release_file(&file);
        resized?;
        Ok(ResBody::SetAttr(vec![SIZE_ATTR_MASK]))
    }
}

fn write_through(object: &dyn FsObject, args: &WriteArgs) -> NfsResult<(u32, StableHow)> {
    let count = object.write(args.offset, &args.data)?;
    if args.stable == StableHow::Unstable {
        return Ok((count, StableHow::Unstable));
    }
    object.sync()?;
    Ok((count, StableHow::FileSync))
}
