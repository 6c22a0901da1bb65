//! Byte-range lock operations

use bytes::Bytes;
use tracing::debug;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::lock::{lock_end, ByteLock};
use crate::nfs4::state::StateKey;
use crate::nfs4::{LockOwner, LockType, ShareAccess, StateId};
use crate::server::NfsServer;

/// locker4: who the lock is taken for
#[derive(Debug, Clone)]
pub enum Locker {
    /// First lock of a lock owner, taken under an open stateid
    NewOwner {
        /// Open seqid (ignored in 4.1)
        open_seqid: u32,
        /// Open stateid
        open_stateid: StateId,
        /// Lock seqid (ignored in 4.1)
        lock_seqid: u32,
        /// Lock owner within the session's client
        owner: Bytes,
    },
    /// Lock owner that already has a lock stateid
    Existing {
        /// Lock stateid
        lock_stateid: StateId,
        /// Lock seqid (ignored in 4.1)
        lock_seqid: u32,
    },
}

/// LOCK arguments
#[derive(Debug, Clone)]
pub struct LockArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Reclaim after server restart
    pub reclaim: bool,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
    /// Lock owner
    pub locker: Locker,
}

/// LOCKT arguments
#[derive(Debug, Clone)]
pub struct LockTArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
    /// Lock owner within the session's client
    pub owner: Bytes,
}

/// LOCKU arguments
#[derive(Debug, Clone)]
pub struct LockUArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Sequence ID (ignored in 4.1)
    pub seqid: u32,
    /// Lock stateid
    pub stateid: StateId,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
}

impl NfsServer {
    fn check_lock_grace(&self, env: &CompoundEnv<'_>, reclaim: bool) -> NfsResult<()> {
        if reclaim {
            if !self.in_grace() || env.client()?.reclaim_complete() {
                return Err(NfsStatus::NoGrace.into());
            }
        } else if self.in_grace() {
            return Err(NfsStatus::Grace.into());
        }
        Ok(())
    }

    pub(crate) fn op_lock(&self, env: &mut CompoundEnv<'_>, args: &LockArgs) -> OpResult {
        env.cfh()?.verify_file()?;
        let end = lock_end(args.offset, args.length)?;
        self.check_lock_grace(env, args.reclaim)?;
        let client = env.client()?.clone();
        let wanted = ByteLock::new(args.lock_type, args.offset, end);
        let posix = self.config().posix_locks;

        let stateid = match &args.locker {
            Locker::NewOwner {
                open_stateid,
                owner,
                ..
            } => {
                let mut guard = self.find_state(env, *open_stateid, false, false)?;
                let StateKey::Share(open) = guard.key().clone() else {
                    return Err(NfsStatus::BadStateid.into());
                };
                if args.lock_type.is_write() {
                    guard.check_permission(ShareAccess::WRITE.bits())?;
                }
                let lock_owner = LockOwner::new(client.clientid, owner.clone());
                let tables = guard.tables();
                let key = tables.lock_entry(&client, &open, &lock_owner)?.handle.key.clone();
                if let Err(e) = tables.add_lock(&key, wanted, posix) {
                    let unused = tables
                        .entry(&key)
                        .and_then(|entry| entry.byte())
                        .is_some_and(|b| b.locks.is_empty());
                    if unused {
                        tables.remove_entry(&key);
                    }
                    return Err(e);
                }
                tables
                    .entry_mut(&key)
                    .ok_or(NfsStatus::Serverfault)?
                    .get_id()
            }
            Locker::Existing { lock_stateid, .. } => {
                let mut guard = self.find_state(env, *lock_stateid, false, false)?;
                let key = guard.key().clone();
                if !matches!(key, StateKey::Byte { .. }) {
                    return Err(NfsStatus::BadStateid.into());
                }
                if args.lock_type.is_write() {
                    guard.check_permission(ShareAccess::WRITE.bits())?;
                }
                guard.tables().add_lock(&key, wanted, posix)?;
                guard.entry_mut()?.get_id()
            }
        };
        debug!(clientid = client.clientid, start = args.offset, end, ?stateid, "locked");
        env.set_current_stateid(stateid);
        Ok(ResBody::StateId(stateid))
    }

    pub(crate) fn op_lockt(&self, env: &mut CompoundEnv<'_>, args: &LockTArgs) -> OpResult {
        let object = env.cfh()?.clone();
        object.verify_file()?;
        let end = lock_end(args.offset, args.length)?;
        if self.in_grace() {
            return Err(NfsStatus::Grace.into());
        }
        let owner = LockOwner::new(env.client()?.clientid, args.owner.clone());
        let (file, tables) = self.lock_file_state(&object);
        let tested = tables.test_lock(&owner, &ByteLock::new(args.lock_type, args.offset, end));
        drop(tables);
        self.release_file(&file);
        tested.map(|()| ResBody::Empty)
    }

    pub(crate) fn op_locku(&self, env: &mut CompoundEnv<'_>, args: &LockUArgs) -> OpResult {
        env.cfh()?.verify_file()?;
        let end = lock_end(args.offset, args.length)?;
        let mut guard = self.find_state(env, args.stateid, false, false)?;
        let key = guard.key().clone();
        if !matches!(key, StateKey::Byte { .. }) {
            return Err(NfsStatus::BadStateid.into());
        }
        let posix = self.config().posix_locks;
        guard.tables().remove_lock(&key, args.offset, end, posix)?;
        let stateid = guard.entry_mut()?.get_id();
        drop(guard);
        env.set_current_stateid(stateid);
        Ok(ResBody::StateId(stateid))
    }
}
