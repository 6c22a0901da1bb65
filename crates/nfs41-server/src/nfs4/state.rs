//! NFSv4.1 state management
//!
//! Every filesystem object that carries state has one [`FileState`]. Its
//! single mutex guards five typed tables (shares, byte-range locks,
//! delegations, layouts and the three anonymous entries) and the cached
//! union of share bits. A [`StateHandle`] is the part of an entry that
//! lives outside the lock: it is what a client's stateid map points at and
//! what recall tasks and lease expiry hold on to.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use lock_api::ArcMutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};
use tracing::debug;

use super::client::ClientRecord;
use super::delegation::RecallDispatcher;
use super::lock::{self, ByteLock, LockDenied};
use super::{
    ClientId, DelegationType, LockOwner, OpenOwner, ShareAccess, ShareDeny, StateId, StateOther,
};
use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::fs::{FileId, FsObject, DELEG_READ, DELEG_WRITE};
use crate::pnfs::{LayoutSegment, LayoutType};

/// Locked tables of one file
pub type TablesGuard = ArcMutexGuard<RawMutex, FileTables>;

/// `other` of the data-server bypass entry
pub const DS_OTHER: StateOther = [0x44; 12];

/// The three per-file entries that back special stateids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnonKind {
    /// All-zero stateid: participates in share checks
    Zero,
    /// All-ones stateid: bypasses share checks
    One,
    /// Data-server I/O, stateids are not checked at all
    DataServer,
}

impl AnonKind {
    fn index(self) -> usize {
        match self {
            AnonKind::Zero => 0,
            AnonKind::One => 1,
            AnonKind::DataServer => 2,
        }
    }

    fn other(self) -> StateOther {
        match self {
            AnonKind::Zero => [0; 12],
            AnonKind::One => [0xFF; 12],
            AnonKind::DataServer => DS_OTHER,
        }
    }
}

/// Owner named by a state key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerKind {
    /// Open owner of a share
    Open(OpenOwner),
    /// Lock owner of a byte-range entry
    Lock(LockOwner),
}

/// Hierarchical key of an entry within its file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// (client, open owner)
    Share(OpenOwner),
    /// (client, open owner, lock owner)
    Byte {
        /// Open owner the locks were taken under
        open: OpenOwner,
        /// Lock owner
        lock: LockOwner,
    },
    /// (client,)
    Delegation(ClientId),
    /// (client,)
    Layout(ClientId),
    /// Special stateid
    Anonymous(AnonKind),
}

impl StateKey {
    /// Client owning the entry, none for anonymous entries
    pub fn clientid(&self) -> Option<ClientId> {
        match self {
            StateKey::Share(open) => Some(open.clientid),
            StateKey::Byte { lock, .. } => Some(lock.clientid),
            StateKey::Delegation(clientid) | StateKey::Layout(clientid) => Some(*clientid),
            StateKey::Anonymous(_) => None,
        }
    }

    /// Most specific owner in the key
    pub fn owner(&self) -> Option<OwnerKind> {
        match self {
            StateKey::Share(open) => Some(OwnerKind::Open(open.clone())),
            StateKey::Byte { lock, .. } => Some(OwnerKind::Lock(lock.clone())),
            _ => None,
        }
    }

    /// Check if this is a layout key
    pub fn is_layout(&self) -> bool {
        matches!(self, StateKey::Layout(_))
    }
}

#[derive(Debug, Default)]
struct IoCounts {
    reading: u32,
    writing: u32,
}

/// Lock-free half of a state entry
#[derive(Debug)]
pub struct StateHandle {
    /// Stateid `other`
    pub other: StateOther,
    /// Key of the entry within its file
    pub key: StateKey,
    file: Weak<FileState>,
    client: Weak<ClientRecord>,
    invalid: AtomicBool,
    io: Mutex<IoCounts>,
    idle: Condvar,
}

impl StateHandle {
    pub(crate) fn new(
        other: StateOther,
        key: StateKey,
        file: Weak<FileState>,
        client: Weak<ClientRecord>,
    ) -> Self {
        Self {
            other,
            key,
            file,
            client,
            invalid: AtomicBool::new(false),
            io: Mutex::new(IoCounts::default()),
            idle: Condvar::new(),
        }
    }

    /// File this state belongs to
    pub fn file(&self) -> Option<Arc<FileState>> {
        self.file.upgrade()
    }

    /// Check if this handle belongs to `file`
    pub fn belongs_to(&self, file: &Arc<FileState>) -> bool {
        std::ptr::eq(self.file.as_ptr(), Arc::as_ptr(file))
    }

    /// Owning client
    pub fn client(&self) -> Option<Arc<ClientRecord>> {
        self.client.upgrade()
    }

    /// Set once the entry has been removed from its tables
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    /// Count an in-flight READ or WRITE until the guard drops
    pub fn start_io(self: &Arc<Self>, write: bool) -> IoGuard {
        let mut io = self.io.lock();
        if write {
            io.writing += 1;
        } else {
            io.reading += 1;
        }
        IoGuard {
            handle: self.clone(),
            write,
        }
    }

    /// In-flight (reads, writes)
    pub fn io_counts(&self) -> (u32, u32) {
        let io = self.io.lock();
        (io.reading, io.writing)
    }

    /// Block until no READ or WRITE is using this state
    pub fn wait_until_unused(&self) {
        let mut io = self.io.lock();
        while io.reading + io.writing != 0 {
            self.idle.wait(&mut io);
        }
    }
}

/// Marks a READ or WRITE in flight against a state entry
#[derive(Debug)]
pub struct IoGuard {
    handle: Arc<StateHandle>,
    write: bool,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        let mut io = self.handle.io.lock();
        if self.write {
            io.writing -= 1;
        } else {
            io.reading -= 1;
        }
        if io.reading + io.writing == 0 {
            self.handle.idle.notify_all();
        }
    }
}

/// Share reservation of one open owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareState {
    /// OR of granted access bits
    pub access: u32,
    /// OR of granted deny bits
    pub deny: u32,
    access_hist: u32,
    deny_hist: u32,
}

/// Map a 2-bit share value to its 3-bit history form, so that BOTH can be
/// told apart from READ | WRITE granted by separate OPENs.
fn share_hist(value: u32) -> u32 {
    match value & 0x3 {
        0x3 => 0x4,
        v => v,
    }
}

impl ShareState {
    fn add(&mut self, access: u32, deny: u32) {
        self.access |= access & 0x3;
        self.deny |= deny & 0x3;
        self.access_hist |= share_hist(access);
        self.deny_hist |= share_hist(deny);
    }

    /// OPEN_DOWNGRADE: the new values must be the union of some subset of
    /// the OPENs that built this share
    pub fn downgrade(&mut self, access: u32, deny: u32) -> NfsResult<()> {
        let new_access = share_hist(access);
        let new_deny = share_hist(deny);
        if new_access & !self.access_hist != 0 || new_deny & !self.deny_hist != 0 {
            return Err(NfsStatus::Inval.into());
        }
        if access & 0x3 == 0 {
            return Err(NfsStatus::Inval.into());
        }
        self.access_hist = new_access;
        self.deny_hist = new_deny;
        self.access = access & 0x3;
        self.deny = deny & 0x3;
        Ok(())
    }
}

/// Byte-range locks of one (open owner, lock owner) pair
#[derive(Debug, Clone, Default)]
pub struct ByteState {
    /// Held ranges, sorted and disjoint in POSIX mode
    pub locks: Vec<ByteLock>,
}

/// Progress of a delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallStatus {
    /// Held by the client
    Normal,
    /// Recall decided, task not yet running
    CbInit,
    /// CB_RECALL sent
    CbSent,
    /// Client acknowledged the recall
    CbReceived,
    /// Returned or revoked
    Invalid,
}

/// Delegation held by one client
#[derive(Debug, Clone)]
pub struct DelegState {
    /// READ or WRITE
    pub deleg_type: DelegationType,
    /// Recall progress
    pub status: RecallStatus,
}

/// Layout held by one client
#[derive(Debug, Clone)]
pub struct LayoutState {
    /// Single layout type per client per file
    pub layout_type: LayoutType,
    /// Granted segments, in grant order
    pub segments: Vec<LayoutSegment>,
}

/// Kind-specific part of an entry
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// OPEN share reservation
    Share(ShareState),
    /// Byte-range locks
    Byte(ByteState),
    /// Delegation
    Delegation(DelegState),
    /// pNFS layout
    Layout(LayoutState),
    /// Special stateid
    Anonymous(AnonKind),
}

/// One unit of state, reachable by stateid and by owner key
#[derive(Debug)]
pub struct StateEntry {
    /// Shared half
    pub handle: Arc<StateHandle>,
    /// Last seqid handed to the client
    pub seqid: u32,
    /// Kind-specific state
    pub kind: EntryKind,
}

impl StateEntry {
    /// Advance the seqid and return the stateid to send
    pub fn get_id(&mut self) -> StateId {
        self.seqid = match self.seqid.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        StateId::new(self.seqid, self.handle.other)
    }

    /// Stateid for callbacks (seqid zero)
    pub fn cb_id(&self) -> StateId {
        StateId::new(0, self.handle.other)
    }

    /// Share part, if this is a share entry
    pub fn share(&self) -> Option<&ShareState> {
        match &self.kind {
            EntryKind::Share(share) => Some(share),
            _ => None,
        }
    }

    /// Mutable share part
    pub fn share_mut(&mut self) -> Option<&mut ShareState> {
        match &mut self.kind {
            EntryKind::Share(share) => Some(share),
            _ => None,
        }
    }

    /// Delegation part
    pub fn delegation(&self) -> Option<&DelegState> {
        match &self.kind {
            EntryKind::Delegation(deleg) => Some(deleg),
            _ => None,
        }
    }

    /// Mutable delegation part
    pub fn delegation_mut(&mut self) -> Option<&mut DelegState> {
        match &mut self.kind {
            EntryKind::Delegation(deleg) => Some(deleg),
            _ => None,
        }
    }

    /// Byte-range part
    pub fn byte(&self) -> Option<&ByteState> {
        match &self.kind {
            EntryKind::Byte(byte) => Some(byte),
            _ => None,
        }
    }

    /// Layout part
    pub fn layout(&self) -> Option<&LayoutState> {
        match &self.kind {
            EntryKind::Layout(layout) => Some(layout),
            _ => None,
        }
    }
}

fn new_entry(
    file: &Weak<FileState>,
    client: &Arc<ClientRecord>,
    key: StateKey,
    kind: EntryKind,
) -> NfsResult<StateEntry> {
    let handle = Arc::new(StateHandle::new(
        client.new_other(),
        key,
        file.clone(),
        Arc::downgrade(client),
    ));
    client.insert_state(handle.clone())?;
    Ok(StateEntry {
        handle,
        seqid: 0,
        kind,
    })
}

fn entry_vanished(key: &StateKey) -> NfsError {
    NfsError::Internal(format!("entry for {key:?} vanished under the file lock"))
}

fn share_permission(entry: Option<&StateEntry>, access: u32) -> NfsResult<()> {
    let share = entry.and_then(StateEntry::share).ok_or(NfsStatus::Openmode)?;
    if share.access == 0 || (access & ShareAccess::WRITE.bits() != 0 && share.access & 0x2 == 0) {
        return Err(NfsStatus::Openmode.into());
    }
    Ok(())
}

/// Typed state tables of one file, guarded by the FileState mutex
#[derive(Debug)]
pub struct FileTables {
    file: Weak<FileState>,
    shares: HashMap<OpenOwner, StateEntry>,
    locks: HashMap<(OpenOwner, LockOwner), StateEntry>,
    delegations: HashMap<ClientId, StateEntry>,
    layouts: HashMap<ClientId, StateEntry>,
    anon: [StateEntry; 3],
    share_cache: Option<(u32, u32)>,
    retired: bool,
}

impl FileTables {
    fn new(file: Weak<FileState>) -> Self {
        let anon = [AnonKind::Zero, AnonKind::One, AnonKind::DataServer].map(|kind| StateEntry {
            handle: Arc::new(StateHandle::new(
                kind.other(),
                StateKey::Anonymous(kind),
                file.clone(),
                Weak::new(),
            )),
            seqid: 0,
            kind: EntryKind::Anonymous(kind),
        });
        Self {
            file,
            shares: HashMap::new(),
            locks: HashMap::new(),
            delegations: HashMap::new(),
            layouts: HashMap::new(),
            anon,
            share_cache: None,
            retired: false,
        }
    }

    /// Entry for `key`
    pub fn entry(&self, key: &StateKey) -> Option<&StateEntry> {
        match key {
            StateKey::Share(open) => self.shares.get(open),
            StateKey::Byte { open, lock } => self.locks.get(&(open.clone(), lock.clone())),
            StateKey::Delegation(clientid) => self.delegations.get(clientid),
            StateKey::Layout(clientid) => self.layouts.get(clientid),
            StateKey::Anonymous(kind) => Some(&self.anon[kind.index()]),
        }
    }

    /// Mutable entry for `key`
    pub fn entry_mut(&mut self, key: &StateKey) -> Option<&mut StateEntry> {
        match key {
            StateKey::Share(open) => self.shares.get_mut(open),
            StateKey::Byte { open, lock } => self.locks.get_mut(&(open.clone(), lock.clone())),
            StateKey::Delegation(clientid) => self.delegations.get_mut(clientid),
            StateKey::Layout(clientid) => self.layouts.get_mut(clientid),
            StateKey::Anonymous(kind) => Some(&mut self.anon[kind.index()]),
        }
    }

    /// Anonymous entry
    pub fn anon(&self, kind: AnonKind) -> &StateEntry {
        &self.anon[kind.index()]
    }

    /// Remove an entry from the tables and from its client's stateid map.
    /// Anonymous entries are never removed.
    pub fn remove_entry(&mut self, key: &StateKey) -> Option<StateEntry> {
        let entry = match key {
            StateKey::Share(open) => {
                self.share_cache = None;
                self.shares.remove(open)
            }
            StateKey::Byte { open, lock } => self.locks.remove(&(open.clone(), lock.clone())),
            StateKey::Delegation(clientid) => self.delegations.remove(clientid),
            StateKey::Layout(clientid) => self.layouts.remove(clientid),
            StateKey::Anonymous(_) => None,
        }?;
        entry.handle.invalidate();
        if let Some(client) = entry.handle.client() {
            client.remove_state(&entry.handle.other);
        }
        Some(entry)
    }

    /// True when no share, lock, delegation or layout remains
    pub fn has_no_state(&self) -> bool {
        self.shares.is_empty()
            && self.locks.is_empty()
            && self.delegations.is_empty()
            && self.layouts.is_empty()
    }

    /// No state and no READ or WRITE in flight under a special stateid
    pub fn is_idle(&self) -> bool {
        self.has_no_state() && self.anon.iter().all(|e| e.handle.io_counts() == (0, 0))
    }

    /// Set once the file was dropped from the [`FileTable`]
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    fn share_union(&mut self) -> (u32, u32) {
        if let Some(cached) = self.share_cache {
            return cached;
        }
        let union = self
            .shares
            .values()
            .filter_map(StateEntry::share)
            .fold((0, 0), |(a, d), s| (a | s.access, d | s.deny));
        self.share_cache = Some(union);
        union
    }

    /// Check `(access, deny)` against every share on the file. Reads and
    /// writes in flight under the all-zero stateid count as access.
    pub fn test_share(&mut self, access: u32, deny: u32, error: NfsStatus) -> NfsResult<()> {
        if access & 0x3 == 0 {
            return Err(NfsStatus::Inval.into());
        }
        let (mut current_access, current_deny) = self.share_union();
        let (reading, writing) = self.anon[AnonKind::Zero.index()].handle.io_counts();
        if reading > 0 {
            current_access |= ShareAccess::READ.bits();
        }
        if writing > 0 {
            current_access |= ShareAccess::WRITE.bits();
        }
        if access & current_deny != 0 || deny & current_access != 0 {
            debug!(access, deny, current_access, current_deny, %error, "share conflict");
            return Err(error.into());
        }
        Ok(())
    }

    /// Add an OPEN's share bits, creating the owner's entry if needed
    pub fn add_share(
        &mut self,
        client: &Arc<ClientRecord>,
        owner: &OpenOwner,
        access: u32,
        deny: u32,
    ) -> NfsResult<&mut StateEntry> {
        self.test_share(access, deny, NfsStatus::ShareDenied)?;
        self.share_cache = None;
        let entry = match self.shares.entry(owner.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(new_entry(
                &self.file,
                client,
                StateKey::Share(owner.clone()),
                EntryKind::Share(ShareState::default()),
            )?),
        };
        if let EntryKind::Share(share) = &mut entry.kind {
            share.add(access, deny);
        }
        Ok(entry)
    }

    /// Apply OPEN_DOWNGRADE to `owner`'s share
    pub fn downgrade_share(&mut self, owner: &OpenOwner, access: u32, deny: u32) -> NfsResult<()> {
        let key = StateKey::Share(owner.clone());
        let share = self
            .shares
            .get_mut(owner)
            .and_then(StateEntry::share_mut)
            .ok_or_else(|| entry_vanished(&key))?;
        share.downgrade(access, deny)?;
        self.share_cache = None;
        Ok(())
    }

    /// Check if `open` holds any byte-range lock
    pub fn has_locks(&self, open: &OpenOwner) -> bool {
        self.locks
            .iter()
            .any(|((o, _), e)| o == open && e.byte().is_some_and(|b| !b.locks.is_empty()))
    }

    /// CLOSE: drop the share and every lock entry taken under it
    pub fn close_share(&mut self, open: &OpenOwner, allow_close_with_locks: bool) -> NfsResult<()> {
        if self.has_locks(open) && !allow_close_with_locks {
            return Err(NfsStatus::LocksHeld.into());
        }
        let lock_keys: Vec<StateKey> = self
            .locks
            .keys()
            .filter(|(o, _)| o == open)
            .map(|(o, l)| StateKey::Byte {
                open: o.clone(),
                lock: l.clone(),
            })
            .collect();
        for key in lock_keys {
            self.remove_entry(&key);
        }
        self.remove_entry(&StateKey::Share(open.clone()))
            .map(|_| ())
            .ok_or_else(|| entry_vanished(&StateKey::Share(open.clone())))
    }

    /// Check that the state named by `key` allows `access` (READ or WRITE)
    pub fn check_permission(&mut self, key: &StateKey, access: u32) -> NfsResult<()> {
        match key {
            StateKey::Share(open) => share_permission(self.shares.get(open), access),
            StateKey::Byte { open, .. } => share_permission(self.shares.get(open), access),
            StateKey::Delegation(clientid) => {
                let deleg = self
                    .delegations
                    .get(clientid)
                    .and_then(StateEntry::delegation)
                    .ok_or_else(|| entry_vanished(key))?;
                if access & ShareAccess::WRITE.bits() != 0
                    && deleg.deleg_type == DelegationType::Read
                {
                    return Err(NfsStatus::Openmode.into());
                }
                Ok(())
            }
            StateKey::Layout(_) => Err(NfsStatus::BadStateid.into()),
            StateKey::Anonymous(AnonKind::Zero) => self.test_share(access, 0, NfsStatus::Locked),
            StateKey::Anonymous(_) => Ok(()),
        }
    }

    /// Lock entry of (open owner, lock owner), created on first use
    pub fn lock_entry(
        &mut self,
        client: &Arc<ClientRecord>,
        open: &OpenOwner,
        lock_owner: &LockOwner,
    ) -> NfsResult<&mut StateEntry> {
        Ok(match self.locks.entry((open.clone(), lock_owner.clone())) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(new_entry(
                &self.file,
                client,
                StateKey::Byte {
                    open: open.clone(),
                    lock: lock_owner.clone(),
                },
                EntryKind::Byte(ByteState::default()),
            )?),
        })
    }

    /// First lock held by another lock owner that conflicts with `wanted`
    pub fn find_lock_conflict(&self, lock_owner: &LockOwner, wanted: &ByteLock) -> Option<LockDenied> {
        self.locks.values().find_map(|entry| {
            let Some(OwnerKind::Lock(holder)) = entry.handle.key.owner() else {
                return None;
            };
            if &holder == lock_owner {
                return None;
            }
            entry
                .byte()?
                .locks
                .iter()
                .find(|held| held.conflicts(wanted))
                .map(|held| LockDenied::overlap(held, wanted, holder.clone()))
        })
    }

    /// LOCKT
    pub fn test_lock(&self, lock_owner: &LockOwner, wanted: &ByteLock) -> NfsResult<()> {
        match self.find_lock_conflict(lock_owner, wanted) {
            Some(denied) => Err(NfsError::Denied(denied)),
            None => Ok(()),
        }
    }

    /// Add a lock to an existing lock entry
    pub fn add_lock(&mut self, key: &StateKey, wanted: ByteLock, posix: bool) -> NfsResult<()> {
        let StateKey::Byte { open, lock: owner } = key else {
            return Err(NfsStatus::BadStateid.into());
        };
        self.test_lock(owner, &wanted)?;
        let entry = self
            .locks
            .get_mut(&(open.clone(), owner.clone()))
            .ok_or_else(|| entry_vanished(key))?;
        let EntryKind::Byte(byte) = &mut entry.kind else {
            return Err(entry_vanished(key));
        };
        if posix {
            lock::add_posix(&mut byte.locks, wanted);
            Ok(())
        } else {
            lock::add_exact(&mut byte.locks, wanted)
        }
    }

    /// Release a range from a lock entry
    pub fn remove_lock(&mut self, key: &StateKey, start: u64, end: u64, posix: bool) -> NfsResult<()> {
        let entry = self.entry_mut(key).ok_or_else(|| entry_vanished(key))?;
        let EntryKind::Byte(byte) = &mut entry.kind else {
            return Err(NfsStatus::BadStateid.into());
        };
        if posix {
            lock::remove_posix(&mut byte.locks, start, end);
            Ok(())
        } else {
            lock::remove_exact(&mut byte.locks, start, end)
        }
    }

    fn other_delegations(&self, clientid: ClientId) -> impl Iterator<Item = &StateEntry> + '_ {
        self.delegations
            .iter()
            .filter(move |(c, _)| **c != clientid)
            .map(|(_, e)| e)
    }

    /// Would an OPEN by `clientid` with `(access, deny)` conflict with a
    /// delegation held by another client?
    pub fn delegation_conflicts(&self, clientid: ClientId, access: u32, deny: u32) -> bool {
        self.other_delegations(clientid).any(|entry| {
            let Some(deleg) = entry.delegation() else {
                return false;
            };
            if deny & ShareDeny::READ.bits() != 0 {
                return true;
            }
            match deleg.deleg_type {
                DelegationType::Write => true,
                DelegationType::Read => access & ShareAccess::WRITE.bits() != 0 || deny != 0,
                DelegationType::None => false,
            }
        })
    }

    /// Start recalling every other client's delegation when `(access,
    /// deny)` conflicts with one of them. Fails with DELAY if anything
    /// conflicts; the caller retries once the delegations are gone.
    pub fn recall_conflicting(
        &mut self,
        clientid: ClientId,
        access: u32,
        deny: u32,
        dispatcher: &RecallDispatcher,
    ) -> NfsResult<()> {
        if !self.delegation_conflicts(clientid, access, deny) {
            return Ok(());
        }
        for (holder, entry) in self.delegations.iter_mut() {
            if *holder == clientid {
                continue;
            }
            let handle = entry.handle.clone();
            if let Some(deleg) = entry.delegation_mut() {
                if deleg.status == RecallStatus::Normal {
                    deleg.status = RecallStatus::CbInit;
                    dispatcher.recall(handle);
                }
            }
        }
        Err(NfsStatus::Delay.into())
    }

    /// Decide whether an OPEN gets a delegation, and hand it out
    pub fn grant_delegation(
        &mut self,
        client: &Arc<ClientRecord>,
        object: &dyn FsObject,
        access: ShareAccess,
    ) -> Option<(DelegationType, StateId)> {
        let want = access.want();
        if want == ShareAccess::WANT_NO_DELEG || want == ShareAccess::WANT_CANCEL {
            return None;
        }
        let clientid = client.clientid;
        if let Some(existing) = self.delegations.get_mut(&clientid) {
            let deleg_type = existing.delegation()?.deleg_type;
            if existing.delegation()?.status != RecallStatus::Normal {
                return None;
            }
            return Some((deleg_type, existing.get_id()));
        }
        if self.other_delegations(clientid).any(|e| {
            e.delegation()
                .is_some_and(|d| d.deleg_type == DelegationType::Write || d.status != RecallStatus::Normal)
        }) {
            return None;
        }
        let others_write = self.shares.iter().any(|(owner, entry)| {
            owner.clientid != clientid && entry.share().is_some_and(|s| s.access & 0x2 != 0)
        });
        let others_open = self.shares.keys().any(|owner| owner.clientid != clientid);
        let others_deleg = self.other_delegations(clientid).next().is_some();

        let options = object.delegation_options();
        let writing = access.mode() & ShareAccess::WRITE.bits() != 0;
        let deleg_type = if writing {
            let wants_write = matches!(
                want,
                ShareAccess::WANT_NO_PREFERENCE
                    | ShareAccess::WANT_WRITE_DELEG
                    | ShareAccess::WANT_ANY_DELEG
            );
            if options & DELEG_WRITE == 0 || !wants_write || others_open || others_deleg {
                return None;
            }
            DelegationType::Write
        } else {
            let wants_read = matches!(
                want,
                ShareAccess::WANT_NO_PREFERENCE
                    | ShareAccess::WANT_READ_DELEG
                    | ShareAccess::WANT_ANY_DELEG
            );
            if options & DELEG_READ == 0 || !wants_read || others_write {
                return None;
            }
            DelegationType::Read
        };

        let mut entry = new_entry(
            &self.file,
            client,
            StateKey::Delegation(clientid),
            EntryKind::Delegation(DelegState {
                deleg_type,
                status: RecallStatus::Normal,
            }),
        )
        .ok()?;
        let stateid = entry.get_id();
        self.delegations.insert(clientid, entry);
        debug!(clientid, ?deleg_type, "delegation granted");
        Some((deleg_type, stateid))
    }

    /// DELEGRETURN or revocation
    pub fn return_delegation(&mut self, clientid: ClientId) -> NfsResult<()> {
        let key = StateKey::Delegation(clientid);
        let entry = self.delegations.get_mut(&clientid).ok_or_else(|| entry_vanished(&key))?;
        if let Some(deleg) = entry.delegation_mut() {
            deleg.status = RecallStatus::Invalid;
        }
        self.remove_entry(&key);
        Ok(())
    }

    /// Record a granted layout segment for `client`. A client holds one
    /// layout type per file; segments are appended, never coalesced.
    pub fn grant_layout(
        &mut self,
        client: &Arc<ClientRecord>,
        segment: LayoutSegment,
    ) -> NfsResult<(StateId, Vec<LayoutSegment>)> {
        let clientid = client.clientid;
        if let Some(existing) = self.layouts.get(&clientid) {
            let held = existing.layout().map(|l| l.layout_type);
            if held != Some(segment.layout_type) {
                return Err(NfsStatus::LayoutUnavailable.into());
            }
        } else {
            let entry = new_entry(
                &self.file,
                client,
                StateKey::Layout(clientid),
                EntryKind::Layout(LayoutState {
                    layout_type: segment.layout_type,
                    segments: Vec::new(),
                }),
            )?;
            self.layouts.insert(clientid, entry);
        }
        let key = StateKey::Layout(clientid);
        let entry = self.layouts.get_mut(&clientid).ok_or_else(|| entry_vanished(&key))?;
        let EntryKind::Layout(layout) = &mut entry.kind else {
            return Err(entry_vanished(&key));
        };
        layout.segments.push(segment);
        let segments = layout.segments.clone();
        Ok((entry.get_id(), segments))
    }
}

/// Per-file state aggregate
#[derive(Debug)]
pub struct FileState {
    /// File id of the object
    pub fileid: FileId,
    /// The object itself
    pub object: Arc<dyn FsObject>,
    tables: Arc<Mutex<FileTables>>,
}

impl FileState {
    /// Create the state of `object`
    pub fn new(object: Arc<dyn FsObject>) -> Arc<Self> {
        Arc::new_cyclic(|weak| FileState {
            fileid: object.fileid(),
            object,
            tables: Arc::new(Mutex::new(FileTables::new(weak.clone()))),
        })
    }

    /// Acquire the file's state lock
    pub fn lock(&self) -> TablesGuard {
        self.tables.lock_arc()
    }

    /// Lock two files in fileid order. When both are the same file only
    /// one guard is returned.
    pub fn lock_pair(a: &Arc<FileState>, b: &Arc<FileState>) -> (TablesGuard, Option<TablesGuard>) {
        if Arc::ptr_eq(a, b) {
            return (a.lock(), None);
        }
        if a.fileid <= b.fileid {
            let first = a.lock();
            (first, Some(b.lock()))
        } else {
            let second = b.lock();
            (a.lock(), Some(second))
        }
    }
}

/// Every tracked [`FileState`], by fileid. Idle states are retired and
/// dropped; a lookup that locks a retired state retries on a fresh one.
#[derive(Debug, Default)]
pub struct FileTable {
    files: DashMap<FileId, Arc<FileState>>,
}

impl FileTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, object: &Arc<dyn FsObject>) -> Arc<FileState> {
        self.files
            .entry(object.fileid())
            .or_insert_with(|| FileState::new(object.clone()))
            .value()
            .clone()
    }

    /// State of `object` with its tables locked, created on first use
    pub fn lock(&self, object: &Arc<dyn FsObject>) -> (Arc<FileState>, TablesGuard) {
        loop {
            let file = self.get(object);
            let tables = file.lock();
            if !tables.is_retired() {
                return (file, tables);
            }
        }
    }

    /// Lock the states of two objects in fileid order
    pub fn lock_pair(
        &self,
        a: &Arc<dyn FsObject>,
        b: &Arc<dyn FsObject>,
    ) -> (Arc<FileState>, Arc<FileState>, TablesGuard, Option<TablesGuard>) {
        loop {
            let (file_a, file_b) = (self.get(a), self.get(b));
            let (tables_a, tables_b) = FileState::lock_pair(&file_a, &file_b);
            if !tables_a.is_retired() && !tables_b.as_ref().is_some_and(|t| t.is_retired()) {
                return (file_a, file_b, tables_a, tables_b);
            }
        }
    }

    /// Retire `file` if it is idle, destroying the object when it has no
    /// links left. Returns true if the file was dropped.
    pub fn release(&self, file: &Arc<FileState>) -> bool {
        let mut tables = file.lock();
        if tables.retired || !tables.is_idle() {
            return false;
        }
        tables.retired = true;
        self.files
            .remove_if(&file.fileid, |_, tracked| Arc::ptr_eq(tracked, file));
        if file.object.numlinks() == 0 {
            file.object.destroy();
            debug!(fileid = file.fileid, "unlinked file destroyed");
        }
        true
    }

    /// Release every idle file, returning how many were dropped
    pub fn prune(&self) -> usize {
        let tracked: Vec<_> = self.files.iter().map(|f| f.value().clone()).collect();
        tracked.iter().filter(|file| self.release(file)).count()
    }

    /// Number of tracked files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if no file is tracked
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Forget every file
    pub fn clear(&self) {
        self.files.clear();
    }
}
