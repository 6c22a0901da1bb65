//! Client records
//!
//! A [`ClientRecord`] is created by EXCHANGE_ID, confirmed by its first
//! CREATE_SESSION and owns the client-wide map from stateid `other` to
//! state handle. The map is only locked for insertion, removal and
//! snapshotting; the FileState lock is always taken first when both are
//! needed.
//!
//! Revoking a client fences it: the flag is set and the map drained under
//! one lock acquisition, and every later insertion fails with EXPIRED.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::session::SessionRecord;
use super::slot::Slot;
use super::state::StateHandle;
use super::{ClientId, StateOther};
use crate::error::{NfsResult, NfsStatus};

/// Instance tag embedded in a clientid
pub fn clientid_tag(clientid: ClientId) -> u32 {
    (clientid >> 32) as u32
}

/// Instance tag embedded in a stateid `other`
pub fn other_tag(other: &StateOther) -> u32 {
    u32::from_be_bytes([other[0], other[1], other[2], other[3]])
}

#[derive(Debug)]
struct ClientInner {
    confirmed: bool,
    principal: String,
    revoked: bool,
    lease_expiry: Instant,
    sessions: Vec<Weak<SessionRecord>>,
    state: HashMap<StateOther, Arc<StateHandle>>,
    reclaim_complete: bool,
    seq_status: u32,
}

/// Server-side record of one client incarnation
#[derive(Debug)]
pub struct ClientRecord {
    /// Server-assigned id, instance tag in the high 32 bits
    pub clientid: ClientId,
    /// Client-chosen owner id
    pub ownerid: Bytes,
    /// Boot verifier sent with the owner id
    pub verifier: [u8; 8],
    /// Replay slot used by CREATE_SESSION
    pub session_replay: Arc<Mutex<Slot>>,
    next_other: AtomicU32,
    inner: Mutex<ClientInner>,
}

impl ClientRecord {
    /// Create an unconfirmed client
    pub fn new(
        clientid: ClientId,
        ownerid: Bytes,
        verifier: [u8; 8],
        principal: String,
        lease: Duration,
        default_reply: Bytes,
    ) -> Self {
        Self {
            clientid,
            ownerid,
            verifier,
            session_replay: Arc::new(Mutex::new(Slot::new(0, default_reply))),
            next_other: AtomicU32::new(1),
            inner: Mutex::new(ClientInner {
                confirmed: false,
                principal,
                revoked: false,
                lease_expiry: Instant::now() + lease,
                sessions: Vec::new(),
                state: HashMap::new(),
                reclaim_complete: false,
                seq_status: 0,
            }),
        }
    }

    /// Allocate a fresh stateid `other`: instance tag, low clientid bits,
    /// per-client counter
    pub fn new_other(&self) -> StateOther {
        let counter = self.next_other.fetch_add(1, Ordering::SeqCst);
        let mut other = [0u8; 12];
        other[..4].copy_from_slice(&clientid_tag(self.clientid).to_be_bytes());
        other[4..8].copy_from_slice(&(self.clientid as u32).to_be_bytes());
        other[8..].copy_from_slice(&counter.to_be_bytes());
        other
    }

    /// Check if CREATE_SESSION has confirmed this client
    pub fn is_confirmed(&self) -> bool {
        self.inner.lock().confirmed
    }

    /// Mark confirmed
    pub fn confirm(&self) {
        self.inner.lock().confirmed = true;
    }

    /// Principal that created this record
    pub fn principal(&self) -> String {
        self.inner.lock().principal.clone()
    }

    /// Update a confirmed record in place (EXCHANGE_ID case 6)
    pub fn update(&self, principal: String) {
        self.inner.lock().principal = principal;
    }

    /// Push the lease expiry out by `lease`
    pub fn renew_lease(&self, lease: Duration) {
        self.inner.lock().lease_expiry = Instant::now() + lease;
    }

    /// Check if the lease ran out before `now`
    pub fn lease_expired(&self, now: Instant) -> bool {
        self.inner.lock().lease_expiry < now
    }

    /// Attach a session
    pub fn add_session(&self, session: &Arc<SessionRecord>) {
        let mut inner = self.inner.lock();
        inner.sessions.retain(|s| s.strong_count() > 0);
        inner.sessions.push(Arc::downgrade(session));
    }

    /// Detach a session
    pub fn remove_session(&self, session: &Arc<SessionRecord>) {
        self.inner
            .lock()
            .sessions
            .retain(|s| s.strong_count() > 0 && !s.ptr_eq(&Arc::downgrade(session)));
    }

    /// Live sessions
    pub fn sessions(&self) -> Vec<Arc<SessionRecord>> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// First session with a usable back channel
    pub fn find_active_cb_session(&self) -> Option<Arc<SessionRecord>> {
        self.sessions().into_iter().find(|s| s.has_backchannel())
    }

    /// Register a state handle under its `other`. Fails once the client
    /// has been revoked.
    pub fn insert_state(&self, handle: Arc<StateHandle>) -> NfsResult<()> {
        let mut inner = self.inner.lock();
        if inner.revoked {
            return Err(NfsStatus::Expired.into());
        }
        debug!(clientid = self.clientid, other = ?handle.other, "state added");
        inner.state.insert(handle.other, handle);
        Ok(())
    }

    /// Fence the client and take every handle it holds
    pub fn revoke(&self) -> Vec<Arc<StateHandle>> {
        let mut inner = self.inner.lock();
        inner.revoked = true;
        std::mem::take(&mut inner.state).into_values().collect()
    }

    /// Check if the client has been revoked
    pub fn is_revoked(&self) -> bool {
        self.inner.lock().revoked
    }

    /// Drop a state handle
    pub fn remove_state(&self, other: &StateOther) -> Option<Arc<StateHandle>> {
        let removed = self.inner.lock().state.remove(other);
        if removed.is_some() {
            debug!(clientid = self.clientid, ?other, "state removed");
        }
        removed
    }

    /// Resolve a stateid `other`
    pub fn find_state(&self, other: &StateOther) -> Option<Arc<StateHandle>> {
        self.inner.lock().state.get(other).cloned()
    }

    /// Snapshot of every state handle
    pub fn state_handles(&self) -> Vec<Arc<StateHandle>> {
        self.inner.lock().state.values().cloned().collect()
    }

    /// Check if any state remains
    pub fn has_state(&self) -> bool {
        !self.inner.lock().state.is_empty()
    }

    /// Record RECLAIM_COMPLETE, returning false if it was already done
    pub fn set_reclaim_complete(&self) -> bool {
        let mut inner = self.inner.lock();
        !std::mem::replace(&mut inner.reclaim_complete, true)
    }

    /// Check if RECLAIM_COMPLETE was done
    pub fn reclaim_complete(&self) -> bool {
        self.inner.lock().reclaim_complete
    }

    /// Raise SEQUENCE status flags
    pub fn add_seq_status(&self, flags: u32) {
        self.inner.lock().seq_status |= flags;
    }

    /// Report pending status flags once, clearing them
    pub fn take_seq_status(&self) -> u32 {
        std::mem::take(&mut self.inner.lock().seq_status)
    }
}

#[derive(Debug, Default)]
struct ClientMaps {
    by_id: HashMap<ClientId, Arc<ClientRecord>>,
    by_owner: HashMap<Bytes, Arc<ClientRecord>>,
    counter: u32,
}

/// All clients, indexed by clientid and owner id
#[derive(Debug, Default)]
pub struct ClientList {
    maps: Mutex<ClientMaps>,
}

/// Arguments of a new client record
#[derive(Debug, Clone)]
pub struct NewClient {
    /// Owner id
    pub ownerid: Bytes,
    /// Verifier
    pub verifier: [u8; 8],
    /// Principal
    pub principal: String,
}

impl ClientList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up by clientid
    pub fn get(&self, clientid: ClientId) -> Option<Arc<ClientRecord>> {
        self.maps.lock().by_id.get(&clientid).cloned()
    }

    /// Look up by owner id
    pub fn by_owner(&self, ownerid: &[u8]) -> Option<Arc<ClientRecord>> {
        self.maps.lock().by_owner.get(ownerid).cloned()
    }

    /// Add a client under the current instance `tag`
    pub fn add(
        &self,
        tag: u32,
        new: NewClient,
        lease: Duration,
        default_reply: Bytes,
    ) -> Arc<ClientRecord> {
        let mut maps = self.maps.lock();
        maps.counter = maps.counter.wrapping_add(1);
        let clientid = (u64::from(tag) << 32) | u64::from(maps.counter);
        let client = Arc::new(ClientRecord::new(
            clientid,
            new.ownerid.clone(),
            new.verifier,
            new.principal,
            lease,
            default_reply,
        ));
        maps.by_id.insert(clientid, client.clone());
        maps.by_owner.insert(new.ownerid, client.clone());
        debug!(clientid, "client added");
        client
    }

    /// Remove by clientid
    pub fn remove(&self, clientid: ClientId) -> Option<Arc<ClientRecord>> {
        let mut maps = self.maps.lock();
        let client = maps.by_id.remove(&clientid)?;
        if maps
            .by_owner
            .get(&client.ownerid)
            .is_some_and(|c| c.clientid == clientid)
        {
            maps.by_owner.remove(&client.ownerid);
        }
        debug!(clientid, "client removed");
        Some(client)
    }

    /// Snapshot of every client
    pub fn all(&self) -> Vec<Arc<ClientRecord>> {
        self.maps.lock().by_id.values().cloned().collect()
    }

    /// Forget every client
    pub fn clear(&self) {
        let mut maps = self.maps.lock();
        maps.by_id.clear();
        maps.by_owner.clear();
    }

    /// Number of clients
    pub fn len(&self) -> usize {
        self.maps.lock().by_id.len()
    }

    /// Check if there are no clients
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
