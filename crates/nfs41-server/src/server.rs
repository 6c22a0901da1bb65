//! NFS server implementation
//!
//! [`NfsServer`] owns every table the state engine needs: clients, sessions,
//! per-file state and the recall dispatcher. There are no globals; share the
//! server as `Arc<NfsServer>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NfsConfig;
use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::fs::{Filesystem, FsObject};
use crate::nfs4::client::{clientid_tag, ClientList, ClientRecord};
use crate::nfs4::compound::{
    CallContext, CompoundArgs, CompoundEnv, CompoundOutcome, CompoundReply, Nfs4Op, OpArgs,
    OpReply, ResBody,
};
use crate::nfs4::delegation::{RecallDispatcher, RecallEvent};
use crate::nfs4::ops::{CreateSessionArgs, SequenceArgs};
use crate::nfs4::session::SessionRecord;
use crate::nfs4::state::{FileState, FileTable, TablesGuard};
use crate::nfs4::{create_session, ClientId, SessionId, NFS4_MINOR_VERSION};

#[derive(Debug)]
struct Instance {
    tag: u32,
    verifier: [u8; 8],
    grace_end: Instant,
}

fn next_tag(tag: u32) -> u32 {
    match tag.wrapping_add(1) {
        0 | u32::MAX => 1,
        next => next,
    }
}

fn single_error(tag: &str, op: Nfs4Op, status: NfsStatus) -> CompoundOutcome {
    let mut reply = CompoundReply::new(tag.to_string());
    reply.add_result(OpReply::error(op, status));
    CompoundOutcome::Executed(reply)
}

/// NFS server
#[derive(Debug)]
pub struct NfsServer {
    /// Server configuration
    config: NfsConfig,
    /// Exported filesystem
    fs: Arc<dyn Filesystem>,
    /// Instance tag, write verifier and grace deadline
    instance: RwLock<Instance>,
    /// Clients by clientid and by owner id
    clients: ClientList,
    /// Sessions by ID
    sessions: DashMap<SessionId, Arc<SessionRecord>>,
    session_counter: AtomicU64,
    /// State of every file in use
    files: Arc<FileTable>,
    recalls: RecallDispatcher,
    recall_events: Mutex<Option<mpsc::UnboundedReceiver<RecallEvent>>>,
}

impl NfsServer {
    /// Create a new NFS server. The first instance opens a grace period
    /// like any reboot.
    pub fn new(fs: Arc<dyn Filesystem>, config: NfsConfig) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let tag = next_tag(now.as_secs() as u32);
        let files = Arc::new(FileTable::new());
        let (recalls, events) = RecallDispatcher::new(
            config.recall_workers,
            config.callback_timeout(),
            files.clone(),
        );
        info!(tag, is_mds = config.is_mds, is_ds = config.is_ds, "NFSv4.1 server instance created");
        Self {
            instance: RwLock::new(Instance {
                tag,
                verifier: (now.as_nanos() as u64).to_be_bytes(),
                grace_end: Instant::now() + config.grace_period(),
            }),
            config,
            fs,
            clients: ClientList::new(),
            sessions: DashMap::new(),
            session_counter: AtomicU64::new(1),
            files,
            recalls,
            recall_events: Mutex::new(Some(events)),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &NfsConfig {
        &self.config
    }

    /// Exported filesystem
    pub fn filesystem(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    /// Tag fencing clientids and stateids to this instance
    pub fn instance_tag(&self) -> u32 {
        self.instance.read().tag
    }

    /// WRITE verifier, changes on reboot
    pub fn write_verifier(&self) -> [u8; 8] {
        self.instance.read().verifier
    }

    /// Check if the reclaim window is still open
    pub fn in_grace(&self) -> bool {
        Instant::now() < self.instance.read().grace_end
    }

    /// End the grace period now
    pub fn end_grace(&self) {
        self.instance.write().grace_end = Instant::now();
    }

    /// Client table
    pub fn clients(&self) -> &ClientList {
        &self.clients
    }

    /// Look up a session
    pub fn session(&self, sessionid: &SessionId) -> Option<Arc<SessionRecord>> {
        self.sessions.get(sessionid).map(|s| s.value().clone())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Recall dispatcher
    pub(crate) fn recalls(&self) -> &RecallDispatcher {
        &self.recalls
    }

    /// Take the stream of recall outcomes. Only the first caller gets it.
    pub fn recall_events(&self) -> Option<mpsc::UnboundedReceiver<RecallEvent>> {
        self.recall_events.lock().take()
    }

    pub(crate) fn next_session_counter(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_session(&self, session: Arc<SessionRecord>) {
        self.sessions.insert(session.sessionid, session);
    }

    pub(crate) fn remove_session(&self, sessionid: &SessionId) -> Option<Arc<SessionRecord>> {
        self.sessions.remove(sessionid).map(|(_, s)| s)
    }

    /// Resolve a clientid, fencing ids from earlier instances
    pub fn lookup_client(&self, clientid: ClientId) -> NfsResult<Arc<ClientRecord>> {
        if clientid_tag(clientid) != self.instance_tag() {
            return Err(NfsStatus::StaleClientid.into());
        }
        self.clients
            .get(clientid)
            .ok_or_else(|| NfsStatus::StaleClientid.into())
    }

    /// State of `object` with its tables locked, created on first use
    pub fn lock_file_state(&self, object: &Arc<dyn FsObject>) -> (Arc<FileState>, TablesGuard) {
        self.files.lock(object)
    }

    pub(crate) fn files(&self) -> &FileTable {
        &self.files
    }

    /// Number of files whose state is tracked
    pub fn tracked_files(&self) -> usize {
        self.files.len()
    }

    /// Drop a file's state once nothing uses it, destroying the object if
    /// it was unlinked
    pub(crate) fn release_file(&self, file: &Arc<FileState>) {
        self.files.release(file);
    }

    /// Drop every piece of state `client` holds. The client is fenced
    /// first, so nothing can add state behind the drain.
    pub(crate) fn revoke_client_state(&self, client: &ClientRecord) {
        for handle in client.revoke() {
            let Some(file) = handle.file() else {
                continue;
            };
            {
                let mut tables = file.lock();
                let current = tables
                    .entry(&handle.key)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.handle, &handle));
                if current {
                    tables.remove_entry(&handle.key);
                }
            }
            self.release_file(&file);
        }
    }

    /// Forget a client: its sessions, its state and its record
    pub(crate) fn remove_client(&self, client: &Arc<ClientRecord>) {
        for session in client.sessions() {
            self.sessions.remove(&session.sessionid);
            client.remove_session(&session);
        }
        self.revoke_client_state(client);
        self.clients.remove(client.clientid);
    }

    /// Remove every client whose lease ran out before `now`
    pub fn expire_clients(&self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .clients
            .all()
            .into_iter()
            .filter(|c| c.lease_expired(now))
            .collect();
        for client in &expired {
            info!(clientid = client.clientid, "lease expired");
            self.remove_client(client);
        }
        expired.len()
    }

    /// Run `expire_clients` and drop idle file state every half lease
    /// until the server is dropped
    pub fn spawn_lease_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let server: Weak<Self> = Arc::downgrade(self);
        let period = (self.config.lease_time() / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                let expired = server.expire_clients(Instant::now());
                let released = server.files.prune();
                if expired > 0 || released > 0 {
                    debug!(expired, released, "lease reaper pass");
                }
            }
        })
    }

    /// Simulate a restart: new instance tag, all clients, sessions and
    /// state dropped, grace period reopened
    pub fn reboot(&self) {
        let tag = {
            let mut instance = self.instance.write();
            instance.tag = next_tag(instance.tag);
            instance.verifier = u64::from_be_bytes(instance.verifier)
                .wrapping_add(1)
                .to_be_bytes();
            instance.grace_end = Instant::now() + self.config.grace_period();
            instance.tag
        };
        for client in self.clients.all() {
            self.remove_client(&client);
        }
        self.clients.clear();
        self.sessions.clear();
        self.files.clear();
        warn!(tag, "server rebooted, all state dropped");
    }

    /// Execute a COMPOUND
    pub fn compound(&self, args: &CompoundArgs, ctx: &CallContext) -> CompoundOutcome {
        if args.minor_version != NFS4_MINOR_VERSION {
            let mut reply = CompoundReply::new(args.tag.clone());
            reply.status = NfsStatus::MinorVersMismatch;
            return CompoundOutcome::Executed(reply);
        }
        let Some(first) = args.ops.first() else {
            return CompoundOutcome::Executed(CompoundReply::new(args.tag.clone()));
        };
        match first {
            OpArgs::Sequence(seq) => self.session_compound(args, seq, ctx),
            op if op.allowed_without_session() && args.ops.len() > 1 => {
                single_error(&args.tag, op.op(), NfsStatus::NotOnlyOp)
            }
            OpArgs::CreateSession(create) => self.create_session_compound(args, create, ctx),
            op if op.allowed_without_session() => {
                let mut env = CompoundEnv::new(ctx);
                let mut reply = CompoundReply::new(args.tag.clone());
                reply.add_result(self.dispatch(&mut env, op));
                CompoundOutcome::Executed(reply)
            }
            op => single_error(&args.tag, op.op(), NfsStatus::OpNotInSession),
        }
    }

    fn session_compound(
        &self,
        args: &CompoundArgs,
        seq: &SequenceArgs,
        ctx: &CallContext,
    ) -> CompoundOutcome {
        let op = Nfs4Op::Sequence;
        let Some(session) = self.session(&seq.sessionid) else {
            return single_error(&args.tag, op, NfsStatus::BadSession);
        };
        let Some(slot) = session.fore.slot(seq.slotid).cloned() else {
            return single_error(&args.tag, op, NfsStatus::BadSlot);
        };
        let attrs = session.fore.attrs();
        if args.ops.len() > attrs.max_operations as usize {
            return single_error(&args.tag, op, NfsStatus::TooManyOps);
        }
        if ctx.request_size > attrs.max_request_size {
            return single_error(&args.tag, op, NfsStatus::ReqTooBig);
        }

        // Held until the reply is cached.
        let mut slot = slot.lock();
        match slot.check_seqid(seq.sequenceid) {
            Ok(()) => {}
            Err(NfsError::Replay(cached)) => {
                debug!(slot = seq.slotid, seqid = seq.sequenceid, "answered from replay cache");
                return CompoundOutcome::Replayed(cached);
            }
            Err(e) => return single_error(&args.tag, op, e.status()),
        }

        let sequence = match self.op_sequence(&session, seq) {
            Ok(sequence) => sequence,
            Err(e) => return single_error(&args.tag, op, e.status()),
        };
        let mut env = CompoundEnv::new(ctx);
        env.session = Some(session);

        let mut reply = CompoundReply::new(args.tag.clone());
        reply.add_result(OpReply::ok(op, ResBody::Sequence(sequence.clone())));
        for op_args in &args.ops[1..] {
            let result = match op_args {
                OpArgs::Sequence(_) => OpReply::error(op, NfsStatus::SequencePos),
                OpArgs::CreateSession(_) => {
                    OpReply::error(Nfs4Op::CreateSession, NfsStatus::NotOnlyOp)
                }
                _ => self.dispatch(&mut env, op_args),
            };
            let failed = result.status != NfsStatus::Ok;
            reply.add_result(result);
            if failed {
                break;
            }
        }

        if seq.cachethis || args.ops.len() == 1 {
            slot.cache_reply(reply.encode());
        } else {
            let mut uncached = CompoundReply::new(args.tag.clone());
            uncached.add_result(OpReply::ok(op, ResBody::Sequence(sequence)));
            uncached.add_result(OpReply::error(args.ops[1].op(), NfsStatus::RetryUncachedRep));
            slot.cache_reply(uncached.encode());
        }
        CompoundOutcome::Executed(reply)
    }

    fn create_session_compound(
        &self,
        args: &CompoundArgs,
        create: &CreateSessionArgs,
        ctx: &CallContext,
    ) -> CompoundOutcome {
        let op = Nfs4Op::CreateSession;
        if create.flags & !create_session::MASK != 0 {
            return single_error(&args.tag, op, NfsStatus::Inval);
        }
        let client = match self.lookup_client(create.clientid) {
            Ok(client) => client,
            Err(e) => return single_error(&args.tag, op, e.status()),
        };

        let slot = client.session_replay.clone();
        let mut slot = slot.lock();
        match slot.check_seqid(create.sequence) {
            Ok(()) => {}
            Err(NfsError::Replay(cached)) => return CompoundOutcome::Replayed(cached),
            Err(e) => return single_error(&args.tag, op, e.status()),
        }

        let mut env = CompoundEnv::new(ctx);
        let result = self.op_create_session(&mut env, create, &client);
        let mut reply = CompoundReply::new(args.tag.clone());
        reply.add_result(Self::to_reply(op, result));
        slot.cache_reply(reply.encode());
        CompoundOutcome::Executed(reply)
    }

    fn dispatch(&self, env: &mut CompoundEnv<'_>, args: &OpArgs) -> OpReply {
        let op = args.op();
        let result = match args {
            OpArgs::Sequence(_) => Err(NfsStatus::SequencePos.into()),
            OpArgs::ExchangeId(a) => self.op_exchange_id(env, a),
            OpArgs::CreateSession(_) => Err(NfsStatus::NotOnlyOp.into()),
            OpArgs::DestroySession(id) => self.op_destroy_session(env, id),
            OpArgs::DestroyClientId(id) => self.op_destroy_clientid(env, *id),
            OpArgs::ReclaimComplete { one_fs } => self.op_reclaim_complete(env, *one_fs),
            OpArgs::PutFh(fh) => self.op_putfh(env, fh),
            OpArgs::PutRootFh => self.op_putrootfh(env),
            OpArgs::GetFh => self.op_getfh(env),
            OpArgs::SaveFh => env.save().map(|()| ResBody::Empty),
            OpArgs::RestoreFh => env.restore().map(|()| ResBody::Empty),
            OpArgs::Lookup(name) => self.op_lookup(env, name),
            OpArgs::Open(a) => self.op_open(env, a),
            OpArgs::OpenDowngrade(a) => self.op_open_downgrade(env, a),
            OpArgs::Close(stateid) => self.op_close(env, *stateid),
            OpArgs::Read(a) => self.op_read(env, a),
            OpArgs::Write(a) => self.op_write(env, a),
            OpArgs::SetAttr(a) => self.op_setattr(env, a),
            OpArgs::Lock(a) => self.op_lock(env, a),
            OpArgs::LockT(a) => self.op_lockt(env, a),
            OpArgs::LockU(a) => self.op_locku(env, a),
            OpArgs::DelegReturn(stateid) => self.op_delegreturn(env, *stateid),
            OpArgs::LayoutGet(a) => self.op_layoutget(env, a),
            OpArgs::LayoutCommit(a) => self.op_layoutcommit(env, a),
            OpArgs::LayoutReturn(a) => self.op_layoutreturn(env, a),
            OpArgs::TestStateId(stateids) => self.op_test_stateid(env, stateids),
            OpArgs::FreeStateId(stateid) => self.op_free_stateid(env, *stateid),
            OpArgs::Remove(name) => self.op_remove(env, name),
            OpArgs::Rename { old, new } => self.op_rename(env, old, new),
            OpArgs::Unsupported(_) => Err(NfsStatus::Notsupp.into()),
            OpArgs::Illegal => Err(NfsStatus::OpIllegal.into()),
        };
        Self::to_reply(op, result)
    }

    fn to_reply(op: Nfs4Op, result: NfsResult<ResBody>) -> OpReply {
        match result {
            Ok(body) => OpReply::ok(op, body),
            Err(NfsError::Denied(denied)) => OpReply {
                op,
                status: NfsStatus::Denied,
                body: ResBody::Denied(denied),
            },
            Err(e) => {
                let status = e.status();
                if status == NfsStatus::Serverfault {
                    error!(?op, error = %e, "operation failed");
                } else {
                    debug!(?op, %status, "operation failed");
                }
                let body = match op {
                    Nfs4Op::SetAttr => ResBody::SetAttr(Vec::new()),
                    _ => ResBody::Empty,
                };
                OpReply { op, status, body }
            }
        }
    }
}
