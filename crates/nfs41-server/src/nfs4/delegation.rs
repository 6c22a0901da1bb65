//! Delegation recall
//!
//! When an OPEN (or a WRITE, SETATTR or REMOVE) conflicts with a delegation
//! held by another client, the entry moves to `CbInit` and a recall task is
//! queued here. The triggering request does not wait: it fails with DELAY
//! and the client retries once the delegation has been returned.
//!
//! A recall task never holds the FileState lock across the callback RPC.
//! It locks to move the entry to `CbSent`, sends CB_SEQUENCE + CB_RECALL
//! over the client's back channel, then locks again to record the outcome.
//! Any failure to deliver the recall revokes the delegation, releasing
//! the file like DELEGRETURN does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::seq4_status;
use super::session::SessionRecord;
use super::state::{FileTable, RecallStatus, StateHandle, StateKey};
use super::{ClientId, FileHandle, SessionId, StateId, StateOther};
use crate::error::{NfsError, NfsResult};
use crate::xdr::{XdrDecoder, XdrEncoder};

/// CB_RECALL operation number
pub const OP_CB_RECALL: u32 = 4;
/// CB_SEQUENCE operation number
pub const OP_CB_SEQUENCE: u32 = 11;

/// Server-to-client RPC path bound to a session's back channel
#[async_trait]
pub trait CallbackTransport: Send + Sync + fmt::Debug {
    /// Send an encoded CB_COMPOUND4args to `program` and return the
    /// encoded CB_COMPOUND4res
    async fn cb_compound(&self, program: u32, args: Bytes) -> NfsResult<Bytes>;
}

/// Encode CB_COMPOUND { CB_SEQUENCE, CB_RECALL }
pub fn encode_cb_recall(
    sessionid: &SessionId,
    slot_id: u32,
    seqid: u32,
    highest_slot: u32,
    stateid: &StateId,
    fh: &FileHandle,
) -> Bytes {
    let mut enc = XdrEncoder::new();
    enc.encode_string("");
    enc.encode_u32(1);
    // callback_ident, unused in 4.1
    enc.encode_u32(0);
    enc.encode_u32(2);

    enc.encode_u32(OP_CB_SEQUENCE);
    enc.encode_opaque_fixed(sessionid);
    enc.encode_u32(seqid);
    enc.encode_u32(slot_id);
    enc.encode_u32(highest_slot);
    enc.encode_bool(false);
    enc.encode_u32(0);

    enc.encode_u32(OP_CB_RECALL);
    stateid.encode(&mut enc);
    enc.encode_bool(false);
    fh.encode(&mut enc);
    enc.finish()
}

/// What a client answered to a CB_COMPOUND
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbReply {
    /// Status of the whole compound
    pub status: u32,
    /// The client processed CB_SEQUENCE, so the back channel slot advanced
    pub sequence_ok: bool,
}

/// Decode the parts of a CB_COMPOUND4res the server acts on
pub fn decode_cb_reply(data: &[u8]) -> NfsResult<CbReply> {
    let mut dec = XdrDecoder::new(data);
    let status = dec.decode_u32()?;
    let _tag = dec.decode_opaque()?;
    let count = dec.decode_u32()?;
    let sequence_ok = if count > 0 {
        let op = dec.decode_u32()?;
        let op_status = dec.decode_u32()?;
        op == OP_CB_SEQUENCE && op_status == 0
    } else {
        false
    };
    Ok(CbReply {
        status,
        sequence_ok,
    })
}

/// How a recall ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecallOutcome {
    /// The client acknowledged CB_RECALL
    Received,
    /// The delegation was returned before the recall finished
    AlreadyReturned,
    /// The recall could not be delivered and the delegation was revoked
    Revoked(String),
}

/// Reported once per recall task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallEvent {
    /// Stateid `other` of the delegation
    pub other: StateOther,
    /// Holder
    pub clientid: ClientId,
    /// Result
    pub outcome: RecallOutcome,
}

/// Runs recall tasks on the tokio runtime, at most `workers` at a time
#[derive(Debug)]
pub struct RecallDispatcher {
    permits: Arc<Semaphore>,
    timeout: Duration,
    events: mpsc::UnboundedSender<RecallEvent>,
    files: Arc<FileTable>,
}

impl RecallDispatcher {
    /// Create a dispatcher and the receiver its events go to. Revoked
    /// delegations release their file in `files`.
    pub fn new(
        workers: usize,
        timeout: Duration,
        files: Arc<FileTable>,
    ) -> (Self, mpsc::UnboundedReceiver<RecallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
            events,
            files,
        };
        (dispatcher, rx)
    }

    /// Queue a recall of the delegation behind `handle`. Called with the
    /// FileState lock held, so nothing here may take it.
    pub fn recall(&self, handle: Arc<StateHandle>) {
        let events = self.events.clone();
        let files = self.files.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let permits = self.permits.clone();
                let timeout = self.timeout;
                runtime.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    let outcome = run_recall(&handle, timeout, &files).await;
                    report(&events, &handle, outcome);
                });
            }
            Err(_) => {
                // No runtime to carry the callback: revoke from a plain
                // thread once the caller has dropped the file lock.
                std::thread::spawn(move || {
                    let outcome = revoke(&handle, "no async runtime for callbacks", &files);
                    report(&events, &handle, outcome);
                });
            }
        }
    }
}

fn report(events: &mpsc::UnboundedSender<RecallEvent>, handle: &StateHandle, outcome: RecallOutcome) {
    let event = RecallEvent {
        other: handle.other,
        clientid: handle.key.clientid().unwrap_or_default(),
        outcome,
    };
    // nobody listening is fine
    let _ = events.send(event);
}

async fn run_recall(handle: &Arc<StateHandle>, timeout: Duration, files: &FileTable) -> RecallOutcome {
    match send_recall(handle, timeout).await {
        Ok(true) => mark_received(handle),
        Ok(false) => RecallOutcome::AlreadyReturned,
        Err(e) => {
            warn!(other = ?handle.other, error = %e, "delegation recall failed");
            revoke(handle, &e.to_string(), files)
        }
    }
}

/// Returns false if the delegation went away before the callback was sent
async fn send_recall(handle: &Arc<StateHandle>, timeout: Duration) -> NfsResult<bool> {
    let Some(file) = handle.file() else {
        return Ok(false);
    };
    let client = handle
        .client()
        .ok_or_else(|| NfsError::Callback("client record is gone".into()))?;
    let session: Arc<SessionRecord> = client
        .find_active_cb_session()
        .ok_or_else(|| NfsError::Callback("no session with a back channel".into()))?;
    let transport = session
        .callback()
        .ok_or_else(|| NfsError::Callback("back channel unbound".into()))?;

    let stateid = {
        let mut tables = file.lock();
        if handle.is_invalid() {
            return Ok(false);
        }
        let entry = tables
            .entry_mut(&handle.key)
            .ok_or_else(|| NfsError::Internal("recalled entry missing".into()))?;
        let stateid = entry.cb_id();
        if let Some(deleg) = entry.delegation_mut() {
            deleg.status = RecallStatus::CbSent;
        }
        stateid
    };

    let (slot_id, seqid) = session
        .back
        .choose_slot()
        .ok_or_else(|| NfsError::Callback("no free back channel slot".into()))?;
    let args = encode_cb_recall(
        &session.sessionid,
        slot_id,
        seqid,
        session.back.highest_slot(),
        &stateid,
        &file.object.fh(),
    );
    debug!(clientid = client.clientid, other = ?handle.other, slot = slot_id, seqid, "sending CB_RECALL");

    let result = tokio::time::timeout(timeout, transport.cb_compound(session.cb_program, args)).await;
    let reply = match result {
        Ok(Ok(bytes)) => decode_cb_reply(&bytes),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(NfsError::Callback(format!("no reply within {timeout:?}"))),
    };
    let accepted = reply.as_ref().is_ok_and(|r| r.sequence_ok).then_some(seqid);
    session.back.free_slot(slot_id, accepted);

    let reply = reply?;
    if reply.status != 0 {
        return Err(NfsError::Callback(format!("CB_COMPOUND status {}", reply.status)));
    }
    Ok(true)
}

fn mark_received(handle: &StateHandle) -> RecallOutcome {
    let Some(file) = handle.file() else {
        return RecallOutcome::AlreadyReturned;
    };
    let mut tables = file.lock();
    if handle.is_invalid() {
        return RecallOutcome::AlreadyReturned;
    }
    match tables.entry_mut(&handle.key).and_then(|e| e.delegation_mut()) {
        Some(deleg) => {
            deleg.status = RecallStatus::CbReceived;
            RecallOutcome::Received
        }
        None => RecallOutcome::AlreadyReturned,
    }
}

fn revoke(handle: &StateHandle, reason: &str, files: &FileTable) -> RecallOutcome {
    let Some(file) = handle.file() else {
        return RecallOutcome::AlreadyReturned;
    };
    let StateKey::Delegation(clientid) = handle.key else {
        return RecallOutcome::AlreadyReturned;
    };
    {
        let mut tables = file.lock();
        if handle.is_invalid() || tables.return_delegation(clientid).is_err() {
            return RecallOutcome::AlreadyReturned;
        }
    }
    files.release(&file);
    if let Some(client) = handle.client() {
        client.add_seq_status(seq4_status::RECALLABLE_STATE_REVOKED);
    }
    info!(clientid, other = ?handle.other, reason, "delegation revoked");
    RecallOutcome::Revoked(reason.to_string())
}
