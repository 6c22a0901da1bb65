//! Delegation grant, recall and revocation

mod common;

use std::sync::Arc;
use std::time::Duration;

use nfs41_server::nfs4::compound::ResBody;
use nfs41_server::nfs4::delegation::{OP_CB_RECALL, OP_CB_SEQUENCE};
use nfs41_server::nfs4::ops::{SetAttrArgs, WriteArgs};
use nfs41_server::nfs4::{seq4_status, DelegationType, ShareAccess, StableHow, StateId};
use nfs41_server::xdr::XdrDecoder;
use nfs41_server::{
    CallbackTransport, MemFs, NfsConfig, NfsServer, NfsStatus, OpArgs, RecallEvent, RecallOutcome,
};
use tokio::sync::mpsc::UnboundedReceiver;

use common::*;

const R: u32 = ShareAccess::READ.bits();
const W: u32 = ShareAccess::WRITE.bits();
const BOTH: u32 = ShareAccess::BOTH.bits();

fn deleg_server() -> (Arc<NfsServer>, UnboundedReceiver<RecallEvent>) {
    let server = server(MemFs::new(), NfsConfig::default());
    let events = server.recall_events().expect("events taken once");
    (server, events)
}

fn lookup(name: &str, op: OpArgs) -> Vec<OpArgs> {
    vec![OpArgs::PutRootFh, OpArgs::Lookup(name.into()), op]
}

async fn next_event(events: &mut UnboundedReceiver<RecallEvent>) -> RecallEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("recall did not finish")
        .expect("event channel closed")
}

fn delegation(res: &nfs41_server::nfs4::ops::OpenRes) -> (DelegationType, StateId) {
    res.delegation.expect("no delegation granted")
}

/// A conflicting OPEN gets DELAY until the holder returns its delegation
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recall_then_delegreturn() {
    let (server, mut events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::default());
    let mut a = TestClient::connect_with(&server, "holder", Some(cb.clone() as Arc<dyn CallbackTransport>));
    let mut b = TestClient::connect(&server, "writer");

    let (deleg_type, deleg) = delegation(&a.open_ok("o", "d.txt", R, 0));
    assert_eq!(deleg_type, DelegationType::Read);

    assert_eq!(status(&b.open("o", "d.txt", W, 0)), NfsStatus::Delay);
    let event = next_event(&mut events).await;
    assert_eq!(event.clientid, a.clientid);
    assert_eq!(event.other, deleg.other);
    assert_eq!(event.outcome, RecallOutcome::Received);

    // Still recalled: retry is delayed, no second callback goes out.
    assert_eq!(status(&b.open("o", "d.txt", W, 0)), NfsStatus::Delay);
    assert_eq!(cb.call_count(), 1);

    let args = cb.calls.lock()[0].clone();
    let mut dec = XdrDecoder::new(&args);
    dec.decode_opaque().unwrap();
    assert_eq!(dec.decode_u32().unwrap(), 1);
    dec.decode_u32().unwrap();
    assert_eq!(dec.decode_u32().unwrap(), 2);
    assert_eq!(dec.decode_u32().unwrap(), OP_CB_SEQUENCE);
    assert_eq!(dec.decode_opaque_fixed(16).unwrap(), a.sessionid.to_vec());
    for _ in 0..3 {
        dec.decode_u32().unwrap();
    }
    dec.decode_bool().unwrap();
    dec.decode_u32().unwrap();
    assert_eq!(dec.decode_u32().unwrap(), OP_CB_RECALL);
    assert_eq!(StateId::decode(&mut dec).unwrap(), StateId::new(0, deleg.other));

    let returned = a.call(lookup("d.txt", OpArgs::DelegReturn(deleg)));
    assert_eq!(status(&returned), NfsStatus::Ok);
    let again = a.call(lookup("d.txt", OpArgs::DelegReturn(deleg)));
    assert_eq!(status(&again), NfsStatus::BadStateid);

    b.open_ok("o", "d.txt", W, 0);
}

/// An undeliverable recall revokes the delegation and tells the holder
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_recall_revokes() {
    let (server, mut events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::failing());
    let mut a = TestClient::connect_with(&server, "flaky", Some(cb.clone() as Arc<dyn CallbackTransport>));
    let mut b = TestClient::connect(&server, "writer");

    let (_, deleg) = delegation(&a.open_ok("o", "r.txt", R, 0));
    assert_eq!(status(&b.open("o", "r.txt", W, 0)), NfsStatus::Delay);

    let event = next_event(&mut events).await;
    assert!(matches!(event.outcome, RecallOutcome::Revoked(_)));
    assert_eq!(cb.call_count(), 1);

    let flags = a.renew();
    assert_ne!(flags & seq4_status::RECALLABLE_STATE_REVOKED, 0);
    assert_eq!(a.renew() & seq4_status::RECALLABLE_STATE_REVOKED, 0);

    let gone = a.call(lookup("r.txt", OpArgs::DelegReturn(deleg)));
    assert_eq!(status(&gone), NfsStatus::BadStateid);
    b.open_ok("o", "r.txt", W, 0);
}

/// Revoking a delegation that was the file's last state releases the file
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revoked_delegation_releases_file() {
    let (server, mut events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::failing());
    let mut a = TestClient::connect_with(&server, "lone", Some(cb as Arc<dyn CallbackTransport>));
    let mut b = TestClient::connect(&server, "writer");

    let open = a.open_ok("o", "lone.txt", R, 0);
    delegation(&open);
    let closed = a.call(lookup("lone.txt", OpArgs::Close(open.stateid)));
    assert_eq!(status(&closed), NfsStatus::Ok);
    assert_eq!(server.tracked_files(), 1);

    assert_eq!(status(&b.open("o", "lone.txt", W, 0)), NfsStatus::Delay);
    let event = next_event(&mut events).await;
    assert!(matches!(event.outcome, RecallOutcome::Revoked(_)));
    assert_eq!(server.tracked_files(), 0);

    b.open_ok("o", "lone.txt", W, 0);
    assert_eq!(server.tracked_files(), 1);
}

/// Without a back channel the holder sees CB_PATH_DOWN and loses the
/// delegation at the first conflict
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_back_channel() {
    let (server, mut events) = deleg_server();
    let mut a = TestClient::connect(&server, "silent");
    let mut b = TestClient::connect(&server, "writer");

    delegation(&a.open_ok("o", "s.txt", R, 0));
    assert_ne!(a.renew() & seq4_status::CB_PATH_DOWN, 0);

    assert_eq!(status(&b.open("o", "s.txt", W, 0)), NfsStatus::Delay);
    let event = next_event(&mut events).await;
    assert!(matches!(event.outcome, RecallOutcome::Revoked(_)));
    b.open_ok("o", "s.txt", W, 0);
}

/// A write delegation is exclusive: even readers trigger a recall
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_delegation_recalled_by_reader() {
    let (server, mut events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::default());
    let mut a = TestClient::connect_with(&server, "wholder", Some(cb as Arc<dyn CallbackTransport>));
    let mut b = TestClient::connect(&server, "reader");

    let (deleg_type, _) = delegation(&a.open_ok("o", "w.txt", BOTH, 0));
    assert_eq!(deleg_type, DelegationType::Write);
    assert_eq!(status(&b.open("o", "w.txt", R, 0)), NfsStatus::Delay);
    assert_eq!(next_event(&mut events).await.outcome, RecallOutcome::Received);
}

/// WRITE, SETATTR and REMOVE by another client recall too
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conflicting_io_recalls() {
    let (server, mut events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::default());
    let mut a = TestClient::connect_with(&server, "reader", Some(cb.clone() as Arc<dyn CallbackTransport>));
    let mut b = TestClient::connect(&server, "other");
    let (_, deleg) = delegation(&a.open_ok("o", "io.txt", R, 0));

    let write = OpArgs::Write(WriteArgs {
        stateid: StateId::ANONYMOUS,
        offset: 0,
        stable: StableHow::Unstable,
        data: bytes::Bytes::from_static(b"x"),
    });
    assert_eq!(status(&b.call(lookup("io.txt", write))), NfsStatus::Delay);
    assert_eq!(next_event(&mut events).await.outcome, RecallOutcome::Received);

    let truncate = OpArgs::SetAttr(SetAttrArgs {
        stateid: StateId::ANONYMOUS,
        size: Some(0),
    });
    assert_eq!(status(&b.call(lookup("io.txt", truncate))), NfsStatus::Delay);
    let remove = vec![OpArgs::PutRootFh, OpArgs::Remove("io.txt".into())];
    assert_eq!(status(&b.call(remove.clone())), NfsStatus::Delay);
    assert_eq!(cb.call_count(), 1);

    assert_eq!(status(&a.call(lookup("io.txt", OpArgs::DelegReturn(deleg)))), NfsStatus::Ok);
    let outcome = b.call(remove);
    assert_eq!(status(&outcome), NfsStatus::Ok);
}

/// A client's own delegation never blocks it
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_own_delegation_does_not_conflict() {
    let (server, _events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::default());
    let mut a = TestClient::connect_with(&server, "solo", Some(cb.clone() as Arc<dyn CallbackTransport>));

    delegation(&a.open_ok("o", "own.txt", R, 0));
    let open = a.open_ok("p", "own.txt", W, 0);
    assert_eq!(open.delegation.map(|d| d.0), Some(DelegationType::Read));
    assert_eq!(cb.call_count(), 0);
}

/// With delegations turned off OPEN never hands one out
#[test]
fn test_delegations_disabled() {
    let mut config = NfsConfig::default();
    config.delegations_enabled = false;
    let server = server(MemFs::new(), config);
    let mut a = TestClient::connect(&server, "none");
    assert!(a.open_ok("o", "n.txt", R, 0).delegation.is_none());
}

/// Outside a tokio runtime a recall cannot be sent and revokes at once
#[test]
fn test_recall_without_runtime_revokes() {
    let (server, mut events) = deleg_server();
    let cb = Arc::new(ScriptedCallback::default());
    let mut a = TestClient::connect_with(&server, "sync", Some(cb.clone() as Arc<dyn CallbackTransport>));
    let mut b = TestClient::connect(&server, "writer");

    delegation(&a.open_ok("o", "sync.txt", R, 0));
    assert_eq!(status(&b.open("o", "sync.txt", W, 0)), NfsStatus::Delay);
    let event = events.blocking_recv().expect("event channel closed");
    assert!(matches!(event.outcome, RecallOutcome::Revoked(_)));
    assert_eq!(cb.call_count(), 0);
    b.open_ok("o", "sync.txt", W, 0);
}

/// DELEGRETURN only accepts delegation stateids
#[test]
fn test_delegreturn_rejects_open_stateid() {
    let (server, _events) = deleg_server();
    let mut a = TestClient::connect(&server, "mixup");
    let open = a.open_ok("o", "mix.txt", R, 0);
    let outcome = a.call(lookup("mix.txt", OpArgs::DelegReturn(open.stateid)));
    assert_eq!(status(&outcome), NfsStatus::BadStateid);
    let ResBody::Empty = body(&outcome, 3) else {
        panic!("error result with a body");
    };
}
