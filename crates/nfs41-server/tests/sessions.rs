//! Session, slot and client lifecycle tests

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nfs41_server::nfs4::compound::ResBody;
use nfs41_server::nfs4::ops::{OpenClaim, OpenHow, ReadArgs};
use nfs41_server::nfs4::{DelegationType, ShareAccess, ShareDeny};
use nfs41_server::{CompoundArgs, CompoundOutcome, MemFs, NfsConfig, NfsStatus, OpArgs};

use common::*;

const R: u32 = ShareAccess::READ.bits();
const BOTH: u32 = ShareAccess::BOTH.bits();
const DENY_BOTH: u32 = ShareDeny::BOTH.bits();

/// A retransmitted request is answered byte for byte from the slot
#[test]
fn test_slot_replay_is_byte_identical() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "replay");

    let ops = vec![client.next_sequence(true), OpArgs::PutRootFh, OpArgs::GetFh];
    let args = CompoundArgs::new("replay", ops);
    let first = server.compound(&args, &client.ctx);
    assert_eq!(status(&first), NfsStatus::Ok);

    let second = server.compound(&args, &client.ctx);
    assert!(matches!(second, CompoundOutcome::Replayed(_)));
    assert_eq!(second.to_bytes(), first.to_bytes());
}

/// Without cachethis only SEQUENCE survives in the cache
#[test]
fn test_uncached_reply_replays_retry_uncached() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "uncached");

    let ops = vec![client.next_sequence(false), OpArgs::PutRootFh];
    let args = CompoundArgs::new("uncached", ops);
    assert_eq!(status(&server.compound(&args, &client.ctx)), NfsStatus::Ok);

    let again = server.compound(&args, &client.ctx);
    assert!(matches!(again, CompoundOutcome::Replayed(_)));
    assert_eq!(again.status_code(), NfsStatus::RetryUncachedRep as u32);
}

/// Skipping ahead on a slot is misordered; the slot still accepts seqid+1
#[test]
fn test_sequence_misordered() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "misordered");
    client.renew();

    client.seqid += 1;
    let outcome = client.call(Vec::new());
    assert_eq!(status(&outcome), NfsStatus::SeqMisordered);

    client.seqid -= 2;
    let outcome = client.call(Vec::new());
    assert_eq!(status(&outcome), NfsStatus::Ok);
}

/// Unknown sessions and out-of-range slots
#[test]
fn test_bad_session_and_slot() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "bad");

    let mut ops = vec![client.next_sequence(true)];
    if let OpArgs::Sequence(seq) = &mut ops[0] {
        seq.slotid = 1000;
    }
    let outcome = server.compound(&CompoundArgs::new("slot", ops), &client.ctx);
    assert_eq!(status(&outcome), NfsStatus::BadSlot);

    client.sessionid = [0xee; 16];
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::BadSession);
}

/// SEQUENCE anywhere but first fails SEQUENCE_POS
#[test]
fn test_sequence_position() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "pos");
    let seq = client.next_sequence(true);
    client.seqid -= 1;
    let outcome = client.call(vec![seq]);
    assert_eq!(status(&outcome), NfsStatus::SequencePos);
}

/// CREATE_SESSION retransmission replays without a second session
#[test]
fn test_create_session_replay() {
    let server = plain_server();
    let ctx = nfs41_server::CallContext::default();
    let (clientid, sequence) = exchange_id(&server, &ctx, "cs-replay", [2; 8]);

    let args = create_session_args(&ctx, clientid, sequence);
    let first = server.compound(&args, &ctx);
    assert_eq!(status(&first), NfsStatus::Ok);
    let second = server.compound(&args, &ctx);
    assert!(matches!(second, CompoundOutcome::Replayed(_)));
    assert_eq!(second.to_bytes(), first.to_bytes());
    assert_eq!(server.session_count(), 1);

    let stale = create_session_args(&ctx, clientid, sequence.wrapping_sub(1));
    assert_eq!(status(&server.compound(&stale, &ctx)), NfsStatus::SeqMisordered);
}

/// A second EXCHANGE_ID from a confirmed client reports CONFIRMED_R
#[test]
fn test_exchange_id_confirmed_client() {
    let server = plain_server();
    let client = TestClient::connect(&server, "again");
    let outcome = server.compound(
        &CompoundArgs::new(
            "again",
            vec![OpArgs::ExchangeId(nfs41_server::nfs4::ops::ExchangeIdArgs {
                verifier: [1; 8],
                ownerid: bytes::Bytes::from_static(b"again"),
                flags: 0,
            })],
        ),
        &client.ctx,
    );
    let ResBody::ExchangeId(res) = body(&outcome, 0) else {
        panic!("no EXCHANGE_ID result");
    };
    assert_eq!(res.clientid, client.clientid);
    assert_ne!(res.flags & nfs41_server::nfs4::exchgid::CONFIRMED_R, 0);
}

/// DESTROY_CLIENTID refuses while a session exists
#[test]
fn test_destroy_clientid_busy() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "busy");
    let ctx = client.ctx.clone();
    let destroy = CompoundArgs::new("destroy", vec![OpArgs::DestroyClientId(client.clientid)]);
    assert_eq!(status(&server.compound(&destroy, &ctx)), NfsStatus::ClientidBusy);

    let sessionid = client.sessionid;
    let outcome = client.call(vec![OpArgs::DestroySession(sessionid)]);
    assert_eq!(status(&outcome), NfsStatus::Ok);
    assert_eq!(server.session_count(), 0);
    assert_eq!(status(&server.compound(&destroy, &ctx)), NfsStatus::Ok);
    assert!(server.clients().is_empty());
}

/// A SEQUENCE that finds the lease expired removes the client with its
/// state and fails; the lease is not renewed
#[test]
fn test_lazy_lease_expiry_removes_client() {
    let server = server(
        MemFs::new().with_delegation_options(0),
        NfsConfig::default().with_lease_time(1),
    );
    let mut client = TestClient::connect(&server, "lazy");
    let open = client.open_ok("o", "lazy.txt", BOTH, DENY_BOTH);
    let old = client.clientid;

    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::BadSession);
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::BadSession);
    let err = server.lookup_client(old).unwrap_err();
    assert_eq!(err.status(), NfsStatus::StaleClientid);
    assert!(server.clients().is_empty());
    assert_eq!(server.session_count(), 0);
    assert_eq!(server.tracked_files(), 0);

    let ctx = client.ctx.clone();
    let fenced = create_session_args(&ctx, old, 1);
    assert_eq!(status(&server.compound(&fenced, &ctx)), NfsStatus::StaleClientid);

    let mut client = TestClient::connect(&server, "lazy");
    assert_ne!(client.clientid, old);
    let read = client.call(vec![
        OpArgs::PutRootFh,
        OpArgs::Lookup("lazy.txt".into()),
        OpArgs::Read(ReadArgs {
            stateid: open.stateid,
            offset: 0,
            count: 16,
        }),
    ]);
    assert_eq!(status(&read), NfsStatus::BadStateid);
    // the old deny-both share is gone
    client.open_ok("o", "lazy.txt", BOTH, DENY_BOTH);
}

/// The reaper removes expired clients outright
#[test]
fn test_expire_clients_removes_records() {
    let server = server(MemFs::new(), NfsConfig::default());
    let mut client = TestClient::connect(&server, "reaped");
    client.open_ok("o", "reaped.txt", R, 0);

    assert_eq!(server.expire_clients(Instant::now()), 0);
    let removed = server.expire_clients(Instant::now() + Duration::from_secs(120));
    assert_eq!(removed, 1);
    assert!(server.clients().is_empty());
    assert_eq!(server.session_count(), 0);
    assert_eq!(server.tracked_files(), 0);
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::BadSession);
}

/// Opens racing with revocation on another slot either land before the
/// drain and are revoked with the rest, or fail; none survive it
#[test]
fn test_revocation_fences_concurrent_opens() {
    let server = plain_server();
    let client = TestClient::connect(&server, "racer");
    let record = server.clients().get(client.clientid).unwrap();
    let opened = Arc::new(AtomicUsize::new(0));

    let opener = {
        let mut racer = client.on_slot(1);
        let opened = opened.clone();
        std::thread::spawn(move || {
            let mut attempted = 0;
            loop {
                let outcome = racer.open("o", &format!("race{attempted}"), BOTH, DENY_BOTH);
                if status(&outcome) != NfsStatus::Ok {
                    return attempted;
                }
                opened.fetch_add(1, Ordering::SeqCst);
                attempted += 1;
            }
        })
    };
    while opened.load(Ordering::SeqCst) < 5 && !opener.is_finished() {
        std::thread::yield_now();
    }

    assert_eq!(server.expire_clients(Instant::now() + Duration::from_secs(120)), 1);
    let attempted = opener.join().unwrap();
    assert!(attempted >= 5);
    assert!(record.is_revoked());
    assert!(!record.has_state());

    let mut successor = TestClient::connect(&server, "successor");
    for i in 0..=attempted {
        successor.open_ok("o", &format!("race{i}"), BOTH, DENY_BOTH);
    }
}

/// After a reboot old ids are stale and only reclaims pass during grace
#[test]
fn test_reboot_fences_old_ids() {
    let server = plain_server();
    let mut client = TestClient::connect(&server, "reboot");
    let open = client.open_ok("o", "kept.txt", R, 0);
    let old_clientid = client.clientid;

    server.reboot();
    assert!(server.in_grace());
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::BadSession);

    let ctx = client.ctx.clone();
    let stale = create_session_args(&ctx, old_clientid, 1);
    assert_eq!(status(&server.compound(&stale, &ctx)), NfsStatus::StaleClientid);

    let mut client = TestClient::connect(&server, "reboot");
    let read = client.call(vec![
        OpArgs::PutRootFh,
        OpArgs::Lookup("kept.txt".into()),
        OpArgs::Read(ReadArgs {
            stateid: open.stateid,
            offset: 0,
            count: 1,
        }),
    ]);
    assert_eq!(status(&read), NfsStatus::StaleStateid);

    assert_eq!(status(&client.open("o", "kept.txt", R, 0)), NfsStatus::Grace);

    let reclaim = client.call(vec![
        OpArgs::PutRootFh,
        OpArgs::Lookup("kept.txt".into()),
        open_args("o", OpenClaim::Previous(DelegationType::None), OpenHow::NoCreate, R, 0),
    ]);
    assert_eq!(status(&reclaim), NfsStatus::Ok);

    let done = client.call(vec![OpArgs::ReclaimComplete { one_fs: false }]);
    assert_eq!(status(&done), NfsStatus::Ok);
    let again = client.call(vec![OpArgs::ReclaimComplete { one_fs: false }]);
    assert_eq!(status(&again), NfsStatus::CompleteAlready);

    let late = client.call(vec![
        OpArgs::PutRootFh,
        OpArgs::Lookup("kept.txt".into()),
        open_args("p", OpenClaim::Previous(DelegationType::None), OpenHow::NoCreate, R, 0),
    ]);
    assert_eq!(status(&late), NfsStatus::NoGrace);
}
