//! Server behavior driven by configuration knobs

mod common;

use bytes::Bytes;

use nfs41_server::nfs4::ops::{LockArgs, Locker, ReadArgs};
use nfs41_server::nfs4::{LockType, ShareAccess, StateId};
use nfs41_server::{ClientLimits, CompoundArgs, MemFs, NfsConfig, NfsStatus, OpArgs};

use common::*;

const BOTH: u32 = ShareAccess::BOTH.bits();

fn limited(limits: ClientLimits) -> NfsConfig {
    NfsConfig::default().with_limits(limits)
}

/// Compounds longer than the negotiated operation count are refused whole
#[test]
fn test_too_many_ops() {
    let config = limited(ClientLimits {
        max_operations: 2,
        ..ClientLimits::default()
    });
    let server = server(MemFs::new().with_delegation_options(0), config);
    let mut client = TestClient::connect(&server, "chatty");

    assert_eq!(status(&client.call(vec![OpArgs::PutRootFh])), NfsStatus::Ok);
    let outcome = client.call(vec![OpArgs::PutRootFh, OpArgs::GetFh]);
    assert_eq!(status(&outcome), NfsStatus::TooManyOps);
}

/// Oversized requests fail before the slot is touched
#[test]
fn test_request_too_big() {
    let config = limited(ClientLimits {
        max_request_size: 512,
        ..ClientLimits::default()
    });
    let server = server(MemFs::new().with_delegation_options(0), config);
    let mut client = TestClient::connect(&server, "big");

    client.ctx.request_size = 4096;
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::ReqTooBig);

    // The rejected request never consumed its seqid.
    client.ctx.request_size = 0;
    client.seqid -= 1;
    assert_eq!(status(&client.call(Vec::new())), NfsStatus::Ok);
}

/// With the relaxation on, CLOSE drops the owner's locks
#[test]
fn test_close_with_locks_allowed() {
    let config = limited(ClientLimits {
        allow_close_with_locks: true,
        ..ClientLimits::default()
    });
    let server = server(MemFs::new().with_delegation_options(0), config);
    let mut a = TestClient::connect(&server, "lax");
    let open = a.open_ok("owner", "lax.txt", BOTH, 0);

    let lock = OpArgs::Lock(LockArgs {
        lock_type: LockType::WriteLt,
        reclaim: false,
        offset: 0,
        length: 10,
        locker: Locker::NewOwner {
            open_seqid: 0,
            open_stateid: open.stateid,
            lock_seqid: 0,
            owner: Bytes::from_static(b"lo"),
        },
    });
    let lookup = || vec![OpArgs::PutRootFh, OpArgs::Lookup("lax.txt".into())];
    let mut ops = lookup();
    ops.push(lock);
    assert_eq!(status(&a.call(ops)), NfsStatus::Ok);

    let mut ops = lookup();
    ops.push(OpArgs::Close(open.stateid));
    assert_eq!(status(&a.call(ops)), NfsStatus::Ok);
    assert!(!server.clients().get(a.clientid).unwrap().has_state());
}

/// A data server does not check stateids at all
#[test]
fn test_data_server_skips_stateid_checks() {
    let server = server(
        MemFs::new().with_delegation_options(0),
        NfsConfig::default().data_server(),
    );
    let mut a = TestClient::connect(&server, "ds");
    a.open_ok("owner", "stripe", BOTH, 0);

    let read = OpArgs::Read(ReadArgs {
        stateid: StateId::new(7, [9; 12]),
        offset: 0,
        count: 8,
    });
    let outcome = a.call(vec![OpArgs::PutRootFh, OpArgs::Lookup("stripe".into()), read]);
    assert_eq!(status(&outcome), NfsStatus::Ok);
}

/// Only minor version 1 is spoken
#[test]
fn test_minor_version_mismatch() {
    let server = plain_server();
    let mut args = CompoundArgs::new("v40", vec![OpArgs::PutRootFh]);
    args.minor_version = 0;
    let outcome = server.compound(&args, &Default::default());
    assert_eq!(outcome.status_code(), NfsStatus::MinorVersMismatch as u32);
}
