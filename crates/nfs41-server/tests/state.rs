//! Open, lock and stateid tests through full COMPOUNDs

mod common;

use bytes::Bytes;

use nfs41_server::nfs4::compound::ResBody;
use nfs41_server::nfs4::ops::{
    LockArgs, LockTArgs, LockUArgs, Locker, OpenDowngradeArgs, ReadArgs, WriteArgs, CLOSED_STATEID,
};
use nfs41_server::nfs4::{LockType, ShareAccess, ShareDeny, StableHow, StateId};
use nfs41_server::{NfsStatus, OpArgs};

use common::*;

const R: u32 = ShareAccess::READ.bits();
const W: u32 = ShareAccess::WRITE.bits();
const BOTH: u32 = ShareAccess::BOTH.bits();
const DENY_W: u32 = ShareDeny::WRITE.bits();

fn lookup(name: &str) -> Vec<OpArgs> {
    vec![OpArgs::PutRootFh, OpArgs::Lookup(name.into())]
}

fn with(mut ops: Vec<OpArgs>, op: OpArgs) -> Vec<OpArgs> {
    ops.push(op);
    ops
}

fn read(stateid: StateId) -> OpArgs {
    OpArgs::Read(ReadArgs {
        stateid,
        offset: 0,
        count: 64,
    })
}

fn new_lock(lock_type: LockType, open_stateid: StateId, owner: &str, offset: u64, length: u64) -> OpArgs {
    OpArgs::Lock(LockArgs {
        lock_type,
        reclaim: false,
        offset,
        length,
        locker: Locker::NewOwner {
            open_seqid: 0,
            open_stateid,
            lock_seqid: 0,
            owner: Bytes::copy_from_slice(owner.as_bytes()),
        },
    })
}

/// Deny bits of one client's open block conflicting access by another
#[test]
fn test_share_deny_across_clients() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "a");
    let mut b = TestClient::connect(&server, "b");

    a.open_ok("owner", "shared.txt", BOTH, DENY_W);
    assert_eq!(status(&b.open("owner", "shared.txt", W, 0)), NfsStatus::ShareDenied);
    assert_eq!(status(&b.open("owner", "shared.txt", R, 0)), NfsStatus::Ok);
}

/// Stale seqids are OLD, future ones BAD, zero means current
#[test]
fn test_stateid_seqid_checks() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "seqid");
    let first = a.open_ok("owner", "seq.txt", R, 0).stateid;
    let second = a.open_ok("owner", "seq.txt", R, 0).stateid;
    assert_eq!(first.other, second.other);
    assert_eq!(second.seqid, first.seqid + 1);

    let outcome = a.call(with(lookup("seq.txt"), read(first)));
    assert_eq!(status(&outcome), NfsStatus::OldStateid);

    let zero = StateId::new(0, second.other);
    assert_eq!(status(&a.call(with(lookup("seq.txt"), read(zero)))), NfsStatus::Ok);

    let future = StateId::new(second.seqid + 1, second.other);
    assert_eq!(status(&a.call(with(lookup("seq.txt"), read(future)))), NfsStatus::BadStateid);
}

/// A stateid presented against another file is rejected
#[test]
fn test_stateid_bound_to_its_file() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "files");
    let open = a.open_ok("owner", "one.txt", R, 0);
    a.open_ok("owner2", "two.txt", R, 0);
    let outcome = a.call(with(lookup("two.txt"), read(open.stateid)));
    assert_eq!(status(&outcome), NfsStatus::BadStateid);
}

/// Writing through a read-only open fails OPENMODE
#[test]
fn test_write_needs_write_access() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "mode");
    let open = a.open_ok("owner", "mode.txt", R, 0);
    let write = OpArgs::Write(WriteArgs {
        stateid: open.stateid,
        offset: 0,
        stable: StableHow::FileSync,
        data: Bytes::from_static(b"data"),
    });
    assert_eq!(status(&a.call(with(lookup("mode.txt"), write))), NfsStatus::Openmode);
}

/// Anonymous writes conflict with a deny-write open of another client
#[test]
fn test_anonymous_write_respects_deny() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "deny");
    let mut b = TestClient::connect(&server, "anon");
    a.open_ok("owner", "deny.txt", R, DENY_W);

    let write = OpArgs::Write(WriteArgs {
        stateid: StateId::ANONYMOUS,
        offset: 0,
        stable: StableHow::Unstable,
        data: Bytes::from_static(b"x"),
    });
    assert_eq!(status(&b.call(with(lookup("deny.txt"), write))), NfsStatus::Locked);
}

/// OPEN_DOWNGRADE only returns to modes that were opened on their own
#[test]
fn test_open_downgrade_history() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "down");
    a.open_ok("owner", "down.txt", R, 0);
    let open = a.open_ok("owner", "down.txt", BOTH, 0);

    let downgrade = |stateid, access| {
        OpArgs::OpenDowngrade(OpenDowngradeArgs {
            stateid,
            seqid: 0,
            access: ShareAccess::from_bits(access),
            deny: ShareDeny::NONE,
        })
    };
    let outcome = a.call(with(lookup("down.txt"), downgrade(open.stateid, W)));
    assert_eq!(status(&outcome), NfsStatus::Inval);

    let outcome = a.call(with(lookup("down.txt"), downgrade(open.stateid, R)));
    assert_eq!(status(&outcome), NfsStatus::Ok);
    let downgraded = stateid(body(&outcome, 3));
    assert_eq!(downgraded.seqid, open.stateid.seqid + 1);
}

/// Conflicting locks report the overlapping range and its owner
#[test]
fn test_lock_conflict_reports_denied() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "locker-a");
    let mut b = TestClient::connect(&server, "locker-b");
    let open_a = a.open_ok("owner", "locks.txt", BOTH, 0);
    let open_b = b.open_ok("owner", "locks.txt", BOTH, 0);

    let outcome = a.call(with(
        lookup("locks.txt"),
        new_lock(LockType::WriteLt, open_a.stateid, "lo-a", 0, 100),
    ));
    assert_eq!(status(&outcome), NfsStatus::Ok);
    let lock_a = stateid(body(&outcome, 3));

    let outcome = b.call(with(
        lookup("locks.txt"),
        new_lock(LockType::WriteLt, open_b.stateid, "lo-b", 50, 10),
    ));
    assert_eq!(status(&outcome), NfsStatus::Denied);
    let ResBody::Denied(denied) = body(&outcome, 3) else {
        panic!("DENIED without a body");
    };
    assert_eq!((denied.offset, denied.length), (50, 10));
    assert_eq!(denied.lock_type, LockType::WriteLt);
    assert_eq!(denied.owner.clientid, a.clientid);
    assert_eq!(denied.owner.owner, Bytes::from_static(b"lo-a"));

    let test = OpArgs::LockT(LockTArgs {
        lock_type: LockType::ReadLt,
        offset: 90,
        length: 20,
        owner: Bytes::from_static(b"lo-b"),
    });
    assert_eq!(status(&b.call(with(lookup("locks.txt"), test))), NfsStatus::Denied);

    let unlock = OpArgs::LockU(LockUArgs {
        lock_type: LockType::WriteLt,
        seqid: 0,
        stateid: lock_a,
        offset: 0,
        length: u64::MAX,
    });
    assert_eq!(status(&a.call(with(lookup("locks.txt"), unlock))), NfsStatus::Ok);

    let outcome = b.call(with(
        lookup("locks.txt"),
        new_lock(LockType::WriteLt, open_b.stateid, "lo-b", 50, 10),
    ));
    assert_eq!(status(&outcome), NfsStatus::Ok);
}

/// A lock owner never conflicts with itself
#[test]
fn test_same_owner_relocks() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "self");
    let open = a.open_ok("owner", "self.txt", BOTH, 0);
    let outcome = a.call(with(
        lookup("self.txt"),
        new_lock(LockType::ReadLt, open.stateid, "lo", 0, 10),
    ));
    let lock = stateid(body(&outcome, 3));

    let upgrade = OpArgs::Lock(LockArgs {
        lock_type: LockType::WriteLt,
        reclaim: false,
        offset: 5,
        length: 10,
        locker: Locker::Existing {
            lock_stateid: lock,
            lock_seqid: 0,
        },
    });
    let outcome = a.call(with(lookup("self.txt"), upgrade));
    assert_eq!(status(&outcome), NfsStatus::Ok);
    assert_eq!(stateid(body(&outcome, 3)).seqid, lock.seqid + 1);
}

/// Zero-length and overflowing ranges are invalid
#[test]
fn test_lock_range_validation() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "range");
    let open = a.open_ok("owner", "range.txt", BOTH, 0);
    for (offset, length) in [(0, 0), (u64::MAX - 1, 10)] {
        let outcome = a.call(with(
            lookup("range.txt"),
            new_lock(LockType::WriteLt, open.stateid, "lo", offset, length),
        ));
        assert_eq!(status(&outcome), NfsStatus::Inval);
    }
}

/// CLOSE and FREE_STATEID refuse while locks remain
#[test]
fn test_close_and_free_with_locks() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "held");
    let open = a.open_ok("owner", "held.txt", BOTH, 0);
    let outcome = a.call(with(
        lookup("held.txt"),
        new_lock(LockType::WriteLt, open.stateid, "lo", 0, 1),
    ));
    let lock = stateid(body(&outcome, 3));

    let close = OpArgs::Close(open.stateid);
    assert_eq!(status(&a.call(with(lookup("held.txt"), close.clone()))), NfsStatus::LocksHeld);
    assert_eq!(status(&a.call(vec![OpArgs::FreeStateId(lock)])), NfsStatus::LocksHeld);
    assert_eq!(
        status(&a.call(vec![OpArgs::FreeStateId(open.stateid)])),
        NfsStatus::LocksHeld
    );

    let unlock = OpArgs::LockU(LockUArgs {
        lock_type: LockType::WriteLt,
        seqid: 0,
        stateid: lock,
        offset: 0,
        length: 1,
    });
    assert_eq!(status(&a.call(with(lookup("held.txt"), unlock))), NfsStatus::Ok);
    assert_eq!(status(&a.call(vec![OpArgs::FreeStateId(lock)])), NfsStatus::Ok);
    assert_eq!(status(&a.call(vec![OpArgs::FreeStateId(lock)])), NfsStatus::BadStateid);

    let outcome = a.call(with(lookup("held.txt"), close));
    assert_eq!(status(&outcome), NfsStatus::Ok);
    assert_eq!(stateid(body(&outcome, 3)), CLOSED_STATEID);
    assert!(!server.clients().get(a.clientid).unwrap().has_state());
}

/// TEST_STATEID reports each stateid on its own
#[test]
fn test_test_stateid_per_entry() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "tester");
    a.open_ok("owner", "t.txt", R, 0);
    let open = a.open_ok("owner", "t.txt", R, 0).stateid;

    let mut unknown = open;
    unknown.other[11] ^= 0xff;
    let old = StateId::new(open.seqid - 1, open.other);
    let outcome = a.call(vec![OpArgs::TestStateId(vec![
        open,
        old,
        unknown,
        StateId::ANONYMOUS,
    ])]);
    assert_eq!(status(&outcome), NfsStatus::Ok);
    let ResBody::TestStateId(codes) = body(&outcome, 1) else {
        panic!("no TEST_STATEID result");
    };
    assert_eq!(
        codes,
        &vec![
            NfsStatus::Ok,
            NfsStatus::OldStateid,
            NfsStatus::BadStateid,
            NfsStatus::BadStateid,
        ]
    );
}

/// File state is dropped once nothing uses it and rebuilt on the next OPEN
#[test]
fn test_idle_file_state_is_dropped() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "tidy");
    let open = a.open_ok("owner", "tidy.txt", BOTH, 0);
    assert_eq!(server.tracked_files(), 1);

    let close = a.call(with(lookup("tidy.txt"), OpArgs::Close(open.stateid)));
    assert_eq!(status(&close), NfsStatus::Ok);
    assert_eq!(server.tracked_files(), 0);

    let test = OpArgs::LockT(LockTArgs {
        lock_type: LockType::WriteLt,
        offset: 0,
        length: 1,
        owner: Bytes::from_static(b"lo"),
    });
    assert_eq!(status(&a.call(with(lookup("tidy.txt"), test))), NfsStatus::Ok);
    let anonymous = a.call(with(lookup("tidy.txt"), read(StateId::ANONYMOUS)));
    assert_eq!(status(&anonymous), NfsStatus::Ok);
    assert_eq!(server.tracked_files(), 0);

    let again = a.open_ok("other", "tidy.txt", BOTH, ShareDeny::BOTH.bits());
    assert_eq!(server.tracked_files(), 1);
    assert_ne!(again.stateid.other, open.stateid.other);
}

/// REMOVE fails while the file is open deny-write, then destroys it
#[test]
fn test_remove_open_file() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "holder");
    let mut b = TestClient::connect(&server, "remover");
    let open = a.open_ok("owner", "busy.txt", R, DENY_W);

    let remove = vec![OpArgs::PutRootFh, OpArgs::Remove("busy.txt".into())];
    assert_eq!(status(&b.call(remove.clone())), NfsStatus::FileOpen);

    let close = a.call(with(lookup("busy.txt"), OpArgs::Close(open.stateid)));
    assert_eq!(status(&close), NfsStatus::Ok);

    let outcome = b.call(remove);
    assert_eq!(status(&outcome), NfsStatus::Ok);
    let ResBody::Remove(cinfo) = body(&outcome, 2) else {
        panic!("no REMOVE result");
    };
    assert!(cinfo.after > cinfo.before);
    assert_eq!(status(&b.call(lookup("busy.txt"))), NfsStatus::Noent);
}

/// Reads through an open stateid keep working after the name is removed
#[test]
fn test_open_file_survives_remove() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "survivor");
    let outcome = a.open("owner", "gone.txt", R, 0);
    let ResBody::GetFh(fh) = body(&outcome, 3).clone() else {
        panic!("no GETFH result");
    };
    let ResBody::Open(open) = body(&outcome, 2).clone() else {
        panic!("no OPEN result");
    };

    let remove = a.call(vec![OpArgs::PutRootFh, OpArgs::Remove("gone.txt".into())]);
    assert_eq!(status(&remove), NfsStatus::Ok);
    let outcome = a.call(vec![OpArgs::PutFh(fh.clone()), read(open.stateid)]);
    assert_eq!(status(&outcome), NfsStatus::Ok);

    let close = a.call(vec![OpArgs::PutFh(fh.clone()), OpArgs::Close(open.stateid)]);
    assert_eq!(status(&close), NfsStatus::Ok);
    assert_eq!(status(&a.call(vec![OpArgs::PutFh(fh)])), NfsStatus::Stale);
}

/// RENAME over an open target fails; otherwise the source moves
#[test]
fn test_rename() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "renamer");
    let src = a.open_ok("owner", "src.txt", R, 0);
    let dst = a.open_ok("other", "dst.txt", R, DENY_W);
    let rename = vec![
        OpArgs::PutRootFh,
        OpArgs::SaveFh,
        OpArgs::PutRootFh,
        OpArgs::Rename {
            old: "src.txt".into(),
            new: "dst.txt".into(),
        },
    ];
    assert_eq!(status(&a.call(rename.clone())), NfsStatus::FileOpen);

    let close = a.call(with(lookup("dst.txt"), OpArgs::Close(dst.stateid)));
    assert_eq!(status(&close), NfsStatus::Ok);
    assert_eq!(status(&a.call(rename)), NfsStatus::Ok);

    assert_eq!(status(&a.call(lookup("src.txt"))), NfsStatus::Noent);
    let outcome = a.call(with(lookup("dst.txt"), read(src.stateid)));
    assert_eq!(status(&outcome), NfsStatus::Ok);
}

/// RENAME without a saved filehandle
#[test]
fn test_rename_needs_saved_fh() {
    let server = plain_server();
    let mut a = TestClient::connect(&server, "nosave");
    let outcome = a.call(vec![
        OpArgs::PutRootFh,
        OpArgs::Rename {
            old: "a".into(),
            new: "b".into(),
        },
    ]);
    assert_eq!(status(&outcome), NfsStatus::NoFileHandle);
}
