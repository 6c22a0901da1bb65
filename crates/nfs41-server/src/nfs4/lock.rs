//! Byte-range lock engine
//!
//! Ranges are inclusive: `end == u64::MAX` means "to the end of the file".
//! Every lock list handled here belongs to a single (open owner, lock owner)
//! pair; conflict checks across owners live in [`super::state::FileTables`].

use std::fmt;

use crate::error::{NfsResult, NfsStatus};
use crate::xdr::XdrEncoder;

use super::{LockOwner, LockType};

/// Compute the inclusive end of a lock range from LOCK/LOCKT/LOCKU arguments
pub fn lock_end(offset: u64, length: u64) -> NfsResult<u64> {
    match length {
        0 => Err(NfsStatus::Inval.into()),
        u64::MAX => Ok(u64::MAX),
        _ => offset
            .checked_add(length - 1)
            .ok_or_else(|| NfsStatus::Inval.into()),
    }
}

/// Wire length of an inclusive range
fn range_length(start: u64, end: u64) -> u64 {
    if end == u64::MAX {
        u64::MAX
    } else {
        end - start + 1
    }
}

/// A single held lock range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLock {
    /// Lock type
    pub lock_type: LockType,
    /// First byte
    pub start: u64,
    /// Last byte (inclusive)
    pub end: u64,
}

impl ByteLock {
    /// Create a lock covering `start..=end`
    pub fn new(lock_type: LockType, start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self {
            lock_type,
            start,
            end,
        }
    }

    /// Check if this is a write lock
    pub fn is_write(&self) -> bool {
        self.lock_type.is_write()
    }

    /// Returns true if `start..=end` overlaps this lock
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start <= self.end && self.start <= end
    }

    /// Two locks conflict iff they overlap and at least one is a write lock
    pub fn conflicts(&self, other: &ByteLock) -> bool {
        (self.is_write() || other.is_write()) && self.overlaps(other.start, other.end)
    }

    /// Wire length of this lock
    pub fn length(&self) -> u64 {
        range_length(self.start, self.end)
    }

    fn same_kind(&self, other: &ByteLock) -> bool {
        self.is_write() == other.is_write()
    }

    fn adjacent_to(&self, next: &ByteLock) -> bool {
        self.end != u64::MAX && self.end + 1 == next.start
    }
}

/// Detail returned with NFS4ERR_DENIED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenied {
    /// Start of the conflicting range
    pub offset: u64,
    /// Length of the conflicting range
    pub length: u64,
    /// Type of the conflicting lock
    pub lock_type: LockType,
    /// Owner of the conflicting lock
    pub owner: LockOwner,
}

impl LockDenied {
    /// Describe the part of `held` that overlaps `wanted`
    pub fn overlap(held: &ByteLock, wanted: &ByteLock, owner: LockOwner) -> Self {
        let start = held.start.max(wanted.start);
        let end = held.end.min(wanted.end);
        Self {
            offset: start,
            length: range_length(start, end),
            lock_type: held.lock_type,
            owner,
        }
    }

    /// Encode as LOCK4denied
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u64(self.offset);
        enc.encode_u64(self.length);
        enc.encode_u32(self.lock_type as u32);
        self.owner.encode(enc);
    }
}

impl fmt::Display for LockDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client {:#x} ({:?} at {}+{})",
            self.owner.clientid, self.lock_type, self.offset, self.length
        )
    }
}

/// Remove `start..=end` from `locks`, shrinking or splitting any lock
/// that straddles a boundary.
pub fn remove_posix(locks: &mut Vec<ByteLock>, start: u64, end: u64) {
    let mut kept = Vec::with_capacity(locks.len() + 1);
    for lock in locks.drain(..) {
        if !lock.overlaps(start, end) {
            kept.push(lock);
            continue;
        }
        if lock.start < start {
            kept.push(ByteLock::new(lock.lock_type, lock.start, start - 1));
        }
        if end < lock.end {
            kept.push(ByteLock::new(lock.lock_type, end + 1, lock.end));
        }
    }
    *locks = kept;
}

/// Add `new` to `locks` with POSIX semantics: carve out existing coverage,
/// insert, then coalesce adjacent locks of the same kind.
pub fn add_posix(locks: &mut Vec<ByteLock>, new: ByteLock) {
    remove_posix(locks, new.start, new.end);
    locks.push(new);
    locks.sort_by_key(|l| (l.start, l.end));

    let mut merged: Vec<ByteLock> = Vec::with_capacity(locks.len());
    for lock in locks.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.same_kind(&lock) && prev.adjacent_to(&lock) => {
                prev.end = lock.end;
            }
            _ => merged.push(lock),
        }
    }
    *locks = merged;
}

/// Legacy semantics: an overlapping lock must match exactly and is
/// up/downgraded in place; partial overlaps are LOCK_RANGE.
pub fn add_exact(locks: &mut Vec<ByteLock>, new: ByteLock) -> NfsResult<()> {
    for lock in locks.iter_mut() {
        if lock.overlaps(new.start, new.end) {
            if lock.start != new.start || lock.end != new.end {
                return Err(NfsStatus::LockRange.into());
            }
            lock.lock_type = new.lock_type;
            return Ok(());
        }
    }
    locks.push(new);
    Ok(())
}

/// Legacy semantics: only an exact range can be unlocked. The lock type
/// of LOCKU has no effect on the outcome.
pub fn remove_exact(locks: &mut Vec<ByteLock>, start: u64, end: u64) -> NfsResult<()> {
    let pos = locks
        .iter()
        .position(|l| l.start == start && l.end == end)
        .ok_or(NfsStatus::LockRange)?;
    locks.remove(pos);
    Ok(())
}
