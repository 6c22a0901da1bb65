//! Session slots (exactly-once semantics)
//!
//! A slot remembers the last sequence id it executed and the reply it sent.
//! The caller holds the slot's mutex from `check_seqid` until the reply has
//! been stored with `cache_reply`, so a retransmission that races the
//! original request blocks on the slot and then sees the finished reply.

use bytes::Bytes;
use tracing::debug;

use crate::error::{NfsError, NfsResult, NfsStatus};

/// One sequencing cell of a channel
#[derive(Debug)]
pub struct Slot {
    id: u32,
    seqid: u32,
    replay_cache: Bytes,
    /// Back channel only: a callback is outstanding on this slot
    pub in_use: bool,
}

impl Slot {
    /// Create a slot whose cache holds `default_reply` until first use
    pub fn new(id: u32, default_reply: Bytes) -> Self {
        Self {
            id,
            seqid: 0,
            replay_cache: default_reply,
            in_use: false,
        }
    }

    /// Slot index within its channel
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Last sequence id executed on this slot
    pub fn seqid(&self) -> u32 {
        self.seqid
    }

    /// Server-side sequence check.
    ///
    /// `seqid + 1` starts a new request and advances the slot. The current
    /// seqid is a retransmission and fails with [`NfsError::Replay`] carrying
    /// the cached reply. Anything else is SEQ_MISORDERED.
    pub fn check_seqid(&mut self, seqid: u32) -> NfsResult<()> {
        let expected = self.seqid.wrapping_add(1);
        if seqid == expected {
            self.seqid = expected;
            self.replay_cache = Bytes::new();
            Ok(())
        } else if seqid == self.seqid {
            debug!(slot = self.id, seqid, "replay");
            Err(NfsError::Replay(self.replay_cache.clone()))
        } else {
            debug!(slot = self.id, seqid, expected, "misordered");
            Err(NfsStatus::SeqMisordered.into())
        }
    }

    /// Store the reply for the request that last advanced this slot
    pub fn cache_reply(&mut self, reply: Bytes) {
        self.replay_cache = reply;
    }

    /// Client-side: the seqid to send next on this slot
    pub fn next_seqid(&self) -> u32 {
        self.seqid.wrapping_add(1)
    }

    /// Client-side: record that `seqid` was accepted by the peer
    pub fn finish_call(&mut self, seqid: u32) {
        self.seqid = seqid;
    }
}
