//! Session channels
//!
//! A channel is a fixed array of slots plus the size limits negotiated at
//! CREATE_SESSION. The fore channel carries client requests; the back
//! channel carries server callbacks.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::ClientLimits;
use crate::xdr::XdrEncoder;

use super::slot::Slot;

/// Channel attributes (channel_attrs4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAttrs {
    /// Header padding (for RDMA)
    pub header_pad_size: u32,
    /// Maximum request size
    pub max_request_size: u32,
    /// Maximum response size
    pub max_response_size: u32,
    /// Maximum response size with cached data
    pub max_response_size_cached: u32,
    /// Maximum operations per COMPOUND
    pub max_operations: u32,
    /// Maximum concurrent requests (slot count)
    pub max_requests: u32,
}

impl Default for ChannelAttrs {
    fn default() -> Self {
        Self {
            header_pad_size: 0,
            max_request_size: 1024 * 1024,
            max_response_size: 1024 * 1024,
            max_response_size_cached: 64 * 1024,
            max_operations: 16,
            max_requests: 16,
        }
    }
}

impl ChannelAttrs {
    /// Take client-suggested attributes and adjust them downward
    pub fn adjust(&self, limits: &ClientLimits) -> Self {
        let max_response_size = self.max_response_size.min(limits.max_response_size);
        Self {
            // Header padding is not supported.
            header_pad_size: 0,
            max_request_size: self.max_request_size.min(limits.max_request_size),
            max_response_size,
            max_response_size_cached: self
                .max_response_size_cached
                .min(max_response_size)
                .min(limits.max_response_size_cached),
            max_operations: self.max_operations.min(limits.max_operations),
            max_requests: self.max_requests.min(limits.max_requests).max(1),
        }
    }

    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u32(self.header_pad_size);
        enc.encode_u32(self.max_request_size);
        enc.encode_u32(self.max_response_size);
        enc.encode_u32(self.max_response_size_cached);
        enc.encode_u32(self.max_operations);
        enc.encode_u32(self.max_requests);
        // ca_rdma_ird<1>: empty
        enc.encode_u32(0);
    }
}

/// One direction of a session
#[derive(Debug)]
pub struct Channel {
    attrs: ChannelAttrs,
    slots: Vec<Arc<Mutex<Slot>>>,
}

impl Channel {
    /// Create a channel, adjusting `requested` to the server limits. Every
    /// slot starts with `default_reply` in its replay cache.
    pub fn new(requested: &ChannelAttrs, limits: &ClientLimits, default_reply: Bytes) -> Self {
        let attrs = requested.adjust(limits);
        let slots = (0..attrs.max_requests)
            .map(|id| Arc::new(Mutex::new(Slot::new(id, default_reply.clone()))))
            .collect();
        Self { attrs, slots }
    }

    /// Negotiated attributes
    pub fn attrs(&self) -> &ChannelAttrs {
        &self.attrs
    }

    /// Get a slot by ID
    pub fn slot(&self, slot_id: u32) -> Option<&Arc<Mutex<Slot>>> {
        self.slots.get(slot_id as usize)
    }

    /// Highest valid slot ID
    pub fn highest_slot(&self) -> u32 {
        self.attrs.max_requests.saturating_sub(1)
    }

    /// Back channel: claim a free slot, returning its id and the seqid to send
    pub fn choose_slot(&self) -> Option<(u32, u32)> {
        self.slots.iter().find_map(|slot| {
            let mut slot = slot.lock();
            if slot.in_use {
                None
            } else {
                slot.in_use = true;
                Some((slot.id(), slot.next_seqid()))
            }
        })
    }

    /// Back channel: release a slot, recording the seqid if the peer
    /// processed it
    pub fn free_slot(&self, slot_id: u32, accepted_seqid: Option<u32>) {
        if let Some(slot) = self.slot(slot_id) {
            let mut slot = slot.lock();
            if let Some(seqid) = accepted_seqid {
                slot.finish_call(seqid);
            }
            slot.in_use = false;
        }
    }
}
