//! Client and session operations

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::channel::{Channel, ChannelAttrs};
use crate::nfs4::client::{ClientRecord, NewClient};
use crate::nfs4::compound::{default_replay, CompoundEnv, Nfs4Op, ResBody};
use crate::nfs4::session::{make_session_id, SessionRecord};
use crate::nfs4::state::StateKey;
use crate::nfs4::{create_session, exchgid, seq4_status, ClientId, SessionId};
use crate::server::NfsServer;
use crate::xdr::XdrEncoder;

/// Major part of the server owner, shared by every instance
pub const SERVER_OWNER_MAJOR: &[u8] = b"nfs41-server";

// ============================================================================
// SEQUENCE - Session sequencing
// ============================================================================

/// SEQUENCE arguments
#[derive(Debug, Clone)]
pub struct SequenceArgs {
    /// Session ID
    pub sessionid: SessionId,
    /// Sequence ID
    pub sequenceid: u32,
    /// Slot ID
    pub slotid: u32,
    /// Highest slot ID in use
    pub highest_slotid: u32,
    /// Cache this reply
    pub cachethis: bool,
}

/// SEQUENCE result
#[derive(Debug, Clone)]
pub struct SequenceRes {
    /// Session ID
    pub sessionid: SessionId,
    /// Sequence ID
    pub sequenceid: u32,
    /// Slot ID
    pub slotid: u32,
    /// Highest slot ID
    pub highest_slotid: u32,
    /// Target highest slot ID
    pub target_highest_slotid: u32,
    /// Status flags
    pub status_flags: u32,
}

impl SequenceRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_opaque_fixed(&self.sessionid);
        enc.encode_u32(self.sequenceid);
        enc.encode_u32(self.slotid);
        enc.encode_u32(self.highest_slotid);
        enc.encode_u32(self.target_highest_slotid);
        enc.encode_u32(self.status_flags);
    }
}

// ============================================================================
// EXCHANGE_ID - Establish client ID
// ============================================================================

/// EXCHANGE_ID arguments
#[derive(Debug, Clone)]
pub struct ExchangeIdArgs {
    /// Client boot verifier
    pub verifier: [u8; 8],
    /// Client owner ID
    pub ownerid: Bytes,
    /// Flags
    pub flags: u32,
}

/// EXCHANGE_ID result
#[derive(Debug, Clone)]
pub struct ExchangeIdRes {
    /// Client ID
    pub clientid: ClientId,
    /// Sequence ID to use in CREATE_SESSION
    pub sequenceid: u32,
    /// Flags
    pub flags: u32,
    /// Server owner minor ID
    pub server_owner_minor: u64,
    /// Server owner major ID
    pub server_owner_major: Bytes,
    /// Server scope
    pub server_scope: Bytes,
}

impl ExchangeIdRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u64(self.clientid);
        enc.encode_u32(self.sequenceid);
        enc.encode_u32(self.flags);
        // eir_state_protect: SP4_NONE
        enc.encode_u32(0);
        enc.encode_u64(self.server_owner_minor);
        enc.encode_opaque(&self.server_owner_major);
        enc.encode_opaque(&self.server_scope);
        // eir_server_impl_id<1>: empty
        enc.encode_u32(0);
    }
}

// ============================================================================
// CREATE_SESSION - Create a session
// ============================================================================

/// CREATE_SESSION arguments
#[derive(Debug, Clone)]
pub struct CreateSessionArgs {
    /// Client ID
    pub clientid: ClientId,
    /// Sequence ID
    pub sequence: u32,
    /// Flags
    pub flags: u32,
    /// Fore channel attributes
    pub fore: ChannelAttrs,
    /// Back channel attributes
    pub back: ChannelAttrs,
    /// Callback program
    pub cb_program: u32,
}

/// CREATE_SESSION result
#[derive(Debug, Clone)]
pub struct CreateSessionRes {
    /// Session ID
    pub sessionid: SessionId,
    /// Sequence ID
    pub sequence: u32,
    /// Flags
    pub flags: u32,
    /// Fore channel attributes
    pub fore: ChannelAttrs,
    /// Back channel attributes
    pub back: ChannelAttrs,
}

impl CreateSessionRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_opaque_fixed(&self.sessionid);
        enc.encode_u32(self.sequence);
        enc.encode_u32(self.flags);
        self.fore.encode(enc);
        self.back.encode(enc);
    }
}

impl NfsServer {
    /// SEQUENCE once the slot accepted the request: renew the lease and
    /// report pending status flags. A client whose lease ran out is
    /// removed with its sessions and state, and the request fails.
    pub(crate) fn op_sequence(
        &self,
        session: &Arc<SessionRecord>,
        args: &SequenceArgs,
    ) -> NfsResult<SequenceRes> {
        let client = &session.client;
        if client.is_revoked() {
            return Err(NfsStatus::BadSession.into());
        }
        if client.lease_expired(Instant::now()) {
            info!(clientid = client.clientid, "lease expired, removing client");
            self.remove_client(client);
            return Err(NfsStatus::BadSession.into());
        }
        client.renew_lease(self.config().lease_time());

        let mut status_flags = client.take_seq_status();
        let holds_delegation = client
            .state_handles()
            .iter()
            .any(|h| matches!(h.key, StateKey::Delegation(_)));
        if holds_delegation && client.find_active_cb_session().is_none() {
            status_flags |= seq4_status::CB_PATH_DOWN;
        }
        Ok(SequenceRes {
            sessionid: session.sessionid,
            sequenceid: args.sequenceid,
            slotid: args.slotid,
            highest_slotid: args.highest_slotid,
            target_highest_slotid: session.fore.highest_slot(),
            status_flags,
        })
    }

    pub(crate) fn op_exchange_id(&self, env: &mut CompoundEnv<'_>, args: &ExchangeIdArgs) -> OpResult {
        if args.flags & !exchgid::MASK_A != 0 {
            return Err(NfsStatus::Inval.into());
        }
        if args.flags & exchgid::CONFIRMED_R != 0 {
            return Err(NfsStatus::Inval.into());
        }
        let update = args.flags & exchgid::UPD_CONFIRMED_REC_A != 0;
        let principal = env.ctx.principal.clone();
        let new = NewClient {
            ownerid: args.ownerid.clone(),
            verifier: args.verifier,
            principal: principal.clone(),
        };

        let client = match self.clients().by_owner(&args.ownerid) {
            None if update => return Err(NfsStatus::Noent.into()),
            None => self.add_client(new),
            Some(old) if !old.is_confirmed() => {
                if update {
                    return Err(NfsStatus::Noent.into());
                }
                self.remove_client(&old);
                self.add_client(new)
            }
            Some(old) if update => {
                if old.verifier != args.verifier {
                    return Err(NfsStatus::NotSame.into());
                }
                if old.principal() != principal {
                    return Err(NfsStatus::Perm.into());
                }
                old.update(principal);
                old
            }
            Some(old) if old.principal() != principal => {
                return Err(NfsStatus::ClidInuse.into());
            }
            Some(old) if old.verifier != args.verifier => {
                info!(clientid = old.clientid, "client rebooted");
                self.remove_client(&old);
                self.add_client(new)
            }
            Some(old) => old,
        };

        let mut flags = if self.config().is_mds {
            exchgid::USE_PNFS_MDS
        } else {
            exchgid::USE_NON_PNFS
        };
        if self.config().is_ds {
            flags |= exchgid::USE_PNFS_DS;
        }
        let sequenceid = if client.is_confirmed() {
            flags |= exchgid::CONFIRMED_R;
            0
        } else {
            client.session_replay.lock().seqid().wrapping_add(1)
        };
        Ok(ResBody::ExchangeId(ExchangeIdRes {
            clientid: client.clientid,
            sequenceid,
            flags,
            server_owner_minor: u64::from(self.instance_tag()),
            server_owner_major: Bytes::from_static(SERVER_OWNER_MAJOR),
            server_scope: Bytes::from_static(SERVER_OWNER_MAJOR),
        }))
    }

    fn add_client(&self, new: NewClient) -> Arc<ClientRecord> {
        let client = self.clients().add(
            self.instance_tag(),
            new,
            self.config().lease_time(),
            default_replay(Nfs4Op::CreateSession),
        );
        debug!(clientid = client.clientid, "new client");
        client
    }

    /// CREATE_SESSION after the client's replay slot accepted the request
    pub(crate) fn op_create_session(
        &self,
        env: &mut CompoundEnv<'_>,
        args: &CreateSessionArgs,
        client: &Arc<ClientRecord>,
    ) -> OpResult {
        if !client.is_confirmed() {
            if client.principal() != env.ctx.principal {
                return Err(NfsStatus::ClidInuse.into());
            }
            client.confirm();
        }

        let limits = &self.config().limits;
        let sessionid = make_session_id(client.clientid, self.next_session_counter());
        let fore = Channel::new(&args.fore, limits, default_replay(Nfs4Op::Sequence));
        let back = Channel::new(&args.back, limits, Bytes::new());
        let mut flags = 0;
        let callback = env
            .ctx
            .callback
            .clone()
            .filter(|_| args.flags & create_session::CONN_BACK_CHAN != 0);
        if callback.is_some() {
            flags |= create_session::CONN_BACK_CHAN;
        }

        let session = Arc::new(SessionRecord::new(
            sessionid,
            client.clone(),
            fore,
            back,
            args.cb_program,
            flags,
        ));
        if let Some(callback) = callback {
            session.bind_backchannel(callback);
        }
        client.add_session(&session);
        client.renew_lease(self.config().lease_time());
        self.insert_session(session.clone());
        info!(clientid = client.clientid, backchannel = session.has_backchannel(), "session created");

        Ok(ResBody::CreateSession(CreateSessionRes {
            sessionid,
            sequence: args.sequence,
            flags,
            fore: session.fore.attrs().clone(),
            back: session.back.attrs().clone(),
        }))
    }

    pub(crate) fn op_destroy_session(&self, _env: &mut CompoundEnv<'_>, sessionid: &SessionId) -> OpResult {
        let session = self.session(sessionid).ok_or(NfsStatus::BadSession)?;
        self.remove_session(sessionid);
        session.client.remove_session(&session);
        info!(clientid = session.client.clientid, "session destroyed");
        Ok(ResBody::Empty)
    }

    pub(crate) fn op_destroy_clientid(&self, _env: &mut CompoundEnv<'_>, clientid: ClientId) -> OpResult {
        let client = self.lookup_client(clientid)?;
        if !client.sessions().is_empty() || client.has_state() {
            return Err(NfsStatus::ClientidBusy.into());
        }
        self.clients().remove(clientid);
        info!(clientid, "client destroyed");
        Ok(ResBody::Empty)
    }

    pub(crate) fn op_reclaim_complete(&self, env: &mut CompoundEnv<'_>, one_fs: bool) -> OpResult {
        let client = env.client()?;
        if one_fs {
            // Per-filesystem reclaim is not tracked; only the global one ends
            // the client's reclaim window.
            return Ok(ResBody::Empty);
        }
        if !client.set_reclaim_complete() {
            return Err(NfsStatus::CompleteAlready.into());
        }
        Ok(ResBody::Empty)
    }
}
