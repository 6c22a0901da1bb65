//! Shared helpers for driving an NfsServer through COMPOUNDs

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use nfs41_server::nfs4::channel::ChannelAttrs;
use nfs41_server::nfs4::compound::{CompoundReply, ResBody};
use nfs41_server::nfs4::delegation::OP_CB_SEQUENCE;
use nfs41_server::nfs4::ops::{
    CreateMode, CreateSessionArgs, ExchangeIdArgs, OpenArgs, OpenClaim, OpenHow, OpenRes, SequenceArgs,
};
use nfs41_server::nfs4::{create_session, ClientId, SessionId, ShareAccess, ShareDeny, StateId};
use nfs41_server::xdr::XdrEncoder;
use nfs41_server::{
    CallContext, CallbackTransport, CompoundArgs, CompoundOutcome, MemFs, NfsConfig, NfsError,
    NfsResult, NfsServer, NfsStatus, OpArgs,
};

/// Callback program clients register at CREATE_SESSION
pub const CB_PROGRAM: u32 = 0x4000_0000;

/// Back channel that records every CB_COMPOUND and answers from a script
#[derive(Debug, Default)]
pub struct ScriptedCallback {
    /// Encoded CB_COMPOUND4args received, in order
    pub calls: Mutex<Vec<Bytes>>,
    /// Fail every call as if the connection were gone
    pub fail: bool,
}

impl ScriptedCallback {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CallbackTransport for ScriptedCallback {
    async fn cb_compound(&self, _program: u32, args: Bytes) -> NfsResult<Bytes> {
        self.calls.lock().push(args);
        if self.fail {
            return Err(NfsError::Callback("connection refused".into()));
        }
        let mut enc = XdrEncoder::new();
        enc.encode_u32(0);
        enc.encode_string("");
        enc.encode_u32(2);
        enc.encode_u32(OP_CB_SEQUENCE);
        enc.encode_u32(0);
        Ok(enc.finish())
    }
}

/// Route server logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server over an in-memory filesystem, already out of its grace period
pub fn server(fs: MemFs, config: NfsConfig) -> Arc<NfsServer> {
    init_tracing();
    let server = Arc::new(NfsServer::new(Arc::new(fs), config));
    server.end_grace();
    server
}

/// Server that hands out no delegations
pub fn plain_server() -> Arc<NfsServer> {
    server(MemFs::new().with_delegation_options(0), NfsConfig::default())
}

/// Reply of an executed compound
pub fn reply(outcome: &CompoundOutcome) -> &CompoundReply {
    outcome.reply().expect("compound was answered from the replay cache")
}

/// Status of an executed compound
pub fn status(outcome: &CompoundOutcome) -> NfsStatus {
    reply(outcome).status
}

/// Body of the result at `index`
pub fn body(outcome: &CompoundOutcome, index: usize) -> &ResBody {
    &reply(outcome).results[index].body
}

/// A client with one established session, sending on one slot
pub struct TestClient {
    pub server: Arc<NfsServer>,
    pub ctx: CallContext,
    pub clientid: ClientId,
    pub sessionid: SessionId,
    pub slotid: u32,
    pub seqid: u32,
}

impl TestClient {
    /// EXCHANGE_ID + CREATE_SESSION for `owner`
    pub fn connect(server: &Arc<NfsServer>, owner: &str) -> Self {
        Self::connect_with(server, owner, None)
    }

    /// Same as [`TestClient::connect`], binding `callback` as back channel
    pub fn connect_with(
        server: &Arc<NfsServer>,
        owner: &str,
        callback: Option<Arc<dyn CallbackTransport>>,
    ) -> Self {
        let ctx = CallContext {
            principal: owner.to_string(),
            callback,
            request_size: 0,
        };
        let (clientid, sequence) = exchange_id(server, &ctx, owner, [1; 8]);
        let outcome = server.compound(&create_session_args(&ctx, clientid, sequence), &ctx);
        assert_eq!(status(&outcome), NfsStatus::Ok);
        let ResBody::CreateSession(res) = body(&outcome, 0) else {
            panic!("no CREATE_SESSION result");
        };
        Self {
            server: server.clone(),
            ctx,
            clientid,
            sessionid: res.sessionid,
            slotid: 0,
            seqid: 0,
        }
    }

    /// The same session, sending on `slotid`
    pub fn on_slot(&self, slotid: u32) -> Self {
        Self {
            server: self.server.clone(),
            ctx: self.ctx.clone(),
            clientid: self.clientid,
            sessionid: self.sessionid,
            slotid,
            seqid: 0,
        }
    }

    /// SEQUENCE args for the next request on this client's slot
    pub fn next_sequence(&mut self, cachethis: bool) -> OpArgs {
        self.seqid += 1;
        OpArgs::Sequence(SequenceArgs {
            sessionid: self.sessionid,
            sequenceid: self.seqid,
            slotid: self.slotid,
            highest_slotid: 0,
            cachethis,
        })
    }

    /// Send `ops` behind a fresh SEQUENCE
    pub fn call(&mut self, ops: Vec<OpArgs>) -> CompoundOutcome {
        let mut all = vec![self.next_sequence(true)];
        all.extend(ops);
        self.server.compound(&CompoundArgs::new("test", all), &self.ctx)
    }

    /// SEQUENCE alone, returning its status flags
    pub fn renew(&mut self) -> u32 {
        let outcome = self.call(Vec::new());
        match body(&outcome, 0) {
            ResBody::Sequence(res) => res.status_flags,
            other => panic!("unexpected SEQUENCE body {other:?}"),
        }
    }

    /// OPEN `name` in the root directory, creating it if missing
    pub fn open(&mut self, owner: &str, name: &str, access: u32, deny: u32) -> CompoundOutcome {
        self.call(vec![
            OpArgs::PutRootFh,
            open_args(
                owner,
                OpenClaim::Null(name.to_string()),
                OpenHow::Create(CreateMode::Unchecked),
                access,
                deny,
            ),
            OpArgs::GetFh,
        ])
    }

    /// OPEN that must succeed; returns its result
    pub fn open_ok(&mut self, owner: &str, name: &str, access: u32, deny: u32) -> OpenRes {
        let outcome = self.open(owner, name, access, deny);
        assert_eq!(status(&outcome), NfsStatus::Ok, "OPEN {name} failed");
        match body(&outcome, 2) {
            ResBody::Open(res) => res.clone(),
            other => panic!("unexpected OPEN body {other:?}"),
        }
    }
}

/// EXCHANGE_ID for `owner`, returning (clientid, CREATE_SESSION sequence)
pub fn exchange_id(
    server: &NfsServer,
    ctx: &CallContext,
    owner: &str,
    verifier: [u8; 8],
) -> (ClientId, u32) {
    let args = CompoundArgs::new(
        "exchange_id",
        vec![OpArgs::ExchangeId(ExchangeIdArgs {
            verifier,
            ownerid: Bytes::copy_from_slice(owner.as_bytes()),
            flags: 0,
        })],
    );
    let outcome = server.compound(&args, ctx);
    assert_eq!(status(&outcome), NfsStatus::Ok);
    match body(&outcome, 0) {
        ResBody::ExchangeId(res) => (res.clientid, res.sequenceid),
        other => panic!("unexpected EXCHANGE_ID body {other:?}"),
    }
}

/// CREATE_SESSION compound, asking for a back channel when `ctx` has one
pub fn create_session_args(ctx: &CallContext, clientid: ClientId, sequence: u32) -> CompoundArgs {
    let flags = if ctx.callback.is_some() {
        create_session::CONN_BACK_CHAN
    } else {
        0
    };
    CompoundArgs::new(
        "create_session",
        vec![OpArgs::CreateSession(CreateSessionArgs {
            clientid,
            sequence,
            flags,
            fore: ChannelAttrs::default(),
            back: ChannelAttrs::default(),
            cb_program: CB_PROGRAM,
        })],
    )
}

/// OPEN arguments
pub fn open_args(owner: &str, claim: OpenClaim, how: OpenHow, access: u32, deny: u32) -> OpArgs {
    OpArgs::Open(OpenArgs {
        seqid: 0,
        access: ShareAccess::from_bits(access),
        deny: ShareDeny::from_bits(deny),
        owner: Bytes::copy_from_slice(owner.as_bytes()),
        how,
        claim,
    })
}

/// Stateid from an OPEN_DOWNGRADE, CLOSE, LOCK or LOCKU result
pub fn stateid(body: &ResBody) -> StateId {
    match body {
        ResBody::StateId(stateid) => *stateid,
        other => panic!("expected a stateid, got {other:?}"),
    }
}
