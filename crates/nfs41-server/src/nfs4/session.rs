//! NFSv4.1 session management
//!
//! Sessions provide exactly-once semantics for NFSv4.1 operations.

use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::Channel;
use super::client::ClientRecord;
use super::delegation::CallbackTransport;
use super::SessionId;

/// Build a session id: clientid, then a server-wide counter
pub fn make_session_id(clientid: u64, counter: u64) -> SessionId {
    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&clientid.to_be_bytes());
    id[8..].copy_from_slice(&counter.to_be_bytes());
    id
}

/// NFSv4.1 session
#[derive(Debug)]
pub struct SessionRecord {
    /// Session ID
    pub sessionid: SessionId,
    /// Owning client
    pub client: Arc<ClientRecord>,
    /// Fore channel (client to server)
    pub fore: Channel,
    /// Back channel (server to client)
    pub back: Channel,
    /// RPC program the client listens on for callbacks
    pub cb_program: u32,
    /// CREATE_SESSION flags granted
    pub flags: u32,
    callback: Mutex<Option<Arc<dyn CallbackTransport>>>,
}

impl SessionRecord {
    /// Create a new session
    pub fn new(
        sessionid: SessionId,
        client: Arc<ClientRecord>,
        fore: Channel,
        back: Channel,
        cb_program: u32,
        flags: u32,
    ) -> Self {
        Self {
            sessionid,
            client,
            fore,
            back,
            cb_program,
            flags,
            callback: Mutex::new(None),
        }
    }

    /// Bind a callback path to the back channel
    pub fn bind_backchannel(&self, transport: Arc<dyn CallbackTransport>) {
        *self.callback.lock() = Some(transport);
    }

    /// Check if callbacks can be sent on this session
    pub fn has_backchannel(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Callback path, if bound
    pub fn callback(&self) -> Option<Arc<dyn CallbackTransport>> {
        self.callback.lock().clone()
    }
}
