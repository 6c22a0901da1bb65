//! TEST_STATEID and FREE_STATEID
//!
//! Neither needs a current filehandle: the stateid alone names the file.

use std::sync::Arc;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::client::{other_tag, ClientRecord};
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::find::check_seqid;
use crate::nfs4::state::{StateHandle, StateKey};
use crate::nfs4::StateId;
use crate::server::NfsServer;

impl NfsServer {
    /// Look a non-special stateid up in the client's own map
    fn client_handle(&self, client: &ClientRecord, stateid: &StateId) -> NfsResult<Arc<StateHandle>> {
        if stateid.is_special() {
            return Err(NfsStatus::BadStateid.into());
        }
        if other_tag(&stateid.other) != self.instance_tag() {
            return Err(NfsStatus::StaleStateid.into());
        }
        client
            .find_state(&stateid.other)
            .ok_or_else(|| NfsStatus::BadStateid.into())
    }

    fn test_one(&self, client: &ClientRecord, stateid: &StateId) -> NfsResult<()> {
        let handle = self.client_handle(client, stateid)?;
        let file = handle.file().ok_or(NfsStatus::BadStateid)?;
        let tables = file.lock();
        if handle.is_invalid() {
            return Err(NfsStatus::BadStateid.into());
        }
        let entry = tables.entry(&handle.key).ok_or(NfsStatus::BadStateid)?;
        check_seqid(&handle.key, stateid.seqid, entry.seqid)
    }

    // ========================================================================
    // TEST_STATEID - Test stateids for validity
    // ========================================================================

    pub(crate) fn op_test_stateid(&self, env: &mut CompoundEnv<'_>, stateids: &[StateId]) -> OpResult {
        let client = env.client()?;
        let codes = stateids
            .iter()
            .map(|stateid| match self.test_one(client, stateid) {
                Ok(()) => NfsStatus::Ok,
                Err(e) => e.status(),
            })
            .collect();
        Ok(ResBody::TestStateId(codes))
    }

    // ========================================================================
    // FREE_STATEID - Free a stateid with no locks left
    // ========================================================================

    pub(crate) fn op_free_stateid(&self, env: &mut CompoundEnv<'_>, stateid: StateId) -> OpResult {
        let stateid = if stateid == StateId::CURRENT {
            env.current_stateid().ok_or(NfsStatus::BadStateid)?
        } else {
            stateid
        };
        let client = env.client()?.clone();
        let handle = self.client_handle(&client, &stateid)?;
        let file = handle.file().ok_or(NfsStatus::BadStateid)?;
        {
            let mut tables = file.lock();
            if handle.is_invalid() {
                return Err(NfsStatus::BadStateid.into());
            }
            let StateKey::Byte { .. } = handle.key else {
                return Err(NfsStatus::LocksHeld.into());
            };
            let unlocked = tables
                .entry(&handle.key)
                .and_then(|entry| entry.byte())
                .is_some_and(|byte| byte.locks.is_empty());
            if !unlocked {
                return Err(NfsStatus::LocksHeld.into());
            }
            tables.remove_entry(&handle.key);
        }
        self.release_file(&file);
        Ok(ResBody::Empty)
    }
}
