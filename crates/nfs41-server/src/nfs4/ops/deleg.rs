//! DELEGRETURN

use tracing::debug;

use super::OpResult;
use crate::error::NfsStatus;
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::state::StateKey;
use crate::nfs4::StateId;
use crate::server::NfsServer;

impl NfsServer {
    pub(crate) fn op_delegreturn(&self, env: &mut CompoundEnv<'_>, stateid: StateId) -> OpResult {
        let mut guard = self.find_state(env, stateid, false, false)?;
        let StateKey::Delegation(clientid) = *guard.key() else {
            return Err(NfsStatus::BadStateid.into());
        };
        guard.tables().return_delegation(clientid)?;
        let file = guard.file.clone();
        drop(guard);
        debug!(clientid, fileid = file.fileid, "delegation returned");
        self.release_file(&file);
        Ok(ResBody::Empty)
    }
}
