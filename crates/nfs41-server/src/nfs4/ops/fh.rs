//! Filehandle operations

use super::OpResult;
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::FileHandle;
use crate::server::NfsServer;

impl NfsServer {
    // ========================================================================
    // PUTFH - Set current filehandle
    // ========================================================================

    pub(crate) fn op_putfh(&self, env: &mut CompoundEnv<'_>, fh: &FileHandle) -> OpResult {
        let object = self.filesystem().find(fh)?;
        env.set_cfh(object);
        Ok(ResBody::Empty)
    }

    // ========================================================================
    // PUTROOTFH - Set current filehandle to root
    // ========================================================================

    pub(crate) fn op_putrootfh(&self, env: &mut CompoundEnv<'_>) -> OpResult {
        env.set_cfh(self.filesystem().root());
        Ok(ResBody::Empty)
    }

    // ========================================================================
    // GETFH - Get current filehandle
    // ========================================================================

    pub(crate) fn op_getfh(&self, env: &mut CompoundEnv<'_>) -> OpResult {
        Ok(ResBody::GetFh(env.cfh()?.fh()))
    }

    // ========================================================================
    // LOOKUP - Look up a name in the current directory
    // ========================================================================

    pub(crate) fn op_lookup(&self, env: &mut CompoundEnv<'_>, name: &str) -> OpResult {
        let dir = env.cfh()?;
        dir.check_dir()?;
        let object = dir.lookup(name)?;
        env.set_cfh(object);
        Ok(ResBody::Empty)
    }
}
