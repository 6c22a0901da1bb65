//! Namespace operations that have to respect open state

use std::sync::Arc;

use tracing::debug;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::fs::{FileType, FsObject};
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::state::FileTables;
use crate::nfs4::{ChangeInfo, ShareAccess};
use crate::server::NfsServer;

fn check_component(name: &str) -> NfsResult<()> {
    if name.is_empty() {
        return Err(NfsStatus::Inval.into());
    }
    if name.contains('/') {
        return Err(NfsStatus::Badchar.into());
    }
    Ok(())
}

impl NfsServer {
    /// Refuse to drop a name while the object is open for writing
    /// elsewhere, recalling delegations other clients hold on it.
    fn check_unlinkable(&self, env: &CompoundEnv<'_>, tables: &mut FileTables) -> NfsResult<()> {
        let clientid = env.client()?.clientid;
        tables.test_share(ShareAccess::WRITE.bits(), 0, NfsStatus::FileOpen)?;
        tables.recall_conflicting(clientid, ShareAccess::WRITE.bits(), 0, self.recalls())
    }

    // ========================================================================
    // REMOVE - Remove a directory entry
    // ========================================================================

    pub(crate) fn op_remove(&self, env: &mut CompoundEnv<'_>, name: &str) -> OpResult {
        let dir = env.cfh()?.clone();
        dir.check_dir()?;
        check_component(name)?;
        let object = dir.lookup(name)?;
        let before = dir.change();

        let (file, mut tables) = self.lock_file_state(&object);
        let unlinked = self
            .check_unlinkable(env, &mut tables)
            .and_then(|()| dir.unlink(name).map(drop));
        drop(tables);
        self.release_file(&file);
        unlinked?;
        dir.sync()?;
        debug!(name, fileid = object.fileid(), "removed");
        Ok(ResBody::Remove(ChangeInfo::new(before, dir.change(), true)))
    }

    // ========================================================================
    // RENAME - Rename a directory entry
    // ========================================================================

    pub(crate) fn op_rename(&self, env: &mut CompoundEnv<'_>, old: &str, new: &str) -> OpResult {
        let from_dir = env.sfh()?.clone();
        let to_dir = env.cfh()?.clone();
        from_dir.check_dir()?;
        to_dir.check_dir()?;
        check_component(old)?;
        check_component(new)?;
        if from_dir.fsid() != to_dir.fsid() {
            return Err(NfsStatus::Xdev.into());
        }

        let from_before = from_dir.change();
        let to_before = to_dir.change();
        let src = from_dir.lookup(old)?;
        let dst = match to_dir.lookup(new) {
            Ok(dst) => Some(dst),
            Err(e) if e.status() == NfsStatus::Noent => None,
            Err(e) => return Err(e),
        };

        match dst {
            Some(dst) if dst.fileid() == src.fileid() => {
                return Ok(ResBody::Rename(
                    ChangeInfo::new(from_before, from_before, true),
                    ChangeInfo::new(to_before, to_before, true),
                ));
            }
            Some(dst) => {
                let compatible = dst.file_type() == src.file_type()
                    && !(dst.file_type() == FileType::Directory && !dst.is_empty_dir());
                if !compatible {
                    return Err(NfsStatus::Exist.into());
                }
                let (src_file, dst_file, src_tables, dst_tables) =
                    self.files().lock_pair(&src, &dst);
                let moved = match dst_tables {
                    Some(mut dst_tables) => self
                        .check_unlinkable(env, &mut dst_tables)
                        .and_then(|()| to_dir.unlink(new).map(drop))
                        .and_then(|()| move_entry(&from_dir, old, &to_dir, new, &src)),
                    None => Err(NfsStatus::Serverfault.into()),
                };
                drop(src_tables);
                self.release_file(&dst_file);
                self.release_file(&src_file);
                moved?;
            }
            None => {
                let (src_file, src_tables) = self.lock_file_state(&src);
                let moved = move_entry(&from_dir, old, &to_dir, new, &src);
                drop(src_tables);
                self.release_file(&src_file);
                moved?;
            }
        }

        debug!(old, new, fileid = src.fileid(), "renamed");
        Ok(ResBody::Rename(
            ChangeInfo::new(from_before, from_dir.change(), true),
            ChangeInfo::new(to_before, to_dir.change(), true),
        ))
    }
}

/// Link under the new name before dropping the old one so the link count
/// never reaches zero in between.
fn move_entry(
    from_dir: &Arc<dyn FsObject>,
    old: &str,
    to_dir: &Arc<dyn FsObject>,
    new: &str,
    object: &Arc<dyn FsObject>,
) -> NfsResult<()> {
    to_dir.link(new, object)?;
    from_dir.unlink(old)?;
    Ok(())
}
