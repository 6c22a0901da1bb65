//! Stateid resolution
//!
//! [`NfsServer::find_state`] turns a wire stateid into a [`StateGuard`]:
//! the resolved handle plus the locked tables of its file. The FileState
//! lock is released when the guard drops, on every path.

use std::sync::Arc;

use tracing::debug;

use super::client::other_tag;
use super::compound::CompoundEnv;
use super::state::{AnonKind, FileState, FileTables, StateEntry, StateHandle, StateKey, TablesGuard};
use super::StateId;
use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::server::NfsServer;

/// A resolved stateid with its file's state lock held
pub struct StateGuard {
    /// Resolved handle
    pub handle: Arc<StateHandle>,
    /// File the state belongs to
    pub file: Arc<FileState>,
    tables: TablesGuard,
}

impl std::fmt::Debug for StateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateGuard")
            .field("handle", &self.handle)
            .field("file", &self.file)
            .field("tables", &*self.tables)
            .finish()
    }
}

impl StateGuard {
    /// Key of the resolved entry
    pub fn key(&self) -> &StateKey {
        &self.handle.key
    }

    /// All tables of the file
    pub fn tables(&mut self) -> &mut FileTables {
        &mut self.tables
    }

    /// The resolved entry
    pub fn entry(&self) -> NfsResult<&StateEntry> {
        self.tables
            .entry(&self.handle.key)
            .ok_or_else(|| NfsError::Internal(format!("no entry for {:?}", self.handle.key)))
    }

    /// The resolved entry, mutably
    pub fn entry_mut(&mut self) -> NfsResult<&mut StateEntry> {
        let key = &self.handle.key;
        self.tables
            .entry_mut(key)
            .ok_or_else(|| NfsError::Internal(format!("no entry for {key:?}")))
    }

    /// Check that the resolved state allows `access`
    pub fn check_permission(&mut self, access: u32) -> NfsResult<()> {
        let key = self.handle.key.clone();
        self.tables.check_permission(&key, access)
    }
}

pub(crate) fn check_seqid(key: &StateKey, presented: u32, current: u32) -> NfsResult<()> {
    if key.is_layout() {
        if presented == 0 || presented != current {
            return Err(NfsStatus::BadStateid.into());
        }
        return Ok(());
    }
    if presented == 0 || presented == current {
        return Ok(());
    }
    // seqids wrap, so "older" means within half the space behind
    if current.wrapping_sub(presented) < (1 << 31) {
        Err(NfsStatus::OldStateid.into())
    } else {
        Err(NfsStatus::BadStateid.into())
    }
}

impl NfsServer {
    /// Resolve `stateid` against the current filehandle.
    ///
    /// `allow_0` admits the all-zero stateid. `allow_bypass` lets the
    /// all-ones stateid skip share checks; without it, all-ones behaves
    /// like all-zero.
    pub fn find_state(
        &self,
        env: &CompoundEnv<'_>,
        stateid: StateId,
        allow_0: bool,
        allow_bypass: bool,
    ) -> NfsResult<StateGuard> {
        let object = env.cfh()?;

        if self.config().is_ds {
            let (file, tables) = self.lock_file_state(object);
            let handle = tables.anon(AnonKind::DataServer).handle.clone();
            return Ok(StateGuard {
                handle,
                file,
                tables,
            });
        }

        let stateid = if stateid == StateId::CURRENT {
            env.current_stateid().ok_or(NfsStatus::BadStateid)?
        } else {
            stateid
        };

        if stateid.is_special() {
            let kind = if stateid == StateId::ANONYMOUS {
                AnonKind::Zero
            } else if stateid == StateId::READ_BYPASS {
                if allow_bypass {
                    AnonKind::One
                } else {
                    AnonKind::Zero
                }
            } else {
                return Err(NfsStatus::BadStateid.into());
            };
            if kind == AnonKind::Zero && !allow_0 {
                return Err(NfsStatus::BadStateid.into());
            }
            let (file, tables) = self.lock_file_state(object);
            let handle = tables.anon(kind).handle.clone();
            return Ok(StateGuard {
                handle,
                file,
                tables,
            });
        }

        if other_tag(&stateid.other) != self.instance_tag() {
            return Err(NfsStatus::StaleStateid.into());
        }
        let client = env.client()?;
        let handle = client
            .find_state(&stateid.other)
            .ok_or(NfsStatus::BadStateid)?;
        let (file, tables) = self.lock_file_state(object);
        if !handle.belongs_to(&file) {
            debug!(other = ?stateid.other, "stateid used on another file");
            return Err(NfsStatus::BadStateid.into());
        }
        if handle.is_invalid() {
            return Err(NfsStatus::BadStateid.into());
        }
        let guard = StateGuard {
            handle,
            file,
            tables,
        };
        check_seqid(guard.key(), stateid.seqid, guard.entry()?.seqid)?;
        Ok(guard)
    }
}
