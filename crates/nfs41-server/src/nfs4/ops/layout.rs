//! pNFS layout operations
//!
//! The server only tracks which segments each client holds; layout bodies
//! and commits go to the filesystem. Segments are never merged, and a
//! LAYOUTRETURN only drops the segments its range fully covers.

use bytes::Bytes;
use tracing::debug;

use super::OpResult;
use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::compound::{CompoundEnv, ResBody};
use crate::nfs4::lock::lock_end;
use crate::nfs4::state::EntryKind;
use crate::nfs4::StateId;
use crate::pnfs::{
    LayoutCommit, LayoutIoMode, LayoutRequest, LayoutReturnType, LayoutSegment, LayoutType,
};
use crate::server::NfsServer;
use crate::xdr::XdrEncoder;

// ============================================================================
// LAYOUTGET - Get a layout
// ============================================================================

/// LAYOUTGET arguments
#[derive(Debug, Clone)]
pub struct LayoutGetArgs {
    /// Signal layout availability
    pub signal_avail: bool,
    /// Layout type
    pub layout_type: LayoutType,
    /// I/O mode
    pub iomode: LayoutIoMode,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
    /// Minimum length
    pub minlength: u64,
    /// Open, lock, delegation or layout stateid
    pub stateid: StateId,
    /// Maximum reply size
    pub maxcount: u32,
}

/// LAYOUTGET result
#[derive(Debug, Clone)]
pub struct LayoutGetRes {
    /// Return on close
    pub return_on_close: bool,
    /// Layout stateid
    pub stateid: StateId,
    /// Every segment the client now holds on the file
    pub layouts: Vec<LayoutSegment>,
}

impl LayoutGetRes {
    /// Encode to XDR
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_bool(self.return_on_close);
        self.stateid.encode(enc);
        enc.encode_u32(self.layouts.len() as u32);
        for layout in &self.layouts {
            layout.encode(enc);
        }
    }
}

// ============================================================================
// LAYOUTCOMMIT - Commit writes made through a layout
// ============================================================================

/// LAYOUTCOMMIT arguments
#[derive(Debug, Clone)]
pub struct LayoutCommitArgs {
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
    /// Reclaim after server restart
    pub reclaim: bool,
    /// Layout stateid
    pub stateid: StateId,
    /// Last byte written, if reported
    pub last_write_offset: Option<u64>,
    /// Layout type-specific data
    pub body: Bytes,
}

// ============================================================================
// LAYOUTRETURN - Return layouts
// ============================================================================

/// LAYOUTRETURN arguments
#[derive(Debug, Clone)]
pub struct LayoutReturnArgs {
    /// Reclaim after server restart
    pub reclaim: bool,
    /// Layout type
    pub layout_type: LayoutType,
    /// I/O mode being returned
    pub iomode: LayoutIoMode,
    /// Scope
    pub return_type: LayoutReturnType,
}

impl NfsServer {
    pub(crate) fn op_layoutget(&self, env: &mut CompoundEnv<'_>, args: &LayoutGetArgs) -> OpResult {
        if !self.config().is_mds {
            return Err(NfsStatus::LayoutUnavailable.into());
        }
        let object = env.cfh()?.clone();
        // same range rules as a byte-range lock: the range may end at 2^64
        lock_end(args.offset, args.length)?;
        if args.minlength > args.length {
            return Err(NfsStatus::Inval.into());
        }
        if args.iomode == LayoutIoMode::Any {
            return Err(NfsStatus::BadIomode.into());
        }
        if !env.session()?.has_backchannel() {
            return Err(NfsStatus::LayoutTryLater.into());
        }
        let client = env.client()?.clone();

        let mut guard = self.find_state(env, args.stateid, false, false)?;
        if object.layout_options() != Some(args.layout_type) {
            return Err(NfsStatus::LayoutUnavailable.into());
        }
        let segment = object.get_layout(&LayoutRequest {
            layout_type: args.layout_type,
            iomode: args.iomode,
            offset: args.offset,
            length: args.length,
            minlength: args.minlength,
        })?;
        let (stateid, layouts) = guard.tables().grant_layout(&client, segment)?;
        drop(guard);
        debug!(clientid = client.clientid, ?stateid, segments = layouts.len(), "layout granted");
        Ok(ResBody::LayoutGet(LayoutGetRes {
            return_on_close: false,
            stateid,
            layouts,
        }))
    }

    pub(crate) fn op_layoutcommit(&self, env: &mut CompoundEnv<'_>, args: &LayoutCommitArgs) -> OpResult {
        if args.reclaim && !self.in_grace() {
            return Err(NfsStatus::NoGrace.into());
        }
        let guard = self.find_state(env, args.stateid, false, false)?;
        if !guard.key().is_layout() {
            return Err(NfsStatus::BadStateid.into());
        }
        let writable = guard.entry()?.layout().is_some_and(|layout| {
            layout
                .segments
                .iter()
                .any(|s| s.iomode == LayoutIoMode::ReadWrite && s.overlaps(args.offset, args.length))
        });
        if !writable {
            return Err(NfsStatus::BadLayout.into());
        }
        let new_size = guard.file.object.commit_layout(&LayoutCommit {
            offset: args.offset,
            length: args.length,
            reclaim: args.reclaim,
            stateid: args.stateid,
            last_write_offset: args.last_write_offset,
            body: args.body.clone(),
        })?;
        Ok(ResBody::LayoutCommit(new_size))
    }

    pub(crate) fn op_layoutreturn(&self, env: &mut CompoundEnv<'_>, args: &LayoutReturnArgs) -> OpResult {
        if args.reclaim {
            return Err(NfsStatus::Inval.into());
        }
        match &args.return_type {
            LayoutReturnType::File {
                offset,
                length,
                stateid,
                ..
            } => self.return_file_layout(env, args.iomode, *offset, *length, *stateid),
            LayoutReturnType::Fsid => {
                let fsid = env.cfh()?.fsid();
                self.return_all_layouts(env, Some(fsid))?;
                Ok(ResBody::LayoutReturn(None))
            }
            LayoutReturnType::All => {
                self.return_all_layouts(env, None)?;
                Ok(ResBody::LayoutReturn(None))
            }
        }
    }

    fn return_file_layout(
        &self,
        env: &mut CompoundEnv<'_>,
        iomode: LayoutIoMode,
        offset: u64,
        length: u64,
        stateid: StateId,
    ) -> OpResult {
        let mut guard = self.find_state(env, stateid, false, false)?;
        let key = guard.key().clone();
        if !key.is_layout() {
            return Err(NfsStatus::BadStateid.into());
        }
        let emptied = {
            let EntryKind::Layout(layout) = &mut guard.entry_mut()?.kind else {
                return Err(NfsStatus::BadStateid.into());
            };
            layout
                .segments
                .retain(|s| !(s.within(offset, length) && iomode.returns(s.iomode)));
            layout.segments.is_empty()
        };
        let remaining = if emptied {
            guard.tables().remove_entry(&key);
            None
        } else {
            Some(guard.entry_mut()?.get_id())
        };
        let file = guard.file.clone();
        drop(guard);
        if remaining.is_none() {
            self.release_file(&file);
        }
        Ok(ResBody::LayoutReturn(remaining))
    }

    fn return_all_layouts(&self, env: &CompoundEnv<'_>, fsid: Option<(u64, u64)>) -> NfsResult<()> {
        let client = env.client()?;
        for handle in client.state_handles() {
            if !handle.key.is_layout() {
                continue;
            }
            let Some(file) = handle.file() else {
                continue;
            };
            if fsid.is_some_and(|fsid| file.object.fsid() != fsid) {
                continue;
            }
            {
                let mut tables = file.lock();
                if !handle.is_invalid() {
                    tables.remove_entry(&handle.key);
                }
            }
            self.release_file(&file);
        }
        Ok(())
    }
}
