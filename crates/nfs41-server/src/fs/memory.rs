//! In-memory filesystem
//!
//! Objects live in a `DashMap` keyed by file id; a filehandle is the
//! big-endian file id. Used by the test suites and for running the server
//! without a storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::{FileId, FileType, Filesystem, FsObject, DELEG_READ, DELEG_WRITE};
use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::nfs4::FileHandle;
use crate::pnfs::{FileLayout, LayoutCommit, LayoutRequest, LayoutSegment, LayoutType};

/// File id of the root directory
pub const ROOT_ID: FileId = 1;

#[derive(Debug)]
struct Inner {
    nodes: DashMap<FileId, Arc<MemNode>>,
    next_id: AtomicU64,
    fsid: (u64, u64),
    delegation_options: AtomicU32,
    layout_type: RwLock<Option<LayoutType>>,
}

impl Inner {
    fn get(&self, id: FileId) -> NfsResult<Arc<MemNode>> {
        self.nodes
            .get(&id)
            .map(|n| n.clone())
            .ok_or_else(|| NfsStatus::Stale.into())
    }
}

#[derive(Debug, Default)]
struct NodeData {
    contents: Vec<u8>,
    entries: BTreeMap<String, FileId>,
    change: u64,
    nlink: u32,
    verifier: Option<[u8; 8]>,
}

impl NodeData {
    fn bump(&mut self) {
        self.change += 1;
    }
}

/// One object of a [`MemFs`]
#[derive(Debug)]
pub struct MemNode {
    id: FileId,
    kind: FileType,
    fs: Weak<Inner>,
    data: RwLock<NodeData>,
    layout_opens: AtomicU32,
}

impl MemNode {
    fn inner(&self) -> NfsResult<Arc<Inner>> {
        self.fs
            .upgrade()
            .ok_or_else(|| NfsError::Internal("filesystem dropped".into()))
    }

    /// Outstanding `layout_open_hook` calls minus `layout_close_hook` calls
    pub fn layout_opens(&self) -> u32 {
        self.layout_opens.load(Ordering::Relaxed)
    }
}

impl FsObject for MemNode {
    fn fileid(&self) -> FileId {
        self.id
    }

    fn fh(&self) -> FileHandle {
        FileHandle::new(Bytes::copy_from_slice(&self.id.to_be_bytes()))
    }

    fn file_type(&self) -> FileType {
        self.kind
    }

    fn read(&self, offset: u64, count: u32) -> NfsResult<(Bytes, bool)> {
        let data = self.data.read();
        let len = data.contents.len() as u64;
        if offset >= len {
            return Ok((Bytes::new(), true));
        }
        let end = offset.saturating_add(count as u64).min(len);
        let chunk = Bytes::copy_from_slice(&data.contents[offset as usize..end as usize]);
        Ok((chunk, end == len))
    }

    fn write(&self, offset: u64, buf: &[u8]) -> NfsResult<u32> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(NfsStatus::Fbig)?;
        let end = usize::try_from(end).map_err(|_| NfsStatus::Fbig)?;
        let mut data = self.data.write();
        if data.contents.len() < end {
            data.contents.resize(end, 0);
        }
        data.contents[offset as usize..end].copy_from_slice(buf);
        data.bump();
        Ok(buf.len() as u32)
    }

    fn size(&self) -> u64 {
        self.data.read().contents.len() as u64
    }

    fn set_size(&self, size: u64) -> NfsResult<()> {
        self.verify_file()?;
        let size = usize::try_from(size).map_err(|_| NfsStatus::Fbig)?;
        let mut data = self.data.write();
        data.contents.resize(size, 0);
        data.bump();
        Ok(())
    }

    fn change(&self) -> u64 {
        self.data.read().change
    }

    fn numlinks(&self) -> u32 {
        self.data.read().nlink
    }

    fn lookup(&self, name: &str) -> NfsResult<Arc<dyn FsObject>> {
        self.check_dir()?;
        let id = *self.data.read().entries.get(name).ok_or(NfsStatus::Noent)?;
        Ok(self.inner()?.get(id)?)
    }

    fn create(&self, name: &str, file_type: FileType) -> NfsResult<Arc<dyn FsObject>> {
        self.check_dir()?;
        let inner = self.inner()?;
        let mut data = self.data.write();
        if data.entries.contains_key(name) {
            return Err(NfsStatus::Exist.into());
        }
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(MemNode {
            id,
            kind: file_type,
            fs: self.fs.clone(),
            data: RwLock::new(NodeData {
                nlink: 1,
                ..Default::default()
            }),
            layout_opens: AtomicU32::new(0),
        });
        inner.nodes.insert(id, node.clone());
        data.entries.insert(name.to_string(), id);
        data.bump();
        debug!(dir = self.id, name, id, "created");
        Ok(node)
    }

    fn link(&self, name: &str, target: &Arc<dyn FsObject>) -> NfsResult<()> {
        self.check_dir()?;
        let inner = self.inner()?;
        let node = inner.get(target.fileid())?;
        let mut data = self.data.write();
        if data.entries.contains_key(name) {
            return Err(NfsStatus::Exist.into());
        }
        data.entries.insert(name.to_string(), node.id);
        data.bump();
        node.data.write().nlink += 1;
        Ok(())
    }

    fn unlink(&self, name: &str) -> NfsResult<Arc<dyn FsObject>> {
        self.check_dir()?;
        let inner = self.inner()?;
        let mut data = self.data.write();
        let id = *data.entries.get(name).ok_or(NfsStatus::Noent)?;
        let node = inner.get(id)?;
        if node.kind == FileType::Directory && !node.is_empty_dir() {
            return Err(NfsStatus::Notempty.into());
        }
        data.entries.remove(name);
        data.bump();
        {
            let mut target = node.data.write();
            target.nlink = target.nlink.saturating_sub(1);
        }
        Ok(node)
    }

    fn exists(&self, name: &str) -> bool {
        self.data.read().entries.contains_key(name)
    }

    fn sync(&self) -> NfsResult<()> {
        Ok(())
    }

    fn destroy(&self) {
        if let Some(inner) = self.fs.upgrade() {
            debug!(id = self.id, "destroyed");
            inner.nodes.remove(&self.id);
        }
    }

    fn create_verifier(&self) -> Option<[u8; 8]> {
        self.data.read().verifier
    }

    fn set_create_verifier(&self, verifier: [u8; 8]) {
        self.data.write().verifier = Some(verifier);
    }

    fn fsid(&self) -> (u64, u64) {
        self.fs.upgrade().map(|inner| inner.fsid).unwrap_or_default()
    }

    fn is_empty_dir(&self) -> bool {
        self.kind == FileType::Directory && self.data.read().entries.is_empty()
    }

    fn delegation_options(&self) -> u32 {
        match (self.kind, self.fs.upgrade()) {
            (FileType::Regular, Some(inner)) => inner.delegation_options.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    fn layout_options(&self) -> Option<LayoutType> {
        match (self.kind, self.fs.upgrade()) {
            (FileType::Regular, Some(inner)) => *inner.layout_type.read(),
            _ => None,
        }
    }

    fn get_layout(&self, request: &LayoutRequest) -> NfsResult<LayoutSegment> {
        let layout_type = self.layout_options().ok_or(NfsStatus::LayoutUnavailable)?;
        let (major, minor) = self.fsid();
        let mut device_id = [0u8; 16];
        device_id[..8].copy_from_slice(&major.to_be_bytes());
        device_id[8..].copy_from_slice(&minor.to_be_bytes());
        let body = FileLayout {
            device_id,
            nfl_util: 0x1000,
            first_stripe_index: 0,
            pattern_offset: 0,
            filehandles: vec![self.fh().0],
        }
        .encode();
        Ok(LayoutSegment {
            offset: request.offset,
            length: request.length,
            iomode: request.iomode,
            layout_type,
            body,
        })
    }

    fn commit_layout(&self, commit: &LayoutCommit) -> NfsResult<Option<u64>> {
        let Some(last) = commit.last_write_offset else {
            return Ok(None);
        };
        let new_size = last.checked_add(1).ok_or(NfsStatus::Inval)?;
        if new_size <= self.size() {
            return Ok(None);
        }
        self.set_size(new_size)?;
        Ok(Some(new_size))
    }

    fn layout_open_hook(&self) {
        self.layout_opens.fetch_add(1, Ordering::Relaxed);
    }

    fn layout_close_hook(&self) {
        let _ = self
            .layout_opens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// In-memory filesystem
#[derive(Debug, Clone)]
pub struct MemFs {
    inner: Arc<Inner>,
    root: Arc<MemNode>,
}

impl MemFs {
    /// Create an empty filesystem that offers READ and WRITE delegations
    /// and no layouts
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            nodes: DashMap::new(),
            next_id: AtomicU64::new(ROOT_ID + 1),
            fsid: (0x4d45_4d46, 1),
            delegation_options: AtomicU32::new(DELEG_READ | DELEG_WRITE),
            layout_type: RwLock::new(None),
        });
        let root = Arc::new(MemNode {
            id: ROOT_ID,
            kind: FileType::Directory,
            fs: Arc::downgrade(&inner),
            data: RwLock::new(NodeData {
                nlink: 2,
                ..Default::default()
            }),
            layout_opens: AtomicU32::new(0),
        });
        inner.nodes.insert(ROOT_ID, root.clone());
        Self { inner, root }
    }

    /// Restrict the delegations regular files allow
    pub fn with_delegation_options(self, options: u32) -> Self {
        self.inner.delegation_options.store(options, Ordering::Relaxed);
        self
    }

    /// Let regular files hand out layouts of `layout_type`
    pub fn with_layout_type(self, layout_type: LayoutType) -> Self {
        *self.inner.layout_type.write() = Some(layout_type);
        self
    }

    /// Concrete node, for inspecting MemFs-only counters
    pub fn node(&self, id: FileId) -> Option<Arc<MemNode>> {
        self.inner.nodes.get(&id).map(|n| n.clone())
    }

    /// Number of live objects, including the root
    pub fn object_count(&self) -> usize {
        self.inner.nodes.len()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for MemFs {
    fn root(&self) -> Arc<dyn FsObject> {
        self.root.clone()
    }

    fn find(&self, fh: &FileHandle) -> NfsResult<Arc<dyn FsObject>> {
        let raw: [u8; 8] = fh
            .as_bytes()
            .try_into()
            .map_err(|_| NfsStatus::Badhandle)?;
        Ok(self.inner.get(u64::from_be_bytes(raw))?)
    }
}
