//! Filesystem collaborator interface
//!
//! The state engine never touches storage directly. Every object a client
//! can name is an [`FsObject`], and filehandles are resolved through a
//! [`Filesystem`]. [`memory::MemFs`] is the in-memory implementation.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{NfsResult, NfsStatus};
use crate::nfs4::FileHandle;
use crate::pnfs::{LayoutCommit, LayoutRequest, LayoutSegment, LayoutType};

pub use memory::MemFs;

/// Filesystem-unique object id
pub type FileId = u64;

/// `delegation_options` bit: READ delegations may be handed out
pub const DELEG_READ: u32 = 0x1;
/// `delegation_options` bit: WRITE delegations may be handed out
pub const DELEG_WRITE: u32 = 0x2;

/// File type (nfs_ftype4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FileType {
    /// Regular file
    Regular = 1,
    /// Directory
    Directory = 2,
    /// Block device
    BlockDevice = 3,
    /// Character device
    CharDevice = 4,
    /// Symbolic link
    SymLink = 5,
    /// Socket
    Socket = 6,
    /// FIFO (named pipe)
    Fifo = 7,
}

impl TryFrom<u32> for FileType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Regular),
            2 => Ok(Self::Directory),
            3 => Ok(Self::BlockDevice),
            4 => Ok(Self::CharDevice),
            5 => Ok(Self::SymLink),
            6 => Ok(Self::Socket),
            7 => Ok(Self::Fifo),
            _ => Err(NfsStatus::BadType),
        }
    }
}

/// One object in the exported filesystem
pub trait FsObject: Send + Sync + fmt::Debug {
    /// Object id, unique within the filesystem
    fn fileid(&self) -> FileId;

    /// Filehandle naming this object
    fn fh(&self) -> FileHandle;

    /// Object type
    fn file_type(&self) -> FileType;

    /// NOTDIR unless this is a directory
    fn check_dir(&self) -> NfsResult<()> {
        match self.file_type() {
            FileType::Directory => Ok(()),
            _ => Err(NfsStatus::Notdir.into()),
        }
    }

    /// ISDIR, SYMLINK or WRONG_TYPE unless this is a regular file
    fn verify_file(&self) -> NfsResult<()> {
        match self.file_type() {
            FileType::Regular => Ok(()),
            FileType::Directory => Err(NfsStatus::Isdir.into()),
            FileType::SymLink => Err(NfsStatus::Symlink.into()),
            _ => Err(NfsStatus::WrongType.into()),
        }
    }

    /// Read up to `count` bytes; the flag is true at end of file
    fn read(&self, offset: u64, count: u32) -> NfsResult<(Bytes, bool)>;

    /// Write `data` at `offset`, returning the count written
    fn write(&self, offset: u64, data: &[u8]) -> NfsResult<u32>;

    /// File size in bytes
    fn size(&self) -> u64;

    /// Truncate or extend
    fn set_size(&self, size: u64) -> NfsResult<()>;

    /// Change attribute
    fn change(&self) -> u64;

    /// Number of directory entries naming this object
    fn numlinks(&self) -> u32;

    /// Look up a name in this directory
    fn lookup(&self, name: &str) -> NfsResult<Arc<dyn FsObject>>;

    /// Create a new object in this directory
    fn create(&self, name: &str, file_type: FileType) -> NfsResult<Arc<dyn FsObject>>;

    /// Add a directory entry for an existing object
    fn link(&self, name: &str, target: &Arc<dyn FsObject>) -> NfsResult<()>;

    /// Remove a directory entry, returning the object it named
    fn unlink(&self, name: &str) -> NfsResult<Arc<dyn FsObject>>;

    /// Check whether a name exists in this directory
    fn exists(&self, name: &str) -> bool;

    /// Flush to stable storage
    fn sync(&self) -> NfsResult<()>;

    /// Release storage of an object with no links and no state
    fn destroy(&self);

    /// Verifier stored by an EXCLUSIVE4_1 create
    fn create_verifier(&self) -> Option<[u8; 8]>;

    /// Store the verifier of an EXCLUSIVE4_1 create
    fn set_create_verifier(&self, verifier: [u8; 8]);

    /// Filesystem id
    fn fsid(&self) -> (u64, u64);

    /// True for a directory without entries
    fn is_empty_dir(&self) -> bool;

    /// Bitmask of [`DELEG_READ`] and [`DELEG_WRITE`]
    fn delegation_options(&self) -> u32;

    /// Layout type this object can hand out, if any
    fn layout_options(&self) -> Option<LayoutType>;

    /// Produce a layout segment for `request`
    fn get_layout(&self, request: &LayoutRequest) -> NfsResult<LayoutSegment>;

    /// Apply a LAYOUTCOMMIT, returning the new size if it changed
    fn commit_layout(&self, commit: &LayoutCommit) -> NfsResult<Option<u64>>;

    /// Called when a metadata server opens the file
    fn layout_open_hook(&self) {}

    /// Called when a metadata server closes the file
    fn layout_close_hook(&self) {}
}

/// Resolves filehandles to objects
pub trait Filesystem: Send + Sync + fmt::Debug {
    /// Root directory
    fn root(&self) -> Arc<dyn FsObject>;

    /// Object named by `fh`: BADHANDLE if malformed, STALE if gone
    fn find(&self, fh: &FileHandle) -> NfsResult<Arc<dyn FsObject>>;
}
