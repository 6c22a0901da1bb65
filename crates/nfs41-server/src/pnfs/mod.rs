//! pNFS layout types
//!
//! A metadata server hands out layouts that let clients reach data servers
//! directly. The state core only records which segments each client holds
//! on each file. Layout bodies are produced by the filesystem and passed
//! through as opaque XDR.

use bytes::Bytes;

use crate::error::NfsStatus;
use crate::nfs4::StateId;
use crate::xdr::XdrEncoder;

/// layouttype4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LayoutType {
    /// LAYOUT4_NFSV4_1_FILES
    NfsV41Files = 1,
    /// LAYOUT4_OSD2_OBJECTS
    Osd2Objects = 2,
    /// LAYOUT4_BLOCK_VOLUME
    BlockVolume = 3,
    /// LAYOUT4_FLEX_FILES
    FlexFiles = 4,
}

impl TryFrom<u32> for LayoutType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::NfsV41Files),
            2 => Ok(Self::Osd2Objects),
            3 => Ok(Self::BlockVolume),
            4 => Ok(Self::FlexFiles),
            _ => Err(NfsStatus::UnknownLayoutType),
        }
    }
}

/// layoutiomode4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LayoutIoMode {
    /// LAYOUTIOMODE4_READ
    Read = 1,
    /// LAYOUTIOMODE4_RW
    ReadWrite = 2,
    /// LAYOUTIOMODE4_ANY, only meaningful in LAYOUTRETURN
    Any = 3,
}

impl LayoutIoMode {
    /// True if a return with `self` applies to a segment held as `held`
    pub fn returns(self, held: LayoutIoMode) -> bool {
        self == LayoutIoMode::Any || self == held
    }
}

impl TryFrom<u32> for LayoutIoMode {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::ReadWrite),
            3 => Ok(Self::Any),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// deviceid4
pub type DeviceId = [u8; 16];

/// Last byte of `[offset, offset + length)`; a length of `u64::MAX` runs
/// to the end of the file
pub fn range_last(offset: u64, length: u64) -> u64 {
    if length == u64::MAX {
        u64::MAX
    } else {
        offset.saturating_add(length.saturating_sub(1))
    }
}

/// The part of LAYOUTGET the filesystem needs to build a segment
#[derive(Debug, Clone)]
pub struct LayoutRequest {
    /// Requested layout type
    pub layout_type: LayoutType,
    /// Requested iomode, never `Any`
    pub iomode: LayoutIoMode,
    /// First byte
    pub offset: u64,
    /// Byte count, `u64::MAX` to end of file
    pub length: u64,
    /// Shortest segment the client will accept
    pub minlength: u64,
}

/// One granted layout4 range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSegment {
    /// First byte
    pub offset: u64,
    /// `u64::MAX` runs to the end of the file
    pub length: u64,
    /// Read or ReadWrite
    pub iomode: LayoutIoMode,
    /// Type of the body
    pub layout_type: LayoutType,
    /// Type-specific body, already XDR encoded
    pub body: Bytes,
}

impl LayoutSegment {
    /// Last byte covered
    pub fn last(&self) -> u64 {
        range_last(self.offset, self.length)
    }

    /// Shares at least one byte with `[offset, offset + length)`
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        self.offset <= range_last(offset, length) && offset <= self.last()
    }

    /// Lies entirely inside `[offset, offset + length)`
    pub fn within(&self, offset: u64, length: u64) -> bool {
        offset <= self.offset && self.last() <= range_last(offset, length)
    }

    /// Encode as layout4
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u64(self.offset);
        enc.encode_u64(self.length);
        enc.encode_u32(self.iomode as u32);
        enc.encode_u32(self.layout_type as u32);
        enc.encode_opaque(&self.body);
    }
}

/// nfsv4_1_file_layout4 body
#[derive(Debug, Clone)]
pub struct FileLayout {
    /// Device the stripes live on
    pub device_id: DeviceId,
    /// Stripe unit plus the NFL4_UFLG_* bits
    pub nfl_util: u32,
    /// Index of the data server holding the first stripe
    pub first_stripe_index: u32,
    /// Logical offset the striping pattern starts from
    pub pattern_offset: u64,
    /// One handle per data server, or a single shared one
    pub filehandles: Vec<Bytes>,
}

impl FileLayout {
    /// Encode to the opaque layout body
    pub fn encode(&self) -> Bytes {
        let mut enc = XdrEncoder::new();
        enc.encode_opaque_fixed(&self.device_id);
        enc.encode_u32(self.nfl_util);
        enc.encode_u32(self.first_stripe_index);
        enc.encode_u64(self.pattern_offset);
        enc.encode_u32(self.filehandles.len() as u32);
        for fh in &self.filehandles {
            enc.encode_opaque(fh);
        }
        enc.finish()
    }
}

/// LAYOUTCOMMIT as the filesystem sees it
#[derive(Debug, Clone)]
pub struct LayoutCommit {
    /// First byte of the committed range
    pub offset: u64,
    /// Length of the committed range
    pub length: u64,
    /// Reclaim during grace
    pub reclaim: bool,
    /// Layout stateid
    pub stateid: StateId,
    /// Last byte the client wrote through the layout, if it says
    pub last_write_offset: Option<u64>,
    /// loca_layoutupdate body
    pub body: Bytes,
}

/// layoutreturn4
#[derive(Debug, Clone)]
pub enum LayoutReturnType {
    /// Segments of the current file inside the range
    #[allow(missing_docs)]
    File {
        offset: u64,
        length: u64,
        stateid: StateId,
        body: Bytes,
    },
    /// Everything the client holds on the current file's filesystem
    Fsid,
    /// Everything the client holds
    All,
}
