//! On-disk metadata abstraction: a capability set every recognized
//! superblock format implements, so the registry and rebuild loop never
//! need to know which format a particular volume happens to use.

pub mod foreign;
pub mod native;
pub mod noop;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::blockdev::BlockDevice;
use crate::error::Result;
use crate::volume::{Layout, Level, Volume};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetadataFlags: u32 {
        const HOTSPARE_SUPPORT = 1 << 0;
        const ALLOW_REBUILD    = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Native,
    Noop,
    Md,
    GeomMirror,
    GeomStripe,
    SoftRaid,
}

/// The fields the core actually consumes out of a decoded superblock,
/// regardless of on-disk format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMetadata {
    pub uuid: [u8; 16],
    pub counter: u64,
    pub level: Level,
    pub layout: Layout,
    pub strip_size: u32,
    pub block_size: u32,
    pub data_offset: u64,
    pub data_blkno: u64,
    pub truncated_blkno: u64,
    pub extent_no: u32,
    pub index: u32,
    pub devname: String,
}

/// One probed candidate: the decoded metadata plus the device it came from.
pub struct Candidate {
    pub dev: std::sync::Arc<dyn BlockDevice>,
    pub meta: DecodedMetadata,
}

#[async_trait]
pub trait MetadataOps: Send + Sync {
    async fn probe(&self, dev: &dyn BlockDevice) -> Result<DecodedMetadata>;

    /// Fills in-memory metadata from a freshly created volume's parameters.
    /// Only the native format supports this; foreign/noop return `NotSupported`.
    fn init_vol2meta(&self, volume: &Volume) -> Result<DecodedMetadata>;

    /// Picks the candidate with the highest counter as primary and marks
    /// every other candidate's expected extent index ONLINE, everything
    /// else (by position) MISSING.
    fn init_meta2vol(&self, candidates: &[Candidate]) -> Result<DecodedMetadata>;

    fn compare_uuids(&self, a: &DecodedMetadata, b: &DecodedMetadata) -> bool {
        a.uuid == b.uuid
    }

    async fn inc_counter(&self, volume: &Volume) -> Result<()>;

    async fn save(&self, volume: &Volume) -> Result<()>;

    async fn save_ext(&self, volume: &Volume, extent_idx: usize) -> Result<()>;

    fn level(&self) -> Option<Level>;
    fn flags(&self) -> MetadataFlags;
    fn kind(&self) -> MetadataKind;
    fn dump(&self, meta: &DecodedMetadata) -> String {
        format!(
            "{:?} uuid={:x?} counter={} level={:?}",
            self.kind(),
            meta.uuid,
            meta.counter,
            meta.level
        )
    }
}
