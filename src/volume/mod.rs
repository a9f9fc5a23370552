//! Volume data model: extents, hotspares, range locks and the volume
//! itself. The state machine lives in [`state`].

pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use atomic_enum::atomic_enum;
use bitflags::bitflags;
use tokio::sync::{Mutex, RwLock};

use crate::blockdev::BlockDevice;
use crate::fibril::FibrilPool;
use crate::metadata::{DecodedMetadata, MetadataOps};
use crate::rangelock::RangeLockTable;

pub const HR_MAX_EXTENTS: usize = 16;

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum VolumeState {
    None,
    Optimal,
    Degraded,
    Rebuild,
    Faulty,
}

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ExtentState {
    None,
    Missing,
    Failed,
    Hotspare,
    Invalid,
    Rebuild,
    Online,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFlags: u32 {
        const READ_ONLY  = 1 << 0;
        const NOOP_META  = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Raid0,
    Raid1,
    Raid4,
    Raid5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    None,
    Raid4_0,
    Raid4N,
    Raid5_0R,
    Raid5NR,
    Raid5NC,
}

/// One underlying member device and its state.
pub struct Extent {
    pub dev: Option<Arc<dyn BlockDevice>>,
    pub state: AtomicExtentState,
}

impl Extent {
    pub fn empty() -> Self {
        Self {
            dev: None,
            state: AtomicExtentState::new(ExtentState::None),
        }
    }

    pub fn online(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev: Some(dev),
            state: AtomicExtentState::new(ExtentState::Online),
        }
    }
}

/// A hotspare has the same shape as an extent but isn't yet wired into the array.
pub struct Hotspare {
    pub dev: Arc<dyn BlockDevice>,
}

/// Construction-time parameters for `Control::create`, independent of any
/// IPC framing.
pub struct VolumeConfig {
    pub devname: String,
    pub level: Level,
    pub layout: Layout,
    pub strip_size: u32,
    pub block_size: usize,
    pub extents: Vec<Arc<dyn BlockDevice>>,
    pub noop_meta: bool,
    pub read_strategy: crate::engine::raid1::ReadStrategy,
}

/// Construction-time parameters for `Control::assemble`: a pool of
/// candidate devices that may or may not belong to this volume.
pub struct AssembleConfig {
    pub candidates: Vec<Arc<dyn BlockDevice>>,
}

pub struct Volume {
    pub handle: u64,
    pub devname: String,
    pub level: Level,
    pub layout: Layout,
    pub strip_size: u32,
    pub block_size: usize,
    pub truncated_blkno: u64,
    pub data_offset: u64,
    pub data_blkno: u64,

    pub extents_lock: RwLock<Vec<Extent>>,
    pub hotspare_lock: Mutex<Vec<Hotspare>>,
    pub state: AtomicVolumeState,
    pub states_dirty: AtomicBool,
    pub rebuild_position: AtomicU64,
    pub metadata_counter: AtomicU64,
    pub flags: VolumeFlags,
    pub open_count: AtomicU32,
    pub first_write: AtomicBool,

    pub range_locks: Arc<RangeLockTable>,
    pub fibril_pool: FibrilPool,
    pub md: Mutex<Option<DecodedMetadata>>,
    pub md_ops: Arc<dyn MetadataOps>,
    pub read_strategy: crate::engine::raid1::ReadStrategy,
}

impl Volume {
    pub fn open(&self) {
        self.open_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.open_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.open_count.load(Ordering::Relaxed) > 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.data_blkno
    }

    /// Number of data extents that carry striped client data (excludes the
    /// dedicated parity member for RAID-4/5).
    pub fn data_extent_factor(&self, extent_count: usize) -> u64 {
        match self.level {
            Level::Raid1 => 1,
            Level::Raid0 => extent_count as u64,
            Level::Raid4 | Level::Raid5 => (extent_count as u64).saturating_sub(1),
        }
    }
}
