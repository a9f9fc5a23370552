//! Linux MD 1.x superblock recognition (read-only).

use async_trait::async_trait;

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::metadata::{Candidate, DecodedMetadata, MetadataFlags, MetadataKind, MetadataOps};
use crate::pod::{read_pod, Pod};
use crate::volume::{Layout, Level, Volume};

pub const MAGIC: u32 = 0xa92b_4efc;
const OFFSET_BLOCKS: u64 = 8;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawMdSuperblock {
    magic: u32,
    major_version: u32,
    level: u32,
    layout: u32,
    events: u64,
    resync_offset: u64,
    uuid: [u8; 16],
}

// SAFETY: plain integers and a byte array, repr(C), any bit pattern valid.
unsafe impl Pod for RawMdSuperblock {}

fn layout_from_md(level: u32, layout: u32) -> Layout {
    match (level, layout) {
        (5, 0) => Layout::Raid5_0R,
        (5, 3) => Layout::Raid5NC,
        (5, _) => Layout::Raid5NR,
        (4, _) => Layout::Raid4N,
        _ => Layout::None,
    }
}

pub struct MdMetadata;

#[async_trait]
impl MetadataOps for MdMetadata {
    async fn probe(&self, dev: &dyn BlockDevice) -> Result<DecodedMetadata> {
        let bsize = dev.block_size();
        let mut buf = vec![0u8; bsize];
        dev.read(OFFSET_BLOCKS, &mut buf).await?;
        let raw: RawMdSuperblock = read_pod(&buf).ok_or(RaidError::NotFound)?;
        if raw.magic != MAGIC {
            return Err(RaidError::NotFound);
        }
        let level = match raw.level {
            0 => Level::Raid0,
            1 => Level::Raid1,
            4 => Level::Raid4,
            5 => Level::Raid5,
            _ => return Err(RaidError::NotSupported),
        };
        Ok(DecodedMetadata {
            uuid: raw.uuid,
            counter: raw.events,
            level,
            layout: layout_from_md(raw.level, raw.layout),
            strip_size: 0,
            block_size: bsize as u32,
            data_offset: 0,
            data_blkno: 0,
            truncated_blkno: dev.num_blocks(),
            extent_no: 0,
            index: 0,
            devname: String::new(),
        })
    }

    fn init_vol2meta(&self, _volume: &Volume) -> Result<DecodedMetadata> {
        Err(RaidError::NotSupported)
    }

    fn init_meta2vol(&self, candidates: &[Candidate]) -> Result<DecodedMetadata> {
        candidates
            .iter()
            .max_by_key(|c| c.meta.counter)
            .map(|c| c.meta.clone())
            .ok_or(RaidError::NotFound)
    }

    async fn inc_counter(&self, _volume: &Volume) -> Result<()> {
        Ok(())
    }

    async fn save(&self, _volume: &Volume) -> Result<()> {
        Ok(())
    }

    async fn save_ext(&self, _volume: &Volume, _extent_idx: usize) -> Result<()> {
        Ok(())
    }

    fn level(&self) -> Option<Level> {
        None
    }

    fn flags(&self) -> MetadataFlags {
        // MD's resync_offset records in-progress rebuilds, but MD volumes
        // are never assigned a hotspare by this engine.
        MetadataFlags::ALLOW_REBUILD
    }

    fn kind(&self) -> MetadataKind {
        MetadataKind::Md
    }
}
