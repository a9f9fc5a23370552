//! FreeBSD GEOM mirror v4 metadata recognition (read-only): the superblock
//! lives in the last block of each member; `md_genid` is the counter,
//! `md_mid` ties members of the same mirror together.

use async_trait::async_trait;

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::metadata::{Candidate, DecodedMetadata, MetadataFlags, MetadataKind, MetadataOps};
use crate::pod::{read_pod, Pod};
use crate::volume::{Layout, Level, Volume};

const MAGIC: &[u8; 16] = b"GEOM::MIRROR\0\0\0\0";

#[repr(C)]
#[derive(Clone, Copy)]
struct RawGMirror {
    magic: [u8; 16],
    md_mid: u32,
    md_genid: u64,
    md_did: u32,
}

// SAFETY: repr(C), plain integers and byte array, any bit pattern valid.
unsafe impl Pod for RawGMirror {}

pub struct GeomMirrorMetadata;

#[async_trait]
impl MetadataOps for GeomMirrorMetadata {
    async fn probe(&self, dev: &dyn BlockDevice) -> Result<DecodedMetadata> {
        let bsize = dev.block_size();
        let last = dev.num_blocks().checked_sub(1).ok_or(RaidError::NotFound)?;
        let mut buf = vec![0u8; bsize];
        dev.read(last, &mut buf).await?;
        let raw: RawGMirror = read_pod(&buf).ok_or(RaidError::NotFound)?;
        if raw.magic != *MAGIC {
            return Err(RaidError::NotFound);
        }
        let mut uuid = [0u8; 16];
        uuid[..4].copy_from_slice(&raw.md_mid.to_le_bytes());
        Ok(DecodedMetadata {
            uuid,
            counter: raw.md_genid,
            level: Level::Raid1,
            layout: Layout::None,
            strip_size: 0,
            block_size: bsize as u32,
            data_offset: 0,
            data_blkno: 0,
            truncated_blkno: dev.num_blocks(),
            extent_no: 0,
            index: raw.md_did,
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
        // Deliberately a no-op, not an error: GEOM mirror volumes stay
        // assembled read-only, and refusing every save would make routine
        // state re-evaluation fail where nothing actually needs persisting.
        Ok(())
    }

    async fn save_ext(&self, _volume: &Volume, _extent_idx: usize) -> Result<()> {
        Ok(())
    }

    fn level(&self) -> Option<Level> {
        Some(Level::Raid1)
    }

    fn flags(&self) -> MetadataFlags {
        MetadataFlags::empty()
    }

    fn kind(&self) -> MetadataKind {
        MetadataKind::GeomMirror
    }
}
