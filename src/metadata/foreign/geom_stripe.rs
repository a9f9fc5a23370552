//! FreeBSD GEOM stripe v3 metadata recognition (read-only): `md_all` and
//! `md_no` define membership count and this member's index.

use async_trait::async_trait;

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::metadata::{Candidate, DecodedMetadata, MetadataFlags, MetadataKind, MetadataOps};
use crate::pod::{read_pod, Pod};
use crate::volume::{Layout, Level, Volume};

const MAGIC: &[u8; 16] = b"GEOM::STRIPE\0\0\0\0";

#[repr(C)]
#[derive(Clone, Copy)]
struct RawGStripe {
    magic: [u8; 16],
    md_did: u32,
    md_all: u16,
    md_no: u16,
    md_genid: u64,
    md_stripesize: u32,
}

// SAFETY: repr(C), plain integers and byte array, any bit pattern valid.
unsafe impl Pod for RawGStripe {}

pub struct GeomStripeMetadata;

#[async_trait]
impl MetadataOps for GeomStripeMetadata {
    async fn probe(&self, dev: &dyn BlockDevice) -> Result<DecodedMetadata> {
        let bsize = dev.block_size();
        let last = dev.num_blocks().checked_sub(1).ok_or(RaidError::NotFound)?;
        let mut buf = vec![0u8; bsize];
        dev.read(last, &mut buf).await?;
        let raw: RawGStripe = read_pod(&buf).ok_or(RaidError::NotFound)?;
        if raw.magic != *MAGIC {
            return Err(RaidError::NotFound);
        }
        let mut uuid = [0u8; 16];
        uuid[..4].copy_from_slice(&raw.md_did.to_le_bytes());
        Ok(DecodedMetadata {
            uuid,
            counter: raw.md_genid,
            level: Level::Raid0,
            layout: Layout::None,
            strip_size: raw.md_stripesize,
            block_size: bsize as u32,
            data_offset: 0,
            data_blkno: 0,
            truncated_blkno: dev.num_blocks(),
            extent_no: raw.md_all as u32,
            index: raw.md_no as u32,
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
        Some(Level::Raid0)
    }

    fn flags(&self) -> MetadataFlags {
        MetadataFlags::empty()
    }

    fn kind(&self) -> MetadataKind {
        MetadataKind::GeomStripe
    }
}
