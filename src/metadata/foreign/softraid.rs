//! OpenBSD softraid metadata recognition (read-only): magic at block
//! offset 16, `ssd_uuid` ties members, `ssd_ondisk` is the counter.

use async_trait::async_trait;

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::metadata::{Candidate, DecodedMetadata, MetadataFlags, MetadataKind, MetadataOps};
use crate::pod::{read_pod, Pod};
use crate::volume::{Layout, Level, Volume};

const MAGIC: u64 = 0x4d41_5243_6372_616d;
const OFFSET_BLOCKS: u64 = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawSoftRaid {
    ssd_magic: u64,
    ssd_level: u32,
    ssd_ondisk: u64,
    ssd_uuid: [u8; 16],
}

// SAFETY: repr(C), plain integers and byte array, any bit pattern valid.
unsafe impl Pod for RawSoftRaid {}

pub struct SoftRaidMetadata;

#[async_trait]
impl MetadataOps for SoftRaidMetadata {
    async fn probe(&self, dev: &dyn BlockDevice) -> Result<DecodedMetadata> {
        let bsize = dev.block_size();
        let mut buf = vec![0u8; bsize];
        dev.read(OFFSET_BLOCKS, &mut buf).await?;
        let raw: RawSoftRaid = read_pod(&buf).ok_or(RaidError::NotFound)?;
        if raw.ssd_magic != MAGIC {
            return Err(RaidError::NotFound);
        }
        let level = match raw.ssd_level {
            0 => Level::Raid0,
            1 => Level::Raid1,
            5 => Level::Raid5,
            _ => return Err(RaidError::NotSupported),
        };
        Ok(DecodedMetadata {
            uuid: raw.ssd_uuid,
            counter: raw.ssd_ondisk,
            level,
            layout: if level == Level::Raid5 { Layout::Raid5NR } else { Layout::None },
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
        MetadataFlags::empty()
    }

    fn kind(&self) -> MetadataKind {
        MetadataKind::SoftRaid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::pod::write_pod;

    #[tokio::test]
    async fn probe_recognizes_magic_and_level() {
        let dev = MemBlockDevice::new(32, 512);
        let raw = RawSoftRaid {
            ssd_magic: MAGIC,
            ssd_level: 5,
            ssd_ondisk: 12,
            ssd_uuid: [9u8; 16],
        };
        let mut buf = vec![0u8; 512];
        write_pod(&raw, &mut buf);
        dev.write(OFFSET_BLOCKS, &buf).await.unwrap();

        let meta = SoftRaidMetadata.probe(&dev).await.unwrap();
        assert_eq!(meta.counter, 12);
        assert_eq!(meta.level, Level::Raid5);
    }

    #[tokio::test]
    async fn probe_rejects_unsupported_level() {
        let dev = MemBlockDevice::new(32, 512);
        let raw = RawSoftRaid {
            ssd_magic: MAGIC,
            ssd_level: 6,
            ssd_ondisk: 1,
            ssd_uuid: [0u8; 16],
        };
        let mut buf = vec![0u8; 512];
        write_pod(&raw, &mut buf);
        dev.write(OFFSET_BLOCKS, &buf).await.unwrap();
        assert_eq!(SoftRaidMetadata.probe(&dev).await.unwrap_err(), RaidError::NotSupported);
    }
}
