//! The native on-disk superblock: one block at the last LBA of each
//! extent, fixed-offset little-endian fields.

use async_trait::async_trait;

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::metadata::{Candidate, DecodedMetadata, MetadataFlags, MetadataKind, MetadataOps};
use crate::pod::{read_pod, write_pod, Pod};
use crate::volume::{Layout, Level, Volume};

pub const MAGIC: &[u8; 16] = b"HelenRAID\0\0\0\0\0\0\0";
pub const DEVNAME_LEN: usize = 32;
pub const META_SIZE_BLOCKS: u64 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawSuperblock {
    magic: [u8; 16],
    uuid: [u8; 16],
    data_blkno: u64,
    truncated_blkno: u64,
    data_offset: u64,
    counter: u64,
    version: u32,
    extent_no: u32,
    index: u32,
    level: u32,
    layout: u32,
    strip_size: u32,
    bsize: u32,
    devname: [u8; DEVNAME_LEN],
}

// SAFETY: `RawSuperblock` is `repr(C)`, contains only integers and byte
// arrays, and every bit pattern is a legal value.
unsafe impl Pod for RawSuperblock {}

fn level_to_u32(level: Level) -> u32 {
    match level {
        Level::Raid0 => 0,
        Level::Raid1 => 1,
        Level::Raid4 => 4,
        Level::Raid5 => 5,
    }
}

fn level_from_u32(v: u32) -> Result<Level> {
    match v {
        0 => Ok(Level::Raid0),
        1 => Ok(Level::Raid1),
        4 => Ok(Level::Raid4),
        5 => Ok(Level::Raid5),
        _ => Err(RaidError::InvalidArgument),
    }
}

fn layout_to_u32(layout: Layout) -> u32 {
    match layout {
        Layout::None => 0,
        Layout::Raid4_0 => 1,
        Layout::Raid4N => 2,
        Layout::Raid5_0R => 3,
        Layout::Raid5NR => 4,
        Layout::Raid5NC => 5,
    }
}

fn layout_from_u32(v: u32) -> Layout {
    match v {
        1 => Layout::Raid4_0,
        2 => Layout::Raid4N,
        3 => Layout::Raid5_0R,
        4 => Layout::Raid5NR,
        5 => Layout::Raid5NC,
        _ => Layout::None,
    }
}

fn devname_to_bytes(name: &str) -> [u8; DEVNAME_LEN] {
    let mut buf = [0u8; DEVNAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(DEVNAME_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn devname_from_bytes(buf: &[u8; DEVNAME_LEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(DEVNAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn decode(raw: &RawSuperblock) -> Result<DecodedMetadata> {
    if raw.magic != *MAGIC {
        return Err(RaidError::NotFound);
    }
    Ok(DecodedMetadata {
        uuid: raw.uuid,
        counter: raw.counter,
        level: level_from_u32(raw.level)?,
        layout: layout_from_u32(raw.layout),
        strip_size: raw.strip_size,
        block_size: raw.bsize,
        data_offset: raw.data_offset,
        data_blkno: raw.data_blkno,
        truncated_blkno: raw.truncated_blkno,
        extent_no: raw.extent_no,
        index: raw.index,
        devname: devname_from_bytes(&raw.devname),
    })
}

fn encode(meta: &DecodedMetadata) -> RawSuperblock {
    RawSuperblock {
        magic: *MAGIC,
        uuid: meta.uuid,
        data_blkno: meta.data_blkno,
        truncated_blkno: meta.truncated_blkno,
        data_offset: meta.data_offset,
        counter: meta.counter,
        version: 1,
        extent_no: meta.extent_no,
        index: meta.index,
        level: level_to_u32(meta.level),
        layout: layout_to_u32(meta.layout),
        strip_size: meta.strip_size,
        bsize: meta.block_size,
        devname: devname_to_bytes(&meta.devname),
    }
}

pub struct NativeMetadata;

#[async_trait]
impl MetadataOps for NativeMetadata {
    async fn probe(&self, dev: &dyn BlockDevice) -> Result<DecodedMetadata> {
        let bsize = dev.block_size();
        let last = dev.num_blocks().checked_sub(META_SIZE_BLOCKS).ok_or(RaidError::NotFound)?;
        let mut buf = vec![0u8; bsize];
        dev.read(last, &mut buf).await?;
        let raw: RawSuperblock = read_pod(&buf).ok_or(RaidError::NotFound)?;
        decode(&raw)
    }

    fn init_vol2meta(&self, volume: &Volume) -> Result<DecodedMetadata> {
        Ok(DecodedMetadata {
            uuid: [0u8; 16],
            counter: 0,
            level: volume.level,
            layout: volume.layout,
            strip_size: volume.strip_size,
            block_size: volume.block_size as u32,
            data_offset: volume.data_offset,
            data_blkno: volume.data_blkno,
            truncated_blkno: volume.truncated_blkno,
            extent_no: 0,
            index: 0,
            devname: volume.devname.clone(),
        })
    }

    fn init_meta2vol(&self, candidates: &[Candidate]) -> Result<DecodedMetadata> {
        candidates
            .iter()
            .max_by_key(|c| c.meta.counter)
            .map(|c| c.meta.clone())
            .ok_or(RaidError::NotFound)
    }

    async fn inc_counter(&self, volume: &Volume) -> Result<()> {
        let mut md = volume.md.lock().await;
        if let Some(meta) = md.as_mut() {
            meta.counter += 1;
        }
        Ok(())
    }

    async fn save(&self, volume: &Volume) -> Result<()> {
        let count = volume.extents_lock.read().await.len();
        for idx in 0..count {
            save_ext_impl(volume, idx).await?;
        }
        Ok(())
    }

    async fn save_ext(&self, volume: &Volume, extent_idx: usize) -> Result<()> {
        save_ext_impl(volume, extent_idx).await
    }

    fn level(&self) -> Option<Level> {
        None
    }

    fn flags(&self) -> MetadataFlags {
        MetadataFlags::HOTSPARE_SUPPORT | MetadataFlags::ALLOW_REBUILD
    }

    fn kind(&self) -> MetadataKind {
        MetadataKind::Native
    }
}

async fn save_ext_impl(volume: &Volume, extent_idx: usize) -> Result<()> {
    let md = volume.md.lock().await;
    let Some(meta) = md.as_ref() else {
        return Ok(());
    };
    let mut meta = meta.clone();
    meta.index = extent_idx as u32;
    let raw = encode(&meta);
    drop(md);

    let extents = volume.extents_lock.read().await;
    let Some(extent) = extents.get(extent_idx) else {
        return Err(RaidError::NotFound);
    };
    let Some(dev) = extent.dev.as_ref() else {
        return Err(RaidError::NotFound);
    };
    let bsize = dev.block_size();
    let last = dev.num_blocks().checked_sub(META_SIZE_BLOCKS).ok_or(RaidError::RangeError)?;
    let mut buf = vec![0u8; bsize];
    write_pod(&raw, &mut buf);
    dev.write(last, &buf).await
}
