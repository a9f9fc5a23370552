//! RAID-1 engine: N-way mirror with configurable read strategy and a
//! rebuild fibril.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RaidError, Result};
use crate::fibril::FibrilGroup;
use crate::volume::state::{check_range, note_first_write, report_extent_failure};
use crate::volume::{ExtentState, Volume, VolumeState};

/// Requests at or above this many blocks are split across mirrors instead
/// of served from a single extent.
pub const SPLIT_THRESHOLD: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    #[default]
    RoundRobin,
    ClosestOffset,
    FirstOnline,
    Split,
}

async fn online_extents(volume: &Volume) -> Vec<usize> {
    let extents = volume.extents_lock.read().await;
    (0..extents.len())
        .filter(|&i| extents[i].state.load(Ordering::SeqCst) == ExtentState::Online)
        .collect()
}

pub async fn read_blocks(
    volume: &Arc<Volume>,
    strategy: ReadStrategy,
    ba: u64,
    cnt: u64,
    buf: &mut [u8],
) -> Result<()> {
    super::check_usable(volume, false)?;
    check_range(volume, ba, cnt)?;
    if cnt == 0 {
        return Ok(());
    }
    let _lock = volume.range_locks.acquire(ba, cnt).await;
    let candidates = online_extents(volume).await;
    if candidates.is_empty() {
        return Err(RaidError::IoFailure);
    }

    if strategy == ReadStrategy::Split && cnt >= SPLIT_THRESHOLD && candidates.len() > 1 {
        return split_read(volume, &candidates, ba, cnt, buf).await;
    }

    let ext_ba = ba + volume.data_offset;
    let len = cnt as usize * volume.block_size;
    for &extent in &candidates {
        let dev = {
            let extents = volume.extents_lock.read().await;
            extents[extent].dev.clone()
        };
        let Some(dev) = dev else { continue };
        match dev.read(ext_ba, &mut buf[..len]).await {
            Ok(()) => return Ok(()),
            Err(e) => report_extent_failure(volume, extent, &e).await,
        }
    }
    Err(RaidError::IoFailure)
}

async fn split_read(volume: &Arc<Volume>, candidates: &[usize], ba: u64, cnt: u64, buf: &mut [u8]) -> Result<()> {
    let n = candidates.len() as u64;
    let per = cnt.div_ceil(n);
    let group = FibrilGroup::new(&volume.fibril_pool, candidates.len());
    let bsize = volume.block_size;
    let buf_ptr = buf.as_mut_ptr() as usize;
    let mut remaining = cnt;
    let mut cur = ba;
    let mut buf_off = 0u64;
    for &extent in candidates {
        if remaining == 0 {
            break;
        }
        let this_cnt = remaining.min(per);
        let volume = volume.clone();
        let off = (buf_off as usize) * bsize;
        let len = (this_cnt as usize) * bsize;
        let ext_ba = cur + volume.data_offset;
        group
            .submit(async move {
                let dev = {
                    let extents = volume.extents_lock.read().await;
                    extents[extent].dev.clone()
                };
                let Some(dev) = dev else {
                    return Err(RaidError::NotFound);
                };
                // SAFETY: each split piece writes a disjoint slice of the caller buffer.
                let dst = unsafe { std::slice::from_raw_parts_mut((buf_ptr as *mut u8).add(off), len) };
                let res = dev.read(ext_ba, dst).await;
                if let Err(e) = &res {
                    report_extent_failure(&volume, extent, e).await;
                }
                res
            })
            .await;
        cur += this_cnt;
        buf_off += this_cnt;
        remaining -= this_cnt;
    }
    if group.wait().await.fail > 0 {
        return Err(RaidError::IoFailure);
    }
    Ok(())
}

pub async fn write_blocks(volume: &Arc<Volume>, ba: u64, cnt: u64, buf: &[u8]) -> Result<()> {
    super::check_usable(volume, true)?;
    check_range(volume, ba, cnt)?;
    if cnt == 0 {
        return Ok(());
    }
    note_first_write(volume);
    let _lock = volume.range_locks.acquire(ba, cnt).await;

    let rebuild_pos = volume.rebuild_position.load(Ordering::Acquire);
    let targets: Vec<usize> = {
        let extents = volume.extents_lock.read().await;
        (0..extents.len())
            .filter(|&i| {
                let state = extents[i].state.load(Ordering::SeqCst);
                state == ExtentState::Online || (state == ExtentState::Rebuild && ba + cnt <= rebuild_pos)
            })
            .collect()
    };
    if targets.is_empty() {
        return Err(RaidError::IoFailure);
    }

    let ext_ba = ba + volume.data_offset;
    let group = FibrilGroup::new(&volume.fibril_pool, targets.len());
    for extent in targets {
        let volume = volume.clone();
        let buf = buf.to_vec();
        group
            .submit(async move {
                let dev = {
                    let extents = volume.extents_lock.read().await;
                    extents[extent].dev.clone()
                };
                let Some(dev) = dev else {
                    return Err(RaidError::NotFound);
                };
                let res = dev.write(ext_ba, &buf).await;
                if let Err(e) = &res {
                    report_extent_failure(&volume, extent, e).await;
                }
                res
            })
            .await;
    }
    let outcome = group.wait().await;
    if outcome.ok == 0 {
        return Err(RaidError::IoFailure);
    }
    Ok(())
}

pub async fn sync_cache(volume: &Arc<Volume>) -> Result<()> {
    super::check_usable(volume, false)?;
    let candidates = online_extents(volume).await;
    if candidates.is_empty() {
        return Ok(());
    }
    let group = FibrilGroup::new(&volume.fibril_pool, candidates.len());
    for extent in candidates {
        let volume = volume.clone();
        group
            .submit(async move {
                let dev = {
                    let extents = volume.extents_lock.read().await;
                    extents[extent].dev.clone()
                };
                match dev {
                    Some(dev) => dev.sync().await,
                    None => Ok(()),
                }
            })
            .await;
    }
    if group.wait().await.fail > 0 {
        return Err(RaidError::IoFailure);
    }
    Ok(())
}

/// Streams blocks from any ONLINE extent into `target`, advancing the
/// volume's rebuild position and persisting metadata periodically.
pub async fn rebuild(volume: &Arc<Volume>, target: usize, window_blocks: u64) -> Result<()> {
    const SAVE_BYTES: u64 = 10 * 1024 * 1024;
    volume.state.store(VolumeState::Rebuild, Ordering::SeqCst);
    log::info!("rebuild started for volume {} extent {target}", volume.devname);

    let save_every = SAVE_BYTES / volume.block_size as u64 / window_blocks.max(1);
    let mut windows_since_save = 0u64;

    loop {
        let pos = volume.rebuild_position.load(Ordering::Acquire);
        if pos >= volume.data_blkno {
            break;
        }
        let this_window = window_blocks.min(volume.data_blkno - pos);
        let _lock = volume.range_locks.acquire(pos, this_window).await;

        let source = online_extents(volume).await.into_iter().find(|&i| i != target);
        let Some(source) = source else {
            return Err(RaidError::IoFailure);
        };

        let mut buf = vec![0u8; this_window as usize * volume.block_size];
        let ext_ba = pos + volume.data_offset;
        {
            let extents = volume.extents_lock.read().await;
            let src_dev = extents[source].dev.clone().ok_or(RaidError::NotFound)?;
            let dst_dev = extents[target].dev.clone().ok_or(RaidError::NotFound)?;
            drop(extents);
            src_dev.read(ext_ba, &mut buf).await?;
            dst_dev.write(ext_ba, &buf).await?;
        }

        volume
            .rebuild_position
            .store(pos + this_window, Ordering::Release);
        windows_since_save += 1;
        if windows_since_save >= save_every.max(1) {
            windows_since_save = 0;
            volume.md_ops.save_ext(volume, target).await.ok();
        }
    }

    {
        let extents = volume.extents_lock.read().await;
        extents[target].state.store(ExtentState::Online, Ordering::SeqCst);
    }
    volume.rebuild_position.store(0, Ordering::Release);
    volume.states_dirty.store(true, Ordering::SeqCst);
    crate::volume::state::evaluate(volume).await;
    log::info!("rebuild completed for volume {} extent {target}", volume.devname);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::fibril::FibrilPool;
    use crate::metadata::noop::NoopMetadata;
    use crate::rangelock::RangeLockTable;
    use crate::volume::{AtomicVolumeState, Extent, Layout, Level, VolumeFlags};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
    use tokio::sync::{Mutex, RwLock};

    fn make_volume(n: usize) -> (Arc<Volume>, Vec<Arc<MemBlockDevice>>) {
        let devs: Vec<_> = (0..n).map(|_| Arc::new(MemBlockDevice::new(64, 512))).collect();
        let extents = devs
            .iter()
            .map(|d| Extent::online(d.clone() as Arc<dyn crate::blockdev::BlockDevice>))
            .collect();
        let vol = Arc::new(Volume {
            handle: 1,
            devname: "r1".into(),
            level: Level::Raid1,
            layout: Layout::None,
            strip_size: 4096,
            block_size: 512,
            truncated_blkno: 64,
            data_offset: 0,
            data_blkno: 64,
            extents_lock: RwLock::new(extents),
            hotspare_lock: Mutex::new(Vec::new()),
            state: AtomicVolumeState::new(VolumeState::Optimal),
            states_dirty: AtomicBool::new(false),
            rebuild_position: AtomicU64::new(0),
            metadata_counter: AtomicU64::new(0),
            flags: VolumeFlags::empty(),
            open_count: AtomicU32::new(0),
            first_write: AtomicBool::new(false),
            range_locks: Arc::new(RangeLockTable::new()),
            fibril_pool: FibrilPool::new(4, 8, 4096),
            md: Mutex::new(None),
            md_ops: Arc::new(NoopMetadata),
            read_strategy: crate::engine::raid1::ReadStrategy::RoundRobin,
        });
        (vol, devs)
    }

    #[tokio::test]
    async fn write_fans_out_and_read_succeeds_after_one_extent_dies() {
        let (vol, devs) = make_volume(2);
        let data = vec![0x11u8; 512 * 2];
        write_blocks(&vol, 0, 2, &data).await.unwrap();

        devs[0].fail();
        let mut out = vec![0u8; 512 * 2];
        read_blocks(&vol, ReadStrategy::FirstOnline, 0, 2, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn write_succeeds_if_at_least_one_mirror_accepts() {
        let (vol, devs) = make_volume(2);
        devs[0].fail();
        let data = vec![0x22u8; 512];
        write_blocks(&vol, 0, 1, &data).await.unwrap();
    }

    #[tokio::test]
    async fn write_fails_when_all_mirrors_are_down() {
        let (vol, devs) = make_volume(2);
        devs[0].fail();
        devs[1].fail();
        let data = vec![0x33u8; 512];
        assert_eq!(write_blocks(&vol, 0, 1, &data).await.unwrap_err(), RaidError::IoFailure);
    }

    #[tokio::test]
    async fn rebuild_copies_data_into_replaced_extent() {
        let (vol, devs) = make_volume(2);
        let data = vec![0x44u8; 512 * 4];
        write_blocks(&vol, 0, 4, &data).await.unwrap();

        {
            let extents = vol.extents_lock.read().await;
            extents[1].state.store(ExtentState::Rebuild, Ordering::SeqCst);
        }
        rebuild(&vol, 1, 2).await.unwrap();

        assert_eq!(devs[1].snapshot()[..512 * 4], devs[0].snapshot()[..512 * 4]);
        let extents = vol.extents_lock.read().await;
        assert_eq!(extents[1].state.load(Ordering::SeqCst), ExtentState::Online);
    }
}
