//! RAID-0 engine: stateless striping across every extent.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RaidError, Result};
use crate::fibril::FibrilGroup;
use crate::volume::state::{check_range, report_extent_failure};
use crate::volume::{ExtentState, Volume, VolumeState};

fn strip_blocks(volume: &Volume) -> u64 {
    volume.strip_size as u64 / volume.block_size as u64
}

struct Piece {
    extent: usize,
    extent_ba: u64,
    cnt: u64,
    buf_off: u64,
}

/// Splits a client-relative `[ba, ba+cnt)` span into per-extent contiguous
/// pieces, one per strip crossed.
fn plan(volume: &Volume, extent_count: usize, ba: u64, cnt: u64) -> Vec<Piece> {
    let sb = strip_blocks(volume);
    let mut pieces = Vec::new();
    let mut remaining = cnt;
    let mut cur = ba;
    let mut buf_off = 0u64;
    while remaining > 0 {
        let strip_no = cur / sb;
        let strip_off = cur % sb;
        let extent = (strip_no as usize) % extent_count;
        let stripe = strip_no / extent_count as u64;
        let this_cnt = remaining.min(sb - strip_off);
        let extent_ba = stripe * sb + strip_off + volume.data_offset;
        pieces.push(Piece {
            extent,
            extent_ba,
            cnt: this_cnt,
            buf_off,
        });
        cur += this_cnt;
        buf_off += this_cnt;
        remaining -= this_cnt;
    }
    pieces
}

pub async fn read_blocks(volume: &Arc<Volume>, ba: u64, cnt: u64, buf: &mut [u8]) -> Result<()> {
    super::check_usable(volume, false)?;
    check_range(volume, ba, cnt)?;
    if cnt == 0 {
        return Ok(());
    }
    let bsize = volume.block_size;
    let extents = volume.extents_lock.read().await;
    let extent_count = extents.len();
    let pieces = plan(volume, extent_count, ba, cnt);
    drop(extents);

    let group = FibrilGroup::new(&volume.fibril_pool, pieces.len());
    let buf_ptr = buf.as_mut_ptr() as usize;
    for piece in &pieces {
        let volume = volume.clone();
        let extent = piece.extent;
        let extent_ba = piece.extent_ba;
        let len = (piece.cnt as usize) * bsize;
        let off = (piece.buf_off as usize) * bsize;
        group
            .submit(async move {
                let extents = volume.extents_lock.read().await;
                let Some(dev) = extents.get(extent).and_then(|e| e.dev.clone()) else {
                    return Err(RaidError::NotFound);
                };
                drop(extents);
                // SAFETY: each piece writes a disjoint `[off, off+len)` slice of
                // the caller's buffer; pieces never overlap.
                let dst = unsafe { std::slice::from_raw_parts_mut((buf_ptr as *mut u8).add(off), len) };
                let res = dev.read(extent_ba, dst).await;
                if let Err(e) = &res {
                    report_extent_failure(&volume, extent, e).await;
                }
                res
            })
            .await;
    }
    let outcome = group.wait().await;
    if outcome.fail > 0 {
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
    crate::volume::state::note_first_write(volume);
    let bsize = volume.block_size;
    let extents = volume.extents_lock.read().await;
    let extent_count = extents.len();
    let pieces = plan(volume, extent_count, ba, cnt);
    drop(extents);

    let group = FibrilGroup::new(&volume.fibril_pool, pieces.len());
    let buf_ptr = buf.as_ptr() as usize;
    for piece in &pieces {
        let volume = volume.clone();
        let extent = piece.extent;
        let extent_ba = piece.extent_ba;
        let len = (piece.cnt as usize) * bsize;
        let off = (piece.buf_off as usize) * bsize;
        group
            .submit(async move {
                let extents = volume.extents_lock.read().await;
                let Some(dev) = extents.get(extent).and_then(|e| e.dev.clone()) else {
                    return Err(RaidError::NotFound);
                };
                drop(extents);
                // SAFETY: read-only view into the caller's write buffer, disjoint per piece.
                let src = unsafe { std::slice::from_raw_parts((buf_ptr as *const u8).add(off), len) };
                let res = dev.write(extent_ba, src).await;
                if let Err(e) = &res {
                    report_extent_failure(&volume, extent, e).await;
                }
                res
            })
            .await;
    }
    let outcome = group.wait().await;
    if outcome.fail > 0 {
        volume.state.store(VolumeState::Faulty, Ordering::SeqCst);
        return Err(RaidError::IoFailure);
    }
    Ok(())
}

pub async fn sync_cache(volume: &Arc<Volume>, ba: u64, cnt: u64) -> Result<()> {
    super::check_usable(volume, false)?;
    let extents = volume.extents_lock.read().await;
    let targets: Vec<_> = if ba == 0 && cnt == 0 {
        extents.iter().filter_map(|e| e.dev.clone()).collect()
    } else {
        Vec::new()
    };
    drop(extents);
    if targets.is_empty() {
        return Ok(());
    }

    let group = FibrilGroup::new(&volume.fibril_pool, targets.len());
    for dev in targets {
        group.submit(async move { dev.sync().await }).await;
    }
    if group.wait().await.fail > 0 {
        return Err(RaidError::IoFailure);
    }
    Ok(())
}

/// True if every extent is currently `ONLINE`.
pub fn all_online(extents: &[crate::volume::Extent]) -> bool {
    extents.iter().all(|e| e.state.load(Ordering::SeqCst) == ExtentState::Online)
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
        let devs: Vec<_> = (0..n).map(|_| Arc::new(MemBlockDevice::new(32, 512))).collect();
        let extents = devs
            .iter()
            .map(|d| Extent::online(d.clone() as Arc<dyn crate::blockdev::BlockDevice>))
            .collect();
        let vol = Arc::new(Volume {
            handle: 1,
            devname: "r0".into(),
            level: Level::Raid0,
            layout: Layout::None,
            strip_size: 512 * 2,
            block_size: 512,
            truncated_blkno: 32,
            data_offset: 0,
            data_blkno: 32 * n as u64,
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
    async fn write_then_read_round_trips_across_extents() {
        let (vol, _devs) = make_volume(3);
        let data: Vec<u8> = (0..32u8).cycle().take(512 * 6).collect();
        write_blocks(&vol, 0, 6, &data).await.unwrap();

        let mut out = vec![0u8; 512 * 6];
        read_blocks(&vol, 0, 6, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn out_of_range_read_is_rejected() {
        let (vol, _devs) = make_volume(2);
        let mut out = vec![0u8; 512];
        assert_eq!(read_blocks(&vol, 1000, 1, &mut out).await.unwrap_err(), RaidError::RangeError);
    }

    #[tokio::test]
    async fn any_extent_failure_faults_the_volume_on_write() {
        let (vol, devs) = make_volume(2);
        devs[1].fail();

        let data = vec![0xABu8; 512 * 4];
        let err = write_blocks(&vol, 0, 4, &data).await.unwrap_err();
        assert_eq!(err, RaidError::IoFailure);
        assert_eq!(vol.state.load(Ordering::SeqCst), VolumeState::Faulty);
    }
}
