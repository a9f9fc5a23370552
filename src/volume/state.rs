//! Per-level state evaluator: turns extent-state changes into volume-state
//! transitions and decides when a rebuild should be kicked off.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{RaidError, Result};
use crate::volume::{AtomicExtentState, Extent, ExtentState, Level, Volume, VolumeState};

/// Maps a sub-I/O failure to an extent state and records it, per the
/// extent-state callback contract: `NotFound` extents are missing hardware,
/// anything else is a live failure. Every engine calls this on every organic
/// sub-I/O failure, so this is also where auto-rebuild gets its chance to
/// start — not just the explicit admin-API paths.
pub async fn report_extent_failure(volume: &Arc<Volume>, extent_idx: usize, err: &RaidError) {
    let new_state = err.to_extent_state();
    {
        let extents = volume.extents_lock.read().await;
        if let Some(extent) = extents.get(extent_idx) {
            extent.state.store(new_state, Ordering::SeqCst);
        }
    }
    match new_state {
        ExtentState::Missing => warn!("extent {extent_idx} went missing"),
        _ => warn!("extent {extent_idx} failed"),
    }
    volume.states_dirty.store(true, Ordering::SeqCst);
    evaluate(volume).await;
    maybe_start_rebuild(volume).await;
}

/// Promotes the last registered hotspare into the first non-ONLINE slot and
/// spawns the level's rebuild fibril, per §4.4/§4.6/§4.7's "spawn rebuild if
/// a hotspare/INVALID/REBUILD-resume candidate exists" rule. RAID-0 has no
/// redundancy to rebuild from and is skipped. Called both from here (every
/// organic extent-callback failure) and from the registry's explicit
/// `fail_extent`/`add_hotspare` admin calls, so a hotspare already present
/// when a volume degrades organically starts rebuilding without requiring an
/// admin to kick it.
pub async fn maybe_start_rebuild(volume: &Arc<Volume>) {
    if volume.level == Level::Raid0 {
        return;
    }

    let bad_idx = {
        let extents = volume.extents_lock.read().await;
        extents
            .iter()
            .position(|e| e.state.load(Ordering::SeqCst) != ExtentState::Online)
    };
    let Some(idx) = bad_idx else { return };

    let spare = volume.hotspare_lock.lock().await.pop();
    let Some(spare) = spare else { return };

    {
        let mut extents = volume.extents_lock.write().await;
        extents[idx] = Extent {
            dev: Some(spare.dev),
            state: AtomicExtentState::new(ExtentState::Rebuild),
        };
    }
    volume.state.store(VolumeState::Rebuild, Ordering::SeqCst);

    let volume = volume.clone();
    let level = volume.level;
    tokio::spawn(async move {
        const REBUILD_WINDOW_BLOCKS: u64 = 64;
        let result = match level {
            Level::Raid1 => crate::engine::raid1::rebuild(&volume, idx, REBUILD_WINDOW_BLOCKS).await,
            Level::Raid4 | Level::Raid5 => crate::engine::raid45::rebuild(&volume, idx, REBUILD_WINDOW_BLOCKS).await,
            Level::Raid0 => Ok(()),
        };
        if let Err(err) = result {
            log::error!("rebuild failed for volume {} extent {idx}: {err}", volume.devname);
        }
    });
}

/// Re-derives the volume's state from its extents' current states and, if
/// the dirty flag was set, bumps and persists the metadata counter exactly
/// once for however many events coalesced since the last evaluation.
pub async fn evaluate(volume: &Volume) -> VolumeState {
    let extents = volume.extents_lock.read().await;
    let states: Vec<ExtentState> = extents.iter().map(|e| e.state.load(Ordering::SeqCst)).collect();
    drop(extents);

    let online = states.iter().filter(|s| **s == ExtentState::Online).count();
    let bad = states.len() - online;

    let new_state = match volume.level {
        Level::Raid0 => {
            if bad == 0 {
                VolumeState::Optimal
            } else {
                VolumeState::Faulty
            }
        }
        Level::Raid1 => {
            if bad == 0 {
                VolumeState::Optimal
            } else if online > 0 {
                VolumeState::Degraded
            } else {
                VolumeState::Faulty
            }
        }
        Level::Raid4 | Level::Raid5 => {
            if bad == 0 {
                VolumeState::Optimal
            } else if bad == 1 {
                VolumeState::Degraded
            } else {
                VolumeState::Faulty
            }
        }
    };

    let previous = volume.state.load(Ordering::SeqCst);
    if previous != new_state {
        info!("volume {} transitioned {:?} -> {:?}", volume.devname, previous, new_state);
        volume.state.store(new_state, Ordering::SeqCst);
    }

    if volume
        .states_dirty
        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        volume.metadata_counter.fetch_add(1, Ordering::SeqCst);
    }

    new_state
}

/// Consumes the first-write flag exactly once per volume lifetime, bumping
/// the metadata counter unless the volume uses no-op metadata.
pub fn note_first_write(volume: &Volume) {
    if volume.flags.contains(crate::volume::VolumeFlags::NOOP_META) {
        return;
    }
    if volume
        .first_write
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        volume.metadata_counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Whether a volume accepts a read or write of `cnt` blocks at `ba`.
pub fn check_range(volume: &Volume, ba: u64, cnt: u64) -> Result<()> {
    if cnt == 0 {
        return Ok(());
    }
    if ba.checked_add(cnt).is_none_or(|end| end > volume.data_blkno) {
        return Err(RaidError::RangeError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::fibril::FibrilPool;
    use crate::metadata::noop::NoopMetadata;
    use crate::rangelock::RangeLockTable;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
    use std::sync::Arc;
    use tokio::sync::{Mutex, RwLock};

    fn make_volume(level: Level, extent_states: &[ExtentState]) -> Volume {
        let extents = extent_states
            .iter()
            .map(|s| crate::volume::Extent {
                dev: Some(Arc::new(MemBlockDevice::new(64, 512)) as Arc<dyn crate::blockdev::BlockDevice>),
                state: crate::volume::AtomicExtentState::new(*s),
            })
            .collect();
        Volume {
            handle: 1,
            devname: "test".into(),
            level,
            layout: crate::volume::Layout::None,
            strip_size: 4096,
            block_size: 512,
            truncated_blkno: 64,
            data_offset: 0,
            data_blkno: 64,
            extents_lock: RwLock::new(extents),
            hotspare_lock: Mutex::new(Vec::new()),
            state: crate::volume::AtomicVolumeState::new(VolumeState::None),
            states_dirty: AtomicBool::new(false),
            rebuild_position: AtomicU64::new(0),
            metadata_counter: AtomicU64::new(0),
            flags: crate::volume::VolumeFlags::empty(),
            open_count: AtomicU32::new(0),
            first_write: AtomicBool::new(false),
            range_locks: Arc::new(RangeLockTable::new()),
            fibril_pool: FibrilPool::new(2, 4, 64),
            md: Mutex::new(None),
            md_ops: Arc::new(NoopMetadata),
            read_strategy: crate::engine::raid1::ReadStrategy::RoundRobin,
        }
    }

    #[tokio::test]
    async fn raid1_all_online_is_optimal() {
        let vol = make_volume(Level::Raid1, &[ExtentState::Online, ExtentState::Online]);
        assert_eq!(evaluate(&vol).await, VolumeState::Optimal);
    }

    #[tokio::test]
    async fn raid1_one_bad_is_degraded() {
        let vol = make_volume(Level::Raid1, &[ExtentState::Online, ExtentState::Failed]);
        assert_eq!(evaluate(&vol).await, VolumeState::Degraded);
    }

    #[tokio::test]
    async fn raid1_all_bad_is_faulty() {
        let vol = make_volume(Level::Raid1, &[ExtentState::Failed, ExtentState::Missing]);
        assert_eq!(evaluate(&vol).await, VolumeState::Faulty);
    }

    #[tokio::test]
    async fn raid0_any_bad_is_faulty() {
        let vol = make_volume(Level::Raid0, &[ExtentState::Online, ExtentState::Failed]);
        assert_eq!(evaluate(&vol).await, VolumeState::Faulty);
    }

    #[tokio::test]
    async fn raid5_two_bad_is_faulty() {
        let vol = make_volume(
            Level::Raid5,
            &[ExtentState::Online, ExtentState::Failed, ExtentState::Missing],
        );
        assert_eq!(evaluate(&vol).await, VolumeState::Faulty);
    }

    #[tokio::test]
    async fn dirty_flag_bumps_counter_once() {
        let vol = make_volume(Level::Raid1, &[ExtentState::Online, ExtentState::Online]);
        vol.states_dirty.store(true, Ordering::SeqCst);
        evaluate(&vol).await;
        assert_eq!(vol.metadata_counter.load(Ordering::SeqCst), 1);
        evaluate(&vol).await;
        assert_eq!(vol.metadata_counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_write_bumps_counter_exactly_once() {
        let vol = make_volume(Level::Raid1, &[ExtentState::Online]);
        note_first_write(&vol);
        note_first_write(&vol);
        assert_eq!(vol.metadata_counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn noop_meta_skips_first_write_bump() {
        let mut vol = make_volume(Level::Raid1, &[ExtentState::Online]);
        vol.flags = crate::volume::VolumeFlags::NOOP_META;
        note_first_write(&vol);
        assert_eq!(vol.metadata_counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn range_check_rejects_overflow() {
        let vol = make_volume(Level::Raid1, &[ExtentState::Online]);
        assert!(check_range(&vol, 60, 10).is_err());
        assert!(check_range(&vol, 0, 64).is_ok());
    }
}
