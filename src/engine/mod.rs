//! Per-level I/O engines. Each implements the same block-device-shaped
//! surface a [`crate::volume::Volume`] exposes to clients.

pub mod raid0;
pub mod raid1;
pub mod raid45;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RaidError, Result};
use crate::volume::{Level, Volume, VolumeState};

/// Checks the volume is usable at all before an engine plans any sub-I/O.
pub fn check_usable(volume: &Volume, for_write: bool) -> Result<()> {
    let state = volume.state.load(Ordering::SeqCst);
    if matches!(state, VolumeState::Faulty | VolumeState::None) {
        return Err(RaidError::IoFailure);
    }
    if for_write && volume.flags.contains(crate::volume::VolumeFlags::READ_ONLY) {
        return Err(RaidError::NotSupported);
    }
    Ok(())
}

/// The block-device contract a client sees (§6): dispatches to the engine
/// matching the volume's configured level.
pub async fn read_blocks(volume: &Arc<Volume>, ba: u64, cnt: u64, buf: &mut [u8]) -> Result<()> {
    match volume.level {
        Level::Raid0 => raid0::read_blocks(volume, ba, cnt, buf).await,
        Level::Raid1 => raid1::read_blocks(volume, volume.read_strategy, ba, cnt, buf).await,
        Level::Raid4 | Level::Raid5 => raid45::read_blocks(volume, ba, cnt, buf).await,
    }
}

pub async fn write_blocks(volume: &Arc<Volume>, ba: u64, cnt: u64, buf: &[u8]) -> Result<()> {
    match volume.level {
        Level::Raid0 => raid0::write_blocks(volume, ba, cnt, buf).await,
        Level::Raid1 => raid1::write_blocks(volume, ba, cnt, buf).await,
        Level::Raid4 | Level::Raid5 => raid45::write_blocks(volume, ba, cnt, buf).await,
    }
}

pub async fn sync_cache(volume: &Arc<Volume>, ba: u64, cnt: u64) -> Result<()> {
    match volume.level {
        Level::Raid0 => raid0::sync_cache(volume, ba, cnt).await,
        Level::Raid1 => raid1::sync_cache(volume).await,
        Level::Raid4 | Level::Raid5 => raid45::sync_cache(volume, ba, cnt).await,
    }
}
