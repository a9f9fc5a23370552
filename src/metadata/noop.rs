//! The no-op metadata variant for ephemeral/test volumes created with
//! `NOOP_META`: no superblock is ever written, so the first-write and
//! dirty-flag counter bumps never fire for these volumes.

use async_trait::async_trait;

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::metadata::{Candidate, DecodedMetadata, MetadataFlags, MetadataKind, MetadataOps};
use crate::volume::Volume;

pub struct NoopMetadata;

#[async_trait]
impl MetadataOps for NoopMetadata {
    async fn probe(&self, _dev: &dyn BlockDevice) -> Result<DecodedMetadata> {
        Err(RaidError::NotFound)
    }

    fn init_vol2meta(&self, _volume: &Volume) -> Result<DecodedMetadata> {
        Err(RaidError::NotSupported)
    }

    fn init_meta2vol(&self, _candidates: &[Candidate]) -> Result<DecodedMetadata> {
        Err(RaidError::NotSupported)
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

    fn level(&self) -> Option<crate::volume::Level> {
        None
    }

    fn flags(&self) -> MetadataFlags {
        MetadataFlags::empty()
    }

    fn kind(&self) -> MetadataKind {
        MetadataKind::Noop
    }
}
