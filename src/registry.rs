//! Volume registry and assembly: holds every live volume, probes
//! candidate devices for recognizable metadata, and groups/assembles them
//! into volumes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::blockdev::BlockDevice;
use crate::error::{RaidError, Result};
use crate::fibril::FibrilPool;
use crate::metadata::foreign::{geom_mirror::GeomMirrorMetadata, geom_stripe::GeomStripeMetadata, md::MdMetadata, softraid::SoftRaidMetadata};
use crate::metadata::native::NativeMetadata;
use crate::metadata::noop::NoopMetadata;
use crate::metadata::{Candidate, MetadataOps};
use crate::rangelock::RangeLockTable;
use crate::volume::state::evaluate;
use crate::volume::{
    AssembleConfig, AtomicExtentState, AtomicVolumeState, Extent, ExtentState, Volume, VolumeConfig, VolumeFlags, VolumeState,
    HR_MAX_EXTENTS,
};

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub handle: u64,
    pub devname: String,
    pub state: VolumeState,
    pub extent_states: Vec<ExtentState>,
}

pub struct VolumeRegistry {
    volumes: RwLock<Vec<Arc<Volume>>>,
    next_handle: AtomicU64,
    probe_order: Vec<Arc<dyn MetadataOps>>,
    fibrils_per_volume: (usize, usize, usize),
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            probe_order: vec![
                Arc::new(NativeMetadata),
                Arc::new(MdMetadata),
                Arc::new(GeomMirrorMetadata),
                Arc::new(GeomStripeMetadata),
                Arc::new(SoftRaidMetadata),
            ],
            fibrils_per_volume: (4, 32, 64 * 1024),
        }
    }

    fn mint_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn create(&self, config: VolumeConfig) -> Result<u64> {
        if config.extents.is_empty() {
            return Err(RaidError::InvalidArgument);
        }
        if config.extents.len() > HR_MAX_EXTENTS {
            return Err(RaidError::Limit);
        }
        let n = config.extents.len();
        let truncated_blkno = config
            .extents
            .iter()
            .map(|d| d.num_blocks())
            .min()
            .ok_or(RaidError::InvalidArgument)?
            - crate::metadata::native::META_SIZE_BLOCKS;

        let data_offset = 0u64;
        let data_blkno = match config.level {
            crate::volume::Level::Raid1 => truncated_blkno - data_offset,
            crate::volume::Level::Raid0 => n as u64 * (truncated_blkno - data_offset),
            crate::volume::Level::Raid4 | crate::volume::Level::Raid5 => {
                (n as u64 - 1) * (truncated_blkno - data_offset)
            }
        };

        let (fibrils, max_wus, wu_size) = self.fibrils_per_volume;
        let extents = config
            .extents
            .iter()
            .map(|d| Extent::online(d.clone()))
            .collect();

        let md_ops: Arc<dyn MetadataOps> = if config.noop_meta {
            Arc::new(NoopMetadata)
        } else {
            Arc::new(NativeMetadata)
        };

        let flags = if config.noop_meta { VolumeFlags::NOOP_META } else { VolumeFlags::empty() };

        let handle = self.mint_handle();
        let volume = Arc::new(Volume {
            handle,
            devname: config.devname.clone(),
            level: config.level,
            layout: config.layout,
            strip_size: config.strip_size,
            block_size: config.block_size,
            truncated_blkno,
            data_offset,
            data_blkno,
            extents_lock: RwLock::new(extents),
            hotspare_lock: Mutex::new(Vec::new()),
            state: AtomicVolumeState::new(VolumeState::Optimal),
            states_dirty: AtomicBool::new(false),
            rebuild_position: AtomicU64::new(0),
            metadata_counter: AtomicU64::new(0),
            flags,
            open_count: AtomicU32::new(0),
            first_write: AtomicBool::new(false),
            range_locks: Arc::new(RangeLockTable::new()),
            fibril_pool: FibrilPool::new(fibrils, max_wus, wu_size),
            md: Mutex::new(None),
            md_ops: md_ops.clone(),
            read_strategy: config.read_strategy,
        });

        if !config.noop_meta {
            let meta = md_ops.init_vol2meta(&volume)?;
            *volume.md.lock().await = Some(meta);
            md_ops.save(&volume).await?;
        }

        evaluate(&volume).await;
        self.volumes.write().await.push(volume);
        Ok(handle)
    }

    async fn probe_one(&self, dev: &Arc<dyn BlockDevice>) -> Option<(Arc<dyn MetadataOps>, crate::metadata::DecodedMetadata)> {
        for variant in &self.probe_order {
            if let Ok(meta) = variant.probe(dev.as_ref()).await {
                return Some((variant.clone(), meta));
            }
        }
        None
    }

    /// Groups `pool` by matching UUID under the winning metadata variant,
    /// assembling every complete group it can and leaving ungrouped
    /// candidates behind in `pool`.
    pub async fn auto_assemble(&self, mut pool: Vec<Arc<dyn BlockDevice>>) -> Vec<u64> {
        let mut handles = Vec::new();
        while let Some(dev) = pool.first().cloned() {
            let Some((variant, meta)) = self.probe_one(&dev).await else {
                pool.remove(0);
                continue;
            };

            let mut group = vec![Candidate { dev: dev.clone(), meta: meta.clone() }];
            let mut rest = Vec::new();
            for other in pool.iter().skip(1) {
                if let Some((_, other_meta)) = self.probe_one(other).await
                    && variant.compare_uuids(&meta, &other_meta)
                {
                    group.push(Candidate { dev: other.clone(), meta: other_meta });
                    continue;
                }
                rest.push(other.clone());
            }
            pool = rest;

            if let Ok(handle) = self.assemble_group(variant, group).await {
                handles.push(handle);
            }
        }
        handles
    }

    pub async fn assemble(&self, config: AssembleConfig) -> Result<u64> {
        let dev = config.candidates.first().ok_or(RaidError::InvalidArgument)?;
        let (variant, meta) = self.probe_one(dev).await.ok_or(RaidError::NotFound)?;
        let mut group = vec![Candidate { dev: dev.clone(), meta: meta.clone() }];
        for other in config.candidates.iter().skip(1) {
            if let Some((_, other_meta)) = self.probe_one(other).await
                && variant.compare_uuids(&meta, &other_meta)
            {
                group.push(Candidate { dev: other.clone(), meta: other_meta });
            }
        }
        self.assemble_group(variant, group).await
    }

    async fn assemble_group(&self, variant: Arc<dyn MetadataOps>, group: Vec<Candidate>) -> Result<u64> {
        let primary = variant.init_meta2vol(&group)?;
        let extent_no = primary.extent_no.max(group.len() as u32) as usize;
        if extent_no > HR_MAX_EXTENTS {
            return Err(RaidError::Limit);
        }
        let level = variant.level().unwrap_or(primary.level);

        let mut extents: Vec<Extent> = (0..extent_no).map(|_| Extent::empty()).collect();
        for candidate in &group {
            let idx = candidate.meta.index as usize;
            if idx < extents.len() {
                let online = candidate.meta.counter == primary.counter;
                extents[idx] = Extent {
                    dev: Some(candidate.dev.clone()),
                    state: AtomicExtentState::new(if online { ExtentState::Online } else { ExtentState::Invalid }),
                };
            }
        }

        let (fibrils, max_wus, wu_size) = self.fibrils_per_volume;
        let handle = self.mint_handle();
        let volume = Arc::new(Volume {
            handle,
            devname: primary.devname.clone(),
            level,
            layout: primary.layout,
            strip_size: primary.strip_size,
            block_size: primary.block_size as usize,
            truncated_blkno: primary.truncated_blkno,
            data_offset: primary.data_offset,
            data_blkno: primary.data_blkno,
            extents_lock: RwLock::new(extents),
            hotspare_lock: Mutex::new(Vec::new()),
            state: AtomicVolumeState::new(VolumeState::None),
            states_dirty: AtomicBool::new(false),
            rebuild_position: AtomicU64::new(0),
            metadata_counter: AtomicU64::new(primary.counter),
            flags: if variant.flags().contains(crate::metadata::MetadataFlags::HOTSPARE_SUPPORT) {
                VolumeFlags::empty()
            } else {
                VolumeFlags::READ_ONLY
            },
            open_count: AtomicU32::new(0),
            first_write: AtomicBool::new(false),
            range_locks: Arc::new(RangeLockTable::new()),
            fibril_pool: FibrilPool::new(fibrils, max_wus, wu_size),
            md: Mutex::new(Some(primary)),
            md_ops: variant,
            read_strategy: crate::engine::raid1::ReadStrategy::RoundRobin,
        });

        evaluate(&volume).await;
        self.volumes.write().await.push(volume);
        Ok(handle)
    }

    pub async fn stop(&self, handle: u64) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let pos = volumes.iter().position(|v| v.handle == handle).ok_or(RaidError::NotFound)?;
        if volumes[pos].is_open() {
            return Err(RaidError::Busy);
        }
        volumes.remove(pos);
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        if volumes.iter().any(|v| v.is_open()) {
            return Err(RaidError::Busy);
        }
        volumes.clear();
        Ok(())
    }

    pub async fn get(&self, handle: u64) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .await
            .iter()
            .find(|v| v.handle == handle)
            .cloned()
            .ok_or(RaidError::NotFound)
    }

    pub async fn fail_extent(&self, handle: u64, idx: usize) -> Result<()> {
        let volume = self.get(handle).await?;
        crate::volume::state::report_extent_failure(&volume, idx, &RaidError::IoFailure).await;
        Ok(())
    }

    pub async fn add_hotspare(&self, handle: u64, dev: Arc<dyn BlockDevice>) -> Result<()> {
        let volume = self.get(handle).await?;
        volume.hotspare_lock.lock().await.push(crate::volume::Hotspare { dev });
        crate::volume::state::maybe_start_rebuild(&volume).await;
        Ok(())
    }

    pub async fn get_volume_states(&self) -> Vec<VolumeInfo> {
        let volumes = self.volumes.read().await;
        let mut infos = Vec::with_capacity(volumes.len());
        for v in volumes.iter() {
            infos.push(info_for(v).await);
        }
        infos
    }

    pub async fn get_volume_info(&self, handle: u64) -> Result<VolumeInfo> {
        let volume = self.get(handle).await?;
        Ok(info_for(&volume).await)
    }

    pub async fn open(&self, handle: u64) -> Result<()> {
        self.get(handle).await?.open();
        Ok(())
    }

    pub async fn close(&self, handle: u64) -> Result<()> {
        self.get(handle).await?.close();
        Ok(())
    }

    pub async fn read_blocks(&self, handle: u64, ba: u64, cnt: u64, buf: &mut [u8]) -> Result<()> {
        let volume = self.get(handle).await?;
        crate::engine::read_blocks(&volume, ba, cnt, buf).await
    }

    pub async fn write_blocks(&self, handle: u64, ba: u64, cnt: u64, buf: &[u8]) -> Result<()> {
        let volume = self.get(handle).await?;
        crate::engine::write_blocks(&volume, ba, cnt, buf).await
    }

    pub async fn sync_cache(&self, handle: u64, ba: u64, cnt: u64) -> Result<()> {
        let volume = self.get(handle).await?;
        crate::engine::sync_cache(&volume, ba, cnt).await
    }
}

async fn info_for(volume: &Arc<Volume>) -> VolumeInfo {
    let extents = volume.extents_lock.read().await;
    VolumeInfo {
        handle: volume.handle,
        devname: volume.devname.clone(),
        state: volume.state.load(Ordering::SeqCst),
        extent_states: extents.iter().map(|e| e.state.load(Ordering::SeqCst)).collect(),
    }
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
