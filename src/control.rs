//! The engine-level operation contract a management front-end binds to.
//! IPC/wire framing is out of scope; this is the typed Rust API such a
//! front-end would call into.

use std::sync::Arc;

use crate::blockdev::BlockDevice;
use crate::error::Result;
use crate::registry::{VolumeInfo, VolumeRegistry};
use crate::volume::{AssembleConfig, VolumeConfig};

pub struct Control {
    registry: VolumeRegistry,
}

impl Control {
    pub fn new() -> Self {
        Self {
            registry: VolumeRegistry::new(),
        }
    }

    pub async fn create(&self, config: VolumeConfig) -> Result<u64> {
        self.registry.create(config).await
    }

    pub async fn assemble(&self, config: AssembleConfig) -> Result<u64> {
        self.registry.assemble(config).await
    }

    pub async fn auto_assemble(&self, candidates: Vec<Arc<dyn BlockDevice>>) -> Vec<u64> {
        self.registry.auto_assemble(candidates).await
    }

    pub async fn stop(&self, handle: u64) -> Result<()> {
        self.registry.stop(handle).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.registry.stop_all().await
    }

    pub async fn fail_extent(&self, handle: u64, index: usize) -> Result<()> {
        self.registry.fail_extent(handle, index).await
    }

    pub async fn add_hotspare(&self, handle: u64, device: Arc<dyn BlockDevice>) -> Result<()> {
        self.registry.add_hotspare(handle, device).await
    }

    pub async fn get_volume_states(&self) -> Vec<VolumeInfo> {
        self.registry.get_volume_states().await
    }

    pub async fn get_volume_info(&self, handle: u64) -> Result<VolumeInfo> {
        self.registry.get_volume_info(handle).await
    }

    pub async fn open(&self, handle: u64) -> Result<()> {
        self.registry.open(handle).await
    }

    pub async fn close(&self, handle: u64) -> Result<()> {
        self.registry.close(handle).await
    }

    pub async fn read_blocks(&self, handle: u64, ba: u64, cnt: u64, buf: &mut [u8]) -> Result<()> {
        self.registry.read_blocks(handle, ba, cnt, buf).await
    }

    pub async fn write_blocks(&self, handle: u64, ba: u64, cnt: u64, buf: &[u8]) -> Result<()> {
        self.registry.write_blocks(handle, ba, cnt, buf).await
    }

    pub async fn sync_cache(&self, handle: u64, ba: u64, cnt: u64) -> Result<()> {
        self.registry.sync_cache(handle, ba, cnt).await
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::volume::{Layout, Level};

    #[tokio::test]
    async fn create_then_stop_round_trips() {
        let control = Control::new();
        let handle = control
            .create(VolumeConfig {
                devname: "vol0".into(),
                level: Level::Raid0,
                layout: Layout::None,
                strip_size: 4096,
                block_size: 512,
                extents: vec![Arc::new(MemBlockDevice::new(64, 512))],
                noop_meta: true,
                read_strategy: crate::engine::raid1::ReadStrategy::RoundRobin,
            })
            .await
            .unwrap();

        assert_eq!(control.get_volume_info(handle).await.unwrap().handle, handle);
        control.stop(handle).await.unwrap();
        assert!(control.get_volume_info(handle).await.is_err());
    }
}
