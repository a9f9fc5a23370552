//! The block-layer driver boundary.
//!
//! Per-extent read/write/sync is an external collaborator: production
//! callers hand the engine a `Box<dyn BlockDevice>` per extent (backed by
//! whatever the host's block-layer driver framing looks like). [`MemBlockDevice`]
//! is the in-memory fake the rest of this crate tests against.

use async_trait::async_trait;

use crate::error::Result;

/// One underlying block device backing a single extent.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len() / block_size()` blocks starting at `block_no` into `buf`.
    async fn read(&self, block_no: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf.len() / block_size()` blocks starting at `block_no` from `buf`.
    async fn write(&self, block_no: u64, buf: &[u8]) -> Result<()>;

    /// Flushes any write-back cache; the device must be durable once this returns.
    async fn sync(&self) -> Result<()>;

    fn block_size(&self) -> usize;

    /// Total number of blocks on the device.
    fn num_blocks(&self) -> u64;
}

/// An in-memory [`BlockDevice`] for tests: backs storage with a `Vec<u8>`
/// behind a lock, and can be told to fail every subsequent operation to
/// simulate a dead extent.
pub mod mem {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct MemBlockDevice {
        data: Mutex<Vec<u8>>,
        block_size: usize,
        failed: AtomicBool,
        reads: std::sync::atomic::AtomicU64,
    }

    impl MemBlockDevice {
        pub fn new(num_blocks: u64, block_size: usize) -> Self {
            Self {
                data: Mutex::new(vec![0u8; num_blocks as usize * block_size]),
                block_size,
                failed: AtomicBool::new(false),
                reads: std::sync::atomic::AtomicU64::new(0),
            }
        }

        /// Number of `read` calls observed so far; lets tests assert a
        /// no-read fast path actually issued no reads.
        pub fn read_count(&self) -> u64 {
            self.reads.load(Ordering::SeqCst)
        }

        /// Makes every subsequent read/write/sync return `IoFailure`, simulating
        /// a dead drive without actually losing the in-memory bytes (tests can
        /// still peek at `snapshot` to assert on what was last written).
        pub fn fail(&self) {
            self.failed.store(true, Ordering::SeqCst);
        }

        pub fn recover(&self) {
            self.failed.store(false, Ordering::SeqCst);
        }

        pub fn snapshot(&self) -> Vec<u8> {
            self.data.lock().clone()
        }
    }

    #[async_trait]
    impl BlockDevice for MemBlockDevice {
        async fn read(&self, block_no: u64, buf: &mut [u8]) -> Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.failed.load(Ordering::SeqCst) {
                return Err(crate::error::RaidError::IoFailure);
            }
            let start = block_no as usize * self.block_size;
            let end = start + buf.len();
            let data = self.data.lock();
            if end > data.len() {
                return Err(crate::error::RaidError::RangeError);
            }
            buf.copy_from_slice(&data[start..end]);
            Ok(())
        }

        async fn write(&self, block_no: u64, buf: &[u8]) -> Result<()> {
            if self.failed.load(Ordering::SeqCst) {
                return Err(crate::error::RaidError::IoFailure);
            }
            let start = block_no as usize * self.block_size;
            let end = start + buf.len();
            let mut data = self.data.lock();
            if end > data.len() {
                return Err(crate::error::RaidError::RangeError);
            }
            data[start..end].copy_from_slice(buf);
            Ok(())
        }

        async fn sync(&self) -> Result<()> {
            if self.failed.load(Ordering::SeqCst) {
                return Err(crate::error::RaidError::IoFailure);
            }
            Ok(())
        }

        fn block_size(&self) -> usize {
            self.block_size
        }

        fn num_blocks(&self) -> u64 {
            (self.data.lock().len() / self.block_size) as u64
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn read_after_write_round_trips() {
            let dev = MemBlockDevice::new(16, 512);
            let buf = vec![0x55u8; 512 * 2];
            dev.write(4, &buf).await.unwrap();

            let mut out = vec![0u8; 512 * 2];
            dev.read(4, &mut out).await.unwrap();
            assert_eq!(out, buf);
        }

        #[tokio::test]
        async fn out_of_range_read_errors() {
            let dev = MemBlockDevice::new(4, 512);
            let mut out = vec![0u8; 512];
            let err = dev.read(10, &mut out).await.unwrap_err();
            assert_eq!(err, crate::error::RaidError::RangeError);
        }

        #[tokio::test]
        async fn failed_device_errors_on_every_op() {
            let dev = MemBlockDevice::new(4, 512);
            dev.fail();
            let mut out = vec![0u8; 512];
            assert!(dev.read(0, &mut out).await.is_err());
            assert!(dev.write(0, &out).await.is_err());
            assert!(dev.sync().await.is_err());

            dev.recover();
            assert!(dev.read(0, &mut out).await.is_ok());
        }
    }
}

pub use mem::MemBlockDevice;
