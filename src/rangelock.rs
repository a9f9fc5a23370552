//! Range-lock table: serializes overlapping stripe I/O and rebuild steps.
//!
//! `acquire` inserts an entry and scans for overlaps; on overlap it joins
//! the overlapper's waiter count and awaits its notify. Once woken, the
//! overlapper is marked "ignored" so it stops attracting new waiters, and
//! the waiter rescans from the start of the list (more overlaps may have
//! appeared while it slept). This guarantees forward progress: an entry can
//! only ever hand off once, so the list always drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Entry {
    id: u64,
    start: u64,
    length: u64,
    pending: u64,
    ignored: bool,
    notify: Arc<Notify>,
}

impl Entry {
    fn overlaps(&self, start: u64, length: u64) -> bool {
        let end = start.saturating_add(length);
        let self_end = self.start.saturating_add(self.length);
        start < self_end && self.start < end
    }
}

pub struct RangeLockTable {
    entries: Mutex<VecDeque<Entry>>,
    next_id: AtomicU64,
}

impl Default for RangeLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeLockTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Acquires `[start, start+length)`, blocking while any non-ignored
    /// entry overlaps it.
    pub async fn acquire(self: &Arc<Self>, start: u64, length: u64) -> RangeLockGuard {
        loop {
            let wait_on = {
                let mut entries = self.entries.lock();
                let overlap = entries.iter_mut().find(|e| !e.ignored && e.overlaps(start, length));
                match overlap {
                    Some(entry) => {
                        entry.pending += 1;
                        Some(entry.notify.clone())
                    }
                    None => None,
                }
            };

            let Some(notify) = wait_on else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let entry = Entry {
                    id,
                    start,
                    length,
                    pending: 1,
                    ignored: false,
                    notify: Arc::new(Notify::new()),
                };
                self.entries.lock().push_back(entry);
                return RangeLockGuard {
                    table: self.clone(),
                    id,
                };
            };

            notify.notified().await;
            let mut entries = self.entries.lock();
            if let Some(pos) = entries.iter().position(|e| std::ptr::eq(e.notify.as_ref(), notify.as_ref())) {
                entries[pos].pending -= 1;
                if entries[pos].pending == 0 {
                    entries.remove(pos);
                }
            }
            // Rescan from the top: more overlaps may have appeared while we slept.
        }
    }

    /// Releases the caller's own hold on `id`: marks it ignored so no new
    /// acquire can join it, decrements its pending count (the caller's own
    /// share of it), and removes it once every joiner has decremented its
    /// share in turn.
    fn release(&self, id: u64) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            entries[pos].ignored = true;
            let notify = entries[pos].notify.clone();
            entries[pos].pending -= 1;
            if entries[pos].pending == 0 {
                entries.remove(pos);
            }
            drop(entries);
            notify.notify_waiters();
        }
    }
}

/// Held for the duration of a range-locked I/O or rebuild step; releases on `Drop`.
pub struct RangeLockGuard {
    table: Arc<RangeLockTable>,
    id: u64,
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn non_overlapping_ranges_do_not_block() {
        let table = Arc::new(RangeLockTable::new());
        let _a = table.acquire(0, 10).await;
        let guard = tokio::time::timeout(Duration::from_millis(50), table.acquire(20, 10)).await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn overlapping_range_blocks_until_release() {
        let table = Arc::new(RangeLockTable::new());
        let a = table.acquire(0, 10).await;

        let table2 = table.clone();
        let waiter = tokio::spawn(async move {
            let _b = table2.acquire(5, 10).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should complete after release")
            .unwrap();
    }

    #[tokio::test]
    async fn three_overlapping_waiters_all_eventually_acquire() {
        let table = Arc::new(RangeLockTable::new());
        let first = table.acquire(0, 10).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let t = table.clone();
            handles.push(tokio::spawn(async move {
                let _g = t.acquire(5, 10).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        for h in handles {
            tokio::time::timeout(Duration::from_millis(500), h).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn contended_entries_fully_drain_after_release() {
        let table = Arc::new(RangeLockTable::new());
        let first = table.acquire(0, 10).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = table.clone();
            handles.push(tokio::spawn(async move {
                let _g = t.acquire(5, 10).await;
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        for h in handles {
            tokio::time::timeout(Duration::from_millis(500), h).await.unwrap().unwrap();
        }

        // Every guard returned above has also been dropped at the end of its
        // task, so nothing should still be pinning an entry in the table.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.entries.lock().len(), 0, "every contended entry must be unlinked once its waiters finish");
    }
}
