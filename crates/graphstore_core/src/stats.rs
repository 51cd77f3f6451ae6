//! Storage statistics.
//!
//! One [`StorageStats`] instance is shared by all channels of a database.
//!
//! ```rust,ignore
//! let stats = db.stats();
//! println!("swept: {}", stats.entities_swept);
//! println!("files deleted: {}", stats.files_deleted);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Storage counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct StorageStats {
    stores: AtomicU64,
    entities_stored: AtomicU64,
    bytes_written: AtomicU64,
    loads: AtomicU64,
    entities_loaded: AtomicU64,
    sweeps: AtomicU64,
    entities_swept: AtomicU64,
    files_created: AtomicU64,
    files_deleted: AtomicU64,
    transfers: AtomicU64,
    bytes_transferred: AtomicU64,
    cache_evictions: AtomicU64,
}

impl StorageStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a committed store of `entities` records.
    pub(crate) fn record_store(&self, entities: u64, bytes: u64) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.entities_stored.fetch_add(entities, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a load request.
    pub(crate) fn record_load(&self, entities: u64) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.entities_loaded.fetch_add(entities, Ordering::Relaxed);
    }

    /// Records one channel's sweep.
    pub(crate) fn record_sweep(&self, deleted: u64) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.entities_swept.fetch_add(deleted, Ordering::Relaxed);
    }

    pub(crate) fn record_file_created(&self) {
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_deleted(&self) {
        self.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one transferred run.
    pub(crate) fn record_transfer(&self, bytes: u64) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the number of committed stores.
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Returns the number of records stored.
    pub fn entities_stored(&self) -> u64 {
        self.entities_stored.load(Ordering::Relaxed)
    }

    /// Returns the total bytes written by stores.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the number of load requests.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Returns the number of records loaded.
    pub fn entities_loaded(&self) -> u64 {
        self.entities_loaded.load(Ordering::Relaxed)
    }

    /// Returns the number of channel sweeps.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Returns the number of entities deleted by sweeps.
    pub fn entities_swept(&self) -> u64 {
        self.entities_swept.load(Ordering::Relaxed)
    }

    /// Returns the number of data files created.
    pub fn files_created(&self) -> u64 {
        self.files_created.load(Ordering::Relaxed)
    }

    /// Returns the number of data files deleted.
    pub fn files_deleted(&self) -> u64 {
        self.files_deleted.load(Ordering::Relaxed)
    }

    /// Returns the number of transferred runs.
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes moved by transfers.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Returns the number of evicted cached payloads.
    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            stores: self.stores(),
            entities_stored: self.entities_stored(),
            bytes_written: self.bytes_written(),
            loads: self.loads(),
            entities_loaded: self.entities_loaded(),
            sweeps: self.sweeps(),
            entities_swept: self.entities_swept(),
            files_created: self.files_created(),
            files_deleted: self.files_deleted(),
            transfers: self.transfers(),
            bytes_transferred: self.bytes_transferred(),
            cache_evictions: self.cache_evictions(),
        }
    }
}

/// A point-in-time copy of [`StorageStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Committed stores.
    pub stores: u64,
    /// Records stored.
    pub entities_stored: u64,
    /// Bytes written by stores.
    pub bytes_written: u64,
    /// Load requests.
    pub loads: u64,
    /// Records loaded.
    pub entities_loaded: u64,
    /// Channel sweeps.
    pub sweeps: u64,
    /// Entities deleted by sweeps.
    pub entities_swept: u64,
    /// Data files created.
    pub files_created: u64,
    /// Data files deleted.
    pub files_deleted: u64,
    /// Transferred runs.
    pub transfers: u64,
    /// Bytes moved by transfers.
    pub bytes_transferred: u64,
    /// Evicted cached payloads.
    pub cache_evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(StorageStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = StorageStats::new();
        stats.record_store(3, 120);
        stats.record_store(1, 30);
        stats.record_sweep(2);
        stats.record_transfer(64);

        let snap = stats.snapshot();
        assert_eq!(snap.stores, 2);
        assert_eq!(snap.entities_stored, 4);
        assert_eq!(snap.bytes_written, 150);
        assert_eq!(snap.sweeps, 1);
        assert_eq!(snap.entities_swept, 2);
        assert_eq!(snap.transfers, 1);
        assert_eq!(snap.bytes_transferred, 64);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(StorageStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_load(2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.loads(), 800);
        assert_eq!(stats.entities_loaded(), 1600);
    }
}
