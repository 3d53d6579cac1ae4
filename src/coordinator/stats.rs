use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of coordinator activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Calls attempted through a cache handle (including post-recreation retries).
    pub cached_calls: u64,
    /// Calls sent with the full prompt.
    pub direct_calls: u64,
    /// Cached calls that came back `cache_invalid`.
    pub cache_invalidations: u64,
    /// Successful cache creations, construction included.
    pub recreations: u64,
    /// Failed cache creations, construction included.
    pub recreation_failures: u64,
    /// Times the coordinator dropped from cached to direct mode.
    pub downgrades: u64,
    /// Recoveries that found the handle already replaced by another caller.
    pub skipped_recreations: u64,
}

impl CoordinatorStats {
    /// Share of generation calls served through the cache.
    pub fn cached_ratio(&self) -> f64 {
        let total = self.cached_calls + self.direct_calls;
        if total == 0 {
            0.0
        } else {
            self.cached_calls as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicStats {
    pub cached_calls: AtomicU64,
    pub direct_calls: AtomicU64,
    pub cache_invalidations: AtomicU64,
    pub recreations: AtomicU64,
    pub recreation_failures: AtomicU64,
    pub downgrades: AtomicU64,
    pub skipped_recreations: AtomicU64,
}

impl AtomicStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cached_calls: self.cached_calls.load(Ordering::Relaxed),
            direct_calls: self.direct_calls.load(Ordering::Relaxed),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            recreations: self.recreations.load(Ordering::Relaxed),
            recreation_failures: self.recreation_failures.load(Ordering::Relaxed),
            downgrades: self.downgrades.load(Ordering::Relaxed),
            skipped_recreations: self.skipped_recreations.load(Ordering::Relaxed),
        }
    }
}
