//! Buffer object free-list pooling.
//!
//! Freeing and re-allocating kernel objects costs ioctl round-trips, so
//! zero-reference objects are parked here and recycled on the next
//! compatible request instead.
//!
//! # Buckets
//!
//! Parked records are stored in power-of-two size buckets,
//! `clamp(ilog2(size), MIN, MAX) - MIN`, so a request scans only records of
//! roughly its own size. Everything above the top granule shares the last
//! bucket. A request matches a record when the record is at least as large
//! and carries exactly the requested flags.
//!
//! # Lifetime
//!
//! A global LRU runs across all buckets. Entries age in whole seconds
//! against a threshold of one, so a parked record survives between one and
//! two seconds before the next insertion evicts it. This is an accepted
//! imprecision, not a precise TTL.
//!
//! The pool is an opportunistic cache, not an allocator: records are never
//! split or coalesced, shared objects are never admitted, and only the
//! time-based eviction bounds the retained footprint.

use {
    crate::driver::{sync, Backend, BackendCaps, Bo, BoFlags, Madvise},
    log::{debug, trace},
    std::{collections::VecDeque, sync::Arc},
};

/// Smallest bucketed size, as a power of two (4 KiB).
pub const MIN_BO_CACHE_BUCKET: u32 = 12;

/// Largest bucketed size, as a power of two (4 MiB); larger records all
/// share the top bucket.
pub const MAX_BO_CACHE_BUCKET: u32 = 22;

const BUCKET_COUNT: usize = (MAX_BO_CACHE_BUCKET - MIN_BO_CACHE_BUCKET + 1) as usize;

/// Whole seconds a parked record may age before eviction.
const STALE_SECS: u64 = 1;

pub(crate) fn bucket_index(size: u64) -> usize {
    debug_assert_ne!(size, 0);

    (size.ilog2().clamp(MIN_BO_CACHE_BUCKET, MAX_BO_CACHE_BUCKET) - MIN_BO_CACHE_BUCKET) as usize
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Requests satisfied from the pool.
    pub hits: u64,

    /// Requests which fell through to the kernel allocator.
    pub misses: u64,

    /// Records destroyed by aging or an explicit flush.
    pub evictions: u64,

    /// Bytes currently parked.
    pub size_bytes: u64,

    /// Records currently parked.
    pub count: usize,
}

/// The result of one pool lookup.
pub(crate) struct FetchOutcome {
    /// The recycled record, referenced again, if one matched.
    pub bo: Option<Arc<Bo>>,

    /// Entries whose backing pages the kernel reclaimed while parked; the
    /// caller destroys them once the pool lock is gone.
    pub reclaimed: Vec<Arc<Bo>>,
}

/// Bucketed free lists plus the LRU that ages them, one lock around both.
///
/// The two indices are always updated together: every parked record is
/// linked into exactly one bucket and the LRU, and `size_bytes` is the sum
/// over parked records. Records in here have a reference count of zero and
/// are owned by the pool until fetched or evicted.
pub(crate) struct BoCache {
    buckets: [VecDeque<Arc<Bo>>; BUCKET_COUNT],
    enabled: bool,
    evictions: u64,
    hits: u64,
    lru: VecDeque<Arc<Bo>>,
    misses: u64,
    size_bytes: u64,
}

impl BoCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::new()),
            enabled,
            evictions: 0,
            hits: 0,
            lru: VecDeque::new(),
            misses: 0,
            size_bytes: 0,
        }
    }

    /// Looks for an idle record of at least `size` bytes carrying exactly
    /// `flags`.
    ///
    /// With `dontwait` the GPU-idleness check polls, and a busy record
    /// abandons the whole bucket: entries behind it are older and assumed
    /// no fresher. Without it the check blocks, which makes this a
    /// suspension point; only the allocation-failure fallback does that.
    #[profiling::function]
    pub fn fetch(
        &mut self,
        backend: &dyn Backend,
        size: u64,
        flags: BoFlags,
        dontwait: bool,
    ) -> FetchOutcome {
        let mut reclaimed = Vec::new();
        let bucket = bucket_index(size);
        let timeout_ns = if dontwait { 0 } else { i64::MAX };

        let mut idx = 0;
        while idx < self.buckets[bucket].len() {
            let entry = Arc::clone(&self.buckets[bucket][idx]);

            if entry.size() < size || entry.flags() != flags {
                idx += 1;

                continue;
            }

            if !sync::wait_idle(backend, &entry, timeout_ns, true) {
                if dontwait {
                    break;
                }

                idx += 1;

                continue;
            }

            self.unlink(bucket, idx, &entry);

            if backend.caps().contains(BackendCaps::MADVISE)
                && !backend.madvise(entry.handle(), Madvise::WillNeed)
            {
                debug!("kernel reclaimed parked {:?}", entry);
                reclaimed.push(entry);

                // The unlink moved the next entry into this index.
                continue;
            }

            entry.revive();
            self.hits += 1;
            trace!("reusing {:?} for {} bytes", entry, size);

            return FetchOutcome {
                bo: Some(entry),
                reclaimed,
            };
        }

        FetchOutcome {
            bo: None,
            reclaimed,
        }
    }

    /// Counts a request that fell through to the kernel allocator.
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Parks a zero-reference record, or refuses it.
    ///
    /// Refusal (`SHARED` set, or pooling disabled) leaves the record
    /// untouched and the caller frees it. On success the returned records
    /// are stale entries that aged out during the opportunistic eviction
    /// pass; the caller destroys them after dropping the pool lock.
    #[profiling::function]
    pub fn put(
        &mut self,
        backend: &dyn Backend,
        bo: &Arc<Bo>,
        now_secs: u64,
    ) -> Option<Vec<Arc<Bo>>> {
        if !self.enabled || bo.flags().contains(BoFlags::SHARED) {
            return None;
        }

        debug_assert_eq!(bo.ref_count(), 0);

        if backend.caps().contains(BackendCaps::MADVISE) {
            // Advisory; a reclaimed answer surfaces at fetch time.
            backend.madvise(bo.handle(), Madvise::DontNeed);
        }

        bo.touch(now_secs);

        let bucket = bucket_index(bo.size());
        self.buckets[bucket].push_back(Arc::clone(bo));
        self.lru.push_back(Arc::clone(bo));
        self.size_bytes += bo.size();

        trace!("parked {:?}", bo);

        Some(self.evict_stale(now_secs))
    }

    /// Unlinks every record older than the stale threshold, head-first.
    pub fn evict_stale(&mut self, now_secs: u64) -> Vec<Arc<Bo>> {
        let mut evicted = Vec::new();

        while let Some(entry) = self.lru.front() {
            if now_secs.saturating_sub(entry.last_used_secs()) <= STALE_SECS {
                break;
            }

            let entry = self.lru.pop_front().expect("LRU head vanished");
            let bucket = bucket_index(entry.size());
            let idx = self.buckets[bucket]
                .iter()
                .position(|bo| Arc::ptr_eq(bo, &entry))
                .expect("parked record missing from its bucket");

            self.buckets[bucket].remove(idx);
            self.size_bytes -= entry.size();
            self.evictions += 1;
            evicted.push(entry);
        }

        evicted
    }

    /// Empties every bucket; the caller destroys the returned records.
    #[profiling::function]
    pub fn evict_all(&mut self) -> Vec<Arc<Bo>> {
        let mut evicted = Vec::with_capacity(self.lru.len());

        for bucket in &mut self.buckets {
            evicted.extend(bucket.drain(..));
        }

        self.lru.clear();
        self.size_bytes = 0;
        self.evictions += evicted.len() as u64;

        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size_bytes: self.size_bytes,
            count: self.lru.len(),
        }
    }

    fn unlink(&mut self, bucket: usize, idx: usize, entry: &Arc<Bo>) {
        let removed = self.buckets[bucket]
            .remove(idx)
            .expect("bucket entry vanished");

        debug_assert!(Arc::ptr_eq(&removed, entry));

        let pos = self
            .lru
            .iter()
            .position(|bo| Arc::ptr_eq(bo, entry))
            .expect("parked record missing from the LRU");

        self.lru.remove(pos);
        self.size_bytes -= entry.size();
    }

    #[cfg(test)]
    pub fn assert_coherent(&self) {
        let mut total = 0;
        let mut linked = 0;

        for (idx, bucket) in self.buckets.iter().enumerate() {
            for entry in bucket {
                assert_eq!(entry.ref_count(), 0);
                assert!(!entry.flags().contains(BoFlags::SHARED));
                assert_eq!(bucket_index(entry.size()), idx);
                assert_eq!(
                    self.lru
                        .iter()
                        .filter(|bo| Arc::ptr_eq(bo, entry))
                        .count(),
                    1
                );

                total += entry.size();
                linked += 1;
            }
        }

        assert_eq!(total, self.size_bytes);
        assert_eq!(linked, self.lru.len());
    }
}
