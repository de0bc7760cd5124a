//! The learning reply cache.
//!
//! Watches GET traffic for endpoints that are slow and deterministic. A
//! response seen twice with byte-identical content is frozen as a complete
//! serialized blob; later requests for the same target skip parsing-onward
//! work and write the blob straight to the socket. Entries decay by age, by
//! hit count (to force periodic re-learning), and under a global byte
//! budget.

use crate::{http::types::Method, limits::CacheLimits};
use siphasher::sip::SipHasher24;
use std::{
    hash::Hasher,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::debug;

const CACHE_BUCKETS: usize = 1024;
const SWEEP_BUCKETS: usize = 8;

// Fixed SipHash-2-4 key; fingerprints are opaque comparison values, never
// exposed on the wire.
const HASH_KEY: (u64, u64) = (0x0706050403020100, 0x0f0e0d0c0b0a0908);

#[inline]
fn fingerprint(data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(HASH_KEY.0, HASH_KEY.1);
    hasher.write(data);
    hasher.finish()
}

// Key identity: target hash folded with the first method byte. The target
// includes any query string, so `/a?x=1` and `/a?x=2` learn separately.
#[inline]
fn request_fingerprint(method: Method, target: &str) -> u64 {
    fingerprint(target.as_bytes()) ^ method.as_str().as_bytes()[0] as u64
}

// An unstable entry is a candidate: it remembers only the fingerprint of
// the response last seen. `stable` implies `blob` is present.
struct CacheEntry {
    request_hash: u64,
    response_hash: u64,
    stable: bool,
    blob: Option<Arc<[u8]>>,
    hits: u64,
    created_at: Instant,
}

struct CacheInner {
    buckets: Vec<Vec<CacheEntry>>,
    current_bytes: usize,
    gc_cursor: usize,
}

/// The reply cache. One per [`App`](crate::App), shared by every worker.
///
/// All operations take a single mutex; blobs are handed out as `Arc<[u8]>`
/// clones so the socket write happens outside the lock.
pub(crate) struct ReplyCache {
    inner: Mutex<CacheInner>,
    limits: CacheLimits,
}

/// A point-in-time summary, exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// All entries, candidates included.
    pub entries: usize,
    /// Entries holding a frozen blob.
    pub stable_entries: usize,
    /// Bytes held by frozen blobs.
    pub current_bytes: usize,
}

impl ReplyCache {
    pub(crate) fn new(limits: CacheLimits) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                buckets: (0..CACHE_BUCKETS).map(|_| Vec::new()).collect(),
                current_bytes: 0,
                gc_cursor: 0,
            }),
            limits: limits.normalized(),
        }
    }

    #[inline(always)]
    pub(crate) fn latency_threshold(&self) -> Duration {
        self.limits.latency_threshold
    }

    /// Looks up a frozen reply. Counts the hit, applies age and
    /// revalidation decay, and returns the blob only for stable entries.
    pub(crate) fn get(&self, method: Method, target: &str) -> Option<Arc<[u8]>> {
        if method != Method::Get {
            return None;
        }

        let hash = request_fingerprint(method, target);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let idx = (hash % CACHE_BUCKETS as u64) as usize;

        let pos = inner.buckets[idx]
            .iter()
            .position(|e| e.request_hash == hash)?;

        let entry = &mut inner.buckets[idx][pos];
        entry.hits += 1;

        if self.is_decayed(entry) {
            let removed = inner.buckets[idx].swap_remove(pos);
            if let Some(blob) = removed.blob {
                inner.current_bytes -= blob.len();
            }
            return None;
        }

        let entry = &inner.buckets[idx][pos];
        match entry.stable {
            true => entry.blob.clone(),
            false => None,
        }
    }

    /// Observes a serialized response for a target.
    ///
    /// First observation creates a candidate; a second byte-identical one
    /// freezes the blob; a divergent observation against a frozen entry
    /// demotes it back to candidate. Every call also runs an incremental
    /// sweep and enforces the byte budget.
    pub(crate) fn put(&self, method: Method, target: &str, serialized: &[u8]) {
        if method != Method::Get || serialized.is_empty() {
            return;
        }

        let request_hash = request_fingerprint(method, target);
        let response_hash = fingerprint(serialized);

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let idx = (request_hash % CACHE_BUCKETS as u64) as usize;

        match inner.buckets[idx]
            .iter_mut()
            .find(|e| e.request_hash == request_hash)
        {
            Some(entry) if entry.stable => {
                if entry.response_hash != response_hash {
                    // The endpoint stopped being deterministic; it has to
                    // prove itself again.
                    let freed = entry.blob.take().map(|b| b.len()).unwrap_or(0);
                    entry.stable = false;
                    entry.response_hash = response_hash;
                    entry.hits = 0;
                    inner.current_bytes -= freed;
                    debug!(path = target, freed, "reply cache demoted entry");
                }
            }
            Some(entry) => {
                if entry.response_hash == response_hash {
                    entry.blob = Some(Arc::from(serialized));
                    entry.stable = true;
                    entry.hits = 0;
                    entry.created_at = Instant::now();
                    inner.current_bytes += serialized.len();
                    debug!(path = target, len = serialized.len(), "reply cache stabilized entry");
                } else {
                    entry.response_hash = response_hash;
                }
            }
            None => {
                inner.buckets[idx].push(CacheEntry {
                    request_hash,
                    response_hash,
                    stable: false,
                    blob: None,
                    hits: 0,
                    created_at: Instant::now(),
                });
            }
        }

        self.sweep(inner);
        self.enforce_byte_cap(inner);
    }

    #[inline]
    fn is_decayed(&self, entry: &CacheEntry) -> bool {
        if self.limits.max_entry_age > Duration::ZERO
            && entry.created_at.elapsed() > self.limits.max_entry_age
        {
            return true;
        }
        entry.hits > self.limits.revalidate_hits
    }

    // Visits a fixed number of buckets per call, advancing a persistent
    // cursor, so decay cleanup amortizes across traffic.
    fn sweep(&self, inner: &mut CacheInner) {
        let start = inner.gc_cursor;
        let mut freed = 0;

        for offset in 0..SWEEP_BUCKETS {
            let idx = (start + offset) % CACHE_BUCKETS;
            inner.buckets[idx].retain(|entry| {
                if self.is_decayed(entry) {
                    freed += entry.blob.as_ref().map(|b| b.len()).unwrap_or(0);
                    false
                } else {
                    true
                }
            });
        }

        inner.gc_cursor = (start + SWEEP_BUCKETS) % CACHE_BUCKETS;
        inner.current_bytes -= freed;
    }

    // Evicts the stable entry with the oldest creation timestamp until the
    // budget holds. Candidates hold no bytes and are left alone.
    fn enforce_byte_cap(&self, inner: &mut CacheInner) {
        while inner.current_bytes > self.limits.max_bytes {
            let mut oldest: Option<(usize, usize, Instant)> = None;

            for (bucket_idx, bucket) in inner.buckets.iter().enumerate() {
                for (entry_idx, entry) in bucket.iter().enumerate() {
                    if !entry.stable {
                        continue;
                    }
                    if oldest.map(|(_, _, at)| entry.created_at < at).unwrap_or(true) {
                        oldest = Some((bucket_idx, entry_idx, entry.created_at));
                    }
                }
            }

            let Some((bucket_idx, entry_idx, _)) = oldest else {
                break;
            };
            let removed = inner.buckets[bucket_idx].swap_remove(entry_idx);
            let freed = removed.blob.map(|b| b.len()).unwrap_or(0);
            inner.current_bytes -= freed;
            debug!(freed, "reply cache evicted oldest entry over byte budget");
        }
    }

    /// Current entry and byte counts.
    pub(crate) fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let mut entries = 0;
        let mut stable_entries = 0;
        for bucket in &inner.buckets {
            entries += bucket.len();
            stable_entries += bucket.iter().filter(|e| e.stable).count();
        }
        CacheStats {
            entries,
            stable_entries,
            current_bytes: inner.current_bytes,
        }
    }

    #[cfg(test)]
    fn entry_hits(&self, method: Method, target: &str) -> Option<u64> {
        let hash = request_fingerprint(method, target);
        let inner = self.inner.lock().unwrap();
        let idx = (hash % CACHE_BUCKETS as u64) as usize;
        inner.buckets[idx]
            .iter()
            .find(|e| e.request_hash == hash)
            .map(|e| e.hits)
    }

    // Σ blob lengths over stable entries must equal current_bytes, and
    // stable implies a blob exists.
    #[cfg(test)]
    fn assert_invariants(&self) {
        let inner = self.inner.lock().unwrap();
        let mut total = 0;
        for bucket in &inner.buckets {
            for entry in bucket {
                match entry.stable {
                    true => total += entry.blob.as_ref().expect("stable without blob").len(),
                    false => assert!(entry.blob.is_none(), "candidate holding a blob"),
                }
            }
        }
        assert_eq!(total, inner.current_bytes);
    }
}
