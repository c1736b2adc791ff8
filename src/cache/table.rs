//! The cuckoo hash table.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::CacheError;
use crate::constants::CACHE_BUCKET_SIZE;

const HASH_SEED_1: u64 = 0x9E37_79B9_7F4A_7C15;
const HASH_SEED_2: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// Hash value marking a vacant slot.
const VACANT: u32 = 0;

/// A key/value pair stored in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheItem {
    pub key: u64,
    pub value: u64,
}

/// An element in flight during insertion: the item plus its hash pair.
/// `h1` is the hash of the bucket it lives in (or is headed to); `h2` is
/// the alternate.
#[derive(Debug, Clone, Copy)]
struct Element {
    key: u64,
    value: u64,
    h1: u32,
    h2: u32,
}

struct CacheSlot {
    /// Hash under which the resident element was stored; `VACANT` if free.
    hash: AtomicU32,
    /// The resident element's alternate hash.
    alt: AtomicU32,
    /// Writer-in-progress mark; readers skip the slot while set.
    occ: AtomicU8,
    key: AtomicU64,
    value: AtomicU64,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            hash: AtomicU32::new(VACANT),
            alt: AtomicU32::new(VACANT),
            occ: AtomicU8::new(0),
            key: AtomicU64::new(0),
            value: AtomicU64::new(0),
        }
    }

    fn store(&self, e: &Element) {
        self.occ.store(1, Ordering::Release);
        self.key.store(e.key, Ordering::Release);
        self.value.store(e.value, Ordering::Release);
        self.alt.store(e.h2, Ordering::Release);
        self.hash.store(e.h1, Ordering::Release);
        self.occ.store(0, Ordering::Release);
    }

    fn load(&self) -> Element {
        Element {
            key: self.key.load(Ordering::Acquire),
            value: self.value.load(Ordering::Acquire),
            h1: self.hash.load(Ordering::Acquire),
            h2: self.alt.load(Ordering::Acquire),
        }
    }

    fn clear(&self) {
        self.occ.store(1, Ordering::Release);
        self.key.store(0, Ordering::Release);
        self.value.store(0, Ordering::Release);
        self.alt.store(VACANT, Ordering::Release);
        self.hash.store(VACANT, Ordering::Release);
        self.occ.store(0, Ordering::Release);
    }
}

struct CacheBucket {
    slots: [CacheSlot; CACHE_BUCKET_SIZE],
}

/// Two-function cuckoo hash table with lock-free readers.
///
/// At most one mutating caller at a time; lookups may run concurrently with
/// the mutator.
pub struct CacheTable {
    buckets: Box<[CacheBucket]>,
    mask: u32,
    max_evict_depth: usize,
}

/// The two hashes of a key, normalized: never vacant, never equal.
fn hash_pair(key: u64) -> (u32, u32) {
    let bytes = key.to_le_bytes();
    let mut h1 = xxh3_64_with_seed(&bytes, HASH_SEED_1) as u32;
    let mut h2 = xxh3_64_with_seed(&bytes, HASH_SEED_2) as u32;
    if h1 == VACANT {
        h1 = 0x9E37_79B9;
    }
    if h2 == h1 || h2 == VACANT {
        h2 = !h1;
        if h2 == VACANT {
            h2 = 1;
        }
    }
    (h1, h2)
}

impl CacheTable {
    /// Create a table with `2^bucket_count_power` buckets.
    pub fn new(bucket_count_power: u32) -> Result<Self, CacheError> {
        if bucket_count_power == 0 || bucket_count_power > 28 {
            return Err(CacheError::InvalidCapacity(bucket_count_power));
        }
        let bucket_count = 1usize << bucket_count_power;
        let capacity = bucket_count * CACHE_BUCKET_SIZE;
        let max_evict_depth = ((bucket_count_power as usize) << 2).min(capacity);

        let buckets = (0..bucket_count)
            .map(|_| CacheBucket {
                slots: std::array::from_fn(|_| CacheSlot::empty()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            buckets,
            mask: bucket_count as u32 - 1,
            max_evict_depth,
        })
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.buckets.len() * CACHE_BUCKET_SIZE
    }

    fn bucket(&self, hash: u32) -> &CacheBucket {
        &self.buckets[(hash & self.mask) as usize]
    }

    /// Insert or update a key.
    ///
    /// On a full table the entire eviction chain is unwound before
    /// returning [`CacheError::Full`]; the table is then byte-for-byte the
    /// state it had before the call.
    pub fn insert(&self, key: u64, value: u64) -> Result<(), CacheError> {
        let (h1, h2) = hash_pair(key);
        let mut carrier = Element { key, value, h1, h2 };
        let mut offset = 0usize;

        for _ in 0..self.max_evict_depth {
            let bucket = self.bucket(carrier.h1);

            for slot in &bucket.slots {
                let stored = slot.hash.load(Ordering::Acquire);
                if stored == VACANT {
                    slot.store(&carrier);
                    return Ok(());
                }
                if stored == carrier.h1 && slot.key.load(Ordering::Acquire) == carrier.key {
                    // Key already present: update in place.
                    slot.occ.store(1, Ordering::Release);
                    slot.value.store(carrier.value, Ordering::Release);
                    slot.occ.store(0, Ordering::Release);
                    return Ok(());
                }
            }

            // Bucket full: evict the resident at the running offset. The
            // victim's hashes swap so its primary becomes its alternate
            // bucket.
            let slot = &bucket.slots[offset];
            let resident = slot.load();
            slot.store(&carrier);
            carrier = Element {
                key: resident.key,
                value: resident.value,
                h1: resident.h2,
                h2: resident.h1,
            };

            offset += 1;
            if offset == CACHE_BUCKET_SIZE {
                offset = 0;
            }
        }

        // Eviction depth exhausted: unwind the chain, restoring every
        // displaced element to where it was.
        for _ in 0..self.max_evict_depth {
            let bucket = self.bucket(carrier.h2);
            offset = if offset == 0 {
                CACHE_BUCKET_SIZE - 1
            } else {
                offset - 1
            };

            let slot = &bucket.slots[offset];
            let displaced = slot.load();
            slot.store(&Element {
                key: carrier.key,
                value: carrier.value,
                h1: carrier.h2,
                h2: carrier.h1,
            });
            carrier = displaced;
        }

        debug_assert_eq!(carrier.key, key, "unwind must end at the new item");
        Err(CacheError::Full)
    }

    fn probe(&self, bucket_hash: u32, key: u64) -> Option<u64> {
        let bucket = self.bucket(bucket_hash);
        for slot in &bucket.slots {
            if slot.hash.load(Ordering::Acquire) == bucket_hash {
                if slot.occ.load(Ordering::Acquire) != 0 {
                    // Writer in progress; the element is unreadable right
                    // now and, mid-relocation, discoverable elsewhere.
                    continue;
                }
                if slot.key.load(Ordering::Acquire) == key {
                    return Some(slot.value.load(Ordering::Acquire));
                }
            }
        }
        None
    }

    /// Look up a key. Lock-free; may run concurrently with the mutator.
    pub fn lookup(&self, key: u64) -> Option<u64> {
        let (h1, h2) = hash_pair(key);
        self.probe(h1, key).or_else(|| self.probe(h2, key))
    }

    /// Remove a key, clearing both the element and its hash slot.
    pub fn delete(&self, key: u64) {
        let (h1, h2) = hash_pair(key);
        for hash in [h1, h2] {
            let bucket = self.bucket(hash);
            for slot in &bucket.slots {
                if slot.hash.load(Ordering::Acquire) == hash
                    && slot.key.load(Ordering::Acquire) == key
                {
                    slot.clear();
                    return;
                }
            }
        }
    }

    /// Number of occupied slots. Intended for diagnostics.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|b| b.slots.iter())
            .filter(|s| s.hash.load(Ordering::Acquire) != VACANT)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_delete() {
        let table = CacheTable::new(4).unwrap();

        assert_eq!(table.lookup(42), None);
        table.insert(42, 1000).unwrap();
        assert_eq!(table.lookup(42), Some(1000));

        // Update in place.
        table.insert(42, 2000).unwrap();
        assert_eq!(table.lookup(42), Some(2000));
        assert_eq!(table.len(), 1);

        table.delete(42);
        assert_eq!(table.lookup(42), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_many_keys_with_evictions() {
        // 16 buckets x 8 slots = 128 capacity; 100 keys force eviction
        // chains while staying under the load where cuckoo fails.
        let table = CacheTable::new(4).unwrap();
        for key in 0..100u64 {
            table.insert(key, key * 3).unwrap();
        }
        for key in 0..100u64 {
            assert_eq!(table.lookup(key), Some(key * 3), "key {}", key);
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_failed_insert_restores_table() {
        // Tiny table: 2 buckets x 8 slots. Fill until an insert fails, then
        // verify every previously inserted key is still intact.
        let table = CacheTable::new(1).unwrap();
        let mut inserted = Vec::new();
        let mut failed_at = None;

        for key in 1..=1000u64 {
            match table.insert(key, key + 7) {
                Ok(()) => inserted.push(key),
                Err(CacheError::Full) => {
                    failed_at = Some(key);
                    break;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        let failed_key = failed_at.expect("table of 16 slots must fill");
        assert_eq!(table.lookup(failed_key), None);
        for key in &inserted {
            assert_eq!(table.lookup(*key), Some(key + 7), "key {}", key);
        }
        assert_eq!(table.len(), inserted.len());
    }

    #[test]
    fn test_delete_then_reinsert() {
        let table = CacheTable::new(2).unwrap();
        for key in 0..20u64 {
            table.insert(key, key).unwrap();
        }
        for key in (0..20u64).step_by(2) {
            table.delete(key);
        }
        for key in 0..20u64 {
            let expect = if key % 2 == 0 { None } else { Some(key) };
            assert_eq!(table.lookup(key), expect);
        }
        // Deleted slots are reusable.
        for key in (0..20u64).step_by(2) {
            table.insert(key, key + 100).unwrap();
        }
        assert_eq!(table.lookup(4), Some(104));
    }

    #[test]
    fn test_hash_pair_never_vacant_or_equal() {
        for key in 0..10_000u64 {
            let (h1, h2) = hash_pair(key);
            assert_ne!(h1, VACANT);
            assert_ne!(h2, VACANT);
            assert_ne!(h1, h2);
        }
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::Arc;

        let table = Arc::new(CacheTable::new(6).unwrap());
        for key in 0..200u64 {
            table.insert(key, key).unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        for key in 0..200u64 {
                            if let Some(v) = table.lookup(key) {
                                assert_eq!(v, key);
                            }
                        }
                    }
                })
            })
            .collect();

        // One writer mutating a disjoint key range while readers run.
        for key in 1000..1200u64 {
            table.insert(key, key).unwrap();
            table.delete(key);
        }

        for r in readers {
            r.join().unwrap();
        }
    }
}
