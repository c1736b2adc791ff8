//! Metadata cache: a two-function cuckoo hash table.
//!
//! Maps a 64-bit key to a 64-bit value for hot-path file and directory
//! lookups. Readers are lock-free: every slot field is atomic and a
//! writer-in-progress mark lets lookups skip a slot that is mid-update.
//! Mutations are serialized by the control-plane dispatcher; the table
//! itself never takes a lock.
//!
//! Collisions resolve by cuckoo eviction: a full bucket evicts one resident
//! to its alternate bucket, to a bounded depth. A failed insert unwinds the
//! whole eviction chain so the table is restored to its state just before
//! the attempt.

mod table;

pub use table::{CacheItem, CacheTable};

use std::io::Read;
use std::path::Path;

use tracing::info;
use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::CACHE_PRELOAD_CHUNK_ITEMS;

/// Errors raised by the metadata cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache table is full")]
    Full,

    #[error("invalid bucket count power {0} (expected 1..=28)")]
    InvalidCapacity(u32),

    #[error("preload file is not a whole number of items ({0} trailing bytes)")]
    TruncatedPreload(usize),

    #[error("preload I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk layout of one preloaded cache item.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PackedCacheItem {
    pub key: U64,
    pub value: U64,
}

pub const PACKED_ITEM_BYTES: usize = std::mem::size_of::<PackedCacheItem>();

/// Populate `table` from a file of tightly packed items, streamed in
/// fixed-size chunks. Returns the number of items inserted.
pub fn preload_from_file(table: &CacheTable, path: &Path) -> Result<usize, CacheError> {
    let mut file = std::fs::File::open(path)?;
    let mut chunk = vec![0u8; PACKED_ITEM_BYTES * CACHE_PRELOAD_CHUNK_ITEMS];
    let mut carry = 0usize;
    let mut total = 0usize;

    loop {
        let read = file.read(&mut chunk[carry..])?;
        if read == 0 {
            if carry != 0 {
                return Err(CacheError::TruncatedPreload(carry));
            }
            break;
        }

        let filled = carry + read;
        let whole = filled - filled % PACKED_ITEM_BYTES;
        for raw in chunk[..whole].chunks_exact(PACKED_ITEM_BYTES) {
            let item = PackedCacheItem::read_from_bytes(raw)
                .map_err(|_| CacheError::TruncatedPreload(raw.len()))?;
            table.insert(item.key.get(), item.value.get())?;
            total += 1;
        }

        // Keep any partial trailing item for the next chunk.
        carry = filled - whole;
        if carry != 0 {
            chunk.copy_within(whole..filled, 0);
        }
    }

    info!("metadata cache preloaded with {} items", total);
    Ok(total)
}
