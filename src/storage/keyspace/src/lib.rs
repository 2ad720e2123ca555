// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The per-shard keyspace engine. A shard owns a [`slice::DbSlice`]
//! exclusively on one thread: the primary dash table mapping keys to
//! values, the parallel expiry and memcache-flag tables, intent locks,
//! change and move notification buses, and the point-in-time snapshotter
//! that walks the table while the shard keeps accepting writes.
//!
//! Cross-shard work never touches another shard's tables directly; it is
//! dispatched onto the owning thread by the layer above.

pub mod dash;
pub mod expire;
pub mod journal;
pub mod key;
pub mod lock;
pub mod metrics;
pub mod page_usage;
pub mod serializer;
pub mod slice;
pub mod snapshot;
pub mod sortedmap;
pub mod stringset;
pub mod table;
pub mod tiered;
pub mod value;

pub use dash::{Cursor, DashTable, TraverseCursor};
pub use key::PrimeKey;
pub use slice::{DbSlice, SliceConfig};
pub use value::{ObjType, PrimeValue};

use std::sync::OnceLock;

pub type DbIndex = u16;
pub type Lsn = u64;
pub type ShardId = u32;
pub type SlotId = u16;
pub type ClientId = u64;

/// Sentinel database index meaning "every database".
pub const DB_ALL: DbIndex = DbIndex::MAX;

pub const SLOT_COUNT: usize = 16384;

/// Execution context for a keyspace operation: the target database and the
/// wall clock captured when the operation was scheduled.
#[derive(Debug, Clone, Copy)]
pub struct DbContext {
    pub db_index: DbIndex,
    pub time_now_ms: u64,
}

impl DbContext {
    pub fn new(db_index: DbIndex, time_now_ms: u64) -> Self {
        Self {
            db_index,
            time_now_ms,
        }
    }
}

fn hasher() -> &'static ahash::RandomState {
    // Fixed seeds: a key must map to the same shard and the same table
    // position for the lifetime of the process.
    static STATE: OnceLock<ahash::RandomState> = OnceLock::new();
    STATE.get_or_init(|| ahash::RandomState::with_seeds(0x9e3779b9, 0x85ebca6b, 0xc2b2ae35, 0x27d4eb2f))
}

/// Stable 64-bit fingerprint of a key. Shard routing, table placement and
/// intent locks all derive from this value.
pub fn hash_key(key: &[u8]) -> u64 {
    hasher().hash_one(key)
}

/// Maps a key to its cluster slot.
pub fn key_slot(key: &[u8]) -> SlotId {
    (hash_key(key) & (SLOT_COUNT as u64 - 1)) as SlotId
}

pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

common::metrics::metrics_sanity!();
