// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A single logical database: the primary table plus its parallel expiry
//! and memcache-flag tables, the intent-lock table, watched keys and
//! per-slot statistics.

use crate::dash::{DashTable, TraverseCursor};
use crate::expire::ExpirePeriod;
use crate::lock::LockTable;
use crate::value::{ObjType, PrimeValue};
use crate::{DbIndex, SlotId, SLOT_COUNT};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub type PrimeTable = DashTable<PrimeValue>;
pub type ExpireTable = DashTable<ExpirePeriod>;
pub type McFlagTable = DashTable<u32>;

/// Shared flag a transaction watches: any write to a watched key flips
/// `dirty` and the optimistic transaction aborts at EXEC time.
#[derive(Debug, Default)]
pub struct WatchState {
    pub dirty: AtomicBool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SlotStats {
    pub key_count: i64,
    pub total_reads: u64,
    pub total_writes: u64,
    pub memory_bytes: i64,
}

/// A set of cluster slots targeted by a flush.
#[derive(Debug, Clone, Default)]
pub struct SlotSet {
    slots: std::collections::HashSet<SlotId>,
}

impl SlotSet {
    pub fn from_slots(slots: impl IntoIterator<Item = SlotId>) -> Self {
        Self {
            slots: slots.into_iter().collect(),
        }
    }

    pub fn from_ranges(ranges: &[(SlotId, SlotId)]) -> Self {
        let mut slots = std::collections::HashSet::new();
        for &(start, end) in ranges {
            for s in start..=end {
                slots.insert(s);
            }
        }
        Self { slots }
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.slots.contains(&slot)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Frequency sampler for hot keys, enabled on demand.
#[derive(Debug, Default)]
pub struct TopKeys {
    min_count_to_record: u64,
    counts: HashMap<Vec<u8>, u64>,
}

impl TopKeys {
    pub fn new(min_count_to_record: u64) -> Self {
        Self {
            min_count_to_record,
            counts: HashMap::new(),
        }
    }

    pub fn touch(&mut self, key: &[u8]) {
        *self.counts.entry(key.to_vec()).or_default() += 1;
    }

    pub fn into_top_keys(self) -> Vec<(Vec<u8>, u64)> {
        let min = self.min_count_to_record;
        self.counts
            .into_iter()
            .filter(|(_, count)| *count >= min)
            .collect()
    }
}

/// Unique-key sampler, enabled on demand. Stores key hashes rather than a
/// dense sketch; the count it reports is exact.
#[derive(Debug, Default)]
pub struct KeySampler {
    hashes: std::collections::HashSet<u64>,
}

impl KeySampler {
    pub fn touch(&mut self, key: &[u8]) {
        self.hashes.insert(crate::hash_key(key));
    }

    pub fn unique_count(&self) -> usize {
        self.hashes.len()
    }
}

#[derive(Debug, Default, Clone)]
pub struct DbTableStats {
    pub inline_keys: u64,
    /// Heap bytes attributed to keys and values, best-effort.
    pub obj_memory_usage: i64,
    pub tiered_entries: u64,
    pub tiered_used_bytes: u64,
    per_type_memory: [i64; ObjType::COUNT],
}

impl DbTableStats {
    pub fn add_type_memory_usage(&mut self, ty: ObjType, delta: i64) {
        debug_assert!(
            self.obj_memory_usage + delta >= 0,
            "can't decrease {delta} from {}",
            self.obj_memory_usage
        );
        self.obj_memory_usage += delta;
        self.per_type_memory[ty.index()] += delta;
    }

    pub fn type_memory_usage(&self, ty: ObjType) -> i64 {
        self.per_type_memory[ty.index()]
    }

    pub fn merge(&mut self, other: &DbTableStats) {
        self.inline_keys += other.inline_keys;
        self.obj_memory_usage += other.obj_memory_usage;
        self.tiered_entries += other.tiered_entries;
        self.tiered_used_bytes += other.tiered_used_bytes;
        for i in 0..ObjType::COUNT {
            self.per_type_memory[i] += other.per_type_memory[i];
        }
    }
}

/// Aggregated per-database statistics exposed to the stats surface.
#[derive(Debug, Default, Clone)]
pub struct DbStats {
    pub table: DbTableStats,
    pub key_count: u64,
    pub expire_count: u64,
    pub prime_capacity: u64,
    pub expire_capacity: u64,
    pub table_mem_usage: u64,
}

impl DbStats {
    pub fn merge(&mut self, other: &DbStats) {
        self.table.merge(&other.table);
        self.key_count += other.key_count;
        self.expire_count += other.expire_count;
        self.prime_capacity += other.prime_capacity;
        self.expire_capacity += other.expire_capacity;
        self.table_mem_usage += other.table_mem_usage;
    }
}

pub struct DbTable {
    pub index: DbIndex,
    pub prime: PrimeTable,
    pub expire: ExpireTable,
    pub mcflag: McFlagTable,
    pub trans_locks: LockTable,
    pub stats: DbTableStats,
    pub watched_keys: HashMap<Vec<u8>, Vec<Arc<WatchState>>>,
    pub expire_cursor: Option<TraverseCursor>,
    pub expired_keys_events: Vec<Vec<u8>>,
    pub slots_stats: Option<Vec<SlotStats>>,
    pub top_keys: Option<TopKeys>,
    pub key_sampler: Option<KeySampler>,
}

impl DbTable {
    pub fn new(index: DbIndex) -> Self {
        Self {
            index,
            prime: PrimeTable::new(),
            expire: ExpireTable::new(),
            mcflag: McFlagTable::new(),
            trans_locks: LockTable::default(),
            stats: DbTableStats::default(),
            watched_keys: HashMap::new(),
            expire_cursor: None,
            expired_keys_events: Vec::new(),
            slots_stats: None,
            top_keys: None,
            key_sampler: None,
        }
    }

    pub fn enable_slot_stats(&mut self) {
        if self.slots_stats.is_none() {
            self.slots_stats = Some(vec![SlotStats::default(); SLOT_COUNT]);
        }
    }

    /// Structural memory of the three tables, excluding object heap.
    pub fn table_memory(&self) -> usize {
        self.prime.mem_usage() + self.expire.mem_usage() + self.mcflag.mem_usage()
    }

    pub fn ram_usage(&self) -> usize {
        self.table_memory() + self.stats.obj_memory_usage.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_memory_tracks_by_kind() {
        let mut stats = DbTableStats::default();
        stats.add_type_memory_usage(ObjType::String, 100);
        stats.add_type_memory_usage(ObjType::Set, 50);
        stats.add_type_memory_usage(ObjType::String, -40);
        assert_eq!(stats.obj_memory_usage, 110);
        assert_eq!(stats.type_memory_usage(ObjType::String), 60);
        assert_eq!(stats.type_memory_usage(ObjType::Set), 50);
    }

    #[test]
    fn slot_set_ranges() {
        let set = SlotSet::from_ranges(&[(0, 3), (10, 10)]);
        assert!(set.contains(2));
        assert!(set.contains(10));
        assert!(!set.contains(4));
    }
}
