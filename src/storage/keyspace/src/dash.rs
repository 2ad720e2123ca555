// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Segmented extendible hash table with versioned buckets. Each segment
//! holds fixed-size regular buckets plus a few stash buckets that absorb
//! overflow from full homes; lookups probe the home bucket and, when it
//! has spilled, the stashes. Every bucket carries a version word used by
//! the snapshotter: a bucket with version < S has been neither inserted
//! into nor mutated since version S was handed out.
//!
//! Traversal is bucket-major: the outer axis is the bucket index, the
//! inner axis the segment. Segment splits keep an entry's bucket index,
//! so a traversal started before a split still covers every entry that
//! survives it.

use crate::key::PrimeKey;
use crate::metrics::*;
use common::{OpResult, OpStatus};
use std::cell::Cell;

pub const SLOT_NUM: usize = 12;
pub const REGULAR_BUCKETS: usize = 56;
pub const STASH_BUCKETS: usize = 4;
pub const TOTAL_BUCKETS: usize = REGULAR_BUCKETS + STASH_BUCKETS;
pub const SEG_CAPACITY: usize = TOTAL_BUCKETS * SLOT_NUM;

const MAX_INSERT_ATTEMPTS: usize = 16;

/// Position of a slot (or, with `slot` ignored, a bucket) in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cursor {
    pub seg: u32,
    pub bucket: u8,
    pub slot: u8,
}

impl Cursor {
    pub fn segment_id(&self) -> u32 {
        self.seg
    }

    pub fn bucket_id(&self) -> u8 {
        self.bucket
    }

    pub fn slot_id(&self) -> u8 {
        self.slot
    }

    pub fn bucket_cursor(&self) -> Cursor {
        Cursor {
            seg: self.seg,
            bucket: self.bucket,
            slot: 0,
        }
    }

    pub fn is_stash(&self) -> bool {
        (self.bucket as usize) >= REGULAR_BUCKETS
    }
}

/// Bucket-major traversal position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraverseCursor {
    pub bucket: u8,
    pub seg: u32,
}

struct Bucket<V> {
    version: Cell<u64>,
    // entries homed here that live in a stash bucket
    overflow: u8,
    fps: [u8; SLOT_NUM],
    slots: [Option<(PrimeKey, V)>; SLOT_NUM],
}

impl<V> Bucket<V> {
    fn new() -> Self {
        Self {
            version: Cell::new(0),
            overflow: 0,
            fps: [0; SLOT_NUM],
            slots: std::array::from_fn(|_| None),
        }
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

struct Segment<V> {
    local_depth: u32,
    buckets: Vec<Bucket<V>>,
}

impl<V> Segment<V> {
    fn new(local_depth: u32) -> Self {
        Self {
            local_depth,
            buckets: (0..TOTAL_BUCKETS).map(|_| Bucket::new()).collect(),
        }
    }

    fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.occupied()).sum()
    }
}

pub struct HotBuckets {
    pub key_hash: u64,
    pub home: Cursor,
    pub stash: Vec<Cursor>,
}

/// Hooks consulted by [`DashTable::insert_new`] when a bucket group fills
/// up: whether the table may split, and how to reclaim slots when it may
/// not. Garbage collection is consulted before eviction.
pub trait EvictionPolicy<V> {
    fn can_grow(&mut self, tbl: &DashTable<V>) -> bool;

    fn record_split(&mut self, _tbl: &DashTable<V>) {}

    fn on_move(&mut self, _src: Cursor, _dst: Cursor) {}

    /// Reclaims expired entries around the hot buckets. Returns slots
    /// freed.
    fn garbage_collect(&mut self, _hot: &HotBuckets, _tbl: &mut DashTable<V>) -> usize {
        0
    }

    /// Force-evicts an entry around the hot buckets. Returns slots freed.
    fn evict(&mut self, _hot: &HotBuckets, _tbl: &mut DashTable<V>) -> usize {
        0
    }
}

/// Policy for tables with no memory ceiling (expiry, memcache flags).
pub struct AlwaysGrow;

impl<V> EvictionPolicy<V> for AlwaysGrow {
    fn can_grow(&mut self, _tbl: &DashTable<V>) -> bool {
        true
    }
}

/// Hooks for LRU-ish promotion of an entry toward its home bucket.
pub trait BumpPolicy {
    fn can_bump(&self, key: &PrimeKey) -> bool;
    fn on_move(&mut self, _src: Cursor, _dst: Cursor) {}
}

pub struct DashTable<V> {
    segments: Vec<Segment<V>>,
    // directory entries index into `segments`; a segment with local depth
    // d owns a 2^(global_depth - d) aligned run of entries
    dir: Vec<u32>,
    global_depth: u32,
    size: usize,
    stash_unloaded: u64,
}

impl<V> Default for DashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DashTable<V> {
    pub fn new() -> Self {
        Self {
            segments: vec![Segment::new(0)],
            dir: vec![0],
            global_depth: 0,
            size: 0,
            stash_unloaded: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.segments.len() * SEG_CAPACITY
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn depth(&self) -> u32 {
        self.global_depth
    }

    pub fn next_seg(&self, seg: usize) -> usize {
        seg + 1
    }

    pub fn largest_bucket_id(&self) -> u8 {
        (TOTAL_BUCKETS - 1) as u8
    }

    pub fn stash_unloaded(&self) -> u64 {
        self.stash_unloaded
    }

    /// Structural memory of the directory and segment arrays; the heap
    /// owned by keys and values is accounted separately by the owner.
    pub fn mem_usage(&self) -> usize {
        self.dir.len() * std::mem::size_of::<u32>()
            + self.segments.len()
                * (std::mem::size_of::<Bucket<V>>() * TOTAL_BUCKETS
                    + std::mem::size_of::<Segment<V>>())
    }

    fn dir_index(&self, hash: u64) -> usize {
        if self.global_depth == 0 {
            0
        } else {
            (hash >> (64 - self.global_depth)) as usize
        }
    }

    fn seg_for_hash(&self, hash: u64) -> u32 {
        self.dir[self.dir_index(hash)]
    }

    fn home_bucket(hash: u64) -> u8 {
        (((hash >> 8) as usize) % REGULAR_BUCKETS) as u8
    }

    fn fp(hash: u64) -> u8 {
        (hash & 0xFF) as u8
    }

    pub fn is_occupied(&self, c: Cursor) -> bool {
        self.segments
            .get(c.seg as usize)
            .and_then(|s| s.buckets.get(c.bucket as usize))
            .map(|b| b.slots[c.slot as usize].is_some())
            .unwrap_or(false)
    }

    pub fn entry(&self, c: Cursor) -> Option<(&PrimeKey, &V)> {
        self.segments
            .get(c.seg as usize)?
            .buckets
            .get(c.bucket as usize)?
            .slots
            .get(c.slot as usize)?
            .as_ref()
            .map(|(k, v)| (k, v))
    }

    pub fn entry_mut(&mut self, c: Cursor) -> Option<(&mut PrimeKey, &mut V)> {
        self.segments
            .get_mut(c.seg as usize)?
            .buckets
            .get_mut(c.bucket as usize)?
            .slots
            .get_mut(c.slot as usize)?
            .as_mut()
            .map(|(k, v)| (&mut *k, &mut *v))
    }

    pub fn key_of(&self, c: Cursor) -> &PrimeKey {
        self.entry(c).expect("cursor must be occupied").0
    }

    pub fn value_of(&self, c: Cursor) -> &V {
        self.entry(c).expect("cursor must be occupied").1
    }

    pub fn version(&self, c: Cursor) -> u64 {
        self.segments[c.seg as usize].buckets[c.bucket as usize]
            .version
            .get()
    }

    /// Stamps the bucket version. Interior mutability lets the snapshot
    /// walker mark buckets as captured while holding a shared reference.
    pub fn set_version(&self, c: Cursor, v: u64) {
        self.segments[c.seg as usize].buckets[c.bucket as usize]
            .version
            .set(v);
    }

    pub fn find(&self, key: &[u8]) -> Option<Cursor> {
        HASH_LOOKUP.increment();
        let hash = crate::hash_key(key);
        self.find_hashed(key, hash)
    }

    fn find_hashed(&self, key: &[u8], hash: u64) -> Option<Cursor> {
        let seg_id = self.seg_for_hash(hash);
        let seg = &self.segments[seg_id as usize];
        let home = Self::home_bucket(hash);
        let fp = Self::fp(hash);

        let probe = |bucket_id: usize| -> Option<u8> {
            let bucket = &seg.buckets[bucket_id];
            for slot in 0..SLOT_NUM {
                if bucket.fps[slot] != fp {
                    continue;
                }
                if let Some((k, _)) = &bucket.slots[slot] {
                    if k.as_bytes() == key {
                        return Some(slot as u8);
                    }
                    HASH_TAG_COLLISION.increment();
                }
            }
            None
        };

        if let Some(slot) = probe(home as usize) {
            return Some(Cursor {
                seg: seg_id,
                bucket: home,
                slot,
            });
        }
        if seg.buckets[home as usize].overflow > 0 {
            for bucket_id in REGULAR_BUCKETS..TOTAL_BUCKETS {
                if let Some(slot) = probe(bucket_id) {
                    return Some(Cursor {
                        seg: seg_id,
                        bucket: bucket_id as u8,
                        slot,
                    });
                }
            }
        }
        None
    }

    /// Hash-only probe: returns the first entry with a matching hash for
    /// which `pred` holds. Used by bump-up bookkeeping where a rare
    /// collision is acceptable.
    pub fn find_first(&self, hash: u64, pred: impl Fn(&PrimeKey) -> bool) -> Option<Cursor> {
        let seg_id = self.seg_for_hash(hash);
        let seg = &self.segments[seg_id as usize];
        let home = Self::home_bucket(hash);
        let fp = Self::fp(hash);

        let mut candidates: Vec<usize> = vec![home as usize];
        if seg.buckets[home as usize].overflow > 0 {
            candidates.extend(REGULAR_BUCKETS..TOTAL_BUCKETS);
        }
        for bucket_id in candidates {
            let bucket = &seg.buckets[bucket_id];
            for slot in 0..SLOT_NUM {
                if bucket.fps[slot] != fp {
                    continue;
                }
                if let Some((k, _)) = &bucket.slots[slot] {
                    if pred(k) {
                        return Some(Cursor {
                            seg: seg_id,
                            bucket: bucket_id as u8,
                            slot: slot as u8,
                        });
                    }
                }
            }
        }
        None
    }

    /// Upsert-free insert used by tables with no memory ceiling: returns
    /// the existing cursor with `false` when the key is already present.
    pub fn insert(&mut self, key: PrimeKey, value: V) -> (Cursor, bool) {
        let hash = key.hash_code();
        if let Some(c) = self.find_hashed(key.as_bytes(), hash) {
            return (c, false);
        }
        let c = self
            .insert_new_hashed(key, value, hash, &mut AlwaysGrow)
            .expect("growth is unbounded");
        (c, true)
    }

    /// Inserts a key that must not be present. When the target bucket
    /// group is full the policy decides between splitting, garbage
    /// collection and eviction; when none of them frees a slot the insert
    /// fails with out-of-memory.
    pub fn insert_new(
        &mut self,
        key: PrimeKey,
        value: V,
        policy: &mut impl EvictionPolicy<V>,
    ) -> OpResult<Cursor> {
        let hash = key.hash_code();
        debug_assert!(self.find_hashed(key.as_bytes(), hash).is_none());
        self.insert_new_hashed(key, value, hash, policy)
    }

    fn insert_new_hashed(
        &mut self,
        key: PrimeKey,
        value: V,
        hash: u64,
        policy: &mut impl EvictionPolicy<V>,
    ) -> OpResult<Cursor> {
        let fp = Self::fp(hash);
        let home = Self::home_bucket(hash);

        for _ in 0..MAX_INSERT_ATTEMPTS {
            let seg_id = self.seg_for_hash(hash);
            let seg = &mut self.segments[seg_id as usize];

            if let Some(slot) = seg.buckets[home as usize].first_free() {
                let bucket = &mut seg.buckets[home as usize];
                bucket.slots[slot] = Some((key, value));
                bucket.fps[slot] = fp;
                self.size += 1;
                HASH_INSERT.increment();
                return Ok(Cursor {
                    seg: seg_id,
                    bucket: home,
                    slot: slot as u8,
                });
            }

            let stash_slot = (REGULAR_BUCKETS..TOTAL_BUCKETS)
                .find_map(|b| seg.buckets[b].first_free().map(|s| (b, s)));
            if let Some((bucket_id, slot)) = stash_slot {
                seg.buckets[home as usize].overflow += 1;
                let bucket = &mut seg.buckets[bucket_id];
                bucket.slots[slot] = Some((key, value));
                bucket.fps[slot] = fp;
                self.size += 1;
                HASH_INSERT.increment();
                return Ok(Cursor {
                    seg: seg_id,
                    bucket: bucket_id as u8,
                    slot: slot as u8,
                });
            }

            if policy.can_grow(self) {
                self.split(seg_id, policy);
                continue;
            }

            let hot = self.hot_buckets(hash, seg_id);
            let mut freed = policy.garbage_collect(&hot, self);
            if freed == 0 {
                freed = policy.evict(&hot, self);
            }
            if freed == 0 {
                HASH_INSERT_EX.increment();
                return Err(OpStatus::OutOfMemory);
            }
        }

        HASH_INSERT_EX.increment();
        Err(OpStatus::OutOfMemory)
    }

    fn hot_buckets(&self, hash: u64, seg_id: u32) -> HotBuckets {
        HotBuckets {
            key_hash: hash,
            home: Cursor {
                seg: seg_id,
                bucket: Self::home_bucket(hash),
                slot: 0,
            },
            stash: (REGULAR_BUCKETS..TOTAL_BUCKETS)
                .map(|b| Cursor {
                    seg: seg_id,
                    bucket: b as u8,
                    slot: 0,
                })
                .collect(),
        }
    }

    fn split(&mut self, seg_id: u32, policy: &mut impl EvictionPolicy<V>) {
        let local_depth = self.segments[seg_id as usize].local_depth;
        if local_depth == self.global_depth {
            // double the directory
            let mut dir = Vec::with_capacity(self.dir.len() * 2);
            for &e in &self.dir {
                dir.push(e);
                dir.push(e);
            }
            self.dir = dir;
            self.global_depth += 1;
        }

        let new_id = self.segments.len() as u32;
        self.segments.push(Segment::new(local_depth + 1));
        self.segments[seg_id as usize].local_depth = local_depth + 1;

        // repoint the upper half of the directory run owned by seg_id
        let start = self.dir.iter().position(|&e| e == seg_id).unwrap();
        let run = self.dir.iter().filter(|&&e| e == seg_id).count();
        debug_assert!(run >= 2 && run.is_power_of_two());
        for i in start + run / 2..start + run {
            self.dir[i] = new_id;
        }

        // redistribute entries whose hash now maps to the new segment,
        // preserving bucket indexes and propagating bucket versions
        let mut moved: Vec<(Cursor, Cursor)> = Vec::new();
        for bucket_id in 0..TOTAL_BUCKETS {
            for slot in 0..SLOT_NUM {
                let key_hash = {
                    let bucket = &self.segments[seg_id as usize].buckets[bucket_id];
                    match &bucket.slots[slot] {
                        Some((k, _)) => k.hash_code(),
                        None => continue,
                    }
                };
                if self.seg_for_hash(key_hash) != new_id {
                    continue;
                }
                let src = Cursor {
                    seg: seg_id,
                    bucket: bucket_id as u8,
                    slot: slot as u8,
                };
                let src_version = self.version(src);
                let (key, value) = self.take_slot(src);
                let dst = self.place_in_segment(new_id, key, value, key_hash);
                let dst_bucket = dst.bucket_cursor();
                if self.version(dst_bucket) < src_version {
                    self.set_version(dst_bucket, src_version);
                }
                moved.push((src, dst));
            }
        }

        self.unload_stash(seg_id, &mut moved);
        self.rebuild_overflow(seg_id);
        self.rebuild_overflow(new_id);

        for (src, dst) in moved {
            policy.on_move(src, dst);
        }
        policy.record_split(self);
        SEGMENT_SPLIT.increment();
    }

    // removes an entry without touching overflow counters; split rebuilds
    // them wholesale afterwards
    fn take_slot(&mut self, c: Cursor) -> (PrimeKey, V) {
        let bucket = &mut self.segments[c.seg as usize].buckets[c.bucket as usize];
        bucket.fps[c.slot as usize] = 0;
        self.size -= 1;
        bucket.slots[c.slot as usize].take().expect("occupied slot")
    }

    fn place_in_segment(&mut self, seg_id: u32, key: PrimeKey, value: V, hash: u64) -> Cursor {
        let home = Self::home_bucket(hash) as usize;
        let fp = Self::fp(hash);
        let seg = &mut self.segments[seg_id as usize];
        let (bucket_id, slot) = match seg.buckets[home].first_free() {
            Some(slot) => (home, slot),
            None => (REGULAR_BUCKETS..TOTAL_BUCKETS)
                .find_map(|b| seg.buckets[b].first_free().map(|s| (b, s)))
                .expect("split target segment holds a subset of the source"),
        };
        let bucket = &mut seg.buckets[bucket_id];
        bucket.slots[slot] = Some((key, value));
        bucket.fps[slot] = fp;
        self.size += 1;
        Cursor {
            seg: seg_id,
            bucket: bucket_id as u8,
            slot: slot as u8,
        }
    }

    // after a split freed room, pull stash entries back into their homes
    fn unload_stash(&mut self, seg_id: u32, moved: &mut Vec<(Cursor, Cursor)>) {
        for bucket_id in REGULAR_BUCKETS..TOTAL_BUCKETS {
            for slot in 0..SLOT_NUM {
                let (hash, home) = {
                    let bucket = &self.segments[seg_id as usize].buckets[bucket_id];
                    match &bucket.slots[slot] {
                        Some((k, _)) => {
                            let h = k.hash_code();
                            (h, Self::home_bucket(h) as usize)
                        }
                        None => continue,
                    }
                };
                let free = self.segments[seg_id as usize].buckets[home].first_free();
                if let Some(free_slot) = free {
                    let src = Cursor {
                        seg: seg_id,
                        bucket: bucket_id as u8,
                        slot: slot as u8,
                    };
                    let src_version = self.version(src);
                    let (key, value) = self.take_slot(src);
                    let seg = &mut self.segments[seg_id as usize];
                    let bucket = &mut seg.buckets[home];
                    bucket.slots[free_slot] = Some((key, value));
                    bucket.fps[free_slot] = Self::fp(hash);
                    self.size += 1;
                    let dst = Cursor {
                        seg: seg_id,
                        bucket: home as u8,
                        slot: free_slot as u8,
                    };
                    let dst_bucket = dst.bucket_cursor();
                    if self.version(dst_bucket) < src_version {
                        self.set_version(dst_bucket, src_version);
                    }
                    moved.push((src, dst));
                    self.stash_unloaded += 1;
                }
            }
        }
    }

    fn rebuild_overflow(&mut self, seg_id: u32) {
        let seg = &mut self.segments[seg_id as usize];
        for b in 0..REGULAR_BUCKETS {
            seg.buckets[b].overflow = 0;
        }
        let mut homes: Vec<usize> = Vec::new();
        for b in REGULAR_BUCKETS..TOTAL_BUCKETS {
            for slot in &seg.buckets[b].slots {
                if let Some((k, _)) = slot {
                    homes.push(Self::home_bucket(k.hash_code()) as usize);
                }
            }
        }
        for home in homes {
            seg.buckets[home].overflow += 1;
        }
    }

    pub fn erase(&mut self, c: Cursor) -> Option<(PrimeKey, V)> {
        let entry = {
            let bucket = &mut self.segments[c.seg as usize].buckets[c.bucket as usize];
            bucket.fps[c.slot as usize] = 0;
            bucket.slots[c.slot as usize].take()
        }?;
        self.size -= 1;
        if c.is_stash() {
            let home = Self::home_bucket(entry.0.hash_code()) as usize;
            let bucket = &mut self.segments[c.seg as usize].buckets[home];
            bucket.overflow = bucket.overflow.saturating_sub(1);
        }
        HASH_REMOVE.increment();
        Some(entry)
    }

    pub fn erase_key(&mut self, key: &[u8]) -> bool {
        match self.find(key) {
            Some(c) => self.erase(c).is_some(),
            None => false,
        }
    }

    /// Shifts the slots of a stash bucket right by one, freeing slot 0.
    /// Invoked after the last slot has been evicted.
    pub fn shift_right(&mut self, c: Cursor) {
        let bucket = &mut self.segments[c.seg as usize].buckets[c.bucket as usize];
        for i in (1..SLOT_NUM).rev() {
            bucket.slots[i] = bucket.slots[i - 1].take();
            bucket.fps[i] = bucket.fps[i - 1];
        }
        bucket.slots[0] = None;
        bucket.fps[0] = 0;
    }

    /// Promotes the entry toward its home bucket's front slot, provided
    /// the policy allows it. Physical moves are reported via
    /// `policy.on_move`.
    pub fn bump_up(&mut self, c: Cursor, policy: &mut impl BumpPolicy) -> Cursor {
        let Some((key, _)) = self.entry(c) else {
            return c;
        };
        if !policy.can_bump(key) {
            return c;
        }
        let hash = key.hash_code();
        let home = Self::home_bucket(hash);

        if c.is_stash() {
            // prefer pulling the entry back into a free home slot
            let free = self.segments[c.seg as usize].buckets[home as usize].first_free();
            if let Some(slot) = free {
                let (key, value) = self.take_slot(c);
                let seg = &mut self.segments[c.seg as usize];
                let bucket = &mut seg.buckets[home as usize];
                bucket.slots[slot] = Some((key, value));
                bucket.fps[slot] = Self::fp(hash);
                seg.buckets[home as usize].overflow =
                    seg.buckets[home as usize].overflow.saturating_sub(1);
                self.size += 1;
                let dst = Cursor {
                    seg: c.seg,
                    bucket: home,
                    slot: slot as u8,
                };
                policy.on_move(c, dst);
                return dst;
            }
            return c;
        }

        if c.slot == 0 {
            return c;
        }
        // swap toward the front of the bucket
        let dst = Cursor {
            seg: c.seg,
            bucket: c.bucket,
            slot: 0,
        };
        let bucket = &mut self.segments[c.seg as usize].buckets[c.bucket as usize];
        bucket.slots.swap(0, c.slot as usize);
        bucket.fps.swap(0, c.slot as usize);
        policy.on_move(c, dst);
        policy.on_move(dst, c);
        dst
    }

    /// Visits one physical bucket per call in bucket-major order and
    /// returns the next cursor, or `None` when the table has been fully
    /// covered.
    pub fn traverse_buckets(
        &self,
        cursor: Option<TraverseCursor>,
        mut cb: impl FnMut(Cursor),
    ) -> Option<TraverseCursor> {
        let c = cursor.unwrap_or_default();
        if c.bucket as usize >= TOTAL_BUCKETS || c.seg as usize >= self.segments.len() {
            return None;
        }
        cb(Cursor {
            seg: c.seg,
            bucket: c.bucket,
            slot: 0,
        });

        let mut seg = c.seg + 1;
        let mut bucket = c.bucket;
        if seg as usize >= self.segments.len() {
            seg = 0;
            bucket += 1;
        }
        if bucket as usize >= TOTAL_BUCKETS {
            None
        } else {
            Some(TraverseCursor { bucket, seg })
        }
    }

    /// Entry-level traversal: visits each occupied slot of one physical
    /// bucket per call.
    pub fn traverse(
        &self,
        cursor: Option<TraverseCursor>,
        mut cb: impl FnMut(Cursor),
    ) -> Option<TraverseCursor> {
        self.traverse_buckets(cursor, |bucket| {
            for slot in self.occupied_slots(bucket) {
                cb(slot);
            }
        })
    }

    pub fn occupied_slots(&self, bucket: Cursor) -> Vec<Cursor> {
        let b = &self.segments[bucket.seg as usize].buckets[bucket.bucket as usize];
        (0..SLOT_NUM)
            .filter(|&slot| b.slots[slot].is_some())
            .map(|slot| Cursor {
                seg: bucket.seg,
                bucket: bucket.bucket,
                slot: slot as u8,
            })
            .collect()
    }

    pub fn bucket_is_empty(&self, bucket: Cursor) -> bool {
        self.segments[bucket.seg as usize].buckets[bucket.bucket as usize].is_empty()
    }

    /// Invokes `cb` with every bucket of version < `ver` that inserting
    /// `key` may mutate: its home bucket; the stash buckets when the home
    /// is full; every bucket of the segment when the insert would split
    /// it. The snapshotter uses this hook to flush buckets before they
    /// change.
    pub fn cvc_upon_insert(&self, ver: u64, key: &[u8], mut cb: impl FnMut(Cursor)) {
        let hash = crate::hash_key(key);
        let seg_id = self.seg_for_hash(hash);
        let seg = &self.segments[seg_id as usize];
        let home = Self::home_bucket(hash) as usize;

        let mut candidates: Vec<usize> = Vec::new();
        if seg.buckets[home].first_free().is_some() {
            candidates.push(home);
        } else {
            let stash_free = (REGULAR_BUCKETS..TOTAL_BUCKETS)
                .any(|b| seg.buckets[b].first_free().is_some());
            if stash_free {
                candidates.push(home);
                candidates.extend(REGULAR_BUCKETS..TOTAL_BUCKETS);
            } else {
                candidates.extend(0..TOTAL_BUCKETS);
            }
        }

        for bucket_id in candidates {
            let c = Cursor {
                seg: seg_id,
                bucket: bucket_id as u8,
                slot: 0,
            };
            if self.version(c) < ver {
                cb(c);
            }
        }
    }

    /// Invokes `cb` with every bucket of version < `ver` that bumping the
    /// entry at `c` may mutate.
    pub fn cvc_upon_bump(&self, ver: u64, c: Cursor, mut cb: impl FnMut(Cursor)) {
        let Some((key, _)) = self.entry(c) else {
            return;
        };
        let home = Self::home_bucket(key.hash_code());
        let mut candidates = vec![c.bucket_cursor()];
        let home_cursor = Cursor {
            seg: c.seg,
            bucket: home,
            slot: 0,
        };
        if home_cursor != candidates[0] {
            candidates.push(home_cursor);
        }
        for bucket in candidates {
            if self.version(bucket) < ver {
                cb(bucket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DashTable<u64> {
        DashTable::new()
    }

    fn fill(t: &mut DashTable<u64>, n: u64) {
        for i in 0..n {
            let key = format!("key-{i}");
            let (_, inserted) = t.insert(PrimeKey::new(key.as_bytes()), i);
            assert!(inserted, "{key} inserted twice");
        }
    }

    #[test]
    fn insert_find_erase() {
        let mut t = table();
        let (c, inserted) = t.insert(PrimeKey::new(b"alpha"), 7);
        assert!(inserted);
        assert_eq!(t.len(), 1);
        assert_eq!(t.find(b"alpha"), Some(c));
        assert_eq!(*t.value_of(c), 7);

        let (c2, inserted) = t.insert(PrimeKey::new(b"alpha"), 9);
        assert!(!inserted);
        assert_eq!(c, c2);
        assert_eq!(t.len(), 1);

        assert!(t.erase_key(b"alpha"));
        assert!(t.find(b"alpha").is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn grows_across_segments() {
        let mut t = table();
        fill(&mut t, 10_000);
        assert!(t.segment_count() > 1);
        assert_eq!(t.len(), 10_000);
        for i in 0..10_000u64 {
            let key = format!("key-{i}");
            let c = t.find(key.as_bytes()).unwrap_or_else(|| panic!("{key} lost"));
            assert_eq!(*t.value_of(c), i);
        }
    }

    #[test]
    fn traversal_covers_all_entries() {
        let mut t = table();
        fill(&mut t, 3000);

        let mut seen = std::collections::HashSet::new();
        let mut cursor = None;
        loop {
            let next = t.traverse(cursor, |c| {
                seen.insert(t.key_of(c).to_vec());
            });
            if next.is_none() {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 3000);
    }

    #[test]
    fn traversal_survives_concurrent_inserts() {
        let mut t = table();
        fill(&mut t, 1000);

        let mut seen = std::collections::HashSet::new();
        let mut cursor = None;
        let mut added = 1000u64;
        loop {
            let next = t.traverse(cursor, |c| {
                seen.insert(t.key_of(c).to_vec());
            });
            if next.is_none() {
                break;
            }
            cursor = next;
            // mutate between traversal steps, forcing splits
            for _ in 0..20 {
                let key = format!("key-{added}");
                t.insert(PrimeKey::new(key.as_bytes()), added);
                added += 1;
            }
        }
        // every entry that existed when traversal began is covered
        for i in 0..1000u64 {
            let key = format!("key-{i}");
            assert!(seen.contains(key.as_bytes()), "{key} missed");
        }
    }

    #[test]
    fn versions_propagate_on_split() {
        let mut t = table();
        // stamp every bucket that currently holds an entry
        fill(&mut t, 500);
        for i in 0..500u64 {
            let key = format!("key-{i}");
            let c = t.find(key.as_bytes()).unwrap();
            if t.version(c.bucket_cursor()) < 42 {
                t.set_version(c.bucket_cursor(), 42);
            }
        }
        fill_more(&mut t, 500, 5000);
        for i in 0..500u64 {
            let key = format!("key-{i}");
            let c = t.find(key.as_bytes()).unwrap();
            assert!(
                t.version(c.bucket_cursor()) >= 42,
                "version lost for {key} after splits"
            );
        }
    }

    fn fill_more(t: &mut DashTable<u64>, from: u64, to: u64) {
        for i in from..to {
            let key = format!("key-{i}");
            t.insert(PrimeKey::new(key.as_bytes()), i);
        }
    }

    #[test]
    fn insert_new_fails_without_growth() {
        struct NoGrow;
        impl EvictionPolicy<u64> for NoGrow {
            fn can_grow(&mut self, _tbl: &DashTable<u64>) -> bool {
                false
            }
        }
        let mut t = table();
        let mut policy = NoGrow;
        let mut failed = false;
        for i in 0..SEG_CAPACITY as u64 + 1 {
            let key = format!("key-{i}");
            if t
                .insert_new(PrimeKey::new(key.as_bytes()), i, &mut policy)
                .is_err()
            {
                failed = true;
                break;
            }
        }
        assert!(failed, "a frozen single-segment table must fill up");
    }

    #[test]
    fn eviction_policy_reclaims_a_slot() {
        struct EvictLast;
        impl EvictionPolicy<u64> for EvictLast {
            fn can_grow(&mut self, _tbl: &DashTable<u64>) -> bool {
                false
            }
            fn evict(&mut self, hot: &HotBuckets, tbl: &mut DashTable<u64>) -> usize {
                let stash = hot.stash[(hot.key_hash as usize) % hot.stash.len()];
                let last = Cursor {
                    slot: (SLOT_NUM - 1) as u8,
                    ..stash
                };
                if tbl.erase(last).is_some() {
                    tbl.shift_right(stash);
                    1
                } else {
                    0
                }
            }
        }

        let mut t = table();
        let mut policy = EvictLast;
        let mut inserted = 0u64;
        // push far past a frozen segment's capacity; eviction must make
        // room every time
        for i in 0..SEG_CAPACITY as u64 * 2 {
            let key = format!("key-{i}");
            if t
                .insert_new(PrimeKey::new(key.as_bytes()), i, &mut policy)
                .is_ok()
            {
                inserted += 1;
            }
        }
        assert_eq!(inserted, SEG_CAPACITY as u64 * 2);
        assert_eq!(t.segment_count(), 1);
        assert!(t.len() <= SEG_CAPACITY);
    }

    #[test]
    fn bump_up_moves_to_front() {
        struct Bump;
        impl BumpPolicy for Bump {
            fn can_bump(&self, key: &PrimeKey) -> bool {
                !key.is_sticky()
            }
        }
        let mut t = table();
        fill(&mut t, 200);
        let c = t.find(b"key-100").unwrap();
        let bumped = t.bump_up(c, &mut Bump);
        assert_eq!(bumped.slot, 0);
        assert_eq!(t.find(b"key-100"), Some(bumped));
    }

    #[test]
    fn sticky_keys_do_not_bump() {
        struct Bump;
        impl BumpPolicy for Bump {
            fn can_bump(&self, key: &PrimeKey) -> bool {
                !key.is_sticky()
            }
        }
        let mut t = table();
        fill(&mut t, 50);
        let c = t.find(b"key-30").unwrap();
        t.entry_mut(c).unwrap().0.set_sticky(true);
        assert_eq!(t.bump_up(c, &mut Bump), c);
    }

    #[test]
    fn cvc_upon_insert_reports_low_version_buckets() {
        let t = table();
        let mut hits = 0;
        t.cvc_upon_insert(10, b"brand-new", |c| {
            assert!(t.version(c) < 10);
            hits += 1;
        });
        assert_eq!(hits, 1);

        // after stamping, the bucket is no longer reported
        let hash = crate::hash_key(b"brand-new");
        let _ = hash;
        t.cvc_upon_insert(10, b"brand-new", |c| t.set_version(c, 10));
        let mut second = 0;
        t.cvc_upon_insert(10, b"brand-new", |_| second += 1);
        assert_eq!(second, 0);
    }
}
