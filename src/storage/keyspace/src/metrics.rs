// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

// All metrics for the keyspace crate

use metriken::*;

// hash table related
#[metric(name = "hash_insert", description = "number of inserts into the hash table")]
pub static HASH_INSERT: Counter = Counter::new();

#[metric(name = "hash_insert_ex", description = "number of hash table inserts which failed, likely due to capacity")]
pub static HASH_INSERT_EX: Counter = Counter::new();

#[metric(name = "hash_remove", description = "number of hash table entries which have been removed")]
pub static HASH_REMOVE: Counter = Counter::new();

#[metric(name = "hash_lookup", description = "total number of lookups against the hash table")]
pub static HASH_LOOKUP: Counter = Counter::new();

#[metric(name = "hash_tag_collision", description = "number of partial hash collisions")]
pub static HASH_TAG_COLLISION: Counter = Counter::new();

#[metric(name = "segment_split", description = "number of hash table segment splits")]
pub static SEGMENT_SPLIT: Counter = Counter::new();

// item related
#[metric(name = "item_expire", description = "number of items removed due to expiration")]
pub static ITEM_EXPIRE: Counter = Counter::new();

#[metric(name = "item_evict", description = "number of items removed due to eviction")]
pub static ITEM_EVICT: Counter = Counter::new();

#[metric(name = "item_delete", description = "number of items removed from the hash table")]
pub static ITEM_DELETE: Counter = Counter::new();

#[metric(name = "item_current", description = "current number of live items")]
pub static ITEM_CURRENT: Gauge = Gauge::new();

// snapshot related
#[metric(name = "snapshot_loop_serialized", description = "entries serialized by the snapshot walker loop")]
pub static SNAPSHOT_LOOP_SERIALIZED: Counter = Counter::new();

#[metric(name = "snapshot_side_saved", description = "entries serialized on the mutation path before their bucket changed")]
pub static SNAPSHOT_SIDE_SAVED: Counter = Counter::new();

#[metric(name = "snapshot_blob_push", description = "number of serialized blobs pushed to the consumer")]
pub static SNAPSHOT_BLOB_PUSH: Counter = Counter::new();

// journal related
#[metric(name = "journal_append", description = "number of entries appended to the journal")]
pub static JOURNAL_APPEND: Counter = Counter::new();
