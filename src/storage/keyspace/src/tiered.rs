// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Interface to the cold-value store. The keyspace interacts with tiered
//! storage through a narrow surface: non-blocking stash attempts, reads
//! resolved through futures, synchronous deletes and stash cancellation.
//! The store owns its own buffers and byte layout.

use crate::value::{ExternalSlice, PrimeValue};
use crate::DbIndex;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// A future resolved by the tiered store once bytes are available. `get`
/// blocks; the snapshotter only awaits futures at its designated flush
/// points.
pub struct TieredFuture<T> {
    shared: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for TieredFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for TieredFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TieredFuture<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub fn resolved(value: T) -> Self {
        let fut = Self::new();
        fut.resolve(value);
        fut
    }

    pub fn resolve(&self, value: T) {
        let (slot, cond) = &*self.shared;
        *slot.lock().unwrap() = Some(value);
        cond.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        self.shared.0.lock().unwrap().is_some()
    }

    pub fn get(self) -> T {
        let (slot, cond) = &*self.shared;
        let mut guard = slot.lock().unwrap();
        loop {
            if let Some(v) = guard.take() {
                return v;
            }
            guard = cond.wait(guard).unwrap();
        }
    }
}

pub type TieredReadResult = Result<Vec<u8>, String>;

pub trait TieredStorage {
    /// Attempts to offload a value. The store may decline (for example
    /// under I/O pressure); on acceptance the value carries the
    /// stash-pending mark until the write-back completes.
    fn try_stash(&mut self, db_index: DbIndex, key: &[u8], value: &mut PrimeValue);

    /// Schedules a read of an external value.
    fn read(&mut self, db_index: DbIndex, key: &[u8], value: &PrimeValue)
        -> TieredFuture<TieredReadResult>;

    /// Drops the external bytes backing a value.
    fn delete(&mut self, db_index: DbIndex, value: &mut PrimeValue);

    /// Cancels a queued write-back, restoring the plain in-memory state.
    fn cancel_stash(&mut self, db_index: DbIndex, key: &[u8], value: &mut PrimeValue);

    /// Frees up to `goal` bytes of reclaimable (cool) memory. Returns the
    /// bytes actually freed.
    fn reclaim_memory(&mut self, _goal: usize) -> usize {
        0
    }

    /// Memory held by warm copies of cool values, reclaimable at will.
    fn cool_memory_usage(&self) -> i64 {
        0
    }
}

/// Heap-backed store used by tests: offloads every stash immediately and
/// serves reads from a map.
#[derive(Default)]
pub struct InMemoryTiered {
    next_offset: u64,
    blobs: HashMap<u64, Vec<u8>>,
}

impl InMemoryTiered {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_blobs(&self) -> usize {
        self.blobs.len()
    }

    /// Offloads without retaining a warm copy.
    pub fn force_offload(&mut self, value: &mut PrimeValue) {
        let bytes = value.to_string_bytes();
        let slice = ExternalSlice {
            offset: self.next_offset,
            len: bytes.len() as u32,
        };
        self.next_offset += 1;
        self.blobs.insert(slice.offset, bytes);
        value.set_external(slice);
    }

    /// Offloads while keeping the warm copy, producing a cool value.
    pub fn offload_cool(&mut self, value: &mut PrimeValue) {
        let bytes = value.to_string_bytes();
        let slice = ExternalSlice {
            offset: self.next_offset,
            len: bytes.len() as u32,
        };
        self.next_offset += 1;
        self.blobs.insert(slice.offset, bytes);
        value.set_cool(slice);
    }
}

impl TieredStorage for InMemoryTiered {
    fn try_stash(&mut self, _db_index: DbIndex, _key: &[u8], value: &mut PrimeValue) {
        // writes complete instantly here, so the pending mark never
        // becomes observable
        value.set_stash_pending(false);
    }

    fn read(
        &mut self,
        _db_index: DbIndex,
        _key: &[u8],
        value: &PrimeValue,
    ) -> TieredFuture<TieredReadResult> {
        let result = match value.external_slice() {
            Some(slice) => match self.blobs.get(&slice.offset) {
                Some(bytes) => Ok(bytes.clone()),
                None => Err("missing external blob".to_string()),
            },
            None => Ok(value.to_string_bytes()),
        };
        TieredFuture::resolved(result)
    }

    fn delete(&mut self, _db_index: DbIndex, value: &mut PrimeValue) {
        if let Some(slice) = value.external_slice() {
            self.blobs.remove(&slice.offset);
        }
    }

    fn cancel_stash(&mut self, _db_index: DbIndex, _key: &[u8], value: &mut PrimeValue) {
        value.set_stash_pending(false);
    }

    fn cool_memory_usage(&self) -> i64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_resolves_across_threads() {
        let fut: TieredFuture<TieredReadResult> = TieredFuture::new();
        let resolver = fut.clone();
        let handle = std::thread::spawn(move || {
            resolver.resolve(Ok(b"bytes".to_vec()));
        });
        assert_eq!(fut.get().unwrap(), b"bytes");
        handle.join().unwrap();
    }

    #[test]
    fn offload_and_read_back() {
        let mut store = InMemoryTiered::new();
        let mut pv = PrimeValue::from_str(b"cold value");
        store.force_offload(&mut pv);
        assert!(pv.is_external());
        assert!(!pv.is_cool());

        let got = store.read(0, b"k", &pv).get().unwrap();
        assert_eq!(got, b"cold value");

        store.delete(0, &mut pv);
        assert!(store.read(0, b"k", &pv).get().is_err());
    }

    #[test]
    fn cool_offload_keeps_warm_copy() {
        let mut store = InMemoryTiered::new();
        let mut pv = PrimeValue::from_str(b"warmish");
        store.offload_cool(&mut pv);
        assert!(pv.is_cool());
        assert_eq!(pv.cool_bytes(), Some(&b"warmish"[..]));
    }
}
