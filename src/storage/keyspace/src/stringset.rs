// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A dense set of immutable byte strings with optional per-element expiry.
//! Elements with a TTL carry their absolute expiry second in four trailing
//! bytes of the element buffer so that the value and its deadline share a
//! single allocation. Expired elements are reclaimed lazily on probe and
//! scan.

use crate::hash_key;
use crate::page_usage::PageUsage;

/// Passing this as `ttl_sec` means "no expiry".
pub const NO_TTL: u32 = u32::MAX;

const MAX_BATCH_LEN: usize = 32;
const MIN_BUCKETS: usize = 8;

enum Slot {
    Empty,
    Tombstone,
    Full(Entry),
}

struct Entry {
    // value bytes, then 4 LE bytes of absolute expiry second when has_ttl
    buf: Box<[u8]>,
    has_ttl: bool,
}

impl Entry {
    fn new(value: &[u8], expire_at_sec: Option<u32>) -> Self {
        match expire_at_sec {
            Some(at) => {
                let mut buf = Vec::with_capacity(value.len() + 4);
                buf.extend_from_slice(value);
                buf.extend_from_slice(&at.to_le_bytes());
                Self {
                    buf: buf.into_boxed_slice(),
                    has_ttl: true,
                }
            }
            None => Self {
                buf: value.into(),
                has_ttl: false,
            },
        }
    }

    fn value(&self) -> &[u8] {
        if self.has_ttl {
            &self.buf[..self.buf.len() - 4]
        } else {
            &self.buf
        }
    }

    fn expire_at(&self) -> Option<u32> {
        if self.has_ttl {
            let tail = &self.buf[self.buf.len() - 4..];
            Some(u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]))
        } else {
            None
        }
    }

    fn set_expire_at(&mut self, at: u32) {
        if self.has_ttl {
            let n = self.buf.len();
            self.buf[n - 4..].copy_from_slice(&at.to_le_bytes());
        } else {
            *self = Entry::new(&self.buf.clone(), Some(at));
        }
    }
}

pub struct StringSet {
    slots: Vec<Slot>,
    size: usize,
    now_sec: u32,
}

impl Default for StringSet {
    fn default() -> Self {
        Self::new()
    }
}

impl StringSet {
    pub fn new() -> Self {
        Self {
            slots: (0..MIN_BUCKETS).map(|_| Slot::Empty).collect(),
            size: 0,
            now_sec: 0,
        }
    }

    /// Sets the clock used for expiry decisions, as seconds since the
    /// epoch. The owner advances it before operating on the set.
    pub fn set_time(&mut self, now_sec: u32) {
        self.now_sec = now_sec;
    }

    pub fn time_now(&self) -> u32 {
        self.now_sec
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    pub fn malloc_used(&self) -> usize {
        let elems: usize = self
            .slots
            .iter()
            .map(|s| match s {
                Slot::Full(e) => e.buf.len(),
                _ => 0,
            })
            .sum();
        elems + self.slots.len() * std::mem::size_of::<Slot>()
    }

    fn expired(&self, entry: &Entry) -> bool {
        matches!(entry.expire_at(), Some(at) if at <= self.now_sec)
    }

    fn probe(&self, value: &[u8], hash: u64) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Full(entry) => {
                    if !self.expired(entry) && entry.value() == value {
                        return Some(idx);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    fn insert_slot(&mut self, hash: u64) -> usize {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.slots[idx] {
                Slot::Empty | Slot::Tombstone => return idx,
                Slot::Full(entry) if self.expired(entry) => return idx,
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    fn grow_if_needed(&mut self, additional: usize) {
        if (self.size + additional) * 4 < self.slots.len() * 3 {
            return;
        }
        let new_len = (self.slots.len() * 2).max(MIN_BUCKETS);
        self.rehash(new_len);
    }

    fn rehash(&mut self, new_len: usize) {
        let old = std::mem::replace(
            &mut self.slots,
            (0..new_len).map(|_| Slot::Empty).collect(),
        );
        self.size = 0;
        for slot in old {
            if let Slot::Full(entry) = slot {
                if self.expired(&entry) {
                    continue;
                }
                let hash = hash_key(entry.value());
                let idx = self.insert_slot(hash);
                self.slots[idx] = Slot::Full(entry);
                self.size += 1;
            }
        }
    }

    pub fn reserve(&mut self, n: usize) {
        let mut len = self.slots.len();
        while n * 4 >= len * 3 {
            len *= 2;
        }
        if len != self.slots.len() {
            self.rehash(len);
        }
    }

    /// Inserts `value` if absent. Returns true when the element was added.
    pub fn add(&mut self, value: &[u8], ttl_sec: u32) -> bool {
        let hash = hash_key(value);
        if self.probe(value, hash).is_some() {
            return false;
        }
        self.add_unique(value, ttl_sec, hash);
        true
    }

    fn add_unique(&mut self, value: &[u8], ttl_sec: u32, hash: u64) {
        self.grow_if_needed(1);
        let expire_at = (ttl_sec != NO_TTL).then(|| self.now_sec.saturating_add(ttl_sec));
        let idx = self.insert_slot(hash);
        if matches!(self.slots[idx], Slot::Full(_)) {
            // replacing an expired entry in place
            self.size -= 1;
        }
        self.slots[idx] = Slot::Full(Entry::new(value, expire_at));
        self.size += 1;
    }

    /// Batched insert. `update_ttl` refreshes the expiry of elements that
    /// already exist, unless `keepttl` asks to leave them alone.
    pub fn add_many(&mut self, values: &[&[u8]], ttl_sec: u32, update_ttl: bool, keepttl: bool) -> usize {
        if self.bucket_count() < values.len() {
            self.reserve(values.len());
        }
        let mut added = 0;
        for chunk in values.chunks(MAX_BATCH_LEN) {
            added += self.add_batch(chunk, ttl_sec, update_ttl, keepttl);
        }
        added
    }

    fn add_batch(&mut self, values: &[&[u8]], ttl_sec: u32, update_ttl: bool, keepttl: bool) -> usize {
        let has_ttl = ttl_sec != NO_TTL;
        let mut added = 0;
        for &value in values {
            let hash = hash_key(value);
            match self.probe(value, hash) {
                None => {
                    self.add_unique(value, ttl_sec, hash);
                    added += 1;
                }
                Some(idx) => {
                    if update_ttl && has_ttl && !keepttl {
                        let at = self.now_sec.saturating_add(ttl_sec);
                        if let Slot::Full(entry) = &mut self.slots[idx] {
                            entry.set_expire_at(at);
                        }
                    }
                }
            }
        }
        added
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.probe(value, hash_key(value)).is_some()
    }

    /// Remaining TTL of an element in seconds, `None` when the element is
    /// missing, `Some(NO_TTL)` when it never expires.
    pub fn ttl(&self, value: &[u8]) -> Option<u32> {
        let idx = self.probe(value, hash_key(value))?;
        match &self.slots[idx] {
            Slot::Full(entry) => match entry.expire_at() {
                Some(at) => Some(at.saturating_sub(self.now_sec)),
                None => Some(NO_TTL),
            },
            _ => None,
        }
    }

    pub fn remove(&mut self, value: &[u8]) -> bool {
        match self.probe(value, hash_key(value)) {
            Some(idx) => {
                self.slots[idx] = Slot::Tombstone;
                self.size -= 1;
                true
            }
            None => false,
        }
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        for idx in 0..self.slots.len() {
            if let Slot::Full(entry) = &self.slots[idx] {
                if self.expired(entry) {
                    continue;
                }
                let out = entry.value().to_vec();
                self.slots[idx] = Slot::Tombstone;
                self.size -= 1;
                return Some(out);
            }
        }
        None
    }

    /// Cursor scan over live elements. Returns the next cursor, zero when
    /// the scan wrapped. Expired elements encountered on the way are
    /// dropped.
    pub fn scan(&mut self, cursor: u32, mut func: impl FnMut(&[u8])) -> u32 {
        let len = self.slots.len() as u32;
        let mut idx = cursor;
        // one bucket-sized step per call keeps the caller responsive
        let step = 16.min(len);
        for _ in 0..step {
            if idx >= len {
                return 0;
            }
            let drop_expired = match &self.slots[idx as usize] {
                Slot::Full(entry) => {
                    if self.expired(entry) {
                        true
                    } else {
                        func(entry.value());
                        false
                    }
                }
                _ => false,
            };
            if drop_expired {
                self.slots[idx as usize] = Slot::Tombstone;
                self.size -= 1;
            }
            idx += 1;
        }
        if idx >= len {
            0
        } else {
            idx
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.slots.iter().filter_map(move |s| match s {
            Slot::Full(entry) if !self.expired(entry) => Some(entry.value()),
            _ => None,
        })
    }

    /// Re-allocates elements whose backing page is under-utilized.
    /// Returns the number of elements moved.
    pub fn defrag_if_needed(&mut self, page_usage: &dyn PageUsage) -> usize {
        let mut moved = 0;
        for slot in &mut self.slots {
            if let Slot::Full(entry) = slot {
                if page_usage.is_page_for_object_under_utilized(&entry.buf) {
                    let fresh: Box<[u8]> = entry.buf.to_vec().into_boxed_slice();
                    entry.buf = fresh;
                    moved += 1;
                }
            }
        }
        moved
    }

    pub fn clear(&mut self) {
        self.slots = (0..MIN_BUCKETS).map(|_| Slot::Empty).collect();
        self.size = 0;
    }
}

impl Clone for StringSet {
    fn clone(&self) -> Self {
        let mut out = StringSet::new();
        out.now_sec = self.now_sec;
        out.reserve(self.size);
        for slot in &self.slots {
            if let Slot::Full(entry) = slot {
                if self.expired(entry) {
                    continue;
                }
                let ttl = match entry.expire_at() {
                    Some(at) => at.saturating_sub(self.now_sec),
                    None => NO_TTL,
                };
                out.add(entry.value(), ttl);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_usage::AlwaysUnderUtilized;

    #[test]
    fn add_and_contains() {
        let mut set = StringSet::new();
        assert!(set.add(b"alpha", NO_TTL));
        assert!(!set.add(b"alpha", NO_TTL));
        assert!(set.contains(b"alpha"));
        assert!(!set.contains(b"beta"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn ttl_expires_elements() {
        let mut set = StringSet::new();
        set.set_time(100);
        assert!(set.add(b"gone", 5));
        assert!(set.add(b"kept", NO_TTL));
        assert!(set.contains(b"gone"));

        set.set_time(106);
        assert!(!set.contains(b"gone"));
        assert!(set.contains(b"kept"));
        // the slot is reusable
        assert!(set.add(b"gone", NO_TTL));
    }

    #[test]
    fn add_many_refreshes_ttl() {
        let mut set = StringSet::new();
        set.set_time(10);
        set.add(b"x", 5);
        let added = set.add_many(&[b"x", b"y"], 100, true, false);
        assert_eq!(added, 1);
        assert_eq!(set.ttl(b"x"), Some(100));

        // keepttl leaves the old deadline alone
        set.add_many(&[b"x"], 7, true, true);
        assert_eq!(set.ttl(b"x"), Some(100));
    }

    #[test]
    fn legacy_mode_skips_refresh() {
        let mut set = StringSet::new();
        set.set_time(10);
        set.add(b"x", 5);
        set.add_many(&[b"x"], 100, false, false);
        assert_eq!(set.ttl(b"x"), Some(5));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut set = StringSet::new();
        for i in 0..1000u32 {
            assert!(set.add(format!("member-{i}").as_bytes(), NO_TTL));
        }
        assert_eq!(set.len(), 1000);
        for i in 0..1000u32 {
            assert!(set.contains(format!("member-{i}").as_bytes()));
        }
    }

    #[test]
    fn scan_visits_all_live() {
        let mut set = StringSet::new();
        for i in 0..100u32 {
            set.add(format!("m{i}").as_bytes(), NO_TTL);
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = set.scan(cursor, |v| {
                seen.insert(v.to_vec());
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn defrag_reallocates() {
        let mut set = StringSet::new();
        set.add(b"one", NO_TTL);
        set.add(b"two", 30);
        assert_eq!(set.defrag_if_needed(&AlwaysUnderUtilized), 2);
        assert!(set.contains(b"one"));
        assert_eq!(set.ttl(b"two"), Some(30));
    }
}
