// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Compact key representation. Short keys are stored inline in the table
//! slot with no heap allocation; longer keys spill to the heap. Three flag
//! bits ride along with the bytes: sticky (never evicted), touched (an
//! LRU-ish access mark) and async-delete (large containers are torn down
//! off the hot path).

use crate::hash_key;

const INLINE_CAP: usize = 22;

const STICKY: u8 = 1 << 0;
const TOUCHED: u8 = 1 << 1;
const ASYNC_DELETE: u8 = 1 << 2;

#[derive(Clone)]
enum KeyData {
    Inline { len: u8, buf: [u8; INLINE_CAP] },
    Heap(Box<[u8]>),
}

#[derive(Clone)]
pub struct PrimeKey {
    flags: u8,
    data: KeyData,
}

impl PrimeKey {
    pub fn new(key: &[u8]) -> Self {
        let data = if key.len() <= INLINE_CAP {
            let mut buf = [0u8; INLINE_CAP];
            buf[..key.len()].copy_from_slice(key);
            KeyData::Inline {
                len: key.len() as u8,
                buf,
            }
        } else {
            KeyData::Heap(key.into())
        };
        Self { flags: 0, data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            KeyData::Inline { len, buf } => &buf[..*len as usize],
            KeyData::Heap(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.data, KeyData::Inline { .. })
    }

    /// Heap bytes attributable to this key. Inline keys cost nothing
    /// beyond their table slot.
    pub fn malloc_used(&self) -> usize {
        match &self.data {
            KeyData::Inline { .. } => 0,
            KeyData::Heap(b) => b.len(),
        }
    }

    pub fn hash_code(&self) -> u64 {
        hash_key(self.as_bytes())
    }

    pub fn is_sticky(&self) -> bool {
        self.flags & STICKY != 0
    }

    pub fn set_sticky(&mut self, v: bool) {
        if v {
            self.flags |= STICKY;
        } else {
            self.flags &= !STICKY;
        }
    }

    pub fn is_touched(&self) -> bool {
        self.flags & TOUCHED != 0
    }

    pub fn set_touched(&mut self, v: bool) {
        if v {
            self.flags |= TOUCHED;
        } else {
            self.flags &= !TOUCHED;
        }
    }

    pub fn is_async_delete(&self) -> bool {
        self.flags & ASYNC_DELETE != 0
    }

    pub fn set_async_delete(&mut self, v: bool) {
        if v {
            self.flags |= ASYNC_DELETE;
        } else {
            self.flags &= !ASYNC_DELETE;
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl PartialEq for PrimeKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for PrimeKey {}

impl std::fmt::Debug for PrimeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrimeKey({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_boundary() {
        let short = PrimeKey::new(b"k");
        assert!(short.is_inline());
        assert_eq!(short.malloc_used(), 0);

        let edge = PrimeKey::new(&[b'x'; INLINE_CAP]);
        assert!(edge.is_inline());

        let long = PrimeKey::new(&[b'x'; INLINE_CAP + 1]);
        assert!(!long.is_inline());
        assert_eq!(long.malloc_used(), INLINE_CAP + 1);
        assert_eq!(long.as_bytes().len(), INLINE_CAP + 1);
    }

    #[test]
    fn flags_do_not_disturb_bytes() {
        let mut key = PrimeKey::new(b"hello");
        key.set_sticky(true);
        key.set_touched(true);
        assert!(key.is_sticky());
        assert!(key.is_touched());
        assert_eq!(key.as_bytes(), b"hello");
        key.set_touched(false);
        assert!(key.is_sticky());
        assert!(!key.is_touched());
    }

    #[test]
    fn equality_ignores_flags() {
        let mut a = PrimeKey::new(b"same");
        let b = PrimeKey::new(b"same");
        a.set_sticky(true);
        assert_eq!(a, b);
        assert_eq!(a.hash_code(), b.hash_code());
    }
}
