// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The value half of a table record: a tagged union over the supported
//! object kinds plus a flag byte shared by the expiry, memcache-flag and
//! tiered-storage machinery. Strings that parse as integers are kept in an
//! integer encoding; values offloaded to tiered storage leave a descriptor
//! in the slot, optionally with a warm in-memory copy ("cool" values).

use crate::sortedmap::{SortedMap, PACKED_MAX_ENTRIES};
use crate::stringset::StringSet;

const HAS_EXPIRE: u8 = 1 << 0;
const HAS_MCFLAG: u8 = 1 << 1;
const STASH_PENDING: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    String,
    List,
    Set,
    Hash,
    ZSet,
    Json,
    Stream,
    Bloom,
    Hll,
}

impl ObjType {
    pub const COUNT: usize = 9;

    pub fn index(self) -> usize {
        match self {
            ObjType::String => 0,
            ObjType::List => 1,
            ObjType::Set => 2,
            ObjType::Hash => 3,
            ObjType::ZSet => 4,
            ObjType::Json => 5,
            ObjType::Stream => 6,
            ObjType::Bloom => 7,
            ObjType::Hll => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Int,
    Raw,
    Packed,
    Tree,
    Dense,
    External,
}

/// Descriptor for a value whose bytes live on tiered storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSlice {
    pub offset: u64,
    pub len: u32,
}

#[derive(Clone)]
pub enum ZSetValue {
    Packed(Vec<(Box<[u8]>, f64)>),
    Tree(SortedMap),
}

impl ZSetValue {
    pub fn len(&self) -> usize {
        match self {
            ZSetValue::Packed(v) => v.len(),
            ZSetValue::Tree(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the packed form to a tree once it outgrows the threshold.
    pub fn upgrade_if_needed(&mut self) {
        if let ZSetValue::Packed(entries) = self {
            if entries.len() > PACKED_MAX_ENTRIES {
                let map = SortedMap::from_packed(entries);
                *self = ZSetValue::Tree(map);
            }
        }
    }
}

#[derive(Clone)]
enum Repr {
    Int(i64),
    Str(Box<[u8]>),
    Set(Box<StringSet>),
    ZSet(Box<ZSetValue>),
    External {
        slice: ExternalSlice,
        // warm copy retained for cool values
        cool: Option<Box<[u8]>>,
    },
}

#[derive(Clone)]
pub struct PrimeValue {
    flags: u8,
    repr: Repr,
}

impl Default for PrimeValue {
    fn default() -> Self {
        Self {
            flags: 0,
            repr: Repr::Str(Box::from(&[][..])),
        }
    }
}

impl PrimeValue {
    pub fn from_str(value: &[u8]) -> Self {
        let mut pv = Self::default();
        pv.set_string(value);
        pv
    }

    pub fn from_int(value: i64) -> Self {
        Self {
            flags: 0,
            repr: Repr::Int(value),
        }
    }

    pub fn from_set(set: StringSet) -> Self {
        Self {
            flags: 0,
            repr: Repr::Set(Box::new(set)),
        }
    }

    pub fn from_zset(zset: ZSetValue) -> Self {
        Self {
            flags: 0,
            repr: Repr::ZSet(Box::new(zset)),
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match &self.repr {
            Repr::Int(_) | Repr::Str(_) | Repr::External { .. } => ObjType::String,
            Repr::Set(_) => ObjType::Set,
            Repr::ZSet(_) => ObjType::ZSet,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match &self.repr {
            Repr::Int(_) => Encoding::Int,
            Repr::Str(_) => Encoding::Raw,
            Repr::Set(_) => Encoding::Dense,
            Repr::ZSet(z) => match **z {
                ZSetValue::Packed(_) => Encoding::Packed,
                ZSetValue::Tree(_) => Encoding::Tree,
            },
            Repr::External { .. } => Encoding::External,
        }
    }

    /// Byte length of the value for string-typed records.
    pub fn size(&self) -> usize {
        match &self.repr {
            Repr::Int(v) => itoa_len(*v),
            Repr::Str(b) => b.len(),
            Repr::External { slice, .. } => slice.len as usize,
            Repr::Set(s) => s.len(),
            Repr::ZSet(z) => z.len(),
        }
    }

    /// Overwrites with a string value, keeping the flag byte. Integer-like
    /// payloads are stored in the integer encoding.
    pub fn set_string(&mut self, value: &[u8]) {
        self.repr = match parse_int_strict(value) {
            Some(v) => Repr::Int(v),
            None => Repr::Str(value.into()),
        };
    }

    pub fn set_int(&mut self, value: i64) {
        self.repr = Repr::Int(value);
    }

    pub fn try_get_int(&self) -> Option<i64> {
        match &self.repr {
            Repr::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string bytes, rendering integer encodings into
    /// `scratch`. Empty for non-string types and non-cool externals.
    pub fn get_slice<'a>(&'a self, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        match &self.repr {
            Repr::Int(v) => {
                scratch.clear();
                scratch.extend_from_slice(v.to_string().as_bytes());
                scratch
            }
            Repr::Str(b) => b,
            Repr::External { cool: Some(b), .. } => b,
            _ => &[],
        }
    }

    pub fn to_string_bytes(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        self.get_slice(&mut scratch).to_vec()
    }

    pub fn as_set(&self) -> Option<&StringSet> {
        match &self.repr {
            Repr::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut StringSet> {
        match &mut self.repr {
            Repr::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_zset(&self) -> Option<&ZSetValue> {
        match &self.repr {
            Repr::ZSet(z) => Some(z),
            _ => None,
        }
    }

    pub fn as_zset_mut(&mut self) -> Option<&mut ZSetValue> {
        match &mut self.repr {
            Repr::ZSet(z) => Some(z),
            _ => None,
        }
    }

    /// Heap bytes owned by the value.
    pub fn malloc_used(&self) -> usize {
        match &self.repr {
            Repr::Int(_) => 0,
            Repr::Str(b) => b.len(),
            Repr::Set(s) => s.malloc_used(),
            Repr::ZSet(z) => match &**z {
                ZSetValue::Packed(v) => v.iter().map(|(m, _)| m.len() + 8).sum(),
                ZSetValue::Tree(m) => m.malloc_used(),
            },
            Repr::External { cool, .. } => cool.as_ref().map(|b| b.len()).unwrap_or(0),
        }
    }

    pub fn has_allocated(&self) -> bool {
        self.malloc_used() > 0
    }

    pub fn has_expire(&self) -> bool {
        self.flags & HAS_EXPIRE != 0
    }

    pub fn set_expire(&mut self, v: bool) {
        if v {
            self.flags |= HAS_EXPIRE;
        } else {
            self.flags &= !HAS_EXPIRE;
        }
    }

    pub fn has_flag(&self) -> bool {
        self.flags & HAS_MCFLAG != 0
    }

    pub fn set_flag(&mut self, v: bool) {
        if v {
            self.flags |= HAS_MCFLAG;
        } else {
            self.flags &= !HAS_MCFLAG;
        }
    }

    pub fn has_stash_pending(&self) -> bool {
        self.flags & STASH_PENDING != 0
    }

    pub fn set_stash_pending(&mut self, v: bool) {
        if v {
            self.flags |= STASH_PENDING;
        } else {
            self.flags &= !STASH_PENDING;
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.repr, Repr::External { .. })
    }

    pub fn is_cool(&self) -> bool {
        matches!(&self.repr, Repr::External { cool: Some(_), .. })
    }

    pub fn external_slice(&self) -> Option<&ExternalSlice> {
        match &self.repr {
            Repr::External { slice, .. } => Some(slice),
            _ => None,
        }
    }

    pub fn cool_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::External { cool: Some(b), .. } => Some(b),
            _ => None,
        }
    }

    /// Replaces the in-memory payload with a tiered-storage descriptor.
    pub fn set_external(&mut self, slice: ExternalSlice) {
        self.set_stash_pending(false);
        self.repr = Repr::External { slice, cool: None };
    }

    /// Marks a value as external while retaining the bytes for fast reads.
    pub fn set_cool(&mut self, slice: ExternalSlice) {
        let bytes = self.to_string_bytes().into_boxed_slice();
        self.set_stash_pending(false);
        self.repr = Repr::External {
            slice,
            cool: Some(bytes),
        };
    }

    /// Converts a cool value back to a plain in-memory string.
    pub fn warm_up(&mut self) {
        if let Repr::External {
            cool: Some(bytes), ..
        } = &mut self.repr
        {
            let bytes = std::mem::take(bytes);
            self.repr = Repr::Str(bytes);
        }
    }
}

impl std::fmt::Debug for PrimeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Int(v) => write!(f, "PrimeValue::Int({v})"),
            Repr::Str(b) => write!(f, "PrimeValue::Str({:?})", String::from_utf8_lossy(b)),
            Repr::Set(s) => write!(f, "PrimeValue::Set(len={})", s.len()),
            Repr::ZSet(z) => write!(f, "PrimeValue::ZSet(len={})", z.len()),
            Repr::External { slice, cool } => write!(
                f,
                "PrimeValue::External(offset={}, len={}, cool={})",
                slice.offset,
                slice.len,
                cool.is_some()
            ),
        }
    }
}

fn itoa_len(v: i64) -> usize {
    // digits plus a possible sign
    let mut n = if v < 0 { 1 } else { 0 };
    let mut x = v.unsigned_abs().max(1);
    while x > 0 {
        n += 1;
        x /= 10;
    }
    n
}

// Strict integer parse: must round-trip byte-for-byte so that GETRANGE and
// friends observe the exact stored representation.
fn parse_int_strict(value: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(value).ok()?;
    let v: i64 = s.parse().ok()?;
    (v.to_string() == s).then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_int_encoding() {
        let mut pv = PrimeValue::default();
        pv.set_string(b"1234");
        assert_eq!(pv.encoding(), Encoding::Int);
        assert_eq!(pv.try_get_int(), Some(1234));
        assert_eq!(pv.to_string_bytes(), b"1234");
        assert_eq!(pv.size(), 4);

        pv.set_string(b"007");
        // leading zeros must not round-trip through the integer encoding
        assert_eq!(pv.encoding(), Encoding::Raw);
        assert_eq!(pv.to_string_bytes(), b"007");
    }

    #[test]
    fn negative_int_size() {
        let pv = PrimeValue::from_int(-25);
        assert_eq!(pv.size(), 3);
        assert_eq!(pv.to_string_bytes(), b"-25");
    }

    #[test]
    fn flags_survive_overwrite() {
        let mut pv = PrimeValue::from_str(b"a");
        pv.set_expire(true);
        pv.set_flag(true);
        pv.set_string(b"b");
        assert!(pv.has_expire());
        assert!(pv.has_flag());
    }

    #[test]
    fn cool_lifecycle() {
        let mut pv = PrimeValue::from_str(b"payload");
        pv.set_cool(ExternalSlice { offset: 8, len: 7 });
        assert!(pv.is_external());
        assert!(pv.is_cool());
        assert_eq!(pv.cool_bytes(), Some(&b"payload"[..]));
        assert_eq!(pv.obj_type(), ObjType::String);

        pv.warm_up();
        assert!(!pv.is_external());
        assert_eq!(pv.to_string_bytes(), b"payload");
    }

    #[test]
    fn zset_upgrade() {
        let entries: Vec<(Box<[u8]>, f64)> = (0..PACKED_MAX_ENTRIES + 1)
            .map(|i| (format!("m{i}").into_bytes().into_boxed_slice(), i as f64))
            .collect();
        let mut z = ZSetValue::Packed(entries);
        z.upgrade_if_needed();
        assert!(matches!(z, ZSetValue::Tree(_)));
        assert_eq!(z.len(), PACKED_MAX_ENTRIES + 1);
    }
}
