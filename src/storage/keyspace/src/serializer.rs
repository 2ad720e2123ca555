// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Framing for the snapshot stream and journal entries. The byte layout
//! is opaque to consumers; what matters is the record taxonomy and the
//! ordering the snapshotter provides: a key's value record precedes any
//! journal record for that key, and a full-sync-cut marks the boundary
//! between the bulk snapshot and the live tail.

use crate::value::{PrimeValue, ZSetValue};
use crate::{DbIndex, Lsn};
use bytes::{BufMut, Bytes, BytesMut};

pub const REC_ENTRY: u8 = 0x01;
pub const REC_JOURNAL: u8 = 0x02;
pub const REC_FULL_SYNC_CUT: u8 = 0x03;
pub const REC_JOURNAL_OFFSET: u8 = 0x04;

const VAL_STRING: u8 = 0x10;
const VAL_SET: u8 = 0x11;
const VAL_ZSET: u8 = 0x12;

/// Encodes one journal command as an opaque frame: an argument count
/// followed by length-prefixed arguments.
pub fn encode_command(args: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(args.len() as u32);
    for arg in args {
        buf.put_u32_le(arg.len() as u32);
        buf.put_slice(arg);
    }
    buf.freeze()
}

/// Decodes a frame produced by [`encode_command`]. Returns `None` on a
/// malformed frame.
pub fn decode_command(mut data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let count = read_u32(&mut data)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(&mut data)? as usize;
        if data.len() < len {
            return None;
        }
        out.push(data[..len].to_vec());
        data = &data[len..];
    }
    Some(out)
}

fn read_u32(data: &mut &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    let v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    *data = &data[4..];
    Some(v)
}

/// Accumulates snapshot records into a buffer that is cut into blobs by
/// the snapshotter's flush logic.
#[derive(Default)]
pub struct SnapshotSerializer {
    buf: BytesMut,
    peak_bytes: usize,
}

impl SnapshotSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serialized_len(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Appends one key record. Returns the value type tag written.
    pub fn save_entry(
        &mut self,
        key: &[u8],
        value: &PrimeValue,
        expire_ms: u64,
        mc_flags: u32,
        db_index: DbIndex,
    ) -> u8 {
        self.buf.put_u8(REC_ENTRY);
        self.buf.put_u16_le(db_index);
        self.buf.put_u64_le(expire_ms);
        self.buf.put_u32_le(mc_flags);
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        let tag = self.save_value(value);
        self.peak_bytes = self.peak_bytes.max(self.buf.len());
        tag
    }

    /// Appends a raw string record, used for values read back from
    /// tiered storage.
    pub fn save_string_entry(
        &mut self,
        key: &[u8],
        value: &[u8],
        expire_ms: u64,
        mc_flags: u32,
        db_index: DbIndex,
    ) -> u8 {
        self.buf.put_u8(REC_ENTRY);
        self.buf.put_u16_le(db_index);
        self.buf.put_u64_le(expire_ms);
        self.buf.put_u32_le(mc_flags);
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_u8(VAL_STRING);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self.peak_bytes = self.peak_bytes.max(self.buf.len());
        VAL_STRING
    }

    fn save_value(&mut self, value: &PrimeValue) -> u8 {
        if let Some(set) = value.as_set() {
            self.buf.put_u8(VAL_SET);
            self.buf.put_u32_le(set.len() as u32);
            for member in set.iter() {
                self.buf.put_u32_le(member.len() as u32);
                self.buf.put_slice(member);
                let ttl = set.ttl(member).unwrap_or(crate::stringset::NO_TTL);
                self.buf.put_u32_le(ttl);
            }
            return VAL_SET;
        }
        if let Some(zset) = value.as_zset() {
            self.buf.put_u8(VAL_ZSET);
            match zset {
                ZSetValue::Packed(entries) => {
                    self.buf.put_u32_le(entries.len() as u32);
                    for (member, score) in entries {
                        self.buf.put_u32_le(member.len() as u32);
                        self.buf.put_slice(member);
                        self.buf.put_f64_le(*score);
                    }
                }
                ZSetValue::Tree(map) => {
                    self.buf.put_u32_le(map.len() as u32);
                    for (member, score) in map.to_packed() {
                        self.buf.put_u32_le(member.len() as u32);
                        self.buf.put_slice(&member);
                        self.buf.put_f64_le(score);
                    }
                }
            }
            return VAL_ZSET;
        }

        let bytes = value.to_string_bytes();
        self.buf.put_u8(VAL_STRING);
        self.buf.put_u32_le(bytes.len() as u32);
        self.buf.put_slice(&bytes);
        VAL_STRING
    }

    pub fn write_journal_entry(&mut self, data: &[u8]) {
        self.buf.put_u8(REC_JOURNAL);
        self.buf.put_u32_le(data.len() as u32);
        self.buf.put_slice(data);
        self.peak_bytes = self.peak_bytes.max(self.buf.len());
    }

    /// Marks the boundary between the bulk snapshot and the live journal
    /// tail.
    pub fn send_full_sync_cut(&mut self) {
        self.buf.put_u8(REC_FULL_SYNC_CUT);
    }

    pub fn send_journal_offset(&mut self, lsn: Lsn) {
        self.buf.put_u8(REC_JOURNAL_OFFSET);
        self.buf.put_u64_le(lsn);
    }

    /// Cuts the accumulated bytes into a blob, leaving the buffer empty.
    pub fn flush_to_blob(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// A decoded snapshot record, for consumers and tests.
#[derive(Debug, PartialEq)]
pub enum SnapshotRecord {
    Entry {
        db_index: DbIndex,
        key: Vec<u8>,
        value: Vec<u8>,
        expire_ms: u64,
        mc_flags: u32,
    },
    SetEntry {
        db_index: DbIndex,
        key: Vec<u8>,
        members: Vec<(Vec<u8>, u32)>,
        expire_ms: u64,
    },
    ZSetEntry {
        db_index: DbIndex,
        key: Vec<u8>,
        members: Vec<(Vec<u8>, f64)>,
        expire_ms: u64,
    },
    Journal(Vec<u8>),
    FullSyncCut,
    JournalOffset(Lsn),
}

/// Decodes a stream of blobs back into records.
pub fn decode_stream(mut data: &[u8]) -> Option<Vec<SnapshotRecord>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let tag = data[0];
        data = &data[1..];
        match tag {
            REC_ENTRY => {
                if data.len() < 2 + 8 + 4 {
                    return None;
                }
                let db_index = u16::from_le_bytes([data[0], data[1]]);
                data = &data[2..];
                let expire_ms = u64::from_le_bytes(data[..8].try_into().ok()?);
                data = &data[8..];
                let mc_flags = read_u32(&mut data)?;
                let klen = read_u32(&mut data)? as usize;
                if data.len() < klen {
                    return None;
                }
                let key = data[..klen].to_vec();
                data = &data[klen..];
                if data.is_empty() {
                    return None;
                }
                let vtag = data[0];
                data = &data[1..];
                let count = read_u32(&mut data)? as usize;
                match vtag {
                    VAL_STRING => {
                        if data.len() < count {
                            return None;
                        }
                        let value = data[..count].to_vec();
                        data = &data[count..];
                        out.push(SnapshotRecord::Entry {
                            db_index,
                            key,
                            value,
                            expire_ms,
                            mc_flags,
                        });
                    }
                    VAL_SET => {
                        let mut members = Vec::with_capacity(count);
                        for _ in 0..count {
                            let len = read_u32(&mut data)? as usize;
                            if data.len() < len {
                                return None;
                            }
                            let member = data[..len].to_vec();
                            data = &data[len..];
                            let ttl = read_u32(&mut data)?;
                            members.push((member, ttl));
                        }
                        out.push(SnapshotRecord::SetEntry {
                            db_index,
                            key,
                            members,
                            expire_ms,
                        });
                    }
                    VAL_ZSET => {
                        let mut members = Vec::with_capacity(count);
                        for _ in 0..count {
                            let len = read_u32(&mut data)? as usize;
                            if data.len() < len {
                                return None;
                            }
                            let member = data[..len].to_vec();
                            data = &data[len..];
                            if data.len() < 8 {
                                return None;
                            }
                            let score = f64::from_le_bytes(data[..8].try_into().ok()?);
                            data = &data[8..];
                            members.push((member, score));
                        }
                        out.push(SnapshotRecord::ZSetEntry {
                            db_index,
                            key,
                            members,
                            expire_ms,
                        });
                    }
                    _ => return None,
                }
            }
            REC_JOURNAL => {
                let len = read_u32(&mut data)? as usize;
                if data.len() < len {
                    return None;
                }
                out.push(SnapshotRecord::Journal(data[..len].to_vec()));
                data = &data[len..];
            }
            REC_FULL_SYNC_CUT => out.push(SnapshotRecord::FullSyncCut),
            REC_JOURNAL_OFFSET => {
                if data.len() < 8 {
                    return None;
                }
                let lsn = u64::from_le_bytes(data[..8].try_into().ok()?);
                data = &data[8..];
                out.push(SnapshotRecord::JournalOffset(lsn));
            }
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let frame = encode_command(&[b"SET", b"key", b"value"]);
        let decoded = decode_command(&frame).unwrap();
        assert_eq!(decoded, vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
    }

    #[test]
    fn entry_and_markers_decode() {
        let mut ser = SnapshotSerializer::new();
        let pv = PrimeValue::from_str(b"world");
        ser.save_entry(b"hello", &pv, 1234, 7, 0);
        ser.write_journal_entry(&encode_command(&[b"DEL", b"hello"]));
        ser.send_full_sync_cut();
        ser.send_journal_offset(99);

        let blob = ser.flush_to_blob();
        assert_eq!(ser.serialized_len(), 0);

        let records = decode_stream(&blob).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0],
            SnapshotRecord::Entry {
                db_index: 0,
                key: b"hello".to_vec(),
                value: b"world".to_vec(),
                expire_ms: 1234,
                mc_flags: 7,
            }
        );
        assert!(matches!(records[1], SnapshotRecord::Journal(_)));
        assert_eq!(records[2], SnapshotRecord::FullSyncCut);
        assert_eq!(records[3], SnapshotRecord::JournalOffset(99));
    }

    #[test]
    fn integer_encoded_values_serialize_as_text() {
        let mut ser = SnapshotSerializer::new();
        let pv = PrimeValue::from_int(42);
        ser.save_entry(b"n", &pv, 0, 0, 3);
        let records = decode_stream(&ser.flush_to_blob()).unwrap();
        match &records[0] {
            SnapshotRecord::Entry { value, db_index, .. } => {
                assert_eq!(value, b"42");
                assert_eq!(*db_index, 3);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
}
