// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Point-in-time snapshot of a slice, produced while the shard keeps
//! accepting writes. The walker serializes buckets whose version is below
//! the snapshot version S and stamps them with S; a mutation that reaches
//! a bucket still below S triggers a side-save through the change bus
//! before the mutation applies. The result is a stream in which every key
//! alive at S appears exactly once with its value as of S, followed by
//! journal entries taken at or after S.
//!
//! The walker runs as a resumable task: the shard loop calls
//! [`SliceSnapshot::run_chunk`] between commands, which bounds how long
//! the shard is unavailable, and the serializer output is cut into blobs
//! pushed to the consumer in sequence order.

use crate::dash::{Cursor, TraverseCursor};
use crate::journal::JournalItem;
use crate::metrics::*;
use crate::serializer::SnapshotSerializer;
use crate::slice::{Change, ChangeCtx, ChangeReq, DbSlice};
use crate::table::DbTable;
use crate::tiered::{TieredFuture, TieredReadResult};
use crate::value::ExternalSlice;
use crate::{DbIndex, Lsn};
use bytes::Bytes;
use common::{OpResult, OpStatus};
use crossbeam_channel::Sender;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

// Chunk size for pushing serialized data. Larger blobs cost more CPU per
// push and make the shard less responsive.
const MIN_BLOB_SIZE: usize = 8 * common::KB;

const MAX_DELAYED_ENTRIES: usize = 32;

const MAX_THROTTLE_SLEEP: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub struct SnapshotBlob {
    pub id: u64,
    pub data: Bytes,
}

#[derive(Debug, Default, Clone)]
pub struct SnapshotStats {
    pub loop_serialized: u64,
    pub side_saved: u64,
    pub savecb_calls: u64,
    pub skipped: u64,
    pub journal_changes: u64,
    pub moved_saved: u64,
    pub keys_total: u64,
}

enum DelayedSource {
    Future(TieredFuture<TieredReadResult>),
    Descriptor(ExternalSlice),
}

struct DelayedEntry {
    db_index: DbIndex,
    key: Vec<u8>,
    source: DelayedSource,
    expire_ms: u64,
    mc_flags: u32,
}

struct SnapshotInner {
    serializer: SnapshotSerializer,
    consumer: Sender<SnapshotBlob>,
    stats: SnapshotStats,
    snapshot_version: u64,
    use_snapshot_version: bool,
    rec_id: u64,
    last_pushed_id: u64,
    delayed: Vec<DelayedEntry>,
    // walker position, in bucket-major order
    walk_db: usize,
    walk_cursor: Option<TraverseCursor>,
}

impl SnapshotInner {
    fn serialize_bucket(&mut self, table: &DbTable, expire_base: u64, bucket: Cursor) -> u64 {
        if self.use_snapshot_version {
            debug_assert!(table.prime.version(bucket) < self.snapshot_version);
            table.prime.set_version(bucket, self.snapshot_version);
        }
        let mut count = 0;
        for slot in table.prime.occupied_slots(bucket) {
            self.serialize_entry(table, expire_base, slot);
            count += 1;
        }
        count
    }

    fn serialize_entry(&mut self, table: &DbTable, expire_base: u64, slot: Cursor) {
        let (key, pv) = table.prime.entry(slot).expect("occupied slot");
        let key_bytes = key.as_bytes();

        let expire_ms = if pv.has_expire() {
            match table.expire.find(key_bytes) {
                Some(c) => expire_base + table.expire.value_of(c).duration_ms(),
                None => 0,
            }
        } else {
            0
        };
        let mc_flags = if pv.has_flag() {
            table
                .mcflag
                .find(key_bytes)
                .map(|c| *table.mcflag.value_of(c))
                .unwrap_or(0)
        } else {
            0
        };

        if let Some(cool) = pv.cool_bytes() {
            self.serializer
                .save_string_entry(key_bytes, cool, expire_ms, mc_flags, table.index);
            return;
        }

        if pv.is_external() {
            // avoid blocking mid-bucket: queue the read and settle it at
            // the next forced flush
            let slice = pv.external_slice().expect("external value").clone();
            self.delayed.push(DelayedEntry {
                db_index: table.index,
                key: key_bytes.to_vec(),
                source: DelayedSource::Descriptor(slice),
                expire_ms,
                mc_flags,
            });
            return;
        }

        self.serializer
            .save_entry(key_bytes, pv, expire_ms, mc_flags, table.index);
    }

    fn on_db_change(&mut self, _db: DbIndex, req: &ChangeReq<'_>, ctx: &ChangeCtx<'_>) {
        if !self.use_snapshot_version {
            return;
        }
        match req.change {
            Change::Update(bucket) => {
                if ctx.table.prime.version(bucket) < self.snapshot_version {
                    let saved = self.serialize_bucket(ctx.table, ctx.expire_base, bucket);
                    self.stats.side_saved += saved;
                    SNAPSHOT_SIDE_SAVED.add(saved);
                }
            }
            Change::Insert(key) => {
                let mut buckets = Vec::new();
                ctx.table
                    .prime
                    .cvc_upon_insert(self.snapshot_version, key, |bucket| buckets.push(bucket));
                for bucket in buckets {
                    debug_assert!(ctx.table.prime.version(bucket) < self.snapshot_version);
                    let saved = self.serialize_bucket(ctx.table, ctx.expire_base, bucket);
                    self.stats.side_saved += saved;
                    SNAPSHOT_SIDE_SAVED.add(saved);
                }
            }
        }
    }

    // A bucket position precedes the walk cursor when it has already been
    // covered by the bucket-major traversal.
    fn is_position_serialized(&self, db: DbIndex, c: Cursor) -> bool {
        let db = db as usize;
        if db < self.walk_db {
            return true;
        }
        if db > self.walk_db {
            return false;
        }
        match self.walk_cursor {
            // `None` with walk_db pointing here means this database has
            // not been started yet
            None => false,
            Some(cur) => {
                c.bucket < cur.bucket || (c.bucket == cur.bucket && c.seg < cur.seg)
            }
        }
    }

    fn on_moved(&mut self, db: DbIndex, moved: &[(Cursor, Cursor)], ctx: &ChangeCtx<'_>) {
        debug_assert!(!self.use_snapshot_version);
        for (src, dst) in moved {
            // an item moved from an unserialized position into an already
            // covered one would otherwise be lost
            if self.is_position_serialized(db, dst.bucket_cursor())
                && !self.is_position_serialized(db, src.bucket_cursor())
            {
                self.stats.moved_saved +=
                    self.serialize_bucket(ctx.table, ctx.expire_base, dst.bucket_cursor());
            }
        }
    }

    fn consume_journal_change(&mut self, item: &JournalItem) {
        self.serializer.write_journal_entry(&item.data);
        self.stats.journal_changes += 1;
    }

    fn flush_serialized(&mut self) -> usize {
        let blob = self.serializer.flush_to_blob();
        if blob.is_empty() {
            return 0;
        }
        let id = self.rec_id + 1;
        self.rec_id = id;
        // blobs leave in sequence order; with a single producer thread the
        // wait condition below always holds immediately
        debug_assert_eq!(self.last_pushed_id + 1, id);
        let len = blob.len();
        if self.consumer.send(SnapshotBlob { id, data: blob }).is_err() {
            error!("snapshot consumer disconnected");
        }
        self.last_pushed_id = id;
        SNAPSHOT_BLOB_PUSH.increment();
        len
    }
}

/// Walks every database of a slice and produces a consistent serialized
/// stream plus an ordered journal tail.
pub struct SliceSnapshot {
    inner: Rc<RefCell<SnapshotInner>>,
    snapshot_version: u64,
    stream_journal: bool,
    change_cb_id: Option<u64>,
    moved_cb_id: Option<u64>,
    journal_cb_id: Option<u32>,
    done: bool,
}

impl SliceSnapshot {
    pub fn new(consumer: Sender<SnapshotBlob>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SnapshotInner {
                serializer: SnapshotSerializer::new(),
                consumer,
                stats: SnapshotStats::default(),
                snapshot_version: 0,
                use_snapshot_version: true,
                rec_id: 0,
                last_pushed_id: 0,
                delayed: Vec::new(),
                walk_db: 0,
                walk_cursor: None,
            })),
            snapshot_version: 0,
            stream_journal: false,
            change_cb_id: None,
            moved_cb_id: None,
            journal_cb_id: None,
            done: false,
        }
    }

    pub fn stats(&self) -> SnapshotStats {
        self.inner.borrow().stats.clone()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.borrow().serializer.buffer_capacity()
    }

    /// Registers with the slice and records the snapshot version S.
    /// Entries with version below S are the ones this snapshot owns.
    pub fn start(&mut self, slice: &mut DbSlice, stream_journal: bool, point_in_time: bool) {
        debug_assert!(self.change_cb_id.is_none());

        let use_snapshot_version = if stream_journal { point_in_time } else { true };
        self.stream_journal = stream_journal;

        {
            let mut inner = self.inner.borrow_mut();
            inner.use_snapshot_version = use_snapshot_version;
            for db in 0..slice.databases() as DbIndex {
                if slice.is_db_valid(db) {
                    inner.stats.keys_total += slice.db_size(db) as u64;
                }
            }
        }

        let cb_inner = self.inner.clone();
        let id = slice.register_on_change(Box::new(move |db, req, ctx| {
            cb_inner.borrow_mut().on_db_change(db, req, ctx);
        }));
        self.snapshot_version = id;
        self.inner.borrow_mut().snapshot_version = id;
        self.change_cb_id = Some(id);

        if stream_journal {
            let journal = slice.journal_mut().expect("journal streaming requires a journal");
            let cb_inner = self.inner.clone();
            self.journal_cb_id = Some(journal.register_on_change(Box::new(move |item| {
                cb_inner.borrow_mut().consume_journal_change(item);
            })));
            if !use_snapshot_version {
                let cb_inner = self.inner.clone();
                self.moved_cb_id = Some(slice.register_on_moved(Box::new(
                    move |db, moved, ctx| {
                        cb_inner.borrow_mut().on_moved(db, moved, ctx);
                    },
                )));
            }
        }

        debug!(
            "snapshot start: saving entries with version less than {}",
            self.snapshot_version
        );
    }

    /// Resumes the walk for up to `buckets` physical buckets. Returns
    /// true once every database has been covered and the stream flushed.
    pub fn run_chunk(&mut self, slice: &mut DbSlice, buckets: usize) -> bool {
        if self.done {
            return true;
        }
        let chunk_start = Instant::now();

        for _ in 0..buckets {
            let db = {
                let inner = self.inner.borrow();
                inner.walk_db
            };
            if db >= slice.databases() {
                self.finish_walk(slice);
                return true;
            }
            if !slice.is_db_valid(db as DbIndex) {
                let mut inner = self.inner.borrow_mut();
                inner.walk_db += 1;
                inner.walk_cursor = None;
                continue;
            }

            let cursor = self.inner.borrow().walk_cursor;
            let mut chunk_buckets: Vec<Cursor> = Vec::new();
            let next = slice
                .table(db as DbIndex)
                .prime
                .traverse_buckets(cursor, |b| chunk_buckets.push(b));

            for bucket in chunk_buckets {
                self.bucket_save(slice, db as DbIndex, bucket);
            }

            let mut inner = self.inner.borrow_mut();
            match next {
                Some(c) => inner.walk_cursor = Some(c),
                None => {
                    inner.walk_db += 1;
                    inner.walk_cursor = None;
                    drop(inner);
                    self.push_serialized(slice, true);
                }
            }
        }

        let pushed = self.push_serialized(slice, false);
        if pushed {
            // serialization and compression burn CPU; give half of it back
            let sleep = (chunk_start.elapsed() / 2).min(MAX_THROTTLE_SLEEP);
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
        false
    }

    fn bucket_save(&mut self, slice: &mut DbSlice, db: DbIndex, bucket: Cursor) {
        self.inner.borrow_mut().stats.savecb_calls += 1;

        if self.inner.borrow().use_snapshot_version {
            if slice.table(db).prime.version(bucket) >= self.snapshot_version {
                // either already serialized or written after the snapshot
                // started
                self.inner.borrow_mut().stats.skipped += 1;
                return;
            }
            slice.flush_change_to_earlier_callbacks(db, bucket, self.snapshot_version);
        }

        let expire_base = slice.expire_base();
        {
            let mut inner = self.inner.borrow_mut();
            let saved = inner.serialize_bucket(slice.table(db), expire_base, bucket);
            inner.stats.loop_serialized += saved;
            SNAPSHOT_LOOP_SERIALIZED.add(saved);
        }
        self.schedule_delayed_reads(slice);
    }

    // issue reads for queued external entries while the backing bytes are
    // still guaranteed to exist; the futures are awaited at flush time
    fn schedule_delayed_reads(&mut self, slice: &mut DbSlice) {
        let mut inner = self.inner.borrow_mut();
        if inner.delayed.is_empty() {
            return;
        }
        let Some(tiered) = slice.tiered_mut() else {
            return;
        };
        for entry in inner.delayed.iter_mut() {
            if let DelayedSource::Descriptor(desc) = &entry.source {
                let mut probe = crate::value::PrimeValue::default();
                probe.set_external(desc.clone());
                let future = tiered.read(entry.db_index, &entry.key, &probe);
                entry.source = DelayedSource::Future(future);
            }
        }
    }

    fn finish_walk(&mut self, slice: &mut DbSlice) {
        if self.stream_journal {
            self.inner.borrow_mut().serializer.send_full_sync_cut();
        }
        self.push_serialized(slice, true);

        if let Some(id) = self.change_cb_id.take() {
            slice.unregister_on_change(id);
        }
        if let Some(id) = self.moved_cb_id.take() {
            slice.unregister_on_moved(id);
        }
        self.done = true;

        let stats = self.stats();
        debug!(
            "snapshot done: loop_serialized {} side_saved {} savecb_calls {} skipped {} journal {} moved {}",
            stats.loop_serialized,
            stats.side_saved,
            stats.savecb_calls,
            stats.skipped,
            stats.journal_changes,
            stats.moved_saved,
        );
    }

    /// Flushes buffered bytes once the blob threshold is reached, or
    /// unconditionally when forced. Delayed external reads are awaited
    /// and serialized here, the designated blocking point.
    pub fn push_serialized(&mut self, slice: &mut DbSlice, force: bool) -> bool {
        {
            let inner = self.inner.borrow();
            if !force
                && inner.serializer.serialized_len() < MIN_BLOB_SIZE
                && inner.delayed.len() < MAX_DELAYED_ENTRIES
            {
                return false;
            }
        }

        let mut serialized = self.inner.borrow_mut().flush_serialized();

        let delayed: Vec<DelayedEntry> = std::mem::take(&mut self.inner.borrow_mut().delayed);
        if !delayed.is_empty() {
            for entry in delayed {
                let result = match entry.source {
                    DelayedSource::Future(future) => future.get(),
                    DelayedSource::Descriptor(desc) => match slice.tiered_mut() {
                        Some(tiered) => {
                            let mut probe = crate::value::PrimeValue::default();
                            probe.set_external(desc);
                            tiered.read(entry.db_index, &entry.key, &probe).get()
                        }
                        None => Err("tiered storage detached".to_string()),
                    },
                };
                match result {
                    Ok(bytes) => {
                        self.inner.borrow_mut().serializer.save_string_entry(
                            &entry.key,
                            &bytes,
                            entry.expire_ms,
                            entry.mc_flags,
                            entry.db_index,
                        );
                    }
                    Err(err) => {
                        error!(
                            "dropping external value for {:?}: {err}",
                            String::from_utf8_lossy(&entry.key)
                        );
                    }
                }
            }
            serialized += self.inner.borrow_mut().flush_serialized();
        }
        serialized > 0
    }

    /// Streams journal entries from `lsn` up to the current tail, then
    /// switches to live streaming. Fails when `lsn` has aged out of the
    /// journal buffer.
    pub fn start_incremental(&mut self, slice: &mut DbSlice, start_lsn: Lsn) -> OpResult<()> {
        debug!("incremental snapshot from lsn={start_lsn}");
        let mut lsn = start_lsn;
        loop {
            let journal = slice.journal_mut().expect("incremental requires a journal");
            if journal.lsn() <= lsn {
                break;
            }
            if !journal.is_lsn_in_buffer(lsn) {
                // the tail the replica wants is gone
                self.done = true;
                error!(
                    "partial sync unsuccessful: entry #{lsn} was dropped from the buffer, current lsn={}",
                    journal.lsn()
                );
                return Err(OpStatus::StateNotRecoverable);
            }
            let data = journal.entry(lsn).expect("checked in buffer").data.clone();
            self.inner.borrow_mut().serializer.write_journal_entry(&data);
            lsn += 1;
            self.push_serialized(slice, false);
        }

        self.inner.borrow_mut().serializer.send_full_sync_cut();
        let cb_inner = self.inner.clone();
        let journal = slice.journal_mut().expect("incremental requires a journal");
        self.journal_cb_id = Some(journal.register_on_change(Box::new(move |item| {
            cb_inner.borrow_mut().consume_journal_change(item);
        })));
        self.stream_journal = true;
        self.done = true;
        self.push_serialized(slice, true);
        Ok(())
    }

    /// Stops journal streaming: waits for the walk to finish, writes the
    /// current LSN as an offset marker and flushes.
    pub fn finalize_journal_stream(&mut self, slice: &mut DbSlice, cancel: bool) {
        let Some(cb_id) = self.journal_cb_id.take() else {
            // finalize only once; the walk may still need to finish
            while !self.run_chunk(slice, usize::MAX) {}
            return;
        };

        while !self.run_chunk(slice, usize::MAX) {}

        let lsn = {
            let journal = slice.journal_mut().expect("journal streaming requires a journal");
            journal.unregister_on_change(cb_id);
            journal.lsn()
        };
        if !cancel {
            debug!("finalize journal stream lsn: {lsn}");
            self.inner.borrow_mut().serializer.send_journal_offset(lsn);
            self.push_serialized(slice, true);
        }
    }

    /// Cancels the walk and detaches from the slice.
    pub fn cancel(&mut self, slice: &mut DbSlice) {
        if let Some(id) = self.change_cb_id.take() {
            slice.unregister_on_change(id);
        }
        if let Some(id) = self.moved_cb_id.take() {
            slice.unregister_on_moved(id);
        }
        if let Some(id) = self.journal_cb_id.take() {
            if let Some(journal) = slice.journal_mut() {
                journal.unregister_on_change(id);
            }
        }
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::serializer::{decode_command, decode_stream, SnapshotRecord};
    use crate::slice::SliceConfig;
    use crate::DbContext;
    use crossbeam_channel::unbounded;
    use std::collections::HashMap;

    fn cntx(now: u64) -> DbContext {
        DbContext::new(0, now)
    }

    fn slice() -> DbSlice {
        DbSlice::new(0, SliceConfig::default())
    }

    fn set_str(slice: &mut DbSlice, key: &[u8], value: &[u8]) {
        let mut res = slice.add_or_find(&cntx(0), key, None).expect("insert");
        slice.pv_mut(0, res.it).set_string(value);
        res.post_updater.run(slice);
    }

    fn collect_entries(blobs: &[SnapshotBlob]) -> Vec<SnapshotRecord> {
        let mut all = Vec::new();
        for blob in blobs {
            all.extend(decode_stream(&blob.data).expect("valid stream"));
        }
        all
    }

    #[test]
    fn full_snapshot_covers_every_key() {
        let mut s = slice();
        for i in 0..1000u32 {
            set_str(&mut s, format!("key-{i}").as_bytes(), format!("val-{i}").as_bytes());
        }

        let (tx, rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        snapshot.start(&mut s, false, true);
        while !snapshot.run_chunk(&mut s, 8) {}

        drop(snapshot);
        let blobs: Vec<SnapshotBlob> = rx.try_iter().collect();
        let mut seen: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        for record in collect_entries(&blobs) {
            if let SnapshotRecord::Entry { key, value, .. } = record {
                assert!(seen.insert(key, value).is_none(), "key serialized twice");
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(seen.get(&b"key-7"[..].to_vec()), Some(&b"val-7".to_vec()));
    }

    #[test]
    fn point_in_time_against_concurrent_writes() {
        let mut s = slice();
        for i in 0..500u32 {
            set_str(&mut s, format!("orig-{i}").as_bytes(), b"old");
        }

        let (tx, rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        snapshot.start(&mut s, false, true);

        let mut added = 0u32;
        let mut overwritten = 0u32;
        loop {
            if snapshot.run_chunk(&mut s, 2) {
                break;
            }
            // overwrite existing keys and add fresh ones mid-walk
            for _ in 0..5 {
                set_str(&mut s, format!("orig-{overwritten}").as_bytes(), b"new");
                overwritten = (overwritten + 1) % 500;
                set_str(&mut s, format!("added-{added}").as_bytes(), b"x");
                added += 1;
            }
        }

        let stats = snapshot.stats();
        drop(snapshot);
        let blobs: Vec<SnapshotBlob> = rx.try_iter().collect();
        let mut seen: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        for record in collect_entries(&blobs) {
            if let SnapshotRecord::Entry { key, value, .. } = record {
                assert!(
                    seen.insert(key.clone(), value).is_none(),
                    "key {:?} serialized twice",
                    String::from_utf8_lossy(&key)
                );
            }
        }

        // every original key exactly once, with its value as of the start
        for i in 0..500u32 {
            let key = format!("orig-{i}").into_bytes();
            assert_eq!(
                seen.get(&key).map(|v| v.as_slice()),
                Some(&b"old"[..]),
                "orig-{i} captured with the wrong value"
            );
        }
        // keys born after the snapshot version never appear
        for (key, _) in &seen {
            assert!(
                !key.starts_with(b"added-"),
                "{} leaked into the snapshot",
                String::from_utf8_lossy(key)
            );
        }
        assert!(stats.side_saved > 0, "concurrent writes must side-save");
    }

    #[test]
    fn journal_entries_follow_first_serialization() {
        let mut s = slice();
        s.set_journal(Journal::default());
        for i in 0..100u32 {
            set_str(&mut s, format!("jk-{i}").as_bytes(), b"v0");
        }

        let (tx, rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        snapshot.start(&mut s, true, true);

        let mut step = 0u32;
        loop {
            if snapshot.run_chunk(&mut s, 1) {
                break;
            }
            // a mutation plus its journal record, as one transaction
            let key = format!("jk-{}", step % 100);
            set_str(&mut s, key.as_bytes(), b"v1");
            s.journal_mut()
                .unwrap()
                .record_command(0, &[b"SET", key.as_bytes(), b"v1"]);
            step += 1;
        }
        snapshot.finalize_journal_stream(&mut s, false);

        drop(snapshot);
        let blobs: Vec<SnapshotBlob> = rx.try_iter().collect();
        let records = collect_entries(&blobs);

        // for every key its value record comes before any journal entry
        let mut value_seen: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut cut_seen = false;
        let mut offset_seen = false;
        for (pos, record) in records.iter().enumerate() {
            match record {
                SnapshotRecord::Entry { key, .. } => {
                    value_seen.entry(key.clone()).or_insert(pos);
                }
                SnapshotRecord::Journal(frame) => {
                    let args = decode_command(frame).expect("valid journal frame");
                    let key = &args[1];
                    let value_pos = value_seen
                        .get(key)
                        .copied()
                        .expect("journal entry arrived before the key's value record");
                    assert!(
                        value_pos < pos,
                        "journal entry for {:?} precedes its value",
                        String::from_utf8_lossy(key)
                    );
                }
                SnapshotRecord::FullSyncCut => cut_seen = true,
                SnapshotRecord::JournalOffset(_) => offset_seen = true,
                SnapshotRecord::SetEntry { .. } | SnapshotRecord::ZSetEntry { .. } => {}
            }
        }
        assert_eq!(value_seen.len(), 100);
        assert!(cut_seen, "journal streaming ends with a full-sync-cut");
        assert!(offset_seen, "finalize writes the journal offset");
    }

    #[test]
    fn incremental_streams_buffered_tail() {
        let mut s = slice();
        s.set_journal(Journal::default());
        for i in 0..10u8 {
            s.journal_mut().unwrap().record_command(0, &[b"SET", &[i], b"v"]);
        }

        let (tx, rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        snapshot.start_incremental(&mut s, 4).expect("lsn in buffer");

        // live entries after the switch flow through as well
        s.journal_mut().unwrap().record_command(0, &[b"SET", b"live", b"v"]);
        snapshot.finalize_journal_stream(&mut s, false);

        drop(snapshot);
        let blobs: Vec<SnapshotBlob> = rx.try_iter().collect();
        let records = collect_entries(&blobs);

        let journal_count = records
            .iter()
            .filter(|r| matches!(r, SnapshotRecord::Journal(_)))
            .count();
        // entries 4..10 from the buffer plus the live one
        assert_eq!(journal_count, 7);
        let cut_pos = records
            .iter()
            .position(|r| matches!(r, SnapshotRecord::FullSyncCut))
            .expect("cut marker present");
        let live_pos = records
            .iter()
            .rposition(|r| matches!(r, SnapshotRecord::Journal(_)))
            .unwrap();
        assert!(cut_pos < live_pos, "live tail follows the cut");
    }

    #[test]
    fn incremental_fails_when_lsn_aged_out() {
        let mut s = slice();
        s.set_journal(Journal::new(4));
        for i in 0..20u8 {
            s.journal_mut().unwrap().record_command(0, &[b"SET", &[i], b"v"]);
        }

        let (tx, _rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        assert_eq!(
            snapshot.start_incremental(&mut s, 2),
            Err(OpStatus::StateNotRecoverable)
        );
    }

    #[test]
    fn expire_and_flags_travel_with_entries() {
        let mut s = slice();
        let mut res = s.add_or_find(&cntx(0), b"flagged", None).unwrap();
        s.pv_mut(0, res.it).set_string(b"v");
        res.post_updater.run(&mut s);
        let it = res.it;
        s.add_expire(0, it, 123_456);
        s.pv_mut(0, it).set_flag(true);
        s.set_mc_flag(0, b"flagged", 99);

        let (tx, rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        snapshot.start(&mut s, false, true);
        while !snapshot.run_chunk(&mut s, 8) {}

        drop(snapshot);
        let blobs: Vec<SnapshotBlob> = rx.try_iter().collect();
        let records = collect_entries(&blobs);
        match &records[0] {
            SnapshotRecord::Entry {
                key,
                expire_ms,
                mc_flags,
                ..
            } => {
                assert_eq!(key, b"flagged");
                assert_eq!(*expire_ms, 123_456);
                assert_eq!(*mc_flags, 99);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn blobs_arrive_in_sequence_order() {
        let mut s = slice();
        for i in 0..5000u32 {
            set_str(
                &mut s,
                format!("blob-key-{i}").as_bytes(),
                b"some value that is long enough to fill blobs quickly",
            );
        }

        let (tx, rx) = unbounded();
        let mut snapshot = SliceSnapshot::new(tx);
        snapshot.start(&mut s, false, true);
        while !snapshot.run_chunk(&mut s, 16) {}

        drop(snapshot);
        let blobs: Vec<SnapshotBlob> = rx.try_iter().collect();
        assert!(blobs.len() > 1, "expected multiple blobs");
        for (i, blob) in blobs.iter().enumerate() {
            assert_eq!(blob.id, i as u64 + 1);
        }
    }
}
