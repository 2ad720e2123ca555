// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The shard pool. Each shard is a dedicated thread exclusively owning
//! its keyspace slice; a key maps to its shard by stable hash and lives
//! there forever. Cross-shard work is message-passed onto the owning
//! thread, either awaited or fire-and-forget, and between tasks the
//! shard runs its background duties (cache-mode promotions, expired-key
//! event publication, tracking invalidations).

use config::ShrikeConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use keyspace::journal::Journal;
use keyspace::slice::{DbSlice, SliceConfig};
use keyspace::{hash_key, ShardId};
use pubsub::{ChannelStore, ShardDispatch};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

pub enum ShardTask {
    Run(Box<dyn FnOnce(&mut EngineShard) + Send>),
    Stop,
}

pub struct EngineShard {
    shard_id: ShardId,
    pub slice: DbSlice,
    channel_store: Arc<ChannelStore>,
    dispatch: Arc<ShardQueues>,
}

impl EngineShard {
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn channel_store(&self) -> &Arc<ChannelStore> {
        &self.channel_store
    }

    /// Re-fetches the channel store view. Invoked by the cross-shard
    /// refresh that follows every pub/sub update; the dispatch is the
    /// barrier after which retired views may be reclaimed.
    pub fn refresh_channel_store(&mut self) {
        self.channel_store = pubsub::control_block().latest();
    }

    // Runs between tasks: promotes fetched entries, publishes expired-key
    // events and drains tracking invalidations.
    fn run_background(&mut self) {
        let invalidations = self.slice.on_cb_finish();
        // invalidation delivery belongs to the connection layer; the core
        // only guarantees the queue is drained in order
        drop(invalidations);

        for db in 0..self.slice.databases() as keyspace::DbIndex {
            if !self.slice.is_db_valid(db) {
                continue;
            }
            let events = self.slice.take_expired_events(db);
            if events.is_empty() {
                continue;
            }
            let channel = format!("__keyevent@{db}__:expired");
            let messages: Vec<&[u8]> = events.iter().map(|e| e.as_slice()).collect();
            self.channel_store
                .send_messages(channel.as_bytes(), &messages, &*self.dispatch);
        }
    }
}

/// The sender half of every shard's task queue; shared with the shard
/// threads themselves so any thread can dispatch onward.
pub struct ShardQueues {
    txs: Vec<Sender<ShardTask>>,
}

impl ShardQueues {
    fn send(&self, shard: ShardId, task: ShardTask) {
        let _ = self.txs[shard as usize].send(task);
    }
}

impl ShardDispatch for ShardQueues {
    fn shard_count(&self) -> u32 {
        self.txs.len() as u32
    }

    fn await_on_all(&self, cb: Arc<dyn Fn(u32) + Send + Sync>) {
        let (done_tx, done_rx) = bounded(self.txs.len());
        for shard in 0..self.txs.len() as ShardId {
            let cb = cb.clone();
            let done_tx = done_tx.clone();
            self.send(
                shard,
                ShardTask::Run(Box::new(move |shard| {
                    shard.refresh_channel_store();
                    cb(shard.shard_id);
                    let _ = done_tx.send(());
                })),
            );
        }
        for _ in 0..self.txs.len() {
            let _ = done_rx.recv();
        }
    }

    fn dispatch_brief(&self, cb: Arc<dyn Fn(u32) + Send + Sync>) {
        for shard in 0..self.txs.len() as ShardId {
            let cb = cb.clone();
            self.send(
                shard,
                ShardTask::Run(Box::new(move |shard| cb(shard.shard_id))),
            );
        }
    }
}

pub struct ShardSet {
    queues: Arc<ShardQueues>,
    threads: Vec<JoinHandle<()>>,
}

impl ShardSet {
    pub fn new(config: &ShrikeConfig) -> Self {
        let shard_count = config.shard_count();
        let slice_config = SliceConfig {
            cache_mode: config.general.cache_mode,
            max_memory: config.general.max_memory,
            shard_count,
            table_growth_margin: config.keyspace.table_growth_margin,
            max_eviction_per_heartbeat: config.keyspace.max_eviction_per_heartbeat,
            max_segment_to_consider: config.keyspace.max_segment_to_consider,
            expired_keys_events_recording: !config.keyspace.notify_keyspace_events.is_empty(),
        };

        let mut txs = Vec::with_capacity(shard_count);
        let mut rxs: Vec<Receiver<ShardTask>> = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = unbounded();
            txs.push(tx);
            rxs.push(rx);
        }
        let queues = Arc::new(ShardQueues { txs });

        let mut threads = Vec::with_capacity(shard_count);
        for (i, rx) in rxs.into_iter().enumerate() {
            let queues = queues.clone();
            let slice_config = slice_config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("shrike_shard_{i}"))
                .spawn(move || {
                    // the slice is created on its owning thread and never
                    // leaves it
                    let mut slice = DbSlice::new(i as ShardId, slice_config);
                    slice.set_journal(Journal::default());
                    let mut shard = EngineShard {
                        shard_id: i as ShardId,
                        slice,
                        channel_store: pubsub::control_block().latest(),
                        dispatch: queues,
                    };
                    shard_loop(&mut shard, rx);
                })
                .expect("failed to spawn shard thread");
            threads.push(handle);
        }

        Self { queues, threads }
    }

    pub fn size(&self) -> usize {
        self.queues.txs.len()
    }

    pub fn queues(&self) -> &Arc<ShardQueues> {
        &self.queues
    }

    /// The owning shard of a key, stable for the process lifetime.
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        (hash_key(key) % self.size() as u64) as ShardId
    }

    /// Runs `f` on the target shard thread and waits for the result.
    pub fn await_brief<R, F>(&self, shard: ShardId, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.queues.send(
            shard,
            ShardTask::Run(Box::new(move |shard| {
                let _ = tx.send(f(shard));
            })),
        );
        rx.recv().expect("shard thread terminated")
    }

    /// Fire-and-forget on the target shard.
    pub fn dispatch_brief_on<F>(&self, shard: ShardId, f: F)
    where
        F: FnOnce(&mut EngineShard) + Send + 'static,
    {
        self.queues.send(shard, ShardTask::Run(Box::new(f)));
    }

    /// Runs `f` on every shard and waits for all of them.
    pub fn await_fiber_on_all<F>(&self, f: F)
    where
        F: Fn(&mut EngineShard) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let (done_tx, done_rx) = bounded(self.size());
        for shard in 0..self.size() as ShardId {
            let f = f.clone();
            let done_tx = done_tx.clone();
            self.queues.send(
                shard,
                ShardTask::Run(Box::new(move |shard| {
                    f(shard);
                    let _ = done_tx.send(());
                })),
            );
        }
        for _ in 0..self.size() {
            let _ = done_rx.recv();
        }
    }

    pub fn shutdown(mut self) {
        for shard in 0..self.size() as ShardId {
            self.queues.send(shard, ShardTask::Stop);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!("shard set stopped");
    }
}

fn shard_loop(shard: &mut EngineShard, rx: Receiver<ShardTask>) {
    while let Ok(task) = rx.recv() {
        match task {
            ShardTask::Run(f) => {
                f(shard);
                shard.run_background();
            }
            ShardTask::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_set(n: usize) -> ShardSet {
        pubsub::init();
        let config = ShrikeConfig {
            general: config::General {
                shard_count: n,
                ..Default::default()
            },
            ..Default::default()
        };
        ShardSet::new(&config)
    }

    #[test]
    fn keys_route_stably() {
        let set = shard_set(4);
        let a = set.shard_for_key(b"alpha");
        assert_eq!(a, set.shard_for_key(b"alpha"));
        assert!((a as usize) < set.size());
        set.shutdown();
    }

    #[test]
    fn await_brief_runs_on_owner() {
        let set = shard_set(2);
        let sid = set.shard_for_key(b"k");
        let observed = set.await_brief(sid, move |shard| shard.shard_id());
        assert_eq!(observed, sid);
        set.shutdown();
    }

    #[test]
    fn await_on_all_reaches_every_shard() {
        let set = shard_set(3);
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        set.await_fiber_on_all(move |_shard| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
        set.shutdown();
    }
}
