// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The channel store proper: maps channels and patterns to subscribers.
//! Readers treat a fetched store as immutable; the updater performs
//! copy-on-write on the outer maps and copy-or-delete on the per-channel
//! subscriber maps, then publishes the replacement through the control
//! block and refreshes every shard's cached reference.

use crate::glob::GlobMatcher;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub type ClientId = u64;

/// One published message as delivered to a subscriber's connection.
#[derive(Clone)]
pub struct PubMessage {
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<Vec<u8>>,
    pub channel: Arc<[u8]>,
    pub payload: Arc<[u8]>,
}

/// The outbound half of a subscribed connection. Delivery happens on the
/// subscriber's home thread; implementations enqueue asynchronously.
pub trait MessageSink: Send + Sync {
    fn send_pub_message(&self, msg: PubMessage);

    /// A sink whose connection has gone away; skipped at publish time.
    fn is_expired(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct SubEntry {
    thread: u32,
    sink: Arc<dyn MessageSink>,
}

type SubscribeMap = HashMap<ClientId, SubEntry, RandomState>;
type ChannelMap = HashMap<Vec<u8>, Arc<SubscribeMap>, RandomState>;

/// Cross-shard dispatch used by publication and by the post-update
/// barrier. The engine's shard set implements this. The awaiting variant
/// must not be invoked from a shard thread.
pub trait ShardDispatch {
    fn shard_count(&self) -> u32;

    /// Runs `cb(shard)` on every shard thread and waits for all of them.
    fn await_on_all(&self, cb: Arc<dyn Fn(u32) + Send + Sync>);

    /// Runs `cb(shard)` on every shard thread without waiting.
    fn dispatch_brief(&self, cb: Arc<dyn Fn(u32) + Send + Sync>);

    /// Probes that a shard's outbound buffers can take another message.
    fn ensure_publish_budget(&self, _shard: u32) {}
}

/// A subscriber resolved at publish time, sorted by home thread.
#[derive(Clone)]
pub struct Subscriber {
    pub client: ClientId,
    pub thread: u32,
    pub pattern: Option<Vec<u8>>,
    sink: Arc<dyn MessageSink>,
}

impl Subscriber {
    pub fn by_thread(lhs: &Subscriber, rhs: &Subscriber) -> std::cmp::Ordering {
        lhs.thread.cmp(&rhs.thread)
    }

    pub fn is_expired(&self) -> bool {
        self.sink.is_expired()
    }
}

pub struct ChannelStore {
    channels: ChannelMap,
    patterns: ChannelMap,
}

/// Global slot holding the most recent store. One writer at a time; the
/// mutex also covers the copy-on-write critical section.
pub struct ControlBlock {
    most_recent: Mutex<Arc<ChannelStore>>,
}

static CONTROL_BLOCK: OnceLock<ControlBlock> = OnceLock::new();

/// Initializes the process-wide control block. Must be called during
/// server startup, before any subscribe or publish.
pub fn init() {
    let _ = CONTROL_BLOCK.set(ControlBlock {
        most_recent: Mutex::new(Arc::new(ChannelStore::new())),
    });
}

pub fn control_block() -> &'static ControlBlock {
    CONTROL_BLOCK
        .get()
        .expect("channel store accessed before init")
}

impl ControlBlock {
    /// Fetches the latest store; shards call this from the refresh
    /// dispatch to update their cached reference.
    pub fn latest(&self) -> Arc<ChannelStore> {
        self.most_recent.lock().clone()
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self {
            channels: ChannelMap::default(),
            patterns: ChannelMap::default(),
        }
    }

    pub fn fetch_subscribers(&self, channel: &[u8]) -> Vec<Subscriber> {
        let mut res = Vec::new();

        if let Some(subs) = self.channels.get(channel) {
            fill(subs, None, &mut res);
        }
        for (pat, subs) in &self.patterns {
            let matcher = GlobMatcher::new(pat, true);
            if matcher.matches(channel) {
                fill(subs, Some(pat.clone()), &mut res);
            }
        }

        res.sort_by(Subscriber::by_thread);
        res
    }

    pub fn list_channels(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let matcher = GlobMatcher::new(pattern, true);
        self.channels
            .keys()
            .filter(|c| pattern.is_empty() || matcher.matches(c))
            .cloned()
            .collect()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Publishes `messages` to every subscriber of `channel`, including
    /// pattern matches. Delivery is dispatched to each subscriber's home
    /// thread; the message buffer is shared, not copied per subscriber.
    pub fn send_messages(
        &self,
        channel: &[u8],
        messages: &[&[u8]],
        dispatcher: &dyn ShardDispatch,
    ) -> usize {
        let subscribers = self.fetch_subscribers(channel);
        if subscribers.is_empty() {
            return 0;
        }

        // probe each involved thread's outbound budget before fanning out
        let mut last_thread = None;
        for sub in &subscribers {
            if last_thread == Some(sub.thread) || sub.is_expired() {
                continue;
            }
            dispatcher.ensure_publish_budget(sub.thread);
            last_thread = Some(sub.thread);
        }

        let channel_buf: Arc<[u8]> = channel.into();
        let payloads: Vec<Arc<[u8]>> = messages.iter().map(|&m| Arc::from(m)).collect();
        let subscribers = Arc::new(subscribers);
        let count = subscribers.len();

        let cb_subs = subscribers.clone();
        dispatcher.dispatch_brief(Arc::new(move |idx: u32| {
            let start = cb_subs.partition_point(|s| s.thread < idx);
            for sub in cb_subs[start..].iter().take_while(|s| s.thread == idx) {
                if sub.is_expired() {
                    continue;
                }
                for payload in &payloads {
                    sub.sink.send_pub_message(PubMessage {
                        pattern: sub.pattern.clone(),
                        channel: channel_buf.clone(),
                        payload: payload.clone(),
                    });
                }
            }
        }));

        count
    }
}

fn fill(src: &SubscribeMap, pattern: Option<Vec<u8>>, out: &mut Vec<Subscriber>) {
    out.reserve(src.len());
    for (&client, entry) in src {
        out.push(Subscriber {
            client,
            thread: entry.thread,
            pattern: pattern.clone(),
            sink: entry.sink.clone(),
        });
    }
}

/// Applies one subscriber's additions or removals over a set of channels
/// (or patterns), then publishes the new store and establishes the
/// reclamation barrier.
pub struct ChannelStoreUpdater {
    pattern: bool,
    to_add: bool,
    client: ClientId,
    thread: u32,
    sink: Option<Arc<dyn MessageSink>>,
    ops: Vec<Vec<u8>>,
}

impl ChannelStoreUpdater {
    pub fn subscribe(pattern: bool, client: ClientId, thread: u32, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            pattern,
            to_add: true,
            client,
            thread,
            sink: Some(sink),
            ops: Vec::new(),
        }
    }

    pub fn unsubscribe(pattern: bool, client: ClientId, thread: u32) -> Self {
        Self {
            pattern,
            to_add: false,
            client,
            thread,
            sink: None,
            ops: Vec::new(),
        }
    }

    pub fn record(&mut self, channel: &[u8]) {
        self.ops.push(channel.to_vec());
    }

    fn entry(&self) -> SubEntry {
        SubEntry {
            thread: self.thread,
            sink: self.sink.clone().expect("subscribe carries a sink"),
        }
    }

    fn modify(&self, target: &mut ChannelMap, key: &[u8]) {
        match target.get(key) {
            // new channel, add a new slot
            None if self.to_add => {
                let mut subs = SubscribeMap::default();
                subs.insert(self.client, self.entry());
                target.insert(key.to_vec(), Arc::new(subs));
            }
            None => {}
            Some(slot) => {
                // last subscriber leaving removes the slot entirely
                if !self.to_add && slot.len() == 1 {
                    debug_assert!(slot.contains_key(&self.client));
                    target.remove(key);
                    return;
                }
                // otherwise replace the subscriber map with a copy
                // carrying the mutation; the old map stays alive for
                // readers until the barrier
                let mut replacement: SubscribeMap = (**slot).clone();
                if self.to_add {
                    replacement.insert(self.client, self.entry());
                } else {
                    replacement.remove(&self.client);
                }
                target.insert(key.to_vec(), Arc::new(replacement));
            }
        }
    }

    /// Publishes the mutation: copy what must be copied, swap the store
    /// pointer, then dispatch a refresh to every shard. Returning drops
    /// the retired maps once the dispatch has completed.
    pub fn apply(mut self, dispatcher: &dyn ShardDispatch) {
        if self.ops.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.ops);
        let cb = control_block();

        // single writer: the lock covers read-copy-update of the maps
        let mut most_recent = cb.most_recent.lock();
        let store = most_recent.clone();

        let target_src = if self.pattern {
            &store.patterns
        } else {
            &store.channels
        };
        let mut target: ChannelMap = target_src.clone();
        for key in &ops {
            self.modify(&mut target, key);
        }

        let replacement = if self.pattern {
            ChannelStore {
                channels: store.channels.clone(),
                patterns: target,
            }
        } else {
            ChannelStore {
                channels: target,
                patterns: store.patterns.clone(),
            }
        };

        *most_recent = Arc::new(replacement);
        drop(most_recent);

        debug!(
            "channel store updated: client {} {} {} channel(s)",
            self.client,
            if self.to_add { "subscribed to" } else { "unsubscribed from" },
            ops.len()
        );

        // refresh every shard's cached reference; once this returns no
        // reader can still hold the retired maps except through its own
        // reference count
        dispatcher.await_on_all(Arc::new(|_idx| {
            // shards re-fetch via control_block().latest() in their
            // refresh hook; the dispatch itself is the barrier
        }));

        drop(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver, Sender};

    struct TestSink {
        tx: Sender<PubMessage>,
    }

    impl MessageSink for TestSink {
        fn send_pub_message(&self, msg: PubMessage) {
            let _ = self.tx.send(msg);
        }
    }

    struct InlineDispatch {
        shards: u32,
    }

    impl ShardDispatch for InlineDispatch {
        fn shard_count(&self) -> u32 {
            self.shards
        }

        fn await_on_all(&self, cb: Arc<dyn Fn(u32) + Send + Sync>) {
            for i in 0..self.shards {
                cb(i);
            }
        }

        fn dispatch_brief(&self, cb: Arc<dyn Fn(u32) + Send + Sync>) {
            for i in 0..self.shards {
                cb(i);
            }
        }
    }

    fn sink() -> (Arc<TestSink>, Receiver<PubMessage>) {
        let (tx, rx) = unbounded();
        (Arc::new(TestSink { tx }), rx)
    }

    fn setup() -> InlineDispatch {
        init();
        InlineDispatch { shards: 2 }
    }

    #[test]
    fn subscribe_publish_unsubscribe() {
        let dispatch = setup();
        let (sink1, rx1) = sink();

        let mut updater = ChannelStoreUpdater::subscribe(false, 1, 0, sink1);
        updater.record(b"news.tech");
        updater.apply(&dispatch);

        let store = control_block().latest();
        let delivered = store.send_messages(b"news.tech", &[b"hello"], &dispatch);
        assert_eq!(delivered, 1);
        let msg = rx1.try_recv().expect("message delivered");
        assert_eq!(&*msg.channel, b"news.tech");
        assert_eq!(&*msg.payload, b"hello");
        assert!(msg.pattern.is_none());

        let mut updater = ChannelStoreUpdater::unsubscribe(false, 1, 0);
        updater.record(b"news.tech");
        updater.apply(&dispatch);

        let store = control_block().latest();
        assert_eq!(store.send_messages(b"news.tech", &[b"gone"], &dispatch), 0);
        assert_eq!(store.subscriber_count(b"news.tech"), 0);
    }

    #[test]
    fn pattern_subscriptions_match_with_glob() {
        let dispatch = setup();
        let (sink1, rx1) = sink();

        let mut updater = ChannelStoreUpdater::subscribe(true, 7, 1, sink1);
        updater.record(b"news.*");
        updater.apply(&dispatch);

        let store = control_block().latest();
        let delivered = store.send_messages(b"news.sports", &[b"scores"], &dispatch);
        assert_eq!(delivered, 1);
        let msg = rx1.try_recv().unwrap();
        assert_eq!(msg.pattern.as_deref(), Some(&b"news.*"[..]));
        assert_eq!(&*msg.channel, b"news.sports");

        let mut updater = ChannelStoreUpdater::unsubscribe(true, 7, 1);
        updater.record(b"news.*");
        updater.apply(&dispatch);
    }

    #[test]
    fn old_views_stay_valid_for_readers() {
        let dispatch = setup();
        let (sink1, _rx1) = sink();

        let mut updater = ChannelStoreUpdater::subscribe(false, 11, 0, sink1);
        updater.record(b"stable");
        updater.apply(&dispatch);

        // a reader that fetched before the next update keeps a coherent
        // view through its own reference
        let old_view = control_block().latest();
        assert_eq!(old_view.subscriber_count(b"stable"), 1);

        let mut updater = ChannelStoreUpdater::unsubscribe(false, 11, 0);
        updater.record(b"stable");
        updater.apply(&dispatch);

        assert_eq!(old_view.subscriber_count(b"stable"), 1);
        assert_eq!(control_block().latest().subscriber_count(b"stable"), 0);
    }

    #[test]
    fn delivery_targets_home_threads() {
        let dispatch = setup();
        let (sink_a, rx_a) = sink();
        let (sink_b, rx_b) = sink();

        let mut updater = ChannelStoreUpdater::subscribe(false, 21, 0, sink_a);
        updater.record(b"fan");
        updater.apply(&dispatch);
        let mut updater = ChannelStoreUpdater::subscribe(false, 22, 1, sink_b);
        updater.record(b"fan");
        updater.apply(&dispatch);

        let store = control_block().latest();
        assert_eq!(store.send_messages(b"fan", &[b"m1", b"m2"], &dispatch), 2);
        assert_eq!(rx_a.try_iter().count(), 2);
        assert_eq!(rx_b.try_iter().count(), 2);

        for client in [21, 22] {
            let mut updater = ChannelStoreUpdater::unsubscribe(false, client, 0);
            updater.record(b"fan");
            updater.apply(&dispatch);
        }
    }

    #[test]
    fn list_channels_filters_by_pattern() {
        let dispatch = setup();
        let (sink1, _rx) = sink();
        for channel in [&b"alpha.one"[..], b"alpha.two", b"beta.one"] {
            let mut updater = ChannelStoreUpdater::subscribe(false, 31, 0, sink1.clone());
            updater.record(channel);
            updater.apply(&dispatch);
        }

        let store = control_block().latest();
        let mut alphas = store.list_channels(b"alpha.*");
        alphas.sort();
        assert_eq!(alphas, vec![b"alpha.one".to_vec(), b"alpha.two".to_vec()]);
        assert!(store.list_channels(b"").len() >= 3);

        for channel in [&b"alpha.one"[..], b"alpha.two", b"beta.one"] {
            let mut updater = ChannelStoreUpdater::unsubscribe(false, 31, 0);
            updater.record(channel);
            updater.apply(&dispatch);
        }
    }
}
