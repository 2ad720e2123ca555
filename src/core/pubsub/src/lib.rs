// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Process-wide pub/sub routing. Channel and pattern subscriptions live
//! in a read-mostly store: readers work off an immutable view they cached
//! at their last refresh, while a single writer at a time builds a
//! replacement via copy-on-write and publishes it through the control
//! block. A cross-shard refresh after each publish is the barrier that
//! lets retired views be reclaimed.

mod glob;
mod store;

pub use glob::GlobMatcher;
pub use store::{
    control_block, init, ChannelStore, ChannelStoreUpdater, ClientId, MessageSink, PubMessage,
    ShardDispatch, Subscriber,
};

common::metrics::metrics_sanity!();
