// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-invocation context threaded through command handlers: the shard
//! pool, the reply builder and the connection's protocol state.

use crate::reply::ReplyBuilder;
use crate::shardset::ShardSet;
use keyspace::DbIndex;

/// Memcache connections ask for CAS versions with this flag bit.
pub const FETCH_CAS_VER: u32 = 1 << 0;

#[derive(Debug, Default)]
pub struct ConnectionState {
    pub memcache_flag: u32,
    pub is_admin: bool,
}

pub struct CommandContext<'a> {
    pub shard_set: &'a ShardSet,
    pub rb: &'a mut dyn ReplyBuilder,
    pub conn: &'a mut ConnectionState,
    pub db_index: DbIndex,
    pub time_now_ms: u64,
    /// Option mask of the command being invoked.
    pub cid_mask: u32,
    pub latency_tracking: bool,
    pub mget_dedup_keys: bool,
}
