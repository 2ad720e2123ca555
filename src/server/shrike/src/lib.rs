// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Shrike is a sharded, Redis-compatible in-memory key-value engine. The
//! keyspace is partitioned across worker threads that each own their
//! slice exclusively; this crate provides the command surface over that
//! core: the registry, the string family, the reply boundary and the
//! shard pool.

pub mod context;
pub mod registry;
pub mod reply;
pub mod shardset;
pub mod string_family;

use config::ShrikeConfig;
use context::{CommandContext, ConnectionState};
use metriken::*;
use registry::CommandRegistry;
use reply::ReplyBuilder;
use shardset::ShardSet;
use tracing::trace;

#[metric(name = "command_total", description = "total number of commands executed")]
pub static COMMAND_TOTAL: Counter = Counter::new();

#[metric(name = "command_error", description = "number of commands that failed to dispatch")]
pub static COMMAND_ERROR: Counter = Counter::new();

/// This structure represents a running engine instance.
pub struct Engine {
    shard_set: ShardSet,
    registry: CommandRegistry,
    latency_tracking: bool,
    mget_dedup_keys: bool,
}

impl Engine {
    /// Creates a new [Engine] from the given [ShrikeConfig].
    pub fn new(config: ShrikeConfig) -> Self {
        common::metrics::init();
        pubsub::init();

        let shard_set = ShardSet::new(&config);

        let mut registry = CommandRegistry::new(&config.command);
        string_family::register(&mut registry);

        Self {
            shard_set,
            registry,
            latency_tracking: config.command.latency_tracking,
            mget_dedup_keys: config.keyspace.mget_dedup_keys,
        }
    }

    pub fn shard_set(&self) -> &ShardSet {
        &self.shard_set
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Dispatches one parsed command: resolves it in the registry,
    /// validates the argument shape and invokes the handler on the
    /// owning shard(s).
    pub fn execute(
        &self,
        conn: &mut ConnectionState,
        rb: &mut dyn ReplyBuilder,
        args: &[Vec<u8>],
    ) {
        COMMAND_TOTAL.increment();
        let Some(name) = args.first() else {
            COMMAND_ERROR.increment();
            rb.send_error("empty command");
            return;
        };
        let name = String::from_utf8_lossy(name).to_uppercase();

        let Some(cid) = self.registry.find(&name) else {
            COMMAND_ERROR.increment();
            rb.send_error(&format!("unknown command `{}`", name.to_lowercase()));
            return;
        };
        // restricted commands are invisible outside the admin port
        if cid.is_restricted() && !conn.is_admin {
            COMMAND_ERROR.increment();
            rb.send_error(&format!("unknown command `{}`", name.to_lowercase()));
            return;
        }

        let tail = &args[1..];
        if let Err(msg) = cid.validate(tail) {
            COMMAND_ERROR.increment();
            rb.send_error(&msg);
            return;
        }

        trace!("dispatching {name}");
        let mut cntx = CommandContext {
            shard_set: &self.shard_set,
            rb,
            conn,
            db_index: 0,
            time_now_ms: keyspace::current_time_ms(),
            cid_mask: cid.opt_mask(),
            latency_tracking: self.latency_tracking,
            mget_dedup_keys: self.mget_dedup_keys,
        };
        cid.invoke(tail, &mut cntx);
    }

    /// Triggers a shutdown and blocks until every shard thread has
    /// terminated.
    pub fn shutdown(self) {
        self.shard_set.shutdown();
    }
}

common::metrics::metrics_sanity!();
