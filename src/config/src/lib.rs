// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Configuration for the shrike engine. A [`ShrikeConfig`] is loaded from a
//! TOML file and split into sections; crates consume the sections they need
//! through the `*Config` traits so tests can provide their own roots.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use tracing::error;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ShrikeConfig {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub keyspace: Keyspace,
    #[serde(default)]
    pub snapshot: Snapshot,
    #[serde(default)]
    pub command: Command,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct General {
    /// Number of shard threads. Zero selects the available parallelism.
    #[serde(default)]
    pub shard_count: usize,
    /// Total memory limit in bytes across all shards. Zero disables the
    /// limit.
    #[serde(default)]
    pub max_memory: u64,
    /// Run as a cache: allow evictions when over the memory budget instead
    /// of rejecting writes.
    #[serde(default)]
    pub cache_mode: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Metrics {
    #[serde(default = "interval")]
    pub interval: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            interval: interval(),
        }
    }
}

impl Metrics {
    pub fn interval(&self) -> Duration {
        self.interval.parse::<humantime::Duration>().unwrap().into()
    }
}

fn interval() -> String {
    "1s".into()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Keyspace {
    /// The maximum number of key-value pairs that will be deleted in each
    /// eviction when heartbeat based eviction is triggered under memory
    /// pressure.
    #[serde(default = "max_eviction_per_heartbeat")]
    pub max_eviction_per_heartbeat: u32,
    /// The maximum number of hash table segments to scan in each eviction
    /// when heartbeat based eviction is triggered under memory pressure.
    #[serde(default = "max_segment_to_consider")]
    pub max_segment_to_consider: u32,
    /// Prevents the table from growing if number of free slots x average
    /// object size x this ratio is larger than the memory budget.
    #[serde(default = "table_growth_margin")]
    pub table_growth_margin: f64,
    /// notify-keyspace-events. Only "Ex" is supported for now.
    #[serde(default)]
    pub notify_keyspace_events: String,
    /// Decommit memory after flushing slots.
    #[serde(default)]
    pub cluster_flush_decommit_memory: bool,
    /// If true SADDEX does not update TTL for existing fields.
    #[serde(default)]
    pub legacy_saddex_keepttl: bool,
    /// If true, MGET will deduplicate keys.
    #[serde(default)]
    pub mget_dedup_keys: bool,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self {
            max_eviction_per_heartbeat: max_eviction_per_heartbeat(),
            max_segment_to_consider: max_segment_to_consider(),
            table_growth_margin: table_growth_margin(),
            notify_keyspace_events: String::new(),
            cluster_flush_decommit_memory: false,
            legacy_saddex_keepttl: false,
            mget_dedup_keys: false,
        }
    }
}

fn max_eviction_per_heartbeat() -> u32 {
    100
}

fn max_segment_to_consider() -> u32 {
    4
}

fn table_growth_margin() -> f64 {
    0.4
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Snapshot {
    /// If true replication uses point in time snapshotting.
    #[serde(default = "point_in_time_snapshot")]
    pub point_in_time_snapshot: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            point_in_time_snapshot: point_in_time_snapshot(),
        }
    }
}

fn point_in_time_snapshot() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Command {
    /// Change the name of commands, format is:
    /// `<cmd1_name>=<cmd1_new_name>`.
    #[serde(default)]
    pub rename_command: Vec<String>,
    /// Commands restricted to connections on the admin port.
    #[serde(default)]
    pub restricted_commands: Vec<String>,
    /// Additional commands that will be marked as denyoom.
    #[serde(default)]
    pub oom_deny_commands: Vec<String>,
    /// Add an alias for given command(s), format is: `<alias>=<original>`.
    /// Aliases must be set identically on replicas, if applicable.
    #[serde(default)]
    pub command_alias: Vec<String>,
    /// If true, track latency for commands.
    #[serde(default)]
    pub latency_tracking: bool,
}

impl ShrikeConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config: ShrikeConfig = match toml::from_str(&content) {
            Ok(t) => t,
            Err(e) => {
                error!("{}", e);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Error parsing config",
                ));
            }
        };

        if !config.keyspace.notify_keyspace_events.is_empty()
            && config.keyspace.notify_keyspace_events != "Ex"
        {
            error!("only Ex is currently supported for notify_keyspace_events");
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Error parsing config",
            ));
        }

        Ok(config)
    }

    pub fn shard_count(&self) -> usize {
        if self.general.shard_count != 0 {
            return self.general.shard_count;
        }
        std::thread::available_parallelism()
            .map(|v| v.get())
            .unwrap_or(1)
    }
}

pub trait GeneralConfig {
    fn general(&self) -> &General;
}

pub trait KeyspaceConfig {
    fn keyspace(&self) -> &Keyspace;
}

pub trait SnapshotConfig {
    fn snapshot(&self) -> &Snapshot;
}

impl GeneralConfig for ShrikeConfig {
    fn general(&self) -> &General {
        &self.general
    }
}

impl KeyspaceConfig for ShrikeConfig {
    fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }
}

impl SnapshotConfig for ShrikeConfig {
    fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}
