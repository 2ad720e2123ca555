// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Command registration: names, option masks, arity and key positions,
//! ACL categories, invocation stats and optional latency tracking. The
//! rename, restriction, oom-deny and alias overlays from the
//! configuration are applied as commands are registered.

use crate::context::CommandContext;
use crate::reply::ReplyBuilder;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::error;

pub mod opt {
    pub const WRITE: u32 = 1 << 0;
    pub const READONLY: u32 = 1 << 1;
    pub const DENYOOM: u32 = 1 << 2;
    pub const FAST: u32 = 1 << 3;
    pub const LOADING: u32 = 1 << 4;
    pub const DANGEROUS: u32 = 1 << 5;
    pub const ADMIN: u32 = 1 << 6;
    pub const NOSCRIPT: u32 = 1 << 7;
    pub const BLOCKING: u32 = 1 << 8;
    pub const HIDDEN: u32 = 1 << 9;
    pub const INTERLEAVED_KEYS: u32 = 1 << 10;
    pub const GLOBAL_TRANS: u32 = 1 << 11;
    pub const STORE_LAST_KEY: u32 = 1 << 12;
    pub const VARIADIC_KEYS: u32 = 1 << 13;
    pub const NO_AUTOJOURNAL: u32 = 1 << 14;
    pub const NO_KEY_TRANSACTIONAL: u32 = 1 << 15;
    pub const IDEMPOTENT: u32 = 1 << 16;
    pub const SLOW: u32 = 1 << 17;

    pub fn name(flag: u32) -> &'static str {
        match flag {
            WRITE => "write",
            READONLY => "readonly",
            DENYOOM => "denyoom",
            FAST => "fast",
            LOADING => "loading",
            DANGEROUS => "dangerous",
            ADMIN => "admin",
            NOSCRIPT => "noscript",
            BLOCKING => "blocking",
            HIDDEN => "hidden",
            INTERLEAVED_KEYS => "interleaved-keys",
            GLOBAL_TRANS => "global-trans",
            STORE_LAST_KEY => "store-last-key",
            VARIADIC_KEYS => "variadic-keys",
            NO_AUTOJOURNAL => "custom-journal",
            NO_KEY_TRANSACTIONAL => "no-key-transactional",
            IDEMPOTENT => "idempotent",
            SLOW => "slow",
            _ => "unknown",
        }
    }
}

pub mod acl {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const ADMIN: u32 = 1 << 2;
    pub const DANGEROUS: u32 = 1 << 3;
    pub const FAST: u32 = 1 << 4;
    pub const SLOW: u32 = 1 << 5;
    pub const BLOCKING: u32 = 1 << 6;
    pub const STRING: u32 = 1 << 7;
    pub const THROTTLE: u32 = 1 << 8;
}

fn implicit_categories(mask: u32) -> u32 {
    if mask & opt::ADMIN != 0 {
        mask | opt::NOSCRIPT
    } else {
        mask
    }
}

fn implicit_acl_categories(mask: u32) -> u32 {
    let mask = implicit_categories(mask);
    let mut out = 0;
    if mask & opt::WRITE != 0 {
        out |= acl::WRITE;
    }
    if mask & opt::READONLY != 0 && mask & opt::NOSCRIPT == 0 {
        out |= acl::READ;
    }
    if mask & opt::ADMIN != 0 {
        out |= acl::ADMIN | acl::DANGEROUS;
    }
    if mask & opt::FAST != 0 {
        out |= acl::FAST;
    }
    if mask & opt::BLOCKING != 0 {
        out |= acl::BLOCKING;
    }
    if out & acl::FAST == 0 {
        out |= acl::SLOW;
    }
    out
}

pub const LATENCY_HISTOGRAM_MIN_VALUE: u64 = 1; // usec
pub const LATENCY_HISTOGRAM_MAX_VALUE: u64 = 1_000_000; // usec

/// Latency histogram with two significant digits of resolution over
/// [1, 1_000_000] microseconds.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    counts: BTreeMap<u64, u64>,
    total: u64,
}

impl LatencyHistogram {
    fn quantize(value: u64) -> u64 {
        let v = value.clamp(LATENCY_HISTOGRAM_MIN_VALUE, LATENCY_HISTOGRAM_MAX_VALUE);
        if v < 100 {
            return v;
        }
        let mut scale = 1;
        let mut top = v;
        while top >= 100 {
            top /= 10;
            scale *= 10;
        }
        top * scale
    }

    pub fn record(&mut self, value: u64) {
        *self.counts.entry(Self::quantize(value)).or_default() += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn max(&self) -> u64 {
        self.counts.keys().next_back().copied().unwrap_or(0)
    }

    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let target = ((self.total as f64) * p / 100.0).ceil() as u64;
        let mut seen = 0;
        for (&value, &count) in &self.counts {
            seen += count;
            if seen >= target {
                return value;
            }
        }
        self.max()
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.total = 0;
    }
}

pub type CmdHandler = fn(&[Vec<u8>], &mut CommandContext<'_>);

pub struct CommandId {
    name: String,
    opt_mask: u32,
    arity: i8,
    first_key: i8,
    last_key: i8,
    acl_categories: u32,
    implicit_acl: bool,
    handler: Option<CmdHandler>,
    restricted: bool,
    is_alias: bool,
    family: usize,
    bit_index: u64,
    stats: Mutex<(u64, u64)>, // (calls, total usec)
    latency: Mutex<LatencyHistogram>,
}

impl CommandId {
    pub fn new(
        name: &str,
        mask: u32,
        arity: i8,
        first_key: i8,
        last_key: i8,
        acl_categories: Option<u32>,
    ) -> Self {
        Self {
            name: name.to_string(),
            opt_mask: implicit_categories(mask),
            arity,
            first_key,
            last_key,
            acl_categories: acl_categories.unwrap_or_else(|| implicit_acl_categories(mask)),
            implicit_acl: acl_categories.is_none(),
            handler: None,
            restricted: false,
            is_alias: false,
            family: 0,
            bit_index: 0,
            stats: Mutex::new((0, 0)),
            latency: Mutex::new(LatencyHistogram::default()),
        }
    }

    pub fn handler(mut self, handler: CmdHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opt_mask(&self) -> u32 {
        self.opt_mask
    }

    pub fn arity(&self) -> i8 {
        self.arity
    }

    pub fn first_key(&self) -> i8 {
        self.first_key
    }

    pub fn last_key(&self) -> i8 {
        self.last_key
    }

    pub fn acl_categories(&self) -> u32 {
        self.acl_categories
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn is_read_only(&self) -> bool {
        self.opt_mask & opt::READONLY != 0
    }

    pub fn is_write(&self) -> bool {
        self.opt_mask & opt::WRITE != 0
    }

    pub fn is_transactional(&self) -> bool {
        self.first_key > 0
            || self.opt_mask & opt::GLOBAL_TRANS != 0
            || self.opt_mask & opt::NO_KEY_TRANSACTIONAL != 0
    }

    fn clone_as_alias(&self, name: &str) -> CommandId {
        let mut cloned = CommandId::new(
            name,
            self.opt_mask | opt::HIDDEN,
            self.arity,
            self.first_key,
            self.last_key,
            Some(self.acl_categories),
        );
        cloned.handler = self.handler;
        cloned.implicit_acl = self.implicit_acl;
        cloned.is_alias = true;
        cloned
    }

    /// Validates the argument tail against arity and key-shape rules.
    pub fn validate(&self, tail_args: &[Vec<u8>]) -> Result<(), String> {
        let given = tail_args.len() + 1;
        if (self.arity > 0 && given != self.arity as usize)
            || (self.arity < 0 && given < (-self.arity) as usize)
        {
            return Err(format!("wrong number of arguments for '{}' command", self.name.to_lowercase()));
        }
        if self.opt_mask & opt::INTERLEAVED_KEYS != 0 && tail_args.len() % 2 != 0 {
            return Err(format!("wrong number of arguments for '{}' command", self.name.to_lowercase()));
        }
        Ok(())
    }

    pub fn invoke(&self, args: &[Vec<u8>], cntx: &mut CommandContext<'_>) -> u64 {
        let Some(handler) = self.handler else {
            cntx.rb.send_error("unknown command");
            return 0;
        };
        let start = std::time::Instant::now();
        handler(args, cntx);
        let execution_time_usec = start.elapsed().as_micros() as u64;

        let mut stats = self.stats.lock();
        stats.0 += 1;
        stats.1 += execution_time_usec;
        drop(stats);
        if cntx.latency_tracking {
            self.latency.lock().record(execution_time_usec);
        }
        execution_time_usec
    }

    pub fn call_stats(&self) -> (u64, u64) {
        *self.stats.lock()
    }

    pub fn latency_snapshot(&self) -> (u64, u64) {
        let hist = self.latency.lock();
        (hist.total(), hist.percentile(99.0))
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = (0, 0);
        self.latency.lock().reset();
    }
}

fn parse_arg_map(entries: &[String], what: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for mapping in entries {
        let mut kv = mapping.splitn(2, '=');
        let (Some(k), Some(v)) = (kv.next(), kv.next()) else {
            error!("malformed mapping '{mapping}' for {what}, expected key=value");
            continue;
        };
        let key = k.trim().to_uppercase();
        let value = v.trim().to_uppercase();
        if key == value {
            error!("invalid attempt to map {key} to itself in {what}");
            continue;
        }
        if out.insert(key, value).is_some() {
            error!("duplicate insert to {what} not allowed");
        }
    }
    out
}

#[derive(Default)]
pub struct CommandRegistry {
    cmd_map: HashMap<String, CommandId>,
    cmd_rename_map: HashMap<String, String>,
    restricted_cmds: HashSet<String>,
    oomdeny_cmds: HashSet<String>,
    // original name -> alias
    alias_map: HashMap<String, String>,
    family_of_commands: Vec<Vec<String>>,
    bit_index: u64,
    acl_category: Option<u32>,
}

impl CommandRegistry {
    pub fn new(config: &config::Command) -> Self {
        let alias_to_original = parse_arg_map(&config.command_alias, "command_alias");
        let mut alias_map = HashMap::new();
        for (alias, original) in alias_to_original {
            alias_map.insert(original, alias);
        }
        Self {
            cmd_rename_map: parse_arg_map(&config.rename_command, "rename_command"),
            restricted_cmds: config
                .restricted_commands
                .iter()
                .map(|s| s.to_uppercase())
                .collect(),
            oomdeny_cmds: config
                .oom_deny_commands
                .iter()
                .map(|s| s.to_uppercase())
                .collect(),
            alias_map,
            ..Default::default()
        }
    }

    pub fn start_family(&mut self, acl_category: Option<u32>) {
        self.family_of_commands.push(Vec::new());
        self.bit_index = 0;
        self.acl_category = acl_category;
    }

    pub fn add(&mut self, mut cmd: CommandId) -> &mut Self {
        let mut key = cmd.name.clone();
        if let Some(renamed) = self.cmd_rename_map.get(&key) {
            if renamed.is_empty() {
                // an empty rename removes the command
                return self;
            }
            key = renamed.clone();
        }

        if self.restricted_cmds.contains(&key) {
            cmd.restricted = true;
        }
        if self.oomdeny_cmds.contains(&key) {
            cmd.opt_mask |= opt::DENYOOM;
        }

        cmd.family = self.family_of_commands.len().saturating_sub(1);
        if let Some(category) = self.acl_category {
            cmd.acl_categories |= category;
        }
        cmd.bit_index = 1u64 << self.bit_index;
        self.bit_index += 1;
        if let Some(family) = self.family_of_commands.last_mut() {
            family.push(key.clone());
        }

        if let Some(alias) = self.alias_map.get(&cmd.name).cloned() {
            let alias_cmd = cmd.clone_as_alias(&alias);
            if self.cmd_map.insert(alias.clone(), alias_cmd).is_some() {
                error!("duplicate command alias {alias}");
            }
        }

        if self.cmd_map.insert(key.clone(), cmd).is_some() {
            error!("duplicate command {key}");
        }
        self
    }

    pub fn find(&self, name: &str) -> Option<&CommandId> {
        self.cmd_map.get(&name.to_uppercase())
    }

    pub fn renamed_or_original<'a>(&'a self, orig: &'a str) -> &'a str {
        self.cmd_rename_map
            .get(orig)
            .map(|s| s.as_str())
            .unwrap_or(orig)
    }

    pub fn len(&self) -> usize {
        self.cmd_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmd_map.is_empty()
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.cmd_map.keys().map(|s| s.as_str()).collect()
    }
}
