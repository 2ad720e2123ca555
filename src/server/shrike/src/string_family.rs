// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The string command family. These commands are the primary consumers of
//! the keyspace core and exercise its contracts: conditional sets against
//! the find paths, expiry interplay, memcache flags and CAS versions, the
//! rate limiter's expire handling, and multi-key scheduling across
//! shards.

use crate::context::{CommandContext, FETCH_CAS_VER};
use crate::registry::{acl, opt, CommandId, CommandRegistry};
use crate::reply::{Protocol, ReplyBuilder};
use crate::shardset::EngineShard;
use common::{OpResult, OpStatus};
use keyspace::expire::{ExpireParams, TimeUnit};
use keyspace::slice::ItAndUpdater;
use keyspace::value::{ObjType, PrimeValue};
use keyspace::{DbContext, ShardId};
use std::collections::HashMap;
use tracing::trace;

const MAX_STR_LEN: usize = 1 << 28;

pub const SET_IF_NOTEXIST: u16 = 1 << 0;
pub const SET_IF_EXISTS: u16 = 1 << 1;
pub const SET_KEEP_EXPIRE: u16 = 1 << 2;
pub const SET_GET: u16 = 1 << 3;
pub const SET_EXPIRE_AFTER_MS: u16 = 1 << 4;
pub const SET_STICK: u16 = 1 << 5;

const SYNTAX_ERR: &str = "syntax error";

#[derive(Debug, Clone, Copy, Default)]
pub struct SetParams {
    pub flags: u16,
    pub memcache_flags: u32,
    /// Relative to now; zero means no expiration.
    pub expire_after_ms: u64,
}

impl SetParams {
    fn is_conditional_set(&self) -> bool {
        self.flags & (SET_IF_NOTEXIST | SET_IF_EXISTS) != 0
    }
}

fn invalid_expire_time(cmd: &str) -> String {
    format!("invalid expire time in '{cmd}' command")
}

fn parse_i64(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_u64(arg: &[u8]) -> Option<u64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_f64(arg: &[u8]) -> Option<f64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn upper(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_uppercase()
}

/// Helper for performing SET operations with various options.
struct SetCmd<'a> {
    shard: &'a mut EngineShard,
    db_cntx: DbContext,
    manual_journal: bool,
    want_prev: bool,
    prev: Option<Vec<u8>>,
}

impl<'a> SetCmd<'a> {
    fn new(shard: &'a mut EngineShard, db_cntx: DbContext, manual_journal: bool, want_prev: bool) -> Self {
        Self {
            shard,
            db_cntx,
            manual_journal,
            want_prev,
            prev: None,
        }
    }

    fn set(&mut self, params: &SetParams, key: &[u8], value: &[u8]) -> OpResult<()> {
        trace!("set {:?} on shard {}", String::from_utf8_lossy(key), self.shard.shard_id());

        if params.is_conditional_set() {
            let find_res = self.shard.slice.find_mutable(&self.db_cntx, key);
            match find_res {
                Some(mut found) => {
                    if let Err(status) = self.cache_prev_if_needed(found.it) {
                        found.post_updater.run(&mut self.shard.slice);
                        return Err(status);
                    }
                    if params.flags & SET_IF_EXISTS != 0 {
                        return self.set_existing(params, value, &mut found);
                    }
                    found.post_updater.run(&mut self.shard.slice);
                    return Err(OpStatus::Skipped);
                }
                None => {
                    if params.flags & SET_IF_EXISTS != 0 {
                        return Err(OpStatus::Skipped);
                    }
                    // NX with a missing key falls through to the add path
                }
            }
        }

        // SET can change the key type to string, so no type requirement
        let mut res = self.shard.slice.add_or_find(&self.db_cntx, key, None)?;
        if !res.is_new {
            if let Err(status) = self.cache_prev_if_needed(res.it) {
                res.post_updater.run(&mut self.shard.slice);
                return Err(status);
            }
            self.set_existing(params, value, &mut res)
        } else {
            self.add_new(params, &mut res, key, value);
            Ok(())
        }
    }

    fn set_existing(
        &mut self,
        params: &SetParams,
        value: &[u8],
        it_upd: &mut ItAndUpdater,
    ) -> OpResult<()> {
        debug_assert_eq!(params.flags & SET_IF_NOTEXIST, 0);
        let db = self.db_cntx.db_index;
        let it = it_upd.it;
        let key = self.key_of(it);

        let at_ms = if params.expire_after_ms != 0 {
            params.expire_after_ms + self.db_cntx.time_now_ms
        } else {
            0
        };

        if params.flags & SET_KEEP_EXPIRE == 0 {
            if at_ms != 0 {
                if let Some(exp_it) = it_upd.exp_it {
                    self.shard.slice.set_expire_time(db, exp_it, at_ms);
                } else {
                    self.shard.slice.add_expire(db, it, at_ms);
                }
            } else {
                self.shard.slice.remove_expire(db, it);
            }
        }

        if params.flags & SET_STICK != 0 {
            self.shard.slice.set_sticky(db, it, true);
        }

        let had_expire = self.shard.slice.pv(db, it).has_expire();

        it_upd.post_updater.reduce_heap_usage(&mut self.shard.slice);

        // update flags
        self.shard
            .slice
            .pv_mut(db, it)
            .set_flag(params.memcache_flags != 0);
        self.shard
            .slice
            .set_mc_flag(db, &key, params.memcache_flags);

        // an external value is superseded by the overwrite
        if self.shard.slice.pv(db, it).is_external() {
            self.shard.slice.drop_external(db, it);
        }

        self.shard.slice.pv_mut(db, it).set_string(value);
        debug_assert_eq!(had_expire, self.shard.slice.pv(db, it).has_expire());

        self.post_edit(params, &key, value, it);
        it_upd.post_updater.run(&mut self.shard.slice);
        Ok(())
    }

    fn add_new(&mut self, params: &SetParams, it_upd: &mut ItAndUpdater, key: &[u8], value: &[u8]) {
        let db = self.db_cntx.db_index;
        let it = it_upd.it;
        let slice = &mut self.shard.slice;

        slice.pv_mut(db, it).set_string(value);
        slice.pv_mut(db, it).set_flag(params.memcache_flags != 0);

        if params.expire_after_ms != 0 {
            slice.add_expire(db, it, params.expire_after_ms + self.db_cntx.time_now_ms);
        }

        if params.memcache_flags != 0 {
            slice.set_mc_flag(db, key, params.memcache_flags);
        }

        if params.flags & SET_STICK != 0 {
            slice.set_sticky(db, it, true);
        }

        self.post_edit(params, key, value, it);
        it_upd.post_updater.run(&mut self.shard.slice);
    }

    // called at the end of add_new and set_existing
    fn post_edit(&mut self, params: &SetParams, key: &[u8], value: &[u8], it: keyspace::Cursor) {
        // always offer the value for offload; the store may decline under
        // I/O pressure
        self.shard.slice.try_stash(self.db_cntx.db_index, it);

        if self.manual_journal && self.shard.slice.journal_mut().is_some() {
            self.record_journal(params, key, value);
        }
    }

    fn record_journal(&mut self, params: &SetParams, key: &[u8], value: &[u8]) {
        let mut cmds: Vec<Vec<u8>> = vec![b"SET".to_vec(), key.to_vec(), value.to_vec()];
        if params.flags & SET_EXPIRE_AFTER_MS != 0 {
            cmds.push(b"PXAT".to_vec());
            cmds.push(
                (params.expire_after_ms + self.db_cntx.time_now_ms)
                    .to_string()
                    .into_bytes(),
            );
        } else if params.flags & SET_KEEP_EXPIRE != 0 {
            cmds.push(b"KEEPTTL".to_vec());
        }
        if params.flags & SET_STICK != 0 {
            cmds.push(b"STICK".to_vec());
        }
        if params.memcache_flags != 0 {
            cmds.push(b"_MCFLAGS".to_vec());
            cmds.push(params.memcache_flags.to_string().into_bytes());
        }
        // NX/XX are skipped because the SET was executed; GET does not
        // matter on a replica
        let refs: Vec<&[u8]> = cmds.iter().map(|c| c.as_slice()).collect();
        let db = self.db_cntx.db_index;
        self.shard
            .slice
            .journal_mut()
            .expect("checked by caller")
            .record_command(db, &refs);
    }

    fn cache_prev_if_needed(&mut self, it: keyspace::Cursor) -> OpResult<()> {
        if !self.want_prev {
            return Ok(());
        }
        let db = self.db_cntx.db_index;
        if self.shard.slice.pv(db, it).obj_type() != ObjType::String {
            return Err(OpStatus::WrongType);
        }
        match self.shard.slice.read_value_bytes(db, it) {
            Ok(bytes) => {
                self.prev = Some(bytes);
            }
            Err(err) => {
                tracing::error!("failed to read previous value: {err}");
                return Err(OpStatus::InvalidValue);
            }
        }
        Ok(())
    }

    fn key_of(&self, it: keyspace::Cursor) -> Vec<u8> {
        self.shard.slice.key_bytes(self.db_cntx.db_index, it).to_vec()
    }

    fn into_prev(self) -> Option<Vec<u8>> {
        self.prev
    }
}

// ---- shard-local operations ---------------------------------------------

fn op_set(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    params: SetParams,
    key: &[u8],
    value: &[u8],
    manual_journal: bool,
    want_prev: bool,
) -> (OpResult<()>, Option<Vec<u8>>) {
    let mut cmd = SetCmd::new(shard, db_cntx, manual_journal, want_prev);
    let status = cmd.set(&params, key, value);
    (status, cmd.into_prev())
}

fn op_get(shard: &mut EngineShard, db_cntx: DbContext, key: &[u8]) -> OpResult<Vec<u8>> {
    let it = shard
        .slice
        .find_read_only_typed(&db_cntx, key, ObjType::String)?;
    shard
        .slice
        .read_value_bytes(db_cntx.db_index, it)
        .map_err(|err| {
            tracing::error!("tiered read failed: {err}");
            OpStatus::InvalidValue
        })
}

fn op_getdel(shard: &mut EngineShard, db_cntx: DbContext, key: &[u8]) -> OpResult<Vec<u8>> {
    let mut res = shard
        .slice
        .find_mutable_typed(&db_cntx, key, ObjType::String)?;
    let value = shard
        .slice
        .read_value_bytes(db_cntx.db_index, res.it)
        .map_err(|_| OpStatus::InvalidValue);
    // run manually before the delete
    res.post_updater.run(&mut shard.slice);
    shard.slice.del(&db_cntx, res.it);
    value
}

fn op_strlen(shard: &mut EngineShard, db_cntx: DbContext, key: &[u8]) -> OpResult<usize> {
    match shard
        .slice
        .find_read_only_typed(&db_cntx, key, ObjType::String)
    {
        Ok(it) => Ok(shard.slice.pv(db_cntx.db_index, it).size()),
        Err(OpStatus::KeyNotFound) => Ok(0),
        Err(status) => Err(status),
    }
}

fn getrange_slice(slice: &[u8], mut start: i32, mut end: i32) -> &[u8] {
    let strlen = slice.len() as i32;
    if strlen == 0 {
        return b"";
    }
    if start < 0 {
        if end < start {
            return b"";
        }
        start = (strlen + start).max(0);
    }
    if end < 0 {
        end = (strlen + end).max(0);
    } else {
        end = end.min(strlen - 1);
    }
    if start > end {
        return b"";
    }
    &slice[start as usize..=end as usize]
}

fn op_getrange(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    start: i32,
    end: i32,
) -> OpResult<Vec<u8>> {
    match shard
        .slice
        .find_read_only_typed(&db_cntx, key, ObjType::String)
    {
        Ok(it) => {
            let bytes = shard
                .slice
                .read_value_bytes(db_cntx.db_index, it)
                .map_err(|_| OpStatus::InvalidValue)?;
            Ok(getrange_slice(&bytes, start, end).to_vec())
        }
        Err(OpStatus::KeyNotFound) => Ok(Vec::new()),
        Err(status) => Err(status),
    }
}

fn op_setrange(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    start: usize,
    range: &[u8],
) -> OpResult<usize> {
    if range.is_empty() {
        return op_strlen(shard, db_cntx, key);
    }

    let mut res = shard
        .slice
        .add_or_find(&db_cntx, key, Some(ObjType::String))?;
    let db = db_cntx.db_index;

    let mut value = if res.is_new {
        Vec::new()
    } else {
        match shard.slice.read_value_bytes(db, res.it) {
            Ok(bytes) => bytes,
            Err(_) => {
                res.post_updater.run(&mut shard.slice);
                return Err(OpStatus::InvalidValue);
            }
        }
    };
    if value.len() < start + range.len() {
        value.resize(start + range.len(), 0);
    }
    value[start..start + range.len()].copy_from_slice(range);
    let len = value.len();

    if shard.slice.pv(db, res.it).is_external() {
        shard.slice.drop_external(db, res.it);
    }
    shard.slice.pv_mut(db, res.it).set_string(&value);
    res.post_updater.run(&mut shard.slice);
    Ok(len)
}

// extend key with value, either prepend or append; returns the stored
// size after modification
fn op_extend(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    value: &[u8],
    prepend: bool,
) -> OpResult<usize> {
    let mut res = shard
        .slice
        .add_or_find(&db_cntx, key, Some(ObjType::String))?;
    let db = db_cntx.db_index;

    if res.is_new {
        shard.slice.pv_mut(db, res.it).set_string(value);
        let len = shard.slice.pv(db, res.it).size();
        res.post_updater.run(&mut shard.slice);
        return Ok(len);
    }

    let existing = match shard.slice.read_value_bytes(db, res.it) {
        Ok(bytes) => bytes,
        Err(_) => {
            res.post_updater.run(&mut shard.slice);
            return Err(OpStatus::InvalidValue);
        }
    };
    let new_val = if prepend {
        [value, &existing].concat()
    } else {
        [&existing, value].concat()
    };

    if shard.slice.pv(db, res.it).is_external() {
        shard.slice.drop_external(db, res.it);
    }
    shard.slice.pv_mut(db, res.it).set_string(&new_val);
    res.post_updater.run(&mut shard.slice);
    Ok(new_val.len())
}

// memcached extend: skips when the key is missing
fn op_extend_or_skip(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    value: &[u8],
    prepend: bool,
) -> OpResult<bool> {
    if shard
        .slice
        .find_read_only_typed(&db_cntx, key, ObjType::String)
        .is_err()
    {
        return Ok(false);
    }
    op_extend(shard, db_cntx, key, value, prepend).map(|_| true)
}

// if skip_on_missing, returns KeyNotFound instead of creating the key
fn op_incrby(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    incr: i64,
    skip_on_missing: bool,
) -> OpResult<i64> {
    let db = db_cntx.db_index;
    // avoid add_or_find because of the skip_on_missing memcache option
    let Some(mut res) = shard.slice.find_mutable(&db_cntx, key) else {
        if skip_on_missing {
            return Err(OpStatus::KeyNotFound);
        }
        let mut result = shard
            .slice
            .add_new(&db_cntx, key, PrimeValue::from_int(incr), 0)?;
        result.post_updater.run(&mut shard.slice);
        return Ok(incr);
    };

    if shard.slice.pv(db, res.it).obj_type() != ObjType::String {
        res.post_updater.run(&mut shard.slice);
        return Err(OpStatus::WrongType);
    }

    let Some(prev) = shard.slice.pv(db, res.it).try_get_int() else {
        res.post_updater.run(&mut shard.slice);
        return Err(OpStatus::InvalidValue);
    };

    if (incr < 0 && prev < 0 && incr < i64::MIN - prev)
        || (incr > 0 && prev > 0 && incr > i64::MAX - prev)
    {
        res.post_updater.run(&mut shard.slice);
        return Err(OpStatus::OutOfRange);
    }

    let new_val = prev + incr;
    debug_assert!(!shard.slice.pv(db, res.it).is_external());
    shard.slice.pv_mut(db, res.it).set_int(new_val);
    res.post_updater.run(&mut shard.slice);
    Ok(new_val)
}

fn op_incrfloat(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    val: f64,
) -> OpResult<f64> {
    let db = db_cntx.db_index;
    let mut res = shard
        .slice
        .add_or_find(&db_cntx, key, Some(ObjType::String))?;

    if res.is_new {
        let formatted = format_double(val);
        shard.slice.pv_mut(db, res.it).set_string(formatted.as_bytes());
        res.post_updater.run(&mut shard.slice);
        return Ok(val);
    }

    if shard.slice.pv(db, res.it).size() == 0 {
        res.post_updater.run(&mut shard.slice);
        return Err(OpStatus::InvalidFloat);
    }

    let bytes = shard.slice.pv(db, res.it).to_string_bytes();
    let Some(base) = parse_f64(&bytes) else {
        res.post_updater.run(&mut shard.slice);
        return Err(OpStatus::InvalidFloat);
    };

    let sum = base + val;
    if sum.is_nan() || sum.is_infinite() {
        res.post_updater.run(&mut shard.slice);
        return Err(OpStatus::InvalidFloat);
    }

    let formatted = format_double(sum);
    shard.slice.pv_mut(db, res.it).set_string(formatted.as_bytes());
    res.post_updater.run(&mut shard.slice);
    Ok(sum)
}

fn format_double(v: f64) -> String {
    // shortest representation that round-trips, trailing zeros trimmed
    let mut s = format!("{v:.17}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    // prefer the plain formatting when it round-trips
    let plain = format!("{v}");
    if plain.parse::<f64>() == Ok(v) {
        return plain;
    }
    s
}

fn op_mset(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    pairs: &[(Vec<u8>, Vec<u8>)],
) -> OpResult<()> {
    debug_assert!(!pairs.is_empty());

    let params = SetParams::default();
    let mut result = Ok(());
    let mut stored = 0usize;
    for (key, value) in pairs {
        let (status, _) = op_set(shard, db_cntx, params, key, value, false, false);
        if let Err(status) = status {
            result = Err(status);
            break;
        }
        stored += 1;
    }

    // the loop may succeed partially (for example on OOM), so replicate
    // only what actually changed
    if shard.slice.journal_mut().is_some() && stored > 0 {
        let mut args: Vec<&[u8]> = vec![b"MSET"];
        for (key, value) in &pairs[..stored] {
            args.push(key);
            args.push(value);
        }
        let db = db_cntx.db_index;
        shard
            .slice
            .journal_mut()
            .expect("checked above")
            .record_command(db, &args);
    }
    result
}

// emission_interval_ms and limit are assumed positive
#[allow(clippy::too_many_arguments)]
fn op_throttle(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    key: &[u8],
    limit: i64,
    emission_interval_ms: i64,
    quantity: u64,
) -> OpResult<[i64; 5]> {
    if emission_interval_ms > i64::MAX / limit {
        return Err(OpStatus::InvalidInt);
    }
    let delay_variation_tolerance_ms = emission_interval_ms * limit; // should be positive

    let mut remaining = 0;
    let mut reset_after_ms = -1000;
    let mut retry_after_ms = -1000;

    if quantity != 0 && emission_interval_ms as u64 > i64::MAX as u64 / quantity {
        return Err(OpStatus::InvalidInt);
    }
    let increment_ms = emission_interval_ms * quantity as i64; // nonnegative

    let res = shard.slice.find_mutable(&db_cntx, key);
    let now_ms = db_cntx.time_now_ms as i64;
    let db = db_cntx.db_index;

    let finish = |shard: &mut EngineShard, res: Option<ItAndUpdater>| {
        if let Some(mut found) = res {
            found.post_updater.run(&mut shard.slice);
        }
    };

    let mut tat_ms = now_ms;
    if let Some(it) = res.as_ref().map(|found| found.it) {
        if shard.slice.pv(db, it).obj_type() != ObjType::String {
            finish(shard, res);
            return Err(OpStatus::WrongType);
        }
        match shard.slice.pv(db, it).try_get_int() {
            Some(prev) => tat_ms = prev,
            None => {
                finish(shard, res);
                return Err(OpStatus::InvalidValue);
            }
        }
    }

    let mut new_tat_ms = tat_ms.max(now_ms);
    if new_tat_ms > i64::MAX - increment_ms {
        finish(shard, res);
        return Err(OpStatus::InvalidInt);
    }
    new_tat_ms += increment_ms;

    if new_tat_ms < i64::MIN + delay_variation_tolerance_ms {
        finish(shard, res);
        return Err(OpStatus::InvalidInt);
    }
    let allow_at_ms = new_tat_ms - delay_variation_tolerance_ms;

    let diff_ms = match now_ms.checked_sub(allow_at_ms) {
        Some(diff) => diff,
        None => {
            finish(shard, res);
            return Err(OpStatus::InvalidInt);
        }
    };

    let limited = diff_ms < 0;
    let ttl_ms;
    if limited {
        if increment_ms <= delay_variation_tolerance_ms {
            if diff_ms == i64::MIN {
                finish(shard, res);
                return Err(OpStatus::InvalidInt);
            }
            retry_after_ms = -diff_ms;
        }
        ttl_ms = match tat_ms.checked_sub(now_ms) {
            Some(v) => v,
            None => {
                finish(shard, res);
                return Err(OpStatus::InvalidInt);
            }
        };
    } else {
        ttl_ms = match new_tat_ms.checked_sub(now_ms) {
            Some(v) => v,
            None => {
                finish(shard, res);
                return Err(OpStatus::InvalidInt);
            }
        };
    }

    if ttl_ms < delay_variation_tolerance_ms - i64::MAX {
        finish(shard, res);
        return Err(OpStatus::InvalidInt);
    }
    let next_ms = delay_variation_tolerance_ms - ttl_ms;
    if next_ms > -emission_interval_ms {
        remaining = next_ms / emission_interval_ms;
    }
    reset_after_ms = ttl_ms;

    if !limited {
        match res {
            Some(mut found) => {
                if let Some(exp_it) = found.exp_it {
                    shard.slice.set_expire_time(db, exp_it, new_tat_ms as u64);
                } else {
                    shard.slice.add_expire(db, found.it, new_tat_ms as u64);
                }
                shard.slice.pv_mut(db, found.it).set_int(new_tat_ms);
                found.post_updater.run(&mut shard.slice);
            }
            None => {
                let mut added = shard.slice.add_new(
                    &db_cntx,
                    key,
                    PrimeValue::from_int(new_tat_ms),
                    new_tat_ms as u64,
                )?;
                added.post_updater.run(&mut shard.slice);
            }
        }
    } else {
        finish(shard, res);
    }

    Ok([
        if limited { 1 } else { 0 },
        limit,
        remaining,
        retry_after_ms,
        reset_after_ms,
    ])
}

#[derive(Debug, Clone, Default)]
struct GetResp {
    key: Vec<u8>,
    value: Vec<u8>,
    mc_flag: u32,
    mc_ver: u64,
}

const FETCH_MCFLAG: u8 = 0x1;
const FETCH_MCVER: u8 = 0x2;

fn op_mget(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    keys: &[Vec<u8>],
    fetch_mask: u8,
) -> Vec<Option<GetResp>> {
    let db = db_cntx.db_index;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let resp = shard
            .slice
            .find_read_only_typed(&db_cntx, key, ObjType::String)
            .ok()
            .and_then(|it| {
                let value = shard.slice.read_value_bytes(db, it).ok()?;
                let mut resp = GetResp {
                    key: key.clone(),
                    value,
                    ..Default::default()
                };
                if fetch_mask & FETCH_MCFLAG != 0 {
                    if shard.slice.pv(db, it).has_flag() {
                        resp.mc_flag = shard.slice.get_mc_flag(db, key);
                    }
                    if fetch_mask & FETCH_MCVER != 0 {
                        resp.mc_ver = shard.slice.table(db).prime.version(it.bucket_cursor());
                    }
                }
                Some(resp)
            });
        out.push(resp);
    }
    out
}

// memcache get-and-touch: bulk set-expiry and fetch in one pass
fn op_gat(
    shard: &mut EngineShard,
    db_cntx: DbContext,
    keys: &[Vec<u8>],
    fetch_mask: u8,
    expire_params: ExpireParams,
) -> Vec<Option<GetResp>> {
    let db = db_cntx.db_index;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let resp = (|| {
            let mut found = shard
                .slice
                .find_mutable_typed(&db_cntx, key, ObjType::String)
                .ok()?;
            found.post_updater.run(&mut shard.slice);

            let update = shard
                .slice
                .update_expire(&db_cntx, found.it, found.exp_it, &expire_params)
                .ok()?;
            let expired = update == -1;

            if shard.slice.journal_mut().is_some() {
                if expired {
                    let args: Vec<&[u8]> = vec![b"DEL", key];
                    shard.slice.journal_mut().unwrap().record_command(db, &args);
                } else {
                    let at = update.to_string().into_bytes();
                    let args: Vec<&[u8]> = vec![b"PEXPIREAT", key, &at];
                    shard.slice.journal_mut().unwrap().record_command(db, &args);
                }
            }
            if expired {
                return None;
            }

            let value = shard.slice.read_value_bytes(db, found.it).ok()?;
            let mut resp = GetResp {
                key: key.clone(),
                value,
                ..Default::default()
            };
            if fetch_mask & FETCH_MCFLAG != 0 {
                if shard.slice.pv(db, found.it).has_flag() {
                    resp.mc_flag = shard.slice.get_mc_flag(db, key);
                }
                if fetch_mask & FETCH_MCVER != 0 {
                    resp.mc_ver = shard.slice.table(db).prime.version(found.it.bucket_cursor());
                }
            }
            Some(resp)
        })();
        out.push(resp);
    }
    out
}

// ---- command plumbing ---------------------------------------------------

fn db_cntx(cntx: &CommandContext<'_>) -> DbContext {
    DbContext::new(cntx.db_index, cntx.time_now_ms)
}

fn group_by_shard<'k>(
    cntx: &CommandContext<'_>,
    keys: impl Iterator<Item = &'k [u8]>,
) -> HashMap<ShardId, Vec<(usize, Vec<u8>)>> {
    let mut groups: HashMap<ShardId, Vec<(usize, Vec<u8>)>> = HashMap::new();
    for (idx, key) in keys.enumerate() {
        let sid = cntx.shard_set.shard_for_key(key);
        groups.entry(sid).or_default().push((idx, key.to_vec()));
    }
    groups
}

fn send_string_result(rb: &mut dyn ReplyBuilder, res: OpResult<Vec<u8>>) {
    match res {
        Ok(value) => rb.send_bulk_string(&value),
        Err(OpStatus::WrongType) => rb.send_error_status(OpStatus::WrongType),
        Err(_) => rb.send_null(),
    }
}

fn send_long_result(rb: &mut dyn ReplyBuilder, res: OpResult<usize>) {
    match res {
        Ok(v) => rb.send_long(v as i64),
        Err(OpStatus::WrongType) => rb.send_error_status(OpStatus::WrongType),
        Err(status) => rb.send_error_status(status),
    }
}

fn set_generic(
    cntx: &mut CommandContext<'_>,
    params: SetParams,
    key: &[u8],
    value: &[u8],
) -> (OpResult<()>, Option<Vec<u8>>) {
    let manual_journal = cntx.cid_mask & opt::NO_AUTOJOURNAL != 0;
    let want_prev = params.flags & SET_GET != 0;
    let sid = cntx.shard_set.shard_for_key(key);
    let db = db_cntx(cntx);
    let key = key.to_vec();
    let value = value.to_vec();
    cntx.shard_set.await_brief(sid, move |shard| {
        op_set(shard, db, params, &key, &value, manual_journal, want_prev)
    })
}

// ---- command handlers ---------------------------------------------------

pub fn set(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let key = &args[0];
    let value = &args[1];

    let mut sparams = SetParams {
        memcache_flags: cntx.conn.memcache_flag,
        ..Default::default()
    };

    let mut i = 2;
    while i < args.len() {
        let option = upper(&args[i]);
        match option.as_str() {
            "EX" | "PX" | "EXAT" | "PXAT" => {
                let Some(int_arg) = args.get(i + 1).and_then(|a| parse_i64(a)) else {
                    return cntx.rb.send_error_status(OpStatus::InvalidInt);
                };
                i += 1;

                // expiry can be set only once
                if sparams.flags & SET_EXPIRE_AFTER_MS != 0 {
                    return cntx.rb.send_error(SYNTAX_ERR);
                }
                sparams.flags |= SET_EXPIRE_AFTER_MS;

                // PXAT/EXAT can shift this, so check ahead
                if int_arg <= 0 {
                    return cntx.rb.send_error(&invalid_expire_time("set"));
                }

                let expiry = ExpireParams {
                    value: int_arg,
                    unit: if option == "PX" || option == "PXAT" {
                        TimeUnit::Msec
                    } else {
                        TimeUnit::Sec
                    },
                    absolute: option == "EXAT" || option == "PXAT",
                    ..Default::default()
                };

                let (rel_ms, abs_ms) = expiry.calculate(cntx.time_now_ms, false);
                if abs_ms < 0 {
                    return cntx.rb.send_error(&invalid_expire_time("set"));
                }

                // an already-expired absolute deadline deletes the key
                if rel_ms < 0 {
                    let sid = cntx.shard_set.shard_for_key(key);
                    let db = db_cntx(cntx);
                    let key = key.clone();
                    cntx.shard_set.await_brief(sid, move |shard| {
                        if let Some(it) = shard.slice.find_read_only(&db, &key) {
                            shard.slice.del(&db, it);
                        }
                    });
                    return cntx.rb.send_stored();
                }

                sparams.expire_after_ms = expiry.calculate(cntx.time_now_ms, true).0 as u64;
            }
            "_MCFLAGS" => {
                let Some(flags) = args.get(i + 1).and_then(|a| parse_u64(a)) else {
                    return cntx.rb.send_error_status(OpStatus::InvalidInt);
                };
                sparams.memcache_flags = flags as u32;
                i += 1;
            }
            "GET" => sparams.flags |= SET_GET,
            "STICK" => sparams.flags |= SET_STICK,
            "KEEPTTL" => sparams.flags |= SET_KEEP_EXPIRE,
            "XX" => sparams.flags |= SET_IF_EXISTS,
            "NX" => sparams.flags |= SET_IF_NOTEXIST,
            _ => return cntx.rb.send_error(SYNTAX_ERR),
        }
        i += 1;
    }

    let has_mask = |m: u16| sparams.flags & m == m;
    if has_mask(SET_IF_EXISTS | SET_IF_NOTEXIST)
        || has_mask(SET_KEEP_EXPIRE | SET_EXPIRE_AFTER_MS)
    {
        return cntx.rb.send_error(SYNTAX_ERR);
    }

    let (result, prev) = set_generic(cntx, sparams, key, value);

    if result == Err(OpStatus::WrongType) {
        return cntx.rb.send_error_status(OpStatus::WrongType);
    }

    if sparams.flags & SET_GET != 0 {
        return match prev {
            Some(bytes) => cntx.rb.send_bulk_string(&bytes),
            None => cntx.rb.send_null(),
        };
    }

    match result {
        Ok(()) => cntx.rb.send_stored(),
        Err(OpStatus::OutOfMemory) => cntx.rb.send_error_status(OpStatus::OutOfMemory),
        Err(OpStatus::Skipped) => cntx.rb.send_set_skipped(),
        Err(status) => cntx.rb.send_error_status(status),
    }
}

fn set_ex_generic(seconds: bool, cmd_name: &str, args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let key = &args[0];
    let value = &args[2];

    let Some(unit_vals) = parse_i64(&args[1]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    if unit_vals < 1 {
        return cntx.rb.send_error(&invalid_expire_time(cmd_name));
    }

    let expiry = ExpireParams {
        value: unit_vals,
        unit: if seconds { TimeUnit::Sec } else { TimeUnit::Msec },
        absolute: false,
        ..Default::default()
    };
    let (_, abs_ms) = expiry.calculate(cntx.time_now_ms, false);
    if abs_ms < 0 {
        return cntx.rb.send_error(&invalid_expire_time("set"));
    }

    let sparams = SetParams {
        flags: SET_EXPIRE_AFTER_MS,
        expire_after_ms: expiry.calculate(cntx.time_now_ms, true).0 as u64,
        ..Default::default()
    };
    let (result, _) = set_generic(cntx, sparams, key, value);
    match result {
        Ok(()) => cntx.rb.send_stored(),
        Err(status) => cntx.rb.send_error_status(status),
    }
}

pub fn set_ex(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    set_ex_generic(true, "setex", args, cntx);
}

pub fn p_set_ex(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    set_ex_generic(false, "psetex", args, cntx);
}

pub fn set_nx(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let sparams = SetParams {
        flags: SET_IF_NOTEXIST,
        memcache_flags: cntx.conn.memcache_flag,
        ..Default::default()
    };
    let (result, _) = set_generic(cntx, sparams, &args[0], &args[1]);
    match result {
        // the value was set
        Ok(()) => cntx.rb.send_long(1),
        Err(OpStatus::OutOfMemory) => cntx.rb.send_error_status(OpStatus::OutOfMemory),
        // the value existed, so we did not change it
        Err(OpStatus::Skipped) => cntx.rb.send_long(0),
        Err(status) => cntx.rb.send_error_status(status),
    }
}

pub fn get(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let sid = cntx.shard_set.shard_for_key(&args[0]);
    let db = db_cntx(cntx);
    let key = args[0].clone();
    let res = cntx
        .shard_set
        .await_brief(sid, move |shard| op_get(shard, db, &key));
    send_string_result(cntx.rb, res);
}

pub fn get_del(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let sid = cntx.shard_set.shard_for_key(&args[0]);
    let db = db_cntx(cntx);
    let key = args[0].clone();
    let res = cntx
        .shard_set
        .await_brief(sid, move |shard| op_getdel(shard, db, &key));
    send_string_result(cntx.rb, res);
}

pub fn get_set(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let sparams = SetParams {
        flags: SET_GET,
        ..Default::default()
    };
    let (result, prev) = set_generic(cntx, sparams, &args[0], &args[1]);
    if let Err(status) = result {
        return cntx.rb.send_error_status(status);
    }
    match prev {
        Some(bytes) => cntx.rb.send_bulk_string(&bytes),
        None => cntx.rb.send_null(),
    }
}

pub fn get_ex(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let key = args[0].clone();

    let mut exp_params = ExpireParams::default();
    let mut defined = false;
    let mut i = 1;
    while i < args.len() {
        let option = upper(&args[i]);
        match option.as_str() {
            "EX" | "PX" | "EXAT" | "PXAT" => {
                let Some(int_arg) = args.get(i + 1).and_then(|a| parse_i64(a)) else {
                    return cntx.rb.send_error_status(OpStatus::InvalidInt);
                };
                i += 1;
                if defined {
                    return cntx.rb.send_error(SYNTAX_ERR);
                }
                if int_arg <= 0 {
                    return cntx.rb.send_error(&invalid_expire_time("getex"));
                }
                exp_params.absolute = option == "EXAT" || option == "PXAT";
                exp_params.value = int_arg;
                exp_params.unit = if option == "PX" || option == "PXAT" {
                    TimeUnit::Msec
                } else {
                    TimeUnit::Sec
                };
                defined = true;
            }
            "PERSIST" => exp_params.persist = true,
            _ => return cntx.rb.send_error(SYNTAX_ERR),
        }
        i += 1;
    }

    let sid = cntx.shard_set.shard_for_key(&key);
    let db = db_cntx(cntx);
    let res = cntx.shard_set.await_brief(sid, move |shard| {
        let mut found = shard
            .slice
            .find_mutable_typed(&db, &key, ObjType::String)?;
        let value = shard
            .slice
            .read_value_bytes(db.db_index, found.it)
            .map_err(|_| OpStatus::InvalidValue);
        // run manually before a possible delete on negative expiry
        found.post_updater.run(&mut shard.slice);

        if exp_params.is_defined() {
            shard
                .slice
                .update_expire(&db, found.it, found.exp_it, &exp_params)?;
        }

        // replicate GETEX as PEXPIREAT or PERSIST
        if shard.slice.journal_mut().is_some() {
            if exp_params.persist {
                let args: Vec<&[u8]> = vec![b"PERSIST", &key];
                shard
                    .slice
                    .journal_mut()
                    .unwrap()
                    .record_command(db.db_index, &args);
            } else if exp_params.is_defined() {
                let (_, abs_time) = exp_params.calculate(db.time_now_ms, false);
                let abs = abs_time.to_string().into_bytes();
                let args: Vec<&[u8]> = vec![b"PEXPIREAT", &key, &abs];
                shard
                    .slice
                    .journal_mut()
                    .unwrap()
                    .record_command(db.db_index, &args);
            }
        }

        value
    });
    send_string_result(cntx.rb, res);
}

pub fn append(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    extend_generic(args, false, cntx);
}

pub fn prepend(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    extend_generic(args, true, cntx);
}

fn extend_generic(args: &[Vec<u8>], prepend: bool, cntx: &mut CommandContext<'_>) {
    let key = args[0].clone();
    let value = args[1].clone();
    let sid = cntx.shard_set.shard_for_key(&key);
    let db = db_cntx(cntx);

    if cntx.rb.protocol() == Protocol::Redis {
        let res = cntx.shard_set.await_brief(sid, move |shard| {
            op_extend(shard, db, &key, &value, prepend)
        });
        send_long_result(cntx.rb, res);
    } else {
        // memcached skips if the key is missing
        let res = cntx.shard_set.await_brief(sid, move |shard| {
            op_extend_or_skip(shard, db, &key, &value, prepend)
        });
        if res.unwrap_or(false) {
            cntx.rb.send_stored();
        } else {
            cntx.rb.send_set_skipped();
        }
    }
}

fn incr_by_generic(key: &[u8], val: i64, cntx: &mut CommandContext<'_>) {
    let skip_on_missing = cntx.rb.protocol() == Protocol::Memcache;
    let sid = cntx.shard_set.shard_for_key(key);
    let db = db_cntx(cntx);
    let key = key.to_vec();
    let result = cntx.shard_set.await_brief(sid, move |shard| {
        op_incrby(shard, db, &key, val, skip_on_missing)
    });

    match result {
        Ok(v) => cntx.rb.send_long(v),
        Err(OpStatus::InvalidValue) => cntx.rb.send_error_status(OpStatus::InvalidInt),
        Err(OpStatus::OutOfRange) => cntx.rb.send_error_status(OpStatus::OutOfRange),
        // relevant only for memcache
        Err(OpStatus::KeyNotFound) => cntx.rb.send_miss(),
        Err(status) => cntx.rb.send_error_status(status),
    }
}

pub fn incr(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    incr_by_generic(&args[0].clone(), 1, cntx);
}

pub fn decr(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    incr_by_generic(&args[0].clone(), -1, cntx);
}

pub fn incr_by(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let Some(val) = parse_i64(&args[1]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    incr_by_generic(&args[0].clone(), val, cntx);
}

pub fn decr_by(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let Some(val) = parse_i64(&args[1]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    if val == i64::MIN {
        return cntx.rb.send_error_status(OpStatus::OutOfRange);
    }
    incr_by_generic(&args[0].clone(), -val, cntx);
}

pub fn incr_by_float(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let Some(val) = parse_f64(&args[1]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidFloat);
    };
    let sid = cntx.shard_set.shard_for_key(&args[0]);
    let db = db_cntx(cntx);
    let key = args[0].clone();
    let result = cntx
        .shard_set
        .await_brief(sid, move |shard| op_incrfloat(shard, db, &key, val));
    match result {
        Ok(v) => cntx.rb.send_double(v),
        Err(status) => cntx.rb.send_error_status(status),
    }
}

pub fn m_get(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    debug_assert!(!args.is_empty());

    let is_memcache = cntx.rb.protocol() == Protocol::Memcache;
    let mut fetch_mask = 0u8;
    if is_memcache {
        fetch_mask |= FETCH_MCFLAG;
        if cntx.conn.memcache_flag & FETCH_CAS_VER != 0 {
            fetch_mask |= FETCH_MCVER;
        }
    }

    // with deduplication on, later duplicates point at the first
    // occurrence instead of being fetched again
    let mut first_occurrence: HashMap<&[u8], usize> = HashMap::new();
    let mut dup_of: Vec<Option<usize>> = vec![None; args.len()];
    if cntx.mget_dedup_keys {
        for (idx, key) in args.iter().enumerate() {
            match first_occurrence.entry(key.as_slice()) {
                std::collections::hash_map::Entry::Occupied(e) => dup_of[idx] = Some(*e.get()),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(idx);
                }
            }
        }
    }

    let groups = group_by_shard(
        cntx,
        args.iter()
            .enumerate()
            .filter(|(idx, _)| dup_of[*idx].is_none())
            .map(|(_, k)| k.as_slice()),
    );
    // group_by_shard re-enumerates, so rebuild the original indices
    let unique_indices: Vec<usize> = (0..args.len()).filter(|i| dup_of[*i].is_none()).collect();

    let mut results: Vec<Option<GetResp>> = vec![None; args.len()];
    for (sid, items) in groups {
        let keys: Vec<Vec<u8>> = items.iter().map(|(_, k)| k.clone()).collect();
        let db = db_cntx(cntx);
        let shard_out = cntx
            .shard_set
            .await_brief(sid, move |shard| op_mget(shard, db, &keys, fetch_mask));
        for ((local_idx, _), resp) in items.into_iter().zip(shard_out) {
            results[unique_indices[local_idx]] = resp;
        }
    }
    for (idx, dup) in dup_of.iter().enumerate() {
        if let Some(first) = dup {
            results[idx] = results[*first].clone();
        }
    }

    if is_memcache {
        for entry in &results {
            match entry {
                Some(resp) => cntx.rb.send_value(&resp.key, &resp.value, resp.mc_flag, resp.mc_ver),
                None => cntx.rb.send_miss(),
            }
        }
        cntx.rb.send_get_end();
    } else {
        cntx.rb.start_array(results.len());
        for entry in &results {
            match entry {
                Some(resp) => cntx.rb.send_bulk_string(&resp.value),
                None => cntx.rb.send_null(),
            }
        }
    }
}

pub fn m_set(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let mut groups: HashMap<ShardId, Vec<(Vec<u8>, Vec<u8>)>> = HashMap::new();
    for pair in args.chunks(2) {
        let sid = cntx.shard_set.shard_for_key(&pair[0]);
        groups
            .entry(sid)
            .or_default()
            .push((pair[0].clone(), pair[1].clone()));
    }

    let mut result = Ok(());
    for (sid, pairs) in groups {
        let db = db_cntx(cntx);
        let status = cntx
            .shard_set
            .await_brief(sid, move |shard| op_mset(shard, db, &pairs));
        if status.is_err() {
            result = status;
        }
    }

    match result {
        Ok(()) => cntx.rb.send_ok(),
        Err(status) => cntx.rb.send_error_status(status),
    }
}

pub fn m_set_nx(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let mut groups: HashMap<ShardId, Vec<(Vec<u8>, Vec<u8>)>> = HashMap::new();
    for pair in args.chunks(2) {
        let sid = cntx.shard_set.shard_for_key(&pair[0]);
        groups
            .entry(sid)
            .or_default()
            .push((pair[0].clone(), pair[1].clone()));
    }

    // first hop: a pure existence check on every shard
    let mut exists = false;
    for (sid, pairs) in &groups {
        let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let db = db_cntx(cntx);
        let found = cntx.shard_set.await_brief(*sid, move |shard| {
            keys.iter()
                .any(|key| shard.slice.find_read_only(&db, key).is_some())
        });
        exists |= found;
    }

    // second hop: either all shards write, or none do
    let mut result = Ok(());
    if !exists {
        for (sid, pairs) in groups {
            let db = db_cntx(cntx);
            let status = cntx
                .shard_set
                .await_brief(sid, move |shard| op_mset(shard, db, &pairs));
            if status.is_err() {
                result = status;
            }
        }
    }

    cntx.rb
        .send_long(if exists || result.is_err() { 0 } else { 1 });
}

pub fn str_len(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let sid = cntx.shard_set.shard_for_key(&args[0]);
    let db = db_cntx(cntx);
    let key = args[0].clone();
    let res = cntx
        .shard_set
        .await_brief(sid, move |shard| op_strlen(shard, db, &key));
    send_long_result(cntx.rb, res);
}

pub fn get_range(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let (Some(start), Some(end)) = (
        parse_i64(&args[1]).map(|v| v as i32),
        parse_i64(&args[2]).map(|v| v as i32),
    ) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };

    let sid = cntx.shard_set.shard_for_key(&args[0]);
    let db = db_cntx(cntx);
    let key = args[0].clone();
    let res = cntx
        .shard_set
        .await_brief(sid, move |shard| op_getrange(shard, db, &key, start, end));
    send_string_result(cntx.rb, res);
}

pub fn set_range(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let Some(start) = parse_i64(&args[1]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    let value = args[2].clone();

    if start < 0 {
        return cntx.rb.send_error("offset is out of range");
    }
    if start as usize + value.len() > MAX_STR_LEN {
        return cntx.rb.send_error("string exceeds maximum allowed size");
    }

    let sid = cntx.shard_set.shard_for_key(&args[0]);
    let db = db_cntx(cntx);
    let key = args[0].clone();
    let res = cntx.shard_set.await_brief(sid, move |shard| {
        op_setrange(shard, db, &key, start as usize, &value)
    });
    send_long_result(cntx.rb, res);
}

/* CL.THROTTLE <key> <max_burst> <count per period> <period> [<quantity>]
 * Response is an array of 5 integers:
 *  1. Whether the action was limited (0 allowed, 1 limited).
 *  2. The total limit of the key (max_burst + 1), i.e. X-RateLimit-Limit.
 *  3. The remaining limit of the key, i.e. X-RateLimit-Remaining.
 *  4. Seconds until the user should retry; -1 when allowed (Retry-After).
 *  5. Seconds until the limit resets to full capacity (X-RateLimit-Reset).
 */
pub fn cl_throttle(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    let key = args[0].clone();

    let Some(max_burst) = parse_u64(&args[1]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    let Some(count) = parse_u64(&args[2]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    let Some(period) = parse_u64(&args[3]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    let quantity = match args.get(4) {
        Some(arg) => match parse_u64(arg) {
            Some(q) => q,
            None => return cntx.rb.send_error_status(OpStatus::InvalidInt),
        },
        None => 1,
    };

    if max_burst > i64::MAX as u64 - 1 {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    }
    let limit = max_burst as i64 + 1;

    if period > u64::MAX / 1000 || count == 0 || period * 1000 / count > i64::MAX as u64 {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    }
    let emission_interval_ms = (period * 1000 / count) as i64;

    if emission_interval_ms == 0 {
        return cntx.rb.send_error("zero rates are not supported");
    }

    let sid = cntx.shard_set.shard_for_key(&key);
    let db = db_cntx(cntx);
    let result = cntx.shard_set.await_brief(sid, move |shard| {
        op_throttle(shard, db, &key, limit, emission_interval_ms, quantity)
    });

    match result {
        Ok(mut array) => {
            // positive residuals round up at the ms -> s boundary
            let mut retry_after_s = array[3] / 1000;
            if array[3] > 0 {
                retry_after_s += 1;
            }
            array[3] = retry_after_s;

            let mut reset_after_s = array[4] / 1000;
            if array[4] > 0 {
                reset_after_s += 1;
            }
            array[4] = reset_after_s;

            cntx.rb.start_array(array.len());
            for v in array {
                cntx.rb.send_long(v);
            }
        }
        Err(OpStatus::WrongType) => cntx.rb.send_error_status(OpStatus::WrongType),
        Err(OpStatus::InvalidInt) | Err(OpStatus::InvalidValue) => {
            cntx.rb.send_error_status(OpStatus::InvalidInt)
        }
        Err(status) => cntx.rb.send_error_status(status),
    }
}

// memcache GAT: GAT <expiry-in-seconds> key [keys...]
pub fn gat(args: &[Vec<u8>], cntx: &mut CommandContext<'_>) {
    debug_assert!(cntx.rb.protocol() == Protocol::Memcache);

    let mut fetch_mask = FETCH_MCFLAG;
    if cntx.conn.memcache_flag & FETCH_CAS_VER != 0 {
        fetch_mask |= FETCH_MCVER;
    }

    let Some(expire_ts) = parse_u64(&args[0]) else {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    };
    if expire_ts > i64::MAX as u64 / 1000 {
        return cntx.rb.send_error_status(OpStatus::InvalidInt);
    }

    // expiry of zero persists the keys
    let expire_params = ExpireParams {
        value: (expire_ts * 1000) as i64,
        unit: TimeUnit::Msec,
        absolute: true,
        persist: expire_ts == 0,
        ..Default::default()
    };

    let keys = &args[1..];
    let groups = group_by_shard(cntx, keys.iter().map(|k| k.as_slice()));

    let mut results: Vec<Option<GetResp>> = vec![None; keys.len()];
    for (sid, items) in groups {
        let shard_keys: Vec<Vec<u8>> = items.iter().map(|(_, k)| k.clone()).collect();
        let db = db_cntx(cntx);
        let out = cntx.shard_set.await_brief(sid, move |shard| {
            op_gat(shard, db, &shard_keys, fetch_mask, expire_params)
        });
        for ((idx, _), resp) in items.into_iter().zip(out) {
            results[idx] = resp;
        }
    }

    for entry in &results {
        match entry {
            Some(resp) => cntx.rb.send_value(&resp.key, &resp.value, resp.mc_flag, resp.mc_ver),
            None => cntx.rb.send_miss(),
        }
    }
    cntx.rb.send_get_end();
}

pub fn register(registry: &mut CommandRegistry) {
    const MSET_MASK: u32 =
        opt::WRITE | opt::DENYOOM | opt::INTERLEAVED_KEYS | opt::NO_AUTOJOURNAL;

    registry.start_family(Some(acl::STRING));
    registry
        .add(
            CommandId::new("SET", opt::WRITE | opt::DENYOOM | opt::NO_AUTOJOURNAL, -3, 1, 1, None)
                .handler(set),
        )
        .add(
            CommandId::new("SETEX", opt::WRITE | opt::DENYOOM | opt::NO_AUTOJOURNAL, 4, 1, 1, None)
                .handler(set_ex),
        )
        .add(
            CommandId::new("PSETEX", opt::WRITE | opt::DENYOOM | opt::NO_AUTOJOURNAL, 4, 1, 1, None)
                .handler(p_set_ex),
        )
        .add(
            CommandId::new("SETNX", opt::WRITE | opt::DENYOOM | opt::FAST, 3, 1, 1, None)
                .handler(set_nx),
        )
        .add(
            CommandId::new("APPEND", opt::WRITE | opt::DENYOOM | opt::FAST, 3, 1, 1, None)
                .handler(append),
        )
        .add(
            CommandId::new("PREPEND", opt::WRITE | opt::DENYOOM | opt::FAST, 3, 1, 1, None)
                .handler(prepend),
        )
        .add(CommandId::new("INCR", opt::WRITE | opt::FAST, 2, 1, 1, None).handler(incr))
        .add(CommandId::new("DECR", opt::WRITE | opt::FAST, 2, 1, 1, None).handler(decr))
        .add(CommandId::new("INCRBY", opt::WRITE | opt::FAST, 3, 1, 1, None).handler(incr_by))
        .add(
            CommandId::new("INCRBYFLOAT", opt::WRITE | opt::FAST, 3, 1, 1, None)
                .handler(incr_by_float),
        )
        .add(CommandId::new("DECRBY", opt::WRITE | opt::FAST, 3, 1, 1, None).handler(decr_by))
        .add(CommandId::new("GET", opt::READONLY | opt::FAST, 2, 1, 1, None).handler(get))
        .add(CommandId::new("GETDEL", opt::WRITE | opt::FAST, 2, 1, 1, None).handler(get_del))
        .add(
            CommandId::new(
                "GETEX",
                opt::WRITE | opt::DENYOOM | opt::FAST | opt::NO_AUTOJOURNAL,
                -2,
                1,
                1,
                None,
            )
            .handler(get_ex),
        )
        .add(
            CommandId::new("GETSET", opt::WRITE | opt::DENYOOM | opt::FAST, 3, 1, 1, None)
                .handler(get_set),
        )
        .add(
            CommandId::new("MGET", opt::READONLY | opt::FAST | opt::IDEMPOTENT, -2, 1, -1, None)
                .handler(m_get),
        )
        .add(CommandId::new("MSET", MSET_MASK, -3, 1, -1, None).handler(m_set))
        .add(CommandId::new("MSETNX", MSET_MASK, -3, 1, -1, None).handler(m_set_nx))
        .add(CommandId::new("STRLEN", opt::READONLY | opt::FAST, 2, 1, 1, None).handler(str_len))
        .add(CommandId::new("GETRANGE", opt::READONLY, 4, 1, 1, None).handler(get_range))
        // alias for GETRANGE
        .add(CommandId::new("SUBSTR", opt::READONLY, 4, 1, 1, None).handler(get_range))
        .add(
            CommandId::new("SETRANGE", opt::WRITE | opt::DENYOOM, 4, 1, 1, None)
                .handler(set_range),
        )
        .add(
            CommandId::new(
                "CL.THROTTLE",
                opt::WRITE | opt::DENYOOM | opt::FAST,
                -5,
                1,
                1,
                Some(acl::THROTTLE),
            )
            .handler(cl_throttle),
        )
        .add(
            CommandId::new(
                "GAT",
                opt::WRITE | opt::DENYOOM | opt::NO_AUTOJOURNAL | opt::HIDDEN,
                -3,
                2,
                -1,
                None,
            )
            .handler(gat),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getrange_boundaries() {
        let s = b"This is a string";
        assert_eq!(getrange_slice(s, 0, 3), b"This");
        assert_eq!(getrange_slice(s, -3, -1), b"ing");
        assert_eq!(getrange_slice(s, -1, -1), b"g");
        assert_eq!(getrange_slice(s, 5, 2), b"");
        assert_eq!(getrange_slice(s, 0, -1), &s[..]);
        assert_eq!(getrange_slice(s, 10, 100), b"string");
        assert_eq!(getrange_slice(b"", 0, -1), b"");
    }

    #[test]
    fn double_formatting() {
        assert_eq!(format_double(10.5), "10.5");
        assert_eq!(format_double(3.0), "3");
        assert_eq!(format_double(0.1), "0.1");
        assert_eq!(format_double(-2.25), "-2.25");
    }
}
