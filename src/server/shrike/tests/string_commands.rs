// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Behavioral suite for the string family, run against a live multi-shard
//! engine.

mod common;

use crate::common::*;
use keyspace::DbContext;
use shrike::reply::Reply;
use std::time::Duration;

#[test]
fn set_then_get() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET hello world")), Reply::Stored);
    assert_eq!(first(run(&engine, "GET hello")), bulk("world"));
    engine.shutdown();
}

#[test]
fn incr_sequence() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET a 1")), Reply::Stored);
    assert_eq!(first(run(&engine, "INCR a")), Reply::Long(2));
    assert_eq!(first(run(&engine, "INCR a")), Reply::Long(3));
    assert_eq!(first(run(&engine, "GET a")), bulk("3"));
    engine.shutdown();
}

#[test]
fn set_with_expiry_expires() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k v EX 1")), Reply::Stored);
    assert_eq!(first(run(&engine, "GET k")), bulk("v"));
    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(first(run(&engine, "GET k")), Reply::Null);
    engine.shutdown();
}

#[test]
fn mset_then_mget_reorders() {
    let engine = engine();
    assert_eq!(
        first(run(&engine, "MSET a 1 b 2 c 3")),
        Reply::Simple("OK".into())
    );
    let replies = run(&engine, "MGET c a b");
    assert_eq!(
        replies,
        vec![Reply::ArrayHeader(3), bulk("3"), bulk("1"), bulk("2")]
    );
    engine.shutdown();
}

#[test]
fn throttle_first_call() {
    let engine = engine();
    let replies = run(&engine, "CL.THROTTLE r 3 1 60 1");
    assert_eq!(replies[0], Reply::ArrayHeader(5));
    assert_eq!(replies[1], Reply::Long(0), "not limited");
    assert_eq!(replies[2], Reply::Long(4), "limit is max_burst + 1");
    assert_eq!(replies[3], Reply::Long(3), "remaining equals max_burst");
    assert_eq!(replies[4], Reply::Long(-1), "retry_after is -1 when allowed");
    match replies[5] {
        Reply::Long(reset) => assert!(reset >= 0),
        ref other => panic!("unexpected reply {other:?}"),
    }
    engine.shutdown();
}

#[test]
fn throttle_limits_after_burst() {
    let engine = engine();
    // burst of 4 allowed calls, then limited
    let mut limited = false;
    for _ in 0..5 {
        let replies = run(&engine, "CL.THROTTLE burst 3 1 600 1");
        if replies[1] == Reply::Long(1) {
            limited = true;
            match replies[4] {
                Reply::Long(retry) => assert!(retry >= 1, "retry rounds up to seconds"),
                ref other => panic!("unexpected reply {other:?}"),
            }
        }
    }
    assert!(limited, "fifth call within the period must be limited");
    engine.shutdown();
}

#[test]
fn throttle_zero_rate_rejected() {
    let engine = engine();
    let reply = first(run(&engine, "CL.THROTTLE k 0 1 1 1000000"));
    assert_eq!(reply, Reply::Error("zero rates are not supported".into()));
    engine.shutdown();
}

#[test]
fn append_and_strlen() {
    let engine = engine();
    assert_eq!(first(run_args(
        &engine,
        &[b"SET".to_vec(), b"k".to_vec(), b"Hello".to_vec()],
    )), Reply::Stored);
    let appended = first(run_args(
        &engine,
        &[b"APPEND".to_vec(), b"k".to_vec(), b" World".to_vec()],
    ));
    assert_eq!(appended, Reply::Long(11));
    assert_eq!(first(run(&engine, "STRLEN k")), Reply::Long(11));
    assert_eq!(first(run(&engine, "GET k")), bulk("Hello World"));
    engine.shutdown();
}

#[test]
fn append_twice_concatenates() {
    let engine = engine();
    assert_eq!(first(run(&engine, "APPEND k a")), Reply::Long(1));
    assert_eq!(first(run(&engine, "APPEND k b")), Reply::Long(2));
    assert_eq!(first(run(&engine, "GET k")), bulk("ab"));
    engine.shutdown();
}

#[test]
fn prepend_reverses_order() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k tail")), Reply::Stored);
    assert_eq!(first(run(&engine, "PREPEND k head-")), Reply::Long(9));
    assert_eq!(first(run(&engine, "GET k")), bulk("head-tail"));
    engine.shutdown();
}

#[test]
fn set_get_option_returns_previous() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k old")), Reply::Stored);
    assert_eq!(first(run(&engine, "SET k new GET")), bulk("old"));
    assert_eq!(first(run(&engine, "GET k")), bulk("new"));
    // GET on a missing key during SET returns null
    assert_eq!(first(run(&engine, "SET fresh v GET")), Reply::Null);
    engine.shutdown();
}

#[test]
fn conditional_sets() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k v XX")), Reply::SetSkipped);
    assert_eq!(first(run(&engine, "SET k v NX")), Reply::Stored);
    assert_eq!(first(run(&engine, "SET k other NX")), Reply::SetSkipped);
    assert_eq!(first(run(&engine, "SET k other XX")), Reply::Stored);
    assert_eq!(first(run(&engine, "GET k")), bulk("other"));

    // NX and XX are mutually exclusive, KEEPTTL conflicts with expiry
    assert_eq!(
        first(run(&engine, "SET k v NX XX")),
        Reply::Error("syntax error".into())
    );
    assert_eq!(
        first(run(&engine, "SET k v EX 10 KEEPTTL")),
        Reply::Error("syntax error".into())
    );
    engine.shutdown();
}

#[test]
fn setnx_returns_integer_sentinel() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SETNX k v")), Reply::Long(1));
    assert_eq!(first(run(&engine, "SETNX k other")), Reply::Long(0));
    assert_eq!(first(run(&engine, "GET k")), bulk("v"));
    engine.shutdown();
}

#[test]
fn getset_and_getdel() {
    let engine = engine();
    assert_eq!(first(run(&engine, "GETSET k v1")), Reply::Null);
    assert_eq!(first(run(&engine, "GETSET k v2")), bulk("v1"));
    assert_eq!(first(run(&engine, "GETDEL k")), bulk("v2"));
    assert_eq!(first(run(&engine, "GET k")), Reply::Null);
    assert_eq!(first(run(&engine, "GETDEL k")), Reply::Null);
    engine.shutdown();
}

#[test]
fn incr_repeated_equals_incrby() {
    let engine = engine();
    for _ in 0..7 {
        run(&engine, "INCR counter-a");
    }
    assert_eq!(first(run(&engine, "INCRBY counter-b 7")), Reply::Long(7));
    assert_eq!(
        first(run(&engine, "GET counter-a")),
        first(run(&engine, "GET counter-b"))
    );
    engine.shutdown();
}

#[test]
fn incr_overflow_and_bad_input() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET n 1")), Reply::Stored);
    assert_eq!(
        first(run(&engine, &format!("INCRBY n {}", i64::MAX))),
        Reply::Error("increment or decrement would overflow".into())
    );
    assert_eq!(
        first(run(&engine, &format!("DECRBY n {}", i64::MIN))),
        Reply::Error("increment or decrement would overflow".into())
    );
    assert_eq!(first(run(&engine, "SET s hello")), Reply::Stored);
    assert_eq!(
        first(run(&engine, "INCR s")),
        Reply::Error("value is not an integer or out of range".into())
    );
    engine.shutdown();
}

#[test]
fn incrbyfloat_rejects_nan_and_inf() {
    let engine = engine();
    assert_eq!(first(run(&engine, "INCRBYFLOAT f 10.5")), Reply::Double(10.5));
    assert_eq!(first(run(&engine, "INCRBYFLOAT f 0.1")), Reply::Double(10.6));
    assert_eq!(
        first(run(&engine, "INCRBYFLOAT f nan")),
        Reply::Error("value is not a valid float".into())
    );
    assert_eq!(first(run(&engine, "SET inf-base 1e308")), Reply::Stored);
    assert_eq!(
        first(run(&engine, "INCRBYFLOAT inf-base 1e308")),
        Reply::Error("value is not a valid float".into())
    );
    engine.shutdown();
}

#[test]
fn getrange_boundaries() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k abcdef")), Reply::Stored);
    assert_eq!(first(run(&engine, "GETRANGE k -1 -1")), bulk("f"));
    assert_eq!(first(run(&engine, "GETRANGE k 5 2")), bulk(""));
    assert_eq!(first(run(&engine, "GETRANGE k 0 -1")), bulk("abcdef"));
    assert_eq!(first(run(&engine, "SUBSTR k 1 3")), bulk("bcd"));
    assert_eq!(first(run(&engine, "GETRANGE missing 0 -1")), bulk(""));
    engine.shutdown();
}

#[test]
fn setrange_limits() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k hello")), Reply::Stored);
    assert_eq!(
        first(run(&engine, "SETRANGE k -1 x")),
        Reply::Error("offset is out of range".into())
    );
    let over = (1usize << 28) - 5 + 1;
    assert_eq!(
        first(run(&engine, &format!("SETRANGE k {over} extra"))),
        Reply::Error("string exceeds maximum allowed size".into())
    );
    assert_eq!(first(run(&engine, "SETRANGE k 1 appy")), Reply::Long(5));
    assert_eq!(first(run(&engine, "GET k")), bulk("happy"));
    // extension pads with zero bytes
    assert_eq!(first(run(&engine, "SETRANGE pad 3 x")), Reply::Long(4));
    engine.shutdown();
}

#[test]
fn msetnx_is_atomic_across_shards() {
    let engine = engine_with_shards(4);
    assert_eq!(
        first(run(&engine, "MSETNX k1 v1 k2 v2 k3 v3 k4 v4")),
        Reply::Long(1)
    );
    // one existing key forbids the whole batch
    assert_eq!(
        first(run(&engine, "MSETNX other-a 1 k3 clobber other-b 2")),
        Reply::Long(0)
    );
    assert_eq!(first(run(&engine, "GET k3")), bulk("v3"));
    assert_eq!(first(run(&engine, "GET other-a")), Reply::Null);
    assert_eq!(first(run(&engine, "GET other-b")), Reply::Null);
    engine.shutdown();
}

#[test]
fn mget_spans_shards() {
    let engine = engine_with_shards(4);
    for i in 0..32 {
        assert_eq!(
            first(run(&engine, &format!("SET spread-{i} value-{i}"))),
            Reply::Stored
        );
    }
    let keys: Vec<String> = (0..32).map(|i| format!("spread-{i}")).collect();
    let replies = run(&engine, &format!("MGET {} missing", keys.join(" ")));
    assert_eq!(replies[0], Reply::ArrayHeader(33));
    for i in 0..32 {
        assert_eq!(replies[1 + i], bulk(&format!("value-{i}")));
    }
    assert_eq!(replies[33], Reply::Null);
    engine.shutdown();
}

#[test]
fn setex_rejects_non_positive_expiry() {
    let engine = engine();
    assert_eq!(
        first(run(&engine, "SETEX k 0 v")),
        Reply::Error("invalid expire time in 'setex' command".into())
    );
    assert_eq!(
        first(run(&engine, "PSETEX k -5 v")),
        Reply::Error("invalid expire time in 'psetex' command".into())
    );
    assert_eq!(first(run(&engine, "SETEX k 100 v")), Reply::Stored);
    assert_eq!(first(run(&engine, "GET k")), bulk("v"));
    engine.shutdown();
}

#[test]
fn getex_updates_expiry() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET k v")), Reply::Stored);
    // fetch and attach a 1-second expiry
    assert_eq!(first(run(&engine, "GETEX k EX 1")), bulk("v"));
    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(first(run(&engine, "GET k")), Reply::Null);

    // PERSIST removes an expiry
    assert_eq!(first(run(&engine, "SET p v EX 1")), Reply::Stored);
    assert_eq!(first(run(&engine, "GETEX p PERSIST")), bulk("v"));
    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(first(run(&engine, "GET p")), bulk("v"));
    engine.shutdown();
}

#[test]
fn sticky_survives_plain_overwrite() {
    let engine = engine();
    assert_eq!(first(run(&engine, "SET pin v1 STICK")), Reply::Stored);
    assert_eq!(first(run(&engine, "SET pin v2")), Reply::Stored);

    let sid = engine.shard_set().shard_for_key(b"pin");
    let now = keyspace::current_time_ms();
    let sticky = engine.shard_set().await_brief(sid, move |shard| {
        let cntx = DbContext::new(0, now);
        let it = shard.slice.find_read_only(&cntx, b"pin").expect("present");
        shard.slice.is_sticky(0, it)
    });
    assert!(sticky, "an overwrite without STICK must not clear stickiness");
    engine.shutdown();
}

#[test]
fn memcache_variants() {
    let engine = engine();
    // memcached APPEND skips missing keys instead of creating them
    assert_eq!(first(run_mc(&engine, "APPEND mk tail")), Reply::SetSkipped);
    // memcached INCR misses instead of creating
    assert_eq!(first(run_mc(&engine, "INCR mk")), Reply::Miss);

    assert_eq!(first(run_mc(&engine, "SET mk base")), Reply::Stored);
    assert_eq!(first(run_mc(&engine, "APPEND mk -tail")), Reply::Stored);

    let replies = run_mc(&engine, "MGET mk missing");
    assert_eq!(replies.len(), 3);
    assert!(matches!(&replies[0], Reply::Value { key, value, .. }
        if key == b"mk" && value == b"base-tail"));
    assert_eq!(replies[1], Reply::Miss);
    assert_eq!(replies[2], Reply::GetEnd);
    engine.shutdown();
}

#[test]
fn gat_touches_and_fetches() {
    let engine = engine();
    assert_eq!(first(run_mc(&engine, "SET g1 v1")), Reply::Stored);
    assert_eq!(first(run_mc(&engine, "SET g2 v2")), Reply::Stored);

    // touch far into the future and fetch in one pass
    let future_sec = (keyspace::current_time_ms() / 1000) + 3600;
    let replies = run_mc(&engine, &format!("GAT {future_sec} g1 g2 missing"));
    assert!(matches!(&replies[0], Reply::Value { key, value, .. }
        if key == b"g1" && value == b"v1"));
    assert!(matches!(&replies[1], Reply::Value { key, value, .. }
        if key == b"g2" && value == b"v2"));
    assert_eq!(replies[2], Reply::Miss);
    assert_eq!(replies[3], Reply::GetEnd);

    // a past deadline deletes on touch
    let replies = run_mc(&engine, "GAT 1 g1");
    assert_eq!(replies[0], Reply::Miss);
    assert_eq!(first(run_mc(&engine, "GET g1")), Reply::Null);

    // expiry of zero persists
    let replies = run_mc(&engine, "GAT 0 g2");
    assert!(matches!(&replies[0], Reply::Value { .. }));
    assert_eq!(first(run(&engine, "GET g2")), bulk("v2"));
    engine.shutdown();
}

#[test]
fn wrong_type_is_surfaced() {
    let engine = engine();
    // CL.THROTTLE stores its bucket state as a string record; other
    // string commands on it still work, but a non-integer value fails
    assert_eq!(first(run(&engine, "SET t text")), Reply::Stored);
    let replies = run(&engine, "CL.THROTTLE t 3 1 60");
    assert_eq!(
        replies[0],
        Reply::Error("value is not an integer or out of range".into())
    );
    engine.shutdown();
}

#[test]
fn unknown_and_malformed_commands() {
    let engine = engine();
    assert_eq!(
        first(run(&engine, "NOSUCHCMD a b")),
        Reply::Error("unknown command `nosuchcmd`".into())
    );
    assert_eq!(
        first(run(&engine, "GET")),
        Reply::Error("wrong number of arguments for 'get' command".into())
    );
    assert_eq!(
        first(run(&engine, "MSET k")),
        Reply::Error("wrong number of arguments for 'mset' command".into())
    );
    engine.shutdown();
}
