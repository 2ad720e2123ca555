// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Helpers shared by the behavioral suites: build an engine, run
//! whitespace-separated commands against it, capture replies.

use shrike::context::ConnectionState;
use shrike::reply::{CapturingReplyBuilder, Protocol, Reply};
use shrike::Engine;

pub fn engine_with_shards(shards: usize) -> Engine {
    let config: config::ShrikeConfig = toml::from_str(&format!(
        "[general]\nshard_count = {shards}\n"
    ))
    .unwrap();
    Engine::new(config)
}

pub fn engine() -> Engine {
    engine_with_shards(2)
}

/// Runs one command given as whitespace-separated words and returns the
/// replies it produced.
pub fn run(engine: &Engine, command: &str) -> Vec<Reply> {
    run_args(
        engine,
        &command
            .split_whitespace()
            .map(|w| w.as_bytes().to_vec())
            .collect::<Vec<_>>(),
    )
}

pub fn run_args(engine: &Engine, args: &[Vec<u8>]) -> Vec<Reply> {
    let mut conn = ConnectionState::default();
    let mut rb = CapturingReplyBuilder::new(Protocol::Redis);
    engine.execute(&mut conn, &mut rb, args);
    rb.take()
}

pub fn run_mc(engine: &Engine, command: &str) -> Vec<Reply> {
    let args: Vec<Vec<u8>> = command
        .split_whitespace()
        .map(|w| w.as_bytes().to_vec())
        .collect();
    let mut conn = ConnectionState::default();
    let mut rb = CapturingReplyBuilder::new(Protocol::Memcache);
    engine.execute(&mut conn, &mut rb, &args);
    rb.take()
}

pub fn first(mut replies: Vec<Reply>) -> Reply {
    assert_eq!(replies.len(), 1, "expected exactly one reply: {replies:?}");
    replies.remove(0)
}

#[allow(dead_code)]
pub fn bulk(s: &str) -> Reply {
    Reply::Bulk(s.as_bytes().to_vec())
}
