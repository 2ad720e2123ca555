// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Tagged results for keyspace operations. Failures never cross a shard
//! boundary as panics: they travel as `OpStatus` values and are rendered
//! into wire errors by the reply-builder at the edge.

use thiserror::Error;

/// The outcome kinds a keyspace operation can surface. Display strings
/// follow the Redis wire conventions so the boundary can forward them
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpStatus {
    #[error("no such key")]
    KeyNotFound,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,
    #[error("increment or decrement would overflow")]
    OutOfRange,
    #[error("value is not a valid float")]
    InvalidFloat,
    #[error("value is not an integer or out of range")]
    InvalidInt,
    #[error("invalid value")]
    InvalidValue,
    /// A conditional mutation declined to run (NX/XX/GT/LT and friends).
    #[error("skipped")]
    Skipped,
    #[error("BUSYGROUP Consumer Group name already exists")]
    BusyGroup,
    /// A journal position aged out of the buffer before it was consumed.
    #[error("state is not recoverable")]
    StateNotRecoverable,
    #[error("invalid expire time")]
    InvalidExpireTime,
}

pub type OpResult<T> = Result<T, OpStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_conventions() {
        assert_eq!(
            OpStatus::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
        assert_eq!(
            OpStatus::InvalidInt.to_string(),
            "value is not an integer or out of range"
        );
    }
}
