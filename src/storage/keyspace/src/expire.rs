// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Compact deadline encoding for the expiry table. A deadline is stored as
//! a 32-bit delta from the per-database `expire_base`; deltas too large
//! for millisecond precision degrade to second precision. The base
//! supports generational compaction of deadlines.

use common::{OpResult, OpStatus};

/// Largest expiry deadline accepted, ~100 years out.
pub const MAX_EXPIRE_DEADLINE_SEC: i64 = 100 * 365 * 24 * 3600;
pub const MAX_EXPIRE_DEADLINE_MS: i64 = MAX_EXPIRE_DEADLINE_SEC * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Millis,
    Seconds,
}

/// Delta from `expire_base` in either millisecond or second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirePeriod {
    value: u32,
    precision: Precision,
}

impl ExpirePeriod {
    pub fn new(delta_ms: u64) -> Self {
        if delta_ms <= u32::MAX as u64 {
            Self {
                value: delta_ms as u32,
                precision: Precision::Millis,
            }
        } else {
            Self {
                value: (delta_ms / 1000).min(u32::MAX as u64) as u32,
                precision: Precision::Seconds,
            }
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self.precision {
            Precision::Millis => self.value as u64,
            Precision::Seconds => self.value as u64 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Sec,
    Msec,
}

pub const EXPIRE_NX: u8 = 1 << 0;
pub const EXPIRE_XX: u8 = 1 << 1;
pub const EXPIRE_GT: u8 = 1 << 2;
pub const EXPIRE_LT: u8 = 1 << 3;

/// Parsed expiry arguments of a command: EX/PX/EXAT/PXAT/PERSIST plus the
/// NX/XX/GT/LT condition flags.
#[derive(Debug, Clone, Copy)]
pub struct ExpireParams {
    pub value: i64,
    pub unit: TimeUnit,
    pub absolute: bool,
    pub persist: bool,
    pub expire_options: u8,
}

impl Default for ExpireParams {
    fn default() -> Self {
        Self {
            value: i64::MIN,
            unit: TimeUnit::Sec,
            absolute: false,
            persist: false,
            expire_options: 0,
        }
    }
}

impl ExpireParams {
    pub fn is_defined(&self) -> bool {
        self.persist || self.value != i64::MIN
    }

    pub fn cap(value: i64, unit: TimeUnit) -> i64 {
        match unit {
            TimeUnit::Sec => value.min(MAX_EXPIRE_DEADLINE_SEC),
            TimeUnit::Msec => value.min(MAX_EXPIRE_DEADLINE_MS),
        }
    }

    /// Returns `(relative_ms, absolute_ms)`. The absolute time is
    /// negative when the computation overflows.
    pub fn calculate(&self, now_ms: u64, cap: bool) -> (i64, i64) {
        if self.persist {
            return (0, 0);
        }
        if self.unit == TimeUnit::Sec && self.value > i64::MAX / 1000 {
            return (0, -1);
        }
        let msec = match self.unit {
            TimeUnit::Sec => self.value * 1000,
            TimeUnit::Msec => self.value,
        };
        let mut rel_msec = if self.absolute {
            msec - now_ms as i64
        } else {
            msec
        };
        if cap {
            rel_msec = Self::cap(rel_msec, TimeUnit::Msec);
        }
        (rel_msec, now_ms as i64 + rel_msec)
    }

    /// Parse guard used by the command layer: non-positive explicit expiry
    /// values are invalid for SET/SETEX/GETEX.
    pub fn check_positive(&self) -> OpResult<()> {
        if !self.persist && self.value <= 0 {
            return Err(OpStatus::InvalidExpireTime);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_precision() {
        let small = ExpirePeriod::new(5000);
        assert_eq!(small.duration_ms(), 5000);

        let large_ms = u32::MAX as u64 + 5_000;
        let large = ExpirePeriod::new(large_ms);
        // degraded to second precision
        let got = large.duration_ms();
        assert!(got <= large_ms && large_ms - got < 1000);
    }

    #[test]
    fn calculate_relative_and_absolute() {
        let now = 1_000_000;
        let rel = ExpireParams {
            value: 10,
            unit: TimeUnit::Sec,
            absolute: false,
            ..Default::default()
        };
        assert_eq!(rel.calculate(now, false), (10_000, 1_010_000));

        let abs = ExpireParams {
            value: 1_010_000,
            unit: TimeUnit::Msec,
            absolute: true,
            ..Default::default()
        };
        assert_eq!(abs.calculate(now, false), (10_000, 1_010_000));
    }

    #[test]
    fn overflow_returns_negative_absolute() {
        let params = ExpireParams {
            value: i64::MAX / 1000 + 1,
            unit: TimeUnit::Sec,
            absolute: false,
            ..Default::default()
        };
        let (_, abs) = params.calculate(0, false);
        assert!(abs < 0);
    }

    #[test]
    fn persist_is_zero() {
        let params = ExpireParams {
            persist: true,
            ..Default::default()
        };
        assert!(params.is_defined());
        assert_eq!(params.calculate(123, true), (0, 0));
    }
}
