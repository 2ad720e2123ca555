// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Workspace metrics bootstrap. Every crate registers static metriken
//! metrics; [`init`] stamps the process-level gauges once during engine
//! startup, and [`metrics_sanity!`] generates the per-crate registration
//! test that keeps the combined registry well-formed.

use metriken::*;
use std::time::{SystemTime, UNIX_EPOCH};

/// Creates a test that checks the metric registrations visible to this
/// crate: names must be unique across the workspace and every metric
/// must carry a description, since the stats surface exposes them
/// verbatim.
#[macro_export]
#[rustfmt::skip]
macro_rules! metrics_sanity {
    () => {
        #[cfg(test)]
        mod __metrics_sanity {
            #[test]
            fn names_are_unique_and_described() {
                let mut seen = std::collections::HashSet::new();
                for metric in metriken::metrics().static_metrics() {
                    let name = metric.name();
                    assert!(
                        seen.insert(name.to_string()),
                        "found duplicate metric name '{name}'"
                    );
                    let described = metric
                        .description()
                        .map(|d| !d.trim().is_empty())
                        .unwrap_or(false);
                    assert!(described, "metric '{name}' is missing a description");
                }
            }
        }
    };
}

pub use metrics_sanity;

#[metric(name = "pid", description = "the process id")]
pub static PID: Gauge = Gauge::new();

#[metric(
    name = "startup_unix_seconds",
    description = "time the engine started, in seconds since the unix epoch"
)]
pub static STARTUP_UNIX_SECONDS: Gauge = Gauge::new();

/// Stamps the process-level gauges. Called once while the engine is
/// brought up, before any shard starts taking commands.
pub fn init() {
    PID.set(std::process::id().into());
    STARTUP_UNIX_SECONDS.set(unix_now_seconds() as i64);
}

fn unix_now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_stamps_process_gauges() {
        init();
        assert!(PID.value() > 0);
        assert!(STARTUP_UNIX_SECONDS.value() > 0);
    }
}
