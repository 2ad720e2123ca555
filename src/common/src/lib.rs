// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Helpers shared by every crate in the workspace: operation results,
//! metrics bootstrap, and byte-size constants.

pub mod metrics;

mod op_status;

pub use op_status::{OpResult, OpStatus};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

metrics::metrics_sanity!();
