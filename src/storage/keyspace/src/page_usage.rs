// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Allocator awareness for defragmentation. An allocator that can report
//! per-page utilization tells the containers which elements are worth
//! re-allocating; allocators that cannot answer use [`NeverUnderUtilized`]
//! and the engine simply skips defragmentation.

pub trait PageUsage {
    /// Returns true when the page backing `obj` is under-utilized and the
    /// object should be moved to a fresh allocation.
    fn is_page_for_object_under_utilized(&self, obj: &[u8]) -> bool;
}

/// Default implementation for allocators without page statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverUnderUtilized;

impl PageUsage for NeverUnderUtilized {
    fn is_page_for_object_under_utilized(&self, _obj: &[u8]) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) struct AlwaysUnderUtilized;

#[cfg(test)]
impl PageUsage for AlwaysUnderUtilized {
    fn is_page_for_object_under_utilized(&self, _obj: &[u8]) -> bool {
        true
    }
}
