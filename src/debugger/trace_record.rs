//! Per-page execution-history cache consulted by trace stop conditions.
//!
//! Each tracked page carries one hit counter per byte. The trace engine
//! records every executed address and can stop either on the first byte that
//! was never executed before or on the first byte that was.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::engine::{page_base, PAGE_SIZE};

/// Execution-hit counters, one `u32` per byte of every tracked page.
#[derive(Debug, Default)]
pub struct TraceRecord {
    pages: RwLock<HashMap<u64, Box<[u32]>>>,
}

impl TraceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    fn blank_page() -> Box<[u32]> {
        vec![0u32; PAGE_SIZE as usize].into_boxed_slice()
    }

    /// Start tracking the page containing `address`.
    pub fn track_page(&self, address: u64) {
        let mut pages = self.pages.write().unwrap();
        pages
            .entry(page_base(address))
            .or_insert_with(Self::blank_page);
    }

    /// Whether the page containing `address` is tracked.
    pub fn is_tracked(&self, address: u64) -> bool {
        self.pages.read().unwrap().contains_key(&page_base(address))
    }

    /// Execution count recorded for `address`, 0 when untracked.
    pub fn hit_count(&self, address: u64) -> u32 {
        let pages = self.pages.read().unwrap();
        pages
            .get(&page_base(address))
            .map_or(0, |page| page[(address % PAGE_SIZE) as usize])
    }

    /// Record one execution of `address`, tracking its page if needed.
    /// Returns the count before this execution.
    pub fn record(&self, address: u64) -> u32 {
        let mut pages = self.pages.write().unwrap();
        let page = pages
            .entry(page_base(address))
            .or_insert_with(Self::blank_page);
        let slot = &mut page[(address % PAGE_SIZE) as usize];
        let prior = *slot;
        *slot = slot.saturating_add(1);
        prior
    }

    pub fn tracked_page_count(&self) -> usize {
        self.pages.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.pages.write().unwrap().clear();
    }
}
