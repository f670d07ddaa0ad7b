//! # B+tree Statistics
//!
//! Rolling per-index hints: the last leaf touched by an insert and the
//! last leaf touched by a find. Both feed cache-only fast-track attempts;
//! a wrong hint costs nothing beyond the probe, and hints are never
//! persisted.

use crate::storage::page::PageId;

#[derive(Debug, Default)]
pub struct BtreeStatistics {
    last_insert_leaf: Option<PageId>,
    last_find_leaf: Option<PageId>,
    find_hits: u64,
    find_misses: u64,
    fast_track_hits: u64,
}

impl BtreeStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_hint(&self) -> Option<PageId> {
        self.last_find_leaf
    }

    pub fn insert_hint(&self) -> Option<PageId> {
        self.last_insert_leaf
    }

    pub fn record_find(&mut self, leaf: PageId) {
        self.last_find_leaf = Some(leaf);
        self.find_hits += 1;
    }

    pub fn record_find_failed(&mut self) {
        self.find_misses += 1;
    }

    pub fn record_insert(&mut self, leaf: PageId) {
        self.last_insert_leaf = Some(leaf);
    }

    pub fn record_fast_track(&mut self) {
        self.fast_track_hits += 1;
    }

    /// Drops hints that reference a page that no longer holds keys (after
    /// a split moved them or the leaf was unlinked).
    pub fn invalidate(&mut self, page: PageId) {
        if self.last_insert_leaf == Some(page) {
            self.last_insert_leaf = None;
        }
        if self.last_find_leaf == Some(page) {
            self.last_find_leaf = None;
        }
    }

    pub fn fast_track_hits(&self) -> u64 {
        self.fast_track_hits
    }

    pub fn find_hits(&self) -> u64 {
        self.find_hits
    }

    pub fn find_misses(&self) -> u64 {
        self.find_misses
    }
}
