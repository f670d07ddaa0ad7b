//! # Ordered Scans
//!
//! Streaming, key-ordered reads over a database:
//!
//! - [`LeafScan`]: walks the leaf sibling chain of a B+tree, emitting
//!   `(key, record)` pairs in comparator order
//! - [`merge::MergeScan`]: merges a leaf walk with a committed-staging
//!   snapshot, staged entries overriding equal tree keys
//!
//! ## Cancellation
//!
//! Long scans poll a [`CancelToken`] at leaf boundaries only; work inside
//! one leaf always runs to completion. A cancelled scan stops with an
//! error and has no side effects.

pub mod merge;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;

use crate::btree::node::Node;
use crate::btree::records;
use crate::btree::BtreeIndex;
use crate::storage::page::PageId;
use crate::storage::pager::Pager;

/// Cooperative cancellation handle, cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Ordered stream over the leaf chain. Each leaf is materialized whole
/// when the walk enters it, so page pins never outlive a call.
pub struct LeafScan<'a> {
    tree: &'a BtreeIndex,
    pager: &'a Pager,
    next_leaf: PageId,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    skip_below: Option<Vec<u8>>,
    cancel: Option<CancelToken>,
}

impl<'a> LeafScan<'a> {
    /// Opens a scan at the first key >= `start` (or the smallest key).
    pub fn new(
        tree: &'a BtreeIndex,
        pager: &'a Pager,
        start: Option<&[u8]>,
        cancel: Option<CancelToken>,
    ) -> Result<Self> {
        tree.check_usable()?;
        let next_leaf = match start {
            Some(key) => tree.descend_to_leaf(pager, key)?,
            None => tree.first_leaf(pager)?,
        };
        Ok(Self {
            tree,
            pager,
            next_leaf,
            buffer: VecDeque::new(),
            skip_below: start.map(|s| s.to_vec()),
            cancel,
        })
    }

    fn load_next_leaf(&mut self) -> Result<bool> {
        loop {
            if self.next_leaf == 0 {
                return Ok(false);
            }
            if let Some(cancel) = &self.cancel {
                if cancel.is_cancelled() {
                    eyre::bail!("scan cancelled");
                }
            }

            let page = self.pager.fetch(self.next_leaf)?;
            let node = Node::from_page(page.data(), &self.tree.cfg)?;
            for slot in 0..node.count() {
                let key = node.key_out(self.pager, slot)?;
                if let Some(skip) = &self.skip_below {
                    if self.tree.cfg.key_type.compare(&key, skip) == std::cmp::Ordering::Less {
                        continue;
                    }
                }
                let record = records::resolve(self.pager, node.record_entry(slot)?, 0)?;
                self.buffer.push_back((key, record));
            }
            self.next_leaf = node.right_sibling();

            if !self.buffer.is_empty() {
                self.skip_below = None;
                return Ok(true);
            }
        }
    }

    pub fn next_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.buffer.is_empty() && !self.load_next_leaf()? {
            return Ok(None);
        }
        Ok(self.buffer.pop_front())
    }
}
