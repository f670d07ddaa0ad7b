//! # B+tree Index
//!
//! The ordered index at the heart of LoamDB. Keys live in the leaves;
//! internal nodes hold separators and child pointers under the
//! left-separator convention; leaves form a doubly linked sibling chain in
//! ascending key order.
//!
//! ## Structure
//!
//! ```text
//!                   [internal]                 (root)
//!                  /    |     \
//!         [leaf] <-> [leaf] <-> [leaf]         (sibling chain)
//! ```
//!
//! ## Invariants
//!
//! - keys are strictly ascending within every node
//! - for separators k0..kn-1 with children c-1, c0..cn-1: every key in
//!   c-1 < k0 <= keys in c0 < k1 <= ...
//! - the leaf sibling walk equals the in-order traversal
//! - every leaf holds at least one key, except the empty-tree root
//!
//! ## Modification Protocol
//!
//! Insertion descends recursively and propagates splits as an algebraic
//! return value (`InsertEffect::Split { pivot, right }`) that the parent
//! consumes; no scratchpad threading, no ambient state. Cursor
//! uncoupling runs before every slot shift. Erase unlinks emptied leaves
//! so the leaf invariant holds.
//!
//! ## Corruption
//!
//! A decoder failure inside the compressed key list marks the index
//! unusable; every subsequent operation fails fast with the internal
//! status.
//!
//! ## Module Organization
//!
//! - [`node`]: typed page views and the key-list dispatch
//! - [`keylist`]: the three key-list strategies
//! - [`records`]: record entries, blobs and duplicate tables
//! - [`find`] / [`insert`] / [`erase`]: the tree operations
//! - [`cursor`]: caller-owned positions with uncoupling
//! - [`stats`]: fast-track hints

pub mod cursor;
pub mod erase;
pub mod find;
pub mod insert;
pub mod keylist;
pub mod node;
pub mod records;
pub mod stats;

use bitflags::bitflags;
use eyre::Result;

use crate::btree::cursor::{Cursor, CursorPos, CursorRegistry};
use crate::btree::keylist::Bound;
use crate::btree::node::{IndexConfig, Node, NodeMut};
use crate::btree::stats::BtreeStatistics;
use crate::error::DbError;
use crate::storage::page::{PageId, PageType};
use crate::storage::pager::Pager;

bitflags! {
    /// Match flags for [`find`](BtreeIndex::find).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FindFlags: u32 {
        /// Accept the greatest key below a missing needle.
        const LT_MATCH = 0b001;
        /// Accept the smallest key above a missing needle.
        const GT_MATCH = 0b010;
        /// Skip materializing the matched key for approximate results.
        const DONT_LOAD_KEY = 0b100;
    }
}

bitflags! {
    /// Conflict handling for [`insert`](BtreeIndex::insert).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Replace the record of an existing key.
        const OVERWRITE = 0b01;
        /// Append to the key's duplicate chain.
        const DUPLICATE = 0b10;
    }
}

/// How a find result relates to the requested key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approx {
    Exact,
    /// The result is the greatest key below the needle.
    Lower,
    /// The result is the smallest key above the needle.
    Greater,
}

pub struct BtreeIndex {
    pub(crate) cfg: IndexConfig,
    pub(crate) root: PageId,
    pub(crate) stats: BtreeStatistics,
    pub(crate) cursors: CursorRegistry,
    corrupted: bool,
}

impl BtreeIndex {
    /// Creates a new index with an empty leaf root.
    pub fn create(pager: &Pager, cfg: IndexConfig) -> Result<Self> {
        cfg.validate()?;
        let mut root = pager.allocate(PageType::BtreeLeaf)?;
        let id = root.id();
        NodeMut::init_leaf(root.data_mut(), &cfg, id)?;
        Ok(Self {
            cfg,
            root: id,
            stats: BtreeStatistics::new(),
            cursors: CursorRegistry::new(),
            corrupted: false,
        })
    }

    /// Opens an existing index rooted at `root`.
    pub fn open(cfg: IndexConfig, root: PageId) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            root,
            stats: BtreeStatistics::new(),
            cursors: CursorRegistry::new(),
            corrupted: false,
        })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn config(&self) -> &IndexConfig {
        &self.cfg
    }

    pub fn statistics(&self) -> &BtreeStatistics {
        &self.stats
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.corrupted {
            return Err(DbError::internal("index marked unusable after corruption"));
        }
        Ok(())
    }

    /// Poisons the index when a failure carries the internal status;
    /// everything else passes through untouched.
    pub(crate) fn fail(&mut self, err: eyre::Report) -> eyre::Report {
        if matches!(DbError::of(&err), Some(DbError::Internal(_))) {
            log::warn!("index marked unusable: {err:#}");
            self.corrupted = true;
        }
        err
    }

    /// Walks down to the leaf whose key range covers `key`.
    pub(crate) fn descend_to_leaf(&self, pager: &Pager, key: &[u8]) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let page = pager.fetch(current)?;
            let node = Node::from_page(page.data(), &self.cfg)?;
            if node.is_leaf() {
                return Ok(current);
            }
            current = node.child_for(pager, key)?;
        }
    }

    /// Leftmost leaf of the tree.
    pub(crate) fn first_leaf(&self, pager: &Pager) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let page = pager.fetch(current)?;
            let node = Node::from_page(page.data(), &self.cfg)?;
            if node.is_leaf() {
                return Ok(current);
            }
            current = node.ptr_left();
        }
    }

    /// Rightmost leaf of the tree.
    pub(crate) fn last_leaf(&self, pager: &Pager) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let page = pager.fetch(current)?;
            let node = Node::from_page(page.data(), &self.cfg)?;
            if node.is_leaf() {
                return Ok(current);
            }
            let count = node.count();
            current = if count == 0 {
                node.ptr_left()
            } else {
                node.child_at(count - 1)
            };
        }
    }

    // ------------------------------------------------------------------
    // cursor operations
    // ------------------------------------------------------------------

    pub fn cursor_create(&mut self, db_id: u16) -> Cursor {
        let cursor = Cursor::new(db_id);
        self.cursors.register(&cursor);
        cursor
    }

    /// Couples a cursor to the first key >= `key` (the lower bound).
    pub fn lower_bound(&mut self, pager: &Pager, cursor: &Cursor, key: &[u8]) -> Result<()> {
        self.check_usable()?;
        let leaf = self.descend_to_leaf(pager, key)?;
        let (page_id, slot) = {
            let page = pager.fetch(leaf)?;
            let node = Node::from_page(page.data(), &self.cfg)?;
            let slot = node.find_lower_bound(pager, key)?.slot();
            if slot < node.count() {
                (leaf, slot)
            } else if node.right_sibling() != 0 {
                (node.right_sibling(), 0)
            } else {
                cursor.set(CursorPos::Nil);
                return Err(DbError::KeyNotFound.into());
            }
        };
        cursor.couple(page_id, slot, 0);
        Ok(())
    }

    /// Moves a cursor to the first key of the tree.
    pub fn cursor_first(&mut self, pager: &Pager, cursor: &Cursor) -> Result<()> {
        self.check_usable()?;
        let leaf = self.first_leaf(pager)?;
        let page = pager.fetch(leaf)?;
        let node = Node::from_page(page.data(), &self.cfg)?;
        if node.count() == 0 {
            cursor.set(CursorPos::Nil);
            return Err(DbError::KeyNotFound.into());
        }
        cursor.couple(leaf, 0, 0);
        Ok(())
    }

    /// Moves a cursor to the last key (and last duplicate) of the tree.
    pub fn cursor_last(&mut self, pager: &Pager, cursor: &Cursor) -> Result<()> {
        self.check_usable()?;
        let leaf = self.last_leaf(pager)?;
        let page = pager.fetch(leaf)?;
        let node = Node::from_page(page.data(), &self.cfg)?;
        if node.count() == 0 {
            cursor.set(CursorPos::Nil);
            return Err(DbError::KeyNotFound.into());
        }
        let slot = node.count() - 1;
        let dups = records::duplicate_count(pager, node.record_entry(slot)?)?;
        cursor.couple(leaf, slot, dups - 1);
        Ok(())
    }

    /// Advances a cursor: next duplicate, next slot, or the right
    /// sibling's first slot. An uncoupled cursor re-couples by searching
    /// for its stored key first.
    pub fn cursor_next(&mut self, pager: &Pager, cursor: &Cursor) -> Result<()> {
        self.check_usable()?;
        let (page_id, slot, dup) = match cursor.get() {
            CursorPos::Nil => return Err(DbError::CursorIsNil.into()),
            CursorPos::Coupled { page, slot, dup } => (page, slot as usize, dup),
            CursorPos::Uncoupled { key, dup } => {
                match self.recouple(pager, &key)? {
                    Recoupled::Exact(page, slot) => (page, slot, dup),
                    // The stored key is gone; its lower bound is already
                    // the next key.
                    Recoupled::Gap(page, slot) => {
                        cursor.couple(page, slot, 0);
                        return Ok(());
                    }
                    Recoupled::End => return Err(DbError::KeyNotFound.into()),
                }
            }
        };

        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &self.cfg)?;

        if slot < node.count() {
            let dups = records::duplicate_count(pager, node.record_entry(slot)?)?;
            if dup + 1 < dups {
                cursor.couple(page_id, slot, dup + 1);
                return Ok(());
            }
        }

        if slot + 1 < node.count() {
            cursor.couple(page_id, slot + 1, 0);
            return Ok(());
        }

        let right = node.right_sibling();
        if right != 0 {
            cursor.couple(right, 0, 0);
            return Ok(());
        }
        Err(DbError::KeyNotFound.into())
    }

    /// Steps a cursor backwards, mirroring [`Self::cursor_next`].
    pub fn cursor_prev(&mut self, pager: &Pager, cursor: &Cursor) -> Result<()> {
        self.check_usable()?;
        let (page_id, slot, dup) = match cursor.get() {
            CursorPos::Nil => return Err(DbError::CursorIsNil.into()),
            CursorPos::Coupled { page, slot, dup } => (page, slot as usize, dup),
            CursorPos::Uncoupled { key, dup } => match self.recouple(pager, &key)? {
                Recoupled::Exact(page, slot) => (page, slot, dup),
                Recoupled::Gap(page, slot) => {
                    // The stored key is gone; the previous key is one step
                    // left of its lower bound.
                    return self.step_left(pager, cursor, page, slot);
                }
                Recoupled::End => {
                    let leaf = self.last_leaf(pager)?;
                    let page = pager.fetch(leaf)?;
                    let node = Node::from_page(page.data(), &self.cfg)?;
                    if node.count() == 0 {
                        return Err(DbError::KeyNotFound.into());
                    }
                    cursor.couple(leaf, node.count() - 1, 0);
                    return Ok(());
                }
            },
        };

        if dup > 0 {
            cursor.couple(page_id, slot, dup - 1);
            return Ok(());
        }
        self.step_left(pager, cursor, page_id, slot)
    }

    fn step_left(
        &mut self,
        pager: &Pager,
        cursor: &Cursor,
        page_id: PageId,
        slot: usize,
    ) -> Result<()> {
        if slot > 0 {
            let page = pager.fetch(page_id)?;
            let node = Node::from_page(page.data(), &self.cfg)?;
            let dups = records::duplicate_count(pager, node.record_entry(slot - 1)?)?;
            cursor.couple(page_id, slot - 1, dups - 1);
            return Ok(());
        }

        let left = {
            let page = pager.fetch(page_id)?;
            Node::from_page(page.data(), &self.cfg)?.left_sibling()
        };
        if left == 0 {
            return Err(DbError::KeyNotFound.into());
        }
        let page = pager.fetch(left)?;
        let node = Node::from_page(page.data(), &self.cfg)?;
        if node.count() == 0 {
            return Err(DbError::KeyNotFound.into());
        }
        let slot = node.count() - 1;
        let dups = records::duplicate_count(pager, node.record_entry(slot)?)?;
        cursor.couple(left, slot, dups - 1);
        Ok(())
    }

    /// Reads the key under a cursor. Uncoupled cursors answer from their
    /// materialized copy without touching the tree.
    pub fn cursor_key(&self, pager: &Pager, cursor: &Cursor) -> Result<Vec<u8>> {
        self.check_usable()?;
        match cursor.get() {
            CursorPos::Nil => Err(DbError::CursorIsNil.into()),
            CursorPos::Uncoupled { key, .. } => Ok(key),
            CursorPos::Coupled { page, slot, .. } => {
                let page = pager.fetch(page)?;
                let node = Node::from_page(page.data(), &self.cfg)?;
                node.key_out(pager, slot as usize)
            }
        }
    }

    /// Reads the record under a cursor, re-coupling an uncoupled cursor
    /// by exact search first.
    pub fn cursor_record(&mut self, pager: &Pager, cursor: &Cursor) -> Result<Vec<u8>> {
        self.check_usable()?;
        let (page_id, slot, dup) = match cursor.get() {
            CursorPos::Nil => return Err(DbError::CursorIsNil.into()),
            CursorPos::Coupled { page, slot, dup } => (page, slot as usize, dup),
            CursorPos::Uncoupled { key, dup } => match self.recouple(pager, &key)? {
                Recoupled::Exact(page, slot) => {
                    cursor.couple(page, slot, dup);
                    (page, slot, dup)
                }
                _ => return Err(DbError::KeyNotFound.into()),
            },
        };
        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &self.cfg)?;
        records::resolve(pager, node.record_entry(slot)?, dup)
    }

    fn recouple(&self, pager: &Pager, key: &[u8]) -> Result<Recoupled> {
        let leaf = self.descend_to_leaf(pager, key)?;
        let page = pager.fetch(leaf)?;
        let node = Node::from_page(page.data(), &self.cfg)?;
        match node.find_lower_bound(pager, key)? {
            Bound::Exact(slot) => Ok(Recoupled::Exact(leaf, slot)),
            Bound::Insert(slot) if slot < node.count() => Ok(Recoupled::Gap(leaf, slot)),
            Bound::Insert(_) => {
                let right = node.right_sibling();
                if right != 0 {
                    Ok(Recoupled::Gap(right, 0))
                } else {
                    Ok(Recoupled::End)
                }
            }
        }
    }
}

enum Recoupled {
    /// The stored key still exists at this position.
    Exact(PageId, usize),
    /// The stored key is gone; this is its lower bound.
    Gap(PageId, usize),
    /// The stored key is greater than everything in the tree.
    End,
}
