//! # Merge Reader
//!
//! Merges two ordered `(key, record)` sources, the B+tree leaf walk and
//! a snapshot of the committed transaction staging, into one strictly
//! key-ordered stream.
//!
//! ## Protocol
//!
//! Peek both heads and emit the smaller. On equal keys the staged entry
//! wins and the tree entry is discarded: the staged entry is a pending
//! overwrite of the same key. The output therefore holds exactly
//! `|tree ∪ staged|` rows.
//!
//! Range bounds are enforced against both sources independently: both
//! start at the range's lower bound, and the merge stops as soon as
//! either head reaches the exclusive end key.

use std::cmp::Ordering;

use eyre::Result;

use crate::encoding::keys::KeyType;
use crate::scan::LeafScan;
use crate::txn::StagedEntry;

pub struct MergeScan<'a> {
    key_type: KeyType,
    tree: LeafScan<'a>,
    staged: std::vec::IntoIter<StagedEntry>,
    tree_head: Option<(Vec<u8>, Vec<u8>)>,
    staged_head: Option<StagedEntry>,
    /// Exclusive upper bound.
    end: Option<Vec<u8>>,
    primed: bool,
}

impl<'a> MergeScan<'a> {
    pub fn new(
        key_type: KeyType,
        tree: LeafScan<'a>,
        staged: Vec<StagedEntry>,
        end: Option<Vec<u8>>,
    ) -> Self {
        Self {
            key_type,
            tree,
            staged: staged.into_iter(),
            tree_head: None,
            staged_head: None,
            end,
            primed: false,
        }
    }

    fn prime(&mut self) -> Result<()> {
        if !self.primed {
            self.tree_head = self.tree.next_row()?;
            self.staged_head = self.staged.next();
            self.primed = true;
        }
        Ok(())
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Some(end) => self.key_type.compare(key, end) != Ordering::Less,
            None => false,
        }
    }

    pub fn next_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.prime()?;

        // Drop heads that crossed the exclusive end bound.
        if let Some((key, _)) = &self.tree_head {
            if self.past_end(key) {
                self.tree_head = None;
            }
        }
        if let Some(entry) = &self.staged_head {
            if self.past_end(&entry.key) {
                self.staged_head = None;
            }
        }

        match (self.tree_head.take(), self.staged_head.take()) {
            (None, None) => Ok(None),
            (Some((key, record)), None) => {
                self.tree_head = self.tree.next_row()?;
                Ok(Some((key, record)))
            }
            (None, Some(entry)) => {
                self.staged_head = self.staged.next();
                Ok(Some((entry.key, entry.record)))
            }
            (Some((tree_key, tree_record)), Some(entry)) => {
                match self.key_type.compare(&tree_key, &entry.key) {
                    Ordering::Less => {
                        self.tree_head = self.tree.next_row()?;
                        self.staged_head = Some(entry);
                        Ok(Some((tree_key, tree_record)))
                    }
                    Ordering::Greater => {
                        self.tree_head = Some((tree_key, tree_record));
                        self.staged_head = self.staged.next();
                        Ok(Some((entry.key, entry.record)))
                    }
                    Ordering::Equal => {
                        // The staged entry overwrites the committed one.
                        self.tree_head = self.tree.next_row()?;
                        self.staged_head = self.staged.next();
                        Ok(Some((entry.key, entry.record)))
                    }
                }
            }
        }
    }
}
