//! # B+tree Cursors
//!
//! A cursor is a position in the tree: *nil* (no position), *coupled*
//! (page id + slot + duplicate index) or *uncoupled* (a materialized copy
//! of the key). Coupled positions are plain values, never pointers into
//! page memory, so cache eviction cannot invalidate them. Only
//! operations that shift slots (insert, split, erase) force cursors into
//! the uncoupled state, after materializing the key they rested on.
//!
//! ## Ownership
//!
//! Callers own cursors; the index keeps weak references for uncoupling
//! notification. Closing (or dropping) a cursor leaves a dead weak entry
//! that the registry sweeps on its next pass; there is no back-pointer
//! cycle.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use eyre::Result;
use smallvec::SmallVec;

use crate::btree::node::{IndexConfig, Node};
use crate::storage::page::PageId;
use crate::storage::pager::Pager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPos {
    Nil,
    Coupled {
        page: PageId,
        slot: u32,
        dup: u32,
    },
    Uncoupled {
        key: Vec<u8>,
        dup: u32,
    },
}

/// Caller-owned cursor handle.
#[derive(Debug)]
pub struct Cursor {
    pub(crate) db_id: u16,
    pub(crate) pos: Rc<RefCell<CursorPos>>,
}

impl Cursor {
    pub(crate) fn new(db_id: u16) -> Self {
        Self {
            db_id,
            pos: Rc::new(RefCell::new(CursorPos::Nil)),
        }
    }

    pub fn db_id(&self) -> u16 {
        self.db_id
    }

    pub fn is_nil(&self) -> bool {
        matches!(*self.pos.borrow(), CursorPos::Nil)
    }

    pub(crate) fn set(&self, pos: CursorPos) {
        *self.pos.borrow_mut() = pos;
    }

    pub(crate) fn get(&self) -> CursorPos {
        self.pos.borrow().clone()
    }

    pub(crate) fn couple(&self, page: PageId, slot: usize, dup: u32) {
        self.set(CursorPos::Coupled {
            page,
            slot: slot as u32,
            dup,
        });
    }
}

/// Weak-reference registry of the cursors open on one index.
#[derive(Default)]
pub struct CursorRegistry {
    cursors: Vec<Weak<RefCell<CursorPos>>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cursor: &Cursor) {
        self.sweep();
        self.cursors.push(Rc::downgrade(&cursor.pos));
    }

    fn sweep(&mut self) {
        self.cursors.retain(|weak| weak.strong_count() > 0);
    }

    fn live(&self) -> SmallVec<[Rc<RefCell<CursorPos>>; 4]> {
        self.cursors.iter().filter_map(Weak::upgrade).collect()
    }

    /// Uncouples every cursor resting on `page` at `start_slot` or beyond,
    /// materializing its key first. Must run before any slot shift or
    /// split movement.
    pub fn uncouple_from(
        &mut self,
        pager: &Pager,
        cfg: &IndexConfig,
        page_id: PageId,
        start_slot: usize,
    ) -> Result<()> {
        self.sweep();
        let live = self.live();
        if live.is_empty() {
            return Ok(());
        }

        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), cfg)?;

        for pos in live {
            let current = pos.borrow().clone();
            if let CursorPos::Coupled { page, slot, dup } = current {
                if page == page_id && slot as usize >= start_slot {
                    let key = node.key_out(pager, slot as usize)?;
                    *pos.borrow_mut() = CursorPos::Uncoupled { key, dup };
                }
            }
        }
        Ok(())
    }

    /// Transitions cursors for an erase at (`page`, `slot`): cursors on
    /// the erased slot go nil, cursors beyond it uncouple.
    pub fn on_erase(
        &mut self,
        pager: &Pager,
        cfg: &IndexConfig,
        page_id: PageId,
        slot: usize,
    ) -> Result<()> {
        self.uncouple_from(pager, cfg, page_id, slot + 1)?;
        for pos in self.live() {
            let current = pos.borrow().clone();
            if let CursorPos::Coupled {
                page, slot: at, ..
            } = current
            {
                if page == page_id && at as usize == slot {
                    *pos.borrow_mut() = CursorPos::Nil;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cursor_is_nil() {
        let cursor = Cursor::new(1);
        assert!(cursor.is_nil());
        assert_eq!(cursor.db_id(), 1);
    }

    #[test]
    fn couple_and_read_back() {
        let cursor = Cursor::new(1);
        cursor.couple(42, 3, 0);
        assert!(!cursor.is_nil());
        assert_eq!(
            cursor.get(),
            CursorPos::Coupled {
                page: 42,
                slot: 3,
                dup: 0
            }
        );
    }

    #[test]
    fn registry_drops_dead_cursors() {
        let mut registry = CursorRegistry::new();
        {
            let cursor = Cursor::new(1);
            registry.register(&cursor);
            assert_eq!(registry.live().len(), 1);
        }
        assert!(registry.live().is_empty());
    }
}
