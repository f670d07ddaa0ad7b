//! # B+tree Insert
//!
//! Recursive insertion with split propagation as an algebraic return
//! value. Each level returns one of:
//!
//! ```text
//! Done                        the subtree absorbed the key
//! Duplicate                   the key exists and no conflict flag was set
//! Split { pivot, right }      the child split; the parent inserts the
//!                             separator (and may split in turn)
//! ```
//!
//! The entry point consumes a `Split` escaping the root by growing the
//! tree: a fresh internal root with `ptr_left` at the old root.
//!
//! ## Ordering Guarantees
//!
//! - the new right page of a split is allocated before anything mutates,
//!   so an allocation failure aborts with the tree untouched
//! - record and extended-key blobs are allocated before slots shift
//! - cursors on shifted slots are uncoupled before any memory moves
//!
//! ## Split Pivots
//!
//! The pivot index is `count / 2`, except for record-number databases
//! with more than eight keys, which lean right (`count - 4`) so
//! monotonically increasing appends do not leave half-filled pages.
//!
//! ## Append Fast Path
//!
//! Sequential loads hit the last-insert hint: when the hinted leaf is the
//! rightmost, still cached, has room, and the key sorts after its last
//! key, the descent is skipped entirely.

use eyre::Result;

use crate::btree::cursor::Cursor;
use crate::btree::keylist::Bound;
use crate::btree::node::{LeafInsert, Node, NodeMut};
use crate::btree::records::{self, RecordRef};
use crate::btree::{BtreeIndex, InsertFlags};
use crate::error::DbError;
use crate::storage::page::{PageId, PageType};
use crate::storage::pager::Pager;

/// Result of inserting into a subtree.
pub(crate) enum InsertEffect {
    Done,
    Duplicate,
    Split { pivot: Vec<u8>, right: PageId },
}

pub fn insert(
    tree: &mut BtreeIndex,
    pager: &Pager,
    cursor: Option<&Cursor>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    tree.check_usable()?;
    tree.cfg.key_type.check_key(key)?;
    if key.len() > u16::MAX as usize {
        return Err(DbError::invalid("key longer than 65535 bytes"));
    }
    insert_inner(tree, pager, cursor, key, record, flags).map_err(|e| tree.fail(e))
}

fn insert_inner(
    tree: &mut BtreeIndex,
    pager: &Pager,
    cursor: Option<&Cursor>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    if let Some(leaf) = append_candidate(tree, pager, key)? {
        if try_append(tree, pager, leaf, cursor, key, record)? {
            return Ok(());
        }
    }

    match insert_recursive(tree, pager, tree.root, cursor, key, record, flags)? {
        InsertEffect::Done => Ok(()),
        InsertEffect::Duplicate => Err(DbError::DuplicateKey.into()),
        InsertEffect::Split { pivot, right } => {
            let old_root = tree.root;
            let mut page = pager.allocate(PageType::BtreeInternal)?;
            let new_root = page.id();
            let mut node = NodeMut::init_internal(page.data_mut(), &tree.cfg, new_root, old_root)?;
            node.internal_insert(pager, 0, &pivot, right)?;
            tree.root = new_root;
            log::debug!("root split: new root {} over {} and {}", new_root, old_root, right);
            Ok(())
        }
    }
}

/// The append fast path target, if the hint qualifies.
fn append_candidate(
    tree: &mut BtreeIndex,
    pager: &Pager,
    key: &[u8],
) -> Result<Option<PageId>> {
    let Some(hint) = tree.stats.insert_hint() else {
        return Ok(None);
    };
    let Some(page) = pager.fetch_cached(hint) else {
        return Ok(None);
    };
    let Ok(node) = Node::from_page(page.data(), &tree.cfg) else {
        return Ok(None);
    };
    if !node.is_leaf() || node.right_sibling() != 0 || node.count() == 0 || node.requires_split() {
        return Ok(None);
    }
    let last = node.key_out(pager, node.count() - 1)?;
    if tree.cfg.key_type.compare(key, &last) == std::cmp::Ordering::Greater {
        Ok(Some(hint))
    } else {
        Ok(None)
    }
}

/// Appends at the end of the rightmost leaf without descending. Never
/// splits: a compressed leaf that cannot make room reports false and the
/// insert takes the regular path, with nothing mutated.
fn try_append(
    tree: &mut BtreeIndex,
    pager: &Pager,
    leaf: PageId,
    cursor: Option<&Cursor>,
    key: &[u8],
    record: &[u8],
) -> Result<bool> {
    let entry = records::make_entry(pager, record)?;

    let appended = {
        let mut page = pager.fetch(leaf)?;
        let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
        let count = node.count();
        // Appending past the last slot shifts nothing, so no cursor
        // uncoupling is needed.
        match node.leaf_insert_key(pager, count, key)? {
            LeafInsert::Done(at) => {
                node.insert_record_entry(at, entry);
                node.set_count(count + 1);
                Some(at)
            }
            LeafInsert::NeedsSplit => None,
        }
    };

    match appended {
        Some(at) => {
            if let Some(cursor) = cursor {
                cursor.couple(leaf, at, 0);
            }
            tree.stats.record_insert(leaf);
            tree.stats.record_fast_track();
            Ok(true)
        }
        None => {
            records::free_entry(pager, entry)?;
            Ok(false)
        }
    }
}

fn insert_recursive(
    tree: &mut BtreeIndex,
    pager: &Pager,
    page_id: PageId,
    cursor: Option<&Cursor>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<InsertEffect> {
    let child = {
        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        if node.is_leaf() {
            None
        } else {
            Some(node.child_for(pager, key)?)
        }
    };

    match child {
        None => insert_in_leaf(tree, pager, page_id, cursor, key, record, flags),
        Some(child) => {
            match insert_recursive(tree, pager, child, cursor, key, record, flags)? {
                InsertEffect::Split { pivot, right } => {
                    insert_in_internal(tree, pager, page_id, &pivot, right)
                }
                other => Ok(other),
            }
        }
    }
}

fn insert_in_leaf(
    tree: &mut BtreeIndex,
    pager: &Pager,
    page_id: PageId,
    cursor: Option<&Cursor>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<InsertEffect> {
    let (bound, count) = {
        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        (node.find_lower_bound(pager, key)?, node.count())
    };

    if let Bound::Exact(slot) = bound {
        // Existing key: overwrite or extend the duplicate chain without
        // touching the key list.
        if flags.contains(InsertFlags::OVERWRITE) {
            let old = {
                let page = pager.fetch(page_id)?;
                Node::from_page(page.data(), &tree.cfg)?.record_entry(slot)?
            };
            let fresh = records::make_entry(pager, record)?;
            write_record(pager, tree, page_id, slot, fresh)?;
            records::free_entry(pager, old)?;
            if let Some(cursor) = cursor {
                cursor.couple(page_id, slot, 0);
            }
            tree.stats.record_insert(page_id);
            return Ok(InsertEffect::Done);
        }
        if flags.contains(InsertFlags::DUPLICATE) && tree.cfg.duplicates {
            let old = {
                let page = pager.fetch(page_id)?;
                Node::from_page(page.data(), &tree.cfg)?.record_entry(slot)?
            };
            let (table, dup) = records::append_duplicate(pager, old, record)?;
            write_record(pager, tree, page_id, slot, table)?;
            if let Some(cursor) = cursor {
                cursor.couple(page_id, slot, dup);
            }
            tree.stats.record_insert(page_id);
            return Ok(InsertEffect::Done);
        }
        return Ok(InsertEffect::Duplicate);
    }

    let slot = bound.slot();

    if !leaf_is_full(tree, pager, page_id)? {
        // Blob-backed records allocate before anything shifts, so a
        // failure here leaves the node untouched.
        let entry = records::make_entry(pager, record)?;
        tree.cursors
            .uncouple_from(pager, &tree.cfg, page_id, slot)?;

        let inserted = {
            let mut page = pager.fetch(page_id)?;
            let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
            match node.leaf_insert_key(pager, slot, key)? {
                LeafInsert::Done(at) => {
                    node.insert_record_entry(at, entry);
                    node.set_count(count + 1);
                    Some(at)
                }
                LeafInsert::NeedsSplit => None,
            }
        };

        match inserted {
            Some(at) => {
                if let Some(cursor) = cursor {
                    cursor.couple(page_id, at, 0);
                }
                tree.stats.record_insert(page_id);
                return Ok(InsertEffect::Done);
            }
            None => {
                // The compressed list ran out of block room below the
                // slot capacity; release the unused record blob and
                // split.
                records::free_entry(pager, entry)?;
            }
        }
    }

    split_leaf(tree, pager, page_id, cursor, key, record, flags)
}

fn leaf_is_full(tree: &BtreeIndex, pager: &Pager, page_id: PageId) -> Result<bool> {
    let page = pager.fetch(page_id)?;
    let node = Node::from_page(page.data(), &tree.cfg)?;
    Ok(node.requires_split())
}

fn write_record(
    pager: &Pager,
    tree: &BtreeIndex,
    page_id: PageId,
    slot: usize,
    entry: RecordRef,
) -> Result<()> {
    let mut page = pager.fetch(page_id)?;
    let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
    node.set_record_entry(slot, entry);
    Ok(())
}

fn split_pivot(tree: &BtreeIndex, count: usize) -> usize {
    if tree.cfg.record_number && count > 8 {
        count - 4
    } else {
        count / 2
    }
}

fn split_leaf(
    tree: &mut BtreeIndex,
    pager: &Pager,
    page_id: PageId,
    cursor: Option<&Cursor>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<InsertEffect> {
    let count = {
        let page = pager.fetch(page_id)?;
        Node::from_page(page.data(), &tree.cfg)?.count()
    };
    let pivot = split_pivot(tree, count);

    // Cursors at or beyond the pivot lose their slots to the new page.
    tree.cursors
        .uncouple_from(pager, &tree.cfg, page_id, pivot)?;

    // Allocate before mutating anything; failure leaves the tree intact.
    let mut right_page = pager.allocate(PageType::BtreeLeaf)?;
    let right_id = right_page.id();

    let (pivot_key, old_right) = {
        let mut left_page = pager.fetch(page_id)?;
        let mut left = NodeMut::from_page(left_page.data_mut(), &tree.cfg)?;
        let mut right = NodeMut::init_leaf(right_page.data_mut(), &tree.cfg, right_id)?;

        left.split_leaf_into(&mut right, pivot)?;

        let pivot_key = right.as_ref().key_out(pager, 0)?;
        let old_right = left.as_ref().right_sibling();

        right.set_right_sibling(old_right);
        right.set_left_sibling(page_id);
        left.set_right_sibling(right_id);

        (pivot_key, old_right)
    };

    if old_right != 0 {
        let mut page = pager.fetch(old_right)?;
        let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
        node.set_left_sibling(right_id);
    }

    // The requested key goes into whichever half owns its range, via the
    // no-split path.
    let target = if tree.cfg.key_type.compare(key, &pivot_key) == std::cmp::Ordering::Less {
        page_id
    } else {
        right_id
    };

    match insert_in_leaf(tree, pager, target, cursor, key, record, flags)? {
        InsertEffect::Done => {}
        InsertEffect::Duplicate => return Ok(InsertEffect::Duplicate),
        InsertEffect::Split { .. } => {
            return Err(DbError::internal("split half rejected the displaced key"))
        }
    }

    Ok(InsertEffect::Split {
        pivot: pivot_key,
        right: right_id,
    })
}

fn insert_in_internal(
    tree: &mut BtreeIndex,
    pager: &Pager,
    page_id: PageId,
    pivot: &[u8],
    right_child: PageId,
) -> Result<InsertEffect> {
    let (bound, count, capacity) = {
        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        (
            node.find_lower_bound(pager, pivot)?,
            node.count(),
            node.capacity(),
        )
    };

    // A re-reported separator overwrites its child pointer.
    if let Bound::Exact(slot) = bound {
        let mut page = pager.fetch(page_id)?;
        let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
        node.set_child_at(slot, right_child);
        return Ok(InsertEffect::Done);
    }

    let slot = bound.slot();

    if count < capacity {
        let mut page = pager.fetch(page_id)?;
        let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
        node.internal_insert(pager, slot, pivot, right_child)?;
        return Ok(InsertEffect::Done);
    }

    split_internal(tree, pager, page_id, pivot, right_child)
}

fn split_internal(
    tree: &mut BtreeIndex,
    pager: &Pager,
    page_id: PageId,
    key: &[u8],
    right_child: PageId,
) -> Result<InsertEffect> {
    let count = {
        let page = pager.fetch(page_id)?;
        Node::from_page(page.data(), &tree.cfg)?.count()
    };
    let pivot = split_pivot(tree, count);

    let mut right_page = pager.allocate(PageType::BtreeInternal)?;
    let right_id = right_page.id();

    let promoted = {
        let mut left_page = pager.fetch(page_id)?;
        let mut left = NodeMut::from_page(left_page.data_mut(), &tree.cfg)?;

        let promoted = left.as_ref().key_out(pager, pivot)?;

        let mut right = NodeMut::init_internal(right_page.data_mut(), &tree.cfg, right_id, 0)?;
        left.split_internal_into(pager, &mut right, pivot)?;
        promoted
    };

    let target = if tree.cfg.key_type.compare(key, &promoted) == std::cmp::Ordering::Less {
        page_id
    } else {
        right_id
    };

    match insert_in_internal(tree, pager, target, key, right_child)? {
        InsertEffect::Done => {}
        other => return Ok(other),
    }

    Ok(InsertEffect::Split {
        pivot: promoted,
        right: right_id,
    })
}
