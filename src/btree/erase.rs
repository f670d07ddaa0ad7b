//! # B+tree Erase
//!
//! Erase by key. Record blobs and duplicate tables are released, cursors
//! on the erased key go nil, and cursors beyond it uncouple. A leaf that
//! runs empty is unlinked from the sibling chain, removed from its
//! parent and returned to the freelist, keeping the "every leaf holds at
//! least one key" invariant (the empty-tree root excepted).
//!
//! Underflowed nodes are not rebalanced: internal nodes may shrink to a
//! bare `ptr_left` and stay routable. An internal root with no
//! separators left collapses into its single child, and erasing the last
//! key of the tree leaves an empty leaf root.

use eyre::Result;

use crate::btree::keylist::Bound;
use crate::btree::node::{Node, NodeMut};
use crate::btree::records;
use crate::btree::BtreeIndex;
use crate::error::DbError;
use crate::storage::page::PageId;
use crate::storage::pager::Pager;

pub fn erase(tree: &mut BtreeIndex, pager: &Pager, key: &[u8]) -> Result<()> {
    tree.check_usable()?;
    tree.cfg.key_type.check_key(key)?;
    erase_inner(tree, pager, key).map_err(|e| tree.fail(e))
}

fn erase_inner(tree: &mut BtreeIndex, pager: &Pager, key: &[u8]) -> Result<()> {
    // Remember the descent path for parent fix-ups if the leaf empties.
    let mut path: Vec<PageId> = Vec::new();
    let mut current = tree.root;
    loop {
        let page = pager.fetch(current)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        if node.is_leaf() {
            break;
        }
        path.push(current);
        current = node.child_for(pager, key)?;
    }
    let leaf = current;

    let (slot, count, entry) = {
        let page = pager.fetch(leaf)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        match node.find_lower_bound(pager, key)? {
            Bound::Exact(slot) => (slot, node.count(), node.record_entry(slot)?),
            Bound::Insert(_) => {
                tree.stats.record_find_failed();
                return Err(DbError::KeyNotFound.into());
            }
        }
    };

    tree.cursors.on_erase(pager, &tree.cfg, leaf, slot)?;
    records::free_entry(pager, entry)?;

    {
        let mut page = pager.fetch(leaf)?;
        let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
        node.leaf_remove_key(pager, slot)?;
        node.remove_record_entry(slot);
        node.set_count(count - 1);
    }

    if count - 1 == 0 && leaf != tree.root {
        unlink_leaf(tree, pager, leaf, &path)?;
    }

    Ok(())
}

/// Detaches an empty leaf from the sibling chain and from the nearest
/// ancestor that still has a separator to give up. Intermediate internal
/// nodes that held nothing but this subtree are freed along the way.
fn unlink_leaf(tree: &mut BtreeIndex, pager: &Pager, leaf: PageId, path: &[PageId]) -> Result<()> {
    let (left, right) = {
        let page = pager.fetch(leaf)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        (node.left_sibling(), node.right_sibling())
    };

    if left != 0 {
        let mut page = pager.fetch(left)?;
        NodeMut::from_page(page.data_mut(), &tree.cfg)?.set_right_sibling(right);
    }
    if right != 0 {
        let mut page = pager.fetch(right)?;
        NodeMut::from_page(page.data_mut(), &tree.cfg)?.set_left_sibling(left);
    }

    tree.stats.invalidate(leaf);

    let mut child = leaf;
    let mut to_free: Vec<PageId> = vec![leaf];
    let mut depth = path.len();

    loop {
        if depth == 0 {
            // Every ancestor was a bare chain above this leaf: the tree
            // holds no keys at all. The leaf stays as the new empty
            // root; the internal chain goes back to the freelist.
            to_free.retain(|&p| p != leaf);
            tree.root = leaf;
            {
                let mut page = pager.fetch(leaf)?;
                let mut node = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
                node.set_left_sibling(0);
                node.set_right_sibling(0);
            }
            for p in to_free {
                pager.free(p);
            }
            log::debug!("tree emptied; leaf {} is the new root", leaf);
            return Ok(());
        }

        let parent_id = path[depth - 1];
        let (count, ptr_left) = {
            let page = pager.fetch(parent_id)?;
            let node = Node::from_page(page.data(), &tree.cfg)?;
            (node.count(), node.ptr_left())
        };

        if count == 0 {
            // The parent routed only through ptr_left; it empties with
            // its child.
            debug_assert_eq!(ptr_left, child);
            to_free.push(parent_id);
            child = parent_id;
            depth -= 1;
            continue;
        }

        {
            let mut page = pager.fetch(parent_id)?;
            let mut parent = NodeMut::from_page(page.data_mut(), &tree.cfg)?;
            remove_child(pager, &mut parent, child)?;
        }
        break;
    }

    for p in to_free {
        pager.free(p);
    }

    // An internal root reduced to its ptr_left chain collapses.
    loop {
        let (is_leaf, count, ptr_left) = {
            let page = pager.fetch(tree.root)?;
            let node = Node::from_page(page.data(), &tree.cfg)?;
            (node.is_leaf(), node.count(), node.ptr_left_or_zero())
        };
        if is_leaf || count > 0 {
            break;
        }
        let old = tree.root;
        tree.root = ptr_left;
        pager.free(old);
        log::debug!("root {} collapsed into {}", old, ptr_left);
    }

    Ok(())
}

/// Drops the parent entry referencing `child`, preserving the
/// left-separator convention.
fn remove_child(pager: &Pager, parent: &mut NodeMut<'_>, child: PageId) -> Result<()> {
    let (count, ptr_left, first_child) = {
        let view = parent.as_ref();
        debug_assert!(!view.is_leaf());
        (view.count(), view.ptr_left(), view.child_at(0))
    };

    if ptr_left == child {
        // The leftmost subtree disappears: child 0 takes over as
        // ptr_left and separator 0 goes away.
        parent.set_ptr_left(first_child);
        return parent.internal_remove(pager, 0);
    }

    let slot = {
        let view = parent.as_ref();
        (0..count).find(|&slot| view.child_at(slot) == child)
    };
    match slot {
        Some(slot) => parent.internal_remove(pager, slot),
        None => Err(DbError::internal(format!(
            "child {} not referenced by its parent",
            child
        ))),
    }
}
