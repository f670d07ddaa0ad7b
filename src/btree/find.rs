//! # B+tree Find
//!
//! Exact and approximate search. A statistics-driven fast track first
//! probes the last leaf a find touched (cache-only, no I/O) and accepts
//! only a sure interior hit; anything else falls through to the full
//! root-to-leaf descent.
//!
//! ## Approximate Matching
//!
//! With `LT_MATCH` and/or `GT_MATCH` set, a missing needle resolves to a
//! neighbor:
//!
//! - `LT_MATCH`: the greatest key below the needle, stepping to the left
//!   sibling's last slot when the needle falls before this leaf
//! - `GT_MATCH`: the smallest key above the needle, stepping to the right
//!   sibling's first slot when the needle falls past this leaf
//! - both: the exact key wins when it exists; otherwise the lower
//!   neighbor is preferred, falling back to the greater one at the left
//!   edge of the tree
//!
//! A strict single-direction match never returns the needle itself: an
//! exact hit steps one slot in the requested direction, even across a
//! sibling boundary onto a just-split leaf whose first key repeats the
//! needle.

use eyre::Result;

use crate::btree::cursor::Cursor;
use crate::btree::keylist::Bound;
use crate::btree::node::Node;
use crate::btree::records;
use crate::btree::{Approx, BtreeIndex, FindFlags};
use crate::error::DbError;
use crate::storage::page::PageId;
use crate::storage::pager::Pager;

/// A successful find: the leaf position, how it relates to the needle,
/// the matched key (for approximate results, unless suppressed) and the
/// record.
#[derive(Debug)]
pub struct FindResult {
    pub page: PageId,
    pub slot: usize,
    pub approx: Approx,
    pub key: Option<Vec<u8>>,
    pub record: Vec<u8>,
}

pub fn find(
    tree: &mut BtreeIndex,
    pager: &Pager,
    cursor: Option<&Cursor>,
    key: &[u8],
    flags: FindFlags,
) -> Result<FindResult> {
    tree.check_usable()?;
    tree.cfg.key_type.check_key(key)?;
    find_inner(tree, pager, cursor, key, flags).map_err(|e| tree.fail(e))
}

fn find_inner(
    tree: &mut BtreeIndex,
    pager: &Pager,
    cursor: Option<&Cursor>,
    key: &[u8],
    flags: FindFlags,
) -> Result<FindResult> {
    let approximate = flags.intersects(FindFlags::LT_MATCH | FindFlags::GT_MATCH);

    // Fast track: a sure interior hit on the hinted leaf answers an exact
    // find without descending. Edge slots are rejected; they can shadow a
    // match that actually lives in a neighboring leaf.
    if !approximate {
        if let Some(hint) = tree.stats.find_hint() {
            if let Some(page) = pager.fetch_cached(hint) {
                if let Ok(node) = Node::from_page(page.data(), &tree.cfg) {
                    if node.is_leaf() && node.count() >= 3 {
                        if let Bound::Exact(slot) = node.find_lower_bound(pager, key)? {
                            if slot > 0 && slot < node.count() - 1 {
                                tree.stats.record_fast_track();
                                let record =
                                    records::resolve(pager, node.record_entry(slot)?, 0)?;
                                drop(page);
                                return finish(
                                    tree, pager, cursor, hint, slot, Approx::Exact, flags, record,
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    let leaf = tree.descend_to_leaf(pager, key)?;

    let located = {
        let page = pager.fetch(leaf)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        locate(pager, &node, leaf, key, flags)?
    };

    let (page_id, slot, approx) = match located {
        Located::Hit {
            page, slot, approx, ..
        } => (page, slot, approx),
        Located::Miss => {
            tree.stats.record_find_failed();
            return Err(DbError::KeyNotFound.into());
        }
    };

    let record = {
        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        records::resolve(pager, node.record_entry(slot)?, 0)?
    };

    finish(tree, pager, cursor, page_id, slot, approx, flags, record)
}

#[allow(clippy::too_many_arguments)]
fn finish(
    tree: &mut BtreeIndex,
    pager: &Pager,
    cursor: Option<&Cursor>,
    page_id: PageId,
    slot: usize,
    approx: Approx,
    flags: FindFlags,
    record: Vec<u8>,
) -> Result<FindResult> {
    tree.stats.record_find(page_id);

    if let Some(cursor) = cursor {
        cursor.couple(page_id, slot, 0);
    }

    // An exact match already has its key at the caller; approximate
    // results materialize theirs unless suppressed.
    let key = if approx != Approx::Exact && !flags.contains(FindFlags::DONT_LOAD_KEY) {
        let page = pager.fetch(page_id)?;
        let node = Node::from_page(page.data(), &tree.cfg)?;
        Some(node.key_out(pager, slot)?)
    } else {
        None
    };

    Ok(FindResult {
        page: page_id,
        slot,
        approx,
        key,
        record,
    })
}

enum Located {
    Hit {
        page: PageId,
        slot: usize,
        approx: Approx,
    },
    Miss,
}

/// Resolves the needle within a leaf, stepping to a sibling when the
/// approximate match crosses the leaf boundary.
fn locate(
    pager: &Pager,
    node: &Node<'_>,
    page_id: PageId,
    key: &[u8],
    flags: FindFlags,
) -> Result<Located> {
    let count = node.count();
    if count == 0 {
        return Ok(Located::Miss);
    }

    let lt = flags.contains(FindFlags::LT_MATCH);
    let gt = flags.contains(FindFlags::GT_MATCH);
    let bound = node.find_lower_bound(pager, key)?;

    match bound {
        Bound::Exact(slot) => {
            if !lt && !gt {
                return Ok(Located::Hit {
                    page: page_id,
                    slot,
                    approx: Approx::Exact,
                });
            }
            if lt && gt {
                // Both neighbors acceptable: the exact hit wins.
                return Ok(Located::Hit {
                    page: page_id,
                    slot,
                    approx: Approx::Exact,
                });
            }
            if lt {
                return step_lower(pager, node, page_id, slot);
            }
            step_greater(pager, node, page_id, key, slot + 1, true)
        }
        Bound::Insert(slot) => {
            if !lt && !gt {
                return Ok(Located::Miss);
            }
            if lt {
                if slot > 0 {
                    return Ok(Located::Hit {
                        page: page_id,
                        slot: slot - 1,
                        approx: Approx::Lower,
                    });
                }
                // Nothing below the needle in this leaf.
                let left = node.left_sibling();
                if left != 0 {
                    let page = pager.fetch(left)?;
                    let sibling = Node::from_page(page.data(), node.config())?;
                    if sibling.count() > 0 {
                        return Ok(Located::Hit {
                            page: left,
                            slot: sibling.count() - 1,
                            approx: Approx::Lower,
                        });
                    }
                }
                if gt {
                    // Left edge of the tree: fall back to the greater
                    // neighbor, which is the lower bound itself.
                    return step_greater(pager, node, page_id, key, slot, false);
                }
                return Ok(Located::Miss);
            }
            step_greater(pager, node, page_id, key, slot, false)
        }
    }
}

fn step_lower(
    pager: &Pager,
    node: &Node<'_>,
    page_id: PageId,
    slot: usize,
) -> Result<Located> {
    if slot > 0 {
        return Ok(Located::Hit {
            page: page_id,
            slot: slot - 1,
            approx: Approx::Lower,
        });
    }
    let left = node.left_sibling();
    if left == 0 {
        return Ok(Located::Miss);
    }
    let page = pager.fetch(left)?;
    let sibling = Node::from_page(page.data(), node.config())?;
    if sibling.count() == 0 {
        return Ok(Located::Miss);
    }
    Ok(Located::Hit {
        page: left,
        slot: sibling.count() - 1,
        approx: Approx::Lower,
    })
}

/// Steps to the smallest key at or after `slot`. With `strict` set the
/// needle itself is never returned, even when a sibling step lands on a
/// leaf whose first key equals it.
fn step_greater(
    pager: &Pager,
    node: &Node<'_>,
    page_id: PageId,
    key: &[u8],
    slot: usize,
    strict: bool,
) -> Result<Located> {
    if slot < node.count() {
        return Ok(Located::Hit {
            page: page_id,
            slot,
            approx: Approx::Greater,
        });
    }

    let right = node.right_sibling();
    if right == 0 {
        return Ok(Located::Miss);
    }
    let page = pager.fetch(right)?;
    let sibling = Node::from_page(page.data(), node.config())?;
    if sibling.count() == 0 {
        return Ok(Located::Miss);
    }

    if strict {
        let first = sibling.key_out(pager, 0)?;
        if first == key {
            if sibling.count() > 1 {
                return Ok(Located::Hit {
                    page: right,
                    slot: 1,
                    approx: Approx::Greater,
                });
            }
            let next = sibling.right_sibling();
            if next == 0 {
                return Ok(Located::Miss);
            }
            let page = pager.fetch(next)?;
            let far = Node::from_page(page.data(), node.config())?;
            if far.count() == 0 {
                return Ok(Located::Miss);
            }
            return Ok(Located::Hit {
                page: next,
                slot: 0,
                approx: Approx::Greater,
            });
        }
    }

    Ok(Located::Hit {
        page: right,
        slot: 0,
        approx: Approx::Greater,
    })
}

