//! # Node Proxy
//!
//! Typed views over a B+tree page's payload, giving the tree algorithms a
//! uniform slot-indexed API regardless of the key-list strategy. The
//! strategy is fixed per database and dispatched with a plain `match`; a
//! node never carries virtual dispatch.
//!
//! ## Leaf Layout (pod / binary strategies)
//!
//! ```text
//! | page header | key slots (capacity * key width) | gap | record entries |
//! ```
//!
//! Record entries sit at the payload tail so both regions can be addressed
//! with nothing but the capacity.
//!
//! ## Leaf Layout (compressed block strategy)
//!
//! ```text
//! | page header | block list (directory + block data) | record entries |
//! ```
//!
//! ## Internal Layout
//!
//! ```text
//! | page header | ptr_left (8 B) | key slots | gap | child pointers |
//! ```
//!
//! `ptr_left` addresses the subtree for keys below the first separator;
//! `child[i]` holds keys in `[key[i], key[i+1])`: the left-separator
//! convention. Internal nodes of a compressed database store plain u32
//! separators; compression applies to leaves only.

use eyre::{ensure, Result};

use crate::btree::keylist::{binary, block, pod, Bound};
use crate::btree::records::RecordRef;
use crate::config::{PAGE_HEADER_SIZE, RECORD_ENTRY_SIZE};
use crate::encoding::keys::{self, KeyType};
use crate::storage::page::{self, PageHeader, PageId, PageType};
use crate::storage::pager::Pager;

/// Per-database B+tree configuration, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    pub key_type: KeyType,
    /// Inline key width for binary databases; the fixed width otherwise.
    pub key_size: u16,
    pub record_number: bool,
    pub duplicates: bool,
    pub compressed: bool,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Pod,
    Binary,
    Block,
}

impl IndexConfig {
    pub fn strategy(&self) -> Strategy {
        if self.compressed {
            Strategy::Block
        } else if self.key_type == KeyType::Binary {
            Strategy::Binary
        } else {
            Strategy::Pod
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.compressed {
            ensure!(
                self.key_type == KeyType::U32,
                "compressed key lists require u32 keys"
            );
        }
        if self.record_number {
            ensure!(
                matches!(self.key_type, KeyType::U32 | KeyType::U64),
                "record-number databases require integer keys"
            );
        }
        if let Some(width) = self.key_type.fixed_width() {
            ensure!(
                self.key_size as usize == width,
                "key size {} does not match fixed width {}",
                self.key_size,
                width
            );
        } else {
            ensure!(self.key_size > 0, "binary key size must be positive");
        }
        Ok(())
    }

    fn payload_len(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    /// Width of one leaf key slot for the non-compressed strategies.
    fn leaf_key_width(&self) -> usize {
        match self.strategy() {
            Strategy::Pod => self.key_size as usize,
            Strategy::Binary => binary::slot_width(self.key_size as usize),
            Strategy::Block => unreachable!("block leaves have no fixed slot width"),
        }
    }

    /// Width of one internal separator slot.
    fn internal_key_width(&self) -> usize {
        match self.strategy() {
            Strategy::Pod | Strategy::Block => self.key_type.fixed_width().unwrap_or(4),
            Strategy::Binary => binary::slot_width(self.key_size as usize),
        }
    }

    pub fn leaf_capacity(&self) -> usize {
        match self.strategy() {
            Strategy::Block => self.payload_len() / 24,
            _ => self.payload_len() / (self.leaf_key_width() + RECORD_ENTRY_SIZE),
        }
    }

    pub fn internal_capacity(&self) -> usize {
        (self.payload_len() - 8) / (self.internal_key_width() + 8)
    }

    fn leaf_records_offset(&self) -> usize {
        self.payload_len() - self.leaf_capacity() * RECORD_ENTRY_SIZE
    }

    fn block_region_len(&self) -> usize {
        self.leaf_records_offset()
    }

    fn block_max_blocks(&self) -> usize {
        self.leaf_capacity() / 8 + 2
    }

    fn internal_children_offset(&self) -> usize {
        self.payload_len() - self.internal_capacity() * 8
    }
}

/// Outcome of a leaf key insertion at the node level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafInsert {
    Done(usize),
    /// The node cannot make room; the caller splits it.
    NeedsSplit,
}

// ----------------------------------------------------------------------
// read-only view
// ----------------------------------------------------------------------

pub struct Node<'a> {
    data: &'a [u8],
    cfg: &'a IndexConfig,
}

impl<'a> Node<'a> {
    pub fn from_page(data: &'a [u8], cfg: &'a IndexConfig) -> Result<Self> {
        let header = PageHeader::from_bytes(data)?;
        ensure!(
            matches!(
                header.page_type(),
                PageType::BtreeLeaf | PageType::BtreeInternal
            ),
            "page {} is not a btree node (type {:?})",
            header.self_id(),
            header.page_type()
        );
        Ok(Self { data, cfg })
    }

    pub fn config(&self) -> &'a IndexConfig {
        self.cfg
    }

    fn header(&self) -> &'a PageHeader {
        PageHeader::from_bytes(self.data).unwrap() // INVARIANT: validated in from_page
    }

    fn payload(&self) -> &'a [u8] {
        page::payload(self.data)
    }

    pub fn is_leaf(&self) -> bool {
        self.header().page_type() == PageType::BtreeLeaf
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn left_sibling(&self) -> PageId {
        self.header().left()
    }

    pub fn right_sibling(&self) -> PageId {
        self.header().right()
    }

    pub fn capacity(&self) -> usize {
        if self.is_leaf() {
            self.cfg.leaf_capacity()
        } else {
            self.cfg.internal_capacity()
        }
    }

    pub fn requires_split(&self) -> bool {
        self.count() >= self.capacity()
    }

    pub fn ptr_left(&self) -> PageId {
        debug_assert!(!self.is_leaf());
        PageId::from_le_bytes(self.payload()[..8].try_into().unwrap()) // INVARIANT: payload > 8
    }

    /// `ptr_left` of an internal node, or 0 for leaves. For callers that
    /// inspect a node before knowing its kind.
    pub fn ptr_left_or_zero(&self) -> PageId {
        if self.is_leaf() {
            0
        } else {
            self.ptr_left()
        }
    }

    pub fn child_at(&self, slot: usize) -> PageId {
        debug_assert!(!self.is_leaf());
        let off = self.cfg.internal_children_offset() + slot * 8;
        PageId::from_le_bytes(self.payload()[off..off + 8].try_into().unwrap()) // INVARIANT: slot < count <= capacity
    }

    fn key_region(&self) -> &'a [u8] {
        if self.is_leaf() {
            match self.cfg.strategy() {
                Strategy::Block => &self.payload()[..self.cfg.block_region_len()],
                _ => self.payload(),
            }
        } else {
            &self.payload()[8..]
        }
    }

    fn key_width(&self) -> usize {
        if self.is_leaf() {
            self.cfg.leaf_key_width()
        } else {
            self.cfg.internal_key_width()
        }
    }

    fn uses_binary_slots(&self) -> bool {
        self.cfg.strategy() == Strategy::Binary
    }

    fn uses_block_list(&self) -> bool {
        self.is_leaf() && self.cfg.strategy() == Strategy::Block
    }

    /// Materializes the key at `slot` (reads the blob store for extended
    /// binary keys).
    pub fn key_out(&self, pager: &Pager, slot: usize) -> Result<Vec<u8>> {
        ensure!(
            slot < self.count(),
            "key slot {} out of bounds (count {})",
            slot,
            self.count()
        );
        if self.uses_block_list() {
            let key = block::select(self.key_region(), slot).map_err(block_corrupt)?;
            return Ok(key.to_le_bytes().to_vec());
        }
        if self.uses_binary_slots() {
            return binary::materialize(pager, self.key_region(), self.cfg.key_size as usize, slot);
        }
        Ok(pod::key_at(self.key_region(), self.key_width(), slot).to_vec())
    }

    pub fn find_lower_bound(&self, pager: &Pager, key: &[u8]) -> Result<Bound> {
        if self.uses_block_list() {
            return block::lower_bound(self.key_region(), keys::decode_u32(key))
                .map_err(block_corrupt);
        }
        if self.uses_binary_slots() {
            return binary::lower_bound(
                pager,
                self.key_region(),
                self.cfg.key_size as usize,
                self.count(),
                key,
            );
        }
        Ok(pod::lower_bound(
            self.key_region(),
            self.key_width(),
            self.count(),
            self.cfg.key_type,
            key,
        ))
    }

    /// Child page to descend into for `key` (left-separator convention).
    pub fn child_for(&self, pager: &Pager, key: &[u8]) -> Result<PageId> {
        debug_assert!(!self.is_leaf());
        Ok(match self.find_lower_bound(pager, key)? {
            Bound::Exact(slot) => self.child_at(slot),
            Bound::Insert(0) => self.ptr_left(),
            Bound::Insert(slot) => self.child_at(slot - 1),
        })
    }

    pub fn record_entry(&self, slot: usize) -> Result<RecordRef> {
        debug_assert!(self.is_leaf());
        ensure!(
            slot < self.count(),
            "record slot {} out of bounds (count {})",
            slot,
            self.count()
        );
        let off = self.cfg.leaf_records_offset() + slot * RECORD_ENTRY_SIZE;
        RecordRef::decode(&self.payload()[off..off + RECORD_ENTRY_SIZE])
    }
}

// ----------------------------------------------------------------------
// mutable view
// ----------------------------------------------------------------------

pub struct NodeMut<'a> {
    data: &'a mut [u8],
    cfg: &'a IndexConfig,
}

impl<'a> NodeMut<'a> {
    pub fn from_page(data: &'a mut [u8], cfg: &'a IndexConfig) -> Result<Self> {
        Node::from_page(data, cfg)?;
        Ok(Self { data, cfg })
    }

    /// Initializes a freshly allocated page as an empty leaf.
    pub fn init_leaf(data: &'a mut [u8], cfg: &'a IndexConfig, id: PageId) -> Result<Self> {
        PageHeader::new(PageType::BtreeLeaf, id).write_to(data)?;
        if cfg.strategy() == Strategy::Block {
            let region_len = cfg.block_region_len();
            let max_blocks = cfg.block_max_blocks();
            block::init(&mut page::payload_mut(data)[..region_len], max_blocks);
        }
        Ok(Self { data, cfg })
    }

    /// Initializes a freshly allocated page as an internal node.
    pub fn init_internal(
        data: &'a mut [u8],
        cfg: &'a IndexConfig,
        id: PageId,
        ptr_left: PageId,
    ) -> Result<Self> {
        PageHeader::new(PageType::BtreeInternal, id).write_to(data)?;
        page::payload_mut(data)[..8].copy_from_slice(&ptr_left.to_le_bytes());
        Ok(Self { data, cfg })
    }

    pub fn as_ref(&self) -> Node<'_> {
        Node {
            data: self.data,
            cfg: self.cfg,
        }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::from_bytes_mut(self.data).unwrap() // INVARIANT: validated at construction
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        page::payload_mut(self.data)
    }

    pub fn is_leaf(&self) -> bool {
        self.as_ref().is_leaf()
    }

    pub fn count(&self) -> usize {
        self.as_ref().count()
    }

    pub fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count as u16);
    }

    pub fn set_left_sibling(&mut self, id: PageId) {
        self.header_mut().set_left(id);
    }

    pub fn set_right_sibling(&mut self, id: PageId) {
        self.header_mut().set_right(id);
    }

    pub fn set_ptr_left(&mut self, id: PageId) {
        debug_assert!(!self.is_leaf());
        self.payload_mut()[..8].copy_from_slice(&id.to_le_bytes());
    }

    fn leaf_key_region_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_leaf());
        match self.cfg.strategy() {
            Strategy::Block => {
                let len = self.cfg.block_region_len();
                &mut self.payload_mut()[..len]
            }
            _ => self.payload_mut(),
        }
    }

    fn internal_key_region_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.is_leaf());
        &mut self.payload_mut()[8..]
    }

    /// Inserts a key into a leaf at the slot reported by a prior
    /// lower-bound search. The compressed list re-derives its position and
    /// may report that the node has to split instead.
    pub fn leaf_insert_key(&mut self, pager: &Pager, slot: usize, key: &[u8]) -> Result<LeafInsert> {
        debug_assert!(self.is_leaf());
        let count = self.count();
        let key_size = self.cfg.key_size as usize;

        match self.cfg.strategy() {
            Strategy::Block => {
                let needle = keys::decode_u32(key);
                match block::insert(self.leaf_key_region_mut(), needle).map_err(block_corrupt)? {
                    block::BlockInsert::Inserted(at) => {
                        debug_assert_eq!(at, slot);
                        Ok(LeafInsert::Done(at))
                    }
                    block::BlockInsert::Duplicate => {
                        eyre::bail!("duplicate key slipped past the exact-match check")
                    }
                    block::BlockInsert::NeedsSplit => Ok(LeafInsert::NeedsSplit),
                }
            }
            Strategy::Binary => {
                // Pre-allocates the extended-key blob before any shift.
                let prepared = binary::prepare(pager, key, key_size)?;
                let region = self.leaf_key_region_mut();
                binary::insert_prepared(region, key_size, count, slot, &prepared);
                Ok(LeafInsert::Done(slot))
            }
            Strategy::Pod => {
                let width = self.cfg.leaf_key_width();
                let region = self.leaf_key_region_mut();
                pod::insert_at(region, width, count, slot, key);
                Ok(LeafInsert::Done(slot))
            }
        }
    }

    /// Removes the key at `slot` from a leaf, releasing blob-backed
    /// extended keys.
    pub fn leaf_remove_key(&mut self, pager: &Pager, slot: usize) -> Result<()> {
        debug_assert!(self.is_leaf());
        let count = self.count();
        let key_size = self.cfg.key_size as usize;

        match self.cfg.strategy() {
            Strategy::Block => {
                block::erase_at(self.leaf_key_region_mut(), slot).map_err(block_corrupt)
            }
            Strategy::Binary => {
                let region = self.leaf_key_region_mut();
                binary::remove_at(pager, region, key_size, count, slot)
            }
            Strategy::Pod => {
                let width = self.cfg.leaf_key_width();
                let region = self.leaf_key_region_mut();
                pod::remove_at(region, width, count, slot);
                Ok(())
            }
        }
    }

    /// Inserts a separator into an internal node: key at `slot`, child
    /// pointer at the matching position.
    pub fn internal_insert(
        &mut self,
        pager: &Pager,
        slot: usize,
        key: &[u8],
        child: PageId,
    ) -> Result<()> {
        debug_assert!(!self.is_leaf());
        let count = self.count();
        let key_size = self.cfg.key_size as usize;
        let width = self.cfg.internal_key_width();

        match self.cfg.strategy() {
            Strategy::Binary => {
                let prepared = binary::prepare(pager, key, key_size)?;
                let region = self.internal_key_region_mut();
                binary::insert_prepared(region, key_size, count, slot, &prepared);
            }
            _ => {
                let region = self.internal_key_region_mut();
                pod::insert_at(region, width, count, slot, key);
            }
        }

        let children_off = self.cfg.internal_children_offset();
        let payload = self.payload_mut();
        let start = children_off + slot * 8;
        payload.copy_within(start..children_off + count * 8, start + 8);
        payload[start..start + 8].copy_from_slice(&child.to_le_bytes());

        self.set_count(count + 1);
        Ok(())
    }

    /// Replaces the child pointer at `slot` (overwrite semantics after a
    /// child split re-reports an existing separator).
    pub fn set_child_at(&mut self, slot: usize, child: PageId) {
        debug_assert!(!self.is_leaf());
        let off = self.cfg.internal_children_offset() + slot * 8;
        self.payload_mut()[off..off + 8].copy_from_slice(&child.to_le_bytes());
    }

    /// Removes separator `slot` and its child pointer.
    pub fn internal_remove(&mut self, pager: &Pager, slot: usize) -> Result<()> {
        debug_assert!(!self.is_leaf());
        let count = self.count();
        let key_size = self.cfg.key_size as usize;
        let width = self.cfg.internal_key_width();

        match self.cfg.strategy() {
            Strategy::Binary => {
                let region = self.internal_key_region_mut();
                binary::remove_at(pager, region, key_size, count, slot)?;
            }
            _ => {
                let region = self.internal_key_region_mut();
                pod::remove_at(region, width, count, slot);
            }
        }

        let children_off = self.cfg.internal_children_offset();
        let payload = self.payload_mut();
        let start = children_off + slot * 8;
        payload.copy_within(start + 8..children_off + count * 8, start);

        self.set_count(count - 1);
        Ok(())
    }

    pub fn record_entry(&self, slot: usize) -> Result<RecordRef> {
        self.as_ref().record_entry(slot)
    }

    pub fn set_record_entry(&mut self, slot: usize, entry: RecordRef) {
        debug_assert!(self.is_leaf());
        let off = self.cfg.leaf_records_offset() + slot * RECORD_ENTRY_SIZE;
        self.payload_mut()[off..off + RECORD_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }

    /// Shifts record entries `[slot, count)` right and writes the new one.
    pub fn insert_record_entry(&mut self, slot: usize, entry: RecordRef) {
        debug_assert!(self.is_leaf());
        let count = self.count();
        let records_off = self.cfg.leaf_records_offset();
        let payload = self.payload_mut();
        let start = records_off + slot * RECORD_ENTRY_SIZE;
        payload.copy_within(
            start..records_off + count * RECORD_ENTRY_SIZE,
            start + RECORD_ENTRY_SIZE,
        );
        payload[start..start + RECORD_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }

    pub fn remove_record_entry(&mut self, slot: usize) {
        debug_assert!(self.is_leaf());
        let count = self.count();
        let records_off = self.cfg.leaf_records_offset();
        let payload = self.payload_mut();
        let start = records_off + slot * RECORD_ENTRY_SIZE;
        payload.copy_within(
            start + RECORD_ENTRY_SIZE..records_off + count * RECORD_ENTRY_SIZE,
            start,
        );
    }

    /// Moves leaf entries `[pivot, count)` into the empty leaf `right`.
    /// Sibling links and parent bookkeeping stay with the caller.
    pub fn split_leaf_into(&mut self, right: &mut NodeMut<'_>, pivot: usize) -> Result<()> {
        debug_assert!(self.is_leaf() && right.is_leaf());
        let count = self.count();
        let moved = count - pivot;
        let key_size = self.cfg.key_size as usize;

        match self.cfg.strategy() {
            Strategy::Block => {
                let all = block::materialize(self.as_ref().key_region()).map_err(block_corrupt)?;
                ensure!(
                    all.len() == count,
                    "block list holds {} keys, header says {}",
                    all.len(),
                    count
                );
                block::rebuild(self.leaf_key_region_mut(), &all[..pivot]).map_err(block_corrupt)?;
                block::rebuild(right.leaf_key_region_mut(), &all[pivot..]).map_err(block_corrupt)?;
            }
            Strategy::Binary => {
                let src = self.as_ref();
                binary::copy_range(
                    src.key_region(),
                    right.leaf_key_region_mut(),
                    key_size,
                    pivot,
                    moved,
                );
            }
            Strategy::Pod => {
                let width = self.cfg.leaf_key_width();
                let src = self.as_ref();
                pod::copy_range(
                    src.key_region(),
                    right.leaf_key_region_mut(),
                    width,
                    pivot,
                    moved,
                );
            }
        }

        // Record entries move as raw bytes; blob ownership moves with them.
        let records_off = self.cfg.leaf_records_offset();
        let src_start = records_off + pivot * RECORD_ENTRY_SIZE;
        let src_end = records_off + count * RECORD_ENTRY_SIZE;
        let moved_records = self.as_ref().payload()[src_start..src_end].to_vec();
        right.payload_mut()[records_off..records_off + moved_records.len()]
            .copy_from_slice(&moved_records);

        self.set_count(pivot);
        right.set_count(moved);
        Ok(())
    }

    /// Splits an internal node: entries `[pivot + 1, count)` move to
    /// `right`, whose `ptr_left` becomes the pivot's child. The pivot key
    /// itself is the caller's to propagate (already materialized); its
    /// extended-key blob, if any, is released here because no node owns
    /// the slot afterwards.
    pub fn split_internal_into(
        &mut self,
        pager: &Pager,
        right: &mut NodeMut<'_>,
        pivot: usize,
    ) -> Result<()> {
        debug_assert!(!self.is_leaf() && !right.is_leaf());
        let count = self.count();
        let moved = count - pivot - 1;
        let key_size = self.cfg.key_size as usize;
        let width = self.cfg.internal_key_width();

        if self.cfg.strategy() == Strategy::Binary {
            let region = self.as_ref().key_region();
            if binary::is_extended(region, key_size, pivot) {
                crate::storage::blob::free(pager, binary::blob_id(region, key_size, pivot))?;
            }
        }

        right.set_ptr_left(self.as_ref().child_at(pivot));

        {
            let src = self.as_ref();
            let src_region = src.key_region();
            let dst_region = right.internal_key_region_mut();
            match self.cfg.strategy() {
                Strategy::Binary => {
                    binary::copy_range(src_region, dst_region, key_size, pivot + 1, moved)
                }
                _ => pod::copy_range(src_region, dst_region, width, pivot + 1, moved),
            }
        }

        let children_off = self.cfg.internal_children_offset();
        let src_start = children_off + (pivot + 1) * 8;
        let src_end = children_off + count * 8;
        let moved_children = self.as_ref().payload()[src_start..src_end].to_vec();
        right.payload_mut()[children_off..children_off + moved_children.len()]
            .copy_from_slice(&moved_children);

        self.set_count(pivot);
        right.set_count(moved);
        Ok(())
    }
}


/// Failures inside the compressed key list are corruption by definition
/// (the list performs no I/O); they surface as the internal status so the
/// index gets marked unusable.
fn block_corrupt(err: eyre::Report) -> eyre::Report {
    match crate::error::DbError::of(&err) {
        Some(_) => err,
        None => eyre::Report::new(crate::error::DbError::Internal(format!(
            "compressed key list: {err:#}"
        ))),
    }
}

#[cfg(test)]

mod tests {
    use super::*;
    use crate::btree::records;
    use crate::config::EnvOptions;
    use tempfile::tempdir;

    fn u32_cfg(page_size: usize) -> IndexConfig {
        IndexConfig {
            key_type: KeyType::U32,
            key_size: 4,
            record_number: false,
            duplicates: false,
            compressed: false,
            page_size,
        }
    }

    fn block_cfg(page_size: usize) -> IndexConfig {
        IndexConfig {
            compressed: true,
            ..u32_cfg(page_size)
        }
    }

    fn test_pager(dir: &tempfile::TempDir) -> Pager {
        let options = EnvOptions::new().page_size(1024).cache_capacity(64);
        Pager::create(&dir.path().join("node.loam"), &options).unwrap()
    }

    fn leaf_with_keys(
        data: &mut [u8],
        cfg: &IndexConfig,
        pager: &Pager,
        keys: &[u32],
    ) {
        let mut node = NodeMut::init_leaf(data, cfg, 1).unwrap();
        for &k in keys {
            let count = node.count();
            let bound = node.as_ref().find_lower_bound(pager, &k.to_le_bytes()).unwrap();
            let slot = bound.slot();
            match node.leaf_insert_key(pager, slot, &k.to_le_bytes()).unwrap() {
                LeafInsert::Done(at) => {
                    node.insert_record_entry(at, records::make_entry(pager, b"").unwrap());
                    node.set_count(count + 1);
                }
                LeafInsert::NeedsSplit => panic!("unexpected split"),
            }
        }
    }

    #[test]
    fn config_validation() {
        let mut cfg = u32_cfg(1024);
        assert!(cfg.validate().is_ok());
        cfg.compressed = true;
        assert!(cfg.validate().is_ok());
        cfg.key_type = KeyType::U64;
        cfg.key_size = 8;
        assert!(cfg.validate().is_err(), "compressed u64 must be rejected");
    }

    #[test]
    fn capacities_are_sane() {
        for page_size in [1024usize, 4096, 16384, 65536] {
            let cfg = u32_cfg(page_size);
            assert!(cfg.leaf_capacity() > 8);
            assert!(cfg.internal_capacity() > 8);
            let bcfg = block_cfg(page_size);
            assert!(bcfg.leaf_capacity() > 8);
        }
    }

    #[test]
    fn pod_leaf_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let cfg = u32_cfg(1024);
        let mut data = vec![0u8; 1024];

        leaf_with_keys(&mut data, &cfg, &pager, &[30, 10, 20]);

        let node = Node::from_page(&data, &cfg).unwrap();
        assert_eq!(node.count(), 3);
        assert_eq!(node.key_out(&pager, 0).unwrap(), 10u32.to_le_bytes());
        assert_eq!(node.key_out(&pager, 1).unwrap(), 20u32.to_le_bytes());
        assert_eq!(node.key_out(&pager, 2).unwrap(), 30u32.to_le_bytes());
        assert_eq!(
            node.find_lower_bound(&pager, &20u32.to_le_bytes()).unwrap(),
            Bound::Exact(1)
        );
        assert_eq!(
            node.find_lower_bound(&pager, &25u32.to_le_bytes()).unwrap(),
            Bound::Insert(2)
        );
    }

    #[test]
    fn block_leaf_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let cfg = block_cfg(1024);
        let mut data = vec![0u8; 1024];

        leaf_with_keys(&mut data, &cfg, &pager, &[5, 1, 9, 3, 7]);

        let node = Node::from_page(&data, &cfg).unwrap();
        assert_eq!(node.count(), 5);
        for (slot, key) in [1u32, 3, 5, 7, 9].iter().enumerate() {
            assert_eq!(node.key_out(&pager, slot).unwrap(), key.to_le_bytes());
        }
    }

    #[test]
    fn internal_node_navigation() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let cfg = u32_cfg(1024);
        let mut data = vec![0u8; 1024];

        let mut node = NodeMut::init_internal(&mut data, &cfg, 2, 100).unwrap();
        node.internal_insert(&pager, 0, &10u32.to_le_bytes(), 101).unwrap();
        node.internal_insert(&pager, 1, &20u32.to_le_bytes(), 102).unwrap();

        let view = node.as_ref();
        assert_eq!(view.ptr_left(), 100);
        assert_eq!(view.child_at(0), 101);
        assert_eq!(view.child_at(1), 102);

        // Left-separator convention: keys below 10 go left, 10 <= k < 20
        // to child 0, k >= 20 to child 1.
        assert_eq!(view.child_for(&pager, &5u32.to_le_bytes()).unwrap(), 100);
        assert_eq!(view.child_for(&pager, &10u32.to_le_bytes()).unwrap(), 101);
        assert_eq!(view.child_for(&pager, &15u32.to_le_bytes()).unwrap(), 101);
        assert_eq!(view.child_for(&pager, &20u32.to_le_bytes()).unwrap(), 102);
        assert_eq!(view.child_for(&pager, &99u32.to_le_bytes()).unwrap(), 102);
    }

    #[test]
    fn leaf_split_moves_upper_half() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let cfg = u32_cfg(1024);
        let mut left_data = vec![0u8; 1024];
        let mut right_data = vec![0u8; 1024];

        let keys: Vec<u32> = (0..10).map(|i| i * 10).collect();
        leaf_with_keys(&mut left_data, &cfg, &pager, &keys);

        {
            let mut left = NodeMut::from_page(&mut left_data, &cfg).unwrap();
            let mut right = NodeMut::init_leaf(&mut right_data, &cfg, 3).unwrap();
            left.split_leaf_into(&mut right, 5).unwrap();
        }

        let left = Node::from_page(&left_data, &cfg).unwrap();
        let right = Node::from_page(&right_data, &cfg).unwrap();
        assert_eq!(left.count(), 5);
        assert_eq!(right.count(), 5);
        assert_eq!(left.key_out(&pager, 4).unwrap(), 40u32.to_le_bytes());
        assert_eq!(right.key_out(&pager, 0).unwrap(), 50u32.to_le_bytes());
        assert!(right.record_entry(0).is_ok());
    }

    #[test]
    fn block_leaf_split_rebuilds_both_halves() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let cfg = block_cfg(1024);
        let mut left_data = vec![0u8; 1024];
        let mut right_data = vec![0u8; 1024];

        let keys: Vec<u32> = (0..40).map(|i| i * 3).collect();
        leaf_with_keys(&mut left_data, &cfg, &pager, &keys);

        {
            let mut left = NodeMut::from_page(&mut left_data, &cfg).unwrap();
            let mut right = NodeMut::init_leaf(&mut right_data, &cfg, 3).unwrap();
            left.split_leaf_into(&mut right, 20).unwrap();
        }

        let left = Node::from_page(&left_data, &cfg).unwrap();
        let right = Node::from_page(&right_data, &cfg).unwrap();
        assert_eq!(left.count(), 20);
        assert_eq!(right.count(), 20);
        assert_eq!(left.key_out(&pager, 19).unwrap(), 57u32.to_le_bytes());
        assert_eq!(right.key_out(&pager, 0).unwrap(), 60u32.to_le_bytes());
    }

    #[test]
    fn internal_split_promotes_pivot_child() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let cfg = u32_cfg(1024);
        let mut left_data = vec![0u8; 1024];
        let mut right_data = vec![0u8; 1024];

        {
            let mut node = NodeMut::init_internal(&mut left_data, &cfg, 2, 100).unwrap();
            for i in 0..7u32 {
                let count = node.count();
                node.internal_insert(&pager, count, &(i * 10).to_le_bytes(), 101 + i as u64)
                    .unwrap();
            }
        }

        {
            let mut left = NodeMut::from_page(&mut left_data, &cfg).unwrap();
            let mut right = NodeMut::init_internal(&mut right_data, &cfg, 3, 0).unwrap();
            left.split_internal_into(&pager, &mut right, 3).unwrap();
        }

        let left = Node::from_page(&left_data, &cfg).unwrap();
        let right = Node::from_page(&right_data, &cfg).unwrap();
        assert_eq!(left.count(), 3);
        assert_eq!(right.count(), 3);
        // Pivot (key 30, child 104) promotes: its child becomes right's
        // ptr_left.
        assert_eq!(right.ptr_left(), 104);
        assert_eq!(right.key_out(&pager, 0).unwrap(), 40u32.to_le_bytes());
        assert_eq!(right.child_at(0), 105);
    }
}
