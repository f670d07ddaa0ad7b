//! # Compressed Block Key List
//!
//! u32 keys stored in fixed-capacity variable-length blocks inside a leaf
//! payload, encoded with the group-varint delta codec. Each block keeps its
//! first key (the *anchor*) uncompressed in the directory and encodes the
//! remaining keys as deltas.
//!
//! ## Region Layout
//!
//! ```text
//! +-----------------------------+
//! | ListHeader (8 bytes)        |  block_count, data_next, max_blocks
//! +-----------------------------+
//! | BlockIndex[0] (12 bytes)    |  directory, sorted by anchor,
//! | BlockIndex[1]               |  grown append-only up to max_blocks
//! | ...                         |
//! +-----------------------------+
//! | block data area             |  encoded blocks, allocated at
//! | (grows via data_next)       |  data_next, relocated on growth,
//! +-----------------------------+  compacted by vacuum
//! ```
//!
//! ## Block Index
//!
//! `value` is the anchor; `key_count` counts the anchor plus the encoded
//! deltas (1..=32); `block_size` and `used_size` are 8-bit byte counts of
//! the data region. Blocks start at 17 bytes and grow by 17 until the
//! worst-case full block (8 selectors + 31 four-byte deltas + slack) fits.
//!
//! ## Insert
//!
//! Insertion mirrors the append-friendly encoding:
//!
//! 1. a key below the anchor decompresses the whole block, prepends the
//!    old anchor and re-encodes with the key as the new anchor
//! 2. groups whose last key is below the new key are skipped unchanged
//! 3. the insertion group is decoded, checked for duplicates, spliced,
//!    and the block is re-encoded from that group onward
//! 4. a key above every stored key appends to the trailing group
//!
//! Any equality seen during the scan returns [`BlockInsert::Duplicate`]
//! without modifying the block.
//!
//! ## Corruption
//!
//! A decoder that exhausts a block's payload with keys still outstanding
//! reports an error; the caller marks the index unusable.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::keylist::Bound;
use crate::config::{
    BLOCK_GROW_FACTOR, BLOCK_INITIAL_SIZE, BLOCK_MAX_SIZE, MAX_KEYS_PER_BLOCK,
};
use crate::encoding::groupvarint::{
    decode_array, decode_carefully, decode_group, encode_array, max_encoded_len,
};

const LIST_HEADER_SIZE: usize = 8;
const BLOCK_INDEX_SIZE: usize = 12;

/// Insert slack kept in every block: a four-byte payload, a selector byte
/// and headroom for regrouping.
const INSERT_SLACK: usize = 9;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ListHeader {
    block_count: U16<LittleEndian>,
    data_next: U16<LittleEndian>,
    max_blocks: U16<LittleEndian>,
    reserved: [u8; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlockIndex {
    offset: U16<LittleEndian>,
    block_size: u8,
    used_size: u8,
    key_count: u8,
    reserved: [u8; 3],
    value: U32<LittleEndian>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInsert {
    Inserted(usize),
    Duplicate,
    /// The list cannot make room; the node has to split.
    NeedsSplit,
}

fn header(region: &[u8]) -> &ListHeader {
    ListHeader::ref_from_bytes(&region[..LIST_HEADER_SIZE]).unwrap() // INVARIANT: region always >= LIST_HEADER_SIZE
}

fn header_mut(region: &mut [u8]) -> &mut ListHeader {
    ListHeader::mut_from_bytes(&mut region[..LIST_HEADER_SIZE]).unwrap() // INVARIANT: see header()
}

fn dir_offset(i: usize) -> usize {
    LIST_HEADER_SIZE + i * BLOCK_INDEX_SIZE
}

fn entry(region: &[u8], i: usize) -> &BlockIndex {
    let off = dir_offset(i);
    BlockIndex::ref_from_bytes(&region[off..off + BLOCK_INDEX_SIZE]).unwrap() // INVARIANT: i < block_count <= max_blocks
}

fn entry_mut(region: &mut [u8], i: usize) -> &mut BlockIndex {
    let off = dir_offset(i);
    BlockIndex::mut_from_bytes(&mut region[off..off + BLOCK_INDEX_SIZE]).unwrap() // INVARIANT: see entry()
}

fn data_end_floor(region: &[u8]) -> usize {
    dir_offset(header(region).max_blocks.get() as usize)
}

pub fn init(region: &mut [u8], max_blocks: usize) {
    region[..LIST_HEADER_SIZE].fill(0);
    let floor = dir_offset(max_blocks);
    let h = header_mut(region);
    h.block_count = U16::new(0);
    h.max_blocks = U16::new(max_blocks as u16);
    h.data_next = U16::new(floor as u16);
}

pub fn block_count(region: &[u8]) -> usize {
    header(region).block_count.get() as usize
}

pub fn total_keys(region: &[u8]) -> usize {
    (0..block_count(region))
        .map(|i| entry(region, i).key_count as usize)
        .sum()
}

fn block_data(region: &[u8], i: usize) -> &[u8] {
    let e = entry(region, i);
    let off = e.offset.get() as usize;
    &region[off..off + e.used_size as usize]
}

/// Index of the block whose range contains `key`: the last anchor <= key,
/// clamped to the first block.
fn find_block(region: &[u8], key: u32) -> usize {
    let count = block_count(region);
    debug_assert!(count > 0);

    let mut lo = 0usize;
    let mut hi = count;
    while lo + 1 < hi {
        let mid = (lo + hi) / 2;
        if entry(region, mid).value.get() <= key {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

fn keys_before(region: &[u8], block: usize) -> usize {
    (0..block).map(|i| entry(region, i).key_count as usize).sum()
}

/// Decodes one block into absolute keys (anchor included).
fn materialize_block(region: &[u8], i: usize) -> Result<Vec<u32>> {
    let e = entry(region, i);
    let mut out = Vec::with_capacity(e.key_count as usize);
    out.push(e.value.get());
    decode_array(
        e.value.get(),
        block_data(region, i),
        e.key_count as usize - 1,
        &mut out,
    )?;
    Ok(out)
}

/// Decodes the entire list into absolute keys.
pub fn materialize(region: &[u8]) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(total_keys(region));
    for i in 0..block_count(region) {
        let e = entry(region, i);
        out.push(e.value.get());
        decode_array(
            e.value.get(),
            block_data(region, i),
            e.key_count as usize - 1,
            &mut out,
        )?;
    }
    Ok(out)
}

pub fn select(region: &[u8], slot: usize) -> Result<u32> {
    let mut base = 0usize;
    for i in 0..block_count(region) {
        let e = entry(region, i);
        let kc = e.key_count as usize;
        if slot < base + kc {
            let pos = slot - base;
            if pos == 0 {
                return Ok(e.value.get());
            }
            return select_in_block(e.value.get(), block_data(region, i), kc - 1, pos - 1);
        }
        base += kc;
    }
    eyre::bail!("select slot {} beyond {} keys", slot, base)
}

/// Decodes forward to the delta at `target` (0-based among the block's
/// deltas). The fast loop runs while more than a full group's worth of
/// bytes remains; the tail uses the careful decoder.
fn select_in_block(anchor: u32, data: &[u8], deltas: usize, target: usize) -> Result<u32> {
    let mut prev = anchor;
    let mut pos = 0usize;
    let mut done = 0usize;
    let mut group = [0u32; 4];

    while deltas - done >= 4 && data.len() - pos > 1 + 4 * 4 {
        pos += decode_group(&data[pos..], &mut prev, &mut group);
        if target < done + 4 {
            return Ok(group[target - done]);
        }
        done += 4;
    }

    while done < deltas {
        let count = (deltas - done).min(4);
        let (consumed, produced) = decode_carefully(&data[pos..], &mut prev, &mut group, count);
        ensure!(
            produced == count,
            "block payload exhausted selecting delta {} of {}",
            target,
            deltas
        );
        if target < done + produced {
            return Ok(group[target - done]);
        }
        pos += consumed;
        done += produced;
    }

    eyre::bail!("select overran block: target {} of {} deltas", target, deltas)
}

pub fn lower_bound(region: &[u8], needle: u32) -> Result<Bound> {
    if block_count(region) == 0 {
        return Ok(Bound::Insert(0));
    }

    let idx = find_block(region, needle);
    let base = keys_before(region, idx);
    let e = entry(region, idx);
    let anchor = e.value.get();

    if needle <= anchor {
        return Ok(if needle == anchor {
            Bound::Exact(base)
        } else {
            Bound::Insert(base)
        });
    }

    let kc = e.key_count as usize;
    let data = block_data(region, idx);
    let deltas = kc - 1;

    let mut prev = anchor;
    let mut pos = 0usize;
    let mut done = 0usize;
    let mut group = [0u32; 4];

    while deltas - done >= 4 && data.len() - pos > 1 + 4 * 4 {
        pos += decode_group(&data[pos..], &mut prev, &mut group);
        if needle <= group[3] {
            for (j, &value) in group.iter().enumerate() {
                if needle <= value {
                    let slot = base + 1 + done + j;
                    return Ok(if needle == value {
                        Bound::Exact(slot)
                    } else {
                        Bound::Insert(slot)
                    });
                }
            }
        }
        done += 4;
    }

    while done < deltas {
        let count = (deltas - done).min(4);
        let (consumed, produced) = decode_carefully(&data[pos..], &mut prev, &mut group, count);
        ensure!(
            produced == count,
            "block tail produced {} of {} deltas",
            produced,
            count
        );
        for (j, &value) in group[..produced].iter().enumerate() {
            if needle <= value {
                let slot = base + 1 + done + j;
                return Ok(if needle == value {
                    Bound::Exact(slot)
                } else {
                    Bound::Insert(slot)
                });
            }
        }
        pos += consumed;
        done += produced;
    }

    // Past the block's last key. The next block's anchor (if any) is
    // strictly greater, because find_block picked the last anchor <= key.
    Ok(Bound::Insert(base + kc))
}

pub fn insert(region: &mut [u8], key: u32) -> Result<BlockInsert> {
    if block_count(region) == 0 {
        // Nothing lives in the data area, so any leaked bytes from erased
        // blocks can be reclaimed wholesale.
        let floor = data_end_floor(region);
        if floor + BLOCK_INITIAL_SIZE > region.len() || header(region).max_blocks.get() == 0 {
            return Ok(BlockInsert::NeedsSplit);
        }
        let h = header_mut(region);
        h.block_count = U16::new(1);
        let offset = floor as u16;
        h.data_next = U16::new(offset + BLOCK_INITIAL_SIZE as u16);
        let e = entry_mut(region, 0);
        *e = BlockIndex {
            offset: U16::new(offset),
            block_size: BLOCK_INITIAL_SIZE as u8,
            used_size: 0,
            key_count: 1,
            reserved: [0; 3],
            value: U32::new(key),
        };
        return Ok(BlockInsert::Inserted(0));
    }

    let mut idx = find_block(region, key);

    if entry(region, idx).value.get() == key {
        return Ok(BlockInsert::Duplicate);
    }

    // A full block splits in half before the key goes in.
    if entry(region, idx).key_count as usize == MAX_KEYS_PER_BLOCK {
        if !split_block(region, idx)? {
            return Ok(BlockInsert::NeedsSplit);
        }
        if entry(region, idx + 1).value.get() <= key {
            idx += 1;
        }
        if entry(region, idx).value.get() == key {
            return Ok(BlockInsert::Duplicate);
        }
    }

    // Guarantee insert slack, growing (and relocating) the block if needed.
    while (entry(region, idx).block_size as usize) - (entry(region, idx).used_size as usize)
        < INSERT_SLACK
    {
        let block_size = entry(region, idx).block_size as usize;
        let new_size = (block_size + BLOCK_GROW_FACTOR).min(BLOCK_MAX_SIZE);
        if new_size <= block_size {
            return Ok(BlockInsert::NeedsSplit);
        }
        if !relocate_block(region, idx, new_size)? {
            if !vacuum(region)? {
                return Ok(BlockInsert::NeedsSplit);
            }
            if !relocate_block(region, idx, new_size)? {
                return Ok(BlockInsert::NeedsSplit);
            }
        }
    }

    let base = keys_before(region, idx);
    let (anchor, kc, offset, block_size) = {
        let e = entry(region, idx);
        (
            e.value.get(),
            e.key_count as usize,
            e.offset.get() as usize,
            e.block_size as usize,
        )
    };
    let used = entry(region, idx).used_size as usize;

    let data = &mut region[offset..offset + block_size];
    match splice_into_block(data, anchor, used, kc, key)? {
        None => Ok(BlockInsert::Duplicate),
        Some((new_used, new_anchor, pos_in_block)) => {
            let e = entry_mut(region, idx);
            e.used_size = new_used as u8;
            e.key_count = kc as u8 + 1;
            e.value = U32::new(new_anchor);
            Ok(BlockInsert::Inserted(base + pos_in_block))
        }
    }
}

/// The group-skipping splice. Returns `None` on a duplicate, otherwise
/// `(new_used, new_anchor, position_in_block)`.
fn splice_into_block(
    data: &mut [u8],
    anchor: u32,
    used: usize,
    kc: usize,
    key: u32,
) -> Result<Option<(usize, u32, usize)>> {
    debug_assert!(key != anchor);

    // Case 1: the key replaces the anchor; everything re-encodes.
    if key < anchor {
        let mut values: SmallVec<[u32; 36]> = SmallVec::new();
        values.push(anchor);
        {
            let mut decoded = Vec::with_capacity(kc - 1);
            decode_array(anchor, &data[..used], kc - 1, &mut decoded)?;
            values.extend_from_slice(&decoded);
        }
        let new_used = encode_array(key, &values, data);
        return Ok(Some((new_used, key, 0)));
    }

    let deltas = kc - 1;
    let mut pos = 0usize;
    let mut done = 0usize;
    let mut initial = anchor;
    let mut inserted = false;
    let mut new_pos = 0usize;
    let mut new_initial = anchor;
    let mut position = 0usize;
    let mut collected: SmallVec<[u32; 36]> = SmallVec::new();
    let mut group = [0u32; 4];

    // Case 2/3: skip groups below the key, splice into the first group
    // that can hold it.
    while deltas - done >= 4 && used - pos > 1 + 4 * 4 {
        let mut next_initial = initial;
        let consumed = decode_group(&data[pos..], &mut next_initial, &mut group);

        if inserted {
            collected.extend_from_slice(&group);
        } else if key <= group[3] {
            if group.contains(&key) {
                return Ok(None);
            }
            new_pos = pos;
            new_initial = initial;
            let j = group.iter().position(|&v| key < v).unwrap(); // INVARIANT: key <= group[3] and key is not in the group
            position = done + j + 1;
            for (t, &value) in group.iter().enumerate() {
                if t == j {
                    collected.push(key);
                }
                collected.push(value);
            }
            inserted = true;
        }
        // else: the whole group stays untouched in place

        pos += consumed;
        initial = next_initial;
        done += 4;
    }

    // Case 4: the trailing partial group (which may hold exactly four
    // deltas when the count is a multiple of four) re-encodes entirely.
    if !inserted {
        new_pos = pos;
        new_initial = initial;
    }

    while done < deltas {
        let count = (deltas - done).min(4);
        let (consumed, produced) =
            decode_carefully(&data[pos..used], &mut initial, &mut group, count);
        ensure!(
            produced == count,
            "block payload exhausted with {} deltas outstanding",
            deltas - done
        );

        if inserted {
            collected.extend_from_slice(&group[..produced]);
        } else {
            if group[..produced].contains(&key) {
                return Ok(None);
            }
            match group[..produced].iter().position(|&v| key < v) {
                Some(j) => {
                    position = done + j + 1;
                    for (t, &value) in group[..produced].iter().enumerate() {
                        if t == j {
                            collected.push(key);
                        }
                        collected.push(value);
                    }
                    inserted = true;
                }
                None => collected.extend_from_slice(&group[..produced]),
            }
        }

        pos += consumed;
        done += produced;
    }

    if !inserted {
        position = deltas + 1;
        collected.push(key);
    }

    let written = encode_array(new_initial, &collected, &mut data[new_pos..]);
    Ok(Some((new_pos + written, anchor, position)))
}

/// Moves a block into a fresh `new_size` allocation at the end of the data
/// area. Returns false when the area is exhausted.
fn relocate_block(region: &mut [u8], idx: usize, new_size: usize) -> Result<bool> {
    let (old_offset, used) = {
        let e = entry(region, idx);
        (e.offset.get() as usize, e.used_size as usize)
    };
    let data_next = header(region).data_next.get() as usize;
    if data_next + new_size > region.len() {
        return Ok(false);
    }

    region.copy_within(old_offset..old_offset + used, data_next);
    {
        let e = entry_mut(region, idx);
        e.offset = U16::new(data_next as u16);
        e.block_size = new_size as u8;
    }
    header_mut(region).data_next = U16::new((data_next + new_size) as u16);
    Ok(true)
}

/// Compacts the data area, dropping the slack that grown and freed blocks
/// left behind. Returns false when nothing could be reclaimed.
fn vacuum(region: &mut [u8]) -> Result<bool> {
    let count = block_count(region);
    let floor = data_end_floor(region);
    let before = header(region).data_next.get() as usize;

    let mut blocks: Vec<(Vec<u8>, usize)> = Vec::with_capacity(count);
    for i in 0..count {
        let bytes = block_data(region, i).to_vec();
        let size = (bytes.len() + INSERT_SLACK).clamp(BLOCK_INITIAL_SIZE, BLOCK_MAX_SIZE);
        blocks.push((bytes, size));
    }

    let mut offset = floor;
    for (i, (bytes, size)) in blocks.iter().enumerate() {
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
        let e = entry_mut(region, i);
        e.offset = U16::new(offset as u16);
        e.block_size = *size as u8;
        offset += size;
    }
    header_mut(region).data_next = U16::new(offset as u16);

    Ok(offset < before)
}

/// Splits a full block in half, inserting the upper half as a new
/// directory entry. Returns false when the directory or data area is full.
fn split_block(region: &mut [u8], idx: usize) -> Result<bool> {
    let count = block_count(region);
    let max_blocks = header(region).max_blocks.get() as usize;
    if count == max_blocks {
        return Ok(false);
    }

    let values = materialize_block(region, idx)?;
    let half = values.len() / 2;
    let (lower, upper) = values.split_at(half);

    let upper_size =
        (max_encoded_len(upper.len() - 1) + INSERT_SLACK).clamp(BLOCK_INITIAL_SIZE, BLOCK_MAX_SIZE);
    let mut data_next = header(region).data_next.get() as usize;
    if data_next + upper_size > region.len() {
        if !vacuum(region)? {
            return Ok(false);
        }
        data_next = header(region).data_next.get() as usize;
        if data_next + upper_size > region.len() {
            return Ok(false);
        }
    }

    // Encode the upper half into its new allocation.
    let upper_used = {
        let data = &mut region[data_next..data_next + upper_size];
        encode_array(upper[0], &upper[1..], data)
    };

    // Shift the directory tail right and write the new entry.
    let tail_start = dir_offset(idx + 1);
    let tail_end = dir_offset(count);
    region.copy_within(tail_start..tail_end, tail_start + BLOCK_INDEX_SIZE);
    {
        let e = entry_mut(region, idx + 1);
        *e = BlockIndex {
            offset: U16::new(data_next as u16),
            block_size: upper_size as u8,
            used_size: upper_used as u8,
            key_count: upper.len() as u8,
            reserved: [0; 3],
            value: U32::new(upper[0]),
        };
    }
    header_mut(region).block_count = U16::new(count as u16 + 1);
    header_mut(region).data_next = U16::new((data_next + upper_size) as u16);

    // Re-encode the lower half in place.
    let (offset, block_size) = {
        let e = entry(region, idx);
        (e.offset.get() as usize, e.block_size as usize)
    };
    let lower_used = {
        let data = &mut region[offset..offset + block_size];
        encode_array(lower[0], &lower[1..], data)
    };
    {
        let e = entry_mut(region, idx);
        e.used_size = lower_used as u8;
        e.key_count = lower.len() as u8;
    }

    Ok(true)
}

pub fn erase_at(region: &mut [u8], slot: usize) -> Result<()> {
    let mut base = 0usize;
    let count = block_count(region);

    for i in 0..count {
        let kc = entry(region, i).key_count as usize;
        if slot >= base + kc {
            base += kc;
            continue;
        }

        let pos = slot - base;
        if kc == 1 {
            // Last key of the block: drop the directory entry. The data
            // bytes linger until the next vacuum.
            let tail_start = dir_offset(i + 1);
            let tail_end = dir_offset(count);
            region.copy_within(tail_start..tail_end, tail_start - BLOCK_INDEX_SIZE);
            header_mut(region).block_count = U16::new(count as u16 - 1);
            return Ok(());
        }

        let mut values = materialize_block(region, i)?;
        values.remove(pos);

        let mut scratch = [0u8; BLOCK_MAX_SIZE];
        let used = encode_array(values[0], &values[1..], &mut scratch);
        let (offset, block_size) = {
            let e = entry(region, i);
            (e.offset.get() as usize, e.block_size as usize)
        };
        ensure!(
            used <= block_size,
            "erase re-encoding grew block beyond its allocation"
        );
        region[offset..offset + used].copy_from_slice(&scratch[..used]);

        let e = entry_mut(region, i);
        e.used_size = used as u8;
        e.key_count = kc as u8 - 1;
        e.value = U32::new(values[0]);
        return Ok(());
    }

    eyre::bail!("erase slot {} beyond {} keys", slot, base)
}

/// Rebuilds the list from a sorted key sequence, packing half-full blocks
/// so subsequent inserts have headroom. Used by node splits and by leaf
/// initialization from a materialized sequence.
pub fn rebuild(region: &mut [u8], keys: &[u32]) -> Result<()> {
    let max_blocks = header(region).max_blocks.get() as usize;
    init(region, max_blocks);

    let chunk_size = MAX_KEYS_PER_BLOCK / 2;
    let chunks: Vec<&[u32]> = keys.chunks(chunk_size).collect();
    ensure!(
        chunks.len() <= max_blocks,
        "rebuild needs {} blocks, directory holds {}",
        chunks.len(),
        max_blocks
    );

    let mut offset = data_end_floor(region);
    for (i, chunk) in chunks.iter().enumerate() {
        let size = (max_encoded_len(chunk.len() - 1) + INSERT_SLACK)
            .clamp(BLOCK_INITIAL_SIZE, BLOCK_MAX_SIZE);
        ensure!(
            offset + size <= region.len(),
            "rebuild overflows the key region ({} keys)",
            keys.len()
        );
        let used = {
            let data = &mut region[offset..offset + size];
            encode_array(chunk[0], &chunk[1..], data)
        };
        let e = entry_mut(region, i);
        *e = BlockIndex {
            offset: U16::new(offset as u16),
            block_size: size as u8,
            used_size: used as u8,
            key_count: chunk.len() as u8,
            reserved: [0; 3],
            value: U32::new(chunk[0]),
        };
        offset += size;
    }

    let h = header_mut(region);
    h.block_count = U16::new(chunks.len() as u16);
    h.data_next = U16::new(offset as u16);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_region(len: usize, max_blocks: usize) -> Vec<u8> {
        let mut region = vec![0u8; len];
        init(&mut region, max_blocks);
        region
    }

    fn insert_all(region: &mut [u8], keys: &[u32]) {
        for &key in keys {
            match insert(region, key).unwrap() {
                BlockInsert::Inserted(_) => {}
                other => panic!("insert of {} failed: {:?}", key, other),
            }
        }
    }

    #[test]
    fn first_insert_creates_anchor_only_block() {
        let mut region = fresh_region(600, 8);
        assert_eq!(insert(&mut region, 100).unwrap(), BlockInsert::Inserted(0));
        assert_eq!(block_count(&region), 1);
        assert_eq!(total_keys(&region), 1);
        assert_eq!(materialize(&region).unwrap(), vec![100]);
    }

    #[test]
    fn insert_below_anchor_replaces_it() {
        // Block with anchor 100 and keys {100, 200, 300}; inserting 50
        // makes 50 the new anchor.
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[100, 200, 300]);

        assert_eq!(insert(&mut region, 50).unwrap(), BlockInsert::Inserted(0));
        assert_eq!(materialize(&region).unwrap(), vec![50, 100, 200, 300]);
        assert_eq!(entry(&region, 0).value.get(), 50);
        assert_eq!(entry(&region, 0).key_count, 4);
    }

    #[test]
    fn duplicates_leave_block_unchanged() {
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10, 20, 30, 40, 50, 60]);
        let snapshot = region.clone();

        for dup in [10u32, 20, 40, 60] {
            assert_eq!(insert(&mut region, dup).unwrap(), BlockInsert::Duplicate);
            assert_eq!(region, snapshot, "duplicate {} modified the block", dup);
        }
    }

    #[test]
    fn splice_positions_are_reported() {
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10, 30, 50, 70, 90]);

        assert_eq!(insert(&mut region, 40).unwrap(), BlockInsert::Inserted(2));
        assert_eq!(insert(&mut region, 5).unwrap(), BlockInsert::Inserted(0));
        assert_eq!(insert(&mut region, 95).unwrap(), BlockInsert::Inserted(7));
        assert_eq!(
            materialize(&region).unwrap(),
            vec![5, 10, 30, 40, 50, 70, 90, 95]
        );
    }

    #[test]
    fn append_after_tail_of_exactly_four() {
        // Five keys = anchor + exactly one full group of deltas; the tail
        // decoder must handle the full group and the append lands last.
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10, 20, 30, 40, 50]);
        assert_eq!(insert(&mut region, 60).unwrap(), BlockInsert::Inserted(5));
        assert_eq!(materialize(&region).unwrap(), vec![10, 20, 30, 40, 50, 60]);

        // Nine keys = anchor + two full groups.
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(insert(&mut region, 100).unwrap(), BlockInsert::Inserted(9));
        assert_eq!(
            materialize(&region).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 100]
        );
    }

    #[test]
    fn splice_into_tail_of_exactly_four() {
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10, 20, 30, 40, 50]);
        assert_eq!(insert(&mut region, 35).unwrap(), BlockInsert::Inserted(3));
        assert_eq!(
            materialize(&region).unwrap(),
            vec![10, 20, 30, 35, 40, 50]
        );
    }

    #[test]
    fn block_splits_at_max_keys() {
        let mut region = fresh_region(900, 8);
        let keys: Vec<u32> = (0..MAX_KEYS_PER_BLOCK as u32).map(|i| i * 10).collect();
        insert_all(&mut region, &keys);
        assert_eq!(block_count(&region), 1);

        insert_all(&mut region, &[5]);
        assert_eq!(block_count(&region), 2);
        let mut expected = keys.clone();
        expected.push(5);
        expected.sort_unstable();
        assert_eq!(materialize(&region).unwrap(), expected);
    }

    #[test]
    fn select_walks_blocks_and_groups() {
        let mut region = fresh_region(2048, 16);
        let keys: Vec<u32> = (0..100u32).map(|i| i * 3 + 1).collect();
        insert_all(&mut region, &keys);

        for (slot, &key) in keys.iter().enumerate() {
            assert_eq!(select(&region, slot).unwrap(), key, "slot {}", slot);
        }
        assert!(select(&region, keys.len()).is_err());
    }

    #[test]
    fn lower_bound_semantics() {
        let mut region = fresh_region(2048, 16);
        insert_all(&mut region, &[10, 20, 30, 40, 50, 60, 70, 80, 90]);

        assert_eq!(lower_bound(&region, 10).unwrap(), Bound::Exact(0));
        assert_eq!(lower_bound(&region, 55).unwrap(), Bound::Insert(5));
        assert_eq!(lower_bound(&region, 90).unwrap(), Bound::Exact(8));
        assert_eq!(lower_bound(&region, 5).unwrap(), Bound::Insert(0));
        assert_eq!(lower_bound(&region, 95).unwrap(), Bound::Insert(9));
    }

    #[test]
    fn lower_bound_across_block_boundary() {
        let mut region = fresh_region(2048, 16);
        let keys: Vec<u32> = (0..64u32).map(|i| i * 2).collect();
        insert_all(&mut region, &keys);
        assert!(block_count(&region) >= 2);

        // A needle in the gap between two blocks resolves to the next
        // block's anchor.
        let second_anchor = entry(&region, 1).value.get();
        let needle = second_anchor - 1;
        let bound = lower_bound(&region, needle).unwrap();
        assert_eq!(bound, Bound::Insert(entry(&region, 0).key_count as usize));
    }

    #[test]
    fn erase_anchor_promotes_next_key() {
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10, 20, 30, 40]);

        erase_at(&mut region, 0).unwrap();
        assert_eq!(materialize(&region).unwrap(), vec![20, 30, 40]);
        assert_eq!(entry(&region, 0).value.get(), 20);
    }

    #[test]
    fn erase_middle_and_last() {
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10, 20, 30, 40]);

        erase_at(&mut region, 2).unwrap();
        assert_eq!(materialize(&region).unwrap(), vec![10, 20, 40]);
        erase_at(&mut region, 2).unwrap();
        assert_eq!(materialize(&region).unwrap(), vec![10, 20]);
    }

    #[test]
    fn erase_last_key_drops_block() {
        let mut region = fresh_region(600, 8);
        insert_all(&mut region, &[10]);
        erase_at(&mut region, 0).unwrap();
        assert_eq!(block_count(&region), 0);
        assert_eq!(total_keys(&region), 0);
    }

    #[test]
    fn growth_and_vacuum_under_pressure() {
        // A small region forces repeated growth, relocation and vacuum.
        let mut region = fresh_region(512, 6);
        let mut expected = Vec::new();
        let mut state = 0xdeadbeefu32;
        let mut key = 0u32;

        loop {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            key = key.wrapping_add(1 + state % 50_000);
            match insert(&mut region, key).unwrap() {
                BlockInsert::Inserted(_) => expected.push(key),
                BlockInsert::Duplicate => unreachable!(),
                BlockInsert::NeedsSplit => break,
            }
        }

        assert!(expected.len() >= 16, "only {} keys fit", expected.len());
        assert_eq!(materialize(&region).unwrap(), expected);
    }

    #[test]
    fn rebuild_roundtrips() {
        let mut region = fresh_region(2048, 16);
        let keys: Vec<u32> = (0..75u32).map(|i| i * 7 + 3).collect();
        rebuild(&mut region, &keys).unwrap();
        assert_eq!(materialize(&region).unwrap(), keys);
        assert_eq!(total_keys(&region), keys.len());

        // Inserts keep working after a rebuild.
        assert!(matches!(
            insert(&mut region, 2).unwrap(),
            BlockInsert::Inserted(0)
        ));
    }

    #[test]
    fn interleaved_insert_matches_sorted_reference() {
        let mut region = fresh_region(4096, 32);
        let mut expected: Vec<u32> = Vec::new();
        let mut state = 12345u32;

        for _ in 0..200 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let key = state % 10_000;
            match insert(&mut region, key).unwrap() {
                BlockInsert::Inserted(slot) => {
                    let at = expected.partition_point(|&v| v < key);
                    assert_eq!(slot, at, "reported slot for {}", key);
                    expected.insert(at, key);
                }
                BlockInsert::Duplicate => {
                    assert!(expected.contains(&key));
                }
                BlockInsert::NeedsSplit => break,
            }
        }

        assert_eq!(materialize(&region).unwrap(), expected);
        let post = total_keys(&region);
        assert_eq!(post, expected.len());
    }
}
