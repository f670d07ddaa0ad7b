//! # Binary Key List
//!
//! Variable-length binary keys in fixed-width slots. Each slot holds a
//! flag byte, the full key length, an inline area of the database's
//! configured `key_size`, and a trailing 8-byte blob id:
//!
//! ```text
//! +------+-------------+----------------------+------------------+
//! | flag | size (u16)  | inline [key_size]    | blob id (8 B)    |
//! +------+-------------+----------------------+------------------+
//! ```
//!
//! Keys that fit into the inline area are stored whole and the blob id is
//! zero. A longer key keeps its first `key_size` bytes inline, the full
//! key goes to the blob store, and the slot is marked `EXTENDED`
//! (comparison uses the full key; the inline prefix usually decides
//! without touching the blob).
//!
//! ## Failure Ordering
//!
//! The extended-key blob is allocated in [`prepare`] *before* any slot
//! shifting, so an allocation failure aborts the insert with the node
//! untouched.

use std::cmp::Ordering;

use eyre::Result;

use crate::btree::keylist::Bound;
use crate::storage::blob::{self, BlobId};
use crate::storage::pager::Pager;

pub const FLAG_EXTENDED: u8 = 0x01;

const SIZE_OFF: usize = 1;
const INLINE_OFF: usize = 3;

pub fn slot_width(key_size: usize) -> usize {
    INLINE_OFF + key_size + 8
}

fn slot_at(region: &[u8], key_size: usize, slot: usize) -> &[u8] {
    let width = slot_width(key_size);
    &region[slot * width..(slot + 1) * width]
}

pub fn is_extended(region: &[u8], key_size: usize, slot: usize) -> bool {
    slot_at(region, key_size, slot)[0] & FLAG_EXTENDED != 0
}

pub fn key_len(region: &[u8], key_size: usize, slot: usize) -> usize {
    let raw = slot_at(region, key_size, slot);
    u16::from_le_bytes(raw[SIZE_OFF..SIZE_OFF + 2].try_into().unwrap()) as usize // INVARIANT: slot width >= 3
}

pub fn blob_id(region: &[u8], key_size: usize, slot: usize) -> BlobId {
    let raw = slot_at(region, key_size, slot);
    BlobId::from_le_bytes(raw[INLINE_OFF + key_size..].try_into().unwrap()) // INVARIANT: slot width fixed
}

fn inline_bytes(region: &[u8], key_size: usize, slot: usize) -> &[u8] {
    let raw = slot_at(region, key_size, slot);
    let len = key_len(region, key_size, slot).min(key_size);
    &raw[INLINE_OFF..INLINE_OFF + len]
}

/// Materializes the full key, reading the blob store for extended keys.
pub fn materialize(pager: &Pager, region: &[u8], key_size: usize, slot: usize) -> Result<Vec<u8>> {
    if is_extended(region, key_size, slot) {
        blob::read(pager, blob_id(region, key_size, slot))
    } else {
        Ok(inline_bytes(region, key_size, slot).to_vec())
    }
}

/// Compares the key at `slot` against `needle`, touching the blob store
/// only when the inline prefix cannot decide.
pub fn compare(
    pager: &Pager,
    region: &[u8],
    key_size: usize,
    slot: usize,
    needle: &[u8],
) -> Result<Ordering> {
    if !is_extended(region, key_size, slot) {
        return Ok(inline_bytes(region, key_size, slot).cmp(needle));
    }

    let inline = inline_bytes(region, key_size, slot);
    if needle.len() < key_size {
        // The stored key is longer than the inline area, so if the needle
        // is a prefix of it the stored key is strictly greater.
        return Ok(match inline[..needle.len()].cmp(needle) {
            Ordering::Equal => Ordering::Greater,
            other => other,
        });
    }

    match inline.cmp(&needle[..key_size]) {
        Ordering::Equal => {
            let full = blob::read(pager, blob_id(region, key_size, slot))?;
            Ok(full.as_slice().cmp(needle))
        }
        other => Ok(other),
    }
}

pub fn lower_bound(
    pager: &Pager,
    region: &[u8],
    key_size: usize,
    count: usize,
    needle: &[u8],
) -> Result<Bound> {
    let mut lo = 0usize;
    let mut hi = count;

    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare(pager, region, key_size, mid, needle)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Ok(Bound::Exact(mid)),
            Ordering::Greater => hi = mid,
        }
    }

    Ok(Bound::Insert(lo))
}

/// A slot image ready for insertion. Building it performs the extended-key
/// blob allocation up front.
pub struct PreparedKey {
    bytes: Vec<u8>,
}

pub fn prepare(pager: &Pager, key: &[u8], key_size: usize) -> Result<PreparedKey> {
    let mut bytes = vec![0u8; slot_width(key_size)];
    bytes[SIZE_OFF..SIZE_OFF + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());

    if key.len() > key_size {
        bytes[0] = FLAG_EXTENDED;
        bytes[INLINE_OFF..INLINE_OFF + key_size].copy_from_slice(&key[..key_size]);
        let id = blob::allocate(pager, key)?;
        bytes[INLINE_OFF + key_size..].copy_from_slice(&id.to_le_bytes());
    } else {
        bytes[INLINE_OFF..INLINE_OFF + key.len()].copy_from_slice(key);
    }

    Ok(PreparedKey { bytes })
}

/// Shifts `[slot, count)` right by one and writes the prepared slot.
pub fn insert_prepared(
    region: &mut [u8],
    key_size: usize,
    count: usize,
    slot: usize,
    prepared: &PreparedKey,
) {
    let width = slot_width(key_size);
    let start = slot * width;
    region.copy_within(start..count * width, start + width);
    region[start..start + width].copy_from_slice(&prepared.bytes);
}

/// Removes the slot, freeing the extended-key blob it owned.
pub fn remove_at(
    pager: &Pager,
    region: &mut [u8],
    key_size: usize,
    count: usize,
    slot: usize,
) -> Result<()> {
    if is_extended(region, key_size, slot) {
        blob::free(pager, blob_id(region, key_size, slot))?;
    }
    let width = slot_width(key_size);
    let start = slot * width;
    region.copy_within(start + width..count * width, start);
    Ok(())
}

/// Moves slots `[from, from + n)` of `src` to the front of `dst`. Extended
/// blob ownership travels with the raw slot bytes.
pub fn copy_range(src: &[u8], dst: &mut [u8], key_size: usize, from: usize, n: usize) {
    let width = slot_width(key_size);
    dst[..n * width].copy_from_slice(&src[from * width..(from + n) * width]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOptions;
    use tempfile::tempdir;

    const KS: usize = 8;

    fn test_pager(dir: &tempfile::TempDir) -> Pager {
        let options = EnvOptions::new().page_size(1024).cache_capacity(64);
        Pager::create(&dir.path().join("binary.loam"), &options).unwrap()
    }

    fn insert_keys(pager: &Pager, region: &mut [u8], keys: &[&[u8]]) {
        for (i, key) in keys.iter().enumerate() {
            let prepared = prepare(pager, key, KS).unwrap();
            insert_prepared(region, KS, i, i, &prepared);
        }
    }

    #[test]
    fn inline_keys_roundtrip() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let mut region = vec![0u8; 10 * slot_width(KS)];

        insert_keys(&pager, &mut region, &[b"alpha", b"bravo"]);

        assert!(!is_extended(&region, KS, 0));
        assert_eq!(materialize(&pager, &region, KS, 0).unwrap(), b"alpha");
        assert_eq!(materialize(&pager, &region, KS, 1).unwrap(), b"bravo");
    }

    #[test]
    fn oversized_key_becomes_extended() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let mut region = vec![0u8; 10 * slot_width(KS)];

        let long = b"a key much longer than the inline area";
        insert_keys(&pager, &mut region, &[long]);

        assert!(is_extended(&region, KS, 0));
        assert_ne!(blob_id(&region, KS, 0), 0);
        assert_eq!(materialize(&pager, &region, KS, 0).unwrap(), long);
    }

    #[test]
    fn compare_uses_prefix_without_blob_when_possible() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let mut region = vec![0u8; 10 * slot_width(KS)];

        insert_keys(&pager, &mut region, &[b"zzzzzzzz-extended-tail"]);

        // Differing prefixes decide without the blob.
        assert_eq!(
            compare(&pager, &region, KS, 0, b"aaaa").unwrap(),
            Ordering::Greater
        );
        // A needle that is a strict prefix of the inline area loses.
        assert_eq!(
            compare(&pager, &region, KS, 0, b"zzzz").unwrap(),
            Ordering::Greater
        );
        // Equal prefix forces the full comparison.
        assert_eq!(
            compare(&pager, &region, KS, 0, b"zzzzzzzz-extended-tail").unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            compare(&pager, &region, KS, 0, b"zzzzzzzz-extended-tailz").unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn lower_bound_over_mixed_slots() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let mut region = vec![0u8; 10 * slot_width(KS)];

        insert_keys(
            &pager,
            &mut region,
            &[b"apple", b"banana-very-long-extended-key", b"cherry"],
        );

        assert_eq!(
            lower_bound(&pager, &region, KS, 3, b"apple").unwrap(),
            Bound::Exact(0)
        );
        assert_eq!(
            lower_bound(&pager, &region, KS, 3, b"banana-very-long-extended-key").unwrap(),
            Bound::Exact(1)
        );
        assert_eq!(
            lower_bound(&pager, &region, KS, 3, b"azzz").unwrap(),
            Bound::Insert(1)
        );
        assert_eq!(
            lower_bound(&pager, &region, KS, 3, b"zebra").unwrap(),
            Bound::Insert(3)
        );
    }

    #[test]
    fn remove_frees_extended_blob() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let mut region = vec![0u8; 10 * slot_width(KS)];

        insert_keys(
            &pager,
            &mut region,
            &[b"aaa", b"bbbbbbbbbbbbbbbb-extended", b"ccc"],
        );
        let pages_before = pager.page_count();

        remove_at(&pager, &mut region, KS, 3, 1).unwrap();
        assert_eq!(materialize(&pager, &region, KS, 0).unwrap(), b"aaa");
        assert_eq!(materialize(&pager, &region, KS, 1).unwrap(), b"ccc");

        // The freed blob page is reusable without growing the file.
        let prepared = prepare(&pager, b"dddddddddddddddd-extended", KS).unwrap();
        insert_prepared(&mut region, KS, 2, 2, &prepared);
        assert_eq!(pager.page_count(), pages_before);
    }
}
