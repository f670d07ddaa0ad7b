//! # Fixed-Width Key List
//!
//! Keys of a fixed width (4 or 8 bytes) stored back to back in the key
//! region of a node payload. Lookup is a binary search under the typed
//! comparator; insertion shifts the tail with one `copy_within`.

use std::cmp::Ordering;

use crate::btree::keylist::Bound;
use crate::encoding::keys::KeyType;

pub fn key_at(region: &[u8], width: usize, slot: usize) -> &[u8] {
    &region[slot * width..(slot + 1) * width]
}

pub fn lower_bound(
    region: &[u8],
    width: usize,
    count: usize,
    key_type: KeyType,
    needle: &[u8],
) -> Bound {
    let mut lo = 0usize;
    let mut hi = count;

    while lo < hi {
        let mid = (lo + hi) / 2;
        match key_type.compare(key_at(region, width, mid), needle) {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Bound::Exact(mid),
            Ordering::Greater => hi = mid,
        }
    }

    Bound::Insert(lo)
}

/// Shifts `[slot, count)` right by one and writes `key` at `slot`.
pub fn insert_at(region: &mut [u8], width: usize, count: usize, slot: usize, key: &[u8]) {
    debug_assert_eq!(key.len(), width);
    let start = slot * width;
    region.copy_within(start..count * width, start + width);
    region[start..start + width].copy_from_slice(key);
}

/// Removes the key at `slot`, shifting the tail left.
pub fn remove_at(region: &mut [u8], width: usize, count: usize, slot: usize) {
    let start = slot * width;
    region.copy_within(start + width..count * width, start);
}

/// Copies keys `[from, from + n)` of `src` to the front of `dst`.
pub fn copy_range(src: &[u8], dst: &mut [u8], width: usize, from: usize, n: usize) {
    dst[..n * width].copy_from_slice(&src[from * width..(from + n) * width]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with(keys: &[u32]) -> Vec<u8> {
        let mut region = vec![0u8; 256];
        for (i, k) in keys.iter().enumerate() {
            region[i * 4..i * 4 + 4].copy_from_slice(&k.to_le_bytes());
        }
        region
    }

    #[test]
    fn lower_bound_finds_exact_and_gaps() {
        let region = region_with(&[10, 20, 30]);
        let lb = |needle: u32| lower_bound(&region, 4, 3, KeyType::U32, &needle.to_le_bytes());

        assert_eq!(lb(10), Bound::Exact(0));
        assert_eq!(lb(30), Bound::Exact(2));
        assert_eq!(lb(5), Bound::Insert(0));
        assert_eq!(lb(15), Bound::Insert(1));
        assert_eq!(lb(31), Bound::Insert(3));
    }

    #[test]
    fn insert_shifts_tail() {
        let mut region = region_with(&[10, 30, 40]);
        insert_at(&mut region, 4, 3, 1, &20u32.to_le_bytes());
        for (i, expect) in [10u32, 20, 30, 40].iter().enumerate() {
            assert_eq!(key_at(&region, 4, i), expect.to_le_bytes());
        }
    }

    #[test]
    fn remove_shifts_tail() {
        let mut region = region_with(&[10, 20, 30, 40]);
        remove_at(&mut region, 4, 4, 1);
        for (i, expect) in [10u32, 30, 40].iter().enumerate() {
            assert_eq!(key_at(&region, 4, i), expect.to_le_bytes());
        }
    }

    #[test]
    fn copy_range_moves_upper_half() {
        let src = region_with(&[1, 2, 3, 4, 5, 6]);
        let mut dst = vec![0u8; 256];
        copy_range(&src, &mut dst, 4, 3, 3);
        for (i, expect) in [4u32, 5, 6].iter().enumerate() {
            assert_eq!(key_at(&dst, 4, i), expect.to_le_bytes());
        }
    }

    #[test]
    fn u64_width_works() {
        let mut region = vec![0u8; 256];
        for (i, k) in [100u64, 200, 300].iter().enumerate() {
            region[i * 8..i * 8 + 8].copy_from_slice(&k.to_le_bytes());
        }
        assert_eq!(
            lower_bound(&region, 8, 3, KeyType::U64, &200u64.to_le_bytes()),
            Bound::Exact(1)
        );
        assert_eq!(
            lower_bound(&region, 8, 3, KeyType::U64, &250u64.to_le_bytes()),
            Bound::Insert(2)
        );
    }
}
