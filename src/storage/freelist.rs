//! # Freelist Trunk Pages
//!
//! Freed pages are tracked in memory and persisted at flush time into a
//! chain of freelist trunk pages. Each trunk holds a count and an array of
//! 64-bit page ids in its payload; trunks chain through the page header's
//! `right` field.
//!
//! The chain is self-hosting: trunk pages are themselves drawn from the
//! free pool when the chain is rebuilt, and returned to it before the next
//! rebuild.
//!
//! ## Trunk Payload Layout
//!
//! ```text
//! +-------------+------------------+
//! | count (u16) | reserved (6 B)   |
//! +-------------+------------------+
//! | entry 0 (u64)                  |
//! | entry 1 (u64)                  |
//! | ...                            |
//! +--------------------------------+
//! ```

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::PAGE_HEADER_SIZE;
use crate::storage::page::{self, PageHeader, PageId, PageType};

pub const TRUNK_HEADER_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TrunkHeader {
    count: u16,
    reserved: [u8; 6],
}

/// Number of page ids one trunk page can hold.
pub fn entries_per_trunk(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE - TRUNK_HEADER_SIZE) / 8
}

/// Serializes one trunk page in `buf`. Returns the number of entries taken
/// from `entries`.
pub fn write_trunk(
    buf: &mut [u8],
    trunk_id: PageId,
    next: PageId,
    entries: &[PageId],
) -> Result<usize> {
    let take = entries.len().min(entries_per_trunk(buf.len()));

    buf.fill(0);
    let mut header = PageHeader::new(PageType::Freelist, trunk_id);
    header.set_next_in_chain(next);
    header.write_to(buf)?;

    let payload = page::payload_mut(buf);
    let trunk = TrunkHeader {
        count: take as u16,
        reserved: [0; 6],
    };
    payload[..TRUNK_HEADER_SIZE].copy_from_slice(trunk.as_bytes());

    for (i, id) in entries[..take].iter().enumerate() {
        let off = TRUNK_HEADER_SIZE + i * 8;
        payload[off..off + 8].copy_from_slice(&id.to_le_bytes());
    }

    Ok(take)
}

/// Reads the entries and the next-chain pointer out of a trunk page.
pub fn read_trunk(buf: &[u8], trunk_id: PageId) -> Result<(Vec<PageId>, PageId)> {
    let header = PageHeader::from_bytes(buf)?;
    ensure!(
        header.page_type() == PageType::Freelist,
        "page {} is not a freelist trunk (type {:?})",
        trunk_id,
        header.page_type()
    );

    let payload = page::payload(buf);
    let trunk = TrunkHeader::read_from_bytes(&payload[..TRUNK_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read TrunkHeader: {:?}", e))?;
    let count = trunk.count as usize;
    ensure!(
        count <= entries_per_trunk(buf.len()),
        "trunk page {} claims {} entries, capacity is {}",
        trunk_id,
        count,
        entries_per_trunk(buf.len())
    );

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let off = TRUNK_HEADER_SIZE + i * 8;
        entries.push(PageId::from_le_bytes(
            payload[off..off + 8].try_into().unwrap(), // INVARIANT: bounds checked against entries_per_trunk above
        ));
    }

    Ok((entries, header.next_in_chain()))
}
