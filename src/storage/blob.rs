//! # Blob Store
//!
//! Storage for byte strings that do not fit inline: oversized records,
//! extended keys and duplicate tables. A blob is a chain of blob pages; the
//! blob id is the page id of the head page.
//!
//! ## Layout
//!
//! ```text
//! head page payload:    | total_size (u64) | data ...          |
//! continuation payload: | data ...                             |
//! ```
//!
//! Pages chain through the page header's `right` field. Blob pages are
//! appended under the same exclusive write claim as the B+tree, so the
//! chain is never observed half-built.

use eyre::{ensure, Result};

use crate::storage::page::{self, PageHeader, PageId, PageType};
use crate::storage::pager::Pager;

/// Identifier of a stored blob: the head page id.
pub type BlobId = PageId;

const BLOB_HEAD_PREFIX: usize = 8;

/// Writes `data` into a fresh chain of blob pages and returns its id.
pub fn allocate(pager: &Pager, data: &[u8]) -> Result<BlobId> {
    let payload_size = pager.payload_size();

    let mut head = pager.allocate(PageType::Blob)?;
    let head_id = head.id();
    {
        let buf = head.data_mut();
        let payload = page::payload_mut(buf);
        payload[..BLOB_HEAD_PREFIX].copy_from_slice(&(data.len() as u64).to_le_bytes());
        let take = data.len().min(payload_size - BLOB_HEAD_PREFIX);
        payload[BLOB_HEAD_PREFIX..BLOB_HEAD_PREFIX + take].copy_from_slice(&data[..take]);
    }

    let mut written = (payload_size - BLOB_HEAD_PREFIX).min(data.len());
    let mut prev = head;

    while written < data.len() {
        let mut next = pager.allocate(PageType::Blob)?;
        let next_id = next.id();
        PageHeader::from_bytes_mut(prev.data_mut())?.set_next_in_chain(next_id);
        drop(prev);

        let take = (data.len() - written).min(payload_size);
        let buf = next.data_mut();
        page::payload_mut(buf)[..take].copy_from_slice(&data[written..written + take]);
        written += take;
        prev = next;
    }

    Ok(head_id)
}

/// Reads a blob back into an owned buffer.
pub fn read(pager: &Pager, id: BlobId) -> Result<Vec<u8>> {
    let payload_size = pager.payload_size();

    let head = pager.fetch(id)?;
    let header = PageHeader::from_bytes(head.data())?;
    ensure!(
        header.page_type() == PageType::Blob,
        "page {} is not a blob page (type {:?})",
        id,
        header.page_type()
    );

    let payload = page::payload(head.data());
    let total = u64::from_le_bytes(payload[..BLOB_HEAD_PREFIX].try_into().unwrap()) as usize; // INVARIANT: payload >= MIN_PAGE_SIZE - header
    let mut out = Vec::with_capacity(total);

    let take = total.min(payload_size - BLOB_HEAD_PREFIX);
    out.extend_from_slice(&payload[BLOB_HEAD_PREFIX..BLOB_HEAD_PREFIX + take]);
    let mut next = header.next_in_chain();
    drop(head);

    while out.len() < total {
        ensure!(next != 0, "blob {} chain ends {} bytes short", id, total - out.len());
        let cont = pager.fetch(next)?;
        let header = PageHeader::from_bytes(cont.data())?;
        ensure!(
            header.page_type() == PageType::Blob,
            "blob {} chain reached non-blob page {}",
            id,
            next
        );
        let take = (total - out.len()).min(payload_size);
        out.extend_from_slice(&page::payload(cont.data())[..take]);
        next = header.next_in_chain();
    }

    Ok(out)
}

/// Releases every page of a blob chain back to the freelist.
pub fn free(pager: &Pager, id: BlobId) -> Result<()> {
    let mut next = id;
    while next != 0 {
        let chained = {
            let page = pager.fetch(next)?;
            let header = PageHeader::from_bytes(page.data())?;
            ensure!(
                header.page_type() == PageType::Blob,
                "freeing non-blob page {} in chain of blob {}",
                next,
                id
            );
            header.next_in_chain()
        };
        pager.free(next);
        next = chained;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOptions;
    use tempfile::tempdir;

    fn test_pager(dir: &tempfile::TempDir) -> Pager {
        let options = EnvOptions::new().page_size(1024).cache_capacity(64);
        Pager::create(&dir.path().join("blob.loam"), &options).unwrap()
    }

    #[test]
    fn small_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let id = allocate(&pager, b"hello blob").unwrap();
        assert_eq!(read(&pager, id).unwrap(), b"hello blob");
    }

    #[test]
    fn empty_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let id = allocate(&pager, b"").unwrap();
        assert_eq!(read(&pager, id).unwrap(), b"");
    }

    #[test]
    fn multi_page_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        // Spans four 1 KiB pages.
        let data: Vec<u8> = (0..3500u32).map(|i| (i % 251) as u8).collect();
        let id = allocate(&pager, &data).unwrap();
        assert_eq!(read(&pager, id).unwrap(), data);
    }

    #[test]
    fn blob_survives_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.loam");
        let options = EnvOptions::new().page_size(1024).cache_capacity(64);

        let data: Vec<u8> = (0..2500u32).map(|i| (i % 199) as u8).collect();
        let id = {
            let pager = Pager::create(&path, &options).unwrap();
            let id = allocate(&pager, &data).unwrap();
            pager.flush().unwrap();
            id
        };

        let pager = Pager::open(&path, &options).unwrap();
        assert_eq!(read(&pager, id).unwrap(), data);
    }

    #[test]
    fn free_returns_chain_to_pool() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let data = vec![7u8; 3000];
        let id = allocate(&pager, &data).unwrap();
        let grown = pager.page_count();

        free(&pager, id).unwrap();
        // All chain pages are reusable: allocating the same amount again
        // must not grow the file.
        let id2 = allocate(&pager, &data).unwrap();
        assert_eq!(pager.page_count(), grown);
        assert_eq!(read(&pager, id2).unwrap(), data);
    }
}
