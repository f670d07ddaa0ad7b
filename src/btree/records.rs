//! # Record Lists
//!
//! Leaf nodes pair every key with a fixed 9-byte record entry; internal
//! nodes pair every separator with an 8-byte child pointer. Keeping the
//! entries fixed-width makes slot shifts a single `copy_within`.
//!
//! ## Leaf Entry Layout (9 bytes)
//!
//! ```text
//! +------+----------------------------------+
//! | flag | payload (8 bytes)                |
//! +------+----------------------------------+
//! flag 0x00..=0x08 : inline record, flag = length, payload = bytes
//! flag 0x40        : payload = blob id of an oversized record
//! flag 0x80        : payload = blob id of a duplicate table
//! ```
//!
//! ## Duplicate Tables
//!
//! A key with duplicates points at a blob containing a count followed by
//! plain (non-duplicate) record entries:
//!
//! ```text
//! | count (u32) | entry 0 (9 B) | entry 1 (9 B) | ...
//! ```
//!
//! Appending a duplicate rewrites the table blob. Every mutation happens
//! under the exclusive write claim, so readers never see a half-written
//! table.

use eyre::{ensure, Result};

use crate::config::{MAX_INLINE_RECORD, RECORD_ENTRY_SIZE};
use crate::storage::blob::{self, BlobId};
use crate::storage::pager::Pager;

const FLAG_BLOB: u8 = 0x40;
const FLAG_DUP_TABLE: u8 = 0x80;

/// One leaf record entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRef {
    Inline { len: u8, bytes: [u8; 8] },
    Blob(BlobId),
    DupTable(BlobId),
}

impl RecordRef {
    pub fn encode(&self) -> [u8; RECORD_ENTRY_SIZE] {
        let mut out = [0u8; RECORD_ENTRY_SIZE];
        match self {
            RecordRef::Inline { len, bytes } => {
                debug_assert!(*len as usize <= MAX_INLINE_RECORD);
                out[0] = *len;
                out[1..9].copy_from_slice(bytes);
            }
            RecordRef::Blob(id) => {
                out[0] = FLAG_BLOB;
                out[1..9].copy_from_slice(&id.to_le_bytes());
            }
            RecordRef::DupTable(id) => {
                out[0] = FLAG_DUP_TABLE;
                out[1..9].copy_from_slice(&id.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() >= RECORD_ENTRY_SIZE,
            "record entry truncated: {} bytes",
            buf.len()
        );
        let payload: [u8; 8] = buf[1..9].try_into().unwrap(); // INVARIANT: length checked above
        Ok(match buf[0] {
            len @ 0..=8 => RecordRef::Inline {
                len,
                bytes: payload,
            },
            FLAG_BLOB => RecordRef::Blob(BlobId::from_le_bytes(payload)),
            FLAG_DUP_TABLE => RecordRef::DupTable(BlobId::from_le_bytes(payload)),
            other => eyre::bail!("corrupt record entry flag {:#04x}", other),
        })
    }

    pub fn is_dup_table(&self) -> bool {
        matches!(self, RecordRef::DupTable(_))
    }
}

/// Builds an entry for a record, spilling oversized records to the blob
/// store.
pub fn make_entry(pager: &Pager, record: &[u8]) -> Result<RecordRef> {
    if record.len() <= MAX_INLINE_RECORD {
        let mut bytes = [0u8; 8];
        bytes[..record.len()].copy_from_slice(record);
        Ok(RecordRef::Inline {
            len: record.len() as u8,
            bytes,
        })
    } else {
        Ok(RecordRef::Blob(blob::allocate(pager, record)?))
    }
}

/// Materializes the record behind an entry. Duplicate tables resolve to
/// the entry at `dup_index`.
pub fn resolve(pager: &Pager, entry: RecordRef, dup_index: u32) -> Result<Vec<u8>> {
    match entry {
        RecordRef::Inline { len, bytes } => Ok(bytes[..len as usize].to_vec()),
        RecordRef::Blob(id) => blob::read(pager, id),
        RecordRef::DupTable(id) => {
            let inner = dup_table_get(pager, id, dup_index)?;
            resolve(pager, inner, 0)
        }
    }
}

/// Frees everything an entry owns: a record blob, or a duplicate table
/// and every blob it references.
pub fn free_entry(pager: &Pager, entry: RecordRef) -> Result<()> {
    match entry {
        RecordRef::Inline { .. } => Ok(()),
        RecordRef::Blob(id) => blob::free(pager, id),
        RecordRef::DupTable(id) => {
            let entries = dup_table_read(pager, id)?;
            for inner in entries {
                if let RecordRef::Blob(blob_id) = inner {
                    blob::free(pager, blob_id)?;
                }
            }
            blob::free(pager, id)
        }
    }
}

// ----------------------------------------------------------------------
// duplicate tables
// ----------------------------------------------------------------------

fn dup_table_read(pager: &Pager, id: BlobId) -> Result<Vec<RecordRef>> {
    let raw = blob::read(pager, id)?;
    ensure!(raw.len() >= 4, "duplicate table too short: {} bytes", raw.len());
    let count = u32::from_le_bytes(raw[..4].try_into().unwrap()) as usize; // INVARIANT: length checked above
    ensure!(
        raw.len() >= 4 + count * RECORD_ENTRY_SIZE,
        "duplicate table claims {} entries in {} bytes",
        count,
        raw.len()
    );

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * RECORD_ENTRY_SIZE;
        let entry = RecordRef::decode(&raw[off..off + RECORD_ENTRY_SIZE])?;
        ensure!(!entry.is_dup_table(), "nested duplicate table");
        out.push(entry);
    }
    Ok(out)
}

fn dup_table_write(pager: &Pager, entries: &[RecordRef]) -> Result<BlobId> {
    let mut raw = Vec::with_capacity(4 + entries.len() * RECORD_ENTRY_SIZE);
    raw.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        raw.extend_from_slice(&entry.encode());
    }
    blob::allocate(pager, &raw)
}

pub fn dup_table_len(pager: &Pager, id: BlobId) -> Result<u32> {
    let raw = blob::read(pager, id)?;
    ensure!(raw.len() >= 4, "duplicate table too short");
    Ok(u32::from_le_bytes(raw[..4].try_into().unwrap())) // INVARIANT: length checked above
}

fn dup_table_get(pager: &Pager, id: BlobId, index: u32) -> Result<RecordRef> {
    let entries = dup_table_read(pager, id)?;
    ensure!(
        (index as usize) < entries.len(),
        "duplicate index {} out of range ({} entries)",
        index,
        entries.len()
    );
    Ok(entries[index as usize])
}

/// Appends a duplicate to an existing entry, converting a plain entry into
/// a duplicate table on first use. Returns the new entry and the index of
/// the appended duplicate.
pub fn append_duplicate(
    pager: &Pager,
    existing: RecordRef,
    record: &[u8],
) -> Result<(RecordRef, u32)> {
    let fresh = make_entry(pager, record)?;
    match existing {
        RecordRef::DupTable(id) => {
            let mut entries = dup_table_read(pager, id)?;
            entries.push(fresh);
            let new_id = dup_table_write(pager, &entries)?;
            blob::free(pager, id)?;
            Ok((RecordRef::DupTable(new_id), entries.len() as u32 - 1))
        }
        plain => {
            let entries = [plain, fresh];
            let id = dup_table_write(pager, &entries)?;
            Ok((RecordRef::DupTable(id), 1))
        }
    }
}

/// Number of duplicates behind an entry (1 for plain entries).
pub fn duplicate_count(pager: &Pager, entry: RecordRef) -> Result<u32> {
    match entry {
        RecordRef::DupTable(id) => dup_table_len(pager, id),
        _ => Ok(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOptions;
    use tempfile::tempdir;

    fn test_pager(dir: &tempfile::TempDir) -> Pager {
        let options = EnvOptions::new().page_size(1024).cache_capacity(64);
        Pager::create(&dir.path().join("records.loam"), &options).unwrap()
    }

    #[test]
    fn entry_encoding_roundtrip() {
        let inline = RecordRef::Inline {
            len: 3,
            bytes: *b"abc\0\0\0\0\0",
        };
        assert_eq!(RecordRef::decode(&inline.encode()).unwrap(), inline);

        let blob = RecordRef::Blob(0xDEAD_BEEF);
        assert_eq!(RecordRef::decode(&blob.encode()).unwrap(), blob);

        let dup = RecordRef::DupTable(42);
        assert_eq!(RecordRef::decode(&dup.encode()).unwrap(), dup);
    }

    #[test]
    fn corrupt_flag_rejected() {
        let mut buf = [0u8; RECORD_ENTRY_SIZE];
        buf[0] = 0x33;
        assert!(RecordRef::decode(&buf).is_err());
    }

    #[test]
    fn small_records_stay_inline() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let entry = make_entry(&pager, b"tiny").unwrap();
        assert!(matches!(entry, RecordRef::Inline { len: 4, .. }));
        assert_eq!(resolve(&pager, entry, 0).unwrap(), b"tiny");
    }

    #[test]
    fn empty_record_is_inline() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);
        let entry = make_entry(&pager, b"").unwrap();
        assert!(matches!(entry, RecordRef::Inline { len: 0, .. }));
        assert_eq!(resolve(&pager, entry, 0).unwrap(), b"");
    }

    #[test]
    fn oversized_records_go_to_blobs() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let record = vec![9u8; 500];
        let entry = make_entry(&pager, &record).unwrap();
        assert!(matches!(entry, RecordRef::Blob(_)));
        assert_eq!(resolve(&pager, entry, 0).unwrap(), record);

        free_entry(&pager, entry).unwrap();
    }

    #[test]
    fn duplicate_chain_append_and_resolve() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let first = make_entry(&pager, b"one").unwrap();
        let (table, idx) = append_duplicate(&pager, first, b"two").unwrap();
        assert_eq!(idx, 1);
        assert!(table.is_dup_table());

        let (table, idx) = append_duplicate(&pager, table, b"three").unwrap();
        assert_eq!(idx, 2);

        assert_eq!(duplicate_count(&pager, table).unwrap(), 3);
        assert_eq!(resolve(&pager, table, 0).unwrap(), b"one");
        assert_eq!(resolve(&pager, table, 1).unwrap(), b"two");
        assert_eq!(resolve(&pager, table, 2).unwrap(), b"three");
        assert!(resolve(&pager, table, 3).is_err());

        free_entry(&pager, table).unwrap();
    }

    #[test]
    fn duplicates_with_oversized_records() {
        let dir = tempdir().unwrap();
        let pager = test_pager(&dir);

        let big = vec![1u8; 400];
        let first = make_entry(&pager, &big).unwrap();
        let (table, _) = append_duplicate(&pager, first, b"small").unwrap();

        assert_eq!(resolve(&pager, table, 0).unwrap(), big);
        assert_eq!(resolve(&pager, table, 1).unwrap(), b"small");

        free_entry(&pager, table).unwrap();
    }
}
