//! # Transaction Staging
//!
//! Inserts made inside a transaction stage in an ordered in-memory map
//! instead of mutating the B+tree. Committing marks the entries visible;
//! they stay staged until an explicit flush drains them into the tree.
//! Reads and scans therefore always consult two ordered sources, the
//! committed staging and the tree, with the staged entry winning ties
//! (it is a pending overwrite).
//!
//! ## Ordering
//!
//! The staging map must order keys exactly like the tree's comparator.
//! Keys are mapped to byte-comparable *order keys* (big-endian integers,
//! sign-massaged floats, raw binary) so a plain `BTreeMap` iterates in
//! comparator order.
//!
//! ## Lifecycle
//!
//! ```text
//! begin ──> stage (per-transaction buffer) ──commit──> committed staging
//!                      │                                     │
//!                    abort                                  flush
//!                      v                                     v
//!                   dropped                            B+tree inserts
//! ```
//!
//! A scan snapshots the committed staging when it opens, so a commit that
//! lands mid-scan is either fully visible or not at all.

use std::collections::BTreeMap;

use eyre::Result;
use hashbrown::HashMap;

use crate::encoding::keys::{decode_u32, decode_u64, KeyType};
use crate::error::DbError;

pub type TxnId = u64;

/// Caller-held handle for an open transaction, bound to one database.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) db_id: u16,
    pub(crate) id: TxnId,
}

impl Transaction {
    pub fn db_id(&self) -> u16 {
        self.db_id
    }

    pub fn id(&self) -> TxnId {
        self.id
    }
}

/// Maps a key to a byte-comparable form under its type's comparator.
pub fn order_key(key_type: KeyType, key: &[u8]) -> Vec<u8> {
    match key_type {
        KeyType::U32 => decode_u32(key).to_be_bytes().to_vec(),
        KeyType::U64 => decode_u64(key).to_be_bytes().to_vec(),
        KeyType::F32 => {
            let bits = decode_u32(key);
            let massaged = if bits & 0x8000_0000 != 0 {
                !bits
            } else {
                bits ^ 0x8000_0000
            };
            massaged.to_be_bytes().to_vec()
        }
        KeyType::F64 => {
            let bits = decode_u64(key);
            let massaged = if bits & 0x8000_0000_0000_0000 != 0 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            massaged.to_be_bytes().to_vec()
        }
        KeyType::Binary => key.to_vec(),
    }
}

#[derive(Debug, Clone)]
pub struct StagedEntry {
    pub key: Vec<u8>,
    pub record: Vec<u8>,
}

/// Per-database staging area.
pub struct TxnStore {
    key_type: KeyType,
    committed: BTreeMap<Vec<u8>, StagedEntry>,
    active: HashMap<TxnId, Vec<StagedEntry>>,
}

impl TxnStore {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            committed: BTreeMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn begin(&mut self, id: TxnId) {
        self.active.insert(id, Vec::new());
    }

    /// Buffers an insert under an open transaction.
    pub fn stage(&mut self, txn: TxnId, key: &[u8], record: &[u8]) -> Result<()> {
        match self.active.get_mut(&txn) {
            Some(buffer) => {
                buffer.push(StagedEntry {
                    key: key.to_vec(),
                    record: record.to_vec(),
                });
                Ok(())
            }
            None => Err(DbError::invalid(format!("transaction {} is not open", txn))),
        }
    }

    /// True if `key` is staged by this open transaction.
    pub fn staged_by(&self, txn: TxnId, key: &[u8]) -> bool {
        self.active
            .get(&txn)
            .map(|buffer| buffer.iter().any(|e| e.key == key))
            .unwrap_or(false)
    }

    /// Committed-staging lookup.
    pub fn get_committed(&self, key: &[u8]) -> Option<&StagedEntry> {
        self.committed.get(&order_key(self.key_type, key))
    }

    pub fn commit(&mut self, txn: TxnId) -> Result<usize> {
        let buffer = self
            .active
            .remove(&txn)
            .ok_or_else(|| DbError::invalid(format!("transaction {} is not open", txn)))?;
        let count = buffer.len();
        for entry in buffer {
            let ok = order_key(self.key_type, &entry.key);
            self.committed.insert(ok, entry);
        }
        Ok(count)
    }

    pub fn abort(&mut self, txn: TxnId) -> Result<()> {
        self.active
            .remove(&txn)
            .map(|_| ())
            .ok_or_else(|| DbError::invalid(format!("transaction {} is not open", txn)))
    }

    /// Removes a committed staged entry (an erase overrode it).
    pub fn remove_committed(&mut self, key: &[u8]) -> bool {
        self.committed
            .remove(&order_key(self.key_type, key))
            .is_some()
    }

    /// Ordered snapshot of the committed staging for a scan, bounded
    /// below (inclusive) when a range start is given.
    pub fn snapshot(&self, start: Option<&[u8]>) -> Vec<StagedEntry> {
        match start {
            None => self.committed.values().cloned().collect(),
            Some(start) => {
                let from = order_key(self.key_type, start);
                self.committed
                    .range(from..)
                    .map(|(_, e)| e.clone())
                    .collect()
            }
        }
    }

    /// Drains the committed staging for a flush into the tree.
    pub fn drain_committed(&mut self) -> Vec<StagedEntry> {
        std::mem::take(&mut self.committed).into_values().collect()
    }

    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    pub fn has_open_transactions(&self) -> bool {
        !self.active.is_empty()
    }
}
