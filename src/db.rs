//! # Environment and Public API
//!
//! An [`Env`] is one database file holding up to
//! [`MAX_DATABASES`](crate::config::MAX_DATABASES) numbered databases,
//! each a B+tree with its own key type and staging
//! area. All operations go through the environment handle; mutation
//! requires `&mut Env`, which is the exclusive write claim of the
//! single-writer model.
//!
//! ## Quick Start
//!
//! ```ignore
//! use loamdb::{DbConfig, Env, EnvOptions, InsertFlags, KeyType};
//!
//! let mut env = Env::create("./data.loam", EnvOptions::default())?;
//! env.create_db(1, DbConfig::new(KeyType::U32).compressed(true))?;
//!
//! env.insert(1, None, &7u32.to_le_bytes(), b"payload", InsertFlags::empty())?;
//! let hit = env.find(1, &7u32.to_le_bytes(), FindFlags::empty())?;
//! assert_eq!(hit.record, b"payload");
//!
//! let result = env.select("COUNT($key) FROM DATABASE 1")?;
//! env.flush()?;
//! ```
//!
//! ## Reads, Writes and Staging
//!
//! Inserts outside a transaction go straight into the tree. Inserts under
//! a [`Transaction`] stage in memory; committing makes them visible to
//! finds and scans (the merge reader), and [`Env::flush`] drains them
//! into the tree.

use std::path::Path;

use eyre::Result;
use hashbrown::HashMap;

use crate::btree::cursor::{Cursor, CursorPos};
use crate::btree::find::{self, FindResult};
use crate::btree::node::IndexConfig;
use crate::btree::{erase as btree_erase, insert as btree_insert};
use crate::btree::{Approx, BtreeIndex, FindFlags, InsertFlags};
use crate::config::{DEFAULT_BINARY_KEY_SIZE, EnvOptions};
use crate::encoding::keys::KeyType;
use crate::error::DbError;
use crate::query::parser::{self, ParsedQuery};
use crate::query::plugins::{PluginRegistry, PredicateFn, QueryResult};
use crate::scan::merge::MergeScan;
use crate::scan::{CancelToken, LeafScan};
use crate::storage::pager::{
    DbSlot, Pager, DB_FLAG_COMPRESSED, DB_FLAG_DUPLICATES, DB_FLAG_RECORD_NUMBER,
};
use crate::txn::{Transaction, TxnStore};

/// Per-database creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct DbConfig {
    pub key_type: KeyType,
    /// Inline key size for binary databases; ignored for fixed-width
    /// types.
    pub key_size: u16,
    pub record_number: bool,
    pub duplicates: bool,
    /// Group-varint block compression; u32 keys only.
    pub compressed: bool,
}

impl DbConfig {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            key_size: key_type
                .fixed_width()
                .map(|w| w as u16)
                .unwrap_or(DEFAULT_BINARY_KEY_SIZE),
            record_number: false,
            duplicates: false,
            compressed: false,
        }
    }

    pub fn key_size(mut self, size: u16) -> Self {
        if self.key_type == KeyType::Binary {
            self.key_size = size;
        }
        self
    }

    pub fn record_number(mut self, on: bool) -> Self {
        self.record_number = on;
        self
    }

    pub fn duplicates(mut self, on: bool) -> Self {
        self.duplicates = on;
        self
    }

    pub fn compressed(mut self, on: bool) -> Self {
        self.compressed = on;
        self
    }

    fn to_index_config(self, page_size: usize) -> IndexConfig {
        IndexConfig {
            key_type: self.key_type,
            key_size: self.key_size,
            record_number: self.record_number,
            duplicates: self.duplicates,
            compressed: self.compressed,
            page_size,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.record_number {
            flags |= DB_FLAG_RECORD_NUMBER;
        }
        if self.duplicates {
            flags |= DB_FLAG_DUPLICATES;
        }
        if self.compressed {
            flags |= DB_FLAG_COMPRESSED;
        }
        flags
    }
}

/// Outcome of a find: the matched key (for approximate results, unless
/// suppressed), the record, and how the match relates to the needle.
#[derive(Debug)]
pub struct FindOutput {
    pub key: Option<Vec<u8>>,
    pub record: Vec<u8>,
    pub approx: Approx,
}

struct DatabaseState {
    index: BtreeIndex,
    staging: TxnStore,
}

pub struct Env {
    pager: Pager,
    databases: HashMap<u16, DatabaseState>,
    plugins: PluginRegistry,
    next_txn: u64,
}

impl Env {
    /// Creates a new environment file.
    pub fn create(path: impl AsRef<Path>, options: EnvOptions) -> Result<Self> {
        let pager = Pager::create(path.as_ref(), &options)?;
        Ok(Self {
            pager,
            databases: HashMap::new(),
            plugins: PluginRegistry::new(),
            next_txn: 1,
        })
    }

    /// Opens an existing environment and every database in its directory.
    pub fn open(path: impl AsRef<Path>, options: EnvOptions) -> Result<Self> {
        let pager = Pager::open(path.as_ref(), &options)?;
        let mut databases = HashMap::new();

        for db_id in pager.db_ids() {
            let slot = pager.db_slot(db_id).unwrap(); // INVARIANT: id came from the directory
            let key_type = slot.key_type()?;
            let cfg = IndexConfig {
                key_type,
                key_size: slot.key_size,
                record_number: slot.is_record_number(),
                duplicates: slot.allows_duplicates(),
                compressed: slot.is_compressed(),
                page_size: pager.page_size(),
            };
            databases.insert(
                db_id,
                DatabaseState {
                    index: BtreeIndex::open(cfg, slot.root)?,
                    staging: TxnStore::new(key_type),
                },
            );
        }

        Ok(Self {
            pager,
            databases,
            plugins: PluginRegistry::new(),
            next_txn: 1,
        })
    }

    /// Creates a numbered database. Ids are 1-based; the directory holds
    /// up to [`MAX_DATABASES`] entries.
    pub fn create_db(&mut self, db_id: u16, config: DbConfig) -> Result<()> {
        if db_id == 0 {
            return Err(DbError::invalid("database id 0 is reserved"));
        }
        if self.databases.contains_key(&db_id) {
            return Err(DbError::invalid(format!("database {} already exists", db_id)));
        }

        let cfg = config.to_index_config(self.pager.page_size());
        let index = BtreeIndex::create(&self.pager, cfg)?;
        self.pager.put_db_slot(DbSlot::new(
            db_id,
            config.key_type,
            config.flags(),
            cfg.key_size,
            index.root(),
        ))?;
        self.databases.insert(
            db_id,
            DatabaseState {
                index,
                staging: TxnStore::new(config.key_type),
            },
        );
        Ok(())
    }

    pub fn db_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.databases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn state(&self, db_id: u16) -> Result<&DatabaseState> {
        self.databases
            .get(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))
    }

    fn state_mut(&mut self, db_id: u16) -> Result<&mut DatabaseState> {
        self.databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))
    }

    // ------------------------------------------------------------------
    // core operations
    // ------------------------------------------------------------------

    /// Inserts a key/record pair, directly or into a transaction's
    /// staging. `OVERWRITE` replaces an existing record; `DUPLICATE`
    /// appends to the key's duplicate chain (duplicate-enabled databases
    /// only); neither flag makes an existing key an error.
    pub fn insert(
        &mut self,
        db_id: u16,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        if let Some(txn) = txn {
            if txn.db_id != db_id {
                return Err(DbError::invalid("transaction belongs to another database"));
            }
            return self.insert_staged(db_id, txn.id, key, record, flags);
        }

        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;

        // A committed staged entry shadows the tree; resolve the conflict
        // here so overwrite semantics stay exact.
        if state.staging.get_committed(key).is_some() {
            if !flags.contains(InsertFlags::OVERWRITE) {
                return Err(DbError::DuplicateKey.into());
            }
            state.staging.remove_committed(key);
        }

        btree_insert::insert(&mut state.index, pager, None, key, record, flags)?;
        self.pager.set_db_root(db_id, self.state(db_id)?.index.root())?;
        Ok(())
    }

    fn insert_staged(
        &mut self,
        db_id: u16,
        txn_id: u64,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        // Duplicate chains cannot extend through the staging area.
        if flags.contains(InsertFlags::DUPLICATE) {
            return Err(DbError::invalid(
                "duplicate inserts are not supported inside transactions",
            ));
        }

        let exists = {
            let pager = &self.pager;
            let state = self
                .databases
                .get_mut(&db_id)
                .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
            state.index.cfg.key_type.check_key(key)?;

            state.staging.get_committed(key).is_some()
                || state.staging.staged_by(txn_id, key)
                || match find::find(
                    &mut state.index,
                    pager,
                    None,
                    key,
                    FindFlags::DONT_LOAD_KEY,
                ) {
                    Ok(_) => true,
                    Err(err) if DbError::of(&err) == Some(&DbError::KeyNotFound) => false,
                    Err(err) => return Err(err),
                }
        };

        if exists && !flags.contains(InsertFlags::OVERWRITE) {
            return Err(DbError::DuplicateKey.into());
        }

        self.state_mut(db_id)?.staging.stage(txn_id, key, record)
    }

    /// Looks a key up; committed staged entries shadow the tree. See
    /// [`FindFlags`] for approximate matching.
    pub fn find(&mut self, db_id: u16, key: &[u8], flags: FindFlags) -> Result<FindOutput> {
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;

        let lt = flags.contains(FindFlags::LT_MATCH);
        let gt = flags.contains(FindFlags::GT_MATCH);
        let strict_single = lt ^ gt;

        if !strict_single {
            state.index.cfg.key_type.check_key(key)?;
            if let Some(staged) = state.staging.get_committed(key) {
                return Ok(FindOutput {
                    key: None,
                    record: staged.record.clone(),
                    approx: Approx::Exact,
                });
            }
        }

        let result: FindResult = find::find(&mut state.index, pager, None, key, flags)?;

        // An approximate hit may itself carry a staged overwrite.
        let record = match &result.key {
            Some(found) => match state.staging.get_committed(found) {
                Some(staged) => staged.record.clone(),
                None => result.record,
            },
            None => result.record,
        };

        Ok(FindOutput {
            key: result.key,
            record,
            approx: result.approx,
        })
    }

    /// Erases a key from the tree and from the committed staging.
    pub fn erase(&mut self, db_id: u16, key: &[u8]) -> Result<()> {
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cfg.key_type.check_key(key)?;

        let was_staged = state.staging.remove_committed(key);
        match btree_erase::erase(&mut state.index, pager, key) {
            Ok(()) => {}
            Err(err) if DbError::of(&err) == Some(&DbError::KeyNotFound) && was_staged => {}
            Err(err) => return Err(err),
        }
        self.pager.set_db_root(db_id, self.state(db_id)?.index.root())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn txn_begin(&mut self, db_id: u16) -> Result<Transaction> {
        let id = self.next_txn;
        self.next_txn += 1;
        let state = self.state_mut(db_id)?;
        state.staging.begin(id);
        Ok(Transaction { db_id, id })
    }

    pub fn txn_commit(&mut self, txn: Transaction) -> Result<()> {
        let state = self.state_mut(txn.db_id)?;
        let staged = state.staging.commit(txn.id)?;
        log::debug!("txn {} committed {} staged entries", txn.id, staged);
        Ok(())
    }

    pub fn txn_abort(&mut self, txn: Transaction) -> Result<()> {
        let state = self.state_mut(txn.db_id)?;
        state.staging.abort(txn.id)
    }

    // ------------------------------------------------------------------
    // cursors
    // ------------------------------------------------------------------

    pub fn cursor_create(&mut self, db_id: u16) -> Result<Cursor> {
        let state = self.state_mut(db_id)?;
        Ok(state.index.cursor_create(db_id))
    }

    /// Closing a cursor releases its registry entry; the handle is
    /// consumed.
    pub fn cursor_close(&mut self, cursor: Cursor) {
        drop(cursor);
    }

    /// Positions a cursor on a key. An exact needle that lives only in
    /// the committed staging parks the cursor in the uncoupled state on
    /// that key.
    pub fn cursor_find(
        &mut self,
        cursor: &Cursor,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<FindOutput> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;

        match find::find(&mut state.index, pager, Some(cursor), key, flags) {
            Ok(result) => Ok(FindOutput {
                key: result.key,
                record: result.record,
                approx: result.approx,
            }),
            Err(err) if DbError::of(&err) == Some(&DbError::KeyNotFound) => {
                if let Some(staged) = state.staging.get_committed(key) {
                    cursor.set(CursorPos::Uncoupled {
                        key: key.to_vec(),
                        dup: 0,
                    });
                    return Ok(FindOutput {
                        key: None,
                        record: staged.record.clone(),
                        approx: Approx::Exact,
                    });
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Inserts through a cursor: on success the cursor couples to the new
    /// (or overwritten) key, including the duplicate position for
    /// `DUPLICATE` inserts.
    pub fn cursor_insert(
        &mut self,
        cursor: &Cursor,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;

        if state.staging.get_committed(key).is_some() {
            if !flags.contains(InsertFlags::OVERWRITE) {
                return Err(DbError::DuplicateKey.into());
            }
            state.staging.remove_committed(key);
        }

        btree_insert::insert(&mut state.index, pager, Some(cursor), key, record, flags)?;
        self.pager.set_db_root(db_id, self.state(db_id)?.index.root())?;
        Ok(())
    }

    /// Erases the key under the cursor; the cursor goes nil.
    pub fn cursor_erase(&mut self, cursor: &Cursor) -> Result<()> {
        let key = self.cursor_key(cursor)?;
        self.erase(cursor.db_id, &key)
    }

    pub fn cursor_first(&mut self, cursor: &Cursor) -> Result<()> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cursor_first(pager, cursor)
    }

    pub fn cursor_last(&mut self, cursor: &Cursor) -> Result<()> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cursor_last(pager, cursor)
    }

    pub fn cursor_next(&mut self, cursor: &Cursor) -> Result<()> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cursor_next(pager, cursor)
    }

    pub fn cursor_prev(&mut self, cursor: &Cursor) -> Result<()> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cursor_prev(pager, cursor)
    }

    pub fn cursor_key(&self, cursor: &Cursor) -> Result<Vec<u8>> {
        let state = self.state(cursor.db_id)?;
        state.index.cursor_key(&self.pager, cursor)
    }

    pub fn cursor_record(&mut self, cursor: &Cursor) -> Result<Vec<u8>> {
        let db_id = cursor.db_id;
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cursor_record(pager, cursor)
    }

    /// Returns a cursor coupled to the first key >= `key`.
    pub fn lower_bound(&mut self, db_id: u16, key: &[u8]) -> Result<Cursor> {
        let pager = &self.pager;
        let state = self
            .databases
            .get_mut(&db_id)
            .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;
        state.index.cfg.key_type.check_key(key)?;
        let cursor = state.index.cursor_create(db_id);
        state.index.lower_bound(pager, &cursor, key)?;
        Ok(cursor)
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Registers a predicate plugin for `WHERE name($field)` clauses.
    pub fn register_predicate(&mut self, name: &str, predicate: PredicateFn) {
        self.plugins.register(name, predicate);
    }

    /// Runs an aggregation query over a full database.
    pub fn select(&self, query: &str) -> Result<QueryResult> {
        self.select_bounded(query, None, None, None)
    }

    /// [`Env::select`] with a cancellation token, polled between leaves.
    pub fn select_with_cancel(&self, query: &str, cancel: CancelToken) -> Result<QueryResult> {
        self.select_bounded(query, None, None, Some(cancel))
    }

    /// Runs an aggregation query over the key range `[begin, end)`,
    /// where the bounds come from cursor positions. A nil cursor is an
    /// error; so is a cursor from a database other than the query's.
    pub fn select_range(
        &self,
        query: &str,
        begin: Option<&Cursor>,
        end: Option<&Cursor>,
    ) -> Result<QueryResult> {
        let parsed = parser::parse(query)?;

        let begin_key = match begin {
            Some(cursor) => Some(self.range_bound(&parsed, cursor)?),
            None => None,
        };
        let end_key = match end {
            Some(cursor) => Some(self.range_bound(&parsed, cursor)?),
            None => None,
        };

        self.run_parsed(parsed, begin_key, end_key, None)
    }

    fn range_bound(&self, parsed: &ParsedQuery, cursor: &Cursor) -> Result<Vec<u8>> {
        if cursor.db_id != parsed.db_id {
            return Err(DbError::invalid(
                "cursor belongs to a different database than the query",
            ));
        }
        if cursor.is_nil() {
            return Err(DbError::CursorIsNil.into());
        }
        self.cursor_key(cursor)
    }

    fn select_bounded(
        &self,
        query: &str,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        cancel: Option<CancelToken>,
    ) -> Result<QueryResult> {
        let parsed = parser::parse(query)?;
        self.run_parsed(parsed, begin, end, cancel)
    }

    fn run_parsed(
        &self,
        parsed: ParsedQuery,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        cancel: Option<CancelToken>,
    ) -> Result<QueryResult> {
        let state = self.state(parsed.db_id)?;
        let key_type = state.index.cfg.key_type;

        let tree_scan = LeafScan::new(&state.index, &self.pager, begin.as_deref(), cancel)?;
        let staged = state.staging.snapshot(begin.as_deref());
        let rows = MergeScan::new(key_type, tree_scan, staged, end);

        crate::query::run(&parsed, key_type, &self.plugins, rows)
    }

    // ------------------------------------------------------------------
    // durability
    // ------------------------------------------------------------------

    /// Drains every database's committed staging into its tree, persists
    /// the roots and flushes the pager.
    pub fn flush(&mut self) -> Result<()> {
        let db_ids: Vec<u16> = self.databases.keys().copied().collect();
        for db_id in db_ids {
            let pager = &self.pager;
            let state = self
                .databases
                .get_mut(&db_id)
                .ok_or_else(|| DbError::invalid(format!("unknown database {}", db_id)))?;

            let staged = state.staging.drain_committed();
            if !staged.is_empty() {
                log::debug!("flushing {} staged entries into database {}", staged.len(), db_id);
            }
            for entry in staged {
                btree_insert::insert(
                    &mut state.index,
                    pager,
                    None,
                    &entry.key,
                    &entry.record,
                    InsertFlags::OVERWRITE,
                )?;
            }
            let root = state.index.root();
            self.pager.set_db_root(db_id, root)?;
        }
        self.pager.flush()
    }

    /// Pager statistics hook for tests and tooling.
    pub fn page_count(&self) -> u64 {
        self.pager.page_count()
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("flush on close failed: {err:#}");
        }
    }
}
