//! # LoamDB - Embedded Ordered Key/Value Engine
//!
//! LoamDB is the storage engine of an embedded key/value database: a
//! disk-backed B+tree with pluggable key encodings, an in-memory page
//! cache, transactional staging and a small aggregation query surface.
//!
//! ## Highlights
//!
//! - **Ordered access**: exact and approximate lookup, range scans via
//!   cursors, strictly key-ordered merges of committed and staged data
//! - **Compressed integer keys**: u32 keys can live in group-varint
//!   delta-encoded blocks inside the leaves
//! - **Typed keys**: fixed-width integers and floats, or binary keys with
//!   blob-backed extended storage for oversized values
//! - **Page cache**: sharded SIEVE cache with pin counting; statistics
//!   hints answer hot lookups without a tree descent
//!
//! ## Quick Start
//!
//! ```ignore
//! use loamdb::{DbConfig, Env, EnvOptions, FindFlags, InsertFlags, KeyType};
//!
//! let mut env = Env::create("./data.loam", EnvOptions::default())?;
//! env.create_db(1, DbConfig::new(KeyType::U32).compressed(true))?;
//!
//! for key in 0u32..10 {
//!     env.insert(1, None, &key.to_le_bytes(), b"", InsertFlags::empty())?;
//! }
//!
//! let sum = env.select("SUM($key) FROM DATABASE 1")?;
//! assert_eq!(sum.value.as_u64(), Some(45));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Env (databases, transactions)         │
//! ├──────────────────────────────────────────────┤
//! │   Query (parser, aggregates, predicates)     │
//! ├──────────────────────────────────────────────┤
//! │  Scan (leaf walk ⊕ staging merge reader)     │
//! ├──────────────────────────────────────────────┤
//! │  B+tree (nodes, key lists, cursors, stats)   │
//! ├──────────────────────────────────────────────┤
//! │  Storage (pager, SIEVE cache, blobs, free)   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Single-writer, cooperative: reads may run concurrently with reads, any
//! mutation takes `&mut Env` as its exclusive claim. Long scans poll a
//! [`CancelToken`] between leaves.
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, pager, cache, freelist, blob store
//! - [`btree`]: the B+tree index and its key-list strategies
//! - [`encoding`]: group-varint codec and key comparators
//! - [`txn`]: transaction staging
//! - [`scan`]: leaf walks and the merge reader
//! - [`query`]: the aggregation surface
//! - [`db`]: the public environment API

pub mod btree;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod query;
pub mod scan;
pub mod storage;
pub mod txn;

pub use btree::cursor::Cursor;
pub use btree::{Approx, FindFlags, InsertFlags};
pub use config::EnvOptions;
pub use db::{DbConfig, Env, FindOutput};
pub use encoding::keys::KeyType;
pub use error::DbError;
pub use query::plugins::{QueryResult, Value};
pub use scan::CancelToken;
pub use txn::Transaction;
