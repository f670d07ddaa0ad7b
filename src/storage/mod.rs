//! # Storage Module
//!
//! The storage layer of LoamDB: fixed-size pages in a single environment
//! file, an in-memory page cache with pinning, a freelist and a blob store.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  B+tree / blob consumers (page ids only)  │
//! ├───────────────────────────────────────────┤
//! │  Pager: fetch / allocate / free / flush   │
//! ├──────────────────────┬────────────────────┤
//! │  PageCache (SIEVE,   │  Freelist trunks   │
//! │  pins, dirty flags)  │                    │
//! ├──────────────────────┴────────────────────┤
//! │  File I/O (positioned reads and writes)   │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Pages are addressed by 64-bit id; page 0 holds the environment file
//! header with the database directory. The page size is chosen per
//! environment (power of two, 1 KiB..64 KiB) and fixed for the file's
//! lifetime.
//!
//! ## Module Organization
//!
//! - [`page`]: page types, the 40-byte on-disk page header, validation
//! - [`cache`]: sharded SIEVE page cache with pin counting
//! - [`pager`]: the page manager and environment file header
//! - [`freelist`]: trunk-page persistence of the free pool
//! - [`blob`]: chained blob pages for oversized values

pub mod blob;
pub mod cache;
pub mod freelist;
pub mod page;
pub mod pager;

pub use cache::{PageCache, PageRef};
pub use page::{PageHeader, PageId, PageType};
pub use pager::{DbSlot, Pager, DB_FLAG_COMPRESSED, DB_FLAG_DUPLICATES, DB_FLAG_RECORD_NUMBER};
