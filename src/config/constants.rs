//! # LoamDB Configuration Constants
//!
//! All numeric configuration values, grouped so that interdependent numbers
//! live next to each other.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE sizes (1 KiB .. 64 KiB, power of two, default 16 KiB)
//!       │
//!       ├─> PAGE_HEADER_SIZE (40 bytes, fixed, on-disk)
//!       │     Every page starts with this header; the payload is
//!       │     page_size - 40 bytes.
//!       │
//!       └─> FILE_HEADER_SIZE (on page 0, after the page header)
//!             Must fit into MIN_PAGE_SIZE - PAGE_HEADER_SIZE together with
//!             the database directory (MAX_DATABASES entries).
//!
//! Compressed block list (u32 keys)
//!       │
//!       ├─> BLOCK_INITIAL_SIZE (17 = 1 selector + 4 * 4 payload bytes)
//!       ├─> BLOCK_GROW_FACTOR  (blocks grow by this many bytes)
//!       ├─> BLOCK_MAX_SIZE     (255: block_size/used_size are 8-bit fields)
//!       ├─> MAX_GROUPS_PER_BLOCK (8)
//!       └─> MAX_KEYS_PER_BLOCK (32 = 8 groups * 4, including the anchor)
//!
//! RECORD_ENTRY_SIZE (9 = 1 flag byte + 8 payload bytes)
//!       └─> leaf capacity = payload / (key width + RECORD_ENTRY_SIZE)
//! ```

// ============================================================================
// PAGE LAYOUT
// ============================================================================

/// Smallest legal page size (1 KiB).
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest legal page size (64 KiB).
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Default page size (16 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Size of the on-disk page header in bytes. Every page begins with it.
pub const PAGE_HEADER_SIZE: usize = 40;

/// Size of the environment file header, stored on page 0 directly after the
/// page header. Contains the magic, page geometry, freelist head and the
/// database directory.
pub const FILE_HEADER_SIZE: usize = 64 + MAX_DATABASES * 16;

/// Maximum number of databases per environment file.
pub const MAX_DATABASES: usize = 16;

const _: () = assert!(
    PAGE_HEADER_SIZE + FILE_HEADER_SIZE <= MIN_PAGE_SIZE,
    "file header and database directory must fit into the smallest page"
);

// ============================================================================
// PAGE CACHE
// ============================================================================

/// Number of independent shards in the page cache. Each shard has its own
/// lock; pages are assigned by hash of their page id.
pub const CACHE_SHARD_COUNT: usize = 16;

/// Default page cache capacity in pages.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

const _: () = assert!(
    DEFAULT_CACHE_CAPACITY >= CACHE_SHARD_COUNT,
    "default cache capacity must provide at least one page per shard"
);

// ============================================================================
// COMPRESSED BLOCK LIST (group-varint u32 keys)
// These mirror the on-disk block index fields and must not drift from them.
// ============================================================================

/// Initial size of a freshly allocated block: one selector byte plus four
/// 4-byte payloads.
pub const BLOCK_INITIAL_SIZE: usize = 17;

/// Blocks grow by this many bytes when an insert does not fit.
pub const BLOCK_GROW_FACTOR: usize = 17;

/// Maximum encoded block size. The block index stores `block_size` and
/// `used_size` in 8-bit fields.
pub const BLOCK_MAX_SIZE: usize = 255;

/// Maximum number of encoded groups per block.
pub const MAX_GROUPS_PER_BLOCK: usize = 8;

/// Maximum number of keys per block, including the uncompressed anchor.
pub const MAX_KEYS_PER_BLOCK: usize = MAX_GROUPS_PER_BLOCK * 4;

const _: () = assert!(
    // 31 deltas at 4 bytes each plus 8 selector bytes
    (MAX_KEYS_PER_BLOCK - 1) * 4 + MAX_GROUPS_PER_BLOCK <= BLOCK_MAX_SIZE,
    "a fully populated block must be encodable within BLOCK_MAX_SIZE"
);

// ============================================================================
// RECORDS
// ============================================================================

/// Size of one leaf record entry: a flag byte plus an 8-byte payload that is
/// either an inline record (<= 8 bytes), a blob id or a duplicate-table id.
pub const RECORD_ENTRY_SIZE: usize = 9;

/// Records larger than this are stored in the blob store.
pub const MAX_INLINE_RECORD: usize = 8;

/// Default inline key size for binary-key databases. Keys longer than the
/// configured size are offloaded to the blob store (extended keys).
pub const DEFAULT_BINARY_KEY_SIZE: u16 = 16;

const _: () = assert!(
    MAX_INLINE_RECORD + 1 == RECORD_ENTRY_SIZE,
    "record entry layout is one flag byte plus the inline payload"
);

// ============================================================================
// FILE FORMAT
// ============================================================================

/// Magic number at the start of every page header ("LoaM").
pub const PAGE_MAGIC: u32 = 0x4d616f4c;

/// Magic number of the environment file header ("LoamDB\0\1").
pub const FILE_MAGIC: u64 = 0x0100_4244_6d61_6f4c;

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;
