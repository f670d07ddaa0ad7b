//! # Pager
//!
//! The page manager: owns the environment file, the page cache and the
//! freelist, and hands out pinned page references. Everything above this
//! layer addresses pages by 64-bit id and never touches the file.
//!
//! ## Responsibilities
//!
//! - fetch a page by id, loading and validating it through the cache
//! - cache-only probes (no I/O) for the statistics fast-tracks
//! - allocate pages (freelist first, then file growth) and free them
//! - maintain the environment file header (page 0): geometry, freelist
//!   head, database directory
//! - flush: persist the freelist, write back dirty pages, rewrite the
//!   header, fsync
//!
//! ## File Header Layout (page 0 payload)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------
//! 0       8     file magic
//! 8       4     format version
//! 12      4     page size
//! 16      8     page count
//! 24      8     freelist head page id (0 = empty)
//! 32      28    reserved
//! 60      4     CRC32 of the preceding 60 bytes + directory
//! 64      16*N  database directory (MAX_DATABASES slots)
//! ```
//!
//! A directory slot with `db_id == 0` is free. The checksum covers the
//! fixed header and the directory so a torn header write is detected at
//! open.
//!
//! ## Failure Behavior
//!
//! Allocation failures surface before any page is linked into a tree, so
//! callers can abort without partial mutation. I/O errors carry file
//! offsets in their context chain.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Context, Result};
use parking_lot::Mutex;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::config::{
    EnvOptions, FILE_MAGIC, FORMAT_VERSION, MAX_DATABASES, PAGE_HEADER_SIZE,
};
use crate::encoding::keys::KeyType;
use crate::storage::cache::{PageCache, PageRef};
use crate::storage::freelist;
use crate::storage::page::{self, PageHeader, PageId, PageType};

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Database directory slot flags.
pub const DB_FLAG_RECORD_NUMBER: u8 = 0x01;
pub const DB_FLAG_DUPLICATES: u8 = 0x02;
pub const DB_FLAG_COMPRESSED: u8 = 0x04;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DbSlot {
    pub db_id: u16,
    pub key_type: u8,
    pub flags: u8,
    pub key_size: u16,
    reserved: [u8; 2],
    pub root: u64,
}

impl DbSlot {
    pub fn new(db_id: u16, key_type: KeyType, flags: u8, key_size: u16, root: u64) -> Self {
        Self {
            db_id,
            key_type: key_type.to_tag(),
            flags,
            key_size,
            reserved: [0; 2],
            root,
        }
    }

    pub fn key_type(&self) -> Result<KeyType> {
        KeyType::from_tag(self.key_type)
    }

    pub fn is_record_number(&self) -> bool {
        self.flags & DB_FLAG_RECORD_NUMBER != 0
    }

    pub fn allows_duplicates(&self) -> bool {
        self.flags & DB_FLAG_DUPLICATES != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & DB_FLAG_COMPRESSED != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FileHeader {
    magic: u64,
    version: u32,
    page_size: u32,
    page_count: u64,
    freelist_head: u64,
    reserved: [u8; 28],
    checksum: u32,
}

const FIXED_HEADER_SIZE: usize = size_of::<FileHeader>();
const _: () = assert!(FIXED_HEADER_SIZE == 64);

struct PagerState {
    page_count: u64,
    free: Vec<PageId>,
    trunk_pages: Vec<PageId>,
    dbs: [DbSlot; MAX_DATABASES],
}

pub struct Pager {
    file: File,
    page_size: usize,
    cache: PageCache,
    state: Mutex<PagerState>,
}

impl Pager {
    /// Creates a new environment file. Fails if the file already has
    /// content that looks like a LoamDB header.
    pub fn create(path: &Path, options: &EnvOptions) -> Result<Self> {
        options.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("creating environment file {}", path.display()))?;

        let pager = Self {
            file,
            page_size: options.page_size,
            cache: PageCache::new(options.cache_capacity, options.page_size)?,
            state: Mutex::new(PagerState {
                page_count: 1, // page 0 is the header page
                free: Vec::new(),
                trunk_pages: Vec::new(),
                dbs: [DbSlot::new_zeroed(); MAX_DATABASES],
            }),
        };
        pager.write_header()?;
        Ok(pager)
    }

    /// Opens an existing environment file and loads its header and
    /// freelist. The header's page size wins over the options.
    pub fn open(path: &Path, options: &EnvOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("opening environment file {}", path.display()))?;

        let mut fixed = [0u8; PAGE_HEADER_SIZE + FIXED_HEADER_SIZE];
        file.read_exact_at(&mut fixed, 0)
            .wrap_err("reading file header")?;
        let header = FileHeader::read_from_bytes(&fixed[PAGE_HEADER_SIZE..])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;
        ensure!(
            header.magic == FILE_MAGIC,
            "not a LoamDB file: bad magic {:#018x}",
            header.magic
        );
        ensure!(
            header.version == FORMAT_VERSION,
            "unsupported format version {}",
            header.version
        );

        let page_size = header.page_size as usize;
        let page_count = header.page_count;
        let freelist_head = header.freelist_head;

        // Re-read the full header page to verify the checksum and load the
        // database directory.
        let mut page0 = vec![0u8; page_size];
        file.read_exact_at(&mut page0, 0).wrap_err("reading page 0")?;
        verify_header_checksum(&page0)?;

        let mut dbs = [DbSlot::new_zeroed(); MAX_DATABASES];
        let dir = &page0[PAGE_HEADER_SIZE + FIXED_HEADER_SIZE..];
        for (i, slot) in dbs.iter_mut().enumerate() {
            let off = i * size_of::<DbSlot>();
            *slot = DbSlot::read_from_bytes(&dir[off..off + size_of::<DbSlot>()])
                .map_err(|e| eyre::eyre!("failed to parse DbSlot {}: {:?}", i, e))?;
        }

        let pager = Self {
            file,
            page_size,
            cache: PageCache::new(options.cache_capacity, page_size)?,
            state: Mutex::new(PagerState {
                page_count,
                free: Vec::new(),
                trunk_pages: Vec::new(),
                dbs,
            }),
        };
        pager.load_freelist(freelist_head)?;
        Ok(pager)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Usable payload bytes per page.
    pub fn payload_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    pub fn page_count(&self) -> u64 {
        self.state.lock().page_count
    }

    fn offset_of(&self, id: PageId) -> u64 {
        id * self.page_size as u64
    }

    /// Fetches a page, reading it from disk on a cache miss.
    pub fn fetch(&self, id: PageId) -> Result<PageRef<'_>> {
        ensure!(id != 0, "page 0 is the header page");
        ensure!(
            id < self.state.lock().page_count,
            "page {} out of bounds",
            id
        );

        let offset = self.offset_of(id);
        let page_size = self.page_size;
        self.cache.get_or_load(
            id,
            |buf| {
                self.file
                    .read_exact_at(buf, offset)
                    .wrap_err_with(|| format!("reading page {} at offset {}", id, offset))?;
                page::validate_page(buf, id, page_size)
            },
            |victim, data| self.write_page(victim, data),
        )
    }

    /// Cache-only probe; never performs I/O. Returns `None` on a miss or
    /// for out-of-range hints.
    pub fn fetch_cached(&self, id: PageId) -> Option<PageRef<'_>> {
        if id == 0 || id >= self.state.lock().page_count {
            return None;
        }
        self.cache.get(id)
    }

    /// Allocates a page of the given type: freelist first, then file
    /// growth. The returned page is pinned, zeroed and header-initialized.
    pub fn allocate(&self, page_type: PageType) -> Result<PageRef<'_>> {
        let id = {
            let mut state = self.state.lock();
            match state.free.pop() {
                Some(id) => id,
                None => {
                    let id = state.page_count;
                    state.page_count += 1;
                    id
                }
            }
        };

        let mut page = self.cache.get_or_load(
            id,
            |buf| {
                buf.fill(0);
                Ok(())
            },
            |victim, data| self.write_page(victim, data),
        )?;
        PageHeader::new(page_type, id).write_to(page.data_mut())?;
        Ok(page)
    }

    /// Returns a page to the free pool. The caller must not hold a pin.
    pub fn free(&self, id: PageId) {
        debug_assert!(id != 0);
        self.cache.discard(id);
        self.state.lock().free.push(id);
    }

    fn write_page(&self, id: PageId, data: &[u8]) -> Result<()> {
        let offset = self.offset_of(id);
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("writing page {} at offset {}", id, offset))
    }

    // ------------------------------------------------------------------
    // database directory
    // ------------------------------------------------------------------

    pub fn db_slot(&self, db_id: u16) -> Option<DbSlot> {
        let state = self.state.lock();
        state.dbs.iter().find(|s| s.db_id == db_id).copied()
    }

    pub fn db_ids(&self) -> Vec<u16> {
        let state = self.state.lock();
        state
            .dbs
            .iter()
            .filter(|s| s.db_id != 0)
            .map(|s| s.db_id)
            .collect()
    }

    pub fn put_db_slot(&self, slot: DbSlot) -> Result<()> {
        ensure!(slot.db_id != 0, "database id 0 is reserved");
        let mut state = self.state.lock();
        if let Some(existing) = state.dbs.iter_mut().find(|s| s.db_id == slot.db_id) {
            *existing = slot;
            return Ok(());
        }
        match state.dbs.iter_mut().find(|s| s.db_id == 0) {
            Some(free) => {
                *free = slot;
                Ok(())
            }
            None => eyre::bail!("database directory full ({} slots)", MAX_DATABASES),
        }
    }

    pub fn set_db_root(&self, db_id: u16, root: PageId) -> Result<()> {
        let mut state = self.state.lock();
        match state.dbs.iter_mut().find(|s| s.db_id == db_id) {
            Some(slot) => {
                slot.root = root;
                Ok(())
            }
            None => eyre::bail!("unknown database {}", db_id),
        }
    }

    // ------------------------------------------------------------------
    // flush
    // ------------------------------------------------------------------

    /// Persists the freelist, writes back every dirty page, rewrites the
    /// header page and fsyncs the file.
    pub fn flush(&self) -> Result<()> {
        self.persist_freelist()?;
        let flushed = self.cache.flush(|id, data| self.write_page(id, data))?;
        if flushed > 0 {
            log::debug!("flushed {} dirty pages", flushed);
        }
        self.write_header()?;
        self.file.sync_all().wrap_err("fsync")?;
        Ok(())
    }

    fn load_freelist(&self, head: PageId) -> Result<()> {
        let mut free = Vec::new();
        let mut trunks = Vec::new();
        let mut next = head;
        let mut buf = vec![0u8; self.page_size];

        while next != 0 {
            ensure!(
                !trunks.contains(&next),
                "freelist trunk chain loops through page {}",
                next
            );
            self.file
                .read_exact_at(&mut buf, self.offset_of(next))
                .wrap_err_with(|| format!("reading freelist trunk {}", next))?;
            let (entries, chained) = freelist::read_trunk(&buf, next)?;
            trunks.push(next);
            free.extend(entries);
            next = chained;
        }

        let mut state = self.state.lock();
        state.free = free;
        state.trunk_pages = trunks;
        Ok(())
    }

    /// Rewrites the freelist trunk chain. Old trunk pages rejoin the free
    /// pool first; new trunks are drawn from the pool itself. Pages
    /// recorded inside the trunks stay allocatable in memory: they are
    /// still free, the trunks merely persist that fact.
    fn persist_freelist(&self) -> Result<()> {
        let mut state = self.state.lock();
        let old_trunks = std::mem::take(&mut state.trunk_pages);
        for id in old_trunks {
            self.cache.discard(id);
            state.free.push(id);
        }

        let mut pool = std::mem::take(&mut state.free);
        pool.sort_unstable();
        pool.dedup();

        // Partition the pool: the highest pages become the trunk chain,
        // everything else is recorded inside it.
        let per_trunk = freelist::entries_per_trunk(self.page_size);
        let mut trunks = Vec::new();
        let mut chunks: Vec<Vec<PageId>> = Vec::new();
        while !pool.is_empty() {
            let trunk_id = pool.pop().unwrap(); // INVARIANT: loop condition guarantees an entry
            trunks.push(trunk_id);
            let take = pool.len().min(per_trunk);
            let chunk = pool.split_off(pool.len() - take);
            chunks.push(chunk);
        }

        // Build the chain back to front so each trunk can point at the one
        // written before it.
        let mut buf = vec![0u8; self.page_size];
        let mut next_chain: PageId = 0;
        for (trunk_id, chunk) in trunks.iter().rev().zip(chunks.iter().rev()) {
            self.cache.discard(*trunk_id);
            freelist::write_trunk(&mut buf, *trunk_id, next_chain, chunk)?;
            self.write_page(*trunk_id, &buf)?;
            next_chain = *trunk_id;
        }

        debug_assert!(next_chain == trunks.first().copied().unwrap_or(0));
        state.free = chunks.into_iter().flatten().collect();
        state.trunk_pages = trunks;
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let state = self.state.lock();
        let freelist_head = state.trunk_pages.first().copied().unwrap_or(0);

        let mut page0 = vec![0u8; self.page_size];
        PageHeader::new(PageType::Header, 0).write_to(&mut page0)?;

        let header = FileHeader {
            magic: FILE_MAGIC,
            version: FORMAT_VERSION,
            page_size: self.page_size as u32,
            page_count: state.page_count,
            freelist_head,
            reserved: [0; 28],
            checksum: 0,
        };
        page0[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + FIXED_HEADER_SIZE]
            .copy_from_slice(header.as_bytes());

        let dir_start = PAGE_HEADER_SIZE + FIXED_HEADER_SIZE;
        for (i, slot) in state.dbs.iter().enumerate() {
            let off = dir_start + i * size_of::<DbSlot>();
            page0[off..off + size_of::<DbSlot>()].copy_from_slice(slot.as_bytes());
        }

        let checksum = header_checksum(&page0);
        let crc_off = PAGE_HEADER_SIZE + FIXED_HEADER_SIZE - 4;
        page0[crc_off..crc_off + 4].copy_from_slice(&checksum.to_le_bytes());

        self.write_page(0, &page0)
    }
}

/// CRC32 over the fixed header (with the checksum field zeroed) and the
/// database directory.
fn header_checksum(page0: &[u8]) -> u32 {
    let crc_off = PAGE_HEADER_SIZE + FIXED_HEADER_SIZE - 4;
    let dir_end = PAGE_HEADER_SIZE + FIXED_HEADER_SIZE + MAX_DATABASES * size_of::<DbSlot>();
    let mut digest = CRC.digest();
    digest.update(&page0[PAGE_HEADER_SIZE..crc_off]);
    digest.update(&[0, 0, 0, 0]);
    digest.update(&page0[crc_off + 4..dir_end]);
    digest.finalize()
}

fn verify_header_checksum(page0: &[u8]) -> Result<()> {
    let crc_off = PAGE_HEADER_SIZE + FIXED_HEADER_SIZE - 4;
    let stored = u32::from_le_bytes(page0[crc_off..crc_off + 4].try_into().unwrap()); // INVARIANT: page0 is at least MIN_PAGE_SIZE
    let computed = header_checksum(page0);
    ensure!(
        stored == computed,
        "file header checksum mismatch: stored {:#010x}, computed {:#010x}",
        stored,
        computed
    );
    Ok(())
}
