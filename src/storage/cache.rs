//! # Page Cache
//!
//! Sharded in-memory page cache with SIEVE eviction and pin counting. The
//! pager loads pages through the cache; the B+tree layers only ever touch
//! pinned page buffers.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! A sequential leaf scan would flush a strict-LRU cache completely. SIEVE
//! keeps a per-entry "visited" flag and an eviction hand:
//!
//! - on access: set the visited flag
//! - on eviction: entries with visited=true get the flag cleared and a
//!   second chance; the first entry with visited=false is evicted
//!
//! Frequently used pages (the root, upper internal nodes) survive scans;
//! scan pages leave quickly.
//!
//! ## Lock Sharding
//!
//! Pages are assigned to one of [`CACHE_SHARD_COUNT`] shards by page id.
//! Each shard holds its own `parking_lot::RwLock`, so readers of different
//! pages never contend.
//!
//! ## Pin/Unpin Protocol
//!
//! Pages must be pinned before their buffer is touched:
//!
//! 1. `get` / `get_or_load` return a [`PageRef`] with the pin taken
//! 2. the caller reads through `data()` or writes through `data_mut()`
//! 3. dropping the `PageRef` releases the pin
//!
//! Entries with a live pin are never evicted; a cache where every entry is
//! pinned reports an error instead of evicting.
//!
//! ## Dirty Pages
//!
//! `data_mut()` marks the entry dirty. Dirty entries chosen for eviction
//! are handed to the caller-supplied write-back function before the buffer
//! is dropped; `flush` write-backs every dirty entry in place.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::config::CACHE_SHARD_COUNT;
use crate::storage::page::PageId;

struct CacheEntry {
    id: PageId,
    visited: AtomicBool,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    data: Box<[u8]>,
}

impl CacheEntry {
    fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            visited: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<PageId, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, id: PageId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Picks an unpinned victim with the SIEVE hand, or `None` when every
    /// entry is pinned.
    fn pick_victim(&mut self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }

        let mut scanned = 0;
        // Two full sweeps: the first may only clear visited flags.
        let limit = self.entries.len() * 2;

        loop {
            if scanned >= limit {
                return None;
            }
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.entries.len();
            scanned += 1;

            let entry = &self.entries[idx];
            if entry.is_pinned() {
                continue;
            }
            if entry.clear_visited() {
                continue;
            }
            return Some(idx);
        }
    }

    fn remove(&mut self, idx: usize) -> CacheEntry {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.id);

        if idx < self.entries.len() {
            let moved = self.entries[idx].id;
            self.index.insert(moved, idx);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        entry
    }

    fn insert(&mut self, entry: CacheEntry) -> usize {
        let id = entry.id;
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(id, idx);
        idx
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
    page_size: usize,
}

impl PageCache {
    pub fn new(total_capacity: usize, page_size: usize) -> Result<Self> {
        ensure!(
            total_capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one page per shard)",
            total_capacity,
            CACHE_SHARD_COUNT
        );

        let per_shard = total_capacity / CACHE_SHARD_COUNT;
        let remainder = total_capacity % CACHE_SHARD_COUNT;
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder { per_shard + 1 } else { per_shard };
                RwLock::new(CacheShard::new(cap))
            })
            .collect();

        Ok(Self { shards, page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn shard(&self, id: PageId) -> &RwLock<CacheShard> {
        let hash = (id as usize).wrapping_mul(0x9e37_79b9);
        &self.shards[hash % CACHE_SHARD_COUNT]
    }

    /// Cache-only probe: returns the page if it is resident, without any
    /// I/O. This is the hook behind the statistics fast-track.
    pub fn get(&self, id: PageId) -> Option<PageRef<'_>> {
        let shard = self.shard(id);
        let guard = shard.read();

        guard.get(id).map(|idx| {
            guard.entries[idx].pin();
            guard.entries[idx].mark_visited();
            PageRef { cache: self, id }
        })
    }

    /// Returns the page, loading it through `load` on a miss. A dirty
    /// eviction victim is handed to `write_back` before its buffer is
    /// dropped.
    pub fn get_or_load<L, W>(&self, id: PageId, load: L, mut write_back: W) -> Result<PageRef<'_>>
    where
        L: FnOnce(&mut [u8]) -> Result<()>,
        W: FnMut(PageId, &[u8]) -> Result<()>,
    {
        if let Some(page) = self.get(id) {
            return Ok(page);
        }

        let shard = self.shard(id);
        let mut guard = shard.write();

        // Raced with another loader between the read probe and here.
        if let Some(idx) = guard.get(id) {
            guard.entries[idx].pin();
            guard.entries[idx].mark_visited();
            return Ok(PageRef { cache: self, id });
        }

        if guard.is_full() {
            match guard.pick_victim() {
                Some(victim) => {
                    let entry = guard.remove(victim);
                    if entry.is_dirty() {
                        log::debug!("evicting dirty page {}, writing back", entry.id);
                        write_back(entry.id, &entry.data)?;
                    }
                }
                None => eyre::bail!(
                    "cache shard full and every page pinned (capacity {})",
                    guard.capacity
                ),
            }
        }

        let mut entry = CacheEntry::new(id, self.page_size);
        load(&mut entry.data)?;
        entry.pin();
        entry.mark_visited();
        guard.insert(entry);

        Ok(PageRef { cache: self, id })
    }

    fn unpin(&self, id: PageId) {
        let shard = self.shard(id);
        let guard = shard.read();
        if let Some(idx) = guard.get(id) {
            guard.entries[idx].unpin();
        }
    }

    fn data_ptr(&self, id: PageId) -> Option<*mut u8> {
        let shard = self.shard(id);
        let guard = shard.read();
        guard
            .get(id)
            .map(|idx| guard.entries[idx].data.as_ptr() as *mut u8)
    }

    fn mark_dirty(&self, id: PageId) {
        let shard = self.shard(id);
        let guard = shard.read();
        if let Some(idx) = guard.get(id) {
            guard.entries[idx].mark_dirty();
        }
    }

    /// Writes every dirty page through `write_back` and clears the dirty
    /// flags. Pages stay cached.
    pub fn flush<W>(&self, mut write_back: W) -> Result<usize>
    where
        W: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut flushed = 0;
        for shard in &self.shards {
            let guard = shard.read();
            for entry in &guard.entries {
                if entry.is_dirty() {
                    write_back(entry.id, &entry.data)?;
                    entry.clear_dirty();
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Drops a page from the cache without write-back. Used when freed
    /// pages go back to the freelist.
    pub fn discard(&self, id: PageId) {
        let shard = self.shard(id);
        let mut guard = shard.write();
        if let Some(idx) = guard.get(id) {
            debug_assert!(!guard.entries[idx].is_pinned(), "discarding pinned page");
            guard.remove(idx);
        }
    }

    #[cfg(test)]
    pub fn resident(&self, id: PageId) -> bool {
        self.shard(id).read().get(id).is_some()
    }
}

/// RAII pin on a cached page.
///
/// `data()` and `data_mut()` hand out slices into the cache-owned buffer.
pub struct PageRef<'a> {
    cache: &'a PageCache,
    id: PageId,
}

impl<'a> PageRef<'a> {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        let ptr = self
            .cache
            .data_ptr(self.id)
            .expect("pinned page missing from cache"); // INVARIANT: a PageRef holds a pin, so the entry cannot be evicted
        // SAFETY: the entry's buffer is a stable heap allocation (Box<[u8]>)
        // whose pointer survives shard-internal Vec reshuffling. The pin
        // held by this PageRef keeps the entry alive for our lifetime, and
        // the returned borrow of `self` prevents `data_mut` aliasing on the
        // same PageRef. Distinct PageRefs to the same page must not mix
        // `data` and `data_mut`; the single-writer claim at the API level
        // guarantees this.
        unsafe { std::slice::from_raw_parts(ptr, self.cache.page_size) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.cache.mark_dirty(self.id);
        let ptr = self
            .cache
            .data_ptr(self.id)
            .expect("pinned page missing from cache"); // INVARIANT: see data()
        // SAFETY: as in `data`, plus exclusivity: `&mut self` makes this the
        // only live slice handed out by this PageRef, and mutation only
        // happens under the environment's exclusive write claim.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.cache.page_size) }
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.id);
    }
}
