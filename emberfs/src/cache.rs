//! Page-level write caching
//!
//! Features:
//! - whole-page caching keyed by erase page (PageCache)
//! - dirty page tracking for efficient sync
//! - LRU eviction for cache management
//!
//! Write-back is where flash awareness lives: a dirty page is compared with
//! the device contents and programmed in place when the change only clears
//! bits, or erased and reprogrammed when it does not. Metadata updates are
//! laid out so the common transitions stay on the cheap path.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use log::trace;

use crate::flash::FlashDevice;
use crate::FsError;

/// Maximum number of cached pages
const CACHE_MAX_PAGES: usize = 8;

/// A cached page entry
struct CacheEntry {
    /// Page data
    data: Vec<u8>,
    /// Whether this page has been modified
    dirty: bool,
    /// Last access time (for LRU eviction)
    last_access: u64,
}

/// Cache statistics: hits, misses and pages written back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writebacks: u64,
}

/// Page cache for reducing flash I/O
pub struct PageCache {
    /// Cached pages: page index -> entry
    pages: BTreeMap<usize, CacheEntry>,
    capacity: usize,
    /// Access counter for LRU
    counter: u64,
    stats: CacheStats,
}

impl PageCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_MAX_PAGES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            capacity: capacity.max(1),
            counter: 0,
            stats: CacheStats::default(),
        }
    }

    /// Read a page, using the cache if available
    pub fn read<D: FlashDevice>(&mut self, dev: &mut D, page: usize) -> Result<&[u8], FsError> {
        self.ensure(dev, page)?;
        let entry = self.pages.get_mut(&page).ok_or(FsError::Corrupt)?;
        entry.last_access = self.counter;
        self.counter += 1;
        Ok(&entry.data)
    }

    /// Mutate a page in place and mark it dirty
    pub fn update<D, F>(&mut self, dev: &mut D, page: usize, f: F) -> Result<(), FsError>
    where
        D: FlashDevice,
        F: FnOnce(&mut [u8]),
    {
        self.ensure(dev, page)?;
        let entry = self.pages.get_mut(&page).ok_or(FsError::Corrupt)?;
        entry.last_access = self.counter;
        self.counter += 1;
        f(&mut entry.data);
        entry.dirty = true;
        Ok(())
    }

    /// Write every dirty page back to the device
    ///
    /// Returns the number of pages written.
    pub fn sync<D: FlashDevice>(&mut self, dev: &mut D) -> Result<usize, FsError> {
        let mut count = 0;
        for (&page, entry) in self.pages.iter_mut() {
            if entry.dirty {
                write_back(dev, page, &entry.data)?;
                entry.dirty = false;
                self.stats.writebacks += 1;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drop a cached page without writing it back.
    ///
    /// Used when the underlying page is about to be erased and any cached
    /// content is known to be dead.
    pub fn discard(&mut self, page: usize) {
        self.pages.remove(&page);
    }

    /// Number of dirty pages waiting to be written
    pub fn dirty_count(&self) -> usize {
        self.pages.values().filter(|e| e.dirty).count()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Ensure a page is resident, evicting the LRU page if needed
    fn ensure<D: FlashDevice>(&mut self, dev: &mut D, page: usize) -> Result<(), FsError> {
        if self.pages.contains_key(&page) {
            self.stats.hits += 1;
            return Ok(());
        }
        self.stats.misses += 1;

        if self.pages.len() >= self.capacity {
            self.evict_lru(dev)?;
        }

        let ps = dev.geometry().page_size;
        let mut data = vec![0u8; ps];
        dev.read(page * ps, &mut data)?;
        self.pages.insert(
            page,
            CacheEntry {
                data,
                dirty: false,
                last_access: self.counter,
            },
        );
        self.counter += 1;
        Ok(())
    }

    /// Evict the least recently used page, writing it back if dirty
    fn evict_lru<D: FlashDevice>(&mut self, dev: &mut D) -> Result<(), FsError> {
        let lru = self
            .pages
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(&p, _)| p);

        if let Some(page) = lru {
            if let Some(entry) = self.pages.get(&page) {
                if entry.dirty {
                    write_back(dev, page, &entry.data)?;
                    self.stats.writebacks += 1;
                }
            }
            self.pages.remove(&page);
        }
        Ok(())
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one page image to the device, erasing first only when the new
/// image sets bits the current contents have cleared.
fn write_back<D: FlashDevice>(dev: &mut D, page: usize, data: &[u8]) -> Result<(), FsError> {
    let ps = data.len();
    let mut current = vec![0u8; ps];
    dev.read(page * ps, &mut current)?;

    if current == data {
        return Ok(());
    }

    let needs_erase = current
        .iter()
        .zip(data)
        .any(|(&old, &new)| new & !old != 0);

    trace!("writeback page {} (erase={})", page, needs_erase);
    if needs_erase {
        dev.erase_page(page)?;
    }
    dev.program(page * ps, data)?;
    Ok(())
}
