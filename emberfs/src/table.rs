//! Block table
//!
//! The first blocks of the device hold one 16-bit entry per block, forming
//! the chain structure for every file and directory:
//! - `0xFFFF` free, never written since the covering page was erased
//! - `0xEFFF` end of a chain
//! - `0x0000` deleted, waiting for its page to be recycled
//! - anything else, the index of the next block in the chain
//!
//! The sentinels are chosen so that the common transitions (claiming a free
//! block, ending a chain, deleting a chain) only clear bits and never force
//! a page erase on their own.
//!
//! Allocation is next-fit: the scan starts just past the most recently
//! allocated block, which spreads writes across the device instead of
//! hammering the low blocks. When no free block remains, pages whose blocks
//! are all free or deleted are erased and their blocks returned to the pool.

use log::{debug, warn};

use crate::cache::PageCache;
use crate::flash::{FlashDevice, Geometry};
use crate::FsError;

const FREE: u16 = 0xFFFF;
const END: u16 = 0xEFFF;
const DELETED: u16 = 0x0000;

/// Highest usable block count; indices above this collide with sentinels.
pub const MAX_BLOCKS: usize = END as usize - 1;

/// Decoded state of one block table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    End,
    Deleted,
    Next(u16),
}

impl BlockState {
    fn decode(raw: u16) -> Self {
        match raw {
            FREE => Self::Free,
            END => Self::End,
            DELETED => Self::Deleted,
            next => Self::Next(next),
        }
    }

    fn encode(self) -> u16 {
        match self {
            Self::Free => FREE,
            Self::End => END,
            Self::Deleted => DELETED,
            Self::Next(next) => next,
        }
    }
}

/// The on-flash block table plus the little RAM state allocation needs
pub struct BlockTable {
    page_size: usize,
    blocks_per_page: usize,
    total_blocks: u16,
    table_blocks: u16,
    /// Most recently allocated block, the next-fit scan origin
    last_alloc: u16,
}

impl BlockTable {
    pub fn new(geometry: Geometry) -> Self {
        let total_blocks = geometry.total_blocks();
        let table_bytes = total_blocks * 2;
        let table_blocks = table_bytes.div_ceil(geometry.block_size);
        Self {
            page_size: geometry.page_size,
            blocks_per_page: geometry.blocks_per_page(),
            total_blocks: total_blocks as u16,
            table_blocks: table_blocks as u16,
            last_alloc: table_blocks as u16,
        }
    }

    /// Number of blocks occupied by the table itself
    pub fn table_blocks(&self) -> u16 {
        self.table_blocks
    }

    pub fn total_blocks(&self) -> u16 {
        self.total_blocks
    }

    /// Location of a table entry: (page, offset within page)
    fn entry_pos(&self, block: u16) -> (usize, usize) {
        let byte = block as usize * 2;
        (byte / self.page_size, byte % self.page_size)
    }

    pub fn entry<D: FlashDevice>(
        &self,
        cache: &mut PageCache,
        dev: &mut D,
        block: u16,
    ) -> Result<BlockState, FsError> {
        if block >= self.total_blocks {
            return Err(FsError::Corrupt);
        }
        let (page, off) = self.entry_pos(block);
        let data = cache.read(dev, page)?;
        Ok(BlockState::decode(u16::from_le_bytes([
            data[off],
            data[off + 1],
        ])))
    }

    pub fn set_entry<D: FlashDevice>(
        &self,
        cache: &mut PageCache,
        dev: &mut D,
        block: u16,
        state: BlockState,
    ) -> Result<(), FsError> {
        if block >= self.total_blocks {
            return Err(FsError::Corrupt);
        }
        let (page, off) = self.entry_pos(block);
        let raw = state.encode().to_le_bytes();
        cache.update(dev, page, |data| {
            data[off] = raw[0];
            data[off + 1] = raw[1];
        })
    }

    /// The block following `block` in its chain, or `None` at the end
    pub fn chain_next<D: FlashDevice>(
        &self,
        cache: &mut PageCache,
        dev: &mut D,
        block: u16,
    ) -> Result<Option<u16>, FsError> {
        match self.entry(cache, dev, block)? {
            BlockState::Next(next) => Ok(Some(next)),
            BlockState::End => Ok(None),
            // A live chain can never point at an unallocated block
            BlockState::Free | BlockState::Deleted => Err(FsError::Corrupt),
        }
    }

    /// Claim a block and mark it as a chain end.
    ///
    /// Scans forward from the last allocation, wrapping once. If nothing is
    /// free, recycles deleted pages and scans again.
    pub fn allocate<D: FlashDevice>(
        &mut self,
        cache: &mut PageCache,
        dev: &mut D,
    ) -> Result<u16, FsError> {
        for pass in 0..2 {
            if pass == 1 && !self.recycle(cache, dev)? {
                break;
            }
            for i in 1..=self.total_blocks as usize {
                let block = ((self.last_alloc as usize + i) % self.total_blocks as usize) as u16;
                if self.entry(cache, dev, block)? == BlockState::Free {
                    self.set_entry(cache, dev, block, BlockState::End)?;
                    self.last_alloc = block;
                    return Ok(block);
                }
            }
        }
        warn!("block table exhausted");
        Err(FsError::NoSpace)
    }

    /// Append a freshly allocated block to the chain ending at `last`
    pub fn extend<D: FlashDevice>(
        &self,
        cache: &mut PageCache,
        dev: &mut D,
        last: u16,
        new: u16,
    ) -> Result<(), FsError> {
        if self.entry(cache, dev, last)? != BlockState::End {
            return Err(FsError::Corrupt);
        }
        self.set_entry(cache, dev, last, BlockState::Next(new))
    }

    /// Mark every block of a chain as deleted
    pub fn free_chain<D: FlashDevice>(
        &self,
        cache: &mut PageCache,
        dev: &mut D,
        first: u16,
    ) -> Result<(), FsError> {
        let mut block = first;
        loop {
            let next = self.chain_next(cache, dev, block)?;
            self.set_entry(cache, dev, block, BlockState::Deleted)?;
            match next {
                Some(n) => block = n,
                None => return Ok(()),
            }
        }
    }

    /// Erase every page whose blocks are all free or deleted, returning the
    /// deleted blocks to the free pool. Returns whether anything was
    /// reclaimed.
    fn recycle<D: FlashDevice>(
        &mut self,
        cache: &mut PageCache,
        dev: &mut D,
    ) -> Result<bool, FsError> {
        let pages = self.total_blocks as usize / self.blocks_per_page;
        let mut reclaimed = 0usize;

        for page in 0..pages {
            let first = (page * self.blocks_per_page) as u16;
            let mut deleted = 0usize;
            let mut reclaimable = true;
            for b in first..first + self.blocks_per_page as u16 {
                match self.entry(cache, dev, b)? {
                    BlockState::Free => {}
                    BlockState::Deleted => deleted += 1,
                    _ => {
                        reclaimable = false;
                        break;
                    }
                }
            }
            if !reclaimable || deleted == 0 {
                continue;
            }

            // Dead content only; any cached copy is stale by definition
            cache.discard(page);
            dev.erase_page(page)?;
            for b in first..first + self.blocks_per_page as u16 {
                self.set_entry(cache, dev, b, BlockState::Free)?;
            }
            reclaimed += deleted;
            debug!("recycled page {} ({} deleted blocks)", page, deleted);
        }

        Ok(reclaimed > 0)
    }

    /// Free and deleted block counts
    pub fn counts<D: FlashDevice>(
        &self,
        cache: &mut PageCache,
        dev: &mut D,
    ) -> Result<(usize, usize), FsError> {
        let mut free = 0;
        let mut deleted = 0;
        for block in 0..self.total_blocks {
            match self.entry(cache, dev, block)? {
                BlockState::Free => free += 1,
                BlockState::Deleted => deleted += 1,
                _ => {}
            }
        }
        Ok((free, deleted))
    }
}
