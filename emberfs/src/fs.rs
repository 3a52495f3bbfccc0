//! File system core
//!
//! `FileSystem` is an explicitly constructed engine handle: it owns the
//! flash device, the page cache, the block table and the open-file table,
//! and exposes the full operation set (`open`, `read`, `write`, `seek`,
//! `flush`, `close`, `remove`, `create_directory`) plus listing and
//! accounting helpers.
//!
//! Durability model: data and metadata go through the page cache and reach
//! flash on `flush`/`close` (or an explicit `sync`). A file's directory
//! entry keeps the erased length marker until its size is committed, so a
//! file that was open at power loss is recovered by walking its chain on
//! the next open.

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::debug;

use crate::cache::{CacheStats, PageCache};
use crate::dir::{
    self, entries_per_block, DirEntry, EntryLoc, ENTRY_SIZE, LENGTH_UNCOMMITTED,
};
use crate::flash::{FlashDevice, Geometry};
use crate::table::{BlockState, BlockTable, MAX_BLOCKS};
use crate::FsError;

/// Maximum number of simultaneously open files
pub const MAX_OPEN_FILES: usize = 16;

/// Index into the open-file table
pub type Fd = usize;

bitflags! {
    /// File open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Allow reads through the descriptor
        const READ = 0x01;
        /// Allow writes through the descriptor
        const WRITE = 0x02;
        /// Create the file if it does not exist
        const CREATE = 0x04;
    }
}

/// Origin for `seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    /// From the start of the file
    Start,
    /// From the current offset
    Current,
    /// From the end of the file
    End,
}

/// One entry reported by `read_dir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub length: u32,
    pub is_dir: bool,
}

/// Volume usage counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub deleted_blocks: usize,
    pub block_size: usize,
}

/// State of one open file
struct Descriptor {
    /// Directory entry backing this descriptor
    entry: EntryLoc,
    first_block: u16,
    flags: OpenFlags,
    offset: u32,
    length: u32,
    /// Length grew since the last commit to the directory entry
    size_dirty: bool,
}

pub struct FileSystem<D: FlashDevice> {
    dev: D,
    cache: PageCache,
    table: BlockTable,
    root_block: u16,
    block_size: usize,
    page_size: usize,
    fds: [Option<Descriptor>; MAX_OPEN_FILES],
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn check_geometry(geometry: Geometry) -> Result<(), FsError> {
    if geometry.block_size < ENTRY_SIZE
        || geometry.page_size == 0
        || geometry.page_size % geometry.block_size != 0
    {
        return Err(FsError::BadGeometry);
    }
    let total = geometry.total_blocks();
    if total > MAX_BLOCKS {
        return Err(FsError::BadGeometry);
    }
    // Room for the table, the root directory and at least one data block
    let table_blocks = (total * 2).div_ceil(geometry.block_size);
    if total < table_blocks + 2 {
        return Err(FsError::BadGeometry);
    }
    Ok(())
}

impl<D: FlashDevice> FileSystem<D> {
    fn empty(dev: D) -> Result<Self, FsError> {
        let geometry = dev.geometry();
        check_geometry(geometry)?;
        let table = BlockTable::new(geometry);
        let root_block = table.table_blocks();
        Ok(Self {
            dev,
            cache: PageCache::new(),
            table,
            root_block,
            block_size: geometry.block_size,
            page_size: geometry.page_size,
            fds: core::array::from_fn(|_| None),
        })
    }

    /// Erase the device and lay down a fresh volume
    pub fn format(dev: D) -> Result<Self, FsError> {
        let mut fs = Self::empty(dev)?;
        let geometry = fs.dev.geometry();
        for page in 0..geometry.page_count {
            fs.dev.erase_page(page)?;
        }
        // Table blocks and the root directory are permanently reserved
        for block in 0..=fs.root_block {
            fs.table
                .set_entry(&mut fs.cache, &mut fs.dev, block, BlockState::End)?;
        }
        let root = fs.root_block;
        fs.write_entry(EntryLoc { block: root, slot: 0 }, &DirEntry::root(root))?;
        fs.cache.sync(&mut fs.dev)?;
        debug!(
            "formatted volume: {} blocks of {} bytes, {} reserved",
            fs.table.total_blocks(),
            fs.block_size,
            root + 1
        );
        Ok(fs)
    }

    /// Mount an existing volume
    pub fn mount(dev: D) -> Result<Self, FsError> {
        let mut fs = Self::empty(dev)?;
        let root = fs.root_block;
        let marker = fs.read_entry(EntryLoc { block: root, slot: 0 })?;
        if !marker.is_root(root) {
            return Err(FsError::Corrupt);
        }
        debug!("mounted volume: {} blocks", fs.table.total_blocks());
        Ok(fs)
    }

    /// Mount the volume on `dev`, formatting first when none is present
    pub fn mount_or_format(dev: D) -> Result<Self, FsError> {
        let geometry = dev.geometry();
        check_geometry(geometry)?;
        let table = BlockTable::new(geometry);
        let root = table.table_blocks();
        let mut raw = [0u8; ENTRY_SIZE];
        dev.read(root as usize * geometry.block_size, &mut raw)?;
        if DirEntry::decode(&raw).is_root(root) {
            Self::mount(dev)
        } else {
            Self::format(dev)
        }
    }

    /// Shared access to the underlying device
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Sync and give the device back
    pub fn into_device(mut self) -> Result<D, FsError> {
        self.cache.sync(&mut self.dev)?;
        Ok(self.dev)
    }

    // ========================================================================
    // ENTRY AND CHAIN HELPERS
    // ========================================================================

    /// Page and in-page offset of a block
    fn block_page(&self, block: u16) -> (usize, usize) {
        let byte = block as usize * self.block_size;
        (byte / self.page_size, byte % self.page_size)
    }

    fn read_entry(&mut self, loc: EntryLoc) -> Result<DirEntry, FsError> {
        let (page, off) = self.block_page(loc.block);
        let start = off + loc.slot * ENTRY_SIZE;
        let data = self.cache.read(&mut self.dev, page)?;
        Ok(DirEntry::decode(&data[start..start + ENTRY_SIZE]))
    }

    fn write_entry(&mut self, loc: EntryLoc, entry: &DirEntry) -> Result<(), FsError> {
        let (page, off) = self.block_page(loc.block);
        let start = off + loc.slot * ENTRY_SIZE;
        self.cache.update(&mut self.dev, page, |p| {
            entry.encode(&mut p[start..start + ENTRY_SIZE]);
        })
    }

    fn update_length(&mut self, loc: EntryLoc, length: u32) -> Result<(), FsError> {
        let (page, off) = self.block_page(loc.block);
        let start = off + loc.slot * ENTRY_SIZE + 20;
        self.cache.update(&mut self.dev, page, |p| {
            p[start..start + 4].copy_from_slice(&length.to_le_bytes());
        })
    }

    fn mark_deleted(&mut self, loc: EntryLoc) -> Result<(), FsError> {
        let (page, off) = self.block_page(loc.block);
        let start = off + loc.slot * ENTRY_SIZE;
        self.cache.update(&mut self.dev, page, |p| {
            p[start..start + ENTRY_SIZE].fill(0);
        })
    }

    /// Find a live entry by name in one directory
    fn find_in_dir(
        &mut self,
        dir_first: u16,
        name: &str,
    ) -> Result<Option<(EntryLoc, DirEntry)>, FsError> {
        let epb = entries_per_block(self.block_size);
        let mut block = dir_first;
        loop {
            for slot in 0..epb {
                let loc = EntryLoc { block, slot };
                let entry = self.read_entry(loc)?;
                if entry.matches(name) {
                    return Ok(Some((loc, entry)));
                }
            }
            match self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
                Some(next) => block = next,
                None => return Ok(None),
            }
        }
    }

    /// Find a slot for a new entry: free first, then a deleted slot, then
    /// grow the directory by one block.
    fn find_slot(&mut self, dir_first: u16) -> Result<EntryLoc, FsError> {
        let epb = entries_per_block(self.block_size);
        let mut block = dir_first;
        let mut deleted: Option<EntryLoc> = None;
        let last;
        loop {
            for slot in 0..epb {
                let loc = EntryLoc { block, slot };
                let entry = self.read_entry(loc)?;
                if entry.is_free() {
                    return Ok(loc);
                }
                if deleted.is_none() && entry.is_deleted() {
                    deleted = Some(loc);
                }
            }
            match self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
                Some(next) => block = next,
                None => {
                    last = block;
                    break;
                }
            }
        }
        if let Some(loc) = deleted {
            return Ok(loc);
        }
        let new = self.table.allocate(&mut self.cache, &mut self.dev)?;
        self.table.extend(&mut self.cache, &mut self.dev, last, new)?;
        Ok(EntryLoc { block: new, slot: 0 })
    }

    /// Resolve a chain of directory components starting at the root
    fn resolve_dir(&mut self, comps: &[&str]) -> Result<u16, FsError> {
        let mut dir = self.root_block;
        for &comp in comps {
            match self.find_in_dir(dir, comp)? {
                Some((_, entry)) if entry.is_dir() => dir = entry.first_block,
                Some(_) => return Err(FsError::NotADirectory),
                None => return Err(FsError::NotFound),
            }
        }
        Ok(dir)
    }

    /// Resolve everything but the last component; return the parent
    /// directory's first block and the leaf name.
    fn lookup_parent<'p>(&mut self, path: &'p str) -> Result<(u16, &'p str), FsError> {
        let comps: Vec<&str> = components(path).collect();
        let (&leaf, parents) = comps.split_last().ok_or(FsError::InvalidPath)?;
        let dir = self.resolve_dir(parents)?;
        Ok((dir, leaf))
    }

    fn lookup(&mut self, path: &str) -> Result<(EntryLoc, DirEntry), FsError> {
        let (dir, leaf) = self.lookup_parent(path)?;
        self.find_in_dir(dir, leaf)?.ok_or(FsError::NotFound)
    }

    /// Size of a file whose directory entry still holds the erased length
    /// marker: count the chain, then scan the last block for the trailing
    /// erased region.
    fn recover_length(&mut self, first: u16) -> Result<u32, FsError> {
        let bs = self.block_size;
        let mut block = first;
        let mut blocks = 1usize;
        while let Some(next) = self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
            block = next;
            blocks += 1;
        }
        let (page, off) = self.block_page(block);
        let data = self.cache.read(&mut self.dev, page)?;
        let used = data[off..off + bs]
            .iter()
            .rposition(|&b| b != 0xFF)
            .map_or(0, |p| p + 1);
        Ok(((blocks - 1) * bs + used) as u32)
    }

    fn descriptor(&self, fd: Fd) -> Result<&Descriptor, FsError> {
        self.fds
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::BadDescriptor)
    }

    fn descriptor_mut(&mut self, fd: Fd) -> Result<&mut Descriptor, FsError> {
        self.fds
            .get_mut(fd)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::BadDescriptor)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Open a file, returning a descriptor for the read/write/seek calls.
    ///
    /// With `CREATE`, a missing file is created (its parent directory must
    /// exist). Without it, a missing file is `NotFound`. A file can be open
    /// through at most one descriptor at a time.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
            return Err(FsError::AccessDenied);
        }
        let fd = self
            .fds
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(FsError::TooManyOpenFiles)?;

        let (dir, leaf) = self.lookup_parent(path)?;
        let (loc, entry) = match self.find_in_dir(dir, leaf)? {
            Some((loc, entry)) => {
                if entry.is_dir() {
                    return Err(FsError::IsADirectory);
                }
                if self.fds.iter().flatten().any(|d| d.entry == loc) {
                    return Err(FsError::InUse);
                }
                (loc, entry)
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(FsError::NotFound);
                }
                dir::validate_name(leaf)?;
                let first = self.table.allocate(&mut self.cache, &mut self.dev)?;
                let loc = self.find_slot(dir)?;
                let entry = DirEntry::new(leaf, first, false);
                self.write_entry(loc, &entry)?;
                (loc, entry)
            }
        };

        let length = if entry.length == LENGTH_UNCOMMITTED {
            self.recover_length(entry.first_block)?
        } else {
            entry.length
        };

        self.fds[fd] = Some(Descriptor {
            entry: loc,
            first_block: entry.first_block,
            flags,
            offset: 0,
            length,
            size_dirty: false,
        });
        Ok(fd)
    }

    /// Read from the descriptor's offset, advancing it by the amount read.
    /// Returns 0 at end of file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let (first, offset, length) = {
            let d = self.descriptor(fd)?;
            if !d.flags.contains(OpenFlags::READ) {
                return Err(FsError::AccessDenied);
            }
            (d.first_block, d.offset, d.length)
        };

        let want = buf.len().min((length - offset) as usize);
        if want == 0 {
            return Ok(0);
        }

        let bs = self.block_size;
        let mut block = first;
        for _ in 0..offset as usize / bs {
            block = self
                .table
                .chain_next(&mut self.cache, &mut self.dev, block)?
                .ok_or(FsError::Corrupt)?;
        }

        let mut done = 0usize;
        let mut pos = offset as usize;
        while done < want {
            let boff = pos % bs;
            let n = (bs - boff).min(want - done);
            let (page, off) = self.block_page(block);
            let data = self.cache.read(&mut self.dev, page)?;
            buf[done..done + n].copy_from_slice(&data[off + boff..off + boff + n]);
            done += n;
            pos += n;
            if done < want {
                block = self
                    .table
                    .chain_next(&mut self.cache, &mut self.dev, block)?
                    .ok_or(FsError::Corrupt)?;
            }
        }

        self.descriptor_mut(fd)?.offset += done as u32;
        Ok(done)
    }

    /// Write at the descriptor's offset, advancing it by the amount
    /// written and growing the file as needed.
    ///
    /// A write that hits a full device mid-way returns the bytes that did
    /// fit; one that cannot write anything returns `NoSpace`.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize, FsError> {
        let (first, offset) = {
            let d = self.descriptor(fd)?;
            if !d.flags.contains(OpenFlags::WRITE) {
                return Err(FsError::AccessDenied);
            }
            (d.first_block, d.offset)
        };
        if data.is_empty() {
            return Ok(0);
        }

        let bs = self.block_size;
        let mut block = first;
        for _ in 0..offset as usize / bs {
            block = match self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
                Some(next) => next,
                None => {
                    // The offset sits exactly at the end of the chain
                    let new = self.table.allocate(&mut self.cache, &mut self.dev)?;
                    self.table.extend(&mut self.cache, &mut self.dev, block, new)?;
                    new
                }
            };
        }

        let mut done = 0usize;
        let mut pos = offset as usize;
        while done < data.len() {
            let boff = pos % bs;
            let n = (bs - boff).min(data.len() - done);
            let (page, off) = self.block_page(block);
            let chunk = &data[done..done + n];
            self.cache.update(&mut self.dev, page, |p| {
                p[off + boff..off + boff + n].copy_from_slice(chunk);
            })?;
            done += n;
            pos += n;
            if done < data.len() {
                block = match self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
                    Some(next) => next,
                    None => match self.table.allocate(&mut self.cache, &mut self.dev) {
                        Ok(new) => {
                            self.table.extend(&mut self.cache, &mut self.dev, block, new)?;
                            new
                        }
                        Err(FsError::NoSpace) => break,
                        Err(e) => return Err(e),
                    },
                };
            }
        }

        let d = self.descriptor_mut(fd)?;
        d.offset += done as u32;
        if d.offset > d.length {
            d.length = d.offset;
            d.size_dirty = true;
        }
        Ok(done)
    }

    /// Move the descriptor's offset. The result must land inside the file,
    /// end inclusive.
    pub fn seek(&mut self, fd: Fd, offset: i32, whence: SeekWhence) -> Result<u32, FsError> {
        let d = self.descriptor(fd)?;
        let base = match whence {
            SeekWhence::Start => 0,
            SeekWhence::Current => d.offset as i64,
            SeekWhence::End => d.length as i64,
        };
        let new = base + offset as i64;
        if new < 0 || new > d.length as i64 {
            return Err(FsError::InvalidOffset);
        }
        self.descriptor_mut(fd)?.offset = new as u32;
        Ok(new as u32)
    }

    /// Commit the file's size and write all cached state back to flash,
    /// leaving the file open.
    pub fn flush(&mut self, fd: Fd) -> Result<(), FsError> {
        let (loc, length, size_dirty) = {
            let d = self.descriptor(fd)?;
            (d.entry, d.length, d.size_dirty)
        };
        if size_dirty {
            self.update_length(loc, length)?;
            self.descriptor_mut(fd)?.size_dirty = false;
        }
        self.cache.sync(&mut self.dev)?;
        Ok(())
    }

    /// Flush and release the descriptor
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        self.flush(fd)?;
        self.fds[fd] = None;
        Ok(())
    }

    /// Remove a file or an empty directory, returning its blocks to the
    /// allocator. The target must not be open.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let (loc, entry) = self.lookup(path)?;
        if self.fds.iter().flatten().any(|d| d.entry == loc) {
            return Err(FsError::InUse);
        }
        if entry.is_dir() && !self.dir_is_empty(entry.first_block)? {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.table
            .free_chain(&mut self.cache, &mut self.dev, entry.first_block)?;
        self.mark_deleted(loc)?;
        self.cache.sync(&mut self.dev)?;
        Ok(())
    }

    /// Create a directory. The parent must exist, the target must not.
    pub fn create_directory(&mut self, path: &str) -> Result<(), FsError> {
        let (dir, leaf) = self.lookup_parent(path)?;
        dir::validate_name(leaf)?;
        if self.find_in_dir(dir, leaf)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let first = self.table.allocate(&mut self.cache, &mut self.dev)?;
        let loc = self.find_slot(dir)?;
        self.write_entry(loc, &DirEntry::new(leaf, first, true))?;
        self.cache.sync(&mut self.dev)?;
        Ok(())
    }

    /// List a directory. An empty path or `/` lists the root.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<EntryInfo>, FsError> {
        let comps: Vec<&str> = components(path).collect();
        let dir = self.resolve_dir(&comps)?;
        let epb = entries_per_block(self.block_size);
        let mut out = Vec::new();
        let mut block = dir;
        loop {
            for slot in 0..epb {
                let entry = self.read_entry(EntryLoc { block, slot })?;
                if !entry.is_valid() || entry.is_root(self.root_block) {
                    continue;
                }
                let length = if entry.is_dir() {
                    0
                } else if entry.length == LENGTH_UNCOMMITTED {
                    self.recover_length(entry.first_block)?
                } else {
                    entry.length
                };
                out.push(EntryInfo {
                    name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                    length,
                    is_dir: entry.is_dir(),
                });
            }
            match self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
                Some(next) => block = next,
                None => break,
            }
        }
        Ok(out)
    }

    fn dir_is_empty(&mut self, first: u16) -> Result<bool, FsError> {
        let epb = entries_per_block(self.block_size);
        let mut block = first;
        loop {
            for slot in 0..epb {
                if self.read_entry(EntryLoc { block, slot })?.is_valid() {
                    return Ok(false);
                }
            }
            match self.table.chain_next(&mut self.cache, &mut self.dev, block)? {
                Some(next) => block = next,
                None => return Ok(true),
            }
        }
    }

    /// Current size of an open file
    pub fn file_length(&self, fd: Fd) -> Result<u32, FsError> {
        Ok(self.descriptor(fd)?.length)
    }

    /// Current offset of an open file
    pub fn position(&self, fd: Fd) -> Result<u32, FsError> {
        Ok(self.descriptor(fd)?.offset)
    }

    /// Write all cached pages back to flash.
    ///
    /// Sizes of still-open files are committed by `flush`/`close`, not
    /// here; an image synced mid-write stays recoverable instead.
    pub fn sync(&mut self) -> Result<usize, FsError> {
        self.cache.sync(&mut self.dev)
    }

    /// Volume usage counters
    pub fn stats(&mut self) -> Result<FsStats, FsError> {
        let (free, deleted) = self.table.counts(&mut self.cache, &mut self.dev)?;
        Ok(FsStats {
            total_blocks: self.table.total_blocks() as usize,
            free_blocks: free,
            deleted_blocks: deleted,
            block_size: self.block_size,
        })
    }

    /// Page cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;

    // 16 pages of 1 KiB, 256-byte blocks: 64 blocks, table in block 0,
    // root directory in block 1
    fn flash() -> RamFlash {
        RamFlash::with_geometry(Geometry {
            page_size: 1024,
            page_count: 16,
            block_size: 256,
        })
    }

    fn fresh() -> FileSystem<RamFlash> {
        FileSystem::format(flash()).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_format_mount_roundtrip() {
        let mut fs = fresh();
        let fd = fs
            .open("boot.cfg", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fd, b"quiet=1").unwrap();
        fs.close(fd).unwrap();

        let dev = fs.into_device().unwrap();
        let mut fs = FileSystem::mount(dev).unwrap();
        let fd = fs.open("boot.cfg", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"quiet=1");
    }

    #[test]
    fn test_mount_rejects_blank_device() {
        assert_eq!(FileSystem::mount(flash()).err(), Some(FsError::Corrupt));
    }

    #[test]
    fn test_mount_or_format() {
        let fs = FileSystem::mount_or_format(flash()).unwrap();
        let dev = fs.into_device().unwrap();
        // Second time around the existing volume is kept
        let erases = dev.total_erases();
        let fs = FileSystem::mount_or_format(dev).unwrap();
        assert_eq!(fs.device().total_erases(), erases);
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let dev = RamFlash::with_geometry(Geometry {
            page_size: 100,
            page_count: 4,
            block_size: 64,
        });
        assert_eq!(FileSystem::format(dev).err(), Some(FsError::BadGeometry));
    }

    #[test]
    fn test_open_missing_without_create() {
        let mut fs = fresh();
        assert_eq!(
            fs.open("nope.txt", OpenFlags::READ).err(),
            Some(FsError::NotFound)
        );
    }

    #[test]
    fn test_open_requires_access_flags() {
        let mut fs = fresh();
        assert_eq!(
            fs.open("x", OpenFlags::CREATE).err(),
            Some(FsError::AccessDenied)
        );
    }

    #[test]
    fn test_write_read_seek() {
        let mut fs = fresh();
        let fd = fs
            .open(
                "greeting",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .unwrap();
        assert_eq!(fs.write(fd, b"hello world").unwrap(), 11);

        assert_eq!(fs.seek(fd, 6, SeekWhence::Start).unwrap(), 6);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        // Offset advanced to the end, a further read returns 0
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);

        assert_eq!(fs.seek(fd, -11, SeekWhence::End).unwrap(), 0);
        assert_eq!(fs.seek(fd, 2, SeekWhence::Current).unwrap(), 2);
        let mut buf = [0u8; 3];
        fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"llo");
    }

    #[test]
    fn test_seek_outside_file_rejected() {
        let mut fs = fresh();
        let fd = fs
            .open("f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fd, b"abc").unwrap();
        assert_eq!(
            fs.seek(fd, 4, SeekWhence::Start).err(),
            Some(FsError::InvalidOffset)
        );
        assert_eq!(
            fs.seek(fd, -4, SeekWhence::End).err(),
            Some(FsError::InvalidOffset)
        );
        assert_eq!(fs.seek(fd, 3, SeekWhence::Start).unwrap(), 3);
    }

    #[test]
    fn test_access_flags_enforced() {
        let mut fs = fresh();
        let fd = fs
            .open("f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fd, &mut buf).err(), Some(FsError::AccessDenied));
        fs.close(fd).unwrap();

        let fd = fs.open("f", OpenFlags::READ).unwrap();
        assert_eq!(fs.write(fd, b"x").err(), Some(FsError::AccessDenied));
    }

    #[test]
    fn test_one_descriptor_per_file() {
        let mut fs = fresh();
        let fd = fs
            .open("f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        assert_eq!(fs.open("f", OpenFlags::READ).err(), Some(FsError::InUse));
        fs.close(fd).unwrap();
        fs.open("f", OpenFlags::READ).unwrap();
    }

    #[test]
    fn test_descriptor_table_bounds() {
        let mut fs = fresh();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read(99, &mut buf).err(), Some(FsError::BadDescriptor));
        assert_eq!(fs.close(3).err(), Some(FsError::BadDescriptor));

        for i in 0..MAX_OPEN_FILES {
            let name = alloc::format!("file{}", i);
            fs.open(&name, OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        }
        assert_eq!(
            fs.open("overflow", OpenFlags::WRITE | OpenFlags::CREATE).err(),
            Some(FsError::TooManyOpenFiles)
        );
    }

    #[test]
    fn test_multi_block_file() {
        let mut fs = fresh();
        let data = pattern(1000);
        let fd = fs
            .open(
                "big.bin",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .unwrap();
        assert_eq!(fs.write(fd, &data).unwrap(), 1000);
        assert_eq!(fs.file_length(fd).unwrap(), 1000);

        fs.seek(fd, 0, SeekWhence::Start).unwrap();
        let mut back = vec![0u8; 1000];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 1000);
        assert_eq!(back, data);

        // Read straddling block boundaries
        fs.seek(fd, 250, SeekWhence::Start).unwrap();
        let mut mid = [0u8; 20];
        fs.read(fd, &mut mid).unwrap();
        assert_eq!(&mid[..], &data[250..270]);
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut fs = fresh();
        let fd = fs
            .open(
                "notes",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .unwrap();
        fs.write(fd, &pattern(600)).unwrap();
        fs.seek(fd, 100, SeekWhence::Start).unwrap();
        fs.write(fd, &[0xAA; 8]).unwrap();
        assert_eq!(fs.position(fd).unwrap(), 108);
        // Length unchanged by an interior overwrite
        assert_eq!(fs.file_length(fd).unwrap(), 600);

        fs.seek(fd, 99, SeekWhence::Start).unwrap();
        let mut buf = [0u8; 10];
        fs.read(fd, &mut buf).unwrap();
        assert_eq!(buf[0], 99);
        assert_eq!(&buf[1..9], &[0xAA; 8]);
        assert_eq!(buf[9], (108 % 251) as u8);
    }

    #[test]
    fn test_close_commits_length() {
        let mut fs = fresh();
        let fd = fs
            .open("log", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fd, &pattern(300)).unwrap();
        fs.close(fd).unwrap();

        let entries = fs.read_dir("").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "log");
        assert_eq!(entries[0].length, 300);
    }

    #[test]
    fn test_length_recovered_after_power_loss() {
        let mut fs = fresh();
        let fd = fs
            .open("wal", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fd, &pattern(700)).unwrap();
        // Data reaches flash, but the size is never committed
        fs.sync().unwrap();
        let dev = fs.into_device().unwrap();

        let mut fs = FileSystem::mount(dev).unwrap();
        let fd = fs.open("wal", OpenFlags::READ).unwrap();
        assert_eq!(fs.file_length(fd).unwrap(), 700);
        let mut back = vec![0u8; 700];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 700);
        assert_eq!(back, pattern(700));
    }

    #[test]
    fn test_remove() {
        let mut fs = fresh();
        let fd = fs
            .open("tmp", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fd, &pattern(600)).unwrap();

        // Still open
        assert_eq!(fs.remove("tmp").err(), Some(FsError::InUse));
        fs.close(fd).unwrap();

        let before = fs.stats().unwrap();
        fs.remove("tmp").unwrap();
        let after = fs.stats().unwrap();
        assert_eq!(after.deleted_blocks, before.deleted_blocks + 3);
        assert!(fs.read_dir("").unwrap().is_empty());

        assert_eq!(fs.remove("tmp").err(), Some(FsError::NotFound));
    }

    #[test]
    fn test_space_reused_after_remove() {
        let geometry = Geometry {
            page_size: 1024,
            page_count: 4,
            block_size: 256,
        };
        let mut fs = FileSystem::format(RamFlash::with_geometry(geometry)).unwrap();

        for round in 0..4 {
            let name = alloc::format!("blob{}", round);
            let fd = fs
                .open(&name, OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            // More than half the device, so rounds must reuse space
            let data = pattern(2048);
            let mut written = 0;
            while written < data.len() {
                match fs.write(fd, &data[written..]) {
                    Ok(n) => written += n,
                    Err(FsError::NoSpace) => break,
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            }
            assert!(written >= 1024, "round {} wrote {}", round, written);
            fs.close(fd).unwrap();
            fs.remove(&name).unwrap();
        }
    }

    #[test]
    fn test_directories() {
        let mut fs = fresh();
        fs.create_directory("logs").unwrap();
        fs.create_directory("logs/old").unwrap();
        assert_eq!(
            fs.create_directory("logs").err(),
            Some(FsError::AlreadyExists)
        );
        assert_eq!(
            fs.create_directory("missing/sub").err(),
            Some(FsError::NotFound)
        );

        let fd = fs
            .open("logs/app.txt", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fd, b"started").unwrap();
        fs.close(fd).unwrap();

        let root = fs.read_dir("").unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_dir);

        let mut logs = fs.read_dir("logs").unwrap();
        logs.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].name, "app.txt");
        assert_eq!(logs[0].length, 7);
        assert_eq!(logs[1].name, "old");

        assert_eq!(
            fs.open("logs", OpenFlags::READ).err(),
            Some(FsError::IsADirectory)
        );
        assert_eq!(
            fs.open("logs/app.txt/x", OpenFlags::READ).err(),
            Some(FsError::NotADirectory)
        );

        assert_eq!(fs.remove("logs").err(), Some(FsError::DirectoryNotEmpty));
        fs.remove("logs/app.txt").unwrap();
        fs.remove("logs/old").unwrap();
        fs.remove("logs").unwrap();
        assert!(fs.read_dir("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_names() {
        let mut fs = fresh();
        assert_eq!(
            fs.open("", OpenFlags::WRITE | OpenFlags::CREATE).err(),
            Some(FsError::InvalidPath)
        );
        assert_eq!(
            fs.open(
                "a-name-that-goes-on-forever",
                OpenFlags::WRITE | OpenFlags::CREATE
            )
            .err(),
            Some(FsError::NameTooLong)
        );
        assert_eq!(fs.remove("/").err(), Some(FsError::InvalidPath));
    }

    #[test]
    fn test_directory_grows_past_one_block() {
        let mut fs = fresh();
        // Root block holds 10 entries, one taken by the volume marker
        for i in 0..12 {
            let name = alloc::format!("f{:02}", i);
            let fd = fs
                .open(&name, OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            fs.close(fd).unwrap();
        }
        assert_eq!(fs.read_dir("").unwrap().len(), 12);
    }

    #[test]
    fn test_deleted_slot_reused() {
        let mut fs = fresh();
        for name in ["a", "b", "c"] {
            let fd = fs
                .open(name, OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            fs.close(fd).unwrap();
        }
        fs.remove("b").unwrap();

        // Root still has free slots, so the deleted one stays untouched
        let fd = fs.open("d", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        fs.close(fd).unwrap();

        // Fill the remaining free slots, then one more must land in the
        // deleted slot rather than growing the directory
        let before = fs.stats().unwrap().free_blocks;
        for i in 0..5 {
            let name = alloc::format!("fill{}", i);
            let fd = fs
                .open(&name, OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            fs.close(fd).unwrap();
        }
        let fd = fs
            .open("reuse", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.close(fd).unwrap();
        let after = fs.stats().unwrap().free_blocks;
        // 6 file bodies allocated, no directory growth
        assert_eq!(before - after, 6);
        assert_eq!(fs.read_dir("").unwrap().len(), 9);
    }
}
