//! On-flash directory structures
//!
//! A directory is an ordinary block chain whose content is an array of
//! fixed-size entries. Entries never cross a block boundary; the tail of a
//! block that cannot hold a whole entry stays unused.
//!
//! Entry flags exploit erased-flash semantics. A slot starts at `0xFFFF`
//! (free), becomes `VALID` or `DIRECTORY` when claimed and `0x0000` when
//! deleted, so the whole lifecycle clears bits and never needs an erase by
//! itself.

use crate::FsError;

/// Bytes reserved for a name, including NUL padding
pub const NAME_LEN: usize = 16;
/// Longest usable name, one byte short of the field for the padding
pub const MAX_NAME_LEN: usize = NAME_LEN - 1;
/// Serialized entry size: 16 (name) + 2 (first block) + 2 (flags) + 4 (length)
pub const ENTRY_SIZE: usize = 24;

/// Slot never written since the covering page was erased
pub const FLAG_FREE: u16 = 0xFFFF;
/// Live file entry
pub const FLAG_VALID: u16 = 0x0FFF;
/// Live directory entry (`FLAG_VALID` with bit 8 cleared)
pub const FLAG_DIRECTORY: u16 = 0x0EFF;
/// Deleted entry
pub const FLAG_DELETED: u16 = 0x0000;

/// Length value of a file whose size has not been committed yet.
///
/// This is the erased state of the field. `flush`/`close` program the real
/// size; a file that was open at power loss keeps this marker and its size
/// is recovered from the chain on the next open.
pub const LENGTH_UNCOMMITTED: u32 = u32::MAX;

/// The name of the root entry. A path component can never equal this, so
/// the root entry is unreachable through lookup.
pub const ROOT_NAME: &[u8] = b"/";

/// Magic value stored in the root entry's length field
pub const ROOT_MAGIC: u32 = u32::from_le_bytes(*b"EFS1");

/// Address of a directory entry on flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLoc {
    /// Block holding the entry
    pub block: u16,
    /// Entry index within the block
    pub slot: usize,
}

/// One decoded directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; NAME_LEN],
    pub first_block: u16,
    pub flags: u16,
    pub length: u32,
}

impl DirEntry {
    /// Build a live entry for a new file or directory
    pub fn new(name: &str, first_block: u16, directory: bool) -> Self {
        let mut buf = [0u8; NAME_LEN];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: buf,
            first_block,
            flags: if directory { FLAG_DIRECTORY } else { FLAG_VALID },
            length: LENGTH_UNCOMMITTED,
        }
    }

    /// The root entry written at format time and checked at mount
    pub fn root(root_block: u16) -> Self {
        let mut name = [0u8; NAME_LEN];
        name[..ROOT_NAME.len()].copy_from_slice(ROOT_NAME);
        Self {
            name,
            first_block: root_block,
            flags: FLAG_DIRECTORY,
            length: ROOT_MAGIC,
        }
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&raw[..NAME_LEN]);
        Self {
            name,
            first_block: u16::from_le_bytes([raw[16], raw[17]]),
            flags: u16::from_le_bytes([raw[18], raw[19]]),
            length: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..NAME_LEN].copy_from_slice(&self.name);
        out[16..18].copy_from_slice(&self.first_block.to_le_bytes());
        out[18..20].copy_from_slice(&self.flags.to_le_bytes());
        out[20..24].copy_from_slice(&self.length.to_le_bytes());
    }

    pub fn is_valid(&self) -> bool {
        self.flags == FLAG_VALID || self.flags == FLAG_DIRECTORY
    }

    pub fn is_dir(&self) -> bool {
        self.flags == FLAG_DIRECTORY
    }

    pub fn is_free(&self) -> bool {
        self.flags == FLAG_FREE
    }

    pub fn is_deleted(&self) -> bool {
        self.flags == FLAG_DELETED
    }

    /// The name up to its NUL padding
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_LEN);
        &self.name[..len]
    }

    pub fn matches(&self, name: &str) -> bool {
        self.is_valid() && self.name_bytes() == name.as_bytes()
    }

    /// Whether this is the root entry of a correctly formatted volume
    pub fn is_root(&self, root_block: u16) -> bool {
        self.flags == FLAG_DIRECTORY
            && self.first_block == root_block
            && self.length == ROOT_MAGIC
            && self.name_bytes() == ROOT_NAME
    }
}

/// Directory entries per block for a given block size
pub fn entries_per_block(block_size: usize) -> usize {
    block_size / ENTRY_SIZE
}

/// Check one path component: non-empty, short enough, printable ASCII.
pub fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() {
        return Err(FsError::InvalidPath);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    if !name.bytes().all(|b| (0x20..0x7F).contains(&b)) {
        return Err(FsError::InvalidPath);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let entry = DirEntry::new("config.txt", 42, false);
        let mut raw = [0u8; ENTRY_SIZE];
        entry.encode(&mut raw);
        let back = DirEntry::decode(&raw);
        assert_eq!(back, entry);
        assert_eq!(back.name_bytes(), b"config.txt");
        assert!(back.is_valid());
        assert!(!back.is_dir());
        assert_eq!(back.length, LENGTH_UNCOMMITTED);
    }

    #[test]
    fn test_erased_slot_reads_as_free() {
        let entry = DirEntry::decode(&[0xFF; ENTRY_SIZE]);
        assert!(entry.is_free());
        assert!(!entry.is_valid());
    }

    #[test]
    fn test_zeroed_slot_reads_as_deleted() {
        let entry = DirEntry::decode(&[0x00; ENTRY_SIZE]);
        assert!(entry.is_deleted());
        assert!(!entry.is_valid());
    }

    #[test]
    fn test_root_entry_unreachable_by_name() {
        let root = DirEntry::root(4);
        assert!(root.is_root(4));
        assert!(!root.is_root(5));
        // split('/') can never produce a "/" component
        assert!(!"a/b".split('/').any(|c| c == "/"));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("data.log").is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert_eq!(validate_name(""), Err(FsError::InvalidPath));
        assert_eq!(
            validate_name(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(FsError::NameTooLong)
        );
        assert_eq!(validate_name("tab\there"), Err(FsError::InvalidPath));
    }

    #[test]
    fn test_flag_transitions_only_clear_bits() {
        for to in [FLAG_VALID, FLAG_DIRECTORY] {
            assert_eq!(to & !FLAG_FREE, 0);
            assert_eq!(FLAG_DELETED & !to, 0);
        }
    }
}
