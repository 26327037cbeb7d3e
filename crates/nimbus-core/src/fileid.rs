//! File identifiers — the 12-byte `(name-hash, mtime)` pair.

use crate::hash::hash_file_name;

/// 64-bit fingerprint of a cloud-relative path plus its kind.
pub type HashFile = u64;

/// A 12-byte file identifier: the lower 8 bytes are the little-endian
/// name hash, the upper 4 the Unix-epoch seconds of last write.
///
/// Directories carry timestamp 0, which distinguishes them from files.
/// Equality, ordering, and map-key behavior are byte-wise — the derives
/// on the inner array provide exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId([u8; 12]);

impl FileId {
    pub fn new(hash: HashFile, unix_timestamp: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&hash.to_le_bytes());
        bytes[8..].copy_from_slice(&unix_timestamp.to_le_bytes());
        Self(bytes)
    }

    /// Identifier for a directory — timestamp fixed at 0.
    pub fn for_directory(hash: HashFile) -> Self {
        Self::new(hash, 0)
    }

    /// Identifier derived straight from a path.
    pub fn from_path(relative_path: &str, is_directory: bool, unix_timestamp: u32) -> Self {
        let ts = if is_directory { 0 } else { unix_timestamp };
        Self::new(hash_file_name(relative_path, is_directory), ts)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn hash(&self) -> HashFile {
        u64::from_le_bytes(self.0[..8].try_into().unwrap())
    }

    pub fn unix_timestamp(&self) -> u32 {
        u32::from_le_bytes(self.0[8..].try_into().unwrap())
    }

    pub fn is_directory(&self) -> bool {
        self.unix_timestamp() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let id = FileId::new(0xDEAD_BEEF_CAFE_F00D, 1_700_000_000);
        let recovered = FileId::from_bytes(*id.as_bytes());
        assert_eq!(id, recovered);
        assert_eq!(recovered.hash(), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(recovered.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn directories_have_zero_timestamp() {
        let id = FileId::for_directory(7);
        assert!(id.is_directory());
        assert_eq!(id.unix_timestamp(), 0);

        let file = FileId::new(7, 100);
        assert!(!file.is_directory());
    }

    #[test]
    fn from_path_forces_zero_timestamp_for_directories() {
        let id = FileId::from_path("photos", true, 1_700_000_000);
        assert!(id.is_directory());
    }

    #[test]
    fn ordering_is_byte_wise() {
        let a = FileId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        let b = FileId::from_bytes([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        // Byte-wise comparison looks at the first byte first
        assert!(a < b);
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = std::collections::HashMap::new();
        map.insert(FileId::new(1, 2), "x");
        assert_eq!(map.get(&FileId::new(1, 2)), Some(&"x"));
        assert_eq!(map.get(&FileId::new(1, 3)), None);
    }
}
