use super::node::PageOffset;
use crate::error::{Error, Result};

pub const VERSION: u32 = 1;
pub const MAGIC: [u8; 8] = *b"IMGBTREE";

// magic(8) + version(4) + root_offset(8) + free_offset(8) + node_count(4) + crc32(4)
pub const HEADER_SIZE: usize = 36;
const CHECKSUM_START: usize = HEADER_SIZE - 4;

/// Persisted tree state stored at the start of the page file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub root_offset: PageOffset,
    pub free_offset: u64, // Next unused byte, only ever grows
    pub node_count: u32,  // Pages ever allocated
}

impl Header {
    /// Header of a file with no pages yet.
    pub fn empty() -> Self {
        Header {
            root_offset: PageOffset(HEADER_SIZE as u64),
            free_offset: HEADER_SIZE as u64,
            node_count: 0,
        }
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buffer = [0u8; HEADER_SIZE];
        buffer[0..8].copy_from_slice(&MAGIC);
        buffer[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buffer[12..20].copy_from_slice(&(self.root_offset.0 as i64).to_le_bytes());
        buffer[20..28].copy_from_slice(&(self.free_offset as i64).to_le_bytes());
        buffer[28..32].copy_from_slice(&(self.node_count as i32).to_le_bytes());
        let checksum = crc32fast::hash(&buffer[..CHECKSUM_START]);
        buffer[CHECKSUM_START..].copy_from_slice(&checksum.to_le_bytes());
        buffer
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Self> {
        if buffer.len() != HEADER_SIZE {
            return Err(Error::Deserialization(format!(
                "Invalid header size: {} bytes (expected {HEADER_SIZE} bytes)",
                buffer.len()
            )));
        }

        if buffer[0..8] != MAGIC {
            return Err(Error::Deserialization("Invalid magic number".into()));
        }

        let version = u32::from_le_bytes(field(buffer, 8));
        if version != VERSION {
            return Err(Error::Deserialization(format!(
                "Unsupported version: {version}"
            )));
        }

        let stored = u32::from_le_bytes(field(buffer, CHECKSUM_START));
        let computed = crc32fast::hash(&buffer[..CHECKSUM_START]);
        if stored != computed {
            return Err(Error::Corruption(format!(
                "Header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let root_offset = i64::from_le_bytes(field(buffer, 12));
        let free_offset = i64::from_le_bytes(field(buffer, 20));
        let node_count = i32::from_le_bytes(field(buffer, 28));
        if root_offset < HEADER_SIZE as i64 || free_offset < root_offset || node_count < 0 {
            return Err(Error::Corruption(format!(
                "Inconsistent header: root {root_offset}, free {free_offset}, nodes {node_count}"
            )));
        }

        Ok(Header {
            root_offset: PageOffset(root_offset as u64),
            free_offset: free_offset as u64,
            node_count: node_count as u32,
        })
    }
}

fn field<const N: usize>(buf: &[u8], start: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[start..start + N]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_serialization_roundtrip() {
        let original = Header {
            root_offset: PageOffset(412),
            free_offset: 600,
            node_count: 3,
        };
        let bytes = original.serialize();
        assert_eq!(Header::deserialize(&bytes).unwrap(), original);
    }

    #[test]
    fn detect_invalid_magic() {
        let mut bytes = Header::empty().serialize();
        bytes[0..8].copy_from_slice(b"BADMAGIC");

        match Header::deserialize(&bytes) {
            Err(Error::Deserialization(e)) => assert!(e.contains("Invalid magic number")),
            _ => panic!("Should fail on invalid magic"),
        }
    }

    #[test]
    fn detect_invalid_version() {
        let mut bytes = Header::empty().serialize();
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());

        match Header::deserialize(&bytes) {
            Err(Error::Deserialization(e)) => assert!(e.contains("Unsupported version")),
            _ => panic!("Should fail on invalid version"),
        }
    }

    #[test]
    fn detect_checksum_mismatch() {
        let mut bytes = Header::empty().serialize();
        bytes[20] ^= 0xff;

        assert!(matches!(
            Header::deserialize(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn detect_corrupted_header() {
        let buffer = [0u8; 20];
        match Header::deserialize(&buffer) {
            Err(Error::Deserialization(e)) => assert!(e.contains("Invalid header size")),
            _ => panic!("Should fail on undersized header"),
        }
    }
}
