use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::Result;

/// Byte store addressed by absolute offset. The page file and the blob log
/// both sit on one of these; neither keeps a cursor.
pub trait Storage {
    /// Fill `buf` from `offset`. Running past the end is an
    /// `Io(UnexpectedEof)` error, never a partial read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at `offset`; a write past the end extends the store.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush data and metadata.
    fn sync(&self) -> Result<()>;

    /// Flush data only.
    fn sync_data(&self) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// A file held open for the lifetime of the store.
pub struct DiskStorage {
    file: File,
}

impl DiskStorage {
    /// Opens `path`, creating it if missing. Existing content is kept.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path.as_ref(), false)
    }

    /// Opens `path` as an empty file, dropping whatever it held. Used for
    /// the compaction scratch file.
    pub fn truncated<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path.as_ref(), true)
    }

    fn open(path: &Path, truncate: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        Ok(Self { file })
    }
}

impl Storage for DiskStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Vec-backed store for tests and scratch trees. Reads past the end fail
/// the same way a short file read does.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    bytes: Vec<u8>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn range(offset: u64, len: usize) -> Option<(usize, usize)> {
        let start = usize::try_from(offset).ok()?;
        Some((start, start.checked_add(len)?))
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let src = Self::range(offset, buf.len())
            .and_then(|(start, end)| self.bytes.get(start..end))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {offset} past end {}", buf.len(), self.bytes.len()),
                )
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let (start, end) = Self::range(offset, buf.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("write at {offset} overflows"))
        })?;
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn sync_data(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::NamedTempFile;

    #[test]
    fn memory_storage_grows_on_write() {
        let mut storage = MemoryStorage::new();
        assert!(storage.is_empty().unwrap());

        storage.write_at(b"abc", 4).unwrap();
        assert_eq!(storage.len().unwrap(), 7);

        let mut buf = [0u8; 7];
        storage.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"\0\0\0\0abc");
    }

    #[test]
    fn memory_short_read_matches_disk() {
        let mut memory = MemoryStorage::new();
        memory.write_at(b"xy", 0).unwrap();

        let file = NamedTempFile::new().unwrap();
        let mut disk = DiskStorage::new(file.path()).unwrap();
        disk.write_at(b"xy", 0).unwrap();

        let mut buf = [0u8; 8];
        for result in [memory.read_at(&mut buf, 0), disk.read_at(&mut buf, 0)] {
            match result {
                Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
                other => panic!("expected a short read, got {other:?}"),
            }
        }
        assert!(matches!(
            memory.read_at(&mut buf, u64::MAX),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn truncated_discards_previous_content() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut storage = DiskStorage::new(file.path()).unwrap();
            storage.write_at(b"payload", 0).unwrap();
        }
        let storage = DiskStorage::truncated(file.path()).unwrap();
        assert!(storage.is_empty().unwrap());
    }
}
