use crate::btree::storage::{DiskStorage, Storage};
use crate::error::{Error, Result};
use crate::option::Durability;

pub type DiskBlobLog = BlobLog<DiskStorage>;

/// Append-only store for compressed image payloads.
///
/// Payloads are written back to back with no framing. The index keeps the
/// `(offset, size)` of each one, so the log itself never needs to be scanned.
/// Bytes of removed images stay in place until the log is compacted.
pub struct BlobLog<S: Storage> {
    /// Underlying byte storage.
    storage: S,

    /// Current end of the log, where the next payload is written.
    len: u64,

    /// Whether every append is synced before returning.
    durability: Durability,
}

impl<S: Storage> BlobLog<S> {
    /// Opens a log over `storage`, appending after any existing content.
    pub fn new(storage: S, durability: Durability) -> Result<Self> {
        let len = storage.len()?;
        Ok(Self {
            storage,
            len,
            durability,
        })
    }

    /// Appends a payload and returns the offset it was written at.
    ///
    /// An empty payload writes nothing and returns the current end of the
    /// log; it can still be read back as zero bytes from that offset.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.len;
        if payload.is_empty() {
            return Ok(offset);
        }

        self.storage.write_at(payload, offset)?;
        self.len += payload.len() as u64;
        if self.durability == Durability::Always {
            self.storage.sync_data()?;
        }

        log::trace!("Appended {} byte blob at {offset}", payload.len());
        Ok(offset)
    }

    /// Reads `size` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlobOutOfRange`] if the range runs past the end of the
    /// log.
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > self.len) {
            return Err(Error::BlobOutOfRange { offset, size });
        }

        let mut buffer = vec![0u8; size as usize];
        self.storage.read_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.sync()
    }
}

impl<S: Storage> Drop for BlobLog<S> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Error during blob log drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::storage::MemoryStorage;
    use tempfile::NamedTempFile;

    fn memory_log() -> BlobLog<MemoryStorage> {
        BlobLog::new(MemoryStorage::new(), Durability::Manual).unwrap()
    }

    #[test]
    fn append_returns_consecutive_offsets() {
        let mut log = memory_log();
        assert!(log.is_empty());

        assert_eq!(log.append(b"hello").unwrap(), 0);
        assert_eq!(log.append(b"world!").unwrap(), 5);
        assert_eq!(log.len(), 11);

        assert_eq!(log.read(0, 5).unwrap(), b"hello");
        assert_eq!(log.read(5, 6).unwrap(), b"world!");
        assert_eq!(log.read(3, 4).unwrap(), b"lowo");
    }

    #[test]
    fn empty_payload() {
        let mut log = memory_log();
        log.append(b"abc").unwrap();

        assert_eq!(log.append(b"").unwrap(), 3);
        assert_eq!(log.len(), 3);
        assert!(log.read(3, 0).unwrap().is_empty());
    }

    #[test]
    fn read_out_of_range() {
        let mut log = memory_log();
        log.append(b"abc").unwrap();

        assert!(matches!(
            log.read(2, 2),
            Err(Error::BlobOutOfRange { offset: 2, size: 2 })
        ));
        assert!(matches!(
            log.read(u64::MAX, 1),
            Err(Error::BlobOutOfRange { .. })
        ));
    }

    #[test]
    fn reopen_appends_after_existing_content() {
        let file = NamedTempFile::new().unwrap();

        {
            let mut log = BlobLog::new(DiskStorage::new(file.path()).unwrap(), Durability::Always)
                .unwrap();
            log.append(b"first").unwrap();
        }

        let mut log =
            BlobLog::new(DiskStorage::new(file.path()).unwrap(), Durability::Manual).unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log.append(b"second").unwrap(), 5);
        assert_eq!(log.read(0, 11).unwrap(), b"firstsecond");
    }
}
