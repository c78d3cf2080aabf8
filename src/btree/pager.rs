use super::header::{Header, HEADER_SIZE};
use super::node::{Node, PageOffset, PAGE_SIZE};
use super::storage::Storage;
use crate::error::{Error, Result};
use crate::option::Durability;

/// Fixed-size page records inside a single file, addressed by byte offset.
///
/// New pages come from a bump allocator at `free_offset`; space is never
/// handed back, so a page that dies in a merge stays on disk unreferenced.
pub struct Pager<S: Storage> {
    storage: S,
    header: Header,
    durability: Durability,
}

impl<S: Storage> Pager<S> {
    /// Initialise empty storage with a bare header. The caller allocates the
    /// first root page.
    pub fn create(mut storage: S, durability: Durability) -> Result<Self> {
        let header = Header::empty();
        storage.write_at(&header.serialize(), 0)?;
        storage.sync()?;
        Ok(Pager {
            storage,
            header,
            durability,
        })
    }

    /// Load the header of existing storage.
    pub fn open(storage: S, durability: Durability) -> Result<Self> {
        let mut buffer = [0u8; HEADER_SIZE];
        storage.read_at(&mut buffer, 0)?;
        let header = Header::deserialize(&buffer)?;

        let len = storage.len()?;
        if len < header.free_offset {
            return Err(Error::Corruption(format!(
                "Page file is {len} bytes but the header claims {}",
                header.free_offset
            )));
        }

        Ok(Pager {
            storage,
            header,
            durability,
        })
    }

    /// Replace the in-memory header with the one on storage, dropping any
    /// change that was not persisted.
    pub fn reload_header(&mut self) -> Result<()> {
        let mut buffer = [0u8; HEADER_SIZE];
        self.storage.read_at(&mut buffer, 0)?;
        self.header = Header::deserialize(&buffer)?;
        Ok(())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn set_root(&mut self, root: PageOffset) {
        self.header.root_offset = root;
    }

    /// First byte offset that can hold a page.
    pub fn first_page() -> u64 {
        HEADER_SIZE as u64
    }

    /// Append a blank page and persist the advanced header. If the page
    /// write fails the in-memory header is left untouched.
    pub fn allocate_page(&mut self, is_leaf: bool) -> Result<PageOffset> {
        let offset = PageOffset(self.header.free_offset);
        self.storage
            .write_at(&Node::blank_page(offset, is_leaf), offset.get())?;

        self.header.free_offset += PAGE_SIZE as u64;
        self.header.node_count += 1;
        self.write_header()?;
        log::trace!("Allocated page at {offset} (leaf: {is_leaf})");
        Ok(offset)
    }

    pub fn read_page(&self, offset: PageOffset) -> Result<Node> {
        self.check_offset(offset)?;

        let mut buffer = [0u8; PAGE_SIZE];
        self.storage.read_at(&mut buffer, offset.get())?;
        log::trace!("Read page at {offset}");
        Node::deserialize(&buffer, offset)
    }

    pub fn write_page(&mut self, node: &Node) -> Result<()> {
        self.check_offset(node.offset)?;

        let buffer = node.serialize()?;
        self.storage.write_at(&buffer, node.offset.get())?;
        log::trace!("Wrote page at {} with {} keys", node.offset, node.num_keys());
        self.maybe_sync()
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.storage.write_at(&self.header.serialize(), 0)?;
        self.maybe_sync()
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }

    /// Offsets of every page ever allocated, in file order.
    pub fn page_offsets(&self) -> impl Iterator<Item = PageOffset> {
        (Self::first_page()..self.header.free_offset)
            .step_by(PAGE_SIZE)
            .map(PageOffset)
    }

    fn check_offset(&self, offset: PageOffset) -> Result<()> {
        let raw = offset.get();
        let first = Self::first_page();
        if raw < first
            || (raw - first) % PAGE_SIZE as u64 != 0
            || raw + PAGE_SIZE as u64 > self.header.free_offset
        {
            return Err(Error::InvalidOffset(raw));
        }
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.durability {
            Durability::Always => self.storage.sync_data()?,
            Durability::Manual => {} // Only sync on flush() or drop
        }
        Ok(())
    }
}
