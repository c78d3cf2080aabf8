use std::fs;
use std::io::Write;
use std::path::Path;

use crate::blob::{BlobLog, DiskBlobLog};
use crate::btree::{BTree, DiskBTree, DiskStorage, ImageKey, TreeStats};
use crate::codec::{self, Bitmap, GrayImage};
use crate::error::{Error, Result};
use crate::option::{Durability, Options};

/// Binarized image database: a B-tree index over `(name, threshold)` and an
/// append-only log holding the compressed pixels.
pub struct ImageDb {
    opts: Options,
    tree: DiskBTree,
    blobs: DiskBlobLog,
}

impl ImageDb {
    /// Opens the database in `opts.dir`, creating the index and data files
    /// if they do not exist yet.
    pub fn open(opts: Options) -> Result<Self> {
        if !opts.dir.as_os_str().is_empty() && !opts.dir.exists() {
            if !opts.create_if_not_exists {
                return Err(Error::InvalidArgument(format!(
                    "Directory {} does not exist",
                    opts.dir.display()
                )));
            }
            fs::create_dir_all(&opts.dir)?;
        }

        // A scratch file left behind by an interrupted compaction is never
        // referenced by the index.
        let scratch = opts.compaction_path();
        if scratch.exists() {
            fs::remove_file(&scratch)?;
        }

        let tree = BTree::disk(opts.index_path(), opts.durability)?;
        let blobs = BlobLog::new(DiskStorage::new(opts.data_path())?, opts.durability)?;

        log::info!(
            "Opened image database in {} ({} data bytes)",
            opts.dir.display(),
            blobs.len()
        );
        Ok(Self { opts, tree, blobs })
    }

    /// Binarizes `image` at `threshold`, stores the compressed pixels and
    /// indexes them. An existing entry with the same name and threshold is
    /// not replaced; both are kept.
    pub fn add_image(&mut self, name: &str, image: &GrayImage, threshold: i32) -> Result<ImageKey> {
        let bitmap = image.binarize(threshold);
        let payload = codec::compress(&bitmap);
        let size = u32::try_from(payload.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "Compressed image is {} bytes, more than a key can address",
                payload.len()
            ))
        })?;

        // Refuse keys the index cannot encode before the payload is written.
        let mut key = ImageKey::new(
            name,
            threshold,
            self.blobs.len(),
            size,
            image.width(),
            image.height(),
        );
        key.check_encodable()?;

        let offset = self.blobs.append(&payload)?;
        key.data_offset = offset;
        self.tree.insert(key.clone())?;

        log::debug!("Added {key} ({size} bytes at {offset})");
        Ok(key)
    }

    pub fn add_with_thresholds(
        &mut self,
        name: &str,
        image: &GrayImage,
        thresholds: &[i32],
    ) -> Result<Vec<ImageKey>> {
        thresholds
            .iter()
            .map(|&threshold| self.add_image(name, image, threshold))
            .collect()
    }

    pub fn retrieve(&self, name: &str, threshold: i32) -> Result<Option<Bitmap>> {
        let Some(key) = self.tree.search(name, threshold)? else {
            return Ok(None);
        };

        let payload = self.blobs.read(key.data_offset, u64::from(key.data_size))?;
        codec::decompress(&payload, key.width, key.height).map(Some)
    }

    /// Drops the index entry. The payload bytes stay in the data file until
    /// the next [`compact`](Self::compact).
    pub fn remove(&mut self, name: &str, threshold: i32) -> Result<bool> {
        Ok(self.tree.delete(name, threshold)?.is_some())
    }

    /// Averages every stored version of `name` back into a grayscale image
    /// with a maximum of 255. Each version contributes 255 where its bitmap
    /// is set. Returns `None` when no version is stored.
    pub fn reconstruct(&self, name: &str) -> Result<Option<GrayImage>> {
        let versions = self.tree.range_by_name(name)?;
        let Some(first) = versions.first() else {
            return Ok(None);
        };
        let (width, height) = (first.width, first.height);

        let mut sums = vec![0u64; width as usize * height as usize];
        for key in &versions {
            if (key.width, key.height) != (width, height) {
                return Err(Error::DimensionMismatch {
                    name: key.name().to_string(),
                });
            }
            let payload = self.blobs.read(key.data_offset, u64::from(key.data_size))?;
            let bitmap = codec::decompress(&payload, width, height)?;
            for (sum, &bit) in sums.iter_mut().zip(bitmap.pixels()) {
                *sum += u64::from(bit) * 255;
            }
        }

        let count = versions.len() as u64;
        let pixels = sums.into_iter().map(|sum| (sum / count) as u32).collect();
        log::debug!("Reconstructed {name} from {count} versions");
        GrayImage::new(width, height, 255, pixels).map(Some)
    }

    /// Every entry in key order.
    pub fn list(&self) -> Result<Vec<ImageKey>> {
        self.tree.inorder()
    }

    pub fn dump_pages<W: Write>(&self, out: &mut W) -> Result<()> {
        self.tree.dump_pages(out)
    }

    pub fn stats(&self) -> Result<TreeStats> {
        self.tree.stats()
    }

    pub fn verify(&self) -> Result<()> {
        self.tree.verify()
    }

    /// Size of the data file in bytes.
    pub fn data_len(&self) -> u64 {
        self.blobs.len()
    }

    /// Rewrites the data file so it only holds payloads of live entries, in
    /// key order. Returns the number of bytes reclaimed.
    ///
    /// Payloads are copied to a scratch file first. The index is only
    /// touched once every payload has been copied, so a read failure leaves
    /// the database as it was. A failure after the index update leaves
    /// offsets pointing into the scratch file.
    pub fn compact(&mut self) -> Result<u64> {
        let before = self.blobs.len();
        let scratch = self.opts.compaction_path();

        let offsets = match self.copy_live_payloads(&scratch) {
            Ok(offsets) => offsets,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&scratch) {
                    log::warn!("Failed to remove compaction scratch file: {rm}");
                }
                return Err(e);
            }
        };

        let mut next = offsets.into_iter();
        let moved = self.tree.remap_data_offsets(|key| {
            next.next().ok_or_else(|| {
                Error::Corruption(format!("No compacted payload for {key}"))
            })
        })?;

        fs::rename(&scratch, self.opts.data_path())?;
        self.blobs = BlobLog::new(DiskStorage::new(self.opts.data_path())?, self.opts.durability)?;
        self.tree.flush()?;

        let after = self.blobs.len();
        log::info!("Compacted data file: {moved} entries, {before} -> {after} bytes");
        Ok(before.saturating_sub(after))
    }

    // Copy every live payload, in key order, into a fresh log at `scratch`
    // and return the new offsets in the same order.
    fn copy_live_payloads(&self, scratch: &Path) -> Result<Vec<u64>> {
        let mut fresh = BlobLog::new(DiskStorage::truncated(scratch)?, Durability::Manual)?;
        let offsets = self
            .tree
            .inorder()?
            .iter()
            .map(|key| {
                let payload = self.blobs.read(key.data_offset, u64::from(key.data_size))?;
                fresh.append(&payload)
            })
            .collect::<Result<Vec<_>>>()?;
        fresh.flush()?;
        Ok(offsets)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.tree.flush()?;
        self.blobs.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_db(dir: &TempDir) -> ImageDb {
        let opts = Options {
            dir: dir.path().to_path_buf(),
            durability: Durability::Manual,
            ..Options::new()
        };
        ImageDb::open(opts).unwrap()
    }

    fn gradient() -> GrayImage {
        GrayImage::new(4, 2, 255, vec![0, 40, 80, 120, 160, 200, 240, 255]).unwrap()
    }

    #[test]
    fn add_and_retrieve() {
        let dir = TempDir::new("imgdb").unwrap();
        let mut db = open_db(&dir);

        let key = db.add_image("grad", &gradient(), 100).unwrap();
        assert_eq!(key.name(), "grad");
        assert_eq!((key.width, key.height), (4, 2));

        let bitmap = db.retrieve("grad", 100).unwrap().unwrap();
        assert_eq!(bitmap.pixels(), &[0, 0, 0, 1, 1, 1, 1, 1]);
        assert!(db.retrieve("grad", 101).unwrap().is_none());
    }

    #[test]
    fn missing_directory_without_create() {
        let dir = TempDir::new("imgdb").unwrap();
        let opts = Options {
            dir: dir.path().join("missing"),
            create_if_not_exists: false,
            ..Options::new()
        };
        assert!(matches!(
            ImageDb::open(opts),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn remove_keeps_bytes_until_compaction() {
        let dir = TempDir::new("imgdb").unwrap();
        let mut db = open_db(&dir);

        db.add_with_thresholds("grad", &gradient(), &[50, 150])
            .unwrap();
        let len = db.data_len();

        assert!(db.remove("grad", 50).unwrap());
        assert!(!db.remove("grad", 50).unwrap());
        assert_eq!(db.data_len(), len);

        let reclaimed = db.compact().unwrap();
        assert!(reclaimed > 0);
        assert_eq!(db.data_len(), len - reclaimed);
        assert!(db.retrieve("grad", 150).unwrap().is_some());
    }

    #[test]
    fn reconstruct_averages_versions() {
        let dir = TempDir::new("imgdb").unwrap();
        let mut db = open_db(&dir);
        db.add_with_thresholds("grad", &gradient(), &[50, 150])
            .unwrap();
        db.add_image("grad2", &gradient(), 250).unwrap();
        db.add_image("gra", &gradient(), 0).unwrap();

        let image = db.reconstruct("grad").unwrap().unwrap();
        assert_eq!((image.width(), image.height(), image.max_gray()), (4, 2, 255));
        assert_eq!(image.pixels(), &[0, 0, 127, 127, 255, 255, 255, 255]);

        assert!(db.reconstruct("missing").unwrap().is_none());
    }

    #[test]
    fn reconstruct_rejects_mixed_dimensions() {
        let dir = TempDir::new("imgdb").unwrap();
        let mut db = open_db(&dir);
        db.add_image("grad", &gradient(), 50).unwrap();
        let tall = GrayImage::new(2, 4, 255, vec![0, 40, 80, 120, 160, 200, 240, 255]).unwrap();
        db.add_image("grad", &tall, 150).unwrap();

        assert!(matches!(
            db.reconstruct("grad"),
            Err(Error::DimensionMismatch { name }) if name == "grad"
        ));
    }

    #[test]
    fn unencodable_image_is_refused_before_writing() {
        let dir = TempDir::new("imgdb").unwrap();
        let mut db = open_db(&dir);
        db.add_image("grad", &gradient(), 50).unwrap();
        let len = db.data_len();

        let wide = GrayImage::new(u32::MAX, 0, 255, Vec::new()).unwrap();
        assert!(matches!(
            db.add_image("wide", &wide, 10),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(db.data_len(), len);
        assert_eq!(db.list().unwrap().len(), 1);
        db.verify().unwrap();
    }
}
