use std::path::PathBuf;

/// When page and blob writes reach stable storage.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Durability {
    /// Sync after every write (safe but slow)
    Always,

    /// Only sync when flush() is called or the store is dropped
    Manual,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Options {
    // Required options.
    pub dir: PathBuf, // Directory holding the index and data files.

    // Usually modified options.
    pub durability: Durability,

    // Fine tuning options.
    pub index_file: String,         // File name of the B-tree page file.
    pub data_file: String,          // File name of the append-only payload file.
    pub create_if_not_exists: bool, // Create the directory if the provided open path doesn't exist.
}

impl Default for Options {
    /// Creates a new set of options with default values.
    fn default() -> Self {
        Self {
            dir: PathBuf::from(""),
            durability: Durability::Always,
            index_file: "btree.dat".to_string(),
            data_file: "image_data.dat".to_string(),
            create_if_not_exists: true,
        }
    }
}

impl Options {
    /// Creates a new set of options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(&self.index_file)
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(&self.data_file)
    }

    /// Scratch file used while compacting the data file.
    pub fn compaction_path(&self) -> PathBuf {
        self.dir.join(format!("{}.compact", self.data_file))
    }
}
