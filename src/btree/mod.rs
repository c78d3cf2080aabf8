pub mod header;
pub mod key;
pub mod node;
pub mod pager;
pub mod storage;
pub mod tree;

pub use key::{ImageKey, MAX_NAME_LEN};
pub use node::{Node, PageOffset, MAX_KEYS, MIN_KEYS, ORDER, PAGE_SIZE};
pub use storage::{DiskStorage, MemoryStorage, Storage};
pub use tree::{BTree, DiskBTree, TreeStats};
