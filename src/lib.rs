pub mod blob;
pub mod btree;
pub mod codec;
pub mod db;
pub mod error;
pub mod option;

#[cfg(test)]
mod test;

pub use btree::{BTree, ImageKey, PageOffset, TreeStats};
pub use codec::{Bitmap, GrayImage};
pub use db::ImageDb;
pub use error::{Error, Result};
pub use option::{Durability, Options};
