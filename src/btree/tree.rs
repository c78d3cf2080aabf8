use std::io::Write;
use std::path::Path;

use super::key::{truncate_name, ImageKey};
use super::node::{Node, PageOffset, MAX_KEYS, MIN_KEYS, ORDER};
use super::pager::Pager;
use super::storage::{DiskStorage, Storage};
use crate::error::{Error, Result};
use crate::option::Durability;

// These are type aliases for convenience
pub type DiskBTree = BTree<DiskStorage>;

/// Snapshot of the header plus the current height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub root_offset: PageOffset,
    pub free_offset: u64,
    pub node_count: u32,
    pub height: usize,
}

// Result of splitting an overfull node: the key moving up and the new page.
struct Split {
    separator: ImageKey,
    right: PageOffset,
}

// A key taken out of a subtree, and whether the subtree root fell below
// MIN_KEYS doing so.
struct Removed {
    key: ImageKey,
    underflow: bool,
}

/// Disk-paged B-tree of order 3 over [`ImageKey`]s.
///
/// Only the root page stays in memory between calls. Every other page is
/// read when an operation needs it and written back before the operation
/// drops it.
pub struct BTree<S: Storage> {
    pager: Pager<S>,
    root: Node,
}

impl<S: Storage> Drop for BTree<S> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Error during BTree drop: {e}");
        }
    }
}

impl BTree<DiskStorage> {
    pub fn disk<P: AsRef<Path>>(path: P, durability: Durability) -> Result<Self> {
        let storage = DiskStorage::new(path)?;
        Self::with_storage(storage, durability)
    }
}

impl<S: Storage> BTree<S> {
    /// Open the tree in `storage`, creating a single empty leaf root if the
    /// storage is empty.
    pub fn with_storage(storage: S, durability: Durability) -> Result<Self> {
        if storage.is_empty()? {
            let mut pager = Pager::create(storage, durability)?;
            let root_offset = pager.allocate_page(true)?;
            pager.set_root(root_offset);
            pager.write_header()?;
            pager.sync()?;

            let root = pager.read_page(root_offset)?;
            log::info!("Created empty B-tree with root at {root_offset}");
            Ok(BTree { pager, root })
        } else {
            let pager = Pager::open(storage, durability)?;
            let header = *pager.header();
            let root = pager.read_page(header.root_offset)?;
            log::info!(
                "Opened B-tree with root at {} and {} pages",
                header.root_offset,
                header.node_count
            );
            Ok(BTree { pager, root })
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.pager.sync()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_leaf && self.root.keys.is_empty()
    }

    /// The cached root page.
    pub fn root_node(&self) -> &Node {
        &self.root
    }

    /// Read any allocated page straight from storage.
    pub fn read_page(&self, offset: PageOffset) -> Result<Node> {
        self.pager.read_page(offset)
    }

    pub fn stats(&self) -> Result<TreeStats> {
        let header = *self.pager.header();

        let mut height = 1;
        let mut current = None;
        loop {
            let node: &Node = current.as_ref().unwrap_or(&self.root);
            if node.is_leaf {
                break;
            }
            let next = *node.children.first().ok_or_else(|| {
                Error::Corruption(format!("Internal node at {} has no children", node.offset))
            })?;
            current = Some(self.pager.read_page(next)?);
            height += 1;
        }

        Ok(TreeStats {
            root_offset: header.root_offset,
            free_offset: header.free_offset,
            node_count: header.node_count,
            height,
        })
    }

    pub fn search(&self, name: &str, threshold: i32) -> Result<Option<ImageKey>> {
        let name = truncate_name(name);

        let mut current: Option<Node> = None;
        loop {
            let node = current.as_ref().unwrap_or(&self.root);
            let idx = node.lower_bound(name, threshold);

            if let Some(key) = node.keys.get(idx) {
                if key.matches(name, threshold) {
                    return Ok(Some(key.clone()));
                }
            }
            if node.is_leaf {
                return Ok(None);
            }

            let next = node.children[idx];
            current = Some(self.pager.read_page(next)?);
        }
    }

    /// Insert `key`. Every page the insert may split into is allocated
    /// before any existing page is rewritten, so a failed allocation leaves
    /// the tree as it was. On any error the header and cached root are
    /// reloaded from storage.
    pub fn insert(&mut self, key: ImageKey) -> Result<()> {
        key.check_encodable()?;
        let result = self.insert_key(key);
        if result.is_err() {
            self.recover();
        }
        result
    }

    fn insert_key(&mut self, key: ImageKey) -> Result<()> {
        let mut reserved = self.reserve_split_pages(&key)?;
        let old_root = self.root.offset;

        if let Some(split) = self.insert_into(old_root, key, &mut reserved)? {
            // The root itself split: grow the tree by one level.
            let new_root_offset = take_reserved(&mut reserved)?;
            let mut new_root = Node::new(new_root_offset, false);
            new_root.keys.push(split.separator);
            new_root.children.push(old_root);
            new_root.children.push(split.right);

            self.pager.write_page(&new_root)?;
            self.pager.set_root(new_root_offset);
            self.root = new_root;
            log::debug!("Root split: {old_root} -> {new_root_offset}");
        }

        self.pager.write_header()
    }

    // Allocate one page per split the insert will cause, plus one for a new
    // root when every node on the path is full. Returned in the order the
    // splits consume them, leaf first.
    fn reserve_split_pages(&mut self, key: &ImageKey) -> Result<Vec<PageOffset>> {
        let mut full_run = 0;
        let mut depth = 0;
        let mut current: Option<Node> = None;
        loop {
            let node = current.as_ref().unwrap_or(&self.root);
            depth += 1;
            full_run = if node.is_full() { full_run + 1 } else { 0 };
            if node.is_leaf {
                break;
            }
            let next = node.children[node.upper_bound(key)];
            current = Some(self.pager.read_page(next)?);
        }

        let needed = if full_run == depth { full_run + 1 } else { full_run };
        let mut reserved = Vec::with_capacity(needed);
        for i in 0..needed {
            reserved.push(self.pager.allocate_page(i == 0)?);
        }
        reserved.reverse();
        Ok(reserved)
    }

    fn insert_into(
        &mut self,
        offset: PageOffset,
        key: ImageKey,
        reserved: &mut Vec<PageOffset>,
    ) -> Result<Option<Split>> {
        let mut node = self.load(offset)?;
        let idx = node.upper_bound(&key);

        if node.is_leaf {
            node.keys.insert(idx, key);
        } else {
            let Some(split) = self.insert_into(node.children[idx], key, reserved)? else {
                return Ok(None);
            };
            node.keys.insert(idx, split.separator);
            node.children.insert(idx + 1, split.right);
        }

        if node.is_overfull() {
            let right_offset = take_reserved(reserved)?;
            return self.split(node, right_offset).map(Some);
        }

        self.store(&node)?;
        Ok(None)
    }

    // Move the upper half of an overfull node to the reserved sibling page.
    // The middle key is handed back for the parent. The new sibling is
    // written before the existing page is shrunk.
    fn split(&mut self, mut node: Node, right_offset: PageOffset) -> Result<Split> {
        let mid = node.keys.len() / 2;
        let mut right = Node::new(right_offset, node.is_leaf);

        right.keys = node.keys.split_off(mid + 1);
        let separator = node.keys.pop().ok_or_else(|| {
            Error::Corruption(format!("Cannot split empty node at {}", node.offset))
        })?;
        if !node.is_leaf {
            right.children = node.children.split_off(mid + 1);
        }

        self.pager.write_page(&right)?;
        self.store(&node)?;
        Ok(Split {
            separator,
            right: right_offset,
        })
    }

    /// Every key whose name equals `name`, ordered by threshold. Only the
    /// subtrees whose bounds can hold that name are read.
    pub fn range_by_name(&self, name: &str) -> Result<Vec<ImageKey>> {
        let name = truncate_name(name);
        let mut out = Vec::new();
        self.collect_name(&self.root, name, &mut out)?;
        Ok(out)
    }

    fn collect_name(&self, node: &Node, name: &str, out: &mut Vec<ImageKey>) -> Result<()> {
        let n = node.keys.len();
        for i in 0..=n {
            if !node.is_leaf {
                let above_lower = i == 0 || node.keys[i - 1].name().as_bytes() <= name.as_bytes();
                let below_upper = i == n || node.keys[i].name().as_bytes() >= name.as_bytes();
                if above_lower && below_upper {
                    let child = self.pager.read_page(node.children[i])?;
                    self.collect_name(&child, name, out)?;
                }
            }
            if let Some(key) = node.keys.get(i) {
                if key.name() == name {
                    out.push(key.clone());
                }
            }
        }
        Ok(())
    }

    /// Remove the entry `(name, threshold)`, returning it, or `None` if it
    /// is not in the tree. A miss writes nothing.
    pub fn delete(&mut self, name: &str, threshold: i32) -> Result<Option<ImageKey>> {
        let result = self.delete_key(truncate_name(name), threshold);
        if result.is_err() {
            self.recover();
        }
        result
    }

    fn delete_key(&mut self, name: &str, threshold: i32) -> Result<Option<ImageKey>> {
        let root_offset = self.root.offset;

        let Some(removed) = self.delete_from(root_offset, name, threshold)? else {
            return Ok(None);
        };

        if self.root.keys.is_empty() && !self.root.is_leaf {
            let new_root = self.root.children[0];
            self.pager.set_root(new_root);
            self.pager.write_header()?;
            self.root = self.pager.read_page(new_root)?;
            log::debug!("Root collapsed: {root_offset} -> {new_root}");
        }

        Ok(Some(removed.key))
    }

    fn delete_from(
        &mut self,
        offset: PageOffset,
        name: &str,
        threshold: i32,
    ) -> Result<Option<Removed>> {
        let mut node = self.load(offset)?;
        let idx = node.lower_bound(name, threshold);
        let found = node
            .keys
            .get(idx)
            .is_some_and(|k| k.matches(name, threshold));

        if node.is_leaf {
            if !found {
                return Ok(None);
            }
            let key = node.keys.remove(idx);
            self.store(&node)?;
            return Ok(Some(Removed {
                key,
                underflow: node.is_underfull(),
            }));
        }

        let key = if found {
            self.replace_with_neighbour(&mut node, idx)?
        } else {
            let Some(removed) = self.delete_from(node.children[idx], name, threshold)? else {
                return Ok(None);
            };
            if !removed.underflow {
                return Ok(Some(Removed {
                    key: removed.key,
                    underflow: false,
                }));
            }
            self.fill_child(&mut node, idx)?;
            removed.key
        };

        self.store(&node)?;
        Ok(Some(Removed {
            key,
            underflow: node.is_underfull(),
        }))
    }

    // Swap the key at `idx` of an internal node for its in-order predecessor
    // or successor, taken out of the matching subtree, and return the
    // original key.
    fn replace_with_neighbour(&mut self, node: &mut Node, idx: usize) -> Result<ImageKey> {
        let left = self.pager.read_page(node.children[idx])?;
        let use_successor = !left.has_spare_key()
            && self
                .pager
                .read_page(node.children[idx + 1])?
                .has_spare_key();

        let (taken, child_idx) = if use_successor {
            (self.take_min(node.children[idx + 1])?, idx + 1)
        } else {
            // Also the fallback when neither side has a spare key: the
            // emptied leaf is repaired on the way back up.
            (self.take_max(node.children[idx])?, idx)
        };

        let original = std::mem::replace(&mut node.keys[idx], taken.key);
        if taken.underflow {
            self.fill_child(node, child_idx)?;
        }
        Ok(original)
    }

    // Remove the largest key of the subtree at `offset`.
    fn take_max(&mut self, offset: PageOffset) -> Result<Removed> {
        let mut node = self.load(offset)?;

        if node.is_leaf {
            let key = node
                .keys
                .pop()
                .ok_or_else(|| Error::Corruption(format!("Empty leaf at {offset}")))?;
            self.store(&node)?;
            return Ok(Removed {
                key,
                underflow: node.is_underfull(),
            });
        }

        let last = node.keys.len();
        let removed = self.take_max(node.children[last])?;
        if removed.underflow {
            self.fill_child(&mut node, last)?;
            self.store(&node)?;
        }
        Ok(Removed {
            key: removed.key,
            underflow: node.is_underfull(),
        })
    }

    // Remove the smallest key of the subtree at `offset`.
    fn take_min(&mut self, offset: PageOffset) -> Result<Removed> {
        let mut node = self.load(offset)?;

        if node.is_leaf {
            if node.keys.is_empty() {
                return Err(Error::Corruption(format!("Empty leaf at {offset}")));
            }
            let key = node.keys.remove(0);
            self.store(&node)?;
            return Ok(Removed {
                key,
                underflow: node.is_underfull(),
            });
        }

        let removed = self.take_min(node.children[0])?;
        if removed.underflow {
            self.fill_child(&mut node, 0)?;
            self.store(&node)?;
        }
        Ok(Removed {
            key: removed.key,
            underflow: node.is_underfull(),
        })
    }

    // Bring `parent.children[idx]` back to MIN_KEYS: borrow from the left
    // sibling, else the right one, else merge with a sibling. Touched
    // children are written here; the caller writes `parent`.
    fn fill_child(&mut self, parent: &mut Node, idx: usize) -> Result<()> {
        if parent.keys.is_empty() {
            return Err(Error::Corruption(format!(
                "Internal node at {} has no keys to rebalance with",
                parent.offset
            )));
        }

        if idx > 0 {
            let left = self.pager.read_page(parent.children[idx - 1])?;
            if left.has_spare_key() {
                return self.borrow_from_prev(parent, idx, left);
            }
        }

        if idx < parent.keys.len() {
            let right = self.pager.read_page(parent.children[idx + 1])?;
            if right.has_spare_key() {
                return self.borrow_from_next(parent, idx, right);
            }
        }

        if idx < parent.keys.len() {
            self.merge(parent, idx)
        } else {
            self.merge(parent, idx - 1)
        }
    }

    // Rotate right: the separator drops into the child, the left sibling's
    // last key replaces it.
    fn borrow_from_prev(&mut self, parent: &mut Node, idx: usize, mut left: Node) -> Result<()> {
        let mut child = self.pager.read_page(parent.children[idx])?;

        let from_left = left.keys.pop().ok_or_else(|| {
            Error::Corruption(format!("Left sibling at {} is empty", left.offset))
        })?;
        let separator = std::mem::replace(&mut parent.keys[idx - 1], from_left);
        child.keys.insert(0, separator);

        if !child.is_leaf {
            let moved = left.children.pop().ok_or_else(|| {
                Error::Corruption(format!("Left sibling at {} has no children", left.offset))
            })?;
            child.children.insert(0, moved);
        }

        self.store(&child)?;
        self.store(&left)?;
        log::debug!("Page {} borrowed from left sibling {}", child.offset, left.offset);
        Ok(())
    }

    // Rotate left: the separator drops into the child, the right sibling's
    // first key replaces it.
    fn borrow_from_next(&mut self, parent: &mut Node, idx: usize, mut right: Node) -> Result<()> {
        let mut child = self.pager.read_page(parent.children[idx])?;

        if right.keys.is_empty() || (!right.is_leaf && right.children.is_empty()) {
            return Err(Error::Corruption(format!(
                "Right sibling at {} is empty",
                right.offset
            )));
        }
        let from_right = right.keys.remove(0);
        let separator = std::mem::replace(&mut parent.keys[idx], from_right);
        child.keys.push(separator);

        if !child.is_leaf {
            child.children.push(right.children.remove(0));
        }

        self.store(&child)?;
        self.store(&right)?;
        log::debug!("Page {} borrowed from right sibling {}", child.offset, right.offset);
        Ok(())
    }

    // Fold `children[idx + 1]` and the separator at `idx` into
    // `children[idx]`. The right page becomes unreachable and is never
    // reused.
    fn merge(&mut self, parent: &mut Node, idx: usize) -> Result<()> {
        let mut left = self.pager.read_page(parent.children[idx])?;
        let right = self.pager.read_page(parent.children[idx + 1])?;

        if left.is_leaf != right.is_leaf || left.keys.len() + 1 + right.keys.len() > MAX_KEYS {
            return Err(Error::Corruption(format!(
                "Cannot merge pages {} and {}",
                left.offset, right.offset
            )));
        }

        let separator = parent.keys.remove(idx);
        parent.children.remove(idx + 1);

        left.keys.push(separator);
        left.keys.extend(right.keys);
        left.children.extend(right.children);

        self.store(&left)?;
        log::debug!("Merged page {} into {}", right.offset, left.offset);
        Ok(())
    }

    /// Every key in ascending order.
    pub fn inorder(&self) -> Result<Vec<ImageKey>> {
        let mut out = Vec::new();
        self.collect_inorder(&self.root, &mut out)?;
        Ok(out)
    }

    fn collect_inorder(&self, node: &Node, out: &mut Vec<ImageKey>) -> Result<()> {
        for (i, key) in node.keys.iter().enumerate() {
            if !node.is_leaf {
                let child = self.pager.read_page(node.children[i])?;
                self.collect_inorder(&child, out)?;
            }
            out.push(key.clone());
        }
        if !node.is_leaf {
            let child = self.pager.read_page(node.children[node.keys.len()])?;
            self.collect_inorder(&child, out)?;
        }
        Ok(())
    }

    /// Replace the `data_offset` of every key with the value returned by `f`,
    /// visiting keys in ascending order. Returns the number of keys visited.
    pub fn remap_data_offsets<F>(&mut self, mut f: F) -> Result<usize>
    where
        F: FnMut(&ImageKey) -> Result<u64>,
    {
        let mut visited = 0;
        let root = self.root.offset;
        let result = self
            .remap_node(root, &mut f, &mut visited)
            .and_then(|()| self.pager.write_header());
        if let Err(e) = result {
            self.recover();
            return Err(e);
        }
        Ok(visited)
    }

    fn remap_node<F>(&mut self, offset: PageOffset, f: &mut F, visited: &mut usize) -> Result<()>
    where
        F: FnMut(&ImageKey) -> Result<u64>,
    {
        let mut node = self.load(offset)?;
        for i in 0..node.keys.len() {
            if !node.is_leaf {
                self.remap_node(node.children[i], f, visited)?;
            }
            node.keys[i].data_offset = f(&node.keys[i])?;
            node.keys[i].check_encodable()?;
            *visited += 1;
        }
        if !node.is_leaf {
            self.remap_node(node.children[node.keys.len()], f, visited)?;
        }
        self.store(&node)
    }

    /// Every allocated page in file order, including pages left behind by
    /// merges.
    pub fn scan_pages(&self) -> Result<Vec<Node>> {
        self.pager
            .page_offsets()
            .map(|offset| self.pager.read_page(offset))
            .collect()
    }

    /// Write a page-by-page listing of the page file.
    pub fn dump_pages<W: Write>(&self, out: &mut W) -> Result<()> {
        let header = self.pager.header();
        writeln!(
            out,
            "order: {ORDER} | pages: {} | root offset: {}",
            header.node_count, header.root_offset
        )?;
        for (i, offset) in self.pager.page_offsets().enumerate() {
            let node = self.pager.read_page(offset)?;
            writeln!(out, "page {} (offset {offset}): {node}", i + 1)?;
        }
        Ok(())
    }

    /// Check ordering, fill, child-count and equal-depth invariants over
    /// the reachable tree.
    pub fn verify(&self) -> Result<()> {
        let mut leaf_depth = None;
        self.verify_node(&self.root, 0, None, None, &mut leaf_depth)
    }

    fn verify_node(
        &self,
        node: &Node,
        depth: usize,
        lower: Option<&ImageKey>,
        upper: Option<&ImageKey>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let corrupt = |msg: String| -> Result<()> {
            Err(Error::Corruption(format!("page {}: {msg}", node.offset)))
        };
        let is_root = node.offset == self.root.offset;
        let n = node.keys.len();

        if n > MAX_KEYS {
            return corrupt(format!("{n} keys exceeds {MAX_KEYS}"));
        }
        if !is_root && n < MIN_KEYS {
            return corrupt(format!("{n} keys is below {MIN_KEYS}"));
        }
        if !node.is_leaf && n == 0 {
            return corrupt("internal node without keys".into());
        }
        for pair in node.keys.windows(2) {
            if pair[0].cmp_order(&pair[1]).is_gt() {
                return corrupt(format!("{} stored before {}", pair[0], pair[1]));
            }
        }
        for key in &node.keys {
            if lower.is_some_and(|l| key.cmp_order(l).is_lt())
                || upper.is_some_and(|u| key.cmp_order(u).is_gt())
            {
                return corrupt(format!("{key} is outside its parent's range"));
            }
        }

        if node.is_leaf {
            if !node.children.is_empty() {
                return corrupt("leaf with children".into());
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return corrupt(format!("leaf at depth {depth}, expected {expected}"));
                }
                Some(_) => {}
            }
            return Ok(());
        }

        if node.children.len() != n + 1 {
            return corrupt(format!("{} children for {n} keys", node.children.len()));
        }
        for (i, &child_offset) in node.children.iter().enumerate() {
            let child = self.pager.read_page(child_offset)?;
            let child_lower = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
            let child_upper = if i == n { upper } else { Some(&node.keys[i]) };
            self.verify_node(&child, depth + 1, child_lower, child_upper, leaf_depth)?;
        }
        Ok(())
    }

    // Bring the header and cached root back in line with storage after a
    // failed mutation.
    fn recover(&mut self) {
        if let Err(e) = self.pager.reload_header() {
            log::error!("Failed to reload header after error: {e}");
            return;
        }
        match self.pager.read_page(self.pager.header().root_offset) {
            Ok(root) => self.root = root,
            Err(e) => log::error!("Failed to reload root after error: {e}"),
        }
    }

    // Page access that goes through the cached root slot.
    fn load(&self, offset: PageOffset) -> Result<Node> {
        if offset == self.root.offset {
            return Ok(self.root.clone());
        }
        self.pager.read_page(offset)
    }

    fn store(&mut self, node: &Node) -> Result<()> {
        self.pager.write_page(node)?;
        if node.offset == self.root.offset {
            self.root = node.clone();
        }
        Ok(())
    }
}

fn take_reserved(reserved: &mut Vec<PageOffset>) -> Result<PageOffset> {
    reserved
        .pop()
        .ok_or_else(|| Error::Corruption("Split needs more pages than were reserved".into()))
}
