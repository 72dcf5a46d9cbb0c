//! In-memory B+tree node
//!
//! A node is the mutable, decoded form of one branch or leaf page. Its
//! entries (inodes) are kept sorted by key with no duplicates.

use bytes::Bytes;

use super::{BucketId, NodeId};
use crate::error::{BoltError, Result};
use crate::page::{
    write_u32, write_u64, Page, Pgid, BRANCH_ELEMENT_SIZE, BRANCH_PAGE_FLAG, LEAF_ELEMENT_SIZE,
    LEAF_PAGE_FLAG, MIN_KEYS_PER_PAGE, PAGE_HEADER_SIZE,
};
use crate::Item;

/// One decoded page element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Inode {
    /// Leaf flags (bucket bit), unused for branches
    pub flags: u32,
    /// Child page for branch entries
    pub pgid: Pgid,
    pub key: Item,
    /// Value for leaf entries, empty for branches
    pub value: Item,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub bucket: BucketId,
    pub is_leaf: bool,
    /// Lost an entry since it was read; checked by rebalance
    pub unbalanced: bool,
    pub spilled: bool,
    /// First key at read time, the key the parent indexes this node under.
    /// Empty for nodes that were never persisted.
    pub key: Item,
    /// Assigned page, 0 if none
    pub pgid: Pgid,
    pub parent: Option<NodeId>,
    /// Materialized children
    pub children: Vec<NodeId>,
    pub inodes: Vec<Inode>,
}

impl Node {
    pub fn new(bucket: BucketId, is_leaf: bool) -> Self {
        Self {
            bucket,
            is_leaf,
            unbalanced: false,
            spilled: false,
            key: Bytes::new(),
            pgid: 0,
            parent: None,
            children: Vec::new(),
            inodes: Vec::new(),
        }
    }

    /// Decode a branch or leaf page
    pub fn read(bucket: BucketId, page: &Page<'_>) -> Result<Self> {
        if !page.is_leaf() && !page.is_branch() {
            return Err(BoltError::Corrupted(format!(
                "page {}: expected branch or leaf, found {}",
                page.id(),
                page.type_name()
            )));
        }

        let mut node = Node::new(bucket, page.is_leaf());
        node.pgid = page.id();
        node.inodes.reserve(page.count());
        for i in 0..page.count() {
            let inode = if node.is_leaf {
                let elem = page.leaf_element(i)?;
                Inode {
                    flags: elem.flags,
                    pgid: 0,
                    key: Bytes::copy_from_slice(elem.key),
                    value: Bytes::copy_from_slice(elem.value),
                }
            } else {
                let elem = page.branch_element(i)?;
                Inode {
                    flags: 0,
                    pgid: elem.pgid,
                    key: Bytes::copy_from_slice(elem.key),
                    value: Bytes::new(),
                }
            };
            node.inodes.push(inode);
        }

        if let Some(first) = node.inodes.first() {
            node.key = first.key.clone();
        }
        Ok(node)
    }

    /// Serialize into a page buffer whose id and overflow are already set
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if self.inodes.len() >= 0xFFFF {
            return Err(BoltError::Corrupted(format!(
                "node holds {} entries, a page holds at most 65534",
                self.inodes.len()
            )));
        }
        let size = self.size();
        if buf.len() < size {
            return Err(BoltError::Corrupted(format!(
                "node needs {} bytes, page buffer has {}",
                size,
                buf.len()
            )));
        }

        let flags = if self.is_leaf { LEAF_PAGE_FLAG } else { BRANCH_PAGE_FLAG };
        buf[8..10].copy_from_slice(&flags.to_le_bytes());
        buf[10..12].copy_from_slice(&(self.inodes.len() as u16).to_le_bytes());

        let elsize = self.page_element_size();
        let mut data = PAGE_HEADER_SIZE + elsize * self.inodes.len();
        for (i, inode) in self.inodes.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * elsize;
            let pos = (data - off) as u32;
            if self.is_leaf {
                write_u32(buf, off, inode.flags);
                write_u32(buf, off + 4, pos);
                write_u32(buf, off + 8, inode.key.len() as u32);
                write_u32(buf, off + 12, inode.value.len() as u32);
            } else {
                write_u32(buf, off, pos);
                write_u32(buf, off + 4, inode.key.len() as u32);
                write_u64(buf, off + 8, inode.pgid);
            }

            buf[data..data + inode.key.len()].copy_from_slice(&inode.key);
            data += inode.key.len();
            buf[data..data + inode.value.len()].copy_from_slice(&inode.value);
            data += inode.value.len();
        }
        Ok(())
    }

    /// First key currently held, empty if none
    pub fn first_key(&self) -> &[u8] {
        self.inodes.first().map(|i| i.key.as_ref()).unwrap_or(&[])
    }

    pub fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    pub fn page_element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let elsize = self.page_element_size();
        PAGE_HEADER_SIZE
            + self
                .inodes
                .iter()
                .map(|i| elsize + i.key.len() + i.value.len())
                .sum::<usize>()
    }

    /// Binary search by key: (index, true) on a hit, else the insertion point
    pub fn search(&self, key: &[u8]) -> (usize, bool) {
        match self.inodes.binary_search_by(|inode| inode.key.as_ref().cmp(key)) {
            Ok(index) => (index, true),
            Err(index) => (index, false),
        }
    }

    /// Index of the branch entry that indexes a child under `key`
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.inodes.partition_point(|inode| inode.key.as_ref() < key)
    }

    /// Insert or overwrite the entry keyed by `old_key`. A child `pgid` must
    /// lie below the transaction's high water mark.
    pub fn put(
        &mut self,
        old_key: &[u8],
        new_key: Item,
        value: Item,
        pgid: Pgid,
        flags: u32,
        high_water: Pgid,
    ) -> Result<()> {
        if pgid >= high_water {
            return Err(BoltError::PageOutOfBounds { pgid });
        }
        if old_key.is_empty() || new_key.is_empty() {
            return Err(BoltError::KeyRequired);
        }

        let inode = Inode {
            flags,
            pgid,
            key: new_key,
            value,
        };
        match self.search(old_key) {
            (index, true) => self.inodes[index] = inode,
            (index, false) => self.inodes.insert(index, inode),
        }
        Ok(())
    }

    /// Remove the entry for `key`, if any
    pub fn del(&mut self, key: &[u8]) {
        if let (index, true) = self.search(key) {
            self.inodes.remove(index);
            self.unbalanced = true;
        }
    }

    /// Split point for a node being cut down to `threshold` bytes. Each side
    /// keeps at least `MIN_KEYS_PER_PAGE` entries.
    pub fn split_index(&self, threshold: usize) -> (usize, usize) {
        split_index(&self.inodes, self.page_element_size(), threshold)
    }

    /// Whether this node must be cut to fit a page
    pub fn needs_split(&self, page_size: usize) -> bool {
        needs_split(&self.inodes, self.page_element_size(), page_size)
    }
}

/// Split point within `inodes`: the first index past `MIN_KEYS_PER_PAGE`
/// where the head would outgrow `threshold`, leaving at least
/// `MIN_KEYS_PER_PAGE` entries behind. Returns the index and the head size.
pub(crate) fn split_index(inodes: &[Inode], elsize: usize, threshold: usize) -> (usize, usize) {
    let mut size = PAGE_HEADER_SIZE;
    let mut index = 0;
    let limit = inodes.len().saturating_sub(MIN_KEYS_PER_PAGE);
    for (i, inode) in inodes.iter().enumerate().take(limit) {
        index = i;
        let elem = elsize + inode.key.len() + inode.value.len();
        if i >= MIN_KEYS_PER_PAGE && size + elem > threshold {
            break;
        }
        size += elem;
    }
    (index, size)
}

/// Whether `inodes` hold more than two pages' worth of minimum keys and do
/// not fit in `page_size`. Stops reading once the page is full.
pub(crate) fn needs_split(inodes: &[Inode], elsize: usize, page_size: usize) -> bool {
    if inodes.len() <= MIN_KEYS_PER_PAGE * 2 {
        return false;
    }
    let mut size = PAGE_HEADER_SIZE;
    for inode in inodes {
        size += elsize + inode.key.len() + inode.value.len();
        if size >= page_size {
            return true;
        }
    }
    false
}
