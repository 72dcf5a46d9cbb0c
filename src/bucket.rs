//! Bucket Module
//!
//! A bucket is a named B+tree. Buckets nest: a bucket's leaf may hold a
//! child bucket, flagged with `BUCKET_LEAF_FLAG`, whose value is the child's
//! header. Small children are stored inline, header followed by a whole
//! leaf page, directly inside the parent's value.
//!
//! ## Value Layout of a Nested Bucket
//! ```text
//!   page-backed: ┌ root pgid (8) ┬ sequence (8) ┐
//!   inline:      ┌ 0 (8) ┬ sequence (8) ┬ leaf page (header + elements) ┐
//! ```
//!
//! ## Responsibilities
//! - Open, create and delete nested buckets
//! - Get, put and delete keys through a cursor
//! - Decide inline vs. page-backed encoding at commit
//! - Free every page of a deleted bucket

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::error::{BoltError, Result};
use crate::page::{
    BucketHeader, Page, Pgid, BUCKET_HEADER_SIZE, BUCKET_LEAF_FLAG, LEAF_ELEMENT_SIZE, PAGE_HEADER_SIZE,
};
use crate::tree::{BucketId, Cursor, Node, NodeId, RawCursor, Source};
use crate::tx::Tx;
use crate::Item;

pub use crate::tree::DEFAULT_FILL_PERCENT;

/// Maximum key length in bytes
pub const MAX_KEY_SIZE: usize = 32768;

/// Maximum value length in bytes
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Runtime state of an opened bucket
#[derive(Debug)]
pub(crate) struct BucketState {
    pub header: BucketHeader,
    /// Embedded leaf page of an inline bucket
    pub page: Option<Bytes>,
    pub root_node: Option<NodeId>,
    /// Materialized nodes by page id
    pub nodes: HashMap<Pgid, NodeId>,
    /// Opened children by name
    pub buckets: BTreeMap<Item, BucketId>,
    pub fill_percent: f64,
}

impl BucketState {
    pub fn new(header: BucketHeader) -> Self {
        Self {
            header,
            page: None,
            root_node: None,
            nodes: HashMap::new(),
            buckets: BTreeMap::new(),
            fill_percent: DEFAULT_FILL_PERCENT,
        }
    }

    /// Decode a nested bucket value
    fn open(value: &Item) -> Result<Self> {
        let mut state = Self::new(BucketHeader::decode(value)?);
        if state.header.root == 0 {
            state.page = Some(value.slice(BUCKET_HEADER_SIZE..));
        }
        Ok(state)
    }
}

// =============================================================================
// Bucket operations on the transaction arena
// =============================================================================

impl Tx {
    /// Materialize the node for `pgid`, caching it in the bucket
    pub(crate) fn node(&mut self, bucket: BucketId, pgid: Pgid, parent: Option<NodeId>) -> Result<NodeId> {
        if let Some(node) = self.arena[bucket].nodes.get(&pgid) {
            return Ok(*node);
        }

        let node = match &self.arena[bucket].page {
            Some(inline) => Node::read(bucket, &Page::new(inline)?)?,
            None => self.with_page(pgid, |page| Node::read(bucket, &page))?,
        };
        let id = self.arena.alloc_node(node);
        self.arena[id].parent = parent;
        match parent {
            Some(parent) => self.arena[parent].children.push(id),
            None => self.arena[bucket].root_node = Some(id),
        }
        self.arena[bucket].nodes.insert(pgid, id);
        self.stats.node_count += 1;
        Ok(id)
    }

    /// Materialize the child of branch node `id` at `index`
    pub(crate) fn child_at(&mut self, id: NodeId, index: usize) -> Result<NodeId> {
        let node = &self.arena[id];
        if node.is_leaf {
            return Err(BoltError::Corrupted(format!("child_at({}) on a leaf", index)));
        }
        let pgid = node
            .inodes
            .get(index)
            .map(|inode| inode.pgid)
            .ok_or_else(|| BoltError::Corrupted(format!("child index {} out of range", index)))?;
        let bucket = node.bucket;
        self.node(bucket, pgid, Some(id))
    }

    /// Open the nested bucket `name`, from cache if already opened
    pub(crate) fn open_bucket(&mut self, bucket: BucketId, name: &[u8]) -> Result<Option<BucketId>> {
        if let Some(child) = self.arena[bucket].buckets.get(name) {
            return Ok(Some(*child));
        }

        let mut cursor = RawCursor::new(bucket);
        let value = match cursor.seek_raw(self, name)? {
            Some((key, value, flags)) if key.as_ref() == name && flags & BUCKET_LEAF_FLAG != 0 => value,
            _ => return Ok(None),
        };

        let child = self.arena.alloc_bucket(BucketState::open(&value)?);
        self.arena[bucket]
            .buckets
            .insert(Bytes::copy_from_slice(name), child);
        Ok(Some(child))
    }

    /// Create `name` under `bucket`, or return it if it already exists
    pub(crate) fn create_bucket_in(&mut self, bucket: BucketId, name: &[u8]) -> Result<BucketId> {
        self.require_writable()?;
        if name.is_empty() {
            return Err(BoltError::BucketNameRequired);
        }

        let mut cursor = RawCursor::new(bucket);
        if let Some((key, _, flags)) = cursor.seek_raw(self, name)? {
            if key.as_ref() == name {
                if flags & BUCKET_LEAF_FLAG == 0 {
                    return Err(BoltError::IncompatibleValue);
                }
                return self.open_bucket(bucket, name)?.ok_or(BoltError::BucketNotFound);
            }
        }

        // A fresh bucket is an inline bucket with an empty leaf root.
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE];
        Node::new(bucket, true).write(&mut value[BUCKET_HEADER_SIZE..])?;
        value[..BUCKET_HEADER_SIZE].copy_from_slice(&BucketHeader::default().encode()?);

        let key = Bytes::copy_from_slice(name);
        let leaf = cursor.node(self)?;
        self.arena[leaf].put(name, key, Bytes::from(value), 0, BUCKET_LEAF_FLAG, self.meta.pgid)?;

        // Buckets holding buckets are never inlined.
        self.arena[bucket].page = None;

        self.open_bucket(bucket, name)?.ok_or(BoltError::BucketNotFound)
    }

    /// Delete nested bucket `name` and everything below it
    pub(crate) fn delete_bucket_in(&mut self, bucket: BucketId, name: &[u8]) -> Result<()> {
        self.require_writable()?;

        let mut cursor = RawCursor::new(bucket);
        match cursor.seek_raw(self, name)? {
            Some((key, _, flags)) if key.as_ref() == name => {
                if flags & BUCKET_LEAF_FLAG == 0 {
                    return Err(BoltError::IncompatibleValue);
                }
            }
            _ => return Err(BoltError::BucketNotFound),
        }

        let child = self.open_bucket(bucket, name)?.ok_or(BoltError::BucketNotFound)?;
        let nested = self.nested_bucket_names(child)?;
        for sub in nested {
            self.delete_bucket_in(child, &sub)?;
        }

        self.arena[bucket].buckets.remove(name);
        let state = &mut self.arena[child];
        state.nodes.clear();
        state.root_node = None;
        self.free_bucket(child)?;

        let leaf = cursor.node(self)?;
        self.arena[leaf].del(name);
        Ok(())
    }

    /// Names of the nested buckets directly under `bucket`
    fn nested_bucket_names(&mut self, bucket: BucketId) -> Result<Vec<Item>> {
        let mut names = Vec::new();
        let mut cursor = RawCursor::new(bucket);
        let mut entry = cursor.first(self)?;
        while let Some((key, _, flags)) = entry {
            if flags & BUCKET_LEAF_FLAG != 0 {
                names.push(key);
            }
            entry = cursor.next(self)?;
        }
        Ok(names)
    }

    pub(crate) fn bucket_get(&self, bucket: BucketId, key: &[u8]) -> Result<Option<Item>> {
        let mut cursor = RawCursor::new(bucket);
        match cursor.seek_raw(self, key)? {
            Some((k, value, flags)) if k.as_ref() == key && flags & BUCKET_LEAF_FLAG == 0 => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub(crate) fn bucket_put(&mut self, bucket: BucketId, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_writable()?;
        if key.is_empty() {
            return Err(BoltError::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(BoltError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(BoltError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        let mut cursor = RawCursor::new(bucket);
        if let Some((k, _, flags)) = cursor.seek_raw(self, key)? {
            if k.as_ref() == key && flags & BUCKET_LEAF_FLAG != 0 {
                return Err(BoltError::IncompatibleValue);
            }
        }

        let leaf = cursor.node(self)?;
        self.arena[leaf].put(
            key,
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            0,
            0,
            self.meta.pgid,
        )
    }

    pub(crate) fn bucket_delete(&mut self, bucket: BucketId, key: &[u8]) -> Result<()> {
        self.require_writable()?;

        let mut cursor = RawCursor::new(bucket);
        match cursor.seek_raw(self, key)? {
            Some((k, _, flags)) if k.as_ref() == key => {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(BoltError::IncompatibleValue);
                }
            }
            _ => return Ok(()),
        }

        let leaf = cursor.node(self)?;
        self.arena[leaf].del(key);
        Ok(())
    }

    pub(crate) fn next_sequence(&mut self, bucket: BucketId) -> Result<u64> {
        self.require_writable()?;

        // Materialize the root so the bucket is rewritten at commit.
        if self.arena[bucket].root_node.is_none() {
            let root = self.arena[bucket].header.root;
            self.node(bucket, root, None)?;
        }
        let header = &mut self.arena[bucket].header;
        header.sequence += 1;
        Ok(header.sequence)
    }

    /// Whether a child is small enough to live inside its parent's leaf
    fn inlineable(&self, bucket: BucketId) -> bool {
        let Some(root) = self.arena[bucket].root_node else {
            return false;
        };
        let node = &self.arena[root];
        if !node.is_leaf {
            return false;
        }

        let max = self.db.page_size / 4;
        let mut size = PAGE_HEADER_SIZE;
        for inode in &node.inodes {
            size += LEAF_ELEMENT_SIZE + inode.key.len() + inode.value.len();
            if inode.flags & BUCKET_LEAF_FLAG != 0 || size > max {
                return false;
            }
        }
        true
    }

    /// Encode an inline bucket: header then its root leaf as a page
    fn write_inline(&self, bucket: BucketId) -> Result<Bytes> {
        let state = &self.arena[bucket];
        let root = state
            .root_node
            .ok_or_else(|| BoltError::Corrupted("inline bucket without a root".to_string()))?;
        let node = &self.arena[root];

        let mut value = vec![0u8; BUCKET_HEADER_SIZE + node.size()];
        value[..BUCKET_HEADER_SIZE].copy_from_slice(&state.header.encode()?);
        node.write(&mut value[BUCKET_HEADER_SIZE..])?;
        Ok(Bytes::from(value))
    }

    /// Persist every dirty child, then this bucket's own nodes
    pub(crate) fn spill_bucket(&mut self, bucket: BucketId) -> Result<()> {
        let children: Vec<(Item, BucketId)> = self.arena[bucket]
            .buckets
            .iter()
            .map(|(name, child)| (name.clone(), *child))
            .collect();

        for (name, child) in children {
            let value = if self.inlineable(child) {
                self.free_bucket(child)?;
                self.write_inline(child)?
            } else {
                self.spill_bucket(child)?;
                Bytes::from(self.arena[child].header.encode()?)
            };

            // Untouched children keep their current value.
            if self.arena[child].root_node.is_none() {
                continue;
            }

            let mut cursor = RawCursor::new(bucket);
            match cursor.seek_raw(self, &name)? {
                Some((key, _, flags)) if key == name && flags & BUCKET_LEAF_FLAG != 0 => {}
                _ => {
                    return Err(BoltError::Corrupted(format!(
                        "bucket {:?} vanished from its parent",
                        String::from_utf8_lossy(&name)
                    )))
                }
            }
            let leaf = cursor.node(self)?;
            self.arena[leaf].put(&name, name.clone(), value, 0, BUCKET_LEAF_FLAG, self.meta.pgid)?;
        }

        let Some(root) = self.arena[bucket].root_node else {
            return Ok(());
        };
        self.spill_node(root)?;

        let root = self.arena.root_of(root);
        self.arena[bucket].root_node = Some(root);
        let pgid = self.arena[root].pgid;
        if pgid >= self.meta.pgid {
            return Err(BoltError::Corrupted(format!(
                "bucket root {} at or above high water mark {}",
                pgid, self.meta.pgid
            )));
        }
        self.arena[bucket].header.root = pgid;
        Ok(())
    }

    /// Free every page of `bucket`. Inline buckets own no pages.
    pub(crate) fn free_bucket(&mut self, bucket: BucketId) -> Result<()> {
        let root = self.arena[bucket].header.root;
        if root == 0 {
            return Ok(());
        }
        self.free_subtree(bucket, root)?;
        self.arena[bucket].header.root = 0;
        Ok(())
    }

    fn free_subtree(&mut self, bucket: BucketId, pgid: Pgid) -> Result<()> {
        let children: Vec<Pgid> = match self.page_node(bucket, pgid)? {
            Source::Node(id) => {
                let node = &self.arena[id];
                let children = if node.is_leaf {
                    Vec::new()
                } else {
                    node.inodes.iter().map(|inode| inode.pgid).collect()
                };
                self.free_node(id)?;
                children
            }
            Source::Page(pgid) => {
                let (overflow, children) = self.with_page(pgid, |page| {
                    let mut children = Vec::new();
                    if page.is_branch() {
                        for i in 0..page.count() {
                            children.push(page.branch_element(i)?.pgid);
                        }
                    }
                    Ok((page.overflow(), children))
                })?;
                self.free_pages(pgid, overflow)?;
                children
            }
            Source::Inline => Vec::new(),
        };

        for child in children {
            self.free_subtree(bucket, child)?;
        }
        Ok(())
    }
}

// =============================================================================
// Public handle
// =============================================================================

/// Handle to a bucket inside a transaction
pub struct Bucket<'tx> {
    tx: &'tx mut Tx,
    id: BucketId,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn new(tx: &'tx mut Tx, id: BucketId) -> Self {
        Self { tx, id }
    }

    /// Value for `key`. Nested buckets and missing keys both yield `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Item>> {
        self.tx.bucket_get(self.id, key)
    }

    /// Insert or overwrite `key`
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.bucket_put(self.id, key, value)
    }

    /// Remove `key`. Missing keys are not an error.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tx.bucket_delete(self.id, key)
    }

    /// Open a nested bucket
    pub fn bucket(&mut self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        let child = self.tx.open_bucket(self.id, name)?;
        Ok(child.map(|id| Bucket::new(&mut *self.tx, id)))
    }

    /// Open a nested bucket, consuming this handle
    pub fn into_bucket(self, name: &[u8]) -> Result<Option<Bucket<'tx>>> {
        let Bucket { tx, id } = self;
        let child = tx.open_bucket(id, name)?;
        Ok(child.map(|child| Bucket::new(tx, child)))
    }

    /// Create a nested bucket, or open it if it already exists
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>> {
        let child = self.tx.create_bucket_in(self.id, name)?;
        Ok(Bucket::new(&mut *self.tx, child))
    }

    /// Create a nested bucket, consuming this handle
    pub fn into_created_bucket(self, name: &[u8]) -> Result<Bucket<'tx>> {
        let Bucket { tx, id } = self;
        let child = tx.create_bucket_in(id, name)?;
        Ok(Bucket::new(tx, child))
    }

    /// Delete a nested bucket and all of its contents
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.tx.delete_bucket_in(self.id, name)
    }

    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(&mut *self.tx, self.id)
    }

    /// Visit every entry in key order. Nested buckets get a `None` value.
    pub fn for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        let mut cursor = self.cursor();
        let mut entry = cursor.first()?;
        while let Some((key, value)) = entry {
            f(&key, value.as_deref())?;
            entry = cursor.next()?;
        }
        Ok(())
    }

    /// Increment and return the bucket's sequence
    pub fn next_sequence(&mut self) -> Result<u64> {
        self.tx.next_sequence(self.id)
    }

    pub fn sequence(&self) -> u64 {
        self.tx.arena[self.id].header.sequence
    }

    /// Root page id, 0 for an inline bucket
    pub fn root(&self) -> Pgid {
        self.tx.arena[self.id].header.root
    }

    pub fn fill_percent(&self) -> f64 {
        self.tx.arena[self.id].fill_percent
    }

    /// Target fill of split pages, clamped to [0.1, 1.0] when applied.
    /// Sequential loads pack tighter with a higher value.
    pub fn set_fill_percent(&mut self, fill_percent: f64) {
        self.tx.arena[self.id].fill_percent = fill_percent;
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }
}
