//! Cursor
//!
//! Positional traversal over one bucket's tree. The cursor keeps a stack of
//! frames from the root to the current leaf; each frame points either at a
//! materialized node or at a persisted page, plus an index into it.
//!
//! ```text
//!   stack[0]  root    (branch, index → child)
//!   stack[1]  branch  (branch, index → child)
//!   stack[2]  leaf    (leaf,   index → current entry)
//! ```
//!
//! Page frames hold only a page id. Page bytes are read under the mmap lock
//! for the duration of one lookup, so a frame never outlives a remap.

use super::{BucketId, Node, NodeId};
use crate::error::{BoltError, Result};
use crate::page::{Page, Pgid, BRANCH_PAGE_FLAG, BUCKET_LEAF_FLAG, LEAF_PAGE_FLAG};
use crate::tx::Tx;
use crate::Item;

/// Key, value and leaf flags of one entry
pub(crate) type Entry = (Item, Item, u32);

/// Where a frame's entries live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Node(NodeId),
    Page(Pgid),
    /// The page embedded in an inline bucket's value
    Inline,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    source: Source,
    index: usize,
}

/// Uniform read access to a node or a page
pub(crate) enum View<'a> {
    Node(&'a Node),
    Page(Page<'a>),
}

impl View<'_> {
    pub fn is_leaf(&self) -> bool {
        match self {
            View::Node(node) => node.is_leaf,
            View::Page(page) => page.is_leaf(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            View::Node(node) => node.inodes.len(),
            View::Page(page) => page.count(),
        }
    }

    pub fn search(&self, key: &[u8]) -> Result<(usize, bool)> {
        match self {
            View::Node(node) => Ok(node.search(key)),
            View::Page(page) => page.search(key),
        }
    }

    /// Child page id of branch entry `index`
    pub fn child(&self, index: usize) -> Result<Pgid> {
        match self {
            View::Node(node) => node
                .inodes
                .get(index)
                .map(|inode| inode.pgid)
                .ok_or_else(|| BoltError::Corrupted(format!("branch index {} out of range", index))),
            View::Page(page) => Ok(page.branch_element(index)?.pgid),
        }
    }

    /// Leaf entry `index`
    pub fn entry(&self, index: usize) -> Result<Entry> {
        match self {
            View::Node(node) => node
                .inodes
                .get(index)
                .map(|inode| (inode.key.clone(), inode.value.clone(), inode.flags))
                .ok_or_else(|| BoltError::Corrupted(format!("leaf index {} out of range", index))),
            View::Page(page) => {
                let elem = page.leaf_element(index)?;
                Ok((
                    Item::copy_from_slice(elem.key),
                    Item::copy_from_slice(elem.value),
                    elem.flags,
                ))
            }
        }
    }
}

impl Tx {
    /// Resolve a page id of `bucket` to a live node if one is cached
    pub(crate) fn page_node(&self, bucket: BucketId, pgid: Pgid) -> Result<Source> {
        let state = &self.arena[bucket];
        if state.header.root == 0 {
            if pgid != 0 {
                return Err(BoltError::Corrupted(format!(
                    "inline bucket asked for page {}",
                    pgid
                )));
            }
            return Ok(match state.root_node {
                Some(root) => Source::Node(root),
                None => Source::Inline,
            });
        }
        match state.nodes.get(&pgid) {
            Some(node) => Ok(Source::Node(*node)),
            None => Ok(Source::Page(pgid)),
        }
    }

    /// Run `f` against the entries behind `source`
    pub(crate) fn inspect<R>(
        &self,
        bucket: BucketId,
        source: Source,
        f: impl FnOnce(View<'_>) -> Result<R>,
    ) -> Result<R> {
        let check = |page: Page<'_>| -> Result<()> {
            if page.flags() & (BRANCH_PAGE_FLAG | LEAF_PAGE_FLAG) == 0 {
                return Err(BoltError::Corrupted(format!(
                    "page {}: invalid page type {}",
                    page.id(),
                    page.type_name()
                )));
            }
            Ok(())
        };
        match source {
            Source::Node(id) => f(View::Node(&self.arena[id])),
            Source::Inline => {
                let buf = self.arena[bucket]
                    .page
                    .as_ref()
                    .ok_or_else(|| BoltError::Corrupted("inline bucket without a page".to_string()))?;
                let page = Page::new(buf)?;
                check(page)?;
                f(View::Page(page))
            }
            Source::Page(pgid) => self.with_page(pgid, |page| {
                check(page)?;
                f(View::Page(page))
            }),
        }
    }
}

// =============================================================================
// Raw Cursor
// =============================================================================

/// Cursor state without a transaction borrow
#[derive(Debug, Clone)]
pub(crate) struct RawCursor {
    bucket: BucketId,
    stack: Vec<Frame>,
}

impl RawCursor {
    pub fn new(bucket: BucketId) -> Self {
        Self {
            bucket,
            stack: Vec::new(),
        }
    }

    fn count(&self, tx: &Tx, frame: Frame) -> Result<usize> {
        tx.inspect(self.bucket, frame.source, |view| Ok(view.count()))
    }

    fn top_count(&self, tx: &Tx) -> Result<usize> {
        match self.stack.last() {
            Some(frame) => self.count(tx, *frame),
            None => Ok(0),
        }
    }

    fn push_root(&mut self, tx: &Tx, last: bool) -> Result<()> {
        self.stack.clear();
        let root = tx.arena[self.bucket].header.root;
        let source = tx.page_node(self.bucket, root)?;
        let mut frame = Frame { source, index: 0 };
        if last {
            frame.index = self.count(tx, frame)?.saturating_sub(1);
        }
        self.stack.push(frame);
        Ok(())
    }

    /// Position on the first entry
    pub fn first(&mut self, tx: &Tx) -> Result<Option<Entry>> {
        self.push_root(tx, false)?;
        self.descend(tx, false)?;
        if self.top_count(tx)? == 0 {
            return self.next(tx);
        }
        self.key_value(tx)
    }

    /// Position on the last entry
    pub fn last(&mut self, tx: &Tx) -> Result<Option<Entry>> {
        self.push_root(tx, true)?;
        self.descend(tx, true)?;
        if self.top_count(tx)? == 0 {
            return self.prev(tx);
        }
        self.key_value(tx)
    }

    /// Advance to the next entry, skipping empty leaves
    pub fn next(&mut self, tx: &Tx) -> Result<Option<Entry>> {
        loop {
            let mut advanced = false;
            for i in (0..self.stack.len()).rev() {
                let frame = self.stack[i];
                if frame.index + 1 < self.count(tx, frame)? {
                    self.stack[i].index += 1;
                    self.stack.truncate(i + 1);
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                return Ok(None);
            }

            self.descend(tx, false)?;
            if self.top_count(tx)? == 0 {
                continue;
            }
            return self.key_value(tx);
        }
    }

    /// Step back to the previous entry, skipping empty leaves
    pub fn prev(&mut self, tx: &Tx) -> Result<Option<Entry>> {
        loop {
            while let Some(frame) = self.stack.last_mut() {
                if frame.index > 0 {
                    frame.index -= 1;
                    break;
                }
                self.stack.pop();
            }
            if self.stack.is_empty() {
                return Ok(None);
            }

            self.descend(tx, true)?;
            if self.top_count(tx)? == 0 {
                continue;
            }
            return self.key_value(tx);
        }
    }

    /// Position on `key`, or the next entry after it
    pub fn seek(&mut self, tx: &Tx, key: &[u8]) -> Result<Option<Entry>> {
        let found = self.seek_raw(tx, key)?;
        if let Some(frame) = self.stack.last() {
            if frame.index >= self.count(tx, *frame)? {
                return self.next(tx);
            }
        }
        Ok(found)
    }

    /// Descend to the leaf where `key` belongs. Returns the entry at the
    /// landing position, which may be past the end of that leaf.
    pub fn seek_raw(&mut self, tx: &Tx, key: &[u8]) -> Result<Option<Entry>> {
        self.stack.clear();
        let mut pgid = tx.arena[self.bucket].header.root;
        loop {
            let source = tx.page_node(self.bucket, pgid)?;
            let (index, child) = tx.inspect(self.bucket, source, |view| {
                let (mut index, exact) = view.search(key)?;
                if view.is_leaf() || view.count() == 0 {
                    return Ok((index, None));
                }
                if !exact && index > 0 {
                    index -= 1;
                }
                Ok((index, Some(view.child(index)?)))
            })?;
            self.stack.push(Frame { source, index });
            match child {
                Some(child) => pgid = child,
                None => break,
            }
        }
        self.key_value(tx)
    }

    /// Follow the current frame's child down to a leaf, taking the first or
    /// last entry at each level
    fn descend(&mut self, tx: &Tx, last: bool) -> Result<()> {
        while let Some(frame) = self.stack.last().copied() {
            let child = tx.inspect(self.bucket, frame.source, |view| {
                if view.is_leaf() || frame.index >= view.count() {
                    Ok(None)
                } else {
                    view.child(frame.index).map(Some)
                }
            })?;
            let Some(pgid) = child else {
                break;
            };

            let source = tx.page_node(self.bucket, pgid)?;
            let mut next = Frame { source, index: 0 };
            if last {
                next.index = self.count(tx, next)?.saturating_sub(1);
            }
            self.stack.push(next);
        }
        Ok(())
    }

    /// Entry under the cursor, `None` when off the end
    pub fn key_value(&self, tx: &Tx) -> Result<Option<Entry>> {
        let Some(frame) = self.stack.last().copied() else {
            return Ok(None);
        };
        tx.inspect(self.bucket, frame.source, |view| {
            if !view.is_leaf() || frame.index >= view.count() {
                return Ok(None);
            }
            view.entry(frame.index).map(Some)
        })
    }

    /// Materialize the leaf node under the cursor, along with every node on
    /// the path to it
    pub fn node(&mut self, tx: &mut Tx) -> Result<NodeId> {
        let Some(top) = self.stack.last().copied() else {
            return Err(BoltError::Corrupted("cursor is not positioned".to_string()));
        };
        if let Source::Node(id) = top.source {
            if tx.arena[id].is_leaf {
                return Ok(id);
            }
        }

        let mut node = match self.stack[0].source {
            Source::Node(id) => id,
            Source::Page(pgid) => tx.node(self.bucket, pgid, None)?,
            Source::Inline => tx.node(self.bucket, 0, None)?,
        };
        self.stack[0].source = Source::Node(node);
        for i in 0..self.stack.len() - 1 {
            node = tx.child_at(node, self.stack[i].index)?;
            self.stack[i + 1].source = Source::Node(node);
        }
        Ok(node)
    }
}

// =============================================================================
// Public Cursor
// =============================================================================

/// Ordered iteration over a bucket. Nested buckets show up with a `None`
/// value.
pub struct Cursor<'tx> {
    tx: &'tx mut Tx,
    raw: RawCursor,
}

fn public(entry: Option<Entry>) -> Option<(Item, Option<Item>)> {
    entry.map(|(key, value, flags)| {
        if flags & BUCKET_LEAF_FLAG != 0 {
            (key, None)
        } else {
            (key, Some(value))
        }
    })
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(tx: &'tx mut Tx, bucket: BucketId) -> Self {
        tx.stats.cursor_count += 1;
        Self {
            tx,
            raw: RawCursor::new(bucket),
        }
    }

    pub fn first(&mut self) -> Result<Option<(Item, Option<Item>)>> {
        self.raw.first(self.tx).map(public)
    }

    pub fn last(&mut self) -> Result<Option<(Item, Option<Item>)>> {
        self.raw.last(self.tx).map(public)
    }

    pub fn next(&mut self) -> Result<Option<(Item, Option<Item>)>> {
        self.raw.next(self.tx).map(public)
    }

    pub fn prev(&mut self) -> Result<Option<(Item, Option<Item>)>> {
        self.raw.prev(self.tx).map(public)
    }

    /// Move to `key`, or the first key after it
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Item, Option<Item>)>> {
        self.raw.seek(self.tx, key).map(public)
    }

    /// Delete the entry under the cursor. Nested buckets are removed through
    /// `Bucket::delete_bucket` instead.
    pub fn delete(&mut self) -> Result<()> {
        self.tx.require_writable()?;
        let Some((key, _, flags)) = self.raw.key_value(self.tx)? else {
            return Ok(());
        };
        if flags & BUCKET_LEAF_FLAG != 0 {
            return Err(BoltError::IncompatibleValue);
        }
        let node = self.raw.node(self.tx)?;
        self.tx.arena[node].del(&key);
        Ok(())
    }
}
