//! Transaction Module
//!
//! A transaction is a snapshot of the meta record plus, for writers, the
//! set of pages rewritten so far.
//!
//! ## Commit Protocol
//! ```text
//!   1. rebalance   merge nodes that lost entries
//!   2. spill       write dirty nodes into newly allocated pages
//!   3. root        record the new root page in the meta copy
//!   4. freelist    free the old freelist page, write the new one
//!   5. grow        extend the file past the new high-water mark
//!   6. pages       write dirty pages in page-id order, fdatasync
//!   7. meta        write meta into slot txid % 2, fdatasync
//!   8. callbacks   run on_commit handlers
//! ```
//! A failure in steps 2-7 rolls the transaction back; the previous meta
//! slot stays authoritative.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketState};
use crate::db::DbInner;
use crate::error::{BoltError, Result};
use crate::page::{write_header, BucketHeader, Meta, Page, Pgid, Txid, BUCKET_LEAF_FLAG};
use crate::tree::{Arena, BucketId, Cursor, NodeId};

/// Statistics gathered by one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStats {
    // -------------------------------------------------------------------------
    // Page Statistics
    // -------------------------------------------------------------------------
    /// Pages allocated
    pub page_count: usize,
    /// Bytes allocated
    pub page_alloc: usize,

    // -------------------------------------------------------------------------
    // Cursor / Node Statistics
    // -------------------------------------------------------------------------
    pub cursor_count: usize,
    /// Nodes materialized from pages
    pub node_count: usize,

    // -------------------------------------------------------------------------
    // Commit Statistics
    // -------------------------------------------------------------------------
    pub rebalance: usize,
    pub rebalance_time: Duration,
    pub split: usize,
    pub spill: usize,
    pub spill_time: Duration,
    /// Pages written to disk
    pub write: usize,
    pub write_time: Duration,
}

impl TxStats {
    /// Accumulate `other` into `self`
    pub fn add(&mut self, other: &TxStats) {
        self.page_count += other.page_count;
        self.page_alloc += other.page_alloc;
        self.cursor_count += other.cursor_count;
        self.node_count += other.node_count;
        self.rebalance += other.rebalance;
        self.rebalance_time += other.rebalance_time;
        self.split += other.split;
        self.spill += other.spill;
        self.spill_time += other.spill_time;
        self.write += other.write;
        self.write_time += other.write_time;
    }
}

/// A read-only or read-write transaction
///
/// Dropping an unfinished transaction rolls it back.
pub struct Tx {
    pub(crate) db: Arc<DbInner>,
    writable: bool,
    pub(crate) meta: Meta,
    pub(crate) arena: Arena,
    root: BucketId,
    /// Pages rewritten by this transaction, written in id order at commit
    pub(crate) pages: BTreeMap<Pgid, Vec<u8>>,
    commit_handlers: Vec<Box<dyn FnOnce() + Send>>,
    pub(crate) stats: TxStats,
    done: bool,
}

impl Tx {
    pub(crate) fn new(db: Arc<DbInner>, meta: Meta, writable: bool) -> Self {
        let mut arena = Arena::default();
        let root = arena.alloc_bucket(BucketState::new(meta.root));
        Self {
            db,
            writable,
            meta,
            arena,
            root,
            pages: BTreeMap::new(),
            commit_handlers: Vec::new(),
            stats: TxStats::default(),
            done: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Transaction id. Writers see the id they will commit as.
    pub fn id(&self) -> Txid {
        self.meta.txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Database size in bytes as seen by this transaction
    pub fn size(&self) -> u64 {
        self.meta.pgid * self.db.page_size as u64
    }

    pub fn stats(&self) -> TxStats {
        self.stats.clone()
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(BoltError::TxNotWritable)
        }
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    /// Open a top-level bucket
    pub fn bucket(&mut self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        let root = self.root;
        let child = self.open_bucket(root, name)?;
        Ok(child.map(|id| Bucket::new(self, id)))
    }

    /// Create a top-level bucket, or open it if it already exists
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>> {
        let root = self.root;
        let child = self.create_bucket_in(root, name)?;
        Ok(Bucket::new(self, child))
    }

    /// Delete a top-level bucket and everything in it
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        let root = self.root;
        self.delete_bucket_in(root, name)
    }

    /// Cursor over top-level bucket names
    pub fn cursor(&mut self) -> Cursor<'_> {
        let root = self.root;
        Cursor::new(self, root)
    }

    /// Register a callback that runs after a successful commit
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.commit_handlers.push(Box::new(f));
    }

    // =========================================================================
    // Page Access
    // =========================================================================

    /// Run `f` against page `pgid`: this transaction's copy if it rewrote the
    /// page, otherwise the mapped file
    pub(crate) fn with_page<R>(&self, pgid: Pgid, f: impl FnOnce(Page<'_>) -> Result<R>) -> Result<R> {
        if let Some(buf) = self.pages.get(&pgid) {
            return f(Page::new(buf)?);
        }
        self.db.with_page(pgid, f)
    }

    /// Allocate `count` contiguous pages and register them as dirty
    pub(crate) fn allocate(&mut self, count: usize) -> Result<Pgid> {
        let pgid = self.db.allocate(count, &mut self.meta.pgid)?;

        let size = count * self.db.page_size;
        let mut buf = vec![0u8; size];
        write_header(&mut buf, pgid, 0, 0, (count - 1) as u32);
        self.pages.insert(pgid, buf);

        self.stats.page_count += count;
        self.stats.page_alloc += size;
        Ok(pgid)
    }

    /// Hand `pgid` and its overflow pages to the free list
    pub(crate) fn free_pages(&mut self, pgid: Pgid, overflow: u32) -> Result<()> {
        self.db.state.lock().freelist.free(self.meta.txid, pgid, overflow)
    }

    /// Free a page, reading its overflow from the header
    pub(crate) fn free_page(&mut self, pgid: Pgid) -> Result<()> {
        let overflow = self.with_page(pgid, |page| Ok(page.overflow()))?;
        self.free_pages(pgid, overflow)
    }

    /// Free the page a node was read from
    pub(crate) fn free_node(&mut self, id: NodeId) -> Result<()> {
        let pgid = self.arena[id].pgid;
        if pgid != 0 {
            self.free_page(pgid)?;
            self.arena[id].pgid = 0;
        }
        Ok(())
    }

    // =========================================================================
    // Commit / Rollback
    // =========================================================================

    /// Persist every change. On failure the transaction is rolled back and
    /// the cause is returned wrapped in `CommitFailed`.
    pub fn commit(mut self) -> Result<()> {
        self.require_writable()?;
        if !self.db.state.lock().opened {
            return Err(BoltError::DatabaseNotOpen);
        }

        let start = Instant::now();
        self.rebalance_bucket(self.root)?;
        if self.stats.rebalance > 0 {
            self.stats.rebalance_time += start.elapsed();
        }

        if let Err(err) = self.commit_pages() {
            warn!(txid = self.meta.txid, error = %err, "commit failed, rolling back");
            if let Err(rollback_err) = self.rollback_inner() {
                warn!(txid = self.meta.txid, error = %rollback_err, "rollback after failed commit failed");
            }
            return Err(BoltError::CommitFailed(Box::new(err)));
        }

        debug!(
            txid = self.meta.txid,
            pages = self.stats.write,
            high_water = self.meta.pgid,
            "committed"
        );
        self.close();

        for handler in std::mem::take(&mut self.commit_handlers) {
            handler();
        }
        Ok(())
    }

    /// Steps 2-7 of the commit protocol
    fn commit_pages(&mut self) -> Result<()> {
        let page_size = self.db.page_size;

        let start = Instant::now();
        self.spill_bucket(self.root)?;
        self.stats.spill_time += start.elapsed();

        self.meta.root = self.arena[self.root].header;
        let opgid = self.meta.pgid;

        // Size the new freelist after freeing the old page so it fits itself.
        let old_freelist = self.meta.freelist;
        self.free_page(old_freelist)?;
        let size = self.db.state.lock().freelist.size();
        let pgid = self.allocate(size / page_size + 1)?;
        {
            let buf = self
                .pages
                .get_mut(&pgid)
                .ok_or_else(|| BoltError::Corrupted(format!("freelist page {} not dirty", pgid)))?;
            self.db.state.lock().freelist.write(buf)?;
        }
        self.meta.freelist = pgid;

        if self.meta.pgid > opgid {
            self.db.grow((self.meta.pgid as usize + 1) * page_size)?;
        }

        let start = Instant::now();
        self.write_pages()?;
        self.write_meta()?;
        self.stats.write_time += start.elapsed();
        Ok(())
    }

    fn write_pages(&mut self) -> Result<()> {
        let pages = std::mem::take(&mut self.pages);
        for (pgid, buf) in &pages {
            self.db.write_at(buf, *pgid * self.db.page_size as u64)?;
            self.stats.write += 1;
        }
        self.db.sync()
    }

    fn write_meta(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.db.page_size];
        self.meta.write(&mut buf)?;
        self.db.write_at(&buf, (self.meta.txid % 2) * self.db.page_size as u64)?;
        self.db.sync()?;
        self.stats.write += 1;

        self.db.state.lock().meta = self.meta;
        Ok(())
    }

    /// Discard every change
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }

        let result = if self.writable {
            debug!(txid = self.meta.txid, "rolling back");
            self.reload_freelist()
        } else {
            Ok(())
        };
        self.close();
        result
    }

    /// Drop this writer's pending frees and re-read the durable free list
    fn reload_freelist(&self) -> Result<()> {
        let mut state = self.db.state.lock();
        state.freelist.rollback(self.meta.txid);
        if !state.opened {
            return Ok(());
        }
        let freelist = state.meta.freelist;
        let state = &mut *state;
        self.db.with_page(freelist, |page| state.freelist.reload(&page))
    }

    fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.pages.clear();
        self.db.close_tx(self.writable, self.meta.txid, &self.stats);
    }

    // =========================================================================
    // Consistency Check
    // =========================================================================

    /// Verify the snapshot this transaction reads: every page below the
    /// high-water mark is either reachable or free, never both, never
    /// referenced twice, and every tree page is a branch or a leaf.
    pub fn check(&self) -> Result<()> {
        let mut errors = Vec::new();

        let all = self.db.state.lock().freelist.all();
        let mut freed = HashSet::new();
        for id in all {
            if !freed.insert(id) {
                errors.push(format!("page {}: already freed", id));
            }
        }

        let mut reachable: HashMap<Pgid, Pgid> = HashMap::new();
        reachable.insert(0, 0);
        reachable.insert(1, 1);
        let overflow = self.with_page(self.meta.freelist, |page| Ok(page.overflow()))?;
        for i in 0..=overflow as Pgid {
            reachable.insert(self.meta.freelist + i, self.meta.freelist);
        }

        self.check_bucket(self.meta.root, &mut reachable, &freed, &mut errors)?;

        for id in 0..self.meta.pgid {
            if !reachable.contains_key(&id) && !freed.contains(&id) {
                errors.push(format!("page {}: unreachable unfreed", id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BoltError::Inconsistent(errors))
        }
    }

    fn check_bucket(
        &self,
        header: BucketHeader,
        reachable: &mut HashMap<Pgid, Pgid>,
        freed: &HashSet<Pgid>,
        errors: &mut Vec<String>,
    ) -> Result<()> {
        if header.root == 0 {
            return Ok(());
        }

        let mut stack = vec![header.root];
        let mut nested = Vec::new();
        while let Some(pgid) = stack.pop() {
            if pgid >= self.meta.pgid {
                errors.push(format!("page {}: out of bounds: {}", pgid, self.meta.pgid));
                continue;
            }

            let (overflow, is_tree_page, type_name) = self.with_page(pgid, |page| {
                if page.is_branch() {
                    for i in 0..page.count() {
                        stack.push(page.branch_element(i)?.pgid);
                    }
                } else if page.is_leaf() {
                    for i in 0..page.count() {
                        let elem = page.leaf_element(i)?;
                        if elem.flags & BUCKET_LEAF_FLAG != 0 {
                            nested.push(BucketHeader::decode(elem.value)?);
                        }
                    }
                }
                Ok((page.overflow(), page.is_branch() || page.is_leaf(), page.type_name()))
            })?;

            for i in 0..=overflow as Pgid {
                if reachable.insert(pgid + i, pgid).is_some() {
                    errors.push(format!("page {}: multiple references", pgid + i));
                }
            }

            if freed.contains(&pgid) {
                errors.push(format!("page {}: reachable freed", pgid));
            } else if !is_tree_page {
                errors.push(format!("page {}: invalid type: {}", pgid, type_name));
            }
        }

        for header in nested {
            self.check_bucket(header, reachable, freed, errors)?;
        }
        Ok(())
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if let Err(err) = self.rollback_inner() {
            warn!(txid = self.meta.txid, error = %err, "rollback on drop failed");
        }
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.meta.txid)
            .field("writable", &self.writable)
            .field("high_water", &self.meta.pgid)
            .finish()
    }
}
