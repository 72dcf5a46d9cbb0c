//! Free List
//!
//! Tracks page ids that can be reused by future allocations.
//!
//! ## Responsibilities
//! - Hand out runs of consecutive free pages
//! - Hold pages freed by a writer as "pending" until no reader can see them
//! - Reject double frees
//! - Serialize to and from a freelist page
//!
//! ## Lifecycle of a freed page
//! ```text
//!   free(txid, page) ──► pending[txid] ──release(≥ txid)──► ids ──allocate──► in use
//!                              │
//!                              └──rollback(txid)──► dropped
//! ```

use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use crate::error::{BoltError, Result};
use crate::page::{read_u32, read_u64, write_header, write_u64, Page, Pgid, Txid, FREELIST_PAGE_FLAG, PAGE_HEADER_SIZE};

/// Count value that signals an overflowed count stored in the first slot
const COUNT_OVERFLOW: usize = 0xFFFF;

/// Registry of free and pending page ids
#[derive(Debug, Default, Clone)]
pub struct FreeList {
    /// Allocatable ids, strictly ascending, never below 2
    ids: Vec<Pgid>,

    /// Ids freed by each writer, not yet safe to reuse
    pending: BTreeMap<Txid, Vec<Pgid>>,

    /// Membership index over `ids` and every pending list
    cache: HashSet<Pgid>,
}

impl FreeList {
    /// Create an empty free list
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized size in bytes, including the header
    pub fn size(&self) -> usize {
        let mut n = self.count();
        if n >= COUNT_OVERFLOW {
            n += 1;
        }
        PAGE_HEADER_SIZE + n * 8
    }

    /// Free plus pending page count
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Allocatable ids in ascending order
    pub fn ids(&self) -> &[Pgid] {
        &self.ids
    }

    /// Every free and pending id, sorted
    pub fn all(&self) -> Vec<Pgid> {
        let mut pending: Vec<Pgid> = self.pending.values().flatten().copied().collect();
        pending.sort_unstable();
        merge_sorted(&self.ids, &pending)
    }

    /// Whether `pgid` is free or pending
    pub fn freed(&self, pgid: Pgid) -> bool {
        self.cache.contains(&pgid)
    }

    /// Take the first run of `n` consecutive ids. Returns 0 when no run
    /// exists and the caller must grow the file instead.
    pub fn allocate(&mut self, n: usize) -> Pgid {
        if n == 0 || self.ids.is_empty() {
            return 0;
        }

        let mut initial: Pgid = 0;
        let mut prev: Pgid = 0;
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            if prev == 0 || id - prev != 1 {
                initial = id;
            }

            if id - initial + 1 == n as Pgid {
                self.ids.drain(i + 1 - n..=i);
                for pgid in initial..initial + n as Pgid {
                    self.cache.remove(&pgid);
                }
                return initial;
            }

            prev = id;
        }
        0
    }

    /// Mark `pgid` and its overflow pages as freed by `txid`
    pub fn free(&mut self, txid: Txid, pgid: Pgid, overflow: u32) -> Result<()> {
        if pgid <= 1 {
            return Err(BoltError::Corrupted(format!("cannot free page {}", pgid)));
        }

        let last = pgid + overflow as Pgid;
        if let Some(id) = (pgid..=last).find(|id| self.cache.contains(id)) {
            return Err(BoltError::DoubleFree { pgid: id });
        }

        let pending = self.pending.entry(txid).or_default();
        for id in pgid..=last {
            pending.push(id);
            self.cache.insert(id);
        }
        Ok(())
    }

    /// Make every page freed by a transaction at or below `txid` allocatable
    pub fn release(&mut self, txid: Txid) {
        let keep = match txid.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let released = std::mem::replace(&mut self.pending, keep);

        let mut ids: Vec<Pgid> = released.into_values().flatten().collect();
        if ids.is_empty() {
            return;
        }
        ids.sort_unstable();
        self.ids = merge_sorted(&self.ids, &ids);
    }

    /// Drop the pages `txid` freed without making them allocatable
    pub fn rollback(&mut self, txid: Txid) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Load ids from a freelist page
    pub fn read(&mut self, page: &Page<'_>) -> Result<()> {
        let mut idx = 0;
        let mut count = page.count();
        if count == COUNT_OVERFLOW {
            idx = 1;
            count = page.u64_slot(0)? as usize;
        }

        let mut ids = Vec::with_capacity(count);
        for i in idx..idx + count {
            let id = page.u64_slot(i)?;
            if id < 2 {
                warn!(pgid = id, "ignoring reserved page id in free list");
                continue;
            }
            ids.push(id);
        }
        ids.sort_unstable();
        ids.dedup();

        self.ids = ids;
        self.reindex();
        Ok(())
    }

    /// Write free and pending ids into a page buffer. Pending ids are
    /// included so a crash never leaks them.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let ids = self.all();
        if buf.len() < self.size() {
            return Err(BoltError::Corrupted(format!(
                "freelist page too small: {} < {}",
                buf.len(),
                self.size()
            )));
        }

        let id = read_u64(buf, 0);
        let overflow = read_u32(buf, 12);
        let (count, start) = if ids.len() < COUNT_OVERFLOW {
            (ids.len() as u16, 0)
        } else {
            write_u64(buf, PAGE_HEADER_SIZE, ids.len() as u64);
            (COUNT_OVERFLOW as u16, 1)
        };
        write_header(buf, id, FREELIST_PAGE_FLAG, count, overflow);

        for (i, pgid) in ids.iter().enumerate() {
            write_u64(buf, PAGE_HEADER_SIZE + (start + i) * 8, *pgid);
        }
        Ok(())
    }

    /// Re-read the persisted list and drop anything still pending
    pub fn reload(&mut self, page: &Page<'_>) -> Result<()> {
        self.read(page)?;

        let pending: HashSet<Pgid> = self.pending.values().flatten().copied().collect();
        self.ids.retain(|id| !pending.contains(id));
        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.cache = self.ids.iter().copied().collect();
        for ids in self.pending.values() {
            self.cache.extend(ids.iter().copied());
        }
    }
}

/// Merge two ascending slices into one ascending vector
fn merge_sorted(a: &[Pgid], b: &[Pgid]) -> Vec<Pgid> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            merged.push(a[i]);
            i += 1;
        } else {
            merged.push(b[j]);
            j += 1;
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged
}
