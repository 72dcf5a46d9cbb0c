//! Split and spill
//!
//! At commit every dirty node is cut into page-sized pieces, written into
//! freshly allocated pages and re-registered with its parent. Spilling runs
//! children first so a parent always indexes its children's new page ids.
//!
//! ```text
//!   before:   P ──► [a b c d e f g h]          (too big)
//!   split:    P ──► [a b c d] [e f g h]
//!   spill:    each piece → allocate → write → P.put(first key, new pgid)
//!   new root: a split root gains a fresh parent, which is spilled last
//! ```

use bytes::Bytes;

use super::node::{needs_split, split_index};
use super::{Node, NodeId};
use crate::error::{BoltError, Result};
use crate::tx::Tx;

/// Lower and upper bounds for a bucket's fill percent
pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;

/// Default fill percent for new buckets
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

impl Tx {
    /// Cut `id` into page-sized nodes, `id` first
    pub(crate) fn split_node(&mut self, id: NodeId) -> Vec<NodeId> {
        let cuts = self.split_points(id);
        if cuts.is_empty() {
            return vec![id];
        }

        let bucket = self.arena[id].bucket;
        let is_leaf = self.arena[id].is_leaf;
        let parent = match self.arena[id].parent {
            Some(parent) => parent,
            None => {
                let mut root = Node::new(bucket, false);
                root.children.push(id);
                let parent = self.arena.alloc_node(root);
                self.arena[id].parent = Some(parent);
                parent
            }
        };

        // Cut from the back so every entry moves once.
        let mut inodes = std::mem::take(&mut self.arena[id].inodes);
        let mut tails = Vec::with_capacity(cuts.len());
        for &cut in cuts.iter().rev() {
            tails.push(inodes.split_off(cut));
        }
        inodes.shrink_to_fit();
        self.arena[id].inodes = inodes;

        let mut nodes = Vec::with_capacity(tails.len() + 1);
        nodes.push(id);
        for tail in tails.into_iter().rev() {
            let mut next = Node::new(bucket, is_leaf);
            next.parent = Some(parent);
            next.inodes = tail;
            let next = self.arena.alloc_node(next);
            self.arena[parent].children.push(next);
            nodes.push(next);
            self.stats.split += 1;
        }
        nodes
    }

    /// Entry offsets where each new sibling of `id` starts. Every cut is the
    /// split point of the tail left by the previous one, taken only while
    /// that tail still overflows a page.
    fn split_points(&self, id: NodeId) -> Vec<usize> {
        let page_size = self.db.page_size;
        let node = &self.arena[id];
        let fill = self.arena[node.bucket]
            .fill_percent
            .clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill) as usize;
        let elsize = node.page_element_size();

        let mut cuts = Vec::new();
        let mut start = 0;
        while needs_split(&node.inodes[start..], elsize, page_size) {
            let (index, _) = split_index(&node.inodes[start..], elsize, threshold);
            start += index;
            cuts.push(start);
        }
        cuts
    }

    /// Write `id` and its dirty descendants into new pages
    pub(crate) fn spill_node(&mut self, id: NodeId) -> Result<()> {
        if self.arena[id].spilled {
            return Ok(());
        }

        let mut children = std::mem::take(&mut self.arena[id].children);
        children.sort_by(|a, b| self.arena[*a].first_key().cmp(self.arena[*b].first_key()));
        self.arena[id].children = children;

        // Spilling a child can append its new siblings to our child list.
        let mut i = 0;
        while i < self.arena[id].children.len() {
            let child = self.arena[id].children[i];
            self.spill_node(child)?;
            i += 1;
        }
        self.arena[id].children.clear();

        let page_size = self.db.page_size;
        for node in self.split_node(id) {
            if self.arena[node].pgid > 0 {
                let old = self.arena[node].pgid;
                self.free_page(old)?;
                self.arena[node].pgid = 0;
            }

            let count = self.arena[node].size() / page_size + 1;
            let pgid = self.allocate(count)?;

            let buf = self
                .pages
                .get_mut(&pgid)
                .ok_or_else(|| BoltError::Corrupted(format!("page {} not dirty after allocate", pgid)))?;
            self.arena[node].write(buf)?;
            self.arena[node].pgid = pgid;
            self.arena[node].spilled = true;

            if let Some(parent) = self.arena[node].parent {
                let first = self.arena[node]
                    .inodes
                    .first()
                    .map(|inode| inode.key.clone())
                    .ok_or_else(|| BoltError::Corrupted(format!("spilled empty child into page {}", pgid)))?;
                let key = if self.arena[node].key.is_empty() {
                    first.clone()
                } else {
                    self.arena[node].key.clone()
                };
                let high_water = self.meta.pgid;
                self.arena[parent].put(&key, first.clone(), Bytes::new(), pgid, 0, high_water)?;
                self.arena[node].key = first;
            }

            self.stats.spill += 1;
        }

        // A split root created a parent with no page yet.
        if let Some(parent) = self.arena[id].parent {
            if self.arena[parent].pgid == 0 {
                return self.spill_node(parent);
            }
        }
        Ok(())
    }
}
