//! Rebalance
//!
//! Nodes that lost entries are merged into a sibling when they fall under a
//! quarter page or below their minimum key count. Empty nodes are removed,
//! and a root branch with a single child is collapsed into that child.

use super::{BucketId, NodeId};
use crate::error::{BoltError, Result};
use crate::tx::Tx;

impl Tx {
    /// Rebalance every cached node of `bucket`, then its child buckets
    pub(crate) fn rebalance_bucket(&mut self, bucket: BucketId) -> Result<()> {
        let mut nodes: Vec<_> = self.arena[bucket].nodes.iter().map(|(p, n)| (*p, *n)).collect();
        nodes.sort_unstable_by_key(|(pgid, _)| *pgid);
        for (pgid, node) in nodes {
            // Merges evict nodes from the cache as they go.
            if self.arena[bucket].nodes.get(&pgid) == Some(&node) {
                self.rebalance_node(node)?;
            }
        }

        let children: Vec<BucketId> = self.arena[bucket].buckets.values().copied().collect();
        for child in children {
            self.rebalance_bucket(child)?;
        }
        Ok(())
    }

    fn rebalance_node(&mut self, id: NodeId) -> Result<()> {
        if !self.arena[id].unbalanced {
            return Ok(());
        }
        self.arena[id].unbalanced = false;
        self.stats.rebalance += 1;

        let threshold = self.db.page_size / 4;
        let node = &self.arena[id];
        if node.size() > threshold && node.inodes.len() > node.min_keys() {
            return Ok(());
        }

        let Some(parent) = node.parent else {
            if !node.is_leaf && node.inodes.len() == 1 {
                self.collapse_root(id)?;
            }
            return Ok(());
        };

        if self.arena[id].inodes.is_empty() {
            self.remove_node(parent, id)?;
            return self.rebalance_node(parent);
        }

        if self.arena[parent].inodes.len() < 2 {
            return Err(BoltError::Corrupted(format!(
                "parent of page {} has a single child",
                self.arena[id].pgid
            )));
        }

        let index = self.arena[parent].child_index(&self.arena[id].key);
        if index == 0 {
            let target = self.child_at(parent, index + 1)?;
            self.adopt_children(target, id);
            let moved = std::mem::take(&mut self.arena[target].inodes);
            self.arena[id].inodes.extend(moved);
            self.remove_node(parent, target)?;
        } else {
            let target = self.child_at(parent, index - 1)?;
            self.adopt_children(id, target);
            let moved = std::mem::take(&mut self.arena[id].inodes);
            self.arena[target].inodes.extend(moved);
            self.remove_node(parent, id)?;
        }

        self.rebalance_node(parent)
    }

    /// Pull a root's only child up into the root
    fn collapse_root(&mut self, id: NodeId) -> Result<()> {
        let child = self.child_at(id, 0)?;
        let bucket = self.arena[id].bucket;

        let is_leaf = self.arena[child].is_leaf;
        let inodes = std::mem::take(&mut self.arena[child].inodes);
        let children = std::mem::take(&mut self.arena[child].children);
        for grandchild in &children {
            self.arena[*grandchild].parent = Some(id);
        }

        let root = &mut self.arena[id];
        root.is_leaf = is_leaf;
        root.inodes = inodes;
        root.children = children;

        self.arena[child].parent = None;
        let pgid = self.arena[child].pgid;
        self.arena[bucket].nodes.remove(&pgid);
        self.free_node(child)
    }

    /// Reparent every materialized child of `from` onto `to`
    fn adopt_children(&mut self, from: NodeId, to: NodeId) {
        if self.arena[from].is_leaf {
            return;
        }
        let bucket = self.arena[from].bucket;
        let pgids: Vec<_> = self.arena[from].inodes.iter().map(|inode| inode.pgid).collect();
        for pgid in pgids {
            let Some(&child) = self.arena[bucket].nodes.get(&pgid) else {
                continue;
            };
            if let Some(old) = self.arena[child].parent {
                self.arena.remove_child(old, child);
            }
            self.arena[child].parent = Some(to);
            self.arena[to].children.push(child);
        }
    }

    /// Unlink `id` from `parent`, evict it and free its page
    fn remove_node(&mut self, parent: NodeId, id: NodeId) -> Result<()> {
        let key = self.arena[id].key.clone();
        self.arena[parent].del(&key);
        self.arena.remove_child(parent, id);

        let bucket = self.arena[id].bucket;
        let pgid = self.arena[id].pgid;
        self.arena[bucket].nodes.remove(&pgid);
        self.free_node(id)
    }
}
