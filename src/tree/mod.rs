//! Tree Module
//!
//! The per-transaction B+tree working set.
//!
//! ## Responsibilities
//! - Own every materialized node and opened bucket of a transaction
//! - Split and spill dirty nodes into freshly allocated pages at commit
//! - Merge underfull nodes after deletions
//! - Walk trees through cursors that mix persisted pages and live nodes
//!
//! ## Ownership
//! ```text
//!   Tx ──owns──► Arena ──┬──► nodes:   Vec<Node>         (NodeId = index)
//!                        └──► buckets: Vec<BucketState>  (BucketId = index)
//!
//!   Node.parent / Node.children / BucketState.nodes / BucketState.buckets
//!   hold ids, never references. Dropping the Tx drops the whole graph.
//! ```

mod cursor;
mod node;
mod rebalance;
mod split;

pub use cursor::Cursor;
pub use split::DEFAULT_FILL_PERCENT;
pub(crate) use cursor::{RawCursor, Source};
pub(crate) use node::Node;

use std::ops::{Index, IndexMut};

use crate::bucket::BucketState;

/// Handle to a node in the transaction arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// Handle to a bucket in the transaction arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BucketId(usize);

/// Node and bucket storage for one transaction
#[derive(Default)]
pub(crate) struct Arena {
    nodes: Vec<Node>,
    buckets: Vec<BucketState>,
}

impl Arena {
    pub fn alloc_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn alloc_bucket(&mut self, bucket: BucketState) -> BucketId {
        self.buckets.push(bucket);
        BucketId(self.buckets.len() - 1)
    }

    /// Detach `child` from `parent`'s child list
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.0].children.retain(|c| *c != child);
    }

    /// Topmost ancestor of `id`
    pub fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self[id].parent {
            id = parent;
        }
        id
    }
}

impl Index<NodeId> for Arena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }
}

impl IndexMut<NodeId> for Arena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }
}

impl Index<BucketId> for Arena {
    type Output = BucketState;

    fn index(&self, id: BucketId) -> &BucketState {
        &self.buckets[id.0]
    }
}

impl IndexMut<BucketId> for Arena {
    fn index_mut(&mut self, id: BucketId) -> &mut BucketState {
        &mut self.buckets[id.0]
    }
}
