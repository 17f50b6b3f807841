//! Entity -> render node lookup.
//!
//! Rebuilt from scratch on every sync, so it never outlives the nodes
//! it points at. Mask replacement does not trust it: stale overlays are
//! found by scanning the tree for their tag.

use std::collections::HashMap;

use crate::render::{NodeId, NodeTag};

#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: HashMap<NodeTag, NodeId>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the node drawing `tag`; returns the handle it replaced.
    pub fn insert(&mut self, tag: NodeTag, node: NodeId) -> Option<NodeId> {
        self.handles.insert(tag, node)
    }

    pub fn get(&self, tag: &NodeTag) -> Option<NodeId> {
        self.handles.get(tag).copied()
    }

    pub fn remove(&mut self, tag: &NodeTag) -> Option<NodeId> {
        self.handles.remove(tag)
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
