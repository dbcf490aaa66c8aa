//! The rooted binary tree: an arena of [`Node`]s indexed by stable [`NodeId`]s, with
//! cached lower/upper region lists kept consistent by the [`refresh`] machinery.
//!
//! The original engine uses raw parent/child pointers; this rewrite uses an arena
//! (a `Vec<Option<Node>>`) so detach/graft become index swaps with no aliasing
//! hazards and no cycles in the ownership graph (see Design Notes in the spec).
pub mod node;
pub mod placement;
pub mod refresh;
pub mod spr;

pub use node::{Node, NodeId};

use crate::error::PhyloError;
use crate::region_list::RegionList;

/// A rooted binary tree over an arena of nodes. Freed slots (from SPR detach) are
/// tombstoned as `None` and recycled by subsequent allocations.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
    free_list: Vec<NodeId>,
}

impl Tree {
    /// Builds a single-leaf tree: a root node that is also the first sample's leaf.
    pub fn new_single_leaf(sample_name: String, lower: RegionList) -> Self {
        let mut node = Node::new_internal(None, None);
        node.sample_name = Some(sample_name);
        node.lower = Some(lower);
        node.lower_outdated = false;
        Self {
            nodes: vec![Some(node)],
            root: NodeId(0),
            free_list: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().expect("dangling NodeId")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().expect("dangling NodeId")
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `id` refers to a currently-occupied arena slot (`false` for a freed,
    /// recycled one). Used to skip tombstoned slots when iterating `0..capacity()`.
    pub fn is_alive(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len() && self.nodes[id.0].is_some()
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free_list.pop() {
            self.nodes[id.0] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            NodeId(self.nodes.len() - 1)
        }
    }

    /// Removes a node from the arena entirely (used once a detached subtree is
    /// discarded rather than re-grafted). The slot is recycled by future `alloc`s.
    pub fn free(&mut self, id: NodeId) {
        self.nodes[id.0] = None;
        self.free_list.push(id);
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.node(id).is_leaf()
    }

    pub fn sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.node(id).parent?;
        let children = self.node(parent).children?;
        Some(if children[0] == id { children[1] } else { children[0] })
    }

    /// Walks the leaves of the subtree rooted at `id`, used by SPR to exclude
    /// positions inside the detached subtree from re-placement search.
    pub fn leaves_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.node(current).children {
                Some([l, r]) => {
                    stack.push(l);
                    stack.push(r);
                }
                None => out.push(current),
            }
        }
        out
    }

    pub fn contains_descendant(&self, ancestor: NodeId, candidate: NodeId) -> bool {
        if ancestor == candidate {
            return true;
        }
        match self.node(ancestor).children {
            Some([l, r]) => self.contains_descendant(l, candidate) || self.contains_descendant(r, candidate),
            None => false,
        }
    }

    /// Splices a new leaf below `target`, inserting a fresh internal node at the
    /// midpoint of the edge above `target` (or, if `target` is the root, directly
    /// above it). Returns `(new_internal, new_leaf)`. Used by
    /// [`placement::place_new_sample`].
    pub fn graft_sibling(
        &mut self,
        target: NodeId,
        sample_name: String,
        sample_regions: RegionList,
        new_leaf_blength: f64,
        new_internal_to_target_blength: f64,
    ) -> (NodeId, NodeId) {
        let target_parent = self.node(target).parent;
        let target_blength = self.node(target).branch_length;

        let mut new_internal = Node::new_internal(target_parent, target_blength);
        new_internal.lower_outdated = true;
        let new_internal_id = self.alloc(new_internal);

        let new_leaf = Node::new_leaf(new_internal_id, new_leaf_blength, sample_name);
        let new_leaf_id = self.alloc(new_leaf);
        self.node_mut(new_leaf_id).lower = Some(sample_regions);
        self.node_mut(new_leaf_id).lower_outdated = false;

        self.node_mut(target).parent = Some(new_internal_id);
        self.node_mut(target).branch_length = Some(new_internal_to_target_blength);
        self.node_mut(new_internal_id).children = Some([target, new_leaf_id]);

        if let Some(parent_id) = target_parent {
            let children = self.node_mut(parent_id).children.as_mut().unwrap();
            if children[0] == target {
                children[0] = new_internal_id;
            } else {
                children[1] = new_internal_id;
            }
        } else {
            self.root = new_internal_id;
        }
        self.invalidate_path_to_root(new_internal_id);
        (new_internal_id, new_leaf_id)
    }

    /// Marks `lower` outdated on `id` and every ancestor up to the root, and
    /// `upper_*` outdated on every descendant whose summary could now be stale.
    pub fn invalidate_path_to_root(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node_mut(node_id);
            node.mark_lower_outdated();
            current = node.parent;
        }
        self.invalidate_uppers_below(id);
    }

    fn invalidate_uppers_below(&mut self, id: NodeId) {
        let children = self.node(id).children;
        if let Some([l, r]) = children {
            self.node_mut(l).mark_upper_outdated();
            self.node_mut(r).mark_upper_outdated();
            self.invalidate_uppers_below(l);
            self.invalidate_uppers_below(r);
        }
    }

    /// Detaches the subtree rooted at `node` from the rest of the tree, for
    /// reattachment elsewhere by SPR. The former parent (which becomes unary) is
    /// collapsed by promoting `node`'s sibling into its place; `node` itself becomes
    /// parentless with no branch length, ready to be passed to
    /// [`Tree::graft_existing`]. Returns the sibling's `NodeId`, now occupying the
    /// position the parent used to.
    pub fn detach(&mut self, node: NodeId) -> Result<NodeId, PhyloError> {
        let parent = self
            .node(node)
            .parent
            .ok_or_else(|| PhyloError::InvariantViolation("cannot detach the root".to_string()))?;
        let grandparent = self.node(parent).parent;
        let sibling = self
            .sibling(node)
            .ok_or_else(|| PhyloError::InvariantViolation("detach target has no sibling".to_string()))?;

        let parent_blength = self.node(parent).branch_length;
        let sibling_blength = self.node(sibling).branch_length;
        let combined_blength = match (parent_blength, sibling_blength) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.node_mut(sibling).branch_length = combined_blength;
        self.node_mut(sibling).parent = grandparent;

        if let Some(grandparent_id) = grandparent {
            let children = self.node_mut(grandparent_id).children.as_mut().unwrap();
            if children[0] == parent {
                children[0] = sibling;
            } else {
                children[1] = sibling;
            }
        } else {
            self.root = sibling;
        }
        self.free(parent);
        self.node_mut(node).parent = None;
        self.node_mut(node).branch_length = None;
        self.invalidate_path_to_root(sibling);
        Ok(sibling)
    }

    /// Grafts an already-detached subtree (`subtree_root`, as returned by
    /// [`Tree::detach`]) below `target`, inserting a fresh internal node on the edge
    /// above `target` exactly as [`Tree::graft_sibling`] does for a brand new leaf.
    /// Returns the new internal node's `NodeId`.
    pub fn graft_existing(
        &mut self,
        target: NodeId,
        subtree_root: NodeId,
        subtree_blength: f64,
        new_internal_to_target_blength: f64,
    ) -> NodeId {
        let target_parent = self.node(target).parent;
        let target_blength = self.node(target).branch_length;

        let mut new_internal = Node::new_internal(target_parent, target_blength);
        new_internal.lower_outdated = true;
        let new_internal_id = self.alloc(new_internal);

        self.node_mut(subtree_root).parent = Some(new_internal_id);
        self.node_mut(subtree_root).branch_length = Some(subtree_blength);

        self.node_mut(target).parent = Some(new_internal_id);
        self.node_mut(target).branch_length = Some(new_internal_to_target_blength);
        self.node_mut(new_internal_id).children = Some([target, subtree_root]);

        if let Some(parent_id) = target_parent {
            let children = self.node_mut(parent_id).children.as_mut().unwrap();
            if children[0] == target {
                children[0] = new_internal_id;
            } else {
                children[1] = new_internal_id;
            }
        } else {
            self.root = new_internal_id;
        }
        self.invalidate_path_to_root(new_internal_id);
        new_internal_id
    }
}
