//! Subtree-prune-and-regraft refinement: repeatedly tries detaching each subtree and
//! reattaching it wherever the tree's total log-likelihood improves most. See §4.4.
use fixedbitset::FixedBitSet;

use crate::config::Config;
use crate::error::PhyloError;
use crate::model::Model;
use crate::reference::Reference;

use crate::region_list::RegionList;

use super::placement::{root_prior, seek_best_edge, total_upper_of};
use super::refresh::{new_dirty_set, update_partial_lh};
use super::{NodeId, Tree};

/// Packed "this node's neighborhood changed since its last SPR attempt, try it
/// again" flags across the whole arena. A `FixedBitSet` rather than a `Vec<bool>`
/// per node, since every arena slot needs exactly one bit and SPR sweeps the whole
/// tree repeatedly.
struct OutdatedFlags {
    bits: FixedBitSet,
}

impl OutdatedFlags {
    fn all_set(capacity: usize) -> Self {
        let mut bits = FixedBitSet::with_capacity(capacity);
        bits.set_range(.., true);
        Self { bits }
    }

    fn take(&mut self, id: NodeId) -> bool {
        if id.0 >= self.bits.len() {
            return false;
        }
        let was_set = self.bits[id.0];
        self.bits.set(id.0, false);
        was_set
    }

    fn mark(&mut self, id: NodeId) {
        if id.0 >= self.bits.len() {
            self.bits.grow(id.0 + 1);
        }
        self.bits.set(id.0, true);
    }

    fn any_set(&self) -> bool {
        self.bits.count_ones(..) > 0
    }
}

/// One SPR sweep over every node currently flagged outdated. Returns the number of
/// moves actually applied (improvement exceeded `config.min_spr_improvement`) and the
/// total log-likelihood gained.
fn sweep(tree: &mut Tree, flags: &mut OutdatedFlags, model: &Model, reference: &Reference, config: &Config) -> Result<(usize, f64), PhyloError> {
    let mut applied = 0usize;
    let mut total_gain = 0.0;
    let candidates: Vec<NodeId> = (0..tree.capacity())
        .map(NodeId)
        .filter(|&id| tree.is_alive(id) && flags.take(id))
        .collect();
    for node in candidates {
        if !tree.is_alive(node) || tree.node(node).parent.is_none() {
            continue; // freed since queued, or cannot SPR the root itself
        }
        if let Some(gain) = try_improve(tree, node, model, reference, config)? {
            applied += 1;
            total_gain += gain;
            flags.mark(node);
            if let Some(parent) = tree.node(node).parent {
                flags.mark(parent);
                if let Some(sibling) = tree.sibling(node) {
                    flags.mark(sibling);
                }
            }
        }
    }
    Ok((applied, total_gain))
}

/// Tries detaching `node`'s subtree and reattaching it at the best-scoring edge
/// elsewhere in the tree. Applies the move (and returns the log-likelihood gain) only
/// if it clears `config.min_spr_improvement`; otherwise restores `node` to its
/// original position and returns `Ok(None)`.
fn try_improve(
    tree: &mut Tree,
    node: NodeId,
    model: &Model,
    reference: &Reference,
    config: &Config,
) -> Result<Option<f64>, PhyloError> {
    let original_parent = tree.node(node).parent;
    let Some(original_parent) = original_parent else {
        return Ok(None);
    };
    let original_sibling = tree
        .sibling(node)
        .ok_or_else(|| PhyloError::InvariantViolation("SPR candidate has no sibling".to_string()))?;
    let original_node_blength = tree.node(node).branch_length.unwrap_or(0.0);
    let original_parent_blength = tree.node(original_parent).branch_length;
    let original_sibling_blength = tree.node(original_sibling).branch_length;

    let subtree_lower = tree
        .node(node)
        .lower
        .clone()
        .ok_or_else(|| PhyloError::InvariantViolation("SPR candidate has no lower cache".to_string()))?;

    let prior = root_prior(model, reference)?;
    let (total_upper, b_u) = total_upper_of(tree, node, &prior)?;
    let original_log_lh = RegionList::log_lh(total_upper, &subtree_lower, b_u + original_node_blength, model, reference)?;

    let promoted_sibling = tree.detach(node)?;
    {
        let mut dirty = new_dirty_set();
        dirty.insert(promoted_sibling);
        update_partial_lh(tree, &mut dirty, model, reference)?;
    }

    let exclude = |candidate: NodeId| candidate == node || tree.contains_descendant(node, candidate);
    let placement = seek_best_edge(tree, tree.root(), &subtree_lower, model, reference, config, &exclude);
    let placement = match placement {
        Ok(p) => p,
        Err(_) => {
            reattach_original(
                tree,
                node,
                original_sibling,
                original_node_blength,
                original_parent_blength,
                original_sibling_blength,
                model,
                reference,
            )?;
            return Ok(None);
        }
    };

    let gain = placement.log_lh - original_log_lh;

    if gain < config.min_spr_improvement {
        reattach_original(
            tree,
            node,
            original_sibling,
            original_node_blength,
            original_parent_blength,
            original_sibling_blength,
            model,
            reference,
        )?;
        return Ok(None);
    }

    let b_t = tree.node(placement.target).branch_length.unwrap_or(0.0);
    let b_to_target = (b_t * placement.split_fraction).max(0.0);
    let b_to_parent = b_t - b_to_target;
    let new_internal = tree.graft_existing(placement.target, node, original_node_blength, b_to_target);
    tree.node_mut(new_internal).branch_length = Some(b_to_parent);

    let mut dirty = new_dirty_set();
    dirty.insert(new_internal);
    update_partial_lh(tree, &mut dirty, model, reference)?;
    Ok(Some(gain))
}

/// Undoes a [`Tree::detach`] that found no improving reattachment: regrafts `node`
/// as `original_sibling`'s sibling with the same branch lengths it had before.
fn reattach_original(
    tree: &mut Tree,
    node: NodeId,
    original_sibling: NodeId,
    original_node_blength: f64,
    original_parent_blength: Option<f64>,
    original_sibling_blength: Option<f64>,
    model: &Model,
    reference: &Reference,
) -> Result<(), PhyloError> {
    let new_internal = tree.graft_existing(
        original_sibling,
        node,
        original_node_blength,
        original_sibling_blength.unwrap_or(0.0),
    );
    tree.node_mut(new_internal).branch_length = original_parent_blength;
    let mut dirty = new_dirty_set();
    dirty.insert(new_internal);
    update_partial_lh(tree, &mut dirty, model, reference)?;
    Ok(())
}

/// Repeatedly sweeps the whole tree, up to `config.max_spr_sweeps` times, stopping
/// early once a sweep's total log-likelihood gain falls below
/// `config.min_total_improvement`. Returns the number of moves applied across every
/// sweep.
pub fn improve_entire_tree(tree: &mut Tree, model: &Model, reference: &Reference, config: &Config) -> Result<usize, PhyloError> {
    let mut flags = OutdatedFlags::all_set(tree.capacity());
    let mut total_applied = 0usize;
    for sweep_index in 0..config.max_spr_sweeps {
        if !flags.any_set() {
            break;
        }
        let (applied, gain) = sweep(tree, &mut flags, model, reference, config)?;
        total_applied += applied;
        log::debug!("SPR sweep {sweep_index}: {applied} moves applied, {gain:.6} log-lh gained");
        if gain < config.min_total_improvement {
            break;
        }
    }
    Ok(total_applied)
}
