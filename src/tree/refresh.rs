//! Keeps [`super::Node::lower`], [`super::Node::upper_left`] and
//! [`super::Node::upper_right`] consistent after a graft, detach, or branch-length
//! change, per §4.1.3/§4.3.2: a post-order pass recomputes `lower` bottom-up, a
//! pre-order pass recomputes the two `upper_*` caches top-down, and
//! [`update_partial_lh`] does both incrementally, starting only from the nodes an
//! edit actually touched.
use std::collections::HashSet;

use nohash_hasher::BuildNoHashHasher;

use crate::error::PhyloError;
use crate::model::Model;
use crate::reference::Reference;
use crate::region::{Region, RegionKind};
use crate::region_list::RegionList;

use super::{NodeId, Tree};

/// A dedup'd worklist of nodes whose cached region lists need recomputing.
/// `NodeId`'s [`nohash_hasher::IsEnabled`] impl lets the hash map skip hashing
/// entirely, since a dense small integer is already its own hash.
pub type DirtySet = HashSet<NodeId, BuildNoHashHasher<NodeId>>;

pub fn new_dirty_set() -> DirtySet {
    HashSet::with_hasher(BuildNoHashHasher::default())
}

/// The distribution implied by the root frequencies alone, constant across the whole
/// genome: the "total upper" fed into the root's own [`super::Node::upper_left`]/
/// [`super::Node::upper_right`] computation, standing in for "no information above
/// the root".
fn root_prior(model: &Model, reference: &Reference) -> Result<RegionList, PhyloError> {
    let region = Region::simple(RegionKind::Other(model.root_freqs.clone()), reference.len() - 1);
    RegionList::from_regions(vec![region], reference.len())
}

/// Recomputes `lower` for a single internal node from its two children's (already
/// up to date) `lower` caches. No-op, successfully, on a leaf.
fn refresh_lower(tree: &mut Tree, id: NodeId, model: &Model, reference: &Reference) -> Result<bool, PhyloError> {
    let Some([left, right]) = tree.node(id).children else {
        return Ok(false);
    };
    let left_lower = tree.node(left).lower.clone().ok_or_else(|| {
        PhyloError::InvariantViolation("left child lower missing during refresh".to_string())
    })?;
    let right_lower = tree.node(right).lower.clone().ok_or_else(|| {
        PhyloError::InvariantViolation("right child lower missing during refresh".to_string())
    })?;
    let b_left = tree.node(left).branch_length.unwrap_or(0.0);
    let b_right = tree.node(right).branch_length.unwrap_or(0.0);
    let merged = RegionList::merge_lower_lower(&left_lower, b_left, &right_lower, b_right, model, reference)?;
    let changed = tree.node(id).lower.as_ref() != Some(&merged);
    let node = tree.node_mut(id);
    node.lower = Some(merged);
    node.lower_outdated = false;
    Ok(changed)
}

/// Full bottom-up pass: recomputes `lower` for every internal node in the tree,
/// children before parents. Used after operations that touch most of the tree (e.g.
/// at startup once every leaf's `lower` has been set directly from its sample).
pub fn refresh_all_lowers_postorder(tree: &mut Tree, model: &Model, reference: &Reference) -> Result<(), PhyloError> {
    let order = postorder(tree, tree.root());
    for id in order {
        if !tree.is_leaf(id) {
            refresh_lower(tree, id, model, reference)?;
        }
    }
    Ok(())
}

/// Recomputes `upper_left`/`upper_right` on `id` (the summary each of `id`'s two
/// children sees looking back up through `id`) from `id`'s own total upper (passed in
/// explicitly, since it lives on `id`'s parent, or is the [`root_prior`] at the root)
/// and `id`'s children's `lower` caches.
fn refresh_upper_children(
    tree: &mut Tree,
    id: NodeId,
    total_upper: &RegionList,
    total_upper_blength: f64,
    model: &Model,
    reference: &Reference,
) -> Result<(), PhyloError> {
    let Some([left, right]) = tree.node(id).children else {
        return Ok(());
    };
    let left_lower = tree.node(left).lower.clone().ok_or_else(|| {
        PhyloError::InvariantViolation("left child lower missing during upper refresh".to_string())
    })?;
    let right_lower = tree.node(right).lower.clone().ok_or_else(|| {
        PhyloError::InvariantViolation("right child lower missing during upper refresh".to_string())
    })?;
    let b_left = tree.node(left).branch_length.unwrap_or(0.0);
    let b_right = tree.node(right).branch_length.unwrap_or(0.0);

    let upper_left = RegionList::merge_upper_lower(total_upper, total_upper_blength, &right_lower, b_right, model, reference)?;
    let upper_right = RegionList::merge_upper_lower(total_upper, total_upper_blength, &left_lower, b_left, model, reference)?;

    let node = tree.node_mut(id);
    node.upper_left = Some(upper_left);
    node.upper_left_outdated = false;
    node.upper_right = Some(upper_right);
    node.upper_right_outdated = false;
    Ok(())
}

/// `(region list, branch length)` to feed into [`RegionList::merge_upper_lower`] as
/// the "upper" side when computing `id`'s own children's upper caches: the root uses
/// [`root_prior`] with no branch above it, every other node reuses its parent's
/// `upper_left`/`upper_right` (not yet branch-adjusted) together with its own branch
/// length.
fn total_upper_of<'a>(tree: &'a Tree, id: NodeId, prior: &'a RegionList) -> Result<(&'a RegionList, f64), PhyloError> {
    let node = tree.node(id);
    match node.parent {
        None => Ok((prior, 0.0)),
        Some(parent) => {
            let siblings = tree.node(parent).children.ok_or_else(|| {
                PhyloError::InvariantViolation("non-root node's parent has no children".to_string())
            })?;
            let upper = if siblings[0] == id {
                tree.node(parent).upper_left.as_ref()
            } else {
                tree.node(parent).upper_right.as_ref()
            };
            let upper = upper.ok_or_else(|| {
                PhyloError::InvariantViolation("parent upper cache missing during refresh".to_string())
            })?;
            Ok((upper, node.branch_length.unwrap_or(0.0)))
        }
    }
}

/// Full top-down pass: recomputes `upper_left`/`upper_right` for every internal node,
/// parents before children.
pub fn refresh_all_uppers_preorder(tree: &mut Tree, model: &Model, reference: &Reference) -> Result<(), PhyloError> {
    let prior = root_prior(model, reference)?;
    let order = preorder(tree, tree.root());
    for id in order {
        if tree.is_leaf(id) {
            continue;
        }
        let (total_upper, b) = total_upper_of(tree, id, &prior)?;
        let total_upper = total_upper.clone();
        refresh_upper_children(tree, id, &total_upper, b, model, reference)?;
    }
    Ok(())
}

/// Incrementally restores consistency starting from `dirty`: pops a node, recomputes
/// whichever of its caches are marked outdated, and re-enqueues the neighbors whose
/// own caches are invalidated as a result (parent on a `lower` change, children on an
/// `upper_*` change) — converges because every edit strictly reduces the outdated set
/// along the direction it propagates in a finite tree.
pub fn update_partial_lh(
    tree: &mut Tree,
    dirty: &mut DirtySet,
    model: &Model,
    reference: &Reference,
) -> Result<(), PhyloError> {
    let prior = root_prior(model, reference)?;
    while let Some(id) = dirty.iter().next().copied() {
        dirty.remove(&id);
        if tree.node(id).lower_outdated && !tree.is_leaf(id) {
            let changed = refresh_lower(tree, id, model, reference)?;
            if changed {
                if let Some(parent) = tree.node(id).parent {
                    tree.node_mut(parent).mark_lower_outdated();
                    dirty.insert(parent);
                }
                tree.node_mut(id).mark_upper_outdated();
                if let Some([l, r]) = tree.node(id).children {
                    tree.node_mut(l).mark_upper_outdated();
                    tree.node_mut(r).mark_upper_outdated();
                    dirty.insert(l);
                    dirty.insert(r);
                }
            }
        }
        let needs_upper = tree.node(id).upper_left_outdated || tree.node(id).upper_right_outdated;
        if needs_upper && !tree.is_leaf(id) {
            let (total_upper, b) = total_upper_of(tree, id, &prior)?;
            let total_upper = total_upper.clone();
            refresh_upper_children(tree, id, &total_upper, b, model, reference)?;
            if let Some([l, r]) = tree.node(id).children {
                dirty.insert(l);
                dirty.insert(r);
            }
        }
    }
    Ok(())
}

fn postorder(tree: &Tree, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(tree.capacity());
    fn visit(tree: &Tree, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some([l, r]) = tree.node(id).children {
            visit(tree, l, out);
            visit(tree, r, out);
        }
        out.push(id);
    }
    visit(tree, root, &mut out);
    out
}

fn preorder(tree: &Tree, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(tree.capacity());
    fn visit(tree: &Tree, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        if let Some([l, r]) = tree.node(id).children {
            visit(tree, l, out);
            visit(tree, r, out);
        }
    }
    visit(tree, root, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Alphabet;
    use crate::model::ModelPreset;
    use crate::region::Mutation;

    fn dna_model() -> (Model, Reference) {
        let reference = Reference::new(vec![0, 1, 2, 3]).unwrap();
        let mut model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
        model.extract_ref_info(&reference);
        model.compute_cumulative_rate(&reference);
        (model, reference)
    }

    fn leaf_regions(mutation_state: Option<(usize, u8)>) -> RegionList {
        let mutations = match mutation_state {
            Some((pos, state)) => vec![Mutation::new(RegionKind::State(state), pos, 1)],
            None => vec![],
        };
        RegionList::from_mutations(&mutations, 4).unwrap()
    }

    fn three_leaf_tree() -> Tree {
        let mut tree = Tree::new_single_leaf("a".to_string(), leaf_regions(None));
        let root = tree.root();
        let (internal, _leaf_b) = tree.graft_sibling(root, "b".to_string(), leaf_regions(Some((0, 1))), 0.05, 0.05);
        let _ = tree.graft_sibling(internal, "c".to_string(), leaf_regions(Some((1, 2))), 0.05, 0.05);
        tree
    }

    #[test]
    fn postorder_and_preorder_visit_every_node_once() {
        let tree = three_leaf_tree();
        let post = postorder(&tree, tree.root());
        let pre = preorder(&tree, tree.root());
        assert_eq!(post.len(), tree.capacity());
        assert_eq!(pre.len(), tree.capacity());
    }

    #[test]
    fn full_refresh_converges_and_root_lower_is_well_formed() {
        let (model, reference) = dna_model();
        let mut tree = three_leaf_tree();
        refresh_all_lowers_postorder(&mut tree, &model, &reference).unwrap();
        refresh_all_uppers_preorder(&mut tree, &model, &reference).unwrap();
        let root = tree.root();
        assert!(tree.node(root).lower.is_some());
        tree.node(root).lower.as_ref().unwrap().validate().unwrap();
    }

    #[test]
    fn update_partial_lh_matches_full_refresh_after_a_graft() {
        let (model, reference) = dna_model();
        let mut tree = three_leaf_tree();
        refresh_all_lowers_postorder(&mut tree, &model, &reference).unwrap();
        refresh_all_uppers_preorder(&mut tree, &model, &reference).unwrap();

        let leaf_a = tree.root();
        let leaf_a = tree.leaves_under(leaf_a)[0];
        let (new_internal, _new_leaf) =
            tree.graft_sibling(leaf_a, "d".to_string(), leaf_regions(Some((3, 0))), 0.05, 0.05);
        let mut dirty = new_dirty_set();
        dirty.insert(new_internal);
        update_partial_lh(&mut tree, &mut dirty, &model, &reference).unwrap();

        // Re-derive the whole tree from scratch and compare the root lower, which is
        // the strongest single check that incremental and full refresh agree.
        let mut fresh = three_leaf_tree();
        let leaf_a_fresh = fresh.leaves_under(fresh.root())[0];
        let _ = fresh.graft_sibling(leaf_a_fresh, "d".to_string(), leaf_regions(Some((3, 0))), 0.05, 0.05);
        refresh_all_lowers_postorder(&mut fresh, &model, &reference).unwrap();
        refresh_all_uppers_preorder(&mut fresh, &model, &reference).unwrap();

        assert_eq!(tree.node(tree.root()).lower, fresh.node(fresh.root()).lower);
    }
}
