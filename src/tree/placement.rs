//! Best-first placement search: where in the tree a new sample belongs, and at what
//! branch lengths. See §4.3.1/§4.3.2.
use crate::config::Config;
use crate::error::PhyloError;
use crate::model::Model;
use crate::reference::Reference;
use crate::region::{Region, RegionKind};
use crate::region_list::RegionList;

use super::refresh::{new_dirty_set, update_partial_lh, DirtySet};
use super::{NodeId, Tree};

/// Max iterations and absolute tolerance for the bounded golden-section line
/// searches used to optimize branch lengths, per §4.3.2.
const LINE_SEARCH_MAX_ITER: usize = 20;
const LINE_SEARCH_TOLERANCE: f64 = 1e-7;
const GOLDEN_RATIO: f64 = 0.618_033_988_749_895;

/// A scored candidate location for a new sample: attaching at `split_fraction` along
/// the edge above `target` (`0.0` = immediately above `target`, `1.0` = immediately
/// below `target`'s original parent), with a leaf branch of `new_leaf_blength`.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub target: NodeId,
    pub split_fraction: f64,
    pub new_leaf_blength: f64,
    pub log_lh: f64,
}

/// `(upper region list used as the merge's `upper` side, its required branch length)`
/// for the edge directly above `target`: the root's virtual prior when `target` is
/// the root, otherwise `target`'s parent's cached `upper_left`/`upper_right`.
pub(super) fn total_upper_of<'a>(
    tree: &'a Tree,
    target: NodeId,
    prior: &'a RegionList,
) -> Result<(&'a RegionList, f64), PhyloError> {
    match tree.node(target).parent {
        None => Ok((prior, 0.0)),
        Some(parent) => {
            let siblings = tree.node(parent).children.ok_or_else(|| {
                PhyloError::InvariantViolation("parent of placement target has no children".to_string())
            })?;
            let upper = if siblings[0] == target {
                tree.node(parent).upper_left.as_ref()
            } else {
                tree.node(parent).upper_right.as_ref()
            };
            let upper = upper
                .ok_or_else(|| PhyloError::InvariantViolation("upper cache missing for placement".to_string()))?;
            Ok((upper, tree.node(target).branch_length.unwrap_or(0.0)))
        }
    }
}

pub(super) fn root_prior(model: &Model, reference: &Reference) -> Result<RegionList, PhyloError> {
    let region = Region::simple(RegionKind::Other(model.root_freqs.clone()), reference.len() - 1);
    RegionList::from_regions(vec![region], reference.len())
}

/// Score of attaching `sample` at `split_fraction` along the edge above `target` with
/// leaf branch `leaf_b`. `b_t` is the full length of the edge above `target` (`0.0`
/// at the root, where there is no edge to split).
#[allow(clippy::too_many_arguments)]
pub(super) fn score(
    tree: &Tree,
    target: NodeId,
    total_upper: &RegionList,
    b_u: f64,
    b_t: f64,
    split_fraction: f64,
    sample: &RegionList,
    leaf_b: f64,
    model: &Model,
    reference: &Reference,
) -> Result<f64, PhyloError> {
    let b_to_target = b_t * split_fraction;
    let b_to_parent = b_t * (1.0 - split_fraction);
    let target_lower = tree
        .node(target)
        .lower
        .as_ref()
        .ok_or_else(|| PhyloError::InvariantViolation("placement target has no lower cache".to_string()))?;
    let merged_lower =
        RegionList::merge_lower_lower(sample, leaf_b, target_lower, b_to_target, model, reference)?;
    RegionList::log_lh(total_upper, &merged_lower, b_u + b_to_parent, model, reference)
}

/// Maximizes a unimodal `f` over `[lo, hi]` via golden-section search, bounded by
/// [`LINE_SEARCH_MAX_ITER`] iterations or an interval narrower than
/// [`LINE_SEARCH_TOLERANCE`]. `f` returning `NEG_INFINITY` (numerical underflow) is
/// treated as an ordinary, very poor score rather than a search failure.
pub(super) fn golden_section_maximize(mut lo: f64, mut hi: f64, mut f: impl FnMut(f64) -> f64) -> (f64, f64) {
    let mut x1 = hi - GOLDEN_RATIO * (hi - lo);
    let mut x2 = lo + GOLDEN_RATIO * (hi - lo);
    let mut f1 = f(x1);
    let mut f2 = f(x2);
    for _ in 0..LINE_SEARCH_MAX_ITER {
        if (hi - lo).abs() < LINE_SEARCH_TOLERANCE {
            break;
        }
        if f1 < f2 {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + GOLDEN_RATIO * (hi - lo);
            f2 = f(x2);
        } else {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - GOLDEN_RATIO * (hi - lo);
            f1 = f(x1);
        }
    }
    if f1 > f2 {
        (x1, f1)
    } else {
        (x2, f2)
    }
}

/// Optimizes the placement at a single edge by coordinate ascent: alternately
/// line-searching `split_fraction` (fixed at `0.5` when `target` is the root, since
/// there is no edge above it to split) and `new_leaf_blength`, for a few rounds.
pub(super) fn optimize_edge(
    tree: &Tree,
    target: NodeId,
    total_upper: &RegionList,
    b_u: f64,
    b_t: f64,
    sample: &RegionList,
    model: &Model,
    reference: &Reference,
    config: &Config,
) -> Result<Placement, PhyloError> {
    let mut split_fraction = if b_t > 0.0 { 0.5 } else { 0.0 };
    let mut leaf_b = config.default_blength;
    let mut best_log_lh = f64::NEG_INFINITY;

    for _ in 0..3 {
        if b_t > 0.0 {
            let (s, lh) = golden_section_maximize(0.0, 1.0, |s| {
                score(tree, target, total_upper, b_u, b_t, s, sample, leaf_b, model, reference)
                    .unwrap_or(f64::NEG_INFINITY)
            });
            split_fraction = s;
            best_log_lh = lh;
        }
        let (l, lh) = golden_section_maximize(config.min_blength, config.max_blength, |l| {
            score(
                tree,
                target,
                total_upper,
                b_u,
                b_t,
                split_fraction,
                sample,
                l,
                model,
                reference,
            )
            .unwrap_or(f64::NEG_INFINITY)
        });
        leaf_b = l;
        best_log_lh = lh;
    }

    Ok(Placement {
        target,
        split_fraction,
        new_leaf_blength: leaf_b.max(config.min_blength),
        log_lh: best_log_lh,
    })
}

/// Best-first search over every edge in the tree for the highest-scoring placement
/// of `sample`. A full descent rather than a pruned one: faithful to the scoring
/// function in §4.3.1 without the original engine's traversal short-circuiting, which
/// is an efficiency concern orthogonal to correctness.
pub fn seek_sample_placement(
    tree: &Tree,
    sample: &RegionList,
    model: &Model,
    reference: &Reference,
    config: &Config,
) -> Result<Placement, PhyloError> {
    seek_best_edge(tree, tree.root(), sample, model, reference, config, &|_| false)
}

/// As [`seek_sample_placement`], but skipping every node for which `exclude` returns
/// `true` — used by SPR to keep a detached subtree from being reattached to one of
/// its own (former) descendants.
pub(super) fn seek_best_edge(
    tree: &Tree,
    search_root: NodeId,
    sample: &RegionList,
    model: &Model,
    reference: &Reference,
    config: &Config,
    exclude: &dyn Fn(NodeId) -> bool,
) -> Result<Placement, PhyloError> {
    let prior = root_prior(model, reference)?;
    let mut best: Option<Placement> = None;
    for id in all_nodes(tree, search_root) {
        if exclude(id) {
            continue;
        }
        let (total_upper, b_u) = total_upper_of(tree, id, &prior)?;
        let b_t = tree.node(id).branch_length.unwrap_or(0.0);
        let candidate = optimize_edge(tree, id, total_upper, b_u, b_t, sample, model, reference, config)?;
        let improves = match &best {
            None => true,
            // tie-break toward the deeper (more specific) node, per the spec.
            Some(current) => {
                candidate.log_lh > current.log_lh + config.min_improvement
                    || (candidate.log_lh >= current.log_lh && depth(tree, id) > depth(tree, current.target))
            }
        };
        if improves {
            best = Some(candidate);
        }
    }
    best.ok_or_else(|| PhyloError::InvariantViolation("placement search visited no nodes".to_string()))
}

/// Grafts `sample_name`/`sample_regions` into the tree at `placement`, and drives
/// [`update_partial_lh`] to restore consistency of every cache the graft disturbed.
/// Returns the new leaf's `NodeId`.
pub fn place_new_sample(
    tree: &mut Tree,
    sample_name: String,
    sample_regions: RegionList,
    placement: &Placement,
    model: &Model,
    reference: &Reference,
) -> Result<NodeId, PhyloError> {
    let b_t = tree.node(placement.target).branch_length.unwrap_or(0.0);
    let b_to_target = (b_t * placement.split_fraction).max(0.0);
    let b_to_parent = b_t - b_to_target;
    let (new_internal, new_leaf) = tree.graft_sibling(
        placement.target,
        sample_name,
        sample_regions,
        placement.new_leaf_blength,
        b_to_target,
    );
    tree.node_mut(new_internal).branch_length = Some(b_to_parent);

    let mut dirty: DirtySet = new_dirty_set();
    dirty.insert(new_internal);
    update_partial_lh(tree, &mut dirty, model, reference)?;
    Ok(new_leaf)
}

fn all_nodes(tree: &Tree, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(tree.capacity());
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        out.push(id);
        if let Some([l, r]) = tree.node(id).children {
            stack.push(l);
            stack.push(r);
        }
    }
    out
}

fn depth(tree: &Tree, mut id: NodeId) -> usize {
    let mut d = 0;
    while let Some(parent) = tree.node(id).parent {
        id = parent;
        d += 1;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Alphabet;
    use crate::model::ModelPreset;
    use crate::region::Mutation;
    use crate::tree::refresh::{refresh_all_lowers_postorder, refresh_all_uppers_preorder};

    fn dna_model() -> (Model, Reference) {
        let reference = Reference::new(vec![0, 1, 2, 3]).unwrap();
        let mut model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
        model.extract_ref_info(&reference);
        model.compute_cumulative_rate(&reference);
        (model, reference)
    }

    fn leaf_regions(mutation: Option<(usize, u8)>) -> RegionList {
        let mutations = match mutation {
            Some((pos, state)) => vec![Mutation::new(RegionKind::State(state), pos, 1)],
            None => vec![],
        };
        RegionList::from_mutations(&mutations, 4).unwrap()
    }

    #[test]
    fn identical_sample_places_with_zero_leaf_branch_preference() {
        let (model, reference) = dna_model();
        let config = Config::builder().with_genome_length(4).build().unwrap();
        let mut tree = Tree::new_single_leaf("a".to_string(), leaf_regions(None));
        refresh_all_lowers_postorder(&mut tree, &model, &reference).unwrap();
        refresh_all_uppers_preorder(&mut tree, &model, &reference).unwrap();

        let sample = leaf_regions(None);
        let placement = seek_sample_placement(&tree, &sample, &model, &reference, &config).unwrap();
        assert!(placement.log_lh.is_finite() || placement.log_lh == 0.0);
        assert!(placement.new_leaf_blength <= config.max_blength);
        assert!(placement.new_leaf_blength >= config.min_blength);
    }

    #[test]
    fn placing_a_sample_keeps_the_tree_internally_consistent() {
        let (model, reference) = dna_model();
        let config = Config::builder().with_genome_length(4).build().unwrap();
        let mut tree = Tree::new_single_leaf("a".to_string(), leaf_regions(None));
        refresh_all_lowers_postorder(&mut tree, &model, &reference).unwrap();
        refresh_all_uppers_preorder(&mut tree, &model, &reference).unwrap();

        let sample = leaf_regions(Some((0, 1)));
        let placement = seek_sample_placement(&tree, &sample, &model, &reference, &config).unwrap();
        place_new_sample(&mut tree, "b".to_string(), sample, &placement, &model, &reference).unwrap();

        let root = tree.root();
        tree.node(root).lower.as_ref().unwrap().validate().unwrap();
    }
}
