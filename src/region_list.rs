//! The region list: an ordered, run-length-like encoding of a partial-likelihood
//! vector along the genome, and its two fundamental operations — merge along a
//! branch, and pairwise log-likelihood.
use crate::error::PhyloError;
use crate::linalg;
use crate::model::Model;
use crate::reference::Reference;
use crate::region::{Mutation, Region, RegionKind};

/// Tolerance below which a merge's renormalized probability mass is treated as
/// numerical underflow (see §4.1.1).
const UNDERFLOW_FLOOR: f64 = 1e-300;
/// Tolerance for recognizing a merged `O` distribution as numerically one-hot.
const ONE_HOT_TOLERANCE: f64 = 1e-9;

/// A non-empty, ordered sequence of [`Region`]s spanning exactly `[0, genome_length)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionList {
    regions: Vec<Region>,
    genome_length: usize,
}

impl RegionList {
    /// Builds a region list from a sample's parsed mutations, filling the gaps
    /// between them with implicit `Ref` runs, per §3.
    pub fn from_mutations(
        mutations: &[Mutation],
        genome_length: usize,
    ) -> Result<Self, PhyloError> {
        if genome_length == 0 {
            return Err(PhyloError::EmptyInput(
                "genome length is zero".to_string(),
            ));
        }
        let mut regions = Vec::with_capacity(mutations.len() * 2 + 1);
        let mut cursor = 0usize;
        for m in mutations {
            if m.position < cursor {
                return Err(PhyloError::InvariantViolation(format!(
                    "mutation at {} overlaps previous run ending at {}",
                    m.position,
                    cursor.saturating_sub(1)
                )));
            }
            if m.position > cursor {
                regions.push(Region::simple(RegionKind::Ref, m.position - 1));
            }
            let end = m.position + m.length - 1;
            regions.push(Region::simple(m.kind.clone(), end));
            cursor = end + 1;
        }
        if cursor < genome_length {
            regions.push(Region::simple(RegionKind::Ref, genome_length - 1));
        }
        let list = Self {
            regions: coalesce(regions),
            genome_length,
        };
        list.validate()?;
        Ok(list)
    }

    pub fn from_regions(regions: Vec<Region>, genome_length: usize) -> Result<Self, PhyloError> {
        let list = Self {
            regions,
            genome_length,
        };
        list.validate()?;
        Ok(list)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn genome_length(&self) -> usize {
        self.genome_length
    }

    /// The ordinary state this list implies at `position`, or `None` if that
    /// position is ambiguous (`Unknown`/`Other`). `Ref` resolves via `reference`;
    /// `O(log n)` via binary search over the region boundaries.
    pub fn resolved_state_at(&self, position: usize, reference: &Reference) -> Option<crate::alphabet::OrdinaryState> {
        let idx = self.regions.partition_point(|r| r.position < position);
        match &self.regions.get(idx)?.kind {
            RegionKind::Ref => Some(reference.state_at(position)),
            RegionKind::State(s) => Some(*s),
            RegionKind::Unknown | RegionKind::Other(_) => None,
        }
    }

    /// (I1) coverage and (I2) likelihood-vector invariants, plus the
    /// no-adjacent-equal-regions structural invariant.
    pub fn validate(&self) -> Result<(), PhyloError> {
        if self.regions.is_empty() {
            return Err(PhyloError::InvariantViolation(
                "region list has no regions".to_string(),
            ));
        }
        let mut prev_end: Option<usize> = None;
        for (i, region) in self.regions.iter().enumerate() {
            if let Some(prev) = prev_end {
                if region.position <= prev {
                    return Err(PhyloError::InvariantViolation(format!(
                        "region {} position {} not strictly increasing after {}",
                        i, region.position, prev
                    )));
                }
            }
            if !region.satisfies_likelihood_invariant() {
                return Err(PhyloError::InvariantViolation(format!(
                    "region {} violates the likelihood-vector invariant (I2)",
                    i
                )));
            }
            if let RegionKind::Other(v) = &region.kind {
                let sum: f64 = v.iter().sum();
                if (sum - 1.0).abs() > 1e-6 {
                    return Err(PhyloError::InvariantViolation(format!(
                        "region {} likelihood vector sums to {} not 1",
                        i, sum
                    )));
                }
            }
            prev_end = Some(region.position);
        }
        if self.regions.last().unwrap().position != self.genome_length - 1 {
            return Err(PhyloError::InvariantViolation(format!(
                "region list ends at {} not {}",
                self.regions.last().unwrap().position,
                self.genome_length - 1
            )));
        }
        for pair in self.regions.windows(2) {
            if pair[0].mergeable_with(&pair[1]) {
                return Err(PhyloError::InvariantViolation(
                    "adjacent regions should have been coalesced".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Merges this node's upper and lower contributions (from branches of length
    /// `b_u` and `b_l` respectively) into the node's own region list. See §4.1.1.
    pub fn merge_upper_lower(
        upper: &RegionList,
        b_u: f64,
        lower: &RegionList,
        b_l: f64,
        model: &Model,
        reference: &Reference,
    ) -> Result<RegionList, PhyloError> {
        merge_two(upper, b_u, lower, b_l, model, reference)
    }

    /// The symmetric variant used when composing two children's `lower` caches
    /// during the refresh pass. Algebraically identical to
    /// [`RegionList::merge_upper_lower`]; see §4.1.3.
    pub fn merge_lower_lower(
        lhs: &RegionList,
        b_lhs: f64,
        rhs: &RegionList,
        b_rhs: f64,
        model: &Model,
        reference: &Reference,
    ) -> Result<RegionList, PhyloError> {
        merge_two(lhs, b_lhs, rhs, b_rhs, model, reference)
    }

    /// `Σ_positions log P(observation at this node | state distribution from
    /// above)`. See §4.1.2. Returns `f64::NEG_INFINITY` (not an `Err`) when a
    /// position's contribution underflows to zero probability — an unlikely
    /// placement is still a valid, comparable score.
    pub fn log_lh(
        parent_upper: &RegionList,
        child_lower: &RegionList,
        branch_length: f64,
        model: &Model,
        reference: &Reference,
    ) -> Result<f64, PhyloError> {
        if parent_upper.genome_length != child_lower.genome_length {
            return Err(PhyloError::InvariantViolation(
                "log_lh operands cover different genome lengths".to_string(),
            ));
        }
        let mut sum = KahanSum::new();
        for (start, end, pu, cl) in zip_spans(&parent_upper.regions, &child_lower.regions) {
            let span_len = (end - start + 1) as f64;
            let t_node = branch_length + cl.plength_observation_to_node.unwrap_or(0.0);
            let contribution = match (&pu.kind, &cl.kind) {
                (RegionKind::Unknown, _) | (_, RegionKind::Unknown) => 0.0,
                (RegionKind::Ref, RegionKind::Ref) => {
                    -t_node * model.cumulative_rate_over(start, end + 1)
                }
                (RegionKind::State(a), RegionKind::State(b)) if a == b => {
                    let idx = *a as usize;
                    span_len * t_node * model.rate_matrix[idx][idx]
                }
                (RegionKind::State(a), RegionKind::State(b)) => {
                    let rate = model.rate_matrix[*a as usize][*b as usize];
                    if rate <= 0.0 || t_node <= 0.0 {
                        return Ok(f64::NEG_INFINITY);
                    }
                    span_len * (rate * t_node).ln()
                }
                _ => {
                    // at least one side is `Other`, or a Ref/State pair: evaluate
                    // position by position since `Ref`'s identity depends on the
                    // reference base at each position.
                    let mut acc = 0.0;
                    for pos in start..=end {
                        let upper_vec = evolved_distribution(
                            &pu.kind,
                            pos,
                            pu.plength_observation_to_node.unwrap_or(0.0),
                            pu.plength_observation_to_root,
                            model,
                            Some(reference),
                        );
                        let child_vec = region_point_vector(&cl.kind, pos, model, Some(reference));
                        let dot = linalg::dot_product(&upper_vec, &child_vec);
                        if dot <= UNDERFLOW_FLOOR {
                            return Ok(f64::NEG_INFINITY);
                        }
                        acc += dot.ln();
                    }
                    acc
                }
            };
            sum.add(contribution);
        }
        Ok(sum.total())
    }
}

fn merge_two(
    upper: &RegionList,
    b_u: f64,
    lower: &RegionList,
    b_l: f64,
    model: &Model,
    reference: &Reference,
) -> Result<RegionList, PhyloError> {
    if upper.genome_length != lower.genome_length {
        return Err(PhyloError::InvariantViolation(
            "merge operands cover different genome lengths".to_string(),
        ));
    }
    let genome_length = upper.genome_length;
    let mut output = Vec::new();
    for (start, end, ru, rl) in zip_spans(&upper.regions, &lower.regions) {
        let adjusted_upper = adjust(ru, b_u);
        let adjusted_lower = adjust(rl, b_l);
        output.extend(merge_pair(
            &adjusted_upper,
            &adjusted_lower,
            start,
            end,
            model,
            reference,
        )?);
    }
    RegionList::from_regions(coalesce(output), genome_length)
}

/// Adds the traversed branch length `b` to a region's `plength_observation_to_node`
/// before it participates in a merge or likelihood computation.
fn adjust(region: &Region, b: f64) -> Region {
    let mut adjusted = region.clone();
    adjusted.plength_observation_to_node =
        Some(region.plength_observation_to_node.unwrap_or(0.0) + b);
    adjusted
}

fn merge_pair(
    adjusted_upper: &Region,
    adjusted_lower: &Region,
    start: usize,
    end: usize,
    model: &Model,
    reference: &Reference,
) -> Result<Vec<Region>, PhyloError> {
    use RegionKind::*;
    match (&adjusted_upper.kind, &adjusted_lower.kind) {
        (Unknown, Unknown) => Ok(vec![Region::simple(Unknown, end)]),
        (Unknown, _) => Ok(vec![Region::new(
            adjusted_lower.kind.clone(),
            end,
            adjusted_lower.plength_observation_to_node,
            adjusted_lower.plength_observation_to_root,
        )]),
        (_, Unknown) => Ok(vec![Region::new(
            adjusted_upper.kind.clone(),
            end,
            adjusted_upper.plength_observation_to_node,
            adjusted_upper.plength_observation_to_root,
        )]),
        (Ref, Ref) => Ok(vec![Region::new(
            Ref,
            end,
            Some(
                adjusted_upper.plength_observation_to_node.unwrap_or(0.0)
                    + adjusted_lower.plength_observation_to_node.unwrap_or(0.0),
            ),
            None,
        )]),
        (State(a), State(b))
            if a == b
                && adjusted_upper.plength_observation_to_node
                    == adjusted_lower.plength_observation_to_node
                && adjusted_upper.plength_observation_to_root
                    == adjusted_lower.plength_observation_to_root =>
        {
            Ok(vec![Region::new(
                State(*a),
                end,
                Some(
                    adjusted_upper.plength_observation_to_node.unwrap_or(0.0)
                        + adjusted_lower.plength_observation_to_node.unwrap_or(0.0),
                ),
                None,
            )])
        }
        _ => {
            // disagreement, O involved, or differing plengths: materialize an
            // explicit distribution. Split per-position only when a `Ref` side's
            // identity depends on the reference base at each position.
            let needs_per_position =
                adjusted_upper.kind == Ref || adjusted_lower.kind == Ref;
            if needs_per_position {
                let mut out = Vec::with_capacity(end - start + 1);
                for pos in start..=end {
                    out.push(merge_at_position(
                        adjusted_upper,
                        adjusted_lower,
                        pos,
                        model,
                        reference,
                    )?);
                }
                Ok(out)
            } else {
                Ok(vec![merge_at_position(
                    adjusted_upper,
                    adjusted_lower,
                    end,
                    model,
                    reference,
                )?])
            }
        }
    }
}

fn merge_at_position(
    adjusted_upper: &Region,
    adjusted_lower: &Region,
    pos: usize,
    model: &Model,
    reference: &Reference,
) -> Result<Region, PhyloError> {
    let upper_vec = evolved_distribution(
        &adjusted_upper.kind,
        pos,
        adjusted_upper.plength_observation_to_node.unwrap_or(0.0),
        adjusted_upper.plength_observation_to_root,
        model,
        Some(reference),
    );
    let lower_vec = evolved_distribution(
        &adjusted_lower.kind,
        pos,
        adjusted_lower.plength_observation_to_node.unwrap_or(0.0),
        adjusted_lower.plength_observation_to_root,
        model,
        Some(reference),
    );
    let mut merged = linalg::elementwise_product(&upper_vec, &lower_vec);
    let mass = linalg::normalize_in_place(&mut merged);
    if mass < UNDERFLOW_FLOOR {
        return Err(PhyloError::NumericalUnderflow { mass });
    }
    let kind = match linalg::as_one_hot(&merged, ONE_HOT_TOLERANCE) {
        Some(state) => RegionKind::State(state),
        None => RegionKind::Other(merged),
    };
    Ok(Region::new(kind, pos, None, None))
}

/// The evolved per-state distribution for a region at `pos`, given the total
/// distance to node `t_node` and (if set) distance to root `t_root`. `reference` is
/// required only when `kind` is `Ref` (to resolve the reference base at `pos`).
fn evolved_distribution(
    kind: &RegionKind,
    pos: usize,
    t_node: f64,
    t_root: Option<f64>,
    model: &Model,
    reference: Option<&Reference>,
) -> Vec<f64> {
    let mut v = region_point_vector(kind, pos, model, reference);
    if let Some(t_root) = t_root {
        v = linalg::evolve_forward_root(&v, t_root, &model.root_freqs, &model.rate_matrix_transposed);
    }
    if t_node > 0.0 {
        v = linalg::evolve_forward(&v, t_node, &model.rate_matrix);
    }
    v
}

/// The un-evolved per-state distribution a region represents at a single position:
/// a one-hot vector for `Ref`/`State`, the explicit vector for `Other`, or a flat
/// (uninformative) vector for `Unknown`.
fn region_point_vector(
    kind: &RegionKind,
    pos: usize,
    model: &Model,
    reference: Option<&Reference>,
) -> Vec<f64> {
    match kind {
        RegionKind::Ref => {
            let reference = reference.expect("Ref region requires a reference sequence");
            linalg::one_hot(model.num_states(), reference.state_at(pos))
        }
        RegionKind::State(s) => linalg::one_hot(model.num_states(), *s),
        RegionKind::Other(v) => v.clone(),
        RegionKind::Unknown => vec![1.0; model.num_states()],
    }
}

/// Line-sweeps two region lists' breakpoints, yielding `(start, end, region_a,
/// region_b)` for every maximal sub-span where both sides are constant.
fn zip_spans<'a>(
    a: &'a [Region],
    b: &'a [Region],
) -> Vec<(usize, usize, &'a Region, &'a Region)> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut ia = 0usize;
    let mut ib = 0usize;
    while ia < a.len() && ib < b.len() {
        let end_a = a[ia].position;
        let end_b = b[ib].position;
        let end = end_a.min(end_b);
        out.push((start, end, &a[ia], &b[ib]));
        start = end + 1;
        if end_a == end {
            ia += 1;
        }
        if end_b == end {
            ib += 1;
        }
    }
    out
}

/// Coalesces adjacent regions that carry the same `(type, likelihood, plengths)`,
/// renumbering `position` so each surviving region ends where the last of its
/// merged run ended — required to maintain the RegionList invariant.
fn coalesce(regions: Vec<Region>) -> Vec<Region> {
    let mut out: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        if let Some(last) = out.last_mut() {
            if last.mergeable_with(&region) {
                last.position = region.position;
                continue;
            }
        }
        out.push(region);
    }
    out
}

struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    fn new() -> Self {
        Self {
            sum: 0.0,
            compensation: 0.0,
        }
    }
    fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }
    fn total(&self) -> f64 {
        self.sum
    }
}
