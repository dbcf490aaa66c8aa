//! The substitution model: root frequencies, rate matrix, and the pseudocount-driven
//! empirical refinement loop.
use crate::alphabet::Alphabet;
use crate::error::PhyloError;
use crate::reference::Reference;

/// Named rate-matrix presets. `Gtr` and `Unrest` differ in whether
/// [`Model::update_mutation_matrix_empirical`] enforces time-reversibility
/// (`Q[i][j]·π_i = Q[j][i]·π_j`) when re-estimating from pseudocounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPreset {
    /// Jukes-Cantor: equal rates between every pair of states.
    Jc,
    /// General Time Reversible: six (DNA) or `num_states·(num_states-1)/2` pairwise
    /// rates, constrained to be reversible w.r.t. the root frequencies.
    Gtr,
    /// Unrestricted: up to `num_states·(num_states-1)` independent rates, no
    /// reversibility constraint.
    Unrest,
}

/// Root frequencies, rate matrix (and its transpose), pseudocount accumulator, and
/// the per-position cumulative-rate table used by [`crate::region_list`].
#[derive(Debug, Clone)]
pub struct Model {
    num_states: usize,
    preset: ModelPreset,
    pub root_freqs: Vec<f64>,
    pub root_log_freqs: Vec<f64>,
    pub rate_matrix: Vec<Vec<f64>>,
    pub rate_matrix_transposed: Vec<Vec<f64>>,
    pseudocount: Vec<Vec<f64>>,
    cumulative_rate: Vec<f64>,
}

impl Model {
    /// Builds a model with uniform root frequencies and the given preset's initial
    /// rate matrix. Call [`Model::extract_ref_info`] afterwards to set empirical root
    /// frequencies from an actual reference.
    pub fn new(alphabet: &Alphabet, preset: ModelPreset) -> Self {
        let n = alphabet.num_states();
        let root_freqs = vec![1.0 / n as f64; n];
        let mut model = Self {
            num_states: n,
            preset,
            root_log_freqs: root_freqs.iter().map(|f| f.ln()).collect(),
            root_freqs,
            rate_matrix: vec![vec![0.0; n]; n],
            rate_matrix_transposed: vec![vec![0.0; n]; n],
            pseudocount: vec![vec![0.0; n]; n],
            cumulative_rate: Vec::new(),
        };
        model.init_mutation_matrix(preset);
        model
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn preset(&self) -> ModelPreset {
        self.preset
    }

    /// Sets `root_freqs` to the empirical base frequencies of `reference`, with
    /// Laplace (add-one) smoothing, and recomputes `root_log_freqs`.
    pub fn extract_ref_info(&mut self, reference: &Reference) {
        let mut counts = vec![1.0_f64; self.num_states];
        for &s in reference.states() {
            counts[s as usize] += 1.0;
        }
        let total: f64 = counts.iter().sum();
        self.root_freqs = counts.iter().map(|c| c / total).collect();
        self.root_log_freqs = self.root_freqs.iter().map(|f| f.ln()).collect();
        log::debug!(
            "extracted root frequencies from reference of length {}: {:?}",
            reference.len(),
            self.root_freqs
        );
    }

    /// Initializes the rate matrix from `preset`. `Jc`/`Unrest` start from equal
    /// off-diagonal rates; `Gtr` starts from frequency-weighted rates (the
    /// reversible special case with uniform exchangeabilities), since the true
    /// exchangeabilities are only discoverable from data via
    /// [`Model::update_mutation_matrix_empirical`].
    pub fn init_mutation_matrix(&mut self, preset: ModelPreset) {
        self.preset = preset;
        let n = self.num_states;
        let mut q = vec![vec![0.0; n]; n];
        match preset {
            ModelPreset::Jc | ModelPreset::Unrest => {
                let off_diag = 1.0 / (n as f64 - 1.0);
                for i in 0..n {
                    for j in 0..n {
                        if i != j {
                            q[i][j] = off_diag;
                        }
                    }
                }
            }
            ModelPreset::Gtr => {
                for i in 0..n {
                    for j in 0..n {
                        if i != j {
                            q[i][j] = self.root_freqs[j];
                        }
                    }
                }
            }
        }
        for i in 0..n {
            let row_sum: f64 = (0..n).filter(|&j| j != i).map(|j| q[i][j]).sum();
            q[i][i] = -row_sum;
        }
        self.rate_matrix_transposed = transpose(&q);
        self.rate_matrix = q;
    }

    /// Produces the length-`(L+1)` prefix sum `cumsum[i] = Σ_{k<i} -Q[ref[k],ref[k]]`.
    pub fn compute_cumulative_rate(&mut self, reference: &Reference) {
        let mut cumsum = Vec::with_capacity(reference.len() + 1);
        cumsum.push(0.0);
        let mut acc = 0.0;
        for &s in reference.states() {
            acc += -self.rate_matrix[s as usize][s as usize];
            cumsum.push(acc);
        }
        self.cumulative_rate = cumsum;
    }

    /// Total expected rate over the half-open span `[start, end)` of reference
    /// positions, in O(1) via the precomputed prefix sum.
    pub fn cumulative_rate_over(&self, start: usize, end: usize) -> f64 {
        self.cumulative_rate[end] - self.cumulative_rate[start]
    }

    /// Adds 1 to `pseudocount[a][b]` for every position where the node's inferred
    /// state is `a` and the sample observation is the differing ordinary state `b`.
    /// Positions where either side is `N` or `O` (ambiguous) are skipped: only clean
    /// ordinary-state substitutions contribute to the empirical rate estimate.
    pub fn update_pseudocount(&mut self, node_state: u8, sample_state: u8) {
        if node_state != sample_state {
            self.pseudocount[node_state as usize][sample_state as usize] += 1.0;
        }
    }

    /// Re-estimates the rate matrix from the pseudocount accumulator. `Gtr` enforces
    /// reversibility (`Q[i][j]·π_i = Q[j][i]·π_j`, by averaging the two directions'
    /// implied rates); `Unrest` uses the raw empirical transition rates directly;
    /// `Jc` is never re-estimated (it stays at equal rates by definition).
    ///
    /// On [`PhyloError::ModelSingularity`] (a zero row or non-finite entry in the
    /// candidate matrix), the previous rate matrix is retained and the pseudocount
    /// accumulator is left untouched so the next periodic attempt has more data.
    pub fn update_mutation_matrix_empirical(&mut self) -> Result<(), PhyloError> {
        if matches!(self.preset, ModelPreset::Jc) {
            return Ok(());
        }
        let n = self.num_states;
        let row_totals: Vec<f64> = self.pseudocount.iter().map(|row| row.iter().sum()).collect();
        let mut candidate = vec![vec![0.0; n]; n];
        for i in 0..n {
            if row_totals[i] <= 0.0 {
                continue;
            }
            for j in 0..n {
                if i == j {
                    continue;
                }
                candidate[i][j] = self.pseudocount[i][j] / row_totals[i];
            }
        }
        if matches!(self.preset, ModelPreset::Gtr) {
            for i in 0..n {
                for j in (i + 1)..n {
                    let forward = candidate[i][j] * self.root_freqs[i];
                    let backward = candidate[j][i] * self.root_freqs[j];
                    let symmetrized = (forward + backward) / 2.0;
                    candidate[i][j] = symmetrized / self.root_freqs[i].max(f64::MIN_POSITIVE);
                    candidate[j][i] = symmetrized / self.root_freqs[j].max(f64::MIN_POSITIVE);
                }
            }
        }
        for i in 0..n {
            let row_sum: f64 = (0..n).filter(|&j| j != i).map(|j| candidate[i][j]).sum();
            candidate[i][i] = -row_sum;
        }

        for row in &candidate {
            if row.iter().all(|&x| x == 0.0) {
                return Err(PhyloError::ModelSingularity(
                    "re-estimated rate matrix has an all-zero row".to_string(),
                ));
            }
            if row.iter().any(|x| !x.is_finite()) {
                return Err(PhyloError::ModelSingularity(
                    "re-estimated rate matrix has a non-finite entry".to_string(),
                ));
            }
        }

        log::debug!("re-estimated rate matrix from {} pseudocounts", row_totals.iter().sum::<f64>());
        self.rate_matrix_transposed = transpose(&candidate);
        self.rate_matrix = candidate;
        Ok(())
    }

    pub fn pseudocount_total(&self) -> f64 {
        self.pseudocount.iter().flatten().sum()
    }
}

fn transpose(m: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = m.len();
    let mut t = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            t[j][i] = m[i][j];
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jc_rows_sum_to_zero() {
        let model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
        for row in &model.rate_matrix {
            let sum: f64 = row.iter().sum();
            assert!(sum.abs() < 1e-12, "row did not sum to zero: {:?}", row);
        }
    }

    #[test]
    fn extract_ref_info_gives_positive_frequencies_summing_to_one() {
        let mut model = Model::new(&Alphabet::dna(), ModelPreset::Gtr);
        let reference = Reference::new(vec![0, 0, 0, 1, 2, 3]).unwrap();
        model.extract_ref_info(&reference);
        let sum: f64 = model.root_freqs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(model.root_freqs.iter().all(|&f| f > 0.0));
    }

    #[test]
    fn jc_empirical_update_is_a_noop() {
        let mut model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
        let before = model.rate_matrix.clone();
        model.update_pseudocount(0, 1);
        model.update_mutation_matrix_empirical().unwrap();
        assert_eq!(before, model.rate_matrix);
    }

    #[test]
    fn singularity_falls_back_to_previous_matrix() {
        let mut model = Model::new(&Alphabet::dna(), ModelPreset::Unrest);
        let before = model.rate_matrix.clone();
        // no pseudocounts at all -> every row total is zero -> all-zero candidate rows
        let err = model.update_mutation_matrix_empirical().unwrap_err();
        assert!(matches!(err, PhyloError::ModelSingularity(_)));
        assert_eq!(before, model.rate_matrix);
    }

    #[test]
    fn cumulative_rate_is_monotone_non_decreasing() {
        let mut model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
        let reference = Reference::new(vec![0, 1, 2, 3, 0, 1]).unwrap();
        model.compute_cumulative_rate(&reference);
        assert_eq!(model.cumulative_rate.len(), reference.len() + 1);
        for w in model.cumulative_rate.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }
}
