//! S5: empirical re-estimation recovers a known rate matrix from forward-simulated
//! substitution pseudocounts, to within a generous relative tolerance (the model's
//! own family, `Unrest`, imposes no reversibility constraint to fight the recovery).
use approx::assert_relative_eq;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use maple_core::alphabet::Alphabet;
use maple_core::model::{Model, ModelPreset};
use maple_core::reference::Reference;

/// Row-stochastic off-diagonal transition weights used only to drive the simulator;
/// independent of the `Model` under test.
const TRUE_TRANSITIONS: [[f64; 4]; 4] = [
    [0.0, 0.5, 0.3, 0.2],
    [0.2, 0.0, 0.5, 0.3],
    [0.3, 0.2, 0.0, 0.5],
    [0.5, 0.3, 0.2, 0.0],
];

fn sample_destination(rng: &mut SmallRng, from: usize) -> usize {
    let roll: f64 = rng.gen();
    let mut cumulative = 0.0;
    for to in 0..4 {
        cumulative += TRUE_TRANSITIONS[from][to];
        if roll < cumulative {
            return to;
        }
    }
    from
}

#[test]
fn recovers_a_known_rate_matrix_from_simulated_substitutions() {
    let reference = Reference::new(vec![0, 1, 2, 3]).unwrap();
    let mut model = Model::new(&Alphabet::dna(), ModelPreset::Unrest);
    model.extract_ref_info(&reference);

    let mut rng = SmallRng::seed_from_u64(1000);
    for _ in 0..1000 {
        // one simulated sample: every genome position independently substitutes
        // (or not) from its ancestral state under the true transition weights.
        for position in 0..reference.len() {
            let from = reference.state_at(position) as usize;
            let to = sample_destination(&mut rng, from);
            if to != from {
                model.update_pseudocount(from as u8, to as u8);
            }
        }
    }
    model.update_mutation_matrix_empirical().unwrap();

    for i in 0..4 {
        for j in 0..4 {
            if i == j {
                continue;
            }
            assert_relative_eq!(model.rate_matrix[i][j], TRUE_TRANSITIONS[i][j], max_relative = 0.3);
        }
    }
}
