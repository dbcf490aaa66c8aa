//! Black-box scenarios exercising the placement/SPR/likelihood engine end to end.
use approx::assert_relative_eq;

use maple_core::alphabet::Alphabet;
use maple_core::config::Config;
use maple_core::engine::Engine;
use maple_core::error::PhyloError;
use maple_core::model::{Model, ModelPreset};
use maple_core::reference::Reference;
use maple_core::region::{Mutation, Region, RegionKind};
use maple_core::region_list::RegionList;

fn dna_reference(states: Vec<u8>) -> Reference {
    Reference::new(states).unwrap()
}

/// Reference "ACGT", two samples (one identical, one a single C->... at position 0):
/// placement yields a two-leaf tree with both external branches at least
/// `min_blength`, and the tree's single internal merge is well formed.
#[test]
fn two_samples_against_a_four_base_reference() {
    let reference = dna_reference(vec![0, 1, 2, 3]);
    let config = Config::builder().with_genome_length(4).build().unwrap();
    let min_blength = config.min_blength;
    let mut engine = Engine::new(reference, config).unwrap();

    engine.add_sample("identical".to_string(), &[]).unwrap();
    engine
        .add_sample("mutant".to_string(), &[Mutation::new(RegionKind::State(1), 0, 1)])
        .unwrap();

    let newick = engine.export_newick().unwrap();
    assert!(newick.contains("identical"));
    assert!(newick.contains("mutant"));
    assert!(newick.starts_with('('));

    // both external branch lengths appear in the Newick string and are at least
    // min_blength; a crude but dependency-free check since the exporter doesn't
    // expose a parser.
    for piece in newick.split(':').skip(1) {
        let digits: String = piece.chars().take_while(|c| !matches!(c, ',' | ')' | ';')).collect();
        let value: f64 = digits.parse().unwrap();
        assert!(value + 1e-12 >= min_blength);
    }
}

/// Ten identical samples against a longer reference degenerate to a caterpillar of
/// effectively-zero (clamped to `min_blength`) branches, and SPR finds nothing to
/// improve.
#[test]
fn ten_identical_samples_make_no_spr_moves() {
    let reference = dna_reference((0..100).map(|i| (i % 4) as u8).collect());
    let config = Config::builder().with_genome_length(100).build().unwrap();
    let mut engine = Engine::new(reference, config).unwrap();

    for i in 0..10 {
        engine.add_sample(format!("s{i}"), &[]).unwrap();
    }
    let applied = engine.run_spr().unwrap();
    assert_eq!(applied, 0);
}

/// Three samples, each differing from a long reference at one distinct position:
/// no single pair should be clustered so much more tightly than the others that the
/// tree stops looking star-like (here: checked by the external-branch lengths for
/// all three samples coming out within the same order of magnitude).
#[test]
fn three_singly_divergent_samples_form_a_near_star() {
    let reference = dna_reference((0..1000).map(|i| (i % 4) as u8).collect());
    let config = Config::builder().with_genome_length(1000).build().unwrap();
    let mut engine = Engine::new(reference, config).unwrap();

    engine
        .add_sample("a".to_string(), &[Mutation::new(RegionKind::State(1), 0, 1)])
        .unwrap();
    engine
        .add_sample("b".to_string(), &[Mutation::new(RegionKind::State(2), 500, 1)])
        .unwrap();
    engine
        .add_sample("c".to_string(), &[Mutation::new(RegionKind::State(3), 999, 1)])
        .unwrap();

    let newick = engine.export_newick().unwrap();
    let blengths: Vec<f64> = newick
        .split(':')
        .skip(1)
        .map(|piece| {
            let digits: String = piece.chars().take_while(|c| *c != ',' && *c != ')' && *c != ';').collect();
            digits.parse::<f64>().unwrap()
        })
        .collect();
    let max = blengths.iter().cloned().fold(f64::MIN, f64::max);
    let min = blengths.iter().cloned().fold(f64::MAX, f64::min);
    assert!(max / min.max(1e-12) < 1e6, "branch lengths span too many orders of magnitude for a near-star: {blengths:?}");
}

/// A merge between two fully-disagreeing `Other` distributions across a
/// vanishingly short branch underflows, and the error is the recoverable
/// `NumericalUnderflow` kind, not a fatal one.
#[test]
fn maximally_disagreeing_merge_on_a_tiny_branch_underflows() {
    let reference = dna_reference(vec![0]);
    let mut model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
    model.extract_ref_info(&reference);
    model.compute_cumulative_rate(&reference);

    let a = RegionList::from_regions(
        vec![Region::simple(RegionKind::Other(vec![1e-160, 1e-160, 1e-160, 1e-160]), 0)],
        1,
    )
    .unwrap();
    let b = RegionList::from_regions(
        vec![Region::simple(RegionKind::Other(vec![1e-160, 1e-160, 1e-160, 1e-160]), 0)],
        1,
    )
    .unwrap();

    let err = RegionList::merge_upper_lower(&a, 1e-20, &b, 1e-20, &model, &reference).unwrap_err();
    assert!(matches!(err, PhyloError::NumericalUnderflow { .. }));
    assert!(!err.is_fatal());
}

/// Under the JC model with uniform root frequencies, the log-likelihood of any
/// region list against itself at branch length 0 is exactly 0: there is nothing to
/// explain away when the observation is the node itself and no evolution occurs.
#[test]
fn self_log_lh_at_zero_branch_length_is_zero() {
    let reference = dna_reference(vec![0, 1, 2, 3, 0, 1, 2, 3]);
    let mut model = Model::new(&Alphabet::dna(), ModelPreset::Jc);
    model.extract_ref_info(&reference);
    model.compute_cumulative_rate(&reference);

    let samples = [
        RegionList::from_mutations(&[], 8).unwrap(),
        RegionList::from_mutations(&[Mutation::new(RegionKind::State(2), 3, 1)], 8).unwrap(),
    ];
    for sample in &samples {
        let lh = RegionList::log_lh(sample, sample, 0.0, &model, &reference).unwrap();
        assert_relative_eq!(lh, 0.0, epsilon = 1e-9);
    }
}
