//! Top-level orchestration: wires the reference, model, and tree together into the
//! add-sample / refine / export workflow described in §4.5.
use crate::config::Config;
use crate::error::PhyloError;
use crate::model::{Model, ModelPreset};
use crate::newick;
use crate::reference::Reference;
use crate::region::Mutation;
use crate::region_list::RegionList;
use crate::tree::placement::{place_new_sample, seek_sample_placement};
use crate::tree::refresh::{new_dirty_set, refresh_all_lowers_postorder, refresh_all_uppers_preorder, update_partial_lh};
use crate::tree::spr::improve_entire_tree;
use crate::tree::{NodeId, Tree};

/// Drives incremental placement of samples onto a growing tree, periodic empirical
/// re-estimation of the substitution model, and final SPR refinement.
pub struct Engine {
    config: Config,
    model: Model,
    reference: Reference,
    tree: Option<Tree>,
    samples_since_last_update: usize,
    samples_placed: usize,
}

impl Engine {
    /// Builds an engine for `reference` under `config`. `config.model_preset`
    /// selects the initial rate matrix; root frequencies are extracted from
    /// `reference` immediately.
    pub fn new(reference: Reference, config: Config) -> Result<Self, PhyloError> {
        let alphabet = crate::alphabet::Alphabet::dna();
        let mut model = Model::new(&alphabet, config.model_preset);
        model.extract_ref_info(&reference);
        model.compute_cumulative_rate(&reference);
        log::debug!(
            "engine initialized: genome_length={}, model_preset={:?}",
            reference.len(),
            config.model_preset
        );
        Ok(Self {
            config,
            model,
            reference,
            tree: None,
            samples_since_last_update: 0,
            samples_placed: 0,
        })
    }

    pub fn preset(&self) -> ModelPreset {
        self.model.preset()
    }

    pub fn samples_placed(&self) -> usize {
        self.samples_placed
    }

    /// Adds one sample, given as already-parsed [`Mutation`]s against the reference.
    /// The first sample seeds the tree as its sole leaf; every subsequent sample is
    /// placed via [`seek_sample_placement`]. Periodically (every
    /// `config.pseudocount_update_interval` samples) re-estimates the substitution
    /// model from the pseudocounts accumulated by placement.
    pub fn add_sample(&mut self, name: String, mutations: &[Mutation]) -> Result<NodeId, PhyloError> {
        let regions = RegionList::from_mutations(mutations, self.reference.len())?;
        let placed_id = match self.tree.take() {
            None => {
                let mut tree = Tree::new_single_leaf(name, regions);
                refresh_all_lowers_postorder(&mut tree, &self.model, &self.reference)?;
                refresh_all_uppers_preorder(&mut tree, &self.model, &self.reference)?;
                let root = tree.root();
                self.tree = Some(tree);
                root
            }
            Some(mut tree) => {
                let placement = seek_sample_placement(&tree, &regions, &self.model, &self.reference, &self.config)?;
                self.accumulate_pseudocounts(&tree, &placement, &regions);
                let leaf = place_new_sample(&mut tree, name, regions, &placement, &self.model, &self.reference)?;
                self.tree = Some(tree);
                leaf
            }
        };

        self.samples_placed += 1;
        self.samples_since_last_update += 1;
        if self.samples_since_last_update >= self.config.pseudocount_update_interval {
            self.refresh_model()?;
        }
        Ok(placed_id)
    }

    /// Updates the pseudocount accumulator from a placement: for every genome
    /// position where the placement target's resolved state and the incoming
    /// sample's resolved state are both ordinary (unambiguous) and differ, counts one
    /// substitution. Positions involving `N`/`O` are skipped, per §4.2.
    fn accumulate_pseudocounts(
        &mut self,
        tree: &Tree,
        placement: &crate::tree::placement::Placement,
        sample: &RegionList,
    ) {
        let Some(target_lower) = &tree.node(placement.target).lower else {
            return;
        };
        for position in 0..self.reference.len() {
            let (Some(node_state), Some(sample_state)) = (
                target_lower.resolved_state_at(position, &self.reference),
                sample.resolved_state_at(position, &self.reference),
            ) else {
                continue;
            };
            self.model.update_pseudocount(node_state, sample_state);
        }
    }

    /// Re-estimates the substitution model from accumulated pseudocounts and marks
    /// every cached region list in the tree for recomputation, since they were all
    /// computed under the previous rate matrix. On [`PhyloError::ModelSingularity`],
    /// the previous matrix is kept (per [`Model::update_mutation_matrix_empirical`])
    /// and the tree's caches are left untouched.
    fn refresh_model(&mut self) -> Result<(), PhyloError> {
        self.samples_since_last_update = 0;
        match self.model.update_mutation_matrix_empirical() {
            Ok(()) => {
                log::debug!("periodic model re-estimation succeeded after {} samples", self.samples_placed);
                self.model.compute_cumulative_rate(&self.reference);
                self.invalidate_all_caches()?;
                Ok(())
            }
            Err(err) if !err.is_fatal() => {
                log::warn!("periodic model re-estimation skipped: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn invalidate_all_caches(&mut self) -> Result<(), PhyloError> {
        let Some(tree) = &mut self.tree else {
            return Ok(());
        };
        let root = tree.root();
        let mut dirty = new_dirty_set();
        dirty.insert(root);
        tree.invalidate_path_to_root(root);
        update_partial_lh(tree, &mut dirty, &self.model, &self.reference)?;
        refresh_all_lowers_postorder(tree, &self.model, &self.reference)?;
        refresh_all_uppers_preorder(tree, &self.model, &self.reference)?;
        Ok(())
    }

    /// Runs SPR refinement to convergence (or `config.max_spr_sweeps`), then performs
    /// one final model re-estimation pass, per §4.5.
    pub fn run_spr(&mut self) -> Result<usize, PhyloError> {
        let Some(tree) = &mut self.tree else {
            return Ok(0);
        };
        let applied = improve_entire_tree(tree, &self.model, &self.reference, &self.config)?;
        log::debug!("SPR refinement applied {applied} moves");
        self.refresh_model()?;
        Ok(applied)
    }

    /// Renders the current tree as Newick. `Err` if no sample has been added yet.
    pub fn export_newick(&self) -> Result<String, PhyloError> {
        let tree = self
            .tree
            .as_ref()
            .ok_or_else(|| PhyloError::EmptyInput("no samples have been placed yet".to_string()))?;
        Ok(newick::export_newick(tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;

    fn reference() -> Reference {
        Reference::new(vec![0, 1, 2, 3]).unwrap()
    }

    #[test]
    fn first_sample_seeds_the_tree_as_a_single_leaf() {
        let config = Config::builder().with_genome_length(4).build().unwrap();
        let mut engine = Engine::new(reference(), config).unwrap();
        engine.add_sample("a".to_string(), &[]).unwrap();
        assert_eq!(engine.samples_placed(), 1);
        assert_eq!(engine.export_newick().unwrap(), "a;");
    }

    #[test]
    fn second_sample_produces_a_cherry() {
        let config = Config::builder().with_genome_length(4).build().unwrap();
        let mut engine = Engine::new(reference(), config).unwrap();
        engine.add_sample("a".to_string(), &[]).unwrap();
        engine
            .add_sample("b".to_string(), &[Mutation::new(RegionKind::State(1), 0, 1)])
            .unwrap();
        let newick = engine.export_newick().unwrap();
        assert!(newick.contains('a') && newick.contains('b'));
    }

    #[test]
    fn run_spr_on_a_small_tree_does_not_error() {
        let config = Config::builder().with_genome_length(4).build().unwrap();
        let mut engine = Engine::new(reference(), config).unwrap();
        engine.add_sample("a".to_string(), &[]).unwrap();
        engine
            .add_sample("b".to_string(), &[Mutation::new(RegionKind::State(1), 0, 1)])
            .unwrap();
        engine
            .add_sample("c".to_string(), &[Mutation::new(RegionKind::State(2), 1, 1)])
            .unwrap();
        engine.run_spr().unwrap();
        let newick = engine.export_newick().unwrap();
        assert!(newick.ends_with(";"));
    }
}
