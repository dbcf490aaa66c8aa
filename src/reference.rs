//! The immutable reference sequence.
use crate::alphabet::OrdinaryState;
use crate::error::PhyloError;

/// An immutable reference sequence of ordinary states, constructed once and shared
/// read-only for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    states: Vec<OrdinaryState>,
}

impl Reference {
    pub fn new(states: Vec<OrdinaryState>) -> Result<Self, PhyloError> {
        if states.is_empty() {
            return Err(PhyloError::EmptyInput(
                "reference sequence has zero length".to_string(),
            ));
        }
        Ok(Self { states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state_at(&self, position: usize) -> OrdinaryState {
        self.states[position]
    }

    pub fn states(&self) -> &[OrdinaryState] {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_reference() {
        assert!(Reference::new(vec![]).is_err());
    }

    #[test]
    fn exposes_length_and_states() {
        let reference = Reference::new(vec![0, 1, 2, 3]).unwrap();
        assert_eq!(reference.len(), 4);
        assert_eq!(reference.state_at(2), 2);
    }
}
