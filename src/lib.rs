//! A maximum-likelihood phylogenetic placement and SPR refinement engine for
//! closely related sequences (epidemic/outbreak-scale genomic surveillance), using
//! MAPLE's run-length-encoded partial-likelihood representation and first-order
//! `(I + Q·t)` branch evolution in place of a full matrix exponential.
//!
//! ## Quick usage
//!
//! ```rust
//! use maple_core::alphabet::Alphabet;
//! use maple_core::config::Config;
//! use maple_core::engine::Engine;
//! use maple_core::reference::Reference;
//! use maple_core::region::{Mutation, RegionKind};
//!
//! let reference = Reference::new(vec![0, 1, 2, 3]).unwrap();
//! let config = Config::builder().with_genome_length(reference.len()).build().unwrap();
//! let mut engine = Engine::new(reference, config).unwrap();
//!
//! engine.add_sample("root".to_string(), &[]).unwrap();
//! engine
//!     .add_sample("variant".to_string(), &[Mutation::new(RegionKind::State(1), 0, 1)])
//!     .unwrap();
//! engine.run_spr().unwrap();
//!
//! println!("{}", engine.export_newick().unwrap());
//! let _ = Alphabet::dna();
//! ```
pub mod alphabet;
pub mod config;
pub mod engine;
pub mod error;
pub mod linalg;
pub mod model;
pub mod newick;
pub mod reference;
pub mod region;
pub mod region_list;
pub mod tree;
