//! vdjinf: probabilistic inference and generation of V(D)J recombination
//! scenarios.
//!
//! Given a target read and a library of germline templates, the crate
//! enumerates the latent recombination scenarios that could have produced
//! the read (template choices, junction trims, inserted nucleotides,
//! hypermutations), weighs each scenario under a factorised model held in a
//! packed marginal tensor, and either re-estimates the model by EM over a
//! corpus or samples fresh reads from it.

pub mod align;
pub mod counters;
pub mod error;
pub mod error_model;
pub mod generate;
pub mod graph;
pub mod infer;
pub mod io;
pub mod marginals;
pub mod nucleotide;
pub mod scratch;

pub use align::{Aligner, Alignment, AlignmentOptions, SubstitutionMatrix};
pub use counters::{Counter, CounterRegistry, LikelihoodCounter};
pub use error::{Result, VdjError};
pub use error_model::ErrorModel;
pub use generate::{GenerationOptions, Generator};
pub use graph::{Event, EventType, GeneClass, ModelParms, SeqSide};
pub use infer::{
    evaluate_sequence, infer, AlignmentBundle, InferenceOptions, SequenceEvaluation,
    SequenceRecord,
};
pub use marginals::{MarginalLayout, Marginals};
