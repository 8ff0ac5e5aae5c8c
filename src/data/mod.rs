//! Data structures for split-plot mixed model analysis.

mod dataset;
mod design_matrix;
mod random_effects;
pub(crate) mod specification;

pub use dataset::{Dataset, Observation, Variable, VariableType};
pub use design_matrix::{Coding, DesignMatrix};
pub use random_effects::{GroupingKey, MixedFormula, RandomDesignMatrix, RandomEffect};
pub use specification::{DesignSpecification, Factor, Term, Transform};
