//! Model fitting: fixed-effect design reduction, REML variance
//! components and the assembled split-plot fit.

pub mod lm;
pub mod lmm;
pub mod rank;
pub(crate) mod reml;

pub use lm::{model_lm, LmFit, SequentialRow};
pub use lmm::{fit, fit_formula, fit_many, FitWarning, FittedModel, GroupEffect, LmmConfig};
pub use rank::{independent_columns, ColumnSelection};
pub use reml::VarianceComponents;
