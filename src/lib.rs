//! Split-plot linear mixed models.
//!
//! Fits `y = Xβ + Zu + ε` with a single random intercept per whole plot,
//! estimating the variance components by REML and testing the fixed
//! effects with a sequential (Type I) ANOVA and per-coefficient t-tests
//! using Satterthwaite denominator degrees of freedom.
//!
//! # Overview
//!
//! - **data**: observations, design specifications, design matrices and
//!   whole-plot grouping
//! - **model**: rank reduction, REML estimation and the assembled fit
//! - **test**: Satterthwaite df, coefficient t-tests and the ANOVA table
//! - **benchmark**: synthetic split-plot data with known truth
//! - **config**: YAML analysis configuration
//!
//! # Example
//!
//! ```no_run
//! use splitplot_lmm::prelude::*;
//!
//! let data = Dataset::from_path("field.csv", "y").unwrap();
//! let spec = DesignSpecification::parse("~ A + B + I(A^2) + I(B^2) + A:B + C").unwrap();
//! let grouping = GroupingKey::parse("rep:A:B").unwrap();
//!
//! let model = fit(&data, &spec, &grouping, &LmmConfig::default()).unwrap();
//! for row in &model.anova.rows {
//!     println!("{}: F = {:.3} on {} and {:.1} df", row.term, row.f_value, row.num_df, row.den_df);
//! }
//! ```

pub mod benchmark;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::benchmark::{
        generate_random_intercept, generate_split_plot, RandomInterceptConfig, SplitPlotConfig,
        SplitPlotEffects, SyntheticSplitPlot,
    };
    pub use crate::config::{AnalysisConfig, OutputFormat};
    pub use crate::data::{
        Coding, Dataset, DesignMatrix, DesignSpecification, GroupingKey, MixedFormula,
        Observation, RandomDesignMatrix, Variable, VariableType,
    };
    pub use crate::error::{LmmError, Result};
    pub use crate::model::{
        fit, fit_formula, fit_many, model_lm, FitWarning, FittedModel, GroupEffect, LmFit,
        LmmConfig, VarianceComponents,
    };
    pub use crate::test::{AnovaRow, AnovaTable, CoefficientTest};
}
