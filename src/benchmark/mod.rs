//! Synthetic datasets with known fixed effects and variance components.
//!
//! Used to check that estimates recover the generating values and to
//! produce example inputs for the command-line tool.

mod generate;

pub use generate::{
    generate_random_intercept, generate_split_plot, RandomInterceptConfig, SplitPlotConfig,
    SplitPlotEffects, SyntheticSplitPlot,
};
