//! Error types for the splitplot-lmm library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum LmmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Rank deficiency: {} columns dropped ({}), at most {allowed} allowed", dropped.len(), dropped.join(", "))]
    RankDeficiency { dropped: Vec<String>, allowed: usize },

    #[error(
        "REML did not converge after {iterations} iterations \
         (last estimates: between = {between:.6e}, residual = {residual:.6e})"
    )]
    Convergence {
        iterations: usize,
        between: f64,
        residual: f64,
    },

    #[error("Malformed design: {0}")]
    MalformedDesign(String),

    #[error("Missing column '{0}' in dataset")]
    MissingColumn(String),

    #[error("Invalid value '{value}' at row {row}, column '{column}'")]
    InvalidValue {
        value: String,
        row: usize,
        column: String,
    },

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, LmmError>;
