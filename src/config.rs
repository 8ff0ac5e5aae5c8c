//! Serializable analysis configuration.
//!
//! An [`AnalysisConfig`] names a data file, its response column, a mixed
//! formula and fitting options, so a whole analysis can be stored as YAML
//! and rerun.
//!
//! ```yaml
//! name: yield_trial
//! data: field.csv
//! response: y
//! formula: "y ~ A + B + I(A^2) + I(B^2) + A:B + C + (1 | rep:A:B)"
//! fit:
//!   coding: sum
//!   max_iter: 100
//! output: text
//! ```

use crate::data::Dataset;
use crate::error::{LmmError, Result};
use crate::model::{fit_formula, FittedModel, LmmConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Report format for a fitted model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Human-readable summary.
    #[default]
    Text,
    /// Full fitted model as JSON.
    Json,
    /// Coefficient table as tab-separated values.
    Tsv,
}

impl FromStr for OutputFormat {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "tsv" => Ok(OutputFormat::Tsv),
            other => Err(LmmError::InvalidParameter(format!(
                "Unknown output format '{}', expected text, json or tsv",
                other
            ))),
        }
    }
}

/// A complete, rerunnable analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Name of the analysis.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Delimited data file. Relative paths resolve against the config file.
    pub data: PathBuf,
    /// Response column.
    pub response: String,
    /// Mixed formula, e.g. `y ~ A + C + (1 | rep:A)`.
    pub formula: String,
    /// Fitting options; defaults when omitted.
    #[serde(default)]
    pub fit: LmmConfig,
    #[serde(default)]
    pub output: OutputFormat,
}

impl AnalysisConfig {
    /// Create a config with default fitting options.
    pub fn new(name: &str, data: impl Into<PathBuf>, response: &str, formula: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            data: data.into(),
            response: response.to_string(),
            formula: formula.to_string(),
            fit: LmmConfig::default(),
            output: OutputFormat::Text,
        }
    }

    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(LmmError::from)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(LmmError::from)
    }

    /// Load from a YAML file, resolving a relative data path against the
    /// file's directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::from_yaml(&std::fs::read_to_string(path)?)?;
        if config.data.is_relative() {
            if let Some(parent) = path.parent() {
                config.data = parent.join(&config.data);
            }
        }
        Ok(config)
    }

    /// Load the data and fit the model.
    pub fn run(&self) -> Result<FittedModel> {
        let dataset = Dataset::from_path(&self.data, &self.response)?;
        fit_formula(&dataset, &self.formula, &self.fit)
    }

    /// Render a fitted model in the configured format.
    pub fn render(&self, model: &FittedModel) -> Result<String> {
        render(model, self.output)
    }
}

/// Render a fitted model as text, JSON or a coefficient TSV.
pub fn render(model: &FittedModel, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(model.to_string()),
        OutputFormat::Json => model.to_json(),
        OutputFormat::Tsv => Ok(model.coefficients_tsv()),
    }
}
