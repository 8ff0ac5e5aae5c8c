//! Observation-level data for mixed-model fitting.

use crate::error::{LmmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// A covariate value that can be categorical or continuous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical variable with a string level.
    Categorical(String),
    /// Continuous numeric variable.
    Continuous(f64),
    /// Missing value.
    Missing,
}

impl Variable {
    /// Check if this is a missing value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    /// Try to get as categorical string.
    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as continuous f64.
    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }

    /// Level label used when the value is treated as a factor.
    pub fn label(&self) -> Option<String> {
        match self {
            Variable::Categorical(s) => Some(s.clone()),
            Variable::Continuous(v) => Some(number_label(*v)),
            Variable::Missing => None,
        }
    }

    /// Parse a raw field. `None` when a continuous field is present but
    /// not a finite number.
    fn parse(raw: &str, var_type: VariableType) -> Option<Self> {
        let raw = raw.trim();
        if is_missing_token(raw) {
            return Some(Variable::Missing);
        }
        match var_type {
            VariableType::Continuous => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Variable::Continuous),
            VariableType::Categorical => Some(Variable::Categorical(raw.to_string())),
        }
    }
}

/// Label for a numeric level; `-0` and `0` are the same level.
fn number_label(v: f64) -> String {
    if v == 0.0 {
        0.0f64.to_string()
    } else {
        v.to_string()
    }
}

/// Type of a covariate column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Categorical,
    Continuous,
}

fn is_missing_token(raw: &str) -> bool {
    raw.is_empty() || raw == "NA" || raw == "na" || raw == "."
}

/// One subplot measurement: a response and its named covariates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    response: f64,
    values: HashMap<String, Variable>,
}

impl Observation {
    /// Create an observation with no covariates yet.
    pub fn new(response: f64) -> Self {
        Self {
            response,
            values: HashMap::new(),
        }
    }

    /// Attach a continuous covariate.
    pub fn with_continuous(self, name: &str, value: f64) -> Self {
        self.with_value(name, Variable::Continuous(value))
    }

    /// Attach a categorical covariate.
    pub fn with_categorical(self, name: &str, level: impl Into<String>) -> Self {
        self.with_value(name, Variable::Categorical(level.into()))
    }

    /// Attach an arbitrary covariate value.
    pub fn with_value(mut self, name: &str, value: Variable) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Response value.
    pub fn response(&self) -> f64 {
        self.response
    }

    /// Covariate value by column name.
    pub fn get(&self, column: &str) -> Option<&Variable> {
        self.values.get(column)
    }
}

/// An ordered, immutable collection of observations.
///
/// Every observation carries a finite response. Column types are inferred
/// once at construction: a column is continuous when all of its present
/// values are numeric, categorical otherwise.
#[derive(Debug, Clone)]
pub struct Dataset {
    response_name: String,
    column_names: Vec<String>,
    column_types: HashMap<String, VariableType>,
    observations: Vec<Observation>,
}

impl Dataset {
    /// Build a dataset from observations.
    pub fn from_observations(response_name: &str, observations: Vec<Observation>) -> Result<Self> {
        if observations.is_empty() {
            return Err(LmmError::EmptyData("No observations".to_string()));
        }

        let mut column_names: Vec<String> = Vec::new();
        for obs in &observations {
            let mut names: Vec<&String> = obs.values.keys().collect();
            names.sort();
            for name in names {
                if !column_names.contains(name) {
                    column_names.push(name.clone());
                }
            }
        }

        for (row, obs) in observations.iter().enumerate() {
            if !obs.response.is_finite() {
                return Err(LmmError::InvalidValue {
                    value: obs.response.to_string(),
                    row,
                    column: response_name.to_string(),
                });
            }
            for (name, value) in &obs.values {
                if let Variable::Continuous(v) = value {
                    if !v.is_finite() {
                        return Err(LmmError::InvalidValue {
                            value: v.to_string(),
                            row,
                            column: name.clone(),
                        });
                    }
                }
            }
        }

        let mut column_types = HashMap::new();
        for name in &column_names {
            let mut has_numeric = false;
            let mut has_label = false;
            for obs in &observations {
                match obs.values.get(name) {
                    Some(Variable::Continuous(_)) => has_numeric = true,
                    Some(Variable::Categorical(_)) => has_label = true,
                    _ => {}
                }
            }
            if has_numeric && has_label {
                return Err(LmmError::InvalidParameter(format!(
                    "Column '{}' mixes numeric and categorical values",
                    name
                )));
            }
            let var_type = if has_label {
                VariableType::Categorical
            } else {
                VariableType::Continuous
            };
            column_types.insert(name.clone(), var_type);
        }

        Ok(Self {
            response_name: response_name.to_string(),
            column_names,
            column_types,
            observations,
        })
    }

    /// Load a dataset from a delimited file.
    ///
    /// Files ending in `.tsv`, `.tab` or `.txt` are read as tab-separated,
    /// everything else as comma-separated. The first row is the header.
    /// Rows whose response is missing are skipped. A present response
    /// must be a finite number, as must every present value of a numeric
    /// column (`NaN` and `inf` are rejected).
    pub fn from_path<P: AsRef<Path>>(path: P, response: &str) -> Result<Self> {
        let path = path.as_ref();
        let delimiter = match path.extension().and_then(|e| e.to_str()) {
            Some("tsv") | Some("tab") | Some("txt") => b'\t',
            _ => b',',
        };
        let file = std::fs::File::open(path)?;
        Self::from_reader(file, delimiter, response)
    }

    /// Load a dataset from any reader with the given delimiter.
    pub fn from_reader<R: Read>(reader: R, delimiter: u8, response: &str) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let header: Vec<String> = csv_reader.headers()?.iter().map(String::from).collect();
        let response_idx = header
            .iter()
            .position(|h| h == response)
            .ok_or_else(|| LmmError::MissingColumn(response.to_string()))?;

        let mut raw_rows: Vec<Vec<String>> = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            if record.iter().all(|f| f.is_empty()) {
                continue;
            }
            raw_rows.push(record.iter().map(String::from).collect());
        }
        if raw_rows.is_empty() {
            return Err(LmmError::EmptyData("No rows in data file".to_string()));
        }

        let covariate_cols: Vec<usize> = (0..header.len()).filter(|&i| i != response_idx).collect();
        let mut column_types = HashMap::new();
        for &col in &covariate_cols {
            let all_numeric = raw_rows.iter().all(|row| {
                let v = row.get(col).map(|s| s.trim()).unwrap_or("");
                is_missing_token(v) || v.parse::<f64>().is_ok()
            });
            let var_type = if all_numeric {
                VariableType::Continuous
            } else {
                VariableType::Categorical
            };
            column_types.insert(header[col].clone(), var_type);
        }

        let mut observations = Vec::with_capacity(raw_rows.len());
        let mut skipped = 0usize;
        for (row_idx, row) in raw_rows.iter().enumerate() {
            let raw_response = row.get(response_idx).map(|s| s.trim()).unwrap_or("");
            if is_missing_token(raw_response) {
                skipped += 1;
                continue;
            }
            let y = raw_response
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| LmmError::InvalidValue {
                    value: raw_response.to_string(),
                    row: row_idx + 1,
                    column: response.to_string(),
                })?;

            let mut obs = Observation::new(y);
            for &col in &covariate_cols {
                let name = &header[col];
                let raw = row.get(col).map(String::as_str).unwrap_or("");
                let value = Variable::parse(raw, column_types[name]).ok_or_else(|| {
                    LmmError::InvalidValue {
                        value: raw.trim().to_string(),
                        row: row_idx + 1,
                        column: name.clone(),
                    }
                })?;
                obs = obs.with_value(name, value);
            }
            observations.push(obs);
        }

        if skipped > 0 {
            warn!("Skipped {} rows with a missing response", skipped);
        }
        debug!(
            "Loaded {} observations with {} covariates",
            observations.len(),
            covariate_cols.len()
        );

        let column_names = covariate_cols.iter().map(|&c| header[c].clone()).collect();
        if observations.is_empty() {
            return Err(LmmError::EmptyData(format!(
                "No observations with a non-missing '{}'",
                response
            )));
        }

        Ok(Self {
            response_name: response.to_string(),
            column_names,
            column_types,
            observations,
        })
    }

    /// Override inferred column types, re-interpreting the stored values.
    ///
    /// Forcing a categorical column to continuous fails on the first label
    /// that is not a finite number.
    pub fn with_column_types(mut self, types: HashMap<String, VariableType>) -> Result<Self> {
        for (col_name, var_type) in &types {
            self.column_types.insert(col_name.clone(), *var_type);
            for (row, obs) in self.observations.iter_mut().enumerate() {
                if let Some(var) = obs.values.get_mut(col_name) {
                    *var = match (&*var, var_type) {
                        (Variable::Categorical(s), VariableType::Continuous) => {
                            Variable::parse(s, VariableType::Continuous).ok_or_else(|| {
                                LmmError::InvalidValue {
                                    value: s.clone(),
                                    row: row + 1,
                                    column: col_name.clone(),
                                }
                            })?
                        }
                        (Variable::Continuous(v), VariableType::Categorical) => {
                            Variable::Categorical(number_label(*v))
                        }
                        (other, _) => other.clone(),
                    };
                }
            }
        }
        Ok(self)
    }

    /// Write the dataset as a delimited file, response first.
    pub fn write_delimited<P: AsRef<Path>>(&self, path: P, delimiter: u8) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)?;

        let mut header = vec![self.response_name.as_str()];
        header.extend(self.column_names.iter().map(String::as_str));
        writer.write_record(&header)?;

        for obs in &self.observations {
            let mut record = vec![obs.response.to_string()];
            for name in &self.column_names {
                let field = obs
                    .values
                    .get(name)
                    .and_then(Variable::label)
                    .unwrap_or_else(|| "NA".to_string());
                record.push(field);
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Name of the response column.
    pub fn response_name(&self) -> &str {
        &self.response_name
    }

    /// Covariate column names.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Observations in order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of observations.
    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    /// Whether the dataset has no observations.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Response values in observation order.
    pub fn response(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.response).collect()
    }

    /// Check if a covariate column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }

    /// Get the type of a column.
    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Get all values for a column.
    pub fn column(&self, column: &str) -> Result<Vec<&Variable>> {
        if !self.has_column(column) {
            return Err(LmmError::MissingColumn(column.to_string()));
        }
        Ok(self
            .observations
            .iter()
            .map(|o| o.values.get(column).unwrap_or(&Variable::Missing))
            .collect())
    }

    /// Distinct levels of a column, in sorted order.
    ///
    /// Categorical columns sort lexically; continuous columns sort
    /// numerically and are labelled with their value.
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let values = self.column(column)?;
        match self.column_type(column) {
            Some(VariableType::Continuous) => {
                let mut numbers: Vec<f64> = values
                    .iter()
                    .filter_map(|v| v.as_continuous())
                    .map(|v| if v == 0.0 { 0.0 } else { v })
                    .collect();
                numbers.sort_by(|a, b| a.total_cmp(b));
                numbers.dedup();
                Ok(numbers.iter().map(|&v| number_label(v)).collect())
            }
            _ => Ok(values
                .iter()
                .filter_map(|v| v.as_categorical().map(String::from))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()),
        }
    }
}
