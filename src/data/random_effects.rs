//! Random intercept specification and its design matrix.
//!
//! Only a single random intercept is supported, written lme4-style:
//! - `(1 | plot)` - random intercept per plot
//! - `(1 | rep:A:B)` - random intercept per whole plot identified by a tuple

use crate::data::specification::split_top_level;
use crate::data::{Dataset, DesignSpecification};
use crate::error::{LmmError, Result};
use nalgebra::DMatrix;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered tuple of column names that identifies a whole-plot unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingKey {
    pub components: Vec<String>,
}

impl GroupingKey {
    pub fn new<S: AsRef<str>>(components: &[S]) -> Result<Self> {
        let components: Vec<String> = components
            .iter()
            .map(|c| c.as_ref().trim().to_string())
            .collect();
        if components.is_empty() || components.iter().any(|c| c.is_empty()) {
            return Err(LmmError::MalformedDesign(
                "Grouping key needs at least one non-empty column".to_string(),
            ));
        }
        Ok(Self { components })
    }

    /// Parse `a:b:c` into its components.
    pub fn parse(s: &str) -> Result<Self> {
        Self::new(&s.split(':').collect::<Vec<_>>())
    }
}

impl std::fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.components.join(":"))
    }
}

/// A random intercept term `(1 | key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomEffect {
    pub grouping: GroupingKey,
}

impl RandomEffect {
    /// Parse a random effect specification string.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();

        let inner = spec
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| {
                LmmError::MalformedDesign(format!(
                    "Random effect must be wrapped in parentheses: {}",
                    spec
                ))
            })?;

        let parts: Vec<&str> = inner.split('|').collect();
        if parts.len() != 2 {
            return Err(LmmError::MalformedDesign(format!(
                "Random effect must have exactly one '|': {}",
                spec
            )));
        }

        let terms = parts[0].trim();
        if terms != "1" {
            return Err(LmmError::MalformedDesign(format!(
                "Only random intercepts '(1 | group)' are supported, got '{}'",
                spec
            )));
        }

        Ok(Self {
            grouping: GroupingKey::parse(parts[1])?,
        })
    }
}

impl std::fmt::Display for RandomEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(1 | {})", self.grouping)
    }
}

/// A formula with an optional response, fixed effects and one random intercept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedFormula {
    /// Response named on the left-hand side, if any.
    pub response: Option<String>,
    /// Fixed effects specification.
    pub fixed: DesignSpecification,
    /// The random intercept.
    pub random: RandomEffect,
}

impl MixedFormula {
    /// Parse a mixed model formula.
    ///
    /// # Examples
    /// ```
    /// use splitplot_lmm::data::MixedFormula;
    /// let f = MixedFormula::parse("y ~ A + B + C + (1 | rep:A:B)").unwrap();
    /// assert_eq!(f.response.as_deref(), Some("y"));
    /// assert_eq!(f.fixed.terms.len(), 3);
    /// assert_eq!(f.random.grouping.components, vec!["rep", "A", "B"]);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let (lhs, rhs) = formula.split_once('~').ok_or_else(|| {
            LmmError::MalformedDesign("Formula must contain '~'".to_string())
        })?;
        let lhs = lhs.trim();
        let response = if lhs.is_empty() {
            None
        } else {
            Some(lhs.to_string())
        };

        let rhs = rhs.trim();
        if rhs.is_empty() {
            return Err(LmmError::MalformedDesign(
                "Formula right-hand side is empty".to_string(),
            ));
        }

        let re = Regex::new(r"\([^()]*\|[^()]*\)")
            .map_err(|e| LmmError::MalformedDesign(e.to_string()))?;
        let random_strs: Vec<&str> = re.find_iter(rhs).map(|m| m.as_str()).collect();

        let random = match random_strs.as_slice() {
            [single] => RandomEffect::parse(single)?,
            [] => {
                return Err(LmmError::MalformedDesign(
                    "Formula must contain a random intercept '(1 | group)'".to_string(),
                ))
            }
            _ => {
                return Err(LmmError::MalformedDesign(
                    "Only a single random intercept term is supported".to_string(),
                ))
            }
        };

        // Remaining text is the fixed part
        let fixed_str = re.replace_all(rhs, "");
        let fixed_str = split_top_level(&fixed_str, '+')
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" + ");
        let fixed = if fixed_str.is_empty() {
            DesignSpecification::parse_rhs("1")?
        } else {
            DesignSpecification::parse_rhs(&fixed_str)?
        };

        Ok(Self {
            response,
            fixed,
            random,
        })
    }
}

impl std::fmt::Display for MixedFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref response) = self.response {
            write!(f, "{} ", response)?;
        }
        let fixed = self.fixed.to_string();
        write!(f, "{} + {}", fixed, self.random)
    }
}

/// Design matrix for the random intercept (Z matrix).
#[derive(Debug, Clone)]
pub struct RandomDesignMatrix {
    /// The Z matrix (observations × groups).
    pub matrix: DMatrix<f64>,
    /// Group index of each observation.
    pub group_indices: Vec<usize>,
    /// Group labels in first-appearance order.
    pub group_ids: Vec<String>,
    /// Number of groups.
    pub n_groups: usize,
}

impl RandomDesignMatrix {
    /// Build Z with one indicator column per distinct grouping-key tuple.
    pub fn from_grouping(dataset: &Dataset, key: &GroupingKey) -> Result<Self> {
        let n = dataset.n_observations();

        let mut columns = Vec::with_capacity(key.components.len());
        for component in &key.components {
            if !dataset.has_column(component) {
                return Err(LmmError::MalformedDesign(format!(
                    "Grouping column '{}' not found in dataset",
                    component
                )));
            }
            columns.push(dataset.column(component)?);
        }

        let mut group_map: HashMap<String, usize> = HashMap::new();
        let mut group_ids: Vec<String> = Vec::new();
        let mut group_indices: Vec<usize> = Vec::with_capacity(n);

        for row in 0..n {
            let mut labels = Vec::with_capacity(columns.len());
            for (component, values) in key.components.iter().zip(&columns) {
                let label = values[row].label().ok_or_else(|| {
                    LmmError::MalformedDesign(format!(
                        "Observation {} has no value for grouping column '{}'",
                        row, component
                    ))
                })?;
                labels.push(label);
            }
            let group = labels.join(":");

            let idx = match group_map.get(&group) {
                Some(&idx) => idx,
                None => {
                    let idx = group_ids.len();
                    group_map.insert(group.clone(), idx);
                    group_ids.push(group);
                    idx
                }
            };
            group_indices.push(idx);
        }

        let n_groups = group_ids.len();
        let mut z = DMatrix::zeros(n, n_groups);
        for (row, &group) in group_indices.iter().enumerate() {
            z[(row, group)] = 1.0;
        }

        Ok(Self {
            matrix: z,
            group_indices,
            group_ids,
            n_groups,
        })
    }

    /// Number of observations.
    pub fn n_observations(&self) -> usize {
        self.matrix.nrows()
    }

    /// Get the Z matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Number of observations per group.
    pub fn observations_per_group(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_groups];
        for &idx in &self.group_indices {
            counts[idx] += 1;
        }
        counts
    }
}
