//! Fixed-effect design specification and its formula syntax.

use crate::error::{LmmError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

const NAME: &str = r"[A-Za-z_.][A-Za-z0-9_.]*";

/// How a covariate enters a design column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Transform {
    /// The covariate as stored (numeric value, or contrasts for a categorical column).
    Identity,
    /// The squared numeric value.
    Square,
    /// Indicator contrasts over the distinct values, even for a numeric column.
    Indicator,
}

/// A covariate under a transform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Factor {
    pub variable: String,
    pub transform: Transform,
}

impl Factor {
    pub fn new(variable: &str, transform: Transform) -> Self {
        Self {
            variable: variable.to_string(),
            transform,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = |e: regex::Error| LmmError::MalformedDesign(e.to_string());
        let plain = Regex::new(&format!(r"^({NAME})$")).map_err(bad)?;
        let wrapped = Regex::new(&format!(r"^I\(\s*({NAME})\s*\)$")).map_err(bad)?;
        let square = Regex::new(&format!(r"^(?:I\(\s*({NAME})\s*\^\s*2\s*\)|({NAME})\s*\^\s*2)$"))
            .map_err(bad)?;
        let indicator = Regex::new(&format!(r"^(?:as\.)?factor\(\s*({NAME})\s*\)$")).map_err(bad)?;

        if let Some(caps) = indicator.captures(s) {
            return Ok(Self::new(&caps[1], Transform::Indicator));
        }
        if let Some(caps) = square.captures(s) {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
            if let Some(name) = name {
                return Ok(Self::new(name, Transform::Square));
            }
        }
        if let Some(caps) = wrapped.captures(s).or_else(|| plain.captures(s)) {
            return Ok(Self::new(&caps[1], Transform::Identity));
        }
        Err(LmmError::MalformedDesign(format!("Cannot parse term '{}'", s)))
    }
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.transform {
            Transform::Identity => write!(f, "{}", self.variable),
            Transform::Square => write!(f, "I({}^2)", self.variable),
            Transform::Indicator => write!(f, "factor({})", self.variable),
        }
    }
}

/// A fixed-effect term: the product of one or more factors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub factors: Vec<Factor>,
}

impl Term {
    /// Main effect of a covariate.
    pub fn main(variable: &str) -> Self {
        Self {
            factors: vec![Factor::new(variable, Transform::Identity)],
        }
    }

    /// Quadratic effect of a numeric covariate.
    pub fn square(variable: &str) -> Self {
        Self {
            factors: vec![Factor::new(variable, Transform::Square)],
        }
    }

    /// Covariate treated as a factor.
    pub fn indicator(variable: &str) -> Self {
        Self {
            factors: vec![Factor::new(variable, Transform::Indicator)],
        }
    }

    /// Product of several factors.
    pub fn interaction(factors: Vec<Factor>) -> Self {
        Self { factors }
    }

    /// Variable names involved in this term.
    pub fn variables(&self) -> Vec<&str> {
        self.factors.iter().map(|f| f.variable.as_str()).collect()
    }

    /// Same factors regardless of their order (`A:B` equals `B:A`).
    pub fn same_as(&self, other: &Term) -> bool {
        let mut a = self.factors.clone();
        let mut b = other.factors.clone();
        a.sort();
        b.sort();
        a == b
    }

    fn parse(s: &str) -> Result<Self> {
        let factors = split_top_level(s, ':')
            .into_iter()
            .map(Factor::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { factors })
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.factors.iter().map(|x| x.to_string()).collect();
        write!(f, "{}", parts.join(":"))
    }
}

/// An ordered list of fixed-effect terms.
///
/// Term order is part of the specification: the sequential ANOVA attributes
/// sums of squares in exactly this order.
///
/// Supports R-style formula syntax:
/// - `~ A + B` - intercept + A + B
/// - `~ A + I(A^2)` or `~ A + A^2` - linear and quadratic A
/// - `~ A * C` - intercept + A + C + A:C
/// - `~ factor(A)` - numeric A coded as a factor
/// - `~ 0 + C` - no intercept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignSpecification {
    /// Whether to include an intercept.
    pub intercept: bool,
    /// Terms in order (excluding intercept).
    pub terms: Vec<Term>,
}

impl DesignSpecification {
    /// Build a specification from terms, dropping repeated terms.
    pub fn new(intercept: bool, terms: Vec<Term>) -> Self {
        let mut unique: Vec<Term> = Vec::with_capacity(terms.len());
        for term in terms {
            if !unique.iter().any(|t| t.same_as(&term)) {
                unique.push(term);
            }
        }
        Self {
            intercept,
            terms: unique,
        }
    }

    /// Parse a one-sided formula string.
    ///
    /// # Examples
    /// ```
    /// use splitplot_lmm::data::DesignSpecification;
    /// let spec = DesignSpecification::parse("~ A + B + I(A^2) + A:B").unwrap();
    /// assert!(spec.intercept);
    /// assert_eq!(spec.terms.len(), 4);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let formula = formula.trim();
        let rhs = formula
            .strip_prefix('~')
            .ok_or_else(|| LmmError::MalformedDesign("Formula must start with '~'".to_string()))?
            .trim();
        Self::parse_rhs(rhs)
    }

    pub(crate) fn parse_rhs(rhs: &str) -> Result<Self> {
        let mut rhs = rhs.trim().to_string();
        if rhs.is_empty() {
            return Err(LmmError::MalformedDesign(
                "Formula right-hand side is empty".to_string(),
            ));
        }

        let mut intercept = true;
        for suffix in ["- 1", "-1"] {
            if let Some(stripped) = rhs.strip_suffix(suffix) {
                intercept = false;
                rhs = stripped.trim().to_string();
                break;
            }
        }

        let mut terms: Vec<Term> = Vec::new();
        for term_str in split_top_level(&rhs, '+') {
            match term_str {
                "" | "1" => {}
                "0" | "-1" => intercept = false,
                s if s.contains('*') => {
                    let parts: Vec<&str> = split_top_level(s, '*');
                    if parts.iter().any(|p| p.is_empty() || p.contains(':')) {
                        return Err(LmmError::MalformedDesign(format!(
                            "Invalid crossed term: {}",
                            s
                        )));
                    }
                    let factors = parts
                        .into_iter()
                        .map(Factor::parse)
                        .collect::<Result<Vec<_>>>()?;
                    for subset in crossed_subsets(factors.len()) {
                        let term =
                            Term::interaction(subset.iter().map(|&i| factors[i].clone()).collect());
                        terms.push(term);
                    }
                }
                s => terms.push(Term::parse(s)?),
            }
        }

        if terms.is_empty() && !intercept {
            return Err(LmmError::MalformedDesign(
                "Formula must have at least one term".to_string(),
            ));
        }

        Ok(Self::new(intercept, terms))
    }

    /// All variable names used, sorted and deduplicated.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self.terms.iter().flat_map(|t| t.variables()).collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Position of a term by its display name.
    pub fn term_index(&self, name: &str) -> Option<usize> {
        self.terms.iter().position(|t| t.to_string() == name)
    }

    /// The same terms in a different order.
    pub fn reordered(&self, order: &[usize]) -> Result<Self> {
        let mut seen = vec![false; self.terms.len()];
        if order.len() != self.terms.len() {
            return Err(LmmError::InvalidParameter(format!(
                "Expected {} term positions, got {}",
                self.terms.len(),
                order.len()
            )));
        }
        for &i in order {
            if i >= self.terms.len() || seen[i] {
                return Err(LmmError::InvalidParameter(format!(
                    "Invalid term permutation {:?}",
                    order
                )));
            }
            seen[i] = true;
        }
        Ok(Self {
            intercept: self.intercept,
            terms: order.iter().map(|&i| self.terms[i].clone()).collect(),
        })
    }
}

impl std::fmt::Display for DesignSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~ ")?;
        if !self.intercept {
            write!(f, "0 + ")?;
        }
        if self.terms.is_empty() {
            return write!(f, "1");
        }
        let term_strs: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", term_strs.join(" + "))
    }
}

/// Split on a separator that is not nested inside parentheses.
pub(crate) fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// Non-empty index subsets of `0..k`, by size then position (R's `a*b*c` order).
fn crossed_subsets(k: usize) -> Vec<Vec<usize>> {
    let mut subsets: Vec<Vec<usize>> = (1u32..(1u32 << k))
        .map(|mask| (0..k).filter(|&i| mask & (1 << i) != 0).collect())
        .collect();
    subsets.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    subsets
}
