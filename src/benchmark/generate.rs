//! Synthetic data generation for testing and demonstration.
//!
//! Generates split-plot and simple random-intercept datasets with known
//! fixed effects and variance components.

use crate::data::{Dataset, Observation};
use crate::error::{LmmError, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// True fixed effects of a synthetic split-plot response surface.
///
/// `y = intercept + a·A + b·B + a2·A² + b2·B² + ab·A·B + c[j] + ac[j]·A`
/// for subplot level `j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPlotEffects {
    pub intercept: f64,
    pub a: f64,
    pub b: f64,
    pub a2: f64,
    pub b2: f64,
    pub ab: f64,
    /// Subplot level effects, one per level of C.
    pub c: Vec<f64>,
    /// Slope of A within each level of C.
    pub ac: Vec<f64>,
}

impl Default for SplitPlotEffects {
    fn default() -> Self {
        Self {
            intercept: 10.0,
            a: 1.5,
            b: -0.8,
            a2: 0.6,
            b2: 0.0,
            ab: 0.3,
            c: vec![0.5, -0.2, -0.3],
            ac: vec![0.0, 0.0, 0.0],
        }
    }
}

/// Configuration for a replicated split-plot experiment.
///
/// Whole plots are every combination of replicate × A level × B level;
/// each whole plot is split into one subplot per level of C.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitPlotConfig {
    /// Name/identifier for this dataset.
    pub name: String,
    /// Number of replicates of the whole-plot grid.
    pub replicates: usize,
    /// Levels of the first whole-plot factor.
    pub a_levels: Vec<f64>,
    /// Levels of the second whole-plot factor.
    pub b_levels: Vec<f64>,
    /// Labels of the subplot factor.
    pub c_levels: Vec<String>,
    pub effects: SplitPlotEffects,
    /// Whole-plot variance σ²_g.
    pub between_variance: f64,
    /// Subplot variance σ²_e.
    pub residual_variance: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl Default for SplitPlotConfig {
    fn default() -> Self {
        Self {
            name: "split_plot".to_string(),
            replicates: 2,
            a_levels: vec![-1.0, 0.0, 1.0],
            b_levels: vec![-1.0, 0.0, 1.0],
            c_levels: vec!["c1".to_string(), "c2".to_string(), "c3".to_string()],
            effects: SplitPlotEffects::default(),
            between_variance: 1.0,
            residual_variance: 0.25,
            seed: 42,
        }
    }
}

impl SplitPlotConfig {
    /// Create a new config with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Set the number of replicates.
    pub fn with_replicates(mut self, replicates: usize) -> Self {
        self.replicates = replicates;
        self
    }

    /// Set variance components.
    pub fn with_variances(mut self, between: f64, residual: f64) -> Self {
        self.between_variance = between;
        self.residual_variance = residual;
        self
    }

    /// Set the true fixed effects.
    pub fn with_effects(mut self, effects: SplitPlotEffects) -> Self {
        self.effects = effects;
        self
    }

    /// Set subplot level labels.
    pub fn with_c_levels(mut self, levels: &[&str]) -> Self {
        self.c_levels = levels.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of whole plots.
    pub fn n_whole_plots(&self) -> usize {
        self.replicates * self.a_levels.len() * self.b_levels.len()
    }

    /// Number of observations.
    pub fn n_observations(&self) -> usize {
        self.n_whole_plots() * self.c_levels.len()
    }

    fn validate(&self) -> Result<()> {
        if self.replicates == 0
            || self.a_levels.is_empty()
            || self.b_levels.is_empty()
            || self.c_levels.is_empty()
        {
            return Err(LmmError::InvalidParameter(
                "Split-plot layout needs at least one replicate and one level per factor"
                    .to_string(),
            ));
        }
        let k = self.c_levels.len();
        if self.effects.c.len() != k || self.effects.ac.len() != k {
            return Err(LmmError::InvalidParameter(format!(
                "Expected {} subplot effects, got c = {}, ac = {}",
                k,
                self.effects.c.len(),
                self.effects.ac.len()
            )));
        }
        Ok(())
    }

    /// True mean response for one cell.
    pub fn mean_response(&self, a: f64, b: f64, c_index: usize) -> f64 {
        let e = &self.effects;
        e.intercept + e.a * a + e.b * b + e.a2 * a * a + e.b2 * b * b + e.ab * a * b
            + e.c[c_index]
            + e.ac[c_index] * a
    }
}

/// A generated split-plot dataset.
#[derive(Debug, Clone)]
pub struct SyntheticSplitPlot {
    /// Columns `rep`, `A`, `B`, `C` and response `y`.
    pub dataset: Dataset,
    /// Realized whole-plot effects, in whole-plot order.
    pub plot_effects: Vec<f64>,
    /// Configuration used.
    pub config: SplitPlotConfig,
}

impl SyntheticSplitPlot {
    /// Write `data.csv` and `config.yaml` to a directory.
    pub fn write_to_dir(&self, dir: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.dataset.write_delimited(dir.join("data.csv"), b',')?;
        std::fs::write(dir.join("config.yaml"), serde_yaml::to_string(&self.config)?)?;
        Ok(())
    }
}

fn normal(sd_squared: f64, what: &str) -> Result<Normal<f64>> {
    if !sd_squared.is_finite() || sd_squared < 0.0 {
        return Err(LmmError::InvalidParameter(format!(
            "{} must be finite and non-negative, got {}",
            what, sd_squared
        )));
    }
    Normal::new(0.0, sd_squared.sqrt()).map_err(|e| LmmError::InvalidParameter(e.to_string()))
}

/// Generate a replicated split-plot dataset.
///
/// Rows are ordered replicate, A, B, C; the whole plot is identified by
/// the grouping key `rep:A:B`.
pub fn generate_split_plot(config: &SplitPlotConfig) -> Result<SyntheticSplitPlot> {
    config.validate()?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let plot_dist = normal(config.between_variance, "between_variance")?;
    let noise_dist = normal(config.residual_variance, "residual_variance")?;

    let mut observations = Vec::with_capacity(config.n_observations());
    let mut plot_effects = Vec::with_capacity(config.n_whole_plots());

    for rep in 1..=config.replicates {
        for &a in &config.a_levels {
            for &b in &config.b_levels {
                let u = plot_dist.sample(&mut rng);
                plot_effects.push(u);
                for (j, c) in config.c_levels.iter().enumerate() {
                    let y = config.mean_response(a, b, j) + u + noise_dist.sample(&mut rng);
                    observations.push(
                        Observation::new(y)
                            .with_categorical("rep", format!("R{}", rep))
                            .with_continuous("A", a)
                            .with_continuous("B", b)
                            .with_categorical("C", c.as_str()),
                    );
                }
            }
        }
    }

    Ok(SyntheticSplitPlot {
        dataset: Dataset::from_observations("y", observations)?,
        plot_effects,
        config: config.clone(),
    })
}

/// Configuration for a one-covariate random-intercept dataset.
///
/// Every group observes the covariate `x = 1, 2, ..., group_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomInterceptConfig {
    pub n_groups: usize,
    pub group_size: usize,
    pub intercept: f64,
    pub slope: f64,
    pub between_variance: f64,
    pub residual_variance: f64,
    /// Rescale the draws so the sample moments equal their targets.
    ///
    /// Group effects are centred and scaled so the between-group mean
    /// square equals `σ²_e + k σ²_g`; noise is made orthogonal to the
    /// intercept and slope within each group and scaled so the within
    /// mean square equals `σ²_e`. REML then recovers the generating
    /// values exactly.
    pub exact_moments: bool,
    pub seed: u64,
}

impl Default for RandomInterceptConfig {
    fn default() -> Self {
        Self {
            n_groups: 3,
            group_size: 9,
            intercept: 3.0,
            slope: 2.0,
            between_variance: 1.0,
            residual_variance: 0.5,
            exact_moments: false,
            seed: 42,
        }
    }
}

impl RandomInterceptConfig {
    /// Set dimensions.
    pub fn with_dimensions(mut self, n_groups: usize, group_size: usize) -> Self {
        self.n_groups = n_groups;
        self.group_size = group_size;
        self
    }

    /// Set variance components.
    pub fn with_variances(mut self, between: f64, residual: f64) -> Self {
        self.between_variance = between;
        self.residual_variance = residual;
        self
    }

    /// Match sample moments to the targets.
    pub fn with_exact_moments(mut self) -> Self {
        self.exact_moments = true;
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Generate a dataset with columns `group`, `x` and response `y`.
pub fn generate_random_intercept(config: &RandomInterceptConfig) -> Result<Dataset> {
    let m = config.n_groups;
    let k = config.group_size;
    if m == 0 || k == 0 {
        return Err(LmmError::InvalidParameter(
            "Need at least one group and one observation per group".to_string(),
        ));
    }
    if config.exact_moments && (m < 2 || k < 3) {
        return Err(LmmError::InvalidParameter(
            "Exact moments need at least 2 groups of at least 3 observations".to_string(),
        ));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let group_dist = normal(config.between_variance, "between_variance")?;
    let noise_dist = normal(config.residual_variance, "residual_variance")?;

    let x: Vec<f64> = (1..=k).map(|v| v as f64).collect();
    let mut u: Vec<f64> = (0..m).map(|_| group_dist.sample(&mut rng)).collect();
    let mut e: Vec<Vec<f64>> = (0..m)
        .map(|_| (0..k).map(|_| noise_dist.sample(&mut rng)).collect())
        .collect();

    if config.exact_moments {
        let n = (m * k) as f64;

        let mean = u.iter().sum::<f64>() / m as f64;
        u.iter_mut().for_each(|v| *v -= mean);
        let target = (m - 1) as f64 * (config.between_variance + config.residual_variance / k as f64);
        rescale(&mut u, target)?;

        let x_mean = x.iter().sum::<f64>() / k as f64;
        let xc: Vec<f64> = x.iter().map(|v| v - x_mean).collect();
        let xc_ss: f64 = xc.iter().map(|v| v * v).sum();
        for group in e.iter_mut() {
            let g_mean = group.iter().sum::<f64>() / k as f64;
            let slope = group.iter().zip(&xc).map(|(v, c)| v * c).sum::<f64>() / xc_ss;
            for (v, c) in group.iter_mut().zip(&xc) {
                *v -= g_mean + slope * c;
            }
        }
        let target = config.residual_variance * (n - m as f64 - 1.0);
        let mut flat: Vec<f64> = e.iter().flatten().copied().collect();
        rescale(&mut flat, target)?;
        for (group, chunk) in e.iter_mut().zip(flat.chunks(k)) {
            group.copy_from_slice(chunk);
        }
    }

    let mut observations = Vec::with_capacity(m * k);
    for g in 0..m {
        for (i, &xi) in x.iter().enumerate() {
            let y = config.intercept + config.slope * xi + u[g] + e[g][i];
            observations.push(
                Observation::new(y)
                    .with_categorical("group", format!("g{}", g + 1))
                    .with_continuous("x", xi),
            );
        }
    }
    Dataset::from_observations("y", observations)
}

/// Scale `values` so their sum of squares equals `target`.
fn rescale(values: &mut [f64], target: f64) -> Result<()> {
    let ss: f64 = values.iter().map(|v| v * v).sum();
    if ss <= 0.0 {
        if target == 0.0 {
            return Ok(());
        }
        return Err(LmmError::Numerical(
            "Cannot rescale a degenerate draw".to_string(),
        ));
    }
    let factor = (target / ss).sqrt();
    values.iter_mut().for_each(|v| *v *= factor);
    Ok(())
}
