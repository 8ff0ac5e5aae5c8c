//! splitplot - split-plot mixed model CLI
//!
//! Fits a random-intercept mixed model to a delimited data file and
//! reports variance components, coefficient tests and the sequential
//! ANOVA with Satterthwaite denominator df.

use clap::{Parser, Subcommand, ValueEnum};
use splitplot_lmm::benchmark::{generate_split_plot, SplitPlotConfig};
use splitplot_lmm::config::{render, AnalysisConfig, OutputFormat};
use splitplot_lmm::data::{Coding, Dataset};
use splitplot_lmm::error::Result;
use splitplot_lmm::model::{fit_formula, FittedModel, LmmConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// CLI-friendly contrast coding
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCoding {
    /// Sum-to-zero contrasts
    Sum,
    /// Treatment contrasts against the last level
    ReferenceLast,
}

impl From<CliCoding> for Coding {
    fn from(coding: CliCoding) -> Self {
        match coding {
            CliCoding::Sum => Coding::Sum,
            CliCoding::ReferenceLast => Coding::ReferenceLast,
        }
    }
}

/// CLI-friendly output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliFormat {
    Text,
    Json,
    Tsv,
}

impl From<CliFormat> for OutputFormat {
    fn from(format: CliFormat) -> Self {
        match format {
            CliFormat::Text => OutputFormat::Text,
            CliFormat::Json => OutputFormat::Json,
            CliFormat::Tsv => OutputFormat::Tsv,
        }
    }
}

/// Split-plot linear mixed models fitted by REML
#[derive(Parser)]
#[command(name = "splitplot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a mixed model to a data file
    Fit {
        /// Path to CSV/TSV data
        #[arg(short, long)]
        data: PathBuf,

        /// Mixed formula, e.g. "y ~ A + C + (1 | rep:A)"
        #[arg(short, long)]
        formula: String,

        /// Response column
        #[arg(short, long, default_value = "y")]
        response: String,

        /// Contrast coding for categorical factors
        #[arg(long, value_enum, default_value = "sum")]
        coding: CliCoding,

        /// Maximum REML iterations
        #[arg(long, default_value = "200")]
        max_iter: usize,

        /// Pin the between-group variance (0 gives ordinary least squares)
        #[arg(long)]
        fixed_between: Option<f64>,

        /// Fail if more than this many dependent columns are dropped
        #[arg(long)]
        max_dropped: Option<usize>,

        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        format: CliFormat,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the ANOVA table as TSV
        #[arg(long)]
        anova_tsv: Option<PathBuf>,
    },

    /// Run an analysis from a YAML configuration file
    Run {
        /// Path to analysis configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a synthetic split-plot dataset with known effects
    Simulate {
        /// Output directory (data.csv and config.yaml)
        #[arg(short, long)]
        output: PathBuf,

        /// Number of replicates
        #[arg(long, default_value = "2")]
        replicates: usize,

        /// Whole-plot variance
        #[arg(long, default_value = "1.0")]
        between: f64,

        /// Subplot variance
        #[arg(long, default_value = "0.25")]
        residual: f64,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Also write an analysis YAML for the generated data
        #[arg(long)]
        with_analysis: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Fit {
            data,
            formula,
            response,
            coding,
            max_iter,
            fixed_between,
            max_dropped,
            format,
            output,
            anova_tsv,
        } => {
            let config = LmmConfig {
                max_iter,
                coding: coding.into(),
                fixed_between_variance: fixed_between,
                max_dropped_columns: max_dropped,
                ..LmmConfig::default()
            };
            cmd_fit(
                &data,
                &formula,
                &response,
                &config,
                format.into(),
                output.as_deref(),
                anova_tsv.as_deref(),
            )
        }

        Commands::Run { config, output } => cmd_run(&config, output.as_deref()),

        Commands::Simulate {
            output,
            replicates,
            between,
            residual,
            seed,
            with_analysis,
        } => cmd_simulate(&output, replicates, between, residual, seed, with_analysis),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn emit(report: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, report)?;
            eprintln!("Wrote report to {:?}", path);
        }
        None => print!("{}", report),
    }
    Ok(())
}

fn report_warnings(model: &FittedModel) {
    for warning in &model.warnings {
        eprintln!("Warning: {}", warning);
    }
}

/// Fit a model from command-line options
fn cmd_fit(
    data_path: &Path,
    formula: &str,
    response: &str,
    config: &LmmConfig,
    format: OutputFormat,
    output: Option<&Path>,
    anova_tsv: Option<&Path>,
) -> Result<()> {
    eprintln!("Loading data from {:?}...", data_path);
    let dataset = Dataset::from_path(data_path, response)?;
    eprintln!(
        "Loaded {} observations, {} covariates",
        dataset.n_observations(),
        dataset.column_names().len()
    );

    let model = fit_formula(&dataset, formula, config)?;
    report_warnings(&model);

    if let Some(path) = anova_tsv {
        model.anova.write_tsv(path)?;
        eprintln!("Wrote ANOVA table to {:?}", path);
    }
    emit(&render(&model, format)?, output)
}

/// Run an analysis from a YAML configuration
fn cmd_run(config_path: &Path, output: Option<&Path>) -> Result<()> {
    eprintln!("Loading analysis configuration from {:?}...", config_path);
    let config = AnalysisConfig::from_path(config_path)?;

    eprintln!("Running analysis '{}'...", config.name);
    let model = config.run()?;
    report_warnings(&model);
    emit(&config.render(&model)?, output)
}

/// Generate a synthetic split-plot dataset
fn cmd_simulate(
    output: &Path,
    replicates: usize,
    between: f64,
    residual: f64,
    seed: u64,
    with_analysis: bool,
) -> Result<()> {
    let config = SplitPlotConfig::new("simulated")
        .with_replicates(replicates)
        .with_variances(between, residual)
        .with_seed(seed);
    let data = generate_split_plot(&config)?;
    data.write_to_dir(output)?;

    eprintln!(
        "Wrote {} observations in {} whole plots to {:?}",
        data.dataset.n_observations(),
        config.n_whole_plots(),
        output
    );

    if with_analysis {
        let analysis = AnalysisConfig::new(
            "simulated",
            "data.csv",
            "y",
            "y ~ A + B + I(A^2) + I(B^2) + A:B + C + (1 | rep:A:B)",
        );
        let path = output.join("analysis.yaml");
        std::fs::write(&path, analysis.to_yaml()?)?;
        eprintln!("Wrote analysis configuration to {:?}", path);
    }
    Ok(())
}
