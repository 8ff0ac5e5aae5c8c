//! Integration tests for split-plot mixed model fitting.

use approx::assert_relative_eq;
use splitplot_lmm::prelude::*;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::io::Write;

const WHOLE_PLOT_SPEC: &str = "~ A + B + I(A^2) + I(B^2) + A:B + C";

fn whole_plot() -> GroupingKey {
    GroupingKey::parse("rep:A:B").unwrap()
}

#[test]
fn test_exact_moments_recover_generating_values() {
    let data = generate_random_intercept(&RandomInterceptConfig::default().with_exact_moments())
        .unwrap();
    let model = fit_formula(&data, "y ~ x + (1 | group)", &LmmConfig::default()).unwrap();

    assert_eq!(model.n_observations, 27);
    assert_eq!(model.n_groups, 3);
    assert_relative_eq!(model.estimate("x").unwrap(), 2.0, max_relative = 1e-8);
    assert_relative_eq!(model.estimate("(Intercept)").unwrap(), 3.0, max_relative = 1e-8);
    assert_relative_eq!(model.variance.between, 1.0, max_relative = 1e-6);
    assert_relative_eq!(model.variance.residual, 0.5, max_relative = 1e-6);
    assert_relative_eq!(model.variance.ratio(), 2.0, max_relative = 1e-6);

    // Within-group slope: n - groups - 1; intercept: groups - 1
    assert_relative_eq!(model.coefficient("x").unwrap().df, 23.0, max_relative = 1e-5);
    assert_relative_eq!(
        model.coefficient("(Intercept)").unwrap().df,
        2.0,
        max_relative = 1e-5
    );
    assert!(model.coefficient("x").unwrap().is_significant(0.001));
    assert!(model.warnings.is_empty());
}

#[test]
fn test_raw_draws_estimate_slope() {
    let config = RandomInterceptConfig::default()
        .with_dimensions(6, 20)
        .with_seed(11);
    let data = generate_random_intercept(&config).unwrap();
    let model = fit_formula(&data, "y ~ x + (1 | group)", &LmmConfig::default()).unwrap();

    let slope = model.estimate("x").unwrap();
    assert!((slope - 2.0).abs() < 0.25, "slope = {}", slope);
    assert!(model.variance.residual > 0.0);
    assert_relative_eq!(model.icc, model.variance.icc());
}

#[test]
fn test_default_raw_draws_cover_true_slope() {
    let data = generate_random_intercept(&RandomInterceptConfig::default()).unwrap();
    let model = fit_formula(&data, "y ~ x + (1 | group)", &LmmConfig::default()).unwrap();
    assert_eq!(model.n_observations, 27);
    assert_eq!(model.n_groups, 3);

    let slope = model.coefficient("x").unwrap();
    assert!(slope.df.is_finite() && slope.df > 0.0);
    let t = StudentsT::new(0.0, 1.0, slope.df).unwrap().inverse_cdf(0.975);
    assert!(
        (slope.estimate - 2.0).abs() <= t * slope.std_error,
        "slope = {} +/- {} * {}",
        slope.estimate,
        t,
        slope.std_error
    );

    // Three groups pin the between variance down only loosely
    let ratio = model.variance.ratio();
    assert!(ratio.is_finite() && (0.0..=15.0).contains(&ratio), "ratio = {}", ratio);
    assert!(
        (0.15..=1.0).contains(&model.variance.residual),
        "residual = {}",
        model.variance.residual
    );
}

#[test]
fn test_simulated_split_plot_ddf() {
    let data = generate_split_plot(&SplitPlotConfig::default().with_seed(3)).unwrap();
    let spec = DesignSpecification::parse(WHOLE_PLOT_SPEC).unwrap();
    let model = fit(&data.dataset, &spec, &whole_plot(), &LmmConfig::default()).unwrap();

    assert_eq!(model.n_groups, 18);
    assert!(!model.is_boundary());
    for term in ["A", "B", "I(A^2)", "I(B^2)", "A:B"] {
        assert_relative_eq!(model.anova.row(term).unwrap().den_df, 12.0, max_relative = 1e-4);
    }
    assert_relative_eq!(model.anova.row("C").unwrap().den_df, 34.0, max_relative = 1e-4);
}

#[test]
fn test_more_replicates_sharpen_estimates() {
    let spec = DesignSpecification::parse(WHOLE_PLOT_SPEC).unwrap();
    let config = LmmConfig::default();

    let small = generate_split_plot(&SplitPlotConfig::default().with_replicates(2).with_seed(5))
        .unwrap();
    let large = generate_split_plot(&SplitPlotConfig::default().with_replicates(16).with_seed(5))
        .unwrap();

    let small_fit = fit(&small.dataset, &spec, &whole_plot(), &config).unwrap();
    let large_fit = fit(&large.dataset, &spec, &whole_plot(), &config).unwrap();

    assert_eq!(large_fit.n_groups, 144);
    assert!(
        large_fit.coefficient("A").unwrap().std_error
            < small_fit.coefficient("A").unwrap().std_error
    );

    assert!((large_fit.estimate("A").unwrap() - 1.5).abs() < 0.5);
    assert!((large_fit.estimate("B").unwrap() + 0.8).abs() < 0.5);
    assert!((large_fit.variance.between - 1.0).abs() < 0.6);
    assert!((large_fit.variance.residual - 0.25).abs() < 0.1);

    // Balanced: 144 whole plots - 6 whole-plot parameters; 432 - 144 - 2
    assert_relative_eq!(large_fit.anova.row("A").unwrap().den_df, 138.0, max_relative = 1e-4);
    assert_relative_eq!(large_fit.anova.row("C").unwrap().den_df, 286.0, max_relative = 1e-4);
    assert!(large_fit.anova.row("A").unwrap().p_value < 1e-6);
}

#[test]
fn test_no_whole_plot_variance_is_consistent() {
    let spec = DesignSpecification::parse(WHOLE_PLOT_SPEC).unwrap();
    let config = LmmConfig::default();
    let truth = [("A", 1.5), ("B", -0.8), ("I(A^2)", 0.6), ("A:B", 0.3)];

    let fits: Vec<FittedModel> = [2, 16]
        .iter()
        .map(|&reps| {
            let data = generate_split_plot(
                &SplitPlotConfig::default()
                    .with_replicates(reps)
                    .with_variances(0.0, 0.25)
                    .with_seed(17),
            )
            .unwrap();
            fit(&data.dataset, &spec, &whole_plot(), &config).unwrap()
        })
        .collect();
    let (small, large) = (&fits[0], &fits[1]);

    for (name, value) in truth {
        let s = small.coefficient(name).unwrap();
        let l = large.coefficient(name).unwrap();
        assert!(l.std_error < s.std_error, "{}: {} vs {}", name, l.std_error, s.std_error);
        assert!(
            (l.estimate - value).abs() <= 4.0 * l.std_error,
            "{} = {} (se {})",
            name,
            l.estimate,
            l.std_error
        );
    }

    assert!(
        (0.0..0.05).contains(&large.variance.between),
        "between = {}",
        large.variance.between
    );
    assert!(
        (large.variance.residual - 0.25).abs() < 0.06,
        "residual = {}",
        large.variance.residual
    );
    assert!(large.anova.row("A").unwrap().p_value < 1e-6);
}

#[test]
fn test_csv_roundtrip_gives_same_fit() {
    let dir = tempfile::tempdir().unwrap();
    let data = generate_split_plot(&SplitPlotConfig::default()).unwrap();
    data.write_to_dir(dir.path()).unwrap();
    assert!(dir.path().join("config.yaml").exists());

    let loaded = Dataset::from_path(dir.path().join("data.csv"), "y").unwrap();
    assert_eq!(loaded.n_observations(), 54);
    assert_eq!(loaded.column_type("A"), Some(VariableType::Continuous));
    assert_eq!(loaded.column_type("C"), Some(VariableType::Categorical));

    let formula = "y ~ A + B + I(A^2) + C + (1 | rep:A:B)";
    let config = LmmConfig::default();
    let from_memory = fit_formula(&data.dataset, formula, &config).unwrap();
    let from_disk = fit_formula(&loaded, formula, &config).unwrap();

    for (a, b) in from_memory.coefficients.iter().zip(&from_disk.coefficients) {
        assert_eq!(a.name, b.name);
        assert_relative_eq!(a.estimate, b.estimate, max_relative = 1e-10, epsilon = 1e-12);
    }
    assert_relative_eq!(
        from_memory.variance.between,
        from_disk.variance.between,
        max_relative = 1e-8
    );
}

#[test]
fn test_tsv_input() {
    let mut file = tempfile::Builder::new().suffix(".tsv").tempfile().unwrap();
    write!(
        file,
        "y\tplot\ttrt\tsub\n\
         5.1\tp1\ta\ts1\n\
         5.9\tp1\ta\ts2\n\
         4.2\tp2\ta\ts1\n\
         5.3\tp2\ta\ts2\n\
         6.8\tp3\tb\ts1\n\
         7.1\tp3\tb\ts2\n\
         6.0\tp4\tb\ts1\n\
         7.4\tp4\tb\ts2\n\
         NA\tp4\tb\ts2\n"
    )
    .unwrap();
    file.flush().unwrap();

    // Missing response rows are skipped
    let data = Dataset::from_path(file.path(), "y").unwrap();
    assert_eq!(data.n_observations(), 8);

    let model = fit_formula(&data, "y ~ trt + sub + (1 | plot)", &LmmConfig::default()).unwrap();
    assert_eq!(model.n_groups, 4);
    assert_eq!(model.anova.len(), 2);
}

#[test]
fn test_analysis_config_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let data = generate_split_plot(&SplitPlotConfig::default().with_seed(9)).unwrap();
    data.write_to_dir(dir.path()).unwrap();

    let mut analysis = AnalysisConfig::new(
        "sim",
        "data.csv",
        "y",
        "y ~ A + B + I(A^2) + I(B^2) + A:B + C + (1 | rep:A:B)",
    );
    analysis.output = OutputFormat::Json;
    let path = dir.path().join("analysis.yaml");
    std::fs::write(&path, analysis.to_yaml().unwrap()).unwrap();

    let loaded = AnalysisConfig::from_path(&path).unwrap();
    let model = loaded.run().unwrap();
    let report = loaded.render(&model).unwrap();
    let value: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(value["n_observations"], 54);
    assert_eq!(value["anova"]["rows"].as_array().unwrap().len(), 6);
}

#[test]
fn test_fit_many_alternative_specifications() {
    let data = generate_split_plot(&SplitPlotConfig::default()).unwrap();
    let specs: Vec<DesignSpecification> = ["~ A + C", "~ A + B + C", "~ A * C"]
        .iter()
        .map(|s| DesignSpecification::parse(s).unwrap())
        .collect();

    let config = LmmConfig::default();
    let results = fit_many(&data.dataset, &specs, &whole_plot(), &config);
    assert_eq!(results.len(), 3);

    for (spec, result) in specs.iter().zip(&results) {
        let parallel = result.as_ref().unwrap();
        let serial = fit(&data.dataset, spec, &whole_plot(), &config).unwrap();
        assert_eq!(parallel.formula, serial.formula);
        assert_relative_eq!(parallel.log_reml, serial.log_reml, max_relative = 1e-12);
    }
    assert_eq!(results[2].as_ref().unwrap().anova.len(), 3);
}
