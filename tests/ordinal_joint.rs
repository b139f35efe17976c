use approx::{assert_abs_diff_eq, assert_relative_eq};
use fiml::data::{Dataset, no_definitions};
use fiml::fiml::DiagnosticKind;
use fiml::model::{LinearMeanModel, StaticModel, ThresholdColumn, ThresholdTable};
use fiml::probability::{bivariate_normal_cdf, normal_cdf};
use fiml::{
    CachePolicy, ColumnKind, EngineConfig, EngineError, EvaluationMode, FimlEvaluator, FitState,
    OutputMode, RowSource,
};
use ndarray::{Array2, array, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

fn interval_mass(lower: f64, upper: f64, mean: f64, sd: f64) -> f64 {
    normal_cdf((upper - mean) / sd) - normal_cdf((lower - mean) / sd)
}

fn normal_density(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    (-0.5 * z * z).exp() / (sd * (2.0 * PI).sqrt())
}

#[test]
fn single_ordinal_column_uses_category_intervals() {
    let nan = f64::NAN;
    let data = Dataset::from_arrays(
        vec![ColumnKind::Ordinal],
        array![[0.0], [1.0], [2.0], [nan], [1.0]],
        no_definitions(5),
    )
    .expect("valid dataset");
    let thresholds = ThresholdTable::new(vec![Some(ThresholdColumn::new(vec![-0.5, 0.4]))]);
    let model = StaticModel::new(array![[2.0]], Some(array![0.3]), thresholds).expect("model");
    let out = FimlEvaluator::new(model, EngineConfig::per_row())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");

    let sd = 2.0f64.sqrt();
    let lik = out.row_likelihoods();
    let inf = f64::INFINITY;
    assert_relative_eq!(lik[0], interval_mass(-inf, -0.5, 0.3, sd), max_relative = 1e-12);
    assert_relative_eq!(lik[1], interval_mass(-0.5, 0.4, 0.3, sd), max_relative = 1e-12);
    assert_relative_eq!(lik[2], interval_mass(0.4, inf, 0.3, sd), max_relative = 1e-12);
    assert_eq!(lik[3], 1.0);
    assert_eq!(lik[1].to_bits(), lik[4].to_bits());
    let total: f64 = lik[..3].iter().sum();
    assert_relative_eq!(total, 1.0, max_relative = 1e-12);
}

#[test]
fn two_ordinal_columns_match_bivariate_normal_rectangle() {
    let (s0, s1, r) = (1.0, 2.0, 0.5);
    let cov = array![[s0 * s0, r * s0 * s1], [r * s0 * s1, s1 * s1]];
    let thresholds = ThresholdTable::new(vec![
        Some(ThresholdColumn::new(vec![0.0])),
        Some(ThresholdColumn::new(vec![-1.0, 1.0])),
    ]);
    let data = Dataset::from_arrays(
        vec![ColumnKind::Ordinal; 2],
        array![[1.0, 2.0], [0.0, 1.0]],
        no_definitions(2),
    )
    .expect("valid dataset");
    let model = StaticModel::new(cov, Some(array![0.0, 0.5]), thresholds).expect("model");
    let out = FimlEvaluator::new(model, EngineConfig::per_row())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");

    // Row 0: both above their cutpoints.
    let (a0, a1) = (0.0, (1.0 - 0.5) / s1);
    assert_abs_diff_eq!(
        out.row_likelihoods()[0],
        bivariate_normal_cdf(-a0, -a1, r),
        epsilon = 1e-12
    );
    // Row 1: below 0 and between the two cutpoints of column 1.
    let (lo, hi) = ((-1.0 - 0.5) / s1, (1.0 - 0.5) / s1);
    let expected = bivariate_normal_cdf(0.0, hi, r) - bivariate_normal_cdf(0.0, lo, r);
    assert_abs_diff_eq!(out.row_likelihoods()[1], expected, epsilon = 1e-12);
}

#[test]
fn trivariate_orthant_is_within_integration_tolerance() {
    let cov = array![[1.0, 0.5, 0.5], [0.5, 1.0, 0.5], [0.5, 0.5, 1.0]];
    let thresholds = ThresholdTable::new(vec![Some(ThresholdColumn::new(vec![0.0])); 3]);
    let data = Dataset::from_arrays(
        vec![ColumnKind::Ordinal; 3],
        array![[0.0, 0.0, 0.0]],
        no_definitions(1),
    )
    .expect("valid dataset");
    let model = StaticModel::new(cov, None, thresholds).expect("model");
    let out = FimlEvaluator::new(model, EngineConfig::default())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");
    // 1/8 + 3·asin(1/2)/(4π)
    assert_abs_diff_eq!(out.row_likelihoods()[0], 0.25, epsilon = 2e-3);
    assert_eq!(out.stats().integrations, 1);
}

#[test]
fn joint_rows_condition_the_ordinal_part_on_the_continuous_residual() {
    let nan = f64::NAN;
    let (sc, so, rho) = (1.2, 0.9, 0.6);
    let (mc, mo) = (0.5, -0.2);
    let cov = array![[sc * sc, rho * sc * so], [rho * sc * so, so * so]];
    let thresholds = ThresholdTable::new(vec![None, Some(ThresholdColumn::new(vec![-0.3, 0.8]))]);
    let values = array![[1.0, 1.0], [nan, 2.0], [0.2, nan], [-0.4, 0.0], [nan, nan]];
    let data = Dataset::from_arrays(
        vec![ColumnKind::Continuous, ColumnKind::Ordinal],
        values.clone(),
        no_definitions(5),
    )
    .expect("valid dataset");
    let model = StaticModel::new(cov, Some(array![mc, mo]), thresholds).expect("model");
    let evaluator = FimlEvaluator::new(model, EngineConfig::per_row()).expect("engine");
    let out = evaluator.evaluate(&data, FitState::default()).expect("evaluation");
    let lik = out.row_likelihoods();

    let conditional_sd = so * (1.0 - rho * rho).sqrt();
    let conditional_mean = |x: f64| mo + rho * so / sc * (x - mc);
    let inf = f64::INFINITY;

    let row0 = normal_density(1.0, mc, sc)
        * interval_mass(-0.3, 0.8, conditional_mean(1.0), conditional_sd);
    assert_relative_eq!(lik[0], row0, max_relative = 1e-10);
    assert_relative_eq!(lik[1], interval_mass(0.8, inf, mo, so), max_relative = 1e-10);
    assert_relative_eq!(lik[2], normal_density(0.2, mc, sc), max_relative = 1e-10);
    let row3 = normal_density(-0.4, mc, sc)
        * interval_mass(-inf, -0.3, conditional_mean(-0.4), conditional_sd);
    assert_relative_eq!(lik[3], row3, max_relative = 1e-10);
    assert_eq!(lik[4], 1.0);

    let aggregate = FimlEvaluator::new(evaluator.model().clone(), EngineConfig::default())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");
    let expected: f64 = lik.iter().map(|l| -2.0 * l.ln()).sum();
    assert_relative_eq!(aggregate.total_neg2_log_likelihood(), expected, max_relative = 1e-10);
}

#[test]
fn joint_rows_with_impossible_conditional_variance_fail_as_improper() {
    let thresholds = ThresholdTable::new(vec![None, Some(ThresholdColumn::new(vec![0.0]))]);
    let model =
        StaticModel::new(array![[1.0, 1.5], [1.5, 1.0]], None, thresholds).expect("symmetric");
    let data = Dataset::from_arrays(
        vec![ColumnKind::Continuous, ColumnKind::Ordinal],
        array![[0.3, 1.0], [0.3, f64::NAN]],
        no_definitions(2),
    )
    .expect("valid dataset");
    let out = FimlEvaluator::new(model, EngineConfig::default())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");

    assert_eq!(out.row_likelihoods()[0], 0.0);
    assert_relative_eq!(
        out.row_likelihoods()[1],
        normal_density(0.3, 0.0, 1.0),
        max_relative = 1e-12
    );
    assert_eq!(out.diagnostics().len(), 1);
    let d = &out.diagnostics()[0];
    assert_eq!(d.kind, DiagnosticKind::ImproperIntegration);
    assert!(d.message.starts_with("Improper value detected by integration routine in data row 1"));
}

#[test]
fn category_beyond_thresholds_is_reported_and_skipped() {
    let thresholds = ThresholdTable::new(vec![Some(ThresholdColumn::new(vec![-1.0, 1.0]))]);
    let model = StaticModel::new(array![[1.0]], None, thresholds).expect("model");
    let data = Dataset::from_arrays(
        vec![ColumnKind::Ordinal],
        array![[5.0], [1.0]],
        no_definitions(2),
    )
    .expect("valid dataset");
    let out = FimlEvaluator::new(model, EngineConfig::default())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");
    assert_eq!(out.row_likelihoods()[0], 0.0);
    assert_relative_eq!(
        out.row_likelihoods()[1],
        interval_mass(-1.0, 1.0, 0.0, 1.0),
        max_relative = 1e-12
    );
    assert_eq!(out.diagnostics()[0].kind, DiagnosticKind::ImproperIntegration);
}

#[test]
fn non_increasing_thresholds_are_diagnosed_in_aggregate_mode() {
    let thresholds = ThresholdTable::new(vec![Some(ThresholdColumn::new(vec![0.5, 0.5]))]);
    let model = StaticModel::new(array![[1.0]], None, thresholds).expect("model");
    let data = Dataset::from_arrays(
        vec![ColumnKind::Ordinal],
        array![[0.0], [0.0]],
        no_definitions(2),
    )
    .expect("valid dataset");

    let out = FimlEvaluator::new(model.clone(), EngineConfig::default())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");
    let kinds: Vec<DiagnosticKind> = out.diagnostics().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DiagnosticKind::ThresholdsNotIncreasing]);
    assert!(out.row_likelihoods()[0] > 0.0);

    let per_row = FimlEvaluator::new(model, EngineConfig::per_row())
        .expect("engine")
        .evaluate(&data, FitState::default())
        .expect("evaluation");
    assert_eq!(per_row.mode(), OutputMode::PerRow);
    assert!(per_row.diagnostics().is_empty());
}

#[test]
fn structural_mismatches_are_rejected_before_any_row() {
    let data = Dataset::from_arrays(
        vec![ColumnKind::Continuous, ColumnKind::Ordinal],
        array![[0.1, 1.0]],
        no_definitions(1),
    )
    .expect("valid dataset");
    let thresholds = ThresholdTable::new(vec![None, Some(ThresholdColumn::new(vec![0.0]))]);
    let model = StaticModel::new(Array2::eye(2), None, thresholds).expect("model");
    let evaluator = FimlEvaluator::new(model, EngineConfig::default()).expect("engine");
    assert!(matches!(
        evaluator.evaluate_with_mode(&data, EvaluationMode::Continuous, FitState::default()),
        Err(EngineError::ModeMismatch { column: 1, .. })
    ));

    let bare = StaticModel::continuous(Array2::eye(2), None).expect("model");
    let evaluator = FimlEvaluator::new(bare, EngineConfig::default()).expect("engine");
    assert!(matches!(
        evaluator.evaluate(&data, FitState::default()),
        Err(EngineError::MissingThresholds { column: 1 })
    ));

    let small = StaticModel::continuous(Array2::eye(1), None).expect("model");
    let evaluator = FimlEvaluator::new(small, EngineConfig::default()).expect("engine");
    assert!(matches!(
        evaluator.evaluate(&data, FitState::default()),
        Err(EngineError::ColumnCount { model: 1, data: 2 })
    ));
}

/// Two continuous and two ordinal columns plus one definition variable. Each
/// row copies the previous one and then changes every column, its
/// missingness, and the definition value independently, so the full-row,
/// continuous-part and ordinal-part runs end at different rows.
fn drifting_joint_rows(rows: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.2).expect("normal");
    let mut values = Array2::<f64>::zeros((rows, 4));
    let mut definitions = Array2::<f64>::zeros((rows, 1));
    let mut current = [0.4, -0.1, 1.0, 0.0];
    let mut definition = 0.0;
    for row in 0..rows {
        for (col, value) in current.iter_mut().enumerate() {
            if rng.random::<f64>() < 0.25 {
                *value = if rng.random::<f64>() < 0.2 {
                    f64::NAN
                } else if col < 2 {
                    normal.sample(&mut rng)
                } else {
                    (rng.random::<f64>() * 3.0).floor()
                };
            }
        }
        if rng.random::<f64>() < 0.2 {
            definition = (rng.random::<f64>() * 3.0).floor();
        }
        for (col, &value) in current.iter().enumerate() {
            values[[row, col]] = value;
        }
        definitions[[row, 0]] = definition;
    }
    (values, definitions)
}

fn drifting_joint_model() -> LinearMeanModel {
    let cov = array![
        [1.5, 0.4, 0.3, -0.2],
        [0.4, 1.0, 0.2, 0.25],
        [0.3, 0.2, 1.2, 0.35],
        [-0.2, 0.25, 0.35, 0.9],
    ];
    let thresholds = ThresholdTable::new(vec![
        None,
        None,
        Some(ThresholdColumn::new(vec![-0.5, 0.6])),
        Some(ThresholdColumn::new(vec![-0.2, 0.9])),
    ]);
    let base = StaticModel::new(cov, Some(array![0.1, -0.2, 0.0, 0.3]), thresholds)
        .expect("model");
    LinearMeanModel::new(base, array![[0.3], [-0.15], [0.2], [0.1]]).expect("loadings")
}

#[test]
fn cache_policies_threads_and_row_recompute_agree_on_joint_rows() {
    for seed in 0..6 {
        let (values, definitions) = drifting_joint_rows(200, seed);
        let kinds = vec![
            ColumnKind::Continuous,
            ColumnKind::Continuous,
            ColumnKind::Ordinal,
            ColumnKind::Ordinal,
        ];
        let data = Dataset::from_arrays(kinds.clone(), values.clone(), definitions.clone())
            .expect("valid dataset");
        let n = data.row_count();

        let evaluate = |model: LinearMeanModel, config: EngineConfig| {
            FimlEvaluator::new(model, config)
                .expect("engine")
                .evaluate(&data, FitState::default())
                .expect("evaluation")
        };
        let granular = evaluate(drifting_joint_model(), EngineConfig::per_row());
        let coarse = evaluate(
            drifting_joint_model(),
            EngineConfig {
                cache_policy: CachePolicy::Coarse,
                ..EngineConfig::per_row()
            },
        );
        let threaded = evaluate(
            drifting_joint_model(),
            EngineConfig {
                threads: Some(4),
                min_rows_per_worker: 10,
                ..EngineConfig::per_row()
            },
        );
        let recomputed = evaluate(
            drifting_joint_model().with_row_recompute(true),
            EngineConfig::per_row(),
        );
        assert!(granular.stats().factorizations < recomputed.stats().factorizations);

        for row in 0..n {
            // A row on its own has no cache to reuse.
            let alone = Dataset::from_arrays(
                kinds.clone(),
                values.slice(s![row..row + 1, ..]).to_owned(),
                definitions.slice(s![row..row + 1, ..]).to_owned(),
            )
            .expect("valid dataset");
            let reference = FimlEvaluator::new(drifting_joint_model(), EngineConfig::per_row())
                .expect("engine")
                .evaluate(&alone, FitState::default())
                .expect("evaluation")
                .row_likelihoods()[0];
            assert!(reference > 0.0, "seed {seed} row {row}");

            let expected = granular.row_likelihoods()[row];
            assert_relative_eq!(expected, reference, max_relative = 1e-12);
            assert_relative_eq!(coarse.row_likelihoods()[row], expected, max_relative = 1e-12);
            assert_relative_eq!(threaded.row_likelihoods()[row], expected, max_relative = 1e-12);
            assert_relative_eq!(recomputed.row_likelihoods()[row], expected, max_relative = 1e-12);
        }
    }
}
