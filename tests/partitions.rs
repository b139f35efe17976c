use approx::assert_relative_eq;
use fiml::data::{Dataset, no_definitions};
use fiml::model::{StaticModel, ThresholdColumn, ThresholdTable};
use fiml::orthant::{GenzIntegrator, IntegratorConfig};
use fiml::{
    ColumnKind, EngineConfig, FimlEvaluator, FitState, LocalContext, RowSink, RowSource,
    evaluate_joint_rows, row_span,
};
use ndarray::{Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Joint data with duplicated rows so runs straddle partition boundaries.
fn joint_dataset(rows: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("unit normal");
    let mut values = Array2::<f64>::zeros((rows, 3));
    let mut row = 0;
    while row < rows {
        let repeat = 1 + (rng.random::<f64>() * 4.0) as usize;
        let x = if rng.random::<f64>() < 0.2 {
            f64::NAN
        } else {
            normal.sample(&mut rng)
        };
        let y = normal.sample(&mut rng);
        let k = if rng.random::<f64>() < 0.15 {
            f64::NAN
        } else {
            (rng.random::<f64>() * 3.0).floor()
        };
        for r in row..(row + repeat).min(rows) {
            values[[r, 0]] = x;
            values[[r, 1]] = y;
            values[[r, 2]] = k;
        }
        row += repeat;
    }
    Dataset::from_arrays(
        vec![ColumnKind::Continuous, ColumnKind::Continuous, ColumnKind::Ordinal],
        values,
        no_definitions(rows),
    )
    .expect("valid dataset")
}

fn joint_model() -> StaticModel {
    let cov = array![[1.0, 0.3, 0.4], [0.3, 2.0, -0.2], [0.4, -0.2, 1.5]];
    let thresholds = ThresholdTable::new(vec![
        None,
        None,
        Some(ThresholdColumn::new(vec![-0.6, 0.7])),
    ]);
    StaticModel::new(cov, Some(array![0.1, -0.3, 0.2]), thresholds).expect("model")
}

/// Run `evaluate_joint_rows` once per range and stitch the windows together.
fn evaluate_ranges(
    data: &Dataset,
    config: &EngineConfig,
    ranges: &[(usize, usize)],
) -> (Vec<f64>, Vec<f64>) {
    let n = data.row_count();
    let model = joint_model();
    let mut likelihood = vec![f64::NAN; n];
    let mut neg2 = vec![f64::NAN; n];
    for &(begin, count) in ranges {
        let span = row_span(data, begin, count);
        let mut local = LocalContext::new(
            data,
            model.clone(),
            GenzIntegrator::new(IntegratorConfig::default(), 3),
            config,
            FitState::default(),
        );
        let mut sink = RowSink::new(
            span.start,
            &mut likelihood[span.clone()],
            &mut neg2[span.clone()],
        );
        evaluate_joint_rows(&mut local, &mut sink, begin, count);
    }
    (likelihood, neg2)
}

#[test]
fn spans_of_adjacent_ranges_tile_the_dataset() {
    let data = joint_dataset(120, 3);
    let n = data.row_count();
    for split in 0..=n {
        let left = row_span(&data, 0, split);
        let right = row_span(&data, split, n - split);
        assert_eq!(left.start, 0);
        assert_eq!(left.end, right.start, "split at {split}");
        assert_eq!(right.end, n);
    }
}

#[test]
fn results_do_not_depend_on_where_ranges_split() {
    let data = joint_dataset(90, 21);
    let n = data.row_count();
    for config in [EngineConfig::default(), EngineConfig::per_row()] {
        let (whole_lik, whole_neg2) = evaluate_ranges(&data, &config, &[(0, n)]);
        assert!(whole_lik.iter().all(|v| v.is_finite()));
        for split in [1, 7, 13, 44, 45, 46, 89] {
            let (lik, neg2) = evaluate_ranges(&data, &config, &[(0, split), (split, n - split)]);
            for row in 0..n {
                assert_relative_eq!(lik[row], whole_lik[row], max_relative = 1e-12);
                assert_relative_eq!(neg2[row], whole_neg2[row], max_relative = 1e-12);
            }
        }
        let thirds = [(0, 30), (30, 30), (60, 30)];
        let (lik, _) = evaluate_ranges(&data, &config, &thirds);
        for row in 0..n {
            assert_relative_eq!(lik[row], whole_lik[row], max_relative = 1e-12);
        }
    }
}

#[test]
fn range_starting_inside_a_run_skips_to_the_next_run() {
    let data = Dataset::from_arrays(
        vec![ColumnKind::Continuous],
        array![[1.0], [1.0], [1.0], [2.0], [3.0]],
        no_definitions(5),
    )
    .expect("valid dataset");
    assert_eq!(row_span(&data, 1, 2), 3..3);
    assert_eq!(row_span(&data, 0, 2), 0..3);
    assert_eq!(row_span(&data, 2, 2), 3..4);
    assert_eq!(row_span(&data, 3, 2), 3..5);
}

#[test]
fn thread_count_does_not_change_outputs() {
    let data = joint_dataset(400, 8);
    let single = FimlEvaluator::new(
        joint_model(),
        EngineConfig {
            threads: Some(1),
            ..EngineConfig::default()
        },
    )
    .expect("engine")
    .evaluate(&data, FitState::default())
    .expect("single-threaded");
    let many = FimlEvaluator::new(
        joint_model(),
        EngineConfig {
            threads: Some(4),
            min_rows_per_worker: 10,
            ..EngineConfig::default()
        },
    )
    .expect("engine")
    .evaluate(&data, FitState::default())
    .expect("multi-threaded");

    for (a, b) in single.row_likelihoods().iter().zip(many.row_likelihoods()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
    }
    assert_relative_eq!(
        single.total_neg2_log_likelihood(),
        many.total_neg2_log_likelihood(),
        max_relative = 1e-12
    );
    assert_eq!(single.stats().rows, 400);
    assert_eq!(many.stats().rows, 400);
}

#[test]
fn sorted_dataset_reports_in_original_row_order() {
    let data = joint_dataset(150, 44);
    let sorted = data.sorted_into_runs();
    let evaluator = FimlEvaluator::new(
        joint_model(),
        EngineConfig {
            threads: Some(3),
            min_rows_per_worker: 16,
            ..EngineConfig::per_row()
        },
    )
    .expect("engine");
    let plain = evaluator.evaluate(&data, FitState::default()).expect("plain");
    let grouped = evaluator.evaluate(&sorted, FitState::default()).expect("sorted");
    assert!(grouped.stats().runs <= plain.stats().runs);
    for (a, b) in plain.row_likelihoods().iter().zip(grouped.row_likelihoods()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
    }
}
