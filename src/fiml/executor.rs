//! Row-range entry points and the parallel evaluator.
//!
//! Each entry point walks `[begin, begin + count)` (snapped to run
//! boundaries, see [`row_span`]) with a private [`LocalContext`] and writes
//! only through its [`RowSink`]. [`FimlEvaluator`] partitions a dataset into
//! adjacent spans, runs one entry point per span on rayon, and scatters the
//! joined buffers into original row order.

use super::aggregate::{
    Contribution, CovarianceScope, DiagnosticKind, RowDiagnostic, RowFailure, RowOutcome,
    record_outcome,
};
use super::continuous;
use super::ordinal::{self, OrdinalError};
use super::reduce::RemovalMasks;
use super::sink::{EvaluationOutputs, RowSink};
use super::tracker::{RowStep, RowTracker, row_span};
use super::workspace::{EngineStats, Workspace};
use crate::data::RowSource;
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::model::ModelEvaluator;
use crate::orthant::{GenzIntegrator, OrthantIntegrator};
use crate::types::{CachePolicy, ColumnKind, EngineConfig, EvaluationMode, FitState, OutputMode};
use ndarray::Array1;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

/// Problems detected before any row is evaluated.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model has {model} variables but the dataset has {data} columns.")]
    ColumnCount { model: usize, data: usize },

    #[error("Model expects {model} definition values per row but the dataset provides {data}.")]
    DefinitionCount { model: usize, data: usize },

    #[error("Column {column} is {kind:?}, which the {mode:?} pipeline cannot evaluate.")]
    ModeMismatch {
        mode: EvaluationMode,
        column: usize,
        kind: ColumnKind,
    },

    #[error("Ordinal column {column} has no thresholds.")]
    MissingThresholds { column: usize },

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(String),
}

/// Worker-private state: read access to the data, a private copy of the
/// model and integrator, scratch buffers and collected diagnostics.
pub struct LocalContext<'a, D: ?Sized, M, I> {
    source: &'a D,
    model: M,
    integrator: I,
    workspace: Workspace,
    masks: RemovalMasks,
    previous_definitions: Array1<f64>,
    output_mode: OutputMode,
    cache_policy: CachePolicy,
    fit: FitState,
    diagnostics: Vec<RowDiagnostic>,
    stats: EngineStats,
}

impl<'a, D, M, I> LocalContext<'a, D, M, I>
where
    D: RowSource + ?Sized,
    M: ModelEvaluator,
    I: OrthantIntegrator,
{
    pub fn new(
        source: &'a D,
        model: M,
        integrator: I,
        config: &EngineConfig,
        fit: FitState,
    ) -> Self {
        let columns = source.column_count();
        Self {
            source,
            workspace: Workspace::new(model.dimension().max(columns)),
            masks: RemovalMasks::with_columns(columns),
            previous_definitions: Array1::from_elem(source.definition_count(), f64::NAN),
            model,
            integrator,
            output_mode: config.output_mode,
            cache_policy: config.cache_policy,
            fit,
            diagnostics: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn diagnostics(&self) -> &[RowDiagnostic] {
        &self.diagnostics
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn into_parts(self) -> (Vec<RowDiagnostic>, EngineStats) {
        (self.diagnostics, self.stats)
    }

    fn run_rows(
        &mut self,
        sink: &mut RowSink<'_>,
        begin: usize,
        count: usize,
        mode: EvaluationMode,
    ) {
        debug_assert_eq!(sink.range(), row_span(self.source, begin, count));
        self.previous_definitions.fill(f64::NAN);
        self.workspace.invalidate();
        let mut tracker = RowTracker::new(self.source, begin, count, self.cache_policy)
            .with_forced_recompute(self.model.requires_row_recompute());

        while let Some(step) = tracker.next_step(self.source) {
            let outcome = self.process_run(&step, mode);
            let succeeded = matches!(outcome, RowOutcome::Contribution(_));
            if !succeeded {
                self.workspace.invalidate();
                self.stats.failures += 1;
            }
            let original = self.source.original_index(step.row);
            record_outcome(
                sink,
                &step,
                &outcome,
                self.output_mode,
                original,
                &self.fit,
                &mut self.diagnostics,
            );
            self.stats.runs += 1;
            self.stats.rows += step.num_identical;
            tracker.finish(&step, succeeded);
        }
    }

    /// Bind the run's definition values and recompute the model when they
    /// differ from the previous run's. Returns whether the model changed.
    fn refresh_model(&mut self, step: &RowStep, mode: EvaluationMode) -> Result<bool, RowFailure> {
        let source = self.source;
        let definitions = source.definition_values(step.row);
        if let Some(index) = definitions.iter().position(|v| v.is_nan()) {
            return Err(RowFailure::DefinitionVariables {
                detail: format!("definition value {index} is missing"),
            });
        }
        let changed = !step.validity.definitions
            && definitions
                .iter()
                .zip(self.previous_definitions.iter())
                .any(|(a, b)| a.to_bits() != b.to_bits());
        if !(step.fresh || changed) {
            return Ok(false);
        }

        let as_failure = |e: crate::model::ModelError| RowFailure::DefinitionVariables {
            detail: e.to_string(),
        };
        self.model.bind_definition_values(definitions).map_err(as_failure)?;
        self.model.recompute().map_err(as_failure)?;
        self.previous_definitions.assign(&definitions);
        self.stats.model_recomputes += 1;
        log::debug!("model recomputed at row {}", step.row);

        if mode != EvaluationMode::Continuous && self.output_mode == OutputMode::Aggregate {
            if let Err(e) = self.model.thresholds().validate_increasing() {
                let row = source.original_index(step.row);
                log::warn!("{e}");
                self.diagnostics.push(RowDiagnostic {
                    kind: DiagnosticKind::ThresholdsNotIncreasing,
                    row,
                    message: format!("{e} (data row {})", row + 1),
                });
            }
        }
        Ok(true)
    }

    /// The per-run pipeline: model refresh, masks, continuous part, ordinal
    /// part. Any failure returns early with its kind.
    fn process_run(&mut self, step: &RowStep, mode: EvaluationMode) -> RowOutcome {
        let model_changed = match self.refresh_model(step, mode) {
            Ok(changed) => changed,
            Err(failure) => return RowOutcome::Failed(failure),
        };

        let source = self.source;
        let row = step.row;
        self.masks.classify(source, row);
        let p = match mode {
            EvaluationMode::Ordinal => 0,
            _ => self.masks.continuous().len(),
        };
        let m = match mode {
            EvaluationMode::Continuous => 0,
            _ => self.masks.ordinal().len(),
        };
        if p == 0 && m == 0 {
            self.workspace.invalidate();
            return RowOutcome::Contribution(Contribution::empty());
        }

        let validity = step.validity;
        let joint = mode == EvaluationMode::Joint;
        let ws = &mut self.workspace;
        ws.set_active(p, m);

        let mut factor_fresh = false;
        let mut terms_fresh = false;
        if p > 0 {
            let scope = if joint {
                CovarianceScope::Continuous
            } else {
                CovarianceScope::Full
            };
            if model_changed || !validity.continuous_missingness || !ws.factor_ready {
                ws.factor_ready = false;
                ws.continuous_terms_ready = false;
                if let Err(e) =
                    continuous::factor(ws, self.model.covariance(), self.masks.continuous())
                {
                    return RowOutcome::Failed(factor_failure(e, scope));
                }
                ws.factor_ready = true;
                factor_fresh = true;
                self.stats.factorizations += 1;
            }
            if factor_fresh || !validity.continuous_rows || !ws.continuous_terms_ready {
                continuous::residual(ws, source, row, self.model.means(), self.masks.continuous());
                continuous::mahalanobis(ws);
                ws.continuous_terms_ready = true;
                terms_fresh = true;
            }
        } else {
            ws.factor_ready = false;
            ws.continuous_terms_ready = false;
        }

        let mut ordinal_likelihood = 1.0;
        if m > 0 {
            let conditioned = joint && p > 0;
            let keys_valid = !model_changed
                && !factor_fresh
                && validity.ordinal_missingness
                && (!joint || validity.continuous_missingness);
            let mut cov_fresh = false;

            if conditioned {
                if !(keys_valid && ws.projection_ready) {
                    ws.projection_ready = false;
                    ordinal::project_cross_covariance(
                        ws,
                        self.model.covariance(),
                        self.masks.continuous(),
                        self.masks.ordinal(),
                    );
                    ws.projection_ready = true;
                    cov_fresh = true;
                    self.stats.projections += 1;
                }
            } else {
                ws.projection_ready = false;
            }

            if cov_fresh || !(keys_valid && ws.ordinal_cov_ready) {
                ws.ordinal_cov_ready = false;
                ws.ordinal_likelihood_ready = false;
                ordinal::conditional_covariance(
                    ws,
                    self.model.covariance(),
                    self.masks.ordinal(),
                    conditioned,
                );
                if let Err(e) = ordinal::standardize(ws, self.masks.ordinal()) {
                    return RowOutcome::Failed(ordinal_failure(e));
                }
                ws.ordinal_cov_ready = true;
                cov_fresh = true;
            }

            let reuse = !cov_fresh
                && !terms_fresh
                && validity.ordinal_rows
                && (!joint || validity.continuous_rows)
                && ws.ordinal_likelihood_ready;
            if !reuse {
                ws.ordinal_likelihood_ready = false;
                ordinal::conditional_means(
                    ws,
                    self.model.means(),
                    self.masks.ordinal(),
                    conditioned,
                );
                if let Err(e) = ordinal::threshold_bounds(
                    ws,
                    source,
                    row,
                    self.masks.ordinal(),
                    self.model.thresholds(),
                ) {
                    return RowOutcome::Failed(ordinal_failure(e));
                }
                if let Err(e) = ordinal::integrate(ws, &mut self.integrator) {
                    return RowOutcome::Failed(ordinal_failure(e));
                }
                ws.ordinal_likelihood_ready = true;
                self.stats.integrations += 1;
            }
            ordinal_likelihood = ws.ordinal_likelihood;
        } else {
            ws.projection_ready = false;
            ws.ordinal_cov_ready = false;
            ws.ordinal_likelihood_ready = false;
        }

        RowOutcome::Contribution(Contribution {
            continuous_dim: p,
            half_log_det: if p > 0 { ws.half_log_det } else { 0.0 },
            mahalanobis: if p > 0 { ws.mahalanobis } else { 0.0 },
            ordinal_likelihood,
        })
    }
}

fn factor_failure(error: FaerLinalgError, scope: CovarianceScope) -> RowFailure {
    match error {
        FaerLinalgError::Cholesky(_) | FaerLinalgError::DegenerateDiagonal { .. } => {
            RowFailure::NotPositiveDefinite { scope }
        }
        FaerLinalgError::NonFiniteInverse | FaerLinalgError::NotSquare { .. } => {
            RowFailure::Singular { scope }
        }
    }
}

fn ordinal_failure(error: OrdinalError) -> RowFailure {
    RowFailure::ImproperIntegration {
        detail: error.to_string(),
    }
}

/// Evaluate a range of an all-continuous dataset.
pub fn evaluate_continuous_rows<D, M, I>(
    local: &mut LocalContext<'_, D, M, I>,
    sink: &mut RowSink<'_>,
    begin: usize,
    count: usize,
) where
    D: RowSource + ?Sized,
    M: ModelEvaluator,
    I: OrthantIntegrator,
{
    local.run_rows(sink, begin, count, EvaluationMode::Continuous);
}

/// Evaluate a range of an all-ordinal dataset.
pub fn evaluate_ordinal_rows<D, M, I>(
    local: &mut LocalContext<'_, D, M, I>,
    sink: &mut RowSink<'_>,
    begin: usize,
    count: usize,
) where
    D: RowSource + ?Sized,
    M: ModelEvaluator,
    I: OrthantIntegrator,
{
    local.run_rows(sink, begin, count, EvaluationMode::Ordinal);
}

/// Evaluate a range of a dataset mixing continuous and ordinal columns.
pub fn evaluate_joint_rows<D, M, I>(
    local: &mut LocalContext<'_, D, M, I>,
    sink: &mut RowSink<'_>,
    begin: usize,
    count: usize,
) where
    D: RowSource + ?Sized,
    M: ModelEvaluator,
    I: OrthantIntegrator,
{
    local.run_rows(sink, begin, count, EvaluationMode::Joint);
}

/// `(begin, count)` ranges of near-equal size, at most `workers` of them and
/// none smaller than `min_rows` unless the dataset is.
pub fn plan_partitions(rows: usize, workers: usize, min_rows: usize) -> Vec<(usize, usize)> {
    let max_chunks = rows.div_ceil(min_rows.max(1)).max(1);
    let chunks = workers.clamp(1, max_chunks);
    (0..chunks)
        .map(|i| {
            let begin = i * rows / chunks;
            let end = (i + 1) * rows / chunks;
            (begin, end - begin)
        })
        .collect()
}

/// Parallel driver over a whole dataset.
pub struct FimlEvaluator<M, I = GenzIntegrator> {
    model: M,
    integrator: I,
    config: EngineConfig,
    pool: Option<ThreadPool>,
}

impl<M: ModelEvaluator + Sync> FimlEvaluator<M, GenzIntegrator> {
    pub fn new(model: M, config: EngineConfig) -> Result<Self, EngineError> {
        let integrator = GenzIntegrator::new(config.integrator.clone(), model.dimension());
        Self::with_integrator(model, integrator, config)
    }
}

impl<M, I> FimlEvaluator<M, I>
where
    M: ModelEvaluator + Sync,
    I: OrthantIntegrator + Sync,
{
    pub fn with_integrator(
        model: M,
        integrator: I,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let pool = match config.threads {
            Some(threads) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads.max(1))
                    .build()
                    .map_err(|e| EngineError::ThreadPool(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            model,
            integrator,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Update parameters between evaluations.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn validate<D: RowSource + ?Sized>(
        &self,
        source: &D,
        mode: EvaluationMode,
    ) -> Result<(), EngineError> {
        let columns = source.column_count();
        if self.model.dimension() != columns {
            return Err(EngineError::ColumnCount {
                model: self.model.dimension(),
                data: columns,
            });
        }
        if self.model.definition_count() != source.definition_count() {
            return Err(EngineError::DefinitionCount {
                model: self.model.definition_count(),
                data: source.definition_count(),
            });
        }
        for column in 0..columns {
            let kind = source.column_kind(column);
            if !mode.accepts(kind) {
                return Err(EngineError::ModeMismatch { mode, column, kind });
            }
            if kind == ColumnKind::Ordinal
                && self
                    .model
                    .thresholds()
                    .column(column)
                    .is_none_or(|t| t.cutpoint_count() == 0)
            {
                return Err(EngineError::MissingThresholds { column });
            }
        }
        Ok(())
    }

    /// Evaluate with the narrowest pipeline covering the dataset's columns.
    pub fn evaluate<D: RowSource + ?Sized>(
        &self,
        source: &D,
        fit: FitState,
    ) -> Result<EvaluationOutputs, EngineError> {
        let mode = EvaluationMode::infer((0..source.column_count()).map(|c| source.column_kind(c)));
        self.evaluate_with_mode(source, mode, fit)
    }

    pub fn evaluate_with_mode<D: RowSource + ?Sized>(
        &self,
        source: &D,
        mode: EvaluationMode,
        fit: FitState,
    ) -> Result<EvaluationOutputs, EngineError> {
        self.validate(source, mode)?;
        let n = source.row_count();
        let workers = self
            .pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, ThreadPool::current_num_threads);
        let ranges = plan_partitions(n, workers, self.config.min_rows_per_worker);
        log::debug!("evaluating {n} rows in {} {mode:?} partitions", ranges.len());

        let mut likelihood = vec![0.0; n];
        let mut neg2 = vec![0.0; n];
        let mut tasks = Vec::with_capacity(ranges.len());
        {
            let mut likelihood_rest: &mut [f64] = &mut likelihood;
            let mut neg2_rest: &mut [f64] = &mut neg2;
            let mut consumed = 0;
            for (begin, count) in ranges {
                let span = row_span(source, begin, count);
                debug_assert_eq!(span.start, consumed);
                let (lik, lik_tail) = std::mem::take(&mut likelihood_rest).split_at_mut(span.len());
                let (ng, ng_tail) = std::mem::take(&mut neg2_rest).split_at_mut(span.len());
                likelihood_rest = lik_tail;
                neg2_rest = ng_tail;
                consumed = span.end;
                tasks.push((begin, count, RowSink::new(span.start, lik, ng)));
            }
        }

        let run = || {
            tasks
                .into_par_iter()
                .map(|(begin, count, mut sink)| {
                    let mut local = LocalContext::new(
                        source,
                        self.model.clone(),
                        self.integrator.clone(),
                        &self.config,
                        fit,
                    );
                    match mode {
                        EvaluationMode::Continuous => {
                            evaluate_continuous_rows(&mut local, &mut sink, begin, count)
                        }
                        EvaluationMode::Ordinal => {
                            evaluate_ordinal_rows(&mut local, &mut sink, begin, count)
                        }
                        EvaluationMode::Joint => {
                            evaluate_joint_rows(&mut local, &mut sink, begin, count)
                        }
                    }
                    local.into_parts()
                })
                .collect::<Vec<_>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        let mut diagnostics = Vec::new();
        let mut stats = EngineStats::default();
        for (worker_diagnostics, worker_stats) in results {
            diagnostics.extend(worker_diagnostics);
            stats.merge(&worker_stats);
        }

        let mut likelihoods = vec![0.0; n];
        let mut neg2_log_likelihoods = vec![0.0; n];
        for row in 0..n {
            let original = source.original_index(row);
            likelihoods[original] = likelihood[row];
            neg2_log_likelihoods[original] = neg2[row];
        }

        Ok(EvaluationOutputs {
            mode: self.config.output_mode,
            likelihoods,
            neg2_log_likelihoods,
            diagnostics,
            stats,
        })
    }
}
