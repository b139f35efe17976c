//! Combining contributions, writing outputs and the row error policy.

use super::continuous;
use super::sink::RowSink;
use super::tracker::RowStep;
use crate::types::{FitState, OutputMode};
use serde::Serialize;
use thiserror::Error;

/// Likelihood pieces of one run. A row with no continuous part has
/// `continuous_dim == 0`; a row with no ordinal part has
/// `ordinal_likelihood == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub continuous_dim: usize,
    pub half_log_det: f64,
    pub mahalanobis: f64,
    pub ordinal_likelihood: f64,
}

impl Contribution {
    /// Row without any usable column.
    pub fn empty() -> Self {
        Self {
            continuous_dim: 0,
            half_log_det: 0.0,
            mahalanobis: 0.0,
            ordinal_likelihood: 1.0,
        }
    }

    pub fn likelihood(&self) -> f64 {
        continuous::likelihood(self.continuous_dim, self.half_log_det, self.mahalanobis)
            * self.ordinal_likelihood
    }

    /// `-2·ln(ordinal) + 2·half_log_det + Q + p·ln(2π)` for one row.
    pub fn neg2_log_likelihood(&self) -> f64 {
        if self.continuous_dim == 0 && self.ordinal_likelihood == 1.0 {
            return 0.0;
        }
        -2.0 * self.ordinal_likelihood.ln()
            + continuous::neg2_log_likelihood(
                self.continuous_dim,
                self.half_log_det,
                self.mahalanobis,
            )
    }
}

/// Which covariance a failure refers to, for diagnostic wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceScope {
    /// Every modeled variable is continuous.
    Full,
    /// Continuous block of a joint model.
    Continuous,
    /// Ordinal block, possibly conditioned.
    Ordinal,
}

impl CovarianceScope {
    fn noun(self) -> &'static str {
        match self {
            CovarianceScope::Full => "Expected covariance matrix",
            CovarianceScope::Continuous => "Expected covariance matrix for continuous variables",
            CovarianceScope::Ordinal => "Expected covariance matrix for ordinal variables",
        }
    }
}

/// Row-local failure. Never aborts the row loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowFailure {
    #[error("definition variables could not be resolved: {detail}")]
    DefinitionVariables { detail: String },
    #[error("{} is not positive-definite", .scope.noun())]
    NotPositiveDefinite { scope: CovarianceScope },
    #[error("cannot invert {}", .scope.noun().to_lowercase())]
    Singular { scope: CovarianceScope },
    #[error("improper value detected by integration routine: {detail}")]
    ImproperIntegration { detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    DefinitionVariables,
    NotPositiveDefinite,
    Singular,
    ImproperIntegration,
    ThresholdsNotIncreasing,
}

/// Non-fatal message about one data row, in original row numbering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowDiagnostic {
    pub kind: DiagnosticKind,
    pub row: usize,
    pub message: String,
}

impl RowFailure {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            RowFailure::DefinitionVariables { .. } => DiagnosticKind::DefinitionVariables,
            RowFailure::NotPositiveDefinite { .. } => DiagnosticKind::NotPositiveDefinite,
            RowFailure::Singular { .. } => DiagnosticKind::Singular,
            RowFailure::ImproperIntegration { .. } => DiagnosticKind::ImproperIntegration,
        }
    }

    /// `row` is 0-based; messages number data rows from 1.
    pub fn diagnostic(&self, row: usize, fit: &FitState) -> RowDiagnostic {
        let n = row + 1;
        let at = fit.location();
        let message = match self {
            RowFailure::DefinitionVariables { detail } => {
                format!(
                    "Definition variables in data row {n} could not be resolved {at}: {detail}."
                )
            }
            RowFailure::NotPositiveDefinite { scope } => {
                format!("{} is not positive-definite in data row {n} {at}.", scope.noun())
            }
            RowFailure::Singular { scope } => format!(
                "Cannot invert {} in data row {n} {at}.",
                scope.noun().to_lowercase()
            ),
            RowFailure::ImproperIntegration { detail } => format!(
                "Improper value detected by integration routine in data row {n} {at}: Most likely the expected covariance matrix is not positive-definite ({detail})."
            ),
        };
        RowDiagnostic {
            kind: self.kind(),
            row,
            message,
        }
    }
}

/// Result of the row pipeline for one run.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Contribution(Contribution),
    Failed(RowFailure),
}

/// Write one run's outcome into the sink.
///
/// Every row of the run receives the likelihood (0 on failure). In
/// aggregate mode the representative row receives `num_identical` times the
/// run's -2 log-likelihood (`+inf` on failure) and the other rows 0; per-row
/// mode leaves the -2 log-likelihood column at 0. Failures are recorded as
/// diagnostics in aggregate mode only.
pub fn record_outcome(
    sink: &mut RowSink<'_>,
    step: &RowStep,
    outcome: &RowOutcome,
    mode: OutputMode,
    original_row: usize,
    fit: &FitState,
    diagnostics: &mut Vec<RowDiagnostic>,
) {
    let (likelihood, neg2) = match outcome {
        RowOutcome::Contribution(c) => (c.likelihood(), c.neg2_log_likelihood()),
        RowOutcome::Failed(failure) => {
            if mode == OutputMode::Aggregate {
                let diagnostic = failure.diagnostic(original_row, fit);
                log::warn!("{}", diagnostic.message);
                diagnostics.push(diagnostic);
            }
            (0.0, f64::INFINITY)
        }
    };
    let representative = match mode {
        OutputMode::Aggregate => neg2 * step.num_identical as f64,
        OutputMode::PerRow => 0.0,
    };
    sink.write_run(step.row, step.num_identical, likelihood, representative);
}
