//! Ordinal likelihood: optional conditioning on the continuous residual,
//! standardization, threshold bounds and the orthant integral.

use super::workspace::Workspace;
use crate::data::RowSource;
use crate::linalg::utils::{gather_block, gather_vector};
use crate::model::{ThresholdError, ThresholdTable};
use crate::orthant::{Inform, OrthantIntegrator, OrthantResult};
use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{ArrayView1, ArrayView2, s};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrdinalError {
    #[error("ordinal column {column} has non-positive conditional variance {variance}")]
    Variance { column: usize, variance: f64 },
    #[error("ordinal column {column} has no threshold table")]
    MissingThresholds { column: usize },
    #[error("ordinal column {column}: {source}")]
    Threshold {
        column: usize,
        source: ThresholdError,
    },
    #[error("integrator rejected the input")]
    Improper,
}

/// `halfCov = Σcc⁻¹ Σco` and `reduced = Σcoᵗ halfCov`, using the inverse
/// already in the workspace.
pub fn project_cross_covariance(
    ws: &mut Workspace,
    covariance: ArrayView2<'_, f64>,
    continuous: &[usize],
    ordinal: &[usize],
) {
    let (p, m) = (continuous.len(), ordinal.len());
    gather_block(
        covariance,
        continuous,
        ordinal,
        ws.cross_cov.slice_mut(s![..p, ..m]),
    );
    general_mat_mul(
        1.0,
        &ws.continuous_inv.slice(s![..p, ..p]),
        &ws.cross_cov.slice(s![..p, ..m]),
        0.0,
        &mut ws.half_cov.slice_mut(s![..p, ..m]),
    );
    general_mat_mul(
        1.0,
        &ws.cross_cov.slice(s![..p, ..m]).t(),
        &ws.half_cov.slice(s![..p, ..m]),
        0.0,
        &mut ws.reduced.slice_mut(s![..m, ..m]),
    );
}

/// `Σoo` over the retained ordinal columns, minus `reduced` when
/// `conditioned`.
pub fn conditional_covariance(
    ws: &mut Workspace,
    covariance: ArrayView2<'_, f64>,
    ordinal: &[usize],
    conditioned: bool,
) {
    let m = ordinal.len();
    gather_block(covariance, ordinal, ordinal, ws.ordinal_cov.slice_mut(s![..m, ..m]));
    if conditioned {
        let mut target = ws.ordinal_cov.slice_mut(s![..m, ..m]);
        target -= &ws.reduced.slice(s![..m, ..m]);
    }
}

/// `μo` over the retained ordinal columns, plus `halfCovᵗ r` when
/// `conditioned`. Absent means count as zero.
pub fn conditional_means(
    ws: &mut Workspace,
    means: Option<ArrayView1<'_, f64>>,
    ordinal: &[usize],
    conditioned: bool,
) {
    let m = ordinal.len();
    match means {
        Some(mu) => gather_vector(mu, ordinal, ws.ordinal_means.slice_mut(s![..m])),
        None => ws.ordinal_means.slice_mut(s![..m]).fill(0.0),
    }
    if conditioned {
        let p = ws.continuous_dim();
        general_mat_vec_mul(
            1.0,
            &ws.half_cov.slice(s![..p, ..m]).t(),
            &ws.residual.slice(s![..p]),
            1.0,
            &mut ws.ordinal_means.slice_mut(s![..m]),
        );
    }
}

/// Split the ordinal covariance into a correlation matrix and per-column
/// standard deviations.
pub fn standardize(ws: &mut Workspace, ordinal: &[usize]) -> Result<(), OrdinalError> {
    let m = ordinal.len();
    for (k, &column) in ordinal.iter().enumerate() {
        let variance = ws.ordinal_cov[[k, k]];
        if !(variance.is_finite() && variance > 0.0) {
            return Err(OrdinalError::Variance { column, variance });
        }
        ws.weights[k] = variance.sqrt();
    }
    for i in 0..m {
        for j in 0..m {
            ws.correlation[[i, j]] = if i == j {
                1.0
            } else {
                ws.ordinal_cov[[i, j]] / (ws.weights[i] * ws.weights[j])
            };
        }
    }
    Ok(())
}

/// Standardized integration limits for each retained ordinal column:
/// `(t - μ) / σ` on both sides of the observed category.
pub fn threshold_bounds<D: RowSource + ?Sized>(
    ws: &mut Workspace,
    source: &D,
    row: usize,
    ordinal: &[usize],
    thresholds: &ThresholdTable,
) -> Result<(), OrdinalError> {
    for (k, &column) in ordinal.iter().enumerate() {
        let table = thresholds
            .column(column)
            .ok_or(OrdinalError::MissingThresholds { column })?;
        let category = source
            .category_at(row, column)
            .ok_or(OrdinalError::Threshold {
                column,
                source: ThresholdError::Unbounded { category: 0 },
            })?;
        let bounds = table
            .bounds(category)
            .map_err(|source| OrdinalError::Threshold { column, source })?;
        let (mu, sd) = (ws.ordinal_means[k], ws.weights[k]);
        ws.lower[k] = (bounds.lower - mu) / sd;
        ws.upper[k] = (bounds.upper - mu) / sd;
        ws.bounds[k] = bounds.kind;
    }
    Ok(())
}

/// Orthant probability of the prepared bounds; `Improper` input is an error.
pub fn integrate<I: OrthantIntegrator>(
    ws: &mut Workspace,
    integrator: &mut I,
) -> Result<OrthantResult, OrdinalError> {
    let m = ws.ordinal_dim();
    let result = integrator.integrate(
        ws.correlation.slice(s![..m, ..m]),
        ws.lower.slice(s![..m]),
        ws.upper.slice(s![..m]),
        &ws.bounds[..m],
    );
    if result.inform == Inform::Improper {
        return Err(OrdinalError::Improper);
    }
    if result.inform == Inform::ToleranceNotMet {
        log::debug!(
            "orthant integral of dimension {m} stopped at error {:.3e}",
            result.error
        );
    }
    ws.ordinal_likelihood = result.probability;
    Ok(result)
}
