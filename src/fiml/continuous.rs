//! Gaussian density of the observed continuous subset of a row.

use super::workspace::Workspace;
use crate::data::RowSource;
use crate::linalg::faer_ndarray::{FaerLinalgError, cholesky_half_log_det_and_inverse};
use crate::linalg::utils::gather_block;
use ndarray::linalg::general_mat_vec_mul;
use ndarray::{ArrayView1, ArrayView2, s};
use std::f64::consts::PI;

/// `ln(2π)`
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Gather the reduced covariance for `columns` and factor it, leaving the
/// inverse in the workspace. Returns half the log-determinant.
pub fn factor(
    ws: &mut Workspace,
    covariance: ArrayView2<'_, f64>,
    columns: &[usize],
) -> Result<f64, FaerLinalgError> {
    gather_block(covariance, columns, columns, ws.continuous_cov_mut());
    let p = ws.continuous_dim();
    let half_log_det = cholesky_half_log_det_and_inverse(
        &ws.continuous_cov.slice(s![..p, ..p]),
        ws.continuous_inv.slice_mut(s![..p, ..p]),
    )?;
    ws.half_log_det = half_log_det;
    Ok(half_log_det)
}

/// `residual = data - mean` over `columns`; absent means count as zero.
pub fn residual<D: RowSource + ?Sized>(
    ws: &mut Workspace,
    source: &D,
    row: usize,
    means: Option<ArrayView1<'_, f64>>,
    columns: &[usize],
) {
    let mut out = ws.residual_mut();
    for (k, &c) in columns.iter().enumerate() {
        let mu = means.as_ref().map_or(0.0, |m| m[c]);
        out[k] = source.value_at(row, c) - mu;
    }
}

/// `Q = r' Σ⁻¹ r` for the current residual and inverse.
pub fn mahalanobis(ws: &mut Workspace) -> f64 {
    let p = ws.continuous_dim();
    general_mat_vec_mul(
        1.0,
        &ws.continuous_inv.slice(s![..p, ..p]),
        &ws.residual.slice(s![..p]),
        0.0,
        &mut ws.weighted_residual.slice_mut(s![..p]),
    );
    let q = ws
        .residual
        .slice(s![..p])
        .dot(&ws.weighted_residual.slice(s![..p]));
    ws.mahalanobis = q;
    q
}

/// `(2π)^(-p/2) · exp(-half_log_det) · exp(-Q/2)`
pub fn likelihood(dim: usize, half_log_det: f64, mahalanobis: f64) -> f64 {
    (2.0 * PI).powf(-0.5 * dim as f64) * (-half_log_det).exp() * (-0.5 * mahalanobis).exp()
}

/// `2·half_log_det + Q + p·ln(2π)`
pub fn neg2_log_likelihood(dim: usize, half_log_det: f64, mahalanobis: f64) -> f64 {
    2.0 * half_log_det + mahalanobis + dim as f64 * LN_2PI
}
