use crate::orthant::BoundKind;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, s};

/// Per-worker scratch storage.
///
/// Every buffer is allocated once at the model dimension and addressed by
/// role; the active block of each role is `[..p, ..p]` / `[..p, ..m]` /
/// `[..m, ..m]` for the current row's `p` continuous and `m` ordinal columns.
/// The `*_ready` flags say whether the role still holds a value computed for
/// the current cache keys; they are cleared whenever a run fails or skips
/// the computation.
#[derive(Debug, Clone)]
pub struct Workspace {
    capacity: usize,
    continuous_dim: usize,
    ordinal_dim: usize,

    pub(crate) continuous_cov: Array2<f64>,
    pub(crate) continuous_inv: Array2<f64>,
    pub(crate) residual: Array1<f64>,
    pub(crate) weighted_residual: Array1<f64>,

    pub(crate) cross_cov: Array2<f64>,
    pub(crate) half_cov: Array2<f64>,
    pub(crate) reduced: Array2<f64>,
    pub(crate) ordinal_cov: Array2<f64>,
    pub(crate) ordinal_means: Array1<f64>,
    pub(crate) correlation: Array2<f64>,
    pub(crate) weights: Array1<f64>,
    pub(crate) lower: Array1<f64>,
    pub(crate) upper: Array1<f64>,
    pub(crate) bounds: Vec<BoundKind>,

    pub(crate) half_log_det: f64,
    pub(crate) mahalanobis: f64,
    pub(crate) ordinal_likelihood: f64,

    pub(crate) factor_ready: bool,
    pub(crate) projection_ready: bool,
    pub(crate) ordinal_cov_ready: bool,
    pub(crate) continuous_terms_ready: bool,
    pub(crate) ordinal_likelihood_ready: bool,
}

impl Workspace {
    pub fn new(capacity: usize) -> Self {
        let square = || Array2::zeros((capacity, capacity));
        Self {
            capacity,
            continuous_dim: 0,
            ordinal_dim: 0,
            continuous_cov: square(),
            continuous_inv: square(),
            residual: Array1::zeros(capacity),
            weighted_residual: Array1::zeros(capacity),
            cross_cov: square(),
            half_cov: square(),
            reduced: square(),
            ordinal_cov: square(),
            ordinal_means: Array1::zeros(capacity),
            correlation: square(),
            weights: Array1::zeros(capacity),
            lower: Array1::zeros(capacity),
            upper: Array1::zeros(capacity),
            bounds: vec![BoundKind::Between; capacity],
            half_log_det: 0.0,
            mahalanobis: 0.0,
            ordinal_likelihood: 1.0,
            factor_ready: false,
            projection_ready: false,
            ordinal_cov_ready: false,
            continuous_terms_ready: false,
            ordinal_likelihood_ready: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_active(&mut self, continuous: usize, ordinal: usize) {
        debug_assert!(continuous <= self.capacity && ordinal <= self.capacity);
        self.continuous_dim = continuous;
        self.ordinal_dim = ordinal;
    }

    pub fn continuous_dim(&self) -> usize {
        self.continuous_dim
    }

    pub fn ordinal_dim(&self) -> usize {
        self.ordinal_dim
    }

    /// Drop every cached quantity.
    pub fn invalidate(&mut self) {
        self.factor_ready = false;
        self.projection_ready = false;
        self.ordinal_cov_ready = false;
        self.continuous_terms_ready = false;
        self.ordinal_likelihood_ready = false;
    }

    pub fn continuous_cov(&self) -> ArrayView2<'_, f64> {
        let p = self.continuous_dim;
        self.continuous_cov.slice(s![..p, ..p])
    }

    pub fn continuous_inverse(&self) -> ArrayView2<'_, f64> {
        let p = self.continuous_dim;
        self.continuous_inv.slice(s![..p, ..p])
    }

    pub fn residual(&self) -> ArrayView1<'_, f64> {
        self.residual.slice(s![..self.continuous_dim])
    }

    pub fn half_cov(&self) -> ArrayView2<'_, f64> {
        self.half_cov.slice(s![..self.continuous_dim, ..self.ordinal_dim])
    }

    pub fn ordinal_cov(&self) -> ArrayView2<'_, f64> {
        let m = self.ordinal_dim;
        self.ordinal_cov.slice(s![..m, ..m])
    }

    pub fn ordinal_means(&self) -> ArrayView1<'_, f64> {
        self.ordinal_means.slice(s![..self.ordinal_dim])
    }

    pub fn correlation(&self) -> ArrayView2<'_, f64> {
        let m = self.ordinal_dim;
        self.correlation.slice(s![..m, ..m])
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.slice(s![..self.ordinal_dim])
    }

    pub fn lower(&self) -> ArrayView1<'_, f64> {
        self.lower.slice(s![..self.ordinal_dim])
    }

    pub fn upper(&self) -> ArrayView1<'_, f64> {
        self.upper.slice(s![..self.ordinal_dim])
    }

    pub fn bounds(&self) -> &[BoundKind] {
        &self.bounds[..self.ordinal_dim]
    }

    pub(crate) fn continuous_cov_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        let p = self.continuous_dim;
        self.continuous_cov.slice_mut(s![..p, ..p])
    }

    pub(crate) fn residual_mut(&mut self) -> ArrayViewMut1<'_, f64> {
        let p = self.continuous_dim;
        self.residual.slice_mut(s![..p])
    }
}

/// Work counters for one evaluation, summed across workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Identical-row runs processed.
    pub runs: usize,
    /// Rows covered by those runs.
    pub rows: usize,
    pub model_recomputes: usize,
    pub factorizations: usize,
    pub projections: usize,
    pub integrations: usize,
    pub failures: usize,
}

impl EngineStats {
    pub fn merge(&mut self, other: &EngineStats) {
        self.runs += other.runs;
        self.rows += other.rows;
        self.model_recomputes += other.model_recomputes;
        self.factorizations += other.factorizations;
        self.projections += other.projections;
        self.integrations += other.integrations;
        self.failures += other.failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_views_track_dimensions() {
        let mut ws = Workspace::new(4);
        ws.set_active(3, 1);
        assert_eq!(ws.continuous_cov().dim(), (3, 3));
        assert_eq!(ws.half_cov().dim(), (3, 1));
        assert_eq!(ws.correlation().dim(), (1, 1));
        assert_eq!(ws.bounds().len(), 1);
        ws.set_active(0, 4);
        assert_eq!(ws.residual().len(), 0);
        assert_eq!(ws.ordinal_cov().dim(), (4, 4));
        assert_eq!(ws.capacity(), 4);
    }

    #[test]
    fn invalidate_clears_every_cache() {
        let mut ws = Workspace::new(2);
        ws.factor_ready = true;
        ws.ordinal_likelihood_ready = true;
        ws.invalidate();
        assert!(!ws.factor_ready && !ws.ordinal_likelihood_ready);
    }
}
