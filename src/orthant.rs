//! Multivariate normal rectangle probabilities for ordinal likelihoods.
//!
//! The engine only depends on [`OrthantIntegrator`]; [`GenzIntegrator`] is the
//! default implementation. Dimensions one and two are evaluated in closed
//! form / by quadrature, higher dimensions by separation of variables over a
//! randomized Richtmyer lattice.

use crate::probability::{bivariate_normal_cdf, normal_cdf, standard_normal_quantile};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Which ends of an integration interval are finite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundKind {
    /// `(-inf, upper]`
    Below,
    /// `[lower, +inf)`
    Above,
    /// `[lower, upper]`
    Between,
}

impl BoundKind {
    /// Infinity code in the conventional 0/1/2 encoding.
    pub fn code(self) -> u8 {
        match self {
            BoundKind::Below => 0,
            BoundKind::Above => 1,
            BoundKind::Between => 2,
        }
    }

    fn limits(self, lower: f64, upper: f64) -> (f64, f64) {
        match self {
            BoundKind::Below => (f64::NEG_INFINITY, upper),
            BoundKind::Above => (lower, f64::INFINITY),
            BoundKind::Between => (lower, upper),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inform {
    Converged,
    ToleranceNotMet,
    /// Input the integrator cannot work with, typically a correlation matrix
    /// that is not positive definite.
    Improper,
}

impl Inform {
    pub fn code(self) -> u8 {
        match self {
            Inform::Converged => 0,
            Inform::ToleranceNotMet => 1,
            Inform::Improper => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrthantResult {
    pub probability: f64,
    pub error: f64,
    pub inform: Inform,
}

impl OrthantResult {
    fn exact(probability: f64) -> Self {
        Self {
            probability,
            error: 0.0,
            inform: Inform::Converged,
        }
    }

    fn improper() -> Self {
        Self {
            probability: 0.0,
            error: 1.0,
            inform: Inform::Improper,
        }
    }
}

/// Rectangle probability of a zero-mean normal with the given correlation.
///
/// `lower`, `upper` and `bounds` have one entry per dimension; the half of a
/// pair that `bounds` marks as infinite is ignored. Implementations are
/// cloned once per worker and may keep scratch storage in `self`.
pub trait OrthantIntegrator: Clone + Send {
    fn integrate(
        &mut self,
        correlation: ArrayView2<'_, f64>,
        lower: ArrayView1<'_, f64>,
        upper: ArrayView1<'_, f64>,
        bounds: &[BoundKind],
    ) -> OrthantResult;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IntegratorConfig {
    /// Budget of integrand evaluations per call.
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    #[serde(default = "default_abs_tolerance")]
    pub abs_tolerance: f64,
    #[serde(default)]
    pub rel_tolerance: f64,
    /// Number of random lattice shifts used for the error estimate.
    #[serde(default = "default_shifts")]
    pub shifts: usize,
    #[serde(default = "default_integrator_seed")]
    pub seed: u64,
}

fn default_max_points() -> usize {
    25_000
}

fn default_abs_tolerance() -> f64 {
    1e-4
}

fn default_shifts() -> usize {
    10
}

fn default_integrator_seed() -> u64 {
    42
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            max_points: default_max_points(),
            abs_tolerance: default_abs_tolerance(),
            rel_tolerance: 0.0,
            shifts: default_shifts(),
            seed: default_integrator_seed(),
        }
    }
}

const INITIAL_LATTICE_POINTS: usize = 32;
const ERROR_SCALE: f64 = 3.0;
const PIVOT_FLOOR: f64 = 1e-10;
const P_FLOOR: f64 = 1e-300;
const P_CEIL: f64 = 1.0 - 1e-16;

/// Separation-of-variables integrator with deterministic output: the RNG
/// that draws lattice shifts is reseeded from the config on every call.
#[derive(Clone, Debug)]
pub struct GenzIntegrator {
    config: IntegratorConfig,
    chol: Array2<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    y: Vec<f64>,
    shift: Vec<f64>,
    point: Vec<f64>,
    generators: Vec<f64>,
    last_prime: u64,
}

impl GenzIntegrator {
    /// Scratch is sized for `max_dimension` up front and only grows if a call
    /// exceeds it.
    pub fn new(config: IntegratorConfig, max_dimension: usize) -> Self {
        let mut integrator = Self {
            config,
            chol: Array2::zeros((0, 0)),
            a: Vec::new(),
            b: Vec::new(),
            y: Vec::new(),
            shift: Vec::new(),
            point: Vec::new(),
            generators: Vec::new(),
            last_prime: 1,
        };
        integrator.reserve(max_dimension);
        integrator
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    fn reserve(&mut self, dim: usize) {
        if self.chol.nrows() < dim {
            self.chol = Array2::zeros((dim, dim));
            self.a.resize(dim, 0.0);
            self.b.resize(dim, 0.0);
            self.y.resize(dim, 0.0);
            self.shift.resize(dim, 0.0);
            self.point.resize(dim, 0.0);
        }
        // Richtmyer generators: fractional parts of sqrt of successive primes.
        while self.generators.len() < dim {
            self.last_prime = next_prime(self.last_prime);
            self.generators.push((self.last_prime as f64).sqrt().fract());
        }
    }

    fn integrate_1d(&self, corr: ArrayView2<'_, f64>) -> OrthantResult {
        let var = corr[[0, 0]];
        if !(var.is_finite() && var > 0.0) {
            return OrthantResult::improper();
        }
        let sd = var.sqrt();
        let p = normal_cdf(self.b[0] / sd) - normal_cdf(self.a[0] / sd);
        OrthantResult::exact(p.max(0.0))
    }

    fn integrate_2d(&self, corr: ArrayView2<'_, f64>) -> OrthantResult {
        let (v0, v1) = (corr[[0, 0]], corr[[1, 1]]);
        if !(v0.is_finite() && v0 > 0.0 && v1.is_finite() && v1 > 0.0) {
            return OrthantResult::improper();
        }
        let (s0, s1) = (v0.sqrt(), v1.sqrt());
        let r = 0.5 * (corr[[0, 1]] + corr[[1, 0]]) / (s0 * s1);
        if !r.is_finite() || r.abs() >= 1.0 {
            return OrthantResult::improper();
        }
        let (a0, b0) = (self.a[0] / s0, self.b[0] / s0);
        let (a1, b1) = (self.a[1] / s1, self.b[1] / s1);
        if a0 >= b0 || a1 >= b1 {
            return OrthantResult::exact(0.0);
        }
        let p = bivariate_normal_cdf(b0, b1, r) - bivariate_normal_cdf(a0, b1, r)
            - bivariate_normal_cdf(b0, a1, r)
            + bivariate_normal_cdf(a0, a1, r);
        OrthantResult::exact(p.clamp(0.0, 1.0))
    }

    /// In-place lower Cholesky factor of the active block; `false` when a
    /// pivot is not safely positive.
    fn factor(&mut self, corr: ArrayView2<'_, f64>, n: usize) -> bool {
        for i in 0..n {
            for j in 0..=i {
                let mut s = 0.5 * (corr[[i, j]] + corr[[j, i]]);
                for k in 0..j {
                    s -= self.chol[[i, k]] * self.chol[[j, k]];
                }
                if i == j {
                    if !(s.is_finite() && s > PIVOT_FLOOR * corr[[i, i]].abs().max(1.0)) {
                        return false;
                    }
                    self.chol[[i, i]] = s.sqrt();
                } else {
                    self.chol[[i, j]] = s / self.chol[[j, j]];
                }
            }
        }
        true
    }

    /// Integrand of the sequential conditional transform at `w` in `[0,1]^(n-1)`.
    fn conditional_product(&mut self, n: usize) -> f64 {
        let l00 = self.chol[[0, 0]];
        let mut d = normal_cdf(self.a[0] / l00);
        let mut e = normal_cdf(self.b[0] / l00);
        let mut f = e - d;
        for i in 1..n {
            if f <= 0.0 {
                return 0.0;
            }
            let p = (d + self.point[i - 1] * (e - d)).clamp(P_FLOOR, P_CEIL);
            self.y[i - 1] = standard_normal_quantile(p).unwrap_or(0.0);
            let mut s = 0.0;
            for j in 0..i {
                s += self.chol[[i, j]] * self.y[j];
            }
            let lii = self.chol[[i, i]];
            d = normal_cdf((self.a[i] - s) / lii);
            e = normal_cdf((self.b[i] - s) / lii);
            f *= e - d;
        }
        f.max(0.0)
    }

    fn integrate_lattice(&mut self, corr: ArrayView2<'_, f64>, n: usize) -> OrthantResult {
        if !self.factor(corr, n) {
            return OrthantResult::improper();
        }
        if (0..n).any(|i| self.a[i] >= self.b[i]) {
            return OrthantResult::exact(0.0);
        }

        let shifts = self.config.shifts.max(2);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut points = INITIAL_LATTICE_POINTS;
        let mut best;
        loop {
            let mut mean = 0.0;
            let mut m2 = 0.0;
            for s in 0..shifts {
                for k in 0..n - 1 {
                    self.shift[k] = rng.random::<f64>();
                }
                let mut acc = 0.0;
                for j in 1..=points {
                    for k in 0..n - 1 {
                        let x = (j as f64 * self.generators[k] + self.shift[k]).fract();
                        self.point[k] = (2.0 * x - 1.0).abs();
                    }
                    acc += self.conditional_product(n);
                    for k in 0..n - 1 {
                        self.point[k] = 1.0 - self.point[k];
                    }
                    acc += self.conditional_product(n);
                }
                let estimate = acc / (2 * points) as f64;
                // Welford update across shifts.
                let delta = estimate - mean;
                mean += delta / (s + 1) as f64;
                m2 += delta * (estimate - mean);
            }
            let variance_of_mean = m2 / ((shifts * (shifts - 1)) as f64);
            let error = ERROR_SCALE * variance_of_mean.sqrt();
            best = OrthantResult {
                probability: mean.clamp(0.0, 1.0),
                error,
                inform: Inform::ToleranceNotMet,
            };

            let tolerance = self
                .config
                .abs_tolerance
                .max(self.config.rel_tolerance * mean.abs());
            if error <= tolerance {
                best.inform = Inform::Converged;
                break;
            }
            if 2 * (2 * points) * shifts > self.config.max_points {
                break;
            }
            points *= 2;
        }
        best
    }
}

impl OrthantIntegrator for GenzIntegrator {
    fn integrate(
        &mut self,
        correlation: ArrayView2<'_, f64>,
        lower: ArrayView1<'_, f64>,
        upper: ArrayView1<'_, f64>,
        bounds: &[BoundKind],
    ) -> OrthantResult {
        let n = bounds.len();
        if correlation.dim() != (n, n) || lower.len() < n || upper.len() < n {
            return OrthantResult::improper();
        }
        if n == 0 {
            return OrthantResult::exact(1.0);
        }
        self.reserve(n);
        for (i, kind) in bounds.iter().enumerate() {
            let (a, b) = kind.limits(lower[i], upper[i]);
            if a.is_nan() || b.is_nan() {
                return OrthantResult::improper();
            }
            self.a[i] = a;
            self.b[i] = b;
        }
        match n {
            1 => self.integrate_1d(correlation),
            2 => self.integrate_2d(correlation),
            _ => self.integrate_lattice(correlation, n),
        }
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

fn next_prime(after: u64) -> u64 {
    let mut n = after + 1;
    while !is_prime(n) {
        n += 1;
    }
    n
}
