//! Model-implied statistics consumed by the engine.
//!
//! A [`ModelEvaluator`] owns the current covariance, means and threshold
//! table. The engine binds each row's definition values and calls
//! [`ModelEvaluator::recompute`] when they change. Evaluators are cloned
//! once per worker.

use crate::linalg::utils::is_symmetric;
use crate::orthant::BoundKind;
use ndarray::linalg::general_mat_vec_mul;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error(
        "Thresholds for column {column} are not strictly increasing: cutpoint {index} ({next}) does not exceed the one before it ({previous})."
    )]
    NotIncreasing {
        column: usize,
        index: usize,
        previous: f64,
        next: f64,
    },

    #[error("Observed category {category} exceeds the {count} cutpoints available.")]
    CategoryOutOfRange { category: usize, count: usize },

    #[error("Category {category} has no finite bound on either side.")]
    Unbounded { category: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Covariance matrix must be square, got {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },

    #[error("Covariance matrix is not symmetric.")]
    NotSymmetric,

    #[error("{what} has length {found}, expected {expected}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Model expects {expected} definition values, got {found}.")]
    DefinitionCount { expected: usize, found: usize },

    #[error("Definition value {index} is not finite.")]
    NonFiniteDefinition { index: usize },

    #[error(transparent)]
    Threshold(#[from] ThresholdError),
}

/// Interval of one observed ordinal category on the latent scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryBounds {
    pub kind: BoundKind,
    pub lower: f64,
    pub upper: f64,
}

/// Cutpoints of one ordinal column. A NaN cutpoint marks the end of the
/// column's categories, as in a ragged threshold matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdColumn {
    cutpoints: Vec<f64>,
}

impl ThresholdColumn {
    pub fn new(cutpoints: Vec<f64>) -> Self {
        Self { cutpoints }
    }

    pub fn cutpoint_count(&self) -> usize {
        self.cutpoints.len()
    }

    /// Cutpoint `index`, NaN past the end.
    pub fn cutpoint(&self, index: usize) -> f64 {
        self.cutpoints.get(index).copied().unwrap_or(f64::NAN)
    }

    pub fn cutpoints(&self) -> &[f64] {
        &self.cutpoints
    }

    pub fn validate_increasing(&self, column: usize) -> Result<(), ThresholdError> {
        for index in 1..self.cutpoints.len() {
            let (previous, next) = (self.cutpoints[index - 1], self.cutpoints[index]);
            if next.is_nan() {
                break;
            }
            if !(next > previous) {
                return Err(ThresholdError::NotIncreasing {
                    column,
                    index,
                    previous,
                    next,
                });
            }
        }
        Ok(())
    }

    /// Category 0 is `(-inf, t0]`, category k is `(t(k-1), tk]`, the top
    /// category is `(t(n-1), +inf)`.
    pub fn bounds(&self, category: usize) -> Result<CategoryBounds, ThresholdError> {
        let count = self.cutpoints.len();
        if category > count {
            return Err(ThresholdError::CategoryOutOfRange { category, count });
        }
        let lower = if category == 0 {
            f64::NEG_INFINITY
        } else {
            self.cutpoints[category - 1]
        };
        if lower.is_nan() {
            return Err(ThresholdError::CategoryOutOfRange { category, count });
        }
        let upper = if category == count {
            f64::NAN
        } else {
            self.cutpoints[category]
        };
        match (category == 0, upper.is_nan()) {
            (true, true) => Err(ThresholdError::Unbounded { category }),
            (true, false) => Ok(CategoryBounds {
                kind: BoundKind::Below,
                lower,
                upper,
            }),
            (false, true) => Ok(CategoryBounds {
                kind: BoundKind::Above,
                lower,
                upper: f64::INFINITY,
            }),
            (false, false) => Ok(CategoryBounds {
                kind: BoundKind::Between,
                lower,
                upper,
            }),
        }
    }
}

/// One optional threshold column per model variable; continuous variables
/// have none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdTable {
    columns: Vec<Option<ThresholdColumn>>,
}

impl ThresholdTable {
    pub fn new(columns: Vec<Option<ThresholdColumn>>) -> Self {
        Self { columns }
    }

    /// Table for `dimension` continuous variables.
    pub fn none(dimension: usize) -> Self {
        Self {
            columns: vec![None; dimension],
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&ThresholdColumn> {
        self.columns.get(index).and_then(Option::as_ref)
    }

    pub fn validate_increasing(&self) -> Result<(), ThresholdError> {
        for (index, column) in self.columns.iter().enumerate() {
            if let Some(column) = column {
                if column.cutpoint_count() > 0 {
                    column.validate_increasing(index)?;
                }
            }
        }
        Ok(())
    }
}

/// Source of the model-implied covariance, means and thresholds.
pub trait ModelEvaluator: Clone + Send {
    /// Number of modeled variables; equals the dataset column count.
    fn dimension(&self) -> usize;

    fn definition_count(&self) -> usize;

    /// Models whose statistics depend on the row position (state-space
    /// style) return `true`; the engine then recomputes on every row and
    /// reuses no factorization.
    fn requires_row_recompute(&self) -> bool {
        false
    }

    fn bind_definition_values(&mut self, values: ArrayView1<'_, f64>) -> Result<(), ModelError>;

    fn recompute(&mut self) -> Result<(), ModelError>;

    fn covariance(&self) -> ArrayView2<'_, f64>;

    /// `None` when the model has no mean structure; means are then zero.
    fn means(&self) -> Option<ArrayView1<'_, f64>>;

    fn thresholds(&self) -> &ThresholdTable;
}

/// Fixed covariance, means and thresholds.
#[derive(Debug, Clone)]
pub struct StaticModel {
    covariance: Array2<f64>,
    means: Option<Array1<f64>>,
    thresholds: ThresholdTable,
}

impl StaticModel {
    pub fn new(
        covariance: Array2<f64>,
        means: Option<Array1<f64>>,
        thresholds: ThresholdTable,
    ) -> Result<Self, ModelError> {
        let (rows, cols) = covariance.dim();
        if rows != cols {
            return Err(ModelError::NotSquare { rows, cols });
        }
        if !is_symmetric(covariance.view()) {
            return Err(ModelError::NotSymmetric);
        }
        if let Some(m) = &means {
            if m.len() != rows {
                return Err(ModelError::DimensionMismatch {
                    what: "mean vector",
                    expected: rows,
                    found: m.len(),
                });
            }
        }
        if thresholds.len() != rows {
            return Err(ModelError::DimensionMismatch {
                what: "threshold table",
                expected: rows,
                found: thresholds.len(),
            });
        }
        Ok(Self {
            covariance,
            means,
            thresholds,
        })
    }

    pub fn continuous(
        covariance: Array2<f64>,
        means: Option<Array1<f64>>,
    ) -> Result<Self, ModelError> {
        let dim = covariance.nrows();
        Self::new(covariance, means, ThresholdTable::none(dim))
    }
}

impl ModelEvaluator for StaticModel {
    fn dimension(&self) -> usize {
        self.covariance.nrows()
    }

    fn definition_count(&self) -> usize {
        0
    }

    fn bind_definition_values(&mut self, values: ArrayView1<'_, f64>) -> Result<(), ModelError> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(ModelError::DefinitionCount {
                expected: 0,
                found: values.len(),
            })
        }
    }

    fn recompute(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    fn covariance(&self) -> ArrayView2<'_, f64> {
        self.covariance.view()
    }

    fn means(&self) -> Option<ArrayView1<'_, f64>> {
        self.means.as_ref().map(Array1::view)
    }

    fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }
}

/// Means shifted by definition variables: `mu = base + loadings * defs`.
#[derive(Debug, Clone)]
pub struct LinearMeanModel {
    base: StaticModel,
    base_means: Array1<f64>,
    loadings: Array2<f64>,
    bound: Array1<f64>,
    means: Array1<f64>,
    row_recompute: bool,
}

impl LinearMeanModel {
    /// `loadings` is variables × definition values.
    pub fn new(base: StaticModel, loadings: Array2<f64>) -> Result<Self, ModelError> {
        let dim = base.dimension();
        if loadings.nrows() != dim {
            return Err(ModelError::DimensionMismatch {
                what: "loading matrix",
                expected: dim,
                found: loadings.nrows(),
            });
        }
        let base_means = base.means.clone().unwrap_or_else(|| Array1::zeros(dim));
        let defs = loadings.ncols();
        Ok(Self {
            means: base_means.clone(),
            base_means,
            bound: Array1::zeros(defs),
            loadings,
            base,
            row_recompute: false,
        })
    }

    /// Force a model recompute on every row.
    pub fn with_row_recompute(mut self, enabled: bool) -> Self {
        self.row_recompute = enabled;
        self
    }
}

impl ModelEvaluator for LinearMeanModel {
    fn dimension(&self) -> usize {
        self.base.dimension()
    }

    fn definition_count(&self) -> usize {
        self.loadings.ncols()
    }

    fn requires_row_recompute(&self) -> bool {
        self.row_recompute
    }

    fn bind_definition_values(&mut self, values: ArrayView1<'_, f64>) -> Result<(), ModelError> {
        if values.len() != self.loadings.ncols() {
            return Err(ModelError::DefinitionCount {
                expected: self.loadings.ncols(),
                found: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteDefinition { index });
        }
        self.bound.assign(&values);
        Ok(())
    }

    fn recompute(&mut self) -> Result<(), ModelError> {
        self.means.assign(&self.base_means);
        general_mat_vec_mul(1.0, &self.loadings, &self.bound, 1.0, &mut self.means);
        Ok(())
    }

    fn covariance(&self) -> ArrayView2<'_, f64> {
        self.base.covariance.view()
    }

    fn means(&self) -> Option<ArrayView1<'_, f64>> {
        Some(self.means.view())
    }

    fn thresholds(&self) -> &ThresholdTable {
        &self.base.thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn category_bounds_follow_cutpoints() {
        let col = ThresholdColumn::new(vec![-1.0, 0.5]);
        let b0 = col.bounds(0).expect("in range");
        assert_eq!((b0.kind, b0.upper), (BoundKind::Below, -1.0));
        let b1 = col.bounds(1).expect("in range");
        assert_eq!((b1.kind, b1.lower, b1.upper), (BoundKind::Between, -1.0, 0.5));
        let b2 = col.bounds(2).expect("in range");
        assert_eq!((b2.kind, b2.lower), (BoundKind::Above, 0.5));
        assert_eq!(b2.upper, f64::INFINITY);
        assert!(matches!(
            col.bounds(3),
            Err(ThresholdError::CategoryOutOfRange { category: 3, count: 2 })
        ));
    }

    #[test]
    fn nan_cutpoint_opens_the_upper_bound() {
        let col = ThresholdColumn::new(vec![0.0, f64::NAN]);
        let b = col.bounds(1).expect("in range");
        assert_eq!(b.kind, BoundKind::Above);
        assert_eq!(b.upper, f64::INFINITY);
        assert!(col.validate_increasing(0).is_ok());
    }

    #[test]
    fn detects_non_increasing_cutpoints() {
        let table = ThresholdTable::new(vec![
            None,
            Some(ThresholdColumn::new(vec![0.0, 1.0])),
            Some(ThresholdColumn::new(vec![0.3, 0.3])),
        ]);
        let err = table.validate_increasing().expect_err("tie is not increasing");
        assert!(matches!(err, ThresholdError::NotIncreasing { column: 2, index: 1, .. }));
    }

    #[test]
    fn static_model_validates_shapes() {
        assert!(matches!(
            StaticModel::continuous(array![[1.0, 0.5], [0.0, 1.0]], None),
            Err(ModelError::NotSymmetric)
        ));
        assert!(matches!(
            StaticModel::continuous(Array2::eye(2), Some(array![0.0])),
            Err(ModelError::DimensionMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn linear_means_follow_definition_values() {
        let base = StaticModel::continuous(Array2::eye(2), Some(array![1.0, -1.0]))
            .expect("valid model");
        let mut model =
            LinearMeanModel::new(base, array![[2.0], [0.5]]).expect("loadings fit");
        model
            .bind_definition_values(array![3.0].view())
            .expect("one finite value");
        model.recompute().expect("recompute succeeds");
        assert_eq!(model.means().expect("means present"), array![7.0, 0.5]);
        assert!(matches!(
            model.bind_definition_values(array![f64::NAN].view()),
            Err(ModelError::NonFiniteDefinition { index: 0 })
        ));
    }
}
