//! Row storage consumed by the engine.
//!
//! The engine reads rows only through [`RowSource`]. [`Dataset`] is the
//! in-memory implementation: a dense value matrix, per-row definition
//! values, and precomputed run-length tables for every tracked property.

use crate::types::ColumnKind;
use ndarray::{Array2, ArrayView1, ShapeError};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Row {row} has {found} values but the dataset declares {expected} columns.")]
    ValueWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error(
        "Row {row} has {found} definition values but {expected} definition columns are declared."
    )]
    DefinitionWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error(
        "Ordinal column {column} holds {value} in row {row}; categories must be non-negative integers."
    )]
    InvalidCategory { row: usize, column: usize, value: f64 },

    #[error("Value matrix has {rows} rows but the definition matrix has {definition_rows}.")]
    RowCountMismatch { rows: usize, definition_rows: usize },

    #[error("{kinds} column kinds were given for a value matrix with {cols} columns.")]
    KindCount { kinds: usize, cols: usize },

    #[error("Dataset storage has an invalid shape: {0}")]
    Shape(#[from] ShapeError),
}

/// Properties along which consecutive rows can be identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunDimension {
    /// Definition values, missingness and every value.
    Rows,
    Definitions,
    Missingness,
    ContinuousMissingness,
    OrdinalMissingness,
    /// Continuous values and continuous missingness.
    ContinuousRows,
    /// Ordinal categories and ordinal missingness.
    OrdinalRows,
}

impl RunDimension {
    const ALL: [RunDimension; 7] = [
        RunDimension::Rows,
        RunDimension::Definitions,
        RunDimension::Missingness,
        RunDimension::ContinuousMissingness,
        RunDimension::OrdinalMissingness,
        RunDimension::ContinuousRows,
        RunDimension::OrdinalRows,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Read access to the rows of one evaluation.
///
/// Rows are addressed by their position in the source. `original_index`
/// maps a position back to the caller's row numbering; outputs are always
/// reported in that numbering.
pub trait RowSource: Sync {
    fn row_count(&self) -> usize;
    fn column_count(&self) -> usize;
    fn column_kind(&self, column: usize) -> ColumnKind;
    fn value_at(&self, row: usize, column: usize) -> f64;

    /// Non-finite values are missing on every scale.
    fn is_missing(&self, row: usize, column: usize) -> bool {
        !self.value_at(row, column).is_finite()
    }

    /// Observed category of an ordinal cell, `None` when missing.
    fn category_at(&self, row: usize, column: usize) -> Option<usize> {
        let v = self.value_at(row, column);
        (v.is_finite() && v >= 0.0).then(|| v as usize)
    }

    /// Number of consecutive rows, starting at `row` and including it, that
    /// are identical along `dimension`. Counts down to 1 at the end of a run.
    fn identical_run_length(&self, row: usize, dimension: RunDimension) -> usize;

    fn definition_count(&self) -> usize;
    fn definition_values(&self, row: usize) -> ArrayView1<'_, f64>;
    fn original_index(&self, row: usize) -> usize;
}

#[derive(Debug, Clone)]
pub struct Dataset {
    names: Vec<String>,
    kinds: Vec<ColumnKind>,
    values: Array2<f64>,
    definitions: Array2<f64>,
    original: Vec<usize>,
    runs: Vec<Vec<usize>>,
}

impl Dataset {
    /// `values` is rows × columns; `definitions` is rows × definition count
    /// (zero columns when the model has no definition variables).
    pub fn from_arrays(
        kinds: Vec<ColumnKind>,
        values: Array2<f64>,
        definitions: Array2<f64>,
    ) -> Result<Self, DataError> {
        if kinds.len() != values.ncols() {
            return Err(DataError::KindCount {
                kinds: kinds.len(),
                cols: values.ncols(),
            });
        }
        if definitions.nrows() != values.nrows() {
            return Err(DataError::RowCountMismatch {
                rows: values.nrows(),
                definition_rows: definitions.nrows(),
            });
        }
        for (column, kind) in kinds.iter().enumerate() {
            if *kind != ColumnKind::Ordinal {
                continue;
            }
            for (row, &value) in values.column(column).iter().enumerate() {
                if value.is_nan() {
                    continue;
                }
                if !(value.is_finite() && value >= 0.0 && value.fract() == 0.0) {
                    return Err(DataError::InvalidCategory { row, column, value });
                }
            }
        }
        let names = (0..kinds.len()).map(|c| format!("V{}", c + 1)).collect();
        let original = (0..values.nrows()).collect();
        let mut dataset = Self {
            names,
            kinds,
            values,
            definitions,
            original,
            runs: Vec::new(),
        };
        dataset.rebuild_runs();
        Ok(dataset)
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        if names.len() == self.kinds.len() {
            self.names = names;
        }
        self
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_kinds(&self) -> &[ColumnKind] {
        &self.kinds
    }

    /// Copy with rows reordered so that identical rows are adjacent:
    /// ordered by definition values, then missingness, then values.
    /// Original indices travel with their rows.
    pub fn sorted_into_runs(&self) -> Dataset {
        let mut order: Vec<usize> = (0..self.values.nrows()).collect();
        order.sort_by(|&a, &b| self.compare_rows(a, b));

        let mut values = Array2::zeros(self.values.dim());
        let mut definitions = Array2::zeros(self.definitions.dim());
        for (dst, &src) in order.iter().enumerate() {
            values.row_mut(dst).assign(&self.values.row(src));
            definitions.row_mut(dst).assign(&self.definitions.row(src));
        }
        let original = order.iter().map(|&src| self.original[src]).collect();
        let mut sorted = Dataset {
            names: self.names.clone(),
            kinds: self.kinds.clone(),
            values,
            definitions,
            original,
            runs: Vec::new(),
        };
        sorted.rebuild_runs();
        sorted
    }

    fn compare_rows(&self, a: usize, b: usize) -> Ordering {
        let defs = self
            .definitions
            .row(a)
            .iter()
            .zip(self.definitions.row(b).iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal);
        if defs.is_ne() {
            return defs;
        }
        let (ra, rb) = (self.values.row(a), self.values.row(b));
        let missing = ra
            .iter()
            .zip(rb.iter())
            .map(|(x, y)| (!x.is_finite()).cmp(&!y.is_finite()))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal);
        if missing.is_ne() {
            return missing;
        }
        ra.iter()
            .zip(rb.iter())
            .filter(|(x, _)| x.is_finite())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    fn cells_match(&self, a: usize, b: usize, column: usize, compare_values: bool) -> bool {
        let (x, y) = (self.values[[a, column]], self.values[[b, column]]);
        match (x.is_finite(), y.is_finite()) {
            (false, false) => true,
            (true, true) => !compare_values || x.to_bits() == y.to_bits(),
            _ => false,
        }
    }

    fn rows_match(&self, a: usize, b: usize, dimension: RunDimension) -> bool {
        let columns = |kind: Option<ColumnKind>, compare_values: bool| {
            (0..self.kinds.len())
                .filter(|&c| kind.is_none_or(|k| self.kinds[c] == k))
                .all(|c| self.cells_match(a, b, c, compare_values))
        };
        let definitions = || {
            self.definitions
                .row(a)
                .iter()
                .zip(self.definitions.row(b).iter())
                .all(|(x, y)| x.to_bits() == y.to_bits())
        };
        match dimension {
            RunDimension::Rows => definitions() && columns(None, true),
            RunDimension::Definitions => definitions(),
            RunDimension::Missingness => columns(None, false),
            RunDimension::ContinuousMissingness => columns(Some(ColumnKind::Continuous), false),
            RunDimension::OrdinalMissingness => columns(Some(ColumnKind::Ordinal), false),
            RunDimension::ContinuousRows => columns(Some(ColumnKind::Continuous), true),
            RunDimension::OrdinalRows => columns(Some(ColumnKind::Ordinal), true),
        }
    }

    fn rebuild_runs(&mut self) {
        let n = self.values.nrows();
        let mut runs = vec![vec![0usize; n]; RunDimension::ALL.len()];
        for dimension in RunDimension::ALL {
            let table = &mut runs[dimension.slot()];
            for row in (0..n).rev() {
                table[row] = if row + 1 < n && self.rows_match(row, row + 1, dimension) {
                    table[row + 1] + 1
                } else {
                    1
                };
            }
        }
        self.runs = runs;
    }
}

impl RowSource for Dataset {
    fn row_count(&self) -> usize {
        self.values.nrows()
    }

    fn column_count(&self) -> usize {
        self.values.ncols()
    }

    fn column_kind(&self, column: usize) -> ColumnKind {
        self.kinds[column]
    }

    fn value_at(&self, row: usize, column: usize) -> f64 {
        self.values[[row, column]]
    }

    fn identical_run_length(&self, row: usize, dimension: RunDimension) -> usize {
        self.runs[dimension.slot()][row]
    }

    fn definition_count(&self) -> usize {
        self.definitions.ncols()
    }

    fn definition_values(&self, row: usize) -> ArrayView1<'_, f64> {
        self.definitions.row(row)
    }

    fn original_index(&self, row: usize) -> usize {
        self.original[row]
    }
}

/// Row-at-a-time construction, used by the CSV loader.
#[derive(Debug, Default)]
pub struct DatasetBuilder {
    names: Vec<String>,
    kinds: Vec<ColumnKind>,
    definition_count: usize,
    values: Vec<f64>,
    definitions: Vec<f64>,
    rows: usize,
}

impl DatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.names.push(name.into());
        self.kinds.push(kind);
        self
    }

    pub fn definition_columns(mut self, count: usize) -> Self {
        self.definition_count = count;
        self
    }

    pub fn push_row(&mut self, values: &[f64], definitions: &[f64]) -> Result<(), DataError> {
        if values.len() != self.kinds.len() {
            return Err(DataError::ValueWidth {
                row: self.rows,
                expected: self.kinds.len(),
                found: values.len(),
            });
        }
        if definitions.len() != self.definition_count {
            return Err(DataError::DefinitionWidth {
                row: self.rows,
                expected: self.definition_count,
                found: definitions.len(),
            });
        }
        self.values.extend_from_slice(values);
        self.definitions.extend_from_slice(definitions);
        self.rows += 1;
        Ok(())
    }

    pub fn build(self) -> Result<Dataset, DataError> {
        let cols = self.kinds.len();
        let values = Array2::from_shape_vec((self.rows, cols), self.values)?;
        let definitions =
            Array2::from_shape_vec((self.rows, self.definition_count), self.definitions)?;
        Ok(Dataset::from_arrays(self.kinds, values, definitions)?.with_names(self.names))
    }
}

/// Definition matrix for a dataset without definition variables.
pub fn no_definitions(rows: usize) -> Array2<f64> {
    Array2::zeros((rows, 0))
}
