use crate::data::RowSource;
use crate::types::ColumnKind;

/// Per-row classification of the measured columns.
///
/// A missing cell is removed from both computations, an observed ordinal
/// cell only from the continuous one, and an observed continuous cell only
/// from the ordinal one. The retained column indices are kept in ascending
/// order so reduced matrices can be gathered directly.
#[derive(Debug, Clone)]
pub struct RemovalMasks {
    continuous_removed: Vec<bool>,
    ordinal_removed: Vec<bool>,
    continuous: Vec<usize>,
    ordinal: Vec<usize>,
    missing: usize,
}

impl RemovalMasks {
    pub fn with_columns(columns: usize) -> Self {
        Self {
            continuous_removed: vec![true; columns],
            ordinal_removed: vec![true; columns],
            continuous: Vec::with_capacity(columns),
            ordinal: Vec::with_capacity(columns),
            missing: 0,
        }
    }

    pub fn classify<D: RowSource + ?Sized>(&mut self, source: &D, row: usize) {
        self.continuous.clear();
        self.ordinal.clear();
        self.missing = 0;
        for column in 0..self.continuous_removed.len() {
            let (drop_continuous, drop_ordinal) = if source.is_missing(row, column) {
                self.missing += 1;
                (true, true)
            } else {
                match source.column_kind(column) {
                    ColumnKind::Ordinal => {
                        self.ordinal.push(column);
                        (true, false)
                    }
                    ColumnKind::Continuous => {
                        self.continuous.push(column);
                        (false, true)
                    }
                }
            };
            self.continuous_removed[column] = drop_continuous;
            self.ordinal_removed[column] = drop_ordinal;
        }
    }

    pub fn continuous_removed(&self) -> &[bool] {
        &self.continuous_removed
    }

    pub fn ordinal_removed(&self) -> &[bool] {
        &self.ordinal_removed
    }

    /// Retained continuous columns.
    pub fn continuous(&self) -> &[usize] {
        &self.continuous
    }

    /// Retained ordinal columns.
    pub fn ordinal(&self) -> &[usize] {
        &self.ordinal
    }

    pub fn missing_count(&self) -> usize {
        self.missing
    }

    /// No usable column: the row contributes likelihood 1.
    pub fn is_empty(&self) -> bool {
        self.continuous.is_empty() && self.ordinal.is_empty()
    }
}
