//! Row advancement and cache validity.
//!
//! The tracker walks a row range one identical-row run at a time and keeps,
//! for each tracked property, the number of rows left before the property
//! changes. A cached quantity may be reused for a run only when every
//! property it depends on is still inside the run it was computed for.

use crate::data::{RowSource, RunDimension};
use crate::types::CachePolicy;
use std::ops::Range;

/// Validity of cached state for the current run, one flag per tracked
/// property. A flag is `true` when the property is unchanged since the
/// previously processed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheValidity {
    pub definitions: bool,
    pub continuous_missingness: bool,
    pub ordinal_missingness: bool,
    pub continuous_rows: bool,
    pub ordinal_rows: bool,
}

/// One run handed to the row pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RowStep {
    /// Representative (first) row of the run, in source coordinates.
    pub row: usize,
    /// Rows covered by this step; at least 1.
    pub num_identical: usize,
    pub validity: CacheValidity,
    /// First row of the invocation, or the run after a failure.
    pub fresh: bool,
}

const TRACKED: usize = 5;

#[derive(Debug, Clone)]
pub struct RowTracker {
    row: usize,
    limit: usize,
    policy: CachePolicy,
    counters: [isize; TRACKED],
    first_row: bool,
    stale: bool,
    forced: bool,
}

/// First row at or after `row` that starts a full-identity run.
fn snap<D: RowSource + ?Sized>(source: &D, row: usize) -> usize {
    if row == 0 || row > source.row_count() {
        return row.min(source.row_count());
    }
    let remaining = source.identical_run_length(row - 1, RunDimension::Rows).max(1);
    row - 1 + remaining
}

/// Rows a `(begin, count)` invocation reads and writes. A range starting
/// inside a run skips the rest of that run; a range ending inside a run
/// finishes it. Adjacent ranges therefore produce adjacent spans.
pub fn row_span<D: RowSource + ?Sized>(source: &D, begin: usize, count: usize) -> Range<usize> {
    let start = snap(source, begin);
    let end = snap(source, begin.saturating_add(count)).max(start);
    start..end
}

impl RowTracker {
    pub fn new<D: RowSource + ?Sized>(
        source: &D,
        begin: usize,
        count: usize,
        policy: CachePolicy,
    ) -> Self {
        let span = row_span(source, begin, count);
        Self {
            row: span.start,
            limit: span.end,
            policy,
            counters: [0; TRACKED],
            first_row: true,
            stale: false,
            forced: false,
        }
    }

    /// Report every cache as invalid on every row.
    pub fn with_forced_recompute(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    /// Start the next run, or `None` once the range is exhausted.
    pub fn next_step<D: RowSource + ?Sized>(&mut self, source: &D) -> Option<RowStep> {
        if self.row >= self.limit {
            return None;
        }
        let row = self.row;
        let reported = source.identical_run_length(row, RunDimension::Rows);
        if reported == 0 {
            log::warn!("row source reported an empty identical-row run at row {row}; using 1");
        }
        let num_identical = reported.max(1).min(self.limit - row);

        let fresh = self.first_row || self.stale || self.forced;
        let valid = |c: isize| c > 0 && !fresh;
        let validity = match self.policy {
            CachePolicy::Granular => CacheValidity {
                definitions: valid(self.counters[0]),
                continuous_missingness: valid(self.counters[1]),
                ordinal_missingness: valid(self.counters[2]),
                continuous_rows: valid(self.counters[3]),
                ordinal_rows: valid(self.counters[4]),
            },
            CachePolicy::Coarse => CacheValidity {
                definitions: valid(self.counters[0]),
                continuous_missingness: valid(self.counters[1]),
                ordinal_missingness: valid(self.counters[1]),
                continuous_rows: false,
                ordinal_rows: false,
            },
        };

        let dimensions = self.dimensions();
        for (counter, dimension) in self.counters.iter_mut().zip(dimensions) {
            if *counter <= 0 {
                *counter = dimension
                    .map(|d| source.identical_run_length(row, d).max(1) as isize)
                    .unwrap_or(0);
            }
        }

        Some(RowStep {
            row,
            num_identical,
            validity,
            fresh,
        })
    }

    /// Advance past `step`. A failed run leaves every cache stale so the
    /// next run recomputes from the model.
    pub fn finish(&mut self, step: &RowStep, succeeded: bool) {
        let k = step.num_identical as isize;
        for counter in &mut self.counters {
            *counter -= k;
        }
        self.row = step.row + step.num_identical;
        self.first_row = false;
        self.stale = !succeeded;
    }

    fn dimensions(&self) -> [Option<RunDimension>; TRACKED] {
        match self.policy {
            CachePolicy::Granular => [
                Some(RunDimension::Definitions),
                Some(RunDimension::ContinuousMissingness),
                Some(RunDimension::OrdinalMissingness),
                Some(RunDimension::ContinuousRows),
                Some(RunDimension::OrdinalRows),
            ],
            CachePolicy::Coarse => [
                Some(RunDimension::Definitions),
                Some(RunDimension::Missingness),
                None,
                None,
                None,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, no_definitions};
    use crate::types::ColumnKind;
    use ndarray::array;

    fn dataset() -> Dataset {
        // Full-identity runs: [0,1,2] [3] [4,5] [6]
        let nan = f64::NAN;
        let values = array![[1.0], [1.0], [1.0], [2.0], [nan], [nan], [2.0]];
        Dataset::from_arrays(vec![ColumnKind::Continuous], values, no_definitions(7))
            .expect("valid dataset")
    }

    fn walk(d: &Dataset, begin: usize, count: usize) -> Vec<(usize, usize)> {
        let mut tracker = RowTracker::new(d, begin, count, CachePolicy::Granular);
        let mut seen = Vec::new();
        while let Some(step) = tracker.next_step(d) {
            seen.push((step.row, step.num_identical));
            tracker.finish(&step, true);
        }
        seen
    }

    #[test]
    fn steps_skip_over_identical_runs() {
        let d = dataset();
        assert_eq!(walk(&d, 0, 7), vec![(0, 3), (3, 1), (4, 2), (6, 1)]);
    }

    #[test]
    fn start_inside_a_run_snaps_to_its_end() {
        let d = dataset();
        assert_eq!(row_span(&d, 1, 3), 3..4);
        assert_eq!(walk(&d, 1, 3), vec![(3, 1)]);
        assert_eq!(row_span(&d, 0, 1), 0..3);
        assert_eq!(row_span(&d, 5, 2), 6..7);
    }

    #[test]
    fn adjacent_ranges_tile_the_dataset() {
        let d = dataset();
        for cut in 0..=7 {
            let left = row_span(&d, 0, cut);
            let right = row_span(&d, cut, 7 - cut);
            assert_eq!(left.start, 0);
            assert_eq!(left.end, right.start, "cut at {cut}");
            assert_eq!(right.end, 7);
        }
    }

    #[test]
    fn validity_follows_missingness_runs() {
        let d = dataset();
        let mut tracker = RowTracker::new(&d, 0, 7, CachePolicy::Granular);
        let first = tracker.next_step(&d).expect("row 0");
        assert!(first.fresh);
        assert!(!first.validity.continuous_missingness);
        tracker.finish(&first, true);

        let second = tracker.next_step(&d).expect("row 3");
        assert!(!second.fresh);
        assert!(second.validity.continuous_missingness);
        assert!(!second.validity.continuous_rows);
        assert!(second.validity.definitions);
        tracker.finish(&second, true);

        let third = tracker.next_step(&d).expect("row 4");
        assert!(!third.validity.continuous_missingness);
        tracker.finish(&third, false);

        let fourth = tracker.next_step(&d).expect("row 6");
        assert!(fourth.fresh);
        assert_eq!(fourth.validity, CacheValidity::default());
    }

    #[test]
    fn coarse_policy_never_reuses_row_data() {
        let d = dataset();
        let mut tracker = RowTracker::new(&d, 0, 7, CachePolicy::Coarse);
        let first = tracker.next_step(&d).expect("row 0");
        tracker.finish(&first, true);
        let second = tracker.next_step(&d).expect("row 3");
        assert!(second.validity.continuous_missingness);
        assert!(!second.validity.continuous_rows);
        assert!(!second.validity.ordinal_rows);
    }

    #[test]
    fn forced_recompute_invalidates_everything() {
        let d = dataset();
        let mut tracker =
            RowTracker::new(&d, 0, 7, CachePolicy::Granular).with_forced_recompute(true);
        let first = tracker.next_step(&d).expect("row 0");
        tracker.finish(&first, true);
        let second = tracker.next_step(&d).expect("row 3");
        assert!(second.fresh);
        assert_eq!(second.validity, CacheValidity::default());
    }
}
