use super::aggregate::RowDiagnostic;
use super::workspace::EngineStats;
use crate::linalg::utils::KahanSum;
use crate::types::OutputMode;
use std::ops::Range;

/// Write-only window of the two output columns owned by one worker.
///
/// Indices are source row positions; a sink covers exactly the span its
/// worker processes, so concurrent sinks never overlap.
#[derive(Debug)]
pub struct RowSink<'a> {
    offset: usize,
    likelihood: &'a mut [f64],
    neg2_log_likelihood: &'a mut [f64],
}

impl<'a> RowSink<'a> {
    pub fn new(
        offset: usize,
        likelihood: &'a mut [f64],
        neg2_log_likelihood: &'a mut [f64],
    ) -> Self {
        debug_assert_eq!(likelihood.len(), neg2_log_likelihood.len());
        Self {
            offset,
            likelihood,
            neg2_log_likelihood,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.likelihood.len()
    }

    /// Likelihood on every row of the run, `representative` on its first row
    /// and 0 on the rest.
    pub(crate) fn write_run(
        &mut self,
        row: usize,
        count: usize,
        likelihood: f64,
        representative: f64,
    ) {
        let start = row - self.offset;
        let end = start + count;
        self.likelihood[start..end].fill(likelihood);
        self.neg2_log_likelihood[start..end].fill(0.0);
        self.neg2_log_likelihood[start] = representative;
    }
}

/// Result of one evaluation, indexed by original row.
#[derive(Debug, Clone)]
pub struct EvaluationOutputs {
    pub(crate) mode: OutputMode,
    pub(crate) likelihoods: Vec<f64>,
    pub(crate) neg2_log_likelihoods: Vec<f64>,
    pub(crate) diagnostics: Vec<RowDiagnostic>,
    pub(crate) stats: EngineStats,
}

impl EvaluationOutputs {
    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Likelihood of every original row; 0 where the row's run failed.
    pub fn row_likelihoods(&self) -> &[f64] {
        &self.likelihoods
    }

    /// Run-weighted -2 log-likelihood at each run's representative row and 0
    /// elsewhere. All zeros in per-row mode.
    pub fn row_neg2_log_likelihoods(&self) -> &[f64] {
        &self.neg2_log_likelihoods
    }

    /// Fit value: the compensated sum of the aggregate column. `+inf` when
    /// any run failed.
    pub fn total_neg2_log_likelihood(&self) -> f64 {
        self.neg2_log_likelihoods
            .iter()
            .copied()
            .collect::<KahanSum>()
            .sum()
    }

    pub fn diagnostics(&self) -> &[RowDiagnostic] {
        &self.diagnostics
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_run_fills_window_relative_to_offset() {
        let mut lik = vec![f64::NAN; 4];
        let mut neg2 = vec![f64::NAN; 4];
        {
            let mut sink = RowSink::new(10, &mut lik, &mut neg2);
            assert_eq!(sink.range(), 10..14);
            sink.write_run(11, 3, 0.5, 4.2);
            sink.write_run(10, 1, 1.0, 0.0);
        }
        assert_eq!(lik, vec![1.0, 0.5, 0.5, 0.5]);
        assert_eq!(neg2, vec![0.0, 4.2, 0.0, 0.0]);
    }
}
