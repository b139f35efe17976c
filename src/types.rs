use crate::orthant::IntegratorConfig;
use serde::{Deserialize, Serialize};

/// Measurement scale of a dataset column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Continuous,
    Ordinal,
}

/// What one evaluation writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Per-run -2 log-likelihood at the representative row; feeds the fit value.
    #[default]
    Aggregate,
    /// Likelihood (not log) for every original row.
    PerRow,
}

/// How aggressively cached factorizations are reused across rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Definition variables plus the full missingness pattern; data-dependent
    /// quantities are recomputed on every run.
    Coarse,
    /// Definition variables, continuous and ordinal missingness, and
    /// continuous and ordinal row identity tracked independently.
    #[default]
    Granular,
}

/// Which of the three row pipelines an evaluation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    Continuous,
    Ordinal,
    Joint,
}

impl EvaluationMode {
    /// Pick the narrowest pipeline that covers every column. A dataset with no
    /// columns is treated as continuous.
    pub fn infer(kinds: impl IntoIterator<Item = ColumnKind>) -> Self {
        let (mut continuous, mut ordinal) = (false, false);
        for kind in kinds {
            match kind {
                ColumnKind::Continuous => continuous = true,
                ColumnKind::Ordinal => ordinal = true,
            }
        }
        match (continuous, ordinal) {
            (_, false) => EvaluationMode::Continuous,
            (false, true) => EvaluationMode::Ordinal,
            (true, true) => EvaluationMode::Joint,
        }
    }

    pub fn accepts(self, kind: ColumnKind) -> bool {
        match self {
            EvaluationMode::Continuous => kind == ColumnKind::Continuous,
            EvaluationMode::Ordinal => kind == ColumnKind::Ordinal,
            EvaluationMode::Joint => true,
        }
    }
}

/// Position of the caller's optimizer, used only to word diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FitState {
    #[serde(default)]
    pub compute_count: u64,
    #[serde(default)]
    pub major_iteration: u64,
    #[serde(default)]
    pub minor_iteration: u64,
}

impl FitState {
    pub fn location(&self) -> String {
        if self.compute_count == 0 {
            "at starting values".to_string()
        } else {
            format!(
                "at major iteration {} (minor iteration {})",
                self.major_iteration, self.minor_iteration
            )
        }
    }
}

pub fn default_min_rows_per_worker() -> usize {
    64
}

/// Options for one engine instance; every field has a default so partial
/// JSON configs deserialize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    /// Worker threads; `None` runs on rayon's global pool.
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_min_rows_per_worker")]
    pub min_rows_per_worker: usize,
    #[serde(default)]
    pub integrator: IntegratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::default(),
            cache_policy: CachePolicy::default(),
            threads: None,
            min_rows_per_worker: default_min_rows_per_worker(),
            integrator: IntegratorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn per_row() -> Self {
        Self {
            output_mode: OutputMode::PerRow,
            ..Self::default()
        }
    }
}
