//! Row-wise full-information likelihood engine.

pub mod aggregate;
pub mod continuous;
pub mod executor;
pub mod ordinal;
pub mod reduce;
pub mod sink;
pub mod tracker;
pub mod workspace;

pub use aggregate::{
    Contribution, CovarianceScope, DiagnosticKind, RowDiagnostic, RowFailure, RowOutcome,
};
pub use executor::{
    EngineError, FimlEvaluator, LocalContext, evaluate_continuous_rows, evaluate_joint_rows,
    evaluate_ordinal_rows, plan_partitions,
};
pub use sink::{EvaluationOutputs, RowSink};
pub use tracker::{CacheValidity, RowStep, RowTracker, row_span};
pub use workspace::{EngineStats, Workspace};
