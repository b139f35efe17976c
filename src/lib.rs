#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod data;
pub mod fiml;
pub mod linalg;
pub mod model;
pub mod orthant;
pub mod probability;
pub mod types;

pub use data::{Dataset, DatasetBuilder, RowSource, RunDimension};
pub use fiml::{
    EngineError, EngineStats, EvaluationOutputs, FimlEvaluator, LocalContext, RowDiagnostic,
    RowSink, evaluate_continuous_rows, evaluate_joint_rows, evaluate_ordinal_rows, row_span,
};
pub use model::{LinearMeanModel, ModelEvaluator, StaticModel, ThresholdColumn, ThresholdTable};
pub use orthant::{GenzIntegrator, IntegratorConfig, OrthantIntegrator};
pub use types::{CachePolicy, ColumnKind, EngineConfig, EvaluationMode, FitState, OutputMode};
