use clap::{Args, Parser, Subcommand, ValueEnum};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use fiml::data::{Dataset, DatasetBuilder};
use fiml::fiml::{EvaluationOutputs, FimlEvaluator};
use fiml::model::{LinearMeanModel, StaticModel, ThresholdColumn, ThresholdTable};
use fiml::types::{CachePolicy, ColumnKind, EngineConfig, EvaluationMode, FitState, OutputMode};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (build ",
    env!("FIML_BUILD_TIMESTAMP"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "fiml")]
#[command(version = VERSION)]
#[command(about = "Row-wise FIML likelihood for continuous and ordinal data", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate the likelihood of a CSV dataset under a JSON model.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    data: PathBuf,
    #[arg(short = 'm', long = "model")]
    model: PathBuf,
    /// Engine options as JSON; flags below override it.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Write per-row likelihoods instead of the total -2 log-likelihood.
    #[arg(long = "per-row")]
    per_row: bool,
    #[arg(short = 'o', long = "out")]
    out: Option<PathBuf>,
    #[arg(long = "threads")]
    threads: Option<usize>,
    #[arg(long = "cache-policy", value_enum)]
    cache_policy: Option<CachePolicyArg>,
    #[arg(long = "mode", value_enum)]
    mode: Option<ModeArg>,
    /// Reorder rows so identical rows form runs before evaluating.
    #[arg(long = "sort")]
    sort: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CachePolicyArg {
    Coarse,
    Granular,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Continuous,
    Ordinal,
    Joint,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    columns: Vec<ColumnSpec>,
    covariance: Vec<Vec<f64>>,
    #[serde(default)]
    means: Option<Vec<f64>>,
    #[serde(default)]
    definitions: Vec<DefinitionSpec>,
    #[serde(default)]
    row_recompute: bool,
}

#[derive(Debug, Deserialize)]
struct ColumnSpec {
    name: String,
    kind: ColumnKind,
    #[serde(default)]
    thresholds: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct DefinitionSpec {
    name: String,
    /// Shift of each modeled mean per unit of this definition variable.
    loadings: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    rows: usize,
    neg2_log_likelihood: f64,
    runs: usize,
    factorizations: usize,
    integrations: usize,
    failures: usize,
    diagnostics: &'a [fiml::fiml::RowDiagnostic],
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Evaluate(args) => run_evaluate(args),
    }
}

fn run_evaluate(args: EvaluateArgs) -> Result<(), String> {
    let payload = fs::read_to_string(&args.model)
        .map_err(|e| format!("failed to read model '{}': {e}", args.model.display()))?;
    let description: ModelFile =
        serde_json::from_str(&payload).map_err(|e| format!("failed to parse model json: {e}"))?;

    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&text)
                .map_err(|e| format!("failed to parse config json: {e}"))?
        }
        None => EngineConfig::default(),
    };
    if args.per_row {
        config.output_mode = OutputMode::PerRow;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if let Some(policy) = args.cache_policy {
        config.cache_policy = match policy {
            CachePolicyArg::Coarse => CachePolicy::Coarse,
            CachePolicyArg::Granular => CachePolicy::Granular,
        };
    }

    let model = build_model(&description)?;
    let mut dataset = load_dataset(&args.data, &description)?;
    if args.sort {
        dataset = dataset.sorted_into_runs();
    }

    let evaluator = FimlEvaluator::new(model, config).map_err(|e| e.to_string())?;
    let mode = match args.mode {
        Some(ModeArg::Continuous) => EvaluationMode::Continuous,
        Some(ModeArg::Ordinal) => EvaluationMode::Ordinal,
        Some(ModeArg::Joint) => EvaluationMode::Joint,
        None => EvaluationMode::infer(dataset.column_kinds().iter().copied()),
    };
    let outputs = evaluator
        .evaluate_with_mode(&dataset, mode, FitState::default())
        .map_err(|e| e.to_string())?;

    match outputs.mode() {
        OutputMode::PerRow => write_row_likelihoods(args.out.as_deref(), &outputs),
        OutputMode::Aggregate => {
            let summary = Summary {
                rows: outputs.row_likelihoods().len(),
                neg2_log_likelihood: outputs.total_neg2_log_likelihood(),
                runs: outputs.stats().runs,
                factorizations: outputs.stats().factorizations,
                integrations: outputs.stats().integrations,
                failures: outputs.stats().failures,
                diagnostics: outputs.diagnostics(),
            };
            let text = serde_json::to_string_pretty(&summary)
                .map_err(|e| format!("failed to encode summary: {e}"))?;
            match &args.out {
                Some(path) => fs::write(path, text)
                    .map_err(|e| format!("failed to write '{}': {e}", path.display())),
                None => {
                    println!("{text}");
                    Ok(())
                }
            }
        }
    }
}

fn build_model(description: &ModelFile) -> Result<LinearMeanModel, String> {
    let dim = description.columns.len();
    if description.covariance.len() != dim
        || description.covariance.iter().any(|r| r.len() != dim)
    {
        return Err(format!("covariance must be {dim}x{dim} to match the declared columns"));
    }
    let covariance = Array2::from_shape_fn((dim, dim), |(i, j)| description.covariance[i][j]);
    let means = description.means.clone().map(Array1::from);
    let thresholds = ThresholdTable::new(
        description.columns
            .iter()
            .map(|c| match c.kind {
                ColumnKind::Ordinal => Some(ThresholdColumn::new(
                    c.thresholds.iter().map(|t| t.unwrap_or(f64::NAN)).collect(),
                )),
                ColumnKind::Continuous => None,
            })
            .collect(),
    );
    let base = StaticModel::new(covariance, means, thresholds).map_err(|e| e.to_string())?;

    let mut loadings = Array2::<f64>::zeros((dim, description.definitions.len()));
    for (k, def) in description.definitions.iter().enumerate() {
        if def.loadings.len() != dim {
            return Err(format!(
                "definition '{}' has {} loadings, expected {dim}",
                def.name,
                def.loadings.len()
            ));
        }
        for (i, &l) in def.loadings.iter().enumerate() {
            loadings[[i, k]] = l;
        }
    }
    Ok(LinearMeanModel::new(base, loadings)
        .map_err(|e| e.to_string())?
        .with_row_recompute(description.row_recompute))
}

fn parse_cell(raw: &str) -> Result<f64, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("na") || raw == "." {
        return Ok(f64::NAN);
    }
    raw.parse::<f64>()
        .map_err(|_| format!("'{raw}' is not a number"))
}

fn load_dataset(path: &Path, description: &ModelFile) -> Result<Dataset, String> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| format!("failed to open csv '{}': {e}", path.display()))?;

    let headers: HashMap<String, usize> = rdr
        .headers()
        .map_err(|e| format!("failed to read csv headers: {e}"))?
        .iter()
        .enumerate()
        .map(|(i, s)| (s.trim().to_string(), i))
        .collect();
    let locate = |name: &str| {
        headers
            .get(name)
            .copied()
            .ok_or_else(|| format!("column '{name}' not found in '{}'", path.display()))
    };
    let value_cols = description
        .columns
        .iter()
        .map(|c| locate(&c.name))
        .collect::<Result<Vec<_>, _>>()?;
    let def_cols = description
        .definitions
        .iter()
        .map(|d| locate(&d.name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = description
        .columns
        .iter()
        .fold(DatasetBuilder::new(), |b, c| b.column(c.name.clone(), c.kind))
        .definition_columns(def_cols.len());
    let mut values = vec![0.0; value_cols.len()];
    let mut defs = vec![0.0; def_cols.len()];
    for (i, rec) in rdr.records().enumerate() {
        let record: StringRecord = rec.map_err(|e| format!("failed reading csv row: {e}"))?;
        let field = |j: usize| {
            record
                .get(j)
                .ok_or_else(|| format!("missing field at row {}, col {}", i + 1, j + 1))
                .and_then(|raw| {
                    parse_cell(raw).map_err(|e| format!("row {}, col {}: {e}", i + 1, j + 1))
                })
        };
        for (slot, &j) in values.iter_mut().zip(&value_cols) {
            *slot = field(j)?;
        }
        for (slot, &j) in defs.iter_mut().zip(&def_cols) {
            *slot = field(j)?;
        }
        builder.push_row(&values, &defs).map_err(|e| e.to_string())?;
    }
    builder.build().map_err(|e| e.to_string())
}

fn write_row_likelihoods(path: Option<&Path>, outputs: &EvaluationOutputs) -> Result<(), String> {
    let sink: Box<dyn io::Write> = match path {
        Some(p) => Box::new(
            fs::File::create(p)
                .map_err(|e| format!("failed to create output csv '{}': {e}", p.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let mut wtr = WriterBuilder::new().has_headers(true).from_writer(sink);
    wtr.write_record(["row", "likelihood"])
        .map_err(|e| format!("failed to write csv header: {e}"))?;
    for (i, l) in outputs.row_likelihoods().iter().enumerate() {
        wtr.write_record([(i + 1).to_string(), format!("{l:.12e}")])
            .map_err(|e| format!("failed to write csv row {i}: {e}"))?;
    }
    wtr.flush()
        .map_err(|e| format!("failed to flush csv writer: {e}"))?;
    Ok(())
}
