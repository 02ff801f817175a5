//! Telemetry CLI - command-line interface for Telemetry Flux
//!
//! Commands:
//! - summarize: KPIs and quality report for a recorded session
//! - downsample: LTTB-reduced series of one field
//! - replay: preload history into an in-memory store, then stream the rest live

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use telemetry_flux::host;
use telemetry_flux::pipeline::Disposition;
use telemetry_flux::{
    EngineConfig, EngineError, MemoryStore, Normalizer, Sample, SampleStore, StoreError,
    StreamProcessor, FLUX_VERSION,
};

/// Telemetry Flux - reconcile telemetry streams and compute derived metrics
#[derive(Parser)]
#[command(name = "telemetry")]
#[command(version = FLUX_VERSION)]
#[command(about = "Reconcile vehicle telemetry and compute derived metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print KPIs and the data-quality report for a recording
    Summarize {
        /// Input file path, NDJSON or JSON array (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Downsample one field of a recording with LTTB
    Downsample {
        /// Input file path, NDJSON or JSON array (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Number of points to keep
        #[arg(long, default_value = "1000")]
        points: usize,

        /// Field to chart, raw or derived (e.g. speed_kmh, g_total)
        #[arg(long, default_value = "speed_kmh")]
        field: String,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Replay a recording through the processing host
    Replay {
        /// Input file path, NDJSON or JSON array (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Percentage of each session preloaded into the store as history
        #[arg(long, default_value = "50")]
        history_percent: u8,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Engine configuration file (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sliding-window length of the session buffer
    #[arg(long)]
    max_points: Option<usize>,

    /// Page size for historical fetches
    #[arg(long)]
    page_size: Option<usize>,

    /// Gap (ms) after the buffer tail that triggers a backfill
    #[arg(long)]
    gap_threshold_ms: Option<i64>,
}

impl EngineArgs {
    fn load(&self) -> Result<EngineConfig, TelemetryCliError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json(&fs::read_to_string(path)?)?,
            None => EngineConfig::default(),
        };
        if let Some(max_points) = self.max_points {
            config = config.with_max_points(max_points);
        }
        if let Some(page_size) = self.page_size {
            config = config.with_page_size(page_size);
        }
        if let Some(gap) = self.gap_threshold_ms {
            config = config.with_gap_threshold_ms(gap);
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let body = serde_json::to_string(&CliError::from(e))
                .unwrap_or_else(|_| "Unknown error".to_string());
            eprintln!("{body}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), TelemetryCliError> {
    match cli.command {
        Commands::Summarize { input, engine } => cmd_summarize(&input, engine.load()?),
        Commands::Downsample {
            input,
            points,
            field,
            engine,
        } => cmd_downsample(&input, points, &field, engine.load()?),
        Commands::Replay {
            input,
            history_percent,
            engine,
        } => cmd_replay(&input, history_percent.min(100), engine.load()?),
    }
}

fn cmd_summarize(input: &Path, config: EngineConfig) -> Result<(), TelemetryCliError> {
    let records = read_records(input)?;
    let mut processor = StreamProcessor::new(config);
    processor.ingest_batch(&records);

    if processor.is_empty() {
        return Err(TelemetryCliError::NoSamples);
    }

    println!("{}", serde_json::to_string_pretty(&processor.summary(Utc::now()))?);
    Ok(())
}

#[derive(serde::Serialize)]
struct ChartPoint {
    timestamp: chrono::DateTime<Utc>,
    value: f64,
}

fn cmd_downsample(
    input: &Path,
    points: usize,
    field: &str,
    config: EngineConfig,
) -> Result<(), TelemetryCliError> {
    let records = read_records(input)?;
    let mut processor = StreamProcessor::new(config);
    processor.ingest_batch(&records);

    let first = processor.buffer().first().ok_or(TelemetryCliError::NoSamples)?;
    if first.value(field).is_none() {
        return Err(TelemetryCliError::UnknownField(field.to_string()));
    }

    let reduced = telemetry_flux::downsample::downsample(processor.buffer(), points, |s| {
        s.value(field).unwrap_or(0.0)
    });
    let series: Vec<ChartPoint> = reduced
        .iter()
        .map(|s| ChartPoint {
            timestamp: s.timestamp,
            value: s.value(field).unwrap_or(0.0),
        })
        .collect();

    println!(
        "{}",
        serde_json::json!({
            "field": field,
            "source_count": processor.len(),
            "points": series,
        })
    );
    Ok(())
}

#[derive(Debug, Default, serde::Serialize)]
struct ReplayReport {
    preloaded: usize,
    streamed: usize,
    dispositions: BTreeMap<String, usize>,
    backfill_errors: usize,
    final_count: usize,
    summary: Option<telemetry_flux::Summary>,
}

fn cmd_replay(
    input: &Path,
    history_percent: u8,
    config: EngineConfig,
) -> Result<(), TelemetryCliError> {
    let records = read_records(input)?;

    let mut sessions: BTreeMap<String, Vec<(Sample, Value)>> = BTreeMap::new();
    for raw in records {
        // Malformed records never reach the store or the host.
        if let Ok(sample) = Normalizer::normalize(&raw, None) {
            sessions
                .entry(sample.session_id.clone())
                .or_default()
                .push((sample, raw));
        }
    }
    if sessions.is_empty() {
        return Err(TelemetryCliError::NoSamples);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let store = Arc::new(MemoryStore::new());
        let mut report = ReplayReport::default();
        let mut live: Vec<Value> = Vec::new();

        for (session_id, mut entries) in sessions {
            entries.sort_by_key(|(sample, _)| sample.key());
            let split = entries.len() * history_percent as usize / 100;
            let history: Vec<Sample> = entries.drain(..split).map(|(sample, _)| sample).collect();
            report.preloaded += store.insert_batch(&session_id, history).await?;
            live.extend(entries.into_iter().map(|(_, raw)| raw));
        }

        let (handle, task) = host::spawn(store, config)?;
        for raw in live {
            report.streamed += 1;
            match handle.ingest(raw).await {
                Ok(reply) => {
                    let name = disposition_name(reply.disposition);
                    *report.dispositions.entry(name).or_default() += 1;
                }
                Err(e) if e.is_backfill() => report.backfill_errors += 1,
                Err(e) => return Err(e.into()),
            }
        }

        report.final_count = handle.snapshot().await?.count;
        report.summary = Some(handle.summary(Utc::now()).await?);
        handle.shutdown().await?;
        task.await.map_err(|e| TelemetryCliError::Runtime(e.to_string()))?;

        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok::<(), TelemetryCliError>(())
    })
}

fn disposition_name(disposition: Disposition) -> String {
    match disposition {
        Disposition::Applied => "applied",
        Disposition::Duplicate => "duplicate",
        Disposition::Queued => "queued",
        Disposition::Dropped => "dropped",
    }
    .to_string()
}

/// Read raw records as NDJSON or a JSON array
fn read_records(input: &Path) -> Result<Vec<Value>, TelemetryCliError> {
    let data = if input.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            return Err(TelemetryCliError::InteractiveStdin);
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    if data.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&data)?);
    }

    let mut records = Vec::new();
    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| {
            TelemetryCliError::ParseError(format!("Line {}: {}", line_no + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

// Error types

#[derive(Debug)]
enum TelemetryCliError {
    Io(io::Error),
    Engine(EngineError),
    Store(StoreError),
    Json(serde_json::Error),
    ParseError(String),
    UnknownField(String),
    Runtime(String),
    InteractiveStdin,
    NoSamples,
}

impl From<io::Error> for TelemetryCliError {
    fn from(e: io::Error) -> Self {
        TelemetryCliError::Io(e)
    }
}

impl From<EngineError> for TelemetryCliError {
    fn from(e: EngineError) -> Self {
        TelemetryCliError::Engine(e)
    }
}

impl From<StoreError> for TelemetryCliError {
    fn from(e: StoreError) -> Self {
        TelemetryCliError::Store(e)
    }
}

impl From<serde_json::Error> for TelemetryCliError {
    fn from(e: serde_json::Error) -> Self {
        TelemetryCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<TelemetryCliError> for CliError {
    fn from(e: TelemetryCliError) -> Self {
        match e {
            TelemetryCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            TelemetryCliError::Engine(EngineError::InvalidConfig(msg)) => CliError {
                code: "INVALID_CONFIG".to_string(),
                message: msg,
                hint: Some("Limits and thresholds must be positive".to_string()),
            },
            TelemetryCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            TelemetryCliError::Store(e) => CliError {
                code: "STORE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            TelemetryCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            TelemetryCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Input must be NDJSON or a JSON array of records".to_string()),
            },
            TelemetryCliError::UnknownField(field) => CliError {
                code: "UNKNOWN_FIELD".to_string(),
                message: format!("Field '{}' is not a numeric sample field", field),
                hint: Some("Try speed_kmh, power_w or g_total".to_string()),
            },
            TelemetryCliError::Runtime(msg) => CliError {
                code: "RUNTIME_ERROR".to_string(),
                message: msg,
                hint: None,
            },
            TelemetryCliError::InteractiveStdin => CliError {
                code: "INTERACTIVE_STDIN".to_string(),
                message: "Refusing to read records from a terminal".to_string(),
                hint: Some("Pipe a file into stdin or pass --input FILE".to_string()),
            },
            TelemetryCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No valid samples found in input".to_string(),
                hint: Some("Records need a session_id and a timestamp".to_string()),
            },
        }
    }
}
