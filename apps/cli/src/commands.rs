//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use imgflow_core::{
    Collaborators, ConfigurationResolver, PipelineOrchestrator, ProgressReporter, RunStateStore,
    RunSummary, StageOutcome, StageSelector,
};
use imgflow_model::Classifier;
use imgflow_shared::{DEFAULT_PARAMS_FILE, DEFAULT_SETTINGS_FILE, PipelineError, StageName};
use imgflow_tracking::{BackgroundSink, MetricsSink, NullSink};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// imgflow: resumable image-classification training pipeline.
#[derive(Parser)]
#[command(
    name = "imgflow",
    version,
    about = "Run a configuration-driven image-classification pipeline: ingest, prepare, train, evaluate.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Settings document (paths, URIs, tracking), relative to --root.
    #[arg(long = "config", default_value = DEFAULT_SETTINGS_FILE, global = true)]
    pub settings: PathBuf,

    /// Parameters document (hyperparameters), relative to --root.
    #[arg(long, default_value = DEFAULT_PARAMS_FILE, global = true)]
    pub params: PathBuf,

    /// Project root that relative paths resolve against.
    #[arg(long, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one stage, or the whole pipeline.
    Run {
        /// ingestion, base_prep, training, evaluation, or all.
        #[arg(default_value = "all")]
        stage: StageSelector,
    },

    /// Show the run-state ledger.
    Status {
        /// Print the raw ledger as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Classify an image with the trained checkpoint.
    Predict {
        /// Image file (png, jpg, bmp, gif).
        image: PathBuf,

        /// Print the prediction as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Print resolved stage configuration as JSON.
    Show {
        /// Only this stage (defaults to every stage).
        stage: Option<StageName>,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "imgflow=info",
        1 => "imgflow=debug",
        _ => "imgflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) fn run(cli: Cli) -> Result<()> {
    let resolver = ConfigurationResolver::from_files(&cli.root, &cli.settings, &cli.params)?;

    match cli.command {
        Command::Run { stage } => cmd_run(resolver, stage),
        Command::Status { json } => cmd_status(&resolver, json),
        Command::Config { action } => match action {
            ConfigAction::Show { stage } => cmd_config_show(&resolver, stage),
        },
        Command::Predict { image, json } => cmd_predict(&resolver, &image, json),
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Tracking sink for this process; `None` when tracking is off or unreachable.
fn open_tracking(resolver: &ConfigurationResolver) -> Result<(Option<Arc<BackgroundSink>>, Option<String>)> {
    let Some(tracking) = resolver.tracking()? else {
        return Ok((None, None));
    };

    match BackgroundSink::open(&tracking.target) {
        Ok(sink) => {
            info!(tracker = ?tracking.target, "experiment tracking enabled");
            Ok((Some(Arc::new(sink)), tracking.experiment))
        }
        Err(e) => {
            warn!(error = %e, "experiment tracking unavailable, continuing without it");
            Ok((None, tracking.experiment))
        }
    }
}

fn cmd_run(resolver: ConfigurationResolver, selector: StageSelector) -> Result<()> {
    let (background, experiment) = open_tracking(&resolver)?;
    let sink: Arc<dyn MetricsSink> = match &background {
        Some(sink) => sink.clone(),
        None => Arc::new(NullSink),
    };

    let collaborators = Collaborators::standard()?;
    let mut orchestrator =
        PipelineOrchestrator::new(resolver, collaborators, sink).with_experiment(experiment);

    info!(%selector, "running pipeline");
    let reporter = CliProgress::new();
    let result = orchestrator.run(selector, &reporter);

    if let Some(sink) = background {
        let stats = sink.shutdown();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "metrics sink closed"
        );
    }

    let summary = result.map_err(Report::new)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Pipeline finished");
    println!("  Run:    {}", summary.run_id);
    for (stage, outcome) in &summary.outcomes {
        println!("  {:<11} {}", stage.as_str(), describe(outcome));
    }
    if let Some(scores) = &summary.scores {
        println!("  Loss:     {:.4}", scores.loss);
        println!("  Accuracy: {:.4}", scores.accuracy);
    }
    println!("  Time:   {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

fn describe(outcome: &StageOutcome) -> String {
    match outcome {
        StageOutcome::Completed => "completed".into(),
        StageOutcome::Skipped { reason } => format!("skipped ({reason})"),
        StageOutcome::Scored(report) => {
            format!("scored (loss {:.4}, accuracy {:.4})", report.loss, report.accuracy)
        }
    }
}

// ---------------------------------------------------------------------------
// status / config / predict
// ---------------------------------------------------------------------------

fn cmd_status(resolver: &ConfigurationResolver, json: bool) -> Result<()> {
    let ledger = RunStateStore::open(&resolver.run_state_path()?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(ledger.state())?);
        return Ok(());
    }

    println!("  Ledger: {}", ledger.path().display());
    for stage in StageName::ALL {
        match ledger.record(stage) {
            Some(record) => {
                let finished = record
                    .finished_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "  {:<11} {:<10} {}  run {}",
                    stage.as_str(),
                    record.status.to_string(),
                    finished,
                    record.run_id
                );
                if let (Some(kind), Some(error)) = (&record.error_kind, &record.error) {
                    println!("              {kind}: {error}");
                }
            }
            None => println!("  {:<11} never run", stage.as_str()),
        }
    }
    Ok(())
}

fn cmd_config_show(resolver: &ConfigurationResolver, stage: Option<StageName>) -> Result<()> {
    let stages = stage.map_or_else(|| StageName::ALL.to_vec(), |s| vec![s]);
    let mut resolved = Vec::with_capacity(stages.len());
    for stage in stages {
        resolved.push(
            resolver
                .resolve(stage)
                .wrap_err_with(|| format!("resolving {stage} configuration"))?,
        );
    }
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

fn cmd_predict(resolver: &ConfigurationResolver, image: &Path, json: bool) -> Result<()> {
    let checkpoint = resolver.artifact_layout()?.checkpoint;
    if !checkpoint.is_file() {
        return Err(eyre!(
            "no trained checkpoint at {}; run `imgflow run training` first",
            checkpoint.display()
        ));
    }

    let classifier = Classifier::load(&checkpoint)?;
    let prediction = classifier
        .predict_path(image)
        .map_err(|e: PipelineError| eyre!("{}: {e}", image.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
    } else {
        println!(
            "{} ({:.1}% confidence)",
            prediction.label,
            prediction.confidence * 100.0
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: StageName, index: usize, total: usize) {
        self.spinner
            .set_message(format!("[{}/{total}] {stage}", index + 1));
    }

    fn stage_finished(&self, stage: StageName, outcome: &StageOutcome, elapsed: Duration) {
        self.spinner.println(format!(
            "  ✓ {stage}: {} in {:.1}s",
            describe(outcome),
            elapsed.as_secs_f64()
        ));
    }

    fn stage_failed(&self, stage: StageName, error: &PipelineError) {
        self.spinner.abandon_with_message(format!("✗ {stage}: {}", error.kind()));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
