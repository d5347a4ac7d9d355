//! `dbintel` command line harness: configuration tooling plus an NDJSON
//! driver that runs records through the pipeline.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dbintel_pipeline::config::PipelineConfig;
use dbintel_pipeline::logging::init_logging;
use dbintel_pipeline::verification::FeedbackLevel;
use dbintel_pipeline::{Batch, Pipeline, Record, NAME, VERSION};

// ----------------------------------------------------------------------------
// CLI Definition
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "dbintel", version, about = "Database telemetry intelligence pipeline")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dbintel.toml", env = "DBINTEL_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "DBINTEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Print the fully resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run NDJSON records through the pipeline and print the survivors
    Process {
        /// Input file, one JSON record per line (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Fixed batch size instead of the tuned one
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("Configuration at {} is invalid", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{}", "=".repeat(60));
        println!("{}", rendered);
    }

    println!();
    println!("Summary:");
    println!("  instance name:     {}", config.pipeline.instance_name);
    println!("  circuit breaker:   {}", enabled(config.circuit_breaker.enabled));
    println!(
        "  sampler:           {} ({} rules, default rate {})",
        enabled(config.sampler.enabled),
        config.sampler.rules.len(),
        config.sampler.default_sample_rate
    );
    println!("  plan extractor:    {}", enabled(config.plan_extractor.enabled));
    println!("  verification:      {}", enabled(config.verification.enabled));
    println!("    auto-tuning:     {}", enabled(config.verification.tuning.enabled));
    println!("    self-healing:    {}", enabled(config.verification.healing.enabled));
    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = PipelineConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", NAME, VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

async fn handle_process(config: PipelineConfig, input: Option<&Path>, batch_size: Option<usize>) -> AnyhowResult<()> {
    let pipeline = Pipeline::new(config).context("Failed to build pipeline")?;
    pipeline.start().context("Failed to start background tasks")?;

    if let Some(mut feedback) = pipeline.take_feedback_receiver() {
        tokio::spawn(async move {
            while let Some(event) = feedback.recv().await {
                match event.level {
                    FeedbackLevel::Info => info!(target: "dbintel::pipeline", category = %event.category, "{}", event.message),
                    _ => warn!(target: "dbintel::pipeline", category = %event.category, "{}", event.message),
                }
            }
        });
    }

    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut out = BufWriter::new(io::stdout().lock());

    let mut pending = Vec::new();
    let mut forwarded = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record =
            serde_json::from_str(&line).with_context(|| format!("Invalid record on line {}", index + 1))?;
        pending.push(record);

        let limit = batch_size.unwrap_or_else(|| pipeline.tunables().batch_size()).max(1);
        if pending.len() >= limit {
            forwarded += flush(&pipeline, &mut pending, &mut out)?;
        }
    }
    forwarded += flush(&pipeline, &mut pending, &mut out)?;
    out.flush().context("Failed to write output")?;
    drop(out);

    let counters = pipeline.metrics().counters.snapshot();
    info!(
        target: "dbintel::pipeline",
        received = counters.records_in,
        forwarded,
        "Input processed"
    );

    pipeline.shutdown().await;
    Ok(())
}

fn flush(pipeline: &Pipeline, pending: &mut Vec<Record>, out: &mut impl Write) -> AnyhowResult<usize> {
    if pending.is_empty() {
        return Ok(0);
    }
    let batch = pipeline.process_batch(Batch::new(std::mem::take(pending)))?;
    let count = batch.len();
    for record in batch {
        serde_json::to_writer(&mut *out, &record).context("Failed to encode record")?;
        out.write_all(b"\n").context("Failed to write output")?;
    }
    Ok(count)
}

// ----------------------------------------------------------------------------
// Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => return handle_generate_config(output.as_deref()),
        Commands::Validate { verbose } => return handle_validate(&cli.config, *verbose),
        Commands::Process { .. } => {}
    }

    let config = PipelineConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if cli.debug {
        logging.level = "debug".into();
    }
    init_logging(&logging)?;
    if !cli.config.exists() {
        warn!(target: "dbintel::init", path = %cli.config.display(), "Config file not found, using defaults");
    }
    info!(target: "dbintel::init", version = VERSION, instance = %config.pipeline.instance_name, "Starting dbintel");

    if let Commands::Process { input, batch_size } = cli.command {
        handle_process(config, input.as_deref(), batch_size).await?;
    }
    Ok(())
}
