//! Command line front end: list procedures, preview run plans, run sequences.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use lab_sequencer::config::{SequencerConfig, DEFAULT_CONFIG_PATH};
use lab_sequencer::instrument::{FallbackDriver, InstrumentDriver, SimulatedDriver};
use lab_sequencer::logging;
use lab_sequencer::procedures::builtin_registry;
use lab_sequencer::sequence::plan::PlanEntry;
use lab_sequencer::sequence::{FailurePolicy, RunPlan, SequenceEngine, SequenceReport};
use lab_sequencer::storage::{CsvSink, MemorySink, ResultSink};

#[derive(Parser)]
#[command(name = "lab_sequencer")]
#[command(about = "Run sequences of measurement procedures on shared instruments")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered procedures with their parameters and columns
    List,
    /// Print the expanded run plan of a sequence
    Plan {
        sequence: String,
        /// Print the plan as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Execute a sequence
    Run {
        sequence: String,
        /// Grace period for a step to honour an abort request
        #[arg(long, value_parser = parse_duration)]
        abort_timeout: Option<Duration>,
        /// Stop at the first failed step
        #[arg(long, default_value_t = false)]
        stop_on_failure: bool,
        /// Directory for result files
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(s)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SequencerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    logging::init_from_config(&config.application)?;

    let registry = Arc::new(builtin_registry(&config.instruments));

    match cli.command {
        Commands::List => {
            for definition in registry.iter() {
                println!("{}: {}", definition.name(), definition.summary());
                for param in definition.parameter_set().iter() {
                    let unit = param.unit().map(|u| format!(" {}", u)).unwrap_or_default();
                    println!("    {} = {}{}", param.name(), param.default_value(), unit);
                }
                if !definition.data_columns().is_empty() {
                    println!("    columns: {}", definition.data_columns().join(", "));
                }
                for requirement in definition.instruments() {
                    println!(
                        "    instrument {} -> {} ({})",
                        requirement.role, requirement.key, requirement.mode
                    );
                }
            }
        }
        Commands::Plan { sequence, json } => {
            let definition = config
                .sequence(&sequence)
                .with_context(|| format!("No sequence named '{}' in configuration", sequence))?;
            let plan = RunPlan::expand(&definition.to_spec(), &registry);
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }
        Commands::Run {
            sequence,
            abort_timeout,
            stop_on_failure,
            output_dir,
        } => {
            if let Some(timeout) = abort_timeout {
                config.engine.abort_timeout = timeout;
            }
            if stop_on_failure {
                config.engine.failure_policy = FailurePolicy::StopOnFailure;
            }
            if let Some(dir) = output_dir {
                config.storage.output_dir = dir;
            }
            let report = run(&config, registry, &sequence).await?;
            if !report.succeeded() {
                bail!(
                    "Sequence '{}' did not complete: {} failed, {} aborted",
                    report.sequence,
                    report.count(lab_sequencer::procedure::ProcedureStatus::Failed),
                    report.count(lab_sequencer::procedure::ProcedureStatus::Aborted)
                );
            }
        }
    }

    Ok(())
}

async fn run(
    config: &SequencerConfig,
    registry: Arc<lab_sequencer::procedure::ProcedureRegistry>,
    sequence: &str,
) -> Result<SequenceReport> {
    let definition = config
        .sequence(sequence)
        .with_context(|| format!("No sequence named '{}' in configuration", sequence))?;

    let simulated: Arc<dyn InstrumentDriver> = Arc::new(SimulatedDriver::new());
    let driver: Arc<dyn InstrumentDriver> = if config.instruments.debug_fallback {
        Arc::new(FallbackDriver::new(simulated))
    } else {
        simulated
    };

    let engine = SequenceEngine::new(registry, driver)
        .with_config(config.engine.clone())
        .with_retry_policy(config.instruments.open_retry.clone());
    let plan = engine.plan(&definition.to_spec());
    print_plan(&plan);

    let mut sink: Box<dyn ResultSink> = match config.storage.backend.as_str() {
        "memory" => Box::new(MemorySink::new()),
        _ => Box::new(CsvSink::new(&config.storage.output_dir)?),
    };

    let handle = engine.spawn(plan);
    let abort = handle.abort_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting sequence");
            abort.abort();
        }
    });

    let report = handle.finish_into(sink.as_mut()).await?;
    ctrl_c.abort();

    info!(
        run = %report.run_id,
        rows = report.total_rows(),
        "Sequence '{}' ended", report.sequence
    );
    for step in &report.steps {
        match &step.error {
            Some(error) => println!("{} {} {} rows={} {}", step.id, step.procedure, step.status, step.rows_emitted, error),
            None => println!("{} {} {} rows={}", step.id, step.procedure, step.status, step.rows_emitted),
        }
    }
    Ok(report)
}

fn print_plan(plan: &RunPlan) {
    println!("Sequence '{}': {} step(s)", plan.sequence, plan.len());
    for entry in plan.entries() {
        match entry {
            PlanEntry::Step(step) => {
                let sweep = step
                    .sweep_value
                    .as_ref()
                    .map(|v| format!(" [{}]", v))
                    .unwrap_or_default();
                println!("  {} {}{}", step.id, step.procedure, sweep);
            }
            PlanEntry::Rejected(rejected) => {
                println!(
                    "  {}.- {} rejected: {}",
                    rejected.template_index, rejected.procedure, rejected.error
                );
            }
        }
    }
}
