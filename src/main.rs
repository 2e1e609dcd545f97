//! slotgate - bounded worker pool coordinator

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::debug;

use slotgate::cli::{Cli, Commands, RunArgs, WorkerArgs};
use slotgate::config::{DelayRange, PoolParams, RunConfig};
use slotgate::console::StdoutSink;
use slotgate::coordinator::{
    Coordinator, Immediate, Launcher, OperatorTrigger, ProcessLauncher, RunSummary, ThreadLauncher,
};
use slotgate::error::SlotgateError;
use slotgate::logging;
use slotgate::sync::{Backend, MemoryRegistry, PosixBackend, PrimitiveNames, RunId};
use slotgate::work::BracketCheck;
use slotgate::worker::{self, Assignment, WorkerOptions, WorkerStatus};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(cli.log_config());

    match &cli.command {
        Commands::Run(args) => {
            if let Err(e) = cmd_run(args) {
                print_error(&e);
                std::process::exit(1);
            }
        }
        Commands::Worker(args) => {
            let status = cmd_worker(args).unwrap_or_else(|e| {
                print_error(&e);
                WorkerStatus::Error
            });
            std::process::exit(status.exit_code());
        }
    }
}

/// Print an error and its cause chain on stderr.
fn print_error(e: &anyhow::Error) {
    eprintln!(
        "{}: {}",
        "error"
            .if_supports_color(Stderr, |text| text.red())
            .if_supports_color(Stderr, |text| text.bold()),
        e
    );
    for cause in e.chain().skip(1) {
        eprintln!(
            "  {}: {}",
            "caused by".if_supports_color(Stderr, |text| text.yellow()),
            cause
        );
    }
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let mut input = io::stdin().lock();
    let capacity = match args.capacity {
        Some(n) => n,
        None => prompt(&mut input, "Pool capacity (N)")?,
    };
    let total = match args.total {
        Some(m) => m,
        None => prompt(&mut input, "Number of work items (M)")?,
    };
    // The close trigger reads stdin from its own thread.
    drop(input);

    let params = PoolParams::new(capacity, total)?;
    let delay = DelayRange::from_millis(args.min_delay_ms, args.max_delay_ms)?;
    let run_id = match &args.run_id {
        Some(id) => id.parse::<RunId>()?,
        None => RunId::generate(),
    };
    let config = RunConfig::new(params)
        .with_run_id(run_id)
        .with_delay(delay)
        .with_wait_ceiling(args.wait_ceiling)
        .with_acquire_backoff(Duration::from_millis(args.backoff_ms));
    debug!(?config, "Run configuration");

    let summary = if args.threads {
        let registry = MemoryRegistry::new();
        let launcher = ThreadLauncher::new(
            registry.clone(),
            config.names(),
            Arc::new(BracketCheck::new(delay)),
            StdoutSink,
            WorkerOptions {
                backoff: config.acquire_backoff,
            },
        );
        drive(Coordinator::new(config, registry, launcher), args)?
    } else {
        let launcher = ProcessLauncher::current_exe(config.run_id.clone(), delay)
            .context("Cannot locate the slotgate executable to launch workers")?
            .with_backoff(config.acquire_backoff);
        drive(Coordinator::new(config, PosixBackend, launcher), args)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

fn drive<B: Backend, L: Launcher>(
    mut coordinator: Coordinator<B, L>,
    args: &RunArgs,
) -> Result<RunSummary> {
    let summary = if args.close_immediately {
        coordinator.run(Immediate, StdoutSink)?
    } else {
        let trigger = OperatorTrigger::install().context("Failed to install close trigger")?;
        coordinator.run(trigger, StdoutSink)?
    };
    Ok(summary)
}

/// Ask for a number on stdout and read it from `input`.
fn prompt<T: std::str::FromStr>(input: &mut impl BufRead, label: &str) -> Result<T> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(SlotgateError::InvalidParameters(format!("no value given for {}", label)).into());
    }
    let value = line.trim();
    value.parse().map_err(|_| {
        SlotgateError::InvalidParameters(format!("'{}' is not a valid {}", value, label)).into()
    })
}

fn cmd_worker(args: &WorkerArgs) -> Result<WorkerStatus> {
    let run_id: RunId = args.run_id.parse()?;
    let delay = DelayRange::from_millis(args.min_delay_ms, args.max_delay_ms)?;
    let work = BracketCheck::new(delay);

    let status = worker::run_worker(
        PosixBackend,
        PrimitiveNames::for_run(&run_id),
        &Assignment::new(args.index, args.item.clone()),
        &work,
        StdoutSink,
        &WorkerOptions {
            backoff: Duration::from_millis(args.backoff_ms),
        },
    )?;
    Ok(status)
}
