//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::logging::{LogConfig, LogFormat, LogRotation};

/// Bounded worker pool with cross-process admission control and cooperative
/// cancellation.
#[derive(Parser, Debug)]
#[command(name = "slotgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// More diagnostics on stderr (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only errors on stderr.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Diagnostic log format: pretty, compact or json.
    #[arg(long, global = true, env = "SLOTGATE_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write diagnostics to this file.
    #[arg(long, global = true, env = "SLOTGATE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Rotation for --log-file: hourly, daily or never.
    #[arg(long, global = true, env = "SLOTGATE_LOG_ROTATION")]
    pub log_rotation: Option<LogRotation>,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a coordinator and its pool of workers.
    Run(RunArgs),

    /// Internal: run a single worker against a coordinator's primitives.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Pool capacity (N): workers allowed to do work at once. Prompted for if absent.
    #[arg(short = 'n', long, env = "SLOTGATE_CAPACITY")]
    pub capacity: Option<u32>,

    /// Number of work items (M), one worker each; must exceed the capacity.
    /// Prompted for if absent.
    #[arg(short = 'm', long, env = "SLOTGATE_TOTAL")]
    pub total: Option<usize>,

    /// Name the run's primitives after this id instead of a fresh UUID.
    #[arg(long, env = "SLOTGATE_RUN_ID")]
    pub run_id: Option<String>,

    /// Shortest simulated processing time per item, in milliseconds.
    #[arg(long, env = "SLOTGATE_MIN_DELAY_MS", default_value_t = 1000)]
    pub min_delay_ms: u64,

    /// Longest simulated processing time per item, in milliseconds.
    #[arg(long, env = "SLOTGATE_MAX_DELAY_MS", default_value_t = 3000)]
    pub max_delay_ms: u64,

    /// Longest a waiting worker blocks on the slot counter before it checks
    /// the closing flag again, in milliseconds.
    #[arg(long, env = "SLOTGATE_BACKOFF_MS", default_value_t = 50)]
    pub backoff_ms: u64,

    /// Most worker handles observed by one wait call.
    #[arg(long, env = "SLOTGATE_WAIT_CEILING", default_value_t = crate::wait::MAX_WAIT_OBJECTS)]
    pub wait_ceiling: usize,

    /// Run workers as threads on an in-process registry instead of processes.
    #[arg(long)]
    pub threads: bool,

    /// Begin closing as soon as every worker is launched.
    #[arg(long)]
    pub close_immediately: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Arguments the coordinator passes to each worker process.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[arg(long, env = "SLOTGATE_RUN_ID")]
    pub run_id: String,

    #[arg(long)]
    pub index: usize,

    #[arg(long)]
    pub item: String,

    #[arg(long, default_value_t = 1000)]
    pub min_delay_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub max_delay_ms: u64,

    #[arg(long, default_value_t = 50)]
    pub backoff_ms: u64,
}

impl Cli {
    /// Logging setup for the selected command, with flags applied over the
    /// command's preset and the environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = match &self.command {
            Commands::Run(args) if args.threads => LogConfig::for_threads(),
            Commands::Run(_) => LogConfig::for_coordinator(),
            Commands::Worker(_) => LogConfig::for_worker(),
        };

        if self.quiet {
            config = config.with_level(Level::ERROR);
        } else if self.verbose > 0 {
            let level = if self.verbose == 1 {
                Level::DEBUG
            } else {
                Level::TRACE
            };
            config = config.with_filter(format!("slotgate={}", level).to_lowercase());
        }

        config = config.with_env_overrides().with_ansi(!self.no_color);
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        if let Some(rotation) = self.log_rotation {
            config = config.with_rotation(rotation);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "slotgate",
            "run",
            "--capacity",
            "2",
            "--total",
            "5",
            "--min-delay-ms",
            "10",
            "--threads",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.capacity, Some(2));
                assert_eq!(args.total, Some(5));
                assert_eq!(args.min_delay_ms, 10);
                assert_eq!(args.max_delay_ms, 3000);
                assert_eq!(args.backoff_ms, 50);
                assert!(args.threads);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_worker() {
        let cli = Cli::try_parse_from([
            "slotgate",
            "worker",
            "--run-id",
            "r1",
            "--index",
            "3",
            "--item",
            "setup_3.exe",
            "--backoff-ms",
            "20",
        ])
        .unwrap();
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.run_id, "r1");
                assert_eq!(args.index, 3);
                assert_eq!(args.item, "setup_3.exe");
                assert_eq!(args.backoff_ms, 20);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["slotgate", "-q", "-v", "run"]).is_err());
    }

    #[test]
    fn test_log_presets_follow_command() {
        let cli = Cli::try_parse_from([
            "slotgate", "worker", "--run-id", "r1", "--index", "0", "--item", "x",
        ])
        .unwrap();
        assert_eq!(cli.log_config().format, LogFormat::Compact);

        let cli = Cli::try_parse_from(["slotgate", "-vv", "run"]).unwrap();
        assert_eq!(cli.log_config().filter.as_deref(), Some("slotgate=trace"));
    }

    #[test]
    fn test_log_rotation_flag() {
        let cli = Cli::try_parse_from([
            "slotgate",
            "--log-file",
            "run.log",
            "--log-rotation",
            "daily",
            "run",
        ])
        .unwrap();
        let config = cli.log_config();
        assert_eq!(config.file_path, Some(PathBuf::from("run.log")));
        assert_eq!(config.rotation, LogRotation::Daily);

        assert!(Cli::try_parse_from(["slotgate", "--log-rotation", "weekly", "run"]).is_err());
    }
}
