//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use mpwork::logging::LogFormat;
use mpwork::pool::{DEFAULT_MAX_PROCESS_RESTARTS, DEFAULT_THREADS_PER_PROC, default_procs};
use mpwork::{ExecuteOptions, PanicPolicy, PoolConfig};
use std::time::Duration;

/// Drain batches of work items across worker processes and threads.
#[derive(Parser, Debug)]
#[command(name = "mpwork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log format for diagnostics on stderr.
    #[arg(long, env = "MPWORK_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a sample job over a generated batch of items.
    Run(RunArgs),

    /// List the sample jobs.
    Jobs,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "mpwork",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job to run (see `mpwork jobs`).
    #[arg(short, long, default_value = "square")]
    pub job: String,

    /// Number of work items to generate.
    #[arg(short = 'n', long, default_value_t = 100)]
    pub count: u64,

    /// Worker processes (0 runs everything on the calling thread).
    #[arg(short, long, env = "MPWORK_PROCS", default_value_t = default_procs())]
    pub procs: usize,

    /// Worker threads per process.
    #[arg(short, long, env = "MPWORK_THREADS_PER_PROC", default_value_t = DEFAULT_THREADS_PER_PROC)]
    pub threads_per_proc: usize,

    /// Cap on the total number of threads across all processes.
    #[arg(long, env = "MPWORK_MAX_THREADS")]
    pub max_threads: Option<usize>,

    /// Watchdog wake-up interval in milliseconds.
    #[arg(long, env = "MPWORK_WATCHDOG_INTERVAL_MS", default_value_t = 5000)]
    pub watchdog_interval_ms: u64,

    /// What to do when a callback panics.
    #[arg(long, default_value_t = PanicPolicy::ReplaceThread)]
    pub panic_policy: PanicPolicy,

    /// Times a dead worker process is respawned per slot.
    #[arg(long, default_value_t = DEFAULT_MAX_PROCESS_RESTARTS)]
    pub max_process_restarts: usize,

    /// Calls to `crash_first` that panic in each process.
    #[arg(long, default_value_t = 0)]
    pub crash_first: u32,

    /// Per-item delay for `slow_square`, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Hand each callback a logger.
    #[arg(long)]
    pub provide_logger: bool,

    /// Argument for the job's logger initializer (repeatable).
    #[arg(long = "log-arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub log_args: Vec<(String, String)>,

    /// Do not collect processed items.
    #[arg(long)]
    pub no_return: bool,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Plain)]
    pub format: OutputFormatArg,
}

impl RunArgs {
    /// Pool configuration for these arguments.
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new()
            .with_procs(self.procs)
            .with_threads_per_proc(self.threads_per_proc)
            .with_watchdog_interval(Duration::from_millis(self.watchdog_interval_ms))
            .with_panic_policy(self.panic_policy)
            .with_max_process_restarts(self.max_process_restarts);
        if let Some(max_threads) = self.max_threads {
            config = config.with_max_threads(max_threads);
        }
        config
    }

    /// Per-call options for these arguments.
    pub fn execute_options(&self) -> ExecuteOptions {
        self.log_args.iter().fold(
            ExecuteOptions::new()
                .return_objects(!self.no_return)
                .provide_logger(self.provide_logger),
            |options, (key, value)| options.logger_init_arg(key.clone(), value.clone()),
        )
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormatArg {
    /// Colored summary.
    #[default]
    Plain,
    /// JSON statistics and items.
    Json,
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: pool warnings and the summary.
    Normal,
    /// -v: include batch progress.
    Info,
    /// -vv: include per-process and per-thread events.
    Debug,
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            return Verbosity::Quiet;
        }
        match self.verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}
