//! mpwork - drain a batch of sample work items across processes and threads.

mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use mpwork::logging::{self, LogConfig};
use mpwork::samples::{self, SampleItem};
use mpwork::{MultiProcWorkPool, PoolError, RunStats};
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::Level;

use cli::{Cli, Commands, OutputFormatArg, RunArgs, Verbosity};

/// Exit status after Ctrl+C, as a shell reports SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    // Worker processes re-execute this binary; they never reach the CLI.
    mpwork::run_if_worker(&samples::registry());

    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Jobs => cmd_jobs(),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
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
        let interrupted = matches!(e.downcast_ref::<PoolError>(), Some(PoolError::Interrupted));
        std::process::exit(if interrupted { EXIT_INTERRUPTED } else { 1 });
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::new()
        .with_format(cli.log_format)
        .with_level(Level::WARN);
    match cli.verbosity() {
        Verbosity::Quiet => config = config.with_level(Level::ERROR),
        Verbosity::Normal => {}
        Verbosity::Info => config = config.with_filter("info".to_string()),
        Verbosity::Debug => config = config.with_filter("debug".to_string()),
    }
    logging::init_once(config.with_env_overrides());
}

fn cmd_jobs() -> Result<()> {
    for name in samples::registry().names() {
        println!("{}", name);
    }
    Ok(())
}

#[derive(Serialize)]
struct RunOutput<'a> {
    stats: &'a RunStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<&'a [SampleItem]>,
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    // Inline runs with a logger let the job's initializer set up logging.
    if !(args.provide_logger && args.procs == 0) {
        init_logging(cli);
    }

    let job = samples::job(&args.job).ok_or_else(|| {
        anyhow!(
            "Unknown job '{}'. Available: {}",
            args.job,
            samples::registry().names().join(", ")
        )
    })?;

    let items: Vec<SampleItem> = samples::make_items(args.count)
        .into_iter()
        .map(|item| {
            item.with_delay(args.delay_ms)
                .with_crash_first(args.crash_first)
        })
        .collect();

    let pool = MultiProcWorkPool::new(args.pool_config())
        .context("Invalid pool configuration")?;

    let interrupt = pool.interrupt_handle();
    let quiet = cli.quiet;
    ctrlc::set_handler(move || {
        if !quiet {
            eprintln!("\nReceived Ctrl+C, stopping workers...");
        }
        interrupt.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")?;

    let results = pool.execute(items, &job, args.execute_options())?;
    let stats = pool
        .last_run()
        .ok_or_else(|| anyhow!("Pool finished without run statistics"))?;

    match args.format {
        OutputFormatArg::Json => {
            let output = RunOutput {
                stats: &stats,
                items: results.as_deref(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormatArg::Plain => {
            if !cli.quiet {
                print_summary(cli, &stats);
            }
        }
    }
    Ok(())
}

fn print_summary(cli: &Cli, stats: &RunStats) {
    println!(
        "{} {} of {} items in {:.1?}",
        "Completed".if_supports_color(Stdout, |text| text.green()),
        stats.completed,
        stats.submitted,
        stats.elapsed
    );
    if stats.failed + stats.crashed + stats.lost > 0 {
        println!(
            "  {} failed, {} crashed, {} lost",
            stats.failed.if_supports_color(Stdout, |text| text.yellow()),
            stats.crashed.if_supports_color(Stdout, |text| text.red()),
            stats.lost.if_supports_color(Stdout, |text| text.red())
        );
    }
    if stats.procs == 0 {
        println!("  inline on the calling thread");
    } else {
        println!(
            "  {} processes x {} threads, {} process restarts",
            stats.procs, stats.threads_per_proc, stats.process_restarts
        );
    }

    if cli.verbosity() >= Verbosity::Info {
        for report in &stats.processes {
            println!(
                "  {} {}: {} threads (+{} replaced), {} completed, {} failed, {} crashed",
                "pid".if_supports_color(Stdout, |text| text.dimmed()),
                report.pid,
                report.initial_threads,
                report.replacement_threads,
                report.completed,
                report.failed,
                report.crashed
            );
        }
    }
}
