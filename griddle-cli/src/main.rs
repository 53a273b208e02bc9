//! The griddle command-line interface.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, bail};
use griddle_runner::{
    config::GriddleConfig,
    errors::BootstrapError,
    reporter::{write_junit, write_summary},
    runner::{RunnerEvent, TestRunnerBuilder, create_base_snapshot},
    spec::{discover_specs, filter_specs},
    vm::Arch,
};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs kernel test programs inside QEMU and reports the verdicts.
#[derive(Debug, Parser)]
#[command(name = "griddle", version)]
struct Args {
    /// Path to the harness config file.
    #[arg(long, default_value = "griddle.toml")]
    config: Utf8PathBuf,

    /// Directory containing the test program sources.
    #[arg(long, default_value = "userspace/tests")]
    tests_dir: Utf8PathBuf,

    /// Guest architecture.
    #[arg(long, default_value = "x86_64")]
    arch: Arch,

    /// Only consider test sources whose file stem starts with this prefix.
    #[arg(short = 'g', long, default_value = "test_")]
    prefix: String,

    /// Only run tests in these categories.
    #[arg(short = 'c', long = "category", value_name = "CATEGORY")]
    categories: Vec<String>,

    /// Only run tests carrying these tags.
    #[arg(short = 't', long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Run every selected test this many times.
    #[arg(short = 'r', long, default_value_t = 1)]
    repeat: usize,

    /// Number of test runs to keep in flight at once, overriding the config.
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Cap on attempts per run, overriding the config.
    #[arg(long)]
    max_attempts: Option<usize>,

    /// Where to write the markdown summary.
    #[arg(long, default_value = "griddle_summary.md")]
    summary: Utf8PathBuf,

    /// Also write a JUnit XML report to this path.
    #[arg(long)]
    junit: Option<Utf8PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = GriddleConfig::from_path(&args.config)?;
    let specs = discover_specs(&args.tests_dir, &args.prefix)?;
    let specs = filter_specs(specs, &args.categories, &args.tags);
    if specs.is_empty() {
        bail!(
            "no tests selected under `{}` with prefix `{}`",
            args.tests_dir,
            args.prefix
        );
    }
    info!("selected {} test(s)", specs.len());

    let snapshot = match create_base_snapshot(&config, args.arch).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            if let BootstrapError::BootSignal { log, .. } = &error {
                eprintln!("--- captured console log ---");
                eprintln!("{log}");
            }
            return Err(error).wrap_err("bootstrap failed, no tests were run");
        }
    };

    let mut builder = TestRunnerBuilder::default();
    if let Some(jobs) = args.jobs {
        builder.set_jobs(jobs);
    }
    if let Some(max_attempts) = args.max_attempts {
        builder.set_max_attempts(max_attempts);
    }
    let runner = builder.build(&config, args.arch, specs, args.repeat, snapshot);

    let report = runner
        .execute(|event| match event {
            RunnerEvent::RunStarted { total_runs } => {
                info!("starting {total_runs} test run(s)");
            }
            RunnerEvent::TestStarted { id } => info!("  START {id}"),
            RunnerEvent::TestAttemptRetried { id, attempt, errors } => {
                warn!("  RETRY {id} (attempt {attempt}): {}", errors.join("; "));
            }
            RunnerEvent::TestFinished { id, status, runtime } => {
                info!("{status:>7} {id} [{runtime:.2?}]");
            }
            RunnerEvent::RunFinished { stats } => {
                info!(
                    "done: {} passed, {} failed, {} panicked, {} timed out, \
                     {} disabled, {} attempts retried",
                    stats.passed,
                    stats.failed,
                    stats.panicked,
                    stats.timed_out,
                    stats.disabled,
                    stats.retried_attempts,
                );
            }
        })
        .await;

    write_summary(&report, &args.summary)?;
    info!("summary written to {}", args.summary);
    if let Some(junit) = &args.junit {
        write_junit(&report, junit)?;
        info!("junit report written to {junit}");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
