mod descriptor;
mod engine;
mod environment;
mod error;
mod evaluator;
mod lint;
mod loader;
mod renderer;
mod resolver;
mod runner;
mod summary;

use anyhow::Context;
use clap::Parser;
use engine::{ContainerBackend, DockerEngine};
use error::LoadError;
use jote_common::config::{Layout, Timeouts, DEFAULT_MANIFEST};
use runner::{RunOptions, TestRunner};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use summary::Verdict;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs the tests declared in a repository's job definitions.
#[derive(Parser, Debug)]
#[command(name = "jote", version)]
#[command(about = "Job tester - runs the tests declared in job definitions", long_about = None)]
struct Cli {
    /// Manifest file, in the definitions directory
    #[arg(short, long, default_value = DEFAULT_MANIFEST)]
    manifest: String,

    /// Only run tests in this collection
    #[arg(short, long)]
    collection: Option<String>,

    /// Only run tests of this job
    #[arg(short, long, requires = "collection")]
    job: Option<String>,

    /// Only run this test
    #[arg(short, long, requires = "job")]
    test: Option<String>,

    /// Run tests at or below this run-level
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100))]
    run_level: u32,

    /// Validate and render commands without running anything
    #[arg(short, long)]
    dry_run: bool,

    /// Keep every test environment, even for tests that pass
    #[arg(short, long)]
    keep_results: bool,

    /// Show container output for every test
    #[arg(short, long)]
    verbose: bool,

    /// Stop at the first failed test
    #[arg(short = 'x', long)]
    exit_on_failure: bool,

    /// Do not lint job definitions
    #[arg(short, long)]
    skip_lint: bool,

    /// Remove all test material and exit
    #[arg(short, long, conflicts_with = "keep_results")]
    wipe: bool,

    /// Succeed even if no test passed
    #[arg(short, long)]
    allow_no_tests: bool,

    /// Repository root
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Upper bound on one container run, in seconds
    #[arg(long, env = "JOTE_TEST_TIMEOUT", default_value_t = 1800)]
    test_timeout: u64,

    /// Upper bound on container teardown, in seconds
    #[arg(long, env = "JOTE_TEARDOWN_TIMEOUT", default_value_t = 120)]
    teardown_timeout: u64,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            collection: self.collection.clone(),
            job: self.job.clone(),
            test: self.test.clone(),
            run_level: self.run_level,
            dry_run: self.dry_run,
            keep_results: self.keep_results,
            verbose: self.verbose,
            exit_on_failure: self.exit_on_failure,
        }
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts {
            run: Duration::from_secs(self.test_timeout),
            teardown: Duration::from_secs(self.teardown_timeout),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("JOTE_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    // stdout carries the test report
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn report_load_error(error: &LoadError) {
    println!("! {error}");
    for detail in error.details() {
        println!("  {detail}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let layout = Layout::new(std::env::current_dir()?.join(&cli.root));
    info!(root = %layout.root().display(), "jote starting");

    if let Err(e) = loader::check_layout(&layout, cli.skip_lint) {
        report_load_error(&e);
        return Ok(ExitCode::FAILURE);
    }

    if cli.wipe {
        environment::wipe(&layout)
            .with_context(|| format!("Failed to wipe {}", layout.test_root().display()))?;
        println!("Done (wiped)");
        return Ok(ExitCode::SUCCESS);
    }

    let catalog = match loader::load(&layout, &cli.manifest, cli.skip_lint) {
        Ok(catalog) => catalog,
        Err(e) => {
            report_load_error(&e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("# Found {} tests", catalog.test_count);
    if let Some(collection) = &cli.collection {
        println!("+ Limiting to collection \"{collection}\"");
    }
    if let Some(job) = &cli.job {
        println!("+ Limiting to job \"{job}\"");
    }
    if let Some(test) = &cli.test {
        println!("+ Limiting to test \"{test}\"");
    }

    let engine = DockerEngine::connect(cli.timeouts()).context("Failed to connect to Docker")?;
    let backend_version = if cli.dry_run {
        None
    } else {
        let version = engine
            .version()
            .await
            .context("Failed to query the container backend version")?;
        Some(version)
    };

    let runner = TestRunner::new(&engine, &layout, cli.run_options(), backend_version);
    let summary = runner.run(&catalog).await;
    let verdict = summary.verdict(cli.dry_run, cli.allow_no_tests);

    println!();
    match verdict {
        Verdict::Ok => println!("Done (OK) {summary}"),
        Verdict::Failed => println!("Done (FAILURE) {summary}"),
        Verdict::NothingPassed => println!("Done (FAILURE) {summary} (no tests passed)"),
    }

    if summary.failed == 0 && !cli.keep_results {
        if let Err(e) = environment::wipe(&layout) {
            warn!(error = %e, "Failed to wipe test material");
        }
    }

    Ok(if verdict.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
