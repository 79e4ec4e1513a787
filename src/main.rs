//! Pabot - parallel executor for test corpora
//!
//! Splits a test run across parallel worker subprocesses, coordinates
//! them through an in-process TCP service, and merges the per-unit
//! results into one consolidated report.
//!
//! ## Features
//!
//! - Suite- or test-level parallelization with a persisted discovery
//!   cache (`.pabotsuitenames`)
//! - Ordering files with `#WAIT` barriers, `#SLEEP` hints, `#DEPENDS`
//!   edges and `{ ... }` groups sharing one subprocess
//! - Cross-process locks, shared values and leased value sets served
//!   over a documented line-oriented protocol
//! - Per-process timeouts, shard slicing and chunked execution
//!
//! ## Usage
//!
//! ```bash
//! # Run suites in parallel with the default runner
//! pabot tests/
//!
//! # Split at test level on 8 workers, with a resource file
//! pabot --testlevelsplit --processes 8 --resourcefile valueset.dat tests/
//!
//! # Custom runner invocation
//! pabot --command python -m robot --end-command tests/
//! ```

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use clap::error::ErrorKind as ClapErrorKind;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod coordination;
mod discovery;
mod executor;
mod plan;
mod results;

use cli::Settings;
use coordination::{CoordinationServer, DEFAULT_HOST, DEFAULT_LIVENESS};
use executor::{run_plan, RunSummary, WorkerContext};
use results::{copy_artifacts, merge_results, missing_output_units, format_elapsed};

/// Exit code for fatal orchestration errors (plan or spawn failures).
const EXIT_FATAL: i32 = 251;
/// Exit code for runs cut short or with incomplete results.
const EXIT_INCOMPLETE: i32 = 252;

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let code = match run(argv).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
                let _ = clap_err.print();
                match clap_err.kind() {
                    ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                        std::process::exit(0)
                    }
                    _ => std::process::exit(EXIT_FATAL),
                }
            }
            eprintln!("[ ERROR ]: {err:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(argv: Vec<String>) -> Result<i32> {
    let settings = cli::parse_cli(argv)?;
    init_logging(settings.verbose);
    let start = Instant::now();

    if settings.datasources.is_empty() {
        error!("No datasources given. Try --help for usage information.");
        return Ok(EXIT_INCOMPLETE);
    }

    // Per-unit scratch from an earlier invocation would pollute the merge.
    let results_dir = settings.results_dir();
    if results_dir.is_dir() {
        std::fs::remove_dir_all(&results_dir)?;
    }

    let (server, lib_uri) = start_coordination(&settings).await?;

    let outcome = execute(&settings, lib_uri).await;

    if let Some(server) = server {
        server.stop().await;
    }

    let code = match outcome {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            EXIT_FATAL
        }
    };
    info!("Elapsed time:  {}", format_elapsed(start.elapsed()));
    Ok(code)
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    // A second init (tests) is fine to ignore.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn start_coordination(
    settings: &Settings,
) -> Result<(Option<CoordinationServer>, String)> {
    if settings.pabotlib {
        let server = CoordinationServer::start(
            &settings.pabotlibhost,
            settings.pabotlibport,
            settings.resourcefile.as_deref(),
            DEFAULT_LIVENESS,
        )
        .await?;
        let uri = server.uri();
        Ok((Some(server), uri))
    } else if settings.pabotlibhost != DEFAULT_HOST {
        // Externally managed server: advertise it, do not own it.
        Ok((
            None,
            format!("http://{}:{}", settings.pabotlibhost, settings.pabotlibport),
        ))
    } else {
        Ok((None, String::new()))
    }
}

async fn execute(settings: &Settings, lib_uri: String) -> Result<i32> {
    let plan = discovery::resolve_plan(Path::new("."), settings).await?;
    if plan.dispatch_count() == 0 {
        warn!("No tests to execute");
        return Ok(EXIT_INCOMPLETE);
    }

    let budget = settings.worker_budget(plan.dispatch_count());
    let ctx = WorkerContext {
        command: settings.command.clone(),
        runner_args: settings.runner_args.clone(),
        datasources: settings.datasources.clone(),
        results_dir: settings.results_dir(),
        lib_uri,
        processes: budget,
        verbose: settings.verbose,
        timeout: settings.processtimeout,
    };

    let argfiles: Vec<(String, std::path::PathBuf)> = settings.argumentfiles.clone();
    let (summary, fatal) = match run_plan(&plan, ctx, &argfiles, budget).await {
        Ok(summary) => (summary, false),
        Err(spawn) => {
            error!("{spawn}");
            (RunSummary::default(), true)
        }
    };

    for skipped in &summary.skipped {
        warn!(
            "SKIPPED {} (dependency {} did not pass)",
            skipped.name, skipped.blocked_on
        );
    }
    info!("Total testing: {}", format_elapsed(summary.total_testing()));

    if settings.no_rebot {
        info!(
            "All tests were executed, but merging was skipped (--no-rebot); \
             per-unit results remain in {}",
            settings.results_dir().display()
        );
        println!("===================================================");
        return Ok(exit_code(&summary, false, fatal));
    }

    let outputdir = settings.outputdir();
    let copied = copy_artifacts(
        &settings.results_dir(),
        &outputdir,
        &settings.artifacts,
        settings.artifactsinsubfolders,
    )?;

    let argfile_indexes: Vec<String> =
        argfiles.iter().map(|(index, _)| index.clone()).collect();
    let merge = merge_results(
        &settings.results_dir(),
        &outputdir,
        &plan.root_name(),
        &argfile_indexes,
        &copied,
    )?;

    let missing = missing_output_units(&settings.results_dir());
    if !missing.is_empty() {
        warn!(
            "One or more subprocesses produced no result document; the \
             consolidated output does not contain all test cases. Check:"
        );
        for path in &missing {
            warn!("  {}", path.display());
        }
    }

    println!("{}", merge.stats);
    println!("===================================================");
    Ok(exit_code(&summary, merge.incomplete || !missing.is_empty(), fatal))
}

fn exit_code(summary: &RunSummary, incomplete: bool, fatal: bool) -> i32 {
    if fatal {
        return EXIT_FATAL;
    }
    if summary.aborted || incomplete {
        return EXIT_INCOMPLETE;
    }
    summary.failed_count().min(250) as i32
}
