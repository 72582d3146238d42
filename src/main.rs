//! dupescan CLI entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use dupescan::cli::{Cli, Commands, LoadArgs, ScanArgs};
use dupescan::duplicates::{DuplicateFinder, ScanCompletion};
use dupescan::error::ExitCode;
use dupescan::output::{load_results, ExportDocument};
use dupescan::progress::ConsoleProgress;
use dupescan::store::{SessionStatus, Store};
use dupescan::{logging, signal};

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose, cli.quiet);

    let exit_code = match cli.command {
        Commands::Scan(ref args) => handle_scan(&cli, args.as_ref())?,
        Commands::Load(ref args) => handle_load(args)?,
    };

    std::process::exit(exit_code.as_i32());
}

fn handle_scan(cli: &Cli, args: &ScanArgs) -> Result<ExitCode> {
    let handler = signal::install_handler().context("Failed to install signal handler")?;

    let store = match &cli.db_path {
        Some(path) => Store::open(path),
        None => Store::open_default(),
    }
    .context("Failed to open the scan database")?;

    let config = args.to_config();
    let progress = Arc::new(ConsoleProgress::new(cli.quiet));

    let finder = DuplicateFinder::new(config, Arc::clone(&store))
        .context("Invalid scan configuration")?
        .with_cancel_flag(handler.flag())
        .with_observer(Arc::clone(&progress) as Arc<dyn dupescan::progress::ScanObserver>);

    let completion = finder.run();
    progress.finish();

    let code = match completion {
        ScanCompletion::Finished(report) => {
            if let Some(output_path) = &args.output_json {
                ExportDocument::from_report(&report)
                    .write_to(output_path)
                    .with_context(|| format!("Failed to write {}", output_path.display()))?;
                log::info!("Results written to {}", output_path.display());
            }

            let groups = report.results.len();
            let files: usize = report.results.values().map(Vec::len).sum();
            log::info!(
                "Scan {}: {} groups, {} files, {} errors",
                report.status,
                groups,
                files,
                report.metrics.errors_total
            );
            if let Some(stats) = &report.incremental {
                log::info!(
                    "Incremental vs session {}: {} new, {} changed, {} revalidated, {} missing",
                    stats.baseline_session,
                    stats.new,
                    stats.changed,
                    stats.revalidated,
                    stats.missing
                );
            }

            if report.status == SessionStatus::Partial {
                ExitCode::PartialSuccess
            } else if groups == 0 {
                ExitCode::NoDuplicates
            } else {
                ExitCode::Success
            }
        }
        ScanCompletion::Cancelled { session, stage } => {
            log::info!("Scan cancelled; session {session} paused at stage {stage}");
            ExitCode::Interrupted
        }
        ScanCompletion::Failed { session, error } => {
            log::error!("Scan failed: {error}");
            if let Some(session) = session {
                log::error!("Session {session} marked failed");
            }
            ExitCode::GeneralError
        }
    };

    store.close_all();
    Ok(code)
}

fn handle_load(args: &LoadArgs) -> Result<ExitCode> {
    let payload = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let loaded = load_results(&payload).context("Failed to parse results")?;

    let groups = loaded.results.len();
    let files: usize = loaded.results.values().map(Vec::len).sum();
    match &loaded.meta {
        Some(meta) => println!(
            "{} groups, {} files (status: {}, session {})",
            groups, files, meta.scan_status, meta.session_id
        ),
        None => println!("{groups} groups, {files} files (legacy document)"),
    }

    for (key, members) in &loaded.results {
        println!("{key}");
        for member in members {
            println!("    {member}");
        }
    }

    Ok(if groups == 0 {
        ExitCode::NoDuplicates
    } else {
        ExitCode::Success
    })
}
