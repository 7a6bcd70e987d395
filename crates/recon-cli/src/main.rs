use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use recon_core::ReconciliationReport;
use recon_storage::PgRecordStore;
use recon_sync::{
    report_recent_markdown, resolve_import_window, ReconcileConfig, ReconcileError, ReconcilePipeline,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Find and retire duplicate task records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Reconcile(ReconcileArgs),
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Apply the tasks table migration to DATABASE_URL.
    Migrate,
    /// Reconcile on RECON_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Args, Default)]
struct ReconcileArgs {
    /// Compute decisions without archiving anything.
    #[arg(long)]
    dry_run: bool,
    /// Start of the authoritative import window (RFC 3339 or YYYY-MM-DD).
    #[arg(long, requires = "window_end")]
    window_start: Option<String>,
    /// End (exclusive) of the authoritative import window.
    #[arg(long, requires = "window_start")]
    window_end: Option<String>,
    /// Maximum archive requests in flight.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Skip writing reports/<run_id>/.
    #[arg(long)]
    no_write_report: bool,
}

const EXIT_SOURCE_UNAVAILABLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.downcast_ref::<ReconcileError>().is_some() {
                ExitCode::from(EXIT_SOURCE_UNAVAILABLE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Reconcile(ReconcileArgs::default())) {
        Commands::Reconcile(args) => reconcile(args).await,
        Commands::Report { runs } => {
            let config = ReconcileConfig::load()?;
            println!("{}", report_recent_markdown(runs, &config.reports_root())?);
            Ok(())
        }
        Commands::Migrate => {
            let config = ReconcileConfig::load()?;
            let store = PgRecordStore::connect(&config.database_url, config.page_size)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Schedule => schedule().await,
    }
}

async fn reconcile(args: ReconcileArgs) -> Result<()> {
    let config = ReconcileConfig::load()?;
    let mut options = config.options()?;
    if args.window_start.is_some() {
        options.import_window =
            resolve_import_window(args.window_start.as_deref(), args.window_end.as_deref())?;
    }
    options.dry_run = args.dry_run;
    if let Some(concurrency) = args.concurrency {
        options.archive_concurrency = concurrency.max(1);
    }

    let pipeline = ReconcilePipeline::new(config).await?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight archive calls");
            on_interrupt.cancel();
        }
    });

    let summary = pipeline.run_once(&options, &cancel, !args.no_write_report).await?;
    print_report(&summary.report);
    if let Some(dir) = summary.report_dir {
        println!("report: {}", dir.display());
    }
    Ok(())
}

fn print_report(report: &ReconciliationReport) {
    println!(
        "reconcile complete: run_id={} outcome=\"{}\" scanned={} groups={} retired={} failed={}",
        report.run_id,
        report.outcome(),
        report.total_records_scanned,
        report.groups_with_duplicates,
        report.records_retired,
        report.records_failed
    );
    for decision in &report.decisions {
        println!(
            "  {}: keep {} retire [{}] ({})",
            decision.key,
            decision.survivor_id,
            decision.retire_ids.join(", "),
            decision.decided_by
        );
    }
    for failure in &report.failures {
        println!("  failed {}: {}", failure.record_id, failure.reason);
    }
    for candidate in &report.review_candidates {
        println!(
            "  review {:.3}: \"{}\" / \"{}\"",
            candidate.confidence_score, candidate.key_a.normalized_title, candidate.key_b.normalized_title
        );
    }
}

async fn schedule() -> Result<()> {
    let mut config = ReconcileConfig::load()?;
    config.scheduler_enabled = true;
    let cron = config.reconcile_cron.clone();

    let pipeline = Arc::new(ReconcilePipeline::new(config).await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
