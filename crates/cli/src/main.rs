//! `logwarden`: ingest IIS access logs and export security reports.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use logwarden_core::catalog::{CatalogQuery, TimeWindow};
use logwarden_core::store::LogStore;
use logwarden_core::types::Timestamp;
use logwarden_core::variant::FormatVariant;
use logwarden_pipeline::report::export_runs;
use logwarden_pipeline::{
    execute_all, CatalogRun, CsvReportSink, IngestError, IngestionPipeline, MemoryLogStore,
    RunSummary, VariantSelector,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::AppConfig;

const DEFAULT_LOG_FILTER: &str = "logwarden=info,logwarden_pipeline=info,logwarden_db=info";

const EXIT_FAILURE: u8 = 1;
const EXIT_SOURCE_UNAVAILABLE: u8 = 2;
const EXIT_SOURCE_TIMEOUT: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "logwarden")]
#[command(about = "Ingest IIS access logs and export security reports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Records per persistence batch (overrides LOGWARDEN_BATCH_SIZE)
    #[arg(long, global = true)]
    batch_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one access-log file
    Ingest(IngestArgs),
    /// Run catalog queries and export the results
    Report(ReportArgs),
    /// Ingest a file, then export every catalog query
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Access-log file to read
    file: PathBuf,

    /// Format variant: byte-metrics, timing-metrics, or auto
    #[arg(long)]
    variant: VariantSelector,

    /// Parse and deduplicate in memory without touching the database
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Format variant whose table is queried
    #[arg(long)]
    variant: FormatVariant,

    /// Queries to run (default: all). Accepts short or export names.
    #[arg(long = "query")]
    queries: Vec<CatalogQuery>,

    /// Window start, RFC 3339 (default: the Unix epoch when only --to is given)
    #[arg(long)]
    from: Option<Timestamp>,

    /// Window end, RFC 3339 (default: open-ended)
    #[arg(long)]
    to: Option<Timestamp>,

    /// Output directory (overrides LOGWARDEN_REPORT_DIR)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Access-log file to read
    file: PathBuf,

    /// Format variant: byte-metrics, timing-metrics, or auto
    #[arg(long)]
    variant: VariantSelector,

    /// Output directory (overrides LOGWARDEN_REPORT_DIR)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Use an in-memory store for this run only
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(error = %message, "logwarden failed");
            eprintln!("Error: {message}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Logs go to stderr; stdout carries the JSON summaries.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size.max(1);
    }

    match cli.command {
        Command::Ingest(args) => {
            let store = open_store(&config, args.dry_run).await?;
            let summary = ingest(&config, store.as_ref(), &args.file, args.variant).await;
            report_ingest(summary)
        }
        Command::Report(args) => {
            if let Some(out) = args.out {
                config.report_dir = out;
            }
            let window = match (args.from, args.to) {
                (None, None) => None,
                (Some(from), None) => Some(TimeWindow::since(from)),
                (from, Some(to)) => Some(TimeWindow::new(from.unwrap_or(Timestamp::UNIX_EPOCH), to)?),
            };
            let queries = if args.queries.is_empty() {
                CatalogQuery::ALL.to_vec()
            } else {
                args.queries
            };
            let store = open_store(&config, false).await?;
            report(&config, store.as_ref(), args.variant, &queries, window).await
        }
        Command::Run(args) => {
            if let Some(out) = args.out {
                config.report_dir = out;
            }
            let store = open_store(&config, args.dry_run).await?;
            let summary = ingest(&config, store.as_ref(), &args.file, args.variant).await;
            let variant = summary.as_ref().ok().and_then(|s| s.variant);
            let ingest_code = report_ingest(summary)?;
            let Some(variant) = variant else {
                tracing::warn!("No variant known for this run, skipping reports");
                return Ok(ingest_code);
            };
            let report_code = report(&config, store.as_ref(), variant, &CatalogQuery::ALL, None).await?;
            Ok(ingest_code.max(report_code))
        }
    }
}

/// Connect to PostgreSQL, or build an in-memory store for dry runs.
async fn open_store(config: &AppConfig, dry_run: bool) -> Result<Arc<dyn LogStore>> {
    if dry_run {
        tracing::info!("Dry run: using an in-memory store");
        return Ok(Arc::new(MemoryLogStore::new()));
    }

    let database_url = config.database_url()?;
    let pool = logwarden_db::create_pool(database_url, config.db_max_connections, config.store_timeout())
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    logwarden_db::health_check(&pool)
        .await
        .context("Database health check failed")?;

    logwarden_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(Arc::new(logwarden_db::PgLogStore::new(pool)))
}

async fn ingest(
    config: &AppConfig,
    store: &dyn LogStore,
    file: &std::path::Path,
    selector: VariantSelector,
) -> Result<RunSummary, IngestError> {
    if selector == VariantSelector::Detect {
        tracing::warn!("No explicit variant given, detecting from token count");
    }
    IngestionPipeline::new(store, config.ingest_options())
        .run(file, selector)
        .await
}

/// Print the run summary and pick the exit code.
fn report_ingest(summary: Result<RunSummary, IngestError>) -> Result<u8> {
    let code = ingest_exit_code(&summary);
    match summary {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Err(e) => {
            tracing::error!(error = %e, "Ingestion failed");
            eprintln!("Error: {e}");
        }
    }
    Ok(code)
}

fn ingest_exit_code(summary: &Result<RunSummary, IngestError>) -> u8 {
    match summary {
        Ok(summary) if summary.interrupted => EXIT_SOURCE_TIMEOUT,
        Ok(_) => 0,
        Err(IngestError::SourceUnavailable { .. }) => EXIT_SOURCE_UNAVAILABLE,
        Err(IngestError::Timeout { .. }) => EXIT_SOURCE_TIMEOUT,
    }
}

async fn report(
    config: &AppConfig,
    store: &dyn LogStore,
    variant: FormatVariant,
    queries: &[CatalogQuery],
    window: Option<TimeWindow>,
) -> Result<u8> {
    let runs = execute_all(store, variant, queries, window, config.query_timeout()).await;
    let sink = CsvReportSink::new(&config.report_dir);
    let export_failures = export_runs(&sink, &runs);

    let listing: Vec<serde_json::Value> = runs.iter().map(run_listing).collect();
    println!("{}", serde_json::to_string_pretty(&listing)?);

    let query_failures = runs.iter().filter(|r| !r.is_ok()).count();
    Ok(if query_failures + export_failures > 0 {
        EXIT_FAILURE
    } else {
        0
    })
}

fn run_listing(run: &CatalogRun) -> serde_json::Value {
    serde_json::json!({
        "name": run.name(),
        "variant": run.result.variant,
        "rows": run.result.len(),
        "error": run.error.as_ref().map(ToString::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use logwarden_pipeline::IngestOptions;

    #[test]
    fn cli_parses_ingest_with_variant() {
        let cli = Cli::try_parse_from(["logwarden", "ingest", "access.log", "--variant", "auto", "--dry-run"])
            .unwrap();
        match cli.command {
            Command::Ingest(args) => {
                assert_eq!(args.variant, VariantSelector::Detect);
                assert!(args.dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_requires_a_variant() {
        assert!(Cli::try_parse_from(["logwarden", "ingest", "access.log"]).is_err());
    }

    #[test]
    fn cli_parses_report_queries_and_window() {
        let cli = Cli::try_parse_from([
            "logwarden",
            "report",
            "--variant",
            "timing-metrics",
            "--query",
            "failed-logins",
            "--query",
            "analyze_ddos",
            "--from",
            "2024-01-15T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Command::Report(args) => {
                assert_eq!(args.variant, FormatVariant::TimingMetrics);
                assert_eq!(
                    args.queries,
                    vec![CatalogQuery::FailedLogins, CatalogQuery::VolumetricAnomaly]
                );
                assert!(args.from.is_some() && args.to.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_source_exits_with_two() {
        let store = MemoryLogStore::new();
        let summary = IngestionPipeline::new(&store, IngestOptions::default())
            .run(std::path::Path::new("/definitely/not/here.log"), VariantSelector::Detect)
            .await;
        assert_eq!(ingest_exit_code(&summary), EXIT_SOURCE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn rejected_lines_still_exit_zero() {
        let store = MemoryLogStore::new();
        let summary = IngestionPipeline::new(&store, IngestOptions::default())
            .run_reader(
                "inline",
                b"not a log line\n#comment\n".as_slice(),
                VariantSelector::Explicit(FormatVariant::ByteMetrics),
            )
            .await;
        assert_eq!(summary.rejected, 1);
        assert_eq!(ingest_exit_code(&Ok(summary)), 0);
    }
}
