use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eodfill_core::ingest::error::RetrievalError;
use eodfill_core::ingest::provider::HttpJsonPriceProvider;
use eodfill_core::ingest::retriever::PriceRetriever;
use eodfill_core::ingest::FetchLimits;
use eodfill_core::plan::{merger, slicer};
use eodfill_core::storage::fetch_runs::{record_fetch_run, FetchRun};
use eodfill_core::storage::lock;
use eodfill_core::storage::pending_requests::PgPendingRequestStore;
use eodfill_core::storage::prices::PgPriceSink;
use eodfill_core::storage::retrieved_months::PgRetrievedMonthStore;

mod tickers;

#[derive(Debug, Parser)]
#[command(name = "eodfill_worker")]
struct Args {
    /// Provider dataset code, e.g. WIKI.
    #[arg(long)]
    dataset: String,

    /// Tickers to backfill. Repeat the flag or separate with commas.
    #[arg(long = "ticker", value_delimiter = ',', required = true)]
    tickers: Vec<String>,

    /// First day to fetch, inclusive (YYYY-MM-DD).
    #[arg(long)]
    from: String,

    /// Day after the last day to fetch (YYYY-MM-DD).
    #[arg(long)]
    to: String,

    /// Plan the provider requests and exit without touching the database.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = eodfill_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let dataset = args.dataset.trim().to_string();
    anyhow::ensure!(!dataset.is_empty(), "--dataset must not be empty");
    let start = parse_date(&args.from)?;
    let end = parse_date(&args.to)?;
    anyhow::ensure!(start < end, "--from {start} must be before --to {end}");
    let requested = tickers::requested(&args.tickers)?;
    let limits = FetchLimits::from_env();

    if args.dry_run {
        for ticker in &requested {
            let sliced = slicer::slice(&dataset, ticker, start, end)?;
            let planned = merger::merge(sliced, limits.merge_span());
            for request in &planned {
                tracing::info!(request = %request, dry_run = true, "would fetch");
            }
            tracing::info!(
                ticker = %ticker,
                planned = planned.len(),
                dry_run = true,
                "planned provider requests without consulting the cache"
            );
        }
        return Ok(());
    }

    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    eodfill_core::storage::migrate(&pool).await?;

    let provider = Arc::new(HttpJsonPriceProvider::from_settings(&settings)?);
    let pending = Arc::new(PgPendingRequestStore::new(pool.clone()));
    let months = Arc::new(PgRetrievedMonthStore::new(pool.clone()));
    let sink = Arc::new(PgPriceSink::new(pool.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("shutdown signal received; interrupting current batch");
            let _ = shutdown_tx.send(true);
        }
    });

    let retriever =
        PriceRetriever::new(provider, pending, months, sink, limits).with_shutdown(shutdown_rx);

    let mut failed: Vec<String> = Vec::new();
    for ticker in &requested {
        let acquired = lock::try_acquire_series_lock(&pool, &dataset, ticker).await?;
        if !acquired {
            tracing::warn!(
                ticker = %ticker,
                "series lock not acquired; another backfill in progress"
            );
            failed.push(ticker.clone());
            continue;
        }

        let started_at = chrono::Utc::now();
        let result = retriever.get(&dataset, ticker, start, end).await;
        match &result {
            Ok(report) => {
                let raw = serde_json::to_value(report).ok();
                let run_id = record_fetch_run(
                    &pool,
                    FetchRun {
                        dataset: &dataset,
                        ticker,
                        start,
                        end,
                        started_at,
                        status: "success",
                        error: None,
                        report: raw,
                    },
                )
                .await?;
                tracing::info!(
                    ticker = %ticker,
                    %run_id,
                    fetched = report.fetched_requests,
                    rows = report.rows_stored,
                    months_recorded = report.months_recorded,
                    "backfill finished"
                );
            }
            Err(err) => {
                sentry_anyhow::capture_anyhow(err);
                // Best effort; the retrieval error must not be masked by a
                // failing audit write.
                let detail = format!("{err:#}");
                let audit = record_fetch_run(
                    &pool,
                    FetchRun {
                        dataset: &dataset,
                        ticker,
                        start,
                        end,
                        started_at,
                        status: "error",
                        error: Some(&detail),
                        report: None,
                    },
                )
                .await;
                if let Err(audit_err) = audit {
                    tracing::warn!(ticker = %ticker, error = %audit_err, "failed to record fetch run");
                }
                tracing::error!(ticker = %ticker, error = %err, "backfill failed");
                failed.push(ticker.clone());
            }
        }

        let _ = lock::release_series_lock(&pool, &dataset, ticker).await;

        if let Err(err) = &result {
            let interrupted = matches!(
                err.downcast_ref::<RetrievalError>(),
                Some(RetrievalError::Interrupted { .. })
            );
            if interrupted {
                tracing::warn!("stopping before remaining tickers");
                break;
            }
        }
    }

    anyhow::ensure!(
        failed.is_empty(),
        "backfill failed for {} of {} tickers: {}",
        failed.len(),
        requested.len(),
        failed.join(", ")
    );
    Ok(())
}

fn init_sentry(settings: &eodfill_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

fn parse_date(value: &str) -> anyhow::Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date {value:?}; expected YYYY-MM-DD"))
}
