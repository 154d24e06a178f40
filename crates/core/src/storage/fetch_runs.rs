use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

// One audit row per finished backfill run. Failures here must not mask the
// run's own outcome; callers log and move on.
pub struct FetchRun<'a> {
    pub dataset: &'a str,
    pub ticker: &'a str,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub status: &'a str,
    pub error: Option<&'a str>,
    pub report: Option<serde_json::Value>,
}

pub async fn record_fetch_run(pool: &sqlx::PgPool, run: FetchRun<'_>) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO price_fetch_runs \
         (id, dataset, ticker, start_date, end_date, started_at, finished_at, status, error, report) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .persistent(false)
    .bind(id)
    .bind(run.dataset)
    .bind(run.ticker)
    .bind(run.start)
    .bind(run.end)
    .bind(run.started_at)
    .bind(Utc::now())
    .bind(run.status)
    .bind(run.error)
    .bind(run.report)
    .execute(pool)
    .await
    .context("recording fetch run failed")?;
    Ok(id)
}
