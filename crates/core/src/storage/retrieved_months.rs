use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashSet;

use crate::domain::request::RetrievedMonth;

// Append-only cache index; a recorded month promises its trading days are
// fully stored.
#[async_trait]
pub trait RetrievedMonthStore: Send + Sync {
    async fn get(
        &self,
        ticker: &str,
        from_year: i32,
        to_year: i32,
    ) -> anyhow::Result<HashSet<RetrievedMonth>>;
    async fn create(&self, months: &[RetrievedMonth]) -> anyhow::Result<()>;
}

pub struct PgRetrievedMonthStore {
    pool: sqlx::PgPool,
}

impl PgRetrievedMonthStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetrievedMonthStore for PgRetrievedMonthStore {
    async fn get(
        &self,
        ticker: &str,
        from_year: i32,
        to_year: i32,
    ) -> anyhow::Result<HashSet<RetrievedMonth>> {
        let rows = sqlx::query_as::<_, (i32, i32)>(
            "SELECT year, month FROM retrieved_months \
             WHERE ticker = $1 AND year BETWEEN $2 AND $3",
        )
        .persistent(false)
        .bind(ticker)
        .bind(from_year)
        .bind(to_year)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading retrieved months for {ticker} failed"))?;

        rows.into_iter()
            .map(|(year, month)| {
                let month = u32::try_from(month)
                    .with_context(|| format!("negative month {month} stored for {ticker}"))?;
                RetrievedMonth::try_new(ticker, year, month)
            })
            .collect()
    }

    async fn create(&self, months: &[RetrievedMonth]) -> anyhow::Result<()> {
        if months.is_empty() {
            return Ok(());
        }
        let mut builder =
            sqlx::QueryBuilder::new("INSERT INTO retrieved_months (ticker, year, month) ");
        builder.push_values(months, |mut row, month| {
            row.push_bind(&month.ticker)
                .push_bind(month.year)
                .push_bind(month.month as i32);
        });
        builder.push(" ON CONFLICT (ticker, year, month) DO NOTHING");
        builder
            .build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .context("recording retrieved months failed")?;
        Ok(())
    }
}
