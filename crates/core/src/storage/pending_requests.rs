use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::request::RetrievalRequest;

// Rows are written before a batch runs and deleted as each request is
// stored, so whatever survives a crash is exactly the lost work.
#[async_trait]
pub trait PendingRequestStore: Send + Sync {
    async fn create(&self, requests: &[RetrievalRequest]) -> anyhow::Result<()>;
    async fn delete(&self, request: &RetrievalRequest) -> anyhow::Result<()>;
    async fn requests(&self, dataset: &str, ticker: &str)
        -> anyhow::Result<Vec<RetrievalRequest>>;
}

pub struct PgPendingRequestStore {
    pool: sqlx::PgPool,
}

impl PgPendingRequestStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PendingRequestStore for PgPendingRequestStore {
    async fn create(&self, requests: &[RetrievalRequest]) -> anyhow::Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO pending_requests (dataset, ticker, start_date, end_date) ",
        );
        builder.push_values(requests, |mut row, request| {
            row.push_bind(&request.dataset)
                .push_bind(&request.ticker)
                .push_bind(request.start)
                .push_bind(request.end);
        });
        // re-lodging the same range after a crash must not fail
        builder.push(" ON CONFLICT (dataset, ticker, start_date, end_date) DO NOTHING");
        builder
            .build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .context("lodging pending requests failed")?;
        Ok(())
    }

    async fn delete(&self, request: &RetrievalRequest) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM pending_requests \
             WHERE dataset = $1 AND ticker = $2 AND start_date = $3 AND end_date = $4",
        )
        .persistent(false)
        .bind(&request.dataset)
        .bind(&request.ticker)
        .bind(request.start)
        .bind(request.end)
        .execute(&self.pool)
        .await
        .with_context(|| format!("deleting pending request {request} failed"))?;
        Ok(())
    }

    async fn requests(
        &self,
        dataset: &str,
        ticker: &str,
    ) -> anyhow::Result<Vec<RetrievalRequest>> {
        let rows = sqlx::query_as::<_, (String, String, NaiveDate, NaiveDate)>(
            "SELECT dataset, ticker, start_date, end_date FROM pending_requests \
             WHERE dataset = $1 AND ticker = $2 \
             ORDER BY start_date ASC, end_date ASC",
        )
        .persistent(false)
        .bind(dataset)
        .bind(ticker)
        .fetch_all(&self.pool)
        .await
        .context("loading pending requests failed")?;

        rows.into_iter()
            .map(|(dataset, ticker, start, end)| {
                RetrievalRequest::try_new(&dataset, &ticker, start, end)
            })
            .collect()
    }
}
