use anyhow::{ensure, Context};
use async_trait::async_trait;

use crate::domain::prices::TradingDayPrices;

const DEFAULT_UPSERT_BATCH: usize = 500;

// Upserts must be idempotent; overlapping requests and retried batches
// rewrite the same rows.
#[async_trait]
pub trait PriceSink: Send + Sync {
    async fn store_daily_prices(&self, prices: &[TradingDayPrices]) -> anyhow::Result<u64>;
}

pub struct PgPriceSink {
    pool: sqlx::PgPool,
}

impl PgPriceSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    fn upsert_batch_size() -> usize {
        std::env::var("DAILY_PRICES_UPSERT_BATCH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_UPSERT_BATCH)
    }
}

#[async_trait]
impl PriceSink for PgPriceSink {
    async fn store_daily_prices(&self, prices: &[TradingDayPrices]) -> anyhow::Result<u64> {
        ensure!(!prices.is_empty(), "prices must not be empty");

        let batch_size = Self::upsert_batch_size();
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        let mut affected: u64 = 0;

        for chunk in prices.chunks(batch_size) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO daily_prices \
                 (dataset, ticker, price_date, open, high, low, close, volume) ",
            );
            builder.push_values(chunk, |mut row, day| {
                row.push_bind(&day.dataset)
                    .push_bind(&day.ticker)
                    .push_bind(day.date)
                    .push_bind(day.open)
                    .push_bind(day.high)
                    .push_bind(day.low)
                    .push_bind(day.close)
                    .push_bind(day.volume);
            });
            builder.push(
                " ON CONFLICT (dataset, ticker, price_date) DO UPDATE SET \
                 open = EXCLUDED.open, \
                 high = EXCLUDED.high, \
                 low = EXCLUDED.low, \
                 close = EXCLUDED.close, \
                 volume = EXCLUDED.volume",
            );

            let result = builder
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("upserting daily prices batch failed")?;
            affected += result.rows_affected();
            tracing::debug!(
                batch = chunk.len(),
                affected = result.rows_affected(),
                "daily prices batch upserted"
            );
        }

        tx.commit().await.context("commit failed")?;
        Ok(affected)
    }
}
