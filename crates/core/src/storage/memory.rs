use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::domain::prices::TradingDayPrices;
use crate::domain::request::{RetrievalRequest, RetrievedMonth};
use crate::storage::pending_requests::PendingRequestStore;
use crate::storage::prices::PriceSink;
use crate::storage::retrieved_months::RetrievedMonthStore;

// In-memory counterparts of the Postgres stores so tests can run the whole
// pipeline without a database. Semantics mirror the SQL versions; duplicate
// inserts are ignored and deletes match whole rows.
#[derive(Default)]
pub struct MemoryPendingRequestStore {
    rows: Mutex<Vec<RetrievalRequest>>,
}

impl MemoryPendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<RetrievalRequest> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl PendingRequestStore for MemoryPendingRequestStore {
    async fn create(&self, requests: &[RetrievalRequest]) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().await;
        for request in requests {
            if !rows.contains(request) {
                rows.push(request.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, request: &RetrievalRequest) -> anyhow::Result<()> {
        self.rows.lock().await.retain(|row| row != request);
        Ok(())
    }

    async fn requests(
        &self,
        dataset: &str,
        ticker: &str,
    ) -> anyhow::Result<Vec<RetrievalRequest>> {
        let mut rows: Vec<RetrievalRequest> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.dataset == dataset && row.ticker == ticker)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.start, row.end));
        Ok(rows)
    }
}

#[derive(Default)]
pub struct MemoryRetrievedMonthStore {
    rows: Mutex<HashSet<RetrievedMonth>>,
    get_calls: AtomicUsize,
}

impl MemoryRetrievedMonthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, months: &[RetrievedMonth]) {
        self.rows.lock().await.extend(months.iter().cloned());
    }

    pub async fn snapshot(&self) -> HashSet<RetrievedMonth> {
        self.rows.lock().await.clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetrievedMonthStore for MemoryRetrievedMonthStore {
    async fn get(
        &self,
        ticker: &str,
        from_year: i32,
        to_year: i32,
    ) -> anyhow::Result<HashSet<RetrievedMonth>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|m| m.ticker == ticker && m.year >= from_year && m.year <= to_year)
            .cloned()
            .collect())
    }

    async fn create(&self, months: &[RetrievedMonth]) -> anyhow::Result<()> {
        self.rows.lock().await.extend(months.iter().cloned());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPriceSink {
    rows: Mutex<Vec<TradingDayPrices>>,
}

impl MemoryPriceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<TradingDayPrices> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl PriceSink for MemoryPriceSink {
    async fn store_daily_prices(&self, prices: &[TradingDayPrices]) -> anyhow::Result<u64> {
        let mut rows = self.rows.lock().await;
        for day in prices {
            // same upsert key as the SQL sink
            rows.retain(|row| {
                !(row.dataset == day.dataset && row.ticker == day.ticker && row.date == day.date)
            });
            rows.push(day.clone());
        }
        Ok(prices.len() as u64)
    }
}
