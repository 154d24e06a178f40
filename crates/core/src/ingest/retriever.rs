use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::ingest::executor::ConcurrentExecutor;
use crate::ingest::provider::PriceProviderClient;
use crate::ingest::FetchLimits;
use crate::plan::filter::UnnecessaryRequestFilter;
use crate::plan::merger;
use crate::plan::recorder::RetrievedMonthRecorder;
use crate::plan::slicer;
use crate::storage::pending_requests::PendingRequestStore;
use crate::storage::prices::PriceSink;
use crate::storage::retrieved_months::RetrievedMonthStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalReport {
    pub sliced: usize,
    pub skipped_cached: usize,
    pub planned: usize,
    pub fetched_requests: usize,
    pub rows_stored: u64,
    pub months_recorded: usize,
}

// Slices the range into months, drops what the cache already holds, merges
// the rest, drains them through the executor and records the months now
// fully stored. Repeating a get over any overlap converges on zero calls.
pub struct PriceRetriever {
    provider: Arc<dyn PriceProviderClient>,
    pending: Arc<dyn PendingRequestStore>,
    sink: Arc<dyn PriceSink>,
    filter: UnnecessaryRequestFilter,
    recorder: RetrievedMonthRecorder,
    limits: FetchLimits,
    shutdown: watch::Receiver<bool>,
}

impl PriceRetriever {
    pub fn new(
        provider: Arc<dyn PriceProviderClient>,
        pending: Arc<dyn PendingRequestStore>,
        months: Arc<dyn RetrievedMonthStore>,
        sink: Arc<dyn PriceSink>,
        limits: FetchLimits,
    ) -> Self {
        // Without an external signal wired in, shutdown simply never fires.
        let (_tx, shutdown) = watch::channel(false);
        Self {
            provider,
            pending,
            sink,
            filter: UnnecessaryRequestFilter::new(Arc::clone(&months)),
            recorder: RetrievedMonthRecorder::new(months),
            limits,
            shutdown,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn get(
        &self,
        dataset: &str,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<RetrievalReport> {
        let sliced = slicer::slice(dataset, ticker, start, end)?;
        let needed = self.filter.filter(&sliced).await?;
        let skipped_cached = sliced.len() - needed.len();
        let planned = merger::merge(needed, self.limits.merge_span());

        let mut report = RetrievalReport {
            sliced: sliced.len(),
            skipped_cached,
            planned: planned.len(),
            ..RetrievalReport::default()
        };
        tracing::info!(
            dataset,
            ticker,
            start = %start,
            end = %end,
            sliced = report.sliced,
            skipped_cached = report.skipped_cached,
            planned = report.planned,
            "planned provider requests"
        );
        if planned.is_empty() {
            tracing::info!(dataset, ticker, "every requested month already stored");
            return Ok(report);
        }

        self.pending
            .create(&planned)
            .await
            .context("lodging pending requests failed")?;
        // Drain whatever is lodged for the series, not just this call's plan;
        // rows left over from an interrupted run ride along and self-heal.
        let batch = self
            .pending
            .requests(dataset, ticker)
            .await
            .context("loading lodged requests failed")?;

        let executor = ConcurrentExecutor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.pending),
            Arc::clone(&self.sink),
            self.limits.clone(),
        );
        let execution = executor.run(batch.clone(), self.shutdown.clone()).await?;
        report.fetched_requests = execution.fetched_requests;
        report.rows_stored = execution.rows_stored;

        report.months_recorded = self.recorder.record(&batch).await?;
        tracing::info!(
            dataset,
            ticker,
            fetched = report.fetched_requests,
            rows = report.rows_stored,
            months_recorded = report.months_recorded,
            "retrieval finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::prices::TradingDayPrices;
    use crate::domain::request::{RetrievalRequest, RetrievedMonth};
    use crate::storage::memory::{
        MemoryPendingRequestStore, MemoryPriceSink, MemoryRetrievedMonthStore,
    };
    use async_trait::async_trait;
    use chrono::{Datelike, Weekday};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    // One bar per weekday in the requested range, like a real feed.
    #[derive(Default)]
    struct WeekdayProvider {
        calls: Mutex<Vec<RetrievalRequest>>,
    }

    impl WeekdayProvider {
        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PriceProviderClient for WeekdayProvider {
        fn provider_name(&self) -> &'static str {
            "weekday"
        }

        async fn fetch_daily_prices(
            &self,
            request: &RetrievalRequest,
        ) -> anyhow::Result<Vec<TradingDayPrices>> {
            self.calls.lock().unwrap().push(request.clone());
            let mut bars = Vec::new();
            let mut date = request.start;
            while date < request.end {
                if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                    bars.push(TradingDayPrices {
                        dataset: request.dataset.clone(),
                        ticker: request.ticker.clone(),
                        date,
                        open: Some(10.0),
                        high: Some(10.5),
                        low: Some(9.5),
                        close: 10.0,
                        volume: Some(1_000.0),
                    });
                }
                date = date.succ_opt().unwrap();
            }
            Ok(bars)
        }
    }

    struct Pipeline {
        provider: Arc<WeekdayProvider>,
        pending: Arc<MemoryPendingRequestStore>,
        months: Arc<MemoryRetrievedMonthStore>,
        sink: Arc<MemoryPriceSink>,
        retriever: PriceRetriever,
    }

    fn pipeline(limits: FetchLimits) -> Pipeline {
        let provider = Arc::new(WeekdayProvider::default());
        let pending = Arc::new(MemoryPendingRequestStore::new());
        let months = Arc::new(MemoryRetrievedMonthStore::new());
        let sink = Arc::new(MemoryPriceSink::new());
        let retriever = PriceRetriever::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            Arc::clone(&months) as Arc<dyn RetrievedMonthStore>,
            Arc::clone(&sink) as Arc<dyn PriceSink>,
            limits,
        );
        Pipeline {
            provider,
            pending,
            months,
            sink,
            retriever,
        }
    }

    fn fast_limits() -> FetchLimits {
        FetchLimits {
            max_concurrent_connections: 4,
            max_requests_per_window: 100,
            throttle_window: std::time::Duration::from_millis(10),
            throttle_clean_interval: std::time::Duration::from_millis(5),
            max_retries: 2,
            retry_backoff: std::time::Duration::from_millis(1),
            max_secs_per_request: 5,
            max_merge_span_months: Some(6),
        }
    }

    fn month(y: i32, m: u32) -> RetrievedMonth {
        RetrievedMonth::try_new("AAPL", y, m).unwrap()
    }

    #[tokio::test]
    async fn fetches_stores_and_records_whole_months() {
        let p = pipeline(fast_limits());
        let report = p
            .retriever
            .get("WIKI", "AAPL", d(2015, 5, 1), d(2015, 8, 1))
            .await
            .unwrap();

        assert_eq!(report.sliced, 3);
        assert_eq!(report.skipped_cached, 0);
        // Three adjacent whole months merge into one provider call.
        assert_eq!(report.planned, 1);
        assert_eq!(report.fetched_requests, 1);
        assert_eq!(report.months_recorded, 3);
        assert_eq!(
            p.months.snapshot().await,
            HashSet::from([month(2015, 5), month(2015, 6), month(2015, 7)])
        );
        assert!(p.pending.snapshot().await.is_empty());
        assert!(!p.sink.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn repeating_a_get_costs_no_provider_calls() {
        let p = pipeline(fast_limits());
        p.retriever
            .get("WIKI", "AAPL", d(2015, 5, 1), d(2015, 8, 1))
            .await
            .unwrap();
        let first_run_calls = p.provider.total_calls();

        let report = p
            .retriever
            .get("WIKI", "AAPL", d(2015, 5, 1), d(2015, 8, 1))
            .await
            .unwrap();

        assert_eq!(p.provider.total_calls(), first_run_calls);
        assert_eq!(report.skipped_cached, 3);
        assert_eq!(report.planned, 0);
        assert_eq!(report.fetched_requests, 0);
    }

    #[tokio::test]
    async fn partial_months_are_refetched_on_overlap() {
        let p = pipeline(fast_limits());
        p.retriever
            .get("WIKI", "AAPL", d(2015, 4, 14), d(2015, 6, 1))
            .await
            .unwrap();
        // May was recorded; the April remainder was not.
        assert_eq!(p.months.snapshot().await, HashSet::from([month(2015, 5)]));

        let report = p
            .retriever
            .get("WIKI", "AAPL", d(2015, 4, 14), d(2015, 6, 1))
            .await
            .unwrap();
        assert_eq!(report.skipped_cached, 1);
        assert_eq!(report.planned, 1);
        assert_eq!(report.fetched_requests, 1);
    }

    #[tokio::test]
    async fn leftover_lodged_requests_ride_along() {
        let p = pipeline(fast_limits());
        // A row surviving from an interrupted earlier run.
        let leftover =
            RetrievalRequest::try_new("WIKI", "AAPL", d(2015, 3, 1), d(2015, 4, 1)).unwrap();
        p.pending
            .create(std::slice::from_ref(&leftover))
            .await
            .unwrap();

        let report = p
            .retriever
            .get("WIKI", "AAPL", d(2015, 5, 1), d(2015, 6, 1))
            .await
            .unwrap();

        assert_eq!(report.planned, 1);
        assert_eq!(report.fetched_requests, 2);
        assert!(p.pending.snapshot().await.is_empty());
        assert_eq!(
            p.months.snapshot().await,
            HashSet::from([month(2015, 3), month(2015, 5)])
        );
    }

    #[tokio::test]
    async fn rejects_inverted_ranges() {
        let p = pipeline(fast_limits());
        assert!(p
            .retriever
            .get("WIKI", "AAPL", d(2015, 6, 1), d(2015, 5, 1))
            .await
            .is_err());
    }
}
