use anyhow::{anyhow, ensure, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::domain::request::RetrievalRequest;
use crate::ingest::error::RetrievalError;
use crate::ingest::provider::PriceProviderClient;
use crate::ingest::throttle::Throttle;
use crate::ingest::FetchLimits;
use crate::storage::pending_requests::PendingRequestStore;
use crate::storage::prices::PriceSink;

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub fetched_requests: usize,
    pub rows_stored: u64,
}

// The first request to burn its retry budget fails the whole batch; the
// rest are cancelled and the error names the culprit.
pub struct ConcurrentExecutor {
    provider: Arc<dyn PriceProviderClient>,
    pending: Arc<dyn PendingRequestStore>,
    sink: Arc<dyn PriceSink>,
    limits: FetchLimits,
}

enum TaskOutcome {
    Fetched { request: RetrievalRequest, rows: u64 },
    Failed {
        request: RetrievalRequest,
        attempts: u32,
        detail: String,
    },
    Cancelled,
    Interrupted,
}

enum BatchFailure {
    Exhausted {
        request: RetrievalRequest,
        attempts: u32,
        detail: String,
    },
    TaskAborted(String),
}

#[derive(Clone)]
struct TaskCtx {
    provider: Arc<dyn PriceProviderClient>,
    pending: Arc<dyn PendingRequestStore>,
    sink: Arc<dyn PriceSink>,
    throttle: Arc<Throttle>,
    slots: Arc<Semaphore>,
    cancel: Arc<watch::Sender<bool>>,
    limits: FetchLimits,
}

impl ConcurrentExecutor {
    pub fn new(
        provider: Arc<dyn PriceProviderClient>,
        pending: Arc<dyn PendingRequestStore>,
        sink: Arc<dyn PriceSink>,
        limits: FetchLimits,
    ) -> Self {
        Self {
            provider,
            pending,
            sink,
            limits,
        }
    }

    pub async fn run(
        &self,
        requests: Vec<RetrievalRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<ExecutionReport> {
        let Some(first) = requests.first() else {
            return Ok(ExecutionReport::default());
        };
        let dataset = first.dataset.clone();
        let ticker = first.ticker.clone();
        ensure!(
            requests.iter().all(|r| r.same_series(first)),
            "executor batches must stay within one series"
        );

        let total = requests.len();
        let budget = Duration::from_secs(self.limits.max_secs_per_request.max(1) * total as u64);
        let throttle = Arc::new(Throttle::new(
            self.limits.max_requests_per_window,
            self.limits.throttle_window,
        ));
        let cleaner = throttle.spawn_cleaner(self.limits.throttle_clean_interval);
        let (cancel, _) = watch::channel(false);
        let ctx = TaskCtx {
            provider: Arc::clone(&self.provider),
            pending: Arc::clone(&self.pending),
            sink: Arc::clone(&self.sink),
            throttle,
            slots: Arc::new(Semaphore::new(self.limits.max_concurrent_connections.max(1))),
            cancel: Arc::new(cancel),
            limits: self.limits.clone(),
        };

        tracing::info!(
            ticker = %ticker,
            requests = total,
            budget_secs = budget.as_secs(),
            "draining pending requests"
        );

        let mut tasks = JoinSet::new();
        for request in requests {
            tasks.spawn(fetch_one(ctx.clone(), request, shutdown.clone()));
        }

        let drained = tokio::time::timeout(budget, drain(&mut tasks, &ctx.cancel)).await;
        let drained = match drained {
            Ok(result) => Some(result),
            Err(_) => {
                let _ = ctx.cancel.send(true);
                tasks.shutdown().await;
                None
            }
        };
        cleaner.stop().await;

        let Some((report, failure, interrupted)) = drained else {
            tracing::error!(
                ticker = %ticker,
                budget_secs = budget.as_secs(),
                "batch did not drain in time; abandoning"
            );
            return Err(RetrievalError::Timeout { ticker, budget }.into());
        };

        if let Some(failure) = failure {
            return Err(match failure {
                BatchFailure::Exhausted {
                    request,
                    attempts,
                    detail,
                } => RetrievalError::ExhaustedRetries {
                    request,
                    attempts,
                    detail,
                }
                .into(),
                BatchFailure::TaskAborted(detail) => anyhow!("executor task aborted: {detail}"),
            });
        }
        if interrupted {
            return Err(RetrievalError::Interrupted { ticker }.into());
        }

        // A clean drain with rows left behind means work was lost without an
        // error surfacing; refuse to report success.
        let remaining = self
            .pending
            .requests(&dataset, &ticker)
            .await
            .context("re-reading pending requests after drain failed")?;
        if !remaining.is_empty() {
            return Err(RetrievalError::IntegrityViolation {
                dataset,
                ticker,
                remaining: remaining.len(),
            }
            .into());
        }

        tracing::info!(
            ticker = %ticker,
            fetched = report.fetched_requests,
            rows = report.rows_stored,
            "batch drained"
        );
        Ok(report)
    }
}

async fn drain(
    tasks: &mut JoinSet<TaskOutcome>,
    cancel: &watch::Sender<bool>,
) -> (ExecutionReport, Option<BatchFailure>, bool) {
    let mut report = ExecutionReport::default();
    let mut failure = None;
    let mut interrupted = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(TaskOutcome::Fetched { request, rows }) => {
                report.fetched_requests += 1;
                report.rows_stored += rows;
                tracing::debug!(request = %request, rows, "request fulfilled");
            }
            Ok(TaskOutcome::Failed {
                request,
                attempts,
                detail,
            }) => {
                tracing::error!(
                    request = %request,
                    attempts,
                    detail = %detail,
                    "request failed; batch cancelled"
                );
                if failure.is_none() {
                    failure = Some(BatchFailure::Exhausted {
                        request,
                        attempts,
                        detail,
                    });
                }
            }
            Ok(TaskOutcome::Cancelled) => {}
            Ok(TaskOutcome::Interrupted) => interrupted = true,
            Err(join_error) => {
                let _ = cancel.send(true);
                if failure.is_none() {
                    failure = Some(BatchFailure::TaskAborted(join_error.to_string()));
                }
            }
        }
    }
    (report, failure, interrupted)
}

async fn fetch_one(
    ctx: TaskCtx,
    request: RetrievalRequest,
    mut shutdown: watch::Receiver<bool>,
) -> TaskOutcome {
    let mut cancel = ctx.cancel.subscribe();

    let _slot = tokio::select! {
        slot = Arc::clone(&ctx.slots).acquire_owned() => {
            slot.expect("executor semaphore is never closed")
        }
        _ = flag_raised(&mut cancel) => return TaskOutcome::Cancelled,
        _ = flag_raised(&mut shutdown) => return TaskOutcome::Interrupted,
    };
    // A slot can be granted in the same instant the batch fails; nothing may
    // start once fail-fast has triggered.
    if *cancel.borrow() {
        return TaskOutcome::Cancelled;
    }
    if *shutdown.borrow() {
        return TaskOutcome::Interrupted;
    }

    let max_attempts = ctx.limits.max_retries.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        tokio::select! {
            _ = ctx.throttle.add() => {}
            _ = flag_raised(&mut cancel) => return TaskOutcome::Cancelled,
            _ = flag_raised(&mut shutdown) => return TaskOutcome::Interrupted,
        }

        let fulfilled = tokio::select! {
            result = fulfil(&ctx, &request) => result,
            _ = flag_raised(&mut cancel) => return TaskOutcome::Cancelled,
            _ = flag_raised(&mut shutdown) => return TaskOutcome::Interrupted,
        };

        match fulfilled {
            Ok(rows) => return TaskOutcome::Fetched { request, rows },
            Err(err) if attempt >= max_attempts => {
                // Fail fast before reporting back, so siblings stop without
                // waiting for this outcome to be collected.
                let _ = ctx.cancel.send(true);
                return TaskOutcome::Failed {
                    request,
                    attempts: attempt,
                    detail: format!("{err:#}"),
                };
            }
            Err(err) => {
                let backoff = ctx.limits.retry_backoff * attempt;
                tracing::warn!(
                    request = %request,
                    attempt,
                    ?backoff,
                    error = %format!("{err:#}"),
                    "provider fetch failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = flag_raised(&mut cancel) => return TaskOutcome::Cancelled,
                    _ = flag_raised(&mut shutdown) => return TaskOutcome::Interrupted,
                }
            }
        }
    }
}

async fn fulfil(ctx: &TaskCtx, request: &RetrievalRequest) -> anyhow::Result<u64> {
    let prices = ctx.provider.fetch_daily_prices(request).await?;
    let rows = ctx
        .sink
        .store_daily_prices(&prices)
        .await
        .context("storing fetched prices failed")?;
    ctx.pending
        .delete(request)
        .await
        .context("clearing fulfilled pending request failed")?;
    Ok(rows)
}

// Resolves once the watched flag turns true. A dropped sender means the flag
// can never rise, so the future parks forever and sibling select arms win.
async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::prices::TradingDayPrices;
    use crate::storage::memory::{MemoryPendingRequestStore, MemoryPriceSink};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn req(start: NaiveDate, end: NaiveDate) -> RetrievalRequest {
        RetrievalRequest::try_new("WIKI", "AAPL", start, end).unwrap()
    }

    fn bar_for(request: &RetrievalRequest) -> TradingDayPrices {
        TradingDayPrices {
            dataset: request.dataset.clone(),
            ticker: request.ticker.clone(),
            date: request.start,
            open: None,
            high: None,
            low: None,
            close: 10.0,
            volume: None,
        }
    }

    fn fast_limits() -> FetchLimits {
        FetchLimits {
            max_concurrent_connections: 4,
            max_requests_per_window: 100,
            throttle_window: Duration::from_millis(10),
            throttle_clean_interval: Duration::from_millis(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(1),
            max_secs_per_request: 5,
            max_merge_span_months: None,
        }
    }

    fn never_shutdown() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[derive(Default)]
    struct ScriptedProvider {
        failures_left: Mutex<HashMap<NaiveDate, u32>>,
        delays: HashMap<NaiveDate, Duration>,
        calls: Mutex<Vec<NaiveDate>>,
    }

    impl ScriptedProvider {
        fn failing(start: NaiveDate, times: u32) -> Self {
            let provider = Self::default();
            provider.failures_left.lock().unwrap().insert(start, times);
            provider
        }

        fn with_delay(mut self, start: NaiveDate, delay: Duration) -> Self {
            self.delays.insert(start, delay);
            self
        }

        fn calls_for(&self, start: NaiveDate) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == start)
                .count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PriceProviderClient for ScriptedProvider {
        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_daily_prices(
            &self,
            request: &RetrievalRequest,
        ) -> anyhow::Result<Vec<TradingDayPrices>> {
            self.calls.lock().unwrap().push(request.start);
            if let Some(delay) = self.delays.get(&request.start) {
                tokio::time::sleep(*delay).await;
            }
            {
                let mut failures = self.failures_left.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&request.start) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        bail!("scripted provider failure");
                    }
                }
            }
            Ok(vec![bar_for(request)])
        }
    }

    fn batch_of_three() -> Vec<RetrievalRequest> {
        vec![
            req(d(2015, 5, 1), d(2015, 6, 1)),
            req(d(2015, 6, 1), d(2015, 7, 1)),
            req(d(2015, 7, 1), d(2015, 8, 1)),
        ]
    }

    #[tokio::test]
    async fn drains_every_request_and_clears_pending_rows() {
        let requests = batch_of_three();
        let provider = Arc::new(ScriptedProvider::default());
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&requests).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let executor = ConcurrentExecutor::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            Arc::clone(&sink) as Arc<dyn PriceSink>,
            fast_limits(),
        );
        let report = executor.run(requests, never_shutdown()).await.unwrap();

        assert_eq!(report.fetched_requests, 3);
        assert_eq!(report.rows_stored, 3);
        assert!(pending.snapshot().await.is_empty());
        assert_eq!(sink.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let requests = vec![req(d(2015, 5, 1), d(2015, 6, 1))];
        let provider = Arc::new(ScriptedProvider::failing(d(2015, 5, 1), 2));
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&requests).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let executor = ConcurrentExecutor::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            sink,
            fast_limits(),
        );
        let report = executor.run(requests, never_shutdown()).await.unwrap();

        assert_eq!(report.fetched_requests, 1);
        assert_eq!(provider.calls_for(d(2015, 5, 1)), 3);
        assert!(pending.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_batch_and_cancel_queued_work() {
        let requests = batch_of_three();
        let provider = Arc::new(ScriptedProvider::failing(d(2015, 5, 1), 10));
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&requests).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let mut limits = fast_limits();
        limits.max_concurrent_connections = 1;
        limits.max_retries = 2;
        let executor = ConcurrentExecutor::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            sink,
            limits,
        );
        let err = executor
            .run(requests.clone(), never_shutdown())
            .await
            .unwrap_err();

        match err.downcast_ref::<RetrievalError>() {
            Some(RetrievalError::ExhaustedRetries {
                request, attempts, ..
            }) => {
                assert_eq!(request, &requests[0]);
                assert_eq!(*attempts, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Queued requests never reached the provider and stay lodged.
        assert_eq!(provider.calls_for(d(2015, 6, 1)), 0);
        assert_eq!(provider.calls_for(d(2015, 7, 1)), 0);
        assert_eq!(pending.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn failure_cancels_requests_already_in_flight() {
        // One request burns its single attempt while a sibling sleeps inside
        // the provider; the sibling must be cut short, not awaited to the end.
        let requests = vec![
            req(d(2015, 5, 1), d(2015, 6, 1)),
            req(d(2015, 6, 1), d(2015, 7, 1)),
        ];
        let provider = Arc::new(
            ScriptedProvider::failing(d(2015, 5, 1), 10)
                .with_delay(d(2015, 5, 1), Duration::from_millis(50))
                .with_delay(d(2015, 6, 1), Duration::from_secs(10)),
        );
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&requests).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let mut limits = fast_limits();
        limits.max_retries = 1;
        let executor = ConcurrentExecutor::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            Arc::clone(&sink) as Arc<dyn PriceSink>,
            limits,
        );
        let run = tokio::time::timeout(
            Duration::from_secs(2),
            executor.run(requests.clone(), never_shutdown()),
        )
        .await
        .expect("cancellation should end the batch long before the slow fetch");
        let err = run.unwrap_err();

        match err.downcast_ref::<RetrievalError>() {
            Some(RetrievalError::ExhaustedRetries {
                request, attempts, ..
            }) => {
                assert_eq!(request, &requests[0]);
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The sibling was already in flight when the batch failed.
        assert_eq!(provider.calls_for(d(2015, 6, 1)), 1);
        assert_eq!(pending.snapshot().await.len(), 2);
        assert!(sink.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_interrupts_before_any_fetch() {
        let requests = batch_of_three();
        let provider = Arc::new(ScriptedProvider::default());
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&requests).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let executor = ConcurrentExecutor::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            sink,
            fast_limits(),
        );
        let (_tx, shutdown) = watch::channel(true);
        let err = executor.run(requests, shutdown).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::Interrupted { .. })
        ));
        assert_eq!(provider.total_calls(), 0);
        assert_eq!(pending.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn overrunning_the_budget_times_out() {
        let requests = vec![req(d(2015, 5, 1), d(2015, 6, 1))];
        let provider = Arc::new(
            ScriptedProvider::default().with_delay(d(2015, 5, 1), Duration::from_secs(3)),
        );
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&requests).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let mut limits = fast_limits();
        limits.max_secs_per_request = 1;
        let executor = ConcurrentExecutor::new(
            provider,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            sink,
            limits,
        );
        let err = executor.run(requests, never_shutdown()).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::Timeout { .. })
        ));
        assert_eq!(pending.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn surviving_pending_rows_violate_integrity() {
        let batch = vec![req(d(2015, 5, 1), d(2015, 6, 1))];
        let stray = req(d(2015, 9, 1), d(2015, 10, 1));
        let provider = Arc::new(ScriptedProvider::default());
        let pending = Arc::new(MemoryPendingRequestStore::new());
        pending.create(&batch).await.unwrap();
        pending.create(std::slice::from_ref(&stray)).await.unwrap();
        let sink = Arc::new(MemoryPriceSink::new());

        let executor = ConcurrentExecutor::new(
            provider,
            Arc::clone(&pending) as Arc<dyn PendingRequestStore>,
            sink,
            fast_limits(),
        );
        let err = executor.run(batch, never_shutdown()).await.unwrap_err();

        match err.downcast_ref::<RetrievalError>() {
            Some(RetrievalError::IntegrityViolation { remaining, .. }) => {
                assert_eq!(*remaining, 1)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_clean_noop() {
        let provider = Arc::new(ScriptedProvider::default());
        let pending = Arc::new(MemoryPendingRequestStore::new());
        let sink = Arc::new(MemoryPriceSink::new());

        let executor = ConcurrentExecutor::new(
            Arc::clone(&provider) as Arc<dyn PriceProviderClient>,
            pending,
            sink,
            fast_limits(),
        );
        let report = executor.run(Vec::new(), never_shutdown()).await.unwrap();
        assert_eq!(report.fetched_requests, 0);
        assert_eq!(provider.total_calls(), 0);
    }

    #[tokio::test]
    async fn mixed_series_batches_are_rejected() {
        let requests = vec![
            req(d(2015, 5, 1), d(2015, 6, 1)),
            RetrievalRequest::try_new("WIKI", "MSFT", d(2015, 5, 1), d(2015, 6, 1)).unwrap(),
        ];
        let executor = ConcurrentExecutor::new(
            Arc::new(ScriptedProvider::default()),
            Arc::new(MemoryPendingRequestStore::new()),
            Arc::new(MemoryPriceSink::new()),
            fast_limits(),
        );
        assert!(executor.run(requests, never_shutdown()).await.is_err());
    }
}
