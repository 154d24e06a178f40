use chrono::Months;
use std::time::Duration;

pub mod error;
pub mod executor;
pub mod provider;
pub mod retriever;
pub mod throttle;
pub mod types;

#[derive(Debug, Clone)]
pub struct FetchLimits {
    /// Upper bound on provider calls in flight at once.
    pub max_concurrent_connections: usize,
    /// Provider calls admitted per sliding throttle window.
    pub max_requests_per_window: u32,
    /// Width of the throttle window.
    pub throttle_window: Duration,
    /// How often the background cleaner reopens the window.
    pub throttle_clean_interval: Duration,
    /// Attempts per request, first try included.
    pub max_retries: u32,
    /// Base retry delay; attempt n sleeps n times this.
    pub retry_backoff: Duration,
    /// Batch budget in seconds per pending request.
    pub max_secs_per_request: u64,
    /// Cap on merged request length in months; `None` merges on adjacency alone.
    pub max_merge_span_months: Option<u32>,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 4,
            max_requests_per_window: 10,
            throttle_window: Duration::from_secs(1),
            throttle_clean_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_secs_per_request: 30,
            max_merge_span_months: Some(6),
        }
    }
}

impl FetchLimits {
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Some(n) = env_parse::<usize>("FETCH_MAX_CONCURRENT") {
            limits.max_concurrent_connections = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("FETCH_MAX_PER_SECOND") {
            limits.max_requests_per_window = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("FETCH_MAX_RETRIES") {
            limits.max_retries = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("FETCH_BACKOFF_MS") {
            limits.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("FETCH_MAX_SECS_PER_REQUEST") {
            limits.max_secs_per_request = secs.max(1);
        }
        if let Some(months) = env_parse::<u32>("FETCH_MERGE_SPAN_MONTHS") {
            // zero disables the cap
            limits.max_merge_span_months = (months > 0).then_some(months);
        }
        limits
    }

    pub fn merge_span(&self) -> Option<Months> {
        self.max_merge_span_months.map(Months::new)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
