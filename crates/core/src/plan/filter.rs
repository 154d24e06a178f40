use chrono::Datelike;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::domain::request::{RetrievalRequest, RetrievedMonth};
use crate::storage::retrieved_months::RetrievedMonthStore;

// Only a request spanning exactly one whole calendar month can match the
// cache index; partial and multi-month requests always pass through and get
// refetched, which the idempotent price upsert absorbs.
pub struct UnnecessaryRequestFilter {
    months: Arc<dyn RetrievedMonthStore>,
}

impl UnnecessaryRequestFilter {
    pub fn new(months: Arc<dyn RetrievedMonthStore>) -> Self {
        Self { months }
    }

    pub async fn filter(
        &self,
        requests: &[RetrievalRequest],
    ) -> anyhow::Result<Vec<RetrievalRequest>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // One store round trip per ticker, spanning all implicated years.
        let mut year_spans: BTreeMap<&str, (i32, i32)> = BTreeMap::new();
        for request in requests {
            let span = year_spans
                .entry(request.ticker.as_str())
                .or_insert((request.start.year(), request.end.year()));
            span.0 = span.0.min(request.start.year());
            span.1 = span.1.max(request.end.year());
        }
        let mut cached: HashMap<&str, HashSet<RetrievedMonth>> = HashMap::new();
        for (ticker, (from_year, to_year)) in year_spans {
            cached.insert(ticker, self.months.get(ticker, from_year, to_year).await?);
        }

        let mut needed = Vec::with_capacity(requests.len());
        for request in requests {
            let already_stored = request.as_whole_month().is_some_and(|month| {
                cached
                    .get(request.ticker.as_str())
                    .is_some_and(|set| set.contains(&month))
            });
            if already_stored {
                tracing::debug!(request = %request, "skipping request, month already stored");
            } else {
                needed.push(request.clone());
            }
        }
        Ok(needed)
    }
}
