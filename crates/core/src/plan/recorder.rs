use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::request::{RetrievalRequest, RetrievedMonth};
use crate::storage::retrieved_months::RetrievedMonthStore;
use crate::time::trading_month::{
    ends_trading_month, month_start, next_month_start, starts_trading_month,
};

// Works out which calendar months a drained batch covered end to end and
// records them so later runs skip the fetch. The boundary tests only ever
// under-record; a month left unrecorded is merely refetched, while a month
// recorded wrongly would silently hide data.
pub struct RetrievedMonthRecorder {
    months: Arc<dyn RetrievedMonthStore>,
}

impl RetrievedMonthRecorder {
    pub fn new(months: Arc<dyn RetrievedMonthStore>) -> Self {
        Self { months }
    }

    pub async fn record(&self, fulfilled: &[RetrievalRequest]) -> anyhow::Result<usize> {
        let mut complete = BTreeSet::new();
        for request in fulfilled {
            collect_complete_months(request, fulfilled, &mut complete);
        }
        if complete.is_empty() {
            return Ok(0);
        }
        let months: Vec<RetrievedMonth> = complete.into_iter().collect();
        self.months.create(&months).await?;
        for month in &months {
            tracing::debug!(month = %month, "month recorded as fully stored");
        }
        Ok(months.len())
    }
}

fn collect_complete_months(
    request: &RetrievalRequest,
    batch: &[RetrievalRequest],
    complete: &mut BTreeSet<RetrievedMonth>,
) {
    // The request covers days start..=end-1; all month tests run on that
    // closed span.
    let Some(last_covered) = request.end.pred_opt() else {
        return;
    };
    let first_month = month_start(request.start);
    let last_month = month_start(last_covered);

    let begun = starts_trading_month(request.start);
    let ended = ends_trading_month(last_covered) || continued_to_month_end(request, batch);

    // Months strictly between the two boundary months are covered in full
    // whatever the boundary days look like.
    let mut month = next_month_start(request.start);
    while month < last_month {
        complete.insert(RetrievedMonth::of(&request.ticker, month));
        month = next_month_start(month);
    }

    // The first month needs a plausible month-start; it also needs to run to
    // its own end, which is implied whenever the request reaches past it.
    if begun && (first_month < last_month || ended) {
        complete.insert(RetrievedMonth::of(&request.ticker, request.start));
    }
    // The last month starts at its 1st whenever the request began earlier.
    if ended && last_month > first_month {
        complete.insert(RetrievedMonth::of(&request.ticker, last_covered));
    }
}

// A request cut off mid-month still ends a month when an adjacent batch mate
// picks up at exactly its end date and itself runs to a month end. One hop
// only; chains longer than two requests record the middle months anyway.
fn continued_to_month_end(request: &RetrievalRequest, batch: &[RetrievalRequest]) -> bool {
    batch.iter().any(|next| {
        next.same_series(request)
            && next.start == request.end
            && next.end.pred_opt().is_some_and(ends_trading_month)
    })
}
