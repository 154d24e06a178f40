use chrono::Months;

use crate::domain::request::RetrievalRequest;

// A request joins the run under construction only when it is the same
// series, starts exactly where the run ends and keeps the run within
// max_span months of its start. Any gap, overlap or series change ends it.
pub fn merge(requests: Vec<RetrievalRequest>, max_span: Option<Months>) -> Vec<RetrievalRequest> {
    let mut merged = Vec::with_capacity(requests.len());
    let mut pending = requests.into_iter();
    let Some(mut run) = pending.next() else {
        return merged;
    };
    for request in pending {
        if can_extend(&run, &request, max_span) {
            run.end = request.end;
        } else {
            merged.push(run);
            run = request;
        }
    }
    merged.push(run);
    merged
}

fn can_extend(run: &RetrievalRequest, next: &RetrievalRequest, max_span: Option<Months>) -> bool {
    if !run.same_series(next) || next.start != run.end {
        return false;
    }
    match max_span {
        None => true,
        Some(span) => match run.start.checked_add_months(span) {
            Some(limit) => next.end <= limit,
            None => false,
        },
    }
}
