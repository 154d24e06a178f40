use std::fmt;
use std::time::Duration;

use crate::domain::request::RetrievalRequest;

// Carried through anyhow; callers that care recover these with downcast_ref.
#[derive(Debug, Clone)]
pub enum RetrievalError {
    ExhaustedRetries {
        request: RetrievalRequest,
        attempts: u32,
        detail: String,
    },
    Timeout { ticker: String, budget: Duration },
    IntegrityViolation {
        dataset: String,
        ticker: String,
        remaining: usize,
    },
    Interrupted { ticker: String },
}

impl fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExhaustedRetries {
                request,
                attempts,
                detail,
            } => write!(
                f,
                "request {request} failed after {attempts} attempts: {detail}"
            ),
            Self::Timeout { ticker, budget } => write!(
                f,
                "batch for {ticker} did not drain within {}s",
                budget.as_secs()
            ),
            Self::IntegrityViolation {
                dataset,
                ticker,
                remaining,
            } => write!(
                f,
                "{remaining} pending requests for {dataset}:{ticker} survived a drained batch"
            ),
            Self::Interrupted { ticker } => {
                write!(f, "batch for {ticker} interrupted by shutdown")
            }
        }
    }
}

impl std::error::Error for RetrievalError {}
