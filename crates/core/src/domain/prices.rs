use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// Stored as-is; the pipeline never inspects the numbers beyond requiring a
// close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDayPrices {
    pub dataset: String,
    pub ticker: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<f64>,
}
