use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::prices::TradingDayPrices;

// Wire shape of the provider's daily price endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPricesResponse {
    pub dataset: String,
    pub ticker: String,
    pub bars: Vec<DailyBar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl DailyBar {
    pub fn into_prices(self, dataset: &str, ticker: &str) -> TradingDayPrices {
        TradingDayPrices {
            dataset: dataset.to_string(),
            ticker: ticker.to_string(),
            date: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}
