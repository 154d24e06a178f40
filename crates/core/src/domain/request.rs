use anyhow::ensure;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time::trading_month::{is_month_start, next_month_start};

// A half-open [start, end) slice of a ticker's daily history still to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub dataset: String,
    pub ticker: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RetrievalRequest {
    pub fn try_new(
        dataset: &str,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<Self> {
        let dataset = dataset.trim();
        let ticker = ticker.trim();
        ensure!(!dataset.is_empty(), "request dataset is empty");
        ensure!(!ticker.is_empty(), "request ticker is empty");
        ensure!(
            start < end,
            "request range [{start}, {end}) is empty or inverted"
        );
        Ok(Self {
            dataset: dataset.to_string(),
            ticker: ticker.to_string(),
            start,
            end,
        })
    }

    pub fn same_series(&self, other: &RetrievalRequest) -> bool {
        self.dataset == other.dataset && self.ticker == other.ticker
    }

    pub fn as_whole_month(&self) -> Option<RetrievedMonth> {
        if is_month_start(self.start) && self.end == next_month_start(self.start) {
            Some(RetrievedMonth::of(&self.ticker, self.start))
        } else {
            None
        }
    }
}

impl fmt::Display for RetrievalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}, {})",
            self.dataset, self.ticker, self.start, self.end
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetrievedMonth {
    pub ticker: String,
    pub year: i32,
    pub month: u32,
}

impl RetrievedMonth {
    pub fn try_new(ticker: &str, year: i32, month: u32) -> anyhow::Result<Self> {
        let ticker = ticker.trim();
        ensure!(!ticker.is_empty(), "retrieved month ticker is empty");
        ensure!(
            (1..=12).contains(&month),
            "retrieved month {month} out of range for ticker {ticker}"
        );
        Ok(Self {
            ticker: ticker.to_string(),
            year,
            month,
        })
    }

    pub fn of(ticker: &str, date: NaiveDate) -> Self {
        Self {
            ticker: ticker.to_string(),
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for RetrievedMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:04}-{:02}", self.ticker, self.year, self.month)
    }
}
