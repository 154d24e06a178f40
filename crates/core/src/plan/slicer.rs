use anyhow::ensure;
use chrono::NaiveDate;

use crate::domain::request::RetrievalRequest;
use crate::time::trading_month::next_month_start;

// Every inner boundary lands on the first of a month, so a later run over
// any overlapping range produces the same whole-month slices for the cache.
pub fn slice(
    dataset: &str,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<RetrievalRequest>> {
    ensure!(
        start < end,
        "cannot slice empty range [{start}, {end}) for {ticker}"
    );
    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let stop = next_month_start(cursor).min(end);
        slices.push(RetrievalRequest::try_new(dataset, ticker, cursor, stop)?);
        cursor = stop;
    }
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn bounds(slices: &[RetrievalRequest]) -> Vec<(NaiveDate, NaiveDate)> {
        slices.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn range_within_one_month_stays_whole() {
        let slices = slice("WIKI", "AAPL", d(2011, 5, 1), d(2011, 5, 18)).unwrap();
        assert_eq!(bounds(&slices), vec![(d(2011, 5, 1), d(2011, 5, 18))]);
    }

    #[test]
    fn range_crossing_one_boundary_splits_in_two() {
        let slices = slice("WIKI", "AAPL", d(2011, 4, 14), d(2011, 6, 1)).unwrap();
        assert_eq!(
            bounds(&slices),
            vec![
                (d(2011, 4, 14), d(2011, 5, 1)),
                (d(2011, 5, 1), d(2011, 6, 1)),
            ]
        );
    }

    #[test]
    fn long_range_yields_partial_whole_partial() {
        let slices = slice("WIKI", "AAPL", d(2011, 4, 14), d(2011, 8, 19)).unwrap();
        assert_eq!(
            bounds(&slices),
            vec![
                (d(2011, 4, 14), d(2011, 5, 1)),
                (d(2011, 5, 1), d(2011, 6, 1)),
                (d(2011, 6, 1), d(2011, 7, 1)),
                (d(2011, 7, 1), d(2011, 8, 1)),
                (d(2011, 8, 1), d(2011, 8, 19)),
            ]
        );
    }

    #[test]
    fn slices_reconstruct_the_range_without_gaps() {
        let start = d(2013, 2, 11);
        let end = d(2014, 1, 3);
        let slices = slice("WIKI", "MSFT", start, end).unwrap();
        assert_eq!(slices.first().unwrap().start, start);
        assert_eq!(slices.last().unwrap().end, end);
        for pair in slices.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn empty_range_is_an_error() {
        assert!(slice("WIKI", "AAPL", d(2011, 5, 1), d(2011, 5, 1)).is_err());
        assert!(slice("WIKI", "AAPL", d(2011, 5, 2), d(2011, 5, 1)).is_err());
    }
}
