use anyhow::ensure;
use std::collections::HashSet;

// Trim whitespace, drop empties and duplicates, keep first-seen order.
pub fn requested(raw: &[String]) -> anyhow::Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut tickers = Vec::new();
    for value in raw {
        let ticker = value.trim();
        if ticker.is_empty() {
            continue;
        }
        ensure!(
            !ticker.contains(char::is_whitespace),
            "ticker {ticker:?} contains whitespace"
        );
        if seen.insert(ticker.to_string()) {
            tickers.push(ticker.to_string());
        }
    }
    ensure!(!tickers.is_empty(), "at least one ticker is required");
    Ok(tickers)
}
