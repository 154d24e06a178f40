use anyhow::{bail, ensure, Context};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;

use crate::config::Settings;
use crate::domain::prices::TradingDayPrices;
use crate::domain::request::RetrievalRequest;
use crate::ingest::types::DailyPricesResponse;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DAILY_PATH: &str = "/v1/daily-prices";

// One attempt per call; retry, pacing and cancellation live in the executor.
#[async_trait]
pub trait PriceProviderClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_daily_prices(
        &self,
        request: &RetrievalRequest,
    ) -> anyhow::Result<Vec<TradingDayPrices>>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonPriceProvider {
    http: reqwest::Client,
    base_url: String,
    daily_path: String,
    api_key: Option<String>,
}

impl HttpJsonPriceProvider {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.require_price_provider_base_url()?.to_string();
        let timeout_secs = std::env::var("PRICE_PROVIDER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let daily_path = std::env::var("PRICE_PROVIDER_DAILY_PATH")
            .unwrap_or_else(|_| DEFAULT_DAILY_PATH.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("building price provider HTTP client failed")?;
        Ok(Self {
            http,
            base_url,
            daily_path,
            api_key: settings.price_provider_api_key.clone(),
        })
    }

    fn url(&self) -> String {
        let path = if self.daily_path.starts_with('/') {
            self.daily_path.clone()
        } else {
            format!("/{}", self.daily_path)
        };
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .context("PRICE_PROVIDER_API_KEY is not a valid header value")?;
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl PriceProviderClient for HttpJsonPriceProvider {
    fn provider_name(&self) -> &'static str {
        "http_json"
    }

    async fn fetch_daily_prices(
        &self,
        request: &RetrievalRequest,
    ) -> anyhow::Result<Vec<TradingDayPrices>> {
        let start_date = request.start.to_string();
        let end_date = request.end.to_string();
        let response = self
            .http
            .get(self.url())
            .headers(self.headers()?)
            .query(&[
                ("dataset", request.dataset.as_str()),
                ("ticker", request.ticker.as_str()),
                ("start_date", start_date.as_str()),
                ("end_date", end_date.as_str()),
            ])
            .send()
            .await
            .context("price provider request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("reading price provider response failed")?;
        if !status.is_success() {
            bail!("price provider HTTP {status}: {body}");
        }

        let parsed: DailyPricesResponse = serde_json::from_str(&body)
            .with_context(|| format!("price provider returned unexpected body: {body}"))?;
        validate_response(request, &parsed)?;

        Ok(parsed
            .bars
            .into_iter()
            .map(|bar| bar.into_prices(&request.dataset, &request.ticker))
            .collect())
    }
}

fn validate_response(
    request: &RetrievalRequest,
    response: &DailyPricesResponse,
) -> anyhow::Result<()> {
    ensure!(
        response.ticker == request.ticker,
        "provider answered for {} but {} was requested",
        response.ticker,
        request.ticker
    );
    ensure!(
        !response.bars.is_empty(),
        "provider returned no trading days for {request}"
    );
    let mut previous = None;
    for bar in &response.bars {
        ensure!(
            bar.date >= request.start && bar.date < request.end,
            "provider bar {} outside requested range {request}",
            bar.date
        );
        if let Some(previous) = previous {
            ensure!(
                bar.date > previous,
                "provider bars out of order at {}",
                bar.date
            );
        }
        previous = Some(bar.date);
    }
    Ok(())
}
