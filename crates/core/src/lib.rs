pub mod domain;
pub mod ingest;
pub mod plan;
pub mod storage;
pub mod time;

pub mod config {
    use anyhow::Context;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub price_provider_base_url: Option<String>,
        pub price_provider_api_key: Option<String>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                price_provider_base_url: std::env::var("PRICE_PROVIDER_BASE_URL").ok(),
                price_provider_api_key: std::env::var("PRICE_PROVIDER_API_KEY").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_price_provider_base_url(&self) -> anyhow::Result<&str> {
            self.price_provider_base_url
                .as_deref()
                .context("PRICE_PROVIDER_BASE_URL is required")
        }
    }
}
