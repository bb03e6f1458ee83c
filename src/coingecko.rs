use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::SourceError;
use crate::okx::http_error;
use crate::strategy::pair_selector::{MarketCapEntry, MarketCapSource};

pub const COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";

const SOURCE_NAME: &str = "coingecko";
const SYMBOLS_PER_REQUEST: usize = 50;

#[derive(Debug, Deserialize)]
struct CoinMarket {
    symbol: String,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    market_cap_rank: Option<u32>,
}

/// Market-cap ranking source backed by `GET /coins/markets`.
#[derive(Clone)]
pub struct CoinGeckoClient {
    client: reqwest::Client,
    base_url: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_batch(&self, symbols: &[String]) -> Result<Vec<MarketCapEntry>, SourceError> {
        let url = format!("{}/coins/markets", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[
                ("vs_currency", "usd".to_string()),
                ("symbols", symbols.join(",")),
                ("order", "market_cap_desc".to_string()),
                ("per_page", "250".to_string()),
            ])
            .send()
            .await
            .map_err(|e| http_error(SOURCE_NAME, e))?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: SOURCE_NAME,
                status: response.status().as_u16(),
            });
        }

        let markets: Vec<CoinMarket> = response.json().await.map_err(|e| http_error(SOURCE_NAME, e))?;
        Ok(markets
            .into_iter()
            .filter_map(|m| {
                Some(MarketCapEntry {
                    symbol: m.symbol.to_ascii_uppercase(),
                    market_cap: m.market_cap.filter(|c| *c > 0.0)?,
                    rank: m.market_cap_rank,
                })
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl MarketCapSource for CoinGeckoClient {
    async fn market_caps(&self, symbols: &[String]) -> Result<Vec<MarketCapEntry>, SourceError> {
        let lowered: Vec<String> = symbols.iter().map(|s| s.to_ascii_lowercase()).collect();
        let mut out = Vec::with_capacity(lowered.len());
        for batch in lowered.chunks(SYMBOLS_PER_REQUEST) {
            out.extend(self.fetch_batch(batch).await?);
        }
        debug!(requested = symbols.len(), matched = out.len(), "market caps fetched");
        if out.is_empty() {
            return Err(SourceError::Empty { source_name: SOURCE_NAME });
        }
        Ok(out)
    }
}
