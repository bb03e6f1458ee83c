//! Snapshot served by the REST fallback endpoint when clients cannot stream.
//!
//! Source order: live cache, then a REST ticker fetch for the active set,
//! then zero-priced placeholders.

use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::strategy::market_cache::{CacheSnapshot, MarketCache};
use crate::strategy::pair_selector::{ActiveSymbolSet, TickerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    Cache,
    RestApi,
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackQuote {
    pub symbol: String,
    pub price: f64,
    pub volume_24h: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FallbackData {
    Cache(CacheSnapshot),
    Quotes(Vec<FallbackQuote>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackResponse {
    pub status: FallbackStatus,
    pub source: FallbackSource,
    pub data: FallbackData,
    /// Symbols with at least one cache entry older than the cache TTL.
    pub stale: Vec<String>,
    pub timestamp: i64,
}

pub async fn assemble(
    cache: &MarketCache,
    active: &ActiveSymbolSet,
    tickers: &dyn TickerSource,
    quote: &str,
    ttl: Duration,
    now_ms: i64,
) -> FallbackResponse {
    if !cache.is_empty() {
        let snapshot = cache.snapshot();
        let ttl_ms = ttl.as_millis() as i64;
        let stale = snapshot
            .iter()
            .filter(|(_, channels)| channels.values().any(|e| now_ms - e.timestamp > ttl_ms))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        return FallbackResponse {
            status: FallbackStatus::Ok,
            source: FallbackSource::Cache,
            data: FallbackData::Cache(snapshot),
            stale,
            timestamp: now_ms,
        };
    }

    let wanted = active.symbol_set();
    match tickers.tickers(quote).await {
        Ok(rows) => {
            let quotes: Vec<FallbackQuote> = rows
                .into_iter()
                .filter(|t| wanted.contains(&t.inst_id))
                .map(|t| FallbackQuote {
                    symbol: t.inst_id,
                    price: t.last_price,
                    volume_24h: t.volume_24h,
                    timestamp: now_ms,
                })
                .collect();
            if !quotes.is_empty() {
                return FallbackResponse {
                    status: FallbackStatus::Ok,
                    source: FallbackSource::RestApi,
                    data: FallbackData::Quotes(quotes),
                    stale: Vec::new(),
                    timestamp: now_ms,
                };
            }
            warn!("live ticker fetch had no active symbols, serving placeholders");
        }
        Err(e) => warn!(error = %e, "live ticker fetch failed, serving placeholders"),
    }

    FallbackResponse {
        status: FallbackStatus::Degraded,
        source: FallbackSource::Synthetic,
        data: FallbackData::Quotes(
            active
                .symbols()
                .into_iter()
                .map(|symbol| FallbackQuote {
                    symbol,
                    price: 0.0,
                    volume_24h: 0.0,
                    timestamp: now_ms,
                })
                .collect(),
        ),
        stale: Vec::new(),
        timestamp: now_ms,
    }
}
