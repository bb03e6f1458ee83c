//! Trading-pair ranking and the bounded active symbol set.
//!
//! Instruments are ranked by market capitalization, with volume x price as an
//! explicit proxy whenever the capitalization source has nothing for a symbol.
//! The top `K` become large-cap, the next `M` mid-cap, the rest are dropped.
//!
//! Fallback order when sources fail: previous ranked set, then volume proxy,
//! then the static symbol list.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::error::SourceError;
use crate::strategy::types::{Category, Instrument};
use crate::utils;

/// Raw exchange ticker row used for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketTicker {
    pub inst_id: String,
    pub base: String,
    pub last_price: f64,
    /// Base-asset volume over 24h.
    pub volume_24h: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketCapEntry {
    pub symbol: String,
    pub market_cap: f64,
    pub rank: Option<u32>,
}

#[async_trait::async_trait]
pub trait TickerSource: Send + Sync {
    async fn tickers(&self, quote: &str) -> Result<Vec<MarketTicker>, SourceError>;
}

#[async_trait::async_trait]
pub trait MarketCapSource: Send + Sync {
    /// Capitalization for the given base symbols. Matching is case-insensitive;
    /// symbols without data are simply absent from the result.
    async fn market_caps(&self, symbols: &[String]) -> Result<Vec<MarketCapEntry>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Every selected instrument carries a real capitalization.
    Ranked,
    /// At least one instrument was ranked by the volume proxy.
    Proxy,
    /// Latest refresh failed; previous ranking kept.
    Cached,
    Static,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSymbolSet {
    pub large_cap: Vec<Instrument>,
    pub mid_cap: Vec<Instrument>,
    pub source: SelectionSource,
    pub updated_at: DateTime<Utc>,
}

impl ActiveSymbolSet {
    pub fn empty() -> Self {
        Self {
            large_cap: Vec::new(),
            mid_cap: Vec::new(),
            source: SelectionSource::Static,
            updated_at: Utc::now(),
        }
    }

    /// Static list split into large-cap (first `large`) and mid-cap (next `mid`).
    pub fn from_static(inst_ids: &[String], quote: &str, large: usize, mid: usize) -> Self {
        let mut seen = HashSet::new();
        let instruments: Vec<Instrument> = inst_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .map(|id| {
                let suffix = format!("-{}", quote);
                let symbol = id.strip_suffix(&suffix).unwrap_or(id).to_string();
                Instrument {
                    symbol,
                    quote: quote.to_string(),
                    volume_24h: 0.0,
                    last_price: 0.0,
                    market_cap: 0.0,
                    market_cap_rank: None,
                    cap_is_proxy: false,
                    category: Category::SmallCap,
                }
            })
            .collect();

        let mut set = split_ranked(instruments, large, mid);
        set.source = SelectionSource::Static;
        set
    }

    /// Instrument ids, large-cap first, each group in rank order.
    pub fn symbols(&self) -> Vec<String> {
        self.large_cap
            .iter()
            .chain(self.mid_cap.iter())
            .map(Instrument::inst_id)
            .collect()
    }

    pub fn symbol_set(&self) -> HashSet<String> {
        self.symbols().into_iter().collect()
    }

    pub fn contains(&self, inst_id: &str) -> bool {
        self.category_of(inst_id).is_some()
    }

    pub fn category_of(&self, inst_id: &str) -> Option<Category> {
        self.large_cap
            .iter()
            .chain(self.mid_cap.iter())
            .find(|i| i.inst_id() == inst_id)
            .map(|i| i.category)
    }

    pub fn len(&self) -> usize {
        self.large_cap.len() + self.mid_cap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Attach capitalization to each ticker; missing caps fall back to volume x price.
pub fn enrich(tickers: &[MarketTicker], caps: &[MarketCapEntry], quote: &str) -> Vec<Instrument> {
    // Several assets can share a ticker symbol; the largest one wins.
    let mut by_symbol: HashMap<String, &MarketCapEntry> = HashMap::new();
    for cap in caps {
        let key = cap.symbol.to_ascii_uppercase();
        match by_symbol.get(&key) {
            Some(existing) if existing.market_cap >= cap.market_cap => {}
            _ => {
                by_symbol.insert(key, cap);
            }
        }
    }

    tickers
        .iter()
        .map(|t| {
            let base = t.base.to_ascii_uppercase();
            let (market_cap, rank, proxy) = match by_symbol.get(&base) {
                Some(cap) if cap.market_cap > 0.0 => (cap.market_cap, cap.rank, false),
                _ => (t.volume_24h * t.last_price, None, true),
            };
            Instrument {
                symbol: base,
                quote: quote.to_string(),
                volume_24h: t.volume_24h,
                last_price: t.last_price,
                market_cap,
                market_cap_rank: rank,
                cap_is_proxy: proxy,
                category: Category::SmallCap,
            }
        })
        .collect()
}

/// Rank by market cap (descending) and split into the active set.
pub fn select_pairs(mut instruments: Vec<Instrument>, large: usize, mid: usize) -> ActiveSymbolSet {
    instruments.sort_by(|a, b| {
        b.market_cap
            .total_cmp(&a.market_cap)
            .then_with(|| b.volume_24h.total_cmp(&a.volume_24h))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    let mut seen = HashSet::new();
    instruments.retain(|i| seen.insert(i.inst_id()));

    let mut set = split_ranked(instruments, large, mid);
    let any_proxy = set
        .large_cap
        .iter()
        .chain(set.mid_cap.iter())
        .any(|i| i.cap_is_proxy);
    set.source = if any_proxy {
        SelectionSource::Proxy
    } else {
        SelectionSource::Ranked
    };
    set
}

fn split_ranked(instruments: Vec<Instrument>, large: usize, mid: usize) -> ActiveSymbolSet {
    let mut large_cap = Vec::with_capacity(large);
    let mut mid_cap = Vec::with_capacity(mid);

    for (idx, mut inst) in instruments.into_iter().enumerate() {
        if idx < large {
            inst.category = Category::LargeCap;
            large_cap.push(inst);
        } else if idx < large + mid {
            inst.category = Category::MidCap;
            mid_cap.push(inst);
        } else {
            break;
        }
    }

    ActiveSymbolSet {
        large_cap,
        mid_cap,
        source: SelectionSource::Ranked,
        updated_at: Utc::now(),
    }
}

pub struct PairSelector {
    config: SelectorConfig,
    tickers: Arc<dyn TickerSource>,
    caps: Arc<dyn MarketCapSource>,
    tx: watch::Sender<Arc<ActiveSymbolSet>>,
}

impl PairSelector {
    /// Starts out publishing the static list so subscribers have something to
    /// work with before the first ranking completes.
    pub fn new(
        config: SelectorConfig,
        tickers: Arc<dyn TickerSource>,
        caps: Arc<dyn MarketCapSource>,
    ) -> Self {
        let initial = ActiveSymbolSet::from_static(
            &config.fallback_symbols,
            &config.quote,
            config.large_cap_count,
            config.mid_cap_count,
        );
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self {
            config,
            tickers,
            caps,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ActiveSymbolSet>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<ActiveSymbolSet> {
        self.tx.borrow().clone()
    }

    /// Recompute the active set and publish it. Never fails: source errors
    /// degrade to the previous ranking or the static list.
    pub async fn refresh(&self) -> Arc<ActiveSymbolSet> {
        let set = match self.rank().await {
            Ok(set) => set,
            Err(e) => self.degraded(e),
        };

        let set = Arc::new(set);
        info!(
            large_cap = set.large_cap.len(),
            mid_cap = set.mid_cap.len(),
            source = ?set.source,
            "active symbol set updated"
        );
        self.tx.send_replace(set.clone());
        set
    }

    async fn rank(&self) -> Result<ActiveSymbolSet, SourceError> {
        let quote = self.config.quote.as_str();
        let tickers: Vec<MarketTicker> = self
            .tickers
            .tickers(quote)
            .await?
            .into_iter()
            .filter(|t| t.last_price > 0.0 && t.base.to_ascii_uppercase() != quote)
            .collect();

        if tickers.is_empty() {
            return Err(SourceError::Empty { source_name: "tickers" });
        }

        let bases: Vec<String> = tickers.iter().map(|t| t.base.to_ascii_lowercase()).collect();
        let caps = match self.caps.market_caps(&bases).await {
            Ok(caps) => caps,
            Err(e) => {
                warn!(error = %e, "market cap source failed, ranking by volume proxy");
                Vec::new()
            }
        };

        let instruments = enrich(&tickers, &caps, quote);
        let proxied = instruments.iter().filter(|i| i.cap_is_proxy).count();
        if proxied > 0 {
            warn!(
                proxied,
                total = instruments.len(),
                "no market cap for some instruments, using volume x price proxy"
            );
        }

        Ok(select_pairs(
            instruments,
            self.config.large_cap_count,
            self.config.mid_cap_count,
        ))
    }

    fn degraded(&self, err: SourceError) -> ActiveSymbolSet {
        let previous = self.current();
        if !previous.is_empty() && previous.source != SelectionSource::Static {
            warn!(error = %err, "ticker snapshot unavailable, keeping previous ranking");
            let mut kept = (*previous).clone();
            kept.source = SelectionSource::Cached;
            return kept;
        }

        warn!(error = %err, "ticker snapshot unavailable and no ranking cached, installing static list");
        ActiveSymbolSet::from_static(
            &self.config.fallback_symbols,
            &self.config.quote,
            self.config.large_cap_count,
            self.config.mid_cap_count,
        )
    }

    /// Refresh once immediately, then on every interval until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = utils::interval_secs(self.config.refresh_interval.as_secs());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("pair selector stopped");
                    return;
                }
                _ = tick.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}
