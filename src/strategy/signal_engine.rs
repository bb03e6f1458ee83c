//! Prediction filtering: confidence gate, active-set gate, deduplication,
//! risk annotation and TTL.
//!
//! The engine is owned by a single task and mutated through `&mut self`; the
//! registries are never shared.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RiskConfig, SignalConfig};
use crate::error::SourceError;
use crate::strategy::client_hub::ClientHub;
use crate::strategy::orchestrator::TradeOrchestrator;
use crate::strategy::pair_selector::ActiveSymbolSet;
use crate::strategy::risk;
use crate::strategy::types::{Candle, Direction, FilteredSignal, RawSignal, SignalKey, Timeframe};
use crate::utils;

#[async_trait::async_trait]
pub trait PredictionSource: Send + Sync {
    async fn predict(&self, pairs: &[String], timeframe: Timeframe) -> Result<Vec<RawSignal>, SourceError>;
}

#[async_trait::async_trait]
pub trait CandleSource: Send + Sync {
    /// Recent candles, oldest first.
    async fn candles(&self, inst_id: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, SourceError>;
}

/// True when no signal with the same (symbol, direction, timeframe) was
/// emitted less than `window_minutes` before this one.
pub fn is_unique(
    signal: &RawSignal,
    recent: &HashMap<SignalKey, DateTime<Utc>>,
    window_minutes: i64,
) -> bool {
    let key = SignalKey::new(&signal.symbol, signal.direction, signal.timeframe);
    match recent.get(&key) {
        Some(previous) => {
            let elapsed = signal.timestamp.signed_duration_since(*previous);
            elapsed.num_milliseconds().abs() >= window_minutes * 60_000
        }
        None => true,
    }
}

pub struct SignalEngine {
    config: SignalConfig,
    risk: RiskConfig,
    /// Last emission time per key, kept for the uniqueness window.
    recent: HashMap<SignalKey, DateTime<Utc>>,
    /// Live signals, evicted once past their expiry.
    active: HashMap<SignalKey, FilteredSignal>,
}

impl SignalEngine {
    pub fn new(config: SignalConfig, risk: RiskConfig) -> Self {
        Self {
            config,
            risk,
            recent: HashMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Run one filtering pass. `candles` maps instrument id to recent candles
    /// (oldest first) and may be missing symbols; those get fallback risk.
    pub fn filter(
        &mut self,
        raw: Vec<RawSignal>,
        timeframe: Timeframe,
        active_set: &ActiveSymbolSet,
        candles: &HashMap<String, Vec<Candle>>,
        now: DateTime<Utc>,
    ) -> Vec<FilteredSignal> {
        self.sweep(now);

        let window = self.config.window_minutes(timeframe);
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or_else(|_| chrono::Duration::seconds(20));
        let mut seen_in_batch: HashSet<(String, Direction)> = HashSet::new();
        let mut accepted = Vec::new();

        for mut signal in raw {
            signal.timeframe = timeframe;

            if !(0.0..=1.0).contains(&signal.confidence) || signal.confidence < self.config.min_confidence {
                continue;
            }
            let category = match active_set.category_of(&signal.symbol) {
                Some(c) => c,
                None => {
                    debug!(symbol = %signal.symbol, "signal for symbol outside active set dropped");
                    continue;
                }
            };
            if !seen_in_batch.insert((signal.symbol.clone(), signal.direction)) {
                continue;
            }

            let key = SignalKey::new(&signal.symbol, signal.direction, timeframe);
            if self.active.contains_key(&key) || !is_unique(&signal, &self.recent, window) {
                debug!(symbol = %signal.symbol, direction = %signal.direction, "duplicate signal within window");
                continue;
            }

            let expires_at = signal.timestamp + ttl;
            if now >= expires_at {
                continue;
            }

            let series = candles.get(&signal.symbol).map(Vec::as_slice).unwrap_or(&[]);
            if !(signal.price.is_finite() && signal.price > 0.0) {
                match series.last() {
                    Some(c) => signal.price = c.close,
                    None => {
                        debug!(symbol = %signal.symbol, "signal without price dropped");
                        continue;
                    }
                }
            }

            let (levels, risk_source) = risk::compute_risk(signal.direction, signal.price, series, &self.risk);

            let filtered = FilteredSignal {
                signal,
                stop_loss: levels.stop_loss,
                take_profit: levels.take_profit,
                risk_reward_ratio: levels.risk_reward_ratio,
                risk_source,
                expires_at,
                category,
            };

            self.recent.insert(key.clone(), filtered.signal.timestamp);
            self.active.insert(key, filtered.clone());
            accepted.push(filtered);
        }

        accepted
    }

    /// Evict expired live signals and uniqueness entries past their window.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.active.len();
        self.active.retain(|_, s| !s.is_expired(now));
        let evicted = before - self.active.len();

        let config = &self.config;
        self.recent.retain(|key, emitted| {
            let window = chrono::Duration::minutes(config.window_minutes(key.timeframe));
            now.signed_duration_since(*emitted) < window
        });

        evicted
    }

    /// Live signals after lazy eviction, highest confidence first.
    pub fn active_signals(&mut self, now: DateTime<Utc>) -> Vec<FilteredSignal> {
        self.sweep(now);
        let mut out: Vec<FilteredSignal> = self.active.values().cloned().collect();
        out.sort_by(|a, b| b.signal.confidence.total_cmp(&a.signal.confidence));
        out
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Periodic prediction -> filter -> broadcast -> auto-trade loop.
pub struct SignalService {
    engine: SignalEngine,
    predictions: Arc<dyn PredictionSource>,
    candles: Arc<dyn CandleSource>,
    active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
    hub: Arc<ClientHub>,
    orchestrator: Option<Arc<TradeOrchestrator>>,
}

impl SignalService {
    pub fn new(
        engine: SignalEngine,
        predictions: Arc<dyn PredictionSource>,
        candles: Arc<dyn CandleSource>,
        active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
        hub: Arc<ClientHub>,
        orchestrator: Option<Arc<TradeOrchestrator>>,
    ) -> Self {
        Self {
            engine,
            predictions,
            candles,
            active_set,
            hub,
            orchestrator,
        }
    }

    async fn fetch_candles(&self, symbols: &[String], timeframe: Timeframe) -> HashMap<String, Vec<Candle>> {
        let limit = self.engine.config().candle_limit;
        let fetches = symbols.iter().map(|symbol| async move {
            let result = self.candles.candles(symbol, timeframe, limit).await;
            (symbol.clone(), result)
        });

        let mut out = HashMap::new();
        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(series) => {
                    out.insert(symbol, series);
                }
                Err(e) => debug!(symbol = %symbol, error = %e, "candles unavailable"),
            }
        }
        out
    }

    /// One pipeline cycle. Returns the signals accepted in this cycle.
    pub async fn run_cycle(&mut self) -> Vec<FilteredSignal> {
        let set = self.active_set.borrow().clone();
        let timeframe = self.engine.config().timeframe;
        let pairs = set.symbols();
        if pairs.is_empty() {
            return Vec::new();
        }

        let raw = match self.predictions.predict(&pairs, timeframe).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "prediction source unavailable, skipping cycle");
                return Vec::new();
            }
        };

        let min_confidence = self.engine.config().min_confidence;
        let mut candidates: Vec<String> = raw
            .iter()
            .filter(|s| s.confidence >= min_confidence && set.contains(&s.symbol))
            .map(|s| s.symbol.clone())
            .collect();
        candidates.sort();
        candidates.dedup();

        let candles = self.fetch_candles(&candidates, timeframe).await;
        let received = raw.len();
        let accepted = self.engine.filter(raw, timeframe, &set, &candles, Utc::now());

        info!(received, accepted = accepted.len(), live = self.engine.active_count(), "signal cycle complete");

        if !accepted.is_empty() {
            self.hub.broadcast_signals(&accepted).await;
            if let Some(orchestrator) = &self.orchestrator {
                orchestrator.execute_auto_trades(&accepted).await;
            }
        }
        accepted
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let interval_secs = self.engine.config().interval.as_secs();
        let mut cycle = utils::interval_secs(interval_secs);
        let mut sweep = utils::interval_secs(1);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("signal service stopped");
                    return;
                }
                _ = cycle.tick() => {
                    self.run_cycle().await;
                }
                _ = sweep.tick() => {
                    let evicted = self.engine.sweep(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, "expired signals evicted");
                    }
                }
            }
        }
    }
}
