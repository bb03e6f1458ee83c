//! Turns accepted signals into sized orders against a `TradingApi`.
//!
//! A batch is capped at the free concurrency slots, funded with a fixed
//! fraction of the available balance split evenly, and executed candidate by
//! candidate so one rejection never stops the rest.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TradingConfig;
use crate::error::TradingError;
use crate::strategy::execution_backend::TradingApi;
use crate::strategy::market_cache::MarketCache;
use crate::strategy::pair_selector::ActiveSymbolSet;
use crate::strategy::types::{Direction, FilteredSignal, OrderRequest, ProtectiveOrder, TradeIntent};

pub struct TradeOrchestrator {
    api: Arc<dyn TradingApi>,
    cache: Arc<MarketCache>,
    active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
    config: TradingConfig,
}

/// Large-cap before mid-cap, then higher confidence first.
pub fn prioritize(candidates: &mut [FilteredSignal]) {
    candidates.sort_by(|a, b| {
        a.category.cmp(&b.category).then_with(|| {
            b.signal
                .confidence
                .partial_cmp(&a.signal.confidence)
                .unwrap_or(Ordering::Equal)
        })
    });
}

impl TradeOrchestrator {
    pub fn new(
        api: Arc<dyn TradingApi>,
        cache: Arc<MarketCache>,
        active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
        config: TradingConfig,
    ) -> Self {
        Self {
            api,
            cache,
            active_set,
            config,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.api.backend_name()
    }

    async fn open_position_count(&self) -> usize {
        match self.api.get_positions().await {
            Ok(positions) => positions.len(),
            Err(e) => {
                warn!(error = %e, "positions unavailable, assuming no open trades");
                0
            }
        }
    }

    pub async fn execute_auto_trades(&self, signals: &[FilteredSignal]) -> Vec<TradeIntent> {
        if signals.is_empty() {
            return Vec::new();
        }

        let balance = match self.api.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "balance unavailable, skipping auto-trade batch");
                return Vec::new();
            }
        };
        if balance <= 0.0 {
            warn!(balance, "no available balance, skipping auto-trade batch");
            return Vec::new();
        }

        let now = Utc::now();
        let active = self.active_set.borrow().clone();
        let mut candidates: Vec<FilteredSignal> = signals
            .iter()
            .filter(|s| !s.is_expired(now))
            .filter(|s| {
                let approved = active.contains(&s.signal.symbol);
                if !approved {
                    warn!(symbol = %s.signal.symbol, "dropping signal for symbol outside active set");
                }
                approved
            })
            .cloned()
            .collect();

        let open = self.open_position_count().await;
        let slots = self.config.max_concurrent_trades.saturating_sub(open);
        if slots == 0 || candidates.is_empty() {
            info!(open, candidates = candidates.len(), "no trade slots or candidates available");
            return Vec::new();
        }

        prioritize(&mut candidates);
        candidates.truncate(slots);

        let per_trade = balance * self.config.balance_allocation / candidates.len() as f64;
        info!(
            backend = self.api.backend_name(),
            balance,
            trades = candidates.len(),
            per_trade,
            "executing auto-trade batch"
        );

        let mut intents = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let intent = self
                .execute_trade(
                    &candidate.signal.symbol,
                    candidate.signal.direction,
                    per_trade,
                    Some(candidate.signal.price),
                    Some(candidate.stop_loss),
                    Some(candidate.take_profit),
                )
                .await;
            intents.push(intent);
        }
        intents
    }

    pub async fn execute_trade(
        &self,
        symbol: &str,
        direction: Direction,
        size: f64,
        price: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradeIntent {
        let resolved = price.filter(|p| *p > 0.0).or_else(|| self.cache.last_price(symbol));
        let intent = TradeIntent::pending(
            symbol,
            direction,
            size,
            resolved.unwrap_or(0.0),
            stop_loss,
            take_profit,
        );

        let approved = self.active_set.borrow().contains(symbol);
        let result = if !approved {
            Err(TradingError::SymbolNotApproved(symbol.to_string()))
        } else if resolved.is_none() {
            Err(TradingError::MissingPrice(symbol.to_string()))
        } else if !(size.is_finite() && size > 0.0) || intent.quantity <= 0.0 {
            Err(TradingError::InvalidSize(size))
        } else {
            self.submit(&intent).await
        };

        match result {
            Ok(order_id) => {
                info!(symbol, direction = direction.as_str(), size, price = intent.price, order_id = %order_id, "trade executed");
                intent.executed(order_id)
            }
            Err(e) => {
                warn!(symbol, direction = direction.as_str(), size, error = %e, "trade failed");
                intent.failed(e)
            }
        }
    }

    async fn submit(&self, intent: &TradeIntent) -> Result<String, TradingError> {
        let side = intent.direction.entry_side();
        let ack = self
            .api
            .place_order(OrderRequest {
                client_order_id: Uuid::new_v4().simple().to_string(),
                symbol: intent.symbol.clone(),
                side,
                quantity: intent.quantity,
                price: intent.price,
            })
            .await?;

        if let (Some(stop_loss), Some(take_profit)) = (intent.stop_loss, intent.take_profit) {
            let protective = ProtectiveOrder {
                symbol: intent.symbol.clone(),
                side: side.opposite(),
                quantity: intent.quantity,
                stop_loss,
                take_profit,
            };
            if let Err(e) = self.api.place_stop_take_profit(protective).await {
                warn!(symbol = %intent.symbol, order_id = %ack.order_id, error = %e, "protective order failed");
            }
        }

        Ok(ack.order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::types::{Category, RawSignal, RiskSource, Timeframe};

    fn signal(symbol: &str, category: Category, confidence: f64) -> FilteredSignal {
        FilteredSignal {
            signal: RawSignal {
                symbol: symbol.to_string(),
                direction: Direction::Long,
                confidence,
                price: 10.0,
                timeframe: Timeframe::M15,
                timestamp: Utc::now(),
            },
            stop_loss: 9.0,
            take_profit: 12.0,
            risk_reward_ratio: 2.0,
            risk_source: RiskSource::Fallback,
            expires_at: Utc::now() + chrono::Duration::seconds(20),
            category,
        }
    }

    #[test]
    fn test_prioritize_large_cap_then_confidence() {
        let mut batch = vec![
            signal("SOL-USDT", Category::MidCap, 0.95),
            signal("ETH-USDT", Category::LargeCap, 0.70),
            signal("BTC-USDT", Category::LargeCap, 0.90),
        ];
        prioritize(&mut batch);
        let order: Vec<&str> = batch.iter().map(|s| s.signal.symbol.as_str()).collect();
        assert_eq!(order, vec!["BTC-USDT", "ETH-USDT", "SOL-USDT"]);
    }
}
