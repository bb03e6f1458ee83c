use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::TradingError;
use crate::strategy::execution_backend::TradingApi;
use crate::strategy::types::{
    OrderAck, OrderRecord, OrderRequest, OrderSide, OrderStatus, Position, ProtectiveOrder,
};
use crate::utils;

/// Paper trading backend - simulates order execution without real money.
///
/// Orders fill immediately at the request price. A fill that opens exposure,
/// long or short, reserves its notional from the balance as margin; a fill that
/// reduces a position releases that margin together with the realised PnL.
pub struct PaperTradingBackend {
    balance: Arc<RwLock<f64>>,
    positions: Arc<RwLock<HashMap<String, Position>>>,
    /// Newest last
    ledger: Arc<RwLock<Vec<OrderRecord>>>,
    protective: Arc<RwLock<HashMap<String, ProtectiveOrder>>>,
}

impl PaperTradingBackend {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            balance: Arc::new(RwLock::new(initial_balance)),
            positions: Arc::new(RwLock::new(HashMap::new())),
            ledger: Arc::new(RwLock::new(Vec::new())),
            protective: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn protective_order(&self, symbol: &str) -> Option<ProtectiveOrder> {
        self.protective.read().await.get(symbol).cloned()
    }
}

#[async_trait::async_trait]
impl TradingApi for PaperTradingBackend {
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, TradingError> {
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(TradingError::InvalidSize(order.quantity));
        }
        if !(order.price.is_finite() && order.price > 0.0) {
            return Err(TradingError::MissingPrice(order.symbol));
        }

        let signed = match order.side {
            OrderSide::Buy => order.quantity,
            OrderSide::Sell => -order.quantity,
        };
        {
            let mut positions = self.positions.write().await;
            let (held, avg_price) = positions
                .get(&order.symbol)
                .map(|p| (p.quantity, p.avg_price))
                .unwrap_or((0.0, 0.0));

            // Part of the fill that closes existing exposure; the rest opens new exposure
            let reducing = if held * signed < 0.0 {
                order.quantity.min(held.abs())
            } else {
                0.0
            };
            let opening = order.quantity - reducing;
            let released = reducing * avg_price + reducing * (order.price - avg_price) * held.signum();
            let reserved = opening * order.price;
            {
                let mut balance = self.balance.write().await;
                if reserved > *balance + released {
                    return Err(TradingError::InsufficientBalance(*balance));
                }
                *balance += released - reserved;
            }

            let position = positions.entry(order.symbol.clone()).or_insert_with(|| Position {
                symbol: order.symbol.clone(),
                quantity: 0.0,
                avg_price: 0.0,
            });
            if reducing == 0.0 {
                let total = held.abs() + order.quantity;
                position.avg_price = (avg_price * held.abs() + order.price * order.quantity) / total;
            } else if opening > 0.0 {
                position.avg_price = order.price;
            }
            position.quantity = held + signed;
            if position.quantity.abs() < f64::EPSILON {
                positions.remove(&order.symbol);
            }
        }

        let order_id = if order.client_order_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            order.client_order_id.clone()
        };

        self.ledger.write().await.push(OrderRecord {
            order_id: order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            status: OrderStatus::Filled,
            created_at: utils::now_ms(),
        });

        info!(order_id = %order_id, symbol = %order.symbol, side = order.side.as_str(), quantity = order.quantity, price = order.price, "paper order filled");

        Ok(OrderAck {
            order_id,
            symbol: order.symbol,
            status: OrderStatus::Filled,
            fill_price: Some(order.price),
        })
    }

    async fn place_stop_take_profit(&self, order: ProtectiveOrder) -> Result<OrderAck, TradingError> {
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(TradingError::InvalidSize(order.quantity));
        }
        let order_id = Uuid::new_v4().to_string();
        let symbol = order.symbol.clone();
        self.protective.write().await.insert(symbol.clone(), order);
        Ok(OrderAck {
            order_id,
            symbol,
            status: OrderStatus::Pending,
            fill_price: None,
        })
    }

    async fn get_balance(&self) -> Result<f64, TradingError> {
        Ok(*self.balance.read().await)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, TradingError> {
        let positions = self.positions.read().await;
        Ok(positions.values().cloned().collect())
    }

    async fn get_order_history(&self, limit: usize) -> Result<Vec<OrderRecord>, TradingError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.iter().rev().take(limit).cloned().collect())
    }

    fn backend_name(&self) -> &str {
        "PaperTrading"
    }
}
