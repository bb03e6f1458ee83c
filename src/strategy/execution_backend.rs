use crate::error::TradingError;
use crate::strategy::types::{OrderAck, OrderRecord, OrderRequest, Position, ProtectiveOrder};

/// Exchange trading API (paper, simulated or live). All calls are keyed by
/// instrument id.
#[async_trait::async_trait]
pub trait TradingApi: Send + Sync {
    /// Place a market order sized in base-asset quantity
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, TradingError>;

    /// Attach a stop-loss / take-profit pair to an open position
    async fn place_stop_take_profit(&self, order: ProtectiveOrder) -> Result<OrderAck, TradingError>;

    /// Available balance in the quote currency
    async fn get_balance(&self) -> Result<f64, TradingError>;

    async fn get_positions(&self) -> Result<Vec<Position>, TradingError>;

    /// Most recent orders first, at most `limit`
    async fn get_order_history(&self, limit: usize) -> Result<Vec<OrderRecord>, TradingError>;

    /// Get the name of this backend (for logging)
    fn backend_name(&self) -> &str;
}
