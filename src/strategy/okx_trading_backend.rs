//! Signed OKX v5 REST trading client. With `simulated` set every request
//! carries the demo-trading header and routes to the paper environment.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{OkxCredentials, TradingConfig};
use crate::error::TradingError;
use crate::exchange_parser::parse_num;
use crate::strategy::execution_backend::TradingApi;
use crate::strategy::rate_limiter::RateLimiter;
use crate::strategy::types::{
    OrderAck, OrderRecord, OrderRequest, OrderSide, OrderStatus, Position, ProtectiveOrder,
};

type HmacSha256 = Hmac<Sha256>;

const ORDER_PATH: &str = "/api/v5/trade/order";
const ALGO_ORDER_PATH: &str = "/api/v5/trade/order-algo";
const BALANCE_PATH: &str = "/api/v5/account/balance";
const POSITIONS_PATH: &str = "/api/v5/account/positions";
const HISTORY_PATH: &str = "/api/v5/trade/orders-history";

pub struct OkxTradingBackend {
    client: Client,
    base_url: String,
    credentials: OkxCredentials,
    quote: String,
    trade_mode: String,
    simulated: bool,
    limiter: RateLimiter,
}

impl OkxTradingBackend {
    pub fn new(
        base_url: &str,
        credentials: OkxCredentials,
        quote: &str,
        config: &TradingConfig,
        timeout: Duration,
    ) -> Result<Self, TradingError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            quote: quote.to_string(),
            trade_mode: config.trade_mode.clone(),
            simulated: config.simulated,
            limiter: RateLimiter::new(config.order_rate_limit, config.order_rate_limit),
        })
    }

    /// Signature over timestamp + METHOD + request path (with query) + body.
    fn generate_signature(
        &self,
        timestamp: &str,
        method: &Method,
        request_path: &str,
        body: &str,
    ) -> Result<String, TradingError> {
        sign(&self.credentials.api_secret, timestamp, method, request_path, body)
    }

    async fn request(&self, method: Method, request_path: &str, body: Option<Value>) -> Result<Vec<Value>, TradingError> {
        self.limiter.acquire().await;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let signature = self.generate_signature(&timestamp, &method, request_path, &body_str)?;

        let url = format!("{}{}", self.base_url, request_path);
        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", &timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json");
        if self.simulated {
            builder = builder.header("x-simulated-trading", "1");
        }
        if !body_str.is_empty() {
            builder = builder.body(body_str);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TradingError::Timeout
            } else {
                TradingError::Http(e)
            }
        })?;
        let text = response.text().await?;
        debug!(method = %method, path = request_path, "okx trading response received");
        parse_envelope(&text)
    }
}

fn sign(secret: &str, timestamp: &str, method: &Method, request_path: &str, body: &str) -> Result<String, TradingError> {
    let message = format!("{}{}{}{}", timestamp, method.as_str(), request_path, body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| TradingError::Api {
        code: "signing".to_string(),
        message: e.to_string(),
    })?;
    mac.update(message.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Unwraps `{code, msg, data}`. A zero envelope code can still carry a per-row
/// `sCode` rejection, which is surfaced as an error too.
fn parse_envelope(text: &str) -> Result<Vec<Value>, TradingError> {
    let value: Value = serde_json::from_str(text)?;
    let code = value.get("code").and_then(|c| c.as_str()).unwrap_or("0");
    let data = value
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();

    if code != "0" {
        let (code, message) = data
            .first()
            .and_then(|row| {
                let s_code = row.get("sCode")?.as_str()?;
                let s_msg = row.get("sMsg").and_then(|m| m.as_str()).unwrap_or_default();
                Some((s_code.to_string(), s_msg.to_string()))
            })
            .unwrap_or_else(|| {
                let msg = value.get("msg").and_then(|m| m.as_str()).unwrap_or("Unknown error");
                (code.to_string(), msg.to_string())
            });
        return Err(TradingError::Api { code, message });
    }

    if let Some(row) = data.first() {
        if let Some(s_code) = row.get("sCode").and_then(|c| c.as_str()) {
            if s_code != "0" {
                let message = row.get("sMsg").and_then(|m| m.as_str()).unwrap_or_default();
                return Err(TradingError::Api {
                    code: s_code.to_string(),
                    message: message.to_string(),
                });
            }
        }
    }

    Ok(data)
}

fn str_field<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

fn num_field(row: &Value, key: &str) -> Option<f64> {
    row.get(key).and_then(parse_num)
}

fn order_status(state: &str) -> OrderStatus {
    match state {
        "filled" => OrderStatus::Filled,
        "canceled" | "mmp_canceled" => OrderStatus::Cancelled,
        "live" | "partially_filled" => OrderStatus::Pending,
        _ => OrderStatus::Rejected,
    }
}

fn available_balance(rows: &[Value], quote: &str) -> Option<f64> {
    rows.iter()
        .filter_map(|row| row.get("details").and_then(|d| d.as_array()))
        .flatten()
        .find(|detail| str_field(detail, "ccy").eq_ignore_ascii_case(quote))
        .and_then(|detail| num_field(detail, "availBal").or_else(|| num_field(detail, "cashBal")))
}

fn parse_position(row: &Value) -> Option<Position> {
    let symbol = str_field(row, "instId");
    let mut quantity = num_field(row, "pos")?;
    if quantity == 0.0 || symbol.is_empty() {
        return None;
    }
    if str_field(row, "posSide") == "short" {
        quantity = -quantity.abs();
    }
    Some(Position {
        symbol: symbol.to_string(),
        quantity,
        avg_price: num_field(row, "avgPx").unwrap_or(0.0),
    })
}

fn parse_order_record(row: &Value) -> Option<OrderRecord> {
    let side = match str_field(row, "side") {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        _ => return None,
    };
    Some(OrderRecord {
        order_id: str_field(row, "ordId").to_string(),
        symbol: str_field(row, "instId").to_string(),
        side,
        quantity: num_field(row, "accFillSz").or_else(|| num_field(row, "sz")).unwrap_or(0.0),
        price: num_field(row, "avgPx").or_else(|| num_field(row, "px")).unwrap_or(0.0),
        status: order_status(str_field(row, "state")),
        created_at: str_field(row, "cTime").parse().unwrap_or(0),
    })
}

fn format_qty(value: f64) -> String {
    let s = format!("{:.8}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[async_trait]
impl TradingApi for OkxTradingBackend {
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, TradingError> {
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(TradingError::InvalidSize(order.quantity));
        }

        let mut body = json!({
            "instId": order.symbol,
            "tdMode": self.trade_mode,
            "side": order.side.as_str(),
            "ordType": "market",
            "sz": format_qty(order.quantity),
            "tgtCcy": "base_ccy",
        });
        if !order.client_order_id.is_empty() {
            body["clOrdId"] = Value::String(order.client_order_id.clone());
        }

        let rows = self.request(Method::POST, ORDER_PATH, Some(body)).await?;
        let order_id = rows
            .first()
            .map(|row| str_field(row, "ordId").to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TradingError::Api {
                code: "missing_order_id".to_string(),
                message: "order response carried no ordId".to_string(),
            })?;

        info!(order_id = %order_id, symbol = %order.symbol, side = order.side.as_str(), quantity = order.quantity, "okx market order accepted");

        // Market orders report their fill asynchronously; the reference price stands in.
        Ok(OrderAck {
            order_id,
            symbol: order.symbol,
            status: OrderStatus::Filled,
            fill_price: Some(order.price),
        })
    }

    async fn place_stop_take_profit(&self, order: ProtectiveOrder) -> Result<OrderAck, TradingError> {
        let body = json!({
            "instId": order.symbol,
            "tdMode": self.trade_mode,
            "side": order.side.as_str(),
            "ordType": "oco",
            "sz": format_qty(order.quantity),
            "tpTriggerPx": order.take_profit.to_string(),
            "tpOrdPx": "-1",
            "slTriggerPx": order.stop_loss.to_string(),
            "slOrdPx": "-1",
        });

        let rows = self.request(Method::POST, ALGO_ORDER_PATH, Some(body)).await?;
        let order_id = rows
            .first()
            .map(|row| str_field(row, "algoId").to_string())
            .unwrap_or_default();

        Ok(OrderAck {
            order_id,
            symbol: order.symbol,
            status: OrderStatus::Pending,
            fill_price: None,
        })
    }

    async fn get_balance(&self) -> Result<f64, TradingError> {
        let path = format!("{}?ccy={}", BALANCE_PATH, self.quote);
        let rows = self.request(Method::GET, &path, None).await?;
        match available_balance(&rows, &self.quote) {
            Some(balance) => Ok(balance),
            None => {
                warn!(quote = %self.quote, "balance response had no entry for quote currency");
                Ok(0.0)
            }
        }
    }

    async fn get_positions(&self) -> Result<Vec<Position>, TradingError> {
        let rows = self.request(Method::GET, POSITIONS_PATH, None).await?;
        Ok(rows.iter().filter_map(parse_position).collect())
    }

    async fn get_order_history(&self, limit: usize) -> Result<Vec<OrderRecord>, TradingError> {
        let path = format!("{}?instType=SPOT&limit={}", HISTORY_PATH, limit.clamp(1, 100));
        let rows = self.request(Method::GET, &path, None).await?;
        Ok(rows.iter().filter_map(parse_order_record).take(limit).collect())
    }

    fn backend_name(&self) -> &str {
        if self.simulated {
            "OkxDemo"
        } else {
            "OkxLive"
        }
    }
}
