use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Instruments and market data
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Side of the order that opens a position in this direction.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            other => Err(format!("unknown direction {}", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market-cap bucket. Declaration order is priority order (large before mid before small).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    LargeCap,
    MidCap,
    SmallCap,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::LargeCap => "large-cap",
            Category::MidCap => "mid-cap",
            Category::SmallCap => "small-cap",
        }
    }
}

/// Candle interval. Client-facing spelling is lower case (`15m`, `1h`, `1d`),
/// the exchange spells hours and days in upper case (`1H`, `1D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 11] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H12,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }

    /// Bar spelling used by the exchange for REST `bar=` and `candle<bar>` channels.
    pub fn exchange_bar(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1H",
            Timeframe::H2 => "2H",
            Timeframe::H4 => "4H",
            Timeframe::H6 => "6H",
            Timeframe::H12 => "12H",
            Timeframe::D1 => "1D",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H4 => 240,
            Timeframe::H6 => 360,
            Timeframe::H12 => 720,
            Timeframe::D1 => 1440,
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Minutes are case sensitive on the exchange ("1M" is a month there).
        if s.ends_with('M') {
            return Err(format!("unsupported timeframe {}", s));
        }
        let normalized = s.to_ascii_lowercase();
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == normalized)
            .ok_or_else(|| format!("unsupported timeframe {}", s))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Upstream market-data channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Ticker,
    Candle(Timeframe),
    Trade,
    Depth,
    Other(String),
}

impl Channel {
    pub fn wire_name(&self) -> String {
        match self {
            Channel::Ticker => "tickers".to_string(),
            Channel::Candle(tf) => format!("candle{}", tf.exchange_bar()),
            Channel::Trade => "trades".to_string(),
            Channel::Depth => "books5".to_string(),
            Channel::Other(name) => name.clone(),
        }
    }

    pub fn from_wire(name: &str) -> Self {
        match name {
            "tickers" => Channel::Ticker,
            "trades" => Channel::Trade,
            "books5" => Channel::Depth,
            other => {
                if let Some(bar) = other.strip_prefix("candle") {
                    if let Some(tf) = Timeframe::ALL.iter().find(|tf| tf.exchange_bar() == bar) {
                        return Channel::Candle(*tf);
                    }
                }
                Channel::Other(other.to_string())
            }
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.wire_name())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Channel::from_wire(&raw))
    }
}

/// One upstream subscription argument: `{channel, instId}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelArg {
    pub channel: Channel,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

impl ChannelArg {
    pub fn new(channel: Channel, inst_id: impl Into<String>) -> Self {
        Self {
            channel,
            inst_id: inst_id.into(),
        }
    }
}

/// A ranked tradable instrument quoted against the stable quote currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Base asset, e.g. `BTC`.
    pub symbol: String,
    pub quote: String,
    pub volume_24h: f64,
    pub last_price: f64,
    pub market_cap: f64,
    pub market_cap_rank: Option<u32>,
    /// True when `market_cap` is the volume x price proxy.
    pub cap_is_proxy: bool,
    pub category: Category,
}

impl Instrument {
    /// Exchange instrument id, e.g. `BTC-USDT`.
    pub fn inst_id(&self) -> String {
        format!("{}-{}", self.symbol, self.quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub last: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub open_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub volume_24h: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePrint {
    pub trade_id: String,
    pub price: f64,
    pub size: f64,
    pub side: String,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthBook {
    /// (price, size), best first.
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts: i64,
}

/// Normalised upstream payload, validated at the parsing boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MarketPayload {
    Ticker(Ticker),
    Candle(Candle),
    Trades(Vec<TradePrint>),
    Depth(DepthBook),
    Other(serde_json::Value),
}

impl MarketPayload {
    /// Last traded price carried by the payload, if it carries one.
    pub fn last_price(&self) -> Option<f64> {
        match self {
            MarketPayload::Ticker(t) => Some(t.last),
            MarketPayload::Candle(c) => Some(c.close),
            MarketPayload::Trades(trades) => trades.last().map(|t| t.price),
            MarketPayload::Depth(_) | MarketPayload::Other(_) => None,
        }
    }
}

/// Uniform `{symbol, channel, payload, timestamp}` event emitted by the feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub channel: Channel,
    pub payload: MarketPayload,
    /// Receipt time, milliseconds since epoch.
    pub timestamp: i64,
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub timeframe: Timeframe,
}

/// Deduplication key: at most one live signal per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub symbol: String,
    pub direction: Direction,
    pub timeframe: Timeframe,
}

impl SignalKey {
    pub fn new(symbol: &str, direction: Direction, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction,
            timeframe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSource {
    Volatility,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredSignal {
    #[serde(flatten)]
    pub signal: RawSignal,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward_ratio: f64,
    pub risk_source: RiskSource,
    pub expires_at: DateTime<Utc>,
    pub category: Category,
}

impl FilteredSignal {
    pub fn key(&self) -> SignalKey {
        SignalKey::new(&self.signal.symbol, self.signal.direction, self.signal.timeframe)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// Orders and trade intents
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Base-asset quantity.
    pub quantity: f64,
    /// Reference price the quantity was sized at.
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub symbol: String,
    /// Side that closes the position.
    pub side: OrderSide,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed base quantity: positive long, negative short.
    pub quantity: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Executed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeIntent {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Quote-currency notional allocated to the trade.
    pub size: f64,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: TradeStatus,
    pub order_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TradeIntent {
    pub fn pending(
        symbol: &str,
        direction: Direction,
        size: f64,
        price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Self {
        let quantity = if price > 0.0 { size / price } else { 0.0 };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            direction,
            size,
            quantity,
            price,
            stop_loss,
            take_profit,
            status: TradeStatus::Pending,
            order_id: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn executed(mut self, order_id: String) -> Self {
        self.status = TradeStatus::Executed;
        self.order_id = Some(order_id);
        self
    }

    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.status = TradeStatus::Failed;
        self.error = Some(error.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!("15m".parse::<Timeframe>(), Ok(Timeframe::M15));
        assert_eq!("1H".parse::<Timeframe>(), Ok(Timeframe::H1));
        assert_eq!("1d".parse::<Timeframe>(), Ok(Timeframe::D1));
        assert!("7m".parse::<Timeframe>().is_err());
        assert!("1M".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(Channel::from_wire("candle15m"), Channel::Candle(Timeframe::M15));
        assert_eq!(Channel::from_wire("candle4H"), Channel::Candle(Timeframe::H4));
        assert_eq!(Channel::Candle(Timeframe::D1).wire_name(), "candle1D");
        assert_eq!(Channel::from_wire("tickers"), Channel::Ticker);
        assert_eq!(
            Channel::from_wire("funding-rate"),
            Channel::Other("funding-rate".to_string())
        );
    }

    #[test]
    fn test_category_priority_order() {
        assert!(Category::LargeCap < Category::MidCap);
        assert!(Category::MidCap < Category::SmallCap);
    }

    #[test]
    fn test_trade_intent_quantity() {
        let intent = TradeIntent::pending("BTC-USDT", Direction::Long, 180.0, 60.0, None, None);
        assert_eq!(intent.status, TradeStatus::Pending);
        assert!((intent.quantity - 3.0).abs() < 1e-12);

        let failed = intent.failed("boom");
        assert_eq!(failed.status, TradeStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_direction_serde() {
        let json = serde_json::to_string(&Direction::Short).unwrap();
        assert_eq!(json, "\"SHORT\"");
        assert_eq!("buy".parse::<Direction>(), Ok(Direction::Long));
    }
}
