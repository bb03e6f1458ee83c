//! Process configuration, read once at startup.
//!
//! Every option has a default. A value that is present but malformed is an
//! error rather than a silent fallback to the default.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::exchange_parser::normalize_symbol;
use crate::okx::{OKX_BASE_URL, OKX_WS_PUBLIC_URL};
use crate::strategy::types::{Channel, Timeframe};

const DEFAULT_FALLBACK_SYMBOLS: &[&str] = &[
    "BTC", "ETH", "SOL", "XRP", "BNB", "DOGE", "ADA", "AVAX", "LINK", "DOT",
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub okx_rest_url: String,
    pub ranking_api_url: String,
    pub prediction_api_url: String,
    pub http_timeout: Duration,
    pub selector: SelectorConfig,
    pub feed: FeedConfig,
    pub hub: HubConfig,
    pub signal: SignalConfig,
    pub risk: RiskConfig,
    pub trading: TradingConfig,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub large_cap_count: usize,
    pub mid_cap_count: usize,
    pub refresh_interval: Duration,
    /// Instrument ids installed when no ranking has ever succeeded.
    pub fallback_symbols: Vec<String>,
    pub quote: String,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub reconnect_base_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_max_attempts: u32,
    pub connect_timeout: Duration,
    /// Channels subscribed for every active symbol.
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub quote: String,
    pub ping_interval: Duration,
    pub max_clients: usize,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub min_confidence: f64,
    pub ttl: Duration,
    pub timeframe: Timeframe,
    pub interval: Duration,
    /// Minutes during which a repeated (symbol, direction, timeframe) is rejected.
    pub uniqueness_windows: HashMap<Timeframe, i64>,
    pub candle_limit: usize,
}

impl SignalConfig {
    pub fn window_minutes(&self, timeframe: Timeframe) -> i64 {
        self.uniqueness_windows
            .get(&timeframe)
            .copied()
            .unwrap_or_else(|| default_window_minutes(timeframe))
    }
}

pub fn default_window_minutes(timeframe: Timeframe) -> i64 {
    match timeframe {
        Timeframe::M1 => 5,
        Timeframe::M3 => 10,
        Timeframe::M5 => 15,
        Timeframe::M15 => 60,
        Timeframe::M30 => 120,
        Timeframe::H1 => 240,
        Timeframe::H2 => 360,
        Timeframe::H4 => 720,
        Timeframe::H6 => 1080,
        Timeframe::H12 => 1440,
        Timeframe::D1 => 2880,
    }
}

/// Percent values are expressed as percent (1.5 means 1.5%).
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub min_stop_pct: f64,
    pub max_stop_pct: f64,
    pub reward_multiple: f64,
    /// Bars on each side a swing high/low must dominate.
    pub swing_strength: usize,
}

#[derive(Debug, Clone)]
pub struct OkxCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub max_concurrent_trades: usize,
    pub balance_allocation: f64,
    pub auto_trade_enabled: bool,
    pub paper_balance: f64,
    pub credentials: Option<OkxCredentials>,
    pub simulated: bool,
    /// `cash` for spot, `cross`/`isolated` for margin.
    pub trade_mode: String,
    pub order_rate_limit: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            large_cap_count: 10,
            mid_cap_count: 30,
            refresh_interval: Duration::from_secs(30 * 60),
            fallback_symbols: DEFAULT_FALLBACK_SYMBOLS
                .iter()
                .map(|s| normalize_symbol(s, "USDT"))
                .collect(),
            quote: "USDT".to_string(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: OKX_WS_PUBLIC_URL.to_string(),
            ping_interval: Duration::from_secs(20),
            reconnect_base_ms: 3000,
            reconnect_factor: 1.5,
            reconnect_max_attempts: 10,
            connect_timeout: Duration::from_secs(10),
            channels: vec![Channel::Ticker, Channel::Trade, Channel::Depth],
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            quote: "USDT".to_string(),
            ping_interval: Duration::from_secs(30),
            max_clients: 1000,
            cache_ttl: Duration::from_secs(60),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.65,
            ttl: Duration::from_secs(20),
            timeframe: Timeframe::M15,
            interval: Duration::from_secs(60),
            uniqueness_windows: Timeframe::ALL
                .iter()
                .map(|tf| (*tf, default_window_minutes(*tf)))
                .collect(),
            candle_limit: 100,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 1.5,
            take_profit_pct: 3.8,
            atr_period: 14,
            atr_multiplier: 2.0,
            min_stop_pct: 0.5,
            max_stop_pct: 5.0,
            reward_multiple: 2.0,
            swing_strength: 2,
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_trades: 5,
            balance_allocation: 0.9,
            auto_trade_enabled: false,
            paper_balance: 10_000.0,
            credentials: None,
            simulated: true,
            trade_mode: "cash".to_string(),
            order_rate_limit: 10,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            okx_rest_url: OKX_BASE_URL.to_string(),
            ranking_api_url: crate::coingecko::COINGECKO_BASE_URL.to_string(),
            prediction_api_url: "http://127.0.0.1:8000".to_string(),
            http_timeout: Duration::from_secs(10),
            selector: SelectorConfig::default(),
            feed: FeedConfig::default(),
            hub: HubConfig::default(),
            signal: SignalConfig::default(),
            risk: RiskConfig::default(),
            trading: TradingConfig::default(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key) {
            Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default.as_secs())?;
        if secs == 0 {
            return Err(invalid(key, "0", "must be greater than zero"));
        }
        Ok(Duration::from_secs(secs))
    }

    fn positive_count(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        let n = self.parse(key, default)?;
        if n == 0 {
            return Err(invalid(key, "0", "must be greater than zero"));
        }
        Ok(n)
    }
}

fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.into(),
        reason: reason.into(),
    }
}

/// Parse `1m=5,15m=60` into per-timeframe minute windows.
pub fn parse_uniqueness_windows(raw: &str) -> Result<HashMap<Timeframe, i64>, ConfigError> {
    let mut windows = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (tf, minutes) = part
            .split_once('=')
            .ok_or_else(|| invalid("UNIQUENESS_WINDOWS", part, "expected <timeframe>=<minutes>"))?;
        let tf: Timeframe = tf
            .trim()
            .parse()
            .map_err(|e: String| invalid("UNIQUENESS_WINDOWS", part, e))?;
        let minutes: i64 = minutes
            .trim()
            .parse()
            .map_err(|_| invalid("UNIQUENESS_WINDOWS", part, "minutes must be an integer"))?;
        if minutes < 0 {
            return Err(invalid("UNIQUENESS_WINDOWS", part, "minutes must not be negative"));
        }
        windows.insert(tf, minutes);
    }
    Ok(windows)
}

fn parse_channels(raw: &str) -> Result<Vec<Channel>, ConfigError> {
    let channels: Vec<Channel> = raw
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(Channel::from_wire)
        .collect();
    if channels.is_empty() {
        return Err(invalid("FEED_CHANNELS", raw, "at least one channel is required"));
    }
    Ok(channels)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let d = AppConfig::default();

        let quote = env.string("QUOTE_CURRENCY", d.selector.quote.clone()).to_ascii_uppercase();

        let fallback_symbols = match env.raw("FALLBACK_SYMBOLS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| normalize_symbol(s, &quote))
                .collect(),
            None => DEFAULT_FALLBACK_SYMBOLS
                .iter()
                .map(|s| normalize_symbol(s, &quote))
                .collect(),
        };

        let selector = SelectorConfig {
            large_cap_count: env.parse("LARGE_CAP_COUNT", d.selector.large_cap_count)?,
            mid_cap_count: env.parse("MID_CAP_COUNT", d.selector.mid_cap_count)?,
            refresh_interval: env.secs("PAIR_REFRESH_SECS", d.selector.refresh_interval)?,
            fallback_symbols,
            quote: quote.clone(),
        };

        let channels = match env.raw("FEED_CHANNELS") {
            Some(raw) => parse_channels(&raw)?,
            None => d.feed.channels.clone(),
        };

        let feed = FeedConfig {
            ws_url: env.string("OKX_WS_URL", d.feed.ws_url.clone()),
            ping_interval: env.secs("PING_INTERVAL_SECS", d.feed.ping_interval)?,
            reconnect_base_ms: env.parse("RECONNECT_BASE_MS", d.feed.reconnect_base_ms)?,
            reconnect_factor: env.parse("RECONNECT_FACTOR", d.feed.reconnect_factor)?,
            reconnect_max_attempts: env.parse("RECONNECT_MAX_ATTEMPTS", d.feed.reconnect_max_attempts)?,
            connect_timeout: env.secs("CONNECT_TIMEOUT_SECS", d.feed.connect_timeout)?,
            channels,
        };

        let hub = HubConfig {
            quote: quote.clone(),
            ping_interval: env.secs("CLIENT_PING_INTERVAL_SECS", d.hub.ping_interval)?,
            max_clients: env.positive_count("MAX_CLIENTS", d.hub.max_clients)?,
            cache_ttl: env.secs("CACHE_TTL_SECS", d.hub.cache_ttl)?,
        };

        let mut uniqueness_windows = d.signal.uniqueness_windows.clone();
        if let Some(raw) = env.raw("UNIQUENESS_WINDOWS") {
            uniqueness_windows.extend(parse_uniqueness_windows(&raw)?);
        }

        let timeframe = match env.raw("SIGNAL_TIMEFRAME") {
            Some(raw) => raw
                .parse::<Timeframe>()
                .map_err(|e| invalid("SIGNAL_TIMEFRAME", raw.clone(), e))?,
            None => d.signal.timeframe,
        };

        let signal = SignalConfig {
            min_confidence: env.parse("MIN_SIGNAL_CONFIDENCE", d.signal.min_confidence)?,
            ttl: env.secs("SIGNAL_TTL_SECS", d.signal.ttl)?,
            timeframe,
            interval: env.secs("SIGNAL_INTERVAL_SECS", d.signal.interval)?,
            uniqueness_windows,
            candle_limit: d.signal.candle_limit,
        };

        let risk = RiskConfig {
            stop_loss_pct: env.parse("STOP_LOSS_PCT", d.risk.stop_loss_pct)?,
            take_profit_pct: env.parse("TAKE_PROFIT_PCT", d.risk.take_profit_pct)?,
            atr_period: env.positive_count("ATR_PERIOD", d.risk.atr_period)?,
            atr_multiplier: env.parse("ATR_MULTIPLIER", d.risk.atr_multiplier)?,
            min_stop_pct: env.parse("MIN_STOP_PCT", d.risk.min_stop_pct)?,
            max_stop_pct: env.parse("MAX_STOP_PCT", d.risk.max_stop_pct)?,
            reward_multiple: env.parse("REWARD_MULTIPLE", d.risk.reward_multiple)?,
            swing_strength: d.risk.swing_strength,
        };

        let credentials = match (
            env.raw("OKX_API_KEY"),
            env.raw("OKX_API_SECRET"),
            env.raw("OKX_PASSPHRASE"),
        ) {
            (Some(api_key), Some(api_secret), Some(passphrase)) => Some(OkxCredentials {
                api_key,
                api_secret,
                passphrase,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ConfigError::Inconsistent(
                    "OKX_API_KEY, OKX_API_SECRET and OKX_PASSPHRASE must be set together".to_string(),
                ))
            }
        };

        let trading = TradingConfig {
            max_concurrent_trades: env.positive_count("MAX_CONCURRENT_TRADES", d.trading.max_concurrent_trades)?,
            balance_allocation: env.parse("BALANCE_ALLOCATION", d.trading.balance_allocation)?,
            auto_trade_enabled: env.parse("AUTO_TRADE_ENABLED", d.trading.auto_trade_enabled)?,
            paper_balance: env.parse("PAPER_BALANCE", d.trading.paper_balance)?,
            credentials,
            simulated: env.parse("OKX_SIMULATED", d.trading.simulated)?,
            trade_mode: env.string("TRADE_MODE", d.trading.trade_mode.clone()),
            order_rate_limit: env.parse("ORDER_RATE_LIMIT", d.trading.order_rate_limit)?,
        };

        let config = AppConfig {
            bind_addr: env.string("BIND_ADDR", d.bind_addr),
            okx_rest_url: env.string("OKX_REST_URL", d.okx_rest_url),
            ranking_api_url: env.string("RANKING_API_URL", d.ranking_api_url),
            prediction_api_url: env.string("PREDICTION_API_URL", d.prediction_api_url),
            http_timeout: env.secs("HTTP_TIMEOUT_SECS", d.http_timeout)?,
            selector,
            feed,
            hub,
            signal,
            risk,
            trading,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.selector.large_cap_count + self.selector.mid_cap_count == 0 {
            return Err(ConfigError::Inconsistent(
                "LARGE_CAP_COUNT + MID_CAP_COUNT must be greater than zero".to_string(),
            ));
        }
        if self.selector.fallback_symbols.is_empty() {
            return Err(invalid("FALLBACK_SYMBOLS", "", "at least one symbol is required"));
        }
        if !(0.0..=1.0).contains(&self.signal.min_confidence) {
            return Err(invalid(
                "MIN_SIGNAL_CONFIDENCE",
                self.signal.min_confidence.to_string(),
                "must be within [0, 1]",
            ));
        }
        if !(self.trading.balance_allocation > 0.0 && self.trading.balance_allocation <= 1.0) {
            return Err(invalid(
                "BALANCE_ALLOCATION",
                self.trading.balance_allocation.to_string(),
                "must be within (0, 1]",
            ));
        }
        if self.feed.reconnect_factor < 1.0 {
            return Err(invalid(
                "RECONNECT_FACTOR",
                self.feed.reconnect_factor.to_string(),
                "must be at least 1.0",
            ));
        }
        if self.feed.reconnect_base_ms == 0 {
            return Err(invalid("RECONNECT_BASE_MS", "0", "must be greater than zero"));
        }
        let risk = &self.risk;
        for (key, value) in [
            ("STOP_LOSS_PCT", risk.stop_loss_pct),
            ("TAKE_PROFIT_PCT", risk.take_profit_pct),
            ("ATR_MULTIPLIER", risk.atr_multiplier),
            ("MIN_STOP_PCT", risk.min_stop_pct),
            ("MAX_STOP_PCT", risk.max_stop_pct),
            ("REWARD_MULTIPLE", risk.reward_multiple),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(key, value.to_string(), "must be a positive number"));
            }
        }
        if risk.min_stop_pct > risk.max_stop_pct {
            return Err(ConfigError::Inconsistent(format!(
                "MIN_STOP_PCT ({}) exceeds MAX_STOP_PCT ({})",
                risk.min_stop_pct, risk.max_stop_pct
            )));
        }
        if self.trading.order_rate_limit == 0 {
            return Err(invalid("ORDER_RATE_LIMIT", "0", "must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.selector.large_cap_count, 10);
        assert_eq!(config.selector.mid_cap_count, 30);
        assert_eq!(config.feed.reconnect_base_ms, 3000);
        assert_eq!(config.feed.reconnect_factor, 1.5);
        assert_eq!(config.signal.min_confidence, 0.65);
        assert_eq!(config.signal.ttl, Duration::from_secs(20));
        assert_eq!(config.trading.max_concurrent_trades, 5);
        assert_eq!(config.selector.fallback_symbols[0], "BTC-USDT");
        assert!(config.trading.credentials.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("LARGE_CAP_COUNT", "2"),
            ("MID_CAP_COUNT", "1"),
            ("FEED_CHANNELS", "tickers, candle1H"),
            ("UNIQUENESS_WINDOWS", "15m=90"),
            ("FALLBACK_SYMBOLS", "btc,ethusdt"),
            ("SIGNAL_TIMEFRAME", "1h"),
        ]))
        .unwrap();
        assert_eq!(config.selector.large_cap_count, 2);
        assert_eq!(config.feed.channels, vec![Channel::Ticker, Channel::Candle(Timeframe::H1)]);
        assert_eq!(config.signal.window_minutes(Timeframe::M15), 90);
        assert_eq!(config.signal.window_minutes(Timeframe::H1), 240);
        assert_eq!(config.selector.fallback_symbols, vec!["BTC-USDT", "ETH-USDT"]);
        assert_eq!(config.signal.timeframe, Timeframe::H1);
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("MAX_CONCURRENT_TRADES", "five")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_CONCURRENT_TRADES", .. }));

        let err = AppConfig::from_lookup(lookup(&[("UNIQUENESS_WINDOWS", "15m")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "UNIQUENESS_WINDOWS", .. }));
    }

    #[test]
    fn test_cross_field_validation() {
        let err = AppConfig::from_lookup(lookup(&[("MIN_STOP_PCT", "6"), ("MAX_STOP_PCT", "5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = AppConfig::from_lookup(lookup(&[("MIN_SIGNAL_CONFIDENCE", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MIN_SIGNAL_CONFIDENCE", .. }));

        let err = AppConfig::from_lookup(lookup(&[("OKX_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
