//! Error types shared across the feed, hub, signal and trading layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out during {stage}")]
    Timeout { stage: &'static str },

    #[error("upstream closed the connection")]
    Closed,

    #[error("keepalive ping failed: {0}")]
    PingFailed(String),

    #[error("upstream rejected request: code={code} msg={message}")]
    Rejected { code: String, message: String },
}

/// Failures of the outbound HTTP collaborators: tickers, ranking, candles and predictions.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} returned status {status}")]
    Status { source_name: &'static str, status: u16 },

    #[error("{source_name} returned code={code}: {message}")]
    Api {
        source_name: &'static str,
        code: String,
        message: String,
    },

    #[error("{source_name} returned no usable data")]
    Empty { source_name: &'static str },

    #[error("{source_name} timed out")]
    Timeout { source_name: &'static str },
}

/// Downstream client protocol errors. Each variant maps to a stable wire code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HubError {
    #[error("invalid symbol {symbol}: expected quote currency suffix -{quote}")]
    InvalidSymbol { symbol: String, quote: String },

    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unsupported timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("client {0} is not registered")]
    ClientNotFound(uuid::Uuid),

    #[error("maximum connections reached ({0})")]
    TooManyClients(usize),
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidSymbol { .. } => "INVALID_SYMBOL",
            HubError::UnknownMessage(_) => "UNKNOWN_MESSAGE",
            HubError::MalformedMessage(_) => "MALFORMED_MESSAGE",
            HubError::InvalidTimeframe(_) => "INVALID_TIMEFRAME",
            HubError::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            HubError::TooManyClients(_) => "TOO_MANY_CLIENTS",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("entry price must be positive, got {0}")]
    InvalidEntry(f64),

    #[error("need at least {needed} candles, got {got}")]
    InsufficientCandles { needed: usize, got: usize },

    #[error("volatility measure is not usable: {0}")]
    InvalidVolatility(f64),
}

#[derive(Debug, Error)]
pub enum TradingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("exchange rejected request: code={code} msg={message}")]
    Api { code: String, message: String },

    #[error("insufficient balance: {0:.2}")]
    InsufficientBalance(f64),

    #[error("symbol {0} is not in the active set")]
    SymbolNotApproved(String),

    #[error("invalid order size {0}")]
    InvalidSize(f64),

    #[error("no price available for {0}")]
    MissingPrice(String),

    #[error("trading request timed out")]
    Timeout,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}
