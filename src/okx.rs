use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::SourceError;
use crate::exchange_parser::{parse_candle_row, parse_num};
use crate::strategy::pair_selector::{MarketTicker, TickerSource};
use crate::strategy::signal_engine::CandleSource;
use crate::strategy::types::{Candle, ChannelArg, Timeframe};
use crate::utils;

pub const OKX_BASE_URL: &str = "https://www.okx.com";
pub const OKX_WS_PUBLIC_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// Upper bound of `args` per subscribe/unsubscribe message.
pub const SUBSCRIBE_ARGS_PER_MSG: usize = 10;

const SOURCE_NAME: &str = "okx";

// ============================================================================
// Streaming protocol
// ============================================================================

#[derive(Debug, Serialize)]
struct OpFrame<'a, T: Serialize> {
    op: &'a str,
    args: &'a [T],
}

fn op_frames(op: &str, args: &[ChannelArg]) -> Vec<String> {
    utils::chunk_vec(args, SUBSCRIBE_ARGS_PER_MSG)
        .iter()
        .filter_map(|chunk| serde_json::to_string(&OpFrame { op, args: chunk }).ok())
        .collect()
}

/// `{op:"subscribe", args:[{channel, instId}, ...]}`, at most
/// [`SUBSCRIBE_ARGS_PER_MSG`] args per frame.
pub fn subscribe_frames(args: &[ChannelArg]) -> Vec<String> {
    op_frames("subscribe", args)
}

pub fn unsubscribe_frames(args: &[ChannelArg]) -> Vec<String> {
    op_frames("unsubscribe", args)
}

pub fn ping_frame(ts_ms: i64) -> String {
    let ts = ts_ms.to_string();
    serde_json::to_string(&OpFrame {
        op: "ping",
        args: std::slice::from_ref(&ts),
    })
    .unwrap_or_else(|_| "ping".to_string())
}

/// Decoded upstream text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Data { arg: ChannelArg, data: Vec<Value> },
    Subscribed(ChannelArg),
    Unsubscribed(ChannelArg),
    Error { code: String, message: String },
    Pong,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    arg: Option<ChannelArg>,
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

pub fn decode_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    if text == "pong" {
        return Ok(InboundFrame::Pong);
    }

    let raw: RawFrame = serde_json::from_str(text)?;

    if raw.op.as_deref() == Some("pong") {
        return Ok(InboundFrame::Pong);
    }

    match raw.event.as_deref() {
        Some("error") => {
            return Ok(InboundFrame::Error {
                code: raw.code.unwrap_or_default(),
                message: raw.msg.unwrap_or_default(),
            })
        }
        Some("subscribe") => {
            return Ok(raw.arg.map(InboundFrame::Subscribed).unwrap_or(InboundFrame::Ignored))
        }
        Some("unsubscribe") => {
            return Ok(raw.arg.map(InboundFrame::Unsubscribed).unwrap_or(InboundFrame::Ignored))
        }
        Some(_) => return Ok(InboundFrame::Ignored),
        None => {}
    }

    match (raw.arg, raw.data) {
        (Some(arg), Some(data)) => Ok(InboundFrame::Data { arg, data }),
        _ => Ok(InboundFrame::Ignored),
    }
}

// ============================================================================
// REST market data
// ============================================================================

#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OkxTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    last: Value,
    #[serde(rename = "vol24h", default)]
    vol_24h: Value,
}

#[derive(Clone)]
pub struct OkxRestClient {
    client: reqwest::Client,
    base_url: String,
}

impl OkxRestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| http_error(SOURCE_NAME, e))?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: SOURCE_NAME,
                status: response.status().as_u16(),
            });
        }

        let body: OkxResponse<T> = response.json().await.map_err(|e| http_error(SOURCE_NAME, e))?;
        if body.code != "0" {
            return Err(SourceError::Api {
                source_name: SOURCE_NAME,
                code: body.code,
                message: body.msg,
            });
        }
        Ok(body.data)
    }

    /// Spot tickers quoted in `quote`.
    pub async fn fetch_tickers(&self, quote: &str) -> Result<Vec<MarketTicker>, SourceError> {
        let rows: Vec<OkxTicker> = self
            .get("/api/v5/market/tickers", &[("instType", "SPOT".to_string())])
            .await?;

        let suffix = format!("-{}", quote.to_ascii_uppercase());
        let tickers: Vec<MarketTicker> = rows
            .into_iter()
            .filter_map(|row| {
                let base = row.inst_id.strip_suffix(&suffix)?.to_string();
                let last_price = parse_num(&row.last)?;
                let volume_24h = parse_num(&row.vol_24h).unwrap_or(0.0);
                Some(MarketTicker {
                    inst_id: row.inst_id,
                    base,
                    last_price,
                    volume_24h,
                })
            })
            .collect();

        if tickers.is_empty() {
            return Err(SourceError::Empty { source_name: SOURCE_NAME });
        }
        Ok(tickers)
    }

    /// Recent candles, oldest first.
    pub async fn fetch_candles(
        &self,
        inst_id: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        let rows: Vec<Vec<Value>> = self
            .get(
                "/api/v5/market/candles",
                &[
                    ("instId", inst_id.to_string()),
                    ("bar", timeframe.exchange_bar().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        // The exchange returns newest first.
        let mut candles: Vec<Candle> = rows.iter().filter_map(|row| parse_candle_row(row)).collect();
        candles.reverse();
        Ok(candles)
    }
}

pub(crate) fn http_error(source_name: &'static str, err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout { source_name }
    } else {
        SourceError::Http(err)
    }
}

#[async_trait::async_trait]
impl TickerSource for OkxRestClient {
    async fn tickers(&self, quote: &str) -> Result<Vec<MarketTicker>, SourceError> {
        self.fetch_tickers(quote).await
    }
}

#[async_trait::async_trait]
impl CandleSource for OkxRestClient {
    async fn candles(
        &self,
        inst_id: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        self.fetch_candles(inst_id, timeframe, limit).await
    }
}
