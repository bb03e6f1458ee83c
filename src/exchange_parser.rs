//! Per-channel payload normalisation for the upstream exchange feed.
//!
//! Every inbound `data` array is handed to the parser registered for its
//! channel. Known channels produce a typed [`MarketPayload`]; channels without
//! a parser pass through as [`MarketPayload::Other`].

use serde_json::Value;

use crate::strategy::types::{Candle, Channel, DepthBook, MarketPayload, Ticker, TradePrint};

pub trait ChannelParser: Send + Sync {
    /// Parse the `data` array of one upstream frame. `None` means the frame
    /// is malformed for this channel.
    fn parse(&self, data: &[Value]) -> Option<MarketPayload>;
}

/// Exchange numbers arrive as strings; accept plain JSON numbers too.
pub fn parse_num(v: &Value) -> Option<f64> {
    if v.is_f64() || v.is_i64() || v.is_u64() {
        v.as_f64()
    } else {
        v.as_str().and_then(|s| s.parse::<f64>().ok())
    }
}

fn field_num(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(parse_num)
}

fn field_i64(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(parse_num).map(|v| v as i64)
}

pub struct TickerParser;
impl ChannelParser for TickerParser {
    fn parse(&self, data: &[Value]) -> Option<MarketPayload> {
        // Latest element wins when the exchange batches several updates.
        let item = data.last()?;
        Some(MarketPayload::Ticker(Ticker {
            last: field_num(item, "last")?,
            bid: field_num(item, "bidPx"),
            ask: field_num(item, "askPx"),
            open_24h: field_num(item, "open24h"),
            high_24h: field_num(item, "high24h"),
            low_24h: field_num(item, "low24h"),
            volume_24h: field_num(item, "vol24h").unwrap_or(0.0),
            ts: field_i64(item, "ts").unwrap_or(0),
        }))
    }
}

pub struct CandleParser;
impl ChannelParser for CandleParser {
    fn parse(&self, data: &[Value]) -> Option<MarketPayload> {
        let row = data.last()?.as_array()?;
        parse_candle_row(row).map(MarketPayload::Candle)
    }
}

/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
pub fn parse_candle_row(row: &[Value]) -> Option<Candle> {
    if row.len() < 6 {
        return None;
    }
    Some(Candle {
        ts: parse_num(&row[0])? as i64,
        open: parse_num(&row[1])?,
        high: parse_num(&row[2])?,
        low: parse_num(&row[3])?,
        close: parse_num(&row[4])?,
        volume: parse_num(&row[5])?,
        confirmed: row
            .get(8)
            .and_then(|v| v.as_str())
            .map(|s| s == "1")
            .unwrap_or(false),
    })
}

pub struct TradesParser;
impl ChannelParser for TradesParser {
    fn parse(&self, data: &[Value]) -> Option<MarketPayload> {
        let mut trades = Vec::with_capacity(data.len());
        for item in data {
            trades.push(TradePrint {
                trade_id: item
                    .get("tradeId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                price: field_num(item, "px")?,
                size: field_num(item, "sz")?,
                side: item
                    .get("side")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ts: field_i64(item, "ts").unwrap_or(0),
            });
        }
        if trades.is_empty() {
            return None;
        }
        Some(MarketPayload::Trades(trades))
    }
}

pub struct DepthParser;
impl ChannelParser for DepthParser {
    fn parse(&self, data: &[Value]) -> Option<MarketPayload> {
        let item = data.last()?;
        Some(MarketPayload::Depth(DepthBook {
            bids: parse_levels(item.get("bids")?)?,
            asks: parse_levels(item.get("asks")?)?,
            ts: field_i64(item, "ts").unwrap_or(0),
        }))
    }
}

fn parse_levels(levels: &Value) -> Option<Vec<(f64, f64)>> {
    let arr = levels.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for level in arr {
        let level = level.as_array()?;
        let price = parse_num(level.first()?)?;
        let size = parse_num(level.get(1)?)?;
        out.push((price, size));
    }
    Some(out)
}

pub fn get_parser(channel: &Channel) -> Option<Box<dyn ChannelParser>> {
    match channel {
        Channel::Ticker => Some(Box::new(TickerParser)),
        Channel::Candle(_) => Some(Box::new(CandleParser)),
        Channel::Trade => Some(Box::new(TradesParser)),
        Channel::Depth => Some(Box::new(DepthParser)),
        Channel::Other(_) => None,
    }
}

/// Normalise a payload for `channel`. Unknown channels pass the raw `data`
/// through untouched; known channels with a malformed body yield `None`.
pub fn normalize_payload(channel: &Channel, data: &[Value]) -> Option<MarketPayload> {
    match get_parser(channel) {
        Some(parser) => parser.parse(data),
        None => Some(MarketPayload::Other(Value::Array(data.to_vec()))),
    }
}

/// Normalise a symbol to the exchange instrument id form `BASE-QUOTE`.
///
/// Accepts `btc`, `BTCUSDT`, `btc-usdt`, `BTC/USDT` and `BTC-USDT-SWAP`.
pub fn normalize_symbol(raw: &str, quote: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase().replace('/', "-");
    let quote = quote.to_ascii_uppercase();
    let upper = upper.trim_end_matches("-SWAP").to_string();

    if let Some((base, q)) = upper.split_once('-') {
        return format!("{}-{}", base, q);
    }
    if let Some(base) = upper.strip_suffix(&quote) {
        if !base.is_empty() {
            return format!("{}-{}", base, quote);
        }
    }
    format!("{}-{}", upper, quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ticker_parsing() {
        let data = vec![json!({
            "instId": "BTC-USDT", "last": "64000.5", "bidPx": "64000.1", "askPx": "64000.9",
            "open24h": "63000", "high24h": "65000", "low24h": "62000", "vol24h": "1234.5", "ts": "1700000000000"
        })];
        match normalize_payload(&Channel::Ticker, &data) {
            Some(MarketPayload::Ticker(t)) => {
                assert_eq!(t.last, 64000.5);
                assert_eq!(t.bid, Some(64000.1));
                assert_eq!(t.volume_24h, 1234.5);
                assert_eq!(t.ts, 1_700_000_000_000);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_candle_parsing() {
        let data = vec![json!(["1700000000000", "1", "3", "0.5", "2", "100", "0", "0", "1"])];
        match normalize_payload(&Channel::Candle(crate::strategy::types::Timeframe::M1), &data) {
            Some(MarketPayload::Candle(c)) => {
                assert_eq!(c.high, 3.0);
                assert_eq!(c.close, 2.0);
                assert!(c.confirmed);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_depth_parsing() {
        let data = vec![json!({
            "bids": [["100.0", "2", "0", "1"], ["99.5", "1", "0", "1"]],
            "asks": [["100.5", "3", "0", "2"]],
            "ts": "1700000000000"
        })];
        match normalize_payload(&Channel::Depth, &data) {
            Some(MarketPayload::Depth(book)) => {
                assert_eq!(book.bids, vec![(100.0, 2.0), (99.5, 1.0)]);
                assert_eq!(book.asks, vec![(100.5, 3.0)]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_malformed_known_channel_is_rejected() {
        let data = vec![json!({"instId": "BTC-USDT"})];
        assert!(normalize_payload(&Channel::Ticker, &data).is_none());
        assert!(normalize_payload(&Channel::Trade, &[]).is_none());
    }

    #[test]
    fn test_unknown_channel_passes_through() {
        let data = vec![json!({"fundingRate": "0.0001"})];
        let payload = normalize_payload(&Channel::Other("funding-rate".into()), &data);
        assert_eq!(payload, Some(MarketPayload::Other(json!([{"fundingRate": "0.0001"}]))));
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("btc", "USDT"), "BTC-USDT");
        assert_eq!(normalize_symbol("BTCUSDT", "USDT"), "BTC-USDT");
        assert_eq!(normalize_symbol("eth-usdt", "USDT"), "ETH-USDT");
        assert_eq!(normalize_symbol("SOL/USDT", "USDT"), "SOL-USDT");
        assert_eq!(normalize_symbol("BTC-USDT-SWAP", "USDT"), "BTC-USDT");
        assert_eq!(normalize_symbol("ETH-BTC", "USDT"), "ETH-BTC");
    }
}
