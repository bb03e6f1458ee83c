use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::exchange_parser::{normalize_symbol, parse_num};
use crate::okx::http_error;
use crate::strategy::signal_engine::PredictionSource;
use crate::strategy::types::{Direction, RawSignal, Timeframe};

const SOURCE_NAME: &str = "prediction";

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    pairs: &'a [String],
    timeframe: Timeframe,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<WirePrediction>,
}

/// Prediction row as emitted by the model service. Field names vary between
/// model versions, hence the aliases.
#[derive(Debug, Deserialize)]
struct WirePrediction {
    #[serde(alias = "pair", alias = "instId")]
    symbol: String,
    #[serde(alias = "signal_type", alias = "signal", alias = "side")]
    direction: String,
    confidence: Value,
    #[serde(default, alias = "entry_price", alias = "current_price")]
    price: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    timeframe: Option<String>,
}

/// Confidence reported on a 0-100 scale is brought back to [0, 1].
/// Non-finite values have no meaning and yield `None`.
pub fn normalize_confidence(raw: f64) -> Option<f64> {
    if !raw.is_finite() {
        return None;
    }
    let c = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(c.clamp(0.0, 1.0))
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = v.as_i64() {
        // Seconds or milliseconds.
        return if ms > 10_000_000_000 {
            Utc.timestamp_millis_opt(ms).single()
        } else {
            Utc.timestamp_opt(ms, 0).single()
        };
    }
    let s = v.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn into_raw_signal(
    wire: WirePrediction,
    requested: Timeframe,
    quote: &str,
    now: DateTime<Utc>,
) -> Option<RawSignal> {
    let direction: Direction = wire.direction.parse().ok()?;
    let confidence = normalize_confidence(parse_num(&wire.confidence)?)?;
    let price = wire
        .price
        .as_ref()
        .and_then(parse_num)
        .filter(|p| p.is_finite())
        .unwrap_or(0.0);
    let timeframe = wire
        .timeframe
        .as_deref()
        .and_then(|tf| tf.parse().ok())
        .unwrap_or(requested);
    let timestamp = wire.timestamp.as_ref().and_then(parse_timestamp).unwrap_or(now);

    Some(RawSignal {
        symbol: normalize_symbol(&wire.symbol, quote),
        direction,
        confidence,
        price,
        timestamp,
        timeframe,
    })
}

/// Client for the external model service (`POST /predict`).
#[derive(Clone)]
pub struct PredictionClient {
    client: reqwest::Client,
    base_url: String,
    quote: String,
}

impl PredictionClient {
    pub fn new(base_url: impl Into<String>, quote: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            quote: quote.to_string(),
        })
    }

    fn decode(&self, body: PredictResponse, timeframe: Timeframe) -> Vec<RawSignal> {
        let now = Utc::now();
        let total = body.predictions.len();
        let signals: Vec<RawSignal> = body
            .predictions
            .into_iter()
            .filter_map(|p| into_raw_signal(p, timeframe, &self.quote, now))
            .collect();
        if signals.len() < total {
            warn!(dropped = total - signals.len(), "discarded malformed predictions");
        }
        signals
    }
}

#[async_trait::async_trait]
impl PredictionSource for PredictionClient {
    async fn predict(&self, pairs: &[String], timeframe: Timeframe) -> Result<Vec<RawSignal>, SourceError> {
        let url = format!("{}/predict", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&PredictRequest { pairs, timeframe })
            .send()
            .await
            .map_err(|e| http_error(SOURCE_NAME, e))?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: SOURCE_NAME,
                status: response.status().as_u16(),
            });
        }

        let body: PredictResponse = response.json().await.map_err(|e| http_error(SOURCE_NAME, e))?;
        let signals = self.decode(body, timeframe);
        debug!(requested = pairs.len(), received = signals.len(), "predictions received");
        Ok(signals)
    }
}
