//! Stop-loss / take-profit placement from recent volatility.
//!
//! The stop distance is `ATR * multiplier`, clamped to a percentage band of the
//! entry price, then pulled in to the nearest swing level when that level is
//! tighter. The target is a fixed multiple of the stop distance, capped at the
//! nearest opposing swing level. Any failure falls back to fixed percentages.

use tracing::debug;

use crate::config::RiskConfig;
use crate::error::RiskError;
use crate::strategy::types::{Candle, Direction, RiskLevels, RiskSource};

/// Mean true range over the last `period` bars. Needs `period + 1` candles.
pub fn average_true_range(candles: &[Candle], period: usize) -> Result<f64, RiskError> {
    if period == 0 || candles.len() < period + 1 {
        return Err(RiskError::InsufficientCandles {
            needed: period + 1,
            got: candles.len(),
        });
    }

    let window = &candles[candles.len() - period - 1..];
    let sum: f64 = window
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let bar = &pair[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .sum();

    let atr = sum / period as f64;
    if !atr.is_finite() || atr <= 0.0 {
        return Err(RiskError::InvalidVolatility(atr));
    }
    Ok(atr)
}

/// Swing lows and highs: bars whose low (high) is strictly below (above) the
/// `strength` bars on either side.
pub fn swing_levels(candles: &[Candle], strength: usize) -> (Vec<f64>, Vec<f64>) {
    let mut supports = Vec::new();
    let mut resistances = Vec::new();
    if strength == 0 || candles.len() < 2 * strength + 1 {
        return (supports, resistances);
    }

    for i in strength..candles.len() - strength {
        let bar = &candles[i];
        let neighbours = candles[i - strength..i]
            .iter()
            .chain(candles[i + 1..=i + strength].iter());

        let (mut is_low, mut is_high) = (true, true);
        for other in neighbours {
            is_low &= bar.low < other.low;
            is_high &= bar.high > other.high;
        }
        if is_low {
            supports.push(bar.low);
        }
        if is_high {
            resistances.push(bar.high);
        }
    }
    (supports, resistances)
}

pub fn levels_from_atr(
    direction: Direction,
    entry: f64,
    atr: f64,
    supports: &[f64],
    resistances: &[f64],
    cfg: &RiskConfig,
) -> Result<RiskLevels, RiskError> {
    if !entry.is_finite() || entry <= 0.0 {
        return Err(RiskError::InvalidEntry(entry));
    }
    if !atr.is_finite() || atr <= 0.0 {
        return Err(RiskError::InvalidVolatility(atr));
    }

    let min_dist = entry * cfg.min_stop_pct / 100.0;
    let max_dist = entry * cfg.max_stop_pct / 100.0;
    let mut dist = (atr * cfg.atr_multiplier).clamp(min_dist, max_dist);

    // Nearest protective level on the stop side, nearest opposing level on the target side.
    let (protective, opposing) = match direction {
        Direction::Long => (
            supports.iter().copied().filter(|s| *s < entry).fold(None, max_opt),
            resistances.iter().copied().filter(|r| *r > entry).fold(None, min_opt),
        ),
        Direction::Short => (
            resistances.iter().copied().filter(|r| *r > entry).fold(None, min_opt),
            supports.iter().copied().filter(|s| *s < entry).fold(None, max_opt),
        ),
    };

    if let Some(level) = protective {
        let level_dist = (entry - level).abs();
        if level_dist < dist {
            dist = level_dist.max(min_dist);
        }
    }

    let mut reward = dist * cfg.reward_multiple;
    if let Some(level) = opposing {
        reward = reward.min((level - entry).abs());
    }

    let (stop_loss, take_profit) = match direction {
        Direction::Long => (entry - dist, entry + reward),
        Direction::Short => (entry + dist, entry - reward),
    };

    Ok(RiskLevels {
        stop_loss,
        take_profit,
        risk_reward_ratio: reward / dist,
    })
}

fn max_opt(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.max(v)))
}

fn min_opt(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.min(v)))
}

pub fn fallback_levels(direction: Direction, entry: f64, cfg: &RiskConfig) -> RiskLevels {
    let sl = cfg.stop_loss_pct / 100.0;
    let tp = cfg.take_profit_pct / 100.0;
    let (stop_loss, take_profit) = match direction {
        Direction::Long => (entry * (1.0 - sl), entry * (1.0 + tp)),
        Direction::Short => (entry * (1.0 + sl), entry * (1.0 - tp)),
    };
    RiskLevels {
        stop_loss,
        take_profit,
        risk_reward_ratio: if sl > 0.0 { tp / sl } else { 0.0 },
    }
}

/// Volatility-based levels, or fixed percentages when they cannot be computed.
pub fn compute_risk(
    direction: Direction,
    entry: f64,
    candles: &[Candle],
    cfg: &RiskConfig,
) -> (RiskLevels, RiskSource) {
    let attempt = average_true_range(candles, cfg.atr_period).and_then(|atr| {
        let (supports, resistances) = swing_levels(candles, cfg.swing_strength);
        levels_from_atr(direction, entry, atr, &supports, &resistances, cfg)
    });

    match attempt {
        Ok(levels) => (levels, RiskSource::Volatility),
        Err(e) => {
            debug!(error = %e, entry, "risk falling back to fixed percentages");
            (fallback_levels(direction, entry, cfg), RiskSource::Fallback)
        }
    }
}
