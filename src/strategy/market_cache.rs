//! Latest-value store keyed by (instrument, channel).
//!
//! One entry per key, overwritten in arrival order. Entries are replaced whole
//! under the shard lock, so concurrent readers never see a partial write. The
//! feed is the only writer.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::strategy::types::{Channel, MarketPayload};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub payload: MarketPayload,
    /// Receipt time, milliseconds since epoch.
    pub timestamp: i64,
}

/// symbol -> channel wire name -> entry
pub type CacheSnapshot = BTreeMap<String, BTreeMap<String, CacheEntry>>;

#[derive(Default)]
pub struct MarketCache {
    entries: DashMap<(String, Channel), CacheEntry>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity(256),
        }
    }

    pub fn put(&self, symbol: &str, channel: Channel, payload: MarketPayload, timestamp: i64) {
        self.entries
            .insert((symbol.to_string(), channel), CacheEntry { payload, timestamp });
    }

    pub fn get(&self, symbol: &str) -> HashMap<Channel, CacheEntry> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == symbol)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect()
    }

    pub fn get_entry(&self, symbol: &str, channel: &Channel) -> Option<CacheEntry> {
        self.entries
            .get(&(symbol.to_string(), channel.clone()))
            .map(|e| e.value().clone())
    }

    /// Last traded price, preferring the ticker over candles and trades.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self
            .get_entry(symbol, &Channel::Ticker)
            .and_then(|e| e.payload.last_price())
        {
            return Some(price);
        }
        self.get(symbol)
            .into_values()
            .max_by_key(|e| e.timestamp)
            .and_then(|e| e.payload.last_price())
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let mut out: CacheSnapshot = BTreeMap::new();
        for entry in self.entries.iter() {
            let (symbol, channel) = entry.key();
            out.entry(symbol.clone())
                .or_default()
                .insert(channel.wire_name(), entry.value().clone());
        }
        out
    }

    /// Snapshot restricted to `symbols`.
    pub fn snapshot_for<'a, I>(&self, symbols: I) -> CacheSnapshot
    where
        I: IntoIterator<Item = &'a String>,
    {
        let wanted: HashSet<&String> = symbols.into_iter().collect();
        let mut out: CacheSnapshot = BTreeMap::new();
        for entry in self.entries.iter() {
            let (symbol, channel) = entry.key();
            if wanted.contains(symbol) {
                out.entry(symbol.clone())
                    .or_default()
                    .insert(channel.wire_name(), entry.value().clone());
            }
        }
        out
    }

    /// Drop every entry whose symbol is not in `keep`. Returns the number removed.
    pub fn retain_symbols(&self, keep: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(symbol, _), _| keep.contains(symbol));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn symbol_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key().0.clone())
            .collect::<HashSet<_>>()
            .len()
    }
}
