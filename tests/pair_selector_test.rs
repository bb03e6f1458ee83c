/// Integration tests for trading-pair selection and its degradation path:
/// ranked -> volume proxy -> previous ranking -> static list.

#[cfg(test)]
mod pair_selector_tests {
    use marketflow::config::SelectorConfig;
    use marketflow::error::SourceError;
    use marketflow::strategy::pair_selector::{
        MarketCapEntry, MarketCapSource, MarketTicker, PairSelector, SelectionSource, TickerSource,
    };
    use marketflow::strategy::types::Category;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct MockTickers {
        rows: Vec<MarketTicker>,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TickerSource for MockTickers {
        async fn tickers(&self, _quote: &str) -> Result<Vec<MarketTicker>, SourceError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SourceError::Timeout { source_name: "tickers" });
            }
            Ok(self.rows.clone())
        }
    }

    struct MockCaps {
        rows: Vec<MarketCapEntry>,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl MarketCapSource for MockCaps {
        async fn market_caps(&self, symbols: &[String]) -> Result<Vec<MarketCapEntry>, SourceError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SourceError::Status { source_name: "coingecko", status: 429 });
            }
            Ok(self
                .rows
                .iter()
                .filter(|c| symbols.contains(&c.symbol.to_ascii_lowercase()))
                .cloned()
                .collect())
        }
    }

    fn ticker(base: &str, price: f64, volume: f64) -> MarketTicker {
        MarketTicker {
            inst_id: format!("{}-USDT", base),
            base: base.to_string(),
            last_price: price,
            volume_24h: volume,
        }
    }

    fn cap(symbol: &str, market_cap: f64, rank: u32) -> MarketCapEntry {
        MarketCapEntry {
            symbol: symbol.to_string(),
            market_cap,
            rank: Some(rank),
        }
    }

    fn config(large: usize, mid: usize) -> SelectorConfig {
        SelectorConfig {
            large_cap_count: large,
            mid_cap_count: mid,
            refresh_interval: Duration::from_secs(60),
            fallback_symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string(), "SOL-USDT".to_string()],
            quote: "USDT".to_string(),
        }
    }

    fn setup(large: usize, mid: usize) -> (PairSelector, Arc<MockTickers>, Arc<MockCaps>) {
        let tickers = Arc::new(MockTickers {
            rows: vec![
                ticker("AAA", 1.0, 10.0),
                ticker("BBB", 1.0, 20.0),
                ticker("CCC", 1.0, 30.0),
            ],
            failing: AtomicBool::new(false),
        });
        let caps = Arc::new(MockCaps {
            rows: vec![cap("aaa", 500.0, 1), cap("bbb", 300.0, 2), cap("ccc", 100.0, 3)],
            failing: AtomicBool::new(false),
        });
        let selector = PairSelector::new(config(large, mid), tickers.clone(), caps.clone());
        (selector, tickers, caps)
    }

    #[tokio::test]
    async fn test_initial_set_is_static_list() {
        let (selector, _, _) = setup(2, 1);
        let set = selector.current();
        assert_eq!(set.source, SelectionSource::Static);
        assert_eq!(set.symbols(), vec!["BTC-USDT", "ETH-USDT", "SOL-USDT"]);
    }

    #[tokio::test]
    async fn test_ranks_by_market_cap_into_tiers() {
        let (selector, _, _) = setup(2, 1);
        let set = selector.refresh().await;

        assert_eq!(set.source, SelectionSource::Ranked);
        let large: Vec<String> = set.large_cap.iter().map(|i| i.inst_id()).collect();
        let mid: Vec<String> = set.mid_cap.iter().map(|i| i.inst_id()).collect();
        assert_eq!(large, vec!["AAA-USDT", "BBB-USDT"]);
        assert_eq!(mid, vec!["CCC-USDT"]);
        assert_eq!(set.category_of("CCC-USDT"), Some(Category::MidCap));
    }

    #[tokio::test]
    async fn test_missing_caps_fall_back_to_volume_proxy() {
        let (selector, _, caps) = setup(1, 1);
        caps.failing.store(true, Ordering::SeqCst);

        let set = selector.refresh().await;
        assert_eq!(set.source, SelectionSource::Proxy);
        // Volume x price: CCC 30, BBB 20, AAA 10
        assert_eq!(set.symbols(), vec!["CCC-USDT", "BBB-USDT"]);
        assert!(set.large_cap.iter().all(|i| i.cap_is_proxy));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_ranking() {
        let (selector, tickers, _) = setup(2, 1);
        let ranked = selector.refresh().await;

        tickers.failing.store(true, Ordering::SeqCst);
        let kept = selector.refresh().await;

        assert_eq!(kept.source, SelectionSource::Cached);
        assert_eq!(kept.symbols(), ranked.symbols());
    }

    #[tokio::test]
    async fn test_failed_first_refresh_installs_static_list() {
        let (selector, tickers, _) = setup(2, 1);
        tickers.failing.store(true, Ordering::SeqCst);

        let set = selector.refresh().await;
        assert_eq!(set.source, SelectionSource::Static);
        assert_eq!(set.large_cap.len(), 2);
        assert_eq!(set.mid_cap.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_published_set() {
        let (selector, _, _) = setup(2, 1);
        let mut rx = selector.subscribe();

        selector.refresh().await;
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.source, SelectionSource::Ranked);
        assert!(seen.contains("AAA-USDT"));
        assert!(!seen.contains("DDD-USDT"));
    }
}
