/// Integration tests for auto-trade orchestration: balance gate, slot cap,
/// even sizing, large-cap priority and per-trade failure isolation.

#[cfg(test)]
mod orchestrator_tests {
    use chrono::{Duration, Utc};
    use marketflow::config::TradingConfig;
    use marketflow::error::TradingError;
    use marketflow::strategy::execution_backend::TradingApi;
    use marketflow::strategy::market_cache::MarketCache;
    use marketflow::strategy::orchestrator::TradeOrchestrator;
    use marketflow::strategy::pair_selector::ActiveSymbolSet;
    use marketflow::strategy::paper_trading_backend::PaperTradingBackend;
    use marketflow::strategy::types::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    /// Records every request; fails orders for the configured symbols.
    struct MockTradingApi {
        balance: Result<f64, ()>,
        open_positions: usize,
        reject: HashSet<String>,
        orders: Mutex<Vec<OrderRequest>>,
        protective: Mutex<Vec<ProtectiveOrder>>,
    }

    impl MockTradingApi {
        fn new(balance: f64) -> Self {
            Self {
                balance: Ok(balance),
                open_positions: 0,
                reject: HashSet::new(),
                orders: Mutex::new(Vec::new()),
                protective: Mutex::new(Vec::new()),
            }
        }

        fn orders(&self) -> Vec<OrderRequest> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl TradingApi for MockTradingApi {
        async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, TradingError> {
            if self.reject.contains(&order.symbol) {
                return Err(TradingError::Api {
                    code: "51008".to_string(),
                    message: "Order failed".to_string(),
                });
            }
            let ack = OrderAck {
                order_id: format!("ord-{}", order.symbol),
                symbol: order.symbol.clone(),
                status: OrderStatus::Filled,
                fill_price: Some(order.price),
            };
            self.orders.lock().unwrap().push(order);
            Ok(ack)
        }

        async fn place_stop_take_profit(&self, order: ProtectiveOrder) -> Result<OrderAck, TradingError> {
            let ack = OrderAck {
                order_id: "algo".to_string(),
                symbol: order.symbol.clone(),
                status: OrderStatus::Pending,
                fill_price: None,
            };
            self.protective.lock().unwrap().push(order);
            Ok(ack)
        }

        async fn get_balance(&self) -> Result<f64, TradingError> {
            self.balance.map_err(|_| TradingError::Timeout)
        }

        async fn get_positions(&self) -> Result<Vec<Position>, TradingError> {
            Ok((0..self.open_positions)
                .map(|i| Position {
                    symbol: format!("OPEN{}-USDT", i),
                    quantity: 1.0,
                    avg_price: 1.0,
                })
                .collect())
        }

        async fn get_order_history(&self, limit: usize) -> Result<Vec<OrderRecord>, TradingError> {
            let _ = limit;
            Ok(Vec::new())
        }

        fn backend_name(&self) -> &str {
            "Mock"
        }
    }

    const LARGE: [&str; 3] = ["BTC", "ETH", "SOL"];
    const MID: [&str; 4] = ["XRP", "ADA", "DOGE", "LINK"];

    fn active_set() -> ActiveSymbolSet {
        let ids: Vec<String> = LARGE
            .iter()
            .chain(MID.iter())
            .map(|s| format!("{}-USDT", s))
            .collect();
        ActiveSymbolSet::from_static(&ids, "USDT", LARGE.len(), MID.len())
    }

    fn signal(base: &str, category: Category, confidence: f64) -> FilteredSignal {
        FilteredSignal {
            signal: RawSignal {
                symbol: format!("{}-USDT", base),
                direction: Direction::Long,
                confidence,
                price: 10.0,
                timestamp: Utc::now(),
                timeframe: Timeframe::M15,
            },
            stop_loss: 9.0,
            take_profit: 12.0,
            risk_reward_ratio: 2.0,
            risk_source: RiskSource::Fallback,
            expires_at: Utc::now() + Duration::seconds(20),
            category,
        }
    }

    /// Seven qualifying signals, mid-caps listed first with higher confidence.
    fn seven_signals() -> Vec<FilteredSignal> {
        let mut out: Vec<FilteredSignal> = MID
            .iter()
            .map(|s| signal(s, Category::MidCap, 0.95))
            .collect();
        out.extend(
            LARGE
                .iter()
                .enumerate()
                .map(|(i, s)| signal(s, Category::LargeCap, 0.70 + i as f64 * 0.05)),
        );
        out
    }

    fn orchestrator(api: Arc<dyn TradingApi>) -> TradeOrchestrator {
        let (_tx, rx) = watch::channel(Arc::new(active_set()));
        TradeOrchestrator::new(api, Arc::new(MarketCache::new()), rx, TradingConfig::default())
    }

    #[tokio::test]
    async fn test_caps_batch_and_sizes_evenly() {
        let api = Arc::new(MockTradingApi::new(1000.0));
        let orch = orchestrator(api.clone());

        let intents = orch.execute_auto_trades(&seven_signals()).await;

        assert_eq!(intents.len(), 5);
        assert!(intents.iter().all(|i| i.status == TradeStatus::Executed));
        assert!(intents.iter().all(|i| (i.size - 180.0).abs() < 1e-9));

        let symbols: Vec<&str> = intents.iter().map(|i| i.symbol.as_str()).collect();
        // Large-caps first by descending confidence, then the best mid-caps
        assert_eq!(&symbols[..3], &["SOL-USDT", "ETH-USDT", "BTC-USDT"]);
        assert!(symbols[3..].iter().all(|s| MID.iter().any(|m| s.starts_with(m))));

        let orders = api.orders();
        assert_eq!(orders.len(), 5);
        assert!(orders.iter().all(|o| (o.quantity - 18.0).abs() < 1e-9));
        assert!(orders.iter().all(|o| o.side == OrderSide::Buy));
        assert_eq!(api.protective.lock().unwrap().len(), 5);
        assert!(api.protective.lock().unwrap().iter().all(|p| p.side == OrderSide::Sell));
    }

    #[tokio::test]
    async fn test_open_positions_consume_slots() {
        let mut mock = MockTradingApi::new(1000.0);
        mock.open_positions = 3;
        let api = Arc::new(mock);
        let orch = orchestrator(api.clone());

        let intents = orch.execute_auto_trades(&seven_signals()).await;
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| (i.size - 450.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_batch() {
        let mut mock = MockTradingApi::new(1000.0);
        mock.reject.insert("ETH-USDT".to_string());
        let api = Arc::new(mock);
        let orch = orchestrator(api.clone());

        let intents = orch.execute_auto_trades(&seven_signals()).await;
        assert_eq!(intents.len(), 5);

        let failed: Vec<&TradeIntent> = intents.iter().filter(|i| i.status == TradeStatus::Failed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].symbol, "ETH-USDT");
        assert!(failed[0].error.as_deref().unwrap_or_default().contains("51008"));
        assert_eq!(api.orders().len(), 4);
    }

    #[tokio::test]
    async fn test_no_balance_places_nothing() {
        let api = Arc::new(MockTradingApi::new(0.0));
        let orch = orchestrator(api.clone());
        assert!(orch.execute_auto_trades(&seven_signals()).await.is_empty());

        let mut unavailable = MockTradingApi::new(0.0);
        unavailable.balance = Err(());
        let api2 = Arc::new(unavailable);
        let orch2 = orchestrator(api2.clone());
        assert!(orch2.execute_auto_trades(&seven_signals()).await.is_empty());

        assert!(api.orders().is_empty());
        assert!(api2.orders().is_empty());
    }

    #[tokio::test]
    async fn test_unapproved_and_expired_signals_skipped() {
        let api = Arc::new(MockTradingApi::new(1000.0));
        let orch = orchestrator(api.clone());

        let mut expired = signal("BTC", Category::LargeCap, 0.9);
        expired.expires_at = Utc::now() - Duration::seconds(1);
        let batch = vec![signal("PEPE", Category::MidCap, 0.99), expired, signal("ETH", Category::LargeCap, 0.8)];

        let intents = orch.execute_auto_trades(&batch).await;
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].symbol, "ETH-USDT");
        assert!((intents[0].size - 900.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_execute_trade_rejects_symbol_outside_active_set() {
        let api = Arc::new(MockTradingApi::new(1000.0));
        let orch = orchestrator(api.clone());

        let intent = orch
            .execute_trade("PEPE-USDT", Direction::Long, 100.0, Some(1.0), None, None)
            .await;
        assert_eq!(intent.status, TradeStatus::Failed);
        assert!(api.orders().is_empty());
    }

    #[tokio::test]
    async fn test_execute_trade_resolves_price_from_cache() {
        let api = Arc::new(MockTradingApi::new(1000.0));
        let (_tx, rx) = watch::channel(Arc::new(active_set()));
        let cache = Arc::new(MarketCache::new());
        let orch = TradeOrchestrator::new(api.clone(), cache.clone(), rx, TradingConfig::default());

        let missing = orch.execute_trade("BTC-USDT", Direction::Short, 100.0, None, None, None).await;
        assert_eq!(missing.status, TradeStatus::Failed);

        cache.put(
            "BTC-USDT",
            Channel::Ticker,
            MarketPayload::Ticker(Ticker {
                last: 50.0,
                bid: None,
                ask: None,
                open_24h: None,
                high_24h: None,
                low_24h: None,
                volume_24h: 0.0,
                ts: 0,
            }),
            1,
        );
        let filled = orch.execute_trade("BTC-USDT", Direction::Short, 100.0, None, None, None).await;
        assert_eq!(filled.status, TradeStatus::Executed);
        assert_eq!(filled.price, 50.0);
        assert_eq!(api.orders()[0].side, OrderSide::Sell);
        assert!((api.orders()[0].quantity - 2.0).abs() < 1e-9);
        assert!(api.protective.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paper_backend_end_to_end() {
        let backend = Arc::new(PaperTradingBackend::new(1000.0));
        let orch = orchestrator(backend.clone());

        let intents = orch.execute_auto_trades(&seven_signals()).await;
        assert_eq!(intents.len(), 5);
        assert!((backend.get_balance().await.unwrap() - 100.0).abs() < 1e-6);
        assert_eq!(backend.get_positions().await.unwrap().len(), 5);
        assert!(backend.protective_order("SOL-USDT").await.is_some());
    }
}
