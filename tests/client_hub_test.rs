/// Integration tests for the downstream client hub: subscription acks,
/// candle demand reference counting, active-set pruning, filtered fan-out
/// and heartbeats.

#[cfg(test)]
mod client_hub_tests {
    use marketflow::config::HubConfig;
    use marketflow::error::HubError;
    use marketflow::feed::{FeedCommand, FeedEvent, FeedState};
    use marketflow::strategy::client_hub::{ClientHub, Outbound, ServerMessage};
    use marketflow::strategy::market_cache::MarketCache;
    use marketflow::strategy::pair_selector::ActiveSymbolSet;
    use marketflow::strategy::types::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Harness {
        hub: Arc<ClientHub>,
        cache: Arc<MarketCache>,
        commands: mpsc::Receiver<FeedCommand>,
        set_tx: watch::Sender<Arc<ActiveSymbolSet>>,
    }

    fn set_of(ids: &[&str]) -> Arc<ActiveSymbolSet> {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        Arc::new(ActiveSymbolSet::from_static(&ids, "USDT", 1, 1))
    }

    fn harness(max_clients: usize) -> Harness {
        harness_with_queue(max_clients, 64)
    }

    fn harness_with_queue(max_clients: usize, queue: usize) -> Harness {
        let (set_tx, rx) = watch::channel(set_of(&["BTC-USDT", "ETH-USDT"]));
        let cache = Arc::new(MarketCache::new());
        let (cmd_tx, commands) = mpsc::channel(queue);
        let config = HubConfig {
            max_clients,
            ..HubConfig::default()
        };
        let hub = Arc::new(ClientHub::new(config, cache.clone(), rx, cmd_tx));
        Harness {
            hub,
            cache,
            commands,
            set_tx,
        }
    }

    async fn connect(hub: &ClientHub) -> (Uuid, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.on_client_connect(tx).await.unwrap();
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn ticker_event(symbol: &str, last: f64) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            channel: Channel::Ticker,
            payload: MarketPayload::Ticker(Ticker {
                last,
                bid: None,
                ask: None,
                open_24h: None,
                high_24h: None,
                low_24h: None,
                volume_24h: 0.0,
                ts: 0,
            }),
            timestamp: 1,
        }
    }

    fn candle_event(symbol: &str, tf: Timeframe) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            channel: Channel::Candle(tf),
            payload: MarketPayload::Candle(Candle {
                ts: 0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                confirmed: false,
            }),
            timestamp: 1,
        }
    }

    fn btc() -> Vec<String> {
        vec!["BTC-USDT".to_string()]
    }

    #[tokio::test]
    async fn test_connect_pushes_snapshot_of_active_symbols() {
        let h = harness(10);
        h.cache.put("BTC-USDT", Channel::Ticker, ticker_event("BTC-USDT", 1.0).payload, 5);
        h.cache.put("XRP-USDT", Channel::Ticker, ticker_event("XRP-USDT", 1.0).payload, 5);

        let (_, mut rx) = connect(&h.hub).await;
        match drain(&mut rx).as_slice() {
            [Outbound::Message(ServerMessage::Snapshot { data, .. })] => {
                assert!(data.contains_key("BTC-USDT"));
                assert!(!data.contains_key("XRP-USDT"));
            }
            other => panic!("expected one snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_clients_refused() {
        let h = harness(1);
        let _first = connect(&h.hub).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = h.hub.on_client_connect(tx).await.unwrap_err();
        assert_eq!(err, HubError::TooManyClients(1));
        assert_eq!(err.code(), "TOO_MANY_CLIENTS");
    }

    #[tokio::test]
    async fn test_subscribe_validates_and_partitions() {
        let h = harness(10);
        let (id, _rx) = connect(&h.hub).await;

        let err = h
            .hub
            .on_client_subscribe(id, &["BTC-USDT".to_string(), "btc".to_string()], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SYMBOL");
        assert_eq!(h.hub.client_symbols(id).await.unwrap(), Vec::<String>::new());

        let ack = h
            .hub
            .on_client_subscribe(id, &["btc-usdt".to_string(), "XRP-USDT".to_string()], None)
            .await
            .unwrap();
        assert_eq!(ack.accepted, btc());
        assert_eq!(ack.rejected, vec!["XRP-USDT".to_string()]);
    }

    #[tokio::test]
    async fn test_candle_demand_is_reference_counted() {
        let mut h = harness(10);
        let (a, _rx_a) = connect(&h.hub).await;
        let (b, _rx_b) = connect(&h.hub).await;
        let arg = ChannelArg::new(Channel::Candle(Timeframe::M15), "BTC-USDT");

        h.hub.on_client_subscribe(a, &btc(), Some(Timeframe::M15)).await.unwrap();
        assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Subscribe(vec![arg.clone()]));

        h.hub.on_client_subscribe(b, &btc(), Some(Timeframe::M15)).await.unwrap();
        assert_eq!(h.hub.demand_for(&arg).await, 2);
        assert!(h.commands.try_recv().is_err(), "second client adds no upstream subscription");

        h.hub.on_client_disconnect(a).await;
        assert_eq!(h.hub.demand_for(&arg).await, 1);
        assert!(h.commands.try_recv().is_err());

        let removed = h.hub.on_client_unsubscribe(b, None).await.unwrap();
        assert_eq!(removed, btc());
        assert_eq!(h.hub.demand_for(&arg).await, 0);
        assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Unsubscribe(vec![arg]));
    }

    #[tokio::test]
    async fn test_timeframe_switch_moves_demand() {
        let mut h = harness(10);
        let (id, _rx) = connect(&h.hub).await;
        let m15 = ChannelArg::new(Channel::Candle(Timeframe::M15), "BTC-USDT");
        let h1 = ChannelArg::new(Channel::Candle(Timeframe::H1), "BTC-USDT");

        h.hub.on_client_subscribe(id, &btc(), Some(Timeframe::M15)).await.unwrap();
        let _ = h.commands.try_recv();

        let ack = h.hub.on_client_subscribe(id, &btc(), Some(Timeframe::H1)).await.unwrap();
        assert_eq!(ack.timeframe, Some(Timeframe::H1));
        assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Subscribe(vec![h1]));
        assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Unsubscribe(vec![m15]));
    }

    #[tokio::test]
    async fn test_inactive_symbols_release_demand() {
        let mut h = harness(10);
        let (id, _rx) = connect(&h.hub).await;
        let btc_arg = ChannelArg::new(Channel::Candle(Timeframe::M15), "BTC-USDT");
        let eth_arg = ChannelArg::new(Channel::Candle(Timeframe::M15), "ETH-USDT");

        let both = vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()];
        h.hub.on_client_subscribe(id, &both, Some(Timeframe::M15)).await.unwrap();
        let _ = h.commands.try_recv();

        h.set_tx.send(set_of(&["BTC-USDT", "SOL-USDT"])).unwrap();
        let released = h.hub.prune_inactive().await;

        assert_eq!(released, vec![eth_arg.clone()]);
        assert_eq!(h.hub.client_symbols(id).await.unwrap(), btc());
        assert_eq!(h.hub.demand_for(&eth_arg).await, 0);
        assert_eq!(h.hub.demand_for(&btc_arg).await, 1);
        assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Unsubscribe(vec![eth_arg]));

        // Nothing left to prune
        assert!(h.hub.prune_inactive().await.is_empty());
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_active_set_watch_prunes_on_publish() {
        let mut h = harness(10);
        let (id, _rx) = connect(&h.hub).await;
        h.hub
            .on_client_subscribe(id, &["ETH-USDT".to_string()], Some(Timeframe::H1))
            .await
            .unwrap();
        let _ = h.commands.try_recv();

        let shutdown = CancellationToken::new();
        let watcher = tokio::spawn(h.hub.clone().run_active_set_watch(shutdown.clone()));
        h.set_tx.send(set_of(&["BTC-USDT"])).unwrap();

        let command = tokio::time::timeout(Duration::from_secs(2), h.commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            FeedCommand::Unsubscribe(vec![ChannelArg::new(Channel::Candle(Timeframe::H1), "ETH-USDT")])
        );
        assert!(h.hub.client_symbols(id).await.unwrap().is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), watcher).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_full_feed_queue_never_blocks_clients() {
        // Room for one command and nobody draining it
        let h = harness_with_queue(10, 1);
        let (a, _rx_a) = connect(&h.hub).await;
        let (b, _rx_b) = connect(&h.hub).await;
        let eth_arg = ChannelArg::new(Channel::Candle(Timeframe::M15), "ETH-USDT");

        let done = tokio::time::timeout(Duration::from_secs(2), async {
            h.hub.on_client_subscribe(a, &btc(), Some(Timeframe::M15)).await.unwrap();
            h.hub
                .on_client_subscribe(b, &["ETH-USDT".to_string()], Some(Timeframe::M15))
                .await
                .unwrap();
            h.hub.on_client_disconnect(a).await;
        })
        .await;
        assert!(done.is_ok(), "hub waited on a full feed queue");

        // Bookkeeping is intact even though the upstream commands were dropped
        assert_eq!(h.hub.demand_for(&eth_arg).await, 1);
        assert_eq!(h.hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_symbol_is_noop() {
        let mut h = harness(10);
        let (id, _rx) = connect(&h.hub).await;
        h.hub.on_client_subscribe(id, &btc(), Some(Timeframe::M5)).await.unwrap();
        let _ = h.commands.try_recv();

        let removed = h
            .hub
            .on_client_unsubscribe(id, Some(&["ETH-USDT".to_string()]))
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert!(h.commands.try_recv().is_err(), "no upstream unsubscribe for a no-op");
        assert_eq!(h.hub.client_symbols(id).await.unwrap(), btc());
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_symbol_and_timeframe() {
        let h = harness(10);
        let (a, mut rx_a) = connect(&h.hub).await;
        let (b, mut rx_b) = connect(&h.hub).await;
        h.hub.on_client_subscribe(a, &btc(), Some(Timeframe::M15)).await.unwrap();
        h.hub
            .on_client_subscribe(b, &["ETH-USDT".to_string()], Some(Timeframe::H1))
            .await
            .unwrap();

        assert_eq!(h.hub.broadcast(&ticker_event("BTC-USDT", 10.0)).await, 1);
        assert_eq!(h.hub.broadcast(&candle_event("BTC-USDT", Timeframe::H1)).await, 0);
        assert_eq!(h.hub.broadcast(&candle_event("BTC-USDT", Timeframe::M15)).await, 1);
        assert_eq!(h.hub.broadcast(&ticker_event("XRP-USDT", 1.0)).await, 0);

        let a_frames = drain(&mut rx_a);
        assert_eq!(a_frames.len(), 2);
        assert!(matches!(
            &a_frames[0],
            Outbound::Message(ServerMessage::MarketData { symbol, .. }) if symbol == "BTC-USDT"
        ));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_protocol_errors_answered_in_band() {
        let h = harness(10);
        let (id, mut rx) = connect(&h.hub).await;

        h.hub.handle_client_message(id, r#"{"type":"launch"}"#).await;
        h.hub.handle_client_message(id, "not json").await;
        h.hub
            .handle_client_message(id, r#"{"type":"subscribe","symbols":["BTC-USDT"],"timeframe":"7m"}"#)
            .await;
        h.hub
            .handle_client_message(id, r#"{"type":"subscribe","symbols":["BTC-USDT"],"timeframe":"15m"}"#)
            .await;
        h.hub.handle_client_message(id, r#"{"type":"ping"}"#).await;

        let codes: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|frame| match frame {
                Outbound::Message(ServerMessage::Error { code, .. }) => code,
                Outbound::Message(ServerMessage::Subscribed { .. }) => "subscribed".to_string(),
                Outbound::Message(ServerMessage::Pong { .. }) => "pong".to_string(),
                other => format!("{:?}", other),
            })
            .collect();
        assert_eq!(
            codes,
            vec!["UNKNOWN_MESSAGE", "MALFORMED_MESSAGE", "INVALID_TIMEFRAME", "subscribed", "pong"]
        );
        assert_eq!(h.hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_drops_silent_clients() {
        let h = harness(10);
        let (quiet, mut rx_quiet) = connect(&h.hub).await;
        let (chatty, mut rx_chatty) = connect(&h.hub).await;

        assert!(h.hub.heartbeat_sweep().await.is_empty());
        assert!(matches!(drain(&mut rx_quiet).as_slice(), [Outbound::Ping]));
        assert!(matches!(drain(&mut rx_chatty).as_slice(), [Outbound::Ping]));

        h.hub.mark_alive(chatty).await;
        let dropped = h.hub.heartbeat_sweep().await;
        assert_eq!(dropped, vec![quiet]);
        assert!(matches!(drain(&mut rx_quiet).as_slice(), [Outbound::Close]));
        assert_eq!(h.hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconnect_failure_broadcasts_status() {
        let h = harness(10);
        let (_id, mut rx) = connect(&h.hub).await;

        h.hub.handle_feed_event(FeedEvent::State(FeedState::Streaming)).await;
        assert_eq!(h.hub.feed_state().await, FeedState::Streaming);

        h.hub.handle_feed_event(FeedEvent::ReconnectFailed { attempts: 10 }).await;
        assert_eq!(h.hub.feed_state().await, FeedState::Disconnected);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::Message(ServerMessage::Status { feed: FeedState::Disconnected, .. })]
        ));
    }
}
