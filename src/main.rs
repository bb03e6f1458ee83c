use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use marketflow::coingecko::CoinGeckoClient;
use marketflow::config::AppConfig;
use marketflow::feed::{FeedClient, FeedCommand, FeedEvent};
use marketflow::okx::OkxRestClient;
use marketflow::prediction::PredictionClient;
use marketflow::server::{self, ServerContext};
use marketflow::strategy::client_hub::ClientHub;
use marketflow::strategy::execution_backend::TradingApi;
use marketflow::strategy::market_cache::MarketCache;
use marketflow::strategy::okx_trading_backend::OkxTradingBackend;
use marketflow::strategy::orchestrator::TradeOrchestrator;
use marketflow::strategy::pair_selector::PairSelector;
use marketflow::strategy::paper_trading_backend::PaperTradingBackend;
use marketflow::strategy::signal_engine::{SignalEngine, SignalService};
use marketflow::DynError;

/// Graceful shutdown timeout: maximum time to wait for tasks to drain
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

const FEED_EVENT_CAPACITY: usize = 32_768;
const FEED_COMMAND_CAPACITY: usize = 1_024;

fn build_trading_api(config: &AppConfig) -> Result<Arc<dyn TradingApi>, DynError> {
    match &config.trading.credentials {
        Some(credentials) => {
            let backend = OkxTradingBackend::new(
                &config.okx_rest_url,
                credentials.clone(),
                &config.selector.quote,
                &config.trading,
                config.http_timeout,
            )?;
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(PaperTradingBackend::new(config.trading.paper_balance))),
    }
}

async fn wait_for_signal() -> Result<(), DynError> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), DynError> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("marketflow=info,warn")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| format!("invalid BIND_ADDR {}: {}", config.bind_addr, e))?;

    let okx_rest = Arc::new(OkxRestClient::new(config.okx_rest_url.clone(), config.http_timeout)?);
    let ranking = Arc::new(CoinGeckoClient::new(config.ranking_api_url.clone(), config.http_timeout)?);
    let predictions = Arc::new(PredictionClient::new(
        config.prediction_api_url.clone(),
        &config.selector.quote,
        config.http_timeout,
    )?);

    let shutdown = CancellationToken::new();
    let cache = Arc::new(MarketCache::new());

    let selector = Arc::new(PairSelector::new(config.selector.clone(), okx_rest.clone(), ranking));
    let active_set = selector.subscribe();

    let (event_tx, event_rx) = mpsc::channel::<FeedEvent>(FEED_EVENT_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel::<FeedCommand>(FEED_COMMAND_CAPACITY);

    let hub = Arc::new(ClientHub::new(
        config.hub.clone(),
        cache.clone(),
        active_set.clone(),
        command_tx,
    ));

    let feed = FeedClient::new(
        config.feed.clone(),
        cache.clone(),
        event_tx,
        command_rx,
        active_set.clone(),
    );

    let orchestrator = if config.trading.auto_trade_enabled {
        let api = build_trading_api(&config)?;
        info!(backend = api.backend_name(), "auto-trading enabled");
        Some(Arc::new(TradeOrchestrator::new(
            api,
            cache.clone(),
            active_set.clone(),
            config.trading.clone(),
        )))
    } else {
        info!("auto-trading disabled");
        None
    };

    let signals = SignalService::new(
        SignalEngine::new(config.signal.clone(), config.risk.clone()),
        predictions,
        okx_rest.clone(),
        active_set.clone(),
        hub.clone(),
        orchestrator,
    );

    let ctx = Arc::new(ServerContext {
        hub: hub.clone(),
        cache: cache.clone(),
        active_set,
        tickers: okx_rest,
        quote: config.selector.quote.clone(),
        cache_ttl: config.hub.cache_ttl,
    });

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(tokio::spawn(selector.clone().run(shutdown.clone())));
    handles.push(tokio::spawn(feed.run(shutdown.clone())));
    handles.push(tokio::spawn(hub.clone().run_event_pump(event_rx, shutdown.clone())));
    handles.push(tokio::spawn(hub.clone().run_heartbeat(shutdown.clone())));
    handles.push(tokio::spawn(hub.clone().run_active_set_watch(shutdown.clone())));
    handles.push(tokio::spawn(signals.run(shutdown.clone())));

    let server_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = server::serve(ctx, addr, server_shutdown.clone()).await {
            error!(error = %e, "client server failed to start");
            server_shutdown.cancel();
        }
    }));

    info!(addr = %addr, "marketflow started");

    tokio::select! {
        result = wait_for_signal() => result?,
        _ = shutdown.cancelled() => warn!("a component requested shutdown"),
    }
    shutdown.cancel();

    info!(timeout_secs = SHUTDOWN_TIMEOUT_SECS, "waiting for components to shut down");
    let joined = tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        futures_util::future::join_all(handles),
    )
    .await;

    match joined {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!(error = %e, "task ended abnormally");
                }
            }
            info!("graceful shutdown completed");
            Ok(())
        }
        Err(_) => {
            error!(timeout_secs = SHUTDOWN_TIMEOUT_SECS, "graceful shutdown timed out, forcing exit");
            Err("Shutdown timeout".into())
        }
    }
}
