//! Downstream surface: the client WebSocket plus the REST fallback and ops
//! endpoints, served with warp.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::feed::FeedState;
use crate::strategy::client_hub::{ClientHub, Outbound, ServerMessage};
use crate::strategy::fallback;
use crate::strategy::market_cache::MarketCache;
use crate::strategy::pair_selector::{ActiveSymbolSet, TickerSource};
use crate::utils;

pub struct ServerContext {
    pub hub: Arc<ClientHub>,
    pub cache: Arc<MarketCache>,
    pub active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
    pub tickers: Arc<dyn TickerSource>,
    pub quote: String,
    pub cache_ttl: Duration,
}

impl ServerContext {
    fn active(&self) -> Arc<ActiveSymbolSet> {
        self.active_set.borrow().clone()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub feed: FeedState,
    pub clients: usize,
    pub cache_entries: usize,
    pub cache_symbols: usize,
    pub active_symbols: usize,
    pub timestamp: i64,
}

fn with_ctx(ctx: Arc<ServerContext>) -> impl Filter<Extract = (Arc<ServerContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

pub fn routes(ctx: Arc<ServerContext>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_ctx(ctx.clone()))
        .map(|ws: warp::ws::Ws, ctx: Arc<ServerContext>| {
            let hub = ctx.hub.clone();
            ws.on_upgrade(move |socket| handle_socket(hub, socket))
        });

    let fallback_route = warp::path!("market" / "fallback")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(fallback_handler);

    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(health_handler);

    let pairs_route = warp::path("pairs")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_ctx(ctx))
        .and_then(pairs_handler);

    ws_route
        .or(fallback_route)
        .or(health_route)
        .or(pairs_route)
        .with(warp::cors().allow_any_origin())
}

async fn fallback_handler(ctx: Arc<ServerContext>) -> Result<impl warp::Reply, Infallible> {
    let active = ctx.active();
    let response = fallback::assemble(
        &ctx.cache,
        &active,
        ctx.tickers.as_ref(),
        &ctx.quote,
        ctx.cache_ttl,
        utils::now_ms(),
    )
    .await;
    Ok(warp::reply::json(&response))
}

async fn health_handler(ctx: Arc<ServerContext>) -> Result<impl warp::Reply, Infallible> {
    let feed = ctx.hub.feed_state().await;
    let report = HealthReport {
        status: if feed == FeedState::Streaming { "ok" } else { "degraded" },
        feed,
        clients: ctx.hub.client_count().await,
        cache_entries: ctx.cache.len(),
        cache_symbols: ctx.cache.symbol_count(),
        active_symbols: ctx.active().len(),
        timestamp: utils::now_ms(),
    };
    Ok(warp::reply::json(&report))
}

async fn pairs_handler(ctx: Arc<ServerContext>) -> Result<impl warp::Reply, Infallible> {
    let active = ctx.active();
    Ok(warp::reply::json(&*active))
}

async fn handle_socket(hub: Arc<ClientHub>, ws: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let client_id = match hub.on_client_connect(tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "refusing client connection");
            if let Ok(text) = serde_json::to_string(&ServerMessage::from(&e)) {
                let _ = ws_sender.send(Message::text(text)).await;
            }
            let _ = ws_sender.send(Message::close()).await;
            return;
        }
    };

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let message = match frame {
                    Some(Outbound::Message(message)) => match serde_json::to_string(&message) {
                        Ok(text) => Message::text(text),
                        Err(e) => {
                            error!(client = %client_id, error = %e, "failed to serialize message");
                            continue;
                        }
                    },
                    Some(Outbound::Ping) => Message::ping(Vec::new()),
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::close()).await;
                        break;
                    }
                };
                if let Err(e) = ws_sender.send(message).await {
                    debug!(client = %client_id, error = %e, "send to client failed");
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(msg)) => {
                    if let Ok(text) = msg.to_str() {
                        hub.handle_client_message(client_id, text).await;
                    } else if msg.is_pong() || msg.is_ping() {
                        hub.mark_alive(client_id).await;
                    } else if msg.is_close() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(client = %client_id, error = %e, "client socket error");
                    break;
                }
                None => break,
            }
        }
    }

    hub.on_client_disconnect(client_id).await;
}

/// Serve until `shutdown` fires. Binding failures are returned to the caller.
pub async fn serve(ctx: Arc<ServerContext>, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), warp::Error> {
    let (bound, server) = warp::serve(routes(ctx))
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })?;
    info!(addr = %bound, "client server listening");
    server.await;
    info!("client server stopped");
    Ok(())
}
