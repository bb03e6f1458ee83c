//! Upstream exchange stream client.
//!
//! One persistent WebSocket connection. Subscriptions are derived from the
//! active symbol set (baseline channels) plus candle channels demanded by
//! downstream clients, and are re-issued in full on every reconnect.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Subscribing -> Streaming
//!      ^                                                      |
//!      +------------- Reconnecting <--------------------------+
//! ```

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::exchange_parser::normalize_payload;
use crate::okx::{self, InboundFrame, SUBSCRIBE_ARGS_PER_MSG};
use crate::strategy::market_cache::MarketCache;
use crate::strategy::pair_selector::ActiveSymbolSet;
use crate::strategy::types::{ChannelArg, MarketEvent};
use crate::utils::{self, ReconnectPolicy};

type OkxWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const SUBSCRIBE_BATCH_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Streaming,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Market(MarketEvent),
    State(FeedState),
    /// Reconnect attempts exhausted; the client has stopped.
    ReconnectFailed { attempts: u32 },
}

/// Subscription changes requested by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    Subscribe(Vec<ChannelArg>),
    Unsubscribe(Vec<ChannelArg>),
}

impl FeedCommand {
    pub fn is_empty(&self) -> bool {
        match self {
            FeedCommand::Subscribe(args) | FeedCommand::Unsubscribe(args) => args.is_empty(),
        }
    }
}

/// Args to subscribe and unsubscribe to move the connection to a new target.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubscriptionDiff {
    pub subscribe: Vec<ChannelArg>,
    pub unsubscribe: Vec<ChannelArg>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

enum Step {
    Shutdown,
    Ping,
    Command(Option<FeedCommand>),
    ActiveSet(bool),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

pub struct FeedClient {
    config: FeedConfig,
    cache: Arc<MarketCache>,
    events: mpsc::Sender<FeedEvent>,
    commands: mpsc::Receiver<FeedCommand>,
    active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
    state: FeedState,
    policy: ReconnectPolicy,
    /// Client-driven channels on top of the baseline.
    demanded: BTreeSet<ChannelArg>,
    /// What the live connection is currently subscribed to.
    subscribed: BTreeSet<ChannelArg>,
}

impl FeedClient {
    pub fn new(
        config: FeedConfig,
        cache: Arc<MarketCache>,
        events: mpsc::Sender<FeedEvent>,
        commands: mpsc::Receiver<FeedCommand>,
        active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
    ) -> Self {
        let policy = ReconnectPolicy::new(
            config.reconnect_base_ms,
            config.reconnect_factor,
            config.reconnect_max_attempts,
        );
        Self {
            config,
            cache,
            events,
            commands,
            active_set,
            state: FeedState::Disconnected,
            policy,
            demanded: BTreeSet::new(),
            subscribed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn subscribed(&self) -> &BTreeSet<ChannelArg> {
        &self.subscribed
    }

    async fn set_state(&mut self, state: FeedState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "feed state");
        self.state = state;
        let _ = self.events.send(FeedEvent::State(state)).await;
    }

    fn baseline(&self, set: &ActiveSymbolSet) -> BTreeSet<ChannelArg> {
        let mut args = BTreeSet::new();
        for symbol in set.symbols() {
            for channel in &self.config.channels {
                args.insert(ChannelArg::new(channel.clone(), symbol.clone()));
            }
        }
        args
    }

    /// Everything the connection should be subscribed to right now.
    pub fn desired_args(&self) -> BTreeSet<ChannelArg> {
        let set = self.active_set.borrow().clone();
        let mut args = self.baseline(&set);
        args.extend(self.demanded.iter().cloned());
        args
    }

    /// Mark the connection as subscribed to the full desired set and return it.
    pub fn begin_subscription(&mut self) -> Vec<ChannelArg> {
        self.subscribed = self.desired_args();
        self.subscribed.iter().cloned().collect()
    }

    /// Fold a hub command into the demanded set and return the wire changes.
    /// Baseline channels for active symbols are never unsubscribed here.
    pub fn apply_command(&mut self, command: FeedCommand) -> SubscriptionDiff {
        let mut diff = SubscriptionDiff::default();
        match command {
            FeedCommand::Subscribe(args) => {
                for arg in args {
                    self.demanded.insert(arg.clone());
                    if self.subscribed.insert(arg.clone()) {
                        diff.subscribe.push(arg);
                    }
                }
            }
            FeedCommand::Unsubscribe(args) => {
                let set = self.active_set.borrow().clone();
                let baseline = self.baseline(&set);
                for arg in args {
                    self.demanded.remove(&arg);
                    if !baseline.contains(&arg) && self.subscribed.remove(&arg) {
                        diff.unsubscribe.push(arg);
                    }
                }
            }
        }
        diff
    }

    /// Reconcile the subscribed set with a new active set and drop cached data
    /// for symbols that left it. Client demand for symbols outside the new set is dropped with them.
    pub fn apply_active_set(&mut self) -> SubscriptionDiff {
        let keep = self.active_set.borrow().symbol_set();
        self.demanded.retain(|a| keep.contains(&a.inst_id));

        let desired = self.desired_args();
        let diff = SubscriptionDiff {
            subscribe: desired.difference(&self.subscribed).cloned().collect(),
            unsubscribe: self.subscribed.difference(&desired).cloned().collect(),
        };
        self.subscribed = desired;

        let evicted = self.cache.retain_symbols(&keep);
        if evicted > 0 {
            debug!(evicted, "evicted cache entries for inactive symbols");
        }
        diff
    }

    /// Parse one text frame, store market data in the cache and return the
    /// normalised event. Control frames and malformed data yield `None`.
    pub fn on_message(&self, text: &str) -> Option<MarketEvent> {
        let frame = match okx::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "undecodable upstream frame");
                return None;
            }
        };

        match frame {
            InboundFrame::Data { arg, data } => {
                let payload = match normalize_payload(&arg.channel, &data) {
                    Some(payload) => payload,
                    None => {
                        warn!(channel = %arg.channel, symbol = %arg.inst_id, "malformed payload dropped");
                        return None;
                    }
                };
                let timestamp = utils::now_ms();
                self.cache.put(&arg.inst_id, arg.channel.clone(), payload.clone(), timestamp);
                Some(MarketEvent {
                    symbol: arg.inst_id,
                    channel: arg.channel,
                    payload,
                    timestamp,
                })
            }
            InboundFrame::Error { code, message } => {
                // Not fatal: one bad arg must not drop every other subscription
                let rejected = FeedError::Rejected { code, message };
                warn!(error = %rejected, "upstream request failed");
                None
            }
            InboundFrame::Subscribed(arg) => {
                debug!(channel = %arg.channel, symbol = %arg.inst_id, "subscribed");
                None
            }
            InboundFrame::Unsubscribed(arg) => {
                debug!(channel = %arg.channel, symbol = %arg.inst_id, "unsubscribed");
                None
            }
            InboundFrame::Pong | InboundFrame::Ignored => None,
        }
    }

    async fn send_diff(&self, write: &mut OkxWrite, diff: SubscriptionDiff) -> Result<(), FeedError> {
        if diff.is_empty() {
            return Ok(());
        }
        debug!(subscribe = diff.subscribe.len(), unsubscribe = diff.unsubscribe.len(), "updating subscriptions");
        let send_timeout = self.config.connect_timeout;
        send_text_frames(write, okx::unsubscribe_frames(&diff.unsubscribe), send_timeout, "unsubscribe").await?;
        send_text_frames(write, okx::subscribe_frames(&diff.subscribe), send_timeout, "subscribe").await
    }

    async fn connect_and_stream(&mut self, shutdown: &CancellationToken) -> Result<(), FeedError> {
        self.set_state(FeedState::Connecting).await;
        let (ws, _) = timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.ws_url.as_str()),
        )
        .await
        .map_err(|_| FeedError::Timeout { stage: "connect" })??;

        self.policy.reset();
        self.set_state(FeedState::Connected).await;
        info!(url = %self.config.ws_url, "upstream connected");

        let (mut write, mut read) = ws.split();

        self.set_state(FeedState::Subscribing).await;
        let args = self.begin_subscription();
        let send_timeout = self.config.connect_timeout;
        utils::subscribe_in_batches(&mut write, &args, SUBSCRIBE_ARGS_PER_MSG, SUBSCRIBE_BATCH_DELAY_MS, |w, chunk| {
            Box::pin(async move { send_text_frames(w, okx::subscribe_frames(chunk), send_timeout, "subscribe").await })
        })
        .await?;
        info!(args = args.len(), "upstream subscriptions issued");

        self.set_state(FeedState::Streaming).await;

        let mut ping_tick = utils::interval_secs(self.config.ping_interval.as_secs());
        ping_tick.tick().await;
        let mut commands_open = true;
        let mut active_set_open = true;

        loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => Step::Shutdown,
                _ = ping_tick.tick() => Step::Ping,
                cmd = self.commands.recv(), if commands_open => Step::Command(cmd),
                changed = self.active_set.changed(), if active_set_open => Step::ActiveSet(changed.is_ok()),
                msg = read.next() => Step::Frame(msg),
            };

            match step {
                Step::Shutdown => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Step::Ping => {
                    let frame = okx::ping_frame(utils::now_ms());
                    match timeout(send_timeout, write.send(Message::Text(frame))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(FeedError::PingFailed(e.to_string())),
                        Err(_) => return Err(FeedError::PingFailed("send timed out".to_string())),
                    }
                }
                Step::Command(Some(command)) => {
                    let diff = self.apply_command(command);
                    self.send_diff(&mut write, diff).await?;
                }
                Step::Command(None) => commands_open = false,
                Step::ActiveSet(true) => {
                    let diff = self.apply_active_set();
                    self.send_diff(&mut write, diff).await?;
                }
                Step::ActiveSet(false) => active_set_open = false,
                Step::Frame(None) => return Err(FeedError::Closed),
                Step::Frame(Some(Err(e))) => return Err(e.into()),
                Step::Frame(Some(Ok(msg))) => match msg {
                    Message::Text(text) => {
                        if let Some(event) = self.on_message(&text) {
                            if self.events.send(FeedEvent::Market(event)).await.is_err() {
                                debug!("feed event receiver dropped");
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => return Err(FeedError::Closed),
                    _ => {}
                },
            }
        }
    }

    /// Connect, stream and reconnect with backoff until shutdown or until the
    /// attempt budget is spent.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let result = self.connect_and_stream(&shutdown).await;
            self.subscribed.clear();

            if shutdown.is_cancelled() {
                break;
            }
            match result {
                Ok(()) => info!("upstream stream ended"),
                Err(e) => warn!(error = %e, "upstream connection lost"),
            }

            self.set_state(FeedState::Reconnecting).await;
            let delay = match self.policy.next_delay() {
                Some(delay) => delay,
                None => {
                    let attempts = self.policy.attempts();
                    error!(attempts, "reconnect attempts exhausted, feed halted");
                    self.set_state(FeedState::Disconnected).await;
                    let _ = self.events.send(FeedEvent::ReconnectFailed { attempts }).await;
                    return;
                }
            };

            warn!(
                attempt = self.policy.attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting upstream"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(FeedState::Disconnected).await;
        debug!("feed client stopped");
    }
}

async fn send_text_frames(
    write: &mut OkxWrite,
    frames: Vec<String>,
    send_timeout: Duration,
    stage: &'static str,
) -> Result<(), FeedError> {
    for frame in frames {
        timeout(send_timeout, write.send(Message::Text(frame)))
            .await
            .map_err(|_| FeedError::Timeout { stage })??;
    }
    Ok(())
}

