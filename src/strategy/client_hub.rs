//! Downstream subscriber registry and fan-out.
//!
//! Each client owns an unbounded outbound queue drained by its connection
//! task. Upstream candle channels requested by clients are reference counted
//! per (channel, symbol): the feed is told to subscribe on the first demand
//! and to unsubscribe when the last client goes away.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::feed::{FeedCommand, FeedEvent, FeedState};
use crate::strategy::market_cache::{CacheSnapshot, MarketCache};
use crate::strategy::pair_selector::ActiveSymbolSet;
use crate::strategy::types::{Channel, ChannelArg, FilteredSignal, MarketEvent, MarketPayload, Timeframe};
use crate::utils;

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Snapshot {
        data: CacheSnapshot,
        timestamp: i64,
    },
    MarketData {
        symbol: String,
        channel: Channel,
        data: MarketPayload,
        timestamp: i64,
    },
    Subscribed {
        symbols: Vec<String>,
        rejected: Vec<String>,
        timeframe: Option<Timeframe>,
    },
    Unsubscribed {
        symbols: Vec<String>,
    },
    Error {
        code: String,
        message: String,
    },
    Signals {
        signals: Vec<FilteredSignal>,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Status {
        feed: FeedState,
        message: String,
    },
}

impl From<&HubError> for ServerMessage {
    fn from(err: &HubError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        symbols: Vec<String>,
        #[serde(default)]
        timeframe: Option<String>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Option<Vec<String>>,
    },
    Ping,
}

const CLIENT_MESSAGE_TYPES: &[&str] = &["subscribe", "unsubscribe", "ping"];

pub fn parse_client_message(text: &str) -> Result<ClientMessage, HubError> {
    let value: Value = serde_json::from_str(text).map_err(|e| HubError::MalformedMessage(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::MalformedMessage("missing \"type\"".to_string()))?;
    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Err(HubError::UnknownMessage(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| HubError::MalformedMessage(e.to_string()))
}

/// Frames queued for a client's connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeAck {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub timeframe: Option<Timeframe>,
}

struct ClientSession {
    sender: mpsc::UnboundedSender<Outbound>,
    symbols: BTreeSet<String>,
    timeframe: Option<Timeframe>,
    alive: bool,
    last_heartbeat: Instant,
}

impl ClientSession {
    fn send(&self, frame: Outbound) -> bool {
        self.sender.send(frame).is_ok()
    }

    fn candle_args(&self) -> Vec<ChannelArg> {
        match self.timeframe {
            Some(tf) => self
                .symbols
                .iter()
                .map(|s| ChannelArg::new(Channel::Candle(tf), s.clone()))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Default)]
struct HubState {
    clients: HashMap<Uuid, ClientSession>,
    demand: HashMap<ChannelArg, usize>,
    feed_state: FeedState,
}

impl HubState {
    /// Increment demand; returns args that went 0 -> 1.
    fn acquire(&mut self, args: Vec<ChannelArg>) -> Vec<ChannelArg> {
        let mut first = Vec::new();
        for arg in args {
            let count = self.demand.entry(arg.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                first.push(arg);
            }
        }
        first
    }

    /// Decrement demand; returns args that went 1 -> 0.
    fn release(&mut self, args: Vec<ChannelArg>) -> Vec<ChannelArg> {
        let mut last = Vec::new();
        for arg in args {
            if let Some(count) = self.demand.get_mut(&arg) {
                *count -= 1;
                if *count == 0 {
                    self.demand.remove(&arg);
                    last.push(arg);
                }
            }
        }
        last
    }

    fn remove_client(&mut self, id: &Uuid) -> Option<Vec<ChannelArg>> {
        let session = self.clients.remove(id)?;
        Some(self.release(session.candle_args()))
    }
}

pub struct ClientHub {
    config: HubConfig,
    cache: Arc<MarketCache>,
    active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
    feed_commands: mpsc::Sender<FeedCommand>,
    state: RwLock<HubState>,
}

impl ClientHub {
    pub fn new(
        config: HubConfig,
        cache: Arc<MarketCache>,
        active_set: watch::Receiver<Arc<ActiveSymbolSet>>,
        feed_commands: mpsc::Sender<FeedCommand>,
    ) -> Self {
        Self {
            config,
            cache,
            active_set,
            feed_commands,
            state: RwLock::new(HubState::default()),
        }
    }

    fn active(&self) -> Arc<ActiveSymbolSet> {
        self.active_set.borrow().clone()
    }

    /// Never waits on the feed: while it is reconnecting the channel is not
    /// drained, and a reconnect re-issues the full desired set anyway.
    fn send_feed(&self, command: FeedCommand) {
        if command.is_empty() {
            return;
        }
        match self.feed_commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(?command, "feed command queue full, change applies on next resubscribe");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("feed command channel closed"),
        }
    }

    /// Register a client and push the current snapshot when the cache has data.
    pub async fn on_client_connect(&self, sender: mpsc::UnboundedSender<Outbound>) -> Result<Uuid, HubError> {
        let mut state = self.state.write().await;
        if state.clients.len() >= self.config.max_clients {
            return Err(HubError::TooManyClients(self.config.max_clients));
        }

        let id = Uuid::new_v4();
        let session = ClientSession {
            sender,
            symbols: BTreeSet::new(),
            timeframe: None,
            alive: true,
            last_heartbeat: Instant::now(),
        };

        if !self.cache.is_empty() {
            let active = self.active();
            let data = self.cache.snapshot_for(active.symbols().iter());
            if !data.is_empty() {
                session.send(Outbound::Message(ServerMessage::Snapshot {
                    data,
                    timestamp: utils::now_ms(),
                }));
            }
        }

        state.clients.insert(id, session);
        info!(client = %id, total = state.clients.len(), "client connected");
        Ok(id)
    }

    pub async fn on_client_subscribe(
        &self,
        id: Uuid,
        symbols: &[String],
        timeframe: Option<Timeframe>,
    ) -> Result<SubscribeAck, HubError> {
        let suffix = format!("-{}", self.config.quote);
        let requested: Vec<String> = symbols.iter().map(|s| s.trim().to_ascii_uppercase()).collect();
        if let Some(bad) = requested.iter().find(|s| !s.ends_with(&suffix) || s.len() <= suffix.len()) {
            return Err(HubError::InvalidSymbol {
                symbol: bad.clone(),
                quote: self.config.quote.clone(),
            });
        }

        let active = self.active();
        let (accepted, rejected): (Vec<String>, Vec<String>) =
            requested.into_iter().partition(|s| active.contains(s));

        let (to_subscribe, to_unsubscribe, effective_tf) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let session = state.clients.get_mut(&id).ok_or(HubError::ClientNotFound(id))?;

            let before = session.candle_args();
            session.symbols.extend(accepted.iter().cloned());
            if timeframe.is_some() {
                session.timeframe = timeframe;
            }
            session.alive = true;
            let after = session.candle_args();
            let effective_tf = session.timeframe;

            // Acquire before release so a timeframe switch shared by others never drops to zero.
            let subscribe = state.acquire(after);
            let unsubscribe = state.release(before);
            (subscribe, unsubscribe, effective_tf)
        };

        debug!(client = %id, accepted = accepted.len(), rejected = rejected.len(), "client subscribed");
        self.send_feed(FeedCommand::Subscribe(to_subscribe));
        self.send_feed(FeedCommand::Unsubscribe(to_unsubscribe));

        Ok(SubscribeAck {
            accepted,
            rejected,
            timeframe: effective_tf,
        })
    }

    /// `None` unsubscribes everything. Symbols the client never had are ignored.
    /// Returns the symbols actually removed.
    pub async fn on_client_unsubscribe(&self, id: Uuid, symbols: Option<&[String]>) -> Result<Vec<String>, HubError> {
        let (removed, to_unsubscribe) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let session = state.clients.get_mut(&id).ok_or(HubError::ClientNotFound(id))?;

            let removed: Vec<String> = match symbols {
                None => std::mem::take(&mut session.symbols).into_iter().collect(),
                Some(list) => list
                    .iter()
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| session.symbols.remove(s))
                    .collect(),
            };

            let released = match session.timeframe {
                Some(tf) => removed
                    .iter()
                    .map(|s| ChannelArg::new(Channel::Candle(tf), s.clone()))
                    .collect(),
                None => Vec::new(),
            };
            (removed, state.release(released))
        };

        self.send_feed(FeedCommand::Unsubscribe(to_unsubscribe));
        Ok(removed)
    }

    pub async fn on_client_disconnect(&self, id: Uuid) {
        let released = {
            let mut state = self.state.write().await;
            let released = state.remove_client(&id);
            if released.is_some() {
                info!(client = %id, total = state.clients.len(), "client disconnected");
            }
            released
        };
        if let Some(args) = released {
            self.send_feed(FeedCommand::Unsubscribe(args));
        }
    }

    async fn drop_clients(&self, ids: Vec<Uuid>) {
        for id in ids {
            self.on_client_disconnect(id).await;
        }
    }

    /// Push a market event to every client subscribed to its symbol. Events for
    /// symbols outside the active set are not forwarded; candle events only
    /// reach clients on the matching timeframe.
    pub async fn broadcast(&self, event: &MarketEvent) -> usize {
        if !self.active().contains(&event.symbol) {
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let state = self.state.read().await;
            let mut message: Option<ServerMessage> = None;
            for (id, session) in state.clients.iter() {
                if !session.symbols.contains(&event.symbol) {
                    continue;
                }
                if let Channel::Candle(tf) = event.channel {
                    if session.timeframe != Some(tf) {
                        continue;
                    }
                }
                let msg = message
                    .get_or_insert_with(|| ServerMessage::MarketData {
                        symbol: event.symbol.clone(),
                        channel: event.channel.clone(),
                        data: event.payload.clone(),
                        timestamp: event.timestamp,
                    })
                    .clone();
                if session.send(Outbound::Message(msg)) {
                    delivered += 1;
                } else {
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            self.drop_clients(failed).await;
        }
        delivered
    }

    /// Send to every connected client regardless of subscriptions.
    pub async fn broadcast_all(&self, message: ServerMessage) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;
        {
            let state = self.state.read().await;
            for (id, session) in state.clients.iter() {
                if session.send(Outbound::Message(message.clone())) {
                    delivered += 1;
                } else {
                    failed.push(*id);
                }
            }
        }
        if !failed.is_empty() {
            self.drop_clients(failed).await;
        }
        delivered
    }

    pub async fn broadcast_signals(&self, signals: &[FilteredSignal]) -> usize {
        self.broadcast_all(ServerMessage::Signals {
            signals: signals.to_vec(),
            timestamp: utils::now_ms(),
        })
        .await
    }

    async fn reply(&self, id: Uuid, message: ServerMessage) {
        let ok = {
            let state = self.state.read().await;
            match state.clients.get(&id) {
                Some(session) => session.send(Outbound::Message(message)),
                None => return,
            }
        };
        if !ok {
            self.on_client_disconnect(id).await;
        }
    }

    /// Handle one text frame from a client. Protocol errors are answered with
    /// an `error` message; the connection stays open.
    pub async fn handle_client_message(&self, id: Uuid, text: &str) {
        if let Err(err) = self.dispatch(id, text).await {
            debug!(client = %id, code = err.code(), error = %err, "client protocol error");
            self.reply(id, ServerMessage::from(&err)).await;
        }
    }

    async fn dispatch(&self, id: Uuid, text: &str) -> Result<(), HubError> {
        match parse_client_message(text)? {
            ClientMessage::Subscribe { symbols, timeframe } => {
                let timeframe = match timeframe {
                    Some(raw) => Some(raw.parse::<Timeframe>().map_err(|_| HubError::InvalidTimeframe(raw))?),
                    None => None,
                };
                let ack = self.on_client_subscribe(id, &symbols, timeframe).await?;
                if !ack.accepted.is_empty() {
                    let data = self.cache.snapshot_for(ack.accepted.iter());
                    if !data.is_empty() {
                        self.reply(
                            id,
                            ServerMessage::Snapshot {
                                data,
                                timestamp: utils::now_ms(),
                            },
                        )
                        .await;
                    }
                }
                self.reply(
                    id,
                    ServerMessage::Subscribed {
                        symbols: ack.accepted,
                        rejected: ack.rejected,
                        timeframe: ack.timeframe,
                    },
                )
                .await;
            }
            ClientMessage::Unsubscribe { symbols } => {
                let removed = self.on_client_unsubscribe(id, symbols.as_deref()).await?;
                self.reply(id, ServerMessage::Unsubscribed { symbols: removed }).await;
            }
            ClientMessage::Ping => {
                self.mark_alive(id).await;
                self.reply(
                    id,
                    ServerMessage::Pong {
                        timestamp: utils::now_ms(),
                    },
                )
                .await;
            }
        }
        Ok(())
    }

    /// Drop client subscriptions to symbols that left the active set and
    /// release their candle demand. Returns the released upstream args.
    pub async fn prune_inactive(&self) -> Vec<ChannelArg> {
        let active = self.active();
        let released = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let mut dropped = Vec::new();
            for session in state.clients.values_mut() {
                let stale: Vec<String> = session
                    .symbols
                    .iter()
                    .filter(|s| !active.contains(s))
                    .cloned()
                    .collect();
                for symbol in stale {
                    session.symbols.remove(&symbol);
                    if let Some(tf) = session.timeframe {
                        dropped.push(ChannelArg::new(Channel::Candle(tf), symbol));
                    }
                }
            }
            state.release(dropped)
        };
        if !released.is_empty() {
            info!(released = released.len(), "released candle demand for inactive symbols");
        }
        self.send_feed(FeedCommand::Unsubscribe(released.clone()));
        released
    }

    /// Prune subscriptions every time a new active set is published.
    pub async fn run_active_set_watch(self: Arc<Self>, shutdown: CancellationToken) {
        let mut updates = self.active_set.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.prune_inactive().await;
                }
            }
        }
        debug!("hub active set watch stopped");
    }

    /// Record a liveness acknowledgment (pong frame or JSON ping).
    pub async fn mark_alive(&self, id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(session) = state.clients.get_mut(&id) {
            session.alive = true;
            session.last_heartbeat = Instant::now();
        }
    }

    /// Disconnect clients that did not acknowledge the previous ping, then
    /// ping everyone else. Returns the disconnected ids.
    pub async fn heartbeat_sweep(&self) -> Vec<Uuid> {
        let mut dead = Vec::new();
        let mut released = Vec::new();
        {
            let mut state = self.state.write().await;
            for (id, session) in state.clients.iter_mut() {
                if session.alive {
                    session.alive = false;
                    if !session.send(Outbound::Ping) {
                        dead.push(*id);
                    }
                } else {
                    warn!(
                        client = %id,
                        silent_secs = session.last_heartbeat.elapsed().as_secs(),
                        "client missed heartbeat, disconnecting"
                    );
                    session.send(Outbound::Close);
                    dead.push(*id);
                }
            }
            for id in &dead {
                if let Some(args) = state.remove_client(id) {
                    released.extend(args);
                }
            }
        }
        self.send_feed(FeedCommand::Unsubscribe(released));
        dead
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    pub async fn client_symbols(&self, id: Uuid) -> Option<Vec<String>> {
        let state = self.state.read().await;
        state.clients.get(&id).map(|s| s.symbols.iter().cloned().collect())
    }

    pub async fn demand_for(&self, arg: &ChannelArg) -> usize {
        self.state.read().await.demand.get(arg).copied().unwrap_or(0)
    }

    pub async fn feed_state(&self) -> FeedState {
        self.state.read().await.feed_state
    }

    pub async fn handle_feed_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Market(event) => {
                self.broadcast(&event).await;
            }
            FeedEvent::State(feed_state) => {
                self.state.write().await.feed_state = feed_state;
            }
            FeedEvent::ReconnectFailed { attempts } => {
                self.state.write().await.feed_state = FeedState::Disconnected;
                error!(attempts, "upstream feed gave up reconnecting");
                self.broadcast_all(ServerMessage::Status {
                    feed: FeedState::Disconnected,
                    message: format!("upstream feed unavailable after {} attempts", attempts),
                })
                .await;
            }
        }
    }

    /// Drain feed events into the hub until the feed stops or shutdown.
    pub async fn run_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<FeedEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_feed_event(event).await,
                    None => break,
                }
            }
        }
        debug!("hub event pump stopped");
    }

    pub async fn run_heartbeat(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = utils::interval_secs(self.config.ping_interval.as_secs());
        // The first tick fires immediately; skip it so new clients get a full interval.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let dropped = self.heartbeat_sweep().await;
                    if !dropped.is_empty() {
                        debug!(dropped = dropped.len(), "heartbeat sweep");
                    }
                }
            }
        }
        let state = self.state.read().await;
        for session in state.clients.values() {
            session.send(Outbound::Close);
        }
    }
}
