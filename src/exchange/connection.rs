//! Bitget WebSocket channel supervisor
//!
//! One supervisor task per channel owns the socket for its whole life:
//! connect, (login,) subscribe, text heartbeat with a pong watchdog, a
//! scheduled rotation ahead of session expiry, and backoff reconnects.
//! Callers only see a [`ChannelHandle`]: state, latest price, an outbound
//! send primitive and `disconnect`.

use std::borrow::Cow;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::auth::BitgetAuth;
use super::inbound::{ExchangeEvent, Frame, classify_orders, parse_frame};
use super::traits::OutboundSink;
use super::types::{SubscriptionArg, SubscriptionMessage};
use crate::config::TransportConfig;
use crate::error::{BotError, BotResult};

const OUTBOUND_CAPACITY: usize = 1000;

// ======================= CHANNEL DESCRIPTION =======================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Market data, no login
    Public,
    /// Order stream and trade commands, login required
    Private,
}

impl ChannelKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ChannelKind::Public => "WS-PUB",
            ChannelKind::Private => "WS-PRIV",
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Subscribed,
}

impl ConnectionState {
    /// Socket is up (any state past the TCP/WS handshake)
    pub fn is_open(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected | ConnectionState::Connecting)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub url: String,
    pub subscription: SubscriptionArg,
    pub auth: Option<BitgetAuth>,
    pub transport: TransportConfig,
}

impl ChannelConfig {
    /// Ticker feed for one instrument
    pub fn public(url: &str, inst_type: &str, symbol: &str, transport: TransportConfig) -> Self {
        Self {
            kind: ChannelKind::Public,
            url: url.to_string(),
            subscription: SubscriptionArg {
                inst_type: inst_type.to_string(),
                channel: "ticker".to_string(),
                inst_id: symbol.to_string(),
            },
            auth: None,
            transport,
        }
    }

    /// Authenticated order stream for one instrument
    pub fn private(
        url: &str,
        inst_type: &str,
        symbol: &str,
        auth: BitgetAuth,
        transport: TransportConfig,
    ) -> Self {
        Self {
            kind: ChannelKind::Private,
            url: url.to_string(),
            subscription: SubscriptionArg {
                inst_type: inst_type.to_string(),
                channel: "orders".to_string(),
                inst_id: symbol.to_string(),
            },
            auth: Some(auth),
            transport,
        }
    }
}

// ======================= BACKOFF =======================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDelay {
    /// Exponential step; `attempt` is 1-based
    Backoff { delay: Duration, attempt: u32 },
    /// Attempt budget exhausted; counter has been reset
    Cooldown(Duration),
}

impl ReconnectDelay {
    pub fn duration(&self) -> Duration {
        match self {
            ReconnectDelay::Backoff { delay, .. } => *delay,
            ReconnectDelay::Cooldown(d) => *d,
        }
    }
}

/// `min(base * 2^attempt, max)` for `max_attempts` tries, then a cooldown
/// and start over. Never gives up.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    cooldown: Duration,
    attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(transport: &TransportConfig) -> Self {
        Self {
            base: Duration::from_millis(transport.backoff_base_ms),
            max: Duration::from_millis(transport.backoff_max_ms),
            max_attempts: transport.max_reconnect_attempts,
            cooldown: Duration::from_millis(transport.reconnect_cooldown_ms),
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> ReconnectDelay {
        if self.attempts >= self.max_attempts {
            self.attempts = 0;
            return ReconnectDelay::Cooldown(self.cooldown);
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempts += 1;
        ReconnectDelay::Backoff {
            delay,
            attempt: self.attempts,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ======================= HEARTBEAT =======================

/// Pong watchdog: a ping arms a deadline, a pong clears it
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pong_timeout: Duration,
    deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            pong_timeout,
            deadline: None,
        }
    }

    /// Keeps an already armed deadline; an unanswered ping is not extended
    pub fn ping_sent(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.pong_timeout);
        }
    }

    pub fn pong_received(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[cfg(test)]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn reset(&mut self) {
        self.deadline = None;
    }
}

// ======================= SESSION =======================

enum SessionEnd {
    Closed,
    HeartbeatTimeout,
    Rotation,
    Shutdown,
}

/// Supervisor-owned state that outlives individual sockets
struct Session {
    config: ChannelConfig,
    state_tx: watch::Sender<ConnectionState>,
    price_tx: watch::Sender<Option<f64>>,
    events_tx: mpsc::Sender<ExchangeEvent>,
    heartbeat: Heartbeat,
    backoff: BackoffPolicy,
}

impl Session {
    fn tag(&self) -> &'static str {
        self.config.kind.tag()
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("[{}] State {:?} -> {:?}", self.tag(), prev, state);
        }
        // A session only counts as healthy once it is fully subscribed
        if state == ConnectionState::Subscribed {
            self.backoff.reset();
        }
    }

    fn subscription_frame(&self, subscribe: bool) -> BotResult<String> {
        let arg = self.config.subscription.clone();
        let msg = if subscribe {
            SubscriptionMessage::subscribe(arg)
        } else {
            SubscriptionMessage::unsubscribe(arg)
        };
        Ok(serde_json::to_string(&msg)?)
    }

    /// Handle one inbound text frame; returns a reply to write, if any
    async fn on_frame(&mut self, text: &str) -> BotResult<Option<String>> {
        let tag = self.tag();
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] Dropped message: {} ({})", tag, e, text);
                return Ok(None);
            }
        };

        let private = self.config.kind == ChannelKind::Private;
        match frame {
            Frame::Pong => {
                self.heartbeat.pong_received();
                debug!("[{}] Pong", tag);
            }
            Frame::Ping => return Ok(Some("pong".to_string())),
            Frame::Login { success, code, msg } if private => {
                if !success {
                    let reason = format!("login rejected: code={} msg={}", code, msg);
                    return Err(BotError::Auth(reason));
                }
                self.set_state(ConnectionState::Authenticated);
                info!(
                    "[{}] Login successful, subscribing to {}",
                    tag, self.config.subscription.channel
                );
                let sub = self.subscription_frame(true)?;
                self.set_state(ConnectionState::Subscribed);
                return Ok(Some(sub));
            }
            Frame::Error { code, msg } => {
                // Bitget reports a rejected login as a generic error event
                if private && self.state() == ConnectionState::Authenticating {
                    let reason = format!("login rejected: code={} msg={}", code, msg);
                    return Err(BotError::Auth(reason));
                }
                warn!("[{}] Exchange error: code={} msg={}", tag, code, msg);
            }
            Frame::Subscribed { channel } => info!("[{}] Subscribed to {}", tag, channel),
            Frame::Unsubscribed { channel } => debug!("[{}] Unsubscribed from {}", tag, channel),
            Frame::Ticker { last_price } if !private => {
                self.price_tx.send_replace(Some(last_price));
                // Latest price is always in the watch cell; a full queue only coalesces ticks
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    self.events_tx.try_send(ExchangeEvent::PriceUpdate(last_price))
                {
                    debug!("[{}] Event queue full, price tick coalesced", tag);
                }
            }
            Frame::Orders(updates) if private => {
                for event in classify_orders(updates) {
                    if self.events_tx.send(event).await.is_err() {
                        warn!("[{}] Event receiver dropped", tag);
                        break;
                    }
                }
            }
            _ => {}
        }
        Ok(None)
    }

    /// Unsubscribe (if the socket is up) then a normal close frame
    async fn close_gracefully<S>(&mut self, write: &mut S)
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let tag = self.tag();
        if self.state().is_open() {
            match self.subscription_frame(false) {
                Ok(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        debug!("[{}] Unsubscribe not sent: {}", tag, e);
                    }
                }
                Err(e) => debug!("[{}] Unsubscribe not built: {}", tag, e),
            }
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        if let Err(e) = write.send(Message::Close(Some(frame))).await {
            debug!("[{}] Close frame not sent: {}", tag, e);
        }
    }

    /// One socket lifetime
    async fn run(
        &mut self,
        outbound_rx: &mut mpsc::Receiver<String>,
        shutdown_rx: &mut watch::Receiver<bool>,
        ready: &mut Option<oneshot::Sender<()>>,
    ) -> BotResult<SessionEnd> {
        let tag = self.tag();
        let transport = self.config.transport.clone();

        self.set_state(ConnectionState::Connecting);
        info!("[{}] Connecting to {}", tag, self.config.url);
        let connect_timeout = Duration::from_millis(transport.connect_timeout_ms);
        let connecting = connect_async(self.config.url.as_str());
        let (ws_stream, _) = match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(result) => result?,
            Err(_) => return Err(BotError::ConnectTimeout(transport.connect_timeout_ms)),
        };
        let (mut write, mut read) = ws_stream.split();
        self.set_state(ConnectionState::Connected);
        info!("[{}] Connected", tag);

        // Frames queued against the previous socket are not replayed
        let mut stale = 0usize;
        while outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            warn!("[{}] Discarded {} frames queued before reconnect", tag, stale);
        }

        self.heartbeat.reset();
        let handshake = match &self.config.auth {
            Some(auth) => {
                let login = auth.login_message_now()?;
                self.set_state(ConnectionState::Authenticating);
                login
            }
            None => self.subscription_frame(true)?,
        };
        write.send(Message::Text(handshake)).await?;
        if self.config.auth.is_none() {
            let sub = &self.config.subscription;
            info!("[{}] Subscribing to {} {}", tag, sub.channel, sub.inst_id);
            self.set_state(ConnectionState::Subscribed);
        }
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }

        let ping_every = Duration::from_millis(transport.ping_interval_ms);
        let mut ping_interval = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let rotation = tokio::time::sleep(Duration::from_millis(transport.reconnect_interval_ms));
        tokio::pin!(rotation);

        loop {
            let pong_deadline = self.heartbeat.deadline();
            let pong_wait = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                _ = ping_interval.tick() => {
                    write.send(Message::Text("ping".to_string())).await?;
                    self.heartbeat.ping_sent(Instant::now());
                    debug!("[{}] Ping", tag);
                }

                _ = pong_wait, if pong_deadline.is_some() => {
                    warn!(
                        "[{}] No pong within {}ms, forcing close",
                        tag, transport.pong_timeout_ms
                    );
                    let _ = write.close().await;
                    return Ok(SessionEnd::HeartbeatTimeout);
                }

                _ = &mut rotation => {
                    info!("[{}] Scheduled rotation", tag);
                    self.close_gracefully(&mut write).await;
                    return Ok(SessionEnd::Rotation);
                }

                _ = shutdown_rx.changed() => {
                    self.close_gracefully(&mut write).await;
                    return Ok(SessionEnd::Shutdown);
                }

                out = outbound_rx.recv() => match out {
                    Some(text) => {
                        debug!("[{}] Sending: {}", tag, text);
                        write.send(Message::Text(text)).await?;
                    }
                    None => {
                        self.close_gracefully(&mut write).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                },

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match self.on_frame(&text).await {
                        Ok(Some(reply)) => write.send(Message::Text(reply)).await?,
                        Ok(None) => {}
                        Err(e) => {
                            let _ = write.close().await;
                            return Err(e);
                        }
                    },
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        warn!("[{}] Server closed connection: {:?}", tag, frame);
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::Closed),
                },
            }
        }
    }
}

/// Reconnect loop around [`Session::run`]
async fn supervise(
    mut session: Session,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<()>,
) {
    let tag = session.tag();
    let settle = Duration::from_millis(session.config.transport.rotation_settle_ms);
    let mut ready = Some(ready_tx);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let end = session.run(&mut outbound_rx, &mut shutdown_rx, &mut ready).await;
        session.set_state(ConnectionState::Disconnected);

        let delay = match end {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Rotation) => {
                session.backoff.reset();
                info!("[{}] Rotating, reconnecting in {}ms", tag, settle.as_millis());
                settle
            }
            other => {
                match other {
                    Err(BotError::Auth(msg)) => error!("[{}] Authentication failed: {}", tag, msg),
                    Err(e) => warn!("[{}] Connection error: {}", tag, e),
                    Ok(SessionEnd::HeartbeatTimeout) => warn!("[{}] Heartbeat timeout", tag),
                    Ok(_) => warn!("[{}] Connection closed", tag),
                }
                let next = session.backoff.next_delay();
                match next {
                    ReconnectDelay::Backoff { delay, attempt } => info!(
                        "[{}] Reconnecting in {}ms (attempt {}/{})",
                        tag,
                        delay.as_millis(),
                        attempt,
                        session.config.transport.max_reconnect_attempts
                    ),
                    ReconnectDelay::Cooldown(d) => warn!(
                        "[{}] Max reconnect attempts reached, cooling down {}ms",
                        tag,
                        d.as_millis()
                    ),
                }
                next.duration()
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    session.set_state(ConnectionState::Disconnected);
    info!("[{}] Disconnected", tag);
}

// ======================= HANDLE =======================

/// Shared handle to a supervised channel
pub struct ChannelHandle {
    kind: ChannelKind,
    state_rx: watch::Receiver<ConnectionState>,
    price_rx: watch::Receiver<Option<f64>>,
    outbound_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Spawn the supervisor and wait until the first handshake frame is written
/// (login on the private channel, subscribe on the public one). Failed
/// attempts before that go through the same backoff as later reconnects.
pub async fn connect(
    config: ChannelConfig,
    events_tx: mpsc::Sender<ExchangeEvent>,
) -> BotResult<ChannelHandle> {
    let kind = config.kind;
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (price_tx, price_rx) = watch::channel(None);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();

    let session = Session {
        heartbeat: Heartbeat::new(Duration::from_millis(config.transport.pong_timeout_ms)),
        backoff: BackoffPolicy::from_config(&config.transport),
        config,
        state_tx,
        price_tx,
        events_tx,
    };
    let task = tokio::spawn(supervise(session, outbound_rx, shutdown_rx, ready_tx));

    match ready_rx.await {
        Ok(()) => Ok(ChannelHandle {
            kind,
            state_rx,
            price_rx,
            outbound_tx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }),
        Err(_) => Err(BotError::ChannelClosed(kind.tag())),
    }
}

impl ChannelHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Last ticker price seen on this channel (public only)
    pub fn latest_price(&self) -> Option<f64> {
        *self.price_rx.borrow()
    }

    pub fn watch_price(&self) -> watch::Receiver<Option<f64>> {
        self.price_rx.clone()
    }

    /// Queue a frame on the live socket
    pub async fn send_text(&self, text: String) -> BotResult<()> {
        if !self.state().is_open() {
            return Err(BotError::NotReady(self.kind.tag()));
        }
        self.outbound_tx
            .send(text)
            .await
            .map_err(|_| BotError::ChannelClosed(self.kind.tag()))
    }

    /// Unsubscribe, close normally and stop reconnecting
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[{}] Supervisor ended abnormally: {}", self.kind.tag(), e);
            }
        }
    }
}

#[async_trait]
impl OutboundSink for ChannelHandle {
    fn is_ready(&self) -> bool {
        match self.kind {
            ChannelKind::Private => matches!(
                self.state(),
                ConnectionState::Authenticated | ConnectionState::Subscribed
            ),
            ChannelKind::Public => self.state() == ConnectionState::Subscribed,
        }
    }

    async fn send(&self, text: String) -> BotResult<()> {
        self.send_text(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::WebSocketStream;

    const WAIT: Duration = Duration::from_secs(3);

    fn quiet_transport() -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: 1_000,
            ping_interval_ms: 60_000,
            pong_timeout_ms: 5_000,
            reconnect_interval_ms: 3_600_000,
            rotation_settle_ms: 50,
            backoff_base_ms: 50,
            backoff_max_ms: 200,
            max_reconnect_attempts: 5,
            reconnect_cooldown_ms: 500,
        }
    }

    fn test_auth() -> BitgetAuth {
        BitgetAuth::new("key".into(), "secret".into(), "pass".into())
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(Message::Text(t))) => return t,
                Some(Ok(_)) => continue,
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        serde_json::from_str(&next_text(ws).await).unwrap()
    }

    /// Wait until the peer's side of the socket is gone
    async fn wait_closed(ws: &mut WebSocketStream<TcpStream>) {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[test]
    fn test_backoff_sequence_and_cooldown() {
        let mut transport = TransportConfig::default();
        transport.max_reconnect_attempts = 5;
        let mut backoff = BackoffPolicy::from_config(&transport);

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().duration().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);

        assert_eq!(backoff.next_delay(), ReconnectDelay::Cooldown(Duration::from_secs(60)));
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            backoff.next_delay(),
            ReconnectDelay::Backoff { delay: Duration::from_millis(1000), attempt: 1 }
        );
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut transport = TransportConfig::default();
        transport.max_reconnect_attempts = 10;
        let mut backoff = BackoffPolicy::from_config(&transport);

        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().duration().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]);

        backoff.reset();
        assert_eq!(backoff.next_delay().duration(), Duration::from_millis(1000));
    }

    #[test]
    fn test_heartbeat_deadline() {
        let mut hb = Heartbeat::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(hb.deadline().is_none());

        hb.ping_sent(t0);
        assert_eq!(hb.deadline(), Some(t0 + Duration::from_secs(5)));

        // A second ping does not push the deadline out
        hb.ping_sent(t0 + Duration::from_secs(3));
        assert_eq!(hb.deadline(), Some(t0 + Duration::from_secs(5)));
        assert!(!hb.is_expired(t0 + Duration::from_secs(4)));
        assert!(hb.is_expired(t0 + Duration::from_secs(5)));

        hb.pong_received();
        assert!(hb.deadline().is_none());
        assert!(!hb.is_expired(t0 + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_public_channel_subscribes_and_emits_price() {
        let (listener, url) = listen().await;
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let sub = next_json(&mut ws).await;
            assert_eq!(sub["op"], "subscribe");
            assert_eq!(sub["args"][0]["channel"], "ticker");
            assert_eq!(sub["args"][0]["instId"], "BTCUSDT");

            let tick = json!({
                "arg": { "instType": "SPOT", "channel": "ticker", "instId": "BTCUSDT" },
                "data": [{ "lastPr": "10005" }]
            });
            ws.send(Message::Text(tick.to_string())).await.unwrap();
            ws
        });

        let handle = connect(ChannelConfig::public(&url, "SPOT", "BTCUSDT", quiet_transport()), events_tx)
            .await
            .unwrap();

        let event = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, ExchangeEvent::PriceUpdate(p) if p == 10005.0));
        assert_eq!(handle.latest_price(), Some(10005.0));
        assert_eq!(handle.state(), ConnectionState::Subscribed);

        // Orderly disconnect: unsubscribe, then a normal close
        let mut ws = server.await.unwrap();
        handle.disconnect().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        let unsub = next_json(&mut ws).await;
        assert_eq!(unsub["op"], "unsubscribe");
        assert_eq!(unsub["args"][0]["channel"], "ticker");
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_private_channel_login_then_orders() {
        let (listener, url) = listen().await;
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let login = next_json(&mut ws).await;
            assert_eq!(login["op"], "login");
            assert_eq!(login["args"][0]["apiKey"], "key");
            assert_eq!(login["args"][0]["passphrase"], "pass");

            ws.send(Message::Text(r#"{"event":"login","code":0,"msg":""}"#.into())).await.unwrap();

            let sub = next_json(&mut ws).await;
            assert_eq!(sub["op"], "subscribe");
            assert_eq!(sub["args"][0]["channel"], "orders");

            let fill = json!({
                "arg": { "instType": "SPOT", "channel": "orders", "instId": "BTCUSDT" },
                "data": [{ "clientOid": "buy_1_abc", "status": "filled", "price": "9990", "newSize": "0.0002", "side": "buy" }]
            });
            ws.send(Message::Text(fill.to_string())).await.unwrap();
            ws
        });

        let handle = connect(
            ChannelConfig::private(&url, "SPOT", "BTCUSDT", test_auth(), quiet_transport()),
            events_tx,
        )
        .await
        .unwrap();

        let mut state = handle.watch_state();
        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Subscribed))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_ready());

        let first = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, ExchangeEvent::BuyFilled(ref f) if f.client_oid == "buy_1_abc" && f.price == 9990.0));
        let second = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(second, ExchangeEvent::OrderUpdate(_)));

        // Outbound frames reach the socket
        handle.send("{\"op\":\"trade\"}".to_string()).await.unwrap();
        let mut ws = server.await.unwrap();
        assert_eq!(next_text(&mut ws).await, "{\"op\":\"trade\"}");

        handle.disconnect().await;
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn test_missing_pong_forces_close_and_backoff_reconnect() {
        let (listener, url) = listen().await;
        let (events_tx, _events_rx) = mpsc::channel(16);

        let mut transport = quiet_transport();
        transport.ping_interval_ms = 50;
        transport.pong_timeout_ms = 100;
        transport.backoff_base_ms = 300;
        transport.backoff_max_ms = 1_000;

        let handle = connect(ChannelConfig::public(&url, "SPOT", "BTCUSDT", transport), events_tx);
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            assert_eq!(next_json(&mut ws).await["op"], "subscribe");
            assert_eq!(next_text(&mut ws).await, "ping");

            // Never answer; the client must give up on this socket
            wait_closed(&mut ws).await;
            let closed_at = Instant::now();

            let mut ws2 = accept(&listener).await;
            let gap = closed_at.elapsed();
            assert_eq!(next_json(&mut ws2).await["op"], "subscribe");
            gap
        });

        let handle = handle.await.unwrap();
        let gap = server.await.unwrap();
        assert!(gap >= Duration::from_millis(250), "reconnected after {:?}", gap);

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_login_failure_retries_with_backoff() {
        let (listener, url) = listen().await;
        let (events_tx, _events_rx) = mpsc::channel(16);

        let handle = connect(
            ChannelConfig::private(&url, "SPOT", "BTCUSDT", test_auth(), quiet_transport()),
            events_tx,
        );
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            assert_eq!(next_json(&mut ws).await["op"], "login");
            ws.send(Message::Text(r#"{"event":"error","code":30005,"msg":"Invalid sign"}"#.into()))
                .await
                .unwrap();
            wait_closed(&mut ws).await;

            // The channel comes back and logs in again
            let mut ws2 = accept(&listener).await;
            assert_eq!(next_json(&mut ws2).await["op"], "login");
            ws2
        });

        let handle = handle.await.unwrap();
        let _ws2 = server.await.unwrap();
        assert!(!handle.is_ready());
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_rotation_unsubscribes_and_reconnects() {
        let (listener, url) = listen().await;
        let (events_tx, _events_rx) = mpsc::channel(16);

        let mut transport = quiet_transport();
        transport.reconnect_interval_ms = 200;

        let handle = connect(ChannelConfig::public(&url, "SPOT", "BTCUSDT", transport), events_tx);
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            assert_eq!(next_json(&mut ws).await["op"], "subscribe");
            assert_eq!(next_json(&mut ws).await["op"], "unsubscribe");
            wait_closed(&mut ws).await;

            let mut ws2 = accept(&listener).await;
            assert_eq!(next_json(&mut ws2).await["op"], "subscribe");
            ws2
        });

        let handle = handle.await.unwrap();
        let _ws2 = server.await.unwrap();
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_retries_until_server_comes_up() {
        let addr = {
            let (listener, _) = listen().await;
            listener.local_addr().unwrap()
        };
        let url = format!("ws://{}", addr);
        let (events_tx, _events_rx) = mpsc::channel(16);

        let connecting = tokio::spawn(connect(
            ChannelConfig::public(&url, "SPOT", "BTCUSDT", quiet_transport()),
            events_tx,
        ));

        // Refused a few times, still trying
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!connecting.is_finished());

        let listener = TcpListener::bind(addr).await.unwrap();
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            assert_eq!(next_json(&mut ws).await["op"], "subscribe");
            ws
        });

        let handle = timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
        let _ws = server.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Subscribed);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out_and_retries() {
        let (listener, url) = listen().await;
        let (events_tx, _events_rx) = mpsc::channel(16);

        let mut transport = quiet_transport();
        transport.connect_timeout_ms = 100;
        let connecting = tokio::spawn(connect(
            ChannelConfig::public(&url, "SPOT", "BTCUSDT", transport),
            events_tx,
        ));

        // First peer takes the TCP connection and never answers the upgrade
        let (stalled, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await["op"], "subscribe");
        let handle = timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();

        drop(stalled);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_not_ready() {
        let (listener, url) = listen().await;
        let (events_tx, _events_rx) = mpsc::channel(16);
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_text(&mut ws).await;
            ws
        });

        let handle = connect(ChannelConfig::public(&url, "SPOT", "BTCUSDT", quiet_transport()), events_tx)
            .await
            .unwrap();
        let _ws = server.await.unwrap();
        handle.disconnect().await;

        let err = handle.send_text("x".into()).await.unwrap_err();
        assert!(matches!(err, BotError::NotReady("WS-PUB")));
    }
}
