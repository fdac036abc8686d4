//! Subscription lifecycle for the tick/candle feed.
//!
//! [`StreamSync`] owns the WebSocket connection to the feed for one
//! instrument and set of timeframes: connect, resubscribe on instrument
//! change, reconnect with capped exponential backoff, and backfill of
//! recent closed candles so the store is seeded before live updates are
//! trusted. Connection status is published over a `watch` channel and
//! reflects real transport state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::types::{Candle, ConnectionStatus, FeedEvent, Timeframe};

/// Capped exponential backoff between reconnection attempts.
///
/// Delay doubles from `initial` up to the `max` ceiling; a successful
/// connection resets the attempt counter. Pure state machine so tests can
/// step it without sleeping.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket feed URL
    pub url: String,
    /// REST base URL for candle backfill
    pub backfill_url: String,
    /// Closed candles requested per timeframe on (re)subscribe
    pub backfill_limit: usize,
    /// Ping interval to keep the connection alive
    pub ping_interval: Duration,
    /// Bound on reaching `Connected` before surfacing `Error`
    pub connect_timeout: Duration,
    /// First reconnection delay
    pub initial_backoff: Duration,
    /// Reconnection delay ceiling
    pub max_backoff: Duration,
    /// Maximum channel buffer size for feed messages
    pub channel_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9010/feed".to_string(),
            backfill_url: "http://127.0.0.1:9010".to_string(),
            backfill_limit: 500,
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            channel_buffer_size: 1000,
        }
    }
}

impl StreamConfig {
    /// Create a new configuration with custom URLs
    pub fn new(url: impl Into<String>, backfill_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backfill_url: backfill_url.into(),
            ..Default::default()
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_backfill_limit(mut self, limit: usize) -> Self {
        self.backfill_limit = limit;
        self
    }
}

/// Active subscription topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub instrument: String,
    pub timeframes: Vec<Timeframe>,
}

impl Subscription {
    fn subscribe_payload(&self) -> String {
        let timeframes: Vec<String> = self.timeframes.iter().map(Timeframe::to_string).collect();
        serde_json::json!({
            "op": "subscribe",
            "instrument": self.instrument,
            "timeframes": timeframes,
        })
        .to_string()
    }

    fn unsubscribe_payload(&self) -> String {
        serde_json::json!({
            "op": "unsubscribe",
            "instrument": self.instrument,
        })
        .to_string()
    }
}

/// Commands from the consumer to the stream loop
enum StreamCommand {
    Subscribe { subscription: Subscription, epoch: u64 },
    Unsubscribe,
    Shutdown,
}

/// Messages delivered downstream, tagged with the subscription epoch so
/// stale events for a previous instrument are never applied to the new
/// instrument's series.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// Live feed event
    Event { epoch: u64, event: FeedEvent },
    /// Backfill of recent closed candles, oldest first, delivered before
    /// live updates for the same subscription are trusted
    Backfill {
        epoch: u64,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    },
}

/// Handle to the background feed task.
pub struct StreamSync {
    commands: mpsc::UnboundedSender<StreamCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    epoch: Arc<AtomicU64>,
}

impl StreamSync {
    /// Spawn the feed loop.
    ///
    /// Returns the handle and the receiver for feed messages.
    pub fn start(config: StreamConfig) -> (Self, mpsc::Receiver<StreamMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::channel(config.channel_buffer_size);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        tokio::spawn(async move {
            run_feed_loop(config, cmd_rx, msg_tx, status_tx).await;
        });

        (
            Self {
                commands: cmd_tx,
                status_rx,
                epoch: Arc::new(AtomicU64::new(0)),
            },
            msg_rx,
        )
    }

    /// Switch the active subscription.
    ///
    /// Tears down the prior topic and bumps the epoch; returns the new
    /// epoch for fencing in the engine.
    pub fn subscribe(
        &self,
        instrument: impl Into<String>,
        timeframes: Vec<Timeframe>,
    ) -> Result<u64, StreamError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription = Subscription {
            instrument: instrument.into(),
            timeframes,
        };
        self.commands
            .send(StreamCommand::Subscribe {
                subscription,
                epoch,
            })
            .map_err(|_| StreamError::ChannelClosed)?;
        Ok(epoch)
    }

    /// Tear down the active subscription. Idempotent: unsubscribing with
    /// no active topic, or over a closed transport, is a no-op.
    pub fn unsubscribe(&self) {
        let _ = self.commands.send(StreamCommand::Unsubscribe);
    }

    /// Stop the feed loop entirely
    pub fn shutdown(&self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
    }

    /// Current transport status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel for transport status transitions
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Epoch of the most recent subscription
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// One row of the backfill REST response:
/// `[time, "open", "high", "low", "close", "volume"]`
#[derive(Debug, Deserialize)]
struct BackfillRow(i64, String, String, String, String, String);

impl BackfillRow {
    fn into_candle(self) -> Option<Candle> {
        let candle = Candle {
            time: self.0,
            open: self.1.parse().ok()?,
            high: self.2.parse().ok()?,
            low: self.3.parse().ok()?,
            close: self.4.parse().ok()?,
            volume: self.5.parse().ok()?,
            is_closed: true,
        };
        candle.has_valid_shape().then_some(candle)
    }
}

/// REST client for seeding closed-candle history.
#[derive(Debug, Clone)]
pub struct BackfillClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackfillClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch recent closed candles, oldest first.
    pub async fn fetch(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, StreamError> {
        let url = format!(
            "{}/candles?instrument={}&timeframe={}&limit={}",
            self.base_url, instrument, timeframe, limit
        );

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| StreamError::Backfill(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(StreamError::Backfill(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let rows: Vec<BackfillRow> = response
            .json()
            .await
            .map_err(|e| StreamError::BackfillParse(e.to_string()))?;

        let mut candles: Vec<Candle> =
            rows.into_iter().filter_map(BackfillRow::into_candle).collect();
        candles.sort_by_key(|candle| candle.time);
        Ok(candles)
    }
}

type WsWriter = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

/// Main feed loop with auto-reconnect.
///
/// On every (re)connect the active subscription is re-issued and a fresh
/// backfill requested; the aggregator's current-candle state may be stale
/// after a gap, so resumed deltas alone are never trusted.
async fn run_feed_loop(
    config: StreamConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
    msg_tx: mpsc::Sender<StreamMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    info!("starting feed loop for {}", config.url);

    let backfill = BackfillClient::new(config.backfill_url.clone());
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
    let mut active: Option<(Subscription, u64)> = None;

    // Nothing to stream until the first subscription arrives
    while active.is_none() {
        match cmd_rx.recv().await {
            Some(StreamCommand::Subscribe {
                subscription,
                epoch,
            }) => active = Some((subscription, epoch)),
            Some(StreamCommand::Unsubscribe) => {}
            Some(StreamCommand::Shutdown) | None => return,
        }
    }

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        let connect = tokio::time::timeout(config.connect_timeout, connect_async(&config.url));
        match connect.await {
            Err(_) => {
                error!(
                    timeout_secs = config.connect_timeout.as_secs(),
                    "connection attempt timed out"
                );
                let _ = status_tx.send(ConnectionStatus::Error);
            }
            Ok(Err(e)) => {
                error!("failed to connect to {}: {e}", config.url);
                let _ = status_tx.send(ConnectionStatus::Error);
            }
            Ok(Ok((ws_stream, _))) => {
                info!("connected to feed at {}", config.url);
                let _ = status_tx.send(ConnectionStatus::Connected);
                backoff.reset();

                let (mut write, mut read) = ws_stream.split();

                if let Some((subscription, epoch)) = &active {
                    resubscribe(&mut write, subscription).await;
                    run_backfill(
                        &backfill,
                        subscription,
                        *epoch,
                        config.backfill_limit,
                        &msg_tx,
                    )
                    .await;
                }

                // Ping task keeps the connection alive until told to stop
                let (ping_shutdown_tx, mut ping_shutdown_rx) = mpsc::channel::<()>(1);
                let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);
                let ping_interval = config.ping_interval;
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(ping_interval);
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                if ping_tx.send(()).await.is_err() {
                                    break;
                                }
                            }
                            _ = ping_shutdown_rx.recv() => break,
                        }
                    }
                });

                let mut shutdown = false;
                loop {
                    tokio::select! {
                        command = cmd_rx.recv() => {
                            match command {
                                Some(StreamCommand::Subscribe { subscription, epoch }) => {
                                    if let Some((old, _)) = &active {
                                        let payload = old.unsubscribe_payload();
                                        // Transport may already be closed; that is fine
                                        let _ = write.send(Message::Text(payload.into())).await;
                                    }
                                    resubscribe(&mut write, &subscription).await;
                                    run_backfill(
                                        &backfill,
                                        &subscription,
                                        epoch,
                                        config.backfill_limit,
                                        &msg_tx,
                                    )
                                    .await;
                                    active = Some((subscription, epoch));
                                }
                                Some(StreamCommand::Unsubscribe) => {
                                    if let Some((old, _)) = active.take() {
                                        let _ = write
                                            .send(Message::Text(old.unsubscribe_payload().into()))
                                            .await;
                                    }
                                }
                                Some(StreamCommand::Shutdown) | None => {
                                    shutdown = true;
                                    break;
                                }
                            }
                        }
                        _ = ping_rx.recv() => {
                            if write.send(Message::Ping(vec![].into())).await.is_err() {
                                debug!("failed to send ping, connection likely dead");
                                break;
                            }
                        }
                        message = read.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => {
                                    let Some((_, epoch)) = &active else { continue };
                                    match serde_json::from_str::<FeedEvent>(&text) {
                                        Ok(event) => {
                                            let out = StreamMessage::Event {
                                                epoch: *epoch,
                                                event,
                                            };
                                            if msg_tx.send(out).await.is_err() {
                                                warn!("event receiver dropped, stopping feed loop");
                                                shutdown = true;
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            debug!(
                                                "failed to parse feed message: {e} - {}",
                                                &text[..text.len().min(120)]
                                            );
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    info!("server closed connection");
                                    break;
                                }
                                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                    // Heartbeat; tungstenite answers pings itself
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!("websocket error: {e}");
                                    break;
                                }
                                None => {
                                    warn!("feed stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }

                let _ = ping_shutdown_tx.send(()).await;
                let _ = status_tx.send(ConnectionStatus::Disconnected);

                if shutdown {
                    info!("feed loop shutting down");
                    return;
                }
            }
        }

        let delay = backoff.next_delay();
        debug!("waiting {delay:?} before reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn resubscribe(write: &mut WsWriter, subscription: &Subscription) {
    let payload = subscription.subscribe_payload();
    if let Err(e) = write.send(Message::Text(payload.into())).await {
        warn!("failed to send subscribe message: {e}");
    }
}

async fn run_backfill(
    backfill: &BackfillClient,
    subscription: &Subscription,
    epoch: u64,
    limit: usize,
    msg_tx: &mpsc::Sender<StreamMessage>,
) {
    for &timeframe in &subscription.timeframes {
        match backfill
            .fetch(&subscription.instrument, timeframe, limit)
            .await
        {
            Ok(candles) => {
                let message = StreamMessage::Backfill {
                    epoch,
                    timeframe,
                    candles,
                };
                if msg_tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(
                    instrument = %subscription.instrument,
                    timeframe = %timeframe,
                    "backfill failed: {e}"
                );
            }
        }
    }
}
