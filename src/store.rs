//! Authoritative in-memory state for the active instrument subscription.
//!
//! Owns the per-timeframe candle series, the latest observed price, the
//! recent-trade window and the connection status. All mutation goes
//! through action methods on one logical timeline; selectors are pure
//! projections safe to call on every render tick. Consumers subscribe to
//! per-timeframe change notifications rather than polling the store.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::warn;

use crate::aggregator::CandleUpdate;
use crate::types::{Candle, ConnectionStatus, Timeframe, Trade};

/// Eviction horizon of the recent-trades window
pub const TRADE_RETENTION_SECS: i64 = 30;
/// Hard cap on the recent-trades window length
pub const TRADE_WINDOW_CAP: usize = 100;

/// Shape of a change to one timeframe's series, published to subscribers
/// so they can choose append vs mutate semantics without a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesChange {
    /// A candle was appended (the previous current candle closed and/or a
    /// new current candle opened)
    Appended,
    /// Only the current candle changed in place
    PatchedLast,
    /// History was replaced wholesale; rebuild downstream state
    Replaced,
}

/// One timeframe's candle series: ordered closed candles plus at most one
/// open current candle.
#[derive(Debug, Clone, Default)]
pub struct Series {
    closed: Vec<Candle>,
    current: Option<Candle>,
}

impl Series {
    pub fn closed(&self) -> &[Candle] {
        &self.closed
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// Closed candles followed by the current candle, in time order
    pub fn combined(&self) -> Vec<Candle> {
        let mut out = self.closed.clone();
        out.extend(self.current);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.current.is_none()
    }
}

/// Single source of truth per active instrument subscription.
#[derive(Debug, Default)]
pub struct TradingStore {
    instrument: Option<String>,
    series: HashMap<Timeframe, Series>,
    current_price: Option<f64>,
    recent_trades: VecDeque<Trade>,
    connection: ConnectionStatus,
    subscribers: HashMap<Timeframe, Vec<mpsc::UnboundedSender<SeriesChange>>>,
}

impl TradingStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- actions -------------------------------------------------------

    /// Replace the closed-candle history for one timeframe wholesale
    /// (initial load or instrument switch).
    ///
    /// Input is re-sorted by time and de-duplicated by bucket, keeping the
    /// last write for any colliding bucket. Malformed candles are skipped.
    pub fn set_series(&mut self, timeframe: Timeframe, candles: Vec<Candle>) {
        let mut closed: Vec<Candle> = candles
            .into_iter()
            .filter(|candle| {
                let ok = candle.has_valid_shape()
                    && timeframe.bucket_start(candle.time) == candle.time;
                if !ok {
                    warn!(timeframe = %timeframe, time = candle.time, "skipping malformed backfill candle");
                }
                ok
            })
            .map(|mut candle| {
                candle.is_closed = true;
                candle
            })
            .collect();

        // Stable sort, then keep the last write per bucket: reversing
        // makes later writes the first of each equal-time run.
        closed.sort_by_key(|candle| candle.time);
        closed.reverse();
        closed.dedup_by_key(|candle| candle.time);
        closed.reverse();

        let series = self.series.entry(timeframe).or_default();
        series.closed = closed;

        // A current candle at or before the new history tail would break
        // strict time ordering; the next live update reopens it.
        if let (Some(last), Some(current)) = (series.closed.last(), series.current) {
            if current.time <= last.time {
                series.current = None;
            }
        }

        self.notify(timeframe, SeriesChange::Replaced);
    }

    /// Merge an aggregator update into the series per the append/patch rule.
    pub fn apply_update(&mut self, timeframe: Timeframe, update: CandleUpdate) {
        let series = self.series.entry(timeframe).or_default();

        let change = match update {
            CandleUpdate::Rolled { closed, current } => {
                if let Some(candle) = closed {
                    match series.closed.last().map(|last| last.time) {
                        Some(last_time) if candle.time == last_time => {
                            // Same bucket seen again (e.g. backfill overlap):
                            // last write wins.
                            *series.closed.last_mut().expect("non-empty") = candle;
                        }
                        Some(last_time) if candle.time < last_time => {
                            warn!(
                                timeframe = %timeframe,
                                time = candle.time,
                                last_time,
                                "dropping out-of-order closed candle"
                            );
                        }
                        _ => series.closed.push(candle),
                    }
                }
                series.current = Some(current);
                SeriesChange::Appended
            }
            CandleUpdate::Patched(candle) => {
                series.current = Some(candle);
                SeriesChange::PatchedLast
            }
        };

        self.notify(timeframe, change);
    }

    /// Update the latest observed instantaneous price, independent of
    /// candle granularity.
    pub fn set_current_price(&mut self, price: f64) {
        if !price.is_finite() || price < 0.0 {
            warn!(price, "ignoring malformed current price");
            return;
        }
        self.current_price = Some(price);
    }

    /// Insert into the recent-trades window, evicting entries older than
    /// the retention horizon and capping the window length.
    pub fn push_trade(&mut self, trade: Trade) {
        let horizon = trade.unix_time() - TRADE_RETENTION_SECS;
        self.recent_trades.push_back(trade);
        while let Some(front) = self.recent_trades.front() {
            if front.unix_time() < horizon {
                self.recent_trades.pop_front();
            } else {
                break;
            }
        }
        while self.recent_trades.len() > TRADE_WINDOW_CAP {
            self.recent_trades.pop_front();
        }
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.connection = status;
    }

    pub fn set_instrument(&mut self, instrument: impl Into<String>) {
        self.instrument = Some(instrument.into());
    }

    /// Destroy all per-instrument state (subscription teardown or
    /// instrument switch). Subscribers stay registered.
    pub fn clear(&mut self) {
        self.instrument = None;
        self.current_price = None;
        self.recent_trades.clear();
        let timeframes: Vec<Timeframe> = self.series.keys().copied().collect();
        for timeframe in timeframes {
            self.series.remove(&timeframe);
            self.notify(timeframe, SeriesChange::Replaced);
        }
    }

    // ---- change notification ------------------------------------------

    /// Subscribe narrowly to one timeframe's series changes.
    pub fn subscribe(&mut self, timeframe: Timeframe) -> mpsc::UnboundedReceiver<SeriesChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(timeframe).or_default().push(tx);
        rx
    }

    fn notify(&mut self, timeframe: Timeframe, change: SeriesChange) {
        if let Some(senders) = self.subscribers.get_mut(&timeframe) {
            // Dropped receivers are pruned as they are discovered
            senders.retain(|tx| tx.send(change).is_ok());
        }
    }

    // ---- selectors (pure) ---------------------------------------------

    pub fn instrument(&self) -> Option<&str> {
        self.instrument.as_deref()
    }

    /// Closed candles followed by the current candle, in time order
    pub fn candles(&self, timeframe: Timeframe) -> Vec<Candle> {
        self.series
            .get(&timeframe)
            .map(Series::combined)
            .unwrap_or_default()
    }

    pub fn closed_candles(&self, timeframe: Timeframe) -> &[Candle] {
        self.series
            .get(&timeframe)
            .map(Series::closed)
            .unwrap_or(&[])
    }

    pub fn current_candle(&self, timeframe: Timeframe) -> Option<&Candle> {
        self.series.get(&timeframe).and_then(Series::current)
    }

    /// Close prices of the closed candles, for indicator computation
    pub fn closes(&self, timeframe: Timeframe) -> Vec<f64> {
        self.closed_candles(timeframe)
            .iter()
            .map(|candle| candle.close)
            .collect()
    }

    pub fn recent_trades(&self) -> impl Iterator<Item = &Trade> {
        self.recent_trades.iter()
    }

    pub fn current_price(&self) -> Option<f64> {
        self.current_price
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection
    }
}
