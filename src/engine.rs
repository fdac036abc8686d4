//! Single-timeline coordinator between the feed, the aggregator and the
//! store.
//!
//! All store mutation funnels through one [`ChartEngine`] so candle
//! updates for a timeframe are applied in non-decreasing bucket-time
//! order and renderers never observe a partially applied update. Every
//! message is fenced by subscription epoch: once the instrument switches,
//! events and backfills from the abandoned subscription are discarded.

use tracing::{debug, warn};

use crate::aggregator::CandleAggregator;
use crate::error::TickError;
use crate::store::TradingStore;
use crate::stream::StreamMessage;
use crate::types::{Candle, ConnectionStatus, FeedEvent, Timeframe};

pub struct ChartEngine {
    store: TradingStore,
    aggregator: CandleAggregator,
    epoch: u64,
    last_event_unix: Option<i64>,
}

impl ChartEngine {
    pub fn new(timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        Self {
            store: TradingStore::new(),
            aggregator: CandleAggregator::new(timeframes),
            epoch: 0,
            last_event_unix: None,
        }
    }

    pub fn store(&self) -> &TradingStore {
        &self.store
    }

    /// Mutable store access for registering subscribers
    pub fn store_mut(&mut self) -> &mut TradingStore {
        &mut self.store
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    /// Atomically tear down the old subscription state and accept the new
    /// instrument. `epoch` comes from [`StreamSync::subscribe`]; any
    /// in-flight message carrying an older epoch is dropped from here on.
    ///
    /// [`StreamSync::subscribe`]: crate::stream::StreamSync::subscribe
    pub fn switch_instrument(&mut self, instrument: impl Into<String>, epoch: u64) {
        self.epoch = epoch;
        self.last_event_unix = None;
        self.aggregator.clear();
        self.store.clear();
        self.store.set_instrument(instrument);
    }

    /// Route one stream message through the aggregator into the store.
    pub fn handle_message(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Event { epoch, event } => {
                if let Err(e) = self.handle_event(epoch, event) {
                    // Malformed input never interrupts subsequent events
                    warn!("rejected feed event: {e}");
                }
            }
            StreamMessage::Backfill {
                epoch,
                timeframe,
                candles,
            } => self.apply_backfill(epoch, timeframe, candles),
        }
    }

    /// Apply one live feed event.
    ///
    /// Stale-epoch events are silently discarded; malformed events are
    /// rejected before any state changes.
    pub fn handle_event(&mut self, epoch: u64, event: FeedEvent) -> Result<(), TickError> {
        if epoch != self.epoch {
            debug!(
                event_epoch = epoch,
                current_epoch = self.epoch,
                "dropping event from stale subscription"
            );
            return Ok(());
        }

        let event_time = event.unix_time();

        match event {
            FeedEvent::Trade(trade) => {
                let updates = self.aggregator.ingest_trade(&trade)?;
                for (timeframe, update) in updates {
                    self.store.apply_update(timeframe, update);
                }
                self.store.set_current_price(trade.price_usd);
                // Late trades are ordering-stale for aggregation but still
                // belong in the recent-trades window.
                self.store.push_trade(trade);
            }
            FeedEvent::CandleSnapshot {
                timeframe,
                time,
                open,
                high,
                low,
                close,
                volume,
            } => {
                let snapshot = Candle {
                    time,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    is_closed: false,
                };
                if let Some(update) = self.aggregator.apply_snapshot(timeframe, snapshot)? {
                    self.store.apply_update(timeframe, update);
                    self.store.set_current_price(close);
                }
            }
        }

        self.last_event_unix = Some(event_time);
        Ok(())
    }

    /// Seed or repair one timeframe's closed history from a backfill.
    ///
    /// A pending backfill that resolves after an instrument switch is
    /// ignored.
    pub fn apply_backfill(&mut self, epoch: u64, timeframe: Timeframe, candles: Vec<Candle>) {
        if epoch != self.epoch {
            debug!(
                backfill_epoch = epoch,
                current_epoch = self.epoch,
                timeframe = %timeframe,
                "ignoring backfill for abandoned subscription"
            );
            return;
        }
        self.store.set_series(timeframe, candles);
    }

    /// Roll any elapsed current candles on the wall clock so the live
    /// candle stays fresh under zero-trade conditions.
    pub fn roll_clock(&mut self, now_unix: i64) {
        for (timeframe, update) in self.aggregator.roll_clock(now_unix) {
            self.store.apply_update(timeframe, update);
        }
    }

    /// Mirror the transport status into the store for UI selectors
    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.store.set_connection_status(status);
    }

    /// Seconds since the last accepted feed event, for staleness display
    pub fn last_event_age(&self, now_unix: i64) -> Option<i64> {
        self.last_event_unix.map(|t| now_unix - t)
    }

    /// Count of events dropped because their bucket had already closed
    pub fn late_drops(&self) -> u64 {
        self.aggregator.late_drops()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Trade};
    use chrono::DateTime;

    const TF: Timeframe = Timeframe {
        unit: crate::types::TimeframeUnit::Minute,
        count: 1,
    };

    fn trade_event(time: i64, price: f64) -> FeedEvent {
        FeedEvent::Trade(Trade {
            id: format!("t-{time}"),
            side: Side::Buy,
            price_usd: price,
            amount_base: 1.0,
            timestamp: DateTime::from_timestamp(time, 0).unwrap(),
        })
    }

    fn snapshot_event(time: i64, close: f64) -> FeedEvent {
        FeedEvent::CandleSnapshot {
            timeframe: TF,
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn engine() -> ChartEngine {
        let mut engine = ChartEngine::new([TF]);
        engine.switch_instrument("MEME-USD", 1);
        engine
    }

    #[test]
    fn trade_flows_into_series_price_and_window() {
        let mut engine = engine();
        engine.handle_event(1, trade_event(65, 1.2)).unwrap();

        assert_eq!(engine.store().current_candle(TF).unwrap().time, 60);
        assert_eq!(engine.store().current_price(), Some(1.2));
        assert_eq!(engine.store().recent_trades().count(), 1);
    }

    #[test]
    fn stale_epoch_events_are_discarded() {
        let mut engine = engine();
        engine.handle_event(1, trade_event(65, 1.2)).unwrap();

        // Instrument switch: epoch 2 takes over
        engine.switch_instrument("OTHER-USD", 2);
        assert!(engine.store().candles(TF).is_empty());

        // A straggler from the old subscription must not touch the series
        engine.handle_event(1, trade_event(70, 9.9)).unwrap();
        assert!(engine.store().candles(TF).is_empty());
        assert_eq!(engine.store().current_price(), None);

        engine.handle_event(2, trade_event(70, 2.0)).unwrap();
        assert_eq!(engine.store().current_price(), Some(2.0));
    }

    #[test]
    fn stale_backfill_is_ignored_after_switch() {
        let mut engine = engine();
        let candles = vec![Candle::from_price(0, 1.0, 1.0)];

        engine.switch_instrument("OTHER-USD", 2);
        engine.apply_backfill(1, TF, candles.clone());
        assert!(engine.store().closed_candles(TF).is_empty());

        engine.apply_backfill(2, TF, candles);
        assert_eq!(engine.store().closed_candles(TF).len(), 1);
    }

    #[test]
    fn malformed_event_rejected_without_breaking_flow() {
        let mut engine = engine();
        let bad = FeedEvent::Trade(Trade {
            id: "bad".to_string(),
            side: Side::Buy,
            price_usd: f64::INFINITY,
            amount_base: 1.0,
            timestamp: DateTime::from_timestamp(65, 0).unwrap(),
        });
        assert!(engine.handle_event(1, bad).is_err());
        assert_eq!(engine.store().recent_trades().count(), 0);

        engine.handle_event(1, trade_event(65, 1.0)).unwrap();
        assert_eq!(engine.store().recent_trades().count(), 1);
    }

    #[test]
    fn snapshot_keeps_current_candle_fresh() {
        let mut engine = engine();
        engine.handle_event(1, snapshot_event(60, 1.1)).unwrap();
        assert_eq!(engine.store().current_candle(TF).unwrap().close, 1.1);
        assert_eq!(engine.store().current_price(), Some(1.1));

        // Identical snapshot: series unchanged, no phantom patch
        let mut rx = engine.store_mut().subscribe(TF);
        engine.handle_event(1, snapshot_event(60, 1.1)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clock_roll_closes_idle_bucket() {
        let mut engine = engine();
        engine.handle_event(1, trade_event(10, 1.5)).unwrap();

        engine.roll_clock(65);
        let closed = engine.store().closed_candles(TF);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close, 1.5);

        let current = engine.store().current_candle(TF).unwrap();
        assert_eq!(current.time, 60);
        assert_eq!(current.open, 1.5);
        assert_eq!(current.volume, 0.0);
    }

    #[test]
    fn late_trade_still_recorded_in_window() {
        let mut engine = engine();
        engine.handle_event(1, trade_event(65, 1.2)).unwrap();
        engine.handle_event(1, trade_event(50, 1.0)).unwrap();

        // Aggregation dropped it, the window did not
        assert_eq!(engine.late_drops(), 1);
        assert_eq!(engine.store().recent_trades().count(), 2);
        assert_eq!(engine.store().current_candle(TF).unwrap().close, 1.2);
    }

    #[test]
    fn last_event_age_tracks_accepted_events() {
        let mut engine = engine();
        assert_eq!(engine.last_event_age(100), None);

        engine.handle_event(1, trade_event(65, 1.2)).unwrap();
        assert_eq!(engine.last_event_age(100), Some(35));
    }
}
