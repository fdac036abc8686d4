//! Tick-to-candle aggregation.
//!
//! Converts the trade/snapshot stream into bucketed OHLCV candles, one
//! independent series per subscribed timeframe, and owns the "current
//! candle" for each. Emits typed updates so downstream consumers can
//! choose append vs mutate semantics without recomputing a diff.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::TickError;
use crate::types::{Candle, Timeframe, Trade};

/// Incremental change to one timeframe's series.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleUpdate {
    /// The previous current candle (if any) was finalised and a new
    /// bucket opened.
    Rolled {
        closed: Option<Candle>,
        current: Candle,
    },
    /// The current bucket was updated in place.
    Patched(Candle),
}

impl CandleUpdate {
    /// The candle that is current after applying this update
    pub fn current(&self) -> &Candle {
        match self {
            CandleUpdate::Rolled { current, .. } => current,
            CandleUpdate::Patched(candle) => candle,
        }
    }
}

/// Streams trades and open-bucket snapshots into per-timeframe candles.
///
/// Late events for an already-closed bucket are dropped, never
/// back-filled; a closed candle is never reopened.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    timeframes: Vec<Timeframe>,
    current: HashMap<Timeframe, Candle>,
    late_drops: u64,
}

impl CandleAggregator {
    pub fn new(timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        let mut unique = Vec::new();
        for tf in timeframes {
            if !unique.contains(&tf) {
                unique.push(tf);
            }
        }
        Self {
            timeframes: unique,
            current: HashMap::new(),
            late_drops: 0,
        }
    }

    /// The subscribed timeframe set, in subscription order
    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// Current (unclosed) candle for a timeframe, if one is open
    pub fn current_candle(&self, timeframe: Timeframe) -> Option<&Candle> {
        self.current.get(&timeframe)
    }

    /// Count of events dropped because their bucket had already closed
    pub fn late_drops(&self) -> u64 {
        self.late_drops
    }

    /// Fold one trade into every subscribed timeframe.
    ///
    /// Returns one update per timeframe the trade touched; a late trade
    /// produces no update for the timeframes it is stale for.
    pub fn ingest_trade(
        &mut self,
        trade: &Trade,
    ) -> Result<Vec<(Timeframe, CandleUpdate)>, TickError> {
        validate_trade(trade)?;

        let time = trade.unix_time();
        let mut updates = Vec::with_capacity(self.timeframes.len());

        for &tf in &self.timeframes {
            let bucket = tf.bucket_start(time);
            let current_bucket = self.current.get(&tf).map(|candle| candle.time);

            match current_bucket {
                Some(open_bucket) if bucket == open_bucket => {
                    let current = self.current.get_mut(&tf).expect("open bucket exists");
                    current.merge_price(trade.price_usd, trade.amount_base);
                    updates.push((tf, CandleUpdate::Patched(*current)));
                }
                Some(open_bucket) if bucket < open_bucket => {
                    // Stale bucket; back-filling history is not attempted.
                    self.late_drops += 1;
                    trace!(
                        timeframe = %tf,
                        tick_time = time,
                        current_bucket = open_bucket,
                        "dropping late tick"
                    );
                }
                _ => {
                    let closed = self.current.remove(&tf).map(|mut candle| {
                        candle.is_closed = true;
                        candle
                    });
                    let opened = Candle::from_price(bucket, trade.price_usd, trade.amount_base);
                    self.current.insert(tf, opened);
                    updates.push((
                        tf,
                        CandleUpdate::Rolled {
                            closed,
                            current: opened,
                        },
                    ));
                }
            }
        }

        Ok(updates)
    }

    /// Merge an authoritative open-bucket snapshot for one timeframe.
    ///
    /// Idempotent: a snapshot identical to the current candle produces no
    /// update. A snapshot for a newer bucket rolls the current candle; a
    /// snapshot for an older bucket is dropped.
    pub fn apply_snapshot(
        &mut self,
        timeframe: Timeframe,
        snapshot: Candle,
    ) -> Result<Option<CandleUpdate>, TickError> {
        if !self.timeframes.contains(&timeframe) {
            debug!(timeframe = %timeframe, "snapshot for unsubscribed timeframe ignored");
            return Ok(None);
        }
        if !snapshot.has_valid_shape() {
            return Err(TickError::MalformedSnapshot { timeframe });
        }
        if snapshot.time < 0 {
            return Err(TickError::InvalidTimestamp {
                time: snapshot.time,
            });
        }
        if timeframe.bucket_start(snapshot.time) != snapshot.time {
            return Err(TickError::MisalignedSnapshot {
                timeframe,
                time: snapshot.time,
            });
        }

        let incoming = Candle {
            is_closed: false,
            ..snapshot
        };

        let current_bucket = self.current.get(&timeframe).map(|candle| candle.time);

        match current_bucket {
            Some(open_bucket) if incoming.time == open_bucket => {
                let current = self.current.get_mut(&timeframe).expect("open bucket exists");
                if *current == incoming {
                    return Ok(None);
                }
                *current = incoming;
                Ok(Some(CandleUpdate::Patched(incoming)))
            }
            Some(open_bucket) if incoming.time < open_bucket => {
                self.late_drops += 1;
                trace!(
                    timeframe = %timeframe,
                    snapshot_time = incoming.time,
                    current_bucket = open_bucket,
                    "dropping stale snapshot"
                );
                Ok(None)
            }
            _ => {
                let closed = self.current.remove(&timeframe).map(|mut candle| {
                    candle.is_closed = true;
                    candle
                });
                self.current.insert(timeframe, incoming);
                Ok(Some(CandleUpdate::Rolled {
                    closed,
                    current: incoming,
                }))
            }
        }
    }

    /// Roll any current candle whose bucket has elapsed on the wall clock.
    ///
    /// The fresh candle is seeded with `open = close` of the candle it
    /// follows, volume zero, so the live candle stays current under
    /// zero-trade conditions.
    pub fn roll_clock(&mut self, now: i64) -> Vec<(Timeframe, CandleUpdate)> {
        let mut updates = Vec::new();

        for &tf in &self.timeframes {
            let bucket = tf.bucket_start(now);
            let Some(current) = self.current.get(&tf) else {
                continue;
            };
            if bucket <= current.time {
                continue;
            }

            let mut closed = self.current.remove(&tf).expect("checked above");
            closed.is_closed = true;
            let seeded = Candle::from_price(bucket, closed.close, 0.0);
            self.current.insert(tf, seeded);
            updates.push((
                tf,
                CandleUpdate::Rolled {
                    closed: Some(closed),
                    current: seeded,
                },
            ));
        }

        updates
    }

    /// Drop all current-candle state (instrument switch)
    pub fn clear(&mut self) {
        self.current.clear();
        self.late_drops = 0;
    }
}

fn validate_trade(trade: &Trade) -> Result<(), TickError> {
    if !trade.price_usd.is_finite() {
        return Err(TickError::NonFinitePrice(trade.price_usd));
    }
    if trade.price_usd < 0.0 {
        return Err(TickError::NegativePrice(trade.price_usd));
    }
    if !trade.amount_base.is_finite() || trade.amount_base < 0.0 {
        return Err(TickError::InvalidVolume(trade.amount_base));
    }
    if trade.unix_time() < 0 {
        return Err(TickError::InvalidTimestamp {
            time: trade.unix_time(),
        });
    }
    Ok(())
}
