//! candleflow - real-time candle engine for a live chart
//!
//! Ingests a continuous stream of trade/price events for a traded
//! instrument and turns them into multi-timeframe OHLCV candle series:
//!
//! - [`CandleAggregator`] buckets ticks into candles and owns the live
//!   (unclosed) candle per timeframe
//! - [`TradingStore`] is the single source of truth for series, price,
//!   recent trades and connection status
//! - [`StreamSync`] manages the feed subscription lifecycle: connect,
//!   resubscribe on instrument change, reconnect with backoff, backfill
//! - [`ChartEngine`] wires feed events through the aggregator into the
//!   store on one logical timeline, fenced by subscription epoch
//! - [`ChartRenderSync`] diffs store state into the minimal chart
//!   operation (append / patch last / reset) and applies the optional
//!   price-to-market-cap scale projection
//! - [`indicators`] are pure functions over closed-candle closes
//! - [`DrawingManager`] maps pointer events to (time, price)-anchored
//!   drawing objects rendered as an overlay
//!
//! The crate is a library-level engine embedded in a larger charting
//! application; it has no CLI and persists nothing beyond its in-memory
//! working set.

pub mod aggregator;
pub mod drawings;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod render;
pub mod store;
pub mod stream;
pub mod types;

// Re-export commonly used types for convenience
pub use aggregator::{CandleAggregator, CandleUpdate};
pub use drawings::{Drawing, DrawingManager, DrawingTool};
pub use engine::ChartEngine;
pub use error::{StreamError, TickError};
pub use render::{
    decimals_for, format_value, parse_reference_value, ChartOp, ChartRenderSync, PriceLine,
    ScaleMode,
};
pub use store::{SeriesChange, TradingStore, TRADE_RETENTION_SECS, TRADE_WINDOW_CAP};
pub use stream::{Backoff, BackfillClient, StreamConfig, StreamMessage, StreamSync, Subscription};
pub use types::{
    Candle, ConnectionStatus, FeedEvent, OrderLine, OrderLineKind, Side, Timeframe, TimeframeUnit,
    Trade,
};
