/// Core data types for the candle engine
///
/// These types match the JSON message format of the upstream tick/candle
/// feed and are shared by every layer of the crate.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade side (buyer vs seller initiated)
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Convert to display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Check if this is a buy
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Check if this is a sell
    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit of a candle timeframe
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeUnit {
    Second,
    Minute,
    Hour,
    Day,
    /// Fixed 30-day bucket. Timeframes are fixed-width in seconds, so
    /// calendar months are not representable.
    Month,
}

impl TimeframeUnit {
    /// Width of one unit in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            TimeframeUnit::Second => 1,
            TimeframeUnit::Minute => 60,
            TimeframeUnit::Hour => 3_600,
            TimeframeUnit::Day => 86_400,
            TimeframeUnit::Month => 30 * 86_400,
        }
    }

    fn suffix(&self) -> char {
        match self {
            TimeframeUnit::Second => 's',
            TimeframeUnit::Minute => 'm',
            TimeframeUnit::Hour => 'h',
            TimeframeUnit::Day => 'd',
            TimeframeUnit::Month => 'M',
        }
    }
}

/// Candle bucket duration: a count of a base unit (e.g. 15s, 1m, 4h)
///
/// Distinct timeframes are independent series over the same tick stream.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub unit: TimeframeUnit,
    /// Must be >= 1
    pub count: u32,
}

impl Timeframe {
    pub fn new(unit: TimeframeUnit, count: u32) -> Self {
        Self {
            unit,
            count: count.max(1),
        }
    }

    pub fn seconds(count: u32) -> Self {
        Self::new(TimeframeUnit::Second, count)
    }

    pub fn minutes(count: u32) -> Self {
        Self::new(TimeframeUnit::Minute, count)
    }

    pub fn hours(count: u32) -> Self {
        Self::new(TimeframeUnit::Hour, count)
    }

    pub fn days(count: u32) -> Self {
        Self::new(TimeframeUnit::Day, count)
    }

    /// Bucket width in seconds
    pub fn duration_secs(&self) -> i64 {
        self.unit.seconds() * i64::from(self.count)
    }

    /// Align a unix-seconds timestamp down to the start of its bucket
    pub fn bucket_start(&self, time: i64) -> i64 {
        let duration = self.duration_secs();
        time.div_euclid(duration) * duration
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    /// Parse subscription-topic strings like "30s", "1m", "4h", "1d", "1M"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let suffix = s.chars().last().ok_or_else(|| "empty timeframe".to_string())?;
        let digits = &s[..s.len() - suffix.len_utf8()];
        let count: u32 = digits
            .parse()
            .map_err(|_| format!("invalid timeframe count: {s}"))?;
        if count == 0 {
            return Err(format!("timeframe count must be positive: {s}"));
        }
        let unit = match suffix {
            's' => TimeframeUnit::Second,
            'm' => TimeframeUnit::Minute,
            'h' => TimeframeUnit::Hour,
            'd' => TimeframeUnit::Day,
            'M' => TimeframeUnit::Month,
            _ => return Err(format!("invalid timeframe unit: {s}")),
        };
        Ok(Timeframe { unit, count })
    }
}

/// One OHLCV bucket
///
/// `time` is the bucket start in unix seconds and is always an exact
/// multiple of the owning timeframe's duration. Invariants maintained by
/// the aggregator and store: `high >= max(open, close, low)` and
/// `low <= min(open, close, high)`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct Candle {
    /// Bucket start (unix seconds)
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// False only for the still-open current bucket
    pub is_closed: bool,
}

impl Candle {
    /// Open a new bucket from a single traded price
    pub fn from_price(time: i64, price: f64, volume: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            is_closed: false,
        }
    }

    /// Fold one trade into this bucket
    pub fn merge_price(&mut self, price: f64, volume: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += volume;
    }

    /// Whether OHLC values are finite, non-negative and consistent
    pub fn has_valid_shape(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0);
        finite
            && self.volume.is_finite()
            && self.volume >= 0.0
            && self.high >= self.open.max(self.close).max(self.low)
            && self.low <= self.open.min(self.close).min(self.high)
    }
}

/// A single trade execution from the feed
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Trade {
    /// Unique per event
    pub id: String,
    pub side: Side,
    pub price_usd: f64,
    /// Trade size in base currency
    pub amount_base: f64,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// USD notional of this trade
    pub fn notional_usd(&self) -> f64 {
        self.price_usd * self.amount_base
    }

    /// Event time as unix seconds
    pub fn unix_time(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

/// Messages from the tick/candle feed
///
/// Tagged envelope; unrecognised tags fail deserialisation and are
/// rejected at the boundary rather than duck-typed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// Discrete trade execution
    Trade(Trade),
    /// Authoritative state of the currently-open bucket, sent periodically
    /// even absent new trades
    CandleSnapshot {
        timeframe: Timeframe,
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    },
}

impl FeedEvent {
    /// Event time as unix seconds
    pub fn unix_time(&self) -> i64 {
        match self {
            FeedEvent::Trade(trade) => trade.unix_time(),
            FeedEvent::CandleSnapshot { time, .. } => *time,
        }
    }
}

/// Kind of an externally-sourced order marker
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderLineKind {
    Limit,
    StopLoss,
    TakeProfit,
}

/// External order rendered as a horizontal reference line
///
/// Not owned by this engine; consumed for overlay placement only.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OrderLine {
    pub id: String,
    pub kind: OrderLineKind,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub draggable: bool,
}

/// Transport state surfaced to consumers
///
/// Reflects real transport state, never an optimistic guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transport failed or the connect timeout elapsed
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
