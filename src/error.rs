use crate::types::Timeframe;
use thiserror::Error;

/// Rejection of a malformed tick or snapshot at the aggregation boundary.
///
/// These never reach the store and never interrupt processing of
/// subsequent valid events.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TickError {
    #[error("non-finite price: {0}")]
    NonFinitePrice(f64),

    #[error("negative price: {0}")]
    NegativePrice(f64),

    #[error("negative or non-finite volume: {0}")]
    InvalidVolume(f64),

    #[error("timestamp {time} predates the unix epoch")]
    InvalidTimestamp { time: i64 },

    #[error("snapshot for {timeframe} has inconsistent OHLC shape")]
    MalformedSnapshot { timeframe: Timeframe },

    #[error("snapshot time {time} is not aligned to {timeframe} buckets")]
    MisalignedSnapshot { timeframe: Timeframe, time: i64 },
}

/// All errors generated by the stream layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket transport failure: {0}")]
    Transport(String),

    #[error("connection attempt timed out after {secs}s")]
    ConnectTimeout { secs: u64 },

    #[error("backfill request failed: {0}")]
    Backfill(String),

    #[error("backfill response malformed: {0}")]
    BackfillParse(String),

    #[error("feed message malformed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("subscription channel closed")]
    ChannelClosed,
}

impl StreamError {
    /// Determine if an error requires the stream loop to tear down the
    /// transport and reconnect, as opposed to skipping one message.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamError::Transport(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("terminated")
                    || msg.contains("connectionclosed")
                    || msg.contains("alreadyclosed")
                    || msg.contains("io(")
                    || msg.contains("timeout")
            }
            StreamError::ConnectTimeout { .. } => true,
            StreamError::ChannelClosed => true,
            StreamError::Backfill(_) | StreamError::BackfillParse(_) | StreamError::Parse(_) => {
                false
            }
        }
    }
}
