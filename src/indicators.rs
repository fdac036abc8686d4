//! Pure indicator functions over closed-candle close sequences.
//!
//! Every function is stateless and deterministic: identical input yields
//! identical output. Results are aligned index-for-index with the input;
//! entries before the lookback window fills are `None` rather than zero.
//! Inputs shorter than the lookback produce leading `None`s (or an
//! all-`None` result), never an error.

/// One Bollinger Bands point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerPoint {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// MACD line, signal line and histogram, index-aligned with the input
#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    pub macd: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// Simple moving average: arithmetic mean of the trailing `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    // Running sum for O(1) updates per bar
    let mut sum: f64 = closes[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);

    for i in period..closes.len() {
        sum += closes[i] - closes[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Exponential moving average, seeded by the SMA of the first `period`
/// values, then smoothed with alpha = 2 / (period + 1).
pub fn ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for i in period..closes.len() {
        prev = alpha * closes[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    out
}

/// Relative Strength Index with Wilder smoothing, 0-100.
///
/// Flat runs (average loss of zero) are defined as RSI = 100; there is no
/// division by zero.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change >= 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let (gain, loss) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        // Wilder smoothing
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// MACD: `EMA(fast) - EMA(slow)` as the MACD line, `EMA(signal)` of that
/// line as the signal line, and their difference as the histogram.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    let len = closes.len();
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);

    let mut macd_line = vec![None; len];
    for i in 0..len {
        if let (Some(f), Some(s)) = (ema_fast[i], ema_slow[i]) {
            macd_line[i] = Some(f - s);
        }
    }

    // The MACD line only exists from the slower lookback onward; the
    // signal EMA runs over that compacted region and is re-aligned.
    let offset = macd_line.iter().position(Option::is_some).unwrap_or(len);
    let compact: Vec<f64> = macd_line[offset..].iter().filter_map(|v| *v).collect();
    let signal_compact = ema(&compact, signal);

    let mut signal_line = vec![None; len];
    for (j, value) in signal_compact.into_iter().enumerate() {
        signal_line[offset + j] = value;
    }

    let mut histogram = vec![None; len];
    for i in 0..len {
        if let (Some(m), Some(s)) = (macd_line[i], signal_line[i]) {
            histogram[i] = Some(m - s);
        }
    }

    MacdSeries {
        macd: macd_line,
        signal: signal_line,
        histogram,
    }
}

/// Bollinger Bands: middle = SMA(period), upper/lower = middle +/-
/// `std_dev_multiplier` times the rolling population standard deviation.
pub fn bollinger(
    closes: &[f64],
    period: usize,
    std_dev_multiplier: f64,
) -> Vec<Option<BollingerPoint>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    for i in (period - 1)..closes.len() {
        let window = &closes[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance =
            window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / period as f64;
        let band = std_dev_multiplier * variance.sqrt();
        out[i] = Some(BollingerPoint {
            upper: mean + band,
            middle: mean,
            lower: mean - band,
        });
    }
    out
}
