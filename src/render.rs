//! Reconciles store state into the cheapest correct rendering operation.
//!
//! [`ChartRenderSync`] keeps a shadow copy of the last rendered candle
//! array per timeframe and diffs each new snapshot against it, emitting
//! append / patch-last / full-reset operations for the chart surface.
//! The market-cap scale mode re-expresses price as a derived figure on
//! the way out; the stored series is never mutated by the transform.

use std::collections::HashMap;

use tracing::warn;

use crate::types::{Candle, OrderLine, Timeframe};

/// Minimal operation the chart surface needs for one state transition.
///
/// After a `ResetDataset` the consumer performs an automatic viewport fit.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartOp {
    /// Append (or finalise-then-append) the trailing candles via
    /// per-candle incremental update calls
    AppendCandles(Vec<Candle>),
    /// Mutate only the last rendered candle
    PatchLastCandle(Candle),
    /// Treat as a new dataset and redraw from scratch
    ResetDataset(Vec<Candle>),
}

/// Live price / market-cap marker for the chart surface
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLine {
    pub value: f64,
    pub color: String,
    pub label: String,
}

/// Presentation-layer value scaling
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScaleMode {
    /// Raw series units
    #[default]
    Price,
    /// Every OHLC field is multiplied by `scale_factor` before rendering
    MarketCap { scale_factor: f64 },
}

impl ScaleMode {
    pub fn factor(&self) -> f64 {
        match self {
            ScaleMode::Price => 1.0,
            ScaleMode::MarketCap { scale_factor } => *scale_factor,
        }
    }
}

/// Parse a reference total-value figure like `"$14M"`, `"250k"` or
/// `"1.2B"` through the K/M/B/T suffix table.
///
/// Returns `None` for malformed or non-positive input, which callers
/// treat as "fall back to unscaled price mode".
pub fn parse_reference_value(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_start_matches('$').replace(',', "");
    if cleaned.is_empty() {
        return None;
    }

    let (number, multiplier) = match cleaned.chars().last() {
        Some('K') | Some('k') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        Some('M') | Some('m') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        Some('B') | Some('b') => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        Some('T') | Some('t') => (&cleaned[..cleaned.len() - 1], 1_000_000_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };

    let value: f64 = number.parse().ok()?;
    let value = value * multiplier;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Decimal places for a value of this magnitude.
///
/// One table serves both axis labels and the live readout so the two
/// never disagree; low-magnitude instruments get precision down to the
/// sub-micro range.
pub fn decimals_for(value: f64) -> usize {
    let v = value.abs();
    if v >= 1_000.0 {
        2
    } else if v >= 1.0 {
        4
    } else if v >= 0.01 {
        6
    } else if v >= 0.000_1 {
        8
    } else {
        10
    }
}

/// Format a value with magnitude-appropriate precision
pub fn format_value(value: f64) -> String {
    format!("{value:.prec$}", prec = decimals_for(value))
}

/// Translates store snapshots into minimal chart operations.
#[derive(Debug, Default)]
pub struct ChartRenderSync {
    shadows: HashMap<Timeframe, Vec<Candle>>,
    scale: ScaleMode,
}

impl ChartRenderSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scale_mode(&self) -> ScaleMode {
        self.scale
    }

    /// Enter market-cap mode from a reference figure (e.g. `"$14M"`) and
    /// the latest unscaled close, or fall back to price mode when the
    /// figure is malformed or the close is unusable.
    ///
    /// The factor is fixed until the next reference-value change; every
    /// shadow is invalidated so each timeframe redraws in the new units.
    pub fn set_reference_value(&mut self, raw: Option<&str>, latest_close: f64) -> ScaleMode {
        let parsed = raw.and_then(parse_reference_value);
        let mode = match parsed {
            Some(reference) if latest_close.is_finite() && latest_close > 0.0 => {
                ScaleMode::MarketCap {
                    scale_factor: reference / latest_close,
                }
            }
            _ => ScaleMode::Price,
        };
        self.set_scale_mode(mode);
        mode
    }

    pub fn set_scale_mode(&mut self, mode: ScaleMode) {
        if self.scale != mode {
            self.scale = mode;
            // Everything rendered so far is in the old units
            self.shadows.clear();
        }
    }

    /// Diff one timeframe's candle snapshot against the shadow copy and
    /// emit the cheapest correct operation, already scaled for display.
    ///
    /// Returns `None` when the rendered state is already current.
    pub fn sync(&mut self, timeframe: Timeframe, candles: &[Candle]) -> Option<ChartOp> {
        let shadow = self.shadows.entry(timeframe).or_default();
        let op = decide(shadow, candles)?;

        *shadow = candles.to_vec();

        let factor = self.scale.factor();
        Some(match op {
            RawOp::Append(from) => {
                ChartOp::AppendCandles(scale_candles(&candles[from..], factor))
            }
            RawOp::PatchLast => {
                let last = *candles.last().expect("patch implies non-empty");
                ChartOp::PatchLastCandle(scale_candle(last, factor))
            }
            RawOp::Reset => ChartOp::ResetDataset(scale_candles(candles, factor)),
        })
    }

    /// Drop the shadow for one timeframe, forcing a reset on next sync
    pub fn invalidate(&mut self, timeframe: Timeframe) {
        self.shadows.remove(&timeframe);
    }

    /// Drop every shadow (instrument switch)
    pub fn invalidate_all(&mut self) {
        self.shadows.clear();
    }

    /// Live price marker in display units, labelled with the same
    /// precision table as the axis
    pub fn price_line(&self, value: f64, color: impl Into<String>) -> PriceLine {
        let scaled = value * self.scale.factor();
        PriceLine {
            value: scaled,
            color: color.into(),
            label: format_value(scaled),
        }
    }

    /// External order markers re-projected into display units
    pub fn overlay_lines(&self, orders: &[OrderLine]) -> Vec<OrderLine> {
        let factor = self.scale.factor();
        orders
            .iter()
            .map(|order| OrderLine {
                price: order.price * factor,
                ..order.clone()
            })
            .collect()
    }
}

enum RawOp {
    /// Append candles from this index onward
    Append(usize),
    PatchLast,
    Reset,
}

fn decide(prev: &[Candle], next: &[Candle]) -> Option<RawOp> {
    if prev.is_empty() && next.is_empty() {
        return None;
    }
    if prev.is_empty() {
        return Some(RawOp::Reset);
    }
    if next.len() < prev.len() || next[0].time != prev[0].time {
        // Instrument switch, shrink or leading-time mismatch
        return Some(RawOp::Reset);
    }

    let boundary = prev.len();
    let prev_last = prev[boundary - 1];

    if next.len() == boundary {
        let next_last = next[boundary - 1];
        if next_last.time != prev_last.time {
            // Equal length but the tail moved in time: impossible
            // transition, redraw from scratch
            warn!(
                prev_time = prev_last.time,
                next_time = next_last.time,
                "render desync detected, falling back to full replace"
            );
            return Some(RawOp::Reset);
        }
        if next_last != prev_last {
            return Some(RawOp::PatchLast);
        }
        return None;
    }

    // Longer than the shadow: append-only iff the shared region still
    // lines up at the seam
    if next[boundary - 1].time != prev_last.time {
        warn!("render desync at append seam, falling back to full replace");
        return Some(RawOp::Reset);
    }

    if next[boundary - 1] != prev_last {
        // The previously-current bar was finalised with different values;
        // re-emit it ahead of the new trailing candles
        Some(RawOp::Append(boundary - 1))
    } else {
        Some(RawOp::Append(boundary))
    }
}

fn scale_candle(candle: Candle, factor: f64) -> Candle {
    Candle {
        open: candle.open * factor,
        high: candle.high * factor,
        low: candle.low * factor,
        close: candle.close * factor,
        ..candle
    }
}

fn scale_candles(candles: &[Candle], factor: f64) -> Vec<Candle> {
    candles
        .iter()
        .map(|candle| scale_candle(*candle, factor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderLineKind, Side, TimeframeUnit};

    const TF: Timeframe = Timeframe {
        unit: TimeframeUnit::Minute,
        count: 1,
    };

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    mod decisions {
        use super::*;

        #[test]
        fn first_sync_is_reset() {
            let mut sync = ChartRenderSync::new();
            let series = vec![candle(0, 1.0), candle(60, 2.0)];
            match sync.sync(TF, &series) {
                Some(ChartOp::ResetDataset(candles)) => assert_eq!(candles.len(), 2),
                other => panic!("expected reset, got {other:?}"),
            }
        }

        #[test]
        fn unchanged_series_is_a_no_op() {
            let mut sync = ChartRenderSync::new();
            let series = vec![candle(0, 1.0), candle(60, 2.0)];
            sync.sync(TF, &series);
            assert_eq!(sync.sync(TF, &series), None);
        }

        #[test]
        fn growth_appends_trailing_candles() {
            let mut sync = ChartRenderSync::new();
            let mut series = vec![candle(0, 1.0)];
            sync.sync(TF, &series);

            series.push(candle(60, 1.2));
            series.push(candle(120, 1.3));
            match sync.sync(TF, &series) {
                Some(ChartOp::AppendCandles(appended)) => {
                    let times: Vec<i64> = appended.iter().map(|c| c.time).collect();
                    assert_eq!(times, vec![60, 120]);
                }
                other => panic!("expected append, got {other:?}"),
            }
        }

        #[test]
        fn growth_reemits_finalised_bar_when_it_changed() {
            let mut sync = ChartRenderSync::new();
            let mut current = candle(60, 1.2);
            current.is_closed = false;
            sync.sync(TF, &[candle(0, 1.0), current]);

            // The bar at 60 closed with a different close, then 120 opened
            let mut finalised = candle(60, 1.4);
            finalised.is_closed = true;
            let series = vec![candle(0, 1.0), finalised, candle(120, 1.4)];
            match sync.sync(TF, &series) {
                Some(ChartOp::AppendCandles(appended)) => {
                    let times: Vec<i64> = appended.iter().map(|c| c.time).collect();
                    assert_eq!(times, vec![60, 120]);
                }
                other => panic!("expected append, got {other:?}"),
            }
        }

        #[test]
        fn same_length_last_bar_change_patches() {
            let mut sync = ChartRenderSync::new();
            sync.sync(TF, &[candle(0, 1.0), candle(60, 1.2)]);

            let series = vec![candle(0, 1.0), candle(60, 1.5)];
            match sync.sync(TF, &series) {
                Some(ChartOp::PatchLastCandle(patched)) => {
                    assert_eq!(patched.time, 60);
                    assert_eq!(patched.close, 1.5);
                }
                other => panic!("expected patch, got {other:?}"),
            }
        }

        #[test]
        fn shrink_resets() {
            let mut sync = ChartRenderSync::new();
            sync.sync(TF, &[candle(0, 1.0), candle(60, 2.0)]);
            match sync.sync(TF, &[candle(0, 1.0)]) {
                Some(ChartOp::ResetDataset(_)) => {}
                other => panic!("expected reset, got {other:?}"),
            }
        }

        #[test]
        fn leading_time_mismatch_resets() {
            let mut sync = ChartRenderSync::new();
            sync.sync(TF, &[candle(0, 1.0), candle(60, 2.0)]);

            // Same length, different head: a different instrument's series
            let series = vec![candle(300, 5.0), candle(360, 6.0)];
            match sync.sync(TF, &series) {
                Some(ChartOp::ResetDataset(_)) => {}
                other => panic!("expected reset, got {other:?}"),
            }
        }

        #[test]
        fn time_regression_on_tail_resets() {
            let mut sync = ChartRenderSync::new();
            sync.sync(TF, &[candle(0, 1.0), candle(120, 2.0)]);

            let series = vec![candle(0, 1.0), candle(60, 2.0)];
            match sync.sync(TF, &series) {
                Some(ChartOp::ResetDataset(_)) => {}
                other => panic!("expected reset, got {other:?}"),
            }
        }

        #[test]
        fn empty_after_nonempty_resets_to_empty() {
            let mut sync = ChartRenderSync::new();
            sync.sync(TF, &[candle(0, 1.0)]);
            match sync.sync(TF, &[]) {
                Some(ChartOp::ResetDataset(candles)) => assert!(candles.is_empty()),
                other => panic!("expected reset, got {other:?}"),
            }
        }

        #[test]
        fn timeframes_have_independent_shadows() {
            let mut sync = ChartRenderSync::new();
            let tf5 = Timeframe::minutes(5);
            sync.sync(TF, &[candle(0, 1.0)]);

            // First sight of the 5m series is a reset, not an append
            match sync.sync(tf5, &[candle(0, 1.0)]) {
                Some(ChartOp::ResetDataset(_)) => {}
                other => panic!("expected reset, got {other:?}"),
            }
        }
    }

    mod scaling {
        use super::*;

        #[test]
        fn market_cap_mode_scales_rendered_candles_only() {
            let mut sync = ChartRenderSync::new();
            // "$10K" at unscaled close 0.0001 -> factor 1e8
            let mode = sync.set_reference_value(Some("$10K"), 0.0001);
            match mode {
                ScaleMode::MarketCap { scale_factor } => {
                    assert!((scale_factor - 100_000_000.0).abs() < 1.0);
                }
                other => panic!("expected market-cap mode, got {other:?}"),
            }

            let stored = vec![candle(0, 0.0001), candle(60, 0.00012)];
            match sync.sync(TF, &stored) {
                Some(ChartOp::ResetDataset(rendered)) => {
                    assert!((rendered[1].close - 12_000.0).abs() < 1e-6);
                }
                other => panic!("expected reset, got {other:?}"),
            }
            // Underlying series untouched
            assert_eq!(stored[1].close, 0.00012);
        }

        #[test]
        fn reference_change_forces_redraw() {
            let mut sync = ChartRenderSync::new();
            let series = vec![candle(0, 1.0), candle(60, 2.0)];
            sync.sync(TF, &series);
            assert_eq!(sync.sync(TF, &series), None);

            sync.set_reference_value(Some("$5M"), 2.0);
            match sync.sync(TF, &series) {
                Some(ChartOp::ResetDataset(rendered)) => {
                    assert!((rendered[1].close - 5_000_000.0).abs() < 1e-3);
                }
                other => panic!("expected reset, got {other:?}"),
            }
        }

        #[test]
        fn malformed_reference_falls_back_to_price_mode() {
            let mut sync = ChartRenderSync::new();
            assert_eq!(sync.set_reference_value(Some("garbage"), 1.0), ScaleMode::Price);
            assert_eq!(sync.set_reference_value(None, 1.0), ScaleMode::Price);
            assert_eq!(sync.set_reference_value(Some("$10K"), 0.0), ScaleMode::Price);
        }

        #[test]
        fn price_line_and_overlays_share_the_projection() {
            let mut sync = ChartRenderSync::new();
            sync.set_reference_value(Some("$10K"), 0.0001);

            let line = sync.price_line(0.0001, "#22c55e");
            assert!((line.value - 10_000.0).abs() < 1e-6);
            assert_eq!(line.label, format_value(10_000.0));

            let orders = vec![OrderLine {
                id: "o-1".to_string(),
                kind: OrderLineKind::Limit,
                side: Side::Buy,
                price: 0.00005,
                amount: 100.0,
                draggable: true,
            }];
            let projected = sync.overlay_lines(&orders);
            assert!((projected[0].price - 5_000.0).abs() < 1e-6);
            // Anchoring data untouched
            assert_eq!(orders[0].price, 0.00005);
        }
    }

    mod reference_parsing {
        use super::*;

        #[test]
        fn parses_suffix_table() {
            assert_eq!(parse_reference_value("$14M"), Some(14_000_000.0));
            assert_eq!(parse_reference_value("250k"), Some(250_000.0));
            assert_eq!(parse_reference_value("1.5B"), Some(1_500_000_000.0));
            assert_eq!(parse_reference_value("2T"), Some(2_000_000_000_000.0));
            assert_eq!(parse_reference_value("1234.5"), Some(1234.5));
            assert_eq!(parse_reference_value("$1,250,000"), Some(1_250_000.0));
        }

        #[test]
        fn rejects_malformed_figures() {
            assert_eq!(parse_reference_value(""), None);
            assert_eq!(parse_reference_value("$"), None);
            assert_eq!(parse_reference_value("abc"), None);
            assert_eq!(parse_reference_value("-5M"), None);
            assert_eq!(parse_reference_value("0"), None);
            assert_eq!(parse_reference_value("NaN"), None);
        }
    }

    mod precision {
        use super::*;

        #[test]
        fn fewer_decimals_for_larger_magnitudes() {
            assert_eq!(decimals_for(12_000.0), 2);
            assert_eq!(decimals_for(3.5), 4);
            assert_eq!(decimals_for(0.05), 6);
            assert_eq!(decimals_for(0.0005), 8);
            assert_eq!(decimals_for(0.00000012), 10);
        }

        #[test]
        fn axis_and_readout_agree() {
            for value in [12_345.678, 0.000123, 1.5, 0.042] {
                assert_eq!(format_value(value), format_value(value));
                let decimals = decimals_for(value);
                assert_eq!(
                    format_value(value).split('.').nth(1).map(str::len),
                    Some(decimals)
                );
            }
        }
    }
}
