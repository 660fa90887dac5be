//! Time-weighted average price of one bar.
//!
//! The bar path is decomposed two ways, open->high->low->close and
//! open->low->high->close. Each leg contributes its midpoint weighted by the
//! leg's share of the path length, and the two path estimates are averaged.
//! A zero-range bar has no defined path and falls back to the close.

pub fn twap(open: f64, high: f64, low: f64, close: f64) -> f64 {
    let oh = (open - high).abs();
    let ol = (open - low).abs();
    let hl = (high - low).abs();
    let lc = (low - close).abs();
    let hc = (high - close).abs();

    let ohlc = oh + hl + lc;
    let olhc = ol + hl + hc;

    let ohlc_twap = (oh / ohlc) * (open + high) / 2.0
        + (hl / ohlc) * (high + low) / 2.0
        + (lc / ohlc) * (low + close) / 2.0;
    let olhc_twap = (ol / olhc) * (open + low) / 2.0
        + (hl / olhc) * (high + low) / 2.0
        + (hc / olhc) * (high + close) / 2.0;

    let value = (ohlc_twap + olhc_twap) / 2.0;
    if value.is_nan() {
        close
    } else {
        value
    }
}
