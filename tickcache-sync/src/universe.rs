//! Desired-symbol selection from the market snapshot.

use std::collections::BTreeSet;
use tickcache_core::domain::MarketBar;

/// The `n` most traded symbols on the latest snapshot date, in alphabetical
/// order. Ties in volume keep the symbol that sorts first.
pub fn top_symbols_by_volume(snapshot: &[MarketBar], n: usize) -> Vec<String> {
    let Some(latest) = snapshot.iter().map(|b| b.date).max() else {
        return Vec::new();
    };
    let mut day: Vec<&MarketBar> = snapshot.iter().filter(|b| b.date == latest).collect();
    day.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.symbol.cmp(&b.symbol)));
    let mut top: Vec<String> = day.into_iter().take(n).map(|b| b.symbol.clone()).collect();
    top.sort();
    top.dedup();
    top
}

/// Normalize configured symbols and the volume ranking into one desired set.
pub fn desired_symbols(configured: &[String], snapshot: &[MarketBar], top_n: usize) -> BTreeSet<String> {
    let mut desired: BTreeSet<String> = configured
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if top_n > 0 {
        desired.extend(top_symbols_by_volume(snapshot, top_n));
    }
    desired
}
