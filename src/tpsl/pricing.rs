// =============================================================================
// Pure TP/SL price and size computation
// =============================================================================

use crate::settings::{PriceMode, Settings};
use crate::types::PosSide;

const EPS: f64 = 1e-9;

/// Distance applied in the profit direction of `side`.
fn offset_towards_profit(entry: f64, side: PosSide, distance: f64) -> f64 {
    match side {
        PosSide::Long => entry + distance,
        PosSide::Short => entry - distance,
    }
}

/// Distance applied in the loss direction of `side`.
fn offset_towards_loss(entry: f64, side: PosSide, distance: f64) -> f64 {
    match side {
        PosSide::Long => entry - distance,
        PosSide::Short => entry + distance,
    }
}

fn distance(entry: f64, mode: PriceMode, value: f64, atr: Option<f64>) -> f64 {
    match mode {
        PriceMode::Percent => entry * value / 100.0,
        PriceMode::Amount => value,
        PriceMode::Atr => atr.unwrap_or(0.0) * value,
    }
}

/// Compute the three TP prices for an entry. Disabled levels still get a
/// price (the engine marks them inactive) so `tp_data` always has 3 entries.
pub fn compute_tp_prices(
    entry: f64,
    settings: &Settings,
    side: PosSide,
    atr: Option<f64>,
) -> [f64; 3] {
    let mut prices = [0.0; 3];
    for level in 1..=3u8 {
        let d = distance(entry, settings.tp_option, settings.tp_value(level), atr);
        prices[(level - 1) as usize] = offset_towards_profit(entry, side, d);
    }
    prices
}

/// Compute the SL trigger price for an entry.
pub fn compute_sl_price(
    entry: f64,
    settings: &Settings,
    side: PosSide,
    atr: Option<f64>,
) -> f64 {
    let d = distance(entry, settings.sl_option, settings.sl_value, atr);
    offset_towards_loss(entry, side, d)
}

/// One computed TP slice: `(level, contracts)`.
pub type TpSlice = (u8, f64);

/// Split `total` contracts across the given `(level, ratio)` pairs.
///
/// Ratios are normalised to sum to 1. Sizes are floored to lot multiples and
/// the last slice receives the exact remainder so the total always matches.
/// A slice whose floored size is below one lot consumes the whole remainder
/// and terminates the split (dust never errors, it just shortens the graph).
pub fn split_tp_sizes(total: f64, ratios: &[(u8, f64)], lot: f64) -> Vec<TpSlice> {
    if total < lot - EPS || ratios.is_empty() || lot <= 0.0 {
        return Vec::new();
    }

    let ratio_sum: f64 = ratios.iter().map(|(_, r)| r).sum();
    if ratio_sum <= EPS {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(ratios.len());
    let mut remaining = total;
    let last_idx = ratios.len() - 1;

    for (idx, (level, ratio)) in ratios.iter().enumerate() {
        if remaining < lot - EPS {
            break;
        }
        let normalised = ratio / ratio_sum;
        let mut size = if idx == last_idx {
            remaining
        } else {
            ((total * normalised) / lot + EPS).floor() * lot
        };

        // Below-minimum slice: round up by consuming the remainder, then stop.
        if size + EPS < lot {
            out.push((*level, remaining));
            return out;
        }

        if size > remaining {
            size = remaining;
        }
        out.push((*level, size));
        remaining -= size;
    }

    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn percent_settings() -> Settings {
        // Defaults already use percent mode with TP values 2/3/4 and SL 5.
        Settings::default()
    }

    #[test]
    fn tp_prices_long_percent() {
        let prices = compute_tp_prices(100.0, &percent_settings(), PosSide::Long, None);
        assert!((prices[0] - 102.0).abs() < 1e-9);
        assert!((prices[1] - 103.0).abs() < 1e-9);
        assert!((prices[2] - 104.0).abs() < 1e-9);
    }

    #[test]
    fn tp_prices_short_percent() {
        let prices = compute_tp_prices(200.0, &percent_settings(), PosSide::Short, None);
        assert!((prices[0] - 196.0).abs() < 1e-9);
        assert!((prices[1] - 194.0).abs() < 1e-9);
        assert!((prices[2] - 192.0).abs() < 1e-9);
    }

    #[test]
    fn sl_price_both_sides() {
        let mut settings = percent_settings();
        settings.use_sl = true;
        assert!((compute_sl_price(100.0, &settings, PosSide::Long, None) - 95.0).abs() < 1e-9);
        assert!((compute_sl_price(100.0, &settings, PosSide::Short, None) - 105.0).abs() < 1e-9);
    }

    #[test]
    fn dca_replacement_prices_match_new_entry() {
        let settings = percent_settings();
        let prices = compute_tp_prices(99.0, &settings, PosSide::Long, None);
        assert!((prices[0] - 99.0 * 1.02).abs() < 1e-9);
        assert!((prices[1] - 99.0 * 1.03).abs() < 1e-9);
        assert!((prices[2] - 99.0 * 1.04).abs() < 1e-9);
        let mut sl_settings = settings;
        sl_settings.use_sl = true;
        assert!((compute_sl_price(99.0, &sl_settings, PosSide::Long, None) - 94.05).abs() < 1e-9);
    }

    #[test]
    fn amount_mode_offsets_absolute() {
        let mut settings = percent_settings();
        settings.tp_option = PriceMode::Amount;
        let prices = compute_tp_prices(100.0, &settings, PosSide::Long, None);
        assert!((prices[0] - 102.0).abs() < 1e-9); // +2.0 absolute
        assert!((prices[2] - 104.0).abs() < 1e-9);
    }

    #[test]
    fn atr_mode_uses_supplied_atr() {
        let mut settings = percent_settings();
        settings.tp_option = PriceMode::Atr;
        let prices = compute_tp_prices(100.0, &settings, PosSide::Long, Some(1.5));
        // tp1_value 2.0 * atr 1.5 = 3.0
        assert!((prices[0] - 103.0).abs() < 1e-9);
    }

    #[test]
    fn split_exact_thirds_last_gets_remainder() {
        let slices = split_tp_sizes(10.0, &[(1, 33.3), (2, 33.3), (3, 33.4)], 1.0);
        assert_eq!(slices, vec![(1, 3.0), (2, 3.0), (3, 4.0)]);
        let total: f64 = slices.iter().map(|(_, s)| s).sum();
        assert!((total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn split_default_ratios() {
        let slices = split_tp_sizes(10.0, &[(1, 30.0), (2, 30.0), (3, 40.0)], 1.0);
        assert_eq!(slices, vec![(1, 3.0), (2, 3.0), (3, 4.0)]);

        let slices = split_tp_sizes(20.0, &[(1, 30.0), (2, 30.0), (3, 40.0)], 1.0);
        assert_eq!(slices, vec![(1, 6.0), (2, 6.0), (3, 8.0)]);
    }

    #[test]
    fn split_dust_consumes_remainder_and_skips_rest() {
        // 30% of 2 contracts floors to 0: the first slice takes everything.
        let slices = split_tp_sizes(2.0, &[(1, 30.0), (2, 30.0), (3, 40.0)], 1.0);
        assert_eq!(slices, vec![(1, 2.0)]);
    }

    #[test]
    fn split_zero_total_is_empty() {
        assert!(split_tp_sizes(0.0, &[(1, 100.0)], 1.0).is_empty());
        assert!(split_tp_sizes(0.5, &[(1, 100.0)], 1.0).is_empty());
    }

    #[test]
    fn split_normalises_partial_ratios() {
        // Only TP1+TP2 enabled with 30/30 → normalised to 50/50.
        let slices = split_tp_sizes(10.0, &[(1, 30.0), (2, 30.0)], 1.0);
        assert_eq!(slices, vec![(1, 5.0), (2, 5.0)]);
    }

    #[test]
    fn split_fractional_lots() {
        let slices = split_tp_sizes(1.0, &[(1, 30.0), (2, 30.0), (3, 40.0)], 0.1);
        let total: f64 = slices.iter().map(|(_, s)| s).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((slices[0].1 - 0.3).abs() < 1e-9);
    }
}
