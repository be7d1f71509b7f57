// =============================================================================
// RSI + trend strategy — pure decision functions driven by user settings
// =============================================================================
//
// The cycle feeds in candles and the current position snapshot; the strategy
// answers with at most one action. All exchange interaction stays in the
// cycle; everything here is deterministic and synchronous.
// =============================================================================

use crate::indicators::ema::{self, Trend};
use crate::indicators::rsi;
use crate::okx::types::Candle;
use crate::position::Position;
use crate::settings::{EntryCriterion, EntryOption, PriceMode, PyramidingType, Settings};
use crate::types::PosSide;

/// What the cycle should do this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    /// Open the first entry on a side.
    Enter(PosSide),
    /// Add a pyramiding entry to the existing side.
    AddEntry(PosSide),
    /// Close the side because the higher-timeframe trend flipped against it.
    TrendClose(PosSide),
}

/// Does `(prev, curr)` RSI constitute an entry signal for `side`?
///
/// breakout  — the value crossed back out of the zone this bar;
/// exceed    — the value sits beyond the threshold;
/// reversal  — the value turned around while inside the zone;
/// reversal_breakout — either of the above two.
pub fn entry_signal(
    option: EntryOption,
    prev: f64,
    curr: f64,
    oversold: f64,
    overbought: f64,
    side: PosSide,
) -> bool {
    match side {
        PosSide::Long => match option {
            EntryOption::Breakout => prev <= oversold && curr > oversold,
            EntryOption::Exceed => curr <= oversold,
            EntryOption::Reversal => prev <= oversold && curr > prev,
            EntryOption::ReversalBreakout => {
                (prev <= oversold && curr > oversold) || (prev <= oversold && curr > prev)
            }
        },
        PosSide::Short => match option {
            EntryOption::Breakout => prev >= overbought && curr < overbought,
            EntryOption::Exceed => curr >= overbought,
            EntryOption::Reversal => prev >= overbought && curr < prev,
            EntryOption::ReversalBreakout => {
                (prev >= overbought && curr < overbought) || (prev >= overbought && curr < prev)
            }
        },
    }
}

/// Is the price far enough from the reference entry for another DCA?
pub fn dca_price_ok(
    settings: &Settings,
    position: &Position,
    current_price: f64,
    atr: Option<f64>,
) -> bool {
    if !settings.use_check_dca_with_price {
        return true;
    }
    let reference = match settings.entry_criterion {
        EntryCriterion::AveragePrice => position.entry_price,
        EntryCriterion::LastEntryPrice => {
            if position.last_entry_price > 0.0 {
                position.last_entry_price
            } else {
                position.entry_price
            }
        }
    };
    if reference <= 0.0 {
        return true;
    }

    let required = match settings.pyramiding_entry_type {
        PriceMode::Percent => reference * settings.pyramiding_value / 100.0,
        PriceMode::Amount => settings.pyramiding_value,
        PriceMode::Atr => atr.unwrap_or(0.0) * settings.pyramiding_value,
    };

    // A DCA adds at a worse price than the reference.
    match position.side {
        PosSide::Long => current_price <= reference - required,
        PosSide::Short => current_price >= reference + required,
    }
}

/// Full evaluation for one cycle pass.
pub fn evaluate(
    settings: &Settings,
    candles: &[Candle],
    trend_candles: &[Candle],
    position_long: Option<&Position>,
    position_short: Option<&Position>,
    current_price: f64,
    atr: Option<f64>,
) -> Decision {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let Some((prev, curr)) = rsi::last_two(&closes, settings.rsi_length as usize) else {
        return Decision::Hold;
    };

    let trend = if settings.use_trend_logic || settings.use_trend_close {
        let trend_closes: Vec<f64> = trend_candles.iter().map(|c| c.close).collect();
        ema::trend(&trend_closes, 9, 21)
    } else {
        None
    };

    // Trend close takes priority over any new entry.
    if settings.use_trend_close {
        if let Some(direction) = trend {
            if position_long.is_some() && direction == Trend::Down {
                return Decision::TrendClose(PosSide::Long);
            }
            if position_short.is_some() && direction == Trend::Up {
                return Decision::TrendClose(PosSide::Short);
            }
        }
    }

    for side in [PosSide::Long, PosSide::Short] {
        if !settings.direction.allows(side) {
            continue;
        }
        if settings.use_trend_logic {
            let aligned = match (trend, side) {
                (Some(Trend::Up), PosSide::Long) => true,
                (Some(Trend::Down), PosSide::Short) => true,
                (Some(_), _) => false,
                // No trend data: fail open rather than blocking all entries.
                (None, _) => true,
            };
            if !aligned {
                continue;
            }
        }
        if !entry_signal(
            settings.entry_option,
            prev,
            curr,
            settings.rsi_oversold,
            settings.rsi_overbought,
            side,
        ) {
            continue;
        }

        let existing = match side {
            PosSide::Long => position_long,
            PosSide::Short => position_short,
        };
        match existing {
            None => return Decision::Enter(side),
            Some(position) => {
                if settings.pyramiding_type != PyramidingType::AddToPosition {
                    continue;
                }
                if position.dca_count >= settings.pyramiding_limit {
                    continue;
                }
                if !dca_price_ok(settings, position, current_price, atr) {
                    continue;
                }
                return Decision::AddEntry(side);
            }
        }
    }

    Decision::Hold
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Direction;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .map(|&c| Candle {
                ts_ms: 0,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 10.0,
            })
            .collect()
    }

    fn long_position(entry: f64, dca_count: u32) -> Position {
        Position {
            uid: "u1".into(),
            symbol: "BTC-USDT-SWAP".into(),
            side: PosSide::Long,
            entry_price: entry,
            contracts_amount: 10.0,
            position_qty: 10.0,
            leverage: 10.0,
            last_entry_price: entry,
            sl_price: None,
            sl_order_id: None,
            sl_contracts_amount: 0.0,
            tp_prices: vec![],
            tp_order_ids: vec![],
            tp_contracts_amounts: vec![],
            tp_data: vec![],
            get_tp1: false,
            get_tp2: false,
            get_tp3: false,
            trailing_stop_active: false,
            is_hedge: false,
            dca_count,
            tp_state: 0,
            main_direction: PosSide::Long,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn breakout_crosses_out_of_zone() {
        assert!(entry_signal(EntryOption::Breakout, 28.0, 33.0, 30.0, 70.0, PosSide::Long));
        assert!(!entry_signal(EntryOption::Breakout, 28.0, 29.0, 30.0, 70.0, PosSide::Long));
        assert!(!entry_signal(EntryOption::Breakout, 35.0, 40.0, 30.0, 70.0, PosSide::Long));
        assert!(entry_signal(EntryOption::Breakout, 75.0, 65.0, 30.0, 70.0, PosSide::Short));
        assert!(!entry_signal(EntryOption::Breakout, 75.0, 72.0, 30.0, 70.0, PosSide::Short));
    }

    #[test]
    fn exceed_sits_beyond_threshold() {
        assert!(entry_signal(EntryOption::Exceed, 50.0, 25.0, 30.0, 70.0, PosSide::Long));
        assert!(!entry_signal(EntryOption::Exceed, 50.0, 35.0, 30.0, 70.0, PosSide::Long));
        assert!(entry_signal(EntryOption::Exceed, 50.0, 75.0, 30.0, 70.0, PosSide::Short));
    }

    #[test]
    fn reversal_turns_inside_zone() {
        assert!(entry_signal(EntryOption::Reversal, 22.0, 26.0, 30.0, 70.0, PosSide::Long));
        assert!(!entry_signal(EntryOption::Reversal, 26.0, 22.0, 30.0, 70.0, PosSide::Long));
        assert!(entry_signal(EntryOption::Reversal, 80.0, 74.0, 30.0, 70.0, PosSide::Short));
    }

    #[test]
    fn dca_distance_percent_mode() {
        let mut settings = Settings::default();
        settings.pyramiding_value = 3.0; // percent
        let position = long_position(100.0, 1);
        // 3 % below entry: allowed.
        assert!(dca_price_ok(&settings, &position, 97.0, None));
        // Only 1 % below: not yet.
        assert!(!dca_price_ok(&settings, &position, 99.0, None));
        // Check disabled: always allowed.
        settings.use_check_dca_with_price = false;
        assert!(dca_price_ok(&settings, &position, 99.9, None));
    }

    #[test]
    fn dca_distance_short_side() {
        let mut settings = Settings::default();
        settings.pyramiding_value = 3.0;
        let mut position = long_position(100.0, 1);
        position.side = PosSide::Short;
        assert!(dca_price_ok(&settings, &position, 103.0, None));
        assert!(!dca_price_ok(&settings, &position, 101.0, None));
    }

    #[test]
    fn evaluate_enters_long_on_oversold_exceed() {
        let mut settings = Settings::default();
        settings.entry_option = EntryOption::Exceed;
        settings.use_trend_logic = false;
        settings.use_trend_close = false;
        // Strictly falling closes force RSI to 0.
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64 + 100.0).collect();
        let candles = candles_from(&closes);
        let decision = evaluate(&settings, &candles, &[], None, None, 100.0, None);
        assert_eq!(decision, Decision::Enter(PosSide::Long));
    }

    #[test]
    fn evaluate_holds_without_enough_candles() {
        let settings = Settings::default();
        let candles = candles_from(&[100.0, 101.0]);
        assert_eq!(
            evaluate(&settings, &candles, &[], None, None, 100.0, None),
            Decision::Hold
        );
    }

    #[test]
    fn evaluate_respects_direction_filter() {
        let mut settings = Settings::default();
        settings.entry_option = EntryOption::Exceed;
        settings.use_trend_logic = false;
        settings.use_trend_close = false;
        settings.direction = Direction::Short;
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64 + 100.0).collect();
        let candles = candles_from(&closes);
        // Long signal, but only shorts allowed.
        let decision = evaluate(&settings, &candles, &[], None, None, 100.0, None);
        assert_eq!(decision, Decision::Hold);
    }

    #[test]
    fn evaluate_adds_entry_within_pyramiding_limit() {
        let mut settings = Settings::default();
        settings.entry_option = EntryOption::Exceed;
        settings.use_trend_logic = false;
        settings.use_trend_close = false;
        settings.pyramiding_type = PyramidingType::AddToPosition;
        settings.use_check_dca_with_price = false;
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64 + 100.0).collect();
        let candles = candles_from(&closes);

        let position = long_position(150.0, 2);
        let decision = evaluate(
            &settings,
            &candles,
            &[],
            Some(&position),
            None,
            100.0,
            None,
        );
        assert_eq!(decision, Decision::AddEntry(PosSide::Long));

        // At the limit: hold.
        let maxed = long_position(150.0, settings.pyramiding_limit);
        let decision = evaluate(&settings, &candles, &[], Some(&maxed), None, 100.0, None);
        assert_eq!(decision, Decision::Hold);
    }

    #[test]
    fn evaluate_initial_only_never_adds() {
        let mut settings = Settings::default();
        settings.entry_option = EntryOption::Exceed;
        settings.use_trend_logic = false;
        settings.use_trend_close = false;
        settings.pyramiding_type = PyramidingType::InitialOnly;
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64 + 100.0).collect();
        let candles = candles_from(&closes);
        let position = long_position(150.0, 1);
        let decision = evaluate(&settings, &candles, &[], Some(&position), None, 100.0, None);
        assert_eq!(decision, Decision::Hold);
    }

    #[test]
    fn evaluate_trend_close_overrides_entries() {
        let mut settings = Settings::default();
        settings.entry_option = EntryOption::Exceed;
        settings.use_trend_logic = false;
        settings.use_trend_close = true;
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64 + 100.0).collect();
        let candles = candles_from(&closes);
        // Falling higher-timeframe closes: downtrend against the long.
        let trend_closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let trend_candles = candles_from(&trend_closes);

        let position = long_position(150.0, 1);
        let decision = evaluate(
            &settings,
            &candles,
            &trend_candles,
            Some(&position),
            None,
            100.0,
            None,
        );
        assert_eq!(decision, Decision::TrendClose(PosSide::Long));
    }
}
