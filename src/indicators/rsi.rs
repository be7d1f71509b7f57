// =============================================================================
// Relative Strength Index — Wilder's smoothing, user-configurable thresholds
// =============================================================================
//
// RS  = avg_gain / avg_loss (both Wilder-smoothed over `period`)
// RSI = 100 - 100 / (1 + RS)
//
// The overbought/oversold thresholds come from user settings, not constants:
// the strategy evaluates breakout/reversal conditions against them.
// =============================================================================

/// Zone classification of one RSI value against the user's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsiZone {
    Oversold,
    Neutral,
    Overbought,
}

/// Compute the full RSI series for `closes`. One value per close starting at
/// index `period`; the first `period` closes seed the averages.
///
/// Returns an empty vec when `period` is zero or there are fewer than
/// `period + 1` closes. A non-finite intermediate truncates the series.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let Some(first) = rsi_value(avg_gain, avg_loss) else {
        return Vec::new();
    };
    let mut series = Vec::with_capacity(deltas.len() - period + 1);
    series.push(first);

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        match rsi_value(avg_gain, avg_loss) {
            Some(rsi) => series.push(rsi),
            None => break,
        }
    }
    series
}

/// The last two RSI values — the strategy's breakout and reversal triggers
/// both need the previous bar.
pub fn last_two(closes: &[f64], period: usize) -> Option<(f64, f64)> {
    let series = rsi_series(closes, period);
    if series.len() < 2 {
        return None;
    }
    Some((series[series.len() - 2], series[series.len() - 1]))
}

/// Classify a value against the user's oversold/overbought thresholds.
pub fn zone(value: f64, oversold: f64, overbought: f64) -> RsiZone {
    if value <= oversold {
        RsiZone::Oversold
    } else if value >= overbought {
        RsiZone::Overbought
    } else {
        RsiZone::Neutral
    }
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_degenerate_inputs() {
        assert!(rsi_series(&[], 14).is_empty());
        assert!(rsi_series(&[1.0, 2.0, 3.0], 0).is_empty());
        // period deltas require period + 1 closes.
        let fourteen: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi_series(&fourteen, 14).is_empty());
    }

    #[test]
    fn monotone_series_saturate() {
        let up: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in rsi_series(&up, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }
        let down: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in rsi_series(&down, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn flat_market_is_neutral_50() {
        let flat = vec![100.0; 30];
        for v in rsi_series(&flat, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn values_stay_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89,
            46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in rsi_series(&closes, 14) {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn last_two_returns_consecutive_values() {
        let closes: Vec<f64> = (1..=40).map(|x| (x as f64 * 0.7).sin() * 5.0 + 100.0).collect();
        let (prev, curr) = last_two(&closes, 14).unwrap();
        let series = rsi_series(&closes, 14);
        assert!((prev - series[series.len() - 2]).abs() < 1e-12);
        assert!((curr - series[series.len() - 1]).abs() < 1e-12);
    }

    #[test]
    fn zone_uses_user_thresholds() {
        assert_eq!(zone(25.0, 30.0, 70.0), RsiZone::Oversold);
        assert_eq!(zone(50.0, 30.0, 70.0), RsiZone::Neutral);
        assert_eq!(zone(75.0, 30.0, 70.0), RsiZone::Overbought);
        // Tightened thresholds change the classification.
        assert_eq!(zone(45.0, 48.0, 52.0), RsiZone::Oversold);
    }
}
