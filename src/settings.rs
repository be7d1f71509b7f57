// =============================================================================
// Per-user strategy settings — serde-defaulted, validated against a
// declarative constraint table
// =============================================================================
//
// Every field carries `#[serde(default)]` so older stored payloads keep
// loading as fields are added. Updates strictly replace the prior value; the
// repository layer caches reads for 30 s.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::store::cache::CacheClass;
use crate::store::{keys, Store};
use crate::types::PosSide;

// =============================================================================
// Closed option sets
// =============================================================================

/// Which sides the strategy is allowed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Both,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Both
    }
}

impl Direction {
    pub fn allows(self, side: PosSide) -> bool {
        match self {
            Self::Both => true,
            Self::Long => side == PosSide::Long,
            Self::Short => side == PosSide::Short,
        }
    }
}

/// RSI entry trigger style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOption {
    Breakout,
    Reversal,
    ReversalBreakout,
    Exceed,
}

impl Default for EntryOption {
    fn default() -> Self {
        Self::Breakout
    }
}

/// How a TP/SL/pyramiding distance value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    Amount,
    Percent,
    Atr,
}

impl Default for PriceMode {
    fn default() -> Self {
        Self::Percent
    }
}

/// Reference price used when checking DCA entry distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCriterion {
    AveragePrice,
    LastEntryPrice,
}

impl Default for EntryCriterion {
    fn default() -> Self {
        Self::AveragePrice
    }
}

/// What pyramiding (DCA) is allowed to do after the initial entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidingType {
    InitialOnly,
    AddToPosition,
    OppositeEntry,
}

impl Default for PyramidingType {
    fn default() -> Self {
        Self::InitialOnly
    }
}

/// TP level that arms the trailing stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingStartPoint {
    Tp1,
    Tp2,
    Tp3,
}

impl Default for TrailingStartPoint {
    fn default() -> Self {
        Self::Tp3
    }
}

impl TrailingStartPoint {
    pub fn level(self) -> u8 {
        match self {
            Self::Tp1 => 1,
            Self::Tp2 => 2,
            Self::Tp3 => 3,
        }
    }
}

/// How the trailing offset is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingOffsetMode {
    FixedPercent,
    Tp2Tp3Gap,
}

impl Default for TrailingOffsetMode {
    fn default() -> Self {
        Self::FixedPercent
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_investment() -> f64 {
    20.0
}

fn default_entry_amount_option() -> String {
    "usdt".to_string()
}

fn default_leverage() -> u32 {
    10
}

fn default_entry_multiplier() -> f64 {
    1.0
}

fn default_cooldown_time() -> u64 {
    300
}

fn default_trend_timeframe() -> String {
    "1H".to_string()
}

fn default_rsi_length() -> u32 {
    14
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_tp1_ratio() -> f64 {
    30.0
}

fn default_tp2_ratio() -> f64 {
    30.0
}

fn default_tp3_ratio() -> f64 {
    40.0
}

fn default_tp1_value() -> f64 {
    2.0
}

fn default_tp2_value() -> f64 {
    3.0
}

fn default_tp3_value() -> f64 {
    4.0
}

fn default_sl_value() -> f64 {
    5.0
}

fn default_pyramiding_limit() -> u32 {
    4
}

fn default_pyramiding_value() -> f64 {
    3.0
}

fn default_trailing_offset_value() -> f64 {
    0.5
}

// =============================================================================
// Settings
// =============================================================================

/// Full per-user strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Investment sizing --------------------------------------------------
    #[serde(default = "default_investment")]
    pub btc_investment: f64,
    #[serde(default = "default_investment")]
    pub eth_investment: f64,
    #[serde(default = "default_investment")]
    pub sol_investment: f64,
    /// Unit of the investment values ("usdt" or "contracts").
    #[serde(default = "default_entry_amount_option")]
    pub entry_amount_option: String,
    /// Per-symbol investment overrides.
    #[serde(default)]
    pub symbol_investments: HashMap<String, f64>,

    // --- Leverage & direction ----------------------------------------------
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_entry_multiplier")]
    pub entry_multiplier: f64,

    // --- Cooldown & trend ---------------------------------------------------
    #[serde(default = "default_true")]
    pub use_cooldown: bool,
    #[serde(default = "default_cooldown_time")]
    pub cooldown_time: u64,
    #[serde(default = "default_true")]
    pub use_trend_logic: bool,
    #[serde(default = "default_trend_timeframe")]
    pub trend_timeframe: String,
    #[serde(default = "default_true")]
    pub use_trend_close: bool,

    // --- RSI ----------------------------------------------------------------
    #[serde(default = "default_rsi_length")]
    pub rsi_length: u32,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default)]
    pub entry_option: EntryOption,

    // --- Take profit --------------------------------------------------------
    #[serde(default)]
    pub tp_option: PriceMode,
    #[serde(default = "default_tp1_ratio")]
    pub tp1_ratio: f64,
    #[serde(default = "default_tp2_ratio")]
    pub tp2_ratio: f64,
    #[serde(default = "default_tp3_ratio")]
    pub tp3_ratio: f64,
    #[serde(default = "default_tp1_value")]
    pub tp1_value: f64,
    #[serde(default = "default_tp2_value")]
    pub tp2_value: f64,
    #[serde(default = "default_tp3_value")]
    pub tp3_value: f64,
    #[serde(default = "default_true")]
    pub use_tp1: bool,
    #[serde(default = "default_true")]
    pub use_tp2: bool,
    #[serde(default = "default_true")]
    pub use_tp3: bool,

    // --- Stop loss ----------------------------------------------------------
    #[serde(default)]
    pub use_sl: bool,
    /// Place the SL only once the final DCA entry is in.
    #[serde(default)]
    pub use_sl_on_last: bool,
    #[serde(default)]
    pub sl_option: PriceMode,
    #[serde(default = "default_sl_value")]
    pub sl_value: f64,

    // --- Break-even ---------------------------------------------------------
    #[serde(default = "default_true")]
    pub use_break_even: bool,
    #[serde(default = "default_true")]
    pub use_break_even_tp2: bool,
    #[serde(default = "default_true")]
    pub use_break_even_tp3: bool,

    // --- Pyramiding (DCA) ---------------------------------------------------
    #[serde(default = "default_true")]
    pub use_check_dca_with_price: bool,
    #[serde(default = "default_true")]
    pub use_rsi_with_pyramiding: bool,
    #[serde(default)]
    pub entry_criterion: EntryCriterion,
    #[serde(default)]
    pub pyramiding_type: PyramidingType,
    #[serde(default = "default_pyramiding_limit")]
    pub pyramiding_limit: u32,
    #[serde(default)]
    pub pyramiding_entry_type: PriceMode,
    #[serde(default = "default_pyramiding_value")]
    pub pyramiding_value: f64,

    // --- Trailing stop ------------------------------------------------------
    #[serde(default = "default_true")]
    pub trailing_stop_active: bool,
    #[serde(default)]
    pub trailing_start_point: TrailingStartPoint,
    #[serde(default)]
    pub trailing_stop_type: TrailingOffsetMode,
    #[serde(default)]
    pub use_trailing_stop_value_with_tp2_tp3_difference: bool,
    #[serde(default = "default_trailing_offset_value")]
    pub trailing_stop_offset_value: f64,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings deserialize via defaults")
    }
}

impl Settings {
    /// TP percentage/amount/ATR distance for a level.
    pub fn tp_value(&self, level: u8) -> f64 {
        match level {
            1 => self.tp1_value,
            2 => self.tp2_value,
            _ => self.tp3_value,
        }
    }

    pub fn tp_ratio(&self, level: u8) -> f64 {
        match level {
            1 => self.tp1_ratio,
            2 => self.tp2_ratio,
            _ => self.tp3_ratio,
        }
    }

    pub fn tp_enabled(&self, level: u8) -> bool {
        match level {
            1 => self.use_tp1,
            2 => self.use_tp2,
            _ => self.use_tp3,
        }
    }

    /// Break-even toggle for the TP level that just filled.
    pub fn break_even_enabled(&self, filled_level: u8) -> bool {
        match filled_level {
            1 => self.use_break_even,
            2 => self.use_break_even_tp2,
            _ => self.use_break_even_tp3,
        }
    }

    /// The trailing offset mode, honouring the legacy boolean override.
    pub fn trailing_offset_mode(&self) -> TrailingOffsetMode {
        if self.use_trailing_stop_value_with_tp2_tp3_difference {
            TrailingOffsetMode::Tp2Tp3Gap
        } else {
            self.trailing_stop_type
        }
    }

    /// Investment amount for a symbol, honouring per-symbol overrides.
    pub fn investment_for(&self, symbol: &str) -> f64 {
        if let Some(v) = self.symbol_investments.get(symbol) {
            return *v;
        }
        let base = symbol.split('-').next().unwrap_or_default();
        match base {
            "BTC" => self.btc_investment,
            "ETH" => self.eth_investment,
            "SOL" => self.sol_investment,
            _ => self.btc_investment,
        }
    }

    /// Validate against the constraint table plus the TP-ratio sum rule.
    pub fn validate(&self) -> EngineResult<()> {
        const CONSTRAINTS: &[(&str, f64, f64)] = &[
            ("btc_investment", 1.0, 1_000_000.0),
            ("eth_investment", 1.0, 1_000_000.0),
            ("sol_investment", 1.0, 1_000_000.0),
            ("leverage", 1.0, 125.0),
            ("pyramiding_limit", 1.0, 10.0),
            ("entry_multiplier", 0.1, 5.0),
            ("rsi_length", 1.0, 100.0),
            ("rsi_oversold", 0.0, 100.0),
            ("rsi_overbought", 0.0, 100.0),
            ("tp1_ratio", 0.0, 100.0),
            ("tp2_ratio", 0.0, 100.0),
            ("tp3_ratio", 0.0, 100.0),
            ("sl_value", 0.1, 100.0),
            ("cooldown_time", 0.0, 3000.0),
        ];

        let values: &[(&str, f64)] = &[
            ("btc_investment", self.btc_investment),
            ("eth_investment", self.eth_investment),
            ("sol_investment", self.sol_investment),
            ("leverage", self.leverage as f64),
            ("pyramiding_limit", self.pyramiding_limit as f64),
            ("entry_multiplier", self.entry_multiplier),
            ("rsi_length", self.rsi_length as f64),
            ("rsi_oversold", self.rsi_oversold),
            ("rsi_overbought", self.rsi_overbought),
            ("tp1_ratio", self.tp1_ratio),
            ("tp2_ratio", self.tp2_ratio),
            ("tp3_ratio", self.tp3_ratio),
            ("sl_value", self.sl_value),
            ("cooldown_time", self.cooldown_time as f64),
        ];

        for (name, value) in values {
            let Some((_, min, max)) = CONSTRAINTS.iter().find(|(n, _, _)| n == name) else {
                continue;
            };
            if value < min || value > max {
                return Err(EngineError::Validation(format!(
                    "{name}={value} outside [{min}, {max}]"
                )));
            }
        }

        if !matches!(self.entry_amount_option.as_str(), "usdt" | "contracts") {
            return Err(EngineError::Validation(format!(
                "entry_amount_option '{}' not in {{usdt, contracts}}",
                self.entry_amount_option
            )));
        }

        let ratio_sum: f64 = [1u8, 2, 3]
            .iter()
            .filter(|l| self.tp_enabled(**l))
            .map(|l| self.tp_ratio(*l))
            .sum();
        if (self.use_tp1 || self.use_tp2 || self.use_tp3)
            && (ratio_sum - 100.0).abs() > 0.01
        {
            return Err(EngineError::Validation(format!(
                "enabled TP ratios sum to {ratio_sum}, expected 100"
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Dual-side (hedge) settings
// =============================================================================

fn default_dual_trigger() -> u32 {
    3
}

fn default_dual_ratio_type() -> String {
    "percent_of_position".to_string()
}

fn default_dual_ratio_value() -> f64 {
    30.0
}

fn default_dual_tp_trigger_type() -> String {
    "last_dca_on_position".to_string()
}

fn default_dual_tp_value() -> f64 {
    0.3
}

fn default_dual_sl_trigger_type() -> String {
    "percent".to_string()
}

fn default_dual_sl_value() -> f64 {
    5.0
}

fn default_dual_pyramiding_limit() -> u32 {
    1
}

/// Configuration for the opposite-side hedge entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualSideSettings {
    #[serde(default)]
    pub use_dual_side_entry: bool,
    /// DCA count that arms the hedge entry.
    #[serde(default = "default_dual_trigger")]
    pub dual_side_entry_trigger: u32,
    #[serde(default = "default_dual_ratio_type")]
    pub dual_side_entry_ratio_type: String,
    #[serde(default = "default_dual_ratio_value")]
    pub dual_side_entry_ratio_value: f64,
    #[serde(default = "default_dual_tp_trigger_type")]
    pub dual_side_entry_tp_trigger_type: String,
    #[serde(default = "default_dual_tp_value")]
    pub dual_side_entry_tp_value: f64,
    #[serde(default = "default_dual_sl_trigger_type")]
    pub dual_side_entry_sl_trigger_type: String,
    #[serde(default = "default_dual_sl_value")]
    pub dual_side_entry_sl_value: f64,
    #[serde(default = "default_dual_pyramiding_limit")]
    pub dual_side_pyramiding_limit: u32,
    #[serde(default)]
    pub activate_tp_sl_after_all_dca: bool,
    #[serde(default)]
    pub dual_side_trend_close: bool,
}

impl Default for DualSideSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty dual-side settings deserialize via defaults")
    }
}

impl DualSideSettings {
    /// Dual-side SL is placed only when its value is meaningful.
    pub fn sl_enabled(&self) -> bool {
        self.use_dual_side_entry && self.dual_side_entry_sl_value > 0.0
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Store-backed settings access with the 30 s read cache. Default settings
/// are materialised on first access.
#[derive(Clone)]
pub struct SettingsRepo {
    store: Store,
}

impl SettingsRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, uid: &str) -> EngineResult<Settings> {
        let key = keys::settings(uid);
        match self
            .store
            .get_cached(&key, CacheClass::Settings, true)
            .await?
        {
            Some(raw) => Ok(serde_json::from_str(&raw)
                .map_err(|e| EngineError::Store(format!("corrupt settings for {uid}: {e}")))?),
            None => {
                let defaults = Settings::default();
                self.put(uid, &defaults).await?;
                Ok(defaults)
            }
        }
    }

    /// Strict replacement of the whole settings payload.
    pub async fn put(&self, uid: &str, settings: &Settings) -> EngineResult<()> {
        settings.validate()?;
        let raw = serde_json::to_string(settings)?;
        self.store.set(&keys::settings(uid), &raw).await
    }

    pub async fn reset(&self, uid: &str) -> EngineResult<Settings> {
        let defaults = Settings::default();
        self.put(uid, &defaults).await?;
        Ok(defaults)
    }

    pub async fn get_dual_side(&self, uid: &str) -> EngineResult<DualSideSettings> {
        let map = self.store.hgetall(&keys::dual_side(uid)).await?;
        if map.is_empty() {
            let defaults = DualSideSettings::default();
            self.put_dual_side(uid, &defaults).await?;
            return Ok(defaults);
        }
        let value = serde_json::to_value(
            map.into_iter()
                .map(|(k, v)| {
                    let parsed: serde_json::Value =
                        serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
                    (k, parsed)
                })
                .collect::<serde_json::Map<_, _>>(),
        )?;
        Ok(serde_json::from_value(value)
            .map_err(|e| EngineError::Store(format!("corrupt dual-side settings: {e}")))?)
    }

    pub async fn put_dual_side(&self, uid: &str, settings: &DualSideSettings) -> EngineResult<()> {
        let value = serde_json::to_value(settings)?;
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::Store("dual-side settings not an object".into()))?;
        let fields: Vec<(String, String)> = obj
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        self.store
            .hset_multiple(&keys::dual_side(uid), &fields)
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_configuration() {
        let s = Settings::default();
        assert_eq!(s.leverage, 10);
        assert_eq!(s.direction, Direction::Both);
        assert_eq!(s.rsi_length, 14);
        assert!((s.tp1_ratio - 30.0).abs() < f64::EPSILON);
        assert!((s.tp3_ratio - 40.0).abs() < f64::EPSILON);
        assert!((s.tp1_value - 2.0).abs() < f64::EPSILON);
        assert!(!s.use_sl);
        assert!((s.sl_value - 5.0).abs() < f64::EPSILON);
        assert_eq!(s.pyramiding_limit, 4);
        assert!(s.trailing_stop_active);
        assert_eq!(s.trailing_start_point, TrailingStartPoint::Tp3);
        assert!((s.trailing_stop_offset_value - 0.5).abs() < f64::EPSILON);
        assert_eq!(s.cooldown_time, 300);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{ "leverage": 25, "direction": "short" }"#).unwrap();
        assert_eq!(s.leverage, 25);
        assert_eq!(s.direction, Direction::Short);
        assert_eq!(s.rsi_length, 14);
        assert!(s.use_tp3);
    }

    #[test]
    fn unknown_enum_token_is_rejected() {
        let result: Result<Settings, _> =
            serde_json::from_str(r#"{ "entry_option": "sideways" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn constraint_table_bounds() {
        let mut s = Settings::default();
        s.leverage = 126;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.pyramiding_limit = 11;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sl_value = 0.05;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.cooldown_time = 3001;
        assert!(s.validate().is_err());
    }

    #[test]
    fn tp_ratio_sum_must_be_100() {
        let mut s = Settings::default();
        s.tp1_ratio = 50.0;
        assert!(s.validate().is_err());

        // Disabling TP3 with re-balanced ratios is fine.
        let mut s = Settings::default();
        s.use_tp3 = false;
        s.tp1_ratio = 50.0;
        s.tp2_ratio = 50.0;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn direction_filter() {
        assert!(Direction::Both.allows(PosSide::Long));
        assert!(Direction::Long.allows(PosSide::Long));
        assert!(!Direction::Long.allows(PosSide::Short));
        assert!(Direction::Short.allows(PosSide::Short));
    }

    #[test]
    fn trailing_offset_mode_legacy_override() {
        let mut s = Settings::default();
        assert_eq!(s.trailing_offset_mode(), TrailingOffsetMode::FixedPercent);
        s.use_trailing_stop_value_with_tp2_tp3_difference = true;
        assert_eq!(s.trailing_offset_mode(), TrailingOffsetMode::Tp2Tp3Gap);
    }

    #[test]
    fn investment_per_symbol_override() {
        let mut s = Settings::default();
        s.symbol_investments
            .insert("ETH-USDT-SWAP".to_string(), 55.0);
        assert!((s.investment_for("ETH-USDT-SWAP") - 55.0).abs() < f64::EPSILON);
        assert!((s.investment_for("BTC-USDT-SWAP") - 20.0).abs() < f64::EPSILON);
        assert!((s.investment_for("SOL-USDT-SWAP") - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn break_even_flags_per_level() {
        let s = Settings::default();
        assert!(s.break_even_enabled(1));
        assert!(s.break_even_enabled(2));
        assert!(s.break_even_enabled(3));
    }

    #[test]
    fn dual_side_defaults() {
        let d = DualSideSettings::default();
        assert!(!d.use_dual_side_entry);
        assert_eq!(d.dual_side_entry_trigger, 3);
        assert!((d.dual_side_entry_ratio_value - 30.0).abs() < f64::EPSILON);
        assert_eq!(d.dual_side_pyramiding_limit, 1);
        assert!(!d.sl_enabled());
    }
}
