// =============================================================================
// Shared types used across the Helios trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Side of a perpetual-swap position in hedge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    /// The opposite side (used when placing reduce-only exit orders).
    pub fn flip(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Exchange order side that *opens* this position side.
    pub fn open_side(self) -> &'static str {
        match self {
            Self::Long => "buy",
            Self::Short => "sell",
        }
    }

    /// Exchange order side that *closes* (reduces) this position side.
    pub fn close_side(self) -> &'static str {
        match self {
            Self::Long => "sell",
            Self::Short => "buy",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PosSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-(user, symbol) trading lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingStatus {
    Stopped,
    Running,
    Restarting,
    Error,
}

impl Default for TradingStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl TradingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "running" => Some(Self::Running),
            "restarting" => Some(Self::Restarting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of an order in the TP/SL graph. Stored as the monitored row's
/// `order_name` so that the monitor can disambiguate limit orders used as
/// take-profits from plain entry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Tp1,
    Tp2,
    Tp3,
    Sl,
    BreakEven,
    Limit,
    Market,
}

impl OrderKind {
    /// TP level (1..=3) if this is a take-profit order.
    pub fn tp_level(self) -> Option<u8> {
        match self {
            Self::Tp1 => Some(1),
            Self::Tp2 => Some(2),
            Self::Tp3 => Some(3),
            _ => None,
        }
    }

    pub fn tp(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Tp1),
            2 => Some(Self::Tp2),
            3 => Some(Self::Tp3),
            _ => None,
        }
    }

    /// Whether the exchange tracks this order through the algo-order API
    /// (trigger orders) rather than the regular order book.
    pub fn is_algo(self) -> bool {
        matches!(self, Self::Sl | Self::BreakEven)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tp1 => "tp1",
            Self::Tp2 => "tp2",
            Self::Tp3 => "tp3",
            Self::Sl => "sl",
            Self::BreakEven => "break_even",
            Self::Limit => "limit",
            Self::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tp1" => Some(Self::Tp1),
            "tp2" => Some(Self::Tp2),
            "tp3" => Some(Self::Tp3),
            "sl" => Some(Self::Sl),
            "break_even" => Some(Self::BreakEven),
            "limit" => Some(Self::Limit),
            "market" => Some(Self::Market),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a monitored order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Filled,
    Canceled,
    Failed,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" | "live" | "partially_filled" => Some(Self::Open),
            "filled" | "effective" => Some(Self::Filled),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "failed" | "order_failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category attached to every user-visible notification and journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Entry,
    Exit,
    Tp,
    Sl,
    Start,
    Stop,
    Error,
    Info,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Tp => "tp",
            Self::Sl => "sl",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_side_flip_and_order_sides() {
        assert_eq!(PosSide::Long.flip(), PosSide::Short);
        assert_eq!(PosSide::Long.open_side(), "buy");
        assert_eq!(PosSide::Long.close_side(), "sell");
        assert_eq!(PosSide::Short.open_side(), "sell");
        assert_eq!(PosSide::Short.close_side(), "buy");
    }

    #[test]
    fn order_kind_tp_levels() {
        assert_eq!(OrderKind::Tp2.tp_level(), Some(2));
        assert_eq!(OrderKind::Sl.tp_level(), None);
        assert_eq!(OrderKind::tp(3), Some(OrderKind::Tp3));
        assert_eq!(OrderKind::tp(4), None);
    }

    #[test]
    fn algo_orders_are_sl_variants() {
        assert!(OrderKind::Sl.is_algo());
        assert!(OrderKind::BreakEven.is_algo());
        assert!(!OrderKind::Tp1.is_algo());
        assert!(!OrderKind::Market.is_algo());
    }

    #[test]
    fn order_state_parse_accepts_exchange_aliases() {
        assert_eq!(OrderState::parse("live"), Some(OrderState::Open));
        assert_eq!(OrderState::parse("effective"), Some(OrderState::Filled));
        assert_eq!(OrderState::parse("cancelled"), Some(OrderState::Canceled));
        assert_eq!(OrderState::parse("bogus"), None);
    }

    #[test]
    fn trading_status_roundtrip() {
        for s in [
            TradingStatus::Stopped,
            TradingStatus::Running,
            TradingStatus::Restarting,
            TradingStatus::Error,
        ] {
            assert_eq!(TradingStatus::parse(s.as_str()), Some(s));
        }
    }
}
