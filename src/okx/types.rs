// =============================================================================
// OKX wire types — request builders and coerced response rows
// =============================================================================
//
// OKX returns every numeric field as a string; the parse helpers below coerce
// them once at the gateway seam so the rest of the engine works with f64.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::PosSide;

// -----------------------------------------------------------------------------
// Exchange error codes the retry ladder branches on
// -----------------------------------------------------------------------------

/// Rate limit exceeded.
pub const CODE_RATE_LIMIT: &str = "50011";
/// "Either algoId or state is required" — terminal, never retried.
pub const CODE_ALGO_ID_OR_STATE: &str = "50015";
/// Order does not exist.
pub const CODE_ORDER_NOT_FOUND: &str = "51603";
/// Cancellation rejected because the order is already in a final state.
pub const CODE_CANCEL_FINAL_STATE: &str = "51400";

/// Authentication-class codes (invalid key, signature, timestamp, passphrase).
pub const AUTH_CODES: &[&str] = &[
    "50100", "50101", "50102", "50103", "50104", "50105", "50111", "50113", "50114",
];

// -----------------------------------------------------------------------------
// Envelope
// -----------------------------------------------------------------------------

/// Standard OKX REST response envelope.
#[derive(Debug, Deserialize)]
pub struct OkxEnvelope {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// Closed set of order shapes the gateway places. The `Trigger` variant is
/// the algorithmic (conditional) order OKX tracks through the algo API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderShape {
    Market,
    Limit,
    Trigger,
}

impl OrderShape {
    pub fn ord_type(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::Trigger => "trigger",
        }
    }
}

/// Parameters for a single order placement.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    /// "buy" or "sell".
    pub side: String,
    pub pos_side: PosSide,
    pub shape: OrderShape,
    /// Size in exchange contract units.
    pub contracts: f64,
    /// Limit price; required for `Limit`.
    pub price: Option<f64>,
    /// Trigger price; required for `Trigger`.
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Reduce-only limit order on the closing side — the shape of every TP.
    pub fn take_profit(symbol: &str, pos_side: PosSide, price: f64, contracts: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: pos_side.close_side().to_string(),
            pos_side,
            shape: OrderShape::Limit,
            contracts,
            price: Some(price),
            trigger_price: None,
            reduce_only: true,
            client_order_id: None,
        }
    }

    /// Trigger (conditional) order on the closing side — the shape of every SL.
    pub fn stop_loss(symbol: &str, pos_side: PosSide, trigger: f64, contracts: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: pos_side.close_side().to_string(),
            pos_side,
            shape: OrderShape::Trigger,
            contracts,
            price: None,
            trigger_price: Some(trigger),
            reduce_only: true,
            client_order_id: None,
        }
    }

    /// Reduce-only market order closing out the side.
    pub fn market_close(symbol: &str, pos_side: PosSide, contracts: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: pos_side.close_side().to_string(),
            pos_side,
            shape: OrderShape::Market,
            contracts,
            price: None,
            trigger_price: None,
            reduce_only: true,
            client_order_id: None,
        }
    }

    /// Market order opening (or adding to) the side.
    pub fn market_open(symbol: &str, pos_side: PosSide, contracts: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: pos_side.open_side().to_string(),
            pos_side,
            shape: OrderShape::Market,
            contracts,
            price: None,
            trigger_price: None,
            reduce_only: false,
            client_order_id: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Responses
// -----------------------------------------------------------------------------

/// Acknowledgement of a successful placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

/// A regular or algo order row fetched from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order_id: String,
    pub symbol: String,
    /// Raw exchange state string, e.g. "live", "filled", "canceled".
    pub state: String,
    pub side: String,
    pub pos_side: Option<PosSide>,
    pub price: f64,
    pub avg_fill_price: f64,
    pub contracts: f64,
    pub filled_contracts: f64,
    /// Fill/update time in unix milliseconds.
    pub update_time_ms: i64,
}

impl OrderDetails {
    pub fn remaining_contracts(&self) -> f64 {
        (self.contracts - self.filled_contracts).max(0.0)
    }
}

/// A pending algorithmic order row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoOrder {
    pub algo_id: String,
    pub symbol: String,
    pub state: String,
    pub side: String,
    pub pos_side: Option<PosSide>,
    pub trigger_price: f64,
    pub contracts: f64,
    pub update_time_ms: i64,
}

/// A live position row from /account/positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub symbol: String,
    pub pos_side: PosSide,
    pub contracts: f64,
    pub avg_entry_price: f64,
    pub leverage: f64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// One OHLCV candle from /market/candles (newest first on the wire).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// -----------------------------------------------------------------------------
// Parse helpers
// -----------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_str_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().unwrap_or(0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

/// Parse a JSON value that may be either a string or a number into `i64`.
pub fn parse_str_i64(val: &serde_json::Value) -> i64 {
    if let Some(s) = val.as_str() {
        s.parse::<i64>().unwrap_or(0)
    } else {
        val.as_i64().unwrap_or(0)
    }
}

fn field_str(row: &serde_json::Value, field: &str) -> String {
    row.get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl OrderDetails {
    pub fn from_row(row: &serde_json::Value) -> EngineResult<Self> {
        let order_id = {
            let id = field_str(row, "ordId");
            if id.is_empty() {
                field_str(row, "algoId")
            } else {
                id
            }
        };
        if order_id.is_empty() {
            return Err(EngineError::Store("order row missing ordId".into()));
        }
        Ok(Self {
            order_id,
            symbol: field_str(row, "instId"),
            state: field_str(row, "state"),
            side: field_str(row, "side"),
            pos_side: PosSide::parse(&field_str(row, "posSide")),
            price: row.get("px").map(parse_str_f64).unwrap_or(0.0),
            avg_fill_price: row.get("avgPx").map(parse_str_f64).unwrap_or(0.0),
            contracts: row.get("sz").map(parse_str_f64).unwrap_or(0.0),
            filled_contracts: row.get("accFillSz").map(parse_str_f64).unwrap_or(0.0),
            update_time_ms: row.get("uTime").map(parse_str_i64).unwrap_or(0),
        })
    }
}

impl AlgoOrder {
    pub fn from_row(row: &serde_json::Value) -> EngineResult<Self> {
        let algo_id = field_str(row, "algoId");
        if algo_id.is_empty() {
            return Err(EngineError::Store("algo row missing algoId".into()));
        }
        Ok(Self {
            algo_id,
            symbol: field_str(row, "instId"),
            state: field_str(row, "state"),
            side: field_str(row, "side"),
            pos_side: PosSide::parse(&field_str(row, "posSide")),
            trigger_price: row.get("triggerPx").map(parse_str_f64).unwrap_or(0.0),
            contracts: row.get("sz").map(parse_str_f64).unwrap_or(0.0),
            update_time_ms: row.get("uTime").map(parse_str_i64).unwrap_or(0),
        })
    }
}

impl LivePosition {
    pub fn from_row(row: &serde_json::Value) -> Option<Self> {
        let pos_side = PosSide::parse(&field_str(row, "posSide"))?;
        let contracts = row.get("pos").map(parse_str_f64).unwrap_or(0.0);
        Some(Self {
            symbol: field_str(row, "instId"),
            pos_side,
            contracts: contracts.abs(),
            avg_entry_price: row.get("avgPx").map(parse_str_f64).unwrap_or(0.0),
            leverage: row.get("lever").map(parse_str_f64).unwrap_or(0.0),
            created_at_ms: row.get("cTime").map(parse_str_i64).unwrap_or(0),
            updated_at_ms: row.get("uTime").map(parse_str_i64).unwrap_or(0),
        })
    }
}

impl Candle {
    /// OKX candle rows are arrays:
    /// [ts, open, high, low, close, vol, volCcy, volCcyQuote, confirm]
    pub fn from_row(row: &serde_json::Value) -> Option<Self> {
        let arr = row.as_array()?;
        if arr.len() < 6 {
            return None;
        }
        Some(Self {
            ts_ms: parse_str_i64(&arr[0]),
            open: parse_str_f64(&arr[1]),
            high: parse_str_f64(&arr[2]),
            low: parse_str_f64(&arr[3]),
            close: parse_str_f64(&arr[4]),
            volume: parse_str_f64(&arr[5]),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_details_coerces_string_numbers() {
        let row = serde_json::json!({
            "ordId": "123",
            "instId": "BTC-USDT-SWAP",
            "state": "filled",
            "side": "sell",
            "posSide": "long",
            "px": "102.5",
            "avgPx": "102.4",
            "sz": "3",
            "accFillSz": "3",
            "uTime": "1700000000000",
        });
        let details = OrderDetails::from_row(&row).unwrap();
        assert_eq!(details.order_id, "123");
        assert_eq!(details.pos_side, Some(PosSide::Long));
        assert!((details.price - 102.5).abs() < 1e-9);
        assert!((details.remaining_contracts() - 0.0).abs() < 1e-9);
        assert_eq!(details.update_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn order_details_falls_back_to_algo_id() {
        let row = serde_json::json!({
            "algoId": "a-9",
            "instId": "ETH-USDT-SWAP",
            "state": "live",
            "side": "buy",
            "sz": "10",
        });
        let details = OrderDetails::from_row(&row).unwrap();
        assert_eq!(details.order_id, "a-9");
    }

    #[test]
    fn live_position_abs_contracts() {
        let row = serde_json::json!({
            "instId": "BTC-USDT-SWAP",
            "posSide": "short",
            "pos": "-12",
            "avgPx": "200",
            "lever": "10",
            "cTime": "1",
            "uTime": "2",
        });
        let pos = LivePosition::from_row(&row).unwrap();
        assert_eq!(pos.pos_side, PosSide::Short);
        assert!((pos.contracts - 12.0).abs() < 1e-9);
    }

    #[test]
    fn candle_from_array_row() {
        let row = serde_json::json!(["1700000000000", "100", "101", "99", "100.5", "5000"]);
        let candle = Candle::from_row(&row).unwrap();
        assert!((candle.close - 100.5).abs() < 1e-9);
        assert!(Candle::from_row(&serde_json::json!(["1", "2"])).is_none());
    }

    #[test]
    fn tp_request_is_reduce_only_limit_opposite_side() {
        let req = OrderRequest::take_profit("BTC-USDT-SWAP", PosSide::Long, 102.0, 3.0);
        assert_eq!(req.side, "sell");
        assert_eq!(req.shape, OrderShape::Limit);
        assert!(req.reduce_only);
        assert_eq!(req.price, Some(102.0));
    }

    #[test]
    fn sl_request_is_trigger_order() {
        let req = OrderRequest::stop_loss("BTC-USDT-SWAP", PosSide::Short, 210.0, 5.0);
        assert_eq!(req.side, "buy");
        assert_eq!(req.shape, OrderShape::Trigger);
        assert_eq!(req.trigger_price, Some(210.0));
    }
}
