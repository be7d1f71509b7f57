// =============================================================================
// Authoritative key layout — every store access goes through these builders
// =============================================================================
//
// All runtime keys are exchange-UID scoped. The chat-id-keyed twins that the
// builders in the `legacy` module produce exist only for the migration
// window: readers consult both forms, writers always write the uid form.
// =============================================================================

use crate::types::PosSide;

pub fn api_keys(uid: &str) -> String {
    format!("user:{uid}:api:keys")
}

pub fn settings(uid: &str) -> String {
    format!("user:{uid}:settings")
}

pub fn dual_side(uid: &str) -> String {
    format!("user:{uid}:dual_side")
}

pub fn preferences(uid: &str) -> String {
    format!("user:{uid}:preferences")
}

pub fn symbol_status(uid: &str, symbol: &str) -> String {
    format!("user:{uid}:symbol:{symbol}:status")
}

/// Pattern matching every per-symbol status key, for cursor scans.
pub fn symbol_status_pattern() -> &'static str {
    "user:*:symbol:*:status"
}

pub fn task_id(uid: &str) -> String {
    format!("user:{uid}:task_id")
}

pub fn stop_signal(uid: &str) -> String {
    format!("user:{uid}:stop_signal")
}

pub fn task_running(uid: &str) -> String {
    format!("task_running:{uid}")
}

pub fn stats(uid: &str) -> String {
    format!("user:{uid}:stats")
}

pub fn position(uid: &str, symbol: &str, side: PosSide) -> String {
    format!("user:{uid}:position:{symbol}:{side}")
}

pub fn monitor_order(uid: &str, symbol: &str, order_id: &str) -> String {
    format!("monitor:user:{uid}:{symbol}:order:{order_id}")
}

pub fn monitor_order_pattern(uid: &str) -> String {
    format!("monitor:user:{uid}:*:order:*")
}

pub fn completed_order(uid: &str, symbol: &str, order_id: &str) -> String {
    format!("completed:user:{uid}:{symbol}:order:{order_id}")
}

pub fn trailing(uid: &str, symbol: &str, side: PosSide) -> String {
    format!("trailing:user:{uid}:{symbol}:{side}")
}

pub fn cooldown(uid: &str, symbol: &str, side: PosSide) -> String {
    format!("cooldown:user:{uid}:{symbol}:{side}")
}

pub fn cycle_lock(uid: &str, symbol: &str, timeframe: &str) -> String {
    format!("lock:user:{uid}:{symbol}:{timeframe}")
}

pub fn reconcile_lock(uid: &str, symbol: &str) -> String {
    format!("lock:user:{uid}:{symbol}:reconcile")
}

pub fn okx_uid_of_chat(chat_id: &str) -> String {
    format!("user:{chat_id}:okx_uid")
}

/// Pattern matching every chat-id → uid mapping key.
pub fn okx_uid_pattern() -> &'static str {
    "user:*:okx_uid"
}

pub fn chat_of_okx_uid(uid: &str) -> String {
    format!("okx_uid_to_telegram:{uid}")
}

pub fn preset(uid: &str, preset_id: &str) -> String {
    format!("preset:{uid}:{preset_id}")
}

pub fn preset_list(uid: &str) -> String {
    format!("preset:{uid}:list")
}

pub fn preset_default(uid: &str) -> String {
    format!("preset:{uid}:default")
}

pub fn symbol_preset(uid: &str, symbol: &str) -> String {
    format!("user:{uid}:symbol:{symbol}:preset_id")
}

pub fn active_symbols(uid: &str) -> String {
    format!("user:{uid}:active_symbols")
}

/// Pub/sub channel carrying preset "reload" notifications for one symbol.
pub fn preset_update_channel(uid: &str, symbol: &str) -> String {
    format!("preset:update:{uid}:{symbol}")
}

pub fn message_queue(uid: &str) -> String {
    format!("telegram:queue:{uid}")
}

pub fn queue_processing(uid: &str) -> String {
    format!("telegram:queue:{uid}:processing")
}

pub fn message_stats(uid: &str) -> String {
    format!("telegram:stats:{uid}")
}

pub fn logs(uid: &str) -> String {
    format!("telegram:logs:by_okx_uid:{uid}")
}

/// Pub/sub channel streaming new journal entries for one user.
pub fn log_channel(uid: &str) -> String {
    format!("telegram:log_channel:by_okx_uid:{uid}")
}

/// Chat-id-keyed twins kept readable during the key-schema migration window.
pub mod legacy {
    pub fn symbol_status(chat_id: &str, symbol: &str) -> String {
        format!("user:{chat_id}:symbol:{symbol}:status")
    }

    pub fn task_id(chat_id: &str) -> String {
        format!("user:{chat_id}:task_id")
    }

    pub fn stop_signal(chat_id: &str) -> String {
        format!("user:{chat_id}:stop_signal")
    }

    pub fn preferences(chat_id: &str) -> String {
        format!("user:{chat_id}:preferences")
    }
}

/// Extract `(uid, symbol)` from a `user:{uid}:symbol:{sym}:status` key.
pub fn parse_symbol_status_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.split(':');
    if parts.next() != Some("user") {
        return None;
    }
    let uid = parts.next()?.to_string();
    if parts.next() != Some("symbol") {
        return None;
    }
    let symbol = parts.next()?.to_string();
    if parts.next() != Some("status") {
        return None;
    }
    Some((uid, symbol))
}

/// Extract `(symbol, order_id)` from a `monitor:user:{uid}:{sym}:order:{id}` key.
pub fn parse_monitor_order_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.split(':');
    if parts.next() != Some("monitor") || parts.next() != Some("user") {
        return None;
    }
    let _uid = parts.next()?;
    let symbol = parts.next()?.to_string();
    if parts.next() != Some("order") {
        return None;
    }
    let order_id = parts.next()?.to_string();
    Some((symbol, order_id))
}

/// Extract the chat id from a `user:{chat_id}:okx_uid` key.
pub fn parse_okx_uid_key(key: &str) -> Option<String> {
    let mut parts = key.split(':');
    if parts.next() != Some("user") {
        return None;
    }
    let chat_id = parts.next()?.to_string();
    if parts.next() != Some("okx_uid") {
        return None;
    }
    Some(chat_id)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_key_layout() {
        assert_eq!(
            position("1234567890123", "BTC-USDT-SWAP", PosSide::Long),
            "user:1234567890123:position:BTC-USDT-SWAP:long"
        );
    }

    #[test]
    fn parse_symbol_status_roundtrip() {
        let key = symbol_status("999000111222", "ETH-USDT-SWAP");
        let (uid, sym) = parse_symbol_status_key(&key).unwrap();
        assert_eq!(uid, "999000111222");
        assert_eq!(sym, "ETH-USDT-SWAP");
        assert!(parse_symbol_status_key("user:1:settings").is_none());
    }

    #[test]
    fn parse_monitor_order_roundtrip() {
        let key = monitor_order("42", "BTC-USDT-SWAP", "oid-7");
        let (sym, oid) = parse_monitor_order_key(&key).unwrap();
        assert_eq!(sym, "BTC-USDT-SWAP");
        assert_eq!(oid, "oid-7");
    }

    #[test]
    fn parse_okx_uid_key_extracts_chat_id() {
        assert_eq!(
            parse_okx_uid_key("user:55667788:okx_uid").as_deref(),
            Some("55667788")
        );
        assert!(parse_okx_uid_key("okx_uid_to_telegram:1").is_none());
    }
}
