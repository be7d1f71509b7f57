// =============================================================================
// Fill notifications — TP-level ordering, stale suppression, de-dup window
// =============================================================================
//
// TP fills for one (uid, symbol, side) must reach the user in level order
// even when exchange responses arrive shuffled. An out-of-order fill waits
// in a per-side queue; once it has sat there for more than one monitor tick
// it is emitted anyway with a gap marker, and the missing predecessor still
// emits whenever it is finally seen.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::dispatcher::MessageDispatcher;
use crate::journal::{Journal, LogEntry};
use crate::types::{EventCategory, PosSide};

/// Fills older than this are journalled but never notified.
const STALE_FILL_SECS: i64 = 15 * 60;
/// Shared de-dup window for break-even and trailing-stop notifications.
const DEDUP_WINDOW_SECS: u64 = 60;
/// Ticks a queued out-of-order notification waits before the fallback emit.
const GAP_FLUSH_TICKS: u64 = 2;

// -----------------------------------------------------------------------------
// Ordering state machine (pure, lock-free to test)
// -----------------------------------------------------------------------------

struct PendingNote {
    level: u8,
    text: String,
    queued_at_tick: u64,
}

#[derive(Default)]
struct TpQueue {
    processed: [bool; 3],
    pending: BTreeMap<u8, PendingNote>,
}

fn queue_key(uid: &str, symbol: &str, side: PosSide) -> String {
    format!("{uid}|{symbol}|{side}")
}

/// What to do with one incoming TP fill notification.
#[derive(Debug, PartialEq, Eq)]
pub enum FillDecision {
    /// Level already processed for this side.
    Duplicate,
    /// Predecessor missing; held back for now.
    Queued,
    /// Emit these `(level, text)` pairs, in order.
    Emit(Vec<(u8, String)>),
}

/// Per-(uid, symbol, side) ordering of TP notifications.
#[derive(Default)]
pub struct TpOrdering {
    queues: HashMap<String, TpQueue>,
}

impl TpOrdering {
    /// Process a fill for `level` observed at `tick`.
    pub fn on_fill(&mut self, key: &str, level: u8, text: &str, tick: u64) -> FillDecision {
        let queue = self.queues.entry(key.to_string()).or_default();
        let idx = (level.clamp(1, 3) - 1) as usize;

        if queue.processed[idx] {
            return FillDecision::Duplicate;
        }

        let predecessors_done = (0..idx).all(|i| queue.processed[i]);
        if !predecessors_done {
            queue.pending.insert(
                level,
                PendingNote {
                    level,
                    text: text.to_string(),
                    queued_at_tick: tick,
                },
            );
            return FillDecision::Queued;
        }

        // Emit this level, then any directly-following queued levels.
        let mut batch = vec![(level, text.to_string())];
        queue.processed[idx] = true;
        let mut next = level + 1;
        while next <= 3 {
            match queue.pending.remove(&next) {
                Some(pending) => {
                    queue.processed[(next - 1) as usize] = true;
                    batch.push((pending.level, pending.text));
                    next += 1;
                }
                None => break,
            }
        }
        FillDecision::Emit(batch)
    }

    /// Flush entries whose predecessor never arrived within the grace
    /// window. Returns `(key, level, text)` triples to emit with a gap
    /// marker.
    pub fn flush_stalled(&mut self, tick: u64) -> Vec<(String, u8, String)> {
        let mut out = Vec::new();
        for (key, queue) in self.queues.iter_mut() {
            let ready: Vec<u8> = queue
                .pending
                .values()
                .filter(|p| tick.saturating_sub(p.queued_at_tick) >= GAP_FLUSH_TICKS)
                .map(|p| p.level)
                .collect();
            for level in ready {
                if let Some(pending) = queue.pending.remove(&level) {
                    queue.processed[(level.clamp(1, 3) - 1) as usize] = true;
                    out.push((key.clone(), pending.level, pending.text));
                }
            }
        }
        out
    }

    pub fn clear(&mut self, key: &str) {
        self.queues.remove(key);
    }
}

// -----------------------------------------------------------------------------
// Notifier
// -----------------------------------------------------------------------------

/// Ordered, de-duplicated notification fan-out over journal + dispatcher.
pub struct Notifier {
    dispatcher: Arc<MessageDispatcher>,
    journal: Journal,
    ordering: Mutex<TpOrdering>,
    dedup: Mutex<HashMap<String, Instant>>,
    tick: AtomicU64,
}

impl Notifier {
    pub fn new(dispatcher: Arc<MessageDispatcher>, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            journal,
            ordering: Mutex::new(TpOrdering::default()),
            dedup: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        })
    }

    /// Plain notification: journal entry plus queued chat message.
    pub async fn notify(
        &self,
        uid: &str,
        symbol: Option<&str>,
        event_type: &str,
        category: EventCategory,
        text: &str,
    ) {
        let mut entry = LogEntry::new(uid, event_type, category, text);
        if let Some(sym) = symbol {
            entry = entry.with_symbol(sym);
        }
        self.journal.record(entry).await;
        if let Err(e) = self.dispatcher.enqueue(uid, text, category).await {
            debug!(uid, error = %e, "notification enqueue failed");
        }
    }

    /// Notification behind the shared 60 s de-dup window (break-even and
    /// trailing-stop transitions can fire from several monitor paths).
    pub async fn notify_deduped(
        &self,
        dedup_key: &str,
        uid: &str,
        symbol: Option<&str>,
        event_type: &str,
        category: EventCategory,
        text: &str,
    ) -> bool {
        {
            let mut dedup = self.dedup.lock();
            let now = Instant::now();
            dedup.retain(|_, t| now.duration_since(*t).as_secs() < DEDUP_WINDOW_SECS);
            if dedup.contains_key(dedup_key) {
                debug!(dedup_key, "notification suppressed by de-dup window");
                return false;
            }
            dedup.insert(dedup_key.to_string(), now);
        }
        self.notify(uid, symbol, event_type, category, text).await;
        true
    }

    /// TP fill notification with level ordering and the stale-fill guard.
    /// Returns `true` when the notification was emitted or queued (false
    /// for duplicates and stale fills).
    pub async fn notify_tp_fill(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        level: u8,
        text: &str,
        fill_time_ms: i64,
    ) -> bool {
        // Stale guard: replayed history must not spam the user.
        let age_secs = (chrono::Utc::now().timestamp_millis() - fill_time_ms) / 1000;
        if fill_time_ms > 0 && age_secs > STALE_FILL_SECS {
            info!(uid, symbol, level, age_secs, "stale TP fill — notification suppressed");
            self.journal
                .record(
                    LogEntry::new(
                        uid,
                        "stale_fill_suppressed",
                        EventCategory::Tp,
                        &format!("tp{level} fill {age_secs}s old, notification suppressed"),
                    )
                    .with_symbol(symbol),
                )
                .await;
            return false;
        }

        let key = queue_key(uid, symbol, side);
        let tick = self.tick.load(Ordering::Relaxed);
        let decision = self.ordering.lock().on_fill(&key, level, text, tick);

        match decision {
            FillDecision::Duplicate => {
                debug!(uid, symbol, level, "duplicate TP notification dropped");
                false
            }
            FillDecision::Queued => {
                debug!(uid, symbol, level, "TP notification queued behind missing predecessor");
                true
            }
            FillDecision::Emit(batch) => {
                for (emit_level, emit_text) in batch {
                    self.notify(
                        uid,
                        Some(symbol),
                        &format!("tp{emit_level}_execution"),
                        EventCategory::Tp,
                        &emit_text,
                    )
                    .await;
                }
                true
            }
        }
    }

    /// Advance the monitor tick and flush queued notifications whose
    /// predecessor never arrived. Each flushed entry gets a gap marker in
    /// the journal; the predecessor still emits when eventually seen.
    pub async fn advance_tick(&self) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let flushed = self.ordering.lock().flush_stalled(tick);

        for (key, level, text) in flushed {
            let mut parts = key.split('|');
            let uid = parts.next().unwrap_or_default().to_string();
            let symbol = parts.next().unwrap_or_default().to_string();
            self.journal
                .record(
                    LogEntry::new(
                        &uid,
                        "tp_notification_gap",
                        EventCategory::Tp,
                        &format!("tp{level} emitted out of order, predecessor missing"),
                    )
                    .with_symbol(&symbol),
                )
                .await;
            self.notify(
                &uid,
                Some(&symbol),
                &format!("tp{level}_execution"),
                EventCategory::Tp,
                &text,
            )
            .await;
        }
    }

    /// Drop ordering state when a position closes.
    pub fn clear_side(&self, uid: &str, symbol: &str, side: PosSide) {
        self.ordering
            .lock()
            .clear(&queue_key(uid, symbol, side));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "42|BTC-USDT-SWAP|long";

    #[test]
    fn in_order_fills_emit_immediately() {
        let mut ordering = TpOrdering::default();
        assert_eq!(
            ordering.on_fill(KEY, 1, "tp1", 0),
            FillDecision::Emit(vec![(1, "tp1".into())])
        );
        assert_eq!(
            ordering.on_fill(KEY, 2, "tp2", 0),
            FillDecision::Emit(vec![(2, "tp2".into())])
        );
        assert_eq!(
            ordering.on_fill(KEY, 3, "tp3", 0),
            FillDecision::Emit(vec![(3, "tp3".into())])
        );
    }

    #[test]
    fn out_of_order_tp2_waits_then_drains_behind_tp1() {
        let mut ordering = TpOrdering::default();
        assert_eq!(ordering.on_fill(KEY, 2, "tp2", 0), FillDecision::Queued);
        // TP1 arrival releases both, TP1 first.
        assert_eq!(
            ordering.on_fill(KEY, 1, "tp1", 0),
            FillDecision::Emit(vec![(1, "tp1".into()), (2, "tp2".into())])
        );
    }

    #[test]
    fn tp3_first_waits_for_both() {
        let mut ordering = TpOrdering::default();
        assert_eq!(ordering.on_fill(KEY, 3, "tp3", 0), FillDecision::Queued);
        assert_eq!(ordering.on_fill(KEY, 2, "tp2", 0), FillDecision::Queued);
        assert_eq!(
            ordering.on_fill(KEY, 1, "tp1", 0),
            FillDecision::Emit(vec![
                (1, "tp1".into()),
                (2, "tp2".into()),
                (3, "tp3".into())
            ])
        );
    }

    #[test]
    fn duplicate_fill_detected() {
        let mut ordering = TpOrdering::default();
        ordering.on_fill(KEY, 1, "tp1", 0);
        assert_eq!(ordering.on_fill(KEY, 1, "tp1 again", 0), FillDecision::Duplicate);
    }

    #[test]
    fn stalled_entry_flushes_after_grace_window() {
        let mut ordering = TpOrdering::default();
        ordering.on_fill(KEY, 2, "tp2", 0);

        // One tick later: still held.
        assert!(ordering.flush_stalled(1).is_empty());

        // Two ticks later: fallback emit with the key attached.
        let flushed = ordering.flush_stalled(2);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1, 2);
        assert_eq!(flushed[0].0, KEY);

        // TP1 still emits normally when finally seen.
        assert_eq!(
            ordering.on_fill(KEY, 1, "tp1", 2),
            FillDecision::Emit(vec![(1, "tp1".into())])
        );
        // But TP2 is now a duplicate.
        assert_eq!(ordering.on_fill(KEY, 2, "tp2", 2), FillDecision::Duplicate);
    }

    #[test]
    fn clear_resets_per_side_state() {
        let mut ordering = TpOrdering::default();
        ordering.on_fill(KEY, 1, "tp1", 0);
        ordering.clear(KEY);
        assert_eq!(
            ordering.on_fill(KEY, 1, "tp1", 0),
            FillDecision::Emit(vec![(1, "tp1".into())])
        );
    }

    #[test]
    fn sides_are_independent() {
        let mut ordering = TpOrdering::default();
        ordering.on_fill(KEY, 1, "tp1", 0);
        let short_key = "42|BTC-USDT-SWAP|short";
        assert_eq!(
            ordering.on_fill(short_key, 1, "tp1", 0),
            FillDecision::Emit(vec![(1, "tp1".into())])
        );
    }
}
