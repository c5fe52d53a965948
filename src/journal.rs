use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::ladder::round_to;
use crate::trade::execution::gateway::RawOrder;

/// The audit log keeps only the most recent entries across restarts.
pub const ORDER_LOG_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderKind {
    Entry,
    Dca,
    Cut,
    ChildDca,
    Profit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLogEntry {
    pub kind: OrderKind,
    pub order: RawOrder,
    /// Percent move from the prior logged order on the same symbol.
    pub change: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub ts: i64,
}

/// Append-only order log shared across concurrently advancing positions.
/// Cheap to clone; all clones see the same entries.
#[derive(Clone)]
pub struct OrderJournal {
    inner: Arc<Mutex<JournalInner>>,
}

struct JournalInner {
    entries: Vec<OrderLogEntry>,
    dirty: bool,
}

impl Default for OrderJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderJournal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(JournalInner {
                entries: Vec::new(),
                dirty: false,
            })),
        }
    }

    pub fn restore(&self, entries: Vec<OrderLogEntry>) {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        inner.entries = entries;
        inner.dirty = false;
    }

    pub fn record(&self, kind: OrderKind, order: RawOrder, profit: Option<Decimal>) {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        let change = if kind == OrderKind::Entry {
            None
        } else {
            inner
                .entries
                .iter()
                .rev()
                .find(|entry| entry.order.symbol == order.symbol)
                .map(|entry| entry.order.fill_price())
                .filter(|prior| *prior > Decimal::ZERO)
                .map(|prior| round_to((order.fill_price() / prior - Decimal::ONE) * dec!(100), 1))
        };
        inner.entries.push(OrderLogEntry {
            kind,
            order,
            change,
            profit,
            ts: Utc::now().timestamp_millis(),
        });
        inner.dirty = true;
    }

    pub fn snapshot(&self) -> Vec<OrderLogEntry> {
        self.inner
            .lock()
            .expect("journal lock poisoned")
            .entries
            .clone()
    }

    /// Returns the capped entry list when anything was appended since the
    /// last call, truncating the in-memory log to the cap as a side effect.
    pub fn take_dirty(&self) -> Option<Vec<OrderLogEntry>> {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        if !inner.dirty {
            return None;
        }
        inner.dirty = false;
        let len = inner.entries.len();
        if len > ORDER_LOG_CAP {
            inner.entries.drain(..len - ORDER_LOG_CAP);
        }
        Some(inner.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::execution::gateway::{OrderSide, OrderStatus};

    fn order(symbol: &str, price: Decimal) -> RawOrder {
        RawOrder {
            order_id: format!("{}-{}", symbol, price),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            orig_qty: Decimal::ONE,
            price: None,
            avg_price: Some(price),
            stop_price: None,
            update_time: 0,
        }
    }

    #[test]
    fn change_tracks_prior_same_symbol_order() {
        let journal = OrderJournal::new();
        journal.record(OrderKind::Entry, order("AAAUSDT", dec!(100)), None);
        journal.record(OrderKind::Entry, order("BBBUSDT", dec!(50)), None);
        journal.record(OrderKind::Dca, order("AAAUSDT", dec!(95)), None);

        let entries = journal.snapshot();
        assert_eq!(entries[0].change, None);
        assert_eq!(entries[2].change, Some(dec!(-5.0)));
    }

    #[test]
    fn take_dirty_caps_and_clears() {
        let journal = OrderJournal::new();
        for i in 0..(ORDER_LOG_CAP + 5) {
            journal.record(OrderKind::Entry, order("AAAUSDT", Decimal::from(i as i64 + 1)), None);
        }
        let persisted = journal.take_dirty().expect("dirty after appends");
        assert_eq!(persisted.len(), ORDER_LOG_CAP);
        assert!(journal.take_dirty().is_none());
    }
}
