use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::price_feed::MarkPriceStream;
use crate::trade::execution::gateway::{
    BalanceEntry, CancelOutcome, ExchangeGateway, ExchangePosition, GatewayError, OrderSide,
    OrderStatus, PriceChangeTicker, RawOrder, SymbolPrecision,
};

/// One line of the replay file: a timestamped mark-price map.
#[derive(Debug, Clone, Deserialize)]
struct ReplayEntry {
    timestamp: i64,
    prices: HashMap<String, Decimal>,
}

#[derive(Debug, Clone)]
struct SimPosition {
    /// Signed: positive long, negative short.
    qty: Decimal,
    entry_price: Decimal,
}

#[derive(Default)]
struct SimState {
    cursor: usize,
    positions: HashMap<String, SimPosition>,
    open_orders: HashMap<String, RawOrder>,
    done_orders: HashMap<String, RawOrder>,
    subscribers: Vec<(String, mpsc::Sender<Decimal>)>,
}

/// A file-driven exchange: serves prices from a JSONL dump, fills market
/// orders at the current mark and stop orders when a later tick crosses
/// their trigger, and tracks the resulting exposures. Doubles as the mark
/// price stream so replay runs exercise the same feed path as live ones.
pub struct ReplayGateway {
    data: Vec<ReplayEntry>,
    state: Mutex<SimState>,
}

impl ReplayGateway {
    pub fn new(path: &str) -> Result<Self, GatewayError> {
        let file = File::open(path)
            .map_err(|e| GatewayError::Other(format!("failed to open replay file: {}", e)))?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| GatewayError::Other(format!("failed to read replay line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(&line).map_err(|e| {
                GatewayError::Other(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }
        if data.is_empty() {
            return Err(GatewayError::Other(
                "replay file is empty or invalid".to_string(),
            ));
        }
        Ok(Self {
            data,
            state: Mutex::new(SimState::default()),
        })
    }

    #[cfg(test)]
    pub fn from_entries(entries: Vec<(i64, Vec<(&str, Decimal)>)>) -> Self {
        let data = entries
            .into_iter()
            .map(|(timestamp, prices)| ReplayEntry {
                timestamp,
                prices: prices
                    .into_iter()
                    .map(|(s, p)| (s.to_string(), p))
                    .collect(),
            })
            .collect();
        Self {
            data,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Advances the simulation one step: fills any stop order the new
    /// prices crossed and pushes prices to the feed subscribers. Returns
    /// false once the file is exhausted.
    pub fn tick(&self) -> bool {
        let mut state = self.state.lock().expect("replay state lock poisoned");
        if state.cursor + 1 >= self.data.len() {
            return false;
        }
        state.cursor += 1;
        let entry = &self.data[state.cursor];

        let triggered: Vec<String> = state
            .open_orders
            .values()
            .filter(|order| {
                let Some(stop) = order.stop_price else {
                    return false;
                };
                let Some(price) = entry.prices.get(&order.symbol) else {
                    return false;
                };
                match order.side {
                    OrderSide::Buy => *price >= stop,
                    OrderSide::Sell => *price <= stop,
                }
            })
            .map(|order| order.order_id.clone())
            .collect();
        for order_id in triggered {
            if let Some(mut order) = state.open_orders.remove(&order_id) {
                let fill_price = order.stop_price.unwrap_or(Decimal::ZERO);
                order.status = OrderStatus::Filled;
                order.avg_price = Some(fill_price);
                order.update_time = entry.timestamp;
                Self::apply_fill(&mut state, &order.symbol, order.side, order.orig_qty, fill_price);
                log::info!(
                    "[REPLAY_FILL] symbol={} side={:?} qty={} price={}",
                    order.symbol,
                    order.side,
                    order.orig_qty,
                    fill_price
                );
                state.done_orders.insert(order_id, order);
            }
        }

        let prices = entry.prices.clone();
        state.subscribers.retain(|(symbol, tx)| {
            if let Some(price) = prices.get(symbol) {
                if tx.try_send(*price).is_err() && tx.is_closed() {
                    return false;
                }
            }
            true
        });
        true
    }

    pub fn current_timestamp(&self) -> i64 {
        let state = self.state.lock().expect("replay state lock poisoned");
        self.data[state.cursor].timestamp
    }

    /// The full mark-price map at the current cursor, for drivers that want
    /// to refresh a cache synchronously instead of waiting on the feed.
    pub fn current_prices(&self) -> Vec<(String, Decimal)> {
        let state = self.state.lock().expect("replay state lock poisoned");
        self.data[state.cursor]
            .prices
            .iter()
            .map(|(symbol, price)| (symbol.clone(), *price))
            .collect()
    }

    fn current_price_of(&self, state: &SimState, symbol: &str) -> Option<Decimal> {
        self.data[state.cursor].prices.get(symbol).copied()
    }

    fn apply_fill(
        state: &mut SimState,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) {
        let delta = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let slot = state.positions.entry(symbol.to_string()).or_insert(SimPosition {
            qty: Decimal::ZERO,
            entry_price: price,
        });
        let old_qty = slot.qty;
        let new_qty = old_qty + delta;
        if old_qty == Decimal::ZERO || old_qty.is_sign_positive() != new_qty.is_sign_positive() {
            slot.entry_price = price;
        } else if old_qty.abs() < new_qty.abs() {
            // Growing the exposure: blend the entry.
            slot.entry_price =
                (slot.entry_price * old_qty.abs() + price * delta.abs()) / new_qty.abs();
        }
        slot.qty = new_qty;
        if slot.qty == Decimal::ZERO {
            state.positions.remove(symbol);
        }
    }

    fn mint_order(
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Option<Decimal>,
        fill_price: Option<Decimal>,
        timestamp: i64,
    ) -> RawOrder {
        RawOrder {
            order_id: rand::random::<u64>().to_string(),
            symbol: symbol.to_string(),
            side,
            status: if fill_price.is_some() {
                OrderStatus::Filled
            } else {
                OrderStatus::New
            },
            orig_qty: qty,
            price: None,
            avg_price: fill_price,
            stop_price,
            update_time: timestamp,
        }
    }
}

#[async_trait]
impl ExchangeGateway for ReplayGateway {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let state = self.state.lock().expect("replay state lock poisoned");
        self.current_price_of(&state, symbol)
            .ok_or_else(|| GatewayError::Other(format!("unknown replay symbol {}", symbol)))
    }

    async fn get_price_changes(&self) -> Result<Vec<PriceChangeTicker>, GatewayError> {
        let state = self.state.lock().expect("replay state lock poisoned");
        let first = &self.data[0].prices;
        let current = &self.data[state.cursor].prices;
        let mut changes: Vec<PriceChangeTicker> = current
            .iter()
            .filter_map(|(symbol, price)| {
                let base = first.get(symbol)?;
                if *base <= Decimal::ZERO {
                    return None;
                }
                Some(PriceChangeTicker {
                    symbol: symbol.clone(),
                    percent_change: (*price / *base - Decimal::ONE) * dec!(100),
                })
            })
            .collect();
        changes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(changes)
    }

    async fn get_precisions(&self) -> Result<HashMap<String, SymbolPrecision>, GatewayError> {
        let mut precisions = HashMap::new();
        for (symbol, price) in &self.data[0].prices {
            precisions.insert(
                symbol.clone(),
                SymbolPrecision {
                    price_precision: price.scale(),
                    quantity_precision: 3,
                },
            );
        }
        Ok(precisions)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        let state = self.state.lock().expect("replay state lock poisoned");
        Ok(state
            .positions
            .iter()
            .map(|(symbol, position)| ExchangePosition {
                symbol: symbol.clone(),
                position_qty: position.qty,
                entry_price: position.entry_price,
                mark_price: self
                    .current_price_of(&state, symbol)
                    .unwrap_or(position.entry_price),
            })
            .collect())
    }

    async fn get_balances(&self) -> Result<Vec<BalanceEntry>, GatewayError> {
        Ok(vec![BalanceEntry {
            asset: "USDT".to_string(),
            free: dec!(10000),
            locked: Decimal::ZERO,
        }])
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<RawOrder, GatewayError> {
        let mut state = self.state.lock().expect("replay state lock poisoned");
        let price = self
            .current_price_of(&state, symbol)
            .ok_or_else(|| GatewayError::Other(format!("unknown replay symbol {}", symbol)))?;
        let timestamp = self.data[state.cursor].timestamp;
        Self::apply_fill(&mut state, symbol, side, qty, price);
        let order = Self::mint_order(symbol, side, qty, None, Some(price), timestamp);
        log::info!(
            "[REPLAY_FILL] symbol={} side={:?} qty={} price={}",
            symbol,
            side,
            qty,
            price
        );
        state.done_orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn create_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        _close_position: bool,
    ) -> Result<RawOrder, GatewayError> {
        let mut state = self.state.lock().expect("replay state lock poisoned");
        let price = self
            .current_price_of(&state, symbol)
            .ok_or_else(|| GatewayError::Other(format!("unknown replay symbol {}", symbol)))?;
        let already_crossed = match side {
            OrderSide::Buy => price >= stop_price,
            OrderSide::Sell => price <= stop_price,
        };
        if already_crossed {
            return Err(GatewayError::StaleTrigger {
                symbol: symbol.to_string(),
            });
        }
        let timestamp = self.data[state.cursor].timestamp;
        let order = Self::mint_order(symbol, side, qty, Some(stop_price), None, timestamp);
        state.open_orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError> {
        let mut state = self.state.lock().expect("replay state lock poisoned");
        match state.open_orders.remove(order_id) {
            Some(mut order) => {
                order.status = OrderStatus::Canceled;
                state.done_orders.insert(order_id.to_string(), order);
                Ok(CancelOutcome::Canceled)
            }
            None => Ok(CancelOutcome::AlreadyGone),
        }
    }

    async fn get_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Option<RawOrder>, GatewayError> {
        let state = self.state.lock().expect("replay state lock poisoned");
        Ok(state
            .open_orders
            .get(order_id)
            .or_else(|| state.done_orders.get(order_id))
            .cloned())
    }

    async fn get_orders(&self, symbol: &str) -> Result<Vec<RawOrder>, GatewayError> {
        let state = self.state.lock().expect("replay state lock poisoned");
        Ok(state
            .open_orders
            .values()
            .chain(state.done_orders.values())
            .filter(|order| order.symbol == symbol)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MarkPriceStream for ReplayGateway {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Decimal>, GatewayError> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().expect("replay state lock poisoned");
        if let Some(price) = self.current_price_of(&state, symbol) {
            let _ = tx.try_send(price);
        }
        state.subscribers.push((symbol.to_string(), tx));
        Ok(rx)
    }
}
