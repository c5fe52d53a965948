use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors surfaced by an exchange gateway. `Transient` covers transport
/// failures and exchange error codes that are safe to retry verbatim;
/// everything else must reach the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient gateway error: {0}")]
    Transient(String),
    #[error("stop price already crossed for {symbol}")]
    StaleTrigger { symbol: String },
    #[error("unknown order {order_id} on {symbol}")]
    UnknownOrder { symbol: String, order_id: String },
    #[error("unsupported gateway: {0}")]
    Unsupported(String),
    #[error("gateway error: {0}")]
    Other(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
}

/// An order as reported by the exchange. Kept close to the wire shape so
/// the audit log stores what the exchange actually said.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub orig_qty: Decimal,
    pub price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Exchange timestamp, epoch milliseconds.
    pub update_time: i64,
}

impl RawOrder {
    /// The price a fill is accounted at: executed average when the exchange
    /// reports one, else the limit price, else the stop trigger.
    pub fn fill_price(&self) -> Decimal {
        for candidate in [self.avg_price, self.price, self.stop_price] {
            if let Some(px) = candidate {
                if px > Decimal::ZERO {
                    return px;
                }
            }
        }
        Decimal::ZERO
    }
}

/// Signed exposure as reported by the exchange position endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Positive for long exposure, negative for short.
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}

impl ExchangePosition {
    pub fn notional(&self) -> Decimal {
        (self.position_qty * self.mark_price).abs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceChangeTicker {
    pub symbol: String,
    pub percent_change: Decimal,
}

/// Decimal-place caps derived from the exchange's tick and lot filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolPrecision {
    pub price_precision: u32,
    pub quantity_precision: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The exchange had nothing to cancel; the order is already resolved.
    AlreadyGone,
}

/// The capability set the core consumes. The concrete HTTP/WS client lives
/// outside this crate; `ports::replay_gateway` provides a file-driven
/// implementation for replay runs and tests.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    async fn get_price_changes(&self) -> Result<Vec<PriceChangeTicker>, GatewayError>;

    async fn get_precisions(&self) -> Result<HashMap<String, SymbolPrecision>, GatewayError>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError>;

    async fn get_balances(&self) -> Result<Vec<BalanceEntry>, GatewayError>;

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<RawOrder, GatewayError>;

    /// Places a stop-market order. Fails with `StaleTrigger` when the market
    /// has already moved through `stop_price`.
    async fn create_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        close_position: bool,
    ) -> Result<RawOrder, GatewayError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError>;

    async fn get_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<RawOrder>, GatewayError>;

    async fn get_orders(&self, symbol: &str) -> Result<Vec<RawOrder>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(avg: Option<Decimal>, price: Option<Decimal>, stop: Option<Decimal>) -> RawOrder {
        RawOrder {
            order_id: "1".to_string(),
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            orig_qty: dec!(1),
            price,
            avg_price: avg,
            stop_price: stop,
            update_time: 0,
        }
    }

    #[test]
    fn fill_price_prefers_executed_average() {
        let o = order(Some(dec!(101.5)), Some(dec!(100)), Some(dec!(99)));
        assert_eq!(o.fill_price(), dec!(101.5));
    }

    #[test]
    fn fill_price_skips_zero_average() {
        let o = order(Some(Decimal::ZERO), None, Some(dec!(99)));
        assert_eq!(o.fill_price(), dec!(99));
    }
}
