use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::notifier::notify_rate_limit;
use crate::ports::replay_gateway::ReplayGateway;
use crate::trade::execution::gateway::{
    BalanceEntry, CancelOutcome, ExchangeGateway, ExchangePosition, GatewayError, OrderSide,
    PriceChangeTicker, RawOrder, SymbolPrecision,
};

const RETRY_BASE_DELAY_MS: u64 = 1_000;
const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Wraps a concrete gateway and absorbs its transient faults: transport
/// errors and retryable exchange codes are retried in a loop with capped
/// exponential backoff, invisibly to the core. Every other error surfaces
/// unchanged. Rate-limit signatures additionally trigger an e-mail
/// notification so throttling does not go unnoticed.
pub struct GatewayBox {
    inner: Box<dyn ExchangeGateway>,
}

impl GatewayBox {
    pub fn new(inner: Box<dyn ExchangeGateway>) -> Self {
        Self { inner }
    }

    /// Builds the gateway selected by name. Live exchange connectors are
    /// linked by the embedding deployment; this crate ships the replay
    /// gateway used for file-driven runs.
    pub fn create(
        gateway_name: &str,
        replay: Option<Arc<ReplayGateway>>,
    ) -> Result<Self, GatewayError> {
        match gateway_name {
            "replay" => {
                let replay =
                    replay.ok_or_else(|| GatewayError::Other("missing replay file".to_string()))?;
                Ok(Self::new(Box::new(ReplayHandle(replay))))
            }
            other => Err(GatewayError::Unsupported(other.to_string())),
        }
    }

    fn note_transient(&self, operation: &str, detail: &str, err: &GatewayError) {
        let err_text = err.to_string();
        if err_text.contains("429") || err_text.contains("Too Many Requests") {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, &err_text);
        }
        log::warn!("[GATEWAY] {} {} failed, retrying: {}", operation, detail, err_text);
    }

    fn next_delay(current_ms: u64) -> u64 {
        (current_ms * 2).min(RETRY_MAX_DELAY_MS)
    }
}

/// Arc indirection so the replay gateway can be shared between the box and
/// the engine's replay driver.
struct ReplayHandle(Arc<ReplayGateway>);

#[async_trait]
impl ExchangeGateway for ReplayHandle {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.0.get_price(symbol).await
    }

    async fn get_price_changes(&self) -> Result<Vec<PriceChangeTicker>, GatewayError> {
        self.0.get_price_changes().await
    }

    async fn get_precisions(&self) -> Result<HashMap<String, SymbolPrecision>, GatewayError> {
        self.0.get_precisions().await
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        self.0.get_positions().await
    }

    async fn get_balances(&self) -> Result<Vec<BalanceEntry>, GatewayError> {
        self.0.get_balances().await
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<RawOrder, GatewayError> {
        self.0.create_market_order(symbol, side, qty).await
    }

    async fn create_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        close_position: bool,
    ) -> Result<RawOrder, GatewayError> {
        self.0
            .create_stop_order(symbol, side, qty, stop_price, close_position)
            .await
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError> {
        self.0.cancel_order(symbol, order_id).await
    }

    async fn get_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<RawOrder>, GatewayError> {
        self.0.get_order(symbol, order_id).await
    }

    async fn get_orders(&self, symbol: &str) -> Result<Vec<RawOrder>, GatewayError> {
        self.0.get_orders(symbol).await
    }
}

#[async_trait]
impl ExchangeGateway for GatewayBox {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_price(symbol).await {
                Err(err) if err.is_transient() => {
                    self.note_transient("get_price", symbol, &err);
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn get_price_changes(&self) -> Result<Vec<PriceChangeTicker>, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_price_changes().await {
                Err(err) if err.is_transient() => {
                    self.note_transient("get_price_changes", "all", &err);
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn get_precisions(&self) -> Result<HashMap<String, SymbolPrecision>, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_precisions().await {
                Err(err) if err.is_transient() => {
                    self.note_transient("get_precisions", "all", &err);
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_positions().await {
                Err(err) if err.is_transient() => {
                    self.note_transient("get_positions", "all", &err);
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn get_balances(&self) -> Result<Vec<BalanceEntry>, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_balances().await {
                Err(err) if err.is_transient() => {
                    self.note_transient("get_balances", "all", &err);
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<RawOrder, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.create_market_order(symbol, side, qty).await {
                Err(err) if err.is_transient() => {
                    self.note_transient(
                        "create_market_order",
                        &format!("{} side={:?} qty={}", symbol, side, qty),
                        &err,
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn create_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        close_position: bool,
    ) -> Result<RawOrder, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self
                .inner
                .create_stop_order(symbol, side, qty, stop_price, close_position)
                .await
            {
                Err(err) if err.is_transient() => {
                    self.note_transient(
                        "create_stop_order",
                        &format!("{} side={:?} stop={}", symbol, side, stop_price),
                        &err,
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.cancel_order(symbol, order_id).await {
                Err(err) if err.is_transient() => {
                    self.note_transient(
                        "cancel_order",
                        &format!("{} order_id={}", symbol, order_id),
                        &err,
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn get_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<RawOrder>, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_order(symbol, order_id).await {
                Err(err) if err.is_transient() => {
                    self.note_transient(
                        "get_order",
                        &format!("{} order_id={}", symbol, order_id),
                        &err,
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }

    async fn get_orders(&self, symbol: &str) -> Result<Vec<RawOrder>, GatewayError> {
        let mut delay_ms = RETRY_BASE_DELAY_MS;
        loop {
            match self.inner.get_orders(symbol).await {
                Err(err) if err.is_transient() => {
                    self.note_transient("get_orders", symbol, &err);
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = Self::next_delay(delay_ms);
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with a transient error a fixed number of times, then succeeds.
    struct FlakyGateway {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeGateway for FlakyGateway {
        async fn get_price(&self, _symbol: &str) -> Result<Decimal, GatewayError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(GatewayError::Transient("HTTP 502".to_string()))
            } else {
                Ok(Decimal::ONE)
            }
        }

        async fn get_price_changes(&self) -> Result<Vec<PriceChangeTicker>, GatewayError> {
            Ok(vec![])
        }

        async fn get_precisions(&self) -> Result<HashMap<String, SymbolPrecision>, GatewayError> {
            Ok(HashMap::new())
        }

        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
            Ok(vec![])
        }

        async fn get_balances(&self) -> Result<Vec<BalanceEntry>, GatewayError> {
            Ok(vec![])
        }

        async fn create_market_order(
            &self,
            symbol: &str,
            _side: OrderSide,
            _qty: Decimal,
        ) -> Result<RawOrder, GatewayError> {
            Err(GatewayError::Other(format!("not used: {}", symbol)))
        }

        async fn create_stop_order(
            &self,
            symbol: &str,
            _side: OrderSide,
            _qty: Decimal,
            _stop_price: Decimal,
            _close_position: bool,
        ) -> Result<RawOrder, GatewayError> {
            Err(GatewayError::StaleTrigger {
                symbol: symbol.to_string(),
            })
        }

        async fn cancel_order(
            &self,
            _symbol: &str,
            _order_id: &str,
        ) -> Result<CancelOutcome, GatewayError> {
            Ok(CancelOutcome::AlreadyGone)
        }

        async fn get_order(
            &self,
            _symbol: &str,
            _order_id: &str,
        ) -> Result<Option<RawOrder>, GatewayError> {
            Ok(None)
        }

        async fn get_orders(&self, _symbol: &str) -> Result<Vec<RawOrder>, GatewayError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let gateway = GatewayBox::new(Box::new(FlakyGateway {
            failures_left: AtomicUsize::new(1),
        }));
        let price = gateway.get_price("AAAUSDT").await.unwrap();
        assert_eq!(price, Decimal::ONE);
    }

    #[tokio::test]
    async fn stale_trigger_surfaces_immediately() {
        let gateway = GatewayBox::new(Box::new(FlakyGateway {
            failures_left: AtomicUsize::new(0),
        }));
        let err = gateway
            .create_stop_order("AAAUSDT", OrderSide::Buy, Decimal::ONE, Decimal::ONE, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::StaleTrigger { .. }));
    }
}
