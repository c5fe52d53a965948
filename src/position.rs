use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::journal::{OrderJournal, OrderKind};
use crate::ladder::{self, ceil_to, round_to, LadderParams};
use crate::notifier::notify_direction_mismatch;
use crate::trade::execution::gateway::{
    CancelOutcome, ExchangeGateway, ExchangePosition, GatewayError, OrderSide, OrderStatus,
    RawOrder, SymbolPrecision,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that grows the exposure (DCA, child-DCA, entry).
    pub fn accumulate_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that shrinks the exposure (cut, profit close).
    pub fn reduce_side(self) -> OrderSide {
        self.accumulate_side().opposite()
    }

    pub fn contradicts(self, signed_qty: Decimal) -> bool {
        match self {
            PositionSide::Long => signed_qty < Decimal::ZERO,
            PositionSide::Short => signed_qty > Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Start,
    Dca,
    Profit,
}

/// One managed position. A tick consumes the current value and yields the
/// successor (`None` once the exchange reports the exposure gone), so a
/// half-applied tick can never leak into the managed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub status: Status,
    pub price_precision: u32,
    pub quantity_precision: u32,

    pub entry_price: Decimal,
    pub avg_price: Decimal,
    pub current_price: Decimal,
    pub entry_qty: Decimal,

    /// Walking trigger vs. its last committed value, per rung.
    pub dca_price: Decimal,
    pub dca_price_fixed: Decimal,
    pub cut_price: Option<Decimal>,
    pub cut_price_fixed: Option<Decimal>,
    pub child_dca_price: Option<Decimal>,
    pub child_dca_price_fixed: Option<Decimal>,

    pub sl_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    /// Where the PROFIT phase would arm, refreshed every tick for display.
    pub profit_trigger_price: Option<Decimal>,

    pub dca_order: Option<RawOrder>,
    pub cut_order: Option<RawOrder>,
    pub child_dca_order: Option<RawOrder>,
    pub filled_dca_orders: Vec<RawOrder>,
    pub filled_cut_orders: Vec<RawOrder>,
    pub filled_child_dca_orders: Vec<RawOrder>,

    pub dca_count: u32,
    /// Net open cut-vs-child-DCA imbalance.
    pub cut_minus_dca: i32,
    pub dca_pending_counter: u32,
    pub cut_pending_counter: u32,
    pub child_dca_pending_counter: u32,

    pub manual: bool,
    pub error: bool,
    pub sl_percent: Option<Decimal>,

    /// Epoch milliseconds.
    pub created_at: i64,

    // Display-only fields published to the control surface.
    pub dca_stop_price: Option<Decimal>,
    pub cut_stop_price: Option<Decimal>,
    pub child_dca_stop_price: Option<Decimal>,
    pub to_low: Option<Decimal>,
    pub to_high: Option<Decimal>,
    pub calc_profit: Option<Decimal>,
    pub price_change: Option<Decimal>,
}

/// Everything a position needs for one tick. Owned values only so ticks can
/// run on spawned tasks without borrowing the engine.
pub struct TickCtx {
    pub gateway: Arc<dyn ExchangeGateway>,
    pub ladder: LadderParams,
    pub current_price: Decimal,
    pub exchange_position: Option<ExchangePosition>,
    pub journal: OrderJournal,
    /// Operator stop-loss percent queued through the control surface.
    pub stop_loss_override: Option<Decimal>,
}

impl TickCtx {
    fn signed_qty(&self) -> Decimal {
        self.exchange_position
            .as_ref()
            .map(|p| p.position_qty)
            .unwrap_or(Decimal::ZERO)
    }
}

impl Position {
    /// Builds a fresh position for an exposure the exchange reports but the
    /// managed set does not know yet. Oversized exposures were not opened by
    /// the admission controller and are taken over in manual mode.
    pub fn admit(
        snapshot: &ExchangePosition,
        precision: SymbolPrecision,
        current_price: Decimal,
        cfg: &LadderParams,
        manual_notional_threshold: Decimal,
    ) -> Self {
        let side = if snapshot.position_qty > Decimal::ZERO {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let avg_price = ceil_to(snapshot.entry_price, precision.price_precision);
        let manual =
            (snapshot.position_qty * snapshot.entry_price).abs() > manual_notional_threshold;

        let mut position = Self {
            id: format!("{:016x}", rand::random::<u64>()),
            symbol: snapshot.symbol.clone(),
            side,
            status: Status::Start,
            price_precision: precision.price_precision,
            quantity_precision: precision.quantity_precision,
            entry_price: avg_price,
            avg_price,
            current_price,
            entry_qty: snapshot.position_qty.abs(),
            dca_price: Decimal::ZERO,
            dca_price_fixed: Decimal::ZERO,
            cut_price: None,
            cut_price_fixed: None,
            child_dca_price: None,
            child_dca_price_fixed: None,
            sl_price: None,
            max_price: None,
            profit_trigger_price: None,
            dca_order: None,
            cut_order: None,
            child_dca_order: None,
            filled_dca_orders: Vec::new(),
            filled_cut_orders: Vec::new(),
            filled_child_dca_orders: Vec::new(),
            dca_count: 0,
            cut_minus_dca: 0,
            dca_pending_counter: 0,
            cut_pending_counter: 0,
            child_dca_pending_counter: 0,
            manual,
            error: false,
            sl_percent: None,
            created_at: Utc::now().timestamp_millis(),
            dca_stop_price: None,
            cut_stop_price: None,
            child_dca_stop_price: None,
            to_low: None,
            to_high: None,
            calc_profit: None,
            price_change: None,
        };
        position.dca_price = ladder::dca_price(&position, cfg);
        position.dca_price_fixed = position.dca_price;
        position
    }

    pub fn elapsed_label(&self) -> String {
        let mut hours = (Utc::now().timestamp_millis() - self.created_at) / 3_600_000;
        let days = hours / 24;
        hours %= 24;
        format!("{}d {}h", days, hours)
    }

    /// Advances the lifecycle by one tick. Returns the successor value, or
    /// `None` once the position is done and must leave the managed set. Any
    /// error leaves the caller holding the prior value for the next tick.
    pub async fn advance(self, ctx: &TickCtx) -> Result<Option<Position>> {
        if self.manual {
            self.advance_manual(ctx).await
        } else {
            self.advance_managed(ctx).await
        }
    }

    async fn advance_managed(mut self, ctx: &TickCtx) -> Result<Option<Position>> {
        self.current_price = ctx.current_price;
        self.refresh_error_flag(ctx);
        self.refresh_display_triggers(&ctx.ladder);

        // Covers positions closed behind our back, whatever the phase.
        if ctx.signed_qty() == Decimal::ZERO {
            log::info!("[POSITION] {} closed on exchange, dropping", self.symbol);
            return Ok(None);
        }

        match self.status {
            Status::Start => {
                if self.check_profit_trigger(&ctx.ladder) {
                    self.enter_profit_phase(ctx.ladder.min_profit);
                } else {
                    self.manage_dca_order(ctx).await?;
                }
            }
            Status::Dca => {
                if self.check_profit_trigger(&ctx.ladder) {
                    self.enter_profit_phase(ctx.ladder.min_profit_after_dca);
                } else {
                    self.manage_dca_order(ctx).await?;
                    self.manage_cut_order(ctx).await?;
                    self.manage_child_dca_order(ctx).await?;
                }
            }
            Status::Profit => {
                if self.manage_profit(ctx).await? {
                    return Ok(None);
                }
            }
        }

        Ok(Some(self))
    }

    /// Manual positions bypass the ladder: only the operator stop-loss is
    /// enforced, fills are tracked for display.
    async fn advance_manual(mut self, ctx: &TickCtx) -> Result<Option<Position>> {
        self.current_price = ctx.current_price;
        self.refresh_error_flag(ctx);

        if let Some(pct) = ctx.stop_loss_override {
            self.sl_percent = Some(pct);
            let factor = match self.side {
                PositionSide::Long => Decimal::ONE + pct / dec!(100),
                PositionSide::Short => Decimal::ONE - pct / dec!(100),
            };
            self.sl_price = Some(round_to(self.avg_price * factor, self.price_precision));
        }

        let signed_qty = ctx.signed_qty();
        if let Some(sl_price) = self.sl_price {
            let breached = match self.side {
                PositionSide::Long => self.current_price < sl_price,
                PositionSide::Short => self.current_price > sl_price,
            };
            if breached && signed_qty != Decimal::ZERO {
                let qty = round_to(signed_qty.abs(), self.quantity_precision);
                ctx.gateway
                    .create_market_order(&self.symbol, self.side.reduce_side(), qty)
                    .await?;
                log::info!(
                    "[POSITION] {} manual stop-loss hit at {}, closed {}",
                    self.symbol,
                    sl_price,
                    qty
                );
                return Ok(None);
            }
        }

        self.absorb_external_fills(ctx).await?;
        self.avg_price = ladder::avg_price(&self);
        self.calc_profit = Some(round_to(
            (self.current_price - self.avg_price) * signed_qty,
            1,
        ));
        if self.avg_price > Decimal::ZERO && self.current_price > Decimal::ZERO {
            let ratio = match self.side {
                PositionSide::Long => self.current_price / self.avg_price,
                PositionSide::Short => self.avg_price / self.current_price,
            };
            self.price_change = Some(round_to((ratio - Decimal::ONE) * dec!(100), 1));
        }

        if signed_qty == Decimal::ZERO {
            return Ok(None);
        }
        Ok(Some(self))
    }

    /// Picks up fills the operator placed directly on the exchange since
    /// this position was admitted, so the averages stay honest.
    async fn absorb_external_fills(&mut self, ctx: &TickCtx) -> Result<()> {
        let orders = ctx.gateway.get_orders(&self.symbol).await?;
        for order in orders {
            if order.status != OrderStatus::Filled || order.update_time <= self.created_at {
                continue;
            }
            let known = self
                .filled_dca_orders
                .iter()
                .chain(self.filled_cut_orders.iter())
                .any(|o| o.order_id == order.order_id);
            if known {
                continue;
            }
            if order.side == self.side.accumulate_side() {
                self.filled_dca_orders.push(order);
            } else {
                self.filled_cut_orders.push(order);
            }
        }
        Ok(())
    }

    fn refresh_error_flag(&mut self, ctx: &TickCtx) {
        let signed_qty = ctx.signed_qty();
        let mismatched = signed_qty != Decimal::ZERO && self.side.contradicts(signed_qty);
        if mismatched && !self.error {
            log::error!(
                "[POSITION] {} direction mismatch: local {:?}, exchange qty {}",
                self.symbol,
                self.side,
                signed_qty
            );
            notify_direction_mismatch(&self.symbol, signed_qty);
        }
        self.error = mismatched;
    }

    fn check_profit_trigger(&mut self, cfg: &LadderParams) -> bool {
        let trigger = ladder::profit_trigger_price(self, cfg);
        self.profit_trigger_price = Some(trigger);
        match self.side {
            PositionSide::Long => self.current_price > trigger,
            PositionSide::Short => self.current_price < trigger,
        }
    }

    fn enter_profit_phase(&mut self, min_profit: Decimal) {
        let factor = match self.side {
            PositionSide::Long => Decimal::ONE + min_profit,
            PositionSide::Short => Decimal::ONE - min_profit,
        };
        self.sl_price = Some(round_to(self.avg_price * factor, self.price_precision));
        self.max_price = Some(self.current_price);
        self.status = Status::Profit;
        log::info!(
            "[POSITION] {} entering profit trail, sl={:?} at price {}",
            self.symbol,
            self.sl_price,
            self.current_price
        );
    }

    /// One-way ratchet: a new extreme beyond the buffer tightens the stop by
    /// one profit_ratio step; crossing back through it closes everything.
    async fn manage_profit(&mut self, ctx: &TickCtx) -> Result<bool> {
        let cfg = &ctx.ladder;
        let max_price = self.max_price.unwrap_or(self.current_price);
        let sl_price = match self.sl_price {
            Some(v) => v,
            None => return Ok(false),
        };

        let (new_extreme, next_sl) = match self.side {
            PositionSide::Long => (
                self.current_price > max_price * (Decimal::ONE + cfg.stop_limit_distance),
                sl_price * (Decimal::ONE + cfg.profit_ratio),
            ),
            PositionSide::Short => (
                self.current_price < max_price * (Decimal::ONE - cfg.stop_limit_distance),
                sl_price * (Decimal::ONE - cfg.profit_ratio),
            ),
        };
        if new_extreme {
            self.max_price = Some(self.current_price);
            self.sl_price = Some(next_sl);
        }

        let sl_price = self.sl_price.unwrap_or(sl_price);
        let stopped = match self.side {
            PositionSide::Long => sl_price > self.current_price,
            PositionSide::Short => sl_price < self.current_price,
        };
        if !stopped {
            return Ok(false);
        }

        let qty = round_to(ctx.signed_qty().abs(), self.quantity_precision);
        let close_order = ctx
            .gateway
            .create_market_order(&self.symbol, self.side.reduce_side(), qty)
            .await?;
        let profit = ladder::realized_profit(self, &close_order);
        log::info!(
            "[POSITION] {} profit trail stop hit at {}, closed {} (pnl {})",
            self.symbol,
            sl_price,
            qty,
            profit
        );
        ctx.journal
            .record(OrderKind::Profit, close_order, Some(profit));
        Ok(true)
    }

    async fn manage_dca_order(&mut self, ctx: &TickCtx) -> Result<()> {
        let cfg = &ctx.ladder;
        if let Some(open) = self.dca_order.clone() {
            let Some(order) = ctx.gateway.get_order(&self.symbol, &open.order_id).await? else {
                return Ok(());
            };

            if order.status == OrderStatus::Filled {
                ctx.journal.record(OrderKind::Dca, order.clone(), None);
                self.filled_dca_orders.push(order);
                self.dca_pending_counter = 0;
                self.dca_count += 1;
                self.avg_price = ladder::avg_price(self);
                self.dca_price = ladder::dca_price(self, cfg);
                self.dca_price_fixed = self.dca_price;
                self.dca_order = None;
                self.cut_price = ladder::cut_price(self, cfg);
                self.cut_price_fixed = self.cut_price;
                self.status = Status::Dca;
                return Ok(());
            }

            let walked_away = match self.side {
                PositionSide::Long => {
                    self.current_price
                        < self.dca_price_fixed
                            * (Decimal::ONE - cfg.stop_limit_distance - cfg.stop_prices_distance)
                }
                PositionSide::Short => {
                    self.current_price
                        > self.dca_price_fixed
                            * (Decimal::ONE + cfg.stop_limit_distance + cfg.stop_prices_distance)
                }
            };
            if !walked_away {
                return Ok(());
            }
            if order.status != OrderStatus::Canceled {
                self.cancel_order(ctx, &open.order_id).await?;
            }
            match self.side {
                PositionSide::Long => {
                    self.dca_price *= Decimal::ONE - cfg.profit_ratio;
                    self.dca_price_fixed *= Decimal::ONE - cfg.stop_prices_distance;
                }
                PositionSide::Short => {
                    self.dca_price *= Decimal::ONE + cfg.profit_ratio;
                    self.dca_price_fixed *= Decimal::ONE + cfg.stop_prices_distance;
                }
            }
            self.dca_pending_counter += 1;
            log::debug!(
                "[ORDER] {} walking dca order to {} (attempt {})",
                self.symbol,
                round_to(self.dca_price, self.price_precision),
                self.dca_pending_counter
            );
            let qty = ladder::dca_qty(self, cfg);
            let stop_price = round_to(self.dca_price, self.price_precision);
            self.dca_order = Some(
                self.place_stop_or_market(ctx, self.side.accumulate_side(), qty, stop_price)
                    .await?,
            );
            return Ok(());
        }

        let armed = match self.side {
            PositionSide::Long => {
                self.current_price < self.dca_price * (Decimal::ONE - cfg.stop_limit_distance)
            }
            PositionSide::Short => {
                self.current_price > self.dca_price * (Decimal::ONE + cfg.stop_limit_distance)
            }
        };
        if armed {
            let qty = ladder::dca_qty(self, cfg);
            let stop_price = round_to(self.dca_price, self.price_precision);
            self.dca_order = Some(
                self.place_stop_or_market(ctx, self.side.accumulate_side(), qty, stop_price)
                    .await?,
            );
        }
        Ok(())
    }

    async fn manage_cut_order(&mut self, ctx: &TickCtx) -> Result<()> {
        let cfg = &ctx.ladder;
        if let Some(open) = self.cut_order.clone() {
            let Some(order) = ctx.gateway.get_order(&self.symbol, &open.order_id).await? else {
                return Ok(());
            };

            if order.status == OrderStatus::Filled {
                ctx.journal.record(OrderKind::Cut, order.clone(), None);
                self.cut_pending_counter = 0;
                self.filled_cut_orders.push(order);
                self.cut_order = None;
                self.cut_minus_dca += 1;
                self.avg_price = ladder::avg_price(self);
                self.cut_price = ladder::cut_price(self, cfg);
                self.cut_price_fixed = self.cut_price;
                self.child_dca_price = ladder::child_dca_price(self);
                self.child_dca_price_fixed = self.child_dca_price;
                return Ok(());
            }

            let (Some(cut_price), Some(cut_fixed)) = (self.cut_price, self.cut_price_fixed) else {
                return Ok(());
            };
            let walked_away = match self.side {
                PositionSide::Long => {
                    self.current_price
                        > cut_fixed
                            * (Decimal::ONE + cfg.stop_limit_distance + cfg.stop_prices_distance)
                }
                PositionSide::Short => {
                    self.current_price
                        < cut_fixed
                            * (Decimal::ONE - cfg.stop_limit_distance - cfg.stop_prices_distance)
                }
            };
            if !walked_away {
                return Ok(());
            }
            if order.status != OrderStatus::Canceled {
                self.cancel_order(ctx, &open.order_id).await?;
            }
            let (next_cut, next_fixed) = match self.side {
                PositionSide::Long => (
                    cut_price * (Decimal::ONE + cfg.profit_ratio),
                    cut_fixed * (Decimal::ONE + cfg.stop_prices_distance),
                ),
                PositionSide::Short => (
                    cut_price * (Decimal::ONE - cfg.profit_ratio),
                    cut_fixed * (Decimal::ONE - cfg.stop_prices_distance),
                ),
            };
            self.cut_price = Some(round_to(next_cut, self.price_precision));
            self.cut_price_fixed = Some(round_to(next_fixed, self.price_precision));
            self.cut_pending_counter += 1;
            let qty = ladder::cut_qty(self, cfg);
            let stop_price = round_to(next_cut, self.price_precision);
            self.cut_order = Some(
                self.place_stop_or_market(ctx, self.side.reduce_side(), qty, stop_price)
                    .await?,
            );
            return Ok(());
        }

        let Some(cut_price) = self.cut_price else {
            return Ok(());
        };
        let armed = match self.side {
            PositionSide::Long => {
                self.current_price > cut_price * (Decimal::ONE + cfg.stop_limit_distance)
            }
            PositionSide::Short => {
                self.current_price < cut_price * (Decimal::ONE - cfg.stop_limit_distance)
            }
        };
        if armed {
            let qty = ladder::cut_qty(self, cfg);
            let stop_price = round_to(cut_price, self.price_precision);
            self.cut_order = Some(
                self.place_stop_or_market(ctx, self.side.reduce_side(), qty, stop_price)
                    .await?,
            );
        }
        Ok(())
    }

    async fn manage_child_dca_order(&mut self, ctx: &TickCtx) -> Result<()> {
        let cfg = &ctx.ladder;
        if let Some(open) = self.child_dca_order.clone() {
            let Some(order) = ctx.gateway.get_order(&self.symbol, &open.order_id).await? else {
                return Ok(());
            };

            if order.status == OrderStatus::Filled {
                ctx.journal.record(OrderKind::ChildDca, order.clone(), None);
                self.child_dca_pending_counter = 0;
                self.filled_child_dca_orders.push(order);
                self.child_dca_order = None;
                self.cut_minus_dca -= 1;
                self.avg_price = ladder::avg_price(self);
                self.cut_price = ladder::cut_price(self, cfg);
                self.cut_price_fixed = self.cut_price;
                self.child_dca_price = ladder::child_dca_price(self);
                self.child_dca_price_fixed = self.child_dca_price;
                return Ok(());
            }

            let (Some(child_price), Some(child_fixed)) =
                (self.child_dca_price, self.child_dca_price_fixed)
            else {
                return Ok(());
            };
            let walked_away = match self.side {
                PositionSide::Long => {
                    self.current_price
                        < child_fixed
                            * (Decimal::ONE - cfg.stop_limit_distance - cfg.stop_prices_distance)
                }
                PositionSide::Short => {
                    self.current_price
                        > child_fixed
                            * (Decimal::ONE + cfg.stop_limit_distance + cfg.stop_prices_distance)
                }
            };
            if !walked_away {
                return Ok(());
            }
            if order.status != OrderStatus::Canceled {
                self.cancel_order(ctx, &open.order_id).await?;
            }
            let (next_child, next_fixed) = match self.side {
                PositionSide::Long => (
                    child_price * (Decimal::ONE - cfg.profit_ratio),
                    child_fixed * (Decimal::ONE - cfg.stop_prices_distance),
                ),
                PositionSide::Short => (
                    child_price * (Decimal::ONE + cfg.profit_ratio),
                    child_fixed * (Decimal::ONE + cfg.stop_prices_distance),
                ),
            };
            self.child_dca_price = Some(round_to(next_child, self.price_precision));
            self.child_dca_price_fixed = Some(round_to(next_fixed, self.price_precision));
            self.child_dca_pending_counter += 1;
            let qty = ladder::child_dca_qty(self, cfg);
            let stop_price = round_to(next_child, self.price_precision);
            self.child_dca_order = Some(
                self.place_stop_or_market(ctx, self.side.accumulate_side(), qty, stop_price)
                    .await?,
            );
            return Ok(());
        }

        if self.cut_minus_dca <= 0 {
            return Ok(());
        }
        let Some(child_price) = self.child_dca_price else {
            return Ok(());
        };
        let armed = match self.side {
            PositionSide::Long => {
                self.current_price < child_price * (Decimal::ONE - cfg.stop_limit_distance)
            }
            PositionSide::Short => {
                self.current_price > child_price * (Decimal::ONE + cfg.stop_limit_distance)
            }
        };
        if armed {
            let qty = ladder::child_dca_qty(self, cfg);
            let stop_price = round_to(child_price, self.price_precision);
            self.child_dca_order = Some(
                self.place_stop_or_market(ctx, self.side.accumulate_side(), qty, stop_price)
                    .await?,
            );
        }
        Ok(())
    }

    /// Places the rung's stop order; when the market has already crossed the
    /// stop the intended condition is satisfied, so fall back to an
    /// immediate market order of the same size and side.
    async fn place_stop_or_market(
        &self,
        ctx: &TickCtx,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
    ) -> Result<RawOrder, GatewayError> {
        match ctx
            .gateway
            .create_stop_order(&self.symbol, side, qty, stop_price, false)
            .await
        {
            Ok(order) => Ok(order),
            Err(GatewayError::StaleTrigger { .. }) => {
                log::info!(
                    "[ORDER] {} stop {} already crossed, sending market order",
                    self.symbol,
                    stop_price
                );
                ctx.gateway
                    .create_market_order(&self.symbol, side, qty)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// A cancel that finds nothing to cancel means the order is already
    /// resolved one way or the other, which is fine here.
    async fn cancel_order(&self, ctx: &TickCtx, order_id: &str) -> Result<(), GatewayError> {
        match ctx.gateway.cancel_order(&self.symbol, order_id).await? {
            CancelOutcome::Canceled => {}
            CancelOutcome::AlreadyGone => {
                log::debug!("[ORDER] {} cancel of {} found nothing", self.symbol, order_id);
            }
        }
        Ok(())
    }

    /// Recomputes the armed stop prices and the percent distance to the
    /// nearest triggers, for the control surface only.
    fn refresh_display_triggers(&mut self, cfg: &LadderParams) {
        let (toward_trigger, away_from_trigger) = match self.side {
            PositionSide::Long => (
                Decimal::ONE - cfg.stop_limit_distance,
                Decimal::ONE + cfg.stop_limit_distance,
            ),
            PositionSide::Short => (
                Decimal::ONE + cfg.stop_limit_distance,
                Decimal::ONE - cfg.stop_limit_distance,
            ),
        };
        self.dca_stop_price = Some(round_to(self.dca_price * toward_trigger, self.price_precision));
        self.cut_stop_price = self
            .cut_price
            .map(|p| round_to(p * away_from_trigger, self.price_precision));
        self.child_dca_stop_price = self
            .child_dca_price
            .map(|p| round_to(p * toward_trigger, self.price_precision));

        let profit_side = ladder::profit_trigger_price(self, cfg);
        match self.side {
            PositionSide::Long => {
                let mut low = self.dca_price;
                if let Some(child) = self.child_dca_price {
                    if child > low {
                        low = child;
                    }
                }
                low *= Decimal::ONE - cfg.stop_limit_distance;
                let mut high = profit_side;
                if let Some(cut) = self.cut_price {
                    let armed = cut * (Decimal::ONE + cfg.stop_limit_distance);
                    if armed < high {
                        high = armed;
                    }
                }
                if low > Decimal::ZERO && high > Decimal::ZERO {
                    self.to_low =
                        Some(round_to((self.current_price / low - Decimal::ONE) * dec!(100), 1));
                    self.to_high =
                        Some(round_to((Decimal::ONE - self.current_price / high) * dec!(100), 1));
                }
            }
            PositionSide::Short => {
                let mut high = self.dca_price;
                if let Some(child) = self.child_dca_price {
                    if child < high {
                        high = child;
                    }
                }
                high *= Decimal::ONE + cfg.stop_limit_distance;
                let mut low = profit_side;
                if let Some(cut) = self.cut_price {
                    let armed = cut * (Decimal::ONE - cfg.stop_limit_distance);
                    if armed > low {
                        low = armed;
                    }
                }
                if low > Decimal::ZERO && high > Decimal::ZERO {
                    self.to_low =
                        Some(round_to((self.current_price / low - Decimal::ONE) * dec!(100), 1));
                    self.to_high =
                        Some(round_to((Decimal::ONE - self.current_price / high) * dec!(100), 1));
                }
            }
        }
    }
}

#[cfg(test)]
impl Position {
    /// Bare position for tests; fields are filled in by each case.
    pub fn blank(symbol: &str, side: PositionSide, price_precision: u32, qty_precision: u32) -> Self {
        Self {
            id: "test".to_string(),
            symbol: symbol.to_string(),
            side,
            status: Status::Start,
            price_precision,
            quantity_precision: qty_precision,
            entry_price: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            current_price: Decimal::ZERO,
            entry_qty: Decimal::ZERO,
            dca_price: Decimal::ZERO,
            dca_price_fixed: Decimal::ZERO,
            cut_price: None,
            cut_price_fixed: None,
            child_dca_price: None,
            child_dca_price_fixed: None,
            sl_price: None,
            max_price: None,
            profit_trigger_price: None,
            dca_order: None,
            cut_order: None,
            child_dca_order: None,
            filled_dca_orders: Vec::new(),
            filled_cut_orders: Vec::new(),
            filled_child_dca_orders: Vec::new(),
            dca_count: 0,
            cut_minus_dca: 0,
            dca_pending_counter: 0,
            cut_pending_counter: 0,
            child_dca_pending_counter: 0,
            manual: false,
            error: false,
            sl_percent: None,
            created_at: 0,
            dca_stop_price: None,
            cut_stop_price: None,
            child_dca_stop_price: None,
            to_low: None,
            to_high: None,
            calc_profit: None,
            price_change: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::trade::execution::gateway::{BalanceEntry, PriceChangeTicker};

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    /// Scripted gateway: serves a fixed order-status map and records every
    /// write so the tests can assert on the exact calls.
    #[derive(Default)]
    struct ScriptedGateway {
        orders_by_id: Mutex<HashMap<String, RawOrder>>,
        stale_symbols: Mutex<Vec<String>>,
        market_calls: Mutex<Vec<(String, OrderSide, Decimal)>>,
        stop_calls: Mutex<Vec<(String, OrderSide, Decimal, Decimal)>>,
        cancel_calls: Mutex<Vec<String>>,
        all_orders: Mutex<Vec<RawOrder>>,
        next_id: Mutex<u64>,
    }

    impl ScriptedGateway {
        fn set_order(&self, order: RawOrder) {
            self.orders_by_id
                .lock()
                .unwrap()
                .insert(order.order_id.clone(), order);
        }

        fn mint(&self, symbol: &str, side: OrderSide, qty: Decimal, stop: Option<Decimal>) -> RawOrder {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            RawOrder {
                order_id: format!("g-{}", *next),
                symbol: symbol.to_string(),
                side,
                status: if stop.is_some() {
                    OrderStatus::New
                } else {
                    OrderStatus::Filled
                },
                orig_qty: qty,
                price: None,
                avg_price: if stop.is_some() { None } else { Some(dec("100")) },
                stop_price: stop,
                update_time: 0,
            }
        }
    }

    #[async_trait]
    impl ExchangeGateway for ScriptedGateway {
        async fn get_price(&self, _symbol: &str) -> Result<Decimal, GatewayError> {
            Ok(dec("100"))
        }

        async fn get_price_changes(&self) -> Result<Vec<PriceChangeTicker>, GatewayError> {
            Ok(vec![])
        }

        async fn get_precisions(
            &self,
        ) -> Result<HashMap<String, SymbolPrecision>, GatewayError> {
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
            side: OrderSide,
            qty: Decimal,
        ) -> Result<RawOrder, GatewayError> {
            self.market_calls
                .lock()
                .unwrap()
                .push((symbol.to_string(), side, qty));
            Ok(self.mint(symbol, side, qty, None))
        }

        async fn create_stop_order(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            stop_price: Decimal,
            _close_position: bool,
        ) -> Result<RawOrder, GatewayError> {
            if self.stale_symbols.lock().unwrap().iter().any(|s| s == symbol) {
                return Err(GatewayError::StaleTrigger {
                    symbol: symbol.to_string(),
                });
            }
            self.stop_calls
                .lock()
                .unwrap()
                .push((symbol.to_string(), side, qty, stop_price));
            Ok(self.mint(symbol, side, qty, Some(stop_price)))
        }

        async fn cancel_order(
            &self,
            _symbol: &str,
            order_id: &str,
        ) -> Result<CancelOutcome, GatewayError> {
            self.cancel_calls.lock().unwrap().push(order_id.to_string());
            Ok(CancelOutcome::Canceled)
        }

        async fn get_order(
            &self,
            _symbol: &str,
            order_id: &str,
        ) -> Result<Option<RawOrder>, GatewayError> {
            Ok(self.orders_by_id.lock().unwrap().get(order_id).cloned())
        }

        async fn get_orders(&self, _symbol: &str) -> Result<Vec<RawOrder>, GatewayError> {
            Ok(self.all_orders.lock().unwrap().clone())
        }
    }

    fn ctx(
        gateway: Arc<ScriptedGateway>,
        price: Decimal,
        signed_qty: Decimal,
        symbol: &str,
    ) -> TickCtx {
        TickCtx {
            gateway,
            ladder: LadderParams::default(),
            current_price: price,
            exchange_position: if signed_qty == Decimal::ZERO {
                None
            } else {
                Some(ExchangePosition {
                    symbol: symbol.to_string(),
                    position_qty: signed_qty,
                    entry_price: dec("100"),
                    mark_price: price,
                })
            },
            journal: OrderJournal::new(),
            stop_loss_override: None,
        }
    }

    fn short_in_dca(gateway: &ScriptedGateway) -> Position {
        let mut p = Position::blank("AAAUSDT", PositionSide::Short, 2, 3);
        p.status = Status::Dca;
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.current_price = dec("100");
        p.dca_price = dec("103");
        p.dca_price_fixed = dec("103");
        let open = RawOrder {
            order_id: "open-dca".to_string(),
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Sell,
            status: OrderStatus::New,
            orig_qty: dec("0.07"),
            price: None,
            avg_price: None,
            stop_price: Some(dec("103")),
            update_time: 0,
        };
        gateway.set_order(open.clone());
        p.dca_order = Some(open);
        p.filled_dca_orders.push(RawOrder {
            order_id: "dca-fill-1".to_string(),
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Sell,
            status: OrderStatus::Filled,
            orig_qty: dec("0.07"),
            price: None,
            avg_price: Some(dec("102")),
            stop_price: None,
            update_time: 0,
        });
        p.dca_count = 1;
        p
    }

    #[tokio::test]
    async fn short_dca_order_is_walked_when_price_runs_away() {
        let gateway = Arc::new(ScriptedGateway::default());
        let position = short_in_dca(&gateway);
        // 2% above the fixed trigger clears the 1% + 1% reprice band.
        let price = dec("103") * dec("1.021");
        let ctx = ctx(gateway.clone(), price, dec("-1"), "AAAUSDT");

        let next = position.advance(&ctx).await.unwrap().unwrap();

        assert_eq!(gateway.cancel_calls.lock().unwrap().as_slice(), ["open-dca"]);
        let stops = gateway.stop_calls.lock().unwrap();
        assert_eq!(stops.len(), 1);
        // Trigger walked by one profit_ratio step.
        assert_eq!(stops[0].3, dec("103.77"));
        assert_eq!(next.dca_pending_counter, 1);
        assert_eq!(next.dca_price_fixed, dec("103") * dec("1.01"));
    }

    #[tokio::test]
    async fn dca_fill_is_absorbed_and_promotes_to_dca_state() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.current_price = dec("100");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");
        let open = RawOrder {
            order_id: "open-dca".to_string(),
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            orig_qty: dec("1"),
            price: None,
            avg_price: Some(dec("90")),
            stop_price: None,
            update_time: 0,
        };
        gateway.set_order(open.clone());
        p.dca_order = Some(open);

        let ctx = ctx(gateway.clone(), dec("90"), dec("2"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap().unwrap();

        assert_eq!(next.status, Status::Dca);
        assert_eq!(next.dca_count, 1);
        assert_eq!(next.filled_dca_orders.len(), 1);
        assert_eq!(next.avg_price, dec("95"));
        assert!(next.dca_order.is_none());
        assert_eq!(next.dca_pending_counter, 0);
        assert_eq!(ctx.journal.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn profit_stop_breach_closes_remaining_quantity() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.status = Status::Profit;
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1.234");
        p.current_price = dec("104");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");
        p.sl_price = Some(dec("105"));
        p.max_price = Some(dec("108"));

        let ctx = ctx(gateway.clone(), dec("104"), dec("1.234"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap();

        assert!(next.is_none());
        let markets = gateway.market_calls.lock().unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].1, OrderSide::Sell);
        assert_eq!(markets[0].2, dec("1.234"));
        let entries = ctx.journal.snapshot();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].profit.is_some());
    }

    #[tokio::test]
    async fn profit_trail_ratchets_on_new_extreme() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.status = Status::Profit;
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");
        p.sl_price = Some(dec("105"));
        p.max_price = Some(dec("107"));

        // 110 clears 107 * 1.01, so the stop tightens by one step.
        let ctx = ctx(gateway.clone(), dec("110"), dec("1"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap().unwrap();

        assert_eq!(next.max_price, Some(dec("110")));
        assert_eq!(next.sl_price, Some(dec("105") * dec("1.0075")));
        assert!(gateway.market_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_position_flips_to_profit_past_trigger() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");

        let ctx = ctx(gateway.clone(), dec("106.01"), dec("1"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap().unwrap();

        assert_eq!(next.status, Status::Profit);
        assert_eq!(next.sl_price, Some(dec("105")));
        assert_eq!(next.max_price, Some(dec("106.01")));
    }

    #[tokio::test]
    async fn stale_stop_trigger_falls_back_to_market_order() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway
            .stale_symbols
            .lock()
            .unwrap()
            .push("AAAUSDT".to_string());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");

        // Price already below the armed trigger: stop placement is rejected
        // as stale and a market order goes out instead.
        let ctx = ctx(gateway.clone(), dec("93"), dec("1"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap().unwrap();

        assert!(next.dca_order.is_some());
        assert_eq!(gateway.market_calls.lock().unwrap().len(), 1);
        assert!(gateway.stop_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_exchange_quantity_drops_the_position() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");

        let ctx = ctx(gateway, dec("100"), Decimal::ZERO, "AAAUSDT");
        assert!(p.advance(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn direction_mismatch_sets_error_flag() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");

        let ctx = ctx(gateway, dec("100"), dec("-1"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap().unwrap();
        assert!(next.error);
    }

    #[tokio::test]
    async fn manual_stop_loss_closes_at_market() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.manual = true;
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");

        let mut ctx = ctx(gateway.clone(), dec("96"), dec("1"), "AAAUSDT");
        ctx.stop_loss_override = Some(dec("-3"));
        let next = p.advance(&ctx).await.unwrap();

        // sl = 100 * 0.97 = 97 > 96: breached, closed, gone.
        assert!(next.is_none());
        let markets = gateway.market_calls.lock().unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].1, OrderSide::Sell);
    }

    #[tokio::test]
    async fn manual_position_absorbs_external_fills() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.all_orders.lock().unwrap().push(RawOrder {
            order_id: "ext-1".to_string(),
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            orig_qty: dec("1"),
            price: None,
            avg_price: Some(dec("90")),
            stop_price: None,
            update_time: 10,
        });
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.manual = true;
        p.entry_price = dec("100");
        p.avg_price = dec("100");
        p.entry_qty = dec("1");
        p.dca_price = dec("95");
        p.dca_price_fixed = dec("95");
        p.created_at = 5;

        let ctx = ctx(gateway, dec("100"), dec("2"), "AAAUSDT");
        let next = p.advance(&ctx).await.unwrap().unwrap();

        assert_eq!(next.filled_dca_orders.len(), 1);
        assert_eq!(next.avg_price, dec("95"));
    }
}
