use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::position::{Position, PositionSide};
use crate::trade::execution::gateway::RawOrder;

/// Process-wide ladder policy. Read at every tick and replaceable through
/// the control handle; the pure functions below never touch anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderParams {
    /// Budget per DCA rung; the last value repeats for deeper rungs.
    pub dca_budgets: Vec<Decimal>,
    /// Offset from current price per rung; the last value repeats.
    pub dca_percentages: Vec<Decimal>,
    /// Step applied when walking triggers and ratcheting the profit stop.
    pub profit_ratio: Decimal,
    pub min_profit: Decimal,
    pub min_profit_after_dca: Decimal,
    /// Buffer between a trigger price and the price that arms it.
    pub stop_limit_distance: Decimal,
    /// Minimum repricing step before an open order is cancel-and-replaced.
    pub stop_prices_distance: Decimal,
    /// Budget growth per missed fill attempt.
    pub increase_vol_param: Decimal,
    pub base_budget: Decimal,
    pub max_entry_budget_diff: Decimal,
    /// Minimum notional for an exposure to count as a position, and the
    /// exchange minimum an order must clear.
    pub min_budget: Decimal,
    pub long_num_pos: usize,
    pub short_num_pos: usize,
    /// 24h percent-change magnitude required before a symbol becomes an
    /// entry candidate.
    pub entry_change_threshold: Decimal,
}

impl Default for LadderParams {
    fn default() -> Self {
        Self {
            dca_budgets: vec![dec!(7), dec!(7), dec!(7)],
            dca_percentages: vec![dec!(0.02), dec!(0.03), dec!(0.05)],
            profit_ratio: dec!(0.0075),
            min_profit: dec!(0.05),
            min_profit_after_dca: dec!(0.05),
            stop_limit_distance: dec!(0.01),
            stop_prices_distance: dec!(0.01),
            increase_vol_param: dec!(0.5),
            base_budget: dec!(7),
            max_entry_budget_diff: dec!(5),
            min_budget: dec!(6),
            long_num_pos: 2,
            short_num_pos: 2,
            entry_change_threshold: dec!(10),
        }
    }
}

pub fn round_to(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

pub fn ceil_to(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::ToPositiveInfinity)
}

/// Weighted-average cost basis of what remains open. Entry plus DCA and
/// child-DCA fills accumulate, cut fills reduce; when anything has been cut,
/// the realized gain or loss of the sold quantity is redistributed across
/// the remainder so the average keeps matching the true remaining cost
/// basis instead of a naive weighted mean.
pub fn avg_price(position: &Position) -> Decimal {
    let mut acc_budget = position.entry_price * position.entry_qty;
    let mut acc_qty = position.entry_qty;
    for order in position
        .filled_dca_orders
        .iter()
        .chain(position.filled_child_dca_orders.iter())
    {
        acc_budget += order.fill_price() * order.orig_qty;
        acc_qty += order.orig_qty;
    }

    let mut red_budget = Decimal::ZERO;
    let mut red_qty = Decimal::ZERO;
    for order in &position.filled_cut_orders {
        red_budget += order.fill_price() * order.orig_qty;
        red_qty += order.orig_qty;
    }

    if acc_qty <= Decimal::ZERO {
        return position.entry_price;
    }
    let acc_avg = acc_budget / acc_qty;
    let remaining = acc_qty - red_qty;
    if red_qty <= Decimal::ZERO || remaining <= Decimal::ZERO {
        return round_to(acc_avg, position.price_precision);
    }

    let red_avg = red_budget / red_qty;
    // Works for both sides: on a LONG a cut above the accumulate average
    // lowers the remaining basis, on a SHORT a buyback below it raises it.
    let adjusted = match position.side {
        PositionSide::Long => acc_avg - (red_avg - acc_avg) * red_qty / remaining,
        PositionSide::Short => acc_avg + (acc_avg - red_avg) * red_qty / remaining,
    };
    round_to(adjusted, position.price_precision)
}

/// Realized profit of a closed position, in quote units.
pub fn realized_profit(position: &Position, close_order: &RawOrder) -> Decimal {
    let mut acc_total = position.entry_price * position.entry_qty;
    for order in position
        .filled_dca_orders
        .iter()
        .chain(position.filled_child_dca_orders.iter())
    {
        acc_total += order.fill_price() * order.orig_qty;
    }
    let mut red_total = Decimal::ZERO;
    for order in &position.filled_cut_orders {
        red_total += order.fill_price() * order.orig_qty;
    }
    red_total += close_order.fill_price() * close_order.orig_qty;

    match position.side {
        PositionSide::Long => red_total - acc_total,
        PositionSide::Short => acc_total - red_total,
    }
}

pub fn dca_price(position: &Position, cfg: &LadderParams) -> Decimal {
    let idx = (position.dca_count as usize).min(cfg.dca_percentages.len().saturating_sub(1));
    let pct = cfg
        .dca_percentages
        .get(idx)
        .copied()
        .unwrap_or(Decimal::ZERO);
    let raw = match position.side {
        PositionSide::Long => position.current_price * (Decimal::ONE - pct),
        PositionSide::Short => position.current_price * (Decimal::ONE + pct),
    };
    round_to(raw, position.price_precision)
}

/// Empirically tuned step table: how many cuts a given depth of filled DCA
/// rungs supports. Kept verbatim; depths past the table clamp to the last
/// row.
fn cuts_for_dca_fills(filled_dca: usize) -> i64 {
    match filled_dca {
        0 => 0,
        1 => 0,
        2 => 1,
        3 => 2,
        4 => 2,
        5 => 3,
        6 => 4,
        7 => 4,
        8 => 5,
        9 => 6,
        _ => 6,
    }
}

pub fn cut_price(position: &Position, cfg: &LadderParams) -> Option<Decimal> {
    let num_cut = cuts_for_dca_fills(position.filled_dca_orders.len())
        + position.filled_child_dca_orders.len() as i64
        - position.filled_cut_orders.len() as i64;
    if num_cut <= 0 {
        return None;
    }
    let steps = Decimal::from(num_cut + 1);
    let raw = match position.side {
        PositionSide::Long => {
            let target = position.avg_price * (Decimal::ONE + cfg.min_profit_after_dca);
            position.current_price + (target - position.current_price) / steps
        }
        PositionSide::Short => {
            let target = position.avg_price * (Decimal::ONE - cfg.min_profit_after_dca);
            position.current_price - (position.current_price - target) / steps
        }
    };
    Some(round_to(raw, position.price_precision))
}

pub fn child_dca_price(position: &Position) -> Option<Decimal> {
    let outstanding = position.filled_cut_orders.len() as i64
        - position.filled_child_dca_orders.len() as i64;
    if outstanding <= 0 {
        return None;
    }
    let steps = Decimal::from(outstanding + 1);
    let raw = match position.side {
        PositionSide::Long => {
            let step = (position.current_price - position.dca_price) / steps;
            position.current_price - step
        }
        PositionSide::Short => {
            let step = (position.dca_price - position.current_price) / steps;
            position.current_price + step
        }
    };
    Some(round_to(raw, position.price_precision))
}

/// Rounds a raw quantity to the lot precision, but never below the exchange
/// minimum notional: when nearest-rounding would produce a rejected
/// sub-minimum order, round up instead.
pub fn best_qty(qty: Decimal, qty_precision: u32, price: Decimal, min_notional: Decimal) -> Decimal {
    let nearest = round_to(qty, qty_precision);
    if nearest * price < min_notional {
        return ceil_to(qty, qty_precision);
    }
    nearest
}

fn pending_boost(pending: u32, cfg: &LadderParams) -> Decimal {
    let first_rung = cfg.dca_budgets.first().copied().unwrap_or(Decimal::ZERO);
    (Decimal::from(pending) * cfg.increase_vol_param).min(first_rung)
}

pub fn dca_qty(position: &Position, cfg: &LadderParams) -> Decimal {
    let idx = (position.dca_count as usize).min(cfg.dca_budgets.len().saturating_sub(1));
    let budget = cfg.dca_budgets.get(idx).copied().unwrap_or(Decimal::ZERO)
        + pending_boost(position.dca_pending_counter, cfg);
    best_qty(
        budget / position.current_price,
        position.quantity_precision,
        position.current_price,
        cfg.min_budget,
    )
}

pub fn cut_qty(position: &Position, cfg: &LadderParams) -> Decimal {
    let budget = cfg.dca_budgets.first().copied().unwrap_or(Decimal::ZERO)
        + pending_boost(position.cut_pending_counter, cfg);
    best_qty(
        budget / position.current_price,
        position.quantity_precision,
        position.current_price,
        cfg.min_budget,
    )
}

pub fn child_dca_qty(position: &Position, cfg: &LadderParams) -> Decimal {
    let budget = cfg.dca_budgets.first().copied().unwrap_or(Decimal::ZERO)
        + pending_boost(position.child_dca_pending_counter, cfg);
    best_qty(
        budget / position.current_price,
        position.quantity_precision,
        position.current_price,
        cfg.min_budget,
    )
}

/// The price beyond which the position flips to the PROFIT phase. Uses the
/// post-DCA minimum once any DCA rung has filled.
pub fn profit_trigger_price(position: &Position, cfg: &LadderParams) -> Decimal {
    let min_profit = if position.filled_dca_orders.is_empty() {
        cfg.min_profit
    } else {
        cfg.min_profit_after_dca
    };
    let raw = match position.side {
        PositionSide::Long => {
            position.avg_price * (Decimal::ONE + min_profit + cfg.stop_limit_distance)
        }
        PositionSide::Short => {
            position.avg_price * (Decimal::ONE - min_profit - cfg.stop_limit_distance)
        }
    };
    round_to(raw, position.price_precision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Status;
    use crate::trade::execution::gateway::{OrderSide, OrderStatus};

    fn fill(side: OrderSide, price: Decimal, qty: Decimal) -> RawOrder {
        RawOrder {
            order_id: format!("f-{}-{}", price, qty),
            symbol: "AAAUSDT".to_string(),
            side,
            status: OrderStatus::Filled,
            orig_qty: qty,
            price: None,
            avg_price: Some(price),
            stop_price: None,
            update_time: 0,
        }
    }

    fn long_position(entry: Decimal, qty: Decimal) -> Position {
        let mut p = Position::blank("AAAUSDT", PositionSide::Long, 2, 3);
        p.entry_price = entry;
        p.avg_price = entry;
        p.entry_qty = qty;
        p.current_price = entry;
        p.dca_price = entry;
        p.status = Status::Start;
        p
    }

    #[test]
    fn avg_price_is_weighted_average_without_cuts() {
        let mut p = long_position(dec!(100), dec!(1));
        p.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(90), dec!(1)));
        assert_eq!(avg_price(&p), dec!(95));
    }

    #[test]
    fn avg_price_ignores_fill_order() {
        let mut a = long_position(dec!(100), dec!(1));
        a.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(90), dec!(2)));
        a.filled_child_dca_orders
            .push(fill(OrderSide::Buy, dec!(80), dec!(1)));

        let mut b = long_position(dec!(100), dec!(1));
        b.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(80), dec!(1)));
        b.filled_child_dca_orders
            .push(fill(OrderSide::Buy, dec!(90), dec!(2)));

        assert_eq!(avg_price(&a), avg_price(&b));
    }

    #[test]
    fn avg_price_redistributes_realized_cut_gain() {
        // Entry 100 x2, cut at 110 x1: remaining basis 100 - 10*1/1 = 90.
        let mut p = long_position(dec!(100), dec!(2));
        p.filled_cut_orders
            .push(fill(OrderSide::Sell, dec!(110), dec!(1)));
        assert_eq!(avg_price(&p), dec!(90));
    }

    #[test]
    fn avg_price_short_mirrors_redistribution() {
        // Short entry 100 x2, buyback at 90 x1: remaining basis rises to 110.
        let mut p = long_position(dec!(100), dec!(2));
        p.side = PositionSide::Short;
        p.filled_cut_orders
            .push(fill(OrderSide::Buy, dec!(90), dec!(1)));
        assert_eq!(avg_price(&p), dec!(110));
    }

    #[test]
    fn cut_price_undefined_until_table_allows_it() {
        let cfg = LadderParams::default();
        let mut p = long_position(dec!(100), dec!(1));
        p.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(95), dec!(1)));
        assert!(cut_price(&p, &cfg).is_none());

        p.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(90), dec!(1)));
        // Two DCA fills, no cuts, no child fills: exactly one cut allowed.
        assert!(cut_price(&p, &cfg).is_some());
    }

    #[test]
    fn cut_price_splits_distance_to_profit_target() {
        let cfg = LadderParams::default();
        let mut p = long_position(dec!(100), dec!(1));
        p.avg_price = dec!(100);
        p.current_price = dec!(95);
        p.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(95), dec!(1)));
        p.filled_dca_orders
            .push(fill(OrderSide::Buy, dec!(90), dec!(1)));
        // target 105, two steps of 5: nearest step is 100.
        assert_eq!(cut_price(&p, &cfg), Some(dec!(100)));
    }

    #[test]
    fn child_dca_price_interpolates_toward_dca_trigger() {
        let mut p = long_position(dec!(100), dec!(1));
        p.current_price = dec!(100);
        p.dca_price = dec!(90);
        p.filled_cut_orders
            .push(fill(OrderSide::Sell, dec!(104), dec!(1)));
        // One outstanding cut: one step of (100-90)/2 below current.
        assert_eq!(child_dca_price(&p), Some(dec!(95)));
    }

    #[test]
    fn profit_trigger_boundary() {
        let cfg = LadderParams::default();
        let mut p = long_position(dec!(100), dec!(1));
        p.avg_price = dec!(100);
        // min_profit 0.05 plus 0.01 buffer on 100 arms at 106.
        assert_eq!(profit_trigger_price(&p, &cfg), dec!(106));

        p.current_price = dec!(106.01);
        assert!(p.current_price > profit_trigger_price(&p, &cfg));
        p.current_price = dec!(105.99);
        assert!(p.current_price <= profit_trigger_price(&p, &cfg));
    }

    #[test]
    fn best_qty_rounds_up_below_min_notional() {
        // 0.0004 at 3dp rounds to 0.000 whose notional is 0: must round up.
        let qty = best_qty(dec!(0.0004), 3, dec!(10000), dec!(6));
        assert_eq!(qty, dec!(0.001));
        assert!(qty * dec!(10000) >= dec!(6));
    }

    #[test]
    fn best_qty_keeps_nearest_when_notional_clears_minimum() {
        let qty = best_qty(dec!(0.0702), 2, dec!(100), dec!(6));
        assert_eq!(qty, dec!(0.07));
    }

    #[test]
    fn dca_qty_growth_is_capped_by_first_rung_budget() {
        let cfg = LadderParams::default();
        let mut p = long_position(dec!(7), dec!(1));
        p.current_price = dec!(7);
        p.dca_pending_counter = 100;
        // Budget 7 + min(100*0.5, 7) = 14 -> qty 2.
        assert_eq!(dca_qty(&p, &cfg), dec!(2));
    }

    #[test]
    fn dca_price_clamps_to_last_rung_percentage() {
        let cfg = LadderParams::default();
        let mut p = long_position(dec!(100), dec!(1));
        p.dca_count = 9;
        assert_eq!(dca_price(&p, &cfg), dec!(95));
    }
}
