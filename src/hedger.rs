// ─────────────────────────────────────────────────────────────────────────────
// hedger.rs — Core Hedging Decision Logic
//
// Pure, per-instrument decision pipeline. Given the refreshed SymbolState it
// returns the cancels and placements for this tick:
//
//   1. imbalance gap from both accounts' absolute notionals and the resting
//      hedge already working on the small side
//   2. direction: equal positions quote both accounts, unequal positions
//      quote only the smaller one, steered by the oldest unmatched lot
//   3. price: sell = ceil_to_tick(max(ask1, guard)),
//             buy  = floor_to_tick(min(bid1, guard))
//   4. size: min(order notional, 2 x gap), floored to the size step
//   5. caps: activity cap (2, or 1 under low diff), total-position bounds,
//      small-side-only exposure
//
// Placement itself (post-only retry, cooldown bookkeeping) lives in
// execution.rs; everything here is synchronous and unit-testable.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::exchange::{Account, BookTop, InstrumentMeta, PerAccount, Side};
use crate::instruments::{ceil_to_tick, floor_to_step, floor_to_tick};
use crate::ledger::LotBook;
use crate::orders::OrderTable;

/// Positions closer together than this are treated as equal.
pub const EQUAL_DUST_USDT: f64 = 1.0;

const SIZE_EPS: f64 = 1e-12;

// ─── Symbol Configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    Increase,
    Decrease,
}

fn default_enabled() -> bool {
    true
}

/// Per-instrument strategy parameters, loaded from the symbols file.
/// Unknown JSON fields are ignored; replaced only by a full reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub instrument: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Nominal per-order size in quote currency.
    pub order_notional_usdt: f64,
    /// Target ceiling for the transient A/B imbalance.
    pub imbalance_limit_usdt: f64,
    /// Cap on abs_a + abs_b in increase mode. 0 = unbounded.
    #[serde(default)]
    pub max_total_position_usdt: f64,
    /// Floor on abs_a + abs_b in decrease mode.
    #[serde(default)]
    pub min_total_position_usdt: f64,
    pub a_side_when_equal: Side,
    pub position_mode: PositionMode,
}

// ─── Symbol State ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct PositionSnapshot {
    /// Signed base units, positive = long.
    pub signed_base: f64,
    pub entry_price: f64,
}

impl PositionSnapshot {
    pub fn abs_notional(&self) -> f64 {
        self.signed_base.abs() * self.entry_price
    }
}

/// Everything the engine knows about one instrument. Lives for the process
/// lifetime; refreshed every tick from gateway queries.
#[derive(Debug)]
pub struct SymbolState {
    pub config: SymbolConfig,
    pub lots: LotBook,
    pub orders: OrderTable,
    pub positions: PerAccount<PositionSnapshot>,
    pub book: Option<BookTop>,
    pub meta: Option<InstrumentMeta>,
    /// Post-only backoff per account, unix seconds.
    pub cooldown_until_s: PerAccount<i64>,
    /// Exchange ids of resting orders we did not place. Never cancelled.
    pub foreign_orders: HashSet<String>,
}

impl SymbolState {
    pub fn new(config: SymbolConfig) -> Self {
        Self {
            config,
            lots: LotBook::new(),
            orders: OrderTable::new(),
            positions: PerAccount::default(),
            book: None,
            meta: None,
            cooldown_until_s: PerAccount::default(),
            foreign_orders: HashSet::new(),
        }
    }

    pub fn abs_notional(&self, account: Account) -> f64 {
        self.positions.get(account).abs_notional()
    }

    pub fn in_cooldown(&self, account: Account, now_s: i64) -> bool {
        now_s < *self.cooldown_until_s.get(account)
    }
}

// ─── Decisions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PlacePlan {
    pub account: Account,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    /// The protection bound a re-priced retry must keep honouring.
    pub guard_price: f64,
    /// True when the plan consumes a pending opposing lot rather than adding
    /// fresh exposure.
    pub corrective: bool,
}

#[derive(Debug, Clone)]
pub enum HedgeAction {
    Cancel { account: Account, client_id: u64 },
    Place(PlacePlan),
}

/// Conservative quote for one side: the rounded price can never violate the
/// guard it was derived from.
pub fn price_for(side: Side, book: &BookTop, guard: f64, tick: f64) -> f64 {
    match side {
        Side::Sell => ceil_to_tick(book.ask1.max(guard), tick),
        Side::Buy => floor_to_tick(book.bid1.min(guard), tick),
    }
}

/// Converts a quote-notional target into a steppable base size. None when the
/// floored size falls below the instrument minimum.
pub fn size_for(target_notional: f64, price: f64, meta: &InstrumentMeta) -> Option<f64> {
    if target_notional <= 0.0 || price <= 0.0 {
        return None;
    }
    let sized = floor_to_step(target_notional / price, meta.min_size, meta.base_decimals);
    if sized + SIZE_EPS < meta.min_size {
        None
    } else {
        Some(sized)
    }
}

/// Imbalance still uncovered on the small side, after crediting half the
/// resting hedge notional already working there.
pub fn compute_gap(abs_small: f64, abs_large: f64, hedge_open_notional: f64) -> f64 {
    abs_large - (abs_small + hedge_open_notional / 2.0)
}

/// Runs the full decision pipeline for one instrument. Cancels come before
/// placements in the returned list and the executor honours that order.
pub fn decide(state: &SymbolState, single_order_diff_usdt: f64, now_s: i64) -> Vec<HedgeAction> {
    let cfg = &state.config;
    let mut actions = Vec::new();
    if !cfg.enabled {
        return actions;
    }
    let (book, meta) = match (state.book.as_ref(), state.meta.as_ref()) {
        (Some(b), Some(m)) => (b, m),
        _ => return actions,
    };

    let abs_a = state.abs_notional(Account::A);
    let abs_b = state.abs_notional(Account::B);
    let diff = (abs_a - abs_b).abs();

    // Activity cap tightens to one order under low diff; strict inequality,
    // so diff == threshold still allows two.
    let cap = if diff < single_order_diff_usdt { 1 } else { 2 };

    // Cancel-down before any placement, oldest orders first.
    let mut live_counts: PerAccount<usize> = PerAccount::default();
    for account in [Account::A, Account::B] {
        let live = state.orders.live_strategy(account);
        let mut count = live.len();
        if count > cap {
            for order in live.iter().take(count - cap) {
                log::info!(
                    "[HEDGER] {} {} over cap {} — cancelling client_id={}",
                    cfg.instrument, account.label(), cap, order.client_id
                );
                actions.push(HedgeAction::Cancel { account, client_id: order.client_id });
            }
            count = cap;
        }
        *live_counts.get_mut(account) = count;
    }

    // Signed notional impact of placements already planned this tick; keeps
    // the total-position projection honest when both accounts quote.
    let mut planned_delta = 0.0;

    if diff <= EQUAL_DUST_USDT {
        // Positions equal: both accounts may work one order each.
        if cfg.position_mode == PositionMode::Decrease
            && abs_a <= EQUAL_DUST_USDT
            && abs_b <= EQUAL_DUST_USDT
        {
            return actions;
        }
        let a_side = match cfg.position_mode {
            PositionMode::Increase => cfg.a_side_when_equal,
            PositionMode::Decrease => cfg.a_side_when_equal.other(),
        };

        for (account, side) in [(Account::A, a_side), (Account::B, a_side.other())] {
            if state.in_cooldown(account, now_s) {
                log::debug!(
                    "[HEDGER] {} {} in post-only cooldown — skipping",
                    cfg.instrument, account.label()
                );
                continue;
            }
            if *live_counts.get(account) >= cap {
                continue;
            }
            // The pair's own quotes protect each other: A's buy at bid1 is
            // covered by B's sell at ask1 (ask1 >= bid1).
            let guard = match side {
                Side::Sell => book.ask1,
                Side::Buy => book.bid1,
            };
            let price = price_for(side, book, guard, meta.tick_size);
            let mut target = cfg.order_notional_usdt;
            if cfg.imbalance_limit_usdt > 0.0 {
                target = target.min(cfg.imbalance_limit_usdt);
            }
            let size = match size_for(target, price, meta) {
                Some(s) => s,
                None => {
                    log::debug!(
                        "[HEDGER] {} {} target {:.2}U below min size — skipping",
                        cfg.instrument, account.label(), target
                    );
                    continue;
                }
            };
            let notional = size * price;
            let delta = position_delta(state.positions.get(account).signed_base, side, notional);
            if !total_bound_ok(cfg, abs_a + abs_b, planned_delta, delta, false) {
                continue;
            }
            planned_delta += delta;
            actions.push(HedgeAction::Place(PlacePlan {
                account,
                side,
                price,
                size,
                guard_price: guard,
                corrective: false,
            }));
        }
        return actions;
    }

    // Positions differ: only the small account may add orders this tick.
    let (small, large) = if abs_a < abs_b {
        (Account::A, Account::B)
    } else {
        (Account::B, Account::A)
    };
    if state.in_cooldown(small, now_s) {
        return actions;
    }

    // Direction: pair the oldest unmatched lot on the large account, or fall
    // back to mirroring the large position itself.
    let (side, guard, corrective) = match state.lots.oldest_for_account(large) {
        Some(lot) => (lot.side.other(), lot.guard_price, true),
        None => {
            let large_pos = state.positions.get(large);
            if large_pos.signed_base.abs() <= SIZE_EPS {
                return actions;
            }
            let side = if large_pos.signed_base > 0.0 { Side::Sell } else { Side::Buy };
            (side, large_pos.entry_price, false)
        }
    };

    let abs_small = abs_a.min(abs_b);
    let abs_large = abs_a.max(abs_b);
    let hedge_open = state.orders.hedge_open_notional(small, side);
    let gap = compute_gap(abs_small, abs_large, hedge_open);
    if gap <= 0.0 {
        return actions;
    }
    if *live_counts.get(small) >= cap {
        return actions;
    }

    let price = price_for(side, book, guard, meta.tick_size);
    // Last-lap shrink: never post more than twice the remaining gap.
    let target = cfg.order_notional_usdt.min(2.0 * gap);
    let size = match size_for(target, price, meta) {
        Some(s) => s,
        None => {
            log::debug!(
                "[HEDGER] {} {} shrunk target {:.2}U below min size — skipping",
                cfg.instrument, small.label(), target
            );
            return actions;
        }
    };
    let notional = size * price;
    let delta = position_delta(state.positions.get(small).signed_base, side, notional);
    if !total_bound_ok(cfg, abs_a + abs_b, planned_delta, delta, corrective) {
        return actions;
    }

    actions.push(HedgeAction::Place(PlacePlan {
        account: small,
        side,
        price,
        size,
        guard_price: guard,
        corrective,
    }));
    actions
}

/// Signed change to the account's absolute notional if the order fully fills.
fn position_delta(signed_base: f64, side: Side, notional: f64) -> f64 {
    let expands = signed_base.abs() <= SIZE_EPS || (signed_base > 0.0) == (side == Side::Buy);
    if expands {
        notional
    } else {
        -notional
    }
}

/// Total-position bounds, projected over everything planned this tick.
/// In increase mode only a corrective that does not grow the gross total may
/// pass above the cap; an expanding hedge never may.
fn total_bound_ok(
    cfg: &SymbolConfig,
    current_total: f64,
    planned_delta: f64,
    delta: f64,
    corrective: bool,
) -> bool {
    let projected = current_total + planned_delta + delta;
    match cfg.position_mode {
        PositionMode::Increase => {
            if corrective && delta <= 0.0 {
                return true;
            }
            if cfg.max_total_position_usdt > 0.0 && projected > cfg.max_total_position_usdt {
                log::debug!(
                    "[HEDGER] {} projected total {:.2}U over cap {:.2}U — skipping",
                    cfg.instrument, projected, cfg.max_total_position_usdt
                );
                return false;
            }
            true
        }
        PositionMode::Decrease => {
            if projected < cfg.min_total_position_usdt {
                log::debug!(
                    "[HEDGER] {} projected total {:.2}U under floor {:.2}U — skipping",
                    cfg.instrument, projected, cfg.min_total_position_usdt
                );
                return false;
            }
            true
        }
    }
}
