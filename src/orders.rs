// ─────────────────────────────────────────────────────────────────────────────
// orders.rs — Managed-Order Table
//
// Tracks every strategy order by its locally assigned numeric client id and
// reconciles the table against the exchange's open-orders view each tick:
//
//   - traded-size growth becomes a FillDelta (lotted at the limit price)
//   - sentinel acks are aligned to real exchange ids on first sighting
//   - orders missing from the view get one extra tick of grace, then go
//     terminal (Filled when fully traded, Cancelled otherwise)
//   - partials older than the timeout are reaped: the untraded remainder
//     stops counting toward the open hedge, the order itself keeps resting
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;

use crate::exchange::{is_sentinel_order_id, Account, OpenOrderView, Side};

const SIZE_EPS: f64 = 1e-12;

/// Client ids in this range (and only this range) belong to the strategy.
pub const STRATEGY_CLIENT_ID_BASE: u64 = 9_000_000_000_000;
pub const STRATEGY_CLIENT_ID_SPAN: u64 = 100_000_000_000;

pub fn is_strategy_client_id(client_id: u64) -> bool {
    (STRATEGY_CLIENT_ID_BASE..STRATEGY_CLIENT_ID_BASE + STRATEGY_CLIENT_ID_SPAN)
        .contains(&client_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    /// Submitted, ack not yet confirmed on the open-orders view.
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Rejected)
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct ManagedOrder {
    pub client_id: u64,
    /// None until a real (non-sentinel) exchange id is known.
    pub exchange_order_id: Option<String>,
    pub account: Account,
    pub instrument: String,
    pub side: Side,
    pub limit_price: f64,
    pub original_size: f64,
    pub traded_size: f64,
    pub state: OrderState,
    pub created_ts_s: i64,
    pub last_updated_ts_s: i64,
    pub is_strategy: bool,
    /// The lot guard that motivated this order, when hedging a pending lot.
    pub guard_price: Option<f64>,
    /// When the order first went PARTIAL; the reap timeout runs from here.
    pub partial_since_ts_s: Option<i64>,
    /// Partial past the timeout: remainder excluded from the open hedge.
    pub reaped: bool,
    missing_ticks: u8,
}

impl ManagedOrder {
    pub fn new_strategy(
        client_id: u64,
        account: Account,
        instrument: &str,
        side: Side,
        limit_price: f64,
        size: f64,
        guard_price: Option<f64>,
        now_s: i64,
    ) -> Self {
        Self {
            client_id,
            exchange_order_id: None,
            account,
            instrument: instrument.to_string(),
            side,
            limit_price,
            original_size: size,
            traded_size: 0.0,
            state: OrderState::Pending,
            created_ts_s: now_s,
            last_updated_ts_s: now_s,
            is_strategy: true,
            guard_price,
            partial_since_ts_s: None,
            reaped: false,
            missing_ticks: 0,
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.original_size - self.traded_size).max(0.0)
    }

    pub fn remaining_notional(&self) -> f64 {
        self.remaining() * self.limit_price
    }
}

/// A traded-size advance observed during reconciliation. The caller turns
/// this into a fill lot.
#[derive(Debug, Clone)]
pub struct FillDelta {
    pub account: Account,
    pub instrument: String,
    pub side: Side,
    pub size: f64,
    /// Limit price of the order; the sound protection bound for post-only.
    pub price: f64,
}

#[derive(Debug, Default)]
pub struct OrderTable {
    by_client: HashMap<u64, ManagedOrder>,
}

impl OrderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: ManagedOrder) {
        self.by_client.insert(order.client_id, order);
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.by_client.contains_key(&client_id)
    }

    pub fn get(&self, client_id: u64) -> Option<&ManagedOrder> {
        self.by_client.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: u64) -> Option<&mut ManagedOrder> {
        self.by_client.get_mut(&client_id)
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    /// Live strategy orders for one account, oldest first.
    pub fn live_strategy(&self, account: Account) -> Vec<&ManagedOrder> {
        let mut out: Vec<&ManagedOrder> = self
            .by_client
            .values()
            .filter(|o| o.account == account && o.is_strategy && o.state.is_live())
            .collect();
        out.sort_by_key(|o| (o.created_ts_s, o.client_id));
        out
    }

    pub fn live_strategy_count(&self, account: Account) -> usize {
        self.by_client
            .values()
            .filter(|o| o.account == account && o.is_strategy && o.state.is_live())
            .count()
    }

    /// Outstanding resting notional on one (account, side), excluding reaped
    /// partial remainders. Feeds the gap computation.
    pub fn hedge_open_notional(&self, account: Account, side: Side) -> f64 {
        self.by_client
            .values()
            .filter(|o| {
                o.account == account
                    && o.side == side
                    && o.is_strategy
                    && o.state.is_live()
                    && !o.reaped
            })
            .map(|o| o.remaining_notional())
            .sum()
    }

    /// Reconciles one account's tracked orders against the exchange view.
    /// Returns the traded-size deltas observed this tick.
    pub fn reconcile(
        &mut self,
        account: Account,
        seen: &[OpenOrderView],
        now_s: i64,
        partial_timeout_s: i64,
    ) -> Vec<FillDelta> {
        let mut deltas = Vec::new();

        let mut seen_clients: HashMap<u64, &OpenOrderView> = HashMap::new();
        for v in seen {
            if let Some(cid) = v.client_id {
                seen_clients.insert(cid, v);
            }
        }

        for order in self.by_client.values_mut() {
            if order.account != account || order.state.is_terminal() {
                continue;
            }

            match seen_clients.get(&order.client_id) {
                Some(view) => {
                    order.missing_ticks = 0;

                    // Sentinel alignment: first sighting of the real id.
                    if order.exchange_order_id.is_none()
                        && !is_sentinel_order_id(&view.order_id)
                    {
                        log::debug!(
                            "[ORDERS] {} client_id={} aligned to exchange id {}",
                            order.instrument, order.client_id, view.order_id
                        );
                        order.exchange_order_id = Some(view.order_id.clone());
                    }

                    let delta = view.traded - order.traded_size;
                    if delta > SIZE_EPS {
                        deltas.push(FillDelta {
                            account,
                            instrument: order.instrument.clone(),
                            side: order.side,
                            size: delta,
                            price: order.limit_price,
                        });
                        order.traded_size = view.traded.min(order.original_size);
                        order.last_updated_ts_s = now_s;
                    }

                    order.state = if order.traded_size >= order.original_size - SIZE_EPS {
                        OrderState::Filled
                    } else if order.traded_size > SIZE_EPS {
                        OrderState::Partial
                    } else {
                        OrderState::Open
                    };

                    if order.state == OrderState::Partial && order.partial_since_ts_s.is_none() {
                        order.partial_since_ts_s = Some(now_s);
                    }

                    if order.state == OrderState::Partial
                        && !order.reaped
                        && order
                            .partial_since_ts_s
                            .map(|since| now_s - since >= partial_timeout_s)
                            .unwrap_or(false)
                    {
                        log::warn!(
                            "[ORDERS] {} {} client_id={} partial {}/{} for over {}s — remainder reaped",
                            order.instrument, order.account.label(), order.client_id,
                            order.traded_size, order.original_size, partial_timeout_s
                        );
                        order.reaped = true;
                    }
                }
                None => {
                    // One extra tick of grace before declaring the order gone.
                    order.missing_ticks = order.missing_ticks.saturating_add(1);
                    if order.missing_ticks >= 2 {
                        let final_state = if order.traded_size >= order.original_size - SIZE_EPS {
                            OrderState::Filled
                        } else {
                            OrderState::Cancelled
                        };
                        log::info!(
                            "[ORDERS] {} {} client_id={} no longer on exchange — {:?} (traded {}/{})",
                            order.instrument, order.account.label(), order.client_id,
                            final_state, order.traded_size, order.original_size
                        );
                        order.state = final_state;
                        order.last_updated_ts_s = now_s;
                    }
                }
            }
        }

        deltas
    }

    pub fn mark_rejected(&mut self, client_id: u64) {
        if let Some(o) = self.by_client.get_mut(&client_id) {
            o.state = OrderState::Rejected;
        }
    }

    pub fn mark_cancelled(&mut self, client_id: u64) {
        if let Some(o) = self.by_client.get_mut(&client_id) {
            o.state = OrderState::Cancelled;
        }
    }

    /// Drops terminal orders from the table. Call after their deltas have been
    /// consumed.
    pub fn finalize_terminal(&mut self) -> usize {
        let before = self.by_client.len();
        self.by_client.retain(|_, o| o.state.is_live());
        before - self.by_client.len()
    }
}
