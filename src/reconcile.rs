// ─────────────────────────────────────────────────────────────────────────────
// reconcile.rs — Startup Reconciliation
//
// Before the first decision cycle the engine adopts whatever already exists
// on the exchange:
//
//   - non-zero positions become synthetic lots (guard = entry price) so the
//     matcher can pair them immediately, including against each other
//   - open orders are classified strategy vs. foreign by the reserved
//     client-id range plus metadata consistency; strategy orders join the
//     managed table, foreign orders are only recorded and alerted
//
// Both passes are idempotent: running adoption twice yields the same lot
// queues and order table.
// ─────────────────────────────────────────────────────────────────────────────
use crate::alert::{AlertKind, AlertManager};
use crate::exchange::{Account, OpenOrderView, PositionInfo, Side};
use crate::hedger::SymbolState;
use crate::ledger::FillLot;
use crate::orders::{is_strategy_client_id, ManagedOrder, OrderState};

/// Turns one account's pre-existing position into a synthetic lot. A long
/// position is a buy lot awaiting its hedge sell, and vice versa.
pub fn adopt_positions(
    state: &mut SymbolState,
    account: Account,
    positions: &[PositionInfo],
    now_s: i64,
) {
    let Some(pos) = positions
        .iter()
        .find(|p| p.instrument == state.config.instrument)
    else {
        return;
    };
    if pos.signed_base.abs() <= 1e-12 || pos.entry_price <= 0.0 {
        return;
    }
    let side = if pos.signed_base > 0.0 { Side::Buy } else { Side::Sell };

    // Idempotence: a second adoption pass must not stack another lot.
    if state.lots.has_lots(account, side) {
        log::debug!(
            "[RECONCILE] {} {} already has {} lots — skipping synthetic adoption",
            state.config.instrument, account.label(), side.label()
        );
        return;
    }

    log::info!(
        "[RECONCILE] {} {} adopting position as synthetic {} lot: size={} guard={}",
        state.config.instrument, account.label(), side.label(),
        pos.signed_base.abs(), pos.entry_price
    );
    state.lots.push(FillLot {
        account,
        instrument: state.config.instrument.clone(),
        side,
        size: pos.signed_base.abs(),
        guard_price: pos.entry_price,
        ts_s: now_s,
    });
}

/// Classifies one account's resting orders. Strategy orders are adopted and
/// keep being managed; everything else is foreign — recorded, alerted once
/// per instrument, never cancelled.
pub async fn adopt_orders(
    state: &mut SymbolState,
    account: Account,
    orders: &[OpenOrderView],
    alerts: &mut AlertManager,
    now_s: i64,
) {
    for view in orders {
        if view.instrument != state.config.instrument {
            continue;
        }

        let is_strategy = view
            .client_id
            .map(|cid| is_strategy_client_id(cid) && view.post_only)
            .unwrap_or(false);

        if !is_strategy {
            if state.foreign_orders.insert(view.order_id.clone()) {
                log::warn!(
                    "[RECONCILE] {} {} foreign order {} ({} {} @ {}) — leaving untouched",
                    state.config.instrument, account.label(), view.order_id,
                    view.side.label(), view.size, view.limit_price
                );
                alerts
                    .notify(
                        AlertKind::NonStrategyOrder,
                        &state.config.instrument,
                        format!(
                            "Non-strategy order on {} account {}: {} {} @ {}",
                            state.config.instrument,
                            account.label(),
                            view.side.label(),
                            view.size,
                            view.limit_price
                        ),
                        now_s,
                    )
                    .await;
            }
            continue;
        }

        let client_id = view.client_id.unwrap_or_default();
        if state.orders.contains(client_id) {
            continue;
        }

        let created_ts_s = if view.created_ms > 0 {
            (view.created_ms / 1000) as i64
        } else {
            now_s
        };
        let mut order = ManagedOrder::new_strategy(
            client_id,
            account,
            &view.instrument,
            view.side,
            view.limit_price,
            view.size,
            Some(view.limit_price),
            created_ts_s,
        );
        order.exchange_order_id = Some(view.order_id.clone());
        order.traded_size = view.traded;
        if view.traded > 1e-12 {
            order.state = OrderState::Partial;
            // The venue does not say when the partial happened; the reap
            // clock starts at adoption.
            order.partial_since_ts_s = Some(now_s);
        } else {
            order.state = OrderState::Open;
        }
        log::info!(
            "[RECONCILE] {} {} adopting strategy order client_id={} ({} {} @ {}, traded {})",
            state.config.instrument, account.label(), client_id,
            view.side.label(), view.size, view.limit_price, view.traded
        );
        state.orders.insert(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hedger::{PositionMode, SymbolConfig};
    use crate::orders::STRATEGY_CLIENT_ID_BASE;

    const INST: &str = "BTC_USDT_Perp";

    fn symbol_state() -> SymbolState {
        SymbolState::new(SymbolConfig {
            instrument: INST.to_string(),
            enabled: true,
            order_notional_usdt: 1000.0,
            imbalance_limit_usdt: 2000.0,
            max_total_position_usdt: 0.0,
            min_total_position_usdt: 0.0,
            a_side_when_equal: Side::Buy,
            position_mode: PositionMode::Increase,
        })
    }

    fn alerts() -> AlertManager {
        AlertManager::new(None, "/tmp/reconcile_test_report.csv".to_string())
    }

    fn long_position(size: f64, entry: f64) -> PositionInfo {
        PositionInfo {
            instrument: INST.to_string(),
            signed_base: size,
            entry_price: entry,
            mark_price: entry,
        }
    }

    fn foreign_view(order_id: &str) -> OpenOrderView {
        OpenOrderView {
            order_id: order_id.to_string(),
            client_id: Some(42),
            instrument: INST.to_string(),
            side: Side::Sell,
            limit_price: 1010.0,
            size: 1.0,
            traded: 0.0,
            post_only: false,
            created_ms: 0,
        }
    }

    fn strategy_view(client_id: u64, traded: f64) -> OpenOrderView {
        OpenOrderView {
            order_id: "ex-1".to_string(),
            client_id: Some(client_id),
            instrument: INST.to_string(),
            side: Side::Buy,
            limit_price: 1000.0,
            size: 2.0,
            traded,
            post_only: true,
            created_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_position_becomes_synthetic_lot() {
        let mut st = symbol_state();
        // Long 1500U at entry 1000 => 1.5 base units, buy lot, guard 1000.
        adopt_positions(&mut st, Account::A, &[long_position(1.5, 1000.0)], 500);

        let lot = st.lots.queue(Account::A, Side::Buy).front().unwrap();
        assert!((lot.size - 1.5).abs() < 1e-12);
        assert_eq!(lot.guard_price, 1000.0);
    }

    #[test]
    fn test_position_adoption_is_idempotent() {
        let mut st = symbol_state();
        adopt_positions(&mut st, Account::A, &[long_position(1.5, 1000.0)], 500);
        adopt_positions(&mut st, Account::A, &[long_position(1.5, 1000.0)], 501);
        assert_eq!(st.lots.queue(Account::A, Side::Buy).len(), 1);
    }

    #[test]
    fn test_opposing_synthetic_lots_can_match() {
        let mut st = symbol_state();
        adopt_positions(&mut st, Account::A, &[long_position(1.5, 1000.0)], 500);
        adopt_positions(&mut st, Account::B, &[long_position(-1.5, 1001.0)], 500);

        let events = st.lots.match_lots();
        assert_eq!(events.len(), 1);
        assert!(st.lots.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_order_recorded_alerted_never_adopted() {
        let mut st = symbol_state();
        let mut am = alerts();
        adopt_orders(&mut st, Account::A, &[foreign_view("f-1")], &mut am, 100).await;

        assert!(st.foreign_orders.contains("f-1"));
        assert!(st.orders.is_empty());
        assert_eq!(am.sent_log.len(), 1);

        // Second pass: no duplicate alert, no state change.
        adopt_orders(&mut st, Account::A, &[foreign_view("f-1")], &mut am, 101).await;
        assert_eq!(st.foreign_orders.len(), 1);
        assert_eq!(am.sent_log.len(), 1);
    }

    #[tokio::test]
    async fn test_strategy_order_adopted_with_partial_state() {
        let mut st = symbol_state();
        let mut am = alerts();
        let cid = STRATEGY_CLIENT_ID_BASE + 7;
        adopt_orders(&mut st, Account::B, &[strategy_view(cid, 0.5)], &mut am, 100).await;

        let order = st.orders.get(cid).unwrap();
        assert_eq!(order.state, OrderState::Partial);
        assert_eq!(order.exchange_order_id.as_deref(), Some("ex-1"));
        assert_eq!(order.guard_price, Some(1000.0));
        assert_eq!(order.partial_since_ts_s, Some(100));
        assert!(am.sent_log.is_empty());

        // Idempotent.
        adopt_orders(&mut st, Account::B, &[strategy_view(cid, 0.5)], &mut am, 101).await;
        assert_eq!(st.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_non_post_only_in_range_is_foreign() {
        // Client id in range but metadata inconsistent (not post-only).
        let mut st = symbol_state();
        let mut am = alerts();
        let mut view = strategy_view(STRATEGY_CLIENT_ID_BASE + 8, 0.0);
        view.post_only = false;
        adopt_orders(&mut st, Account::A, &[view], &mut am, 100).await;
        assert!(st.orders.is_empty());
        assert_eq!(st.foreign_orders.len(), 1);
    }
}
